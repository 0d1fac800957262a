use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    User,
}

/// Whoever is performing an operation. Passed into every engine call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: Ulid,
    pub name: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: Ulid, name: impl Into<String>, role: Role) -> Self {
        Self {
            id,
            name: name.into(),
            role,
        }
    }

    /// Background tasks act as this admin.
    pub fn system() -> Self {
        Self::new(Ulid::nil(), "system", Role::Admin)
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Lookup of user display names and mail addresses.
pub trait Directory: Send + Sync {
    fn resolve_user_name(&self, id: Ulid) -> Option<String>;
    fn resolve_user_email(&self, id: Ulid) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: Ulid,
    pub name: String,
    pub email: String,
}

#[derive(Default)]
pub struct MemoryDirectory {
    users: DashMap<Ulid, UserRecord>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user: UserRecord) {
        self.users.insert(user.id, user);
    }

    /// Load a JSON array of users. A missing file yields an empty directory.
    pub fn from_json_file(path: &Path) -> io::Result<Self> {
        let dir = Self::new();
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(dir),
            Err(e) => return Err(e),
        };
        let users: Vec<UserRecord> = serde_json::from_slice(&raw)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        for user in users {
            dir.insert(user);
        }
        Ok(dir)
    }
}

impl Directory for MemoryDirectory {
    fn resolve_user_name(&self, id: Ulid) -> Option<String> {
        self.users.get(&id).map(|u| u.name.clone())
    }

    fn resolve_user_email(&self, id: Ulid) -> Option<String> {
        self.users.get(&id).map(|u| u.email.clone())
    }
}

/// Persisted "who is logged in" state with an explicit load/save lifecycle.
pub trait SessionStore {
    fn load(&self) -> io::Result<Option<Actor>>;
    /// `None` clears the session.
    fn save(&self, actor: Option<&Actor>) -> io::Result<()>;
}

pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> io::Result<Option<Actor>> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn save(&self, actor: Option<&Actor>) -> io::Result<()> {
        let Some(actor) = actor else {
            return match fs::remove_file(&self.path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            };
        };
        let json = serde_json::to_vec_pretty(actor)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("labslot_test_identity");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    #[test]
    fn session_save_load_clear() {
        let store = FileSessionStore::new(tmp_path("session.json"));
        assert_eq!(store.load().unwrap(), None);

        let actor = Actor::new(Ulid::new(), "Grace", Role::Admin);
        store.save(Some(&actor)).unwrap();
        assert_eq!(store.load().unwrap(), Some(actor));

        store.save(None).unwrap();
        assert_eq!(store.load().unwrap(), None);
        // clearing twice is fine
        store.save(None).unwrap();
    }

    #[test]
    fn directory_from_json() {
        let path = tmp_path("users.json");
        let id = Ulid::new();
        let users = vec![UserRecord {
            id,
            name: "Lin".into(),
            email: "lin@lab.example".into(),
        }];
        fs::write(&path, serde_json::to_vec(&users).unwrap()).unwrap();

        let dir = MemoryDirectory::from_json_file(&path).unwrap();
        assert_eq!(dir.resolve_user_name(id).as_deref(), Some("Lin"));
        assert_eq!(dir.resolve_user_email(id).as_deref(), Some("lin@lab.example"));
        assert_eq!(dir.resolve_user_email(Ulid::new()), None);
    }

    #[test]
    fn missing_directory_file_is_empty() {
        let dir = MemoryDirectory::from_json_file(&tmp_path("absent.json")).unwrap();
        assert_eq!(dir.resolve_user_name(Ulid::new()), None);
    }
}
