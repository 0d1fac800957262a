use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

/// Message kinds the engine sends to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Template {
    /// Sent to the requester right after a booking is created.
    BookingConfirmation,
    BookingConfirmed,
    BookingCancelled,
    BookingUpdated,
    BookingDelayed,
    NewComment,
}

impl Template {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::BookingConfirmation => "booking_confirmation",
            Self::BookingConfirmed => "booking_confirmed",
            Self::BookingCancelled => "booking_cancelled",
            Self::BookingUpdated => "booking_updated",
            Self::BookingDelayed => "booking_delayed",
            Self::NewComment => "new_comment",
        }
    }
}

pub type Variables = BTreeMap<String, String>;

/// Outbound notification channel (e-mail in production).
///
/// Implementations report delivery failure as `false` and never panic or
/// error; the engine only logs a failed delivery.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, to: &str, template: &str, variables: &Variables) -> bool;
}

/// Writes every notification to the log and reports success.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, to: &str, template: &str, variables: &Variables) -> bool {
        tracing::info!(to, template, ?variables, "notification");
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotice {
    pub to: String,
    pub template: String,
    pub variables: Variables,
}

/// Keeps delivered notices in memory. Can be switched to failing mode.
#[derive(Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<SentNotice>>,
    failing: AtomicBool,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentNotice> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn sent_with(&self, template: Template) -> Vec<SentNotice> {
        self.sent()
            .into_iter()
            .filter(|n| n.template == template.as_str())
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.clear();
        }
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, to: &str, template: &str, variables: &Variables) -> bool {
        if self.failing.load(Ordering::SeqCst) {
            return false;
        }
        match self.sent.lock() {
            Ok(mut sent) => {
                sent.push(SentNotice {
                    to: to.to_string(),
                    template: template.to_string(),
                    variables: variables.clone(),
                });
                true
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_notifier_records_and_fails() {
        let n = MemoryNotifier::new();
        let vars = Variables::from([("booking_id".to_string(), "b1".to_string())]);
        assert!(n.notify("a@lab", Template::BookingUpdated.as_str(), &vars).await);
        n.set_failing(true);
        assert!(!n.notify("a@lab", Template::BookingUpdated.as_str(), &vars).await);

        let sent = n.sent_with(Template::BookingUpdated);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "a@lab");
        assert_eq!(sent[0].variables["booking_id"], "b1");
    }
}
