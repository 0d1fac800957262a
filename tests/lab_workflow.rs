use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use ulid::Ulid;

use labslot::config::{Config, Policy};
use labslot::engine::{BookingEnd, BookingFlow, Collaborators, Engine, NewBooking, NewInstrument};
use labslot::identity::{Actor, MemoryDirectory, Role, UserRecord};
use labslot::mailer::{MemoryNotifier, Template};
use labslot::model::{BookingStatus, Event, HOUR_MS, MINUTE_MS, Ms, Progress};
use labslot::notify::NotifyHub;
use labslot::stats::UsageReport;
use labslot::timeutil::parse_iso;

// ── Test infrastructure ──────────────────────────────────────

fn data_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("labslot_int_{name}_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn at(s: &str) -> Ms {
    parse_iso(s).unwrap()
}

struct People {
    admin: Actor,
    kim: Actor,
    raj: Actor,
}

/// Writes `users.json` into the data dir the way an operator would.
fn seed_users(config: &Config) -> People {
    let people = People {
        admin: Actor::new(Ulid::new(), "Facility Manager", Role::Admin),
        kim: Actor::new(Ulid::new(), "Kim", Role::User),
        raj: Actor::new(Ulid::new(), "Raj", Role::User),
    };
    let users: Vec<UserRecord> = [&people.admin, &people.kim, &people.raj]
        .iter()
        .map(|a| UserRecord {
            id: a.id,
            name: a.name.clone(),
            email: format!("{}@lab.example", a.id),
        })
        .collect();
    std::fs::write(config.users_path(), serde_json::to_vec(&users).unwrap()).unwrap();
    people
}

fn open(config: &Config, mailer: Arc<MemoryNotifier>) -> Engine {
    let directory = MemoryDirectory::from_json_file(&config.users_path()).unwrap();
    let collaborators = Collaborators {
        mailer,
        directory: Arc::new(directory),
    };
    Engine::new(config.wal_path(), Arc::new(NotifyHub::new()), collaborators, config.policy).unwrap()
}

fn config_in(dir: PathBuf) -> Config {
    Config {
        data_dir: dir,
        policy: Policy::default(),
        ..Config::default()
    }
}

fn request(instrument_id: Ulid, start: Ms, end: Ms, flow: BookingFlow) -> NewBooking {
    NewBooking {
        instrument_id,
        user_id: None,
        start,
        end: BookingEnd::At(end),
        purpose: "characterisation".into(),
        details: None,
        flow,
    }
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn week_in_the_lab() {
    let config = config_in(data_dir("week"));
    let people = seed_users(&config);
    let mailer = Arc::new(MemoryNotifier::new());
    let engine = open(&config, mailer.clone());

    let xrd = engine
        .create_instrument(
            &people.admin,
            NewInstrument {
                name: "XRD".into(),
                kind: Some("diffractometer".into()),
                model: Some("D8".into()),
                location: "C-12".into(),
                calibration_due: Some("2024-06-01".parse().unwrap()),
            },
        )
        .await
        .unwrap();

    let kim_req = engine
        .create_booking(
            &people.kim,
            request(xrd.id, at("2024-01-08T09:00:00Z"), at("2024-01-08T11:00:00Z"), BookingFlow::Request),
        )
        .await
        .unwrap();
    let raj_quick = engine
        .create_booking(
            &people.raj,
            request(xrd.id, at("2024-01-09T14:00:00Z"), at("2024-01-09T15:30:00Z"), BookingFlow::Quick),
        )
        .await
        .unwrap();
    assert_eq!(raj_quick.status(), BookingStatus::Confirmed);

    engine.approve_booking(&people.admin, kim_req.id).await.unwrap();
    engine.set_progress(&people.kim, kim_req.id, Progress::InProgress).await.unwrap();
    engine.add_comment(&people.admin, kim_req.id, "sample holder B please").await.unwrap();
    engine.set_progress(&people.kim, kim_req.id, Progress::Completed).await.unwrap();

    // the tube failed on Tuesday morning
    let report = engine
        .apply_delay(&people.admin, 60, at("2024-01-09T00:00:00Z"))
        .await
        .unwrap();
    assert_eq!(report.shifted, vec![raj_quick.id]);

    let kim_mail = format!("{}@lab.example", people.kim.id);
    let templates: Vec<String> = mailer
        .sent()
        .into_iter()
        .filter(|n| n.to == kim_mail)
        .map(|n| n.template)
        .collect();
    assert_eq!(
        templates,
        vec![
            "booking_confirmation",
            "booking_confirmed",
            "booking_updated",
            "new_comment",
            "booking_updated",
        ]
    );
    assert_eq!(mailer.sent_with(Template::BookingDelayed).len(), 1);

    let today = "2024-01-10".parse().unwrap();
    let tz = config.policy.timezone;
    let report = UsageReport::compute(&engine.snapshot().await, today, tz);
    assert_eq!(report.total_bookings, 2);
    assert_eq!(report.instruments[0].total_hours, 3.5);
    assert_eq!(report.users[0].name, "Kim");
    assert_eq!(report.users[0].total_hours, 2.0);

    // a restart sees exactly the same lab
    let reopened = open(&config, Arc::new(MemoryNotifier::new()));
    let again = UsageReport::compute(&reopened.snapshot().await, today, tz);
    assert_eq!(again, report);
    let kim_booking = reopened.get_booking(kim_req.id).await.unwrap();
    assert_eq!(kim_booking.status(), BookingStatus::Completed);
    assert_eq!(kim_booking.comments.len(), 1);
}

#[tokio::test]
async fn delay_is_atomic_under_concurrent_bookings() {
    let config = config_in(data_dir("concurrent"));
    let people = seed_users(&config);
    let engine = Arc::new(open(&config, Arc::new(MemoryNotifier::new())));

    let mut instruments = Vec::new();
    for name in ["A", "B", "C"] {
        let inst = engine
            .create_instrument(
                &people.admin,
                NewInstrument {
                    name: name.into(),
                    kind: None,
                    model: None,
                    location: "hall".into(),
                    calibration_due: None,
                },
            )
            .await
            .unwrap();
        instruments.push(inst.id);
    }

    let base = at("2024-03-04T08:00:00Z");
    let cutoff = base + 4 * HOUR_MS;
    let creators = (0..30).map(|i| {
        let engine = engine.clone();
        let actor = if i % 2 == 0 { people.kim.clone() } else { people.raj.clone() };
        let iid = instruments[i % instruments.len()];
        let start = base + (i as Ms) * 30 * MINUTE_MS;
        tokio::spawn(async move {
            engine
                .create_booking(&actor, request(iid, start, start + 45 * MINUTE_MS, BookingFlow::Quick))
                .await
                .unwrap()
        })
    });
    let delayer = {
        let engine = engine.clone();
        let admin = people.admin.clone();
        tokio::spawn(async move { engine.apply_delay(&admin, 20, cutoff).await.unwrap() })
    };

    let created: Vec<_> = join_all(creators)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    let report = delayer.await.unwrap();

    let snapshot = engine.snapshot().await;
    assert_eq!(snapshot.bookings.len(), 30);
    for original in &created {
        let now = snapshot.bookings.iter().find(|b| b.id == original.id).unwrap();
        assert_eq!(now.span.duration_ms(), 45 * MINUTE_MS);
        if report.shifted.contains(&original.id) {
            assert!(original.span.start >= cutoff);
            assert_eq!(now.span, original.span.shifted(20 * MINUTE_MS));
        } else {
            assert_eq!(now.span, original.span);
        }
    }

    let reopened = open(&config, Arc::new(MemoryNotifier::new()));
    assert_eq!(reopened.snapshot().await.bookings, snapshot.bookings);
}

#[tokio::test]
async fn dashboard_feed_gets_one_event_per_delay() {
    let config = config_in(data_dir("feed"));
    let people = seed_users(&config);
    let engine = open(&config, Arc::new(MemoryNotifier::new()));
    let inst = engine
        .create_instrument(
            &people.admin,
            NewInstrument {
                name: "TEM".into(),
                kind: None,
                model: None,
                location: "basement".into(),
                calibration_due: None,
            },
        )
        .await
        .unwrap();
    for h in 0..3 {
        let start = at("2024-02-01T09:00:00Z") + h * HOUR_MS;
        engine
            .create_booking(&people.kim, request(inst.id, start, start + HOUR_MS, BookingFlow::Quick))
            .await
            .unwrap();
    }

    let mut feed = engine.notify.subscribe_all();
    let report = engine
        .apply_delay(&people.admin, 15, at("2024-02-01T00:00:00Z"))
        .await
        .unwrap();
    assert_eq!(report.affected, 3);

    match feed.recv().await.unwrap() {
        Event::BookingsShifted { ids, delta, .. } => {
            assert_eq!(ids, report.shifted);
            assert_eq!(delta, 15 * MINUTE_MS);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(feed.try_recv().is_err());
}
