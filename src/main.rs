use std::sync::Arc;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use ulid::Ulid;

use labslot::config::Config;
use labslot::engine::{
    BookingEnd, BookingFlow, BookingUpdate, Collaborators, Engine, InstrumentUpdate, NewBooking,
    NewInstrument,
};
use labslot::duration::SampleMetadata;
use labslot::identity::{Actor, FileSessionStore, MemoryDirectory, Role, SessionStore};
use labslot::mailer::LogNotifier;
use labslot::model::{BookingStatus, InstrumentStatus, Ms, Progress};
use labslot::notify::NotifyHub;
use labslot::stats::UsageReport;
use labslot::timeutil::{format_iso, format_range, local_date, now_ms, parse_iso};
use labslot::{observability, reaper};

/// Lab instrument booking: administration and reports over a data directory.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Overrides LABSLOT_DATA_DIR.
    #[arg(short, long)]
    data_dir: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Who is acting.
    #[command(subcommand)]
    Session(SessionCommand),
    #[command(subcommand)]
    Instruments(InstrumentCommand),
    #[command(subcommand)]
    Bookings(BookingCommand),
    /// Booked and free windows of an instrument on a local day.
    Day { instrument: Ulid, date: NaiveDate },
    /// Usage report as JSON.
    Stats {
        /// Last day of the trailing week; defaults to today.
        #[arg(long)]
        today: Option<NaiveDate>,
    },
    /// Push every booking starting at or after the cutoff back.
    Delay {
        #[arg(long)]
        minutes: i64,
        #[arg(long, value_parser = parse_time)]
        cutoff: Ms,
    },
    /// Rewrite the WAL down to the current state.
    Compact,
    /// Keep running background maintenance until interrupted.
    Run,
}

#[derive(Subcommand, Debug)]
enum SessionCommand {
    Login {
        #[arg(long)]
        id: Ulid,
        #[arg(long)]
        name: String,
        #[arg(long)]
        admin: bool,
    },
    Show,
    Logout,
}

#[derive(Subcommand, Debug)]
enum InstrumentCommand {
    List,
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        location: String,
        #[arg(long)]
        kind: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        calibration_due: Option<NaiveDate>,
    },
    Status { id: Ulid, status: InstrumentStatus },
    Maintenance { id: Ulid, date: NaiveDate, description: String },
    Rename { id: Ulid, name: String },
    Delete { id: Ulid },
}

#[derive(Subcommand, Debug)]
enum BookingCommand {
    List {
        #[arg(long)]
        user: Option<Ulid>,
        #[arg(long)]
        instrument: Option<Ulid>,
    },
    Create {
        #[arg(long)]
        instrument: Ulid,
        #[arg(long, value_parser = parse_time)]
        start: Ms,
        #[arg(long, value_parser = parse_time, conflicts_with = "hours")]
        end: Option<Ms>,
        #[arg(long)]
        hours: Option<f64>,
        #[arg(long, requires = "minutes_per_sample")]
        samples: Option<String>,
        #[arg(long)]
        minutes_per_sample: Option<String>,
        #[arg(long)]
        purpose: String,
        #[arg(long)]
        details: Option<String>,
        /// Confirm immediately instead of requesting approval.
        #[arg(long)]
        quick: bool,
    },
    /// Move or resize; with --hours the sample fields stored on the booking
    /// are used again unless new ones are given.
    Edit {
        id: Ulid,
        #[arg(long, value_parser = parse_time)]
        start: Option<Ms>,
        #[arg(long, value_parser = parse_time, conflicts_with = "hours")]
        end: Option<Ms>,
        #[arg(long)]
        hours: Option<f64>,
        #[arg(long, requires = "minutes_per_sample", requires = "hours")]
        samples: Option<String>,
        #[arg(long)]
        minutes_per_sample: Option<String>,
        #[arg(long)]
        purpose: Option<String>,
        #[arg(long)]
        status: Option<BookingStatus>,
        /// Version the edit is based on (strict concurrency).
        #[arg(long)]
        expected_version: Option<u64>,
    },
    Approve { id: Ulid },
    Deny { id: Ulid },
    Cancel { id: Ulid },
    Progress { id: Ulid, status: BookingStatus },
    Comment { id: Ulid, text: String },
    Comments { id: Ulid },
    Delete { id: Ulid },
}

fn parse_time(s: &str) -> Result<Ms, String> {
    parse_iso(s).ok_or_else(|| format!("not an RFC 3339 timestamp: {s}"))
}

fn print_json(value: &impl Serialize) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn require_session(store: &impl SessionStore) -> Result<Actor, Box<dyn std::error::Error>> {
    store
        .load()?
        .ok_or_else(|| "not logged in; run `session login` first".into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    observability::init_tracing();
    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    std::fs::create_dir_all(&config.data_dir)?;
    let sessions = FileSessionStore::new(config.session_path());

    if let Command::Session(cmd) = &cli.command {
        match cmd {
            SessionCommand::Login { id, name, admin } => {
                let role = if *admin { Role::Admin } else { Role::User };
                let actor = Actor::new(*id, name.clone(), role);
                sessions.save(Some(&actor))?;
                print_json(&actor)?;
            }
            SessionCommand::Show => match sessions.load()? {
                Some(actor) => print_json(&actor)?,
                None => println!("not logged in"),
            },
            SessionCommand::Logout => sessions.save(None)?,
        }
        return Ok(());
    }

    let collaborators = Collaborators {
        mailer: Arc::new(LogNotifier),
        directory: Arc::new(MemoryDirectory::from_json_file(&config.users_path())?),
    };
    let engine = Arc::new(Engine::new(
        config.wal_path(),
        Arc::new(NotifyHub::new()),
        collaborators,
        config.policy,
    )?);
    let tz = config.policy.timezone;

    match cli.command {
        Command::Session(_) => {}
        Command::Instruments(cmd) => match cmd {
            InstrumentCommand::List => print_json(&engine.list_instruments().await)?,
            InstrumentCommand::Add {
                name,
                location,
                kind,
                model,
                calibration_due,
            } => {
                let actor = require_session(&sessions)?;
                let req = NewInstrument {
                    name,
                    kind,
                    model,
                    location,
                    calibration_due,
                };
                print_json(&engine.create_instrument(&actor, req).await?)?;
            }
            InstrumentCommand::Status { id, status } => {
                let actor = require_session(&sessions)?;
                print_json(&engine.set_instrument_status(&actor, id, status).await?)?;
            }
            InstrumentCommand::Maintenance {
                id,
                date,
                description,
            } => {
                let actor = require_session(&sessions)?;
                print_json(&engine.log_maintenance(&actor, id, date, &description).await?)?;
            }
            InstrumentCommand::Rename { id, name } => {
                let actor = require_session(&sessions)?;
                let update = InstrumentUpdate {
                    name: Some(name),
                    ..Default::default()
                };
                print_json(&engine.update_instrument(&actor, id, update).await?)?;
            }
            InstrumentCommand::Delete { id } => {
                let actor = require_session(&sessions)?;
                engine.delete_instrument(&actor, id).await?;
            }
        },
        Command::Bookings(cmd) => run_booking_command(&engine, &sessions, cmd).await?,
        Command::Day { instrument, date } => {
            let booked = engine.booked_intervals(instrument, date).await?;
            let free = engine.free_windows(instrument, date).await?;
            for span in &booked {
                println!("booked  {}", format_range(span, tz));
            }
            for span in &free {
                println!("free    {}", format_range(span, tz));
            }
        }
        Command::Stats { today } => {
            let today = match today.or_else(|| local_date(now_ms(), tz)) {
                Some(day) => day,
                None => return Err("cannot determine today's date".into()),
            };
            let snapshot = engine.snapshot().await;
            print_json(&UsageReport::compute(&snapshot, today, tz))?;
        }
        Command::Delay { minutes, cutoff } => {
            let actor = require_session(&sessions)?;
            let report = engine.apply_delay(&actor, minutes, cutoff).await?;
            println!(
                "delayed {} booking(s) starting at or after {} by {minutes} min",
                report.affected,
                format_iso(cutoff)
            );
        }
        Command::Compact => {
            engine.compact_wal().await?;
            println!("compacted {}", config.wal_path().display());
        }
        Command::Run => {
            tokio::spawn(reaper::run_compactor(engine.clone(), config.compact_threshold));
            if config.auto_complete {
                tokio::spawn(reaper::run_completion_sweeper(engine.clone()));
            }
            observability::init(config.metrics_port)?;
            info!(
                data_dir = %config.data_dir.display(),
                auto_complete = config.auto_complete,
                "labslot running"
            );
            tokio::signal::ctrl_c().await?;
            info!("labslot stopped");
        }
    }
    Ok(())
}

async fn run_booking_command(
    engine: &Engine,
    sessions: &FileSessionStore,
    cmd: BookingCommand,
) -> Result<(), Box<dyn std::error::Error>> {
    match cmd {
        BookingCommand::List { user, instrument } => {
            let bookings = match (user, instrument) {
                (_, Some(iid)) => engine
                    .bookings_for_instrument(iid)
                    .await?
                    .into_iter()
                    .filter(|b| user.is_none_or(|u| b.user_id == u))
                    .collect(),
                (Some(uid), None) => engine.bookings_for_user(uid).await,
                (None, None) => engine.list_bookings().await,
            };
            print_json(&bookings)?;
        }
        BookingCommand::Create {
            instrument,
            start,
            end,
            hours,
            samples,
            minutes_per_sample,
            purpose,
            details,
            quick,
        } => {
            let actor = require_session(sessions)?;
            let end = match (end, hours) {
                (Some(end), _) => BookingEnd::At(end),
                (None, Some(hours)) => BookingEnd::Duration {
                    manual_hours: hours,
                    samples: samples
                        .zip(minutes_per_sample)
                        .and_then(|(n, m)| SampleMetadata::from_fields(&n, &m)),
                    setup: None,
                },
                (None, None) => return Err("either --end or --hours is required".into()),
            };
            let req = NewBooking {
                instrument_id: instrument,
                user_id: None,
                start,
                end,
                purpose,
                details,
                flow: if quick { BookingFlow::Quick } else { BookingFlow::Request },
            };
            print_json(&engine.create_booking(&actor, req).await?)?;
        }
        BookingCommand::Edit {
            id,
            start,
            end,
            hours,
            samples,
            minutes_per_sample,
            purpose,
            status,
            expected_version,
        } => {
            let actor = require_session(sessions)?;
            let length = hours.map(|manual_hours| BookingEnd::Duration {
                manual_hours,
                samples: samples
                    .zip(minutes_per_sample)
                    .and_then(|(n, m)| SampleMetadata::from_fields(&n, &m)),
                setup: None,
            });
            let update = BookingUpdate {
                expected_version,
                status,
                start,
                end,
                length,
                purpose,
                ..Default::default()
            };
            print_json(&engine.update_booking(&actor, id, update).await?)?;
        }
        BookingCommand::Approve { id } => {
            let actor = require_session(sessions)?;
            print_json(&engine.approve_booking(&actor, id).await?)?;
        }
        BookingCommand::Deny { id } => {
            let actor = require_session(sessions)?;
            print_json(&engine.deny_booking(&actor, id).await?)?;
        }
        BookingCommand::Cancel { id } => {
            let actor = require_session(sessions)?;
            print_json(&engine.cancel_booking(&actor, id).await?)?;
        }
        BookingCommand::Progress { id, status } => {
            let actor = require_session(sessions)?;
            let progress = match status {
                BookingStatus::NotStarted => Progress::NotStarted,
                BookingStatus::InProgress => Progress::InProgress,
                BookingStatus::Completed => Progress::Completed,
                BookingStatus::Delayed => Progress::Delayed,
                other => return Err(format!("{other} is not a progress state").into()),
            };
            print_json(&engine.set_progress(&actor, id, progress).await?)?;
        }
        BookingCommand::Comment { id, text } => {
            let actor = require_session(sessions)?;
            print_json(&engine.add_comment(&actor, id, &text).await?)?;
        }
        BookingCommand::Comments { id } => print_json(&engine.get_comments(id).await?)?,
        BookingCommand::Delete { id } => {
            let actor = require_session(sessions)?;
            engine.delete_booking(&actor, id).await?;
        }
    }
    Ok(())
}
