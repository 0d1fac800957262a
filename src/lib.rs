pub mod config;
pub mod duration;
pub mod engine;
pub mod identity;
pub mod limits;
pub mod mailer;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod stats;
pub mod timeutil;
pub mod wal;
