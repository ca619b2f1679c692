//! `bank-server` — binary wiring for the ledger and its background worker.

pub mod app;
pub mod config;

pub use app::App;
pub use config::{Config, ConfigError};
