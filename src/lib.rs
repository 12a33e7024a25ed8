use std::sync::Once;
use env_logger::Env;

pub mod buffer;
pub mod completion;
pub mod config;
pub mod control;
pub mod error;
pub mod pair;
pub mod pattern;
pub mod provider;
pub mod rendezvous;
pub mod runner;
pub mod series;
pub mod session;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{ErrorClass, FabtestError, Result};

static INIT: Once = Once::new();
pub fn initialize_logger() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(Env::default().default_filter_or("info"))
            .format_timestamp_micros()
            .init();
    });
}

/// Host name used to prefix log lines at test boundaries.
pub fn get_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}
