//! Host tracking for GameLink: keeps one [`ComputerDetails`] record per known
//! streaming host alive across reachability transitions.
//!
//! [`ComputerManager`] coalesces mDNS-discovered and manually-added hosts
//! into a single tracked set, polls each on a background task, merges poll
//! results through the one reconciliation path
//! ([`ComputerDetails::update`]), and persists identity + trust material in
//! a small SQLite store with a migration chain for three legacy formats.
//!
//! [`ComputerDetails`]: gamelink_core::ComputerDetails
//! [`ComputerDetails::update`]: gamelink_core::ComputerDetails::update

mod legacy;
mod manager;
mod store;

pub use manager::{ComputerManager, ManagerEvent, POLLING_PERIOD};
pub use store::{ComputerStore, COMPUTER_DB_NAME};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("database is shutting down")]
    DatabaseClosed,

    #[error("unknown host: {uuid}")]
    HostNotFound { uuid: String },

    #[error("host is offline: {uuid}")]
    HostOffline { uuid: String },

    #[error(transparent)]
    Http(#[from] gamelink_http::HttpError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
