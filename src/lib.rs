pub mod aggregate;
pub mod bins;
pub mod config;
pub mod constants;
pub mod db;
pub mod error;
pub mod import;
pub mod logging;
pub mod metrics;
pub mod reconcile;
pub mod server;
pub mod storage;
pub mod totals;
pub mod types;

pub use db::{Database, WriteScope};
pub use error::{LedgerError, Result};
