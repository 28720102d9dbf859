//! rowpulse watches tables in SQLite databases and notifies subscribers when
//! new rows appear.
//!
//! Two detection strategies are supported. *Cursor* alerts poll on a
//! schedule for rows whose ordering column passed a stored watermark.
//! *Trigger* alerts install an `AFTER INSERT` trigger that feeds a durable
//! queue table, drained with leases and retries.

pub mod admin;
pub mod alerts;
pub mod cli;
pub mod config;
pub mod db;
pub mod detector;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod frequency;
pub mod notify;
pub mod queue;
pub mod scheduler;
pub mod sources;
pub mod utils;

#[cfg(test)]
mod test_support;
