//! BuildNet - distributed build orchestration
//!
//! A controller splits build requests into micro-bundles and publishes
//! them to a shared state backend; workers race for them with an atomic
//! create-if-absent claim, run the configured bundler and write results
//! back. Every resource movement is recorded in a hash-chained ledger.
//!
//! ## Components
//!
//! - **State**: pluggable key/value + pub/sub backend (memory, file, NATS, MongoDB)
//! - **Ledger**: double-entry, checksum-chained audit log
//! - **Watcher**: debounced filesystem changes with impact classification
//! - **Bundler**: adapter registry over vite/esbuild/rspack/webpack/shell
//! - **Scheduler**: decomposition, dispatch, retries, node health
//! - **Worker**: slots, claims, heartbeats and gossip
//! - **API**: HTTP control surface and event stream

pub mod api;
pub mod bundler;
pub mod config;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod model;
pub mod scheduler;
pub mod state;
pub mod watcher;
pub mod worker;

pub use config::Config;
pub use error::{BuildNetError, Result};
