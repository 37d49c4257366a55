//! The Hadron batch sequencer & dispatcher.
//!
//! Messages stored by the node are read in strict sequence order, grouped into bounded batches per
//! (dispatcher, namespace, author, group), sealed atomically along with their pins, and handed to
//! pluggable dispatch handlers for anchoring & distribution.

pub mod batch;
pub mod config;
pub mod data;
#[cfg(test)]
mod data_test;
pub mod database;
pub mod error;
#[cfg(test)]
mod fixtures;
pub mod models;
pub mod outbox;
#[cfg(test)]
mod outbox_test;
pub mod plugins;
pub mod shutdown;
pub mod utils;
pub mod watcher;
