//! onair - watches a broadcaster's Kick and VK Video Live channels and
//! announces sessions to a Telegram group.
//!
//! This library crate exposes internal modules for integration testing.

pub mod config;
pub mod data;
pub mod engine;
pub mod integrations;
pub mod notify;
pub mod runtime;
pub mod state;
