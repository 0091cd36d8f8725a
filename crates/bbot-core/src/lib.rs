//! Core of the bbot service: persistent store, dispatcher and the run loop.
//!
//! This crate is framework-agnostic. Concrete event sources (stdio today, chat
//! platforms later) live behind the `EventSource` port in adapter crates.

pub mod answer;
pub mod bot;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod errors;
pub mod handlers;
pub mod logging;
pub mod ports;
pub mod sequencer;
pub mod source;
pub mod store;

pub use errors::{Error, Result};
