//! # Ensemble Common Library
//!
//! Shared building blocks for the Ensemble audio server modules: event
//! types and the event bus, sample-accurate timing conversions, root
//! folder resolution, and database bootstrap.

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod timing;

pub use error::{Error, Result};
pub use events::{EventBus, PlayerEvent, PlayerState, RepeatMode};
