//! Database access for the playback engine
//!
//! Media file lookups feed the source queue; the settings table persists
//! the last commanded volume. All queries run on the player thread except
//! queue construction, which the control frontend drives directly.

pub mod media;
pub mod settings;
