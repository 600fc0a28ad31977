//! # Ensemble Playback Engine (ensemble-player)
//!
//! Playback engine core of the Ensemble multi-room audio server.
//!
//! **Purpose:** Turn the play queue into a steady stream of timestamped
//! PCM packets delivered synchronously to the local sound card and any
//! selected remote network receivers.
//!
//! **Architecture:** A dedicated player thread owns all playback state
//! and runs a single event loop: command channel, drift-free packet
//! timer, local-sink state events, remote-session status events. The
//! decode path is symphonia + rubato; local output is cpal; the remote
//! receiver wire protocol lives behind the [`raop::RaopBackend`] trait.

pub mod audio;
pub mod db;
pub mod discovery;
pub mod error;
pub mod player;
pub mod raop;
pub mod transcode;

pub use error::{Error, Result};
pub use player::{Player, PlayerConfig, PlayerStatus, SpeakerInfo};
