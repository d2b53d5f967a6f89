//! Error types for the sink daemon.
//!
//! This module defines the errors raised while bringing up the sink session
//! and by the collaborators it drives (BlueZ, D-Bus, configuration).

use thiserror::Error;

use crate::sink::machine::SessionPhase;

/// Main error type for the sink daemon.
#[derive(Error, Debug)]
pub enum SinkError {
   #[error("No Bluetooth adapter present")]
   NoAdapter,

   #[error("Precondition failed: {0}")]
   PreconditionFailed(&'static str),

   #[error("Proxy request already pending")]
   AlreadyPending,

   #[error("Profile proxy disconnected")]
   Disconnected,

   #[error("Discoverable request cancelled")]
   Cancelled,

   #[error("Session not ready (phase {0})")]
   NotReady(SessionPhase),

   #[error("Bluetooth stack has shut down")]
   StackShutdown,

   #[error("Unknown subscription: {0}")]
   UnknownSubscription(u64),

   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

/// Convenience type alias for Results with `SinkError`.
pub type Result<T> = std::result::Result<T, SinkError>;
