//! Bluetooth layer for the sink daemon.
//!
//! This module provides the collaborator traits the session drives, the
//! shared state types, and the BlueZ implementation of both.

pub mod bluez;
pub mod monitor;
pub mod stack;
pub mod types;
