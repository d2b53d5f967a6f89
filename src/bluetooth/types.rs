//! Bluetooth state and identity types shared by the stack and the session.

use std::fmt;

use bluer::Address;
use smol_str::SmolStr;
use uuid::Uuid;

/// Power state of the local adapter, as reported by the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
pub enum AdapterState {
   #[default]
   Off,
   TurningOn,
   On,
   TurningOff,
}

impl AdapterState {
   pub const fn from_powered(powered: bool) -> Self {
      if powered { Self::On } else { Self::Off }
   }
}

/// Per-device profile state.
///
/// Connection events use the first four values; playback events use the
/// `Playing`/`NotPlaying` pair so both kinds share one type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ProfileState {
   Disconnected,
   Connecting,
   Connected,
   Disconnecting,
   Playing,
   NotPlaying,
}

impl ProfileState {
   pub const fn from_connected(connected: bool) -> Self {
      if connected {
         Self::Connected
      } else {
         Self::Disconnected
      }
   }

   /// Maps a `MediaTransport1.State` value. `pending` carries no playback
   /// change and yields `None`.
   pub fn from_transport_state(state: &str) -> Option<Self> {
      match state {
         "active" => Some(Self::Playing),
         "idle" => Some(Self::NotPlaying),
         _ => None,
      }
   }
}

/// Bluetooth profiles the daemon switches between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, strum::Display, strum::EnumIter)]
#[strum(serialize_all = "kebab-case")]
pub enum ProfileId {
   A2dpSource,
   A2dpSink,
   AvrcpController,
   AvrcpTarget,
}

impl ProfileId {
   /// Service class UUID advertised by a local adapter running this role.
   pub const fn uuid(self) -> Uuid {
      match self {
         Self::A2dpSource => Uuid::from_u128(0x0000110a_0000_1000_8000_00805f9b34fb),
         Self::A2dpSink => Uuid::from_u128(0x0000110b_0000_1000_8000_00805f9b34fb),
         Self::AvrcpTarget => Uuid::from_u128(0x0000110c_0000_1000_8000_00805f9b34fb),
         Self::AvrcpController => Uuid::from_u128(0x0000110f_0000_1000_8000_00805f9b34fb),
      }
   }

   pub fn from_uuid(uuid: &Uuid) -> Option<Self> {
      <Self as strum::IntoEnumIterator>::iter().find(|p| p.uuid() == *uuid)
   }
}

/// A remote device referenced by a profile event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
   pub address: Address,
   pub name: Option<SmolStr>,
}

impl Device {
   pub const fn new(address: Address, name: Option<SmolStr>) -> Self {
      Self { address, name }
   }
}

impl fmt::Display for Device {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match &self.name {
         Some(name) => write!(f, "{name} ({})", self.address),
         None => write!(f, "{}", self.address),
      }
   }
}

/// Live handle to a local profile service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHandle {
   pub profile: ProfileId,
   pub id: u64,
}

/// Outcome of a discoverable request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoverableResult {
   Cancelled,
   Granted(u32),
}
