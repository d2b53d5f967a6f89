//! Capabilities the sink session consumes from the Bluetooth stack.
//!
//! Requests are fire-and-forget: implementations queue the work and report
//! completion later as a [`StackEvent`](crate::event::StackEvent) on the
//! event bus they were built with. Queries answer from cached state.

use std::{collections::HashSet, sync::Arc};

use crate::{
   announcer::Announcer,
   bluetooth::types::{AdapterState, ProfileId, ProxyHandle},
   error::Result,
};

pub type ProfileSet = HashSet<ProfileId>;

/// Local radio control.
pub trait AdapterStack: Send + Sync {
   fn is_present(&self) -> bool;

   fn current_state(&self) -> AdapterState;

   /// Completion arrives as an adapter event.
   fn request_enable(&self) -> Result<()>;

   fn set_name(&self, name: &str) -> Result<()>;
}

/// Local profile role selection.
pub trait ProfileStack: Send + Sync {
   fn enabled_profiles(&self) -> Result<ProfileSet>;

   /// Applies both sets as one change.
   fn set_profiles(&self, enable: &[ProfileId], disable: &[ProfileId]) -> Result<()>;
}

/// Profile service binding.
pub trait ProxyService: Send + Sync {
   /// Answered by `ProxyConnected` or `ProxyDisconnected`.
   fn request_proxy(&self, profile: ProfileId) -> Result<()>;

   fn release(&self, handle: ProxyHandle);
}

pub trait DiscoverabilityRequester: Send + Sync {
   /// Answered by `DiscoverableResult`.
   fn request_discoverable(&self, duration_ms: u32) -> Result<()>;
}

/// Event channels a session subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum EventChannel {
   Adapter,
   Connection,
   Playback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

pub trait EventSource: Send + Sync {
   fn subscribe(&self, channel: EventChannel) -> Result<SubscriptionId>;

   /// Unknown ids are an error; callers log and continue.
   fn unsubscribe(&self, id: SubscriptionId) -> Result<()>;
}

/// The full set of collaborators a session drives.
#[derive(Clone)]
pub struct Stack {
   pub adapter: Arc<dyn AdapterStack>,
   pub profiles: Arc<dyn ProfileStack>,
   pub proxy: Arc<dyn ProxyService>,
   pub discovery: Arc<dyn DiscoverabilityRequester>,
   pub events: Arc<dyn EventSource>,
   pub announcer: Arc<dyn Announcer>,
}
