//! In-memory stack used by unit tests.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::{
   announcer::Announcer,
   bluetooth::{
      stack::{
         AdapterStack, DiscoverabilityRequester, EventChannel, EventSource, ProfileSet,
         ProfileStack, ProxyService, Stack, SubscriptionId,
      },
      types::{AdapterState, ProfileId, ProxyHandle},
   },
   error::{Result, SinkError},
};

#[derive(Debug, Default)]
pub struct FakeState {
   pub present: bool,
   pub adapter_state: AdapterState,
   pub enable_requests: u32,
   pub names: Vec<String>,
   pub rename_fails: bool,
   pub profiles: ProfileSet,
   pub profile_changes: Vec<(Vec<ProfileId>, Vec<ProfileId>)>,
   pub profiles_fail: bool,
   pub proxy_requests: Vec<ProfileId>,
   pub released: Vec<ProxyHandle>,
   pub discoverable_requests: Vec<u32>,
   pub discoverable_fails: bool,
   pub subscriptions: Vec<(EventChannel, SubscriptionId)>,
   pub fail_subscription: Option<EventChannel>,
   /// Powers the adapter on while the adapter channel is being subscribed.
   pub power_on_at_subscribe: bool,
   pub next_subscription: u64,
   pub unsubscribes: u32,
   pub spoken: Vec<String>,
   pub stops: u32,
   pub shutdowns: u32,
}

/// Records every call and answers from [`FakeState`]. Completions are not
/// emitted; tests feed them to the session by hand.
pub struct FakeStack {
   state: Mutex<FakeState>,
}

impl FakeStack {
   pub fn new(present: bool, adapter_state: AdapterState) -> Arc<Self> {
      Arc::new(Self {
         state: Mutex::new(FakeState {
            present,
            adapter_state,
            ..FakeState::default()
         }),
      })
   }

   pub fn state(&self) -> MutexGuard<'_, FakeState> {
      self.state.lock()
   }

   pub fn stack(self: &Arc<Self>) -> Stack {
      Stack {
         adapter: self.clone(),
         profiles: self.clone(),
         proxy: self.clone(),
         discovery: self.clone(),
         events: self.clone(),
         announcer: self.clone(),
      }
   }
}

impl AdapterStack for FakeStack {
   fn is_present(&self) -> bool {
      self.state().present
   }

   fn current_state(&self) -> AdapterState {
      self.state().adapter_state
   }

   fn request_enable(&self) -> Result<()> {
      self.state().enable_requests += 1;
      Ok(())
   }

   fn set_name(&self, name: &str) -> Result<()> {
      let mut state = self.state();
      if state.rename_fails {
         return Err(SinkError::PreconditionFailed("rename refused"));
      }
      state.names.push(name.to_string());
      Ok(())
   }
}

impl ProfileStack for FakeStack {
   fn enabled_profiles(&self) -> Result<ProfileSet> {
      Ok(self.state().profiles.clone())
   }

   fn set_profiles(&self, enable: &[ProfileId], disable: &[ProfileId]) -> Result<()> {
      let mut state = self.state();
      if state.profiles_fail {
         return Err(SinkError::StackShutdown);
      }
      state.profile_changes.push((enable.to_vec(), disable.to_vec()));
      state.profiles.extend(enable.iter().copied());
      for profile in disable {
         state.profiles.remove(profile);
      }
      Ok(())
   }
}

impl ProxyService for FakeStack {
   fn request_proxy(&self, profile: ProfileId) -> Result<()> {
      self.state().proxy_requests.push(profile);
      Ok(())
   }

   fn release(&self, handle: ProxyHandle) {
      self.state().released.push(handle);
   }
}

impl DiscoverabilityRequester for FakeStack {
   fn request_discoverable(&self, duration_ms: u32) -> Result<()> {
      let mut state = self.state();
      if state.discoverable_fails {
         return Err(SinkError::StackShutdown);
      }
      state.discoverable_requests.push(duration_ms);
      Ok(())
   }
}

impl EventSource for FakeStack {
   fn subscribe(&self, channel: EventChannel) -> Result<SubscriptionId> {
      let mut state = self.state();
      if state.fail_subscription == Some(channel) {
         return Err(SinkError::StackShutdown);
      }
      if channel == EventChannel::Adapter && state.power_on_at_subscribe {
         state.adapter_state = AdapterState::On;
      }
      state.next_subscription += 1;
      let id = SubscriptionId(state.next_subscription);
      state.subscriptions.push((channel, id));
      Ok(id)
   }

   fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
      let mut state = self.state();
      let before = state.subscriptions.len();
      state.subscriptions.retain(|(_, s)| *s != id);
      if state.subscriptions.len() == before {
         return Err(SinkError::UnknownSubscription(id.0));
      }
      state.unsubscribes += 1;
      Ok(())
   }
}

impl Announcer for FakeStack {
   fn speak(&self, text: &str) {
      self.state().spoken.push(text.to_string());
   }

   fn stop(&self) {
      self.state().stops += 1;
   }

   fn shutdown(&self) {
      self.state().shutdowns += 1;
   }
}
