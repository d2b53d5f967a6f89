//! Ownership of the A2DP sink profile proxy.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::{
   bluetooth::{
      stack::ProxyService,
      types::{ProfileId, ProxyHandle},
   },
   error::{Result, SinkError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
   Requested,
   AlreadyHeld,
}

/// Holds at most one proxy and allows one outstanding request.
pub struct ProxyManager {
   service: Arc<dyn ProxyService>,
   profile: ProfileId,
   held: Option<ProxyHandle>,
   pending: bool,
}

impl ProxyManager {
   pub fn new(service: Arc<dyn ProxyService>, profile: ProfileId) -> Self {
      Self {
         service,
         profile,
         held: None,
         pending: false,
      }
   }

   #[cfg(test)]
   pub const fn held(&self) -> Option<ProxyHandle> {
      self.held
   }

   #[cfg(test)]
   pub const fn is_pending(&self) -> bool {
      self.pending
   }

   pub fn acquire(&mut self) -> Result<Acquire> {
      if self.held.is_some() {
         return Ok(Acquire::AlreadyHeld);
      }
      if self.pending {
         return Err(SinkError::AlreadyPending);
      }
      self.service.request_proxy(self.profile)?;
      self.pending = true;
      debug!("Requested {} proxy", self.profile);
      Ok(Acquire::Requested)
   }

   /// Stores the handle if it answers the outstanding request; anything
   /// else is released straight back to the service.
   pub fn on_connected(&mut self, handle: ProxyHandle) -> bool {
      if !self.pending || handle.profile != self.profile {
         warn!("Unsolicited {} proxy {}, releasing", handle.profile, handle.id);
         self.service.release(handle);
         return false;
      }
      self.pending = false;
      self.held = Some(handle);
      info!("{} proxy connected", handle.profile);
      true
   }

   /// Returns whether the notice concerned a held or requested proxy.
   pub fn on_disconnected(&mut self) -> bool {
      let relevant = self.held.take().is_some() || self.pending;
      self.pending = false;
      relevant
   }

   /// Releases the held proxy and forgets any outstanding request.
   pub fn release(&mut self) {
      self.pending = false;
      if let Some(handle) = self.held.take() {
         debug!("Releasing {} proxy {}", handle.profile, handle.id);
         self.service.release(handle);
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::testing::FakeStack;

   fn sink_handle(id: u64) -> ProxyHandle {
      ProxyHandle {
         profile: ProfileId::A2dpSink,
         id,
      }
   }

   #[test]
   fn test_second_acquire_while_pending_is_rejected() {
      let fake = FakeStack::new(true, Default::default());
      let mut proxy = ProxyManager::new(fake.clone(), ProfileId::A2dpSink);

      assert_eq!(proxy.acquire().unwrap(), Acquire::Requested);
      assert!(matches!(proxy.acquire(), Err(SinkError::AlreadyPending)));
      assert!(proxy.is_pending());
      assert_eq!(fake.state().proxy_requests, [ProfileId::A2dpSink]);

      assert!(proxy.on_connected(sink_handle(1)));
      assert_eq!(proxy.held(), Some(sink_handle(1)));
      assert_eq!(proxy.acquire().unwrap(), Acquire::AlreadyHeld);
      assert_eq!(fake.state().proxy_requests.len(), 1);
   }

   #[test]
   fn test_unsolicited_proxy_is_released() {
      let fake = FakeStack::new(true, Default::default());
      let mut proxy = ProxyManager::new(fake.clone(), ProfileId::A2dpSink);

      assert!(!proxy.on_connected(sink_handle(7)));
      assert_eq!(proxy.held(), None);
      assert_eq!(fake.state().released, [sink_handle(7)]);
   }

   #[test]
   fn test_release_is_idempotent() {
      let fake = FakeStack::new(true, Default::default());
      let mut proxy = ProxyManager::new(fake.clone(), ProfileId::A2dpSink);

      proxy.release();
      proxy.acquire().unwrap();
      proxy.on_connected(sink_handle(1));
      proxy.release();
      proxy.release();
      assert_eq!(fake.state().released, [sink_handle(1)]);
   }

   #[test]
   fn test_disconnect_notice() {
      let fake = FakeStack::new(true, Default::default());
      let mut proxy = ProxyManager::new(fake, ProfileId::A2dpSink);

      assert!(!proxy.on_disconnected());
      proxy.acquire().unwrap();
      assert!(proxy.on_disconnected());
      assert!(!proxy.is_pending());

      proxy.acquire().unwrap();
      proxy.on_connected(sink_handle(2));
      assert!(proxy.on_disconnected());
      assert_eq!(proxy.held(), None);
   }
}
