//! Local radio lifecycle.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::{
   bluetooth::{stack::AdapterStack, types::AdapterState},
   event::AdapterEvent,
};

pub struct AdapterController {
   stack: Arc<dyn AdapterStack>,
   state: AdapterState,
   enable_requested: bool,
}

impl AdapterController {
   pub fn new(stack: Arc<dyn AdapterStack>) -> Self {
      let state = stack.current_state();
      Self {
         stack,
         state,
         enable_requested: false,
      }
   }

   pub fn is_present(&self) -> bool {
      self.stack.is_present()
   }

   /// Latest state seen, either at construction or through an event.
   pub const fn state(&self) -> AdapterState {
      self.state
   }

   pub fn observe(&mut self, event: AdapterEvent) {
      self.state = event.current;
   }

   /// Requests power-on at most once per session.
   pub fn ensure_enabled(&mut self) {
      if self.state == AdapterState::On {
         debug!("Bluetooth adapter already enabled");
         return;
      }
      if self.enable_requested {
         debug!("Bluetooth adapter enable already requested");
         return;
      }
      match self.stack.request_enable() {
         Ok(()) => {
            info!("Requested Bluetooth adapter power on");
            self.enable_requested = true;
         },
         Err(e) => warn!("Failed to request adapter power on: {e}"),
      }
   }

   pub fn set_friendly_name(&self, name: &str) {
      match self.stack.set_name(name) {
         Ok(()) => debug!("Set up Bluetooth adapter name {name}"),
         Err(e) => warn!("Failed to rename adapter to {name}: {e}"),
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::testing::FakeStack;

   #[test]
   fn test_enable_requested_once() {
      let fake = FakeStack::new(true, AdapterState::Off);
      let mut controller = AdapterController::new(fake.clone());

      controller.ensure_enabled();
      controller.ensure_enabled();
      assert_eq!(fake.state().enable_requests, 1);
   }

   #[test]
   fn test_enabled_adapter_is_left_alone() {
      let fake = FakeStack::new(true, AdapterState::On);
      let mut controller = AdapterController::new(fake.clone());

      controller.ensure_enabled();
      assert_eq!(fake.state().enable_requests, 0);
   }

   #[test]
   fn test_observe_tracks_latest_state() {
      let fake = FakeStack::new(true, AdapterState::Off);
      let mut controller = AdapterController::new(fake.clone());
      controller.observe(AdapterEvent {
         previous: AdapterState::TurningOn,
         current: AdapterState::On,
      });
      assert_eq!(controller.state(), AdapterState::On);

      controller.ensure_enabled();
      assert_eq!(fake.state().enable_requests, 0);
   }

   #[test]
   fn test_rename_failure_is_not_fatal() {
      let fake = FakeStack::new(true, AdapterState::On);
      fake.state().rename_fails = true;
      let controller = AdapterController::new(fake.clone());

      controller.set_friendly_name("Android Things Assistant");
      assert!(fake.state().names.is_empty());
   }
}
