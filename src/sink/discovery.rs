//! Pairing window requests.

use std::sync::Arc;

use log::{debug, warn};

use crate::{
   bluetooth::{stack::DiscoverabilityRequester, types::DiscoverableResult},
   error::{Result, SinkError},
   sink::machine::SessionPhase,
};

/// Text spoken once the stack grants a discoverable window.
pub fn discoverable_announcement(granted_ms: u32, friendly_name: &str) -> String {
   format!(
      "Bluetooth audio sink is discoverable for {granted_ms} milliseconds. Look for a device named \
       {friendly_name}"
   )
}

/// Issues discoverable requests and matches results to them.
///
/// Expiry of the window is not tracked here; the stack reports it.
pub struct DiscoverabilityCoordinator {
   requester: Arc<dyn DiscoverabilityRequester>,
   outstanding: u32,
}

impl DiscoverabilityCoordinator {
   pub fn new(requester: Arc<dyn DiscoverabilityRequester>) -> Self {
      Self {
         requester,
         outstanding: 0,
      }
   }

   pub fn enable_discoverable(&mut self, phase: SessionPhase, duration_ms: u32) -> Result<()> {
      if !phase.accepts_discoverable() {
         return Err(SinkError::NotReady(phase));
      }
      debug!("Registering for discovery ({duration_ms} ms)");
      self.requester.request_discoverable(duration_ms)?;
      self.outstanding += 1;
      Ok(())
   }

   /// Returns the result when it answers an outstanding request.
   pub fn on_discoverable_result(
      &mut self,
      result: DiscoverableResult,
   ) -> Option<DiscoverableResult> {
      if self.outstanding == 0 {
         warn!("Unsolicited discoverable result {result:?}");
         return None;
      }
      self.outstanding -= 1;
      debug!("Enable discoverable returned with result {result:?}");
      Some(result)
   }
}
