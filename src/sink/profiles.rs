//! Switching the local radio into sink mode.

use std::sync::Arc;

use log::debug;

use crate::{
   bluetooth::{
      stack::{ProfileSet, ProfileStack},
      types::{AdapterState, ProfileId},
   },
   error::{Result, SinkError},
};

/// Roles enabled in sink mode.
pub const SINK_PROFILES: [ProfileId; 2] = [ProfileId::A2dpSink, ProfileId::AvrcpController];
/// Roles that conflict with sink mode.
pub const SOURCE_PROFILES: [ProfileId; 1] = [ProfileId::A2dpSource];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileSetup {
   /// Sink roles were already active; nothing was requested.
   Skipped,
   /// A switch was handed to the stack. It completes, if at all, when the
   /// adapter advertises the sink roles.
   Requested,
}

pub fn is_sink_mode(enabled: &ProfileSet) -> bool {
   SINK_PROFILES.iter().all(|p| enabled.contains(p))
      && !SOURCE_PROFILES.iter().any(|p| enabled.contains(p))
}

pub struct ProfileConfigurator {
   stack: Arc<dyn ProfileStack>,
}

impl ProfileConfigurator {
   pub fn new(stack: Arc<dyn ProfileStack>) -> Self {
      Self { stack }
   }

   pub fn ensure_sink_profiles(&self, adapter_state: AdapterState) -> Result<ProfileSetup> {
      if adapter_state != AdapterState::On {
         return Err(SinkError::PreconditionFailed(
            "adapter must be on to configure profiles",
         ));
      }

      let enabled = self.stack.enabled_profiles()?;
      if is_sink_mode(&enabled) {
         debug!("A2DP sink profile is enabled");
         return Ok(ProfileSetup::Skipped);
      }

      debug!("Enabling A2DP sink mode");
      self.stack.set_profiles(&SINK_PROFILES, &SOURCE_PROFILES)?;
      Ok(ProfileSetup::Requested)
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::testing::FakeStack;

   #[test]
   fn test_requires_adapter_on() {
      let fake = FakeStack::new(true, AdapterState::Off);
      let configurator = ProfileConfigurator::new(fake.clone());

      for state in [
         AdapterState::Off,
         AdapterState::TurningOn,
         AdapterState::TurningOff,
      ] {
         assert!(matches!(
            configurator.ensure_sink_profiles(state),
            Err(SinkError::PreconditionFailed(_))
         ));
      }
      assert!(fake.state().profile_changes.is_empty());
   }

   #[test]
   fn test_source_mode_is_switched_once() {
      let fake = FakeStack::new(true, AdapterState::On);
      fake.state().profiles = [ProfileId::A2dpSource, ProfileId::AvrcpTarget].into();
      let configurator = ProfileConfigurator::new(fake.clone());

      assert_eq!(
         configurator.ensure_sink_profiles(AdapterState::On).unwrap(),
         ProfileSetup::Requested
      );
      assert_eq!(
         configurator.ensure_sink_profiles(AdapterState::On).unwrap(),
         ProfileSetup::Skipped
      );

      let state = fake.state();
      assert_eq!(state.profile_changes.len(), 1);
      let (enable, disable) = &state.profile_changes[0];
      assert_eq!(enable, &SINK_PROFILES);
      assert_eq!(disable, &SOURCE_PROFILES);
   }

   #[test]
   fn test_sink_mode_is_idempotent() {
      let fake = FakeStack::new(true, AdapterState::On);
      fake.state().profiles = SINK_PROFILES.into();
      let configurator = ProfileConfigurator::new(fake.clone());

      for _ in 0..2 {
         assert_eq!(
            configurator.ensure_sink_profiles(AdapterState::On).unwrap(),
            ProfileSetup::Skipped
         );
      }
      assert!(fake.state().profile_changes.is_empty());
   }

   #[test]
   fn test_sink_mode_detection() {
      assert!(is_sink_mode(&SINK_PROFILES.into()));
      assert!(is_sink_mode(
         &[
            ProfileId::A2dpSink,
            ProfileId::AvrcpController,
            ProfileId::AvrcpTarget
         ]
         .into()
      ));
      assert!(!is_sink_mode(
         &[
            ProfileId::A2dpSink,
            ProfileId::AvrcpController,
            ProfileId::A2dpSource
         ]
         .into()
      ));
      assert!(!is_sink_mode(&[ProfileId::A2dpSink].into()));
   }
}
