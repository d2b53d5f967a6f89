//! Sink session phases and the transition function.
//!
//! [`SinkMachine`] never talks to the stack. Each input moves the phase
//! and returns the [`Effect`]s the session has to carry out; results of
//! those effects come back as further inputs.

use log::{debug, error, info, warn};
use smallvec::{SmallVec, smallvec};
use smol_str::SmolStr;

use crate::{
   bluetooth::types::{AdapterState, DiscoverableResult, ProfileState},
   config::Config,
   error::{Result, SinkError},
   event::AdapterEvent,
   sink::discovery::discoverable_announcement,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
pub enum SessionPhase {
   #[default]
   Uninitialized,
   WaitingForAdapter,
   ConfiguringProfiles,
   AwaitingProxy,
   Ready,
   Discoverable,
   ShuttingDown,
}

impl SessionPhase {
   /// Phases in which a pairing window may be requested.
   pub const fn accepts_discoverable(self) -> bool {
      matches!(self, Self::Ready | Self::Discoverable)
   }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
   Adapter(AdapterEvent),
   ProfilesConfigured,
   ProfilesFailed,
   ProxyConnected,
   ProxyDisconnected,
   Trigger,
   DiscoverableResult(DiscoverableResult),
   DiscoverableEnded,
   Connection(ProfileState),
   Teardown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
   RequestEnable,
   ConfigureProfiles,
   SetFriendlyName,
   AcquireProxy,
   RequestDiscoverable(u32),
   Announce(String),
   ReleaseProxy,
   Unsubscribe,
   StopAnnouncer,
}

pub type Effects = SmallVec<[Effect; 4]>;

#[derive(Debug)]
pub struct SinkMachine {
   phase: SessionPhase,
   proxy_live: bool,
   window_opened: bool,
   friendly_name: SmolStr,
   discoverable_duration_ms: u32,
   discoverable_on_start: bool,
}

impl SinkMachine {
   pub fn new(config: &Config) -> Self {
      Self {
         phase: SessionPhase::Uninitialized,
         proxy_live: false,
         window_opened: false,
         friendly_name: config.friendly_name.clone(),
         discoverable_duration_ms: config.discoverable_duration_ms,
         discoverable_on_start: config.discoverable_on_start,
      }
   }

   pub const fn phase(&self) -> SessionPhase {
      self.phase
   }

   pub const fn is_active(&self) -> bool {
      !matches!(self.phase, SessionPhase::ShuttingDown)
   }

   pub const fn proxy_live(&self) -> bool {
      self.proxy_live
   }

   /// Leaves `Uninitialized`. Fails with `NoAdapter` when there is no radio;
   /// the machine then stays uninitialized.
   pub fn start(&mut self, adapter_present: bool, adapter_state: AdapterState) -> Result<Effects> {
      if self.phase != SessionPhase::Uninitialized {
         warn!("Session already started (phase {})", self.phase);
         return Ok(Effects::new());
      }
      if !adapter_present {
         return Err(SinkError::NoAdapter);
      }

      if adapter_state == AdapterState::On {
         debug!("Bluetooth adapter is already enabled");
         self.enter(SessionPhase::ConfiguringProfiles);
         Ok(smallvec![Effect::ConfigureProfiles])
      } else {
         debug!("Bluetooth adapter not enabled ({adapter_state}), enabling");
         self.enter(SessionPhase::WaitingForAdapter);
         Ok(smallvec![Effect::RequestEnable])
      }
   }

   pub fn handle(&mut self, input: Input) -> Effects {
      if !self.is_active() {
         debug!("Session shut down, ignoring {input:?}");
         return Effects::new();
      }
      if input == Input::Teardown {
         return self.teardown();
      }
      if self.phase == SessionPhase::Uninitialized {
         debug!("Session not started, ignoring {input:?}");
         return Effects::new();
      }

      match input {
         Input::Adapter(event) => self.on_adapter(event),
         Input::ProfilesConfigured => self.on_profiles_configured(),
         Input::ProfilesFailed => {
            if self.phase == SessionPhase::ConfiguringProfiles {
               self.enter(SessionPhase::WaitingForAdapter);
            }
            Effects::new()
         },
         Input::ProxyConnected => self.on_proxy_connected(),
         Input::ProxyDisconnected => {
            warn!("A2DP sink proxy disconnected, pairing blocked until it is acquired again");
            self.proxy_live = false;
            Effects::new()
         },
         Input::Trigger => self.on_trigger(),
         Input::DiscoverableResult(result) => self.on_discoverable_result(result),
         Input::DiscoverableEnded => {
            if self.phase == SessionPhase::Discoverable {
               info!("Discoverable window closed");
               self.enter(SessionPhase::Ready);
            }
            Effects::new()
         },
         Input::Connection(state) => {
            if state == ProfileState::Connected && self.phase == SessionPhase::Discoverable {
               debug!("Source connected, pairing window no longer needed");
               self.enter(SessionPhase::Ready);
            }
            Effects::new()
         },
         Input::Teardown => Effects::new(),
      }
   }

   fn on_adapter(&mut self, event: AdapterEvent) -> Effects {
      match (self.phase, event.current) {
         (SessionPhase::WaitingForAdapter, AdapterState::On) => {
            info!("Bluetooth adapter is ready");
            self.enter(SessionPhase::ConfiguringProfiles);
            smallvec![Effect::ConfigureProfiles]
         },
         (
            SessionPhase::ConfiguringProfiles
            | SessionPhase::AwaitingProxy
            | SessionPhase::Ready
            | SessionPhase::Discoverable,
            AdapterState::Off | AdapterState::TurningOff,
         ) => {
            warn!("Bluetooth adapter went {} during {}", event.current, self.phase);
            self.proxy_live = false;
            self.enter(SessionPhase::WaitingForAdapter);
            smallvec![Effect::ReleaseProxy]
         },
         (phase, current) => {
            debug!("Adapter state {current} absorbed in phase {phase}");
            Effects::new()
         },
      }
   }

   fn on_profiles_configured(&mut self) -> Effects {
      if self.phase != SessionPhase::ConfiguringProfiles {
         debug!("Profile configuration finished outside configuration phase");
         return Effects::new();
      }
      self.enter(SessionPhase::AwaitingProxy);
      smallvec![Effect::SetFriendlyName, Effect::AcquireProxy]
   }

   fn on_proxy_connected(&mut self) -> Effects {
      self.proxy_live = true;
      if self.phase != SessionPhase::AwaitingProxy {
         debug!("Sink proxy connected in phase {}", self.phase);
         return Effects::new();
      }
      self.enter(SessionPhase::Ready);
      if self.discoverable_on_start && !self.window_opened {
         self.open_window()
      } else {
         Effects::new()
      }
   }

   fn on_trigger(&mut self) -> Effects {
      if !self.phase.accepts_discoverable() {
         warn!("Pairing requested in phase {}, ignoring", self.phase);
         return Effects::new();
      }
      if !self.proxy_live {
         warn!("Pairing requested without a sink proxy, ignoring");
         return Effects::new();
      }
      self.open_window()
   }

   fn open_window(&mut self) -> Effects {
      self.window_opened = true;
      self.enter(SessionPhase::Discoverable);
      smallvec![Effect::RequestDiscoverable(self.discoverable_duration_ms)]
   }

   fn on_discoverable_result(&mut self, result: DiscoverableResult) -> Effects {
      if !self.phase.accepts_discoverable() {
         debug!("Discoverable result {result:?} ignored in phase {}", self.phase);
         return Effects::new();
      }
      match result {
         DiscoverableResult::Cancelled => {
            error!("{}, this should never happen on this device", SinkError::Cancelled);
            self.enter(SessionPhase::Ready);
            Effects::new()
         },
         DiscoverableResult::Granted(granted_ms) => {
            info!(
               "Bluetooth adapter set to discoverable mode. Any A2DP source can find it with the \
                name {} and pair for the next {granted_ms} ms",
               self.friendly_name
            );
            self.enter(SessionPhase::Discoverable);
            smallvec![Effect::Announce(discoverable_announcement(
               granted_ms,
               &self.friendly_name
            ))]
         },
      }
   }

   fn teardown(&mut self) -> Effects {
      self.proxy_live = false;
      self.enter(SessionPhase::ShuttingDown);
      smallvec![Effect::ReleaseProxy, Effect::Unsubscribe, Effect::StopAnnouncer]
   }

   fn enter(&mut self, phase: SessionPhase) {
      if self.phase != phase {
         debug!("Session phase {} -> {phase}", self.phase);
         self.phase = phase;
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn machine(discoverable_on_start: bool) -> SinkMachine {
      SinkMachine::new(&Config {
         discoverable_on_start,
         ..Config::default()
      })
   }

   fn adapter(previous: AdapterState, current: AdapterState) -> Input {
      Input::Adapter(AdapterEvent { previous, current })
   }

   fn ready(discoverable_on_start: bool) -> SinkMachine {
      let mut m = machine(discoverable_on_start);
      m.start(true, AdapterState::On).unwrap();
      m.handle(Input::ProfilesConfigured);
      m.handle(Input::ProxyConnected);
      m
   }

   #[test]
   fn test_start_without_adapter_fails() {
      let mut m = machine(true);
      assert!(matches!(m.start(false, AdapterState::Off), Err(SinkError::NoAdapter)));
      assert_eq!(m.phase(), SessionPhase::Uninitialized);
   }

   #[test]
   fn test_start_with_adapter_off_requests_enable() {
      let mut m = machine(true);
      let effects = m.start(true, AdapterState::Off).unwrap();
      assert_eq!(effects.as_slice(), [Effect::RequestEnable]);
      assert_eq!(m.phase(), SessionPhase::WaitingForAdapter);
   }

   #[test]
   fn test_start_with_adapter_on_configures() {
      let mut m = machine(true);
      let effects = m.start(true, AdapterState::On).unwrap();
      assert_eq!(effects.as_slice(), [Effect::ConfigureProfiles]);
      assert_eq!(m.phase(), SessionPhase::ConfiguringProfiles);
   }

   #[test]
   fn test_only_on_event_leaves_waiting() {
      let mut m = machine(true);
      m.start(true, AdapterState::Off).unwrap();

      for (previous, current) in [
         (AdapterState::Off, AdapterState::TurningOn),
         (AdapterState::TurningOn, AdapterState::TurningOff),
         (AdapterState::TurningOff, AdapterState::Off),
      ] {
         assert!(m.handle(adapter(previous, current)).is_empty());
         assert_eq!(m.phase(), SessionPhase::WaitingForAdapter);
      }

      let effects = m.handle(adapter(AdapterState::TurningOn, AdapterState::On));
      assert_eq!(effects.as_slice(), [Effect::ConfigureProfiles]);
      assert_eq!(m.phase(), SessionPhase::ConfiguringProfiles);
   }

   #[test]
   fn test_configured_profiles_rename_and_acquire() {
      let mut m = machine(true);
      m.start(true, AdapterState::On).unwrap();
      let effects = m.handle(Input::ProfilesConfigured);
      assert_eq!(effects.as_slice(), [Effect::SetFriendlyName, Effect::AcquireProxy]);
      assert_eq!(m.phase(), SessionPhase::AwaitingProxy);
   }

   #[test]
   fn test_failed_configuration_waits_for_adapter_again() {
      let mut m = machine(true);
      m.start(true, AdapterState::On).unwrap();
      assert!(m.handle(Input::ProfilesFailed).is_empty());
      assert_eq!(m.phase(), SessionPhase::WaitingForAdapter);

      let effects = m.handle(adapter(AdapterState::Off, AdapterState::On));
      assert_eq!(effects.as_slice(), [Effect::ConfigureProfiles]);
   }

   #[test]
   fn test_first_proxy_opens_window() {
      let mut m = machine(true);
      m.start(true, AdapterState::On).unwrap();
      m.handle(Input::ProfilesConfigured);
      let effects = m.handle(Input::ProxyConnected);
      assert_eq!(effects.as_slice(), [Effect::RequestDiscoverable(10_000)]);
      assert_eq!(m.phase(), SessionPhase::Discoverable);
   }

   #[test]
   fn test_proxy_without_auto_window_is_ready() {
      let m = ready(false);
      assert_eq!(m.phase(), SessionPhase::Ready);
      assert!(m.proxy_live());
   }

   #[test]
   fn test_second_proxy_callback_does_not_transition() {
      let mut m = ready(false);
      assert!(m.handle(Input::ProxyConnected).is_empty());
      assert_eq!(m.phase(), SessionPhase::Ready);
   }

   #[test]
   fn test_trigger_before_ready_is_ignored() {
      let mut m = machine(true);
      m.start(true, AdapterState::Off).unwrap();
      assert!(m.handle(Input::Trigger).is_empty());
      assert_eq!(m.phase(), SessionPhase::WaitingForAdapter);
   }

   #[test]
   fn test_trigger_opens_window_optimistically() {
      let mut m = ready(false);
      let effects = m.handle(Input::Trigger);
      assert_eq!(effects.as_slice(), [Effect::RequestDiscoverable(10_000)]);
      assert_eq!(m.phase(), SessionPhase::Discoverable);

      // Pressing again while discoverable re-opens the window.
      let effects = m.handle(Input::Trigger);
      assert_eq!(effects.as_slice(), [Effect::RequestDiscoverable(10_000)]);
   }

   #[test]
   fn test_trigger_blocked_after_proxy_loss() {
      let mut m = ready(false);
      m.handle(Input::ProxyDisconnected);
      assert_eq!(m.phase(), SessionPhase::Ready);
      assert!(m.handle(Input::Trigger).is_empty());

      m.handle(Input::ProxyConnected);
      assert_eq!(
         m.handle(Input::Trigger).as_slice(),
         [Effect::RequestDiscoverable(10_000)]
      );
   }

   #[test]
   fn test_cancelled_window_reverts_silently() {
      let mut m = ready(false);
      m.handle(Input::Trigger);
      let effects = m.handle(Input::DiscoverableResult(DiscoverableResult::Cancelled));
      assert!(effects.is_empty());
      assert_eq!(m.phase(), SessionPhase::Ready);
   }

   #[test]
   fn test_granted_window_announces_once() {
      let mut m = ready(false);
      m.handle(Input::Trigger);
      let effects = m.handle(Input::DiscoverableResult(DiscoverableResult::Granted(10_000)));
      assert_eq!(effects.len(), 1);
      let Effect::Announce(text) = &effects[0] else {
         panic!("expected announcement, got {effects:?}");
      };
      assert!(text.contains("10000"));
      assert!(text.contains("Android Things Assistant"));
      assert_eq!(m.phase(), SessionPhase::Discoverable);
   }

   #[test]
   fn test_window_closes_on_connection_or_expiry() {
      let mut m = ready(false);
      m.handle(Input::Trigger);
      m.handle(Input::Connection(ProfileState::Connecting));
      assert_eq!(m.phase(), SessionPhase::Discoverable);
      m.handle(Input::Connection(ProfileState::Connected));
      assert_eq!(m.phase(), SessionPhase::Ready);

      m.handle(Input::Trigger);
      m.handle(Input::DiscoverableEnded);
      assert_eq!(m.phase(), SessionPhase::Ready);
   }

   #[test]
   fn test_adapter_loss_returns_to_waiting() {
      let mut m = ready(false);
      let effects = m.handle(adapter(AdapterState::On, AdapterState::TurningOff));
      assert_eq!(effects.as_slice(), [Effect::ReleaseProxy]);
      assert_eq!(m.phase(), SessionPhase::WaitingForAdapter);
      assert!(!m.proxy_live());

      let effects = m.handle(adapter(AdapterState::Off, AdapterState::On));
      assert_eq!(effects.as_slice(), [Effect::ConfigureProfiles]);
   }

   #[test]
   fn test_teardown_is_terminal_and_idempotent() {
      let mut m = machine(true);
      m.start(true, AdapterState::Off).unwrap();
      let effects = m.handle(Input::Teardown);
      assert_eq!(
         effects.as_slice(),
         [Effect::ReleaseProxy, Effect::Unsubscribe, Effect::StopAnnouncer]
      );
      assert_eq!(m.phase(), SessionPhase::ShuttingDown);

      assert!(m.handle(Input::Teardown).is_empty());
      assert!(m.handle(adapter(AdapterState::Off, AdapterState::On)).is_empty());
      assert_eq!(m.phase(), SessionPhase::ShuttingDown);
   }

   #[test]
   fn test_teardown_before_start() {
      let mut m = machine(true);
      assert_eq!(m.handle(Input::Teardown).len(), 3);
      assert!(!m.is_active());
   }
}
