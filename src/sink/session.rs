//! The sink session: one [`SinkMachine`] plus the components that carry out
//! its effects.
//!
//! A session is owned by a single consumer of the event queue. Each
//! [`StackEvent`] is routed to the component it concerns, turned into an
//! [`Input`], and the resulting effects are executed in order. Effects that
//! complete synchronously (a skipped profile switch, an already held proxy)
//! feed their result straight back into the machine.

use std::{collections::VecDeque, sync::Arc};

use log::{debug, error, info, warn};
use smol_str::SmolStr;
use tokio::sync::watch;

use crate::{
   announcer::Announcer,
   bluetooth::{
      stack::Stack,
      types::{AdapterState, DiscoverableResult, ProfileId},
   },
   config::Config,
   error::{Result, SinkError},
   event::{ProfileEvent, ProfileEventKind, StackEvent},
   sink::{
      adapter::AdapterController,
      discovery::DiscoverabilityCoordinator,
      dispatcher::EventDispatcher,
      machine::{Effect, Effects, Input, SessionPhase, SinkMachine},
      profiles::{ProfileConfigurator, ProfileSetup},
      proxy::{Acquire, ProxyManager},
   },
};

/// Snapshot published after every handled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionStatus {
   pub phase: SessionPhase,
   pub adapter_state: AdapterState,
   pub proxy_live: bool,
}

pub struct SinkSession {
   machine: SinkMachine,
   adapter: AdapterController,
   profiles: ProfileConfigurator,
   proxy: ProxyManager,
   discovery: DiscoverabilityCoordinator,
   dispatcher: EventDispatcher,
   announcer: Arc<dyn Announcer>,
   friendly_name: SmolStr,
   status: watch::Sender<SessionStatus>,
}

impl SinkSession {
   /// Starts the session. Fails with `NoAdapter` when the stack has no
   /// radio; nothing is subscribed in that case.
   pub fn new(config: &Config, stack: Stack) -> Result<Self> {
      let mut machine = SinkMachine::new(config);
      if !stack.adapter.is_present() {
         return Err(SinkError::NoAdapter);
      }
      // Subscribe before the adapter state is read, so a change in between
      // still arrives as an event.
      let dispatcher = EventDispatcher::subscribe(stack.events)?;
      let adapter = AdapterController::new(stack.adapter);
      let effects = machine.start(adapter.is_present(), adapter.state())?;

      let (status, _) = watch::channel(SessionStatus {
         phase: machine.phase(),
         adapter_state: adapter.state(),
         proxy_live: false,
      });

      let mut session = Self {
         machine,
         adapter,
         profiles: ProfileConfigurator::new(stack.profiles),
         proxy: ProxyManager::new(stack.proxy, ProfileId::A2dpSink),
         discovery: DiscoverabilityCoordinator::new(stack.discovery),
         dispatcher,
         announcer: stack.announcer,
         friendly_name: config.friendly_name.clone(),
         status,
      };
      info!("Sink session started in phase {}", session.phase());
      session.run(effects);
      Ok(session)
   }

   pub const fn phase(&self) -> SessionPhase {
      self.machine.phase()
   }

   pub const fn is_active(&self) -> bool {
      self.machine.is_active()
   }

   pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
      self.status.subscribe()
   }

   pub fn handle(&mut self, event: StackEvent) {
      if !self.is_active() {
         debug!("Session shut down, dropping {event:?}");
         return;
      }

      let input = match event {
         StackEvent::Adapter(event) => {
            self.adapter.observe(event);
            Some(self.dispatcher.on_adapter_event(event))
         },
         StackEvent::Profile(event) => self.on_profile_event(&event),
         StackEvent::ProxyConnected(handle) => {
            self.proxy.on_connected(handle).then_some(Input::ProxyConnected)
         },
         StackEvent::ProxyDisconnected => {
            self.proxy.on_disconnected().then_some(Input::ProxyDisconnected)
         },
         StackEvent::DiscoverableResult(result) => {
            self.discovery.on_discoverable_result(result).map(Input::DiscoverableResult)
         },
         StackEvent::DiscoverableEnded => Some(Input::DiscoverableEnded),
         StackEvent::Trigger => Some(Input::Trigger),
         StackEvent::Shutdown => Some(Input::Teardown),
      };

      if let Some(input) = input {
         self.feed(input);
      }
   }

   /// Releases the proxy, unsubscribes and stops speech. Safe to call in
   /// any phase and more than once.
   pub fn teardown(&mut self) {
      if self.is_active() {
         info!("Tearing down sink session in phase {}", self.phase());
      }
      self.feed(Input::Teardown);
   }

   fn on_profile_event(&mut self, event: &ProfileEvent) -> Option<Input> {
      match event.kind {
         ProfileEventKind::Connection => {
            if let Some(text) = self.dispatcher.on_connection_event(event) {
               self.announcer.speak(&text);
            }
            Some(Input::Connection(event.current))
         },
         ProfileEventKind::Playback => {
            self.dispatcher.on_playback_event(event);
            None
         },
      }
   }

   fn feed(&mut self, input: Input) {
      let effects = self.machine.handle(input);
      self.run(effects);
   }

   fn run(&mut self, effects: Effects) {
      let mut pending: VecDeque<Effect> = effects.into_iter().collect();
      while let Some(effect) = pending.pop_front() {
         if let Some(input) = self.apply(effect) {
            pending.extend(self.machine.handle(input));
         }
      }
      self.publish();
   }

   fn apply(&mut self, effect: Effect) -> Option<Input> {
      match effect {
         Effect::RequestEnable => {
            self.adapter.ensure_enabled();
            None
         },
         Effect::ConfigureProfiles => {
            match self.profiles.ensure_sink_profiles(self.adapter.state()) {
               Ok(ProfileSetup::Skipped) => Some(Input::ProfilesConfigured),
               Ok(ProfileSetup::Requested) => {
                  info!("Requested switch to A2DP sink profiles");
                  Some(Input::ProfilesConfigured)
               },
               Err(e) => {
                  error!("Failed to configure sink profiles: {e}");
                  Some(Input::ProfilesFailed)
               },
            }
         },
         Effect::SetFriendlyName => {
            self.adapter.set_friendly_name(&self.friendly_name);
            None
         },
         Effect::AcquireProxy => match self.proxy.acquire() {
            Ok(Acquire::Requested) => None,
            Ok(Acquire::AlreadyHeld) => Some(Input::ProxyConnected),
            Err(SinkError::AlreadyPending) => {
               debug!("Sink proxy request already in flight");
               None
            },
            Err(e) => {
               warn!("Failed to request sink proxy: {e}");
               None
            },
         },
         Effect::RequestDiscoverable(duration_ms) => {
            match self.discovery.enable_discoverable(self.phase(), duration_ms) {
               Ok(()) => None,
               Err(e) => {
                  warn!("Failed to request discoverable mode: {e}");
                  Some(Input::DiscoverableResult(DiscoverableResult::Cancelled))
               },
            }
         },
         Effect::Announce(text) => {
            self.announcer.speak(&text);
            None
         },
         Effect::ReleaseProxy => {
            self.proxy.release();
            None
         },
         Effect::Unsubscribe => {
            self.dispatcher.unsubscribe_all();
            None
         },
         Effect::StopAnnouncer => {
            self.announcer.stop();
            self.announcer.shutdown();
            None
         },
      }
   }

   fn publish(&self) {
      let status = SessionStatus {
         phase: self.machine.phase(),
         adapter_state: self.adapter.state(),
         proxy_live: self.machine.proxy_live(),
      };
      self.status.send_if_modified(|current| {
         if *current == status {
            return false;
         }
         *current = status;
         true
      });
   }
}
