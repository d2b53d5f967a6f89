//! BlueZ implementation of the stack collaborators.
//!
//! [`BluezStack`] is a cheap handle: every request is queued to a
//! [`BackendActor`] task that owns the `bluer` adapter and reports
//! completions on the event bus. Queries are answered from state the actor
//! keeps up to date, so none of the trait methods wait on D-Bus.

use std::{
   collections::{HashMap, HashSet},
   sync::{
      Arc,
      atomic::{AtomicU64, Ordering},
   },
   time::Duration,
};

use bluer::{Adapter, AdapterEvent as BluerAdapterEvent, AdapterProperty, Session};
use crossbeam::atomic::AtomicCell;
use futures::stream::StreamExt;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::{
   process::Command,
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time,
};
use uuid::Uuid;

use crate::{
   bluetooth::{
      monitor,
      stack::{
         AdapterStack, DiscoverabilityRequester, EventChannel, EventSource, ProfileSet,
         ProfileStack, ProxyService, SubscriptionId,
      },
      types::{AdapterState, DiscoverableResult, ProfileId, ProxyHandle},
   },
   config::Config,
   error::{Result, SinkError},
   event::{AdapterEvent, EventSender, StackEvent},
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 64;
/// Time given to monitor tasks to wind down
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// State shared between the handle, the actor and the monitors.
pub struct BackendShared {
   adapter_state: AtomicCell<AdapterState>,
   profiles: Mutex<ProfileSet>,
   subscriptions: Mutex<HashMap<SubscriptionId, EventChannel>>,
   event_tx: EventSender,
}

impl BackendShared {
   fn new(event_tx: EventSender, adapter_state: AdapterState, profiles: ProfileSet) -> Self {
      Self {
         adapter_state: AtomicCell::new(adapter_state),
         profiles: Mutex::new(profiles),
         subscriptions: Mutex::new(HashMap::new()),
         event_tx,
      }
   }

   pub fn is_subscribed(&self, channel: EventChannel) -> bool {
      self.subscriptions.lock().values().any(|c| *c == channel)
   }

   /// Emits a broadcast event, dropped when nobody listens on `channel`.
   pub fn broadcast(&self, channel: EventChannel, event: StackEvent) {
      if self.is_subscribed(channel) {
         self.event_tx.emit(event);
      } else {
         debug!("No {channel} subscriber, dropping {event:?}");
      }
   }

   /// Emits the answer to a request.
   pub fn reply(&self, event: StackEvent) {
      self.event_tx.emit(event);
   }
}

#[derive(Debug)]
enum BackendCommand {
   // Session requests
   Enable,
   Rename(SmolStr),
   ApplyProfiles {
      enable: Vec<ProfileId>,
      disable: Vec<ProfileId>,
   },
   AcquireProxy(ProfileId),
   ReleaseProxy(ProxyHandle),
   Discoverable(u32),

   // Adapter monitor
   Property(AdapterProperty),
   AdapterLost,

   Shutdown(oneshot::Sender<()>),
}

/// Handle to the BlueZ backend actor.
pub struct BluezStack {
   inbox: mpsc::Sender<BackendCommand>,
   shared: Arc<BackendShared>,
   present: bool,
   next_subscription: AtomicU64,
}

impl BluezStack {
   /// Connects to bluetoothd. A missing adapter is not an error here; the
   /// stack reports itself absent and the session decides.
   pub async fn new(config: &Config, event_tx: EventSender) -> Result<Self> {
      let session = Session::new().await?;
      let adapter = match &config.adapter {
         Some(name) => session.adapter(name),
         None => session.default_adapter().await,
      };

      let adapter = match adapter {
         Ok(adapter) => adapter,
         Err(e) => {
            warn!("No Bluetooth adapter available: {e}");
            return Ok(Self::absent(event_tx));
         },
      };

      // `adapter()` does not check that the object exists.
      let powered = match adapter.is_powered().await {
         Ok(powered) => powered,
         Err(e) => {
            warn!("Bluetooth adapter {} is not reachable: {e}", adapter.name());
            return Ok(Self::absent(event_tx));
         },
      };
      let profiles = profiles_from_uuids(adapter.uuids().await?.unwrap_or_default().iter());
      info!(
         "Using Bluetooth adapter {} (powered: {powered}, profiles: {})",
         adapter.name(),
         format_profiles(&profiles)
      );

      let shared = Arc::new(BackendShared::new(
         event_tx,
         AdapterState::from_powered(powered),
         profiles,
      ));
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let actor = BackendActor::new(
         adapter,
         shared.clone(),
         command_tx.clone(),
         command_rx,
         config.profiles.switch_command.clone(),
      );
      tokio::spawn(actor.run());

      Ok(Self {
         inbox: command_tx,
         shared,
         present: true,
         next_subscription: AtomicU64::new(1),
      })
   }

   fn absent(event_tx: EventSender) -> Self {
      // The receiver is dropped, so every request fails with StackShutdown.
      let (inbox, _) = mpsc::channel(1);
      Self {
         inbox,
         shared: Arc::new(BackendShared::new(event_tx, AdapterState::Off, ProfileSet::new())),
         present: false,
         next_subscription: AtomicU64::new(1),
      }
   }

   /// Stops the actor and its monitors. The adapter keeps its power state.
   pub async fn shutdown(&self) {
      let (tx, rx) = oneshot::channel();
      if self.inbox.send(BackendCommand::Shutdown(tx)).await.is_ok() {
         let _ = rx.await;
      }
   }

   fn send(&self, command: BackendCommand) -> Result<()> {
      self
         .inbox
         .try_send(command)
         .map_err(|_| SinkError::StackShutdown)
   }
}

impl AdapterStack for BluezStack {
   fn is_present(&self) -> bool {
      self.present
   }

   fn current_state(&self) -> AdapterState {
      self.shared.adapter_state.load()
   }

   fn request_enable(&self) -> Result<()> {
      self.send(BackendCommand::Enable)
   }

   fn set_name(&self, name: &str) -> Result<()> {
      self.send(BackendCommand::Rename(name.into()))
   }
}

impl ProfileStack for BluezStack {
   fn enabled_profiles(&self) -> Result<ProfileSet> {
      if !self.present {
         return Err(SinkError::NoAdapter);
      }
      Ok(self.shared.profiles.lock().clone())
   }

   fn set_profiles(&self, enable: &[ProfileId], disable: &[ProfileId]) -> Result<()> {
      self.send(BackendCommand::ApplyProfiles {
         enable: enable.to_vec(),
         disable: disable.to_vec(),
      })
   }
}

impl ProxyService for BluezStack {
   fn request_proxy(&self, profile: ProfileId) -> Result<()> {
      self.send(BackendCommand::AcquireProxy(profile))
   }

   fn release(&self, handle: ProxyHandle) {
      if let Err(e) = self.send(BackendCommand::ReleaseProxy(handle)) {
         debug!("Could not release {} proxy {}: {e}", handle.profile, handle.id);
      }
   }
}

impl DiscoverabilityRequester for BluezStack {
   fn request_discoverable(&self, duration_ms: u32) -> Result<()> {
      self.send(BackendCommand::Discoverable(duration_ms))
   }
}

impl EventSource for BluezStack {
   fn subscribe(&self, channel: EventChannel) -> Result<SubscriptionId> {
      let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
      self.shared.subscriptions.lock().insert(id, channel);
      debug!("Subscribed to {channel} events ({})", id.0);
      Ok(id)
   }

   fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
      match self.shared.subscriptions.lock().remove(&id) {
         Some(channel) => {
            debug!("Unsubscribed from {channel} events ({})", id.0);
            Ok(())
         },
         None => Err(SinkError::UnknownSubscription(id.0)),
      }
   }
}

// === Backend State ===

/// Proxy, window and profile bookkeeping of the backend. Takes adapter
/// property changes and request outcomes, and emits the resulting events.
/// Holds no D-Bus objects.
pub struct BackendState {
   shared: Arc<BackendShared>,
   wanted_proxy: Option<ProfileId>,
   proxy: Option<ProxyHandle>,
   next_proxy_id: u64,
   window_open: bool,
}

impl BackendState {
   pub const fn new(shared: Arc<BackendShared>) -> Self {
      Self {
         shared,
         wanted_proxy: None,
         proxy: None,
         next_proxy_id: 1,
         window_open: false,
      }
   }

   pub fn adapter_state(&self) -> AdapterState {
      self.shared.adapter_state.load()
   }

   pub fn set_adapter_state(&self, current: AdapterState) {
      let previous = self.shared.adapter_state.swap(current);
      if previous != current {
         self.shared.broadcast(
            EventChannel::Adapter,
            StackEvent::Adapter(AdapterEvent { previous, current }),
         );
      }
   }

   pub fn acquire_proxy(&mut self, profile: ProfileId) {
      if let Some(handle) = self.proxy
         && handle.profile == profile
      {
         self.shared.reply(StackEvent::ProxyConnected(handle));
         return;
      }
      self.wanted_proxy = Some(profile);
      self.complete_proxy();
   }

   pub fn release_proxy(&mut self, handle: ProxyHandle) {
      if self.proxy == Some(handle) {
         debug!("Released {} proxy {}", handle.profile, handle.id);
         self.proxy = None;
      }
   }

   /// Hands out a proxy once the adapter advertises the wanted profile.
   fn complete_proxy(&mut self) {
      let Some(profile) = self.wanted_proxy else {
         return;
      };
      if self.adapter_state() != AdapterState::On || !self.shared.profiles.lock().contains(&profile)
      {
         debug!("Waiting for {profile} service to be registered");
         return;
      }
      let handle = ProxyHandle {
         profile,
         id: self.next_proxy_id,
      };
      self.next_proxy_id += 1;
      self.wanted_proxy = None;
      self.proxy = Some(handle);
      self.shared.reply(StackEvent::ProxyConnected(handle));
   }

   /// The session decides whether to ask again; nothing is re-acquired here.
   fn lose_proxy(&mut self) {
      if let Some(handle) = self.proxy.take() {
         info!("{} service gone, dropping proxy {}", handle.profile, handle.id);
         self.shared.reply(StackEvent::ProxyDisconnected);
      }
   }

   pub fn window_granted(&mut self, duration_ms: u32) {
      self.window_open = true;
      self
         .shared
         .reply(StackEvent::DiscoverableResult(DiscoverableResult::Granted(duration_ms)));
   }

   pub fn window_failed(&self) {
      self
         .shared
         .reply(StackEvent::DiscoverableResult(DiscoverableResult::Cancelled));
   }

   pub fn on_property(&mut self, property: AdapterProperty) {
      match property {
         AdapterProperty::Powered(powered) => self.on_powered(powered),
         AdapterProperty::Discoverable(false) if self.window_open => {
            self.window_open = false;
            self
               .shared
               .broadcast(EventChannel::Adapter, StackEvent::DiscoverableEnded);
         },
         AdapterProperty::Uuids(uuids) => self.update_profiles(&uuids),
         _ => {},
      }
   }

   fn on_powered(&mut self, powered: bool) {
      self.set_adapter_state(AdapterState::from_powered(powered));
      if powered {
         self.complete_proxy();
      } else {
         // Requests do not survive the adapter.
         self.window_open = false;
         self.wanted_proxy = None;
         self.lose_proxy();
      }
   }

   pub fn adapter_lost(&mut self) {
      self.on_powered(false);
   }

   pub fn update_profiles(&mut self, uuids: &HashSet<Uuid>) {
      let profiles = profiles_from_uuids(uuids.iter());
      {
         let mut current = self.shared.profiles.lock();
         if *current == profiles {
            return;
         }
         debug!("Adapter profiles now {}", format_profiles(&profiles));
         *current = profiles;
      }

      if let Some(handle) = self.proxy
         && !self.shared.profiles.lock().contains(&handle.profile)
      {
         self.lose_proxy();
      }
      self.complete_proxy();
   }
}

// === Backend Actor ===

struct BackendActor {
   adapter: Adapter,
   loopback_tx: mpsc::Sender<BackendCommand>,
   command_rx: mpsc::Receiver<BackendCommand>,
   switch_command: Option<Vec<String>>,

   // State
   state: BackendState,
   monitors: Vec<JoinHandle<()>>,
}

impl BackendActor {
   fn new(
      adapter: Adapter,
      shared: Arc<BackendShared>,
      loopback_tx: mpsc::Sender<BackendCommand>,
      command_rx: mpsc::Receiver<BackendCommand>,
      switch_command: Option<Vec<String>>,
   ) -> Self {
      Self {
         adapter,
         loopback_tx,
         command_rx,
         switch_command,
         state: BackendState::new(shared),
         monitors: Vec::new(),
      }
   }

   async fn run(mut self) {
      info!("BlueZ backend starting on {}", self.adapter.name());

      if let Some(monitor) =
         Self::start_adapter_monitor(self.loopback_tx.clone(), self.adapter.clone()).await
      {
         self.monitors.push(monitor);
      }
      // Changes between the initial snapshot and the monitor start are
      // otherwise lost.
      self.resync().await;
      self.start_profile_monitors().await;

      let mut reply = None;
      while let Some(cmd) = self.command_rx.recv().await {
         if let BackendCommand::Shutdown(tx) = cmd {
            reply = Some(tx);
            break;
         }
         self.handle_command(cmd).await;
      }

      info!("BlueZ backend shutting down");
      self.cleanup().await;
      if let Some(tx) = reply {
         let _ = tx.send(());
      }
   }

   async fn resync(&mut self) {
      match self.adapter.is_powered().await {
         Ok(powered) => self.state.on_property(AdapterProperty::Powered(powered)),
         Err(e) => warn!("Failed to read adapter power state: {e}"),
      }
      match self.adapter.uuids().await {
         Ok(uuids) => self.state.update_profiles(&uuids.unwrap_or_default()),
         Err(e) => warn!("Failed to read adapter profiles: {e}"),
      }
   }

   async fn start_profile_monitors(&mut self) {
      let connection = match zbus::Connection::system().await {
         Ok(connection) => connection,
         Err(e) => {
            warn!("No system bus, connection and playback events disabled: {e}");
            return;
         },
      };
      let adapter_name = SmolStr::from(self.adapter.name());
      let shared = self.state.shared.clone();
      self.monitors.push(monitor::spawn_connection_monitor(
         connection.clone(),
         self.adapter.clone(),
         adapter_name.clone(),
         shared.clone(),
      ));
      self.monitors.push(monitor::spawn_playback_monitor(
         connection,
         self.adapter.clone(),
         adapter_name,
         shared,
      ));
   }

   /// Subscribes to adapter events before returning, then forwards them to
   /// the actor from a task.
   async fn start_adapter_monitor(
      loopback: mpsc::Sender<BackendCommand>,
      adapter: Adapter,
   ) -> Option<JoinHandle<()>> {
      let mut events = match adapter.events().await {
         Ok(events) => events,
         Err(e) => {
            error!("Failed to watch adapter {}: {e}", adapter.name());
            return None;
         },
      };

      Some(tokio::spawn(async move {
         while let Some(event) = events.next().await {
            if let BluerAdapterEvent::PropertyChanged(property) = event
               && loopback
                  .send(BackendCommand::Property(property))
                  .await
                  .is_err()
            {
               return;
            }
         }

         let _ = loopback.send(BackendCommand::AdapterLost).await;
      }))
   }

   async fn handle_command(&mut self, cmd: BackendCommand) {
      match cmd {
         BackendCommand::Enable => self.enable().await,
         BackendCommand::Rename(name) => {
            if let Err(e) = self.adapter.set_alias(name.to_string()).await {
               warn!("Failed to set adapter alias {name}: {e}");
            } else {
               debug!("Adapter alias set to {name}");
            }
         },
         BackendCommand::ApplyProfiles { enable, disable } => {
            self.apply_profiles(&enable, &disable).await;
         },
         BackendCommand::AcquireProxy(profile) => self.state.acquire_proxy(profile),
         BackendCommand::ReleaseProxy(handle) => self.state.release_proxy(handle),
         BackendCommand::Discoverable(duration_ms) => self.open_window(duration_ms).await,
         BackendCommand::Property(property) => self.state.on_property(property),
         BackendCommand::AdapterLost => {
            warn!("Bluetooth adapter {} disappeared", self.adapter.name());
            self.state.adapter_lost();
         },
         BackendCommand::Shutdown(_) => {},
      }
   }

   async fn enable(&mut self) {
      if self.state.adapter_state() == AdapterState::On {
         return;
      }
      self.state.set_adapter_state(AdapterState::TurningOn);
      match self.adapter.set_powered(true).await {
         // No property change follows when the adapter was already powered.
         Ok(()) => self.state.on_property(AdapterProperty::Powered(true)),
         Err(e) => {
            warn!("Failed to power on adapter {}: {e}", self.adapter.name());
            self.state.set_adapter_state(AdapterState::Off);
         },
      }
   }

   async fn apply_profiles(&mut self, enable: &[ProfileId], disable: &[ProfileId]) {
      let Some(argv) = self.switch_command.as_deref() else {
         warn!(
            "No profile switch command configured, leaving profiles as {}",
            format_profiles(&self.state.shared.profiles.lock())
         );
         return;
      };
      let Some((program, args)) = argv.split_first() else {
         warn!("Profile switch command is empty");
         return;
      };

      let status = Command::new(program)
         .args(args)
         .arg("--enable")
         .arg(join_profiles(enable))
         .arg("--disable")
         .arg(join_profiles(disable))
         .kill_on_drop(true)
         .status()
         .await;
      match status {
         Ok(status) if status.success() => info!("Profile switch command succeeded"),
         Ok(status) => {
            error!("Profile switch command {program} exited with {status}");
            return;
         },
         Err(e) => {
            error!("Failed to run profile switch command {program}: {e}");
            return;
         },
      }

      // Pick up the new service records without waiting for the signal.
      match self.adapter.uuids().await {
         Ok(uuids) => self.state.update_profiles(&uuids.unwrap_or_default()),
         Err(e) => warn!("Failed to refresh adapter profiles: {e}"),
      }
   }

   async fn open_window(&mut self, duration_ms: u32) {
      match set_discoverable(&self.adapter, discoverable_timeout_secs(duration_ms)).await {
         Ok(()) => self.state.window_granted(duration_ms),
         Err(e) => {
            error!("Failed to make adapter discoverable: {e}");
            self.state.window_failed();
         },
      }
   }

   async fn cleanup(&mut self) {
      for handle in self.monitors.drain(..) {
         handle.abort();
         let _ = time::timeout(TASK_SHUTDOWN_TIMEOUT, handle).await;
      }
   }
}

async fn set_discoverable(adapter: &Adapter, timeout_secs: u32) -> bluer::Result<()> {
   adapter.set_discoverable_timeout(timeout_secs).await?;
   adapter.set_pairable(true).await?;
   adapter.set_discoverable(true).await
}

/// BlueZ takes whole seconds; partial seconds round up.
pub const fn discoverable_timeout_secs(duration_ms: u32) -> u32 {
   duration_ms.div_ceil(1000)
}

pub fn profiles_from_uuids<'a>(uuids: impl Iterator<Item = &'a Uuid>) -> ProfileSet {
   uuids.filter_map(ProfileId::from_uuid).collect()
}

fn join_profiles(profiles: &[ProfileId]) -> String {
   profiles
      .iter()
      .map(ToString::to_string)
      .collect::<Vec<_>>()
      .join(",")
}

fn format_profiles(profiles: &ProfileSet) -> String {
   if profiles.is_empty() {
      return "none".to_string();
   }
   let mut sorted: Vec<_> = profiles.iter().copied().collect();
   sorted.sort();
   join_profiles(&sorted)
}
