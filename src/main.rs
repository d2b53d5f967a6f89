//! Bluetooth A2DP sink daemon
//!
//! Brings up the local adapter, switches it to sink mode, announces
//! connections through text-to-speech and opens a pairing window when the
//! pairing button is pressed.

use std::sync::Arc;

use log::{error, info, warn};
use tokio::{
   signal::{
      self,
      unix::{SignalKind, signal as unix_signal},
   },
   sync::watch,
};
use zbus::{Connection, connection};

use announcer::{Announcer, LogAnnouncer, SpeechAnnouncer};
use bluetooth::{bluez::BluezStack, stack::Stack};
use dbus::SinkService;
use event::{EventBus, EventQueue, StackEvent};
use sink::session::{SessionStatus, SinkSession};

mod announcer;
mod bluetooth;
mod config;
mod dbus;
mod error;
mod event;
mod sink;
#[cfg(test)]
mod testing;
mod trigger;

use crate::{config::Config, error::Result, trigger::Triggers};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting sinkd...");

   // Load configuration
   let config = Config::load()?;
   info!(
      "Loaded configuration: adapter name {}, pairing window {} ms",
      config.friendly_name, config.discoverable_duration_ms
   );

   let queue = EventQueue::new();
   let bluez = Arc::new(BluezStack::new(&config, queue.sender()).await?);

   let announcer: Arc<dyn Announcer> = if config.speech.enabled {
      Arc::new(SpeechAnnouncer::spawn(&config.speech))
   } else {
      Arc::new(LogAnnouncer)
   };

   let stack = Stack {
      adapter: bluez.clone(),
      profiles: bluez.clone(),
      proxy: bluez.clone(),
      discovery: bluez.clone(),
      events: bluez.clone(),
      announcer,
   };

   // Fails fast without an adapter
   let session = SinkSession::new(&config, stack)?;
   let status = session.watch_status();

   let triggers = Triggers::spawn(&config.trigger, queue.sender());

   let connection = if config.dbus.enabled {
      match serve_dbus(&config, queue.clone(), status.clone()).await {
         Ok(connection) => Some(connection),
         Err(e) => {
            warn!("D-Bus control interface unavailable: {e}");
            None
         },
      }
   } else {
      None
   };

   let consumer = tokio::spawn(run_session(session, queue.clone()));

   wait_for_shutdown().await?;
   info!("Shutting down sinkd...");

   triggers.close().await;
   queue.emit(StackEvent::Shutdown);
   if let Err(e) = consumer.await {
      error!("Session task failed: {e}");
   }
   bluez.shutdown().await;
   drop(connection);

   Ok(())
}

/// Owns the session; every event is handled here, one at a time.
async fn run_session(mut session: SinkSession, queue: Arc<EventQueue>) {
   while let Some(event) = queue.recv().await {
      let shutdown = event == StackEvent::Shutdown;
      session.handle(event);
      if shutdown {
         break;
      }
   }
   session.teardown();
   info!("Sink session finished");
}

async fn serve_dbus(
   config: &Config,
   queue: Arc<EventQueue>,
   status: watch::Receiver<SessionStatus>,
) -> Result<Connection> {
   let service = SinkService::new(
      queue.sender(),
      status.clone(),
      config.friendly_name.clone(),
      config.discoverable_duration_ms,
   );

   let builder = if config.dbus.system_bus {
      connection::Builder::system()?
   } else {
      connection::Builder::session()?
   };
   let connection = builder
      .name(dbus::BUS_NAME)?
      .serve_at(dbus::OBJECT_PATH, service)?
      .build()
      .await?;

   info!("D-Bus control interface started at {}", dbus::BUS_NAME);
   spawn_phase_notifier(&connection, status).await?;
   Ok(connection)
}

/// Emits `PropertiesChanged` for `Phase` whenever the session moves.
async fn spawn_phase_notifier(
   connection: &Connection,
   mut status: watch::Receiver<SessionStatus>,
) -> Result<()> {
   let iface = connection
      .object_server()
      .interface::<_, SinkService>(dbus::OBJECT_PATH)
      .await?;
   tokio::spawn(async move {
      let mut phase = status.borrow_and_update().phase;
      while status.changed().await.is_ok() {
         let current = status.borrow_and_update().phase;
         if current == phase {
            continue;
         }
         phase = current;
         if let Err(e) = iface.get().await.phase_changed(iface.signal_emitter()).await {
            warn!("Error emitting phase change: {e}");
         }
      }
   });
   Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
   let mut terminate = unix_signal(SignalKind::terminate())?;
   tokio::select! {
      result = signal::ctrl_c() => result?,
      _ = terminate.recv() => {},
   }
   Ok(())
}
