use log::info;
use smol_str::SmolStr;
use tokio::sync::watch;
use zbus::interface;

use crate::{
   error::SinkError,
   event::{EventSender, StackEvent},
   sink::session::SessionStatus,
};

pub const BUS_NAME: &str = "org.sinkd";
pub const OBJECT_PATH: &str = "/org/sinkd/session";

pub struct SinkService {
   event_tx: EventSender,
   status: watch::Receiver<SessionStatus>,
   friendly_name: SmolStr,
   discoverable_duration_ms: u32,
}

impl SinkService {
   pub const fn new(
      event_tx: EventSender,
      status: watch::Receiver<SessionStatus>,
      friendly_name: SmolStr,
      discoverable_duration_ms: u32,
   ) -> Self {
      Self {
         event_tx,
         status,
         friendly_name,
         discoverable_duration_ms,
      }
   }

   fn status_json(&self) -> serde_json::Value {
      let status = *self.status.borrow();
      serde_json::json!({
         "phase": status.phase.to_string(),
         "adapter_state": status.adapter_state.to_string(),
         "proxy_live": status.proxy_live,
         "friendly_name": self.friendly_name.as_str(),
         "discoverable_duration_ms": self.discoverable_duration_ms,
      })
   }
}

#[interface(name = "org.sinkd.Sink1")]
impl SinkService {
   /// Same as pressing the pairing button.
   async fn make_discoverable(&self) -> zbus::fdo::Result<bool> {
      let status = *self.status.borrow();
      if !status.phase.accepts_discoverable() {
         return Err(zbus::fdo::Error::Failed(
            SinkError::NotReady(status.phase).to_string(),
         ));
      }
      if !status.proxy_live {
         return Err(zbus::fdo::Error::Failed(
            SinkError::Disconnected.to_string(),
         ));
      }
      info!("Pairing requested over D-Bus");
      self.event_tx.emit(StackEvent::Trigger);
      Ok(true)
   }

   async fn status(&self) -> String {
      self.status_json().to_string()
   }

   #[zbus(property)]
   async fn phase(&self) -> String {
      self.status.borrow().phase.to_string()
   }
}
