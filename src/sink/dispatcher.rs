//! Adapter, connection and playback event routing.
//!
//! Adapter events are handed to the state machine. Connection changes
//! become spoken announcements; playback changes are only logged, since
//! they fire far more often and would flood the speech queue.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::{
   bluetooth::{
      stack::{EventChannel, EventSource, SubscriptionId},
      types::{Device, ProfileState},
   },
   error::Result,
   event::{AdapterEvent, ProfileEvent},
   sink::machine::Input,
};

/// Label used when an event carries no usable device name.
pub const UNKNOWN_DEVICE: &str = "a device";

const CHANNELS: [EventChannel; 3] = [
   EventChannel::Adapter,
   EventChannel::Connection,
   EventChannel::Playback,
];

pub fn device_label(device: Option<&Device>) -> &str {
   device
      .and_then(|d| d.name.as_deref())
      .filter(|name| !name.trim().is_empty())
      .unwrap_or(UNKNOWN_DEVICE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackActivity {
   Started,
   Stopped,
}

pub struct EventDispatcher {
   source: Arc<dyn EventSource>,
   subscriptions: Vec<(EventChannel, SubscriptionId)>,
}

impl EventDispatcher {
   /// Subscribes to all three channels, rolling back on failure.
   pub fn subscribe(source: Arc<dyn EventSource>) -> Result<Self> {
      let mut dispatcher = Self {
         source,
         subscriptions: Vec::with_capacity(CHANNELS.len()),
      };
      for channel in CHANNELS {
         match dispatcher.source.subscribe(channel) {
            Ok(id) => dispatcher.subscriptions.push((channel, id)),
            Err(e) => {
               dispatcher.unsubscribe_all();
               return Err(e);
            },
         }
      }
      Ok(dispatcher)
   }

   #[cfg(test)]
   pub fn is_subscribed(&self) -> bool {
      !self.subscriptions.is_empty()
   }

   pub fn unsubscribe_all(&mut self) {
      for (channel, id) in self.subscriptions.drain(..) {
         if let Err(e) = self.source.unsubscribe(id) {
            warn!("Failed to unsubscribe from {channel} events: {e}");
         }
      }
   }

   pub fn on_adapter_event(&self, event: AdapterEvent) -> Input {
      debug!(
         "Bluetooth adapter changing state from {} to {}",
         event.previous, event.current
      );
      Input::Adapter(event)
   }

   /// Returns the announcement for a connection change, if any.
   pub fn on_connection_event(&self, event: &ProfileEvent) -> Option<String> {
      debug!(
         "Bluetooth A2DP sink changing connection state from {} to {} device {:?}",
         event.previous, event.current, event.device
      );
      let label = device_label(event.device.as_ref());
      match event.current {
         ProfileState::Connected => Some(format!("Connected to {label}")),
         ProfileState::Disconnected => Some(format!("Disconnected from {label}")),
         _ => None,
      }
   }

   pub fn on_playback_event(&self, event: &ProfileEvent) -> Option<PlaybackActivity> {
      debug!(
         "Bluetooth A2DP sink changing playback state from {} to {} device {:?}",
         event.previous, event.current, event.device
      );
      let label = device_label(event.device.as_ref());
      match event.current {
         ProfileState::Playing => {
            info!("Playing audio from {label}");
            Some(PlaybackActivity::Started)
         },
         ProfileState::NotPlaying => {
            info!("Stopped playing audio from {label}");
            Some(PlaybackActivity::Stopped)
         },
         _ => None,
      }
   }
}

#[cfg(test)]
mod tests {
   use bluer::Address;

   use super::*;
   use crate::{bluetooth::types::AdapterState, testing::FakeStack};

   fn device(name: Option<&str>) -> Device {
      Device::new(
         Address::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]),
         name.map(Into::into),
      )
   }

   fn dispatcher() -> (Arc<FakeStack>, EventDispatcher) {
      let fake = FakeStack::new(true, AdapterState::On);
      let dispatcher = EventDispatcher::subscribe(fake.clone()).unwrap();
      (fake, dispatcher)
   }

   #[test]
   fn test_device_label() {
      assert_eq!(device_label(None), "a device");
      assert_eq!(device_label(Some(&device(None))), "a device");
      assert_eq!(device_label(Some(&device(Some("  ")))), "a device");
      assert_eq!(device_label(Some(&device(Some("Pixel")))), "Pixel");
   }

   #[test]
   fn test_connection_announcements() {
      let (_, dispatcher) = dispatcher();

      let connected = ProfileEvent::connection(
         ProfileState::Connecting,
         ProfileState::Connected,
         Some(device(Some("Pixel"))),
      );
      assert_eq!(
         dispatcher.on_connection_event(&connected).as_deref(),
         Some("Connected to Pixel")
      );

      let disconnected = ProfileEvent::connection(
         ProfileState::Connected,
         ProfileState::Disconnected,
         Some(device(None)),
      );
      assert_eq!(
         dispatcher.on_connection_event(&disconnected).as_deref(),
         Some("Disconnected from a device")
      );

      let anonymous =
         ProfileEvent::connection(ProfileState::Connected, ProfileState::Disconnected, None);
      assert_eq!(
         dispatcher.on_connection_event(&anonymous).as_deref(),
         Some("Disconnected from a device")
      );

      for (previous, current) in [
         (ProfileState::Disconnected, ProfileState::Connecting),
         (ProfileState::Connected, ProfileState::Disconnecting),
      ] {
         let event = ProfileEvent::connection(previous, current, Some(device(Some("Pixel"))));
         assert_eq!(dispatcher.on_connection_event(&event), None);
      }
   }

   #[test]
   fn test_playback_is_recorded_not_spoken() {
      let (_, dispatcher) = dispatcher();

      let playing = ProfileEvent::playback(
         ProfileState::NotPlaying,
         ProfileState::Playing,
         Some(device(Some("Pixel"))),
      );
      assert_eq!(
         dispatcher.on_playback_event(&playing),
         Some(PlaybackActivity::Started)
      );

      let stopped = ProfileEvent::playback(ProfileState::Playing, ProfileState::NotPlaying, None);
      assert_eq!(
         dispatcher.on_playback_event(&stopped),
         Some(PlaybackActivity::Stopped)
      );
   }

   #[test]
   fn test_adapter_events_are_forwarded() {
      let (_, dispatcher) = dispatcher();
      let event = AdapterEvent {
         previous: AdapterState::TurningOn,
         current: AdapterState::On,
      };
      assert_eq!(dispatcher.on_adapter_event(event), Input::Adapter(event));
   }

   #[test]
   fn test_subscribes_once_and_unsubscribes_once() {
      let (fake, mut dispatcher) = dispatcher();
      assert_eq!(fake.state().subscriptions.len(), 3);

      dispatcher.unsubscribe_all();
      dispatcher.unsubscribe_all();
      assert!(!dispatcher.is_subscribed());

      let state = fake.state();
      assert!(state.subscriptions.is_empty());
      assert_eq!(state.unsubscribes, 3);
   }

   #[test]
   fn test_failed_subscription_rolls_back() {
      let fake = FakeStack::new(true, AdapterState::On);
      fake.state().fail_subscription = Some(EventChannel::Playback);

      assert!(EventDispatcher::subscribe(fake.clone()).is_err());
      let state = fake.state();
      assert!(state.subscriptions.is_empty());
      assert_eq!(state.unsubscribes, 2);
   }
}
