//! Event handling for the sink session.
//!
//! Every collaborator (BlueZ backend, D-Bus monitors, trigger sources,
//! the control interface) pushes [`StackEvent`]s into one FIFO queue. A
//! single consumer drains it, so session transitions never race.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use tokio::{sync::Notify, time};

use crate::bluetooth::types::{AdapterState, Device, DiscoverableResult, ProfileState, ProxyHandle};

/// Adapter power transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterEvent {
   pub previous: AdapterState,
   pub current: AdapterState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ProfileEventKind {
   Connection,
   Playback,
}

/// Sink profile transition for one remote device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileEvent {
   pub kind: ProfileEventKind,
   pub previous: ProfileState,
   pub current: ProfileState,
   pub device: Option<Device>,
}

impl ProfileEvent {
   pub const fn connection(
      previous: ProfileState,
      current: ProfileState,
      device: Option<Device>,
   ) -> Self {
      Self {
         kind: ProfileEventKind::Connection,
         previous,
         current,
         device,
      }
   }

   pub const fn playback(
      previous: ProfileState,
      current: ProfileState,
      device: Option<Device>,
   ) -> Self {
      Self {
         kind: ProfileEventKind::Playback,
         previous,
         current,
         device,
      }
   }
}

/// Everything the session reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackEvent {
   Adapter(AdapterEvent),
   Profile(ProfileEvent),
   ProxyConnected(ProxyHandle),
   ProxyDisconnected,
   DiscoverableResult(DiscoverableResult),
   DiscoverableEnded,
   Trigger,
   Shutdown,
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   fn emit(&self, event: StackEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

/// Lock-free FIFO of stack events with an async wakeup for the consumer.
pub struct EventQueue {
   queue: SegQueue<StackEvent>,
   notifier: Notify,
}

impl EventQueue {
   pub fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }

   /// Waits for the next event. Returns `None` once every producer is gone
   /// and the queue is drained.
   pub async fn recv(self: &Arc<Self>) -> Option<StackEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   pub fn sender(self: &Arc<Self>) -> EventSender {
      self.clone()
   }
}

impl EventBus for EventQueue {
   fn emit(&self, event: StackEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}
