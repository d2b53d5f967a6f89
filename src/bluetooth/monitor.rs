//! Connection and playback watchers.
//!
//! bluer exposes no per-device connection events, so both monitors listen
//! for `PropertiesChanged` signals from bluetoothd directly.

use std::{
   collections::{HashMap, HashSet},
   str::FromStr,
   sync::Arc,
};

use bluer::{Adapter, Address};
use futures::stream::StreamExt;
use log::{debug, warn};
use smol_str::SmolStr;
use tokio::task::JoinHandle;
use uuid::Uuid;
use zbus::{
   Connection, MatchRule, MessageStream,
   zvariant::{OwnedObjectPath, OwnedValue},
};

use crate::{
   bluetooth::{
      bluez::BackendShared,
      stack::EventChannel,
      types::{Device, ProfileId, ProfileState},
   },
   event::{ProfileEvent, StackEvent},
};

const DEVICE_INTERFACE: &str = "org.bluez.Device1";
const TRANSPORT_INTERFACE: &str = "org.bluez.MediaTransport1";
const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";
const OBJECT_MANAGER_INTERFACE: &str = "org.freedesktop.DBus.ObjectManager";

type ChangedProperties = (String, HashMap<String, OwnedValue>, Vec<String>);

/// Extracts the device address from a BlueZ object path below `adapter`,
/// e.g. `/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF/sep1/fd0`.
pub fn address_from_path(path: &str, adapter: &str) -> Option<Address> {
   let rest = path.strip_prefix("/org/bluez/")?.strip_prefix(adapter)?.strip_prefix('/')?;
   let segment = rest.split('/').next()?;
   let hex = segment.strip_prefix("dev_")?;
   Address::from_str(&hex.replace('_', ":")).ok()
}

/// Previous and current connection state for a `Connected` change.
pub fn connection_transition(
   previous: Option<ProfileState>,
   connected: bool,
) -> Option<(ProfileState, ProfileState)> {
   let current = ProfileState::from_connected(connected);
   let previous = previous.unwrap_or(ProfileState::from_connected(!connected));
   (previous != current).then_some((previous, current))
}

/// Previous and current playback state for a transport `State` change.
pub fn playback_transition(
   previous: Option<ProfileState>,
   state: &str,
) -> Option<(ProfileState, ProfileState)> {
   let current = ProfileState::from_transport_state(state)?;
   let previous = previous.unwrap_or(ProfileState::NotPlaying);
   (previous != current).then_some((previous, current))
}

/// Transports that are currently playing. Idle or removed transports are
/// forgotten, so the set only holds live streams.
#[derive(Debug, Default)]
pub struct TransportStates {
   playing: HashSet<String>,
}

impl TransportStates {
   pub fn update(&mut self, path: &str, state: &str) -> Option<(ProfileState, ProfileState)> {
      let previous = self.playing.contains(path).then_some(ProfileState::Playing);
      let (previous, current) = playback_transition(previous, state)?;
      if current == ProfileState::Playing {
         self.playing.insert(path.to_string());
      } else {
         self.playing.remove(path);
      }
      Some((previous, current))
   }

   /// Forgets transports at or below `object`, returning the ones that were
   /// still playing.
   pub fn remove(&mut self, object: &str) -> Vec<String> {
      let prefix = format!("{object}/");
      let gone: Vec<String> = self
         .playing
         .iter()
         .filter(|path| *path == object || path.starts_with(&prefix))
         .cloned()
         .collect();
      for path in &gone {
         self.playing.remove(path);
      }
      gone
   }

   pub fn playing_count(&self) -> usize {
      self.playing.len()
   }
}

/// A device counts as a source unless its service list says otherwise.
pub fn is_source_device(uuids: Option<&HashSet<Uuid>>) -> bool {
   uuids.is_none_or(|uuids| uuids.contains(&ProfileId::A2dpSource.uuid()))
}

async fn properties_changed(
   connection: &Connection,
   interface: &str,
) -> zbus::Result<MessageStream> {
   let rule = MatchRule::builder()
      .msg_type(zbus::message::Type::Signal)
      .sender("org.bluez")?
      .interface(PROPERTIES_INTERFACE)?
      .member("PropertiesChanged")?
      .arg(0, interface)?
      .build();
   MessageStream::for_match_rule(rule, connection, None).await
}

async fn interfaces_removed(connection: &Connection) -> zbus::Result<MessageStream> {
   let rule = MatchRule::builder()
      .msg_type(zbus::message::Type::Signal)
      .sender("org.bluez")?
      .interface(OBJECT_MANAGER_INTERFACE)?
      .member("InterfacesRemoved")?
      .build();
   MessageStream::for_match_rule(rule, connection, None).await
}

async fn lookup_device(adapter: &Adapter, address: Address) -> (Option<SmolStr>, bool) {
   let Ok(device) = adapter.device(address) else {
      return (None, true);
   };
   let name = device.name().await.ok().flatten().map(SmolStr::from);
   let uuids = device.uuids().await.ok().flatten();
   (name, is_source_device(uuids.as_ref()))
}

async fn transport_device(adapter: &Adapter, adapter_name: &str, path: &str) -> Option<Device> {
   let address = address_from_path(path, adapter_name)?;
   let (name, _) = lookup_device(adapter, address).await;
   Some(Device::new(address, name))
}

pub fn spawn_connection_monitor(
   connection: Connection,
   adapter: Adapter,
   adapter_name: SmolStr,
   shared: Arc<BackendShared>,
) -> JoinHandle<()> {
   tokio::spawn(async move {
      let mut stream = match properties_changed(&connection, DEVICE_INTERFACE).await {
         Ok(stream) => stream,
         Err(e) => {
            warn!("Failed to watch device connections: {e}");
            return;
         },
      };

      let mut states: HashMap<Address, ProfileState> = HashMap::new();
      while let Some(msg) = stream.next().await {
         let Ok(msg) = msg else { continue };
         let header = msg.header();
         let Some(address) = header
            .path()
            .and_then(|p| address_from_path(p.as_str(), &adapter_name))
         else {
            continue;
         };
         let Ok((_, changed, _)) = msg.body().deserialize::<ChangedProperties>() else {
            continue;
         };
         let Some(connected) = changed
            .get("Connected")
            .and_then(|v| v.downcast_ref::<bool>().ok())
         else {
            continue;
         };

         let Some((previous, current)) =
            connection_transition(states.get(&address).copied(), connected)
         else {
            continue;
         };
         states.insert(address, current);

         let (name, is_source) = lookup_device(&adapter, address).await;
         if !is_source {
            debug!("Ignoring connection change of non-source device {address}");
            continue;
         }
         shared.broadcast(
            EventChannel::Connection,
            StackEvent::Profile(ProfileEvent::connection(
               previous,
               current,
               Some(Device::new(address, name)),
            )),
         );
      }
      debug!("Device connection stream ended");
   })
}

pub fn spawn_playback_monitor(
   connection: Connection,
   adapter: Adapter,
   adapter_name: SmolStr,
   shared: Arc<BackendShared>,
) -> JoinHandle<()> {
   tokio::spawn(async move {
      let streams = tokio::try_join!(
         properties_changed(&connection, TRANSPORT_INTERFACE),
         interfaces_removed(&connection),
      );
      let (mut changes, mut removals) = match streams {
         Ok(streams) => streams,
         Err(e) => {
            warn!("Failed to watch media transports: {e}");
            return;
         },
      };

      let mut transports = TransportStates::default();
      loop {
         tokio::select! {
            msg = changes.next() => {
               let Some(msg) = msg else { break };
               let Ok(msg) = msg else { continue };
               let header = msg.header();
               let Some(path) = header.path().map(|p| p.as_str().to_string()) else {
                  continue;
               };
               let Ok((_, changed, _)) = msg.body().deserialize::<ChangedProperties>() else {
                  continue;
               };
               let Some(state) = changed
                  .get("State")
                  .and_then(|v| v.downcast_ref::<String>().ok())
               else {
                  continue;
               };
               let Some((previous, current)) = transports.update(&path, &state) else {
                  continue;
               };

               let device = transport_device(&adapter, &adapter_name, &path).await;
               shared.broadcast(
                  EventChannel::Playback,
                  StackEvent::Profile(ProfileEvent::playback(previous, current, device)),
               );
            },
            msg = removals.next() => {
               let Some(msg) = msg else { break };
               let Ok(msg) = msg else { continue };
               let Ok((object, _)) = msg.body().deserialize::<(OwnedObjectPath, Vec<String>)>()
               else {
                  continue;
               };
               // A transport can vanish mid-stream when the source drops.
               for path in transports.remove(object.as_str()) {
                  let device = transport_device(&adapter, &adapter_name, &path).await;
                  shared.broadcast(
                     EventChannel::Playback,
                     StackEvent::Profile(ProfileEvent::playback(
                        ProfileState::Playing,
                        ProfileState::NotPlaying,
                        device,
                     )),
                  );
               }
            },
         }
      }
      debug!("Media transport stream ended ({} still playing)", transports.playing_count());
   })
}
