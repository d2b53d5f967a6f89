//! Pairing button sources.
//!
//! A press arrives either as `SIGUSR1` or as a key press on an evdev input
//! device (a `gpio-keys` node on most boards). Both emit
//! [`StackEvent::Trigger`]; the session decides whether it is honoured.

use std::{
   ffi::c_long,
   fs::{File, OpenOptions},
   io::{self, Read},
   os::unix::fs::OpenOptionsExt,
   path::{Path, PathBuf},
   time::Duration,
};

use log::{debug, info, warn};
use tokio::{
   io::{Interest, unix::AsyncFd},
   signal::unix::{SignalKind, signal},
   task::JoinHandle,
   time,
};

use crate::{
   config::TriggerConfig,
   event::{EventSender, StackEvent},
};

/// `struct input_event`: a `timeval` followed by type, code and value.
const INPUT_EVENT_SIZE: usize = 2 * size_of::<c_long>() + 8;
const EV_KEY: u16 = 0x01;
const KEY_PRESSED: i32 = 1;
/// Time given to trigger tasks to wind down
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Returns the key code when `record` is a key press.
pub fn key_press(record: &[u8; INPUT_EVENT_SIZE]) -> Option<u16> {
   let fields = &record[INPUT_EVENT_SIZE - 8..];
   let kind = u16::from_ne_bytes([fields[0], fields[1]]);
   let code = u16::from_ne_bytes([fields[2], fields[3]]);
   let value = i32::from_ne_bytes([fields[4], fields[5], fields[6], fields[7]]);
   (kind == EV_KEY && value == KEY_PRESSED).then_some(code)
}

pub struct Triggers {
   handles: Vec<JoinHandle<()>>,
}

impl Triggers {
   /// Starts every configured source. A source that cannot be opened is
   /// logged and skipped.
   pub fn spawn(config: &TriggerConfig, event_tx: EventSender) -> Self {
      let mut handles = Vec::new();

      if config.signal {
         match signal(SignalKind::user_defined1()) {
            Ok(mut usr1) => {
               let event_tx = event_tx.clone();
               handles.push(tokio::spawn(async move {
                  while usr1.recv().await.is_some() {
                     info!("Pairing requested by SIGUSR1");
                     event_tx.emit(StackEvent::Trigger);
                  }
               }));
            },
            Err(e) => warn!("Failed to install SIGUSR1 handler: {e}"),
         }
      }

      if let Some(path) = &config.input_device {
         handles.push(tokio::spawn(watch_input_device(
            path.clone(),
            config.key_code,
            event_tx,
         )));
      }

      Self { handles }
   }

   /// Stops every source. Never fails; a task that does not stop in time
   /// is left to the runtime.
   pub async fn close(self) {
      for handle in self.handles {
         handle.abort();
         if time::timeout(TASK_SHUTDOWN_TIMEOUT, handle).await.is_err() {
            warn!("Trigger task did not stop in time");
         }
      }
      debug!("Triggers closed");
   }
}

/// Opens an input device for readiness-driven reads. A read parked on the
/// reactor is dropped with its task, so closing the triggers never waits
/// for a key press.
fn open_input_device(path: &Path) -> io::Result<AsyncFd<File>> {
   let file = OpenOptions::new()
      .read(true)
      .custom_flags(libc::O_NONBLOCK)
      .open(path)?;
   AsyncFd::with_interest(file, Interest::READABLE)
}

/// Fills `record`. Returns `false` on end of file.
async fn read_record(
   device: &AsyncFd<File>,
   record: &mut [u8; INPUT_EVENT_SIZE],
) -> io::Result<bool> {
   let mut filled = 0;
   while filled < INPUT_EVENT_SIZE {
      let mut guard = device.readable().await?;
      match guard.try_io(|inner| {
         let mut file = inner.get_ref();
         file.read(&mut record[filled..])
      }) {
         Ok(Ok(0)) => return Ok(false),
         Ok(Ok(n)) => filled += n,
         Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {},
         Ok(Err(e)) => return Err(e),
         Err(_would_block) => {},
      }
   }
   Ok(true)
}

async fn watch_input_device(path: PathBuf, key_code: u16, event_tx: EventSender) {
   let device = match open_input_device(&path) {
      Ok(device) => device,
      Err(e) => {
         warn!("Failed to open button device {}: {e}", path.display());
         return;
      },
   };
   info!("Watching {} for key {key_code:#x}", path.display());

   let mut record = [0u8; INPUT_EVENT_SIZE];
   loop {
      match read_record(&device, &mut record).await {
         Ok(true) => {},
         Ok(false) => {
            debug!("Button device {} reached end of file", path.display());
            return;
         },
         Err(e) => {
            warn!("Button device {} closed: {e}", path.display());
            return;
         },
      }
      if key_press(&record) == Some(key_code) {
         info!("Pairing button pressed");
         event_tx.emit(StackEvent::Trigger);
      }
   }
}
