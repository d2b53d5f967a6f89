//! User-audible announcements.
//!
//! The session only ever speaks through the [`Announcer`] trait. The
//! speech implementation runs an external TTS command once per utterance,
//! strictly in order; utterances queue behind each other and never replace
//! one that is still pending.

use std::sync::{
   Arc,
   atomic::{AtomicU64, Ordering},
};

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{process::Command, sync::mpsc};

use crate::config::SpeechConfig;

pub trait Announcer: Send + Sync {
   /// Queues an utterance.
   fn speak(&self, text: &str);

   /// Drops every utterance that has not started yet.
   fn stop(&self);

   /// Releases the engine; later calls to `speak` are logged only.
   fn shutdown(&self);
}

/// Announcer used when speech is disabled.
pub struct LogAnnouncer;

impl Announcer for LogAnnouncer {
   fn speak(&self, text: &str) {
      info!("{text}");
   }

   fn stop(&self) {}

   fn shutdown(&self) {}
}

struct Utterance {
   text: String,
   generation: u64,
}

/// Queued text-to-speech through an external engine such as `espeak-ng`.
pub struct SpeechAnnouncer {
   tx: Mutex<Option<mpsc::UnboundedSender<Utterance>>>,
   generation: Arc<AtomicU64>,
}

impl SpeechAnnouncer {
   pub fn spawn(config: &SpeechConfig) -> Self {
      let (tx, rx) = mpsc::unbounded_channel();
      let generation = Arc::new(AtomicU64::new(0));
      tokio::spawn(speech_worker(
         config.command.clone(),
         config.args.clone(),
         rx,
         generation.clone(),
      ));
      Self {
         tx: Mutex::new(Some(tx)),
         generation,
      }
   }
}

impl Announcer for SpeechAnnouncer {
   fn speak(&self, text: &str) {
      info!("{text}");
      let utterance = Utterance {
         text: text.to_string(),
         generation: self.generation.load(Ordering::Acquire),
      };
      let sent = self
         .tx
         .lock()
         .as_ref()
         .is_some_and(|tx| tx.send(utterance).is_ok());
      if !sent {
         debug!("Speech engine unavailable, utterance logged only");
      }
   }

   fn stop(&self) {
      self.generation.fetch_add(1, Ordering::AcqRel);
   }

   fn shutdown(&self) {
      if self.tx.lock().take().is_some() {
         debug!("Speech engine shut down");
      }
   }
}

async fn speech_worker(
   command: String,
   args: Vec<String>,
   mut rx: mpsc::UnboundedReceiver<Utterance>,
   generation: Arc<AtomicU64>,
) {
   while let Some(utterance) = rx.recv().await {
      if utterance.generation != generation.load(Ordering::Acquire) {
         debug!("Dropping stopped utterance: {}", utterance.text);
         continue;
      }

      match Command::new(&command)
         .args(&args)
         .arg(&utterance.text)
         .kill_on_drop(true)
         .status()
         .await
      {
         Ok(status) if status.success() => {},
         Ok(status) => warn!("Speech engine {command} exited with {status}"),
         Err(e) => {
            warn!("Could not run speech engine {command} ({e}). Ignoring text to speech");
            return;
         },
      }
   }
}
