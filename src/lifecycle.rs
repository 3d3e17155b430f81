use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Application lifecycle signals the query cache reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
  /// Application came back to the foreground / regained focus
  Foreground,
  /// Application moved to the background
  Background,
  /// Connectivity regained
  Online,
  /// Connectivity lost
  Offline,
}

/// Shared view of whether the network is reachable.
///
/// Starts online; flipped by lifecycle events.
#[derive(Debug, Clone)]
pub struct Connectivity {
  online: Arc<AtomicBool>,
}

impl Default for Connectivity {
  fn default() -> Self {
    Self {
      online: Arc::new(AtomicBool::new(true)),
    }
  }
}

impl Connectivity {
  pub fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }

  /// Update the flag. Returns true if this call brought the network back.
  pub fn set_online(&self, online: bool) -> bool {
    let was_online = self.online.swap(online, Ordering::SeqCst);
    online && !was_online
  }
}

/// Channel carrying lifecycle events from the host to the cache
pub struct LifecycleEvents {
  tx: mpsc::UnboundedSender<LifecycleEvent>,
  rx: mpsc::UnboundedReceiver<LifecycleEvent>,
}

impl LifecycleEvents {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self { tx, rx }
  }

  /// Sender for whatever observes the platform (focus, network reachability)
  pub fn sender(&self) -> mpsc::UnboundedSender<LifecycleEvent> {
    self.tx.clone()
  }

  /// Split off the receiving half, to be handed to the cache
  pub fn into_receiver(self) -> mpsc::UnboundedReceiver<LifecycleEvent> {
    self.rx
  }
}

impl Default for LifecycleEvents {
  fn default() -> Self {
    Self::new()
  }
}
