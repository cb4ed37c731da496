use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Supervising context shared by every task of one host process. Once
/// cancelled, no new launch proceeds.
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
  pub fn new() -> Self {
    Shutdown(Arc::new(AtomicBool::new(false)))
  }

  pub fn cancel(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cancel_is_shared_by_clones() {
    let shutdown = Shutdown::new();
    let other = shutdown.clone();
    assert!(!other.is_cancelled());
    shutdown.cancel();
    assert!(other.is_cancelled());
  }
}
