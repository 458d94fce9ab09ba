//! Tracked best-effort side tasks.
//!
//! Work spawned here never gates the caller's result. Failures are logged in one
//! place and counted, and callers that need a quiescent point (tests, shutdown) can
//! wait for everything in flight with [`SideTasks::settle`].

use color_eyre::Result;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct SideTasks {
  tracker: TaskTracker,
  failures: Arc<AtomicUsize>,
}

impl SideTasks {
  pub fn new() -> Self {
    Self {
      tracker: TaskTracker::new(),
      failures: Arc::new(AtomicUsize::new(0)),
    }
  }

  /// Spawn a task whose outcome is only logged.
  pub fn spawn<F>(&self, name: &'static str, task: F)
  where
    F: Future<Output = Result<()>> + Send + 'static,
  {
    let failures = Arc::clone(&self.failures);
    self.tracker.spawn(async move {
      match task.await {
        Ok(()) => debug!(task = name, "side task finished"),
        Err(e) => {
          failures.fetch_add(1, Ordering::Relaxed);
          warn!(task = name, error = %e, "side task failed");
        }
      }
    });
  }

  /// Wait until every task spawned so far has finished.
  pub async fn settle(&self) {
    self.tracker.close();
    self.tracker.wait().await;
    self.tracker.reopen();
  }

  /// Number of tasks still running.
  pub fn in_flight(&self) -> usize {
    self.tracker.len()
  }

  /// Number of tasks that finished with an error.
  pub fn failures(&self) -> usize {
    self.failures.load(Ordering::Relaxed)
  }
}

impl Default for SideTasks {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use color_eyre::eyre::eyre;
  use std::time::Duration;

  #[tokio::test]
  async fn test_settle_waits_for_tasks() {
    let tasks = SideTasks::new();
    let done = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
      let done = Arc::clone(&done);
      tasks.spawn("sleep", async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        done.fetch_add(1, Ordering::SeqCst);
        Ok(())
      });
    }

    tasks.settle().await;
    assert_eq!(done.load(Ordering::SeqCst), 3);
    assert_eq!(tasks.in_flight(), 0);
    assert_eq!(tasks.failures(), 0);
  }

  #[tokio::test]
  async fn test_failures_are_counted_not_raised() {
    let tasks = SideTasks::new();
    tasks.spawn("boom", async { Err(eyre!("disk full")) });
    tasks.spawn("fine", async { Ok(()) });

    tasks.settle().await;
    assert_eq!(tasks.failures(), 1);

    // Still usable after settling
    tasks.spawn("again", async { Err(eyre!("still full")) });
    tasks.settle().await;
    assert_eq!(tasks.failures(), 2);
  }
}
