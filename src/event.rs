use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;

/// Connectivity changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
  /// The API became reachable again
  Restored,
  /// The API stopped answering
  Lost,
}

/// Periodically checks reachability and reports transitions.
pub struct ConnectivityProbe {
  interval: Duration,
}

impl ConnectivityProbe {
  pub fn new(interval: Duration) -> Self {
    Self { interval }
  }

  /// Spawn the probe loop. `check` returns whether the API is reachable.
  ///
  /// The process is assumed online at start, so only a failing first check
  /// produces an event. The loop ends when the receiver is dropped.
  pub fn spawn<F, Fut>(self, mut check: F) -> mpsc::UnboundedReceiver<ConnectivityEvent>
  where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = bool> + Send + 'static,
  {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
      let mut online = true;
      loop {
        let now = check().await;
        if let Some(event) = transition(online, now) {
          tracing::info!(?event, "connectivity changed");
          if tx.send(event).is_err() {
            break;
          }
        }
        online = now;

        tokio::select! {
          _ = tokio::time::sleep(self.interval) => {}
          _ = tx.closed() => break,
        }
      }
    });

    rx
  }
}

fn transition(was_online: bool, is_online: bool) -> Option<ConnectivityEvent> {
  match (was_online, is_online) {
    (false, true) => Some(ConnectivityEvent::Restored),
    (true, false) => Some(ConnectivityEvent::Lost),
    _ => None,
  }
}
