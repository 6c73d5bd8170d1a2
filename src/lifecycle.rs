//! Stop and wake signals shared between the scheduler and its producers.

use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Triggers a cooperative stop.
#[derive(Debug)]
pub struct Stopper {
    tx: watch::Sender<bool>,
}

impl Stopper {
    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }
}

/// Observes the stop signal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub fn shutdown_channel() -> (Stopper, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (Stopper { tx }, Shutdown { rx })
}

impl Shutdown {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once a stop was requested. A dropped `Stopper` counts as a stop.
    pub async fn wait(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Producer side of the scheduler wake-up.
///
/// Backed by a one-slot channel: a wake that finds the slot full is dropped,
/// since the scheduler will run a cycle for the pending one anyway.
#[derive(Debug, Clone)]
pub struct Waker {
    tx: mpsc::Sender<()>,
}

pub fn wake_channel() -> (Waker, mpsc::Receiver<()>) {
    let (tx, rx) = mpsc::channel(1);
    (Waker { tx }, rx)
}

impl Waker {
    /// Never blocks.
    pub fn wake(&self) {
        if self.tx.try_send(()).is_err() {
            debug!("Wake already pending");
        }
    }
}
