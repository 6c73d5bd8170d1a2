//! Device connection lifecycle with failure backoff.

use crate::lifecycle::Shutdown;
use crate::transport::Transport;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connected,
    /// Too many failures; the next attempt first sleeps out the backoff interval.
    Backoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connect {
    Ready,
    /// The connect attempt failed. Try again next cycle.
    Unavailable,
    /// Stop was requested while waiting.
    Stopped,
}

pub struct ConnectionManager {
    state: LinkState,
    device_errors: u32,
    connect_errors: u32,
    max_errors: u32,
    backoff: Duration,
}

impl ConnectionManager {
    pub fn new(max_errors: u32, backoff: Duration) -> Self {
        Self {
            state: LinkState::Disconnected,
            device_errors: 0,
            connect_errors: 0,
            max_errors,
            backoff,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> LinkState {
        self.state
    }

    pub async fn ensure_connected(
        &mut self,
        transport: &mut dyn Transport,
        shutdown: &mut Shutdown,
    ) -> Connect {
        if self.state == LinkState::Backoff {
            warn!(
                device_errors = self.device_errors,
                connect_errors = self.connect_errors,
                seconds = self.backoff.as_secs(),
                "Too many device errors, backing off"
            );
            tokio::select! {
                _ = shutdown.wait() => return Connect::Stopped,
                _ = tokio::time::sleep(self.backoff) => {}
            }
            self.device_errors = 0;
            self.connect_errors = 0;
            self.state = LinkState::Disconnected;
        }

        if self.state == LinkState::Connected {
            if transport.is_connected() {
                return Connect::Ready;
            }
            warn!("Device dropped the connection");
            self.state = LinkState::Disconnected;
        }

        match transport.connect().await {
            Ok(()) => {
                info!("Connected to device");
                self.state = LinkState::Connected;
                self.connect_errors = 0;
                Connect::Ready
            }
            Err(e) => {
                self.connect_errors += 1;
                error!(attempt = self.connect_errors, "Can't connect to device: {}", e);
                self.enter_backoff_if_needed();
                Connect::Unavailable
            }
        }
    }

    /// Records a failed device operation and drops the connection.
    pub async fn device_failed(&mut self, transport: &mut dyn Transport) {
        self.device_errors += 1;
        warn!(errors = self.device_errors, "Device error, disconnecting");
        if let Err(e) = transport.disconnect().await {
            warn!("Can't disconnect cleanly: {}", e);
        }
        self.state = LinkState::Disconnected;
        self.enter_backoff_if_needed();
    }

    /// A full cycle went through without device errors.
    pub fn cycle_succeeded(&mut self) {
        self.device_errors = 0;
    }

    pub async fn close(&mut self, transport: &mut dyn Transport) {
        if transport.is_connected() {
            if let Err(e) = transport.disconnect().await {
                warn!("Can't disconnect cleanly: {}", e);
            } else {
                info!("Disconnected from device");
            }
        }
        self.state = LinkState::Disconnected;
    }

    fn enter_backoff_if_needed(&mut self) {
        if self.device_errors > self.max_errors || self.connect_errors > self.max_errors {
            self.state = LinkState::Backoff;
        }
    }
}
