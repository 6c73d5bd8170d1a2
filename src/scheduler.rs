//! The daemon's main loop: one cycle of send, receive and clean-up, then wait.

use crate::connection::{Connect, ConnectionManager};
use crate::error::{StoreError, StoreResult};
use crate::filter::FilterPipeline;
use crate::lifecycle::Shutdown;
use crate::receiver::receive_pending;
use crate::sender::send_pending;
use crate::store::Store;
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

pub struct Scheduler {
    store: Arc<dyn Store>,
    transport: Box<dyn Transport>,
    link: ConnectionManager,
    filter: Option<FilterPipeline>,
    local_prefix: Option<String>,
    poll_interval: Duration,
    shutdown: Shutdown,
    wakes: mpsc::Receiver<()>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        transport: Box<dyn Transport>,
        link: ConnectionManager,
        filter: Option<FilterPipeline>,
        local_prefix: Option<String>,
        poll_interval: Duration,
        shutdown: Shutdown,
        wakes: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            store,
            transport,
            link,
            filter,
            local_prefix,
            poll_interval,
            shutdown,
            wakes,
        }
    }

    /// Runs until stopped. Only a fatal store error ends it early.
    ///
    /// The outbox is only swept on every other timer tick, or right after a wake,
    /// so the device spends the remaining ticks draining incoming messages.
    pub async fn run(mut self) -> StoreResult<()> {
        info!(poll_interval_ms = self.poll_interval.as_millis() as u64, "Scheduler started");
        let mut send_phase = true;
        let result = loop {
            if self.shutdown.is_stopped() {
                break Ok(());
            }
            match self.cycle(send_phase).await {
                Ok(()) => {}
                Err(e) if e.is_transient() => warn!("Cycle abandoned: {}", e),
                Err(e) => {
                    error!("Fatal database error: {}", e);
                    break Err(e);
                }
            }

            tokio::select! {
                _ = self.shutdown.wait() => break Ok(()),
                Some(()) = self.wakes.recv() => {
                    debug!("Woken up for new outbox messages");
                    send_phase = true;
                }
                _ = tokio::time::sleep(self.poll_interval) => {
                    send_phase = !send_phase;
                }
            }
        };

        self.link.close(self.transport.as_mut()).await;
        if let Some(filter) = self.filter.as_mut() {
            filter.close().await;
        }
        info!("Scheduler stopped");
        result
    }

    #[instrument(skip(self))]
    async fn cycle(&mut self, send_phase: bool) -> Result<(), StoreError> {
        match self
            .link
            .ensure_connected(self.transport.as_mut(), &mut self.shutdown)
            .await
        {
            Connect::Ready => {}
            Connect::Unavailable | Connect::Stopped => return Ok(()),
        }

        if send_phase && send_pending(self.store.as_ref(), self.transport.as_mut()).await? {
            self.link.device_failed(self.transport.as_mut()).await;
            return Ok(());
        }

        let device_failed = receive_pending(
            self.store.as_ref(),
            self.transport.as_mut(),
            self.filter.as_mut(),
            self.local_prefix.as_deref(),
        )
        .await?;
        if device_failed {
            self.link.device_failed(self.transport.as_mut()).await;
            return Ok(());
        }

        if send_phase {
            let deleted = self.store.delete_completed().await?;
            if deleted > 0 {
                info!(deleted, "Completed messages removed from outbox");
            }
        }

        self.link.cycle_succeeded();
        Ok(())
    }
}
