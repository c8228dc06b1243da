//! Sample hand-off from acquisition workers to the consumer context.
//!
//! Workers run on blocking threads and must never touch consumer state directly.
//! Every sample goes through one bounded channel into a single consumer task,
//! which owns all [`TelemetryConsumer`] bindings and calls them in arrival order.
//! Sends from a given worker are FIFO, so per-device order is preserved.
//!
//! Each run session has a numeric id. A fresh start calls
//! [`BridgeHandle::begin_session`], which bumps the id and enqueues a reset marker.
//! Samples stamped with an older id that arrive after the marker are discarded, so
//! a stopped worker's last line cannot leak into the next session's sinks.
//!
//! When the channel is full the [`BackpressurePolicy`] decides between blocking the
//! worker for a bounded time and dropping the newest sample. Either way the loss
//! is counted and visible through [`BridgeHandle::metrics`].

use crate::consumer::TelemetryConsumer;
use crate::device::DeviceId;
use crate::error::{AppResult, RigError};
use crate::protocol::Sample;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default bounded channel size.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

const DROP_LOG_INTERVAL: u64 = 100;

/// What a worker does when the consumer channel is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackpressurePolicy {
    /// Wait up to `timeout` for room, then drop the sample.
    Block {
        /// Longest wait before the sample is dropped
        timeout: Duration,
    },
    /// Drop the sample immediately.
    DropNewest,
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        Self::Block {
            timeout: Duration::from_millis(50),
        }
    }
}

enum Dispatch {
    Sample { session: u64, sample: Sample },
    Reset { session: u64 },
    Flush(oneshot::Sender<()>),
    Close,
}

#[derive(Debug, Default)]
struct DispatchCounters {
    forwarded: AtomicU64,
    dropped: AtomicU64,
    stale: AtomicU64,
    delivered: AtomicU64,
}

/// Point-in-time view of the bridge counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DispatchMetricsSnapshot {
    /// Samples accepted into the channel
    pub forwarded: u64,
    /// Samples lost to backpressure
    pub dropped: u64,
    /// Samples discarded because their session had ended
    pub stale: u64,
    /// Samples handed to at least one consumer
    pub delivered: u64,
    /// `dropped / (forwarded + dropped)` as a percentage
    pub drop_rate_percent: f64,
    /// Messages waiting in the channel
    pub channel_occupancy: usize,
    /// Channel size
    pub channel_capacity: usize,
}

struct Binding {
    device: Option<DeviceId>,
    consumer: Box<dyn TelemetryConsumer>,
}

impl Binding {
    fn accepts(&self, device: &DeviceId) -> bool {
        self.device.as_ref().map_or(true, |d| d == device)
    }
}

/// Builder for the consumer context. Bind consumers, then [`spawn`](Self::spawn).
pub struct DispatchBridge {
    capacity: usize,
    policy: BackpressurePolicy,
    bindings: Vec<Binding>,
}

impl DispatchBridge {
    /// Bridge with a channel of `capacity` slots (at least one).
    pub fn new(capacity: usize, policy: BackpressurePolicy) -> Self {
        Self {
            capacity: capacity.max(1),
            policy,
            bindings: Vec::new(),
        }
    }

    /// Route samples from `device` to `consumer`.
    pub fn bind(&mut self, device: &DeviceId, consumer: impl TelemetryConsumer + 'static) {
        self.bindings.push(Binding {
            device: Some(device.clone()),
            consumer: Box::new(consumer),
        });
    }

    /// Route samples from every device to `consumer`.
    pub fn bind_all(&mut self, consumer: impl TelemetryConsumer + 'static) {
        self.bindings.push(Binding {
            device: None,
            consumer: Box::new(consumer),
        });
    }

    /// Start the consumer task on the current runtime.
    pub fn spawn(self) -> AppResult<BridgeHandle> {
        let runtime = Handle::try_current()
            .map_err(|e| RigError::TaskFailed(format!("no tokio runtime: {e}")))?;
        let (tx, rx) = mpsc::channel(self.capacity);
        let counters = Arc::new(DispatchCounters::default());
        for binding in &self.bindings {
            debug!(
                consumer = binding.consumer.name(),
                device = binding.device.as_ref().map_or("*", DeviceId::as_str),
                "Consumer bound"
            );
        }
        let task = runtime.spawn(consume(rx, self.bindings, counters.clone()));

        info!(
            capacity = self.capacity,
            policy = ?self.policy,
            "Dispatch bridge started"
        );

        Ok(BridgeHandle {
            tx,
            session: Arc::new(AtomicU64::new(0)),
            policy: self.policy,
            capacity: self.capacity,
            counters,
            runtime,
            task,
        })
    }
}

async fn consume(
    mut rx: mpsc::Receiver<Dispatch>,
    mut bindings: Vec<Binding>,
    counters: Arc<DispatchCounters>,
) {
    let mut active = 0u64;
    while let Some(message) = rx.recv().await {
        match message {
            Dispatch::Sample { session, sample } => {
                if session < active {
                    counters.stale.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                let mut handled = false;
                for binding in bindings.iter_mut().filter(|b| b.accepts(&sample.device)) {
                    binding.consumer.on_sample(&sample.device, &sample);
                    handled = true;
                }
                if handled {
                    counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
            }
            Dispatch::Reset { session } => {
                active = active.max(session);
                for binding in bindings.iter_mut() {
                    binding.consumer.reset();
                }
                debug!(session = active, "Consumers reset");
            }
            Dispatch::Flush(ack) => {
                let _ = ack.send(());
            }
            Dispatch::Close => break,
        }
    }
    debug!("Dispatch consumer loop finished");
}

/// Control handle for a running bridge.
pub struct BridgeHandle {
    tx: mpsc::Sender<Dispatch>,
    session: Arc<AtomicU64>,
    policy: BackpressurePolicy,
    capacity: usize,
    counters: Arc<DispatchCounters>,
    runtime: Handle,
    task: JoinHandle<()>,
}

impl BridgeHandle {
    /// Open a new session: bump the id and reset every consumer.
    pub async fn begin_session(&self) -> AppResult<u64> {
        let session = self.session.fetch_add(1, Ordering::AcqRel) + 1;
        self.tx
            .send(Dispatch::Reset { session })
            .await
            .map_err(|_| RigError::BridgeClosed)?;
        info!(session, "Telemetry session started");
        Ok(session)
    }

    /// Id of the current session.
    pub fn current_session(&self) -> u64 {
        self.session.load(Ordering::Acquire)
    }

    /// Reset every consumer without starting a new session.
    pub async fn reset_consumers(&self) -> AppResult<()> {
        self.tx
            .send(Dispatch::Reset {
                session: self.current_session(),
            })
            .await
            .map_err(|_| RigError::BridgeClosed)
    }

    /// Sender stamped with the current session, for one worker.
    pub fn sender(&self) -> AppResult<SampleSender> {
        if self.tx.is_closed() {
            return Err(RigError::BridgeClosed);
        }
        Ok(SampleSender {
            tx: self.tx.clone(),
            session: self.current_session(),
            policy: self.policy,
            counters: self.counters.clone(),
            runtime: self.runtime.clone(),
        })
    }

    /// Wait until every message queued so far has been consumed.
    pub async fn flush(&self) -> AppResult<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Dispatch::Flush(ack))
            .await
            .map_err(|_| RigError::BridgeClosed)?;
        done.await.map_err(|_| RigError::BridgeClosed)
    }

    /// Snapshot of the counters and channel occupancy.
    pub fn metrics(&self) -> DispatchMetricsSnapshot {
        let forwarded = self.counters.forwarded.load(Ordering::Relaxed);
        let dropped = self.counters.dropped.load(Ordering::Relaxed);
        let attempted = forwarded + dropped;
        let drop_rate_percent = if attempted == 0 {
            0.0
        } else {
            dropped as f64 / attempted as f64 * 100.0
        };
        DispatchMetricsSnapshot {
            forwarded,
            dropped,
            stale: self.counters.stale.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            drop_rate_percent,
            channel_occupancy: self.capacity - self.tx.capacity(),
            channel_capacity: self.capacity,
        }
    }

    /// Drain queued messages and stop the consumer task.
    pub async fn shutdown(self) -> AppResult<()> {
        // Close is queued behind pending samples, so they are still delivered.
        if self.tx.send(Dispatch::Close).await.is_err() {
            debug!("Dispatch consumer already finished");
        }
        drop(self.tx);
        self.task
            .await
            .map_err(|e| RigError::TaskFailed(format!("dispatch consumer: {e}")))?;
        info!("Dispatch bridge stopped");
        Ok(())
    }
}

/// Worker-side end of the bridge.
#[derive(Clone)]
pub struct SampleSender {
    tx: mpsc::Sender<Dispatch>,
    session: u64,
    policy: BackpressurePolicy,
    counters: Arc<DispatchCounters>,
    runtime: Handle,
}

impl SampleSender {
    /// Session this sender stamps onto samples.
    pub fn session(&self) -> u64 {
        self.session
    }

    /// Hand one sample to the consumer context.
    ///
    /// Blocking call for worker threads; must not be used from async code under
    /// [`BackpressurePolicy::Block`]. A sample lost to backpressure is counted and
    /// returns `Ok`. Only a closed bridge is an error.
    pub fn forward(&self, sample: Sample) -> AppResult<()> {
        let message = Dispatch::Sample {
            session: self.session,
            sample,
        };
        match self.tx.try_send(message) {
            Ok(()) => {
                self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(RigError::BridgeClosed),
            Err(mpsc::error::TrySendError::Full(message)) => match self.policy {
                BackpressurePolicy::DropNewest => {
                    self.record_drop(message);
                    Ok(())
                }
                BackpressurePolicy::Block { timeout } => {
                    match self.runtime.block_on(self.tx.send_timeout(message, timeout)) {
                        Ok(()) => {
                            self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
                            Ok(())
                        }
                        Err(mpsc::error::SendTimeoutError::Timeout(message)) => {
                            self.record_drop(message);
                            Ok(())
                        }
                        Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                            Err(RigError::BridgeClosed)
                        }
                    }
                }
            },
        }
    }

    fn record_drop(&self, message: Dispatch) {
        let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if dropped == 1 || dropped % DROP_LOG_INTERVAL == 0 {
            if let Dispatch::Sample { sample, .. } = message {
                warn!(
                    device = %sample.device,
                    dropped_total = dropped,
                    "Consumer channel full, dropping sample"
                );
            }
        }
    }
}
