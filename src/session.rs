//! Control context for one acquisition session.
//!
//! A [`Session`] owns the device registry, the shared [`RunState`], the dispatch
//! bridge handle and the join handles of the running workers. All user commands
//! go through it:
//!
//! - `start` from `Idle` or `Stopped` opens a fresh bridge session (consumers are
//!   reset) and spawns one worker per active device. From `Paused` it only
//!   resumes the existing workers.
//! - `pause` leaves workers attached and idle.
//! - `stop` lets workers exit and joins them. Device handles stay open so the
//!   next `start` does not reopen ports.
//!
//! In every case the run state changes first, then the control literal is
//! broadcast to every non-faulted device. A failed write is logged and does not
//! abort the command.

use crate::acquisition::{AcquisitionWorker, WorkerReport, WorkerSettings};
use crate::device::{DeviceId, DeviceRegistry, DeviceState};
use crate::dispatch::{BridgeHandle, DispatchMetricsSnapshot};
use crate::error::{AppResult, RigError};
use crate::protocol::{ConfigCommand, ControlMessage, CycleCommand};
use crate::run_state::{RunCommand, RunState, RunStateKind};
use futures::future::join_all;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Run control over every open device.
pub struct Session {
    registry: DeviceRegistry,
    run_state: Arc<RunState>,
    bridge: BridgeHandle,
    settings: WorkerSettings,
    workers: Vec<JoinHandle<WorkerReport>>,
}

impl Session {
    /// Session in `Idle` over `registry`, feeding `bridge`.
    pub fn new(registry: DeviceRegistry, bridge: BridgeHandle, settings: WorkerSettings) -> Self {
        Self {
            registry,
            run_state: Arc::new(RunState::new()),
            bridge,
            settings,
            workers: Vec::new(),
        }
    }

    /// Devices under control.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Handle to the consumer context.
    pub fn bridge(&self) -> &BridgeHandle {
        &self.bridge
    }

    /// Current run state.
    pub fn run_state(&self) -> RunStateKind {
        self.run_state.load()
    }

    /// Number of workers spawned and not yet joined.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// State of every open device, ordered by id.
    pub fn device_states(&self) -> Vec<(DeviceId, DeviceState)> {
        self.registry
            .devices()
            .map(|d| (d.id().clone(), d.state()))
            .collect()
    }

    /// Dispatch counters.
    pub fn metrics(&self) -> DispatchMetricsSnapshot {
        self.bridge.metrics()
    }

    /// Send a stage configuration to one device.
    pub async fn configure(&self, device: &DeviceId, command: ConfigCommand) -> AppResult<()> {
        self.registry
            .get(device)?
            .send(&ControlMessage::Config(command))
            .await
    }

    /// Send a cycle program to one device.
    pub async fn send_cycle(&self, device: &DeviceId, command: CycleCommand) -> AppResult<()> {
        self.registry
            .get(device)?
            .send(&ControlMessage::Cycle(command))
            .await
    }

    /// Start or resume the run. Returns the bridge session id.
    pub async fn start(&mut self) -> AppResult<u64> {
        let (previous, _) = self.run_state.apply(RunCommand::Start)?;
        if previous == RunStateKind::Paused {
            self.broadcast(RunCommand::Start).await;
            let session = self.bridge.current_session();
            info!(session, "Run resumed");
            return Ok(session);
        }

        // Lines still buffered from the previous run must not land in this one.
        for device in self.registry.active_devices() {
            if let Err(e) = device.clear_input().await {
                warn!(device = %device.id(), error = %e, "Failed to discard pending input");
            }
        }
        self.broadcast(RunCommand::Start).await;

        let session = self.bridge.begin_session().await?;
        for device in self.registry.active_devices() {
            let worker = AcquisitionWorker::new(
                device.clone(),
                self.run_state.clone(),
                self.bridge.sender()?,
                self.settings,
            );
            self.workers.push(worker.spawn());
        }
        info!(session, workers = self.workers.len(), "Run started");
        Ok(session)
    }

    /// Pause the run; workers stay attached but stop reading.
    pub async fn pause(&mut self) -> AppResult<()> {
        self.run_state.apply(RunCommand::Pause)?;
        self.broadcast(RunCommand::Pause).await;
        info!("Run paused");
        Ok(())
    }

    /// Stop the run and join every worker.
    ///
    /// Samples already forwarded are delivered to the consumers before this
    /// returns.
    pub async fn stop(&mut self) -> AppResult<Vec<WorkerReport>> {
        self.run_state.apply(RunCommand::Stop)?;
        self.broadcast(RunCommand::Stop).await;
        let reports = self.join_workers().await;
        self.bridge.flush().await?;
        info!(workers = reports.len(), "Run stopped");
        Ok(reports)
    }

    /// Clear every consumer without changing the run state.
    pub async fn clear(&self) -> AppResult<()> {
        self.bridge.reset_consumers().await
    }

    /// Stop if running, shut down the bridge and close every device.
    pub async fn shutdown(mut self) -> AppResult<()> {
        let mut errors = Vec::new();
        if matches!(
            self.run_state(),
            RunStateKind::Running | RunStateKind::Paused
        ) {
            if let Err(e) = self.stop().await {
                errors.push(e);
            }
        }
        if let Err(e) = self.bridge.shutdown().await {
            errors.push(e);
        }
        self.registry.close_all().await;

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(RigError::ShutdownFailed(errors)),
        }
    }

    async fn broadcast(&self, command: RunCommand) {
        let message = command.message();
        for device in self.registry.active_devices() {
            if let Err(e) = device.send(&message).await {
                warn!(device = %device.id(), command = %command, error = %e, "Control broadcast failed");
            }
        }
    }

    async fn join_workers(&mut self) -> Vec<WorkerReport> {
        let results = join_all(self.workers.drain(..)).await;
        results
            .into_iter()
            .filter_map(|result| match result {
                Ok(report) => Some(report),
                Err(e) => {
                    error!(error = %e, "Acquisition worker panicked");
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::{MockBackend, MockLink};
    use crate::dispatch::{BackpressurePolicy, DispatchBridge};
    use crate::protocol::StageId;

    async fn session_with(link: &MockLink) -> Session {
        let mut registry =
            DeviceRegistry::new(Box::new(MockBackend::new().with_port("/dev/ttyACM0", link.clone())));
        registry.open_all().unwrap();
        let bridge = DispatchBridge::new(64, BackpressurePolicy::DropNewest)
            .spawn()
            .unwrap();
        Session::new(registry, bridge, WorkerSettings::default())
    }

    #[tokio::test]
    async fn test_invalid_transition_sends_nothing() {
        let link = MockLink::new();
        let mut session = session_with(&link).await;
        let err = session.pause().await.unwrap_err();
        assert!(matches!(
            err,
            RigError::InvalidTransition {
                from: RunStateKind::Idle,
                command: RunCommand::Pause
            }
        ));
        assert!(session.stop().await.is_err());
        assert!(link.written_lines().is_empty());
        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_configure_unknown_device() {
        let link = MockLink::new();
        let session = session_with(&link).await;
        let command = ConfigCommand {
            ghr: "1".into(),
            tpi: "2".into(),
            resolution: "3".into(),
            quadrature: "4".into(),
            stage: StageId::A,
        };
        let err = session
            .configure(&DeviceId::new("ttyACM9"), command)
            .await
            .unwrap_err();
        assert!(matches!(err, RigError::UnknownDevice(_)));
        session.shutdown().await.unwrap();
    }
}
