//! # Test Rig DAQ Library
//!
//! Acquisition and control for mechanical test rigs built from several
//! microcontroller-based controllers, each reached over a USB serial link. The
//! library discovers and opens the controllers, pushes stage and cycle
//! configuration, and coordinates a start/pause/stop run across all of them
//! while streaming their JSON telemetry into per-device sinks.
//!
//! ## Crate Structure
//!
//! - **`device`**: `Device` handles, the `DeviceRegistry` that discovers and owns
//!   them, and in-memory mock links for tests.
//! - **`protocol`**: outbound command encoding and inbound telemetry decoding.
//! - **`run_state`**: the shared `RunState` every worker observes.
//! - **`acquisition`**: one blocking `AcquisitionWorker` per device during a run.
//! - **`dispatch`**: the bounded bridge from workers into the consumer context.
//! - **`consumer`**: the `TelemetryConsumer` trait with table and chart sinks.
//! - **`session`**: the control context tying the above together.
//! - **`storage`** / **`analysis`**: CSV export and threshold summaries.
//! - **`config`**, **`tracing_setup`**, **`error`**: the ambient stack.
//!
//! ## Threading model
//!
//! Workers run on tokio's blocking pool and only ever talk to their own device
//! and the dispatch bridge. All consumer callbacks run in a single task spawned
//! by the bridge. Control commands run on the caller's task and write to the
//! devices through the same per-device lock the workers read under.

pub mod acquisition;
pub mod analysis;
pub mod config;
pub mod consumer;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod run_state;
pub mod session;
pub mod storage;
pub mod tracing_setup;

pub use error::{AppResult, RigError};
