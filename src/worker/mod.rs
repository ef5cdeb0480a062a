//! Remote build workers.
//!
//! - [`WorkerHandle`]: the call/response contract a scanner relies on
//!   (status, dispatch, abort, clean, reset, file retrieval)
//! - [`HttpWorkerClient`]: JSON-over-HTTP implementation with a per-call
//!   timeout
//! - [`WorkerConnector`]: turns a stored [`Worker`](crate::farm::Worker)
//!   record into a handle
//!
//! Status replies are decoded into the closed [`WorkerStatus`] enum. A reply
//! naming a state outside it is a protocol violation, not a silent no-op.

pub mod handle;
pub mod http;

pub use handle::{BuildResult, DispatchRequest, WorkerConnector, WorkerHandle, WorkerStatus};
pub use http::{HttpConnector, HttpWorkerClient};
