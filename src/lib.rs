//! Build-farm dispatcher.
//!
//! One [`scanner::WorkerScanner`] per worker polls that worker on a fixed
//! interval, keeps its job state in sync with the shared store, dispatches
//! new jobs and, when anything goes wrong, lets [`failure::FailureTracker`]
//! decide whether the worker or the job is to blame.

pub mod config;
pub mod dashboard;
pub mod error;
pub mod failure;
pub mod farm;
pub mod fleet;
pub mod manager;
pub mod pipeline;
pub mod pump;
pub mod scanner;
pub mod shutdown;
pub mod store;
pub mod worker;
