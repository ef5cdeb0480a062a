//! Plain data records for the build farm.
//!
//! These are what the store hands out and takes back. They carry no lazy
//! references: a [`Worker`] names its current job by id, a [`Job`] names its
//! worker by name, and callers look the other side up explicitly.

pub mod job;
pub mod worker;

pub use job::{Job, JobId, JobStatus};
pub use worker::{Capabilities, Worker};
