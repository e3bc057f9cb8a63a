//! `wardsync-core`: job model and idempotency keys.
//!
//! This crate contains **pure** building blocks (no I/O): the job record that
//! the queue persists and the deterministic key derivation the server relies
//! on to deduplicate deliveries.

pub mod error;
pub mod id;
pub mod idempotency;
pub mod job;

pub use error::{ValidationError, ValidationResult};
pub use id::JobId;
pub use idempotency::IdempotencyKey;
pub use job::{Job, JobMetadata, NewJob, PATIENT_ID};
