//! Jobs: the durable unit of pending work.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ValidationError, ValidationResult};
use crate::id::JobId;
use crate::idempotency::{self, IdempotencyKey};

/// Metadata key conventionally used to correlate a job with a patient.
pub const PATIENT_ID: &str = "patient_id";

/// Free-form string metadata carried next to the payload for UI correlation.
pub type JobMetadata = BTreeMap<String, String>;

/// A bundle waiting to be delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub payload: Value,
    #[serde(default)]
    pub metadata: JobMetadata,
    /// Set once at first enqueue; defines FIFO order.
    pub created_at: DateTime<Utc>,
    /// Incremented every time a delivery attempt begins.
    #[serde(default)]
    pub tries: u32,
    pub idempotency_key: IdempotencyKey,
}

impl Job {
    pub fn patient_id(&self) -> Option<&str> {
        self.metadata.get(PATIENT_ID).map(String::as_str)
    }
}

/// Request to enqueue a job.
///
/// Only the payload is required; the id is generated and the idempotency key
/// derived from the payload when they are not supplied.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub id: Option<JobId>,
    pub payload: Value,
    pub metadata: JobMetadata,
    pub idempotency_key: Option<IdempotencyKey>,
}

impl NewJob {
    pub fn new(payload: Value) -> Self {
        Self {
            id: None,
            payload,
            metadata: JobMetadata::new(),
            idempotency_key: None,
        }
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_patient(self, patient_id: impl Into<String>) -> Self {
        self.with_metadata(PATIENT_ID, patient_id)
    }

    pub fn with_idempotency_key(mut self, key: IdempotencyKey) -> Self {
        self.idempotency_key = Some(key);
        self
    }

    /// Check the request and materialise it into a job created at `now`.
    pub fn into_job(self, now: DateTime<Utc>) -> ValidationResult<Job> {
        validate_payload(&self.payload)?;

        let idempotency_key = self
            .idempotency_key
            .unwrap_or_else(|| idempotency::derive(&self.payload));

        Ok(Job {
            id: self.id.unwrap_or_else(JobId::generate),
            payload: self.payload,
            metadata: self.metadata,
            created_at: now,
            tries: 0,
            idempotency_key,
        })
    }
}

/// Structural check applied before anything is stored.
pub fn validate_payload(payload: &Value) -> ValidationResult<()> {
    let kind = match payload {
        Value::Object(_) => return Ok(()),
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
    };
    Err(ValidationError::PayloadNotObject(kind))
}
