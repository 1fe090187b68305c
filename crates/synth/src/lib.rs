//! Backend capability seam and replica routing
//!
//! A replica is one synthesis execution unit bound to a compute device,
//! with a bounded number of concurrent jobs. The router hands sessions a
//! replica slot for their whole lifetime; the backend trait hides what the
//! device actually runs.

pub mod backend;
pub mod catalog;
pub mod replica;

pub use backend::{AudioChunk, ChunkReceiver, SineBackend, SynthesisBackend, SynthesisRequest};
pub use catalog::{BackendFamily, VoiceCatalog};
pub use replica::{Replica, ReplicaConfig, ReplicaRouter, ReplicaSlot, RouterBusy};

use thiserror::Error;

/// Failures raised by a backend while producing audio
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SynthesisError {
    /// The compute device itself is gone; nothing on this replica will
    /// succeed until it is reinstated.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// This job failed; the replica is otherwise fine.
    #[error("synthesis failed: {0}")]
    Job(String),

    #[error("unknown voice: {0}")]
    UnknownVoice(String),
}

impl SynthesisError {
    /// Recoverable failures are isolated to one job; unrecoverable ones
    /// poison the replica the session is affine to.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::DeviceUnavailable(_))
    }
}
