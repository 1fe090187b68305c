//! The synthesis backend seam
//!
//! A backend turns one text fragment into a finite, non-restartable
//! sequence of audio chunks. Chunks arrive over a bounded channel, so a
//! slow consumer pauses the producer instead of growing memory.

use std::f32::consts::TAU;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use speech_gateway_protocol::AudioFormat;

use crate::SynthesisError;

/// One synthesis job handed to a backend
#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice: String,
    /// Speed factor, 0.5..=2.0
    pub speed: f32,
    /// Volume, 0..=100
    pub volume: u32,
    pub format: AudioFormat,
    pub sample_rate: u32,
}

/// One chunk of produced audio; indices are contiguous from zero
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub index: u64,
    pub data: Vec<u8>,
}

/// Chunk stream handed back by a backend. A closed channel without a
/// prior error means the sequence completed.
pub type ChunkReceiver = mpsc::Receiver<Result<AudioChunk, SynthesisError>>;

/// Capacity of the producer-side chunk channel. Small on purpose: the
/// session's outbound queue does the real buffering.
pub const BACKEND_CHANNEL_CAPACITY: usize = 8;

/// An opaque synthesis capability bound to one compute device.
#[async_trait]
pub trait SynthesisBackend: Send + Sync {
    /// Start producing chunks for `request`. Returns once production has
    /// begun; the chunks themselves arrive lazily on the receiver.
    async fn synthesize(&self, request: SynthesisRequest) -> Result<ChunkReceiver, SynthesisError>;
}

/// Deterministic tone generator standing in for a real model runtime.
///
/// Produces 16-bit PCM sine chunks sized by `chunk_ms`, one chunk per
/// `chunk_ms` of estimated speech (80 ms per character, scaled by speed).
/// Useful for wiring, demos, and tests; never for production audio.
#[derive(Debug, Clone)]
pub struct SineBackend {
    /// Milliseconds of audio per chunk
    pub chunk_ms: u32,
    /// Artificial per-chunk production delay, zero in tests
    pub chunk_delay: Duration,
    /// Tone frequency in Hz
    pub frequency: f32,
}

impl Default for SineBackend {
    fn default() -> Self {
        Self {
            chunk_ms: 100,
            chunk_delay: Duration::ZERO,
            frequency: 440.0,
        }
    }
}

impl SineBackend {
    fn render_chunk(&self, request: &SynthesisRequest, chunk_index: u64) -> Vec<u8> {
        let samples_per_chunk = (request.sample_rate as u64 * self.chunk_ms as u64 / 1000) as usize;
        let gain = request.volume as f32 / 100.0;
        let mut data = Vec::with_capacity(samples_per_chunk * 2);

        let base = chunk_index * samples_per_chunk as u64;
        for i in 0..samples_per_chunk {
            let t = (base + i as u64) as f32 / request.sample_rate as f32;
            let sample = (t * self.frequency * TAU).sin() * gain;
            let pcm = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
            data.extend_from_slice(&pcm.to_le_bytes());
        }

        data
    }

    fn chunk_count(&self, request: &SynthesisRequest) -> u64 {
        let speech_ms = (request.text.chars().count() as f32 * 80.0 / request.speed) as u64;
        (speech_ms / self.chunk_ms as u64).max(1)
    }
}

#[async_trait]
impl SynthesisBackend for SineBackend {
    async fn synthesize(&self, request: SynthesisRequest) -> Result<ChunkReceiver, SynthesisError> {
        if request.text.is_empty() {
            return Err(SynthesisError::Job("empty text".to_string()));
        }

        let (tx, rx) = mpsc::channel(BACKEND_CHANNEL_CAPACITY);
        let backend = self.clone();
        let total = self.chunk_count(&request);

        tokio::spawn(async move {
            for index in 0..total {
                if !backend.chunk_delay.is_zero() {
                    tokio::time::sleep(backend.chunk_delay).await;
                }
                let chunk = AudioChunk {
                    index,
                    data: backend.render_chunk(&request, index),
                };
                // Receiver dropped means the job was cancelled; stop producing.
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }
}
