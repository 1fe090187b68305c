//! Streaming coordinator
//!
//! One task per in-flight synthesis job. It pulls chunks from the
//! backend's bounded channel and pushes them onto the session's bounded
//! outbound queue, so a slow client pauses production instead of growing
//! memory. Cancellation is cooperative: the stop signal is observed
//! between chunks, and dropping the chunk receiver abandons the producer
//! at its next send.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot, watch};

use speech_gateway_protocol::{ServerFrame, Subtitle};
use speech_gateway_synth::{ChunkReceiver, SynthesisError};

use crate::registry::SessionHandle;

/// One frame queued for the transport writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// JSON control frame
    Control(String),
    /// Raw binary audio, no envelope
    Audio(Vec<u8>),
}

/// Terminal result of one job, reported back to the session task
#[derive(Debug)]
pub enum JobOutcome {
    /// Every chunk was queued for delivery
    Completed { chunks: u64 },
    /// Stop or disconnect cancelled the job mid-stream
    Cancelled,
    /// The backend reported an error
    Failed(SynthesisError),
    /// The client send path stalled past the configured timeout
    SendTimeout,
}

/// Everything a coordinator task needs for one job
pub struct JobContext {
    pub task_id: String,
    pub job_seq: u64,
    /// Cleaned text, kept for subtitle estimates
    pub text: String,
    pub enable_subtitle: bool,
    pub send_timeout: Duration,
    pub outbound: mpsc::Sender<OutboundFrame>,
    pub cancel: watch::Receiver<bool>,
    /// Keeps the session's activity fresh while chunks flow
    pub handle: Arc<SessionHandle>,
}

/// Spawn the coordinator for one job. The outcome arrives exactly once on
/// the returned receiver.
pub fn spawn_job(chunks: ChunkReceiver, ctx: JobContext) -> oneshot::Receiver<JobOutcome> {
    let (done_tx, done_rx) = oneshot::channel();
    tokio::spawn(async move {
        let outcome = run_job(chunks, ctx).await;
        let _ = done_tx.send(outcome);
    });
    done_rx
}

async fn run_job(mut chunks: ChunkReceiver, mut ctx: JobContext) -> JobOutcome {
    let mut delivered = 0u64;

    // Best-effort progress frame before the first chunk.
    if ctx.enable_subtitle {
        let frame = ServerFrame::sentence_synthesis(&ctx.task_id, vec![Subtitle::estimate(&ctx.text)]);
        if queue_control(&mut ctx, frame).await.is_err() {
            return JobOutcome::Cancelled;
        }
    }

    let outcome = loop {
        let next = tokio::select! {
            result = chunks.recv() => result,
            changed = ctx.cancel.changed() => {
                // A dropped sender counts as cancellation.
                if changed.is_err() || *ctx.cancel.borrow() {
                    break JobOutcome::Cancelled;
                }
                continue;
            }
        };

        match next {
            // Closed channel with no prior error: the sequence completed.
            None => break JobOutcome::Completed { chunks: delivered },
            Some(Ok(chunk)) => {
                ctx.handle.touch();
                match queue_audio(&mut ctx, chunk.data).await {
                    Ok(()) => delivered += 1,
                    Err(QueueError::Stalled) => break JobOutcome::SendTimeout,
                    Err(QueueError::Gone) => break JobOutcome::Cancelled,
                }
            }
            Some(Err(e)) => break JobOutcome::Failed(e),
        }
    };

    // Dropping the receiver here abandons the backend producer at its
    // next yield point; undelivered chunks are discarded.
    drop(chunks);

    tracing::debug!(
        task_id = %ctx.task_id,
        job = ctx.job_seq,
        delivered,
        outcome = ?std::mem::discriminant(&outcome),
        "job finished"
    );
    outcome
}

enum QueueError {
    /// Queue stayed full past the send timeout
    Stalled,
    /// Writer went away (disconnect) or stop arrived mid-push
    Gone,
}

async fn queue_audio(ctx: &mut JobContext, data: Vec<u8>) -> Result<(), QueueError> {
    queue_frame(ctx, OutboundFrame::Audio(data)).await
}

async fn queue_control(ctx: &mut JobContext, frame: ServerFrame) -> Result<(), QueueError> {
    match frame.to_json() {
        Ok(json) => queue_frame(ctx, OutboundFrame::Control(json)).await,
        Err(e) => {
            tracing::error!(task_id = %ctx.task_id, error = %e, "control frame serialization failed");
            Ok(())
        }
    }
}

/// Push one frame, pausing on a full queue. A stop request must stay
/// observable while paused, so the timed send races the cancel signal.
async fn queue_frame(ctx: &mut JobContext, frame: OutboundFrame) -> Result<(), QueueError> {
    let mut send = std::pin::pin!(ctx.outbound.send_timeout(frame, ctx.send_timeout));
    loop {
        tokio::select! {
            result = &mut send => {
                return match result {
                    Ok(()) => Ok(()),
                    Err(SendTimeoutError::Timeout(_)) => Err(QueueError::Stalled),
                    Err(SendTimeoutError::Closed(_)) => Err(QueueError::Gone),
                };
            }
            changed = ctx.cancel.changed() => {
                if changed.is_err() || *ctx.cancel.borrow() {
                    return Err(QueueError::Gone);
                }
                // Spurious wake; the frame stays in flight.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SessionRegistry;
    use speech_gateway_protocol::AudioFormat;
    use speech_gateway_synth::{SineBackend, SynthesisBackend, SynthesisRequest};

    fn handle() -> Arc<SessionHandle> {
        let registry = SessionRegistry::new(4, Duration::from_secs(60), Duration::from_secs(60));
        registry.register("t-1").unwrap().0
    }

    fn context(
        outbound: mpsc::Sender<OutboundFrame>,
        cancel: watch::Receiver<bool>,
        enable_subtitle: bool,
    ) -> JobContext {
        JobContext {
            task_id: "t-1".to_string(),
            job_seq: 1,
            text: "hello world".to_string(),
            enable_subtitle,
            send_timeout: Duration::from_millis(100),
            outbound,
            cancel,
            handle: handle(),
        }
    }

    async fn backend_chunks(text: &str) -> ChunkReceiver {
        SineBackend::default()
            .synthesize(SynthesisRequest {
                text: text.to_string(),
                voice: "default".to_string(),
                speed: 1.0,
                volume: 50,
                format: AudioFormat::Pcm,
                sample_rate: 16000,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_all_chunks_delivered_in_order() {
        let (tx, mut rx) = mpsc::channel(64);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let chunks = backend_chunks("a fairly long fragment of text to synthesize").await;

        let done = spawn_job(chunks, context(tx, cancel_rx, false));

        let mut audio_frames = 0u64;
        while let Some(frame) = rx.recv().await {
            match frame {
                OutboundFrame::Audio(data) => {
                    assert!(!data.is_empty());
                    audio_frames += 1;
                }
                OutboundFrame::Control(_) => panic!("no control frames expected"),
            }
        }

        match done.await.unwrap() {
            JobOutcome::Completed { chunks } => assert_eq!(chunks, audio_frames),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(audio_frames >= 1);
    }

    #[tokio::test]
    async fn test_subtitle_frame_precedes_audio() {
        let (tx, mut rx) = mpsc::channel(64);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let chunks = backend_chunks("hello").await;

        let _done = spawn_job(chunks, context(tx, cancel_rx, true));

        let first = rx.recv().await.unwrap();
        match first {
            OutboundFrame::Control(json) => {
                assert!(json.contains("SentenceSynthesis"));
                assert!(json.contains("subtitles"));
            }
            OutboundFrame::Audio(_) => panic!("subtitle frame must come first"),
        }
    }

    #[tokio::test]
    async fn test_cancel_stops_the_stream() {
        let (tx, mut rx) = mpsc::channel(2);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        // Slow producer so cancellation lands mid-stream.
        let backend = SineBackend {
            chunk_delay: Duration::from_millis(20),
            ..Default::default()
        };
        let chunks = backend
            .synthesize(SynthesisRequest {
                text: "a long text that produces many chunks over time".to_string(),
                voice: "default".to_string(),
                speed: 1.0,
                volume: 50,
                format: AudioFormat::Pcm,
                sample_rate: 16000,
            })
            .await
            .unwrap();

        let done = spawn_job(chunks, context(tx, cancel_rx, false));

        // Let a chunk or two through, then cancel.
        let _ = rx.recv().await;
        cancel_tx.send(true).unwrap();

        assert!(matches!(done.await.unwrap(), JobOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_dropped_cancel_sender_acts_as_cancellation() {
        let (tx, mut rx) = mpsc::channel(2);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let backend = SineBackend {
            chunk_delay: Duration::from_millis(20),
            ..Default::default()
        };
        let chunks = backend
            .synthesize(SynthesisRequest {
                text: "a long text that produces many chunks over time".to_string(),
                voice: "default".to_string(),
                speed: 1.0,
                volume: 50,
                format: AudioFormat::Pcm,
                sample_rate: 16000,
            })
            .await
            .unwrap();

        let done = spawn_job(chunks, context(tx, cancel_rx, false));

        let _ = rx.recv().await;
        drop(cancel_tx);

        assert!(matches!(done.await.unwrap(), JobOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_stalled_consumer_times_out() {
        // Capacity 1 and nobody reading: the queue fills immediately.
        let (tx, _rx) = mpsc::channel(1);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let chunks = backend_chunks("a fairly long fragment of text to synthesize").await;

        let mut ctx = context(tx, cancel_rx, false);
        ctx.send_timeout = Duration::from_millis(20);

        let done = spawn_job(chunks, ctx);
        assert!(matches!(done.await.unwrap(), JobOutcome::SendTimeout));
    }

    #[tokio::test]
    async fn test_backend_error_is_reported() {
        let (tx, _rx) = mpsc::channel(64);
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let (chunk_tx, chunk_rx) = mpsc::channel(4);
        chunk_tx
            .send(Err(SynthesisError::Job("decoder blew up".to_string())))
            .await
            .unwrap();
        drop(chunk_tx);

        let done = spawn_job(chunk_rx, context(tx, cancel_rx, false));
        match done.await.unwrap() {
            JobOutcome::Failed(SynthesisError::Job(msg)) => assert_eq!(msg, "decoder blew up"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
