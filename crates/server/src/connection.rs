//! WebSocket connection handling
//!
//! One task per connection runs the control loop; a writer task drains the
//! bounded outbound queue into the socket; each accepted job runs its own
//! coordinator task. The control loop never waits on audio production: it
//! selects over the client stream, the active job's terminal event, and
//! the registry's eviction signal.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};

use speech_gateway_protocol::{
    status, text, ClientMessage, ProtocolError, ServerFrame, StartParams, Subtitle, MAX_TEXT_LEN,
};
use speech_gateway_synth::{ReplicaSlot, SynthesisError, SynthesisRequest};

use crate::registry::SessionHandle;
use crate::session::{SessionEvent, SessionState};
use crate::state::AppState;
use crate::streaming::{spawn_job, JobContext, JobOutcome, OutboundFrame};
use crate::ServerError;

/// Name of the header carrying the optional access token
pub const TOKEN_HEADER: &str = "X-NLS-Token";

/// What the control loop should do after handling one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// WebSocket upgrade handler for the synthesis endpoint.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let authorized = token_authorized(&headers, state.config.auth.token.as_deref());
    ws.on_upgrade(move |socket| handle_socket(socket, state, authorized))
}

fn token_authorized(headers: &HeaderMap, expected: Option<&str>) -> bool {
    match expected {
        Some(expected) => headers
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v == expected)
            .unwrap_or(false),
        None => true,
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, authorized: bool) {
    let (ws_tx, mut ws_rx) = socket.split();
    let send_timeout = Duration::from_millis(state.config.streaming.send_timeout_ms);
    let queue_capacity = state.config.streaming.outbound_queue_capacity;

    let (outbound_tx, outbound_rx) = mpsc::channel(queue_capacity);
    let writer = tokio::spawn(write_frames(ws_tx, outbound_rx, send_timeout));

    let mut conn = Connection::new(state, outbound_tx);

    if !authorized {
        conn.reject_unauthorized().await;
    } else {
        run_control_loop(&mut conn, &mut ws_rx).await;
    }

    conn.teardown();
    drop(conn);
    let _ = writer.await;
}

async fn run_control_loop(conn: &mut Connection, ws_rx: &mut SplitStream<WebSocket>) {
    loop {
        let flow = match conn.next_wakeup(ws_rx).await {
            Wakeup::Client(Some(Ok(Message::Text(raw)))) => conn.on_text(&raw).await,
            Wakeup::Client(Some(Ok(Message::Binary(_)))) => {
                // The data plane is server-to-client only.
                tracing::debug!("ignoring client binary frame");
                Flow::Continue
            }
            Wakeup::Client(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => Flow::Continue,
            Wakeup::Client(Some(Ok(Message::Close(_)))) | Wakeup::Client(None) => Flow::Close,
            Wakeup::Client(Some(Err(e))) => {
                tracing::debug!(error = %e, "websocket receive failed");
                Flow::Close
            }
            Wakeup::Job(outcome) => conn.on_job_outcome(outcome).await,
            Wakeup::Evicted => {
                tracing::info!("session evicted while connected");
                Flow::Close
            }
        };

        if flow == Flow::Close {
            break;
        }
    }
}

/// Writer half: drains the outbound queue into the socket. A send that
/// stalls past the timeout abandons the connection rather than blocking
/// the queue forever.
async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<OutboundFrame>,
    send_timeout: Duration,
) {
    while let Some(frame) = rx.recv().await {
        let msg = match frame {
            OutboundFrame::Control(json) => Message::Text(json),
            OutboundFrame::Audio(data) => Message::Binary(data),
        };
        match tokio::time::timeout(send_timeout, sink.send(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "websocket send failed");
                break;
            }
            Err(_) => {
                tracing::warn!("websocket send stalled past timeout, closing");
                break;
            }
        }
    }
    let _ = sink.close().await;
}

enum Wakeup {
    Client(Option<Result<Message, axum::Error>>),
    Job(JobOutcome),
    Evicted,
}

struct RunningJob {
    seq: u64,
    text: String,
    cancel: watch::Sender<bool>,
    done: oneshot::Receiver<JobOutcome>,
}

struct ActiveSession {
    handle: Arc<SessionHandle>,
    cancel_rx: watch::Receiver<bool>,
    machine: SessionState,
    params: StartParams,
    speed: f32,
    slot: ReplicaSlot,
    next_seq: u64,
    job: Option<RunningJob>,
}

/// Per-connection protocol driver.
///
/// Owns the session exclusively; nothing here is shared with other
/// connections except the registry and the replica pool.
pub struct Connection {
    state: AppState,
    outbound: mpsc::Sender<OutboundFrame>,
    session: Option<ActiveSession>,
}

impl Connection {
    pub fn new(state: AppState, outbound: mpsc::Sender<OutboundFrame>) -> Self {
        Self {
            state,
            outbound,
            session: None,
        }
    }

    pub fn session_state(&self) -> Option<SessionState> {
        self.session.as_ref().map(|s| s.machine)
    }

    /// Device the session is affine to, fixed at start for its lifetime.
    pub fn assigned_device(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.slot.replica().device_id())
    }

    async fn next_wakeup(&mut self, ws_rx: &mut SplitStream<WebSocket>) -> Wakeup {
        match self.session.as_mut() {
            Some(session) => {
                let cancel = &mut session.cancel_rx;
                match session.job.as_mut() {
                    Some(job) => tokio::select! {
                        msg = ws_rx.next() => Wakeup::Client(msg),
                        outcome = &mut job.done => Wakeup::Job(coordinator_outcome(outcome)),
                        _ = cancel.changed() => Wakeup::Evicted,
                    },
                    None => tokio::select! {
                        msg = ws_rx.next() => Wakeup::Client(msg),
                        _ = cancel.changed() => Wakeup::Evicted,
                    },
                }
            }
            None => Wakeup::Client(ws_rx.next().await),
        }
    }

    /// Handle one client control frame.
    pub async fn on_text(&mut self, raw: &str) -> Flow {
        // A failed or draining session accepts nothing further.
        if let Some(session) = &self.session {
            if session.machine.is_terminal() {
                tracing::debug!("ignoring message on terminal session");
                return Flow::Continue;
            }
        }

        let msg = match ClientMessage::parse(raw) {
            Ok(msg) => msg,
            Err(e) => {
                let task_id = self.current_task_id().unwrap_or_default();
                return self.fail_now(&task_id, ServerError::Protocol(e)).await;
            }
        };

        match msg {
            ClientMessage::Start {
                task_id,
                appkey,
                params,
                ..
            } => self.on_start(task_id, appkey, params).await,
            ClientMessage::Run { task_id, text, .. } => self.on_run(&task_id, text).await,
            ClientMessage::Stop { task_id, .. } => self.on_stop(&task_id).await,
        }
    }

    async fn on_start(
        &mut self,
        task_id: String,
        appkey: Option<String>,
        params: StartParams,
    ) -> Flow {
        if self.session.is_some() {
            return self
                .fail_now(
                    &task_id,
                    ServerError::Violation("StartSynthesis already received".to_string()),
                )
                .await;
        }
        if task_id.is_empty() {
            let err = ProtocolError::invalid_parameter("task_id", "must not be empty");
            return self.fail_now(&task_id, ServerError::Protocol(err)).await;
        }

        if let Some(expected) = &self.state.config.auth.appkey {
            if appkey.as_deref() != Some(expected.as_str()) {
                return self
                    .fail_now(&task_id, ServerError::Auth("appkey mismatch".to_string()))
                    .await;
            }
        }
        if let Err(e) = params.validate() {
            return self.fail_now(&task_id, ServerError::Protocol(e)).await;
        }
        if self.state.catalog.resolve(&params.voice).is_none() {
            let err = SynthesisError::UnknownVoice(params.voice.clone());
            return self.fail_now(&task_id, ServerError::Synthesis(err)).await;
        }

        let (handle, cancel_rx) = match self.state.registry.register(&task_id) {
            Ok(registered) => registered,
            Err(e) => return self.fail_now(&task_id, ServerError::Registry(e)).await,
        };

        let slot = match self.state.router.assign() {
            Ok(slot) => slot,
            Err(busy) => {
                self.state.registry.deregister(&handle);
                return self.fail_now(&task_id, ServerError::Busy(busy)).await;
            }
        };

        tracing::info!(
            task_id,
            session_id = %handle.session_id(),
            device = %slot.replica().device_id(),
            voice = %params.voice,
            "session started"
        );

        let started = ServerFrame::synthesis_started(&task_id, handle.session_id());
        self.send_frame(started).await;

        let speed = text::speech_rate_to_speed(params.speech_rate);
        self.session = Some(ActiveSession {
            handle,
            cancel_rx,
            machine: SessionState::Started,
            params,
            speed,
            slot,
            next_seq: 1,
            job: None,
        });
        Flow::Continue
    }

    async fn on_run(&mut self, task_id: &str, raw_text: String) -> Flow {
        let Some(session) = self.session.as_mut() else {
            return self
                .fail_now(
                    task_id,
                    ServerError::Violation("RunSynthesis before StartSynthesis".to_string()),
                )
                .await;
        };
        if session.handle.task_id() != task_id {
            let task = session.handle.task_id().to_string();
            return self
                .fail_now(
                    &task,
                    ServerError::Violation(format!("task id mismatch: {}", task_id)),
                )
                .await;
        }
        session.handle.touch();

        let next_state = match session.machine.apply(SessionEvent::Run) {
            Ok(next) => next,
            Err(violation) => {
                // Reject the extra run but let the in-flight job finish
                // delivering; the session is done once it does.
                let task = session.handle.task_id().to_string();
                let err = ServerError::Violation(violation.to_string());
                let frame = ServerFrame::task_failed(&task, err.status_code(), &err.to_string());
                self.send_frame(frame).await;
                if let Some(session) = self.session.as_mut() {
                    session.machine = SessionState::Failed;
                    if session.job.is_some() {
                        return Flow::Continue;
                    }
                }
                self.teardown();
                return Flow::Close;
            }
        };

        let cleaned = text::clean_text(&raw_text);
        if cleaned.is_empty() {
            let task = session.handle.task_id().to_string();
            let err = ProtocolError::invalid_parameter("text", "must not be empty");
            return self.fail_now(&task, ServerError::Protocol(err)).await;
        }
        if cleaned.chars().count() > MAX_TEXT_LEN {
            let task = session.handle.task_id().to_string();
            let err = ProtocolError::invalid_parameter(
                "text",
                format!("exceeds {} characters", MAX_TEXT_LEN),
            );
            return self.fail_now(&task, ServerError::Protocol(err)).await;
        }

        let request = SynthesisRequest {
            text: cleaned.clone(),
            voice: session.params.voice.clone(),
            speed: session.speed,
            volume: session.params.volume,
            format: session.params.audio_format(),
            sample_rate: session.params.sample_rate,
        };

        // Enter RunningJob before the backend call so a failure to even
        // start the job is classified like any other job failure.
        session.machine = next_state;

        let chunks = match self.state.backend.synthesize(request).await {
            Ok(chunks) => chunks,
            Err(e) => return self.on_backend_error(e).await,
        };

        // Re-borrow: the backend call above required releasing the session.
        let Some(session) = self.session.as_mut() else {
            return Flow::Close;
        };
        let seq = session.next_seq;
        session.next_seq += 1;

        let begin = ServerFrame::sentence_begin(task_id, session.handle.session_id());
        self.send_frame(begin).await;

        let Some(session) = self.session.as_mut() else {
            return Flow::Close;
        };
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let done = spawn_job(
            chunks,
            JobContext {
                task_id: task_id.to_string(),
                job_seq: seq,
                text: cleaned.clone(),
                enable_subtitle: session.params.enable_subtitle,
                send_timeout: Duration::from_millis(self.state.config.streaming.send_timeout_ms),
                outbound: self.outbound.clone(),
                cancel: cancel_rx,
                handle: Arc::clone(&session.handle),
            },
        );

        session.job = Some(RunningJob {
            seq,
            text: cleaned,
            cancel: cancel_tx,
            done,
        });
        tracing::debug!(task_id, job = seq, "job accepted");
        Flow::Continue
    }

    async fn on_stop(&mut self, task_id: &str) -> Flow {
        let Some(session) = self.session.as_mut() else {
            return self
                .fail_now(
                    task_id,
                    ServerError::Violation("StopSynthesis before StartSynthesis".to_string()),
                )
                .await;
        };
        if session.handle.task_id() != task_id {
            let task = session.handle.task_id().to_string();
            return self
                .fail_now(
                    &task,
                    ServerError::Violation(format!("task id mismatch: {}", task_id)),
                )
                .await;
        }
        session.handle.touch();

        match session.machine.apply(SessionEvent::Stop) {
            Ok(SessionState::Stopping) => {
                session.machine = SessionState::Stopping;
                if let Some(job) = &session.job {
                    tracing::debug!(task_id, job = job.seq, "stop requested mid-job");
                    let _ = job.cancel.send(true);
                }
                Flow::Continue
            }
            Ok(SessionState::Completed) => {
                session.machine = SessionState::Completed;
                self.finish_completed().await
            }
            Ok(other) => {
                // apply() never yields anything else for Stop.
                tracing::error!(task_id, state = ?other, "unexpected stop transition");
                self.teardown();
                Flow::Close
            }
            Err(violation) => {
                let task = session.handle.task_id().to_string();
                self.fail_now(&task, ServerError::Violation(violation.to_string()))
                    .await
            }
        }
    }

    /// Handle the active job's terminal event.
    pub async fn on_job_outcome(&mut self, outcome: JobOutcome) -> Flow {
        let Some(session) = self.session.as_mut() else {
            return Flow::Close;
        };
        let Some(job) = session.job.take() else {
            return Flow::Close;
        };
        session.handle.touch();

        // Drain mode after a rejected run: the job's end just finishes the
        // teardown, no further frames.
        if session.machine.is_terminal() {
            self.teardown();
            return Flow::Close;
        }

        let task_id = session.handle.task_id().to_string();
        match outcome {
            JobOutcome::Completed { chunks } => {
                session.slot.replica().record_job_success();
                tracing::debug!(task_id, job = job.seq, chunks, "job completed");

                let subtitles = if session.params.enable_subtitle {
                    vec![Subtitle::estimate(&job.text)]
                } else {
                    Vec::new()
                };
                let next = match session.machine.apply(SessionEvent::JobCompleted) {
                    Ok(next) => next,
                    Err(_) => return self.internal_failure(&task_id).await,
                };
                session.machine = next;

                self.send_frame(ServerFrame::sentence_end(&task_id, subtitles)).await;
                match next {
                    SessionState::Completed => self.finish_completed().await,
                    _ => Flow::Continue,
                }
            }
            JobOutcome::Cancelled => {
                tracing::debug!(task_id, job = job.seq, "job cancelled");
                match session.machine.apply(SessionEvent::JobCompleted) {
                    Ok(SessionState::Completed) => {
                        if let Some(session) = self.session.as_mut() {
                            session.machine = SessionState::Completed;
                        }
                        self.finish_completed().await
                    }
                    // Cancelled outside a stop means the transport died.
                    _ => {
                        self.teardown();
                        Flow::Close
                    }
                }
            }
            JobOutcome::Failed(e) => self.on_backend_error(e).await,
            JobOutcome::SendTimeout => {
                tracing::warn!(task_id, job = job.seq, "job aborted, client send path stalled");
                let err = ServerError::Synthesis(SynthesisError::Job(
                    "client too slow, send timed out".to_string(),
                ));
                self.fail_now(&task_id, err).await
            }
        }
    }

    /// Classify a backend failure: a job-level error keeps the session and
    /// its replica; a device-level error poisons the replica and, since
    /// affinity is absolute, ends the session.
    async fn on_backend_error(&mut self, error: SynthesisError) -> Flow {
        let Some(session) = self.session.as_mut() else {
            return Flow::Close;
        };
        let task_id = session.handle.task_id().to_string();

        if error.is_recoverable() {
            let threshold = self.state.router.fail_threshold();
            session.slot.replica().record_job_failure(threshold);

            let event = SessionEvent::JobFailedRecoverable;
            let next = match session.machine.apply(event) {
                Ok(next) => next,
                Err(_) => return self.internal_failure(&task_id).await,
            };
            session.machine = next;

            let err = ServerError::Synthesis(error);
            let frame = ServerFrame::task_failed(&task_id, err.status_code(), &err.to_string());
            self.send_frame(frame).await;

            match next {
                // Stop was pending; the failed job still resolves it.
                SessionState::Completed => self.finish_completed().await,
                _ => Flow::Continue,
            }
        } else {
            session.slot.replica().mark_unhealthy();
            if let Ok(next) = session.machine.apply(SessionEvent::JobFailedFatal) {
                session.machine = next;
            }
            self.fail_now(&task_id, ServerError::Synthesis(error)).await
        }
    }

    /// Emit `SynthesisCompleted` and tear the session down cleanly.
    async fn finish_completed(&mut self) -> Flow {
        if let Some(session) = &self.session {
            let frame = ServerFrame::synthesis_completed(
                session.handle.task_id(),
                session.handle.session_id(),
            );
            self.send_frame(frame).await;
            tracing::info!(task_id = %session.handle.task_id(), "session completed");
        }
        self.teardown();
        Flow::Close
    }

    /// Report a failure frame and tear everything down.
    async fn fail_now(&mut self, task_id: &str, err: ServerError) -> Flow {
        tracing::warn!(task_id, error = %err, status = err.status_code(), "session failed");
        let frame = ServerFrame::task_failed(task_id, err.status_code(), &err.to_string());
        self.send_frame(frame).await;

        if let Some(session) = self.session.as_mut() {
            session.machine = SessionState::Failed;
        }
        self.teardown();
        Flow::Close
    }

    async fn internal_failure(&mut self, task_id: &str) -> Flow {
        let frame =
            ServerFrame::task_failed(task_id, status::INTERNAL_ERROR, "internal state error");
        self.send_frame(frame).await;
        self.teardown();
        Flow::Close
    }

    /// Token-gated connections that fail the check get an explicit failure
    /// frame before the close, never a silent hangup.
    pub async fn reject_unauthorized(&mut self) {
        tracing::warn!("connection rejected, bad or missing token");
        let frame = ServerFrame::task_failed(
            "",
            status::AUTHENTICATION_FAILED,
            "invalid or missing token",
        );
        self.send_frame(frame).await;
    }

    /// Implicit stop: cancel any running job, release the replica slot,
    /// deregister. Safe on every exit path; release is idempotent.
    pub fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Some(job) = session.job.take() {
                let _ = job.cancel.send(true);
            }
            if !session.machine.is_terminal() {
                if let Ok(next) = session.machine.apply(SessionEvent::Disconnect) {
                    session.machine = next;
                }
            }
            session.slot.release();
            self.state.registry.deregister(&session.handle);
        }
    }

    /// Await the active job's terminal event. Test hook mirroring what the
    /// control loop's select does.
    pub async fn await_job(&mut self) -> Option<JobOutcome> {
        let session = self.session.as_mut()?;
        let job = session.job.as_mut()?;
        Some(coordinator_outcome((&mut job.done).await))
    }

    fn current_task_id(&self) -> Option<String> {
        self.session
            .as_ref()
            .map(|s| s.handle.task_id().to_string())
    }

    async fn send_frame(&self, frame: ServerFrame) {
        match frame.to_json() {
            Ok(json) => {
                let _ = self.outbound.send(OutboundFrame::Control(json)).await;
            }
            Err(e) => tracing::error!(error = %e, "control frame serialization failed"),
        }
    }
}

fn coordinator_outcome(result: Result<JobOutcome, oneshot::error::RecvError>) -> JobOutcome {
    result.unwrap_or_else(|_| {
        JobOutcome::Failed(SynthesisError::Job(
            "coordinator exited unexpectedly".to_string(),
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderName;
    use speech_gateway_config::Settings;
    use speech_gateway_synth::SineBackend;

    #[test]
    fn test_token_gate() {
        let mut headers = HeaderMap::new();
        assert!(token_authorized(&headers, None));
        assert!(!token_authorized(&headers, Some("secret")));

        let name: HeaderName = TOKEN_HEADER.parse().unwrap();
        headers.insert(name.clone(), "secret".parse().unwrap());
        assert!(token_authorized(&headers, Some("secret")));

        headers.insert(name, "wrong".parse().unwrap());
        assert!(!token_authorized(&headers, Some("secret")));
    }

    #[tokio::test]
    async fn test_unauthorized_connection_gets_a_failure_frame() {
        let state = AppState::new(Settings::default(), Arc::new(SineBackend::default()));
        let (tx, mut rx) = mpsc::channel(4);
        let mut conn = Connection::new(state, tx);

        conn.reject_unauthorized().await;

        match rx.recv().await.unwrap() {
            OutboundFrame::Control(json) => {
                let frame: serde_json::Value = serde_json::from_str(&json).unwrap();
                assert_eq!(frame["header"]["name"], "TaskFailed");
                assert_eq!(frame["header"]["status"], status::AUTHENTICATION_FAILED);
                assert_eq!(frame["header"]["task_id"], "");
            }
            OutboundFrame::Audio(_) => panic!("no audio expected"),
        }
    }
}
