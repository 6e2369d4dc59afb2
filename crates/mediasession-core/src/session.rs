//! Session lifecycle and the offer/answer state machine.
//!
//! Lifecycle:
//! - IDLE: built, nothing sent
//! - NEGOTIATING: generating the offer, awaiting the answer, applying it
//! - ESTABLISHED: answer applied and confirmed
//! - TERMINATING: torn down, waiting for an in-flight `start` response
//! - TERMINATED / FAILED: final
//!
//! Every transition runs on the session's [`SerialExecutor`]. Completions
//! from the negotiation and the transport are re-posted there and carry the
//! generation they were issued under; a completion whose generation is no
//! longer current is discarded. Locks are taken in the order `core` then
//! `shared`, and handlers are invoked only after both are released.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use mediasession_common::{JsonRpcRequest, JsonRpcResponse, ResponseResult, SessionConfig};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument, Span};
use uuid::Uuid;

use crate::error::{SessionError, Step, TransportError};
use crate::executor::SerialExecutor;
use crate::negotiation::{Completion, Negotiation};
use crate::sequence::SequenceCounter;
use crate::sync::lock;
use crate::transport::{HttpTransport, SignalingTransport};

/// Reason carried by every `terminate` request.
pub const TERMINATE_CODE: i32 = 0;
pub const TERMINATE_MESSAGE: &str = "Terminate RTP session";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStep {
    GeneratingOffer,
    AwaitingAnswer,
    ApplyingAnswer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Negotiating(NegotiationStep),
    Established,
    Terminating,
    Terminated,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Terminated | SessionState::Failed)
    }

    fn is_closing(self) -> bool {
        matches!(
            self,
            SessionState::Terminating | SessionState::Terminated | SessionState::Failed
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => f.write_str("idle"),
            SessionState::Negotiating(NegotiationStep::GeneratingOffer) => {
                f.write_str("negotiating (generating offer)")
            }
            SessionState::Negotiating(NegotiationStep::AwaitingAnswer) => {
                f.write_str("negotiating (awaiting answer)")
            }
            SessionState::Negotiating(NegotiationStep::ApplyingAnswer) => {
                f.write_str("negotiating (applying answer)")
            }
            SessionState::Established => f.write_str("established"),
            SessionState::Terminating => f.write_str("terminating"),
            SessionState::Terminated => f.write_str("terminated"),
            SessionState::Failed => f.write_str("failed"),
        }
    }
}

/// Snapshot handed to handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: Uuid,
    pub remote_session_id: Option<String>,
}

pub type EstablishedHandler = Arc<dyn Fn(&SessionInfo) + Send + Sync + 'static>;
pub type ExceptionHandler = Arc<dyn Fn(&SessionInfo, &SessionError) + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("no negotiation configured")]
    MissingNegotiation,

    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),

    #[error("invalid configuration: {0}")]
    Config(#[from] mediasession_common::Error),

    #[error("failed to start session executor: {0}")]
    Executor(#[from] std::io::Error),
}

pub struct SessionBuilder {
    config: SessionConfig,
    negotiation: Option<Negotiation>,
    transport: Option<Arc<dyn SignalingTransport>>,
    sequence: Option<SequenceCounter>,
    runtime: Option<Handle>,
    established: Option<EstablishedHandler>,
    exception: Option<ExceptionHandler>,
}

impl SessionBuilder {
    pub fn negotiation(mut self, negotiation: impl Into<Negotiation>) -> Self {
        self.negotiation = Some(negotiation.into());
        self
    }

    /// Defaults to an [`HttpTransport`] for the configured server.
    pub fn transport(mut self, transport: Arc<dyn SignalingTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Share a counter between sessions. Defaults to a fresh one.
    pub fn sequence(mut self, sequence: SequenceCounter) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Runtime for I/O and timers. Defaults to the current one.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn on_established<F>(mut self, handler: F) -> Self
    where
        F: Fn(&SessionInfo) + Send + Sync + 'static,
    {
        self.established = Some(Arc::new(handler));
        self
    }

    pub fn on_exception<F>(mut self, handler: F) -> Self
    where
        F: Fn(&SessionInfo, &SessionError) + Send + Sync + 'static,
    {
        self.exception = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> Result<Session, BuildError> {
        self.config.validate()?;
        let mut negotiation = self.negotiation.ok_or(BuildError::MissingNegotiation)?;
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|e| BuildError::NoRuntime(e.to_string()))?,
        };

        let id = Uuid::new_v4();
        let executor = SerialExecutor::spawn(format!("session-{}", id.simple()))?;
        negotiation.bind_executor(executor.clone());

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(HttpTransport::new(&self.config.server)));
        let span = tracing::info_span!("session", session = %id, kind = negotiation.kind());

        let handlers = Handlers {
            established: self.established.unwrap_or_else(|| {
                Arc::new(|info: &SessionInfo| {
                    info!(remote = ?info.remote_session_id, "session established");
                })
            }),
            exception: self.exception.unwrap_or_else(|| {
                Arc::new(|info: &SessionInfo, err: &SessionError| {
                    error!(remote = ?info.remote_session_id, error = %err, "session failed");
                })
            }),
        };

        span.in_scope(|| debug!(url = ?self.config.server.url(), "session created"));

        Ok(Session {
            inner: Arc::new(Inner {
                id,
                config: self.config,
                executor,
                runtime,
                transport,
                sequence: self.sequence.unwrap_or_default(),
                span,
                shared: Mutex::new(Shared {
                    remote_session_id: None,
                    termination_requested: false,
                    state: SessionState::Idle,
                }),
                core: Mutex::new(Core {
                    negotiation,
                    generation: 0,
                    media_released: false,
                    terminate_sent: false,
                    request_in_flight: false,
                    notified: false,
                    timer: None,
                }),
                handlers: Mutex::new(handlers),
                terminate_task: Mutex::new(None),
            }),
        })
    }
}

/// One media session negotiated with the server.
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    id: Uuid,
    config: SessionConfig,
    executor: SerialExecutor,
    runtime: Handle,
    transport: Arc<dyn SignalingTransport>,
    sequence: SequenceCounter,
    span: Span,
    shared: Mutex<Shared>,
    core: Mutex<Core>,
    handlers: Mutex<Handlers>,
    terminate_task: Mutex<Option<JoinHandle<()>>>,
}

/// State readable from any thread.
struct Shared {
    remote_session_id: Option<String>,
    termination_requested: bool,
    state: SessionState,
}

/// State touched only from the executor.
struct Core {
    negotiation: Negotiation,
    generation: u64,
    media_released: bool,
    terminate_sent: bool,
    request_in_flight: bool,
    notified: bool,
    /// Deadline of the current step, aborted when the step is left.
    timer: Option<JoinHandle<()>>,
}

struct Handlers {
    established: EstablishedHandler,
    exception: ExceptionHandler,
}

enum Notify {
    Nothing,
    Established(SessionInfo),
    Exception(SessionInfo, SessionError),
}

impl Session {
    pub fn builder(config: SessionConfig) -> SessionBuilder {
        SessionBuilder {
            config,
            negotiation: None,
            transport: None,
            sequence: None,
            runtime: None,
            established: None,
            exception: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn remote_session_id(&self) -> Option<String> {
        lock(&self.inner.shared).remote_session_id.clone()
    }

    pub fn state(&self) -> SessionState {
        lock(&self.inner.shared).state
    }

    pub fn is_termination_requested(&self) -> bool {
        lock(&self.inner.shared).termination_requested
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn set_established_handler<F>(&self, handler: F)
    where
        F: Fn(&SessionInfo) + Send + Sync + 'static,
    {
        lock(&self.inner.handlers).established = Arc::new(handler);
    }

    pub fn set_exception_handler<F>(&self, handler: F)
    where
        F: Fn(&SessionInfo, &SessionError) + Send + Sync + 'static,
    {
        lock(&self.inner.handlers).exception = Arc::new(handler);
    }

    /// Begin negotiating. Ignored unless the session is idle.
    pub fn start(&self) {
        let inner = self.inner.clone();
        if !self.inner.executor.post(move || run_start(&inner)) {
            let _span = self.inner.span.enter();
            warn!("start ignored: session is no longer running");
        }
    }

    /// Request termination. Safe from any thread, any number of times.
    pub fn terminate(&self) {
        {
            let mut shared = lock(&self.inner.shared);
            if shared.termination_requested {
                debug!(session = %self.inner.id, "termination already requested");
            }
            shared.termination_requested = true;
        }
        let inner = self.inner.clone();
        if !self.inner.executor.post(move || terminate_sync(&inner)) {
            debug!(session = %self.inner.id, "executor already stopped; nothing to terminate");
        }
    }

    /// Resolves once the session reached a final state, its executor has
    /// stopped and any `terminate` request has completed. An established
    /// session only gets there after [`terminate`](Self::terminate).
    pub async fn closed(&self) {
        let executor = self.inner.executor.clone();
        if tokio::task::spawn_blocking(move || executor.join())
            .await
            .is_err()
        {
            warn!(session = %self.inner.id, "waiting for session executor failed");
        }
        let task = lock(&self.inner.terminate_task).take();
        if let Some(task) = task {
            if task.await.is_err() {
                warn!(session = %self.inner.id, "terminate request task failed");
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = lock(&self.inner.shared);
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("remote_session_id", &shared.remote_session_id)
            .field("state", &shared.state)
            .field("termination_requested", &shared.termination_requested)
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let (state, requested) = {
            let shared = lock(&self.inner.shared);
            (shared.state, shared.termination_requested)
        };
        if !state.is_terminal() && !requested {
            debug!(session = %self.inner.id, %state, "session dropped; terminating");
            self.terminate();
        }
    }
}

impl Inner {
    fn state(&self) -> SessionState {
        lock(&self.shared).state
    }

    fn set_state(&self, state: SessionState) {
        let previous = std::mem::replace(&mut lock(&self.shared).state, state);
        debug!(from = %previous, to = %state, "state transition");
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            remote_session_id: lock(&self.shared).remote_session_id.clone(),
        }
    }

    fn store_remote_id(&self, session_id: &str) {
        let mut shared = lock(&self.shared);
        match &shared.remote_session_id {
            None => {
                info!(remote = %session_id, "remote session id assigned");
                shared.remote_session_id = Some(session_id.to_string());
            }
            Some(existing) if existing == session_id => {}
            Some(existing) => {
                warn!(remote = %existing, ignored = %session_id, "remote session id already assigned");
            }
        }
    }
}

impl Notify {
    fn fire(self, inner: &Inner) {
        match self {
            Notify::Nothing => {}
            Notify::Established(info) => {
                let handler = lock(&inner.handlers).established.clone();
                handler(&info);
            }
            Notify::Exception(info, err) => {
                let handler = lock(&inner.handlers).exception.clone();
                handler(&info, &err);
            }
        }
    }
}

/// Completion that re-posts its result to the executor as `step`.
fn completion<T>(
    inner: &Arc<Inner>,
    generation: u64,
    step: fn(&Arc<Inner>, u64, Result<T, SessionError>),
) -> Completion<T>
where
    T: Send + 'static,
{
    let weak = Arc::downgrade(inner);
    let executor = inner.executor.clone();
    Completion::new(move |result| {
        let posted = executor.post(move || {
            if let Some(inner) = weak.upgrade() {
                step(&inner, generation, result);
            }
        });
        if !posted {
            debug!("session executor stopped; dropping completion");
        }
    })
}

/// Leave the current step: stale completions and its timer are dropped.
fn advance(core: &mut Core) -> u64 {
    if let Some(timer) = core.timer.take() {
        timer.abort();
    }
    core.generation += 1;
    core.generation
}

fn arm_timeout(inner: &Arc<Inner>, core: &mut Core, step: Step) {
    let after = match step {
        Step::LocalDescription => inner.config.timeouts.local_description(),
        Step::RemoteDescription => inner.config.timeouts.remote_description(),
        Step::Signaling => inner.config.timeouts.signaling(),
    };
    let Some(after) = after else {
        return;
    };
    let generation = core.generation;
    let weak = Arc::downgrade(inner);
    let executor = inner.executor.clone();
    core.timer = Some(inner.runtime.spawn(async move {
        tokio::time::sleep(after).await;
        executor.post(move || {
            if let Some(inner) = weak.upgrade() {
                on_timeout(&inner, generation, step);
            }
        });
    }));
}

fn send_request(
    transport: &Arc<dyn SignalingTransport>,
    request: JsonRpcRequest,
    timeout: Option<Duration>,
) -> BoxFuture<'static, Result<JsonRpcResponse, SessionError>> {
    let expected = request.id;
    let pending = transport.send(request);
    Box::pin(async move {
        let response = match timeout {
            Some(after) => tokio::time::timeout(after, pending)
                .await
                .map_err(|_| SessionError::Timeout(Step::Signaling))??,
            None => pending.await?,
        };
        match response.id {
            Some(got) if got != expected => {
                Err(TransportError::UnexpectedId { expected, got }.into())
            }
            _ => Ok(response),
        }
    })
}

fn run_start(inner: &Arc<Inner>) {
    let _span = inner.span.enter();
    let mut core = lock(&inner.core);
    {
        let mut shared = lock(&inner.shared);
        if shared.state != SessionState::Idle {
            warn!(state = %shared.state, "start ignored: session is not idle");
            return;
        }
        if shared.termination_requested {
            debug!("start ignored: termination already requested");
            return;
        }
        shared.state = SessionState::Negotiating(NegotiationStep::GeneratingOffer);
    }
    info!("starting negotiation");

    let generation = advance(&mut core);
    let done = completion(inner, generation, on_local_offer);
    core.negotiation.generate_local_offer(done);
    arm_timeout(inner, &mut core, Step::LocalDescription);
}

fn on_local_offer(inner: &Arc<Inner>, generation: u64, result: Result<String, SessionError>) {
    let _span = inner.span.enter();
    let notify = {
        let mut core = lock(&inner.core);
        if core.generation != generation {
            debug!("discarding stale local description");
            return;
        }
        match result {
            Ok(sdp) => {
                send_start(inner, &mut core, sdp);
                Notify::Nothing
            }
            Err(err) => fail(inner, &mut core, err),
        }
    };
    notify.fire(inner);
}

fn send_start(inner: &Arc<Inner>, core: &mut Core, sdp: String) {
    let generation = advance(core);
    inner.set_state(SessionState::Negotiating(NegotiationStep::AwaitingAnswer));

    let request = JsonRpcRequest::start(sdp, inner.config.constraints, inner.sequence.next());
    debug!(id = request.id, "sending start request");
    core.request_in_flight = true;

    let pending = send_request(&inner.transport, request, inner.config.timeouts.signaling());
    // The task keeps the session alive until the response is handled, so a
    // late response can still release the remote session.
    let inner_for_task = inner.clone();
    inner.runtime.spawn(
        async move {
            let result = pending.await;
            let executor = inner_for_task.executor.clone();
            let posted = executor.post(move || {
                on_start_response(&inner_for_task, generation, result);
            });
            if !posted {
                warn!("session executor stopped before start response was handled");
            }
        }
        .instrument(inner.span.clone()),
    );
}

fn on_start_response(
    inner: &Arc<Inner>,
    generation: u64,
    result: Result<JsonRpcResponse, SessionError>,
) {
    let _span = inner.span.enter();
    let notify = {
        let mut core = lock(&inner.core);
        core.request_in_flight = false;

        if inner.state() == SessionState::Terminating {
            info!("start response arrived after termination; releasing remote session");
            if let Ok(ResponseResult {
                session_id: Some(session_id),
                ..
            }) = result.map(|r| r.result.unwrap_or_default())
            {
                inner.store_remote_id(&session_id);
            }
            finish_termination(inner, &mut core);
            return;
        }
        if core.generation != generation {
            debug!("discarding stale start response");
            return;
        }

        match result.and_then(parse_answer) {
            Ok((answer, session_id)) => {
                inner.store_remote_id(&session_id);
                apply_answer(inner, &mut core, answer);
                Notify::Nothing
            }
            Err(err) => fail(inner, &mut core, err),
        }
    };
    notify.fire(inner);
}

fn parse_answer(response: JsonRpcResponse) -> Result<(String, String), SessionError> {
    match response.into_outcome() {
        Err(e) => Err(SessionError::Protocol {
            code: e.code,
            message: e.message,
        }),
        Ok(ResponseResult {
            sdp: Some(sdp),
            session_id: Some(session_id),
        }) => Ok((sdp, session_id)),
        Ok(_) => Err(TransportError::MalformedBody(
            "start result must carry sdp and sessionId".into(),
        )
        .into()),
    }
}

fn apply_answer(inner: &Arc<Inner>, core: &mut Core, answer: String) {
    let generation = advance(core);
    inner.set_state(SessionState::Negotiating(NegotiationStep::ApplyingAnswer));

    let done = completion(inner, generation, on_answer_applied);
    core.negotiation.apply_remote_answer(answer, done);
    arm_timeout(inner, core, Step::RemoteDescription);
}

fn on_answer_applied(inner: &Arc<Inner>, generation: u64, result: Result<(), SessionError>) {
    let _span = inner.span.enter();
    let notify = {
        let mut core = lock(&inner.core);
        if core.generation != generation {
            debug!("discarding stale answer completion");
            return;
        }
        if let Err(err) = result {
            fail(inner, &mut core, err)
        } else if lock(&inner.shared).termination_requested {
            info!("termination requested during negotiation; aborting");
            begin_termination(inner, &mut core);
            Notify::Nothing
        } else if let Err(err) = core.negotiation.confirm() {
            fail(inner, &mut core, err)
        } else {
            let mut shared = lock(&inner.shared);
            if shared.termination_requested {
                drop(shared);
                info!("termination requested during confirm; aborting");
                begin_termination(inner, &mut core);
                Notify::Nothing
            } else {
                advance(&mut core);
                core.notified = true;
                shared.state = SessionState::Established;
                drop(shared);
                info!("session established");
                Notify::Established(inner.info())
            }
        }
    };
    notify.fire(inner);
}

fn on_timeout(inner: &Arc<Inner>, generation: u64, step: Step) {
    let _span = inner.span.enter();
    let notify = {
        let mut core = lock(&inner.core);
        if core.generation != generation {
            return;
        }
        warn!(%step, "negotiation step timed out");
        fail(inner, &mut core, SessionError::Timeout(step))
    };
    notify.fire(inner);
}

/// Converge on `Failed`. The exception handler is notified once.
fn fail(inner: &Arc<Inner>, core: &mut Core, err: SessionError) -> Notify {
    let state = inner.state();
    if state.is_closing() {
        debug!(%state, error = %err, "ignoring failure while closing");
        return Notify::Nothing;
    }
    error!(error = %err, %state, "negotiation failed");

    advance(core);
    release_media(core);
    send_terminate(inner, core);
    inner.set_state(SessionState::Failed);
    inner.executor.quit();

    if core.notified {
        return Notify::Nothing;
    }
    core.notified = true;
    Notify::Exception(inner.info(), err)
}

fn terminate_sync(inner: &Arc<Inner>) {
    let _span = inner.span.enter();
    let mut core = lock(&inner.core);
    let state = inner.state();
    if state.is_closing() {
        debug!(%state, "terminate ignored: session already closing");
        return;
    }
    begin_termination(inner, &mut core);
}

fn begin_termination(inner: &Arc<Inner>, core: &mut Core) {
    info!("terminating session");
    advance(core);
    inner.set_state(SessionState::Terminating);
    release_media(core);

    if core.request_in_flight {
        debug!("start request in flight; termination completes on its response");
        return;
    }
    finish_termination(inner, core);
}

fn finish_termination(inner: &Arc<Inner>, core: &mut Core) {
    send_terminate(inner, core);
    inner.set_state(SessionState::Terminated);
    inner.executor.quit();
}

fn release_media(core: &mut Core) {
    if core.media_released {
        return;
    }
    core.media_released = true;
    core.negotiation.release();
}

/// Fire-and-forget `terminate` for the remote session, at most once.
fn send_terminate(inner: &Arc<Inner>, core: &mut Core) {
    if core.terminate_sent {
        return;
    }
    let Some(session_id) = lock(&inner.shared).remote_session_id.clone() else {
        return;
    };
    core.terminate_sent = true;

    let request = JsonRpcRequest::terminate(
        session_id,
        TERMINATE_CODE,
        TERMINATE_MESSAGE,
        inner.sequence.next(),
    );
    debug!(id = request.id, "sending terminate request");
    let pending = send_request(&inner.transport, request, inner.config.timeouts.signaling());
    let task = inner.runtime.spawn(
        async move {
            match pending.await {
                Ok(response) => match response.error {
                    Some(e) => warn!(code = e.code, message = %e.message, "terminate rejected"),
                    None => info!("remote session terminated"),
                },
                Err(err) => warn!(error = %err, "terminate request failed"),
            }
        }
        .instrument(inner.span.clone()),
    );
    *lock(&inner.terminate_task) = Some(task);
}
