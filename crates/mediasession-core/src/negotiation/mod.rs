//! The two ways a session can produce an offer and consume an answer.
//!
//! Both variants are driven from the session executor only. Their
//! completions may be invoked from any thread (native callback threads,
//! runtime workers); the session re-posts them to its executor before
//! touching state.

pub mod direct;
pub mod peer;
pub mod webrtc_peer;

use std::fmt;

use tracing::warn;

use crate::error::SessionError;
use crate::executor::SerialExecutor;

pub use direct::{
    DirectMediaNegotiation, MediaEngine, MediaErr, MediaEvent, MediaEventKind, MediaEventListener,
};
pub use peer::{
    GatheringHandler, IceGatheringState, MediaSource, OfferConstraints, PeerConnection,
    PeerConnectionNegotiation, PeerDescription, PeerFactory, SdpCallback, SdpKind,
};
pub use webrtc_peer::{build_negotiation, WebRtcFactory, WebRtcPeer};

type Callback<T> = Box<dyn FnOnce(Result<T, SessionError>) + Send + 'static>;

/// One-shot result sink for an asynchronous negotiation step.
///
/// Completing consumes the value, so a step can report at most once. A
/// completion dropped without reporting fails the step, which keeps a
/// misbehaving engine from leaving the session waiting forever.
pub struct Completion<T> {
    callback: Option<Callback<T>>,
}

impl<T> Completion<T> {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(Result<T, SessionError>) + Send + 'static,
    {
        Self {
            callback: Some(Box::new(callback)),
        }
    }

    pub fn complete(mut self, result: Result<T, SessionError>) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }

    pub fn succeed(self, value: T) {
        self.complete(Ok(value));
    }

    pub fn fail(self, error: SessionError) {
        self.complete(Err(error));
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            warn!("completion dropped before the operation finished");
            callback(Err(SessionError::local_media(
                "completion dropped before the operation finished",
            )));
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("pending", &self.callback.is_some())
            .finish()
    }
}

/// Negotiation variant owned by a session.
pub enum Negotiation {
    Direct(DirectMediaNegotiation),
    PeerConnection(PeerConnectionNegotiation),
}

impl Negotiation {
    pub fn direct(engine: Box<dyn MediaEngine>) -> Self {
        Negotiation::Direct(DirectMediaNegotiation::new(engine))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Negotiation::Direct(_) => "direct",
            Negotiation::PeerConnection(_) => "peer-connection",
        }
    }

    /// Produce the local offer as SDP text.
    pub fn generate_local_offer(&mut self, done: Completion<String>) {
        match self {
            Negotiation::Direct(n) => n.generate_local_offer(done),
            Negotiation::PeerConnection(n) => n.generate_local_offer(done),
        }
    }

    /// Apply the server's SDP answer.
    pub fn apply_remote_answer(&mut self, answer: String, done: Completion<()>) {
        match self {
            Negotiation::Direct(n) => n.apply_remote_answer(answer, done),
            Negotiation::PeerConnection(n) => n.apply_remote_answer(answer, done),
        }
    }

    /// Commit the negotiated media. Runs after the answer was applied.
    pub fn confirm(&mut self) -> Result<(), SessionError> {
        match self {
            Negotiation::Direct(n) => n.confirm(),
            Negotiation::PeerConnection(n) => n.confirm(),
        }
    }

    /// Release native resources. Idempotent.
    pub fn release(&mut self) {
        match self {
            Negotiation::Direct(n) => n.release(),
            Negotiation::PeerConnection(n) => n.release(),
        }
    }

    pub(crate) fn bind_executor(&mut self, executor: SerialExecutor) {
        if let Negotiation::PeerConnection(n) = self {
            n.bind_executor(executor);
        }
    }
}

impl fmt::Debug for Negotiation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Negotiation").field(&self.kind()).finish()
    }
}

impl From<DirectMediaNegotiation> for Negotiation {
    fn from(n: DirectMediaNegotiation) -> Self {
        Negotiation::Direct(n)
    }
}

impl From<PeerConnectionNegotiation> for Negotiation {
    fn from(n: PeerConnectionNegotiation) -> Self {
        Negotiation::PeerConnection(n)
    }
}
