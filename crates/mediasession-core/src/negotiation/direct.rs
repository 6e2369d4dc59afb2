//! Negotiation against an event-driven media engine that manages RTP ports
//! itself and exchanges structured descriptions.

use std::fmt;

use tracing::{debug, warn};

use super::Completion;
use crate::error::SessionError;
use crate::sdp::SessionSpec;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEventKind {
    OfferGenerated,
    AnswerProcessed,
    AnswerGenerated,
    Other(String),
}

/// Error reported by the media engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaErr {
    pub code: i32,
    pub message: String,
}

impl MediaErr {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for MediaErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaEvent {
    pub kind: MediaEventKind,
    pub error: Option<MediaErr>,
    pub description: Option<SessionSpec>,
}

impl MediaEvent {
    pub fn ok(kind: MediaEventKind, description: Option<SessionSpec>) -> Self {
        Self {
            kind,
            error: None,
            description,
        }
    }

    pub fn failed(kind: MediaEventKind, error: MediaErr) -> Self {
        Self {
            kind,
            error: Some(error),
            description: None,
        }
    }
}

/// Listener for exactly one engine event. It is moved into the engine, so
/// it cannot fire twice.
pub type MediaEventListener = Box<dyn FnOnce(MediaEvent) + Send + 'static>;

/// Native media engine handle.
///
/// Errors from `generate_offer` and `process_answer` are delivered through
/// the listener's event, never returned.
pub trait MediaEngine: Send {
    fn generate_offer(&mut self, listener: MediaEventListener);

    fn process_answer(&mut self, answer: SessionSpec, listener: MediaEventListener);

    fn confirm(&mut self) -> Result<(), MediaErr>;

    fn local_description(&self) -> Option<SessionSpec>;

    fn remote_description(&self) -> Option<SessionSpec>;

    fn release(&mut self);
}

pub struct DirectMediaNegotiation {
    engine: Box<dyn MediaEngine>,
    released: bool,
}

impl DirectMediaNegotiation {
    pub fn new(engine: Box<dyn MediaEngine>) -> Self {
        Self {
            engine,
            released: false,
        }
    }

    pub fn generate_local_offer(&mut self, done: Completion<String>) {
        if self.released {
            done.fail(SessionError::local_media("media engine is released"));
            return;
        }
        self.engine.generate_offer(Box::new(move |event| {
            done.complete(offer_from_event(event));
        }));
    }

    pub fn apply_remote_answer(&mut self, answer: String, done: Completion<()>) {
        if self.released {
            done.fail(SessionError::local_media("media engine is released"));
            return;
        }
        let spec = match SessionSpec::parse(&answer) {
            Ok(spec) => spec,
            Err(e) => {
                done.fail(SessionError::local_media(format!("invalid SDP answer: {e}")));
                return;
            }
        };
        self.engine.process_answer(
            spec,
            Box::new(move |event| {
                done.complete(answer_from_event(event));
            }),
        );
    }

    pub fn confirm(&mut self) -> Result<(), SessionError> {
        if self.released {
            return Err(SessionError::local_media("media engine is released"));
        }
        self.engine
            .confirm()
            .map_err(|e| SessionError::local_media(format!("confirm failed: {e}")))?;

        if let Some(local) = self.engine.local_description() {
            debug!("local description:\n{}", local.to_sdp());
        }
        if let Some(remote) = self.engine.remote_description() {
            debug!("remote description:\n{}", remote.to_sdp());
        }
        Ok(())
    }

    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.engine.release();
        debug!("media engine released");
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

fn offer_from_event(event: MediaEvent) -> Result<String, SessionError> {
    if let Some(err) = event.error {
        return Err(SessionError::local_media(format!(
            "offer generation failed: {err}"
        )));
    }
    if event.kind != MediaEventKind::OfferGenerated {
        warn!(kind = ?event.kind, "unexpected event while generating offer");
        return Err(SessionError::local_media(format!(
            "unexpected media event {:?} while generating offer",
            event.kind
        )));
    }
    event
        .description
        .map(|spec| spec.to_sdp())
        .ok_or_else(|| SessionError::local_media("offer event carried no description"))
}

fn answer_from_event(event: MediaEvent) -> Result<(), SessionError> {
    if let Some(err) = event.error {
        return Err(SessionError::local_media(format!(
            "answer processing failed: {err}"
        )));
    }
    if event.kind != MediaEventKind::AnswerProcessed {
        warn!(kind = ?event.kind, "unexpected event while processing answer");
        return Err(SessionError::local_media(format!(
            "unexpected media event {:?} while processing answer",
            event.kind
        )));
    }
    Ok(())
}
