//! Offer/answer negotiation of a single media session with a remote server.
//!
//! A [`Session`] drives one negotiation: it asks its [`Negotiation`] for a
//! local offer, carries it to the server over a [`SignalingTransport`],
//! applies the answer and reports the outcome through its handlers. Every
//! step runs on the session's own [`SerialExecutor`], so the native media
//! handle behind the negotiation is never touched concurrently.

#![forbid(unsafe_code)]

pub mod error;
pub mod executor;
pub mod negotiation;
pub mod sdp;
pub mod sequence;
pub mod session;
pub mod transport;

mod sync;

pub use error::{ErrorKind, SessionError, Step, TransportError};
pub use executor::SerialExecutor;
pub use negotiation::{Completion, Negotiation};
pub use sequence::SequenceCounter;
pub use session::{
    BuildError, NegotiationStep, Session, SessionBuilder, SessionInfo, SessionState,
};
pub use transport::{HttpTransport, SignalingTransport};
