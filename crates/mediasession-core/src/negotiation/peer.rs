//! Negotiation over a WebRTC-style peer connection.
//!
//! The local description is only handed out once ICE gathering is complete,
//! so the SDP sent to the server already carries every candidate. Callbacks
//! from the connection arrive on its own threads and are re-posted to the
//! session executor before anything else happens.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use mediasession_common::{Constraints, Direction};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::Completion;
use crate::error::SessionError;
use crate::executor::SerialExecutor;
use crate::sync::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
}

/// A typed description as exchanged with the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl PeerDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    /// SDP text as carried in the JSON-RPC `sdp` field.
    pub fn to_wire(&self) -> String {
        self.sdp.clone()
    }

    /// Rebuild a description from signaling text; the kind comes from the
    /// role the text plays in the exchange.
    pub fn from_wire(kind: SdpKind, text: &str) -> Self {
        Self {
            kind,
            sdp: text.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

/// Receive flags passed to offer and answer creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferConstraints {
    pub offer_to_receive_audio: bool,
    pub offer_to_receive_video: bool,
}

impl Default for OfferConstraints {
    fn default() -> Self {
        Self {
            offer_to_receive_audio: true,
            offer_to_receive_video: true,
        }
    }
}

impl From<&Constraints> for OfferConstraints {
    fn from(c: &Constraints) -> Self {
        let receives = |d: Direction| matches!(d, Direction::RecvOnly | Direction::SendRecv);
        Self {
            offer_to_receive_audio: receives(c.audio),
            offer_to_receive_video: receives(c.video),
        }
    }
}

/// One-shot result callback from the peer connection. Errors are the
/// connection's own messages.
pub type SdpCallback<T> = Box<dyn FnOnce(Result<T, String>) + Send + 'static>;

pub type GatheringHandler = Box<dyn Fn(IceGatheringState) + Send + Sync + 'static>;

/// Native peer connection handle.
pub trait PeerConnection: Send + Sync {
    fn create_offer(&self, constraints: OfferConstraints, done: SdpCallback<PeerDescription>);

    fn create_answer(&self, constraints: OfferConstraints, done: SdpCallback<PeerDescription>);

    fn set_local_description(&self, description: PeerDescription, done: SdpCallback<()>);

    fn set_remote_description(&self, description: PeerDescription, done: SdpCallback<()>);

    /// The committed local description, including gathered candidates.
    fn local_description(&self) -> Option<PeerDescription>;

    fn ice_gathering_state(&self) -> IceGatheringState;

    fn on_ice_gathering_change(&self, handler: GatheringHandler);

    fn close(&self);
}

/// A local capture source attached to the connection.
pub trait MediaSource: Send {
    fn label(&self) -> &str;

    fn dispose(&mut self);
}

/// Whatever created the connection and must outlive it.
pub trait PeerFactory: Send {
    fn dispose(&mut self);
}

struct PeerInner {
    connection: Option<Arc<dyn PeerConnection>>,
    sources: Vec<Box<dyn MediaSource>>,
    factory: Option<Box<dyn PeerFactory>>,
    pending_local: Option<Completion<String>>,
    executor: Option<SerialExecutor>,
}

pub struct PeerConnectionNegotiation {
    inner: Arc<Mutex<PeerInner>>,
    constraints: OfferConstraints,
    released: bool,
}

impl PeerConnectionNegotiation {
    pub fn new(connection: Arc<dyn PeerConnection>, constraints: OfferConstraints) -> Self {
        let inner = Arc::new(Mutex::new(PeerInner {
            connection: Some(connection.clone()),
            sources: Vec::new(),
            factory: None,
            pending_local: None,
            executor: None,
        }));

        let weak = Arc::downgrade(&inner);
        connection.on_ice_gathering_change(Box::new(move |state| {
            debug!(?state, "ICE gathering state changed");
            if state == IceGatheringState::Complete {
                hop(&weak, |inner| deliver_local(inner, true));
            }
        }));

        Self {
            inner,
            constraints,
            released: false,
        }
    }

    /// Attach a local source. Sources are disposed in reverse order of
    /// attachment.
    pub fn with_source(self, source: Box<dyn MediaSource>) -> Self {
        lock(&self.inner).sources.push(source);
        self
    }

    pub fn with_factory(self, factory: Box<dyn PeerFactory>) -> Self {
        lock(&self.inner).factory = Some(factory);
        self
    }

    pub(crate) fn bind_executor(&mut self, executor: SerialExecutor) {
        lock(&self.inner).executor = Some(executor);
    }

    pub fn generate_local_offer(&mut self, done: Completion<String>) {
        let Some(connection) = self.arm(done) else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        connection.create_offer(
            self.constraints,
            Box::new(move |result| {
                hop(&weak, move |inner| match result {
                    Ok(offer) => commit_local(inner, offer),
                    Err(e) => fail_pending(inner, format!("create offer failed: {e}")),
                });
            }),
        );
    }

    /// Answerer role: apply a remote offer and produce the local answer.
    pub fn generate_local_answer(&mut self, remote_offer: String, done: Completion<String>) {
        let Some(connection) = self.arm(done) else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let constraints = self.constraints;
        connection.set_remote_description(
            PeerDescription::from_wire(SdpKind::Offer, &remote_offer),
            Box::new(move |result| {
                hop(&weak, move |inner| {
                    if let Err(e) = result {
                        fail_pending(inner, format!("set remote offer failed: {e}"));
                        return;
                    }
                    let Some(connection) = current_connection(inner) else {
                        fail_pending(inner, "peer connection disposed");
                        return;
                    };
                    let weak = Arc::downgrade(inner);
                    connection.create_answer(
                        constraints,
                        Box::new(move |result| {
                            hop(&weak, move |inner| match result {
                                Ok(answer) => commit_local(inner, answer),
                                Err(e) => {
                                    fail_pending(inner, format!("create answer failed: {e}"))
                                }
                            });
                        }),
                    );
                });
            }),
        );
    }

    pub fn apply_remote_answer(&mut self, answer: String, done: Completion<()>) {
        let Some(connection) = current_connection(&self.inner) else {
            done.fail(SessionError::local_media("peer connection disposed"));
            return;
        };
        connection.set_remote_description(
            PeerDescription::from_wire(SdpKind::Answer, &answer),
            Box::new(move |result| {
                done.complete(result.map_err(|e| {
                    SessionError::local_media(format!("set remote answer failed: {e}"))
                }));
            }),
        );
    }

    pub fn confirm(&mut self) -> Result<(), SessionError> {
        let connection = current_connection(&self.inner)
            .ok_or_else(|| SessionError::local_media("peer connection disposed"))?;
        if let Some(local) = connection.local_description() {
            debug!("local description:\n{}", local.sdp);
        }
        Ok(())
    }

    /// Close the connection, then dispose sources newest first, then the
    /// factory.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let (connection, sources, factory, pending) = {
            let mut inner = lock(&self.inner);
            (
                inner.connection.take(),
                std::mem::take(&mut inner.sources),
                inner.factory.take(),
                inner.pending_local.take(),
            )
        };

        if let Some(connection) = connection {
            connection.close();
        }
        for mut source in sources.into_iter().rev() {
            debug!(source = source.label(), "disposing media source");
            source.dispose();
        }
        if let Some(mut factory) = factory {
            factory.dispose();
        }
        drop(pending);
        debug!("peer connection released");
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Store `done` as the pending local description request and return the
    /// connection to drive, or fail `done` if there is none.
    fn arm(&mut self, done: Completion<String>) -> Option<Arc<dyn PeerConnection>> {
        let mut inner = lock(&self.inner);
        match inner.connection.clone() {
            Some(connection) => {
                let previous = inner.pending_local.replace(done);
                drop(inner);
                if previous.is_some() {
                    warn!("new local description request replaces a pending one");
                }
                drop(previous);
                Some(connection)
            }
            None => {
                drop(inner);
                done.fail(SessionError::local_media("peer connection disposed"));
                None
            }
        }
    }
}

impl fmt::Debug for PeerConnectionNegotiation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnectionNegotiation")
            .field("constraints", &self.constraints)
            .field("released", &self.released)
            .finish()
    }
}

/// Run `f` on the bound executor, or inline when none is bound.
fn hop<F>(weak: &Weak<Mutex<PeerInner>>, f: F)
where
    F: FnOnce(&Arc<Mutex<PeerInner>>) + Send + 'static,
{
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let executor = lock(&inner).executor.clone();
    match executor {
        Some(executor) => {
            let weak = weak.clone();
            drop(inner);
            if !executor.post(move || {
                if let Some(inner) = weak.upgrade() {
                    f(&inner);
                }
            }) {
                debug!("executor gone; dropping peer connection callback");
            }
        }
        None => f(&inner),
    }
}

fn current_connection(inner: &Arc<Mutex<PeerInner>>) -> Option<Arc<dyn PeerConnection>> {
    lock(inner).connection.clone()
}

fn fail_pending(inner: &Arc<Mutex<PeerInner>>, message: impl Into<String>) {
    let message: String = message.into();
    let pending = lock(inner).pending_local.take();
    match pending {
        Some(done) => done.fail(SessionError::LocalMedia(message)),
        None => warn!(error = %message, "peer connection failure with no pending request"),
    }
}

/// Set the freshly created description as local and wait for gathering.
fn commit_local(inner: &Arc<Mutex<PeerInner>>, description: PeerDescription) {
    let Some(connection) = current_connection(inner) else {
        fail_pending(inner, "peer connection disposed");
        return;
    };
    let weak = Arc::downgrade(inner);
    connection.set_local_description(
        description,
        Box::new(move |result| {
            hop(&weak, move |inner| match result {
                Err(e) => fail_pending(inner, format!("set local description failed: {e}")),
                Ok(()) => {
                    let complete = current_connection(inner)
                        .map(|c| c.ice_gathering_state() == IceGatheringState::Complete)
                        .unwrap_or(false);
                    if complete {
                        deliver_local(inner, false);
                    } else {
                        debug!("local description set; waiting for ICE gathering");
                    }
                }
            });
        }),
    );
}

/// Hand the gathered local description to the pending request.
fn deliver_local(inner: &Arc<Mutex<PeerInner>>, from_gathering_event: bool) {
    let (pending, connection) = {
        let mut guard = lock(inner);
        let pending = guard.pending_local.take();
        (pending, guard.connection.clone())
    };
    let Some(done) = pending else {
        if from_gathering_event {
            warn!("ICE gathering complete but no local description was requested");
        }
        return;
    };
    let Some(connection) = connection else {
        done.fail(SessionError::local_media("peer connection disposed"));
        return;
    };
    match connection.local_description() {
        Some(description) => done.succeed(description.to_wire()),
        None => done.fail(SessionError::local_media("local SDP is null")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::mpsc;

    /// Connection that answers every call inline and completes gathering as
    /// soon as a local description is set.
    #[derive(Default)]
    struct InlineConnection {
        local: Mutex<Option<PeerDescription>>,
        remote: Mutex<Option<PeerDescription>>,
        gathering: Mutex<Option<GatheringHandler>>,
        log: Arc<Mutex<Vec<String>>>,
        fail_offer: bool,
        lose_local: bool,
    }

    impl PeerConnection for InlineConnection {
        fn create_offer(&self, _c: OfferConstraints, done: SdpCallback<PeerDescription>) {
            if self.fail_offer {
                done(Err("no codecs".into()));
            } else {
                done(Ok(PeerDescription::offer("v=0\r\ns=offer\r\n")));
            }
        }

        fn create_answer(&self, _c: OfferConstraints, done: SdpCallback<PeerDescription>) {
            done(Ok(PeerDescription::answer("v=0\r\ns=answer\r\n")));
        }

        fn set_local_description(&self, d: PeerDescription, done: SdpCallback<()>) {
            if !self.lose_local {
                *self.local.lock().unwrap() = Some(PeerDescription {
                    kind: d.kind,
                    sdp: format!("{}a=candidate:1\r\n", d.sdp),
                });
            }
            done(Ok(()));
            if let Some(handler) = self.gathering.lock().unwrap().as_ref() {
                handler(IceGatheringState::Gathering);
                handler(IceGatheringState::Complete);
            }
        }

        fn set_remote_description(&self, d: PeerDescription, done: SdpCallback<()>) {
            *self.remote.lock().unwrap() = Some(d);
            done(Ok(()));
        }

        fn local_description(&self) -> Option<PeerDescription> {
            self.local.lock().unwrap().clone()
        }

        fn ice_gathering_state(&self) -> IceGatheringState {
            IceGatheringState::New
        }

        fn on_ice_gathering_change(&self, handler: GatheringHandler) {
            *self.gathering.lock().unwrap() = Some(handler);
        }

        fn close(&self) {
            self.log.lock().unwrap().push("close".into());
        }
    }

    struct Source(&'static str, Arc<Mutex<Vec<String>>>);

    impl MediaSource for Source {
        fn label(&self) -> &str {
            self.0
        }

        fn dispose(&mut self) {
            self.1.lock().unwrap().push(format!("dispose {}", self.0));
        }
    }

    struct Factory(Arc<Mutex<Vec<String>>>);

    impl PeerFactory for Factory {
        fn dispose(&mut self) {
            self.0.lock().unwrap().push("dispose factory".into());
        }
    }

    fn capture<T: Send + 'static>() -> (Completion<T>, mpsc::Receiver<Result<T, SessionError>>) {
        let (tx, rx) = mpsc::channel();
        (Completion::new(move |r| tx.send(r).unwrap()), rx)
    }

    #[test]
    fn test_offer_delivered_after_gathering() {
        let conn = Arc::new(InlineConnection::default());
        let mut n = PeerConnectionNegotiation::new(conn.clone(), OfferConstraints::default());
        let (done, rx) = capture();
        n.generate_local_offer(done);
        let sdp = rx.recv().unwrap().unwrap();
        assert!(sdp.contains("s=offer"));
        assert!(sdp.contains("a=candidate:1"));
    }

    #[test]
    fn test_offer_on_executor() {
        let exec = SerialExecutor::spawn("peer-test").unwrap();
        let conn = Arc::new(InlineConnection::default());
        let mut n = PeerConnectionNegotiation::new(conn, OfferConstraints::default());
        n.bind_executor(exec.clone());

        let (tx, rx) = mpsc::channel();
        let probe = exec.clone();
        n.generate_local_offer(Completion::new(move |r: Result<String, SessionError>| {
            tx.send((r, probe.is_current())).unwrap()
        }));
        let (result, on_executor) = rx.recv().unwrap();
        assert!(result.is_ok());
        assert!(on_executor);
        exec.quit();
        exec.join();
    }

    #[test]
    fn test_create_offer_failure() {
        let conn = Arc::new(InlineConnection {
            fail_offer: true,
            ..Default::default()
        });
        let mut n = PeerConnectionNegotiation::new(conn, OfferConstraints::default());
        let (done, rx) = capture();
        n.generate_local_offer(done);
        let err = rx.recv().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LocalMedia);
        assert!(err.to_string().contains("no codecs"));
    }

    #[test]
    fn test_missing_local_description() {
        let conn = Arc::new(InlineConnection {
            lose_local: true,
            ..Default::default()
        });
        let mut n = PeerConnectionNegotiation::new(conn, OfferConstraints::default());
        let (done, rx) = capture();
        n.generate_local_offer(done);
        assert_eq!(
            rx.recv().unwrap().unwrap_err(),
            SessionError::local_media("local SDP is null")
        );
    }

    #[test]
    fn test_answerer_path() {
        let conn = Arc::new(InlineConnection::default());
        let mut n = PeerConnectionNegotiation::new(conn.clone(), OfferConstraints::default());
        let (done, rx) = capture();
        n.generate_local_answer("v=0\r\ns=remote\r\n".into(), done);
        assert!(rx.recv().unwrap().unwrap().contains("s=answer"));
        assert_eq!(
            conn.remote.lock().unwrap().as_ref().map(|d| d.kind),
            Some(SdpKind::Offer)
        );
    }

    #[test]
    fn test_apply_answer_sets_remote() {
        let conn = Arc::new(InlineConnection::default());
        let mut n = PeerConnectionNegotiation::new(conn.clone(), OfferConstraints::default());
        let (done, rx) = capture();
        n.apply_remote_answer("v=0\r\ns=answer\r\n".into(), done);
        assert_eq!(rx.recv().unwrap(), Ok(()));
        assert_eq!(
            conn.remote.lock().unwrap().clone(),
            Some(PeerDescription::answer("v=0\r\ns=answer\r\n"))
        );
        assert!(n.confirm().is_ok());
    }

    #[test]
    fn test_release_order_and_idempotence() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let conn = Arc::new(InlineConnection {
            log: log.clone(),
            ..Default::default()
        });
        let mut n = PeerConnectionNegotiation::new(conn, OfferConstraints::default())
            .with_source(Box::new(Source("audio", log.clone())))
            .with_source(Box::new(Source("video", log.clone())))
            .with_factory(Box::new(Factory(log.clone())));

        n.release();
        n.release();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["close", "dispose video", "dispose audio", "dispose factory"]
        );

        let (done, rx) = capture();
        n.generate_local_offer(done);
        assert_eq!(
            rx.recv().unwrap().unwrap_err(),
            SessionError::local_media("peer connection disposed")
        );
    }

    #[test]
    fn test_offer_constraints_from_directions() {
        let c = OfferConstraints::from(&Constraints::default());
        assert!(c.offer_to_receive_video);
        assert!(!c.offer_to_receive_audio);
    }

    #[test]
    fn test_wire_round_trip() {
        let desc = PeerDescription::answer("v=0\r\ns=-\r\n");
        assert_eq!(PeerDescription::from_wire(SdpKind::Answer, &desc.to_wire()), desc);

        let json = serde_json::to_string(&desc).unwrap();
        assert_eq!(json, r#"{"type":"answer","sdp":"v=0\r\ns=-\r\n"}"#);
    }
}
