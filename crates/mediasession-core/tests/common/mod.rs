//! Scripted collaborators shared by the session integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use futures_util::future::BoxFuture;
use mediasession_common::{
    Call, JsonRpcRequest, JsonRpcResponse, ResponseResult, SessionConfig, Timeouts,
};
use mediasession_core::negotiation::{
    GatheringHandler, IceGatheringState, MediaEngine, MediaErr, MediaEvent, MediaEventKind,
    MediaEventListener, MediaSource, OfferConstraints, PeerConnection, PeerDescription,
    PeerFactory, SdpCallback,
};
use mediasession_core::sdp::SessionSpec;
use mediasession_core::{
    Negotiation, SequenceCounter, Session, SessionError, SessionInfo, SignalingTransport,
    TransportError,
};
use tokio::sync::{mpsc, oneshot, Notify};

pub const OFFER_SDP: &str = "v=0\r\n\
o=- 3 3 IN IP4 192.168.0.2\r\n\
s=-\r\n\
c=IN IP4 192.168.0.2\r\n\
t=0 0\r\n\
m=video 5004 RTP/AVP 96\r\n\
a=rtpmap:96 H264/90000\r\n\
a=sendrecv\r\n";

pub const ANSWER_SDP: &str = "v=0\r\n\
o=- 7 7 IN IP4 10.0.0.9\r\n\
s=Kurento Media Server\r\n\
c=IN IP4 10.0.0.9\r\n\
t=0 0\r\n\
m=video 40000 RTP/AVP 96\r\n\
a=rtpmap:96 H264/90000\r\n\
a=sendrecv\r\n";

pub const REMOTE_ID: &str = "remote-session-1";

pub const WAIT: Duration = Duration::from_secs(5);

/// Config with short deadlines so timeout tests stay fast.
pub fn config() -> SessionConfig {
    SessionConfig {
        timeouts: Timeouts {
            local_description_ms: Some(2_000),
            signaling_ms: Some(2_000),
            remote_description_ms: Some(2_000),
        },
        ..SessionConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Handler events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Established(SessionInfo),
    Exception(SessionInfo, SessionError),
}

pub type Events = mpsc::UnboundedReceiver<Event>;

/// Route session logs through the test harness. `RUST_LOG` picks the level.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn build_session(
    config: SessionConfig,
    negotiation: impl Into<Negotiation>,
    transport: Arc<ScriptedTransport>,
) -> (Arc<Session>, Events) {
    build_session_with(config, negotiation, transport, SequenceCounter::new())
}

pub fn build_session_with(
    config: SessionConfig,
    negotiation: impl Into<Negotiation>,
    transport: Arc<ScriptedTransport>,
    sequence: SequenceCounter,
) -> (Arc<Session>, Events) {
    init_logging();
    let (tx, rx) = mpsc::unbounded_channel();
    let established = tx.clone();
    let session = Session::builder(config)
        .negotiation(negotiation)
        .transport(transport)
        .sequence(sequence)
        .on_established(move |info| {
            let _ = established.send(Event::Established(info.clone()));
        })
        .on_exception(move |info, err| {
            let _ = tx.send(Event::Exception(info.clone(), err.clone()));
        })
        .build()
        .expect("session builds");
    (Arc::new(session), rx)
}

pub async fn next_event(events: &mut Events) -> Event {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("handler fired in time")
        .expect("handler channel open")
}

pub async fn expect_exception(events: &mut Events) -> SessionError {
    match next_event(events).await {
        Event::Exception(_, err) => err,
        other => panic!("expected exception, got {other:?}"),
    }
}

/// Waits for the session to stop and checks that no further handler fires.
pub async fn close_quietly(session: &Session, events: &mut Events) {
    tokio::time::timeout(WAIT, session.closed())
        .await
        .expect("session closed in time");
    assert!(events.try_recv().is_err(), "unexpected handler call");
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum StartReply {
    Answer,
    Response(JsonRpcResponse),
    /// Answer with the given id instead of the request's.
    WrongId(u64),
    Fail(TransportError),
    Hang,
}

/// Transport answering from a script and recording every request.
pub struct ScriptedTransport {
    reply: Mutex<StartReply>,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
    requests: Mutex<Vec<JsonRpcRequest>>,
    pub start_sent: Notify,
    pub terminate_sent: Notify,
}

impl ScriptedTransport {
    pub fn new(reply: StartReply) -> Arc<Self> {
        Arc::new(Self {
            reply: Mutex::new(reply),
            gate: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            start_sent: Notify::new(),
            terminate_sent: Notify::new(),
        })
    }

    pub fn answering() -> Arc<Self> {
        Self::new(StartReply::Answer)
    }

    /// Holds the `start` reply back until the returned sender fires.
    pub fn gated(reply: StartReply) -> (Arc<Self>, oneshot::Sender<()>) {
        let transport = Self::new(reply);
        let (tx, rx) = oneshot::channel();
        *transport.gate.lock().unwrap() = Some(rx);
        (transport, tx)
    }

    pub fn requests(&self) -> Vec<JsonRpcRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self, method: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.method() == method)
            .count()
    }

    pub fn terminated_ids(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter_map(|r| match &r.call {
                Call::Terminate(params) => Some(params.session_id.clone()),
                _ => None,
            })
            .collect()
    }
}

impl SignalingTransport for ScriptedTransport {
    fn send(
        &self,
        request: JsonRpcRequest,
    ) -> BoxFuture<'static, Result<JsonRpcResponse, TransportError>> {
        self.requests.lock().unwrap().push(request.clone());
        let id = request.id;

        if let Call::Terminate(_) = request.call {
            self.terminate_sent.notify_one();
            return Box::pin(async move {
                Ok(JsonRpcResponse::result(id, ResponseResult::default()))
            });
        }

        self.start_sent.notify_one();
        let reply = self.reply.lock().unwrap().clone();
        let gate = self.gate.lock().unwrap().take();
        Box::pin(async move {
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            match reply {
                StartReply::Answer => Ok(answer(id)),
                StartReply::Response(response) => Ok(JsonRpcResponse {
                    id: Some(id),
                    ..response
                }),
                StartReply::WrongId(other) => Ok(answer(other)),
                StartReply::Fail(err) => Err(err),
                StartReply::Hang => futures_util::future::pending().await,
            }
        })
    }
}

pub fn answer(id: u64) -> JsonRpcResponse {
    JsonRpcResponse::result(
        id,
        ResponseResult {
            sdp: Some(ANSWER_SDP.to_string()),
            session_id: Some(REMOTE_ID.to_string()),
        },
    )
}

// ---------------------------------------------------------------------------
// Direct media engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Script {
    Ok,
    Fail(MediaErr),
    Wrong(MediaEventKind),
    /// Keep the listener and never call it.
    Hang,
}

#[derive(Default)]
pub struct EngineLog {
    pub offers: usize,
    pub answers: Vec<SessionSpec>,
    pub confirmed: usize,
    pub released: usize,
}

type Hook = Box<dyn FnOnce() + Send>;

pub struct ScriptedEngine {
    offer: Script,
    answer: Script,
    /// Runs inside `process_answer`, after the listener fired.
    after_answer: Option<Hook>,
    /// Fire listeners from a separate thread, like a native callback.
    threaded: bool,
    held: Vec<MediaEventListener>,
    pub log: Arc<Mutex<EngineLog>>,
}

impl ScriptedEngine {
    pub fn new(offer: Script, answer: Script) -> Self {
        Self {
            offer,
            answer,
            after_answer: None,
            threaded: false,
            held: Vec::new(),
            log: Arc::new(Mutex::new(EngineLog::default())),
        }
    }

    pub fn ok() -> Self {
        Self::new(Script::Ok, Script::Ok)
    }

    pub fn threaded(mut self) -> Self {
        self.threaded = true;
        self
    }

    pub fn after_answer(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.after_answer = Some(Box::new(hook));
        self
    }

    pub fn into_negotiation(self) -> (Negotiation, Arc<Mutex<EngineLog>>) {
        let log = self.log.clone();
        (Negotiation::direct(Box::new(self)), log)
    }

    fn deliver(&mut self, listener: MediaEventListener, event: Option<MediaEvent>) {
        match event {
            None => self.held.push(listener),
            Some(event) if self.threaded => {
                thread::spawn(move || listener(event));
            }
            Some(event) => listener(event),
        }
    }
}

fn scripted_event(script: &Script, kind: MediaEventKind, spec: Option<SessionSpec>) -> Option<MediaEvent> {
    match script {
        Script::Ok => Some(MediaEvent::ok(kind, spec)),
        Script::Fail(err) => Some(MediaEvent::failed(kind, err.clone())),
        Script::Wrong(other) => Some(MediaEvent::ok(other.clone(), spec)),
        Script::Hang => None,
    }
}

impl MediaEngine for ScriptedEngine {
    fn generate_offer(&mut self, listener: MediaEventListener) {
        self.log.lock().unwrap().offers += 1;
        let spec = SessionSpec::parse(OFFER_SDP).ok();
        let event = scripted_event(&self.offer, MediaEventKind::OfferGenerated, spec);
        self.deliver(listener, event);
    }

    fn process_answer(&mut self, answer: SessionSpec, listener: MediaEventListener) {
        self.log.lock().unwrap().answers.push(answer);
        let event = scripted_event(&self.answer, MediaEventKind::AnswerProcessed, None);
        self.deliver(listener, event);
        if let Some(hook) = self.after_answer.take() {
            hook();
        }
    }

    fn confirm(&mut self) -> Result<(), MediaErr> {
        self.log.lock().unwrap().confirmed += 1;
        Ok(())
    }

    fn local_description(&self) -> Option<SessionSpec> {
        SessionSpec::parse(OFFER_SDP).ok()
    }

    fn remote_description(&self) -> Option<SessionSpec> {
        self.log.lock().unwrap().answers.last().cloned()
    }

    fn release(&mut self) {
        self.log.lock().unwrap().released += 1;
        self.held.clear();
    }
}

/// Slot a hook can use to reach the session it is part of.
pub type SessionSlot = Arc<Mutex<Option<Arc<Session>>>>;

pub fn terminate_from_slot(slot: &SessionSlot) -> impl FnOnce() + Send + 'static {
    let slot = slot.clone();
    move || {
        if let Some(session) = slot.lock().unwrap().take() {
            session.terminate();
        }
    }
}

// ---------------------------------------------------------------------------
// Peer connection
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct PeerBehaviour {
    pub fail_create_offer: bool,
    pub fail_set_remote: bool,
    pub never_gather: bool,
    pub drop_local_description: bool,
}

/// Peer connection whose callbacks arrive on their own threads.
pub struct FakePeer {
    behaviour: PeerBehaviour,
    local: Mutex<Option<PeerDescription>>,
    remote: Mutex<Option<PeerDescription>>,
    gathering: Mutex<IceGatheringState>,
    handler: Mutex<Option<Arc<GatheringHandler>>>,
    pub log: Arc<Mutex<Vec<String>>>,
    pub offers: AtomicUsize,
}

impl FakePeer {
    pub fn new(behaviour: PeerBehaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            local: Mutex::new(None),
            remote: Mutex::new(None),
            gathering: Mutex::new(IceGatheringState::New),
            handler: Mutex::new(None),
            log: Arc::new(Mutex::new(Vec::new())),
            offers: AtomicUsize::new(0),
        })
    }

    pub fn remote(&self) -> Option<PeerDescription> {
        self.remote.lock().unwrap().clone()
    }

    pub fn has_local(&self) -> bool {
        self.local.lock().unwrap().is_some()
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl PeerConnection for FakePeer {
    fn create_offer(&self, _constraints: OfferConstraints, done: SdpCallback<PeerDescription>) {
        self.offers.fetch_add(1, Ordering::SeqCst);
        let fail = self.behaviour.fail_create_offer;
        thread::spawn(move || {
            if fail {
                done(Err("no local media".into()));
            } else {
                done(Ok(PeerDescription::offer(OFFER_SDP)));
            }
        });
    }

    fn create_answer(&self, _constraints: OfferConstraints, done: SdpCallback<PeerDescription>) {
        thread::spawn(move || done(Ok(PeerDescription::answer(ANSWER_SDP))));
    }

    fn set_local_description(&self, description: PeerDescription, done: SdpCallback<()>) {
        if !self.behaviour.drop_local_description {
            *self.local.lock().unwrap() = Some(PeerDescription {
                kind: description.kind,
                sdp: format!("{}a=candidate:1 1 UDP 2122260223 192.168.0.2 50000 typ host\r\n", description.sdp),
            });
        }
        *self.gathering.lock().unwrap() = IceGatheringState::Gathering;
        let handler = self.handler.lock().unwrap().clone();
        let never_gather = self.behaviour.never_gather;
        thread::spawn(move || {
            done(Ok(()));
            if never_gather {
                return;
            }
            thread::sleep(Duration::from_millis(20));
            if let Some(handler) = handler {
                handler(IceGatheringState::Complete);
            }
        });
    }

    fn set_remote_description(&self, description: PeerDescription, done: SdpCallback<()>) {
        let fail = self.behaviour.fail_set_remote;
        if !fail {
            *self.remote.lock().unwrap() = Some(description);
        }
        thread::spawn(move || {
            if fail {
                done(Err("incompatible answer".into()));
            } else {
                done(Ok(()));
            }
        });
    }

    fn local_description(&self) -> Option<PeerDescription> {
        self.local.lock().unwrap().clone()
    }

    fn ice_gathering_state(&self) -> IceGatheringState {
        *self.gathering.lock().unwrap()
    }

    fn on_ice_gathering_change(&self, handler: GatheringHandler) {
        *self.handler.lock().unwrap() = Some(Arc::new(handler));
    }

    fn close(&self) {
        self.log.lock().unwrap().push("close".into());
    }
}

pub struct LoggedSource {
    pub label: &'static str,
    pub log: Arc<Mutex<Vec<String>>>,
}

impl MediaSource for LoggedSource {
    fn label(&self) -> &str {
        self.label
    }

    fn dispose(&mut self) {
        self.log.lock().unwrap().push(format!("dispose {}", self.label));
    }
}

pub struct LoggedFactory {
    pub log: Arc<Mutex<Vec<String>>>,
}

impl PeerFactory for LoggedFactory {
    fn dispose(&mut self) {
        self.log.lock().unwrap().push("dispose factory".into());
    }
}
