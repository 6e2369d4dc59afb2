//! [`PeerConnection`] on top of the `webrtc` crate.
//!
//! Every call is spawned on the I/O runtime and reports through its
//! callback from a runtime worker. The committed local description is
//! cached when it changes so `local_description` never has to block.

use std::future::Future;
use std::sync::{Arc, Mutex, Weak};

use mediasession_common::config::DEFAULT_STUN_SERVER;
use mediasession_common::SessionConfig;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::peer::{
    GatheringHandler, IceGatheringState, MediaSource, OfferConstraints, PeerConnection,
    PeerConnectionNegotiation, PeerDescription, PeerFactory, SdpCallback, SdpKind,
};
use crate::sync::lock;

pub const LOCAL_STREAM_ID: &str = "MediaStream0";
pub const AUDIO_TRACK_ID: &str = "AudioTrack0";
pub const VIDEO_TRACK_ID: &str = "VideoTrack0";

type SharedHandler = Arc<dyn Fn(IceGatheringState) + Send + Sync + 'static>;

/// Builds the `webrtc` API once and hands out peer connections from it.
pub struct WebRtcFactory {
    api: Option<Arc<API>>,
    ice_servers: Vec<String>,
}

impl WebRtcFactory {
    /// Default codecs and interceptors, ICE servers from `stun_servers`
    /// (Google's public STUN server when empty).
    pub fn new(stun_servers: &[String]) -> Result<Self, webrtc::Error> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if stun_servers.is_empty() {
            vec![DEFAULT_STUN_SERVER.to_string()]
        } else {
            stun_servers.to_vec()
        };

        Ok(Self {
            api: Some(Arc::new(api)),
            ice_servers,
        })
    }

    /// New peer connection carrying the local audio and video tracks.
    pub async fn create_peer(
        &self,
        runtime: Handle,
    ) -> Result<(Arc<WebRtcPeer>, Vec<Box<dyn MediaSource>>), webrtc::Error> {
        let api = self
            .api
            .as_ref()
            .ok_or_else(|| webrtc::Error::new("peer factory is disposed".to_string()))?;

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);

        let mut sources: Vec<Box<dyn MediaSource>> = Vec::new();
        for (id, mime) in [(AUDIO_TRACK_ID, MIME_TYPE_OPUS), (VIDEO_TRACK_ID, MIME_TYPE_VP8)] {
            let track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime.to_string(),
                    ..Default::default()
                },
                id.to_string(),
                LOCAL_STREAM_ID.to_string(),
            ));
            let sender = pc
                .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            sources.push(Box::new(TrackSource {
                label: id.to_string(),
                sender: Some(sender),
                runtime: runtime.clone(),
            }));
        }

        Ok((WebRtcPeer::attach(pc, runtime), sources))
    }
}

impl PeerFactory for WebRtcFactory {
    fn dispose(&mut self) {
        if self.api.take().is_some() {
            debug!("webrtc API disposed");
        }
    }
}

/// Build a ready-to-use peer connection negotiation for `config`.
///
/// `runtime` should be a multi-thread runtime: teardown waits on it from
/// the session executor. On a current-thread runtime teardown is only
/// spawned and completes whenever that runtime is next driven.
pub async fn build_negotiation(
    config: &SessionConfig,
    runtime: Handle,
) -> Result<PeerConnectionNegotiation, webrtc::Error> {
    let factory = WebRtcFactory::new(&config.stun_servers)?;
    let (peer, sources) = factory.create_peer(runtime).await?;

    let mut negotiation =
        PeerConnectionNegotiation::new(peer, OfferConstraints::from(&config.constraints));
    for source in sources {
        negotiation = negotiation.with_source(source);
    }
    Ok(negotiation.with_factory(Box::new(factory)))
}

struct TrackSource {
    label: String,
    sender: Option<Arc<RTCRtpSender>>,
    runtime: Handle,
}

impl MediaSource for TrackSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn dispose(&mut self) {
        if let Some(sender) = self.sender.take() {
            let label = self.label.clone();
            drive(&self.runtime, "stop sender", async move {
                sender.stop().await?;
                debug!(track = %label, "local track stopped");
                Ok(())
            });
        }
    }
}

pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    runtime: Handle,
    local: Arc<Mutex<Option<PeerDescription>>>,
    gathering: Arc<Mutex<IceGatheringState>>,
    handler: Arc<Mutex<Option<SharedHandler>>>,
}

impl WebRtcPeer {
    fn attach(pc: Arc<RTCPeerConnection>, runtime: Handle) -> Arc<Self> {
        let peer = Arc::new(Self {
            pc: pc.clone(),
            runtime,
            local: Arc::new(Mutex::new(None)),
            gathering: Arc::new(Mutex::new(IceGatheringState::New)),
            handler: Arc::new(Mutex::new(None)),
        });

        pc.on_peer_connection_state_change(Box::new(|state: RTCPeerConnectionState| {
            info!(%state, "peer connection state changed");
            Box::pin(async {})
        }));

        pc.on_ice_candidate(Box::new(|candidate: Option<RTCIceCandidate>| {
            if let Some(candidate) = candidate {
                debug!(address = %candidate.address, port = candidate.port, "local ICE candidate");
            }
            Box::pin(async {})
        }));

        let weak_pc: Weak<RTCPeerConnection> = Arc::downgrade(&pc);
        let local = peer.local.clone();
        let gathering = peer.gathering.clone();
        let handler = peer.handler.clone();
        pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
            let weak_pc = weak_pc.clone();
            let local = local.clone();
            let gathering = gathering.clone();
            let handler = handler.clone();
            Box::pin(async move {
                let state = match state {
                    RTCIceGathererState::New => IceGatheringState::New,
                    RTCIceGathererState::Gathering => IceGatheringState::Gathering,
                    RTCIceGathererState::Complete => IceGatheringState::Complete,
                    other => {
                        debug!(state = %other, "ignoring ICE gatherer state");
                        return;
                    }
                };
                if state == IceGatheringState::Complete {
                    if let Some(pc) = weak_pc.upgrade() {
                        refresh_local(&pc, &local).await;
                    }
                }
                *lock(&gathering) = state;
                let handler = lock(&handler).clone();
                if let Some(handler) = handler {
                    handler(state);
                }
            })
        }));

        peer
    }
}

impl PeerConnection for WebRtcPeer {
    fn create_offer(&self, constraints: OfferConstraints, done: SdpCallback<PeerDescription>) {
        // Receive interest is carried by the sendrecv transceivers of the
        // local tracks; the webrtc crate has no offer-level receive flags.
        debug!(?constraints, "creating offer");
        let pc = self.pc.clone();
        self.runtime.spawn(async move {
            let result = match pc.create_offer(None).await {
                Ok(offer) => from_rtc(offer),
                Err(e) => Err(e.to_string()),
            };
            done(result);
        });
    }

    fn create_answer(&self, constraints: OfferConstraints, done: SdpCallback<PeerDescription>) {
        debug!(?constraints, "creating answer");
        let pc = self.pc.clone();
        self.runtime.spawn(async move {
            let result = match pc.create_answer(None).await {
                Ok(answer) => from_rtc(answer),
                Err(e) => Err(e.to_string()),
            };
            done(result);
        });
    }

    fn set_local_description(&self, description: PeerDescription, done: SdpCallback<()>) {
        let pc = self.pc.clone();
        let local = self.local.clone();
        self.runtime.spawn(async move {
            let result = match to_rtc(description) {
                Ok(desc) => pc.set_local_description(desc).await.map_err(|e| e.to_string()),
                Err(e) => Err(e),
            };
            if result.is_ok() {
                refresh_local(&pc, &local).await;
            }
            done(result);
        });
    }

    fn set_remote_description(&self, description: PeerDescription, done: SdpCallback<()>) {
        let pc = self.pc.clone();
        self.runtime.spawn(async move {
            let result = match to_rtc(description) {
                Ok(desc) => pc
                    .set_remote_description(desc)
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e),
            };
            done(result);
        });
    }

    fn local_description(&self) -> Option<PeerDescription> {
        lock(&self.local).clone()
    }

    fn ice_gathering_state(&self) -> IceGatheringState {
        *lock(&self.gathering)
    }

    fn on_ice_gathering_change(&self, handler: GatheringHandler) {
        *lock(&self.handler) = Some(Arc::from(handler));
    }

    fn close(&self) {
        lock(&self.handler).take();
        let pc = self.pc.clone();
        drive(&self.runtime, "close peer connection", async move {
            pc.close().await?;
            debug!("peer connection closed");
            Ok(())
        });
    }
}

async fn refresh_local(pc: &RTCPeerConnection, local: &Mutex<Option<PeerDescription>>) {
    match pc.local_description().await {
        Some(desc) => match from_rtc(desc) {
            Ok(desc) => *lock(local) = Some(desc),
            Err(e) => warn!("unusable local description: {e}"),
        },
        None => *lock(local) = None,
    }
}

/// Wait for `fut` when called off-runtime (the session executor thread)
/// and a multi-thread runtime can make progress without us, otherwise let
/// it run in the background.
fn drive<F>(runtime: &Handle, what: &'static str, fut: F)
where
    F: Future<Output = Result<(), webrtc::Error>> + Send + 'static,
{
    let can_block = Handle::try_current().is_err()
        && runtime.runtime_flavor() == RuntimeFlavor::MultiThread;
    if !can_block {
        runtime.spawn(async move {
            if let Err(e) = fut.await {
                warn!("{what} failed: {e}");
            }
        });
    } else if let Err(e) = runtime.block_on(fut) {
        warn!("{what} failed: {e}");
    }
}

fn from_rtc(desc: RTCSessionDescription) -> Result<PeerDescription, String> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        other => return Err(format!("unsupported SDP type {other}")),
    };
    Ok(PeerDescription {
        kind,
        sdp: desc.sdp,
    })
}

fn to_rtc(desc: PeerDescription) -> Result<RTCSessionDescription, String> {
    let result = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
    };
    result.map_err(|e| e.to_string())
}
