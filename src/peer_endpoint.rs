//! Top-level orchestrator: SDP generation/parsing, the Data Channel
//! registry, and the wiring between ICE, DTLS and SCTP.

use crate::constants::{
    ANSWER_SCTP_MAX_MESSAGE_SIZE, PPID_BINARY, PPID_BINARY_EMPTY, PPID_CONTROL, PPID_STRING,
    PPID_STRING_EMPTY, SCTP_PORT,
};
use crate::data_channel::message::{DcepMessage, DcepOpen};
use crate::data_channel::registry::ChannelRegistry;
use crate::data_channel::{ChannelKind, DataChannel, DataChannelState};
use crate::dtls_transport::DtlsTransport;
use crate::error::{Error, Result};
use crate::ice_transport::{IceServer, IceTransport};
use crate::role::Role;
use crate::sctp_transport::{InboundMessage, PayloadKind, ResetEvent, SctpTransport};
use crate::sdp;
use bytes::Bytes;
use log::{debug, trace, warn};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Configuration accepted by [`PeerEndpoint::new`].
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub ice_servers: Vec<IceServer>,
    pub sctp_max_message_size: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            sctp_max_message_size: crate::constants::DEFAULT_SCTP_MAX_MESSAGE_SIZE,
        }
    }
}

/// A lightweight handle to a data channel, delivered to `on_new_channel` and
/// returned by `open_channel`. Holds no reference back to `PeerEndpoint`
/// itself (see module docs on the channel/endpoint ownership cycle).
#[derive(Debug, Clone)]
pub struct DataChannelHandle {
    pub sid: u16,
    pub label: String,
    pub protocol: String,
    pub kind: ChannelKind,
}

/// Messages delivered to the application once a channel is open.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Text(String),
    Binary(Bytes),
    Closed,
}

type OnNewChannel = Box<dyn Fn(DataChannelHandle) + Send + Sync>;
type OnChannelEvent = Box<dyn Fn(u16, ChannelEvent) + Send + Sync>;

/// Binds one ICE/DTLS/SCTP stack to exactly one remote peer, exposing the
/// WebRTC data-channel surface (offer/answer, trickle ICE, open/send/close).
pub struct PeerEndpoint {
    session_id: String,
    role: Mutex<Role>,
    mid: Mutex<Option<String>>,
    max_message_size: usize,
    stopped: AtomicBool,
    has_generated_offer: AtomicBool,
    has_parsed_remote: AtomicBool,

    ice: Arc<IceTransport>,
    dtls: Arc<DtlsTransport>,
    sctp: Arc<SctpTransport>,

    registry: Mutex<ChannelRegistry>,
    ice_send: mpsc::UnboundedSender<Bytes>,
    on_new_channel: Arc<OnNewChannel>,
    on_channel_event: Arc<OnChannelEvent>,
}

/// Every endpoint here speaks to exactly one peer; the transports below ICE
/// don't need a real socket address to key their association state, so a
/// fixed placeholder stands in for "the one peer this endpoint talks to".
fn placeholder_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), SCTP_PORT)
}

impl PeerEndpoint {
    pub fn new(
        config: PeerConfig,
        on_local_candidate: impl Fn(String) + Send + Sync + 'static,
        on_new_channel: impl Fn(DataChannelHandle) + Send + Sync + 'static,
        on_channel_event: impl Fn(u16, ChannelEvent) + Send + Sync + 'static,
    ) -> Result<Arc<Self>> {
        let peer_addr = placeholder_addr();
        let role = Role::default();

        let ice = Arc::new(IceTransport::new(
            &config.ice_servers,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            role == Role::Client,
        )?);
        let dtls = Arc::new(DtlsTransport::new(role, peer_addr)?);
        let sctp = Arc::new(SctpTransport::new(
            peer_addr,
            peer_addr,
            config.sctp_max_message_size,
            role,
        )?);

        let (ice_send_tx, ice_send_rx) = mpsc::unbounded_channel();
        let (ice_to_dtls_tx, ice_to_dtls_rx) = mpsc::unbounded_channel();
        let (dtls_to_ice_tx, mut dtls_to_ice_rx) = mpsc::unbounded_channel();
        let (dtls_to_sctp_tx, dtls_to_sctp_rx) = mpsc::unbounded_channel();
        let (sctp_to_dtls_tx, mut sctp_to_dtls_rx) = mpsc::unbounded_channel();
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        let (reset_tx, mut reset_rx) = mpsc::unbounded_channel();
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let (candidate_tx, mut candidate_rx) = mpsc::unbounded_channel();

        ice.clone()
            .spawn_gathering(candidate_tx, ice_send_rx, ice_to_dtls_tx);
        dtls.clone()
            .spawn(ice.clone(), ice_to_dtls_rx, dtls_to_ice_tx, dtls_to_sctp_tx);
        sctp.clone().spawn_recv_pump(
            dtls_to_sctp_rx,
            sctp_to_dtls_tx,
            inbound_tx,
            reset_tx,
            control_tx,
        );

        // Re-encrypt every SCTP-generated datagram before it reaches ICE.
        {
            let dtls = dtls.clone();
            let ice_send_tx = ice_send_tx.clone();
            tokio::spawn(async move {
                while let Some(plaintext) = sctp_to_dtls_rx.recv().await {
                    match dtls.encrypt(&plaintext).await {
                        Ok(outbound) => {
                            for raw in outbound {
                                let _ = ice_send_tx.send(raw);
                            }
                        }
                        Err(err) => warn!("dtls encrypt failed: {err}"),
                    }
                }
            });
        }

        // Forward DTLS-encrypted records out to the ICE send worker.
        {
            let ice_send_tx = ice_send_tx.clone();
            tokio::spawn(async move {
                while let Some(raw) = dtls_to_ice_rx.recv().await {
                    let _ = ice_send_tx.send(raw);
                }
            });
        }

        // Candidate sentinel forwarding to the user callback.
        {
            tokio::spawn(async move {
                while let Some(line) = candidate_rx.recv().await {
                    on_local_candidate(line);
                }
            });
        }

        let endpoint = Arc::new(Self {
            session_id: sdp::generate_session_id(),
            role: Mutex::new(role),
            mid: Mutex::new(None),
            max_message_size: config.sctp_max_message_size,
            stopped: AtomicBool::new(false),
            has_generated_offer: AtomicBool::new(false),
            has_parsed_remote: AtomicBool::new(false),
            ice,
            dtls,
            sctp,
            registry: Mutex::new(ChannelRegistry::new()),
            ice_send: ice_send_tx,
            on_new_channel: Arc::new(Box::new(on_new_channel)),
            on_channel_event: Arc::new(Box::new(on_channel_event)),
        });

        // SCTP connects once the DTLS handshake completes; the side that's
        // DTLS `Client` also drives SCTP INIT. The `Server` side never calls
        // `connect()` itself, so it releases its own recv pump's
        // `wait_connect_sent_data` gate here instead, at the same handshake
        // checkpoint the `Client` side uses.
        {
            let endpoint = endpoint.clone();
            tokio::spawn(async move {
                endpoint.dtls.wait_handshake_done().await;
                debug!("dtls handshake done, role={}", *endpoint.role.lock().await);
                if *endpoint.role.lock().await == Role::Client {
                    match endpoint.sctp.connect().await {
                        Ok(outbound) => endpoint.relay_sctp_outbound(outbound).await,
                        Err(err) => warn!("sctp connect failed: {err}"),
                    }
                } else {
                    endpoint.sctp.notify_connect_sent_data().await;
                }
            });
        }

        // Inbound data dispatcher.
        {
            let endpoint = endpoint.clone();
            tokio::spawn(async move {
                while let Some(msg) = inbound_rx.recv().await {
                    endpoint.dispatch_inbound(msg).await;
                }
            });
        }

        // Stream-reset dispatcher.
        {
            let endpoint = endpoint.clone();
            tokio::spawn(async move {
                while let Some(event) = reset_rx.recv().await {
                    endpoint.dispatch_reset(event).await;
                }
            });
        }

        // DCEP control dispatcher.
        {
            let endpoint = endpoint.clone();
            tokio::spawn(async move {
                while let Some((sid, msg)) = control_rx.recv().await {
                    endpoint.dispatch_control(sid, msg).await;
                }
            });
        }

        Ok(endpoint)
    }

    /// Emits SDP with `a=setup:actpass` and the default offerer media line.
    pub async fn generate_offer(&self) -> Result<String> {
        self.has_generated_offer.store(true, Ordering::Release);
        let ice_lines = self.ice.generate_local_sdp_lines().await?;
        Ok(sdp::generate_offer(
            &self.session_id,
            &ice_lines,
            &self.dtls.fingerprint().to_string(),
            self.max_message_size,
        ))
    }

    /// Parses a remote SDP (offer or answer): resolves role from `a=setup:`,
    /// records `a=mid:` if present, then hands the body to ICE.
    ///
    /// The first remote SDP a side ever sees is an offer if it never emitted
    /// one itself first, which makes it the ICE-controlled answerer rather
    /// than the default controlling offerer.
    pub async fn parse_offer(&self, remote_sdp: &str) -> Result<()> {
        let is_first_remote_sdp = !self.has_parsed_remote.swap(true, Ordering::AcqRel);
        if is_first_remote_sdp && !self.has_generated_offer.load(Ordering::Acquire) {
            self.ice.set_controlling(false).await;
        }

        let (setup, mid) = sdp::scan_setup_and_mid(remote_sdp);
        if let Some(setup) = setup {
            let mut role = self.role.lock().await;
            *role = role.resolve(&setup);
        }
        if let Some(mid) = mid {
            *self.mid.lock().await = Some(mid);
        }
        self.ice.parse_remote_sdp(remote_sdp).await?;
        Ok(())
    }

    /// Emits the answer SDP: `a=setup:` is the complement of our resolved role.
    pub async fn generate_answer(&self) -> Result<String> {
        let role = *self.role.lock().await;
        let mid = self.mid.lock().await.clone().unwrap_or_else(|| "0".into());
        let ice_lines = self.ice.generate_local_sdp_lines().await?;
        Ok(sdp::generate_answer(
            &self.session_id,
            role,
            &mid,
            &ice_lines,
            &self.dtls.fingerprint().to_string(),
            ANSWER_SCTP_MAX_MESSAGE_SIZE,
        ))
    }

    pub async fn add_remote_candidate(&self, sdp_line: &str) -> Result<bool> {
        self.ice.add_remote_candidate(sdp_line).await
    }

    /// Opens a new locally-initiated channel: allocates an sid, registers it
    /// `Connecting`, and sends the DCEP OPEN control message.
    pub async fn open_channel(
        &self,
        label: &str,
        protocol: &str,
        kind: ChannelKind,
        reliability: u32,
    ) -> Result<DataChannelHandle> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::Stopped);
        }

        let role = *self.role.lock().await;
        let sid = {
            let mut registry = self.registry.lock().await;
            let sid = registry.next_local_sid(role);
            registry.insert(DataChannel::new_connecting(
                sid,
                kind,
                label.to_string(),
                protocol.to_string(),
                reliability,
            ));
            sid
        };

        let open = DcepMessage::Open(DcepOpen {
            channel_kind: kind,
            priority: 0,
            reliability_parameter: reliability,
            label: label.to_string(),
            protocol: protocol.to_string(),
        });
        self.send_control(sid, open).await?;

        Ok(DataChannelHandle {
            sid,
            label: label.to_string(),
            protocol: protocol.to_string(),
            kind,
        })
    }

    pub async fn send_text(&self, sid: u16, text: String) -> Result<()> {
        let ppid = if text.is_empty() {
            PPID_STRING_EMPTY
        } else {
            PPID_STRING
        };
        self.send_payload(sid, ppid, Bytes::from(text)).await
    }

    pub async fn send_binary(&self, sid: u16, payload: Bytes) -> Result<()> {
        let ppid = if payload.is_empty() {
            PPID_BINARY_EMPTY
        } else {
            PPID_BINARY
        };
        self.send_payload(sid, ppid, payload).await
    }

    async fn send_payload(&self, sid: u16, ppid: u32, payload: Bytes) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::Stopped);
        }
        let (kind, reliability) = match self.registry.lock().await.get(sid) {
            Some(channel) => (channel.kind, channel.reliability),
            None => return Err(Error::UnknownChannel),
        };
        let handle = self.sctp.wait_for_handle().await;
        let outbound = self
            .sctp
            .send(handle, sid, kind, reliability, ppid, payload)
            .await?;
        self.relay_sctp_outbound(outbound).await;
        Ok(())
    }

    /// DCEP control messages (OPEN/ACK/CLOSE) are always sent reliable and
    /// ordered per RFC 8832, independent of the data channel's own kind.
    async fn send_control(&self, sid: u16, msg: DcepMessage) -> Result<()> {
        let handle = self.sctp.wait_for_handle().await;
        let outbound = self
            .sctp
            .send(
                handle,
                sid,
                ChannelKind::ReliableOrdered,
                0,
                PPID_CONTROL,
                msg.marshal(),
            )
            .await?;
        self.relay_sctp_outbound(outbound).await;
        Ok(())
    }

    async fn relay_sctp_outbound(&self, datagrams: Vec<Bytes>) {
        for raw in datagrams {
            match self.dtls.encrypt(&raw).await {
                Ok(ciphertext) => {
                    for packet in ciphertext {
                        let _ = self.ice_send.send(packet);
                    }
                }
                Err(err) => warn!("dtls encrypt failed: {err}"),
            }
        }
    }

    /// Issues an outgoing stream reset for `sid`; completion of the reset
    /// later synthesizes a DC_CLOSE via `dispatch_reset`.
    pub async fn close_channel(&self, sid: u16) -> Result<()> {
        if let Some(channel) = self.registry.lock().await.get_mut(sid) {
            channel.state = DataChannelState::Closing;
        } else {
            return Err(Error::UnknownChannel);
        }
        let handle = self.sctp.wait_for_handle().await;
        let outbound = self.sctp.reset_stream(handle, sid).await?;
        self.relay_sctp_outbound(outbound).await;
        Ok(())
    }

    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    async fn dispatch_inbound(&self, msg: InboundMessage) {
        let registered = self.registry.lock().await.contains(msg.sid);
        if !registered {
            warn!("dropping message for unknown sid {}", msg.sid);
            return;
        }
        let event = match msg.kind {
            PayloadKind::Text => match String::from_utf8(msg.payload.to_vec()) {
                Ok(text) => ChannelEvent::Text(text),
                Err(_) => {
                    warn!("dropping non-utf8 text message on sid {}", msg.sid);
                    return;
                }
            },
            PayloadKind::TextEmpty => ChannelEvent::Text(String::new()),
            PayloadKind::Binary => ChannelEvent::Binary(msg.payload),
            PayloadKind::BinaryEmpty => ChannelEvent::Binary(Bytes::new()),
            PayloadKind::Control => return,
        };
        (self.on_channel_event)(msg.sid, event);
    }

    async fn dispatch_control(&self, sid: u16, msg: DcepMessage) {
        match msg {
            DcepMessage::Open(open) => {
                let handle = {
                    let mut registry = self.registry.lock().await;
                    if registry.contains(sid) {
                        None
                    } else {
                        registry.insert(DataChannel::new_open(
                            sid,
                            open.channel_kind,
                            open.label.clone(),
                            open.protocol.clone(),
                            open.reliability_parameter,
                        ));
                        Some(DataChannelHandle {
                            sid,
                            label: open.label,
                            protocol: open.protocol,
                            kind: open.channel_kind,
                        })
                    }
                };
                if let Some(handle) = handle {
                    if self.send_control(sid, DcepMessage::Ack).await.is_ok() {
                        (self.on_new_channel)(handle);
                    }
                }
            }
            DcepMessage::Ack => {
                let handle = {
                    let mut registry = self.registry.lock().await;
                    registry.get_mut(sid).map(|channel| {
                        channel.state = DataChannelState::Open;
                        DataChannelHandle {
                            sid,
                            label: channel.label.clone(),
                            protocol: channel.protocol.clone(),
                            kind: channel.kind,
                        }
                    })
                };
                if let Some(handle) = handle {
                    (self.on_new_channel)(handle);
                } else {
                    warn!("ACK for unknown sid {sid}");
                }
            }
            DcepMessage::Close => {
                self.close_channel_locally(sid).await;
            }
        }
    }

    async fn dispatch_reset(&self, event: ResetEvent) {
        match event {
            ResetEvent::PeerRequestedReset { sid } => {
                trace!("peer requested reset on sid {sid}; reciprocating");
                let _ = self.close_channel(sid).await;
            }
            ResetEvent::OurResetCompleted { sid } => {
                self.close_channel_locally(sid).await;
            }
            ResetEvent::Denied { sid } => {
                warn!("stream reset denied/failed for sid {sid}");
            }
        }
    }

    async fn close_channel_locally(&self, sid: u16) {
        if self.registry.lock().await.remove(sid).is_some() {
            (self.on_channel_event)(sid, ChannelEvent::Closed);
        }
    }
}

impl std::fmt::Debug for PeerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerEndpoint")
            .field("session_id", &self.session_id)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_config_uses_offer_max_message_size() {
        let config = PeerConfig::default();
        assert_eq!(
            config.sctp_max_message_size,
            crate::constants::DEFAULT_SCTP_MAX_MESSAGE_SIZE
        );
        assert!(config.ice_servers.is_empty());
    }
}
