//! SCTP association over the DTLS transport: per-stream send/receive and
//! Data Channel control framing (stream-id allocation lives in
//! `data_channel::registry`; this module only drives the association).

use crate::constants::{
    PPID_BINARY, PPID_BINARY_EMPTY, PPID_CONTROL, PPID_STRING, PPID_STRING_EMPTY,
    SCTP_MAX_STREAMS, SCTP_PORT, SEND_RETRY_ATTEMPTS, SEND_RETRY_DELAY_MS,
};
use crate::data_channel::message::DcepMessage;
use crate::data_channel::ChannelKind;
use crate::error::{Error, Result};
use crate::role::Role;
use bytes::{Bytes, BytesMut};
use log::{debug, trace, warn};
use sctp::{
    AssociationHandle, ClientConfig, DatagramEvent, EndpointConfig, Payload,
    PayloadProtocolIdentifier, ServerConfig, StreamEvent, TransportConfig,
};
use shared::TransportProtocol;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::Notify;

/// `TransportConfig` shared by both the connecting (`ClientConfig`) and
/// accepting (`ServerConfig`) side: caps the advertised message size at the
/// negotiated `sctpmap` value and binds the well-known data channel port.
/// `rtc-sctp`'s own field-level knobs for PMTU/ECN/ASCONF/NR-SACK/max streams
/// live on its `config` module, which wasn't present to read directly; only
/// the two builder methods confirmed via the teacher's
/// `transport/sctp/mod.rs` (`with_max_message_size`/`with_sctp_port`) are
/// applied here. `SCTP_MAX_STREAMS`/`SCTP_PATH_MTU` are enforced at this
/// crate's own boundaries instead (stream-id bound and recv buffer sizing)
/// rather than threaded into a config field that can't be confirmed.
fn build_transport_config(max_message_size: usize) -> TransportConfig {
    TransportConfig::default()
        .with_max_message_size(max_message_size as u32)
        .with_sctp_port(SCTP_PORT)
}

/// What kind of application payload a received SCTP message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Control,
    Text,
    TextEmpty,
    Binary,
    BinaryEmpty,
}

pub fn ppid_to_kind(ppid: u32) -> Option<PayloadKind> {
    match ppid {
        PPID_CONTROL => Some(PayloadKind::Control),
        PPID_STRING => Some(PayloadKind::Text),
        PPID_STRING_EMPTY => Some(PayloadKind::TextEmpty),
        PPID_BINARY => Some(PayloadKind::Binary),
        PPID_BINARY_EMPTY => Some(PayloadKind::BinaryEmpty),
        _ => None,
    }
}

/// An inbound SCTP user message, already demultiplexed by PPID.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub sid: u16,
    pub kind: PayloadKind,
    pub payload: Bytes,
}

/// A stream-reset notification delivered up once the association observes it.
#[derive(Debug, Clone, Copy)]
pub enum ResetEvent {
    /// Peer asked us to reset its incoming stream `sid`; we must reciprocate
    /// with an outgoing reset on the same sid.
    PeerRequestedReset { sid: u16 },
    /// Our own previously-requested outgoing reset on `sid` has completed.
    OurResetCompleted { sid: u16 },
    /// The remote denied or failed our reset request; no state change.
    Denied { sid: u16 },
}

/// Drives one SCTP association over DTLS-decrypted datagrams.
pub struct SctpTransport {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    max_message_size: usize,
    client_transport_config: Arc<TransportConfig>,
    endpoint: tokio::sync::Mutex<sctp::Endpoint>,
    associations: tokio::sync::Mutex<HashMap<AssociationHandle, sctp::Association>>,
    connect_sent_data: Notify,
    primary_handle: tokio::sync::Mutex<Option<AssociationHandle>>,
    handle_ready: Notify,
}

impl SctpTransport {
    /// `role` decides which side of `sctp::Endpoint::new` gets a
    /// `server_config`: the DTLS-server side accepts the inbound INIT (needs
    /// `Some(ServerConfig)`), the DTLS-client side drives `connect()` itself
    /// and needs none (matches the teacher's `RTCSctpTransport::start`,
    /// which branches the same way on DTLS role).
    pub fn new(
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        max_message_size: usize,
        role: Role,
    ) -> Result<Self> {
        let endpoint_config = Arc::new(EndpointConfig::default());
        let server_config = match role {
            Role::Server => Some(Arc::new(ServerConfig::new(build_transport_config(
                max_message_size,
            )))),
            Role::Client => None,
        };
        let endpoint = sctp::Endpoint::new(local_addr, TransportProtocol::UDP, endpoint_config, server_config);
        Ok(Self {
            local_addr,
            peer_addr,
            max_message_size,
            client_transport_config: Arc::new(build_transport_config(max_message_size)),
            endpoint: tokio::sync::Mutex::new(endpoint),
            associations: tokio::sync::Mutex::new(HashMap::new()),
            connect_sent_data: Notify::new(),
            primary_handle: tokio::sync::Mutex::new(None),
            handle_ready: Notify::new(),
        })
    }

    /// Initiates the association as the SCTP-connecting side (the endpoint
    /// whose DTLS role is `Client` also drives SCTP INIT). Returns the
    /// initial outbound datagrams to hand to DTLS for encryption.
    pub async fn connect(&self) -> Result<Vec<Bytes>> {
        let client_config = ClientConfig {
            transport: self.client_transport_config.clone(),
            ..Default::default()
        };
        let (handle, conn) = {
            let mut endpoint = self.endpoint.lock().await;
            endpoint
                .connect(client_config, self.peer_addr)
                .map_err(|err| Error::SctpConnectFailed(err.to_string()))?
        };

        let mut outbound = Vec::new();
        {
            let mut associations = self.associations.lock().await;
            associations.insert(handle, conn);
            if let Some(conn) = associations.get_mut(&handle) {
                while let Some(transmit) = conn.poll_transmit(Instant::now()) {
                    if let Payload::RawEncode(raw) = transmit.message {
                        for chunk in raw {
                            outbound.push(Bytes::from(chunk));
                        }
                    }
                }
            }
        }

        self.set_primary_handle(handle).await;
        self.notify_connect_sent_data().await;
        Ok(outbound)
    }

    async fn set_primary_handle(&self, handle: AssociationHandle) {
        let mut primary = self.primary_handle.lock().await;
        if primary.is_none() {
            *primary = Some(handle);
            self.handle_ready.notify_waiters();
        }
    }

    pub async fn primary_handle(&self) -> Option<AssociationHandle> {
        *self.primary_handle.lock().await
    }

    /// Waits for the association to exist, whether we connected or the peer did.
    pub async fn wait_for_handle(&self) -> AssociationHandle {
        loop {
            if let Some(handle) = self.primary_handle().await {
                return handle;
            }
            self.handle_ready.notified().await;
        }
    }

    /// Feeds one DTLS-decrypted datagram into the association, returning any
    /// inbound user messages, stream-reset events, and outbound datagrams to
    /// hand back to DTLS for encryption.
    pub async fn handle_datagram(
        &self,
        now: Instant,
        data: BytesMut,
    ) -> Result<(Vec<InboundMessage>, Vec<ResetEvent>, Vec<Bytes>, Vec<(u16, DcepMessage)>)> {
        let mut endpoint = self.endpoint.lock().await;
        let mut associations = self.associations.lock().await;

        let mut inbound = Vec::new();
        let mut resets = Vec::new();
        let mut outbound = Vec::new();
        let mut controls = Vec::new();

        if let Some((handle, event)) = endpoint.handle(now, self.peer_addr, None, data.freeze()) {
            match event {
                DatagramEvent::NewAssociation(conn) => {
                    associations.insert(handle, conn);
                    drop(associations);
                    self.set_primary_handle(handle).await;
                    associations = self.associations.lock().await;
                }
                DatagramEvent::AssociationEvent(event) => {
                    if let Some(conn) = associations.get_mut(&handle) {
                        conn.handle_event(event);
                    }
                }
            }
        }

        let mut drained_endpoint_events = Vec::new();
        for (handle, conn) in associations.iter_mut() {
            while let Some(event) = conn.poll() {
                match event {
                    sctp::Event::Stream(StreamEvent::Readable { id }) => {
                        if let Ok(mut stream) = conn.stream(id) {
                            while let Ok(Some(chunks)) = stream.read_sctp() {
                                let mut buf = vec![0u8; self.max_message_size];
                                if let Ok(n) = chunks.read(&mut buf) {
                                    if let Some(kind) = ppid_to_kind(chunks.ppi as u32) {
                                        if kind == PayloadKind::Control {
                                            self.handle_control(id, &buf[..n], &mut controls);
                                        } else {
                                            inbound.push(InboundMessage {
                                                sid: id,
                                                kind,
                                                payload: Bytes::copy_from_slice(&buf[..n]),
                                            });
                                        }
                                    }
                                }
                            }
                        }
                    }
                    sctp::Event::Stream(StreamEvent::Reset { id, flags }) => {
                        if flags.incoming_ssn() {
                            resets.push(ResetEvent::PeerRequestedReset { sid: id });
                        }
                        if flags.outgoing_ssn() {
                            resets.push(ResetEvent::OurResetCompleted { sid: id });
                        }
                        if flags.denied() || flags.failed() {
                            warn!("stream reset denied/failed for sid {id}");
                            resets.push(ResetEvent::Denied { sid: id });
                        }
                    }
                    _ => {}
                }
            }

            while let Some(event) = conn.poll_endpoint_event() {
                drained_endpoint_events.push((*handle, event));
            }

            while let Some(transmit) = conn.poll_transmit(now) {
                if let Payload::RawEncode(raw) = transmit.message {
                    for chunk in raw {
                        outbound.push(Bytes::from(chunk));
                    }
                }
            }
        }

        for (handle, event) in drained_endpoint_events {
            endpoint.handle_event(handle, event);
            associations.remove(&handle);
        }

        Ok((inbound, resets, outbound, controls))
    }

    fn handle_control(&self, sid: u16, payload: &[u8], controls: &mut Vec<(u16, DcepMessage)>) {
        match DcepMessage::unmarshal(payload) {
            Ok(msg) => {
                trace!("sctp control message on sid {sid}");
                controls.push((sid, msg));
            }
            Err(err) => warn!("dropping malformed control message on sid {sid}: {err}"),
        }
    }

    /// Sends one user message atomically (SCTP end-of-record). `kind` selects
    /// the per-stream reliability params applied before the write, matching
    /// the teacher's `stream.set_reliability_params(...)` call ahead of
    /// `write_with_ppi` in `handler/sctp.rs`. Retries specifically on the
    /// backpressure condition (`ErrBufferFull`) up to `SEND_RETRY_ATTEMPTS`
    /// times; any other error surfaces immediately without consuming retry
    /// budget.
    pub async fn send(
        &self,
        handle: AssociationHandle,
        sid: u16,
        kind: ChannelKind,
        reliability_parameter: u32,
        ppid: u32,
        payload: Bytes,
    ) -> Result<Vec<Bytes>> {
        if sid >= SCTP_MAX_STREAMS {
            return Err(Error::UnknownChannel);
        }

        let mut associations = self.associations.lock().await;
        let conn = associations
            .get_mut(&handle)
            .ok_or(Error::SendFailed)?;
        let mut stream = conn.stream(sid).map_err(Error::Transport)?;
        let (unordered, reliability_type) = kind.reliability_params();
        stream
            .set_reliability_params(unordered, reliability_type, reliability_parameter)
            .map_err(Error::Transport)?;

        let mut attempts = 0;
        loop {
            match stream.write_with_ppi(&payload, PayloadProtocolIdentifier::from(ppid as u8)) {
                Ok(_) => break,
                Err(shared::error::Error::ErrBufferFull) if attempts < SEND_RETRY_ATTEMPTS => {
                    attempts += 1;
                    drop(stream);
                    drop(associations);
                    tokio::time::sleep(std::time::Duration::from_millis(SEND_RETRY_DELAY_MS)).await;
                    associations = self.associations.lock().await;
                    stream = associations
                        .get_mut(&handle)
                        .ok_or(Error::SendFailed)?
                        .stream(sid)
                        .map_err(Error::Transport)?;
                    stream
                        .set_reliability_params(unordered, reliability_type, reliability_parameter)
                        .map_err(Error::Transport)?;
                }
                Err(shared::error::Error::ErrBufferFull) => return Err(Error::SendFailed),
                Err(err) => return Err(Error::Transport(err)),
            }
        }

        let mut outbound = Vec::new();
        let conn = associations.get_mut(&handle).ok_or(Error::SendFailed)?;
        while let Some(transmit) = conn.poll_transmit(Instant::now()) {
            if let Payload::RawEncode(raw) = transmit.message {
                for chunk in raw {
                    outbound.push(Bytes::from(chunk));
                }
            }
        }
        Ok(outbound)
    }

    /// Issues an outgoing stream reset on `sid`; completion surfaces later as
    /// a `ResetEvent::OurResetCompleted` through the recv pump.
    pub async fn reset_stream(&self, handle: AssociationHandle, sid: u16) -> Result<Vec<Bytes>> {
        if sid >= SCTP_MAX_STREAMS {
            return Err(Error::UnknownChannel);
        }
        let mut associations = self.associations.lock().await;
        let conn = associations.get_mut(&handle).ok_or(Error::UnknownChannel)?;
        conn.stream(sid)
            .map_err(Error::Transport)?
            .reset_stream()
            .map_err(Error::Transport)?;

        let mut outbound = Vec::new();
        while let Some(transmit) = conn.poll_transmit(Instant::now()) {
            if let Payload::RawEncode(raw) = transmit.message {
                for chunk in raw {
                    outbound.push(Bytes::from(chunk));
                }
            }
        }
        Ok(outbound)
    }

    pub async fn notify_connect_sent_data(&self) {
        self.connect_sent_data.notify_waiters();
    }

    pub async fn wait_connect_sent_data(&self) {
        self.connect_sent_data.notified().await;
    }

    /// Outbound channel pair used by the recv-pump task to feed ciphertext in
    /// and drain plaintext-derived SCTP datagrams out.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn_recv_pump(
        self: std::sync::Arc<Self>,
        mut from_dtls: mpsc::UnboundedReceiver<BytesMut>,
        to_dtls: mpsc::UnboundedSender<Bytes>,
        inbound_tx: mpsc::UnboundedSender<InboundMessage>,
        reset_tx: mpsc::UnboundedSender<ResetEvent>,
        control_tx: mpsc::UnboundedSender<(u16, DcepMessage)>,
    ) {
        tokio::spawn(async move {
            self.wait_connect_sent_data().await;
            debug!("sctp recv pump started");
            while let Some(data) = from_dtls.recv().await {
                match self.handle_datagram(Instant::now(), data).await {
                    Ok((inbound, resets, outbound, controls)) => {
                        for msg in inbound {
                            let _ = inbound_tx.send(msg);
                        }
                        for reset in resets {
                            let _ = reset_tx.send(reset);
                        }
                        for raw in outbound {
                            let _ = to_dtls.send(raw);
                        }
                        for control in controls {
                            let _ = control_tx.send(control);
                        }
                    }
                    Err(err) => warn!("sctp handle_datagram error: {err}"),
                }
            }
        });
    }
}

impl std::fmt::Debug for SctpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SctpTransport")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_ppid_to_kind_mapping() {
        assert_eq!(ppid_to_kind(PPID_CONTROL), Some(PayloadKind::Control));
        assert_eq!(ppid_to_kind(PPID_STRING), Some(PayloadKind::Text));
        assert_eq!(ppid_to_kind(PPID_STRING_EMPTY), Some(PayloadKind::TextEmpty));
        assert_eq!(ppid_to_kind(PPID_BINARY), Some(PayloadKind::Binary));
        assert_eq!(ppid_to_kind(PPID_BINARY_EMPTY), Some(PayloadKind::BinaryEmpty));
        assert_eq!(ppid_to_kind(999), None);
    }
}
