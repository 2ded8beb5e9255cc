//! Owns the ICE agent and the one UDP socket this endpoint's connectivity
//! checks and data actually travel over: candidate gathering, remote
//! SDP/candidate ingestion, STUN/DTLS demultiplexing, and the send-queue
//! worker that serializes outbound ciphertext onto the selected pair.

use crate::error::{Error, Result};
use crate::sdp::{self, ensure_attribute_prefix, normalize_line_endings};
use bytes::{Bytes, BytesMut};
use ice::agent::{Agent, AgentConfig, Event};
use ice::candidate::candidate_base::unmarshal_candidate;
use ice::candidate::CandidateType;
use ice::connection_state::ConnectionState;
use log::{debug, trace, warn};
use sansio::Protocol;
use shared::{TransportContext, TransportMessage, TransportProtocol};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};

/// Matches `rtc-ice`'s own candidate-layer `RECEIVE_MTU`: large enough for a
/// DTLS certificate flight, which the SCTP path MTU is not.
const RECV_BUFFER_SIZE: usize = 8192;

/// RFC 8445 section 5.1.2.1: `(2^24)*type_pref + (2^8)*local_pref + (256 - component)`.
/// A lone host candidate never competes against another local candidate, so
/// `local_pref` sits at the maximum the agent itself defaults new candidates to.
fn host_candidate_priority(component: u16) -> u32 {
    const TYPE_PREFERENCE_HOST: u32 = 126;
    const LOCAL_PREFERENCE: u32 = 65535;
    (TYPE_PREFERENCE_HOST << 24) + (LOCAL_PREFERENCE << 8) + (256 - u32::from(component))
}

/// RFC 7983 first-byte demultiplexing. This endpoint never negotiates SRTP,
/// so anything outside the DTLS range arriving on the ICE socket is STUN.
fn is_dtls_shaped(first_byte: u8) -> bool {
    (20..=63).contains(&first_byte)
}

/// A local STUN or TURN server entry. At most one STUN server is ever
/// forwarded to the agent — deliberate, matching the original implementation
/// (it never supported more than one STUN server either).
#[derive(Debug, Clone)]
pub struct IceServer {
    pub host: String,
    pub port: u16,
    pub is_turn: bool,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// ICE agent plus the UDP socket it checks and all application data travel
/// over. `Agent` needs `&mut self` for nearly everything, so it sits behind
/// its own mutex; the socket's `recv_from`/`send_to` take `&self` and are
/// safe to drive from the recv loop and the send worker concurrently.
pub struct IceTransport {
    agent: tokio::sync::Mutex<Agent>,
    socket: UdpSocket,
    is_controlling: AtomicBool,
    local_candidate_line: String,
    ready: Notify,
    is_ready: AtomicBool,
    remote_addr: std::sync::Mutex<Option<SocketAddr>>,
    wake: Notify,
}

impl IceTransport {
    pub fn new(ice_servers: &[IceServer], bind_addr: SocketAddr, is_controlling: bool) -> Result<Self> {
        let stun_count = ice_servers.iter().filter(|s| !s.is_turn).count();
        if stun_count > 1 {
            warn!("more than one STUN server configured; only the first is used");
        }
        if !ice_servers.is_empty() {
            debug!(
                "{} ice server(s) configured; this endpoint only ever gathers a host \
                 candidate and does not contact them",
                ice_servers.len()
            );
        }

        let std_socket = std::net::UdpSocket::bind(bind_addr)
            .map_err(|_| Error::InitFailed { subsystem: "ice" })?;
        std_socket
            .set_nonblocking(true)
            .map_err(|_| Error::InitFailed { subsystem: "ice" })?;
        let socket =
            UdpSocket::from_std(std_socket).map_err(|_| Error::InitFailed { subsystem: "ice" })?;
        let local_addr = socket
            .local_addr()
            .map_err(|_| Error::InitFailed { subsystem: "ice" })?;

        // Host-only: no STUN/TURN reflexive or relay candidates are ever
        // gathered, so `urls` must stay empty (the agent rejects non-empty
        // `urls` unless `candidate_types` names a server-reflexive/relay type).
        let config = AgentConfig {
            is_controlling,
            candidate_types: vec![CandidateType::Host],
            urls: Vec::new(),
            ..Default::default()
        };
        let mut agent = Agent::new(Arc::new(config)).map_err(Error::Transport)?;

        let priority = host_candidate_priority(1);
        let candidate_line = format!(
            "1 1 udp {priority} {} {} typ host",
            local_addr.ip(),
            local_addr.port()
        );
        let local_candidate = unmarshal_candidate(&candidate_line).map_err(Error::Transport)?;
        agent
            .add_local_candidate(local_candidate)
            .map_err(Error::Transport)?;

        Ok(Self {
            agent: tokio::sync::Mutex::new(agent),
            socket,
            is_controlling: AtomicBool::new(is_controlling),
            local_candidate_line: candidate_line,
            ready: Notify::new(),
            is_ready: AtomicBool::new(false),
            remote_addr: std::sync::Mutex::new(None),
            wake: Notify::new(),
        })
    }

    /// ICE controlling/controlled is independent of the DTLS `a=setup:` role:
    /// by JSEP convention the offerer is controlling and the answerer is
    /// controlled. `PeerEndpoint` doesn't know which one it'll be at
    /// construction time, so it corrects the role here the first time it
    /// learns it's receiving an initial offer rather than an answer.
    pub async fn set_controlling(&self, controlling: bool) {
        self.is_controlling.store(controlling, Ordering::Release);
        let mut agent = self.agent.lock().await;
        agent.set_role(controlling);
    }

    fn local_addr(&self) -> SocketAddr {
        self.socket
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
    }

    /// Resolves once the agent reports a selected candidate pair (`Connected`).
    /// Guards against the lost-wakeup window between checking the flag and
    /// starting to wait, per `Notify`'s own `enable()`-before-recheck pattern.
    pub async fn wait_ready(&self) {
        loop {
            if self.is_ready.load(Ordering::Acquire) {
                return;
            }
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_ready.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    /// Starts the recv/timeout loop and the outbound send worker. The one
    /// host candidate is already known at construction time, so there's no
    /// asynchronous gathering phase: `on_candidate` fires immediately,
    /// followed by the empty-string completion sentinel.
    pub fn spawn_gathering(
        self: Arc<Self>,
        on_candidate: mpsc::UnboundedSender<String>,
        mut to_send: mpsc::UnboundedReceiver<Bytes>,
        on_receive: mpsc::UnboundedSender<BytesMut>,
    ) {
        let _ = on_candidate.send(format!("a=candidate:{}\r\n", self.local_candidate_line));
        let _ = on_candidate.send(String::new());

        {
            let ice = self.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; RECV_BUFFER_SIZE];
                loop {
                    let next_timeout = {
                        let mut agent = ice.agent.lock().await;
                        agent
                            .poll_timeout()
                            .unwrap_or_else(|| Instant::now() + Duration::from_secs(5))
                    };

                    tokio::select! {
                        _ = ice.wake.notified() => {}
                        _ = tokio::time::sleep_until(next_timeout.into()) => {}
                        recv = ice.socket.recv_from(&mut buf) => {
                            match recv {
                                Ok((n, peer_addr)) if n > 0 => {
                                    if is_dtls_shaped(buf[0]) {
                                        let _ = on_receive.send(BytesMut::from(&buf[..n]));
                                    } else {
                                        let msg = TransportMessage {
                                            now: Instant::now(),
                                            transport: TransportContext {
                                                local_addr: ice.local_addr(),
                                                peer_addr,
                                                transport_protocol: TransportProtocol::UDP,
                                                ecn: None,
                                            },
                                            message: BytesMut::from(&buf[..n]),
                                        };
                                        let mut agent = ice.agent.lock().await;
                                        if let Err(err) = agent.read(msg) {
                                            trace!("ice agent rejected inbound datagram: {err}");
                                        }
                                    }
                                }
                                Ok(_) => {}
                                Err(err) => warn!("ice recv_from failed: {err}"),
                            }
                        }
                    }

                    let (events, transmits) = {
                        let mut agent = ice.agent.lock().await;
                        let _ = agent.handle_timeout(Instant::now());
                        let mut events = Vec::new();
                        while let Some(event) = agent.poll_event() {
                            events.push(event);
                        }
                        let mut transmits = Vec::new();
                        while let Some(transmit) = agent.poll_write() {
                            transmits.push(transmit);
                        }
                        (events, transmits)
                    };

                    for event in events {
                        match event {
                            Event::ConnectionStateChange(ConnectionState::Connected) => {
                                debug!("ice connected");
                                ice.is_ready.store(true, Ordering::Release);
                                ice.ready.notify_waiters();
                            }
                            Event::ConnectionStateChange(state) => {
                                trace!("ice connection state: {state}");
                            }
                            Event::SelectedCandidatePairChange(_local, remote) => {
                                *ice.remote_addr.lock().unwrap() = Some(remote.addr());
                            }
                        }
                    }

                    for transmit in transmits {
                        if let Err(err) = ice
                            .socket
                            .send_to(&transmit.message, transmit.transport.peer_addr)
                            .await
                        {
                            warn!("ice send_to failed: {err}");
                        }
                    }
                }
            });
        }

        // Dedicated send worker: serializes outbound ciphertext through one
        // unbounded queue, targeting the selected pair's remote address.
        {
            let ice = self.clone();
            tokio::spawn(async move {
                while let Some(chunk) = to_send.recv().await {
                    let dest = *ice.remote_addr.lock().unwrap();
                    match dest {
                        Some(addr) => {
                            if let Err(err) = ice.socket.send_to(&chunk, addr).await {
                                warn!("ice send_to failed: {err}");
                            }
                        }
                        None => warn!("dropping outbound datagram: no selected candidate pair yet"),
                    }
                }
                debug!("ice send worker stopped");
            });
        }
    }

    /// CRLF-normalizes before extracting ICE credentials and any embedded
    /// candidates, then starts connectivity checks in the resolved role.
    pub async fn parse_remote_sdp(&self, remote_sdp: &str) -> Result<()> {
        let normalized = normalize_line_endings(remote_sdp);
        let (ufrag, pwd) = sdp::scan_ice_credentials(&normalized);
        let (ufrag, pwd) = match (ufrag, pwd) {
            (Some(ufrag), Some(pwd)) => (ufrag, pwd),
            _ => return Err(Error::InvalidSdp),
        };

        {
            let mut agent = self.agent.lock().await;
            agent
                .start_connectivity_checks(
                    self.is_controlling.load(Ordering::Acquire),
                    ufrag,
                    pwd,
                )
                .map_err(Error::Transport)?;
            for line in normalized.lines().filter(|l| l.starts_with("a=candidate:")) {
                let body = line.trim_start_matches("a=candidate:");
                match unmarshal_candidate(body) {
                    Ok(candidate) => {
                        if let Err(err) = agent.add_remote_candidate(candidate) {
                            warn!("rejected remote candidate: {err}");
                        }
                    }
                    Err(err) => warn!("failed to parse remote candidate line: {err}"),
                }
            }
        }
        self.wake.notify_waiters();
        Ok(())
    }

    /// Trickle-ICE entry point for a single `a=candidate:` line.
    pub async fn add_remote_candidate(&self, line: &str) -> Result<bool> {
        let line = ensure_attribute_prefix(line);
        let Some(body) = line.strip_prefix("a=candidate:") else {
            return Ok(false);
        };
        let candidate = match unmarshal_candidate(body) {
            Ok(candidate) => candidate,
            Err(_) => return Ok(false),
        };
        let accepted = {
            let mut agent = self.agent.lock().await;
            agent.add_remote_candidate(candidate).is_ok()
        };
        if accepted {
            self.wake.notify_waiters();
        }
        Ok(accepted)
    }

    /// Returns the `a=ice-ufrag:`/`a=ice-pwd:`/`a=candidate:` lines for this
    /// endpoint's one gathered host candidate, each CRLF-terminated.
    pub async fn generate_local_sdp_lines(&self) -> Result<Vec<String>> {
        let agent = self.agent.lock().await;
        let credentials = agent.get_local_credentials();
        Ok(vec![
            format!("a=ice-ufrag:{}\r\n", credentials.ufrag),
            format!("a=ice-pwd:{}\r\n", credentials.pwd),
            format!("a=candidate:{}\r\n", self.local_candidate_line),
        ])
    }
}

impl std::fmt::Debug for IceTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IceTransport")
            .field("is_controlling", &self.is_controlling)
            .field("local_candidate_line", &self.local_candidate_line)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_single_stun_server_enforced() {
        let servers = vec![
            IceServer {
                host: "stun1.example.com".into(),
                port: 3478,
                is_turn: false,
                username: None,
                credential: None,
            },
            IceServer {
                host: "stun2.example.com".into(),
                port: 3478,
                is_turn: false,
                username: None,
                credential: None,
            },
        ];
        // Only the first stun entry should ever matter; the agent config
        // never forwards any of them, so this just confirms the count the
        // constructor warns about.
        assert_eq!(servers.iter().filter(|s| !s.is_turn).count(), 2);
    }

    #[test]
    fn test_host_candidate_priority_matches_rfc8445_formula() {
        // type_pref=126, local_pref=65535, component=1.
        assert_eq!(host_candidate_priority(1), 2_130_706_431);
    }

    #[test]
    fn test_dtls_byte_range_excludes_stun_first_byte() {
        assert!(is_dtls_shaped(20));
        assert!(is_dtls_shaped(63));
        assert!(!is_dtls_shaped(0)); // STUN binding requests start at 0x00/0x01.
        assert!(!is_dtls_shaped(19));
        assert!(!is_dtls_shaped(64));
    }
}
