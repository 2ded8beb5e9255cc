pub mod fingerprint;

use crate::dtls_transport::fingerprint::DtlsFingerprint;
use crate::error::{Error, Result};
use crate::role::Role;
use bytes::{Bytes, BytesMut};
use dtls::endpoint::EndpointEvent;
use log::{debug, error, trace};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::Notify;

/// Drives the DTLS handshake/record layer over ICE datagrams for exactly one
/// peer address (this endpoint never multiplexes more than one association).
///
/// Owns a self-signed certificate generated on construction and exposes its
/// fingerprint; the handshake role (client/server) is dictated by
/// `PeerEndpoint` from the resolved `Role`, never decided locally.
pub struct DtlsTransport {
    peer_addr: SocketAddr,
    fingerprint: DtlsFingerprint,
    endpoint: tokio::sync::Mutex<dtls::endpoint::Endpoint>,
    handshake_done: Notify,
}

impl DtlsTransport {
    pub fn new(role: Role, peer_addr: SocketAddr) -> Result<Self> {
        let mut params = rcgen::CertificateParams::new(vec!["webrtc".to_string()])
            .map_err(|_| Error::InitFailed { subsystem: "dtls" })?;
        params.distinguished_name = rcgen::DistinguishedName::new();
        let key_pair =
            rcgen::KeyPair::generate().map_err(|_| Error::InitFailed { subsystem: "dtls" })?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|_| Error::InitFailed { subsystem: "dtls" })?;
        let fingerprint = DtlsFingerprint::from_der(cert.der());

        let config = dtls::config::Config {
            certificates: vec![(cert.der().to_vec(), key_pair.serialize_der())],
            client: role == Role::Client,
            insecure_skip_verify: true,
            ..Default::default()
        };
        let endpoint = dtls::endpoint::Endpoint::new(config)
            .map_err(|_| Error::InitFailed { subsystem: "dtls" })?;

        Ok(Self {
            peer_addr,
            fingerprint,
            endpoint: tokio::sync::Mutex::new(endpoint),
            handshake_done: Notify::new(),
        })
    }

    pub fn fingerprint(&self) -> &DtlsFingerprint {
        &self.fingerprint
    }

    /// Feeds one ICE-delivered ciphertext datagram in, returning decrypted
    /// application records (plaintext SCTP datagrams) and any outbound
    /// handshake/record bytes to hand back to ICE.
    pub async fn handle_datagram(
        &self,
        now: Instant,
        data: BytesMut,
    ) -> Result<(Vec<BytesMut>, Vec<Bytes>)> {
        let mut endpoint = self.endpoint.lock().await;
        let mut application_data = Vec::new();
        let mut handshake_completed = false;

        for event in endpoint.read(now, self.peer_addr, None, data)? {
            match event {
                EndpointEvent::HandshakeComplete => {
                    debug!("dtls handshake complete with {}", self.peer_addr);
                    handshake_completed = true;
                }
                EndpointEvent::ApplicationData(message) => {
                    trace!("dtls decrypted {} bytes", message.len());
                    application_data.push(message);
                }
            }
        }

        let mut outbound = Vec::new();
        while let Some(transmit) = endpoint.poll_transmit() {
            outbound.push(Bytes::from(transmit.message));
        }

        drop(endpoint);
        if handshake_completed {
            self.handshake_done.notify_waiters();
        }

        Ok((application_data, outbound))
    }

    /// Encrypts one plaintext SCTP datagram for transmission over ICE.
    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<Bytes>> {
        let mut endpoint = self.endpoint.lock().await;
        endpoint.write(self.peer_addr, plaintext)?;
        let mut outbound = Vec::new();
        while let Some(transmit) = endpoint.poll_transmit() {
            outbound.push(Bytes::from(transmit.message));
        }
        Ok(outbound)
    }

    pub async fn wait_handshake_done(&self) {
        self.handshake_done.notified().await;
    }

    pub async fn handle_timeout(&self, now: Instant) -> Vec<Bytes> {
        let mut endpoint = self.endpoint.lock().await;
        let _ = endpoint.handle_timeout(self.peer_addr, now);
        let mut outbound = Vec::new();
        while let Some(transmit) = endpoint.poll_transmit() {
            outbound.push(Bytes::from(transmit.message));
        }
        outbound
    }

    pub async fn next_timeout(&self) -> Instant {
        let mut endpoint = self.endpoint.lock().await;
        let mut eto = Instant::now() + Duration::from_secs(86400);
        let _ = endpoint.poll_timeout(self.peer_addr, &mut eto);
        eto
    }

    /// Runs the handshake/record task: waits for `ice` to report a selected
    /// candidate pair, then feeds ICE bytes in, drains ciphertext out to
    /// `to_ice`, and forwards decrypted SCTP datagrams to `on_plaintext`.
    ///
    /// The handshake must not start on gathering completion alone — without a
    /// connectivity-confirmed pair there's nowhere for the first flight to go.
    pub fn spawn(
        self: std::sync::Arc<Self>,
        ice: std::sync::Arc<crate::ice_transport::IceTransport>,
        mut from_ice: mpsc::UnboundedReceiver<BytesMut>,
        to_ice: mpsc::UnboundedSender<Bytes>,
        on_plaintext: mpsc::UnboundedSender<BytesMut>,
    ) {
        tokio::spawn(async move {
            ice.wait_ready().await;
            debug!("ice ready, starting dtls handshake with {}", self.peer_addr);
            loop {
                let timeout_at = self.next_timeout().await;
                tokio::select! {
                    maybe = from_ice.recv() => {
                        match maybe {
                            Some(ciphertext) => match self.handle_datagram(Instant::now(), ciphertext).await {
                                Ok((plaintext, outbound)) => {
                                    for msg in plaintext {
                                        let _ = on_plaintext.send(msg);
                                    }
                                    for raw in outbound {
                                        let _ = to_ice.send(raw);
                                    }
                                }
                                Err(err) => error!("dtls handle_datagram error: {err}"),
                            },
                            None => break,
                        }
                    }
                    _ = tokio::time::sleep_until(timeout_at.into()) => {
                        let outbound = self.handle_timeout(Instant::now()).await;
                        for raw in outbound {
                            let _ = to_ice.send(raw);
                        }
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for DtlsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DtlsTransport")
            .field("peer_addr", &self.peer_addr)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}
