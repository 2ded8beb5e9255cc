#![warn(rust_2018_idioms)]

//! A WebRTC data-channel peer endpoint: ICE candidate trickle, DTLS
//! handshake role resolution, an SCTP association, and the Data Channel
//! control protocol (RFC 8832) multiplexed on top of it.
//!
//! [`PeerEndpoint`] is the entry point; everything else is a supporting
//! transport it drives.

pub mod constants;
pub mod data_channel;
pub mod dtls_transport;
pub mod error;
pub mod ice_transport;
pub mod peer_endpoint;
pub mod role;
pub mod sctp_transport;
pub mod sdp;

pub use data_channel::{ChannelKind, DataChannel, DataChannelState};
pub use error::{Error, Result};
pub use ice_transport::IceServer;
pub use peer_endpoint::{ChannelEvent, DataChannelHandle, PeerConfig, PeerEndpoint};
pub use role::Role;
