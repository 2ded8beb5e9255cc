/// Integration tests for `PeerEndpoint`: offer/answer role resolution,
/// endpoint lifecycle, and (below) the ICE half of a loopback exchange
/// between two real in-process endpoints, each bound to its own ephemeral
/// UDP port.
use anyhow::Result;
use rtc_peer::{PeerConfig, PeerEndpoint, Role};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

fn new_endpoint() -> Result<Arc<PeerEndpoint>> {
    let candidates: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let endpoint = PeerEndpoint::new(
        PeerConfig::default(),
        {
            let candidates = candidates.clone();
            move |line| candidates.lock().unwrap().push(line)
        },
        |_handle| {},
        |_sid, _event| {},
    )?;
    Ok(endpoint)
}

#[tokio::test]
async fn test_offer_answer_resolves_complementary_roles() -> Result<()> {
    env_logger::builder().is_test(true).try_init().ok();

    let a = new_endpoint()?;
    let b = new_endpoint()?;

    let offer = a.generate_offer().await?;
    assert!(offer.contains("a=setup:actpass"));

    b.parse_offer(&offer).await?;
    let answer = b.generate_answer().await?;
    assert!(answer.contains("a=setup:active"));

    a.parse_offer(&answer).await?;

    Ok(())
}

#[tokio::test]
async fn test_stop_rejects_subsequent_open_channel() -> Result<()> {
    env_logger::builder().is_test(true).try_init().ok();

    let endpoint = new_endpoint()?;
    endpoint.stop().await;

    let result = endpoint
        .open_channel("data", "", rtc_peer::ChannelKind::ReliableOrdered, 0)
        .await;
    assert!(result.is_err());

    Ok(())
}

#[tokio::test]
async fn test_session_ids_are_unique_per_endpoint() -> Result<()> {
    let a = new_endpoint()?;
    let b = new_endpoint()?;

    let offer_a = a.generate_offer().await?;
    let offer_b = b.generate_offer().await?;
    assert_ne!(offer_a, offer_b);

    let _ = Role::Client;
    Ok(())
}

/// Wires two real endpoints together: each binds a real loopback-reachable
/// UDP socket, embeds its gathered host candidate in its own SDP, and
/// accepts the peer's candidate out of the other side's SDP through the
/// real `unmarshal_candidate`-backed parsing path. This is the ICE half of
/// the end-to-end picture; it stops short of asserting a completed DTLS
/// handshake (see `DESIGN.md` for why that's tracked separately).
#[tokio::test]
async fn test_loopback_ice_candidates_exchange_and_connectivity_starts() -> Result<()> {
    env_logger::builder().is_test(true).try_init().ok();

    let a = new_endpoint()?;
    let b = new_endpoint()?;

    let offer = a.generate_offer().await?;
    assert!(offer.contains("a=candidate:"));
    assert!(offer.contains("a=ice-ufrag:"));
    assert!(offer.contains("a=ice-pwd:"));

    b.parse_offer(&offer).await?;
    let answer = b.generate_answer().await?;
    assert!(answer.contains("a=candidate:"));

    a.parse_offer(&answer).await?;

    // Give the recv-loop tasks a chance to run a few iterations; this does
    // not assert the agents reach `Connected` (that depends on the
    // not-yet-fixed role/transport construction ordering noted in
    // DESIGN.md), only that wiring two real sockets together doesn't panic
    // or hang the endpoints.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let _ = Role::Client;
    Ok(())
}
