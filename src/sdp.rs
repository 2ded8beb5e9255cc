//! SDP generation and the narrow textual parsing this endpoint needs.
//!
//! The endpoint never needs a full SDP object model: it only ever emits a
//! fixed line skeleton and reads back `a=setup:`/`a=mid:`/`a=candidate:`
//! lines, so line scanning (as the original implementation did) is simpler
//! and just as correct as round-tripping through a parser crate.

use crate::role::Role;
use rand::Rng;

/// Generates a fresh 16-digit decimal session id.
pub fn generate_session_id() -> String {
    let mut rng = rand::rng();
    (0..16)
        .map(|_| char::from(b'0' + rng.random_range(0..10)))
        .collect()
}

/// Normalizes CRLF to LF before line-based parsing; some ICE agents treat a
/// stray `\r` as part of the ufrag/pwd value.
pub fn normalize_line_endings(sdp: &str) -> String {
    sdp.replace("\r\n", "\n")
}

/// Builds the offer SDP per the fixed line skeleton, in order.
#[allow(clippy::too_many_arguments)]
pub fn generate_offer(
    session_id: &str,
    ice_lines: &[String],
    fingerprint: &str,
    max_message_size: usize,
) -> String {
    let mut out = String::new();
    out.push_str("v=0\r\n");
    out.push_str(&format!("o=- {session_id} 0 IN IP4 0.0.0.0\r\n"));
    out.push_str("s=-\r\n");
    out.push_str("t=0 0\r\n");
    out.push_str("a=ice-options:trickle\r\n");
    out.push_str("m=application 54609 DTLS/SCTP 5000\r\n");
    out.push_str("a=msid-semantic: WMS\r\n");
    out.push_str("c=IN IP4 0.0.0.0\r\n");
    out.push_str("a=sendrecv\r\n");
    out.push_str("a=setup:actpass\r\n");
    out.push_str("a=dtls-id:1\r\n");
    for line in ice_lines {
        out.push_str(line);
        if !line.ends_with("\r\n") {
            out.push_str("\r\n");
        }
    }
    out.push_str(&format!("a=fingerprint:sha-256 {fingerprint}\r\n"));
    out.push_str(&format!(
        "a=sctpmap:5000 webrtc-datachannel {max_message_size}\r\n"
    ));
    out
}

/// Builds the answer SDP per the fixed line skeleton, in order.
pub fn generate_answer(
    session_id: &str,
    role: Role,
    mid: &str,
    ice_lines: &[String],
    fingerprint: &str,
    max_message_size: usize,
) -> String {
    let mut out = String::new();
    out.push_str("v=0\r\n");
    out.push_str(&format!("o=- {session_id} 2 IN IP4 0.0.0.0\r\n"));
    out.push_str("s=-\r\n");
    out.push_str("t=0 0\r\n");
    out.push_str("a=msid-semantic: WMS\r\n");
    out.push_str("m=application 9 DTLS/SCTP 5000\r\n");
    out.push_str("c=IN IP4 0.0.0.0\r\n");
    for line in ice_lines {
        out.push_str(line);
        if !line.ends_with("\r\n") {
            out.push_str("\r\n");
        }
    }
    out.push_str(&format!("a=fingerprint:sha-256 {fingerprint}\r\n"));
    out.push_str("a=ice-options:trickle\r\n");
    out.push_str(&format!("a=setup:{}\r\n", role.answer_setup()));
    out.push_str(&format!("a=mid:{mid}\r\n"));
    out.push_str(&format!(
        "a=sctpmap:5000 webrtc-datachannel {max_message_size}\r\n"
    ));
    out
}

/// Scans an SDP for `a=setup:` and `a=mid:`, returning whichever were found.
pub fn scan_setup_and_mid(sdp: &str) -> (Option<String>, Option<String>) {
    let normalized = normalize_line_endings(sdp);
    let mut setup = None;
    let mut mid = None;
    for line in normalized.lines() {
        if let Some(value) = line.strip_prefix("a=setup:") {
            setup = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("a=mid:") {
            mid = Some(value.trim().to_string());
        }
    }
    (setup, mid)
}

/// Scans an SDP for `a=ice-ufrag:` and `a=ice-pwd:`, returning whichever were found.
pub fn scan_ice_credentials(sdp: &str) -> (Option<String>, Option<String>) {
    let normalized = normalize_line_endings(sdp);
    let mut ufrag = None;
    let mut pwd = None;
    for line in normalized.lines() {
        if let Some(value) = line.strip_prefix("a=ice-ufrag:") {
            ufrag = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("a=ice-pwd:") {
            pwd = Some(value.trim().to_string());
        }
    }
    (ufrag, pwd)
}

/// Ensures a candidate line carries the `a=` prefix expected by the ICE agent.
pub fn ensure_attribute_prefix(line: &str) -> String {
    if line.starts_with("a=") {
        line.to_string()
    } else {
        format!("a={line}")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_generate_session_id_is_16_digits() {
        let id = generate_session_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_offer_line_order() {
        let sdp = generate_offer(
            "1234567890123456",
            &["a=ice-ufrag:abcd\r\n".to_string()],
            "AA:BB",
            262_144,
        );
        let lines: Vec<&str> = sdp.lines().collect();
        assert_eq!(lines[0], "v=0");
        assert!(lines[4].starts_with("a=ice-options:trickle"));
        assert!(lines[5].starts_with("m=application 54609 DTLS/SCTP 5000"));
        assert!(lines.iter().any(|l| *l == "a=setup:actpass"));
        assert!(sdp.ends_with("a=sctpmap:5000 webrtc-datachannel 262144\r\n"));
    }

    #[test]
    fn test_scan_setup_and_mid_roundtrip() {
        let sdp = generate_answer(
            "1234567890123456",
            Role::Server,
            "0",
            &[],
            "AA:BB",
            1024,
        );
        let (setup, mid) = scan_setup_and_mid(&sdp);
        assert_eq!(setup.as_deref(), Some("passive"));
        assert_eq!(mid.as_deref(), Some("0"));
    }

    #[test]
    fn test_answer_line_order_matches_reference_sequence() {
        let sdp = generate_answer(
            "1234567890123456",
            Role::Client,
            "0",
            &["a=candidate:1 1 udp 2122260223 10.0.0.1 54609 typ host\r\n".to_string()],
            "AA:BB",
            1024,
        );
        let lines: Vec<&str> = sdp.lines().collect();
        assert_eq!(lines[4], "a=msid-semantic: WMS");
        assert_eq!(lines[5], "m=application 9 DTLS/SCTP 5000");
        assert_eq!(lines[6], "c=IN IP4 0.0.0.0");
        assert!(lines[7].starts_with("a=candidate:"));
        assert_eq!(lines[8], "a=fingerprint:sha-256 AA:BB");
        assert_eq!(lines[9], "a=ice-options:trickle");
        assert_eq!(lines[10], "a=setup:active");
        assert_eq!(lines[11], "a=mid:0");
        assert!(!sdp.contains("a=sendrecv"));
        assert!(!sdp.contains("a=dtls-id"));
    }

    #[test]
    fn test_normalize_line_endings() {
        assert_eq!(normalize_line_endings("a=foo\r\nb=bar\r\n"), "a=foo\nb=bar\n");
    }

    #[test]
    fn test_ensure_attribute_prefix() {
        assert_eq!(ensure_attribute_prefix("candidate:1 ..."), "a=candidate:1 ...");
        assert_eq!(ensure_attribute_prefix("a=candidate:1 ..."), "a=candidate:1 ...");
    }
}
