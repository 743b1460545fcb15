use super::candidate::*;
use shared::error::Error;

#[test]
fn test_parse_host_candidate() {
    let cand = IceCandidate::new(
        "candidate:4234997325 1 udp 2043278322 192.168.0.56 44323 typ host",
        "audio0",
        0,
    )
    .unwrap();

    assert_eq!(cand.foundation(), "4234997325");
    assert_eq!(cand.component_id(), RTP_COMPONENT);
    assert_eq!(cand.protocol(), CandidateProtocol::Udp);
    assert_eq!(cand.priority(), 2043278322);
    assert_eq!(cand.address(), "192.168.0.56");
    assert_eq!(cand.port(), 44323);
    assert_eq!(cand.candidate_type(), CandidateType::Host);
    assert_eq!(cand.sdp_mid(), "audio0");
    assert_eq!(cand.sdp_m_line_index(), 0);
    assert!(cand.related_address().is_none());
}

#[test]
fn test_parse_srflx_with_related() {
    let cand = IceCandidate::new(
        "candidate:647372371 2 udp 1694302207 203.0.113.7 50254 typ srflx raddr 192.168.0.56 rport 50254",
        "video0",
        1,
    )
    .unwrap();

    assert_eq!(cand.component_id(), RTCP_COMPONENT);
    assert_eq!(cand.candidate_type(), CandidateType::ServerReflexive);
    assert_eq!(cand.related_address(), Some("192.168.0.56"));
    assert_eq!(cand.related_port(), Some(50254));
}

#[test]
fn test_parse_accepts_attribute_prefix() {
    let cand = IceCandidate::new(
        "a=candidate:1 1 UDP 2013266431 10.0.0.1 3478 typ relay raddr 10.0.0.2 rport 3478",
        "data",
        0,
    )
    .unwrap();
    assert_eq!(cand.candidate_type(), CandidateType::Relay);
    assert!(cand.candidate_str().starts_with("candidate:1 1 UDP"));
}

#[test]
fn test_parse_failures_yield_no_object() {
    for raw in [
        "",
        "candidate:1 1 udp",
        "candidate:1 x udp 1 10.0.0.1 1000 typ host",
        "candidate:1 1 sctp 1 10.0.0.1 1000 typ host",
        "candidate:1 1 udp 1 10.0.0.1 70000 typ host",
        "candidate:1 1 udp 1 10.0.0.1 1000 typx host",
        "candidate:1 1 udp 1 10.0.0.1 1000 typ bogus",
    ] {
        let result = IceCandidate::new(raw, "m", 0);
        assert!(
            matches!(result, Err(Error::ErrInvalidCandidate(_))),
            "{raw:?} should not parse"
        );
    }
}

#[test]
fn test_set_address_rewrites_string_and_field() {
    let mut cand = IceCandidate::new(
        "candidate:1 1 udp 2043278322 192.168.0.56 44323 typ host",
        "audio0",
        0,
    )
    .unwrap();

    cand.set_address("198.51.100.4");
    assert_eq!(cand.address(), "198.51.100.4");
    assert_eq!(
        cand.candidate_str(),
        "candidate:1 1 udp 2043278322 198.51.100.4 44323 typ host"
    );
}

#[test]
fn test_for_media_copy() {
    let cand = IceCandidate::new(
        "candidate:1 1 udp 2043278322 192.168.0.56 44323 typ host",
        "audio0",
        0,
    )
    .unwrap();

    let copy = cand.for_media("video0", 1);
    assert_eq!(copy.sdp_mid(), "video0");
    assert_eq!(copy.sdp_m_line_index(), 1);
    assert_eq!(copy.candidate_str(), cand.candidate_str());
}
