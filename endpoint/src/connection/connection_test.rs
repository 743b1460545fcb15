use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::*;
use crate::ice::{IceAgent, UdpIceAgent};

fn shared_agent() -> SharedIceAgent {
    Arc::new(Mutex::new(UdpIceAgent::new()))
}

#[test]
fn test_plain_connected_requires_both_transports() {
    let agent = shared_agent();
    let conn = WebRtcConnection::new_rtp(&agent, "audio0", 0, 0, None).unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    conn.on_connected(Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let ConnectionKind::Rtp { rtp, rtcp } = conn.kind() else {
        panic!("expected plain RTP connection");
    };

    rtp.dtls_encoder().notify_key_set();
    assert!(!conn.is_connected());
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    rtcp.dtls_encoder().notify_key_set();
    assert!(conn.is_connected());
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // Duplicate key-set reports never re-fire the signal.
    rtp.dtls_encoder().notify_key_set();
    rtcp.dtls_encoder().notify_key_set();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_on_connected_after_connection_runs_immediately() {
    let agent = shared_agent();
    let conn = WebRtcConnection::new_rtcp_mux(&agent, "audio0", 0, 0, None).unwrap();

    let ConnectionKind::RtcpMux { transport } = conn.kind() else {
        panic!("expected rtcp-mux connection");
    };
    transport.dtls_encoder().notify_key_set();
    assert!(conn.is_connected());

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    conn.on_connected(Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_pad_policy_table() {
    let agent = shared_agent();

    let plain = WebRtcConnection::new_rtp(&agent, "a", 0, 0, None).unwrap();
    assert!(plain.request_rtp_sink().is_some());
    assert!(plain.request_rtcp_sink().is_some());
    assert!(plain.request_rtp_src().is_some());
    assert!(plain.request_data_sink().is_none());
    assert!(plain.request_data_src().is_none());

    let sctp = WebRtcConnection::new_sctp(&agent, "d", 0, 0, None).unwrap();
    assert!(sctp.request_data_sink().is_some());
    assert!(sctp.request_data_src().is_some());
    assert!(sctp.request_rtp_sink().is_none());
    assert!(sctp.request_rtcp_src().is_none());

    let bundle = WebRtcConnection::new_bundle(&agent, "b", 0, 0, None).unwrap();
    let first = bundle.request_rtp_sink().unwrap();
    let second = bundle.request_rtp_sink().unwrap();
    // Funnel request pads are allocated per caller.
    assert_ne!(first.name(), second.name());
}

#[test]
fn test_certificate_available_on_every_variant() {
    let agent = shared_agent();
    for conn in [
        WebRtcConnection::new_rtp(&agent, "a", 0, 0, None).unwrap(),
        WebRtcConnection::new_rtcp_mux(&agent, "b", 0, 0, None).unwrap(),
        WebRtcConnection::new_bundle(&agent, "c", 0, 0, None).unwrap(),
        WebRtcConnection::new_sctp(&agent, "d", 0, 0, None).unwrap(),
    ] {
        let pem = conn.get_certificate_pem().unwrap();
        assert!(pem.contains("BEGIN CERTIFICATE"));
        let fingerprint = conn.certificate_fingerprint().unwrap();
        assert_eq!(fingerprint.len(), 32 * 3 - 1);
    }
}

#[test]
fn test_shared_pem_yields_same_certificate() {
    let agent = shared_agent();
    let a = WebRtcConnection::new_sctp(&agent, "a", 0, 0, None).unwrap();
    let pem = a.get_certificate_pem().unwrap();

    let b = WebRtcConnection::new_rtcp_mux(&agent, "b", 0, 0, Some(&pem)).unwrap();
    assert_eq!(b.get_certificate_pem().unwrap(), pem);
}

#[test]
fn test_drop_releases_ice_stream() {
    let agent = shared_agent();
    let conn = WebRtcConnection::new_rtcp_mux(&agent, "a", 0, 0, None).unwrap();
    let stream_id = conn.stream_id().to_owned();

    assert!(agent.lock().unwrap().get_local_credentials(&stream_id).is_some());
    drop(conn);
    assert!(agent.lock().unwrap().get_local_credentials(&stream_id).is_none());
}

#[test]
fn test_latency_stats_require_callback() {
    let agent = shared_agent();
    let conn = WebRtcConnection::new_rtcp_mux(&agent, "a", 0, 0, None).unwrap();

    // No callback installed: enable is a warning, not a crash.
    conn.collect_latency_stats(true);

    conn.set_latency_callback(Arc::new(|_| {}));
    conn.collect_latency_stats(true);
    conn.collect_latency_stats(false);
    conn.collect_latency_stats(false);
}

#[test]
fn test_add_registers_elements() {
    let agent = shared_agent();
    let mut conn = WebRtcConnection::new_bundle(&agent, "b", 0, 0, None).unwrap();
    let pipeline = Pipeline::new();

    assert!(!conn.is_added());
    conn.add(&pipeline, true);
    assert!(conn.is_added());
    assert!(pipeline.contains("b-rtp-funnel"));
    assert!(pipeline.contains("b-rtcp-funnel"));

    for tr in conn.transports() {
        assert!(tr.dtls_encoder().is_client());
        assert!(pipeline.contains(tr.dtls_encoder().name()));
    }
}
