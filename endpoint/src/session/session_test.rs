use super::*;
use std::sync::atomic::AtomicU32;
use std::thread;
use std::time::{Duration, Instant};

use datachannel::{DataChannelAck, Message, PayloadProtocolIdentifier};
use shared::marshal::Marshal;

use crate::ice::IceAgent;
use crate::pipeline::{MediaBuffer, SctpRecvMeta};
use crate::sdp::MediaDescription;

fn init_logging() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .is_test(true)
        .try_init()
        .ok();
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn session_with_medias(medias: &[(&str, &str, &str)]) -> Arc<WebRtcSession> {
    init_logging();
    let session = WebRtcSession::new("test").unwrap();
    let mut local = SessionDescription::new();
    for (media_type, protocol, mid) in medias {
        local
            .medias
            .push(MediaDescription::new(media_type, protocol).with_mid(mid));
    }
    session.set_local_description(local);
    for (_, _, mid) in medias {
        assert!(session.create_connection(mid));
    }
    session
}

fn remote_with_medias(medias: &[(&str, &str, &str)]) -> SessionDescription {
    let mut remote = SessionDescription::new();
    remote.ufrag = Some("rufrag".to_owned());
    remote.pwd = Some("rpwd567890123456789012".to_owned());
    for (media_type, protocol, mid) in medias {
        let mut media = MediaDescription::new(media_type, protocol).with_mid(mid);
        if media.is_sctp() {
            media.sctp_port = Some(5000);
        }
        remote.medias.push(media);
    }
    remote
}

#[test]
fn test_turn_url_parsing() {
    let relay = parse_turn_url("kurento:secret@turn.example.org:3478?transport=tcp").unwrap();
    assert_eq!(relay.username, "kurento");
    assert_eq!(relay.password, "secret");
    assert_eq!(relay.address, "turn.example.org");
    assert_eq!(relay.port, 3478);
    assert_eq!(relay.transport, TurnTransport::Tcp);

    // Missing query defaults to UDP.
    let relay = parse_turn_url("u:p@10.0.0.1:443").unwrap();
    assert_eq!(relay.transport, TurnTransport::Udp);

    for bad in [
        "turn.example.org:3478",
        "u:p@turn.example.org",
        "u@turn.example.org:3478",
        ":p@turn.example.org:3478",
        "u:p@:3478",
        "u:p@turn.example.org:notaport",
        "u:p@turn.example.org:3478?transport=sctp",
    ] {
        assert!(
            matches!(parse_turn_url(bad), Err(Error::ErrInvalidTurnUrl(_))),
            "accepted {bad}"
        );
    }
}

#[test]
fn test_gathering_done_is_an_and_over_all_connections() {
    let session = session_with_medias(&[
        ("audio", "RTP/AVP", "audio"),
        ("video", "RTP/AVP", "video"),
    ]);
    let done_count = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&done_count);
    session.connect_gathering_done(Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    assert!(!session.is_gathering_done());
    assert!(session.gather_candidates());
    assert!(wait_until(|| session.is_gathering_done()));
    assert!(wait_until(|| done_count.load(Ordering::SeqCst) == 1));

    // Both media lines got credentials and a default candidate.
    let local = session.local_description();
    for media in &local.medias {
        assert!(media.ufrag.is_some());
        assert!(media.pwd.is_some());
        assert!(media.connection_address.is_some());
        assert_ne!(media.port, 9);
        assert!(media.fingerprint.is_some());
    }

    // A stream added afterwards resets the aggregate until it reports
    // done itself.
    let mut local = session.local_description();
    local
        .medias
        .push(MediaDescription::new("application", "RTP/AVP").with_mid("extra"));
    session.set_local_description(local);
    assert!(session.create_connection("extra"));
    assert!(!session.is_gathering_done());
}

#[test]
fn test_gather_fails_as_a_whole_on_unknown_stream() {
    let session = WebRtcSession::new("empty").unwrap();
    assert!(!session.gather_candidates());
}

#[test]
fn test_wait_gathering_done_unblocked_by_finalize() {
    let session = session_with_medias(&[("audio", "RTP/AVP", "audio")]);

    let waiter = {
        let session = Arc::clone(&session);
        thread::spawn(move || session.wait_gathering_done())
    };
    thread::sleep(Duration::from_millis(50));
    session.finalize();
    assert_eq!(waiter.join().unwrap(), Err(Error::ErrSessionFinalized));
}

#[test]
fn test_wait_gathering_done_returns_after_gathering() {
    let session = session_with_medias(&[("audio", "RTP/AVP", "audio")]);
    assert!(session.gather_candidates());
    assert_eq!(session.wait_gathering_done(), Ok(()));
}

#[test]
fn test_local_candidates_fan_out_with_external_address_rewrite() {
    let session = session_with_medias(&[("audio", "RTP/AVP", "audio")]);
    session.set_external_address("198.51.100.7");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    session.connect_candidate(Arc::new(move |candidate| {
        lock(&sink).push(candidate.clone());
    }));

    assert!(session.gather_candidates());
    assert!(wait_until(|| !lock(&seen).is_empty()));
    assert_eq!(session.wait_gathering_done(), Ok(()));

    for candidate in lock(&seen).iter() {
        assert_eq!(candidate.address(), "198.51.100.7");
        assert_eq!(candidate.sdp_mid(), "audio");
        assert_eq!(candidate.sdp_m_line_index(), 0);
    }
    let local = session.local_description();
    assert!(!local.medias[0].candidates.is_empty());
    for value in &local.medias[0].candidates {
        assert!(value.contains("198.51.100.7"), "not rewritten: {value}");
    }
}

#[test]
fn test_buffered_remote_candidates_apply_exactly_once() {
    let agent = Arc::new(Mutex::new(UdpIceAgent::new()));
    let session = WebRtcSession::with_agent("replay", agent.clone()).unwrap();

    // Arrives before any SDP or gathering state exists: buffered,
    // reported as deferred success.
    let candidate = IceCandidate::new(
        "candidate:1 1 udp 2013266431 192.0.2.10 50000 typ host",
        "audio",
        0,
    )
    .unwrap();
    assert!(session.add_ice_candidate(&candidate));

    let mut local = SessionDescription::new();
    local
        .medias
        .push(MediaDescription::new("audio", "RTP/AVP").with_mid("audio"));
    session.set_local_description(local);
    assert!(session.create_connection("audio"));
    session.set_remote_description(remote_with_medias(&[("audio", "RTP/AVP", "audio")]));

    // Both replay passes run: gather_candidates replays into the
    // agent, start_transport_send into the remote SDP and the agent
    // again.
    assert!(session.gather_candidates());
    assert!(session.start_transport_send(true));

    let applied = agent.lock().unwrap().get_remote_candidates("1", 1);
    let matching = applied
        .iter()
        .filter(|c| c.address() == "192.0.2.10" && c.port() == 50000)
        .count();
    assert_eq!(matching, 1);

    let remote = session.remote_description().unwrap();
    let recorded = remote.medias[0]
        .candidates
        .iter()
        .filter(|v| v.contains("192.0.2.10"))
        .count();
    assert_eq!(recorded, 1);
}

#[test]
fn test_remote_candidate_with_invalid_index_is_a_hard_failure() {
    let session = session_with_medias(&[("audio", "RTP/AVP", "audio")]);
    session.set_remote_description(remote_with_medias(&[("audio", "RTP/AVP", "audio")]));

    let candidate = IceCandidate::new(
        "candidate:1 1 udp 2013266431 192.0.2.10 50000 typ host",
        "audio",
        5,
    )
    .unwrap();
    assert!(!session.add_ice_candidate(&candidate));
}

#[test]
fn test_start_transport_send_requires_remote_description() {
    let session = session_with_medias(&[("audio", "RTP/AVP", "audio")]);
    assert!(!session.start_transport_send(true));
}

#[test]
fn test_component_state_notifications_route_through_session() {
    let agent = Arc::new(Mutex::new(UdpIceAgent::new()));
    let session = WebRtcSession::with_agent("states", agent.clone()).unwrap();
    let mut local = SessionDescription::new();
    local
        .medias
        .push(MediaDescription::new("audio", "RTP/AVP").with_mid("audio"));
    session.set_local_description(local);
    assert!(session.create_connection("audio"));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    session.connect_component_state(Arc::new(move |stream_id, component_id, state| {
        lock(&sink).push((stream_id.to_owned(), component_id, state));
    }));

    agent
        .lock()
        .unwrap()
        .set_component_state("1", 1, IceComponentState::Connecting);
    assert!(wait_until(|| !lock(&seen).is_empty()));
    assert_eq!(
        lock(&seen)[0],
        ("1".to_owned(), 1, IceComponentState::Connecting)
    );
}

#[test]
fn test_session_level_channel_and_connected_notifications() {
    let session = session_with_medias(&[("application", "UDP/DTLS/SCTP", "data")]);

    let opened = Arc::new(Mutex::new(Vec::new()));
    let opened_sink = Arc::clone(&opened);
    // Registered before the data session exists; handed over at its
    // creation.
    session.connect_channel_opened(Arc::new(move |id| lock(&opened_sink).push(id)));
    let closed = Arc::new(Mutex::new(Vec::new()));
    let closed_sink = Arc::clone(&closed);
    session.connect_channel_closed(Arc::new(move |id| lock(&closed_sink).push(id)));
    let connected_mids = Arc::new(Mutex::new(Vec::new()));
    let connected_sink = Arc::clone(&connected_mids);
    session.connect_connection_connected(Arc::new(move |mid| {
        lock(&connected_sink).push(mid.to_owned());
    }));

    session.set_remote_description(remote_with_medias(&[(
        "application",
        "UDP/DTLS/SCTP",
        "data",
    )]));
    assert!(session.gather_candidates());
    assert!(session.start_transport_send(true));

    let data_session = session.data_session().unwrap();
    data_session.handle_association_established(true);
    let id = session.create_data_channel(true, -1, -1, "chat", "").unwrap();

    let channel = session.get_data_channel(id).expect("channel reachable");
    assert!(session.get_data_channel(id + 2).is_none());

    // The peer's ACK completes the handshake and surfaces as the
    // session-level opened notification.
    let mut ack = MediaBuffer::from_data(Message::DataChannelAck(DataChannelAck).marshal().unwrap());
    ack.sctp_recv = Some(SctpRecvMeta {
        ppid: PayloadProtocolIdentifier::Dcep.into(),
    });
    channel.handle_session_buffer(ack);
    assert_eq!(*lock(&opened), vec![id]);

    // Request-side close runs the stream-reset worker and comes back
    // as a closed notification.
    assert!(session.destroy_data_channel(id));
    assert!(wait_until(|| *lock(&closed) == vec![id]));

    // DTLS key material established re-emits per media line.
    {
        let inner = lock(&session.inner);
        for tr in inner.connections["data"].transports() {
            tr.dtls_encoder().notify_key_set();
        }
    }
    assert_eq!(*lock(&connected_mids), vec!["data".to_owned()]);
}

#[test]
fn test_bundled_media_lines_share_one_connection() {
    init_logging();
    let session = WebRtcSession::new("bundle").unwrap();
    let mut local = SessionDescription::new();
    local.bundle_mids = vec!["audio".to_owned(), "video".to_owned()];
    local
        .medias
        .push(MediaDescription::new("audio", "RTP/AVP").with_mid("audio"));
    local
        .medias
        .push(MediaDescription::new("video", "RTP/AVP").with_mid("video"));
    session.set_local_description(local);

    // One connection for the whole group, stored under the first mid.
    assert!(session.create_bundle_connection("audio"));
    assert_eq!(session.connection_names(), vec!["audio".to_owned()]);

    assert!(session.gather_candidates());
    assert_eq!(session.wait_gathering_done(), Ok(()));

    let local = session.local_description();
    for media in &local.medias {
        let mid = media.mid.as_deref().unwrap();
        assert!(media.ufrag.is_some(), "media {mid} got no ufrag");
        assert!(media.pwd.is_some(), "media {mid} got no pwd");
        assert!(media.fingerprint.is_some(), "media {mid} got no fingerprint");
        assert!(media.connection_address.is_some());
        assert!(!media.candidates.is_empty(), "media {mid} got no candidates");
    }
    // Shared stream, shared credentials.
    assert_eq!(local.medias[0].ufrag, local.medias[1].ufrag);
    assert_eq!(local.medias[0].pwd, local.medias[1].pwd);

    // A remote candidate for the second bundled line resolves to the
    // shared connection instead of failing the lookup.
    session.set_remote_description(remote_with_medias(&[
        ("audio", "RTP/AVP", "audio"),
        ("video", "RTP/AVP", "video"),
    ]));
    let candidate = IceCandidate::new(
        "candidate:1 1 udp 2013266431 192.0.2.20 40000 typ host",
        "video",
        1,
    )
    .unwrap();
    assert!(session.add_ice_candidate(&candidate));
    assert!(session.start_transport_send(true));
}

#[test]
fn test_sctp_negotiation_creates_data_session() {
    let session = session_with_medias(&[("application", "UDP/DTLS/SCTP", "data")]);
    assert!(session.data_session().is_none());
    assert!(matches!(
        session.create_data_channel(true, -1, -1, "early", ""),
        Err(Error::Other(_))
    ));

    session.set_remote_description(remote_with_medias(&[(
        "application",
        "UDP/DTLS/SCTP",
        "data",
    )]));
    assert!(session.gather_candidates());
    assert!(session.start_transport_send(true));

    let data_session = session.data_session().expect("data session created");
    // The offerer is the DTLS passive side here, so the id space is
    // the odd one.
    assert!(!data_session.is_dtls_client());
    assert_eq!(data_session.encoder().remote_sctp_port(), Some(5000));

    assert_eq!(
        session.create_data_channel(true, 500, 3, "bad", ""),
        Err(Error::ErrBothReliabilityParamsSet)
    );
    let id = session
        .create_data_channel(true, -1, -1, "chat", "")
        .unwrap();
    assert_eq!(id, 1);

    // Queued until the association comes up, then opened.
    let channel = data_session.get_data_channel(id).unwrap();
    assert_eq!(channel.state(), crate::data_channel::ChannelState::Closed);
    data_session.handle_association_established(true);
    assert_eq!(
        channel.state(),
        crate::data_channel::ChannelState::Connecting
    );

    assert!(session.destroy_data_channel(id));
    assert!(!session.destroy_data_channel(999));

    let stats = session.stats();
    assert!(stats.data_session.is_some());
    assert_eq!(stats.connections.len(), 1);
}
