use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::agent::*;
use super::candidate::*;
use super::udp_agent::UdpIceAgent;
use crate::pipeline::lock;

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

fn collecting_agent() -> (UdpIceAgent, Arc<Mutex<Vec<IceAgentEvent>>>) {
    let mut agent = UdpIceAgent::new();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    agent.add_event_handler(Arc::new(move |event| {
        lock(&sink).push(event.clone());
    }));
    agent.run_agent();
    (agent, events)
}

#[test]
fn test_stream_ids_are_stringified_integers() {
    let mut agent = UdpIceAgent::new();
    assert_eq!(agent.add_stream("audio", 0, 0), Some("1".to_owned()));
    assert_eq!(agent.add_stream("video", 0, 0), Some("2".to_owned()));

    let (ufrag, pwd) = agent.get_local_credentials("1").unwrap();
    assert_eq!(ufrag.len(), 4);
    assert_eq!(pwd.len(), 22);
    assert!(agent.get_local_credentials("9").is_none());
}

#[test]
fn test_invalid_port_range_fails() {
    let mut agent = UdpIceAgent::new();
    assert_eq!(agent.add_stream("audio", 6000, 5000), None);
}

#[test]
fn test_gathering_emits_candidates_and_done() {
    let (mut agent, events) = collecting_agent();
    let stream_id = agent.add_stream("audio", 0, 0).unwrap();

    assert!(agent.start_gathering_candidates(&stream_id));

    assert!(wait_until(|| {
        lock(&events)
            .iter()
            .any(|e| matches!(e, IceAgentEvent::GatheringDone { stream_id: s } if *s == stream_id))
    }));

    let events = lock(&events);
    let candidates: Vec<&IceCandidate> = events
        .iter()
        .filter_map(|e| match e {
            IceAgentEvent::Candidate { candidate, .. } => Some(candidate),
            _ => None,
        })
        .collect();
    // One host candidate per component.
    assert_eq!(candidates.len(), 2);
    assert!(candidates.iter().any(|c| c.component_id() == RTP_COMPONENT));
    assert!(candidates.iter().any(|c| c.component_id() == RTCP_COMPONENT));
    for c in candidates {
        assert_eq!(c.candidate_type(), CandidateType::Host);
        assert_eq!(c.address(), "127.0.0.1");
        assert_ne!(c.port(), 0);
    }

    assert!(agent.get_default_local_candidate(&stream_id, RTP_COMPONENT).is_some());
    assert_eq!(
        agent.get_component_state(&stream_id, RTP_COMPONENT),
        IceComponentState::Gathering
    );
}

#[test]
fn test_gathering_unknown_stream_fails() {
    let (mut agent, _events) = collecting_agent();
    assert!(!agent.start_gathering_candidates("42"));
}

#[test]
fn test_remote_candidate_intake() {
    let (mut agent, events) = collecting_agent();
    let stream_id = agent.add_stream("audio", 0, 0).unwrap();
    assert!(agent.start_gathering_candidates(&stream_id));

    let remote = IceCandidate::new(
        "candidate:9 1 udp 2043278322 198.51.100.1 4242 typ host",
        "",
        0,
    )
    .unwrap();

    // No credentials yet: stored, no state change.
    assert!(agent.add_ice_candidate(&remote, &stream_id));
    assert_eq!(agent.get_remote_candidates(&stream_id, RTP_COMPONENT).len(), 1);

    assert!(agent.set_remote_credentials(&stream_id, "ufrag", "pwd"));
    assert!(agent.add_ice_candidate(&remote, &stream_id));

    assert!(wait_until(|| {
        lock(&events).iter().any(|e| {
            matches!(
                e,
                IceAgentEvent::ComponentStateChanged {
                    state: IceComponentState::Connecting,
                    ..
                }
            )
        })
    }));

    assert!(!agent.add_ice_candidate(&remote, "77"));
}

#[test]
fn test_controlling_mode_round_trip() {
    let mut agent = UdpIceAgent::new();
    assert!(!agent.get_controlling_mode());
    agent.set_controlling_mode(true);
    assert!(agent.get_controlling_mode());
}

#[test]
fn test_default_trait_methods_are_conservative() {
    struct Unimplemented;
    impl IceAgent for Unimplemented {
        fn add_event_handler(&mut self, _handler: IceEventHandler) {}
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    let mut agent = Unimplemented;
    assert_eq!(agent.add_stream("x", 0, 0), None);
    assert!(!agent.set_remote_credentials("1", "u", "p"));
    assert!(!agent.start_gathering_candidates("1"));
    assert!(agent.get_local_credentials("1").is_none());
    assert!(agent.get_local_candidates("1", RTP_COMPONENT).is_empty());
    assert_eq!(
        agent.get_component_state("1", RTP_COMPONENT),
        IceComponentState::Disconnected
    );
    assert!(!agent.get_controlling_mode());
}
