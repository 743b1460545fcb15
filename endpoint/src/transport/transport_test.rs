use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::*;
use crate::ice::{IceAgent, IceEventHandler, UdpIceAgent};
use crate::pipeline::SinkPad;

fn shared_udp_agent() -> (SharedIceAgent, String) {
    let mut agent = UdpIceAgent::new();
    let stream_id = agent.add_stream("audio", 0, 0).unwrap();
    (Arc::new(Mutex::new(agent)), stream_id)
}

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

#[test]
fn test_construction_and_connection_id() {
    let (agent, stream_id) = shared_udp_agent();
    let tr = WebRtcTransport::new(&agent, &stream_id, 1, None).unwrap();

    assert!(tr.connection_id().contains(&format!("-{stream_id}-1")));
    assert_eq!(tr.dtls_encoder().connection_id(), tr.connection_id());
    assert_eq!(tr.dtls_decoder().connection_id(), tr.connection_id());
    assert!(tr.certificate_pem().contains("BEGIN CERTIFICATE"));
}

#[test]
fn test_construction_rejects_foreign_agent() {
    struct Foreign;
    impl IceAgent for Foreign {
        fn add_event_handler(&mut self, _handler: IceEventHandler) {}
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    let agent: SharedIceAgent = Arc::new(Mutex::new(Foreign));
    assert!(WebRtcTransport::new(&agent, "1", 1, None).is_none());
}

#[test]
fn test_disable_latency_twice_is_noop() {
    let (agent, stream_id) = shared_udp_agent();
    let tr = WebRtcTransport::new(&agent, &stream_id, 1, None).unwrap();

    tr.disable_latency_notification();
    tr.disable_latency_notification();

    tr.enable_latency_notification(Arc::new(|_| {}));
    tr.disable_latency_notification();
    tr.disable_latency_notification();
}

#[test]
fn test_latency_callback_fires_on_stamped_inbound() {
    let (agent, stream_id) = shared_udp_agent();
    let tr = WebRtcTransport::new(&agent, &stream_id, 1, None).unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    tr.enable_latency_notification(Arc::new(move |latency| {
        assert!(latency >= Duration::ZERO);
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let mut inbound = MediaBuffer::from_data(Bytes::from_static(b"pkt"));
    inbound.latency_ts = Some(Instant::now());
    tr.ice_src().deliver(inbound);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // Outbound buffers get stamped by the encoder-side probe.
    tr.dtls_encoder()
        .rtp_sink_pad()
        .chain(MediaBuffer::from_data(Bytes::from_static(b"out")));
    assert!(tr.ice_sink().bytes_sent() >= 3);
}

#[test]
fn test_server_role_buffers_inbound_until_connected() {
    let (agent, stream_id) = shared_udp_agent();
    let tr = WebRtcTransport::new(&agent, &stream_id, 1, None).unwrap();
    tr.set_dtls_role(false);

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink_recorder = received.clone();
    let consumer = SinkPad::with_chain(
        "consumer",
        Box::new(move |buffer: MediaBuffer| {
            sink_recorder.lock().unwrap().push(buffer.data.clone());
            crate::pipeline::FlowReturn::Ok
        }),
    );
    tr.dtls_decoder().src_pad().link(&consumer);

    // A ClientHello-shaped buffer arriving before CONNECTED is held.
    tr.ice_src().deliver(MediaBuffer::from_data(Bytes::from_static(b"hello-1")));
    tr.ice_src().deliver(MediaBuffer::from_data(Bytes::from_static(b"hello-2")));
    assert!(received.lock().unwrap().is_empty());

    tr.notify_component_state(IceComponentState::Connected);
    // Second notification must not double-flush.
    tr.notify_component_state(IceComponentState::Connected);

    assert!(wait_until(|| received.lock().unwrap().len() == 2));
    std::thread::sleep(Duration::from_millis(80));

    {
        let received = received.lock().unwrap();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0], Bytes::from_static(b"hello-1"));
        assert_eq!(received[1], Bytes::from_static(b"hello-2"));
    }

    // Buffering is one-shot: later buffers flow straight through.
    tr.ice_src().deliver(MediaBuffer::from_data(Bytes::from_static(b"data")));
    assert_eq!(received.lock().unwrap().len(), 3);
}

#[test]
fn test_arrivals_during_flush_delay_keep_arrival_order() {
    let (agent, stream_id) = shared_udp_agent();
    let tr = WebRtcTransport::new(&agent, &stream_id, 1, None).unwrap();
    tr.set_dtls_role(false);

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink_recorder = received.clone();
    let consumer = SinkPad::with_chain(
        "consumer",
        Box::new(move |buffer: MediaBuffer| {
            sink_recorder.lock().unwrap().push(buffer.data.clone());
            crate::pipeline::FlowReturn::Ok
        }),
    );
    tr.dtls_decoder().src_pad().link(&consumer);

    tr.ice_src()
        .deliver(MediaBuffer::from_data(Bytes::from_static(b"client-hello")));
    tr.notify_component_state(IceComponentState::Connected);

    // Lands inside the flush delay; it must queue behind the backlog,
    // not overtake it.
    std::thread::sleep(Duration::from_millis(5));
    tr.ice_src()
        .deliver(MediaBuffer::from_data(Bytes::from_static(b"next-record")));

    assert!(wait_until(|| received.lock().unwrap().len() == 2));
    let received = received.lock().unwrap();
    assert_eq!(received[0], Bytes::from_static(b"client-hello"));
    assert_eq!(received[1], Bytes::from_static(b"next-record"));
}

#[test]
fn test_client_role_does_not_buffer() {
    let (agent, stream_id) = shared_udp_agent();
    let tr = WebRtcTransport::new(&agent, &stream_id, 1, None).unwrap();
    tr.set_dtls_role(true);

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let consumer = SinkPad::with_chain(
        "consumer",
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            crate::pipeline::FlowReturn::Ok
        }),
    );
    tr.dtls_decoder().src_pad().link(&consumer);

    tr.ice_src().deliver(MediaBuffer::from_data(Bytes::from_static(b"pkt")));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
