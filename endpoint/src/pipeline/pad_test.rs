use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use super::funnel::Funnel;
use super::*;

#[test]
fn test_push_unlinked_pad() {
    let src = SrcPad::new("src");
    let buffer = MediaBuffer::from_data(Bytes::from_static(b"x"));
    assert_eq!(src.push(buffer), FlowReturn::NotLinked);
}

#[test]
fn test_push_linked_pad() {
    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    let sink = SinkPad::with_chain(
        "sink",
        Box::new(move |buffer| {
            counter.fetch_add(buffer.data.len(), Ordering::SeqCst);
            FlowReturn::Ok
        }),
    );
    let src = SrcPad::new("src");
    src.link(&sink);

    assert_eq!(
        src.push(MediaBuffer::from_data(Bytes::from_static(b"abc"))),
        FlowReturn::Ok
    );
    assert_eq!(received.load(Ordering::SeqCst), 3);
}

#[test]
fn test_probe_drop_swallows_buffer() {
    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    let sink = SinkPad::with_chain(
        "sink",
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            FlowReturn::Ok
        }),
    );
    let src = SrcPad::new("src");
    src.link(&sink);

    let id = src.add_probe(Box::new(|_| ProbeReturn::Drop));
    assert_eq!(
        src.push(MediaBuffer::from_data(Bytes::from_static(b"a"))),
        FlowReturn::Ok
    );
    assert_eq!(received.load(Ordering::SeqCst), 0);

    src.remove_probe(id);
    src.push(MediaBuffer::from_data(Bytes::from_static(b"a")));
    assert_eq!(received.load(Ordering::SeqCst), 1);

    // Removing an already removed probe is a no-op.
    src.remove_probe(id);
}

#[test]
fn test_funnel_fans_in() {
    let funnel = Funnel::new("funnel0");
    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    let out = SinkPad::with_chain(
        "out",
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            FlowReturn::Ok
        }),
    );
    funnel.src_pad().link(&out);

    let a = funnel.request_sink_pad();
    let b = funnel.request_sink_pad();
    assert_ne!(a.name(), b.name());

    a.chain(MediaBuffer::from_data(Bytes::from_static(b"1")));
    b.chain(MediaBuffer::from_data(Bytes::from_static(b"2")));
    assert_eq!(received.load(Ordering::SeqCst), 2);
}
