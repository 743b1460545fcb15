use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use log::warn;

use super::{lock, FlowReturn, MediaBuffer, SinkPad, SrcPad};

pub type PadAddedFn = Box<dyn Fn(u16, SrcPad) + Send + Sync>;
pub type PadRemovedFn = Box<dyn Fn(u16) + Send + Sync>;

/// Send side of one SCTP association: a request sink pad per outbound
/// stream id, serialized onto one src pad toward the DTLS transport.
pub struct SctpEncoder {
    name: String,
    remote_sctp_port: Mutex<Option<u16>>,
    sinks: Mutex<HashMap<u16, SinkPad>>,
    src: SrcPad,
    started: AtomicBool,
}

impl SctpEncoder {
    pub fn new(association_id: u32) -> Self {
        let name = format!("sctpenc{association_id}");
        let src = SrcPad::new(format!("{name}:src"));
        SctpEncoder {
            name,
            remote_sctp_port: Mutex::new(None),
            sinks: Mutex::new(HashMap::new()),
            src,
            started: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_remote_sctp_port(&self, port: u16) {
        *lock(&self.remote_sctp_port) = Some(port);
    }

    pub fn remote_sctp_port(&self) -> Option<u16> {
        *lock(&self.remote_sctp_port)
    }

    pub fn src_pad(&self) -> &SrcPad {
        &self.src
    }

    /// Allocates (or returns the existing) `sink_%u` pad for a stream id.
    pub fn request_sink_pad(&self, stream_id: u16) -> SinkPad {
        let mut sinks = lock(&self.sinks);
        if let Some(pad) = sinks.get(&stream_id) {
            return pad.clone();
        }
        let pad = SinkPad::new(format!("{}:sink_{}", self.name, stream_id));
        let src = self.src.clone();
        pad.set_chain(Box::new(move |buffer| src.push(buffer)));
        sinks.insert(stream_id, pad.clone());
        pad
    }

    pub fn release_request_pad(&self, stream_id: u16) {
        if let Some(pad) = lock(&self.sinks).remove(&stream_id) {
            pad.clear_chain();
        } else {
            warn!("{}: no request pad for stream {stream_id}", self.name);
        }
    }

    pub fn sync_state(&self) {
        self.started.store(true, Ordering::Release);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

/// Receive side of one SCTP association: a src pad appears per inbound
/// stream id and disappears when the stream is reset.
pub struct SctpDecoder {
    name: String,
    local_sctp_port: Mutex<Option<u16>>,
    sink: SinkPad,
    srcs: Mutex<HashMap<u16, SrcPad>>,
    pad_added: Mutex<Option<PadAddedFn>>,
    pad_removed: Mutex<Option<PadRemovedFn>>,
    started: AtomicBool,
}

impl SctpDecoder {
    pub fn new(association_id: u32) -> Self {
        let name = format!("sctpdec{association_id}");
        // Inbound DTLS payload; demultiplexing onto stream pads happens
        // inside the association stack, surfaced via deliver().
        let sink = SinkPad::with_chain(format!("{name}:sink"), Box::new(|_| FlowReturn::Ok));
        SctpDecoder {
            name,
            local_sctp_port: Mutex::new(None),
            sink,
            srcs: Mutex::new(HashMap::new()),
            pad_added: Mutex::new(None),
            pad_removed: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_local_sctp_port(&self, port: u16) {
        *lock(&self.local_sctp_port) = Some(port);
    }

    pub fn local_sctp_port(&self) -> Option<u16> {
        *lock(&self.local_sctp_port)
    }

    pub fn sink_pad(&self) -> &SinkPad {
        &self.sink
    }

    pub fn connect_pad_added(&self, f: PadAddedFn) {
        *lock(&self.pad_added) = Some(f);
    }

    pub fn connect_pad_removed(&self, f: PadRemovedFn) {
        *lock(&self.pad_removed) = Some(f);
    }

    pub fn src_pad(&self, stream_id: u16) -> Option<SrcPad> {
        lock(&self.srcs).get(&stream_id).cloned()
    }

    /// Surfaces a new inbound stream: creates its src pad and fires the
    /// pad-added callback (outside the pad table lock).
    pub fn add_stream_pad(&self, stream_id: u16) -> SrcPad {
        let pad = {
            let mut srcs = lock(&self.srcs);
            srcs.entry(stream_id)
                .or_insert_with(|| SrcPad::new(format!("{}:src_{}", self.name, stream_id)))
                .clone()
        };
        if let Some(cb) = lock(&self.pad_added).as_ref() {
            cb(stream_id, pad.clone());
        }
        pad
    }

    /// Pushes one reassembled user message out of a stream's src pad.
    pub fn deliver(&self, stream_id: u16, buffer: MediaBuffer) -> FlowReturn {
        match self.src_pad(stream_id) {
            Some(pad) => pad.push(buffer),
            None => {
                warn!("{}: no pad for inbound stream {stream_id}", self.name);
                FlowReturn::NotLinked
            }
        }
    }

    /// Resets a stream: its src pad goes away and pad-removed fires.
    /// Firing for an untracked id is allowed; the callback decides how
    /// loudly to complain.
    pub fn reset_stream(&self, stream_id: u16) {
        lock(&self.srcs).remove(&stream_id);
        if let Some(cb) = lock(&self.pad_removed).as_ref() {
            cb(stream_id);
        }
    }

    pub fn sync_state(&self) {
        self.started.store(true, Ordering::Release);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}
