use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use super::{lock, SinkPad, SrcPad};

/// N-to-1 fan-in: every buffer pushed into any requested sink pad comes
/// out of the single src pad.
pub struct Funnel {
    name: String,
    src: SrcPad,
    sinks: Mutex<Vec<SinkPad>>,
    next_pad: AtomicU32,
    started: AtomicBool,
}

impl Funnel {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let src = SrcPad::new(format!("{name}:src"));
        Funnel {
            name,
            src,
            sinks: Mutex::new(Vec::new()),
            next_pad: AtomicU32::new(0),
            started: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn src_pad(&self) -> &SrcPad {
        &self.src
    }

    /// Allocates a new `sink_%u` request pad wired to the src pad.
    pub fn request_sink_pad(&self) -> SinkPad {
        let n = self.next_pad.fetch_add(1, Ordering::Relaxed);
        let pad = SinkPad::new(format!("{}:sink_{}", self.name, n));
        let src = self.src.clone();
        pad.set_chain(Box::new(move |buffer| src.push(buffer)));
        lock(&self.sinks).push(pad.clone());
        pad
    }

    pub fn release_sink_pad(&self, pad: &SinkPad) {
        pad.clear_chain();
        lock(&self.sinks).retain(|p| p.name() != pad.name());
    }

    pub fn sync_state(&self) {
        self.started.store(true, Ordering::Release);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}
