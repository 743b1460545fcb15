#[cfg(test)]
mod pad_test;

pub mod dtls;
pub mod funnel;
pub mod sctp;

pub use dtls::Certificate;
pub use sctp::{SctpDecoder, SctpEncoder};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use bytes::Bytes;

/// Locks a mutex, recovering the inner value if a previous holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// SCTP partial-reliability policy attached to outbound user messages.
#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub enum SctpReliability {
    None,
    /// Give up after a time limit (milliseconds).
    Ttl,
    /// Give up after a number of retransmissions.
    Rtx,
}

/// Send-side metadata for one SCTP user message.
#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub struct SctpSendMeta {
    pub ppid: u32,
    pub ordered: bool,
    pub reliability: SctpReliability,
    pub reliability_parameter: u32,
}

/// Receive-side metadata carried by buffers popped off an SCTP stream.
#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub struct SctpRecvMeta {
    pub ppid: u32,
}

/// One unit of media/data flowing through the element graph.
#[derive(Clone, Debug, Default)]
pub struct MediaBuffer {
    pub data: Bytes,
    pub sctp_send: Option<SctpSendMeta>,
    pub sctp_recv: Option<SctpRecvMeta>,
    /// Stamped by the outbound latency probe, read by the inbound one.
    pub latency_ts: Option<Instant>,
}

impl MediaBuffer {
    pub fn from_data(data: Bytes) -> Self {
        MediaBuffer {
            data,
            ..Default::default()
        }
    }
}

#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub enum FlowReturn {
    Ok,
    NotLinked,
    Error,
}

#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub enum ProbeReturn {
    Pass,
    /// The probe consumed the buffer; downstream never sees it.
    Drop,
}

pub type ChainFn = Box<dyn FnMut(MediaBuffer) -> FlowReturn + Send>;
pub type ProbeFn = Box<dyn FnMut(&mut MediaBuffer) -> ProbeReturn + Send>;

static NEXT_PROBE_ID: AtomicU64 = AtomicU64::new(1);

struct SinkPadInner {
    name: String,
    chain: Mutex<Option<ChainFn>>,
}

/// Consumer endpoint of a link. Pushing into a pad with no chain function
/// installed yields `FlowReturn::NotLinked`.
#[derive(Clone)]
pub struct SinkPad {
    inner: Arc<SinkPadInner>,
}

impl SinkPad {
    pub fn new(name: impl Into<String>) -> Self {
        SinkPad {
            inner: Arc::new(SinkPadInner {
                name: name.into(),
                chain: Mutex::new(None),
            }),
        }
    }

    pub fn with_chain(name: impl Into<String>, chain: ChainFn) -> Self {
        let pad = SinkPad::new(name);
        pad.set_chain(chain);
        pad
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn set_chain(&self, chain: ChainFn) {
        *lock(&self.inner.chain) = Some(chain);
    }

    pub fn clear_chain(&self) {
        *lock(&self.inner.chain) = None;
    }

    pub fn chain(&self, buffer: MediaBuffer) -> FlowReturn {
        let mut guard = lock(&self.inner.chain);
        match guard.as_mut() {
            Some(f) => f(buffer),
            None => FlowReturn::NotLinked,
        }
    }
}

struct SrcPadInner {
    name: String,
    peer: Mutex<Option<SinkPad>>,
    probes: Mutex<BTreeMap<u64, ProbeFn>>,
}

/// Producer endpoint of a link, with id-keyed removable buffer probes.
#[derive(Clone)]
pub struct SrcPad {
    inner: Arc<SrcPadInner>,
}

impl SrcPad {
    pub fn new(name: impl Into<String>) -> Self {
        SrcPad {
            inner: Arc::new(SrcPadInner {
                name: name.into(),
                peer: Mutex::new(None),
                probes: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn link(&self, sink: &SinkPad) {
        *lock(&self.inner.peer) = Some(sink.clone());
    }

    pub fn unlink(&self) {
        *lock(&self.inner.peer) = None;
    }

    pub fn is_linked(&self) -> bool {
        lock(&self.inner.peer).is_some()
    }

    /// Installs a buffer probe and returns its process-unique id.
    pub fn add_probe(&self, probe: ProbeFn) -> u64 {
        let id = NEXT_PROBE_ID.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.probes).insert(id, probe);
        id
    }

    /// Removes a probe; unknown ids are ignored.
    pub fn remove_probe(&self, id: u64) {
        lock(&self.inner.probes).remove(&id);
    }

    pub fn push(&self, mut buffer: MediaBuffer) -> FlowReturn {
        {
            let mut probes = lock(&self.inner.probes);
            for probe in probes.values_mut() {
                if probe(&mut buffer) == ProbeReturn::Drop {
                    return FlowReturn::Ok;
                }
            }
        }

        let peer = lock(&self.inner.peer).clone();
        match peer {
            Some(sink) => sink.chain(buffer),
            None => FlowReturn::NotLinked,
        }
    }
}

/// The surrounding element graph the connections attach themselves to.
/// Only membership is tracked; media flows through pad links directly.
#[derive(Default)]
pub struct Pipeline {
    elements: Mutex<Vec<String>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Pipeline::default()
    }

    pub fn add(&self, element_name: &str) {
        let mut elements = lock(&self.elements);
        if !elements.iter().any(|e| e == element_name) {
            elements.push(element_name.to_owned());
        }
    }

    pub fn remove(&self, element_name: &str) {
        lock(&self.elements).retain(|e| e != element_name);
    }

    pub fn contains(&self, element_name: &str) -> bool {
        lock(&self.elements).iter().any(|e| e == element_name)
    }

    pub fn element_names(&self) -> Vec<String> {
        lock(&self.elements).clone()
    }
}
