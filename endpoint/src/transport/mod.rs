#[cfg(test)]
mod transport_test;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::ice::{IceComponentState, SharedIceAgent, UdpIceAgent};
use crate::pipeline::dtls::{DtlsSrtpDecoder, DtlsSrtpEncoder};
use crate::pipeline::{lock, FlowReturn, MediaBuffer, ProbeReturn, SinkPad, SrcPad};

static NEXT_ICE_ELEMENT_ID: AtomicU32 = AtomicU32::new(0);

/// Delay between the ICE component reaching CONNECTED and the pending
/// inbound flush, leaving room for the local DTLS hello to go out first.
const PENDING_FLUSH_DELAY: Duration = Duration::from_millis(50);

pub type LatencyCallback = Arc<dyn Fn(Duration) + Send + Sync>;

/// Inbound endpoint of one ICE component: wire datagrams enter the
/// element graph here.
pub struct IceSrc {
    name: String,
    src: SrcPad,
}

impl IceSrc {
    fn new() -> Self {
        let name = format!("nicesrc{}", NEXT_ICE_ELEMENT_ID.fetch_add(1, Ordering::Relaxed));
        let src = SrcPad::new(format!("{name}:src"));
        IceSrc { name, src }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn src_pad(&self) -> &SrcPad {
        &self.src
    }

    /// Called by the component's I/O driver per received datagram.
    pub fn deliver(&self, buffer: MediaBuffer) -> FlowReturn {
        self.src.push(buffer)
    }
}

/// Outbound endpoint of one ICE component.
pub struct IceSink {
    name: String,
    sink: SinkPad,
    sent: Arc<AtomicU64>,
}

impl IceSink {
    fn new() -> Self {
        let name = format!("nicesink{}", NEXT_ICE_ELEMENT_ID.fetch_add(1, Ordering::Relaxed));
        let sent = Arc::new(AtomicU64::new(0));
        let counter = sent.clone();
        let sink = SinkPad::with_chain(
            format!("{name}:sink"),
            Box::new(move |buffer: MediaBuffer| {
                // Hand-off point to the component socket.
                counter.fetch_add(buffer.data.len() as u64, Ordering::Relaxed);
                FlowReturn::Ok
            }),
        );
        IceSink { name, sink, sent }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sink_pad(&self) -> &SinkPad {
        &self.sink
    }

    pub fn bytes_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct PendingInbound {
    queue: VecDeque<MediaBuffer>,
    probe_id: Option<u64>,
    /// Thread currently replaying the queue; its own pushes pass the
    /// probe while everything else keeps queueing behind them.
    draining: Option<thread::ThreadId>,
    /// Flips under this lock once the queue has been drained; only then
    /// does inbound traffic bypass the probe.
    flushed: bool,
}

/// One ICE component's packet path: ICE I/O endpoints bound to a
/// DTLS-SRTP encoder/decoder pair.
pub struct WebRtcTransport {
    connection_id: String,
    stream_id: String,
    component_id: u16,
    ice_src: IceSrc,
    ice_sink: IceSink,
    dtls_encoder: Arc<DtlsSrtpEncoder>,
    dtls_decoder: Arc<DtlsSrtpDecoder>,
    latency_probes: Mutex<Option<(u64, u64)>>,
    pending: Arc<Mutex<PendingInbound>>,
    flush_started: AtomicBool,
}

impl WebRtcTransport {
    /// Builds the component carrier. `None` when the agent is not the
    /// expected concrete backend or the DTLS elements cannot be created.
    pub fn new(
        agent: &SharedIceAgent,
        stream_id: &str,
        component_id: u16,
        pem: Option<&str>,
    ) -> Option<Self> {
        {
            let agent = lock_agent(agent);
            if agent.as_any().downcast_ref::<UdpIceAgent>().is_none() {
                warn!("transport requires the UDP ICE backend");
                return None;
            }
        }

        let dtls_decoder = match DtlsSrtpDecoder::new(pem) {
            Ok(dec) => Arc::new(dec),
            Err(e) => {
                warn!("creating DTLS decoder: {e}");
                return None;
            }
        };
        let dtls_encoder = Arc::new(DtlsSrtpEncoder::new());

        let connection_id = format!(
            "{}-{}-{}-{}",
            dtls_encoder.name(),
            dtls_decoder.name(),
            stream_id,
            component_id
        );
        dtls_encoder.set_connection_id(&connection_id);
        dtls_decoder.set_connection_id(&connection_id);

        let ice_src = IceSrc::new();
        let ice_sink = IceSink::new();
        ice_src.src_pad().link(dtls_decoder.sink_pad());
        dtls_encoder.src_pad().link(ice_sink.sink_pad());

        Some(WebRtcTransport {
            connection_id,
            stream_id: stream_id.to_owned(),
            component_id,
            ice_src,
            ice_sink,
            dtls_encoder,
            dtls_decoder,
            latency_probes: Mutex::new(None),
            pending: Arc::new(Mutex::new(PendingInbound::default())),
            flush_started: AtomicBool::new(false),
        })
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn component_id(&self) -> u16 {
        self.component_id
    }

    pub fn ice_src(&self) -> &IceSrc {
        &self.ice_src
    }

    pub fn ice_sink(&self) -> &IceSink {
        &self.ice_sink
    }

    pub fn dtls_encoder(&self) -> &Arc<DtlsSrtpEncoder> {
        &self.dtls_encoder
    }

    pub fn dtls_decoder(&self) -> &Arc<DtlsSrtpDecoder> {
        &self.dtls_decoder
    }

    pub fn certificate_pem(&self) -> String {
        self.dtls_decoder.certificate_pem()
    }

    /// Sets the DTLS role on both halves. For the server role, inbound
    /// buffers are held until the ICE component connects so the peer's
    /// ClientHello is not lost before the receive path is ready.
    pub fn set_dtls_role(&self, is_client: bool) {
        self.dtls_encoder.set_is_client(is_client);
        self.dtls_decoder.set_is_client(is_client);
        if !is_client {
            self.install_pending_probe();
        }
    }

    fn install_pending_probe(&self) {
        // The push path takes the probe table lock before the pending
        // lock, so the pending lock is never held across pad calls.
        let queue = Arc::clone(&self.pending);
        let id = self.ice_src.src_pad().add_probe(Box::new(move |buffer| {
            let mut pending = lock(&queue);
            if pending.flushed || pending.draining == Some(thread::current().id()) {
                return ProbeReturn::Pass;
            }
            pending.queue.push_back(buffer.clone());
            ProbeReturn::Drop
        }));
        let stale = {
            let mut pending = lock(&self.pending);
            if pending.probe_id.is_some() || pending.flushed {
                true
            } else {
                pending.probe_id = Some(id);
                false
            }
        };
        if stale {
            self.ice_src.src_pad().remove_probe(id);
            return;
        }
        debug!("{}: buffering inbound until ICE connects", self.connection_id);
    }

    /// Reacts to the component's ICE state. On CONNECTED the pending
    /// inbound queue is flushed after a short delay; buffering stays in
    /// effect during the delay and the drain, so everything the wire
    /// delivers in the meantime still lands behind the queued buffers.
    pub fn notify_component_state(&self, state: IceComponentState) {
        if state != IceComponentState::Connected && state != IceComponentState::Ready {
            return;
        }
        if self.flush_started.swap(true, Ordering::AcqRel) {
            return;
        }

        let pending = Arc::clone(&self.pending);
        let pad = self.ice_src.src_pad().clone();
        let connection_id = self.connection_id.clone();
        let spawned = thread::Builder::new()
            .name("dtls-pending-flush".to_owned())
            .spawn(move || {
                thread::sleep(PENDING_FLUSH_DELAY);
                {
                    let mut guard = lock(&pending);
                    guard.draining = Some(thread::current().id());
                    if !guard.queue.is_empty() {
                        debug!("{connection_id}: flushing {} pending buffers", guard.queue.len());
                    }
                }
                // One buffer popped per lock round trip. Concurrent
                // arrivals keep queueing behind the remaining backlog;
                // the flushed flag flips only once the queue is empty,
                // under the same lock the probe takes.
                let probe_id = loop {
                    let buffer = {
                        let mut guard = lock(&pending);
                        match guard.queue.pop_front() {
                            Some(buffer) => buffer,
                            None => {
                                guard.flushed = true;
                                guard.draining = None;
                                break guard.probe_id.take();
                            }
                        }
                    };
                    pad.push(buffer);
                };
                if let Some(id) = probe_id {
                    pad.remove_probe(id);
                }
            });
        if let Err(e) = spawned {
            warn!("{}: spawning flush thread: {e}", self.connection_id);
        }
    }

    /// Installs the probe pair measuring the outbound-stamp to
    /// inbound-callback latency. At most one active pair.
    pub fn enable_latency_notification(&self, callback: LatencyCallback) {
        let mut probes = lock(&self.latency_probes);
        if probes.is_some() {
            return;
        }

        let out_id = self.dtls_encoder.src_pad().add_probe(Box::new(|buffer| {
            buffer.latency_ts = Some(Instant::now());
            ProbeReturn::Pass
        }));
        let in_id = self.dtls_decoder.src_pad().add_probe(Box::new(move |buffer| {
            if let Some(ts) = buffer.latency_ts.take() {
                callback(ts.elapsed());
            }
            ProbeReturn::Pass
        }));
        *probes = Some((out_id, in_id));
    }

    /// Removes the probe pair; calling without an active pair is a no-op.
    pub fn disable_latency_notification(&self) {
        let taken = lock(&self.latency_probes).take();
        if let Some((out_id, in_id)) = taken {
            self.dtls_encoder.src_pad().remove_probe(out_id);
            self.dtls_decoder.src_pad().remove_probe(in_id);
        }
    }

    pub fn sync_src_state(&self) {
        self.dtls_decoder.sync_state();
    }

    pub fn sync_sink_state(&self) {
        self.dtls_encoder.sync_state();
    }
}

pub(crate) fn lock_agent(
    agent: &SharedIceAgent,
) -> std::sync::MutexGuard<'_, dyn crate::ice::IceAgent + 'static> {
    agent.lock().unwrap_or_else(|e| e.into_inner())
}
