#[cfg(test)]
mod connection_test;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::ice::{IceComponentState, SharedIceAgent, RTCP_COMPONENT, RTP_COMPONENT};
use crate::pipeline::funnel::Funnel;
use crate::pipeline::{lock, Pipeline, SinkPad, SrcPad};
use crate::transport::{lock_agent, LatencyCallback, WebRtcTransport};

pub type ConnectedHandler = Arc<dyn Fn() + Send + Sync>;

/// The shapes a negotiated transport path can take. Behavior that
/// differs per shape is a match over this tag.
pub enum ConnectionKind {
    /// Separate RTP and RTCP components.
    Rtp {
        rtp: WebRtcTransport,
        rtcp: WebRtcTransport,
    },
    /// RTCP multiplexed onto the RTP component.
    RtcpMux { transport: WebRtcTransport },
    /// One component shared by several media lines, fanned in.
    Bundle {
        transport: WebRtcTransport,
        rtp_funnel: Funnel,
        rtcp_funnel: Funnel,
    },
    /// DTLS/SCTP data path.
    Sctp { transport: WebRtcTransport },
}

impl ConnectionKind {
    pub fn is_sctp(&self) -> bool {
        matches!(self, ConnectionKind::Sctp { .. })
    }
}

struct ConnectedState {
    reported: HashSet<String>,
    needed: usize,
    emitted: bool,
    handlers: Vec<ConnectedHandler>,
}

/// One logical transport path bound to one ICE stream.
pub struct WebRtcConnection {
    name: String,
    stream_id: String,
    agent: SharedIceAgent,
    min_port: u16,
    max_port: u16,
    added: bool,
    ice_gathering_done: bool,
    latency_callback: Mutex<Option<LatencyCallback>>,
    connected: Arc<Mutex<ConnectedState>>,
    kind: ConnectionKind,
}

impl WebRtcConnection {
    pub fn new_rtp(
        agent: &SharedIceAgent,
        name: &str,
        min_port: u16,
        max_port: u16,
        pem: Option<&str>,
    ) -> Option<Self> {
        let stream_id = add_stream(agent, name, min_port, max_port)?;
        let rtp = WebRtcTransport::new(agent, &stream_id, RTP_COMPONENT, pem);
        let rtcp = WebRtcTransport::new(agent, &stream_id, RTCP_COMPONENT, pem);
        let (Some(rtp), Some(rtcp)) = (rtp, rtcp) else {
            lock_agent(agent).remove_stream(&stream_id);
            return None;
        };
        Some(Self::assemble(
            agent,
            name,
            stream_id,
            min_port,
            max_port,
            ConnectionKind::Rtp { rtp, rtcp },
        ))
    }

    pub fn new_rtcp_mux(
        agent: &SharedIceAgent,
        name: &str,
        min_port: u16,
        max_port: u16,
        pem: Option<&str>,
    ) -> Option<Self> {
        let stream_id = add_stream(agent, name, min_port, max_port)?;
        let Some(transport) = WebRtcTransport::new(agent, &stream_id, RTP_COMPONENT, pem) else {
            lock_agent(agent).remove_stream(&stream_id);
            return None;
        };
        Some(Self::assemble(
            agent,
            name,
            stream_id,
            min_port,
            max_port,
            ConnectionKind::RtcpMux { transport },
        ))
    }

    pub fn new_bundle(
        agent: &SharedIceAgent,
        name: &str,
        min_port: u16,
        max_port: u16,
        pem: Option<&str>,
    ) -> Option<Self> {
        let stream_id = add_stream(agent, name, min_port, max_port)?;
        let Some(transport) = WebRtcTransport::new(agent, &stream_id, RTP_COMPONENT, pem) else {
            lock_agent(agent).remove_stream(&stream_id);
            return None;
        };
        let rtp_funnel = Funnel::new(format!("{name}-rtp-funnel"));
        let rtcp_funnel = Funnel::new(format!("{name}-rtcp-funnel"));
        Some(Self::assemble(
            agent,
            name,
            stream_id,
            min_port,
            max_port,
            ConnectionKind::Bundle {
                transport,
                rtp_funnel,
                rtcp_funnel,
            },
        ))
    }

    pub fn new_sctp(
        agent: &SharedIceAgent,
        name: &str,
        min_port: u16,
        max_port: u16,
        pem: Option<&str>,
    ) -> Option<Self> {
        let stream_id = add_stream(agent, name, min_port, max_port)?;
        let Some(transport) = WebRtcTransport::new(agent, &stream_id, RTP_COMPONENT, pem) else {
            lock_agent(agent).remove_stream(&stream_id);
            return None;
        };
        Some(Self::assemble(
            agent,
            name,
            stream_id,
            min_port,
            max_port,
            ConnectionKind::Sctp { transport },
        ))
    }

    fn assemble(
        agent: &SharedIceAgent,
        name: &str,
        stream_id: String,
        min_port: u16,
        max_port: u16,
        kind: ConnectionKind,
    ) -> Self {
        let conn = WebRtcConnection {
            name: name.to_owned(),
            stream_id,
            agent: Arc::clone(agent),
            min_port,
            max_port,
            added: false,
            ice_gathering_done: false,
            latency_callback: Mutex::new(None),
            connected: Arc::new(Mutex::new(ConnectedState {
                reported: HashSet::new(),
                needed: 0,
                emitted: false,
                handlers: Vec::new(),
            })),
            kind,
        };

        let transports = conn.transports();
        lock(&conn.connected).needed = transports.len();
        for tr in transports {
            let state = Arc::clone(&conn.connected);
            let id = tr.connection_id().to_owned();
            tr.dtls_encoder().connect_key_set(Box::new(move || {
                let handlers = {
                    let mut state = lock(&state);
                    state.reported.insert(id.clone());
                    if state.emitted || state.reported.len() < state.needed {
                        return;
                    }
                    state.emitted = true;
                    state.handlers.clone()
                };
                // Fired once, outside the state lock.
                for handler in handlers {
                    handler();
                }
            }));
        }
        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn kind(&self) -> &ConnectionKind {
        &self.kind
    }

    pub fn port_range(&self) -> (u16, u16) {
        (self.min_port, self.max_port)
    }

    pub fn is_added(&self) -> bool {
        self.added
    }

    pub fn ice_gathering_done(&self) -> bool {
        self.ice_gathering_done
    }

    pub fn set_ice_gathering_done(&mut self) {
        self.ice_gathering_done = true;
    }

    /// Every transport this connection owns.
    pub fn transports(&self) -> Vec<&WebRtcTransport> {
        match &self.kind {
            ConnectionKind::Rtp { rtp, rtcp } => vec![rtp, rtcp],
            ConnectionKind::RtcpMux { transport }
            | ConnectionKind::Bundle { transport, .. }
            | ConnectionKind::Sctp { transport } => vec![transport],
        }
    }

    /// The transport whose decoder holds the DTLS certificate.
    fn certificate_transport(&self) -> &WebRtcTransport {
        match &self.kind {
            ConnectionKind::Rtp { rtp, .. } => rtp,
            ConnectionKind::RtcpMux { transport }
            | ConnectionKind::Bundle { transport, .. }
            | ConnectionKind::Sctp { transport } => transport,
        }
    }

    pub fn get_certificate_pem(&self) -> Option<String> {
        Some(self.certificate_transport().certificate_pem())
    }

    pub fn certificate_fingerprint(&self) -> Option<String> {
        self.certificate_transport()
            .dtls_decoder()
            .certificate_fingerprint()
    }

    /// Attaches the connection's elements to the surrounding pipeline and
    /// sets the DTLS role on every transport.
    pub fn add(&mut self, pipeline: &Pipeline, is_active_peer: bool) {
        for tr in self.transports() {
            tr.set_dtls_role(is_active_peer);
            pipeline.add(tr.ice_src().name());
            pipeline.add(tr.ice_sink().name());
            pipeline.add(tr.dtls_encoder().name());
            pipeline.add(tr.dtls_decoder().name());
        }
        if let ConnectionKind::Bundle {
            transport,
            rtp_funnel,
            rtcp_funnel,
        } = &self.kind
        {
            pipeline.add(rtp_funnel.name());
            pipeline.add(rtcp_funnel.name());
            rtp_funnel.src_pad().link(transport.dtls_encoder().rtp_sink_pad());
            rtcp_funnel.src_pad().link(transport.dtls_encoder().rtcp_sink_pad());
        }
        self.added = true;
        debug!("connection {} added (active peer: {is_active_peer})", self.name);
    }

    pub fn request_rtp_sink(&self) -> Option<SinkPad> {
        match &self.kind {
            ConnectionKind::Rtp { rtp, .. } => Some(rtp.dtls_encoder().rtp_sink_pad().clone()),
            ConnectionKind::RtcpMux { transport } => {
                Some(transport.dtls_encoder().rtp_sink_pad().clone())
            }
            ConnectionKind::Bundle { rtp_funnel, .. } => Some(rtp_funnel.request_sink_pad()),
            ConnectionKind::Sctp { .. } => {
                warn!("connection {}: rtp sink not supported", self.name);
                None
            }
        }
    }

    pub fn request_rtp_src(&self) -> Option<SrcPad> {
        match &self.kind {
            ConnectionKind::Rtp { rtp, .. } => Some(rtp.dtls_decoder().src_pad().clone()),
            ConnectionKind::RtcpMux { transport }
            | ConnectionKind::Bundle { transport, .. } => {
                Some(transport.dtls_decoder().src_pad().clone())
            }
            ConnectionKind::Sctp { .. } => {
                warn!("connection {}: rtp src not supported", self.name);
                None
            }
        }
    }

    pub fn request_rtcp_sink(&self) -> Option<SinkPad> {
        match &self.kind {
            ConnectionKind::Rtp { rtcp, .. } => Some(rtcp.dtls_encoder().rtcp_sink_pad().clone()),
            ConnectionKind::RtcpMux { transport } => {
                Some(transport.dtls_encoder().rtcp_sink_pad().clone())
            }
            ConnectionKind::Bundle { rtcp_funnel, .. } => Some(rtcp_funnel.request_sink_pad()),
            ConnectionKind::Sctp { .. } => {
                warn!("connection {}: rtcp sink not supported", self.name);
                None
            }
        }
    }

    pub fn request_rtcp_src(&self) -> Option<SrcPad> {
        match &self.kind {
            ConnectionKind::Rtp { rtcp, .. } => Some(rtcp.dtls_decoder().src_pad().clone()),
            ConnectionKind::RtcpMux { transport }
            | ConnectionKind::Bundle { transport, .. } => {
                Some(transport.dtls_decoder().src_pad().clone())
            }
            ConnectionKind::Sctp { .. } => {
                warn!("connection {}: rtcp src not supported", self.name);
                None
            }
        }
    }

    pub fn request_data_sink(&self) -> Option<SinkPad> {
        match &self.kind {
            ConnectionKind::Sctp { transport } => {
                Some(transport.dtls_encoder().data_sink_pad().clone())
            }
            _ => {
                warn!("connection {}: data sink not supported", self.name);
                None
            }
        }
    }

    pub fn request_data_src(&self) -> Option<SrcPad> {
        match &self.kind {
            ConnectionKind::Sctp { transport } => Some(transport.dtls_decoder().src_pad().clone()),
            _ => {
                warn!("connection {}: data src not supported", self.name);
                None
            }
        }
    }

    pub fn src_sync_state_with_parent(&self) {
        for tr in self.transports() {
            tr.sync_src_state();
        }
    }

    pub fn sink_sync_state_with_parent(&self) {
        for tr in self.transports() {
            tr.sync_sink_state();
        }
        if let ConnectionKind::Bundle {
            rtp_funnel,
            rtcp_funnel,
            ..
        } = &self.kind
        {
            rtp_funnel.sync_state();
            rtcp_funnel.sync_state();
        }
    }

    pub fn set_latency_callback(&self, callback: LatencyCallback) {
        *lock(&self.latency_callback) = Some(callback);
    }

    /// Latency is measured on the RTP path only.
    pub fn collect_latency_stats(&self, enable: bool) {
        let transport = self.certificate_transport();
        if enable {
            let Some(callback) = lock(&self.latency_callback).clone() else {
                warn!("connection {}: no latency callback set", self.name);
                return;
            };
            transport.enable_latency_notification(callback);
        } else {
            transport.disable_latency_notification();
        }
    }

    /// Routes an ICE component state change to the transports carrying
    /// that component.
    pub fn notify_component_state(&self, component_id: u16, state: IceComponentState) {
        for tr in self.transports() {
            if tr.component_id() == component_id {
                tr.notify_component_state(state);
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.connected).emitted
    }

    /// Subscribes to the one-shot connected notification: fires once all
    /// owned transports have independently established key material. If
    /// that already happened, the handler runs immediately.
    pub fn on_connected(&self, handler: ConnectedHandler) {
        let already = {
            let mut state = lock(&self.connected);
            if !state.emitted {
                state.handlers.push(handler.clone());
                false
            } else {
                true
            }
        };
        if already {
            handler();
        }
    }
}

impl Drop for WebRtcConnection {
    fn drop(&mut self) {
        lock_agent(&self.agent).remove_stream(&self.stream_id);
    }
}

fn add_stream(agent: &SharedIceAgent, name: &str, min_port: u16, max_port: u16) -> Option<String> {
    let stream_id = lock_agent(agent).add_stream(name, min_port, max_port);
    if stream_id.is_none() {
        warn!("connection {name}: agent could not allocate a stream");
    }
    stream_id
}
