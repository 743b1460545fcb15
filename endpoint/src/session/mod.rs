#[cfg(test)]
mod session_test;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use log::{debug, error, warn};

use shared::error::{Error, Result};

use crate::connection::{ConnectionKind, WebRtcConnection};
use crate::data_channel::WebRtcDataChannelBin;
use crate::data_session::{
    ChannelClosedHandler, ChannelOpenedHandler, DataSessionStats, WebRtcDataSessionBin,
};
use crate::ice::{
    IceAgentEvent, IceCandidate, IceComponentState, RelayServerInfo, SharedIceAgent,
    StunServerInfo, TurnTransport, UdpIceAgent,
};
use crate::pipeline::{lock, Certificate, Pipeline};
use crate::sdp::SessionDescription;
use crate::transport::lock_agent;

pub const DEFAULT_STUN_PORT: u16 = 3478;

pub type CandidateHandler = Arc<dyn Fn(&IceCandidate) + Send + Sync>;
pub type GatheringDoneHandler = Arc<dyn Fn() + Send + Sync>;
pub type ComponentStateHandler = Arc<dyn Fn(&str, u16, IceComponentState) + Send + Sync>;
pub type ConnectionConnectedHandler = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionStats {
    pub name: String,
    pub stream_id: String,
    pub connected: bool,
    pub bytes_sent: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionStats {
    pub gathering_done: bool,
    pub connections: Vec<ConnectionStats>,
    pub data_session: Option<DataSessionStats>,
}

/// `user:password@address:port?transport=udp|tcp|tls`; the query part
/// is optional and defaults to UDP.
pub fn parse_turn_url(url: &str) -> Result<RelayServerInfo> {
    let fail = || {
        warn!(
            "TURN url '{url}' does not match \
             user:password@address:port?transport=udp|tcp|tls"
        );
        Error::ErrInvalidTurnUrl(url.to_owned())
    };

    let (credentials, server) = url.rsplit_once('@').ok_or_else(fail)?;
    let (username, password) = credentials.split_once(':').ok_or_else(fail)?;
    if username.is_empty() || password.is_empty() {
        return Err(fail());
    }

    let (host_port, transport) = match server.split_once('?') {
        Some((host_port, query)) => {
            let transport = match query.strip_prefix("transport=") {
                Some("udp") => TurnTransport::Udp,
                Some("tcp") => TurnTransport::Tcp,
                Some("tls") => TurnTransport::Tls,
                _ => return Err(fail()),
            };
            (host_port, transport)
        }
        None => (server, TurnTransport::Udp),
    };

    let (address, port) = host_port.rsplit_once(':').ok_or_else(fail)?;
    if address.is_empty() {
        return Err(fail());
    }
    let port: u16 = port.parse().map_err(|_| fail())?;

    Ok(RelayServerInfo {
        address: address.to_owned(),
        port,
        username: username.to_owned(),
        password: password.to_owned(),
        transport,
    })
}

struct SessionInner {
    connections: HashMap<String, WebRtcConnection>,
    local_description: SessionDescription,
    remote_description: Option<SessionDescription>,
    /// Remote candidates are buffered for the session's whole lifetime;
    /// replay passes consume copies, never the buffer itself.
    remote_candidates: Vec<IceCandidate>,
    gather_started: bool,
    local_sdp_populated: bool,
    finalized: bool,
    data_session: Option<Arc<WebRtcDataSessionBin>>,
    stun: Option<StunServerInfo>,
    turn: Option<RelayServerInfo>,
    network_interfaces: Vec<String>,
    external_address: Option<String>,
    ice_tcp: bool,
    min_port: u16,
    max_port: u16,
    candidate_handlers: Vec<CandidateHandler>,
    gathering_done_handlers: Vec<GatheringDoneHandler>,
    component_state_handlers: Vec<ComponentStateHandler>,
    /// Held here until the data session exists, then handed to it.
    channel_opened_handlers: Vec<ChannelOpenedHandler>,
    channel_closed_handlers: Vec<ChannelClosedHandler>,
}

impl SessionInner {
    fn connection_for_stream(&self, stream_id: &str) -> Option<&WebRtcConnection> {
        self.connections.values().find(|c| c.stream_id() == stream_id)
    }

    /// Resolves a media's mid to the mid its connection is stored
    /// under. Bundled media lines share the connection created for the
    /// first mid of the BUNDLE group.
    fn connection_mid(&self, mid: &str) -> Option<String> {
        if self.connections.contains_key(mid) {
            return Some(mid.to_owned());
        }
        let bundle = &self.local_description.bundle_mids;
        if !bundle.iter().any(|b| b == mid) {
            return None;
        }
        bundle
            .iter()
            .find(|b| self.connections.contains_key(b.as_str()))
            .cloned()
    }

    /// AND over the current connection set, recomputed on every event.
    fn is_gathering_done(&self) -> bool {
        !self.connections.is_empty()
            && self.connections.values().all(|c| c.ice_gathering_done())
    }
}

/// Orchestrates ICE gathering, candidate exchange, DTLS transport
/// startup, and the optional SCTP data session for one negotiation.
pub struct WebRtcSession {
    name: String,
    agent: SharedIceAgent,
    pipeline: Pipeline,
    certificate: Certificate,
    inner: Mutex<SessionInner>,
    gathering_cond: Condvar,
    sctp_attached: Arc<AtomicBool>,
    /// Outside `inner` so a re-emission firing from the synchronous
    /// already-connected path never contends with the session lock.
    connected_handlers: Arc<Mutex<Vec<ConnectionConnectedHandler>>>,
}

impl WebRtcSession {
    pub fn new(name: &str) -> Result<Arc<Self>> {
        let agent: SharedIceAgent = Arc::new(Mutex::new(UdpIceAgent::new()));
        Self::with_agent(name, agent)
    }

    /// Builds a session around an already-constructed agent backend.
    pub fn with_agent(name: &str, agent: SharedIceAgent) -> Result<Arc<Self>> {
        let certificate = Certificate::generate()?;
        let session = Arc::new(WebRtcSession {
            name: name.to_owned(),
            agent: Arc::clone(&agent),
            pipeline: Pipeline::new(),
            certificate,
            inner: Mutex::new(SessionInner {
                connections: HashMap::new(),
                local_description: SessionDescription::new(),
                remote_description: None,
                remote_candidates: Vec::new(),
                gather_started: false,
                local_sdp_populated: false,
                finalized: false,
                data_session: None,
                stun: None,
                turn: None,
                network_interfaces: Vec::new(),
                external_address: None,
                ice_tcp: true,
                min_port: 0,
                max_port: 0,
                candidate_handlers: Vec::new(),
                gathering_done_handlers: Vec::new(),
                component_state_handlers: Vec::new(),
                channel_opened_handlers: Vec::new(),
                channel_closed_handlers: Vec::new(),
            }),
            gathering_cond: Condvar::new(),
            sctp_attached: Arc::new(AtomicBool::new(false)),
            connected_handlers: Arc::new(Mutex::new(Vec::new())),
        });

        let weak = Arc::downgrade(&session);
        {
            let mut agent = lock_agent(&agent);
            agent.add_event_handler(Arc::new(move |event| {
                if let Some(session) = weak.upgrade() {
                    session.route_agent_event(event);
                }
            }));
            agent.run_agent();
        }
        Ok(session)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn certificate_pem(&self) -> &str {
        self.certificate.pem()
    }

    pub fn certificate_fingerprint(&self) -> Option<String> {
        self.certificate.fingerprint()
    }

    // Configuration. All of it must land before gather_candidates.

    pub fn set_stun_server(&self, address: &str, port: u16) {
        lock(&self.inner).stun = Some(StunServerInfo {
            address: address.to_owned(),
            port,
        });
    }

    pub fn set_turn_url(&self, url: &str) -> Result<()> {
        let relay = parse_turn_url(url)?;
        lock(&self.inner).turn = Some(relay);
        Ok(())
    }

    pub fn set_network_interfaces(&self, interfaces: &[String]) {
        lock(&self.inner).network_interfaces = interfaces.to_vec();
    }

    pub fn set_external_address(&self, address: &str) {
        lock(&self.inner).external_address = Some(address.to_owned());
    }

    pub fn set_ice_tcp(&self, enabled: bool) {
        lock(&self.inner).ice_tcp = enabled;
    }

    pub fn set_port_range(&self, min_port: u16, max_port: u16) {
        let mut inner = lock(&self.inner);
        inner.min_port = min_port;
        inner.max_port = max_port;
    }

    // Notifications.

    pub fn connect_candidate(&self, handler: CandidateHandler) {
        lock(&self.inner).candidate_handlers.push(handler);
    }

    pub fn connect_gathering_done(&self, handler: GatheringDoneHandler) {
        lock(&self.inner).gathering_done_handlers.push(handler);
    }

    pub fn connect_component_state(&self, handler: ComponentStateHandler) {
        lock(&self.inner).component_state_handlers.push(handler);
    }

    /// Fires once per media line, with the media's mid, when its
    /// connection establishes DTLS key material.
    pub fn connect_connection_connected(&self, handler: ConnectionConnectedHandler) {
        lock(&self.connected_handlers).push(handler);
    }

    pub fn connect_channel_opened(&self, handler: ChannelOpenedHandler) {
        let mut inner = lock(&self.inner);
        if let Some(bin) = inner.data_session.clone() {
            bin.connect_channel_opened(handler);
        } else {
            inner.channel_opened_handlers.push(handler);
        }
    }

    pub fn connect_channel_closed(&self, handler: ChannelClosedHandler) {
        let mut inner = lock(&self.inner);
        if let Some(bin) = inner.data_session.clone() {
            bin.connect_channel_closed(handler);
        } else {
            inner.channel_closed_handlers.push(handler);
        }
    }

    // SDP plumbing.

    pub fn set_local_description(&self, description: SessionDescription) {
        lock(&self.inner).local_description = description;
    }

    pub fn local_description(&self) -> SessionDescription {
        lock(&self.inner).local_description.clone()
    }

    pub fn set_remote_description(&self, description: SessionDescription) {
        lock(&self.inner).remote_description = Some(description);
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        lock(&self.inner).remote_description.clone()
    }

    /// Creates the connection for one local media line, picking the
    /// shape from the media's transport protocol.
    pub fn create_connection(&self, mid: &str) -> bool {
        let mut inner = lock(&self.inner);
        let Some(media) = inner
            .local_description
            .medias
            .iter()
            .find(|m| m.mid.as_deref() == Some(mid))
        else {
            error!("session {}: no local media with mid {mid}", self.name);
            return false;
        };
        let sctp = media.is_sctp();
        let (min_port, max_port) = (inner.min_port, inner.max_port);
        let pem = Some(self.certificate.pem());
        let connection = if sctp {
            WebRtcConnection::new_sctp(&self.agent, mid, min_port, max_port, pem)
        } else {
            WebRtcConnection::new_rtp(&self.agent, mid, min_port, max_port, pem)
        };
        self.insert_connection(&mut inner, mid, connection)
    }

    /// Factory used when rtcp-mux was negotiated for a media line.
    pub fn create_rtcp_mux_connection(&self, mid: &str) -> bool {
        let mut inner = lock(&self.inner);
        let (min_port, max_port) = (inner.min_port, inner.max_port);
        let pem = Some(self.certificate.pem());
        let connection = WebRtcConnection::new_rtcp_mux(&self.agent, mid, min_port, max_port, pem);
        self.insert_connection(&mut inner, mid, connection)
    }

    /// Factory used when BUNDLE groups several media lines onto one
    /// stream.
    pub fn create_bundle_connection(&self, mid: &str) -> bool {
        let mut inner = lock(&self.inner);
        let (min_port, max_port) = (inner.min_port, inner.max_port);
        let pem = Some(self.certificate.pem());
        let connection = WebRtcConnection::new_bundle(&self.agent, mid, min_port, max_port, pem);
        self.insert_connection(&mut inner, mid, connection)
    }

    fn insert_connection(
        &self,
        inner: &mut MutexGuard<'_, SessionInner>,
        mid: &str,
        connection: Option<WebRtcConnection>,
    ) -> bool {
        match connection {
            Some(connection) => {
                debug!(
                    "session {}: connection {mid} on stream {}",
                    self.name,
                    connection.stream_id()
                );
                inner.connections.insert(mid.to_owned(), connection);
                true
            }
            None => {
                error!("session {}: creating connection {mid} failed", self.name);
                false
            }
        }
    }

    pub fn connection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.inner).connections.keys().cloned().collect();
        names.sort();
        names
    }

    /// Starts local candidate discovery for every connection. Fails as
    /// a whole if any stream refuses to start; partial gathering leaves
    /// the session asymmetric and unusable.
    pub fn gather_candidates(&self) -> bool {
        let mut inner = lock(&self.inner);
        if inner.connections.is_empty() {
            error!("session {}: nothing to gather", self.name);
            return false;
        }

        let stream_ids: Vec<String> = inner
            .connections
            .values()
            .map(|c| c.stream_id().to_owned())
            .collect();
        {
            let mut agent = lock_agent(&self.agent);
            agent.set_network_interfaces(&inner.network_interfaces);
            agent.set_ice_tcp(inner.ice_tcp);
            if let Some(stun) = inner.stun.clone() {
                agent.set_stun_server(stun);
            }
            if let Some(turn) = inner.turn.clone() {
                for stream_id in &stream_ids {
                    agent.add_relay_server(stream_id, turn.clone());
                }
            }
            for stream_id in &stream_ids {
                if !agent.start_gathering_candidates(stream_id) {
                    error!(
                        "session {}: gathering failed to start on stream {stream_id}",
                        self.name
                    );
                    return false;
                }
            }
        }
        inner.gather_started = true;

        // Still under the session lock: candidates that arrived before
        // gathering started go to the agent now, before any concurrent
        // add_ice_candidate can observe gather_started.
        let buffered = inner.remote_candidates.clone();
        for candidate in &buffered {
            self.apply_candidate_to_agent(&inner, candidate);
        }
        true
    }

    fn apply_candidate_to_agent(
        &self,
        inner: &MutexGuard<'_, SessionInner>,
        candidate: &IceCandidate,
    ) -> bool {
        let index = candidate.sdp_m_line_index() as usize;
        let Some(media) = inner.local_description.media(index) else {
            error!(
                "session {}: candidate for out-of-range media {index}",
                self.name
            );
            return false;
        };
        if media.port == 0 {
            debug!("session {}: candidate for disabled media {index}", self.name);
            return true;
        }
        let mid = match (&media.mid, candidate.sdp_mid()) {
            (Some(mid), _) => mid.clone(),
            (None, mid) => mid.to_owned(),
        };
        let Some(owner) = inner.connection_mid(&mid) else {
            error!("session {}: no connection handles media {mid}", self.name);
            return false;
        };
        let connection = &inner.connections[&owner];
        lock_agent(&self.agent).add_ice_candidate(candidate, connection.stream_id())
    }

    /// Remote candidate intake, legal at any time relative to SDP and
    /// gathering readiness. Not-ready prerequisites defer silently;
    /// out-of-range indices against ready state are hard failures.
    pub fn add_ice_candidate(&self, candidate: &IceCandidate) -> bool {
        let mut inner = lock(&self.inner);
        inner.remote_candidates.push(candidate.clone());

        let agent_ok = if inner.gather_started {
            self.apply_candidate_to_agent(&inner, candidate)
        } else {
            true
        };

        let sdp_ok = match inner.remote_description.as_mut() {
            Some(remote) => {
                let index = candidate.sdp_m_line_index() as usize;
                match remote.media_mut(index) {
                    Some(media) => {
                        media.add_candidate(candidate.sdp_attribute_value());
                        true
                    }
                    None => {
                        error!(
                            "session {}: candidate index {index} outside remote description",
                            self.name
                        );
                        false
                    }
                }
            }
            None => true,
        };

        agent_ok && sdp_ok
    }

    /// Wires every active negotiated media line and starts its
    /// transports. `offerer` decides both ICE controlling mode and the
    /// DTLS active side.
    pub fn start_transport_send(&self, offerer: bool) -> bool {
        let mut inner = lock(&self.inner);
        let Some(remote) = inner.remote_description.clone() else {
            error!("session {}: transport start without remote description", self.name);
            return false;
        };
        lock_agent(&self.agent).set_controlling_mode(offerer);

        for (index, media) in remote.medias.iter().enumerate() {
            if !media.is_active() {
                debug!("session {}: media {index} inactive, skipped", self.name);
                continue;
            }
            let mid = match media.mid.clone().or_else(|| {
                inner
                    .local_description
                    .media(index)
                    .and_then(|m| m.mid.clone())
            }) {
                Some(mid) => mid,
                None => {
                    error!("session {}: media {index} has no mid", self.name);
                    continue;
                }
            };
            let Some(owner) = inner.connection_mid(&mid) else {
                error!("session {}: no connection for media {mid}", self.name);
                continue;
            };

            let Some((ufrag, pwd)) = remote.credentials(index) else {
                error!(
                    "session {}: media {mid} has no usable ICE credentials",
                    self.name
                );
                continue;
            };

            let stream_id = inner.connections[&owner].stream_id().to_owned();
            {
                let mut agent = lock_agent(&self.agent);
                if !agent.set_remote_credentials(&stream_id, &ufrag, &pwd) {
                    error!(
                        "session {}: setting remote credentials on stream {stream_id} failed",
                        self.name
                    );
                    continue;
                }
                for value in &media.candidates {
                    match IceCandidate::new(value, &mid, index as u32) {
                        Ok(candidate) => {
                            agent.add_ice_candidate(&candidate, &stream_id);
                        }
                        Err(e) => warn!("session {}: {e}", self.name),
                    }
                }
            }

            if inner.connections[&owner].kind().is_sctp() {
                self.configure_sctp(&mut inner, &owner, media.sctp_port, !offerer);
            }

            let Some(connection) = inner.connections.get_mut(&owner) else {
                continue;
            };
            let handlers = Arc::clone(&self.connected_handlers);
            let media_mid = mid.clone();
            connection.on_connected(Arc::new(move || {
                let snapshot = lock(&handlers).clone();
                for handler in snapshot {
                    handler(&media_mid);
                }
            }));
            // A bundle connection is visited once per bundled media.
            if !connection.is_added() {
                connection.add(&self.pipeline, !offerer);
                connection.src_sync_state_with_parent();
                connection.sink_sync_state_with_parent();
            }
        }

        // Two independent replay passes over the buffered candidates:
        // the remote-description pass needs only the remote SDP, the
        // agent pass additionally needs gathering to have started.
        let buffered = inner.remote_candidates.clone();
        if let Some(remote) = inner.remote_description.as_mut() {
            for candidate in &buffered {
                if let Some(media) = remote.media_mut(candidate.sdp_m_line_index() as usize) {
                    media.add_candidate(candidate.sdp_attribute_value());
                }
            }
        }
        if inner.gather_started {
            for candidate in &buffered {
                self.apply_candidate_to_agent(&inner, candidate);
            }
        }
        true
    }

    /// Attaches the SCTP association to the connection's DTLS transport
    /// no earlier than DTLS-connected. The compare-and-swap flag keeps
    /// the synchronous already-connected path and the asynchronous
    /// notification path from attaching twice.
    fn configure_sctp(
        &self,
        inner: &mut MutexGuard<'_, SessionInner>,
        mid: &str,
        remote_sctp_port: Option<u16>,
        dtls_client: bool,
    ) {
        let data_session = match inner.data_session.as_ref() {
            Some(existing) => Arc::clone(existing),
            None => {
                let created = WebRtcDataSessionBin::new(dtls_client);
                for handler in inner.channel_opened_handlers.drain(..) {
                    created.connect_channel_opened(handler);
                }
                for handler in inner.channel_closed_handlers.drain(..) {
                    created.connect_channel_closed(handler);
                }
                inner.data_session = Some(Arc::clone(&created));
                created
            }
        };
        if let Some(port) = remote_sctp_port {
            data_session.encoder().set_remote_sctp_port(port);
            data_session.decoder().set_local_sctp_port(port);
        }

        let connection = &inner.connections[mid];
        let (Some(data_sink), Some(data_src)) =
            (connection.request_data_sink(), connection.request_data_src())
        else {
            error!("session {}: connection {mid} has no data pads", self.name);
            return;
        };

        let attached = Arc::clone(&self.sctp_attached);
        let session_bin = Arc::clone(&data_session);
        let attach = Arc::new(move || {
            if attached
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                session_bin.encoder().src_pad().link(&data_sink);
                data_src.link(session_bin.decoder().sink_pad());
                session_bin.encoder().sync_state();
                session_bin.decoder().sync_state();
            }
        });

        if connection.is_connected() {
            attach();
        } else {
            connection.on_connected(attach);
        }
    }

    // Data channels.

    pub fn create_data_channel(
        &self,
        ordered: bool,
        max_packet_life_time: i32,
        max_retransmits: i32,
        label: &str,
        protocol: &str,
    ) -> Result<u16> {
        let data_session = lock(&self.inner).data_session.clone();
        match data_session {
            Some(bin) => bin.create_data_channel(
                ordered,
                max_packet_life_time,
                max_retransmits,
                label,
                protocol,
            ),
            None => Err(Error::Other(format!(
                "session {}: no SCTP media negotiated",
                self.name
            ))),
        }
    }

    pub fn get_data_channel(&self, stream_id: u16) -> Option<Arc<WebRtcDataChannelBin>> {
        lock(&self.inner)
            .data_session
            .clone()?
            .get_data_channel(stream_id)
    }

    pub fn destroy_data_channel(&self, stream_id: u16) -> bool {
        match lock(&self.inner).data_session.clone() {
            Some(bin) => bin.destroy_data_channel(stream_id),
            None => false,
        }
    }

    pub fn data_session(&self) -> Option<Arc<WebRtcDataSessionBin>> {
        lock(&self.inner).data_session.clone()
    }

    // Gathering wait and teardown.

    pub fn is_gathering_done(&self) -> bool {
        lock(&self.inner).is_gathering_done()
    }

    /// Blocks until every connection's stream reports gathering-done,
    /// or until the session is finalized concurrently.
    pub fn wait_gathering_done(&self) -> Result<()> {
        let mut inner = lock(&self.inner);
        loop {
            if inner.finalized {
                return Err(Error::ErrSessionFinalized);
            }
            if inner.is_gathering_done() {
                return Ok(());
            }
            inner = self
                .gathering_cond
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Tears the session down and unblocks any gathering waiters.
    pub fn finalize(&self) {
        let mut inner = lock(&self.inner);
        inner.finalized = true;
        inner.connections.clear();
        inner.data_session = None;
        self.gathering_cond.notify_all();
    }

    // Latency probes.

    pub fn set_latency_callback(&self, callback: crate::transport::LatencyCallback) {
        let inner = lock(&self.inner);
        for connection in inner.connections.values() {
            connection.set_latency_callback(Arc::clone(&callback));
        }
    }

    pub fn collect_latency_stats(&self, enable: bool) {
        let inner = lock(&self.inner);
        for connection in inner.connections.values() {
            connection.collect_latency_stats(enable);
        }
    }

    pub fn stats(&self) -> SessionStats {
        let inner = lock(&self.inner);
        let mut connections: Vec<ConnectionStats> = inner
            .connections
            .values()
            .map(|c| ConnectionStats {
                name: c.name().to_owned(),
                stream_id: c.stream_id().to_owned(),
                connected: c.is_connected(),
                bytes_sent: c.transports().iter().map(|t| t.ice_sink().bytes_sent()).sum(),
            })
            .collect();
        connections.sort_by(|a, b| a.name.cmp(&b.name));
        SessionStats {
            gathering_done: inner.is_gathering_done(),
            connections,
            data_session: inner.data_session.as_ref().map(|d| d.stats()),
        }
    }

    // Agent event routing. Events arrive on the agent's delivery
    // thread, which holds no locks of ours.

    fn route_agent_event(&self, event: &IceAgentEvent) {
        match event {
            IceAgentEvent::Candidate {
                stream_id,
                candidate,
            } => self.handle_local_candidate(stream_id, candidate),
            IceAgentEvent::GatheringDone { stream_id } => self.handle_gathering_done(stream_id),
            IceAgentEvent::ComponentStateChanged {
                stream_id,
                component_id,
                state,
            } => self.handle_component_state(stream_id, *component_id, *state),
            IceAgentEvent::NewSelectedPair { .. } => {}
        }
    }

    /// Fans one physical candidate out to every local media line backed
    /// by its stream, rewriting the address first when an external
    /// override is configured.
    fn handle_local_candidate(&self, stream_id: &str, candidate: &IceCandidate) {
        let (copies, handlers) = {
            let mut inner = lock(&self.inner);
            let mut candidate = candidate.clone();
            if let Some(external) = inner.external_address.clone() {
                candidate.set_address(&external);
            }

            let mids: Vec<(String, u32)> = {
                let Some(connection) = inner.connection_for_stream(stream_id) else {
                    warn!(
                        "session {}: candidate for unknown stream {stream_id}",
                        self.name
                    );
                    return;
                };
                let name = connection.name().to_owned();
                // A bundle connection backs every media line in the
                // BUNDLE group, not just its own mid.
                let bundle = &inner.local_description.bundle_mids;
                let backs_bundle = bundle.iter().any(|b| *b == name);
                inner
                    .local_description
                    .medias
                    .iter()
                    .enumerate()
                    .filter(|(_, m)| match m.mid.as_deref() {
                        Some(mid) => {
                            mid == name.as_str()
                                || (backs_bundle && bundle.iter().any(|b| b == mid))
                        }
                        None => false,
                    })
                    .map(|(index, m)| {
                        (m.mid.clone().unwrap_or_else(|| name.clone()), index as u32)
                    })
                    .collect()
            };

            let mut copies = Vec::with_capacity(mids.len());
            for (mid, index) in mids {
                if let Some(media) = inner.local_description.media_mut(index as usize) {
                    media.add_candidate(candidate.sdp_attribute_value());
                }
                copies.push(candidate.for_media(&mid, index));
            }
            (copies, inner.candidate_handlers.clone())
        };

        for copy in &copies {
            for handler in &handlers {
                handler(copy);
            }
        }
    }

    fn handle_gathering_done(&self, stream_id: &str) {
        let handlers = {
            let mut inner = lock(&self.inner);
            let Some(mid) = inner
                .connection_for_stream(stream_id)
                .map(|c| c.name().to_owned())
            else {
                warn!(
                    "session {}: gathering-done for unknown stream {stream_id}",
                    self.name
                );
                return;
            };
            if let Some(connection) = inner.connections.get_mut(&mid) {
                connection.set_ice_gathering_done();
            }

            if !inner.is_gathering_done() {
                return;
            }
            // Wake waiters whenever the aggregate holds, even on a
            // later re-completion after new streams joined.
            self.gathering_cond.notify_all();
            if inner.local_sdp_populated {
                return;
            }
            inner.local_sdp_populated = true;
            self.populate_local_description(&mut inner);
            inner.gathering_done_handlers.clone()
        };

        for handler in handlers {
            handler();
        }
    }

    /// Writes each media's negotiated defaults into the local SDP;
    /// runs exactly once, right after the aggregate turns true.
    fn populate_local_description(&self, inner: &mut MutexGuard<'_, SessionInner>) {
        let fingerprint = self.certificate.fingerprint();
        let defaults: Vec<(String, String, Option<(String, String)>, Option<IceCandidate>, Option<IceCandidate>)> = inner
            .connections
            .values()
            .map(|connection| {
                let stream_id = connection.stream_id().to_owned();
                let agent = lock_agent(&self.agent);
                let credentials = agent.get_local_credentials(&stream_id);
                let rtp_default = agent.get_default_local_candidate(&stream_id, 1);
                let rtcp_default = match connection.kind() {
                    ConnectionKind::Rtp { .. } => agent.get_default_local_candidate(&stream_id, 2),
                    _ => None,
                };
                (
                    connection.name().to_owned(),
                    stream_id,
                    credentials,
                    rtp_default,
                    rtcp_default,
                )
            })
            .collect();

        let bundle = inner.local_description.bundle_mids.clone();
        for (mid, stream_id, credentials, rtp_default, rtcp_default) in defaults {
            // A bundle connection's defaults land on every media line
            // of its BUNDLE group, not just the first.
            let backs_bundle = bundle.iter().any(|b| *b == mid);
            let mut matched = false;
            for media in inner.local_description.medias.iter_mut() {
                let Some(media_mid) = media.mid.as_deref() else {
                    continue;
                };
                if media_mid != mid && !(backs_bundle && bundle.iter().any(|b| b == media_mid)) {
                    continue;
                }
                matched = true;
                if let Some((ufrag, pwd)) = &credentials {
                    media.ufrag = Some(ufrag.clone());
                    media.pwd = Some(pwd.clone());
                }
                if let Some(candidate) = &rtp_default {
                    media.connection_address = Some(candidate.address().to_owned());
                    media.port = candidate.port();
                }
                if let Some(candidate) = &rtcp_default {
                    media.rtcp_address = Some((candidate.address().to_owned(), candidate.port()));
                }
                media.fingerprint = fingerprint.clone();
            }
            if !matched {
                warn!(
                    "session {}: stream {stream_id} backs no local media line",
                    self.name
                );
            }
        }
    }

    fn handle_component_state(&self, stream_id: &str, component_id: u16, state: IceComponentState) {
        let handlers = {
            let inner = lock(&self.inner);
            let Some(connection) = inner.connection_for_stream(stream_id) else {
                warn!(
                    "session {}: state {state} for unknown stream {stream_id}",
                    self.name
                );
                return;
            };
            connection.notify_component_state(component_id, state);
            inner.component_state_handlers.clone()
        };

        for handler in handlers {
            handler(stream_id, component_id, state);
        }
    }
}
