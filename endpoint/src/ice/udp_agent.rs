use std::any::Any;
use std::collections::HashMap;
use std::net::UdpSocket;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use log::{debug, error, warn};
use rand::Rng;

use crate::pipeline::lock;

use super::agent::{
    IceAgent, IceAgentEvent, IceComponentState, IceEventHandler, RelayServerInfo, StunServerInfo,
};
use super::candidate::{IceCandidate, RTCP_COMPONENT, RTP_COMPONENT};

const UFRAG_LEN: usize = 4;
const PWD_LEN: usize = 22;

// RFC 8445 type preference for host candidates.
const HOST_TYPE_PREFERENCE: u32 = 126;

fn random_ice_string(n: usize) -> String {
    const RUNES: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::rng();
    (0..n)
        .map(|_| RUNES[rng.random_range(0..RUNES.len())] as char)
        .collect()
}

fn host_candidate_priority(component_id: u16) -> u32 {
    (HOST_TYPE_PREFERENCE << 24) + (65535u32 << 8) + (256 - component_id as u32)
}

struct ComponentSlot {
    sockets: Vec<UdpSocket>,
    local_candidates: Vec<IceCandidate>,
    remote_candidates: Vec<IceCandidate>,
    state: IceComponentState,
}

impl ComponentSlot {
    fn new() -> Self {
        ComponentSlot {
            sockets: Vec::new(),
            local_candidates: Vec::new(),
            remote_candidates: Vec::new(),
            state: IceComponentState::Disconnected,
        }
    }
}

struct IceStream {
    name: String,
    min_port: u16,
    max_port: u16,
    local_ufrag: String,
    local_pwd: String,
    remote_ufrag: Option<String>,
    remote_pwd: Option<String>,
    gathering_done: bool,
    relays: Vec<RelayServerInfo>,
    components: HashMap<u16, ComponentSlot>,
}

/// Concrete agent backend gathering host candidates over bound UDP
/// sockets. Stream ids it hands out are stringified integers.
pub struct UdpIceAgent {
    next_stream_id: u32,
    streams: HashMap<String, IceStream>,
    handlers: Arc<Mutex<Vec<IceEventHandler>>>,
    event_tx: Sender<IceAgentEvent>,
    event_rx: Option<Receiver<IceAgentEvent>>,
    stun: Option<StunServerInfo>,
    interfaces: Vec<String>,
    ice_tcp: bool,
    controlling: bool,
}

impl UdpIceAgent {
    pub fn new() -> Self {
        let (event_tx, event_rx) = channel();
        UdpIceAgent {
            next_stream_id: 1,
            streams: HashMap::new(),
            handlers: Arc::new(Mutex::new(Vec::new())),
            event_tx,
            event_rx: Some(event_rx),
            stun: None,
            interfaces: Vec::new(),
            ice_tcp: true,
            controlling: false,
        }
    }

    fn emit(&self, event: IceAgentEvent) {
        // Queued for the delivery thread so no handler ever runs under
        // a lock held by the caller.
        let _ = self.event_tx.send(event);
    }

    /// Driven by the connectivity-check machinery (and by tests standing
    /// in for it): records a component state and fans the change out.
    pub fn set_component_state(
        &mut self,
        stream_id: &str,
        component_id: u16,
        state: IceComponentState,
    ) {
        let Some(slot) = self
            .streams
            .get_mut(stream_id)
            .and_then(|s| s.components.get_mut(&component_id))
        else {
            warn!("set_component_state: unknown stream {stream_id} component {component_id}");
            return;
        };
        if slot.state == state {
            return;
        }
        slot.state = state;
        debug!("stream {stream_id} component {component_id} -> {state}");
        self.emit(IceAgentEvent::ComponentStateChanged {
            stream_id: stream_id.to_owned(),
            component_id,
            state,
        });
    }

    fn gather_component(
        stream_id: &str,
        stream_name: &str,
        min_port: u16,
        max_port: u16,
        addresses: &[String],
        component_id: u16,
        slot: &mut ComponentSlot,
    ) -> Option<Vec<IceAgentEvent>> {
        let mut events = Vec::new();
        slot.state = IceComponentState::Gathering;
        events.push(IceAgentEvent::ComponentStateChanged {
            stream_id: stream_id.to_owned(),
            component_id,
            state: IceComponentState::Gathering,
        });

        for address in addresses {
            let socket = bind_in_range(address, min_port, max_port)?;
            let local = match socket.local_addr() {
                Ok(addr) => addr,
                Err(e) => {
                    error!("stream {stream_name}: local_addr failed: {e}");
                    return None;
                }
            };

            let raw = format!(
                "candidate:1 {component_id} udp {} {} {} typ host",
                host_candidate_priority(component_id),
                local.ip(),
                local.port(),
            );
            match IceCandidate::new(&raw, "", 0) {
                Ok(candidate) => {
                    slot.local_candidates.push(candidate.clone());
                    slot.sockets.push(socket);
                    events.push(IceAgentEvent::Candidate {
                        stream_id: stream_id.to_owned(),
                        candidate,
                    });
                }
                Err(e) => {
                    error!("stream {stream_name}: building host candidate: {e}");
                    return None;
                }
            }
        }

        Some(events)
    }
}

impl Default for UdpIceAgent {
    fn default() -> Self {
        UdpIceAgent::new()
    }
}

fn bind_in_range(address: &str, min_port: u16, max_port: u16) -> Option<UdpSocket> {
    if min_port == 0 && max_port == 0 {
        return match UdpSocket::bind((address, 0)) {
            Ok(s) => Some(s),
            Err(e) => {
                error!("binding {address}: {e}");
                None
            }
        };
    }

    for port in min_port..=max_port {
        if let Ok(s) = UdpSocket::bind((address, port)) {
            return Some(s);
        }
    }
    error!("no free port for {address} in [{min_port}, {max_port}]");
    None
}

impl IceAgent for UdpIceAgent {
    fn add_event_handler(&mut self, handler: IceEventHandler) {
        lock(&self.handlers).push(handler);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn add_stream(&mut self, name: &str, min_port: u16, max_port: u16) -> Option<String> {
        if min_port != 0 && max_port < min_port {
            error!("stream {name}: invalid port range [{min_port}, {max_port}]");
            return None;
        }

        let stream_id = self.next_stream_id.to_string();
        self.next_stream_id += 1;

        let mut components = HashMap::new();
        components.insert(RTP_COMPONENT, ComponentSlot::new());
        components.insert(RTCP_COMPONENT, ComponentSlot::new());

        self.streams.insert(
            stream_id.clone(),
            IceStream {
                name: name.to_owned(),
                min_port,
                max_port,
                local_ufrag: random_ice_string(UFRAG_LEN),
                local_pwd: random_ice_string(PWD_LEN),
                remote_ufrag: None,
                remote_pwd: None,
                gathering_done: false,
                relays: Vec::new(),
                components,
            },
        );

        debug!("stream {stream_id} ({name}) added");
        Some(stream_id)
    }

    fn remove_stream(&mut self, stream_id: &str) {
        if self.streams.remove(stream_id).is_none() {
            debug!("remove_stream: unknown stream {stream_id}");
        }
    }

    fn set_remote_credentials(&mut self, stream_id: &str, ufrag: &str, pwd: &str) -> bool {
        match self.streams.get_mut(stream_id) {
            Some(stream) => {
                stream.remote_ufrag = Some(ufrag.to_owned());
                stream.remote_pwd = Some(pwd.to_owned());
                true
            }
            None => false,
        }
    }

    fn get_local_credentials(&self, stream_id: &str) -> Option<(String, String)> {
        self.streams
            .get(stream_id)
            .map(|s| (s.local_ufrag.clone(), s.local_pwd.clone()))
    }

    fn set_stun_server(&mut self, info: StunServerInfo) {
        debug!("using STUN server {}:{}", info.address, info.port);
        self.stun = Some(info);
    }

    fn add_relay_server(&mut self, stream_id: &str, info: RelayServerInfo) {
        let Some(stream) = self.streams.get_mut(stream_id) else {
            warn!("add_relay_server: unknown stream {stream_id}");
            return;
        };
        // One registration covers both components of the stream.
        debug!(
            "stream {stream_id}: TURN relay {}:{} ({:?})",
            info.address, info.port, info.transport
        );
        if !stream.relays.contains(&info) {
            stream.relays.push(info);
        }
    }

    fn set_network_interfaces(&mut self, interfaces: &[String]) {
        self.interfaces = interfaces.to_vec();
    }

    fn set_ice_tcp(&mut self, enabled: bool) {
        // This backend never produces TCP candidates; the toggle is
        // recorded for parity with engines that do.
        self.ice_tcp = enabled;
    }

    fn start_gathering_candidates(&mut self, stream_id: &str) -> bool {
        let addresses = if self.interfaces.is_empty() {
            vec!["127.0.0.1".to_owned()]
        } else {
            self.interfaces.clone()
        };

        if !self.ice_tcp {
            debug!("TCP candidate discovery disabled");
        }
        if let Some(stun) = &self.stun {
            // Host-only backend: the STUN server is recorded but no
            // server-reflexive discovery happens here.
            debug!("STUN server {}:{} configured", stun.address, stun.port);
        }

        let Some(stream) = self.streams.get_mut(stream_id) else {
            error!("start_gathering_candidates: unknown stream {stream_id}");
            return false;
        };

        let mut events = Vec::new();
        for component_id in [RTP_COMPONENT, RTCP_COMPONENT] {
            let Some(slot) = stream.components.get_mut(&component_id) else {
                return false;
            };
            match Self::gather_component(
                stream_id,
                &stream.name,
                stream.min_port,
                stream.max_port,
                &addresses,
                component_id,
                slot,
            ) {
                Some(component_events) => events.extend(component_events),
                None => return false,
            }
        }

        stream.gathering_done = true;
        events.push(IceAgentEvent::GatheringDone {
            stream_id: stream_id.to_owned(),
        });

        for event in events {
            self.emit(event);
        }
        true
    }

    fn add_ice_candidate(&mut self, candidate: &IceCandidate, stream_id: &str) -> bool {
        let Some(stream) = self.streams.get_mut(stream_id) else {
            error!("add_ice_candidate: unknown stream {stream_id}");
            return false;
        };
        let have_credentials = stream.remote_ufrag.is_some() && stream.remote_pwd.is_some();
        let component_id = candidate.component_id();
        let Some(slot) = stream.components.get_mut(&component_id) else {
            error!("add_ice_candidate: stream {stream_id} has no component {component_id}");
            return false;
        };

        // Buffered-candidate replay may present the same candidate
        // more than once; it is recorded a single time.
        let duplicate = slot
            .remote_candidates
            .iter()
            .any(|c| c.candidate_str() == candidate.candidate_str());
        if !duplicate {
            slot.remote_candidates.push(candidate.clone());
        }
        let state = slot.state;

        if have_credentials && state == IceComponentState::Gathering {
            self.set_component_state(stream_id, component_id, IceComponentState::Connecting);
        }
        true
    }

    fn get_default_local_candidate(
        &self,
        stream_id: &str,
        component_id: u16,
    ) -> Option<IceCandidate> {
        self.streams
            .get(stream_id)
            .and_then(|s| s.components.get(&component_id))
            .and_then(|c| c.local_candidates.first().cloned())
    }

    fn get_local_candidates(&self, stream_id: &str, component_id: u16) -> Vec<IceCandidate> {
        self.streams
            .get(stream_id)
            .and_then(|s| s.components.get(&component_id))
            .map(|c| c.local_candidates.clone())
            .unwrap_or_default()
    }

    fn get_remote_candidates(&self, stream_id: &str, component_id: u16) -> Vec<IceCandidate> {
        self.streams
            .get(stream_id)
            .and_then(|s| s.components.get(&component_id))
            .map(|c| c.remote_candidates.clone())
            .unwrap_or_default()
    }

    fn get_component_state(&self, stream_id: &str, component_id: u16) -> IceComponentState {
        self.streams
            .get(stream_id)
            .and_then(|s| s.components.get(&component_id))
            .map(|c| c.state)
            .unwrap_or(IceComponentState::Disconnected)
    }

    fn set_controlling_mode(&mut self, controlling: bool) {
        self.controlling = controlling;
    }

    fn get_controlling_mode(&self) -> bool {
        self.controlling
    }

    fn run_agent(&mut self) {
        let Some(rx) = self.event_rx.take() else {
            warn!("run_agent called twice");
            return;
        };
        let handlers = Arc::clone(&self.handlers);
        thread::Builder::new()
            .name("ice-agent-events".to_owned())
            .spawn(move || {
                while let Ok(event) = rx.recv() {
                    let snapshot: Vec<IceEventHandler> = lock(&handlers).clone();
                    for handler in snapshot {
                        handler(&event);
                    }
                }
            })
            .map(|_| ())
            .unwrap_or_else(|e| error!("spawning event thread: {e}"));
    }
}
