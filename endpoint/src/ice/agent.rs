use std::any::Any;
use std::fmt;
use std::sync::Arc;

use log::warn;

use super::candidate::IceCandidate;

/// Per-(stream, component) connectivity state.
#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub enum IceComponentState {
    Disconnected,
    Gathering,
    Connecting,
    Connected,
    Ready,
    Failed,
}

impl fmt::Display for IceComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IceComponentState::Disconnected => "DISCONNECTED",
            IceComponentState::Gathering => "GATHERING",
            IceComponentState::Connecting => "CONNECTING",
            IceComponentState::Connected => "CONNECTED",
            IceComponentState::Ready => "READY",
            IceComponentState::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub enum TurnTransport {
    Udp,
    Tcp,
    Tls,
}

/// One TURN relay, applied to both components of a stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayServerInfo {
    pub address: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub transport: TurnTransport,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StunServerInfo {
    pub address: String,
    pub port: u16,
}

/// Events fanned out by an agent. Delivery is at-least-once per real
/// occurrence; ordering is only guaranteed within one stream.
#[derive(Clone, Debug)]
pub enum IceAgentEvent {
    Candidate {
        stream_id: String,
        candidate: IceCandidate,
    },
    GatheringDone {
        stream_id: String,
    },
    ComponentStateChanged {
        stream_id: String,
        component_id: u16,
        state: IceComponentState,
    },
    NewSelectedPair {
        stream_id: String,
        component_id: u16,
        local: String,
        remote: String,
    },
}

pub type IceEventHandler = Arc<dyn Fn(&IceAgentEvent) + Send + Sync>;

/// ICE engine abstraction. Stream ids are opaque string handles unique
/// within one agent; component ids are 1 (RTP) and 2 (RTCP) by
/// convention.
///
/// Every operation has a default body that diagnoses the missing
/// override and answers with a conservative failure value, so a partial
/// backend degrades loudly instead of crashing.
pub trait IceAgent: Send {
    /// Registers an event fan-out handler.
    fn add_event_handler(&mut self, handler: IceEventHandler);

    /// Concrete-type escape hatch for transport construction.
    fn as_any(&self) -> &dyn Any;

    /// Allocates one stream with two components; `None` when the engine
    /// cannot allocate.
    fn add_stream(&mut self, _name: &str, _min_port: u16, _max_port: u16) -> Option<String> {
        warn!("add_stream not implemented");
        None
    }

    fn remove_stream(&mut self, stream_id: &str) {
        warn!("remove_stream not implemented (stream {stream_id})");
    }

    fn set_remote_credentials(&mut self, stream_id: &str, _ufrag: &str, _pwd: &str) -> bool {
        warn!("set_remote_credentials not implemented (stream {stream_id})");
        false
    }

    fn get_local_credentials(&self, stream_id: &str) -> Option<(String, String)> {
        warn!("get_local_credentials not implemented (stream {stream_id})");
        None
    }

    fn set_stun_server(&mut self, _info: StunServerInfo) {
        warn!("set_stun_server not implemented");
    }

    fn add_relay_server(&mut self, stream_id: &str, _info: RelayServerInfo) {
        warn!("add_relay_server not implemented (stream {stream_id})");
    }

    fn set_network_interfaces(&mut self, _interfaces: &[String]) {
        warn!("set_network_interfaces not implemented");
    }

    fn set_ice_tcp(&mut self, _enabled: bool) {
        warn!("set_ice_tcp not implemented");
    }

    /// Begins asynchronous local candidate discovery for one stream.
    fn start_gathering_candidates(&mut self, stream_id: &str) -> bool {
        warn!("start_gathering_candidates not implemented (stream {stream_id})");
        false
    }

    /// Injects one remote candidate.
    fn add_ice_candidate(&mut self, _candidate: &IceCandidate, stream_id: &str) -> bool {
        warn!("add_ice_candidate not implemented (stream {stream_id})");
        false
    }

    fn get_default_local_candidate(
        &self,
        stream_id: &str,
        _component_id: u16,
    ) -> Option<IceCandidate> {
        warn!("get_default_local_candidate not implemented (stream {stream_id})");
        None
    }

    fn get_local_candidates(&self, stream_id: &str, _component_id: u16) -> Vec<IceCandidate> {
        warn!("get_local_candidates not implemented (stream {stream_id})");
        Vec::new()
    }

    fn get_remote_candidates(&self, stream_id: &str, _component_id: u16) -> Vec<IceCandidate> {
        warn!("get_remote_candidates not implemented (stream {stream_id})");
        Vec::new()
    }

    fn get_component_state(&self, stream_id: &str, _component_id: u16) -> IceComponentState {
        warn!("get_component_state not implemented (stream {stream_id})");
        IceComponentState::Disconnected
    }

    fn set_controlling_mode(&mut self, _controlling: bool) {
        warn!("set_controlling_mode not implemented");
    }

    fn get_controlling_mode(&self) -> bool {
        warn!("get_controlling_mode not implemented");
        false
    }

    /// Starts the agent's internal event delivery loop, if it has one.
    fn run_agent(&mut self) {
        warn!("run_agent not implemented");
    }
}

pub type SharedIceAgent = Arc<std::sync::Mutex<dyn IceAgent>>;
