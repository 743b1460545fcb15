#[cfg(test)]
mod candidate_test;
#[cfg(test)]
mod udp_agent_test;

pub mod agent;
pub mod candidate;
pub mod udp_agent;

pub use agent::{
    IceAgent, IceAgentEvent, IceComponentState, IceEventHandler, RelayServerInfo, SharedIceAgent,
    StunServerInfo, TurnTransport,
};
pub use candidate::{CandidateProtocol, CandidateType, IceCandidate, RTCP_COMPONENT, RTP_COMPONENT};
pub use udp_agent::UdpIceAgent;
