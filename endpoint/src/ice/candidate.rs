use std::fmt;

use shared::error::{Error, Result};

pub const RTP_COMPONENT: u16 = 1;
pub const RTCP_COMPONENT: u16 = 2;

#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub enum CandidateProtocol {
    Udp,
    Tcp,
}

impl fmt::Display for CandidateProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateProtocol::Udp => write!(f, "udp"),
            CandidateProtocol::Tcp => write!(f, "tcp"),
        }
    }
}

#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateType::Host => write!(f, "host"),
            CandidateType::ServerReflexive => write!(f, "srflx"),
            CandidateType::PeerReflexive => write!(f, "prflx"),
            CandidateType::Relay => write!(f, "relay"),
        }
    }
}

/// One parsed `a=candidate` line, paired with the SDP media it belongs to.
/// Construction fails on anything that does not parse; there is no
/// half-valid candidate object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IceCandidate {
    candidate: String,
    sdp_mid: String,
    sdp_m_line_index: u32,
    foundation: String,
    component_id: u16,
    protocol: CandidateProtocol,
    priority: u32,
    address: String,
    port: u16,
    candidate_type: CandidateType,
    related_address: Option<String>,
    related_port: Option<u16>,
    tcp_type: Option<String>,
}

impl IceCandidate {
    /// Parses a candidate line. Accepts the bare grammar as well as the
    /// `a=` / `candidate:` prefixed forms.
    pub fn new(raw: &str, sdp_mid: &str, sdp_m_line_index: u32) -> Result<Self> {
        let bare = raw.trim();
        let bare = bare.strip_prefix("a=").unwrap_or(bare);
        let body = bare.strip_prefix("candidate:").unwrap_or(bare);

        let split: Vec<&str> = body.split_whitespace().collect();
        if split.len() < 8 {
            return Err(Error::ErrInvalidCandidate(format!(
                "attribute not long enough to be ICE candidate ({})",
                split.len()
            )));
        }

        let foundation = split[0].to_owned();
        let component_id = split[1]
            .parse::<u16>()
            .map_err(|_| Error::ErrInvalidCandidate(format!("component {}", split[1])))?;
        let protocol = match split[2].to_lowercase().as_str() {
            "udp" => CandidateProtocol::Udp,
            "tcp" => CandidateProtocol::Tcp,
            other => {
                return Err(Error::ErrInvalidCandidate(format!("transport {other}")));
            }
        };
        let priority = split[3]
            .parse::<u32>()
            .map_err(|_| Error::ErrInvalidCandidate(format!("priority {}", split[3])))?;
        let address = split[4].to_owned();
        let port = split[5]
            .parse::<u16>()
            .map_err(|_| Error::ErrInvalidCandidate(format!("port {}", split[5])))?;
        if split[6] != "typ" {
            return Err(Error::ErrInvalidCandidate(format!(
                "missing typ keyword, got {}",
                split[6]
            )));
        }
        let candidate_type = match split[7] {
            "host" => CandidateType::Host,
            "srflx" => CandidateType::ServerReflexive,
            "prflx" => CandidateType::PeerReflexive,
            "relay" => CandidateType::Relay,
            other => {
                return Err(Error::ErrInvalidCandidate(format!("candidate type {other}")));
            }
        };

        let mut related_address = None;
        let mut related_port = None;
        let mut tcp_type = None;

        let mut i = 8;
        while i + 1 < split.len() {
            match split[i] {
                "raddr" => related_address = Some(split[i + 1].to_owned()),
                "rport" => {
                    related_port = Some(split[i + 1].parse::<u16>().map_err(|_| {
                        Error::ErrInvalidCandidate(format!("rport {}", split[i + 1]))
                    })?);
                }
                "tcptype" => tcp_type = Some(split[i + 1].to_owned()),
                // generation, network-id and friends are not interpreted
                _ => {}
            }
            i += 2;
        }

        Ok(IceCandidate {
            candidate: format!("candidate:{body}"),
            sdp_mid: sdp_mid.to_owned(),
            sdp_m_line_index,
            foundation,
            component_id,
            protocol,
            priority,
            address,
            port,
            candidate_type,
            related_address,
            related_port,
            tcp_type,
        })
    }

    /// The `candidate:...` string (SDP attribute value form).
    pub fn candidate_str(&self) -> &str {
        &self.candidate
    }

    /// The attribute value without the `candidate:` prefix, as placed in
    /// an SDP `a=candidate:` line.
    pub fn sdp_attribute_value(&self) -> &str {
        self.candidate.strip_prefix("candidate:").unwrap_or(&self.candidate)
    }

    pub fn sdp_mid(&self) -> &str {
        &self.sdp_mid
    }

    pub fn sdp_m_line_index(&self) -> u32 {
        self.sdp_m_line_index
    }

    pub fn foundation(&self) -> &str {
        &self.foundation
    }

    pub fn component_id(&self) -> u16 {
        self.component_id
    }

    pub fn protocol(&self) -> CandidateProtocol {
        self.protocol
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn candidate_type(&self) -> CandidateType {
        self.candidate_type
    }

    pub fn related_address(&self) -> Option<&str> {
        self.related_address.as_deref()
    }

    pub fn related_port(&self) -> Option<u16> {
        self.related_port
    }

    pub fn tcp_type(&self) -> Option<&str> {
        self.tcp_type.as_deref()
    }

    /// Rewrites the candidate address, both the parsed field and the
    /// embedded candidate string (external address override).
    pub fn set_address(&mut self, address: &str) {
        let body = self
            .candidate
            .strip_prefix("candidate:")
            .unwrap_or(&self.candidate);
        let mut tokens: Vec<String> = body.split_whitespace().map(str::to_owned).collect();
        if tokens.len() > 4 {
            tokens[4] = address.to_owned();
            self.candidate = format!("candidate:{}", tokens.join(" "));
        }
        self.address = address.to_owned();
    }

    /// A copy of this candidate re-homed onto another media line
    /// (bundle fan-out keeps the physical candidate, changes mid/index).
    pub fn for_media(&self, sdp_mid: &str, sdp_m_line_index: u32) -> Self {
        let mut copy = self.clone();
        copy.sdp_mid = sdp_mid.to_owned();
        copy.sdp_m_line_index = sdp_m_line_index;
        copy
    }
}
