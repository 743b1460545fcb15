use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid data channel message type {0}")]
    ErrInvalidMessageType(u8),
    #[error("invalid data channel type {0}")]
    ErrInvalidChannelType(u8),
    #[error("invalid data channel priority {0}")]
    ErrInvalidChannelPriority(u16),
    #[error("invalid payload protocol identifier {0}")]
    ErrInvalidPayloadProtocolIdentifier(u32),
    #[error("invalid ICE candidate: {0}")]
    ErrInvalidCandidate(String),
    #[error("invalid TURN url: {0}")]
    ErrInvalidTurnUrl(String),
    #[error("at most one of max-packet-life-time and max-retransmits may be set")]
    ErrBothReliabilityParamsSet,
    #[error("no usable SCTP stream id left")]
    ErrStreamIdsExhausted,
    #[error("session finalized")]
    ErrSessionFinalized,

    #[error("buffer too small: (expected: {expected}, actual: {actual})")]
    UnexpectedEndOfBuffer { expected: usize, actual: usize },
    #[error("{0}")]
    Other(String),
}
