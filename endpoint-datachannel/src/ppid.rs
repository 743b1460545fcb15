use shared::error::{Error, Result};

/// SCTP payload protocol identifiers assigned to WebRTC data channel
/// user messages.
#[derive(Eq, PartialEq, Copy, Clone, Debug)]
#[repr(u32)]
pub enum PayloadProtocolIdentifier {
    /// Control messages (OPEN/ACK).
    Dcep = 50,
    String = 51,
    /// Deprecated partial delivery variant, rejected on receive.
    BinaryPartial = 52,
    Binary = 53,
    /// Deprecated partial delivery variant, rejected on receive.
    StringPartial = 54,
    StringEmpty = 56,
    BinaryEmpty = 57,
}

impl PayloadProtocolIdentifier {
    pub fn try_from_u32(value: u32) -> Result<Self> {
        match value {
            50 => Ok(Self::Dcep),
            51 => Ok(Self::String),
            52 => Ok(Self::BinaryPartial),
            53 => Ok(Self::Binary),
            54 => Ok(Self::StringPartial),
            56 => Ok(Self::StringEmpty),
            57 => Ok(Self::BinaryEmpty),
            other => Err(Error::ErrInvalidPayloadProtocolIdentifier(other)),
        }
    }

    /// Placeholder identifiers standing in for a zero-length user message.
    pub fn is_empty_variant(&self) -> bool {
        matches!(self, Self::StringEmpty | Self::BinaryEmpty)
    }

    pub fn is_partial_variant(&self) -> bool {
        matches!(self, Self::BinaryPartial | Self::StringPartial)
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary | Self::BinaryPartial | Self::BinaryEmpty)
    }
}

impl From<PayloadProtocolIdentifier> for u32 {
    fn from(ppid: PayloadProtocolIdentifier) -> Self {
        ppid as u32
    }
}
