use super::*;
use shared::error::{Error, Result};

const CHANNEL_TYPE_LEN: usize = 1;
const PRIORITY_LEN: usize = 2;
const RELIABILITY_LEN: usize = 4;
const LABEL_LEN_LEN: usize = 2;
const PROTOCOL_LEN_LEN: usize = 2;

pub(crate) const CHANNEL_OPEN_HEADER_LEN: usize =
    CHANNEL_TYPE_LEN + PRIORITY_LEN + RELIABILITY_LEN + LABEL_LEN_LEN + PROTOCOL_LEN_LEN;

const CHANNEL_TYPE_UNORDERED_BIT: u8 = 0x80;

/// Delivery properties requested for a channel in an OPEN message.
///
/// Bit 0x80 clears the in-order delivery guarantee; the low bits select
/// the retransmission policy.
#[derive(Eq, PartialEq, Copy, Clone, Debug)]
#[repr(u8)]
pub enum ChannelType {
    Reliable = 0x00,
    ReliableUnordered = 0x80,
    PartialReliableRexmit = 0x01,
    PartialReliableRexmitUnordered = 0x81,
    PartialReliableTimed = 0x02,
    PartialReliableTimedUnordered = 0x82,
}

impl ChannelType {
    pub fn try_from_u8(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Self::Reliable),
            0x80 => Ok(Self::ReliableUnordered),
            0x01 => Ok(Self::PartialReliableRexmit),
            0x81 => Ok(Self::PartialReliableRexmitUnordered),
            0x02 => Ok(Self::PartialReliableTimed),
            0x82 => Ok(Self::PartialReliableTimedUnordered),
            other => Err(Error::ErrInvalidChannelType(other)),
        }
    }

    pub fn is_ordered(&self) -> bool {
        (*self as u8) & CHANNEL_TYPE_UNORDERED_BIT == 0
    }
}

/// Transmission priorities an OPEN message may carry; anything else is a
/// protocol violation.
#[derive(Eq, PartialEq, Copy, Clone, Debug)]
#[repr(u16)]
pub enum ChannelPriority {
    Ignored = 0,
    BelowNormal = 128,
    Normal = 256,
    High = 512,
    ExtraHigh = 1024,
}

impl ChannelPriority {
    pub fn try_from_u16(value: u16) -> Result<Self> {
        match value {
            0 => Ok(Self::Ignored),
            128 => Ok(Self::BelowNormal),
            256 => Ok(Self::Normal),
            512 => Ok(Self::High),
            1024 => Ok(Self::ExtraHigh),
            other => Err(Error::ErrInvalidChannelPriority(other)),
        }
    }
}

/// The data-part of a data-channel OPEN message without the message type.
///
/// # Memory layout
///
/// ```plain
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|  Message Type |  Channel Type |            Priority           |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                    Reliability Parameter                      |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|         Label Length          |       Protocol Length         |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                             Label                             |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                            Protocol                           |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct DataChannelOpen {
    pub channel_type: ChannelType,
    pub priority: u16,
    pub reliability_parameter: u32,
    pub label: String,
    pub protocol: String,
}

impl MarshalSize for DataChannelOpen {
    fn marshal_size(&self) -> usize {
        CHANNEL_OPEN_HEADER_LEN + self.label.len() + self.protocol.len()
    }
}

impl Marshal for DataChannelOpen {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let required = self.marshal_size();
        if buf.len() < required {
            return Err(Error::UnexpectedEndOfBuffer {
                expected: required,
                actual: buf.len(),
            });
        }

        buf[0] = self.channel_type as u8;
        buf[1..3].copy_from_slice(&self.priority.to_be_bytes());
        buf[3..7].copy_from_slice(&self.reliability_parameter.to_be_bytes());
        buf[7..9].copy_from_slice(&(self.label.len() as u16).to_be_bytes());
        buf[9..11].copy_from_slice(&(self.protocol.len() as u16).to_be_bytes());

        let mut offset = CHANNEL_OPEN_HEADER_LEN;
        buf[offset..offset + self.label.len()].copy_from_slice(self.label.as_bytes());
        offset += self.label.len();
        buf[offset..offset + self.protocol.len()].copy_from_slice(self.protocol.as_bytes());
        offset += self.protocol.len();

        Ok(offset)
    }
}

impl Unmarshal for DataChannelOpen {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        if buf.remaining() < CHANNEL_OPEN_HEADER_LEN {
            return Err(Error::UnexpectedEndOfBuffer {
                expected: CHANNEL_OPEN_HEADER_LEN,
                actual: buf.remaining(),
            });
        }

        let channel_type = ChannelType::try_from_u8(buf.get_u8())?;
        let priority = buf.get_u16();
        let reliability_parameter = buf.get_u32();
        let label_len = buf.get_u16() as usize;
        let protocol_len = buf.get_u16() as usize;

        if buf.remaining() < label_len + protocol_len {
            return Err(Error::UnexpectedEndOfBuffer {
                expected: label_len + protocol_len,
                actual: buf.remaining(),
            });
        }

        let mut label = vec![0u8; label_len];
        buf.copy_to_slice(&mut label);
        let mut protocol = vec![0u8; protocol_len];
        buf.copy_to_slice(&mut protocol);

        let label = String::from_utf8(label)
            .map_err(|e| Error::Other(format!("channel label is not valid UTF-8: {e}")))?;
        let protocol = String::from_utf8(protocol)
            .map_err(|e| Error::Other(format!("channel protocol is not valid UTF-8: {e}")))?;

        Ok(Self {
            channel_type,
            priority,
            reliability_parameter,
            label,
            protocol,
        })
    }
}
