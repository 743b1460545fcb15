#![warn(rust_2018_idioms)]

pub mod message;
pub mod ppid;

pub use message::message_channel_ack::DataChannelAck;
pub use message::message_channel_open::{ChannelPriority, ChannelType, DataChannelOpen};
pub use message::message_type::MessageType;
pub use message::Message;
pub use ppid::PayloadProtocolIdentifier;
