
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::{Buf, Bytes};
use log::{debug, warn};

use datachannel::{
    ChannelPriority, ChannelType, DataChannelAck, DataChannelOpen, Message,
    PayloadProtocolIdentifier,
};
use shared::marshal::{Marshal, Unmarshal};

use crate::pipeline::{
    lock, FlowReturn, MediaBuffer, SctpReliability, SctpSendMeta, SinkPad, SrcPad,
};

#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub enum ChannelState {
    Closed,
    Connecting,
    Open,
    Closing,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelState::Closed => "CLOSED",
            ChannelState::Connecting => "CONNECTING",
            ChannelState::Open => "OPEN",
            ChannelState::Closing => "CLOSING",
        };
        write!(f, "{s}")
    }
}

pub type ResetHandler = Arc<dyn Fn(u16) + Send + Sync>;
pub type NegotiatedHandler = Arc<dyn Fn(u16) + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataChannelStats {
    pub stream_id: u16,
    pub label: String,
    pub protocol: String,
    pub state: ChannelState,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub messages_sent: u64,
    pub messages_recv: u64,
}

struct ChannelInner {
    state: ChannelState,
    negotiated: bool,
    ordered: bool,
    /// -1 when unset; at most one of the two is ever >= 0.
    max_packet_life_time: i32,
    max_retransmits: i32,
    label: String,
    protocol: String,
    priority: u16,
    reset_handler: Option<ResetHandler>,
    negotiated_handler: Option<NegotiatedHandler>,
}

/// One data channel's establishment state machine and send/receive
/// paths, multiplexed as one SCTP stream.
pub struct WebRtcDataChannelBin {
    id: u16,
    inner: Mutex<ChannelInner>,
    bytes_sent: AtomicU64,
    bytes_recv: AtomicU64,
    messages_sent: AtomicU64,
    messages_recv: AtomicU64,
    /// Toward the SCTP encoder's request pad for this stream.
    net_src: SrcPad,
    /// Fed by the SCTP decoder's per-stream src pad.
    session_sink: SinkPad,
    /// Toward the consuming application.
    app_src: SrcPad,
    /// Application-side input.
    app_sink: SinkPad,
}

impl WebRtcDataChannelBin {
    /// Locally initiated channel; negotiation starts on `request_open`.
    pub fn new_local(
        id: u16,
        ordered: bool,
        max_packet_life_time: i32,
        max_retransmits: i32,
        label: &str,
        protocol: &str,
    ) -> Arc<Self> {
        Self::build(
            id,
            ordered,
            max_packet_life_time,
            max_retransmits,
            label,
            protocol,
        )
    }

    /// Remotely initiated channel; parameters arrive with the peer's
    /// OPEN message.
    pub fn new_remote(id: u16) -> Arc<Self> {
        Self::build(id, true, -1, -1, "", "")
    }

    fn build(
        id: u16,
        ordered: bool,
        max_packet_life_time: i32,
        max_retransmits: i32,
        label: &str,
        protocol: &str,
    ) -> Arc<Self> {
        let bin = Arc::new(WebRtcDataChannelBin {
            id,
            inner: Mutex::new(ChannelInner {
                state: ChannelState::Closed,
                negotiated: false,
                ordered,
                max_packet_life_time,
                max_retransmits,
                label: label.to_owned(),
                protocol: protocol.to_owned(),
                priority: ChannelPriority::Ignored as u16,
                reset_handler: None,
                negotiated_handler: None,
            }),
            bytes_sent: AtomicU64::new(0),
            bytes_recv: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_recv: AtomicU64::new(0),
            net_src: SrcPad::new(format!("datachannel{id}:net_src")),
            session_sink: SinkPad::new(format!("datachannel{id}:session_sink")),
            app_src: SrcPad::new(format!("datachannel{id}:app_src")),
            app_sink: SinkPad::new(format!("datachannel{id}:app_sink")),
        });

        let weak = Arc::downgrade(&bin);
        bin.session_sink.set_chain(Box::new(move |buffer| {
            match Weak::upgrade(&weak) {
                Some(bin) => bin.handle_session_buffer(buffer),
                None => FlowReturn::Error,
            }
        }));
        let weak = Arc::downgrade(&bin);
        bin.app_sink.set_chain(Box::new(move |buffer| {
            match Weak::upgrade(&weak) {
                Some(bin) => bin.push_buffer(buffer),
                None => FlowReturn::Error,
            }
        }));
        bin
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn state(&self) -> ChannelState {
        lock(&self.inner).state
    }

    pub fn is_negotiated(&self) -> bool {
        lock(&self.inner).negotiated
    }

    pub fn label(&self) -> String {
        lock(&self.inner).label.clone()
    }

    pub fn protocol(&self) -> String {
        lock(&self.inner).protocol.clone()
    }

    pub fn is_ordered(&self) -> bool {
        lock(&self.inner).ordered
    }

    pub fn net_src_pad(&self) -> &SrcPad {
        &self.net_src
    }

    pub fn session_sink_pad(&self) -> &SinkPad {
        &self.session_sink
    }

    pub fn app_src_pad(&self) -> &SrcPad {
        &self.app_src
    }

    pub fn app_sink_pad(&self) -> &SinkPad {
        &self.app_sink
    }

    /// Asks the owning session to reset the underlying SCTP stream when
    /// this channel runs its local recovery procedure.
    pub fn set_reset_handler(&self, handler: ResetHandler) {
        lock(&self.inner).reset_handler = Some(handler);
    }

    pub fn set_negotiated_handler(&self, handler: NegotiatedHandler) {
        lock(&self.inner).negotiated_handler = Some(handler);
    }

    /// Begins the local OPEN handshake. Only legal from CLOSED on a
    /// never-negotiated channel; anything else is a logged no-op.
    pub fn request_open(&self) {
        let open = {
            let mut inner = lock(&self.inner);
            if inner.state != ChannelState::Closed || inner.negotiated {
                warn!(
                    "channel {}: open requested in state {} (negotiated: {})",
                    self.id, inner.state, inner.negotiated
                );
                return;
            }
            inner.state = ChannelState::Connecting;

            DataChannelOpen {
                channel_type: derive_channel_type(
                    inner.ordered,
                    inner.max_packet_life_time,
                    inner.max_retransmits,
                ),
                priority: inner.priority,
                reliability_parameter: reliability_parameter(
                    inner.max_packet_life_time,
                    inner.max_retransmits,
                ),
                label: inner.label.clone(),
                protocol: inner.protocol.clone(),
            }
        };
        debug!("channel {}: sending OPEN", self.id);
        self.send_control(Message::DataChannelOpen(open));
    }

    /// Local recovery for malformed or out-of-place peer input: the
    /// channel moves to CLOSING and the owner resets the SCTP stream;
    /// CLOSED is reached when that completes out-of-band.
    pub fn reset(&self) {
        let handler = {
            let mut inner = lock(&self.inner);
            if inner.state == ChannelState::Closing {
                return;
            }
            inner.state = ChannelState::Closing;
            inner.reset_handler.clone()
        };
        match handler {
            Some(handler) => handler(self.id),
            None => warn!("channel {}: no reset handler installed", self.id),
        }
    }

    /// Out-of-band completion of the reset procedure.
    pub fn complete_close(&self) {
        lock(&self.inner).state = ChannelState::Closed;
    }

    /// Convenience send path deriving the PPID from the payload.
    pub fn send(&self, data: Bytes, is_binary: bool) -> FlowReturn {
        let ppid = match (is_binary, data.is_empty()) {
            (true, false) => PayloadProtocolIdentifier::Binary,
            (true, true) => PayloadProtocolIdentifier::BinaryEmpty,
            (false, false) => PayloadProtocolIdentifier::String,
            (false, true) => PayloadProtocolIdentifier::StringEmpty,
        };
        self.push_with_ppid(MediaBuffer::from_data(data), ppid)
    }

    /// Send path honoring existing receive metadata (SCTP-to-SCTP
    /// passthrough): a PPID already attached downstream takes precedence
    /// over derivation.
    pub fn push_buffer(&self, buffer: MediaBuffer) -> FlowReturn {
        let ppid = match buffer.sctp_recv {
            Some(meta) => match PayloadProtocolIdentifier::try_from_u32(meta.ppid) {
                Ok(ppid) if is_valid_data_ppid(ppid, buffer.data.is_empty()) => ppid,
                _ => {
                    warn!(
                        "channel {}: dropping buffer with unusable ppid {}",
                        self.id, meta.ppid
                    );
                    return FlowReturn::Error;
                }
            },
            None => {
                if buffer.data.is_empty() {
                    PayloadProtocolIdentifier::BinaryEmpty
                } else {
                    PayloadProtocolIdentifier::Binary
                }
            }
        };
        self.push_with_ppid(buffer, ppid)
    }

    fn push_with_ppid(&self, mut buffer: MediaBuffer, ppid: PayloadProtocolIdentifier) -> FlowReturn {
        let (ordered, reliability, reliability_parameter) = {
            let inner = lock(&self.inner);
            match inner.state {
                ChannelState::Closing | ChannelState::Closed => {
                    warn!("channel {}: send on {} channel", self.id, inner.state);
                    return FlowReturn::NotLinked;
                }
                // ACK must reach the peer before any queued data, so
                // everything sent while CONNECTING goes ordered.
                ChannelState::Connecting => (
                    true,
                    derive_reliability(&inner).0,
                    derive_reliability(&inner).1,
                ),
                ChannelState::Open => {
                    let (reliability, parameter) = derive_reliability(&inner);
                    (inner.ordered, reliability, parameter)
                }
            }
        };

        let payload_len = buffer.data.len() as u64;
        if buffer.data.is_empty() {
            // SCTP cannot carry a distinguishable zero-byte user
            // message; a tagged placeholder byte stands in for it.
            buffer.data = Bytes::from_static(&[0u8]);
        }
        buffer.sctp_recv = None;
        buffer.sctp_send = Some(SctpSendMeta {
            ppid: ppid.into(),
            ordered,
            reliability,
            reliability_parameter,
        });

        let ret = self.net_src.push(buffer);
        if ret == FlowReturn::Ok {
            self.bytes_sent.fetch_add(payload_len, Ordering::Relaxed);
            self.messages_sent.fetch_add(1, Ordering::Relaxed);
        }
        ret
    }

    fn send_control(&self, message: Message) {
        let data = match message.marshal() {
            Ok(data) => data,
            Err(e) => {
                warn!("channel {}: marshaling control message: {e}", self.id);
                return;
            }
        };
        let mut buffer = MediaBuffer::from_data(data);
        buffer.sctp_send = Some(SctpSendMeta {
            ppid: PayloadProtocolIdentifier::Dcep.into(),
            ordered: true,
            reliability: SctpReliability::None,
            reliability_parameter: 0,
        });
        if self.net_src.push(buffer) != FlowReturn::Ok {
            warn!("channel {}: control message not delivered", self.id);
        }
    }

    /// Entry point for buffers popped off this channel's SCTP stream.
    pub fn handle_session_buffer(&self, buffer: MediaBuffer) -> FlowReturn {
        let Some(recv) = buffer.sctp_recv else {
            warn!("channel {}: inbound buffer without SCTP metadata", self.id);
            return FlowReturn::Error;
        };

        let ppid = match PayloadProtocolIdentifier::try_from_u32(recv.ppid) {
            Ok(ppid) => ppid,
            Err(e) => {
                warn!("channel {}: {e}", self.id);
                self.reset();
                return FlowReturn::Ok;
            }
        };

        match ppid {
            PayloadProtocolIdentifier::Dcep => {
                self.handle_control(&buffer.data);
                FlowReturn::Ok
            }
            PayloadProtocolIdentifier::String | PayloadProtocolIdentifier::Binary => {
                self.bytes_recv
                    .fetch_add(buffer.data.len() as u64, Ordering::Relaxed);
                self.messages_recv.fetch_add(1, Ordering::Relaxed);
                self.app_src.push(buffer)
            }
            PayloadProtocolIdentifier::StringEmpty | PayloadProtocolIdentifier::BinaryEmpty => {
                self.messages_recv.fetch_add(1, Ordering::Relaxed);
                let mut empty = MediaBuffer::from_data(Bytes::new());
                empty.sctp_recv = buffer.sctp_recv;
                self.app_src.push(empty)
            }
            PayloadProtocolIdentifier::StringPartial | PayloadProtocolIdentifier::BinaryPartial => {
                warn!(
                    "channel {}: deprecated partial-delivery ppid {} not supported",
                    self.id, recv.ppid
                );
                self.reset();
                FlowReturn::Ok
            }
        }
    }

    fn handle_control(&self, data: &Bytes) {
        let mut buf = &data[..];
        let message = match Message::unmarshal(&mut buf) {
            Ok(message) => message,
            Err(e) => {
                warn!("channel {}: malformed control message: {e}", self.id);
                self.reset();
                return;
            }
        };
        if buf.has_remaining() {
            warn!(
                "channel {}: control message carries {} trailing bytes",
                self.id,
                buf.remaining()
            );
            self.reset();
            return;
        }

        match message {
            Message::DataChannelOpen(open) => self.handle_open_request(open),
            Message::DataChannelAck(_) => self.handle_ack(),
        }
    }

    fn handle_open_request(&self, open: DataChannelOpen) {
        if let Err(e) = ChannelPriority::try_from_u16(open.priority) {
            warn!("channel {}: {e}", self.id);
            self.reset();
            return;
        }

        let handler = {
            let mut inner = lock(&self.inner);
            if inner.state != ChannelState::Closed {
                warn!(
                    "channel {}: OPEN received in state {}",
                    self.id, inner.state
                );
                drop(inner);
                self.reset();
                return;
            }

            inner.ordered = open.channel_type.is_ordered();
            match open.channel_type {
                ChannelType::Reliable | ChannelType::ReliableUnordered => {
                    inner.max_packet_life_time = -1;
                    inner.max_retransmits = -1;
                }
                ChannelType::PartialReliableRexmit
                | ChannelType::PartialReliableRexmitUnordered => {
                    inner.max_retransmits = open.reliability_parameter as i32;
                    inner.max_packet_life_time = -1;
                }
                ChannelType::PartialReliableTimed | ChannelType::PartialReliableTimedUnordered => {
                    inner.max_packet_life_time = open.reliability_parameter as i32;
                    inner.max_retransmits = -1;
                }
            }
            inner.label = open.label;
            inner.protocol = open.protocol;
            inner.priority = open.priority;
            inner.state = ChannelState::Open;
            inner.negotiated = true;
            inner.negotiated_handler.clone()
        };

        debug!("channel {}: OPEN accepted, sending ACK", self.id);
        self.send_control(Message::DataChannelAck(DataChannelAck));
        if let Some(handler) = handler {
            handler(self.id);
        }
    }

    fn handle_ack(&self) {
        let handler = {
            let mut inner = lock(&self.inner);
            if inner.state != ChannelState::Connecting {
                warn!("channel {}: ACK received in state {}", self.id, inner.state);
                return;
            }
            inner.state = ChannelState::Open;
            inner.negotiated = true;
            inner.negotiated_handler.clone()
        };
        debug!("channel {}: ACK received, channel open", self.id);
        if let Some(handler) = handler {
            handler(self.id);
        }
    }

    pub fn stats(&self) -> DataChannelStats {
        let (label, protocol, state) = {
            let inner = lock(&self.inner);
            (inner.label.clone(), inner.protocol.clone(), inner.state)
        };
        DataChannelStats {
            stream_id: self.id,
            label,
            protocol,
            state,
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_recv: self.bytes_recv.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_recv: self.messages_recv.load(Ordering::Relaxed),
        }
    }
}

fn derive_channel_type(ordered: bool, max_packet_life_time: i32, max_retransmits: i32) -> ChannelType {
    match (ordered, max_packet_life_time >= 0, max_retransmits >= 0) {
        (true, false, false) => ChannelType::Reliable,
        (false, false, false) => ChannelType::ReliableUnordered,
        (true, false, true) => ChannelType::PartialReliableRexmit,
        (false, false, true) => ChannelType::PartialReliableRexmitUnordered,
        (true, true, _) => ChannelType::PartialReliableTimed,
        (false, true, _) => ChannelType::PartialReliableTimedUnordered,
    }
}

fn reliability_parameter(max_packet_life_time: i32, max_retransmits: i32) -> u32 {
    if max_retransmits >= 0 {
        max_retransmits as u32
    } else if max_packet_life_time >= 0 {
        max_packet_life_time as u32
    } else {
        0
    }
}

fn derive_reliability(inner: &ChannelInner) -> (SctpReliability, u32) {
    if inner.max_retransmits >= 0 {
        (SctpReliability::Rtx, inner.max_retransmits as u32)
    } else if inner.max_packet_life_time >= 0 {
        (SctpReliability::Ttl, inner.max_packet_life_time as u32)
    } else {
        (SctpReliability::None, 0)
    }
}

fn is_valid_data_ppid(ppid: PayloadProtocolIdentifier, is_empty: bool) -> bool {
    match ppid {
        PayloadProtocolIdentifier::String | PayloadProtocolIdentifier::Binary => !is_empty,
        PayloadProtocolIdentifier::StringEmpty | PayloadProtocolIdentifier::BinaryEmpty => is_empty,
        _ => false,
    }
}
