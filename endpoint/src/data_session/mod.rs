
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use log::{debug, warn};

use shared::error::{Error, Result};

use crate::data_channel::{DataChannelStats, WebRtcDataChannelBin};
use crate::pipeline::{lock, SctpDecoder, SctpEncoder};

/// Stream id 65535 is reserved by the data-channel establishment
/// protocol and never assigned.
const RESERVED_STREAM_ID: u16 = u16::MAX;

static NEXT_ASSOCIATION_ID: AtomicU32 = AtomicU32::new(0);

pub type SessionEstablishedHandler = Arc<dyn Fn(bool) + Send + Sync>;
pub type ChannelOpenedHandler = Arc<dyn Fn(u16) + Send + Sync>;
pub type ChannelClosedHandler = Arc<dyn Fn(u16) + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataSessionStats {
    pub association_id: u32,
    pub session_established: bool,
    pub channels_opened: u32,
    pub channels_closed: u32,
    pub channels: Vec<DataChannelStats>,
}

struct SessionBinInner {
    session_established: bool,
    channels: HashMap<u16, Arc<WebRtcDataChannelBin>>,
    /// Channels created before the SCTP association came up; they are
    /// attached and opened once it does.
    pending: Vec<Arc<WebRtcDataChannelBin>>,
    established_handlers: Vec<SessionEstablishedHandler>,
    closed_handlers: Vec<ChannelClosedHandler>,
}

/// Multiplexes data channels over one SCTP association, owning the
/// stream-id space on its side of the DTLS role split.
pub struct WebRtcDataSessionBin {
    association_id: u32,
    dtls_client: bool,
    encoder: SctpEncoder,
    decoder: Arc<SctpDecoder>,
    inner: Mutex<SessionBinInner>,
    channels_opened: Arc<AtomicU32>,
    channels_closed: AtomicU32,
    /// Kept outside `inner` so the per-channel negotiated callbacks can
    /// reach them without referencing the bin itself.
    opened_handlers: Arc<Mutex<Vec<ChannelOpenedHandler>>>,
}

impl WebRtcDataSessionBin {
    pub fn new(dtls_client: bool) -> Arc<Self> {
        let association_id = NEXT_ASSOCIATION_ID.fetch_add(1, Ordering::SeqCst);
        let bin = Arc::new(WebRtcDataSessionBin {
            association_id,
            dtls_client,
            encoder: SctpEncoder::new(association_id),
            decoder: Arc::new(SctpDecoder::new(association_id)),
            inner: Mutex::new(SessionBinInner {
                session_established: false,
                channels: HashMap::new(),
                pending: Vec::new(),
                established_handlers: Vec::new(),
                closed_handlers: Vec::new(),
            }),
            channels_opened: Arc::new(AtomicU32::new(0)),
            channels_closed: AtomicU32::new(0),
            opened_handlers: Arc::new(Mutex::new(Vec::new())),
        });

        let weak = Arc::downgrade(&bin);
        bin.decoder.connect_pad_added(Box::new(move |stream_id, src_pad| {
            if let Some(bin) = Weak::upgrade(&weak) {
                bin.handle_pad_added(stream_id, src_pad);
            }
        }));
        let weak = Arc::downgrade(&bin);
        bin.decoder.connect_pad_removed(Box::new(move |stream_id| {
            if let Some(bin) = Weak::upgrade(&weak) {
                bin.handle_pad_removed(stream_id);
            }
        }));
        bin
    }

    pub fn association_id(&self) -> u32 {
        self.association_id
    }

    pub fn is_dtls_client(&self) -> bool {
        self.dtls_client
    }

    pub fn is_session_established(&self) -> bool {
        lock(&self.inner).session_established
    }

    pub fn encoder(&self) -> &SctpEncoder {
        &self.encoder
    }

    pub fn decoder(&self) -> &SctpDecoder {
        &self.decoder
    }

    pub fn connect_session_established(&self, handler: SessionEstablishedHandler) {
        lock(&self.inner).established_handlers.push(handler);
    }

    pub fn connect_channel_opened(&self, handler: ChannelOpenedHandler) {
        lock(&self.opened_handlers).push(handler);
    }

    pub fn connect_channel_closed(&self, handler: ChannelClosedHandler) {
        lock(&self.inner).closed_handlers.push(handler);
    }

    /// Ids this side may pick for its own channels. The DTLS client
    /// owns the even half of the space, the server the odd half.
    pub fn is_valid_local_open_id(&self, stream_id: u16) -> bool {
        stream_id != RESERVED_STREAM_ID && is_even(stream_id) == self.dtls_client
    }

    /// Ids the peer may pick; the complement of the local half.
    pub fn is_valid_remote_open_id(&self, stream_id: u16) -> bool {
        stream_id != RESERVED_STREAM_ID && is_even(stream_id) != self.dtls_client
    }

    fn pick_stream_id(&self, inner: &SessionBinInner) -> Result<u16> {
        let mut candidate: u32 = if self.dtls_client { 0 } else { 1 };
        while candidate < u32::from(RESERVED_STREAM_ID) {
            let id = candidate as u16;
            let in_use = inner.channels.contains_key(&id)
                || inner.pending.iter().any(|c| c.id() == id);
            if !in_use {
                return Ok(id);
            }
            candidate += 2;
        }
        Err(Error::ErrStreamIdsExhausted)
    }

    /// Creates a locally initiated channel. Before the association is
    /// established the channel is queued; afterwards it is attached and
    /// its OPEN handshake starts immediately.
    pub fn create_data_channel(
        &self,
        ordered: bool,
        max_packet_life_time: i32,
        max_retransmits: i32,
        label: &str,
        protocol: &str,
    ) -> Result<u16> {
        if max_packet_life_time >= 0 && max_retransmits >= 0 {
            return Err(Error::ErrBothReliabilityParamsSet);
        }

        let (channel, open_now) = {
            let mut inner = lock(&self.inner);
            let stream_id = self.pick_stream_id(&inner)?;
            let channel = WebRtcDataChannelBin::new_local(
                stream_id,
                ordered,
                max_packet_life_time,
                max_retransmits,
                label,
                protocol,
            );

            if inner.session_established {
                self.attach_channel(&channel);
                inner.channels.insert(stream_id, Arc::clone(&channel));
                (channel, true)
            } else {
                debug!(
                    "assoc {}: channel {} queued until association is established",
                    self.association_id, stream_id
                );
                inner.pending.push(Arc::clone(&channel));
                (channel, false)
            }
        };

        if open_now {
            channel.request_open();
        }
        Ok(channel.id())
    }

    pub fn get_data_channel(&self, stream_id: u16) -> Option<Arc<WebRtcDataChannelBin>> {
        let inner = lock(&self.inner);
        inner
            .channels
            .get(&stream_id)
            .cloned()
            .or_else(|| inner.pending.iter().find(|c| c.id() == stream_id).cloned())
    }

    /// Tears a channel down. Pending channels are simply discarded;
    /// attached ones run the stream-reset procedure.
    pub fn destroy_data_channel(&self, stream_id: u16) -> bool {
        let (pending, attached) = {
            let mut inner = lock(&self.inner);
            let pending = inner
                .pending
                .iter()
                .position(|c| c.id() == stream_id)
                .map(|at| inner.pending.remove(at));
            let attached = if pending.is_none() {
                inner.channels.get(&stream_id).cloned()
            } else {
                None
            };
            (pending, attached)
        };

        match (pending, attached) {
            (Some(channel), _) => {
                channel.complete_close();
                self.channels_closed.fetch_add(1, Ordering::Relaxed);
                true
            }
            (None, Some(channel)) => {
                channel.reset();
                true
            }
            (None, None) => {
                warn!(
                    "assoc {}: destroy of unknown channel {}",
                    self.association_id, stream_id
                );
                false
            }
        }
    }

    /// Wires a channel to the SCTP elements. The decoder side is linked
    /// when its per-stream pad appears.
    fn attach_channel(&self, channel: &Arc<WebRtcDataChannelBin>) {
        let sink = self.encoder.request_sink_pad(channel.id());
        channel.net_src_pad().link(&sink);
        self.install_handlers(channel);
    }

    fn install_handlers(&self, channel: &Arc<WebRtcDataChannelBin>) {
        let opened = Arc::clone(&self.channels_opened);
        let handlers = Arc::clone(&self.opened_handlers);
        channel.set_negotiated_handler(Arc::new(move |stream_id| {
            opened.fetch_add(1, Ordering::Relaxed);
            let snapshot = lock(&handlers).clone();
            for handler in snapshot {
                handler(stream_id);
            }
        }));

        let decoder = Arc::clone(&self.decoder);
        channel.set_reset_handler(Arc::new(move |stream_id| {
            let decoder = decoder.clone();
            // The reset request can originate inside a chain call; it
            // completes on its own thread to keep pad callbacks
            // lock-free from the channel's point of view.
            let builder = thread::Builder::new().name("sctp-stream-reset".to_owned());
            let spawned = builder.spawn(move || {
                decoder.reset_stream(stream_id);
            });
            if let Err(e) = spawned {
                warn!("spawning stream-reset worker: {e}");
            }
        }));
    }

    fn handle_pad_added(&self, stream_id: u16, src_pad: crate::pipeline::SrcPad) {
        enum Outcome {
            LinkedLocal,
            Remote(Arc<WebRtcDataChannelBin>),
            Rejected,
        }

        let outcome = {
            let mut inner = lock(&self.inner);
            if let Some(channel) = inner.channels.get(&stream_id) {
                src_pad.link(channel.session_sink_pad());
                Outcome::LinkedLocal
            } else if self.is_valid_remote_open_id(stream_id) {
                let channel = WebRtcDataChannelBin::new_remote(stream_id);
                let sink = self.encoder.request_sink_pad(stream_id);
                channel.net_src_pad().link(&sink);
                src_pad.link(channel.session_sink_pad());
                self.install_handlers(&channel);
                inner.channels.insert(stream_id, Arc::clone(&channel));
                Outcome::Remote(channel)
            } else {
                Outcome::Rejected
            }
        };

        match outcome {
            Outcome::LinkedLocal => {
                debug!("assoc {}: stream {} linked", self.association_id, stream_id)
            }
            Outcome::Remote(_) => debug!(
                "assoc {}: remote stream {} accepted",
                self.association_id, stream_id
            ),
            Outcome::Rejected => warn!(
                "assoc {}: peer opened stream {} outside its id space",
                self.association_id, stream_id
            ),
        }
    }

    fn handle_pad_removed(&self, stream_id: u16) {
        let (channel, handlers) = {
            let mut inner = lock(&self.inner);
            let channel = inner.channels.remove(&stream_id);
            if let Some(at) = inner.pending.iter().position(|c| c.id() == stream_id) {
                inner.pending.remove(at);
            }
            (channel, inner.closed_handlers.clone())
        };

        let Some(channel) = channel else {
            // A reset for a stream this side never tracked; harmless.
            warn!(
                "assoc {}: pad removed for untracked stream {}",
                self.association_id, stream_id
            );
            return;
        };

        self.encoder.release_request_pad(stream_id);
        channel.complete_close();
        self.channels_closed.fetch_add(1, Ordering::Relaxed);
        for handler in handlers {
            handler(stream_id);
        }
    }

    /// SCTP association state transition. On establishment every queued
    /// channel is attached and opened, in creation order.
    pub fn handle_association_established(&self, established: bool) {
        let (to_open, handlers) = {
            let mut inner = lock(&self.inner);
            if inner.session_established == established {
                warn!(
                    "assoc {}: association already {}",
                    self.association_id,
                    if established { "established" } else { "down" }
                );
                return;
            }
            inner.session_established = established;

            let mut to_open = Vec::new();
            if established {
                let pending = std::mem::take(&mut inner.pending);
                for channel in pending {
                    self.attach_channel(&channel);
                    inner.channels.insert(channel.id(), Arc::clone(&channel));
                    to_open.push(channel);
                }
            }
            (to_open, inner.established_handlers.clone())
        };

        for channel in &to_open {
            channel.request_open();
        }
        for handler in handlers {
            handler(established);
        }
    }

    pub fn stats(&self) -> DataSessionStats {
        let inner = lock(&self.inner);
        let mut channels: Vec<DataChannelStats> =
            inner.channels.values().map(|c| c.stats()).collect();
        channels.extend(inner.pending.iter().map(|c| c.stats()));
        channels.sort_by_key(|s| s.stream_id);
        DataSessionStats {
            association_id: self.association_id,
            session_established: inner.session_established,
            channels_opened: self.channels_opened.load(Ordering::Relaxed),
            channels_closed: self.channels_closed.load(Ordering::Relaxed),
            channels,
        }
    }
}

fn is_even(stream_id: u16) -> bool {
    stream_id % 2 == 0
}

#[cfg(test)]
mod parity_test {
    use super::*;

    #[test]
    fn test_local_and_remote_id_spaces_are_complementary() {
        let client = WebRtcDataSessionBin::new(true);
        let server = WebRtcDataSessionBin::new(false);

        for id in [0u16, 1, 2, 3, 1024, 65533, 65534] {
            assert_eq!(client.is_valid_local_open_id(id), is_even(id));
            assert_eq!(client.is_valid_remote_open_id(id), !is_even(id));
            assert_eq!(server.is_valid_local_open_id(id), !is_even(id));
            assert_eq!(server.is_valid_remote_open_id(id), is_even(id));
        }

        assert!(!client.is_valid_local_open_id(RESERVED_STREAM_ID));
        assert!(!client.is_valid_remote_open_id(RESERVED_STREAM_ID));
        assert!(!server.is_valid_local_open_id(RESERVED_STREAM_ID));
        assert!(!server.is_valid_remote_open_id(RESERVED_STREAM_ID));
    }
}
