//! # WebRTC endpoint control plane
//!
//! Media-session orchestration for WebRTC endpoints: ICE candidate
//! gathering and exchange, DTLS-SRTP transport wiring, and SCTP data
//! channels, arranged as an element graph the way a media pipeline
//! lays them out.
//!
//! The entry point is [`session::WebRtcSession`]. A session owns one
//! ICE agent and one [`pipeline::Pipeline`]; each negotiated media
//! line gets a [`connection::WebRtcConnection`] whose shape (plain
//! RTP/RTCP, rtcp-mux, BUNDLE, or DTLS/SCTP) follows the negotiation.
//! Data channels ride an SCTP association multiplexed by
//! [`data_session::WebRtcDataSessionBin`].
//!
//! ## Quick start
//!
//! ```no_run
//! use webrtc_endpoint::session::WebRtcSession;
//! use webrtc_endpoint::sdp::{MediaDescription, SessionDescription};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let session = WebRtcSession::new("caller")?;
//!
//! let mut local = SessionDescription::new();
//! local.medias.push(
//!     MediaDescription::new("application", "UDP/DTLS/SCTP").with_mid("data"),
//! );
//! session.set_local_description(local);
//!
//! session.create_connection("data");
//! session.gather_candidates();
//! session.wait_gathering_done()?;
//!
//! // Exchange descriptions and trickle candidates with the peer,
//! // then start the transports as the offerer.
//! session.start_transport_send(true);
//! # Ok(())
//! # }
//! ```

pub use shared::error::{Error, Result};

pub mod connection;
pub mod data_channel;
pub mod data_session;
pub mod ice;
pub mod pipeline;
pub mod sdp;
pub mod session;
pub mod transport;
