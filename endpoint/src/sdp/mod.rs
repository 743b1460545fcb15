//! Attribute bookkeeping for session descriptions. Parsing and
//! serializing full SDP text is the job of the surrounding SDP library;
//! this facade only tracks the attributes the session control plane
//! reads and writes.

/// True for the transport protocol tokens selecting SCTP over DTLS
/// (`DTLS/SCTP`, `UDP/DTLS/SCTP`, `TCP/DTLS/SCTP`).
pub fn is_sctp_protocol(protocol: &str) -> bool {
    protocol.ends_with("DTLS/SCTP")
}

#[derive(Clone, Debug, Default)]
pub struct MediaDescription {
    pub media_type: String,
    pub mid: Option<String>,
    pub protocol: String,
    pub port: u16,
    pub ufrag: Option<String>,
    pub pwd: Option<String>,
    pub fingerprint: Option<String>,
    pub connection_address: Option<String>,
    pub rtcp_address: Option<(String, u16)>,
    pub rtcp_mux: bool,
    /// `a=candidate` attribute values (without the `a=candidate:` prefix).
    pub candidates: Vec<String>,
    pub sctp_port: Option<u16>,
    pub inactive: bool,
}

impl MediaDescription {
    pub fn new(media_type: &str, protocol: &str) -> Self {
        MediaDescription {
            media_type: media_type.to_owned(),
            protocol: protocol.to_owned(),
            port: 9,
            ..Default::default()
        }
    }

    pub fn with_mid(mut self, mid: &str) -> Self {
        self.mid = Some(mid.to_owned());
        self
    }

    pub fn is_sctp(&self) -> bool {
        is_sctp_protocol(&self.protocol)
    }

    pub fn is_active(&self) -> bool {
        !self.inactive && self.port != 0
    }

    /// Appends a candidate attribute value, skipping exact duplicates.
    pub fn add_candidate(&mut self, value: &str) {
        if !self.candidates.iter().any(|c| c == value) {
            self.candidates.push(value.to_owned());
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SessionDescription {
    /// Message-level credentials, the fallback when a media carries none.
    pub ufrag: Option<String>,
    pub pwd: Option<String>,
    pub bundle_mids: Vec<String>,
    pub medias: Vec<MediaDescription>,
}

impl SessionDescription {
    pub fn new() -> Self {
        SessionDescription::default()
    }

    pub fn media(&self, index: usize) -> Option<&MediaDescription> {
        self.medias.get(index)
    }

    pub fn media_mut(&mut self, index: usize) -> Option<&mut MediaDescription> {
        self.medias.get_mut(index)
    }

    /// Media-level ICE credentials with message-level fallback. `None`
    /// when neither level carries a usable pair.
    pub fn credentials(&self, index: usize) -> Option<(String, String)> {
        let media = self.media(index)?;
        match (&media.ufrag, &media.pwd) {
            (Some(ufrag), Some(pwd)) if !ufrag.is_empty() && !pwd.is_empty() => {
                Some((ufrag.clone(), pwd.clone()))
            }
            _ => match (&self.ufrag, &self.pwd) {
                (Some(ufrag), Some(pwd)) if !ufrag.is_empty() && !pwd.is_empty() => {
                    Some((ufrag.clone(), pwd.clone()))
                }
                _ => None,
            },
        }
    }
}

#[cfg(test)]
mod sdp_test {
    use super::*;

    #[test]
    fn test_sctp_protocol_detection() {
        assert!(is_sctp_protocol("DTLS/SCTP"));
        assert!(is_sctp_protocol("UDP/DTLS/SCTP"));
        assert!(is_sctp_protocol("TCP/DTLS/SCTP"));
        assert!(!is_sctp_protocol("UDP/TLS/RTP/SAVPF"));
    }

    #[test]
    fn test_credentials_fallback() {
        let mut sdp = SessionDescription::new();
        sdp.ufrag = Some("sess-u".to_owned());
        sdp.pwd = Some("sess-p".to_owned());
        sdp.medias.push(MediaDescription::new("audio", "UDP/TLS/RTP/SAVPF"));
        sdp.medias.push(MediaDescription::new("video", "UDP/TLS/RTP/SAVPF"));
        sdp.medias[1].ufrag = Some("med-u".to_owned());
        sdp.medias[1].pwd = Some("med-p".to_owned());

        assert_eq!(
            sdp.credentials(0),
            Some(("sess-u".to_owned(), "sess-p".to_owned()))
        );
        assert_eq!(
            sdp.credentials(1),
            Some(("med-u".to_owned(), "med-p".to_owned()))
        );
        assert_eq!(sdp.credentials(2), None);

        // Empty media-level credentials also fall back.
        sdp.medias[1].ufrag = Some(String::new());
        assert_eq!(
            sdp.credentials(1),
            Some(("sess-u".to_owned(), "sess-p".to_owned()))
        );
    }

    #[test]
    fn test_add_candidate_deduplicates() {
        let mut media = MediaDescription::new("audio", "UDP/TLS/RTP/SAVPF");
        media.add_candidate("1 1 udp 1 10.0.0.1 1000 typ host");
        media.add_candidate("1 1 udp 1 10.0.0.1 1000 typ host");
        assert_eq!(media.candidates.len(), 1);
    }
}
