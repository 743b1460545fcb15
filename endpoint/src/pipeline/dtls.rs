use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use rcgen::{CertificateParams, KeyPair};
use sha2::{Digest, Sha256};

use shared::error::{Error, Result};

use super::{lock, SinkPad, SrcPad};

static NEXT_ENC_ID: AtomicU32 = AtomicU32::new(0);
static NEXT_DEC_ID: AtomicU32 = AtomicU32::new(0);

/// Self-signed DTLS certificate material.
pub struct Certificate {
    pem: String,
    /// Empty when the PEM was supplied externally.
    der: Vec<u8>,
}

impl Certificate {
    /// Generates a fresh ECDSA P-256 self-signed certificate.
    pub fn generate() -> Result<Self> {
        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| Error::Other(format!("key generation failed: {e}")))?;
        let params = CertificateParams::new(vec![random_subject_name(16)])
            .map_err(|e| Error::Other(format!("certificate params: {e}")))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::Other(format!("certificate signing failed: {e}")))?;

        Ok(Certificate {
            pem: format!("{}{}", cert.pem(), key_pair.serialize_pem()),
            der: cert.der().to_vec(),
        })
    }

    pub fn from_pem(pem: &str) -> Self {
        Certificate {
            pem: pem.to_owned(),
            der: Vec::new(),
        }
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }

    /// Lowercase colon-separated SHA-256 over the certificate DER, the
    /// value part of an `a=fingerprint:sha-256` attribute. `None` for
    /// externally supplied PEMs whose DER is not retained.
    pub fn fingerprint(&self) -> Option<String> {
        if self.der.is_empty() {
            return None;
        }
        let mut h = Sha256::new();
        h.update(&self.der);
        let hashed = h.finalize();
        let values: Vec<String> = hashed.iter().map(|x| format!("{x:02x}")).collect();
        Some(values.join(":"))
    }
}

fn random_subject_name(n: usize) -> String {
    use rand::Rng;
    const RUNES: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let mut rng = rand::rng();
    (0..n)
        .map(|_| RUNES[rng.random_range(0..RUNES.len())] as char)
        .collect()
}

/// Encrypting half of the DTLS-SRTP element pair. The actual handshake is
/// driven by the DTLS stack behind it; this element carries the pads, the
/// client/server role and the key-material-established notification the
/// control plane reacts to.
pub struct DtlsSrtpEncoder {
    name: String,
    is_client: AtomicBool,
    connection_id: Mutex<String>,
    rtp_sink: SinkPad,
    rtcp_sink: SinkPad,
    data_sink: SinkPad,
    src: SrcPad,
    key_set: AtomicBool,
    key_set_handlers: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
    started: AtomicBool,
}

impl DtlsSrtpEncoder {
    pub fn new() -> Self {
        let name = format!("dtlssrtpenc{}", NEXT_ENC_ID.fetch_add(1, Ordering::Relaxed));
        let src = SrcPad::new(format!("{name}:src"));

        let rtp_sink = forwarding_sink(&name, "rtp_sink", &src);
        let rtcp_sink = forwarding_sink(&name, "rtcp_sink", &src);
        let data_sink = forwarding_sink(&name, "data_sink", &src);

        DtlsSrtpEncoder {
            name,
            is_client: AtomicBool::new(false),
            connection_id: Mutex::new(String::new()),
            rtp_sink,
            rtcp_sink,
            data_sink,
            src,
            key_set: AtomicBool::new(false),
            key_set_handlers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_is_client(&self, is_client: bool) {
        self.is_client.store(is_client, Ordering::Release);
    }

    pub fn is_client(&self) -> bool {
        self.is_client.load(Ordering::Acquire)
    }

    pub fn set_connection_id(&self, id: &str) {
        *lock(&self.connection_id) = id.to_owned();
    }

    pub fn connection_id(&self) -> String {
        lock(&self.connection_id).clone()
    }

    pub fn rtp_sink_pad(&self) -> &SinkPad {
        &self.rtp_sink
    }

    pub fn rtcp_sink_pad(&self) -> &SinkPad {
        &self.rtcp_sink
    }

    pub fn data_sink_pad(&self) -> &SinkPad {
        &self.data_sink
    }

    pub fn src_pad(&self) -> &SrcPad {
        &self.src
    }

    pub fn connect_key_set(&self, handler: Box<dyn Fn() + Send + Sync>) {
        if self.key_set.load(Ordering::Acquire) {
            handler();
            return;
        }
        lock(&self.key_set_handlers).push(handler);
    }

    /// Invoked by the DTLS stack once SRTP key material is derived.
    /// Handlers run exactly once, outside the handler-list lock.
    pub fn notify_key_set(&self) {
        if self.key_set.swap(true, Ordering::AcqRel) {
            return;
        }
        let handlers = std::mem::take(&mut *lock(&self.key_set_handlers));
        for handler in handlers {
            handler();
        }
    }

    pub fn is_key_set(&self) -> bool {
        self.key_set.load(Ordering::Acquire)
    }

    pub fn sync_state(&self) {
        self.started.store(true, Ordering::Release);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

impl Default for DtlsSrtpEncoder {
    fn default() -> Self {
        DtlsSrtpEncoder::new()
    }
}

fn forwarding_sink(element: &str, pad: &str, src: &SrcPad) -> SinkPad {
    let src = src.clone();
    SinkPad::with_chain(
        format!("{element}:{pad}"),
        Box::new(move |buffer| src.push(buffer)),
    )
}

/// Decrypting half of the DTLS-SRTP element pair; owns the certificate.
pub struct DtlsSrtpDecoder {
    name: String,
    is_client: AtomicBool,
    connection_id: Mutex<String>,
    certificate: Mutex<Certificate>,
    sink: SinkPad,
    src: SrcPad,
    started: AtomicBool,
}

impl DtlsSrtpDecoder {
    /// Creates the decoder, generating a self-signed certificate when no
    /// PEM is supplied.
    pub fn new(pem: Option<&str>) -> Result<Self> {
        let name = format!("dtlssrtpdec{}", NEXT_DEC_ID.fetch_add(1, Ordering::Relaxed));
        let certificate = match pem {
            Some(pem) => Certificate::from_pem(pem),
            None => Certificate::generate()?,
        };

        let src = SrcPad::new(format!("{name}:src"));
        let sink = {
            let src = src.clone();
            SinkPad::with_chain(format!("{name}:sink"), Box::new(move |buffer| src.push(buffer)))
        };

        Ok(DtlsSrtpDecoder {
            name,
            is_client: AtomicBool::new(false),
            connection_id: Mutex::new(String::new()),
            certificate: Mutex::new(certificate),
            sink,
            src,
            started: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_is_client(&self, is_client: bool) {
        self.is_client.store(is_client, Ordering::Release);
    }

    pub fn is_client(&self) -> bool {
        self.is_client.load(Ordering::Acquire)
    }

    pub fn set_connection_id(&self, id: &str) {
        *lock(&self.connection_id) = id.to_owned();
    }

    pub fn connection_id(&self) -> String {
        lock(&self.connection_id).clone()
    }

    pub fn certificate_pem(&self) -> String {
        lock(&self.certificate).pem().to_owned()
    }

    pub fn certificate_fingerprint(&self) -> Option<String> {
        lock(&self.certificate).fingerprint()
    }

    pub fn set_certificate_pem(&self, pem: &str) {
        *lock(&self.certificate) = Certificate::from_pem(pem);
    }

    /// Wire-side input fed by the ICE src element.
    pub fn sink_pad(&self) -> &SinkPad {
        &self.sink
    }

    /// Clear-side output toward the consuming element.
    pub fn src_pad(&self) -> &SrcPad {
        &self.src
    }

    pub fn sync_state(&self) {
        self.started.store(true, Ordering::Release);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}
