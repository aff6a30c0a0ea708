//! PIN-based challenge-response pairing.
//!
//! Pairing turns a PIN the user reads off the host screen plus our long-lived
//! RSA identity into mutual trust: we capture the host's certificate, the
//! host captures ours, and both sides prove they derived the same AES key
//! from the same PIN. The exchange runs over plain HTTP — every secret that
//! crosses the wire is either AES-encrypted under the PIN-derived key or an
//! RSA signature — and finishes with one HTTPS request that exercises the
//! freshly pinned certificates.
//!
//! Wrong-PIN detection is implicit: the shared-secret hashes only line up if
//! both sides used the same key, so a mismatch at the verification step means
//! `PinWrong`, while a bad signature on the host's pairing secret means the
//! channel itself is suspect (`Failed`).

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use async_trait::async_trait;
use rand::Rng;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, info, warn};

use gamelink_core::PairState;

use crate::client::server_major_version;
use crate::errors::HttpError;
use crate::identity::{self, ClientIdentity};
use crate::xml;

const AES_BLOCK_SIZE: usize = 16;
/// PKCS#1 v1.5 signature length for the RSA-2048 keys both sides use.
const RSA_SIGNATURE_LEN: usize = 256;

#[derive(Error, Debug)]
pub enum PairingError {
    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("malformed pairing response: {reason}")]
    Malformed { reason: String },
}

impl PairingError {
    fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}

// ── Endpoint seam ─────────────────────────────────────────────────────────────

/// The transport the pairing protocol runs over.
///
/// [`HostClient`](crate::HostClient) is the production implementation; tests
/// drive the protocol against an in-process mock host.
#[async_trait]
pub trait PairingEndpoint: Send + Sync {
    /// Issue one `/pair` request with the given query arguments. The first
    /// request of an attempt must run without a read timeout: the host
    /// doesn't answer until the user has typed the PIN.
    async fn pairing_request(
        &self,
        args: &str,
        enable_read_timeout: bool,
    ) -> Result<String, HttpError>;

    /// The final no-op pairing challenge over the authenticated channel.
    async fn pairing_challenge(&self) -> Result<String, HttpError>;

    /// Roll back any half-established pairing state on the host.
    async fn unpair(&self) -> Result<(), HttpError>;

    /// Make `cert_der` the candidate pinned certificate for subsequent TLS.
    fn pin_candidate_cert(&self, cert_der: &[u8]);
}

// ── Hash + key derivation ─────────────────────────────────────────────────────

/// Pairing hash algorithm, selected by server generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingHash {
    Sha1,
    Sha256,
}

impl PairingHash {
    /// Generation 7 hosts moved from SHA-1 to SHA-256.
    pub fn for_server_generation(major_version: i32) -> Self {
        if major_version >= 7 {
            Self::Sha256
        } else {
            Self::Sha1
        }
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha1 => Sha1::digest(data).to_vec(),
            Self::Sha256 => Sha256::digest(data).to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
        }
    }
}

/// AES-128 key derived from the salted PIN: `truncate16(hash(salt ‖ pin))`.
pub fn derive_aes_key(hash: PairingHash, salt: &[u8; 16], pin: &str) -> [u8; 16] {
    let mut salted = Vec::with_capacity(salt.len() + pin.len());
    salted.extend_from_slice(salt);
    salted.extend_from_slice(pin.as_bytes());

    let digest = hash.digest(&salted);
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    key
}

// The pairing payloads are fixed-size 16-byte secrets, so AES runs as plain
// block operations: round the buffer up to the block size with zero fill and
// transform each block independently.
fn round_to_blocks(data: &[u8]) -> Vec<u8> {
    let rounded = (data.len() + AES_BLOCK_SIZE - 1) & !(AES_BLOCK_SIZE - 1);
    let mut buf = data.to_vec();
    buf.resize(rounded, 0);
    buf
}

pub fn encrypt_aes(key: &[u8; 16], data: &[u8]) -> Vec<u8> {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut buf = round_to_blocks(data);
    for block in buf.chunks_mut(AES_BLOCK_SIZE) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
    buf
}

pub fn decrypt_aes(key: &[u8; 16], data: &[u8]) -> Vec<u8> {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut buf = round_to_blocks(data);
    for block in buf.chunks_mut(AES_BLOCK_SIZE) {
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }
    buf
}

/// Four random digits, the PIN format hosts display.
pub fn generate_pin() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "{}{}{}{}",
        rng.gen_range(0..10),
        rng.gen_range(0..10),
        rng.gen_range(0..10),
        rng.gen_range(0..10)
    )
}

// ── Protocol ──────────────────────────────────────────────────────────────────

fn decode_hex_field(resp: &str, field: &'static str) -> Result<Vec<u8>, PairingError> {
    let text = xml::require_xml_string(resp, field)?;
    hex::decode(&text).map_err(|e| PairingError::malformed(format!("{field}: {e}")))
}

fn is_paired(resp: &str) -> Result<bool, PairingError> {
    Ok(xml::get_xml_string(resp, "paired")?.as_deref() == Some("1"))
}

/// The host sends `plaincert` as hex-encoded PEM; older builds sent DER.
fn extract_plain_cert(resp: &str) -> Result<Option<Vec<u8>>, PairingError> {
    // An absent/empty plaincert while paired=1 means another client is
    // mid-pairing and the host refused to start a second exchange.
    let Some(cert_hex) = xml::get_xml_string(resp, "plaincert")?.filter(|c| !c.is_empty()) else {
        return Ok(None);
    };
    let cert_bytes =
        hex::decode(&cert_hex).map_err(|e| PairingError::malformed(format!("plaincert: {e}")))?;

    if cert_bytes.starts_with(b"-----BEGIN") {
        Ok(Some(identity::pem_to_der(&cert_bytes)?))
    } else {
        Ok(Some(cert_bytes))
    }
}

/// One pairing attempt against one host.
pub struct PairingClient<'a, E: PairingEndpoint + ?Sized> {
    endpoint: &'a E,
    identity: &'a ClientIdentity,
    server_cert: Option<Vec<u8>>,
}

impl<'a, E: PairingEndpoint + ?Sized> PairingClient<'a, E> {
    pub fn new(endpoint: &'a E, identity: &'a ClientIdentity) -> Self {
        Self {
            endpoint,
            identity,
            server_cert: None,
        }
    }

    /// The host certificate captured by a successful attempt (DER).
    pub fn paired_cert(&self) -> Option<&[u8]> {
        self.server_cert.as_deref()
    }

    /// Run the protocol. Transport failures propagate as errors; every
    /// protocol-level outcome maps onto a [`PairState`], and every failing
    /// branch asks the host to unpair first so no half-trusted state is left
    /// behind on either side.
    pub async fn pair(&mut self, server_info: &str, pin: &str) -> Result<PairState, PairingError> {
        let server_generation = server_major_version(server_info)?;
        info!("Pairing with server generation {server_generation}");
        let hash = PairingHash::for_server_generation(server_generation);

        let mut rng = rand::thread_rng();
        let salt: [u8; 16] = rng.gen();
        let aes_key = derive_aes_key(hash, &salt, pin);

        // Send the salt and fetch the host cert. No read timeout here: the
        // host blocks until the user has entered the PIN on its side.
        let get_cert = self
            .endpoint
            .pairing_request(
                &format!(
                    "phrase=getservercert&salt={}&clientcert={}",
                    hex::encode_upper(salt),
                    hex::encode_upper(self.identity.cert_pem().as_bytes()),
                ),
                false,
            )
            .await?;
        if !is_paired(&get_cert)? {
            self.endpoint.unpair().await?;
            return Ok(PairState::Failed);
        }

        let Some(server_cert) = extract_plain_cert(&get_cert)? else {
            warn!("Host returned no certificate; another pairing is in progress");
            self.endpoint.unpair().await?;
            return Ok(PairState::AlreadyInProgress);
        };
        // Require this certificate for TLS to this host from here on.
        self.server_cert = Some(server_cert.clone());
        self.endpoint.pin_candidate_cert(&server_cert);

        // Our encrypted challenge; the host proves key knowledge by folding
        // it into the response below.
        let challenge: [u8; 16] = rng.gen();
        let challenge_resp = self
            .endpoint
            .pairing_request(
                &format!(
                    "clientchallenge={}",
                    hex::encode_upper(encrypt_aes(&aes_key, &challenge)),
                ),
                true,
            )
            .await?;
        if !is_paired(&challenge_resp)? {
            self.endpoint.unpair().await?;
            return Ok(PairState::Failed);
        }

        let dec_response = decrypt_aes(
            &aes_key,
            &decode_hex_field(&challenge_resp, "challengeresponse")?,
        );
        if dec_response.len() < hash.len() + 16 {
            return Err(PairingError::malformed("challengeresponse too short"));
        }
        let server_response = &dec_response[..hash.len()];
        let server_challenge = &dec_response[hash.len()..hash.len() + 16];

        // Answer the host's challenge with a fresh secret folded into a hash
        // alongside our certificate signature.
        let client_secret: [u8; 16] = rng.gen();
        let mut response_input = server_challenge.to_vec();
        response_input.extend_from_slice(&self.identity.cert_signature()?);
        response_input.extend_from_slice(&client_secret);
        let secret_resp = self
            .endpoint
            .pairing_request(
                &format!(
                    "serverchallengeresp={}",
                    hex::encode_upper(encrypt_aes(&aes_key, &hash.digest(&response_input))),
                ),
                true,
            )
            .await?;
        if !is_paired(&secret_resp)? {
            self.endpoint.unpair().await?;
            return Ok(PairState::Failed);
        }

        // The host reveals its secret, signed with its certificate key.
        let pairing_secret = decode_hex_field(&secret_resp, "pairingsecret")?;
        if pairing_secret.len() < 16 + RSA_SIGNATURE_LEN {
            return Err(PairingError::malformed("pairingsecret too short"));
        }
        let server_secret = &pairing_secret[..16];
        let server_signature = &pairing_secret[16..16 + RSA_SIGNATURE_LEN];

        if !identity::verify_cert_signature(&server_cert, server_secret, server_signature) {
            self.endpoint.unpair().await?;
            // An unsigned or mis-signed secret looks like a man in the middle.
            warn!("Pairing secret signature verification failed");
            return Ok(PairState::Failed);
        }

        // Now check the host's answer to *our* challenge. Both hashes only
        // match if both sides derived the AES key from the same PIN.
        let mut expected_input = challenge.to_vec();
        expected_input.extend_from_slice(&identity::cert_signature_bytes(&server_cert)?);
        expected_input.extend_from_slice(server_secret);
        if hash.digest(&expected_input) != server_response {
            self.endpoint.unpair().await?;
            debug!("Server challenge response mismatch");
            return Ok(PairState::PinWrong);
        }

        // Reveal our signed secret so the host can run the same check.
        let mut client_pairing_secret = client_secret.to_vec();
        client_pairing_secret.extend_from_slice(&self.identity.sign(&client_secret)?);
        let client_secret_resp = self
            .endpoint
            .pairing_request(
                &format!(
                    "clientpairingsecret={}",
                    hex::encode_upper(&client_pairing_secret),
                ),
                true,
            )
            .await?;
        if !is_paired(&client_secret_resp)? {
            self.endpoint.unpair().await?;
            return Ok(PairState::Failed);
        }

        // One final challenge over the authenticated channel; the host only
        // reports the pairing as established after seeing it.
        let pair_challenge = self.endpoint.pairing_challenge().await?;
        if !is_paired(&pair_challenge)? {
            self.endpoint.unpair().await?;
            return Ok(PairState::Failed);
        }

        Ok(PairState::Paired)
    }
}
