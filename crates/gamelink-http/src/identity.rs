//! Long-lived client identity: an RSA-2048 keypair and a self-signed
//! certificate, generated once and persisted beside the computer store.
//!
//! The certificate doubles as the TLS client certificate for the HTTPS
//! control plane and as the identity exchanged during pairing, so hosts keep
//! recognising this client across reinstalls of everything except the data
//! directory.

use std::path::Path;

use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, LineEnding};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::sha2::Sha256;
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::info;
use x509_cert::der::{Decode, Encode};
use x509_cert::Certificate;

use crate::errors::HttpError;

const KEY_FILE_NAME: &str = "client.key";
const CERT_FILE_NAME: &str = "client.crt";
const RSA_KEY_BITS: usize = 2048;

/// The client's RSA keypair plus its self-signed X.509 certificate.
pub struct ClientIdentity {
    private_key: RsaPrivateKey,
    cert_der: Vec<u8>,
    cert_pem: String,
}

impl ClientIdentity {
    /// Generate a fresh identity. RSA-2048 keeps pairing signatures at the
    /// 256-byte length hosts require.
    pub fn generate() -> Result<Self, HttpError> {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
            .map_err(|e| HttpError::identity(format!("RSA key generation failed: {e}")))?;

        let pkcs8 = private_key
            .to_pkcs8_der()
            .map_err(|e| HttpError::identity(format!("PKCS#8 encoding failed: {e}")))?;
        let key_pair = rcgen::KeyPair::from_pkcs8_der_and_sign_algo(
            &PrivatePkcs8KeyDer::from(pkcs8.as_bytes()),
            &rcgen::PKCS_RSA_SHA256,
        )
        .map_err(|e| HttpError::identity(format!("certificate key import failed: {e}")))?;

        let mut params = rcgen::CertificateParams::default();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "GameLink");
        // Hosts pin this cert for the life of the pairing; give it a long
        // validity so trust does not silently expire underneath them.
        params.not_before = rcgen::date_time_ymd(2024, 1, 1);
        params.not_after = rcgen::date_time_ymd(2044, 1, 1);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| HttpError::identity(format!("self-signing failed: {e}")))?;

        Ok(Self {
            cert_der: cert.der().to_vec(),
            cert_pem: cert.pem(),
            private_key,
        })
    }

    /// Load the identity from `dir`, generating and persisting a new one if
    /// no (complete) identity exists yet.
    pub fn load_or_generate(dir: &Path) -> Result<Self, HttpError> {
        let key_path = dir.join(KEY_FILE_NAME);
        let cert_path = dir.join(CERT_FILE_NAME);

        if key_path.exists() && cert_path.exists() {
            let key_pem = std::fs::read_to_string(&key_path)?;
            let cert_pem = std::fs::read_to_string(&cert_path)?;

            let private_key = RsaPrivateKey::from_pkcs8_pem(&key_pem)
                .map_err(|e| HttpError::identity(format!("stored key unreadable: {e}")))?;
            let cert_der = pem_to_der(cert_pem.as_bytes())?;

            return Ok(Self {
                private_key,
                cert_der,
                cert_pem,
            });
        }

        info!("No stored client identity; generating a new keypair");
        let identity = Self::generate()?;

        std::fs::create_dir_all(dir)?;
        let key_pem = identity
            .private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| HttpError::identity(format!("PKCS#8 PEM encoding failed: {e}")))?;
        std::fs::write(&key_path, key_pem.as_bytes())?;
        std::fs::write(&cert_path, identity.cert_pem.as_bytes())?;

        Ok(identity)
    }

    /// PEM text of the client certificate (hex-encoded onto the wire during
    /// pairing).
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    /// The raw signature bytes of our own certificate, one of the pairing
    /// hash inputs.
    pub fn cert_signature(&self) -> Result<Vec<u8>, HttpError> {
        cert_signature_bytes(&self.cert_der)
    }

    /// Sign `data` with the client key (PKCS#1 v1.5, SHA-256).
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, HttpError> {
        let signing_key = SigningKey::<Sha256>::new(self.private_key.clone());
        let signature = signing_key
            .try_sign(data)
            .map_err(|e| HttpError::identity(format!("signing failed: {e}")))?;
        Ok(signature.to_vec())
    }

    pub(crate) fn rustls_cert(&self) -> CertificateDer<'static> {
        CertificateDer::from(self.cert_der.clone())
    }

    pub(crate) fn rustls_key(&self) -> Result<PrivateKeyDer<'static>, HttpError> {
        let pkcs8 = self
            .private_key
            .to_pkcs8_der()
            .map_err(|e| HttpError::identity(format!("PKCS#8 encoding failed: {e}")))?;
        Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            pkcs8.as_bytes().to_vec(),
        )))
    }
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("cert_der_len", &self.cert_der.len())
            .finish_non_exhaustive()
    }
}

/// Decode the first certificate in a PEM blob to DER.
pub fn pem_to_der(pem: &[u8]) -> Result<Vec<u8>, HttpError> {
    let mut reader = std::io::BufReader::new(pem);
    let result = rustls_pemfile::certs(&mut reader)
        .next()
        .ok_or_else(|| HttpError::identity("no certificate in PEM data"))?
        .map(|der| der.to_vec())
        .map_err(HttpError::from);
    result
}

/// Raw signature bytes of a DER-encoded certificate.
pub fn cert_signature_bytes(cert_der: &[u8]) -> Result<Vec<u8>, HttpError> {
    let cert = Certificate::from_der(cert_der)
        .map_err(|e| HttpError::identity(format!("certificate parse failed: {e}")))?;
    cert.signature
        .as_bytes()
        .map(|b| b.to_vec())
        .ok_or_else(|| HttpError::identity("certificate signature is not byte-aligned"))
}

/// Verify a PKCS#1 v1.5 SHA-256 signature against the public key of a
/// DER-encoded certificate.
pub fn verify_cert_signature(cert_der: &[u8], data: &[u8], signature: &[u8]) -> bool {
    let Ok(cert) = Certificate::from_der(cert_der) else {
        return false;
    };
    let Ok(spki_der) = cert.tbs_certificate.subject_public_key_info.to_der() else {
        return false;
    };
    let Ok(public_key) = RsaPublicKey::from_public_key_der(&spki_der) else {
        return false;
    };
    let Ok(signature) = Signature::try_from(signature) else {
        return false;
    };
    VerifyingKey::<Sha256>::new(public_key)
        .verify(data, &signature)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_identity_signs_and_verifies() {
        let identity = ClientIdentity::generate().expect("identity generation");

        let signature = identity.sign(b"challenge bytes").expect("sign");
        assert_eq!(signature.len(), 256);
        assert!(verify_cert_signature(
            identity.cert_der(),
            b"challenge bytes",
            &signature
        ));
        assert!(!verify_cert_signature(
            identity.cert_der(),
            b"different bytes",
            &signature
        ));
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");

        let first = ClientIdentity::load_or_generate(dir.path()).expect("generate");
        let second = ClientIdentity::load_or_generate(dir.path()).expect("reload");

        assert_eq!(first.cert_der(), second.cert_der());
        assert_eq!(first.cert_pem(), second.cert_pem());
    }

    #[test]
    fn pem_round_trip_matches_der() {
        let identity = ClientIdentity::generate().expect("identity generation");
        let der = pem_to_der(identity.cert_pem().as_bytes()).expect("pem decode");
        assert_eq!(der, identity.cert_der());
    }
}
