//! Pinned-certificate TLS for the HTTPS control plane.
//!
//! Hosts present a self-signed certificate that we capture during pairing and
//! require byte-for-byte on every later connection. There is deliberately no
//! CA fallback: unpaired traffic stays on plain HTTP, paired traffic must
//! match the pin.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, Error as TlsError, SignatureScheme};

use crate::errors::HttpError;
use crate::identity::ClientIdentity;

/// Server certificate verifier that accepts exactly the pinned certificate.
///
/// The `mismatch` flag records whether the last rejected handshake failed
/// because a pin existed and the host presented something else — the signal
/// `HostClient::server_info` uses to drop back to HTTP for re-pairing.
#[derive(Debug)]
pub struct PinnedCertVerifier {
    pinned: RwLock<Option<Vec<u8>>>,
    mismatch: AtomicBool,
}

impl PinnedCertVerifier {
    pub fn new(pinned: Option<Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            pinned: RwLock::new(pinned),
            mismatch: AtomicBool::new(false),
        })
    }

    pub fn set_pinned(&self, cert_der: Option<Vec<u8>>) {
        *self.pinned.write().expect("pinned cert lock") = cert_der;
    }

    pub fn pinned(&self) -> Option<Vec<u8>> {
        self.pinned.read().expect("pinned cert lock").clone()
    }

    pub fn clear_mismatch(&self) {
        self.mismatch.store(false, Ordering::SeqCst);
    }

    pub fn saw_mismatch(&self) -> bool {
        self.mismatch.load(Ordering::SeqCst)
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        match self.pinned.read().expect("pinned cert lock").as_deref() {
            Some(pinned) if pinned == end_entity.as_ref() => Ok(ServerCertVerified::assertion()),
            Some(_) => {
                self.mismatch.store(true, Ordering::SeqCst);
                Err(TlsError::InvalidCertificate(
                    CertificateError::ApplicationVerificationFailure,
                ))
            }
            None => Err(TlsError::InvalidCertificate(CertificateError::UnknownIssuer)),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Build the client TLS configuration: pinned verification plus our client
/// certificate, which paired hosts require on every HTTPS request.
pub fn build_tls_config(
    identity: &ClientIdentity,
    verifier: Arc<PinnedCertVerifier>,
) -> Result<rustls::ClientConfig, HttpError> {
    // Install ring crypto provider (ignored if already installed)
    let _ = rustls::crypto::ring::default_provider().install_default();

    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(vec![identity.rustls_cert()], identity.rustls_key()?)
        .map_err(|e| HttpError::identity(format!("TLS client setup failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::ServerName;

    fn verify(
        verifier: &PinnedCertVerifier,
        presented: &[u8],
    ) -> Result<ServerCertVerified, TlsError> {
        verifier.verify_server_cert(
            &CertificateDer::from(presented.to_vec()),
            &[],
            &ServerName::try_from("192.0.2.1").unwrap(),
            &[],
            UnixTime::now(),
        )
    }

    #[test]
    fn accepts_only_the_pinned_certificate() {
        let verifier = PinnedCertVerifier::new(Some(vec![1, 2, 3]));

        assert!(verify(&verifier, &[1, 2, 3]).is_ok());
        assert!(!verifier.saw_mismatch());

        assert!(verify(&verifier, &[9, 9, 9]).is_err());
        assert!(verifier.saw_mismatch());

        verifier.clear_mismatch();
        assert!(!verifier.saw_mismatch());
    }

    #[test]
    fn without_a_pin_everything_is_rejected() {
        let verifier = PinnedCertVerifier::new(None);
        assert!(verify(&verifier, &[1, 2, 3]).is_err());
        // Rejection without a pin is not a mismatch; callers must not treat
        // it as a re-pairing signal.
        assert!(!verifier.saw_mismatch());
    }
}
