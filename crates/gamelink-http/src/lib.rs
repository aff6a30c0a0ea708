//! Control-plane HTTP(S) client for GameLink.
//!
//! A streaming host exposes its control API as XML over two fixed ports:
//! plain HTTP on 47989 for unauthenticated queries and pairing, HTTPS on
//! 47984 (self-signed, certificate-pinned) once mutual trust exists. This
//! crate owns that whole surface:
//!
//! - [`HostClient`] — serverinfo / applist / launch / resume / cancel /
//!   unpair RPCs with the HTTPS-first, HTTP-fallback policy
//! - [`PairingClient`] — the PIN-based challenge-response pairing protocol
//! - [`ClientIdentity`] — the client's long-lived RSA keypair + certificate
//! - pinned-certificate TLS plumbing shared by both

pub mod client;
pub mod errors;
pub mod identity;
pub mod pairing;
pub mod tls;
pub mod xml;

pub use client::{
    current_game, server_major_version, server_version_quad, HostClient, LaunchedSession,
    CONNECTION_TIMEOUT, READ_TIMEOUT, UNIQUE_ID,
};
pub use errors::HttpError;
pub use identity::ClientIdentity;
pub use pairing::{generate_pin, PairingClient, PairingEndpoint, PairingError};
