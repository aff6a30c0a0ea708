//! `HostClient` — the XML/HTTP(S) RPC façade over one streaming host.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use tracing::{debug, info};
use uuid::Uuid;

use gamelink_core::{
    AddressTuple, ComputerDetails, PairState, SessionKeyMaterial, State, StreamConfiguration,
    DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT,
};

use crate::errors::HttpError;
use crate::identity::ClientIdentity;
use crate::pairing::{PairingClient, PairingEndpoint, PairingError};
use crate::tls::{build_tls_config, PinnedCertVerifier};
use crate::xml;

pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(3);
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared by every client instance so one client may quit game sessions
/// another client started.
pub const UNIQUE_ID: &str = "0123456789ABCDEF";

/// Device name baked into the pairing query string; hosts expect it verbatim.
const PAIRING_DEVICE_NAME: &str = "roth";

/// Result of a successful launch or resume.
#[derive(Debug, Clone)]
pub struct LaunchedSession {
    pub rtsp_session_url: Option<String>,
}

/// Control-plane client for a single host address.
///
/// Owns two connection-pooled HTTP clients built over the same pinned-cert
/// TLS state: one with a read timeout for routine polling, one without for
/// calls that wait on host-side user interaction (pairing PIN entry, launch).
/// Idle connections are never retained — each request performs a fresh
/// TCP/TLS handshake, which sidesteps stale-session bugs in proxies and
/// firewalls between us and the host.
pub struct HostClient {
    base_url_https: String,
    base_url_http: String,
    verifier: Arc<PinnedCertVerifier>,
    identity: Arc<ClientIdentity>,
    client: reqwest::Client,
    client_with_read_timeout: reqwest::Client,
}

fn format_authority(address: &str, port: u16) -> String {
    if address.contains(':') {
        format!("[{address}]:{port}")
    } else {
        format!("{address}:{port}")
    }
}

impl HostClient {
    /// Build a client for `address` (whose port is the HTTP control port).
    /// `https_port` of 0 selects the default. `server_cert` is the pinned
    /// certificate from a previous pairing, if any.
    pub fn new(
        address: &AddressTuple,
        https_port: u16,
        server_cert: Option<Vec<u8>>,
        identity: Arc<ClientIdentity>,
    ) -> Result<Self, HttpError> {
        let https_port = if https_port != 0 {
            https_port
        } else {
            DEFAULT_HTTPS_PORT
        };
        let http_port = if address.port != 0 {
            address.port
        } else {
            DEFAULT_HTTP_PORT
        };

        let verifier = PinnedCertVerifier::new(server_cert);
        let tls = build_tls_config(&identity, verifier.clone())?;

        let client = reqwest::Client::builder()
            .use_preconfigured_tls(tls.clone())
            .pool_max_idle_per_host(0)
            .connect_timeout(CONNECTION_TIMEOUT)
            .build()?;
        let client_with_read_timeout = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .pool_max_idle_per_host(0)
            .connect_timeout(CONNECTION_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .build()?;

        Ok(Self {
            base_url_https: format!("https://{}", format_authority(&address.address, https_port)),
            base_url_http: format!("http://{}", format_authority(&address.address, http_port)),
            verifier,
            identity,
            client,
            client_with_read_timeout,
        })
    }

    /// The certificate currently pinned for this host, if any.
    pub fn pinned_cert(&self) -> Option<Vec<u8>> {
        self.verifier.pinned()
    }

    fn unique_query() -> String {
        format!("uniqueid={UNIQUE_ID}&uuid={}", Uuid::new_v4())
    }

    // ── Transport ────────────────────────────────────────────────────────────

    // A read timeout is right for any query the host answers on its own.
    // Launch, resume, quit, and the first pairing request can all block on
    // something happening host-side, so those run without one.
    async fn fetch(
        &self,
        url: &str,
        enable_read_timeout: bool,
    ) -> Result<reqwest::Response, HttpError> {
        debug!("Requesting URL: {url}");
        let client = if enable_read_timeout {
            &self.client_with_read_timeout
        } else {
            &self.client
        };

        let response = client.get(url).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else if status == StatusCode::NOT_FOUND {
            Err(HttpError::NotFound {
                url: url.to_owned(),
            })
        } else {
            Err(HttpError::Status {
                code: status.as_u16() as i32,
                message: status.canonical_reason().unwrap_or("").to_owned(),
            })
        }
    }

    async fn fetch_string(
        &self,
        url: &str,
        enable_read_timeout: bool,
    ) -> Result<String, HttpError> {
        let body = self.fetch(url, enable_read_timeout).await?.text().await?;
        debug!("{url} -> {body}");
        Ok(body)
    }

    // ── Server info ──────────────────────────────────────────────────────────

    /// Fetch `/serverinfo`, preferring HTTPS when a certificate is pinned.
    ///
    /// Two situations drop us back to plain HTTP: the host presenting a
    /// different certificate (its identity changed and the user needs to
    /// re-pair), and a 401 envelope (the host no longer considers us
    /// paired). Anything else propagates.
    pub async fn server_info(&self) -> Result<String, HttpError> {
        if self.verifier.pinned().is_none() {
            return self
                .fetch_string(&format!("{}/serverinfo", self.base_url_http), true)
                .await;
        }

        self.verifier.clear_mismatch();
        let https_url = format!(
            "{}/serverinfo?{}",
            self.base_url_https,
            Self::unique_query()
        );
        match self.fetch_string(&https_url, true).await {
            Ok(resp) => {
                // Probing any field forces envelope validation, which is how
                // an unpaired 401 shows itself.
                match xml::get_xml_string(&resp, "appversion") {
                    Ok(_) => Ok(resp),
                    Err(HttpError::Status { code: 401, .. }) => {
                        info!("Host reports unpaired over HTTPS; retrying over HTTP");
                        self.fetch_string(&format!("{}/serverinfo", self.base_url_http), true)
                            .await
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => {
                if self.verifier.saw_mismatch() {
                    info!("Pinned certificate mismatch; retrying over HTTP to allow re-pairing");
                    self.fetch_string(&format!("{}/serverinfo", self.base_url_http), true)
                        .await
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Poll the host and assemble a fresh transient [`ComputerDetails`].
    pub async fn computer_details(&self) -> Result<ComputerDetails, HttpError> {
        let server_info = self.server_info().await?;
        self.computer_details_from(&server_info)
    }

    pub fn computer_details_from(
        &self,
        server_info: &str,
    ) -> Result<ComputerDetails, HttpError> {
        let mut details = ComputerDetails::new();

        details.name = xml::get_xml_string(server_info, "hostname")?
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "UNKNOWN".to_owned());
        details.uuid = xml::get_xml_string(server_info, "uniqueid")?;
        details.mac_address = xml::get_xml_string(server_info, "mac")?;

        details.https_port = xml::get_xml_string(server_info, "HttpsPort")?
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_HTTPS_PORT);
        details.external_port = xml::get_xml_string(server_info, "ExternalPort")?
            .and_then(|p| p.parse().ok())
            .unwrap_or(0);

        details.local_address = xml::get_xml_string(server_info, "LocalIP")?
            .and_then(|ip| AddressTuple::new(ip, DEFAULT_HTTP_PORT).ok());
        // This may be absent, but that's okay
        details.remote_address = xml::get_xml_string(server_info, "ExternalIP")?.and_then(|ip| {
            AddressTuple::new(ip, details.guess_external_port()).ok()
        });

        details.pair_state = Some(self.pair_state_from(server_info)?);
        details.running_game_id = current_game(server_info)?;

        // We could reach it, so it's online
        details.state = State::Online;

        Ok(details)
    }

    /// Pair state as reported by the host — except that without a locally
    /// pinned certificate the host's claim is worthless, so the answer is
    /// forced to `NotPaired`.
    pub fn pair_state_from(&self, server_info: &str) -> Result<PairState, HttpError> {
        if self.verifier.pinned().is_none() {
            return Ok(PairState::NotPaired);
        }
        Ok(
            if xml::get_xml_string(server_info, "PairStatus")?.as_deref() == Some("1") {
                PairState::Paired
            } else {
                PairState::NotPaired
            },
        )
    }

    pub async fn pair_state(&self) -> Result<PairState, HttpError> {
        let server_info = self.server_info().await?;
        self.pair_state_from(&server_info)
    }

    // ── App list ─────────────────────────────────────────────────────────────

    pub async fn app_list_raw(&self) -> Result<String, HttpError> {
        self.fetch_string(
            &format!("{}/applist?{}", self.base_url_https, Self::unique_query()),
            true,
        )
        .await
    }

    pub async fn app_list(&self) -> Result<Vec<gamelink_core::AppEntry>, HttpError> {
        xml::parse_app_list(&self.app_list_raw().await?)
    }

    /// Box art for one app (PNG bytes).
    pub async fn box_art(&self, app_id: i32) -> Result<Bytes, HttpError> {
        let url = format!(
            "{}/appasset?{}&appid={}&AssetType=2&AssetIdx=0",
            self.base_url_https,
            Self::unique_query(),
            app_id
        );
        Ok(self.fetch(&url, true).await?.bytes().await?)
    }

    // ── Session control ──────────────────────────────────────────────────────

    /// Launch `app_id` with the negotiated stream parameters. Returns `None`
    /// when the host refused to start a session.
    pub async fn launch_app(
        &self,
        config: &StreamConfiguration,
        app_id: i32,
        key: &SessionKeyMaterial,
    ) -> Result<Option<LaunchedSession>, HttpError> {
        // A refresh rate above 60 makes the host fall back to its default
        // 720p60 mode; sending 0 instead keeps the requested resolution.
        let fps = if config.refresh_rate > 60 {
            0
        } else {
            config.refresh_rate
        };

        // Non-native resolutions make the host's streaming optimizer force
        // 720p60 as well, so it gets disabled for those.
        let mut enable_sops = config.enable_sops;
        if !config.is_standard_resolution() {
            info!(
                "Disabling streaming optimization for non-standard resolution {}x{}",
                config.width, config.height
            );
            enable_sops = false;
        }

        let hdr_params = if config.enable_hdr {
            "&hdrMode=1&clientHdrCapVersion=0&clientHdrCapSupportedFlagsInUint32=0\
             &clientHdrCapMetaDataId=NV_STATIC_METADATA_TYPE_1\
             &clientHdrCapDisplayData=0x0x0x0x0x0x0x0x0x0x0"
        } else {
            ""
        };
        let gamepad_params = if config.gamepad_mask != 0 {
            format!(
                "&remoteControllersBitmap={}&gcmap={}",
                config.gamepad_mask, config.gamepad_mask
            )
        } else {
            String::new()
        };

        let url = format!(
            "{}/launch?{}&appid={}&mode={}x{}x{}&additionalStates=1&sops={}&rikey={}&rikeyid={}{}&localAudioPlayMode={}&surroundAudioInfo={}{}",
            self.base_url_https,
            Self::unique_query(),
            app_id,
            config.width,
            config.height,
            fps,
            enable_sops as u8,
            hex::encode_upper(key.ri_key),
            key.ri_key_id,
            hdr_params,
            config.play_local_audio as u8,
            config.audio.surround_audio_info(),
            gamepad_params,
        );

        let resp = self.fetch_string(&url, false).await?;
        match xml::get_xml_string(&resp, "gamesession")? {
            Some(session) if session != "0" => Ok(Some(LaunchedSession {
                rtsp_session_url: xml::get_xml_string(&resp, "sessionUrl0")?,
            })),
            _ => Ok(None),
        }
    }

    /// Resume the host's existing session with fresh key material.
    pub async fn resume_app(
        &self,
        config: &StreamConfiguration,
        key: &SessionKeyMaterial,
    ) -> Result<Option<LaunchedSession>, HttpError> {
        let url = format!(
            "{}/resume?{}&rikey={}&rikeyid={}&surroundAudioInfo={}",
            self.base_url_https,
            Self::unique_query(),
            hex::encode_upper(key.ri_key),
            key.ri_key_id,
            config.audio.surround_audio_info(),
        );

        let resp = self.fetch_string(&url, false).await?;
        let resume: i32 = xml::require_xml_string(&resp, "resume")?
            .parse()
            .map_err(|_| HttpError::malformed_xml("resume is not an integer"))?;
        if resume != 0 {
            Ok(Some(LaunchedSession {
                rtsp_session_url: xml::get_xml_string(&resp, "sessionUrl0")?,
            }))
        } else {
            Ok(None)
        }
    }

    /// Quit the running session.
    ///
    /// Newer hosts report success even when the session belongs to another
    /// client and nothing was actually quit, so success is verified by
    /// re-polling the current game; a survivor means we were not authorized.
    pub async fn quit_app(&self) -> Result<bool, HttpError> {
        let url = format!("{}/cancel?{}", self.base_url_https, Self::unique_query());
        let resp = self.fetch_string(&url, false).await?;
        let cancel: i32 = xml::require_xml_string(&resp, "cancel")?
            .parse()
            .map_err(|_| HttpError::malformed_xml("cancel is not an integer"))?;
        if cancel == 0 {
            return Ok(false);
        }

        if current_game(&self.server_info().await?)? != 0 {
            return Err(HttpError::QuitNotAuthorized);
        }

        Ok(true)
    }

    pub async fn unpair(&self) -> Result<(), HttpError> {
        self.fetch_string(
            &format!("{}/unpair?{}", self.base_url_http, Self::unique_query()),
            true,
        )
        .await?;
        Ok(())
    }

    // ── Pairing ──────────────────────────────────────────────────────────────

    /// Run the pairing protocol against this host. On `Paired` the returned
    /// server certificate is left pinned for subsequent HTTPS calls; any
    /// other outcome clears the candidate pin again.
    pub async fn pair(&self, server_info: &str, pin: &str) -> Result<PairState, PairingError> {
        let previous_pin = self.verifier.pinned();
        let mut pairing = PairingClient::new(self, &self.identity);
        let state = pairing.pair(server_info, pin).await;

        match &state {
            Ok(PairState::Paired) => {}
            _ => self.verifier.set_pinned(previous_pin),
        }
        state
    }
}

#[async_trait]
impl PairingEndpoint for HostClient {
    async fn pairing_request(
        &self,
        args: &str,
        enable_read_timeout: bool,
    ) -> Result<String, HttpError> {
        let url = format!(
            "{}/pair?{}&devicename={}&updateState=1&{}",
            self.base_url_http,
            Self::unique_query(),
            PAIRING_DEVICE_NAME,
            args
        );
        self.fetch_string(&url, enable_read_timeout).await
    }

    async fn pairing_challenge(&self) -> Result<String, HttpError> {
        // Runs over HTTPS: this is the first request that exercises the
        // freshly pinned certificate and our client certificate together.
        let url = format!(
            "{}/pair?{}&devicename={}&updateState=1&phrasetype=pairchallenge",
            self.base_url_https,
            Self::unique_query(),
            PAIRING_DEVICE_NAME,
        );
        self.fetch_string(&url, true).await
    }

    async fn unpair(&self) -> Result<(), HttpError> {
        HostClient::unpair(self).await
    }

    fn pin_candidate_cert(&self, cert_der: &[u8]) {
        self.verifier.set_pinned(Some(cert_der.to_vec()));
    }
}

// ── Server info field helpers ─────────────────────────────────────────────────

/// The game the host is currently streaming.
///
/// Hosts repurposed `currentgame` to mean "last played" when idle, so the
/// value only counts while the reported state carries the busy marker.
pub fn current_game(server_info: &str) -> Result<i32, HttpError> {
    match xml::get_xml_string(server_info, "state")? {
        Some(state) if state.ends_with("_SERVER_BUSY") => {
            xml::require_xml_string(server_info, "currentgame")?
                .parse()
                .map_err(|_| HttpError::malformed_xml("currentgame is not an integer"))
        }
        _ => Ok(0),
    }
}

/// `appversion` split into `[major, minor, patch, build]`.
pub fn server_version_quad(server_info: &str) -> Result<[i32; 4], HttpError> {
    let version = xml::require_xml_string(server_info, "appversion")?;
    let parts: Vec<i32> = version
        .split('.')
        .map(|p| p.parse::<i32>())
        .collect::<Result<_, _>>()
        .map_err(|_| HttpError::MalformedVersion {
            version: version.clone(),
        })?;
    parts.try_into().map_err(|_| HttpError::MalformedVersion {
        version: version.clone(),
    })
}

pub fn server_major_version(server_info: &str) -> Result<i32, HttpError> {
    Ok(server_version_quad(server_info)?[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_game_requires_busy_marker() {
        let busy = r#"<root status_code="200"><state>GS_APP_SERVER_BUSY</state><currentgame>42</currentgame></root>"#;
        assert_eq!(current_game(busy).unwrap(), 42);

        // Idle hosts leave the last-played game in the field; it must read 0.
        let idle = r#"<root status_code="200"><state>GS_APP_FREE</state><currentgame>42</currentgame></root>"#;
        assert_eq!(current_game(idle).unwrap(), 0);

        let stateless = r#"<root status_code="200"><currentgame>42</currentgame></root>"#;
        assert_eq!(current_game(stateless).unwrap(), 0);
    }

    #[test]
    fn server_version_quad_parses_four_parts() {
        let info = r#"<root status_code="200"><appversion>7.1.431.0</appversion></root>"#;
        assert_eq!(server_version_quad(info).unwrap(), [7, 1, 431, 0]);
        assert_eq!(server_major_version(info).unwrap(), 7);

        let bad = r#"<root status_code="200"><appversion>7.1</appversion></root>"#;
        assert!(matches!(
            server_version_quad(bad),
            Err(HttpError::MalformedVersion { .. })
        ));
    }

    #[test]
    fn format_authority_brackets_ipv6() {
        assert_eq!(format_authority("10.0.0.2", 47989), "10.0.0.2:47989");
        assert_eq!(format_authority("fe80::1", 47984), "[fe80::1]:47984");
    }
}
