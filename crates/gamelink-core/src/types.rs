use serde::{Deserialize, Serialize};

use crate::errors::AddressError;

/// Default host control-plane ports.
pub const DEFAULT_HTTP_PORT: u16 = 47989;
pub const DEFAULT_HTTPS_PORT: u16 = 47984;

// MARK: - AddressTuple

/// One reachable address for a streaming host: bare address plus port.
///
/// Bracketed IPv6 literals (`[fe80::1]`) are unwrapped on construction so the
/// stored address is always the bare form; `Display` re-adds the brackets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressTuple {
    pub address: String,
    pub port: u16,
}

impl AddressTuple {
    pub fn new(address: impl Into<String>, port: u16) -> Result<Self, AddressError> {
        let mut address = address.into();
        if address.is_empty() {
            return Err(AddressError::EmptyAddress);
        }
        if port == 0 {
            return Err(AddressError::InvalidPort { port: 0 });
        }

        // If this was an escaped IPv6 address, remove the brackets
        if address.starts_with('[') && address.ends_with(']') {
            address = address[1..address.len() - 1].to_owned();
        }

        Ok(Self { address, port })
    }
}

impl std::fmt::Display for AddressTuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.address.contains(':') {
            // IPv6
            write!(f, "[{}]:{}", self.address, self.port)
        } else {
            // IPv4 and hostnames
            write!(f, "{}:{}", self.address, self.port)
        }
    }
}

// MARK: - PairState

/// Terminal states of one pairing attempt. Only `Paired`/`NotPaired` survive
/// beyond the attempt itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    NotPaired,
    Paired,
    PinWrong,
    Failed,
    AlreadyInProgress,
}

// MARK: - State / Reachability

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    Online,
    Offline,
    #[default]
    Unknown,
}

/// Which address class last answered a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Local,
    Remote,
    Unknown,
}

// MARK: - ComputerDetails

/// Identity and state for one remote streaming host.
///
/// The persistent fields survive in the computer store; the transient fields
/// are refreshed by every poll and start out empty/`Unknown` when a host is
/// loaded from disk.
#[derive(Debug, Clone, Default)]
pub struct ComputerDetails {
    // Persistent attributes
    pub uuid: Option<String>,
    pub name: String,
    pub local_address: Option<AddressTuple>,
    pub remote_address: Option<AddressTuple>,
    pub manual_address: Option<AddressTuple>,
    pub ipv6_address: Option<AddressTuple>,
    pub mac_address: Option<String>,
    /// DER-encoded pinned server certificate; absent until paired.
    pub server_cert: Option<Vec<u8>>,

    // Transient attributes
    pub state: State,
    pub active_address: Option<AddressTuple>,
    pub https_port: u16,
    pub external_port: u16,
    pub pair_state: Option<PairState>,
    pub running_game_id: i32,
    pub raw_app_list: Option<String>,
}

/// MAC placeholder some hosts report before their NIC is enumerated. Carries
/// no information, so it must never replace a real stored MAC.
const ZERO_MAC: &str = "00:00:00:00:00:00";

impl ComputerDetails {
    pub fn new() -> Self {
        Self::default()
    }

    /// Best guess at the port a remote (WAN) client should target.
    pub fn guess_external_port(&self) -> u16 {
        if self.external_port != 0 {
            self.external_port
        } else if let Some(remote) = &self.remote_address {
            remote.port
        } else if let Some(active) = &self.active_address {
            active.port
        } else if let Some(ipv6) = &self.ipv6_address {
            ipv6.port
        } else if let Some(local) = &self.local_address {
            local.port
        } else {
            DEFAULT_HTTP_PORT
        }
    }

    /// Which address class the last successful poll went through.
    pub fn reachability(&self) -> Reachability {
        match &self.active_address {
            Some(active) if Some(active) == self.local_address.as_ref() => Reachability::Local,
            Some(_) => Reachability::Remote,
            None => Reachability::Unknown,
        }
    }

    /// Merge a freshly-polled instance into this (possibly persisted) one.
    ///
    /// This is the single reconciliation path for poll results: new non-empty
    /// values win, but trust material (server cert, MAC) from a previous pair
    /// is retained when the new poll lacks it. A transient poll failure must
    /// never erase established trust.
    pub fn update(&mut self, details: &ComputerDetails) {
        self.state = details.state;
        self.name = details.name.clone();
        if details.uuid.is_some() {
            self.uuid = details.uuid.clone();
        }
        if details.active_address.is_some() {
            self.active_address = details.active_address.clone();
        }
        // IPv4 loopback shows up here when the host is reached through a
        // local IPv6 forwarder; it is not a usable local address.
        if let Some(local) = &details.local_address {
            if !local.address.starts_with("127.") {
                self.local_address = Some(local.clone());
            }
        }
        if details.remote_address.is_some() {
            self.remote_address = details.remote_address.clone();
        } else if let Some(remote) = &mut self.remote_address {
            if details.external_port != 0 {
                // We already learned a remote address (perhaps via STUN) but
                // this poll didn't carry one. The polled external port is
                // still fresher than whatever we guessed before.
                remote.port = details.external_port;
            }
        }
        if details.manual_address.is_some() {
            self.manual_address = details.manual_address.clone();
        }
        if details.ipv6_address.is_some() {
            self.ipv6_address = details.ipv6_address.clone();
        }
        match &details.mac_address {
            Some(mac) if mac != ZERO_MAC => self.mac_address = Some(mac.clone()),
            _ => {}
        }
        if details.server_cert.is_some() {
            self.server_cert = details.server_cert.clone();
        }
        self.external_port = details.external_port;
        self.https_port = details.https_port;
        self.pair_state = details.pair_state;
        self.running_game_id = details.running_game_id;
        if details.raw_app_list.is_some() {
            self.raw_app_list = details.raw_app_list.clone();
        }
    }
}

impl std::fmt::Display for ComputerDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Name: {}", self.name)?;
        writeln!(f, "State: {:?}", self.state)?;
        writeln!(f, "UUID: {:?}", self.uuid)?;
        writeln!(f, "Active Address: {:?}", self.active_address)?;
        writeln!(f, "Local Address: {:?}", self.local_address)?;
        writeln!(f, "Remote Address: {:?}", self.remote_address)?;
        writeln!(f, "Manual Address: {:?}", self.manual_address)?;
        writeln!(f, "IPv6 Address: {:?}", self.ipv6_address)?;
        writeln!(f, "MAC Address: {:?}", self.mac_address)?;
        writeln!(f, "Pair State: {:?}", self.pair_state)?;
        writeln!(f, "Running Game ID: {}", self.running_game_id)?;
        write!(f, "HTTPS Port: {}", self.https_port)
    }
}

// MARK: - AppEntry

/// One launchable application as reported by the host's app list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppEntry {
    pub id: i32,
    pub title: String,
    pub hdr_supported: bool,
}

// MARK: - SessionKeyMaterial

/// Symmetric key and identifier authenticating the binary control/media
/// channels to one launched game session. Threaded through the launch/resume
/// HTTP calls and the control-stream handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeyMaterial {
    pub ri_key: [u8; 16],
    pub ri_key_id: i32,
}

impl SessionKeyMaterial {
    pub fn generate() -> Self {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        let mut ri_key = [0u8; 16];
        rng.fill(&mut ri_key);
        Self {
            ri_key,
            ri_key_id: rng.gen(),
        }
    }
}
