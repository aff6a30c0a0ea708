//! Importers for the legacy on-disk store formats.
//!
//! Three prior schema generations exist in the wild:
//!
//! 1. `computers.db` — addresses stored as raw IP byte blobs, later as
//!    strings behind a disambiguating prefix; no certificate column.
//! 2. `computers2.db` — one string column per address plus an optional
//!    trailing DER certificate column.
//! 3. delimited rows inside `computers3.db` itself
//!    (`addr_port;addr_port;addr_port;addr_port`), rewritten in place by the
//!    store's open path.
//!
//! Each importer is a pure rows → [`ComputerDetails`] pass, runs once at
//! startup, and removes its source after a successful read so nothing at
//! runtime depends on the old formats again.

use std::net::IpAddr;
use std::path::Path;

use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use gamelink_core::{AddressTuple, ComputerDetails, State, DEFAULT_HTTP_PORT};

use crate::store::StoredAddresses;

const V1_DB_NAME: &str = "computers.db";
const V2_DB_NAME: &str = "computers2.db";

/// Marker that distinguishes stringly-stored addresses from IP blobs in the
/// v1 schema; chosen longer than any possible raw IP blob.
const ADDRESS_PREFIX: &str = "ADDRESS_PREFIX__";

const PORT_DELIMITER: char = '_';
const ADDRESS_DELIMITER: char = ';';

async fn open_readonly(path: &Path) -> Option<SqlitePool> {
    if !path.exists() {
        return None;
    }
    let options = SqliteConnectOptions::new()
        .filename(path)
        .read_only(true);
    match SqlitePool::connect_with(options).await {
        Ok(pool) => Some(pool),
        Err(e) => {
            warn!("Legacy database {path:?} unreadable: {e}");
            None
        }
    }
}

fn remove_db(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        warn!("Failed to delete legacy database {path:?}: {e}");
    }
}

/// A v1 address column holds either a raw 4/16-byte IP blob or a
/// prefix-marked string.
fn decode_v1_address(raw: &[u8], what: &str, name: &str) -> Option<AddressTuple> {
    match raw.len() {
        4 => {
            let octets: [u8; 4] = raw.try_into().ok()?;
            let ip = IpAddr::from(octets);
            AddressTuple::new(ip.to_string(), DEFAULT_HTTP_PORT).ok()
        }
        16 => {
            let octets: [u8; 16] = raw.try_into().ok()?;
            let ip = IpAddr::from(octets);
            AddressTuple::new(ip.to_string(), DEFAULT_HTTP_PORT).ok()
        }
        _ => {
            let text = std::str::from_utf8(raw).ok()?;
            match text.strip_prefix(ADDRESS_PREFIX) {
                Some(address) => AddressTuple::new(address, DEFAULT_HTTP_PORT).ok(),
                None => {
                    warn!("Corrupted legacy {what} address for {name}");
                    None
                }
            }
        }
    }
}

/// Import `computers.db` (blob/prefixed-string addresses, no certificate) and
/// delete it.
pub(crate) async fn import_v1(data_dir: &Path) -> Vec<ComputerDetails> {
    let path = data_dir.join(V1_DB_NAME);
    let Some(pool) = open_readonly(&path).await else {
        if path.exists() {
            remove_db(&path);
        }
        return Vec::new();
    };

    let mut computers = Vec::new();
    match sqlx::query("SELECT * FROM Computers").fetch_all(&pool).await {
        Ok(rows) => {
            for row in rows {
                let name: String = row.try_get(0).unwrap_or_default();
                let Ok(raw_uuid) = row.try_get::<String, _>(1) else {
                    continue;
                };
                if uuid::Uuid::parse_str(&raw_uuid).is_err() {
                    // We'll delete this entry by never importing it.
                    warn!("Corrupted UUID in legacy database for {name}");
                    continue;
                }

                let mut details = ComputerDetails::new();
                details.uuid = Some(raw_uuid);
                details.name = name;
                details.local_address = row
                    .try_get::<Vec<u8>, _>(2)
                    .ok()
                    .and_then(|raw| decode_v1_address(&raw, "local", &details.name));
                details.remote_address = row
                    .try_get::<Vec<u8>, _>(3)
                    .ok()
                    .and_then(|raw| decode_v1_address(&raw, "remote", &details.name));
                // This generation stored manual entries in the remote slot.
                details.manual_address = details.remote_address.clone();
                details.mac_address = row.try_get(4).ok();
                details.state = State::Unknown;

                computers.push(details);
            }
            info!("Imported {} host(s) from legacy v1 database", computers.len());
        }
        Err(e) => warn!("Legacy v1 read failed: {e}"),
    }

    pool.close().await;
    remove_db(&path);
    computers
}

/// Import `computers2.db` (string address columns, optional certificate) and
/// delete it.
pub(crate) async fn import_v2(data_dir: &Path) -> Vec<ComputerDetails> {
    let path = data_dir.join(V2_DB_NAME);
    let Some(pool) = open_readonly(&path).await else {
        if path.exists() {
            remove_db(&path);
        }
        return Vec::new();
    };

    let to_address = |value: Option<String>| {
        value
            .filter(|s| !s.is_empty())
            .and_then(|s| AddressTuple::new(s, DEFAULT_HTTP_PORT).ok())
    };

    let mut computers = Vec::new();
    match sqlx::query("SELECT * FROM Computers").fetch_all(&pool).await {
        Ok(rows) => {
            for row in rows {
                let Ok(raw_uuid) = row.try_get::<String, _>(0) else {
                    continue;
                };
                if uuid::Uuid::parse_str(&raw_uuid).is_err() {
                    warn!("Corrupted UUID in legacy v2 database");
                    continue;
                }

                let mut details = ComputerDetails::new();
                details.uuid = Some(raw_uuid);
                details.name = row.try_get(1).unwrap_or_default();
                details.local_address = to_address(row.try_get(2).ok());
                details.remote_address = to_address(row.try_get(3).ok());
                details.manual_address = to_address(row.try_get(4).ok());
                details.mac_address = row.try_get(5).ok();
                // The certificate column wasn't always present in this schema.
                if row.len() >= 7 {
                    details.server_cert = row.try_get::<Option<Vec<u8>>, _>(6).ok().flatten();
                }
                details.state = State::Unknown;

                computers.push(details);
            }
            info!("Imported {} host(s) from legacy v2 database", computers.len());
        }
        Err(e) => warn!("Legacy v2 read failed: {e}"),
    }

    pool.close().await;
    remove_db(&path);
    computers
}

fn split_address(part: &str) -> Option<AddressTuple> {
    if part.is_empty() {
        return None;
    }
    match part.rsplit_once(PORT_DELIMITER) {
        Some((address, port)) => {
            let port = port.parse().ok()?;
            AddressTuple::new(address, port).ok()
        }
        None => AddressTuple::new(part, DEFAULT_HTTP_PORT).ok(),
    }
}

/// Parse one delimited-format address column
/// (`local;remote;manual;ipv6`, each `address_port` or bare address).
pub(crate) fn parse_delimited_addresses(value: &str) -> Option<StoredAddresses> {
    let parts: Vec<&str> = value.split(ADDRESS_DELIMITER).collect();
    if parts.len() != 4 {
        return None;
    }
    Some(StoredAddresses {
        local: split_address(parts[0]),
        remote: split_address(parts[1]),
        manual: split_address(parts[2]),
        ipv6: split_address(parts[3]),
    })
}
