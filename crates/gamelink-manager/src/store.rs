//! SQLite persistence for tracked hosts.
//!
//! One row per host keyed by UUID; the four known addresses travel as one
//! JSON column so address shape changes stop forcing schema bumps. Rows with
//! an unparseable UUID are deleted on sight instead of poisoning every load.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use gamelink_core::{AddressTuple, ComputerDetails, State, DEFAULT_HTTP_PORT};

use crate::legacy;
use crate::ManagerError;

pub const COMPUTER_DB_NAME: &str = "computers3.db";

#[derive(Serialize, Deserialize, Default)]
pub(crate) struct StoredAddresses {
    pub local: Option<AddressTuple>,
    pub remote: Option<AddressTuple>,
    pub manual: Option<AddressTuple>,
    pub ipv6: Option<AddressTuple>,
}

/// The on-disk computer store.
pub struct ComputerStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl ComputerStore {
    /// Open (or create) the store in `data_dir`, running the legacy import
    /// chain first so older installations carry their hosts over.
    pub async fn open(data_dir: &Path) -> Result<Self, ManagerError> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(COMPUTER_DB_NAME);

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS Computers(\
                 UUID TEXT PRIMARY KEY, \
                 ComputerName TEXT NOT NULL, \
                 Addresses TEXT NOT NULL, \
                 MacAddress TEXT, \
                 ServerCert BLOB)",
        )
        .execute(&pool)
        .await?;

        let store = Self { pool, path };

        // Move hosts over from the old database formats (if any), oldest
        // first so newer data wins the upserts.
        for computer in legacy::import_v1(data_dir).await {
            store.update_computer(&computer).await?;
        }
        for computer in legacy::import_v2(data_dir).await {
            store.update_computer(&computer).await?;
        }
        store.migrate_delimited_rows().await?;

        Ok(store)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert or replace one host row.
    pub async fn update_computer(&self, details: &ComputerDetails) -> Result<(), ManagerError> {
        let Some(uuid) = details.uuid.as_deref() else {
            warn!("Refusing to persist host '{}' without a UUID", details.name);
            return Ok(());
        };

        let addresses = StoredAddresses {
            local: details.local_address.clone(),
            remote: details.remote_address.clone(),
            manual: details.manual_address.clone(),
            ipv6: details.ipv6_address.clone(),
        };
        let addresses_json = serde_json::to_string(&addresses)
            .unwrap_or_else(|e| {
                warn!("Failed to encode addresses for {uuid}: {e}");
                "{}".to_owned()
            });

        sqlx::query(
            "INSERT OR REPLACE INTO Computers \
                 (UUID, ComputerName, Addresses, MacAddress, ServerCert) \
                 VALUES (?, ?, ?, ?, ?)",
        )
        .bind(uuid)
        .bind(details.name.as_str())
        .bind(addresses_json)
        .bind(details.mac_address.as_deref())
        .bind(details.server_cert.as_deref())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn delete_computer(&self, uuid: &str) -> Result<(), ManagerError> {
        sqlx::query("DELETE FROM Computers WHERE UUID = ?")
            .bind(uuid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn all_computers(&self) -> Result<Vec<ComputerDetails>, ManagerError> {
        let rows = sqlx::query("SELECT UUID, ComputerName, Addresses, MacAddress, ServerCert FROM Computers")
            .fetch_all(&self.pool)
            .await?;

        let mut computers = Vec::with_capacity(rows.len());
        for row in rows {
            let raw_uuid: String = row.try_get(0)?;
            if uuid::Uuid::from_str(&raw_uuid).is_err() {
                // A corrupted row must never break every startup after it.
                warn!("Deleting host row with corrupted UUID: {raw_uuid:?}");
                self.delete_computer(&raw_uuid).await?;
                continue;
            }
            computers.push(self.computer_from_row(&row, raw_uuid)?);
        }
        Ok(computers)
    }

    pub async fn computer_by_uuid(
        &self,
        uuid: &str,
    ) -> Result<Option<ComputerDetails>, ManagerError> {
        let row = sqlx::query(
            "SELECT UUID, ComputerName, Addresses, MacAddress, ServerCert \
                 FROM Computers WHERE UUID = ?",
        )
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.computer_from_row(&row, uuid.to_owned())?)),
            None => Ok(None),
        }
    }

    fn computer_from_row(
        &self,
        row: &sqlx::sqlite::SqliteRow,
        uuid: String,
    ) -> Result<ComputerDetails, ManagerError> {
        let mut details = ComputerDetails::new();
        details.uuid = Some(uuid);
        details.name = row.try_get(1)?;

        let addresses_json: String = row.try_get(2)?;
        match serde_json::from_str::<StoredAddresses>(&addresses_json) {
            Ok(addresses) => {
                details.local_address = addresses.local;
                details.remote_address = addresses.remote;
                details.manual_address = addresses.manual;
                details.ipv6_address = addresses.ipv6;
            }
            Err(e) => {
                warn!("Failed to read stored addresses for {:?}: {e}", details.uuid);
            }
        }

        // The external port is persisted through the remote address tuple.
        details.external_port = details
            .remote_address
            .as_ref()
            .map(|a| a.port)
            .unwrap_or(DEFAULT_HTTP_PORT);

        details.mac_address = row.try_get(3)?;
        details.server_cert = row.try_get(4)?;

        // Fresh from disk we know nothing about dynamic state.
        details.state = State::Unknown;

        Ok(details)
    }

    /// In-place migration for the delimited address format that predated the
    /// JSON column: `local;remote;manual;ipv6`, each `address_port`.
    async fn migrate_delimited_rows(&self) -> Result<(), ManagerError> {
        let rows = sqlx::query("SELECT UUID, Addresses FROM Computers")
            .fetch_all(&self.pool)
            .await?;

        for row in rows {
            let uuid: String = row.try_get(0)?;
            let addresses: String = row.try_get(1)?;
            if addresses.starts_with('{') {
                continue;
            }

            let Some(migrated) = legacy::parse_delimited_addresses(&addresses) else {
                warn!("Dropping undecodable legacy addresses for {uuid}");
                continue;
            };
            info!("Migrating legacy delimited addresses for {uuid}");
            let json = serde_json::to_string(&migrated).expect("address serialization");
            sqlx::query("UPDATE Computers SET Addresses = ? WHERE UUID = ?")
                .bind(json)
                .bind(&uuid)
                .execute(&self.pool)
                .await?;
        }

        Ok(())
    }
}
