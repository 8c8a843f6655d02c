//! Database handle over SQLite via sqlx.

use std::path::Path;

use sqlx::{
    pool::PoolConnection,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool},
    Sqlite, Transaction,
};

use crate::error::StoreError;

/// Schema version written in `db_module_version`, major.minor.patch on 3 bytes.
pub const SCHEMA_VERSION: i64 = 0x00_01_00;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS db_module_version (
        name TEXT PRIMARY KEY NOT NULL,
        version UNSIGNED INTEGER NOT NULL
    )",
    // curve_id carries the inactive bit until the key server acknowledged registration
    "CREATE TABLE IF NOT EXISTS lime_local_users (
        uid INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
        user_id TEXT NOT NULL UNIQUE,
        ik BLOB NOT NULL,
        server TEXT NOT NULL,
        curve_id INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS lime_peer_devices (
        did INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
        device_id TEXT NOT NULL UNIQUE,
        ik BLOB NOT NULL,
        status UNSIGNED INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS dr_sessions (
        session_id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
        did INTEGER NOT NULL DEFAULT 0,
        uid INTEGER NOT NULL DEFAULT 0,
        ns UNSIGNED INTEGER NOT NULL,
        nr UNSIGNED INTEGER NOT NULL,
        pn UNSIGNED INTEGER NOT NULL,
        dhr BLOB NOT NULL,
        dhs BLOB NOT NULL,
        rk BLOB NOT NULL,
        cks BLOB NOT NULL,
        ckr BLOB NOT NULL,
        ad BLOB NOT NULL,
        status INTEGER NOT NULL DEFAULT 1,
        time_stamp DATETIME DEFAULT CURRENT_TIMESTAMP,
        x3dh_init BLOB DEFAULT NULL,
        FOREIGN KEY(did) REFERENCES lime_peer_devices(did) ON UPDATE CASCADE ON DELETE CASCADE,
        FOREIGN KEY(uid) REFERENCES lime_local_users(uid) ON UPDATE CASCADE ON DELETE CASCADE
    )",
    "CREATE INDEX IF NOT EXISTS dr_sessions_peer ON dr_sessions(uid, did, status)",
    "CREATE TABLE IF NOT EXISTS dr_msk_dhr (
        dhid INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
        session_id INTEGER NOT NULL DEFAULT 0,
        dhr BLOB NOT NULL,
        received UNSIGNED INTEGER NOT NULL DEFAULT 0,
        FOREIGN KEY(session_id) REFERENCES dr_sessions(session_id)
            ON UPDATE CASCADE ON DELETE CASCADE
    )",
    "CREATE TABLE IF NOT EXISTS dr_msk_mk (
        dhid INTEGER NOT NULL,
        nr INTEGER NOT NULL,
        mk BLOB NOT NULL,
        PRIMARY KEY(dhid, nr),
        FOREIGN KEY(dhid) REFERENCES dr_msk_dhr(dhid) ON UPDATE CASCADE ON DELETE CASCADE
    )",
    "CREATE TABLE IF NOT EXISTS x3dh_spk (
        spk_id UNSIGNED INTEGER PRIMARY KEY NOT NULL,
        spk BLOB NOT NULL,
        time_stamp DATETIME DEFAULT CURRENT_TIMESTAMP,
        status INTEGER NOT NULL DEFAULT 1,
        uid INTEGER NOT NULL,
        FOREIGN KEY(uid) REFERENCES lime_local_users(uid) ON UPDATE CASCADE ON DELETE CASCADE
    )",
    // status 1: still on the key server, 0: dispatched (kept for late init messages)
    "CREATE TABLE IF NOT EXISTS x3dh_opk (
        opk_id UNSIGNED INTEGER PRIMARY KEY NOT NULL,
        opk BLOB NOT NULL,
        uid INTEGER NOT NULL,
        status INTEGER NOT NULL DEFAULT 1,
        time_stamp DATETIME DEFAULT CURRENT_TIMESTAMP,
        FOREIGN KEY(uid) REFERENCES lime_local_users(uid) ON UPDATE CASCADE ON DELETE CASCADE
    )",
];

/// Central store handle. Cheap to clone (Arc internally).
#[derive(Clone)]
pub struct Store {
    pub pool: SqlitePool,
}

impl Store {
    /// Open (or create) the SQLite database at `db_path` and make sure the
    /// schema exists.
    ///
    /// WAL journal mode and foreign-key enforcement are connection options:
    /// SQLite refuses to switch `journal_mode` inside a transaction.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(opts).await?;
        let store = Self { pool };
        store.create_schema().await?;
        tracing::debug!("[store] opened {}", db_path.display());
        Ok(store)
    }

    async fn create_schema(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&mut *tx).await?;
        }

        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM db_module_version WHERE name = 'lime'")
                .fetch_optional(&mut *tx)
                .await?;
        match version {
            None => {
                sqlx::query("INSERT INTO db_module_version (name, version) VALUES ('lime', ?)")
                    .bind(SCHEMA_VERSION)
                    .execute(&mut *tx)
                    .await?;
            }
            Some(v) if v > SCHEMA_VERSION => {
                return Err(StoreError::Migration(format!(
                    "database schema {v:#08x} is newer than supported {SCHEMA_VERSION:#08x}"
                )));
            }
            Some(_) => {}
        }
        tx.commit().await?;
        Ok(())
    }

    /// Start a transaction; every ratchet mutation runs inside one.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, StoreError> {
        Ok(self.pool.begin().await?)
    }

    pub async fn acquire(&self) -> Result<PoolConnection<Sqlite>, StoreError> {
        Ok(self.pool.acquire().await?)
    }
}
