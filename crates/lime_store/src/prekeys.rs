//! Signed and one-time pre-keys of local users.
//!
//! Key ids are public, so they are random rather than sequential. The most
//! significant bit is always cleared: SQLite integers are signed.

use std::collections::HashSet;

use lime_crypto::DhKeyPair;
use rand::Rng;
use sqlx::SqliteConnection;

use crate::error::StoreError;

fn random_key_id(taken: &mut HashSet<u32>) -> u32 {
    let mut rng = rand::thread_rng();
    loop {
        let id = rng.gen::<u32>() & 0x7FFF_FFFF;
        if id != 0 && taken.insert(id) {
            return id;
        }
    }
}

async fn taken_ids(
    conn: &mut SqliteConnection,
    table_query: &str,
) -> Result<HashSet<u32>, StoreError> {
    let ids: Vec<i64> = sqlx::query_scalar(table_query).fetch_all(&mut *conn).await?;
    Ok(ids.into_iter().filter_map(|id| u32::try_from(id).ok()).collect())
}

fn key_id(v: i64) -> Result<u32, StoreError> {
    u32::try_from(v).map_err(|_| StoreError::Corrupt(format!("pre-key id {v}")))
}

// ── SPk ──────────────────────────────────────────────────────────────────────

/// Store a new active SPk for `uid` and return its id. The previous active
/// SPk becomes stale and is kept for the limbo period.
pub async fn insert_spk(
    conn: &mut SqliteConnection,
    uid: i64,
    spk: &DhKeyPair,
) -> Result<u32, StoreError> {
    // ids are unique across all users
    let mut taken = taken_ids(conn, "SELECT spk_id FROM x3dh_spk").await?;
    let spk_id = random_key_id(&mut taken);

    sqlx::query(
        "UPDATE x3dh_spk SET status = 0, time_stamp = CURRENT_TIMESTAMP \
         WHERE uid = ? AND status = 1",
    )
    .bind(uid)
    .execute(&mut *conn)
    .await?;

    let stored = spk.to_stored();
    sqlx::query("INSERT INTO x3dh_spk (spk_id, spk, uid) VALUES (?, ?, ?)")
        .bind(i64::from(spk_id))
        .bind(stored.as_slice())
        .bind(uid)
        .execute(&mut *conn)
        .await?;
    tracing::debug!("[store] uid {uid}: new SPk {spk_id:#010x}");
    Ok(spk_id)
}

/// The active SPk of `uid`, if any.
pub async fn current_spk(
    conn: &mut SqliteConnection,
    uid: i64,
) -> Result<Option<(u32, DhKeyPair)>, StoreError> {
    let row: Option<(i64, Vec<u8>)> =
        sqlx::query_as("SELECT spk_id, spk FROM x3dh_spk WHERE uid = ? AND status = 1 LIMIT 1")
            .bind(uid)
            .fetch_optional(&mut *conn)
            .await?;
    match row {
        Some((id, spk)) => Ok(Some((key_id(id)?, DhKeyPair::from_stored(&spk)?))),
        None => Ok(None),
    }
}

/// An SPk by id, active or stale.
pub async fn get_spk(
    conn: &mut SqliteConnection,
    uid: i64,
    spk_id: u32,
) -> Result<DhKeyPair, StoreError> {
    let spk: Option<Vec<u8>> =
        sqlx::query_scalar("SELECT spk FROM x3dh_spk WHERE uid = ? AND spk_id = ? LIMIT 1")
            .bind(uid)
            .bind(i64::from(spk_id))
            .fetch_optional(&mut *conn)
            .await?;
    let spk = spk.ok_or_else(|| StoreError::NotFound(format!("SPk {spk_id:#010x}")))?;
    Ok(DhKeyPair::from_stored(&spk)?)
}

/// True when `uid` has an active SPk younger than `lifetime_days`.
pub async fn is_current_spk_valid(
    conn: &mut SqliteConnection,
    uid: i64,
    lifetime_days: u32,
) -> Result<bool, StoreError> {
    let found: Option<i64> = sqlx::query_scalar(
        "SELECT spk_id FROM x3dh_spk WHERE uid = ? AND status = 1 \
         AND time_stamp > datetime('now', '-' || ? || ' day') LIMIT 1",
    )
    .bind(uid)
    .bind(i64::from(lifetime_days))
    .fetch_optional(&mut *conn)
    .await?;
    Ok(found.is_some())
}

/// Drop an SPk the key server never acknowledged.
pub async fn delete_spk(
    conn: &mut SqliteConnection,
    uid: i64,
    spk_id: u32,
) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM x3dh_spk WHERE uid = ? AND spk_id = ?")
        .bind(uid)
        .bind(i64::from(spk_id))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// ── OPk ──────────────────────────────────────────────────────────────────────

/// Store a batch of OPks and return their ids, in the same order.
pub async fn insert_opks(
    conn: &mut SqliteConnection,
    uid: i64,
    opks: &[DhKeyPair],
) -> Result<Vec<u32>, StoreError> {
    let mut taken = taken_ids(conn, "SELECT opk_id FROM x3dh_opk").await?;
    let mut ids = Vec::with_capacity(opks.len());
    for opk in opks {
        let id = random_key_id(&mut taken);
        let stored = opk.to_stored();
        sqlx::query("INSERT INTO x3dh_opk (opk_id, opk, uid) VALUES (?, ?, ?)")
            .bind(i64::from(id))
            .bind(stored.as_slice())
            .bind(uid)
            .execute(&mut *conn)
            .await?;
        ids.push(id);
    }
    tracing::debug!("[store] uid {uid}: stored {} OPks", ids.len());
    Ok(ids)
}

/// Public halves of the OPks believed to be on the key server.
pub async fn published_opks(
    conn: &mut SqliteConnection,
    uid: i64,
) -> Result<Vec<(u32, [u8; 32])>, StoreError> {
    let rows: Vec<(i64, Vec<u8>)> = sqlx::query_as(
        "SELECT opk_id, opk FROM x3dh_opk WHERE uid = ? AND status = 1 ORDER BY opk_id",
    )
    .bind(uid)
    .fetch_all(&mut *conn)
    .await?;
    rows.into_iter()
        .map(|(id, opk)| {
            let pair = DhKeyPair::from_stored(&opk)?;
            Ok::<_, StoreError>((key_id(id)?, *pair.public()))
        })
        .collect()
}

pub async fn get_opk(
    conn: &mut SqliteConnection,
    uid: i64,
    opk_id: u32,
) -> Result<DhKeyPair, StoreError> {
    let opk: Option<Vec<u8>> =
        sqlx::query_scalar("SELECT opk FROM x3dh_opk WHERE uid = ? AND opk_id = ? LIMIT 1")
            .bind(uid)
            .bind(i64::from(opk_id))
            .fetch_optional(&mut *conn)
            .await?;
    let opk = opk.ok_or_else(|| StoreError::NotFound(format!("OPk {opk_id:#010x}")))?;
    Ok(DhKeyPair::from_stored(&opk)?)
}

pub async fn delete_opk(
    conn: &mut SqliteConnection,
    uid: i64,
    opk_id: u32,
) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM x3dh_opk WHERE uid = ? AND opk_id = ?")
        .bind(uid)
        .bind(i64::from(opk_id))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Reconcile local OPks with the ids the key server still holds.
///
/// OPks missing from `server_ids` were handed out: they become dispatched and
/// are timestamped. Dispatched OPks older than `limbo_days` are deleted.
pub async fn update_opk_status(
    conn: &mut SqliteConnection,
    uid: i64,
    server_ids: &[u32],
    limbo_days: u32,
) -> Result<(), StoreError> {
    let on_server: HashSet<u32> = server_ids.iter().copied().collect();
    let published: Vec<i64> =
        sqlx::query_scalar("SELECT opk_id FROM x3dh_opk WHERE uid = ? AND status = 1")
            .bind(uid)
            .fetch_all(&mut *conn)
            .await?;

    let mut dispatched = 0usize;
    for id in published {
        if on_server.contains(&key_id(id)?) {
            continue;
        }
        sqlx::query(
            "UPDATE x3dh_opk SET status = 0, time_stamp = CURRENT_TIMESTAMP \
             WHERE opk_id = ? AND uid = ?",
        )
        .bind(id)
        .bind(uid)
        .execute(&mut *conn)
        .await?;
        dispatched += 1;
    }

    let purged = sqlx::query(
        "DELETE FROM x3dh_opk WHERE uid = ? AND status = 0 \
         AND time_stamp < datetime('now', '-' || ? || ' day')",
    )
    .bind(uid)
    .bind(i64::from(limbo_days))
    .execute(&mut *conn)
    .await?
    .rows_affected();

    tracing::debug!("[store] uid {uid}: {dispatched} OPks dispatched, {purged} purged");
    Ok(())
}

/// Mark every OPk of `uid` as dispatched, before republishing a user the
/// server forgot.
pub async fn set_all_opks_dispatched(
    conn: &mut SqliteConnection,
    uid: i64,
) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE x3dh_opk SET status = 0, time_stamp = CURRENT_TIMESTAMP \
         WHERE uid = ? AND status = 1",
    )
    .bind(uid)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
