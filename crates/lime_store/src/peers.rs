//! Peer devices and their trust status.
//!
//! Peer devices are shared by every local user. A device first seen through
//! `set_peer_status(.., Unsafe)` has no identity key yet; its `ik` column then
//! holds [`INVALID_IK`], which never matches a real key.

use sqlx::SqliteConnection;

use crate::{
    error::StoreError,
    models::{PeerDeviceRow, PeerDeviceStatus},
};

/// Placeholder for an unknown peer identity key.
pub const INVALID_IK: [u8; 1] = [0x00];

fn is_invalid_ik(ik: &[u8]) -> bool {
    ik == INVALID_IK
}

pub async fn peer_device(
    conn: &mut SqliteConnection,
    device_id: &str,
) -> Result<Option<PeerDeviceRow>, StoreError> {
    Ok(sqlx::query_as(
        "SELECT did, device_id, ik, status FROM lime_peer_devices WHERE device_id = ?",
    )
    .bind(device_id)
    .fetch_optional(&mut *conn)
    .await?)
}

/// Stored identity key of a peer, `None` when absent or still the placeholder.
pub async fn peer_device_ik(
    conn: &mut SqliteConnection,
    device_id: &str,
) -> Result<Option<Vec<u8>>, StoreError> {
    Ok(peer_device(conn, device_id)
        .await?
        .map(|row| row.ik)
        .filter(|ik| !is_invalid_ik(ik)))
}

/// `Unknown` when the device is not in local storage.
pub async fn get_peer_status(
    conn: &mut SqliteConnection,
    device_id: &str,
) -> Result<PeerDeviceStatus, StoreError> {
    let status: Option<i64> =
        sqlx::query_scalar("SELECT status FROM lime_peer_devices WHERE device_id = ?")
            .bind(device_id)
            .fetch_optional(&mut *conn)
            .await?;
    match status {
        Some(s) => PeerDeviceStatus::from_stored(s),
        None => Ok(PeerDeviceStatus::Unknown),
    }
}

/// Least trusted status of a list of devices.
///
/// Any unknown device makes the whole list `Unknown`; otherwise any unsafe
/// device makes it `Unsafe`; `Trusted` needs every device trusted.
pub async fn get_peer_statuses(
    conn: &mut SqliteConnection,
    device_ids: &[String],
) -> Result<PeerDeviceStatus, StoreError> {
    if device_ids.is_empty() {
        return Ok(PeerDeviceStatus::Unknown);
    }
    let mut all_trusted = true;
    let mut any_unsafe = false;
    for id in device_ids {
        match get_peer_status(conn, id).await? {
            PeerDeviceStatus::Unknown => return Ok(PeerDeviceStatus::Unknown),
            PeerDeviceStatus::Unsafe | PeerDeviceStatus::Fail => {
                any_unsafe = true;
                all_trusted = false;
            }
            PeerDeviceStatus::Untrusted => all_trusted = false,
            PeerDeviceStatus::Trusted => {}
        }
    }
    Ok(if any_unsafe {
        PeerDeviceStatus::Unsafe
    } else if all_trusted {
        PeerDeviceStatus::Trusted
    } else {
        PeerDeviceStatus::Untrusted
    })
}

/// Set the trust status of a peer device.
///
/// - `Trusted` requires `ik`; it inserts the device, updates it when the
///   stored key matches or is the placeholder, and fails with
///   `IdentityKeyConflict` otherwise.
/// - `Untrusted` ignores `ik` and only updates a stored device that is not `Unsafe`.
/// - `Unsafe` ignores `ik`; an absent device is inserted with the placeholder key.
/// - `Fail` and `Unknown` are never stored: the call is ignored.
pub async fn set_peer_status(
    conn: &mut SqliteConnection,
    device_id: &str,
    ik: Option<&[u8]>,
    status: PeerDeviceStatus,
) -> Result<(), StoreError> {
    let Some(status_int) = status.to_stored() else {
        tracing::warn!("[store] refusing to store status {status} for peer device {device_id}");
        return Ok(());
    };
    let existing = peer_device(conn, device_id).await?;

    match status {
        PeerDeviceStatus::Trusted => {
            let Some(ik) = ik else {
                tracing::warn!(
                    "[store] trusted status for {device_id} needs an identity key, ignored"
                );
                return Ok(());
            };
            match existing {
                Some(row) if row.ik == ik => {
                    sqlx::query("UPDATE lime_peer_devices SET status = ? WHERE did = ?")
                        .bind(status_int)
                        .bind(row.did)
                        .execute(&mut *conn)
                        .await?;
                }
                Some(row) if is_invalid_ik(&row.ik) => {
                    sqlx::query("UPDATE lime_peer_devices SET status = ?, ik = ? WHERE did = ?")
                        .bind(status_int)
                        .bind(ik)
                        .bind(row.did)
                        .execute(&mut *conn)
                        .await?;
                    tracing::warn!(
                        "[store] peer device {device_id} had no identity key, stored the given one"
                    );
                }
                Some(row) => {
                    return Err(StoreError::IdentityKeyConflict {
                        device_id: device_id.to_owned(),
                        stored: hex::encode(&row.ik),
                        new: hex::encode(ik),
                    });
                }
                None => {
                    insert_peer(conn, device_id, ik, status_int).await?;
                }
            }
        }
        PeerDeviceStatus::Untrusted => match existing {
            None => {
                tracing::warn!(
                    "[store] untrusted status for unknown peer device {device_id}, ignored"
                );
            }
            Some(row) if row.status == status_int => {}
            Some(row) if PeerDeviceStatus::from_stored(row.status)? == PeerDeviceStatus::Unsafe => {
                tracing::warn!(
                    "[store] peer device {device_id} is unsafe, untrusted status ignored"
                );
            }
            Some(row) => {
                sqlx::query("UPDATE lime_peer_devices SET status = ? WHERE did = ?")
                    .bind(status_int)
                    .bind(row.did)
                    .execute(&mut *conn)
                    .await?;
            }
        },
        PeerDeviceStatus::Unsafe => match existing {
            Some(row) => {
                sqlx::query("UPDATE lime_peer_devices SET status = ? WHERE did = ?")
                    .bind(status_int)
                    .bind(row.did)
                    .execute(&mut *conn)
                    .await?;
            }
            None => {
                insert_peer(conn, device_id, &INVALID_IK, status_int).await?;
            }
        },
        PeerDeviceStatus::Fail | PeerDeviceStatus::Unknown => {}
    }
    tracing::debug!("[store] peer device {device_id} status set to {status}");
    Ok(())
}

async fn insert_peer(
    conn: &mut SqliteConnection,
    device_id: &str,
    ik: &[u8],
    status: i64,
) -> Result<i64, StoreError> {
    let res = sqlx::query("INSERT INTO lime_peer_devices (device_id, ik, status) VALUES (?, ?, ?)")
        .bind(device_id)
        .bind(ik)
        .bind(status)
        .execute(&mut *conn)
        .await?;
    Ok(res.last_insert_rowid())
}

/// Record the identity key of a peer met through X3DH and return its row id.
///
/// A known device must present the same key; the placeholder is replaced.
/// New devices are stored untrusted.
pub async fn store_peer_device(
    conn: &mut SqliteConnection,
    device_id: &str,
    ik: &[u8],
) -> Result<i64, StoreError> {
    match peer_device(conn, device_id).await? {
        Some(row) if row.ik == ik => Ok(row.did),
        Some(row) if is_invalid_ik(&row.ik) => {
            sqlx::query("UPDATE lime_peer_devices SET ik = ? WHERE did = ?")
                .bind(ik)
                .bind(row.did)
                .execute(&mut *conn)
                .await?;
            tracing::warn!("[store] replaced placeholder identity key of peer device {device_id}");
            Ok(row.did)
        }
        Some(row) => {
            tracing::error!("[store] peer device {device_id} presents a new identity key");
            Err(StoreError::IdentityKeyConflict {
                device_id: device_id.to_owned(),
                stored: hex::encode(&row.ik),
                new: hex::encode(ik),
            })
        }
        None => {
            let untrusted = PeerDeviceStatus::Untrusted.to_stored().unwrap_or_default();
            let did = insert_peer(conn, device_id, ik, untrusted).await?;
            tracing::debug!("[store] stored peer device {device_id} as did {did}");
            Ok(did)
        }
    }
}

/// Delete a peer device; its sessions cascade. Absent devices are ignored.
pub async fn delete_peer_device(
    conn: &mut SqliteConnection,
    device_id: &str,
) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM lime_peer_devices WHERE device_id = ?")
        .bind(device_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}
