//! Double ratchet sessions and their skipped message keys.
//!
//! For one (local user, peer device) pair at most one session has
//! `status = 1`. Older ones stay stale until the cleanup sweep removes them.

use lime_crypto::{
    aead::MessageKey,
    kdf::CHAIN_KEY_SIZE,
    ratchet::{RatchetParts, RatchetState, SkippedChain},
    x3dh::SHARED_AD_SIZE,
    CurveId, DhKeyPair,
};
use sqlx::SqliteConnection;

use crate::{
    error::StoreError,
    models::{SessionRow, SessionSummary},
};

/// What changed in a session since it was loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionUpdate {
    /// DH ratchet ran: every column changes and the X3DH init is dropped.
    Ratchet,
    /// Receiving chain advanced.
    Decrypt,
    /// Sending chain advanced; `active` is false once the chain is exhausted.
    Encrypt { active: bool },
}

/// A session as loaded from storage.
pub struct StoredSession {
    pub session_id: i64,
    pub uid: i64,
    pub did: i64,
    pub active: bool,
    pub state: RatchetState,
    /// Encoded X3DH init, sent along until the peer replies.
    pub x3dh_init: Option<Vec<u8>>,
}

fn fixed<const N: usize>(bytes: &[u8], what: &str) -> Result<[u8; N], StoreError> {
    bytes.try_into().map_err(|_| {
        StoreError::Corrupt(format!("{what}: expected {N} bytes, got {}", bytes.len()))
    })
}

fn counter(v: i64, what: &str) -> Result<u16, StoreError> {
    u16::try_from(v).map_err(|_| StoreError::Corrupt(format!("{what} counter {v}")))
}

impl StoredSession {
    fn from_row(row: SessionRow, curve: CurveId) -> Result<Self, StoreError> {
        let parts = RatchetParts {
            curve,
            dhr: fixed(&row.dhr, "dhr")?,
            dhs: DhKeyPair::from_stored(&row.dhs)?,
            rk: fixed(&row.rk, "rk")?,
            cks: fixed::<CHAIN_KEY_SIZE>(&row.cks, "cks")?,
            ckr: fixed::<CHAIN_KEY_SIZE>(&row.ckr, "ckr")?,
            ns: counter(row.ns, "ns")?,
            nr: counter(row.nr, "nr")?,
            pn: counter(row.pn, "pn")?,
            shared_ad: fixed::<SHARED_AD_SIZE>(&row.ad, "ad")?,
        };
        Ok(Self {
            session_id: row.session_id,
            uid: row.uid,
            did: row.did,
            active: row.status == 1,
            state: RatchetState::from_parts(parts),
            x3dh_init: row.x3dh_init.filter(|init| !init.is_empty()),
        })
    }
}

/// Mark every session between `uid` and `did` stale.
pub async fn stale_peer_sessions(
    conn: &mut SqliteConnection,
    uid: i64,
    did: i64,
) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE dr_sessions SET status = 0, time_stamp = CURRENT_TIMESTAMP \
         WHERE did = ? AND uid = ? AND status = 1",
    )
    .bind(did)
    .bind(uid)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Same as [`stale_peer_sessions`], addressing the peer by device id.
pub async fn stale_sessions_with(
    conn: &mut SqliteConnection,
    uid: i64,
    peer_device_id: &str,
) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE dr_sessions SET status = 0, time_stamp = CURRENT_TIMESTAMP \
         WHERE uid = ? AND status = 1 \
         AND did = (SELECT did FROM lime_peer_devices WHERE device_id = ? LIMIT 1)",
    )
    .bind(uid)
    .bind(peer_device_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Insert a new active session, staling any other one with the same peer.
pub async fn insert_session(
    conn: &mut SqliteConnection,
    uid: i64,
    did: i64,
    state: &RatchetState,
    x3dh_init: Option<&[u8]>,
) -> Result<i64, StoreError> {
    stale_peer_sessions(conn, uid, did).await?;

    let parts = state.to_parts();
    let dhs = parts.dhs.to_stored();
    let res = sqlx::query(
        "INSERT INTO dr_sessions (ns, nr, pn, dhr, dhs, rk, cks, ckr, ad, did, uid, x3dh_init) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(i64::from(parts.ns))
    .bind(i64::from(parts.nr))
    .bind(i64::from(parts.pn))
    .bind(&parts.dhr[..])
    .bind(dhs.as_slice())
    .bind(&parts.rk[..])
    .bind(&parts.cks[..])
    .bind(&parts.ckr[..])
    .bind(&parts.shared_ad[..])
    .bind(did)
    .bind(uid)
    .bind(x3dh_init)
    .execute(&mut *conn)
    .await?;

    let session_id = res.last_insert_rowid();
    tracing::debug!("[store] inserted session {session_id} uid={uid} did={did}");
    Ok(session_id)
}

/// Write back the columns touched by `update`.
///
/// Ratchet and decrypt updates reactivate the session; the caller stales the
/// other sessions with that peer first when this one was not active.
pub async fn update_session(
    conn: &mut SqliteConnection,
    session_id: i64,
    state: &RatchetState,
    update: SessionUpdate,
) -> Result<(), StoreError> {
    let parts = state.to_parts();
    let res = match update {
        SessionUpdate::Ratchet => {
            let dhs = parts.dhs.to_stored();
            sqlx::query(
                "UPDATE dr_sessions SET ns = ?, nr = ?, pn = ?, dhr = ?, dhs = ?, rk = ?, \
                 cks = ?, ckr = ?, status = 1, x3dh_init = NULL WHERE session_id = ?",
            )
            .bind(i64::from(parts.ns))
            .bind(i64::from(parts.nr))
            .bind(i64::from(parts.pn))
            .bind(&parts.dhr[..])
            .bind(dhs.as_slice())
            .bind(&parts.rk[..])
            .bind(&parts.cks[..])
            .bind(&parts.ckr[..])
            .bind(session_id)
            .execute(&mut *conn)
            .await?
        }
        SessionUpdate::Decrypt => {
            sqlx::query(
                "UPDATE dr_sessions SET nr = ?, ckr = ?, status = 1, x3dh_init = NULL \
                 WHERE session_id = ?",
            )
            .bind(i64::from(parts.nr))
            .bind(&parts.ckr[..])
            .bind(session_id)
            .execute(&mut *conn)
            .await?
        }
        SessionUpdate::Encrypt { active } => {
            sqlx::query("UPDATE dr_sessions SET ns = ?, cks = ?, status = ? WHERE session_id = ?")
                .bind(i64::from(parts.ns))
                .bind(&parts.cks[..])
                .bind(i64::from(active))
                .bind(session_id)
                .execute(&mut *conn)
                .await?
        }
    };
    if res.rows_affected() == 0 {
        return Err(StoreError::NotFound(format!("session {session_id}")));
    }
    Ok(())
}

const SELECT_SESSION: &str = "SELECT session_id, did, uid, ns, nr, pn, dhr, dhs, rk, cks, ckr, ad, \
     status, time_stamp, x3dh_init FROM dr_sessions";

pub async fn load_session(
    conn: &mut SqliteConnection,
    session_id: i64,
    curve: CurveId,
) -> Result<StoredSession, StoreError> {
    let row: Option<SessionRow> = sqlx::query_as(&format!("{SELECT_SESSION} WHERE session_id = ?"))
        .bind(session_id)
        .fetch_optional(&mut *conn)
        .await?;
    let row = row.ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?;
    StoredSession::from_row(row, curve)
}

/// Id of the active session between `uid` and a peer device, if any.
pub async fn active_session_id(
    conn: &mut SqliteConnection,
    uid: i64,
    peer_device_id: &str,
) -> Result<Option<i64>, StoreError> {
    Ok(sqlx::query_scalar(
        "SELECT s.session_id FROM dr_sessions AS s \
         INNER JOIN lime_peer_devices AS d ON s.did = d.did \
         WHERE s.uid = ? AND s.status = 1 AND d.device_id = ? LIMIT 1",
    )
    .bind(uid)
    .bind(peer_device_id)
    .fetch_optional(&mut *conn)
    .await?)
}

/// Every session with a peer device except `exclude`: active first, then
/// oldest first.
pub async fn session_ids_for_peer(
    conn: &mut SqliteConnection,
    uid: i64,
    peer_device_id: &str,
    exclude: Option<i64>,
) -> Result<Vec<i64>, StoreError> {
    Ok(sqlx::query_scalar(
        "SELECT s.session_id FROM dr_sessions AS s \
         INNER JOIN lime_peer_devices AS d ON s.did = d.did \
         WHERE d.device_id = ? AND s.uid = ? AND s.session_id <> ? \
         ORDER BY s.status DESC, s.time_stamp ASC, s.session_id ASC",
    )
    .bind(peer_device_id)
    .bind(uid)
    .bind(exclude.unwrap_or(0))
    .fetch_all(&mut *conn)
    .await?)
}

/// All sessions between a local user and a peer device with their active flag.
pub async fn list_sessions(
    conn: &mut SqliteConnection,
    local_device_id: &str,
    peer_device_id: &str,
) -> Result<Vec<SessionSummary>, StoreError> {
    let rows: Vec<(i64, i64)> = sqlx::query_as(
        "SELECT s.session_id, s.status FROM dr_sessions AS s \
         INNER JOIN lime_peer_devices AS d ON s.did = d.did \
         INNER JOIN lime_local_users AS u ON s.uid = u.uid \
         WHERE u.user_id = ? AND d.device_id = ? ORDER BY s.session_id",
    )
    .bind(local_device_id)
    .bind(peer_device_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(session_id, status)| SessionSummary { session_id, active: status == 1 })
        .collect())
}

// ── Skipped message keys ─────────────────────────────────────────────────────

/// Look up a stored skipped key. Returns the chain id with the key so the
/// caller can consume it once decryption succeeded.
pub async fn get_skipped_key(
    conn: &mut SqliteConnection,
    session_id: i64,
    dhr: &[u8; 32],
    nr: u16,
) -> Result<Option<(i64, MessageKey)>, StoreError> {
    let row: Option<(Vec<u8>, i64)> = sqlx::query_as(
        "SELECT m.mk, m.dhid FROM dr_msk_mk AS m \
         INNER JOIN dr_msk_dhr AS d ON d.dhid = m.dhid \
         WHERE d.session_id = ? AND d.dhr = ? AND m.nr = ? LIMIT 1",
    )
    .bind(session_id)
    .bind(&dhr[..])
    .bind(i64::from(nr))
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some((mk, dhid)) => Ok(Some((dhid, MessageKey::from_slice(&mk)?))),
        None => Ok(None),
    }
}

/// Delete a used skipped key, and its chain once the chain is empty.
pub async fn consume_skipped_key(
    conn: &mut SqliteConnection,
    dhid: i64,
    nr: u16,
) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM dr_msk_mk WHERE dhid = ? AND nr = ?")
        .bind(dhid)
        .bind(i64::from(nr))
        .execute(&mut *conn)
        .await?;

    let left: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dr_msk_mk WHERE dhid = ?")
        .bind(dhid)
        .fetch_one(&mut *conn)
        .await?;
    if left == 0 {
        sqlx::query("DELETE FROM dr_msk_dhr WHERE dhid = ?")
            .bind(dhid)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// One more message was received on the session after its keys were skipped.
pub async fn bump_received(conn: &mut SqliteConnection, session_id: i64) -> Result<(), StoreError> {
    sqlx::query("UPDATE dr_msk_dhr SET received = received + 1 WHERE session_id = ?")
        .bind(session_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Persist freshly skipped keys. A chain already stored for the same DHr gets
/// its `received` counter reset.
pub async fn store_skipped_chains(
    conn: &mut SqliteConnection,
    session_id: i64,
    chains: &[SkippedChain],
) -> Result<(), StoreError> {
    for chain in chains {
        if chain.keys.is_empty() {
            continue;
        }
        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT dhid FROM dr_msk_dhr WHERE session_id = ? AND dhr = ? LIMIT 1",
        )
        .bind(session_id)
        .bind(&chain.dhr[..])
        .fetch_optional(&mut *conn)
        .await?;
        let dhid = match existing {
            Some(dhid) => {
                sqlx::query("UPDATE dr_msk_dhr SET received = 0 WHERE dhid = ?")
                    .bind(dhid)
                    .execute(&mut *conn)
                    .await?;
                dhid
            }
            None => sqlx::query("INSERT INTO dr_msk_dhr (session_id, dhr) VALUES (?, ?)")
                .bind(session_id)
                .bind(&chain.dhr[..])
                .execute(&mut *conn)
                .await?
                .last_insert_rowid(),
        };

        for (nr, mk) in &chain.keys {
            sqlx::query("INSERT INTO dr_msk_mk (dhid, nr, mk) VALUES (?, ?, ?)")
                .bind(dhid)
                .bind(i64::from(*nr))
                .bind(mk.as_bytes())
                .execute(&mut *conn)
                .await?;
        }
        tracing::debug!(
            "[store] session {session_id}: stored {} skipped keys under dhid {dhid}",
            chain.keys.len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use lime_crypto::{kdf, IdentityKeyPair};

    use super::*;
    use crate::{db::test_support::temp_store, peers, users};

    async fn seed(conn: &mut SqliteConnection) -> (i64, i64) {
        let ik = IdentityKeyPair::generate();
        let uid = users::insert_local_user(conn, "alice.1", "url", CurveId::C25519, &ik)
            .await
            .unwrap();
        let did = peers::store_peer_device(conn, "bob.1", &[0xB0; 32]).await.unwrap();
        (uid, did)
    }

    fn sender_state() -> RatchetState {
        let spk = DhKeyPair::generate();
        RatchetState::init_sender(CurveId::C25519, &[1u8; 32], [2u8; 32], spk.public()).unwrap()
    }

    #[tokio::test]
    async fn insert_load_roundtrip_keeps_state() {
        let (store, _dir) = temp_store().await;
        let mut conn = store.acquire().await.unwrap();
        let (uid, did) = seed(&mut conn).await;

        let mut state = sender_state();
        state.send_step().unwrap();
        let id = insert_session(&mut conn, uid, did, &state, Some(b"init")).await.unwrap();

        let loaded = load_session(&mut conn, id, CurveId::C25519).await.unwrap();
        assert!(loaded.active);
        assert_eq!(loaded.x3dh_init.as_deref(), Some(&b"init"[..]));
        assert_eq!(loaded.state.ns, 1);
        assert_eq!(loaded.state.cks(), state.cks());
        assert_eq!(loaded.state.dhs_public(), state.dhs_public());
        assert_eq!(active_session_id(&mut conn, uid, "bob.1").await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn only_the_newest_session_is_active() {
        let (store, _dir) = temp_store().await;
        let mut conn = store.acquire().await.unwrap();
        let (uid, did) = seed(&mut conn).await;

        let first = insert_session(&mut conn, uid, did, &sender_state(), None).await.unwrap();
        let second = insert_session(&mut conn, uid, did, &sender_state(), None).await.unwrap();

        let listed = list_sessions(&mut conn, "alice.1", "bob.1").await.unwrap();
        assert_eq!(
            listed,
            vec![
                SessionSummary { session_id: first, active: false },
                SessionSummary { session_id: second, active: true },
            ]
        );
        assert_eq!(
            session_ids_for_peer(&mut conn, uid, "bob.1", None).await.unwrap(),
            vec![second, first]
        );
        assert_eq!(
            session_ids_for_peer(&mut conn, uid, "bob.1", Some(second)).await.unwrap(),
            vec![first]
        );

        // Decrypting on the stale one brings it back.
        stale_peer_sessions(&mut conn, uid, did).await.unwrap();
        let state = load_session(&mut conn, first, CurveId::C25519).await.unwrap().state;
        update_session(&mut conn, first, &state, SessionUpdate::Decrypt).await.unwrap();
        assert_eq!(active_session_id(&mut conn, uid, "bob.1").await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn encrypt_update_can_retire_a_session() {
        let (store, _dir) = temp_store().await;
        let mut conn = store.acquire().await.unwrap();
        let (uid, did) = seed(&mut conn).await;
        let mut state = sender_state();
        let id = insert_session(&mut conn, uid, did, &state, None).await.unwrap();

        state.send_step().unwrap();
        update_session(&mut conn, id, &state, SessionUpdate::Encrypt { active: false })
            .await
            .unwrap();
        assert_eq!(active_session_id(&mut conn, uid, "bob.1").await.unwrap(), None);
        let loaded = load_session(&mut conn, id, CurveId::C25519).await.unwrap();
        assert!(!loaded.active);
        assert_eq!(loaded.state.ns, 1);
    }

    #[tokio::test]
    async fn skipped_keys_are_consumed_once() {
        let (store, _dir) = temp_store().await;
        let mut conn = store.acquire().await.unwrap();
        let (uid, did) = seed(&mut conn).await;
        let id = insert_session(&mut conn, uid, did, &sender_state(), None).await.unwrap();

        let mut ck = [5u8; 32];
        let keys = (0..3u16).map(|n| (n, kdf::kdf_ck(&mut ck).unwrap())).collect::<Vec<_>>();
        let dhr = [9u8; 32];
        store_skipped_chains(&mut conn, id, &[SkippedChain { dhr, keys: keys.clone() }])
            .await
            .unwrap();

        let (dhid, mk) = get_skipped_key(&mut conn, id, &dhr, 1).await.unwrap().unwrap();
        assert_eq!(mk.as_bytes(), keys[1].1.as_bytes());
        consume_skipped_key(&mut conn, dhid, 1).await.unwrap();
        assert!(get_skipped_key(&mut conn, id, &dhr, 1).await.unwrap().is_none());
        assert!(get_skipped_key(&mut conn, id, &[8u8; 32], 0).await.unwrap().is_none());

        for nr in [0u16, 2] {
            let (dhid, _) = get_skipped_key(&mut conn, id, &dhr, nr).await.unwrap().unwrap();
            consume_skipped_key(&mut conn, dhid, nr).await.unwrap();
        }
        let chains: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dr_msk_dhr")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(chains, 0);
    }

    #[tokio::test]
    async fn new_skipped_keys_reset_the_received_counter() {
        let (store, _dir) = temp_store().await;
        let mut conn = store.acquire().await.unwrap();
        let (uid, did) = seed(&mut conn).await;
        let id = insert_session(&mut conn, uid, did, &sender_state(), None).await.unwrap();

        let mut ck = [5u8; 32];
        let dhr = [9u8; 32];
        let chain = |n: u16, ck: &mut [u8; 32]| SkippedChain {
            dhr,
            keys: vec![(n, kdf::kdf_ck(ck).unwrap())],
        };
        store_skipped_chains(&mut conn, id, &[chain(0, &mut ck)]).await.unwrap();
        bump_received(&mut conn, id).await.unwrap();
        bump_received(&mut conn, id).await.unwrap();

        let received: i64 = sqlx::query_scalar("SELECT received FROM dr_msk_dhr")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(received, 2);

        store_skipped_chains(&mut conn, id, &[chain(4, &mut ck)]).await.unwrap();
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT received FROM dr_msk_dhr")
            .fetch_all(&mut *conn)
            .await
            .unwrap();
        assert_eq!(rows, vec![(0,)]);
    }
}
