//! Local users: one row per local device identity.

use lime_crypto::{CurveId, IdentityKeyPair};
use sqlx::SqliteConnection;

use crate::{error::StoreError, models::LocalUserRow};

/// Set in `curve_id` while the key server has not acknowledged registration.
pub const INACTIVE_USER_BIT: i64 = 0x0100;

/// A local device identity loaded from storage.
pub struct LocalUser {
    pub uid: i64,
    pub device_id: String,
    pub curve: CurveId,
    pub server_url: String,
    pub active: bool,
    pub identity: IdentityKeyPair,
}

impl LocalUser {
    fn from_row(row: LocalUserRow) -> Result<Self, StoreError> {
        let curve = u8::try_from(row.curve_id & 0xFF)
            .map_err(|_| StoreError::Corrupt(format!("curve id {}", row.curve_id)))?;
        Ok(Self {
            uid: row.uid,
            curve: CurveId::try_from(curve)?,
            active: row.curve_id & INACTIVE_USER_BIT == 0,
            identity: IdentityKeyPair::from_stored(&row.ik)?,
            device_id: row.user_id,
            server_url: row.server,
        })
    }
}

impl std::fmt::Debug for LocalUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalUser")
            .field("uid", &self.uid)
            .field("device_id", &self.device_id)
            .field("curve", &self.curve)
            .field("server_url", &self.server_url)
            .field("active", &self.active)
            .field("ik", &self.identity.fingerprint())
            .finish()
    }
}

const SELECT_USER: &str = "SELECT uid, user_id, ik, server, curve_id FROM lime_local_users";

/// Insert a new user, inactive until [`activate_user`] runs.
pub async fn insert_local_user(
    conn: &mut SqliteConnection,
    device_id: &str,
    server_url: &str,
    curve: CurveId,
    identity: &IdentityKeyPair,
) -> Result<i64, StoreError> {
    let ik = identity.to_stored();
    let res = sqlx::query(
        "INSERT INTO lime_local_users (user_id, ik, server, curve_id) VALUES (?, ?, ?, ?)",
    )
    .bind(device_id)
    .bind(ik.as_slice())
    .bind(server_url)
    .bind(i64::from(curve.as_u8()) | INACTIVE_USER_BIT)
    .execute(&mut *conn)
    .await;

    match res {
        Ok(done) => Ok(done.last_insert_rowid()),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            Err(StoreError::UserAlreadyExists(device_id.to_owned()))
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn find_local_user(
    conn: &mut SqliteConnection,
    device_id: &str,
) -> Result<Option<LocalUser>, StoreError> {
    let row: Option<LocalUserRow> =
        sqlx::query_as(&format!("{SELECT_USER} WHERE user_id = ?"))
            .bind(device_id)
            .fetch_optional(&mut *conn)
            .await?;
    row.map(LocalUser::from_row).transpose()
}

/// Load a user, active or not. A missing row is `NotFound`, distinct from
/// a storage failure.
pub async fn load_local_user(
    conn: &mut SqliteConnection,
    device_id: &str,
) -> Result<LocalUser, StoreError> {
    find_local_user(conn, device_id)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("local user {device_id}")))
}

/// Like [`load_local_user`] but refuses users whose registration never completed.
pub async fn load_active_user(
    conn: &mut SqliteConnection,
    device_id: &str,
) -> Result<LocalUser, StoreError> {
    let user = load_local_user(conn, device_id).await?;
    if !user.active {
        return Err(StoreError::UserInactive(device_id.to_owned()));
    }
    Ok(user)
}

pub async fn activate_user(conn: &mut SqliteConnection, uid: i64) -> Result<(), StoreError> {
    let res = sqlx::query("UPDATE lime_local_users SET curve_id = curve_id & ? WHERE uid = ?")
        .bind(!INACTIVE_USER_BIT)
        .bind(uid)
        .execute(&mut *conn)
        .await?;
    if res.rows_affected() == 0 {
        return Err(StoreError::NotFound(format!("local user uid {uid}")));
    }
    Ok(())
}

/// Delete a user by row id; sessions, SPks and OPks cascade.
pub async fn delete_local_user(conn: &mut SqliteConnection, uid: i64) -> Result<bool, StoreError> {
    let res = sqlx::query("DELETE FROM lime_local_users WHERE uid = ?")
        .bind(uid)
        .execute(&mut *conn)
        .await?;
    Ok(res.rows_affected() > 0)
}

/// Every active local user.
pub async fn local_users(conn: &mut SqliteConnection) -> Result<Vec<LocalUser>, StoreError> {
    let rows: Vec<LocalUserRow> =
        sqlx::query_as(&format!("{SELECT_USER} WHERE curve_id & ? = 0 ORDER BY uid"))
            .bind(INACTIVE_USER_BIT)
            .fetch_all(&mut *conn)
            .await?;
    rows.into_iter().map(LocalUser::from_row).collect()
}

pub async fn set_server_url(
    conn: &mut SqliteConnection,
    device_id: &str,
    server_url: &str,
) -> Result<(), StoreError> {
    let res = sqlx::query("UPDATE lime_local_users SET server = ? WHERE user_id = ?")
        .bind(server_url)
        .bind(device_id)
        .execute(&mut *conn)
        .await?;
    if res.rows_affected() == 0 {
        return Err(StoreError::NotFound(format!("local user {device_id}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_store;

    #[tokio::test]
    async fn users_are_inserted_inactive_then_activated() {
        let (store, _dir) = temp_store().await;
        let mut conn = store.acquire().await.unwrap();
        let ik = IdentityKeyPair::generate();

        let uid = insert_local_user(&mut conn, "alice.1", "https://x3dh", CurveId::C25519, &ik)
            .await
            .unwrap();
        assert!(matches!(
            load_active_user(&mut conn, "alice.1").await,
            Err(StoreError::UserInactive(_))
        ));
        assert!(local_users(&mut conn).await.unwrap().is_empty());

        activate_user(&mut conn, uid).await.unwrap();
        let user = load_active_user(&mut conn, "alice.1").await.unwrap();
        assert_eq!(user.uid, uid);
        assert_eq!(user.curve, CurveId::C25519);
        assert_eq!(user.identity.public(), ik.public());
        assert_eq!(local_users(&mut conn).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_and_missing_users_are_distinct_errors() {
        let (store, _dir) = temp_store().await;
        let mut conn = store.acquire().await.unwrap();
        let ik = IdentityKeyPair::generate();
        insert_local_user(&mut conn, "alice.1", "url", CurveId::C25519, &ik).await.unwrap();

        assert!(matches!(
            insert_local_user(&mut conn, "alice.1", "url", CurveId::C25519, &ik).await,
            Err(StoreError::UserAlreadyExists(_))
        ));
        assert!(matches!(
            load_local_user(&mut conn, "nobody").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(find_local_user(&mut conn, "nobody").await.unwrap().is_none());
        assert!(find_local_user(&mut conn, "alice.1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn server_url_roundtrip_and_delete() {
        let (store, _dir) = temp_store().await;
        let mut conn = store.acquire().await.unwrap();
        let ik = IdentityKeyPair::generate();
        let uid =
            insert_local_user(&mut conn, "alice.1", "old", CurveId::C25519, &ik).await.unwrap();

        set_server_url(&mut conn, "alice.1", "new").await.unwrap();
        assert_eq!(load_local_user(&mut conn, "alice.1").await.unwrap().server_url, "new");
        assert!(set_server_url(&mut conn, "bob.1", "x").await.is_err());

        assert!(delete_local_user(&mut conn, uid).await.unwrap());
        assert!(!delete_local_user(&mut conn, uid).await.unwrap());
        assert!(find_local_user(&mut conn, "alice.1").await.unwrap().is_none());
    }
}
