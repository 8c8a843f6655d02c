//! Periodic sweeps over every local user.

use sqlx::SqliteConnection;

use crate::error::StoreError;

/// Delete sessions stale for more than `limbo_days`, and skipped-key chains
/// that saw more than `max_received` messages since they were stored.
pub async fn clean_dr_sessions(
    conn: &mut SqliteConnection,
    limbo_days: u32,
    max_received: u32,
) -> Result<(), StoreError> {
    let sessions = sqlx::query(
        "DELETE FROM dr_sessions WHERE status = 0 \
         AND time_stamp < datetime('now', '-' || ? || ' day')",
    )
    .bind(i64::from(limbo_days))
    .execute(&mut *conn)
    .await?
    .rows_affected();

    // message keys cascade with their chain
    let chains = sqlx::query("DELETE FROM dr_msk_dhr WHERE received > ?")
        .bind(i64::from(max_received))
        .execute(&mut *conn)
        .await?
        .rows_affected();

    tracing::debug!("[store] cleanup: {sessions} stale sessions, {chains} skipped-key chains");
    Ok(())
}

/// Delete SPks stale for more than `limbo_days`.
pub async fn clean_spk(conn: &mut SqliteConnection, limbo_days: u32) -> Result<(), StoreError> {
    let n = sqlx::query(
        "DELETE FROM x3dh_spk WHERE status = 0 \
         AND time_stamp < datetime('now', '-' || ? || ' day')",
    )
    .bind(i64::from(limbo_days))
    .execute(&mut *conn)
    .await?
    .rows_affected();
    tracing::debug!("[store] cleanup: {n} stale SPks");
    Ok(())
}
