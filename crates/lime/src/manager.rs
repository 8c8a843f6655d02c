//! Entry point of the session core: owns the store, the transport and the
//! cache of loaded local users.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::Arc,
};

use lime_crypto::CurveId;
use lime_store::{cleanup, peers, sessions, PeerDeviceStatus, SessionSummary, Store};
use parking_lot::Mutex;

use crate::{
    double_ratchet::EncryptionPolicy,
    error::LimeError,
    settings::LimeSettings,
    transport::X3dhTransport,
    user::{Context, Decrypted, EncryptOutput, LimeUser},
};

/// Manages every local device stored in one database.
///
/// Cheap to share behind an `Arc`: operations on different local users run
/// concurrently, operations on one user are queued in call order.
pub struct LimeManager {
    ctx: Arc<Context>,
    users: Mutex<HashMap<String, Arc<LimeUser>>>,
    /// Device ids whose creation is in flight.
    creating: Mutex<HashSet<String>>,
}

/// Releases a device id reserved by `create_user`, also when the creation
/// future is dropped halfway.
struct PendingCreation<'a> {
    creating: &'a Mutex<HashSet<String>>,
    device_id: &'a str,
}

impl Drop for PendingCreation<'_> {
    fn drop(&mut self) {
        self.creating.lock().remove(self.device_id);
    }
}

impl LimeManager {
    pub fn new(
        store: Store,
        transport: Arc<dyn X3dhTransport>,
        settings: LimeSettings,
    ) -> Result<Self, LimeError> {
        settings.validate()?;
        Ok(Self {
            ctx: Arc::new(Context::new(store, transport, settings)),
            users: Mutex::new(HashMap::new()),
            creating: Mutex::new(HashSet::new()),
        })
    }

    /// Open (or create) the database at `db_path` with default settings.
    pub async fn open(
        db_path: &Path,
        transport: Arc<dyn X3dhTransport>,
    ) -> Result<Self, LimeError> {
        let store = Store::open(db_path).await?;
        Self::new(store, transport, LimeSettings::default())
    }

    pub fn settings(&self) -> &LimeSettings {
        &self.ctx.settings
    }

    async fn load_user(&self, device_id: &str) -> Result<Arc<LimeUser>, LimeError> {
        let cached = self.users.lock().get(device_id).cloned();
        if let Some(user) = cached {
            return Ok(user);
        }
        let user = Arc::new(LimeUser::load(self.ctx.clone(), device_id).await?);
        // another task may have loaded it meanwhile: keep the first one
        Ok(self.users.lock().entry(device_id.to_owned()).or_insert(user).clone())
    }

    /// Create a local device and publish its keys with `opk_initial_batch` OPks.
    ///
    /// Fails with `UserAlreadyExists` when the device is loaded or another
    /// creation of it is still running.
    pub async fn create_user(
        &self,
        device_id: &str,
        server_url: &str,
        curve: CurveId,
        opk_initial_batch: u16,
    ) -> Result<(), LimeError> {
        let _pending = {
            let users = self.users.lock();
            let mut creating = self.creating.lock();
            if users.contains_key(device_id) || !creating.insert(device_id.to_owned()) {
                return Err(LimeError::UserAlreadyExists(device_id.to_owned()));
            }
            PendingCreation { creating: &self.creating, device_id }
        };
        let user =
            LimeUser::create(self.ctx.clone(), device_id, server_url, curve, opk_initial_batch)
                .await?;
        // cached before the reservation is released
        self.users.lock().insert(device_id.to_owned(), Arc::new(user));
        Ok(())
    }

    /// Delete a local device from the key server and from storage.
    pub async fn delete_user(&self, device_id: &str) -> Result<(), LimeError> {
        let user = self.load_user(device_id).await?;
        let res = user.delete().await;
        self.users.lock().remove(device_id);
        res
    }

    /// True when `device_id` is a registered local device.
    pub async fn is_user(&self, device_id: &str) -> Result<bool, LimeError> {
        match self.load_user(device_id).await {
            Ok(_) => Ok(true),
            Err(LimeError::UnknownUser(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Encrypt `plaintext` from `local_device_id` to every recipient device.
    ///
    /// `recipient_user_id` is bound into the associated data so a message
    /// cannot be replayed to another user. `policy` defaults to the one in
    /// the settings. Fails only when no recipient could be encrypted to.
    pub async fn encrypt(
        &self,
        local_device_id: &str,
        recipient_user_id: &[u8],
        recipients: &[String],
        plaintext: &[u8],
        policy: Option<EncryptionPolicy>,
    ) -> Result<EncryptOutput, LimeError> {
        let user = self.load_user(local_device_id).await?;
        let policy = policy.unwrap_or(self.ctx.settings.default_policy);
        user.encrypt(recipient_user_id, recipients, plaintext, policy).await
    }

    /// Decrypt a message. Failures to decrypt are reported through
    /// `Decrypted::status`; `Err` means the local user or storage is unusable.
    pub async fn decrypt(
        &self,
        local_device_id: &str,
        recipient_user_id: &[u8],
        sender_device_id: &str,
        dr_message: &[u8],
        cipher_message: &[u8],
    ) -> Result<Decrypted, LimeError> {
        let user = self.load_user(local_device_id).await?;
        user.decrypt(recipient_user_id, sender_device_id, dr_message, cipher_message).await
    }

    /// Daily maintenance: purge expired sessions and keys, then for every
    /// local user reconcile OPks with the key server and rotate the SPk.
    ///
    /// Every user is processed; the first error met is returned.
    pub async fn update(
        &self,
        opk_server_low_limit: u16,
        opk_batch_size: u16,
    ) -> Result<(), LimeError> {
        let settings = &self.ctx.settings;
        let locals = {
            let (_write, mut tx) = self.ctx.write().await?;
            cleanup::clean_dr_sessions(
                &mut tx,
                settings.dr_session_limbo_days,
                settings.max_messages_received_after_skip,
            )
            .await?;
            cleanup::clean_spk(&mut tx, settings.spk_limbo_days).await?;
            let locals = lime_store::users::local_users(&mut tx).await?;
            tx.commit().await?;
            locals
        };

        let mut first_err = None;
        for local in locals {
            let res = match self.load_user(&local.device_id).await {
                Ok(user) => user.update(opk_server_low_limit, opk_batch_size).await,
                Err(e) => Err(e),
            };
            if let Err(e) = res {
                tracing::warn!("[lime] update of {} failed: {e}", local.device_id);
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub async fn get_self_identity_key(&self, device_id: &str) -> Result<[u8; 32], LimeError> {
        Ok(self.load_user(device_id).await?.identity_key().await)
    }

    /// Set the trust status of a peer device. See `lime_store::peers::set_peer_status`
    /// for what each status does with `ik`.
    pub async fn set_peer_device_status(
        &self,
        peer_device_id: &str,
        ik: Option<&[u8]>,
        status: PeerDeviceStatus,
    ) -> Result<(), LimeError> {
        let (_write, mut tx) = self.ctx.write().await?;
        peers::set_peer_status(&mut tx, peer_device_id, ik, status).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_peer_device_status(
        &self,
        peer_device_id: &str,
    ) -> Result<PeerDeviceStatus, LimeError> {
        let mut conn = self.ctx.store.acquire().await?;
        Ok(peers::get_peer_status(&mut conn, peer_device_id).await?)
    }

    /// Least trusted status of a set of devices.
    pub async fn get_peer_devices_status(
        &self,
        peer_device_ids: &[String],
    ) -> Result<PeerDeviceStatus, LimeError> {
        let mut conn = self.ctx.store.acquire().await?;
        Ok(peers::get_peer_statuses(&mut conn, peer_device_ids).await?)
    }

    /// Forget a peer device and every session with it.
    pub async fn delete_peer_device(&self, peer_device_id: &str) -> Result<(), LimeError> {
        let loaded: Vec<Arc<LimeUser>> = self.users.lock().values().cloned().collect();
        for user in loaded {
            user.evict_session(peer_device_id).await;
        }
        let (_write, mut tx) = self.ctx.write().await?;
        peers::delete_peer_device(&mut tx, peer_device_id).await?;
        tx.commit().await?;
        tracing::info!("[lime] deleted peer device {peer_device_id}");
        Ok(())
    }

    pub async fn set_x3dh_server_url(&self, device_id: &str, url: &str) -> Result<(), LimeError> {
        self.load_user(device_id).await?.set_server_url(url).await
    }

    pub async fn get_x3dh_server_url(&self, device_id: &str) -> Result<String, LimeError> {
        Ok(self.load_user(device_id).await?.server_url().await)
    }

    /// Make every session between a local user and a peer device stale.
    pub async fn stale_sessions(
        &self,
        local_device_id: &str,
        peer_device_id: &str,
    ) -> Result<(), LimeError> {
        self.load_user(local_device_id).await?.stale_sessions(peer_device_id).await
    }

    /// Sessions between a local user and a peer device, oldest first.
    pub async fn list_sessions(
        &self,
        local_device_id: &str,
        peer_device_id: &str,
    ) -> Result<Vec<SessionSummary>, LimeError> {
        let mut conn = self.ctx.store.acquire().await?;
        Ok(sessions::list_sessions(&mut conn, local_device_id, peer_device_id).await?)
    }
}

impl std::fmt::Debug for LimeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let users: Vec<String> = self.users.lock().keys().cloned().collect();
        f.debug_struct("LimeManager").field("loaded_users", &users).finish_non_exhaustive()
    }
}
