//! One local device: its identity, its cache of double ratchet sessions and
//! every operation that needs them.
//!
//! All operations of a device run under its `tokio::sync::Mutex`, which
//! hands the lock out in FIFO order. An encryption waiting there while
//! another one fetches key bundles finds the sessions that fetch built once
//! it gets the lock, so concurrent encryptions to a new device trigger a
//! single key server request.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use lime_crypto::{curve::CurveSuite, CurveId, DhKeyPair};
use lime_proto::{dr, X3dhErrorCode};
use lime_store::{peers, prekeys, sessions, users, LocalUser, PeerDeviceStatus, Store, StoreError};
use serde::{Deserialize, Serialize};
use sqlx::{Sqlite, Transaction};
use tokio::sync::{Mutex, MutexGuard};
use zeroize::Zeroizing;

use crate::{
    double_ratchet::{
        decrypt_from_candidates, encrypt_for_recipients, CandidateOutcome, DrSession,
        EncryptionPolicy, RecipientSession,
    },
    error::LimeError,
    settings::LimeSettings,
    transport::X3dhTransport,
    x3dh_client::{init_receiver_session, init_sender_session, X3dhClient},
};

/// Per recipient device result of an encryption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientData {
    pub device_id: String,
    /// Trust status known before this encryption; `Fail` when no session
    /// could be established, `Unknown` for a device met for the first time.
    pub peer_status: PeerDeviceStatus,
    /// Empty when `peer_status` is `Fail`.
    pub dr_message: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptOutput {
    pub recipients: Vec<RecipientData>,
    /// Shared by every recipient; empty when the payload went in the DR messages.
    pub cipher_message: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decrypted {
    /// Sender status as known before this message, or `Fail`.
    pub status: PeerDeviceStatus,
    /// Empty on failure.
    pub plaintext: Vec<u8>,
}

impl Decrypted {
    fn failed() -> Self {
        Self { status: PeerDeviceStatus::Fail, plaintext: Vec::new() }
    }

    pub fn is_ok(&self) -> bool {
        self.status != PeerDeviceStatus::Fail
    }
}

/// What the manager shares with every loaded user.
pub(crate) struct Context {
    pub(crate) store: Store,
    pub(crate) transport: Arc<dyn X3dhTransport>,
    pub(crate) settings: LimeSettings,
    /// Held by every transaction that writes; SQLite has a single writer.
    write_lock: Mutex<()>,
}

impl Context {
    pub(crate) fn new(
        store: Store,
        transport: Arc<dyn X3dhTransport>,
        settings: LimeSettings,
    ) -> Self {
        Self { store, transport, settings, write_lock: Mutex::new(()) }
    }

    /// Begin a transaction that is going to write.
    pub(crate) async fn write(
        &self,
    ) -> Result<(MutexGuard<'_, ()>, Transaction<'static, Sqlite>), LimeError> {
        let guard = self.write_lock.lock().await;
        let tx = self.store.begin().await?;
        Ok((guard, tx))
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.settings.request_timeout_secs)
    }
}

struct UserState {
    local: LocalUser,
    /// Active session per peer device.
    sessions: HashMap<String, DrSession>,
}

pub struct LimeUser {
    device_id: String,
    ctx: Arc<Context>,
    inner: Mutex<UserState>,
}

fn unknown_user(device_id: &str) -> impl FnOnce(StoreError) -> LimeError + '_ {
    move |e| match e {
        StoreError::NotFound(_) | StoreError::UserInactive(_) => {
            LimeError::UnknownUser(device_id.to_owned())
        }
        other => other.into(),
    }
}

fn suite(curve: CurveId) -> Result<&'static CurveSuite, LimeError> {
    lime_crypto::curve::suite(curve).map_err(|_| LimeError::UnsupportedCurve(curve))
}

fn opk_publics(opks: &[DhKeyPair], ids: &[u32]) -> Vec<([u8; 32], u32)> {
    opks.iter().zip(ids).map(|(opk, id)| (*opk.public(), *id)).collect()
}

impl LimeUser {
    fn client<'a>(&'a self, state: &'a UserState) -> X3dhClient<'a> {
        X3dhClient::new(
            self.ctx.transport.as_ref(),
            &state.local.server_url,
            &self.device_id,
            state.local.curve,
            self.ctx.timeout(),
        )
    }

    /// Load a registered user from storage.
    pub(crate) async fn load(ctx: Arc<Context>, device_id: &str) -> Result<Self, LimeError> {
        let mut conn = ctx.store.acquire().await?;
        let local =
            users::load_active_user(&mut conn, device_id).await.map_err(unknown_user(device_id))?;
        suite(local.curve)?;
        drop(conn);
        tracing::debug!("[lime] loaded local user {device_id}");
        Ok(Self {
            device_id: device_id.to_owned(),
            ctx,
            inner: Mutex::new(UserState { local, sessions: HashMap::new() }),
        })
    }

    /// Create a user and register it on the key server.
    ///
    /// A user left inactive by a registration that never completed is
    /// published again with the keys it already has. When the server does
    /// not acknowledge a user this call inserted, the row is deleted before
    /// the error is returned; a republished row stays inactive for a retry.
    ///
    /// The caller serializes creations of one device id.
    pub(crate) async fn create(
        ctx: Arc<Context>,
        device_id: &str,
        server_url: &str,
        curve: CurveId,
        opk_initial_batch: u16,
    ) -> Result<Self, LimeError> {
        let suite = suite(curve)?;

        let (write, mut tx) = ctx.write().await?;
        let existing = users::find_local_user(&mut tx, device_id).await?;
        let (uid, inserted, spk_id, spk, opks) = match existing {
            Some(existing) if existing.active || existing.curve != curve => {
                return Err(LimeError::UserAlreadyExists(device_id.to_owned()));
            }
            Some(existing) => {
                tracing::info!(
                    "[lime] {device_id} was never acknowledged by the key server, publishing again"
                );
                users::set_server_url(&mut tx, device_id, server_url).await?;
                let uid = existing.uid;
                let (spk_id, spk) = match prekeys::current_spk(&mut tx, uid).await? {
                    Some(current) => current,
                    None => {
                        let spk = (suite.generate_dh)();
                        (prekeys::insert_spk(&mut tx, uid, &spk).await?, spk)
                    }
                };
                let mut opks = prekeys::published_opks(&mut tx, uid).await?;
                if opks.is_empty() {
                    let fresh = suite.generate_dh_batch(usize::from(opk_initial_batch));
                    let ids = prekeys::insert_opks(&mut tx, uid, &fresh).await?;
                    opks = ids.into_iter().zip(fresh.iter().map(|k| *k.public())).collect();
                }
                let opks = opks.into_iter().map(|(id, opk)| (opk, id)).collect::<Vec<_>>();
                (uid, false, spk_id, spk, opks)
            }
            None => {
                let identity = (suite.generate_identity)();
                let uid = users::insert_local_user(&mut tx, device_id, server_url, curve, &identity)
                    .await?;
                let spk = (suite.generate_dh)();
                let spk_id = prekeys::insert_spk(&mut tx, uid, &spk).await?;
                let fresh = suite.generate_dh_batch(usize::from(opk_initial_batch));
                let ids = prekeys::insert_opks(&mut tx, uid, &fresh).await?;
                (uid, true, spk_id, spk, opk_publics(&fresh, &ids))
            }
        };
        let mut local = users::load_local_user(&mut tx, device_id).await?;
        tx.commit().await?;
        drop(write);

        let client =
            X3dhClient::new(ctx.transport.as_ref(), server_url, device_id, curve, ctx.timeout());
        if let Err(e) = client.register_user(&local.identity, &spk, spk_id, opks).await {
            if inserted {
                tracing::warn!(
                    "[lime] registration of {device_id} failed, removing it locally: {e}"
                );
                let (_write, mut tx) = ctx.write().await?;
                users::delete_local_user(&mut tx, uid).await?;
                tx.commit().await?;
            } else {
                tracing::warn!(
                    "[lime] {device_id} is still not acknowledged by the key server: {e}"
                );
            }
            return Err(e);
        }

        {
            let (_write, mut tx) = ctx.write().await?;
            users::activate_user(&mut tx, uid).await?;
            tx.commit().await?;
        }
        local.active = true;

        tracing::info!("[lime] created user {device_id} on {server_url} ({curve})");
        Ok(Self {
            device_id: device_id.to_owned(),
            ctx,
            inner: Mutex::new(UserState { local, sessions: HashMap::new() }),
        })
    }

    /// Ask the key server to forget this device, then purge it locally.
    pub(crate) async fn delete(&self) -> Result<(), LimeError> {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        let answer = self.client(state).delete_user().await;
        match answer {
            Ok(()) => {}
            Err(LimeError::Server { code: X3dhErrorCode::UserNotFound, .. }) => {
                tracing::warn!(
                    "[lime] key server did not know {}, deleting locally anyway",
                    self.device_id
                );
            }
            Err(e) => return Err(e),
        }

        let (_write, mut tx) = self.ctx.write().await?;
        users::delete_local_user(&mut tx, state.local.uid).await?;
        tx.commit().await?;
        state.sessions.clear();
        tracing::info!("[lime] deleted user {}", self.device_id);
        Ok(())
    }

    pub(crate) async fn identity_key(&self) -> [u8; 32] {
        *self.inner.lock().await.local.identity.public()
    }

    pub(crate) async fn server_url(&self) -> String {
        self.inner.lock().await.local.server_url.clone()
    }

    pub(crate) async fn set_server_url(&self, url: &str) -> Result<(), LimeError> {
        let mut state = self.inner.lock().await;
        let (_write, mut tx) = self.ctx.write().await?;
        users::set_server_url(&mut tx, &self.device_id, url).await?;
        tx.commit().await?;
        state.local.server_url = url.to_owned();
        Ok(())
    }

    /// Drop the cached session with a peer, if any.
    pub(crate) async fn evict_session(&self, peer_device_id: &str) {
        self.inner.lock().await.sessions.remove(peer_device_id);
    }

    /// Make every session with `peer_device_id` stale: the next encryption
    /// to it runs a new X3DH.
    pub(crate) async fn stale_sessions(&self, peer_device_id: &str) -> Result<(), LimeError> {
        let mut state = self.inner.lock().await;
        let (_write, mut tx) = self.ctx.write().await?;
        sessions::stale_sessions_with(&mut tx, state.local.uid, peer_device_id).await?;
        tx.commit().await?;
        state.sessions.remove(peer_device_id);
        Ok(())
    }

    // ── Encrypt ──────────────────────────────────────────────────────────

    pub(crate) async fn encrypt(
        &self,
        recipient_user_id: &[u8],
        recipients: &[String],
        plaintext: &[u8],
        policy: EncryptionPolicy,
    ) -> Result<EncryptOutput, LimeError> {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        let (uid, curve) = (state.local.uid, state.local.curve);
        tracing::info!("[lime] encrypt from {} to {} devices", self.device_id, recipients.len());

        let mut seen = HashSet::new();
        let wanted: Vec<&String> =
            recipients.iter().filter(|id| seen.insert(id.as_str())).collect();

        let mut conn = self.ctx.store.acquire().await?;
        let mut statuses = HashMap::new();
        let mut missing = Vec::new();
        for id in &wanted {
            statuses.insert(id.as_str(), peers::get_peer_status(&mut conn, id).await?);

            if state.sessions.get(id.as_str()).is_some_and(|s| !s.is_active()) {
                state.sessions.remove(id.as_str());
            }
            if state.sessions.contains_key(id.as_str()) {
                continue;
            }
            match sessions::active_session_id(&mut conn, uid, id).await? {
                Some(session_id) => {
                    let stored = sessions::load_session(&mut conn, session_id, curve).await?;
                    state.sessions.insert((*id).clone(), DrSession::load(stored, id));
                }
                None => missing.push((*id).clone()),
            }
        }
        drop(conn);

        if !missing.is_empty() {
            self.establish_sessions(state, &missing).await?;
        }

        let mut to_encrypt: Vec<RecipientSession> = wanted
            .iter()
            .filter_map(|id| {
                state.sessions.remove(id.as_str()).map(|session| RecipientSession {
                    device_id: (*id).clone(),
                    session,
                    dr_message: Vec::new(),
                })
            })
            .collect();
        if to_encrypt.is_empty() {
            tracing::warn!("[lime] {}: no recipient has a session", self.device_id);
            return Err(LimeError::AllRecipientsFailed);
        }

        // a failure drops the sessions taken out of the cache: they reload from storage
        let (write, mut tx) = self.ctx.write().await?;
        let cipher_message = encrypt_for_recipients(
            &mut tx,
            &mut to_encrypt,
            plaintext,
            recipient_user_id,
            &self.device_id,
            policy,
            self.ctx.settings.max_sending_chain,
        )
        .await?;
        tx.commit().await?;
        drop(write);

        let mut messages = HashMap::with_capacity(to_encrypt.len());
        for RecipientSession { device_id, session, dr_message } in to_encrypt {
            messages.insert(device_id.clone(), dr_message);
            state.sessions.insert(device_id, session);
        }

        let recipients = recipients
            .iter()
            .map(|id| match messages.get(id) {
                Some(dr_message) => RecipientData {
                    device_id: id.clone(),
                    peer_status: statuses
                        .get(id.as_str())
                        .copied()
                        .unwrap_or(PeerDeviceStatus::Unknown),
                    dr_message: dr_message.clone(),
                },
                None => RecipientData {
                    device_id: id.clone(),
                    peer_status: PeerDeviceStatus::Fail,
                    dr_message: Vec::new(),
                },
            })
            .collect();
        Ok(EncryptOutput { recipients, cipher_message })
    }

    /// Fetch bundles for every device in `missing` in one request and cache
    /// a sender session for each usable one. Devices left without a session
    /// fail on their own; only storage failures abort the whole encryption.
    async fn establish_sessions(
        &self,
        state: &mut UserState,
        missing: &[String],
    ) -> Result<(), LimeError> {
        tracing::info!(
            "[lime] {} fetches key bundles for {} devices",
            self.device_id,
            missing.len()
        );
        let bundles = match self.client(state).get_peer_bundles(missing).await {
            Ok(bundles) => bundles,
            Err(e) => {
                tracing::warn!("[lime] key bundle request of {} failed: {e}", self.device_id);
                return Ok(());
            }
        };

        let mut conn = self.ctx.store.acquire().await?;
        for peer in bundles {
            if !missing.contains(&peer.device_id) {
                tracing::warn!(
                    "[lime] key server sent an unrequested bundle for {}",
                    peer.device_id
                );
                continue;
            }
            let Some(bundle) = peer.bundle else {
                tracing::warn!("[lime] key server has no bundle for {}", peer.device_id);
                continue;
            };
            match init_sender_session(&mut conn, &state.local, &peer.device_id, &bundle).await {
                Ok(session) => {
                    state.sessions.insert(peer.device_id, session);
                }
                Err(e) if e.is_storage_failure() => return Err(e),
                Err(e) => tracing::warn!("[lime] no session with {}: {e}", peer.device_id),
            }
        }
        Ok(())
    }

    // ── Decrypt ──────────────────────────────────────────────────────────

    /// Try the cached session, then every stored session with the sender,
    /// then a new session from the X3DH init the message may carry.
    pub(crate) async fn decrypt(
        &self,
        recipient_user_id: &[u8],
        sender_device_id: &str,
        dr_message: &[u8],
        cipher_message: &[u8],
    ) -> Result<Decrypted, LimeError> {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        let (uid, curve) = (state.local.uid, state.local.curve);
        let max_skip = self.ctx.settings.max_message_skip;
        tracing::info!("[lime] {} decrypts from {sender_device_id}", self.device_id);

        let (_write, mut tx) = self.ctx.write().await?;
        let status = peers::get_peer_status(&mut tx, sender_device_id).await?;

        let mut tried = None;
        if let Some(session) = state.sessions.remove(sender_device_id) {
            tried = session.session_id();
            let mut candidates = vec![session];
            match decrypt_from_candidates(
                &mut tx,
                &mut candidates,
                sender_device_id,
                &self.device_id,
                recipient_user_id,
                dr_message,
                cipher_message,
                max_skip,
            )
            .await?
            {
                CandidateOutcome::Decrypted { index, plaintext } => {
                    let session = candidates.swap_remove(index);
                    return Self::keep(tx, state, session, status, plaintext).await;
                }
                CandidateOutcome::BodyRejected => return Ok(Decrypted::failed()),
                CandidateOutcome::NoMatch => {}
            }
        }

        let ids = sessions::session_ids_for_peer(&mut tx, uid, sender_device_id, tried).await?;
        let mut candidates = Vec::with_capacity(ids.len());
        for id in ids {
            let stored = sessions::load_session(&mut tx, id, curve).await?;
            candidates.push(DrSession::load(stored, sender_device_id));
        }
        tracing::debug!(
            "[lime] {} has {} stored sessions with {sender_device_id}",
            self.device_id,
            candidates.len()
        );
        match decrypt_from_candidates(
            &mut tx,
            &mut candidates,
            sender_device_id,
            &self.device_id,
            recipient_user_id,
            dr_message,
            cipher_message,
            max_skip,
        )
        .await?
        {
            CandidateOutcome::Decrypted { index, plaintext } => {
                let session = candidates.swap_remove(index);
                return Self::keep(tx, state, session, status, plaintext).await;
            }
            CandidateOutcome::BodyRejected => return Ok(Decrypted::failed()),
            CandidateOutcome::NoMatch => {}
        }

        let init = match dr::x3dh_init_of(dr_message, curve) {
            Ok(Some(init)) => init,
            Ok(None) => {
                tracing::warn!(
                    "[lime] no session decrypts and no X3DH init came from {sender_device_id}"
                );
                return Ok(Decrypted::failed());
            }
            Err(e) => {
                tracing::warn!("[lime] unreadable DR message from {sender_device_id}: {e}");
                return Ok(Decrypted::failed());
            }
        };
        let built = init_receiver_session(&mut tx, &state.local, sender_device_id, &init).await;
        let session = match built {
            Ok(session) => session,
            Err(e) if e.is_storage_failure() => return Err(e),
            Err(e) => {
                tracing::warn!(
                    "[lime] cannot build a session from the X3DH init of {sender_device_id}: {e}"
                );
                return Ok(Decrypted::failed());
            }
        };

        let mut candidates = vec![session];
        match decrypt_from_candidates(
            &mut tx,
            &mut candidates,
            sender_device_id,
            &self.device_id,
            recipient_user_id,
            dr_message,
            cipher_message,
            max_skip,
        )
        .await?
        {
            CandidateOutcome::Decrypted { index, plaintext } => {
                Self::keep(tx, state, candidates.swap_remove(index), status, plaintext).await
            }
            _ => {
                tracing::warn!(
                    "[lime] new session from {sender_device_id} does not decrypt its first message"
                );
                Ok(Decrypted::failed())
            }
        }
    }

    /// Commit a successful decryption and cache the session that did it.
    async fn keep(
        tx: Transaction<'static, Sqlite>,
        state: &mut UserState,
        session: DrSession,
        status: PeerDeviceStatus,
        mut plaintext: Zeroizing<Vec<u8>>,
    ) -> Result<Decrypted, LimeError> {
        tx.commit().await?;
        state.sessions.insert(session.peer_device_id().to_owned(), session);
        Ok(Decrypted { status, plaintext: std::mem::take(&mut *plaintext) })
    }

    // ── Maintenance ──────────────────────────────────────────────────────

    /// Keep the key server stocked with OPks and rotate the SPk when due.
    pub(crate) async fn update(
        &self,
        opk_server_low_limit: u16,
        opk_batch_size: u16,
    ) -> Result<(), LimeError> {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        self.update_opks(state, opk_server_low_limit.max(1), opk_batch_size).await?;
        self.update_spk(state).await
    }

    async fn update_opks(
        &self,
        state: &mut UserState,
        low_limit: u16,
        batch: u16,
    ) -> Result<(), LimeError> {
        let uid = state.local.uid;
        let answer = self.client(state).get_self_opks().await;
        let server_ids = match answer {
            Ok(ids) => ids,
            Err(LimeError::Server { code: X3dhErrorCode::UserNotFound, .. }) => {
                tracing::warn!("[lime] key server lost {}, publishing it again", self.device_id);
                return self.republish(state, batch).await;
            }
            Err(e) => return Err(e),
        };

        {
            let (_write, mut tx) = self.ctx.write().await?;
            let limbo_days = self.ctx.settings.opk_limbo_days;
            prekeys::update_opk_status(&mut tx, uid, &server_ids, limbo_days).await?;
            tx.commit().await?;
        }

        let on_server = server_ids.len();
        if on_server >= usize::from(low_limit) {
            tracing::debug!("[lime] {} has {on_server} OPks on the key server", self.device_id);
            return Ok(());
        }
        let count = usize::from(batch).max(usize::from(low_limit) - on_server);
        let opks = suite(state.local.curve)?.generate_dh_batch(count);
        let ids = self.store_opks(uid, &opks).await?;
        if let Err(e) = self.client(state).post_opks(opk_publics(&opks, &ids)).await {
            self.drop_opks(uid, &ids).await?;
            return Err(e);
        }
        tracing::info!(
            "[lime] {} published {count} OPks ({on_server} left on the server)",
            self.device_id
        );
        Ok(())
    }

    async fn update_spk(&self, state: &mut UserState) -> Result<(), LimeError> {
        let uid = state.local.uid;
        let mut conn = self.ctx.store.acquire().await?;
        let lifetime_days = self.ctx.settings.spk_lifetime_days;
        if prekeys::is_current_spk_valid(&mut conn, uid, lifetime_days).await? {
            return Ok(());
        }
        drop(conn);

        let spk = (suite(state.local.curve)?.generate_dh)();
        let spk_id = {
            let (_write, mut tx) = self.ctx.write().await?;
            let id = prekeys::insert_spk(&mut tx, uid, &spk).await?;
            tx.commit().await?;
            id
        };
        if let Err(e) = self.client(state).post_spk(&state.local.identity, &spk, spk_id).await {
            let (_write, mut tx) = self.ctx.write().await?;
            prekeys::delete_spk(&mut tx, uid, spk_id).await?;
            tx.commit().await?;
            return Err(e);
        }
        tracing::info!("[lime] {} rotated its SPk to {spk_id:#010x}", self.device_id);
        Ok(())
    }

    /// Register again a user the key server forgot: previously published
    /// OPks are considered dispatched and a fresh batch goes up.
    async fn republish(&self, state: &mut UserState, batch: u16) -> Result<(), LimeError> {
        let uid = state.local.uid;
        let suite = suite(state.local.curve)?;
        let opks = suite.generate_dh_batch(usize::from(batch));
        let (spk_id, spk, ids) = {
            let (_write, mut tx) = self.ctx.write().await?;
            prekeys::set_all_opks_dispatched(&mut tx, uid).await?;
            let (spk_id, spk) = match prekeys::current_spk(&mut tx, uid).await? {
                Some(current) => current,
                None => {
                    let spk = (suite.generate_dh)();
                    (prekeys::insert_spk(&mut tx, uid, &spk).await?, spk)
                }
            };
            let ids = prekeys::insert_opks(&mut tx, uid, &opks).await?;
            tx.commit().await?;
            (spk_id, spk, ids)
        };
        self.client(state)
            .register_user(&state.local.identity, &spk, spk_id, opk_publics(&opks, &ids))
            .await?;
        tracing::info!("[lime] {} published again with {} OPks", self.device_id, ids.len());
        Ok(())
    }

    async fn store_opks(&self, uid: i64, opks: &[DhKeyPair]) -> Result<Vec<u32>, LimeError> {
        let (_write, mut tx) = self.ctx.write().await?;
        let ids = prekeys::insert_opks(&mut tx, uid, opks).await?;
        tx.commit().await?;
        Ok(ids)
    }

    async fn drop_opks(&self, uid: i64, ids: &[u32]) -> Result<(), LimeError> {
        let (_write, mut tx) = self.ctx.write().await?;
        for id in ids {
            prekeys::delete_opk(&mut tx, uid, *id).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

impl std::fmt::Debug for LimeUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimeUser").field("device_id", &self.device_id).finish_non_exhaustive()
    }
}
