//! Double ratchet sessions bound to local storage, and the two ways of
//! carrying a payload to a set of recipients.
//!
//! A session is only written through the connection handed to it, so the
//! caller decides what one transaction covers. A ratchet step is kept in
//! memory only once it has been written: state is staged on a clone and
//! swapped in after a successful save.
//!
//! Associated data of a DR message is `given AD || shared AD || header`,
//! where the given AD is
//! - payload in the DR message: `recipient user id || source device || recipient device`
//! - payload in the cipher message: `cipher message tag || source device || recipient device`

use lime_crypto::{aead::TAG_SIZE, kdf, ratchet::RatchetState, x3dh::SHARED_AD_SIZE};
use lime_proto::DrHeader;
use lime_store::{peers, prekeys, sessions, SessionUpdate, StoredSession};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use zeroize::Zeroizing;

use crate::error::LimeError;

/// Seed carried by DR messages when the payload travels in the cipher message.
pub const RANDOM_SEED_SIZE: usize = 32;

/// Where the payload goes when encrypting to several devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionPolicy {
    /// Payload inside every DR message, no cipher message.
    DrMessage,
    /// Payload encrypted once in a shared cipher message; DR messages carry its key seed.
    CipherMessage,
    /// Whichever gives the smaller upload.
    #[default]
    OptimizeUploadSize,
    /// Whichever gives the smaller upload plus download, assuming the server
    /// forwards each recipient its own DR message only.
    OptimizeGlobalBandwidth,
}

impl EncryptionPolicy {
    /// True when the payload goes directly in the DR messages.
    pub fn payload_direct(self, recipients: usize, plaintext_len: usize) -> bool {
        let (n, len) = (recipients, plaintext_len);
        match self {
            Self::DrMessage => true,
            Self::CipherMessage => false,
            Self::OptimizeUploadSize => n * len <= len + TAG_SIZE + RANDOM_SEED_SIZE * n,
            Self::OptimizeGlobalBandwidth => {
                2 * n * len <= len + TAG_SIZE + (2 * RANDOM_SEED_SIZE + len + TAG_SIZE) * n
            }
        }
    }
}

/// Peer side of a session: a stored device row, or a device met through
/// X3DH that gets stored along with the session.
#[derive(Debug, Clone, Copy)]
enum Peer {
    Stored(i64),
    New([u8; 32]),
}

pub struct DrSession {
    session_id: Option<i64>,
    uid: i64,
    peer: Peer,
    peer_device_id: String,
    state: RatchetState,
    /// Encoded X3DH init, put in every header until the peer answers.
    x3dh_init: Option<Vec<u8>>,
    /// OPk consumed by the X3DH that built this session, deleted on first save.
    used_opk: Option<u32>,
    active: bool,
}

impl DrSession {
    /// Session started by fetching the peer's key bundle.
    pub fn new_sender(
        uid: i64,
        peer_device_id: &str,
        peer_ik: [u8; 32],
        state: RatchetState,
        x3dh_init: Vec<u8>,
    ) -> Self {
        Self {
            session_id: None,
            uid,
            peer: Peer::New(peer_ik),
            peer_device_id: peer_device_id.to_owned(),
            state,
            x3dh_init: Some(x3dh_init),
            used_opk: None,
            active: true,
        }
    }

    /// Session built from an incoming X3DH init. It reaches storage only if
    /// the message carrying the init decrypts.
    pub fn new_receiver(
        uid: i64,
        peer_device_id: &str,
        peer_ik: [u8; 32],
        state: RatchetState,
        used_opk: Option<u32>,
    ) -> Self {
        Self {
            session_id: None,
            uid,
            peer: Peer::New(peer_ik),
            peer_device_id: peer_device_id.to_owned(),
            state,
            x3dh_init: None,
            used_opk,
            active: true,
        }
    }

    pub fn load(stored: StoredSession, peer_device_id: &str) -> Self {
        Self {
            session_id: Some(stored.session_id),
            uid: stored.uid,
            peer: Peer::Stored(stored.did),
            peer_device_id: peer_device_id.to_owned(),
            state: stored.state,
            x3dh_init: stored.x3dh_init,
            used_opk: None,
            active: stored.active,
        }
    }

    pub fn session_id(&self) -> Option<i64> {
        self.session_id
    }

    pub fn peer_device_id(&self) -> &str {
        &self.peer_device_id
    }

    /// False once the sending chain is exhausted; the next encryption to this
    /// peer needs a new X3DH.
    pub fn is_active(&self) -> bool {
        self.active
    }

    // ── Encrypt ──────────────────────────────────────────────────────────

    /// Encrypt `plaintext` and persist the advanced sending chain before
    /// handing back the DR message.
    pub async fn ratchet_encrypt(
        &mut self,
        conn: &mut SqliteConnection,
        plaintext: &[u8],
        mut ad: Vec<u8>,
        payload_direct: bool,
        max_sending_chain: u16,
    ) -> Result<Vec<u8>, LimeError> {
        let mut staged = self.state.clone();
        let step = staged.send_step()?;

        let mut message = DrHeader::encode(
            staged.curve,
            step.ns,
            step.pn,
            &step.dhs,
            self.x3dh_init.as_deref(),
            payload_direct,
        );
        ad.extend_from_slice(staged.shared_ad());
        ad.extend_from_slice(&message);
        message.extend_from_slice(&step.mk.encrypt(plaintext, &ad)?);

        let active = staged.ns < max_sending_chain;
        match self.session_id {
            Some(id) => {
                let update = SessionUpdate::Encrypt { active };
                sessions::update_session(conn, id, &staged, update).await?
            }
            None => {
                let init = self.x3dh_init.clone();
                let id = self.insert(conn, &staged, init.as_deref()).await?;
                if !active {
                    sessions::update_session(conn, id, &staged, SessionUpdate::Encrypt { active })
                        .await?;
                }
            }
        }

        if !active {
            tracing::info!(
                "[dr] session {:?} with {} reached the sending chain limit",
                self.session_id,
                self.peer_device_id
            );
        }
        self.state = staged;
        self.active = active;
        Ok(message)
    }

    // ── Decrypt ──────────────────────────────────────────────────────────

    /// Decrypt a DR message. `Ok(None)` means this session cannot decrypt it;
    /// errors are reserved for storage failures.
    pub async fn ratchet_decrypt(
        &mut self,
        conn: &mut SqliteConnection,
        message: &[u8],
        ad: &[u8],
        payload_direct: bool,
        max_skip: u16,
    ) -> Result<Option<Zeroizing<Vec<u8>>>, LimeError> {
        let header = match DrHeader::parse(message, self.state.curve) {
            Ok(header) => header,
            Err(e) => {
                tracing::warn!("[dr] invalid message header: {e}");
                return Ok(None);
            }
        };
        if header.payload_direct != payload_direct {
            tracing::warn!(
                "[dr] header direct encryption flag ({}) does not match the message ({})",
                header.payload_direct,
                payload_direct
            );
            return Ok(None);
        }

        let mut aad = Vec::with_capacity(ad.len() + SHARED_AD_SIZE + header.size);
        aad.extend_from_slice(ad);
        aad.extend_from_slice(self.state.shared_ad());
        aad.extend_from_slice(&message[..header.size]);
        let body = &message[header.size..];

        if let (true, Some(session_id)) = (self.state.dhr_valid(), self.session_id) {
            if let Some((dhid, mk)) =
                sessions::get_skipped_key(conn, session_id, &header.dhs, header.ns).await?
            {
                let Ok(plaintext) = mk.decrypt(body, &aad) else {
                    tracing::warn!(
                        "[dr] session {session_id}: skipped key for Ns {} does not decrypt",
                        header.ns
                    );
                    return Ok(None);
                };
                self.reactivate(conn).await?;
                sessions::update_session(conn, session_id, &self.state, SessionUpdate::Decrypt)
                    .await?;
                sessions::consume_skipped_key(conn, dhid, header.ns).await?;
                tracing::debug!("[dr] session {session_id}: used skipped key Ns {}", header.ns);
                self.active = true;
                self.x3dh_init = None;
                return Ok(Some(plaintext));
            }
        }

        let ratchet = !self.state.dhr_valid() || self.state.dhr() != &header.dhs;
        let mut staged = self.state.clone();
        let mut skipped = Vec::new();
        let step = staged.receive_step(&header.dhs, header.ns, header.pn, max_skip, &mut skipped);
        let mk = match step {
            Ok(mk) => mk,
            Err(e) => {
                tracing::warn!("[dr] session {:?}: {e}", self.session_id);
                return Ok(None);
            }
        };
        let Ok(plaintext) = mk.decrypt(body, &aad) else {
            tracing::warn!("[dr] session {:?}: message does not decrypt", self.session_id);
            return Ok(None);
        };

        match self.session_id {
            None => {
                let id = self.insert(conn, &staged, None).await?;
                sessions::store_skipped_chains(conn, id, &skipped).await?;
            }
            Some(id) => {
                self.reactivate(conn).await?;
                let update = if ratchet { SessionUpdate::Ratchet } else { SessionUpdate::Decrypt };
                sessions::update_session(conn, id, &staged, update).await?;
                sessions::bump_received(conn, id).await?;
                sessions::store_skipped_chains(conn, id, &skipped).await?;
            }
        }

        self.state = staged;
        self.active = true;
        self.x3dh_init = None;
        Ok(Some(plaintext))
    }

    // ── Storage ──────────────────────────────────────────────────────────

    /// A stale session that decrypts becomes the active one again.
    async fn reactivate(&mut self, conn: &mut SqliteConnection) -> Result<(), LimeError> {
        if let (false, Peer::Stored(did)) = (self.active, self.peer) {
            sessions::stale_peer_sessions(conn, self.uid, did).await?;
            tracing::debug!(
                "[dr] session {:?} with {} is active again",
                self.session_id,
                self.peer_device_id
            );
        }
        Ok(())
    }

    /// First save of a session created in memory.
    async fn insert(
        &mut self,
        conn: &mut SqliteConnection,
        state: &RatchetState,
        x3dh_init: Option<&[u8]>,
    ) -> Result<i64, LimeError> {
        let did = match self.peer {
            Peer::Stored(did) => did,
            Peer::New(ik) => peers::store_peer_device(conn, &self.peer_device_id, &ik).await?,
        };
        let id = sessions::insert_session(conn, self.uid, did, state, x3dh_init).await?;
        if let Some(opk_id) = self.used_opk.take() {
            prekeys::delete_opk(conn, self.uid, opk_id).await?;
        }
        self.peer = Peer::Stored(did);
        self.session_id = Some(id);
        tracing::debug!("[dr] new session {id} with {}", self.peer_device_id);
        Ok(id)
    }
}

impl std::fmt::Debug for DrSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrSession")
            .field("session_id", &self.session_id)
            .field("peer_device_id", &self.peer_device_id)
            .field("active", &self.active)
            .field("x3dh_init", &self.x3dh_init.is_some())
            .field("state", &self.state)
            .finish()
    }
}

// ── Fan-out ──────────────────────────────────────────────────────────────────

/// One recipient device of an encryption and, once done, its DR message.
#[derive(Debug)]
pub struct RecipientSession {
    pub device_id: String,
    pub session: DrSession,
    pub dr_message: Vec<u8>,
}

/// Encrypt one plaintext to every recipient. Returns the cipher message,
/// empty when the payload went directly in the DR messages.
pub async fn encrypt_for_recipients(
    conn: &mut SqliteConnection,
    recipients: &mut [RecipientSession],
    plaintext: &[u8],
    recipient_user_id: &[u8],
    source_device_id: &str,
    policy: EncryptionPolicy,
    max_sending_chain: u16,
) -> Result<Vec<u8>, LimeError> {
    let payload_direct = policy.payload_direct(recipients.len(), plaintext.len());
    let mut seed = Zeroizing::new([0u8; RANDOM_SEED_SIZE]);
    let mut ad = Vec::new();

    let cipher_message = if payload_direct {
        ad.extend_from_slice(recipient_user_id);
        Vec::new()
    } else {
        OsRng.fill_bytes(seed.as_mut_slice());
        let key = kdf::message_key_from_seed(seed.as_slice())?;
        let mut body_ad = source_device_id.as_bytes().to_vec();
        body_ad.extend_from_slice(recipient_user_id);
        let cipher = key.encrypt(plaintext, &body_ad)?;
        ad.extend_from_slice(&cipher[cipher.len().saturating_sub(TAG_SIZE)..]);
        cipher
    };
    ad.extend_from_slice(source_device_id.as_bytes());

    let payload: &[u8] = if payload_direct { plaintext } else { seed.as_slice() };
    for recipient in recipients.iter_mut() {
        let mut recipient_ad = ad.clone();
        recipient_ad.extend_from_slice(recipient.device_id.as_bytes());
        recipient.dr_message = recipient
            .session
            .ratchet_encrypt(conn, payload, recipient_ad, payload_direct, max_sending_chain)
            .await?;
    }

    tracing::debug!(
        "[dr] {source_device_id} encrypted {} bytes to {} devices ({})",
        plaintext.len(),
        recipients.len(),
        if payload_direct { "in DR messages" } else { "in cipher message" }
    );
    Ok(cipher_message)
}

/// Result of trying a list of sessions on one incoming message.
#[derive(Debug)]
pub enum CandidateOutcome {
    Decrypted { index: usize, plaintext: Zeroizing<Vec<u8>> },
    /// No session decrypts the DR message.
    NoMatch,
    /// The DR message decrypted but the cipher message it protects did not.
    /// The session was written through `conn`: the caller must not commit.
    BodyRejected,
}

/// Try `candidates` in order until one decrypts the DR message.
#[allow(clippy::too_many_arguments)]
pub async fn decrypt_from_candidates(
    conn: &mut SqliteConnection,
    candidates: &mut [DrSession],
    source_device_id: &str,
    recipient_device_id: &str,
    recipient_user_id: &[u8],
    dr_message: &[u8],
    cipher_message: &[u8],
    max_skip: u16,
) -> Result<CandidateOutcome, LimeError> {
    let payload_direct = cipher_message.is_empty();
    let mut ad = Vec::new();
    if payload_direct {
        ad.extend_from_slice(recipient_user_id);
    } else {
        if cipher_message.len() < TAG_SIZE {
            tracing::warn!("[dr] cipher message of {} bytes is too short", cipher_message.len());
            return Ok(CandidateOutcome::BodyRejected);
        }
        ad.extend_from_slice(&cipher_message[cipher_message.len() - TAG_SIZE..]);
    }
    ad.extend_from_slice(source_device_id.as_bytes());
    ad.extend_from_slice(recipient_device_id.as_bytes());

    for (index, session) in candidates.iter_mut().enumerate() {
        let Some(payload) = session
            .ratchet_decrypt(conn, dr_message, &ad, payload_direct, max_skip)
            .await?
        else {
            continue;
        };
        if payload_direct {
            return Ok(CandidateOutcome::Decrypted { index, plaintext: payload });
        }

        if payload.len() != RANDOM_SEED_SIZE {
            tracing::warn!("[dr] DR message holds a {} byte seed", payload.len());
            return Ok(CandidateOutcome::BodyRejected);
        }
        let key = kdf::message_key_from_seed(&payload)?;
        let mut body_ad = source_device_id.as_bytes().to_vec();
        body_ad.extend_from_slice(recipient_user_id);
        return Ok(match key.decrypt(cipher_message, &body_ad) {
            Ok(plaintext) => CandidateOutcome::Decrypted { index, plaintext },
            Err(_) => {
                tracing::warn!(
                    "[dr] message key deciphered but the cipher message does not decrypt"
                );
                CandidateOutcome::BodyRejected
            }
        });
    }
    Ok(CandidateOutcome::NoMatch)
}
