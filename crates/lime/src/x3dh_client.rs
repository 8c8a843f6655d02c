//! Key server round trips and the two halves of X3DH session creation.

use std::time::Duration;

use lime_crypto::{
    ratchet::RatchetState,
    x3dh::{self, PeerBundleKeys},
    CurveId, DhKeyPair, IdentityKeyPair,
};
use lime_proto::{x3dh::parse_header, KeyBundle, PeerBundle, X3dhInit, X3dhMessage, X3dhMessageType};
use lime_store::{peers, prekeys, LocalUser};
use sqlx::SqliteConnection;

use crate::{
    double_ratchet::DrSession,
    error::LimeError,
    transport::{post_with_timeout, X3dhTransport},
};

/// Talks to the key server on behalf of one local device.
pub(crate) struct X3dhClient<'a> {
    transport: &'a dyn X3dhTransport,
    server_url: &'a str,
    device_id: &'a str,
    curve: CurveId,
    timeout: Duration,
}

impl<'a> X3dhClient<'a> {
    pub(crate) fn new(
        transport: &'a dyn X3dhTransport,
        server_url: &'a str,
        device_id: &'a str,
        curve: CurveId,
        timeout: Duration,
    ) -> Self {
        Self { transport, server_url, device_id, curve, timeout }
    }

    /// Post `request` and return the answer body once it is known to be of
    /// the expected type. Server error messages become `LimeError::Server`.
    async fn exchange(&self, request: &X3dhMessage) -> Result<Vec<u8>, LimeError> {
        let sent = request.message_type();
        let expected = match sent {
            X3dhMessageType::GetPeerBundle => X3dhMessageType::PeerBundle,
            X3dhMessageType::GetSelfOpks => X3dhMessageType::SelfOpks,
            other => other,
        };
        let body = request.encode(self.curve)?;
        tracing::info!(
            "[x3dh] {} posts {sent:?} ({} bytes) to {}",
            self.device_id,
            body.len(),
            self.server_url
        );

        let res =
            post_with_timeout(self.transport, self.server_url, self.device_id, body, self.timeout)
                .await
                .map_err(|e| {
                    tracing::warn!("[x3dh] {} {sent:?}: {e}", self.device_id);
                    e
                })?;
        if res.status != 200 {
            tracing::warn!("[x3dh] {} {sent:?}: HTTP status {}", self.device_id, res.status);
            return Err(LimeError::HttpStatus(res.status));
        }

        let got = parse_header(&res.body, self.curve)?;
        if got == X3dhMessageType::Error {
            let refusal = X3dhMessage::decode(&res.body, self.curve)?;
            if let X3dhMessage::Error { code, message } = refusal {
                tracing::warn!("[x3dh] {} {sent:?} refused: {code} {message}", self.device_id);
                return Err(LimeError::Server { code, message });
            }
        }
        if got != expected {
            return Err(LimeError::BadResponse(format!("expected {expected:?}, got {got:?}")));
        }
        Ok(res.body)
    }

    pub(crate) async fn register_user(
        &self,
        identity: &IdentityKeyPair,
        spk: &DhKeyPair,
        spk_id: u32,
        opks: Vec<([u8; 32], u32)>,
    ) -> Result<(), LimeError> {
        let request = X3dhMessage::RegisterUser {
            ik: *identity.public(),
            spk: *spk.public(),
            spk_sig: identity.sign(spk.public()),
            spk_id,
            opks,
        };
        self.exchange(&request).await.map(drop)
    }

    pub(crate) async fn delete_user(&self) -> Result<(), LimeError> {
        self.exchange(&X3dhMessage::DeleteUser).await.map(drop)
    }

    pub(crate) async fn post_spk(
        &self,
        identity: &IdentityKeyPair,
        spk: &DhKeyPair,
        spk_id: u32,
    ) -> Result<(), LimeError> {
        let request = X3dhMessage::PostSpk {
            spk: *spk.public(),
            spk_sig: identity.sign(spk.public()),
            spk_id,
        };
        self.exchange(&request).await.map(drop)
    }

    pub(crate) async fn post_opks(&self, opks: Vec<([u8; 32], u32)>) -> Result<(), LimeError> {
        self.exchange(&X3dhMessage::PostOpks { opks }).await.map(drop)
    }

    /// One request for every device; devices unknown to the server come back
    /// with `bundle: None`.
    pub(crate) async fn get_peer_bundles(
        &self,
        device_ids: &[String],
    ) -> Result<Vec<PeerBundle>, LimeError> {
        let body = self
            .exchange(&X3dhMessage::GetPeerBundle { device_ids: device_ids.to_vec() })
            .await?;
        match X3dhMessage::decode(&body, self.curve)? {
            X3dhMessage::PeerBundle { bundles } => Ok(bundles),
            other => Err(LimeError::BadResponse(format!("unexpected {:?}", other.message_type()))),
        }
    }

    /// Ids of our OPks the server still holds.
    pub(crate) async fn get_self_opks(&self) -> Result<Vec<u32>, LimeError> {
        let body = self.exchange(&X3dhMessage::GetSelfOpks).await?;
        match X3dhMessage::decode(&body, self.curve)? {
            X3dhMessage::SelfOpks { opk_ids } => Ok(opk_ids),
            other => Err(LimeError::BadResponse(format!("unexpected {:?}", other.message_type()))),
        }
    }
}

/// Fail with `IdentityKeyConflict` when a stored peer has another identity key.
async fn check_peer_ik(
    conn: &mut SqliteConnection,
    device_id: &str,
    ik: &[u8; 32],
) -> Result<(), LimeError> {
    match peers::peer_device_ik(conn, device_id).await? {
        Some(stored) if stored != ik => {
            tracing::error!(
                "[x3dh] {device_id} presents an identity key that differs from the stored one"
            );
            Err(LimeError::IdentityKeyConflict(device_id.to_owned()))
        }
        _ => Ok(()),
    }
}

/// Run the initiator half of X3DH against a fetched bundle and build the
/// session whose messages carry the X3DH init until the peer replies.
pub(crate) async fn init_sender_session(
    conn: &mut SqliteConnection,
    user: &LocalUser,
    peer_device_id: &str,
    bundle: &KeyBundle,
) -> Result<DrSession, LimeError> {
    check_peer_ik(conn, peer_device_id, &bundle.ik).await?;

    let peer = PeerBundleKeys {
        curve: user.curve,
        device_id: peer_device_id,
        ik: &bundle.ik,
        spk: &bundle.spk,
        spk_sig: &bundle.spk_sig,
        opk: bundle.opk.as_ref().map(|(opk, _)| opk),
    };
    let initiation = x3dh::initiate(&user.identity, &user.device_id, &peer)?;
    if bundle.opk.is_none() {
        tracing::info!("[x3dh] bundle of {peer_device_id} holds no OPk, using SPk only");
    }

    let init = X3dhInit {
        ik: *user.identity.public(),
        ek: initiation.ephemeral_public,
        spk_id: bundle.spk_id,
        opk_id: bundle.opk.as_ref().map(|(_, id)| *id),
    };
    let secret = initiation.secret;
    let state =
        RatchetState::init_sender(user.curve, &secret.shared_key, secret.shared_ad, &bundle.spk)?;
    Ok(DrSession::new_sender(user.uid, peer_device_id, bundle.ik, state, init.encode()))
}

/// Rebuild the initiator's secret from the X3DH init of an incoming message.
pub(crate) async fn init_receiver_session(
    conn: &mut SqliteConnection,
    user: &LocalUser,
    peer_device_id: &str,
    init: &X3dhInit,
) -> Result<DrSession, LimeError> {
    check_peer_ik(conn, peer_device_id, &init.ik).await?;

    let spk = prekeys::get_spk(conn, user.uid, init.spk_id).await?;
    let opk = match init.opk_id {
        Some(id) => Some(prekeys::get_opk(conn, user.uid, id).await?),
        None => None,
    };
    let secret = x3dh::respond(
        &user.identity,
        &user.device_id,
        &init.ik,
        peer_device_id,
        &spk,
        opk.as_ref(),
        &init.ek,
    )?;
    let state = RatchetState::init_receiver(user.curve, &secret.shared_key, secret.shared_ad, spk)?;
    tracing::debug!(
        "[x3dh] {} built a receiver session with {peer_device_id} (SPk {:#010x}, OPk {:?})",
        user.device_id,
        init.spk_id,
        init.opk_id
    );
    Ok(DrSession::new_receiver(user.uid, peer_device_id, init.ik, state, init.opk_id))
}
