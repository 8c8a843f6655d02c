#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    sync::Arc,
};

use async_trait::async_trait;
use lime::{
    CurveId, Decrypted, EncryptOutput, LimeManager, LimeSettings, Store, TransportError,
    X3dhResponse, X3dhTransport,
};
use lime_crypto::IdentityKeyPair;
use lime_proto::{KeyBundle, PeerBundle, X3dhErrorCode, X3dhMessage, X3dhMessageType};
use parking_lot::Mutex;

pub const SERVER_URL: &str = "https://x3dh.example.org:25519";
pub const CURVE: CurveId = CurveId::C25519;

struct Device {
    ik: [u8; 32],
    spk: [u8; 32],
    spk_id: u32,
    spk_sig: [u8; 64],
    opks: VecDeque<([u8; 32], u32)>,
}

#[derive(Default)]
struct ServerState {
    devices: HashMap<String, Device>,
    requests: Vec<(String, X3dhMessageType)>,
    served_opks: Vec<u32>,
    offline: bool,
    max_opks_per_device: Option<usize>,
}

/// Key server living in the test process, speaking the binary protocol.
#[derive(Default)]
pub struct X3dhServer {
    state: Mutex<ServerState>,
}

fn error(code: X3dhErrorCode, message: &str) -> Vec<u8> {
    X3dhMessage::Error { code, message: message.to_owned() }.encode(CURVE).unwrap()
}

impl X3dhServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Refuse registrations and OPk uploads past `max` OPks per device.
    pub fn with_opk_limit(max: usize) -> Arc<Self> {
        let server = Self::default();
        server.state.lock().max_opks_per_device = Some(max);
        Arc::new(server)
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Drop a device as if the server lost its database.
    pub fn forget(&self, device_id: &str) {
        self.state.lock().devices.remove(device_id);
    }

    pub fn knows(&self, device_id: &str) -> bool {
        self.state.lock().devices.contains_key(device_id)
    }

    pub fn opk_count(&self, device_id: &str) -> usize {
        self.state.lock().devices.get(device_id).map_or(0, |d| d.opks.len())
    }

    pub fn opk_ids(&self, device_id: &str) -> Vec<u32> {
        self.state
            .lock()
            .devices
            .get(device_id)
            .map(|d| d.opks.iter().map(|(_, id)| *id).collect())
            .unwrap_or_default()
    }

    pub fn spk_id(&self, device_id: &str) -> Option<u32> {
        self.state.lock().devices.get(device_id).map(|d| d.spk_id)
    }

    pub fn served_opks(&self) -> Vec<u32> {
        self.state.lock().served_opks.clone()
    }

    /// Requests of one type posted so far.
    pub fn request_count(&self, msg_type: X3dhMessageType) -> usize {
        self.state.lock().requests.iter().filter(|(_, t)| *t == msg_type).count()
    }

    fn handle(&self, from: &str, body: &[u8]) -> Vec<u8> {
        let request = match X3dhMessage::decode(body, CURVE) {
            Ok(request) => request,
            Err(e) => return error(X3dhErrorCode::BadRequest, &e.to_string()),
        };
        let msg_type = request.message_type();
        let mut state = self.state.lock();
        state.requests.push((from.to_owned(), msg_type));
        let limit = state.max_opks_per_device;

        match request {
            X3dhMessage::RegisterUser { ik, spk, spk_sig, spk_id, opks } => {
                if state.devices.contains_key(from) {
                    return error(X3dhErrorCode::UserAlreadyIn, from);
                }
                if IdentityKeyPair::verify(&ik, &spk, &spk_sig).is_err() {
                    return error(X3dhErrorCode::BadRequest, "SPk signature does not verify");
                }
                if limit.is_some_and(|max| opks.len() > max) {
                    return error(X3dhErrorCode::ResourceLimitReached, "too many OPks");
                }
                let device = Device { ik, spk, spk_id, spk_sig, opks: opks.into() };
                state.devices.insert(from.to_owned(), device);
            }
            X3dhMessage::DeleteUser => {
                if state.devices.remove(from).is_none() {
                    return error(X3dhErrorCode::UserNotFound, from);
                }
            }
            X3dhMessage::PostSpk { spk, spk_sig, spk_id } => {
                let Some(device) = state.devices.get_mut(from) else {
                    return error(X3dhErrorCode::UserNotFound, from);
                };
                if IdentityKeyPair::verify(&device.ik, &spk, &spk_sig).is_err() {
                    return error(X3dhErrorCode::BadRequest, "SPk signature does not verify");
                }
                device.spk = spk;
                device.spk_sig = spk_sig;
                device.spk_id = spk_id;
            }
            X3dhMessage::PostOpks { opks } => {
                let Some(device) = state.devices.get_mut(from) else {
                    return error(X3dhErrorCode::UserNotFound, from);
                };
                if limit.is_some_and(|max| device.opks.len() + opks.len() > max) {
                    return error(X3dhErrorCode::ResourceLimitReached, "too many OPks");
                }
                device.opks.extend(opks);
            }
            X3dhMessage::GetPeerBundle { device_ids } => {
                let mut bundles = Vec::with_capacity(device_ids.len());
                let mut served = Vec::new();
                for device_id in device_ids {
                    let bundle = state.devices.get_mut(&device_id).map(|d| {
                        let opk = d.opks.pop_front();
                        served.extend(opk.map(|(_, id)| id));
                        let (ik, spk, spk_id, spk_sig) = (d.ik, d.spk, d.spk_id, d.spk_sig);
                        KeyBundle { ik, spk, spk_id, spk_sig, opk }
                    });
                    bundles.push(PeerBundle { device_id, bundle });
                }
                state.served_opks.extend(served);
                return X3dhMessage::PeerBundle { bundles }.encode(CURVE).unwrap();
            }
            X3dhMessage::GetSelfOpks => {
                let Some(device) = state.devices.get(from) else {
                    return error(X3dhErrorCode::UserNotFound, from);
                };
                let opk_ids = device.opks.iter().map(|(_, id)| *id).collect();
                return X3dhMessage::SelfOpks { opk_ids }.encode(CURVE).unwrap();
            }
            other => {
                return error(X3dhErrorCode::BadRequest, &format!("{:?}", other.message_type()))
            }
        }
        X3dhMessage::ack(msg_type, CURVE)
    }
}

#[async_trait]
impl X3dhTransport for X3dhServer {
    async fn post(
        &self,
        url: &str,
        from: &str,
        body: Vec<u8>,
    ) -> Result<X3dhResponse, TransportError> {
        if self.state.lock().offline {
            let reason = "connection refused".into();
            return Err(TransportError::Failed { url: url.to_owned(), reason });
        }
        Ok(X3dhResponse::ok(self.handle(from, &body)))
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One manager over its own database file, as one process would hold it.
pub struct Node {
    pub manager: Arc<LimeManager>,
    pub db_path: PathBuf,
    _dir: tempfile::TempDir,
}

pub async fn node(server: &Arc<X3dhServer>) -> Node {
    node_with(server, LimeSettings::default()).await
}

pub async fn node_with(server: &Arc<X3dhServer>, settings: LimeSettings) -> Node {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("lime.db");
    let store = Store::open(&db_path).await.expect("open store");
    let transport: Arc<dyn X3dhTransport> = server.clone();
    let manager = LimeManager::new(store, transport, settings).expect("manager");
    Node { manager: Arc::new(manager), db_path, _dir: dir }
}

impl Node {
    /// Encrypt `text` from `from` to the single device `to`, default policy.
    pub async fn send(&self, from: &str, to_user: &[u8], to: &str, text: &[u8]) -> EncryptOutput {
        self.manager.encrypt(from, to_user, &ids(&[to]), text, None).await.expect("encrypt")
    }

    /// Decrypt what `out` carries for the local device `local`.
    pub async fn receive(
        &self,
        local: &str,
        user: &[u8],
        sender: &str,
        out: &EncryptOutput,
    ) -> Decrypted {
        let dr_message = &out
            .recipients
            .iter()
            .find(|r| r.device_id == local)
            .expect("addressed to this device")
            .dr_message;
        self.manager
            .decrypt(local, user, sender, dr_message, &out.cipher_message)
            .await
            .expect("decrypt")
    }
}

/// A node with one registered device.
pub async fn device(server: &Arc<X3dhServer>, device_id: &str) -> Node {
    let node = node(server).await;
    node.manager.create_user(device_id, SERVER_URL, CURVE, 10).await.expect("create user");
    node
}

pub fn ids(devices: &[&str]) -> Vec<String> {
    devices.iter().map(|d| (*d).to_owned()).collect()
}
