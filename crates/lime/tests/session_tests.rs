mod common;

use common::{device, ids, node, node_with, X3dhServer, CURVE, SERVER_URL};
use lime::EncryptionPolicy::{CipherMessage, DrMessage};
use lime::{LimeError, LimeSettings, PeerDeviceStatus};
use lime_proto::{dr::has_x3dh_init, X3dhMessageType};

const ALICE_USER: &[u8] = b"sip:alice@example.org";
const BOB_USER: &[u8] = b"sip:bob@example.org";

#[tokio::test]
async fn alice_says_hello_bob_answers() {
    let server = X3dhServer::new();
    let alice = device(&server, "alice.1").await;
    let bob = device(&server, "bob.1").await;

    let out = alice.send("alice.1", BOB_USER, "bob.1", b"hello").await;
    assert_eq!(out.recipients.len(), 1);
    assert_eq!(out.recipients[0].peer_status, PeerDeviceStatus::Unknown);
    assert!(out.cipher_message.is_empty());
    let to_bob = &out.recipients[0].dr_message;
    assert!(has_x3dh_init(to_bob));

    let got = bob.receive("bob.1", BOB_USER, "alice.1", &out).await;
    assert_eq!(got.status, PeerDeviceStatus::Unknown);
    assert_eq!(got.plaintext, b"hello");

    let reply = bob.send("bob.1", ALICE_USER, "alice.1", b"hi").await;
    assert_eq!(reply.recipients[0].peer_status, PeerDeviceStatus::Untrusted);
    let to_alice = &reply.recipients[0].dr_message;
    assert!(!has_x3dh_init(to_alice));

    let got = alice.receive("alice.1", ALICE_USER, "bob.1", &reply).await;
    assert_eq!(got.status, PeerDeviceStatus::Untrusted);
    assert_eq!(got.plaintext, b"hi");

    let next = alice.send("alice.1", BOB_USER, "bob.1", b"how are you").await;
    assert!(!has_x3dh_init(&next.recipients[0].dr_message));
    assert_eq!(server.request_count(X3dhMessageType::GetPeerBundle), 1);
}

#[tokio::test]
async fn fan_out_under_both_policies() {
    let server = X3dhServer::new();
    let alice = device(&server, "alice.1").await;
    let bob1 = device(&server, "bob.1").await;
    let bob2 = device(&server, "bob.2").await;
    let carol = device(&server, "carol.1").await;
    let receivers = [("bob.1", &bob1), ("bob.2", &bob2), ("carol.1", &carol)];
    let plaintext = b"the same words for everyone, long enough to be worth sharing".to_vec();

    let shared = alice
        .manager
        .encrypt(
            "alice.1",
            BOB_USER,
            &ids(&["bob.1", "bob.2", "carol.1"]),
            &plaintext,
            Some(CipherMessage),
        )
        .await
        .unwrap();
    assert!(!shared.cipher_message.is_empty());
    for (recipient, (id, node)) in shared.recipients.iter().zip(receivers) {
        assert_eq!(recipient.device_id, id);
        let got = node
            .manager
            .decrypt(id, BOB_USER, "alice.1", &recipient.dr_message, &shared.cipher_message)
            .await
            .unwrap();
        assert!(got.is_ok());
        assert_eq!(got.plaintext, plaintext);
    }

    let direct = alice
        .manager
        .encrypt(
            "alice.1",
            BOB_USER,
            &ids(&["bob.1", "bob.2", "carol.1"]),
            &plaintext,
            Some(DrMessage),
        )
        .await
        .unwrap();
    assert!(direct.cipher_message.is_empty());
    for (recipient, (id, node)) in direct.recipients.iter().zip(receivers) {
        let got = node
            .manager
            .decrypt(id, BOB_USER, "alice.1", &recipient.dr_message, &direct.cipher_message)
            .await
            .unwrap();
        assert_eq!(got.plaintext, plaintext);
    }
}

#[tokio::test]
async fn stripped_or_forged_cipher_message_fails() {
    let server = X3dhServer::new();
    let alice = device(&server, "alice.1").await;
    let bob = device(&server, "bob.1").await;

    let out = alice
        .manager
        .encrypt("alice.1", BOB_USER, &ids(&["bob.1"]), b"secret", Some(CipherMessage))
        .await
        .unwrap();
    let dr_message = &out.recipients[0].dr_message;

    let stripped = bob.manager.decrypt("bob.1", BOB_USER, "alice.1", dr_message, &[]).await;
    let stripped = stripped.unwrap();
    assert_eq!(stripped.status, PeerDeviceStatus::Fail);
    assert!(stripped.plaintext.is_empty());

    let mut forged = out.cipher_message.clone();
    forged[0] ^= 0x01;
    let forged = bob.manager.decrypt("bob.1", BOB_USER, "alice.1", dr_message, &forged).await;
    let forged = forged.unwrap();
    assert_eq!(forged.status, PeerDeviceStatus::Fail);

    // nothing was committed by the failures
    let got = bob
        .manager
        .decrypt("bob.1", BOB_USER, "alice.1", dr_message, &out.cipher_message)
        .await
        .unwrap();
    assert_eq!(got.plaintext, b"secret");

    let direct = alice
        .manager
        .encrypt("alice.1", BOB_USER, &ids(&["bob.1"]), b"direct", Some(DrMessage))
        .await
        .unwrap();
    let shared_body = &out.cipher_message;
    let with_body = bob
        .manager
        .decrypt("bob.1", BOB_USER, "alice.1", &direct.recipients[0].dr_message, shared_body)
        .await
        .unwrap();
    assert_eq!(with_body.status, PeerDeviceStatus::Fail);
}

#[tokio::test]
async fn message_for_another_user_does_not_decrypt() {
    let server = X3dhServer::new();
    let alice = device(&server, "alice.1").await;
    let bob = device(&server, "bob.1").await;

    let out = alice.send("alice.1", BOB_USER, "bob.1", b"for bob").await;
    let got = bob
        .manager
        .decrypt("bob.1", b"sip:mallory@example.org", "alice.1", &out.recipients[0].dr_message, &[])
        .await
        .unwrap();
    assert_eq!(got.status, PeerDeviceStatus::Fail);
}

#[tokio::test]
async fn out_of_order_delivery() {
    let server = X3dhServer::new();
    let alice = device(&server, "alice.1").await;
    let bob = device(&server, "bob.1").await;

    let mut sent = Vec::new();
    for i in 0..6u8 {
        let text = format!("message {i}");
        let out = alice.send("alice.1", BOB_USER, "bob.1", text.as_bytes()).await;
        sent.push((text, out.recipients[0].dr_message.clone()));
    }

    for i in [4, 0, 5, 2, 1, 3] {
        let (text, message) = &sent[i];
        let got = bob.manager.decrypt("bob.1", BOB_USER, "alice.1", message, &[]).await.unwrap();
        assert!(got.is_ok(), "message {i}");
        assert_eq!(got.plaintext, text.as_bytes());
    }

    // a skipped key is used once
    let again = bob.manager.decrypt("bob.1", BOB_USER, "alice.1", &sent[2].1, &[]).await.unwrap();
    assert_eq!(again.status, PeerDeviceStatus::Fail);
}

#[tokio::test]
async fn too_many_skipped_messages_fail() {
    let server = X3dhServer::new();
    let alice = device(&server, "alice.1").await;
    let settings = LimeSettings { max_message_skip: 8, ..LimeSettings::default() };
    let bob = node_with(&server, settings).await;
    bob.manager.create_user("bob.1", SERVER_URL, CURVE, 10).await.unwrap();

    let mut sent = Vec::new();
    for i in 0..11u8 {
        let out = alice.send("alice.1", BOB_USER, "bob.1", &[i]).await;
        sent.push(out.recipients[0].dr_message.clone());
    }

    let first = bob.manager.decrypt("bob.1", BOB_USER, "alice.1", &sent[0], &[]).await.unwrap();
    assert_eq!(first.plaintext, [0]);

    let too_far = bob.manager.decrypt("bob.1", BOB_USER, "alice.1", &sent[10], &[]).await.unwrap();
    assert_eq!(too_far.status, PeerDeviceStatus::Fail);

    let within = bob.manager.decrypt("bob.1", BOB_USER, "alice.1", &sent[9], &[]).await.unwrap();
    assert_eq!(within.plaintext, [9]);
    let skipped = bob.manager.decrypt("bob.1", BOB_USER, "alice.1", &sent[5], &[]).await.unwrap();
    assert_eq!(skipped.plaintext, [5]);
}

#[tokio::test]
async fn exhausted_sending_chain_starts_a_new_session() {
    let server = X3dhServer::new();
    let settings = LimeSettings { max_sending_chain: 3, ..LimeSettings::default() };
    let alice = node_with(&server, settings).await;
    alice.manager.create_user("alice.1", SERVER_URL, CURVE, 10).await.unwrap();
    let bob = device(&server, "bob.1").await;

    let first = alice.send("alice.1", BOB_USER, "bob.1", b"0").await;
    bob.receive("bob.1", BOB_USER, "alice.1", &first).await;
    let reply = bob.send("bob.1", ALICE_USER, "alice.1", b"ack").await;
    let got = alice.receive("alice.1", ALICE_USER, "bob.1", &reply).await;
    assert!(got.is_ok());

    for i in 1..=3u8 {
        let out = alice.send("alice.1", BOB_USER, "bob.1", &[i]).await;
        let message = &out.recipients[0].dr_message;
        assert!(!has_x3dh_init(message), "message {i}");
        let got = bob.manager.decrypt("bob.1", BOB_USER, "alice.1", message, &[]).await.unwrap();
        assert_eq!(got.plaintext, [i]);
    }

    let renewed = alice.send("alice.1", BOB_USER, "bob.1", b"fresh").await;
    assert!(has_x3dh_init(&renewed.recipients[0].dr_message));
    assert_eq!(server.request_count(X3dhMessageType::GetPeerBundle), 2);
    let got = bob.receive("bob.1", BOB_USER, "alice.1", &renewed).await;
    assert_eq!(got.plaintext, b"fresh");

    let sessions = alice.manager.list_sessions("alice.1", "bob.1").await.unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions.iter().filter(|s| s.active).count(), 1);
    assert!(sessions[1].active);
}

#[tokio::test]
async fn crossed_initiations_converge() {
    let server = X3dhServer::new();
    let alice = device(&server, "alice.1").await;
    let bob = device(&server, "bob.1").await;

    let a1 = alice.send("alice.1", BOB_USER, "bob.1", b"a1").await;
    let b1 = bob.send("bob.1", ALICE_USER, "alice.1", b"b1").await;

    let got = bob.receive("bob.1", BOB_USER, "alice.1", &a1).await;
    assert_eq!(got.plaintext, b"a1");
    let got = alice.receive("alice.1", ALICE_USER, "bob.1", &b1).await;
    assert_eq!(got.plaintext, b"b1");

    let b2 = bob.send("bob.1", ALICE_USER, "alice.1", b"b2").await;
    let got = alice.receive("alice.1", ALICE_USER, "bob.1", &b2).await;
    assert_eq!(got.plaintext, b"b2");

    let a2 = alice.send("alice.1", BOB_USER, "bob.1", b"a2").await;
    assert!(!has_x3dh_init(&a2.recipients[0].dr_message));
    let got = bob.receive("bob.1", BOB_USER, "alice.1", &a2).await;
    assert_eq!(got.plaintext, b"a2");

    for (node, local, peer) in [(&alice, "alice.1", "bob.1"), (&bob, "bob.1", "alice.1")] {
        let sessions = node.manager.list_sessions(local, peer).await.unwrap();
        assert_eq!(sessions.len(), 2, "{local}");
        assert_eq!(sessions.iter().filter(|s| s.active).count(), 1, "{local}");
    }
    // alice went back to the session she started, bob keeps the one built from it
    let alice_sessions = alice.manager.list_sessions("alice.1", "bob.1").await.unwrap();
    assert!(alice_sessions[0].active);
    let bob_sessions = bob.manager.list_sessions("bob.1", "alice.1").await.unwrap();
    assert!(bob_sessions[1].active);
}

#[tokio::test]
async fn fetched_opk_is_never_served_again() {
    let server = X3dhServer::new();
    let bob = device(&server, "bob.1").await;
    let alice = device(&server, "alice.1").await;
    let carol = device(&server, "carol.1").await;
    let before = server.opk_ids("bob.1");

    let from_alice = alice.send("alice.1", BOB_USER, "bob.1", b"a").await;
    let from_carol = carol.send("carol.1", BOB_USER, "bob.1", b"c").await;

    let served = server.served_opks();
    assert_eq!(served.len(), 2);
    assert_ne!(served[0], served[1]);
    let left = server.opk_ids("bob.1");
    assert_eq!(left.len(), before.len() - 2);
    assert!(served.iter().all(|id| before.contains(id) && !left.contains(id)));

    for (sender, out) in [("alice.1", &from_alice), ("carol.1", &from_carol)] {
        let got = bob.receive("bob.1", BOB_USER, sender, out).await;
        assert!(got.is_ok(), "{sender}");
    }
}

#[tokio::test]
async fn bundle_without_opk_still_builds_a_session() {
    let server = X3dhServer::new();
    let bob = node(&server).await;
    bob.manager.create_user("bob.1", SERVER_URL, CURVE, 0).await.unwrap();
    let alice = device(&server, "alice.1").await;

    let out = alice.send("alice.1", BOB_USER, "bob.1", b"spk only").await;
    assert!(server.served_opks().is_empty());
    let got = bob.receive("bob.1", BOB_USER, "alice.1", &out).await;
    assert_eq!(got.plaintext, b"spk only");
}

#[tokio::test]
async fn concurrent_encryptions_share_one_bundle_request() {
    let server = X3dhServer::new();
    let alice = device(&server, "alice.1").await;
    let bob = device(&server, "bob.1").await;
    let recipients = ids(&["bob.1"]);

    let (first, second) = tokio::join!(
        alice.manager.encrypt("alice.1", BOB_USER, &recipients, b"one", None),
        alice.manager.encrypt("alice.1", BOB_USER, &recipients, b"two", None),
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    assert_eq!(server.request_count(X3dhMessageType::GetPeerBundle), 1);
    assert_eq!(alice.manager.list_sessions("alice.1", "bob.1").await.unwrap().len(), 1);

    for out in [&second, &first] {
        let got = bob.receive("bob.1", BOB_USER, "alice.1", out).await;
        assert!(got.is_ok());
    }
}

#[tokio::test]
async fn recipients_fail_one_by_one() {
    let server = X3dhServer::new();
    let alice = device(&server, "alice.1").await;
    let _bob = device(&server, "bob.1").await;
    let _carol = device(&server, "carol.1").await;

    let out = alice
        .manager
        .encrypt("alice.1", BOB_USER, &ids(&["ghost.1", "bob.1"]), b"partial", None)
        .await
        .unwrap();
    assert_eq!(out.recipients[0].device_id, "ghost.1");
    assert_eq!(out.recipients[0].peer_status, PeerDeviceStatus::Fail);
    assert!(out.recipients[0].dr_message.is_empty());
    assert_eq!(out.recipients[1].peer_status, PeerDeviceStatus::Unknown);

    let err = alice
        .manager
        .encrypt("alice.1", BOB_USER, &ids(&["ghost.1"]), b"nobody", None)
        .await
        .unwrap_err();
    assert!(matches!(err, LimeError::AllRecipientsFailed));

    // bob has a session already, carol needs the unreachable server
    server.set_offline(true);
    let out = alice
        .manager
        .encrypt("alice.1", BOB_USER, &ids(&["bob.1", "carol.1"]), b"offline", None)
        .await
        .unwrap();
    assert_ne!(out.recipients[0].peer_status, PeerDeviceStatus::Fail);
    assert_eq!(out.recipients[1].peer_status, PeerDeviceStatus::Fail);
}

#[tokio::test]
async fn changed_identity_key_is_refused() {
    let server = X3dhServer::new();
    let alice = device(&server, "alice.1").await;
    let bob = device(&server, "bob.1").await;

    alice.send("alice.1", BOB_USER, "bob.1", b"first").await;

    bob.manager.delete_user("bob.1").await.unwrap();
    bob.manager.create_user("bob.1", SERVER_URL, CURVE, 10).await.unwrap();
    alice.manager.stale_sessions("alice.1", "bob.1").await.unwrap();

    let err = alice
        .manager
        .encrypt("alice.1", BOB_USER, &ids(&["bob.1"]), b"again", None)
        .await
        .unwrap_err();
    assert!(matches!(err, LimeError::AllRecipientsFailed));

    // once forgotten, the new device is accepted
    alice.manager.delete_peer_device("bob.1").await.unwrap();
    let out = alice.send("alice.1", BOB_USER, "bob.1", b"again").await;
    assert_eq!(out.recipients[0].peer_status, PeerDeviceStatus::Unknown);
    let got = bob.receive("bob.1", BOB_USER, "alice.1", &out).await;
    assert_eq!(got.plaintext, b"again");
}
