//! End-to-end tests for the OTR engine
//!
//! Two (sometimes three) engines talk to each other through their public API
//! only:
//! - Query → AKE → Encrypted on both sides
//! - Queued messages, data round trips, replay and tampering
//! - Disconnect / Finished handling and unreadable messages
//! - SMP success, failure and abort; verified fingerprints
//! - Fragmentation, version 2 peers, instance tag filtering

use construct_otr::protocol::messages::{Body, Fragment, InstanceTag, Message};
use construct_otr::protocol::version::{Version, VersionSet};
use construct_otr::protocol::wire;
use construct_otr::{
    Config, ConversationState, ConversationStore, Delivery, Engine, Event, IdentityKeys, OtrError,
    SmpOutcome,
};

struct Party {
    name: &'static str,
    engine: Engine,
    store: ConversationStore,
}

impl Party {
    fn new(name: &'static str, config: Config) -> Self {
        let identity = IdentityKeys::generate().unwrap();
        Self {
            name,
            engine: Engine::with_config(identity, config).unwrap(),
            store: ConversationStore::new(),
        }
    }

    fn state_with(&self, peer: &Party) -> ConversationState {
        self.store.state(peer.name)
    }
}

/// Everything each side received while pumping.
#[derive(Default)]
struct Transcript {
    alice: Vec<Delivery>,
    bob: Vec<Delivery>,
}

impl Transcript {
    fn alice_events(&self) -> Vec<Event> {
        self.alice.iter().flat_map(|d| d.events.clone()).collect()
    }

    fn bob_events(&self) -> Vec<Event> {
        self.bob.iter().flat_map(|d| d.events.clone()).collect()
    }

    fn bob_plaintexts(&self) -> Vec<String> {
        self.bob.iter().filter_map(|d| d.plaintext.clone()).collect()
    }

    fn alice_plaintexts(&self) -> Vec<String> {
        self.alice.iter().filter_map(|d| d.plaintext.clone()).collect()
    }
}

/// Carry lines back and forth until both sides are quiet.
fn pump(alice: &mut Party, bob: &mut Party, from_alice: Vec<String>, from_bob: Vec<String>) -> Transcript {
    let mut transcript = Transcript::default();
    let mut to_bob = from_alice;
    let mut to_alice = from_bob;

    for _ in 0..64 {
        if to_bob.is_empty() && to_alice.is_empty() {
            return transcript;
        }
        let mut next_to_alice = Vec::new();
        for line in to_bob.drain(..) {
            let delivery = bob.engine.deliver_incoming(&mut bob.store, alice.name, &line);
            next_to_alice.extend(delivery.outgoing.clone());
            transcript.bob.push(delivery);
        }
        let mut next_to_bob = Vec::new();
        for line in to_alice.drain(..).chain(next_to_alice) {
            let delivery = alice.engine.deliver_incoming(&mut alice.store, bob.name, &line);
            next_to_bob.extend(delivery.outgoing.clone());
            transcript.alice.push(delivery);
        }
        to_bob = next_to_bob;
    }
    panic!("conversation did not settle");
}

fn secure_pair_with(alice_config: Config, bob_config: Config) -> (Party, Party, Transcript) {
    let mut alice = Party::new("alice", alice_config);
    let mut bob = Party::new("bob", bob_config);
    let query = alice.engine.start_auth(&mut alice.store, bob.name).unwrap();
    let transcript = pump(&mut alice, &mut bob, query, Vec::new());
    assert_eq!(alice.state_with(&bob), ConversationState::Encrypted);
    assert_eq!(bob.state_with(&alice), ConversationState::Encrypted);
    (alice, bob, transcript)
}

fn secure_pair() -> (Party, Party) {
    let (alice, bob, _) = secure_pair_with(Config::default(), Config::default());
    (alice, bob)
}

fn send(from: &mut Party, to: &Party, text: &str) -> Vec<String> {
    from.engine.submit_outgoing(&mut from.store, to.name, text).unwrap()
}

/// A genuine data line from an unrelated conversation, re-addressed.
fn foreign_data_line(sender: InstanceTag, receiver: InstanceTag) -> String {
    let (mut carol, dave) = secure_pair();
    let lines = send(&mut carol, &dave, "not for you");
    readdress(&lines[0], sender, receiver)
}

fn readdress(line: &str, sender: InstanceTag, receiver: InstanceTag) -> String {
    let mut encoded = match wire::parse(line).unwrap() {
        Message::Encoded(encoded) => encoded,
        other => panic!("expected encoded message, got {:?}", other),
    };
    encoded.sender_instance = sender;
    encoded.receiver_instance = receiver;
    wire::serialize_encoded(&encoded).unwrap()
}

fn instance_count(party: &Party, peer: &Party) -> usize {
    party.store.peer(peer.name).map_or(0, |record| record.instances().count())
}

fn gone_secure(events: &[Event]) -> Option<(Version, String, String, bool)> {
    events.iter().find_map(|e| match e {
        Event::GoneSecure {
            version,
            fingerprint,
            ssid,
            verified,
            ..
        } => Some((*version, fingerprint.clone(), ssid.clone(), *verified)),
        _ => None,
    })
}

// ============================================================================
// AKE
// ============================================================================

#[test]
fn test_query_leads_to_encrypted_conversation() {
    let (alice, bob, transcript) = secure_pair_with(Config::default(), Config::default());

    let (alice_version, alice_sees, alice_ssid, alice_verified) =
        gone_secure(&transcript.alice_events()).expect("alice went secure");
    let (bob_version, bob_sees, bob_ssid, _) =
        gone_secure(&transcript.bob_events()).expect("bob went secure");

    assert_eq!(alice_version, Version::V3);
    assert_eq!(bob_version, Version::V3);
    assert_eq!(alice_sees, bob.engine.fingerprint());
    assert_eq!(bob_sees, alice.engine.fingerprint());
    assert_eq!(alice_ssid, bob_ssid);
    assert!(!alice_verified);

    let conversation = alice.store.active_conversation(bob.name).unwrap();
    assert_eq!(conversation.their_instance(), bob.engine.instance_tag());
}

#[test]
fn test_no_compatible_version() {
    let mut alice_config = Config::default();
    alice_config.allowed_versions = VersionSet::from_versions(&[Version::V3]);
    let mut bob_config = Config::default();
    bob_config.allowed_versions = VersionSet::from_versions(&[Version::V2]);

    let mut alice = Party::new("alice", alice_config);
    let mut bob = Party::new("bob", bob_config);
    let query = alice.engine.start_auth(&mut alice.store, bob.name).unwrap();
    assert_eq!(query, vec!["?OTRv3?".to_string()]);

    let transcript = pump(&mut alice, &mut bob, query, Vec::new());
    assert_eq!(transcript.bob_events(), vec![Event::NoCompatibleVersion]);
    assert_eq!(bob.state_with(&alice), ConversationState::Plaintext);
}

#[test]
fn test_version_2_peer() {
    let mut bob_config = Config::default();
    bob_config.allowed_versions = VersionSet::from_versions(&[Version::V2]);
    let (mut alice, mut bob, transcript) = secure_pair_with(Config::default(), bob_config);

    let (version, ..) = gone_secure(&transcript.alice_events()).unwrap();
    assert_eq!(version, Version::V2);

    let lines = send(&mut alice, &bob, "over v2");
    let transcript = pump(&mut alice, &mut bob, lines, Vec::new());
    assert_eq!(transcript.bob_plaintexts(), vec!["over v2".to_string()]);
}

#[test]
fn test_query_with_trailing_text_shows_text() {
    let mut alice = Party::new("alice", Config::default());
    let mut bob = Party::new("bob", Config::default());

    let delivery = bob.engine.deliver_incoming(&mut bob.store, alice.name, "?OTRv3? hi");
    assert_eq!(delivery.plaintext.as_deref(), Some("?OTRv3? hi"));
    assert_eq!(delivery.outgoing.len(), 1);

    pump(&mut alice, &mut bob, Vec::new(), delivery.outgoing);
    assert_eq!(bob.state_with(&alice), ConversationState::Encrypted);
}

#[test]
fn test_unrelated_instance_does_not_disturb_pending_ake() {
    let mut alice = Party::new("alice", Config::default());
    let mut bob = Party::new("bob", Config::default());
    let bob_tag = bob.engine.instance_tag();

    let query = alice.engine.start_auth(&mut alice.store, bob.name).unwrap();
    let commit = bob.engine.deliver_incoming(&mut bob.store, alice.name, &query[0]).outgoing;
    let dh_key = alice.engine.deliver_incoming(&mut alice.store, bob.name, &commit[0]).outgoing;
    assert_eq!(dh_key.len(), 1);

    // Unreadable data from an instance Bob has never talked to.
    let stray = foreign_data_line(0x9999, bob_tag);
    let delivery = bob.engine.deliver_incoming(&mut bob.store, alice.name, &stray);
    assert_eq!(delivery.events, vec![Event::Unreadable { instance: 0x9999 }]);
    assert!(bob.store.conversation(alice.name, 0x9999).is_none());

    // A DH-Key from another instance gets its own copy of the commitment.
    let decoy = readdress(&dh_key[0], 0x9999, bob_tag);
    let delivery = bob.engine.deliver_incoming(&mut bob.store, alice.name, &decoy);
    assert_eq!(delivery.outgoing.len(), 1);

    pump(&mut alice, &mut bob, dh_key, Vec::new());
    assert_eq!(alice.state_with(&bob), ConversationState::Encrypted);
    assert_eq!(bob.state_with(&alice), ConversationState::Encrypted);
    // Bob's own commitment is settled once one instance went secure.
    assert_eq!(
        bob.store.conversation(alice.name, 0).map(|c| c.handshake_in_progress()),
        Some(false)
    );
}

#[test]
fn test_rejected_input_does_not_grow_instance_map() {
    let alice = Party::new("alice", Config::default());
    let mut bob = Party::new("bob", Config::default());
    let bob_tag = bob.engine.instance_tag();
    let limit = Config::default().max_instances;

    let data = foreign_data_line(0x1000, bob_tag);
    for tag in 0..200u32 {
        let line = readdress(&data, 0x1000 + tag, bob_tag);
        bob.engine.deliver_incoming(&mut bob.store, alice.name, &line);
    }
    assert_eq!(instance_count(&bob, &alice), 0);

    for tag in 0..200u32 {
        let line = wire::serialize_fragment(&Fragment {
            instance_tags: Some((0x2000 + tag, bob_tag)),
            index: 1,
            total: 2,
            piece: "abc".to_string(),
        });
        bob.engine.deliver_incoming(&mut bob.store, alice.name, &line);
    }
    assert_eq!(bob.store.peer(alice.name).unwrap().partial_messages(), limit);
    assert_eq!(instance_count(&bob, &alice), 0);

    // Handshake attempts are capped too.
    let mut carol = Party::new("carol", Config::default());
    let carol_commit = carol
        .engine
        .deliver_incoming(&mut carol.store, "someone", "?OTRv3?")
        .outgoing;
    for tag in 0..200u32 {
        let line = readdress(&carol_commit[0], 0x3000 + tag, 0);
        bob.engine.deliver_incoming(&mut bob.store, alice.name, &line);
    }
    assert_eq!(instance_count(&bob, &alice), limit);
}

#[test]
fn test_embedded_query_starts_ake() {
    let mut alice = Party::new("alice", Config::default());
    let mut bob = Party::new("bob", Config::default());

    let delivery = bob.engine.deliver_incoming(
        &mut bob.store,
        alice.name,
        "Let's talk privately ?OTRv23? (install a plugin)",
    );
    assert_eq!(
        delivery.plaintext.as_deref(),
        Some("Let's talk privately ?OTRv23? (install a plugin)")
    );
    assert_eq!(delivery.outgoing.len(), 1);

    pump(&mut alice, &mut bob, Vec::new(), delivery.outgoing);
    assert_eq!(alice.state_with(&bob), ConversationState::Encrypted);
    assert_eq!(bob.state_with(&alice), ConversationState::Encrypted);
}

// ============================================================================
// Data
// ============================================================================

#[test]
fn test_messages_both_directions() {
    let (mut alice, mut bob) = secure_pair();

    for round in 0..3 {
        let lines = send(&mut alice, &bob, &format!("ping {}", round));
        let transcript = pump(&mut alice, &mut bob, lines, Vec::new());
        assert_eq!(transcript.bob_plaintexts(), vec![format!("ping {}", round)]);

        let lines = send(&mut bob, &alice, &format!("pong {}", round));
        let transcript = pump(&mut alice, &mut bob, Vec::new(), lines);
        assert_eq!(transcript.alice_plaintexts(), vec![format!("pong {}", round)]);
    }
}

#[test]
fn test_queued_messages_flushed_in_order() {
    let mut alice = Party::new("alice", Config::default());
    let mut bob = Party::new("bob", Config::default());

    let query = send(&mut alice, &bob, "one");
    assert_eq!(query, vec!["?OTRv23?".to_string()]);
    assert!(send(&mut alice, &bob, "two").is_empty());
    assert!(send(&mut alice, &bob, "three").is_empty());

    let transcript = pump(&mut alice, &mut bob, query, Vec::new());
    assert_eq!(
        transcript.bob_plaintexts(),
        vec!["one".to_string(), "two".to_string(), "three".to_string()]
    );
    assert_eq!(alice.store.peer(bob.name).unwrap().pending_count(), 0);
}

#[test]
fn test_replay_is_dropped() {
    let (mut alice, mut bob) = secure_pair();
    let lines = send(&mut alice, &bob, "only once");
    assert_eq!(lines.len(), 1);

    let first = bob.engine.deliver_incoming(&mut bob.store, alice.name, &lines[0]);
    assert_eq!(first.plaintext.as_deref(), Some("only once"));

    let replay = bob.engine.deliver_incoming(&mut bob.store, alice.name, &lines[0]);
    assert_eq!(replay, Delivery::default());
    assert_eq!(bob.state_with(&alice), ConversationState::Encrypted);

    let lines = send(&mut alice, &bob, "still fine");
    let transcript = pump(&mut alice, &mut bob, lines, Vec::new());
    assert_eq!(transcript.bob_plaintexts(), vec!["still fine".to_string()]);
}

#[test]
fn test_tampered_message_is_dropped() {
    let (mut alice, mut bob) = secure_pair();
    let lines = send(&mut alice, &bob, "untouched");

    let mut encoded = match wire::parse(&lines[0]).unwrap() {
        Message::Encoded(encoded) => encoded,
        other => panic!("expected encoded message, got {:?}", other),
    };
    if let Body::Data(data) = &mut encoded.body {
        data.ciphertext[0] ^= 0x01;
    }
    let tampered = wire::serialize_encoded(&encoded).unwrap();

    let delivery = bob.engine.deliver_incoming(&mut bob.store, alice.name, &tampered);
    assert!(delivery.plaintext.is_none());
    assert!(delivery.outgoing.is_empty());

    let delivery = bob.engine.deliver_incoming(&mut bob.store, alice.name, &lines[0]);
    assert_eq!(delivery.plaintext.as_deref(), Some("untouched"));
}

#[test]
fn test_forged_mac_leaves_conversation_usable() {
    let (mut alice, mut bob) = secure_pair();
    let lines = send(&mut alice, &bob, "genuine");

    let mut encoded = match wire::parse(&lines[0]).unwrap() {
        Message::Encoded(encoded) => encoded,
        other => panic!("expected encoded message, got {:?}", other),
    };
    if let Body::Data(data) = &mut encoded.body {
        data.mac[0] ^= 0x01;
    }
    let forged = wire::serialize_encoded(&encoded).unwrap();
    assert_eq!(
        bob.engine.deliver_incoming(&mut bob.store, alice.name, &forged),
        Delivery::default()
    );

    let transcript = pump(&mut alice, &mut bob, lines, Vec::new());
    assert_eq!(transcript.bob_plaintexts(), vec!["genuine".to_string()]);
    let reply = send(&mut bob, &alice, "got it");
    let transcript = pump(&mut alice, &mut bob, Vec::new(), reply);
    assert_eq!(transcript.alice_plaintexts(), vec!["got it".to_string()]);
}

#[test]
fn test_unreadable_message_answered_with_error() {
    let (mut alice, mut bob) = secure_pair();
    // Bob's host lost all conversation state.
    bob.store = ConversationStore::new();

    let lines = send(&mut alice, &bob, "can you read this?");
    let delivery = bob.engine.deliver_incoming(&mut bob.store, alice.name, &lines[0]);
    assert!(delivery.plaintext.is_none());
    assert_eq!(
        delivery.events,
        vec![Event::Unreadable {
            instance: alice.engine.instance_tag()
        }]
    );
    assert_eq!(delivery.outgoing.len(), 1);
    assert!(delivery.outgoing[0].starts_with("?OTR Error:"));

    let reply = alice.engine.deliver_incoming(&mut alice.store, bob.name, &delivery.outgoing[0]);
    assert!(matches!(&reply.events[..], [Event::PeerError(_)]));
}

#[test]
fn test_message_for_other_instance_is_ignored() {
    let (mut alice, bob) = secure_pair();
    let mut carol = Party::new("carol", Config::default());

    let lines = send(&mut alice, &bob, "for bob only");
    let delivery = carol.engine.deliver_incoming(&mut carol.store, alice.name, &lines[0]);
    assert_eq!(delivery, Delivery::default());
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_disconnect_finishes_peer_conversation() {
    let (mut alice, mut bob) = secure_pair();

    let lines = alice.engine.end_conversation(&mut alice.store, bob.name).unwrap();
    assert_eq!(alice.state_with(&bob), ConversationState::Plaintext);

    let transcript = pump(&mut alice, &mut bob, lines, Vec::new());
    assert_eq!(bob.state_with(&alice), ConversationState::Finished);
    assert!(transcript.bob_events().contains(&Event::PeerEnded {
        instance: alice.engine.instance_tag()
    }));

    assert_eq!(
        bob.engine.submit_outgoing(&mut bob.store, alice.name, "hello?"),
        Err(OtrError::ConversationFinished)
    );

    bob.engine.end_conversation(&mut bob.store, alice.name).unwrap();
    assert_eq!(bob.state_with(&alice), ConversationState::Plaintext);
    assert_eq!(
        send(&mut bob, &alice, "again"),
        vec!["?OTRv23?".to_string()]
    );
}

#[test]
fn test_refresh_keeps_conversation_encrypted() {
    let (mut alice, mut bob) = secure_pair();

    let commit = alice.engine.start_auth(&mut alice.store, bob.name).unwrap();
    assert!(commit[0].starts_with("?OTR:"));
    let transcript = pump(&mut alice, &mut bob, commit, Vec::new());
    assert!(gone_secure(&transcript.alice_events()).is_some());
    assert!(gone_secure(&transcript.bob_events()).is_some());

    let lines = send(&mut bob, &alice, "after refresh");
    let transcript = pump(&mut alice, &mut bob, Vec::new(), lines);
    assert_eq!(transcript.alice_plaintexts(), vec!["after refresh".to_string()]);
}

#[test]
fn test_fragmented_conversation() {
    let mut config = Config::default();
    config.max_fragment_size = 150;
    let (mut alice, mut bob, transcript) = secure_pair_with(config.clone(), config);
    assert!(gone_secure(&transcript.bob_events()).is_some());

    let long_text = "a fairly long message ".repeat(20);
    let lines = send(&mut alice, &bob, &long_text);
    assert!(lines.len() > 1);
    assert!(lines.iter().all(|l| l.starts_with("?OTR|") && l.len() <= 150));

    let transcript = pump(&mut alice, &mut bob, lines, Vec::new());
    assert_eq!(transcript.bob_plaintexts(), vec![long_text]);
}

// ============================================================================
// SMP
// ============================================================================

fn run_smp(alice: &mut Party, bob: &mut Party, alice_secret: &[u8], bob_secret: &[u8]) -> (Transcript, Transcript) {
    let smp1 = alice
        .engine
        .start_smp(&mut alice.store, bob.name, alice_secret, Some("Where did we meet?"))
        .unwrap();
    let request = pump(alice, bob, smp1, Vec::new());
    assert!(request.bob_events().contains(&Event::SmpRequest {
        instance: alice.engine.instance_tag(),
        question: Some("Where did we meet?".to_string()),
    }));

    let smp2 = bob.engine.respond_smp(&mut bob.store, alice.name, bob_secret).unwrap();
    let rest = pump(alice, bob, Vec::new(), smp2);
    (request, rest)
}

#[test]
fn test_smp_success_verifies_fingerprints() {
    let (mut alice, mut bob) = secure_pair();
    let (_, transcript) = run_smp(&mut alice, &mut bob, b"the library", b"the library");

    assert!(transcript.alice_events().contains(&Event::SmpComplete {
        instance: bob.engine.instance_tag(),
        outcome: SmpOutcome::Success,
    }));
    assert!(transcript.bob_events().contains(&Event::SmpComplete {
        instance: alice.engine.instance_tag(),
        outcome: SmpOutcome::Success,
    }));
    assert!(alice.store.is_verified(bob.name, &bob.engine.fingerprint()));
    assert!(bob.store.is_verified(alice.name, &alice.engine.fingerprint()));

    // The next AKE with the same key starts out verified.
    let commit = alice.engine.start_auth(&mut alice.store, bob.name).unwrap();
    let transcript = pump(&mut alice, &mut bob, commit, Vec::new());
    let (.., verified) = gone_secure(&transcript.alice_events()).unwrap();
    assert!(verified);
}

#[test]
fn test_smp_different_secrets_fail() {
    let (mut alice, mut bob) = secure_pair();
    let (_, transcript) = run_smp(&mut alice, &mut bob, b"the library", b"the park");

    assert!(transcript.alice_events().contains(&Event::SmpComplete {
        instance: bob.engine.instance_tag(),
        outcome: SmpOutcome::Failed,
    }));
    assert!(!alice.store.is_verified(bob.name, &bob.engine.fingerprint()));
    assert!(!bob.store.is_verified(alice.name, &alice.engine.fingerprint()));
    assert_eq!(alice.state_with(&bob), ConversationState::Encrypted);
}

#[test]
fn test_smp_abort() {
    let (mut alice, mut bob) = secure_pair();
    let smp1 = alice
        .engine
        .start_smp(&mut alice.store, bob.name, b"secret", None)
        .unwrap();
    pump(&mut alice, &mut bob, smp1, Vec::new());

    let abort = bob.engine.abort_smp(&mut bob.store, alice.name).unwrap();
    assert_eq!(abort.len(), 1);
    let transcript = pump(&mut alice, &mut bob, Vec::new(), abort);
    assert!(transcript.alice_events().contains(&Event::SmpComplete {
        instance: bob.engine.instance_tag(),
        outcome: SmpOutcome::Aborted,
    }));

    // Nothing left to answer on either side.
    assert!(bob.engine.respond_smp(&mut bob.store, alice.name, b"secret").is_err());

    // A fresh run still works.
    let (_, transcript) = run_smp(&mut alice, &mut bob, b"again", b"again");
    assert!(transcript.bob_events().contains(&Event::SmpComplete {
        instance: alice.engine.instance_tag(),
        outcome: SmpOutcome::Success,
    }));
}
