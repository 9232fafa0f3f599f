// Движок OTR: точка входа для хоста
//
// The engine holds the long-term identity, the configuration and our
// instance tag. Conversations live in a ConversationStore the host owns and
// passes to every call; the host serializes calls per peer.

use crate::config::Config;
use crate::crypto::keys::IdentityKeys;
use crate::crypto::provider::CryptoProvider;
use crate::crypto::smp::SmpPhase;
use crate::crypto::suites::classic::ClassicSuiteProvider;
use crate::error::CryptoError;
use crate::protocol::messages::{
    Body, DataMessage, EncodedMessage, Fragment, InstanceTag, Message, FLAG_IGNORE_UNREADABLE,
    MIN_VALID_INSTANCE_TAG,
};
use crate::protocol::validation::validate_sender_tag;
use crate::protocol::version::{self, Version, VersionSet};
use crate::protocol::wire;
use crate::state::conversation::{Context, Conversation, Step};
use crate::state::events::{ConversationState, Event};
use crate::state::store::{ConversationStore, PeerRecord, MASTER_INSTANCE};
use crate::utils::error::{OtrError, Result};

/// Text of the error line sent back for data messages we cannot read.
pub const UNREADABLE_MESSAGE_ERROR: &str = "Encrypted message could not be read";

/// Everything produced by one incoming line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Text to show the user, if any.
    pub plaintext: Option<String>,
    /// Lines to send back to the peer, in order.
    pub outgoing: Vec<String>,
    pub events: Vec<Event>,
}

pub struct Engine<P: CryptoProvider = ClassicSuiteProvider> {
    identity: IdentityKeys<P>,
    config: Config,
    instance_tag: InstanceTag,
}

impl<P: CryptoProvider> Engine<P> {
    /// Engine with the global configuration and a fresh instance tag.
    pub fn new(identity: IdentityKeys<P>) -> Result<Self> {
        Self::with_config(identity, Config::global().clone())
    }

    pub fn with_config(identity: IdentityKeys<P>, config: Config) -> Result<Self> {
        let instance_tag = generate_instance_tag::<P>()?;
        Self::with_instance_tag(identity, config, instance_tag)
    }

    /// Engine with a known instance tag, e.g. one the host persisted.
    pub fn with_instance_tag(
        identity: IdentityKeys<P>,
        config: Config,
        instance_tag: InstanceTag,
    ) -> Result<Self> {
        use tracing::info;

        validate_sender_tag(instance_tag)?;
        info!(
            target: "otr::engine",
            instance_tag = instance_tag,
            suite_id = P::suite_id(),
            "Engine created"
        );
        Ok(Self {
            identity,
            config,
            instance_tag,
        })
    }

    pub fn identity(&self) -> &IdentityKeys<P> {
        &self.identity
    }

    pub fn fingerprint(&self) -> String {
        self.identity.fingerprint()
    }

    pub fn instance_tag(&self) -> InstanceTag {
        self.instance_tag
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn context(&self) -> Context<'_, P> {
        Context {
            identity: &self.identity,
            config: &self.config,
            our_instance: self.instance_tag,
        }
    }

    /// Versions we announce and accept. Version 1 is never run.
    fn versions(&self) -> VersionSet {
        let mut versions = self.config.allowed_versions;
        versions.remove(Version::V1);
        versions
    }

    fn query_message(&self) -> Result<String> {
        let versions = self.versions();
        if versions.is_empty() {
            return Err(OtrError::NoCompatibleVersion);
        }
        wire::serialize(&Message::Query(versions))
    }

    // ========================================================================
    // Outgoing
    // ========================================================================

    /// Prepare user text for `peer`.
    ///
    /// Encrypted: the data message lines. Plaintext with encryption required:
    /// the text is queued and a Query is returned the first time. Finished:
    /// `ConversationFinished`, nothing is sent.
    pub fn submit_outgoing(
        &self,
        store: &mut ConversationStore<P>,
        peer: &str,
        plaintext: &str,
    ) -> Result<Vec<String>> {
        use tracing::debug;

        let ctx = self.context();
        let record = store.peer_mut(peer);
        let state = record
            .active_conversation()
            .map_or(ConversationState::Plaintext, Conversation::state);

        match state {
            ConversationState::Encrypted => encrypted_conversation(record)?.send_text(plaintext, &ctx),
            ConversationState::Finished => Err(OtrError::ConversationFinished),
            ConversationState::Plaintext if !self.config.require_encryption => {
                Ok(vec![plaintext.to_string()])
            }
            ConversationState::Plaintext => {
                let first = record.pending_count() == 0;
                record.enqueue(plaintext, self.config.max_pending_outgoing)?;
                debug!(
                    target: "otr::engine",
                    pending = record.pending_count(),
                    "Queued outgoing message until the conversation is encrypted"
                );
                if first && !record.handshake_in_progress() {
                    Ok(vec![self.query_message()?])
                } else {
                    Ok(Vec::new())
                }
            }
        }
    }

    /// Ask `peer` for a private conversation.
    ///
    /// With an encrypted conversation already up this refreshes its keys
    /// directly; otherwise a Query is sent.
    pub fn start_auth(&self, store: &mut ConversationStore<P>, peer: &str) -> Result<Vec<String>> {
        let ctx = self.context();
        let record = store.peer_mut(peer);
        let refresh_version = record
            .active_conversation()
            .filter(|c| c.state() == ConversationState::Encrypted)
            .and_then(Conversation::version);

        match refresh_version {
            Some(version) => encrypted_conversation(record)?.start_ake(version, &ctx),
            None => Ok(vec![self.query_message()?]),
        }
    }

    /// Start SMP on the active encrypted conversation.
    pub fn start_smp(
        &self,
        store: &mut ConversationStore<P>,
        peer: &str,
        secret: &[u8],
        question: Option<&str>,
    ) -> Result<Vec<String>> {
        let ctx = self.context();
        encrypted_conversation(store.peer_mut(peer))?.start_smp(
            secret,
            question.map(str::to_string),
            &ctx,
        )
    }

    /// Answer the peer's pending SMP request.
    pub fn respond_smp(
        &self,
        store: &mut ConversationStore<P>,
        peer: &str,
        secret: &[u8],
    ) -> Result<Vec<String>> {
        let ctx = self.context();
        store
            .peer_mut(peer)
            .conversations_mut()
            .find(|c| c.smp_phase() == SmpPhase::AwaitingSecret)
            .ok_or_else(|| OtrError::InvalidState("no SMP request to answer".to_string()))?
            .respond_smp(secret, &ctx)
    }

    /// Abort every running SMP with `peer`.
    pub fn abort_smp(&self, store: &mut ConversationStore<P>, peer: &str) -> Result<Vec<String>> {
        let ctx = self.context();
        let mut outgoing = Vec::new();
        for conversation in store.peer_mut(peer).conversations_mut() {
            outgoing.extend(conversation.abort_smp(&ctx)?);
        }
        Ok(outgoing)
    }

    /// End every private conversation with `peer` and drop queued messages.
    pub fn end_conversation(&self, store: &mut ConversationStore<P>, peer: &str) -> Result<Vec<String>> {
        use tracing::debug;

        let ctx = self.context();
        let record = store.peer_mut(peer);
        let dropped = record.take_pending().len();
        if dropped > 0 {
            debug!(target: "otr::engine", dropped = dropped, "Discarded queued messages");
        }

        let mut outgoing = Vec::new();
        for conversation in record.conversations_mut() {
            outgoing.extend(conversation.end(&ctx)?);
        }
        record.set_active_instance(MASTER_INSTANCE);
        Ok(outgoing)
    }

    // ========================================================================
    // Incoming
    // ========================================================================

    /// Process one line of transport text from `peer`.
    ///
    /// Malformed or unexpected input is dropped; it never changes state.
    pub fn deliver_incoming(&self, store: &mut ConversationStore<P>, peer: &str, text: &str) -> Delivery {
        use tracing::debug;

        let mut delivery = Delivery::default();
        match wire::parse(text) {
            Ok(Message::Plaintext(plain)) => {
                // A Query inside ordinary text is honoured; the text is still shown.
                let embedded = wire::parse_embedded(&plain);
                self.dispatch(store, peer, Message::Plaintext(plain), &mut delivery);
                if let Some(query @ Message::Query(_)) = embedded {
                    self.dispatch(store, peer, query, &mut delivery);
                }
            }
            Ok(message) => self.dispatch(store, peer, message, &mut delivery),
            Err(err) => match wire::parse_embedded(text) {
                // "?OTRv3? hi": the line is shown like any text carrying a Query.
                Some(query @ Message::Query(_)) => {
                    self.dispatch(store, peer, Message::Plaintext(text.to_string()), &mut delivery);
                    self.dispatch(store, peer, query, &mut delivery);
                }
                Some(message) => self.dispatch(store, peer, message, &mut delivery),
                None => debug!(target: "otr::engine", error = %err, "Discarding malformed message"),
            },
        }
        delivery
    }

    fn dispatch(&self, store: &mut ConversationStore<P>, peer: &str, message: Message, delivery: &mut Delivery) {
        match message {
            Message::Plaintext(text) => {
                if store.peer(peer).map_or(false, PeerRecord::any_encrypted) {
                    delivery.events.push(Event::UnencryptedReceived);
                }
                delivery.plaintext = Some(text);
            }
            Message::Query(versions) => self.on_query(store, peer, versions, delivery),
            Message::Error(text) => {
                for conversation in store.peer_mut(peer).conversations_mut() {
                    if let Some(event) = conversation.abort_exchanges() {
                        delivery.events.push(event);
                    }
                }
                delivery.events.push(Event::PeerError(text));
            }
            Message::Fragment(fragment) => self.on_fragment(store, peer, fragment, delivery),
            Message::Encoded(encoded) => self.on_encoded(store, peer, encoded, delivery),
        }
    }

    fn on_query(&self, store: &mut ConversationStore<P>, peer: &str, versions: VersionSet, delivery: &mut Delivery) {
        use tracing::{debug, warn};

        let version = match version::merge(self.versions(), versions) {
            Ok(version) => version,
            Err(_) => {
                debug!(target: "otr::engine", offered = versions.bits(), "No common protocol version");
                delivery.events.push(Event::NoCompatibleVersion);
                return;
            }
        };

        let ctx = self.context();
        // The peer's instance is unknown until it answers.
        match store.peer_mut(peer).master().start_ake(version, &ctx) {
            Ok(lines) => delivery.outgoing.extend(lines),
            Err(err) => warn!(target: "otr::engine", error = %err, "Could not start AKE"),
        }
    }

    fn on_fragment(&self, store: &mut ConversationStore<P>, peer: &str, fragment: Fragment, delivery: &mut Delivery) {
        use tracing::{debug, trace};

        let instance = match fragment.instance_tags {
            Some((sender, receiver)) => {
                if validate_sender_tag(sender).is_err() || !self.addressed_to_us(receiver) {
                    trace!(target: "otr::engine", sender = sender, receiver = receiver, "Fragment not for us");
                    return;
                }
                sender
            }
            None => MASTER_INSTANCE,
        };

        let completed = store.peer_mut(peer).reassemble(
            instance,
            &fragment,
            self.config.max_fragments,
            self.config.max_instances,
        );

        match completed {
            None => {}
            Some(Ok(Message::Fragment(_))) => {
                debug!(target: "otr::engine", "Reassembled text is itself a fragment, dropping")
            }
            Some(Ok(message)) => self.dispatch(store, peer, message, delivery),
            Some(Err(err)) => debug!(target: "otr::engine", error = %err, "Reassembled message is malformed"),
        }
    }

    fn addressed_to_us(&self, receiver: InstanceTag) -> bool {
        receiver == MASTER_INSTANCE || receiver == self.instance_tag
    }

    fn on_encoded(&self, store: &mut ConversationStore<P>, peer: &str, message: EncodedMessage, delivery: &mut Delivery) {
        use tracing::{debug, trace, warn};

        if !self.versions().contains(message.version) {
            debug!(target: "otr::engine", version = message.version.number(), "Version not allowed, dropping");
            return;
        }

        let instance = if message.version.has_instance_tags() {
            // Only a DH-Commit may be addressed to "any instance".
            let for_us = message.receiver_instance == self.instance_tag
                || (message.receiver_instance == MASTER_INSTANCE
                    && matches!(message.body, Body::DhCommit(_)));
            if !for_us {
                trace!(
                    target: "otr::engine",
                    receiver = message.receiver_instance,
                    "Message for another instance, dropping"
                );
                return;
            }
            message.sender_instance
        } else {
            MASTER_INSTANCE
        };

        let ctx = self.context();
        let record = store.peer_mut(peer);
        let verified = record.verified_fingerprints().clone();

        let step = match &message.body {
            // Data never creates a conversation.
            Body::Data(data) => match self.on_data(record.conversation_mut(instance), &message, data, &ctx) {
                Ok(step) => step,
                Err(err) => {
                    debug!(target: "otr::engine", instance = instance, error = %err, "Data message dropped");
                    if self.should_report_unreadable(&err, data) {
                        self.report_unreadable(instance, delivery);
                    }
                    return;
                }
            },
            _ => {
                let Some(conversation) = record.open_for_handshake(instance, self.config.max_instances) else {
                    return;
                };
                match conversation.receive_ake(&message, &ctx, &verified) {
                    Ok(step) => step,
                    Err(err) => {
                        warn!(target: "otr::engine", instance = instance, error = %err, "AKE message dropped");
                        return;
                    }
                }
            }
        };

        self.apply(record, instance, step, &ctx, delivery);
    }

    fn on_data(
        &self,
        conversation: Option<&mut Conversation<P>>,
        message: &EncodedMessage,
        data: &DataMessage,
        ctx: &Context<'_, P>,
    ) -> Result<Step> {
        match conversation {
            Some(conversation) if conversation.state() == ConversationState::Encrypted => {
                conversation.receive_data(message, data, ctx)
            }
            _ => Err(OtrError::UnknownKeyId {
                sender_keyid: data.sender_keyid,
                recipient_keyid: data.recipient_keyid,
            }),
        }
    }

    fn should_report_unreadable(&self, err: &OtrError, data: &DataMessage) -> bool {
        matches!(err, OtrError::UnknownKeyId { .. }) && data.flags & FLAG_IGNORE_UNREADABLE == 0
    }

    fn report_unreadable(&self, instance: InstanceTag, delivery: &mut Delivery) {
        use tracing::warn;

        delivery.events.push(Event::Unreadable { instance });
        if !self.config.error_on_unreadable {
            return;
        }
        match wire::serialize(&Message::Error(UNREADABLE_MESSAGE_ERROR.to_string())) {
            Ok(line) => delivery.outgoing.push(line),
            Err(err) => warn!(target: "otr::engine", error = %err, "Could not build error reply"),
        }
    }

    /// Merge a conversation step into the delivery; once secure, flush the
    /// queue in submission order.
    fn apply(
        &self,
        record: &mut PeerRecord<P>,
        instance: InstanceTag,
        step: Step,
        ctx: &Context<'_, P>,
        delivery: &mut Delivery,
    ) {
        use tracing::{debug, warn};

        delivery.outgoing.extend(step.outgoing);
        delivery.events.extend(step.events);
        if step.plaintext.is_some() {
            delivery.plaintext = step.plaintext;
        }
        if let Some((fingerprint, verified)) = step.verification {
            record.set_verified(&fingerprint, verified);
        }
        if !step.went_secure {
            return;
        }

        record.set_active_instance(instance);
        if instance != MASTER_INSTANCE {
            record.settle_master();
        }
        let pending = record.take_pending();
        if pending.is_empty() {
            return;
        }
        debug!(target: "otr::engine", count = pending.len(), "Flushing queued messages");
        if let Some(conversation) = record.conversation_mut(instance) {
            for text in pending {
                match conversation.send_text(&text, ctx) {
                    Ok(lines) => delivery.outgoing.extend(lines),
                    Err(err) => warn!(target: "otr::engine", error = %err, "Queued message could not be sent"),
                }
            }
        }
    }
}

fn encrypted_conversation<P: CryptoProvider>(record: &mut PeerRecord<P>) -> Result<&mut Conversation<P>> {
    let active = record.active_instance();
    record
        .conversation_mut(active)
        .filter(|c| c.state() == ConversationState::Encrypted)
        .ok_or_else(|| OtrError::InvalidState("no encrypted conversation".to_string()))
}

/// Random tag; values below 0x100 are reserved.
fn generate_instance_tag<P: CryptoProvider>() -> Result<InstanceTag> {
    loop {
        let bytes = P::random_bytes(4)?;
        let bytes: [u8; 4] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::KeyGenerationError("short random output".to_string()))?;
        let tag = u32::from_be_bytes(bytes);
        if tag >= MIN_VALID_INSTANCE_TAG {
            return Ok(tag);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type P = ClassicSuiteProvider;

    fn engine(config: Config) -> Engine<P> {
        Engine::with_config(IdentityKeys::generate().unwrap(), config).unwrap()
    }

    #[test]
    fn test_instance_tag_is_valid() {
        let engine = engine(Config::default());
        assert!(engine.instance_tag() >= MIN_VALID_INSTANCE_TAG);
    }

    #[test]
    fn test_reserved_instance_tag_rejected() {
        let identity = IdentityKeys::<P>::generate().unwrap();
        assert!(Engine::with_instance_tag(identity, Config::default(), 0x42).is_err());
    }

    #[test]
    fn test_plaintext_passes_through() {
        let engine = engine(Config::default());
        let mut store = ConversationStore::new();
        let delivery = engine.deliver_incoming(&mut store, "bob", "just text");
        assert_eq!(delivery.plaintext.as_deref(), Some("just text"));
        assert!(delivery.outgoing.is_empty());
        assert!(delivery.events.is_empty());
    }

    #[test]
    fn test_query_answered_with_commit() {
        let engine = engine(Config::default());
        let mut store = ConversationStore::new();
        let delivery = engine.deliver_incoming(&mut store, "bob", "?OTRv23?");
        assert_eq!(delivery.outgoing.len(), 1);
        assert!(delivery.outgoing[0].starts_with("?OTR:"));
        assert!(store.peer("bob").map_or(false, PeerRecord::handshake_in_progress));
    }

    #[test]
    fn test_query_without_common_version() {
        let engine = engine(Config::default());
        let mut store = ConversationStore::new();
        let delivery = engine.deliver_incoming(&mut store, "bob", "?OTR?");
        assert_eq!(delivery.events, vec![Event::NoCompatibleVersion]);
        assert!(delivery.outgoing.is_empty());
        assert_eq!(store.state("bob"), ConversationState::Plaintext);
    }

    #[test]
    fn test_malformed_input_dropped() {
        let engine = engine(Config::default());
        let mut store = ConversationStore::new();
        let delivery = engine.deliver_incoming(&mut store, "bob", "?OTR:not base64!.");
        assert_eq!(delivery, Delivery::default());
    }

    #[test]
    fn test_submit_queues_and_queries_once() {
        let engine = engine(Config::default());
        let mut store = ConversationStore::new();

        let first = engine.submit_outgoing(&mut store, "bob", "one").unwrap();
        assert_eq!(first, vec!["?OTRv23?".to_string()]);
        let second = engine.submit_outgoing(&mut store, "bob", "two").unwrap();
        assert!(second.is_empty());
        assert_eq!(store.peer("bob").map(PeerRecord::pending_count), Some(2));
    }

    #[test]
    fn test_queue_full() {
        let mut config = Config::default();
        config.max_pending_outgoing = 1;
        let engine = engine(config);
        let mut store = ConversationStore::new();

        engine.submit_outgoing(&mut store, "bob", "one").unwrap();
        assert_eq!(
            engine.submit_outgoing(&mut store, "bob", "two"),
            Err(OtrError::QueueFull(1))
        );
    }

    #[test]
    fn test_plaintext_allowed_when_not_required() {
        let mut config = Config::default();
        config.require_encryption = false;
        let engine = engine(config);
        let mut store = ConversationStore::new();
        assert_eq!(
            engine.submit_outgoing(&mut store, "bob", "hello").unwrap(),
            vec!["hello".to_string()]
        );
    }

    #[test]
    fn test_peer_error_surfaces() {
        let engine = engine(Config::default());
        let mut store = ConversationStore::new();
        engine.deliver_incoming(&mut store, "bob", "?OTRv3?");

        let delivery = engine.deliver_incoming(&mut store, "bob", "?OTR Error: something broke");
        assert_eq!(delivery.events, vec![Event::PeerError("something broke".to_string())]);
        assert!(!store.peer("bob").map_or(false, PeerRecord::handshake_in_progress));
    }

    #[test]
    fn test_smp_needs_encryption() {
        let engine = engine(Config::default());
        let mut store = ConversationStore::new();
        assert!(matches!(
            engine.start_smp(&mut store, "bob", b"secret", None),
            Err(OtrError::InvalidState(_))
        ));
        assert!(matches!(
            engine.respond_smp(&mut store, "bob", b"secret"),
            Err(OtrError::InvalidState(_))
        ));
    }
}
