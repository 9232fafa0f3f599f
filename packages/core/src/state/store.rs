// Хранилище бесед, принадлежащее хосту
//
// One record per peer account. Inside it, conversations are keyed by the
// peer's instance tag; tag 0 is the master conversation used before the peer's
// instance is known (Query answers, version 2 peers).

use crate::crypto::provider::CryptoProvider;
use crate::crypto::suites::classic::ClassicSuiteProvider;
use crate::protocol::fragment::Reassembler;
use crate::protocol::messages::{Fragment, InstanceTag, Message};
use crate::state::conversation::Conversation;
use crate::state::events::ConversationState;
use crate::utils::error::{OtrError, Result};
use std::collections::{HashMap, HashSet, VecDeque};

/// Conversation used until the peer's instance tag is known.
pub const MASTER_INSTANCE: InstanceTag = 0;

/// Everything the engine keeps about one peer account.
#[derive(Debug)]
pub struct PeerRecord<P: CryptoProvider> {
    conversations: HashMap<InstanceTag, Conversation<P>>,
    active_instance: InstanceTag,
    pending_outgoing: VecDeque<String>,
    verified_fingerprints: HashSet<String>,
    /// Partial fragmented messages, only while a message is incomplete.
    reassembly: HashMap<InstanceTag, Reassembler>,
}

impl<P: CryptoProvider> PeerRecord<P> {
    pub fn new() -> Self {
        Self {
            conversations: HashMap::new(),
            active_instance: MASTER_INSTANCE,
            pending_outgoing: VecDeque::new(),
            verified_fingerprints: HashSet::new(),
            reassembly: HashMap::new(),
        }
    }

    pub fn conversation(&self, instance: InstanceTag) -> Option<&Conversation<P>> {
        self.conversations.get(&instance)
    }

    /// Conversation outgoing user messages go to: the instance that most
    /// recently went secure, else the master.
    pub fn active_conversation(&self) -> Option<&Conversation<P>> {
        self.conversations.get(&self.active_instance)
    }

    pub fn active_instance(&self) -> InstanceTag {
        self.active_instance
    }

    pub(crate) fn set_active_instance(&mut self, instance: InstanceTag) {
        self.active_instance = instance;
    }

    pub fn instances(&self) -> impl Iterator<Item = InstanceTag> + '_ {
        self.conversations.keys().copied()
    }

    /// Whether any instance has a private conversation up.
    pub fn any_encrypted(&self) -> bool {
        self.conversations
            .values()
            .any(|c| c.state() == ConversationState::Encrypted)
    }

    /// Master conversation, created if needed.
    pub(crate) fn master(&mut self) -> &mut Conversation<P> {
        self.conversations
            .entry(MASTER_INSTANCE)
            .or_insert_with(|| Conversation::new(MASTER_INSTANCE))
    }

    /// Conversation for an AKE message from `instance`. A commitment pending
    /// on the master is copied in; the master keeps its own so that a stray
    /// instance cannot take it over.
    ///
    /// `None` when `limit` tagged instances are already tracked and none of
    /// them is idle.
    pub(crate) fn open_for_handshake(&mut self, instance: InstanceTag, limit: usize) -> Option<&mut Conversation<P>> {
        use tracing::debug;

        if instance == MASTER_INSTANCE {
            return Some(self.master());
        }
        if !self.conversations.contains_key(&instance) && !self.make_room(limit) {
            debug!(target: "otr::conversation", instance = instance, "Instance limit reached, dropping");
            return None;
        }

        let pending = self
            .conversations
            .get(&MASTER_INSTANCE)
            .and_then(Conversation::pending_commit);
        let conversation = self
            .conversations
            .entry(instance)
            .or_insert_with(|| Conversation::new(instance));
        if let Some((ake, version)) = pending {
            conversation.adopt_handshake(ake, version);
        }
        Some(conversation)
    }

    /// Evict idle tagged conversations until there is room for one more.
    fn make_room(&mut self, limit: usize) -> bool {
        if self.tagged_count() < limit {
            return true;
        }
        let active = self.active_instance;
        self.conversations.retain(|tag, c| {
            *tag == MASTER_INSTANCE
                || *tag == active
                || c.state() != ConversationState::Plaintext
                || c.handshake_in_progress()
        });
        self.tagged_count() < limit
    }

    fn tagged_count(&self) -> usize {
        self.conversations
            .keys()
            .filter(|tag| **tag != MASTER_INSTANCE)
            .count()
    }

    /// Stop the master's handshake once a tagged instance has gone secure.
    pub(crate) fn settle_master(&mut self) {
        if let Some(master) = self.conversations.get_mut(&MASTER_INSTANCE) {
            master.abort_handshake();
        }
    }

    pub(crate) fn conversation_mut(&mut self, instance: InstanceTag) -> Option<&mut Conversation<P>> {
        self.conversations.get_mut(&instance)
    }

    /// Whether an AKE is running on any instance.
    pub fn handshake_in_progress(&self) -> bool {
        self.conversations.values().any(Conversation::handshake_in_progress)
    }

    pub(crate) fn conversations_mut(&mut self) -> impl Iterator<Item = &mut Conversation<P>> {
        self.conversations.values_mut()
    }

    // ========================================================================
    // Сборка фрагментов
    // ========================================================================

    /// Feed a fragment from `instance`. A new partial message is only started
    /// by a first piece and only while fewer than `limit` are open.
    pub(crate) fn reassemble(
        &mut self,
        instance: InstanceTag,
        fragment: &Fragment,
        max_fragments: u16,
        limit: usize,
    ) -> Option<crate::utils::error::Result<Message>> {
        use tracing::debug;

        if !self.reassembly.contains_key(&instance) {
            if fragment.index != 1 {
                return None;
            }
            if self.reassembly.len() >= limit {
                debug!(target: "otr::fragment", instance = instance, "Too many partial messages, dropping");
                return None;
            }
        }

        let reassembler = self.reassembly.entry(instance).or_default();
        let completed = reassembler.push(fragment, max_fragments);
        if !reassembler.is_pending() {
            self.reassembly.remove(&instance);
        }
        completed
    }

    pub fn partial_messages(&self) -> usize {
        self.reassembly.len()
    }

    // ========================================================================
    // Очередь исходящих
    // ========================================================================

    pub fn pending_count(&self) -> usize {
        self.pending_outgoing.len()
    }

    pub(crate) fn enqueue(&mut self, text: &str, limit: usize) -> Result<()> {
        if self.pending_outgoing.len() >= limit {
            return Err(OtrError::QueueFull(self.pending_outgoing.len()));
        }
        self.pending_outgoing.push_back(text.to_string());
        Ok(())
    }

    pub(crate) fn take_pending(&mut self) -> VecDeque<String> {
        std::mem::take(&mut self.pending_outgoing)
    }

    // ========================================================================
    // Проверенные отпечатки
    // ========================================================================

    pub fn is_verified(&self, fingerprint: &str) -> bool {
        self.verified_fingerprints.contains(fingerprint)
    }

    pub fn verified_fingerprints(&self) -> &HashSet<String> {
        &self.verified_fingerprints
    }

    pub fn set_verified(&mut self, fingerprint: &str, verified: bool) {
        if verified {
            self.verified_fingerprints.insert(fingerprint.to_string());
        } else {
            self.verified_fingerprints.remove(fingerprint);
        }
    }
}

impl<P: CryptoProvider> Default for PeerRecord<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// All conversations of one local account, owned by the host and passed to
/// every engine call.
#[derive(Debug)]
pub struct ConversationStore<P: CryptoProvider = ClassicSuiteProvider> {
    peers: HashMap<String, PeerRecord<P>>,
}

impl<P: CryptoProvider> ConversationStore<P> {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
        }
    }

    pub fn peer(&self, peer: &str) -> Option<&PeerRecord<P>> {
        self.peers.get(peer)
    }

    /// Получить или создать запись о собеседнике
    pub fn peer_mut(&mut self, peer: &str) -> &mut PeerRecord<P> {
        self.peers.entry(peer.to_string()).or_default()
    }

    pub fn conversation(&self, peer: &str, instance: InstanceTag) -> Option<&Conversation<P>> {
        self.peer(peer)?.conversation(instance)
    }

    pub fn active_conversation(&self, peer: &str) -> Option<&Conversation<P>> {
        self.peer(peer)?.active_conversation()
    }

    /// State outgoing messages to `peer` are subject to.
    pub fn state(&self, peer: &str) -> ConversationState {
        self.active_conversation(peer)
            .map(Conversation::state)
            .unwrap_or(ConversationState::Plaintext)
    }

    /// Mark a fingerprint as verified (or not) for `peer`, e.g. when
    /// restoring trust the host persisted.
    pub fn set_verified(&mut self, peer: &str, fingerprint: &str, verified: bool) {
        self.peer_mut(peer).set_verified(fingerprint, verified);
    }

    pub fn is_verified(&self, peer: &str, fingerprint: &str) -> bool {
        self.peer(peer).map_or(false, |record| record.is_verified(fingerprint))
    }

    /// Forget a peer entirely. Key material is wiped as it drops.
    pub fn remove_peer(&mut self, peer: &str) -> Option<PeerRecord<P>> {
        self.peers.remove(peer)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

impl<P: CryptoProvider> Default for ConversationStore<P> {
    fn default() -> Self {
        Self::new()
    }
}
