// Состояние одной беседы (peer, instance)
//
// Plaintext → Encrypted on a completed AKE, Encrypted → Finished only on the
// peer's Disconnected TLV, Finished → Plaintext when the host ends it. A fresh
// AKE re-enters Encrypted from any state and replaces the session keys.

use crate::config::Config;
use crate::crypto::handshake::{AuthPhase, AuthStateMachine, EstablishedSession, SSID_LEN};
use crate::crypto::keys::{fingerprint, IdentityKeys};
use crate::crypto::messaging::{FrameHeader, MessageTransport, SessionKeyManager};
use crate::crypto::provider::CryptoProvider;
use crate::crypto::smp::{bind_secret, SmpOutcome, SmpPhase, SmpStateMachine};
use crate::protocol::fragment;
use crate::protocol::messages::{
    Body, DataMessage, DataPayload, EncodedMessage, InstanceTag, SmpMessage1, Tlv,
    FLAG_IGNORE_UNREADABLE,
};
use crate::protocol::version::Version;
use crate::protocol::wire;
use crate::state::events::{ConversationState, Event};
use crate::utils::error::{OtrError, Result};
use std::collections::HashSet;
use std::fmt;

/// What a conversation needs from the engine that owns it.
pub struct Context<'a, P: CryptoProvider> {
    pub identity: &'a IdentityKeys<P>,
    pub config: &'a Config,
    pub our_instance: InstanceTag,
}

/// Result of feeding one message to a conversation.
#[derive(Debug, Default)]
pub struct Step {
    pub outgoing: Vec<String>,
    pub plaintext: Option<String>,
    pub events: Vec<Event>,
    /// Set when an AKE just completed; queued plaintext may now be sent.
    pub went_secure: bool,
    /// Fingerprint whose trust an SMP run just decided.
    pub verification: Option<(String, bool)>,
}

pub struct Conversation<P: CryptoProvider> {
    their_instance: InstanceTag,
    version: Option<Version>,
    state: ConversationState,
    ake: AuthStateMachine<P>,
    keys: Option<SessionKeyManager<P>>,
    smp: SmpStateMachine,
    ssid: Option<[u8; SSID_LEN]>,
    their_fingerprint: Option<String>,
    verified: bool,
}

impl<P: CryptoProvider> Conversation<P> {
    pub fn new(their_instance: InstanceTag) -> Self {
        Self {
            their_instance,
            version: None,
            state: ConversationState::Plaintext,
            ake: AuthStateMachine::new(),
            keys: None,
            smp: SmpStateMachine::new(),
            ssid: None,
            their_fingerprint: None,
            verified: false,
        }
    }

    pub fn their_instance(&self) -> InstanceTag {
        self.their_instance
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn version(&self) -> Option<Version> {
        self.version
    }

    pub fn auth_phase(&self) -> AuthPhase {
        self.ake.phase()
    }

    pub fn handshake_in_progress(&self) -> bool {
        self.ake.in_progress()
    }

    pub fn smp_phase(&self) -> SmpPhase {
        self.smp.phase()
    }

    pub fn smp_outcome(&self) -> Option<SmpOutcome> {
        self.smp.outcome()
    }

    pub fn their_fingerprint(&self) -> Option<&str> {
        self.their_fingerprint.as_deref()
    }

    pub fn ssid(&self) -> Option<&[u8; SSID_LEN]> {
        self.ssid.as_ref()
    }

    /// Whether the peer's fingerprint has been confirmed via SMP.
    pub fn is_verified(&self) -> bool {
        self.verified
    }

    /// Our outstanding DH-Commit and its version, for a tagged instance of
    /// the peer to pick up.
    pub(crate) fn pending_commit(&self) -> Option<(AuthStateMachine<P>, Option<Version>)> {
        self.ake.pending_commit().map(|ake| (ake, self.version))
    }

    /// Continue a handshake the master conversation started before the
    /// peer's instance was known. A handshake of our own takes precedence.
    pub(crate) fn adopt_handshake(&mut self, ake: AuthStateMachine<P>, version: Option<Version>) {
        use tracing::debug;

        if self.ake.in_progress() {
            return;
        }
        debug!(
            target: "otr::conversation",
            instance = self.their_instance,
            phase = ?ake.phase(),
            "Picking up pending AKE from master conversation"
        );
        self.ake = ake;
        if self.version.is_none() {
            self.version = version;
        }
    }

    /// Forget an outstanding handshake without touching the session.
    pub(crate) fn abort_handshake(&mut self) {
        self.ake.abort();
    }

    // ========================================================================
    // AKE
    // ========================================================================

    /// Begin an AKE with `version`. Returns the DH-Commit lines.
    pub fn start_ake(&mut self, version: Version, ctx: &Context<'_, P>) -> Result<Vec<String>> {
        let body = self.ake.start()?;
        self.version = Some(version);
        self.encode(body, ctx)
    }

    /// Feed an AKE message. Handshake failures are reported as events.
    pub fn receive_ake(
        &mut self,
        message: &EncodedMessage,
        ctx: &Context<'_, P>,
        verified_fingerprints: &HashSet<String>,
    ) -> Result<Step> {
        use tracing::warn;

        let mut out = Step::default();
        let ake_step = match self.ake.handle(&message.body, ctx.identity) {
            Ok(step) => step,
            Err(err) => {
                warn!(
                    target: "otr::conversation",
                    instance = self.their_instance,
                    kind = message.body.kind(),
                    error = %err,
                    "AKE failed"
                );
                out.events.push(Event::AuthenticationFailed(err.to_string()));
                return Ok(out);
            }
        };

        self.version = Some(message.version);
        if let Some(reply) = ake_step.reply {
            out.outgoing.extend(self.encode(reply, ctx)?);
        }
        if let Some(session) = ake_step.established {
            self.establish(session, verified_fingerprints, &mut out)?;
        }
        Ok(out)
    }

    fn establish(
        &mut self,
        session: EstablishedSession<P>,
        verified_fingerprints: &HashSet<String>,
        out: &mut Step,
    ) -> Result<()> {
        use tracing::info;

        let keys = SessionKeyManager::new(
            session.our_keyid,
            session.our_dh,
            session.their_keyid,
            session.their_dh,
        )?;
        let their_fingerprint = fingerprint::<P>(&session.their_long_term_public);

        // A running SMP is bound to the old session id.
        if self.smp.abort() {
            out.events.push(Event::SmpComplete {
                instance: self.their_instance,
                outcome: SmpOutcome::Aborted,
            });
        }

        self.verified = verified_fingerprints.contains(&their_fingerprint);
        self.keys = Some(keys);
        self.ssid = Some(session.ssid);
        self.state = ConversationState::Encrypted;

        info!(
            target: "otr::conversation",
            instance = self.their_instance,
            verified = self.verified,
            "Conversation encrypted"
        );

        out.events.push(Event::GoneSecure {
            instance: self.their_instance,
            version: self.version.unwrap_or(Version::V3),
            fingerprint: their_fingerprint.clone(),
            ssid: hex::encode(session.ssid),
            verified: self.verified,
        });
        out.went_secure = true;
        self.their_fingerprint = Some(their_fingerprint);
        Ok(())
    }

    // ========================================================================
    // Data
    // ========================================================================

    /// Decrypt a data message and act on its TLVs.
    ///
    /// Drop-class errors (`UnknownKeyId`, `ReplayError`, `IntegrityError`)
    /// leave the conversation untouched.
    pub fn receive_data(
        &mut self,
        message: &EncodedMessage,
        data: &DataMessage,
        ctx: &Context<'_, P>,
    ) -> Result<Step> {
        if self.state != ConversationState::Encrypted {
            return Err(OtrError::InvalidState(
                "data message outside an encrypted conversation".to_string(),
            ));
        }
        let keys = self
            .keys
            .as_mut()
            .ok_or_else(|| OtrError::InvalidState("no session keys".to_string()))?;

        let header = FrameHeader {
            version: message.version,
            sender_instance: message.sender_instance,
            receiver_instance: message.receiver_instance,
        };
        let DataPayload { text, tlvs } = MessageTransport::<P>::decrypt(keys, data, header)?;

        let mut out = Step::default();
        if !text.is_empty() {
            out.plaintext = Some(text);
        }
        for tlv in tlvs {
            self.handle_tlv(tlv, ctx, &mut out)?;
            if self.state != ConversationState::Encrypted {
                break;
            }
        }
        Ok(out)
    }

    fn handle_tlv(&mut self, tlv: Tlv, ctx: &Context<'_, P>, out: &mut Step) -> Result<()> {
        use tracing::{info, trace};

        let instance = self.their_instance;
        match tlv {
            Tlv::Padding(bytes) => {
                trace!(target: "otr::conversation", len = bytes.len(), "Padding TLV ignored");
            }
            Tlv::Disconnected => {
                info!(target: "otr::conversation", instance = instance, "Peer ended the private conversation");
                self.drop_session();
                self.state = ConversationState::Finished;
                out.events.push(Event::PeerEnded { instance });
            }
            Tlv::Smp1(message) => self.on_smp1(&message, None, ctx, out)?,
            Tlv::Smp1Q { question, message } => self.on_smp1(&message, Some(question), ctx, out)?,
            Tlv::Smp2(message) => {
                let was_running = self.smp.in_progress();
                match self.smp.receive_smp2(&message) {
                    Ok(reply) => {
                        out.outgoing.extend(self.send_control(Tlv::Smp3(reply), 0, ctx)?);
                        out.events.push(Event::SmpProgress {
                            instance,
                            phase: self.smp.phase(),
                        });
                    }
                    Err(err) => self.smp_failure(err, was_running, ctx, out)?,
                }
            }
            Tlv::Smp3(message) => {
                let was_running = self.smp.in_progress();
                match self.smp.receive_smp3(&message) {
                    Ok(reply) => {
                        out.outgoing.extend(self.send_control(Tlv::Smp4(reply), 0, ctx)?);
                        self.record_outcome(out);
                    }
                    Err(err) => self.smp_failure(err, was_running, ctx, out)?,
                }
            }
            Tlv::Smp4(message) => {
                let was_running = self.smp.in_progress();
                match self.smp.receive_smp4(&message) {
                    Ok(_) => self.record_outcome(out),
                    Err(err) => self.smp_failure(err, was_running, ctx, out)?,
                }
            }
            Tlv::SmpAbort => {
                if self.smp.abort() {
                    out.events.push(Event::SmpComplete {
                        instance,
                        outcome: SmpOutcome::Aborted,
                    });
                }
            }
        }
        Ok(())
    }

    fn on_smp1(
        &mut self,
        message: &SmpMessage1,
        question: Option<String>,
        ctx: &Context<'_, P>,
        out: &mut Step,
    ) -> Result<()> {
        let was_running = self.smp.in_progress();
        match self.smp.receive_smp1(message, question) {
            Ok(()) => {
                out.events.push(Event::SmpRequest {
                    instance: self.their_instance,
                    question: self.smp.question().map(str::to_string),
                });
                Ok(())
            }
            Err(err) => self.smp_failure(err, was_running, ctx, out),
        }
    }

    /// The SMP machine already reset itself; tell the peer and the host.
    fn smp_failure(
        &mut self,
        err: OtrError,
        was_running: bool,
        ctx: &Context<'_, P>,
        out: &mut Step,
    ) -> Result<()> {
        let outcome = match err {
            OtrError::SmpVerificationError(_) => SmpOutcome::Failed,
            OtrError::InvalidState(_) => SmpOutcome::Aborted,
            other => return Err(other),
        };
        out.outgoing.extend(self.send_control(Tlv::SmpAbort, 0, ctx)?);
        if outcome == SmpOutcome::Failed {
            self.revoke_verification(out);
        }
        if was_running || outcome == SmpOutcome::Failed {
            out.events.push(Event::SmpComplete {
                instance: self.their_instance,
                outcome,
            });
        }
        Ok(())
    }

    fn record_outcome(&mut self, out: &mut Step) {
        let outcome = match self.smp.outcome() {
            Some(outcome) => outcome,
            None => return,
        };
        match outcome {
            SmpOutcome::Success => {
                self.verified = true;
                if let Some(fp) = &self.their_fingerprint {
                    out.verification = Some((fp.clone(), true));
                }
            }
            SmpOutcome::Failed => self.revoke_verification(out),
            SmpOutcome::Aborted => {}
        }
        out.events.push(Event::SmpComplete {
            instance: self.their_instance,
            outcome,
        });
    }

    fn revoke_verification(&mut self, out: &mut Step) {
        self.verified = false;
        if let Some(fp) = &self.their_fingerprint {
            out.verification = Some((fp.clone(), false));
        }
    }

    // ========================================================================
    // Outgoing
    // ========================================================================

    /// Encrypt user text. Only valid while Encrypted.
    pub fn send_text(&mut self, text: &str, ctx: &Context<'_, P>) -> Result<Vec<String>> {
        match self.state {
            ConversationState::Encrypted => self.send_payload(&DataPayload::text(text), 0, ctx),
            ConversationState::Finished => Err(OtrError::ConversationFinished),
            ConversationState::Plaintext => Err(OtrError::InvalidState(
                "conversation is not encrypted".to_string(),
            )),
        }
    }

    fn send_control(&mut self, tlv: Tlv, flags: u8, ctx: &Context<'_, P>) -> Result<Vec<String>> {
        self.send_payload(&DataPayload::control(tlv), flags, ctx)
    }

    fn send_payload(&mut self, payload: &DataPayload, flags: u8, ctx: &Context<'_, P>) -> Result<Vec<String>> {
        let (version, sender_instance, receiver_instance) = self.addressing(ctx)?;
        let keys = self
            .keys
            .as_mut()
            .ok_or_else(|| OtrError::InvalidState("no session keys".to_string()))?;
        let header = FrameHeader {
            version,
            sender_instance,
            receiver_instance,
        };
        let message =
            MessageTransport::<P>::encrypt(keys, payload, flags, header, ctx.config.reveal_mac_keys)?;
        self.encode(Body::Data(message), ctx)
    }

    /// Start SMP with `secret`, optionally asking `question`.
    pub fn start_smp(
        &mut self,
        secret: &[u8],
        question: Option<String>,
        ctx: &Context<'_, P>,
    ) -> Result<Vec<String>> {
        let (ssid, theirs) = self.secure_identity()?;
        let x = bind_secret(&ctx.identity.fingerprint(), &theirs, &ssid, secret);
        let message = self.smp.start(x)?;
        let tlv = match question {
            Some(question) => Tlv::Smp1Q { question, message },
            None => Tlv::Smp1(message),
        };
        self.send_control(tlv, 0, ctx)
    }

    /// Answer the peer's SMP request with our `secret`.
    pub fn respond_smp(&mut self, secret: &[u8], ctx: &Context<'_, P>) -> Result<Vec<String>> {
        let (ssid, theirs) = self.secure_identity()?;
        let y = bind_secret(&theirs, &ctx.identity.fingerprint(), &ssid, secret);
        let message = self.smp.respond(y)?;
        self.send_control(Tlv::Smp2(message), 0, ctx)
    }

    /// Abort a running SMP and notify the peer.
    pub fn abort_smp(&mut self, ctx: &Context<'_, P>) -> Result<Vec<String>> {
        if self.smp.abort() && self.state == ConversationState::Encrypted {
            return self.send_control(Tlv::SmpAbort, 0, ctx);
        }
        Ok(Vec::new())
    }

    /// Return to Plaintext, telling the peer if we were Encrypted.
    pub fn end(&mut self, ctx: &Context<'_, P>) -> Result<Vec<String>> {
        use tracing::info;

        let outgoing = match self.state {
            ConversationState::Encrypted => {
                self.send_control(Tlv::Disconnected, FLAG_IGNORE_UNREADABLE, ctx)?
            }
            ConversationState::Finished | ConversationState::Plaintext => Vec::new(),
        };
        self.ake.abort();
        self.drop_session();
        self.state = ConversationState::Plaintext;
        info!(target: "otr::conversation", instance = self.their_instance, "Conversation ended locally");
        Ok(outgoing)
    }

    /// Drop handshake and SMP state after an error from the peer.
    pub(crate) fn abort_exchanges(&mut self) -> Option<Event> {
        self.ake.abort();
        self.smp.abort().then_some(Event::SmpComplete {
            instance: self.their_instance,
            outcome: SmpOutcome::Aborted,
        })
    }

    fn drop_session(&mut self) {
        // SessionKeyManager and SMP secrets zeroize on drop.
        self.keys = None;
        self.smp.abort();
        self.ssid = None;
        self.verified = false;
    }

    fn secure_identity(&self) -> Result<([u8; SSID_LEN], String)> {
        match (self.state, self.ssid, &self.their_fingerprint) {
            (ConversationState::Encrypted, Some(ssid), Some(theirs)) => Ok((ssid, theirs.clone())),
            _ => Err(OtrError::InvalidState(
                "SMP needs an encrypted conversation".to_string(),
            )),
        }
    }

    fn addressing(&self, ctx: &Context<'_, P>) -> Result<(Version, InstanceTag, InstanceTag)> {
        let version = self
            .version
            .ok_or_else(|| OtrError::InvalidState("no protocol version negotiated".to_string()))?;
        if version.has_instance_tags() {
            Ok((version, ctx.our_instance, self.their_instance))
        } else {
            Ok((version, 0, 0))
        }
    }

    /// Serialize and, if needed, fragment one encoded message.
    fn encode(&self, body: Body, ctx: &Context<'_, P>) -> Result<Vec<String>> {
        let (version, sender_instance, receiver_instance) = self.addressing(ctx)?;
        let text = wire::serialize_encoded(&EncodedMessage {
            version,
            sender_instance,
            receiver_instance,
            body,
        })?;
        fragment::fragment(
            &text,
            ctx.config.max_fragment_size,
            ctx.config.max_fragments,
            version,
            sender_instance,
            receiver_instance,
        )
    }
}

impl<P: CryptoProvider> fmt::Debug for Conversation<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conversation")
            .field("their_instance", &self.their_instance)
            .field("version", &self.version)
            .field("state", &self.state)
            .field("auth_phase", &self.ake.phase())
            .field("smp_phase", &self.smp.phase())
            .field("verified", &self.verified)
            .finish()
    }
}
