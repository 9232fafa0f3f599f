//! AKE state machine
//!
//! `None → AwaitingDhKey → AwaitingSig → Done` on the initiating side,
//! `None → AwaitingRevealSig → Done` on the responding side. Messages that do
//! not fit the current state are ignored; a failed check in an expected
//! message resets the machine and surfaces `AuthenticationError`.

use crate::crypto::handshake::{AkeStep, AuthPhase, EstablishedSession, AKE_KEY_ID, SSID_LEN};
use crate::crypto::keys::{DhKeyPair, IdentityKeys};
use crate::crypto::provider::{CryptoProvider, DhPublicKey, KEY_LEN};
use crate::protocol::messages::{Body, DhCommit, DhKey, RevealSignature, SignatureMessage};
use crate::utils::error::{OtrError, Result};
use crate::utils::serialization;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

const AKE_KDF_INFO: &[u8] = b"OTR AKE key expansion";

/// Keys expanded from the AKE shared secret.
#[derive(Zeroize, ZeroizeOnDrop)]
struct AkeKeys {
    ssid: [u8; SSID_LEN],
    c: [u8; KEY_LEN],
    c_prime: [u8; KEY_LEN],
    m1: [u8; KEY_LEN],
    m2: [u8; KEY_LEN],
    m1_prime: [u8; KEY_LEN],
    m2_prime: [u8; KEY_LEN],
}

impl AkeKeys {
    fn derive<P: CryptoProvider>(shared_secret: &[u8]) -> Result<Self> {
        let okm = P::hkdf_derive_key(&[], shared_secret, AKE_KDF_INFO, SSID_LEN + 6 * KEY_LEN)?;
        let mut keys = AkeKeys {
            ssid: [0u8; SSID_LEN],
            c: [0u8; KEY_LEN],
            c_prime: [0u8; KEY_LEN],
            m1: [0u8; KEY_LEN],
            m2: [0u8; KEY_LEN],
            m1_prime: [0u8; KEY_LEN],
            m2_prime: [0u8; KEY_LEN],
        };
        keys.ssid.copy_from_slice(&okm[..SSID_LEN]);
        let mut chunks = okm[SSID_LEN..].chunks_exact(KEY_LEN);
        for slot in [
            &mut keys.c,
            &mut keys.c_prime,
            &mut keys.m1,
            &mut keys.m2,
            &mut keys.m1_prime,
            &mut keys.m2_prime,
        ] {
            let chunk = chunks
                .next()
                .ok_or_else(|| OtrError::InvalidState("short AKE key expansion".to_string()))?;
            slot.copy_from_slice(chunk);
        }
        Ok(keys)
    }
}

/// Values the long-term signature covers (after MACing).
#[derive(Serialize)]
struct SignedTranscript<'a> {
    sender_dh: &'a DhPublicKey,
    receiver_dh: &'a DhPublicKey,
    long_term_public: &'a [u8],
    keyid: u32,
}

/// The encrypted part of Reveal-Signature and Signature messages.
#[derive(Serialize, Deserialize)]
struct SignedIdentity {
    long_term_public: Vec<u8>,
    keyid: u32,
    signature: Vec<u8>,
}

enum AuthState<P: CryptoProvider> {
    None,
    AwaitingDhKey {
        commit_key: Zeroizing<Vec<u8>>,
        our_dh: DhKeyPair<P>,
        commit: DhCommit,
    },
    AwaitingRevealSig {
        our_dh: DhKeyPair<P>,
        their_commit: DhCommit,
    },
    AwaitingSig {
        our_dh: DhKeyPair<P>,
        their_dh: DhPublicKey,
        keys: AkeKeys,
        reveal: RevealSignature,
    },
    Done,
}

/// Per-conversation AKE driver.
pub struct AuthStateMachine<P: CryptoProvider> {
    state: AuthState<P>,
}

impl<P: CryptoProvider> Default for AuthStateMachine<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: CryptoProvider> AuthStateMachine<P> {
    pub fn new() -> Self {
        Self {
            state: AuthState::None,
        }
    }

    pub fn phase(&self) -> AuthPhase {
        match self.state {
            AuthState::None => AuthPhase::None,
            AuthState::AwaitingDhKey { .. } => AuthPhase::AwaitingDhKey,
            AuthState::AwaitingRevealSig { .. } => AuthPhase::AwaitingRevealSig,
            AuthState::AwaitingSig { .. } => AuthPhase::AwaitingSig,
            AuthState::Done => AuthPhase::Done,
        }
    }

    /// A handshake is under way.
    pub fn in_progress(&self) -> bool {
        !matches!(self.state, AuthState::None | AuthState::Done)
    }

    /// Drop any handshake state.
    pub fn abort(&mut self) {
        use tracing::debug;

        if self.in_progress() {
            debug!(target: "otr::ake", phase = ?self.phase(), "AKE aborted");
        }
        self.state = AuthState::None;
    }

    /// Copy of our outstanding DH-Commit, if we are waiting for a DH-Key.
    ///
    /// Any of the peer's instances may answer a commit sent before their
    /// instance was known; each answering instance gets its own copy.
    pub fn pending_commit(&self) -> Option<Self> {
        match &self.state {
            AuthState::AwaitingDhKey {
                commit_key,
                our_dh,
                commit,
            } => Some(Self {
                state: AuthState::AwaitingDhKey {
                    commit_key: commit_key.clone(),
                    our_dh: our_dh.clone(),
                    commit: commit.clone(),
                },
            }),
            _ => None,
        }
    }

    /// Begin a handshake as initiator. Returns the DH-Commit to send.
    pub fn start(&mut self) -> Result<Body> {
        use tracing::debug;

        let our_dh = DhKeyPair::<P>::generate()?;
        let commit_key = Zeroizing::new(P::random_bytes(KEY_LEN)?);
        let commit = DhCommit {
            encrypted_gx: P::stream_xor(&commit_key, 0, our_dh.public_key())?,
            hashed_gx: P::hash(our_dh.public_key()),
        };

        debug!(target: "otr::ake", "Starting AKE as initiator");

        self.state = AuthState::AwaitingDhKey {
            commit_key,
            our_dh,
            commit: commit.clone(),
        };
        Ok(Body::DhCommit(commit))
    }

    /// Feed one AKE message.
    ///
    /// Data messages and messages that do not fit the current state yield an
    /// empty step. On `Err` the machine is back in `None`.
    pub fn handle(&mut self, body: &Body, identity: &IdentityKeys<P>) -> Result<AkeStep<P>> {
        let result = match body {
            Body::DhCommit(commit) => self.on_dh_commit(commit),
            Body::DhKey(key) => self.on_dh_key(key, identity),
            Body::RevealSignature(reveal) => self.on_reveal_signature(reveal, identity),
            Body::Signature(signature) => self.on_signature(signature),
            Body::Data(_) => Ok(AkeStep::nothing()),
        };
        if result.is_err() {
            self.state = AuthState::None;
        }
        result
    }

    fn become_responder(&mut self, their_commit: &DhCommit) -> Result<AkeStep<P>> {
        let our_dh = DhKeyPair::<P>::generate()?;
        let reply = Body::DhKey(DhKey {
            gy: *our_dh.public_key(),
        });
        self.state = AuthState::AwaitingRevealSig {
            our_dh,
            their_commit: their_commit.clone(),
        };
        Ok(AkeStep::reply(reply))
    }

    fn on_dh_commit(&mut self, their_commit: &DhCommit) -> Result<AkeStep<P>> {
        use tracing::debug;

        match &mut self.state {
            // Both sides committed. The larger hash keeps its commitment.
            AuthState::AwaitingDhKey { commit, .. } if commit.hashed_gx > their_commit.hashed_gx => {
                debug!(target: "otr::ake", "Commit collision, keeping ours");
                Ok(AkeStep::reply(Body::DhCommit(commit.clone())))
            }
            AuthState::AwaitingRevealSig {
                our_dh,
                their_commit: stored,
            } => {
                debug!(target: "otr::ake", "DH-Commit retransmitted, re-sending DH-Key");
                *stored = their_commit.clone();
                Ok(AkeStep::reply(Body::DhKey(DhKey {
                    gy: *our_dh.public_key(),
                })))
            }
            _ => {
                debug!(target: "otr::ake", phase = ?self.phase(), "DH-Commit received, answering as responder");
                self.become_responder(their_commit)
            }
        }
    }

    fn on_dh_key(&mut self, key: &DhKey, identity: &IdentityKeys<P>) -> Result<AkeStep<P>> {
        use tracing::{debug, trace};

        match std::mem::replace(&mut self.state, AuthState::None) {
            AuthState::AwaitingDhKey {
                commit_key, our_dh, ..
            } => {
                P::validate_dh_public(&key.gy).map_err(auth_error)?;
                let shared = our_dh.agree(&key.gy).map_err(auth_error_from_otr)?;
                let keys = AkeKeys::derive::<P>(&shared)?;

                let encrypted_signature = seal_identity::<P>(
                    identity,
                    our_dh.public_key(),
                    &key.gy,
                    &keys.m1,
                    &keys.c,
                )?;
                let mac = P::mac(&keys.m2, &encrypted_signature)?;
                let mut revealed_key = [0u8; KEY_LEN];
                revealed_key.copy_from_slice(&commit_key);

                let reveal = RevealSignature {
                    revealed_key,
                    encrypted_signature,
                    mac,
                };
                debug!(target: "otr::ake", "DH-Key accepted, sending Reveal-Signature");

                self.state = AuthState::AwaitingSig {
                    our_dh,
                    their_dh: key.gy,
                    keys,
                    reveal: reveal.clone(),
                };
                Ok(AkeStep::reply(Body::RevealSignature(reveal)))
            }
            AuthState::AwaitingSig {
                our_dh,
                their_dh,
                keys,
                reveal,
            } => {
                let step = if their_dh == key.gy {
                    debug!(target: "otr::ake", "DH-Key retransmitted, re-sending Reveal-Signature");
                    AkeStep::reply(Body::RevealSignature(reveal.clone()))
                } else {
                    trace!(target: "otr::ake", "Ignoring DH-Key with a different g^y");
                    AkeStep::nothing()
                };
                self.state = AuthState::AwaitingSig {
                    our_dh,
                    their_dh,
                    keys,
                    reveal,
                };
                Ok(step)
            }
            other => {
                trace!(target: "otr::ake", "Ignoring unexpected DH-Key");
                self.state = other;
                Ok(AkeStep::nothing())
            }
        }
    }

    fn on_reveal_signature(
        &mut self,
        reveal: &RevealSignature,
        identity: &IdentityKeys<P>,
    ) -> Result<AkeStep<P>> {
        use tracing::{debug, trace};

        let (our_dh, their_commit) = match std::mem::replace(&mut self.state, AuthState::None) {
            AuthState::AwaitingRevealSig {
                our_dh,
                their_commit,
            } => (our_dh, their_commit),
            other => {
                trace!(target: "otr::ake", "Ignoring unexpected Reveal-Signature");
                self.state = other;
                return Ok(AkeStep::nothing());
            }
        };

        // Open the commitment.
        let gx_bytes = P::stream_xor(&reveal.revealed_key, 0, &their_commit.encrypted_gx)?;
        let their_dh: DhPublicKey = gx_bytes
            .as_slice()
            .try_into()
            .map_err(|_| OtrError::AuthenticationError("committed g^x has wrong length".to_string()))?;
        if P::hash(&their_dh) != their_commit.hashed_gx {
            return Err(OtrError::AuthenticationError(
                "revealed g^x does not match commitment".to_string(),
            ));
        }

        let shared = our_dh.agree(&their_dh).map_err(auth_error_from_otr)?;
        let keys = AkeKeys::derive::<P>(&shared)?;

        P::mac_verify(&keys.m2, &reveal.encrypted_signature, &reveal.mac)
            .map_err(|_| OtrError::AuthenticationError("Reveal-Signature MAC mismatch".to_string()))?;
        let their_identity = open_identity::<P>(
            &reveal.encrypted_signature,
            &their_dh,
            our_dh.public_key(),
            &keys.m1,
            &keys.c,
        )?;

        let encrypted_signature = seal_identity::<P>(
            identity,
            our_dh.public_key(),
            &their_dh,
            &keys.m1_prime,
            &keys.c_prime,
        )?;
        let mac = P::mac(&keys.m2_prime, &encrypted_signature)?;

        debug!(target: "otr::ake", their_keyid = their_identity.keyid, "Reveal-Signature verified, AKE complete");

        self.state = AuthState::Done;
        Ok(AkeStep {
            reply: Some(Body::Signature(SignatureMessage {
                encrypted_signature,
                mac,
            })),
            established: Some(EstablishedSession {
                ssid: keys.ssid,
                our_dh,
                our_keyid: AKE_KEY_ID,
                their_dh,
                their_keyid: their_identity.keyid,
                their_long_term_public: their_identity.long_term_public.clone(),
            }),
        })
    }

    fn on_signature(&mut self, signature: &SignatureMessage) -> Result<AkeStep<P>> {
        use tracing::{debug, trace};

        let (our_dh, their_dh, keys) = match std::mem::replace(&mut self.state, AuthState::None) {
            AuthState::AwaitingSig {
                our_dh,
                their_dh,
                keys,
                ..
            } => (our_dh, their_dh, keys),
            other => {
                trace!(target: "otr::ake", "Ignoring unexpected Signature");
                self.state = other;
                return Ok(AkeStep::nothing());
            }
        };

        P::mac_verify(&keys.m2_prime, &signature.encrypted_signature, &signature.mac)
            .map_err(|_| OtrError::AuthenticationError("Signature MAC mismatch".to_string()))?;
        let their_identity = open_identity::<P>(
            &signature.encrypted_signature,
            &their_dh,
            our_dh.public_key(),
            &keys.m1_prime,
            &keys.c_prime,
        )?;

        debug!(target: "otr::ake", their_keyid = their_identity.keyid, "Signature verified, AKE complete");

        self.state = AuthState::Done;
        Ok(AkeStep {
            reply: None,
            established: Some(EstablishedSession {
                ssid: keys.ssid,
                our_dh,
                our_keyid: AKE_KEY_ID,
                their_dh,
                their_keyid: their_identity.keyid,
                their_long_term_public: their_identity.long_term_public.clone(),
            }),
        })
    }
}

/// Sign our transcript and encrypt it: `Enc_enc_key(pub, keyid, sig(MAC_mac_key(...)))`.
fn seal_identity<P: CryptoProvider>(
    identity: &IdentityKeys<P>,
    our_dh: &DhPublicKey,
    their_dh: &DhPublicKey,
    mac_key: &[u8],
    enc_key: &[u8],
) -> Result<Vec<u8>> {
    let transcript = serialization::to_bytes(&SignedTranscript {
        sender_dh: our_dh,
        receiver_dh: their_dh,
        long_term_public: identity.public_key(),
        keyid: AKE_KEY_ID,
    })?;
    let authenticator = P::mac(mac_key, &transcript)?;
    let signed = SignedIdentity {
        long_term_public: identity.public_key().to_vec(),
        keyid: AKE_KEY_ID,
        signature: identity.sign(&authenticator)?,
    };
    let plaintext = Zeroizing::new(serialization::to_bytes(&signed)?);
    Ok(P::stream_xor(enc_key, 0, &plaintext)?)
}

/// Inverse of [`seal_identity`] for the peer's transcript.
fn open_identity<P: CryptoProvider>(
    encrypted: &[u8],
    their_dh: &DhPublicKey,
    our_dh: &DhPublicKey,
    mac_key: &[u8],
    enc_key: &[u8],
) -> Result<SignedIdentity> {
    let plaintext = Zeroizing::new(P::stream_xor(enc_key, 0, encrypted)?);
    let signed: SignedIdentity = serialization::from_bytes(&plaintext)
        .map_err(|_| OtrError::AuthenticationError("malformed signed identity".to_string()))?;
    if signed.keyid == 0 {
        return Err(OtrError::AuthenticationError("zero key id".to_string()));
    }

    let transcript = serialization::to_bytes(&SignedTranscript {
        sender_dh: their_dh,
        receiver_dh: our_dh,
        long_term_public: &signed.long_term_public,
        keyid: signed.keyid,
    })?;
    let authenticator = P::mac(mac_key, &transcript)?;
    P::verify(&signed.long_term_public, &authenticator, &signed.signature)
        .map_err(|e| OtrError::AuthenticationError(e.to_string()))?;
    Ok(signed)
}

fn auth_error(err: crate::error::CryptoError) -> OtrError {
    OtrError::AuthenticationError(err.to_string())
}

fn auth_error_from_otr(err: OtrError) -> OtrError {
    OtrError::AuthenticationError(err.to_string())
}
