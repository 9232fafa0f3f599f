//! Authenticated Key Exchange
//!
//! Четыре сообщения, после которых обе стороны имеют общий DH-секрет и знают
//! долговременный ключ собеседника.
//!
//! ## Dataflow
//! ```text
//! Bob (инициатор)                                   Alice (получатель)
//! ===============                                   ==================
//!
//! x, r случайные
//! DH-Commit: Enc_r(g^x), SHA256(g^x)          →
//!                                                   y случайный
//!                                             ←     DH-Key: g^y
//! s = (g^y)^x → ssid, c, c', m1, m2, m1', m2'
//! M_B = MAC_m1(g^x, g^y, pub_B, keyid_B)
//! X_B = pub_B, keyid_B, sig_B(M_B)
//! Reveal-Signature: r, Enc_c(X_B), MAC_m2(...) →
//!                                                   g^x = Dec_r(...), проверка хеша
//!                                                   s = (g^x)^y, проверка MAC и подписи
//!                                                   M_A = MAC_m1'(g^y, g^x, pub_A, keyid_A)
//!                                             ←     Signature: Enc_c'(X_A), MAC_m2'(...)
//! проверка MAC и подписи
//! ```
//!
//! Both sides end with the same `ssid` and a DH key pair / peer public value
//! that seed the data-message key slots.

use crate::crypto::keys::DhKeyPair;
use crate::crypto::provider::{CryptoProvider, DhPublicKey};
use crate::protocol::messages::Body;

pub mod ake;

pub use ake::AuthStateMachine;

/// Length of the session identifier shown to users for out-of-band comparison.
pub const SSID_LEN: usize = 8;

/// Key id both sides give their AKE DH key.
pub const AKE_KEY_ID: u32 = 1;

/// Externally visible AKE state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    None,
    AwaitingDhKey,
    AwaitingRevealSig,
    AwaitingSig,
    Done,
}

/// Result of a completed handshake.
pub struct EstablishedSession<P: CryptoProvider> {
    pub ssid: [u8; SSID_LEN],
    pub our_dh: DhKeyPair<P>,
    pub our_keyid: u32,
    pub their_dh: DhPublicKey,
    pub their_keyid: u32,
    /// Peer's long-term signature public key.
    pub their_long_term_public: Vec<u8>,
}

/// What the caller must do after feeding a message to the AKE.
pub struct AkeStep<P: CryptoProvider> {
    pub reply: Option<Body>,
    pub established: Option<EstablishedSession<P>>,
}

impl<P: CryptoProvider> AkeStep<P> {
    pub(crate) fn nothing() -> Self {
        Self {
            reply: None,
            established: None,
        }
    }

    pub(crate) fn reply(body: Body) -> Self {
        Self {
            reply: Some(body),
            established: None,
        }
    }
}
