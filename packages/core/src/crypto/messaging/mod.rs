//! Secure Messaging
//!
//! Шифрование data-сообщений после завершения AKE.
//!
//! ## Dataflow
//! ```text
//! AKE → (our_dh, our_keyid, their_dh, their_keyid)
//!          │
//!          ▼
//! SessionKeyManager::new()          ours: [fresh (id+1), AKE key (id)]
//!                                   theirs: [AKE value (id), none]
//!          │
//!          ▼
//! MessageTransport::encrypt()       sender_keyid = ours[PREVIOUS]
//!                                   recipient_keyid = theirs[CURRENT]
//!                                   next_dh = ours[CURRENT]
//!
//! MessageTransport::decrypt()       recipient_keyid == ours[CURRENT] → rotate ours
//!                                   sender_keyid == theirs[CURRENT]  → rotate theirs
//! ```
//!
//! ## Security Properties
//!
//! ### Forward Secrecy
//! Retired DH keys and session keys are wiped; a key pair lives only until the
//! peer acknowledges its successor.
//!
//! ### Deniability
//! Receiving MAC keys of retired sessions are published in later messages, so
//! anyone could have forged the old MACs.

pub mod session_keys;
pub mod transport;

pub use session_keys::{SessionKeyManager, SessionKeys, CURRENT, PREVIOUS};
pub use transport::{FrameHeader, MessageTransport};
