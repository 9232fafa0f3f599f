// Construct OTR Core
// Off-the-Record style secure messaging engine over any text transport

#![warn(clippy::all)]
#![allow(clippy::too_many_arguments)]

// Модули
pub mod api;
pub mod config;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod state;
pub mod utils;

// Re-exports для удобства
pub use api::{Delivery, Engine};
pub use config::Config;
pub use crypto::keys::IdentityKeys;
pub use crypto::smp::{SmpOutcome, SmpPhase};
pub use crypto::suites::classic::ClassicSuiteProvider;
pub use state::{ConversationState, ConversationStore, Event};
pub use utils::error::{OtrError, Result};
