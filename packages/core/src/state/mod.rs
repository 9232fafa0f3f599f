// Состояние бесед: контроллер на (peer, instance) и хранилище хоста

pub mod conversation;
pub mod events;
pub mod store;

pub use conversation::Conversation;
pub use events::{ConversationState, Event};
pub use store::{ConversationStore, PeerRecord, MASTER_INSTANCE};
