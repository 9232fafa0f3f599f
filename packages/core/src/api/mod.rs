// Публичный API движка
// Высокоуровневые операции над беседами, хранилище передаётся хостом

pub mod engine;

pub use engine::{Delivery, Engine, UNREADABLE_MESSAGE_ERROR};
