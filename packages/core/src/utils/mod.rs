// Вспомогательные модули

pub mod b64;
pub mod error;
pub mod serialization;
