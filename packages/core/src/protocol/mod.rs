// Протокольный слой: классификация текста, конверты, фрагменты

pub mod fragment;
pub mod messages;
pub mod validation;
pub mod version;
pub mod wire;
