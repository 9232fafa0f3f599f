//! Криптографические наборы (Crypto Suites)
//!
//! Этот модуль содержит реализации CryptoProvider trait.
//!
//! ## Доступные наборы
//!
//! ### Classic Suite
//! - **DH**: X25519 (с проверкой входящих значений)
//! - **Signatures**: Ed25519
//! - **Stream cipher**: ChaCha20, nonce = счетчик сообщения
//! - **MAC**: HMAC-SHA256
//! - **KDF**: HKDF-SHA256
//! - **Suite ID**: 1
//!
//! ## Выбор suite
//!
//! ```rust
//! use construct_otr::crypto::suites::classic::ClassicSuiteProvider;
//! use construct_otr::crypto::provider::CryptoProvider;
//!
//! type MySuite = ClassicSuiteProvider;
//!
//! let (private_key, public_key) = MySuite::generate_dh_keys().unwrap();
//! assert!(MySuite::validate_dh_public(&public_key).is_ok());
//! # let _ = private_key;
//! ```

pub mod classic;
