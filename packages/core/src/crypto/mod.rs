//! Криптографический модуль
//!
//! # Архитектура
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Host (IM client)                         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Engine (api::engine)                     │
//! │  - Долгосрочный ключ подписи и instance tag                 │
//! │  - Маршрутизация по (peer, instance)                        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Conversation (state::conversation)             │
//! │  - Plaintext / Encrypted / Finished                         │
//! │  - Очередь исходящих до завершения AKE                      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!         ┌────────────────────┼────────────────────┐
//!         ▼                    ▼                    ▼
//! ┌────────────────┐  ┌──────────────────┐  ┌────────────────┐
//! │  AKE           │  │  Transport       │  │  SMP           │
//! │  - DH-Commit   │  │  - Key rotation  │  │  - Ristretto   │
//! │  - Signatures  │  │  - Replay check  │  │  - ZK proofs   │
//! └────────────────┘  └──────────────────┘  └────────────────┘
//!         │                    │
//!         └─────────┬──────────┘
//!                   ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              CryptoProvider (Crypto-Agility)                │
//! │  - DH (X25519)                                              │
//! │  - Signatures (Ed25519)                                     │
//! │  - Stream cipher (ChaCha20) + MAC (HMAC-SHA256)             │
//! │  - KDF (HKDF-SHA256)                                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Модули
//!
//! ### Core Traits
//! - [`provider`]: CryptoProvider trait для crypto-agility
//!
//! ### Protocols
//! - [`handshake`]: AKE (4 сообщения)
//! - [`messaging`]: ротация ключей и шифрование data-сообщений
//! - [`smp`]: Socialist Millionaires' Protocol
//!
//! ### Implementations
//! - [`suites`]: Реализации CryptoProvider
//!
//! ### Utilities
//! - [`keys`]: DH-пары, долгосрочные ключи, отпечатки
//! - [`group`]: группа простого порядка для SMP

// ============================================================================
// Core Traits
// ============================================================================

/// CryptoProvider trait для crypto-agility
pub mod provider;

// ============================================================================
// Protocols
// ============================================================================

/// Authenticated key exchange
pub mod handshake;

/// Data messages and session keys
pub mod messaging;

pub mod smp;

// ============================================================================
// Implementations
// ============================================================================

/// Криптографические наборы
pub mod suites;

// ============================================================================
// Utilities
// ============================================================================

pub mod group;

pub mod keys;

// ============================================================================
// Re-exports для удобства
// ============================================================================

pub use provider::CryptoProvider;

pub type SuiteID = u16;

/// Suite ID for the classic suite
pub const CLASSIC_SUITE_ID: SuiteID = 1;
