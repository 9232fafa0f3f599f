// Управление ключами
// Долговременная identity (подписи) и эфемерные DH-пары

use crate::crypto::provider::{CryptoProvider, DhPublicKey};
use crate::utils::error::Result;
use std::fmt;
use std::marker::PhantomData;

/// Fingerprint of a long-term public key: lowercase hex of its hash.
pub fn fingerprint<P: CryptoProvider>(public_key: &[u8]) -> String {
    hex::encode(P::hash(public_key))
}

/// Пара ключей DH
///
/// The private half is wiped when the pair is dropped.
pub struct DhKeyPair<P: CryptoProvider> {
    private_key: P::DhPrivateKey,
    public_key: DhPublicKey,
}

impl<P: CryptoProvider> DhKeyPair<P> {
    pub fn generate() -> Result<Self> {
        let (private_key, public_key) = P::generate_dh_keys()?;
        Ok(Self {
            private_key,
            public_key,
        })
    }

    pub fn public_key(&self) -> &DhPublicKey {
        &self.public_key
    }

    /// Shared secret with `their_public` (validated by the provider).
    pub fn agree(&self, their_public: &DhPublicKey) -> Result<crate::crypto::provider::SecretBytes> {
        Ok(P::dh(&self.private_key, their_public)?)
    }
}

impl<P: CryptoProvider> Clone for DhKeyPair<P> {
    fn clone(&self) -> Self {
        Self {
            private_key: self.private_key.clone(),
            public_key: self.public_key,
        }
    }
}

impl<P: CryptoProvider> fmt::Debug for DhKeyPair<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DhKeyPair")
            .field("public_key", &hex::encode(self.public_key))
            .finish_non_exhaustive()
    }
}

/// Долговременные ключи подписи
pub struct IdentityKeys<P: CryptoProvider> {
    signing_key: P::SignaturePrivateKey,
    public_key: Vec<u8>,
    _phantom: PhantomData<P>,
}

impl<P: CryptoProvider> IdentityKeys<P> {
    /// Сгенерировать новую identity
    pub fn generate() -> Result<Self> {
        let (signing_key, public_key) = P::generate_signature_keys()?;
        Ok(Self {
            signing_key,
            public_key,
            _phantom: PhantomData,
        })
    }

    /// Восстановить identity из сохраненного приватного ключа
    pub fn from_private_bytes(bytes: Vec<u8>) -> Result<Self> {
        let signing_key = P::signature_private_key_from_bytes(bytes);
        let public_key = P::from_signature_private_to_public(&signing_key)?;
        Ok(Self {
            signing_key,
            public_key,
            _phantom: PhantomData,
        })
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn fingerprint(&self) -> String {
        fingerprint::<P>(&self.public_key)
    }

    /// Приватный ключ для экспорта в хранилище хоста
    pub fn signing_secret_key(&self) -> &P::SignaturePrivateKey {
        &self.signing_key
    }

    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(P::sign(&self.signing_key, data)?)
    }
}

impl<P: CryptoProvider> Clone for IdentityKeys<P> {
    fn clone(&self) -> Self {
        Self {
            signing_key: self.signing_key.clone(),
            public_key: self.public_key.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<P: CryptoProvider> fmt::Debug for IdentityKeys<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeys")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}
