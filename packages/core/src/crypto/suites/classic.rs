use crate::crypto::provider::{CryptoProvider, DhPublicKey, SecretBytes, KEY_LEN};
use crate::error::CryptoError;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::{ChaCha20, Key, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand_core::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as DhPublicKeyDalek, StaticSecret};
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// 2^255 - 19, little-endian.
const FIELD_MODULUS: [u8; 32] = [
    0xed, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0x7f,
];

const LOW_ORDER_CHECK_SCALAR: u8 = 0x5a;

/// Concrete implementation of `CryptoProvider` for the classic suite:
/// X25519, Ed25519, ChaCha20, HMAC-SHA256, HKDF-SHA256.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassicSuiteProvider;

fn to_key_array(bytes: &[u8], what: &str) -> Result<[u8; KEY_LEN], CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidInputError(format!("Invalid {} length", what)))
}

/// Little-endian comparison `u < p`.
fn below_field_modulus(u: &[u8; 32]) -> bool {
    for (a, p) in u.iter().rev().zip(FIELD_MODULUS.iter().rev()) {
        if a != p {
            return a < p;
        }
    }
    false
}

impl CryptoProvider for ClassicSuiteProvider {
    type DhPrivateKey = Zeroizing<Vec<u8>>;
    type SignaturePrivateKey = Zeroizing<Vec<u8>>;

    fn generate_dh_keys() -> Result<(Self::DhPrivateKey, DhPublicKey), CryptoError> {
        let private_key = StaticSecret::random_from_rng(OsRng);
        let public_key = DhPublicKeyDalek::from(&private_key);
        Ok((Zeroizing::new(private_key.to_bytes().to_vec()), public_key.to_bytes()))
    }

    fn dh_public_from_private(private_key: &Self::DhPrivateKey) -> Result<DhPublicKey, CryptoError> {
        let bytes = Zeroizing::new(to_key_array(private_key.as_ref(), "DH private key")?);
        let static_secret = StaticSecret::from(*bytes);
        Ok(DhPublicKeyDalek::from(&static_secret).to_bytes())
    }

    fn validate_dh_public(public_key: &DhPublicKey) -> Result<(), CryptoError> {
        if public_key[31] & 0x80 != 0 {
            return Err(CryptoError::InvalidPublicValue("high bit set".to_string()));
        }
        if !below_field_modulus(public_key) {
            return Err(CryptoError::InvalidPublicValue("not below the field modulus".to_string()));
        }
        let small = public_key[1..].iter().all(|b| *b == 0) && public_key[0] <= 1;
        if small {
            return Err(CryptoError::InvalidPublicValue("degenerate value".to_string()));
        }
        // Точки малого порядка: любой клампированный скаляр дает ноль
        let scalar = StaticSecret::from([LOW_ORDER_CHECK_SCALAR; KEY_LEN]);
        if !scalar.diffie_hellman(&DhPublicKeyDalek::from(*public_key)).was_contributory() {
            return Err(CryptoError::InvalidPublicValue("low-order point".to_string()));
        }
        Ok(())
    }

    fn dh(private_key: &Self::DhPrivateKey, their_public: &DhPublicKey) -> Result<SecretBytes, CryptoError> {
        Self::validate_dh_public(their_public)?;

        let bytes = Zeroizing::new(to_key_array(private_key.as_ref(), "DH private key")?);
        let static_secret = StaticSecret::from(*bytes);
        let shared = static_secret.diffie_hellman(&DhPublicKeyDalek::from(*their_public));
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidPublicValue("non-contributory shared secret".to_string()));
        }
        Ok(Zeroizing::new(shared.as_bytes().to_vec()))
    }

    fn generate_signature_keys() -> Result<(Self::SignaturePrivateKey, Vec<u8>), CryptoError> {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Ok((
            Zeroizing::new(signing_key.to_bytes().to_vec()),
            verifying_key.to_bytes().to_vec(),
        ))
    }

    fn signature_private_key_from_bytes(bytes: Vec<u8>) -> Self::SignaturePrivateKey {
        Zeroizing::new(bytes)
    }

    fn from_signature_private_to_public(
        private_key: &Self::SignaturePrivateKey,
    ) -> Result<Vec<u8>, CryptoError> {
        let bytes = Zeroizing::new(to_key_array(private_key.as_ref(), "signing key")?);
        let signing_key = SigningKey::from_bytes(&bytes);
        Ok(signing_key.verifying_key().to_bytes().to_vec())
    }

    fn sign(private_key: &Self::SignaturePrivateKey, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let bytes = Zeroizing::new(to_key_array(private_key.as_ref(), "signing key")?);
        let signing_key = SigningKey::from_bytes(&bytes);
        Ok(signing_key.sign(message).to_bytes().to_vec())
    }

    fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let vk_bytes = to_key_array(public_key, "verifying key")?;
        let verifying_key = VerifyingKey::from_bytes(&vk_bytes)
            .map_err(|e| CryptoError::InvalidInputError(format!("Invalid verifying key: {}", e)))?;

        let sig_bytes: &[u8; 64] = signature
            .try_into()
            .map_err(|_| CryptoError::InvalidInputError("Invalid signature length".to_string()))?;
        let signature_obj = Signature::from_bytes(sig_bytes);

        verifying_key
            .verify(message, &signature_obj)
            .map_err(|e| CryptoError::SignatureVerificationError(e.to_string()))
    }

    fn stream_xor(key: &[u8], counter: u64, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key_bytes = Zeroizing::new(to_key_array(key, "stream key")?);
        // 4 zero bytes followed by the big-endian counter.
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&counter.to_be_bytes());

        let mut cipher = ChaCha20::new(Key::from_slice(&key_bytes[..]), Nonce::from_slice(&nonce));
        let mut buffer = data.to_vec();
        cipher.apply_keystream(&mut buffer);
        Ok(buffer)
    }

    fn mac(key: &[u8], data: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
        let mut mac = HmacSha256::new_from_slice(key)
            .map_err(|e| CryptoError::InvalidInputError(e.to_string()))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().into())
    }

    fn mac_verify(key: &[u8], data: &[u8], tag: &[u8]) -> Result<(), CryptoError> {
        let mut mac = HmacSha256::new_from_slice(key)
            .map_err(|e| CryptoError::InvalidInputError(e.to_string()))?;
        mac.update(data);
        mac.verify_slice(tag).map_err(|_| CryptoError::MacMismatch)
    }

    fn hash(data: &[u8]) -> [u8; KEY_LEN] {
        Sha256::digest(data).into()
    }

    fn hkdf_derive_key(
        salt: &[u8],
        ikm: &[u8],
        info: &[u8],
        len: usize,
    ) -> Result<SecretBytes, CryptoError> {
        let hkdf = Hkdf::<Sha256>::new(Some(salt), ikm);
        let mut okm = Zeroizing::new(vec![0u8; len]);
        hkdf.expand(info, &mut okm)
            .map_err(|e| CryptoError::KeyDerivationError(e.to_string()))?;
        Ok(okm)
    }

    fn random_bytes(len: usize) -> Result<Vec<u8>, CryptoError> {
        let mut bytes = vec![0u8; len];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| CryptoError::KeyGenerationError(e.to_string()))?;
        Ok(bytes)
    }

    fn suite_id() -> u16 {
        crate::crypto::CLASSIC_SUITE_ID
    }
}
