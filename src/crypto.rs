//! Ciphers used to protect the frames of a connection
//!
//! A [CryptoOption] names a keyed [Cipher]. During the handshake the peers agree on one option. A
//! symmetric option is only used to exchange fresh nonces from which the key of the session
//! cipher ([Aes256GcmCipher]) is derived. Other options are used as they are.
use sodiumoxide::crypto::{box_, hash::sha256, secretbox};
use std::sync::Arc;

/// Size of the nonces exchanged to derive the session key.
pub const KEY_NONCE_SIZE: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CipherError {
    #[error("failed to encrypt data")]
    Encrypt,
    #[error("failed to decrypt and authenticate data")]
    Decrypt,
    #[error("invalid key length {0}")]
    KeyLength(usize),
}

pub trait Cipher: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    /// Symmetric ciphers share a long-lived key. They are only used to derive a session key.
    fn is_symmetric(&self) -> bool;

    /// Number of bytes [Cipher::encrypt] adds to the plaintext.
    fn overhead(&self) -> usize;

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError>;

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError>;

    fn hash(&self, data: &[u8]) -> [u8; 32] {
        hash(data)
    }
}

pub fn hash(data: impl AsRef<[u8]>) -> [u8; 32] {
    let digest = sha256::hash(data.as_ref());
    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_ref());
    out
}

/// A cipher that leaves data untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct Plaintext;

impl Cipher for Plaintext {
    fn name(&self) -> &str {
        "plaintext"
    }

    fn is_symmetric(&self) -> bool {
        false
    }

    fn overhead(&self) -> usize {
        0
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        Ok(ciphertext.to_vec())
    }
}

/// XSalsa20-Poly1305 with a pre-shared key. Each message is prefixed with a random nonce.
#[derive(Clone)]
pub struct SecretBox {
    key: secretbox::Key,
}

impl SecretBox {
    pub fn new(key: &[u8]) -> Result<Self, CipherError> {
        let key = secretbox::Key::from_slice(key).ok_or(CipherError::KeyLength(key.len()))?;
        Ok(Self { key })
    }

    /// Derive the key from an arbitrary passphrase.
    pub fn from_passphrase(passphrase: impl AsRef<[u8]>) -> Self {
        Self {
            key: secretbox::Key(hash(passphrase)),
        }
    }
}

impl std::fmt::Debug for SecretBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretBox").finish()
    }
}

impl Cipher for SecretBox {
    fn name(&self) -> &str {
        "secretbox"
    }

    fn is_symmetric(&self) -> bool {
        true
    }

    fn overhead(&self) -> usize {
        secretbox::NONCEBYTES + secretbox::MACBYTES
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let nonce = secretbox::gen_nonce();
        let sealed = secretbox::seal(plaintext, &nonce, &self.key);
        Ok([nonce.as_ref(), &sealed].concat())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        if ciphertext.len() < secretbox::NONCEBYTES {
            return Err(CipherError::Decrypt);
        }
        let (nonce, sealed) = ciphertext.split_at(secretbox::NONCEBYTES);
        let nonce = secretbox::Nonce::from_slice(nonce).ok_or(CipherError::Decrypt)?;
        secretbox::open(sealed, &nonce, &self.key).map_err(|()| CipherError::Decrypt)
    }
}

/// Curve25519 public key encryption between two known key pairs. Used as is for the whole
/// session.
#[derive(Clone)]
pub struct SealedPair {
    key: box_::PrecomputedKey,
}

impl SealedPair {
    pub fn new(peer_public_key: &box_::PublicKey, secret_key: &box_::SecretKey) -> Self {
        Self {
            key: box_::precompute(peer_public_key, secret_key),
        }
    }
}

impl std::fmt::Debug for SealedPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedPair").finish()
    }
}

impl Cipher for SealedPair {
    fn name(&self) -> &str {
        "box"
    }

    fn is_symmetric(&self) -> bool {
        false
    }

    fn overhead(&self) -> usize {
        box_::NONCEBYTES + box_::MACBYTES
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let nonce = box_::gen_nonce();
        let sealed = box_::seal_precomputed(plaintext, &nonce, &self.key);
        Ok([nonce.as_ref(), &sealed].concat())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        if ciphertext.len() < box_::NONCEBYTES {
            return Err(CipherError::Decrypt);
        }
        let (nonce, sealed) = ciphertext.split_at(box_::NONCEBYTES);
        let nonce = box_::Nonce::from_slice(nonce).ok_or(CipherError::Decrypt)?;
        box_::open_precomputed(sealed, &nonce, &self.key).map_err(|()| CipherError::Decrypt)
    }
}

const AES_GCM_NONCE_SIZE: usize = 12;
const AES_GCM_TAG_SIZE: usize = 16;

/// AES-256-GCM keyed with a per-connection session key.
#[derive(Clone)]
pub struct Aes256GcmCipher {
    cipher: aes_gcm::Aes256Gcm,
}

impl Aes256GcmCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        use aes_gcm::aead::NewAead as _;
        Self {
            cipher: aes_gcm::Aes256Gcm::new(aes_gcm::Key::from_slice(key)),
        }
    }
}

impl std::fmt::Debug for Aes256GcmCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aes256GcmCipher").finish()
    }
}

impl Cipher for Aes256GcmCipher {
    fn name(&self) -> &str {
        "aes-256-gcm"
    }

    fn is_symmetric(&self) -> bool {
        true
    }

    fn overhead(&self) -> usize {
        AES_GCM_NONCE_SIZE + AES_GCM_TAG_SIZE
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        use aes_gcm::aead::Aead as _;
        let mut nonce = [0u8; AES_GCM_NONCE_SIZE];
        sodiumoxide::randombytes::randombytes_into(&mut nonce);
        let sealed = self
            .cipher
            .encrypt(aes_gcm::Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CipherError::Encrypt)?;
        Ok([&nonce[..], &sealed].concat())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        use aes_gcm::aead::Aead as _;
        if ciphertext.len() < AES_GCM_NONCE_SIZE {
            return Err(CipherError::Decrypt);
        }
        let (nonce, sealed) = ciphertext.split_at(AES_GCM_NONCE_SIZE);
        self.cipher
            .decrypt(aes_gcm::Nonce::from_slice(nonce), sealed)
            .map_err(|_| CipherError::Decrypt)
    }
}

/// Derive the key of the session cipher from the nonces of both peers.
pub(crate) fn session_cipher(
    cipher: &dyn Cipher,
    client_nonce: &[u8],
    server_nonce: &[u8],
) -> Aes256GcmCipher {
    let key = cipher.hash(&[client_nonce, server_nonce].concat());
    Aes256GcmCipher::new(&key)
}

pub(crate) fn random_nonce() -> Vec<u8> {
    sodiumoxide::randombytes::randombytes(KEY_NONCE_SIZE)
}

/// A named cipher offered during crypto negotiation. Options with a lower priority are
/// preferred.
#[derive(Debug, Clone)]
pub struct CryptoOption {
    pub name: String,
    pub cipher: Arc<dyn Cipher>,
    pub priority: i32,
}

impl CryptoOption {
    pub fn new(name: impl Into<String>, cipher: impl Cipher + 'static, priority: i32) -> Self {
        Self {
            name: name.into(),
            cipher: Arc::new(cipher),
            priority,
        }
    }

    pub fn plaintext() -> Self {
        Self::new("", Plaintext, i32::MAX)
    }

    /// Name exchanged with the peer.
    pub fn wire_name(&self) -> String {
        format!("{}_{}", self.cipher.name(), self.name)
    }
}

/// Sort options by priority. An empty list becomes a single plaintext option.
pub(crate) fn normalize_options(mut options: Vec<CryptoOption>) -> Vec<CryptoOption> {
    if options.is_empty() {
        options.push(CryptoOption::plaintext());
    }
    options.sort_by_key(|option| option.priority);
    options
}

/// Pick the first of `ours` that the peer offered.
pub(crate) fn select<'a>(ours: &'a [CryptoOption], offered: &[String]) -> Option<&'a CryptoOption> {
    ours.iter()
        .find(|option| offered.iter().any(|name| *name == option.wire_name()))
}
