use aes_gcm::aead::Aead;
use aes_gcm::aes::Aes192;
use aes_gcm::aes::cipher::consts::U12;
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use parking_lot::RwLock;
use rand::RngCore;
use sha2::{Digest, Sha256};

type Aes192Gcm = AesGcm<Aes192, U12>;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
	#[error("invalid key length {0}, want 16, 24 or 32 bytes")]
	InvalidKeyLength(usize),
	#[error("invalid ciphertext")]
	InvalidCiphertext,
	#[error("decryption failed")]
	DecryptionFailed,
	#[error("encryption failed")]
	EncryptionFailed,
}

enum Cipher {
	Aes128(Aes128Gcm),
	Aes192(Aes192Gcm),
	Aes256(Aes256Gcm),
}

impl Cipher {
	fn new(key: &[u8]) -> Result<Self, CryptoError> {
		match key.len() {
			16 => Ok(Cipher::Aes128(Aes128Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength(16))?)),
			24 => Ok(Cipher::Aes192(Aes192Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength(24))?)),
			32 => Ok(Cipher::Aes256(Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength(32))?)),
			n => Err(CryptoError::InvalidKeyLength(n)),
		}
	}

	fn seal(&self, nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
		let nonce = Nonce::from_slice(nonce);
		match self {
			Cipher::Aes128(c) => c.encrypt(nonce, plaintext),
			Cipher::Aes192(c) => c.encrypt(nonce, plaintext),
			Cipher::Aes256(c) => c.encrypt(nonce, plaintext),
		}
		.map_err(|_| CryptoError::EncryptionFailed)
	}

	fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
		let nonce = Nonce::from_slice(nonce);
		match self {
			Cipher::Aes128(c) => c.decrypt(nonce, ciphertext),
			Cipher::Aes192(c) => c.decrypt(nonce, ciphertext),
			Cipher::Aes256(c) => c.decrypt(nonce, ciphertext),
		}
		.map_err(|_| CryptoError::DecryptionFailed)
	}
}

struct Keyed {
	cipher: Cipher,
	key_id: String,
}

impl Keyed {
	fn new(key: &[u8]) -> Result<Self, CryptoError> {
		Ok(Keyed {
			cipher: Cipher::new(key)?,
			key_id: derive_key_id(key),
		})
	}
}

/// AEAD service for credentials at rest. Ciphertext framing is
/// `base64(nonce || sealed)` with a fresh 96-bit nonce per call, so two
/// encryptions of the same plaintext never match. Readers share the key;
/// rotation takes the write lock.
pub struct EncryptionService {
	inner: RwLock<Keyed>,
}

impl EncryptionService {
	pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
		Ok(EncryptionService {
			inner: RwLock::new(Keyed::new(key)?),
		})
	}

	pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
		if plaintext.is_empty() {
			return Ok(String::new());
		}
		let mut nonce = [0u8; NONCE_LEN];
		rand::rng().fill_bytes(&mut nonce);
		let sealed = self.inner.read().cipher.seal(&nonce, plaintext)?;
		let mut framed = Vec::with_capacity(NONCE_LEN + sealed.len());
		framed.extend_from_slice(&nonce);
		framed.extend_from_slice(&sealed);
		Ok(STANDARD.encode(framed))
	}

	pub fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>, CryptoError> {
		if ciphertext.is_empty() {
			return Ok(Vec::new());
		}
		let framed = STANDARD
			.decode(ciphertext)
			.map_err(|_| CryptoError::InvalidCiphertext)?;
		if framed.len() < NONCE_LEN + TAG_LEN + 1 {
			return Err(CryptoError::InvalidCiphertext);
		}
		let (nonce, sealed) = framed.split_at(NONCE_LEN);
		self.inner.read().cipher.open(nonce, sealed)
	}

	/// Short stable identifier of the active key, for rotation tracking.
	pub fn key_id(&self) -> String {
		self.inner.read().key_id.clone()
	}

	pub fn rotate(&self, key: &[u8]) -> Result<(), CryptoError> {
		let next = Keyed::new(key)?;
		*self.inner.write() = next;
		Ok(())
	}
}

fn derive_key_id(key: &[u8]) -> String {
	let digest = Sha256::digest(key);
	let mut id = URL_SAFE_NO_PAD.encode(digest);
	id.truncate(8);
	id
}

#[cfg(test)]
mod tests {
	use super::*;

	fn svc(key: &[u8]) -> EncryptionService {
		EncryptionService::new(key).unwrap()
	}

	#[test]
	fn roundtrip_all_key_sizes() {
		for key in [&[7u8; 16][..], &[7u8; 24][..], &[7u8; 32][..]] {
			let s = svc(key);
			let ct = s.encrypt(b"sk-ant-api03-secret").unwrap();
			assert_eq!(s.decrypt(&ct).unwrap(), b"sk-ant-api03-secret");
		}
	}

	#[test]
	fn fresh_nonce_gives_distinct_ciphertexts() {
		let s = svc(&[1u8; 32]);
		let a = s.encrypt(b"same plaintext").unwrap();
		let b = s.encrypt(b"same plaintext").unwrap();
		assert_ne!(a, b);
		assert_eq!(s.decrypt(&a).unwrap(), s.decrypt(&b).unwrap());
	}

	#[test]
	fn empty_plaintext_roundtrips_empty() {
		let s = svc(&[1u8; 32]);
		assert_eq!(s.encrypt(b"").unwrap(), "");
		assert_eq!(s.decrypt("").unwrap(), Vec::<u8>::new());
	}

	#[test]
	fn wrong_key_fails_auth() {
		let a = svc(&[1u8; 32]);
		let b = svc(&[2u8; 32]);
		let ct = a.encrypt(b"credential").unwrap();
		assert_eq!(b.decrypt(&ct), Err(CryptoError::DecryptionFailed));
	}

	#[test]
	fn truncated_ciphertext_is_invalid() {
		let s = svc(&[1u8; 32]);
		let ct = s.encrypt(b"credential").unwrap();
		let short = STANDARD.encode(&STANDARD.decode(&ct).unwrap()[..NONCE_LEN + TAG_LEN]);
		assert_eq!(s.decrypt(&short), Err(CryptoError::InvalidCiphertext));
		assert_eq!(s.decrypt("not base64!!"), Err(CryptoError::InvalidCiphertext));
	}

	#[test]
	fn tampered_ciphertext_fails_auth() {
		let s = svc(&[1u8; 32]);
		let mut framed = STANDARD.decode(s.encrypt(b"credential").unwrap()).unwrap();
		let last = framed.len() - 1;
		framed[last] ^= 0x01;
		assert_eq!(s.decrypt(&STANDARD.encode(framed)), Err(CryptoError::DecryptionFailed));
	}

	#[test]
	fn key_id_is_stable_and_rotates() {
		let s = svc(&[1u8; 32]);
		let before = s.key_id();
		assert_eq!(before.len(), 8);
		assert_eq!(before, s.key_id());
		let ct = s.encrypt(b"credential").unwrap();
		s.rotate(&[9u8; 16]).unwrap();
		assert_ne!(s.key_id(), before);
		assert_eq!(s.decrypt(&ct), Err(CryptoError::DecryptionFailed));
	}

	#[test]
	fn bad_key_length_rejected() {
		assert!(matches!(
			EncryptionService::new(&[0u8; 17]),
			Err(CryptoError::InvalidKeyLength(17))
		));
	}
}
