//! Authenticated cipher: HKDF-derive an AES key, HMAC key, and IV from a shared secret
//! under a fixed info string, then encrypt-then-MAC with a truncated 8-byte tag.
//!
//! Per the design notes, this is a single concrete cipher carrying a fixed `kdf_info`
//! slice rather than a polymorphic dispatch over cipher "kinds" — constructing a
//! different [`Cipher`] for each use site is the parametrization point.

use crate::constants::{AES256_IV_LENGTH, AES256_KEY_LENGTH, HMAC_KEY_LENGTH, MAC_TAG_LENGTH};
use crate::errors::{Error, Result};
use crate::primitives::{aes_cbc_pkcs7_decrypt, aes_cbc_pkcs7_encrypt, ct_eq, hkdf_sha256, hmac_sha256};

struct DerivedKeys {
    aes_key: [u8; AES256_KEY_LENGTH],
    mac_key: [u8; HMAC_KEY_LENGTH],
    iv: [u8; AES256_IV_LENGTH],
}

fn derive_keys(kdf_info: &[u8], shared_secret: &[u8]) -> Result<DerivedKeys> {
    let out = hkdf_sha256(shared_secret, &[], kdf_info, AES256_KEY_LENGTH + HMAC_KEY_LENGTH + AES256_IV_LENGTH)?;
    let mut aes_key = [0u8; AES256_KEY_LENGTH];
    let mut mac_key = [0u8; HMAC_KEY_LENGTH];
    let mut iv = [0u8; AES256_IV_LENGTH];
    aes_key.copy_from_slice(&out[0..AES256_KEY_LENGTH]);
    mac_key.copy_from_slice(&out[AES256_KEY_LENGTH..AES256_KEY_LENGTH + HMAC_KEY_LENGTH]);
    iv.copy_from_slice(&out[AES256_KEY_LENGTH + HMAC_KEY_LENGTH..]);
    Ok(DerivedKeys { aes_key, mac_key, iv })
}

/// A cipher instance fixed to one KDF info label (e.g. `"OLM_KEYS"` or `"Pickle"`).
pub struct Cipher {
    kdf_info: &'static [u8],
}

impl Cipher {
    pub const fn new(kdf_info: &'static [u8]) -> Self {
        Cipher { kdf_info }
    }

    /// Encrypts `plaintext` under `shared_secret`, returning ciphertext and an 8-byte MAC
    /// computed over `header ‖ ciphertext` (the "framed buffer without the MAC").
    ///
    /// Callers own wire framing: this only produces the two authenticated parts.
    pub fn encrypt(&self, shared_secret: &[u8], header: &[u8], plaintext: &[u8]) -> Result<(Vec<u8>, [u8; MAC_TAG_LENGTH])> {
        let keys = derive_keys(self.kdf_info, shared_secret)?;
        let ciphertext = aes_cbc_pkcs7_encrypt(&keys.aes_key, &keys.iv, plaintext);

        let mut mac_input = Vec::with_capacity(header.len() + ciphertext.len());
        mac_input.extend_from_slice(header);
        mac_input.extend_from_slice(&ciphertext);
        let mac_full = hmac_sha256(&keys.mac_key, &mac_input);
        let mut tag = [0u8; MAC_TAG_LENGTH];
        tag.copy_from_slice(&mac_full[..MAC_TAG_LENGTH]);

        Ok((ciphertext, tag))
    }

    /// Verifies `tag` against `header ‖ ciphertext` in constant time, then decrypts.
    /// Decryption never runs before verification succeeds.
    pub fn decrypt(
        &self,
        shared_secret: &[u8],
        header: &[u8],
        ciphertext: &[u8],
        tag: &[u8; MAC_TAG_LENGTH],
    ) -> Result<Vec<u8>> {
        let keys = derive_keys(self.kdf_info, shared_secret)?;

        let mut mac_input = Vec::with_capacity(header.len() + ciphertext.len());
        mac_input.extend_from_slice(header);
        mac_input.extend_from_slice(ciphertext);
        let mac_full = hmac_sha256(&keys.mac_key, &mac_input);

        if !ct_eq(&mac_full[..MAC_TAG_LENGTH], tag) {
            return Err(Error::BadMessageMac);
        }

        aes_cbc_pkcs7_decrypt(&keys.aes_key, &keys.iv, ciphertext)
    }
}

pub const ROOT_CIPHER: Cipher = Cipher::new(crate::constants::KDF_INFO_ROOT);
pub const RATCHET_CIPHER: Cipher = Cipher::new(crate::constants::KDF_INFO_RATCHET);
pub const MESSAGE_CIPHER: Cipher = Cipher::new(crate::constants::KDF_INFO_MESSAGE_KEYS);
pub const PICKLE_CIPHER: Cipher = Cipher::new(crate::constants::KDF_INFO_PICKLE);
pub const GROUP_MESSAGE_CIPHER: Cipher = Cipher::new(crate::constants::KDF_INFO_GROUP_MESSAGE_KEYS);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let secret = [7u8; 32];
        let header = [0x03u8, 0x08, 0x01];
        let plaintext = b"Hello, World";

        let (ciphertext, tag) = MESSAGE_CIPHER.encrypt(&secret, &header, plaintext).unwrap();
        let decrypted = MESSAGE_CIPHER.decrypt(&secret, &header, &ciphertext, &tag).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn tampered_tag_fails_mac() {
        let secret = [7u8; 32];
        let header = [0x03u8, 0x08, 0x01];
        let plaintext = b"Hello, World";

        let (ciphertext, mut tag) = MESSAGE_CIPHER.encrypt(&secret, &header, plaintext).unwrap();
        tag[0] ^= 0xFF;
        let err = MESSAGE_CIPHER.decrypt(&secret, &header, &ciphertext, &tag).unwrap_err();
        assert_eq!(err, Error::BadMessageMac);
    }

    #[test]
    fn wrong_key_fails_mac() {
        let secret_a = [7u8; 32];
        let secret_b = [9u8; 32];
        let header = [0x03u8, 0x08, 0x01];
        let plaintext = b"Hello, World";

        let (ciphertext, tag) = MESSAGE_CIPHER.encrypt(&secret_a, &header, plaintext).unwrap();
        let err = MESSAGE_CIPHER.decrypt(&secret_b, &header, &ciphertext, &tag).unwrap_err();
        assert_eq!(err, Error::BadMessageMac);
    }
}
