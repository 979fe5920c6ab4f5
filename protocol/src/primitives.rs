//! Crypto primitives: Curve25519 DH and key generation, Ed25519
//! sign/verify, AES-256-CBC with PKCS#7 padding, SHA-256, HMAC-SHA-256, HKDF-SHA-256,
//! constant-time equality, and the key newtypes that carry zeroization.
//!
//! Every key-generating function here takes its randomness as an explicit caller-supplied
//! slice rather than reaching for a thread-local RNG: this crate never acquires entropy on
//! its own.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use arrayref::array_ref;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{
    AES256_IV_LENGTH, AES256_KEY_LENGTH, CURVE25519_PUBLIC_LENGTH, CURVE25519_SECRET_LENGTH,
    SHA256_HASH_LENGTH, SIGNATURE_LENGTH,
};
use crate::errors::{Error, Result};

const AES_BLOCK_LENGTH: usize = 16;
type HmacSha256 = Hmac<Sha256>;

/// The PKCS#7-padded ciphertext length for a given plaintext length, computable before
/// encryption since the padding scheme is deterministic.
pub fn aes_cbc_pkcs7_output_len(plaintext_len: usize) -> usize {
    plaintext_len + AES_BLOCK_LENGTH - plaintext_len % AES_BLOCK_LENGTH
}

fn xor_block(block: &mut [u8; AES_BLOCK_LENGTH], input: &[u8]) {
    for i in 0..AES_BLOCK_LENGTH {
        block[i] ^= input[i];
    }
}

/// A Curve25519 private scalar. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey([u8; CURVE25519_SECRET_LENGTH]);

/// A Curve25519 public point.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PublicKey(pub(crate) [u8; CURVE25519_PUBLIC_LENGTH]);

/// A Curve25519 key pair, as produced by [`curve25519_generate`].
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Curve25519Pair {
    #[zeroize(skip)]
    pub public: PublicKey,
    pub private: PrivateKey,
}

/// A SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Sha256Hash(pub [u8; SHA256_HASH_LENGTH]);

/// An Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Signature(pub [u8; SIGNATURE_LENGTH]);

impl PrivateKey {
    pub fn as_bytes(&self) -> &[u8; CURVE25519_SECRET_LENGTH] {
        &self.0
    }
}

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; CURVE25519_PUBLIC_LENGTH] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; CURVE25519_PUBLIC_LENGTH]) -> Self {
        PublicKey(bytes)
    }

    /// Constant-time equality, used everywhere an inbound identity or key-id is compared
    /// against stored state.
    pub fn ct_eq(&self, other: &PublicKey) -> bool {
        ct_eq(&self.0, &other.0)
    }

    pub fn hash(&self) -> Sha256Hash {
        Sha256Hash(sha256(&self.0))
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// `curve25519_generate(random[32]) -> Pair` — clamps and computes the public point.
pub fn curve25519_generate(random: &[u8]) -> Result<Curve25519Pair> {
    if random.len() < CURVE25519_SECRET_LENGTH {
        return Err(Error::NotEnoughRandom);
    }
    let seed = *array_ref![random, 0, CURVE25519_SECRET_LENGTH];
    let secret = x25519_dalek::StaticSecret::from(seed);
    let public = x25519_dalek::PublicKey::from(&secret);
    Ok(Curve25519Pair {
        public: PublicKey(public.to_bytes()),
        private: PrivateKey(secret.to_bytes()),
    })
}

/// `curve25519_dh(our_priv, their_pub) -> [u8;32]`.
pub fn curve25519_dh(our_priv: &PrivateKey, their_pub: &PublicKey) -> [u8; 32] {
    let secret = x25519_dalek::StaticSecret::from(our_priv.0);
    let public = x25519_dalek::PublicKey::from(their_pub.0);
    secret.diffie_hellman(&public).to_bytes()
}

/// An Ed25519 signing key pair.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Ed25519Pair {
    #[zeroize(skip)]
    pub public: [u8; 32],
    pub private: [u8; 32],
}

/// `ed25519_generate(seed[32])`.
pub fn ed25519_generate(seed: &[u8]) -> Result<Ed25519Pair> {
    if seed.len() < 32 {
        return Err(Error::NotEnoughRandom);
    }
    let signing_key = ed25519_dalek::SigningKey::from_bytes(array_ref![seed, 0, 32]);
    let verifying_key = signing_key.verifying_key();
    Ok(Ed25519Pair {
        public: verifying_key.to_bytes(),
        private: signing_key.to_bytes(),
    })
}

/// `ed25519_sign`.
pub fn ed25519_sign(pair: &Ed25519Pair, message: &[u8]) -> Signature {
    use ed25519_dalek::Signer;
    let signing_key = ed25519_dalek::SigningKey::from_bytes(&pair.private);
    Signature(signing_key.sign(message).to_bytes())
}

/// `ed25519_verify` (returns bool, never an error: a bad signature is a fact, not a fault).
pub fn ed25519_verify(public: &[u8; 32], message: &[u8], signature: &Signature) -> bool {
    let verifying_key = match ed25519_dalek::VerifyingKey::from_bytes(public) {
        Ok(k) => k,
        Err(_) => return false,
    };
    let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
    verifying_key.verify_strict(message, &sig).is_ok()
}

/// `aes_cbc_pkcs7_encrypt` — CBC mode with manual block chaining and PKCS#7 padding,
/// mirroring the reference implementation's hand-rolled construction over the same
/// block cipher primitive.
pub fn aes_cbc_pkcs7_encrypt(key: &[u8; AES256_KEY_LENGTH], iv: &[u8; AES256_IV_LENGTH], plaintext: &[u8]) -> Vec<u8> {
    use aes::cipher::generic_array::GenericArray;
    let cipher = aes::Aes256::new(GenericArray::from_slice(key));
    let padded_len = plaintext.len() + AES_BLOCK_LENGTH - plaintext.len() % AES_BLOCK_LENGTH;
    let mut output = vec![0u8; padded_len];

    let mut prev_block = *iv;
    let mut offset = 0;
    while offset + AES_BLOCK_LENGTH <= plaintext.len() {
        let mut block = [0u8; AES_BLOCK_LENGTH];
        block.copy_from_slice(&prev_block);
        xor_block(&mut block, &plaintext[offset..offset + AES_BLOCK_LENGTH]);
        let mut ga = GenericArray::clone_from_slice(&block);
        cipher.encrypt_block(&mut ga);
        output[offset..offset + AES_BLOCK_LENGTH].copy_from_slice(&ga);
        prev_block = ga.into();
        offset += AES_BLOCK_LENGTH;
    }

    let remaining = plaintext.len() - offset;
    let mut last_block = [0u8; AES_BLOCK_LENGTH];
    last_block[..remaining].copy_from_slice(&plaintext[offset..]);
    let pad_byte = (AES_BLOCK_LENGTH - remaining) as u8;
    for b in last_block.iter_mut().skip(remaining) {
        *b = pad_byte;
    }
    xor_block(&mut last_block, &prev_block);
    let mut ga = GenericArray::clone_from_slice(&last_block);
    cipher.encrypt_block(&mut ga);
    output[offset..offset + AES_BLOCK_LENGTH].copy_from_slice(&ga);

    output
}

/// `aes_cbc_pkcs7_decrypt` — fails when the padding byte is 0, exceeds the block size, or
/// is otherwise inconsistent with the ciphertext length.
pub fn aes_cbc_pkcs7_decrypt(
    key: &[u8; AES256_KEY_LENGTH],
    iv: &[u8; AES256_IV_LENGTH],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    use aes::cipher::generic_array::GenericArray;
    if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK_LENGTH != 0 {
        return Err(Error::BadMessageFormat);
    }
    let cipher = aes::Aes256::new(GenericArray::from_slice(key));
    let mut output = vec![0u8; ciphertext.len()];
    let mut prev_block = *iv;

    let mut offset = 0;
    while offset < ciphertext.len() {
        let block_in = &ciphertext[offset..offset + AES_BLOCK_LENGTH];
        let mut ga = GenericArray::clone_from_slice(block_in);
        cipher.decrypt_block(&mut ga);
        let mut plain_block = [0u8; AES_BLOCK_LENGTH];
        plain_block.copy_from_slice(&ga);
        xor_block(&mut plain_block, &prev_block);
        output[offset..offset + AES_BLOCK_LENGTH].copy_from_slice(&plain_block);
        prev_block.copy_from_slice(block_in);
        offset += AES_BLOCK_LENGTH;
    }

    let padding = *output.last().expect("checked non-empty above") as usize;
    if padding == 0 || padding > output.len() || padding > AES_BLOCK_LENGTH {
        return Err(Error::BadMessageFormat);
    }
    output.truncate(output.len() - padding);
    Ok(output)
}

/// `sha256`.
pub fn sha256(input: &[u8]) -> [u8; SHA256_HASH_LENGTH] {
    let mut hasher = Sha256::new();
    hasher.update(input);
    hasher.finalize().into()
}

/// `hmac_sha256`.
pub fn hmac_sha256(key: &[u8], input: &[u8]) -> [u8; SHA256_HASH_LENGTH] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC-SHA256 accepts any key length");
    mac.update(input);
    mac.finalize().into_bytes().into()
}

/// `hkdf_sha256(ikm, salt, info, out_len)` — an empty `salt` defaults to 32 zero bytes.
pub fn hkdf_sha256(ikm: &[u8], salt: &[u8], info: &[u8], out_len: usize) -> Result<Vec<u8>> {
    let zero_salt = [0u8; 32];
    let salt = if salt.is_empty() { &zero_salt[..] } else { salt };
    let hk = hkdf::Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut out = vec![0u8; out_len];
    hk.expand(info, &mut out)?;
    Ok(out)
}

/// `ct_eq(a, b) -> bool` — constant-time comparison over equal-length slices. Slices of
/// different length are never equal (and the length check itself need not be constant
/// time: length is not the secret here).
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Zeroizes a buffer in place. A thin wrapper kept around so call sites read as an
/// explicit security operation rather than an incidental `fill(0)`.
pub fn zeroize(buf: &mut [u8]) {
    buf.zeroize();
}
