//! The Double Ratchet state machine: one root key, at most one
//! active sending chain, an ordered sequence of receiving chains, and a bounded cache of
//! skipped message keys recoverable out of order.
//!
//! This mirrors the reference `ratchet.cpp` design directly — including retaining
//! *multiple* receiver chains and an ordered skipped-key list — rather than a simpler
//! single-receiver-chain shape.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::cipher::MESSAGE_CIPHER;
use crate::codec::{decode_pairwise_message, pairwise_message_header, PairwiseMessage};
use crate::constants::{CURVE25519_SECRET_LENGTH, MAC_TAG_LENGTH, MAX_MESSAGE_GAP, MAX_SKIPPED_MESSAGE_KEYS};
use crate::errors::{Error, Result};
use crate::primitives::{
    aes_cbc_pkcs7_output_len, curve25519_dh, curve25519_generate, hkdf_sha256, hmac_sha256, Curve25519Pair, PublicKey,
};

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct ChainKey {
    key: [u8; 32],
    #[zeroize(skip)]
    index: u32,
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct MessageKey {
    key: [u8; 32],
    #[zeroize(skip)]
    index: u32,
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct SenderChain {
    ratchet_key: Curve25519Pair,
    chain: ChainKey,
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct ReceiverChain {
    #[zeroize(skip)]
    ratchet_key: PublicKey,
    chain: ChainKey,
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct SkippedMessageKey {
    #[zeroize(skip)]
    ratchet_key: PublicKey,
    message_key: MessageKey,
}

fn chain_message_key(chain: &ChainKey) -> MessageKey {
    MessageKey {
        key: hmac_sha256(&chain.key, crate::constants::MESSAGE_KEY_SEED),
        index: chain.index,
    }
}

fn chain_advance(chain: &mut ChainKey) {
    chain.key = hmac_sha256(&chain.key, crate::constants::CHAIN_KEY_SEED);
    chain.index += 1;
}

/// Derives `(new_root_key, new_chain_key)` from a fresh DH output via a single DH
/// ratchet step: `HKDF(ikm=dh, salt=root_key, info="OLM_RATCHET", out=64)`.
fn dh_ratchet_step(root_key: &[u8; 32], dh: &[u8; 32]) -> Result<([u8; 32], ChainKey)> {
    let out = hkdf_sha256(dh, root_key, crate::constants::KDF_INFO_RATCHET, 64)?;
    let mut new_root = [0u8; 32];
    let mut new_chain_key = [0u8; 32];
    new_root.copy_from_slice(&out[0..32]);
    new_chain_key.copy_from_slice(&out[32..64]);
    Ok((new_root, ChainKey { key: new_chain_key, index: 0 }))
}

/// The double ratchet: root-keyed, with one optional sending chain and an ordered list
/// of receiving chains.
pub struct Ratchet {
    root_key: [u8; 32],
    sender_chain: Option<SenderChain>,
    receiver_chains: Vec<ReceiverChain>,
    skipped_message_keys: Vec<SkippedMessageKey>,
}

impl Drop for Ratchet {
    fn drop(&mut self) {
        self.root_key.zeroize();
    }
}

impl Ratchet {
    /// Initializes the ratchet as the session initiator (Alice): her ratchet key pair
    /// becomes the sender chain; no receiver chains exist yet.
    pub fn init_alice(shared_secret: &[u8], ratchet_key: Curve25519Pair) -> Result<Ratchet> {
        let (root_key, chain) = init_root(shared_secret)?;
        Ok(Ratchet {
            root_key,
            sender_chain: Some(SenderChain { ratchet_key, chain }),
            receiver_chains: Vec::new(),
            skipped_message_keys: Vec::new(),
        })
    }

    /// Initializes the ratchet as the session responder (Bob): the initiator's ratchet
    /// public becomes the first receiver chain; no sender chain exists yet.
    pub fn init_bob(shared_secret: &[u8], alice_ratchet_key: PublicKey) -> Result<Ratchet> {
        let (root_key, chain) = init_root(shared_secret)?;
        Ok(Ratchet {
            root_key,
            sender_chain: None,
            receiver_chains: vec![ReceiverChain { ratchet_key: alice_ratchet_key, chain }],
            skipped_message_keys: Vec::new(),
        })
    }

    /// Encrypts `plaintext` into a framed pairwise message.
    /// `random` supplies the 32 bytes needed only when a new sender chain must be
    /// allocated; pass an empty slice once a sender chain already exists.
    pub fn encrypt(&mut self, plaintext: &[u8], random: &[u8]) -> Result<Vec<u8>> {
        if self.sender_chain.is_none() {
            if random.len() < CURVE25519_SECRET_LENGTH {
                return Err(Error::NotEnoughRandom);
            }
            let ratchet_key = curve25519_generate(random)?;
            let their_ratchet = self
                .receiver_chains
                .last()
                .map(|c| c.ratchet_key)
                .expect("sender_chain is only None after a receiver chain was installed");
            let dh = curve25519_dh(&ratchet_key.private, &their_ratchet);
            let (new_root, new_chain) = dh_ratchet_step(&self.root_key, &dh)?;
            self.root_key = new_root;
            self.sender_chain = Some(SenderChain { ratchet_key, chain: new_chain });
        }

        let sender = self.sender_chain.as_mut().expect("just ensured present");
        let message_key = chain_message_key(&sender.chain);
        let ratchet_public = *sender.ratchet_key.public.as_bytes();

        let ciphertext_len = aes_cbc_pkcs7_output_len(plaintext.len());
        let header = pairwise_message_header(message_key.index, &ratchet_public, ciphertext_len);
        let (ciphertext, tag) = MESSAGE_CIPHER.encrypt(&message_key.key, &header, plaintext)?;

        let mut framed = header;
        framed.extend_from_slice(&ciphertext);
        framed.extend_from_slice(&tag);

        chain_advance(&mut sender.chain);
        Ok(framed)
    }

    /// Decrypts a framed pairwise message.
    pub fn decrypt(&mut self, framed: &[u8]) -> Result<Vec<u8>> {
        let message = decode_pairwise_message(framed)?;
        let ratchet_key = PublicKey::from_bytes(message.ratchet_key);

        if let Some(idx) = self.receiver_chains.iter().position(|c| c.ratchet_key.ct_eq(&ratchet_key)) {
            if message.counter < self.receiver_chains[idx].chain.index {
                return self.decrypt_from_skipped(&ratchet_key, message.counter, &message);
            }
            return self.decrypt_existing_chain(idx, &message);
        }

        self.decrypt_new_chain(&ratchet_key, &message)
    }

    fn decrypt_from_skipped(&mut self, ratchet_key: &PublicKey, counter: u32, message: &PairwiseMessage<'_>) -> Result<Vec<u8>> {
        let pos = self
            .skipped_message_keys
            .iter()
            .position(|k| k.ratchet_key.ct_eq(ratchet_key) && k.message_key.index == counter)
            .ok_or(Error::BadMessageMac)?;

        let header = &message.body[..message.body.len() - message.ciphertext.len()];
        let plaintext = MESSAGE_CIPHER.decrypt(&self.skipped_message_keys[pos].message_key.key, header, message.ciphertext, &message.mac)?;
        self.skipped_message_keys.remove(pos);
        Ok(plaintext)
    }

    fn decrypt_existing_chain(&mut self, idx: usize, message: &PairwiseMessage<'_>) -> Result<Vec<u8>> {
        let gap = (message.counter as u64).saturating_sub(self.receiver_chains[idx].chain.index as u64);
        if gap > MAX_MESSAGE_GAP {
            return Err(Error::BadMessageMac);
        }

        let ratchet_key = self.receiver_chains[idx].ratchet_key;
        let mut working = self.receiver_chains[idx].chain.clone();
        let mut new_skips = Vec::new();
        while working.index < message.counter {
            new_skips.push(SkippedMessageKey { ratchet_key, message_key: chain_message_key(&working) });
            chain_advance(&mut working);
        }
        let message_key = chain_message_key(&working);

        let header = &message.body[..message.body.len() - message.ciphertext.len()];
        let plaintext = MESSAGE_CIPHER.decrypt(&message_key.key, header, message.ciphertext, &message.mac)?;

        chain_advance(&mut working);
        self.receiver_chains[idx].chain = working;
        self.push_skipped(new_skips);
        Ok(plaintext)
    }

    fn decrypt_new_chain(&mut self, ratchet_key: &PublicKey, message: &PairwiseMessage<'_>) -> Result<Vec<u8>> {
        if message.counter as u64 > MAX_MESSAGE_GAP {
            return Err(Error::BadMessageMac);
        }
        let sender = self.sender_chain.as_ref().ok_or(Error::BadMessageMac)?;

        let dh = curve25519_dh(&sender.ratchet_key.private, ratchet_key);
        let (new_root, mut working) = dh_ratchet_step(&self.root_key, &dh)?;

        let mut new_skips = Vec::new();
        while working.index < message.counter {
            new_skips.push(SkippedMessageKey { ratchet_key: *ratchet_key, message_key: chain_message_key(&working) });
            chain_advance(&mut working);
        }
        let message_key = chain_message_key(&working);

        let header = &message.body[..message.body.len() - message.ciphertext.len()];
        let plaintext = MESSAGE_CIPHER.decrypt(&message_key.key, header, message.ciphertext, &message.mac)?;

        chain_advance(&mut working);
        self.root_key = new_root;
        self.receiver_chains.push(ReceiverChain { ratchet_key: *ratchet_key, chain: working });
        self.push_skipped(new_skips);
        self.sender_chain = None;
        Ok(plaintext)
    }

    fn push_skipped(&mut self, mut new_skips: Vec<SkippedMessageKey>) {
        self.skipped_message_keys.append(&mut new_skips);
        while self.skipped_message_keys.len() > MAX_SKIPPED_MESSAGE_KEYS {
            self.skipped_message_keys.remove(0);
        }
    }

    /// Exposes every field a pickle needs to serialize, without making them public API.
    pub(crate) fn pickle_parts(&self) -> RatchetPickleParts<'_> {
        RatchetPickleParts {
            root_key: &self.root_key,
            sender_chain: self.sender_chain.as_ref().map(|s| (s.ratchet_key.clone(), s.chain.key, s.chain.index)),
            receiver_chains: self
                .receiver_chains
                .iter()
                .map(|c| (c.ratchet_key, c.chain.key, c.chain.index))
                .collect(),
            skipped_message_keys: self
                .skipped_message_keys
                .iter()
                .map(|k| (k.ratchet_key, k.message_key.key, k.message_key.index))
                .collect(),
        }
    }

    /// Rebuilds a ratchet from pickled parts, the inverse of [`Ratchet::pickle_parts`].
    pub(crate) fn from_pickle_parts(
        root_key: [u8; 32],
        sender_chain: Option<(Curve25519Pair, [u8; 32], u32)>,
        receiver_chains: Vec<(PublicKey, [u8; 32], u32)>,
        skipped_message_keys: Vec<(PublicKey, [u8; 32], u32)>,
    ) -> Ratchet {
        Ratchet {
            root_key,
            sender_chain: sender_chain.map(|(ratchet_key, key, index)| SenderChain { ratchet_key, chain: ChainKey { key, index } }),
            receiver_chains: receiver_chains
                .into_iter()
                .map(|(ratchet_key, key, index)| ReceiverChain { ratchet_key, chain: ChainKey { key, index } })
                .collect(),
            skipped_message_keys: skipped_message_keys
                .into_iter()
                .map(|(ratchet_key, key, index)| SkippedMessageKey { ratchet_key, message_key: MessageKey { key, index } })
                .collect(),
        }
    }
}

/// Plain-data view of a ratchet's internal state, for [`crate::pickle`] to encode.
pub(crate) struct RatchetPickleParts<'a> {
    pub root_key: &'a [u8; 32],
    pub sender_chain: Option<(Curve25519Pair, [u8; 32], u32)>,
    pub receiver_chains: Vec<(PublicKey, [u8; 32], u32)>,
    pub skipped_message_keys: Vec<(PublicKey, [u8; 32], u32)>,
}

fn init_root(shared_secret: &[u8]) -> Result<([u8; 32], ChainKey)> {
    let out = hkdf_sha256(shared_secret, &[], crate::constants::KDF_INFO_ROOT, 64)?;
    let mut root_key = [0u8; 32];
    let mut chain_key = [0u8; 32];
    root_key.copy_from_slice(&out[0..32]);
    chain_key.copy_from_slice(&out[32..64]);
    Ok((root_key, ChainKey { key: chain_key, index: 0 }))
}

#[allow(dead_code)]
const _ENSURE_MAC_TAG_LENGTH_USED: usize = MAC_TAG_LENGTH;

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_pair(tag: u8) -> Curve25519Pair {
        let random = [tag; 32];
        curve25519_generate(&random).unwrap()
    }

    #[test]
    fn round_trip_both_directions() {
        let shared_secret = [42u8; 32];
        let alice_ratchet = fresh_pair(1);
        let mut alice = Ratchet::init_alice(&shared_secret, alice_ratchet.clone()).unwrap();
        let mut bob = Ratchet::init_bob(&shared_secret, alice_ratchet.public).unwrap();

        let ciphertext = alice.encrypt(b"Hello, World", &[]).unwrap();
        let plaintext = bob.decrypt(&ciphertext).unwrap();
        assert_eq!(plaintext, b"Hello, World");

        let reply_random = [9u8; 32];
        let reply = bob.encrypt(b"Hi back", &reply_random).unwrap();
        let decrypted_reply = alice.decrypt(&reply).unwrap();
        assert_eq!(decrypted_reply, b"Hi back");
    }

    #[test]
    fn out_of_order_within_gap_all_decrypt_once() {
        let shared_secret = [1u8; 32];
        let alice_ratchet = fresh_pair(2);
        let mut alice = Ratchet::init_alice(&shared_secret, alice_ratchet.clone()).unwrap();
        let mut bob = Ratchet::init_bob(&shared_secret, alice_ratchet.public).unwrap();

        let m0 = alice.encrypt(b"zero", &[]).unwrap();
        let m1 = alice.encrypt(b"one", &[]).unwrap();
        let m2 = alice.encrypt(b"two", &[]).unwrap();

        assert_eq!(bob.decrypt(&m2).unwrap(), b"two");
        assert_eq!(bob.decrypt(&m0).unwrap(), b"zero");
        assert_eq!(bob.decrypt(&m1).unwrap(), b"one");

        assert_eq!(bob.decrypt(&m1).unwrap_err(), Error::BadMessageMac);
    }

    #[test]
    fn tampered_message_rejected() {
        let shared_secret = [3u8; 32];
        let alice_ratchet = fresh_pair(4);
        let mut alice = Ratchet::init_alice(&shared_secret, alice_ratchet.clone()).unwrap();
        let mut bob = Ratchet::init_bob(&shared_secret, alice_ratchet.public).unwrap();

        let mut ciphertext = alice.encrypt(b"tamper me", &[]).unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xFF;
        assert_eq!(bob.decrypt(&ciphertext).unwrap_err(), Error::BadMessageMac);
    }
}
