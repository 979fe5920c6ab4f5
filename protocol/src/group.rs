//! Megolm-style group ratchet: a one-way, fast-forwardable chain
//! shared by every member of a group so a single sender can broadcast messages that any
//! member can decrypt and independently verify, without a pairwise session per recipient.
//!
//! The ratchet is four 32-byte segments. Segment `j` is rehashed every time segment `j+1`
//! wraps back to zero, mirroring a big-endian odometer: segment 3 turns every step,
//! segment 2 every 256 steps, segment 1 every 65536 steps, segment 0 every 16777216 steps.
//! `advance_to` exploits this to jump whole segments at once instead of re-hashing one
//! step at a time, so catching up to a chain index far in the future costs O(log n)
//! rehashes rather than O(n).

use ed25519_dalek::Signer;
use zeroize::Zeroize;

use crate::cipher::GROUP_MESSAGE_CIPHER;
use crate::codec::{decode_group_message, group_message_header};
use crate::constants::{
    GROUP_SESSION_ID_RANDOM_LENGTH, MAC_TAG_LENGTH, MEGOLM_RATCHET_LENGTH, MEGOLM_SEGMENTS, MEGOLM_SEGMENT_LENGTH,
};
use crate::errors::{Error, Result};
use crate::primitives::{aes_cbc_pkcs7_output_len, ed25519_generate, hmac_sha256, Ed25519Pair};

const SEEDS: [&[u8]; MEGOLM_SEGMENTS] = [&[0x00], &[0x01], &[0x02], &[0x03]];

/// How many chain-index steps segment `level` covers before it rehashes:
/// segment 3 covers one step, segment 2 covers 256, segment 1 covers 65536, segment 0
/// covers 16777216.
fn granularity(level: usize) -> u32 {
    1u32 << (8 * (MEGOLM_SEGMENTS - 1 - level))
}

/// The lowest segment level whose granularity divides `counter` — i.e. the segment that
/// must be rehashed to advance past `counter`. Segment 3 (granularity 1) always qualifies
/// as the fallback.
fn segment_to_rotate(counter: u32) -> usize {
    for level in 0..MEGOLM_SEGMENTS - 1 {
        if counter % granularity(level) == 0 {
            return level;
        }
    }
    MEGOLM_SEGMENTS - 1
}

/// The one-way Megolm ratchet: four chained 32-byte segments plus the chain index they
/// currently represent.
#[derive(Clone)]
pub struct Megolm {
    parts: [[u8; MEGOLM_SEGMENT_LENGTH]; MEGOLM_SEGMENTS],
    counter: u32,
}

impl Drop for Megolm {
    fn drop(&mut self) {
        for part in &mut self.parts {
            part.zeroize();
        }
    }
}

impl Megolm {
    /// Builds a ratchet from `MEGOLM_RATCHET_LENGTH` (128) bytes of randomness, starting
    /// at chain index 0.
    pub fn new(random: &[u8; MEGOLM_RATCHET_LENGTH]) -> Megolm {
        let mut parts = [[0u8; MEGOLM_SEGMENT_LENGTH]; MEGOLM_SEGMENTS];
        for (i, part) in parts.iter_mut().enumerate() {
            part.copy_from_slice(&random[i * MEGOLM_SEGMENT_LENGTH..(i + 1) * MEGOLM_SEGMENT_LENGTH]);
        }
        Megolm { parts, counter: 0 }
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Rehashes segment `level` from itself, then rederives every finer segment (`level+1`
    /// onward) from the newly rehashed value, exactly as the initial ratchet derives
    /// segment `j+1` from segment `j`.
    fn rotate_from(&mut self, level: usize) {
        self.parts[level] = hmac_sha256(&self.parts[level], SEEDS[level]);
        for j in level + 1..MEGOLM_SEGMENTS {
            self.parts[j] = hmac_sha256(&self.parts[level], SEEDS[j]);
        }
    }

    /// Advances the ratchet by exactly one chain-index step.
    pub fn advance(&mut self) {
        let level = segment_to_rotate(self.counter + 1);
        self.rotate_from(level);
        self.counter += 1;
    }

    /// Fast-forwards to `target`, re-hashing whole segments at a time wherever the gap is
    /// large enough to skip ahead safely, falling back to single steps only for the
    /// remainder. No-op if `target <= self.counter`.
    pub fn advance_to(&mut self, target: u32) {
        while self.counter < target {
            let remaining = target - self.counter;
            let mut jumped = false;
            for level in 0..MEGOLM_SEGMENTS {
                let step = granularity(level);
                if self.counter % step == 0 && remaining >= step {
                    self.rotate_from(level);
                    self.counter += step;
                    jumped = true;
                    break;
                }
            }
            if !jumped {
                self.advance();
            }
        }
    }

    /// Derives the message key for the ratchet's *current* chain index: `HMAC(parts[3],
    /// 0x01)` truncated to an AES key, matching the pairwise ratchet's message-key seed
    /// convention but with the single finest segment standing in for a sender chain key.
    fn message_key(&self) -> [u8; 32] {
        hmac_sha256(&self.parts[MEGOLM_SEGMENTS - 1], crate::constants::MESSAGE_KEY_SEED)
    }

    pub(crate) fn pickle_parts(&self) -> (&[[u8; MEGOLM_SEGMENT_LENGTH]; MEGOLM_SEGMENTS], u32) {
        (&self.parts, self.counter)
    }

    pub(crate) fn from_pickle_parts(parts: [[u8; MEGOLM_SEGMENT_LENGTH]; MEGOLM_SEGMENTS], counter: u32) -> Megolm {
        Megolm { parts, counter }
    }
}

/// Bytes of randomness [`GroupSession::new`] consumes: the ratchet, a 32-byte Ed25519
/// signing seed, and a few bytes to mint a human-distinguishable session id.
pub const NEW_GROUP_SESSION_RANDOM_LENGTH: usize = MEGOLM_RATCHET_LENGTH + 32 + GROUP_SESSION_ID_RANDOM_LENGTH;

/// The sending half of a group: owns the only copy of the signing key and the ratchet's
/// forward-only advance.
pub struct GroupSession {
    ratchet: Megolm,
    signing_key: Ed25519Pair,
    session_id: [u8; GROUP_SESSION_ID_RANDOM_LENGTH],
}

impl GroupSession {
    /// `random` supplies [`MEGOLM_RATCHET_LENGTH`] bytes for the ratchet, a 32-byte Ed25519
    /// seed for the signing key, and [`GROUP_SESSION_ID_RANDOM_LENGTH`] further bytes for
    /// the session id, which is opaque randomness rather than anything derived.
    pub fn new(random: &[u8]) -> Result<GroupSession> {
        let needed = MEGOLM_RATCHET_LENGTH + 32 + GROUP_SESSION_ID_RANDOM_LENGTH;
        if random.len() < needed {
            return Err(Error::NotEnoughRandom);
        }
        let ratchet_random: &[u8; MEGOLM_RATCHET_LENGTH] = arrayref::array_ref![random, 0, MEGOLM_RATCHET_LENGTH];
        let ratchet = Megolm::new(ratchet_random);
        let signing_key = ed25519_generate(&random[MEGOLM_RATCHET_LENGTH..MEGOLM_RATCHET_LENGTH + 32])?;
        let mut session_id = [0u8; GROUP_SESSION_ID_RANDOM_LENGTH];
        session_id.copy_from_slice(&random[MEGOLM_RATCHET_LENGTH + 32..needed]);

        Ok(GroupSession { ratchet, signing_key, session_id })
    }

    /// An opaque identifier for the group, stable for the session's lifetime.
    pub fn session_id(&self) -> &[u8; GROUP_SESSION_ID_RANDOM_LENGTH] {
        &self.session_id
    }

    /// The current chain index — what a new member would need, alongside the exported
    /// key material, to start decrypting from this point forward.
    pub fn message_index(&self) -> u32 {
        self.ratchet.counter()
    }

    /// The Ed25519 public key members must trust in order to verify this session's
    /// messages, and the ratchet state at the current index — together what a fresh
    /// [`InboundGroupSession`] needs to start decrypting from here forward.
    pub fn session_key_parts(&self) -> ([u8; 32], [[u8; MEGOLM_SEGMENT_LENGTH]; MEGOLM_SEGMENTS], u32) {
        (self.signing_key.public, self.ratchet.parts, self.ratchet.counter)
    }

    /// Encrypts `plaintext`, advancing the ratchet afterward so the key just used can
    /// never be recovered from the session's current state.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let message_key = self.ratchet.message_key();
        let chain_index = self.ratchet.counter();

        let ciphertext_len = aes_cbc_pkcs7_output_len(plaintext.len());
        let header = group_message_header(chain_index, ciphertext_len);
        let (ciphertext, tag) = GROUP_MESSAGE_CIPHER.encrypt(&message_key, &header, plaintext)?;

        let mut signed_part = header;
        signed_part.extend_from_slice(&ciphertext);
        signed_part.extend_from_slice(&tag);
        let signature = {
            use ed25519_dalek::SigningKey;
            SigningKey::from_bytes(&self.signing_key.private).sign(&signed_part)
        };

        let mut framed = signed_part;
        framed.extend_from_slice(&signature.to_bytes());

        self.ratchet.advance();
        Ok(framed)
    }

    pub(crate) fn pickle_parts(&self) -> GroupSessionPickleParts {
        GroupSessionPickleParts {
            signing_key_seed: self.signing_key.private,
            parts: self.ratchet.parts,
            counter: self.ratchet.counter,
            session_id: self.session_id,
        }
    }

    pub(crate) fn from_pickle_parts(parts: GroupSessionPickleParts) -> Result<GroupSession> {
        Ok(GroupSession {
            ratchet: Megolm::from_pickle_parts(parts.parts, parts.counter),
            signing_key: ed25519_generate(&parts.signing_key_seed)?,
            session_id: parts.session_id,
        })
    }
}

pub(crate) struct GroupSessionPickleParts {
    pub signing_key_seed: [u8; 32],
    pub parts: [[u8; MEGOLM_SEGMENT_LENGTH]; MEGOLM_SEGMENTS],
    pub counter: u32,
    pub session_id: [u8; GROUP_SESSION_ID_RANDOM_LENGTH],
}

/// The receiving half of a group: the ratchet state at the point the member joined
/// (`initial_ratchet`, kept so the member can always re-derive any earlier index up to
/// where they joined) plus the furthest state reached so far (`latest_ratchet`, advanced
/// forward as messages arrive, never rewound).
pub struct InboundGroupSession {
    initial_ratchet: Megolm,
    latest_ratchet: Megolm,
    signing_public: [u8; 32],
}

impl InboundGroupSession {
    /// Imports a session from an exported session key: the signing public key, the
    /// ratchet state at `first_known_index`, and that index itself.
    pub fn new(signing_public: [u8; 32], ratchet_parts: [[u8; MEGOLM_SEGMENT_LENGTH]; MEGOLM_SEGMENTS], first_known_index: u32) -> InboundGroupSession {
        let ratchet = Megolm::from_pickle_parts(ratchet_parts, first_known_index);
        InboundGroupSession {
            initial_ratchet: ratchet.clone(),
            latest_ratchet: ratchet,
            signing_public,
        }
    }

    /// The earliest chain index this session can decrypt.
    pub fn first_known_index(&self) -> u32 {
        self.initial_ratchet.counter()
    }

    /// Verifies the Ed25519 signature first, so a forged sender is rejected before
    /// any ratchet work happens, then picks whichever of `latest`/`initial` is closer to
    /// the message's index without exceeding it, fast-forwards a scratch copy, verifies
    /// the MAC, and — only when the fast-forward started from `latest` — commits the
    /// advanced scratch copy back as the new `latest` (messages decrypted by rewinding
    /// from `latest` to an earlier, already-reachable index never move `latest` backward).
    pub fn decrypt(&mut self, framed: &[u8]) -> Result<(Vec<u8>, u32)> {
        let message = decode_group_message(framed)?;
        let verifying_key = ed25519_dalek::VerifyingKey::from_bytes(&self.signing_public).map_err(|_| Error::BadSignature)?;
        let signature = ed25519_dalek::Signature::from_bytes(&message.signature);
        if verifying_key.verify_strict(message.signed_part, &signature).is_err() {
            return Err(Error::BadSignature);
        }

        if message.chain_index < self.initial_ratchet.counter() {
            return Err(Error::BadChainIndex);
        }

        let use_latest = self.latest_ratchet.counter() <= message.chain_index;
        let mut working = if use_latest { self.latest_ratchet.clone() } else { self.initial_ratchet.clone() };
        working.advance_to(message.chain_index);

        let message_key = working.message_key();
        let header = &message.body[..message.body.len() - message.ciphertext.len()];
        let plaintext = GROUP_MESSAGE_CIPHER.decrypt(&message_key, header, message.ciphertext, &message.mac)?;

        if use_latest {
            self.latest_ratchet = working;
        }

        Ok((plaintext, message.chain_index))
    }

    pub(crate) fn pickle_parts(&self) -> InboundGroupSessionPickleParts {
        InboundGroupSessionPickleParts {
            signing_public: self.signing_public,
            initial_parts: self.initial_ratchet.parts,
            initial_counter: self.initial_ratchet.counter,
            latest_parts: self.latest_ratchet.parts,
            latest_counter: self.latest_ratchet.counter,
        }
    }

    pub(crate) fn from_pickle_parts(parts: InboundGroupSessionPickleParts) -> InboundGroupSession {
        InboundGroupSession {
            initial_ratchet: Megolm::from_pickle_parts(parts.initial_parts, parts.initial_counter),
            latest_ratchet: Megolm::from_pickle_parts(parts.latest_parts, parts.latest_counter),
            signing_public: parts.signing_public,
        }
    }
}

pub(crate) struct InboundGroupSessionPickleParts {
    pub signing_public: [u8; 32],
    pub initial_parts: [[u8; MEGOLM_SEGMENT_LENGTH]; MEGOLM_SEGMENTS],
    pub initial_counter: u32,
    pub latest_parts: [[u8; MEGOLM_SEGMENT_LENGTH]; MEGOLM_SEGMENTS],
    pub latest_counter: u32,
}

#[allow(dead_code)]
const _ENSURE_MAC_TAG_LENGTH_USED: usize = MAC_TAG_LENGTH;

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_session(tag: u8) -> GroupSession {
        let random = vec![tag; NEW_GROUP_SESSION_RANDOM_LENGTH];
        GroupSession::new(&random).unwrap()
    }

    fn inbound_from(outbound: &GroupSession) -> InboundGroupSession {
        let (signing_public, parts, counter) = outbound.session_key_parts();
        InboundGroupSession::new(signing_public, parts, counter)
    }

    #[test]
    fn sequential_messages_decrypt_in_order() {
        let mut outbound = fresh_session(1);
        let mut inbound = inbound_from(&outbound);

        for i in 0..5u32 {
            let framed = outbound.encrypt(format!("message {i}").as_bytes()).unwrap();
            let (plaintext, index) = inbound.decrypt(&framed).unwrap();
            assert_eq!(plaintext, format!("message {i}").as_bytes());
            assert_eq!(index, i);
        }
    }

    #[test]
    fn catch_up_across_a_large_gap_without_intermediate_messages() {
        let mut outbound = fresh_session(2);
        let inbound_session_key = outbound.session_key_parts();

        for _ in 0..300 {
            outbound.encrypt(b"skipped").unwrap();
        }
        let framed = outbound.encrypt(b"caught up").unwrap();

        let mut inbound = InboundGroupSession::new(inbound_session_key.0, inbound_session_key.1, inbound_session_key.2);
        let (plaintext, index) = inbound.decrypt(&framed).unwrap();
        assert_eq!(plaintext, b"caught up");
        assert_eq!(index, 300);
    }

    #[test]
    fn out_of_order_within_known_range_both_decrypt() {
        let mut outbound = fresh_session(3);
        let mut inbound = inbound_from(&outbound);

        let m0 = outbound.encrypt(b"zero").unwrap();
        let m1 = outbound.encrypt(b"one").unwrap();

        let (plaintext1, _) = inbound.decrypt(&m1).unwrap();
        assert_eq!(plaintext1, b"one");
        let (plaintext0, _) = inbound.decrypt(&m0).unwrap();
        assert_eq!(plaintext0, b"zero");
    }

    #[test]
    fn message_before_first_known_index_rejected() {
        let mut outbound = fresh_session(4);
        let m0 = outbound.encrypt(b"zero").unwrap();
        let _m1 = outbound.encrypt(b"one").unwrap();
        let later = outbound.session_key_parts();

        let mut inbound = InboundGroupSession::new(later.0, later.1, later.2);
        assert_eq!(inbound.decrypt(&m0).unwrap_err(), Error::BadChainIndex);
    }

    #[test]
    fn tampered_ciphertext_fails_signature_or_mac() {
        let mut outbound = fresh_session(5);
        let mut inbound = inbound_from(&outbound);

        let mut framed = outbound.encrypt(b"tamper").unwrap();
        let last = framed.len() - 1;
        framed[last] ^= 0xFF;
        assert_eq!(inbound.decrypt(&framed).unwrap_err(), Error::BadSignature);
    }

    #[test]
    fn forged_signature_rejected() {
        let mut outbound = fresh_session(6);
        let mut imposter = fresh_session(7);
        let mut inbound = inbound_from(&outbound);

        let mut framed = outbound.encrypt(b"hi").unwrap();
        let imposter_framed = imposter.encrypt(b"hi").unwrap();

        let sig_len = crate::constants::SIGNATURE_LENGTH;
        let sig_start = framed.len() - sig_len;
        let imposter_sig_start = imposter_framed.len() - sig_len;
        framed[sig_start..].copy_from_slice(&imposter_framed[imposter_sig_start..]);

        assert_eq!(inbound.decrypt(&framed).unwrap_err(), Error::BadSignature);
    }

    #[test]
    fn granularity_schedule_matches_byte_boundaries() {
        assert_eq!(granularity(0), 1 << 24);
        assert_eq!(granularity(1), 1 << 16);
        assert_eq!(granularity(2), 1 << 8);
        assert_eq!(granularity(3), 1);
    }

    #[test]
    fn segment_to_rotate_picks_coarsest_safe_level() {
        assert_eq!(segment_to_rotate(0), 0);
        assert_eq!(segment_to_rotate(256), 2);
        assert_eq!(segment_to_rotate(65536), 1);
        assert_eq!(segment_to_rotate(1), 3);
    }
}
