//! Pairwise session establishment: the X3DH-style handshake that
//! bootstraps a [`crate::ratchet::Ratchet`] between two accounts, plus the pre-key/message
//! framing a session needs until its first reply arrives.
//!
//! Mirrors the reference `session.cpp` triple/quadruple-DH handshake directly: Alice's
//! base key and her first ratchet key are two *separate* freshly generated Curve25519
//! pairs (not the same key reused), and the wire's mandatory "one-time key" field carries
//! the real one-time key when the peer published one, or a copy of the signed pre-key's
//! public half when it didn't — the optional `prekey` field is then included only in the
//! 4DH case, so its mere presence (rather than a same-key comparison) tells a receiver
//! which path to take.

use crate::account::Account;
use crate::codec::{decode_pairwise_message, decode_prekey_message, encode_prekey_message};
use crate::constants::CURVE25519_SECRET_LENGTH;
use crate::errors::{Error, Result};
use crate::primitives::{curve25519_dh, curve25519_generate, ed25519_verify, sha256, Curve25519Pair, PublicKey, Sha256Hash, Signature};
use crate::ratchet::Ratchet;

/// Which wire framing an encrypted message needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Carries the full X3DH handshake fields plus the first ratchet message.
    PreKey,
    /// A bare ratchet message; valid once a reply has been received.
    Message,
}

/// A live pairwise session: ratchet state plus the four handshake public keys a
/// `PreKey` message must keep re-sending until the peer replies.
pub struct Session {
    ratchet: Ratchet,
    received_message: bool,
    alice_identity_key: PublicKey,
    alice_base_key: PublicKey,
    bob_one_time_key: PublicKey,
    bob_prekey: PublicKey,
    used_one_time_key: bool,
}

/// Bytes of randomness [`new_outbound_session`] consumes: 32 for the base key, 32 for the
/// first ratchet key (two distinct keys, matching the reference).
pub const NEW_OUTBOUND_SESSION_RANDOM_LENGTH: usize = CURVE25519_SECRET_LENGTH * 2;

fn concat_dh(parts: &[[u8; 32]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(parts.len() * 32);
    for part in parts {
        out.extend_from_slice(part);
    }
    out
}

impl Session {
    /// Alice's half: builds a session against Bob's published identity key, signed
    /// pre-key (with its signature), and optional one-time key: 4DH when one was
    /// published, 3DH falling back to the signed pre-key in its place when not.
    pub fn new_outbound_session(
        account: &Account,
        random: &[u8],
        their_identity_key: &PublicKey,
        their_signing_key: &[u8; 32],
        their_prekey: &PublicKey,
        their_prekey_signature: &Signature,
        their_one_time_key: Option<&PublicKey>,
    ) -> Result<Session> {
        if random.len() < NEW_OUTBOUND_SESSION_RANDOM_LENGTH {
            return Err(Error::NotEnoughRandom);
        }
        if !ed25519_verify(their_signing_key, their_prekey.as_bytes(), their_prekey_signature) {
            return Err(Error::BadSignature);
        }

        let base_key = curve25519_generate(&random[..CURVE25519_SECRET_LENGTH])?;
        let ratchet_key = curve25519_generate(&random[CURVE25519_SECRET_LENGTH..NEW_OUTBOUND_SESSION_RANDOM_LENGTH])?;
        let identity_pair = account.identity_curve25519_pair().clone();

        let used_one_time_key = their_one_time_key.is_some();
        let bob_one_time_key = *their_one_time_key.unwrap_or(their_prekey);

        let mut dh = vec![
            curve25519_dh(&identity_pair.private, &bob_one_time_key),
            curve25519_dh(&base_key.private, their_identity_key),
            curve25519_dh(&base_key.private, &bob_one_time_key),
        ];
        if used_one_time_key {
            dh.push(curve25519_dh(&base_key.private, their_prekey));
        }
        let shared_secret = concat_dh(&dh);

        let ratchet = Ratchet::init_alice(&shared_secret, ratchet_key)?;

        Ok(Session {
            ratchet,
            received_message: false,
            alice_identity_key: identity_pair.public,
            alice_base_key: base_key.public,
            bob_one_time_key,
            bob_prekey: *their_prekey,
            used_one_time_key,
        })
    }

    /// Bob's half: consumes a `PreKey` message against `account`'s own published keys.
    /// Removes the one-time key from the pool when a real one was used.
    pub fn new_inbound_session(account: &mut Account, their_identity_key: Option<&PublicKey>, framed_prekey_message: &[u8]) -> Result<Session> {
        let message = decode_prekey_message(framed_prekey_message)?;
        let alice_identity_key = PublicKey::from_bytes(message.identity_key);
        if let Some(expected) = their_identity_key {
            if !expected.ct_eq(&alice_identity_key) {
                return Err(Error::BadMessageKeyId);
            }
        }
        let alice_base_key = PublicKey::from_bytes(message.base_key);
        let wire_one_time_key = PublicKey::from_bytes(message.one_time_key);

        let used_one_time_key = message.prekey.is_some();
        let wire_prekey = message.prekey.map(PublicKey::from_bytes).unwrap_or(wire_one_time_key);

        let our_prekey_pair = account.lookup_prekey_pair(&wire_prekey).cloned().ok_or(Error::BadMessageKeyId)?;
        let our_one_time_key_pair = if used_one_time_key {
            account.lookup_key_pair(&wire_one_time_key).cloned().ok_or(Error::BadMessageKeyId)?
        } else {
            our_prekey_pair.clone()
        };
        let identity_pair = account.identity_curve25519_pair().clone();

        let inner = decode_pairwise_message(message.inner_message)?;
        let alice_ratchet_key = PublicKey::from_bytes(inner.ratchet_key);

        let mut dh = vec![
            curve25519_dh(&our_one_time_key_pair.private, &alice_identity_key),
            curve25519_dh(&identity_pair.private, &alice_base_key),
            curve25519_dh(&our_one_time_key_pair.private, &alice_base_key),
        ];
        if used_one_time_key {
            dh.push(curve25519_dh(&our_prekey_pair.private, &alice_base_key));
        }
        let shared_secret = concat_dh(&dh);

        let ratchet = Ratchet::init_bob(&shared_secret, alice_ratchet_key)?;

        if used_one_time_key {
            account.remove_key(&wire_one_time_key);
        }

        Ok(Session {
            ratchet,
            received_message: false,
            alice_identity_key,
            alice_base_key,
            bob_one_time_key: wire_one_time_key,
            bob_prekey: wire_prekey,
            used_one_time_key,
        })
    }

    /// A stable identifier for this session: `SHA-256(alice_identity ‖ alice_base ‖
    /// bob_one_time_key ‖ bob_prekey)` — all four handshake keys, not three.
    pub fn session_id(&self) -> Sha256Hash {
        let mut buf = Vec::with_capacity(32 * 4);
        buf.extend_from_slice(self.alice_identity_key.as_bytes());
        buf.extend_from_slice(self.alice_base_key.as_bytes());
        buf.extend_from_slice(self.bob_one_time_key.as_bytes());
        buf.extend_from_slice(self.bob_prekey.as_bytes());
        Sha256Hash(sha256(&buf))
    }

    /// Whether the next outbound message must carry the full `PreKey` handshake framing,
    /// or can be sent as a bare ratchet `Message`: true until a reply arrives.
    pub fn encrypt_message_type(&self) -> MessageType {
        if self.received_message {
            MessageType::Message
        } else {
            MessageType::PreKey
        }
    }

    /// Encrypts `plaintext`, framing it as a `PreKey` message until a reply has been
    /// decrypted, after which it is a bare ratchet message. `random` is only
    /// consumed when the ratchet must mint a fresh sending chain.
    pub fn encrypt(&mut self, plaintext: &[u8], random: &[u8]) -> Result<Vec<u8>> {
        let inner = self.ratchet.encrypt(plaintext, random)?;
        if self.received_message {
            return Ok(inner);
        }
        let prekey_field = self.used_one_time_key.then_some(self.bob_prekey.as_bytes());
        Ok(encode_prekey_message(
            self.bob_one_time_key.as_bytes(),
            self.alice_base_key.as_bytes(),
            self.alice_identity_key.as_bytes(),
            &inner,
            prekey_field,
        ))
    }

    /// Decrypts a framed message of the given type. A successful decrypt
    /// marks the session as having received at least one reply.
    pub fn decrypt(&mut self, message_type: MessageType, framed: &[u8]) -> Result<Vec<u8>> {
        let body: &[u8] = match message_type {
            MessageType::Message => framed,
            MessageType::PreKey => decode_prekey_message(framed)?.inner_message,
        };
        let plaintext = self.ratchet.decrypt(body)?;
        self.received_message = true;
        Ok(plaintext)
    }

    /// Whether a `PreKey` message was the one that created this session — used to
    /// de-duplicate a resent handshake message against an already-established session.
    pub fn matches_inbound_session(&self, their_identity_key: Option<&PublicKey>, framed_prekey_message: &[u8]) -> Result<bool> {
        let message = decode_prekey_message(framed_prekey_message)?;
        let identity_key = PublicKey::from_bytes(message.identity_key);
        if let Some(expected) = their_identity_key {
            if !expected.ct_eq(&identity_key) {
                return Ok(false);
            }
        }
        if !identity_key.ct_eq(&self.alice_identity_key) {
            return Ok(false);
        }
        let base_key = PublicKey::from_bytes(message.base_key);
        if !base_key.ct_eq(&self.alice_base_key) {
            return Ok(false);
        }
        let one_time_key = PublicKey::from_bytes(message.one_time_key);
        Ok(one_time_key.ct_eq(&self.bob_one_time_key))
    }

    pub(crate) fn raw_parts(&self) -> SessionRawParts<'_> {
        SessionRawParts {
            received_message: self.received_message,
            alice_identity_key: &self.alice_identity_key,
            alice_base_key: &self.alice_base_key,
            bob_one_time_key: &self.bob_one_time_key,
            bob_prekey: &self.bob_prekey,
            used_one_time_key: self.used_one_time_key,
            ratchet: &self.ratchet,
        }
    }

    pub(crate) fn from_raw_parts(
        received_message: bool,
        alice_identity_key: PublicKey,
        alice_base_key: PublicKey,
        bob_one_time_key: PublicKey,
        bob_prekey: PublicKey,
        used_one_time_key: bool,
        ratchet: Ratchet,
    ) -> Session {
        Session {
            ratchet,
            received_message,
            alice_identity_key,
            alice_base_key,
            bob_one_time_key,
            bob_prekey,
            used_one_time_key,
        }
    }
}

pub(crate) struct SessionRawParts<'a> {
    pub received_message: bool,
    pub alice_identity_key: &'a PublicKey,
    pub alice_base_key: &'a PublicKey,
    pub bob_one_time_key: &'a PublicKey,
    pub bob_prekey: &'a PublicKey,
    pub used_one_time_key: bool,
    pub ratchet: &'a Ratchet,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_account(tag: u8) -> Account {
        Account::new(&[tag; 96]).unwrap()
    }

    #[test]
    fn loopback_pre_key_round_trip_with_one_time_key() {
        let alice = fresh_account(1);
        let mut bob = fresh_account(2);
        let otk_random = [9u8; 32];
        bob.generate_one_time_keys(1, &otk_random).unwrap();
        let bob_otk = crate::primitives::curve25519_generate(&otk_random).unwrap().public;

        let (bob_prekey_pub, bob_prekey_sig) = bob.current_prekey().unwrap();
        let mut alice_session = Session::new_outbound_session(
            &alice,
            &[3u8; NEW_OUTBOUND_SESSION_RANDOM_LENGTH],
            bob.identity_curve25519(),
            bob.identity_ed25519(),
            bob_prekey_pub,
            bob_prekey_sig,
            Some(&bob_otk),
        )
        .unwrap();

        assert_eq!(alice_session.encrypt_message_type(), MessageType::PreKey);
        let framed = alice_session.encrypt(b"hello bob", &[]).unwrap();

        let mut bob_session = Session::new_inbound_session(&mut bob, Some(alice.identity_curve25519()), &framed).unwrap();
        assert_eq!(bob_session.session_id().0, alice_session.session_id().0);

        let plaintext = bob_session.decrypt(MessageType::PreKey, &framed).unwrap();
        assert_eq!(plaintext, b"hello bob");
    }

    #[test]
    fn three_dh_fallback_when_no_one_time_key() {
        let alice = fresh_account(5);
        let mut bob = fresh_account(6);
        let (bob_prekey_pub, bob_prekey_sig) = bob.current_prekey().unwrap();

        let mut alice_session = Session::new_outbound_session(
            &alice,
            &[7u8; NEW_OUTBOUND_SESSION_RANDOM_LENGTH],
            bob.identity_curve25519(),
            bob.identity_ed25519(),
            bob_prekey_pub,
            bob_prekey_sig,
            None,
        )
        .unwrap();

        let framed = alice_session.encrypt(b"no otk needed", &[]).unwrap();
        let mut bob_session = Session::new_inbound_session(&mut bob, Some(alice.identity_curve25519()), &framed).unwrap();
        let plaintext = bob_session.decrypt(MessageType::PreKey, &framed).unwrap();
        assert_eq!(plaintext, b"no otk needed");
    }

    #[test]
    fn reply_switches_to_bare_message_type() {
        let alice = fresh_account(8);
        let mut bob = fresh_account(9);
        let (bob_prekey_pub, bob_prekey_sig) = bob.current_prekey().unwrap();

        let mut alice_session = Session::new_outbound_session(
            &alice,
            &[2u8; NEW_OUTBOUND_SESSION_RANDOM_LENGTH],
            bob.identity_curve25519(),
            bob.identity_ed25519(),
            bob_prekey_pub,
            bob_prekey_sig,
            None,
        )
        .unwrap();

        let first = alice_session.encrypt(b"first", &[]).unwrap();
        let mut bob_session = Session::new_inbound_session(&mut bob, Some(alice.identity_curve25519()), &first).unwrap();
        bob_session.decrypt(MessageType::PreKey, &first).unwrap();

        let reply_random = [4u8; 32];
        let reply = bob_session.encrypt(b"reply", &reply_random).unwrap();
        assert_eq!(bob_session.encrypt_message_type(), MessageType::Message);

        let plaintext = alice_session.decrypt(MessageType::Message, &reply).unwrap();
        assert_eq!(plaintext, b"reply");
        assert_eq!(alice_session.encrypt_message_type(), MessageType::Message);
    }

    #[test]
    fn replayed_pre_key_message_is_rejected_on_second_decrypt() {
        let alice = fresh_account(11);
        let mut bob = fresh_account(12);
        let (bob_prekey_pub, bob_prekey_sig) = bob.current_prekey().unwrap();

        let mut alice_session =
            Session::new_outbound_session(&alice, &[6u8; NEW_OUTBOUND_SESSION_RANDOM_LENGTH], bob.identity_curve25519(), bob.identity_ed25519(), bob_prekey_pub, bob_prekey_sig, None)
                .unwrap();
        let framed = alice_session.encrypt(b"once only", &[]).unwrap();

        let mut bob_session = Session::new_inbound_session(&mut bob, Some(alice.identity_curve25519()), &framed).unwrap();
        bob_session.decrypt(MessageType::PreKey, &framed).unwrap();
        assert_eq!(bob_session.decrypt(MessageType::PreKey, &framed).unwrap_err(), Error::BadMessageMac);
    }

    #[test]
    fn bad_prekey_signature_rejected() {
        let alice = fresh_account(13);
        let bob = fresh_account(14);
        let (bob_prekey_pub, mut bob_prekey_sig) = (*bob.current_prekey().unwrap().0, *bob.current_prekey().unwrap().1);
        bob_prekey_sig.0[0] ^= 0xFF;

        let err = Session::new_outbound_session(
            &alice,
            &[1u8; NEW_OUTBOUND_SESSION_RANDOM_LENGTH],
            bob.identity_curve25519(),
            bob.identity_ed25519(),
            &bob_prekey_pub,
            &bob_prekey_sig,
            None,
        )
        .unwrap_err();
        assert_eq!(err, Error::BadSignature);
    }
}
