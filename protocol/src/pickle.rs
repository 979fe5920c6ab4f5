//! Pickle: a deterministic, versioned serialization of an
//! [`Account`], [`Session`], [`GroupSession`], or [`InboundGroupSession`], sealed under a
//! caller-supplied pickle key with the same authenticated cipher used everywhere else in
//! this crate.
//!
//! A pickle is `version(4 bytes, big-endian) ‖ ciphertext ‖ mac(8 bytes)`: the version is
//! authenticated (it's part of the MAC'd header) but not encrypted, so a reader can always
//! tell which migration path to take before attempting to decrypt. Every pickle this crate
//! *writes* uses the current version; the legacy readers below exist purely so an account
//! pickled by an older build of this library keeps unpickling correctly, mirroring the
//! reference implementation's own version-gated migration in `Account::unpickle`.

use crate::account::{Account, AccountPickleParts, OneTimeKeyRaw, PreKeyRaw};
use crate::cipher::PICKLE_CIPHER;
use crate::constants::{
    ACCOUNT_PICKLE_VERSION, GROUP_SESSION_ID_RANDOM_LENGTH, GROUP_SESSION_PICKLE_VERSION, MEGOLM_SEGMENTS,
    MEGOLM_SEGMENT_LENGTH, SESSION_PICKLE_VERSION, SIGNATURE_LENGTH,
};
use crate::errors::{Error, Result};
use crate::group::{GroupSession, GroupSessionPickleParts, InboundGroupSession, InboundGroupSessionPickleParts};
use crate::primitives::{PublicKey, Signature};
use crate::ratchet::Ratchet;
use crate::session::Session;

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Writer { buf: Vec::new() }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    fn option<T>(&mut self, v: &Option<T>, write: impl FnOnce(&mut Self, &T)) {
        self.bool(v.is_some());
        if let Some(inner) = v {
            write(self, inner);
        }
    }

    fn vec<T>(&mut self, v: &[T], write: impl Fn(&mut Self, &T)) {
        self.u32(v.len() as u32);
        for item in v {
            write(self, item);
        }
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < len {
            return Err(Error::CorruptedPickle);
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn bool(&mut self) -> Result<bool> {
        Ok(self.u8()? != 0)
    }

    fn array32(&mut self) -> Result<[u8; 32]> {
        Ok(self.take(32)?.try_into().unwrap())
    }

    fn option<T>(&mut self, read: impl FnOnce(&mut Self) -> Result<T>) -> Result<Option<T>> {
        if self.bool()? {
            Ok(Some(read(self)?))
        } else {
            Ok(None)
        }
    }

    fn vec<T>(&mut self, read: impl Fn(&mut Self) -> Result<T>) -> Result<Vec<T>> {
        let len = self.u32()? as usize;
        let mut out = Vec::with_capacity(len.min(1 << 20));
        for _ in 0..len {
            out.push(read(self)?);
        }
        Ok(out)
    }

    fn end(&self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(Error::CorruptedPickle);
        }
        Ok(())
    }
}

fn seal(version: u32, plaintext: &[u8], pickle_key: &[u8]) -> Vec<u8> {
    let header = version.to_be_bytes();
    let (ciphertext, tag) = PICKLE_CIPHER.encrypt(pickle_key, &header, plaintext).expect("HKDF output length is fixed and valid");
    let mut out = Vec::with_capacity(4 + ciphertext.len() + tag.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(&ciphertext);
    out.extend_from_slice(&tag);
    out
}

fn unseal(pickled: &[u8], pickle_key: &[u8]) -> Result<(u32, Vec<u8>)> {
    if pickled.len() < 4 + crate::constants::MAC_TAG_LENGTH {
        return Err(Error::CorruptedPickle);
    }
    let header = &pickled[0..4];
    let version = u32::from_be_bytes(header.try_into().unwrap());
    let body_end = pickled.len() - crate::constants::MAC_TAG_LENGTH;
    let ciphertext = &pickled[4..body_end];
    let mut tag = [0u8; crate::constants::MAC_TAG_LENGTH];
    tag.copy_from_slice(&pickled[body_end..]);

    let plaintext = PICKLE_CIPHER.decrypt(pickle_key, header, ciphertext, &tag).map_err(|_| Error::BadAccountKey)?;
    Ok((version, plaintext))
}

fn write_one_time_key(w: &mut Writer, key: &OneTimeKeyRaw) {
    w.u32(key.id);
    w.bool(key.published);
    w.bytes(&key.seed);
}

fn read_one_time_key(r: &mut Reader) -> Result<OneTimeKeyRaw> {
    let id = r.u32()?;
    let published = r.bool()?;
    let seed = r.array32()?;
    Ok(OneTimeKeyRaw { id, published, seed })
}

fn write_prekey(w: &mut Writer, key: &PreKeyRaw) {
    w.u32(key.id);
    w.bool(key.published);
    w.bytes(&key.seed);
    w.bytes(&key.signature.0);
    w.u64(key.publish_time);
}

fn read_prekey(r: &mut Reader) -> Result<PreKeyRaw> {
    let id = r.u32()?;
    let published = r.bool()?;
    let seed = r.array32()?;
    let signature = Signature(r.take(SIGNATURE_LENGTH)?.try_into().unwrap());
    let publish_time = r.u64()?;
    Ok(PreKeyRaw { id, published, seed, signature, publish_time })
}

/// Seals `account` under `pickle_key`, always in the current format.
pub fn pickle_account(account: &Account, pickle_key: &[u8]) -> Vec<u8> {
    let parts = account.pickle_parts();
    let mut w = Writer::new();
    w.bytes(&parts.identity_ed25519_seed);
    w.bytes(&parts.identity_curve25519_seed);
    w.u32(parts.one_time_keys.len() as u32);
    w.option(&parts.current_prekey, |w, k| write_prekey(w, k));
    w.option(&parts.prev_prekey, |w, k| write_prekey(w, k));
    w.u32(parts.next_key_id);
    w.u64(0); // last_prekey_publish_time: not separately tracked from the prekey's own field
    w.vec(&parts.one_time_keys, |w, k| write_one_time_key(w, k));
    w.option(&parts.current_fallback, |w, k| write_one_time_key(w, k));
    w.option(&parts.prev_fallback, |w, k| write_one_time_key(w, k));
    w.u32(parts.next_key_id);
    seal(ACCOUNT_PICKLE_VERSION, &w.finish(), pickle_key)
}

/// Unseals an account pickle, migrating legacy versions where the original field layout
/// requires it: version 1 carried a 32-byte (not 64-byte) Ed25519 private key and is
/// rejected outright;
/// versions 2 and 3 predate pre-key/X3DH support and never wrote those fields; version 2
/// predates fallback keys entirely; version 3 infers its fallback key count from their
/// `published` flags instead of writing a count. Unknown versions are rejected.
pub fn unpickle_account(pickled: &[u8], pickle_key: &[u8]) -> Result<Account> {
    let (version, plaintext) = unseal(pickled, pickle_key)?;
    let mut r = Reader::new(&plaintext);

    match version {
        1 => return Err(Error::BadLegacyAccountPickle),
        2 | 3 | 4 | ACCOUNT_PICKLE_VERSION => {}
        _ => return Err(Error::UnknownPickleVersion),
    }

    let identity_ed25519_seed = r.array32()?;
    let identity_curve25519_seed = r.array32()?;

    let (current_prekey, prev_prekey, next_key_id_from_prekeys) = if version >= ACCOUNT_PICKLE_VERSION {
        let num_prekeys = r.u32()?;
        if num_prekeys > 2 {
            return Err(Error::CorruptedPickle);
        }
        let current_prekey = if num_prekeys >= 1 { Some(read_prekey(&mut r)?) } else { None };
        let prev_prekey = if num_prekeys >= 2 { Some(read_prekey(&mut r)?) } else { None };
        let next_prekey_id = r.u32()?;
        let _last_prekey_publish_time = r.u64()?;
        (current_prekey, prev_prekey, next_prekey_id)
    } else {
        (None, None, 0)
    };

    let one_time_keys = r.vec(read_one_time_key)?;

    let (current_fallback, prev_fallback) = if version <= 2 {
        (None, None)
    } else if version == 3 {
        let current_fallback = read_one_time_key(&mut r)?;
        let prev_fallback = read_one_time_key(&mut r)?;
        let current = current_fallback.published.then_some(current_fallback);
        let prev = if current.is_some() && prev_fallback.published { Some(prev_fallback) } else { None };
        (current, prev)
    } else {
        let num_fallback_keys = r.u32()?;
        if num_fallback_keys > 2 {
            return Err(Error::CorruptedPickle);
        }
        let current_fallback = if num_fallback_keys >= 1 { Some(read_one_time_key(&mut r)?) } else { None };
        let prev_fallback = if num_fallback_keys >= 2 { Some(read_one_time_key(&mut r)?) } else { None };
        (current_fallback, prev_fallback)
    };

    let next_one_time_key_id = r.u32()?;
    r.end()?;

    let next_key_id = next_one_time_key_id.max(next_key_id_from_prekeys);

    Account::from_pickle_parts(AccountPickleParts {
        identity_ed25519_seed,
        identity_curve25519_seed,
        next_key_id,
        one_time_keys,
        current_prekey,
        prev_prekey,
        current_fallback,
        prev_fallback,
    })
}

/// Seals `session` under `pickle_key`.
pub fn pickle_session(session: &Session, pickle_key: &[u8]) -> Vec<u8> {
    let parts = session.raw_parts();
    let mut w = Writer::new();
    w.bool(parts.received_message);
    w.bytes(parts.alice_identity_key.as_bytes());
    w.bytes(parts.alice_base_key.as_bytes());
    w.bytes(parts.bob_one_time_key.as_bytes());
    w.bytes(parts.bob_prekey.as_bytes());
    w.bool(parts.used_one_time_key);
    write_ratchet(&mut w, parts.ratchet);
    seal(SESSION_PICKLE_VERSION, &w.finish(), pickle_key)
}

/// Unseals a session pickle. Only one version has ever existed.
pub fn unpickle_session(pickled: &[u8], pickle_key: &[u8]) -> Result<Session> {
    let (version, plaintext) = unseal(pickled, pickle_key)?;
    if version != SESSION_PICKLE_VERSION {
        return Err(Error::UnknownPickleVersion);
    }
    let mut r = Reader::new(&plaintext);

    let received_message = r.bool()?;
    let alice_identity_key = PublicKey::from_bytes(r.array32()?);
    let alice_base_key = PublicKey::from_bytes(r.array32()?);
    let bob_one_time_key = PublicKey::from_bytes(r.array32()?);
    let bob_prekey = PublicKey::from_bytes(r.array32()?);
    let used_one_time_key = r.bool()?;
    let ratchet = read_ratchet(&mut r)?;
    r.end()?;

    Ok(Session::from_raw_parts(received_message, alice_identity_key, alice_base_key, bob_one_time_key, bob_prekey, used_one_time_key, ratchet))
}

fn write_ratchet(w: &mut Writer, ratchet: &Ratchet) {
    let parts = ratchet.pickle_parts();
    w.bytes(parts.root_key);
    w.option(&parts.sender_chain, |w, (ratchet_key, chain_key, index)| {
        w.bytes(ratchet_key.public.as_bytes());
        w.bytes(ratchet_key.private.as_bytes());
        w.bytes(chain_key);
        w.u32(*index);
    });
    w.vec(&parts.receiver_chains, |w, (ratchet_key, chain_key, index)| {
        w.bytes(ratchet_key.as_bytes());
        w.bytes(chain_key);
        w.u32(*index);
    });
    w.vec(&parts.skipped_message_keys, |w, (ratchet_key, message_key, index)| {
        w.bytes(ratchet_key.as_bytes());
        w.bytes(message_key);
        w.u32(*index);
    });
}

fn read_ratchet(r: &mut Reader) -> Result<Ratchet> {
    let root_key = r.array32()?;
    let sender_chain = r.option(|r| {
        let public = PublicKey::from_bytes(r.array32()?);
        let private_seed = r.array32()?;
        let pair = crate::primitives::curve25519_generate(&private_seed)?;
        debug_assert_eq!(pair.public.as_bytes(), public.as_bytes());
        let chain_key = r.array32()?;
        let index = r.u32()?;
        Ok((pair, chain_key, index))
    })?;
    let receiver_chains = r.vec(|r| {
        let ratchet_key = PublicKey::from_bytes(r.array32()?);
        let chain_key = r.array32()?;
        let index = r.u32()?;
        Ok((ratchet_key, chain_key, index))
    })?;
    let skipped_message_keys = r.vec(|r| {
        let ratchet_key = PublicKey::from_bytes(r.array32()?);
        let message_key = r.array32()?;
        let index = r.u32()?;
        Ok((ratchet_key, message_key, index))
    })?;
    Ok(Ratchet::from_pickle_parts(root_key, sender_chain, receiver_chains, skipped_message_keys))
}

/// Seals an outbound group session.
pub fn pickle_group_session(session: &GroupSession, pickle_key: &[u8]) -> Vec<u8> {
    let parts = session.pickle_parts();
    let mut w = Writer::new();
    w.bytes(&parts.signing_key_seed);
    for segment in &parts.parts {
        w.bytes(segment);
    }
    w.u32(parts.counter);
    w.bytes(&parts.session_id);
    seal(GROUP_SESSION_PICKLE_VERSION, &w.finish(), pickle_key)
}

pub fn unpickle_group_session(pickled: &[u8], pickle_key: &[u8]) -> Result<GroupSession> {
    let (version, plaintext) = unseal(pickled, pickle_key)?;
    if version != GROUP_SESSION_PICKLE_VERSION {
        return Err(Error::UnknownPickleVersion);
    }
    let mut r = Reader::new(&plaintext);
    let signing_key_seed = r.array32()?;
    let mut parts = [[0u8; MEGOLM_SEGMENT_LENGTH]; MEGOLM_SEGMENTS];
    for segment in &mut parts {
        *segment = r.array32()?;
    }
    let counter = r.u32()?;
    let session_id_bytes = r.take(GROUP_SESSION_ID_RANDOM_LENGTH)?;
    let mut session_id = [0u8; GROUP_SESSION_ID_RANDOM_LENGTH];
    session_id.copy_from_slice(session_id_bytes);
    r.end()?;

    GroupSession::from_pickle_parts(GroupSessionPickleParts { signing_key_seed, parts, counter, session_id })
}

/// Seals an inbound group session.
pub fn pickle_inbound_group_session(session: &InboundGroupSession, pickle_key: &[u8]) -> Vec<u8> {
    let parts = session.pickle_parts();
    let mut w = Writer::new();
    w.bytes(&parts.signing_public);
    for segment in &parts.initial_parts {
        w.bytes(segment);
    }
    w.u32(parts.initial_counter);
    for segment in &parts.latest_parts {
        w.bytes(segment);
    }
    w.u32(parts.latest_counter);
    seal(GROUP_SESSION_PICKLE_VERSION, &w.finish(), pickle_key)
}

pub fn unpickle_inbound_group_session(pickled: &[u8], pickle_key: &[u8]) -> Result<InboundGroupSession> {
    let (version, plaintext) = unseal(pickled, pickle_key)?;
    if version != GROUP_SESSION_PICKLE_VERSION {
        return Err(Error::UnknownPickleVersion);
    }
    let mut r = Reader::new(&plaintext);
    let signing_public = r.array32()?;
    let mut initial_parts = [[0u8; MEGOLM_SEGMENT_LENGTH]; MEGOLM_SEGMENTS];
    for segment in &mut initial_parts {
        *segment = r.array32()?;
    }
    let initial_counter = r.u32()?;
    let mut latest_parts = [[0u8; MEGOLM_SEGMENT_LENGTH]; MEGOLM_SEGMENTS];
    for segment in &mut latest_parts {
        *segment = r.array32()?;
    }
    let latest_counter = r.u32()?;
    r.end()?;

    Ok(InboundGroupSession::from_pickle_parts(InboundGroupSessionPickleParts {
        signing_public,
        initial_parts,
        initial_counter,
        latest_parts,
        latest_counter,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_round_trips_through_pickle() {
        let mut account = Account::new(&[1u8; 96]).unwrap();
        account.generate_one_time_keys(3, &[2u8; 96]).unwrap();
        account.generate_fallback_key(&[3u8; 32]).unwrap();

        let pickle_key = b"correct horse battery staple";
        let pickled = pickle_account(&account, pickle_key);
        let restored = unpickle_account(&pickled, pickle_key).unwrap();

        assert_eq!(restored.identity_curve25519().as_bytes(), account.identity_curve25519().as_bytes());
        assert_eq!(restored.identity_ed25519(), account.identity_ed25519());
        assert_eq!(restored.one_time_keys_json(), account.one_time_keys_json());
    }

    #[test]
    fn account_pickle_rejects_wrong_key() {
        let account = Account::new(&[4u8; 96]).unwrap();
        let pickled = pickle_account(&account, b"right key");
        assert_eq!(unpickle_account(&pickled, b"wrong key").unwrap_err(), Error::BadAccountKey);
    }

    #[test]
    fn account_pickle_rejects_legacy_version_one() {
        let account = Account::new(&[5u8; 96]).unwrap();
        let mut pickled = pickle_account(&account, b"key");
        pickled[0..4].copy_from_slice(&1u32.to_be_bytes());
        // version 1 used a shorter plaintext layout than we just wrote, but the version
        // check must short-circuit before the mismatched field layout is ever parsed.
        assert_eq!(unpickle_account(&pickled, b"key").unwrap_err(), Error::BadLegacyAccountPickle);
    }

    #[test]
    fn session_round_trips_through_pickle() {
        let alice = Account::new(&[6u8; 96]).unwrap();
        let bob = Account::new(&[7u8; 96]).unwrap();
        let (bob_prekey_pub, bob_prekey_sig) = bob.current_prekey().unwrap();

        let mut session = Session::new_outbound_session(
            &alice,
            &[8u8; crate::session::NEW_OUTBOUND_SESSION_RANDOM_LENGTH],
            bob.identity_curve25519(),
            bob.identity_ed25519(),
            bob_prekey_pub,
            bob_prekey_sig,
            None,
        )
        .unwrap();
        let _ = session.encrypt(b"advance the ratchet a bit", &[]).unwrap();

        let pickle_key = b"session pickle key";
        let pickled = pickle_session(&session, pickle_key);
        let mut restored = unpickle_session(&pickled, pickle_key).unwrap();

        assert_eq!(restored.session_id().0, session.session_id().0);
        assert_eq!(restored.encrypt_message_type(), session.encrypt_message_type());
        let _ = restored.encrypt(b"still works after restore", &[9u8; 32]);
    }

    #[test]
    fn group_session_round_trips_through_pickle() {
        let mut outbound = GroupSession::new(&[1u8; crate::group::NEW_GROUP_SESSION_RANDOM_LENGTH]).unwrap();
        let _ = outbound.encrypt(b"first").unwrap();

        let pickle_key = b"group pickle key";
        let pickled = pickle_group_session(&outbound, pickle_key);
        let mut restored = unpickle_group_session(&pickled, pickle_key).unwrap();

        assert_eq!(restored.session_id(), outbound.session_id());
        assert_eq!(restored.message_index(), outbound.message_index());
        let _ = restored.encrypt(b"second").unwrap();
    }

    #[test]
    fn inbound_group_session_round_trips_through_pickle() {
        let mut outbound = GroupSession::new(&[2u8; crate::group::NEW_GROUP_SESSION_RANDOM_LENGTH]).unwrap();
        let (signing_public, parts, counter) = outbound.session_key_parts();
        let mut inbound = InboundGroupSession::new(signing_public, parts, counter);
        let framed = outbound.encrypt(b"hello").unwrap();
        inbound.decrypt(&framed).unwrap();

        let pickle_key = b"inbound pickle key";
        let pickled = pickle_inbound_group_session(&inbound, pickle_key);
        let mut restored = unpickle_inbound_group_session(&pickled, pickle_key).unwrap();

        assert_eq!(restored.first_known_index(), inbound.first_known_index());
        let framed2 = outbound.encrypt(b"world").unwrap();
        let (plaintext, _) = restored.decrypt(&framed2).unwrap();
        assert_eq!(plaintext, b"world");
    }
}
