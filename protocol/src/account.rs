//! Account: identity keys plus the bounded pools of one-time, pre-key, and fallback
//! keys an account publishes for others to start sessions with.
//!
//! Every key id — one-time or fallback — is drawn from one shared monotonic counter,
//! matching the reference account's single `next_one_time_key_id` source.

use log::{debug, info};

use crate::constants::{MAX_FALLBACK_KEYS_RETAINED, MAX_ONE_TIME_KEYS, MAX_PREKEYS_RETAINED};
use crate::errors::{Error, Result};
use crate::primitives::{curve25519_generate, ed25519_generate, ed25519_sign, ed25519_verify, Curve25519Pair, Ed25519Pair, PublicKey, Signature};

/// One slot in the one-time/fallback key pool.
struct OneTimeKey {
    id: u32,
    published: bool,
    key: Curve25519Pair,
}

/// The current (and previously rotated-out) signed pre-key.
struct PreKey {
    id: u32,
    published: bool,
    key: Curve25519Pair,
    signature: Signature,
    publish_time: u64,
}

/// An account's long-term identity and published key material.
pub struct Account {
    identity_ed25519: Ed25519Pair,
    identity_curve25519: Curve25519Pair,
    next_key_id: u32,
    one_time_keys: Vec<OneTimeKey>,
    current_prekey: Option<PreKey>,
    prev_prekey: Option<PreKey>,
    current_fallback: Option<OneTimeKey>,
    prev_fallback: Option<OneTimeKey>,
}

impl Account {
    /// `new_account(random[96])` — 32 bytes each for the Ed25519 identity key, the
    /// Curve25519 identity key, and the first pre-key, signed with the Ed25519 key.
    pub fn new(random: &[u8]) -> Result<Account> {
        if random.len() < 96 {
            return Err(Error::NotEnoughRandom);
        }
        let identity_ed25519 = ed25519_generate(&random[0..32])?;
        let identity_curve25519 = curve25519_generate(&random[32..64])?;
        let prekey_pair = curve25519_generate(&random[64..96])?;
        let signature = ed25519_sign(&identity_ed25519, prekey_pair.public.as_bytes());

        info!("created new account");
        Ok(Account {
            identity_ed25519,
            identity_curve25519,
            next_key_id: 1,
            one_time_keys: Vec::new(),
            current_prekey: Some(PreKey { id: 0, published: false, key: prekey_pair, signature, publish_time: 0 }),
            prev_prekey: None,
            current_fallback: None,
            prev_fallback: None,
        })
    }

    pub fn identity_curve25519(&self) -> &PublicKey {
        &self.identity_curve25519.public
    }

    pub fn identity_ed25519(&self) -> &[u8; 32] {
        &self.identity_ed25519.public
    }

    /// The identity key pair including its private scalar, for the DH computations
    /// [`crate::session`] performs when establishing a session against this account.
    pub(crate) fn identity_curve25519_pair(&self) -> &Curve25519Pair {
        &self.identity_curve25519
    }

    /// Looks up a one-time or fallback key pair (private scalar included) by its public
    /// half, mirroring [`Account::lookup_key`] but returning what [`crate::session`] needs
    /// to perform the DH itself.
    pub(crate) fn lookup_key_pair(&self, public: &PublicKey) -> Option<&Curve25519Pair> {
        self.one_time_keys
            .iter()
            .find(|k| k.key.public.ct_eq(public))
            .map(|k| &k.key)
            .or_else(|| self.current_fallback.as_ref().filter(|k| k.key.public.ct_eq(public)).map(|k| &k.key))
            .or_else(|| self.prev_fallback.as_ref().filter(|k| k.key.public.ct_eq(public)).map(|k| &k.key))
    }

    /// Looks up the current or previous pre-key pair (private scalar included) by its
    /// public half, mirroring [`Account::lookup_prekey`].
    pub(crate) fn lookup_prekey_pair(&self, public: &PublicKey) -> Option<&Curve25519Pair> {
        self.current_prekey
            .as_ref()
            .filter(|k| k.key.public.ct_eq(public))
            .map(|k| &k.key)
            .or_else(|| self.prev_prekey.as_ref().filter(|k| k.key.public.ct_eq(public)).map(|k| &k.key))
    }

    /// `sign(message) -> [u8;64]` — Ed25519 signature by the account identity key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        ed25519_sign(&self.identity_ed25519, message)
    }

    fn take_id(&mut self) -> u32 {
        let id = self.next_key_id;
        self.next_key_id += 1;
        id
    }

    /// `generate_one_time_keys(n, random)` — consumes `32·n` bytes; inserts at head;
    /// caps the pool at [`MAX_ONE_TIME_KEYS`].
    pub fn generate_one_time_keys(&mut self, count: usize, random: &[u8]) -> Result<()> {
        if random.len() < count * 32 {
            return Err(Error::NotEnoughRandom);
        }
        for i in 0..count {
            let key = curve25519_generate(&random[i * 32..(i + 1) * 32])?;
            let id = self.take_id();
            self.one_time_keys.insert(0, OneTimeKey { id, published: false, key });
        }
        while self.one_time_keys.len() > MAX_ONE_TIME_KEYS {
            self.one_time_keys.pop();
        }
        debug!("generated {} one-time keys, pool now {}", count, self.one_time_keys.len());
        Ok(())
    }

    /// `generate_prekey(random)` — rotates `prev_prekey ← current_prekey`, signs the new
    /// current pre-key with the identity Ed25519 key.
    pub fn generate_prekey(&mut self, random: &[u8]) -> Result<()> {
        let key = curve25519_generate(random)?;
        let signature = ed25519_sign(&self.identity_ed25519, key.public.as_bytes());
        let id = self.take_id();
        self.prev_prekey = self.current_prekey.take();
        self.current_prekey = Some(PreKey { id, published: false, key, signature, publish_time: 0 });
        info!("rotated pre-key, new id {}", id);
        Ok(())
    }

    /// `generate_fallback_key(random)` — rotates the previous fallback out.
    pub fn generate_fallback_key(&mut self, random: &[u8]) -> Result<()> {
        let key = curve25519_generate(random)?;
        let id = self.take_id();
        self.prev_fallback = self.current_fallback.take();
        self.current_fallback = Some(OneTimeKey { id, published: false, key });
        info!("rotated fallback key, new id {}", id);
        Ok(())
    }

    /// Flips `published` on all unpublished one-time keys and on the current fallback
    /// key; returns how many one-time keys were newly marked (the fallback key is not
    /// counted, matching the reference behavior).
    pub fn mark_keys_as_published(&mut self) -> usize {
        let mut count = 0;
        for key in &mut self.one_time_keys {
            if !key.published {
                key.published = true;
                count += 1;
            }
        }
        if let Some(prekey) = &mut self.current_prekey {
            prekey.published = true;
        }
        if let Some(fallback) = &mut self.current_fallback {
            fallback.published = true;
        }
        count
    }

    /// `lookup_key(pub)` — one-time pool, then current fallback, then previous fallback.
    pub fn lookup_key(&self, public: &PublicKey) -> Option<&PublicKey> {
        self.one_time_keys
            .iter()
            .find(|k| k.key.public.ct_eq(public))
            .map(|k| &k.key.public)
            .or_else(|| self.current_fallback.as_ref().filter(|k| k.key.public.ct_eq(public)).map(|k| &k.key.public))
            .or_else(|| self.prev_fallback.as_ref().filter(|k| k.key.public.ct_eq(public)).map(|k| &k.key.public))
    }

    /// `remove_key(pub)` — removes only from the one-time pool; returns the removed id.
    pub fn remove_key(&mut self, public: &PublicKey) -> Option<u32> {
        let pos = self.one_time_keys.iter().position(|k| k.key.public.ct_eq(public))?;
        Some(self.one_time_keys.remove(pos).id)
    }

    /// `lookup_prekey(pub)` — current or previous pre-key.
    pub fn lookup_prekey(&self, public: &PublicKey) -> Option<&PublicKey> {
        self.current_prekey
            .as_ref()
            .filter(|k| k.key.public.ct_eq(public))
            .map(|k| &k.key.public)
            .or_else(|| self.prev_prekey.as_ref().filter(|k| k.key.public.ct_eq(public)).map(|k| &k.key.public))
    }

    pub fn forget_old_prekey(&mut self) {
        self.prev_prekey = None;
    }

    pub fn forget_old_fallback_key(&mut self) {
        self.prev_fallback = None;
    }

    /// The current pre-key pair, its signature, and whether the peer requires an OTK
    /// (there are none left, so a fallback key would be substituted) — used by
    /// [`crate::session`] when building an outbound handshake against this account.
    pub fn current_prekey(&self) -> Option<(&PublicKey, &Signature)> {
        self.current_prekey.as_ref().map(|p| (&p.key.public, &p.signature))
    }

    /// The caller-supplied timestamp of the current pre-key's last publish, or `None`
    /// if no pre-key is current. The core has no wall clock of its own (§1/§5): a
    /// caller that cares about publish scheduling records it here explicitly via
    /// [`Account::set_prekey_publish_time`].
    pub fn prekey_publish_time(&self) -> Option<u64> {
        self.current_prekey.as_ref().map(|p| p.publish_time)
    }

    /// Records the last time the current pre-key was published, as reported by the
    /// caller (this core never reads a clock itself). A no-op if there is no current
    /// pre-key.
    pub fn set_prekey_publish_time(&mut self, publish_time: u64) {
        if let Some(prekey) = &mut self.current_prekey {
            prekey.publish_time = publish_time;
        }
    }

    pub fn verify_prekey_signature(identity_key: &[u8; 32], prekey_public: &PublicKey, signature: &Signature) -> bool {
        ed25519_verify(identity_key, prekey_public.as_bytes(), signature)
    }

    pub fn identity_keys_json(&self) -> String {
        format!(
            "{{\"curve25519\":\"{}\",\"ed25519\":\"{}\"}}",
            b64(self.identity_curve25519.public.as_bytes()),
            b64(&self.identity_ed25519.public)
        )
    }

    pub fn one_time_keys_json(&self) -> String {
        key_map_json(self.one_time_keys.iter().filter(|k| !k.published))
    }

    pub fn prekey_json(&self) -> String {
        key_map_json(self.current_prekey.iter())
    }

    pub fn unpublished_prekey_json(&self) -> String {
        key_map_json(self.current_prekey.iter().filter(|k| !k.published))
    }

    pub fn fallback_key_json(&self) -> String {
        key_map_json(self.current_fallback.iter())
    }

    pub fn unpublished_fallback_key_json(&self) -> String {
        key_map_json(self.current_fallback.iter().filter(|k| !k.published))
    }

    /// Flattens every field a pickle needs to serialize. Private key material is
    /// exposed as its raw seed bytes: [`crate::primitives::curve25519_generate`] and
    /// [`crate::primitives::ed25519_generate`] are deterministic, so re-deriving a pair
    /// from its stored seed on unpickle reconstructs it exactly without pickling the
    /// public half too.
    pub(crate) fn pickle_parts(&self) -> AccountPickleParts {
        AccountPickleParts {
            identity_ed25519_seed: self.identity_ed25519.private,
            identity_curve25519_seed: *self.identity_curve25519.private.as_bytes(),
            next_key_id: self.next_key_id,
            one_time_keys: self.one_time_keys.iter().map(OneTimeKey::to_raw).collect(),
            current_prekey: self.current_prekey.as_ref().map(PreKey::to_raw),
            prev_prekey: self.prev_prekey.as_ref().map(PreKey::to_raw),
            current_fallback: self.current_fallback.as_ref().map(OneTimeKey::to_raw),
            prev_fallback: self.prev_fallback.as_ref().map(OneTimeKey::to_raw),
        }
    }

    pub(crate) fn from_pickle_parts(parts: AccountPickleParts) -> Result<Account> {
        Ok(Account {
            identity_ed25519: ed25519_generate(&parts.identity_ed25519_seed)?,
            identity_curve25519: curve25519_generate(&parts.identity_curve25519_seed)?,
            next_key_id: parts.next_key_id,
            one_time_keys: parts.one_time_keys.iter().map(OneTimeKeyRaw::to_key).collect::<Result<_>>()?,
            current_prekey: parts.current_prekey.as_ref().map(PreKeyRaw::to_key).transpose()?,
            prev_prekey: parts.prev_prekey.as_ref().map(PreKeyRaw::to_key).transpose()?,
            current_fallback: parts.current_fallback.as_ref().map(OneTimeKeyRaw::to_key).transpose()?,
            prev_fallback: parts.prev_fallback.as_ref().map(OneTimeKeyRaw::to_key).transpose()?,
        })
    }
}

/// Plain-data view of a one-time or fallback key slot, for [`crate::pickle`].
pub(crate) struct OneTimeKeyRaw {
    pub id: u32,
    pub published: bool,
    pub seed: [u8; 32],
}

/// Plain-data view of a pre-key slot, for [`crate::pickle`].
pub(crate) struct PreKeyRaw {
    pub id: u32,
    pub published: bool,
    pub seed: [u8; 32],
    pub signature: Signature,
    pub publish_time: u64,
}

/// Every field [`crate::pickle`] needs to serialize an [`Account`].
pub(crate) struct AccountPickleParts {
    pub identity_ed25519_seed: [u8; 32],
    pub identity_curve25519_seed: [u8; 32],
    pub next_key_id: u32,
    pub one_time_keys: Vec<OneTimeKeyRaw>,
    pub current_prekey: Option<PreKeyRaw>,
    pub prev_prekey: Option<PreKeyRaw>,
    pub current_fallback: Option<OneTimeKeyRaw>,
    pub prev_fallback: Option<OneTimeKeyRaw>,
}

impl OneTimeKey {
    fn to_raw(&self) -> OneTimeKeyRaw {
        OneTimeKeyRaw { id: self.id, published: self.published, seed: *self.key.private.as_bytes() }
    }
}

impl OneTimeKeyRaw {
    fn to_key(&self) -> Result<OneTimeKey> {
        Ok(OneTimeKey { id: self.id, published: self.published, key: curve25519_generate(&self.seed)? })
    }
}

impl PreKey {
    fn to_raw(&self) -> PreKeyRaw {
        PreKeyRaw {
            id: self.id,
            published: self.published,
            seed: *self.key.private.as_bytes(),
            signature: self.signature,
            publish_time: self.publish_time,
        }
    }
}

impl PreKeyRaw {
    fn to_key(&self) -> Result<PreKey> {
        Ok(PreKey {
            id: self.id,
            published: self.published,
            key: curve25519_generate(&self.seed)?,
            signature: self.signature,
            publish_time: self.publish_time,
        })
    }
}

trait HasIdAndKey {
    fn id(&self) -> u32;
    fn public(&self) -> &PublicKey;
}

impl HasIdAndKey for OneTimeKey {
    fn id(&self) -> u32 {
        self.id
    }
    fn public(&self) -> &PublicKey {
        &self.key.public
    }
}

impl HasIdAndKey for PreKey {
    fn id(&self) -> u32 {
        self.id
    }
    fn public(&self) -> &PublicKey {
        &self.key.public
    }
}

fn key_map_json<'a, T: HasIdAndKey + 'a>(keys: impl Iterator<Item = &'a T>) -> String {
    let mut entries = Vec::new();
    for key in keys {
        entries.push(format!("\"{}\":\"{}\"", b64(&varint_id(key.id())), b64(key.public().as_bytes())));
    }
    format!("{{\"curve25519\":{{{}}}}}", entries.join(","))
}

fn varint_id(id: u32) -> Vec<u8> {
    let mut value = id as u64;
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
    out
}

fn b64(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD_NO_PAD.encode(bytes)
}

#[allow(dead_code)]
const _ENSURE_RETENTION_CAPS_USED: (usize, usize) = (MAX_PREKEYS_RETAINED, MAX_FALLBACK_KEYS_RETAINED);

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_account(tag: u8) -> Account {
        Account::new(&[tag; 96]).unwrap()
    }

    #[test]
    fn one_time_key_pool_caps_at_100() {
        let mut account = fresh_account(1);
        for batch in 0..5 {
            let random = vec![batch as u8 + 1; 32 * 30];
            account.generate_one_time_keys(30, &random).unwrap();
        }
        assert_eq!(account.one_time_keys.len(), MAX_ONE_TIME_KEYS);
    }

    #[test]
    fn lookup_and_remove_one_time_key() {
        let mut account = fresh_account(2);
        account.generate_one_time_keys(1, &[7u8; 32]).unwrap();
        let public = account.one_time_keys[0].key.public;

        assert!(account.lookup_key(&public).is_some());
        let removed_id = account.remove_key(&public).unwrap();
        assert_eq!(removed_id, account.next_key_id - 1);
        assert!(account.lookup_key(&public).is_none());
    }

    #[test]
    fn fallback_key_not_removed_by_remove_key() {
        let mut account = fresh_account(3);
        account.generate_fallback_key(&[8u8; 32]).unwrap();
        let public = account.current_fallback.as_ref().unwrap().key.public;

        assert!(account.lookup_key(&public).is_some());
        assert!(account.remove_key(&public).is_none());
        assert!(account.lookup_key(&public).is_some());
    }

    #[test]
    fn shared_id_counter_across_one_time_and_fallback_keys() {
        let mut account = fresh_account(4);
        account.generate_one_time_keys(1, &[1u8; 32]).unwrap();
        account.generate_fallback_key(&[2u8; 32]).unwrap();
        account.generate_one_time_keys(1, &[3u8; 32]).unwrap();

        let otk_ids: Vec<u32> = account.one_time_keys.iter().map(|k| k.id).collect();
        let fallback_id = account.current_fallback.as_ref().unwrap().id;
        assert!(!otk_ids.contains(&fallback_id));
        assert_ne!(otk_ids[0], otk_ids[1]);
    }

    #[test]
    fn prekey_signature_verifies() {
        let account = fresh_account(5);
        let (prekey_public, signature) = account.current_prekey().unwrap();
        assert!(Account::verify_prekey_signature(account.identity_ed25519(), prekey_public, signature));
    }

    #[test]
    fn mark_keys_as_published_counts_only_one_time_keys() {
        let mut account = fresh_account(6);
        account.generate_one_time_keys(3, &[9u8; 32 * 3]).unwrap();
        account.generate_fallback_key(&[5u8; 32]).unwrap();

        let count = account.mark_keys_as_published();
        assert_eq!(count, 3);
        assert_eq!(account.mark_keys_as_published(), 0);
    }

    #[test]
    fn prekey_publish_time_defaults_to_zero_and_is_caller_settable() {
        let mut account = fresh_account(7);
        assert_eq!(account.prekey_publish_time(), Some(0));

        account.set_prekey_publish_time(1_700_000_000);
        assert_eq!(account.prekey_publish_time(), Some(1_700_000_000));

        // rotating the pre-key resets the publish time for the new one
        account.generate_prekey(&[10u8; 32]).unwrap();
        assert_eq!(account.prekey_publish_time(), Some(0));
    }
}
