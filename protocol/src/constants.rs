//! Fixed sizes, wire constants, and the policy knobs the protocol leaves as
//! bounded-but-tunable. Collected in one place so nothing is a magic number
//! scattered across the ratchet/session/account modules.

// byte size of a Curve25519 private key
pub(crate) const CURVE25519_SECRET_LENGTH: usize = 32;
// byte size of a Curve25519 public key
pub(crate) const CURVE25519_PUBLIC_LENGTH: usize = CURVE25519_SECRET_LENGTH;

// byte size of an Ed25519 signature
pub(crate) const SIGNATURE_LENGTH: usize = 64;
// byte size of a sha256 hash
pub(crate) const SHA256_HASH_LENGTH: usize = 32;
// byte size of an aes256 key
pub(crate) const AES256_KEY_LENGTH: usize = 32;
// byte size of an aes256-cbc IV
pub(crate) const AES256_IV_LENGTH: usize = 16;
// byte size of an hmac-sha256 mac key
pub(crate) const HMAC_KEY_LENGTH: usize = 32;
// truncated MAC tag length appended to every framed message
pub(crate) const MAC_TAG_LENGTH: usize = 8;

// wire format version byte every framed message starts with
pub(crate) const PROTOCOL_VERSION: u8 = 3;

// fixed HKDF info labels used by the authenticated cipher
pub(crate) const KDF_INFO_ROOT: &[u8] = b"OLM_ROOT";
pub(crate) const KDF_INFO_RATCHET: &[u8] = b"OLM_RATCHET";
pub(crate) const KDF_INFO_MESSAGE_KEYS: &[u8] = b"OLM_KEYS";
pub(crate) const KDF_INFO_PICKLE: &[u8] = b"Pickle";
pub(crate) const KDF_INFO_GROUP_MESSAGE_KEYS: &[u8] = b"MEGOLM_KEYS";

// chain-key advancement seeds
pub(crate) const MESSAGE_KEY_SEED: &[u8] = &[0x01];
pub(crate) const CHAIN_KEY_SEED: &[u8] = &[0x02];

// number of 32-byte segments in a Megolm ratchet and their combined length
pub(crate) const MEGOLM_SEGMENTS: usize = 4;
pub(crate) const MEGOLM_SEGMENT_LENGTH: usize = 32;
pub(crate) const MEGOLM_RATCHET_LENGTH: usize = MEGOLM_SEGMENTS * MEGOLM_SEGMENT_LENGTH;
// extra random bytes an outbound group session consumes to mint its session id,
// beyond the MEGOLM_RATCHET_LENGTH bytes needed for the four segments
pub(crate) const GROUP_SESSION_ID_RANDOM_LENGTH: usize = 4;

/// Maximum number of unused one-time keys an account retains.
pub const MAX_ONE_TIME_KEYS: usize = 100;

/// Maximum counter gap within a single receiver chain that a decrypt will bridge
/// by deriving intermediate message keys.
pub const MAX_MESSAGE_GAP: u64 = 2000;

/// Session-lifetime cap on the number of retained skipped message keys, independent
/// of the per-chain `MAX_MESSAGE_GAP` bound. Resolves the open retention-policy
/// question left unspecified upstream; oldest entries are evicted first.
pub const MAX_SKIPPED_MESSAGE_KEYS: usize = MAX_MESSAGE_GAP as usize * 4;

/// Current + previous pre-keys retained by an account.
pub const MAX_PREKEYS_RETAINED: usize = 2;
/// Current + previous fallback keys retained by an account.
pub const MAX_FALLBACK_KEYS_RETAINED: usize = 2;

/// Account pickle format version (matches the reference implementation's final format).
pub(crate) const ACCOUNT_PICKLE_VERSION: u32 = 10005;
/// Session pickle format version.
pub(crate) const SESSION_PICKLE_VERSION: u32 = 1;
/// Group session pickle format version (inbound and outbound share one scheme).
pub(crate) const GROUP_SESSION_PICKLE_VERSION: u32 = 1;
