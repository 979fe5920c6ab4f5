//! Error types for the protocol crate.
//!
//! [`Error`] is the single error type returned by every public operation. Its variants
//! correspond one-to-one with the stable error identifiers of the protocol: callers that
//! match on a specific kind (e.g. to distinguish a bad MAC from an exhausted key pool)
//! get a contract that doesn't shift between releases.

use std::fmt::{Display, Formatter};

/// Stable error identifiers produced by every fallible operation in this crate.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Error {
    /// Caller-supplied randomness was shorter than the operation's declared requirement.
    NotEnoughRandom,
    /// Caller-supplied output buffer was shorter than the required length.
    OutputBufferTooSmall,
    /// The message's version byte was not the one this crate speaks.
    BadMessageVersion,
    /// The codec rejected the structure: missing field, length overrun, or bad wire type.
    BadMessageFormat,
    /// MAC mismatch, counter gap beyond the bound, or (for group messages) a bad signature.
    BadMessageMac,
    /// The message references a one-time key or pre-key the account doesn't know about,
    /// or an inbound identity mismatch.
    BadMessageKeyId,
    /// Base64 input was malformed at the outer decoding boundary.
    InvalidBase64,
    /// Pickle decryption failed: the supplied key does not match the one used to seal it.
    BadAccountKey,
    /// Pickle version byte is not one this crate can read or migrate.
    UnknownPickleVersion,
    /// Pickle is in a legacy shape this crate declines to migrate.
    BadLegacyAccountPickle,
    /// Pickle contents are internally inconsistent (truncated, trailing garbage, or a
    /// bookkeeping field implying a key slot that isn't present).
    CorruptedPickle,
    /// Ed25519 signature verification failed.
    BadSignature,
    /// A group message's chain index precedes the session's initial index.
    BadChainIndex,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Error::NotEnoughRandom => "not enough random bytes supplied",
            Error::OutputBufferTooSmall => "output buffer too small",
            Error::BadMessageVersion => "unsupported message version",
            Error::BadMessageFormat => "message could not be decoded",
            Error::BadMessageMac => "message authentication failed",
            Error::BadMessageKeyId => "message references an unknown key",
            Error::InvalidBase64 => "invalid base64 input",
            Error::BadAccountKey => "pickle key does not match",
            Error::UnknownPickleVersion => "unknown pickle version",
            Error::BadLegacyAccountPickle => "legacy account pickle is no longer supported",
            Error::CorruptedPickle => "pickle contents are corrupted",
            Error::BadSignature => "signature verification failed",
            Error::BadChainIndex => "group message index precedes the session's starting index",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

/// HKDF only ever fails when an output length is requested outside RFC 5869's bound; every
/// call site in this crate asks for a fixed, valid length, so this conversion exists for
/// type-checking at the `?` boundary rather than a path we expect to take.
impl From<hkdf::InvalidLength> for Error {
    fn from(_: hkdf::InvalidLength) -> Self {
        Error::BadMessageFormat
    }
}

impl From<ed25519_dalek::SignatureError> for Error {
    fn from(_: ed25519_dalek::SignatureError) -> Self {
        Error::BadSignature
    }
}

impl From<base64::DecodeError> for Error {
    fn from(_: base64::DecodeError) -> Self {
        Error::InvalidBase64
    }
}

pub type Result<T> = std::result::Result<T, Error>;
