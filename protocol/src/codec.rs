//! Message codec: encode/decode the tagged varint wire format shared by pairwise
//! messages, pre-key messages, and group messages. No cryptography lives here.
//!
//! Wire grammar: all integers are base-128 varints; a tag byte is
//! `(field_number << 3) | wire_type` with wire types 0 (varint) and 2 (length-delimited)
//! in use. Unknown-tag skipping checks wire type with the parenthesized comparison
//! `(tag & 0x7) == 0` and rejects anything that isn't wire type 0 or 2 — an easy spot for
//! an operator-precedence slip (`tag & 0x7 == 0` parses as `tag & (0x7 == 0)`, always
//! true) that would otherwise silently accept every unknown wire type as skippable.

use crate::constants::{CURVE25519_PUBLIC_LENGTH, MAC_TAG_LENGTH, PROTOCOL_VERSION, SIGNATURE_LENGTH};
use crate::errors::{Error, Result};

const TAG_COUNTER: u8 = 0x08;
const TAG_RATCHET_KEY: u8 = 0x0A;
const TAG_CIPHERTEXT: u8 = 0x12;
const TAG_ONE_TIME_KEY: u8 = 0x0A;
const TAG_BASE_KEY: u8 = 0x12;
const TAG_IDENTITY_KEY: u8 = 0x1A;
const TAG_INNER_MESSAGE: u8 = 0x22;
const TAG_PREKEY_PUBLIC: u8 = 0x2A;
const TAG_CHAIN_INDEX: u8 = 0x08;

fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        len += 1;
        value >>= 7;
    }
    len
}

fn varint_encode(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push(((value & 0x7F) as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Reads one varint starting at `pos`, returning the value and the position just past it.
fn varint_decode(input: &[u8], pos: usize) -> Result<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    let mut i = pos;
    loop {
        if i >= input.len() {
            return Err(Error::BadMessageFormat);
        }
        let byte = input[i];
        i += 1;
        value |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i));
        }
        shift += 7;
        if shift >= 64 {
            return Err(Error::BadMessageFormat);
        }
    }
}

fn write_tagged_varint(out: &mut Vec<u8>, tag: u8, value: u64) {
    out.push(tag);
    varint_encode(out, value);
}

fn write_tagged_bytes(out: &mut Vec<u8>, tag: u8, bytes: &[u8]) {
    out.push(tag);
    varint_encode(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

/// One parsed field: either a varint value or a length-delimited byte range.
enum Field<'a> {
    Varint(u64),
    Bytes(&'a [u8]),
}

/// Scans the tagged body `input[pos..end]`, calling `on_field(tag, field)` for every tag
/// it finds. Unknown tags are skipped per the decoder contract above; anything else
/// aborts with `BadMessageFormat`.
fn scan_fields<'a>(input: &'a [u8], mut pos: usize, end: usize, mut on_field: impl FnMut(u8, Field<'a>)) -> Result<()> {
    while pos < end {
        let tag = input[pos];
        pos += 1;
        let wire_type = tag & 0x7;
        if wire_type == 0 {
            let (value, next) = varint_decode(input, pos)?;
            pos = next;
            on_field(tag, Field::Varint(value));
        } else if wire_type == 2 {
            let (len, next) = varint_decode(input, pos)?;
            let len = len as usize;
            if len > end.saturating_sub(next) {
                return Err(Error::BadMessageFormat);
            }
            on_field(tag, Field::Bytes(&input[next..next + len]));
            pos = next + len;
        } else {
            return Err(Error::BadMessageFormat);
        }
    }
    Ok(())
}

fn fixed32<'a>(field: Field<'a>) -> Result<&'a [u8; CURVE25519_PUBLIC_LENGTH]> {
    match field {
        Field::Bytes(b) if b.len() == CURVE25519_PUBLIC_LENGTH => {
            Ok(arrayref::array_ref![b, 0, CURVE25519_PUBLIC_LENGTH])
        }
        _ => Err(Error::BadMessageFormat),
    }
}

fn check_version(input: &[u8]) -> Result<usize> {
    if input.is_empty() {
        return Err(Error::BadMessageFormat);
    }
    if input[0] != PROTOCOL_VERSION {
        return Err(Error::BadMessageVersion);
    }
    Ok(1)
}

/// A decoded pairwise message.
pub struct PairwiseMessage<'a> {
    pub counter: u32,
    pub ratchet_key: [u8; CURVE25519_PUBLIC_LENGTH],
    pub ciphertext: &'a [u8],
    pub mac: [u8; MAC_TAG_LENGTH],
    /// The encoded body, excluding the trailing MAC — this is what the MAC covers.
    pub body: &'a [u8],
}

/// Builds everything a pairwise message frame contains up to (but excluding) the
/// ciphertext bytes themselves — useful when the ciphertext's length is known before its
/// contents are (as during encrypt, where AES-CBC's padded length is predictable from the
/// plaintext length). `header ‖ ciphertext` is exactly the framed body the MAC covers.
pub fn pairwise_message_header(counter: u32, ratchet_key: &[u8; CURVE25519_PUBLIC_LENGTH], ciphertext_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 1 + varint_len(counter as u64) + 1 + 1 + CURVE25519_PUBLIC_LENGTH + 1 + varint_len(ciphertext_len as u64));
    out.push(PROTOCOL_VERSION);
    write_tagged_varint(&mut out, TAG_COUNTER, counter as u64);
    write_tagged_bytes(&mut out, TAG_RATCHET_KEY, ratchet_key);
    out.push(TAG_CIPHERTEXT);
    varint_encode(&mut out, ciphertext_len as u64);
    out
}

pub fn encode_pairwise_message(counter: u32, ratchet_key: &[u8; CURVE25519_PUBLIC_LENGTH], ciphertext: &[u8]) -> Vec<u8> {
    let mut out = pairwise_message_header(counter, ratchet_key, ciphertext.len());
    out.extend_from_slice(ciphertext);
    out
}

pub fn decode_pairwise_message(input: &[u8]) -> Result<PairwiseMessage<'_>> {
    if input.len() < MAC_TAG_LENGTH {
        return Err(Error::BadMessageFormat);
    }
    let body_end = input.len() - MAC_TAG_LENGTH;
    let body = &input[..body_end];
    let pos = check_version(input)?;

    let mut counter: Option<u32> = None;
    let mut ratchet_key: Option<[u8; CURVE25519_PUBLIC_LENGTH]> = None;
    let mut ciphertext: Option<&[u8]> = None;

    scan_fields(input, pos, body_end, |tag, field| match tag {
        TAG_COUNTER => {
            if let Field::Varint(v) = field {
                counter = Some(v as u32);
            }
        }
        TAG_RATCHET_KEY => {
            if let Ok(b) = fixed32(field) {
                ratchet_key = Some(*b);
            }
        }
        TAG_CIPHERTEXT => {
            if let Field::Bytes(b) = field {
                ciphertext = Some(b);
            }
        }
        _ => {}
    })?;

    let (counter, ratchet_key, ciphertext) = match (counter, ratchet_key, ciphertext) {
        (Some(c), Some(r), Some(ct)) => (c, r, ct),
        _ => return Err(Error::BadMessageFormat),
    };

    let mut mac = [0u8; MAC_TAG_LENGTH];
    mac.copy_from_slice(&input[body_end..]);

    Ok(PairwiseMessage { counter, ratchet_key, ciphertext, mac, body })
}

/// A decoded pre-key message. `inner_message` is a complete pairwise message.
pub struct PreKeyMessage<'a> {
    pub one_time_key: [u8; CURVE25519_PUBLIC_LENGTH],
    pub base_key: [u8; CURVE25519_PUBLIC_LENGTH],
    pub identity_key: [u8; CURVE25519_PUBLIC_LENGTH],
    pub inner_message: &'a [u8],
    pub prekey: Option<[u8; CURVE25519_PUBLIC_LENGTH]>,
}

pub fn encode_prekey_message(
    one_time_key: &[u8; CURVE25519_PUBLIC_LENGTH],
    base_key: &[u8; CURVE25519_PUBLIC_LENGTH],
    identity_key: &[u8; CURVE25519_PUBLIC_LENGTH],
    inner_message: &[u8],
    prekey: Option<&[u8; CURVE25519_PUBLIC_LENGTH]>,
) -> Vec<u8> {
    let mut out = vec![PROTOCOL_VERSION];
    write_tagged_bytes(&mut out, TAG_ONE_TIME_KEY, one_time_key);
    write_tagged_bytes(&mut out, TAG_BASE_KEY, base_key);
    write_tagged_bytes(&mut out, TAG_IDENTITY_KEY, identity_key);
    write_tagged_bytes(&mut out, TAG_INNER_MESSAGE, inner_message);
    if let Some(pk) = prekey {
        write_tagged_bytes(&mut out, TAG_PREKEY_PUBLIC, pk);
    }
    out
}

pub fn decode_prekey_message(input: &[u8]) -> Result<PreKeyMessage<'_>> {
    let pos = check_version(input)?;

    let mut one_time_key: Option<[u8; CURVE25519_PUBLIC_LENGTH]> = None;
    let mut base_key: Option<[u8; CURVE25519_PUBLIC_LENGTH]> = None;
    let mut identity_key: Option<[u8; CURVE25519_PUBLIC_LENGTH]> = None;
    let mut inner_message: Option<&[u8]> = None;
    let mut prekey: Option<[u8; CURVE25519_PUBLIC_LENGTH]> = None;

    scan_fields(input, pos, input.len(), |tag, field| match tag {
        TAG_ONE_TIME_KEY => {
            if let Ok(b) = fixed32(field) {
                one_time_key = Some(*b);
            }
        }
        TAG_BASE_KEY => {
            if let Ok(b) = fixed32(field) {
                base_key = Some(*b);
            }
        }
        TAG_IDENTITY_KEY => {
            if let Ok(b) = fixed32(field) {
                identity_key = Some(*b);
            }
        }
        TAG_INNER_MESSAGE => {
            if let Field::Bytes(b) = field {
                inner_message = Some(b);
            }
        }
        TAG_PREKEY_PUBLIC => {
            if let Ok(b) = fixed32(field) {
                prekey = Some(*b);
            }
        }
        _ => {}
    })?;

    let (one_time_key, base_key, identity_key, inner_message) =
        match (one_time_key, base_key, identity_key, inner_message) {
            (Some(a), Some(b), Some(c), Some(d)) => (a, b, c, d),
            _ => return Err(Error::BadMessageFormat),
        };

    Ok(PreKeyMessage { one_time_key, base_key, identity_key, inner_message, prekey })
}

/// A decoded group message.
pub struct GroupMessage<'a> {
    pub chain_index: u32,
    pub ciphertext: &'a [u8],
    pub mac: [u8; MAC_TAG_LENGTH],
    pub signature: [u8; SIGNATURE_LENGTH],
    /// Everything from `version` through `mac` inclusive — what the signature covers.
    pub signed_part: &'a [u8],
    /// Everything from `version` through the body (excludes mac and signature) — what
    /// the MAC covers.
    pub body: &'a [u8],
}

/// Builds everything a group message frame contains up to (but excluding) the ciphertext
/// bytes, analogous to [`pairwise_message_header`].
pub fn group_message_header(chain_index: u32, ciphertext_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 1 + varint_len(chain_index as u64) + 1 + varint_len(ciphertext_len as u64));
    out.push(PROTOCOL_VERSION);
    write_tagged_varint(&mut out, TAG_CHAIN_INDEX, chain_index as u64);
    out.push(TAG_CIPHERTEXT);
    varint_encode(&mut out, ciphertext_len as u64);
    out
}

pub fn encode_group_message(chain_index: u32, ciphertext: &[u8]) -> Vec<u8> {
    let mut out = group_message_header(chain_index, ciphertext.len());
    out.extend_from_slice(ciphertext);
    out
}

pub fn decode_group_message(input: &[u8]) -> Result<GroupMessage<'_>> {
    if input.len() < MAC_TAG_LENGTH + SIGNATURE_LENGTH {
        return Err(Error::BadMessageFormat);
    }
    let signed_part_end = input.len() - SIGNATURE_LENGTH;
    let body_end = signed_part_end - MAC_TAG_LENGTH;
    let pos = check_version(input)?;

    let mut chain_index: Option<u32> = None;
    let mut ciphertext: Option<&[u8]> = None;

    scan_fields(input, pos, body_end, |tag, field| match tag {
        TAG_CHAIN_INDEX => {
            if let Field::Varint(v) = field {
                chain_index = Some(v as u32);
            }
        }
        TAG_CIPHERTEXT => {
            if let Field::Bytes(b) = field {
                ciphertext = Some(b);
            }
        }
        _ => {}
    })?;

    let (chain_index, ciphertext) = match (chain_index, ciphertext) {
        (Some(c), Some(ct)) => (c, ct),
        _ => return Err(Error::BadMessageFormat),
    };

    let mut mac = [0u8; MAC_TAG_LENGTH];
    mac.copy_from_slice(&input[body_end..signed_part_end]);
    let mut signature = [0u8; SIGNATURE_LENGTH];
    signature.copy_from_slice(&input[signed_part_end..]);

    Ok(GroupMessage {
        chain_index,
        ciphertext,
        mac,
        signature,
        signed_part: &input[..signed_part_end],
        body: &input[..body_end],
    })
}
