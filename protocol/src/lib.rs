//! An end-to-end encrypted messaging protocol: a Double Ratchet session between
//! two parties, a Megolm-style ratchet for groups, and a pickle format for
//! persisting either across restarts.
//!
//! The crate speaks bytes in and bytes out. Transport framing, Base64 at the
//! outer edge, acquiring randomness, and wiring this into an application are
//! left to the caller; every function here that needs randomness takes it as
//! an explicit `&[u8]` argument rather than reaching for an RNG itself.
//!
//! - [`account`] — identity, one-time, signed-prekey, and fallback key management.
//! - [`session`] — the pairwise (3DH/4DH handshake + Double Ratchet) session.
//! - [`group`] — the Megolm group ratchet, for one-to-many encrypted rooms.
//! - [`pickle`] — authenticated serialization of accounts and sessions.
//! - [`ratchet`] — the Double Ratchet state machine underneath [`session`].
//! - [`codec`] — the wire format for framed messages.
//! - [`cipher`] — the HKDF-derived encrypt-then-MAC construction used throughout.
//! - [`primitives`] — thin wrappers over the underlying curves and hash functions.
//! - [`errors`] — the crate's single [`errors::Error`] type.

pub mod account;
pub mod cipher;
pub mod codec;
pub mod constants;
pub mod errors;
pub mod group;
pub mod pickle;
pub mod primitives;
pub mod ratchet;
pub mod session;

pub use account::Account;
pub use errors::{Error, Result};
pub use group::{GroupSession, InboundGroupSession};
pub use pickle::{
    pickle_account, pickle_group_session, pickle_inbound_group_session, pickle_session,
    unpickle_account, unpickle_group_session, unpickle_inbound_group_session, unpickle_session,
};
pub use session::{MessageType, Session};
