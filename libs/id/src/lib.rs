//! # cloudpool-id
//!
//! Typed identifiers for pools, machines and workloads.
//!
//! ## ID Format
//!
//! Every ID is a plain alphanumeric token (`[A-Za-z0-9]+`) so it can be
//! embedded verbatim in a location spec such as `cloud:env1:m7`.
//!
//! Host-assigned tokens are accepted as-is. IDs minted by this crate use
//! `{prefix}{ulid}` in lowercase:
//! - `pool01hv4z2wqxkjnm8gpqy6vbkc3d`
//! - `mach01hv4z3mxnkpqr9hstz7wcld4e`
//!
//! Generated IDs of one type sort by creation time.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;

/// Checks that `s` is a non-empty run of ASCII letters and digits.
pub fn validate_token(s: &str) -> Result<(), IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }

    match s.char_indices().find(|(_, c)| !c.is_ascii_alphanumeric()) {
        Some((position, found)) => Err(IdError::InvalidCharacter { position, found }),
        None => Ok(()),
    }
}
