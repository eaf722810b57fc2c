//! # fleet-id
//!
//! Typed identifiers used across the fleet orchestrator.
//!
//! All IDs use a prefixed format: `{prefix}_{ulid}`
//!
//! - `boot_01HV4Z2WQXKJNM8GPQY6VBKC3D` identifies one launch of one agent
//!   process. A restart always mints a new boot ID, which lets recovery
//!   decisions be keyed to a specific process instance.
//! - `rec_01HV4Z3MXNKPQR9HSTZ7WCLD4E` identifies a hub record. The Central Hub
//!   deduplicates replayed records by this ID.
//! - `err_01HV4Z4NYPLTRS0JTUA8XDME5F` identifies an error bus event.
//!
//! ULIDs are time-ordered, so IDs of the same type sort by creation time.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

pub use ulid::Ulid;

#[doc(hidden)]
pub fn parse_prefixed(prefix: &'static str, s: &str) -> Result<Ulid, IdError> {
    let (actual, ulid) = s
        .split_once('_')
        .filter(|(p, u)| !p.is_empty() && !u.is_empty())
        .ok_or_else(|| IdError::Malformed(s.to_string()))?;
    if actual != prefix {
        return Err(IdError::WrongPrefix {
            expected: prefix,
            actual: actual.to_string(),
        });
    }
    ulid.parse().map_err(|e: ulid::DecodeError| IdError::InvalidUlid {
        input: s.to_string(),
        reason: e.to_string(),
    })
}
