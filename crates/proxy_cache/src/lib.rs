//! In-memory caches sitting in front of the content store and the upstream
//! index client.
//!
//! [`response`] is a bounded, byte-budgeted cache of pre-serialized HTTP
//! response bodies. [`index`] is an unbounded, TTL-only cache of parsed
//! index metadata. Both share the "lazy expiry on read, explicit
//! invalidation, promote-on-access" shape of `rattler_repodata_gateway`'s
//! `Expiring<T>` wrapper, generalized into a reusable map instead of a
//! single optional field.

pub mod index;
pub mod response;

pub use index::IndexMetadataCache;
pub use response::ResponseCache;
