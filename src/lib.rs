//! Core engine for an encrypted, content-addressed filesystem: a chunk
//! codec, an injectable filesystem abstraction, a typed object store, and a
//! node cache with branch/journal semantics on top.
//!
//! Layered leaves-first: [`codec`] and [`filename`]/[`varint`] have no
//! dependencies on the rest of the crate; [`schema`] builds the wire format
//! on top of [`varint`]; [`fs`] is a standalone trait; [`store`] combines
//! [`codec`], [`schema`] and [`fs`]; [`cache`] is the only module that knows
//! about tree topology and branch heads.

pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod filename;
pub mod fs;
pub mod schema;
pub mod store;
pub mod varint;

pub use cache::{Cache, CachedNode, Head};
pub use codec::{Chunk, Digest, FSInfo};
pub use error::{CoreError, CoreResult};
pub use schema::{Change, ChangeKind, Commit, Entry, Node};
