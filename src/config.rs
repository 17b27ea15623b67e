//! Named tunables for the cache, journal and garbage collector.
//!
//! Grouped the way the teacher groups repository-format constants at module
//! scope (see `history.rs`'s schema version, `common.rs`'s `*_NAME`
//! constants) rather than threading magic numbers through call sites.

/// One mebibyte, used as the base unit for the size thresholds below.
pub const MEG: u64 = 1024 * 1024;

/// Above this resident content size a leaf node's contents should be split.
pub const DEFAULT_MAX_CONTENT_SIZE: u64 = MEG;

/// Above this many children an interior node should be split.
pub const DEFAULT_MAX_CHILDREN: usize = 256;

/// Journal size at or above which `Head::should_commit` returns `true`.
pub const DEFAULT_MAX_JOURNAL_SIZE: u64 = 16 * MEG;

/// Cache resident size at which garbage collection starts.
pub const DEFAULT_GC_THRESHOLD: u64 = 128 * MEG;

/// Cache resident size at which garbage collection stops.
pub const DEFAULT_GC_BOTTOM: u64 = 16 * MEG;

/// Length in bytes of a content digest (SHA-256 over ciphertext).
pub const DIGEST_LEN: usize = 32;

/// Directory holding per-branch append-only journals.
pub const JOURNALS_DIR: &str = "journals";

/// Directory holding mutable branch head references.
pub const REFS_DIR: &str = "refs";

/// Name of the mutable root pointer file within `refs/`.
pub const ROOT_REF_NAME: &str = "root";
