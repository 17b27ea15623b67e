//! Canonical binary schema for `Node`, `Entry`, `Commit` and `Change`.
//!
//! The wire form is a small hand-rolled tag-length encoding modeled on the
//! original implementation's protobuf schema (`field_tag = (field_number <<
//! 3) | wire_type`, varint integers, length-prefixed bytes/strings/embedded
//! messages), without depending on a `protoc` toolchain at build time. Fields
//! are always written in ascending tag order and omitted entirely when
//! unset, so two calls encoding the same logical value always produce
//! identical bytes — the property content-addressing depends on.

use crate::config::DIGEST_LEN;
use crate::error::{CoreError, CoreResult};
use crate::varint;

const WIRE_VARINT: u64 = 0;
const WIRE_BYTES: u64 = 2;

fn write_tag(out: &mut Vec<u8>, field: u64, wire_type: u64) {
    varint::encode((field << 3) | wire_type, out);
}

fn write_varint_field(out: &mut Vec<u8>, field: u64, value: u64) {
    write_tag(out, field, WIRE_VARINT);
    varint::encode(value, out);
}

fn write_bytes_field(out: &mut Vec<u8>, field: u64, bytes: &[u8]) {
    write_tag(out, field, WIRE_BYTES);
    varint::encode(bytes.len() as u64, out);
    out.extend_from_slice(bytes);
}

struct TaggedReader<'a> {
    data: &'a [u8],
    pos: usize,
}

enum Field<'a> {
    Varint(u64),
    Bytes(&'a [u8]),
}

impl<'a> TaggedReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn next(&mut self) -> CoreResult<Option<(u64, Field<'a>)>> {
        if self.pos >= self.data.len() {
            return Ok(None);
        }
        let mut cursor = std::io::Cursor::new(&self.data[self.pos..]);
        let tag = varint::decode(&mut cursor)?;
        let consumed = cursor.position() as usize;
        self.pos += consumed;
        let field = tag >> 3;
        let wire_type = tag & 0x7;
        match wire_type {
            WIRE_VARINT => {
                let mut cursor = std::io::Cursor::new(&self.data[self.pos..]);
                let value = varint::decode(&mut cursor)?;
                self.pos += cursor.position() as usize;
                Ok(Some((field, Field::Varint(value))))
            }
            WIRE_BYTES => {
                let mut cursor = std::io::Cursor::new(&self.data[self.pos..]);
                let len = varint::decode(&mut cursor)? as usize;
                self.pos += cursor.position() as usize;
                if self.pos + len > self.data.len() {
                    return Err(CoreError::Decoding("length-delimited field overruns buffer".into()));
                }
                let bytes = &self.data[self.pos..self.pos + len];
                self.pos += len;
                Ok(Some((field, Field::Bytes(bytes))))
            }
            other => Err(CoreError::Decoding(format!("unknown wire type {other}"))),
        }
    }
}

fn read_digest(bytes: &[u8]) -> CoreResult<[u8; DIGEST_LEN]> {
    bytes
        .try_into()
        .map_err(|_| CoreError::Decoding(format!("expected {DIGEST_LEN}-byte digest, got {} bytes", bytes.len())))
}

/// One child reference embedded in a [`Node`]'s `children`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Entry {
    /// Absent for nameless interior spine entries.
    pub name: Option<String>,
    /// Absent means the referenced child is dirty and unpersisted.
    pub hash: Option<[u8; DIGEST_LEN]>,
}

impl Entry {
    pub fn encode(&self, out: &mut Vec<u8>) {
        if let Some(name) = &self.name {
            write_bytes_field(out, 1, name.as_bytes());
        }
        if let Some(hash) = &self.hash {
            write_bytes_field(out, 2, hash);
        }
    }

    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        let mut reader = TaggedReader::new(data);
        let mut entry = Entry::default();
        while let Some((field, value)) = reader.next()? {
            match (field, value) {
                (1, Field::Bytes(b)) => {
                    entry.name = Some(
                        String::from_utf8(b.to_vec())
                            .map_err(|_| CoreError::Decoding("entry name is not valid UTF-8".into()))?,
                    )
                }
                (2, Field::Bytes(b)) => entry.hash = Some(read_digest(b)?),
                _ => {}
            }
        }
        Ok(entry)
    }
}

/// Bitfield values for [`Node::mode`].
pub mod mode {
    pub const DIR: u32 = 1;
    pub const EXEC: u32 = 2;
}

/// One element of the filesystem tree: either a leaf (has `contents`) or an
/// interior node (has `children`), never meaningfully both.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Node {
    pub mode: Option<u32>,
    pub checksum: Option<u32>,
    pub contents: Option<Vec<u8>>,
    pub children: Vec<Entry>,
}

impl Node {
    pub fn is_directory(&self) -> bool {
        self.mode.map(|m| m & mode::DIR != 0).unwrap_or(false)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(mode) = self.mode {
            write_varint_field(&mut out, 1, mode as u64);
        }
        if let Some(checksum) = self.checksum {
            write_varint_field(&mut out, 2, checksum as u64);
        }
        if let Some(contents) = &self.contents {
            write_bytes_field(&mut out, 3, contents);
        }
        for child in &self.children {
            let mut buf = Vec::new();
            child.encode(&mut buf);
            write_bytes_field(&mut out, 4, &buf);
        }
        out
    }

    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        let mut reader = TaggedReader::new(data);
        let mut node = Node::default();
        while let Some((field, value)) = reader.next()? {
            match (field, value) {
                (1, Field::Varint(v)) => node.mode = Some(v as u32),
                (2, Field::Varint(v)) => node.checksum = Some(v as u32),
                (3, Field::Bytes(b)) => node.contents = Some(b.to_vec()),
                (4, Field::Bytes(b)) => node.children.push(Entry::decode(b)?),
                _ => {}
            }
        }
        Ok(node)
    }
}

/// An immutable commit: a root node digest plus zero or more parent commits.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Commit {
    pub root: [u8; DIGEST_LEN],
    pub parents: Vec<[u8; DIGEST_LEN]>,
}

impl Commit {
    pub fn new(root: [u8; DIGEST_LEN]) -> Self {
        Self { root, parents: Vec::new() }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_bytes_field(&mut out, 1, &self.root);
        for parent in &self.parents {
            write_bytes_field(&mut out, 2, parent);
        }
        out
    }

    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        let mut reader = TaggedReader::new(data);
        let mut root = None;
        let mut parents = Vec::new();
        while let Some((field, value)) = reader.next()? {
            match (field, value) {
                (1, Field::Bytes(b)) => root = Some(read_digest(b)?),
                (2, Field::Bytes(b)) => parents.push(read_digest(b)?),
                _ => {}
            }
        }
        Ok(Self {
            root: root.ok_or_else(|| CoreError::Decoding("commit missing root digest".into()))?,
            parents,
        })
    }
}

/// Kind of tree mutation a journal [`Change`] records. A closed, concrete set
/// (rather than an opaque integer) so journal replay has real semantics to
/// apply — see `cache::replay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    SetContents = 1,
    Mkdir = 2,
    Remove = 3,
    Rename = 4,
    SetMode = 5,
}

impl ChangeKind {
    fn from_u32(value: u32) -> CoreResult<Self> {
        match value {
            1 => Ok(ChangeKind::SetContents),
            2 => Ok(ChangeKind::Mkdir),
            3 => Ok(ChangeKind::Remove),
            4 => Ok(ChangeKind::Rename),
            5 => Ok(ChangeKind::SetMode),
            other => Err(CoreError::Decoding(format!("unknown change type {other}"))),
        }
    }
}

/// One journal entry. Carries either `commit` (set only on the first change
/// after a commit) or `last_change` (digest of the prior journal entry),
/// stitching the journal into a hash chain anchored at the baseline commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub kind: ChangeKind,
    pub path: String,
    pub target_hash: Option<[u8; DIGEST_LEN]>,
    pub rename_to: Option<String>,
    pub commit: Option<[u8; DIGEST_LEN]>,
    pub last_change: Option<[u8; DIGEST_LEN]>,
}

impl Change {
    pub fn new(kind: ChangeKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            target_hash: None,
            rename_to: None,
            commit: None,
            last_change: None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_varint_field(&mut out, 1, self.kind as u64);
        write_bytes_field(&mut out, 2, self.path.as_bytes());
        if let Some(hash) = &self.target_hash {
            write_bytes_field(&mut out, 3, hash);
        }
        if let Some(to) = &self.rename_to {
            write_bytes_field(&mut out, 4, to.as_bytes());
        }
        if let Some(commit) = &self.commit {
            write_bytes_field(&mut out, 5, commit);
        }
        if let Some(last_change) = &self.last_change {
            write_bytes_field(&mut out, 6, last_change);
        }
        out
    }

    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        let mut reader = TaggedReader::new(data);
        let mut kind = None;
        let mut path = None;
        let mut target_hash = None;
        let mut rename_to = None;
        let mut commit = None;
        let mut last_change = None;
        while let Some((field, value)) = reader.next()? {
            match (field, value) {
                (1, Field::Varint(v)) => kind = Some(ChangeKind::from_u32(v as u32)?),
                (2, Field::Bytes(b)) => {
                    path = Some(
                        String::from_utf8(b.to_vec())
                            .map_err(|_| CoreError::Decoding("change path is not valid UTF-8".into()))?,
                    )
                }
                (3, Field::Bytes(b)) => target_hash = Some(read_digest(b)?),
                (4, Field::Bytes(b)) => {
                    rename_to = Some(
                        String::from_utf8(b.to_vec())
                            .map_err(|_| CoreError::Decoding("rename target is not valid UTF-8".into()))?,
                    )
                }
                (5, Field::Bytes(b)) => commit = Some(read_digest(b)?),
                (6, Field::Bytes(b)) => last_change = Some(read_digest(b)?),
                _ => {}
            }
        }
        Ok(Self {
            kind: kind.ok_or_else(|| CoreError::Decoding("change missing type".into()))?,
            path: path.ok_or_else(|| CoreError::Decoding("change missing path".into()))?,
            target_hash,
            rename_to,
            commit,
            last_change,
        })
    }
}
