//! Typed persistence over the chunk codec: nodes, commits, branch refs and
//! per-branch journals.
//!
//! Node/commit write path: serialize with the canonical schema encoding
//! (`schema` module), run `write_chunk` to get `(ciphertext, digest)`, then
//! create a file named `altEncode(digest)` in the backing filesystem. Read
//! path reverses this. Journal entries are framed
//! (`varint(len) || ciphertext[len]`) because the backing file is
//! append-only and chunk ciphertext is opaque — framing is what lets a
//! reader find record boundaries without decrypting first.

use crate::codec::{Digest, FSInfo};
use crate::config::{DIGEST_LEN, JOURNALS_DIR, REFS_DIR, ROOT_REF_NAME};
use crate::error::{CoreError, CoreResult};
use crate::filename::{alt_decode, alt_encode};
use crate::fs::{self, FileSystem};
use crate::schema::{Change, Commit, Node};
use crate::varint;

/// Persists Node/Commit objects, mutable branch refs and per-branch
/// journals over an injected [`FileSystem`].
pub struct ChunkStore<F: FileSystem> {
    fs_info: FSInfo,
    backing: F,
}

impl<F: FileSystem> ChunkStore<F> {
    pub fn new(fs_info: FSInfo, backing: F) -> Self {
        Self { fs_info, backing }
    }

    fn store_bytes(&self, payload: &[u8]) -> CoreResult<Digest> {
        let mut buf = Vec::new();
        let digest = self.fs_info.write_chunk(&mut buf, payload)?;
        let mut dst = self.backing.create(&alt_encode(&digest))?;
        use std::io::Write;
        dst.write_all(&buf)?;
        log::debug!("stored object {}", alt_encode(&digest));
        Ok(digest)
    }

    fn load_bytes(&self, digest: &Digest) -> CoreResult<Vec<u8>> {
        let mut src = self.backing.open(&alt_encode(digest))?;
        let chunk = self.fs_info.read_chunk(&mut src)?;
        Ok(chunk.contents)
    }

    /// Computes the digest `store_node`/`store_commit` would produce for
    /// `payload` without persisting anything: encrypts exactly as
    /// `write_chunk` would, then hashes the resulting ciphertext. Must be
    /// called with the same *plaintext* bytes `write_chunk` is given — it is
    /// not a shortcut over an already-encrypted buffer.
    pub fn make_digest(&self, payload: &[u8]) -> CoreResult<Digest> {
        let ciphertext = self.fs_info.encrypt(payload)?;
        Ok(FSInfo::digest_of(&ciphertext))
    }

    pub fn store_node(&self, node: &Node) -> CoreResult<Digest> {
        self.store_bytes(&node.encode())
    }

    pub fn load_node(&self, digest: &Digest) -> CoreResult<Node> {
        let bytes = self.load_bytes(digest)?;
        Node::decode(&bytes)
    }

    pub fn store_commit(&self, commit: &Commit) -> CoreResult<Digest> {
        self.store_bytes(&commit.encode())
    }

    pub fn load_commit(&self, digest: &Digest) -> CoreResult<Commit> {
        let bytes = self.load_bytes(digest)?;
        Commit::decode(&bytes)
    }

    /// Overwrites `refs/root` with `altEncode(digest)`.
    pub fn store_root_digest(&self, digest: &Digest) -> CoreResult<()> {
        self.write_ref_file(&fs::join(REFS_DIR, ROOT_REF_NAME), digest)
    }

    /// Reads `refs/root`.
    pub fn load_root_digest(&self) -> CoreResult<Digest> {
        self.read_ref_file(&fs::join(REFS_DIR, ROOT_REF_NAME))
    }

    /// Overwrites `refs/<branch>` with `altEncode(digest)`.
    pub fn set_head(&self, branch: &str, digest: &Digest) -> CoreResult<()> {
        self.write_ref_file(&fs::join(REFS_DIR, branch), digest)
    }

    /// Reads `refs/<branch>`. Fails with `CoreError::UnknownName` if the
    /// branch does not exist.
    pub fn get_head(&self, branch: &str) -> CoreResult<Digest> {
        self.read_ref_file(&fs::join(REFS_DIR, branch))
    }

    fn write_ref_file(&self, name: &str, digest: &Digest) -> CoreResult<()> {
        use std::io::Write;
        let mut dst = self.backing.create(name)?;
        dst.write_all(alt_encode(digest).as_bytes())?;
        Ok(())
    }

    fn read_ref_file(&self, name: &str) -> CoreResult<Digest> {
        use std::io::Read;
        if !self.backing.exists(name) {
            return Err(CoreError::UnknownName(name.to_string()));
        }
        let mut src = self.backing.open(name)?;
        let mut text = String::new();
        src.read_to_string(&mut text)?;
        let bytes = alt_decode(text.trim_end())?;
        bytes
            .try_into()
            .map_err(|_| CoreError::Decoding(format!("ref {name} is not a {DIGEST_LEN}-byte digest")))
    }

    /// Appends `change` to `journals/<branch>`, returning the digest of the
    /// frame's ciphertext.
    pub fn write_to_journal(&self, branch: &str, change: &Change) -> CoreResult<Digest> {
        self.backing.mkdir(JOURNALS_DIR)?;
        let mut ciphertext_buf = Vec::new();
        let digest = self.fs_info.write_chunk(&mut ciphertext_buf, &change.encode())?;

        let mut framed = Vec::new();
        varint::encode(ciphertext_buf.len() as u64, &mut framed);
        framed.extend_from_slice(&ciphertext_buf);

        use std::io::Write;
        let name = fs::join(JOURNALS_DIR, branch);
        let mut dst = self.backing.append(&name)?;
        dst.write_all(&framed)?;
        log::debug!("journal[{branch}] appended change, digest {}", alt_encode(&digest));
        Ok(digest)
    }

    /// Deletes `journals/<branch>`. Idempotent.
    pub fn delete_journal(&self, branch: &str) -> CoreResult<()> {
        self.backing.remove(&fs::join(JOURNALS_DIR, branch))
    }

    fn journal_tip_name(branch: &str) -> String {
        fs::join(JOURNALS_DIR, &format!("{branch}.tip"))
    }

    /// Records `digest` as the expected digest of the last entry appended to
    /// `journals/<branch>`. This is the recorded expectation `Head::get_root`
    /// compares its replay against: a consecutive hash-chain check alone
    /// cannot detect a cleanly truncated *trailing* frame (or frames) because
    /// a dropped tail still leaves a self-consistent prefix behind, so
    /// anti-truncation needs a reference independent of the journal file
    /// itself.
    pub fn set_journal_tip(&self, branch: &str, digest: &Digest) -> CoreResult<()> {
        self.write_ref_file(&Self::journal_tip_name(branch), digest)
    }

    /// Reads the recorded journal-tip expectation for `branch`, or `None` if
    /// none has been recorded yet (a fresh branch, or one whose journal has
    /// never been written to).
    pub fn get_journal_tip(&self, branch: &str) -> CoreResult<Option<Digest>> {
        let name = Self::journal_tip_name(branch);
        if !self.backing.exists(&name) {
            return Ok(None);
        }
        self.read_ref_file(&name).map(Some)
    }

    /// Clears the recorded journal-tip expectation for `branch`. Idempotent.
    pub fn delete_journal_tip(&self, branch: &str) -> CoreResult<()> {
        self.backing.remove(&Self::journal_tip_name(branch))
    }

    /// Size in bytes of `journals/<branch>`, 0 if it doesn't exist yet.
    pub fn journal_size(&self, branch: &str) -> CoreResult<u64> {
        let name = fs::join(JOURNALS_DIR, branch);
        if !self.backing.exists(&name) {
            return Ok(0);
        }
        self.backing.size(&name)
    }

    /// Opens a forward, single-pass iterator over `journals/<branch>`.
    pub fn make_journal_iter(&self, branch: &str) -> CoreResult<JournalIter> {
        let name = fs::join(JOURNALS_DIR, branch);
        if !self.backing.exists(&name) {
            return Ok(JournalIter::empty());
        }
        let mut src = self.backing.open(&name)?;
        use std::io::Read;
        let mut data = Vec::new();
        src.read_to_end(&mut data)?;
        JournalIter::new(data, &self.fs_info)
    }
}

/// A decoded journal [`Change`] bundled with the digest of the ciphertext
/// frame that produced it (excluding the length prefix).
#[derive(Debug, Clone)]
pub struct ChangeEntry {
    pub digest: Digest,
    pub change: Change,
}

/// Forward, single-pass iterator over a branch's journal.
///
/// Decodes the whole journal eagerly on construction (journals are capped at
/// `max_journal_size`, a few tens of megabytes at most, so this trades a
/// bounded amount of memory for a simpler cursor than re-reading frames
/// lazily off a shared reader).
pub struct JournalIter {
    entries: Vec<ChangeEntry>,
    position: usize,
}

impl JournalIter {
    fn empty() -> Self {
        Self { entries: Vec::new(), position: 0 }
    }

    fn new(data: Vec<u8>, fs_info: &FSInfo) -> CoreResult<Self> {
        let mut entries = Vec::new();
        let mut cursor = std::io::Cursor::new(data);
        loop {
            let pos_before = cursor.position() as usize;
            let remaining = cursor.get_ref().len() - pos_before;
            if remaining == 0 {
                break;
            }
            let len = varint::decode(&mut cursor)? as usize;
            let start = cursor.position() as usize;
            let end = start + len;
            if end > cursor.get_ref().len() {
                return Err(CoreError::Integrity(
                    "journal frame length exceeds remaining file content".into(),
                ));
            }
            let ciphertext = cursor.get_ref()[start..end].to_vec();
            let digest = FSInfo::digest_of(&ciphertext);
            let mut ciphertext_cursor = std::io::Cursor::new(ciphertext);
            let chunk = fs_info.read_chunk(&mut ciphertext_cursor)?;
            let change = Change::decode(&chunk.contents)?;
            entries.push(ChangeEntry { digest, change });
            cursor.set_position(end as u64);
        }
        Ok(Self { entries, position: 0 })
    }

    pub fn is_valid(&self) -> bool {
        self.position < self.entries.len()
    }

    pub fn elem(&self) -> CoreResult<&ChangeEntry> {
        self.entries
            .get(self.position)
            .ok_or_else(|| CoreError::Generic("journal iterator is not positioned at a valid entry".into()))
    }

    pub fn next(&mut self) {
        if self.position < self.entries.len() {
            self.position += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemFileSystem;
    use crate::schema::ChangeKind;

    fn store() -> ChunkStore<MemFileSystem> {
        ChunkStore::new(FSInfo::new(b"bad-password"), MemFileSystem::new())
    }

    #[test]
    fn store_and_load_node_round_trips() {
        let store = store();
        let node = Node { checksum: Some(12345), contents: Some(b"Here is some contents".to_vec()), ..Default::default() };
        let digest = store.store_node(&node).unwrap();
        let loaded = store.load_node(&digest).unwrap();
        assert_eq!(loaded, node);
    }

    #[test]
    fn make_digest_matches_store_digest() {
        let store = store();
        let node = Node { checksum: Some(1), ..Default::default() };
        let payload = node.encode();
        let mut buf = Vec::new();
        let written_digest = store.fs_info.write_chunk(&mut buf, &payload).unwrap();
        let made_digest = store.make_digest(&payload).unwrap();
        assert_eq!(written_digest, made_digest);
    }

    #[test]
    fn root_ref_round_trips() {
        let store = store();
        let digest = [9u8; DIGEST_LEN];
        store.store_root_digest(&digest).unwrap();
        assert_eq!(store.load_root_digest().unwrap(), digest);
    }

    #[test]
    fn unknown_branch_head_is_unknown_name() {
        let store = store();
        assert!(matches!(store.get_head("nope"), Err(CoreError::UnknownName(_))));
    }

    #[test]
    fn journal_write_and_iterate_preserves_order_and_digests() {
        let store = store();
        let c1 = Change::new(ChangeKind::Mkdir, "/a");
        let c2 = Change::new(ChangeKind::SetContents, "/a/b");
        let d1 = store.write_to_journal("branch1", &c1).unwrap();
        let d2 = store.write_to_journal("branch1", &c2).unwrap();

        let mut iter = store.make_journal_iter("branch1").unwrap();
        assert!(iter.is_valid());
        assert_eq!(iter.elem().unwrap().change.kind, ChangeKind::Mkdir);
        assert_eq!(iter.elem().unwrap().digest, d1);
        iter.next();
        assert!(iter.is_valid());
        assert_eq!(iter.elem().unwrap().change.kind, ChangeKind::SetContents);
        assert_eq!(iter.elem().unwrap().digest, d2);
        iter.next();
        assert!(!iter.is_valid());
    }

    #[test]
    fn delete_journal_empties_it() {
        let store = store();
        store.write_to_journal("branch1", &Change::new(ChangeKind::Mkdir, "/a")).unwrap();
        store.delete_journal("branch1").unwrap();
        let iter = store.make_journal_iter("branch1").unwrap();
        assert!(!iter.is_valid());
    }

    #[test]
    fn journal_tip_round_trips_and_is_cleared_on_delete() {
        let store = store();
        assert_eq!(store.get_journal_tip("branch1").unwrap(), None);

        let digest = store.write_to_journal("branch1", &Change::new(ChangeKind::Mkdir, "/a")).unwrap();
        store.set_journal_tip("branch1", &digest).unwrap();
        assert_eq!(store.get_journal_tip("branch1").unwrap(), Some(digest));

        store.delete_journal_tip("branch1").unwrap();
        assert_eq!(store.get_journal_tip("branch1").unwrap(), None);
    }

    #[test]
    fn corrupted_frame_is_integrity_error() {
        let store = store();
        store.write_to_journal("branch1", &Change::new(ChangeKind::Mkdir, "/a")).unwrap();
        {
            use std::io::{Read, Write};
            let mut f = store.backing.open("journals/branch1").unwrap();
            let mut data = Vec::new();
            f.read_to_end(&mut data).unwrap();
            drop(f);
            let last = data.len() - 1;
            data[last] ^= 0xff;
            let mut f = store.backing.create("journals/branch1").unwrap();
            f.write_all(&data).unwrap();
        }
        assert!(matches!(store.make_journal_iter("branch1"), Err(CoreError::Integrity(_))));
    }
}
