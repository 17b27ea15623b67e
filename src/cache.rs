//! In-memory LRU cache of demand-loaded tree nodes, plus the branch `Head`
//! that binds a branch name to a baseline commit and an in-flight journal
//! chain.
//!
//! Nodes live in an arena (`Vec<Option<CachedNodeData>>`) rather than behind
//! per-node `Rc`/`RefCell`: the tree topology *is* the cache index, and GC
//! needs to physically unlink and free nodes rather than just drop
//! references to them. `CachedNode` is the caller-facing handle — an RAII
//! guard that pins its node against GC for as long as any clone of it is
//! alive, modeling "not currently borrowed by a caller" without a separate
//! borrow-tracking side table.

use std::cell::RefCell;
use std::rc::Rc;

use crate::codec::Digest;
use crate::config::{
    DEFAULT_GC_BOTTOM, DEFAULT_GC_THRESHOLD, DEFAULT_MAX_CHILDREN, DEFAULT_MAX_CONTENT_SIZE,
    DEFAULT_MAX_JOURNAL_SIZE, DIGEST_LEN,
};
use crate::error::{CoreError, CoreResult};
use crate::fs::FileSystem;
use crate::schema::{mode, Change, ChangeKind, Commit, Entry, Node};
use crate::store::ChunkStore;

type NodeId = usize;

#[derive(Debug, Clone)]
struct CachedEntry {
    name: Option<String>,
    hash: Option<Digest>,
    resolved: Option<NodeId>,
}

struct CachedNodeData {
    digest: Option<Digest>,
    node: Node,
    dirty: bool,
    parent: Option<NodeId>,
    children: Vec<CachedEntry>,
    prev: Option<NodeId>,
    next: Option<NodeId>,
    pins: u32,
}

struct Inner<F: FileSystem> {
    store: ChunkStore<F>,
    arena: Vec<Option<CachedNodeData>>,
    free_list: Vec<NodeId>,
    oldest: Option<NodeId>,
    newest: Option<NodeId>,
    gc_threshold: u64,
    gc_bottom: u64,
    resident_size: u64,
}

impl<F: FileSystem> Inner<F> {
    fn alloc_slot(&mut self, data: CachedNodeData) -> NodeId {
        if let Some(id) = self.free_list.pop() {
            self.arena[id] = Some(data);
            id
        } else {
            self.arena.push(Some(data));
            self.arena.len() - 1
        }
    }

    fn slot(&self, id: NodeId) -> &CachedNodeData {
        self.arena[id].as_ref().expect("node id does not refer to a live slot")
    }

    fn slot_mut(&mut self, id: NodeId) -> &mut CachedNodeData {
        self.arena[id].as_mut().expect("node id does not refer to a live slot")
    }

    fn lru_add(&mut self, id: NodeId) {
        let (prev, next) = {
            let d = self.slot(id);
            (d.prev, d.next)
        };
        if prev.is_some() || next.is_some() {
            panic!("adding a node that is already linked into the LRU chain");
        }
        if let Some(newest) = self.newest {
            self.slot_mut(newest).next = Some(id);
            self.slot_mut(id).prev = Some(newest);
        } else {
            self.oldest = Some(id);
        }
        self.newest = Some(id);
    }

    fn lru_release(&mut self, id: NodeId) {
        let (prev, next) = {
            let d = self.slot(id);
            (d.prev, d.next)
        };
        match prev {
            Some(p) => self.slot_mut(p).next = next,
            None => self.oldest = next,
        }
        match next {
            Some(n) => self.slot_mut(n).prev = prev,
            None => self.newest = prev,
        }
        let d = self.slot_mut(id);
        d.prev = None;
        d.next = None;
    }

    fn lru_touch(&mut self, id: NodeId) {
        if self.newest == Some(id) {
            return;
        }
        self.lru_release(id);
        self.lru_add(id);
    }

    fn resident_size_of(&self, id: NodeId) -> u64 {
        const NODE_OVERHEAD: u64 = 64;
        const ENTRY_OVERHEAD: u64 = 16;
        let data = self.slot(id);
        let mut size = NODE_OVERHEAD;
        if let Some(contents) = &data.node.contents {
            size += contents.len() as u64;
        }
        for entry in &data.children {
            size += ENTRY_OVERHEAD + DIGEST_LEN as u64;
            if let Some(name) = &entry.name {
                size += name.len() as u64;
            }
        }
        size
    }

    /// Re-measures `id`'s resident size against `old_size` and folds the
    /// delta into `resident_size`. Called after any mutation that can change
    /// a node's contents length or child count, so the running total stays
    /// in sync with what `garbage_collect` will later subtract.
    fn adjust_resident_size(&mut self, id: NodeId, old_size: u64) {
        let new_size = self.resident_size_of(id);
        if new_size >= old_size {
            self.resident_size += new_size - old_size;
        } else {
            self.resident_size -= old_size - new_size;
        }
    }

    fn disposable(&self, id: NodeId) -> bool {
        let data = self.slot(id);
        // Dirty status always propagates from an edited node up through its
        // parent chain (see `Cache::mark_dirty_and_propagate`), so a clean
        // node can never have a dirty descendant below it: propagation would
        // already have made this node dirty too.
        !data.dirty && data.pins == 0
    }

    fn free_node(&mut self, id: NodeId) {
        self.lru_release(id);
        if let Some(parent_id) = self.slot(id).parent {
            if let Some(parent) = self.arena.get_mut(parent_id).and_then(|s| s.as_mut()) {
                for entry in parent.children.iter_mut() {
                    if entry.resolved == Some(id) {
                        entry.resolved = None;
                    }
                }
            }
        }
        self.arena[id] = None;
        self.free_list.push(id);
    }

    /// Walks from `oldest` forward, freeing disposable nodes until `amount`
    /// bytes have been reclaimed or the list is exhausted.
    fn garbage_collect(&mut self, amount: u64) {
        let mut reclaimed = 0u64;
        let mut cursor = self.oldest;
        while let Some(id) = cursor {
            if reclaimed >= amount {
                break;
            }
            let next = self.slot(id).next;
            if self.disposable(id) {
                let size = self.resident_size_of(id);
                self.free_node(id);
                self.resident_size = self.resident_size.saturating_sub(size);
                reclaimed += size;
            }
            cursor = next;
        }
        log::debug!("gc reclaimed {reclaimed} of {amount} requested bytes");
    }

    fn maybe_collect(&mut self) {
        if self.resident_size >= self.gc_threshold {
            let shortfall = self.resident_size.saturating_sub(self.gc_bottom);
            self.garbage_collect(shortfall);
        }
    }
}

/// Owns the node arena and the backing object store. Cheaply cloneable —
/// clones share the same underlying cache state.
pub struct Cache<F: FileSystem> {
    inner: Rc<RefCell<Inner<F>>>,
}

impl<F: FileSystem> Clone for Cache<F> {
    fn clone(&self) -> Self {
        Self { inner: Rc::clone(&self.inner) }
    }
}

impl<F: FileSystem> Cache<F> {
    pub fn new(store: ChunkStore<F>) -> Self {
        Self::with_thresholds(store, DEFAULT_GC_THRESHOLD, DEFAULT_GC_BOTTOM)
    }

    pub fn with_thresholds(store: ChunkStore<F>, gc_threshold: u64, gc_bottom: u64) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                store,
                arena: Vec::new(),
                free_list: Vec::new(),
                oldest: None,
                newest: None,
                gc_threshold,
                gc_bottom,
                resident_size: 0,
            })),
        }
    }

    /// Current sum of resident node sizes, exposed for tests and operators.
    pub fn resident_size(&self) -> u64 {
        self.inner.borrow().resident_size
    }

    /// Runs garbage collection on demand, reclaiming up to `amount` bytes.
    pub fn garbage_collect(&self, amount: u64) {
        self.inner.borrow_mut().garbage_collect(amount);
    }

    fn mark_dirty_and_propagate(&self, id: NodeId) {
        let mut inner = self.inner.borrow_mut();
        let mut cursor = Some(id);
        while let Some(cur) = cursor {
            let data = inner.slot_mut(cur);
            if data.dirty {
                break;
            }
            data.dirty = true;
            data.digest = None;
            cursor = data.parent;
        }
    }

    /// Loads a `Node` straight from the backing store, bypassing the arena.
    pub fn load_node(&self, digest: &Digest) -> CoreResult<Node> {
        self.inner.borrow().store.load_node(digest)
    }

    /// Demand-loads the node at `digest`, wraps it as a `CachedNode`, and
    /// places it at the newest end of the LRU.
    fn make_cached_node(&self, parent: Option<NodeId>, digest: &Digest) -> CoreResult<CachedNode<F>> {
        log::trace!("loading node {}", crate::filename::alt_encode(digest));
        let node = self.load_node(digest)?;
        let children = node
            .children
            .iter()
            .map(|e| CachedEntry { name: e.name.clone(), hash: e.hash, resolved: None })
            .collect();
        let id = {
            let mut inner = self.inner.borrow_mut();
            let id = inner.alloc_slot(CachedNodeData {
                digest: Some(*digest),
                node,
                dirty: false,
                parent,
                children,
                prev: None,
                next: None,
                pins: 1,
            });
            inner.lru_add(id);
            let size = inner.resident_size_of(id);
            inner.resident_size += size;
            inner.maybe_collect();
            id
        };
        Ok(CachedNode { cache: self.clone(), id })
    }

    /// Creates a fresh, dirty, in-memory node with no backing digest yet.
    pub fn new_empty_node(&self, parent: Option<NodeId>) -> CachedNode<F> {
        let mut inner = self.inner.borrow_mut();
        let id = inner.alloc_slot(CachedNodeData {
            digest: None,
            node: Node::default(),
            dirty: true,
            parent,
            children: Vec::new(),
            prev: None,
            next: None,
            pins: 1,
        });
        inner.lru_add(id);
        let size = inner.resident_size_of(id);
        inner.resident_size += size;
        inner.maybe_collect();
        CachedNode { cache: self.clone(), id }
    }

    /// Recursively persists dirty descendants of `node` bottom-up and
    /// returns the (possibly newly computed) digest of `node` itself.
    ///
    /// Not one of the five Head operations named below, but required for
    /// `attach_child`/`set_contents` edits to ever become storable — see
    /// `Head::commit`.
    pub fn flush_dirty(&self, node: &CachedNode<F>) -> CoreResult<Digest> {
        let is_dirty = self.inner.borrow().slot(node.id).dirty;
        if !is_dirty {
            return self
                .inner
                .borrow()
                .slot(node.id)
                .digest
                .ok_or_else(|| CoreError::Generic("clean node has no digest".into()));
        }

        let child_count = self.inner.borrow().slot(node.id).children.len();
        for index in 0..child_count {
            let (needs_flush, resolved) = {
                let inner = self.inner.borrow();
                let entry = &inner.slot(node.id).children[index];
                (entry.hash.is_none() || entry.resolved.is_some(), entry.resolved)
            };
            if !needs_flush {
                continue;
            }
            let child_id = match resolved {
                Some(id) => id,
                None => return Err(CoreError::Generic("dirty entry has neither a hash nor a resolved child".into())),
            };
            self.inner.borrow_mut().slot_mut(child_id).pins += 1;
            let child = CachedNode { cache: self.clone(), id: child_id };
            let child_digest = self.flush_dirty(&child)?;
            drop(child);
            self.inner.borrow_mut().slot_mut(node.id).children[index].hash = Some(child_digest);
        }

        let serialized = {
            let inner = self.inner.borrow();
            let data = inner.slot(node.id);
            Node {
                mode: data.node.mode,
                checksum: data.node.checksum,
                contents: data.node.contents.clone(),
                children: data
                    .children
                    .iter()
                    .map(|e| Entry { name: e.name.clone(), hash: e.hash })
                    .collect(),
            }
        };
        let digest = self.inner.borrow().store.store_node(&serialized)?;
        {
            let mut inner = self.inner.borrow_mut();
            let data = inner.slot_mut(node.id);
            data.node = serialized;
            data.dirty = false;
            data.digest = Some(digest);
        }
        Ok(digest)
    }

    /// Returns a `Head` for `branch`. Bootstraps a new branch (empty root
    /// directory, single parentless commit, `refs/<branch>` write) if none
    /// exists yet — the only place `CoreError::UnknownName` is treated as
    /// expected rather than propagated.
    pub fn get_head(&self, branch: &str) -> CoreResult<Head<F>> {
        let existing = self.inner.borrow().store.get_head(branch);
        let baseline_commit = match existing {
            Ok(digest) => digest,
            Err(CoreError::UnknownName(_)) => {
                let root_node = Node { mode: Some(mode::DIR), ..Default::default() };
                let root_digest = self.inner.borrow().store.store_node(&root_node)?;
                let commit = Commit::new(root_digest);
                let commit_digest = self.inner.borrow().store.store_commit(&commit)?;
                self.inner.borrow().store.set_head(branch, &commit_digest)?;
                log::info!("bootstrapped new branch '{branch}'");
                commit_digest
            }
            Err(e) => return Err(e),
        };
        Ok(Head {
            cache: self.clone(),
            branch: branch.to_string(),
            baseline_commit,
            last_change: None,
            max_content_size: DEFAULT_MAX_CONTENT_SIZE,
            max_children: DEFAULT_MAX_CHILDREN,
            max_journal_size: DEFAULT_MAX_JOURNAL_SIZE,
        })
    }
}

/// Caller-facing handle to a node in the cache. Cloning pins the node
/// against GC (increments an in-arena reference count); dropping the last
/// clone unpins it. Dropping a handle does not itself free anything — an
/// unpinned, clean node is only reclaimed when GC later walks past it.
pub struct CachedNode<F: FileSystem> {
    cache: Cache<F>,
    id: NodeId,
}

impl<F: FileSystem> Clone for CachedNode<F> {
    fn clone(&self) -> Self {
        if let Ok(mut inner) = self.cache.inner.try_borrow_mut() {
            inner.slot_mut(self.id).pins += 1;
        }
        Self { cache: self.cache.clone(), id: self.id }
    }
}

impl<F: FileSystem> Drop for CachedNode<F> {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.cache.inner.try_borrow_mut() {
            if let Some(slot) = inner.arena.get_mut(self.id).and_then(|s| s.as_mut()) {
                slot.pins = slot.pins.saturating_sub(1);
            }
        }
    }
}

impl<F: FileSystem> CachedNode<F> {
    fn touch(&self) {
        self.cache.inner.borrow_mut().lru_touch(self.id);
    }

    pub fn digest(&self) -> Option<Digest> {
        self.cache.inner.borrow().slot(self.id).digest
    }

    pub fn is_dirty(&self) -> bool {
        self.cache.inner.borrow().slot(self.id).dirty
    }

    pub fn mode(&self) -> Option<u32> {
        self.cache.inner.borrow().slot(self.id).node.mode
    }

    pub fn is_directory(&self) -> bool {
        self.cache.inner.borrow().slot(self.id).node.is_directory()
    }

    pub fn checksum(&self) -> Option<u32> {
        self.cache.inner.borrow().slot(self.id).node.checksum
    }

    pub fn contents(&self) -> Option<Vec<u8>> {
        self.touch();
        self.cache.inner.borrow().slot(self.id).node.contents.clone()
    }

    pub fn child_count(&self) -> usize {
        self.cache.inner.borrow().slot(self.id).children.len()
    }

    pub fn child_name(&self, index: usize) -> Option<String> {
        self.cache.inner.borrow().slot(self.id).children.get(index).and_then(|e| e.name.clone())
    }

    /// Binary search for `name` among this node's named children. Returns
    /// `(index, true)` if found, `(insertion_point, false)` otherwise.
    pub fn find_child_index(&self, name: &str) -> (usize, bool) {
        let inner = self.cache.inner.borrow();
        let children = &inner.slot(self.id).children;
        match children.binary_search_by(|e| e.name.as_deref().unwrap_or("").cmp(name)) {
            Ok(idx) => (idx, true),
            Err(idx) => (idx, false),
        }
    }

    /// Demand-loads (if necessary) and returns the child at `index`.
    pub fn get_child(&self, index: usize) -> CoreResult<CachedNode<F>> {
        self.touch();
        let (resolved, hash) = {
            let inner = self.cache.inner.borrow();
            let entry = inner
                .slot(self.id)
                .children
                .get(index)
                .ok_or_else(|| CoreError::Generic(format!("child index {index} out of range")))?;
            (entry.resolved, entry.hash)
        };
        if let Some(id) = resolved {
            let mut inner = self.cache.inner.borrow_mut();
            inner.slot_mut(id).pins += 1;
            inner.lru_touch(id);
            return Ok(CachedNode { cache: self.cache.clone(), id });
        }
        let hash = hash.ok_or_else(|| {
            CoreError::Generic("child entry has no hash and no in-memory node: nothing to load".into())
        })?;
        let child = self.cache.make_cached_node(Some(self.id), &hash)?;
        self.cache.inner.borrow_mut().slot_mut(self.id).children[index].resolved = Some(child.id);
        Ok(child)
    }

    /// Looks up a child by name via binary search, demand-loading it if
    /// found.
    pub fn get_child_by_name(&self, name: &str) -> CoreResult<Option<CachedNode<F>>> {
        let (idx, found) = self.find_child_index(name);
        if !found {
            return Ok(None);
        }
        Ok(Some(self.get_child(idx)?))
    }

    /// Replaces this node's leaf contents, dropping any children, and marks
    /// it (and its ancestors) dirty.
    pub fn set_contents(&self, contents: Vec<u8>) {
        {
            let mut inner = self.cache.inner.borrow_mut();
            let old_size = inner.resident_size_of(self.id);
            {
                let data = inner.slot_mut(self.id);
                data.node.contents = Some(contents);
                data.node.children.clear();
                data.children.clear();
            }
            inner.adjust_resident_size(self.id, old_size);
            inner.maybe_collect();
        }
        self.cache.mark_dirty_and_propagate(self.id);
    }

    /// Sets this node's mode bits directly (used by leaf nodes created
    /// in-memory before their first flush).
    pub fn set_mode(&self, mode: u32) {
        self.cache.inner.borrow_mut().slot_mut(self.id).node.mode = Some(mode);
        self.cache.mark_dirty_and_propagate(self.id);
    }

    /// Inserts or replaces (by name) a child entry referencing `hash`, and
    /// marks this node (and its ancestors) dirty.
    pub fn attach_child(&self, name: &str, hash: Digest) -> CoreResult<()> {
        let (idx, found) = self.find_child_index(name);
        {
            let mut inner = self.cache.inner.borrow_mut();
            let old_size = inner.resident_size_of(self.id);
            {
                let data = inner.slot_mut(self.id);
                if found {
                    data.children[idx].hash = Some(hash);
                    data.children[idx].resolved = None;
                } else {
                    data.children.insert(idx, CachedEntry { name: Some(name.to_string()), hash: Some(hash), resolved: None });
                }
            }
            inner.adjust_resident_size(self.id, old_size);
            inner.maybe_collect();
        }
        self.cache.mark_dirty_and_propagate(self.id);
        Ok(())
    }

    /// Removes the child named `name`. Fails with `CoreError::UnknownName`
    /// if no such child exists.
    pub fn remove_child(&self, name: &str) -> CoreResult<()> {
        let (idx, found) = self.find_child_index(name);
        if !found {
            return Err(CoreError::UnknownName(name.to_string()));
        }
        {
            let mut inner = self.cache.inner.borrow_mut();
            let old_size = inner.resident_size_of(self.id);
            inner.slot_mut(self.id).children.remove(idx);
            inner.adjust_resident_size(self.id, old_size);
        }
        self.cache.mark_dirty_and_propagate(self.id);
        Ok(())
    }

    /// Renames the child `old_name` to `new_name`, preserving its hash.
    pub fn rename_child(&self, old_name: &str, new_name: &str) -> CoreResult<()> {
        let (old_idx, found) = self.find_child_index(old_name);
        if !found {
            return Err(CoreError::UnknownName(old_name.to_string()));
        }
        let old_size = self.cache.inner.borrow().resident_size_of(self.id);
        let removed = {
            let mut inner = self.cache.inner.borrow_mut();
            inner.slot_mut(self.id).children.remove(old_idx)
        };
        let (new_idx, _) = self.find_child_index(new_name);
        {
            let mut inner = self.cache.inner.borrow_mut();
            inner.slot_mut(self.id).children.insert(
                new_idx,
                CachedEntry { name: Some(new_name.to_string()), hash: removed.hash, resolved: removed.resolved },
            );
            inner.adjust_resident_size(self.id, old_size);
            inner.maybe_collect();
        }
        self.cache.mark_dirty_and_propagate(self.id);
        Ok(())
    }
}

fn split_path(path: &str) -> CoreResult<(Vec<&str>, &str)> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Err(CoreError::Generic("change path must not be empty".into()));
    }
    let mut parts: Vec<&str> = trimmed.split('/').collect();
    let name = parts.pop().expect("split on a non-empty string yields at least one component");
    Ok((parts, name))
}

fn resolve_dir<F: FileSystem>(root: &CachedNode<F>, components: &[&str]) -> CoreResult<CachedNode<F>> {
    let mut current = root.clone();
    for component in components {
        let (idx, found) = current.find_child_index(component);
        if !found {
            return Err(CoreError::Decoding(format!("no such directory component: {component}")));
        }
        current = current.get_child(idx)?;
    }
    Ok(current)
}

fn apply_change<F: FileSystem>(root: &CachedNode<F>, change: &Change) -> CoreResult<()> {
    let (dir_components, name) = split_path(&change.path)?;
    let parent = resolve_dir(root, &dir_components)?;
    match change.kind {
        ChangeKind::SetContents | ChangeKind::Mkdir | ChangeKind::SetMode => {
            let hash = change
                .target_hash
                .ok_or_else(|| CoreError::Decoding("change is missing its target hash".into()))?;
            parent.attach_child(name, hash)?;
        }
        ChangeKind::Remove => parent.remove_child(name)?,
        ChangeKind::Rename => {
            let new_name = change
                .rename_to
                .as_deref()
                .ok_or_else(|| CoreError::Decoding("rename change is missing its target name".into()))?;
            parent.rename_child(name, new_name)?;
        }
    }
    Ok(())
}

/// What the next journal entry's hash-chain field is expected to reference:
/// the baseline commit (for the first entry after a commit) or the previous
/// entry's digest.
#[derive(Clone, Copy)]
enum ChainLink {
    Commit(Digest),
    Change(Digest),
}

/// The mutable pointer from a branch name to a commit digest, plus any
/// in-flight journal chain.
pub struct Head<F: FileSystem> {
    cache: Cache<F>,
    branch: String,
    baseline_commit: Digest,
    last_change: Option<Digest>,
    pub max_content_size: u64,
    pub max_children: usize,
    pub max_journal_size: u64,
}

impl<F: FileSystem> Head<F> {
    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn baseline_commit(&self) -> Digest {
        self.baseline_commit
    }

    /// Returns the filesystem root at this branch's current logical state:
    /// the baseline commit's root with the branch's journal replayed on top.
    ///
    /// Replay validates the journal's hash chain as it goes: the first entry
    /// must be anchored to `baseline_commit`, and every subsequent entry's
    /// `last_change` must match the previous entry's digest exactly. Once
    /// replay reaches EOF, the last replayed entry's digest is also checked
    /// against the journal-tip digest `add_change` recorded independently of
    /// the journal file — a consecutive-link check alone cannot see a whole
    /// trailing frame dropped cleanly, since the remaining prefix is still
    /// internally consistent. Any break, in either check, surfaces
    /// `CoreError::Integrity` rather than silently accepting a truncated or
    /// forged tail.
    pub fn get_root(&mut self) -> CoreResult<CachedNode<F>> {
        let commit = self.cache.inner.borrow().store.load_commit(&self.baseline_commit)?;
        let root = self.cache.make_cached_node(None, &commit.root)?;

        let expected_tip = self.cache.inner.borrow().store.get_journal_tip(&self.branch)?;
        let mut iter = self.cache.inner.borrow().store.make_journal_iter(&self.branch)?;
        let mut expected = ChainLink::Commit(self.baseline_commit);
        let mut last_digest = None;
        while iter.is_valid() {
            let entry = iter.elem()?.clone();
            match expected {
                ChainLink::Commit(baseline) if entry.change.commit != Some(baseline) => {
                    return Err(CoreError::Integrity(
                        "journal's first change is not anchored to the baseline commit".into(),
                    ));
                }
                ChainLink::Change(prev) if entry.change.last_change != Some(prev) => {
                    return Err(CoreError::Integrity("journal hash chain is broken".into()));
                }
                _ => {}
            }
            apply_change(&root, &entry.change)?;
            expected = ChainLink::Change(entry.digest);
            last_digest = Some(entry.digest);
            iter.next();
        }
        if expected_tip != last_digest {
            return Err(CoreError::Integrity(
                "journal tail is truncated: replayed tip does not match the recorded journal-tip digest".into(),
            ));
        }
        self.last_change = last_digest;
        Ok(root)
    }

    /// Journals `change`, stamping it with `last_change` (or `commit` if
    /// this is the first change since the baseline), records the resulting
    /// digest as the new journal-tip expectation, and returns that digest.
    pub fn add_change(&mut self, mut change: Change) -> CoreResult<Digest> {
        if let Some(last) = self.last_change {
            change.last_change = Some(last);
        } else {
            change.commit = Some(self.baseline_commit);
        }
        let digest = self.cache.inner.borrow().store.write_to_journal(&self.branch, &change)?;
        self.cache.inner.borrow().store.set_journal_tip(&self.branch, &digest)?;
        self.last_change = Some(digest);
        Ok(digest)
    }

    /// True once the journal's size reaches `max_journal_size`.
    pub fn should_commit(&self) -> CoreResult<bool> {
        let size = self.cache.inner.borrow().store.journal_size(&self.branch)?;
        Ok(size >= self.max_journal_size)
    }

    /// Records that `digest` is now the baseline commit and clears the
    /// in-flight journal chain, including its recorded tip expectation.
    pub fn record_commit(&mut self, digest: Digest) -> CoreResult<()> {
        self.last_change = None;
        self.baseline_commit = digest;
        self.cache.inner.borrow().store.delete_journal(&self.branch)?;
        self.cache.inner.borrow().store.delete_journal_tip(&self.branch)
    }

    /// Flushes dirty descendants of `root`, stores a new `Commit` pointing
    /// at the flushed root with `baseline_commit` as its sole parent, writes
    /// `refs/<branch>`, and calls `record_commit`. Not one of the five
    /// operations named above, but the natural composition of them needed to
    /// make `attach_child`/`set_contents` edits durable.
    pub fn commit(&mut self, root: &CachedNode<F>) -> CoreResult<Digest> {
        let root_digest = self.cache.flush_dirty(root)?;
        let commit = Commit { root: root_digest, parents: vec![self.baseline_commit] };
        let commit_digest = self.cache.inner.borrow().store.store_commit(&commit)?;
        self.cache.inner.borrow().store.set_head(&self.branch, &commit_digest)?;
        self.record_commit(commit_digest)?;
        Ok(commit_digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemFileSystem;

    fn cache() -> Cache<MemFileSystem> {
        let store = ChunkStore::new(crate::codec::FSInfo::new(b"bad-password"), MemFileSystem::new());
        Cache::with_thresholds(store, 1_000_000, 100_000)
    }

    #[test]
    fn bootstrap_creates_dir_root_and_is_idempotent() {
        let cache = cache();
        let mut head = cache.get_head("master").unwrap();
        let root = head.get_root().unwrap();
        assert!(root.is_directory());
        assert_eq!(root.child_count(), 0);

        let head_again = cache.get_head("master").unwrap();
        assert_eq!(head_again.baseline_commit(), head.baseline_commit());
    }

    #[test]
    fn lru_add_order_and_links() {
        let cache = cache();
        let a = cache.new_empty_node(None);
        let b = cache.new_empty_node(None);
        let c = cache.new_empty_node(None);
        let inner = cache.inner.borrow();
        assert_eq!(inner.oldest, Some(a.id));
        assert_eq!(inner.newest, Some(c.id));
        assert_eq!(inner.slot(a.id).next, Some(b.id));
        assert_eq!(inner.slot(c.id).prev, Some(b.id));
    }

    #[test]
    fn touch_moves_node_to_newest() {
        let cache = cache();
        let a = cache.new_empty_node(None);
        let b = cache.new_empty_node(None);
        let _c = cache.new_empty_node(None);
        a.touch();
        let inner = cache.inner.borrow();
        assert_eq!(inner.newest, Some(a.id));
        assert_eq!(inner.oldest, Some(b.id));
    }

    #[test]
    fn gc_never_evicts_dirty_nodes() {
        let cache = cache();
        let dirty = cache.new_empty_node(None);
        let dirty_id = dirty.id;
        drop(dirty);
        cache.garbage_collect(u64::MAX);
        assert!(cache.inner.borrow().arena[dirty_id].is_some());
    }

    #[test]
    fn gc_evicts_clean_unpinned_nodes() {
        let cache = cache();
        let mut head = cache.get_head("master").unwrap();
        let root = head.get_root().unwrap();
        let root_id = root.id;
        drop(root);
        cache.garbage_collect(u64::MAX);
        assert!(cache.inner.borrow().arena[root_id].is_none());
    }

    #[test]
    fn pinned_clone_prevents_eviction() {
        let cache = cache();
        let mut head = cache.get_head("master").unwrap();
        let root = head.get_root().unwrap();
        let _pin = root.clone();
        let root_id = root.id;
        drop(root);
        cache.garbage_collect(u64::MAX);
        assert!(cache.inner.borrow().arena[root_id].is_some());
    }

    #[test]
    fn attach_and_commit_round_trips_through_new_head() {
        let cache = cache();
        let mut head = cache.get_head("master").unwrap();
        let root = head.get_root().unwrap();

        let leaf = cache.new_empty_node(None);
        leaf.set_contents(b"hello".to_vec());
        let leaf_digest = cache.flush_dirty(&leaf).unwrap();
        root.attach_child("greeting", leaf_digest).unwrap();
        assert!(root.is_dirty());

        let commit_digest = head.commit(&root).unwrap();
        assert_eq!(head.baseline_commit(), commit_digest);

        let mut reopened = cache.get_head("master").unwrap();
        let reopened_root = reopened.get_root().unwrap();
        assert_eq!(reopened_root.child_count(), 1);
        let child = reopened_root.get_child_by_name("greeting").unwrap().unwrap();
        assert_eq!(child.contents().unwrap(), b"hello");
    }

    #[test]
    fn journal_replay_applies_changes_in_order() {
        let cache = cache();
        let mut head = cache.get_head("master").unwrap();

        let leaf = cache.new_empty_node(None);
        leaf.set_contents(b"v1".to_vec());
        let leaf_digest = cache.flush_dirty(&leaf).unwrap();

        let mut change = Change::new(ChangeKind::SetContents, "/file.txt");
        change.target_hash = Some(leaf_digest);
        head.add_change(change).unwrap();

        let mut reopened = cache.get_head("master").unwrap();
        let root = reopened.get_root().unwrap();
        let child = root.get_child_by_name("file.txt").unwrap().unwrap();
        assert_eq!(child.contents().unwrap(), b"v1");
    }

    #[test]
    fn broken_hash_chain_is_rejected_on_replay() {
        let cache = cache();
        let mut head = cache.get_head("master").unwrap();
        let mut change = Change::new(ChangeKind::Mkdir, "/dir");
        // Force a bogus anchor so the chain check fails.
        change.commit = Some([0xAAu8; DIGEST_LEN]);
        cache.inner.borrow().store.write_to_journal("master", &change).unwrap();

        assert!(matches!(head.get_root(), Err(CoreError::Integrity(_))));
    }

    #[test]
    fn should_commit_reflects_journal_size() {
        let cache = cache();
        let mut head = cache.get_head("master").unwrap();
        head.max_journal_size = 1;
        assert!(!head.should_commit().unwrap());
        head.add_change(Change::new(ChangeKind::Mkdir, "/dir")).unwrap();
        assert!(head.should_commit().unwrap());
    }
}
