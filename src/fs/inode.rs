//! Inode table mapping inode numbers to directory/file nodes.
//!
//! Nodes are materialized lazily: directory children are populated on
//! first readdir/lookup, not upfront. The table holds a bounded working
//! set; nodes the kernel no longer references and that carry no local
//! state are evicted least-recently-used once the table grows past its
//! cap. Evicted entries are rebuilt from the backing store on the next
//! population of their parent.

use std::collections::HashMap;
use std::time::SystemTime;

use crate::fs::directory::{DirNode, DirSource};
use crate::fs::file::FileNode;

/// Root inode number (standard FUSE convention).
pub const ROOT_INO: u64 = 1;

/// Default block size for statfs reporting.
pub const BLOCK_SIZE: u32 = 4096;

// ── Node ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Node {
    File(FileNode),
    Directory(DirNode),
}

impl Node {
    pub fn as_dir(&self) -> Option<&DirNode> {
        match self {
            Node::Directory(d) => Some(d),
            Node::File(_) => None,
        }
    }

    pub fn as_dir_mut(&mut self) -> Option<&mut DirNode> {
        match self {
            Node::Directory(d) => Some(d),
            Node::File(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<&FileNode> {
        match self {
            Node::File(f) => Some(f),
            Node::Directory(_) => None,
        }
    }

    pub fn as_file_mut(&mut self) -> Option<&mut FileNode> {
        match self {
            Node::File(f) => Some(f),
            Node::Directory(_) => None,
        }
    }
}

/// Whether a node is still linked into the tree. Unlinked nodes stay
/// readable through open handles and disappear at last close/forget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Live,
    Unlinked,
}

// ── Inode ─────────────────────────────────────────────────────────────────────

/// Complete data for a single inode.
#[derive(Debug, Clone)]
pub struct Inode {
    pub ino: u64,
    pub parent: u64,
    pub name: String,
    pub node: Node,
    /// Kernel lookup count, balanced by `forget`.
    pub lookups: u64,
    /// Open file/dir handle count.
    pub handles: u32,
    /// Pinned nodes (root and its fixed children) are never evicted.
    pub pinned: bool,
    /// Whether the server's last known state contains this path. Entries
    /// built from a fetched manifest or pushed by a successful flush are
    /// synced; freshly created or renamed entries are not. Conflict
    /// merges let a remote deletion win only for synced entries.
    pub synced: bool,
    pub state: NodeState,
    /// Monotonic use tick for LRU eviction.
    pub last_used: u64,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
}

impl Inode {
    pub fn is_dir(&self) -> bool {
        matches!(self.node, Node::Directory(_))
    }

    pub fn size(&self) -> u64 {
        match &self.node {
            Node::File(f) => f.size(),
            Node::Directory(_) => 0,
        }
    }
}

// ── InodeTable ────────────────────────────────────────────────────────────────

/// Maps inode numbers to nodes and provides lookup by parent+name.
///
/// Inode numbers are allocated sequentially starting at 2 (1 is root)
/// and never reused within a mount.
pub struct InodeTable {
    pub inodes: HashMap<u64, Inode>,
    /// Lookup index: (parent_ino, name) -> child_ino.
    name_index: HashMap<(u64, String), u64>,
    next_ino: u64,
    tick: u64,
    /// Eviction starts once the table holds more than this many nodes.
    pub cap: usize,
    /// Eviction never shrinks the table below this many nodes.
    pub min_entries: usize,
}

impl InodeTable {
    /// New table with a pinned root of the given directory source.
    pub fn new(root_source: DirSource, cap: usize, min_entries: usize) -> Self {
        let now = SystemTime::now();
        let root = Inode {
            ino: ROOT_INO,
            parent: ROOT_INO,
            name: String::new(),
            node: Node::Directory(DirNode::new(root_source)),
            lookups: 0,
            handles: 0,
            pinned: true,
            synced: true,
            state: NodeState::Live,
            last_used: 0,
            mtime: now,
            ctime: now,
            crtime: now,
        };
        let mut inodes = HashMap::new();
        inodes.insert(ROOT_INO, root);
        Self {
            inodes,
            name_index: HashMap::new(),
            next_ino: 2,
            tick: 0,
            cap,
            min_entries,
        }
    }

    pub fn len(&self) -> usize {
        self.inodes.len()
    }

    pub fn get(&self, ino: u64) -> Option<&Inode> {
        self.inodes.get(&ino)
    }

    pub fn get_mut(&mut self, ino: u64) -> Option<&mut Inode> {
        self.inodes.get_mut(&ino)
    }

    /// Bump the LRU tick for an inode.
    pub fn touch(&mut self, ino: u64) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(inode) = self.inodes.get_mut(&ino) {
            inode.last_used = tick;
        }
    }

    pub fn find_child(&self, parent: u64, name: &str) -> Option<u64> {
        self.name_index.get(&(parent, name.to_string())).copied()
    }

    /// Insert a new child under `parent`, linking it into the parent's
    /// child list and the name index. Returns the new inode number.
    pub fn insert_child(&mut self, parent: u64, name: &str, node: Node) -> u64 {
        let ino = self.next_ino;
        self.next_ino += 1;
        self.tick += 1;
        let now = SystemTime::now();
        self.inodes.insert(
            ino,
            Inode {
                ino,
                parent,
                name: name.to_string(),
                node,
                lookups: 0,
                handles: 0,
                pinned: false,
                synced: false,
                state: NodeState::Live,
                last_used: self.tick,
                mtime: now,
                ctime: now,
                crtime: now,
            },
        );
        self.name_index.insert((parent, name.to_string()), ino);
        if let Some(dir) = self
            .inodes
            .get_mut(&parent)
            .and_then(|p| p.node.as_dir_mut())
        {
            dir.children.push(ino);
        }
        ino
    }

    /// Detach an inode from its parent. The node itself survives while
    /// handles or kernel lookups remain, marked `Unlinked`.
    pub fn unlink_entry(&mut self, ino: u64) {
        let (parent, name) = match self.inodes.get(&ino) {
            Some(inode) => (inode.parent, inode.name.clone()),
            None => return,
        };
        self.name_index.remove(&(parent, name));
        if let Some(dir) = self
            .inodes
            .get_mut(&parent)
            .and_then(|p| p.node.as_dir_mut())
        {
            dir.children.retain(|&c| c != ino);
        }
        if let Some(inode) = self.inodes.get_mut(&ino) {
            inode.state = NodeState::Unlinked;
        }
        self.remove_if_dead(ino);
    }

    /// Re-link an inode under a new parent and name. Index and child
    /// lists are updated; the caller handles permission checks.
    pub fn relink(&mut self, ino: u64, new_parent: u64, new_name: &str) {
        let (old_parent, old_name) = match self.inodes.get(&ino) {
            Some(inode) => (inode.parent, inode.name.clone()),
            None => return,
        };
        self.name_index.remove(&(old_parent, old_name));
        if let Some(dir) = self
            .inodes
            .get_mut(&old_parent)
            .and_then(|p| p.node.as_dir_mut())
        {
            dir.children.retain(|&c| c != ino);
        }
        self.name_index
            .insert((new_parent, new_name.to_string()), ino);
        if let Some(dir) = self
            .inodes
            .get_mut(&new_parent)
            .and_then(|p| p.node.as_dir_mut())
        {
            dir.children.push(ino);
        }
        if let Some(inode) = self.inodes.get_mut(&ino) {
            inode.parent = new_parent;
            inode.name = new_name.to_string();
            // The new path is unknown to the server until a flush lands.
            inode.synced = false;
            inode.ctime = SystemTime::now();
        }
    }

    /// Mark everything at and under `root` as present in the server's
    /// state, after a flush pushed the subtree's manifest.
    pub fn mark_subtree_synced(&mut self, root: u64) {
        let mut stack = vec![root];
        while let Some(ino) = stack.pop() {
            if let Some(inode) = self.inodes.get_mut(&ino) {
                inode.synced = true;
                if let Node::Directory(dir) = &inode.node {
                    stack.extend(dir.children.iter().copied());
                }
            }
        }
    }

    /// Balance kernel lookups; drops dead unlinked nodes.
    pub fn forget(&mut self, ino: u64, nlookups: u64) {
        if let Some(inode) = self.inodes.get_mut(&ino) {
            inode.lookups = inode.lookups.saturating_sub(nlookups);
        }
        self.remove_if_dead(ino);
    }

    /// Drop an unlinked inode once nothing references it.
    pub fn remove_if_dead(&mut self, ino: u64) {
        let dead = matches!(
            self.inodes.get(&ino),
            Some(inode)
                if inode.state == NodeState::Unlinked
                    && inode.lookups == 0
                    && inode.handles == 0
        );
        if dead {
            self.inodes.remove(&ino);
        }
    }

    /// Whether any file at or under `ino` has unflushed buffers.
    pub fn subtree_has_dirty(&self, ino: u64) -> bool {
        let mut stack = vec![ino];
        while let Some(cur) = stack.pop() {
            match self.inodes.get(&cur).map(|i| &i.node) {
                Some(Node::File(f)) => {
                    if f.dirty() {
                        return true;
                    }
                }
                Some(Node::Directory(dir)) => stack.extend(dir.children.iter().copied()),
                None => {}
            }
        }
        false
    }

    /// The inode of the collection root containing `ino`, if any,
    /// found by walking the parent chain.
    pub fn collection_root_of(&self, ino: u64) -> Option<u64> {
        let mut cur = ino;
        loop {
            let inode = self.inodes.get(&cur)?;
            if let Node::Directory(dir) = &inode.node {
                match dir.source {
                    DirSource::CollectionRoot(_) => return Some(cur),
                    DirSource::Collection { root } => return Some(root),
                    _ => {}
                }
            }
            if cur == ROOT_INO {
                return None;
            }
            cur = inode.parent;
        }
    }

    fn evictable(&self, inode: &Inode) -> bool {
        if inode.pinned || inode.lookups > 0 || inode.handles > 0 {
            return false;
        }
        match &inode.node {
            Node::File(f) => {
                if f.dirty() {
                    return false;
                }
            }
            Node::Directory(dir) => {
                if !dir.children.is_empty() {
                    return false;
                }
                if let DirSource::CollectionRoot(meta) = &dir.source {
                    if meta.dirty || meta.flushing {
                        return false;
                    }
                }
            }
        }
        // Nothing under a collection with unflushed changes may go:
        // flush serializes the manifest from these nodes.
        if let Some(root) = self.collection_root_of(inode.ino) {
            if let Some(meta) = self
                .inodes
                .get(&root)
                .and_then(|r| r.node.as_dir())
                .and_then(|d| d.source.collection_meta())
            {
                if meta.dirty || meta.flushing {
                    return false;
                }
            }
        }
        true
    }

    /// Evict least-recently-used clean, unreferenced nodes until the
    /// table is back within its cap. The parent of each evicted node is
    /// de-populated so a later listing rebuilds the entry.
    pub fn evict_excess(&mut self) {
        let floor = self.cap.max(self.min_entries);
        while self.inodes.len() > floor {
            let victim = self
                .inodes
                .values()
                .filter(|inode| self.evictable(inode))
                .min_by_key(|inode| inode.last_used)
                .map(|inode| inode.ino);
            let Some(ino) = victim else { break };
            self.evict(ino);
        }
    }

    fn evict(&mut self, ino: u64) {
        let Some(inode) = self.inodes.remove(&ino) else {
            return;
        };
        self.name_index.remove(&(inode.parent, inode.name.clone()));
        if let Some(dir) = self
            .inodes
            .get_mut(&inode.parent)
            .and_then(|p| p.node.as_dir_mut())
        {
            dir.children.retain(|&c| c != ino);
            dir.populated = false;
        }
    }
}
