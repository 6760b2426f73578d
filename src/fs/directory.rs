//! Directory variants and structural tree edits.
//!
//! Every directory inode carries a `DirSource` naming where its entries
//! come from: the fixed mount root, a collection manifest, or one of the
//! query-backed listings (tags, projects, shared owners, the by-id magic
//! directory). Structural edits are only legal inside writable
//! collections; listing directories change only when the backing store
//! does.

use crate::error::FsError;
use crate::fs::file::FileNode;
use crate::fs::inode::{InodeTable, Node};
use crate::manifest::ManifestTree;

// ── Sources ───────────────────────────────────────────────────────────────────

/// Collection identity and flush state, held by the collection's root
/// directory inode.
#[derive(Debug, Clone)]
pub struct CollectionMeta {
    /// None for collections mounted by portable data hash; those have
    /// no record to write back and are always read-only.
    pub uuid: Option<String>,
    pub portable_data_hash: String,
    pub version: u64,
    pub writable: bool,
    /// Local edits exist that have not reached the server.
    pub dirty: bool,
    /// A flush holds the collection's buffers; blocks further flushes
    /// and eviction beneath this root.
    pub flushing: bool,
}

/// Where a directory's entries come from.
#[derive(Debug, Clone)]
pub enum DirSource {
    /// The fixed top level: by_id, by_tag, home, shared.
    MountRoot,
    /// Root directory of a mounted collection.
    CollectionRoot(CollectionMeta),
    /// Subdirectory inside a collection; `root` is the collection's
    /// root inode.
    Collection { root: u64 },
    /// by_id: resolves UUIDs and portable data hashes on lookup.
    Magic { pdh_only: bool },
    /// by_tag, or one tag's listing of collections.
    Tags { tag: Option<String> },
    /// A project: child collections and subprojects.
    Project { owner_uuid: String },
    /// Owners with collections shared with the current user.
    Shared { exclude: Option<String> },
}

impl DirSource {
    pub fn collection_meta(&self) -> Option<&CollectionMeta> {
        match self {
            DirSource::CollectionRoot(meta) => Some(meta),
            _ => None,
        }
    }

    pub fn collection_meta_mut(&mut self) -> Option<&mut CollectionMeta> {
        match self {
            DirSource::CollectionRoot(meta) => Some(meta),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirNode {
    pub children: Vec<u64>,
    /// Whether `children` reflects the source. Listing directories are
    /// populated on first readdir and re-populated after invalidation.
    pub populated: bool,
    pub source: DirSource,
}

impl DirNode {
    pub fn new(source: DirSource) -> Self {
        Self {
            children: Vec::new(),
            populated: false,
            source,
        }
    }
}

/// One entry of a query-backed listing.
pub enum ListingEntry {
    Collection { name: String, meta: CollectionMeta },
    Project { name: String, owner_uuid: String },
    TagDir { name: String, tag: String },
}

impl ListingEntry {
    fn name(&self) -> &str {
        match self {
            ListingEntry::Collection { name, .. } => name,
            ListingEntry::Project { name, .. } => name,
            ListingEntry::TagDir { name, .. } => name,
        }
    }
}

/// Names usable as directory entries. Components with separators or
/// that alias the dot entries are rejected before they reach a manifest.
pub fn validate_name(name: &str) -> Result<(), FsError> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(FsError::InvalidName(name.to_string()));
    }
    if name.contains('/') || name.bytes().any(|b| b < 0x20) {
        return Err(FsError::InvalidName(name.to_string()));
    }
    Ok(())
}

// ── Structural edits ──────────────────────────────────────────────────────────

impl InodeTable {
    /// The collection root for a directory that accepts structural
    /// edits. `PermissionDenied` for listing directories and read-only
    /// collections.
    pub fn writable_collection_dir(&self, dir_ino: u64) -> Result<u64, FsError> {
        let dir = self
            .get(dir_ino)
            .and_then(|i| i.node.as_dir())
            .ok_or(FsError::NotFound)?;
        let root = match dir.source {
            DirSource::CollectionRoot(_) => dir_ino,
            DirSource::Collection { root } => root,
            _ => return Err(FsError::PermissionDenied),
        };
        let writable = self
            .get(root)
            .and_then(|i| i.node.as_dir())
            .and_then(|d| d.source.collection_meta())
            .map(|m| m.writable && m.uuid.is_some())
            .unwrap_or(false);
        if writable {
            Ok(root)
        } else {
            Err(FsError::PermissionDenied)
        }
    }

    /// Mark the collection containing `ino` as having unflushed edits.
    pub fn mark_collection_dirty(&mut self, ino: u64) {
        if let Some(root) = self.collection_root_of(ino) {
            if let Some(meta) = self
                .get_mut(root)
                .and_then(|i| i.node.as_dir_mut())
                .and_then(|d| d.source.collection_meta_mut())
            {
                meta.dirty = true;
            }
        }
    }

    /// Create an empty file in a writable collection directory.
    pub fn create_file(&mut self, parent: u64, name: &str) -> Result<u64, FsError> {
        self.writable_collection_dir(parent)?;
        validate_name(name)?;
        if self.find_child(parent, name).is_some() {
            return Err(FsError::AlreadyExists);
        }
        let ino = self.insert_child(parent, name, Node::File(FileNode::new()));
        self.mark_collection_dirty(parent);
        Ok(ino)
    }

    /// Create a subdirectory inside a writable collection.
    pub fn mkdir_in_collection(&mut self, parent: u64, name: &str) -> Result<u64, FsError> {
        let root = self.writable_collection_dir(parent)?;
        validate_name(name)?;
        if self.find_child(parent, name).is_some() {
            return Err(FsError::AlreadyExists);
        }
        let mut dir = DirNode::new(DirSource::Collection { root });
        dir.populated = true;
        let ino = self.insert_child(parent, name, Node::Directory(dir));
        self.mark_collection_dirty(parent);
        Ok(ino)
    }

    /// Remove a file from a writable collection directory. The node
    /// survives unlinked while handles remain open.
    pub fn unlink_file(&mut self, parent: u64, name: &str) -> Result<(), FsError> {
        self.writable_collection_dir(parent)?;
        let ino = self.find_child(parent, name).ok_or(FsError::NotFound)?;
        if self.get(ino).map(|i| i.is_dir()).unwrap_or(false) {
            return Err(FsError::PermissionDenied);
        }
        self.mark_collection_dirty(parent);
        self.unlink_entry(ino);
        Ok(())
    }

    /// Remove an empty subdirectory inside a writable collection.
    pub fn rmdir_in_collection(&mut self, parent: u64, name: &str) -> Result<(), FsError> {
        self.writable_collection_dir(parent)?;
        let ino = self.find_child(parent, name).ok_or(FsError::NotFound)?;
        let dir = self
            .get(ino)
            .and_then(|i| i.node.as_dir())
            .ok_or(FsError::PermissionDenied)?;
        if !dir.children.is_empty() {
            return Err(FsError::NotEmpty);
        }
        self.mark_collection_dirty(parent);
        self.unlink_entry(ino);
        Ok(())
    }

    /// Move or rename an entry between writable collection directories.
    /// An existing compatible target is replaced; moving a directory
    /// across collections re-roots its whole subtree.
    pub fn rename_entry(
        &mut self,
        old_parent: u64,
        old_name: &str,
        new_parent: u64,
        new_name: &str,
    ) -> Result<(), FsError> {
        let src_root = self.writable_collection_dir(old_parent)?;
        let dst_root = self.writable_collection_dir(new_parent)?;
        validate_name(new_name)?;
        let ino = self
            .find_child(old_parent, old_name)
            .ok_or(FsError::NotFound)?;
        let src_is_dir = self.get(ino).map(|i| i.is_dir()).unwrap_or(false);

        if let Some(target) = self.find_child(new_parent, new_name) {
            if target == ino {
                return Ok(());
            }
            let target_is_dir = self.get(target).map(|i| i.is_dir()).unwrap_or(false);
            if target_is_dir != src_is_dir {
                return Err(FsError::AlreadyExists);
            }
            if target_is_dir {
                let empty = self
                    .get(target)
                    .and_then(|i| i.node.as_dir())
                    .map(|d| d.children.is_empty())
                    .unwrap_or(true);
                if !empty {
                    return Err(FsError::NotEmpty);
                }
            }
            self.unlink_entry(target);
        }

        self.relink(ino, new_parent, new_name);
        if src_is_dir && src_root != dst_root {
            self.reroot_subtree(ino, dst_root);
        }
        self.mark_collection_dirty(old_parent);
        if dst_root != src_root {
            self.mark_collection_dirty(new_parent);
        }
        Ok(())
    }

    /// Point every collection subdirectory under `ino` (inclusive) at
    /// a new collection root.
    fn reroot_subtree(&mut self, ino: u64, new_root: u64) {
        let mut stack = vec![ino];
        while let Some(cur) = stack.pop() {
            if let Some(dir) = self.get_mut(cur).and_then(|i| i.node.as_dir_mut()) {
                if let DirSource::Collection { root } = &mut dir.source {
                    *root = new_root;
                }
                stack.extend(dir.children.iter().copied());
            }
        }
    }

    // ── Population ────────────────────────────────────────────────────────

    /// Materialize a decoded manifest under a collection root, reusing
    /// inode numbers for entries that kept their name. Files with
    /// unflushed local edits are left untouched; entries absent from
    /// the manifest are unlinked.
    pub fn apply_collection_tree(&mut self, root_ino: u64, tree: &ManifestTree) {
        self.apply_tree_dir(root_ino, root_ino, tree);
    }

    fn apply_tree_dir(&mut self, dir_ino: u64, root: u64, tree: &ManifestTree) {
        let existing: Vec<u64> = self
            .get(dir_ino)
            .and_then(|i| i.node.as_dir())
            .map(|d| d.children.clone())
            .unwrap_or_default();
        for child_ino in existing {
            let Some(child) = self.get(child_ino) else { continue };
            let keep = match &child.node {
                Node::File(f) => f.dirty() || tree.files.contains_key(&child.name),
                Node::Directory(_) => {
                    tree.dirs.contains_key(&child.name) || self.subtree_has_dirty(child_ino)
                }
            };
            if !keep {
                self.unlink_children(child_ino);
                self.unlink_entry(child_ino);
            }
        }

        for (name, segments) in &tree.files {
            let ino = match self.find_child(dir_ino, name) {
                Some(ino) => {
                    let replace_dir = self.get(ino).map(|i| i.is_dir()).unwrap_or(false);
                    if replace_dir {
                        self.unlink_entry(ino);
                        self.insert_child(
                            dir_ino,
                            name,
                            Node::File(FileNode::from_stream_segments(segments.clone())),
                        )
                    } else {
                        if let Some(f) =
                            self.get_mut(ino).and_then(|i| i.node.as_file_mut())
                        {
                            if !f.dirty() {
                                *f = FileNode::from_stream_segments(segments.clone());
                            }
                        }
                        ino
                    }
                }
                None => self.insert_child(
                    dir_ino,
                    name,
                    Node::File(FileNode::from_stream_segments(segments.clone())),
                ),
            };
            // The manifest names this path, so the server has it.
            if let Some(inode) = self.get_mut(ino) {
                inode.synced = true;
            }
        }

        for (name, subtree) in &tree.dirs {
            let ino = match self.find_child(dir_ino, name) {
                Some(ino) if self.get(ino).map(|i| i.is_dir()).unwrap_or(false) => ino,
                Some(stale) => {
                    self.unlink_entry(stale);
                    self.insert_child(
                        dir_ino,
                        name,
                        Node::Directory(DirNode::new(DirSource::Collection { root })),
                    )
                }
                None => self.insert_child(
                    dir_ino,
                    name,
                    Node::Directory(DirNode::new(DirSource::Collection { root })),
                ),
            };
            if let Some(inode) = self.get_mut(ino) {
                inode.synced = true;
            }
            self.apply_tree_dir(ino, root, subtree);
        }

        if let Some(dir) = self.get_mut(dir_ino).and_then(|i| i.node.as_dir_mut()) {
            dir.populated = true;
        }
    }

    /// Reconcile a listing directory with fresh query results. Entries
    /// keep their inode numbers across refreshes; collections whose
    /// content hash moved are de-populated so the next read refetches
    /// the manifest. Dirty collections keep their local state.
    pub fn apply_listing(&mut self, parent: u64, entries: Vec<ListingEntry>) {
        let fresh: std::collections::HashSet<&str> =
            entries.iter().map(|e| e.name()).collect();
        let existing: Vec<u64> = self
            .get(parent)
            .and_then(|i| i.node.as_dir())
            .map(|d| d.children.clone())
            .unwrap_or_default();
        for child_ino in existing {
            let Some(child) = self.get(child_ino) else { continue };
            if fresh.contains(child.name.as_str()) {
                continue;
            }
            let protected = child
                .node
                .as_dir()
                .and_then(|d| d.source.collection_meta())
                .map(|m| m.dirty || m.flushing)
                .unwrap_or(false);
            if !protected {
                self.unlink_children(child_ino);
                self.unlink_entry(child_ino);
            }
        }

        for entry in entries {
            match entry {
                ListingEntry::Collection { name, meta } => {
                    self.apply_collection_entry(parent, &name, meta);
                }
                ListingEntry::Project { name, owner_uuid } => {
                    if self.find_child(parent, &name).is_none() {
                        self.insert_child(
                            parent,
                            &name,
                            Node::Directory(DirNode::new(DirSource::Project { owner_uuid })),
                        );
                    }
                }
                ListingEntry::TagDir { name, tag } => {
                    if self.find_child(parent, &name).is_none() {
                        self.insert_child(
                            parent,
                            &name,
                            Node::Directory(DirNode::new(DirSource::Tags {
                                tag: Some(tag),
                            })),
                        );
                    }
                }
            }
        }

        if let Some(dir) = self.get_mut(parent).and_then(|i| i.node.as_dir_mut()) {
            dir.populated = true;
        }
    }

    fn apply_collection_entry(&mut self, parent: u64, name: &str, meta: CollectionMeta) {
        match self.find_child(parent, name) {
            None => {
                self.insert_child(
                    parent,
                    name,
                    Node::Directory(DirNode::new(DirSource::CollectionRoot(meta))),
                );
            }
            Some(ino) => {
                let current = self
                    .get(ino)
                    .and_then(|i| i.node.as_dir())
                    .and_then(|d| d.source.collection_meta())
                    .cloned();
                match current {
                    Some(local) if local.dirty || local.flushing => {}
                    // Tag listings carry no content hash; nothing to
                    // compare, the per-collection refresh handles it.
                    Some(_) if meta.portable_data_hash.is_empty() => {}
                    Some(local) if local.portable_data_hash == meta.portable_data_hash => {
                        if let Some(m) = self
                            .get_mut(ino)
                            .and_then(|i| i.node.as_dir_mut())
                            .and_then(|d| d.source.collection_meta_mut())
                        {
                            m.version = meta.version;
                        }
                    }
                    Some(_) => {
                        // Content moved remotely; drop the cached tree.
                        self.unlink_children(ino);
                        if let Some(dir) =
                            self.get_mut(ino).and_then(|i| i.node.as_dir_mut())
                        {
                            dir.populated = false;
                            dir.source = DirSource::CollectionRoot(meta);
                        }
                    }
                    None => {
                        // Name collision with a non-collection node.
                        self.unlink_entry(ino);
                        self.insert_child(
                            parent,
                            name,
                            Node::Directory(DirNode::new(DirSource::CollectionRoot(meta))),
                        );
                    }
                }
            }
        }
    }

    /// Unlink every descendant of a directory, depth first.
    pub fn unlink_children(&mut self, dir_ino: u64) {
        let children: Vec<u64> = self
            .get(dir_ino)
            .and_then(|i| i.node.as_dir())
            .map(|d| d.children.clone())
            .unwrap_or_default();
        for child in children {
            self.unlink_children(child);
            self.unlink_entry(child);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::inode::ROOT_INO;
    use crate::manifest;

    fn table() -> InodeTable {
        InodeTable::new(DirSource::MountRoot, 4096, 128)
    }

    fn writable_meta() -> CollectionMeta {
        CollectionMeta {
            uuid: Some("zzzzz-0000-000000000000001".to_string()),
            portable_data_hash: manifest::portable_data_hash(""),
            version: 1,
            writable: true,
            dirty: false,
            flushing: false,
        }
    }

    fn add_collection(t: &mut InodeTable, name: &str, meta: CollectionMeta) -> u64 {
        let mut dir = DirNode::new(DirSource::CollectionRoot(meta));
        dir.populated = true;
        t.insert_child(ROOT_INO, name, Node::Directory(dir))
    }

    fn is_dirty(t: &InodeTable, root: u64) -> bool {
        t.get(root)
            .unwrap()
            .node
            .as_dir()
            .unwrap()
            .source
            .collection_meta()
            .unwrap()
            .dirty
    }

    #[test]
    fn test_create_file_marks_collection_dirty() {
        let mut t = table();
        let coll = add_collection(&mut t, "c", writable_meta());
        let ino = t.create_file(coll, "note.txt").unwrap();
        assert_eq!(t.find_child(coll, "note.txt"), Some(ino));
        assert!(is_dirty(&t, coll));
    }

    #[test]
    fn test_create_file_rejects_duplicates_and_bad_names() {
        let mut t = table();
        let coll = add_collection(&mut t, "c", writable_meta());
        t.create_file(coll, "a").unwrap();
        assert!(matches!(
            t.create_file(coll, "a"),
            Err(FsError::AlreadyExists)
        ));
        assert!(matches!(
            t.create_file(coll, ".."),
            Err(FsError::InvalidName(_))
        ));
        assert!(matches!(
            t.create_file(coll, "x/y"),
            Err(FsError::InvalidName(_))
        ));
    }

    #[test]
    fn test_create_file_in_readonly_collection_denied() {
        let mut t = table();
        let mut meta = writable_meta();
        meta.writable = false;
        let coll = add_collection(&mut t, "c", meta);
        assert!(matches!(
            t.create_file(coll, "a"),
            Err(FsError::PermissionDenied)
        ));
    }

    #[test]
    fn test_create_file_in_listing_dir_denied() {
        let mut t = table();
        let tags = t.insert_child(
            ROOT_INO,
            "by_tag",
            Node::Directory(DirNode::new(DirSource::Tags { tag: None })),
        );
        assert!(matches!(
            t.create_file(tags, "a"),
            Err(FsError::PermissionDenied)
        ));
    }

    #[test]
    fn test_pdh_mounted_collection_is_readonly() {
        let mut t = table();
        let mut meta = writable_meta();
        meta.uuid = None;
        let coll = add_collection(&mut t, "c", meta);
        assert!(matches!(
            t.create_file(coll, "a"),
            Err(FsError::PermissionDenied)
        ));
    }

    #[test]
    fn test_rmdir_nonempty_denied() {
        let mut t = table();
        let coll = add_collection(&mut t, "c", writable_meta());
        let sub = t.mkdir_in_collection(coll, "sub").unwrap();
        t.create_file(sub, "f").unwrap();
        assert!(matches!(
            t.rmdir_in_collection(coll, "sub"),
            Err(FsError::NotEmpty)
        ));
        t.unlink_file(sub, "f").unwrap();
        t.rmdir_in_collection(coll, "sub").unwrap();
        assert_eq!(t.find_child(coll, "sub"), None);
    }

    #[test]
    fn test_rename_within_collection() {
        let mut t = table();
        let coll = add_collection(&mut t, "c", writable_meta());
        let ino = t.create_file(coll, "old").unwrap();
        t.rename_entry(coll, "old", coll, "new").unwrap();
        assert_eq!(t.find_child(coll, "new"), Some(ino));
        assert_eq!(t.find_child(coll, "old"), None);
    }

    #[test]
    fn test_rename_replaces_existing_file() {
        let mut t = table();
        let coll = add_collection(&mut t, "c", writable_meta());
        let src = t.create_file(coll, "src").unwrap();
        let dst = t.create_file(coll, "dst").unwrap();
        t.rename_entry(coll, "src", coll, "dst").unwrap();
        assert_eq!(t.find_child(coll, "dst"), Some(src));
        assert!(t.get(dst).is_none());
    }

    #[test]
    fn test_rename_dir_across_collections_reroots() {
        let mut t = table();
        let a = add_collection(&mut t, "a", writable_meta());
        let mut meta_b = writable_meta();
        meta_b.uuid = Some("zzzzz-0000-000000000000002".to_string());
        let b = add_collection(&mut t, "b", meta_b);

        let sub = t.mkdir_in_collection(a, "sub").unwrap();
        let inner = t.mkdir_in_collection(sub, "inner").unwrap();
        t.create_file(inner, "f").unwrap();

        t.rename_entry(a, "sub", b, "sub").unwrap();
        assert_eq!(t.collection_root_of(sub), Some(b));
        assert_eq!(t.collection_root_of(inner), Some(b));
        assert!(is_dirty(&t, a));
        assert!(is_dirty(&t, b));
    }

    #[test]
    fn test_apply_collection_tree_populates_and_reuses_inos() {
        let mut t = table();
        let coll = add_collection(&mut t, "c", writable_meta());
        let tree = manifest::parse(
            ". 37b51d194a7513e45b56f6524f2d51f2+3 0:3:bar.txt\n./sub 37b51d194a7513e45b56f6524f2d51f2+3 0:3:baz.txt\n",
        )
        .unwrap();
        t.apply_collection_tree(coll, &tree);
        let bar = t.find_child(coll, "bar.txt").unwrap();
        let sub = t.find_child(coll, "sub").unwrap();
        assert!(t.find_child(sub, "baz.txt").is_some());

        // Re-apply keeps inode numbers stable
        t.apply_collection_tree(coll, &tree);
        assert_eq!(t.find_child(coll, "bar.txt"), Some(bar));
        assert_eq!(t.find_child(coll, "sub"), Some(sub));
    }

    #[test]
    fn test_apply_collection_tree_drops_absent_keeps_dirty() {
        let mut t = table();
        let coll = add_collection(&mut t, "c", writable_meta());
        let gone = t.create_file(coll, "gone").unwrap();
        let edited = t.create_file(coll, "edited").unwrap();
        t.get_mut(edited)
            .unwrap()
            .node
            .as_file_mut()
            .unwrap()
            .write(0, b"local");

        let tree = manifest::parse(
            ". 37b51d194a7513e45b56f6524f2d51f2+3 0:3:kept.txt\n",
        )
        .unwrap();
        t.apply_collection_tree(coll, &tree);
        assert!(t.get(gone).is_none());
        assert_eq!(t.find_child(coll, "edited"), Some(edited));
        assert!(t.find_child(coll, "kept.txt").is_some());
    }

    #[test]
    fn test_apply_listing_adds_and_removes() {
        let mut t = table();
        let tags = t.insert_child(
            ROOT_INO,
            "by_tag",
            Node::Directory(DirNode::new(DirSource::Tags { tag: None })),
        );
        t.apply_listing(
            tags,
            vec![
                ListingEntry::TagDir {
                    name: "alpha".to_string(),
                    tag: "alpha".to_string(),
                },
                ListingEntry::TagDir {
                    name: "beta".to_string(),
                    tag: "beta".to_string(),
                },
            ],
        );
        let alpha = t.find_child(tags, "alpha").unwrap();
        assert!(t.find_child(tags, "beta").is_some());

        t.apply_listing(
            tags,
            vec![ListingEntry::TagDir {
                name: "alpha".to_string(),
                tag: "alpha".to_string(),
            }],
        );
        assert_eq!(t.find_child(tags, "alpha"), Some(alpha));
        assert_eq!(t.find_child(tags, "beta"), None);
    }

    #[test]
    fn test_apply_listing_depopulates_changed_collection() {
        let mut t = table();
        let home = t.insert_child(
            ROOT_INO,
            "home",
            Node::Directory(DirNode::new(DirSource::Project {
                owner_uuid: "u".to_string(),
            })),
        );
        t.apply_listing(
            home,
            vec![ListingEntry::Collection {
                name: "c".to_string(),
                meta: writable_meta(),
            }],
        );
        let coll = t.find_child(home, "c").unwrap();
        let tree = manifest::parse(
            ". 37b51d194a7513e45b56f6524f2d51f2+3 0:3:f.txt\n",
        )
        .unwrap();
        t.apply_collection_tree(coll, &tree);
        assert!(t.find_child(coll, "f.txt").is_some());

        let mut changed = writable_meta();
        changed.portable_data_hash = manifest::portable_data_hash("x");
        changed.version = 2;
        t.apply_listing(
            home,
            vec![ListingEntry::Collection {
                name: "c".to_string(),
                meta: changed,
            }],
        );
        assert_eq!(t.find_child(home, "c"), Some(coll));
        let dir = t.get(coll).unwrap().node.as_dir().unwrap();
        assert!(!dir.populated);
        assert!(dir.children.is_empty());
    }

    #[test]
    fn test_apply_listing_without_content_hash_keeps_tree() {
        let mut t = table();
        let tag = t.insert_child(
            ROOT_INO,
            "alpha",
            Node::Directory(DirNode::new(DirSource::Tags {
                tag: Some("alpha".to_string()),
            })),
        );
        t.apply_listing(
            tag,
            vec![ListingEntry::Collection {
                name: "c".to_string(),
                meta: writable_meta(),
            }],
        );
        let coll = t.find_child(tag, "c").unwrap();
        let tree = manifest::parse(
            ". 37b51d194a7513e45b56f6524f2d51f2+3 0:3:f.txt\n",
        )
        .unwrap();
        t.apply_collection_tree(coll, &tree);

        // A refresh whose entries carry no hash must not invalidate
        let mut blank = writable_meta();
        blank.portable_data_hash = String::new();
        blank.version = 0;
        t.apply_listing(
            tag,
            vec![ListingEntry::Collection {
                name: "c".to_string(),
                meta: blank,
            }],
        );
        let dir = t.get(coll).unwrap().node.as_dir().unwrap();
        assert!(dir.populated);
        assert!(t.find_child(coll, "f.txt").is_some());
        let meta = dir.source.collection_meta().unwrap();
        assert_eq!(meta.portable_data_hash, manifest::portable_data_hash(""));
    }

    #[test]
    fn test_apply_listing_keeps_dirty_collection() {
        let mut t = table();
        let home = t.insert_child(
            ROOT_INO,
            "home",
            Node::Directory(DirNode::new(DirSource::Project {
                owner_uuid: "u".to_string(),
            })),
        );
        t.apply_listing(
            home,
            vec![ListingEntry::Collection {
                name: "c".to_string(),
                meta: writable_meta(),
            }],
        );
        let coll = t.find_child(home, "c").unwrap();
        t.create_file(coll, "local").unwrap();

        // Collection is gone from the remote listing but has local edits
        t.apply_listing(home, vec![]);
        assert_eq!(t.find_child(home, "c"), Some(coll));
        assert!(t.find_child(coll, "local").is_some());
    }
}
