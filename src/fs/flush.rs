//! Write-back engine: uploads buffered file content as blocks, rebuilds
//! the collection manifest, and pushes it with a version check. A
//! rejected push merges the remote tree into the local one; local edits
//! keep their names and the remote copies land beside them under
//! conflict names.
//!
//! Network calls run with the structural lock released. Everything read
//! before an unlock is re-validated after the relock.

use std::collections::HashSet;
use std::sync::Mutex;

use log::{debug, info, warn};

use crate::backend::Backend;
use crate::error::FsError;
use crate::fs::inode::{InodeTable, Node};
use crate::fs::MountState;
use crate::manifest::{self, BlockLocator, ManifestTree};

/// Serialize the subtree under a collection root. Fails with `Stale`
/// when a dirty file is found; callers commit buffers first.
pub fn build_manifest_tree(table: &InodeTable, root_ino: u64) -> Result<ManifestTree, FsError> {
    build_tree_dir(table, root_ino)
}

fn build_tree_dir(table: &InodeTable, dir_ino: u64) -> Result<ManifestTree, FsError> {
    let mut tree = ManifestTree::default();
    let children = table
        .get(dir_ino)
        .and_then(|i| i.node.as_dir())
        .map(|d| d.children.clone())
        .unwrap_or_default();
    for child_ino in children {
        let Some(child) = table.get(child_ino) else { continue };
        match &child.node {
            Node::File(f) => {
                if f.dirty() {
                    return Err(FsError::Stale);
                }
                tree.files.insert(child.name.clone(), f.stream_segments());
            }
            Node::Directory(_) => {
                tree.dirs
                    .insert(child.name.clone(), build_tree_dir(table, child_ino)?);
            }
        }
    }
    Ok(tree)
}

/// Flush one collection's unflushed edits to the backing store.
///
/// Returns Ok both on a clean push and on a resolved conflict; in the
/// conflict case the merged tree stays dirty for the next flush.
pub fn flush_collection(
    state: &Mutex<MountState>,
    backend: &dyn Backend,
    root_ino: u64,
) -> Result<(), FsError> {
    // Phase 1: claim the flush and plan block uploads.
    let (uploads, uuid) = {
        let mut st = state.lock().unwrap();
        let meta = st
            .inodes
            .get(root_ino)
            .and_then(|i| i.node.as_dir())
            .and_then(|d| d.source.collection_meta())
            .ok_or(FsError::NotFound)?;
        if !meta.dirty || meta.flushing {
            return Ok(());
        }
        let uuid = meta.uuid.clone().ok_or(FsError::PermissionDenied)?;
        set_flushing(&mut st.inodes, root_ino, true);
        (collect_uploads(&st.inodes, root_ino), uuid)
    };

    // Phase 2: upload buffers, lock released.
    let mut committed: Vec<(u64, u64, BlockLocator)> = Vec::new();
    for (ino, generation, data) in uploads {
        match backend.put_block(&data) {
            Ok(locator) => committed.push((ino, generation, locator)),
            Err(err) => {
                let mut st = state.lock().unwrap();
                set_flushing(&mut st.inodes, root_ino, false);
                return Err(err);
            }
        }
    }

    // Phase 3: commit uploaded buffers and serialize the manifest.
    let (text, version) = {
        let mut st = state.lock().unwrap();
        for (ino, generation, locator) in &committed {
            if let Some(f) = st.inodes.get_mut(*ino).and_then(|i| i.node.as_file_mut()) {
                if f.write_generation == *generation {
                    f.commit_buffers(locator);
                } else {
                    debug!("file {ino} changed during upload, keeping buffers");
                }
            }
        }
        let tree = match build_manifest_tree(&st.inodes, root_ino) {
            Ok(tree) => tree,
            Err(err) => {
                // A write raced the upload; the next flush picks it up.
                set_flushing(&mut st.inodes, root_ino, false);
                return Err(err);
            }
        };
        let version = st
            .inodes
            .get(root_ino)
            .and_then(|i| i.node.as_dir())
            .and_then(|d| d.source.collection_meta())
            .map(|m| m.version);
        let Some(version) = version else {
            // The root stopped being a collection while unlocked.
            set_flushing(&mut st.inodes, root_ino, false);
            return Err(FsError::NotFound);
        };
        (manifest::encode(&tree), version)
    };

    // Phase 4: conditional manifest replacement.
    match backend.update_collection(&uuid, &text, version) {
        Ok(record) => {
            let mut st = state.lock().unwrap();
            let still_dirty = st.inodes.subtree_has_dirty(root_ino);
            // Every linked entry is in the pushed manifest now.
            st.inodes.mark_subtree_synced(root_ino);
            if let Some(meta) = collection_meta_mut(&mut st.inodes, root_ino) {
                meta.version = record.version;
                meta.portable_data_hash = record.portable_data_hash;
                meta.dirty = still_dirty;
                meta.flushing = false;
            }
            info!("flushed collection {uuid} at version {}", record.version);
            Ok(())
        }
        Err(FsError::Conflict) => {
            warn!("conflict flushing collection {uuid}, merging remote changes");
            let fetched = backend.get_collection(&uuid).and_then(|record| {
                let tree = manifest::parse(&record.manifest_text)?;
                Ok((record, tree))
            });
            let (remote, remote_tree) = match fetched {
                Ok(v) => v,
                Err(err) => {
                    let mut st = state.lock().unwrap();
                    set_flushing(&mut st.inodes, root_ino, false);
                    return Err(err);
                }
            };
            // Buffers committed in this flush are local edits even
            // though they no longer read as dirty.
            let touched: HashSet<u64> = committed.iter().map(|(ino, _, _)| *ino).collect();
            let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S").to_string();
            let mut st = state.lock().unwrap();
            merge_remote(&mut st.inodes, root_ino, &remote_tree, &stamp, &touched);
            if let Some(meta) = collection_meta_mut(&mut st.inodes, root_ino) {
                meta.version = remote.version;
                meta.portable_data_hash = remote.portable_data_hash;
                meta.dirty = true;
                meta.flushing = false;
            }
            Ok(())
        }
        Err(err) => {
            let mut st = state.lock().unwrap();
            set_flushing(&mut st.inodes, root_ino, false);
            Err(err)
        }
    }
}

fn collection_meta_mut(
    table: &mut InodeTable,
    root_ino: u64,
) -> Option<&mut crate::fs::directory::CollectionMeta> {
    table
        .get_mut(root_ino)
        .and_then(|i| i.node.as_dir_mut())
        .and_then(|d| d.source.collection_meta_mut())
}

fn set_flushing(table: &mut InodeTable, root_ino: u64, flushing: bool) {
    if let Some(meta) = collection_meta_mut(table, root_ino) {
        meta.flushing = flushing;
    }
}

/// (ino, write_generation, concatenated buffer bytes) for every dirty
/// file under the root.
fn collect_uploads(table: &InodeTable, root_ino: u64) -> Vec<(u64, u64, Vec<u8>)> {
    let mut out = Vec::new();
    let mut stack = vec![root_ino];
    while let Some(ino) = stack.pop() {
        let Some(inode) = table.get(ino) else { continue };
        match &inode.node {
            Node::File(f) => {
                if f.dirty() {
                    out.push((ino, f.write_generation, f.collect_buffers()));
                }
            }
            Node::Directory(dir) => stack.extend(dir.children.iter().copied()),
        }
    }
    out
}

// ── Conflict merge ────────────────────────────────────────────────────────────

/// First free conflict name for `name` in `dir_ino`.
fn conflict_name(table: &InodeTable, dir_ino: u64, name: &str, stamp: &str) -> String {
    let base = format!("{name}~{stamp}~conflict~");
    if table.find_child(dir_ino, &base).is_none() {
        return base;
    }
    let mut n = 2u32;
    loop {
        let candidate = format!("{base}{n}");
        if table.find_child(dir_ino, &candidate).is_none() {
            return candidate;
        }
        n += 1;
    }
}

/// Whether anything at or under `ino` exists only locally or carries a
/// local edit: a path the server never acknowledged, an uncommitted
/// buffer, or a buffer committed by the flush that just lost the race.
fn subtree_holds_local(table: &InodeTable, ino: u64, touched: &HashSet<u64>) -> bool {
    let Some(inode) = table.get(ino) else { return false };
    if !inode.synced || touched.contains(&ino) {
        return true;
    }
    match &inode.node {
        Node::File(f) => f.dirty(),
        Node::Directory(dir) => dir
            .children
            .iter()
            .any(|c| subtree_holds_local(table, *c, touched)),
    }
}

/// Fold a freshly fetched remote tree into the local one after a
/// rejected push. Remote deletions win only for entries the server
/// already had; local-only entries and locally edited files keep their
/// names, and colliding remote content of different bytes is added
/// under a conflict name. `touched` names the files whose buffers were
/// committed by the losing flush.
pub fn merge_remote(
    table: &mut InodeTable,
    root_ino: u64,
    remote: &ManifestTree,
    stamp: &str,
    touched: &HashSet<u64>,
) {
    merge_dir(table, root_ino, root_ino, remote, stamp, touched);
}

fn merge_dir(
    table: &mut InodeTable,
    dir_ino: u64,
    root: u64,
    tree: &ManifestTree,
    stamp: &str,
    touched: &HashSet<u64>,
) {
    use crate::fs::directory::{DirNode, DirSource};
    use crate::fs::file::FileNode;

    // Remote deletions first, so conflict copies inserted below are
    // not mistaken for stale local entries.
    let existing: Vec<u64> = table
        .get(dir_ino)
        .and_then(|i| i.node.as_dir())
        .map(|d| d.children.clone())
        .unwrap_or_default();
    for child_ino in existing {
        let Some(child) = table.get(child_ino) else { continue };
        let in_remote = match &child.node {
            Node::File(_) => tree.files.contains_key(&child.name),
            Node::Directory(_) => tree.dirs.contains_key(&child.name),
        };
        if !in_remote && !subtree_holds_local(table, child_ino, touched) {
            table.unlink_children(child_ino);
            table.unlink_entry(child_ino);
        }
    }

    for (name, segments) in &tree.files {
        match table.find_child(dir_ino, name) {
            None => {
                let ino = table.insert_child(
                    dir_ino,
                    name,
                    Node::File(FileNode::from_stream_segments(segments.clone())),
                );
                if let Some(inode) = table.get_mut(ino) {
                    inode.synced = true;
                }
            }
            Some(ino) => {
                enum Collision {
                    // Both sides hold the same committed segments.
                    Identical,
                    // Clean server-acknowledged entry; remote replaces it.
                    Adopt,
                    // Local content keeps the name; remote lands beside.
                    Conflict,
                }
                let collision = match table.get(ino) {
                    Some(inode) => match &inode.node {
                        Node::File(f) if !f.dirty() && f.stream_segments() == *segments => {
                            Collision::Identical
                        }
                        Node::File(f)
                            if f.dirty() || touched.contains(&ino) || !inode.synced =>
                        {
                            Collision::Conflict
                        }
                        Node::File(_) => Collision::Adopt,
                        // A local directory holds the name.
                        Node::Directory(_) => Collision::Conflict,
                    },
                    None => Collision::Adopt,
                };
                match collision {
                    Collision::Identical => {
                        if let Some(inode) = table.get_mut(ino) {
                            inode.synced = true;
                        }
                    }
                    Collision::Adopt => {
                        if let Some(f) =
                            table.get_mut(ino).and_then(|i| i.node.as_file_mut())
                        {
                            *f = FileNode::from_stream_segments(segments.clone());
                        }
                    }
                    Collision::Conflict => {
                        let cname = conflict_name(table, dir_ino, name, stamp);
                        table.insert_child(
                            dir_ino,
                            &cname,
                            Node::File(FileNode::from_stream_segments(segments.clone())),
                        );
                    }
                }
            }
        }
    }

    for (name, subtree) in &tree.dirs {
        let ino = match table.find_child(dir_ino, name) {
            Some(ino) if table.get(ino).map(|i| i.is_dir()).unwrap_or(false) => ino,
            Some(file_ino) => {
                // A local file holds a name the remote turned into a
                // directory; local content moves to a conflict name.
                if subtree_holds_local(table, file_ino, touched) {
                    let cname = conflict_name(table, dir_ino, name, stamp);
                    table.relink(file_ino, dir_ino, &cname);
                } else {
                    table.unlink_entry(file_ino);
                }
                let mut dir = DirNode::new(DirSource::Collection { root });
                dir.populated = true;
                table.insert_child(dir_ino, name, Node::Directory(dir))
            }
            None => {
                let mut dir = DirNode::new(DirSource::Collection { root });
                dir.populated = true;
                table.insert_child(dir_ino, name, Node::Directory(dir))
            }
        };
        if let Some(inode) = table.get_mut(ino) {
            inode.synced = true;
        }
        merge_dir(table, ino, root, subtree, stamp, touched);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::directory::{CollectionMeta, DirNode, DirSource};
    use crate::fs::inode::ROOT_INO;

    fn table() -> InodeTable {
        InodeTable::new(DirSource::MountRoot, 4096, 128)
    }

    fn add_collection(t: &mut InodeTable, name: &str) -> u64 {
        let mut dir = DirNode::new(DirSource::CollectionRoot(CollectionMeta {
            uuid: Some("zzzzz-0000-000000000000001".to_string()),
            portable_data_hash: manifest::portable_data_hash(""),
            version: 1,
            writable: true,
            dirty: false,
            flushing: false,
        }));
        dir.populated = true;
        t.insert_child(ROOT_INO, name, Node::Directory(dir))
    }

    #[test]
    fn test_build_manifest_tree_round_trips() {
        let mut t = table();
        let coll = add_collection(&mut t, "c");
        let text = ". 37b51d194a7513e45b56f6524f2d51f2+3 0:3:bar.txt\n\
                    ./sub 37b51d194a7513e45b56f6524f2d51f2+3 0:3:baz.txt\n";
        let tree = manifest::parse(text).unwrap();
        t.apply_collection_tree(coll, &tree);

        let rebuilt = build_manifest_tree(&t, coll).unwrap();
        assert_eq!(rebuilt, tree);
    }

    #[test]
    fn test_build_manifest_tree_rejects_dirty_file() {
        let mut t = table();
        let coll = add_collection(&mut t, "c");
        let ino = t.create_file(coll, "f").unwrap();
        t.get_mut(ino)
            .unwrap()
            .node
            .as_file_mut()
            .unwrap()
            .write(0, b"x");
        assert!(matches!(build_manifest_tree(&t, coll), Err(FsError::Stale)));
    }

    #[test]
    fn test_build_manifest_tree_serializes_empty_file() {
        let mut t = table();
        let coll = add_collection(&mut t, "c");
        t.create_file(coll, "empty").unwrap();
        let tree = build_manifest_tree(&t, coll).unwrap();
        assert_eq!(tree.files.get("empty"), Some(&Vec::new()));
        let text = manifest::encode(&tree);
        assert!(text.contains(manifest::EMPTY_BLOCK_LOCATOR));
        assert!(text.contains("0:0:empty"));
    }

    #[test]
    fn test_merge_keeps_local_name_and_adds_conflict_copy() {
        let mut t = table();
        let coll = add_collection(&mut t, "c");
        let local = t.create_file(coll, "file1.txt").unwrap();
        t.get_mut(local)
            .unwrap()
            .node
            .as_file_mut()
            .unwrap()
            .write(0, b"bar");

        let remote = manifest::parse(
            ". acbd18db4cc2f85cedef654fccc4a4d8+3 0:3:file1.txt\n",
        )
        .unwrap();
        merge_remote(&mut t, coll, &remote, "20260830-120000", &HashSet::new());

        // Local content keeps the original name
        assert_eq!(t.find_child(coll, "file1.txt"), Some(local));
        assert!(t
            .get(local)
            .unwrap()
            .node
            .as_file()
            .unwrap()
            .dirty());
        // Remote content appears under the conflict name
        let cino = t
            .find_child(coll, "file1.txt~20260830-120000~conflict~")
            .expect("conflict copy present");
        let cfile = t.get(cino).unwrap().node.as_file().unwrap();
        assert!(!cfile.dirty());
        assert_eq!(cfile.size(), 3);
    }

    #[test]
    fn test_merge_treats_committed_file_as_local_edit() {
        let mut t = table();
        let coll = add_collection(&mut t, "c");
        let local = t.create_file(coll, "file1.txt").unwrap();
        {
            let f = t.get_mut(local).unwrap().node.as_file_mut().unwrap();
            f.write(0, b"bar");
            f.commit_buffers(&BlockLocator::for_content(b"bar"));
            assert!(!f.dirty());
        }

        let remote = manifest::parse(
            ". acbd18db4cc2f85cedef654fccc4a4d8+3 0:3:file1.txt\n",
        )
        .unwrap();
        let touched: HashSet<u64> = [local].into_iter().collect();
        merge_remote(&mut t, coll, &remote, "20260830-120000", &touched);

        assert_eq!(t.find_child(coll, "file1.txt"), Some(local));
        assert!(t
            .find_child(coll, "file1.txt~20260830-120000~conflict~")
            .is_some());
    }

    #[test]
    fn test_merge_conflict_name_increments_when_taken() {
        let mut t = table();
        let coll = add_collection(&mut t, "c");
        let local = t.create_file(coll, "f").unwrap();
        t.get_mut(local)
            .unwrap()
            .node
            .as_file_mut()
            .unwrap()
            .write(0, b"x");
        t.create_file(coll, "f~20260830-120000~conflict~").unwrap();

        let remote =
            manifest::parse(". 37b51d194a7513e45b56f6524f2d51f2+3 0:3:f\n").unwrap();
        merge_remote(&mut t, coll, &remote, "20260830-120000", &HashSet::new());
        assert!(t.find_child(coll, "f~20260830-120000~conflict~2").is_some());
    }

    #[test]
    fn test_merge_skips_conflict_copy_for_identical_content() {
        let mut t = table();
        let coll = add_collection(&mut t, "c");
        let local = t.create_file(coll, "file1.txt").unwrap();
        {
            let f = t.get_mut(local).unwrap().node.as_file_mut().unwrap();
            f.write(0, b"bar");
            f.commit_buffers(&BlockLocator::for_content(b"bar"));
        }

        // Remote holds the same bytes under the same name
        let remote = manifest::parse(
            ". 37b51d194a7513e45b56f6524f2d51f2+3 0:3:file1.txt\n",
        )
        .unwrap();
        let touched: HashSet<u64> = [local].into_iter().collect();
        merge_remote(&mut t, coll, &remote, "20260830-120000", &touched);

        assert_eq!(t.find_child(coll, "file1.txt"), Some(local));
        let children = t.get(coll).unwrap().node.as_dir().unwrap().children.clone();
        assert_eq!(children, vec![local]);
    }

    #[test]
    fn test_merge_keeps_unflushed_local_entries() {
        let mut t = table();
        let coll = add_collection(&mut t, "c");
        // Clean entries the server has never seen: an empty file and an
        // empty directory, neither dirty nor touched by the flush.
        let notes = t.create_file(coll, "notes").unwrap();
        let sub = t.mkdir_in_collection(coll, "drafts").unwrap();

        let remote = manifest::parse(
            ". 37b51d194a7513e45b56f6524f2d51f2+3 0:3:kept.txt\n",
        )
        .unwrap();
        merge_remote(&mut t, coll, &remote, "20260830-120000", &HashSet::new());

        assert_eq!(t.find_child(coll, "notes"), Some(notes));
        assert_eq!(t.find_child(coll, "drafts"), Some(sub));
        assert!(t.find_child(coll, "kept.txt").is_some());
    }

    #[test]
    fn test_merge_remote_deletion_wins_for_clean_files() {
        let mut t = table();
        let coll = add_collection(&mut t, "c");
        let base = manifest::parse(
            ". 37b51d194a7513e45b56f6524f2d51f2+3 0:3:stays.txt 0:3:goes.txt\n",
        )
        .unwrap();
        t.apply_collection_tree(coll, &base);

        let remote = manifest::parse(
            ". 37b51d194a7513e45b56f6524f2d51f2+3 0:3:stays.txt\n",
        )
        .unwrap();
        merge_remote(&mut t, coll, &remote, "20260830-120000", &HashSet::new());
        assert!(t.find_child(coll, "stays.txt").is_some());
        assert_eq!(t.find_child(coll, "goes.txt"), None);
    }

    #[test]
    fn test_merge_keeps_dir_with_dirty_descendant() {
        let mut t = table();
        let coll = add_collection(&mut t, "c");
        let sub = t.mkdir_in_collection(coll, "newdir").unwrap();
        let f = t.create_file(sub, "draft").unwrap();
        t.get_mut(f)
            .unwrap()
            .node
            .as_file_mut()
            .unwrap()
            .write(0, b"x");

        let remote = manifest::parse(
            ". 37b51d194a7513e45b56f6524f2d51f2+3 0:3:other\n",
        )
        .unwrap();
        merge_remote(&mut t, coll, &remote, "20260830-120000", &HashSet::new());
        assert_eq!(t.find_child(coll, "newdir"), Some(sub));
        assert_eq!(t.find_child(sub, "draft"), Some(f));
        assert!(t.find_child(coll, "other").is_some());
    }
}
