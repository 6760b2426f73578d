//! Filesystem engine: mount state, lazy population, and the operations
//! the FUSE layer calls into.
//!
//! All structure lives under one mutex. Functions here follow a strict
//! shape: lock to plan, unlock for network round trips, relock to apply
//! while re-validating everything read before the unlock. Backing-store
//! blocks are content-addressed, so fetched data never goes stale; only
//! tree structure needs re-validation.

pub mod cache;
pub mod directory;
pub mod file;
pub mod flush;
pub mod inode;
#[cfg(feature = "fuse")]
pub mod operations;

use std::collections::HashMap;
use std::sync::Mutex;

use log::debug;
use regex::Regex;

use crate::backend::Backend;
use crate::config::MountConfig;
use crate::error::FsError;
use crate::fs::cache::BlockCache;
use crate::fs::directory::{CollectionMeta, DirNode, DirSource, ListingEntry};
use crate::fs::file::{FileNode, PlannedChunk};
use crate::fs::inode::{InodeTable, Node, ROOT_INO};
use crate::manifest;

/// Contents of the README served inside the by_id directory.
const BY_ID_README: &str = "This directory exposes collections by identifier.\n\
Opening a subdirectory named after a collection UUID or portable data\n\
hash mounts that collection there. Entries appear on first access and\n\
are not listed in advance.\n";

/// An open file or directory handle.
pub struct FileHandle {
    pub ino: u64,
    pub writable: bool,
}

/// Everything behind the structural lock.
pub struct MountState {
    pub inodes: InodeTable,
    pub handles: HashMap<u64, FileHandle>,
    pub next_fh: u64,
    pub block_cache: BlockCache,
}

impl MountState {
    /// Build the fixed top level: by_id, by_tag, home, shared. These
    /// are pinned and never evicted.
    pub fn new(cfg: MountConfig, user_uuid: &str) -> Self {
        let mut inodes = InodeTable::new(DirSource::MountRoot, cfg.cache_cap, cfg.cache_min_entries);
        let block_cache = BlockCache::new(cfg.block_cache_bytes);

        let by_id = inodes.insert_child(
            ROOT_INO,
            "by_id",
            Node::Directory(DirNode::new(DirSource::Magic {
                pdh_only: cfg.pdh_only,
            })),
        );
        let by_tag = inodes.insert_child(
            ROOT_INO,
            "by_tag",
            Node::Directory(DirNode::new(DirSource::Tags { tag: None })),
        );
        let home = inodes.insert_child(
            ROOT_INO,
            "home",
            Node::Directory(DirNode::new(DirSource::Project {
                owner_uuid: user_uuid.to_string(),
            })),
        );
        let shared = inodes.insert_child(
            ROOT_INO,
            "shared",
            Node::Directory(DirNode::new(DirSource::Shared {
                exclude: cfg.exclude.clone(),
            })),
        );

        let mut readme = FileNode::new();
        readme.write(0, BY_ID_README.as_bytes());
        let readme_ino = inodes.insert_child(by_id, "README", Node::File(readme));

        for ino in [by_id, by_tag, home, shared, readme_ino] {
            if let Some(inode) = inodes.get_mut(ino) {
                inode.pinned = true;
            }
        }
        if let Some(root) = inodes.get_mut(ROOT_INO).and_then(|i| i.node.as_dir_mut()) {
            root.populated = true;
        }

        Self {
            inodes,
            handles: HashMap::new(),
            next_fh: 1,
            block_cache,
        }
    }

    /// Whether writes are allowed through `ino` (a file inside a
    /// writable collection).
    pub fn file_writable(&self, ino: u64) -> bool {
        self.inodes
            .collection_root_of(ino)
            .and_then(|root| self.inodes.get(root))
            .and_then(|i| i.node.as_dir())
            .and_then(|d| d.source.collection_meta())
            .map(|m| m.writable && m.uuid.is_some())
            .unwrap_or(false)
    }
}

// ── Population ────────────────────────────────────────────────────────────────

/// What a population pass needs to fetch, planned under the lock.
enum PopulatePlan {
    Nothing,
    Collection { id: String },
    Tags { tag: Option<String> },
    Project { owner_uuid: String },
    Shared { exclude: Option<String> },
}

/// Make sure a directory's children reflect its source, fetching from
/// the backing store when needed. `force` refetches even if populated.
pub fn populate_dir(
    state: &Mutex<MountState>,
    backend: &dyn Backend,
    ino: u64,
    force: bool,
) -> Result<(), FsError> {
    let plan = {
        let mut st = state.lock().unwrap();
        let inode = st.inodes.get(ino).ok_or(FsError::NotFound)?;
        let dir = inode.node.as_dir().ok_or(FsError::NotFound)?;
        if dir.populated && !force {
            return Ok(());
        }
        match &dir.source {
            DirSource::MountRoot | DirSource::Magic { .. } => {
                let dir = st
                    .inodes
                    .get_mut(ino)
                    .and_then(|i| i.node.as_dir_mut())
                    .ok_or(FsError::NotFound)?;
                dir.populated = true;
                PopulatePlan::Nothing
            }
            DirSource::CollectionRoot(meta) => {
                if meta.dirty || meta.flushing {
                    // Local edits win until flushed.
                    return Ok(());
                }
                let id = meta
                    .uuid
                    .clone()
                    .unwrap_or_else(|| meta.portable_data_hash.clone());
                PopulatePlan::Collection { id }
            }
            DirSource::Collection { .. } => {
                // Materialized with its collection root; if we are here
                // the root was de-populated, so repopulate from there.
                let root = st.inodes.collection_root_of(ino).ok_or(FsError::Stale)?;
                drop(st);
                return populate_dir(state, backend, root, force);
            }
            DirSource::Tags { tag } => PopulatePlan::Tags { tag: tag.clone() },
            DirSource::Project { owner_uuid } => PopulatePlan::Project {
                owner_uuid: owner_uuid.clone(),
            },
            DirSource::Shared { exclude } => PopulatePlan::Shared {
                exclude: exclude.clone(),
            },
        }
    };

    let entries = match plan {
        PopulatePlan::Nothing => return Ok(()),
        PopulatePlan::Collection { id } => {
            let record = backend.get_collection(&id)?;
            let tree = manifest::parse(&record.manifest_text)?;
            let mut st = state.lock().unwrap();
            let meta = st
                .inodes
                .get_mut(ino)
                .and_then(|i| i.node.as_dir_mut())
                .and_then(|d| d.source.collection_meta_mut())
                .ok_or(FsError::Stale)?;
            if meta.dirty || meta.flushing {
                // An edit landed while we fetched; keep the local tree.
                return Ok(());
            }
            meta.version = record.version;
            meta.portable_data_hash = record.portable_data_hash;
            st.inodes.apply_collection_tree(ino, &tree);
            st.inodes.evict_excess();
            return Ok(());
        }
        PopulatePlan::Tags { tag: None } => {
            let mut names: Vec<String> =
                backend.list_tags()?.into_iter().map(|t| t.name).collect();
            names.sort();
            names.dedup();
            names
                .into_iter()
                .map(|name| ListingEntry::TagDir {
                    tag: name.clone(),
                    name,
                })
                .collect()
        }
        PopulatePlan::Tags { tag: Some(tag) } => backend
            .list_tags()?
            .into_iter()
            .filter(|t| t.name == tag)
            .map(|t| ListingEntry::Collection {
                name: t.collection_uuid.clone(),
                meta: CollectionMeta {
                    uuid: Some(t.collection_uuid),
                    // Tag links carry no content hash; the poll
                    // refetches these roots directly instead.
                    portable_data_hash: String::new(),
                    version: 0,
                    writable: true,
                    dirty: false,
                    flushing: false,
                },
            })
            .collect(),
        PopulatePlan::Project { owner_uuid } => {
            let mut entries: Vec<ListingEntry> = backend
                .list_collections(&owner_uuid)?
                .into_iter()
                .map(|c| ListingEntry::Collection {
                    name: c.name,
                    meta: CollectionMeta {
                        uuid: Some(c.uuid),
                        portable_data_hash: c.portable_data_hash,
                        version: c.version,
                        writable: true,
                        dirty: false,
                        flushing: false,
                    },
                })
                .collect();
            entries.extend(backend.list_projects(&owner_uuid)?.into_iter().map(|p| {
                ListingEntry::Project {
                    name: p.name,
                    owner_uuid: p.uuid,
                }
            }));
            entries
        }
        PopulatePlan::Shared { exclude } => backend
            .list_shared(exclude.as_deref())?
            .into_iter()
            .map(|o| ListingEntry::Project {
                name: o.name,
                owner_uuid: o.uuid,
            })
            .collect(),
    };

    let mut st = state.lock().unwrap();
    if st.inodes.get(ino).and_then(|i| i.node.as_dir()).is_none() {
        return Err(FsError::Stale);
    }
    st.inodes.apply_listing(ino, entries);
    st.inodes.evict_excess();
    Ok(())
}

// ── Lookup ────────────────────────────────────────────────────────────────────

fn pdh_pattern() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9a-f]{32}\+[0-9]+$").unwrap())
}

fn uuid_pattern() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$").unwrap()
    })
}

/// Resolve `name` under `parent`, bumping the kernel lookup count.
///
/// Inside the by_id directory, names shaped like collection identifiers
/// are resolved against the backing store on first access; anything
/// else fails without a network round trip.
pub fn lookup(
    state: &Mutex<MountState>,
    backend: &dyn Backend,
    parent: u64,
    name: &str,
) -> Result<u64, FsError> {
    populate_dir(state, backend, parent, false)?;

    let magic = {
        let mut st = state.lock().unwrap();
        if let Some(ino) = st.inodes.find_child(parent, name) {
            st.inodes.touch(ino);
            if let Some(inode) = st.inodes.get_mut(ino) {
                inode.lookups += 1;
            }
            return Ok(ino);
        }
        match st.inodes.get(parent).and_then(|i| i.node.as_dir()) {
            Some(dir) => match dir.source {
                DirSource::Magic { pdh_only } => pdh_only,
                _ => return Err(FsError::NotFound),
            },
            None => return Err(FsError::NotFound),
        }
    };

    let by_pdh = pdh_pattern().is_match(name);
    let by_uuid = !by_pdh && uuid_pattern().is_match(name);
    if !by_pdh && !by_uuid {
        return Err(FsError::NotFound);
    }
    if magic && by_uuid {
        // pdh-only mounts serve immutable content exclusively.
        return Err(FsError::NotFound);
    }

    let record = backend.get_collection(name)?;
    let mut st = state.lock().unwrap();
    if let Some(ino) = st.inodes.find_child(parent, name) {
        // Raced another lookup of the same identifier.
        if let Some(inode) = st.inodes.get_mut(ino) {
            inode.lookups += 1;
        }
        return Ok(ino);
    }
    debug!("mounting collection {name} under by_id");
    let meta = CollectionMeta {
        uuid: if by_uuid { Some(record.uuid) } else { None },
        portable_data_hash: record.portable_data_hash,
        version: record.version,
        writable: by_uuid,
        dirty: false,
        flushing: false,
    };
    let ino = st.inodes.insert_child(
        parent,
        name,
        Node::Directory(DirNode::new(DirSource::CollectionRoot(meta))),
    );
    if let Some(inode) = st.inodes.get_mut(ino) {
        inode.lookups += 1;
    }
    st.inodes.evict_excess();
    Ok(ino)
}

/// Directory listing: (ino, name, is_dir) per live child.
pub fn readdir(
    state: &Mutex<MountState>,
    backend: &dyn Backend,
    ino: u64,
) -> Result<Vec<(u64, String, bool)>, FsError> {
    populate_dir(state, backend, ino, false)?;
    let mut st = state.lock().unwrap();
    st.inodes.touch(ino);
    let children = st
        .inodes
        .get(ino)
        .and_then(|i| i.node.as_dir())
        .map(|d| d.children.clone())
        .ok_or(FsError::NotFound)?;
    Ok(children
        .into_iter()
        .filter_map(|c| {
            let inode = st.inodes.get(c)?;
            Some((c, inode.name.clone(), inode.is_dir()))
        })
        .collect())
}

// ── File I/O ──────────────────────────────────────────────────────────────────

const READ_RETRIES: usize = 5;

/// Read file bytes, fetching missing blocks from the backing store and
/// caching them. Reads past end of file return short or empty data.
pub fn read_file(
    state: &Mutex<MountState>,
    backend: &dyn Backend,
    ino: u64,
    offset: u64,
    size: u64,
) -> Result<Vec<u8>, FsError> {
    for _ in 0..READ_RETRIES {
        // Plan and serve what the cache already holds.
        let missing: Vec<manifest::BlockLocator> = {
            let mut st = state.lock().unwrap();
            st.inodes.touch(ino);
            let file = st
                .inodes
                .get(ino)
                .and_then(|i| i.node.as_file())
                .ok_or(FsError::NotFound)?;
            let plan = file.read_plan(offset, size);

            let mut out = Vec::new();
            let mut missing = Vec::new();
            for chunk in &plan {
                match chunk {
                    PlannedChunk::Local(data) => out.extend_from_slice(data),
                    PlannedChunk::Remote {
                        locator,
                        offset,
                        len,
                    } => {
                        let key = locator.stripped();
                        match st.block_cache.get(&key) {
                            Some(block) => {
                                let start = *offset as usize;
                                let end = start + *len as usize;
                                if end > block.len() {
                                    return Err(FsError::Corrupt(format!(
                                        "block {locator} shorter than segment"
                                    )));
                                }
                                out.extend_from_slice(&block[start..end]);
                            }
                            None => missing.push(locator.clone()),
                        }
                    }
                }
            }
            if missing.is_empty() {
                return Ok(out);
            }
            missing
        };

        // Fetch outside the lock; block content is immutable.
        let mut fetched = Vec::with_capacity(missing.len());
        for locator in missing {
            let data = backend.get_block(&locator)?;
            fetched.push((locator.stripped(), data));
        }
        let mut st = state.lock().unwrap();
        for (key, data) in fetched {
            st.block_cache.set(&key, data);
        }
        // Replan: the file may have changed while blocks were in flight.
    }
    Err(FsError::Stale)
}

/// Buffer a write. The enclosing collection becomes dirty and is pushed
/// on flush/release.
pub fn write_file(
    state: &Mutex<MountState>,
    ino: u64,
    offset: u64,
    data: &[u8],
) -> Result<u32, FsError> {
    let mut st = state.lock().unwrap();
    if !st.file_writable(ino) {
        return Err(FsError::PermissionDenied);
    }
    let file = st
        .inodes
        .get_mut(ino)
        .and_then(|i| i.node.as_file_mut())
        .ok_or(FsError::NotFound)?;
    file.write(offset, data);
    let now = std::time::SystemTime::now();
    if let Some(inode) = st.inodes.get_mut(ino) {
        inode.mtime = now;
        inode.ctime = now;
    }
    st.inodes.touch(ino);
    st.inodes.mark_collection_dirty(ino);
    Ok(data.len() as u32)
}

/// Change a file's length.
pub fn truncate_file(state: &Mutex<MountState>, ino: u64, size: u64) -> Result<(), FsError> {
    let mut st = state.lock().unwrap();
    if !st.file_writable(ino) {
        return Err(FsError::PermissionDenied);
    }
    let file = st
        .inodes
        .get_mut(ino)
        .and_then(|i| i.node.as_file_mut())
        .ok_or(FsError::NotFound)?;
    if file.size() != size {
        file.truncate(size);
        st.inodes.mark_collection_dirty(ino);
    }
    Ok(())
}

// ── Handles ───────────────────────────────────────────────────────────────────

/// Open a handle on a file.
pub fn open(state: &Mutex<MountState>, ino: u64, writable: bool) -> Result<u64, FsError> {
    let mut st = state.lock().unwrap();
    let inode = st.inodes.get(ino).ok_or(FsError::NotFound)?;
    if inode.is_dir() {
        return Err(FsError::NotFound);
    }
    if writable && !st.file_writable(ino) {
        return Err(FsError::PermissionDenied);
    }
    if let Some(inode) = st.inodes.get_mut(ino) {
        inode.handles += 1;
    }
    st.inodes.touch(ino);
    let fh = st.next_fh;
    st.next_fh += 1;
    st.handles.insert(fh, FileHandle { ino, writable });
    Ok(fh)
}

/// Close a handle. The last writable close of a dirty collection
/// triggers a flush; unlinked files vanish at last close.
pub fn release(
    state: &Mutex<MountState>,
    backend: &dyn Backend,
    fh: u64,
) -> Result<(), FsError> {
    let flush_root = {
        let mut st = state.lock().unwrap();
        let handle = st.handles.remove(&fh).ok_or(FsError::NotFound)?;
        let ino = handle.ino;
        if let Some(inode) = st.inodes.get_mut(ino) {
            inode.handles = inode.handles.saturating_sub(1);
        }
        st.inodes.remove_if_dead(ino);
        if handle.writable {
            st.inodes.collection_root_of(ino).filter(|root| {
                st.inodes
                    .get(*root)
                    .and_then(|i| i.node.as_dir())
                    .and_then(|d| d.source.collection_meta())
                    .map(|m| m.dirty && !m.flushing)
                    .unwrap_or(false)
            })
        } else {
            None
        }
    };
    match flush_root {
        Some(root) => flush::flush_collection(state, backend, root),
        None => Ok(()),
    }
}

// ── Structural operations ─────────────────────────────────────────────────────

/// Create an empty file in a writable collection directory.
pub fn create_file(
    state: &Mutex<MountState>,
    backend: &dyn Backend,
    parent: u64,
    name: &str,
) -> Result<u64, FsError> {
    populate_dir(state, backend, parent, false)?;
    let mut st = state.lock().unwrap();
    let ino = st.inodes.create_file(parent, name)?;
    if let Some(inode) = st.inodes.get_mut(ino) {
        inode.lookups += 1;
    }
    Ok(ino)
}

/// Make a directory: a subdirectory inside a collection, or a new
/// collection when the parent is a project.
pub fn mkdir(
    state: &Mutex<MountState>,
    backend: &dyn Backend,
    parent: u64,
    name: &str,
) -> Result<u64, FsError> {
    populate_dir(state, backend, parent, false)?;
    let owner = {
        let st = state.lock().unwrap();
        match st
            .inodes
            .get(parent)
            .and_then(|i| i.node.as_dir())
            .map(|d| d.source.clone())
        {
            Some(DirSource::Project { owner_uuid }) => {
                if st.inodes.find_child(parent, name).is_some() {
                    return Err(FsError::AlreadyExists);
                }
                directory::validate_name(name)?;
                Some(owner_uuid)
            }
            Some(_) => None,
            None => return Err(FsError::NotFound),
        }
    };

    match owner {
        Some(owner_uuid) => {
            let record = backend.create_collection(&owner_uuid, name)?;
            let mut st = state.lock().unwrap();
            if let Some(ino) = st.inodes.find_child(parent, name) {
                return Ok(ino);
            }
            let mut dir = DirNode::new(DirSource::CollectionRoot(CollectionMeta {
                uuid: Some(record.uuid),
                portable_data_hash: record.portable_data_hash,
                version: record.version,
                writable: true,
                dirty: false,
                flushing: false,
            }));
            dir.populated = true;
            let ino = st.inodes.insert_child(parent, name, Node::Directory(dir));
            if let Some(inode) = st.inodes.get_mut(ino) {
                inode.lookups += 1;
            }
            Ok(ino)
        }
        None => {
            let mut st = state.lock().unwrap();
            let ino = st.inodes.mkdir_in_collection(parent, name)?;
            if let Some(inode) = st.inodes.get_mut(ino) {
                inode.lookups += 1;
            }
            Ok(ino)
        }
    }
}

/// Remove a file from a writable collection.
pub fn unlink(
    state: &Mutex<MountState>,
    parent: u64,
    name: &str,
) -> Result<(), FsError> {
    let mut st = state.lock().unwrap();
    st.inodes.unlink_file(parent, name)
}

/// Remove an empty directory: a collection subdirectory, or a whole
/// empty collection when the parent is a project.
pub fn rmdir(
    state: &Mutex<MountState>,
    backend: &dyn Backend,
    parent: u64,
    name: &str,
) -> Result<(), FsError> {
    let target = {
        let mut st = state.lock().unwrap();
        let parent_is_project = matches!(
            st.inodes.get(parent).and_then(|i| i.node.as_dir()),
            Some(dir) if matches!(dir.source, DirSource::Project { .. })
        );
        if !parent_is_project {
            return st.inodes.rmdir_in_collection(parent, name);
        }
        st.inodes.find_child(parent, name).ok_or(FsError::NotFound)?
    };

    // Deleting a collection requires knowing it is empty.
    populate_dir(state, backend, target, false)?;
    let uuid = {
        let st = state.lock().unwrap();
        let dir = st
            .inodes
            .get(target)
            .and_then(|i| i.node.as_dir())
            .ok_or(FsError::NotFound)?;
        if !dir.children.is_empty() {
            return Err(FsError::NotEmpty);
        }
        dir.source
            .collection_meta()
            .and_then(|m| m.uuid.clone())
            .ok_or(FsError::PermissionDenied)?
    };
    backend.delete_collection(&uuid)?;
    let mut st = state.lock().unwrap();
    st.inodes.unlink_entry(target);
    Ok(())
}

/// Rename or move an entry between writable collection directories.
pub fn rename(
    state: &Mutex<MountState>,
    old_parent: u64,
    old_name: &str,
    new_parent: u64,
    new_name: &str,
) -> Result<(), FsError> {
    let mut st = state.lock().unwrap();
    st.inodes.rename_entry(old_parent, old_name, new_parent, new_name)
}

/// Balance kernel lookup counts.
pub fn forget(state: &Mutex<MountState>, ino: u64, nlookups: u64) {
    let mut st = state.lock().unwrap();
    st.inodes.forget(ino, nlookups);
    // Dropping the kernel reference may have made nodes evictable.
    st.inodes.evict_excess();
}

/// Flush the collection containing `ino`, if it is dirty.
pub fn fsync(
    state: &Mutex<MountState>,
    backend: &dyn Backend,
    ino: u64,
) -> Result<(), FsError> {
    let root = {
        let st = state.lock().unwrap();
        st.inodes.collection_root_of(ino)
    };
    match root {
        Some(root) => flush::flush_collection(state, backend, root),
        None => Ok(()),
    }
}

/// Snapshot of an inode's attributes, taken under the lock for the
/// FUSE layer to format.
pub struct AttrSnapshot {
    pub ino: u64,
    pub size: u64,
    pub is_dir: bool,
    pub writable: bool,
    pub mtime: std::time::SystemTime,
    pub ctime: std::time::SystemTime,
    pub crtime: std::time::SystemTime,
}

pub fn getattr(state: &Mutex<MountState>, ino: u64) -> Result<AttrSnapshot, FsError> {
    let st = state.lock().unwrap();
    let inode = st.inodes.get(ino).ok_or(FsError::NotFound)?;
    let writable = match &inode.node {
        Node::File(_) => st.file_writable(ino),
        Node::Directory(dir) => match &dir.source {
            DirSource::CollectionRoot(meta) => meta.writable && meta.uuid.is_some(),
            DirSource::Collection { .. } => st.file_writable(ino),
            DirSource::Project { .. } => true,
            _ => false,
        },
    };
    Ok(AttrSnapshot {
        ino,
        size: inode.size(),
        is_dir: inode.is_dir(),
        writable,
        mtime: inode.mtime,
        ctime: inode.ctime,
        crtime: inode.crtime,
    })
}
