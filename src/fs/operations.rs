//! FUSE trait implementation for HarborFs.
//!
//! Read operations: init, lookup, getattr, readdir, open, read, statfs.
//! Write operations: create, write, setattr, mkdir, rmdir, unlink,
//! rename, flush, fsync, release.
//!
//! FUSE requires synchronous replies; the engine blocks on network
//! round trips with the structural lock released.

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
};
use std::ffi::OsStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use log::{debug, error};

use crate::backend::Backend;
use crate::fs::inode::BLOCK_SIZE;
use crate::fs::{self, AttrSnapshot, MountState};
use crate::poll::PollHandle;

/// TTL for attribute/entry cache replies on files. Short, so remote
/// changes surfaced by the poll daemon reach the kernel promptly.
const FILE_TTL: Duration = Duration::from_secs(1);

/// Directory replies are not cached at all; listings change under the
/// kernel whenever the poll daemon applies a remote diff.
const DIR_TTL: Duration = Duration::from_secs(0);

fn ttl_for(kind: FileType) -> Duration {
    if kind == FileType::Directory {
        DIR_TTL
    } else {
        FILE_TTL
    }
}

pub struct HarborFs {
    pub state: Arc<Mutex<MountState>>,
    pub backend: Arc<dyn Backend>,
    pub poll: Option<PollHandle>,
    uid: u32,
    gid: u32,
}

impl HarborFs {
    pub fn new(
        state: Arc<Mutex<MountState>>,
        backend: Arc<dyn Backend>,
        poll: Option<PollHandle>,
    ) -> Self {
        Self {
            state,
            backend,
            poll,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }

    fn attr_from(&self, snap: &AttrSnapshot) -> FileAttr {
        let (kind, perm, nlink) = if snap.is_dir {
            (
                FileType::Directory,
                if snap.writable { 0o755 } else { 0o555 },
                2,
            )
        } else {
            (
                FileType::RegularFile,
                if snap.writable { 0o644 } else { 0o444 },
                1,
            )
        };
        FileAttr {
            ino: snap.ino,
            size: snap.size,
            blocks: (snap.size + 511) / 512,
            atime: snap.mtime,
            mtime: snap.mtime,
            ctime: snap.ctime,
            crtime: snap.crtime,
            kind,
            perm,
            nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    fn reply_entry(&self, ino: u64, reply: ReplyEntry) {
        match fs::getattr(&self.state, ino) {
            Ok(snap) => {
                let attr = self.attr_from(&snap);
                reply.entry(&ttl_for(attr.kind), &attr, 0);
            }
            Err(err) => reply.error(err.errno()),
        }
    }
}

impl Filesystem for HarborFs {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        debug!("harborfs mounted");
        Ok(())
    }

    fn destroy(&mut self) {
        debug!("harborfs unmounting");
        if let Some(mut poll) = self.poll.take() {
            poll.stop();
        }
        let mut st = self.state.lock().unwrap();
        st.block_cache.clear();
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        match fs::lookup(&self.state, self.backend.as_ref(), parent, name) {
            Ok(ino) => self.reply_entry(ino, reply),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        fs::forget(&self.state, ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match fs::getattr(&self.state, ino) {
            Ok(snap) => {
                let attr = self.attr_from(&snap);
                reply.attr(&ttl_for(attr.kind), &attr);
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        if let Some(size) = size {
            if let Err(err) = fs::truncate_file(&self.state, ino, size) {
                reply.error(err.errno());
                return;
            }
        }
        // Mode/owner/time changes are not persisted; attributes derive
        // from collection state.
        match fs::getattr(&self.state, ino) {
            Ok(snap) => {
                let attr = self.attr_from(&snap);
                reply.attr(&ttl_for(attr.kind), &attr);
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let children = match fs::readdir(&self.state, self.backend.as_ref(), ino) {
            Ok(children) => children,
            Err(err) => {
                reply.error(err.errno());
                return;
            }
        };
        let parent = {
            let st = self.state.lock().unwrap();
            st.inodes.get(ino).map(|i| i.parent).unwrap_or(ino)
        };

        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent, FileType::Directory, "..".to_string()),
        ];
        entries.extend(children.into_iter().map(|(ino, name, is_dir)| {
            let kind = if is_dir {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            (ino, kind, name)
        }));

        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn releasedir(&mut self, _req: &Request, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let writable = flags & libc::O_ACCMODE != libc::O_RDONLY;
        match fs::open(&self.state, ino, writable) {
            Ok(fh) => {
                if flags & libc::O_TRUNC != 0 {
                    if let Err(err) = fs::truncate_file(&self.state, ino, 0) {
                        reply.error(err.errno());
                        return;
                    }
                }
                reply.opened(fh, 0)
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let created = fs::create_file(&self.state, self.backend.as_ref(), parent, name)
            .and_then(|ino| fs::open(&self.state, ino, true).map(|fh| (ino, fh)));
        match created {
            Ok((ino, fh)) => match fs::getattr(&self.state, ino) {
                Ok(snap) => {
                    let attr = self.attr_from(&snap);
                    reply.created(&FILE_TTL, &attr, 0, fh, 0);
                }
                Err(err) => reply.error(err.errno()),
            },
            Err(err) => reply.error(err.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match fs::read_file(
            &self.state,
            self.backend.as_ref(),
            ino,
            offset.max(0) as u64,
            size as u64,
        ) {
            Ok(data) => reply.data(&data),
            Err(err) => {
                error!("read ino {ino} failed: {err}");
                reply.error(err.errno());
            }
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match fs::write_file(&self.state, ino, offset.max(0) as u64, data) {
            Ok(written) => reply.written(written),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn flush(&mut self, _req: &Request, ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match fs::fsync(&self.state, self.backend.as_ref(), ino) {
            Ok(()) => reply.ok(),
            Err(err) => {
                error!("flush of ino {ino} failed: {err}");
                reply.error(err.errno());
            }
        }
    }

    fn fsync(&mut self, _req: &Request, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match fs::fsync(&self.state, self.backend.as_ref(), ino) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match fs::release(&self.state, self.backend.as_ref(), fh) {
            Ok(()) => reply.ok(),
            Err(err) => {
                error!("release of fh {fh} failed: {err}");
                reply.error(err.errno());
            }
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        match fs::mkdir(&self.state, self.backend.as_ref(), parent, name) {
            Ok(ino) => self.reply_entry(ino, reply),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        match fs::rmdir(&self.state, self.backend.as_ref(), parent, name) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        match fs::unlink(&self.state, parent, name) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(name), Some(newname)) = (name.to_str(), newname.to_str()) else {
            reply.error(libc::EINVAL);
            return;
        };
        match fs::rename(&self.state, parent, name, newparent, newname) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        // Backing store capacity is not meaningful here; report a large
        // fixed-size volume.
        let blocks = (1u64 << 40) / BLOCK_SIZE as u64;
        reply.statfs(blocks, blocks, blocks, 1 << 20, 1 << 20, BLOCK_SIZE, 255, BLOCK_SIZE);
    }

    fn access(&mut self, _req: &Request, ino: u64, _mask: i32, reply: ReplyEmpty) {
        match fs::getattr(&self.state, ino) {
            Ok(_) => reply.ok(),
            Err(err) => reply.error(err.errno()),
        }
    }
}
