//! Background poll daemon.
//!
//! Periodically re-lists populated query-backed directories and
//! refetches collections mounted by identifier or tag, so entries
//! created or
//! removed outside the mount become visible without remounting. A
//! collection with unflushed local edits is left alone until its flush
//! lands.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, warn};

use crate::backend::Backend;
use crate::error::FsError;
use crate::fs::directory::DirSource;
use crate::fs::inode::Node;
use crate::fs::{self, MountState};

/// Handle to the poll thread; dropping without `stop()` leaves the
/// thread to exit on its own when the mount state goes away.
pub struct PollHandle {
    stop_tx: mpsc::Sender<()>,
    join: Option<JoinHandle<()>>,
}

impl PollHandle {
    /// Signal the thread and wait for it to exit.
    pub fn stop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Spawn the poll thread. The weak reference lets the thread notice an
/// unmount that skipped `stop()`.
pub fn spawn_poll(
    state: Weak<Mutex<MountState>>,
    backend: Arc<dyn Backend>,
    interval: Duration,
) -> PollHandle {
    let (stop_tx, stop_rx) = mpsc::channel();
    let join = std::thread::Builder::new()
        .name("harborfs-poll".to_string())
        .spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
            let Some(state) = state.upgrade() else { break };
            if let Err(err) = poll_cycle(&state, backend.as_ref()) {
                warn!("poll cycle failed: {err}");
            }
        })
        .expect("spawn poll thread");
    PollHandle {
        stop_tx,
        join: Some(join),
    }
}

/// One refresh pass over everything currently materialized. Public so
/// tests can drive invalidation deterministically.
pub fn poll_cycle(state: &Mutex<MountState>, backend: &dyn Backend) -> Result<(), FsError> {
    // Under the lock, decide what needs refreshing; the fetches happen
    // through populate_dir with the lock released.
    let targets: Vec<u64> = {
        let st = state.lock().unwrap();
        st.inodes
            .inodes
            .values()
            .filter_map(|inode| {
                let dir = match &inode.node {
                    Node::Directory(d) if d.populated => d,
                    _ => return None,
                };
                match &dir.source {
                    DirSource::Tags { .. }
                    | DirSource::Project { .. }
                    | DirSource::Shared { .. } => Some(inode.ino),
                    DirSource::CollectionRoot(meta) => {
                        // Project listings refresh their collections by
                        // content hash. Identifier- and tag-mounted
                        // roots have no listing hash, so refetch them
                        // directly, and never over local edits.
                        let needs_refetch = matches!(
                            st.inodes
                                .get(inode.parent)
                                .and_then(|p| p.node.as_dir())
                                .map(|d| &d.source),
                            Some(DirSource::Magic { .. }) | Some(DirSource::Tags { .. })
                        );
                        if needs_refetch && !meta.dirty && !meta.flushing && meta.uuid.is_some() {
                            Some(inode.ino)
                        } else {
                            None
                        }
                    }
                    _ => None,
                }
            })
            .collect()
    };

    let mut first_err = None;
    for ino in targets {
        debug!("poll refresh of dir {ino}");
        match fs::populate_dir(state, backend, ino, true) {
            Ok(()) => {}
            Err(FsError::Stale) | Err(FsError::NotFound) => {}
            Err(err) => first_err = first_err.or(Some(err)),
        }
    }
    {
        let mut st = state.lock().unwrap();
        st.inodes.evict_excess();
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
