//! Backing-service seam between the filesystem engine and the Harbor API.
//!
//! The engine calls these synchronously with the structural lock released;
//! `HttpBackend` adapts the async API client by blocking on a runtime handle
//! with a timeout, so a stuck network call cannot wedge a FUSE thread
//! forever. Tests substitute the in-memory mock.

use std::future::Future;

use crate::api::types::{CollectionRecord, ProjectRecord, SharedOwner, TagLink, UserRecord};
use crate::api::{self, ApiClient};
use crate::error::FsError;
use crate::manifest::BlockLocator;

/// Timeout for one backing-store round trip.
const NETWORK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Remote collection/object/tag/group service plus the block store.
pub trait Backend: Send + Sync {
    fn current_user(&self) -> Result<UserRecord, FsError>;
    /// Fetch a collection by UUID or portable data hash, manifest included.
    fn get_collection(&self, id: &str) -> Result<CollectionRecord, FsError>;
    fn create_collection(&self, owner_uuid: &str, name: &str)
        -> Result<CollectionRecord, FsError>;
    /// Conditional manifest replacement; `Conflict` when `expect_version`
    /// no longer matches the record.
    fn update_collection(
        &self,
        uuid: &str,
        manifest_text: &str,
        expect_version: u64,
    ) -> Result<CollectionRecord, FsError>;
    fn delete_collection(&self, uuid: &str) -> Result<(), FsError>;
    fn list_collections(&self, owner_uuid: &str) -> Result<Vec<CollectionRecord>, FsError>;
    fn list_projects(&self, owner_uuid: &str) -> Result<Vec<ProjectRecord>, FsError>;
    fn list_shared(&self, exclude: Option<&str>) -> Result<Vec<SharedOwner>, FsError>;
    fn list_tags(&self) -> Result<Vec<TagLink>, FsError>;
    fn get_block(&self, locator: &BlockLocator) -> Result<Vec<u8>, FsError>;
    fn put_block(&self, data: &[u8]) -> Result<BlockLocator, FsError>;
}

/// Run an async API call on the runtime with a timeout, blocking the
/// calling (FUSE or poll) thread.
fn block_with_timeout<F, T>(rt: &tokio::runtime::Handle, fut: F) -> Result<T, FsError>
where
    F: Future<Output = Result<T, FsError>>,
{
    rt.block_on(async {
        match tokio::time::timeout(NETWORK_TIMEOUT, fut).await {
            Ok(result) => result,
            Err(_) => Err(FsError::Transient("operation timed out".to_string())),
        }
    })
}

/// Production backend over the Harbor HTTP API.
pub struct HttpBackend {
    api: ApiClient,
    rt: tokio::runtime::Handle,
}

impl HttpBackend {
    pub fn new(api: ApiClient, rt: tokio::runtime::Handle) -> Self {
        Self { api, rt }
    }
}

impl Backend for HttpBackend {
    fn current_user(&self) -> Result<UserRecord, FsError> {
        block_with_timeout(&self.rt, api::groups::current_user(&self.api))
    }

    fn get_collection(&self, id: &str) -> Result<CollectionRecord, FsError> {
        block_with_timeout(&self.rt, api::collections::get_collection(&self.api, id))
    }

    fn create_collection(
        &self,
        owner_uuid: &str,
        name: &str,
    ) -> Result<CollectionRecord, FsError> {
        block_with_timeout(
            &self.rt,
            api::collections::create_collection(&self.api, owner_uuid, name),
        )
    }

    fn update_collection(
        &self,
        uuid: &str,
        manifest_text: &str,
        expect_version: u64,
    ) -> Result<CollectionRecord, FsError> {
        block_with_timeout(
            &self.rt,
            api::collections::update_collection(&self.api, uuid, manifest_text, expect_version),
        )
    }

    fn delete_collection(&self, uuid: &str) -> Result<(), FsError> {
        block_with_timeout(
            &self.rt,
            api::collections::delete_collection(&self.api, uuid),
        )
    }

    fn list_collections(&self, owner_uuid: &str) -> Result<Vec<CollectionRecord>, FsError> {
        block_with_timeout(
            &self.rt,
            api::collections::list_collections(&self.api, owner_uuid),
        )
    }

    fn list_projects(&self, owner_uuid: &str) -> Result<Vec<ProjectRecord>, FsError> {
        block_with_timeout(&self.rt, api::groups::list_projects(&self.api, owner_uuid))
    }

    fn list_shared(&self, exclude: Option<&str>) -> Result<Vec<SharedOwner>, FsError> {
        block_with_timeout(&self.rt, api::groups::list_shared(&self.api, exclude))
    }

    fn list_tags(&self) -> Result<Vec<TagLink>, FsError> {
        block_with_timeout(&self.rt, api::links::list_tags(&self.api))
    }

    fn get_block(&self, locator: &BlockLocator) -> Result<Vec<u8>, FsError> {
        block_with_timeout(&self.rt, api::blocks::get_block(&self.api, locator))
    }

    fn put_block(&self, data: &[u8]) -> Result<BlockLocator, FsError> {
        block_with_timeout(&self.rt, api::blocks::put_block(&self.api, data.to_vec()))
    }
}

#[cfg(test)]
pub mod mock {
    //! In-memory backend with the same version-check semantics as the
    //! service, used by every engine test.

    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::manifest;

    #[derive(Default)]
    pub struct MockState {
        pub collections: HashMap<String, CollectionRecord>,
        pub blocks: HashMap<String, Vec<u8>>,
        pub tags: Vec<TagLink>,
        pub projects: Vec<ProjectRecord>,
        pub shared: Vec<SharedOwner>,
        next_id: u64,
        /// Round-trip counters, asserted by tests.
        pub get_collection_calls: usize,
        pub get_block_calls: usize,
        pub update_calls: usize,
    }

    pub struct MockBackend {
        pub state: Mutex<MockState>,
        pub user_uuid: String,
    }

    pub const MOCK_USER_UUID: &str = "00000000-aaaa-4000-8000-000000000001";

    impl MockBackend {
        pub fn new() -> Self {
            Self {
                state: Mutex::new(MockState::default()),
                user_uuid: MOCK_USER_UUID.to_string(),
            }
        }

        fn next_uuid(state: &mut MockState) -> String {
            state.next_id += 1;
            format!("{:08x}-0000-4000-8000-{:012x}", state.next_id, state.next_id)
        }

        /// Register a collection with the given manifest text, storing no
        /// blocks. Returns the record.
        pub fn add_collection(
            &self,
            owner_uuid: &str,
            name: &str,
            manifest_text: &str,
        ) -> CollectionRecord {
            let mut state = self.state.lock().unwrap();
            let uuid = Self::next_uuid(&mut state);
            let record = CollectionRecord {
                uuid: uuid.clone(),
                owner_uuid: owner_uuid.to_string(),
                name: name.to_string(),
                portable_data_hash: manifest::portable_data_hash(manifest_text),
                manifest_text: manifest_text.to_string(),
                version: 1,
                modified_at: None,
            };
            state.collections.insert(uuid, record.clone());
            record
        }

        /// Build a one-stream collection from (name, content) pairs,
        /// storing the blocks too.
        pub fn add_collection_with_files(
            &self,
            owner_uuid: &str,
            name: &str,
            files: &[(&str, &[u8])],
        ) -> CollectionRecord {
            let mut line = String::from(".");
            let mut tokens = String::new();
            let mut offset = 0u64;
            for (file_name, content) in files {
                let locator = self.store_block(content);
                line.push_str(&format!(" {locator}"));
                tokens.push_str(&format!(" {offset}:{}:{file_name}", content.len()));
                offset += content.len() as u64;
            }
            if files.is_empty() {
                line.push_str(&format!(" {}", manifest::EMPTY_BLOCK_LOCATOR));
            }
            let text = format!("{line}{tokens}\n");
            self.add_collection(owner_uuid, name, &text)
        }

        /// Store a block directly (test setup path, no counters).
        pub fn store_block(&self, data: &[u8]) -> BlockLocator {
            let locator = BlockLocator::for_content(data);
            let mut state = self.state.lock().unwrap();
            state.blocks.insert(locator.stripped(), data.to_vec());
            locator
        }

        /// Overwrite a collection's manifest as a concurrent writer would:
        /// version bumps, pdh recomputed.
        pub fn set_manifest_externally(&self, uuid: &str, manifest_text: &str) {
            let mut state = self.state.lock().unwrap();
            let record = state.collections.get_mut(uuid).expect("collection exists");
            record.manifest_text = manifest_text.to_string();
            record.portable_data_hash = manifest::portable_data_hash(manifest_text);
            record.version += 1;
        }

        pub fn add_tag(&self, name: &str, collection_uuid: &str) {
            self.state.lock().unwrap().tags.push(TagLink {
                name: name.to_string(),
                collection_uuid: collection_uuid.to_string(),
            });
        }

        pub fn remove_tag(&self, name: &str, collection_uuid: &str) {
            self.state
                .lock()
                .unwrap()
                .tags
                .retain(|t| !(t.name == name && t.collection_uuid == collection_uuid));
        }
    }

    impl Backend for MockBackend {
        fn current_user(&self) -> Result<UserRecord, FsError> {
            Ok(UserRecord {
                uuid: self.user_uuid.clone(),
                full_name: "Mock User".to_string(),
            })
        }

        fn get_collection(&self, id: &str) -> Result<CollectionRecord, FsError> {
            let mut state = self.state.lock().unwrap();
            state.get_collection_calls += 1;
            if let Some(record) = state.collections.get(id) {
                return Ok(record.clone());
            }
            state
                .collections
                .values()
                .find(|r| r.portable_data_hash == id)
                .cloned()
                .ok_or(FsError::NotFound)
        }

        fn create_collection(
            &self,
            owner_uuid: &str,
            name: &str,
        ) -> Result<CollectionRecord, FsError> {
            Ok(self.add_collection(owner_uuid, name, ""))
        }

        fn update_collection(
            &self,
            uuid: &str,
            manifest_text: &str,
            expect_version: u64,
        ) -> Result<CollectionRecord, FsError> {
            let mut state = self.state.lock().unwrap();
            state.update_calls += 1;
            let record = state.collections.get_mut(uuid).ok_or(FsError::NotFound)?;
            if record.version != expect_version {
                return Err(FsError::Conflict);
            }
            record.manifest_text = manifest_text.to_string();
            record.portable_data_hash = manifest::portable_data_hash(manifest_text);
            record.version += 1;
            Ok(record.clone())
        }

        fn delete_collection(&self, uuid: &str) -> Result<(), FsError> {
            let mut state = self.state.lock().unwrap();
            state.collections.remove(uuid).ok_or(FsError::NotFound)?;
            Ok(())
        }

        fn list_collections(&self, owner_uuid: &str) -> Result<Vec<CollectionRecord>, FsError> {
            let state = self.state.lock().unwrap();
            let mut items: Vec<CollectionRecord> = state
                .collections
                .values()
                .filter(|r| r.owner_uuid == owner_uuid)
                .cloned()
                .collect();
            items.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(items)
        }

        fn list_projects(&self, owner_uuid: &str) -> Result<Vec<ProjectRecord>, FsError> {
            let state = self.state.lock().unwrap();
            Ok(state
                .projects
                .iter()
                .filter(|p| p.owner_uuid == owner_uuid)
                .cloned()
                .collect())
        }

        fn list_shared(&self, exclude: Option<&str>) -> Result<Vec<SharedOwner>, FsError> {
            let state = self.state.lock().unwrap();
            Ok(state
                .shared
                .iter()
                .filter(|o| Some(o.uuid.as_str()) != exclude)
                .cloned()
                .collect())
        }

        fn list_tags(&self) -> Result<Vec<TagLink>, FsError> {
            Ok(self.state.lock().unwrap().tags.clone())
        }

        fn get_block(&self, locator: &BlockLocator) -> Result<Vec<u8>, FsError> {
            let mut state = self.state.lock().unwrap();
            state.get_block_calls += 1;
            state
                .blocks
                .get(&locator.stripped())
                .cloned()
                .ok_or_else(|| FsError::Transient(format!("block {locator} unavailable")))
        }

        fn put_block(&self, data: &[u8]) -> Result<BlockLocator, FsError> {
            Ok(self.store_block(data))
        }
    }
}
