use std::time::Duration;

use anchor_storage_core::ContentId;
use anchor_storage_ipfs::{
    IpfsClient,
    IpfsClientError,
    IpfsObject,
};
use async_trait::async_trait;

/// Content addressed blob store the orchestrator writes to.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn add(&self, content: &str) -> Result<ContentId, IpfsClientError>;

    async fn read(&self, id: &str) -> Result<IpfsObject, IpfsClientError>;

    /// Stored size of `id`, measured without fetching the content.
    async fn content_length(&self, id: &str) -> Result<u64, IpfsClientError>;

    async fn pin(
        &self,
        ids: &[ContentId],
        timeout: Option<Duration>,
    ) -> Result<Vec<ContentId>, IpfsClientError>;

    async fn connect_peer(&self, multiaddr: &str) -> Result<(), IpfsClientError>;
}

#[async_trait]
impl ContentStore for IpfsClient {
    async fn add(&self, content: &str) -> Result<ContentId, IpfsClientError> {
        IpfsClient::add(self, content).await
    }

    async fn read(&self, id: &str) -> Result<IpfsObject, IpfsClientError> {
        IpfsClient::read(self, id).await
    }

    async fn content_length(&self, id: &str) -> Result<u64, IpfsClientError> {
        self.get_content_length(id).await
    }

    async fn pin(
        &self,
        ids: &[ContentId],
        timeout: Option<Duration>,
    ) -> Result<Vec<ContentId>, IpfsClientError> {
        IpfsClient::pin(self, ids, timeout).await
    }

    async fn connect_peer(&self, multiaddr: &str) -> Result<(), IpfsClientError> {
        self.swarm_connect(multiaddr).await.map(|_| ())
    }
}

#[cfg(any(test, feature = "test"))]
pub use memory::MemoryContentStore;

#[cfg(any(test, feature = "test"))]
mod memory {
    use std::{
        collections::HashMap,
        time::Duration,
    };

    use alloy::primitives::keccak256;
    use anchor_storage_core::ContentId;
    use anchor_storage_ipfs::{
        IpfsClientError,
        IpfsObject,
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::ContentStore;

    #[derive(Debug, Default)]
    struct Entry {
        content: String,
        reported_size: Option<u64>,
    }

    /// [`ContentStore`] keeping content in memory under its keccak hash.
    #[derive(Debug, Default)]
    pub struct MemoryContentStore {
        entries: Mutex<HashMap<ContentId, Entry>>,
        pinned: Mutex<Vec<ContentId>>,
        peers: Mutex<Vec<String>>,
        fail_adds: Mutex<bool>,
    }

    impl MemoryContentStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes `content_length` report `size` for `id` from now on.
        pub fn set_reported_size(&self, id: &str, size: u64) {
            if let Some(entry) = self.entries.lock().get_mut(id) {
                entry.reported_size = Some(size);
            }
        }

        pub fn remove(&self, id: &str) {
            self.entries.lock().remove(id);
        }

        pub fn fail_adds(&self, fail: bool) {
            *self.fail_adds.lock() = fail;
        }

        pub fn pinned(&self) -> Vec<ContentId> {
            self.pinned.lock().clone()
        }

        pub fn peers(&self) -> Vec<String> {
            self.peers.lock().clone()
        }

        pub fn len(&self) -> usize {
            self.entries.lock().len()
        }

        pub fn is_empty(&self) -> bool {
            self.entries.lock().is_empty()
        }
    }

    #[async_trait]
    impl ContentStore for MemoryContentStore {
        async fn add(&self, content: &str) -> Result<ContentId, IpfsClientError> {
            if *self.fail_adds.lock() {
                return Err(IpfsClientError::GatewayReportedError(
                    "add refused".to_string(),
                ));
            }
            let id = keccak256(content.as_bytes()).to_string();
            self.entries.lock().insert(
                id.clone(),
                Entry {
                    content: content.to_string(),
                    reported_size: None,
                },
            );
            Ok(id)
        }

        async fn read(&self, id: &str) -> Result<IpfsObject, IpfsClientError> {
            let entries = self.entries.lock();
            let entry = entries
                .get(id)
                .ok_or_else(|| IpfsClientError::NotFound(id.to_string()))?;
            Ok(IpfsObject {
                content: entry.content.clone(),
                ipfs_size: entry.content.len() as u64,
                ipfs_links: Vec::new(),
            })
        }

        async fn content_length(&self, id: &str) -> Result<u64, IpfsClientError> {
            let entries = self.entries.lock();
            let entry = entries
                .get(id)
                .ok_or_else(|| IpfsClientError::NotFound(id.to_string()))?;
            Ok(entry
                .reported_size
                .unwrap_or(entry.content.len() as u64))
        }

        async fn pin(
            &self,
            ids: &[ContentId],
            _timeout: Option<Duration>,
        ) -> Result<Vec<ContentId>, IpfsClientError> {
            let entries = self.entries.lock();
            if let Some(missing) = ids.iter().find(|id| !entries.contains_key(*id)) {
                return Err(IpfsClientError::NotFound(missing.clone()));
            }
            self.pinned.lock().extend(ids.iter().cloned());
            Ok(ids.to_vec())
        }

        async fn connect_peer(&self, multiaddr: &str) -> Result<(), IpfsClientError> {
            self.peers.lock().push(multiaddr.to_string());
            Ok(())
        }
    }
}
