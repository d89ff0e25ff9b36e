#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod anchor;
pub mod blocks;
pub mod chain;
pub mod config;
pub mod content;
pub mod data_access;
pub mod indexer;
pub mod metadata_cache;
pub mod metrics;
pub mod pending;
pub mod storage;
pub mod utils;

pub use anchor::{
    AnchorClient,
    AnchorClientConfig,
    AnchorError,
};
pub use blocks::{
    BlockIndexConfig,
    BlockIndexError,
    BlockTimestampIndex,
};
pub use config::Config;
pub use data_access::{
    DataAccessError,
    IndexedDataAccess,
    PersistHandle,
    PersistOutcome,
};
pub use indexer::{
    SubgraphIndexer,
    TransactionIndexer,
};
pub use metadata_cache::AnchorMetadataCache;
pub use pending::{
    PendingWrite,
    PendingWriteStore,
};
pub use storage::{
    AnchoredStorage,
    StorageError,
};
