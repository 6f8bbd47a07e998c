//! Record storage for the deep-bridge cache.
//!
//! This crate provides the `RecordStorage` trait used by the server-side
//! file cache. Every cache entry is one record, addressed by
//! [`RecordPath`] (`collection/key`), so a corrupt or partially written
//! entry never affects its neighbours.
//!
//! # Layout
//!
//! ```text
//! cache_dir/
//! ├── analysis/
//! │   ├── 9f86d081884c7d65....json
//! │   └── 2c26b46b68ffc68f....json
//! └── thought_groups/
//!     └── ...
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use bridge_storage::{LocalStorage, RecordPath, RecordStorage};
//! use bytes::Bytes;
//!
//! # async fn example() -> bridge_storage::Result<()> {
//! let storage = LocalStorage::new("/tmp/deep-bridge-cache");
//! let path = RecordPath::new("analysis", "9f86d081884c7d65")?;
//! storage.write(&path, Bytes::from("{}")).await?;
//! let data = storage.read(&path).await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod local;
mod path;
mod traits;

pub use error::{Result, StorageError};
pub use local::LocalStorage;
pub use path::{RecordPath, RECORD_EXTENSION};
pub use traits::{RecordMeta, RecordStorage};
