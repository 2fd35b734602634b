//! Per-node fragment storage
//!
//! Fragments are keyed by `(owner, filename, part)`. How a key maps onto
//! disk is a backend detail:
//! - [`FsBackend`] (default) keeps `<root>/<owner>/.<filename>,<part>`
//! - `RocksBackend` (feature `rocksdb`) keeps every fragment of the node in
//!   one RocksDB database
//!
//! Backends are synchronous; [`NodeStore`] runs them on the blocking pool.
//! Listing yields keys only, fragment bytes are read one at a time.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::fragmenter::PartIndex;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Invalid name: {0:?}")]
    InvalidName(String),

    #[error("Fragment not found: {0}")]
    NotFound(String),

    #[error("Backend not compiled in: {0}")]
    BackendUnavailable(&'static str),

    #[cfg(feature = "rocksdb")]
    #[error("Database error: {0}")]
    DatabaseError(#[from] rocksdb::Error),

    #[cfg(feature = "rocksdb")]
    #[error("Key encoding error: {0}")]
    KeyEncoding(#[from] bincode::Error),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

/// Reject names that could escape a namespace directory
pub fn validate_name(name: &str) -> Result<(), StoreError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if bad {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Logical identity of a stored fragment
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    pub owner: String,
    pub filename: String,
    pub part: PartIndex,
}

impl FragmentKey {
    pub fn new(
        owner: impl Into<String>,
        filename: impl Into<String>,
        part: PartIndex,
    ) -> Result<Self, StoreError> {
        let owner = owner.into();
        let filename = filename.into();
        validate_name(&owner)?;
        validate_name(&filename)?;
        Ok(Self {
            owner,
            filename,
            part,
        })
    }
}

impl fmt::Display for FragmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.owner, self.filename, self.part)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFragment {
    pub key: FragmentKey,
    pub data: Bytes,
}

/// Which backend a node persists fragments with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Fs,
    Rocksdb,
}

/// Synchronous keyed fragment storage
///
/// `put_batch` replaces any existing value for each key. Nothing of the
/// batch becomes visible until every fragment was written.
pub trait FragmentBackend: Send + Sync + 'static {
    fn put_batch(&self, fragments: &[StoredFragment]) -> Result<(), StoreError>;

    fn get(&self, key: &FragmentKey) -> Result<Bytes, StoreError>;

    /// Keys of every fragment owned by `owner`, in no particular order
    fn list(&self, owner: &str) -> Result<Vec<FragmentKey>, StoreError>;
}

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Directory-per-owner backend
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace(&self, owner: &str) -> PathBuf {
        self.root.join(owner)
    }

    /// On-disk name for a fragment: `.<filename>,<part>`
    pub fn encode_file_name(filename: &str, part: PartIndex) -> String {
        format!(".{},{}", filename, part)
    }

    /// Inverse of [`FsBackend::encode_file_name`]
    pub fn parse_file_name(name: &str) -> Option<(String, PartIndex)> {
        let rest = name.strip_prefix('.')?;
        let (filename, part) = rest.rsplit_once(',')?;
        if filename.is_empty() {
            return None;
        }
        let part = part.parse().ok()?;
        Some((filename.to_string(), part))
    }
}

impl FragmentBackend for FsBackend {
    fn put_batch(&self, fragments: &[StoredFragment]) -> Result<(), StoreError> {
        let mut staged: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(fragments.len());

        for fragment in fragments {
            let dir = self.namespace(&fragment.key.owner);
            let name = Self::encode_file_name(&fragment.key.filename, fragment.key.part);
            // Temp names never start with '.', so listing skips them
            let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
            let tmp = dir.join(format!("~{}.{}.tmp", name, seq));

            let written = fs::create_dir_all(&dir).and_then(|_| fs::write(&tmp, &fragment.data));
            if let Err(e) = written {
                let _ = fs::remove_file(&tmp);
                for (tmp, _) in &staged {
                    let _ = fs::remove_file(tmp);
                }
                return Err(e.into());
            }
            staged.push((tmp, dir.join(name)));
        }

        for (tmp, target) in &staged {
            fs::rename(tmp, target)?;
        }
        Ok(())
    }

    fn get(&self, key: &FragmentKey) -> Result<Bytes, StoreError> {
        let path = self
            .namespace(&key.owner)
            .join(Self::encode_file_name(&key.filename, key.part));
        match fs::read(&path) {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, owner: &str) -> Result<Vec<FragmentKey>, StoreError> {
        let dir = self.namespace(owner);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some((filename, part)) = entry
                .file_name()
                .to_str()
                .and_then(FsBackend::parse_file_name)
            else {
                debug!(path = ?entry.path(), "Skipping unrecognised file in namespace");
                continue;
            };

            keys.push(FragmentKey {
                owner: owner.to_string(),
                filename,
                part,
            });
        }

        Ok(keys)
    }
}

#[cfg(feature = "rocksdb")]
pub use rocks::RocksBackend;

#[cfg(feature = "rocksdb")]
mod rocks {
    use super::*;
    use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};

    /// Single-database backend; keys are bincode `(owner, filename, part)`
    pub struct RocksBackend {
        db: DB,
    }

    impl RocksBackend {
        pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
            let mut opts = Options::default();
            opts.create_if_missing(true);

            // Fragments are opaque file bytes, don't spend CPU compressing them
            opts.set_compression_type(rocksdb::DBCompressionType::None);
            opts.increase_parallelism(num_cpus::get() as i32);
            opts.set_max_background_jobs(4);
            opts.set_write_buffer_size(64 * 1024 * 1024);

            let db = DB::open(&opts, path.as_ref())?;
            info!("Opened RocksDB fragment store at {:?}", path.as_ref());
            Ok(Self { db })
        }

        fn encode_key(key: &FragmentKey) -> Result<Vec<u8>, StoreError> {
            Ok(bincode::serialize(&(&key.owner, &key.filename, key.part.get()))?)
        }

        // A bincode string is length + bytes, so the encoded owner is a
        // prefix of every key it owns and of no other owner's keys.
        fn owner_prefix(owner: &str) -> Result<Vec<u8>, StoreError> {
            Ok(bincode::serialize(owner)?)
        }
    }

    impl FragmentBackend for RocksBackend {
        fn put_batch(&self, fragments: &[StoredFragment]) -> Result<(), StoreError> {
            let mut batch = WriteBatch::default();
            for fragment in fragments {
                batch.put(Self::encode_key(&fragment.key)?, &fragment.data);
            }
            self.db.write(batch)?;
            Ok(())
        }

        fn get(&self, key: &FragmentKey) -> Result<Bytes, StoreError> {
            self.db
                .get(Self::encode_key(key)?)?
                .map(Bytes::from)
                .ok_or_else(|| StoreError::NotFound(key.to_string()))
        }

        fn list(&self, owner: &str) -> Result<Vec<FragmentKey>, StoreError> {
            let prefix = Self::owner_prefix(owner)?;
            let iter = self
                .db
                .iterator(IteratorMode::From(&prefix, Direction::Forward));

            let mut keys = Vec::new();
            for item in iter {
                let (raw_key, _) = item?;
                if !raw_key.starts_with(&prefix) {
                    break;
                }
                let (key_owner, filename, part): (String, String, u8) =
                    bincode::deserialize(&raw_key)?;
                let Some(part) = PartIndex::new(part) else {
                    debug!(owner = %key_owner, filename = %filename, "Skipping key with bad part");
                    continue;
                };
                keys.push(FragmentKey {
                    owner: key_owner,
                    filename,
                    part,
                });
            }
            Ok(keys)
        }
    }
}

/// Async handle over a fragment backend, shared by all connections of a node
#[derive(Clone)]
pub struct NodeStore {
    backend: Arc<dyn FragmentBackend>,
}

impl NodeStore {
    /// Open the configured backend rooted at `root`
    pub fn open(kind: StoreBackend, root: impl AsRef<Path>) -> Result<Self, StoreError> {
        match kind {
            StoreBackend::Fs => Self::filesystem(root),
            #[cfg(feature = "rocksdb")]
            StoreBackend::Rocksdb => Ok(Self::with_backend(RocksBackend::open(root)?)),
            #[cfg(not(feature = "rocksdb"))]
            StoreBackend::Rocksdb => Err(StoreError::BackendUnavailable("rocksdb")),
        }
    }

    pub fn filesystem(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let backend = FsBackend::new(root)?;
        info!("Opened fragment store at {:?}", backend.root());
        Ok(Self::with_backend(backend))
    }

    pub fn with_backend(backend: impl FragmentBackend) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    /// Persist fragments together, replacing previous values for their keys
    pub async fn put_batch(&self, fragments: Vec<StoredFragment>) -> Result<(), StoreError> {
        let backend = Arc::clone(&self.backend);

        let fragments = tokio::task::spawn_blocking(move || {
            backend.put_batch(&fragments).map(|_| fragments)
        })
        .await
        .map_err(|e| StoreError::IoError(io::Error::other(e.to_string())))??;

        for fragment in &fragments {
            info!("Stored fragment {}, size: {} bytes", fragment.key, fragment.data.len());
        }
        Ok(())
    }

    pub async fn get(&self, key: FragmentKey) -> Result<Bytes, StoreError> {
        let backend = Arc::clone(&self.backend);

        tokio::task::spawn_blocking(move || backend.get(&key))
            .await
            .map_err(|e| StoreError::IoError(io::Error::other(e.to_string())))?
    }

    /// Keys of all fragments in `owner`'s namespace
    pub async fn list(&self, owner: &str) -> Result<Vec<FragmentKey>, StoreError> {
        validate_name(owner)?;
        let backend = Arc::clone(&self.backend);
        let owner = owner.to_string();

        tokio::task::spawn_blocking(move || backend.list(&owner))
            .await
            .map_err(|e| StoreError::IoError(io::Error::other(e.to_string())))?
    }
}
