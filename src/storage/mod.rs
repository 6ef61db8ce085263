//! Abstract blob key-value storage (C1).
//!
//! The core never talks to a concrete database; it consumes this trait, and
//! any conforming adapter (in-memory, filesystem, object storage, ...) can be
//! plugged in. Keys are UTF-8 paths grouped by the prefixes the core owns:
//! `nouns/`, `verbs/`, `meta-index/<field>/`, `index/hnsw/`,
//! `stats/<service>/<yyyy-mm-dd>`, `wal/<segment>`.

pub mod fs;
pub mod memory;

use crate::error::{DbError, Result};
use async_trait::async_trait;

/// Minimal blob key-value contract the core consumes.
///
/// Implementations must be cheap to clone (e.g. an `Arc` around shared
/// state) since the core holds one instance per `Database` and passes it
/// around its components.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Fetch the bytes stored at `key`, or `Ok(None)` if absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` at `key`, overwriting any existing value.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Remove `key`. Returns `Ok(false)` if it did not exist.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// List keys under `prefix`, in ascending lexicographic order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Fetch and deserialize a `bincode`-encoded value, mapping absence to `None`.
pub async fn get_decoded<T, S>(backend: &S, key: &str) -> Result<Option<T>>
where
    T: serde::de::DeserializeOwned,
    S: StorageBackend + ?Sized,
{
    match backend.get(key).await? {
        Some(bytes) => {
            let (value, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| DbError::Corruption(format!("decoding {key}: {e}")))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Serialize a value with `bincode` and store it under `key`.
pub async fn put_encoded<T, S>(backend: &S, key: &str, value: &T) -> Result<()>
where
    T: serde::Serialize,
    S: StorageBackend + ?Sized,
{
    let bytes = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| DbError::InvalidInput(format!("encoding {key}: {e}")))?;
    backend.put(key, bytes).await
}
