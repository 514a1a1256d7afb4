//! Object-store backend.
//!
//! Persists the commit log as a manifest chain with columnar data files
//! under a key prefix; `meta/head.json` is the sole authoritative head
//! and every commit linearises through a conditional (etag) replace of
//! it. Advisory per-type indices accelerate reads and are repaired from
//! the manifest chain when they lag.

mod compact;
#[cfg(any(test, feature = "duckdb"))]
mod duck;
mod events;
mod index;
mod layout;
mod lockobj;
mod manifest;
mod parq;
mod repo;
mod scan;

pub use repo::ObjectRepository;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::memory::InMemory;
use object_store::path::Path as ObjPath;
use object_store::{
    GetOptions, ObjectMeta, ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion,
};
use serde::Serialize;
use serde::de::DeserializeOwned;

use ontic_core::config::EngineConfig;
use ontic_core::error::{EngineError, Result};

/// Outcome of a conditional put.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CasOutcome {
    /// The write landed; carries the new etag.
    Stored(Option<String>),
    /// The precondition failed (object changed or already exists).
    Conflict,
}

/// A fetched object with its etag.
pub(crate) struct Fetched {
    pub bytes: Bytes,
    pub e_tag: Option<String>,
}

/// Synchronous bridge over an [`ObjectStore`].
///
/// The crate is synchronous end to end; a private current-thread runtime
/// drives the store's futures.
pub(crate) struct Store {
    inner: Arc<dyn ObjectStore>,
    prefix: ObjPath,
    rt: tokio::runtime::Runtime,
}

impl Store {
    fn new(inner: Arc<dyn ObjectStore>, prefix: &str) -> Result<Self> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| EngineError::storage(format!("runtime start failed: {e}")))?;
        Ok(Self {
            inner,
            prefix: ObjPath::from(prefix),
            rt,
        })
    }

    pub(crate) fn path(&self, rel: &str) -> ObjPath {
        if self.prefix.as_ref().is_empty() {
            ObjPath::from(rel)
        } else {
            ObjPath::from(format!("{}/{rel}", self.prefix))
        }
    }

    /// Strips the store prefix from an absolute object path.
    pub(crate) fn rel(&self, path: &ObjPath) -> String {
        let full = path.as_ref();
        let prefix = self.prefix.as_ref();
        if prefix.is_empty() {
            full.to_string()
        } else {
            full.strip_prefix(&format!("{prefix}/"))
                .unwrap_or(full)
                .to_string()
        }
    }

    pub(crate) fn get(&self, rel: &str) -> Result<Option<Fetched>> {
        let path = self.path(rel);
        let result = self.rt.block_on(async {
            match self.inner.get_opts(&path, GetOptions::default()).await {
                Ok(r) => {
                    let e_tag = r.meta.e_tag.clone();
                    let bytes = r.bytes().await?;
                    Ok(Some(Fetched { bytes, e_tag }))
                }
                Err(object_store::Error::NotFound { .. }) => Ok(None),
                Err(e) => Err(e),
            }
        });
        result.map_err(|e: object_store::Error| {
            EngineError::storage(format!("get {rel} failed: {e}"))
        })
    }

    /// Unconditional write.
    pub(crate) fn put(&self, rel: &str, bytes: Bytes) -> Result<()> {
        let path = self.path(rel);
        self.rt
            .block_on(self.inner.put(&path, PutPayload::from(bytes)))
            .map(|_| ())
            .map_err(|e| EngineError::storage(format!("put {rel} failed: {e}")))
    }

    /// Create-only write (`If-None-Match: *`).
    pub(crate) fn put_create(&self, rel: &str, bytes: Bytes) -> Result<CasOutcome> {
        let path = self.path(rel);
        let opts = PutOptions::from(PutMode::Create);
        match self
            .rt
            .block_on(self.inner.put_opts(&path, PutPayload::from(bytes), opts))
        {
            Ok(result) => Ok(CasOutcome::Stored(result.e_tag)),
            Err(object_store::Error::AlreadyExists { .. }) => Ok(CasOutcome::Conflict),
            Err(e) => Err(EngineError::storage(format!("create {rel} failed: {e}"))),
        }
    }

    /// Conditional replace against an observed etag (`If-Match`).
    pub(crate) fn put_if_match(
        &self,
        rel: &str,
        bytes: Bytes,
        e_tag: Option<String>,
    ) -> Result<CasOutcome> {
        let Some(e_tag) = e_tag else {
            // No observed version: the object must not exist yet.
            return self.put_create(rel, bytes);
        };
        let path = self.path(rel);
        let opts = PutOptions::from(PutMode::Update(UpdateVersion {
            e_tag: Some(e_tag),
            version: None,
        }));
        match self
            .rt
            .block_on(self.inner.put_opts(&path, PutPayload::from(bytes), opts))
        {
            Ok(result) => Ok(CasOutcome::Stored(result.e_tag)),
            Err(object_store::Error::Precondition { .. }) => Ok(CasOutcome::Conflict),
            Err(object_store::Error::AlreadyExists { .. }) => Ok(CasOutcome::Conflict),
            Err(e) => Err(EngineError::storage(format!("cas {rel} failed: {e}"))),
        }
    }

    pub(crate) fn delete(&self, rel: &str) -> Result<()> {
        let path = self.path(rel);
        match self.rt.block_on(self.inner.delete(&path)) {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(EngineError::storage(format!("delete {rel} failed: {e}"))),
        }
    }

    /// Lists objects under a relative prefix, sorted by path.
    pub(crate) fn list(&self, rel_prefix: &str) -> Result<Vec<ObjectMeta>> {
        let prefix = self.path(rel_prefix);
        let mut metas: Vec<ObjectMeta> = self
            .rt
            .block_on(self.inner.list(Some(&prefix)).try_collect::<Vec<_>>())
            .map_err(|e| EngineError::storage(format!("list {rel_prefix} failed: {e}")))?;
        metas.sort_by(|a, b| a.location.as_ref().cmp(b.location.as_ref()));
        Ok(metas)
    }

    // -- JSON helpers --------------------------------------------------------

    pub(crate) fn get_json<T: DeserializeOwned>(&self, rel: &str) -> Result<Option<(T, Option<String>)>> {
        match self.get(rel)? {
            None => Ok(None),
            Some(fetched) => {
                let value = serde_json::from_slice(&fetched.bytes).map_err(|e| {
                    EngineError::metadata(format!("corrupt object {rel}: {e}"))
                })?;
                Ok(Some((value, fetched.e_tag)))
            }
        }
    }

    pub(crate) fn put_json<T: Serialize>(&self, rel: &str, value: &T) -> Result<()> {
        self.put(rel, Bytes::from(serde_json::to_vec_pretty(value)?))
    }

    pub(crate) fn put_json_if_match<T: Serialize>(
        &self,
        rel: &str,
        value: &T,
        e_tag: Option<String>,
    ) -> Result<CasOutcome> {
        self.put_if_match(rel, Bytes::from(serde_json::to_vec_pretty(value)?), e_tag)
    }

    pub(crate) fn put_json_create<T: Serialize>(&self, rel: &str, value: &T) -> Result<CasOutcome> {
        self.put_create(rel, Bytes::from(serde_json::to_vec_pretty(value)?))
    }
}

// ---------------------------------------------------------------------------
// URI parsing
// ---------------------------------------------------------------------------

/// Named in-process stores for `mem://` URIs, shared across opens so that
/// concurrent repositories in one process observe the same objects.
static MEM_STORES: OnceLock<Mutex<HashMap<String, Arc<InMemory>>>> = OnceLock::new();

/// Builds the store and key prefix for a backend URI.
pub(crate) fn store_for_uri(uri: &str, config: &EngineConfig) -> Result<Store> {
    if let Some(rest) = uri.strip_prefix("mem://") {
        let (name, prefix) = match rest.split_once('/') {
            Some((name, prefix)) => (name.to_string(), prefix.to_string()),
            None => (rest.to_string(), String::new()),
        };
        let stores = MEM_STORES.get_or_init(|| Mutex::new(HashMap::new()));
        let inner = {
            let mut stores = stores
                .lock()
                .map_err(|e| EngineError::storage(format!("store registry poisoned: {e}")))?;
            Arc::clone(stores.entry(name).or_insert_with(|| Arc::new(InMemory::new())))
        };
        return Store::new(inner, &prefix);
    }
    if let Some(rest) = uri.strip_prefix("file://") {
        let store = object_store::local::LocalFileSystem::new_with_prefix(rest)
            .map_err(|e| EngineError::storage(format!("local store at {rest} failed: {e}")))?;
        return Store::new(Arc::new(store), "");
    }
    if let Some(rest) = uri.strip_prefix("s3://") {
        let (bucket, prefix) = match rest.split_once('/') {
            Some((bucket, prefix)) => (bucket, prefix.trim_end_matches('/')),
            None => (rest, ""),
        };
        let client_options = object_store::ClientOptions::new()
            .with_timeout(std::time::Duration::from_secs(config.s3_request_timeout_s));
        let mut builder = object_store::aws::AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .with_conditional_put(object_store::aws::S3ConditionalPut::ETagMatch)
            .with_client_options(client_options);
        if let Some(region) = &config.s3_region {
            builder = builder.with_region(region.clone());
        }
        if let Some(endpoint) = &config.s3_endpoint_url {
            builder = builder.with_endpoint(endpoint.clone()).with_allow_http(true);
        }
        let store = builder
            .build()
            .map_err(|e| EngineError::storage(format!("s3 store for {bucket} failed: {e}")))?;
        return Store::new(Arc::new(store), prefix);
    }
    Err(EngineError::validation(format!(
        "unsupported object store uri `{uri}`"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_store(name: &str) -> Store {
        store_for_uri(&format!("mem://{name}/repo"), &EngineConfig::default()).unwrap()
    }

    #[test]
    fn json_round_trip() {
        let store = test_store("json-rt");
        store.put_json("meta/x.json", &json!({ "a": 1 })).unwrap();
        let (value, e_tag) = store
            .get_json::<serde_json::Value>("meta/x.json")
            .unwrap()
            .unwrap();
        assert_eq!(value, json!({ "a": 1 }));
        assert!(e_tag.is_some());
    }

    #[test]
    fn create_conflicts_on_existing_object() {
        let store = test_store("create-conflict");
        assert!(matches!(
            store.put_json_create("a.json", &json!(1)).unwrap(),
            CasOutcome::Stored(_)
        ));
        assert_eq!(
            store.put_json_create("a.json", &json!(2)).unwrap(),
            CasOutcome::Conflict
        );
    }

    #[test]
    fn cas_detects_concurrent_replacement() {
        let store = test_store("cas");
        store.put_json("head.json", &json!({ "v": 1 })).unwrap();
        let (_, e_tag) = store
            .get_json::<serde_json::Value>("head.json")
            .unwrap()
            .unwrap();
        // A concurrent writer replaces the object.
        store.put_json("head.json", &json!({ "v": 2 })).unwrap();
        let outcome = store
            .put_json_if_match("head.json", &json!({ "v": 3 }), e_tag)
            .unwrap();
        assert_eq!(outcome, CasOutcome::Conflict);
    }

    #[test]
    fn mem_stores_share_state_per_name() {
        let a = test_store("shared");
        let b = store_for_uri("mem://shared/repo", &EngineConfig::default()).unwrap();
        a.put_json("x.json", &json!(42)).unwrap();
        let (value, _) = b.get_json::<serde_json::Value>("x.json").unwrap().unwrap();
        assert_eq!(value, json!(42));
    }
}
