// Copyright 2017 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! An optional remote mirror for the content store. `Store` consults this only after a local
//! miss, and always re-populates the local store on a remote hit so the cost of the round trip
//! is paid at most once per digest per machine.

use async_trait::async_trait;
use hashing::Digest;
use reqwest::Client;

use crate::{StoreError, StoreResult};

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn load_bytes(&self, digest: Digest) -> StoreResult<Option<Vec<u8>>>;
    async fn store_bytes(&self, bytes: &[u8]) -> StoreResult<Digest>;
}

/// A remote CAS reachable over plain HTTP GET/PUT by content digest, addressed as
/// `{base_url}/{fingerprint_hex}`. This is deliberately the simplest possible wire protocol --
/// concrete deployments (a Bazel remote-execution-API CAS, a blob-storage bucket fronted by a
/// thin proxy) can implement the same [`RemoteStore`] trait with their own client.
pub struct HttpRemoteStore {
    base_url: String,
    client: Client,
}

impl HttpRemoteStore {
    pub fn new(base_url: impl Into<String>) -> HttpRemoteStore {
        HttpRemoteStore {
            base_url: base_url.into(),
            client: Client::new(),
        }
    }

    fn url_for(&self, digest: Digest) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), digest.hash.to_hex())
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn load_bytes(&self, digest: Digest) -> StoreResult<Option<Vec<u8>>> {
        let response = self
            .client
            .get(self.url_for(digest))
            .send()
            .await
            .map_err(|e| StoreError::Remote(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let bytes = response
            .error_for_status()
            .map_err(|e| StoreError::Remote(e.to_string()))?
            .bytes()
            .await
            .map_err(|e| StoreError::Remote(e.to_string()))?;
        if bytes.len() != digest.size_bytes {
            return Err(StoreError::Corruption(format!(
                "remote returned {} bytes for digest {digest}",
                bytes.len()
            )));
        }
        Ok(Some(bytes.to_vec()))
    }

    async fn store_bytes(&self, bytes: &[u8]) -> StoreResult<Digest> {
        let digest = Digest::of_bytes(bytes);
        self.client
            .put(self.url_for(digest))
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| StoreError::Remote(e.to_string()))?
            .error_for_status()
            .map_err(|e| StoreError::Remote(e.to_string()))?;
        Ok(digest)
    }
}
