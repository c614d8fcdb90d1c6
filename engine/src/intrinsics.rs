// Copyright 2017 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The fixed set of native graph nodes. Each intrinsic is a pure function of its single input
//! param, keyed identically to a rule's output -- `NodeKey::run` dispatches to [`run`] by id
//! exactly the way it dispatches to a `Rules::body` for a rule.
//!
//! Every intrinsic takes one request type as its sole declared input, the same "one subject
//! param" shape `rule_graph::Get` assumes for a rule's own sub-requests, so a backend rule can
//! `get(Output, Input)` an intrinsic exactly like it would a rule.

use std::time::Duration;

use fs::directory::{Directory, DirectoryDigest, DirectoryEntry, EMPTY_DIRECTORY_DIGEST};
use fs::{PathGlobs, RelativePath};
use hashing::Digest as FileDigest;
use process_execution::{Context as ProcessContext, Process, ProcessResult};
use rule_graph::TypeId;
use url::Url;

use crate::node::{ExecutionContext, NodeError};
use crate::value::{Params, Value};

pub const DIGEST_CONTENTS: &str = "intrinsic::digest_contents";
pub const PATH_GLOBS_TO_SNAPSHOT: &str = "intrinsic::path_globs_to_snapshot";
pub const MERGE_DIGESTS: &str = "intrinsic::merge_digests";
pub const REMOVE_PREFIX: &str = "intrinsic::remove_prefix";
pub const ADD_PREFIX: &str = "intrinsic::add_prefix";
pub const EXECUTE_PROCESS: &str = "intrinsic::execute_process";
pub const DOWNLOAD_FILE: &str = "intrinsic::download_file";

pub fn type_digest() -> TypeId {
    TypeId("Digest")
}
pub fn type_file_digest() -> TypeId {
    TypeId("FileDigest")
}
pub fn type_path_globs() -> TypeId {
    TypeId("PathGlobs")
}
pub fn type_snapshot() -> TypeId {
    TypeId("Snapshot")
}
pub fn type_file_contents() -> TypeId {
    TypeId("FileContents")
}
pub fn type_merge_digests_request() -> TypeId {
    TypeId("MergeDigestsRequest")
}
pub fn type_remove_prefix_request() -> TypeId {
    TypeId("RemovePrefixRequest")
}
pub fn type_add_prefix_request() -> TypeId {
    TypeId("AddPrefixRequest")
}
pub fn type_download_file_request() -> TypeId {
    TypeId("DownloadFileRequest")
}
pub fn type_process() -> TypeId {
    TypeId("Process")
}
pub fn type_process_result() -> TypeId {
    TypeId("ProcessResult")
}

/// A root request can only ever be one of these: every other product is reached by a rule or
/// intrinsic that derives it from one of these, directly or transitively.
pub fn root_param_types() -> Vec<TypeId> {
    vec![
        type_digest(),
        type_path_globs(),
        type_merge_digests_request(),
        type_remove_prefix_request(),
        type_add_prefix_request(),
        type_download_file_request(),
        type_process(),
    ]
}

/// Registers every intrinsic's shape with `rules`, so `rule_graph::GraphMaker` can solve `get`s
/// that target them exactly like a rule's.
pub fn register(rules: &mut crate::rules::Rules) {
    rules.add_intrinsic(DIGEST_CONTENTS, type_file_contents(), vec![type_digest()]);
    rules.add_intrinsic(PATH_GLOBS_TO_SNAPSHOT, type_snapshot(), vec![type_path_globs()]);
    rules.add_intrinsic(MERGE_DIGESTS, type_digest(), vec![type_merge_digests_request()]);
    rules.add_intrinsic(REMOVE_PREFIX, type_digest(), vec![type_remove_prefix_request()]);
    rules.add_intrinsic(ADD_PREFIX, type_digest(), vec![type_add_prefix_request()]);
    rules.add_intrinsic(EXECUTE_PROCESS, type_process_result(), vec![type_process()]);
    rules.add_intrinsic(DOWNLOAD_FILE, type_file_digest(), vec![type_download_file_request()]);
}

/// One file's full contents, as read back by `DigestContents`. Kept in memory rather than
/// streamed -- this intrinsic's contract is explicitly "reads an entire tree into memory".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileContent {
    pub path: RelativePath,
    pub content: Vec<u8>,
    pub is_executable: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeDigestsRequest(pub Vec<DirectoryDigest>);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemovePrefixRequest {
    pub digest: DirectoryDigest,
    pub prefix: RelativePath,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddPrefixRequest {
    pub digest: DirectoryDigest,
    pub prefix: RelativePath,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadFileRequest {
    pub url: Url,
    pub expected_digest: FileDigest,
}

/// Dispatches a solved intrinsic id to its native implementation.
pub async fn run(id: &str, params: Params, context: ExecutionContext) -> Result<Value, NodeError> {
    match id {
        DIGEST_CONTENTS => digest_contents(params, context).await,
        PATH_GLOBS_TO_SNAPSHOT => path_globs_to_snapshot(params, context).await,
        MERGE_DIGESTS => merge_digests(params, context).await,
        REMOVE_PREFIX => remove_prefix(params, context).await,
        ADD_PREFIX => add_prefix(params, context).await,
        EXECUTE_PROCESS => execute_process(params, context).await,
        DOWNLOAD_FILE => download_file(params, context).await,
        other => Err(NodeError::Io(format!("unknown intrinsic id `{other}`"))),
    }
}

fn expect_param<T: Clone + Send + Sync + 'static>(params: &Params, type_id: TypeId) -> Result<std::sync::Arc<T>, NodeError> {
    params
        .get(type_id)
        .and_then(|v| v.downcast::<T>())
        .ok_or_else(|| NodeError::Io(format!("intrinsic invoked without its required `{type_id}` param")))
}

async fn digest_contents(params: Params, context: ExecutionContext) -> Result<Value, NodeError> {
    let digest = expect_param::<DirectoryDigest>(&params, type_digest())?;
    let mut contents = Vec::new();
    read_tree_into(&context, *digest, RelativePath::empty(), &mut contents).await?;
    contents.sort_by(|a: &FileContent, b: &FileContent| a.path.cmp(&b.path));
    Ok(Value::new(type_file_contents(), contents))
}

fn read_tree_into<'a>(
    context: &'a ExecutionContext,
    digest: DirectoryDigest,
    prefix: RelativePath,
    out: &'a mut Vec<FileContent>,
) -> futures::future::BoxFuture<'a, Result<(), NodeError>> {
    use futures::future::FutureExt;
    async move {
        let Some(directory) = context.core.store.load_directory(digest)? else {
            return Err(NodeError::Io(format!("unknown directory digest {digest}")));
        };
        for entry in directory.entries() {
            match entry {
                DirectoryEntry::File { name, digest: file_digest, is_executable } => {
                    let path = prefix.join(&RelativePath::new(name).map_err(NodeError::User)?);
                    let bytes = context
                        .core
                        .store
                        .load_bytes(*file_digest)
                        .await?
                        .ok_or_else(|| NodeError::Io(format!("unknown file digest {file_digest}")))?;
                    out.push(FileContent {
                        path,
                        content: bytes,
                        is_executable: *is_executable,
                    });
                }
                DirectoryEntry::Directory { name, digest: child_digest } => {
                    let path = prefix.join(&RelativePath::new(name).map_err(NodeError::User)?);
                    read_tree_into(context, DirectoryDigest(*child_digest), path, out).await?;
                }
            }
        }
        Ok(())
    }
    .boxed()
}

async fn path_globs_to_snapshot(params: Params, context: ExecutionContext) -> Result<Value, NodeError> {
    let globs = expect_param::<PathGlobs>(&params, type_path_globs())?;
    let prepared = (*globs).clone().parse().map_err(NodeError::User)?;
    let snapshot = store::capture_snapshot(&context.core.store, &context.core.build_root, &prepared)?;
    context.session.lease(snapshot.digest.0);
    Ok(Value::new(type_snapshot(), snapshot))
}

async fn merge_digests(params: Params, context: ExecutionContext) -> Result<Value, NodeError> {
    let request = expect_param::<MergeDigestsRequest>(&params, type_merge_digests_request())?;
    let merged = context.core.store.merge_directories(request.0.clone())?;
    context.session.lease(merged.0);
    Ok(Value::new(type_digest(), merged))
}

async fn remove_prefix(params: Params, context: ExecutionContext) -> Result<Value, NodeError> {
    let request = expect_param::<RemovePrefixRequest>(&params, type_remove_prefix_request())?;
    let Some(directory) = context.core.store.load_directory(request.digest)? else {
        return Err(NodeError::Io(format!("unknown directory digest {}", request.digest)));
    };
    let rewritten = strip_prefix(&context, &directory, request.prefix.to_str().unwrap_or_default()).await?;
    let digest = context.core.store.store_directory(&rewritten)?;
    context.session.lease(digest.0);
    Ok(Value::new(type_digest(), digest))
}

async fn strip_prefix(context: &ExecutionContext, directory: &Directory, prefix: &str) -> Result<Directory, NodeError> {
    let mut components = prefix.splitn(2, '/');
    let head = components.next().unwrap_or_default();
    if head.is_empty() {
        return Ok(directory.clone());
    }
    let rest = components.next().unwrap_or_default();
    let entry = directory
        .entries()
        .iter()
        .find(|e| e.name() == head)
        .ok_or_else(|| NodeError::User(format!("{head:?} is not present in the directory being stripped")))?;
    match entry {
        DirectoryEntry::Directory { digest, .. } => {
            let Some(child) = context.core.store.load_directory(DirectoryDigest(*digest))? else {
                return Err(NodeError::Io(format!("unknown directory digest {digest}")));
            };
            Box::pin(strip_prefix(context, &child, rest)).await
        }
        DirectoryEntry::File { .. } => Err(NodeError::User(format!(
            "{head:?} is a file, not a directory; cannot strip it as a path prefix"
        ))),
    }
}

async fn add_prefix(params: Params, context: ExecutionContext) -> Result<Value, NodeError> {
    let request = expect_param::<AddPrefixRequest>(&params, type_add_prefix_request())?;
    let mut digest = request.digest;
    for component in request.prefix.components().collect::<Vec<_>>().into_iter().rev() {
        let name = component.as_os_str().to_string_lossy().into_owned();
        let wrapper = Directory::new(vec![DirectoryEntry::Directory { name, digest: digest.0 }])
            .map_err(|e| NodeError::Io(e.to_string()))?;
        digest = context.core.store.store_directory(&wrapper)?;
    }
    context.session.lease(digest.0);
    Ok(Value::new(type_digest(), digest))
}

async fn execute_process(params: Params, context: ExecutionContext) -> Result<Value, NodeError> {
    let process = expect_param::<Process>(&params, type_process())?;
    context.session.lease(process.input_digest.0);
    let process_context = ProcessContext::new(context.core.workunit_store.clone(), context.core.executor.clone());
    let result = context.core.command_runner.run(process_context, (*process).clone()).await?;
    context.session.lease(result.output_directory);
    Ok(Value::new(type_process_result(), result))
}

/// Base delay for `DownloadFile`'s retry policy; doubled on each subsequent attempt.
const DOWNLOAD_RETRY_BASE_DELAY: Duration = Duration::from_millis(250);
const DOWNLOAD_MAX_ATTEMPTS: u32 = 4;

async fn download_file(params: Params, context: ExecutionContext) -> Result<Value, NodeError> {
    let request = expect_param::<DownloadFileRequest>(&params, type_download_file_request())?;
    let bytes = fetch_with_retry(&context, request.url.as_str(), DOWNLOAD_MAX_ATTEMPTS).await?;
    let digest = FileDigest::of_bytes(&bytes);
    if digest != request.expected_digest {
        return Err(NodeError::User(format!(
            "downloaded content from {} did not match the expected digest: got {digest}, expected {}",
            request.url, request.expected_digest
        )));
    }
    context.core.store.store_bytes(&bytes)?;
    context.session.lease(digest);
    Ok(Value::new(type_file_digest(), digest))
}

/// Exponential backoff: attempt `1, 2, 4, ...` times `DOWNLOAD_RETRY_BASE_DELAY` apart, retrying
/// only transient failures (network errors and 5xx); a 4xx is never retried.
async fn fetch_with_retry(context: &ExecutionContext, url: &str, max_attempts: u32) -> Result<Vec<u8>, NodeError> {
    let client = &context.core.http_client;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match client.get(url).send().await {
            Ok(response) if response.status().is_client_error() => {
                return Err(NodeError::User(format!(
                    "{url} returned {}: not retrying a client error",
                    response.status()
                )));
            }
            Ok(response) => match response.error_for_status() {
                Ok(response) => match response.bytes().await {
                    Ok(bytes) => return Ok(bytes.to_vec()),
                    Err(e) if attempt < max_attempts => {
                        log::warn!("download of {url} failed reading body (attempt {attempt}): {e}");
                    }
                    Err(e) => return Err(NodeError::Io(e.to_string())),
                },
                Err(e) if attempt < max_attempts => {
                    log::warn!("download of {url} failed (attempt {attempt}): {e}");
                }
                Err(e) => return Err(NodeError::Io(e.to_string())),
            },
            Err(e) if attempt < max_attempts => {
                log::warn!("download of {url} failed to connect (attempt {attempt}): {e}");
            }
            Err(e) => return Err(NodeError::Io(e.to_string())),
        }
        let delay = DOWNLOAD_RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_param_types_cover_every_request_shape() {
        let roots = root_param_types();
        assert!(roots.contains(&type_digest()));
        assert!(roots.contains(&type_process()));
        assert!(roots.contains(&type_download_file_request()));
    }

    #[test]
    fn empty_directory_digest_round_trips_through_store_directory() {
        assert_eq!(EMPTY_DIRECTORY_DIGEST.0.size_bytes, 0);
    }

    #[test]
    fn remove_prefix_request_rejects_nothing_up_front() {
        let request = RemovePrefixRequest {
            digest: EMPTY_DIRECTORY_DIGEST,
            prefix: RelativePath::new("a/b").unwrap(),
        };
        assert_eq!(request.prefix.to_str(), Some("a/b"));
    }
}
