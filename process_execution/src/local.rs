// Copyright 2017 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The local execution strategy: materialise a sandbox on this host's filesystem, spawn the
//! process in it, capture its declared outputs, and clean up.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use fs::directory::{Directory, DirectoryDigest, DirectoryEntry};
use fs::RelativePath;
use hashing::Digest;
use store::Store;
use tokio::process::Command;
use workunit_store::{Level, with_workunit};

use crate::{
    CacheName, Context, KeepSandboxes, NamedCaches, Process, ProcessError, ProcessResult,
    ProcessResultMetadata, ProcessResultSource,
};

/// Spawns processes directly on this host, inside a freshly materialised, otherwise-empty
/// sandbox directory. Exactly the paths declared by the process's `input_digest` and named
/// caches are visible; nothing else from the host workspace is.
pub struct CommandRunner {
    store: Store,
    work_dir_base: PathBuf,
    named_caches: NamedCaches,
    keep_sandboxes: KeepSandboxes,
}

impl CommandRunner {
    pub fn new(store: Store, work_dir_base: PathBuf, named_caches: NamedCaches, keep_sandboxes: KeepSandboxes) -> std::io::Result<Self> {
        std::fs::create_dir_all(&work_dir_base)?;
        Ok(CommandRunner {
            store,
            work_dir_base,
            named_caches,
            keep_sandboxes,
        })
    }

    /// Runs `process` with its stdio inherited from this process rather than captured, for the
    /// `run` goal's interactive processes. Does not go through the cache: an interactive
    /// process's point is to talk to the user's terminal live.
    pub async fn run_interactive(&self, process: Process) -> Result<i32, ProcessError> {
        let sandbox = tempfile::Builder::new()
            .prefix("sandbox-")
            .tempdir_in(&self.work_dir_base)
            .map_err(|e| ProcessError::Io(e.to_string()))?;
        materialize_directory(&self.store, process.input_digest, sandbox.path()).await?;
        mount_named_caches(&self.named_caches, sandbox.path(), &process.append_only_caches)
            .map_err(|e| ProcessError::Io(e.to_string()))?;

        let mut command = self.build_command(&process, sandbox.path());
        command.stdin(Stdio::inherit());
        command.stdout(Stdio::inherit());
        command.stderr(Stdio::inherit());

        let mut child = command.spawn().map_err(|e| ProcessError::Io(e.to_string()))?;
        let status = child.wait().await.map_err(|e| ProcessError::Io(e.to_string()))?;
        Ok(status.code().unwrap_or(-1))
    }

    fn build_command(&self, process: &Process, sandbox: &Path) -> Command {
        let mut command = Command::new(&process.argv[0]);
        command.args(&process.argv[1..]);
        command.env_clear();
        command.envs(&process.env);
        let cwd = match &process.working_directory {
            Some(rel) => sandbox.join(rel.as_ref()),
            None => sandbox.to_path_buf(),
        };
        command.current_dir(cwd);
        command.kill_on_drop(true);
        command
    }
}

#[async_trait::async_trait]
impl crate::CommandRunner for CommandRunner {
    async fn run(&self, context: Context, process: Process) -> Result<ProcessResult, ProcessError> {
        with_workunit(
            &context.workunit_store,
            format!("process: {}", process.description),
            Level::Debug,
            context.parent_span,
            self.run_in_sandbox(process),
        )
        .await
    }
}

impl CommandRunner {
    async fn run_in_sandbox(&self, process: Process) -> Result<ProcessResult, ProcessError> {
        let sandbox = tempfile::Builder::new()
            .prefix("sandbox-")
            .tempdir_in(&self.work_dir_base)
            .map_err(|e| ProcessError::Io(e.to_string()))?;

        materialize_directory(&self.store, process.input_digest, sandbox.path()).await?;
        mount_named_caches(&self.named_caches, sandbox.path(), &process.append_only_caches)
            .map_err(|e| ProcessError::Io(e.to_string()))?;
        if let Some(jdk_home) = &process.jdk_home {
            let _ = std::os::unix::fs::symlink(jdk_home, sandbox.path().join(".jdk"));
        }

        let mut command = self.build_command(&process, sandbox.path());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let start = Instant::now();
        let mut child = command.spawn().map_err(|e| ProcessError::Io(e.to_string()))?;
        let output = match process.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, child.wait_with_output()).await {
                Ok(result) => result.map_err(|e| ProcessError::Io(e.to_string()))?,
                Err(_) => return Err(ProcessError::Timeout(timeout)),
            },
            None => child.wait_with_output().await.map_err(|e| ProcessError::Io(e.to_string()))?,
        };
        let total_elapsed = start.elapsed();

        let stdout_digest = self.store.store_bytes(&output.stdout)?;
        let stderr_digest = self.store.store_bytes(&output.stderr)?;
        let output_directory = capture_outputs(
            &self.store,
            sandbox.path(),
            &process.output_file_paths,
            &process.output_dir_paths,
        )?;

        let exit_code = output.status.code().unwrap_or(-1);
        let keep = match self.keep_sandboxes {
            KeepSandboxes::Always => true,
            KeepSandboxes::Never => false,
            KeepSandboxes::OnFailure => exit_code != 0,
        };
        if keep {
            let kept_at = sandbox.keep();
            log::info!("preserved sandbox at {}", kept_at.display());
        }

        Ok(ProcessResult {
            exit_code,
            stdout_digest,
            stderr_digest,
            output_directory: output_directory.0,
            metadata: ProcessResultMetadata::new(ProcessResultSource::Ran, Some(total_elapsed)),
        })
    }
}

fn mount_named_caches(
    named_caches: &NamedCaches,
    sandbox: &Path,
    caches: &BTreeMap<CacheName, RelativePath>,
) -> std::io::Result<()> {
    for (dest, host_path) in named_caches.symlinks_for(caches)? {
        let dest = sandbox.join(dest.as_ref());
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::os::unix::fs::symlink(host_path, dest)?;
    }
    Ok(())
}

async fn materialize_directory(store: &Store, digest: DirectoryDigest, dest: &Path) -> Result<(), ProcessError> {
    std::fs::create_dir_all(dest).map_err(|e| ProcessError::Io(e.to_string()))?;
    if digest == fs::directory::EMPTY_DIRECTORY_DIGEST {
        return Ok(());
    }
    let directory = store
        .load_directory(digest)?
        .ok_or_else(|| ProcessError::Io(format!("missing directory {digest}")))?;
    for entry in directory.entries() {
        match entry {
            DirectoryEntry::File { name, digest: file_digest, is_executable } => {
                materialize_file(store, *file_digest, &dest.join(name), *is_executable).await?;
            }
            DirectoryEntry::Directory { name, digest: child_digest } => {
                Box::pin(materialize_directory(store, DirectoryDigest(*child_digest), &dest.join(name))).await?;
            }
        }
    }
    Ok(())
}

/// Hard-links non-executable content straight from the store (same filesystem, no bytes copied);
/// an executable file is always copied, since chmod'ing a hard link would mutate the store's
/// single shared blob for every other digest-identical file materialised anywhere else.
async fn materialize_file(store: &Store, digest: Digest, dest: &Path, is_executable: bool) -> Result<(), ProcessError> {
    if !is_executable && std::fs::hard_link(store.blob_path(digest), dest).is_ok() {
        return Ok(());
    }
    let bytes = store
        .load_bytes(digest)
        .await?
        .ok_or_else(|| ProcessError::Io(format!("missing content for digest {digest}")))?;
    std::fs::write(dest, &bytes).map_err(|e| ProcessError::Io(e.to_string()))?;
    if is_executable {
        let mut perms = std::fs::metadata(dest)
            .map_err(|e| ProcessError::Io(e.to_string()))?
            .permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(dest, perms).map_err(|e| ProcessError::Io(e.to_string()))?;
    }
    Ok(())
}

/// Builds the `output_directory` tree from exactly the sandbox-relative paths the process
/// declared -- unlisted files created by the process are not captured, matching the hermeticity
/// guarantee that a `Process`'s visible effects are only what it declared up front.
fn capture_outputs(
    store: &Store,
    sandbox: &Path,
    output_file_paths: &std::collections::BTreeSet<RelativePath>,
    output_dir_paths: &std::collections::BTreeSet<RelativePath>,
) -> Result<DirectoryDigest, ProcessError> {
    let mut files: BTreeMap<Vec<String>, (Digest, bool)> = BTreeMap::new();

    for rel in output_file_paths {
        capture_one_file(store, sandbox, rel, &mut files)?;
    }
    for rel in output_dir_paths {
        let absolute = sandbox.join(rel.as_ref());
        if !absolute.exists() {
            continue;
        }
        for entry in walkdir::WalkDir::new(&absolute) {
            let entry = entry.map_err(|e| ProcessError::Io(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(sandbox)
                .expect("walkdir entries are always under the root they were asked to walk");
            let rel_path = RelativePath::new(relative).map_err(ProcessError::Io)?;
            capture_one_file(store, sandbox, &rel_path, &mut files)?;
        }
    }

    store_tree(store, &files, &[])
}

fn capture_one_file(
    store: &Store,
    sandbox: &Path,
    rel: &RelativePath,
    files: &mut BTreeMap<Vec<String>, (Digest, bool)>,
) -> Result<(), ProcessError> {
    let absolute = sandbox.join(rel.as_ref());
    let bytes = std::fs::read(&absolute).map_err(|e| ProcessError::Io(format!("missing declared output {rel}: {e}")))?;
    let is_executable = std::fs::metadata(&absolute)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false);
    let digest = store.store_bytes(&bytes)?;
    let components: Vec<String> = rel
        .as_ref()
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    files.insert(components, (digest, is_executable));
    Ok(())
}

fn store_tree(
    store: &Store,
    files: &BTreeMap<Vec<String>, (Digest, bool)>,
    prefix: &[String],
) -> Result<DirectoryDigest, ProcessError> {
    let mut children_by_name: BTreeMap<String, BTreeMap<Vec<String>, (Digest, bool)>> = BTreeMap::new();
    let mut entries = Vec::new();

    for (components, (digest, is_executable)) in files {
        if components.len() < prefix.len() || &components[..prefix.len()] != prefix {
            continue;
        }
        let rest = &components[prefix.len()..];
        match rest.len() {
            0 => continue,
            1 => entries.push(DirectoryEntry::File {
                name: rest[0].clone(),
                digest: *digest,
                is_executable: *is_executable,
            }),
            _ => {
                children_by_name
                    .entry(rest[0].clone())
                    .or_default()
                    .insert(components.clone(), (*digest, *is_executable));
            }
        }
    }

    for (name, child_files) in children_by_name {
        let mut child_prefix = prefix.to_vec();
        child_prefix.push(name.clone());
        let child_digest = store_tree(store, &child_files, &child_prefix)?;
        entries.push(DirectoryEntry::Directory { name, digest: child_digest.0 });
    }

    let directory = Directory::new(entries).map_err(|e| ProcessError::Io(e.to_string()))?;
    Ok(store.store_directory(&directory)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CommandRunner as _, ProcessCacheScope, ProcessExecutionStrategy};
    use std::collections::BTreeSet;

    fn runner(store: &Store) -> (CommandRunner, tempfile::TempDir) {
        let work_dir = tempfile::tempdir().unwrap();
        let named_caches = NamedCaches::new(work_dir.path().join("named_caches")).unwrap();
        let runner = CommandRunner::new(store.clone(), work_dir.path().join("sandboxes"), named_caches, KeepSandboxes::Never).unwrap();
        (runner, work_dir)
    }

    fn context() -> Context {
        Context::new(workunit_store::WorkunitStore::new(), task_executor::Executor::new())
    }

    fn echo_process(argv: Vec<&str>) -> Process {
        Process {
            argv: argv.into_iter().map(str::to_string).collect(),
            env: BTreeMap::new(),
            working_directory: None,
            input_digest: fs::directory::EMPTY_DIRECTORY_DIGEST,
            output_file_paths: BTreeSet::new(),
            output_dir_paths: BTreeSet::new(),
            timeout: None,
            description: "a test process".to_string(),
            level: log::Level::Debug,
            append_only_caches: BTreeMap::new(),
            jdk_home: None,
            execution_strategy: ProcessExecutionStrategy::Local,
            cache_scope: ProcessCacheScope::Successful,
        }
    }

    #[tokio::test]
    async fn runs_a_process_and_captures_stdout() {
        let store_dir = tempfile::tempdir().unwrap();
        let store = Store::local_only(store_dir.path()).unwrap();
        let (runner, _work_dir) = runner(&store);

        let process = echo_process(vec!["/bin/echo", "hello sandbox"]);
        let result = crate::CommandRunner::run(&runner, context(), process).await.unwrap();
        assert_eq!(result.exit_code, 0);
        let stdout = store.load_bytes(result.stdout_digest).await.unwrap().unwrap();
        assert_eq!(stdout, b"hello sandbox\n");
    }

    #[tokio::test]
    async fn captures_declared_output_files() {
        let store_dir = tempfile::tempdir().unwrap();
        let store = Store::local_only(store_dir.path()).unwrap();
        let (runner, _work_dir) = runner(&store);

        let mut process = echo_process(vec!["/bin/sh", "-c", "echo built > out.txt"]);
        process.output_file_paths.insert(RelativePath::new("out.txt").unwrap());
        let result = crate::CommandRunner::run(&runner, context(), process).await.unwrap();

        let tree = store.load_directory(DirectoryDigest(result.output_directory)).unwrap().unwrap();
        assert_eq!(tree.entries().len(), 1);
    }

    #[tokio::test]
    async fn a_nonzero_exit_is_a_result_not_an_error() {
        let store_dir = tempfile::tempdir().unwrap();
        let store = Store::local_only(store_dir.path()).unwrap();
        let (runner, _work_dir) = runner(&store);

        let process = echo_process(vec!["/bin/sh", "-c", "exit 7"]);
        let result = crate::CommandRunner::run(&runner, context(), process).await.unwrap();
        assert_eq!(result.exit_code, 7);
    }

    #[tokio::test]
    async fn a_timeout_is_reported_as_such() {
        let store_dir = tempfile::tempdir().unwrap();
        let store = Store::local_only(store_dir.path()).unwrap();
        let (runner, _work_dir) = runner(&store);

        let mut process = echo_process(vec!["/bin/sleep", "5"]);
        process.timeout = Some(std::time::Duration::from_millis(50));
        let err = crate::CommandRunner::run(&runner, context(), process).await.unwrap_err();
        assert!(matches!(err, ProcessError::Timeout(_)));
    }
}
