use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const SANDBOX_ROOT_DIR: &str = ".sim_run";
pub const SANDBOX_DIR_PREFIX: &str = "thread_";
pub const SANDBOX_MANIFEST_FILE: &str = "sandbox_manifest.json";
pub const SANDBOX_MANIFEST_SCHEMA_V1: &str = "sandbox_manifest_v1";
pub const SANDBOX_STATE_DIR: &str = ".simfleet";
pub const SANDBOX_STDOUT_FILE: &str = "stdout.log";
pub const SANDBOX_STDERR_FILE: &str = "stderr.log";

pub const PARAMETERS_FILE: &str = "parameters.json";
pub const RUN_PERIOD_FILE: &str = "run_period.json";

pub const SIMFLEET_ENV_MAX_THREADS: &str = "SIMFLEET_MAX_THREADS";
pub const SIMFLEET_ENV_RUN_INDEX: &str = "SIMFLEET_RUN_INDEX";
pub const SIMFLEET_ENV_THREAD_ID: &str = "SIMFLEET_THREAD_ID";
pub const SIMFLEET_ENV_SANDBOX: &str = "SIMFLEET_SANDBOX";

/// Host-side paths of the sandbox tree under one `run_path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLayout {
    pub run_path: PathBuf,
    pub root: PathBuf,
    pub manifest: PathBuf,
}

impl SandboxLayout {
    pub fn new(run_path: &Path) -> Self {
        let root = run_path.join(SANDBOX_ROOT_DIR);
        Self {
            run_path: run_path.to_path_buf(),
            manifest: root.join(SANDBOX_MANIFEST_FILE),
            root,
        }
    }

    pub fn sandbox_dir(&self, thread_id: usize) -> PathBuf {
        self.root.join(sandbox_dir_name(thread_id))
    }
}

pub fn sandbox_dir_name(thread_id: usize) -> String {
    format!("{}{}", SANDBOX_DIR_PREFIX, thread_id)
}

/// Parses `thread_<id>`; anything else (including `thread_0`) is not a sandbox.
pub fn parse_sandbox_dir_name(name: &str) -> Option<usize> {
    let id = name.strip_prefix(SANDBOX_DIR_PREFIX)?.parse::<usize>().ok()?;
    if id == 0 {
        return None;
    }
    Some(id)
}

/// Per-sandbox paths the orchestrator writes into.
#[derive(Debug, Clone)]
pub struct SandboxPaths {
    pub dir: PathBuf,
    pub state_dir: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub parameters: PathBuf,
    pub run_period: PathBuf,
}

pub fn sandbox_paths(sandbox_dir: &Path) -> SandboxPaths {
    let state_dir = sandbox_dir.join(SANDBOX_STATE_DIR);
    SandboxPaths {
        dir: sandbox_dir.to_path_buf(),
        stdout: state_dir.join(SANDBOX_STDOUT_FILE),
        stderr: state_dir.join(SANDBOX_STDERR_FILE),
        state_dir,
        parameters: sandbox_dir.join(PARAMETERS_FILE),
        run_period: sandbox_dir.join(RUN_PERIOD_FILE),
    }
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s)),
        Value::Array(arr) => {
            let items: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let parts: Vec<String> = entries
                .into_iter()
                .map(|(k, v)| {
                    let ks = serde_json::to_string(k).unwrap_or_else(|_| format!("\"{}\"", k));
                    format!("{}:{}", ks, canonical_json(v))
                })
                .collect();
            format!("{{{}}}", parts.join(","))
        }
    }
}

pub fn canonical_json_digest(value: &Value) -> String {
    sha256_bytes(canonical_json(value).as_bytes())
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn remove_dir_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(anyhow!("failed to remove {}: {}", path.display(), e)),
    }
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

/// Recursively copies `src` into `dst`, skipping any path for which `skip`
/// returns true (skipped directories are not descended into).
pub fn copy_tree<F>(src: &Path, dst: &Path, skip: F) -> Result<u64>
where
    F: Fn(&Path) -> bool,
{
    ensure_dir(dst)?;
    let mut copied = 0_u64;
    let walker = walkdir::WalkDir::new(src)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !skip(entry.path()));
    for entry in walker {
        let entry = entry.with_context(|| format!("failed walking {}", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .with_context(|| format!("path escaped copy root: {}", entry.path().display()))?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            ensure_dir(&target)?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target).with_context(|| {
                format!(
                    "failed copying {} -> {}",
                    entry.path().display(),
                    target.display()
                )
            })?;
            copied += 1;
        } else if entry.file_type().is_symlink() {
            copy_symlink(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    let link = fs::read_link(src)?;
    std::os::unix::fs::symlink(&link, dst)
        .with_context(|| format!("failed linking {} -> {}", dst.display(), link.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    fs::copy(src, dst)
        .with_context(|| format!("failed copying {} -> {}", src.display(), dst.display()))?;
    Ok(())
}

/// Cheap fingerprint of a directory tree: sorted relative paths and sizes.
/// File contents are not hashed.
pub fn tree_fingerprint<F>(root: &Path, skip: F) -> Result<String>
where
    F: Fn(&Path) -> bool,
{
    let mut rows: Vec<(String, u64)> = Vec::new();
    let walker = walkdir::WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| !skip(entry.path()));
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .to_string();
        rows.push((rel, entry.metadata()?.len()));
    }
    rows.sort();
    let listing = rows
        .iter()
        .map(|(path, size)| format!("{}\t{}", path, size))
        .collect::<Vec<_>>()
        .join("\n");
    Ok(sha256_bytes(listing.as_bytes()))
}
