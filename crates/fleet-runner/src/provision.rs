use crate::error::{config_error, provisioning_error};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use fleet_core::{
    atomic_write_json_pretty, copy_tree, ensure_dir, parse_sandbox_dir_name,
    remove_dir_if_exists, sandbox_dir_name, tree_fingerprint, SandboxLayout,
    SANDBOX_MANIFEST_SCHEMA_V1,
};
use fleet_schemas::{validate_value, SANDBOX_MANIFEST_SCHEMA};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One isolated copy of the project template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sandbox {
    pub thread_id: usize,
    pub path: PathBuf,
}

/// The sandboxes of one session, sorted by ascending `thread_id`.
#[derive(Debug, Clone)]
pub struct SandboxSet {
    pub root: PathBuf,
    pub sandboxes: Vec<Sandbox>,
    pub reused: bool,
}

impl SandboxSet {
    pub fn len(&self) -> usize {
        self.sandboxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sandboxes.is_empty()
    }

    pub fn get(&self, thread_id: usize) -> Option<&Sandbox> {
        self.sandboxes.iter().find(|s| s.thread_id == thread_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub thread_id: usize,
    pub dir_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxManifest {
    pub schema_version: String,
    pub created_at: String,
    pub project_path: String,
    pub template_fingerprint: String,
    pub thread_count: usize,
    pub sandboxes: Vec<ManifestEntry>,
}

impl SandboxManifest {
    fn new(project_path: &Path, template_fingerprint: String, thread_count: usize) -> Self {
        Self {
            schema_version: SANDBOX_MANIFEST_SCHEMA_V1.to_string(),
            created_at: Utc::now().to_rfc3339(),
            project_path: project_path.display().to_string(),
            template_fingerprint,
            thread_count,
            sandboxes: (1..=thread_count)
                .map(|thread_id| ManifestEntry {
                    thread_id,
                    dir_name: sandbox_dir_name(thread_id),
                })
                .collect(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed reading {}", path.display()))?;
        let value: serde_json::Value = serde_json::from_str(&data)
            .with_context(|| format!("invalid json in {}", path.display()))?;
        validate_value(SANDBOX_MANIFEST_SCHEMA, &value)?;
        let manifest: Self = serde_json::from_value(value)?;
        for entry in &manifest.sandboxes {
            if parse_sandbox_dir_name(&entry.dir_name) != Some(entry.thread_id) {
                return Err(anyhow!(
                    "manifest entry {} does not match thread_id {}",
                    entry.dir_name,
                    entry.thread_id
                ));
            }
        }
        Ok(manifest)
    }

    fn write(&self, path: &Path) -> Result<()> {
        let value = serde_json::to_value(self)?;
        validate_value(SANDBOX_MANIFEST_SCHEMA, &value)?;
        atomic_write_json_pretty(path, &value)
    }
}

/// Provisions `thread_count` sandboxes under `run_path/.sim_run`.
pub fn provision(
    project_path: &Path,
    run_path: &Path,
    thread_count: usize,
    force_refresh: bool,
) -> Result<SandboxSet> {
    provision_with_excludes(project_path, run_path, thread_count, force_refresh, &[])
}

/// Like [`provision`], additionally leaving `excludes` out of every copy.
/// The sandbox root itself is always excluded.
pub fn provision_with_excludes(
    project_path: &Path,
    run_path: &Path,
    thread_count: usize,
    force_refresh: bool,
    excludes: &[PathBuf],
) -> Result<SandboxSet> {
    if thread_count == 0 {
        return Err(config_error("thread_count must be >= 1"));
    }
    if !project_path.is_dir() {
        return Err(config_error(format!(
            "project_path is not a directory: {}",
            project_path.display()
        )));
    }
    let project_path = fs::canonicalize(project_path)
        .with_context(|| format!("failed resolving {}", project_path.display()))
        .map_err(provisioning_error)?;
    ensure_dir(run_path).map_err(provisioning_error)?;
    let run_path = fs::canonicalize(run_path)
        .with_context(|| format!("failed resolving {}", run_path.display()))
        .map_err(provisioning_error)?;
    let layout = SandboxLayout::new(&run_path);

    let mut skipped = vec![layout.root.clone()];
    skipped.extend(excludes.iter().map(|p| normalize_path(p)));
    let skip = |path: &Path| skipped.iter().any(|s| s == path);

    if !force_refresh && layout.root.exists() {
        match try_reuse(&layout, &project_path, thread_count, &skip) {
            Ok(Some(set)) => return Ok(set),
            Ok(None) => {}
            Err(err) => warn!(
                root = %layout.root.display(),
                error = %format!("{:#}", err),
                "sandbox manifest unusable; rebuilding"
            ),
        }
    }

    build(&layout, &project_path, thread_count, &skip).map_err(|err| {
        if let Err(cleanup) = remove_dir_if_exists(&layout.root) {
            warn!(error = %cleanup, "failed removing partial sandbox root");
        }
        provisioning_error(err)
    })
}

fn try_reuse(
    layout: &SandboxLayout,
    project_path: &Path,
    thread_count: usize,
    skip: &dyn Fn(&Path) -> bool,
) -> Result<Option<SandboxSet>> {
    let manifest = SandboxManifest::load(&layout.manifest)?;
    let mut entries = manifest.sandboxes.clone();
    entries.sort_by_key(|e| e.thread_id);
    if entries.len() < thread_count {
        info!(
            recorded = entries.len(),
            required = thread_count,
            "too few sandboxes recorded; rebuilding"
        );
        return Ok(None);
    }
    let sandboxes: Vec<Sandbox> = entries
        .iter()
        .take(thread_count)
        .map(|e| Sandbox {
            thread_id: e.thread_id,
            path: layout.root.join(&e.dir_name),
        })
        .collect();
    if let Some(missing) = sandboxes.iter().find(|s| !s.path.is_dir()) {
        info!(
            missing = %missing.path.display(),
            "recorded sandbox is missing; rebuilding"
        );
        return Ok(None);
    }

    match tree_fingerprint(project_path, skip) {
        Ok(current) if current != manifest.template_fingerprint => warn!(
            project = %project_path.display(),
            "project changed since sandboxes were built; reusing anyway (pass refresh to rebuild)"
        ),
        Ok(_) => {}
        Err(err) => debug!(error = %err, "could not fingerprint project"),
    }
    info!(
        root = %layout.root.display(),
        thread_count,
        "reusing existing sandboxes"
    );
    Ok(Some(SandboxSet {
        root: layout.root.clone(),
        sandboxes,
        reused: true,
    }))
}

fn build(
    layout: &SandboxLayout,
    project_path: &Path,
    thread_count: usize,
    skip: &dyn Fn(&Path) -> bool,
) -> Result<SandboxSet> {
    remove_dir_if_exists(&layout.root)?;
    ensure_dir(&layout.root)?;
    let fingerprint = tree_fingerprint(project_path, skip)?;
    let mut sandboxes = Vec::with_capacity(thread_count);
    for thread_id in 1..=thread_count {
        let path = layout.sandbox_dir(thread_id);
        let copied = copy_tree(project_path, &path, skip)
            .with_context(|| format!("failed copying project into {}", path.display()))?;
        debug!(thread_id, files = copied, "sandbox populated");
        sandboxes.push(Sandbox { thread_id, path });
    }
    SandboxManifest::new(project_path, fingerprint, thread_count).write(&layout.manifest)?;
    info!(
        root = %layout.root.display(),
        thread_count,
        "sandboxes built"
    );
    Ok(SandboxSet {
        root: layout.root.clone(),
        sandboxes,
        reused: false,
    })
}

/// Canonical form of a path that may not exist yet (its parent must).
fn normalize_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = fs::canonicalize(path) {
        return canonical;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => fs::canonicalize(parent)
            .map(|p| p.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}
