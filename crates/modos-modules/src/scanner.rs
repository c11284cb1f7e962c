//! On-disk module discovery.
//!
//! A directory holding `module.yaml` (or `module.yml`) is a module root and
//! is not descended further. Hidden directories and `node_modules` are never
//! walked.

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use modos_protocol::{Module, ModuleManifest, ModuleType, RuntimeError, RuntimeResult};
use tokio::fs;
use tracing::{debug, instrument, warn};

pub const MANIFEST_FILES: [&str; 2] = ["module.yaml", "module.yml"];
pub const DEFAULT_ENTRY_FILES: [&str; 2] = ["index.ts", "index.js"];

/// A manifest directory that did not produce a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedModule {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct ScanReport {
    pub discovered: Vec<Module>,
    pub skipped: Vec<SkippedModule>,
}

#[derive(Debug, Clone)]
pub struct ModuleScanner {
    roots: Vec<PathBuf>,
}

impl ModuleScanner {
    pub fn new(roots: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        Self {
            roots: roots.into_iter().map(Into::into).collect(),
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Walk every root. Missing roots are skipped with a warning; invalid
    /// modules are reported in [`ScanReport::skipped`], never fatal.
    #[instrument(skip(self), fields(roots = self.roots.len()))]
    pub async fn scan(&self) -> Result<ScanReport> {
        let mut report = ScanReport::default();
        for root in &self.roots {
            if !fs::try_exists(root).await.unwrap_or(false) {
                warn!(root = %root.display(), "module root does not exist");
                continue;
            }
            let mut stack = vec![root.clone()];
            while let Some(dir) = stack.pop() {
                if let Some(manifest_path) = find_manifest(&dir).await {
                    match load_module(root, &dir, &manifest_path).await {
                        Ok(module) => {
                            debug!(module = %module.name, path = %dir.display(), "module discovered");
                            report.discovered.push(module);
                        }
                        Err(error) => {
                            warn!(path = %dir.display(), error = %error, "module skipped");
                            report.skipped.push(SkippedModule {
                                path: dir,
                                reason: format!("{error:#}"),
                            });
                        }
                    }
                    continue;
                }
                let mut children = child_dirs(&dir).await?;
                children.sort();
                stack.extend(children.into_iter().rev());
            }
        }
        report
            .discovered
            .sort_by(|left, right| left.name.cmp(&right.name));
        Ok(report)
    }
}

async fn find_manifest(dir: &Path) -> Option<PathBuf> {
    for name in MANIFEST_FILES {
        let candidate = dir.join(name);
        if fs::try_exists(&candidate).await.unwrap_or(false) {
            return Some(candidate);
        }
    }
    None
}

async fn child_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("failed to read module dir {}", dir.display()))?;
    let mut children = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') || name == "node_modules" {
            continue;
        }
        if entry.file_type().await?.is_dir() {
            children.push(entry.path());
        }
    }
    Ok(children)
}

pub async fn read_manifest(path: &Path) -> Result<ModuleManifest> {
    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read manifest {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("failed to parse manifest {}", path.display()))
}

async fn load_module(root: &Path, dir: &Path, manifest_path: &Path) -> Result<Module> {
    let manifest = read_manifest(manifest_path).await?;
    let module_type = classify(root, dir, &manifest)?;
    let entry = resolve_entry(dir, &manifest).await?;
    let module = build_module(dir, &manifest, module_type)?;
    debug!(module = %module.name, entry = %entry.display(), "entry file resolved");
    Ok(module)
}

fn under_core_path(root: &Path, dir: &Path) -> bool {
    let relative = dir.strip_prefix(root).unwrap_or(dir);
    let root_is_core = root.file_name().is_some_and(|name| name == "core");
    root_is_core
        || relative
            .components()
            .any(|component| matches!(component, Component::Normal(name) if name == "core"))
}

/// Anything under a `core` directory is CORE; otherwise the manifest `type`
/// decides. A module with neither is rejected.
pub fn classify(root: &Path, dir: &Path, manifest: &ModuleManifest) -> RuntimeResult<ModuleType> {
    if under_core_path(root, dir) {
        return Ok(ModuleType::Core);
    }
    match manifest.module_type.as_deref() {
        Some(raw) => raw.parse(),
        None => Err(RuntimeError::Manifest(format!(
            "{}: no type declared and not under a core path",
            dir.display()
        ))),
    }
}

/// Manifest `entry`, else the first default entry file present.
pub async fn resolve_entry(dir: &Path, manifest: &ModuleManifest) -> RuntimeResult<PathBuf> {
    let candidates: Vec<&str> = match manifest.entry.as_deref() {
        Some(entry) => vec![entry],
        None => DEFAULT_ENTRY_FILES.to_vec(),
    };
    for candidate in candidates {
        let path = dir.join(candidate);
        if fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(path);
        }
    }
    Err(RuntimeError::Manifest(format!(
        "{}: missing entry file",
        dir.display()
    )))
}

pub fn build_module(
    dir: &Path,
    manifest: &ModuleManifest,
    module_type: ModuleType,
) -> RuntimeResult<Module> {
    let (name, version) = manifest.identity()?;
    let mut module =
        Module::new(name, version, module_type, dir).with_dependencies(manifest.dependencies.clone());
    module.enabled = manifest.enabled.unwrap_or(true);
    module.auto_start = manifest.auto_start.unwrap_or(true);
    module.config = manifest.config.clone();
    module.description = manifest.description.clone();
    module.author = manifest.author.clone();
    module.cli = manifest.cli.clone();
    Ok(module)
}
