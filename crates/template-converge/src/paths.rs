use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::config::RunDoc;
use crate::error::{Error, Result};

fn default_cookbook_path() -> String {
    "cookbooks".into()
}

/// The `[run]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    pub root_dir: Option<String>,
    #[serde(default = "default_cookbook_path")]
    pub cookbook_path: String,
    pub backup_dir: Option<String>,
    pub max_parallel: usize,
    pub paths: BTreeMap<String, String>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            root_dir: None,
            cookbook_path: default_cookbook_path(),
            backup_dir: None,
            max_parallel: 1,
            paths: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunPaths {
    pub root: PathBuf,
    pub cookbook_dir: PathBuf,
    pub backup_dir: Option<PathBuf>,
    pub named_dirs: BTreeMap<String, PathBuf>,
}

impl RunPaths {
    // Resolve a user-configured path:
    // - `@alias/...` expands from `[run.paths]` (plus the built-in `root` and `cookbooks`)
    // - absolute paths are used as-is
    // - relative paths are rooted at the run root
    pub fn resolve_config_path(&self, raw: &str) -> Result<PathBuf> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::msg("empty path"));
        }

        if let Some(after_at) = raw.strip_prefix('@') {
            let (alias, rest) = match after_at.split_once('/') {
                Some((a, r)) => (a.trim(), r),
                None => (after_at.trim(), ""),
            };
            if alias.is_empty() {
                return Err(Error::msg(format!("invalid alias path '{}'", raw)));
            }
            let base = self.named_dirs.get(alias).ok_or_else(|| {
                let known = self.named_dirs.keys().cloned().collect::<Vec<_>>().join(", ");
                Error::msg(format!(
                    "unknown path alias '{}' in '{}' (known: {})",
                    alias, raw, known
                ))
            })?;
            return Ok(if rest.is_empty() {
                base.clone()
            } else {
                base.join(rest)
            });
        }

        let pb = PathBuf::from(raw);
        Ok(if pb.is_absolute() { pb } else { self.root.join(pb) })
    }
}

pub fn load_settings(doc: &RunDoc) -> Result<RunSettings> {
    Ok(doc.deserialize_path("run")?.unwrap_or_default())
}

pub fn resolve_paths(doc: &RunDoc, settings: &RunSettings) -> Result<RunPaths> {
    let base = doc.base_dir();
    let root = match settings.root_dir.as_deref().map(str::trim) {
        Some(r) if !r.is_empty() => join_user_path(&base, r),
        _ => base,
    };

    let mut named_dirs = BTreeMap::<String, PathBuf>::new();
    named_dirs.insert("root".into(), root.clone());
    for (name, raw) in &settings.paths {
        let key = name.trim();
        validate_alias(key)?;
        if raw.trim().is_empty() {
            return Err(Error::msg(format!("run.paths.{} is empty", key)));
        }
        named_dirs.insert(key.to_string(), join_user_path(&root, raw.trim()));
    }

    let mut paths = RunPaths {
        root,
        cookbook_dir: PathBuf::new(),
        backup_dir: None,
        named_dirs,
    };
    paths.cookbook_dir = paths.resolve_config_path(&settings.cookbook_path)?;
    paths
        .named_dirs
        .insert("cookbooks".into(), paths.cookbook_dir.clone());
    paths.backup_dir = settings
        .backup_dir
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|raw| paths.resolve_config_path(raw))
        .transpose()?;
    Ok(paths)
}

fn validate_alias(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::msg("run.paths has an empty key"));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(Error::msg(format!(
            "run.paths key '{}' is invalid (allowed: a-zA-Z0-9_-)",
            key
        )));
    }
    if key == "root" || key == "cookbooks" {
        return Err(Error::msg(format!("run.paths key '{}' is reserved", key)));
    }
    Ok(())
}

fn join_user_path(base: &Path, p: &str) -> PathBuf {
    let pb = PathBuf::from(p);
    if pb.is_absolute() { pb } else { base.join(pb) }
}

/// Rejects empty paths, absolute paths and any `..` component.
pub fn validate_rel_like_path(p: &str) -> Result<()> {
    let path = p.trim();
    if path.is_empty() {
        return Err(Error::msg("path is empty"));
    }
    for c in Path::new(path).components() {
        match c {
            Component::ParentDir => {
                return Err(Error::msg(format!("path '{}' contains '..'", path)));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::msg(format!("path '{}' must be relative", path)));
            }
            _ => {}
        }
    }
    Ok(())
}

/// A single directory name: not empty, no separators, not `.` or `..`.
pub fn validate_dir_name(name: &str) -> Result<()> {
    let mut parts = Path::new(name).components();
    match (parts.next(), parts.next()) {
        (Some(Component::Normal(_)), None) if !name.contains(['/', '\\']) => Ok(()),
        _ => Err(Error::msg(format!("invalid directory name '{}'", name))),
    }
}
