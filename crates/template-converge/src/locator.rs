//! Turns a resource's template source into a concrete file to render.

use std::path::PathBuf;

use crate::error::{Error, ErrorKind, Result};
use crate::paths::{validate_dir_name, validate_rel_like_path};
use crate::resource::DesiredState;

/// Looks templates up by collection and name.
pub trait Repository: Send + Sync {
    /// Path of `template` inside `collection`; `SourceNotFound` when absent.
    fn resolve(&self, collection: &str, template: &str) -> Result<PathBuf>;
}

/// Node facts that pick the most specific template variant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeScope {
    pub fqdn: Option<String>,
    pub hostname: Option<String>,
    pub platform: Option<String>,
    pub platform_version: Option<String>,
}

impl NodeScope {
    pub fn from_attributes(attrs: &toml::Table) -> Self {
        let text = |key: &str| {
            attrs
                .get(key)
                .and_then(toml::Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned)
        };
        Self {
            fqdn: text("fqdn"),
            hostname: text("hostname"),
            platform: text("platform"),
            platform_version: text("platform_version"),
        }
    }

    /// Search order, most specific first. Always ends with `default`.
    pub fn segments(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut push = |s: String| {
            if !out.contains(&s) {
                out.push(s);
            }
        };
        if let Some(fqdn) = &self.fqdn {
            push(format!("host-{fqdn}"));
        }
        if let Some(host) = &self.hostname {
            push(format!("host-{host}"));
        }
        if let Some(platform) = &self.platform {
            if let Some(version) = &self.platform_version {
                push(format!("{platform}-{version}"));
            }
            push(platform.clone());
        }
        push("default".into());
        out
    }
}

/// `<root>/<collection>/templates/<segment>/<name>`.
#[derive(Debug, Clone)]
pub struct CookbookRepository {
    root: PathBuf,
    scope: NodeScope,
}

impl CookbookRepository {
    pub fn new(root: impl Into<PathBuf>, scope: NodeScope) -> Self {
        Self {
            root: root.into(),
            scope,
        }
    }

    fn candidates(&self, collection: &str, template: &str) -> Vec<PathBuf> {
        let base = self.root.join(collection).join("templates");
        self.scope
            .segments()
            .into_iter()
            .map(|seg| base.join(seg).join(template))
            .collect()
    }
}

impl Repository for CookbookRepository {
    fn resolve(&self, collection: &str, template: &str) -> Result<PathBuf> {
        let collection = collection.trim();
        validate_dir_name(collection).map_err(|e| {
            Error::new(ErrorKind::SourceNotFound, format!("cookbook name: {e}"))
        })?;
        validate_rel_like_path(template)
            .map_err(|e| e.with_kind(ErrorKind::SourceNotFound))?;

        let candidates = self.candidates(collection, template);
        if let Some(found) = candidates.iter().find(|p| p.is_file()) {
            return Ok(found.clone());
        }
        let tried = candidates
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        Err(Error::new(
            ErrorKind::SourceNotFound,
            format!(
                "template '{}' not found in cookbook '{}' (tried: {})",
                template, collection, tried
            ),
        ))
    }
}

/// Where `desired`'s template lives, without checking that a local path exists.
pub fn template_location(desired: &DesiredState, repo: &dyn Repository) -> Result<PathBuf> {
    if desired.is_local {
        return Ok(PathBuf::from(&desired.template_source));
    }
    repo.resolve(desired.collection(), &desired.template_source)
}

/// Resolve and verify the template source. Failing here leaves the target untouched.
pub fn locate(desired: &DesiredState, repo: &dyn Repository) -> Result<PathBuf> {
    let path = template_location(desired, repo)?;
    if desired.is_local && !path.is_file() {
        return Err(Error::new(
            ErrorKind::SourceNotFound,
            format!("local template not found: {}", path.display()),
        ));
    }
    Ok(path)
}
