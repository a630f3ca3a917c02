use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::acl::AclChanges;
use crate::checksum::Digest;
use crate::config::RunDoc;
use crate::error::{Error, Result};
use crate::paths::{RunPaths, validate_dir_name, validate_rel_like_path};

pub const DEFAULT_BACKUP_RETENTION: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    #[default]
    Create,
    CreateIfMissing,
    Nothing,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Create => "create",
            Action::CreateIfMissing => "create_if_missing",
            Action::Nothing => "nothing",
        })
    }
}

/// A user or group, by name or numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Principal {
    Id(u32),
    Name(String),
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::Id(id) => write!(f, "{id}"),
            Principal::Name(name) => f.write_str(name),
        }
    }
}

/// Permission bits, accepted as an integer (`0o644`) or an octal string (`"0644"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FileMode(u32);

impl FileMode {
    pub const MASK: u32 = 0o7777;

    pub fn new(bits: u32) -> Result<Self> {
        if bits & !Self::MASK != 0 {
            return Err(Error::msg(format!(
                "mode {:o} has bits outside {:o}",
                bits,
                Self::MASK
            )));
        }
        Ok(Self(bits))
    }

    pub fn parse_octal(raw: &str) -> Result<Self> {
        let digits = raw.trim();
        let digits = digits.strip_prefix("0o").unwrap_or(digits);
        if digits.is_empty() {
            return Err(Error::msg("mode is empty"));
        }
        let bits = u32::from_str_radix(digits, 8)
            .map_err(|e| Error::msg(format!("invalid octal mode '{}': {e}", raw)))?;
        Self::new(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04o}", self.0)
    }
}

impl<'de> Deserialize<'de> for FileMode {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(u32),
            Str(String),
        }
        let parsed = match Raw::deserialize(d)? {
            Raw::Int(bits) => FileMode::new(bits),
            Raw::Str(s) => FileMode::parse_octal(&s),
        };
        parsed.map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
enum RetentionDecl {
    Enabled(bool),
    Count(usize),
}

impl RetentionDecl {
    fn count(self) -> usize {
        match self {
            RetentionDecl::Enabled(true) => DEFAULT_BACKUP_RETENTION,
            RetentionDecl::Enabled(false) => 0,
            RetentionDecl::Count(n) => n,
        }
    }
}

/// One `[[template]]` entry as written in the run file.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct TemplateDecl {
    pub path: String,
    pub source: Option<String>,
    pub local: bool,
    pub cookbook_name: Option<String>,
    pub cookbook: Option<String>,
    pub owner: Option<Principal>,
    pub group: Option<Principal>,
    pub mode: Option<FileMode>,
    backup: Option<RetentionDecl>,
    pub action: Action,
    pub variables: toml::Table,
}

/// Desired state of one template-backed file. Immutable for the whole attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredState {
    pub target_path: PathBuf,
    pub template_source: String,
    pub is_local: bool,
    /// Owning unit; the default collection to search.
    pub cookbook_name: String,
    pub collection_name: Option<String>,
    pub owner: Option<Principal>,
    pub group: Option<Principal>,
    pub mode: Option<FileMode>,
    pub backup_retention: usize,
    pub action: Action,
    pub variables: toml::Table,
}

impl DesiredState {
    pub fn new(target_path: impl Into<PathBuf>, cookbook_name: impl Into<String>) -> Self {
        let target_path = target_path.into();
        let template_source = default_source_for(&target_path);
        Self {
            target_path,
            template_source,
            is_local: false,
            cookbook_name: cookbook_name.into(),
            collection_name: None,
            owner: None,
            group: None,
            mode: None,
            backup_retention: DEFAULT_BACKUP_RETENTION,
            action: Action::Create,
            variables: toml::Table::new(),
        }
    }

    pub fn collection(&self) -> &str {
        self.collection_name
            .as_deref()
            .unwrap_or(self.cookbook_name.as_str())
    }

    pub fn from_decl(decl: TemplateDecl) -> Result<Self> {
        let raw_path = decl.path.trim();
        if raw_path.is_empty() {
            return Err(Error::msg("template.path is empty"));
        }
        let target_path = PathBuf::from(raw_path);
        if !target_path.is_absolute() {
            return Err(Error::msg(format!(
                "template.path '{}' must be absolute",
                raw_path
            )));
        }
        if target_path.file_name().is_none() {
            return Err(Error::msg(format!(
                "template.path '{}' has no file name",
                raw_path
            )));
        }

        let template_source = match decl.source.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => default_source_for(&target_path),
        };
        if !decl.local {
            validate_rel_like_path(&template_source).map_err(|e| {
                Error::msg(format!("template '{}' source: {e}", raw_path))
            })?;
        }

        let cookbook_name = decl
            .cookbook_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or_default()
            .to_string();
        let collection_name = decl
            .cookbook
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToOwned::to_owned);
        if !decl.local && cookbook_name.is_empty() && collection_name.is_none() {
            return Err(Error::msg(format!(
                "template '{}' needs cookbook_name or cookbook unless local = true",
                raw_path
            )));
        }
        if !decl.local {
            let collection = collection_name.as_deref().unwrap_or(cookbook_name.as_str());
            validate_dir_name(collection).map_err(|e| {
                Error::msg(format!("template '{}' cookbook: {e}", raw_path))
            })?;
        }

        Ok(Self {
            target_path,
            template_source,
            is_local: decl.local,
            cookbook_name,
            collection_name,
            owner: decl.owner,
            group: decl.group,
            mode: decl.mode,
            backup_retention: decl
                .backup
                .map(RetentionDecl::count)
                .unwrap_or(DEFAULT_BACKUP_RETENTION),
            action: decl.action,
            variables: decl.variables,
        })
    }
}

fn default_source_for(target: &Path) -> String {
    let name = target
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{name}.erb")
}

/// Every `[[template]]` in the run file, in declaration order.
///
/// Local sources are resolved like any other run path (`@alias/...`, or
/// relative to the run root).
pub fn load_templates(doc: &RunDoc, paths: &RunPaths) -> Result<Vec<DesiredState>> {
    let decls: Vec<TemplateDecl> = doc.deserialize_path("template")?.unwrap_or_default();
    decls
        .into_iter()
        .enumerate()
        .map(|(i, d)| {
            let mut desired = DesiredState::from_decl(d)
                .map_err(|e| Error::msg(format!("template[{i}]: {e}")))?;
            if desired.is_local {
                let resolved = paths
                    .resolve_config_path(&desired.template_source)
                    .map_err(|e| Error::msg(format!("template[{i}] source: {e}")))?;
                desired.template_source = resolved.display().to_string();
            }
            Ok(desired)
        })
        .collect()
}

/// Actual state of the target, captured once before any decision.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObservedState {
    pub exists: bool,
    pub content_digest: Option<Digest>,
    pub owner: Option<u32>,
    pub group: Option<u32>,
    pub mode: Option<u32>,
}

impl ObservedState {
    pub fn absent() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ConvergenceResult {
    pub changed: bool,
    pub backed_up: bool,
    pub backup_path: Option<PathBuf>,
    pub content_written: bool,
    pub acl: AclChanges,
    /// The action's contract was already met without any step running.
    pub skipped: bool,
}

impl ConvergenceResult {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}
