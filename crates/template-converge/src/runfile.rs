//! A loaded run file: settings, resolved paths, node attributes and resources,
//! plus the wiring that turns them into a [`Converger`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::backup::BackupManager;
use crate::checksum::ChecksumCache;
use crate::config::{self, RunDoc};
use crate::converge::Converger;
use crate::error::Result;
use crate::locator::{self, CookbookRepository, NodeScope};
use crate::paths::{self, RunPaths, RunSettings};
use crate::resource::{self, DesiredState};

#[derive(Debug, Clone)]
pub struct RunFile {
    pub doc: RunDoc,
    pub settings: RunSettings,
    pub paths: RunPaths,
    pub node: toml::Table,
    pub resources: Vec<DesiredState>,
}

impl RunFile {
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_doc(config::load(path)?)
    }

    pub fn from_doc(doc: RunDoc) -> Result<Self> {
        let settings = paths::load_settings(&doc)?;
        let paths = paths::resolve_paths(&doc, &settings)?;
        let node = doc.node_attributes();
        let resources = resource::load_templates(&doc, &paths)?;
        Ok(Self {
            doc,
            settings,
            paths,
            node,
            resources,
        })
    }

    pub fn repository(&self) -> CookbookRepository {
        CookbookRepository::new(
            self.paths.cookbook_dir.clone(),
            NodeScope::from_attributes(&self.node),
        )
    }

    pub fn converger(&self, dry_run: bool) -> Converger {
        Converger::new(Arc::new(self.repository()), self.node.clone())
            .with_checksums(Arc::new(ChecksumCache::new()))
            .with_backups(Arc::new(BackupManager::new(self.paths.backup_dir.clone())))
            .with_dry_run(dry_run)
    }

    /// Worker count: an explicit override wins over `[run].max_parallel`; 0 means CPU count.
    pub fn max_parallel(&self, cli_override: Option<usize>) -> usize {
        match cli_override.unwrap_or(self.settings.max_parallel) {
            0 => num_cpus::get().max(1),
            n => n,
        }
    }

    /// Each resource's template path, or why it cannot be found.
    pub fn locate_all(&self) -> Vec<(&DesiredState, Result<PathBuf>)> {
        let repo = self.repository();
        self.resources
            .iter()
            .map(|d| (d, locator::locate(d, &repo)))
            .collect()
    }
}
