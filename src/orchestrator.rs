//! The scan pass.
//!
//! ```text
//! <scan_dir>/<year>/<month>/   (one leaf folder at a time)
//!   │ cached? ──yes──▶ skip
//!   ▼
//! files (by extension) ──[merge]──▶ items
//!   │ for each item and each of its groups:
//!   ▼
//! ledger has it? ──yes──▶ skip
//!   ▼
//! active KB for group? ──no──▶ resolve slot / create + record
//!   ▼
//! upload ──▶ ledger record ──▶ count (ceiling ⇒ Idle)
//!   ▼
//! backup copy
//!   ▼
//! no failures in folder ⇒ cache marker
//! ```
//!
//! Knowledge-base state is a [`FolderBatch`] created per folder and threaded
//! through the calls; nothing survives from one folder to the next except
//! what is persisted in the resolver and the ledger. A failing file fails
//! its folder (no marker, retried next pass) but never stops the pass.

use anyhow::Result;
use chrono::Local;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use walkdir::WalkDir;

use crate::cache::ScanCache;
use crate::client::{ApiError, KnowledgeApi, SignedClient};
use crate::config::{Config, ScanConfig};
use crate::{db, migrate};
use crate::grouping;
use crate::ledger::UploadLedger;
use crate::merge::{DocumentMerger, TextMerger};
use crate::resolver::NameResolver;

/// Why one file (or one group upload of it) did not make it.
#[derive(Debug, Error)]
pub enum FileError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("bookkeeping failed: {0}")]
    Store(#[from] anyhow::Error),
}

/// Knowledge-base state of one logical group.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BatchState {
    #[default]
    Idle,
    Active {
        knowledge_id: String,
        /// 1-based slot, see [`grouping::slot_name`].
        slot: usize,
        count: usize,
    },
}

/// Batch state for the groups touched by one folder.
#[derive(Debug)]
pub struct FolderBatch {
    ceiling: usize,
    groups: HashMap<String, BatchState>,
}

impl FolderBatch {
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling,
            groups: HashMap::new(),
        }
    }

    pub fn state(&self, group: &str) -> BatchState {
        self.groups.get(group).cloned().unwrap_or_default()
    }

    fn activate(&mut self, group: &str, knowledge_id: String, slot: usize, count: usize) {
        self.groups.insert(
            group.to_string(),
            BatchState::Active {
                knowledge_id,
                slot,
                count,
            },
        );
    }

    pub fn reset(&mut self, group: &str) {
        self.groups.remove(group);
    }

    /// Counts an upload; at the ceiling the group goes back to `Idle`.
    /// Returns whether the ceiling was reached.
    fn record_upload(&mut self, group: &str) -> bool {
        let full = match self.groups.get_mut(group) {
            Some(BatchState::Active { count, .. }) => {
                *count += 1;
                *count >= self.ceiling
            }
            _ => false,
        };
        if full {
            self.reset(group);
        }
        full
    }
}

/// A `<year>/<month>` folder under the scan root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafFolder {
    pub path: PathBuf,
    pub year: String,
    pub month: String,
}

/// Counters for one pass.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub folders_seen: usize,
    pub folders_skipped: usize,
    pub folders_empty: usize,
    pub folders_completed: usize,
    pub folders_failed: usize,
    pub files_uploaded: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub knowledge_bases_created: usize,
    pub backups_removed: usize,
    /// The remote client ran on its fallback token at the end of the pass.
    pub degraded_auth: bool,
}

enum GroupOutcome {
    Uploaded,
    AlreadyUploaded,
}

pub struct Orchestrator {
    scan: ScanConfig,
    api: Arc<dyn KnowledgeApi>,
    cache: ScanCache,
    resolver: NameResolver,
    ledger: UploadLedger,
    merger: Box<dyn DocumentMerger>,
    extensions: GlobSet,
}

impl Orchestrator {
    pub fn new(scan: ScanConfig, api: Arc<dyn KnowledgeApi>, pool: SqlitePool) -> Result<Self> {
        let extensions = extension_globset(&scan.supported_extensions)?;
        Ok(Self {
            cache: ScanCache::from_config(&scan),
            resolver: NameResolver::new(pool.clone()),
            ledger: UploadLedger::new(pool),
            merger: Box::new(TextMerger),
            api,
            extensions,
            scan,
        })
    }

    /// Wires the production stack: SQLite (migrated), the signed client and
    /// the text merger.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        let api = Arc::new(SignedClient::new(config.remote.clone())?);
        Self::new(config.scan.clone(), api, pool)
    }

    pub fn with_merger(mut self, merger: Box<dyn DocumentMerger>) -> Self {
        self.merger = merger;
        self
    }

    pub fn cache(&self) -> &ScanCache {
        &self.cache
    }

    pub fn resolver(&self) -> &NameResolver {
        &self.resolver
    }

    pub fn ledger(&self) -> &UploadLedger {
        &self.ledger
    }

    pub fn scan_config(&self) -> &ScanConfig {
        &self.scan
    }

    /// Runs one full pass: every leaf folder, then backup retention.
    ///
    /// Always completes; failures are logged and counted in the report.
    pub async fn run_pass(&self) -> PassReport {
        let mut report = PassReport::default();
        tracing::info!(dir = %self.scan.dir.display(), "scan pass started");

        match discover_folders(&self.scan.dir) {
            Ok(folders) => {
                for folder in &folders {
                    self.process_folder(folder, &mut report).await;
                }
            }
            Err(e) => {
                tracing::error!(dir = %self.scan.dir.display(), error = %e, "cannot list scan directory");
            }
        }

        match cleanup_backups(&self.scan.backup_dir, self.scan.clean_days) {
            Ok(removed) => report.backups_removed = removed,
            Err(e) => tracing::error!(error = %e, "backup retention failed"),
        }

        report.degraded_auth = self.api.is_degraded();
        tracing::info!(?report, "scan pass finished");
        report
    }

    /// Processes one leaf folder. Returns whether it is now marked processed.
    pub async fn process_folder(&self, folder: &LeafFolder, report: &mut PassReport) -> bool {
        report.folders_seen += 1;
        if self.cache.is_processed(&folder.path) {
            tracing::info!(folder = %folder.path.display(), "already processed, skipping");
            report.folders_skipped += 1;
            return false;
        }

        let files = match collect_files(&folder.path, &self.extensions) {
            Ok(files) => files,
            Err(e) => {
                tracing::error!(folder = %folder.path.display(), error = %e, "cannot list folder");
                report.folders_failed += 1;
                return false;
            }
        };
        if files.is_empty() {
            tracing::info!(folder = %folder.path.display(), "no supported files");
            report.folders_empty += 1;
            return false;
        }
        tracing::info!(folder = %folder.path.display(), files = files.len(), "processing folder");

        let period = grouping::period_label(&folder.year, &folder.month);
        let (items, merged) = if self.scan.merge {
            let output = self
                .scan
                .output_dir
                .join(grouping::merged_file_name(&folder.year, &folder.month));
            match self.merger.merge(&files, &output) {
                Ok(path) => (vec![path], true),
                Err(e) => {
                    tracing::error!(folder = %folder.path.display(), error = %e, "merge failed");
                    report.folders_failed += 1;
                    return false;
                }
            }
        } else {
            (files, false)
        };

        let mut batch = FolderBatch::new(self.scan.max_files_per_kb);
        let mut failures = 0usize;

        for item in &items {
            let file_name = item
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();

            let mut groups = vec![period.clone()];
            if self.scan.region_groups && !merged {
                if let Some(region) = grouping::extract_region(&file_name) {
                    groups.push(grouping::region_group(&region));
                }
            }

            let mut uploaded_any = false;
            let mut file_failed = false;
            for group in &groups {
                match self
                    .upload_to_group(&mut batch, group, item, &file_name, report)
                    .await
                {
                    Ok(GroupOutcome::Uploaded) => {
                        report.files_uploaded += 1;
                        uploaded_any = true;
                    }
                    Ok(GroupOutcome::AlreadyUploaded) => {
                        tracing::info!(file = %item.display(), group = %group, "already uploaded, skipping");
                        report.files_skipped += 1;
                    }
                    Err(e) => {
                        tracing::error!(file = %item.display(), group = %group, error = %e, "upload failed");
                        report.files_failed += 1;
                        file_failed = true;
                        batch.reset(group);
                    }
                }
            }

            // A file skipped as already uploaded still gets its copy if an
            // earlier backup attempt failed.
            let name = backup_name(folder, item);
            if uploaded_any || (!file_failed && !backup_exists(&self.scan.backup_dir, &name)) {
                if let Err(e) = backup_file(item, &self.scan.backup_dir, &name) {
                    tracing::error!(file = %item.display(), error = %e, "backup failed");
                    file_failed = true;
                }
            }
            if file_failed {
                failures += 1;
            }
        }

        if failures > 0 {
            tracing::warn!(
                folder = %folder.path.display(),
                failures,
                "folder incomplete, will retry next pass"
            );
            report.folders_failed += 1;
            return false;
        }

        match self.cache.mark_processed(&folder.path) {
            Ok(()) => {
                report.folders_completed += 1;
                true
            }
            Err(e) => {
                tracing::error!(folder = %folder.path.display(), error = %e, "cannot write cache marker");
                report.folders_failed += 1;
                false
            }
        }
    }

    async fn upload_to_group(
        &self,
        batch: &mut FolderBatch,
        group: &str,
        file: &Path,
        file_name: &str,
        report: &mut PassReport,
    ) -> Result<GroupOutcome, FileError> {
        let key = file_key(file);
        if self.already_uploaded(group, &key).await? {
            return Ok(GroupOutcome::AlreadyUploaded);
        }

        let (knowledge_id, knowledge_name) = self.ensure_active(batch, group, report).await?;
        let remote_name = grouping::remote_file_name(group, file_name);
        self.api
            .upload_file(&knowledge_id, &knowledge_name, file, &remote_name)
            .await?;
        if let Err(e) = self
            .ledger
            .record(&knowledge_id, &knowledge_name, &key)
            .await
        {
            tracing::warn!(
                file = %key,
                knowledge_id = %knowledge_id,
                remote_name = %remote_name,
                error = %e,
                "uploaded but not recorded; the next pass may upload a duplicate"
            );
            return Err(e.into());
        }

        if batch.record_upload(group) {
            tracing::info!(group, knowledge_id = %knowledge_id, "knowledge base reached its file ceiling");
        }
        Ok(GroupOutcome::Uploaded)
    }

    /// Whether any slot of `group` already holds `key`.
    async fn already_uploaded(&self, group: &str, key: &str) -> Result<bool> {
        let mut slot = 1;
        while let Some(knowledge_id) = self
            .resolver
            .resolve(&grouping::slot_name(group, slot))
            .await?
        {
            if self.ledger.was_uploaded(&knowledge_id, key).await? {
                return Ok(true);
            }
            slot += 1;
        }
        Ok(false)
    }

    /// Returns the active knowledge base of `group`, activating one if idle.
    ///
    /// Walks the group's slots in order and takes the first one whose
    /// recorded uploads are under the ceiling, creating the first missing
    /// slot remotely.
    async fn ensure_active(
        &self,
        batch: &mut FolderBatch,
        group: &str,
        report: &mut PassReport,
    ) -> Result<(String, String), FileError> {
        if let BatchState::Active {
            knowledge_id, slot, ..
        } = batch.state(group)
        {
            return Ok((knowledge_id, grouping::slot_name(group, slot)));
        }

        let mut slot = 1;
        loop {
            let name = grouping::slot_name(group, slot);
            match self.resolver.resolve(&name).await? {
                Some(knowledge_id) => {
                    let count = self.ledger.count_by_knowledge_base(&knowledge_id).await?;
                    if count < self.scan.max_files_per_kb {
                        batch.activate(group, knowledge_id.clone(), slot, count);
                        return Ok((knowledge_id, name));
                    }
                    slot += 1;
                }
                None => {
                    let knowledge_id = self.api.create_knowledge_base(&name, &name).await?;
                    report.knowledge_bases_created += 1;
                    self.resolver.record(&name, &knowledge_id).await?;
                    batch.activate(group, knowledge_id.clone(), slot, 0);
                    return Ok((knowledge_id, name));
                }
            }
        }
    }
}

/// Ledger key of a file: its absolute path.
pub fn file_key(file: &Path) -> String {
    std::fs::canonicalize(file)
        .unwrap_or_else(|_| file.to_path_buf())
        .to_string_lossy()
        .to_string()
}

/// Lists `<root>/<year>/<month>` directories in name order.
pub fn discover_folders(root: &Path) -> Result<Vec<LeafFolder>> {
    if !root.is_dir() {
        anyhow::bail!("scan directory does not exist: {}", root.display());
    }
    let mut folders = Vec::new();
    let walker = WalkDir::new(root)
        .min_depth(2)
        .max_depth(2)
        .sort_by_file_name();
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let path = entry.path().to_path_buf();
        let month = entry.file_name().to_string_lossy().to_string();
        let year = path
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        folders.push(LeafFolder { path, year, month });
    }
    Ok(folders)
}

/// Files under `folder` (recursively) matching the extension set, sorted.
pub fn collect_files(folder: &Path, extensions: &GlobSet) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(folder) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(folder).unwrap_or(entry.path());
        if extensions.is_match(relative) {
            files.push(entry.path().to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}

/// Case-insensitive `**/*.<ext>` globs for the configured extensions.
pub fn extension_globset(extensions: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for ext in extensions {
        let ext = ext.trim().trim_start_matches('.');
        if ext.is_empty() {
            continue;
        }
        builder.add(
            GlobBuilder::new(&format!("**/*.{}", ext))
                .case_insensitive(true)
                .build()?,
        );
    }
    Ok(builder.build()?)
}

/// Backup file name of `file`: `<year>_<month>_<path under the folder>`, with
/// directory separators turned into `_`. Files outside the folder (a merged
/// document) use their bare name.
pub fn backup_name(folder: &LeafFolder, file: &Path) -> String {
    let relative = match file.strip_prefix(&folder.path) {
        Ok(rel) => rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join("_"),
        Err(_) => file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
    };
    format!("{}_{}_{}", folder.year, folder.month, relative)
}

/// Whether any dated directory under `backup_dir` already holds `name`.
pub fn backup_exists(backup_dir: &Path, name: &str) -> bool {
    WalkDir::new(backup_dir)
        .min_depth(2)
        .max_depth(2)
        .into_iter()
        .filter_map(|e| e.ok())
        .any(|e| e.file_type().is_file() && e.file_name().to_string_lossy() == name)
}

/// Copies `file` to `<backup_dir>/<YYYYMMDD>/<name>`.
pub fn backup_file(file: &Path, backup_dir: &Path, name: &str) -> std::io::Result<PathBuf> {
    let dated = backup_dir.join(Local::now().format("%Y%m%d").to_string());
    std::fs::create_dir_all(&dated)?;
    let target = dated.join(name);
    std::fs::copy(file, &target)?;
    Ok(target)
}

/// Deletes regular files under `backup_dir` last modified more than
/// `clean_days` days ago. `0` disables retention. Returns how many were removed.
pub fn cleanup_backups(backup_dir: &Path, clean_days: u32) -> std::io::Result<usize> {
    std::fs::create_dir_all(backup_dir)?;
    if clean_days == 0 {
        return Ok(0);
    }
    let max_age = Duration::from_secs(u64::from(clean_days) * 86_400);
    let cutoff = SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut removed = 0;
    for entry in WalkDir::new(backup_dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let modified = match entry.metadata().ok().and_then(|m| m.modified().ok()) {
            Some(t) => t,
            None => continue,
        };
        if modified < cutoff {
            match std::fs::remove_file(entry.path()) {
                Ok(()) => {
                    tracing::info!(file = %entry.path().display(), "removed expired backup");
                    removed += 1;
                }
                Err(e) => {
                    tracing::warn!(file = %entry.path().display(), error = %e, "cannot remove expired backup");
                }
            }
        }
    }
    Ok(removed)
}
