//! Command bodies behind the `kbsync` subcommands.
//!
//! Each function loads what it needs from the config, does one thing and
//! prints a human-readable summary to stdout.

use anyhow::{bail, Result};
use chrono::{TimeZone, Utc};
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::ScanCache;
use crate::client::{KnowledgeApi, SignedClient};
use crate::config::Config;
use crate::ledger::UploadLedger;
use crate::models::{NameRelation, UploadRecord};
use crate::orchestrator::{self, Orchestrator, PassReport};
use crate::resolver::NameResolver;
use crate::scheduler::{self, PassGate};
use crate::{db, migrate, server};

async fn open_pool(config: &Config) -> Result<SqlitePool> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;
    Ok(pool)
}

async fn build_gate(config: &Config) -> Result<PassGate> {
    let orchestrator = Orchestrator::from_config(config).await?;
    Ok(PassGate::new(Arc::new(orchestrator)))
}

fn format_ts(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}

pub fn print_report(report: &PassReport) {
    println!("Scan pass complete");
    println!(
        "  folders: {} seen, {} completed, {} skipped (cached), {} empty, {} failed",
        report.folders_seen,
        report.folders_completed,
        report.folders_skipped,
        report.folders_empty,
        report.folders_failed
    );
    println!(
        "  files:   {} uploaded, {} already uploaded, {} failed",
        report.files_uploaded, report.files_skipped, report.files_failed
    );
    println!("  knowledge bases created: {}", report.knowledge_bases_created);
    println!("  expired backups removed: {}", report.backups_removed);
    if report.degraded_auth {
        println!("  WARNING: running on the fallback token");
    }
}

/// `kbsync scan`: one pass. Fails the process when any folder failed.
pub async fn run_scan(config: &Config) -> Result<()> {
    let gate = build_gate(config).await?;
    let report = gate.run().await;
    print_report(&report);
    if report.folders_failed > 0 {
        bail!(
            "{} folder(s) failed and will be retried",
            report.folders_failed
        );
    }
    Ok(())
}

/// `kbsync run`: the periodic loop until Ctrl-C.
pub async fn run_loop(config: &Config) -> Result<()> {
    let gate = build_gate(config).await?;
    println!(
        "Scanning {} every {}s (Ctrl-C to stop)",
        config.scan.dir.display(),
        config.scan.interval_secs
    );
    scheduler::run_periodic(gate, Duration::from_secs(config.scan.interval_secs)).await
}

/// `kbsync serve`: admin API, plus the periodic loop unless disabled.
pub async fn run_serve(config: &Config, schedule: bool) -> Result<()> {
    let gate = build_gate(config).await?;
    println!("Admin API on http://{}", config.server.bind);
    if !schedule {
        return server::run_server(config, gate).await;
    }
    let interval = Duration::from_secs(config.scan.interval_secs);
    tokio::select! {
        result = server::run_server(config, gate.clone()) => result,
        result = scheduler::run_periodic(gate, interval) => result,
    }
}

/// `kbsync token`: fetch a token once to check credentials and connectivity.
pub async fn run_token(config: &Config) -> Result<()> {
    let client = SignedClient::new(config.remote.clone())?;
    let token = client.fetch_token().await?;
    let prefix: String = token.chars().take(4).collect();
    println!(
        "Token fetched from {} ({}…, {} chars)",
        config.remote.base_url,
        prefix,
        token.chars().count()
    );
    Ok(())
}

pub fn cache_status(config: &Config, folder: &Path) -> Result<()> {
    let cache = ScanCache::from_config(&config.scan);
    println!("Folder:    {}", folder.display());
    println!("Marker:    {}", cache.marker_path(folder).display());
    println!("Enabled:   {}", cache.is_enabled());
    println!("Processed: {}", cache.lookup(folder)?);
    Ok(())
}

pub fn cache_invalidate(config: &Config, folder: &Path) -> Result<()> {
    let cache = ScanCache::from_config(&config.scan);
    if cache.invalidate(folder)? {
        println!("Marker removed; {} will be rescanned.", folder.display());
    } else {
        println!("No marker for {}.", folder.display());
    }
    Ok(())
}

fn print_relations(relations: &[NameRelation]) {
    if relations.is_empty() {
        println!("No relations.");
        return;
    }
    for r in relations {
        println!(
            "{:>5}  {:<32}  {}  ({})",
            r.id,
            r.name,
            r.knowledge_id,
            format_ts(r.created_at)
        );
    }
}

pub async fn relations_list(config: &Config) -> Result<()> {
    let resolver = NameResolver::new(open_pool(config).await?);
    print_relations(&resolver.list().await?);
    Ok(())
}

pub async fn relations_search(config: &Config, name: &str) -> Result<()> {
    let resolver = NameResolver::new(open_pool(config).await?);
    print_relations(&resolver.find_by_name(name).await?);
    Ok(())
}

pub async fn relations_add(config: &Config, name: &str, knowledge_id: &str) -> Result<()> {
    if name.trim().is_empty() || knowledge_id.trim().is_empty() {
        bail!("name and knowledge id must not be empty");
    }
    let resolver = NameResolver::new(open_pool(config).await?);
    resolver.record(name, knowledge_id).await?;
    println!("Recorded {} -> {}", name, knowledge_id);
    Ok(())
}

fn print_records(records: &[UploadRecord]) {
    if records.is_empty() {
        println!("No records.");
        return;
    }
    for r in records {
        println!(
            "{:>5}  {:<24}  {:<24}  {}  ({})",
            r.id,
            r.knowledge_id,
            r.knowledge_name,
            r.file_name,
            format_ts(r.created_at)
        );
    }
}

pub async fn records_list(config: &Config, knowledge_id: &str) -> Result<()> {
    let ledger = UploadLedger::new(open_pool(config).await?);
    print_records(&ledger.by_knowledge_base(knowledge_id).await?);
    Ok(())
}

pub async fn records_search(config: &Config, fragment: &str) -> Result<()> {
    let ledger = UploadLedger::new(open_pool(config).await?);
    print_records(&ledger.search_file_name(fragment).await?);
    Ok(())
}

pub async fn records_get(config: &Config, id: i64) -> Result<()> {
    let ledger = UploadLedger::new(open_pool(config).await?);
    match ledger.get(id).await? {
        Some(record) => {
            print_records(std::slice::from_ref(&record));
            Ok(())
        }
        None => bail!("no upload record with id {}", id),
    }
}

pub async fn records_delete(config: &Config, id: i64) -> Result<()> {
    let ledger = UploadLedger::new(open_pool(config).await?);
    if !ledger.delete(id).await? {
        bail!("no upload record with id {}", id);
    }
    println!("Deleted upload record {}", id);
    Ok(())
}

/// `kbsync cleanup`: backup retention only.
pub fn run_cleanup(config: &Config) -> Result<()> {
    let removed = orchestrator::cleanup_backups(&config.scan.backup_dir, config.scan.clean_days)?;
    println!(
        "Removed {} expired backup(s) from {}",
        removed,
        config.scan.backup_dir.display()
    );
    Ok(())
}
