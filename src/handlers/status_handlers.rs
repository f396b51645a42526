//! `status`: phase, totals and per-bucket progress, as a table or JSON.

use crate::{
    config::AppConfig,
    errors::MigrationResult,
    handlers::EXIT_OK,
    models::{
        bucket::BucketStatus,
        metadata::{MigrationMetadata, ScanSummary},
        phase::Phase,
    },
    services::state_store::StateStore,
};
use anyhow::{Context, Result};
use serde::Serialize;
use std::fmt::Write as _;

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub metadata: MigrationMetadata,
    pub summary: ScanSummary,
    pub buckets: Vec<BucketStatus>,
}

pub async fn status(cfg: &AppConfig, json: bool) -> Result<u8> {
    if !cfg.state_db.exists() {
        println!(
            "No migration state at {} yet; `run` starts with a fresh scan.",
            cfg.state_db.display()
        );
        return Ok(EXIT_OK);
    }

    let store = StateStore::open_read_only(&cfg.state_db)
        .await
        .with_context(|| format!("opening state database {}", cfg.state_db.display()))?;
    let report = collect(&store).await;
    store.close().await;
    let report = report?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("encoding status as JSON")?
        );
    } else {
        print!("{}", render(&report));
    }
    Ok(EXIT_OK)
}

async fn collect(store: &StateStore) -> MigrationResult<StatusReport> {
    Ok(StatusReport {
        metadata: store.metadata().await?,
        summary: store.scan_summary().await?,
        buckets: store.bucket_statuses().await?,
    })
}

fn yes_no(flag: bool) -> &'static str {
    if flag { "yes" } else { "-" }
}

fn render(report: &StatusReport) -> String {
    let mut out = String::new();
    let meta = &report.metadata;
    let _ = writeln!(
        out,
        "Phase: {} ({}/{})",
        meta.current_phase,
        meta.current_phase.ordinal(),
        Phase::ALL.len()
    );
    let _ = writeln!(out, "Run started: {}", meta.run_started_at.to_rfc3339());
    for (phase, entered) in &meta.phase_entered_at {
        let _ = writeln!(out, "  {:<22} {}", phase.as_str(), entered.to_rfc3339());
    }

    let summary = &report.summary;
    let _ = writeln!(
        out,
        "\nBuckets: {}  Objects: {}  Bytes: {}  Cold objects awaiting restore: {}",
        summary.bucket_count, summary.object_count, summary.total_bytes, summary.cold_objects_pending
    );
    if !summary.storage_tiers.is_empty() {
        let tiers: Vec<String> = summary
            .storage_tiers
            .iter()
            .map(|(tier, count)| format!("{tier}={count}"))
            .collect();
        let _ = writeln!(out, "Storage tiers: {}", tiers.join(", "));
    }

    if report.buckets.is_empty() {
        let _ = writeln!(out, "\nNo buckets scanned yet.");
        return out;
    }

    let _ = writeln!(
        out,
        "\n{:<32} {:>9} {:>14} {:>5} {:>8} {:>8} {:>7} {:>9} {:>9} {:>14}",
        "BUCKET", "OBJECTS", "BYTES", "SCAN", "TRANSFER", "VERIFIED", "DELETED", "SIZE-OK",
        "DIGEST-OK", "BYTES-OK"
    );
    for bucket in &report.buckets {
        let (size_ok, digest_ok, bytes_ok) = match bucket.verification {
            Some(counts) => (
                counts.size_verified_count.to_string(),
                counts.digest_verified_count.to_string(),
                counts.bytes_verified.to_string(),
            ),
            None => ("-".into(), "-".into(), "-".into()),
        };
        let _ = writeln!(
            out,
            "{:<32} {:>9} {:>14} {:>5} {:>8} {:>8} {:>7} {:>9} {:>9} {:>14}",
            bucket.bucket,
            bucket.expected_object_count,
            bucket.expected_total_bytes,
            yes_no(bucket.scan_complete),
            yes_no(bucket.transfer_complete),
            yes_no(bucket.verification_complete),
            yes_no(bucket.deletion_complete),
            size_ok,
            digest_ok,
            bytes_ok,
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{bucket::VerificationCounts, digest::Digest, object::{ObjectRecord, StorageTier}},
        services::state_store::tests::temp_store,
    };

    #[tokio::test]
    async fn table_lists_buckets_and_counters() {
        let (_dir, store) = temp_store().await;
        store.begin_bucket_scan("photos").await.unwrap();
        let record = ObjectRecord::discovered(
            "photos",
            "a.jpg",
            10,
            Digest::of_bytes(&[0u8; 10]),
            StorageTier::DirectlyReadable(StorageTier::STANDARD.into()),
        );
        store.upsert_object("pass", &record).await.unwrap();
        store.finalize_bucket_scan("photos", "pass").await.unwrap();
        store
            .record_verification_counts(
                "photos",
                &VerificationCounts {
                    size_verified_count: 1,
                    digest_verified_count: 1,
                    bytes_verified: 10,
                    local_object_count: 1,
                },
            )
            .await
            .unwrap();

        let report = collect(&store).await.unwrap();
        let table = render(&report);
        assert!(table.contains("Phase: scanning (1/5)"));
        assert!(table.contains("Storage tiers: STANDARD=1"));
        let row = table.lines().find(|l| l.starts_with("photos")).unwrap();
        assert!(row.contains("yes"));
        assert!(row.split_whitespace().any(|cell| cell == "10"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["metadata"]["current_phase"], "scanning");
        assert_eq!(json["buckets"][0]["verification"]["bytes_verified"], 10);
    }

    #[tokio::test]
    async fn empty_state_says_so() {
        let (_dir, store) = temp_store().await;
        let table = render(&collect(&store).await.unwrap());
        assert!(table.contains("No buckets scanned yet."));
    }
}
