use std::path::Path;

use serde::Deserialize;

/// The human reference taxon in the classifier's taxonomy.
const HUMAN_TAXON: &str = "9606";

/// One classified taxon in the workflow's binned-read summary.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadsSummaryEntry {
    pub human_readable: String,
    pub taxon: String,
    pub tax_level: String,
    #[serde(default)]
    pub filenames: Vec<String>,
    pub qc_metrics: QcMetrics,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QcMetrics {
    pub num_reads: u64,
    #[serde(default)]
    pub avg_qual: f64,
    #[serde(default)]
    pub mean_len: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum SummaryError {
    #[error("failed to read binned-read summary")]
    Io(#[from] std::io::Error),
    #[error("failed to parse binned-read summary")]
    Parse(#[from] serde_json::Error),
}

pub async fn read_summary(result_path: &Path) -> Result<Vec<ReadsSummaryEntry>, SummaryError> {
    let raw = tokio::fs::read(result_path.join("reads_by_taxa").join("reads_summary.json")).await?;
    Ok(serde_json::from_slice(&raw)?)
}

/// The fraction of classified reads binned as human. Zero when nothing
/// was classified at all.
pub async fn human_fraction(result_path: &Path) -> Result<f64, SummaryError> {
    let summary = read_summary(result_path).await?;

    let total: u64 = summary.iter().map(|entry| entry.qc_metrics.num_reads).sum();
    if total == 0 {
        return Ok(0.0);
    }

    let human: u64 = summary
        .iter()
        .filter(|entry| entry.taxon == HUMAN_TAXON)
        .map(|entry| entry.qc_metrics.num_reads)
        .sum();

    Ok(human as f64 / total as f64)
}
