//! Consumption and metrics report intake.
//!
//! Reports are validated against the owning provisioning session's
//! reporting configuration and appended to the data collection
//! directory, one file per report.

use std::path::{Path, PathBuf};

use chrono::Utc;

/// Report families get separate subtrees under the collection root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFamily {
    Consumption,
    Metrics,
}

impl ReportFamily {
    fn dir_name(&self) -> &'static str {
        match self {
            Self::Consumption => "consumption",
            Self::Metrics => "metrics",
        }
    }
}

/// Writes one report body under
/// `<root>/<family>/<provisioningSessionId>/<timestamp>-<id>.json`.
pub async fn store_report(
    root: &Path,
    family: ReportFamily,
    provisioning_session_id: &str,
    body: &[u8],
) -> std::io::Result<PathBuf> {
    let dir = root.join(family.dir_name()).join(provisioning_session_id);
    tokio::fs::create_dir_all(&dir).await?;
    let filename = format!(
        "{}-{}.json",
        Utc::now().format("%Y%m%dT%H%M%S%3fZ"),
        msaf_common::ids::mint_id()
    );
    let path = dir.join(filename);
    tokio::fs::write(&path, body).await?;
    Ok(path)
}
