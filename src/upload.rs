//! Summary upload to remote object storage
//!
//! Narrow interface over the storage collaborator: one HTTP PUT of the
//! sweep CSV under a deterministic key. Callers treat failures here as
//! non-fatal since the local artifact already exists.

use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::info;

/// PUT `path` to `<endpoint>/<key>`
pub fn upload_results(endpoint: &str, key: &str, path: &Path) -> Result<()> {
    let url = format!("{}/{}", endpoint.trim_end_matches('/'), key);
    let body = std::fs::read(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let client = reqwest::blocking::Client::new();
    let response = client
        .put(&url)
        .header(reqwest::header::CONTENT_TYPE, "text/csv")
        .body(body)
        .send()
        .with_context(|| format!("upload request to {url} failed"))?;

    if !response.status().is_success() {
        bail!("upload to {url} returned status {}", response.status());
    }
    info!("uploaded results to {url}");
    Ok(())
}
