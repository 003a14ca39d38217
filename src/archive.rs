//! Zip bundling of the artifact set.

use std::fs::File;
use std::io;
use std::path::PathBuf;

use zip::ZipWriter;
use zip::write::FileOptions;

use crate::assemble::Artifact;
use crate::error::{GatewayError, GatewayResult};

/// Writes `artifacts` into a zip at `zip_path`, each entry under its logical
/// name, and returns the archive size in bytes. Runs on the blocking pool;
/// the artifacts live in a per-request scratch directory, so nothing else
/// can be mutating them while we read.
pub async fn bundle(artifacts: Vec<Artifact>, zip_path: PathBuf) -> GatewayResult<u64> {
    tokio::task::spawn_blocking(move || write_zip(&artifacts, &zip_path))
        .await
        .map_err(|err| GatewayError::Archive(format!("archive task failed: {err}")))?
        .map_err(|err| GatewayError::Archive(err.to_string()))
}

fn write_zip(artifacts: &[Artifact], zip_path: &PathBuf) -> anyhow::Result<u64> {
    let zip_file = File::create(zip_path)?;
    let mut zip = ZipWriter::new(zip_file);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for artifact in artifacts {
        zip.start_file(artifact.name.clone(), options)?;
        let mut source = File::open(&artifact.path)?;
        io::copy(&mut source, &mut zip)?;
    }

    zip.finish()?;
    Ok(std::fs::metadata(zip_path)?.len())
}
