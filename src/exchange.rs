//! Static fields for stream capture files.
//!
//! Dark and flat fields retaken during a stream scan go to their own files in
//! the data directory. Every capture file gets a copy of both, so it holds
//! everything a reconstruction needs.

use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::ScanResult;
#[cfg(not(feature = "storage_hdf5"))]
use crate::error::ScanError;

/// File the retaken dark fields are written to.
pub const DARK_FIELDS_FILE: &str = "dark_fields.h5";
/// File the retaken flat fields are written to.
pub const FLAT_FIELDS_FILE: &str = "flat_fields.h5";

/// A dataset to copy into capture files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSource {
    pub file: PathBuf,
    pub dataset: String,
}

/// Retaken field files next to `capture`. Missing files are skipped.
pub fn field_sources(capture: &Path, dark_location: &str, flat_location: &str) -> Vec<FieldSource> {
    let dir = capture.parent().unwrap_or_else(|| Path::new(""));
    [
        (DARK_FIELDS_FILE, dark_location),
        (FLAT_FIELDS_FILE, flat_location),
    ]
    .into_iter()
    .filter_map(|(name, dataset)| {
        let file = dir.join(name);
        if file.is_file() {
            Some(FieldSource {
                file,
                dataset: dataset.to_string(),
            })
        } else {
            warn!(file = %file.display(), "no retaken fields");
            None
        }
    })
    .collect()
}

#[cfg(feature = "storage_hdf5")]
mod file {
    use super::*;
    use hdf5::File;

    pub fn copy_fields(capture: &Path, sources: &[FieldSource]) -> ScanResult<usize> {
        let target = File::open_rw(capture)?;
        for source in sources {
            let data = File::open(&source.file)?
                .dataset(&source.dataset)?
                .read_dyn::<u16>()?;
            if target.link_exists(&source.dataset) {
                target.unlink(&source.dataset)?;
            }
            target
                .new_dataset_builder()
                .with_data(&data)
                .create(source.dataset.as_str())?;
        }
        Ok(sources.len())
    }
}

/// Copy every source dataset into `capture`, replacing what is there.
#[cfg(feature = "storage_hdf5")]
pub fn copy_fields(capture: &Path, sources: &[FieldSource]) -> ScanResult<usize> {
    let copied = file::copy_fields(capture, sources)?;
    info!(path = %capture.display(), copied, "static fields copied");
    Ok(copied)
}

/// Copy every source dataset into `capture`, replacing what is there.
#[cfg(not(feature = "storage_hdf5"))]
pub fn copy_fields(capture: &Path, sources: &[FieldSource]) -> ScanResult<usize> {
    if sources.is_empty() {
        info!(path = %capture.display(), "no static fields to copy");
        return Ok(0);
    }
    Err(ScanError::FeatureNotEnabled("storage_hdf5".into()))
}
