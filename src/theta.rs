//! Theta reconciliation.
//!
//! After a scan the file writer's frame index (`/defaults/NDArrayUniqueId`
//! with the matching `/defaults/HDF5FrameLocation` tags) says which frames
//! actually reached the file. Projection angles are assigned by unique ID,
//! `theta[id - first_id]`, so a dropped frame never shifts the angles of the
//! frames after it. Every gap is reported with its index and angle.
//!
//! The reconciliation itself is pure. Reading and writing the data file needs
//! the `storage_hdf5` feature.

use std::path::Path;
use tracing::{info, warn};

use crate::error::ScanResult;
#[cfg(not(feature = "storage_hdf5"))]
use crate::error::ScanError;

/// Dataset holding the unique ID of every saved frame.
pub const UNIQUE_ID_DATASET: &str = "/defaults/NDArrayUniqueId";
/// Dataset holding the destination of every saved frame.
pub const FRAME_LOCATION_DATASET: &str = "/defaults/HDF5FrameLocation";
/// Dataset the angles are written to.
pub const THETA_DATASET: &str = "/exchange/theta";

/// Unique ID and destination of every saved frame, in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameIndex {
    /// `NDArrayUniqueId` per frame
    pub unique_ids: Vec<i64>,
    /// `HDF5FrameLocation` per frame
    pub locations: Vec<String>,
}

impl FrameIndex {
    /// IDs of the frames saved to `location`.
    pub fn ids_at(&self, location: &str) -> Vec<i64> {
        self.unique_ids
            .iter()
            .zip(&self.locations)
            .filter(|(_, l)| l.trim_end_matches('\0').trim() == location)
            .map(|(id, _)| *id)
            .collect()
    }
}

/// What a scan should have written.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpectedFrames {
    /// Where projections go, normally `/exchange/data`
    pub projection_location: String,
    /// Where flat fields go, normally `/exchange/data_white`
    pub flat_location: String,
    /// Where dark fields go, normally `/exchange/data_dark`
    pub dark_location: String,
    /// Flat fields over all collections
    pub flats: usize,
    /// Dark fields over all collections
    pub darks: usize,
}

/// Result of [`reconcile`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThetaReconciliation {
    /// One angle per saved projection, in file order
    pub theta: Vec<f32>,
    /// Planned projection indices with no saved frame
    pub missing_indices: Vec<usize>,
    /// Angles of the missing projections
    pub missing_angles: Vec<f64>,
    /// Projection IDs that fall outside the planned angles
    pub out_of_range: Vec<i64>,
    /// Expected minus saved flat fields (negative for extras)
    pub flat_shortfall: i64,
    /// Expected minus saved dark fields (negative for extras)
    pub dark_shortfall: i64,
}

impl ThetaReconciliation {
    /// True when every expected frame was saved.
    pub fn is_complete(&self) -> bool {
        self.missing_indices.is_empty()
            && self.out_of_range.is_empty()
            && self.flat_shortfall == 0
            && self.dark_shortfall == 0
    }
}

/// Assign planned angles to the saved projections.
///
/// `first_id` is the unique ID of planned projection 0; `None` takes the
/// first saved projection's ID.
pub fn reconcile(
    theta: &[f64],
    frames: &FrameIndex,
    first_id: Option<i64>,
    expected: &ExpectedFrames,
) -> ThetaReconciliation {
    let projection_ids = frames.ids_at(&expected.projection_location);
    let flats = frames.ids_at(&expected.flat_location).len();
    let darks = frames.ids_at(&expected.dark_location).len();
    let mut result = ThetaReconciliation {
        flat_shortfall: expected.flats as i64 - flats as i64,
        dark_shortfall: expected.darks as i64 - darks as i64,
        ..ThetaReconciliation::default()
    };

    let first = first_id.or_else(|| projection_ids.first().copied());
    let mut seen = vec![false; theta.len()];
    if let Some(first) = first {
        for id in &projection_ids {
            let index = usize::try_from(id - first).ok().filter(|i| *i < theta.len());
            match index {
                Some(i) => {
                    seen[i] = true;
                    result.theta.push(theta[i] as f32);
                }
                None => result.out_of_range.push(*id),
            }
        }
    }
    for (index, angle) in theta.iter().enumerate() {
        if !seen[index] {
            result.missing_indices.push(index);
            result.missing_angles.push(*angle);
        }
    }

    if !result.missing_indices.is_empty() {
        warn!(
            missing = result.missing_indices.len(),
            indices = ?result.missing_indices,
            angles = ?result.missing_angles,
            "missing projection frames"
        );
    }
    if !result.out_of_range.is_empty() {
        warn!(ids = ?result.out_of_range, "projection IDs outside the planned angles");
    }
    if result.flat_shortfall != 0 {
        warn!(
            expected = expected.flats,
            saved = flats,
            "flat field count mismatch"
        );
    }
    if result.dark_shortfall != 0 {
        warn!(
            expected = expected.darks,
            saved = darks,
            "dark field count mismatch"
        );
    }
    result
}

/// Angles of streamed frames: `start + (id - first_id) · step`.
///
/// IDs earlier than `first_id` belong to the previous synchronization and are
/// returned separately.
pub fn stream_theta(unique_ids: &[i64], first_id: i64, start: f64, step: f64) -> (Vec<f32>, Vec<i64>) {
    let mut theta = Vec::with_capacity(unique_ids.len());
    let mut stale = Vec::new();
    for id in unique_ids {
        if *id < first_id {
            stale.push(*id);
        } else {
            theta.push((start + (id - first_id) as f64 * step) as f32);
        }
    }
    if !stale.is_empty() {
        warn!(ids = ?stale, first_id, "frames captured before the last synchronization");
    }
    (theta, stale)
}

#[cfg(feature = "storage_hdf5")]
mod file {
    use super::*;
    use hdf5::types::{FixedAscii, VarLenAscii};
    use hdf5::File;

    pub fn read_frame_index(path: &Path) -> ScanResult<FrameIndex> {
        let file = File::open(path)?;
        let unique_ids = file.dataset(UNIQUE_ID_DATASET)?.read_raw::<i64>()?;
        let locations = file.dataset(FRAME_LOCATION_DATASET)?;
        let locations = match locations.read_raw::<FixedAscii<256>>() {
            Ok(values) => values.iter().map(|v| v.as_str().to_string()).collect(),
            Err(_) => locations
                .read_raw::<VarLenAscii>()?
                .iter()
                .map(|v| v.as_str().to_string())
                .collect(),
        };
        Ok(FrameIndex {
            unique_ids,
            locations,
        })
    }

    pub fn write_theta(path: &Path, theta: &[f32]) -> ScanResult<()> {
        let file = File::open_rw(path)?;
        if file.link_exists(THETA_DATASET) {
            file.unlink(THETA_DATASET)?;
        }
        file.new_dataset::<f32>()
            .create(THETA_DATASET, theta.len())?
            .write(theta)?;
        Ok(())
    }
}

/// Read the frame index of a data file.
#[cfg(feature = "storage_hdf5")]
pub fn read_frame_index(path: &Path) -> ScanResult<FrameIndex> {
    file::read_frame_index(path)
}

/// Read the frame index of a data file.
#[cfg(not(feature = "storage_hdf5"))]
pub fn read_frame_index(_path: &Path) -> ScanResult<FrameIndex> {
    Err(ScanError::FeatureNotEnabled("storage_hdf5".into()))
}

/// Write `/exchange/theta`, replacing an existing dataset.
#[cfg(feature = "storage_hdf5")]
pub fn write_theta(path: &Path, theta: &[f32]) -> ScanResult<()> {
    file::write_theta(path, theta)
}

/// Write `/exchange/theta`, replacing an existing dataset.
#[cfg(not(feature = "storage_hdf5"))]
pub fn write_theta(_path: &Path, _theta: &[f32]) -> ScanResult<()> {
    Err(ScanError::FeatureNotEnabled("storage_hdf5".into()))
}

/// Reconcile the saved frames of `path` against `theta` and write the result.
pub fn add_theta(
    path: &Path,
    theta: &[f64],
    expected: &ExpectedFrames,
) -> ScanResult<ThetaReconciliation> {
    let frames = read_frame_index(path)?;
    let result = reconcile(theta, &frames, None, expected);
    write_theta(path, &result.theta)?;
    info!(
        path = %path.display(),
        saved = result.theta.len(),
        planned = theta.len(),
        "theta written"
    );
    Ok(result)
}

/// Write streamed angles for the frames saved in `path`.
pub fn dump_stream_theta(path: &Path, first_id: i64, start: f64, step: f64) -> ScanResult<usize> {
    let frames = read_frame_index(path)?;
    let (theta, _) = stream_theta(&frames.unique_ids, first_id, start, step);
    write_theta(path, &theta)?;
    if let (Some(first), Some(last)) = (theta.first(), theta.last()) {
        info!(path = %path.display(), first, last, count = theta.len(), "stream theta written");
    }
    Ok(theta.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn expected(flats: usize, darks: usize) -> ExpectedFrames {
        ExpectedFrames {
            projection_location: "/exchange/data".into(),
            flat_location: "/exchange/data_white".into(),
            dark_location: "/exchange/data_dark".into(),
            flats,
            darks,
        }
    }

    fn index(frames: &[(i64, &str)]) -> FrameIndex {
        FrameIndex {
            unique_ids: frames.iter().map(|(id, _)| *id).collect(),
            locations: frames.iter().map(|(_, l)| l.to_string()).collect(),
        }
    }

    #[test]
    fn complete_scan_maps_one_to_one() {
        let theta = [0.0, 1.0, 2.0];
        let frames = index(&[
            (1, "/exchange/data_dark"),
            (2, "/exchange/data_white"),
            (3, "/exchange/data"),
            (4, "/exchange/data"),
            (5, "/exchange/data"),
        ]);
        let result = reconcile(&theta, &frames, None, &expected(1, 1));
        assert_eq!(result.theta, vec![0.0, 1.0, 2.0]);
        assert!(result.is_complete());
    }

    #[traced_test]
    #[test]
    fn dropped_frames_keep_the_later_angles_aligned() {
        let theta = [0.0, 0.5, 1.0, 1.5, 2.0];
        let frames = index(&[
            (10, "/exchange/data"),
            (11, "/exchange/data"),
            (13, "/exchange/data"),
            (14, "/exchange/data"),
        ]);
        let result = reconcile(&theta, &frames, None, &expected(0, 0));
        assert_eq!(result.theta, vec![0.0, 0.5, 1.5, 2.0]);
        assert_eq!(result.missing_indices, vec![2]);
        assert_eq!(result.missing_angles, vec![1.0]);
        assert!(logs_contain("missing projection frames"));
    }

    #[traced_test]
    #[test]
    fn reports_out_of_range_ids_and_field_shortfalls() {
        let theta = [0.0, 1.0];
        let frames = index(&[
            (7, "/exchange/data_white"),
            (8, "/exchange/data"),
            (9, "/exchange/data"),
            (12, "/exchange/data"),
        ]);
        let result = reconcile(&theta, &frames, Some(8), &expected(2, 1));
        assert_eq!(result.theta, vec![0.0, 1.0]);
        assert_eq!(result.out_of_range, vec![12]);
        assert_eq!(result.flat_shortfall, 1);
        assert_eq!(result.dark_shortfall, 1);
        assert!(!result.is_complete());
        assert!(logs_contain("flat field count mismatch"));
        assert!(logs_contain("dark field count mismatch"));
    }

    #[test]
    fn no_projections_means_every_angle_is_missing() {
        let result = reconcile(&[0.0, 1.0], &FrameIndex::default(), None, &expected(0, 0));
        assert!(result.theta.is_empty());
        assert_eq!(result.missing_indices, vec![0, 1]);
    }

    #[test]
    fn padded_location_strings_match() {
        let frames = index(&[(1, "/exchange/data\0\0\0")]);
        assert_eq!(frames.ids_at("/exchange/data"), vec![1]);
    }

    #[test]
    fn streamed_angles_follow_the_anchor() {
        let (theta, stale) = stream_theta(&[3, 5, 6, 9], 5, 10.0, 0.5);
        assert_eq!(theta, vec![10.0, 10.5, 12.0]);
        assert_eq!(stale, vec![3]);
    }

    #[cfg(not(feature = "storage_hdf5"))]
    #[test]
    fn file_access_needs_the_feature() {
        let err = add_theta(Path::new("/tmp/none.h5"), &[0.0], &expected(0, 0)).unwrap_err();
        assert!(matches!(err, ScanError::FeatureNotEnabled(_)));
    }
}
