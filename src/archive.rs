//! Reading an interleaved ASL acquisition from an NPZ archive.
//!
//! Expected entries:
//!   - `asl`: 4D array (X, Y, Z, T), label volumes at even T, control at odd T
//!   - `voxel_sizes`: optional 1D array of the three voxel spacings
//!
//! Both entries may be stored as f64, f32, i16 or u16; everything is widened
//! to f64 on load.

use std::io::{Read, Seek};

use ndarray::{Array, Array1, Array4, Dimension, OwnedRepr};
use ndarray_npy::{NpzReader, ReadNpyError, ReadNpzError, ReadableElement};

use crate::error::{TgvError, TgvResult};

pub const SERIES_KEY: &str = "asl";
pub const VOXEL_SIZES_KEY: &str = "voxel_sizes";

/// Contents of an input archive.
#[derive(Debug, Clone, PartialEq)]
pub struct AslArchive {
    pub series: Array4<f64>,
    /// `None` when the archive carries no `voxel_sizes` entry.
    pub voxel_sizes: Option<[f64; 3]>,
}

fn archive_error(key: &'static str, err: impl std::fmt::Display) -> TgvError {
    TgvError::Archive {
        key,
        reason: err.to_string(),
    }
}

/// `Ok(None)` when the entry holds some other element type.
fn read_widened<A, R, D>(npz: &mut NpzReader<R>, key: &'static str) -> TgvResult<Option<Array<f64, D>>>
where
    A: ReadableElement + Copy + Into<f64>,
    R: Read + Seek,
    D: Dimension,
{
    match npz.by_name::<OwnedRepr<A>, D>(key) {
        Ok(array) => Ok(Some(array.mapv(Into::into))),
        Err(ReadNpzError::Npy(ReadNpyError::WrongDescriptor(_))) => Ok(None),
        Err(err) => Err(archive_error(key, err)),
    }
}

fn read_as_f64<R, D>(npz: &mut NpzReader<R>, key: &'static str) -> TgvResult<Array<f64, D>>
where
    R: Read + Seek,
    D: Dimension,
{
    if let Some(array) = read_widened::<f64, _, _>(npz, key)? {
        return Ok(array);
    }
    if let Some(array) = read_widened::<f32, _, _>(npz, key)? {
        return Ok(array);
    }
    if let Some(array) = read_widened::<i16, _, _>(npz, key)? {
        return Ok(array);
    }
    if let Some(array) = read_widened::<u16, _, _>(npz, key)? {
        return Ok(array);
    }
    Err(TgvError::Archive {
        key,
        reason: "unsupported element type, expected f64, f32, i16 or u16".into(),
    })
}

/// Load the series and, if present, the voxel spacings.
pub fn read_archive<R: Read + Seek>(reader: R) -> TgvResult<AslArchive> {
    let mut npz = NpzReader::new(reader).map_err(|e| archive_error(SERIES_KEY, e))?;
    let names = npz.names().map_err(|e| archive_error(SERIES_KEY, e))?;

    if !names.iter().any(|n| n == SERIES_KEY) {
        return Err(TgvError::Archive {
            key: SERIES_KEY,
            reason: "entry is missing".into(),
        });
    }
    let series: Array4<f64> = read_as_f64(&mut npz, SERIES_KEY)?;

    let voxel_sizes = if names.iter().any(|n| n == VOXEL_SIZES_KEY) {
        let sizes: Array1<f64> = read_as_f64(&mut npz, VOXEL_SIZES_KEY)?;
        match sizes.as_slice() {
            Some(&[dx, dy, dz]) => Some([dx, dy, dz]),
            _ => {
                return Err(TgvError::Archive {
                    key: VOXEL_SIZES_KEY,
                    reason: format!("expected 3 spacings, found {}", sizes.len()),
                })
            }
        }
    } else {
        None
    };

    Ok(AslArchive { series, voxel_sizes })
}
