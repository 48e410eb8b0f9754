//! Crate-wide error taxonomy (spec.md §7). Every fileset-io operation
//! returns `Result<T, FilesetError>`; there is no silent recovery at any
//! layer.

use std::io;

use fileset_coords::CoordsError;
use fileset_params::ParamError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FilesetError {
    // -- Usage --
    #[error("invalid file handle")]
    InvalidHandle,
    #[error("operation not valid in current fileset mode")]
    InvalidFilesetMode,
    #[error("state machine violation: {0}")]
    InvalidState(&'static str),
    #[error("sfc index {sfc} out of range [0, {num_root_cells})")]
    InvalidSfc { sfc: i64, num_root_cells: i64 },
    #[error("sfc range [{a}, {b}) is invalid")]
    InvalidSfcRange { a: i64, b: i64 },
    #[error("level {level} out of range [1, {max_level}]")]
    InvalidLevel { level: i32, max_level: i32 },
    #[error("invalid oct level count {0}")]
    InvalidOctLevels(i32),
    #[error("refined oct at deepest level must have all-zero refined flags")]
    InvalidOctRefined,
    #[error("species index {species} out of range [0, {num_species})")]
    InvalidSpecies { species: i32, num_species: i32 },
    #[error("incompatible RETURN_CELLS/RETURN_OCTS and leaf/refined filter combination")]
    InvalidCellTypes,
    #[error("num_files {num_files} is invalid for {num_root_cells} root cells")]
    InvalidFileNumber { num_files: i64, num_root_cells: i64 },
    #[error("allocation strategy is not implemented")]
    InvalidAllocStrategy,
    #[error("buffer size {0} is invalid")]
    InvalidBufferSize(usize),

    // -- Resource --
    #[error("memory allocation failed")]
    MemoryAllocation,
    #[error("failed to create file {path}")]
    FileCreate { path: String, #[source] source: io::Error },
    #[error("grid shard file not found: {0}")]
    GridFileNotFound(String),
    #[error("particle shard file not found: {0}")]
    ParticleFileNotFound(String),

    // -- Schema --
    #[error("grid data not found in parameter header")]
    GridDataNotFound,
    #[error("particle data not found in parameter header")]
    ParticleDataNotFound,
    #[error("component already exists")]
    DataExists,
    #[error("parameter {0:?} not found")]
    ParamNotFound(String),

    // -- I/O --
    #[error("I/O error")]
    Io(#[source] io::Error),
}

impl From<io::Error> for FilesetError {
    fn from(e: io::Error) -> Self {
        FilesetError::Io(e)
    }
}

impl From<ParamError> for FilesetError {
    fn from(e: ParamError) -> Self {
        match e {
            ParamError::Io(e) => FilesetError::Io(e),
            ParamError::NotFound(key) => FilesetError::ParamNotFound(key),
            ParamError::BadMagic | ParamError::UnknownTypeTag(_) | ParamError::TypeMismatch { .. } => {
                FilesetError::Io(io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
            }
        }
    }
}

impl From<CoordsError> for FilesetError {
    fn from(e: CoordsError) -> Self {
        match e {
            CoordsError::InvalidSfc { sfc, num_grid } => FilesetError::InvalidSfc {
                sfc,
                num_root_cells: num_grid.pow(3),
            },
            CoordsError::BitsPerDimTooLarge(_) => FilesetError::MemoryAllocation,
        }
    }
}

pub type Result<T> = std::result::Result<T, FilesetError>;
