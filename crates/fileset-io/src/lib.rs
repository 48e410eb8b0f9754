//! Sharded, parallel AMR fileset I/O (spec.md §1-§2).
//!
//! A fileset persists two co-located payloads over the same space-filling
//! curve (SFC) index of root cells: a grid payload ([`grid::GridStream`])
//! and a particle payload ([`particle::ParticleStream`]). Both are laid out
//! by the same [`distributor`] algorithm and fronted by a single
//! [`Fileset`] handle.

pub mod config;
pub mod context;
pub mod distributor;
pub mod error;
pub mod fileset;
pub mod grid;
pub mod handle;
pub mod particle;

pub use config::IoConfig;
pub use context::{CollectiveContext, LocalContext};
pub use error::{FilesetError, Result};
pub use fileset::{Fileset, OpenType};
pub use grid::GridStream;
pub use handle::{FileHandle, OpenMode, Whence};
pub use particle::ParticleStream;

/// Major on-disk format version this crate writes and accepts on read. A
/// file with a greater major version is rejected; a minor mismatch is only
/// logged (spec.md §9, design note (d)).
pub const ARTIO_MAJOR_VERSION: i32 = 1;
pub const ARTIO_MINOR_VERSION: i32 = 1;

/// Maximum `{prefix}` path length spec.md §6 ("Limits") allows.
pub const MAX_PREFIX_LEN: usize = 250;
