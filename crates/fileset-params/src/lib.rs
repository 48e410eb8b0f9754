//! The `.art` parameter header: an ordered key/value table of typed scalars
//! and arrays (int32, int64, float32, float64, string), framed as a small
//! binary header file.
//!
//! This crate is a collaborator consumed by `fileset-io` through
//! [`ParamTable`]'s get/set/iterate/copy surface; it has no knowledge of
//! grids, particles, or SFC encodings.

mod frame;

use std::collections::HashMap;
use std::io;
use std::path::Path;

use thiserror::Error;
use tracing::debug;

pub use frame::{read_table, write_table};

#[derive(Debug, Error)]
pub enum ParamError {
    #[error("parameter header I/O error")]
    Io(#[source] io::Error),
    #[error("parameter header magic/endianness tag is not recognized")]
    BadMagic,
    #[error("unknown parameter type tag {0}")]
    UnknownTypeTag(i32),
    #[error("parameter {0:?} not found")]
    NotFound(String),
    #[error("parameter {key:?} has type {actual:?}, expected {expected:?}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        actual: &'static str,
    },
}

/// A single named parameter's value. A scalar is simply a length-1 array;
/// spec.md does not distinguish the two on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    Str(Vec<String>),
}

impl ParamValue {
    fn kind_name(&self) -> &'static str {
        match self {
            ParamValue::Int32(_) => "int32",
            ParamValue::Int64(_) => "int64",
            ParamValue::Float32(_) => "float32",
            ParamValue::Float64(_) => "float64",
            ParamValue::Str(_) => "string",
        }
    }
}

/// Ordered map of parameter name to typed value. Insertion order is
/// preserved so the on-disk frame sequence is deterministic (property 7,
/// distribution determinism, depends on this for reproducible `.art` bytes).
#[derive(Debug, Clone, Default)]
pub struct ParamTable {
    order: Vec<String>,
    values: HashMap<String, ParamValue>,
}

impl ParamTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<(Self, bool), ParamError> {
        let path = path.as_ref();
        let mut file = std::fs::File::open(path).map_err(ParamError::Io)?;
        let (table, endian_swap) = frame::read_table(&mut file)?;
        debug!(path = %path.display(), endian_swap, keys = table.order.len(), "parameter header read");
        Ok((table, endian_swap))
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<(), ParamError> {
        let path = path.as_ref();
        let mut file = std::fs::File::create(path).map_err(ParamError::Io)?;
        frame::write_table(&mut file, self).map_err(ParamError::Io)?;
        debug!(path = %path.display(), keys = self.order.len(), "parameter header written");
        Ok(())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get_raw(&self, key: &str) -> Option<&ParamValue> {
        self.values.get(key)
    }

    pub fn set_raw(&mut self, key: impl Into<String>, value: ParamValue) {
        let key = key.into();
        if !self.values.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.values.insert(key, value);
    }

    /// Copy every key from `other` into `self`, overwriting on collision.
    /// Used when a writer forwards schema parameters verbatim (e.g. a
    /// `remap`-like tool re-homing a fileset; the core itself uses this
    /// only in tests to assert two tables serialize identically).
    pub fn copy_from(&mut self, other: &ParamTable) {
        for key in other.keys() {
            let value = other.get_raw(key).expect("key came from keys()").clone();
            self.set_raw(key, value);
        }
    }

    pub fn set_int32(&mut self, key: impl Into<String>, v: &[i32]) {
        self.set_raw(key, ParamValue::Int32(v.to_vec()));
    }
    pub fn set_int64(&mut self, key: impl Into<String>, v: &[i64]) {
        self.set_raw(key, ParamValue::Int64(v.to_vec()));
    }
    pub fn set_float32(&mut self, key: impl Into<String>, v: &[f32]) {
        self.set_raw(key, ParamValue::Float32(v.to_vec()));
    }
    pub fn set_float64(&mut self, key: impl Into<String>, v: &[f64]) {
        self.set_raw(key, ParamValue::Float64(v.to_vec()));
    }
    pub fn set_string(&mut self, key: impl Into<String>, v: &[String]) {
        self.set_raw(key, ParamValue::Str(v.to_vec()));
    }

    pub fn set_int32_scalar(&mut self, key: impl Into<String>, v: i32) {
        self.set_int32(key, &[v]);
    }
    pub fn set_int64_scalar(&mut self, key: impl Into<String>, v: i64) {
        self.set_int64(key, &[v]);
    }

    fn get_typed<'a, T>(
        &'a self,
        key: &str,
        expected: &'static str,
        project: impl Fn(&'a ParamValue) -> Option<&'a [T]>,
    ) -> Result<&'a [T], ParamError> {
        let value = self
            .values
            .get(key)
            .ok_or_else(|| ParamError::NotFound(key.to_string()))?;
        project(value).ok_or_else(|| ParamError::TypeMismatch {
            key: key.to_string(),
            expected,
            actual: value.kind_name(),
        })
    }

    pub fn get_int32(&self, key: &str) -> Result<&[i32], ParamError> {
        self.get_typed(key, "int32", |v| match v {
            ParamValue::Int32(v) => Some(v.as_slice()),
            _ => None,
        })
    }
    pub fn get_int64(&self, key: &str) -> Result<&[i64], ParamError> {
        self.get_typed(key, "int64", |v| match v {
            ParamValue::Int64(v) => Some(v.as_slice()),
            _ => None,
        })
    }
    pub fn get_float32(&self, key: &str) -> Result<&[f32], ParamError> {
        self.get_typed(key, "float32", |v| match v {
            ParamValue::Float32(v) => Some(v.as_slice()),
            _ => None,
        })
    }
    pub fn get_float64(&self, key: &str) -> Result<&[f64], ParamError> {
        self.get_typed(key, "float64", |v| match v {
            ParamValue::Float64(v) => Some(v.as_slice()),
            _ => None,
        })
    }
    pub fn get_string(&self, key: &str) -> Result<&[String], ParamError> {
        self.get_typed(key, "string", |v| match v {
            ParamValue::Str(v) => Some(v.as_slice()),
            _ => None,
        })
    }

    pub fn get_int32_scalar(&self, key: &str) -> Result<i32, ParamError> {
        self.get_int32(key).map(|v| v[0])
    }
    pub fn get_int64_scalar(&self, key: &str) -> Result<i64, ParamError> {
        self.get_int64(key).map(|v| v[0])
    }

    /// Same as [`Self::get_int32`] but returns `None` rather than an error
    /// when the key is absent; used for optional schema fields such as
    /// `sfc_type`, which defaults when missing (spec.md §4.5).
    pub fn get_int32_opt(&self, key: &str) -> Option<i32> {
        self.get_int32_scalar(key).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips_in_memory() {
        let mut table = ParamTable::new();
        table.set_int32_scalar("num_grid_files", 4);
        table.set_string("grid_variable_labels", &["a".into(), "b".into()]);
        assert_eq!(table.get_int32_scalar("num_grid_files").unwrap(), 4);
        assert_eq!(
            table.get_string("grid_variable_labels").unwrap(),
            &["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn missing_key_is_not_found() {
        let table = ParamTable::new();
        assert!(matches!(
            table.get_int32("missing"),
            Err(ParamError::NotFound(_))
        ));
    }

    #[test]
    fn type_mismatch_is_reported() {
        let mut table = ParamTable::new();
        table.set_int32_scalar("x", 1);
        assert!(matches!(
            table.get_float64("x"),
            Err(ParamError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn insertion_order_is_preserved() {
        let mut table = ParamTable::new();
        table.set_int32_scalar("b", 1);
        table.set_int32_scalar("a", 2);
        table.set_int32_scalar("b", 3); // overwrite, should not move position
        assert_eq!(table.keys().collect::<Vec<_>>(), vec!["b", "a"]);
    }

    #[test]
    fn file_round_trip_via_tempfile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.art");
        let mut table = ParamTable::new();
        table.set_int64("grid_file_sfc_index", &[0, 32, 64]);
        table.write(&path).unwrap();

        let (loaded, swapped) = ParamTable::open(&path).unwrap();
        assert!(!swapped);
        assert_eq!(loaded.get_int64("grid_file_sfc_index").unwrap(), &[0, 32, 64]);
    }

    #[test]
    fn copy_from_merges_keys() {
        let mut src = ParamTable::new();
        src.set_int32_scalar("num_root_cells", 8);
        let mut dst = ParamTable::new();
        dst.set_int32_scalar("num_grid_files", 1);
        dst.copy_from(&src);
        assert_eq!(dst.get_int32_scalar("num_root_cells").unwrap(), 8);
        assert_eq!(dst.get_int32_scalar("num_grid_files").unwrap(), 1);
    }
}
