//! Space-filling-curve index <-> integer grid coordinate bijections.
//!
//! This crate is a pluggable helper: the core fileset crate consumes only
//! [`SfcCoords::sfc_to_coords`] and `bits_per_dim`. Five curve types are
//! supported: three axis-major "slab" orderings plus Morton (Z-order) and
//! Hilbert.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoordsError {
    #[error("sfc index {sfc} out of range for {num_grid}^3 root cells")]
    InvalidSfc { sfc: i64, num_grid: i64 },
    #[error("bits_per_dim {0} exceeds the maximum representable by i64 coordinates")]
    BitsPerDimTooLarge(u8),
}

/// Which curve a fileset was written with. Persisted in the parameter header
/// as a small integer tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SfcType {
    SlabX,
    SlabY,
    SlabZ,
    Morton,
    Hilbert,
}

impl SfcType {
    /// Stable on-disk tag, matching the order the original C enum used.
    pub fn tag(self) -> i32 {
        match self {
            SfcType::SlabX => 0,
            SfcType::Morton => 1,
            SfcType::Hilbert => 2,
            SfcType::SlabY => 3,
            SfcType::SlabZ => 4,
        }
    }

    pub fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            0 => Some(SfcType::SlabX),
            1 => Some(SfcType::Morton),
            2 => Some(SfcType::Hilbert),
            3 => Some(SfcType::SlabY),
            4 => Some(SfcType::SlabZ),
            _ => None,
        }
    }
}

/// A 3D integer grid coordinate, `[x, y, z]`, each in `[0, num_grid)`.
pub type Coord3 = [i64; 3];

/// Bijection between an SFC index and a grid coordinate for a fixed
/// `num_grid = 1 << bits_per_dim` cube. The core only ever walks forward
/// (`sfc_to_coords`); the inverse is not required by any core operation.
pub trait SfcCoords {
    fn bits_per_dim(&self) -> u8;

    fn num_grid(&self) -> i64 {
        1i64 << self.bits_per_dim()
    }

    fn sfc_to_coords(&self, sfc: i64) -> Result<Coord3, CoordsError>;
}

/// Concrete curve implementation selected by [`SfcType`].
#[derive(Debug, Clone, Copy)]
pub struct SfcIndexer {
    sfc_type: SfcType,
    bits_per_dim: u8,
}

impl SfcIndexer {
    pub fn new(sfc_type: SfcType, bits_per_dim: u8) -> Result<Self, CoordsError> {
        if bits_per_dim > 20 {
            // 3*20 = 60 bits of interleaved index, safely within i64.
            return Err(CoordsError::BitsPerDimTooLarge(bits_per_dim));
        }
        Ok(Self {
            sfc_type,
            bits_per_dim,
        })
    }

    fn check_range(&self, sfc: i64) -> Result<(), CoordsError> {
        let num_root_cells = self.num_grid().pow(3);
        if sfc < 0 || sfc >= num_root_cells {
            return Err(CoordsError::InvalidSfc {
                sfc,
                num_grid: self.num_grid(),
            });
        }
        Ok(())
    }

    fn slab(&self, sfc: i64, axis_order: [usize; 3]) -> Coord3 {
        let n = self.num_grid();
        let mut rem = sfc;
        let mut coord = [0i64; 3];
        for &axis in axis_order.iter().rev() {
            coord[axis] = rem % n;
            rem /= n;
        }
        coord
    }

    fn morton(&self, sfc: i64) -> Coord3 {
        let mut x = 0i64;
        let mut y = 0i64;
        let mut z = 0i64;
        for bit in 0..self.bits_per_dim {
            let triple = (sfc >> (3 * bit)) & 0b111;
            x |= ((triple & 0b001) >> 0) << bit;
            y |= ((triple & 0b010) >> 1) << bit;
            z |= ((triple & 0b100) >> 2) << bit;
        }
        [x, y, z]
    }

    /// Standard 3D Hilbert curve index -> coordinate, using the
    /// bit-by-bit rotation/reflection method (state machine over 2-bit
    /// quadrant transitions per axis, generalized to 3 bits per level).
    fn hilbert(&self, sfc: i64) -> Coord3 {
        let bits = self.bits_per_dim;
        let mut x = 0i64;
        let mut y = 0i64;
        let mut z = 0i64;
        let mut rx;
        let mut ry;
        let mut rz;
        let mut t = sfc;

        for s in 0..bits {
            let side = 1i64 << s;
            rx = 1 & (t / 4);
            ry = 1 & (t / 2);
            rz = 1 & t;
            t /= 8;

            // Rotate/reflect the quadrant so the curve stays continuous,
            // mirroring the classic 2D Hilbert `rot` step extended to 3D.
            if ry == 0 {
                if rz == 1 {
                    let old_x = x;
                    x = side - 1 - old_x;
                    let old_y = y;
                    y = side - 1 - old_y;
                }
                if rx == 1 {
                    std::mem::swap(&mut x, &mut z);
                } else {
                    std::mem::swap(&mut y, &mut z);
                }
            }

            x += side * rx;
            y += side * ry;
            z += side * rz;
        }
        [x, y, z]
    }
}

impl SfcCoords for SfcIndexer {
    fn bits_per_dim(&self) -> u8 {
        self.bits_per_dim
    }

    fn sfc_to_coords(&self, sfc: i64) -> Result<Coord3, CoordsError> {
        self.check_range(sfc)?;
        Ok(match self.sfc_type {
            SfcType::SlabX => self.slab(sfc, [0, 1, 2]),
            SfcType::SlabY => self.slab(sfc, [1, 0, 2]),
            SfcType::SlabZ => self.slab(sfc, [2, 0, 1]),
            SfcType::Morton => self.morton(sfc),
            SfcType::Hilbert => self.hilbert(sfc),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slab_x_is_row_major_with_x_slowest() {
        let idx = SfcIndexer::new(SfcType::SlabX, 2).unwrap(); // num_grid = 4
        assert_eq!(idx.sfc_to_coords(0).unwrap(), [0, 0, 0]);
        assert_eq!(idx.sfc_to_coords(1).unwrap(), [0, 0, 1]);
        assert_eq!(idx.sfc_to_coords(4).unwrap(), [0, 1, 0]);
        assert_eq!(idx.sfc_to_coords(16).unwrap(), [1, 0, 0]);
    }

    #[test]
    fn morton_interleaves_bits() {
        let idx = SfcIndexer::new(SfcType::Morton, 2).unwrap();
        // sfc = 0b101 -> triple bits for level 0: x=1,y=0,z=1
        assert_eq!(idx.sfc_to_coords(0b101).unwrap(), [1, 0, 1]);
    }

    #[test]
    fn hilbert_covers_every_cell_exactly_once() {
        let bits = 2;
        let idx = SfcIndexer::new(SfcType::Hilbert, bits).unwrap();
        let n = idx.num_grid();
        let mut seen = std::collections::HashSet::new();
        for sfc in 0..n * n * n {
            let c = idx.sfc_to_coords(sfc).unwrap();
            assert!(c[0] < n && c[1] < n && c[2] < n);
            assert!(seen.insert(c), "duplicate coord for sfc {sfc}: {c:?}");
        }
        assert_eq!(seen.len() as i64, n * n * n);
    }

    #[test]
    fn out_of_range_sfc_is_rejected() {
        let idx = SfcIndexer::new(SfcType::Morton, 1).unwrap();
        assert!(matches!(
            idx.sfc_to_coords(-1),
            Err(CoordsError::InvalidSfc { .. })
        ));
        assert!(matches!(
            idx.sfc_to_coords(8),
            Err(CoordsError::InvalidSfc { .. })
        ));
    }

    #[test]
    fn sfc_type_tag_round_trips() {
        for t in [
            SfcType::SlabX,
            SfcType::SlabY,
            SfcType::SlabZ,
            SfcType::Morton,
            SfcType::Hilbert,
        ] {
            assert_eq!(SfcType::from_tag(t.tag()), Some(t));
        }
    }
}
