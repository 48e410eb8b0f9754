//! Grid payload write/read state machine plus offset-table cache
//! (spec.md §4.3).
//!
//! Record layout per root-cell SFC: `num_vars` floats, an `i32 num_levels`,
//! then (if `num_levels > 0`) an `i32[num_levels]` `octs_per_level` array,
//! then level by level a run of octs (`8*num_vars` floats + 8 `i32` refined
//! flags each).

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, instrument};

use crate::context::CollectiveContext;
use crate::distributor::{self, AllocStrategy};
use crate::error::{FilesetError, Result};
use crate::handle::{FileHandle, OpenMode, Whence};

/// `oct_pos_offsets[8][3]`: fixed corner-sign table, cell-center convention
/// (original_source/artio_grid.c). Order is load-bearing — it is the order
/// refined children are assigned positions in.
const OCT_POS_OFFSETS: [[f64; 3]; 8] = [
    [-0.5, -0.5, -0.5],
    [0.5, -0.5, -0.5],
    [-0.5, 0.5, -0.5],
    [0.5, 0.5, -0.5],
    [-0.5, -0.5, 0.5],
    [0.5, -0.5, 0.5],
    [-0.5, 0.5, 0.5],
    [0.5, 0.5, 0.5],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Write,
    Read,
}

#[derive(Debug, Clone, Default)]
enum WriteState {
    #[default]
    Idle,
    Root {
        num_levels: i32,
        cur_level: i32,
        octs_per_level: Vec<i32>,
    },
    Level {
        num_levels: i32,
        cur_level: i32,
        octs_per_level: Vec<i32>,
        octs_written: i32,
    },
}

#[derive(Debug, Clone, Default)]
enum ReadState {
    #[default]
    Idle,
    Root {
        num_levels: i32,
        cur_level: i32,
        octs_per_level: Vec<i32>,
    },
    Level {
        num_levels: i32,
        cur_level: i32,
        octs_per_level: Vec<i32>,
        cur_oct: i32,
    },
}

/// Position-tracking scratch: two levels' worth of child-cell centers,
/// swapped on `read_level_begin` (spec.md §4.3, "Position tracking
/// maintains two buffers").
struct PosTracker {
    cell_size_level: f64,
    cur_level_pos: Vec<[f64; 3]>,
    next_level_pos: Vec<[f64; 3]>,
    next_level_oct: usize,
}

/// Root header returned by `read_root_begin`.
#[derive(Debug, Clone)]
pub struct RootHeader {
    pub num_levels: i32,
    pub octs_per_level: Vec<i32>,
}

/// One oct's decoded fields, each populated only if requested.
#[derive(Debug, Clone, Default)]
pub struct OctRecord {
    pub position: Option<[f64; 3]>,
    pub vars: Option<Vec<f32>>,
    pub refined: Option<[i32; 8]>,
}

pub struct GridStream {
    num_files: i64,
    pub num_vars: i32,
    pub variable_labels: Vec<String>,
    pub max_level: i32,
    file_sfc_index: Vec<i64>,
    handles: Vec<FileHandle>,
    mode: Mode,
    buffer_size: usize,
    cur_file: Option<usize>,

    // Accumulation, pre-commit (write mode only).
    pending: Vec<(i64, i64, i32)>,
    num_local_root_cells: i64,
    committed: bool,

    // Post-commit write state.
    sfc_list: Vec<i64>,
    offsets: Vec<i64>,
    next_index: usize,
    write_state: WriteState,

    // Read state.
    cache_begin: i64,
    cache_end: i64,
    cache: Vec<i64>,
    read_state: ReadState,
    pos: Option<PosTracker>,
}

impl GridStream {
    /// `add_grid`: declares the schema for a to-be-written grid component.
    pub fn new_for_write(
        num_files: i64,
        num_vars: i32,
        variable_labels: Vec<String>,
        num_local_root_cells: i64,
        buffer_size: usize,
    ) -> Self {
        GridStream {
            num_files,
            num_vars,
            variable_labels,
            max_level: 0,
            file_sfc_index: Vec::new(),
            handles: Vec::new(),
            mode: Mode::Write,
            buffer_size,
            cur_file: None,
            pending: Vec::new(),
            num_local_root_cells,
            committed: false,
            sfc_list: Vec::new(),
            offsets: Vec::new(),
            next_index: 0,
            write_state: WriteState::Idle,
            cache_begin: 0,
            cache_end: 0,
            cache: Vec::new(),
            read_state: ReadState::Idle,
            pos: None,
        }
    }

    /// `add_sfc`: records a local SFC's declared shape ahead of commit.
    pub fn add_sfc(&mut self, sfc: i64, num_levels: i32, num_octs_total: i64) -> Result<()> {
        if self.committed {
            return Err(FilesetError::InvalidState("add_sfc after commit"));
        }
        if self.pending.len() as i64 >= self.num_local_root_cells {
            return Err(FilesetError::InvalidState(
                "add_sfc exceeds num_local_root_cells",
            ));
        }
        if num_levels < 0 {
            return Err(FilesetError::InvalidOctLevels(num_levels));
        }
        let size = self.num_vars as i64 * 4
            + (1 + num_levels as i64) * 4
            + 8 * num_octs_total * (self.num_vars as i64 * 4 + 4);
        self.pending.push((sfc, size, num_levels));
        self.max_level = self.max_level.max(num_levels);
        Ok(())
    }

    /// `commit`: runs the distributor with suffix `'g'` and switches to
    /// write-records mode.
    #[instrument(skip(self, ctx, dir), fields(num_files = self.num_files))]
    pub fn commit<C: CollectiveContext>(
        &mut self,
        ctx: &C,
        num_root_cells: i64,
        dir: &Path,
        file_prefix: &str,
    ) -> Result<()> {
        if self.committed {
            return Err(FilesetError::DataExists);
        }
        self.max_level = ctx.all_reduce_max_i32(self.max_level);

        let sfc_list: Vec<i64> = self.pending.iter().map(|(sfc, _, _)| *sfc).collect();
        let mut sfc_size: Vec<i64> = self.pending.iter().map(|(_, size, _)| *size).collect();

        let result = distributor::distribute(
            ctx,
            num_root_cells,
            &sfc_list,
            &mut sfc_size,
            self.num_files,
            AllocStrategy::EqualSfc,
            dir,
            file_prefix,
            'g',
        )?;

        self.file_sfc_index = result.file_sfc_index;
        self.handles = result.handles;
        self.sfc_list = sfc_list;
        self.offsets = sfc_size;
        self.committed = true;
        debug!(num_sfc = self.sfc_list.len(), "grid stream committed");
        Ok(())
    }

    pub fn file_sfc_index(&self) -> &[i64] {
        &self.file_sfc_index
    }

    fn select_file(&mut self, sfc: i64) -> Result<usize> {
        let f = distributor::find_file(&self.file_sfc_index, sfc)
            .ok_or(FilesetError::InvalidSfc {
                sfc,
                num_root_cells: *self.file_sfc_index.last().unwrap_or(&0),
            })?;
        if self.cur_file != Some(f) {
            if let Some(prev) = self.cur_file {
                self.handles[prev].detach_buffer()?;
            }
            self.handles[f].attach_buffer(self.buffer_size).ok();
            self.cur_file = Some(f);
        }
        Ok(f)
    }

    // ---- Write state machine ----

    pub fn write_root_begin(
        &mut self,
        sfc: i64,
        vars: &[f32],
        num_levels: i32,
        octs_per_level: &[i32],
    ) -> Result<()> {
        if self.mode != Mode::Write {
            return Err(FilesetError::InvalidFilesetMode);
        }
        if !matches!(self.write_state, WriteState::Idle) {
            return Err(FilesetError::InvalidState("write_root_begin outside Idle"));
        }
        if self.next_index >= self.sfc_list.len() || self.sfc_list[self.next_index] != sfc {
            return Err(FilesetError::InvalidState(
                "write_root_begin sfc out of declaration order",
            ));
        }
        if vars.len() != self.num_vars as usize {
            return Err(FilesetError::InvalidState("vars length must equal num_vars"));
        }
        if num_levels < 0 || num_levels > self.max_level || octs_per_level.len() != num_levels as usize {
            return Err(FilesetError::InvalidOctLevels(num_levels));
        }

        let offset = self.offsets[self.next_index];
        let file = self.select_file(sfc)?;
        self.handles[file].seek(offset, Whence::Set)?;
        self.handles[file].write_f32(vars)?;
        self.handles[file].write_i32(&[num_levels])?;
        if num_levels > 0 {
            self.handles[file].write_i32(octs_per_level)?;
        }

        self.write_state = WriteState::Root {
            num_levels,
            cur_level: 0,
            octs_per_level: octs_per_level.to_vec(),
        };
        Ok(())
    }

    pub fn write_level_begin(&mut self, level: i32) -> Result<()> {
        let WriteState::Root {
            num_levels,
            cur_level,
            octs_per_level,
        } = &self.write_state
        else {
            return Err(FilesetError::InvalidState("write_level_begin outside Root"));
        };
        if level != *cur_level + 1 || level < 1 || level > *num_levels {
            return Err(FilesetError::InvalidLevel {
                level,
                max_level: *num_levels,
            });
        }
        self.write_state = WriteState::Level {
            num_levels: *num_levels,
            cur_level: level,
            octs_per_level: octs_per_level.clone(),
            octs_written: 0,
        };
        Ok(())
    }

    pub fn write_oct(&mut self, vars: &[f32], refined: &[i32; 8]) -> Result<()> {
        let WriteState::Level {
            num_levels,
            cur_level,
            octs_per_level,
            octs_written,
        } = &mut self.write_state
        else {
            return Err(FilesetError::InvalidState("write_oct outside Level"));
        };
        if vars.len() != 8 * self.num_vars as usize {
            return Err(FilesetError::InvalidState("oct vars length mismatch"));
        }
        if *octs_written >= octs_per_level[*cur_level as usize - 1] {
            return Err(FilesetError::InvalidState(
                "write_oct called more times than declared for this level",
            ));
        }
        if *cur_level == *num_levels && refined.iter().any(|&r| r != 0) {
            return Err(FilesetError::InvalidOctRefined);
        }

        let file = self.cur_file.expect("a file is attached once in Root state");
        self.handles[file].write_f32(vars)?;
        self.handles[file].write_i32(refined)?;
        *octs_written += 1;
        Ok(())
    }

    pub fn write_level_end(&mut self) -> Result<()> {
        let WriteState::Level {
            num_levels,
            cur_level,
            octs_per_level,
            octs_written,
        } = &self.write_state
        else {
            return Err(FilesetError::InvalidState("write_level_end outside Level"));
        };
        if *octs_written != octs_per_level[*cur_level as usize - 1] {
            return Err(FilesetError::InvalidState(
                "write_level_end before all declared octs were written",
            ));
        }
        self.write_state = WriteState::Root {
            num_levels: *num_levels,
            cur_level: *cur_level,
            octs_per_level: octs_per_level.clone(),
        };
        Ok(())
    }

    pub fn write_root_end(&mut self) -> Result<()> {
        let WriteState::Root {
            num_levels,
            cur_level,
            ..
        } = &self.write_state
        else {
            return Err(FilesetError::InvalidState("write_root_end outside Root"));
        };
        if *cur_level != *num_levels {
            return Err(FilesetError::InvalidState(
                "write_root_end before all declared levels were written",
            ));
        }
        self.write_state = WriteState::Idle;
        self.next_index += 1;
        Ok(())
    }

    // ---- Read path ----

    #[allow(clippy::too_many_arguments)]
    pub fn open_read(
        file_sfc_index: Vec<i64>,
        num_vars: i32,
        variable_labels: Vec<String>,
        max_level: i32,
        handles: Vec<FileHandle>,
        buffer_size: usize,
    ) -> Self {
        GridStream {
            num_files: file_sfc_index.len() as i64 - 1,
            num_vars,
            variable_labels,
            max_level,
            file_sfc_index,
            handles,
            mode: Mode::Read,
            buffer_size,
            cur_file: None,
            pending: Vec::new(),
            num_local_root_cells: 0,
            committed: true,
            sfc_list: Vec::new(),
            offsets: Vec::new(),
            next_index: 0,
            write_state: WriteState::Idle,
            cache_begin: 0,
            cache_end: 0,
            cache: Vec::new(),
            read_state: ReadState::Idle,
            pos: None,
        }
    }

    /// `cache_sfc_range(a, b)`: loads the `[a, b]`-inclusive offset table,
    /// a shard at a time, into a rank-local `int64[b-a+1]` cache.
    pub fn cache_sfc_range(&mut self, a: i64, b: i64) -> Result<()> {
        if a < 0 || b < a || b >= *self.file_sfc_index.last().unwrap_or(&0) {
            return Err(FilesetError::InvalidSfcRange { a, b });
        }
        self.clear_sfc_cache();
        let mut cache = Vec::with_capacity((b - a + 1) as usize);
        let mut sfc = a;
        while sfc <= b {
            let f = distributor::find_file(&self.file_sfc_index, sfc).ok_or(
                FilesetError::InvalidSfc {
                    sfc,
                    num_root_cells: *self.file_sfc_index.last().unwrap(),
                },
            )?;
            let file_start = self.file_sfc_index[f];
            let file_end = self.file_sfc_index[f + 1];
            let chunk_end = (file_end - 1).min(b);
            if self.cur_file != Some(f) {
                if let Some(prev) = self.cur_file {
                    self.handles[prev].detach_buffer()?;
                }
                self.handles[f].attach_buffer(self.buffer_size).ok();
                self.cur_file = Some(f);
            }
            self.handles[f].seek((sfc - file_start) * 8, Whence::Set)?;
            let count = (chunk_end - sfc + 1) as usize;
            let slice = self.handles[f].read_i64(count)?;
            cache.extend(slice);
            sfc = chunk_end + 1;
        }
        self.cache_begin = a;
        self.cache_end = b;
        self.cache = cache;
        Ok(())
    }

    pub fn clear_sfc_cache(&mut self) {
        self.cache.clear();
        self.cache_begin = 0;
        self.cache_end = 0;
    }

    fn cached_offset(&self, sfc: i64) -> Result<i64> {
        if sfc < self.cache_begin || sfc > self.cache_end || self.cache.is_empty() {
            return Err(FilesetError::InvalidState(
                "sfc is not covered by the current offset cache",
            ));
        }
        Ok(self.cache[(sfc - self.cache_begin) as usize])
    }

    pub fn seek_to_sfc(&mut self, sfc: i64) -> Result<()> {
        let offset = self.cached_offset(sfc)?;
        let file = self.select_file(sfc)?;
        self.handles[file].seek(offset, Whence::Set)?;
        Ok(())
    }

    /// `read_root_begin`. `want_vars` is `None` to seek past the float
    /// block instead of reading it; `track_pos` requests position
    /// regeneration for descendant octs (requires `center` the SFC's
    /// root-cell cell-center coordinate in `[0, num_grid)^3` units).
    pub fn read_root_begin(
        &mut self,
        sfc: i64,
        mut vars: Option<&mut [f32]>,
        track_pos: Option<[f64; 3]>,
    ) -> Result<RootHeader> {
        if self.mode != Mode::Read {
            return Err(FilesetError::InvalidFilesetMode);
        }
        if !matches!(self.read_state, ReadState::Idle) {
            return Err(FilesetError::InvalidState("read_root_begin outside Idle"));
        }
        self.seek_to_sfc(sfc)?;
        let file = self.cur_file.expect("select_file always attaches a file");

        if let Some(out) = vars.as_deref_mut() {
            if out.len() != self.num_vars as usize {
                return Err(FilesetError::InvalidState("vars length must equal num_vars"));
            }
            let read = self.handles[file].read_f32(self.num_vars as usize)?;
            out.copy_from_slice(&read);
        } else {
            self.handles[file].seek(self.num_vars as i64 * 4, Whence::Cur)?;
        }

        let num_levels = self.handles[file].read_i32(1)?[0];
        if num_levels < 0 || num_levels > self.max_level {
            return Err(FilesetError::InvalidOctLevels(num_levels));
        }
        let octs_per_level = if num_levels > 0 {
            self.handles[file].read_i32(num_levels as usize)?
        } else {
            Vec::new()
        };

        self.pos = track_pos.map(|center| PosTracker {
            cell_size_level: 1.0,
            cur_level_pos: Vec::new(),
            next_level_pos: vec![[center[0] + 0.5, center[1] + 0.5, center[2] + 0.5]],
            next_level_oct: 0,
        });

        self.read_state = ReadState::Root {
            num_levels,
            cur_level: 0,
            octs_per_level: octs_per_level.clone(),
        };
        Ok(RootHeader {
            num_levels,
            octs_per_level,
        })
    }

    pub fn read_level_begin(&mut self, level: i32) -> Result<()> {
        let ReadState::Root {
            num_levels,
            cur_level,
            octs_per_level,
        } = &self.read_state
        else {
            return Err(FilesetError::InvalidState("read_level_begin outside Root"));
        };
        if level != *cur_level + 1 || level < 1 || level > *num_levels {
            return Err(FilesetError::InvalidLevel {
                level,
                max_level: *num_levels,
            });
        }

        if let Some(pos) = self.pos.as_mut() {
            let next_size = octs_per_level[level as usize - 1] as usize;
            let cur_level_pos = std::mem::replace(&mut pos.next_level_pos, Vec::with_capacity(next_size));
            pos.cur_level_pos = cur_level_pos;
            pos.next_level_oct = 0;
            pos.cell_size_level = 0.5f64.powi(level);
        }

        self.read_state = ReadState::Level {
            num_levels: *num_levels,
            cur_level: level,
            octs_per_level: octs_per_level.clone(),
            cur_oct: 0,
        };
        Ok(())
    }

    pub fn read_oct(&mut self, want_vars: bool, want_refined: bool) -> Result<OctRecord> {
        let ReadState::Level {
            num_levels,
            cur_level,
            octs_per_level,
            cur_oct,
        } = &mut self.read_state
        else {
            return Err(FilesetError::InvalidState("read_oct outside Level"));
        };
        // Design note (c): the C source allows one extra read per level;
        // reject it here instead.
        if *cur_oct >= octs_per_level[*cur_level as usize - 1] {
            return Err(FilesetError::InvalidState(
                "read_oct called more times than this level declared",
            ));
        }

        let want_pos = self.pos.is_some();
        let file = self.cur_file.expect("a file is attached for the lifetime of a read");
        let num_vars = self.num_vars as usize;

        let vars = if want_vars {
            Some(self.handles[file].read_f32(8 * num_vars)?)
        } else {
            self.handles[file].seek(8 * num_vars as i64 * 4, Whence::Cur)?;
            None
        };

        let local_refined: [i32; 8] = if want_pos || want_refined {
            let v = self.handles[file].read_i32(8)?;
            v.try_into().unwrap()
        } else {
            self.handles[file].seek(8 * 4, Whence::Cur)?;
            [0; 8]
        };

        let position = if let Some(pos) = self.pos.as_mut() {
            let center = pos.cur_level_pos[*cur_oct as usize];
            for (i, &refined) in local_refined.iter().enumerate() {
                if refined != 0 {
                    let child = [
                        center[0] + pos.cell_size_level * OCT_POS_OFFSETS[i][0],
                        center[1] + pos.cell_size_level * OCT_POS_OFFSETS[i][1],
                        center[2] + pos.cell_size_level * OCT_POS_OFFSETS[i][2],
                    ];
                    pos.next_level_pos.push(child);
                    pos.next_level_oct += 1;
                }
            }
            Some(center)
        } else {
            None
        };

        *cur_oct += 1;
        Ok(OctRecord {
            position,
            vars,
            refined: if want_refined { Some(local_refined) } else { None },
        })
    }

    pub fn read_level_end(&mut self) -> Result<()> {
        let ReadState::Level {
            num_levels,
            cur_level,
            octs_per_level,
            cur_oct,
        } = &self.read_state
        else {
            return Err(FilesetError::InvalidState("read_level_end outside Level"));
        };
        if *cur_oct != octs_per_level[*cur_level as usize - 1] {
            return Err(FilesetError::InvalidState(
                "read_level_end before every declared oct was read",
            ));
        }
        self.read_state = ReadState::Root {
            num_levels: *num_levels,
            cur_level: *cur_level,
            octs_per_level: octs_per_level.clone(),
        };
        Ok(())
    }

    pub fn read_root_end(&mut self) -> Result<()> {
        let ReadState::Root {
            num_levels,
            cur_level,
            ..
        } = &self.read_state
        else {
            return Err(FilesetError::InvalidState("read_root_end outside Root"));
        };
        if *cur_level != *num_levels {
            return Err(FilesetError::InvalidState(
                "read_root_end before every declared level was read",
            ));
        }
        self.read_state = ReadState::Idle;
        self.pos = None;
        Ok(())
    }

    /// `octs_in_sfc_range`: recovers the total oct count per SFC from
    /// offset-table differences alone when `8*num_vars > max_level`
    /// (spec.md §4.3, "Oct-count inference"), falling back to reading each
    /// root header otherwise.
    pub fn octs_in_sfc_range(&mut self, a: i64, b: i64) -> Result<Vec<i64>> {
        if 8 * self.num_vars as i64 > self.max_level as i64 {
            let mut out = Vec::with_capacity((b - a + 1) as usize);
            for sfc in a..=b {
                let cur = self.cached_offset(sfc)?;
                let next = if sfc == b {
                    self.end_offset_of_shard(sfc)?
                } else {
                    self.cached_offset(sfc + 1)?
                };
                let record_bytes = next - cur;
                let num = (record_bytes - self.num_vars as i64 * 4 - 4)
                    / (8 * (self.num_vars as i64 * 4 + 4));
                out.push(num);
            }
            Ok(out)
        } else {
            let mut out = Vec::with_capacity((b - a + 1) as usize);
            for sfc in a..=b {
                let header = self.peek_root_header(sfc)?;
                out.push(header.octs_per_level.iter().map(|&x| x as i64).sum());
            }
            Ok(out)
        }
    }

    /// Reads just a root record's `(num_levels, octs_per_level)` header
    /// without entering the read state machine, for
    /// [`Self::octs_in_sfc_range`]'s header-reading fallback.
    fn peek_root_header(&mut self, sfc: i64) -> Result<RootHeader> {
        self.seek_to_sfc(sfc)?;
        let file = self.cur_file.expect("select_file always attaches a file");
        self.handles[file].seek(self.num_vars as i64 * 4, Whence::Cur)?;
        let num_levels = self.handles[file].read_i32(1)?[0];
        let octs_per_level = if num_levels > 0 {
            self.handles[file].read_i32(num_levels as usize)?
        } else {
            Vec::new()
        };
        Ok(RootHeader {
            num_levels,
            octs_per_level,
        })
    }

    /// End-of-shard byte length for the shard containing `sfc`, via
    /// `seek(0, END); tell`.
    fn end_offset_of_shard(&mut self, sfc: i64) -> Result<i64> {
        let file = self.select_file(sfc)?;
        self.handles[file].seek(0, Whence::End)?;
        let len = self.handles[file].tell()? as i64;
        Ok(len)
    }
}

/// Traversal options for [`GridStream::read_sfc_range_levels`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnKind {
    Cells,
    Octs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFilter {
    Leafs,
    Refined,
    All,
}

/// One visited cell or oct, handed to the `read_sfc_range_levels` callback.
#[derive(Debug, Clone)]
pub struct VisitedCell {
    pub sfc: i64,
    pub level: i32,
    pub position: Option<[f64; 3]>,
    pub vars: Option<Vec<f32>>,
    pub refined: Option<[i32; 8]>,
}

impl GridStream {
    /// `read_sfc_range_levels`: bulk traversal of `[a, b]` across levels
    /// `[l_lo, l_hi]`, invoking `visit` per cell or oct per `kind`/`filter`.
    /// Requires a cache already covering `[a, b]`. `sfc_to_coords` supplies
    /// each root SFC's grid coordinate when `want_pos` is set — the core
    /// only ever calls the forward direction (spec.md, "SUPPLEMENTED
    /// FEATURES").
    #[allow(clippy::too_many_arguments)]
    pub fn read_sfc_range_levels(
        &mut self,
        a: i64,
        b: i64,
        l_lo: i32,
        l_hi: i32,
        kind: ReturnKind,
        filter: ReadFilter,
        want_vars: bool,
        want_pos: bool,
        sfc_to_coords: impl Fn(i64) -> Result<[f64; 3]>,
        mut visit: impl FnMut(&VisitedCell) -> Result<()>,
    ) -> Result<()> {
        if kind == ReturnKind::Octs && filter != ReadFilter::All {
            return Err(FilesetError::InvalidCellTypes);
        }
        if kind == ReturnKind::Cells && filter == ReadFilter::All {
            return Err(FilesetError::InvalidCellTypes);
        }

        for sfc in a..=b {
            let center = if want_pos { Some(sfc_to_coords(sfc)?) } else { None };
            let mut root_vars = vec![0f32; self.num_vars as usize];
            let header = self.read_root_begin(
                sfc,
                if want_vars { Some(&mut root_vars) } else { None },
                center,
            )?;

            for level in 1..=header.num_levels {
                self.read_level_begin(level)?;
                let in_range = level >= l_lo && level <= l_hi;
                let n = header.octs_per_level[level as usize - 1];
                for _ in 0..n {
                    let oct = self.read_oct(want_vars && in_range, true)?;
                    if in_range {
                        let refined_flags = oct.refined.unwrap_or([0; 8]);
                        match kind {
                            ReturnKind::Octs => {
                                visit(&VisitedCell {
                                    sfc,
                                    level,
                                    position: oct.position,
                                    vars: oct.vars,
                                    refined: oct.refined,
                                })?;
                            }
                            ReturnKind::Cells => {
                                for (i, &r) in refined_flags.iter().enumerate() {
                                    let is_refined = r != 0;
                                    let keep = match filter {
                                        ReadFilter::Leafs => !is_refined,
                                        ReadFilter::Refined => is_refined,
                                        ReadFilter::All => true,
                                    };
                                    if keep {
                                        let cs = 0.5f64.powi(level as i32);
                                        visit(&VisitedCell {
                                            sfc,
                                            level,
                                            position: oct.position.map(|c| {
                                                [
                                                    c[0] + cs * OCT_POS_OFFSETS[i][0],
                                                    c[1] + cs * OCT_POS_OFFSETS[i][1],
                                                    c[2] + cs * OCT_POS_OFFSETS[i][2],
                                                ]
                                            }),
                                            vars: None,
                                            refined: None,
                                        })?;
                                    }
                                }
                            }
                        }
                    }
                }
                self.read_level_end()?;
            }
            self.read_root_end()?;
        }
        Ok(())
    }
}
