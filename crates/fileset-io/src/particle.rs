//! Particle payload write/read state machine plus offset-table cache
//! (spec.md §4.4). Mirrors [`crate::grid::GridStream`] with species
//! replacing levels.
//!
//! Record layout per root-cell SFC: `i32[num_species]` counts, then for
//! each species in order a run of `count` particle records (`i64 pid`,
//! `i32 subspecies`, `f64[num_primary]`, `f32[num_secondary]`).

use std::path::Path;

use tracing::{debug, instrument};

use crate::context::CollectiveContext;
use crate::distributor::{self, AllocStrategy};
use crate::error::{FilesetError, Result};
use crate::handle::{FileHandle, Whence};

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
        counts: Vec<i32>,
    },
    Species {
        counts: Vec<i32>,
        species: i32,
        written: i32,
    },
}

#[derive(Debug, Clone, Default)]
enum ReadState {
    #[default]
    Idle,
    Root {
        record_start: i64,
        counts: Vec<i32>,
    },
    Species {
        record_start: i64,
        counts: Vec<i32>,
        species: i32,
        read: i32,
    },
}

/// Species schema, fixed at `add_particles` time.
#[derive(Debug, Clone)]
pub struct SpeciesSchema {
    pub label: String,
    pub num_primary_variables: i32,
    pub num_secondary_variables: i32,
    pub primary_variable_labels: Vec<String>,
    pub secondary_variable_labels: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ParticleRecord {
    pub pid: i64,
    pub subspecies: i32,
    pub primary: Vec<f64>,
    pub secondary: Vec<f32>,
}

pub struct ParticleStream {
    num_files: i64,
    pub species: Vec<SpeciesSchema>,
    pub num_particles_per_species: Vec<i64>,
    file_sfc_index: Vec<i64>,
    handles: Vec<FileHandle>,
    mode: Mode,
    buffer_size: usize,
    cur_file: Option<usize>,

    pending: Vec<(i64, i64)>,
    num_local_root_cells: i64,
    committed: bool,
    local_counts_sum: Vec<i64>,

    sfc_list: Vec<i64>,
    offsets: Vec<i64>,
    next_index: usize,
    write_state: WriteState,

    cache_begin: i64,
    cache_end: i64,
    cache: Vec<i64>,
    read_state: ReadState,
}

fn record_size(species: &[SpeciesSchema], counts: &[i32]) -> i64 {
    4 * species.len() as i64
        + counts
            .iter()
            .zip(species.iter())
            .map(|(&count, s)| {
                count as i64
                    * (8 + 4 + 8 * s.num_primary_variables as i64 + 4 * s.num_secondary_variables as i64)
            })
            .sum::<i64>()
}

impl ParticleStream {
    pub fn new_for_write(
        num_files: i64,
        species: Vec<SpeciesSchema>,
        num_local_root_cells: i64,
        buffer_size: usize,
    ) -> Self {
        let num_species = species.len();
        ParticleStream {
            num_files,
            species,
            num_particles_per_species: vec![0; num_species],
            file_sfc_index: Vec::new(),
            handles: Vec::new(),
            mode: Mode::Write,
            buffer_size,
            cur_file: None,
            pending: Vec::new(),
            num_local_root_cells,
            committed: false,
            local_counts_sum: vec![0; num_species],
            sfc_list: Vec::new(),
            offsets: Vec::new(),
            next_index: 0,
            write_state: WriteState::Idle,
            cache_begin: 0,
            cache_end: 0,
            cache: Vec::new(),
            read_state: ReadState::Idle,
        }
    }

    pub fn num_species(&self) -> usize {
        self.species.len()
    }

    /// `add_sfc`: records a local SFC's per-species counts ahead of commit.
    pub fn add_sfc(&mut self, sfc: i64, counts: &[i32]) -> Result<()> {
        if self.committed {
            return Err(FilesetError::InvalidState("add_sfc after commit"));
        }
        if self.pending.len() as i64 >= self.num_local_root_cells {
            return Err(FilesetError::InvalidState(
                "add_sfc exceeds num_local_root_cells",
            ));
        }
        if counts.len() != self.species.len() {
            return Err(FilesetError::InvalidSpecies {
                species: counts.len() as i32,
                num_species: self.species.len() as i32,
            });
        }
        let size = record_size(&self.species, counts);
        self.pending.push((sfc, size));
        for (sum, &c) in self.local_counts_sum.iter_mut().zip(counts.iter()) {
            *sum += c as i64;
        }
        Ok(())
    }

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
        for (i, sum) in self.local_counts_sum.iter().enumerate() {
            self.num_particles_per_species[i] = ctx.all_reduce_sum_i64(*sum);
        }

        let sfc_list: Vec<i64> = self.pending.iter().map(|(sfc, _)| *sfc).collect();
        let mut sfc_size: Vec<i64> = self.pending.iter().map(|(_, size)| *size).collect();

        let result = distributor::distribute(
            ctx,
            num_root_cells,
            &sfc_list,
            &mut sfc_size,
            self.num_files,
            AllocStrategy::EqualSfc,
            dir,
            file_prefix,
            'p',
        )?;

        self.file_sfc_index = result.file_sfc_index;
        self.handles = result.handles;
        self.sfc_list = sfc_list;
        self.offsets = sfc_size;
        self.committed = true;
        debug!(num_sfc = self.sfc_list.len(), "particle stream committed");
        Ok(())
    }

    pub fn file_sfc_index(&self) -> &[i64] {
        &self.file_sfc_index
    }

    fn select_file(&mut self, sfc: i64) -> Result<usize> {
        let f = distributor::find_file(&self.file_sfc_index, sfc).ok_or(FilesetError::InvalidSfc {
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

    pub fn write_root_begin(&mut self, sfc: i64, counts: &[i32]) -> Result<()> {
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
        if counts.len() != self.species.len() {
            return Err(FilesetError::InvalidSpecies {
                species: counts.len() as i32,
                num_species: self.species.len() as i32,
            });
        }

        let offset = self.offsets[self.next_index];
        let file = self.select_file(sfc)?;
        self.handles[file].seek(offset, Whence::Set)?;
        self.handles[file].write_i32(counts)?;

        self.write_state = WriteState::Root {
            counts: counts.to_vec(),
        };
        Ok(())
    }

    pub fn write_species_begin(&mut self, species: i32) -> Result<()> {
        let WriteState::Root { counts } = &self.write_state else {
            return Err(FilesetError::InvalidState("write_species_begin outside Root"));
        };
        if species < 0 || species as usize >= self.species.len() {
            return Err(FilesetError::InvalidSpecies {
                species,
                num_species: self.species.len() as i32,
            });
        }
        self.write_state = WriteState::Species {
            counts: counts.clone(),
            species,
            written: 0,
        };
        Ok(())
    }

    pub fn write_particle(&mut self, pid: i64, subspecies: i32, primary: &[f64], secondary: &[f32]) -> Result<()> {
        let WriteState::Species {
            counts,
            species,
            written,
        } = &mut self.write_state
        else {
            return Err(FilesetError::InvalidState("write_particle outside Species"));
        };
        let schema = &self.species[*species as usize];
        if primary.len() != schema.num_primary_variables as usize
            || secondary.len() != schema.num_secondary_variables as usize
        {
            return Err(FilesetError::InvalidState("primary/secondary length mismatch"));
        }
        if *written >= counts[*species as usize] {
            return Err(FilesetError::InvalidState(
                "write_particle called more times than declared count",
            ));
        }

        let file = self.cur_file.expect("a file is attached once in Root state");
        self.handles[file].write_i64(&[pid])?;
        self.handles[file].write_i32(&[subspecies])?;
        self.handles[file].write_f64(primary)?;
        self.handles[file].write_f32(secondary)?;
        *written += 1;
        Ok(())
    }

    pub fn write_species_end(&mut self) -> Result<()> {
        let WriteState::Species {
            counts,
            species,
            written,
        } = &self.write_state
        else {
            return Err(FilesetError::InvalidState("write_species_end outside Species"));
        };
        if *written != counts[*species as usize] {
            return Err(FilesetError::InvalidState(
                "write_species_end before declared count was written",
            ));
        }
        self.write_state = WriteState::Root {
            counts: counts.clone(),
        };
        Ok(())
    }

    pub fn write_root_end(&mut self) -> Result<()> {
        if !matches!(self.write_state, WriteState::Root { .. }) {
            return Err(FilesetError::InvalidState("write_root_end outside Root"));
        }
        self.write_state = WriteState::Idle;
        self.next_index += 1;
        Ok(())
    }

    // ---- Read path ----

    pub fn open_read(
        file_sfc_index: Vec<i64>,
        species: Vec<SpeciesSchema>,
        num_particles_per_species: Vec<i64>,
        handles: Vec<FileHandle>,
        buffer_size: usize,
    ) -> Self {
        let num_species = species.len();
        ParticleStream {
            num_files: file_sfc_index.len() as i64 - 1,
            species,
            num_particles_per_species,
            file_sfc_index,
            handles,
            mode: Mode::Read,
            buffer_size,
            cur_file: None,
            pending: Vec::new(),
            num_local_root_cells: 0,
            committed: true,
            local_counts_sum: vec![0; num_species],
            sfc_list: Vec::new(),
            offsets: Vec::new(),
            next_index: 0,
            write_state: WriteState::Idle,
            cache_begin: 0,
            cache_end: 0,
            cache: Vec::new(),
            read_state: ReadState::Idle,
        }
    }

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

    /// `read_root_begin`: reads the per-species counts header and records
    /// the record start byte offset so `read_species_begin` can seek
    /// directly to any species without walking through earlier ones.
    pub fn read_root_begin(&mut self, sfc: i64) -> Result<Vec<i32>> {
        if self.mode != Mode::Read {
            return Err(FilesetError::InvalidFilesetMode);
        }
        if !matches!(self.read_state, ReadState::Idle) {
            return Err(FilesetError::InvalidState("read_root_begin outside Idle"));
        }
        let record_start = self.cached_offset(sfc)?;
        self.seek_to_sfc(sfc)?;
        let file = self.cur_file.expect("select_file always attaches a file");
        let counts = self.handles[file].read_i32(self.species.len())?;
        self.read_state = ReadState::Root {
            record_start,
            counts: counts.clone(),
        };
        Ok(counts)
    }

    /// `read_species_begin(s)`: seeks directly to species `s`'s first
    /// particle by computing its offset from `record_start` and the
    /// preceding species' declared counts (spec.md §4.4).
    pub fn read_species_begin(&mut self, species: i32) -> Result<()> {
        let ReadState::Root { record_start, counts } = &self.read_state else {
            return Err(FilesetError::InvalidState("read_species_begin outside Root"));
        };
        if species < 0 || species as usize >= self.species.len() {
            return Err(FilesetError::InvalidSpecies {
                species,
                num_species: self.species.len() as i32,
            });
        }
        let mut offset = *record_start + 4 * self.species.len() as i64;
        for i in 0..species as usize {
            let s = &self.species[i];
            offset += counts[i] as i64
                * (8 + 4 + 8 * s.num_primary_variables as i64 + 4 * s.num_secondary_variables as i64);
        }
        let record_start = *record_start;
        let counts = counts.clone();
        let file = self.cur_file.expect("read_root_begin keeps the shard attached");
        self.handles[file].seek(offset, Whence::Set)?;
        self.read_state = ReadState::Species {
            record_start,
            counts,
            species,
            read: 0,
        };
        Ok(())
    }

    pub fn read_particle(&mut self) -> Result<ParticleRecord> {
        let ReadState::Species {
            counts,
            species,
            read,
            ..
        } = &mut self.read_state
        else {
            return Err(FilesetError::InvalidState("read_particle outside Species"));
        };
        if *read >= counts[*species as usize] {
            return Err(FilesetError::InvalidState(
                "read_particle called more times than this species' declared count",
            ));
        }
        let schema = &self.species[*species as usize];
        let np = schema.num_primary_variables as usize;
        let ns = schema.num_secondary_variables as usize;
        let file = self.cur_file.expect("species read keeps the shard attached");

        let pid = self.handles[file].read_i64(1)?[0];
        let subspecies = self.handles[file].read_i32(1)?[0];
        let primary = self.handles[file].read_f64(np)?;
        let secondary = self.handles[file].read_f32(ns)?;
        *read += 1;

        Ok(ParticleRecord {
            pid,
            subspecies,
            primary,
            secondary,
        })
    }

    pub fn read_species_end(&mut self) -> Result<()> {
        let ReadState::Species {
            record_start,
            counts,
            species,
            read,
        } = &self.read_state
        else {
            return Err(FilesetError::InvalidState("read_species_end outside Species"));
        };
        if *read != counts[*species as usize] {
            return Err(FilesetError::InvalidState(
                "read_species_end before declared count was read",
            ));
        }
        self.read_state = ReadState::Root {
            record_start: *record_start,
            counts: counts.clone(),
        };
        Ok(())
    }

    pub fn read_root_end(&mut self) -> Result<()> {
        if !matches!(self.read_state, ReadState::Root { .. }) {
            return Err(FilesetError::InvalidState("read_root_end outside Root"));
        }
        self.read_state = ReadState::Idle;
        Ok(())
    }
}
