//! Top-level open/create/close orchestration (spec.md §4.5): version
//! gating, schema derivation, and ownership of at most one
//! [`GridStream`] and one [`ParticleStream`].

use std::path::PathBuf;

use fileset_coords::SfcType;
use fileset_params::ParamTable;
use tracing::{debug, warn};

use crate::config::IoConfig;
use crate::context::CollectiveContext;
use crate::distributor::shard_filename;
use crate::error::{FilesetError, Result};
use crate::grid::GridStream;
use crate::handle::{FileHandle, OpenMode};
use crate::particle::{ParticleStream, SpeciesSchema};
use crate::{ARTIO_MAJOR_VERSION, ARTIO_MINOR_VERSION, MAX_PREFIX_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenType(u8);

impl OpenType {
    pub const HEADER: OpenType = OpenType(0b001);
    pub const GRID: OpenType = OpenType(0b010);
    pub const PARTICLES: OpenType = OpenType(0b100);

    pub fn contains(self, flag: OpenType) -> bool {
        self.0 & flag.0 == flag.0
    }
}

impl std::ops::BitOr for OpenType {
    type Output = OpenType;
    fn bitor(self, rhs: OpenType) -> OpenType {
        OpenType(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilesetMode {
    Read,
    Write,
}

fn bits_per_dim_of(mut n: i64) -> u8 {
    let mut bits = 0u8;
    while n >> 3 != 0 {
        bits += 1;
        n >>= 3;
    }
    bits
}

/// Schema for the to-be-created grid component, passed to
/// [`Fileset::add_grid`].
pub struct GridSchema {
    pub num_files: i64,
    pub num_vars: i32,
    pub variable_labels: Vec<String>,
}

/// Schema for the to-be-created particle component, passed to
/// [`Fileset::add_particles`].
pub struct ParticleSchema {
    pub num_files: i64,
    pub species: Vec<SpeciesSchema>,
}

pub struct Fileset<C: CollectiveContext> {
    prefix: String,
    dir: PathBuf,
    ctx: C,
    mode: FilesetMode,
    open_type: OpenType,
    endian_swap: bool,
    pub sfc_type: SfcType,
    pub num_root_cells: i64,
    pub bits_per_dim: u8,
    pub num_grid: i64,
    pub proc_sfc_begin: i64,
    pub proc_sfc_end: i64,
    pub num_local_root_cells: i64,
    params: ParamTable,
    config: IoConfig,
    grid: Option<GridStream>,
    particles: Option<ParticleStream>,
}

impl<C: CollectiveContext> Fileset<C> {
    fn validate_prefix(prefix: &str) -> Result<()> {
        if prefix.len() > MAX_PREFIX_LEN {
            return Err(FilesetError::InvalidState("file prefix exceeds the maximum path length"));
        }
        Ok(())
    }

    /// `create`: validates the strategy, all-reduces `num_local_root_cells`
    /// to verify the sum matches `num_root_cells`, and derives `num_grid`.
    pub fn create(
        prefix: impl Into<String>,
        dir: impl Into<PathBuf>,
        ctx: C,
        sfc_type: SfcType,
        num_root_cells: i64,
        num_local_root_cells: i64,
        config: IoConfig,
    ) -> Result<Self> {
        let prefix = prefix.into();
        Self::validate_prefix(&prefix)?;

        let bits_per_dim = bits_per_dim_of(num_root_cells);
        let num_grid = 1i64 << bits_per_dim;
        if num_grid.pow(3) != num_root_cells {
            return Err(FilesetError::InvalidState(
                "num_root_cells is not a perfect cube for any power-of-two grid",
            ));
        }

        let total_local = ctx.all_reduce_sum_i64(num_local_root_cells);
        if total_local != num_root_cells {
            return Err(FilesetError::InvalidState(
                "sum of per-rank num_local_root_cells does not equal num_root_cells",
            ));
        }

        let mut params = ParamTable::new();
        params.set_int32_scalar("ARTIO_MAJOR_VERSION", ARTIO_MAJOR_VERSION);
        params.set_int32_scalar("ARTIO_MINOR_VERSION", ARTIO_MINOR_VERSION);
        params.set_int64("num_root_cells", &[num_root_cells]);
        params.set_int32_scalar("sfc_type", sfc_type.tag());

        debug!(num_root_cells, bits_per_dim, "fileset created in write mode");

        Ok(Fileset {
            prefix,
            dir: dir.into(),
            ctx,
            mode: FilesetMode::Write,
            open_type: OpenType::HEADER,
            endian_swap: false,
            sfc_type,
            num_root_cells,
            bits_per_dim,
            num_grid,
            proc_sfc_begin: 0,
            proc_sfc_end: num_root_cells,
            num_local_root_cells,
            params,
            config,
            grid: None,
            particles: None,
        })
    }

    pub fn add_grid(&mut self, schema: GridSchema) -> Result<()> {
        if self.mode != FilesetMode::Write {
            return Err(FilesetError::InvalidFilesetMode);
        }
        if self.grid.is_some() {
            return Err(FilesetError::DataExists);
        }
        self.grid = Some(GridStream::new_for_write(
            schema.num_files,
            schema.num_vars,
            schema.variable_labels,
            self.num_local_root_cells,
            self.config.default_buffer_size,
        ));
        self.open_type = self.open_type | OpenType::GRID;
        Ok(())
    }

    pub fn add_particles(&mut self, schema: ParticleSchema) -> Result<()> {
        if self.mode != FilesetMode::Write {
            return Err(FilesetError::InvalidFilesetMode);
        }
        if self.particles.is_some() {
            return Err(FilesetError::DataExists);
        }
        self.particles = Some(ParticleStream::new_for_write(
            schema.num_files,
            schema.species,
            self.num_local_root_cells,
            self.config.default_buffer_size,
        ));
        self.open_type = self.open_type | OpenType::PARTICLES;
        Ok(())
    }

    pub fn grid_mut(&mut self) -> Result<&mut GridStream> {
        self.grid.as_mut().ok_or(FilesetError::GridDataNotFound)
    }

    pub fn particles_mut(&mut self) -> Result<&mut ParticleStream> {
        self.particles.as_mut().ok_or(FilesetError::ParticleDataNotFound)
    }

    /// Runs the distributor for every added component and writes the
    /// resulting schema into the parameter table. After `commit` the
    /// streams accept `write_root_begin`/... calls.
    pub fn commit(&mut self) -> Result<()> {
        if self.mode != FilesetMode::Write {
            return Err(FilesetError::InvalidFilesetMode);
        }

        if let Some(grid) = self.grid.as_mut() {
            grid.commit(&self.ctx, self.num_root_cells, &self.dir, &self.prefix)?;
            self.params.set_int64("grid_file_sfc_index", grid.file_sfc_index());
            self.params
                .set_int64_scalar("num_grid_files", grid.file_sfc_index().len() as i64 - 1);
            self.params.set_int32_scalar("num_grid_variables", grid.num_vars);
            self.params.set_string("grid_variable_labels", &grid.variable_labels);
            self.params.set_int32_scalar("grid_max_level", grid.max_level);
        }

        if let Some(particles) = self.particles.as_mut() {
            particles.commit(&self.ctx, self.num_root_cells, &self.dir, &self.prefix)?;
            self.params
                .set_int64("particle_file_sfc_index", particles.file_sfc_index());
            self.params
                .set_int64_scalar("num_particle_files", particles.file_sfc_index().len() as i64 - 1);
            self.params
                .set_int32_scalar("num_particle_species", particles.num_species() as i32);
            let labels: Vec<String> = particles.species.iter().map(|s| s.label.clone()).collect();
            self.params.set_string("particle_species_labels", &labels);
            let primary: Vec<i32> = particles.species.iter().map(|s| s.num_primary_variables).collect();
            let secondary: Vec<i32> = particles
                .species
                .iter()
                .map(|s| s.num_secondary_variables)
                .collect();
            self.params.set_int32("num_primary_variables", &primary);
            self.params.set_int32("num_secondary_variables", &secondary);
            for (i, s) in particles.species.iter().enumerate() {
                self.params
                    .set_string(format!("species_{i:02}_primary_variable_labels"), &s.primary_variable_labels);
                self.params.set_string(
                    format!("species_{i:02}_secondary_variable_labels"),
                    &s.secondary_variable_labels,
                );
            }
            self.params
                .set_int64("num_particles_per_species", &particles.num_particles_per_species);
        }

        Ok(())
    }

    /// `open`: reads the parameter header, version-gates, derives the
    /// schema, and opens any stream named in `open_type`.
    pub fn open(
        prefix: impl Into<String>,
        dir: impl Into<PathBuf>,
        ctx: C,
        open_type: OpenType,
        config: IoConfig,
        rank_range: Option<(i64, i64)>,
    ) -> Result<Self> {
        let prefix = prefix.into();
        let dir = dir.into();
        Self::validate_prefix(&prefix)?;

        let header_path = dir.join(format!("{prefix}.art"));
        let (params, endian_swap) = ParamTable::open(&header_path)?;

        let major = params.get_int32_scalar("ARTIO_MAJOR_VERSION")?;
        let minor = params.get_int32_opt("ARTIO_MINOR_VERSION").unwrap_or(0);
        if major > ARTIO_MAJOR_VERSION {
            return Err(FilesetError::InvalidState(
                "fileset major version is newer than this library supports",
            ));
        }
        if minor != ARTIO_MINOR_VERSION {
            warn!(file_minor = minor, lib_minor = ARTIO_MINOR_VERSION, "minor version mismatch, continuing");
        }

        let num_root_cells = params.get_int64("num_root_cells")?[0];
        let sfc_tag = params.get_int32_opt("sfc_type").unwrap_or(SfcType::Hilbert.tag());
        let sfc_type = SfcType::from_tag(sfc_tag)
            .ok_or(FilesetError::InvalidState("unrecognized sfc_type tag in parameter header"))?;

        let bits_per_dim = bits_per_dim_of(num_root_cells);
        let num_grid = 1i64 << bits_per_dim;
        if num_grid.pow(3) != num_root_cells {
            return Err(FilesetError::InvalidState(
                "num_root_cells is not a perfect cube for any power-of-two grid",
            ));
        }

        let (proc_sfc_begin, proc_sfc_end) = rank_range.unwrap_or((0, num_root_cells));

        let mut fileset = Fileset {
            prefix,
            dir,
            ctx,
            mode: FilesetMode::Read,
            open_type,
            endian_swap,
            sfc_type,
            num_root_cells,
            bits_per_dim,
            num_grid,
            proc_sfc_begin,
            proc_sfc_end,
            num_local_root_cells: proc_sfc_end - proc_sfc_begin,
            params,
            config,
            grid: None,
            particles: None,
        };

        if open_type.contains(OpenType::GRID) {
            fileset.open_grid()?;
        }
        if open_type.contains(OpenType::PARTICLES) {
            fileset.open_particles()?;
        }
        Ok(fileset)
    }

    fn open_shards(&self, file_sfc_index: &[i64], suffix: char) -> Result<Vec<FileHandle>> {
        let num_files = file_sfc_index.len() as i64 - 1;
        let mut handles = Vec::with_capacity(num_files as usize);
        for f in 0..num_files {
            let path = self
                .dir
                .join(shard_filename(&self.prefix, suffix, f, num_files));
            let overlaps = file_sfc_index[f as usize] < self.proc_sfc_end
                && file_sfc_index[f as usize + 1] > self.proc_sfc_begin;
            let mut mode = OpenMode::READ;
            if overlaps {
                mode = mode | OpenMode::ACCESS;
            }
            if self.endian_swap {
                mode = mode | OpenMode::ENDIAN_SWAP;
            }
            handles.push(FileHandle::open(&path, mode)?);
        }
        Ok(handles)
    }

    fn open_grid(&mut self) -> Result<()> {
        let file_sfc_index = self.params.get_int64("grid_file_sfc_index")?.to_vec();
        let num_vars = self.params.get_int32_scalar("num_grid_variables")?;
        let labels = self.params.get_string("grid_variable_labels")?.to_vec();
        let max_level = self.params.get_int32_scalar("grid_max_level")?;
        let handles = self.open_shards(&file_sfc_index, 'g')?;
        self.grid = Some(GridStream::open_read(
            file_sfc_index,
            num_vars,
            labels,
            max_level,
            handles,
            self.config.default_buffer_size,
        ));
        Ok(())
    }

    fn open_particles(&mut self) -> Result<()> {
        let file_sfc_index = self.params.get_int64("particle_file_sfc_index")?.to_vec();
        let num_species = self.params.get_int32_scalar("num_particle_species")? as usize;
        let labels = self.params.get_string("particle_species_labels")?.to_vec();
        let primary = self.params.get_int32("num_primary_variables")?.to_vec();
        let secondary = self.params.get_int32("num_secondary_variables")?.to_vec();
        let mut species = Vec::with_capacity(num_species);
        for i in 0..num_species {
            let primary_labels = self
                .params
                .get_string(&format!("species_{i:02}_primary_variable_labels"))?
                .to_vec();
            let secondary_labels = self
                .params
                .get_string(&format!("species_{i:02}_secondary_variable_labels"))?
                .to_vec();
            species.push(SpeciesSchema {
                label: labels[i].clone(),
                num_primary_variables: primary[i],
                num_secondary_variables: secondary[i],
                primary_variable_labels: primary_labels,
                secondary_variable_labels: secondary_labels,
            });
        }
        let num_particles_per_species = self
            .params
            .get_int64("num_particles_per_species")
            .map(|v| v.to_vec())
            .unwrap_or_else(|_| vec![0; num_species]);
        let handles = self.open_shards(&file_sfc_index, 'p')?;
        self.particles = Some(ParticleStream::open_read(
            file_sfc_index,
            species,
            num_particles_per_species,
            handles,
            self.config.default_buffer_size,
        ));
        Ok(())
    }

    /// `close`: in write mode, closing flushes any buffered shard writers;
    /// only rank 0 serializes the `.art` header (original_source/artio.c,
    /// "parameter re-serialization is rank-0-only").
    pub fn close(self) -> Result<()> {
        if self.mode == FilesetMode::Write && self.ctx.rank() == 0 {
            let path = self.dir.join(format!("{}.art", self.prefix));
            self.params.write(&path)?;
            debug!(path = %path.display(), "fileset header written");
        }
        Ok(())
    }

    pub fn file_prefix(&self) -> &str {
        &self.prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::LocalContext;
    use crate::particle::SpeciesSchema;

    fn make_species() -> Vec<SpeciesSchema> {
        vec![SpeciesSchema {
            label: "dm".into(),
            num_primary_variables: 3,
            num_secondary_variables: 1,
            primary_variable_labels: vec!["x".into(), "y".into(), "z".into()],
            secondary_variable_labels: vec!["mass".into()],
        }]
    }

    #[test]
    fn create_derives_bits_per_dim_and_num_grid() {
        let dir = tempfile::tempdir().unwrap();
        let fs = Fileset::create(
            "test",
            dir.path(),
            LocalContext,
            SfcType::Hilbert,
            64,
            64,
            IoConfig::default(),
        )
        .unwrap();
        assert_eq!(fs.bits_per_dim, 2);
        assert_eq!(fs.num_grid, 4);
    }

    #[test]
    fn create_rejects_non_cube_root_cells() {
        let dir = tempfile::tempdir().unwrap();
        let err = Fileset::create(
            "test",
            dir.path(),
            LocalContext,
            SfcType::Hilbert,
            10,
            10,
            IoConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, FilesetError::InvalidState(_)));
    }

    #[test]
    fn full_round_trip_grid_and_particles() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = Fileset::create(
            "rt",
            dir.path(),
            LocalContext,
            SfcType::SlabX,
            8,
            8,
            IoConfig::default(),
        )
        .unwrap();
        fs.add_grid(GridSchema {
            num_files: 1,
            num_vars: 1,
            variable_labels: vec!["density".into()],
        })
        .unwrap();
        fs.add_particles(ParticleSchema {
            num_files: 1,
            species: make_species(),
        })
        .unwrap();
        for sfc in 0..8 {
            fs.grid_mut().unwrap().add_sfc(sfc, 0, 0).unwrap();
            fs.particles_mut().unwrap().add_sfc(sfc, &[2]).unwrap();
        }
        fs.commit().unwrap();

        for sfc in 0..8 {
            fs.grid_mut().unwrap().write_root_begin(sfc, &[sfc as f32], 0, &[]).unwrap();
            fs.grid_mut().unwrap().write_root_end().unwrap();

            fs.particles_mut().unwrap().write_root_begin(sfc, &[2]).unwrap();
            fs.particles_mut().unwrap().write_species_begin(0).unwrap();
            for p in 0..2 {
                fs.particles_mut()
                    .unwrap()
                    .write_particle(sfc * 10 + p, 0, &[1.0, 2.0, 3.0], &[9.0])
                    .unwrap();
            }
            fs.particles_mut().unwrap().write_species_end().unwrap();
            fs.particles_mut().unwrap().write_root_end().unwrap();
        }
        fs.close().unwrap();

        let mut reader = Fileset::open(
            "rt",
            dir.path(),
            LocalContext,
            OpenType::HEADER | OpenType::GRID | OpenType::PARTICLES,
            IoConfig::default(),
            None,
        )
        .unwrap();
        assert_eq!(reader.num_root_cells, 8);

        reader.grid_mut().unwrap().cache_sfc_range(0, 7).unwrap();
        let mut vars = [0f32];
        let header = reader.grid_mut().unwrap().read_root_begin(3, Some(&mut vars), None).unwrap();
        assert_eq!(header.num_levels, 0);
        assert_eq!(vars, [3.0]);
        reader.grid_mut().unwrap().read_root_end().unwrap();

        reader.particles_mut().unwrap().cache_sfc_range(0, 7).unwrap();
        let counts = reader.particles_mut().unwrap().read_root_begin(3).unwrap();
        assert_eq!(counts, vec![2]);
        reader.particles_mut().unwrap().read_species_begin(0).unwrap();
        let p0 = reader.particles_mut().unwrap().read_particle().unwrap();
        assert_eq!(p0.pid, 30);
        let p1 = reader.particles_mut().unwrap().read_particle().unwrap();
        assert_eq!(p1.pid, 31);
        reader.particles_mut().unwrap().read_species_end().unwrap();
        reader.particles_mut().unwrap().read_root_end().unwrap();
    }
}
