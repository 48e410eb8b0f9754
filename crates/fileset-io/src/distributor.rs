//! Sharded-file distribution (spec.md §4.2): turns a rank-local list of
//! `(sfc, size)` pairs into a global per-file SFC partition and per-SFC byte
//! offsets, then opens every shard and writes its offset-table header.

use std::path::Path;

use tracing::{debug, instrument};

use crate::context::CollectiveContext;
use crate::error::{FilesetError, Result};
use crate::handle::{FileHandle, OpenMode, Whence};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocStrategy {
    EqualSfc,
    /// Reserved (spec.md §4.2): not implemented.
    EqualSize,
    /// Deprecated (spec.md §4.2): not implemented.
    OneToOne,
}

pub struct DistributorResult {
    pub file_sfc_index: Vec<i64>,
    pub handles: Vec<FileHandle>,
}

/// `{prefix}.{g|p}{NNN}`, index zero-padded to at least 3 digits, growing
/// as needed beyond 999 files (original_source/artio.c).
pub(crate) fn shard_filename(prefix: &str, suffix: char, index: i64, num_files: i64) -> String {
    let width = (num_files.saturating_sub(1)).to_string().len().max(3);
    format!("{prefix}.{suffix}{index:0width$}")
}

/// Binary search for the file whose `[file_sfc_index[f], file_sfc_index[f+1])`
/// range contains `sfc`. Mirrors the original's `artio_find_file`.
pub(crate) fn find_file(file_sfc_index: &[i64], sfc: i64) -> Option<usize> {
    let num_files = file_sfc_index.len() - 1;
    if sfc < file_sfc_index[0] || sfc >= file_sfc_index[num_files] {
        return None;
    }
    let mut a = 0usize;
    let mut b = num_files;
    while a != b {
        let c = (a + b + 1) / 2;
        if sfc < file_sfc_index[c] {
            b = c - 1;
        } else {
            a = c;
        }
    }
    Some(a)
}

/// Runs the distribution algorithm and returns the global file partition
/// plus one open [`FileHandle`] per shard. `sfc_size` is read as each local
/// SFC's record size on entry and overwritten with that SFC's byte offset
/// within its shard on return, exactly as spec.md §4.2 describes ("the
/// array is reused as an output").
#[instrument(skip(ctx, sfc_list, sfc_size, dir), fields(num_files, suffix))]
pub fn distribute<C: CollectiveContext>(
    ctx: &C,
    num_root_cells: i64,
    sfc_list: &[i64],
    sfc_size: &mut [i64],
    num_files: i64,
    strategy: AllocStrategy,
    dir: &Path,
    file_prefix: &str,
    file_suffix: char,
) -> Result<DistributorResult> {
    if strategy != AllocStrategy::EqualSfc {
        return Err(FilesetError::InvalidAllocStrategy);
    }
    if num_files <= 0 || num_files > num_root_cells {
        return Err(FilesetError::InvalidFileNumber {
            num_files,
            num_root_cells,
        });
    }
    if sfc_list.len() != sfc_size.len() {
        return Err(FilesetError::InvalidState(
            "sfc_list and sfc_size must have matching length",
        ));
    }
    for &size in sfc_size.iter() {
        if size <= 0 {
            return Err(FilesetError::InvalidState(
                "every local sfc_size entry must be positive before distribution",
            ));
        }
    }

    let rank = ctx.rank() as i64;
    let num_procs = ctx.num_procs() as i64;
    let per = (num_root_cells + num_procs - 1) / num_procs;
    let range_start = rank * per;
    let range_end = num_root_cells.min((rank + 1) * per);
    let range_size = (range_end - range_start).max(0) as usize;

    // Step 1/2: group local entries by destination rank and exchange.
    let mut outgoing = vec![Vec::new(); num_procs as usize];
    for (&sfc, &size) in sfc_list.iter().zip(sfc_size.iter()) {
        let dest = (sfc / per) as usize;
        outgoing[dest].push((sfc, size));
    }
    let incoming = ctx.exchange_pairs(outgoing);

    let received_count: usize = incoming.iter().map(Vec::len).sum();
    if received_count != range_size {
        return Err(FilesetError::InvalidState(
            "distributor received a different sfc count than its range size",
        ));
    }

    let mut size_table = vec![0i64; range_size];
    for pairs in &incoming {
        for &(sfc, size) in pairs {
            size_table[(sfc - range_start) as usize] = size;
        }
    }

    // Step 3/4: local prefix sum, stitched into a global exclusive prefix.
    let base = ctx.recv_prefix();
    let mut running = base;
    for entry in size_table.iter_mut() {
        let size = *entry;
        *entry = running;
        running += size;
    }
    ctx.send_prefix(running);

    // Step 5: EQUAL_SFC file partition.
    let mut file_sfc_index = vec![0i64; (num_files + 1) as usize];
    for f in 0..num_files {
        file_sfc_index[f as usize] = (num_root_cells * f + num_files - 1) / num_files;
    }
    file_sfc_index[num_files as usize] = num_root_cells;

    // Step 6: offset re-origin, carried rank to rank via a second chain.
    let received_offset = ctx.recv_prefix();
    if range_size == 0 {
        ctx.send_prefix(received_offset);
    } else {
        let (mut file, mut offset) = if rank == 0 {
            let header = (file_sfc_index[1] - file_sfc_index[0]) * 8;
            (0usize, size_table[0] - header)
        } else {
            let file = find_file(&file_sfc_index, range_start - 1)
                .ok_or(FilesetError::InvalidState("offset re-origin: no file owns this range"))?;
            (file, received_offset)
        };
        for (i, entry) in size_table.iter_mut().enumerate() {
            let sfc = range_start + i as i64;
            if sfc == file_sfc_index[file + 1] {
                file += 1;
                let header = (file_sfc_index[file + 1] - file_sfc_index[file]) * 8;
                offset = *entry - header;
            }
            *entry -= offset;
        }
        ctx.send_prefix(offset);
    }

    // Step 7: return offsets to their originating ranks (inverse of step 2).
    let mut outgoing_back = vec![Vec::new(); num_procs as usize];
    for (src, pairs) in incoming.iter().enumerate() {
        for &(sfc, _) in pairs {
            let offset = size_table[(sfc - range_start) as usize];
            outgoing_back[src].push((sfc, offset));
        }
    }
    let back = ctx.exchange_pairs(outgoing_back);
    let mut offsets_by_sfc = std::collections::HashMap::with_capacity(sfc_list.len());
    for pairs in back {
        for (sfc, offset) in pairs {
            offsets_by_sfc.insert(sfc, offset);
        }
    }
    for (slot, &sfc) in sfc_size.iter_mut().zip(sfc_list.iter()) {
        *slot = *offsets_by_sfc
            .get(&sfc)
            .ok_or(FilesetError::InvalidState("no offset returned for a local sfc"))?;
    }

    // Step 8: open every shard, write our slice of its header if we hold it.
    let mut file_access = vec![false; num_files as usize];
    for f in 0..num_files as usize {
        if file_sfc_index[f] < range_end && file_sfc_index[f + 1] > range_start {
            file_access[f] = true;
        }
    }
    for &sfc in sfc_list {
        if let Some(f) = find_file(&file_sfc_index, sfc) {
            file_access[f] = true;
        }
    }

    let mut handles = Vec::with_capacity(num_files as usize);
    for f in 0..num_files as usize {
        let filename = dir.join(shard_filename(file_prefix, file_suffix, f as i64, num_files));
        let mode = if file_access[f] {
            OpenMode::WRITE | OpenMode::ACCESS
        } else {
            OpenMode::WRITE
        };
        let mut handle = FileHandle::open(&filename, mode)?;

        if file_sfc_index[f] < range_end && file_sfc_index[f + 1] > range_start {
            let first = range_start.max(file_sfc_index[f]);
            let last = (range_end - 1).min(file_sfc_index[f + 1] - 1);
            handle.seek((first - file_sfc_index[f]) * 8, Whence::Set)?;
            let lo = (first - range_start) as usize;
            let hi = (last - range_start) as usize;
            handle.write_i64(&size_table[lo..=hi])?;
        }
        handles.push(handle);
    }

    debug!(num_files, range_size, "distributor committed shard layout");
    Ok(DistributorResult {
        file_sfc_index,
        handles,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::LocalContext;

    #[test]
    fn single_rank_partitions_and_writes_headers() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = LocalContext;
        let num_root_cells = 8i64;
        let sfc_list: Vec<i64> = (0..num_root_cells).collect();
        let mut sfc_size: Vec<i64> = vec![16; num_root_cells as usize];

        let result = distribute(
            &ctx,
            num_root_cells,
            &sfc_list,
            &mut sfc_size,
            2,
            AllocStrategy::EqualSfc,
            dir.path(),
            "test",
            'g',
        )
        .unwrap();

        assert_eq!(result.file_sfc_index, vec![0, 4, 8]);
        // Every shard's first sfc starts right after its own header.
        assert_eq!(sfc_size[0], 4 * 8); // file 0 holds sfc 0..4, header = 4*8 bytes
        assert_eq!(sfc_size[4], 4 * 8); // file 1 holds sfc 4..8, header = 4*8 bytes
        // Offsets increase monotonically by record size within a shard.
        assert_eq!(sfc_size[1], sfc_size[0] + 16);
        assert_eq!(sfc_size[5], sfc_size[4] + 16);
        assert_eq!(result.handles.len(), 2);
    }

    #[test]
    fn rejects_more_files_than_root_cells() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = LocalContext;
        let mut sizes = vec![8i64; 2];
        let err = distribute(
            &ctx,
            2,
            &[0, 1],
            &mut sizes,
            5,
            AllocStrategy::EqualSfc,
            dir.path(),
            "test",
            'g',
        )
        .unwrap_err();
        assert!(matches!(err, FilesetError::InvalidFileNumber { .. }));
    }

    #[test]
    fn rejects_non_positive_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = LocalContext;
        let mut sizes = vec![0i64; 2];
        let err = distribute(
            &ctx,
            2,
            &[0, 1],
            &mut sizes,
            1,
            AllocStrategy::EqualSfc,
            dir.path(),
            "test",
            'g',
        )
        .unwrap_err();
        assert!(matches!(err, FilesetError::InvalidState(_)));
    }

    #[test]
    fn unimplemented_strategy_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = LocalContext;
        let mut sizes = vec![8i64; 2];
        let err = distribute(
            &ctx,
            2,
            &[0, 1],
            &mut sizes,
            1,
            AllocStrategy::EqualSize,
            dir.path(),
            "test",
            'g',
        )
        .unwrap_err();
        assert!(matches!(err, FilesetError::InvalidAllocStrategy));
    }
}
