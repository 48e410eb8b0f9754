//! S5 (two-rank round trip) plus property 7 (distribution determinism):
//! spec.md §8. Ranks own shuffled, unequal shares of the SFC range; the
//! resulting shard bytes must match a single-rank reference run exactly.

use fileset_io::context::{LocalContext, ThreadedContext};
use fileset_io::grid::GridStream;

fn write_reference(dir: &std::path::Path, num_root_cells: i64, prefix: &str) {
    let ctx = LocalContext;
    let mut stream = GridStream::new_for_write(1, 1, vec!["d".into()], num_root_cells, 4096);
    for sfc in 0..num_root_cells {
        stream.add_sfc(sfc, 0, 0).unwrap();
    }
    stream.commit(&ctx, num_root_cells, dir, prefix).unwrap();
    for sfc in 0..num_root_cells {
        stream.write_root_begin(sfc, &[sfc as f32], 0, &[]).unwrap();
        stream.write_root_end().unwrap();
    }
}

#[test]
fn s5_shuffled_two_rank_write_matches_single_rank_reference() {
    let dir = tempfile::tempdir().unwrap();
    let num_root_cells = 8i64;
    write_reference(dir.path(), num_root_cells, "ref");

    // Deliberately unequal, shuffled local ownership: rank 0 holds 6 sfcs
    // out of order, rank 1 holds the remaining 2.
    let rank_sfcs = [vec![5i64, 1, 7, 3, 0, 6], vec![2i64, 4]];

    let contexts = ThreadedContext::mesh(2);
    std::thread::scope(|scope| {
        for (ctx, local) in contexts.into_iter().zip(rank_sfcs.clone()) {
            let dir_path = dir.path();
            scope.spawn(move || {
                let mut stream =
                    GridStream::new_for_write(1, 1, vec!["d".into()], local.len() as i64, 4096);
                for &sfc in &local {
                    stream.add_sfc(sfc, 0, 0).unwrap();
                }
                stream.commit(&ctx, num_root_cells, dir_path, "multi").unwrap();
                for &sfc in &local {
                    stream.write_root_begin(sfc, &[sfc as f32], 0, &[]).unwrap();
                    stream.write_root_end().unwrap();
                }
            });
        }
    });

    let reference = std::fs::read(dir.path().join("ref.g000")).unwrap();
    let multi = std::fs::read(dir.path().join("multi.g000")).unwrap();
    assert_eq!(reference, multi);
}
