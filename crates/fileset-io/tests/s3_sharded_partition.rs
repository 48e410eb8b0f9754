//! S3 (sharded) plus property 3 (partition coverage): spec.md §8.

use fileset_io::context::LocalContext;
use fileset_io::grid::GridStream;

#[test]
fn s3_four_shards_cover_sfc_range_with_exact_header_offset() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = LocalContext;
    let num_root_cells = 64i64;
    let mut stream = GridStream::new_for_write(4, 1, vec!["d".into()], num_root_cells, 4096);
    for sfc in 0..num_root_cells {
        stream.add_sfc(sfc, 0, 0).unwrap();
    }
    stream.commit(&ctx, num_root_cells, dir.path(), "test").unwrap();

    assert_eq!(stream.file_sfc_index(), &[0, 16, 32, 48, 64]);

    for sfc in 0..num_root_cells {
        stream.write_root_begin(sfc, &[sfc as f32], 0, &[]).unwrap();
        stream.write_root_end().unwrap();
    }

    let meta = std::fs::metadata(dir.path().join("test.g002")).unwrap();
    // shard 2 covers sfc 32..48: header 16*8 bytes, 16 records of 8 bytes each.
    assert_eq!(meta.len(), 16 * 8 + 16 * 8);

    let file_sfc_index = stream.file_sfc_index().to_vec();
    drop(stream);
    let handle = fileset_io::FileHandle::open(
        &dir.path().join("test.g002"),
        fileset_io::OpenMode::READ | fileset_io::OpenMode::ACCESS,
    )
    .unwrap();
    let mut reader = GridStream::open_read(file_sfc_index, 1, vec!["d".into()], 0, vec![handle], 4096);
    reader.cache_sfc_range(32, 32).unwrap();
    let mut vars = [0f32];
    reader.read_root_begin(32, Some(&mut vars), None).unwrap();
    // sfc 32 is shard 2's first sfc; its offset is exactly the header size.
    assert_eq!(vars, [32.0]);
}

#[test]
fn property3_partition_covers_every_sfc_exactly_once_for_any_file_count() {
    let num_root_cells = 100i64;
    for num_files in [1i64, 3, 7, 25, 100] {
        let dir = tempfile::tempdir().unwrap();
        let ctx = LocalContext;
        let mut stream = GridStream::new_for_write(num_files, 1, vec!["d".into()], num_root_cells, 4096);
        for sfc in 0..num_root_cells {
            stream.add_sfc(sfc, 0, 0).unwrap();
        }
        stream.commit(&ctx, num_root_cells, dir.path(), "test").unwrap();

        let index = stream.file_sfc_index();
        assert_eq!(index.first(), Some(&0));
        assert_eq!(index.last(), Some(&num_root_cells));
        assert_eq!(index.len(), num_files as usize + 1);
        for w in index.windows(2) {
            assert!(w[0] < w[1], "boundaries must be strictly increasing");
        }
    }
}
