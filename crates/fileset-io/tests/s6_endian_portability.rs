//! S6 (endian portability) plus property 8: spec.md §8. Hand-assembles a
//! fileset exactly as a big-endian writer would have produced it (every
//! multi-byte field reversed, ASCII bytes untouched) and verifies the
//! little-endian reader here detects the mismatched fingerprint and returns
//! the original values.

use std::io::Write;

use fileset_io::config::IoConfig;
use fileset_io::context::LocalContext;
use fileset_io::fileset::{Fileset, OpenType};

fn write_be_i32<W: Write>(w: &mut W, v: i32) {
    w.write_all(&v.to_be_bytes()).unwrap();
}

fn write_be_i64<W: Write>(w: &mut W, v: i64) {
    w.write_all(&v.to_be_bytes()).unwrap();
}

fn write_be_f32<W: Write>(w: &mut W, v: f32) {
    w.write_all(&v.to_be_bytes()).unwrap();
}

fn write_be_int32_param<W: Write>(w: &mut W, key: &str, values: &[i32]) {
    write_be_i32(w, key.len() as i32);
    w.write_all(key.as_bytes()).unwrap();
    write_be_i32(w, 0); // type tag: Int32
    write_be_i32(w, values.len() as i32);
    for &v in values {
        write_be_i32(w, v);
    }
}

fn write_be_int64_param<W: Write>(w: &mut W, key: &str, values: &[i64]) {
    write_be_i32(w, key.len() as i32);
    w.write_all(key.as_bytes()).unwrap();
    write_be_i32(w, 1); // type tag: Int64
    write_be_i32(w, values.len() as i32);
    for &v in values {
        write_be_i64(w, v);
    }
}

fn write_be_string_param<W: Write>(w: &mut W, key: &str, values: &[&str]) {
    write_be_i32(w, key.len() as i32);
    w.write_all(key.as_bytes()).unwrap();
    write_be_i32(w, 4); // type tag: Str
    write_be_i32(w, values.len() as i32);
    for s in values {
        write_be_i32(w, s.len() as i32);
        w.write_all(s.as_bytes()).unwrap();
    }
}

#[test]
fn s6_big_endian_fileset_reads_back_native_values() {
    let dir = tempfile::tempdir().unwrap();
    let num_root_cells = 8i64;
    let num_vars = 1i32;
    let vars_per_sfc = [10.0f32, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0];

    // Header: magic is plain ASCII, untouched by endianness; the
    // fingerprint and every frame field after it are big-endian.
    let header_path = dir.path().join("be.art");
    let mut header = std::fs::File::create(&header_path).unwrap();
    header.write_all(b"ARTIO1").unwrap();
    write_be_i32(&mut header, 0x0102_0304);
    write_be_int32_param(&mut header, "ARTIO_MAJOR_VERSION", &[1]);
    write_be_int32_param(&mut header, "ARTIO_MINOR_VERSION", &[1]);
    write_be_int64_param(&mut header, "num_root_cells", &[num_root_cells]);
    write_be_int32_param(&mut header, "sfc_type", &[0]); // SlabX
    write_be_int64_param(&mut header, "grid_file_sfc_index", &[0, num_root_cells]);
    write_be_int64_param(&mut header, "num_grid_files", &[1]);
    write_be_int32_param(&mut header, "num_grid_variables", &[num_vars]);
    write_be_string_param(&mut header, "grid_variable_labels", &["density"]);
    write_be_int32_param(&mut header, "grid_max_level", &[0]);
    drop(header);

    // Shard: offset table (int64 per sfc) then num_vars floats + i32
    // num_levels=0 per record, all big-endian.
    let shard_path = dir.path().join("be.g000");
    let mut shard = std::fs::File::create(&shard_path).unwrap();
    let header_bytes = num_root_cells * 8;
    let record_size = num_vars as i64 * 4 + 4;
    for i in 0..num_root_cells {
        write_be_i64(&mut shard, header_bytes + i * record_size);
    }
    for &v in &vars_per_sfc {
        write_be_f32(&mut shard, v);
        write_be_i32(&mut shard, 0);
    }
    drop(shard);

    let mut reader = Fileset::open(
        "be",
        dir.path(),
        LocalContext,
        OpenType::HEADER | OpenType::GRID,
        IoConfig::default(),
        None,
    )
    .unwrap();
    assert_eq!(reader.num_root_cells, num_root_cells);

    let grid = reader.grid_mut().unwrap();
    grid.cache_sfc_range(0, num_root_cells - 1).unwrap();
    for (sfc, &expected) in vars_per_sfc.iter().enumerate() {
        let mut vars = [0f32];
        let header = grid.read_root_begin(sfc as i64, Some(&mut vars), None).unwrap();
        assert_eq!(header.num_levels, 0);
        assert_eq!(vars, [expected]);
        grid.read_root_end().unwrap();
    }
}
