//! Binary framing for the `.art` parameter header: a magic + endianness
//! fingerprint followed by a flat run of `(key, typed value)` frames.
//!
//! Frame shape, all integers little-endian on disk:
//! `i32 key_len | key_len bytes | i32 type_tag | i32 count | count * value`
//! Strings are length-prefixed (`i32 len | len bytes`) per array element.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{ParamError, ParamTable, ParamValue};

const MAGIC: &[u8; 6] = b"ARTIO1";
/// Written native-endian; a reader that decodes this as anything other than
/// `ENDIAN_FINGERPRINT` knows the file was written on a machine of the
/// opposite endianness and must byte-swap every subsequent typed read.
const ENDIAN_FINGERPRINT: i32 = 0x0102_0304;

fn type_tag(value: &ParamValue) -> i32 {
    match value {
        ParamValue::Int32(_) => 0,
        ParamValue::Int64(_) => 1,
        ParamValue::Float32(_) => 2,
        ParamValue::Float64(_) => 3,
        ParamValue::Str(_) => 4,
    }
}

pub fn write_table<W: Write>(w: &mut W, table: &ParamTable) -> io::Result<()> {
    w.write_all(MAGIC)?;
    w.write_i32::<LittleEndian>(ENDIAN_FINGERPRINT)?;
    for key in table.keys() {
        let value = table.get_raw(key).expect("key came from keys()");
        write_entry(w, key, value)?;
    }
    Ok(())
}

fn write_entry<W: Write>(w: &mut W, key: &str, value: &ParamValue) -> io::Result<()> {
    let key_bytes = key.as_bytes();
    w.write_i32::<LittleEndian>(key_bytes.len() as i32)?;
    w.write_all(key_bytes)?;
    w.write_i32::<LittleEndian>(type_tag(value))?;
    match value {
        ParamValue::Int32(v) => {
            w.write_i32::<LittleEndian>(v.len() as i32)?;
            for x in v {
                w.write_i32::<LittleEndian>(*x)?;
            }
        }
        ParamValue::Int64(v) => {
            w.write_i32::<LittleEndian>(v.len() as i32)?;
            for x in v {
                w.write_i64::<LittleEndian>(*x)?;
            }
        }
        ParamValue::Float32(v) => {
            w.write_i32::<LittleEndian>(v.len() as i32)?;
            for x in v {
                w.write_f32::<LittleEndian>(*x)?;
            }
        }
        ParamValue::Float64(v) => {
            w.write_i32::<LittleEndian>(v.len() as i32)?;
            for x in v {
                w.write_f64::<LittleEndian>(*x)?;
            }
        }
        ParamValue::Str(v) => {
            w.write_i32::<LittleEndian>(v.len() as i32)?;
            for s in v {
                let bytes = s.as_bytes();
                w.write_i32::<LittleEndian>(bytes.len() as i32)?;
                w.write_all(bytes)?;
            }
        }
    }
    Ok(())
}

/// Returns the decoded table and whether the caller must byte-swap typed
/// reads elsewhere in the fileset (grid/particle shards were written with
/// the same native endianness as this header).
pub fn read_table<R: Read>(r: &mut R) -> Result<(ParamTable, bool), ParamError> {
    let mut magic = [0u8; 6];
    r.read_exact(&mut magic).map_err(ParamError::Io)?;
    if &magic != MAGIC {
        return Err(ParamError::BadMagic);
    }
    let fingerprint = r.read_i32::<LittleEndian>().map_err(ParamError::Io)?;
    let needs_swap = fingerprint.swap_bytes() == ENDIAN_FINGERPRINT;
    if fingerprint != ENDIAN_FINGERPRINT && !needs_swap {
        return Err(ParamError::BadMagic);
    }

    let mut table = ParamTable::new();
    loop {
        let key_len = match r.read_i32::<LittleEndian>() {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(ParamError::Io(e)),
        };
        let key_len = maybe_swap_i32(key_len, needs_swap);
        let mut key_bytes = vec![0u8; key_len as usize];
        r.read_exact(&mut key_bytes).map_err(ParamError::Io)?;
        let key = String::from_utf8(key_bytes).map_err(|_| ParamError::BadMagic)?;

        let tag = maybe_swap_i32(r.read_i32::<LittleEndian>().map_err(ParamError::Io)?, needs_swap);
        let count = maybe_swap_i32(r.read_i32::<LittleEndian>().map_err(ParamError::Io)?, needs_swap) as usize;
        let value = read_value(r, tag, count, needs_swap)?;
        table.set_raw(key, value);
    }
    Ok((table, needs_swap))
}

fn maybe_swap_i32(v: i32, swap: bool) -> i32 {
    if swap { v.swap_bytes() } else { v }
}

fn read_value<R: Read>(
    r: &mut R,
    tag: i32,
    count: usize,
    swap: bool,
) -> Result<ParamValue, ParamError> {
    Ok(match tag {
        0 => {
            let mut v = Vec::with_capacity(count);
            for _ in 0..count {
                let x = r.read_i32::<LittleEndian>().map_err(ParamError::Io)?;
                v.push(if swap { x.swap_bytes() } else { x });
            }
            ParamValue::Int32(v)
        }
        1 => {
            let mut v = Vec::with_capacity(count);
            for _ in 0..count {
                let x = r.read_i64::<LittleEndian>().map_err(ParamError::Io)?;
                v.push(if swap { x.swap_bytes() } else { x });
            }
            ParamValue::Int64(v)
        }
        2 => {
            let mut v = Vec::with_capacity(count);
            for _ in 0..count {
                let bits = r.read_u32::<LittleEndian>().map_err(ParamError::Io)?;
                let bits = if swap { bits.swap_bytes() } else { bits };
                v.push(f32::from_bits(bits));
            }
            ParamValue::Float32(v)
        }
        3 => {
            let mut v = Vec::with_capacity(count);
            for _ in 0..count {
                let bits = r.read_u64::<LittleEndian>().map_err(ParamError::Io)?;
                let bits = if swap { bits.swap_bytes() } else { bits };
                v.push(f64::from_bits(bits));
            }
            ParamValue::Float64(v)
        }
        4 => {
            let mut v = Vec::with_capacity(count);
            for _ in 0..count {
                let len = maybe_swap_i32(r.read_i32::<LittleEndian>().map_err(ParamError::Io)?, swap);
                let mut bytes = vec![0u8; len as usize];
                r.read_exact(&mut bytes).map_err(ParamError::Io)?;
                v.push(String::from_utf8(bytes).map_err(|_| ParamError::BadMagic)?);
            }
            ParamValue::Str(v)
        }
        other => return Err(ParamError::UnknownTypeTag(other)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_mixed_types() {
        let mut table = ParamTable::new();
        table.set_int32("num_root_cells", &[64]);
        table.set_int64("grid_file_sfc_index", &[0, 16, 32, 48, 64]);
        table.set_float64("box_size", &[1.0, 2.5]);
        table.set_string("grid_variable_labels", &["density".into(), "pressure".into()]);

        let mut buf = Vec::new();
        write_table(&mut buf, &table).unwrap();
        let (decoded, swapped) = read_table(&mut &buf[..]).unwrap();
        assert!(!swapped);
        assert_eq!(decoded.get_int32("num_root_cells").unwrap(), &[64]);
        assert_eq!(
            decoded.get_int64("grid_file_sfc_index").unwrap(),
            &[0, 16, 32, 48, 64]
        );
        assert_eq!(decoded.get_float64("box_size").unwrap(), &[1.0, 2.5]);
        assert_eq!(
            decoded.get_string("grid_variable_labels").unwrap(),
            &["density".to_string(), "pressure".to_string()]
        );
    }

    #[test]
    fn bad_magic_is_rejected() {
        let buf = b"NOTART".to_vec();
        assert!(matches!(
            read_table(&mut &buf[..]),
            Err(ParamError::BadMagic)
        ));
    }
}
