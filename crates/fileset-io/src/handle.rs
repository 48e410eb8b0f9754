//! Seekable, buffered, endian-aware file handle (spec.md §4.1).
//!
//! A handle opened without [`OpenMode::ACCESS`] is a no-op stub: every
//! read/write/seek succeeds without touching a real file. This is what lets
//! every rank open every shard during [`crate::distributor::Distributor`]'s
//! collective open (so every rank agrees on file layout) while only the
//! ranks that actually own data perform I/O.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{FilesetError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode(u8);

impl OpenMode {
    pub const READ: OpenMode = OpenMode(0b0001);
    pub const WRITE: OpenMode = OpenMode(0b0010);
    pub const ACCESS: OpenMode = OpenMode(0b0100);
    pub const ENDIAN_SWAP: OpenMode = OpenMode(0b1000);

    pub fn contains(self, flag: OpenMode) -> bool {
        self.0 & flag.0 == flag.0
    }
}

impl std::ops::BitOr for OpenMode {
    type Output = OpenMode;
    fn bitor(self, rhs: OpenMode) -> OpenMode {
        OpenMode(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

/// Read-ahead scratch space. Tracks how much of `bytes` has already been
/// handed out so `detach` can rewind the underlying file to the true
/// logical position instead of silently dropping unread data.
struct ReadBuffer {
    capacity: usize,
    bytes: Vec<u8>,
    consumed: usize,
}

pub struct FileHandle {
    file: Option<File>,
    mode: OpenMode,
    read_buf: Option<ReadBuffer>,
    write_buf: Option<Vec<u8>>,
    /// Tracked even for no-op stub handles so `tell` stays meaningful.
    stub_pos: u64,
}

impl FileHandle {
    pub fn open(path: &Path, mode: OpenMode) -> Result<Self> {
        if !mode.contains(OpenMode::ACCESS) {
            return Ok(FileHandle {
                file: None,
                mode,
                read_buf: None,
                write_buf: None,
                stub_pos: 0,
            });
        }

        let mut options = OpenOptions::new();
        if mode.contains(OpenMode::READ) {
            options.read(true);
        }
        if mode.contains(OpenMode::WRITE) {
            options.write(true).create(true);
        }
        let file = options.open(path).map_err(|source| FilesetError::FileCreate {
            path: path.display().to_string(),
            source,
        })?;
        Ok(FileHandle {
            file: Some(file),
            mode,
            read_buf: None,
            write_buf: None,
            stub_pos: 0,
        })
    }

    pub fn is_access(&self) -> bool {
        self.file.is_some()
    }

    pub fn endian_swap(&self) -> bool {
        self.mode.contains(OpenMode::ENDIAN_SWAP)
    }

    pub fn close(self) -> Result<()> {
        // Explicit for API parity with spec.md §4.1; `Drop` would otherwise
        // silently swallow a final flush failure.
        let mut this = self;
        this.flush_write_buf()
    }

    fn flush_write_buf(&mut self) -> Result<()> {
        if let Some(buf) = self.write_buf.take() {
            if !buf.is_empty() {
                if let Some(file) = self.file.as_mut() {
                    file.write_all(&buf)?;
                }
                self.stub_pos += buf.len() as u64;
            }
        }
        Ok(())
    }

    fn drop_read_buf(&mut self) -> Result<()> {
        if let Some(buf) = self.read_buf.take() {
            let leftover = buf.bytes.len() - buf.consumed;
            if leftover > 0 {
                if let Some(file) = self.file.as_mut() {
                    file.seek(SeekFrom::Current(-(leftover as i64)))?;
                }
            }
        }
        Ok(())
    }

    pub fn attach_buffer(&mut self, capacity: usize) -> Result<()> {
        if capacity == 0 {
            return Err(FilesetError::InvalidBufferSize(capacity));
        }
        self.detach_buffer()?;
        if self.mode.contains(OpenMode::WRITE) {
            self.write_buf = Some(Vec::with_capacity(capacity));
        } else {
            self.read_buf = Some(ReadBuffer {
                capacity,
                bytes: Vec::new(),
                consumed: 0,
            });
        }
        Ok(())
    }

    pub fn detach_buffer(&mut self) -> Result<()> {
        self.flush_write_buf()?;
        self.drop_read_buf()
    }

    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64> {
        self.detach_buffer()?;
        let Some(file) = self.file.as_mut() else {
            self.stub_pos = match whence {
                Whence::Set => offset.max(0) as u64,
                Whence::Cur => (self.stub_pos as i64 + offset).max(0) as u64,
                Whence::End => self.stub_pos,
            };
            return Ok(self.stub_pos);
        };
        let pos = match whence {
            Whence::Set => SeekFrom::Start(offset as u64),
            Whence::Cur => SeekFrom::Current(offset),
            Whence::End => SeekFrom::End(offset),
        };
        Ok(file.seek(pos)?)
    }

    /// Current byte position, usable on both real and stub handles.
    pub fn tell(&mut self) -> Result<u64> {
        self.detach_buffer()?;
        match self.file.as_mut() {
            Some(file) => Ok(file.stream_position()?),
            None => Ok(self.stub_pos),
        }
    }

    fn fill_read_buf_if_needed(&mut self, needed: usize) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        let Some(buf) = self.read_buf.as_mut() else {
            return Ok(());
        };
        let remaining = buf.bytes.len() - buf.consumed;
        if remaining >= needed {
            return Ok(());
        }
        // Compact then top up to capacity (or at least `needed`).
        buf.bytes.drain(0..buf.consumed);
        buf.consumed = 0;
        let target = needed.max(buf.capacity);
        let mut chunk = vec![0u8; target - buf.bytes.len()];
        let read = read_best_effort(file, &mut chunk)?;
        chunk.truncate(read);
        buf.bytes.extend_from_slice(&chunk);
        Ok(())
    }

    fn read_raw(&mut self, out: &mut [u8]) -> Result<()> {
        if self.file.is_none() {
            out.fill(0);
            self.stub_pos += out.len() as u64;
            return Ok(());
        }
        if self.read_buf.is_some() {
            self.fill_read_buf_if_needed(out.len())?;
            let buf = self.read_buf.as_mut().unwrap();
            let available = buf.bytes.len() - buf.consumed;
            if available < out.len() {
                return Err(FilesetError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "short read while filling attached buffer",
                )));
            }
            out.copy_from_slice(&buf.bytes[buf.consumed..buf.consumed + out.len()]);
            buf.consumed += out.len();
            return Ok(());
        }
        self.file.as_mut().unwrap().read_exact(out)?;
        Ok(())
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        if self.file.is_none() {
            self.stub_pos += data.len() as u64;
            return Ok(());
        }
        if let Some(buf) = self.write_buf.as_mut() {
            buf.extend_from_slice(data);
            if buf.len() >= buf.capacity() {
                let bytes = std::mem::take(buf);
                self.file.as_mut().unwrap().write_all(&bytes)?;
            }
            return Ok(());
        }
        self.file.as_mut().unwrap().write_all(data)?;
        Ok(())
    }

    fn maybe_swap(&self, bytes: &mut [u8], elem_size: usize) {
        if !self.endian_swap() {
            return;
        }
        for chunk in bytes.chunks_exact_mut(elem_size) {
            chunk.reverse();
        }
    }

    pub fn read_i32(&mut self, count: usize) -> Result<Vec<i32>> {
        let mut raw = vec![0u8; count * 4];
        self.read_raw(&mut raw)?;
        self.maybe_swap(&mut raw, 4);
        let mut out = vec![0i32; count];
        LittleEndian::read_i32_into(&raw, &mut out);
        Ok(out)
    }

    pub fn read_i64(&mut self, count: usize) -> Result<Vec<i64>> {
        let mut raw = vec![0u8; count * 8];
        self.read_raw(&mut raw)?;
        self.maybe_swap(&mut raw, 8);
        let mut out = vec![0i64; count];
        LittleEndian::read_i64_into(&raw, &mut out);
        Ok(out)
    }

    pub fn read_f32(&mut self, count: usize) -> Result<Vec<f32>> {
        let mut raw = vec![0u8; count * 4];
        self.read_raw(&mut raw)?;
        self.maybe_swap(&mut raw, 4);
        let mut out = vec![0f32; count];
        LittleEndian::read_f32_into(&raw, &mut out);
        Ok(out)
    }

    pub fn read_f64(&mut self, count: usize) -> Result<Vec<f64>> {
        let mut raw = vec![0u8; count * 8];
        self.read_raw(&mut raw)?;
        self.maybe_swap(&mut raw, 8);
        let mut out = vec![0f64; count];
        LittleEndian::read_f64_into(&raw, &mut out);
        Ok(out)
    }

    pub fn write_i32(&mut self, values: &[i32]) -> Result<()> {
        let mut raw = vec![0u8; values.len() * 4];
        LittleEndian::write_i32_into(values, &mut raw);
        self.write_raw(&raw)
    }

    pub fn write_i64(&mut self, values: &[i64]) -> Result<()> {
        let mut raw = vec![0u8; values.len() * 8];
        LittleEndian::write_i64_into(values, &mut raw);
        self.write_raw(&raw)
    }

    pub fn write_f32(&mut self, values: &[f32]) -> Result<()> {
        let mut raw = vec![0u8; values.len() * 4];
        LittleEndian::write_f32_into(values, &mut raw);
        self.write_raw(&raw)
    }

    pub fn write_f64(&mut self, values: &[f64]) -> Result<()> {
        let mut raw = vec![0u8; values.len() * 8];
        LittleEndian::write_f64_into(values, &mut raw);
        self.write_raw(&raw)
    }
}

/// `Read::read` short-reads are valid; loop until either `buf` is full or we
/// hit genuine EOF, matching `read_exact` semantics but tolerating EOF by
/// returning the partial length instead of erroring.
fn read_best_effort(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match file.read(&mut buf[total..])? {
            0 => break,
            n => total += n,
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_handle_reads_zeros_and_tracks_position() {
        let mut h = FileHandle::open(Path::new("/nonexistent"), OpenMode::READ).unwrap();
        assert!(!h.is_access());
        let v = h.read_i32(3).unwrap();
        assert_eq!(v, vec![0, 0, 0]);
        assert_eq!(h.seek(0, Whence::Cur).unwrap(), 12);
    }

    #[test]
    fn write_then_read_round_trips_typed_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard.bin");
        {
            let mut h =
                FileHandle::open(&path, OpenMode::WRITE | OpenMode::ACCESS).unwrap();
            h.write_i64(&[1, 2, 3]).unwrap();
            h.write_f32(&[1.5, 2.5]).unwrap();
            h.close().unwrap();
        }
        let mut h = FileHandle::open(&path, OpenMode::READ | OpenMode::ACCESS).unwrap();
        assert_eq!(h.read_i64(3).unwrap(), vec![1, 2, 3]);
        assert_eq!(h.read_f32(2).unwrap(), vec![1.5, 2.5]);
    }

    #[test]
    fn endian_swap_flips_bytes_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard.bin");
        {
            let mut h =
                FileHandle::open(&path, OpenMode::WRITE | OpenMode::ACCESS).unwrap();
            h.write_i32(&[0x0102_0304]).unwrap();
            h.close().unwrap();
        }
        let mut h = FileHandle::open(
            &path,
            OpenMode::READ | OpenMode::ACCESS | OpenMode::ENDIAN_SWAP,
        )
        .unwrap();
        assert_eq!(h.read_i32(1).unwrap(), vec![0x0403_0201]);
    }

    #[test]
    fn attach_buffer_read_ahead_then_detach_preserves_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard.bin");
        {
            let mut h =
                FileHandle::open(&path, OpenMode::WRITE | OpenMode::ACCESS).unwrap();
            h.write_i32(&[10, 20, 30, 40]).unwrap();
            h.close().unwrap();
        }
        let mut h = FileHandle::open(&path, OpenMode::READ | OpenMode::ACCESS).unwrap();
        h.attach_buffer(16).unwrap(); // reads ahead all 16 bytes
        assert_eq!(h.read_i32(1).unwrap(), vec![10]);
        h.detach_buffer().unwrap(); // must rewind the unread 12 bytes
        assert_eq!(h.read_i32(3).unwrap(), vec![20, 30, 40]);
    }

    #[test]
    fn attach_buffer_rejects_zero_capacity() {
        let mut h = FileHandle::open(Path::new("/nonexistent"), OpenMode::READ).unwrap();
        assert!(matches!(
            h.attach_buffer(0),
            Err(FilesetError::InvalidBufferSize(0))
        ));
    }
}
