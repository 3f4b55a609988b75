//! 顺序写入器：按偏移递增写入分块，并按写入次数周期性落盘。

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::models::ByteRange;

/// 写入器底层的文件句柄。
pub trait ChunkFile: Write + Seek + Send {
    fn set_len(&self, len: u64) -> io::Result<()>;
    fn sync_data(&self) -> io::Result<()>;
}

impl ChunkFile for File {
    fn set_len(&self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }

    fn sync_data(&self) -> io::Result<()> {
        File::sync_data(self)
    }
}

pub struct FileWriter {
    path: PathBuf,
    file: Option<Box<dyn ChunkFile>>,
    offset: u64,
    writes_since_flush: u32,
    flush_threshold: u32,
    flush_count: u64,
}

impl FileWriter {
    /// `file` 必须已经定位到 `offset`（见 `recovery::open`）。
    pub fn new(
        path: impl Into<PathBuf>,
        file: Box<dyn ChunkFile>,
        offset: u64,
        flush_threshold: u32,
    ) -> Self {
        Self {
            path: path.into(),
            file: Some(file),
            offset,
            writes_since_flush: 0,
            flush_threshold: flush_threshold.max(1),
            flush_count: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// 已完成的强制落盘次数（不含关闭时的那一次）。
    pub fn flush_count(&self) -> u64 {
        self.flush_count
    }

    pub fn write_chunk(&mut self, range: ByteRange, bytes: &[u8]) -> io::Result<()> {
        let file = self.file.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "file handle already closed")
        })?;
        if range.start != self.offset {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "out-of-order write: range starts at {}, writer is at {}",
                    range.start, self.offset
                ),
            ));
        }
        if bytes.len() as u64 != range.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "chunk length {} does not match range length {}",
                    bytes.len(),
                    range.len()
                ),
            ));
        }

        file.write_all(bytes)?;
        self.offset = range.stop;
        self.writes_since_flush += 1;

        if self.writes_since_flush >= self.flush_threshold {
            file.flush()?;
            file.sync_data()?;
            self.writes_since_flush = 0;
            self.flush_count += 1;
            debug!(target: "download", "flushed {} at {}", self.path.display(), self.offset);
        }
        Ok(())
    }

    /// 丢弃 `pos` 之后的内容，下一次写入从 `pos` 开始。
    pub fn rewind(&mut self, pos: u64) -> io::Result<()> {
        let file = self.file.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "file handle already closed")
        })?;
        file.set_len(pos)?;
        file.seek(SeekFrom::Start(pos))?;
        self.offset = pos;
        Ok(())
    }

    /// 落盘并关闭句柄；重复调用无副作用。
    pub fn close(&mut self) -> io::Result<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        file.flush()?;
        file.sync_data()?;
        self.writes_since_flush = 0;
        Ok(())
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(target: "download", "closing {} failed: {}", self.path.display(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::recovery::{self, OpenMode};
    use std::fs;
    use tempfile::tempdir;

    fn writer_at(path: &Path, threshold: u32) -> FileWriter {
        let file = recovery::open(path, OpenMode::Create).unwrap();
        FileWriter::new(path, Box::new(file), 0, threshold)
    }

    #[test]
    fn flushes_every_kth_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let mut writer = writer_at(&path, 3);

        for i in 0..7u64 {
            let range = ByteRange {
                start: i * 2,
                stop: i * 2 + 2,
            };
            writer.write_chunk(range, &[i as u8; 2]).unwrap();
            let expected = (i + 1) / 3;
            assert_eq!(writer.flush_count(), expected, "after write {}", i + 1);
        }
        assert_eq!(writer.offset(), 14);
        writer.close().unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 14);
    }

    #[test]
    fn rejects_out_of_order_range() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let mut writer = writer_at(&path, 5);

        let err = writer
            .write_chunk(ByteRange { start: 4, stop: 8 }, &[0; 4])
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(writer.offset(), 0);
    }

    #[test]
    fn rewind_drops_partial_chunk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let mut writer = writer_at(&path, 5);

        writer
            .write_chunk(ByteRange { start: 0, stop: 3 }, b"abc")
            .unwrap();
        writer
            .write_chunk(ByteRange { start: 3, stop: 6 }, b"def")
            .unwrap();
        writer.rewind(3).unwrap();
        writer
            .write_chunk(ByteRange { start: 3, stop: 6 }, b"xyz")
            .unwrap();
        writer.close().unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"abcxyz");
    }

    #[test]
    fn close_is_idempotent_and_blocks_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let mut writer = writer_at(&path, 5);

        writer.close().unwrap();
        writer.close().unwrap();
        assert!(!writer.is_open());
        let err = writer
            .write_chunk(ByteRange { start: 0, stop: 1 }, b"a")
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}
