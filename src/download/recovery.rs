//! 本地残留文件恢复。
//!
//! 对比磁盘上的文件大小与任务记录中的进度，决定打开方式与修正后的进度。
//! 决策本身是纯函数 [`plan`]；真正打开文件的 [`open`] 在链接解析成功之后才调用。

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::path::Path;

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// 新建或清空文件，从 0 开始写。
    Create,
    /// 保留已有内容，从文件末尾继续写。
    Append,
    /// 截断到给定长度，从该位置继续写。
    TruncateAt(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPlan {
    /// 本地文件已完整，无需打开。
    Finished,
    Open { mode: OpenMode, current_size: u64 },
}

impl RecoveryPlan {
    pub fn current_size(&self, total_size: u64) -> u64 {
        match self {
            RecoveryPlan::Finished => total_size,
            RecoveryPlan::Open { current_size, .. } => *current_size,
        }
    }
}

/// 根据 `(本地大小, 已记录进度, 总大小)` 选择恢复分支。
pub fn plan(local_size: Option<u64>, current_size: u64, total_size: u64) -> RecoveryPlan {
    let Some(local) = local_size else {
        return RecoveryPlan::Open {
            mode: OpenMode::Create,
            current_size: 0,
        };
    };

    if local == total_size {
        return RecoveryPlan::Finished;
    }
    if local > total_size {
        return RecoveryPlan::Open {
            mode: OpenMode::Create,
            current_size: 0,
        };
    }

    // local < total
    if local <= current_size {
        // 记录的进度超前于磁盘时以磁盘为准
        return RecoveryPlan::Open {
            mode: OpenMode::Append,
            current_size: local,
        };
    }
    if current_size > 0 {
        RecoveryPlan::Open {
            mode: OpenMode::TruncateAt(current_size),
            current_size,
        }
    } else {
        RecoveryPlan::Open {
            mode: OpenMode::Create,
            current_size: 0,
        }
    }
}

/// 确保目标目录存在，并返回本地文件大小（不存在时为 `None`）。
pub fn inspect(path: &Path) -> io::Result<Option<u64>> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a regular file", path.display()),
        )),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// 按恢复分支打开文件，返回的句柄已定位到下一次写入的位置。
pub fn open(path: &Path, mode: OpenMode) -> io::Result<File> {
    let mut file = match mode {
        OpenMode::Create => OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?,
        OpenMode::Append | OpenMode::TruncateAt(_) => {
            OpenOptions::new().write(true).create(true).open(path)?
        }
    };

    match mode {
        OpenMode::Create => {}
        OpenMode::Append => {
            file.seek(SeekFrom::End(0))?;
        }
        OpenMode::TruncateAt(len) => {
            file.set_len(len)?;
            file.seek(SeekFrom::Start(len))?;
        }
    }
    debug!(target: "download", "opened {} with {:?}", path.display(), mode);
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn open_with(mode: OpenMode, current_size: u64) -> RecoveryPlan {
        RecoveryPlan::Open { mode, current_size }
    }

    #[test]
    fn absent_file_creates_from_zero() {
        assert_eq!(plan(None, 0, 100), open_with(OpenMode::Create, 0));
        assert_eq!(plan(None, 70, 100), open_with(OpenMode::Create, 0));
    }

    #[test]
    fn complete_file_is_finished() {
        assert_eq!(plan(Some(100), 0, 100), RecoveryPlan::Finished);
        assert_eq!(plan(Some(100), 100, 100), RecoveryPlan::Finished);
        assert_eq!(plan(Some(0), 0, 0), RecoveryPlan::Finished);
    }

    #[test]
    fn matching_progress_appends() {
        assert_eq!(plan(Some(40), 40, 100), open_with(OpenMode::Append, 40));
        assert_eq!(plan(Some(0), 0, 100), open_with(OpenMode::Append, 0));
    }

    #[test]
    fn progress_ahead_of_disk_is_corrected() {
        assert_eq!(
            plan(Some(300_000), 500_000, 900_000),
            open_with(OpenMode::Append, 300_000)
        );
    }

    #[test]
    fn disk_ahead_of_progress_truncates() {
        assert_eq!(
            plan(Some(80), 30, 100),
            open_with(OpenMode::TruncateAt(30), 30)
        );
    }

    #[test]
    fn disk_ahead_of_zero_progress_restarts() {
        assert_eq!(plan(Some(80), 0, 100), open_with(OpenMode::Create, 0));
    }

    #[test]
    fn oversized_file_restarts() {
        assert_eq!(plan(Some(150), 100, 100), open_with(OpenMode::Create, 0));
        assert_eq!(plan(Some(150), 20, 100), open_with(OpenMode::Create, 0));
    }

    #[test]
    fn inspect_creates_missing_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("file.bin");
        assert_eq!(inspect(&path).unwrap(), None);
        assert!(dir.path().join("a").join("b").is_dir());

        fs::write(&path, b"hello").unwrap();
        assert_eq!(inspect(&path).unwrap(), Some(5));
    }

    #[test]
    fn truncate_discards_bytes_beyond_progress() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.bin");
        fs::write(&path, b"0123456789").unwrap();

        let mut file = open(&path, OpenMode::TruncateAt(4)).unwrap();
        file.write_all(b"ab").unwrap();
        drop(file);

        assert_eq!(fs::read(&path).unwrap(), b"0123ab");
    }

    #[test]
    fn append_keeps_existing_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.bin");
        fs::write(&path, b"0123").unwrap();

        let mut file = open(&path, OpenMode::Append).unwrap();
        file.write_all(b"45").unwrap();
        drop(file);

        assert_eq!(fs::read(&path).unwrap(), b"012345");
    }

    #[test]
    fn create_truncates_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.bin");
        fs::write(&path, b"stale-content").unwrap();

        let mut file = open(&path, OpenMode::Create).unwrap();
        file.write_all(b"new").unwrap();
        drop(file);

        assert_eq!(fs::read(&path).unwrap(), b"new");
    }
}
