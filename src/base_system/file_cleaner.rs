//! 下载残留文件清理。

use std::fs;
use std::io;
use std::path::Path;

/// 删除文件；文件本就不存在时返回 `Ok(false)`。
pub fn remove_file_if_exists(path: impl AsRef<Path>) -> io::Result<bool> {
    match fs::remove_file(path.as_ref()) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}
