//! Store: 下载记录元数据的持久化契约与文件系统实现
//!
//! 编排器通过 `MetadataStore` 在进程重启后恢复下载记录；
//! 存储里保存的是序列化快照，不是活引用。

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::error::DownloadError;
use crate::core::record::DownloadRecord;

/// 元数据存储契约
///
/// 单条记录的写入必须是崩溃安全的（原子替换或等价手段），
/// 不要求跨记录事务。读取可以与写入并发，但同一个 key
/// 只会由编排器的串行区写入，不存在双写。
pub trait MetadataStore: Send + Sync {
    /// 已持久化的全部下载 ID
    fn persisted_identifiers(&self) -> Result<HashSet<String>, DownloadError>;

    /// 按 ID 读取记录快照
    fn fetch(&self, id: &str) -> Result<DownloadRecord, DownloadError>;

    /// 写入（覆盖）记录快照
    fn persist(&self, record: &DownloadRecord) -> Result<(), DownloadError>;

    /// 删除记录快照，key 不存在时也视为成功
    fn remove(&self, id: &str) -> Result<(), DownloadError>;
}

/// 文件系统实现：每条记录一个 `<id>.json`
///
/// 写入先落到 `<id>.json.tmp` 再 rename，保证单条记录原子替换。
pub struct FsMetadataStore {
    directory: PathBuf,
}

const META_EXTENSION: &str = "json";

impl FsMetadataStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self { directory: directory.into() }
    }

    fn file_path(&self, id: &str) -> PathBuf {
        self.directory.join(format!("{}.{}", id, META_EXTENSION))
    }

    fn ensure_directory(&self) -> Result<(), DownloadError> {
        fs::create_dir_all(&self.directory)?;
        Ok(())
    }
}

impl MetadataStore for FsMetadataStore {
    fn persisted_identifiers(&self) -> Result<HashSet<String>, DownloadError> {
        if !self.directory.exists() {
            return Ok(HashSet::new());
        }

        let mut ids = HashSet::new();
        for entry in fs::read_dir(&self.directory)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(META_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.insert(stem.to_string());
            }
        }
        Ok(ids)
    }

    fn fetch(&self, id: &str) -> Result<DownloadRecord, DownloadError> {
        let path = self.file_path(id);
        if !path.exists() {
            return Err(DownloadError::MetadataNotFound(id.to_string()));
        }

        let data = fs::read_to_string(&path)?;
        let record = serde_json::from_str(&data)?;
        Ok(record)
    }

    fn persist(&self, record: &DownloadRecord) -> Result<(), DownloadError> {
        self.ensure_directory()?;

        let json = serde_json::to_string_pretty(record)?;
        let path = self.file_path(record.id());
        let tmp_path = path.with_extension(format!("{}.tmp", META_EXTENSION));

        fs::write(&tmp_path, json)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<(), DownloadError> {
        let path = self.file_path(id);
        if !path.exists() {
            log::warn!("要删除的元数据不存在: {}", id);
            return Ok(());
        }

        fs::remove_file(&path)?;
        Ok(())
    }
}

/// 确保目录存在，move-into-place 创建目标目录时使用
///
/// 兄弟路径的并发创建不会导致失败。
pub fn create_dir_if_needed(path: &Path) -> Result<(), DownloadError> {
    match fs::create_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e.into()),
    }
}
