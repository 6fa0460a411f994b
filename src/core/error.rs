use thiserror::Error;
use std::io;

use crate::core::record::DownloadState;

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("网络错误: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("IO错误: {0}")]
    IoError(#[from] io::Error),

    #[error("元数据序列化错误: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("无效的URL: {0}")]
    InvalidUrl(String),

    #[error("无效的本地相对路径: {0}")]
    InvalidLocalPath(String),

    #[error("内容已下载完成: {0}，请先删除现有文件再重新下载")]
    AlreadyDownloaded(String),

    #[error("下载已存在: {0}")]
    AlreadyExists(String),

    #[error("没有可下载的变体: {0}")]
    NoDownloadableVariant(String),

    #[error("找不到下载记录: {0}")]
    RecordNotFound(String),

    #[error("找不到元数据: {0}")]
    MetadataNotFound(String),

    #[error("找不到传输任务: {0}")]
    TaskNotFound(String),

    #[error("传输任务缺少下载ID标记")]
    UntaggedTask,

    #[error("找不到支持 {0} 的传输引擎")]
    EngineNotFound(String),

    #[error("非法状态转换: {from} -> {to}")]
    RejectedTransition {
        from: DownloadState,
        to: DownloadState,
    },

    #[error("只有失败的下载才能重试，当前状态: {0}")]
    NotRetryable(DownloadState),

    #[error("当前状态不允许从列表移除: {0}")]
    NotRemovable(DownloadState),

    #[error("下载 {0} 已完成但没有暂存文件")]
    MissingStagedFile(String),

    #[error("下载超时")]
    Timeout,

    #[error("服务器错误: {0}")]
    ServerError(String),

    #[error("未知错误: {0}")]
    Unknown(String),
}

impl DownloadError {
    /// 瞬态错误，引擎内部可以退避后重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DownloadError::NetworkError(_) |
            DownloadError::Timeout |
            DownloadError::ServerError(_)
        )
    }

    /// 用户命令错误，可以直接展示给用户，不属于内部不变量破坏
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            DownloadError::AlreadyDownloaded(_) |
            DownloadError::AlreadyExists(_) |
            DownloadError::NoDownloadableVariant(_) |
            DownloadError::NotRetryable(_) |
            DownloadError::NotRemovable(_) |
            DownloadError::RecordNotFound(_)
        )
    }
}

impl From<String> for DownloadError {
    fn from(error: String) -> Self {
        DownloadError::Unknown(error)
    }
}

impl From<&str> for DownloadError {
    fn from(error: &str) -> Self {
        DownloadError::Unknown(error.to_string())
    }
}

pub type DownloadResult<T> = Result<T, DownloadError>;
