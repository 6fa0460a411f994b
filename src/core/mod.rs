//! Core: 下载记录状态机、传输引擎抽象和编排器actor等核心逻辑模块

pub mod content;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod record;

// 只导出主流程和其它模块实际用到的类型
pub use content::{DownloadableContent, MediaVariant};
pub use engine::{StateSink, TransferEngine, TransferTask, UpdateState};
pub use error::{DownloadError, DownloadResult};
pub use orchestrator::{
    Activate, CancelDownload, ClearCompleted, ClearDownload, DownloadOrchestrator,
    DownloadSnapshot, GetDownload, ListDownloads, PauseDownload, ResumeDownload, RetryDownload,
    StartDownload,
};
pub use record::{DownloadRecord, DownloadState, ProgressStats};
