use std::collections::HashSet;
use std::path::PathBuf;

use actix::prelude::*;
use async_trait::async_trait;

use crate::core::error::DownloadError;
use crate::core::record::{DownloadRecord, DownloadState};

/// 一个在途传输任务的句柄
///
/// 任务通过打在自身上的下载 ID 与记录关联；没有 ID 的任务
/// 无法归属，会在枚举时被引擎丢弃并取消。
#[derive(Debug, Clone)]
pub struct TransferTask {
    /// 所属引擎名，仅用于日志
    pub engine: &'static str,
    pub download_id: Option<String>,
}

impl TransferTask {
    pub fn new(engine: &'static str, download_id: impl Into<String>) -> Self {
        Self { engine, download_id: Some(download_id.into()) }
    }

    pub fn download_id(&self) -> Result<&str, DownloadError> {
        self.download_id.as_deref().ok_or(DownloadError::UntaggedTask)
    }
}

/// 引擎 -> 编排器的状态回调消息
///
/// 这是引擎向编排器通信的唯一通道，方向单一，
/// 引擎从不持有记录本体。
#[derive(Debug, Message)]
#[rtype(result = "()")]
pub struct UpdateState {
    pub task: TransferTask,
    pub state: Option<DownloadState>,
    /// 引擎暂存好字节后的临时文件位置
    pub staged_path: Option<PathBuf>,
}

impl UpdateState {
    pub fn state(task: TransferTask, state: DownloadState) -> Self {
        Self { task, state: Some(state), staged_path: None }
    }

    pub fn completed(task: TransferTask, staged_path: PathBuf) -> Self {
        Self { task, state: Some(DownloadState::Completed), staged_path: Some(staged_path) }
    }
}

/// 引擎回调的投递端，由编排器在激活时绑定到每个引擎
pub type StateSink = Recipient<UpdateState>;

/// 传输引擎抽象：一类内容的实际传输后端
///
/// 引擎负责字节搬运和暂存，所有权威状态都在编排器一侧；
/// 引擎只持有不透明的下载 ID。
#[async_trait]
pub trait TransferEngine: Send + Sync {
    /// 引擎名，日志用
    fn name(&self) -> &'static str;

    /// 支持的文件扩展名集合，默认的 supports 判断依赖它
    fn supported_extensions(&self) -> &HashSet<String>;

    /// 该引擎是否能承担指定记录的传输
    ///
    /// 默认按本地相对路径的扩展名判断；没有扩展名的路径
    /// 无法归类，一律不支持。
    fn supports(&self, record: &DownloadRecord) -> bool {
        match record.file_extension() {
            Some(ext) => self.supported_extensions().contains(&ext),
            None => {
                log::error!(
                    "[{}] 本地路径没有文件扩展名，无法判断支持性: {}",
                    self.name(),
                    record.relative_local_path()
                );
                false
            }
        }
    }

    /// 绑定状态回调投递端，编排器激活时调用一次
    fn bind(&self, sink: StateSink);

    /// 开始下载（幂等）
    ///
    /// 已存在该 ID 的在途任务时恢复它而不是创建重复任务；
    /// 否则新建任务并打上下载 ID 标记，以便重启后可归属。
    async fn start(&self, record: &DownloadRecord) -> Result<(), DownloadError>;

    /// 暂停在途任务，任务不存在时返回 TaskNotFound
    ///
    /// 暂停生效期间该任务的进度回调必须被抑制，
    /// 防止迟到的进度上报把状态从已暂停拉回下载中。
    fn pause(&self, id: &str) -> Result<(), DownloadError>;

    /// 恢复已暂停的任务，任务不存在时返回 TaskNotFound
    fn resume(&self, id: &str) -> Result<(), DownloadError>;

    /// 取消在途任务（协作式，向任务发出停止请求即返回）
    fn cancel(&self, id: &str) -> Result<(), DownloadError>;

    /// 取消一个恢复阶段发现、但无法重建记录的孤儿任务
    fn cancel_task(&self, task: &TransferTask) -> Result<(), DownloadError>;

    /// 枚举后端已知的全部在途任务（例如跨进程重启幸存的任务）
    ///
    /// 没有下载 ID 标记的任务必须被丢弃并取消，不得泄漏。
    async fn pending_tasks(&self) -> Vec<TransferTask>;

    /// 按下载 ID 点查任务，按需恢复时使用
    async fn fetch_task(&self, id: &str) -> Option<TransferTask>;
}
