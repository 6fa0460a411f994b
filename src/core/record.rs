use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::core::error::DownloadError;

/// 下载状态机
///
/// 状态只能沿转换表前进，进入终态（`Completed` / `Cancelled`）后
/// 任何转换都会被拒绝。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DownloadState {
    Waiting,
    Downloading { progress: f32 },
    Paused { progress: f32 },
    Failed { message: String },
    Completed,
    Cancelled,
}

impl DownloadState {
    /// 终态：完成或已取消，之后记录不可再变更
    pub fn is_final(&self) -> bool {
        matches!(self, DownloadState::Completed | DownloadState::Cancelled)
    }

    /// 可续传状态
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            DownloadState::Paused { .. } | DownloadState::Failed { .. } | DownloadState::Cancelled
        )
    }

    /// 用户可以手动从列表移除的状态
    pub fn is_removable(&self) -> bool {
        matches!(
            self,
            DownloadState::Completed | DownloadState::Cancelled | DownloadState::Failed { .. }
        )
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, DownloadState::Completed)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DownloadState::Cancelled)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, DownloadState::Failed { .. })
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, DownloadState::Paused { .. })
    }

    /// 当前进度，只有下载中/已暂停状态才有
    pub fn progress(&self) -> Option<f32> {
        match self {
            DownloadState::Downloading { progress } | DownloadState::Paused { progress } => {
                Some(*progress)
            }
            _ => None,
        }
    }

    /// 带当前进度的暂停状态（纯函数，幂等）
    ///
    /// 从其它状态暂停时进度为 0，对应"进度尚未上报就请求暂停"的场景。
    pub fn paused(&self) -> DownloadState {
        match self {
            DownloadState::Downloading { progress } | DownloadState::Paused { progress } => {
                DownloadState::Paused { progress: *progress }
            }
            _ => DownloadState::Paused { progress: 0.0 },
        }
    }

    /// 状态种类是否相同（忽略进度/消息参数）
    pub fn same_kind(&self, other: &DownloadState) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadState::Waiting => write!(f, "等待中"),
            DownloadState::Downloading { progress } => {
                write!(f, "下载中 ({}%)", (progress * 100.0) as u32)
            }
            DownloadState::Paused { progress } => {
                write!(f, "已暂停 ({}%)", (progress * 100.0) as u32)
            }
            DownloadState::Failed { message } => write!(f, "失败: {}", message),
            DownloadState::Completed => write!(f, "已完成"),
            DownloadState::Cancelled => write!(f, "已取消"),
        }
    }
}

/// 一条下载记录：单个媒体文件下载的身份与状态
///
/// `id` / `remote_url` / `relative_local_path` 创建后不可变，
/// 状态只能由编排器按转换表推进。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRecord {
    id: String,
    title: String,
    remote_url: Url,
    relative_local_path: String,
    created_at: DateTime<Utc>,
    /// 引擎暂存文件位置，完成移动到最终位置后清除
    temporary_local_path: Option<PathBuf>,
    state: DownloadState,
}

impl DownloadRecord {
    pub fn new(id: String, title: String, remote_url: Url, relative_local_path: String) -> Self {
        Self {
            id,
            title,
            remote_url,
            relative_local_path,
            created_at: Utc::now(),
            temporary_local_path: None,
            state: DownloadState::Waiting,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn remote_url(&self) -> &Url {
        &self.remote_url
    }

    pub fn relative_local_path(&self) -> &str {
        &self.relative_local_path
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn temporary_local_path(&self) -> Option<&PathBuf> {
        self.temporary_local_path.as_ref()
    }

    pub fn state(&self) -> &DownloadState {
        &self.state
    }

    /// 本地相对路径的文件扩展名（小写），引擎选择用
    pub fn file_extension(&self) -> Option<String> {
        self.relative_local_path
            .rsplit('.')
            .next()
            .filter(|ext| !ext.is_empty() && !ext.contains('/'))
            .map(|ext| ext.to_lowercase())
    }

    pub fn set_temporary_local_path(&mut self, path: Option<PathBuf>) {
        self.temporary_local_path = path;
    }

    /// 应用一次状态转换，非法转换返回错误而不是静默忽略
    ///
    /// 转换表：
    /// - Waiting      -> 任意
    /// - Downloading  -> Downloading(进度不回退) | Paused | Failed | Completed | Cancelled
    /// - Paused       -> Waiting | Downloading | Paused | Failed | Cancelled
    /// - Failed       -> Waiting（仅显式重试）
    /// - 终态         -> 拒绝一切
    pub fn apply_transition(&mut self, new_state: DownloadState) -> Result<(), DownloadError> {
        self.check_transition(&new_state)?;
        self.state = new_state;
        Ok(())
    }

    /// 校验一次状态转换是否被转换表允许，不修改记录
    ///
    /// 终态带副作用（完成后的文件移动）时先校验，副作用成功后
    /// 再真正应用。
    pub fn check_transition(&self, new_state: &DownloadState) -> Result<(), DownloadError> {
        use DownloadState::*;

        let allowed = match (&self.state, new_state) {
            (Completed | Cancelled, _) => false,
            (Waiting, _) => true,
            (Downloading { progress: current }, Downloading { progress: new }) => new >= current,
            (Downloading { .. }, Waiting) => false,
            (Downloading { .. }, _) => true,
            (Paused { .. }, Completed) => false,
            (Paused { .. }, _) => true,
            (Failed { .. }, Waiting) => true,
            (Failed { .. }, _) => false,
        };

        if !allowed {
            return Err(DownloadError::RejectedTransition {
                from: self.state.clone(),
                to: new_state.clone(),
            });
        }
        Ok(())
    }

    /// 判断一次状态更新是否需要落盘
    ///
    /// 状态种类变化总是持久化；下载中的进度更新只有相对上次
    /// 持久化的进度超过阈值才落盘，限制写放大。
    pub fn should_persist(
        &self,
        new_state: &DownloadState,
        last_persisted_progress: Option<f32>,
        threshold: f32,
    ) -> bool {
        if !self.state.same_kind(new_state) {
            return true;
        }

        if let DownloadState::Downloading { progress: new } = new_state {
            let last = last_persisted_progress.unwrap_or(0.0);
            return (new - last).abs() >= threshold;
        }

        *new_state != self.state
    }
}

// ================== 进度统计（派生数据，不持久化） ==================

/// 下载进度统计：经过时间与预估剩余时间
///
/// 只在下载中状态更新，由编排器维护，与记录本身分离。
#[derive(Debug, Clone)]
pub struct ProgressStats {
    started: Instant,
    last_progress: f32,
    pub eta_seconds: Option<u64>,
}

/// 低于该进度不估算 ETA，避免早期样本抖动
const MIN_PROGRESS_FOR_ETA: f32 = 0.01;

impl ProgressStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            last_progress: 0.0,
            eta_seconds: None,
        }
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn update(&mut self, progress: f32) {
        self.last_progress = progress;

        let elapsed = self.started.elapsed().as_secs_f64();
        if progress > MIN_PROGRESS_FOR_ETA && elapsed > 0.0 {
            let rate = progress as f64 / elapsed;
            if rate > 0.0 {
                self.eta_seconds = Some(((1.0 - progress as f64) / rate).max(0.0) as u64);
            }
        }
    }

    /// 格式化 ETA，小时以上为 HH:MM:SS，否则 MM:SS
    pub fn formatted_eta(&self) -> Option<String> {
        self.eta_seconds.map(|total| {
            let seconds = total % 60;
            let minutes = (total / 60) % 60;
            let hours = total / 3600;

            if hours >= 1 {
                format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
            } else {
                format!("{:02}:{:02}", minutes, seconds)
            }
        })
    }
}

impl Default for ProgressStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_record(id: &str) -> DownloadRecord {
        DownloadRecord::new(
            id.to_string(),
            "测试视频".to_string(),
            Url::parse("https://example.com/videos/s1.mp4").unwrap(),
            "2024/S1.mp4".to_string(),
        )
    }

    #[test]
    fn test_new_record_is_waiting() {
        let record = make_record("wwdc2024-101");
        assert_eq!(*record.state(), DownloadState::Waiting);
        assert!(record.temporary_local_path().is_none());
        assert_eq!(record.file_extension().as_deref(), Some("mp4"));
    }

    #[test]
    fn test_forward_transitions() {
        let mut record = make_record("a");
        assert!(record.apply_transition(DownloadState::Downloading { progress: 0.0 }).is_ok());
        assert!(record.apply_transition(DownloadState::Downloading { progress: 0.34 }).is_ok());
        assert!(record.apply_transition(DownloadState::Paused { progress: 0.34 }).is_ok());
        assert!(record.apply_transition(DownloadState::Downloading { progress: 0.34 }).is_ok());
        assert!(record.apply_transition(DownloadState::Completed).is_ok());
    }

    #[test]
    fn test_no_mutation_after_terminal() {
        let mut record = make_record("a");
        record.apply_transition(DownloadState::Completed).unwrap();

        for state in [
            DownloadState::Waiting,
            DownloadState::Downloading { progress: 0.5 },
            DownloadState::Paused { progress: 0.5 },
            DownloadState::Failed { message: "x".to_string() },
            DownloadState::Cancelled,
        ] {
            let result = record.apply_transition(state);
            assert!(matches!(result, Err(DownloadError::RejectedTransition { .. })));
        }
        assert_eq!(*record.state(), DownloadState::Completed);

        let mut cancelled = make_record("b");
        cancelled.apply_transition(DownloadState::Cancelled).unwrap();
        assert!(cancelled.apply_transition(DownloadState::Waiting).is_err());
    }

    #[test]
    fn test_progress_never_regresses_while_downloading() {
        let mut record = make_record("a");
        record.apply_transition(DownloadState::Downloading { progress: 0.41 }).unwrap();
        let result = record.apply_transition(DownloadState::Downloading { progress: 0.34 });
        assert!(matches!(result, Err(DownloadError::RejectedTransition { .. })));
        assert_eq!(record.state().progress(), Some(0.41));
    }

    #[test]
    fn test_check_transition_does_not_mutate() {
        let mut record = make_record("a");
        record.apply_transition(DownloadState::Downloading { progress: 0.5 }).unwrap();

        assert!(record.check_transition(&DownloadState::Completed).is_ok());
        assert_eq!(record.state().progress(), Some(0.5));
        assert!(!record.state().is_completed());

        record.apply_transition(DownloadState::Paused { progress: 0.5 }).unwrap();
        assert!(matches!(
            record.check_transition(&DownloadState::Completed),
            Err(DownloadError::RejectedTransition { .. })
        ));
    }

    #[test]
    fn test_failed_only_restarts_via_waiting() {
        let mut record = make_record("a");
        record.apply_transition(DownloadState::Failed { message: "timeout".to_string() }).unwrap();
        assert!(record.apply_transition(DownloadState::Downloading { progress: 0.1 }).is_err());
        assert!(record.apply_transition(DownloadState::Waiting).is_ok());
    }

    #[test]
    fn test_paused_helper() {
        assert_eq!(
            DownloadState::Downloading { progress: 0.34 }.paused(),
            DownloadState::Paused { progress: 0.34 }
        );
        // 幂等
        assert_eq!(
            DownloadState::Paused { progress: 0.5 }.paused(),
            DownloadState::Paused { progress: 0.5 }
        );
        // 还没有进度就请求暂停
        assert_eq!(DownloadState::Waiting.paused(), DownloadState::Paused { progress: 0.0 });
        assert_eq!(
            DownloadState::Failed { message: "x".to_string() }.paused(),
            DownloadState::Paused { progress: 0.0 }
        );
    }

    #[test]
    fn test_predicates() {
        assert!(DownloadState::Completed.is_final());
        assert!(DownloadState::Cancelled.is_final());
        assert!(!DownloadState::Failed { message: "x".to_string() }.is_final());

        assert!(DownloadState::Paused { progress: 0.2 }.is_resumable());
        assert!(DownloadState::Failed { message: "x".to_string() }.is_resumable());
        assert!(DownloadState::Cancelled.is_resumable());
        assert!(!DownloadState::Downloading { progress: 0.2 }.is_resumable());

        assert!(DownloadState::Completed.is_removable());
        assert!(DownloadState::Cancelled.is_removable());
        assert!(DownloadState::Failed { message: "x".to_string() }.is_removable());
        assert!(!DownloadState::Waiting.is_removable());
    }

    #[test]
    fn test_should_persist_threshold() {
        let mut record = make_record("a");
        record.apply_transition(DownloadState::Downloading { progress: 0.05 }).unwrap();

        // 种类变化总是持久化
        assert!(record.should_persist(&DownloadState::Paused { progress: 0.05 }, Some(0.0), 0.1));
        // 相对上次持久化的进度不足阈值
        assert!(!record.should_persist(&DownloadState::Downloading { progress: 0.08 }, Some(0.0), 0.1));
        // 超过阈值
        assert!(record.should_persist(&DownloadState::Downloading { progress: 0.12 }, Some(0.0), 0.1));
        // 从未持久化过进度时按 0 计
        assert!(record.should_persist(&DownloadState::Downloading { progress: 0.11 }, None, 0.1));
    }

    #[test]
    fn test_record_serde_roundtrip() {
        let mut record = make_record("wwdc2024-101");
        record.apply_transition(DownloadState::Downloading { progress: 0.34 }).unwrap();
        record.set_temporary_local_path(Some(PathBuf::from("/tmp/x.part")));

        let json = serde_json::to_string(&record).unwrap();
        let restored: DownloadRecord = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.id(), "wwdc2024-101");
        assert_eq!(restored.relative_local_path(), "2024/S1.mp4");
        assert_eq!(restored.state().progress(), Some(0.34));
        assert_eq!(restored.temporary_local_path(), Some(&PathBuf::from("/tmp/x.part")));
    }

    #[test]
    fn test_progress_stats_eta_format() {
        let mut stats = ProgressStats::new();
        stats.eta_seconds = Some(75);
        assert_eq!(stats.formatted_eta().as_deref(), Some("01:15"));
        stats.eta_seconds = Some(3725);
        assert_eq!(stats.formatted_eta().as_deref(), Some("01:02:05"));
        stats.eta_seconds = None;
        assert!(stats.formatted_eta().is_none());
    }
}
