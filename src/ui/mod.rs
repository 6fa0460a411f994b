mod progress;

use std::fmt;
pub use progress::ProgressManager;

use crate::core::orchestrator::DownloadSnapshot;

pub fn print_success(message: &str) {
    println!("✓ {}", message);
}

pub fn print_error(message: &str) {
    println!("✗ {}", message);
}

/// 退出时打印的下载摘要
pub struct DownloadSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub paused: usize,
    pub cancelled: usize,
}

impl DownloadSummary {
    pub fn from_snapshots(snapshots: &[DownloadSnapshot]) -> Self {
        let mut summary = Self { total: snapshots.len(), completed: 0, failed: 0, paused: 0, cancelled: 0 };
        for snapshot in snapshots {
            let state = snapshot.record.state();
            if state.is_completed() {
                summary.completed += 1;
            } else if state.is_failed() {
                summary.failed += 1;
            } else if state.is_paused() {
                summary.paused += 1;
            } else if state.is_cancelled() {
                summary.cancelled += 1;
            }
        }
        summary
    }
}

impl fmt::Display for DownloadSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n下载摘要:")?;
        writeln!(f, "总任务数: {}", self.total)?;
        writeln!(f, "成功完成: {}", self.completed)?;
        writeln!(f, "失败: {}", self.failed)?;
        writeln!(f, "暂停: {}", self.paused)?;
        writeln!(f, "取消: {}", self.cancelled)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record::{DownloadRecord, DownloadState};
    use url::Url;

    fn snapshot(id: &str, state: DownloadState) -> DownloadSnapshot {
        let mut record = DownloadRecord::new(
            id.to_string(),
            id.to_string(),
            Url::parse("https://example.com/a.mp4").unwrap(),
            format!("{}.mp4", id),
        );
        record.apply_transition(state).unwrap();
        DownloadSnapshot { record, eta_seconds: None, formatted_eta: None }
    }

    #[test]
    fn test_summary_counts() {
        let snapshots = vec![
            snapshot("a", DownloadState::Completed),
            snapshot("b", DownloadState::Failed { message: "x".to_string() }),
            snapshot("c", DownloadState::Paused { progress: 0.5 }),
            snapshot("d", DownloadState::Downloading { progress: 0.5 }),
        ];
        let summary = DownloadSummary::from_snapshots(&snapshots);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.paused, 1);
        assert_eq!(summary.cancelled, 0);
    }
}
