use std::collections::HashMap;
use std::sync::Mutex;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::core::orchestrator::DownloadSnapshot;
use crate::core::record::DownloadState;

/// 终端进度条管理器：每条下载一个进度条，按编排器快照刷新
pub struct ProgressManager {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl ProgressManager {
    pub fn new() -> Self {
        ProgressManager {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn bar_style() -> ProgressStyle {
        ProgressStyle::with_template("{msg:!40} [{bar:40}] {pos:>3}%")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
    }

    /// 按最新快照刷新全部进度条
    pub fn sync(&self, snapshots: &[DownloadSnapshot]) {
        let mut bars = match self.bars.lock() {
            Ok(bars) => bars,
            Err(poisoned) => poisoned.into_inner(),
        };

        for snapshot in snapshots {
            let id = snapshot.record.id().to_string();
            let bar = bars.entry(id).or_insert_with(|| {
                let bar = self.multi.add(ProgressBar::new(100));
                bar.set_style(Self::bar_style());
                bar
            });

            let state = snapshot.record.state();
            let position = (state.progress().unwrap_or(match state {
                DownloadState::Completed => 1.0,
                _ => 0.0,
            }) * 100.0) as u64;
            bar.set_position(position);

            // 状态 + ETA 一起显示在标题位
            let message = match (&snapshot.formatted_eta, state) {
                (Some(eta), DownloadState::Downloading { .. }) => {
                    format!("{} {} ETA:{}", snapshot.record.title(), state, eta)
                }
                _ => format!("{} {}", snapshot.record.title(), state),
            };
            bar.set_message(message);

            if state.is_final() || state.is_failed() {
                bar.finish();
            }
        }
    }

    pub fn finish(&self) {
        let bars = match self.bars.lock() {
            Ok(bars) => bars,
            Err(poisoned) => poisoned.into_inner(),
        };
        for bar in bars.values() {
            bar.finish();
        }
    }
}

impl Default for ProgressManager {
    fn default() -> Self {
        Self::new()
    }
}
