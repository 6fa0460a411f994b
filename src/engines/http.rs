//! HTTP 传输引擎
//!
//! 基于 reqwest 的流式下载，字节落在暂存目录的 `<id>.part`，
//! 旁边的 `<id>.task` 记录任务归属，跨进程重启后据此恢复。

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::core::engine::{StateSink, TransferEngine, TransferTask, UpdateState};
use crate::core::error::DownloadError;
use crate::core::record::{DownloadRecord, DownloadState};
use crate::engines::retry::RetryStrategy;

const ENGINE_NAME: &str = "http";

/// 任务归属标记：和 `.part` 文件一起构成可恢复的在途任务
#[derive(Debug, Serialize, Deserialize)]
struct TaskSidecar {
    id: String,
    remote_url: Url,
}

struct HttpTask {
    remote_url: Url,
    paused: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    progress: Arc<Mutex<f32>>,
}

impl HttpTask {
    fn new(remote_url: Url) -> Self {
        Self {
            remote_url,
            paused: Arc::new(AtomicBool::new(false)),
            cancelled: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(Mutex::new(0.0)),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn safe_file_name(id: &str) -> String {
    id.replace(['/', '\\'], "_")
}

/// reqwest 超时单独归类为可重试的超时错误，其余网络错误原样透传
fn classify_request_error(e: reqwest::Error) -> DownloadError {
    if e.is_timeout() {
        DownloadError::Timeout
    } else {
        DownloadError::NetworkError(e)
    }
}

pub struct HttpTransferEngine {
    client: reqwest::Client,
    staging_dir: PathBuf,
    extensions: HashSet<String>,
    sink: Mutex<Option<StateSink>>,
    tasks: Arc<Mutex<HashMap<String, HttpTask>>>,
    /// 暂停已请求、引擎尚未确认期间需要抑制进度上报的 ID
    pausing: Arc<Mutex<HashSet<String>>>,
    retry: RetryStrategy,
}

impl HttpTransferEngine {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            staging_dir: staging_dir.into(),
            extensions: ["mp4", "mov", "m4v"].iter().map(|s| s.to_string()).collect(),
            sink: Mutex::new(None),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            pausing: Arc::new(Mutex::new(HashSet::new())),
            retry: RetryStrategy::default(),
        })
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_retry(mut self, retry: RetryStrategy) -> Self {
        self.retry = retry;
        self
    }

    fn current_sink(&self) -> Result<StateSink, DownloadError> {
        lock(&self.sink)
            .clone()
            .ok_or_else(|| DownloadError::Unknown("HTTP引擎尚未绑定状态回调".to_string()))
    }

    fn part_path(&self, id: &str) -> PathBuf {
        self.staging_dir.join(format!("{}.part", safe_file_name(id)))
    }

    fn sidecar_path(&self, id: &str) -> PathBuf {
        self.staging_dir.join(format!("{}.task", safe_file_name(id)))
    }

    fn write_sidecar(&self, id: &str, remote_url: &Url) -> Result<(), DownloadError> {
        fs::create_dir_all(&self.staging_dir)?;
        let sidecar = TaskSidecar { id: id.to_string(), remote_url: remote_url.clone() };
        fs::write(self.sidecar_path(id), serde_json::to_string(&sidecar)?)?;
        Ok(())
    }

    fn remove_task_files(&self, id: &str, remove_part: bool) {
        let _ = fs::remove_file(self.sidecar_path(id));
        if remove_part {
            let _ = fs::remove_file(self.part_path(id));
        }
    }

    fn spawn_transfer(&self, id: String, task: &HttpTask, sink: StateSink) {
        task.running.store(true, Ordering::SeqCst);

        let transfer = Transfer {
            client: self.client.clone(),
            id: id.clone(),
            remote_url: task.remote_url.clone(),
            part_path: self.part_path(&id),
            sidecar_path: self.sidecar_path(&id),
            paused: task.paused.clone(),
            cancelled: task.cancelled.clone(),
            progress: task.progress.clone(),
            pausing: self.pausing.clone(),
            sink,
        };
        let tasks = self.tasks.clone();
        let retry = self.retry.clone();

        tokio::spawn(async move {
            let mut attempt = 0usize;
            loop {
                match transfer.run_once().await {
                    Ok(TransferOutcome::Completed) => {
                        lock(&tasks).remove(&transfer.id);
                        let _ = fs::remove_file(&transfer.sidecar_path);
                        log::info!("[{}] {} 传输完成", ENGINE_NAME, transfer.id);
                        transfer.sink.do_send(UpdateState::completed(
                            TransferTask::new(ENGINE_NAME, &transfer.id),
                            transfer.part_path.clone(),
                        ));
                        return;
                    }
                    Ok(TransferOutcome::Cancelled) => {
                        lock(&tasks).remove(&transfer.id);
                        let _ = fs::remove_file(&transfer.sidecar_path);
                        let _ = fs::remove_file(&transfer.part_path);
                        log::info!("[{}] {} 已取消，清除暂存文件", ENGINE_NAME, transfer.id);
                        transfer.sink.do_send(UpdateState::state(
                            TransferTask::new(ENGINE_NAME, &transfer.id),
                            DownloadState::Cancelled,
                        ));
                        return;
                    }
                    Err(e) if retry.should_retry(&e, attempt) => {
                        let delay = retry.get_delay(attempt);
                        attempt += 1;
                        log::warn!(
                            "[{}] {} 传输出错: {}，{:.1} 秒后重试（第 {} 次）",
                            ENGINE_NAME,
                            transfer.id,
                            e,
                            delay.as_secs_f64(),
                            attempt
                        );
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => {
                        // 暂存文件保留，显式重试时从已有字节断点续传
                        lock(&tasks).remove(&transfer.id);
                        log::error!("[{}] {} 传输失败: {}", ENGINE_NAME, transfer.id, e);
                        transfer.sink.do_send(UpdateState::state(
                            TransferTask::new(ENGINE_NAME, &transfer.id),
                            DownloadState::Failed { message: e.to_string() },
                        ));
                        return;
                    }
                }
            }
        });
    }
}

enum TransferOutcome {
    Completed,
    Cancelled,
}

/// 一次传输尝试所需的全部共享句柄
struct Transfer {
    client: reqwest::Client,
    id: String,
    remote_url: Url,
    part_path: PathBuf,
    sidecar_path: PathBuf,
    paused: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    progress: Arc<Mutex<f32>>,
    pausing: Arc<Mutex<HashSet<String>>>,
    sink: StateSink,
}

impl Transfer {
    /// 暂停窗口里不上报完成，等恢复后再返回；取消时返回 true
    ///
    /// 防止最后一块字节恰好在暂停生效时收完，向已暂停的记录
    /// 投递完成回调。
    async fn hold_while_paused(&self) -> bool {
        while self.paused.load(Ordering::SeqCst) {
            if self.cancelled.load(Ordering::SeqCst) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    async fn run_once(&self) -> Result<TransferOutcome, DownloadError> {
        let existing = tokio::fs::metadata(&self.part_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        let mut request = self.client.get(self.remote_url.clone());
        if existing > 0 {
            request = request.header(header::RANGE, format!("bytes={}-", existing));
        }

        let mut response = request.send().await.map_err(classify_request_error)?;
        let status = response.status();

        // 416: 请求的区间越界，说明字节早已全部落盘
        if status.as_u16() == 416 {
            if self.hold_while_paused().await {
                return Ok(TransferOutcome::Cancelled);
            }
            return Ok(TransferOutcome::Completed);
        }
        if status.is_server_error() {
            return Err(DownloadError::ServerError(status.to_string()));
        }
        if !status.is_success() {
            return Err(DownloadError::Unknown(format!("HTTP {}", status)));
        }

        // 服务器忽略 Range（返回 200 而非 206）时必须从头重写
        let resumed = status.as_u16() == 206 && existing > 0;
        let mut downloaded = if resumed { existing } else { 0 };
        let total = response.content_length().map(|len| len + if resumed { existing } else { 0 });

        let mut file = if resumed {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(&self.part_path)
                .await?
        } else {
            tokio::fs::File::create(&self.part_path).await?
        };

        while let Some(chunk) = response.chunk().await.map_err(classify_request_error)? {
            if self.cancelled.load(Ordering::SeqCst) {
                return Ok(TransferOutcome::Cancelled);
            }
            while self.paused.load(Ordering::SeqCst) {
                if self.cancelled.load(Ordering::SeqCst) {
                    return Ok(TransferOutcome::Cancelled);
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }

            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;

            if let Some(total) = total.filter(|t| *t > 0) {
                let p = (downloaded as f64 / total as f64).min(1.0) as f32;
                *lock(&self.progress) = p;

                // 暂停请求到引擎确认之间的窗口期不上报进度
                if !self.paused.load(Ordering::SeqCst) && !lock(&self.pausing).contains(&self.id) {
                    self.sink.do_send(UpdateState::state(
                        TransferTask::new(ENGINE_NAME, &self.id),
                        DownloadState::Downloading { progress: p },
                    ));
                }
            }
        }

        file.flush().await?;

        if self.hold_while_paused().await {
            return Ok(TransferOutcome::Cancelled);
        }
        Ok(TransferOutcome::Completed)
    }
}

#[async_trait]
impl TransferEngine for HttpTransferEngine {
    fn name(&self) -> &'static str {
        ENGINE_NAME
    }

    fn supported_extensions(&self) -> &HashSet<String> {
        &self.extensions
    }

    fn bind(&self, sink: StateSink) {
        *lock(&self.sink) = Some(sink);
    }

    async fn start(&self, record: &DownloadRecord) -> Result<(), DownloadError> {
        let sink = self.current_sink()?;
        let id = record.id().to_string();

        let mut tasks = lock(&self.tasks);
        if let Some(task) = tasks.get(&id) {
            // 幂等：已有任务时恢复而不是重建
            lock(&self.pausing).remove(&id);
            task.paused.store(false, Ordering::SeqCst);
            if !task.running.load(Ordering::SeqCst) {
                self.spawn_transfer(id, task, sink);
            }
            return Ok(());
        }

        self.write_sidecar(&id, record.remote_url())?;
        log::info!("[{}] 启动传输 {} <- {}", ENGINE_NAME, id, record.remote_url());

        let task = HttpTask::new(record.remote_url().clone());
        self.spawn_transfer(id.clone(), &task, sink);
        tasks.insert(id, task);
        Ok(())
    }

    fn pause(&self, id: &str) -> Result<(), DownloadError> {
        let sink = self.current_sink()?;
        let tasks = lock(&self.tasks);
        let task = tasks.get(id).ok_or_else(|| DownloadError::TaskNotFound(id.to_string()))?;

        lock(&self.pausing).insert(id.to_string());
        task.paused.store(true, Ordering::SeqCst);

        let progress = *lock(&task.progress);
        sink.do_send(UpdateState::state(
            TransferTask::new(ENGINE_NAME, id),
            DownloadState::Paused { progress },
        ));
        Ok(())
    }

    fn resume(&self, id: &str) -> Result<(), DownloadError> {
        let sink = self.current_sink()?;
        let tasks = lock(&self.tasks);
        let task = tasks.get(id).ok_or_else(|| DownloadError::TaskNotFound(id.to_string()))?;

        lock(&self.pausing).remove(id);
        task.paused.store(false, Ordering::SeqCst);
        if !task.running.load(Ordering::SeqCst) {
            self.spawn_transfer(id.to_string(), task, sink.clone());
        }

        sink.do_send(UpdateState::state(
            TransferTask::new(ENGINE_NAME, id),
            DownloadState::Waiting,
        ));
        Ok(())
    }

    fn cancel(&self, id: &str) -> Result<(), DownloadError> {
        let tasks = lock(&self.tasks);
        let task = tasks.get(id).ok_or_else(|| DownloadError::TaskNotFound(id.to_string()))?;
        // 协作式：置位后由传输任务自行退出并确认
        task.cancelled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn cancel_task(&self, task: &TransferTask) -> Result<(), DownloadError> {
        if let Some(id) = task.download_id.as_deref() {
            if let Some(entry) = lock(&self.tasks).remove(id) {
                entry.cancelled.store(true, Ordering::SeqCst);
            }
            self.remove_task_files(id, true);
        }
        Ok(())
    }

    async fn pending_tasks(&self) -> Vec<TransferTask> {
        // 扫描暂存目录里的归属标记，重建上个进程留下的任务
        if let Ok(entries) = fs::read_dir(&self.staging_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("task") {
                    continue;
                }

                let sidecar: TaskSidecar = match fs::read_to_string(&path)
                    .map_err(DownloadError::from)
                    .and_then(|data| serde_json::from_str(&data).map_err(DownloadError::from))
                {
                    Ok(sidecar) => sidecar,
                    Err(e) => {
                        // 无法归属的残留不能留着，连同部分字节一起清掉
                        log::error!("[{}] 无法解析任务标记 {}: {}，丢弃", ENGINE_NAME, path.display(), e);
                        let _ = fs::remove_file(&path);
                        let _ = fs::remove_file(path.with_extension("part"));
                        continue;
                    }
                };

                let mut tasks = lock(&self.tasks);
                if tasks.contains_key(&sidecar.id) {
                    continue;
                }
                log::info!("[{}] 发现幸存任务 {}，继续传输", ENGINE_NAME, sidecar.id);
                let task = HttpTask::new(sidecar.remote_url);
                if let Ok(sink) = self.current_sink() {
                    self.spawn_transfer(sidecar.id.clone(), &task, sink);
                }
                tasks.insert(sidecar.id, task);
            }
        }

        lock(&self.tasks)
            .keys()
            .map(|id| TransferTask::new(ENGINE_NAME, id))
            .collect()
    }

    async fn fetch_task(&self, id: &str) -> Option<TransferTask> {
        if lock(&self.tasks).contains_key(id) || self.sidecar_path(id).exists() {
            return Some(TransferTask::new(ENGINE_NAME, id));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_record(id: &str, path: &str) -> DownloadRecord {
        DownloadRecord::new(
            id.to_string(),
            "测试".to_string(),
            Url::parse("https://example.com/a.mp4").unwrap(),
            path.to_string(),
        )
    }

    #[test]
    fn test_supports_by_extension() {
        let dir = TempDir::new().unwrap();
        let engine = HttpTransferEngine::new(dir.path()).unwrap();

        assert!(engine.supports(&make_record("a", "2024/a.mp4")));
        assert!(engine.supports(&make_record("b", "2024/b.MOV")));
        assert!(!engine.supports(&make_record("c", "2024/c.pdf")));
        // 没有扩展名无法归类
        assert!(!engine.supports(&make_record("d", "2024/noext")));
    }

    #[actix_rt::test]
    async fn test_sidecar_restores_pending_task() {
        let dir = TempDir::new().unwrap();
        let engine = HttpTransferEngine::new(dir.path()).unwrap();
        engine.write_sidecar("wwdc2024-101", &Url::parse("https://example.com/a.mp4").unwrap()).unwrap();

        // 未绑定回调时任务被登记但不开始传输
        let pending = engine.pending_tasks().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].download_id.as_deref(), Some("wwdc2024-101"));

        assert!(engine.fetch_task("wwdc2024-101").await.is_some());
        assert!(engine.fetch_task("unknown").await.is_none());
    }

    #[actix_rt::test]
    async fn test_corrupt_sidecar_is_discarded() {
        let dir = TempDir::new().unwrap();
        let engine = HttpTransferEngine::new(dir.path()).unwrap();

        fs::write(dir.path().join("bad.task"), "not json").unwrap();
        fs::write(dir.path().join("bad.part"), "bytes").unwrap();

        let pending = engine.pending_tasks().await;
        assert!(pending.is_empty());
        assert!(!dir.path().join("bad.task").exists());
        assert!(!dir.path().join("bad.part").exists());
    }

    #[actix_rt::test]
    async fn test_cancel_task_removes_files() {
        let dir = TempDir::new().unwrap();
        let engine = HttpTransferEngine::new(dir.path()).unwrap();
        engine.write_sidecar("a", &Url::parse("https://example.com/a.mp4").unwrap()).unwrap();
        fs::write(engine.part_path("a"), "bytes").unwrap();

        let task = TransferTask::new(ENGINE_NAME, "a");
        engine.cancel_task(&task).unwrap();

        assert!(!engine.sidecar_path("a").exists());
        assert!(!engine.part_path("a").exists());
        assert!(engine.fetch_task("a").await.is_none());
    }

    #[test]
    fn test_operations_require_bound_sink() {
        let dir = TempDir::new().unwrap();
        let engine = HttpTransferEngine::new(dir.path()).unwrap();
        assert!(matches!(engine.pause("nope"), Err(DownloadError::Unknown(_))));
        assert!(matches!(engine.resume("nope"), Err(DownloadError::Unknown(_))));
    }
}
