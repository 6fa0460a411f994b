//! 模拟传输引擎
//!
//! 不产生任何网络流量：用定时器按固定步长推进进度，
//! 完成时写出一个占位暂存文件。开发调试和编排器测试用。

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::core::engine::{StateSink, TransferEngine, TransferTask, UpdateState};
use crate::core::error::DownloadError;
use crate::core::record::{DownloadRecord, DownloadState};

/// 使用这个下载 ID 可以让模拟引擎在 20% 进度处失败，
/// 用来人工验证失败与重试路径
pub const SIMULATE_FAILURE_ID: &str = "FAILTHIS";

const ENGINE_NAME: &str = "simulated";

/// 每个 tick 推进的进度
const PROGRESS_STEP: f32 = 0.02;

struct SimTask {
    paused: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    progress: Arc<Mutex<f32>>,
    running: Arc<AtomicBool>,
}

impl SimTask {
    fn new() -> Self {
        Self {
            paused: Arc::new(AtomicBool::new(false)),
            cancelled: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(Mutex::new(0.0)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }
}

pub struct SimulatedTransferEngine {
    /// 空集合：supports 被覆盖为永真，模拟引擎接管一切
    extensions: HashSet<String>,
    sink: Mutex<Option<StateSink>>,
    tasks: Arc<Mutex<HashMap<String, SimTask>>>,
    /// 暂停已请求、引擎尚未确认期间需要抑制进度上报的 ID
    pausing: Arc<Mutex<HashSet<String>>>,
    /// 模拟的跨进程幸存任务，pending_tasks 枚举时上报
    seeded: Mutex<Vec<TransferTask>>,
    staging_dir: PathBuf,
    tick: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimulatedTransferEngine {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            extensions: HashSet::new(),
            sink: Mutex::new(None),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            pausing: Arc::new(Mutex::new(HashSet::new())),
            seeded: Mutex::new(Vec::new()),
            staging_dir: staging_dir.into(),
            tick: Duration::from_millis(100),
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// 预置一个"上次进程留下的"在途任务，重启恢复路径用
    pub fn with_pending_task(self, id: impl Into<String>) -> Self {
        lock(&self.seeded).push(TransferTask::new(ENGINE_NAME, id.into()));
        self
    }

    /// 预置一个没有下载 ID 标记的任务，恢复时必须被丢弃并取消
    pub fn with_untagged_pending_task(self) -> Self {
        lock(&self.seeded).push(TransferTask { engine: ENGINE_NAME, download_id: None });
        self
    }

    fn current_sink(&self) -> Result<StateSink, DownloadError> {
        lock(&self.sink)
            .clone()
            .ok_or_else(|| DownloadError::Unknown("模拟引擎尚未绑定状态回调".to_string()))
    }

    fn spawn_ticker(&self, id: String, task: &SimTask, sink: StateSink) {
        task.running.store(true, Ordering::SeqCst);

        let paused = task.paused.clone();
        let cancelled = task.cancelled.clone();
        let progress = task.progress.clone();
        let tasks = self.tasks.clone();
        let pausing = self.pausing.clone();
        let staging_dir = self.staging_dir.clone();
        let tick = self.tick;

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(tick).await;

                if cancelled.load(Ordering::SeqCst) {
                    lock(&tasks).remove(&id);
                    sink.do_send(UpdateState::state(
                        TransferTask::new(ENGINE_NAME, &id),
                        DownloadState::Cancelled,
                    ));
                    return;
                }

                if paused.load(Ordering::SeqCst) {
                    continue;
                }

                let p = {
                    let mut guard = lock(&progress);
                    *guard = (*guard + PROGRESS_STEP).min(1.0);
                    *guard
                };

                if id == SIMULATE_FAILURE_ID && p >= 0.2 {
                    lock(&tasks).remove(&id);
                    sink.do_send(UpdateState::state(
                        TransferTask::new(ENGINE_NAME, &id),
                        DownloadState::Failed { message: "模拟的传输失败".to_string() },
                    ));
                    return;
                }

                if p >= 1.0 {
                    // 暂停窗口里到达终点：保留任务不上报完成，
                    // 恢复后的下一个 tick 再完成，记录不会停在已暂停态
                    if paused.load(Ordering::SeqCst) || lock(&pausing).contains(&id) {
                        continue;
                    }
                    lock(&tasks).remove(&id);
                    match write_staged_file(&staging_dir, &id) {
                        Ok(staged) => sink.do_send(UpdateState::completed(
                            TransferTask::new(ENGINE_NAME, &id),
                            staged,
                        )),
                        Err(e) => sink.do_send(UpdateState::state(
                            TransferTask::new(ENGINE_NAME, &id),
                            DownloadState::Failed { message: e.to_string() },
                        )),
                    }
                    return;
                }

                // 暂停请求到引擎确认之间的窗口期不上报进度
                if !lock(&pausing).contains(&id) {
                    sink.do_send(UpdateState::state(
                        TransferTask::new(ENGINE_NAME, &id),
                        DownloadState::Downloading { progress: p },
                    ));
                }
            }
        });
    }
}

/// 完成时写出的占位暂存文件
fn write_staged_file(staging_dir: &PathBuf, id: &str) -> Result<PathBuf, DownloadError> {
    fs::create_dir_all(staging_dir)?;
    let staged = staging_dir.join(format!("{}.sim", id.replace('/', "_")));
    fs::write(&staged, format!("simulated download {}\n", id))?;
    Ok(staged)
}

#[async_trait]
impl TransferEngine for SimulatedTransferEngine {
    fn name(&self) -> &'static str {
        ENGINE_NAME
    }

    fn supported_extensions(&self) -> &HashSet<String> {
        &self.extensions
    }

    /// 模拟引擎接管一切内容
    fn supports(&self, _record: &DownloadRecord) -> bool {
        true
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
                self.spawn_ticker(id, task, sink);
            }
            return Ok(());
        }

        log::info!("[{}] 启动模拟任务 {}", ENGINE_NAME, id);
        let task = SimTask::new();
        self.spawn_ticker(id.clone(), &task, sink);
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
            self.spawn_ticker(id.to_string(), task, sink.clone());
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
        // 协作式：置位后由 ticker 自行退出并确认
        task.cancelled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn cancel_task(&self, task: &TransferTask) -> Result<(), DownloadError> {
        match &task.download_id {
            Some(id) => {
                if let Some(entry) = lock(&self.tasks).remove(id) {
                    entry.cancelled.store(true, Ordering::SeqCst);
                }
                lock(&self.seeded).retain(|t| t.download_id.as_deref() != Some(id));
            }
            None => lock(&self.seeded).retain(|t| t.download_id.is_some()),
        }
        Ok(())
    }

    async fn pending_tasks(&self) -> Vec<TransferTask> {
        // 预置任务物化为真实任务并开始推进，模拟上个进程留下的
        // 后台任务在新进程里继续运行
        let seeded: Vec<TransferTask> = lock(&self.seeded).drain(..).collect();
        for pending in &seeded {
            if let Some(id) = pending.download_id.as_deref() {
                let mut tasks = lock(&self.tasks);
                if tasks.contains_key(id) {
                    continue;
                }
                let task = SimTask::new();
                if let Ok(sink) = self.current_sink() {
                    self.spawn_ticker(id.to_string(), &task, sink);
                }
                tasks.insert(id.to_string(), task);
            }
        }

        let mut all: Vec<TransferTask> = lock(&self.tasks)
            .keys()
            .map(|id| TransferTask::new(ENGINE_NAME, id))
            .collect();
        all.extend(seeded.into_iter().filter(|t| t.download_id.is_none()));
        all
    }

    async fn fetch_task(&self, id: &str) -> Option<TransferTask> {
        if lock(&self.tasks).contains_key(id) {
            return Some(TransferTask::new(ENGINE_NAME, id));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix::prelude::*;
    use tempfile::TempDir;
    use url::Url;

    /// 收集引擎回调的测试 actor
    struct Collector {
        events: Arc<Mutex<Vec<(String, Option<DownloadState>, Option<PathBuf>)>>>,
    }

    impl Actor for Collector {
        type Context = Context<Self>;
    }

    impl Handler<UpdateState> for Collector {
        type Result = ();

        fn handle(&mut self, msg: UpdateState, _ctx: &mut Self::Context) {
            let id = msg.task.download_id.clone().unwrap_or_default();
            lock(&self.events).push((id, msg.state, msg.staged_path));
        }
    }

    fn collector() -> (Addr<Collector>, Arc<Mutex<Vec<(String, Option<DownloadState>, Option<PathBuf>)>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let addr = Collector { events: events.clone() }.start();
        (addr, events)
    }

    fn make_record(id: &str) -> DownloadRecord {
        DownloadRecord::new(
            id.to_string(),
            "测试".to_string(),
            Url::parse("https://example.com/a.mp4").unwrap(),
            format!("2024/{}.mp4", id),
        )
    }

    #[actix_rt::test]
    async fn test_runs_to_completion_with_staged_file() {
        let dir = TempDir::new().unwrap();
        let engine = SimulatedTransferEngine::new(dir.path()).with_tick(Duration::from_millis(1));
        let (addr, events) = collector();
        engine.bind(addr.recipient());

        engine.start(&make_record("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let events = lock(&events);
        let last = events.last().expect("应当收到回调");
        assert_eq!(last.1, Some(DownloadState::Completed));
        let staged = last.2.as_ref().expect("完成回调必须带暂存路径");
        assert!(staged.exists());
        // 任务完成后不再被枚举
        assert!(lock(&engine.tasks).is_empty());
    }

    #[actix_rt::test]
    async fn test_failure_id_fails_at_twenty_percent() {
        let dir = TempDir::new().unwrap();
        let engine = SimulatedTransferEngine::new(dir.path()).with_tick(Duration::from_millis(1));
        let (addr, events) = collector();
        engine.bind(addr.recipient());

        engine.start(&make_record(SIMULATE_FAILURE_ID)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let events = lock(&events);
        let last = events.last().expect("应当收到回调");
        assert!(matches!(last.1, Some(DownloadState::Failed { .. })));
        // 失败前的进度不会越过 20%
        for (_, state, _) in events.iter() {
            if let Some(DownloadState::Downloading { progress }) = state {
                assert!(*progress < 0.2);
            }
        }
    }

    #[actix_rt::test]
    async fn test_pause_suppresses_progress() {
        let dir = TempDir::new().unwrap();
        let engine = SimulatedTransferEngine::new(dir.path()).with_tick(Duration::from_millis(1));
        let (addr, events) = collector();
        engine.bind(addr.recipient());

        engine.start(&make_record("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.pause("a").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let count_after_pause = {
            let events = lock(&events);
            let pause_index = events
                .iter()
                .position(|(_, s, _)| matches!(s, Some(DownloadState::Paused { .. })))
                .expect("应当收到暂停确认");
            events[pause_index + 1..]
                .iter()
                .filter(|(_, s, _)| matches!(s, Some(DownloadState::Downloading { .. })))
                .count()
        };
        // 暂停确认之后没有进度上报
        assert_eq!(count_after_pause, 0);

        engine.resume("a").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let resumed = lock(&events)
            .iter()
            .rev()
            .any(|(_, s, _)| matches!(s, Some(DownloadState::Downloading { .. })));
        assert!(resumed);
    }

    #[actix_rt::test]
    async fn test_completion_held_in_pause_window() {
        let dir = TempDir::new().unwrap();
        let engine = SimulatedTransferEngine::new(dir.path()).with_tick(Duration::from_millis(1));
        let (addr, events) = collector();
        engine.bind(addr.recipient());

        engine.start(&make_record("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        // 模拟暂停请求与任务迭代交错的窗口：抑制集已含该 ID，
        // 同时任务恰好收完最后一块
        lock(&engine.pausing).insert("a".to_string());
        {
            let tasks = lock(&engine.tasks);
            *lock(&tasks.get("a").unwrap().progress) = 0.99;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;

        // 窗口期内不上报完成，任务保持在途
        assert!(lock(&events)
            .iter()
            .all(|(_, s, _)| !matches!(s, Some(DownloadState::Completed))));
        assert!(lock(&engine.tasks).contains_key("a"));

        // 恢复后补上完成回调
        engine.resume("a").unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(lock(&events)
            .iter()
            .any(|(_, s, _)| matches!(s, Some(DownloadState::Completed))));
        assert!(lock(&engine.tasks).is_empty());
    }

    #[actix_rt::test]
    async fn test_pending_tasks_materialize_seeded() {
        let dir = TempDir::new().unwrap();
        let engine = SimulatedTransferEngine::new(dir.path())
            .with_tick(Duration::from_millis(1))
            .with_pending_task("survivor")
            .with_untagged_pending_task();
        let (addr, _events) = collector();
        engine.bind(addr.recipient());

        let pending = engine.pending_tasks().await;
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().any(|t| t.download_id.as_deref() == Some("survivor")));
        assert!(pending.iter().any(|t| t.download_id.is_none()));

        // 点查只认有标记的任务
        assert!(engine.fetch_task("survivor").await.is_some());
        assert!(engine.fetch_task("nobody").await.is_none());

        // 无标记任务被取消后不再出现
        let untagged = TransferTask { engine: ENGINE_NAME, download_id: None };
        engine.cancel_task(&untagged).unwrap();
        let pending = engine.pending_tasks().await;
        assert!(pending.iter().all(|t| t.download_id.is_some()));
    }

    #[actix_rt::test]
    async fn test_cancel_confirms_through_callback() {
        let dir = TempDir::new().unwrap();
        let engine = SimulatedTransferEngine::new(dir.path()).with_tick(Duration::from_millis(1));
        let (addr, events) = collector();
        engine.bind(addr.recipient());

        engine.start(&make_record("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.cancel("a").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let events = lock(&events);
        assert!(events
            .iter()
            .any(|(_, s, _)| matches!(s, Some(DownloadState::Cancelled))));
        assert!(lock(&engine.tasks).is_empty());

        // 任务消失后的操作报 TaskNotFound
        assert!(matches!(engine.pause("a"), Err(DownloadError::TaskNotFound(_))));
    }
}
