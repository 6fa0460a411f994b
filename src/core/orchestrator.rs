use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use actix::prelude::*;

use crate::core::content::{DownloadableContent, MediaVariant};
use crate::core::engine::{TransferEngine, TransferTask, UpdateState};
use crate::core::error::DownloadError;
use crate::core::record::{DownloadRecord, DownloadState, ProgressStats};
use crate::store::{create_dir_if_needed, MetadataStore};
use crate::utils::validator;

/// 进度持久化阈值默认值：相对上次落盘的进度变化达到 10% 才写元数据
pub const DEFAULT_PERSIST_PROGRESS_DELTA: f32 = 0.1;

/// 编排器内部跟踪的一条下载
///
/// `attached` 表示记录仍参与引擎回调、持久化和重启恢复；
/// 已完成/移动失败的记录会脱离恢复集但留在用户可见列表里。
struct TrackedDownload {
    record: DownloadRecord,
    attached: bool,
    last_persisted_progress: Option<f32>,
    stats: Option<ProgressStats>,
}

/// 提供给 UI 的下载快照，附带派生的进度统计
#[derive(Debug, Clone)]
pub struct DownloadSnapshot {
    pub record: DownloadRecord,
    pub eta_seconds: Option<u64>,
    pub formatted_eta: Option<String>,
}

/// 下载编排器
///
/// 权威状态的唯一持有者。所有状态变更（命令处理与引擎回调）
/// 都经过 actor 邮箱串行执行；引擎的网络/文件 IO 在各自的
/// 任务里并发进行，互不阻塞。
pub struct DownloadOrchestrator {
    /// 下载根目录，最终文件位置 = 根目录 + 相对路径
    download_dir: PathBuf,
    engines: Vec<Arc<dyn TransferEngine>>,
    store: Arc<dyn MetadataStore>,
    persist_progress_delta: f32,
    tracked: HashMap<String, TrackedDownload>,
    activated: bool,
}

impl DownloadOrchestrator {
    pub fn new(
        download_dir: impl Into<PathBuf>,
        engines: Vec<Arc<dyn TransferEngine>>,
        store: Arc<dyn MetadataStore>,
    ) -> Self {
        Self {
            download_dir: download_dir.into(),
            engines,
            store,
            persist_progress_delta: DEFAULT_PERSIST_PROGRESS_DELTA,
            tracked: HashMap::new(),
            activated: false,
        }
    }

    pub fn with_persist_progress_delta(mut self, delta: f32) -> Self {
        self.persist_progress_delta = delta;
        self
    }
}

impl Actor for DownloadOrchestrator {
    type Context = Context<Self>;
}

// ================== 消息定义 ==================

/// 激活编排器：绑定引擎回调并执行启动期对账
///
/// 对账（恢复在途任务 + 清理孤儿元数据）期间邮箱被阻塞，
/// 保证在对账完成前不会处理任何命令。
#[derive(Message)]
#[rtype(result = "()")]
pub struct Activate;

/// 为指定内容启动下载，按偏好顺序选第一个可解析的变体
#[derive(Message)]
#[rtype(result = "Result<DownloadRecord, DownloadError>")]
pub struct StartDownload {
    pub id: String,
    pub title: String,
    pub variants: Vec<MediaVariant>,
}

impl StartDownload {
    pub fn for_content<C: DownloadableContent>(content: &C) -> Self {
        Self {
            id: content.id().to_string(),
            title: content.title().to_string(),
            variants: content.media_variants(),
        }
    }
}

/// 暂停下载
#[derive(Message)]
#[rtype(result = "Result<(), DownloadError>")]
pub struct PauseDownload {
    pub id: String,
}

/// 恢复已暂停的下载
#[derive(Message)]
#[rtype(result = "Result<(), DownloadError>")]
pub struct ResumeDownload {
    pub id: String,
}

/// 取消下载：立即脱离跟踪并删除元数据，引擎侧协作式停止
#[derive(Message)]
#[rtype(result = "Result<(), DownloadError>")]
pub struct CancelDownload {
    pub id: String,
}

/// 重试失败的下载：丢弃旧记录，以同一身份重新附着并启动
#[derive(Message)]
#[rtype(result = "Result<(), DownloadError>")]
pub struct RetryDownload {
    pub id: String,
}

/// 把一条可移除的下载从可见列表清除
#[derive(Message)]
#[rtype(result = "Result<(), DownloadError>")]
pub struct ClearDownload {
    pub id: String,
}

/// 清除全部已完成的下载
#[derive(Message)]
#[rtype(result = "usize")]
pub struct ClearCompleted;

/// 当前全部下载快照，按创建时间排序（UI 绑定用）
#[derive(Message)]
#[rtype(result = "Vec<DownloadSnapshot>")]
pub struct ListDownloads;

/// 单条下载快照
#[derive(Message)]
#[rtype(result = "Option<DownloadSnapshot>")]
pub struct GetDownload {
    pub id: String,
}

/// 已下载文件的最终位置（第一个存在于磁盘的变体）
#[derive(Message)]
#[rtype(result = "Option<PathBuf>")]
pub struct DownloadedFileUrl {
    pub variants: Vec<MediaVariant>,
}

/// 指定内容是否已有本地下载
#[derive(Message)]
#[rtype(result = "bool")]
pub struct HasDownloadedMedia {
    pub variants: Vec<MediaVariant>,
}

/// 指定内容是否有进行中的下载（除已完成外的任何状态）
#[derive(Message)]
#[rtype(result = "bool")]
pub struct IsDownloadingMedia {
    pub id: String,
}

/// 删除已下载到最终位置的媒体文件
#[derive(Message)]
#[rtype(result = "Result<(), DownloadError>")]
pub struct RemoveDownloadedMedia {
    pub variants: Vec<MediaVariant>,
}

// ================== 命令处理 ==================

impl Handler<Activate> for DownloadOrchestrator {
    type Result = ();

    fn handle(&mut self, _msg: Activate, ctx: &mut Self::Context) {
        if self.activated {
            return;
        }
        self.activated = true;

        if self.engines.is_empty() {
            log::error!("编排器没有注册任何传输引擎");
            return;
        }

        log::info!("激活编排器，共 {} 个引擎", self.engines.len());

        let sink = ctx.address().recipient();
        for engine in &self.engines {
            engine.bind(Recipient::clone(&sink));
        }

        // 恢复在途任务。ctx.wait 阻塞邮箱，对账完成前不接受命令
        let engines = self.engines.clone();
        let fut = async move {
            let mut all = Vec::with_capacity(engines.len());
            for (index, engine) in engines.iter().enumerate() {
                all.push((index, engine.pending_tasks().await));
            }
            all
        };

        ctx.wait(fut.into_actor(self).map(|all, act, ctx| {
            act.apply_restored_tasks(all);
            act.schedule_orphan_purge(ctx);
        }));
    }
}

impl Handler<StartDownload> for DownloadOrchestrator {
    type Result = Result<DownloadRecord, DownloadError>;

    fn handle(&mut self, msg: StartDownload, ctx: &mut Self::Context) -> Self::Result {
        // 磁盘上已有完成的文件，拒绝重复下载
        if self.downloaded_file(&msg.variants).is_some() {
            return Err(DownloadError::AlreadyDownloaded(msg.id));
        }

        // 按偏好顺序取第一个远端地址和本地路径都可解析的变体
        let (remote_url, relative_local_path) = msg
            .variants
            .iter()
            .find_map(|variant| variant.resolved())
            .ok_or_else(|| DownloadError::NoDownloadableVariant(msg.id.clone()))?;

        if !validator::is_valid_url(remote_url.as_str()) {
            return Err(DownloadError::InvalidUrl(remote_url.to_string()));
        }
        if !validator::is_safe_relative_path(&relative_local_path) {
            return Err(DownloadError::InvalidLocalPath(relative_local_path));
        }

        let existing_state = self.tracked.get(&msg.id).map(|t| t.record.state().clone());

        let record = match existing_state {
            Some(state) if state.is_final() => {
                // 终态（已完成/已取消）的旧记录：丢弃后重新开始
                log::info!("发现终态旧记录 {}（{}），丢弃后重新下载", msg.id, state);
                self.tracked.remove(&msg.id);
                self.attach_new(msg.id, msg.title, remote_url, relative_local_path)?
            }
            Some(state) if state.is_failed() => {
                // 失败的现有记录：按重试语义换一条全新记录
                log::info!("发现失败的现有记录 {}，重新附着后下载", msg.id);
                self.tracked.remove(&msg.id);
                self.attach_new(msg.id, msg.title, remote_url, relative_local_path)?
            }
            Some(state) if state.is_paused() => {
                // 已暂停的现有记录：原地恢复，不重新附着
                log::info!("发现已暂停的现有记录 {}（{}），原地恢复", msg.id, state);
                self.tracked
                    .get(&msg.id)
                    .map(|t| t.record.clone())
                    .ok_or_else(|| DownloadError::RecordNotFound(msg.id.clone()))?
            }
            Some(_) => return Err(DownloadError::AlreadyExists(msg.id)),
            None => {
                log::info!("创建新下载记录 {}", msg.id);
                self.attach_new(msg.id, msg.title, remote_url, relative_local_path)?
            }
        };

        self.spawn_engine_start(&record, ctx)?;
        Ok(record)
    }
}

impl Handler<PauseDownload> for DownloadOrchestrator {
    type Result = Result<(), DownloadError>;

    fn handle(&mut self, msg: PauseDownload, _ctx: &mut Self::Context) -> Self::Result {
        let engine = self.engine_for_tracked(&msg.id)?;
        engine.pause(&msg.id)
    }
}

impl Handler<ResumeDownload> for DownloadOrchestrator {
    type Result = Result<(), DownloadError>;

    fn handle(&mut self, msg: ResumeDownload, _ctx: &mut Self::Context) -> Self::Result {
        let engine = self.engine_for_tracked(&msg.id)?;
        engine.resume(&msg.id)
    }
}

impl Handler<CancelDownload> for DownloadOrchestrator {
    type Result = Result<(), DownloadError>;

    fn handle(&mut self, msg: CancelDownload, _ctx: &mut Self::Context) -> Self::Result {
        let engine = self.engine_for_tracked(&msg.id)?;

        // 取消在记录层是立即权威的：无条件脱离跟踪并删除元数据，
        // 不等待引擎确认。引擎任务尚未建立（start 还没被调度）或
        // 已经结束时按无操作容忍；迟到启动的任务由回调路径收割。
        match engine.cancel(&msg.id) {
            Ok(()) => {}
            Err(DownloadError::TaskNotFound(_)) => {
                log::debug!("取消 {} 时引擎没有在途任务", msg.id);
            }
            Err(e) => log::warn!("向引擎发送取消 {} 失败: {}", msg.id, e),
        }

        if let Err(e) = self.store.remove(&msg.id) {
            log::warn!("删除 {} 的元数据失败: {}", msg.id, e);
        }
        self.tracked.remove(&msg.id);
        log::info!("已取消并脱离下载 {}", msg.id);
        Ok(())
    }
}

impl Handler<RetryDownload> for DownloadOrchestrator {
    type Result = Result<(), DownloadError>;

    fn handle(&mut self, msg: RetryDownload, ctx: &mut Self::Context) -> Self::Result {
        let old = self
            .tracked
            .get(&msg.id)
            .ok_or_else(|| DownloadError::RecordNotFound(msg.id.clone()))?;

        if !old.record.state().is_failed() {
            return Err(DownloadError::NotRetryable(old.record.state().clone()));
        }

        let (title, remote_url, relative_local_path) = (
            old.record.title().to_string(),
            old.record.remote_url().clone(),
            old.record.relative_local_path().to_string(),
        );

        // 先清掉旧记录，再以同一身份重新附着一条全新记录，
        // 旧的失败原因随旧记录一起消失
        self.tracked.remove(&msg.id);
        log::info!("重试下载 {}", msg.id);

        let record = self.attach_new(msg.id, title, remote_url, relative_local_path)?;
        self.spawn_engine_start(&record, ctx)?;
        Ok(())
    }
}

impl Handler<ClearDownload> for DownloadOrchestrator {
    type Result = Result<(), DownloadError>;

    fn handle(&mut self, msg: ClearDownload, _ctx: &mut Self::Context) -> Self::Result {
        let entry = self
            .tracked
            .get(&msg.id)
            .ok_or_else(|| DownloadError::RecordNotFound(msg.id.clone()))?;

        if !entry.record.state().is_removable() {
            return Err(DownloadError::NotRemovable(entry.record.state().clone()));
        }

        // 用户显式丢弃失败/取消的记录时，同时清掉残留的元数据
        if entry.attached {
            if let Err(e) = self.store.remove(&msg.id) {
                log::warn!("删除 {} 的元数据失败: {}", msg.id, e);
            }
        }
        self.tracked.remove(&msg.id);
        Ok(())
    }
}

impl Handler<ClearCompleted> for DownloadOrchestrator {
    type Result = MessageResult<ClearCompleted>;

    fn handle(&mut self, _msg: ClearCompleted, _ctx: &mut Self::Context) -> Self::Result {
        let before = self.tracked.len();
        self.tracked.retain(|_, entry| !entry.record.state().is_completed());
        let removed = before - self.tracked.len();

        if removed == 0 {
            log::info!("没有可清除的已完成下载");
        } else {
            log::info!("从列表清除 {} 条已完成下载", removed);
        }
        MessageResult(removed)
    }
}

// ================== 查询处理 ==================

impl Handler<ListDownloads> for DownloadOrchestrator {
    type Result = MessageResult<ListDownloads>;

    fn handle(&mut self, _msg: ListDownloads, _ctx: &mut Self::Context) -> Self::Result {
        let mut snapshots: Vec<DownloadSnapshot> =
            self.tracked.values().map(Self::snapshot).collect();
        snapshots.sort_by_key(|s| s.record.created_at());
        MessageResult(snapshots)
    }
}

impl Handler<GetDownload> for DownloadOrchestrator {
    type Result = MessageResult<GetDownload>;

    fn handle(&mut self, msg: GetDownload, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(self.tracked.get(&msg.id).map(Self::snapshot))
    }
}

impl Handler<DownloadedFileUrl> for DownloadOrchestrator {
    type Result = MessageResult<DownloadedFileUrl>;

    fn handle(&mut self, msg: DownloadedFileUrl, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(self.downloaded_file(&msg.variants))
    }
}

impl Handler<HasDownloadedMedia> for DownloadOrchestrator {
    type Result = MessageResult<HasDownloadedMedia>;

    fn handle(&mut self, msg: HasDownloadedMedia, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(self.downloaded_file(&msg.variants).is_some())
    }
}

impl Handler<IsDownloadingMedia> for DownloadOrchestrator {
    type Result = MessageResult<IsDownloadingMedia>;

    fn handle(&mut self, msg: IsDownloadingMedia, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(
            self.tracked
                .get(&msg.id)
                .map(|entry| !entry.record.state().is_completed())
                .unwrap_or(false),
        )
    }
}

impl Handler<RemoveDownloadedMedia> for DownloadOrchestrator {
    type Result = Result<(), DownloadError>;

    fn handle(&mut self, msg: RemoveDownloadedMedia, _ctx: &mut Self::Context) -> Self::Result {
        let path = self
            .downloaded_file(&msg.variants)
            .ok_or_else(|| DownloadError::RecordNotFound("没有已下载的文件".to_string()))?;
        fs::remove_file(path)?;
        Ok(())
    }
}

// ================== 引擎回调入口 ==================

impl Handler<UpdateState> for DownloadOrchestrator {
    type Result = ();

    fn handle(&mut self, msg: UpdateState, _ctx: &mut Self::Context) {
        let id = match msg.task.download_id() {
            Ok(id) => id.to_string(),
            Err(_) => {
                log::warn!("[{}] 收到没有下载ID标记的任务回调，忽略", msg.task.engine);
                return;
            }
        };

        // 记录不在内存中：可能是引擎在启动期恢复完成之前就发来了回调，
        // 按需从元数据存储恢复并附着，而不是丢弃回调
        if !self.tracked.contains_key(&id) {
            match self.store.fetch(&id) {
                Ok(record) => {
                    log::info!("按需恢复下载 {}（引擎 {} 的回调早于启动恢复）", id, msg.task.engine);
                    let last_persisted_progress = record.state().progress();
                    self.tracked.insert(
                        id.clone(),
                        TrackedDownload {
                            record,
                            attached: true,
                            last_persisted_progress,
                            stats: None,
                        },
                    );
                }
                Err(_) => {
                    // 已取消并脱离的任务迟到的回调属于正常竞态，静默容忍
                    if msg.state.as_ref().map(DownloadState::is_cancelled).unwrap_or(false) {
                        log::debug!("忽略已脱离任务 {} 的迟到取消回调", id);
                    } else {
                        // 无法归属的活任务（例如取消命令抢在引擎 start
                        // 被调度之前）不能留着偷偷运行，要求引擎收割
                        log::warn!("收到无法归属的状态回调: {} ({:?})，取消该任务", id, msg.state);
                        if let Some(engine) =
                            self.engines.iter().find(|e| e.name() == msg.task.engine)
                        {
                            if let Err(e) = engine.cancel_task(&msg.task) {
                                log::error!("取消无法归属的任务 {} 失败: {}", id, e);
                            }
                        }
                    }
                    return;
                }
            }
        }

        let entry = match self.tracked.get_mut(&id) {
            Some(entry) => entry,
            None => return,
        };

        // 已脱离恢复集的记录不再接受引擎回调
        if !entry.attached {
            log::debug!("忽略已脱离下载 {} 的回调", id);
            return;
        }

        // 暂存位置和状态一起应用，持久化决策在应用前做出
        let staged_changed = msg
            .staged_path
            .as_ref()
            .map(|p| Some(p) != entry.record.temporary_local_path())
            .unwrap_or(false);

        if let Some(path) = msg.staged_path {
            entry.record.set_temporary_local_path(Some(path));
        }

        let Some(new_state) = msg.state else {
            if staged_changed {
                Self::persist_entry(&*self.store, &id, entry);
            }
            return;
        };

        let should_persist = staged_changed
            || entry.record.should_persist(
                &new_state,
                entry.last_persisted_progress,
                self.persist_progress_delta,
            );

        // 终态先校验后执行副作用：Completed 只有文件真正移动就位
        // 之后才落到记录上，移动失败的记录落为可重试的失败态
        if new_state.is_final() {
            if let Err(e) = entry.record.check_transition(&new_state) {
                if new_state.is_cancelled() {
                    log::debug!("忽略 {} 的取消竞态: {}", id, e);
                } else {
                    // 终态后的再变更是逻辑错误，记录但不中断编排器
                    log::error!("{} 的状态转换被拒绝: {}", id, e);
                }
                return;
            }
            entry.stats = None;
            self.finish_terminal(&id, new_state);
            return;
        }

        if let Err(e) = entry.record.apply_transition(new_state.clone()) {
            log::error!("{} 的状态转换被拒绝: {}", id, e);
            return;
        }

        log::info!("下载 {} 状态变更: {}", id, entry.record.state());

        // 派生统计只在下载中维护
        match entry.record.state() {
            DownloadState::Downloading { progress } => {
                let progress = *progress;
                entry.stats.get_or_insert_with(ProgressStats::new).update(progress);
            }
            _ => entry.stats = None,
        }

        if should_persist {
            Self::persist_entry(&*self.store, &id, entry);
        }
    }
}

// ================== 内部逻辑 ==================

impl DownloadOrchestrator {
    fn snapshot(entry: &TrackedDownload) -> DownloadSnapshot {
        DownloadSnapshot {
            record: entry.record.clone(),
            eta_seconds: entry.stats.as_ref().and_then(|s| s.eta_seconds),
            formatted_eta: entry.stats.as_ref().and_then(|s| s.formatted_eta()),
        }
    }

    /// 第一个声明支持该记录的引擎。实践中各引擎的扩展名集合
    /// 互不相交，先注册者优先。
    fn engine_for(&self, record: &DownloadRecord) -> Result<Arc<dyn TransferEngine>, DownloadError> {
        self.engines
            .iter()
            .find(|engine| engine.supports(record))
            .cloned()
            .ok_or_else(|| DownloadError::EngineNotFound(record.relative_local_path().to_string()))
    }

    fn engine_for_tracked(&self, id: &str) -> Result<Arc<dyn TransferEngine>, DownloadError> {
        let entry = self
            .tracked
            .get(id)
            .ok_or_else(|| DownloadError::RecordNotFound(id.to_string()))?;
        self.engine_for(&entry.record)
    }

    fn downloaded_file(&self, variants: &[MediaVariant]) -> Option<PathBuf> {
        for variant in variants {
            if let Some(relative) = &variant.relative_local_path {
                let path = self.download_dir.join(relative);
                if path.exists() {
                    return Some(path);
                }
            }
        }
        None
    }

    /// 创建新记录并附着（同步持久化）
    fn attach_new(
        &mut self,
        id: String,
        title: String,
        remote_url: url::Url,
        relative_local_path: String,
    ) -> Result<DownloadRecord, DownloadError> {
        let record = DownloadRecord::new(id.clone(), title, remote_url, relative_local_path);

        // 引擎解析放在持久化之前，避免为无人认领的记录落盘
        self.engine_for(&record)?;

        self.store.persist(&record)?;
        log::info!("附着下载 {}（已持久化）", id);

        self.tracked.insert(
            id,
            TrackedDownload {
                record: record.clone(),
                attached: true,
                last_persisted_progress: None,
                stats: None,
            },
        );
        Ok(record)
    }

    /// 把引擎的 start 抛到邮箱之外执行，失败通过回调路径转为失败状态
    fn spawn_engine_start(
        &self,
        record: &DownloadRecord,
        ctx: &mut Context<Self>,
    ) -> Result<(), DownloadError> {
        let engine = self.engine_for(record)?;
        let addr = ctx.address();
        let record = record.clone();

        actix::spawn(async move {
            if let Err(e) = engine.start(&record).await {
                log::error!("引擎 {} 启动 {} 失败: {}", engine.name(), record.id(), e);
                addr.do_send(UpdateState::state(
                    TransferTask::new(engine.name(), record.id()),
                    DownloadState::Failed { message: e.to_string() },
                ));
            }
        });
        Ok(())
    }

    fn persist_entry(store: &dyn MetadataStore, id: &str, entry: &mut TrackedDownload) {
        // 持久化失败不致命：记录日志，崩溃恢复会损失一点新鲜度
        match store.persist(&entry.record) {
            Ok(()) => {
                if let Some(progress) = entry.record.state().progress() {
                    entry.last_persisted_progress = Some(progress);
                }
            }
            Err(e) => log::warn!("持久化 {} 失败: {}", id, e),
        }
    }

    /// 终态处理：恰好一次的 move-into-place 与脱离
    ///
    /// 进入前转换表已校验通过。Completed 在移动成功之后才应用到
    /// 记录上，移动失败的记录从当前（非终）态转为失败。
    fn finish_terminal(&mut self, id: &str, state: DownloadState) {
        match state {
            DownloadState::Completed => match self.move_into_place(id) {
                Ok(destination) => {
                    if let Some(entry) = self.tracked.get_mut(id) {
                        if let Err(e) = entry.record.apply_transition(DownloadState::Completed) {
                            log::error!("无法把 {} 标记为完成: {}", id, e);
                        }
                    }
                    log::info!("下载 {} 已移动到最终位置: {}", id, destination.display());
                    self.detach_from_recovery(id, true);
                }
                Err(e) => {
                    // 移动失败时绝不把记录置为已完成：记录落为失败态，
                    // 用户可以稍后重试。记录同样脱离恢复集（引擎任务已结束），
                    // 但保留在可见列表里。
                    log::error!("下载 {} 移动到最终位置失败: {}", id, e);
                    if let Some(entry) = self.tracked.get_mut(id) {
                        if let Err(err) = entry
                            .record
                            .apply_transition(DownloadState::Failed { message: e.to_string() })
                        {
                            log::error!("无法把 {} 标记为失败: {}", id, err);
                        }
                        Self::persist_entry(&*self.store, id, entry);
                    }
                    self.detach_from_recovery(id, false);
                }
            },
            DownloadState::Cancelled => {
                if let Some(entry) = self.tracked.get_mut(id) {
                    if let Err(e) = entry.record.apply_transition(DownloadState::Cancelled) {
                        log::error!("无法把 {} 标记为已取消: {}", id, e);
                    }
                }
                self.detach_from_recovery(id, true);
            }
            _ => unreachable!("finish_terminal 只处理终态"),
        }
    }

    /// 把记录移出重启恢复集：之后不再接受引擎回调，也不再参与
    /// 启动期恢复。可见列表保留由 clear / clearCompleted 负责。
    fn detach_from_recovery(&mut self, id: &str, remove_metadata: bool) {
        if remove_metadata {
            if let Err(e) = self.store.remove(id) {
                log::warn!("删除 {} 的元数据失败: {}", id, e);
            }
        }

        match self.tracked.get_mut(id) {
            Some(entry) => {
                entry.attached = false;
                entry.stats = None;
                log::info!("脱离下载 {}（删除元数据: {}）", id, remove_metadata);
            }
            None => {
                // 正确使用下不应发生：脱离请求必须针对被跟踪的记录
                log::error!("脱离请求针对未被跟踪的下载: {}", id);
                debug_assert!(false, "detach on untracked download");
            }
        }
    }

    /// 把暂存文件原子移动到下载根目录下的最终位置
    ///
    /// 每条记录最多执行一次：执行后记录要么进入终态要么脱离，
    /// 不可能再次进入这条路径。
    fn move_into_place(&mut self, id: &str) -> Result<PathBuf, DownloadError> {
        let entry = self
            .tracked
            .get_mut(id)
            .ok_or_else(|| DownloadError::RecordNotFound(id.to_string()))?;

        let staged = entry
            .record
            .temporary_local_path()
            .cloned()
            .ok_or_else(|| DownloadError::MissingStagedFile(id.to_string()))?;

        let destination = self.download_dir.join(entry.record.relative_local_path());

        if let Some(parent) = destination.parent() {
            // 兄弟目录可能被其它下载并发创建，create_dir_all 容忍这种竞争
            create_dir_if_needed(parent)?;
        }

        move_file(&staged, &destination)?;
        entry.record.set_temporary_local_path(None);

        Ok(destination)
    }

    /// 启动恢复：把每个引擎报告的在途任务与元数据对账
    fn apply_restored_tasks(&mut self, all: Vec<(usize, Vec<TransferTask>)>) {
        for (index, tasks) in all {
            let engine = self.engines[index].clone();
            if tasks.is_empty() {
                continue;
            }

            log::info!("引擎 {} 报告 {} 个在途任务", engine.name(), tasks.len());

            for task in tasks {
                let restored = task.download_id().map(str::to_string).and_then(|id| {
                    if self.tracked.contains_key(&id) {
                        return Ok(id);
                    }
                    let record = self.store.fetch(&id)?;
                    // 元数据本就持久，附着时不再重复落盘
                    let last_persisted_progress = record.state().progress();
                    self.tracked.insert(
                        id.clone(),
                        TrackedDownload {
                            record,
                            attached: true,
                            last_persisted_progress,
                            stats: None,
                        },
                    );
                    Ok(id)
                });

                match restored {
                    Ok(id) => log::info!("恢复在途任务 {}（引擎 {}）", id, engine.name()),
                    Err(e) => {
                        // 无法归属的任务不能留着偷偷运行，直接取消
                        log::error!("恢复引擎 {} 的在途任务失败: {}，取消该任务", engine.name(), e);
                        if let Err(err) = engine.cancel_task(&task) {
                            log::error!("取消无法恢复的任务失败: {}", err);
                        }
                    }
                }
            }
        }
    }

    /// 孤儿清理：持久化过、但既没有内存记录也没有任何引擎
    /// 报告在途任务的 ID，其元数据删除
    fn schedule_orphan_purge(&mut self, ctx: &mut Context<Self>) {
        let candidates: Vec<String> = match self.store.persisted_identifiers() {
            Ok(ids) => ids
                .into_iter()
                .filter(|id| !self.tracked.contains_key(id))
                .collect(),
            Err(e) => {
                log::error!("读取持久化的下载ID失败: {}", e);
                return;
            }
        };

        if candidates.is_empty() {
            return;
        }

        let engines = self.engines.clone();
        let fut = async move {
            let mut orphans = Vec::new();
            'candidate: for id in candidates {
                for engine in &engines {
                    if engine.fetch_task(&id).await.is_some() {
                        // 还有活任务，可能只是尚未附着，不算孤儿
                        continue 'candidate;
                    }
                }
                orphans.push(id);
            }
            orphans
        };

        ctx.wait(fut.into_actor(self).map(|orphans, act, _ctx| {
            for id in orphans {
                log::warn!("清理孤儿下载元数据: {}", id);
                if let Err(e) = act.store.remove(&id) {
                    log::error!("清理孤儿下载 {} 失败: {}", id, e);
                }
            }
        }));
    }
}

/// 移动文件，rename 失败（例如跨文件系统）时退化为复制加删除
fn move_file(from: &PathBuf, to: &PathBuf) -> Result<(), DownloadError> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(from, to)?;
            fs::remove_file(from)?;
            Ok(())
        }
    }
}
