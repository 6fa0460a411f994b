use actix::prelude::*;
use crossterm::{
    cursor,
    event::{self, Event, KeyCode},
    execute, terminal,
};
use log::LevelFilter;
use std::sync::Arc;
use url::Url;

use mediadown::cli;
use mediadown::core::orchestrator::{
    Activate, CancelDownload, DownloadOrchestrator, ListDownloads, PauseDownload, ResumeDownload,
    StartDownload,
};
use mediadown::core::{MediaVariant, TransferEngine};
use mediadown::engines::{HttpTransferEngine, SimulatedTransferEngine};
use mediadown::store::FsMetadataStore;
use mediadown::ui::{self, DownloadSummary, ProgressManager};
use mediadown::utils::logger::{LoggerActor, LoggerExt};

const PROGRESS_UPDATE_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);
const KEYBOARD_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(50);

#[actix::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let logger = LoggerActor::new("logs/app.log", LevelFilter::Info, 10 * 1024 * 1024)?.start();
    logger.info("程序启动");

    // 解析参数和配置
    let (args, config) = match cli::Args::parse_args() {
        Ok((args, config)) => (args, config),
        Err(e) => {
            logger.error(&format!("参数解析失败: {}", e));
            eprintln!("参数解析失败: {}", e);
            std::process::exit(1);
        }
    };

    // 获取下载URL列表
    let urls = match args.get_urls() {
        Ok(urls) => urls,
        Err(e) => {
            logger.error(&format!("获取URL列表失败: {}", e));
            eprintln!("获取URL列表失败: {}", e);
            std::process::exit(1);
        }
    };

    logger.info(&format!("解析到的URLs: {:?}", urls));
    logger.info(&format!("配置文件路径: {}", args.config));
    logger.info(&format!("配置摘要:\n{}", config.get_summary()));

    println!("配置加载成功");
    println!("{}", config.get_summary());

    // 组装引擎与元数据存储
    let engines: Vec<Arc<dyn TransferEngine>> = if config.simulate {
        vec![Arc::new(SimulatedTransferEngine::new(config.staging_dir.as_str()))]
    } else {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(config.timeout))
            .user_agent(config.user_agent.clone())
            .build()?;
        vec![Arc::new(
            HttpTransferEngine::new(config.staging_dir.as_str())?
                .with_client(client)
                .with_retry(config.retry_strategy()),
        )]
    };
    let store = Arc::new(FsMetadataStore::new(config.metadata_dir.as_str()));

    let orchestrator = DownloadOrchestrator::new(config.download_dir.as_str(), engines, store)
        .with_persist_progress_delta(config.persist_progress_delta)
        .start();

    // 激活：恢复上次进程留下的下载并清理孤儿元数据
    orchestrator.send(Activate).await?;
    logger.info("编排器已激活");

    // 创建所有下载
    let started = create_downloads(&orchestrator, &args, &urls, &logger, config.simulate).await;

    let listed = orchestrator.send(ListDownloads).await?;
    if started == 0 && listed.is_empty() {
        eprintln!("没有可下载的任务");
        return Ok(());
    }

    println!("\n开始下载... (按 'p' 暂停, 'r' 恢复, 'c' 取消, 'q' 退出)");
    logger.info(&format!("开始下载 {} 个任务", listed.len()));

    // 主循环：处理键盘输入和更新进度
    run_download_loop(&orchestrator, &logger).await?;

    Ok(())
}

/// 为每个URL创建下载，返回成功创建的数量
async fn create_downloads(
    orchestrator: &Addr<DownloadOrchestrator>,
    args: &cli::Args,
    urls: &[String],
    logger: &Addr<LoggerActor>,
    simulate: bool,
) -> usize {
    let mut started = 0;

    for url in urls {
        let message = match build_start_message(url, &args.title, simulate) {
            Ok(message) => message,
            Err(e) => {
                logger.error(&format!("无法解析下载参数: {} - {}", url, e));
                ui::print_error(&format!("无法解析下载参数: {} - {}", url, e));
                continue;
            }
        };

        let title = message.title.clone();
        match orchestrator.send(message).await {
            Ok(Ok(record)) => {
                started += 1;
                logger.info(&format!("创建下载: {} -> {}", url, record.relative_local_path()));
                ui::print_success(&format!("创建下载: {}", title));
            }
            Ok(Err(e)) => {
                logger.error(&format!("创建下载失败: {} - {}", url, e));
                ui::print_error(&format!("创建下载失败: {} - {}", url, e));
            }
            Err(e) => {
                logger.error(&format!("发送下载命令失败: {} - {}", url, e));
                ui::print_error(&format!("发送下载命令失败: {} - {}", url, e));
            }
        }
    }

    started
}

/// 把一个URL（模拟模式下是下载 ID）转换成启动命令
fn build_start_message(
    url: &str,
    custom_title: &Option<String>,
    simulate: bool,
) -> anyhow::Result<StartDownload> {
    if simulate {
        // 模拟模式：参数就是下载 ID，远端地址是占位符
        let id = url.to_string();
        let remote = Url::parse(&format!("https://simulated.invalid/{}.mp4", id))?;
        return Ok(StartDownload {
            id: id.clone(),
            title: custom_title.clone().unwrap_or_else(|| id.clone()),
            variants: vec![MediaVariant::new(Some(remote), Some(format!("{}.mp4", id)))],
        });
    }

    let remote = Url::parse(url)?;
    let file_name = extract_filename_from_url(url);
    let id = file_name
        .rsplit_once('.')
        .map(|(stem, _)| stem.to_string())
        .unwrap_or_else(|| file_name.clone());

    Ok(StartDownload {
        id,
        title: custom_title.clone().unwrap_or_else(|| file_name.clone()),
        variants: vec![MediaVariant::new(Some(remote), Some(file_name))],
    })
}

/// 从URL中提取文件名
fn extract_filename_from_url(url: &str) -> String {
    if let Some(last_slash) = url.rfind('/') {
        let filename = &url[last_slash + 1..];
        if !filename.is_empty() && !filename.contains('?') {
            return filename.to_string();
        }
    }

    // 如果无法从URL提取，使用默认名称
    format!("download_{}.mp4", chrono::Utc::now().timestamp())
}

/// 运行下载主循环
async fn run_download_loop(
    orchestrator: &Addr<DownloadOrchestrator>,
    logger: &Addr<LoggerActor>,
) -> anyhow::Result<()> {
    let mut last_update = std::time::Instant::now();

    // 设置终端
    terminal::enable_raw_mode()?;
    execute!(std::io::stdout(), cursor::Hide)?;

    let progress = ProgressManager::new();

    loop {
        // 处理键盘输入
        if let Ok(true) = event::poll(KEYBOARD_POLL_INTERVAL) {
            if let Ok(Event::Key(key_event)) = event::read() {
                match key_event.code {
                    KeyCode::Char('q') | KeyCode::Char('Q') => {
                        println!("\n用户退出（在途下载会在下次启动时恢复）");
                        logger.info("用户主动退出下载");
                        break;
                    }
                    KeyCode::Char('p') | KeyCode::Char('P') => {
                        // 暂停所有进行中的下载
                        let snapshots = orchestrator.send(ListDownloads).await?;
                        for snapshot in &snapshots {
                            if snapshot.record.state().progress().is_some()
                                && !snapshot.record.state().is_paused()
                            {
                                orchestrator.do_send(PauseDownload {
                                    id: snapshot.record.id().to_string(),
                                });
                            }
                        }
                        logger.info("用户暂停所有下载");
                    }
                    KeyCode::Char('r') | KeyCode::Char('R') => {
                        // 恢复所有已暂停的下载
                        let snapshots = orchestrator.send(ListDownloads).await?;
                        for snapshot in &snapshots {
                            if snapshot.record.state().is_paused() {
                                orchestrator.do_send(ResumeDownload {
                                    id: snapshot.record.id().to_string(),
                                });
                            }
                        }
                        logger.info("用户恢复所有下载");
                    }
                    KeyCode::Char('c') | KeyCode::Char('C') => {
                        // 取消所有未完成的下载
                        let snapshots = orchestrator.send(ListDownloads).await?;
                        for snapshot in &snapshots {
                            if !snapshot.record.state().is_final()
                                && !snapshot.record.state().is_failed()
                            {
                                orchestrator.do_send(CancelDownload {
                                    id: snapshot.record.id().to_string(),
                                });
                            }
                        }
                        logger.info("用户取消所有下载");
                        break;
                    }
                    _ => {}
                }
            }
        }

        // 更新进度
        if last_update.elapsed() >= PROGRESS_UPDATE_INTERVAL {
            let snapshots = orchestrator.send(ListDownloads).await?;
            progress.sync(&snapshots);

            // 全部到达不再推进的状态时退出
            let all_settled = !snapshots.is_empty()
                && snapshots.iter().all(|s| {
                    let state = s.record.state();
                    state.is_final() || state.is_failed()
                });
            if all_settled {
                break;
            }

            last_update = std::time::Instant::now();
        }

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    // 恢复终端
    execute!(std::io::stdout(), cursor::Show)?;
    terminal::disable_raw_mode()?;
    progress.finish();

    // 显示最终统计
    let snapshots = orchestrator.send(ListDownloads).await?;
    let summary = DownloadSummary::from_snapshots(&snapshots);
    println!("{}", summary);

    logger.info(&format!("下载结束 - 成功: {}, 失败: {}", summary.completed, summary.failed));

    Ok(())
}
