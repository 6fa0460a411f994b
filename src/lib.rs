//! mediadown: 会议媒体后台下载管理器
//!
//! 核心是 `core::orchestrator::DownloadOrchestrator`：一个持有全部
//! 权威下载状态的 actor，把字节搬运委托给可插拔的传输引擎，
//! 把记录快照委托给可插拔的元数据存储，进程重启后据此恢复。

pub mod cli;
pub mod config;
pub mod core;
pub mod engines;
pub mod store;
pub mod ui;
pub mod utils;
