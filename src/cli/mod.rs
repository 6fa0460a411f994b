//! CLI: 命令行接口和参数解析模块
//!
//! ## 主要功能
//!
//! - 命令行参数解析和验证
//! - 配置文件路径管理
//! - URL 列表处理（命令行参数和文件）
//! - 配置文件编辑器集成
//!
//! ## 支持的命令
//!
//! - 基本下载：`mediadown <url>`
//! - 批量下载：`mediadown -f urls.txt`
//! - 编辑配置：`mediadown -e`
//! - 指定配置：`mediadown -c config.conf <url>`
//! - 模拟引擎：`mediadown --simulate <id>`

use clap::Parser;
use std::env;
use std::fs;
use std::path::Path;

use crate::config::Config;
use crate::core::error::DownloadError;

/// 获取平台默认配置文件路径
pub fn default_config_path() -> String {
    #[cfg(target_os = "windows")]
    {
        let appdata = env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
        format!("{}/mediadown/mediadown.conf", appdata)
    }
    #[cfg(target_os = "macos")]
    {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{}/Library/Application Support/mediadown/mediadown.conf", home)
    }
    #[cfg(target_os = "linux")]
    {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{}/.config/mediadown/mediadown.conf", home)
    }
}

/// 打开配置文件编辑器
pub fn open_config_in_editor(config_path: &str) {
    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("notepad").arg(config_path).status().ok();
    }
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("open").arg("-e").arg(config_path).status().ok();
    }
    #[cfg(target_os = "linux")]
    {
        // 优先 xdg-open，否则 nano
        if std::process::Command::new("xdg-open").arg(config_path).status().is_err() {
            let _ = std::process::Command::new("nano").arg(config_path).status();
        }
    }
}

/// mediadown 命令行参数
///
/// 示例用法：
///   mediadown https://example.com/session.mp4
///   mediadown -e  # 编辑配置文件
///   mediadown -c /path/to/config.conf https://example.com/session.mp4
///   mediadown --simulate FAILTHIS
///
/// 更多用法请加 --help 查看
#[derive(Parser, Debug, Clone)]
#[command(
    name = "mediadown",
    author = "panzhifu",
    version = env!("CARGO_PKG_VERSION"),
    about = "一个用 Rust 编写的会议媒体后台下载管理器",
    long_about = "支持断点续传、崩溃恢复和实时进度显示的会议媒体下载管理器。\n\n示例：\n  mediadown https://example.com/session.mp4\n  mediadown -e\n  mediadown -c /path/to/config.conf https://example.com/session.mp4\n  mediadown --simulate FAILTHIS\n"
)]
pub struct Args {
    /// 要下载的URL列表（可同时指定多个）
    #[arg(required = false, help = "要下载的媒体URL列表，可以同时指定多个URL。")]
    pub urls: Vec<String>,

    /// 包含URL列表的文件路径
    #[arg(short, long, help = "包含URL列表的文件路径，每行一个URL。")]
    pub file: Option<String>,

    /// 配置文件路径，默认为平台推荐路径
    #[arg(short = 'c', long, default_value_t = default_config_path(), help = "配置文件路径，默认为平台推荐路径。")]
    pub config: String,

    /// 编辑配置文件（-e 或 --edit）
    #[arg(short = 'e', long = "edit", help = "用系统默认编辑器打开配置文件并退出。")]
    pub edit_config: bool,

    /// 指定下载目录
    #[arg(long, short = 'd', help = "指定下载根目录，覆盖配置文件中的设置。")]
    pub download_dir: Option<String>,

    /// 指定下载标题
    #[arg(long, short = 'n', help = "指定展示标题，覆盖URL自动推断。")]
    pub title: Option<String>,

    /// 使用模拟引擎，URL 参数被当作下载 ID
    #[arg(long, help = "使用模拟引擎代替真实网络传输，参数被当作下载 ID（FAILTHIS 会在 20% 处失败）。")]
    pub simulate: bool,
}

impl Args {
    pub fn parse_args() -> Result<(Self, Config), DownloadError> {
        let args = Args::parse();

        // --edit-config 逻辑
        if args.edit_config {
            open_config_in_editor(&args.config);
            std::process::exit(0);
        }

        // 加载或创建配置文件
        let mut config = Config::load(&args.config)?;

        // 合并命令行参数到配置
        config.merge_from_args(&args);

        // 验证配置
        config.validate()?;

        Ok((args, config))
    }

    /// 汇总命令行与文件里的URL列表
    pub fn get_urls(&self) -> Result<Vec<String>, DownloadError> {
        let mut urls = Vec::new();
        urls.extend_from_slice(&self.urls);

        // 如果提供了文件，从文件中读取URL
        if let Some(file_path) = &self.file {
            if !Path::new(file_path).exists() {
                return Err(DownloadError::Unknown(format!("URL文件不存在: {}", file_path)));
            }
            let content = fs::read_to_string(file_path)?;

            // 按行读取URL，忽略空行和注释
            for line in content.lines() {
                let line = line.trim();
                if !line.is_empty() && !line.starts_with('#') {
                    // 模拟模式下参数是下载 ID，不是 URL
                    if !self.simulate && !crate::utils::validator::is_valid_url(line) {
                        return Err(DownloadError::InvalidUrl(line.to_string()));
                    }
                    urls.push(line.to_string());
                }
            }
        }

        // 验证URL列表不为空
        if urls.is_empty() {
            return Err(DownloadError::InvalidUrl(
                "未提供任何URL。请通过命令行参数或文件提供至少一个URL。".to_string(),
            ));
        }

        Ok(urls)
    }
}
