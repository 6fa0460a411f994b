use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::core::error::DownloadError;
use crate::engines::RetryStrategy;

/// 配置结构体
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// 下载根目录，完成的媒体文件按相对路径放在这里
    pub download_dir: String,
    /// 下载记录元数据目录
    pub metadata_dir: String,
    /// 传输中字节的暂存目录
    pub staging_dir: String,
    /// 进度持久化阈值（0.0 - 1.0），进度变化超过该值才写元数据
    pub persist_progress_delta: f32,
    /// 网络连接超时时间（秒）
    pub timeout: u64,
    /// User-Agent
    pub user_agent: String,
    /// 重试次数
    pub retry_count: usize,
    /// 重试延迟（秒）
    pub retry_delay: u64,
    /// 最大重试延迟（秒）
    pub retry_max_delay: u64,
    /// 使用模拟引擎代替真实网络传输（开发调试用）
    pub simulate: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: "./downloads".to_string(),
            metadata_dir: "./downloads/.metadata".to_string(),
            staging_dir: "./downloads/.staging".to_string(),
            persist_progress_delta: 0.1,
            timeout: 30,
            user_agent: "mediadown/0.1".to_string(),
            retry_count: 3,
            retry_delay: 5,
            retry_max_delay: 60,
            simulate: false,
        }
    }
}

impl Config {
    /// 加载配置文件
    pub fn load(path: &str) -> Result<Self, DownloadError> {
        if Path::new(path).exists() {
            let content = fs::read_to_string(path)?;
            // 尝试解析TOML
            match toml::from_str(&content) {
                Ok(config) => Ok(config),
                Err(e) => {
                    eprintln!("配置文件格式错误: {}，将使用默认配置", e);
                    let config = Config::default();
                    Config::save_with_tutorial(&config, path)?;
                    Ok(config)
                }
            }
        } else {
            let config = Config::default();
            Config::save_with_tutorial(&config, path)?;
            Ok(config)
        }
    }

    /// 保存带教程的配置文件（唯一写入方法）
    pub fn save_with_tutorial(&self, path: &str) -> Result<(), DownloadError> {
        if let Some(parent) = Path::new(path).parent() {
            fs::create_dir_all(parent)?;
        }
        let tutorial_content = Config::generate_tutorial_content();
        let config_content = toml::to_string_pretty(self)
            .map_err(|e| DownloadError::Unknown(format!("无法序列化配置: {}", e)))?;
        let full_content = format!("{}\n\n{}", tutorial_content, config_content);
        fs::write(path, full_content)?;
        Ok(())
    }

    /// 生成配置文件教程内容（静态方法）
    fn generate_tutorial_content() -> String {
        r#"# mediadown 配置文件
# ====================
#
# 这是一个 TOML 格式的配置文件，用于配置 mediadown 会议媒体下载器的行为。
# 你可以根据需要修改这些设置，然后保存文件。
#
# 命令行参数会覆盖配置文件中的设置，优先级：命令行 > 配置文件 > 默认值
#
# 使用示例：
#   mediadown https://example.com/session.mp4                 # 使用默认配置
#   mediadown -d /path/to/media https://example.com/s.mp4     # 指定下载目录
#   mediadown --simulate FAILTHIS                             # 用模拟引擎调试失败路径

# ==================== 目录设置 ====================

# 下载根目录
# 完成的媒体文件按相对路径放在这里
download_dir = "./downloads"

# 元数据目录
# 每条下载记录一个 JSON 快照，进程重启后据此恢复
metadata_dir = "./downloads/.metadata"

# 暂存目录
# 传输中的字节先落在这里，完成后原子移动到下载根目录
staging_dir = "./downloads/.staging"

# ==================== 持久化设置 ====================

# 进度持久化阈值（0.0 - 1.0）
# 下载中的进度变化超过该值才写一次元数据，限制写放大
# 状态变化（暂停/失败/完成）总是立即落盘
persist_progress_delta = 0.1

# ==================== 网络设置 ====================

# 网络连接超时时间（秒）
timeout = 30

# User-Agent 字符串
user_agent = "mediadown/0.1"

# ==================== 重试设置 ====================

# 瞬态网络错误的自动重试次数，用尽后标记失败等待手动重试
retry_count = 3

# 重试延迟（秒），指数退避的基数
retry_delay = 5

# 最大重试延迟（秒）
retry_max_delay = 60

# ==================== 调试设置 ====================

# 使用模拟引擎代替真实网络传输
# 模拟引擎用定时器推进进度，下载 ID 为 FAILTHIS 时在 20% 处失败
simulate = false

# ==================== 故障排除 ====================
#
# 问题：经常下载失败
# 解决：增加 retry_count 或 timeout 值
#
# 问题：重启后下载丢失
# 解决：确认 metadata_dir 可写且没有被清理
#
# 问题：磁盘写入频繁
# 解决：增大 persist_progress_delta

# ==================== 配置项说明 ====================
"#
        .to_string()
    }

    /// 校验配置合法性
    pub fn validate(&self) -> Result<(), DownloadError> {
        // 验证下载目录
        if self.download_dir.is_empty() {
            return Err(DownloadError::Unknown("下载目录不能为空".to_string()));
        }

        // 验证元数据与暂存目录
        if self.metadata_dir.is_empty() {
            return Err(DownloadError::Unknown("元数据目录不能为空".to_string()));
        }
        if self.staging_dir.is_empty() {
            return Err(DownloadError::Unknown("暂存目录不能为空".to_string()));
        }

        // 验证持久化阈值
        if !(0.0..=1.0).contains(&self.persist_progress_delta) {
            return Err(DownloadError::Unknown(
                "进度持久化阈值必须在 0.0 到 1.0 之间".to_string(),
            ));
        }

        // 验证超时时间
        if self.timeout == 0 {
            return Err(DownloadError::Unknown("超时时间必须大于0".to_string()));
        }

        Ok(())
    }

    /// 合并命令行参数到配置
    pub fn merge_from_args(&mut self, args: &crate::cli::Args) {
        // 命令行参数覆盖配置文件
        if let Some(download_dir) = &args.download_dir {
            self.download_dir = download_dir.clone();
        }

        if args.simulate {
            self.simulate = true;
        }
    }

    /// 引擎用的重试策略
    pub fn retry_strategy(&self) -> RetryStrategy {
        RetryStrategy::new(
            self.retry_count,
            Duration::from_secs(self.retry_delay),
            Duration::from_secs(self.retry_max_delay),
        )
    }

    /// 获取配置摘要信息
    pub fn get_summary(&self) -> String {
        format!(
            "配置摘要:\n\
            - 下载目录: {}\n\
            - 元数据目录: {}\n\
            - 暂存目录: {}\n\
            - 持久化阈值: {:.0}%\n\
            - 超时时间: {} 秒\n\
            - 重试次数: {}\n\
            - 模拟引擎: {}",
            self.download_dir,
            self.metadata_dir,
            self.staging_dir,
            self.persist_progress_delta * 100.0,
            self.timeout,
            self.retry_count,
            if self.simulate { "启用" } else { "禁用" }
        )
    }
}
