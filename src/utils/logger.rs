use actix::prelude::*;
use chrono::Local;
use log::LevelFilter;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

/// 日志消息
pub struct LogMsg {
    pub level: LevelFilter,
    pub message: String,
}
impl Message for LogMsg {
    type Result = ();
}

/// 应用日志Actor：追加写入单个日志文件，超过上限时轮转
///
/// 引擎与编排器内部走 `log` 宏；这个 actor 只承载应用层面的
/// 关键事件（启动、命令、退出），便于事后排查。
pub struct LoggerActor {
    writer: BufWriter<File>,
    level: LevelFilter,
    file_path: String,
    /// 最大文件大小 (bytes)
    max_size: u64,
    current_size: u64,
}

impl LoggerActor {
    pub fn new(file_path: &str, level: LevelFilter, max_size: u64) -> Result<Self, std::io::Error> {
        // 确保日志目录存在
        if let Some(parent) = Path::new(file_path).parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(file_path)?;
        let current_size = file.metadata().map(|m| m.len()).unwrap_or(0);

        Ok(Self {
            writer: BufWriter::new(file),
            level,
            file_path: file_path.to_string(),
            max_size,
            current_size,
        })
    }

    /// 检查并执行日志轮转
    fn check_rotation(&mut self) -> Result<(), std::io::Error> {
        if self.current_size > self.max_size {
            self.writer.flush()?;

            let backup_path = format!("{}.backup", self.file_path);
            if Path::new(&backup_path).exists() {
                std::fs::remove_file(&backup_path)?;
            }
            std::fs::rename(&self.file_path, &backup_path)?;

            let file = OpenOptions::new().create(true).append(true).open(&self.file_path)?;
            self.writer = BufWriter::new(file);
            self.current_size = 0;
        }
        Ok(())
    }

    fn write_log(&mut self, level: LevelFilter, message: &str) -> Result<(), std::io::Error> {
        if level <= self.level {
            let log_entry = format!(
                "{} [{}] - {}\n",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                level,
                message
            );

            self.check_rotation()?;

            self.writer.write_all(log_entry.as_bytes())?;
            self.current_size += log_entry.len() as u64;

            // 定期刷新缓冲区
            if self.current_size % 1024 < log_entry.len() as u64 {
                self.writer.flush()?;
            }
        }
        Ok(())
    }
}

impl Actor for LoggerActor {
    type Context = Context<Self>;

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        let _ = self.writer.flush();
    }
}

impl Handler<LogMsg> for LoggerActor {
    type Result = ();
    fn handle(&mut self, msg: LogMsg, _ctx: &mut Self::Context) {
        if let Err(e) = self.write_log(msg.level, &msg.message) {
            eprintln!("日志写入失败: {}", e);
        }
    }
}

// 便捷的日志方法 - 为Addr<LoggerActor>提供扩展方法
pub trait LoggerExt {
    fn info(&self, message: &str);
    fn error(&self, message: &str);
    fn warn(&self, message: &str);
    fn debug(&self, message: &str);
}

impl LoggerExt for Addr<LoggerActor> {
    fn info(&self, message: &str) {
        self.do_send(LogMsg { level: LevelFilter::Info, message: message.to_string() });
    }

    fn error(&self, message: &str) {
        self.do_send(LogMsg { level: LevelFilter::Error, message: message.to_string() });
    }

    fn warn(&self, message: &str) {
        self.do_send(LogMsg { level: LevelFilter::Warn, message: message.to_string() });
    }

    fn debug(&self, message: &str) {
        self.do_send(LogMsg { level: LevelFilter::Debug, message: message.to_string() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[actix_rt::test]
    async fn test_logger_writes_and_filters() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        let path_str = path.to_str().unwrap().to_string();

        let addr = LoggerActor::new(&path_str, LevelFilter::Info, 1024 * 1024)
            .unwrap()
            .start();
        addr.info("启动");
        addr.debug("被过滤的调试信息");
        addr.error("出错了");

        // 等消息处理完并停掉 actor 触发 flush
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        drop(addr);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("启动"));
        assert!(content.contains("出错了"));
        assert!(!content.contains("被过滤的调试信息"));
    }
}
