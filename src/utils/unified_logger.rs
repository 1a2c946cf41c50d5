/// 统一日志管理模块
/// 控制台 + 按大小轮转的文件日志，底层使用 log4rs
use anyhow::{anyhow, Result};
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::rolling_file::policy::compound::roll::fixed_window::FixedWindowRoller;
use log4rs::append::rolling_file::policy::compound::trigger::size::SizeTrigger;
use log4rs::append::rolling_file::policy::compound::CompoundPolicy;
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub root_dir: String,
    pub default_level: String,
    pub max_file_size_mb: u64,
    /// 保留的轮转文件数
    pub retention_files: u32,
    pub console_output: bool,
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            root_dir: "logs".to_string(),
            default_level: "INFO".to_string(),
            max_file_size_mb: 10,
            retention_files: 30,
            console_output: true,
            format: "[{d(%Y-%m-%d %H:%M:%S%.3f)}] [{l}] [{M}] {m}{n}".to_string(),
        }
    }
}

impl LogConfig {
    /// 获取日志级别
    pub fn level_filter(&self) -> LevelFilter {
        match self.default_level.to_uppercase().as_str() {
            "TRACE" => LevelFilter::Trace,
            "DEBUG" => LevelFilter::Debug,
            "INFO" => LevelFilter::Info,
            "WARN" => LevelFilter::Warn,
            "ERROR" => LevelFilter::Error,
            _ => LevelFilter::Info,
        }
    }

    /// 当前日志文件路径
    pub fn log_file_path(&self) -> String {
        format!("{}/system/engine.log", self.root_dir)
    }

    fn rotated_pattern(&self) -> String {
        format!("{}/system/engine.{{}}.log", self.root_dir)
    }
}

/// 初始化全局日志器
pub fn init_logger(config: &LogConfig) -> Result<()> {
    let system_dir = format!("{}/system", config.root_dir);
    if !Path::new(&system_dir).exists() {
        fs::create_dir_all(&system_dir)?;
    }

    let roller = FixedWindowRoller::builder()
        .build(&config.rotated_pattern(), config.retention_files.max(1))
        .map_err(|e| anyhow!("创建日志轮转器失败: {}", e))?;
    let trigger = SizeTrigger::new(config.max_file_size_mb.max(1) * 1024 * 1024);
    let policy = CompoundPolicy::new(Box::new(trigger), Box::new(roller));

    let file = RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(&config.format)))
        .build(config.log_file_path(), Box::new(policy))
        .map_err(|e| anyhow!("打开日志文件失败: {}", e))?;

    let mut builder = Config::builder().appender(Appender::builder().build("file", Box::new(file)));
    let mut root = Root::builder().appender("file");

    if config.console_output {
        let console = ConsoleAppender::builder()
            .encoder(Box::new(PatternEncoder::new(&config.format)))
            .build();
        builder = builder.appender(Appender::builder().build("console", Box::new(console)));
        root = root.appender("console");
    }

    let log_config = builder
        .build(root.build(config.level_filter()))
        .map_err(|e| anyhow!("日志配置无效: {}", e))?;
    log4rs::init_config(log_config).map_err(|e| anyhow!("日志器已初始化: {}", e))?;

    log::info!(
        "日志系统已初始化: 级别={} 文件={}",
        config.default_level,
        config.log_file_path()
    );
    Ok(())
}

// 日志文件命名规范：
// - 当前日志: {root_dir}/system/engine.log
// - 轮转日志: {root_dir}/system/engine.{N}.log
