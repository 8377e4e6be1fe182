//! # 日志初始化模块
//!
//! 为路由核心提供统一的 tracing 日志初始化能力。

use tracing_subscriber::{EnvFilter, fmt};

use crate::config::LoggingConfig;

/// 从配置初始化日志系统
///
/// # 参数
/// * `logging_config` - 日志配置（可选），如果为 None 则使用默认配置（info 级别）
///
/// 优先使用环境变量 RUST_LOG，其次使用配置中的级别。
/// 重复初始化（例如测试中）会被忽略。
///
/// # 示例
/// ```rust,ignore
/// use flare_im_route::config::LoggingConfig;
/// use flare_im_route::tracing::init_tracing_from_config;
///
/// let config = LoggingConfig {
///     level: "debug".to_string(),
///     json: true,
///     ..LoggingConfig::default()
/// };
/// init_tracing_from_config(Some(&config));
/// ```
pub fn init_tracing_from_config(logging_config: Option<&LoggingConfig>) {
    let default_config = LoggingConfig::default();
    let config = logging_config.unwrap_or(&default_config);

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new(config.level.as_str()),
    };

    let builder = fmt::Subscriber::builder()
        .with_target(config.with_target)
        .with_thread_ids(config.with_thread_ids)
        .with_file(config.with_file)
        .with_line_number(config.with_line_number)
        .with_env_filter(env_filter);

    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    if let Err(e) = result {
        eprintln!("tracing subscriber already initialized: {e}");
    }
}
