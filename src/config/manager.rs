//! 配置管理器 - 负责环境覆盖与配置热加载
//!
//! 该模块提供了配置管理功能，包括：
//! - 加载环境特定配置（`FLARE_ENV`）
//! - 持有不可变配置快照，文件变更后原子替换
//! - 读取方始终看到完整的配置快照，不会读到半更新状态

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use arc_swap::ArcSwap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use toml::Value;
use tracing::{debug, info, warn};

use super::{CONFIG_LAYERS, RouteAppConfig, load_config, load_toml_value, merge_value, toml_fragments};

/// 配置管理器
pub struct ConfigManager {
    source: PathBuf,
    current: ArcSwap<RouteAppConfig>,
}

impl ConfigManager {
    /// 加载初始配置，失败即返回（启动期致命错误）
    pub fn load(source: impl Into<PathBuf>) -> crate::error::Result<Arc<Self>> {
        let source = source.into();
        let cfg = load_config(&source)?;
        info!(
            source = %source.display(),
            node_id = %cfg.node.node_id,
            "Configuration loaded"
        );
        Ok(Arc::new(Self {
            source,
            current: ArcSwap::from_pointee(cfg),
        }))
    }

    /// 使用现成的配置快照创建（不关联文件，热加载不可用）
    pub fn from_config(cfg: RouteAppConfig) -> Arc<Self> {
        Arc::new(Self {
            source: PathBuf::new(),
            current: ArcSwap::from_pointee(cfg),
        })
    }

    /// 获取当前配置快照
    pub fn snapshot(&self) -> Arc<RouteAppConfig> {
        self.current.load_full()
    }

    /// 重新加载配置
    ///
    /// 新配置加载或校验失败时保留旧快照并返回错误。
    pub fn reload(&self) -> crate::error::Result<Arc<RouteAppConfig>> {
        let cfg = Arc::new(load_config(&self.source)?);
        self.current.store(cfg.clone());
        info!(
            source = %self.source.display(),
            node_id = %cfg.node.node_id,
            "Configuration reloaded"
        );
        Ok(cfg)
    }

    /// 启动文件变更监听
    ///
    /// 按 `poll_interval` 轮询配置源的修改时间，变更后重新加载并原子替换快照。
    pub fn watch(
        self: &Arc<Self>,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut last_seen = latest_modified(&manager.source);
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(source = %manager.source.display(), "Configuration watcher stopped");
                        return;
                    }
                    _ = ticker.tick() => {}
                }

                let modified = latest_modified(&manager.source);
                if modified.is_none() || modified == last_seen {
                    continue;
                }
                last_seen = modified;

                if let Err(e) = manager.reload() {
                    warn!(
                        source = %manager.source.display(),
                        error = %e,
                        "Configuration reload failed, keeping previous snapshot"
                    );
                }
            }
        })
    }

    /// 获取当前环境名称
    ///
    /// 从环境变量 FLARE_ENV 获取当前环境名称，
    /// 如果未设置则默认为 "development"
    pub fn get_environment() -> String {
        env::var("FLARE_ENV").unwrap_or_else(|_| "development".to_string())
    }

    /// 叠加环境特定配置
    ///
    /// 加载 config/environments/{environment}.toml 文件并深度合并到基础配置中
    pub(crate) fn merge_environment_overlay(base: &mut Value) -> Result<()> {
        let env = Self::get_environment();
        let env_config_path = PathBuf::from(format!("config/environments/{}.toml", env));

        if env_config_path.exists() {
            let overlay = load_toml_value(&env_config_path)?;
            merge_value(base, overlay);
            debug!(environment = %env, "Environment configuration merged");
        }

        Ok(())
    }
}

/// 配置源最近修改时间（目录时取 base.toml 与各层片段中的最大值）
fn latest_modified(source: &Path) -> Option<SystemTime> {
    let modified = |path: &Path| path.metadata().and_then(|m| m.modified()).ok();

    if !source.is_dir() {
        return modified(source);
    }

    let mut latest = modified(&source.join("base.toml"));
    for layer in CONFIG_LAYERS {
        let Ok(fragments) = toml_fragments(&source.join(layer)) else {
            continue;
        };
        for fragment in fragments {
            latest = latest.max(modified(&fragment));
        }
    }
    latest
}
