//! 多线路故障转移
//!
//! 每条线路维护一份健康状态（连续失败次数、最近成功/失败时间、冷却截止时间），
//! 整个文档在初始化时从 [`RouteHealthStore`] 读取，每次上报后整体写回，进程重启后冷却依然有效。
//!
//! 没有可用线路时仍然返回冷却中的线路，并标记为降级选择。

use std::cmp::Ordering;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use taskgate_core::{
    clock::{add_duration, exponential_backoff},
    config::RouteSettings,
    Clock, DispatchError, DispatchResult, RouteAttempt, RouteDefinition, RouteHealth,
    RouteHealthDocument, RouteHealthStore, RouteStatus,
};

#[derive(Debug, Clone)]
pub struct RouteManagerConfig {
    pub cooldown_base: Duration,
    pub max_cooldown: Duration,
    /// 冷却时间下限
    pub cooldown_floor: Duration,
    pub max_tries: usize,
}

impl Default for RouteManagerConfig {
    fn default() -> Self {
        Self {
            cooldown_base: Duration::from_millis(1000),
            max_cooldown: Duration::from_millis(300_000),
            cooldown_floor: Duration::ZERO,
            max_tries: 3,
        }
    }
}

impl From<&RouteSettings> for RouteManagerConfig {
    fn from(settings: &RouteSettings) -> Self {
        Self {
            cooldown_base: Duration::from_millis(settings.cooldown_base_ms),
            max_cooldown: Duration::from_millis(settings.max_cooldown_ms),
            cooldown_floor: Duration::from_millis(settings.cooldown_floor_ms),
            max_tries: settings.max_tries,
        }
    }
}

/// 按可用性划分的线路
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvailableRoutes {
    /// 权重降序，其次最近成功时间降序，其次失败次数升序
    pub active: Vec<String>,
    /// 最先结束冷却的在前
    pub cooling: Vec<String>,
}

impl AvailableRoutes {
    /// active 在前，cooling 在后的完整顺序
    pub fn ordered(&self) -> impl Iterator<Item = &String> {
        self.active.iter().chain(self.cooling.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSelection {
    pub route: String,
    /// 选中的线路仍在冷却中
    pub degraded: bool,
}

pub struct RouteManager {
    routes: Vec<RouteDefinition>,
    config: RouteManagerConfig,
    store: Arc<dyn RouteHealthStore>,
    clock: Arc<dyn Clock>,
    health: Mutex<RouteHealthDocument>,
}

impl RouteManager {
    /// 创建线路管理器并加载已持久化的健康状态
    pub async fn new(
        routes: Vec<RouteDefinition>,
        config: RouteManagerConfig,
        store: Arc<dyn RouteHealthStore>,
        clock: Arc<dyn Clock>,
    ) -> DispatchResult<Self> {
        let health = store.load().await?;
        info!(
            "线路管理器初始化: {} 条线路, 已加载 {} 条健康记录",
            routes.len(),
            health.len()
        );
        Ok(Self {
            routes,
            config,
            store,
            clock,
            health: Mutex::new(health),
        })
    }

    pub async fn from_settings(
        settings: &RouteSettings,
        store: Arc<dyn RouteHealthStore>,
        clock: Arc<dyn Clock>,
    ) -> DispatchResult<Self> {
        let routes = settings
            .routes
            .iter()
            .map(|r| RouteDefinition::new(r.name.clone(), r.weight))
            .collect();
        Self::new(routes, RouteManagerConfig::from(settings), store, clock).await
    }

    pub fn routes(&self) -> &[RouteDefinition] {
        &self.routes
    }

    pub fn max_tries(&self) -> usize {
        self.config.max_tries
    }

    pub async fn available_routes(&self) -> AvailableRoutes {
        let health = self.health.lock().await;
        self.partition(&health)
    }

    fn partition(&self, health: &RouteHealthDocument) -> AvailableRoutes {
        let now = self.clock.now();
        let empty = RouteHealth::default();
        let (mut active, mut cooling): (Vec<_>, Vec<_>) = self
            .routes
            .iter()
            .map(|route| (route, health.get(&route.name).unwrap_or(&empty)))
            .partition(|(_, h)| !h.is_cooling(now));

        // sort_by 是稳定排序，完全相同的线路保持配置顺序
        active.sort_by(|(a, ha), (b, hb)| {
            b.weight
                .cmp(&a.weight)
                .then_with(|| compare_recent_success(ha, hb))
                .then_with(|| ha.failures.cmp(&hb.failures))
        });
        cooling.sort_by(|(_, ha), (_, hb)| ha.cooldown_until.cmp(&hb.cooldown_until));

        AvailableRoutes {
            active: active.into_iter().map(|(r, _)| r.name.clone()).collect(),
            cooling: cooling.into_iter().map(|(r, _)| r.name.clone()).collect(),
        }
    }

    /// 优先返回可用线路，否则返回最快结束冷却的线路
    pub async fn pick_route(&self) -> Option<RouteSelection> {
        let available = self.available_routes().await;
        if let Some(route) = available.active.into_iter().next() {
            return Some(RouteSelection {
                route,
                degraded: false,
            });
        }
        let route = available.cooling.into_iter().next()?;
        warn!("所有线路都在冷却中，降级选择线路: {}", route);
        Some(RouteSelection {
            route,
            degraded: true,
        })
    }

    /// 上报成功并持久化；保存失败时内存状态回滚，与持久化文档保持一致
    pub async fn report_success(&self, route: &str) -> DispatchResult<()> {
        let now = self.clock.now();
        let mut health = self.health.lock().await;
        let previous = health.get(route).cloned();
        let entry = health.entry(route.to_string()).or_default();
        if entry.failures > 0 {
            info!("线路 {} 恢复 (之前连续失败 {} 次)", route, entry.failures);
        }
        entry.failures = 0;
        entry.cooldown_until = None;
        entry.last_success_at = Some(now);
        self.persist(&mut health, route, previous).await
    }

    /// 上报失败、进入冷却并持久化；保存失败时同样回滚
    pub async fn report_failure(&self, route: &str) -> DispatchResult<()> {
        let now = self.clock.now();
        let mut health = self.health.lock().await;
        let previous = health.get(route).cloned();
        let entry = health.entry(route.to_string()).or_default();
        entry.failures = entry.failures.saturating_add(1);
        entry.last_failure_at = Some(now);

        let cooldown = exponential_backoff(
            entry.failures,
            self.config.cooldown_base,
            self.config.max_cooldown,
        )
        .max(self.config.cooldown_floor);
        entry.cooldown_until = Some(add_duration(now, cooldown));

        metrics::counter!("taskgate_route_failures_total", "route" => route.to_string())
            .increment(1);
        warn!(
            "线路 {} 失败 {} 次，冷却 {:?}",
            route, entry.failures, cooldown
        );
        self.persist(&mut health, route, previous).await
    }

    async fn persist(
        &self,
        health: &mut RouteHealthDocument,
        route: &str,
        previous: Option<RouteHealth>,
    ) -> DispatchResult<()> {
        if let Err(e) = self.store.save(health).await {
            error!("保存线路 {} 健康状态失败，回滚本次上报: {}", route, e);
            match previous {
                Some(previous) => {
                    health.insert(route.to_string(), previous);
                }
                None => {
                    health.remove(route);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// 按 active + cooling 的顺序依次尝试，最多 `max_tries` 条线路
    ///
    /// 第一条成功的线路立即返回；全部失败时返回 [`DispatchError::AllRoutesFailed`]，
    /// 其中按尝试顺序列出每条线路的错误。`max_tries` 为0时返回 [`DispatchError::Validation`]。
    ///
    /// 健康状态保存失败时：失败路径立即返回存储错误，不再尝试后续线路；
    /// 成功路径仍返回结果（操作已经完成），只记录错误，内存状态已回滚。
    pub async fn with_failover<F, Fut, T>(&self, mut executor: F, max_tries: usize) -> DispatchResult<T>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = DispatchResult<T>>,
    {
        if self.routes.is_empty() {
            return Err(DispatchError::NoRoutesConfigured);
        }
        if max_tries == 0 {
            return Err(DispatchError::Validation("max_tries 必须大于0".to_string()));
        }

        let ordered: Vec<String> = self
            .available_routes()
            .await
            .ordered()
            .take(max_tries)
            .cloned()
            .collect();

        let mut attempts = Vec::with_capacity(ordered.len());
        for route in ordered {
            debug!("尝试线路: {}", route);
            match executor(route.clone()).await {
                Ok(value) => {
                    if let Err(e) = self.report_success(&route).await {
                        warn!("线路 {} 已成功，但健康状态未能保存: {}", route, e);
                    }
                    return Ok(value);
                }
                Err(error) => {
                    self.report_failure(&route).await?;
                    attempts.push(RouteAttempt {
                        route,
                        error: error.to_string(),
                    });
                }
            }
        }

        Err(DispatchError::AllRoutesFailed { attempts })
    }

    /// 按当前排序返回所有线路的健康快照
    pub async fn statuses(&self) -> Vec<RouteStatus> {
        let now = self.clock.now();
        let health = self.health.lock().await;
        let available = self.partition(&health);
        available
            .ordered()
            .filter_map(|name| self.routes.iter().find(|r| &r.name == name))
            .map(|route| {
                let health = health.get(&route.name).cloned().unwrap_or_default();
                RouteStatus {
                    name: route.name.clone(),
                    weight: route.weight,
                    cooling: health.is_cooling(now),
                    health,
                }
            })
            .collect()
    }
}

/// 最近成功的排前面，从未成功的排最后
fn compare_recent_success(a: &RouteHealth, b: &RouteHealth) -> Ordering {
    match (a.last_success_at, b.last_success_at) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
