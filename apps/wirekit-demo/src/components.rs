//! Demo components: a small service graph wired through the registry.
//!
//! settings ← database ← cache ← api, plus a scoped request context and a
//! transient id generator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;
use wirekit::{
    CancellationToken, Component, ComponentDescriptor, ComponentHost, HealthReport,
};

/// Static settings registered as a pre-built instance.
#[derive(Debug, Clone)]
pub struct Settings {
    pub service_name: String,
    pub pool_size: u32,
    pub cache_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            service_name: "wirekit-demo".to_string(),
            pool_size: 4,
            cache_capacity: 128,
        }
    }
}

/// Simulated connection pool.
pub struct Database {
    pool_size: u32,
    connected: AtomicBool,
    queries: AtomicU64,
}

impl Database {
    pub fn query(&self, sql: &str) -> Result<u64> {
        if !self.connected.load(Ordering::Acquire) {
            anyhow::bail!("database is not connected");
        }
        tracing::trace!(sql, "query");
        Ok(self.queries.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

#[async_trait]
impl Component for Database {
    async fn start(&self, cancel: CancellationToken) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
            _ = cancel.cancelled() => anyhow::bail!("connect aborted"),
        }
        self.connected.store(true, Ordering::Release);
        tracing::info!(pool_size = self.pool_size, "Database connected");
        Ok(())
    }

    async fn stop(&self, _cancel: CancellationToken) -> Result<()> {
        self.connected.store(false, Ordering::Release);
        tracing::info!(queries = self.queries.load(Ordering::Relaxed), "Database closed");
        Ok(())
    }

    async fn health(&self) -> Result<HealthReport> {
        let report = if self.connected.load(Ordering::Acquire) {
            HealthReport::healthy()
        } else {
            HealthReport::unhealthy("not connected")
        };
        Ok(report
            .with_detail("pool_size", self.pool_size)
            .with_detail("queries", self.queries.load(Ordering::Relaxed)))
    }
}

/// Capability exposed by the cache.
pub trait KeyValue: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn put(&self, key: &str, value: String);
}

pub struct Cache {
    db: Arc<Database>,
    capacity: usize,
    entries: RwLock<HashMap<String, String>>,
}

impl KeyValue for Cache {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    fn put(&self, key: &str, value: String) {
        let mut entries = self.entries.write();
        if entries.len() >= self.capacity && !entries.contains_key(key) {
            // naive eviction; good enough for a demo
            if let Some(victim) = entries.keys().next().cloned() {
                entries.remove(&victim);
            }
        }
        entries.insert(key.to_string(), value);
    }
}

#[async_trait]
impl Component for Cache {
    async fn start(&self, _cancel: CancellationToken) -> Result<()> {
        let warmed = self.db.query("SELECT key, value FROM hot_keys")?;
        self.put("warmup", warmed.to_string());
        Ok(())
    }

    async fn stop(&self, _cancel: CancellationToken) -> Result<()> {
        self.entries.write().clear();
        Ok(())
    }

    async fn health(&self) -> Result<HealthReport> {
        let used = self.entries.read().len();
        let report = if used * 10 >= self.capacity * 9 {
            HealthReport::degraded("cache nearly full")
        } else {
            HealthReport::healthy()
        };
        Ok(report.with_detail("entries", used).with_detail("capacity", self.capacity))
    }
}

/// Per-request state, one instance per scope.
#[derive(Debug)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub scope_id: Uuid,
}

/// Transient: a fresh id on every resolution.
#[derive(Debug)]
pub struct IdGenerator {
    pub id: Uuid,
}

/// Front door; serves simulated requests while running.
pub struct Api {
    db: Arc<Database>,
    cache: Arc<dyn KeyValue>,
    served: AtomicU64,
    ticker: parking_lot::Mutex<Option<CancellationToken>>,
}

impl Api {
    /// Handle one request inside `ctx`'s scope.
    pub fn handle(&self, ctx: &RequestContext, path: &str) -> Result<String> {
        self.served.fetch_add(1, Ordering::Relaxed);
        if let Some(hit) = self.cache.get(path) {
            return Ok(hit);
        }
        let n = self.db.query(path)?;
        let body = format!("{path} -> row {n} (request {})", ctx.request_id);
        self.cache.put(path, body.clone());
        Ok(body)
    }
}

#[async_trait]
impl Component for Api {
    async fn start(&self, cancel: CancellationToken) -> Result<()> {
        // background heartbeat, independent of the start handler's own token
        let token = CancellationToken::new();
        tokio::spawn({
            let token = token.clone();
            async move {
                let mut tick = tokio::time::interval(Duration::from_secs(30));
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tick.tick() => tracing::debug!("api heartbeat"),
                    }
                }
            }
        });
        *self.ticker.lock() = Some(token);
        if cancel.is_cancelled() {
            anyhow::bail!("start cancelled");
        }
        tracing::info!("API accepting requests");
        Ok(())
    }

    async fn stop(&self, _cancel: CancellationToken) -> Result<()> {
        if let Some(token) = self.ticker.lock().take() {
            token.cancel();
        }
        tracing::info!(served = self.served.load(Ordering::Relaxed), "API drained");
        Ok(())
    }
}

/// Register the demo graph on `host`.
pub fn register_all(host: &ComponentHost, settings: Settings) -> Result<()> {
    let capacity = settings.cache_capacity;

    host.register(
        ComponentDescriptor::builder::<Settings>()
            .named("settings")
            .priority(-10)
            .instance(settings)
            .build()?,
    )?;

    host.register(
        ComponentDescriptor::builder::<Database>()
            .named("database")
            .depends_on_named::<Settings>("settings")
            .factory(|ctx| {
                let settings = ctx.resolve::<Settings>("settings")?;
                Ok(Database {
                    pool_size: settings.pool_size.max(1),
                    connected: AtomicBool::new(false),
                    queries: AtomicU64::new(0),
                })
            })
            .with_lifecycle()
            .timeout(Duration::from_secs(5))
            .retries(2)
            .retry_backoff(Duration::from_millis(100))
            .build()?,
    )?;

    host.register(
        ComponentDescriptor::builder::<Cache>()
            .named("cache")
            .depends_on_named::<Database>("database")
            .factory(move |ctx| {
                Ok(Cache {
                    db: ctx.resolve::<Database>("database")?,
                    capacity,
                    entries: RwLock::new(HashMap::new()),
                })
            })
            .with_lifecycle()
            .provides::<dyn KeyValue>(|c| c)
            .build()?,
    )?;

    host.register(
        ComponentDescriptor::builder::<Api>()
            .named("api")
            .depends_on("database")
            .depends_on_named::<dyn KeyValue>("cache")
            .factory(|ctx| {
                Ok(Api {
                    db: ctx.resolve::<Database>("database")?,
                    cache: ctx.resolve_capability::<dyn KeyValue>()?,
                    served: AtomicU64::new(0),
                    ticker: parking_lot::Mutex::new(None),
                })
            })
            .with_lifecycle()
            .build()?,
    )?;

    host.register(
        ComponentDescriptor::builder::<RequestContext>()
            .named("request")
            .scoped()
            .factory(|ctx| {
                Ok(RequestContext {
                    request_id: Uuid::new_v4(),
                    scope_id: ctx.scope_id(),
                })
            })
            .build()?,
    )?;

    host.register(
        ComponentDescriptor::builder::<IdGenerator>()
            .transient()
            .factory(|_| Ok(IdGenerator { id: Uuid::new_v4() }))
            .build()?,
    )?;

    Ok(())
}

/// Serve `paths` as one request each, every request in its own scope.
pub fn simulate_requests(host: &ComponentHost, paths: &[&str]) -> Result<Vec<String>> {
    let api = host.resolve::<Api>("api").context("api is not available")?;
    paths
        .iter()
        .map(|path| {
            let scope = host.create_scope();
            let ctx = scope.resolve::<RequestContext>("request")?;
            let trace = host.resolve_type::<IdGenerator>()?;
            tracing::debug!(request = %ctx.request_id, trace = %trace.id, path, "request");
            let body = api.handle(&ctx, path);
            scope.dispose();
            body
        })
        .collect()
}
