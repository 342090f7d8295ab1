use crate::config::Config;
use crate::pipeline::Pipeline;
use crate::relay::Relay;
use anyhow::Context;
use roster_cache::{
    CacheBackend, CacheMode, CooldownGate, FailoverCache, LocalCache, LocalProvisioner, MemoryCache, Provision,
    ProvisionConfig, RemoteCache,
};
use roster_core::{Clock, Gallery, MatcherConfig, SystemClock};
use roster_runner::{Registry, ScriptRunner};
use roster_store::Store;
use std::sync::Arc;

/// Shared daemon state handed to every handler.
pub struct AppState {
    pub config: Config,
    pub pipeline: Pipeline,
    pub runner: ScriptRunner,
    pub store: Store,
    pub relay: Relay,
    pub cache: Arc<FailoverCache>,
}

impl AppState {
    /// Open the database, assemble the cache chain and load the gallery.
    pub async fn from_config(config: Config) -> anyhow::Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let store = Store::open(&config.db_path)
            .await
            .with_context(|| format!("opening database {}", config.db_path.display()))?;

        let cache = Arc::new(build_cache(&config, clock.clone())?);
        let gate = CooldownGate::new(cache.clone(), config.cooldown);

        let matcher = MatcherConfig {
            ambiguity_epsilon: config.ambiguity_epsilon,
            exact_limit: config.exact_search_limit,
            ..MatcherConfig::default()
        };
        let pipeline = Pipeline::new(
            Gallery::new(matcher),
            gate,
            store.clone(),
            clock.clone(),
            config.similarity_threshold,
        );
        pipeline.load_gallery().await?;

        let registry = match &config.scripts_file {
            Some(path) => Registry::load(path)?,
            None => Registry::builtin(&config.script_interpreter),
        };
        let runner = ScriptRunner::new(registry, config.project_root.clone(), clock);

        Ok(Self::new(config, pipeline, runner, store, cache))
    }

    pub fn new(config: Config, pipeline: Pipeline, runner: ScriptRunner, store: Store, cache: Arc<FailoverCache>) -> Self {
        Self {
            config,
            pipeline,
            runner,
            store,
            relay: Relay::default(),
            cache,
        }
    }
}

/// Assemble the cache chain for the configured mode.
fn build_cache(config: &Config, clock: Arc<dyn Clock>) -> anyhow::Result<FailoverCache> {
    let remote = || -> anyhow::Result<Option<Arc<dyn CacheBackend>>> {
        if !config.remote_cache_configured() {
            return Ok(None);
        }
        let cache = RemoteCache::new(&config.remote_cache_url, &config.remote_cache_token)?;
        Ok(Some(Arc::new(cache)))
    };

    let local = || -> anyhow::Result<(Arc<dyn CacheBackend>, Option<Arc<dyn Provision>>)> {
        let cache = LocalCache::new(&config.local_cache_url)?;
        let provisioner: Option<Arc<dyn Provision>> = config.auto_start_local_cache.then(|| {
            let provision = ProvisionConfig {
                enabled: true,
                custom_command: Some(config.local_cache_start_cmd.clone()).filter(|c| !c.is_empty()),
                prefer_container: config.prefer_container_cache,
                project_root: config.project_root.clone(),
                ready_timeout: config.local_cache_start_timeout,
                host: cache.host().to_string(),
                port: cache.port(),
            };
            Arc::new(LocalProvisioner::new(provision)) as Arc<dyn Provision>
        });
        Ok((Arc::new(cache), provisioner))
    };

    let cache = match config.cache_mode {
        CacheMode::Memory => {
            tracing::warn!("in-memory cooldown cache: admissions are not shared across processes");
            let memory: Arc<dyn CacheBackend> = Arc::new(MemoryCache::new(clock));
            FailoverCache::new(None, Some(memory), None)
        }
        CacheMode::Remote => {
            let remote = remote()?.context("remote cache selected but URL or token is missing")?;
            FailoverCache::new(Some(remote), None, None)
        }
        CacheMode::Local => {
            let (local, provisioner) = local()?;
            FailoverCache::new(None, Some(local), provisioner)
        }
        CacheMode::Auto => {
            let (local, provisioner) = local()?;
            FailoverCache::new(remote()?, Some(local), provisioner)
        }
    };
    Ok(cache)
}
