//! Bring up a cache instance on this host when none is reachable.
//!
//! Candidate start commands are tried in order (custom command first, then
//! container and native commands in the configured preference). Each command
//! is spawned detached; readiness is polled through the backend's health
//! check until the per-attempt timeout. The provisioner owns the children it
//! spawned and is unrelated to the script runner.

use crate::backend::{CacheBackend, CacheError};
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);
const BACKOFF_BASE: Duration = Duration::from_millis(250);
const BACKOFF_MAX: Duration = Duration::from_secs(4);
const COMPOSE_FILES: [&str; 2] = ["docker-compose.yml", "compose.yaml"];
const CONTAINER_MARKERS: [&str; 4] = ["docker", "containerd", "kubepods", "podman"];

/// Capability to make a local cache instance reachable.
#[async_trait]
pub trait Provision: Send + Sync {
    /// Start an instance and wait until `probe` reports healthy.
    async fn provision(&self, probe: &dyn CacheBackend) -> Result<(), CacheError>;

    /// Release any processes started by `provision`.
    async fn shutdown(&self) {}
}

#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    pub enabled: bool,
    /// Whitespace-separated command line tried before anything else.
    pub custom_command: Option<String>,
    pub prefer_container: bool,
    pub project_root: PathBuf,
    pub ready_timeout: Duration,
    /// Target of the local cache; provisioning only applies to loopback hosts.
    pub host: String,
    pub port: u16,
}

/// One way of starting the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StartCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl StartCommand {
    fn new(program: &str, args: &[&str], cwd: Option<&Path>) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            cwd: cwd.map(Path::to_path_buf),
        }
    }
}

impl std::fmt::Display for StartCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() {
                write!(f, " \"\"")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Facts about the host that decide which start commands make sense.
#[derive(Debug, Clone, Default)]
pub struct HostFacts {
    pub in_container: bool,
    pub compose_file: bool,
    /// Programs found on `PATH`.
    pub programs: HashSet<String>,
}

impl HostFacts {
    pub fn detect(project_root: &Path) -> Self {
        let programs = ["docker", "docker-compose", "redis-server", "systemctl", "service"]
            .into_iter()
            .filter(|p| on_path(p))
            .map(String::from)
            .collect();
        Self {
            in_container: running_in_container(),
            compose_file: COMPOSE_FILES.iter().any(|f| project_root.join(f).exists()),
            programs,
        }
    }

    fn has(&self, program: &str) -> bool {
        self.programs.contains(program)
    }
}

fn on_path(program: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}

fn running_in_container() -> bool {
    if Path::new("/.dockerenv").exists() {
        return true;
    }
    std::fs::read_to_string("/proc/1/cgroup")
        .map(|text| {
            let text = text.to_lowercase();
            CONTAINER_MARKERS.iter().any(|m| text.contains(m))
        })
        .unwrap_or(false)
}

pub fn is_loopback_host(host: &str) -> bool {
    let host = host.trim_matches(|c| c == '[' || c == ']').to_ascii_lowercase();
    if host == "localhost" {
        return true;
    }
    host.parse::<std::net::IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

/// Ordered, de-duplicated list of commands to try.
pub fn candidate_commands(config: &ProvisionConfig, facts: &HostFacts) -> Vec<StartCommand> {
    let mut commands = Vec::new();

    if let Some(custom) = config.custom_command.as_deref() {
        let mut parts = custom.split_whitespace();
        if let Some(program) = parts.next() {
            let args: Vec<&str> = parts.collect();
            commands.push(StartCommand::new(program, &args, Some(&config.project_root)));
        }
    }

    let mut container = Vec::new();
    if facts.compose_file && !facts.in_container {
        let root = Some(config.project_root.as_path());
        if facts.has("docker") {
            container.push(StartCommand::new("docker", &["compose", "up", "-d", "redis"], root));
        }
        if facts.has("docker-compose") {
            container.push(StartCommand::new("docker-compose", &["up", "-d", "redis"], root));
        }
    }

    let mut native = Vec::new();
    if cfg!(target_os = "linux") {
        if facts.has("systemctl") {
            native.push(StartCommand::new("systemctl", &["--user", "start", "redis"], None));
            native.push(StartCommand::new("systemctl", &["--user", "start", "redis-server"], None));
        }
        if facts.has("service") {
            native.push(StartCommand::new("service", &["redis-server", "start"], None));
        }
    }
    if facts.has("redis-server") {
        let port = config.port.to_string();
        native.push(StartCommand::new(
            "redis-server",
            &["--port", port.as_str(), "--save", "", "--appendonly", "no"],
            None,
        ));
    }

    if config.prefer_container {
        commands.extend(container);
        commands.extend(native);
    } else {
        commands.extend(native);
        commands.extend(container);
    }

    let mut seen = HashSet::new();
    commands.retain(|c| seen.insert(c.clone()));
    commands
}

/// Delay before the `attempt`-th command (0-based): exponential with jitter.
fn backoff(attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let exp = BACKOFF_BASE.saturating_mul(1u32 << (attempt - 1).min(8));
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..100));
    exp.min(BACKOFF_MAX) + jitter
}

/// Starts a cache instance with host commands.
pub struct LocalProvisioner {
    config: ProvisionConfig,
    facts: HostFacts,
    children: Mutex<Vec<Child>>,
}

impl LocalProvisioner {
    pub fn new(config: ProvisionConfig) -> Self {
        let facts = HostFacts::detect(&config.project_root);
        Self::with_facts(config, facts)
    }

    pub fn with_facts(config: ProvisionConfig, facts: HostFacts) -> Self {
        Self {
            config,
            facts,
            children: Mutex::new(Vec::new()),
        }
    }

    fn spawn_detached(&self, command: &StartCommand) -> std::io::Result<Child> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false);
        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }
        #[cfg(unix)]
        cmd.process_group(0);
        cmd.spawn()
    }

    async fn wait_ready(&self, probe: &dyn CacheBackend) -> bool {
        let deadline = tokio::time::Instant::now() + self.config.ready_timeout.max(Duration::from_secs(1));
        while tokio::time::Instant::now() < deadline {
            if probe.health_check().await.is_ok() {
                return true;
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
        false
    }
}

#[async_trait]
impl Provision for LocalProvisioner {
    async fn provision(&self, probe: &dyn CacheBackend) -> Result<(), CacheError> {
        if !self.config.enabled {
            return Err(CacheError::NotConfigured(
                "automatic local cache startup is disabled".into(),
            ));
        }
        if !is_loopback_host(&self.config.host) {
            return Err(CacheError::NotConfigured(format!(
                "local cache target {}:{} is not on this host",
                self.config.host, self.config.port
            )));
        }

        let commands = candidate_commands(&self.config, &self.facts);
        tracing::info!(
            in_container = self.facts.in_container,
            prefer_container = self.config.prefer_container,
            candidates = commands.len(),
            "provisioning local cache"
        );
        if commands.is_empty() {
            return Err(CacheError::Unavailable(
                "no local cache start command available; install redis-server or a container runtime, \
                 or set a custom start command"
                    .into(),
            ));
        }

        let mut failures = Vec::new();
        for (attempt, command) in commands.iter().enumerate() {
            let delay = backoff(attempt as u32);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            match self.spawn_detached(command) {
                Ok(child) => {
                    self.children.lock().await.push(child);
                    if self.wait_ready(probe).await {
                        tracing::info!(command = %command, "local cache started");
                        return Ok(());
                    }
                    tracing::warn!(command = %command, "launched but cache never became ready");
                    failures.push(format!("{command} (launched, not ready)"));
                }
                Err(e) => {
                    tracing::warn!(command = %command, error = %e, "failed to launch local cache");
                    failures.push(format!("{command} ({e})"));
                }
            }
        }

        Err(CacheError::Unavailable(format!(
            "failed to start local cache; attempts: {}",
            failures.join("; ")
        )))
    }

    async fn shutdown(&self) {
        let mut children = self.children.lock().await;
        for child in children.iter_mut() {
            // Exited launchers (container CLI, service managers) need no cleanup.
            if let Ok(None) = child.try_wait() {
                if let Err(e) = child.start_kill() {
                    tracing::warn!(error = %e, "failed to stop provisioned cache process");
                }
            }
        }
        children.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCache;
    use roster_core::SystemClock;
    use std::sync::Arc;

    fn config(root: &Path) -> ProvisionConfig {
        ProvisionConfig {
            enabled: true,
            custom_command: None,
            prefer_container: true,
            project_root: root.to_path_buf(),
            ready_timeout: Duration::from_secs(1),
            host: "127.0.0.1".into(),
            port: 6390,
        }
    }

    fn facts(programs: &[&str], compose_file: bool, in_container: bool) -> HostFacts {
        HostFacts {
            in_container,
            compose_file,
            programs: programs.iter().map(|p| p.to_string()).collect(),
        }
    }

    #[test]
    fn test_loopback_detection() {
        assert!(is_loopback_host("localhost"));
        assert!(is_loopback_host("127.0.0.1"));
        assert!(is_loopback_host("[::1]"));
        assert!(!is_loopback_host("cache.internal"));
        assert!(!is_loopback_host("10.0.0.4"));
    }

    #[test]
    fn test_container_commands_first_when_preferred() {
        let dir = tempfile::tempdir().unwrap();
        let cmds = candidate_commands(
            &config(dir.path()),
            &facts(&["docker", "redis-server"], true, false),
        );
        assert_eq!(cmds[0].program, "docker");
        assert_eq!(cmds.last().unwrap().program, "redis-server");
        assert!(cmds.last().unwrap().args.contains(&"6390".to_string()));
    }

    #[test]
    fn test_native_first_when_container_not_preferred() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.prefer_container = false;
        let cmds = candidate_commands(&cfg, &facts(&["docker", "redis-server"], true, false));
        assert_eq!(cmds[0].program, "redis-server");
        assert_eq!(cmds.last().unwrap().program, "docker");
    }

    #[test]
    fn test_no_container_commands_inside_container() {
        let dir = tempfile::tempdir().unwrap();
        let cmds = candidate_commands(&config(dir.path()), &facts(&["docker"], true, true));
        assert!(cmds.is_empty());
    }

    #[test]
    fn test_custom_command_comes_first_and_dedups() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.custom_command = Some("docker compose up -d redis".into());
        let cmds = candidate_commands(&cfg, &facts(&["docker"], true, false));
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].to_string(), "docker compose up -d redis");
    }

    #[test]
    fn test_empty_arg_displayed_quoted() {
        let cmd = StartCommand::new("redis-server", &["--save", ""], None);
        assert_eq!(cmd.to_string(), "redis-server --save \"\"");
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        assert_eq!(backoff(0), Duration::ZERO);
        assert!(backoff(1) >= BACKOFF_BASE);
        assert!(backoff(20) <= BACKOFF_MAX + Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_disabled_provisioner_refuses() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.enabled = false;
        let p = LocalProvisioner::with_facts(cfg, HostFacts::default());
        let probe = MemoryCache::new(Arc::new(SystemClock));
        assert!(matches!(p.provision(&probe).await, Err(CacheError::NotConfigured(_))));
    }

    #[tokio::test]
    async fn test_remote_target_is_not_provisioned() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.host = "cache.internal".into();
        let p = LocalProvisioner::with_facts(cfg, HostFacts::default());
        let probe = MemoryCache::new(Arc::new(SystemClock));
        assert!(matches!(p.provision(&probe).await, Err(CacheError::NotConfigured(_))));
    }

    #[tokio::test]
    async fn test_custom_command_launch_and_ready() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.custom_command = Some("true".into());
        let p = LocalProvisioner::with_facts(cfg, HostFacts::default());
        let probe = MemoryCache::new(Arc::new(SystemClock));
        p.provision(&probe).await.unwrap();
        p.shutdown().await;
    }

    #[tokio::test]
    async fn test_unlaunchable_command_reports_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.custom_command = Some("roster-no-such-binary --port 1".into());
        let p = LocalProvisioner::with_facts(cfg, HostFacts::default());
        let probe = MemoryCache::new(Arc::new(SystemClock));
        match p.provision(&probe).await {
            Err(CacheError::Unavailable(msg)) => assert!(msg.contains("roster-no-such-binary")),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
