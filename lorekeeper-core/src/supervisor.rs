//! Bootstrapping of the local backing services.
//!
//! A [`ServiceSupervisor`] makes sure a named service answers its health
//! endpoint, spawning the service's executable when it does not. Calling
//! [`ServiceSupervisor::ensure_running`] on a live service is a no-op, so at
//! most one child process is started per service per run. Crashes after
//! startup are not supervised: later calls against a dead service simply
//! fail with connection errors.

use crate::config::Config;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Health checks should never hang the startup loop.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

const KIWIX_HEALTH_PATH: &str = "/";
const KIWIX_ATTEMPTS: u32 = 60;
const KIWIX_BIN_ENV: &str = "KIWIX_SERVE_BIN";

const OLLAMA_HEALTH_PATH: &str = "/api/tags";
const OLLAMA_ATTEMPTS: u32 = 30;
const OLLAMA_BIN_ENV: &str = "OLLAMA_BIN";

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("No executable found for {0}")]
    ExecutableNotFound(String),

    #[error("{name} did not become healthy after {attempts} attempts")]
    ServiceStartTimeout { name: String, attempts: u32 },

    #[error("Failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid service endpoint: {0}")]
    Endpoint(String),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Where a bootstrapped service listens and how to ask whether it is alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    pub host: String,
    pub port: u16,
    pub health_path: String,
}

impl ServiceEndpoint {
    pub fn new(host: impl Into<String>, port: u16, health_path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            health_path: health_path.into(),
        }
    }

    /// Builds an endpoint from a base URL such as `http://127.0.0.1:11434`.
    pub fn from_url(url: &str, health_path: impl Into<String>) -> Result<Self> {
        let parsed =
            reqwest::Url::parse(url).map_err(|e| SupervisorError::Endpoint(format!("{url}: {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| SupervisorError::Endpoint(format!("{url}: missing host")))?;
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| SupervisorError::Endpoint(format!("{url}: missing port")))?;
        Ok(Self::new(host, port, health_path))
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn health_url(&self) -> String {
        format!("{}{}", self.base_url(), self.health_path)
    }
}

/// Fixed-interval polling bound used while waiting for a spawned service.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl PollPolicy {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }
}

/// The ordered places an executable may live.
///
/// Resolution order: the environment override, a copy bundled next to the
/// running program, the configured install directory, well-known OS
/// locations, and finally a `PATH` lookup.
#[derive(Debug, Clone)]
pub struct ExecutableSpec {
    /// Base name without platform suffix, e.g. `kiwix-serve`
    pub name: String,
    pub env_override: Option<String>,
    pub install_dir: Option<PathBuf>,
    pub well_known: Vec<PathBuf>,
}

impl ExecutableSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            env_override: None,
            install_dir: None,
            well_known: Vec::new(),
        }
    }

    pub fn with_env_override(mut self, var: impl Into<String>) -> Self {
        self.env_override = Some(var.into());
        self
    }

    pub fn with_install_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.install_dir = dir;
        self
    }

    pub fn with_well_known(mut self, paths: Vec<PathBuf>) -> Self {
        self.well_known = paths;
        self
    }

    fn file_name(&self) -> String {
        format!("{}{}", self.name, std::env::consts::EXE_SUFFIX)
    }
}

/// Everything needed to probe, resolve, and spawn one service.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub name: String,
    pub endpoint: ServiceEndpoint,
    pub executable: ExecutableSpec,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub poll: PollPolicy,
}

impl ServiceDescriptor {
    /// The content server serving the offline snapshot.
    pub fn kiwix(config: &Config) -> Self {
        let endpoint =
            ServiceEndpoint::new(&config.wiki.bind, config.wiki.kiwix_port, KIWIX_HEALTH_PATH);
        let executable = ExecutableSpec::new("kiwix-serve")
            .with_env_override(KIWIX_BIN_ENV)
            .with_install_dir(config.paths.kiwix_dir.clone())
            .with_well_known(well_known_locations("kiwix-serve"));

        Self {
            name: "kiwix-serve".to_string(),
            endpoint,
            executable,
            args: vec![
                format!("--address={}", config.wiki.bind),
                format!("--port={}", config.wiki.kiwix_port),
                config.wiki.zim.display().to_string(),
            ],
            env: Vec::new(),
            poll: PollPolicy::new(KIWIX_ATTEMPTS, POLL_INTERVAL),
        }
    }

    /// The LLM server.
    pub fn ollama(config: &Config) -> Result<Self> {
        let endpoint = ServiceEndpoint::from_url(&config.llm.base_url, OLLAMA_HEALTH_PATH)?;
        let executable = ExecutableSpec::new("ollama")
            .with_env_override(OLLAMA_BIN_ENV)
            .with_install_dir(config.paths.ollama_dir.clone())
            .with_well_known(well_known_locations("ollama"));

        let env = config
            .paths
            .models_dir
            .as_ref()
            .map(|dir| vec![("OLLAMA_MODELS".to_string(), dir.display().to_string())])
            .unwrap_or_default();

        Ok(Self {
            name: "ollama".to_string(),
            endpoint,
            executable,
            args: vec!["serve".to_string()],
            env,
            poll: PollPolicy::new(OLLAMA_ATTEMPTS, POLL_INTERVAL),
        })
    }
}

/// Starts a resolved executable.
///
/// Split out from the supervisor so that spawning can be observed in tests.
pub trait Launcher: Send + Sync {
    fn launch(&self, program: &Path, args: &[String], env: &[(String, String)])
        -> std::io::Result<()>;
}

/// Spawns the child detached from our stdio and process group.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedLauncher;

impl Launcher for DetachedLauncher {
    fn launch(
        &self,
        program: &Path,
        args: &[String],
        env: &[(String, String)],
    ) -> std::io::Result<()> {
        let mut command = Command::new(program);
        command
            .args(args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        // The child outlives this handle; it is never waited on.
        command.spawn().map(drop)
    }
}

/// Ensures local services are reachable, starting them when needed.
#[derive(Clone)]
pub struct ServiceSupervisor {
    http: reqwest::Client,
    launcher: Arc<dyn Launcher>,
}

impl ServiceSupervisor {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            launcher: Arc::new(DetachedLauncher),
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// GETs the health endpoint. Network failures and non-success statuses
    /// both mean "not alive".
    pub async fn is_alive(&self, endpoint: &ServiceEndpoint) -> bool {
        match self
            .http
            .get(endpoint.health_url())
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(url = %endpoint.health_url(), error = %e, "Health probe failed");
                false
            }
        }
    }

    /// Returns once the service answers its health endpoint.
    ///
    /// # Errors
    ///
    /// - [`SupervisorError::ExecutableNotFound`] when the service is down and
    ///   no executable can be resolved
    /// - [`SupervisorError::Spawn`] when the executable cannot be started
    /// - [`SupervisorError::ServiceStartTimeout`] when the spawned service
    ///   does not become healthy within the descriptor's poll bound
    pub async fn ensure_running(&self, descriptor: &ServiceDescriptor) -> Result<()> {
        if self.is_alive(&descriptor.endpoint).await {
            debug!(service = %descriptor.name, "Service already running");
            return Ok(());
        }

        let program = resolve_executable(&descriptor.executable)?;
        info!(
            service = %descriptor.name,
            program = %program.display(),
            "Starting service"
        );

        self.launcher
            .launch(&program, &descriptor.args, &descriptor.env)
            .map_err(|source| SupervisorError::Spawn {
                name: descriptor.name.clone(),
                source,
            })?;

        for _ in 0..descriptor.poll.attempts {
            if self.is_alive(&descriptor.endpoint).await {
                info!(service = %descriptor.name, "Service is up");
                return Ok(());
            }
            tokio::time::sleep(descriptor.poll.interval).await;
        }

        Err(SupervisorError::ServiceStartTimeout {
            name: descriptor.name.clone(),
            attempts: descriptor.poll.attempts,
        })
    }
}

/// Walks the fallback chain described on [`ExecutableSpec`].
pub fn resolve_executable(spec: &ExecutableSpec) -> Result<PathBuf> {
    let file_name = spec.file_name();

    if let Some(var) = &spec.env_override {
        if let Ok(value) = std::env::var(var) {
            let path = PathBuf::from(value);
            if path.is_file() {
                return Ok(path);
            }
            warn!(var = %var, path = %path.display(), "Executable override does not exist");
        }
    }

    let bundled = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(&file_name)));
    let installed = spec.install_dir.as_ref().map(|dir| dir.join(&file_name));

    let found = bundled
        .into_iter()
        .chain(installed)
        .chain(spec.well_known.iter().cloned())
        .find(|path| path.is_file());
    if let Some(path) = found {
        return Ok(path);
    }

    search_path(&spec.name).ok_or_else(|| SupervisorError::ExecutableNotFound(spec.name.clone()))
}

fn search_path(name: &str) -> Option<PathBuf> {
    let finder = if cfg!(windows) { "where" } else { "which" };
    let output = Command::new(finder).arg(name).output().ok()?;
    if !output.status.success() {
        return None;
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(PathBuf::from)
}

fn well_known_locations(name: &str) -> Vec<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let file = format!("{name}.exe");
        let mut paths = Vec::new();
        if let Ok(local) = std::env::var("LOCALAPPDATA") {
            paths.push(PathBuf::from(&local).join("Programs").join("Ollama").join(&file));
            paths.push(PathBuf::from(&local).join("Programs").join("kiwix-tools").join(&file));
        }
        if let Ok(program_files) = std::env::var("ProgramFiles") {
            paths.push(PathBuf::from(program_files).join("kiwix-tools").join(&file));
        }
        paths
    }

    #[cfg(target_os = "macos")]
    {
        vec![
            PathBuf::from("/opt/homebrew/bin").join(name),
            PathBuf::from("/usr/local/bin").join(name),
            PathBuf::from("/Applications/Ollama.app/Contents/Resources").join(name),
        ]
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        vec![
            PathBuf::from("/usr/local/bin").join(name),
            PathBuf::from("/usr/bin").join(name),
            PathBuf::from("/snap/bin").join(name),
        ]
    }
}
