// src/server/mod.rs

use nix::sys::signal::Signal;
use reqwest::Client;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;

use crate::config::{ServeConfig, ServerCase};
use crate::errors::{HarnessError, Result};

pub mod backend;
pub mod guard;
pub mod health;
pub mod process_tree;

pub use backend::Backend;
pub use guard::CaseGuard;
pub use health::{allocate_port, wait_healthy};

/// Lifecycle of one launched server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Spawning,
    WaitingHealthy,
    Ready,
    InUse,
    Terminating,
    Terminated,
}

/// Fully resolved argv and environment overrides for one server launch.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Launches inference servers for cases according to a `ServeConfig`.
pub struct ServerLauncher {
    config: ServeConfig,
    client: Client,
}

impl ServerLauncher {
    pub fn new(config: ServeConfig) -> Self {
        Self { config, client: Client::new() }
    }

    pub fn config(&self) -> &ServeConfig {
        &self.config
    }

    /// Builds the launch command for `case` without spawning anything.
    pub fn build_command(&self, case: &ServerCase, host: &str, port: u16) -> Result<LaunchCommand> {
        let backend = Backend::from_id(&case.backend)?;
        let template = backend.command_template(&self.config);
        let (program, base_args) = template.split_first().ok_or_else(|| {
            HarnessError::Config(format!("empty launch command for backend '{}'", backend))
        })?;

        let mut args = base_args.to_vec();
        args.extend([
            "--model".to_string(),
            case.path.display().to_string(),
            "--host".to_string(),
            host.to_string(),
            "--port".to_string(),
            port.to_string(),
        ]);
        args.extend(case.params.iter().cloned());
        args.extend(self.config.extra_serve_args.iter().cloned());

        let mut env = Vec::new();
        if let Some(gpu) = &self.config.gpu {
            env.push(("ROCR_VISIBLE_DEVICES".to_string(), gpu.clone()));
            env.push(("CUDA_VISIBLE_DEVICES".to_string(), gpu.clone()));
        }
        env.extend(
            backend
                .tuning_env()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        );

        Ok(LaunchCommand { program: program.clone(), args, env })
    }

    /// Spawns the server for `case` in its own process group, with stdout and
    /// stderr both appended to `log_path`.
    pub fn spawn(&self, case: &ServerCase, host: &str, port: u16, log_path: &Path) -> Result<ServerProcess> {
        let launch = self.build_command(case, host, port)?;
        log::info!("Launching {}: {} {}", case.name, launch.program, launch.args.join(" "));

        let log_file = File::create(log_path)?;
        let stderr_file = log_file.try_clone()?;

        let child = Command::new(&launch.program)
            .args(&launch.args)
            .envs(launch.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(stderr_file))
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| HarnessError::Spawn { program: launch.program.clone(), source })?;

        let pid = child.id().ok_or_else(|| {
            HarnessError::Config(format!("'{}' exited before its pid could be read", launch.program))
        })?;

        Ok(ServerProcess { child, pid, grace: self.config.shutdown_grace, terminated: false })
    }

    /// Spawns the server on `host:port` and waits for its health endpoint.
    ///
    /// A server that does not come up is killed at once and reported as
    /// `ServerNotReady`; there is no retry.
    pub async fn launch(&self, case: &ServerCase, host: &str, port: u16, case_dir: &Path) -> Result<ServerHandle> {
        let logs = case_dir.join(format!("{}.server.log", case.name));
        let mut process = self.spawn(case, host, port, &logs)?;

        let endpoint = format!("http://{}:{}", host, port);
        let health_url = format!("{}{}", endpoint, self.config.health_path);
        log::debug!("{} waiting for {}", case.name, health_url);

        if !wait_healthy(&self.client, &health_url, self.config.health_timeout).await {
            process.kill_now().await;
            return Err(HarnessError::ServerNotReady { case: case.name.clone(), logs });
        }

        log::info!("Server for {} is up at {}", case.name, endpoint);
        Ok(ServerHandle {
            case: case.name.clone(),
            endpoint,
            logs,
            guard: CaseGuard::new(case.name.clone(), self.config.case_timeout),
            process,
            state: ServerState::Ready,
        })
    }
}

/// A spawned server process and the group it leads.
pub struct ServerProcess {
    child: Child,
    pid: u32,
    grace: Duration,
    terminated: bool,
}

impl ServerProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// SIGTERM the descendants, then the root; SIGKILL whatever outlives the grace period.
    pub async fn terminate(&mut self) {
        if self.terminated {
            return;
        }

        let tree = process_tree::descendants(self.pid);
        for &pid in &tree {
            process_tree::signal(pid, Signal::SIGTERM);
        }
        process_tree::signal(self.pid, Signal::SIGTERM);

        let deadline = Instant::now() + self.grace;
        match tokio::time::timeout_at(deadline, self.child.wait()).await {
            Ok(Ok(status)) => log::debug!("server {} exited: {}", self.pid, status),
            Ok(Err(e)) => log::warn!("waiting on server {} failed: {}", self.pid, e),
            Err(_) => {
                log::warn!("server {} ignored SIGTERM for {:?}, killing", self.pid, self.grace);
                let _ = self.child.start_kill();
                let _ = self.child.wait().await;
            }
        }

        let survivors = process_tree::wait_for_exit(&tree, deadline).await;
        if !survivors.is_empty() {
            log::warn!("killing {} leftover process(es) of {}", survivors.len(), self.pid);
        }
        process_tree::force_kill(self.pid, &survivors);
        self.terminated = true;
    }

    /// SIGKILL the whole tree without a grace period.
    pub async fn kill_now(&mut self) {
        if self.terminated {
            return;
        }
        let tree = process_tree::descendants(self.pid);
        process_tree::force_kill(self.pid, &tree);
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
        self.terminated = true;
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        if self.terminated {
            return;
        }
        log::warn!("server {} dropped without teardown, killing its tree", self.pid);
        let tree = process_tree::descendants(self.pid);
        process_tree::force_kill(self.pid, &tree);
        let _ = self.child.start_kill();
    }
}

/// A healthy server owned by one case. Dropping it kills the process tree.
pub struct ServerHandle {
    case: String,
    endpoint: String,
    logs: PathBuf,
    guard: CaseGuard,
    process: ServerProcess,
    state: ServerState,
}

impl ServerHandle {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn logs(&self) -> &Path {
        &self.logs
    }

    pub fn guard(&self) -> &CaseGuard {
        &self.guard
    }

    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn mark_in_use(&mut self) {
        if self.state == ServerState::Ready {
            self.state = ServerState::InUse;
        }
    }

    /// Terminates the server tree. Safe to call more than once.
    pub async fn teardown(&mut self) {
        if self.state == ServerState::Terminated {
            return;
        }
        self.state = ServerState::Terminating;
        self.process.terminate().await;
        self.state = ServerState::Terminated;
        log::info!("Teardown: server for {} is killed", self.case);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn case(backend: &str) -> ServerCase {
        ServerCase {
            name: "llama".to_string(),
            backend: backend.to_string(),
            path: PathBuf::from("/models/llama"),
            params: vec!["--max-model-len".to_string(), "4096".to_string()],
            expect: None,
        }
    }

    fn launcher() -> ServerLauncher {
        ServerLauncher::new(ServeConfig {
            gpu: Some("0,1".to_string()),
            extra_serve_args: vec!["--trust-remote-code".to_string()],
            ..ServeConfig::default()
        })
    }

    #[test]
    fn test_build_command_for_each_backend() {
        let launcher = launcher();
        for (backend, entry) in [("vllm", "vllm.entrypoints.openai.api_server"), ("sglang", "sglang.launch_server")] {
            let cmd = launcher.build_command(&case(backend), "127.0.0.1", 8123).unwrap();
            let value = |flag: &str| cmd.args.iter().position(|a| a == flag).map(|i| cmd.args[i + 1].as_str());
            assert_eq!(cmd.program, "python");
            assert_eq!(cmd.args[..2], ["-m".to_string(), entry.to_string()]);
            assert_eq!(value("--model"), Some("/models/llama"));
            assert_eq!(value("--host"), Some("127.0.0.1"));
            assert_eq!(value("--port"), Some("8123"));
            assert_eq!(
                cmd.args[cmd.args.len() - 3..],
                ["--max-model-len".to_string(), "4096".to_string(), "--trust-remote-code".to_string()]
            );
        }
    }

    #[test]
    fn test_build_command_env_overrides() {
        let cmd = launcher().build_command(&case("vllm"), "127.0.0.1", 8000).unwrap();
        assert!(cmd.env.contains(&("ROCR_VISIBLE_DEVICES".to_string(), "0,1".to_string())));
        assert!(cmd.env.contains(&("CUDA_VISIBLE_DEVICES".to_string(), "0,1".to_string())));
        assert!(cmd.env.contains(&("VLLM_USE_V1".to_string(), "1".to_string())));

        let cmd = launcher().build_command(&case("sglang"), "127.0.0.1", 8000).unwrap();
        assert!(cmd.env.contains(&("SGLANG_USE_AITER".to_string(), "1".to_string())));
        assert!(!cmd.env.iter().any(|(k, _)| k == "VLLM_USE_V1"));
    }

    #[test]
    fn test_unsupported_backend_spawns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("tgi.server.log");

        let err = launcher().spawn(&case("tgi"), "127.0.0.1", 8000, &log_path).err().unwrap();
        assert!(matches!(err, HarnessError::UnsupportedBackend(_)));
        assert!(!log_path.exists());
    }

    #[test]
    fn test_empty_template_is_config_error() {
        let launcher = ServerLauncher::new(ServeConfig { vllm_command: Vec::new(), ..ServeConfig::default() });
        let err = launcher.build_command(&case("vllm"), "127.0.0.1", 8000).unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent_and_reaps_tree() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ServerLauncher::new(ServeConfig {
            vllm_command: vec!["sh".to_string(), "-c".to_string(), "sleep 60 & sleep 60".to_string()],
            gpu: None,
            shutdown_grace: Duration::from_secs(2),
            ..ServeConfig::default()
        });

        let mut process = launcher
            .spawn(&case("vllm"), "127.0.0.1", 8000, &dir.path().join("llama.server.log"))
            .unwrap();
        let root = process.pid();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let tree = process_tree::descendants(root);
        assert!(!tree.is_empty());

        process.terminate().await;
        assert!(process.is_terminated());
        assert!(!process_tree::is_alive(root));
        assert!(tree.iter().all(|pid| !process_tree::is_alive(*pid)));

        process.terminate().await;
        process.kill_now().await;
    }

    #[tokio::test]
    async fn test_terminate_after_process_exited() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ServerLauncher::new(ServeConfig {
            vllm_command: vec!["sh".to_string(), "-c".to_string(), "exit 0".to_string()],
            gpu: None,
            ..ServeConfig::default()
        });

        let mut process = launcher
            .spawn(&case("vllm"), "127.0.0.1", 8000, &dir.path().join("llama.server.log"))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        process.terminate().await;
        process.terminate().await;
        assert!(process.is_terminated());
    }
}
