//! Isolated execution environment provisioning for a pipeline run (§4.5.2
//! step 3). Docker-backed when the daemon is reachable; falls back to
//! running the agent subprocess directly against the worktree otherwise.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;

/// Configuration for a sandboxed pipeline container, read from
/// `.branchline/sandbox.toml`.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub image: Option<String>,
    pub memory: String,
    pub cpus: f64,
    pub timeout: u64,
    pub volumes: HashMap<String, String>,
    pub env: HashMap<String, String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: None,
            memory: "4g".to_string(),
            cpus: 2.0,
            timeout: 1800,
            volumes: HashMap::new(),
            env: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SandboxToml {
    sandbox: Option<SandboxSection>,
}

#[derive(Debug, Deserialize)]
struct SandboxSection {
    image: Option<String>,
    memory: Option<String>,
    cpus: Option<f64>,
    timeout: Option<u64>,
    volumes: Option<HashMap<String, String>>,
    env: Option<HashMap<String, String>>,
}

impl SandboxConfig {
    /// Load from `.branchline/sandbox.toml` under the project directory.
    /// Returns defaults if the file doesn't exist.
    pub fn load(project_path: &Path) -> Result<Self> {
        let config_path = project_path.join(".branchline").join("sandbox.toml");
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        let toml: SandboxToml = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        let mut config = Self::default();
        if let Some(section) = toml.sandbox {
            if let Some(image) = section.image {
                config.image = Some(image);
            }
            if let Some(memory) = section.memory {
                config.memory = memory;
            }
            if let Some(cpus) = section.cpus {
                config.cpus = cpus;
            }
            if let Some(timeout) = section.timeout {
                config.timeout = timeout;
            }
            if let Some(volumes) = section.volumes {
                config.volumes = volumes;
            }
            if let Some(env) = section.env {
                config.env = env;
            }
        }
        Ok(config)
    }
}

/// Docker-backed sandbox provider. Creates and manages pipeline containers.
pub struct DockerSandbox {
    docker: Docker,
    pub default_image: String,
}

impl DockerSandbox {
    /// Connect to the Docker daemon via the unix socket. Returns `None` if
    /// Docker is not reachable, in which case execution falls back to the
    /// host process directly.
    pub async fn new(default_image: String) -> Option<Self> {
        let docker = Docker::connect_with_socket_defaults().ok()?;
        if docker.ping().await.is_err() {
            return None;
        }
        Some(Self { docker, default_image })
    }

    pub async fn is_available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    /// Create, start, and stream logs from a pipeline container. Returns the
    /// container id and a channel of output lines.
    pub async fn run_pipeline(
        &self,
        worktree_path: &Path,
        command: Vec<String>,
        config: &SandboxConfig,
        env: Vec<String>,
        request_id: &str,
    ) -> Result<(String, mpsc::Receiver<String>)> {
        let image = config.image.as_deref().unwrap_or(&self.default_image).to_string();
        self.ensure_image(&image).await?;

        let mut mounts = vec![Mount {
            target: Some("/workspace".to_string()),
            source: Some(worktree_path.to_string_lossy().to_string()),
            typ: Some(MountTypeEnum::BIND),
            read_only: Some(false),
            ..Default::default()
        }];
        for (container_path, volume_name) in &config.volumes {
            mounts.push(Mount {
                target: Some(container_path.clone()),
                source: Some(format!("branchline-{volume_name}")),
                typ: Some(MountTypeEnum::VOLUME),
                read_only: Some(false),
                ..Default::default()
            });
        }

        let memory = parse_memory_limit(&config.memory)?;
        let host_config = HostConfig {
            mounts: Some(mounts),
            memory: Some(memory),
            nano_cpus: Some((config.cpus * 1_000_000_000.0) as i64),
            ..Default::default()
        };

        let mut all_env = env;
        for (k, v) in &config.env {
            all_env.push(format!("{k}={v}"));
        }

        let mut labels = HashMap::new();
        labels.insert("branchline.pipeline".to_string(), "true".to_string());
        labels.insert("branchline.request-id".to_string(), request_id.to_string());

        let container_config = Config {
            image: Some(image.clone()),
            cmd: Some(command),
            env: Some(all_env),
            working_dir: Some("/workspace".to_string()),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let container_name = format!("branchline-pipeline-{request_id}");
        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions { name: &container_name, platform: None }),
                container_config,
            )
            .await
            .context("Failed to create pipeline container")?;
        let container_id = response.id;

        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start pipeline container")?;

        let (line_tx, line_rx) = mpsc::channel::<String>(1000);
        let docker = self.docker.clone();
        let cid = container_id.clone();
        tokio::spawn(async move {
            let opts =
                LogsOptions::<String> { follow: true, stdout: true, stderr: true, ..Default::default() };
            let mut stream = docker.logs(&cid, Some(opts));
            while let Some(Ok(output)) = stream.next().await {
                let text = output.to_string();
                for line in text.lines() {
                    if line_tx.send(line.to_string()).await.is_err() {
                        break;
                    }
                }
            }
        });

        Ok((container_id, line_rx))
    }

    pub async fn stop(&self, container_id: &str) -> Result<()> {
        let _ = self.docker.stop_container(container_id, Some(StopContainerOptions { t: 10 })).await;
        let _ = self
            .docker
            .remove_container(container_id, Some(RemoveContainerOptions { force: true, ..Default::default() }))
            .await;
        Ok(())
    }

    pub async fn wait(&self, container_id: &str) -> Result<i64> {
        let mut stream = self.docker.wait_container(container_id, None::<WaitContainerOptions<String>>);
        if let Some(result) = stream.next().await {
            Ok(result.context("Error waiting for container")?.status_code)
        } else {
            anyhow::bail!("Container wait stream ended unexpectedly")
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        let opts = CreateImageOptions { from_image: image, ..Default::default() };
        let mut stream = self.docker.create_image(Some(opts), None, None);
        while let Some(result) = stream.next().await {
            result.context("Failed to pull image")?;
        }
        Ok(())
    }
}

fn parse_memory_limit(s: &str) -> Result<i64> {
    let s = s.trim().to_lowercase();
    if let Some(num) = s.strip_suffix('g') {
        let n: f64 = num.parse().context("Invalid memory value")?;
        Ok((n * 1_073_741_824.0) as i64)
    } else if let Some(num) = s.strip_suffix('m') {
        let n: f64 = num.parse().context("Invalid memory value")?;
        Ok((n * 1_048_576.0) as i64)
    } else {
        s.parse::<i64>().context("Invalid memory limit — use '4g' or '512m' format")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn sandbox_config_defaults() {
        let config = SandboxConfig::default();
        assert!(config.image.is_none());
        assert_eq!(config.memory, "4g");
        assert_eq!(config.cpus, 2.0);
    }

    #[test]
    fn sandbox_config_load_missing_file_is_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SandboxConfig::load(dir.path()).unwrap();
        assert!(config.image.is_none());
    }

    #[test]
    fn sandbox_config_load_partial_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let branchline_dir = dir.path().join(".branchline");
        fs::create_dir_all(&branchline_dir).unwrap();
        fs::write(
            branchline_dir.join("sandbox.toml"),
            "[sandbox]\nimage = \"python:3.12-slim\"\n",
        )
        .unwrap();

        let config = SandboxConfig::load(dir.path()).unwrap();
        assert_eq!(config.image.as_deref(), Some("python:3.12-slim"));
        assert_eq!(config.memory, "4g");
    }

    #[test]
    fn parse_memory_limit_units() {
        assert_eq!(parse_memory_limit("4g").unwrap(), 4 * 1_073_741_824);
        assert_eq!(parse_memory_limit("512m").unwrap(), 512 * 1_048_576);
        assert!(parse_memory_limit("abc").is_err());
    }

    #[tokio::test]
    async fn docker_sandbox_new_does_not_panic_without_docker() {
        let sandbox = DockerSandbox::new("branchline/agent-sandbox:latest".to_string()).await;
        if let Some(s) = sandbox {
            assert_eq!(s.default_image, "branchline/agent-sandbox:latest");
        }
    }
}
