use std::collections::{BTreeMap, BTreeSet};
use std::process::{ExitStatus, Stdio};

use futures::future::try_join_all;
use log::{debug, info};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::catapult::Artifact;
use crate::config::Config;
use crate::launch::{self, LaunchConfig, RUN_TYPE_DOCKER};

const DEFAULT_DOCKERFILE: &str = "Dockerfile";

#[derive(Error, Debug)]
pub enum Error {
    #[error(
        "two different artifact identities resolved to the same build file {file}: {first}, {second}"
    )]
    DockerfileCollision {
        file: String,
        first: String,
        second: String,
    },

    #[error("docker build failed with exit code {0}")]
    Build(ExitStatus),

    #[error("docker push {0} failed with exit code {1}")]
    Push(String, ExitStatus),

    #[error("docker login failed with exit code {0}")]
    Login(ExitStatus),

    #[error("docker logout failed with exit code {0}")]
    Logout(ExitStatus),

    #[error(transparent)]
    IOError(#[from] std::io::Error),
}

/// One container build, pushed under one tag per configured region.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerTarget {
    /// Artifact name the image is addressed under.
    pub artifact: String,
    /// Fully qualified destination tags, one per region, in region order.
    pub tags: Vec<String>,
    /// Command preparing build inputs, run before the docker build.
    pub command: Option<String>,
}

/// Folds the application map into a deduplicated map of dockerfile path
/// keys with their container targets. If multiple apps share an
/// artifact then only the first app (by id order) contributes a target,
/// so the same image is never built twice for runtime-only variants.
/// Every docker app still gets its own deployment record.
///
/// Two different artifacts resolving to the same dockerfile would
/// silently build one image under the other's name, so that case is
/// rejected outright.
pub fn build_targets(
    apps: &BTreeMap<String, LaunchConfig>,
    cfg: &Config,
) -> Result<(BTreeMap<String, ContainerTarget>, Vec<Artifact>), Error> {
    let mut targets: BTreeMap<String, ContainerTarget> = BTreeMap::new();
    let mut done = BTreeSet::new();
    let mut artifacts = Vec::new();

    for (name, lc) in apps {
        if !launch::is_docker_run_type(lc) {
            continue;
        }

        let artifact = launch::artifact_name(name, lc);
        artifacts.push(Artifact {
            run_type: RUN_TYPE_DOCKER.to_string(),
            id: name.clone(),
            branch: cfg.branch.clone(),
            source: cfg.source_ref(),
            artifacts: format!("docker:clever/{}@{}", artifact, cfg.short_sha),
        });

        // Apps with a shared artifact only need to be built and tagged
        // once, but the record above is still emitted for every app.
        if !done.insert(artifact.to_string()) {
            info!("{name} shares artifact {artifact}");
            continue;
        }

        let tags = cfg
            .container_regions
            .iter()
            .map(|region| {
                format!(
                    "{}/{}/{}:{}",
                    cfg.registry_host, region, artifact, cfg.short_sha
                )
            })
            .collect();

        let file = launch::dockerfile(lc).to_string();
        if let Some(existing) = targets.get(&file) {
            return Err(Error::DockerfileCollision {
                file,
                first: existing.artifact.clone(),
                second: artifact.to_string(),
            });
        }

        targets.insert(
            file,
            ContainerTarget {
                artifact: artifact.to_string(),
                tags,
                command: launch::build_command(lc).map(str::to_string),
            },
        );
    }

    Ok((targets, artifacts))
}

/// Handle on the docker CLI, logged in to the configured registry for
/// the lifetime of the handle when credentials are present.
pub struct Docker<'a> {
    cfg: &'a Config,
    logged_in: bool,
}

impl<'a> Docker<'a> {
    pub async fn new(cfg: &'a Config) -> Result<Docker<'a>, Error> {
        let mut docker = Docker {
            cfg,
            logged_in: false,
        };
        if let (Some(username), Some(password)) = (&cfg.registry_username, &cfg.registry_password)
        {
            docker.login(username, password).await?;
            docker.logged_in = true;
        }
        Ok(docker)
    }

    async fn login(&self, username: &str, password: &str) -> Result<(), Error> {
        debug!("logging in to registry {}", self.cfg.registry_host);
        let mut child = Command::new("docker")
            .arg("login")
            .arg(&self.cfg.registry_host)
            .arg("--username")
            .arg(username)
            .arg("--password-stdin")
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(password.as_bytes()).await?;
        }
        let status = child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::Login(status))
        }
    }

    /// Build the dockerfile with the given context directory, applying
    /// every destination tag. An empty dockerfile path means the
    /// default `Dockerfile` in the context directory.
    pub async fn build(
        &self,
        context_dir: &str,
        dockerfile: &str,
        tags: &[String],
    ) -> Result<(), Error> {
        let dockerfile = if dockerfile.is_empty() {
            DEFAULT_DOCKERFILE
        } else {
            dockerfile
        };
        info!("building {tags:?} from {dockerfile}");

        let mut cmd = Command::new("docker");
        cmd.arg("build").arg("--file").arg(dockerfile);
        for tag in tags {
            cmd.arg("--tag").arg(tag);
        }
        let status = cmd
            .arg(context_dir)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await?;

        if status.success() {
            Ok(())
        } else {
            Err(Error::Build(status))
        }
    }

    /// Push every tag of a built image. Region pushes are independent
    /// of each other and run concurrently; the first failure cancels
    /// the remaining pushes and is surfaced as the target's error.
    pub async fn push(&self, tags: &[String]) -> Result<(), Error> {
        try_join_all(tags.iter().map(|tag| self.push_tag(tag)))
            .await
            .map(|_| ())
    }

    async fn push_tag(&self, tag: &str) -> Result<(), Error> {
        info!("pushing {tag}");
        // kill_on_drop so that a failed sibling push cancelling this
        // future also terminates the in-flight push process.
        let status = Command::new("docker")
            .kill_on_drop(true)
            .arg("push")
            .arg(tag)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await?;

        if status.success() {
            Ok(())
        } else {
            Err(Error::Push(tag.to_string(), status))
        }
    }

    pub async fn close(self) -> Result<(), Error> {
        if !self.logged_in {
            return Ok(());
        }
        let status = Command::new("docker")
            .arg("logout")
            .arg(&self.cfg.registry_host)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await?;

        if status.success() {
            Ok(())
        } else {
            Err(Error::Logout(status))
        }
    }
}
