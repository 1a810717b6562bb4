use std::collections::BTreeMap;
use std::process::{ExitStatus, Stdio};

use log::info;
use thiserror::Error;
use tokio::process::Command;

use crate::catapult::{self, Artifact, Catapult};
use crate::config::Config;
use crate::docker;
use crate::lambda;
use crate::launch::LaunchConfig;

#[derive(Error, Debug)]
pub enum Error {
    #[error("applications {0} not built")]
    NotBuilt(String),

    #[error("build command `{0}` failed with exit code {1}")]
    BuildCommand(String, ExitStatus),

    #[error("failed to run build command `{0}`: {1}")]
    BuildCommandSpawn(String, std::io::Error),

    #[error(transparent)]
    Docker(#[from] docker::Error),

    #[error(transparent)]
    Lambda(#[from] lambda::Error),

    #[error(transparent)]
    Catapult(#[from] catapult::Error),
}

/// Build, publish and deploy every discovered application.
///
/// Resolution runs first and entirely in memory: both resolvers fold
/// the application map into deduplicated targets plus one deployment
/// record per application, and the completeness check rejects the run
/// if any application fell through both resolvers. Only then does the
/// I/O fan-out start. Deploys are triggered last, from the primary
/// branch only, and never before every artifact has been published.
pub async fn run(cfg: &Config, apps: &BTreeMap<String, LaunchConfig>) -> Result<(), Error> {
    if apps.is_empty() {
        info!(
            "no applications have buildable changes; if this is unexpected, double check the \
             artifact dependency configuration in the launch configs"
        );
        return Ok(());
    }

    let (container_targets, container_artifacts) = docker::build_targets(apps, cfg)?;
    let (function_targets, function_artifacts) = lambda::build_targets(apps, cfg);

    let mut artifacts = container_artifacts;
    artifacts.extend(function_artifacts);

    // Not all application types are handled yet (e.g. spark), so error
    // out instead of silently not building everything.
    all_apps_built(apps, &artifacts)?;

    if !container_targets.is_empty() {
        let dkr = docker::Docker::new(cfg).await?;
        for (dockerfile, target) in &container_targets {
            if let Some(command) = &target.command {
                exec_build(command).await?;
            }
            dkr.build(".", dockerfile, &target.tags).await?;
            dkr.push(&target.tags).await?;
        }
        dkr.close().await?;
    }

    if !function_targets.is_empty() {
        let lmda = lambda::Lambda::new(cfg);
        for (artifact, target) in &function_targets {
            if let Some(command) = &target.command {
                exec_build(command).await?;
            }
            lmda.publish(&target.zip, artifact).await?;
        }
    }

    let catapult = Catapult::new(cfg)?;
    catapult.publish(&artifacts).await?;

    if cfg.branch == cfg.primary_branch {
        let ids: Vec<String> = apps.keys().cloned().collect();
        catapult.deploy(&ids).await?;
    }

    Ok(())
}

/// Verifies that every discovered application ended up with exactly one
/// deployment record. An application whose run type neither resolver
/// recognizes must fail the run loudly, naming the offenders, rather
/// than being dropped.
pub fn all_apps_built(
    apps: &BTreeMap<String, LaunchConfig>,
    built: &[Artifact],
) -> Result<(), Error> {
    if apps.len() == built.len() {
        return Ok(());
    }

    let missing: Vec<&str> = apps
        .keys()
        .filter(|name| !built.iter().any(|artifact| &artifact.id == *name))
        .map(String::as_str)
        .collect();
    Err(Error::NotBuilt(missing.join(", ")))
}

/// Runs an application's declared build preparation command in the
/// repository root.
async fn exec_build(command: &str) -> Result<(), Error> {
    info!("running build command `{command}`");
    let status = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await
        .map_err(|err| Error::BuildCommandSpawn(command.to_string(), err))?;

    if status.success() {
        Ok(())
    } else {
        Err(Error::BuildCommand(command.to_string(), status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::launch::Run;

    fn app_of_type(typ: &str) -> LaunchConfig {
        LaunchConfig {
            run: Some(Run {
                typ: Some(typ.to_string()),
            }),
            ..Default::default()
        }
    }

    fn docker_app(file: &str) -> LaunchConfig {
        LaunchConfig {
            build: Some(crate::launch::Build {
                docker: Some(crate::launch::DockerBuild {
                    file: Some(file.to_string()),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn every_recognized_app_gets_one_record() {
        let apps = BTreeMap::from([
            ("api".to_string(), docker_app("api/Dockerfile")),
            ("worker".to_string(), app_of_type("lambda")),
            ("legacy".to_string(), docker_app("legacy/Dockerfile")),
        ]);
        let cfg = config::test_config();

        let (_, mut artifacts) = docker::build_targets(&apps, &cfg).unwrap();
        let (_, function_artifacts) = lambda::build_targets(&apps, &cfg);
        artifacts.extend(function_artifacts);

        assert_eq!(artifacts.len(), apps.len());
        assert!(all_apps_built(&apps, &artifacts).is_ok());
    }

    #[test]
    fn unrecognized_run_types_fail_the_completeness_check() {
        let apps = BTreeMap::from([
            ("api".to_string(), app_of_type("docker")),
            ("etl-job".to_string(), app_of_type("spark")),
        ]);
        let cfg = config::test_config();

        let (_, mut artifacts) = docker::build_targets(&apps, &cfg).unwrap();
        let (_, function_artifacts) = lambda::build_targets(&apps, &cfg);
        artifacts.extend(function_artifacts);

        let err = all_apps_built(&apps, &artifacts).unwrap_err();
        assert_eq!(
            err.to_string(),
            "applications etl-job not built"
        );
    }

    #[test]
    fn completeness_check_names_every_missing_app() {
        let apps = BTreeMap::from([
            ("one".to_string(), app_of_type("spark")),
            ("two".to_string(), app_of_type("spark")),
        ]);
        let err = all_apps_built(&apps, &[]).unwrap_err();
        assert_eq!(err.to_string(), "applications one, two not built");
    }
}
