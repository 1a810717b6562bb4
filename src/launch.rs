use std::collections::BTreeMap;

use serde::Deserialize;
use thiserror::Error;

pub const RUN_TYPE_DOCKER: &str = "docker";
pub const RUN_TYPE_LAMBDA: &str = "lambda";

const LAUNCH_EXTENSION: &str = "yml";

#[derive(Error, Debug)]
pub enum Error {
    #[error("directory {0} not found")]
    LaunchDirNotFound(String),

    #[error("failed to read launch directory: {0}")]
    ReadDir(std::io::Error),

    #[error("failed to read {path}: {err}")]
    ReadFile { path: String, err: std::io::Error },

    #[error("failed to parse launch config {path}: {err}")]
    Parse { path: String, err: serde_yaml::Error },
}

/// One application's launch configuration. Every field is optional so
/// that partially populated configs (and legacy configs written long
/// before some fields existed) still deserialize.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct LaunchConfig {
    pub run: Option<Run>,
    pub build: Option<Build>,
    pub pod_config: Option<PodConfig>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Run {
    #[serde(rename = "type")]
    pub typ: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Build {
    pub docker: Option<DockerBuild>,
    pub artifact: Option<ArtifactBuild>,
    pub command: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct DockerBuild {
    /// Path to the dockerfile, relative to the repository root. Empty
    /// or absent means the default `Dockerfile` in the build context.
    pub file: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ArtifactBuild {
    /// Overrides the artifact name so several applications can share
    /// one build. This happens with e.g. sso and non-sso variants of an
    /// application that only differ through runtime configuration.
    pub name: Option<String>,
    /// File globs consulted by the change detector upstream of this
    /// tool to decide whether the application has buildable changes.
    pub dependencies: Option<Vec<String>>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct PodConfig {
    pub group: Option<String>,
}

/// Finds all launch config files in the given directory and returns a
/// map keyed by application id (the file name minus extension). DB
/// launch configs, recognizable by their missing pod group, are not
/// deployable applications and are skipped. The map is ordered by
/// application id so that every downstream fold is deterministic.
pub fn discover(dir: &str) -> Result<BTreeMap<String, LaunchConfig>, Error> {
    let entries = std::fs::read_dir(dir).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            Error::LaunchDirNotFound(dir.to_string())
        } else {
            Error::ReadDir(err)
        }
    })?;

    let mut apps = BTreeMap::new();
    for entry in entries {
        let entry = entry.map_err(Error::ReadDir)?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some(LAUNCH_EXTENSION) {
            continue;
        }

        let display = path.display().to_string();
        let contents = std::fs::read_to_string(&path).map_err(|err| Error::ReadFile {
            path: display.clone(),
            err,
        })?;
        let lc: LaunchConfig = serde_yaml::from_str(&contents)
            .map_err(|err| Error::Parse { path: display, err })?;

        if !is_deployable(&lc) {
            continue;
        }

        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            apps.insert(stem.to_string(), lc);
        }
    }

    Ok(apps)
}

fn is_deployable(lc: &LaunchConfig) -> bool {
    matches!(&lc.pod_config, Some(pod) if matches!(&pod.group, Some(g) if !g.is_empty()))
}

/// Returns true if the launch config declares a run type of docker.
/// For legacy support reasons an absent run section or an empty run
/// type also counts as docker.
pub fn is_docker_run_type(lc: &LaunchConfig) -> bool {
    match &lc.run {
        Some(run) => match run.typ.as_deref() {
            Some(RUN_TYPE_DOCKER) | Some("") | None => true,
            Some(_) => false,
        },
        None => true,
    }
}

/// Returns true only if the launch config explicitly declares a run
/// type of lambda.
pub fn is_lambda_run_type(lc: &LaunchConfig) -> bool {
    match &lc.run {
        Some(run) => run.typ.as_deref() == Some(RUN_TYPE_LAMBDA),
        None => false,
    }
}

/// The name a build's output is addressed under. Defaults to the
/// application id, with an optional launch config override to let
/// multiple applications share one artifact.
pub fn artifact_name<'a>(app: &'a str, lc: &'a LaunchConfig) -> &'a str {
    match &lc.build {
        Some(build) => match &build.artifact {
            Some(artifact) => match artifact.name.as_deref() {
                Some(name) if !name.is_empty() => name,
                _ => app,
            },
            None => app,
        },
        None => app,
    }
}

/// The dockerfile path declared in the launch config, or an empty
/// string when unspecified.
pub fn dockerfile(lc: &LaunchConfig) -> &str {
    lc.build
        .as_ref()
        .and_then(|b| b.docker.as_ref())
        .and_then(|d| d.file.as_deref())
        .unwrap_or("")
}

/// The command preparing build inputs, e.g. compiling binaries before
/// the dockerfile copies them in. No command is declared for most apps.
pub fn build_command(lc: &LaunchConfig) -> Option<&str> {
    lc.build
        .as_ref()
        .and_then(|b| b.command.as_deref())
        .filter(|c| !c.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(yaml: &str) -> LaunchConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn discover_filters_non_applications() {
        let dir = tempfile::tempdir().unwrap();

        let mut app = std::fs::File::create(dir.path().join("web-app.yml")).unwrap();
        app.write_all(b"run:\n  type: docker\npod_config:\n  group: core\n")
            .unwrap();

        // DB launch config, no pod group.
        let mut db = std::fs::File::create(dir.path().join("postgres.yml")).unwrap();
        db.write_all(b"run:\n  type: docker\n").unwrap();

        let mut other = std::fs::File::create(dir.path().join("README.md")).unwrap();
        other.write_all(b"not a launch config").unwrap();

        std::fs::create_dir(dir.path().join("subdir.yml")).unwrap();

        let apps = discover(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(apps.keys().collect::<Vec<_>>(), vec!["web-app"]);
    }

    #[test]
    fn discover_missing_directory() {
        let err = discover("/definitely/not/here").unwrap_err();
        assert!(matches!(err, Error::LaunchDirNotFound(_)));
    }

    #[test]
    fn discover_unparsable_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut bad = std::fs::File::create(dir.path().join("bad.yml")).unwrap();
        bad.write_all(b"run: [unterminated").unwrap();

        let err = discover(dir.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[test]
    fn docker_run_type_is_the_legacy_default() {
        assert!(is_docker_run_type(&LaunchConfig::default()));
        assert!(is_docker_run_type(&parse("pod_config:\n  group: g\n")));
        assert!(is_docker_run_type(&parse("run:\n  type: docker\n")));
        assert!(is_docker_run_type(&parse("run:\n  type: ''\n")));
        assert!(!is_docker_run_type(&parse("run:\n  type: lambda\n")));
        assert!(!is_docker_run_type(&parse("run:\n  type: spark\n")));
    }

    #[test]
    fn lambda_run_type_is_explicit_only() {
        assert!(is_lambda_run_type(&parse("run:\n  type: lambda\n")));
        assert!(!is_lambda_run_type(&LaunchConfig::default()));
        assert!(!is_lambda_run_type(&parse("run:\n  type: docker\n")));
        assert!(!is_lambda_run_type(&parse("run:\n  type: ''\n")));
    }

    #[test]
    fn artifact_name_override() {
        let lc = parse("build:\n  artifact:\n    name: shared\n");
        assert_eq!(artifact_name("my-app", &lc), "shared");

        let empty = parse("build:\n  artifact:\n    name: ''\n");
        assert_eq!(artifact_name("my-app", &empty), "my-app");

        assert_eq!(artifact_name("my-app", &LaunchConfig::default()), "my-app");
    }

    #[test]
    fn dockerfile_and_build_command() {
        let lc = parse(concat!(
            "build:\n",
            "  command: make generate\n",
            "  docker:\n",
            "    file: services/api/Dockerfile\n",
            "  artifact:\n",
            "    dependencies:\n",
            "      - services/api/*\n",
        ));
        assert_eq!(dockerfile(&lc), "services/api/Dockerfile");
        assert_eq!(build_command(&lc), Some("make generate"));
        assert_eq!(
            lc.build.as_ref().unwrap().artifact.as_ref().unwrap().dependencies,
            Some(vec!["services/api/*".to_string()])
        );

        assert_eq!(dockerfile(&LaunchConfig::default()), "");
        assert_eq!(build_command(&LaunchConfig::default()), None);
    }
}
