use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use futures::future::try_join_all;
use log::info;
use thiserror::Error;
use tokio::process::Command;

use crate::catapult::Artifact;
use crate::config::Config;
use crate::launch::{self, LaunchConfig, RUN_TYPE_LAMBDA};

#[derive(Error, Debug)]
pub enum Error {
    #[error("function archive {0} not found, was the build command configured?")]
    ArchiveMissing(String),

    #[error("upload of {archive} to {uri} failed with exit code {status}")]
    Upload {
        archive: String,
        uri: String,
        status: ExitStatus,
    },

    #[error(transparent)]
    IOError(#[from] std::io::Error),
}

/// One function build, uploaded to the artifact bucket of every
/// configured region.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionTarget {
    /// Local path of the built archive.
    pub zip: String,
    /// Command preparing build inputs, run before the upload.
    pub command: Option<String>,
}

/// Folds the application map into a deduplicated map of function
/// targets keyed by artifact name. Functions have no build file, so
/// co-location is purely by shared artifact name: apps sharing one have
/// a single entry in the map but still get individual deployment
/// records, with the storage location embedded per region.
pub fn build_targets(
    apps: &BTreeMap<String, LaunchConfig>,
    cfg: &Config,
) -> (BTreeMap<String, FunctionTarget>, Vec<Artifact>) {
    let mut targets = BTreeMap::new();
    let mut done = BTreeSet::new();
    let mut artifacts = Vec::new();

    for (name, lc) in apps {
        if !launch::is_lambda_run_type(lc) {
            continue;
        }

        let artifact = launch::artifact_name(name, lc);
        artifacts.push(Artifact {
            run_type: RUN_TYPE_LAMBDA.to_string(),
            id: name.clone(),
            branch: cfg.branch.clone(),
            source: cfg.source_ref(),
            artifacts: format!(
                "lambda:clever/{}@{};S3Key=\"{},{}",
                artifact,
                cfg.short_sha,
                s3_key(artifact, &cfg.short_sha),
                s3_buckets(cfg),
            ),
        });

        if !done.insert(artifact.to_string()) {
            info!("{name} shares artifact {artifact}");
            continue;
        }

        targets.insert(
            artifact.to_string(),
            FunctionTarget {
                zip: format!("./bin/{name}.zip"),
                command: launch::build_command(lc).map(str::to_string),
            },
        );
    }

    (targets, artifacts)
}

/// Object storage key a function archive lives under within each
/// regional bucket.
fn s3_key(artifact: &str, short_sha: &str) -> String {
    format!("{artifact}/{short_sha}/{artifact}.zip")
}

/// The bucket list segment of the artifact location string. The whole
/// string is a legacy delimited format that the tracking service parses,
/// unbalanced quotes included, and must be preserved byte for byte.
fn s3_buckets(cfg: &Config) -> String {
    let buckets: Vec<String> = cfg
        .function_regions
        .iter()
        .map(|region| format!("{}=\"{}-{}", region, cfg.bucket_prefix, region))
        .collect();
    format!("S3Buckets={{{}", buckets.join(","))
}

/// Handle for publishing built function archives to the per-region
/// artifact buckets.
pub struct Lambda<'a> {
    cfg: &'a Config,
}

impl<'a> Lambda<'a> {
    pub fn new(cfg: &'a Config) -> Self {
        Self { cfg }
    }

    /// Upload an already built archive to every regional bucket, using
    /// the artifact name as the key. Uploads run concurrently, one per
    /// region; the first failure cancels the rest.
    pub async fn publish(&self, archive: &str, artifact: &str) -> Result<(), Error> {
        if !Path::new(archive).is_file() {
            return Err(Error::ArchiveMissing(archive.to_string()));
        }

        let key = s3_key(artifact, &self.cfg.short_sha);
        try_join_all(self.cfg.function_regions.iter().map(|region| {
            let bucket = format!("{}-{}", self.cfg.bucket_prefix, region);
            let uri = format!("s3://{bucket}/{key}");
            self.upload(archive, uri, region)
        }))
        .await
        .map(|_| ())
    }

    async fn upload(&self, archive: &str, uri: String, region: &str) -> Result<(), Error> {
        info!("uploading function archive {archive} to {uri}");
        // kill_on_drop so that a failed sibling upload cancelling this
        // future also terminates the in-flight upload process.
        let status = Command::new("aws")
            .kill_on_drop(true)
            .args(["s3", "cp", archive, &uri, "--region", region])
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await?;

        if status.success() {
            Ok(())
        } else {
            Err(Error::Upload {
                archive: archive.to_string(),
                uri,
                status,
            })
        }
    }
}
