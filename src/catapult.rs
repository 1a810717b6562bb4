use std::time::Duration;

use futures::future::try_join_all;
use log::info;
use serde::Serialize;
use thiserror::Error;

use crate::config::Config;

#[derive(Error, Debug)]
pub enum Error {
    #[error("catapult client could not be constructed: {0}")]
    Client(reqwest::Error),

    #[error("failed to publish {app} with catapult: {err}")]
    PublishRequest { app: String, err: reqwest::Error },

    #[error("failed to publish {app} with catapult: status {status}: {body}")]
    Publish {
        app: String,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("failed to deploy {app}: {err}")]
    DeployRequest { app: String, err: reqwest::Error },

    #[error("failed to deploy {app}: status {status}: {body}")]
    Deploy {
        app: String,
        status: reqwest::StatusCode,
        body: String,
    },
}

/// One deployment record, reported to catapult per application so that
/// it can inject the artifact location at deploy time. Applications
/// sharing a build still get their own record.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Artifact {
    pub run_type: String,
    pub id: String,
    pub branch: String,
    pub source: String,
    pub artifacts: String,
}

#[derive(Serialize)]
struct PublishRequest<'a> {
    username: &'a str,
    reponame: &'a str,
    buildnum: i64,
    app: &'a Artifact,
}

#[derive(Serialize)]
struct DeployRequest<'a> {
    appname: &'a str,
    buildnum: i64,
    reponame: &'a str,
    username: &'a str,
}

/// Client for the catapult deployment-tracking service, a trimmed down
/// API over its two endpoints.
pub struct Catapult<'a> {
    cfg: &'a Config,
    client: reqwest::Client,
    url: String,
}

impl<'a> Catapult<'a> {
    pub fn new(cfg: &'a Config) -> Result<Self, Error> {
        // The service was historically requested with curl against the
        // full endpoint path, so legacy configuration may carry the
        // path suffix. Strip both known variants.
        let url = cfg
            .catapult_url
            .trim_end_matches('/')
            .trim_end_matches("/v2/catapult")
            .trim_end_matches("/catapult")
            .to_string();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(Error::Client)?;

        Ok(Self { cfg, client, url })
    }

    /// Publish all deployment records. Records are independent once the
    /// build phase has committed, so they are published concurrently;
    /// the first failure cancels the remaining requests.
    pub async fn publish(&self, artifacts: &[Artifact]) -> Result<(), Error> {
        try_join_all(artifacts.iter().map(|art| self.publish_one(art)))
            .await
            .map(|_| ())
    }

    async fn publish_one(&self, artifact: &Artifact) -> Result<(), Error> {
        info!("publishing {}", artifact.id);
        let res = self
            .client
            .post(format!("{}/v2/catapult", self.url))
            .basic_auth(&self.cfg.catapult_user, Some(&self.cfg.catapult_password))
            .json(&PublishRequest {
                username: &self.cfg.user,
                reponame: &self.cfg.repo,
                buildnum: self.cfg.build_num,
                app: artifact,
            })
            .send()
            .await
            .map_err(|err| Error::PublishRequest {
                app: artifact.id.clone(),
                err,
            })?;

        if !res.status().is_success() {
            return Err(Error::Publish {
                app: artifact.id.clone(),
                status: res.status(),
                body: res.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    /// Trigger a deploy for each application, in order. Deploys are
    /// externally observable state transitions and are kept sequential.
    pub async fn deploy(&self, apps: &[String]) -> Result<(), Error> {
        for app in apps {
            info!("deploying {app}");
            let res = self
                .client
                .post(format!("{}/dapple", self.url))
                .basic_auth(&self.cfg.catapult_user, Some(&self.cfg.catapult_password))
                .json(&DeployRequest {
                    appname: app,
                    buildnum: self.cfg.build_num,
                    reponame: &self.cfg.repo,
                    username: &self.cfg.user,
                })
                .send()
                .await
                .map_err(|err| Error::DeployRequest {
                    app: app.clone(),
                    err,
                })?;

            if !res.status().is_success() {
                return Err(Error::Deploy {
                    app: app.clone(),
                    status: res.status(),
                    body: res.text().await.unwrap_or_default(),
                });
            }
        }
        Ok(())
    }
}
