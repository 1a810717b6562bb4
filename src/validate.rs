use std::path::Path;

use chrono::{NaiveDate, Utc};
use log::warn;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

const NODE_INDEX_URL: &str = "https://nodejs.org/dist/index.json";
const GO_RELEASE_URL: &str = "https://go.dev/doc/devel/release";

/// How long after a new LTS release the old toolchain keeps passing CI.
const GRACE_DAYS: i64 = 180;

/// Go versions at or below this floor fail validation once a newer
/// release is out. Raise it as old releases fall out of support.
const GO_ENFORCEMENT_FLOOR: (u32, u32) = (1, 23);

#[derive(Error, Debug)]
pub enum Error {
    /// A policy violation. Reported with a distinct exit code so CI can
    /// tell misconfigured repositories from infrastructure failures.
    #[error("{0}")]
    Policy(String),

    #[error("failed to fetch {0}: {1}")]
    Fetch(&'static str, reqwest::Error),

    #[error("failed to fetch {0}: status code {1}")]
    FetchStatus(&'static str, reqwest::StatusCode),

    #[error("failed to read {0}: {1}")]
    ReadFile(&'static str, std::io::Error),

    #[error("{0}")]
    Parse(String),

    #[error(transparent)]
    Pattern(#[from] regex::Error),
}

/// Pre-flight policy checks, run before any build is attempted: the
/// branch name must be representable by the tracking service, and if
/// the repository carries a Node.js or Go toolchain marker its declared
/// version must not have aged out of support.
pub async fn run(cfg: &crate::config::Config) -> Result<(), Error> {
    check_branch(&cfg.branch)?;

    if Path::new("./package.json").is_file() {
        check_node_version().await?;
    }
    if Path::new("./go.mod").is_file() {
        check_go_version().await?;
    }
    Ok(())
}

fn check_branch(branch: &str) -> Result<(), Error> {
    if branch.contains('/') {
        return Err(Error::Policy(format!(
            "branch name {branch} contains a `/` character, which is not supported by catapult"
        )));
    }
    Ok(())
}

#[derive(Deserialize)]
struct NodeRelease {
    version: String,
    date: String,
    #[serde(default)]
    lts: Lts,
}

// The `lts` field of the Node.js release index is `false` for regular
// releases and the release's codename for LTS releases.
#[derive(Deserialize)]
#[serde(untagged)]
enum Lts {
    Flag(bool),
    Name(String),
}

impl Default for Lts {
    fn default() -> Self {
        Lts::Flag(false)
    }
}

impl Lts {
    fn is_lts(&self) -> bool {
        match self {
            Lts::Flag(flag) => *flag,
            Lts::Name(name) => !name.is_empty(),
        }
    }
}

async fn check_node_version() -> Result<(), Error> {
    let res = client()?
        .get(NODE_INDEX_URL)
        .send()
        .await
        .map_err(|err| Error::Fetch(NODE_INDEX_URL, err))?;
    if !res.status().is_success() {
        return Err(Error::FetchStatus(NODE_INDEX_URL, res.status()));
    }
    let releases: Vec<NodeRelease> = res
        .json()
        .await
        .map_err(|err| Error::Fetch(NODE_INDEX_URL, err))?;
    let (lts_major, lts_date) = latest_lts(&releases)?;

    let dockerfile = std::fs::read_to_string("./Dockerfile")
        .map_err(|err| Error::ReadFile("./Dockerfile", err))?;
    let current = node_major_from_dockerfile(&dockerfile)?;

    if current >= lts_major {
        return Ok(());
    }
    if Utc::now().date_naive() - lts_date > chrono::Duration::days(GRACE_DAYS) {
        return Err(Error::Policy(format!(
            "Node.js version v{current} is no longer supported, upgrade to the \
             Long Term Support version v{lts_major} or later"
        )));
    }
    warn!(
        "a new Node.js Long Term Support version v{lts_major} was released on {lts_date}; \
         v{current} will fail CI once that release is {GRACE_DAYS} days old"
    );
    Ok(())
}

/// Major version and release date of the most recent LTS release. The
/// index is ordered newest first.
fn latest_lts(releases: &[NodeRelease]) -> Result<(u32, NaiveDate), Error> {
    let release = releases
        .iter()
        .find(|r| r.lts.is_lts())
        .ok_or_else(|| Error::Parse("no LTS release in the Node.js release index".to_string()))?;

    let major = release
        .version
        .trim_start_matches('v')
        .split('.')
        .next()
        .and_then(|m| m.parse().ok())
        .ok_or_else(|| {
            Error::Parse(format!("unparsable Node.js version {}", release.version))
        })?;
    let date = NaiveDate::parse_from_str(&release.date, "%Y-%m-%d")
        .map_err(|_| Error::Parse(format!("unparsable release date {}", release.date)))?;
    Ok((major, date))
}

/// The Node.js major version the application builds against, taken from
/// its Dockerfile: either the base image or, for apps not based on the
/// standard image, an explicit nodesource setup script download.
fn node_major_from_dockerfile(contents: &str) -> Result<u32, Error> {
    for pattern in [r"FROM node:([0-9]+)", r"deb\.nodesource\.com/setup_([0-9]+)\."] {
        if let Some(captures) = Regex::new(pattern)?.captures(contents) {
            if let Ok(major) = captures[1].parse() {
                return Ok(major);
            }
        }
    }
    Err(Error::Parse(
        "no Node.js version found in Dockerfile".to_string(),
    ))
}

async fn check_go_version() -> Result<(), Error> {
    let res = client()?
        .get(GO_RELEASE_URL)
        .send()
        .await
        .map_err(|err| Error::Fetch(GO_RELEASE_URL, err))?;
    if !res.status().is_success() {
        return Err(Error::FetchStatus(GO_RELEASE_URL, res.status()));
    }
    let body = res
        .text()
        .await
        .map_err(|err| Error::Fetch(GO_RELEASE_URL, err))?;
    let (latest, release_date) = latest_go_release(&body)?;

    let gomod =
        std::fs::read_to_string("./go.mod").map_err(|err| Error::ReadFile("./go.mod", err))?;
    let current = go_directive(&gomod)?;

    if current <= GO_ENFORCEMENT_FLOOR && GO_ENFORCEMENT_FLOOR < latest {
        return Err(Error::Policy(format!(
            "go version {}.{} is no longer supported, upgrade to {}.{}",
            current.0, current.1, latest.0, latest.1
        )));
    }
    if current < latest {
        warn!(
            "a new Go version {}.{} was released on {release_date}; version {}.{} will fail CI \
             once it falls below the enforcement floor",
            latest.0, latest.1, current.0, current.1
        );
    }
    Ok(())
}

/// Latest released Go version and its release date, scraped from the
/// release history page.
fn latest_go_release(body: &str) -> Result<((u32, u32), NaiveDate), Error> {
    let re = Regex::new(
        r"go([0-9]+)\.([0-9]+)(?:\.[0-9]+)? \(released ([0-9]{4}-[0-9]{2}-[0-9]{2})\)",
    )?;
    let captures = re
        .captures(body)
        .ok_or_else(|| Error::Parse("no release found on the Go release page".to_string()))?;

    let major = captures[1]
        .parse()
        .map_err(|_| Error::Parse("unparsable Go major version".to_string()))?;
    let minor = captures[2]
        .parse()
        .map_err(|_| Error::Parse("unparsable Go minor version".to_string()))?;
    let date = NaiveDate::parse_from_str(&captures[3], "%Y-%m-%d")
        .map_err(|_| Error::Parse(format!("unparsable release date {}", &captures[3])))?;
    Ok(((major, minor), date))
}

/// Major and minor of the `go` directive in a go.mod file.
fn go_directive(contents: &str) -> Result<(u32, u32), Error> {
    let version = contents
        .lines()
        .find_map(|line| line.trim().strip_prefix("go "))
        .ok_or_else(|| Error::Parse("no go directive in go.mod".to_string()))?;

    let mut parts = version.trim().split('.');
    let major = parts.next().and_then(|p| p.parse().ok());
    let minor = parts.next().and_then(|p| p.parse().ok());
    match (major, minor) {
        (Some(major), Some(minor)) => Ok((major, minor)),
        _ => Err(Error::Parse(format!("unparsable go directive {version}"))),
    }
}

fn client() -> Result<reqwest::Client, Error> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .map_err(|err| Error::Fetch("client", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_with_slash_is_rejected() {
        let err = check_branch("feature/foo").unwrap_err();
        assert!(matches!(err, Error::Policy(_)));
        assert!(err.to_string().contains("feature/foo"));

        assert!(check_branch("master").is_ok());
        assert!(check_branch("fix-widgets").is_ok());
    }

    #[test]
    fn node_major_from_base_image() {
        let major = node_major_from_dockerfile("FROM node:18-alpine\nRUN npm ci\n").unwrap();
        assert_eq!(major, 18);
    }

    #[test]
    fn node_major_from_nodesource_setup() {
        let dockerfile = concat!(
            "FROM debian:bookworm\n",
            "RUN curl -fsSL https://deb.nodesource.com/setup_20.x | bash -\n",
        );
        assert_eq!(node_major_from_dockerfile(dockerfile).unwrap(), 20);
    }

    #[test]
    fn node_major_missing() {
        let err = node_major_from_dockerfile("FROM golang:1.23\n").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn latest_lts_skips_non_lts_releases() {
        let index = r#"[
            {"version": "v23.1.0", "date": "2024-10-24", "lts": false},
            {"version": "v22.11.0", "date": "2024-10-29", "lts": "Jod"},
            {"version": "v20.18.0", "date": "2024-10-03", "lts": "Iron"}
        ]"#;
        let releases: Vec<NodeRelease> = serde_json::from_str(index).unwrap();
        let (major, date) = latest_lts(&releases).unwrap();
        assert_eq!(major, 22);
        assert_eq!(date, NaiveDate::from_ymd_opt(2024, 10, 29).unwrap());
    }

    #[test]
    fn go_directive_versions() {
        assert_eq!(go_directive("module m\n\ngo 1.24.1\n").unwrap(), (1, 24));
        assert_eq!(go_directive("module m\n\ngo 1.21\n").unwrap(), (1, 21));
        assert!(matches!(
            go_directive("module m\n").unwrap_err(),
            Error::Parse(_)
        ));
    }

    #[test]
    fn go_release_page_scrape() {
        let body = "history.\n\ngo1.24.5 (released 2025-07-08) includes security fixes";
        let ((major, minor), date) = latest_go_release(body).unwrap();
        assert_eq!((major, minor), (1, 24));
        assert_eq!(date, NaiveDate::from_ymd_opt(2025, 7, 8).unwrap());
    }
}
