use thiserror::Error;

/// Regions that artifacts are replicated to. Container images and
/// function archives currently share the same list, but they are kept
/// as separate fields on [`Config`] because registry replication and
/// object storage uploads are configured independently.
pub const DEFAULT_REGIONS: [&str; 4] = ["us-west-1", "us-west-2", "us-east-1", "us-east-2"];

const DEFAULT_PRIMARY_BRANCH: &str = "master";

#[derive(Error, Debug)]
pub enum Error {
    #[error("env variable missing: {0}")]
    Missing(&'static str),

    #[error("invalid value {1} for {0}: cannot be converted to an integer")]
    InvalidInt(&'static str, String),

    #[error("commit sha {0} is shorter than 7 characters")]
    ShortSha(String),
}

/// All run configuration, resolved from the CI environment exactly once
/// at process start. Every other module receives this struct by
/// reference and never touches the process environment itself.
#[derive(Debug, Clone)]
pub struct Config {
    /// Hostname of the container registry that replicates pushed
    /// images across regions.
    pub registry_host: String,
    /// Full git commit sha being built.
    pub full_sha: String,
    /// First 7 characters of `full_sha`, used in every artifact address.
    pub short_sha: String,
    /// Git branch being built.
    pub branch: String,
    /// Branch that deploys are triggered from.
    pub primary_branch: String,
    /// Name of the repository being built.
    pub repo: String,
    /// CI user the build runs as.
    pub user: String,
    /// CI build number, forwarded to the tracking service.
    pub build_num: i64,
    /// Base URL of the catapult deployment-tracking service.
    pub catapult_url: String,
    pub catapult_user: String,
    pub catapult_password: String,
    /// Prefix of the per-region object storage buckets holding
    /// function archives. The bucket naming scheme is `<prefix>-<region>`.
    pub bucket_prefix: String,
    /// Optional registry credentials. When unset the local docker
    /// credential chain is used, e.g. on a developer machine.
    pub registry_username: Option<String>,
    pub registry_password: Option<String>,
    pub container_regions: Vec<String>,
    pub function_regions: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, Error> {
        let full_sha = must("CI_SHA1")?;
        if full_sha.len() < 7 {
            return Err(Error::ShortSha(full_sha));
        }
        let short_sha = full_sha[..7].to_string();

        let build_num = must("CI_BUILD_NUM")?;
        let build_num = build_num
            .parse::<i64>()
            .map_err(|_| Error::InvalidInt("CI_BUILD_NUM", build_num.clone()))?;

        let regions: Vec<String> = DEFAULT_REGIONS.iter().map(|r| r.to_string()).collect();

        Ok(Self {
            registry_host: must("REGISTRY_HOST")?,
            short_sha,
            full_sha,
            branch: must("CI_BRANCH")?,
            primary_branch: optional("PRIMARY_BRANCH")
                .unwrap_or_else(|| DEFAULT_PRIMARY_BRANCH.to_string()),
            repo: must("CI_REPONAME")?,
            user: must("CI_USERNAME")?,
            build_num,
            catapult_url: must("CATAPULT_URL")?,
            catapult_user: must("CATAPULT_USER")?,
            catapult_password: must("CATAPULT_PASS")?,
            bucket_prefix: must("LAMBDA_BUCKET_PREFIX")?,
            registry_username: optional("REGISTRY_USERNAME"),
            registry_password: optional("REGISTRY_PASSWORD"),
            container_regions: regions.clone(),
            function_regions: regions,
        })
    }

    /// Source reference recorded on every deployment record.
    pub fn source_ref(&self) -> String {
        format!("github:Clever/{}@{}", self.repo, self.full_sha)
    }
}

fn must(key: &'static str) -> Result<String, Error> {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => Err(Error::Missing(key)),
    }
}

fn optional(key: &'static str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Serializes tests that mutate the process environment (e.g. PATH
/// rewrites pointing at stand-in binaries).
#[cfg(test)]
pub static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// A fully populated configuration for resolver tests, matching no real
/// environment.
#[cfg(test)]
pub fn test_config() -> Config {
    Config {
        registry_host: "registry.example.com".to_string(),
        full_sha: "abc1234def5678000000000000000000000000ff".to_string(),
        short_sha: "abc1234".to_string(),
        branch: "master".to_string(),
        primary_branch: "master".to_string(),
        repo: "monorepo".to_string(),
        user: "ci-bot".to_string(),
        build_num: 42,
        catapult_url: "https://catapult.example.com".to_string(),
        catapult_user: "catapult".to_string(),
        catapult_password: "hunter2".to_string(),
        bucket_prefix: "clever-artifacts".to_string(),
        registry_username: None,
        registry_password: None,
        container_regions: vec!["us-west-1".to_string(), "us-east-1".to_string()],
        function_regions: vec!["us-west-1".to_string(), "us-east-1".to_string()],
    }
}
