/*============================================================
  Synavera Project: Syn-Forum
  Module: synforum_core::packagist
  Etiquette: Synavera Script Etiquette — Rust Profile v1.1
  ------------------------------------------------------------
  Purpose:
    Query the Packagist v2 metadata API to derive the newest
    minor and newest major release per update candidate, which
    composer's outdated report does not carry.

  Security / Safety Notes:
    Performs read-only HTTPS requests to the public Packagist
    API. No credentials are transmitted.

  Dependencies:
    reqwest for HTTP, serde for response parsing, semver for
    release ordering.

  Operational Scope:
    Enriches check outcomes before they are recorded; total
    failure degrades the check to unenriched data upstream.

  Revision History:
    2026-03-02 COD  Implemented asynchronous Packagist client.
  ------------------------------------------------------------
  SSE Principles Observed:
    - Defensive retry logic with exponential backoff
    - Structured response parsing with explicit error paths
    - Configurable timeouts and bounded parallelism
============================================================*/

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use semver::Version;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use urlencoding::encode;

use crate::config::PackagistConfig;
use crate::error::{Result, SynforumError};
use crate::state::UpdatedPackage;

/// Client for the Packagist v2 metadata endpoint.
#[derive(Clone)]
pub struct PackagistClient {
    client: reqwest::Client,
    base_url: String,
    max_retries: usize,
    max_parallel_requests: usize,
}

impl PackagistClient {
    /// Construct a new client from configuration.
    pub fn new(config: &PackagistConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .user_agent("Syn-Forum-Core/0.4 (linux)")
            .build()
            .map_err(|err| SynforumError::Network(format!("Failed to build HTTP client: {err}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries.max(1),
            max_parallel_requests: config.max_parallel_requests.max(1),
        })
    }

    /// Fill `latest_minor` / `latest_major` for each candidate from
    /// Packagist release metadata. Candidates unknown to Packagist are
    /// left untouched.
    pub async fn enrich(&self, updates: &mut [UpdatedPackage]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }

        let semaphore = Arc::new(Semaphore::new(self.max_parallel_requests));
        let mut tasks = Vec::new();
        for package in updates.iter() {
            let client = self.clone();
            let semaphore = semaphore.clone();
            let name = package.name.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| SynforumError::Runtime("Packagist semaphore closed".into()))?;
                let releases = client.fetch_releases(&name).await?;
                Ok::<(String, Option<Vec<String>>), SynforumError>((name, releases))
            }));
        }

        let mut releases_by_name: HashMap<String, Vec<String>> = HashMap::new();
        for task in tasks {
            let outcome = task
                .await
                .map_err(|err| SynforumError::Runtime(format!("Packagist task failed: {err}")))?;
            let (name, releases) = outcome?;
            if let Some(releases) = releases {
                releases_by_name.insert(name, releases);
            }
        }

        for package in updates.iter_mut() {
            if let Some(releases) = releases_by_name.get(&package.name) {
                let (latest_minor, latest_major) = derive_latest(&package.version, releases);
                package.latest_minor = latest_minor;
                package.latest_major = latest_major;
            }
        }

        Ok(())
    }

    fn compose_url(&self, package: &str) -> String {
        let (vendor, name) = package.split_once('/').unwrap_or((package, ""));
        format!(
            "{}/p2/{}/{}.json",
            self.base_url,
            encode(vendor),
            encode(name)
        )
    }

    /// Fetch tagged release version strings for one package.
    /// `Ok(None)` means the package is unknown to Packagist.
    async fn fetch_releases(&self, package: &str) -> Result<Option<Vec<String>>> {
        let url = self.compose_url(package);
        let mut attempt = 0;
        loop {
            let response = self.client.get(&url).send().await.map_err(|err| {
                SynforumError::Network(format!("Packagist request to {url} failed: {err}"))
            })?;

            match response.status() {
                StatusCode::OK => {
                    let payload = response.json::<PackagistDocument>().await.map_err(|err| {
                        SynforumError::Serialization(format!(
                            "Failed to decode Packagist response for {package}: {err}"
                        ))
                    })?;
                    let releases = payload
                        .packages
                        .into_iter()
                        .find(|(name, _)| name.as_str() == package)
                        .map(|(_, releases)| {
                            releases.into_iter().map(|release| release.version).collect()
                        });
                    return Ok(releases);
                }
                StatusCode::NOT_FOUND => return Ok(None),
                status => {
                    attempt += 1;
                    if attempt >= self.max_retries {
                        return Err(SynforumError::Network(format!(
                            "Packagist request {url} failed with status {status} after {attempt} retries"
                        )));
                    }
                    let exponent = (attempt as u32).min(8);
                    let backoff = Duration::from_millis(200_u64.saturating_mul(1_u64 << exponent));
                    sleep(backoff).await;
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct PackagistDocument {
    #[serde(default)]
    packages: HashMap<String, Vec<PackagistRelease>>,
}

#[derive(Debug, Deserialize)]
struct PackagistRelease {
    version: String,
}

/// Pick the newest release within the installed major and the newest
/// release beyond it. Pre-releases and unparseable tags are skipped;
/// returned strings keep their Packagist spelling.
fn derive_latest(installed: &str, releases: &[String]) -> (Option<String>, Option<String>) {
    let Some(installed) = lenient_version(installed) else {
        return (None, None);
    };

    let mut best_minor: Option<(Version, &str)> = None;
    let mut best_major: Option<(Version, &str)> = None;
    for raw in releases {
        let Some(version) = lenient_version(raw) else {
            continue;
        };
        if !version.pre.is_empty() {
            continue;
        }
        if version.major == installed.major && version > installed {
            if best_minor.as_ref().map(|(best, _)| version > *best).unwrap_or(true) {
                best_minor = Some((version, raw.as_str()));
            }
        } else if version.major > installed.major {
            if best_major.as_ref().map(|(best, _)| version > *best).unwrap_or(true) {
                best_major = Some((version, raw.as_str()));
            }
        }
    }

    (
        best_minor.map(|(_, raw)| raw.to_string()),
        best_major.map(|(_, raw)| raw.to_string()),
    )
}

/// Parse a composer-flavored version string. Leading `v` prefixes and
/// truncated segments (`1.8`) are tolerated; branch aliases are not.
pub(crate) fn lenient_version(raw: &str) -> Option<Version> {
    let trimmed = raw.trim().trim_start_matches(['v', 'V']);
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(version) = Version::parse(trimmed) {
        return Some(version);
    }
    let core = trimmed
        .split(|c| c == '-' || c == '+')
        .next()
        .unwrap_or_default();
    let padded = match core.matches('.').count() {
        0 => format!("{core}.0.0"),
        1 => format!("{core}.0"),
        _ => return None,
    };
    Version::parse(&padded).ok()
}
