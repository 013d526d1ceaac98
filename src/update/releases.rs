//! Discovering the newest published release for an image.
//!
//! GHCR images are looked up through the GitHub packages API; when that is
//! refused (no or insufficient token) the anonymous registry flow is used
//! instead: fetch a pull token, then list tags.  Other images are mapped to
//! a GitHub repository and its releases.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::header::ACCEPT;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use super::reference::ImageRef;
use super::version::{is_update_available, pick_latest};

const GITHUB_API: &str = "https://api.github.com";
const GHCR: &str = "https://ghcr.io";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("invalid json from {url}: {message}")]
    Body { url: String, message: String },
}

#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("{url} answered {status}")]
    Status { url: String, status: u16 },

    #[error("cannot derive a release source from image '{0}'")]
    UnknownSource(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Value,
}

impl HttpResponse {
    fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    fn is_refused(&self) -> bool {
        matches!(self.status, 401 | 403 | 404)
    }
}

/// Minimal HTTP GET used for release discovery.
#[async_trait]
pub trait HttpFetch: Send + Sync {
    async fn get_json(&self, url: &str, bearer: Option<&str>) -> Result<HttpResponse, FetchError>;
}

/// [`HttpFetch`] over a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestFetch {
    client: reqwest::Client,
}

impl ReqwestFetch {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("openclaw-manager/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Transport {
                url: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpFetch for ReqwestFetch {
    async fn get_json(&self, url: &str, bearer: Option<&str>) -> Result<HttpResponse, FetchError> {
        let mut request = self.client.get(url).header(ACCEPT, "application/json");
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|e| FetchError::Transport {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(|e| FetchError::Transport {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            match serde_json::from_str(&text) {
                Ok(body) => body,
                Err(_) if !(200..300).contains(&status) => Value::String(text),
                Err(e) => {
                    return Err(FetchError::Body {
                        url: url.to_string(),
                        message: e.to_string(),
                    })
                }
            }
        };
        Ok(HttpResponse { status, body })
    }
}

/// Where releases for an image are published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseSource {
    Ghcr { owner: String, package: String },
    GitHub { owner: String, repo: String },
}

impl ReleaseSource {
    pub fn for_image(image: &str) -> Option<Self> {
        let reference = ImageRef::parse(image)?;
        let (owner, name) = reference.owner_and_name()?;
        if reference.registry.as_deref() == Some("ghcr.io") {
            Some(ReleaseSource::Ghcr {
                owner: owner.to_string(),
                package: name.to_string(),
            })
        } else {
            Some(ReleaseSource::GitHub {
                owner: owner.to_string(),
                repo: name.to_string(),
            })
        }
    }
}

impl fmt::Display for ReleaseSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleaseSource::Ghcr { owner, package } => write!(f, "ghcr:{}/{}", owner, package),
            ReleaseSource::GitHub { owner, repo } => write!(f, "github:{}/{}", owner, repo),
        }
    }
}

/// Result of an update check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCheck {
    pub current_image: String,
    pub current_tag: Option<String>,
    pub latest_tag: Option<String>,
    pub update_available: bool,
    pub source: String,
}

/// Compare `image`'s tag against the newest published release.
pub async fn check_image_for_updates(
    fetch: &dyn HttpFetch,
    image: &str,
    token: Option<&str>,
) -> Result<UpdateCheck, ReleaseError> {
    let source =
        ReleaseSource::for_image(image).ok_or_else(|| ReleaseError::UnknownSource(image.into()))?;
    let current_tag = ImageRef::parse(image).and_then(|r| r.tag);
    let tags = list_tags(fetch, &source, token).await?;
    let latest_tag = pick_latest(tags.iter().map(String::as_str));
    let update_available = latest_tag
        .as_deref()
        .map(|latest| is_update_available(current_tag.as_deref(), latest))
        .unwrap_or(false);
    Ok(UpdateCheck {
        current_image: image.to_string(),
        current_tag,
        latest_tag,
        update_available,
        source: source.to_string(),
    })
}

/// Every tag the source advertises, unfiltered.
pub async fn list_tags(
    fetch: &dyn HttpFetch,
    source: &ReleaseSource,
    token: Option<&str>,
) -> Result<Vec<String>, ReleaseError> {
    match source {
        ReleaseSource::Ghcr { owner, package } => {
            ghcr_tags(fetch, owner, package, non_empty(token)).await
        }
        ReleaseSource::GitHub { owner, repo } => {
            github_tags(fetch, owner, repo, non_empty(token)).await
        }
    }
}

async fn ghcr_tags(
    fetch: &dyn HttpFetch,
    owner: &str,
    package: &str,
    token: Option<&str>,
) -> Result<Vec<String>, ReleaseError> {
    let encoded = package.replace('/', "%2F");
    for kind in ["users", "orgs"] {
        let url = format!(
            "{}/{}/{}/packages/container/{}/versions?per_page=100",
            GITHUB_API, kind, owner, encoded
        );
        let response = fetch.get_json(&url, token).await?;
        if response.is_success() {
            return Ok(package_version_tags(&response.body));
        }
        if response.status == 404 {
            continue;
        }
        if response.is_refused() {
            break;
        }
        return Err(ReleaseError::Status {
            url,
            status: response.status,
        });
    }

    debug!(
        "Packages API refused {}/{}, using anonymous registry listing",
        owner, package
    );
    let token_url = format!(
        "{}/token?scope=repository:{}/{}:pull",
        GHCR, owner, package
    );
    let response = fetch.get_json(&token_url, None).await?;
    let pull_token = response
        .body
        .get("token")
        .and_then(Value::as_str)
        .filter(|_| response.is_success())
        .map(str::to_string)
        .ok_or(ReleaseError::Status {
            url: token_url,
            status: response.status,
        })?;

    let tags_url = format!("{}/v2/{}/{}/tags/list?n=1000", GHCR, owner, package);
    let response = fetch.get_json(&tags_url, Some(&pull_token)).await?;
    if !response.is_success() {
        warn!("Registry tag listing failed with {}", response.status);
        return Err(ReleaseError::Status {
            url: tags_url,
            status: response.status,
        });
    }
    Ok(string_array(response.body.get("tags")))
}

async fn github_tags(
    fetch: &dyn HttpFetch,
    owner: &str,
    repo: &str,
    token: Option<&str>,
) -> Result<Vec<String>, ReleaseError> {
    let url = format!("{}/repos/{}/{}/releases?per_page=50", GITHUB_API, owner, repo);
    let response = fetch.get_json(&url, token).await?;
    if response.is_success() {
        let tags = response
            .body
            .as_array()
            .map(|releases| {
                releases
                    .iter()
                    .filter(|r| !flag(r, "draft") && !flag(r, "prerelease"))
                    .filter_map(|r| r.get("tag_name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        return Ok(tags);
    }
    if response.status != 404 {
        return Err(ReleaseError::Status {
            url,
            status: response.status,
        });
    }

    // Repositories without formal releases still have tags.
    let url = format!("{}/repos/{}/{}/tags?per_page=100", GITHUB_API, owner, repo);
    let response = fetch.get_json(&url, token).await?;
    if !response.is_success() {
        return Err(ReleaseError::Status {
            url,
            status: response.status,
        });
    }
    Ok(response
        .body
        .as_array()
        .map(|tags| {
            tags.iter()
                .filter_map(|t| t.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default())
}

fn package_version_tags(body: &Value) -> Vec<String> {
    body.as_array()
        .map(|versions| {
            versions
                .iter()
                .flat_map(|v| string_array(v.pointer("/metadata/container/tags")))
                .collect()
        })
        .unwrap_or_default()
}

fn string_array(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn flag(value: &Value, key: &str) -> bool {
    value.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn non_empty(token: Option<&str>) -> Option<&str> {
    token.map(str::trim).filter(|t| !t.is_empty())
}
