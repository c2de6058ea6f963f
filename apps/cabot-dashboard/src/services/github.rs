use async_trait::async_trait;
use cabot_proto::SiteReleases;
use serde::Deserialize;
use tracing::debug;

use super::{CollaboratorError, ReleaseSource, USER_AGENT};

#[derive(Deserialize)]
struct Release {
    tag_name: String,
}

pub struct GithubReleases {
    http: reqwest::Client,
    base_url: String,
    org: String,
    token: Option<String>,
}

impl GithubReleases {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        org: impl Into<String>,
        token: Option<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            org: org.into(),
            token,
        }
    }

    /// Bare repository names live under the configured org.
    pub fn qualify(&self, repository: &str) -> String {
        let repository = repository.trim().trim_matches('/');
        if repository.contains('/') {
            repository.to_string()
        } else {
            format!("{}/{}", self.org, repository)
        }
    }
}

/// `cmu-cabot/cabot_sites_cmu` → `cabot_site_cmu_3d`.
pub fn site_name(repository: &str) -> String {
    let basename = repository.rsplit('/').next().unwrap_or(repository);
    format!("{}_3d", basename.replace("_sites_", "_site_"))
}

#[async_trait]
impl ReleaseSource for GithubReleases {
    async fn fetch_site_releases(
        &self,
        repository: &str,
    ) -> Result<SiteReleases, CollaboratorError> {
        if repository.trim().is_empty() {
            return Err(CollaboratorError::Decode("repository is required".into()));
        }
        let repository = self.qualify(repository);
        let url = format!("{}/repos/{}/releases", self.base_url, repository);
        debug!(repository = %repository, "fetching site releases");
        let mut request = self
            .http
            .get(&url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json");
        if let Some(token) = &self.token {
            request = request.header(reqwest::header::AUTHORIZATION, format!("token {token}"));
        }
        let releases = request
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<Release>>()
            .await
            .map_err(|err| CollaboratorError::Decode(err.to_string()))?;

        Ok(SiteReleases {
            site: site_name(&repository),
            versions: releases.into_iter().map(|r| r.tag_name).collect(),
            repository,
        })
    }
}

#[cfg(test)]
mod tests {
    use axum::{extract::Path, http::HeaderMap, routing::get, Json, Router};
    use serde_json::{json, Value};

    use super::*;
    use crate::services::serve_stub;

    async fn releases_stub(
        Path((owner, repo)): Path<(String, String)>,
        headers: HeaderMap,
    ) -> Json<Value> {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("none")
            .to_string();
        Json(json!([
            { "tag_name": format!("{owner}/{repo}") },
            { "tag_name": auth }
        ]))
    }

    #[test]
    fn site_name_follows_sites_convention() {
        assert_eq!(site_name("cmu-cabot/cabot_sites_cmu"), "cabot_site_cmu_3d");
        assert_eq!(site_name("cabot_sites_miraikan"), "cabot_site_miraikan_3d");
    }

    #[test]
    fn bare_names_get_the_org_prefix() {
        let github = GithubReleases::new(reqwest::Client::new(), "", "cmu-cabot", None);
        assert_eq!(github.qualify("cabot_sites_cmu"), "cmu-cabot/cabot_sites_cmu");
        assert_eq!(github.qualify("other/cabot_sites_x"), "other/cabot_sites_x");
    }

    #[tokio::test]
    async fn lists_release_tags_with_token() {
        let base = serve_stub(
            Router::new().route("/repos/:owner/:repo/releases", get(releases_stub)),
        )
        .await;
        let github = GithubReleases::new(
            reqwest::Client::new(),
            base,
            "cmu-cabot",
            Some("secret".into()),
        );

        let releases = github.fetch_site_releases("cabot_sites_cmu").await.unwrap();
        assert_eq!(releases.repository, "cmu-cabot/cabot_sites_cmu");
        assert_eq!(releases.site, "cabot_site_cmu_3d");
        assert_eq!(
            releases.versions,
            vec!["cmu-cabot/cabot_sites_cmu", "token secret"]
        );
    }

    #[tokio::test]
    async fn empty_repository_is_rejected() {
        let github = GithubReleases::new(reqwest::Client::new(), "", "cmu-cabot", None);
        assert!(matches!(
            github.fetch_site_releases("  ").await,
            Err(CollaboratorError::Decode(_))
        ));
    }
}
