//! Outbound collaborators used by observer request/response frames.

use async_trait::async_trait;
use cabot_proto::SiteReleases;

mod docker_hub;
mod github;

pub use docker_hub::{DockerHubTags, ImageSlot};
pub use github::{site_name, GithubReleases};

pub(crate) const USER_AGENT: &str = concat!("cabot-dashboard/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("unknown image id: {0}")]
    UnknownImage(String),
    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected upstream response: {0}")]
    Decode(String),
}

/// Image tag lookup for the configured image slots.
#[async_trait]
pub trait TagSource: Send + Sync {
    async fn fetch_tags(&self, image_id: &str) -> Result<Vec<String>, CollaboratorError>;

    async fn update_image_name(&self, image_id: &str, name: &str)
        -> Result<(), CollaboratorError>;
}

#[async_trait]
pub trait ReleaseSource: Send + Sync {
    async fn fetch_site_releases(&self, repository: &str)
        -> Result<SiteReleases, CollaboratorError>;
}

#[cfg(test)]
pub(crate) async fn serve_stub(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    format!("http://{addr}")
}
