use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{CollaboratorError, TagSource, USER_AGENT};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImageSlot {
    /// Repository name under the org; the slot id is used when unset.
    pub name: Option<String>,
    pub tags: Vec<String>,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct TagPage {
    #[serde(default)]
    results: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
}

/// Docker Hub backed tag cache keyed by image slot id.
pub struct DockerHubTags {
    http: reqwest::Client,
    base_url: String,
    org: String,
    slots: RwLock<BTreeMap<String, ImageSlot>>,
}

impl DockerHubTags {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        org: impl Into<String>,
        image_ids: impl IntoIterator<Item = String>,
    ) -> Self {
        let slots = image_ids
            .into_iter()
            .map(|id| (id, ImageSlot::default()))
            .collect();
        Self {
            http,
            base_url: base_url.into(),
            org: org.into(),
            slots: RwLock::new(slots),
        }
    }

    pub fn cached(&self, image_id: &str) -> Option<ImageSlot> {
        self.slots.read().get(image_id).cloned()
    }

    fn repository_for(&self, image_id: &str) -> Result<String, CollaboratorError> {
        let slots = self.slots.read();
        let slot = slots
            .get(image_id)
            .ok_or_else(|| CollaboratorError::UnknownImage(image_id.to_string()))?;
        Ok(slot.name.clone().unwrap_or_else(|| image_id.to_string()))
    }
}

#[async_trait]
impl TagSource for DockerHubTags {
    async fn fetch_tags(&self, image_id: &str) -> Result<Vec<String>, CollaboratorError> {
        let repository = self.repository_for(image_id)?;
        let url = format!(
            "{}/repositories/{}/{}/tags",
            self.base_url, self.org, repository
        );
        debug!(image_id, url = %url, "fetching image tags");
        let page = self
            .http
            .get(&url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .query(&[("page_size", "10"), ("ordering", "last_updated")])
            .send()
            .await?
            .error_for_status()?
            .json::<TagPage>()
            .await
            .map_err(|err| CollaboratorError::Decode(err.to_string()))?;
        let tags: Vec<String> = page.results.into_iter().map(|entry| entry.name).collect();

        let mut slots = self.slots.write();
        let slot = slots
            .get_mut(image_id)
            .ok_or_else(|| CollaboratorError::UnknownImage(image_id.to_string()))?;
        slot.tags = tags.clone();
        slot.last_updated = Some(Utc::now());
        Ok(tags)
    }

    async fn update_image_name(
        &self,
        image_id: &str,
        name: &str,
    ) -> Result<(), CollaboratorError> {
        let mut slots = self.slots.write();
        let slot = slots
            .get_mut(image_id)
            .ok_or_else(|| CollaboratorError::UnknownImage(image_id.to_string()))?;
        let name = name.trim();
        slot.name = (!name.is_empty()).then(|| name.to_string());
        slot.tags.clear();
        slot.last_updated = None;
        Ok(())
    }
}
