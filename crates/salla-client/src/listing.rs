use async_trait::async_trait;
use std::collections::HashMap;

use salla_mirror_core::errors::{Error, Result};
use salla_mirror_core::settings::SyncSettings;
use salla_mirror_core::sync::{ListingPage, ListingRequest, StoreListingSourceTrait};

use crate::client::SallaApiClient;

/// Listing source for the pull scheduler, one access token per store.
pub struct SallaListingSource {
    client: SallaApiClient,
    tokens: HashMap<String, String>,
}

impl SallaListingSource {
    pub fn new(client: SallaApiClient, tokens: HashMap<String, String>) -> Self {
        Self { client, tokens }
    }

    pub fn from_settings(settings: &SyncSettings) -> Result<Self> {
        let client = SallaApiClient::new(&settings.api_base_url, settings.api_timeout())?;
        let tokens = settings
            .stores
            .iter()
            .map(|store| (store.store_id.clone(), store.access_token.clone()))
            .collect();
        Ok(Self::new(client, tokens))
    }
}

#[async_trait]
impl StoreListingSourceTrait for SallaListingSource {
    async fn fetch_page(&self, request: ListingRequest) -> Result<ListingPage> {
        let token = self.tokens.get(&request.store_id).ok_or_else(|| {
            Error::Auth(format!("no access token for store '{}'", request.store_id))
        })?;
        let page = self
            .client
            .list_page(
                token,
                request.kind,
                request.page,
                request.per_page,
                request.since,
            )
            .await?;
        Ok(page)
    }
}
