use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{ApiRequest, RequestGateway};
use crate::error::GatewayError;
use crate::rooms::Profile;

/// Fetches sender profiles that are not on a room's roster, caching results
#[derive(Clone)]
pub struct ProfileDirectory {
    gateway: Arc<RequestGateway>,
    cache: Arc<RwLock<HashMap<String, Profile>>>,
}

impl ProfileDirectory {
    pub fn new(gateway: Arc<RequestGateway>) -> Self {
        Self {
            gateway,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn cached(&self, user_id: &str) -> Option<Profile> {
        self.cache.read().await.get(user_id).cloned()
    }

    pub async fn fetch(&self, user_id: &str) -> Result<Profile, GatewayError> {
        if let Some(profile) = self.cached(user_id).await {
            return Ok(profile);
        }

        let profile: Profile = self
            .gateway
            .send_json(ApiRequest::get(format!("/profiles/{}", user_id)))
            .await?;
        self.cache
            .write()
            .await
            .insert(user_id.to_string(), profile.clone());

        Ok(profile)
    }
}
