//! Reachability probe.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{info, warn};

#[async_trait]
pub trait Probe: Send + Sync {
    /// `true` when the outside world is directly reachable.
    async fn check(&self) -> bool;
}

/// Issues a single GET to the check address. Only `200 OK` counts as success.
#[derive(Clone, Debug)]
pub struct HttpProbe {
    client: reqwest::Client,
    address: String,
}

impl HttpProbe {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        // The probe measures the direct path, so never honour proxy env vars.
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            address: address.into(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn check(&self) -> bool {
        match self.client.get(&self.address).send().await {
            Ok(response) if response.status() == StatusCode::OK => {
                info!("Reachability check to {} succeeded", self.address);
                true
            }
            Ok(response) => {
                warn!(
                    "Reachability check to {} failed: status {}",
                    self.address,
                    response.status()
                );
                false
            }
            Err(e) => {
                warn!("Reachability check to {} failed: {}", self.address, e);
                false
            }
        }
    }
}
