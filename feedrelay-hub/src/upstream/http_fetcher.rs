//! HTTP binding for upstream requests
//!
//! Asks the fetcher service to start producing a resource with
//! `GET {base_url}{resource_id}`; the fetcher later pushes the data back to
//! `POST /broadcast`.

use std::time::Duration;

use async_trait::async_trait;
use feedrelay_core::models::ResourceRequest;
use reqwest::header::AUTHORIZATION;
use reqwest::Client;

use super::RequestTransport;
use crate::error::{RelayError, Result};

pub struct HttpFetcher {
    client: Client,
    base_url: String,
    credential: String,
}

impl HttpFetcher {
    pub fn new(
        base_url: impl Into<String>,
        credential: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            credential: credential.into(),
        })
    }

    fn url_for(&self, request: &ResourceRequest) -> String {
        format!("{}{}", self.base_url, request.resource_id)
    }
}

#[async_trait]
impl RequestTransport for HttpFetcher {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn send_request(&self, request: &ResourceRequest) -> Result<()> {
        let response = self
            .client
            .get(self.url_for(request))
            .header(AUTHORIZATION, &self.credential)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::UpstreamStatus(status.as_u16()));
        }
        Ok(())
    }
}
