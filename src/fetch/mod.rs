// src/fetch/mod.rs

pub mod filter;

use reqwest::{header::CONTENT_TYPE, Client, Request};
use serde_json::Value;
use std::future::Future;
use tracing::{debug, instrument};
use url::Url;

use crate::config::{Credentials, FetchSettings};
use crate::error::FetchError;
use crate::grid::WorkUnit;
pub use filter::EventFilter;

/// Anything that can turn a work unit into a decoded segmentation payload.
pub trait SegmentSource: Send + Sync + 'static {
    fn fetch(&self, unit: &WorkUnit) -> impl Future<Output = Result<Value, FetchError>> + Send;
}

/// HTTP client for the segmentation endpoint.
///
/// The body is decoded for every status code; an error payload is left for
/// the normalizer to recognise.
pub struct SegmentFetcher {
    client: Client,
    endpoint: Url,
    credentials: Credentials,
    settings: FetchSettings,
}

impl SegmentFetcher {
    pub fn new(settings: FetchSettings, credentials: Credentials) -> anyhow::Result<Self> {
        let endpoint = Url::parse(&settings.endpoint)?;
        let client = Client::builder()
            .timeout(settings.timeout())
            .danger_accept_invalid_certs(settings.insecure_skip_tls_verify)
            .build()?;
        Ok(Self {
            client,
            endpoint,
            credentials,
            settings,
        })
    }

    /// Build, but do not send, the request for `unit`.
    pub fn build_request(&self, unit: &WorkUnit) -> Result<Request, FetchError> {
        let filter = EventFilter::for_channel(
            &self.settings.event_type,
            &self.settings.channel_property,
            &unit.channel,
            &self.settings.group_by,
        );
        let e = serde_json::to_string(&filter).map_err(|source| FetchError::Encode {
            unit: unit.clone(),
            source,
        })?;
        // one-day window
        let day = unit.date.format("%Y%m%d").to_string();

        let params = [
            ("e", e),
            ("m", "totals".to_string()),
            ("start", day.clone()),
            ("end", day),
            ("limit", self.settings.limit.to_string()),
            ("i", self.settings.interval.to_string()),
        ];

        self.client
            .get(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .basic_auth(
                self.credentials.api_key(),
                Some(self.credentials.secret_key()),
            )
            .query(&params)
            .build()
            .map_err(|source| FetchError::Transport {
                unit: unit.clone(),
                source,
            })
    }
}

impl SegmentSource for SegmentFetcher {
    #[instrument(level = "debug", skip(self), fields(unit = %unit))]
    async fn fetch(&self, unit: &WorkUnit) -> Result<Value, FetchError> {
        let transport = |source| FetchError::Transport {
            unit: unit.clone(),
            source,
        };

        let request = self.build_request(unit)?;
        let response = self.client.execute(request).await.map_err(transport)?;
        let status = response.status();
        let body = response.bytes().await.map_err(transport)?;
        debug!(%status, bytes = body.len(), "segmentation response");

        serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
            unit: unit.clone(),
            source,
        })
    }
}
