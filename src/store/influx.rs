//! HTTP client for the InfluxDB 2.x query API.

use super::annotated_csv::parse_tables;
use super::{FluxTable, TimeSeriesStore};
use crate::config::StoreSettings;
use crate::error::StoreError;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde_json::json;
use std::time::Duration;

/// Query client bound to one organisation.
#[derive(Clone)]
pub struct InfluxClient {
    http: reqwest::Client,
    url: String,
    org: String,
    token: String,
}

impl InfluxClient {
    pub fn new(settings: &StoreSettings) -> Result<Self, StoreError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            url: settings.url.trim_end_matches('/').to_string(),
            org: settings.org.clone(),
            token: settings.token.clone(),
        })
    }

    fn query_url(&self) -> String {
        format!("{}/api/v2/query", self.url)
    }
}

#[async_trait]
impl TimeSeriesStore for InfluxClient {
    async fn query(&self, flux: &str) -> Result<Vec<FluxTable>, StoreError> {
        tracing::debug!(query = %flux, "running store query");
        let body = json!({
            "query": flux,
            "type": "flux",
            "dialect": {
                "header": true,
                "delimiter": ",",
                "annotations": ["datatype", "group", "default"],
            },
        });

        let response = self
            .http
            .post(self.query_url())
            .query(&[("org", self.org.as_str())])
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .header(ACCEPT, "application/csv")
            .header(CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), "store query rejected");
            return Err(StoreError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        parse_tables(&text)
    }
}
