//! Narrative-generation collaborator.
//!
//! One GET per level cohort:
//! `<narrativeUrl>?hucs=02070010,02070011&level=advisory&triggeredBy=sentinel`
//! with the shared cron secret as a bearer token when one is configured.

use async_trait::async_trait;
use url::Url;

use crate::config::EscalationConfig;
use crate::error::EscalationError;
use crate::types::AlertLevel;

/// Response bodies are cut to this many characters in error messages.
const MAX_ERROR_BODY: usize = 300;

/// One cohort's worth of work for the narrative service.
#[derive(Debug, Clone, PartialEq)]
pub struct NarrativeRequest {
    pub hucs: Vec<String>,
    pub level: AlertLevel,
}

#[async_trait]
pub trait NarrativeClient: Send + Sync {
    async fn generate(&self, request: &NarrativeRequest) -> Result<(), EscalationError>;
}

pub struct HttpNarrativeClient {
    client: reqwest::Client,
    url: Option<Url>,
    token: Option<String>,
}

impl HttpNarrativeClient {
    /// Build from config. A missing URL is allowed; every call then fails
    /// with a configuration error. A malformed URL is rejected here.
    pub fn new(config: &EscalationConfig, token: Option<String>) -> Result<Self, EscalationError> {
        let url = config
            .narrative_url
            .as_deref()
            .map(Url::parse)
            .transpose()
            .map_err(|e| EscalationError::Configuration(format!("narrativeUrl: {}", e)))?;

        if url.is_none() {
            log::warn!("Escalation: no narrativeUrl configured, escalations will fail");
        }

        Ok(Self {
            client: reqwest::Client::new(),
            url,
            token,
        })
    }

    /// Full request URL for a cohort.
    pub fn request_url(&self, request: &NarrativeRequest) -> Result<Url, EscalationError> {
        let mut url = self
            .url
            .clone()
            .ok_or_else(|| EscalationError::Configuration("narrativeUrl is not configured".into()))?;
        url.query_pairs_mut()
            .append_pair("hucs", &request.hucs.join(","))
            .append_pair("level", request.level.as_str())
            .append_pair("triggeredBy", "sentinel");
        Ok(url)
    }
}

#[async_trait]
impl NarrativeClient for HttpNarrativeClient {
    async fn generate(&self, request: &NarrativeRequest) -> Result<(), EscalationError> {
        let url = self.request_url(request)?;
        let mut builder = self.client.get(url);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let resp = builder.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(EscalationError::Rejected {
                status: status.as_u16(),
                body: text.chars().take(MAX_ERROR_BODY).collect(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: Option<&str>) -> EscalationConfig {
        EscalationConfig {
            narrative_url: url.map(|u| u.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_request_url_carries_cohort() {
        let client = HttpNarrativeClient::new(
            &config(Some("http://localhost:3000/api/cron/narratives")),
            None,
        )
        .expect("client");
        let url = client
            .request_url(&NarrativeRequest {
                hucs: vec!["02070010".into(), "02070011".into()],
                level: AlertLevel::Advisory,
            })
            .expect("url");
        assert_eq!(
            url.as_str(),
            "http://localhost:3000/api/cron/narratives?hucs=02070010%2C02070011&level=advisory&triggeredBy=sentinel"
        );
    }

    #[test]
    fn test_malformed_url_rejected() {
        assert!(matches!(
            HttpNarrativeClient::new(&config(Some("not a url")), None),
            Err(EscalationError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_url_fails_without_network() {
        let client = HttpNarrativeClient::new(&config(None), None).expect("client");
        let err = client
            .generate(&NarrativeRequest {
                hucs: vec!["02070010".into()],
                level: AlertLevel::Alert,
            })
            .await
            .expect_err("should fail");
        assert!(!err.is_retryable());
    }
}
