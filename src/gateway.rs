use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::filters::CanonicalQuery;
use crate::models::{
    BuildRecord, ChartBucket, LogPayload, OverviewMetrics, PipelinePerformance, TrendPoint,
};
use async_trait::async_trait;
use moka::future::Cache;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use url::Url;

/// Read side of the metrics backend. Endpoints that a backend may not
/// implement return `Ok(None)` on 404 so callers can fall back.
#[async_trait]
pub trait DataGateway: Send + Sync {
    async fn overview(&self) -> Result<OverviewMetrics, GatewayError>;

    async fn builds(
        &self,
        query: &CanonicalQuery,
        limit: usize,
    ) -> Result<Vec<BuildRecord>, GatewayError>;

    async fn chart_data(&self, days: usize) -> Result<Option<Vec<ChartBucket>>, GatewayError>;

    async fn build_trends(&self, days: usize) -> Result<Option<Vec<TrendPoint>>, GatewayError>;

    async fn pipeline_performance(
        &self,
        limit: usize,
    ) -> Result<Vec<PipelinePerformance>, GatewayError>;

    async fn logs(&self, provider: &str, external_id: &str) -> Result<LogPayload, GatewayError>;
}

#[derive(Clone)]
pub struct HttpGateway {
    client: Client,
    base_url: Url,
    log_cache: Cache<(String, String), LogPayload>,
}

impl HttpGateway {
    pub fn new(cfg: &GatewayConfig) -> Result<Self, GatewayError> {
        let base_url = Url::parse(&cfg.base_url)
            .map_err(|e| GatewayError::InvalidUrl(format!("{}: {e}", cfg.base_url)))?;
        if base_url.cannot_be_a_base() {
            return Err(GatewayError::InvalidUrl(cfg.base_url.clone()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .user_agent(concat!("pipeline-pulse/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(GatewayError::Client)?;

        Ok(Self {
            client,
            base_url,
            log_cache: Cache::builder()
                .time_to_live(Duration::from_secs(cfg.log_cache_ttl_seconds))
                .max_capacity(cfg.log_cache_capacity)
                .build(),
        })
    }

    /// Push channel on the same host: `http -> ws`, `https -> wss`, path `/ws`.
    pub fn push_channel_url(&self) -> Result<Url, GatewayError> {
        let mut url = self.endpoint(&["ws"])?;
        let scheme = match url.scheme() {
            "http" => "ws",
            "https" => "wss",
            other => return Err(GatewayError::InvalidUrl(format!("unsupported scheme {other}"))),
        };
        url.set_scheme(scheme)
            .map_err(|_| GatewayError::InvalidUrl(url.to_string()))?;
        url.set_query(None);
        Ok(url)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, GatewayError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| GatewayError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        query: &[(&str, String)],
    ) -> Result<Option<T>, GatewayError> {
        let url = self.endpoint(segments)?;
        let path = url.path().to_string();
        tracing::debug!("GET {} {:?}", path, query);

        let resp = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|source| GatewayError::Transport { path: path.clone(), source })?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(GatewayError::Status { path, status });
        }

        // Read the body first so a bad shape is reported as Malformed rather
        // than as a transport failure.
        let body = resp
            .text()
            .await
            .map_err(|source| GatewayError::Transport { path: path.clone(), source })?;
        serde_json::from_str(&body)
            .map(Some)
            .map_err(|source| GatewayError::Malformed { path, source })
    }

    async fn fetch_required<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        query: &[(&str, String)],
    ) -> Result<T, GatewayError> {
        match self.fetch(segments, query).await? {
            Some(v) => Ok(v),
            None => Err(GatewayError::Status {
                path: format!("/{}", segments.join("/")),
                status: StatusCode::NOT_FOUND,
            }),
        }
    }
}

#[async_trait]
impl DataGateway for HttpGateway {
    async fn overview(&self) -> Result<OverviewMetrics, GatewayError> {
        self.fetch_required(&["api", "metrics", "overview"], &[]).await
    }

    async fn builds(
        &self,
        query: &CanonicalQuery,
        limit: usize,
    ) -> Result<Vec<BuildRecord>, GatewayError> {
        let mut params: Vec<(&str, String)> = query
            .pairs()
            .into_iter()
            .map(|(k, v)| (k, v.to_string()))
            .collect();
        params.push(("limit", limit.to_string()));
        self.fetch_required(&["api", "builds"], &params).await
    }

    async fn chart_data(&self, days: usize) -> Result<Option<Vec<ChartBucket>>, GatewayError> {
        self.fetch(&["api", "metrics", "chart-data"], &[("days", days.to_string())])
            .await
    }

    async fn build_trends(&self, days: usize) -> Result<Option<Vec<TrendPoint>>, GatewayError> {
        self.fetch(&["api", "metrics", "build-trends"], &[("days", days.to_string())])
            .await
    }

    async fn pipeline_performance(
        &self,
        limit: usize,
    ) -> Result<Vec<PipelinePerformance>, GatewayError> {
        self.fetch_required(
            &["api", "metrics", "pipeline-performance"],
            &[("limit", limit.to_string())],
        )
        .await
    }

    async fn logs(&self, provider: &str, external_id: &str) -> Result<LogPayload, GatewayError> {
        let key = (provider.to_string(), external_id.to_string());
        if let Some(cached) = self.log_cache.get(&key) {
            return Ok(cached);
        }
        let payload: LogPayload = self
            .fetch_required(&["api", "logs", provider, external_id], &[])
            .await?;
        self.log_cache.insert(key, payload.clone()).await;
        Ok(payload)
    }
}
