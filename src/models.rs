use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Provider {
    Github,
    Gitlab,
    Jenkins,
    Other(String),
}

impl Provider {
    pub fn as_str(&self) -> &str {
        match self {
            Provider::Github => "github",
            Provider::Gitlab => "gitlab",
            Provider::Jenkins => "jenkins",
            Provider::Other(name) => name,
        }
    }
}

impl From<String> for Provider {
    fn from(raw: String) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "github" => Provider::Github,
            "gitlab" => Provider::Gitlab,
            "jenkins" => Provider::Jenkins,
            _ => Provider::Other(raw),
        }
    }
}

impl From<Provider> for String {
    fn from(p: Provider) -> Self {
        p.as_str().to_string()
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BuildStatus {
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
    Unknown(String),
}

impl BuildStatus {
    pub fn as_str(&self) -> &str {
        match self {
            BuildStatus::Queued => "queued",
            BuildStatus::Running => "running",
            BuildStatus::Success => "success",
            BuildStatus::Failed => "failed",
            BuildStatus::Cancelled => "cancelled",
            BuildStatus::Unknown(raw) => raw,
        }
    }
}

impl From<String> for BuildStatus {
    fn from(raw: String) -> Self {
        // Providers disagree on spelling; fold the common synonyms.
        match raw.to_ascii_lowercase().as_str() {
            "queued" | "pending" | "created" | "waiting_for_resource" => BuildStatus::Queued,
            "running" | "in_progress" => BuildStatus::Running,
            "success" | "passed" => BuildStatus::Success,
            "failed" | "failure" => BuildStatus::Failed,
            "cancelled" | "canceled" | "aborted" => BuildStatus::Cancelled,
            _ => BuildStatus::Unknown(raw),
        }
    }
}

impl From<BuildStatus> for String {
    fn from(s: BuildStatus) -> Self {
        s.as_str().to_string()
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One build as returned by `/api/builds`. Never patched in place; a new
/// fetch replaces the whole list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub id: i64,
    pub provider: Provider,
    #[serde(alias = "pipeline_name")]
    pub pipeline: String,
    pub status: BuildStatus,
    #[serde(default, deserialize_with = "parse_timestamp")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_seconds: Option<i64>,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub web_url: Option<String>,
}

impl BuildRecord {
    /// Identifier used for log lookups; the backend falls back to the row id.
    pub fn external_ref(&self) -> String {
        self.external_id
            .clone()
            .unwrap_or_else(|| self.id.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverviewMetrics {
    pub success_rate: f64,
    pub failure_rate: f64,
    pub avg_build_time_seconds: Option<f64>,
    pub total_pipelines: u64,
    pub active_pipelines: u64,
    pub builds_today: u64,
    pub builds_this_week: u64,
    pub last_build_status: Option<BuildStatus>,
    #[serde(deserialize_with = "parse_timestamp")]
    pub last_build_at: Option<DateTime<Utc>>,
}

/// A single point of a chart series.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChartBucket {
    #[serde(alias = "time", alias = "date")]
    pub label: String,
    #[serde(default, alias = "success_count")]
    pub success: u32,
    #[serde(default, alias = "failed_count", alias = "failure_count")]
    pub failed: u32,
    #[serde(default, alias = "running_count")]
    pub running: u32,
    #[serde(default, alias = "avg")]
    pub avg_duration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub date: NaiveDate,
    #[serde(default)]
    pub success_count: u32,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub avg_duration: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelinePerformance {
    pub pipeline_name: String,
    #[serde(default)]
    pub total_builds: u64,
    #[serde(default)]
    pub success_rate: f64,
    #[serde(default)]
    pub avg_duration: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogPayload {
    pub provider: String,
    pub external_id: String,
    pub logs: LogBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LogBody {
    Text(String),
    Structured(serde_json::Value),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Dark,
    Light,
}

impl Theme {
    pub fn toggled(self) -> Self {
        match self {
            Theme::Dark => Theme::Light,
            Theme::Light => Theme::Dark,
        }
    }
}

/// Accepts RFC 3339 timestamps as well as the naive ISO form the backend
/// emits for UTC columns (`2024-05-01T12:00:00`).
pub fn parse_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    let Some(s) = raw else {
        return Ok(None);
    };
    if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
        return Ok(Some(dt.with_timezone(&Utc)));
    }
    NaiveDateTime::parse_from_str(&s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S%.f"))
        .map(|naive| Some(naive.and_utc()))
        .map_err(serde::de::Error::custom)
}
