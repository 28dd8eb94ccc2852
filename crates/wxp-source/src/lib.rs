//! Weather source contracts: the live HTTP source and a fixture-backed source.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use wxp_storage::{encode_query_value, FetchError, HttpFetcher};

pub const CRATE_NAME: &str = "wxp-source";

pub const CITY_PLACEHOLDER: &str = "{city}";
pub const API_KEY_PLACEHOLDER: &str = "{API_KEY}";

/// Result of a single per-entity fetch that reached the source.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Document(JsonValue),
    /// Non-OK answer; the entity is skipped for this run.
    Rejected { status: u16, body: String },
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("fetch failed for {entity}")]
    Transport {
        entity: String,
        #[source]
        source: FetchError,
    },
    #[error("response body for {entity} is not valid JSON")]
    Decode {
        entity: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    Unavailable(String),
    #[error("invalid url template: {0}")]
    Template(String),
}

/// Anything that can answer "current weather for this entity".
///
/// `Err` means the request never produced an answer for this entity; callers treat it like a
/// rejection and keep going.
#[async_trait]
pub trait WeatherSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, entity: &str) -> Result<FetchOutcome, SourceError>;
}

/// URL template with `{city}` and `{API_KEY}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate {
    template: String,
}

impl UrlTemplate {
    pub fn parse(template: &str) -> Result<Self, SourceError> {
        let trimmed = template.trim();
        if !trimmed.starts_with("http://") && !trimmed.starts_with("https://") {
            return Err(SourceError::Template(format!(
                "{trimmed:?} must start with http:// or https://"
            )));
        }
        if !trimmed.contains(CITY_PLACEHOLDER) {
            return Err(SourceError::Template(format!(
                "{trimmed:?} has no {CITY_PLACEHOLDER} placeholder"
            )));
        }
        Ok(Self {
            template: trimmed.to_string(),
        })
    }

    pub fn render(&self, city: &str, api_key: &str) -> String {
        self.template
            .replace(CITY_PLACEHOLDER, &encode_query_value(city))
            .replace(API_KEY_PLACEHOLDER, &encode_query_value(api_key))
    }
}

#[derive(Debug)]
pub struct HttpWeatherSource {
    http: HttpFetcher,
    template: UrlTemplate,
    api_key: String,
}

impl HttpWeatherSource {
    pub fn new(http: HttpFetcher, template: UrlTemplate, api_key: impl Into<String>) -> Self {
        Self {
            http,
            template,
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl WeatherSource for HttpWeatherSource {
    fn name(&self) -> &str {
        "openweather-http"
    }

    async fn fetch(&self, entity: &str) -> Result<FetchOutcome, SourceError> {
        let url = self.template.render(entity, &self.api_key);
        let resp = self
            .http
            .fetch(entity, &url)
            .await
            .map_err(|source| SourceError::Transport {
                entity: entity.to_string(),
                source,
            })?;

        if resp.status != StatusCode::OK {
            return Ok(FetchOutcome::Rejected {
                status: resp.status.as_u16(),
                body: resp.body_text(),
            });
        }

        let document =
            serde_json::from_slice(&resp.body).map_err(|source| SourceError::Decode {
                entity: entity.to_string(),
                source,
            })?;
        debug!(entity, bytes = resp.body.len(), "observation decoded");
        Ok(FetchOutcome::Document(document))
    }
}

/// Canned answers per entity. Unknown entities are rejected with 404.
///
/// Fixture files are a JSON object keyed by entity. A value that is an object with a numeric
/// `status` other than 200 and a `body` string is a rejection; anything else is the document.
#[derive(Debug, Default, Clone)]
pub struct FixtureWeatherSource {
    answers: HashMap<String, FixtureAnswer>,
}

#[derive(Debug, Clone)]
enum FixtureAnswer {
    Outcome(FetchOutcome),
    Unavailable(String),
}

impl FixtureWeatherSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(mut self, entity: &str, document: JsonValue) -> Self {
        self.answers.insert(
            entity.to_string(),
            FixtureAnswer::Outcome(FetchOutcome::Document(document)),
        );
        self
    }

    pub fn with_rejection(mut self, entity: &str, status: u16, body: &str) -> Self {
        self.answers.insert(
            entity.to_string(),
            FixtureAnswer::Outcome(FetchOutcome::Rejected {
                status,
                body: body.to_string(),
            }),
        );
        self
    }

    /// Simulates a request that never got an answer (connection refused, timeout).
    pub fn with_unavailable(mut self, entity: &str, reason: &str) -> Self {
        self.answers
            .insert(entity.to_string(), FixtureAnswer::Unavailable(reason.to_string()));
        self
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let value: JsonValue =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        Self::from_json(value).with_context(|| format!("loading fixtures from {}", path.display()))
    }

    pub fn from_json(value: JsonValue) -> Result<Self> {
        let JsonValue::Object(map) = value else {
            anyhow::bail!("fixture root must be a JSON object keyed by entity");
        };
        let mut source = Self::new();
        for (entity, answer) in map {
            let status = answer.get("status").and_then(JsonValue::as_u64);
            let body = answer.get("body").and_then(JsonValue::as_str);
            source = match (status, body) {
                (Some(status), Some(body)) if status != 200 => {
                    let status = u16::try_from(status)
                        .with_context(|| format!("status {status} for {entity} is out of range"))?;
                    source.with_rejection(&entity, status, body)
                }
                _ => source.with_document(&entity, answer),
            };
        }
        Ok(source)
    }
}

#[async_trait]
impl WeatherSource for FixtureWeatherSource {
    fn name(&self) -> &str {
        "fixture"
    }

    async fn fetch(&self, entity: &str) -> Result<FetchOutcome, SourceError> {
        match self.answers.get(entity) {
            Some(FixtureAnswer::Outcome(outcome)) => Ok(outcome.clone()),
            Some(FixtureAnswer::Unavailable(reason)) => Err(SourceError::Unavailable(format!(
                "{entity}: {reason}"
            ))),
            None => Ok(FetchOutcome::Rejected {
                status: 404,
                body: format!("{{\"cod\":\"404\",\"message\":\"city not found: {entity}\"}}"),
            }),
        }
    }
}
