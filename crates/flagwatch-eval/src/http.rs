//! HTTPS client for the evaluation engine.
//!
//! The engine speaks a small JSON API:
//!
//! ```text
//! POST {base}/client/auth                  {"apiKey"}            → {"authToken"}
//! POST {base}/client/evaluations/{flag}    {"target", "kind"}    → {"flag", "kind", "value"}
//! ```
//!
//! The auth token is kept in memory and renewed whenever the engine answers
//! 401/403.

use std::fmt;
use std::time::Duration;

use flagwatch_protocol::{FlagQuery, FlagValue, Variation};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::{EvalError, Evaluator};

/// Connection settings for [`HttpEvaluator`].
#[derive(Clone)]
pub struct HttpEvaluatorConfig {
    /// Base URL of the engine, e.g. `https://config.example.com/api/1.0`.
    pub evaluation_url: String,
    /// Server-side API key. Never logged.
    pub api_key: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for HttpEvaluatorConfig {
    fn default() -> Self {
        Self {
            evaluation_url: String::new(),
            api_key: String::new(),
            timeout: Duration::from_secs(5),
        }
    }
}

impl fmt::Debug for HttpEvaluatorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpEvaluatorConfig")
            .field("evaluation_url", &self.evaluation_url)
            .field("api_key", &"[REDACTED]")
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Serialize)]
struct AuthRequest<'a> {
    #[serde(rename = "apiKey")]
    api_key: &'a str,
}

#[derive(Deserialize)]
struct AuthResponse {
    #[serde(rename = "authToken")]
    auth_token: String,
}

#[derive(Serialize)]
struct EvaluationTarget<'a> {
    identifier: &'a str,
    name: &'a str,
    attributes: &'a std::collections::BTreeMap<String, String>,
}

#[derive(Serialize)]
struct EvaluationRequest<'a> {
    target: EvaluationTarget<'a>,
    kind: &'static str,
}

#[derive(Deserialize)]
struct EvaluationResponse {
    value: Value,
}

#[derive(Deserialize, Default)]
struct NotFoundBody {
    #[serde(default)]
    resource: Option<String>,
}

/// [`Evaluator`] backed by the engine's HTTPS API.
pub struct HttpEvaluator {
    client: reqwest::Client,
    base: Url,
    config: HttpEvaluatorConfig,
    token: RwLock<Option<String>>,
}

impl HttpEvaluator {
    /// Builds the client. Does not contact the engine; authentication
    /// happens on the first evaluation or an explicit
    /// [`authenticate`](Self::authenticate).
    pub fn new(config: HttpEvaluatorConfig) -> Result<Self, EvalError> {
        let base = Url::parse(&config.evaluation_url)
            .map_err(|e| EvalError::InvalidUrl(format!("{}: {e}", config.evaluation_url)))?;
        if base.cannot_be_a_base() {
            return Err(EvalError::InvalidUrl(config.evaluation_url.clone()));
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(EvalError::Request)?;
        Ok(Self {
            client,
            base,
            config,
            token: RwLock::new(None),
        })
    }

    /// Exchanges the API key for an engine session token.
    pub async fn authenticate(&self) -> Result<(), EvalError> {
        let url = self.url(&["client", "auth"]);
        let response = self
            .client
            .post(url)
            .json(&AuthRequest {
                api_key: &self.config.api_key,
            })
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let message = response.text().await.unwrap_or_default();
            return Err(EvalError::Unauthorized(message));
        }
        if !status.is_success() {
            return Err(EvalError::Upstream {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let body: AuthResponse =
            response.json().await.map_err(|e| self.request_error(e))?;
        *self.token.write().await = Some(body.auth_token);
        tracing::info!(url = %self.base, "authenticated with evaluation engine");
        Ok(())
    }

    async fn token(&self) -> Result<String, EvalError> {
        if let Some(token) = self.token.read().await.clone() {
            return Ok(token);
        }
        self.authenticate().await?;
        self.token.read().await.clone().ok_or_else(|| {
            EvalError::Unauthorized("engine returned no token".into())
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request_error(&self, e: reqwest::Error) -> EvalError {
        if e.is_timeout() {
            EvalError::Timeout(self.config.timeout)
        } else {
            EvalError::Request(e)
        }
    }

    async fn send_evaluation(
        &self,
        query: &FlagQuery,
        token: &str,
    ) -> Result<reqwest::Response, EvalError> {
        let url = self.url(&["client", "evaluations", &query.flag_id]);
        let body = EvaluationRequest {
            target: EvaluationTarget {
                identifier: &query.target_id,
                name: &query.target_name,
                attributes: &query.target_attributes,
            },
            kind: query.variation_type.as_str(),
        };
        self.client
            .post(url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.request_error(e))
    }

    async fn read_value(
        &self,
        query: &FlagQuery,
        response: reqwest::Response,
    ) -> Result<FlagValue, EvalError> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            let body: NotFoundBody = response.json().await.unwrap_or_default();
            return Err(match body.resource.as_deref() {
                Some("target") => EvalError::TargetNotFound(query.target_id.clone()),
                _ => EvalError::FlagNotFound(query.flag_id.clone()),
            });
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(EvalError::Unauthorized(
                response.text().await.unwrap_or_default(),
            ));
        }
        if !status.is_success() {
            return Err(EvalError::Upstream {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let body: EvaluationResponse =
            response.json().await.map_err(|e| self.request_error(e))?;
        Ok(FlagValue {
            flag_id: query.flag_id.clone(),
            flag_value: Variation::coerce(query.variation_type, &body.value)?,
            target_id: query.target_id.clone(),
        })
    }
}

impl Evaluator for HttpEvaluator {
    async fn evaluate(&self, query: &FlagQuery) -> Result<FlagValue, EvalError> {
        let token = self.token().await?;
        let mut response = self.send_evaluation(query, &token).await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            tracing::debug!(flag_id = %query.flag_id, "engine token rejected, re-authenticating");
            self.token.write().await.take();
            let token = self.token().await?;
            response = self.send_evaluation(query, &token).await?;
        }

        let value = self.read_value(query, response).await?;
        tracing::debug!(
            flag_id = %value.flag_id,
            target_id = %value.target_id,
            flag_value = %value.flag_value,
            "evaluated feature flag"
        );
        Ok(value)
    }

    async fn reauthenticate(&self) -> Result<(), EvalError> {
        self.token.write().await.take();
        self.authenticate().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_debug_redacts_api_key() {
        let config = HttpEvaluatorConfig {
            evaluation_url: "https://engine.test".into(),
            api_key: "super-secret".into(),
            ..Default::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn test_new_rejects_invalid_url() {
        let result = HttpEvaluator::new(HttpEvaluatorConfig {
            evaluation_url: "not a url".into(),
            ..Default::default()
        });
        assert!(matches!(result, Err(EvalError::InvalidUrl(_))));
    }

    #[test]
    fn test_url_appends_segments_to_base_path() {
        let evaluator = HttpEvaluator::new(HttpEvaluatorConfig {
            evaluation_url: "https://engine.test/api/1.0/".into(),
            ..Default::default()
        })
        .unwrap();
        let url = evaluator.url(&["client", "evaluations", "dark mode"]);
        assert_eq!(
            url.as_str(),
            "https://engine.test/api/1.0/client/evaluations/dark%20mode"
        );
    }
}
