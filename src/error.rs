use reqwest::{Response, StatusCode};
use serde::Deserialize;
use thiserror::Error;

/// Every way a regman invocation can fail. All of them are terminal.
#[derive(Debug, Error)]
pub enum RegmanError {
    #[error("{0}")]
    Configuration(String),

    #[error("invalid reference '{input}': {reason}")]
    ReferenceParse { input: String, reason: String },

    #[error("authentication to {registry} failed: {message}")]
    Authentication { registry: String, message: String },

    #[error("{reference} not found")]
    ReferenceNotFound { reference: String },

    #[error("could not reach {registry}: {message}")]
    Transport { registry: String, message: String },

    #[error("failed to {operation} ({status}): {message}")]
    Registry {
        operation: &'static str,
        status: u16,
        message: String,
    },

    /// The digest lookup succeeded but the delete call itself did not.
    #[error("resolved {digest_reference} but the delete was not accepted: {source}")]
    DeleteFailed {
        digest_reference: String,
        #[source]
        source: Box<RegmanError>,
    },

    #[error("credential store: {0}")]
    CredentialStore(String),
}

impl RegmanError {
    pub fn transport(registry: &str, err: &reqwest::Error) -> Self {
        let mut message = err.to_string();
        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        RegmanError::Transport {
            registry: registry.to_string(),
            message,
        }
    }
}

/// What a registry request was trying to do, used to classify failures.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub registry: &'a str,
    pub operation: &'static str,
    /// Reference or repository the request addresses; a 404 on it means it
    /// does not exist. `None` for registry-wide calls like the catalog.
    pub target: Option<&'a str>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<ErrorDetail>,
}

#[derive(Deserialize)]
struct ErrorDetail {
    code: Option<String>,
    message: Option<String>,
}

fn error_message(status: StatusCode, body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        let details: Vec<String> = parsed
            .errors
            .into_iter()
            .filter_map(|e| match (e.code, e.message) {
                (Some(code), Some(message)) => Some(format!("{code}: {message}")),
                (code, message) => code.or(message),
            })
            .collect();
        if !details.is_empty() {
            return details.join("; ");
        }
    }

    let body = body.trim();
    if body.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("Unknown error")
            .to_string()
    } else {
        body.to_string()
    }
}

pub fn classify(status: StatusCode, body: &str, ctx: RequestContext<'_>) -> RegmanError {
    let message = error_message(status, body);
    match (status.as_u16(), ctx.target) {
        (401 | 403, _) => RegmanError::Authentication {
            registry: ctx.registry.to_string(),
            message,
        },
        (404, Some(target)) => RegmanError::ReferenceNotFound {
            reference: target.to_string(),
        },
        (code, _) => RegmanError::Registry {
            operation: ctx.operation,
            status: code,
            message,
        },
    }
}

/// Passes successful responses through and turns the rest into a
/// [`RegmanError`].
pub async fn check_response(
    response: Response,
    ctx: RequestContext<'_>,
) -> Result<Response, RegmanError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    log::debug!("{} failed with {}: {}", ctx.operation, status, body);
    Err(classify(status, &body, ctx))
}
