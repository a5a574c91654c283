//! Bearer-token authentication against registry token endpoints.

use serde::Deserialize;
use tracing::debug;

use crate::error::{ImageError, Result};

/// A parsed `WWW-Authenticate: Bearer ...` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Challenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

/// Parse a bearer challenge header into its realm/service/scope parts.
///
/// Scope values may contain commas inside their quotes
/// (`repository:org/app:pull,push`), so a comma only starts a new
/// parameter when it is followed by a `key=` shape.
pub(crate) fn parse_challenge(header: &str) -> Option<Challenge> {
    if header.len() < 7 || !header[..7].eq_ignore_ascii_case("bearer ") {
        return None;
    }

    let mut params: Vec<(String, String)> = Vec::new();
    for part in header[7..].split(',') {
        match part.split_once('=') {
            Some((key, value)) => {
                params.push((key.trim().to_string(), value.trim().trim_matches('"').to_string()));
            }
            None => {
                // Continuation of the previous quoted value.
                if let Some((_, value)) = params.last_mut() {
                    value.push(',');
                    value.push_str(part.trim_end().trim_end_matches('"'));
                }
            }
        }
    }

    let mut realm = None;
    let mut service = None;
    let mut scope = None;
    for (key, value) in params {
        match key.as_str() {
            "realm" => realm = Some(value),
            "service" => service = Some(value),
            "scope" => scope = Some(value),
            _ => {}
        }
    }
    Some(Challenge {
        realm: realm?,
        service,
        scope,
    })
}

/// Fetches bearer tokens for challenges, optionally presenting static
/// credentials to the token endpoint.
pub(crate) struct Authenticator {
    http: reqwest::Client,
    credentials: Option<(String, String)>,
}

impl Authenticator {
    /// Credentials come from `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`
    /// when both are set; otherwise token requests are anonymous.
    pub(crate) fn from_env(http: reqwest::Client) -> Authenticator {
        let username = std::env::var("REGISTRY_USERNAME").ok();
        let password = std::env::var("REGISTRY_PASSWORD").ok();
        let credentials = match (username, password) {
            (Some(u), Some(p)) => Some((u, p)),
            _ => None,
        };
        Authenticator { http, credentials }
    }

    pub(crate) async fn fetch_token(&self, challenge: &Challenge) -> Result<String> {
        let mut url = reqwest::Url::parse(&challenge.realm).map_err(|e| {
            ImageError::Auth(format!("invalid auth realm {:?}: {e}", challenge.realm))
        })?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(service) = &challenge.service {
                query.append_pair("service", service);
            }
            if let Some(scope) = &challenge.scope {
                query.append_pair("scope", scope);
            }
        }

        debug!(realm = %challenge.realm, scope = ?challenge.scope, "fetching registry token");
        let mut request = self.http.get(url);
        if let Some((username, password)) = &self.credentials {
            request = request.basic_auth(username, Some(password));
        }

        let response = request
            .send()
            .await
            .map_err(|e| ImageError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ImageError::Auth(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            token: Option<String>,
            access_token: Option<String>,
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| ImageError::Transport(e.to_string()))?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| ImageError::Auth("token endpoint returned no token".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_challenge() {
        let challenge = parse_challenge(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/nginx:pull""#,
        )
        .unwrap();
        assert_eq!(challenge.realm, "https://auth.docker.io/token");
        assert_eq!(challenge.service.as_deref(), Some("registry.docker.io"));
        assert_eq!(
            challenge.scope.as_deref(),
            Some("repository:library/nginx:pull")
        );
    }

    #[test]
    fn test_parse_scope_with_comma() {
        let challenge = parse_challenge(
            r#"Bearer realm="https://auth.example.com/token",scope="repository:org/app:pull,push""#,
        )
        .unwrap();
        assert_eq!(challenge.scope.as_deref(), Some("repository:org/app:pull,push"));
    }

    #[test]
    fn test_parse_requires_bearer_scheme() {
        assert!(parse_challenge(r#"Basic realm="registry""#).is_none());
        assert!(parse_challenge("").is_none());
    }

    #[test]
    fn test_parse_requires_realm() {
        assert!(parse_challenge(r#"Bearer service="registry.example.com""#).is_none());
    }
}
