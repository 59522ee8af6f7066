// Authorization request construction and response parsing
use super::pkce::{PkceChallenge, CHALLENGE_METHOD};
use crate::config::ClientConfig;
use crate::error::{AuthError, Result};
use crate::models::OIDC_DEFAULT_SCOPES;
use url::Url;
use uuid::Uuid;

/// Parameters the caller is never allowed to set through extras
const PROTECTED_PARAMETERS: [&str; 9] = [
    "client_id",
    "redirect_uri",
    "response_type",
    "response_mode",
    "scope",
    "state",
    "nonce",
    "code_challenge",
    "code_challenge_method",
];

/// A ready-to-navigate authorization URL plus the values needed to validate its response
#[derive(Debug, Clone)]
pub struct AuthorizationUrl {
    pub url: Url,
    pub state: String,
    pub nonce: String,
    pub scopes: Vec<String>,
}

pub struct AuthorizationRequestBuilder;

impl AuthorizationRequestBuilder {
    /// Build the `/authorize` URL for a code + PKCE request with fresh state and nonce
    pub fn build(
        config: &ClientConfig,
        pkce: &PkceChallenge,
        requested_scopes: &[String],
        extra_params: &[(String, String)],
    ) -> Result<AuthorizationUrl> {
        config.validate()?;

        let scopes = merge_scopes(requested_scopes);
        let state = Uuid::new_v4().simple().to_string();
        let nonce = Uuid::new_v4().simple().to_string();

        let mut params: Vec<(&str, &str)> = vec![
            ("client_id", config.client_id.as_str()),
            ("redirect_uri", config.redirect_uri.as_str()),
            ("response_type", "code"),
            ("response_mode", "query"),
            ("code_challenge", pkce.challenge.as_str()),
            ("code_challenge_method", CHALLENGE_METHOD),
            ("state", state.as_str()),
            ("nonce", nonce.as_str()),
        ];
        let scope = scopes.join(" ");
        params.push(("scope", scope.as_str()));

        for (key, value) in extra_params {
            if PROTECTED_PARAMETERS.contains(&key.as_str()) {
                tracing::warn!("Ignoring extra parameter '{}': it is set by the protocol", key);
                continue;
            }
            if params.iter().any(|(existing, _)| *existing == key.as_str()) {
                tracing::warn!("Ignoring duplicate extra parameter '{}'", key);
                continue;
            }
            params.push((key.as_str(), value.as_str()));
        }

        let url = append_query(&config.authorize_endpoint()?, &params);
        tracing::debug!("Built authorization request for scopes: {}", scope);

        Ok(AuthorizationUrl {
            url,
            state,
            nonce,
            scopes,
        })
    }
}

/// Requested scopes followed by the OIDC defaults, de-duplicated case-insensitively
pub(crate) fn merge_scopes(requested: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::new();
    let candidates = requested
        .iter()
        .map(String::as_str)
        .chain(OIDC_DEFAULT_SCOPES.iter().copied());

    for scope in candidates {
        let scope = scope.trim();
        if scope.is_empty() || merged.iter().any(|s| s.eq_ignore_ascii_case(scope)) {
            continue;
        }
        merged.push(scope.to_string());
    }
    merged
}

/// `endpoint` with `params` appended to any query it already carries; a fragment is kept
fn append_query(endpoint: &Url, params: &[(&str, &str)]) -> Url {
    let mut url = endpoint.clone();
    url.query_pairs_mut().extend_pairs(params);
    url
}

/// Parameters returned by the provider on the redirect URI
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthorizationResponse {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl AuthorizationResponse {
    /// The authorization code, or the provider error it carried
    pub fn into_code(self) -> Result<String> {
        if let Some(error) = self.error {
            return Err(AuthError::Provider {
                error,
                description: self.error_description,
            });
        }
        self.code.ok_or_else(|| AuthError::Provider {
            error: "invalid_response".to_string(),
            description: Some("Authorization response has neither code nor error".to_string()),
        })
    }
}

/// Read an authorization response from the query string, falling back to the fragment.
/// `None` when the URL carries no `code` or `error`.
pub fn parse_authorization_response(url: &Url) -> Option<AuthorizationResponse> {
    let from_query = collect_response(url.query_pairs());
    if from_query.is_some() {
        return from_query;
    }

    url.fragment()
        .and_then(|fragment| collect_response(url::form_urlencoded::parse(fragment.as_bytes())))
}

fn collect_response<'a>(
    pairs: impl Iterator<Item = (std::borrow::Cow<'a, str>, std::borrow::Cow<'a, str>)>,
) -> Option<AuthorizationResponse> {
    let mut response = AuthorizationResponse::default();
    for (key, value) in pairs {
        let value = value.into_owned();
        match key.as_ref() {
            "code" => response.code = Some(value),
            "state" => response.state = Some(value),
            "error" => response.error = Some(value),
            "error_description" => response.error_description = Some(value),
            _ => {}
        }
    }

    if response.code.is_none() && response.error.is_none() {
        return None;
    }
    Some(response)
}

/// Whether `candidate` is a landing on the configured redirect URI (origin and path)
pub fn is_redirect_landing(candidate: &Url, redirect_uri: &Url) -> bool {
    candidate.scheme() == redirect_uri.scheme()
        && candidate.host_str() == redirect_uri.host_str()
        && candidate.port_or_known_default() == redirect_uri.port_or_known_default()
        && candidate.path().trim_end_matches('/') == redirect_uri.path().trim_end_matches('/')
}

/// End-session URL that signs the user out at the provider
pub fn build_logout_url(config: &ClientConfig, id_token_hint: Option<&str>) -> Result<Url> {
    let post_logout = config.post_logout_landing().to_string();

    let mut params = vec![
        ("client_id", config.client_id.as_str()),
        ("post_logout_redirect_uri", post_logout.as_str()),
    ];
    if let Some(hint) = id_token_hint {
        params.push(("id_token_hint", hint));
    }
    Ok(append_query(&config.end_session_endpoint()?, &params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config() -> ClientConfig {
        ClientConfig::new(
            "client-x",
            "https://login.example.com/tenant-y",
            "http://localhost:4200",
        )
        .unwrap()
    }

    fn query_counts(url: &Url) -> HashMap<String, Vec<String>> {
        let mut counts: HashMap<String, Vec<String>> = HashMap::new();
        for (k, v) in url.query_pairs() {
            counts.entry(k.into_owned()).or_default().push(v.into_owned());
        }
        counts
    }

    #[test]
    fn test_build_contains_protocol_parameters_once() {
        let pkce = PkceChallenge::generate();
        let request = AuthorizationRequestBuilder::build(
            &config(),
            &pkce,
            &["User.Read".to_string()],
            &[],
        )
        .unwrap();

        assert!(request
            .url
            .as_str()
            .starts_with("https://login.example.com/tenant-y/authorize?"));
        let params = query_counts(&request.url);
        for key in ["code_challenge", "state", "nonce", "client_id", "response_type"] {
            assert_eq!(params[key].len(), 1, "{} should appear once", key);
        }
        assert_eq!(params["code_challenge"][0], pkce.challenge);
        assert_eq!(params["code_challenge_method"][0], "S256");
        assert_eq!(params["response_type"][0], "code");
        assert_eq!(params["state"][0], request.state);
        assert_eq!(params["nonce"][0], request.nonce);
        assert_eq!(params["scope"][0], "User.Read openid profile offline_access");
        assert_eq!(params["redirect_uri"][0], "http://localhost:4200/");
    }

    #[test]
    fn test_build_generates_unique_state_and_nonce() {
        let config = config();
        let a = AuthorizationRequestBuilder::build(&config, &PkceChallenge::generate(), &[], &[])
            .unwrap();
        let b = AuthorizationRequestBuilder::build(&config, &PkceChallenge::generate(), &[], &[])
            .unwrap();
        assert_ne!(a.state, b.state);
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.state, a.nonce);
        assert_ne!(
            query_counts(&a.url)["code_challenge"],
            query_counts(&b.url)["code_challenge"]
        );
    }

    #[test]
    fn test_extras_cannot_override_protocol_fields() {
        let extras = vec![
            ("client_id".to_string(), "evil".to_string()),
            ("code_challenge".to_string(), "evil".to_string()),
            ("redirect_uri".to_string(), "https://evil.example.com".to_string()),
            ("prompt".to_string(), "login".to_string()),
            ("prompt".to_string(), "none".to_string()),
        ];
        let request =
            AuthorizationRequestBuilder::build(&config(), &PkceChallenge::generate(), &[], &extras)
                .unwrap();
        let params = query_counts(&request.url);
        assert_eq!(params["client_id"], vec!["client-x".to_string()]);
        assert_eq!(params["code_challenge"].len(), 1);
        assert_ne!(params["code_challenge"][0], "evil");
        assert_eq!(params["redirect_uri"], vec!["http://localhost:4200/".to_string()]);
        assert_eq!(params["prompt"], vec!["login".to_string()]);
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut bad = config();
        bad.client_id = String::new();
        let result = AuthorizationRequestBuilder::build(&bad, &PkceChallenge::generate(), &[], &[]);
        assert!(matches!(result, Err(AuthError::Configuration(_))));
    }

    #[test]
    fn test_build_keeps_existing_endpoint_query() {
        let mut config = config();
        config.authorize_endpoint =
            Some(Url::parse("https://login.example.com/authorize?p=b2c_signin").unwrap());
        let request =
            AuthorizationRequestBuilder::build(&config, &PkceChallenge::generate(), &[], &[])
                .unwrap();
        let params = query_counts(&request.url);
        assert_eq!(params["p"], vec!["b2c_signin".to_string()]);
        assert_eq!(params["state"].len(), 1);
    }

    #[test]
    fn test_endpoint_fragment_stays_after_query() {
        let mut config = config();
        config.end_session_endpoint =
            Some(Url::parse("https://login.example.com/logout?x=1#done").unwrap());
        let url = build_logout_url(&config, Some("a b&c")).unwrap();

        assert_eq!(url.fragment(), Some("done"));
        let params = query_counts(&url);
        assert_eq!(params["x"], vec!["1".to_string()]);
        assert_eq!(params["id_token_hint"], vec!["a b&c".to_string()]);
        assert_eq!(params["client_id"], vec!["client-x".to_string()]);
    }

    #[test]
    fn test_merge_scopes_deduplicates() {
        let merged = merge_scopes(&[
            "OpenID".to_string(),
            "api.read".to_string(),
            "API.READ".to_string(),
        ]);
        assert_eq!(merged, vec!["OpenID", "api.read", "profile", "offline_access"]);
    }

    #[test]
    fn test_parse_response_from_query_and_fragment() {
        let url = Url::parse("http://localhost:4200/?code=abc&state=xyz").unwrap();
        let response = parse_authorization_response(&url).unwrap();
        assert_eq!(response.code.as_deref(), Some("abc"));
        assert_eq!(response.state.as_deref(), Some("xyz"));

        let url = Url::parse("http://localhost:4200/#code=def&state=uvw").unwrap();
        let response = parse_authorization_response(&url).unwrap();
        assert_eq!(response.code.as_deref(), Some("def"));

        let url = Url::parse("http://localhost:4200/home?tab=1").unwrap();
        assert!(parse_authorization_response(&url).is_none());
    }

    #[test]
    fn test_error_response_becomes_provider_error() {
        let url = Url::parse(
            "http://localhost:4200/?error=access_denied&error_description=User%20declined&state=s",
        )
        .unwrap();
        let response = parse_authorization_response(&url).unwrap();
        match response.into_code() {
            Err(AuthError::Provider { error, description }) => {
                assert_eq!(error, "access_denied");
                assert_eq!(description.as_deref(), Some("User declined"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_is_redirect_landing() {
        let redirect = Url::parse("http://localhost:4200/callback").unwrap();
        assert!(is_redirect_landing(
            &Url::parse("http://localhost:4200/callback/?code=1").unwrap(),
            &redirect
        ));
        assert!(!is_redirect_landing(
            &Url::parse("http://localhost:4201/callback?code=1").unwrap(),
            &redirect
        ));
        assert!(!is_redirect_landing(
            &Url::parse("https://login.example.com/authorize").unwrap(),
            &redirect
        ));
    }

    #[test]
    fn test_logout_url() {
        let url = build_logout_url(&config(), Some("idt")).unwrap();
        let params = query_counts(&url);
        assert!(url.as_str().starts_with("https://login.example.com/tenant-y/logout?"));
        assert_eq!(params["post_logout_redirect_uri"][0], "http://localhost:4200/");
        assert_eq!(params["id_token_hint"][0], "idt");
    }
}
