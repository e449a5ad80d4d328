use std::time::{Duration, Instant};

use chanlink_domain::ports::BoxFuture;
use chanlink_domain::ports::provider::{ProviderError, ProviderTokens, TokenProvider};
use metrics::{counter, histogram};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

const SECRET_KEY_HEADER: &str = "secret_key";
const PROVIDER_REQUESTS_TOTAL: &str = "chanlink_provider_requests_total";
const PROVIDER_REQUEST_SECONDS: &str = "chanlink_provider_request_duration_seconds";

#[derive(Clone)]
pub struct ProviderClientConfig {
    pub token_url: String,
    pub app_id: String,
    pub secret_key: SecretString,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
enum Grant {
    AuthorizationCode,
    RefreshToken,
}

impl Grant {
    fn as_str(self) -> &'static str {
        match self {
            Grant::AuthorizationCode => "authorization_code",
            Grant::RefreshToken => "refresh_token",
        }
    }
}

/// Form-encoded client for the provider's OAuth token endpoint.
#[derive(Clone)]
pub struct HttpTokenProvider {
    http: reqwest::Client,
    token_url: String,
    app_id: String,
    secret_key: SecretString,
}

impl HttpTokenProvider {
    pub fn new(config: ProviderClientConfig) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout.max(Duration::from_millis(1)))
            .build()
            .map_err(|err| ProviderError::Transient(format!("http client init failed: {err}")))?;
        Ok(Self {
            http,
            token_url: config.token_url,
            app_id: config.app_id,
            secret_key: config.secret_key,
        })
    }

    async fn request(
        &self,
        grant: Grant,
        params: Vec<(&'static str, String)>,
    ) -> Result<ProviderTokens, ProviderError> {
        let mut form = vec![
            ("app_id", self.app_id.clone()),
            ("grant_type", grant.as_str().to_string()),
        ];
        form.extend(params);

        let started = Instant::now();
        let result = self.send(&form).await;
        let outcome = match &result {
            Ok(_) => "success",
            Err(ProviderError::Rejected { .. }) => "rejected",
            Err(ProviderError::Transient(_)) => "transient",
            Err(ProviderError::InvalidResponse(_)) => "invalid_response",
        };
        counter!(PROVIDER_REQUESTS_TOTAL, "grant" => grant.as_str(), "outcome" => outcome)
            .increment(1);
        histogram!(PROVIDER_REQUEST_SECONDS, "grant" => grant.as_str())
            .record(started.elapsed().as_secs_f64());
        if let Err(err) = &result {
            tracing::warn!(grant = grant.as_str(), error = %err, "provider token request failed");
        }
        result
    }

    async fn send(&self, form: &[(&'static str, String)]) -> Result<ProviderTokens, ProviderError> {
        let response = self
            .http
            .post(&self.token_url)
            .header(SECRET_KEY_HEADER, self.secret_key.expose_secret().as_str())
            .form(form)
            .send()
            .await
            .map_err(|err| ProviderError::Transient(err.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Transient(format!(
                "status {}: {}",
                status.as_u16(),
                message
            )));
        }

        let body = response.text().await.map_err(|err| {
            ProviderError::Transient(format!("failed to read provider response: {err}"))
        })?;
        let parsed = serde_json::from_str::<Value>(&body).ok();

        if status.is_client_error() {
            let (error, description) = parsed
                .as_ref()
                .and_then(rejection)
                .unwrap_or_else(|| (format!("http_{}", status.as_u16()), body.clone()));
            return Err(ProviderError::Rejected { error, description });
        }

        let parsed = parsed.ok_or_else(|| {
            ProviderError::InvalidResponse("provider response is not JSON".to_string())
        })?;
        if let Some((error, description)) = rejection(&parsed) {
            return Err(ProviderError::Rejected { error, description });
        }
        decode_tokens(&parsed)
    }
}

/// `{ error, error_description }`; a zero or empty `error` is not a rejection.
fn rejection(body: &Value) -> Option<(String, String)> {
    let error = match body.get("error")? {
        Value::String(code) if !code.is_empty() => code.clone(),
        Value::Number(code) if code.as_i64() != Some(0) => code.to_string(),
        _ => return None,
    };
    let description = ["error_description", "message", "error_name"]
        .iter()
        .find_map(|field| body.get(*field).and_then(Value::as_str))
        .unwrap_or_default()
        .to_string();
    Some((error, description))
}

fn decode_tokens(body: &Value) -> Result<ProviderTokens, ProviderError> {
    let field = |name: &str| -> Result<String, ProviderError> {
        body.get(name)
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ProviderError::InvalidResponse(format!("missing {name}")))
    };
    let expires_in_secs = match body.get("expires_in") {
        Some(Value::Number(value)) => value.as_u64(),
        Some(Value::String(value)) => value.trim().parse::<u64>().ok(),
        _ => None,
    }
    .ok_or_else(|| ProviderError::InvalidResponse("missing or invalid expires_in".into()))?;

    Ok(ProviderTokens {
        access_token: SecretString::new(field("access_token")?),
        refresh_token: SecretString::new(field("refresh_token")?),
        expires_in_secs,
    })
}

impl TokenProvider for HttpTokenProvider {
    fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
    ) -> BoxFuture<'_, Result<ProviderTokens, ProviderError>> {
        let params = vec![
            ("code", code.to_string()),
            ("code_verifier", code_verifier.to_string()),
        ];
        Box::pin(async move { self.request(Grant::AuthorizationCode, params).await })
    }

    fn refresh(&self, refresh_token: &str) -> BoxFuture<'_, Result<ProviderTokens, ProviderError>> {
        let params = vec![("refresh_token", refresh_token.to_string())];
        Box::pin(async move { self.request(Grant::RefreshToken, params).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn client(server: &mockito::ServerGuard) -> HttpTokenProvider {
        HttpTokenProvider::new(ProviderClientConfig {
            token_url: format!("{}/v4/oa/access_token", server.url()),
            app_id: "app-123".into(),
            secret_key: SecretString::new("s3cr3t".into()),
            timeout: Duration::from_secs(2),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn refresh_posts_form_and_decodes_string_expiry() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v4/oa/access_token")
            .match_header("secret_key", "s3cr3t")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("app_id".into(), "app-123".into()),
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "rt-1".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "access_token": "at-2",
                    "refresh_token": "rt-2",
                    "expires_in": "90000"
                })
                .to_string(),
            )
            .create_async()
            .await;

        let tokens = client(&server).refresh("rt-1").await.unwrap();

        assert_eq!(tokens.access_token.expose_secret(), "at-2");
        assert_eq!(tokens.refresh_token.expose_secret(), "rt-2");
        assert_eq!(tokens.expires_in_secs, 90_000);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn exchange_sends_code_and_verifier() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v4/oa/access_token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
                Matcher::UrlEncoded("code".into(), "auth-code".into()),
                Matcher::UrlEncoded("code_verifier".into(), "verifier-1".into()),
            ]))
            .with_status(200)
            .with_body(
                json!({"access_token": "at", "refresh_token": "rt", "expires_in": 3600})
                    .to_string(),
            )
            .create_async()
            .await;

        let tokens = client(&server)
            .exchange_code("auth-code", "verifier-1")
            .await
            .unwrap();

        assert_eq!(tokens.expires_in_secs, 3_600);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn error_body_is_a_rejection_even_with_200() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v4/oa/access_token")
            .with_status(200)
            .with_body(
                json!({"error": "invalid_grant", "error_description": "Refresh token expired"})
                    .to_string(),
            )
            .create_async()
            .await;

        let err = client(&server).refresh("rt-old").await.unwrap_err();

        assert!(matches!(
            err,
            ProviderError::Rejected { ref error, ref description }
                if error == "invalid_grant" && description == "Refresh token expired"
        ));
    }

    #[tokio::test]
    async fn client_errors_without_json_are_rejections() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v4/oa/access_token")
            .with_status(401)
            .with_body("unauthorized")
            .create_async()
            .await;

        let err = client(&server).refresh("rt").await.unwrap_err();

        assert!(matches!(err, ProviderError::Rejected { ref error, .. } if error == "http_401"));
    }

    #[tokio::test]
    async fn server_errors_and_throttling_are_transient() {
        for status in [503, 429] {
            let mut server = mockito::Server::new_async().await;
            let _mock = server
                .mock("POST", "/v4/oa/access_token")
                .with_status(status)
                .create_async()
                .await;

            let err = client(&server).refresh("rt").await.unwrap_err();

            assert!(err.is_transient(), "status {status} should be transient");
        }
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transient() {
        let provider = HttpTokenProvider::new(ProviderClientConfig {
            token_url: "http://127.0.0.1:9/token".into(),
            app_id: "app".into(),
            secret_key: SecretString::new("k".into()),
            timeout: Duration::from_millis(500),
        })
        .unwrap();

        assert!(provider.refresh("rt").await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn incomplete_success_body_is_invalid() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v4/oa/access_token")
            .with_status(200)
            .with_body(json!({"access_token": "at"}).to_string())
            .create_async()
            .await;

        let err = client(&server).refresh("rt").await.unwrap_err();

        assert!(matches!(err, ProviderError::InvalidResponse(_)));
    }

    #[test]
    fn zero_error_code_is_not_a_rejection() {
        assert!(rejection(&json!({"error": 0, "access_token": "x"})).is_none());
        assert_eq!(
            rejection(&json!({"error": -14014, "message": "Invalid refresh token"})),
            Some(("-14014".to_string(), "Invalid refresh token".to_string()))
        );
    }
}
