use std::sync::{Arc, Mutex};
use std::time::Duration;

use chanlink_domain::channel::InMemoryChannelRepository;
use chanlink_domain::clock::MonotonicClock;
use chanlink_domain::coordination::InMemoryCoordinationStore;
use chanlink_domain::oauth::{AuthorizationConfig, AuthorizationService, PkceChallenge};
use chanlink_domain::ports::BoxFuture;
use chanlink_domain::ports::channel::ChannelRepository;
use chanlink_domain::ports::provider::{ProviderError, ProviderTokens, TokenProvider};
use chanlink_domain::token::TokenError;
use secrecy::{ExposeSecret, SecretString};
use url::Url;

const ANCHOR_MS: i64 = 1_750_000_000_000;

#[derive(Default)]
struct ExchangeProvider {
    verifiers: Mutex<Vec<String>>,
    reject: bool,
}

impl TokenProvider for ExchangeProvider {
    fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
    ) -> BoxFuture<'_, Result<ProviderTokens, ProviderError>> {
        let code = code.to_string();
        let code_verifier = code_verifier.to_string();
        Box::pin(async move {
            self.verifiers.lock().unwrap().push(code_verifier);
            if self.reject {
                return Err(ProviderError::Rejected {
                    error: "invalid_code".into(),
                    description: "authorization code expired".into(),
                });
            }
            Ok(ProviderTokens {
                access_token: SecretString::new(format!("at-{code}")),
                refresh_token: SecretString::new(format!("rt-{code}")),
                expires_in_secs: 90_000,
            })
        })
    }

    fn refresh(&self, _refresh_token: &str) -> BoxFuture<'_, Result<ProviderTokens, ProviderError>> {
        Box::pin(async move { Err(ProviderError::Transient("not used".into())) })
    }
}

fn service(
    provider: Arc<ExchangeProvider>,
) -> (AuthorizationService, InMemoryChannelRepository) {
    let clock = Arc::new(MonotonicClock::starting_at(ANCHOR_MS));
    let channels = InMemoryChannelRepository::with_clock(clock.clone());
    let service = AuthorizationService::new(
        Arc::new(InMemoryCoordinationStore::new()),
        provider,
        Arc::new(channels.clone()),
        clock,
        AuthorizationConfig {
            app_id: "app-123".into(),
            authorize_url: "https://oauth.example.test/v4/oa/permission".into(),
            redirect_uri: "https://chat.example.test/oauth/callback".into(),
            pkce_ttl: Duration::from_secs(600),
            expiry_safety_margin: Duration::from_secs(300),
        },
    );
    (service, channels)
}

fn query_param(url: &str, name: &str) -> Option<String> {
    Url::parse(url)
        .unwrap()
        .query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

#[tokio::test(start_paused = true)]
async fn handshake_connects_channel_with_matching_verifier() {
    let provider = Arc::new(ExchangeProvider::default());
    let (service, channels) = service(provider.clone());

    let request = service.begin_authorization("grp-1").await.unwrap();
    assert_eq!(query_param(&request.url, "app_id").as_deref(), Some("app-123"));
    assert_eq!(
        query_param(&request.url, "state").as_deref(),
        Some(request.state.as_str())
    );
    let challenge = query_param(&request.url, "code_challenge").unwrap();

    let channel = service
        .complete_authorization(&request.state, "code-1", "oa-77")
        .await
        .unwrap();

    let verifier = provider.verifiers.lock().unwrap()[0].clone();
    assert_eq!(PkceChallenge::from_verifier(verifier).challenge, challenge);
    assert_eq!(channel.group_id, "grp-1");
    assert_eq!(channel.provider_id, "oa-77");
    assert_eq!(
        channel.expire_at_ms,
        Some(ANCHOR_MS + (90_000 - 300) * 1_000)
    );
    let stored = channels.get(&channel.id).await.unwrap().unwrap();
    assert_eq!(
        stored.access_token.as_ref().map(|t| t.expose_secret().as_str()),
        Some("at-code-1")
    );
}

#[tokio::test(start_paused = true)]
async fn state_cannot_be_replayed() {
    let (service, _) = service(Arc::new(ExchangeProvider::default()));
    let request = service.begin_authorization("grp-1").await.unwrap();

    service
        .complete_authorization(&request.state, "code-1", "oa-77")
        .await
        .unwrap();
    let replay = service
        .complete_authorization(&request.state, "code-1", "oa-77")
        .await;

    assert!(matches!(replay, Err(TokenError::InvalidState)));
}

#[tokio::test(start_paused = true)]
async fn expired_state_is_rejected() {
    let (service, _) = service(Arc::new(ExchangeProvider::default()));
    let request = service.begin_authorization("grp-1").await.unwrap();

    tokio::time::advance(Duration::from_secs(601)).await;

    let result = service
        .complete_authorization(&request.state, "code-1", "oa-77")
        .await;
    assert!(matches!(result, Err(TokenError::InvalidState)));
}

#[tokio::test(start_paused = true)]
async fn rejected_code_does_not_create_a_channel() {
    let provider = Arc::new(ExchangeProvider {
        reject: true,
        ..ExchangeProvider::default()
    });
    let (service, channels) = service(provider);
    let request = service.begin_authorization("grp-1").await.unwrap();

    let result = service
        .complete_authorization(&request.state, "bad-code", "oa-77")
        .await;

    assert!(matches!(result, Err(TokenError::Unrecoverable(_))));
    assert!(channels.get("anything").await.unwrap().is_none());
}

#[tokio::test]
async fn blank_group_is_rejected() {
    let (service, _) = service(Arc::new(ExchangeProvider::default()));
    assert!(matches!(
        service.begin_authorization("  ").await,
        Err(TokenError::Validation(_))
    ));
}
