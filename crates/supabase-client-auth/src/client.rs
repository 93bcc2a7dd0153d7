use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use serde_json::{json, Value as JsonValue};
use supabase_client_core::platform::{self, SpawnHandle};
use supabase_client_core::{AccessTokenProvider, SupabaseConfig, CLIENT_INFO};
use tokio::sync::OnceCell;
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::{AuthError, AuthErrorCode, GoTrueErrorResponse};
use crate::events::{AuthEventEmitter, AuthStateChanges, AuthSubscription};
use crate::jwt;
use crate::params::{
    OAuthOptions, OtpOptions, SignInWithIdTokenParams, SignUpOptions, UpdateUserParams,
    VerifyOtpParams,
};
use crate::pkce::PkcePair;
use crate::session::{SessionManager, SessionRefresher, DEFAULT_EXPIRY_MARGIN};
use crate::storage::{AuthLocalStorage, InMemoryStorage, SessionStorage, STORAGE_KEY};
use crate::types::*;

const API_VERSION_HEADER: &str = "X-Supabase-Api-Version";
const API_VERSION: &str = "2024-01-01";

// ─── Configuration ────────────────────────────────────────────

/// Configuration for [`AuthClient`].
#[derive(Clone)]
pub struct AuthConfig {
    /// Project URL; the auth API lives under `/auth/v1`.
    pub url: String,
    pub api_key: String,
    pub headers: HashMap<String, String>,
    pub flow_type: AuthFlowType,
    pub storage: Arc<dyn AuthLocalStorage>,
    pub storage_key: String,
    /// How long before expiry a cached session is considered stale.
    pub expiry_margin: Duration,
    /// Tick of the background refresher started by
    /// [`AuthClient::start_auto_refresh`].
    pub auto_refresh_interval: Duration,
}

impl AuthConfig {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            headers: HashMap::new(),
            flow_type: AuthFlowType::default(),
            storage: Arc::new(InMemoryStorage::new()),
            storage_key: STORAGE_KEY.to_string(),
            expiry_margin: DEFAULT_EXPIRY_MARGIN,
            auto_refresh_interval: Duration::from_secs(10),
        }
    }

    /// Start from a project config, inheriting its global headers.
    pub fn from_supabase(config: &SupabaseConfig) -> Self {
        let mut auth = Self::new(&config.supabase_url, &config.supabase_key);
        auth.headers = config.headers.clone();
        auth
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn flow_type(mut self, flow_type: AuthFlowType) -> Self {
        self.flow_type = flow_type;
        self
    }

    pub fn storage(mut self, storage: Arc<dyn AuthLocalStorage>) -> Self {
        self.storage = storage;
        self
    }

    pub fn storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }

    pub fn expiry_margin(mut self, margin: Duration) -> Self {
        self.expiry_margin = margin;
        self
    }

    pub fn auto_refresh_interval(mut self, interval: Duration) -> Self {
        self.auto_refresh_interval = interval;
        self
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("url", &self.url)
            .field("flow_type", &self.flow_type)
            .field("storage_key", &self.storage_key)
            .field("expiry_margin", &self.expiry_margin)
            .finish_non_exhaustive()
    }
}

// ─── HTTP layer ───────────────────────────────────────────────

/// Raw GoTrue endpoints. Also the [`SessionRefresher`] installed into the
/// session manager.
#[derive(Debug, Clone)]
pub(crate) struct AuthApi {
    http: reqwest::Client,
    base_url: Url,
}

impl AuthApi {
    pub(crate) fn new(config: &AuthConfig) -> Result<Self, AuthError> {
        let base = config.url.trim_end_matches('/');
        let base_url = Url::parse(&format!("{}/auth/v1", base))?;

        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            "apikey",
            HeaderValue::from_str(&config.api_key)
                .map_err(|e| AuthError::InvalidConfig(format!("Invalid API key header: {}", e)))?,
        );
        default_headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        default_headers.insert("X-Client-Info", HeaderValue::from_static(CLIENT_INFO));
        default_headers.insert(API_VERSION_HEADER, HeaderValue::from_static(API_VERSION));
        for (key, value) in &config.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| AuthError::InvalidConfig(format!("Invalid header name {}: {}", key, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| AuthError::InvalidConfig(format!("Invalid header value for {}: {}", key, e)))?;
            default_headers.insert(name, value);
        }

        let http = reqwest::Client::builder()
            .default_headers(default_headers)
            .build()?;

        Ok(Self { http, base_url })
    }

    pub(crate) fn url(&self, path: &str) -> Url {
        let mut url = self.base_url.clone();
        let current = url.path().trim_end_matches('/').to_string();
        // path may contain query string (e.g. "/token?grant_type=password")
        if let Some(query_start) = path.find('?') {
            url.set_path(&format!("{}{}", current, &path[..query_start]));
            url.set_query(Some(&path[query_start + 1..]));
        } else {
            url.set_path(&format!("{}{}", current, path));
        }
        url
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, AuthError> {
        let resp = request.send().await?;
        let status = resp.status().as_u16();
        if status >= 400 {
            return Err(parse_error(status, resp).await);
        }
        Ok(resp)
    }

    async fn post_session(&self, url: Url, body: &JsonValue) -> Result<Session, AuthError> {
        let resp = self.send(self.http.post(url).json(body)).await?;
        let session: Session = resp.json().await?;
        Ok(session.with_expiry_filled())
    }

    async fn post_auth_response(&self, url: Url, body: &JsonValue) -> Result<AuthResponse, AuthError> {
        let resp = self.send(self.http.post(url).json(body)).await?;
        let value: JsonValue = resp.json().await?;
        let mut response = AuthResponse::from_value(value)?;
        response.session = response.session.map(Session::with_expiry_filled);
        Ok(response)
    }

    async fn post_empty(&self, url: Url, body: &JsonValue) -> Result<(), AuthError> {
        self.send(self.http.post(url).json(body)).await?;
        Ok(())
    }

    pub(crate) async fn get_user(&self, access_token: &str) -> Result<User, AuthError> {
        let resp = self
            .send(self.http.get(self.url("/user")).bearer_auth(access_token))
            .await?;
        Ok(resp.json().await?)
    }

    async fn update_user(&self, access_token: &str, params: &UpdateUserParams) -> Result<User, AuthError> {
        let resp = self
            .send(
                self.http
                    .put(self.url("/user"))
                    .bearer_auth(access_token)
                    .json(params),
            )
            .await?;
        Ok(resp.json().await?)
    }

    async fn logout(&self, access_token: &str, scope: SignOutScope) -> Result<(), AuthError> {
        let url = self.url(&format!("/logout?scope={}", scope));
        self.send(self.http.post(url).bearer_auth(access_token))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SessionRefresher for AuthApi {
    async fn refresh_session(&self, refresh_token: &str) -> Result<Session, AuthError> {
        trace!("POST /token?grant_type=refresh_token");
        let body = json!({ "refresh_token": refresh_token });
        self.post_session(self.url("/token?grant_type=refresh_token"), &body)
            .await
    }
}

async fn parse_error(status: u16, resp: reqwest::Response) -> AuthError {
    let body: GoTrueErrorResponse = match resp.json().await {
        Ok(body) => body,
        Err(_) => {
            return AuthError::Api {
                status,
                message: format!("HTTP {}", status),
                error_code: None,
            }
        }
    };
    let error_code = body.code();
    if error_code == Some(AuthErrorCode::SessionNotFound) {
        return AuthError::SessionMissing;
    }
    AuthError::Api {
        status,
        message: body.error_message(),
        error_code,
    }
}

// ─── Client ───────────────────────────────────────────────────

/// Supabase Auth client.
///
/// Cheap to clone; clones share the session, listeners and storage.
///
/// # Example
/// ```ignore
/// use supabase_client_auth::{AuthClient, AuthConfig};
///
/// let auth = AuthClient::new(AuthConfig::new("https://your-project.supabase.co", "anon-key"))?;
/// auth.initialize().await;
/// let session = auth.sign_in_with_password_email("user@example.com", "password").await?;
/// ```
#[derive(Clone)]
pub struct AuthClient {
    inner: Arc<AuthInner>,
}

struct AuthInner {
    api: AuthApi,
    sessions: SessionManager,
    emitter: AuthEventEmitter,
    storage: SessionStorage,
    flow_type: AuthFlowType,
    auto_refresh_interval: Duration,
    initialized: OnceCell<()>,
    auto_refresh: Mutex<Option<SpawnHandle>>,
}

impl AuthClient {
    pub fn new(config: AuthConfig) -> Result<Self, AuthError> {
        let api = AuthApi::new(&config)?;
        let storage = SessionStorage::new(config.storage.clone(), config.storage_key.clone());
        let emitter = AuthEventEmitter::new();
        let sessions = SessionManager::new(storage.clone(), emitter.clone(), config.expiry_margin);
        sessions.set_session_refresher(Arc::new(api.clone()));

        Ok(Self {
            inner: Arc::new(AuthInner {
                api,
                sessions,
                emitter,
                storage,
                flow_type: config.flow_type,
                auto_refresh_interval: config.auto_refresh_interval,
                initialized: OnceCell::new(),
                auto_refresh: Mutex::new(None),
            }),
        })
    }

    /// Get the base URL for the auth API.
    pub fn base_url(&self) -> &Url {
        &self.inner.api.base_url
    }

    pub fn session_manager(&self) -> &SessionManager {
        &self.inner.sessions
    }

    /// Load the persisted session (refreshing it if stale) and publish
    /// `initialSession`. Runs once; later calls wait for the first.
    pub async fn initialize(&self) {
        self.inner
            .initialized
            .get_or_init(|| async {
                self.inner.emitter.begin_initialization();
                let session = match self.inner.sessions.session().await {
                    Ok(session) => Some(session),
                    Err(e) => {
                        debug!(error = %e, "No usable session at startup");
                        None
                    }
                };
                self.inner
                    .sessions
                    .emit(AuthChangeEvent::InitialSession, session)
                    .await;
            })
            .await;
    }

    // ─── Listeners ─────────────────────────────────────────────

    /// Register a callback for auth state changes.
    ///
    /// The first call delivers the current state (`initialSession`,
    /// `signedIn` or `signedOut`) once it is known.
    pub fn on_auth_state_change<F>(&self, callback: F) -> AuthSubscription
    where
        F: Fn(AuthChangeEvent, Option<&Session>) + Send + Sync + 'static,
    {
        self.inner.emitter.on_auth_state_change(callback)
    }

    /// Auth state changes as a stream, starting with a replay of the
    /// current state.
    pub fn auth_state_changes(&self) -> AuthStateChanges {
        self.inner.emitter.auth_state_changes()
    }

    // ─── Session ───────────────────────────────────────────────

    /// A valid session, refreshed if it is about to expire.
    pub async fn session(&self) -> Result<Session, AuthError> {
        self.inner.sessions.session().await
    }

    /// Force a refresh of the current session.
    pub async fn refresh_session(&self) -> Result<Session, AuthError> {
        self.inner.sessions.refresh().await
    }

    /// Adopt an externally obtained token pair.
    ///
    /// Refreshes when the access token is already expired. Emits
    /// `tokenRefreshed`.
    pub async fn set_session(&self, access_token: &str, refresh_token: &str) -> Result<Session, AuthError> {
        let exp = jwt::decode_claims(access_token)?
            .exp
            .ok_or_else(|| AuthError::InvalidToken("missing exp claim".into()))?;
        let now = Utc::now().timestamp();
        if exp <= now {
            debug!("Access token already expired, refreshing");
            return self.inner.sessions.refresh_with(refresh_token).await;
        }

        let user = self.inner.api.get_user(access_token).await?;
        let session = Session {
            access_token: access_token.to_string(),
            refresh_token: refresh_token.to_string(),
            expires_in: exp - now,
            expires_at: Some(exp),
            token_type: "bearer".into(),
            user,
            provider_token: None,
            provider_refresh_token: None,
        };
        self.inner
            .sessions
            .update_with_event(session.clone(), AuthChangeEvent::TokenRefreshed)
            .await?;
        Ok(session)
    }

    // ─── Sign Up ───────────────────────────────────────────────

    /// Sign up a new user with email and password.
    ///
    /// Returns a session only when email confirmation is disabled.
    pub async fn sign_up_with_email(
        &self,
        email: &str,
        password: &str,
        options: SignUpOptions,
    ) -> Result<AuthResponse, AuthError> {
        let mut body = json!({ "email": email, "password": password });
        self.apply_sign_up_options(&mut body, &options);
        self.attach_code_challenge(&mut body)?;

        let mut url = self.inner.api.url("/signup");
        if let Some(redirect) = &options.email_redirect_to {
            url.query_pairs_mut().append_pair("redirect_to", redirect);
        }
        self.sign_up(url, body).await
    }

    /// Sign up a new user with phone and password.
    pub async fn sign_up_with_phone(
        &self,
        phone: &str,
        password: &str,
        options: SignUpOptions,
    ) -> Result<AuthResponse, AuthError> {
        let mut body = json!({ "phone": phone, "password": password });
        self.apply_sign_up_options(&mut body, &options);
        if let Some(channel) = options.channel {
            body["channel"] = json!(channel);
        }
        let url = self.inner.api.url("/signup");
        self.sign_up(url, body).await
    }

    /// Create an anonymous user and sign in as it.
    pub async fn sign_in_anonymously(&self, data: Option<JsonValue>) -> Result<Session, AuthError> {
        let mut body = json!({});
        if let Some(data) = data {
            body["data"] = data;
        }
        let response = self.sign_up(self.inner.api.url("/signup"), body).await?;
        response.session.ok_or(AuthError::SessionMissing)
    }

    async fn sign_up(&self, url: Url, body: JsonValue) -> Result<AuthResponse, AuthError> {
        self.inner.sessions.remove().await?;
        let response = self.inner.api.post_auth_response(url, &body).await?;
        if let Some(session) = &response.session {
            self.commit_sign_in(session.clone()).await?;
        }
        Ok(response)
    }

    fn apply_sign_up_options(&self, body: &mut JsonValue, options: &SignUpOptions) {
        if let Some(data) = &options.data {
            body["data"] = data.clone();
        }
        if let Some(token) = &options.captcha_token {
            body["gotrue_meta_security"] = json!({ "captcha_token": token });
        }
    }

    // ─── Sign In ───────────────────────────────────────────────

    /// Sign in with email and password.
    pub async fn sign_in_with_password_email(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let body = json!({ "email": email, "password": password });
        self.sign_in("/token?grant_type=password", body).await
    }

    /// Sign in with phone and password.
    pub async fn sign_in_with_password_phone(&self, phone: &str, password: &str) -> Result<Session, AuthError> {
        let body = json!({ "phone": phone, "password": password });
        self.sign_in("/token?grant_type=password", body).await
    }

    /// Sign in with an ID token issued by an external OIDC provider.
    pub async fn sign_in_with_id_token(&self, params: SignInWithIdTokenParams) -> Result<Session, AuthError> {
        let body = serde_json::to_value(&params)?;
        self.sign_in("/token?grant_type=id_token", body).await
    }

    async fn sign_in(&self, path: &str, body: JsonValue) -> Result<Session, AuthError> {
        self.inner.sessions.remove().await?;
        let session = self.inner.api.post_session(self.inner.api.url(path), &body).await?;
        self.commit_sign_in(session).await
    }

    async fn commit_sign_in(&self, session: Session) -> Result<Session, AuthError> {
        self.inner
            .sessions
            .update_with_event(session.clone(), AuthChangeEvent::SignedIn)
            .await?;
        Ok(session)
    }

    /// Send a magic link or OTP to an email address.
    pub async fn sign_in_with_otp_email(&self, email: &str, options: OtpOptions) -> Result<(), AuthError> {
        self.inner.sessions.remove().await?;
        let mut body = json!({ "email": email, "create_user": options.should_create_user });
        if let Some(data) = &options.data {
            body["data"] = data.clone();
        }
        if let Some(token) = &options.captcha_token {
            body["gotrue_meta_security"] = json!({ "captcha_token": token });
        }
        self.attach_code_challenge(&mut body)?;

        let mut url = self.inner.api.url("/otp");
        if let Some(redirect) = &options.email_redirect_to {
            url.query_pairs_mut().append_pair("redirect_to", redirect);
        }
        self.inner.api.post_empty(url, &body).await
    }

    /// Send an OTP to a phone number.
    pub async fn sign_in_with_otp_phone(&self, phone: &str, options: OtpOptions) -> Result<(), AuthError> {
        self.inner.sessions.remove().await?;
        let mut body = json!({
            "phone": phone,
            "create_user": options.should_create_user,
            "channel": options.channel,
        });
        if let Some(data) = &options.data {
            body["data"] = data.clone();
        }
        if let Some(token) = &options.captcha_token {
            body["gotrue_meta_security"] = json!({ "captcha_token": token });
        }
        self.inner.api.post_empty(self.inner.api.url("/otp"), &body).await
    }

    /// Verify an OTP or email-link token hash.
    pub async fn verify_otp(&self, params: VerifyOtpParams) -> Result<AuthResponse, AuthError> {
        self.inner.sessions.remove().await?;
        let body = serde_json::to_value(&params)?;
        let response = self
            .inner
            .api
            .post_auth_response(self.inner.api.url("/verify"), &body)
            .await?;
        if let Some(session) = &response.session {
            self.commit_sign_in(session.clone()).await?;
        }
        Ok(response)
    }

    // ─── OAuth / PKCE ──────────────────────────────────────────

    /// Build the URL that starts an OAuth sign-in.
    ///
    /// In the PKCE flow a code verifier is stored and the matching challenge
    /// is added to the URL. No network request is made.
    pub fn get_oauth_sign_in_url(&self, provider: OAuthProvider, options: OAuthOptions) -> Result<Url, AuthError> {
        let mut url = self.inner.api.url("/authorize");
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("provider", &provider.to_string());
            if let Some(scopes) = &options.scopes {
                query.append_pair("scopes", scopes);
            }
            if let Some(redirect) = &options.redirect_to {
                query.append_pair("redirect_to", redirect);
            }
            for (key, value) in &options.query_params {
                query.append_pair(key, value);
            }
        }
        if let Some(pair) = self.prepare_pkce()? {
            url.query_pairs_mut()
                .append_pair("code_challenge", &pair.challenge)
                .append_pair("code_challenge_method", pair.method());
        }
        Ok(url)
    }

    /// Exchange a PKCE auth code for a session using the stored verifier.
    pub async fn exchange_code_for_session(&self, auth_code: &str) -> Result<Session, AuthError> {
        let verifier = self
            .inner
            .storage
            .code_verifier()?
            .ok_or(AuthError::CodeVerifierMissing)?;
        let body = json!({ "auth_code": auth_code, "code_verifier": verifier });
        let session = self
            .inner
            .api
            .post_session(self.inner.api.url("/token?grant_type=pkce"), &body)
            .await?;
        self.inner.storage.clear_code_verifier();
        self.commit_sign_in(session).await
    }

    /// Complete a redirect-based sign-in from the callback URL.
    ///
    /// Handles the implicit flow (tokens in the fragment) and the PKCE flow
    /// (`code` in the query). A `type=recovery` callback additionally emits
    /// `passwordRecovery`.
    pub async fn session_from_url(&self, callback: &str) -> Result<Session, AuthError> {
        let url = Url::parse(callback)?;
        let params = callback_params(&url);
        let param = |name: &str| params.get(name).map(String::as_str);

        if let Some(description) = param("error_description") {
            return Err(AuthError::Api {
                status: 400,
                message: description.to_string(),
                error_code: param("error_code").map(AuthErrorCode::from),
            });
        }

        match self.inner.flow_type {
            AuthFlowType::Pkce => {
                let code = param("code").ok_or_else(|| {
                    AuthError::InvalidCallbackUrl("missing code for PKCE flow".into())
                })?;
                self.exchange_code_for_session(code).await
            }
            AuthFlowType::Implicit => {
                let missing =
                    |name: &str| AuthError::InvalidCallbackUrl(format!("missing {}", name));
                let access_token = param("access_token").ok_or_else(|| missing("access_token"))?;
                let refresh_token = param("refresh_token").ok_or_else(|| missing("refresh_token"))?;
                let token_type = param("token_type").ok_or_else(|| missing("token_type"))?;
                let expires_in: i64 = param("expires_in")
                    .ok_or_else(|| missing("expires_in"))?
                    .parse()
                    .map_err(|_| AuthError::InvalidCallbackUrl("expires_in is not a number".into()))?;
                let expires_at = param("expires_at").and_then(|v| v.parse().ok());

                let user = self.inner.api.get_user(access_token).await?;
                let session = Session {
                    access_token: access_token.to_string(),
                    refresh_token: refresh_token.to_string(),
                    expires_in,
                    expires_at,
                    token_type: token_type.to_string(),
                    user,
                    provider_token: param("provider_token").map(str::to_string),
                    provider_refresh_token: param("provider_refresh_token").map(str::to_string),
                }
                .with_expiry_filled();

                let session = self.commit_sign_in(session).await?;
                if param("type") == Some("recovery") {
                    self.inner
                        .sessions
                        .emit(AuthChangeEvent::PasswordRecovery, Some(session.clone()))
                        .await;
                }
                Ok(session)
            }
        }
    }

    fn prepare_pkce(&self) -> Result<Option<PkcePair>, AuthError> {
        if self.inner.flow_type != AuthFlowType::Pkce {
            return Ok(None);
        }
        let pair = PkcePair::generate();
        self.inner.storage.set_code_verifier(&pair.verifier)?;
        Ok(Some(pair))
    }

    fn attach_code_challenge(&self, body: &mut JsonValue) -> Result<(), AuthError> {
        if let Some(pair) = self.prepare_pkce()? {
            body["code_challenge"] = json!(pair.challenge);
            body["code_challenge_method"] = json!(pair.method());
        }
        Ok(())
    }

    // ─── User ──────────────────────────────────────────────────

    /// Fetch the signed-in user from the server.
    pub async fn get_user(&self) -> Result<User, AuthError> {
        let session = self.session().await?;
        self.inner.api.get_user(&session.access_token).await
    }

    /// Update the signed-in user. Emits `userUpdated`.
    pub async fn update_user(&self, mut params: UpdateUserParams) -> Result<User, AuthError> {
        if params.email.is_some() {
            if let Some(pair) = self.prepare_pkce()? {
                params.code_challenge_method = Some(pair.method().to_string());
                params.code_challenge = Some(pair.challenge);
            }
        }
        let session = self.session().await?;
        let user = self.inner.api.update_user(&session.access_token, &params).await?;
        self.inner.sessions.replace_user(user.clone()).await?;
        Ok(user)
    }

    /// Send a password reset email.
    pub async fn reset_password_for_email(&self, email: &str, redirect_to: Option<&str>) -> Result<(), AuthError> {
        let mut body = json!({ "email": email });
        self.attach_code_challenge(&mut body)?;
        let mut url = self.inner.api.url("/recover");
        if let Some(redirect) = redirect_to {
            url.query_pairs_mut().append_pair("redirect_to", redirect);
        }
        self.inner.api.post_empty(url, &body).await
    }

    // ─── Sign Out ──────────────────────────────────────────────

    /// Sign out.
    ///
    /// For `Local` and `Global` scope the local session is always cleared
    /// and `signedOut` emitted, even if the server call fails. A 401, 403
    /// or 404 from the server means the session is already gone and is not
    /// reported.
    pub async fn sign_out(&self, scope: SignOutScope) -> Result<(), AuthError> {
        let session = match self.inner.sessions.current().await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Could not read session before sign out");
                None
            }
        };
        let remote = match &session {
            Some(session) => self.inner.api.logout(&session.access_token, scope).await,
            None => Ok(()),
        };

        let local = if scope == SignOutScope::Others {
            Ok(())
        } else {
            self.inner.storage.clear_code_verifier();
            self.inner
                .sessions
                .remove_with_event(AuthChangeEvent::SignedOut)
                .await
        };

        match remote {
            Ok(()) | Err(AuthError::SessionMissing) => local,
            Err(AuthError::Api { status: 401 | 403 | 404, .. }) => local,
            Err(e) => {
                warn!(error = %e, "Remote sign out failed");
                Err(e)
            }
        }
    }

    // ─── Auto refresh ──────────────────────────────────────────

    /// Periodically refresh the session before it expires.
    pub fn start_auto_refresh(&self) {
        let mut slot = self
            .inner
            .auto_refresh
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let sessions = self.inner.sessions.clone();
        let interval = self.inner.auto_refresh_interval;
        debug!(?interval, "Starting auto refresh");
        *slot = Some(platform::spawn(async move {
            loop {
                platform::sleep(interval).await;
                auto_refresh_tick(&sessions, interval).await;
            }
        }));
    }

    pub fn stop_auto_refresh(&self) {
        self.inner.stop_auto_refresh();
    }

    /// Stop background work: auto refresh, the in-flight refresh and all
    /// listeners.
    pub async fn shutdown(&self) {
        self.inner.stop_auto_refresh();
        self.inner.sessions.shutdown().await;
        self.inner.emitter.shutdown();
    }
}

impl AuthInner {
    fn stop_auto_refresh(&self) {
        let task = self
            .auto_refresh
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            debug!("Stopping auto refresh");
            task.abort();
        }
    }
}

impl Drop for AuthInner {
    fn drop(&mut self) {
        self.stop_auto_refresh();
        self.sessions.cancel_refresh();
        self.emitter.shutdown();
    }
}

async fn auto_refresh_tick(sessions: &SessionManager, interval: Duration) {
    let lookahead = sessions.expiry_margin() + interval;
    match sessions.current().await {
        Ok(Some(session)) if session.expires_within(lookahead) => {
            if let Err(e) = sessions.refresh().await {
                warn!(error = %e, "Auto refresh failed");
            }
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Auto refresh could not read session"),
    }
}

/// Query and fragment parameters of a callback URL; the fragment wins.
fn callback_params(url: &Url) -> HashMap<String, String> {
    let mut params: HashMap<String, String> = url.query_pairs().into_owned().collect();
    if let Some(fragment) = url.fragment() {
        params.extend(url::form_urlencoded::parse(fragment.as_bytes()).into_owned());
    }
    params
}

#[async_trait]
impl AccessTokenProvider for AuthClient {
    async fn access_token(&self) -> Option<String> {
        self.session().await.ok().map(|session| session.access_token)
    }
}

impl std::fmt::Debug for AuthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthClient")
            .field("base_url", &self.inner.api.base_url.as_str())
            .field("flow_type", &self.inner.flow_type)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoredSession;
    use crate::types::fixtures::session_expiring_in;

    fn client_with(flow_type: AuthFlowType, storage: Arc<dyn AuthLocalStorage>) -> AuthClient {
        let config = AuthConfig::new("https://example.supabase.co", "test-key")
            .flow_type(flow_type)
            .storage(storage);
        AuthClient::new(config).unwrap()
    }

    fn client() -> AuthClient {
        client_with(AuthFlowType::Pkce, Arc::new(InMemoryStorage::new()))
    }

    #[test]
    fn url_building() {
        let client = client();
        let url = client.inner.api.url("/signup");
        assert_eq!(url.path(), "/auth/v1/signup");
        assert!(url.query().is_none());

        let url = client.inner.api.url("/token?grant_type=password");
        assert_eq!(url.path(), "/auth/v1/token");
        assert_eq!(url.query(), Some("grant_type=password"));
    }

    #[test]
    fn url_building_trailing_slash() {
        let config = AuthConfig::new("https://example.supabase.co/", "test-key");
        let client = AuthClient::new(config).unwrap();
        assert_eq!(client.inner.api.url("/signup").path(), "/auth/v1/signup");
        assert_eq!(client.base_url().path(), "/auth/v1");
    }

    #[test]
    fn invalid_header_is_a_config_error() {
        let config = AuthConfig::new("https://example.supabase.co", "key").header("bad header", "v");
        assert!(matches!(AuthClient::new(config), Err(AuthError::InvalidConfig(_))));
    }

    #[test]
    fn oauth_url_in_pkce_flow_stores_verifier() {
        let storage = Arc::new(InMemoryStorage::new());
        let client = client_with(AuthFlowType::Pkce, storage.clone());
        let url = client
            .get_oauth_sign_in_url(
                OAuthProvider::GitHub,
                OAuthOptions::default()
                    .redirect_to("https://myapp.com/callback")
                    .scopes("read:user")
                    .query_param("prompt", "consent"),
            )
            .unwrap();

        let pairs: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(url.path(), "/auth/v1/authorize");
        assert_eq!(pairs["provider"], "github");
        assert_eq!(pairs["redirect_to"], "https://myapp.com/callback");
        assert_eq!(pairs["scopes"], "read:user");
        assert_eq!(pairs["prompt"], "consent");
        assert_eq!(pairs["code_challenge_method"], "s256");

        let verifier = SessionStorage::new(storage, STORAGE_KEY)
            .code_verifier()
            .unwrap()
            .unwrap();
        assert_eq!(pairs["code_challenge"], crate::pkce::generate_code_challenge(&verifier));
    }

    #[test]
    fn oauth_url_in_implicit_flow_has_no_challenge() {
        let client = client_with(AuthFlowType::Implicit, Arc::new(InMemoryStorage::new()));
        let url = client
            .get_oauth_sign_in_url(OAuthProvider::Custom("myidp".into()), OAuthOptions::default())
            .unwrap();
        let pairs: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["provider"], "myidp");
        assert!(!pairs.contains_key("code_challenge"));
    }

    #[test]
    fn callback_params_merge_query_and_fragment() {
        let url = Url::parse("app://cb?code=abc#access_token=t&type=recovery").unwrap();
        let params = callback_params(&url);
        assert_eq!(params["code"], "abc");
        assert_eq!(params["access_token"], "t");
        assert_eq!(params["type"], "recovery");
    }

    #[tokio::test]
    async fn exchange_without_verifier_fails_locally() {
        let client = client();
        assert!(matches!(
            client.exchange_code_for_session("code").await,
            Err(AuthError::CodeVerifierMissing)
        ));
        assert!(matches!(
            client.session_from_url("app://cb?code=abc").await,
            Err(AuthError::CodeVerifierMissing)
        ));
    }

    #[tokio::test]
    async fn callback_errors_are_reported() {
        let client = client();
        let err = client
            .session_from_url("app://cb#error=access_denied&error_description=User+denied")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Api { ref message, .. } if message == "User denied"));

        let err = client
            .session_from_url("app://cb#access_token=t")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCallbackUrl(_)));

        let implicit = client_with(AuthFlowType::Implicit, Arc::new(InMemoryStorage::new()));
        let err = implicit
            .session_from_url("app://cb#access_token=t&token_type=bearer")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCallbackUrl(_)));
    }

    #[tokio::test]
    async fn set_session_rejects_malformed_token() {
        let client = client();
        assert!(matches!(
            client.set_session("not-a-jwt", "refresh").await,
            Err(AuthError::InvalidToken(_))
        ));
        let no_exp = jwt::encode_for_test(json!({ "sub": "u" }));
        assert!(matches!(
            client.set_session(&no_exp, "refresh").await,
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[tokio::test]
    async fn initialize_publishes_persisted_session() {
        let storage = Arc::new(InMemoryStorage::new());
        let session = session_expiring_in("persisted", 3600);
        SessionStorage::new(storage.clone(), STORAGE_KEY)
            .set(&StoredSession::new(session.clone()))
            .unwrap();

        let client = client_with(AuthFlowType::Pkce, storage);
        client.initialize().await;
        client.initialize().await;

        let latest = client.inner.emitter.latest().unwrap();
        assert_eq!(latest.event, AuthChangeEvent::InitialSession);
        assert_eq!(latest.session, Some(session.clone()));
        assert_eq!(client.access_token().await.as_deref(), Some("persisted"));
    }

    #[tokio::test]
    async fn local_sign_out_without_session_skips_network() {
        let client = client();
        client.initialize().await;
        client.sign_out(SignOutScope::Local).await.unwrap();
        let latest = client.inner.emitter.latest().unwrap();
        assert_eq!(latest.event, AuthChangeEvent::SignedOut);
        assert!(client.access_token().await.is_none());
    }

    struct StalledRefresher;

    #[async_trait]
    impl SessionRefresher for StalledRefresher {
        async fn refresh_session(&self, _refresh_token: &str) -> Result<Session, AuthError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(AuthError::SessionMissing)
        }
    }

    struct FixedRefresher(Session);

    #[async_trait]
    impl SessionRefresher for FixedRefresher {
        async fn refresh_session(&self, _refresh_token: &str) -> Result<Session, AuthError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn early_listener_sees_initial_session_first_when_startup_refreshes() {
        use futures_util::StreamExt;

        let storage = Arc::new(InMemoryStorage::new());
        SessionStorage::new(storage.clone(), STORAGE_KEY)
            .set(&StoredSession::new(session_expiring_in("s1", 5)))
            .unwrap();
        let client = client_with(AuthFlowType::Pkce, storage);
        let refreshed = session_expiring_in("s2", 3600);
        client
            .session_manager()
            .set_session_refresher(Arc::new(FixedRefresher(refreshed.clone())));

        let mut changes = client.auth_state_changes();
        client.initialize().await;

        let first = tokio::time::timeout(Duration::from_secs(1), changes.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.event, AuthChangeEvent::InitialSession);
        assert_eq!(first.session.map(|s| s.access_token).as_deref(), Some("s2"));
        let extra = tokio::time::timeout(Duration::from_millis(50), changes.next()).await;
        assert!(extra.is_err(), "the startup refresh is not replayed separately");
    }

    #[tokio::test]
    async fn dropping_client_cancels_in_flight_refresh() {
        let client = client();
        let manager = client.session_manager().clone();
        manager.set_session_refresher(Arc::new(StalledRefresher));
        manager.update(session_expiring_in("old", 5)).await.unwrap();

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.session().await })
        };
        while !manager.refresh_in_flight() {
            tokio::task::yield_now().await;
        }
        drop(client);

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be released by teardown")
            .unwrap();
        assert!(matches!(result, Err(AuthError::Cancelled)));
        assert!(!manager.refresh_in_flight());
    }

    #[tokio::test]
    async fn auto_refresh_can_be_restarted() {
        let client = client();
        client.start_auto_refresh();
        client.start_auto_refresh();
        client.stop_auto_refresh();
        client.stop_auto_refresh();
        client.start_auto_refresh();
        client.shutdown().await;
    }
}
