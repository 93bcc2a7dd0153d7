use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::jwt;

/// A user session returned from sign-in, sign-up, or token refresh.
///
/// Matches the Supabase GoTrue session object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    #[serde(default)]
    pub expires_at: Option<i64>,
    pub token_type: String,
    pub user: User,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_refresh_token: Option<String>,
}

impl Session {
    /// Unix timestamp (seconds) at which the access token stops being valid.
    ///
    /// Uses the explicit `expires_at` when the server sent one, otherwise the
    /// `exp` claim of the access token.
    pub fn expiry(&self) -> Option<i64> {
        self.expires_at
            .or_else(|| jwt::decode_claims(&self.access_token).ok()?.exp)
    }

    /// True when the token is expired or will expire within `margin`.
    ///
    /// A session whose expiry cannot be determined is treated as expired.
    pub fn expires_within(&self, margin: Duration) -> bool {
        match self.expiry() {
            Some(expiry) => Utc::now().timestamp() + margin.as_secs() as i64 >= expiry,
            None => true,
        }
    }

    /// Fill `expires_at` from `expires_in` (relative to now) if it is absent.
    pub(crate) fn with_expiry_filled(mut self) -> Self {
        if self.expires_at.is_none() {
            self.expires_at = jwt::decode_claims(&self.access_token)
                .ok()
                .and_then(|claims| claims.exp)
                .or(Some(Utc::now().timestamp() + self.expires_in));
        }
        self
    }
}

/// A GoTrue user object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub aud: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email_confirmed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub phone_confirmed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub confirmation_sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub recovery_sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_sign_in_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub user_metadata: Option<JsonValue>,
    #[serde(default)]
    pub app_metadata: Option<JsonValue>,
    #[serde(default)]
    pub identities: Option<Vec<Identity>>,
    #[serde(default)]
    pub is_anonymous: Option<bool>,
}

/// A linked auth provider identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub identity_data: Option<JsonValue>,
    pub provider: String,
    #[serde(default)]
    pub last_sign_in_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Response from sign-up and OTP verification: a session, a user, or both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    #[serde(default)]
    pub session: Option<Session>,
    #[serde(default)]
    pub user: Option<User>,
}

impl AuthResponse {
    /// GoTrue answers sign-up either with a bare user (confirmation pending)
    /// or with a full session object at the top level.
    pub(crate) fn from_value(value: JsonValue) -> Result<Self, serde_json::Error> {
        if value.get("access_token").is_some() {
            let session: Session = serde_json::from_value(value)?;
            let user = session.user.clone();
            return Ok(Self {
                session: Some(session),
                user: Some(user),
            });
        }
        if value.get("user").is_some() || value.get("session").is_some() {
            return serde_json::from_value(value);
        }
        let user: User = serde_json::from_value(value)?;
        Ok(Self {
            session: None,
            user: Some(user),
        })
    }
}

// ── Auth state events ─────────────────────────────────────────

/// Session lifecycle transitions delivered to auth state listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthChangeEvent {
    InitialSession,
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
    PasswordRecovery,
}

impl fmt::Display for AuthChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InitialSession => write!(f, "INITIAL_SESSION"),
            Self::SignedIn => write!(f, "SIGNED_IN"),
            Self::SignedOut => write!(f, "SIGNED_OUT"),
            Self::TokenRefreshed => write!(f, "TOKEN_REFRESHED"),
            Self::UserUpdated => write!(f, "USER_UPDATED"),
            Self::PasswordRecovery => write!(f, "PASSWORD_RECOVERY"),
        }
    }
}

/// One delivered auth state change.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthStateChange {
    pub event: AuthChangeEvent,
    pub session: Option<Session>,
}

/// How OAuth, magic-link and email-change redirects hand back credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthFlowType {
    /// Tokens arrive in the redirect URL fragment.
    Implicit,
    /// An auth code arrives in the redirect URL and is exchanged with a
    /// stored code verifier.
    #[default]
    Pkce,
}

/// Supported OAuth providers.
///
/// Matches the provider strings accepted by Supabase GoTrue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OAuthProvider {
    Apple,
    Azure,
    Bitbucket,
    Discord,
    Facebook,
    Figma,
    GitHub,
    GitLab,
    Google,
    Kakao,
    Keycloak,
    LinkedInOidc,
    Notion,
    SlackOidc,
    Spotify,
    Twitch,
    Twitter,
    WorkOS,
    Zoom,
    Custom(String),
}

impl fmt::Display for OAuthProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Apple => "apple",
            Self::Azure => "azure",
            Self::Bitbucket => "bitbucket",
            Self::Discord => "discord",
            Self::Facebook => "facebook",
            Self::Figma => "figma",
            Self::GitHub => "github",
            Self::GitLab => "gitlab",
            Self::Google => "google",
            Self::Kakao => "kakao",
            Self::Keycloak => "keycloak",
            Self::LinkedInOidc => "linkedin_oidc",
            Self::Notion => "notion",
            Self::SlackOidc => "slack_oidc",
            Self::Spotify => "spotify",
            Self::Twitch => "twitch",
            Self::Twitter => "twitter",
            Self::WorkOS => "workos",
            Self::Zoom => "zoom",
            Self::Custom(s) => s.as_str(),
        };
        f.write_str(name)
    }
}

/// OTP delivery channel for phone-based OTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OtpChannel {
    Sms,
    Whatsapp,
}

/// Scope for sign-out operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignOutScope {
    /// Sign out from the current session only.
    Local,
    /// Sign out from all other sessions (keep current).
    Others,
    /// Sign out from all sessions including current.
    #[default]
    Global,
}

impl fmt::Display for SignOutScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Others => write!(f, "others"),
            Self::Global => write!(f, "global"),
        }
    }
}

/// OTP verification type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtpType {
    Email,
    Sms,
    PhoneChange,
    EmailChange,
    Signup,
    Recovery,
    Invite,
    #[serde(rename = "magiclink")]
    MagicLink,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn user() -> User {
        User {
            id: "859f402d-b3de-4105-a1b9-932836d9193b".into(),
            aud: Some("authenticated".into()),
            role: Some("authenticated".into()),
            email: Some("john@example.com".into()),
            phone: None,
            email_confirmed_at: None,
            phone_confirmed_at: None,
            confirmation_sent_at: None,
            recovery_sent_at: None,
            last_sign_in_at: None,
            created_at: None,
            updated_at: None,
            user_metadata: None,
            app_metadata: None,
            identities: None,
            is_anonymous: Some(false),
        }
    }

    /// Session whose access token expires `secs` from now.
    pub fn session_expiring_in(access_token: &str, secs: i64) -> Session {
        Session {
            access_token: access_token.into(),
            refresh_token: format!("{}-refresh", access_token),
            expires_in: secs,
            expires_at: Some(Utc::now().timestamp() + secs),
            token_type: "bearer".into(),
            user: user(),
            provider_token: None,
            provider_refresh_token: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn expiry_margin_is_applied() {
        let session = session_expiring_in("a", 10);
        assert!(session.expires_within(Duration::from_secs(30)));
        assert!(!session.expires_within(Duration::from_secs(0)));

        let fresh = session_expiring_in("b", 3600);
        assert!(!fresh.expires_within(Duration::from_secs(30)));
    }

    #[test]
    fn missing_expiry_filled_from_expires_in() {
        let mut session = session_expiring_in("not-a-jwt", 120);
        session.expires_at = None;
        let filled = session.with_expiry_filled();
        let expiry = filled.expires_at.unwrap();
        let now = Utc::now().timestamp();
        assert!(expiry >= now + 119 && expiry <= now + 121);
    }

    #[test]
    fn auth_change_event_wire_names() {
        assert_eq!(
            serde_json::to_string(&AuthChangeEvent::TokenRefreshed).unwrap(),
            "\"TOKEN_REFRESHED\""
        );
        assert_eq!(AuthChangeEvent::InitialSession.to_string(), "INITIAL_SESSION");
    }

    #[test]
    fn otp_type_wire_names() {
        assert_eq!(serde_json::to_string(&OtpType::MagicLink).unwrap(), "\"magiclink\"");
        assert_eq!(serde_json::to_string(&OtpType::EmailChange).unwrap(), "\"email_change\"");
    }

    #[test]
    fn auth_response_shapes() {
        let user_only = serde_json::json!({ "id": "u1", "email": "a@b.c" });
        let resp = AuthResponse::from_value(user_only).unwrap();
        assert!(resp.session.is_none());
        assert_eq!(resp.user.unwrap().id, "u1");

        let session = serde_json::to_value(session_expiring_in("tok", 60)).unwrap();
        let resp = AuthResponse::from_value(session).unwrap();
        assert_eq!(resp.session.unwrap().access_token, "tok");
    }
}
