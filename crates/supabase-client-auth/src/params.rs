use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::types::{OtpChannel, OtpType};

/// Options shared by email and phone sign-up.
#[derive(Debug, Default, Clone)]
pub struct SignUpOptions {
    /// Stored as the user's `user_metadata`.
    pub data: Option<JsonValue>,
    /// Where the confirmation link should send the user.
    pub email_redirect_to: Option<String>,
    pub captcha_token: Option<String>,
    /// Phone sign-up only.
    pub channel: Option<OtpChannel>,
}

impl SignUpOptions {
    pub fn data(mut self, data: JsonValue) -> Self {
        self.data = Some(data);
        self
    }

    pub fn email_redirect_to(mut self, url: &str) -> Self {
        self.email_redirect_to = Some(url.to_string());
        self
    }

    pub fn captcha_token(mut self, token: &str) -> Self {
        self.captcha_token = Some(token.to_string());
        self
    }

    pub fn channel(mut self, channel: OtpChannel) -> Self {
        self.channel = Some(channel);
        self
    }
}

/// Options for passwordless (magic link / OTP) sign-in.
#[derive(Debug, Clone)]
pub struct OtpOptions {
    /// Create the user if they do not exist yet.
    pub should_create_user: bool,
    pub data: Option<JsonValue>,
    pub email_redirect_to: Option<String>,
    pub channel: OtpChannel,
    pub captcha_token: Option<String>,
}

impl Default for OtpOptions {
    fn default() -> Self {
        Self {
            should_create_user: true,
            data: None,
            email_redirect_to: None,
            channel: OtpChannel::Sms,
            captcha_token: None,
        }
    }
}

impl OtpOptions {
    pub fn should_create_user(mut self, create: bool) -> Self {
        self.should_create_user = create;
        self
    }

    pub fn data(mut self, data: JsonValue) -> Self {
        self.data = Some(data);
        self
    }

    pub fn email_redirect_to(mut self, url: &str) -> Self {
        self.email_redirect_to = Some(url.to_string());
        self
    }

    pub fn channel(mut self, channel: OtpChannel) -> Self {
        self.channel = channel;
        self
    }
}

/// Options for building an OAuth authorize URL.
#[derive(Debug, Default, Clone)]
pub struct OAuthOptions {
    pub redirect_to: Option<String>,
    /// Space separated provider scopes.
    pub scopes: Option<String>,
    /// Extra provider-specific query parameters.
    pub query_params: Vec<(String, String)>,
}

impl OAuthOptions {
    pub fn redirect_to(mut self, url: &str) -> Self {
        self.redirect_to = Some(url.to_string());
        self
    }

    pub fn scopes(mut self, scopes: &str) -> Self {
        self.scopes = Some(scopes.to_string());
        self
    }

    pub fn query_param(mut self, key: &str, value: &str) -> Self {
        self.query_params.push((key.to_string(), value.to_string()));
        self
    }
}

/// Parameters for updating the current user.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct UpdateUserParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    /// Reauthentication nonce, required by some password changes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Filled by the client for email changes in the PKCE flow.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_challenge: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_challenge_method: Option<String>,
}

/// Parameters for verifying an OTP token.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyOtpParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(rename = "type")]
    pub otp_type: OtpType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_to: Option<String>,
}

impl VerifyOtpParams {
    /// Verify a code sent to an email address.
    pub fn email(email: &str, token: &str, otp_type: OtpType) -> Self {
        Self {
            token: Some(token.to_string()),
            otp_type,
            email: Some(email.to_string()),
            phone: None,
            token_hash: None,
            redirect_to: None,
        }
    }

    /// Verify a code sent to a phone number.
    pub fn phone(phone: &str, token: &str, otp_type: OtpType) -> Self {
        Self {
            token: Some(token.to_string()),
            otp_type,
            email: None,
            phone: Some(phone.to_string()),
            token_hash: None,
            redirect_to: None,
        }
    }

    /// Verify the token hash carried by an email link.
    pub fn token_hash(token_hash: &str, otp_type: OtpType) -> Self {
        Self {
            token: None,
            otp_type,
            email: None,
            phone: None,
            token_hash: Some(token_hash.to_string()),
            redirect_to: None,
        }
    }

    pub fn redirect_to(mut self, url: &str) -> Self {
        self.redirect_to = Some(url.to_string());
        self
    }
}

/// Parameters for signing in with an external OIDC ID token.
///
/// Used for native mobile auth (e.g., Google, Apple Sign-In).
#[derive(Debug, Clone, Serialize)]
pub struct SignInWithIdTokenParams {
    pub provider: String,
    pub id_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

impl SignInWithIdTokenParams {
    pub fn new(provider: &str, id_token: &str) -> Self {
        Self {
            provider: provider.to_string(),
            id_token: id_token.to_string(),
            access_token: None,
            nonce: None,
        }
    }

    pub fn nonce(mut self, nonce: &str) -> Self {
        self.nonce = Some(nonce.to_string());
        self
    }

    pub fn access_token(mut self, token: &str) -> Self {
        self.access_token = Some(token.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_otp_email_serialization() {
        let params = VerifyOtpParams::email("a@b.c", "123456", OtpType::MagicLink);
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["type"], "magiclink");
        assert_eq!(json["email"], "a@b.c");
        assert_eq!(json["token"], "123456");
        assert!(json.get("phone").is_none());
        assert!(json.get("token_hash").is_none());
    }

    #[test]
    fn verify_otp_token_hash_omits_token() {
        let params = VerifyOtpParams::token_hash("hash", OtpType::Recovery).redirect_to("app://cb");
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["token_hash"], "hash");
        assert_eq!(json["type"], "recovery");
        assert_eq!(json["redirect_to"], "app://cb");
        assert!(json.get("token").is_none());
    }

    #[test]
    fn update_user_skips_unset_fields() {
        let params = UpdateUserParams {
            email: Some("new@b.c".into()),
            ..Default::default()
        };
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json, serde_json::json!({ "email": "new@b.c" }));
    }

    #[test]
    fn otp_options_default_creates_user() {
        let options = OtpOptions::default();
        assert!(options.should_create_user);
        assert_eq!(options.channel, OtpChannel::Sms);
        assert!(!options.should_create_user(false).should_create_user);
    }

    #[test]
    fn sign_in_with_id_token_serialization() {
        let params = SignInWithIdTokenParams::new("apple", "token123").nonce("n");
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["provider"], "apple");
        assert_eq!(json["id_token"], "token123");
        assert_eq!(json["nonce"], "n");
        assert!(json.get("access_token").is_none());
    }
}
