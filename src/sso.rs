//! Single sign-on against the Helix membership service.
//!
//! The flow is a plain OAuth2 authorization-code exchange: a nonce is stored
//! in the session and sent as `state`, the callback must echo it, and the code
//! is traded for an access token. The token response carries the membership
//! claims that decide whether the person may sign in; `whoami` supplies the
//! profile the local user is built from.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::models::NewUser;
use crate::session::SessionData;

pub const USERNAME_PREFIX: &str = "iafc";

#[derive(Debug, Clone)]
pub struct HelixConfig {
    pub authorize_url: String,
    pub token_url: String,
    pub whoami_url: String,
    pub logout_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub member_organization: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsoError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for SsoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for SsoError {}

#[derive(Debug, Clone, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    #[serde(default)]
    pub memberships: Vec<Membership>,
}

impl AccessToken {
    pub fn is_member_of(&self, organization: &str) -> bool {
        self.memberships.iter().any(|membership| {
            membership.organization.eq_ignore_ascii_case(organization) && membership.is_active()
        })
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Membership {
    pub organization: String,
    #[serde(default)]
    pub status: Option<String>,
}

impl Membership {
    fn is_active(&self) -> bool {
        self.status
            .as_deref()
            .map_or(true, |status| status.eq_ignore_ascii_case("active"))
    }
}

/// Claims returned by the provider's `whoami` endpoint.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct HelixProfile {
    pub id: Value,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub email: String,
}

impl HelixProfile {
    pub fn member_id(&self) -> Option<String> {
        match &self.id {
            Value::String(id) if !id.trim().is_empty() => Some(id.trim().to_string()),
            Value::Number(id) => Some(id.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipDecision {
    NotAMember,
    Member(NewUser),
}

pub fn evaluate_membership(
    token: &AccessToken,
    profile: &HelixProfile,
    organization: &str,
) -> MembershipDecision {
    let Some(member_id) = profile.member_id() else {
        return MembershipDecision::NotAMember;
    };
    if !token.is_member_of(organization) {
        return MembershipDecision::NotAMember;
    }
    MembershipDecision::Member(NewUser {
        username: format!("{USERNAME_PREFIX}-{member_id}"),
        first_name: profile.first_name.clone(),
        last_name: profile.last_name.clone(),
        email: profile.email.clone(),
    })
}

pub fn issue_nonce() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Checks the echoed `state` against the session's nonce without touching
/// the session.
pub fn verify_state(session: Option<&SessionData>, state: Option<&str>) -> Result<(), SsoError> {
    let expected = session.and_then(|session| session.oauth_state.as_deref());
    match (expected, state) {
        (Some(expected), Some(state)) if !expected.is_empty() && expected == state => Ok(()),
        (None, _) => Err(SsoError {
            code: "ERR_SSO_NO_STATE",
            message: "no sign-in is pending for this session".to_string(),
        }),
        _ => Err(state_mismatch()),
    }
}

pub fn state_mismatch() -> SsoError {
    SsoError {
        code: "ERR_SSO_STATE_MISMATCH",
        message: "state does not match the pending sign-in".to_string(),
    }
}

#[derive(Clone)]
pub struct HelixClient {
    config: HelixConfig,
    http: reqwest::Client,
}

impl HelixClient {
    pub fn new(config: HelixConfig) -> Result<Self, SsoError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|_| SsoError {
                code: "ERR_INTERNAL",
                message: "failed to initialize helix http client".to_string(),
            })?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &HelixConfig {
        &self.config
    }

    pub fn logout_url(&self) -> &str {
        &self.config.logout_url
    }

    pub fn authorization_url(&self, state: &str) -> Result<String, SsoError> {
        reqwest::Url::parse_with_params(
            &self.config.authorize_url,
            &[
                ("response_type", "code"),
                ("client_id", self.config.client_id.as_str()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("state", state),
            ],
        )
        .map(String::from)
        .map_err(|_| SsoError {
            code: "ERR_INVALID_CONFIG",
            message: "helix authorize url is not a valid url".to_string(),
        })
    }

    pub async fn exchange_code(&self, code: &str) -> Result<AccessToken, SsoError> {
        let response = self
            .http
            .post(&self.config.token_url)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|err| provider_error("token request failed", err))?
            .error_for_status()
            .map_err(|err| provider_error("token endpoint rejected the code", err))?;

        // The provider answers with a JSON body that is not always labelled as such.
        let body = response
            .text()
            .await
            .map_err(|err| provider_error("token response unreadable", err))?;
        serde_json::from_str(&body).map_err(|_| SsoError {
            code: "ERR_SSO_PROVIDER",
            message: "token response is missing access_token".to_string(),
        })
    }

    pub async fn whoami(&self, token: &AccessToken) -> Result<HelixProfile, SsoError> {
        let body = self
            .http
            .get(&self.config.whoami_url)
            .bearer_auth(&token.access_token)
            .send()
            .await
            .map_err(|err| provider_error("whoami request failed", err))?
            .error_for_status()
            .map_err(|err| provider_error("whoami rejected the token", err))?
            .text()
            .await
            .map_err(|err| provider_error("whoami response unreadable", err))?;
        serde_json::from_str(&body).map_err(|_| SsoError {
            code: "ERR_SSO_PROVIDER",
            message: "whoami response is not a profile".to_string(),
        })
    }
}

fn provider_error(message: &str, err: reqwest::Error) -> SsoError {
    tracing::warn!(error = %err, "helix request failed");
    SsoError {
        code: "ERR_SSO_PROVIDER",
        message: message.to_string(),
    }
}
