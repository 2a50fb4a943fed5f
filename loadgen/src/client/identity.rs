//! Identity provider seam and its JSON-1.1 implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::trace;

use super::transport::{HttpRequest, Transport};
use super::types::{ApiError, RequestResult};
use crate::config::AuthConfig;

/// Tokens returned by a successful authentication or refresh
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBundle {
    pub access_token: String,
    pub expires_in: Duration,
    /// Only present on the initial authentication
    pub refresh_token: Option<String>,
}

/// Opaque session handle passed from `initiate_auth` to the challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub session: String,
}

#[derive(Debug, Clone, Error)]
pub enum IdentityError {
    #[error("Username already exists")]
    UsernameExists,
    #[error("Identity provider throttled the request")]
    Throttled,
    #[error("{0}")]
    Rejected(ApiError),
    #[error("Identity response is missing {0}")]
    MissingField(&'static str),
}

impl IdentityError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Rejected(e) => e.status,
            Self::UsernameExists | Self::Throttled => Some(400),
            Self::MissingField(_) => None,
        }
    }

    /// Request-layer view of this error.
    pub fn to_api_error(&self) -> ApiError {
        match self {
            Self::Rejected(e) => e.clone(),
            other => {
                let mut error = ApiError::client(other.to_string());
                error.status = other.status();
                error
            }
        }
    }
}

/// External identity collaborator
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn sign_up(&self, username: &str) -> Result<(), IdentityError>;

    async fn initiate_auth(&self, username: &str) -> Result<AuthChallenge, IdentityError>;

    async fn respond_to_challenge(
        &self,
        username: &str,
        challenge: &AuthChallenge,
    ) -> Result<TokenBundle, IdentityError>;

    async fn refresh(&self, username: &str, refresh_token: &str) -> Result<TokenBundle, IdentityError>;
}

const TARGET_PREFIX: &str = "AWSCognitoIdentityProviderService.";

/// Identity provider speaking the Cognito JSON-1.1 API over a [`Transport`]
pub struct CognitoIdentity {
    transport: Arc<dyn Transport>,
    endpoint: String,
    client_id: String,
    password: String,
    challenge_answer: String,
}

impl CognitoIdentity {
    pub fn new(transport: Arc<dyn Transport>, auth: &AuthConfig) -> Self {
        Self {
            transport,
            endpoint: auth.endpoint.clone(),
            client_id: auth.client_id.clone(),
            password: auth.password.clone(),
            challenge_answer: auth.challenge_answer.clone(),
        }
    }

    async fn call(&self, operation: &str, body: Value) -> Result<Value, IdentityError> {
        let request = HttpRequest::post(&self.endpoint, body.to_string())
            .header("Content-Type", "application/x-amz-json-1.1")
            .header("x-amz-api-version", "2016-04-18")
            .header("x-amz-target", format!("{TARGET_PREFIX}{operation}"));
        let response = self.transport.send(request.clone()).await;
        trace!(
            "POST {} ({}) {:?}: {}",
            self.endpoint, operation, response.status, response.body
        );
        let result = RequestResult::from_response(&request, &response);
        match result.error {
            None => Ok(result.body),
            Some(e) => Err(match e.type_name.as_deref() {
                Some("UsernameExistsException") => IdentityError::UsernameExists,
                Some("TooManyRequestsException") => IdentityError::Throttled,
                _ => IdentityError::Rejected(e),
            }),
        }
    }
}

fn parse_tokens(body: &Value) -> Result<TokenBundle, IdentityError> {
    let auth = body
        .get("AuthenticationResult")
        .ok_or(IdentityError::MissingField("AuthenticationResult"))?;
    let access_token = auth
        .get("AccessToken")
        .and_then(Value::as_str)
        .ok_or(IdentityError::MissingField("AccessToken"))?
        .to_string();
    let expires_in = auth
        .get("ExpiresIn")
        .and_then(Value::as_u64)
        .ok_or(IdentityError::MissingField("ExpiresIn"))?;
    let refresh_token = auth
        .get("RefreshToken")
        .and_then(Value::as_str)
        .map(String::from);
    Ok(TokenBundle {
        access_token,
        expires_in: Duration::from_secs(expires_in),
        refresh_token,
    })
}

#[async_trait]
impl IdentityProvider for CognitoIdentity {
    async fn sign_up(&self, username: &str) -> Result<(), IdentityError> {
        self.call(
            "SignUp",
            json!({
                "ClientId": self.client_id,
                "Username": username,
                "Password": self.password,
                "UserAttributes": [{ "Name": "phone_number", "Value": username }],
            }),
        )
        .await
        .map(|_| ())
    }

    async fn initiate_auth(&self, username: &str) -> Result<AuthChallenge, IdentityError> {
        let body = self
            .call(
                "InitiateAuth",
                json!({
                    "ClientId": self.client_id,
                    "AuthFlow": "CUSTOM_AUTH",
                    "AuthParameters": { "USERNAME": username },
                }),
            )
            .await?;
        let session = body
            .get("Session")
            .and_then(Value::as_str)
            .ok_or(IdentityError::MissingField("Session"))?;
        Ok(AuthChallenge {
            session: session.to_string(),
        })
    }

    async fn respond_to_challenge(
        &self,
        username: &str,
        challenge: &AuthChallenge,
    ) -> Result<TokenBundle, IdentityError> {
        let body = self
            .call(
                "RespondToAuthChallenge",
                json!({
                    "ClientId": self.client_id,
                    "Session": challenge.session,
                    "ChallengeName": "CUSTOM_CHALLENGE",
                    "ChallengeResponses": {
                        "USERNAME": username,
                        "ANSWER": self.challenge_answer,
                    },
                }),
            )
            .await?;
        parse_tokens(&body)
    }

    async fn refresh(&self, username: &str, refresh_token: &str) -> Result<TokenBundle, IdentityError> {
        let body = self
            .call(
                "InitiateAuth",
                json!({
                    "ClientId": self.client_id,
                    "AuthFlow": "REFRESH_TOKEN_AUTH",
                    "AuthParameters": {
                        "USERNAME": username,
                        "REFRESH_TOKEN": refresh_token,
                    },
                }),
            )
            .await?;
        parse_tokens(&body)
    }
}
