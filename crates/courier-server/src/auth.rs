//! Turning a connection token into an [`Identity`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{Identity, IdentityId, Role};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::config::AuthConfig;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("no token supplied")]
    Missing,
    #[error("invalid token: {0}")]
    Invalid(String),
    #[error("token expired")]
    Expired,
    #[error("token is for role `{found}`, endpoint requires `{expected}`")]
    WrongRole { expected: Role, found: String },
    #[error("token authentication is not configured")]
    NotConfigured,
}

/// Resolves a connection token for the endpoint of `role`.
///
/// Called once per connection, before anything is registered.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, role: Role, token: &str) -> Result<Identity, AuthError>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Subject {
    Text(String),
    Number(i64),
}

#[derive(Deserialize)]
struct Claims {
    sub: Subject,
    #[serde(default)]
    role: Option<String>,
}

/// HS256 bearer tokens. `sub` is the identity id; a `role` claim, when
/// present, must match the endpoint.
pub struct JwtResolver {
    key: DecodingKey,
    validation: Validation,
}

impl JwtResolver {
    pub fn new(secret: &SecretString) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            key: DecodingKey::from_secret(secret.expose_secret().as_bytes()),
            validation,
        }
    }
}

#[async_trait]
impl IdentityResolver for JwtResolver {
    async fn resolve(&self, role: Role, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation).map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            _ => AuthError::Invalid(e.to_string()),
        })?;

        if let Some(found) = data.claims.role {
            if found != role.as_str() {
                return Err(AuthError::WrongRole { expected: role, found });
            }
        }

        let id = match data.claims.sub {
            Subject::Text(s) if s.is_empty() => return Err(AuthError::Invalid("empty subject".into())),
            Subject::Text(s) => IdentityId::from_raw(s),
            Subject::Number(n) => IdentityId::from(n),
        };
        Ok(Identity { id, role })
    }
}

/// Fixed token table, for tests and local development.
#[derive(Default)]
pub struct StaticResolver {
    tokens: HashMap<String, Identity>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }
}

#[async_trait]
impl IdentityResolver for StaticResolver {
    async fn resolve(&self, role: Role, token: &str) -> Result<Identity, AuthError> {
        let identity = self
            .tokens
            .get(token)
            .ok_or_else(|| AuthError::Invalid("unknown token".into()))?;
        if identity.role != role {
            return Err(AuthError::WrongRole {
                expected: role,
                found: identity.role.to_string(),
            });
        }
        Ok(identity.clone())
    }
}

/// Refuses every token. Used when no secret is configured.
pub struct DenyAll;

#[async_trait]
impl IdentityResolver for DenyAll {
    async fn resolve(&self, _role: Role, _token: &str) -> Result<Identity, AuthError> {
        Err(AuthError::NotConfigured)
    }
}

/// The resolver `auth` describes: JWT when a secret is configured,
/// [`DenyAll`] otherwise.
pub fn resolver_from_config(auth: &AuthConfig) -> Arc<dyn IdentityResolver> {
    match &auth.jwt_secret {
        Some(secret) => Arc::new(JwtResolver::new(secret)),
        None => {
            tracing::warn!("No JWT secret configured, every connection will be refused");
            Arc::new(DenyAll)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header};
    use serde_json::json;

    const SECRET: &str = "test-secret";

    fn resolver() -> JwtResolver {
        JwtResolver::new(&SecretString::from(SECRET.to_owned()))
    }

    fn token(claims: serde_json::Value) -> String {
        jsonwebtoken::encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
    }

    fn in_one_hour() -> i64 {
        chrono::Utc::now().timestamp() + 3_600
    }

    #[tokio::test]
    async fn string_subject_becomes_identity() {
        let t = token(json!({"sub": "7", "exp": in_one_hour()}));
        let identity = resolver().resolve(Role::Fulfiller, &t).await.unwrap();
        assert_eq!(identity, Identity::fulfiller(7));
    }

    #[tokio::test]
    async fn numeric_subject_is_accepted() {
        let t = token(json!({"sub": 100, "exp": in_one_hour()}));
        let identity = resolver().resolve(Role::Requester, &t).await.unwrap();
        assert_eq!(identity, Identity::requester(100));
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let t = token(json!({"sub": "7", "exp": chrono::Utc::now().timestamp() - 60}));
        let err = resolver().resolve(Role::Fulfiller, &t).await.unwrap_err();
        assert!(matches!(err, AuthError::Expired));
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let t = jsonwebtoken::encode(
            &Header::default(),
            &json!({"sub": "7", "exp": in_one_hour()}),
            &EncodingKey::from_secret(b"other"),
        )
        .unwrap();
        let err = resolver().resolve(Role::Fulfiller, &t).await.unwrap_err();
        assert!(matches!(err, AuthError::Invalid(_)));
    }

    #[tokio::test]
    async fn role_claim_must_match_endpoint() {
        let t = token(json!({"sub": "7", "role": "user", "exp": in_one_hour()}));
        let err = resolver().resolve(Role::Fulfiller, &t).await.unwrap_err();
        assert!(matches!(err, AuthError::WrongRole { .. }));
    }

    #[tokio::test]
    async fn garbage_and_empty_tokens_are_rejected() {
        assert!(matches!(
            resolver().resolve(Role::Fulfiller, "not.a.jwt").await,
            Err(AuthError::Invalid(_))
        ));
        assert!(matches!(resolver().resolve(Role::Fulfiller, "").await, Err(AuthError::Missing)));
    }

    #[tokio::test]
    async fn static_resolver_checks_role() {
        let resolver = StaticResolver::new().with("d7", Identity::fulfiller(7));
        assert_eq!(
            resolver.resolve(Role::Fulfiller, "d7").await.unwrap(),
            Identity::fulfiller(7)
        );
        assert!(resolver.resolve(Role::Requester, "d7").await.is_err());
        assert!(resolver.resolve(Role::Fulfiller, "nope").await.is_err());
    }

    #[tokio::test]
    async fn config_without_secret_denies() {
        let resolver = resolver_from_config(&AuthConfig::default());
        assert!(resolver.resolve(Role::Fulfiller, "x").await.is_err());

        let auth = AuthConfig {
            jwt_secret: Some(SecretString::from(SECRET.to_owned())),
            ..Default::default()
        };
        let t = token(json!({"sub": "7", "exp": in_one_hour()}));
        assert!(resolver_from_config(&auth).resolve(Role::Fulfiller, &t).await.is_ok());
    }

    #[tokio::test]
    async fn deny_all_refuses() {
        assert!(matches!(
            DenyAll.resolve(Role::Fulfiller, "anything").await,
            Err(AuthError::NotConfigured)
        ));
    }
}
