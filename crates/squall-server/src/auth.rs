//! Token authentication and map-level authorization.
//!
//! Two credential shapes are accepted: HS256 JWTs carrying `sub` and `roles`
//! claims, and pre-shared static tokens compared in constant time. Policy
//! checks are prefix-based allow rules; a node with no policies configured
//! allows every authenticated principal.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use subtle::ConstantTimeEq;

use crate::config::{AuthConfig, MapAction, SecurityPolicy};
use crate::error::GridError;

/// An authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub roles: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    roles: Vec<String>,
    #[allow(dead_code)]
    exp: u64,
}

/// Validates tokens against the node's configured credentials.
pub struct Authenticator {
    jwt_key: Option<DecodingKey>,
    static_tokens: Vec<(String, String)>,
    policies: Vec<SecurityPolicy>,
}

impl Authenticator {
    /// Builds an authenticator from config.
    #[must_use]
    pub fn new(auth: &AuthConfig, policies: Vec<SecurityPolicy>) -> Self {
        Self {
            jwt_key: auth
                .jwt_secret
                .as_ref()
                .map(|secret| DecodingKey::from_secret(secret.as_bytes())),
            static_tokens: auth
                .static_tokens
                .iter()
                .map(|(token, user)| (token.clone(), user.clone()))
                .collect(),
            policies,
        }
    }

    /// Resolves a presented token to a principal.
    ///
    /// Static tokens are checked first (constant-time comparison), then the
    /// token is validated as a JWT when a secret is configured.
    ///
    /// # Errors
    ///
    /// Returns [`GridError::Auth`] for unknown, malformed, or expired tokens.
    pub fn authenticate(&self, token: &str) -> Result<Principal, GridError> {
        for (expected, user) in &self.static_tokens {
            if expected.as_bytes().ct_eq(token.as_bytes()).into() {
                return Ok(Principal {
                    user_id: user.clone(),
                    roles: vec!["static".to_string()],
                });
            }
        }

        let Some(key) = &self.jwt_key else {
            return Err(GridError::Auth("unknown token".to_string()));
        };
        let data = decode::<Claims>(token, key, &Validation::new(Algorithm::HS256))
            .map_err(|err| GridError::Auth(format!("invalid token: {err}")))?;
        Ok(Principal { user_id: data.claims.sub, roles: data.claims.roles })
    }

    /// Checks whether `principal` may perform `action` on `map_name`.
    ///
    /// With no policies configured every action is allowed; otherwise at
    /// least one policy must grant the action for a held role and a matching
    /// map prefix.
    ///
    /// # Errors
    ///
    /// Returns [`GridError::Permission`] when no policy grants the action.
    pub fn authorize(
        &self,
        principal: &Principal,
        map_name: &str,
        action: MapAction,
    ) -> Result<(), GridError> {
        if self.policies.is_empty() {
            return Ok(());
        }
        let allowed = self.policies.iter().any(|policy| {
            principal.roles.iter().any(|role| role == &policy.role)
                && map_name.starts_with(&policy.map_prefix)
                && policy.actions.contains(&action)
        });
        if allowed {
            Ok(())
        } else {
            let action = match action {
                MapAction::Read => "read",
                MapAction::Write => "write",
            };
            Err(GridError::Permission { map_name: map_name.to_string(), action })
        }
    }
}
