//! Operator bearer tokens.
//!
//! Tokens are HS256 JWTs whose `permissions` claim lists what the operator
//! may do. Role management happens elsewhere; this module only issues and
//! validates tokens.

use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use mdmgate_core::db::unix_timestamp;

/// Permission names checked by the operator API.
pub mod permission {
    pub const SYNC_DIRECTORY: &str = "mdm.sync_directory";
    pub const SYNC_CATALOG: &str = "mdm.sync_catalog";
    pub const VIEW_TASKS: &str = "mdm.view_tasks";
    pub const ADD_COMMAND: &str = "mdm.add_command";
    pub const VIEW_COMMANDS: &str = "mdm.view_commands";
    pub const SEND_NOTIFICATION: &str = "mdm.send_notification";
    pub const VIEW_PUSH_CERTIFICATES: &str = "mdm.view_push_certificates";
    pub const CHANGE_PUSH_CERTIFICATE: &str = "mdm.change_push_certificate";

    pub const ALL: &[&str] = &[
        SYNC_DIRECTORY,
        SYNC_CATALOG,
        VIEW_TASKS,
        ADD_COMMAND,
        VIEW_COMMANDS,
        SEND_NOTIFICATION,
        VIEW_PUSH_CERTIFICATES,
        CHANGE_PUSH_CERTIFICATE,
    ];
}

/// JWT claims of an operator token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorClaims {
    /// JWT ID (unique per token).
    pub jti: String,
    /// Operator identifier.
    pub sub: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    pub iat: i64,
    pub exp: i64,
}

impl OperatorClaims {
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }
}

/// Issues and validates operator tokens.
#[derive(Clone)]
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtManager {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
        }
    }

    /// Issue a token for `subject` valid for `ttl_secs`.
    pub fn issue_token(
        &self,
        subject: &str,
        permissions: &[&str],
        ttl_secs: i64,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let now = unix_timestamp();
        let claims = OperatorClaims {
            jti: uuid::Uuid::new_v4().to_string(),
            sub: subject.to_string(),
            permissions: permissions.iter().map(ToString::to_string).collect(),
            iat: now,
            exp: now + ttl_secs,
        };
        jsonwebtoken::encode(&Header::default(), &claims, &self.encoding_key)
    }

    /// Validate a token and return its claims.
    pub fn validate(&self, token: &str) -> Result<OperatorClaims, jsonwebtoken::errors::Error> {
        let data = jsonwebtoken::decode::<OperatorClaims>(
            token,
            &self.decoding_key,
            &Validation::default(),
        )?;
        Ok(data.claims)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn test_jwt() -> JwtManager {
        JwtManager::new(b"test-secret-key-for-testing")
    }

    #[test]
    fn issue_and_validate_token() {
        let jwt = test_jwt();
        let token = jwt
            .issue_token("ops", &[permission::VIEW_TASKS], 3600)
            .unwrap();

        let claims = jwt.validate(&token).unwrap();
        assert_eq!(claims.sub, "ops");
        assert!(claims.has_permission(permission::VIEW_TASKS));
        assert!(!claims.has_permission(permission::ADD_COMMAND));
    }

    #[test]
    fn expired_token_fails_validation() {
        let jwt = test_jwt();
        let token = jwt.issue_token("ops", permission::ALL, -3600).unwrap();
        assert!(jwt.validate(&token).is_err());
    }

    #[test]
    fn wrong_secret_fails_validation() {
        let token = test_jwt().issue_token("ops", &[], 3600).unwrap();
        assert!(JwtManager::new(b"different").validate(&token).is_err());
        assert!(test_jwt().validate("not-a-valid-token").is_err());
    }
}
