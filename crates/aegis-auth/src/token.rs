//! Bearer token issuance, verification, and refresh.
//!
//! Tokens are HMAC-signed and carry the session they were minted for.
//! Verification never trusts the signature alone: after the cryptographic
//! checks the bound session is re-validated, so revoking a session kills
//! every outstanding token instantly. Refresh mints a new access token but
//! does not rotate the refresh token itself.

use std::sync::Arc;

use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use aegis_core::config::TokenConfig;
use aegis_core::{Error, Result};

use crate::session::SessionManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Access,
    Refresh,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Access => "access",
            TokenType::Refresh => "refresh",
        }
    }
}

/// Claims carried by every token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    /// Session the token is bound to
    pub sid: String,
    /// Access or refresh
    pub token_type: TokenType,
    /// Issuer
    pub iss: String,
    /// Issued at (unix timestamp)
    pub iat: i64,
    /// Expiration (unix timestamp)
    pub exp: i64,
    /// Unique token id
    pub jti: String,
}

impl Claims {
    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }

    pub fn user_id(&self) -> Result<Uuid> {
        Uuid::parse_str(&self.sub).map_err(|_| Error::InvalidToken {
            reason: "malformed subject claim".to_string(),
        })
    }
}

/// Access and refresh token minted together at login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Seconds until the access token expires
    pub access_expires_in_secs: i64,
}

/// Signs, verifies, and refreshes bearer tokens.
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    config: TokenConfig,
    sessions: Arc<SessionManager>,
}

impl TokenService {
    pub fn new(config: TokenConfig, sessions: Arc<SessionManager>) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());

        let mut validation = Validation::default();
        validation.set_issuer(&[&config.issuer]);

        Self {
            encoding_key,
            decoding_key,
            validation,
            config,
            sessions,
        }
    }

    fn build_claims(&self, user_id: Uuid, session_id: &str, token_type: TokenType) -> Claims {
        let now = Utc::now().timestamp();
        let ttl_secs = match token_type {
            TokenType::Access => self.config.access_ttl_secs,
            TokenType::Refresh => self.config.refresh_ttl_days * 86_400,
        };

        Claims {
            sub: user_id.to_string(),
            sid: session_id.to_string(),
            token_type,
            iss: self.config.issuer.clone(),
            iat: now,
            exp: now + ttl_secs,
            jti: Uuid::new_v4().to_string(),
        }
    }

    fn sign(&self, claims: &Claims) -> Result<String> {
        encode(&Header::default(), claims, &self.encoding_key).map_err(|e| {
            Error::EncryptionFailure {
                message: format!("token signing failed: {}", e),
            }
        })
    }

    fn decode_claims(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| Error::InvalidToken {
                reason: e.to_string(),
            })
    }

    pub fn issue_access(&self, user_id: Uuid, session_id: &str) -> Result<String> {
        self.sign(&self.build_claims(user_id, session_id, TokenType::Access))
    }

    pub fn issue_refresh(&self, user_id: Uuid, session_id: &str) -> Result<String> {
        self.sign(&self.build_claims(user_id, session_id, TokenType::Refresh))
    }

    /// Mint the access/refresh pair handed out at login.
    pub fn issue_pair(&self, user_id: Uuid, session_id: &str) -> Result<TokenPair> {
        Ok(TokenPair {
            access_token: self.issue_access(user_id, session_id)?,
            refresh_token: self.issue_refresh(user_id, session_id)?,
            access_expires_in_secs: self.config.access_ttl_secs,
        })
    }

    /// Full verification: signature, expiry, issuer, expected type, and
    /// session liveness. A verified access token also counts as session
    /// activity.
    pub async fn verify(&self, token: &str, expected: TokenType) -> Result<Claims> {
        let claims = self.decode_claims(token)?;

        if claims.token_type != expected {
            return Err(Error::InvalidToken {
                reason: format!("expected {} token", expected.as_str()),
            });
        }

        if !self.sessions.validate(&claims.sid).await? {
            return Err(Error::SessionExpiredOrRevoked);
        }

        if expected == TokenType::Access {
            self.sessions.touch(&claims.sid).await;
        }

        Ok(claims)
    }

    /// Exchange a live refresh token for a fresh access token.
    pub async fn refresh(&self, refresh_token: &str) -> Result<String> {
        let claims = self.verify(refresh_token, TokenType::Refresh).await?;
        let user_id = claims.user_id()?;
        let access = self.issue_access(user_id, &claims.sid)?;

        debug!(user_id = %claims.sub, session_id = %claims.sid, "Access token refreshed");
        Ok(access)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemorySessionStore;
    use aegis_core::config::{SessionConfig, TimeoutConfig};
    use aegis_core::MemoryCache;

    async fn test_setup() -> (Arc<SessionManager>, TokenService, Uuid, String) {
        let manager = Arc::new(SessionManager::new(
            Arc::new(MemorySessionStore::new()),
            Arc::new(MemoryCache::new()),
            SessionConfig::default(),
            TimeoutConfig::default(),
        ));
        let service = TokenService::new(TokenConfig::default(), manager.clone());

        let user_id = Uuid::new_v4();
        let session = manager
            .create(user_id, "device-1", "203.0.113.7", "agent", 0.1, None)
            .await
            .unwrap();

        (manager, service, user_id, session.session_id)
    }

    #[tokio::test]
    async fn test_access_token_round_trip() {
        let (_, service, user_id, session_id) = test_setup().await;

        let token = service.issue_access(user_id, &session_id).unwrap();
        let claims = service.verify(&token, TokenType::Access).await.unwrap();

        assert_eq!(claims.sub, user_id.to_string());
        assert_eq!(claims.sid, session_id);
        assert_eq!(claims.token_type, TokenType::Access);
        assert!(!claims.is_expired());
    }

    #[tokio::test]
    async fn test_pair_tokens_have_distinct_ids() {
        let (_, service, user_id, session_id) = test_setup().await;

        let pair = service.issue_pair(user_id, &session_id).unwrap();
        let access = service.verify(&pair.access_token, TokenType::Access).await.unwrap();
        let refresh = service
            .verify(&pair.refresh_token, TokenType::Refresh)
            .await
            .unwrap();

        assert_ne!(access.jti, refresh.jti);
        assert!(refresh.exp > access.exp);
    }

    #[tokio::test]
    async fn test_revoked_session_kills_tokens() {
        let (manager, service, user_id, session_id) = test_setup().await;
        let pair = service.issue_pair(user_id, &session_id).unwrap();

        manager.revoke(&session_id).await.unwrap();

        let access = service.verify(&pair.access_token, TokenType::Access).await;
        assert!(matches!(access, Err(Error::SessionExpiredOrRevoked)));

        // The refresh path dies with the session too
        let refreshed = service.refresh(&pair.refresh_token).await;
        assert!(matches!(refreshed, Err(Error::SessionExpiredOrRevoked)));
    }

    #[tokio::test]
    async fn test_refresh_mints_usable_access_token() {
        let (_, service, user_id, session_id) = test_setup().await;
        let pair = service.issue_pair(user_id, &session_id).unwrap();

        let access = service.refresh(&pair.refresh_token).await.unwrap();
        let claims = service.verify(&access, TokenType::Access).await.unwrap();

        assert_eq!(claims.sub, user_id.to_string());
        assert_eq!(claims.sid, session_id);
    }

    #[tokio::test]
    async fn test_refresh_does_not_rotate_refresh_token() {
        let (_, service, user_id, session_id) = test_setup().await;
        let pair = service.issue_pair(user_id, &session_id).unwrap();

        service.refresh(&pair.refresh_token).await.unwrap();

        // The original refresh token keeps working
        service.refresh(&pair.refresh_token).await.unwrap();
    }

    #[tokio::test]
    async fn test_access_token_rejected_for_refresh() {
        let (_, service, user_id, session_id) = test_setup().await;
        let access = service.issue_access(user_id, &session_id).unwrap();

        let result = service.refresh(&access).await;
        assert!(matches!(result, Err(Error::InvalidToken { .. })));
    }

    #[tokio::test]
    async fn test_garbage_token_rejected() {
        let (_, service, _, _) = test_setup().await;
        let result = service.verify("not-a-token", TokenType::Access).await;
        assert!(matches!(result, Err(Error::InvalidToken { .. })));
    }

    #[tokio::test]
    async fn test_tampered_token_rejected() {
        let (_, service, user_id, session_id) = test_setup().await;
        let token = service.issue_access(user_id, &session_id).unwrap();

        let mut tampered = token.into_bytes();
        let last = tampered.len() - 1;
        tampered[last] = if tampered[last] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(tampered).unwrap();

        let result = service.verify(&tampered, TokenType::Access).await;
        assert!(matches!(result, Err(Error::InvalidToken { .. })));
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let (manager, service, user_id, session_id) = test_setup().await;
        let token = service.issue_access(user_id, &session_id).unwrap();

        let other = TokenService::new(
            TokenConfig {
                secret: "a-completely-different-signing-secret".to_string(),
                ..TokenConfig::default()
            },
            manager,
        );

        let result = other.verify(&token, TokenType::Access).await;
        assert!(matches!(result, Err(Error::InvalidToken { .. })));
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let (manager, _, user_id, session_id) = test_setup().await;

        // Negative TTL puts expiry beyond the default leeway in the past
        let service = TokenService::new(
            TokenConfig {
                access_ttl_secs: -120,
                ..TokenConfig::default()
            },
            manager,
        );

        let token = service.issue_access(user_id, &session_id).unwrap();
        let result = service.verify(&token, TokenType::Access).await;
        assert!(matches!(result, Err(Error::InvalidToken { .. })));
    }

    #[tokio::test]
    async fn test_verify_touches_session() {
        let (manager, service, user_id, session_id) = test_setup().await;
        let before = manager.sessions_for(user_id).await.unwrap()[0].last_activity;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let token = service.issue_access(user_id, &session_id).unwrap();
        service.verify(&token, TokenType::Access).await.unwrap();

        let after = manager.sessions_for(user_id).await.unwrap()[0].last_activity;
        assert!(after > before);
    }
}
