//! Authorization pipeline run on every mutating request: authentication
//! presence, rate limiting, and a fail-closed participant check, with an
//! admin-role gate and a self-operation short-circuit for routes that need
//! them.
//!
//! JWT verification itself is someone else's job — this crate is handed an
//! already-verified [`Principal`] and decides whether the request proceeds.

mod rate_limit;

use std::time::Duration;

use async_trait::async_trait;
use wavelet_errors::{Error, ErrorCode, Result};
use wavelet_observability::Metrics;
use wavelet_participant_cache::ParticipantCache;

pub use rate_limit::RateLimiter;

/// The authenticated principal upstream middleware attaches to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub device_id: String,
    pub session_id: String,
    pub scope: Vec<String>,
    pub iat: i64,
    pub exp: i64,
}

/// The read port a [`ParticipantCache`] miss falls back to: the actual
/// source of truth for a conversation's active participants and their
/// roles. Roles aren't part of the cached entry (the data model only
/// caches the membership set), so role lookups always go through here.
#[async_trait]
pub trait ParticipantSource: Send + Sync {
    async fn active_participants(&self, conversation_id: &str) -> Result<Vec<String>>;
    async fn role_of(&self, conversation_id: &str, user_id: &str) -> Result<Option<String>>;
}

/// What a single request needs the pipeline to decide. Framework-agnostic
/// on purpose: the axum layer that extracts these fields from a live
/// request lives in the server crate, not here.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub route: String,
    pub principal: Option<Principal>,
    pub conversation_id: Option<String>,
    pub target_user_id: Option<String>,
    pub requires_admin: bool,
    pub is_public: bool,
}

#[derive(Debug, Clone)]
pub struct AuthDecision {
    pub principal: Principal,
    pub role: Option<String>,
}

pub struct AuthzMiddleware {
    participant_cache: std::sync::Arc<ParticipantCache>,
    participant_source: std::sync::Arc<dyn ParticipantSource>,
    rate_limiter: RateLimiter,
    metrics: Metrics,
    denial_log_sample_rate: f64,
}

impl AuthzMiddleware {
    pub fn new(
        participant_cache: std::sync::Arc<ParticipantCache>,
        participant_source: std::sync::Arc<dyn ParticipantSource>,
        metrics: Metrics,
    ) -> Self {
        Self {
            participant_cache,
            participant_source,
            rate_limiter: RateLimiter::new(100, Duration::from_secs(60)),
            metrics,
            denial_log_sample_rate: 0.01,
        }
    }

    pub fn with_rate_limit(mut self, limit: u32, window: Duration) -> Self {
        self.rate_limiter = RateLimiter::new(limit, window);
        self
    }

    /// Runs the pipeline. `Ok(None)` means the route is public and the
    /// request proceeds unauthenticated.
    pub async fn authorize(&self, ctx: &RequestContext) -> Result<Option<AuthDecision>> {
        if ctx.is_public {
            return Ok(None);
        }

        let principal = ctx
            .principal
            .clone()
            .ok_or_else(|| Error::new(ErrorCode::Unauthorized, "authentication required"))?;

        let outcome = self.rate_limiter.check(&principal.user_id, &ctx.route).await;
        if !outcome.allowed {
            return Err(Error::new(ErrorCode::QuotaExceeded, "rate limit exceeded")
                .with_metadata(serde_json::json!({"retryAfterMs": outcome.retry_after_ms})));
        }

        let Some(conversation_id) = ctx.conversation_id.as_deref() else {
            // No conversation in scope (e.g. creating a top-level resource);
            // nothing to check membership against.
            return Ok(Some(AuthDecision { principal, role: None }));
        };

        let is_member = self.participant_membership(conversation_id, &principal.user_id).await?;

        if !is_member {
            self.log_denial_sampled(&principal.user_id, conversation_id, "NOT_A_PARTICIPANT");
            return Err(Error::new(ErrorCode::Forbidden, "not a participant in this conversation")
                .with_metadata(serde_json::json!({"reason": "NOT_A_PARTICIPANT"})));
        }

        if ctx.requires_admin {
            let self_operation = ctx
                .target_user_id
                .as_deref()
                .is_some_and(|target| target == principal.user_id);

            if !self_operation {
                let role = self
                    .participant_source
                    .role_of(conversation_id, &principal.user_id)
                    .await?;
                let is_admin = matches!(role.as_deref(), Some("admin") | Some("owner"));
                if !is_admin {
                    self.log_denial_sampled(&principal.user_id, conversation_id, "NOT_ADMIN");
                    return Err(Error::new(ErrorCode::Forbidden, "admin role required")
                        .with_metadata(serde_json::json!({"reason": "NOT_ADMIN"})));
                }
                return Ok(Some(AuthDecision { principal, role }));
            }
        }

        Ok(Some(AuthDecision { principal, role: None }))
    }

    async fn participant_membership(&self, conversation_id: &str, user_id: &str) -> Result<bool> {
        let cached = self.participant_cache.get(conversation_id).await?;
        if !cached.is_empty() {
            return Ok(cached.iter().any(|id| id == user_id));
        }

        match self.participant_source.active_participants(conversation_id).await {
            Ok(active) => {
                self.participant_cache.set(conversation_id, active.clone()).await?;
                Ok(active.iter().any(|id| id == user_id))
            }
            Err(err) => {
                self.metrics.counter("participant_cache_errors_total", "source_query_failed");
                tracing::warn!(error = %err, conversation_id, "participant source query failed, denying fail-closed");
                Ok(false)
            }
        }
    }

    fn log_denial_sampled(&self, user_id: &str, conversation_id: &str, reason: &str) {
        if rand::random::<f64>() < self.denial_log_sample_rate {
            tracing::info!(user_id, conversation_id, reason, "authorization denial (sampled)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wavelet_participant_cache::InMemoryVersionStore;

    struct FakeSource {
        active: Vec<String>,
        roles: std::collections::HashMap<String, String>,
        fail: bool,
    }

    #[async_trait]
    impl ParticipantSource for FakeSource {
        async fn active_participants(&self, _conversation_id: &str) -> Result<Vec<String>> {
            if self.fail {
                return Err(Error::transient("source unavailable"));
            }
            Ok(self.active.clone())
        }

        async fn role_of(&self, _conversation_id: &str, user_id: &str) -> Result<Option<String>> {
            Ok(self.roles.get(user_id).cloned())
        }
    }

    fn principal(user_id: &str) -> Principal {
        Principal {
            user_id: user_id.to_string(),
            device_id: "d1".to_string(),
            session_id: "s1".to_string(),
            scope: vec!["messages:write".to_string()],
            iat: 0,
            exp: i64::MAX,
        }
    }

    fn middleware(source: FakeSource) -> AuthzMiddleware {
        let cache = ParticipantCache::new(
            std::sync::Arc::new(InMemoryVersionStore::new()),
            Metrics::new("participant_cache"),
        );
        AuthzMiddleware::new(cache, std::sync::Arc::new(source), Metrics::new("authz"))
    }

    #[tokio::test]
    async fn public_route_skips_authentication() {
        let mw = middleware(FakeSource { active: vec![], roles: Default::default(), fail: false });
        let ctx = RequestContext {
            route: "GET /healthz".to_string(),
            principal: None,
            conversation_id: None,
            target_user_id: None,
            requires_admin: false,
            is_public: true,
        };
        assert!(mw.authorize(&ctx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_principal_is_unauthorized() {
        let mw = middleware(FakeSource { active: vec![], roles: Default::default(), fail: false });
        let ctx = RequestContext {
            route: "POST /messages".to_string(),
            principal: None,
            conversation_id: Some("c1".to_string()),
            target_user_id: None,
            requires_admin: false,
            is_public: false,
        };
        let err = mw.authorize(&ctx).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Unauthorized);
    }

    #[tokio::test]
    async fn non_participant_is_forbidden() {
        let mw = middleware(FakeSource {
            active: vec!["u2".to_string()],
            roles: Default::default(),
            fail: false,
        });
        let ctx = RequestContext {
            route: "POST /messages".to_string(),
            principal: Some(principal("u1")),
            conversation_id: Some("c1".to_string()),
            target_user_id: None,
            requires_admin: false,
            is_public: false,
        };
        let err = mw.authorize(&ctx).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Forbidden);
        assert_eq!(err.metadata["reason"], "NOT_A_PARTICIPANT");
    }

    #[tokio::test]
    async fn participant_is_allowed() {
        let mw = middleware(FakeSource {
            active: vec!["u1".to_string(), "u2".to_string()],
            roles: Default::default(),
            fail: false,
        });
        let ctx = RequestContext {
            route: "POST /messages".to_string(),
            principal: Some(principal("u1")),
            conversation_id: Some("c1".to_string()),
            target_user_id: None,
            requires_admin: false,
            is_public: false,
        };
        assert!(mw.authorize(&ctx).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn source_query_failure_denies_fail_closed() {
        let mw = middleware(FakeSource { active: vec![], roles: Default::default(), fail: true });
        let ctx = RequestContext {
            route: "POST /messages".to_string(),
            principal: Some(principal("u1")),
            conversation_id: Some("c1".to_string()),
            target_user_id: None,
            requires_admin: false,
            is_public: false,
        };
        let err = mw.authorize(&ctx).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Forbidden);
    }

    #[tokio::test]
    async fn self_operation_bypasses_admin_role_check() {
        let mw = middleware(FakeSource {
            active: vec!["u1".to_string()],
            roles: Default::default(),
            fail: false,
        });
        let ctx = RequestContext {
            route: "DELETE /conversations/c1/participants/u1".to_string(),
            principal: Some(principal("u1")),
            conversation_id: Some("c1".to_string()),
            target_user_id: Some("u1".to_string()),
            requires_admin: true,
            is_public: false,
        };
        assert!(mw.authorize(&ctx).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn non_admin_is_forbidden_on_admin_route() {
        let mut roles = std::collections::HashMap::new();
        roles.insert("u1".to_string(), "member".to_string());
        let mw = middleware(FakeSource {
            active: vec!["u1".to_string(), "u2".to_string()],
            roles,
            fail: false,
        });
        let ctx = RequestContext {
            route: "DELETE /conversations/c1/participants/u2".to_string(),
            principal: Some(principal("u1")),
            conversation_id: Some("c1".to_string()),
            target_user_id: Some("u2".to_string()),
            requires_admin: true,
            is_public: false,
        };
        let err = mw.authorize(&ctx).await.unwrap_err();
        assert_eq!(err.metadata["reason"], "NOT_ADMIN");
    }

    #[tokio::test]
    async fn admin_role_is_allowed_on_admin_route() {
        let mut roles = std::collections::HashMap::new();
        roles.insert("u1".to_string(), "admin".to_string());
        let mw = middleware(FakeSource {
            active: vec!["u1".to_string(), "u2".to_string()],
            roles,
            fail: false,
        });
        let ctx = RequestContext {
            route: "DELETE /conversations/c1/participants/u2".to_string(),
            principal: Some(principal("u1")),
            conversation_id: Some("c1".to_string()),
            target_user_id: Some("u2".to_string()),
            requires_admin: true,
            is_public: false,
        };
        assert!(mw.authorize(&ctx).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rate_limit_denies_after_threshold() {
        let mw = middleware(FakeSource {
            active: vec!["u1".to_string()],
            roles: Default::default(),
            fail: false,
        })
        .with_rate_limit(1, Duration::from_secs(60));
        let ctx = RequestContext {
            route: "POST /messages".to_string(),
            principal: Some(principal("u1")),
            conversation_id: Some("c1".to_string()),
            target_user_id: None,
            requires_admin: false,
            is_public: false,
        };
        assert!(mw.authorize(&ctx).await.unwrap().is_some());
        let err = mw.authorize(&ctx).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::QuotaExceeded);
    }
}
