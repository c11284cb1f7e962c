//! Bus-backed authentication and authorization.
//!
//! Identity is established by an external auth collaborator answering
//! `auth.validate`, `auth.session.extract`, `auth.strategy.<name>.extract`, and
//! `auth.check.roles`. Every failure path denies the request.

use std::time::Duration;

use modos_events::EventBus;
use modos_protocol::{
    AuthContext, AuthRequirement, AuthValidation, EventPayload, ExtractIdentity,
    IdentityExtraction, InboundRequest, RequestId, RoleCheck, RuntimeError, RuntimeResult,
    ValidateCredential, names,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::credentials::{Credential, extract_credential, parse_cookies};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthTimeouts {
    pub validate_ms: u64,
    pub extract_ms: u64,
    pub roles_ms: u64,
}

impl Default for AuthTimeouts {
    fn default() -> Self {
        Self {
            validate_ms: 5_000,
            extract_ms: 1_000,
            roles_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Authenticator {
    bus: EventBus,
    timeouts: AuthTimeouts,
}

impl Authenticator {
    pub fn new(bus: EventBus, timeouts: AuthTimeouts) -> Self {
        Self { bus, timeouts }
    }

    /// Establish and authorize an identity for a route that requires one.
    ///
    /// Returns `Ok(None)` for routes without an auth requirement.
    #[instrument(skip_all, fields(request_id = %request_id, path = %request.path))]
    pub async fn authenticate(
        &self,
        request: &InboundRequest,
        request_id: &RequestId,
        requirement: &AuthRequirement,
    ) -> RuntimeResult<Option<AuthContext>> {
        if !requirement.required {
            return Ok(None);
        }
        let context = match request.auth.clone() {
            Some(context) if context.user_id.is_some() => context,
            _ => self.establish(request, request_id, requirement).await?,
        };
        self.authorize(&context, requirement).await?;
        Ok(Some(context))
    }

    async fn establish(
        &self,
        request: &InboundRequest,
        request_id: &RequestId,
        requirement: &AuthRequirement,
    ) -> RuntimeResult<AuthContext> {
        if let Some(credential) = extract_credential(request) {
            return self.validate(&credential, request_id).await;
        }
        if requirement.session_based || !requirement.strategies.is_empty() {
            if let Some(context) = self.extract(request, request_id, requirement).await {
                return Ok(context);
            }
            return Err(RuntimeError::Authentication(
                "no session or strategy established an identity".to_owned(),
            ));
        }
        Err(RuntimeError::Authentication("missing credentials".to_owned()))
    }

    /// Validate a bearer credential via `auth.validate`.
    pub async fn validate(
        &self,
        credential: &Credential,
        request_id: &RequestId,
    ) -> RuntimeResult<AuthContext> {
        let query = EventPayload::ValidateCredential(ValidateCredential {
            token: credential.token.clone(),
            request_id: request_id.clone(),
        });
        let reply = self
            .bus
            .emit_and_wait(
                names::AUTH_VALIDATE,
                query,
                Duration::from_millis(self.timeouts.validate_ms),
            )
            .await
            .map_err(|error| {
                warn!(error = %error, "credential validation unavailable");
                RuntimeError::Authentication("credential could not be validated".to_owned())
            })?;

        let AuthValidation {
            valid,
            user_id,
            scopes,
            session_id,
            reason,
        } = match reply {
            EventPayload::AuthValidation(validation) => validation,
            other => {
                warn!(payload = other.kind(), "unexpected reply to auth.validate");
                return Err(RuntimeError::Authentication(
                    "credential could not be validated".to_owned(),
                ));
            }
        };
        if !valid {
            return Err(RuntimeError::Authentication(
                reason.unwrap_or_else(|| "invalid credential".to_owned()),
            ));
        }
        debug!(source = credential.source.as_str(), "credential validated");
        Ok(AuthContext {
            user_id,
            session_id,
            scopes,
            strategy: Some("bearer".to_owned()),
        })
    }

    /// Session extraction first (if allowed), then each strategy in order.
    async fn extract(
        &self,
        request: &InboundRequest,
        request_id: &RequestId,
        requirement: &AuthRequirement,
    ) -> Option<AuthContext> {
        let cookies = request
            .header("cookie")
            .map(parse_cookies)
            .unwrap_or_default();
        let mut attempts: Vec<(String, Option<String>)> = Vec::new();
        if requirement.session_based {
            attempts.push((names::AUTH_SESSION_EXTRACT.to_owned(), Some("session".to_owned())));
        }
        for strategy in &requirement.strategies {
            attempts.push((names::auth_strategy_extract(strategy), Some(strategy.clone())));
        }

        for (event, strategy) in attempts {
            let query = EventPayload::ExtractIdentity(ExtractIdentity {
                request_id: request_id.clone(),
                strategy: strategy.clone(),
                headers: request.headers.clone(),
                cookies: cookies.clone(),
                query: request.query.clone(),
            });
            match self
                .bus
                .emit_and_wait(&event, query, Duration::from_millis(self.timeouts.extract_ms))
                .await
            {
                Ok(EventPayload::IdentityExtraction(extraction)) if extraction.authenticated => {
                    debug!(event = %event, "identity extracted");
                    return Some(extraction.into_auth_context(strategy));
                }
                Ok(EventPayload::IdentityExtraction(IdentityExtraction { reason, .. })) => {
                    debug!(event = %event, reason = ?reason, "extraction did not authenticate");
                }
                Ok(other) => warn!(event = %event, payload = other.kind(), "unexpected extraction reply"),
                Err(error) => debug!(event = %event, error = %error, "extraction unavailable"),
            }
        }
        None
    }

    /// Role check via `auth.check.roles`, then a local scope check.
    pub async fn authorize(
        &self,
        context: &AuthContext,
        requirement: &AuthRequirement,
    ) -> RuntimeResult<()> {
        if !requirement.roles.is_empty() {
            let Some(user_id) = context.user_id.clone() else {
                return Err(RuntimeError::Authorization(
                    "role check requires a user identity".to_owned(),
                ));
            };
            let query = EventPayload::RoleCheck(RoleCheck {
                user_id,
                roles: requirement.roles.clone(),
            });
            let reply = self
                .bus
                .emit_and_wait(
                    names::AUTH_CHECK_ROLES,
                    query,
                    Duration::from_millis(self.timeouts.roles_ms),
                )
                .await
                .map_err(|error| {
                    warn!(error = %error, "role check unavailable");
                    RuntimeError::Authorization("roles could not be verified".to_owned())
                })?;
            match reply {
                EventPayload::RoleCheckResult(result) if result.has_roles => {}
                EventPayload::RoleCheckResult(_) => {
                    return Err(RuntimeError::Authorization(
                        "missing required roles".to_owned(),
                    ));
                }
                other => {
                    warn!(payload = other.kind(), "unexpected reply to auth.check.roles");
                    return Err(RuntimeError::Authorization(
                        "roles could not be verified".to_owned(),
                    ));
                }
            }
        }

        if let Some(missing) = requirement
            .scopes
            .iter()
            .find(|scope| !context.scopes.contains(scope))
        {
            return Err(RuntimeError::Authorization(format!(
                "missing required scope {missing}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modos_protocol::{Method, RoleCheckResult};

    fn timeouts() -> AuthTimeouts {
        AuthTimeouts {
            validate_ms: 200,
            extract_ms: 50,
            roles_ms: 200,
        }
    }

    /// Accepts the token "good" as user u-1 with scope "read" and role "admin".
    fn install_auth_collaborator(bus: &EventBus) {
        bus.on(names::AUTH_VALIDATE, |event| {
            if let EventPayload::ValidateCredential(query) = &event.payload {
                let valid = query.token == "good";
                event.reply(EventPayload::AuthValidation(AuthValidation {
                    valid,
                    user_id: valid.then(|| "u-1".to_owned()),
                    scopes: vec!["read".to_owned()],
                    session_id: None,
                    reason: (!valid).then(|| "token expired".to_owned()),
                }));
            }
            Ok(())
        });
        bus.on(names::AUTH_CHECK_ROLES, |event| {
            if let EventPayload::RoleCheck(query) = &event.payload {
                let has_roles = query.roles.iter().all(|role| role == "admin");
                event.reply(EventPayload::RoleCheckResult(RoleCheckResult { has_roles }));
            }
            Ok(())
        });
    }

    fn secure_request(token: Option<&str>) -> InboundRequest {
        let request = InboundRequest::new(Method::Get, "/secure");
        match token {
            Some(token) => request.with_header("authorization", format!("Bearer {token}")),
            None => request,
        }
    }

    #[tokio::test]
    async fn optional_routes_skip_auth() -> anyhow::Result<()> {
        let authenticator = Authenticator::new(EventBus::new(), timeouts());
        let context = authenticator
            .authenticate(
                &secure_request(None),
                &RequestId::new_uuid(),
                &AuthRequirement::default(),
            )
            .await?;
        assert!(context.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn valid_bearer_establishes_identity() -> anyhow::Result<()> {
        let bus = EventBus::new();
        install_auth_collaborator(&bus);
        let authenticator = Authenticator::new(bus, timeouts());
        let context = authenticator
            .authenticate(
                &secure_request(Some("good")),
                &RequestId::new_uuid(),
                &AuthRequirement::required().with_roles(["admin"]).with_scopes(["read"]),
            )
            .await?
            .expect("identity");
        assert_eq!(context.user_id.as_deref(), Some("u-1"));
        assert_eq!(context.strategy.as_deref(), Some("bearer"));
        Ok(())
    }

    #[tokio::test]
    async fn invalid_or_missing_credentials_are_401() {
        let bus = EventBus::new();
        install_auth_collaborator(&bus);
        let authenticator = Authenticator::new(bus, timeouts());
        let requirement = AuthRequirement::required();

        let error = authenticator
            .authenticate(&secure_request(Some("bad")), &RequestId::new_uuid(), &requirement)
            .await
            .unwrap_err();
        assert_eq!(error, RuntimeError::Authentication("token expired".into()));

        let error = authenticator
            .authenticate(&secure_request(None), &RequestId::new_uuid(), &requirement)
            .await
            .unwrap_err();
        assert_eq!(error.status_code(), 401);
    }

    #[tokio::test]
    async fn missing_auth_service_fails_closed() {
        let authenticator = Authenticator::new(EventBus::new(), timeouts());
        let error = authenticator
            .authenticate(
                &secure_request(Some("good")),
                &RequestId::new_uuid(),
                &AuthRequirement::required(),
            )
            .await
            .unwrap_err();
        assert_eq!(error.status_code(), 401);
    }

    #[tokio::test]
    async fn role_and_scope_failures_are_403() {
        let bus = EventBus::new();
        install_auth_collaborator(&bus);
        let authenticator = Authenticator::new(bus, timeouts());

        let error = authenticator
            .authenticate(
                &secure_request(Some("good")),
                &RequestId::new_uuid(),
                &AuthRequirement::required().with_roles(["owner"]),
            )
            .await
            .unwrap_err();
        assert_eq!(error, RuntimeError::Authorization("missing required roles".into()));

        let error = authenticator
            .authenticate(
                &secure_request(Some("good")),
                &RequestId::new_uuid(),
                &AuthRequirement::required().with_scopes(["write"]),
            )
            .await
            .unwrap_err();
        assert_eq!(error.status_code(), 403);
    }

    #[tokio::test]
    async fn session_extraction_is_used_without_bearer() -> anyhow::Result<()> {
        let bus = EventBus::new();
        bus.on(names::AUTH_SESSION_EXTRACT, |event| {
            if let EventPayload::ExtractIdentity(query) = &event.payload {
                let authenticated = query.cookies.get("session_id").map(String::as_str) == Some("s-1");
                event.reply(EventPayload::IdentityExtraction(IdentityExtraction {
                    authenticated,
                    user_id: Some("u-9".into()),
                    session_id: Some("s-1".into()),
                    ..IdentityExtraction::default()
                }));
            }
            Ok(())
        });
        let authenticator = Authenticator::new(bus, timeouts());
        let request = secure_request(None).with_header("cookie", "session_id=s-1");
        let context = authenticator
            .authenticate(
                &request,
                &RequestId::new_uuid(),
                &AuthRequirement::required().session_based(),
            )
            .await?
            .expect("identity");
        assert_eq!(context.user_id.as_deref(), Some("u-9"));
        assert_eq!(context.strategy.as_deref(), Some("session"));
        Ok(())
    }

    #[tokio::test]
    async fn silent_strategy_times_out_and_fails_closed() {
        let bus = EventBus::new();
        bus.on(names::auth_strategy_extract("github"), |_| Ok(()));
        let authenticator = Authenticator::new(bus, timeouts());
        let error = authenticator
            .authenticate(
                &secure_request(None),
                &RequestId::new_uuid(),
                &AuthRequirement::required().with_strategies(["github"]),
            )
            .await
            .unwrap_err();
        assert_eq!(error.status_code(), 401);
    }
}
