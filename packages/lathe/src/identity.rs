//! Identity collaborator contract: authenticated actor assertions.
//!
//! The engine never validates credentials itself; it consumes assertions the
//! identity provider already verified. Operator paths (DLQ replay/purge)
//! additionally require a fresh second-factor assertion.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;
use crate::error::EngineError;
use crate::job::OwnerId;

/// How recent a second-factor verification must be for operator actions.
pub const SECOND_FACTOR_MAX_AGE_MINUTES: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecondFactorMethod {
    Totp,
    WebAuthn,
    Sms,
}

/// Proof that the actor recently completed a second factor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondFactor {
    pub method: SecondFactorMethod,
    pub verified_at: DateTime<Utc>,
}

/// Authenticated actor for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorAssertion {
    pub actor_id: OwnerId,
    pub second_factor: Option<SecondFactor>,
}

impl ActorAssertion {
    pub fn user(actor_id: OwnerId) -> Self {
        Self {
            actor_id,
            second_factor: None,
        }
    }

    pub fn operator(actor_id: OwnerId, second_factor: SecondFactor) -> Self {
        Self {
            actor_id,
            second_factor: Some(second_factor),
        }
    }

    /// Audit actor string, e.g. `user:42`.
    pub fn audit_actor(&self) -> String {
        format!("user:{}", self.actor_id)
    }
}

/// Authorization decisions consumed by the engine.
#[async_trait]
pub trait Identity: Send + Sync {
    /// May `actor` observe and mutate jobs belonging to `owner`?
    async fn authorize_owner(
        &self,
        actor: &ActorAssertion,
        owner: OwnerId,
    ) -> Result<(), EngineError>;

    /// May `actor` use operator paths (DLQ replay, purge)? Requires a fresh
    /// second factor.
    async fn authorize_operator(&self, actor: &ActorAssertion) -> Result<(), EngineError>;
}

/// Role-list backed identity: owners act on their own jobs, listed operators
/// act on anything.
pub struct StaticIdentity {
    operators: HashSet<OwnerId>,
    clock: SharedClock,
}

impl StaticIdentity {
    pub fn new(operators: impl IntoIterator<Item = OwnerId>, clock: SharedClock) -> Self {
        Self {
            operators: operators.into_iter().collect(),
            clock,
        }
    }

    fn is_operator(&self, actor_id: OwnerId) -> bool {
        self.operators.contains(&actor_id)
    }
}

#[async_trait]
impl Identity for StaticIdentity {
    async fn authorize_owner(
        &self,
        actor: &ActorAssertion,
        owner: OwnerId,
    ) -> Result<(), EngineError> {
        if actor.actor_id == owner || self.is_operator(actor.actor_id) {
            Ok(())
        } else {
            Err(EngineError::Forbidden)
        }
    }

    async fn authorize_operator(&self, actor: &ActorAssertion) -> Result<(), EngineError> {
        if !self.is_operator(actor.actor_id) {
            return Err(EngineError::Forbidden);
        }
        let second_factor = actor
            .second_factor
            .as_ref()
            .ok_or(EngineError::Unauthorized)?;
        let age = self.clock.now() - second_factor.verified_at;
        if age > Duration::minutes(SECOND_FACTOR_MAX_AGE_MINUTES) {
            return Err(EngineError::Unauthorized);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use std::sync::Arc;

    fn identity() -> (Arc<ManualClock>, StaticIdentity) {
        let clock = Arc::new(ManualClock::fixed());
        let identity = StaticIdentity::new([99], clock.clone());
        (clock, identity)
    }

    #[tokio::test]
    async fn owners_act_on_their_own_jobs_only() {
        let (_, identity) = identity();
        let actor = ActorAssertion::user(42);
        assert!(identity.authorize_owner(&actor, 42).await.is_ok());
        assert!(matches!(
            identity.authorize_owner(&actor, 43).await,
            Err(EngineError::Forbidden)
        ));
    }

    #[tokio::test]
    async fn operators_may_observe_any_owner() {
        let (clock, identity) = identity();
        let operator = ActorAssertion::operator(
            99,
            SecondFactor {
                method: SecondFactorMethod::Totp,
                verified_at: clock.now(),
            },
        );
        assert!(identity.authorize_owner(&operator, 42).await.is_ok());
    }

    #[tokio::test]
    async fn operator_path_requires_fresh_second_factor() {
        let (clock, identity) = identity();

        let no_second_factor = ActorAssertion::user(99);
        assert!(matches!(
            identity.authorize_operator(&no_second_factor).await,
            Err(EngineError::Unauthorized)
        ));

        let fresh = ActorAssertion::operator(
            99,
            SecondFactor {
                method: SecondFactorMethod::WebAuthn,
                verified_at: clock.now(),
            },
        );
        assert!(identity.authorize_operator(&fresh).await.is_ok());

        let stale = ActorAssertion::operator(
            99,
            SecondFactor {
                method: SecondFactorMethod::WebAuthn,
                verified_at: clock.now() - Duration::minutes(SECOND_FACTOR_MAX_AGE_MINUTES + 1),
            },
        );
        assert!(matches!(
            identity.authorize_operator(&stale).await,
            Err(EngineError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn non_operators_never_pass_the_operator_gate() {
        let (clock, identity) = identity();
        let pretender = ActorAssertion::operator(
            42,
            SecondFactor {
                method: SecondFactorMethod::Sms,
                verified_at: clock.now(),
            },
        );
        assert!(matches!(
            identity.authorize_operator(&pretender).await,
            Err(EngineError::Forbidden)
        ));
    }
}
