//! Remote Call Authority Table
//!
//! Every procedure has a caller rule (who may issue it) and a receiver rule
//! (where it may run). Both are checked before any handler touches state.
//!
//! | procedure            | caller       | receiver     |
//! |----------------------|--------------|--------------|
//! | `apply_state`        | entity owner | not owner    |
//! | `take_damage`        | any peer     | owns subject |
//! | `add_kill`           | any peer     | owns subject |
//! | `set_remaining_time` | host         | anyone       |
//! | `announce_result`    | host         | anyone       |
//! | `spawn_entity`       | host         | anyone       |
//! | `despawn_entity`     | host         | anyone       |
//!
//! `add_kill` is additionally checked against the receiver's hit ledger: the
//! caller must own an entity this peer recently hit.

use std::collections::BTreeMap;

use crate::game::entity::PeerId;
use crate::network::protocol::RemoteCall;

/// Who may issue a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerRule {
    /// Only the session host.
    HostOnly,
    /// Only the owner of the subject entity.
    EntityOwner,
    /// Any connected peer.
    AnyPeer,
}

/// Where a call may execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverRule {
    /// Any peer.
    Anyone,
    /// Only on the owner of the subject entity.
    OwnsSubject,
    /// Anywhere except the owner of the subject entity.
    NotOwner,
}

/// Policy for one procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcPolicy {
    /// Caller rule.
    pub caller: CallerRule,
    /// Receiver rule.
    pub receiver: ReceiverRule,
}

/// A forged or misdirected call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthorityViolation {
    /// No policy registered for the procedure.
    #[error("unknown procedure {0}")]
    UnknownProcedure(String),

    /// Host-only call from a client.
    #[error("{call} from peer {origin} requires host authority")]
    NotHost {
        /// Procedure.
        call: &'static str,
        /// Caller.
        origin: PeerId,
    },

    /// Caller does not own the subject entity.
    #[error("{call} from peer {origin} but entity {entity} is owned by {owner:?}")]
    NotOwner {
        /// Procedure.
        call: &'static str,
        /// Caller.
        origin: PeerId,
        /// Subject entity.
        entity: PeerId,
        /// Actual owner, if tracked.
        owner: Option<PeerId>,
    },

    /// Call must run on the subject's owner, and this peer is not it.
    #[error("{call} for entity {entity} delivered to non-owner {local}")]
    WrongReceiver {
        /// Procedure.
        call: &'static str,
        /// Subject entity.
        entity: PeerId,
        /// This peer.
        local: PeerId,
    },

    /// Remote update aimed at an entity this peer owns.
    #[error("{call} from peer {origin} targets locally owned entity {entity}")]
    LocallyOwned {
        /// Procedure.
        call: &'static str,
        /// Caller.
        origin: PeerId,
        /// Subject entity.
        entity: PeerId,
    },

    /// Attacker named in the call is not the caller.
    #[error("take_damage from peer {origin} claims attacker {claimed}")]
    ForgedAttacker {
        /// Caller.
        origin: PeerId,
        /// Claimed attacker.
        claimed: PeerId,
    },

    /// Kill credit from a peer this one never hit.
    #[error("add_kill from peer {origin} for {attacker} has no matching hit")]
    UnbackedKill {
        /// Caller.
        origin: PeerId,
        /// Entity that would be credited.
        attacker: PeerId,
    },

    /// Envelope origin does not match the link it arrived on.
    #[error("envelope claims origin {claimed} but arrived from peer {link}")]
    SpoofedOrigin {
        /// Claimed origin.
        claimed: PeerId,
        /// Actual sender.
        link: PeerId,
    },
}

/// Procedure name → policy.
#[derive(Debug, Clone)]
pub struct RpcTable {
    policies: BTreeMap<&'static str, RpcPolicy>,
}

impl Default for RpcTable {
    fn default() -> Self {
        use CallerRule::*;
        use ReceiverRule::*;

        let mut table = Self { policies: BTreeMap::new() };
        table.register("apply_state", EntityOwner, NotOwner);
        table.register("take_damage", AnyPeer, OwnsSubject);
        table.register("add_kill", AnyPeer, OwnsSubject);
        table.register("set_remaining_time", HostOnly, Anyone);
        table.register("announce_result", HostOnly, Anyone);
        table.register("spawn_entity", HostOnly, Anyone);
        table.register("despawn_entity", HostOnly, Anyone);
        table
    }
}

impl RpcTable {
    /// Register (or replace) a policy.
    pub fn register(&mut self, name: &'static str, caller: CallerRule, receiver: ReceiverRule) {
        self.policies.insert(name, RpcPolicy { caller, receiver });
    }

    /// Look up a policy.
    pub fn policy(&self, name: &str) -> Option<RpcPolicy> {
        self.policies.get(name).copied()
    }

    /// Check only the caller rule. The host runs this before relaying.
    pub fn check_caller(
        &self,
        call: &RemoteCall,
        origin: PeerId,
        subject_owner: Option<PeerId>,
    ) -> Result<RpcPolicy, AuthorityViolation> {
        let name = call.name();
        let policy = self
            .policy(name)
            .ok_or_else(|| AuthorityViolation::UnknownProcedure(name.to_string()))?;
        let entity = call.subject().unwrap_or_default();

        match policy.caller {
            CallerRule::HostOnly if !origin.is_host() => {
                Err(AuthorityViolation::NotHost { call: name, origin })
            }
            CallerRule::EntityOwner if subject_owner != Some(origin) => {
                Err(AuthorityViolation::NotOwner { call: name, origin, entity, owner: subject_owner })
            }
            _ => Ok(policy),
        }
    }

    /// Check `call` from `origin` executing on `local`.
    ///
    /// `subject_owner` is the owner of `call.subject()` as tracked locally.
    pub fn check(
        &self,
        call: &RemoteCall,
        origin: PeerId,
        local: PeerId,
        subject_owner: Option<PeerId>,
    ) -> Result<(), AuthorityViolation> {
        let policy = self.check_caller(call, origin, subject_owner)?;
        let name = call.name();
        let entity = call.subject().unwrap_or_default();

        match policy.receiver {
            ReceiverRule::OwnsSubject if subject_owner != Some(local) => {
                Err(AuthorityViolation::WrongReceiver { call: name, entity, local })
            }
            ReceiverRule::NotOwner if subject_owner == Some(local) => {
                Err(AuthorityViolation::LocallyOwned { call: name, origin, entity })
            }
            _ => Ok(()),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::entity::FieldDelta;

    fn state(entity: u32) -> RemoteCall {
        RemoteCall::ApplyState { entity: PeerId(entity), seq: 1, delta: FieldDelta::default() }
    }

    #[test]
    fn test_apply_state_owner_only() {
        let table = RpcTable::default();
        let host = PeerId::HOST;

        // Peer 2 updating its own entity, received on host
        assert!(table.check(&state(2), PeerId(2), host, Some(PeerId(2))).is_ok());

        // Peer 3 forging peer 2's state
        assert!(matches!(
            table.check(&state(2), PeerId(3), host, Some(PeerId(2))),
            Err(AuthorityViolation::NotOwner { .. })
        ));

        // Echo of our own entity is refused
        assert!(matches!(
            table.check(&state(2), PeerId(2), PeerId(2), Some(PeerId(2))),
            Err(AuthorityViolation::LocallyOwned { .. })
        ));
    }

    #[test]
    fn test_take_damage_runs_on_owner() {
        let table = RpcTable::default();
        let call = RemoteCall::TakeDamage { entity: PeerId(2), amount: 25, attacker: PeerId(3) };

        assert!(table.check(&call, PeerId(3), PeerId(2), Some(PeerId(2))).is_ok());
        assert_eq!(
            table.check(&call, PeerId(3), PeerId::HOST, Some(PeerId(2))),
            Err(AuthorityViolation::WrongReceiver { call: "take_damage", entity: PeerId(2), local: PeerId::HOST })
        );
    }

    #[test]
    fn test_host_only_calls() {
        let table = RpcTable::default();
        let call = RemoteCall::SetRemainingTime { seconds: 12.0 };

        assert!(table.check(&call, PeerId::HOST, PeerId(2), None).is_ok());
        assert_eq!(
            table.check(&call, PeerId(3), PeerId(2), None),
            Err(AuthorityViolation::NotHost { call: "set_remaining_time", origin: PeerId(3) })
        );
    }

    #[test]
    fn test_unknown_procedure() {
        let mut table = RpcTable::default();
        table.policies.remove("add_kill");
        let call = RemoteCall::AddKill { attacker: PeerId(2) };
        assert_eq!(
            table.check(&call, PeerId(2), PeerId(2), Some(PeerId(2))),
            Err(AuthorityViolation::UnknownProcedure("add_kill".to_string()))
        );
    }
}
