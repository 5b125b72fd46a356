//! Routing decisions for both directions.
//!
//! - Outbound (client → bus): which topic an envelope is published to.
//! - Inbound (bus → clients): which registered sessions receive an envelope.
//!
//! The router only decides. Publishing and socket writes happen in the hub.

use std::collections::HashMap;

use crate::error::{GatewayError, Result};
use crate::protocol::{Envelope, Role};
use crate::registry::{ClientId, ClientRegistry};

/// Table key used for envelopes that carry a payload and no action.
pub const BUSINESS_ACTION: &str = "business";

/// Table key used for bare presence/handshake envelopes with no action.
pub const LIFECYCLE_ACTION: &str = "lifecycle";

/// Produce topic selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicRoutes {
    /// Payload → `business`, no payload → `lifecycle`.
    Fixed { business: String, lifecycle: String },
    /// Routing key → topic. The key is the envelope's action, or
    /// [`BUSINESS_ACTION`] / [`LIFECYCLE_ACTION`] when it has none.
    Table(HashMap<String, String>),
}

/// Sessions selected for one inbound envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipients {
    /// The addressed recipient is live; nobody else receives it.
    Unicast(ClientId),
    /// Every matching session, each listed once.
    FanOut(Vec<ClientId>),
}

impl Recipients {
    pub fn len(&self) -> usize {
        match self {
            Recipients::Unicast(_) => 1,
            Recipients::FanOut(ids) => ids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Routes envelopes between sessions and bus topics.
#[derive(Debug, Clone)]
pub struct MessageRouter {
    routes: TopicRoutes,
}

impl MessageRouter {
    pub fn new(routes: TopicRoutes) -> Self {
        Self { routes }
    }

    /// Topic an outbound envelope is published to.
    pub fn outbound_topic(&self, envelope: &Envelope) -> Result<&str> {
        match &self.routes {
            TopicRoutes::Fixed {
                business,
                lifecycle,
            } => Ok(if envelope.has_payload() {
                business.as_str()
            } else {
                lifecycle.as_str()
            }),
            TopicRoutes::Table(table) => {
                let key = match envelope.action.as_deref().filter(|a| !a.is_empty()) {
                    Some(action) => action,
                    None if envelope.has_payload() => BUSINESS_ACTION,
                    None => LIFECYCLE_ACTION,
                };
                table
                    .get(key)
                    .map(String::as_str)
                    .ok_or_else(|| GatewayError::UnmappedAction(key.to_string()))
            }
        }
    }

    /// Sessions an inbound envelope is delivered to.
    ///
    /// A live addressed recipient wins outright. Otherwise every session
    /// matching at least one fan-out rule is selected once.
    pub fn recipients(&self, envelope: &Envelope, registry: &ClientRegistry) -> Recipients {
        if let Some(id) = envelope.recipient() {
            if registry.get(&id).is_some() {
                return Recipients::Unicast(id);
            }
        }

        Recipients::FanOut(
            registry
                .iter()
                .filter(|session| fan_out_matches(envelope, session.role))
                .map(|session| session.id)
                .collect(),
        )
    }
}

/// Fan-out rules. Any match selects the session.
fn fan_out_matches(envelope: &Envelope, role: Role) -> bool {
    if let Some(payload) = &envelope.payload {
        if payload.is_block() {
            return true;
        }
        if payload.target_partner().is_some_and(|code| role.matches(code)) {
            return true;
        }
    }

    envelope
        .declared_type()
        .is_some_and(|declared| role.matches(declared))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Payload;
    use crate::registry::Connection;
    use axum::extract::ws::Message;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn fixed() -> MessageRouter {
        MessageRouter::new(TopicRoutes::Fixed {
            business: "ledger.in".to_string(),
            lifecycle: "presence".to_string(),
        })
    }

    fn registry_with(roles: &[Role]) -> (ClientRegistry, Vec<ClientId>, Vec<mpsc::Receiver<Message>>) {
        let mut registry = ClientRegistry::new();
        let mut ids = Vec::new();
        let mut receivers = Vec::new();
        for role in roles {
            let (tx, rx) = mpsc::channel(4);
            let id = registry
                .register(Connection {
                    role: *role,
                    tx,
                    closed: CancellationToken::new(),
                })
                .unwrap();
            ids.push(id);
            receivers.push(rx);
        }
        (registry, ids, receivers)
    }

    fn fan_out(recipients: Recipients) -> Vec<ClientId> {
        match recipients {
            Recipients::FanOut(mut ids) => {
                ids.sort();
                ids
            }
            Recipients::Unicast(id) => panic!("unexpected unicast to {}", id),
        }
    }

    fn sorted(mut ids: Vec<ClientId>) -> Vec<ClientId> {
        ids.sort();
        ids
    }

    #[test]
    fn test_fixed_routes_by_payload_presence() {
        let router = fixed();
        let payloads = [
            Payload::Block("halt".to_string()),
            Payload::Employees(vec![]),
            Payload::EnrollmentReq(serde_json::json!({"FPInfo": {"FPCode": "FPA"}})),
        ];
        for payload in payloads {
            let envelope = Envelope {
                action: Some("ignored".to_string()),
                payload: Some(payload),
                ..Default::default()
            };
            assert_eq!(router.outbound_topic(&envelope).unwrap(), "ledger.in");
        }

        let bare = Envelope {
            kind: Some("FPA".to_string()),
            ..Default::default()
        };
        assert_eq!(router.outbound_topic(&bare).unwrap(), "presence");
    }

    #[test]
    fn test_table_routes_by_action() {
        let router = MessageRouter::new(TopicRoutes::Table(HashMap::from([
            ("enroll".to_string(), "enrollments".to_string()),
            (BUSINESS_ACTION.to_string(), "ledger.in".to_string()),
            (LIFECYCLE_ACTION.to_string(), "presence".to_string()),
        ])));

        let explicit = Envelope {
            action: Some("enroll".to_string()),
            ..Default::default()
        };
        assert_eq!(router.outbound_topic(&explicit).unwrap(), "enrollments");

        let with_payload = Envelope {
            payload: Some(Payload::Block("b".to_string())),
            ..Default::default()
        };
        assert_eq!(router.outbound_topic(&with_payload).unwrap(), "ledger.in");
        assert_eq!(
            router.outbound_topic(&Envelope::default()).unwrap(),
            "presence"
        );

        let unknown = Envelope {
            action: Some("refund".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            router.outbound_topic(&unknown),
            Err(GatewayError::UnmappedAction(action)) if action == "refund"
        ));
    }

    #[test]
    fn test_unicast_precedence() {
        let (registry, ids, _rx) = registry_with(&[Role::Fpa, Role::Fpa]);
        let envelope = Envelope {
            cid: Some(ids[0].to_string()),
            kind: Some("FPA".to_string()),
            payload: Some(Payload::Block("halt".to_string())),
            ..Default::default()
        };
        assert_eq!(
            fixed().recipients(&envelope, &registry),
            Recipients::Unicast(ids[0])
        );
    }

    #[test]
    fn test_offline_recipient_falls_back_to_fan_out() {
        let (registry, ids, _rx) = registry_with(&[Role::Fpa, Role::Fpb]);
        let envelope = Envelope {
            cid: Some(uuid::Uuid::new_v4().to_string()),
            kind: Some("FPB".to_string()),
            ..Default::default()
        };
        assert_eq!(fan_out(fixed().recipients(&envelope, &registry)), vec![ids[1]]);
    }

    #[test]
    fn test_fan_out_by_declared_type() {
        let (registry, ids, _rx) = registry_with(&[Role::Fpa, Role::Fpb, Role::Fpa]);
        let envelope = Envelope {
            kind: Some("FPA".to_string()),
            ..Default::default()
        };
        assert_eq!(
            fan_out(fixed().recipients(&envelope, &registry)),
            sorted(vec![ids[0], ids[2]])
        );
    }

    #[test]
    fn test_fan_out_by_enrollment_partner() {
        let (registry, ids, _rx) = registry_with(&[Role::Ra, Role::Fpb, Role::Fpa]);
        let envelope: Envelope = serde_json::from_str(
            r#"{"Payload":{"EnrollmentApproval":{"FPInfo":{"FPCode":"FPB"}}}}"#,
        )
        .unwrap();
        assert_eq!(fan_out(fixed().recipients(&envelope, &registry)), vec![ids[1]]);
    }

    #[test]
    fn test_block_reaches_everyone_once() {
        let (registry, ids, _rx) = registry_with(&[Role::Ra, Role::Fpa, Role::Fpb]);
        let envelope = Envelope {
            kind: Some("FPA".to_string()),
            payload: Some(Payload::Block("halt".to_string())),
            ..Default::default()
        };
        assert_eq!(
            fan_out(fixed().recipients(&envelope, &registry)),
            sorted(ids)
        );
    }

    #[test]
    fn test_no_rule_matches() {
        let (registry, _ids, _rx) = registry_with(&[Role::Ra, Role::Fpa]);
        let envelope = Envelope {
            kind: Some("".to_string()),
            payload: Some(Payload::Employee(serde_json::json!({"docType": "emp"}))),
            ..Default::default()
        };
        assert!(fixed().recipients(&envelope, &registry).is_empty());
    }
}
