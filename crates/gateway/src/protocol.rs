//! Wire format shared by WebSocket clients and the event bus.
//!
//! Both directions carry the same JSON [`Envelope`]. Business payloads are
//! opaque to the gateway: only the payload variant tag (and the partner code of
//! an enrollment approval) takes part in routing, everything else passes
//! through untouched.

use serde::{de::Error as _, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

use crate::registry::ClientId;

// ============================================================================
// Roles
// ============================================================================

/// Class of client bound to a connection at upgrade time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Record administrator.
    Ra,
    /// Fund partner A.
    Fpa,
    /// Fund partner B.
    Fpb,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Ra, Role::Fpa, Role::Fpb];

    /// Tag compared against `Type` and partner codes during fan-out.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Ra => "RA",
            Role::Fpa => "FPA",
            Role::Fpb => "FPB",
        }
    }

    /// WebSocket path serving this role.
    pub fn path(&self) -> &'static str {
        match self {
            Role::Ra => "/ra",
            Role::Fpa => "/fpa",
            Role::Fpb => "/fpb",
        }
    }

    /// Exact, case-sensitive tag match. Empty tags never match.
    pub fn matches(&self, tag: &str) -> bool {
        !tag.is_empty() && tag == self.as_str()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// Message unit exchanged between clients and the bus.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Origin identity (client → bus) or recipient identity (bus → client).
    #[serde(rename = "CID", default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    /// Display name.
    #[serde(rename = "Username", default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Declared role/type, matched against session role tags.
    #[serde(rename = "Type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Organisation code.
    #[serde(rename = "OrgCode", default, skip_serializing_if = "Option::is_none")]
    pub org_code: Option<String>,
    /// Explicit routing key for table-driven produce topics.
    #[serde(rename = "Action", default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Business payload, at most one variant.
    #[serde(
        rename = "Payload",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "empty_payload_as_none"
    )]
    pub payload: Option<Payload>,
}

impl Envelope {
    /// Parse a wire frame.
    pub fn from_frame(frame: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(frame)
    }

    /// Overwrite the identity field with the server-assigned one.
    pub fn stamp(&mut self, id: ClientId) {
        self.cid = Some(id.to_string());
    }

    /// Recipient identity, if the `CID` field holds a well-formed id.
    pub fn recipient(&self) -> Option<ClientId> {
        self.cid
            .as_deref()
            .and_then(|cid| Uuid::parse_str(cid).ok())
    }

    /// Non-empty declared type.
    pub fn declared_type(&self) -> Option<&str> {
        self.kind.as_deref().filter(|t| !t.is_empty())
    }

    pub fn has_payload(&self) -> bool {
        self.payload.is_some()
    }
}

/// `null`, a missing field and `{}` all mean "no payload".
fn empty_payload_as_none<'de, D>(deserializer: D) -> Result<Option<Payload>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Value::Object(map)) if map.is_empty() => Ok(None),
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(D::Error::custom),
    }
}

// ============================================================================
// Payload
// ============================================================================

/// Tagged business payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    EnrollmentReq(Value),
    EnrollmentApproval(EnrollmentApproval),
    #[serde(rename = "ChangeFPReq")]
    ChangeFpReq(Value),
    #[serde(rename = "ChangeFPApproval")]
    ChangeFpApproval(Value),
    /// Single record broadcast.
    Employee(Value),
    /// Raw block broadcast, delivered to every session.
    Block(String),
    /// Record list.
    Employees(Vec<Value>),
}

impl Payload {
    /// Variant tag as it appears on the wire.
    pub fn tag(&self) -> &'static str {
        match self {
            Payload::EnrollmentReq(_) => "EnrollmentReq",
            Payload::EnrollmentApproval(_) => "EnrollmentApproval",
            Payload::ChangeFpReq(_) => "ChangeFPReq",
            Payload::ChangeFpApproval(_) => "ChangeFPApproval",
            Payload::Employee(_) => "Employee",
            Payload::Block(_) => "Block",
            Payload::Employees(_) => "Employees",
        }
    }

    /// Partner code an enrollment approval is addressed to.
    pub fn target_partner(&self) -> Option<&str> {
        match self {
            Payload::EnrollmentApproval(approval) => approval.partner_code(),
            _ => None,
        }
    }

    pub fn is_block(&self) -> bool {
        matches!(self, Payload::Block(_))
    }
}

/// Enrollment approval. Only the partner code is interpreted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentApproval {
    #[serde(rename = "FPInfo", default, skip_serializing_if = "Option::is_none")]
    pub partner: Option<PartnerInfo>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl EnrollmentApproval {
    pub fn partner_code(&self) -> Option<&str> {
        self.partner
            .as_ref()
            .and_then(|p| p.code.as_deref())
            .filter(|code| !code.is_empty())
    }
}

/// Fund partner descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartnerInfo {
    #[serde(rename = "FPCode", default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}
