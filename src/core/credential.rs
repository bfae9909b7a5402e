//! Credential and audit records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::games::GameType;
use crate::store::Record;

/// Lifecycle status of a credential.
///
/// Transitions only move forward: `pending -> {active, expired, revoked}`,
/// `active -> {expired, revoked, disconnected}`. Terminal states are sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Pending,
    Active,
    Expired,
    Revoked,
    Disconnected,
}

impl CredentialStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CredentialStatus::Expired | CredentialStatus::Revoked | CredentialStatus::Disconnected
        )
    }

    /// Live credentials hold their allocated port.
    pub fn is_live(&self) -> bool {
        matches!(self, CredentialStatus::Pending | CredentialStatus::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialStatus::Pending => "pending",
            CredentialStatus::Active => "active",
            CredentialStatus::Expired => "expired",
            CredentialStatus::Revoked => "revoked",
            CredentialStatus::Disconnected => "disconnected",
        }
    }

    /// Whether the edge `self -> to` exists in the lifecycle graph.
    pub fn can_transition_to(&self, to: CredentialStatus) -> bool {
        use CredentialStatus::*;
        matches!(
            (self, to),
            (Pending, Active)
                | (Pending, Expired)
                | (Pending, Revoked)
                | (Active, Expired)
                | (Active, Revoked)
                | (Active, Disconnected)
        )
    }
}

/// One issued access key and everything known about its tunnel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub id: i64,
    pub tunnel_id: String,
    pub key: String,
    pub user_id: String,
    pub user_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub game_type: GameType,
    pub status: CredentialStatus,
    pub remote_port: u16,
    pub proxy_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    /// Minutes until expiry, floored at zero.
    pub fn remaining_minutes(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_minutes().max(0)
    }
}

impl Record for Credential {
    fn id(&self) -> i64 {
        self.id
    }
    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
}

/// Audit event kinds. The log is append-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    KeyCreated,
    KeyActivated,
    KeyExpired,
    KeyRevoked,
    KeyDisconnected,
    ProxyOpened,
    ProxyClosed,
    ClientRejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: i64,
    pub event_type: AuditEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_id: Option<i64>,
    pub details: String,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        event_type: AuditEvent,
        key_id: Option<i64>,
        details: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            event_type,
            key_id,
            details: details.into(),
            created_at: now,
        }
    }
}

impl Record for AuditEntry {
    fn id(&self) -> i64 {
        self.id
    }
    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
}
