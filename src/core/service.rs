//! Credential lifecycle operations
//!
//! The only code that mutates credential rows. Every transition writes its
//! audit entry in the same critical section, and every transition into a
//! terminal status adds the key to the reject set before the lock is released.

use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashSet;

use crate::core::credential::{AuditEntry, AuditEvent, Credential, CredentialStatus};
use crate::core::state::CoreState;
use crate::error::{AppError, Result};
use crate::games::GameType;
use crate::logger::log;

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

impl CoreState {
    /// Ports held by live (`pending` or `active`) credentials.
    pub fn held_ports(&self) -> HashSet<u16> {
        self.keys
            .all()
            .iter()
            .filter(|c| c.status.is_live())
            .map(|c| c.remote_port)
            .collect()
    }

    /// Issue a new credential: allocate a port, generate key material, insert
    /// as `pending`, derive the proxy name from the assigned id, audit.
    pub fn create_credential(
        &mut self,
        user_id: &str,
        user_name: &str,
        group_id: Option<&str>,
        game_type: GameType,
        ttl_minutes: i64,
        now: DateTime<Utc>,
    ) -> Result<Credential> {
        let held = self.held_ports();
        let remote_port = self.allocator.allocate(&held)?;

        // 128 bits of CSPRNG entropy behind the prefix; tunnel id is the
        // short human-facing handle.
        let mut key = format!("{}{}", self.config.key_prefix, random_hex(16));
        while self.keys.find_by(|c| c.key == key).is_some() {
            key = format!("{}{}", self.config.key_prefix, random_hex(16));
        }
        let mut tunnel_id = format!("T-{}", random_hex(4));
        while self.keys.find_by(|c| c.tunnel_id == tunnel_id).is_some() {
            tunnel_id = format!("T-{}", random_hex(4));
        }

        let inserted = self.keys.insert(Credential {
            id: 0,
            tunnel_id,
            key,
            user_id: user_id.to_string(),
            user_name: user_name.to_string(),
            group_id: group_id.map(str::to_string),
            game_type,
            status: CredentialStatus::Pending,
            remote_port,
            proxy_name: String::new(),
            client_id: None,
            created_at: now,
            activated_at: None,
            expires_at: now + Duration::minutes(ttl_minutes),
            updated_at: now,
        })?;

        let proxy_name = format!("ff-{}-{}", inserted.id, game_type.abbrev());
        let created = self
            .keys
            .update(inserted.id, |c| c.proxy_name = proxy_name.clone())?
            .ok_or_else(|| AppError::Store("created row vanished".to_string()))?;

        self.append_audit(
            AuditEvent::KeyCreated,
            Some(created.id),
            format!(
                "tunnel {} port {} for {}",
                created.tunnel_id, created.remote_port, created.user_id
            ),
            now,
        );

        log::info!(
            id = created.id,
            tunnel = %created.tunnel_id,
            port = created.remote_port,
            game = game_type.id(),
            "Credential created"
        );
        Ok(created)
    }

    /// Classify a key for the client API. Read-only except for the lazy
    /// `pending` past-deadline expiry.
    pub fn validate_key(&mut self, key: &str, now: DateTime<Utc>) -> Result<Credential> {
        let Some(cred) = self.keys.find_by(|c| c.key == key).cloned() else {
            return Err(AppError::KeyNotFound);
        };

        match cred.status {
            CredentialStatus::Pending => {
                if cred.expires_at <= now {
                    self.expire_credential(cred.id, now)?;
                    return Err(AppError::KeyExpired);
                }
                Ok(cred)
            }
            CredentialStatus::Active => Err(AppError::KeyAlreadyUsed),
            CredentialStatus::Expired => Err(AppError::KeyExpired),
            CredentialStatus::Revoked => Err(AppError::KeyRevoked),
            CredentialStatus::Disconnected => Err(AppError::KeyDisconnected),
        }
    }

    /// Transition `pending -> active`, capturing the daemon's run id. Returns
    /// `None` when the record is not `pending`.
    pub fn activate_credential(
        &mut self,
        key: &str,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Credential>> {
        let Some(cred) = self.keys.find_by(|c| c.key == key) else {
            return Ok(None);
        };
        if cred.status != CredentialStatus::Pending {
            return Ok(None);
        }

        // Narrow the activation race: re-read by id before committing.
        let id = cred.id;
        let Some(current) = self.keys.find_by_id(id) else {
            return Ok(None);
        };
        if current.status != CredentialStatus::Pending {
            return Ok(None);
        }

        let client_id = client_id.to_string();
        let updated = self.keys.update(id, |c| {
            c.status = CredentialStatus::Active;
            c.client_id = Some(client_id.clone());
            c.activated_at = Some(now);
            c.updated_at = now;
        })?;

        if let Some(ref cred) = updated {
            self.append_audit(
                AuditEvent::KeyActivated,
                Some(cred.id),
                format!("client {}", cred.client_id.as_deref().unwrap_or("")),
                now,
            );
            log::transition(cred.id, "pending", "active");
        }
        Ok(updated)
    }

    /// Transition a live credential to `expired`.
    pub fn expire_credential(&mut self, id: i64, now: DateTime<Utc>) -> Result<Option<Credential>> {
        self.terminate(id, CredentialStatus::Expired, AuditEvent::KeyExpired, now)
    }

    /// Transition a live credential to `revoked` (admin kick).
    pub fn revoke_credential(&mut self, id: i64, now: DateTime<Utc>) -> Result<Option<Credential>> {
        self.terminate(id, CredentialStatus::Revoked, AuditEvent::KeyRevoked, now)
    }

    /// Transition an `active` credential to `disconnected` (CloseProxy).
    pub fn disconnect_credential(
        &mut self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Credential>> {
        let Some(cred) = self.keys.find_by(|c| c.key == key) else {
            return Ok(None);
        };
        let id = cred.id;
        self.terminate(
            id,
            CredentialStatus::Disconnected,
            AuditEvent::KeyDisconnected,
            now,
        )
    }

    /// Guarded transition into a terminal status; no-op when the lifecycle
    /// graph has no such edge from the current status.
    fn terminate(
        &mut self,
        id: i64,
        to: CredentialStatus,
        event: AuditEvent,
        now: DateTime<Utc>,
    ) -> Result<Option<Credential>> {
        let Some(cred) = self.keys.find_by_id(id) else {
            return Ok(None);
        };
        let from = cred.status;
        if !from.can_transition_to(to) {
            return Ok(None);
        }

        let updated = self.keys.update(id, |c| {
            c.status = to;
            c.updated_at = now;
        })?;

        if let Some(ref cred) = updated {
            self.reject.add(&cred.key, now);
            self.append_audit(event, Some(cred.id), cred.tunnel_id.clone(), now);
            log::transition(cred.id, from.as_str(), to.as_str());
        }
        Ok(updated)
    }

    /// Append an audit row. Audit persistence failures are logged, not
    /// propagated: the state transition they describe already happened.
    pub fn append_audit(
        &mut self,
        event: AuditEvent,
        key_id: Option<i64>,
        details: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        if let Err(e) = self.audit.insert(AuditEntry::new(event, key_id, details, now)) {
            log::error!(error = %e, "Audit append failed");
        }
    }

    // Queries

    pub fn get_by_key(&self, key: &str) -> Option<&Credential> {
        self.keys.find_by(|c| c.key == key)
    }

    pub fn get_by_tunnel_id(&self, tunnel_id: &str) -> Option<&Credential> {
        self.keys.find_by(|c| c.tunnel_id == tunnel_id)
    }

    pub fn get_active_by_user(&self, user_id: &str) -> Vec<&Credential> {
        self.keys
            .filter(|c| c.status.is_live() && c.user_id == user_id)
    }

    pub fn get_active_by_group(&self, group_id: &str) -> Vec<&Credential> {
        self.keys
            .filter(|c| c.status.is_live() && c.group_id.as_deref() == Some(group_id))
    }

    pub fn get_all_active(&self) -> Vec<&Credential> {
        self.keys.filter(|c| c.status.is_live())
    }
}
