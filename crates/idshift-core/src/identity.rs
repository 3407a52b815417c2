//! Username allocation across both creation pathways.
//!
//! Uniqueness is owned by the shared [`IdentityLedger`]: a username is
//! reserved there before the routed pathway is called. The reservation is
//! released again only when the pathway definitely refused; after a timeout or
//! 5xx it stays, since the remote side may hold the name. Whichever pathway
//! the flag selects, two callers can never both end up owning the same name.

use std::sync::Arc;

use chrono::Utc;
use idshift_events::Bus;
use idshift_topics::{TOPIC_IDENTITY_CREATED, TOPIC_IDENTITY_REJECTED, TOPIC_IDENTITY_VERIFIED};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::MigrationError;
use crate::model::{Identity, Pathway};
use crate::pathway::AllocationPathway;
use crate::resolver::FlagResolver;
use crate::store::IdentityLedger;

/// Errors after which the pathway is known not to hold the name.
fn refused(err: &MigrationError) -> bool {
    matches!(
        err,
        MigrationError::Conflict(_) | MigrationError::Rejected { .. } | MigrationError::Validation { .. }
    )
}

static USERNAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9._-]{3,64}$").expect("username pattern compiles"));

/// Lowercase ASCII letters, digits, `.`, `_` or `-`, 3 to 64 characters.
pub fn validate_username(username: &str) -> bool {
    USERNAME_PATTERN.is_match(username)
}

fn require_valid(username: &str) -> Result<(), MigrationError> {
    if validate_username(username) {
        Ok(())
    } else {
        Err(MigrationError::Validation {
            field: "username",
            value: username.to_string(),
            reason: "expected 3-64 of [a-z0-9._-]".to_string(),
        })
    }
}

#[derive(Clone)]
pub struct IdentityAllocator {
    ledger: Arc<dyn IdentityLedger>,
    resolver: FlagResolver,
    flag_name: String,
    domain: String,
    legacy: Arc<dyn AllocationPathway>,
    function: Arc<dyn AllocationPathway>,
    bus: Option<Bus>,
}

impl IdentityAllocator {
    pub fn new(
        ledger: Arc<dyn IdentityLedger>,
        resolver: FlagResolver,
        flag_name: impl Into<String>,
        domain: impl Into<String>,
        legacy: Arc<dyn AllocationPathway>,
        function: Arc<dyn AllocationPathway>,
    ) -> Self {
        Self {
            ledger,
            resolver,
            flag_name: flag_name.into(),
            domain: domain.into(),
            legacy,
            function,
            bus: None,
        }
    }

    pub fn with_bus(mut self, bus: Bus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn validate(&self, username: &str) -> bool {
        validate_username(username)
    }

    /// Pathway new requests are sent to right now.
    pub async fn route(&self) -> Pathway {
        if self.resolver.resolve(&self.flag_name).await {
            Pathway::Function
        } else {
            Pathway::Legacy
        }
    }

    fn pathway(&self, which: Pathway) -> &Arc<dyn AllocationPathway> {
        match which {
            Pathway::Legacy => &self.legacy,
            Pathway::Function => &self.function,
        }
    }

    /// Advisory only: a later `create` can still lose a race for the name.
    pub async fn check(&self, username: &str) -> Result<bool, MigrationError> {
        require_valid(username)?;
        if self.ledger.find_identity(username).await?.is_some() {
            return Ok(false);
        }
        let route = self.route().await;
        self.pathway(route).check(username).await
    }

    pub async fn get(&self, username: &str) -> Result<Option<Identity>, MigrationError> {
        self.ledger.find_identity(username).await
    }

    pub async fn create(
        &self,
        username: &str,
        display_name: &str,
        owner_id: &str,
    ) -> Result<Identity, MigrationError> {
        require_valid(username)?;
        if owner_id.trim().is_empty() {
            return Err(MigrationError::Validation {
                field: "owner",
                value: owner_id.to_string(),
                reason: "must not be empty".to_string(),
            });
        }

        let route = self.route().await;
        let identity = Identity {
            username: username.to_string(),
            display_name: display_name.to_string(),
            owner_id: owner_id.to_string(),
            domain: self.domain.clone(),
            verified: false,
            created_at: Utc::now(),
            pathway: route,
        };

        if let Err(err) = self.ledger.reserve(&identity).await {
            if matches!(err, MigrationError::Conflict(_)) {
                self.rejected(&identity, &err);
            }
            return Err(err);
        }

        if let Err(err) = self.pathway(route).create(&identity).await {
            if refused(&err) {
                match self.ledger.release(username).await {
                    Ok(_) => debug!(username, pathway = %route, "reservation released"),
                    Err(release_err) => warn!(
                        username,
                        pathway = %route,
                        error = %release_err,
                        "failed to release reservation after pathway error"
                    ),
                }
            } else {
                warn!(
                    target: "idshift.audit",
                    username,
                    pathway = %route,
                    error = %err,
                    "pathway outcome unknown; reservation kept until reconciled"
                );
            }
            self.rejected(&identity, &err);
            return Err(err);
        }

        info!(
            target: "idshift.audit",
            username = %identity.username,
            owner = %identity.owner_id,
            pathway = %route,
            "identity created"
        );
        if let Some(bus) = &self.bus {
            bus.publish(
                TOPIC_IDENTITY_CREATED,
                &json!({
                    "username": identity.username,
                    "ownerId": identity.owner_id,
                    "pathway": route.as_str(),
                }),
            );
        }
        Ok(identity)
    }

    pub async fn mark_verified(&self, username: &str) -> Result<Identity, MigrationError> {
        require_valid(username)?;
        let identity = self
            .ledger
            .set_verified(username, true)
            .await?
            .ok_or_else(|| MigrationError::NotFound(format!("identity `{username}`")))?;
        info!(target: "idshift.audit", username, "identity verified");
        if let Some(bus) = &self.bus {
            bus.publish(TOPIC_IDENTITY_VERIFIED, &json!({"username": username}));
        }
        Ok(identity)
    }

    fn rejected(&self, identity: &Identity, err: &MigrationError) {
        info!(
            target: "idshift.audit",
            username = %identity.username,
            pathway = %identity.pathway,
            reason = err.code(),
            "identity rejected"
        );
        if let Some(bus) = &self.bus {
            bus.publish(
                TOPIC_IDENTITY_REJECTED,
                &json!({
                    "username": identity.username,
                    "pathway": identity.pathway.as_str(),
                    "reason": err.code(),
                }),
            );
        }
    }
}
