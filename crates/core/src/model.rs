//! Contact records, observations, and the consolidated cluster view.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{RelinkError, Result};

const MISSING_FIELDS: &str = "At least one of email or phoneNumber is required";

// ---------------------------------------------------------------------------
// Contact
// ---------------------------------------------------------------------------

/// Store-assigned contact identifier.
///
/// Ids come from a counter bumped inside the serialized write transaction,
/// so they are strictly increasing in insertion order. That makes the id a
/// total tie-break for contacts sharing a `created_at` timestamp.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ContactId(pub u64);

impl std::fmt::Display for ContactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a contact within its cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkPrecedence {
    /// The oldest member; the cluster's canonical representative.
    Primary,
    /// Any other member. Always links straight at the primary.
    Secondary,
}

/// One stored contact row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: ContactId,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub link_precedence: LinkPrecedence,
    /// Set iff `link_precedence` is `Secondary`; names the cluster primary.
    pub linked_id: Option<ContactId>,
    pub created_at: DateTime<Utc>,
    /// Refreshed when a merge demotes or re-points this contact.
    pub updated_at: DateTime<Utc>,
}

impl Contact {
    pub fn is_primary(&self) -> bool {
        self.link_precedence == LinkPrecedence::Primary
    }

    /// Id of the primary this contact belongs to: itself, or its `linked_id`.
    pub fn owning_primary(&self) -> Result<ContactId> {
        match self.link_precedence {
            LinkPrecedence::Primary => Ok(self.id),
            LinkPrecedence::Secondary => self.linked_id.ok_or_else(|| {
                RelinkError::Corrupt(format!("secondary contact {} has no linked id", self.id))
            }),
        }
    }

    /// Ordering used for every "oldest wins" decision.
    pub fn sort_key(&self) -> (DateTime<Utc>, ContactId) {
        (self.created_at, self.id)
    }
}

/// Fields supplied when creating a contact. The store assigns id and timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewContact {
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub link_precedence: LinkPrecedence,
    pub linked_id: Option<ContactId>,
}

impl NewContact {
    pub fn primary(email: Option<&str>, phone_number: Option<&str>) -> Self {
        Self {
            email: email.map(str::to_string),
            phone_number: phone_number.map(str::to_string),
            link_precedence: LinkPrecedence::Primary,
            linked_id: None,
        }
    }

    pub fn secondary(
        email: Option<&str>,
        phone_number: Option<&str>,
        primary_id: ContactId,
    ) -> Self {
        Self {
            email: email.map(str::to_string),
            phone_number: phone_number.map(str::to_string),
            link_precedence: LinkPrecedence::Secondary,
            linked_id: Some(primary_id),
        }
    }
}

// ---------------------------------------------------------------------------
// Observation
// ---------------------------------------------------------------------------

/// A caller-supplied email/phone pair with at least one field present.
///
/// Values are kept byte-for-byte; an empty string counts as "not supplied".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    email: Option<String>,
    phone_number: Option<String>,
}

impl Observation {
    pub fn new(email: Option<String>, phone_number: Option<String>) -> Result<Self> {
        let email = email.filter(|e| !e.is_empty());
        let phone_number = phone_number.filter(|p| !p.is_empty());
        if email.is_none() && phone_number.is_none() {
            return Err(RelinkError::InvalidInput(MISSING_FIELDS.to_string()));
        }
        Ok(Self {
            email,
            phone_number,
        })
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn phone_number(&self) -> Option<&str> {
        self.phone_number.as_deref()
    }
}

/// Inbound `identify` body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
}

impl TryFrom<IdentifyRequest> for Observation {
    type Error = RelinkError;

    fn try_from(req: IdentifyRequest) -> Result<Self> {
        Observation::new(req.email, req.phone_number)
    }
}

// ---------------------------------------------------------------------------
// Cluster view
// ---------------------------------------------------------------------------

/// Consolidated view of one cluster, as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterView {
    pub primary_contact_id: ContactId,
    pub emails: Vec<String>,
    pub phone_numbers: Vec<String>,
    pub secondary_contact_ids: Vec<ContactId>,
}

impl ClusterView {
    /// View of a freshly created primary with no other members.
    pub fn singleton(contact: &Contact) -> Self {
        Self {
            primary_contact_id: contact.id,
            emails: contact.email.iter().cloned().collect(),
            phone_numbers: contact.phone_number.iter().cloned().collect(),
            secondary_contact_ids: Vec::new(),
        }
    }

    /// Build the view from cluster members already sorted oldest first.
    ///
    /// Emails and phone numbers keep first-appearance order with duplicates
    /// removed.
    pub fn from_cluster(primary_id: ContactId, members: &[Contact]) -> Self {
        let mut emails: Vec<String> = Vec::new();
        let mut phone_numbers: Vec<String> = Vec::new();
        let mut secondary_contact_ids = Vec::new();

        for contact in members {
            if let Some(email) = &contact.email {
                if !emails.contains(email) {
                    emails.push(email.clone());
                }
            }
            if let Some(phone) = &contact.phone_number {
                if !phone_numbers.contains(phone) {
                    phone_numbers.push(phone.clone());
                }
            }
            if !contact.is_primary() {
                secondary_contact_ids.push(contact.id);
            }
        }

        Self {
            primary_contact_id: primary_id,
            emails,
            phone_numbers,
            secondary_contact_ids,
        }
    }
}

/// Success envelope for `identify`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyResponse {
    pub contact: ClusterView,
}
