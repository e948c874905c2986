//! Identity resolution: match an observation against the contact graph,
//! merge the clusters it touches, and record whatever it adds.

use std::collections::BTreeSet;
use std::time::Duration;

use tracing::{debug, warn};

use crate::model::{
    ClusterView, ContactId, IdentifyRequest, IdentifyResponse, LinkPrecedence, NewContact,
    Observation,
};
use crate::store::{ContactStore, ContactTxn};
use crate::{RelinkError, Result};

/// Retry policy for transactions aborted by a concurrent writer.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the initial one).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Backoff doubles per retry and is capped here.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(500),
        }
    }
}

/// Resolves observations into customer clusters on top of a [`ContactStore`].
pub struct IdentityResolver<S> {
    store: S,
    retry: RetryConfig,
}

impl<S: ContactStore> IdentityResolver<S> {
    pub fn new(store: S) -> Self {
        Self::with_retry(store, RetryConfig::default())
    }

    pub fn with_retry(store: S, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Validate an inbound body and resolve it.
    pub fn identify(&self, req: IdentifyRequest) -> Result<IdentifyResponse> {
        let observation = Observation::try_from(req)?;
        let contact = self.resolve(&observation)?;
        Ok(IdentifyResponse { contact })
    }

    /// Resolve one observation in a single transaction.
    ///
    /// A [`RelinkError::Conflict`] aborts the attempt and the whole
    /// transaction is replayed from scratch, up to `max_attempts` times.
    /// Every other error is returned as-is with nothing written.
    pub fn resolve(&self, observation: &Observation) -> Result<ClusterView> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut delay = self.retry.base_delay;
        let mut attempt = 1;
        loop {
            match self.resolve_once(observation) {
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(
                        attempt,
                        max_attempts,
                        ?delay,
                        error = %e,
                        "contact transaction conflicted, retrying"
                    );
                    std::thread::sleep(delay);
                    delay = std::cmp::min(delay * 2, self.retry.max_delay);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn resolve_once(&self, observation: &Observation) -> Result<ClusterView> {
        let mut txn = self.store.begin()?;
        let view = resolve_in_txn(&mut txn, observation)?;
        txn.commit()?;
        Ok(view)
    }
}

/// Steps A-F of a resolve against an open transaction. The caller commits.
fn resolve_in_txn<T: ContactTxn>(txn: &mut T, observation: &Observation) -> Result<ClusterView> {
    let email = observation.email();
    let phone = observation.phone_number();

    let matches = txn.find_matching(email, phone)?;
    if matches.is_empty() {
        let contact = txn.create(NewContact::primary(email, phone))?;
        debug!(id = %contact.id, "created primary contact");
        return Ok(ClusterView::singleton(&contact));
    }

    let owning: BTreeSet<ContactId> = matches
        .iter()
        .map(|c| c.owning_primary())
        .collect::<Result<_>>()?;
    let owning: Vec<ContactId> = owning.into_iter().collect();

    let primaries = txn.find_by_ids(&owning)?;
    if primaries.len() != owning.len() {
        return Err(RelinkError::Corrupt(format!(
            "linked primary missing: wanted {owning:?}, found {} contact(s)",
            primaries.len()
        )));
    }
    if let Some(chained) = primaries.iter().find(|p| !p.is_primary()) {
        return Err(RelinkError::Corrupt(format!(
            "contact {} is linked to as a primary but is secondary",
            chained.id
        )));
    }

    let (canonical, absorbed) = primaries
        .split_first()
        .ok_or_else(|| RelinkError::Corrupt("matched contacts have no primary".into()))?;
    let canonical_id = canonical.id;

    for primary in absorbed {
        txn.update_link(primary.id, LinkPrecedence::Secondary, Some(canonical_id))?;
        txn.relink(primary.id, canonical_id)?;
        debug!(absorbed = %primary.id, into = %canonical_id, "merged clusters");
    }

    let cluster = txn.find_cluster(canonical_id)?;
    let email_known =
        email.is_none_or(|e| cluster.iter().any(|c| c.email.as_deref() == Some(e)));
    let phone_known =
        phone.is_none_or(|p| cluster.iter().any(|c| c.phone_number.as_deref() == Some(p)));

    if !email_known || !phone_known {
        let contact = txn.create(NewContact::secondary(email, phone, canonical_id))?;
        debug!(id = %contact.id, primary = %canonical_id, "created secondary contact");
    }

    let cluster = txn.find_cluster(canonical_id)?;
    Ok(ClusterView::from_cluster(canonical_id, &cluster))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
