//! relink — embedded contact identity resolution.
//!
//! Partial customer records (an email, a phone number, or both) are kept in
//! a contact graph of **clusters**. Each cluster has exactly one primary
//! contact, its oldest member, and every other member links straight at
//! that primary. Resolving a new observation either finds the cluster it
//! belongs to, extends it, merges the clusters it bridges, or starts a new
//! one. Each resolve is one ACID transaction (backed by `redb`).
//!
//! # Quick start
//!
//! ```rust,no_run
//! use relink::{ContactGraph, IdentifyRequest, IdentityResolver};
//!
//! let resolver = IdentityResolver::new(ContactGraph::open("contacts.redb").unwrap());
//!
//! let resp = resolver
//!     .identify(IdentifyRequest {
//!         email: Some("doc@hillvalley.edu".into()),
//!         phone_number: Some("123456".into()),
//!     })
//!     .unwrap();
//! assert!(resp.contact.secondary_contact_ids.is_empty());
//! ```

mod model;
mod resolver;
mod store;

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, SubsecRound, Utc};
use redb::{
    Database, MultimapTableDefinition, ReadableDatabase, ReadableMultimapTable, ReadableTable,
    TableDefinition,
};

pub use model::{
    ClusterView, Contact, ContactId, IdentifyRequest, IdentifyResponse, LinkPrecedence,
    NewContact, Observation,
};
pub use resolver::{IdentityResolver, RetryConfig};
pub use store::{ContactStore, ContactTxn};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RelinkError {
    /// The observation carries neither an email nor a phone number.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The transaction was aborted by a concurrent writer and may be retried.
    #[error("store conflict: {0}")]
    Conflict(String),
    /// The store could not be reached (I/O failure, file locked elsewhere).
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    /// Stored links break the one-primary, one-hop cluster shape.
    #[error("corrupt contact graph: {0}")]
    Corrupt(String),
}

impl RelinkError {
    /// Only write conflicts are worth replaying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RelinkError::Conflict(_))
    }
}

impl From<redb::StorageError> for RelinkError {
    fn from(e: redb::StorageError) -> Self {
        match e {
            redb::StorageError::Io(io) => RelinkError::Unavailable(io.to_string()),
            other => RelinkError::Storage(other.to_string()),
        }
    }
}
impl From<redb::DatabaseError> for RelinkError {
    fn from(e: redb::DatabaseError) -> Self {
        match e {
            redb::DatabaseError::DatabaseAlreadyOpen => {
                RelinkError::Unavailable("database already open".to_string())
            }
            redb::DatabaseError::Storage(inner) => inner.into(),
            other => RelinkError::Storage(other.to_string()),
        }
    }
}
impl From<redb::TransactionError> for RelinkError {
    fn from(e: redb::TransactionError) -> Self {
        match e {
            redb::TransactionError::Storage(inner) => inner.into(),
            other => RelinkError::Storage(other.to_string()),
        }
    }
}
impl From<redb::TableError> for RelinkError {
    fn from(e: redb::TableError) -> Self {
        match e {
            redb::TableError::Storage(inner) => inner.into(),
            other => RelinkError::Storage(other.to_string()),
        }
    }
}
impl From<redb::CommitError> for RelinkError {
    fn from(e: redb::CommitError) -> Self {
        match e {
            redb::CommitError::Storage(inner) => inner.into(),
            other => RelinkError::Storage(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RelinkError>;

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Contact rows as JSON, keyed by contact id.
const CONTACTS: TableDefinition<u64, &str> = TableDefinition::new("contacts");
/// Id allocator and creation clock. Keys: [`CONTACT_ID_KEY`], [`CREATED_AT_KEY`].
const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");
const EMAIL_INDEX: MultimapTableDefinition<&str, u64> =
    MultimapTableDefinition::new("email_index");
const PHONE_INDEX: MultimapTableDefinition<&str, u64> =
    MultimapTableDefinition::new("phone_index");
/// Primary id -> ids of the secondaries linked to it.
const LINKS: MultimapTableDefinition<u64, u64> = MultimapTableDefinition::new("links");

const CONTACT_ID_KEY: &str = "contact_id";
/// Last assigned `created_at`, in microseconds since the epoch.
const CREATED_AT_KEY: &str = "created_at_micros";

/// Embedded contact store.
///
/// All writes happen inside [`ContactGraphTxn`]s handed out by
/// [`ContactStore::begin`]. redb admits one write transaction at a time, so
/// every resolve runs serializably: two callers can never both see "no
/// match" for the same new fact and each create a primary for it. Because
/// of that this store never reports [`RelinkError::Conflict`]; the retry
/// path exists for stores that do.
///
/// # Example
///
/// ```rust,no_run
/// use relink::{ContactGraph, IdentityResolver, Observation};
///
/// let graph = ContactGraph::open_in_memory().unwrap();
/// let resolver = IdentityResolver::new(graph);
/// let obs = Observation::new(Some("a@x.com".into()), None).unwrap();
/// let view = resolver.resolve(&obs).unwrap();
/// assert_eq!(view.emails, vec!["a@x.com"]);
/// ```
pub struct ContactGraph {
    db: Database,
}

impl ContactGraph {
    /// Open or create a contact store at the given path.
    pub fn open(path: &str) -> Result<Self> {
        let db = Database::create(path)?;
        Self::init(db)
    }

    /// Create an in-memory store (no file I/O). Data is lost on drop.
    pub fn open_in_memory() -> Result<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(backend)?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self> {
        {
            let write_txn = db.begin_write()?;
            write_txn.open_table(CONTACTS)?;
            write_txn.open_table(COUNTERS)?;
            write_txn.open_multimap_table(EMAIL_INDEX)?;
            write_txn.open_multimap_table(PHONE_INDEX)?;
            write_txn.open_multimap_table(LINKS)?;
            write_txn.commit()?;
        }
        Ok(Self { db })
    }

    /// Retrieve a contact by id.
    pub fn contact(&self, id: ContactId) -> Result<Contact> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CONTACTS)?;
        read_contact(&table, id)?.ok_or_else(|| RelinkError::NotFound(format!("contact id {id}")))
    }

    /// Every stored contact, oldest first.
    pub fn all_contacts(&self) -> Result<Vec<Contact>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CONTACTS)?;
        let mut contacts = Vec::new();
        for entry in table.iter()? {
            let (_k, v) = entry?;
            contacts.push(serde_json::from_str::<Contact>(v.value())?);
        }
        contacts.sort_by_key(Contact::sort_key);
        Ok(contacts)
    }

    /// Consolidated view of the cluster containing `id`, which may name any
    /// member. Read-only.
    pub fn cluster_view(&self, id: ContactId) -> Result<ClusterView> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CONTACTS)?;
        let links = read_txn.open_multimap_table(LINKS)?;

        let contact = read_contact(&table, id)?
            .ok_or_else(|| RelinkError::NotFound(format!("contact id {id}")))?;
        let primary_id = contact.owning_primary()?;
        let members = read_cluster(&table, &links, primary_id)?;
        Ok(ClusterView::from_cluster(primary_id, &members))
    }

    /// Walk the whole graph and report the first broken cluster invariant.
    ///
    /// Checks that every contact carries an email or phone, that `linked_id`
    /// is set exactly on secondaries, that it names an existing primary
    /// older than the secondary, and that the link index agrees.
    pub fn check_invariants(&self) -> Result<()> {
        // Rows and link index must come from the same snapshot.
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CONTACTS)?;
        let links = read_txn.open_multimap_table(LINKS)?;
        let mut by_id: BTreeMap<ContactId, Contact> = BTreeMap::new();
        for entry in table.iter()? {
            let (_k, v) = entry?;
            let contact = serde_json::from_str::<Contact>(v.value())?;
            by_id.insert(contact.id, contact);
        }

        for contact in by_id.values() {
            let id = contact.id;
            if contact.email.is_none() && contact.phone_number.is_none() {
                return Err(RelinkError::Corrupt(format!(
                    "contact {id} has neither email nor phone"
                )));
            }
            match (contact.link_precedence, contact.linked_id) {
                (LinkPrecedence::Primary, None) => {}
                (LinkPrecedence::Primary, Some(target)) => {
                    return Err(RelinkError::Corrupt(format!(
                        "primary {id} links to {target}"
                    )));
                }
                (LinkPrecedence::Secondary, None) => {
                    return Err(RelinkError::Corrupt(format!(
                        "secondary {id} has no linked id"
                    )));
                }
                (LinkPrecedence::Secondary, Some(target)) => {
                    let primary = by_id.get(&target).ok_or_else(|| {
                        RelinkError::Corrupt(format!("secondary {id} links to missing {target}"))
                    })?;
                    if !primary.is_primary() {
                        return Err(RelinkError::Corrupt(format!(
                            "secondary {id} links to secondary {target}"
                        )));
                    }
                    if primary.sort_key() >= contact.sort_key() {
                        return Err(RelinkError::Corrupt(format!(
                            "primary {target} is not older than its member {id}"
                        )));
                    }
                    if !linked_ids(&links, target)?.contains(&id.0) {
                        return Err(RelinkError::Corrupt(format!(
                            "link index is missing {target} -> {id}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

impl ContactStore for ContactGraph {
    type Txn = ContactGraphTxn;

    fn begin(&self) -> Result<ContactGraphTxn> {
        Ok(ContactGraphTxn {
            txn: self.db.begin_write()?,
        })
    }
}

/// One open write transaction on a [`ContactGraph`].
///
/// Dropping it without [`ContactTxn::commit`] rolls every write back.
pub struct ContactGraphTxn {
    txn: redb::WriteTransaction,
}

impl ContactGraphTxn {
    fn load(&self, id: ContactId) -> Result<Option<Contact>> {
        let table = self.txn.open_table(CONTACTS)?;
        read_contact(&table, id)
    }

    fn store(&self, contact: &Contact) -> Result<()> {
        let value = serde_json::to_string(contact)?;
        let mut table = self.txn.open_table(CONTACTS)?;
        table.insert(contact.id.0, value.as_str())?;
        Ok(())
    }

    fn load_sorted(&self, ids: impl IntoIterator<Item = ContactId>) -> Result<Vec<Contact>> {
        let table = self.txn.open_table(CONTACTS)?;
        let mut contacts = Vec::new();
        for id in ids {
            if let Some(contact) = read_contact(&table, id)? {
                contacts.push(contact);
            }
        }
        contacts.sort_by_key(Contact::sort_key);
        Ok(contacts)
    }

    /// Allocate the next id and a creation time no earlier than the last one.
    fn allocate(&self) -> Result<(ContactId, DateTime<Utc>)> {
        let mut counters = self.txn.open_table(COUNTERS)?;
        let last_id = counters.get(CONTACT_ID_KEY)?.map(|g| g.value()).unwrap_or(0);
        let last_micros = counters.get(CREATED_AT_KEY)?.map(|g| g.value());

        let mut created_at = Utc::now().trunc_subsecs(6);
        if let Some(last) = last_micros
            .and_then(|m| i64::try_from(m).ok())
            .and_then(DateTime::from_timestamp_micros)
        {
            created_at = created_at.max(last);
        }
        let micros = u64::try_from(created_at.timestamp_micros())
            .map_err(|_| RelinkError::Storage(format!("clock before epoch: {created_at}")))?;

        let id = last_id + 1;
        counters.insert(CONTACT_ID_KEY, id)?;
        counters.insert(CREATED_AT_KEY, micros)?;
        Ok((ContactId(id), created_at))
    }
}

impl ContactTxn for ContactGraphTxn {
    fn find_matching(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>> {
        let mut ids = BTreeSet::new();
        if let Some(email) = email {
            let index = self.txn.open_multimap_table(EMAIL_INDEX)?;
            ids.extend(index_lookup(&index, email)?);
        }
        if let Some(phone) = phone_number {
            let index = self.txn.open_multimap_table(PHONE_INDEX)?;
            ids.extend(index_lookup(&index, phone)?);
        }
        self.load_sorted(ids.into_iter().map(ContactId))
    }

    fn find_by_ids(&self, ids: &[ContactId]) -> Result<Vec<Contact>> {
        let unique: BTreeSet<ContactId> = ids.iter().copied().collect();
        self.load_sorted(unique)
    }

    fn find_cluster(&self, primary_id: ContactId) -> Result<Vec<Contact>> {
        let table = self.txn.open_table(CONTACTS)?;
        let links = self.txn.open_multimap_table(LINKS)?;
        read_cluster(&table, &links, primary_id)
    }

    fn create(&mut self, new: NewContact) -> Result<Contact> {
        let (id, created_at) = self.allocate()?;
        let contact = Contact {
            id,
            email: new.email,
            phone_number: new.phone_number,
            link_precedence: new.link_precedence,
            linked_id: new.linked_id,
            created_at,
            updated_at: created_at,
        };
        self.store(&contact)?;

        if let Some(email) = &contact.email {
            let mut index = self.txn.open_multimap_table(EMAIL_INDEX)?;
            index.insert(email.as_str(), id.0)?;
        }
        if let Some(phone) = &contact.phone_number {
            let mut index = self.txn.open_multimap_table(PHONE_INDEX)?;
            index.insert(phone.as_str(), id.0)?;
        }
        if let Some(primary) = contact.linked_id {
            let mut links = self.txn.open_multimap_table(LINKS)?;
            links.insert(primary.0, id.0)?;
        }
        Ok(contact)
    }

    fn update_link(
        &mut self,
        id: ContactId,
        link_precedence: LinkPrecedence,
        linked_id: Option<ContactId>,
    ) -> Result<()> {
        let mut contact = self
            .load(id)?
            .ok_or_else(|| RelinkError::NotFound(format!("contact id {id}")))?;
        {
            let mut links = self.txn.open_multimap_table(LINKS)?;
            if let Some(old) = contact.linked_id {
                links.remove(old.0, id.0)?;
            }
            if let Some(new) = linked_id {
                links.insert(new.0, id.0)?;
            }
        }
        contact.link_precedence = link_precedence;
        contact.linked_id = linked_id;
        contact.updated_at = Utc::now().max(contact.created_at);
        self.store(&contact)
    }

    fn relink(&mut self, from: ContactId, to: ContactId) -> Result<()> {
        let moved: Vec<u64> = {
            let mut links = self.txn.open_multimap_table(LINKS)?;
            let mut moved = Vec::new();
            for entry in links.remove_all(from.0)? {
                moved.push(entry?.value());
            }
            for id in &moved {
                links.insert(to.0, *id)?;
            }
            moved
        };

        let now = Utc::now();
        for id in moved {
            let id = ContactId(id);
            let mut contact = self.load(id)?.ok_or_else(|| {
                RelinkError::Corrupt(format!("link index names missing contact {id}"))
            })?;
            contact.linked_id = Some(to);
            contact.updated_at = now.max(contact.created_at);
            self.store(&contact)?;
        }
        Ok(())
    }

    fn commit(self) -> Result<()> {
        self.txn.commit()?;
        Ok(())
    }
}

// Shared by read and write transactions.

fn read_contact(
    table: &impl ReadableTable<u64, &'static str>,
    id: ContactId,
) -> Result<Option<Contact>> {
    match table.get(id.0)? {
        Some(guard) => Ok(Some(serde_json::from_str(guard.value())?)),
        None => Ok(None),
    }
}

fn index_lookup(
    index: &impl ReadableMultimapTable<&'static str, u64>,
    key: &str,
) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    for entry in index.get(key)? {
        ids.push(entry?.value());
    }
    Ok(ids)
}

fn linked_ids(
    links: &impl ReadableMultimapTable<u64, u64>,
    primary: ContactId,
) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    for entry in links.get(primary.0)? {
        ids.push(entry?.value());
    }
    Ok(ids)
}

fn read_cluster(
    table: &impl ReadableTable<u64, &'static str>,
    links: &impl ReadableMultimapTable<u64, u64>,
    primary_id: ContactId,
) -> Result<Vec<Contact>> {
    let mut members = Vec::new();
    if let Some(primary) = read_contact(table, primary_id)? {
        members.push(primary);
    }
    for id in linked_ids(links, primary_id)? {
        let contact = read_contact(table, ContactId(id))?.ok_or_else(|| {
            RelinkError::Corrupt(format!("link index names missing contact {id}"))
        })?;
        members.push(contact);
    }
    members.sort_by_key(Contact::sort_key);
    Ok(members)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
