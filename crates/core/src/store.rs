//! Store interface the resolver runs against.
//!
//! A [`ContactStore`] hands out one [`ContactTxn`] per unit of work. Every
//! read and write of a resolve goes through that transaction; nothing is
//! visible to other callers until [`ContactTxn::commit`] succeeds, and
//! dropping the transaction without committing discards all of it.
//!
//! [`ContactGraph`](crate::ContactGraph) is the bundled implementation.

use crate::model::{Contact, ContactId, LinkPrecedence, NewContact};
use crate::Result;

/// Source of atomic contact-graph transactions.
pub trait ContactStore {
    type Txn: ContactTxn;

    /// Open a transaction. Implementations must give at least read-committed
    /// isolation and must not let two open transactions both observe "no
    /// match" for the same fact and then both create a primary for it.
    fn begin(&self) -> Result<Self::Txn>;
}

/// Reads and writes inside one open transaction.
///
/// All finders return contacts ordered by [`Contact::sort_key`].
pub trait ContactTxn {
    /// Contacts whose email equals `email` or whose phone equals `phone_number`.
    ///
    /// Only supplied fields take part: `find_matching(Some(e), None)` never
    /// matches on phone.
    fn find_matching(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>>;

    /// Contacts with the given ids. Unknown ids are skipped.
    fn find_by_ids(&self, ids: &[ContactId]) -> Result<Vec<Contact>>;

    /// The primary `primary_id` plus every contact linked to it.
    fn find_cluster(&self, primary_id: ContactId) -> Result<Vec<Contact>>;

    /// Insert a contact, assigning its id and timestamps.
    fn create(&mut self, new: NewContact) -> Result<Contact>;

    /// Set precedence and link target of an existing contact.
    fn update_link(
        &mut self,
        id: ContactId,
        link_precedence: LinkPrecedence,
        linked_id: Option<ContactId>,
    ) -> Result<()>;

    /// Re-point every contact linked to `from` so it links to `to`.
    fn relink(&mut self, from: ContactId, to: ContactId) -> Result<()>;

    fn commit(self) -> Result<()>;
}
