//! Collaborator seams the booking engine and catalog talk to, plus the
//! in-process [`Ledger`] that implements all of them over a WAL.

mod ledger;

pub use ledger::Ledger;

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug)]
pub enum StoreError {
    /// The write-ahead log could not be appended or flushed.
    Io(String),
    DuplicateEmail(String),
    /// A record named by an update does not exist.
    Missing(Ulid),
    /// The booking left WAITING before this decision could be committed.
    StaleWrite(Ulid),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "WAL error: {e}"),
            StoreError::DuplicateEmail(email) => write!(f, "email already registered: {email}"),
            StoreError::Missing(id) => write!(f, "no such record: {id}"),
            StoreError::StaleWrite(id) => write!(f, "booking {id} was already decided"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Whose bookings a listing covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingScope {
    /// Bookings made by this user.
    Booker(Ulid),
    /// Bookings on items owned by this user (joined through the item).
    Owner(Ulid),
}

/// Row predicate for a listing. Time-based variants carry the `now` captured
/// by the caller so one listing sees one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingPredicate {
    All,
    /// `start < t AND end > t`
    ActiveAt(Ms),
    /// `end < t`
    EndedBefore(Ms),
    /// `start > t`
    StartsAfter(Ms),
    Status(BookingStatus),
}

impl BookingPredicate {
    pub fn matches(&self, booking: &Booking) -> bool {
        match *self {
            BookingPredicate::All => true,
            BookingPredicate::ActiveAt(t) => booking.span.is_active_at(t),
            BookingPredicate::EndedBefore(t) => booking.span.ended_before(t),
            BookingPredicate::StartsAfter(t) => booking.span.starts_after(t),
            BookingPredicate::Status(status) => booking.status == status,
        }
    }
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_user(&self, id: Ulid) -> Result<Option<User>, StoreError>;

    async fn insert_user(&self, name: String, email: String) -> Result<User, StoreError>;

    /// Replace name and email of an existing user.
    async fn update_user(&self, user: &User) -> Result<User, StoreError>;
}

#[async_trait]
pub trait ItemCatalog: Send + Sync {
    async fn find_item(&self, id: Ulid) -> Result<Option<Item>, StoreError>;

    async fn insert_item(&self, item: NewItem) -> Result<Item, StoreError>;

    /// Replace the mutable fields of an existing item. The owner never changes.
    async fn update_item(&self, item: &Item) -> Result<Item, StoreError>;

    /// Items owned by `owner_id`, oldest first.
    async fn items_of_owner(&self, owner_id: Ulid) -> Result<Vec<Item>, StoreError>;

    /// Available items whose name or description contains `text`, ignoring
    /// case. Ordered by id.
    async fn search_items(&self, text: &str) -> Result<Vec<Item>, StoreError>;

    /// Items listed in answer to an item request, oldest first.
    async fn items_for_request(&self, request_id: Ulid) -> Result<Vec<Item>, StoreError>;
}

#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Persist a new WAITING booking and assign its id.
    async fn insert_booking(&self, booking: NewBooking) -> Result<Booking, StoreError>;

    /// Persist a decision. Fails with `StaleWrite` if the stored booking has
    /// already left WAITING.
    async fn update_booking(&self, booking: &Booking) -> Result<Booking, StoreError>;

    async fn find_booking(&self, id: Ulid) -> Result<Option<Booking>, StoreError>;

    /// Bookings in `scope` matching `predicate`, most recent start first,
    /// optionally cut to one page.
    async fn find_bookings(
        &self,
        scope: BookingScope,
        predicate: BookingPredicate,
        page: Option<Page>,
    ) -> Result<Vec<Booking>, StoreError>;

    /// Greatest start among the item's bookings that ended before `now`.
    async fn last_booking(&self, item_id: Ulid, now: Ms) -> Result<Option<Booking>, StoreError>;

    /// Smallest start among the item's bookings that start after `now`.
    async fn next_booking(&self, item_id: Ulid, now: Ms) -> Result<Option<Booking>, StoreError>;

    async fn count_where(
        &self,
        booker_id: Ulid,
        item_id: Ulid,
        status: BookingStatus,
        end_before: Ms,
    ) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait CommentStore: Send + Sync {
    async fn insert_comment(
        &self,
        item_id: Ulid,
        author_id: Ulid,
        text: String,
        created: Ms,
    ) -> Result<Comment, StoreError>;

    /// Comments on an item, oldest first.
    async fn comments_for_item(&self, item_id: Ulid) -> Result<Vec<Comment>, StoreError>;
}

#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn insert_request(
        &self,
        requester_id: Ulid,
        description: String,
        created: Ms,
    ) -> Result<ItemRequest, StoreError>;

    async fn find_request(&self, id: Ulid) -> Result<Option<ItemRequest>, StoreError>;

    /// Requests made by `requester_id`, newest first.
    async fn requests_of(&self, requester_id: Ulid) -> Result<Vec<ItemRequest>, StoreError>;

    /// One page of everyone else's requests, newest first.
    async fn requests_excluding(
        &self,
        user_id: Ulid,
        page: Page,
    ) -> Result<Vec<ItemRequest>, StoreError>;
}
