use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for caller-supplied bounds.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    /// Strictly inside: a span starting or ending exactly at `t` is not active.
    pub fn is_active_at(&self, t: Ms) -> bool {
        self.start < t && t < self.end
    }

    pub fn ended_before(&self, t: Ms) -> bool {
        self.end < t
    }

    pub fn starts_after(&self, t: Ms) -> bool {
        self.start > t
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Waiting,
    Approved,
    Rejected,
    /// Reserved. Nothing transitions into it.
    Canceled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Waiting => "WAITING",
            BookingStatus::Approved => "APPROVED",
            BookingStatus::Rejected => "REJECTED",
            BookingStatus::Canceled => "CANCELED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "WAITING" => Some(BookingStatus::Waiting),
            "APPROVED" => Some(BookingStatus::Approved),
            "REJECTED" => Some(BookingStatus::Rejected),
            "CANCELED" => Some(BookingStatus::Canceled),
            _ => None,
        }
    }

    pub fn is_decided(&self) -> bool {
        !matches!(self, BookingStatus::Waiting)
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Temporal/status partition of a user's bookings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BookingFilter {
    #[default]
    All,
    Current,
    Past,
    Future,
    Waiting,
    Rejected,
}

impl BookingFilter {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "ALL" => Some(BookingFilter::All),
            "CURRENT" => Some(BookingFilter::Current),
            "PAST" => Some(BookingFilter::Past),
            "FUTURE" => Some(BookingFilter::Future),
            "WAITING" => Some(BookingFilter::Waiting),
            "REJECTED" => Some(BookingFilter::Rejected),
            _ => None,
        }
    }
}

/// Zero-based page request. `offset` counts pages, not records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub offset: i64,
    pub size: i64,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            offset: 0,
            size: crate::limits::DEFAULT_PAGE_SIZE,
        }
    }
}

/// Validated page: `offset * size` records are skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub size: usize,
}

impl Page {
    pub fn skip(&self) -> usize {
        self.offset.saturating_mul(self.size)
    }
}

// ── Records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub name: String,
    pub description: String,
    pub available: bool,
    /// The item request this listing answers, if any.
    pub request_id: Option<Ulid>,
}

/// An item listing before the store has assigned it an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewItem {
    pub owner_id: Ulid,
    pub name: String,
    pub description: String,
    pub available: bool,
    pub request_id: Option<Ulid>,
}

/// Partial item update; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub available: Option<bool>,
    pub request_id: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub span: Span,
    pub status: BookingStatus,
    pub item_id: Ulid,
    pub booker_id: Ulid,
}

/// A booking request before the store has assigned it an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub span: Span,
    pub item_id: Ulid,
    pub booker_id: Ulid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: Ulid,
    pub item_id: Ulid,
    pub author_id: Ulid,
    pub text: String,
    pub created: Ms,
}

/// A user asking for an item nobody has listed yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRequest {
    pub id: Ulid,
    pub requester_id: Ulid,
    pub description: String,
    pub created: Ms,
}

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        id: Ulid,
        name: String,
        email: String,
    },
    UserUpdated {
        id: Ulid,
        name: String,
        email: String,
    },
    ItemListed {
        id: Ulid,
        owner_id: Ulid,
        name: String,
        description: String,
        available: bool,
        request_id: Option<Ulid>,
    },
    ItemUpdated {
        id: Ulid,
        name: String,
        description: String,
        available: bool,
        request_id: Option<Ulid>,
    },
    BookingRequested {
        id: Ulid,
        item_id: Ulid,
        booker_id: Ulid,
        span: Span,
    },
    BookingDecided {
        id: Ulid,
        status: BookingStatus,
    },
    CommentPosted {
        id: Ulid,
        item_id: Ulid,
        author_id: Ulid,
        text: String,
        created: Ms,
    },
    RequestPosted {
        id: Ulid,
        requester_id: Ulid,
        description: String,
        created: Ms,
    },
}

// ── Views ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserSummary {
    pub id: Ulid,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemSummary {
    pub id: Ulid,
    pub name: String,
    pub description: String,
    pub available: bool,
}

/// Booking reference embedded in an item view. Never embeds the item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingSummary {
    pub id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub booker_id: Ulid,
    pub status: BookingStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingView {
    pub id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub item: Option<ItemSummary>,
    pub booker: Option<UserSummary>,
    pub status: BookingStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommentView {
    pub id: Ulid,
    pub text: String,
    pub author_name: Option<String>,
    pub created: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemView {
    pub id: Ulid,
    pub name: String,
    pub description: String,
    pub available: bool,
    pub request_id: Option<Ulid>,
    pub last_booking: Option<BookingSummary>,
    pub next_booking: Option<BookingSummary>,
    pub comments: Vec<CommentView>,
}

impl ItemView {
    /// View with no bookings or comments attached.
    pub fn bare(item: Item) -> Self {
        Self {
            id: item.id,
            name: item.name,
            description: item.description,
            available: item.available,
            request_id: item.request_id,
            last_booking: None,
            next_booking: None,
            comments: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemRequestView {
    pub id: Ulid,
    pub description: String,
    pub created: Ms,
    /// Listings that answer this request.
    pub items: Vec<ItemSummary>,
}
