use std::sync::Arc;

use tracing::info;
use ulid::Ulid;

use crate::clock::{Clock, ClockExt, DefaultClock};
use crate::engine::EngineError;
use crate::engine::mapping::{booking_neighbours, item_summary};
use crate::engine::validation::{validate_email, validate_page, validate_text};
use crate::limits::*;
use crate::model::*;
use crate::store::{
    BookingStore, CommentStore, ItemCatalog, Ledger, RequestStore, UserDirectory,
};

/// Users, items, comments and item requests: field validation over the
/// store, plus the owner-only last/next booking on item views.
pub struct Catalog {
    users: Arc<dyn UserDirectory>,
    items: Arc<dyn ItemCatalog>,
    bookings: Arc<dyn BookingStore>,
    comments: Arc<dyn CommentStore>,
    requests: Arc<dyn RequestStore>,
    clock: Arc<dyn Clock>,
}

impl Catalog {
    pub fn over_ledger(ledger: Arc<Ledger>) -> Self {
        Self {
            users: ledger.clone(),
            items: ledger.clone(),
            bookings: ledger.clone(),
            comments: ledger.clone(),
            requests: ledger,
            clock: Arc::new(DefaultClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    async fn require_user(&self, id: Ulid) -> Result<User, EngineError> {
        self.users
            .find_user(id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("user {id}")))
    }

    async fn require_item(&self, id: Ulid) -> Result<Item, EngineError> {
        self.items
            .find_item(id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("item {id}")))
    }

    async fn require_request(&self, id: Ulid) -> Result<ItemRequest, EngineError> {
        self.requests
            .find_request(id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("item request {id}")))
    }

    // ── Users ────────────────────────────────────────────────

    pub async fn register_user(&self, name: String, email: String) -> Result<User, EngineError> {
        validate_text("name", &name, MAX_NAME_LEN)?;
        validate_email(&email)?;
        let user = self.users.insert_user(name, email).await?;
        info!("user {} registered", user.id);
        Ok(user)
    }

    pub async fn update_user(
        &self,
        id: Ulid,
        name: Option<String>,
        email: Option<String>,
    ) -> Result<User, EngineError> {
        let mut user = self.require_user(id).await?;
        if let Some(name) = name {
            validate_text("name", &name, MAX_NAME_LEN)?;
            user.name = name;
        }
        if let Some(email) = email {
            validate_email(&email)?;
            user.email = email;
        }
        Ok(self.users.update_user(&user).await?)
    }

    pub async fn find_user(&self, id: Ulid) -> Result<User, EngineError> {
        self.require_user(id).await
    }

    // ── Items ────────────────────────────────────────────────

    /// `request_id`, when given, must name an existing item request.
    pub async fn list_item(&self, new: NewItem) -> Result<Item, EngineError> {
        self.require_user(new.owner_id).await?;
        validate_text("name", &new.name, MAX_NAME_LEN)?;
        validate_text("description", &new.description, MAX_DESCRIPTION_LEN)?;
        if let Some(request_id) = new.request_id {
            self.require_request(request_id).await?;
        }
        let item = self.items.insert_item(new).await?;
        info!("item {} listed by {}", item.id, item.owner_id);
        Ok(item)
    }

    /// Only the owner may edit; anyone else sees the item as missing.
    pub async fn update_item(
        &self,
        user_id: Ulid,
        item_id: Ulid,
        patch: ItemPatch,
    ) -> Result<Item, EngineError> {
        self.require_user(user_id).await?;
        let mut item = self.require_item(item_id).await?;
        if item.owner_id != user_id {
            return Err(EngineError::not_found(format!("item {item_id} owned by user {user_id}")));
        }
        if let Some(name) = patch.name {
            validate_text("name", &name, MAX_NAME_LEN)?;
            item.name = name;
        }
        if let Some(description) = patch.description {
            validate_text("description", &description, MAX_DESCRIPTION_LEN)?;
            item.description = description;
        }
        if let Some(available) = patch.available {
            item.available = available;
        }
        if let Some(request_id) = patch.request_id {
            self.require_request(request_id).await?;
            item.request_id = Some(request_id);
        }
        let item = self.items.update_item(&item).await?;
        info!("item {item_id} updated by {user_id}");
        Ok(item)
    }

    /// Available items matching `text` in name or description. Blank text
    /// matches nothing.
    pub async fn search_items(&self, user_id: Ulid, text: &str) -> Result<Vec<Item>, EngineError> {
        self.require_user(user_id).await?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.items.search_items(text).await?)
    }

    pub async fn view_item(&self, viewer_id: Ulid, item_id: Ulid) -> Result<ItemView, EngineError> {
        self.require_user(viewer_id).await?;
        let item = self.require_item(item_id).await?;
        self.build_view(viewer_id, item, self.clock.now_ms()).await
    }

    /// Every item the owner has listed, with last/next bookings.
    pub async fn items_of_owner(&self, owner_id: Ulid) -> Result<Vec<ItemView>, EngineError> {
        self.require_user(owner_id).await?;
        let now = self.clock.now_ms();
        let items = self.items.items_of_owner(owner_id).await?;
        let mut views = Vec::with_capacity(items.len());
        for item in items {
            views.push(self.build_view(owner_id, item, now).await?);
        }
        Ok(views)
    }

    async fn build_view(&self, viewer_id: Ulid, item: Item, now: Ms) -> Result<ItemView, EngineError> {
        let (last_booking, next_booking) =
            booking_neighbours(self.bookings.as_ref(), &item, viewer_id, now).await?;

        let mut comments = Vec::new();
        for comment in self.comments.comments_for_item(item.id).await? {
            let author = self.users.find_user(comment.author_id).await?;
            comments.push(CommentView {
                id: comment.id,
                text: comment.text,
                author_name: author.map(|a| a.name),
                created: comment.created,
            });
        }

        Ok(ItemView {
            last_booking,
            next_booking,
            comments,
            ..ItemView::bare(item)
        })
    }

    // ── Comments ─────────────────────────────────────────────

    /// Only a booker with an APPROVED booking on the item that has already
    /// ended may comment.
    pub async fn post_comment(
        &self,
        author_id: Ulid,
        item_id: Ulid,
        text: String,
    ) -> Result<CommentView, EngineError> {
        let now = self.clock.now_ms();
        let author = self.require_user(author_id).await?;
        self.require_item(item_id).await?;
        validate_text("text", &text, MAX_COMMENT_LEN)?;

        let finished = self
            .bookings
            .count_where(author_id, item_id, BookingStatus::Approved, now)
            .await?;
        if finished == 0 {
            return Err(EngineError::bad_request(format!(
                "user {author_id} has no finished rental of item {item_id}"
            )));
        }

        let comment = self.comments.insert_comment(item_id, author_id, text, now).await?;
        info!("comment {} on item {item_id} by {author_id}", comment.id);
        Ok(CommentView {
            id: comment.id,
            text: comment.text,
            author_name: Some(author.name),
            created: comment.created,
        })
    }

    // ── Item requests ────────────────────────────────────────

    pub async fn post_request(
        &self,
        requester_id: Ulid,
        description: String,
    ) -> Result<ItemRequestView, EngineError> {
        let now = self.clock.now_ms();
        self.require_user(requester_id).await?;
        validate_text("description", &description, MAX_DESCRIPTION_LEN)?;
        let request = self.requests.insert_request(requester_id, description, now).await?;
        info!("item request {} posted by {requester_id}", request.id);
        self.request_view(request).await
    }

    /// The requester's own requests, newest first, each with its answers.
    pub async fn own_requests(&self, requester_id: Ulid) -> Result<Vec<ItemRequestView>, EngineError> {
        self.require_user(requester_id).await?;
        let requests = self.requests.requests_of(requester_id).await?;
        self.request_views(requests).await
    }

    /// Everyone else's requests, newest first, one page at a time.
    pub async fn other_requests(
        &self,
        user_id: Ulid,
        page: PageRequest,
    ) -> Result<Vec<ItemRequestView>, EngineError> {
        self.require_user(user_id).await?;
        let page = validate_page(page)?;
        let requests = self.requests.requests_excluding(user_id, page).await?;
        self.request_views(requests).await
    }

    /// Any existing user may look at any request.
    pub async fn find_request(&self, user_id: Ulid, id: Ulid) -> Result<ItemRequestView, EngineError> {
        self.require_user(user_id).await?;
        let request = self.require_request(id).await?;
        self.request_view(request).await
    }

    async fn request_views(&self, requests: Vec<ItemRequest>) -> Result<Vec<ItemRequestView>, EngineError> {
        let mut views = Vec::with_capacity(requests.len());
        for request in requests {
            views.push(self.request_view(request).await?);
        }
        Ok(views)
    }

    async fn request_view(&self, request: ItemRequest) -> Result<ItemRequestView, EngineError> {
        let items = self
            .items
            .items_for_request(request.id)
            .await?
            .iter()
            .map(item_summary)
            .collect();
        Ok(ItemRequestView {
            id: request.id,
            description: request.description,
            created: request.created,
            items,
        })
    }
}
