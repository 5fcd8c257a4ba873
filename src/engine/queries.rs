use tracing::debug;
use ulid::Ulid;

use crate::clock::ClockExt;
use crate::model::*;
use crate::store::{BookingPredicate, BookingScope};

use super::validation::validate_page;
use super::{Engine, EngineError};

/// Map a listing filter to the store predicate evaluated at `now`.
pub fn classify(filter: BookingFilter, now: Ms) -> BookingPredicate {
    match filter {
        BookingFilter::All => BookingPredicate::All,
        BookingFilter::Current => BookingPredicate::ActiveAt(now),
        BookingFilter::Past => BookingPredicate::EndedBefore(now),
        BookingFilter::Future => BookingPredicate::StartsAfter(now),
        BookingFilter::Waiting => BookingPredicate::Status(BookingStatus::Waiting),
        BookingFilter::Rejected => BookingPredicate::Status(BookingStatus::Rejected),
    }
}

/// Only the unfiltered listing is cut into pages.
pub fn is_paginated(filter: BookingFilter) -> bool {
    matches!(filter, BookingFilter::All)
}

impl Engine {
    /// A booking visible to its booker and to the item's owner.
    pub async fn find_booking(
        &self,
        user_id: Ulid,
        booking_id: Ulid,
    ) -> Result<BookingView, EngineError> {
        self.require_user(user_id).await?;
        let booking = self.require_booking(booking_id).await?;
        let item = self.items.find_item(booking.item_id).await?;

        let is_booker = booking.booker_id == user_id;
        let is_owner = item.as_ref().is_some_and(|i| i.owner_id == user_id);
        if !is_booker && !is_owner {
            return Err(EngineError::not_found(format!(
                "booking {booking_id} for user {user_id}"
            )));
        }

        let booker = self.users.find_user(booking.booker_id).await?;
        Ok(super::mapping::to_view(&booking, item.as_ref(), booker.as_ref()))
    }

    /// Bookings made by `user_id`, most recent start first.
    pub async fn bookings_of_booker(
        &self,
        user_id: Ulid,
        filter: BookingFilter,
        page: PageRequest,
    ) -> Result<Vec<BookingView>, EngineError> {
        self.list(BookingScope::Booker(user_id), user_id, filter, page).await
    }

    /// Bookings on items owned by `user_id`, most recent start first.
    pub async fn bookings_of_owner(
        &self,
        user_id: Ulid,
        filter: BookingFilter,
        page: PageRequest,
    ) -> Result<Vec<BookingView>, EngineError> {
        self.list(BookingScope::Owner(user_id), user_id, filter, page).await
    }

    async fn list(
        &self,
        scope: BookingScope,
        user_id: Ulid,
        filter: BookingFilter,
        page: PageRequest,
    ) -> Result<Vec<BookingView>, EngineError> {
        self.require_user(user_id).await?;
        let page = validate_page(page)?;
        let now = self.clock.now_ms();

        let predicate = classify(filter, now);
        let page = is_paginated(filter).then_some(page);
        let rows = self.bookings.find_bookings(scope, predicate, page).await?;
        debug!(?scope, ?filter, rows = rows.len(), "listed bookings");

        self.resolve_views(&rows).await
    }
}
