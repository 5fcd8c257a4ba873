use tracing::info;
use ulid::Ulid;

use crate::clock::ClockExt;
use crate::model::*;

use super::validation::validate_booking_span;
use super::{Engine, EngineError};

impl Engine {
    /// Request a booking of `item_id` by `booker_id`. The booking starts out
    /// WAITING; the item's availability flag is left untouched.
    pub async fn create_booking(
        &self,
        booker_id: Ulid,
        item_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<BookingView, EngineError> {
        let now = self.clock.now_ms();
        let booker = self.require_user(booker_id).await?;
        let item = self.require_item(item_id).await?;
        if item.owner_id == booker_id {
            return Err(EngineError::not_found(format!(
                "item {item_id} for booking by its owner"
            )));
        }
        if !item.available {
            return Err(EngineError::bad_request(format!("item {item_id} is not available")));
        }
        let span = validate_booking_span(start, end, now)?;

        let booking = self
            .bookings
            .insert_booking(NewBooking {
                span,
                item_id,
                booker_id,
            })
            .await?;
        info!("booking {} requested: item {item_id} by {booker_id} [{start}, {end})", booking.id);
        metrics::counter!(crate::observability::BOOKINGS_REQUESTED_TOTAL).increment(1);

        Ok(super::mapping::to_view(&booking, Some(&item), Some(&booker)))
    }

    /// Owner's decision on a WAITING booking. APPROVED and REJECTED are final.
    pub async fn set_approved(
        &self,
        user_id: Ulid,
        booking_id: Ulid,
        approved: bool,
    ) -> Result<BookingView, EngineError> {
        self.require_user(user_id).await?;
        let mut booking = self.require_booking(booking_id).await?;
        let item = self.items.find_item(booking.item_id).await?;
        if item.as_ref().is_none_or(|i| i.owner_id != user_id) {
            return Err(EngineError::not_found(format!(
                "booking {booking_id} owned by user {user_id}"
            )));
        }
        if booking.status.is_decided() {
            return Err(EngineError::bad_request(format!(
                "booking {booking_id} already {}",
                booking.status
            )));
        }

        booking.status = if approved {
            BookingStatus::Approved
        } else {
            BookingStatus::Rejected
        };
        let saved = self.bookings.update_booking(&booking).await?;
        info!("booking {booking_id} {} by owner {user_id}", saved.status);
        metrics::counter!(
            crate::observability::BOOKING_DECISIONS_TOTAL,
            "status" => saved.status.as_str()
        )
        .increment(1);

        self.resolve_view(&saved).await
    }
}
