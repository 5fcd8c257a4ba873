//! Projections from stored records to the views handed to the edge.

use ulid::Ulid;

use crate::model::*;
use crate::store::BookingStore;

use super::{Engine, EngineError};

/// Reduced booking for embedding inside an item view.
pub fn to_summary(booking: &Booking) -> BookingSummary {
    BookingSummary {
        id: booking.id,
        start: booking.span.start,
        end: booking.span.end,
        booker_id: booking.booker_id,
        status: booking.status,
    }
}

pub fn item_summary(item: &Item) -> ItemSummary {
    ItemSummary {
        id: item.id,
        name: item.name.clone(),
        description: item.description.clone(),
        available: item.available,
    }
}

pub fn user_summary(user: &User) -> UserSummary {
    UserSummary {
        id: user.id,
        name: user.name.clone(),
        email: user.email.clone(),
    }
}

/// Full view from already-resolved parts. A missing item or booker maps to
/// `None` rather than an error.
pub fn to_view(booking: &Booking, item: Option<&Item>, booker: Option<&User>) -> BookingView {
    BookingView {
        id: booking.id,
        start: booking.span.start,
        end: booking.span.end,
        item: item.map(item_summary),
        booker: booker.map(user_summary),
        status: booking.status,
    }
}

/// `(last, next)` bookings of an item, only for its owner.
pub async fn booking_neighbours(
    store: &dyn BookingStore,
    item: &Item,
    viewer_id: Ulid,
    now: Ms,
) -> Result<(Option<BookingSummary>, Option<BookingSummary>), EngineError> {
    if viewer_id != item.owner_id {
        return Ok((None, None));
    }
    let last = store.last_booking(item.id, now).await?;
    let next = store.next_booking(item.id, now).await?;
    Ok((last.as_ref().map(to_summary), next.as_ref().map(to_summary)))
}

impl Engine {
    /// Resolve item and booker for a booking and project it.
    pub(super) async fn resolve_view(&self, booking: &Booking) -> Result<BookingView, EngineError> {
        let item = self.items.find_item(booking.item_id).await?;
        let booker = self.users.find_user(booking.booker_id).await?;
        Ok(to_view(booking, item.as_ref(), booker.as_ref()))
    }

    pub(super) async fn resolve_views(
        &self,
        bookings: &[Booking],
    ) -> Result<Vec<BookingView>, EngineError> {
        let mut views = Vec::with_capacity(bookings.len());
        for booking in bookings {
            views.push(self.resolve_view(booking).await?);
        }
        Ok(views)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (Booking, Item, User) {
        let owner = Ulid::new();
        let booker = User {
            id: Ulid::new(),
            name: "bo".into(),
            email: "bo@example.com".into(),
        };
        let item = Item {
            id: Ulid::new(),
            owner_id: owner,
            name: "tent".into(),
            description: "2 person".into(),
            available: true,
            request_id: None,
        };
        let booking = Booking {
            id: Ulid::new(),
            span: Span::new(1000, 2000),
            status: BookingStatus::Waiting,
            item_id: item.id,
            booker_id: booker.id,
        };
        (booking, item, booker)
    }

    #[test]
    fn summary_carries_booker_id_only() {
        let (booking, _, booker) = sample();
        let summary = to_summary(&booking);
        assert_eq!(summary.id, booking.id);
        assert_eq!(summary.booker_id, booker.id);
        assert_eq!((summary.start, summary.end), (1000, 2000));
        assert_eq!(summary.status, BookingStatus::Waiting);
    }

    #[test]
    fn full_view_embeds_item_and_booker() {
        let (booking, item, booker) = sample();
        let view = to_view(&booking, Some(&item), Some(&booker));
        assert_eq!(view.item.unwrap().name, "tent");
        assert_eq!(view.booker.unwrap().email, "bo@example.com");
    }

    #[test]
    fn full_view_tolerates_missing_references() {
        let (booking, _, _) = sample();
        let view = to_view(&booking, None, None);
        assert!(view.item.is_none());
        assert!(view.booker.is_none());
        assert_eq!(view.id, booking.id);
    }

    #[test]
    fn status_serializes_upper_case() {
        let (booking, item, booker) = sample();
        let json = serde_json::to_value(to_view(&booking, Some(&item), Some(&booker))).unwrap();
        assert_eq!(json["status"], "WAITING");
        assert_eq!(json["item"]["name"], "tent");
    }
}
