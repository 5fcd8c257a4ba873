mod error;
pub mod mapping;
mod mutations;
mod queries;
pub(crate) mod validation;

pub use error::EngineError;
pub use queries::{classify, is_paginated};

use std::sync::Arc;

use ulid::Ulid;

use crate::clock::{Clock, DefaultClock};
use crate::model::*;
use crate::store::{BookingStore, ItemCatalog, Ledger, UserDirectory};

/// Booking lifecycle and listing engine.
///
/// Holds no booking state of its own: every call resolves users, items and
/// bookings through the collaborators and writes back through the store.
/// Concurrent decisions on one booking are arbitrated by the store.
pub struct Engine {
    pub(super) users: Arc<dyn UserDirectory>,
    pub(super) items: Arc<dyn ItemCatalog>,
    pub(super) bookings: Arc<dyn BookingStore>,
    pub(super) clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn new(
        users: Arc<dyn UserDirectory>,
        items: Arc<dyn ItemCatalog>,
        bookings: Arc<dyn BookingStore>,
    ) -> Self {
        Self {
            users,
            items,
            bookings,
            clock: Arc::new(DefaultClock),
        }
    }

    /// Engine whose three collaborators are the same ledger.
    pub fn over_ledger(ledger: Arc<Ledger>) -> Self {
        Self::new(ledger.clone(), ledger.clone(), ledger)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub(super) async fn require_user(&self, id: Ulid) -> Result<User, EngineError> {
        self.users
            .find_user(id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("user {id}")))
    }

    pub(super) async fn require_item(&self, id: Ulid) -> Result<Item, EngineError> {
        self.items
            .find_item(id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("item {id}")))
    }

    pub(super) async fn require_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.bookings
            .find_booking(id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("booking {id}")))
    }
}
