use std::io;
use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

use super::{
    BookingPredicate, BookingScope, BookingStore, CommentStore, ItemCatalog, RequestStore,
    StoreError, UserDirectory,
};

// ── Group-commit WAL channel ─────────────────────────────

struct WalAppend {
    event: Event,
    response: oneshot::Sender<io::Result<()>>,
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first append arrives.
/// 2. Drain all immediately available appends (the batch window).
/// 3. Single flush_sync for the whole batch.
/// 4. Respond to all senders with the batch outcome.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalAppend>) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(next) = rx.try_recv() {
            batch.push(next);
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());

        for append in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = append.response.send(r);
        }
    }
    debug!("WAL writer for {} stopped", wal.path().display());
}

fn flush_batch(wal: &mut Wal, batch: &[WalAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for append in batch {
        if let Err(e) = wal.append_buffered(&append.event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush so a failed batch does not leak bytes into the next one.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

/// WAL-backed store for users, items, bookings, comments and item requests.
///
/// Reads go straight to the `DashMap`s. Writes are serialised behind
/// `write_lock`: validate against current state, append to the WAL, then
/// apply. A record is only visible once its event is durable.
pub struct Ledger {
    users: DashMap<Ulid, User>,
    /// Lowercased email → user id.
    emails: DashMap<String, Ulid>,
    items: DashMap<Ulid, Item>,
    items_by_owner: DashMap<Ulid, Vec<Ulid>>,
    items_by_request: DashMap<Ulid, Vec<Ulid>>,
    bookings: DashMap<Ulid, Booking>,
    bookings_by_booker: DashMap<Ulid, Vec<Ulid>>,
    bookings_by_item: DashMap<Ulid, Vec<Ulid>>,
    comments_by_item: DashMap<Ulid, Vec<Comment>>,
    requests: DashMap<Ulid, ItemRequest>,
    requests_by_user: DashMap<Ulid, Vec<Ulid>>,
    write_lock: Mutex<()>,
    wal_tx: mpsc::Sender<WalAppend>,
}

impl Ledger {
    /// Replay the WAL at `path`, cut any corrupt tail, and start its writer
    /// task. Must be called inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (wal, events) = Wal::recover(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let ledger = Self {
            users: DashMap::new(),
            emails: DashMap::new(),
            items: DashMap::new(),
            items_by_owner: DashMap::new(),
            items_by_request: DashMap::new(),
            bookings: DashMap::new(),
            bookings_by_booker: DashMap::new(),
            bookings_by_item: DashMap::new(),
            comments_by_item: DashMap::new(),
            requests: DashMap::new(),
            requests_by_user: DashMap::new(),
            write_lock: Mutex::new(()),
            wal_tx,
        };
        for event in &events {
            ledger.apply(event);
        }
        info!(
            "ledger {} replayed {} events ({} users, {} items, {} bookings)",
            path.display(),
            events.len(),
            ledger.users.len(),
            ledger.items.len(),
            ledger.bookings.len()
        );
        Ok(ledger)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalAppend {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Io("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Io("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    /// WAL-append + apply. Caller holds `write_lock`.
    async fn commit(&self, event: Event) -> Result<(), StoreError> {
        self.wal_append(&event).await?;
        self.apply(&event);
        Ok(())
    }

    fn apply(&self, event: &Event) {
        match event {
            Event::UserRegistered { id, name, email } => {
                self.emails.insert(email.to_lowercase(), *id);
                self.users.insert(
                    *id,
                    User {
                        id: *id,
                        name: name.clone(),
                        email: email.clone(),
                    },
                );
            }
            Event::UserUpdated { id, name, email } => {
                let previous = self.users.get(id).map(|u| u.email.to_lowercase());
                if let Some(old) = previous {
                    self.emails.remove(&old);
                }
                self.emails.insert(email.to_lowercase(), *id);
                self.users.insert(
                    *id,
                    User {
                        id: *id,
                        name: name.clone(),
                        email: email.clone(),
                    },
                );
            }
            Event::ItemListed {
                id,
                owner_id,
                name,
                description,
                available,
                request_id,
            } => {
                self.items.insert(
                    *id,
                    Item {
                        id: *id,
                        owner_id: *owner_id,
                        name: name.clone(),
                        description: description.clone(),
                        available: *available,
                        request_id: *request_id,
                    },
                );
                self.items_by_owner.entry(*owner_id).or_default().push(*id);
                if let Some(request_id) = request_id {
                    self.items_by_request.entry(*request_id).or_default().push(*id);
                }
            }
            Event::ItemUpdated {
                id,
                name,
                description,
                available,
                request_id,
            } => {
                let previous = match self.items.get_mut(id) {
                    Some(mut item) => {
                        item.name = name.clone();
                        item.description = description.clone();
                        item.available = *available;
                        std::mem::replace(&mut item.request_id, *request_id)
                    }
                    None => {
                        debug!("skipping update of unknown item {id}");
                        return;
                    }
                };
                if previous != *request_id {
                    if let Some(old) = previous {
                        if let Some(mut ids) = self.items_by_request.get_mut(&old) {
                            ids.retain(|i| i != id);
                        }
                    }
                    if let Some(new) = request_id {
                        self.items_by_request.entry(*new).or_default().push(*id);
                    }
                }
            }
            Event::BookingRequested {
                id,
                item_id,
                booker_id,
                span,
            } => {
                self.bookings.insert(
                    *id,
                    Booking {
                        id: *id,
                        span: *span,
                        status: BookingStatus::Waiting,
                        item_id: *item_id,
                        booker_id: *booker_id,
                    },
                );
                self.bookings_by_booker.entry(*booker_id).or_default().push(*id);
                self.bookings_by_item.entry(*item_id).or_default().push(*id);
            }
            Event::BookingDecided { id, status } => match self.bookings.get_mut(id) {
                Some(mut booking) => booking.status = *status,
                None => debug!("skipping decision on unknown booking {id}"),
            },
            Event::CommentPosted {
                id,
                item_id,
                author_id,
                text,
                created,
            } => {
                self.comments_by_item.entry(*item_id).or_default().push(Comment {
                    id: *id,
                    item_id: *item_id,
                    author_id: *author_id,
                    text: text.clone(),
                    created: *created,
                });
            }
            Event::RequestPosted {
                id,
                requester_id,
                description,
                created,
            } => {
                self.requests.insert(
                    *id,
                    ItemRequest {
                        id: *id,
                        requester_id: *requester_id,
                        description: description.clone(),
                        created: *created,
                    },
                );
                self.requests_by_user.entry(*requester_id).or_default().push(*id);
            }
        }
    }

    fn resolve_items(&self, ids: &[Ulid]) -> Vec<Item> {
        ids.iter()
            .filter_map(|id| self.items.get(id).map(|i| i.value().clone()))
            .collect()
    }

    fn email_taken_by_other(&self, email: &str, user_id: Option<Ulid>) -> bool {
        self.emails
            .get(&email.to_lowercase())
            .is_some_and(|owner| Some(*owner.value()) != user_id)
    }

    fn bookings_of_item(&self, item_id: &Ulid) -> Vec<Booking> {
        let ids = self
            .bookings_by_item
            .get(item_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        self.resolve_bookings(&ids)
    }

    fn resolve_bookings(&self, ids: &[Ulid]) -> Vec<Booking> {
        ids.iter()
            .filter_map(|id| self.bookings.get(id).map(|b| b.value().clone()))
            .collect()
    }

    /// Candidate rows for a scope. The owner scope joins items → bookings.
    fn scoped_bookings(&self, scope: BookingScope) -> Vec<Booking> {
        match scope {
            BookingScope::Booker(booker_id) => {
                let ids = self
                    .bookings_by_booker
                    .get(&booker_id)
                    .map(|e| e.value().clone())
                    .unwrap_or_default();
                self.resolve_bookings(&ids)
            }
            BookingScope::Owner(owner_id) => {
                let item_ids = self
                    .items_by_owner
                    .get(&owner_id)
                    .map(|e| e.value().clone())
                    .unwrap_or_default();
                item_ids
                    .iter()
                    .flat_map(|item_id| self.bookings_of_item(item_id))
                    .collect()
            }
        }
    }
}

#[async_trait]
impl UserDirectory for Ledger {
    async fn find_user(&self, id: Ulid) -> Result<Option<User>, StoreError> {
        Ok(self.users.get(&id).map(|u| u.value().clone()))
    }

    async fn insert_user(&self, name: String, email: String) -> Result<User, StoreError> {
        let _guard = self.write_lock.lock().await;
        if self.email_taken_by_other(&email, None) {
            return Err(StoreError::DuplicateEmail(email));
        }
        let id = Ulid::new();
        let user = User {
            id,
            name: name.clone(),
            email: email.clone(),
        };
        self.commit(Event::UserRegistered { id, name, email }).await?;
        Ok(user)
    }

    async fn update_user(&self, user: &User) -> Result<User, StoreError> {
        let _guard = self.write_lock.lock().await;
        if !self.users.contains_key(&user.id) {
            return Err(StoreError::Missing(user.id));
        }
        if self.email_taken_by_other(&user.email, Some(user.id)) {
            return Err(StoreError::DuplicateEmail(user.email.clone()));
        }
        self.commit(Event::UserUpdated {
            id: user.id,
            name: user.name.clone(),
            email: user.email.clone(),
        })
        .await?;
        Ok(user.clone())
    }
}

#[async_trait]
impl ItemCatalog for Ledger {
    async fn find_item(&self, id: Ulid) -> Result<Option<Item>, StoreError> {
        Ok(self.items.get(&id).map(|i| i.value().clone()))
    }

    async fn insert_item(&self, item: NewItem) -> Result<Item, StoreError> {
        let _guard = self.write_lock.lock().await;
        let id = Ulid::new();
        let NewItem {
            owner_id,
            name,
            description,
            available,
            request_id,
        } = item;
        let item = Item {
            id,
            owner_id,
            name: name.clone(),
            description: description.clone(),
            available,
            request_id,
        };
        self.commit(Event::ItemListed {
            id,
            owner_id,
            name,
            description,
            available,
            request_id,
        })
        .await?;
        Ok(item)
    }

    async fn update_item(&self, item: &Item) -> Result<Item, StoreError> {
        let _guard = self.write_lock.lock().await;
        if !self.items.contains_key(&item.id) {
            return Err(StoreError::Missing(item.id));
        }
        self.commit(Event::ItemUpdated {
            id: item.id,
            name: item.name.clone(),
            description: item.description.clone(),
            available: item.available,
            request_id: item.request_id,
        })
        .await?;
        Ok(self
            .items
            .get(&item.id)
            .map(|i| i.value().clone())
            .unwrap_or_else(|| item.clone()))
    }

    async fn items_of_owner(&self, owner_id: Ulid) -> Result<Vec<Item>, StoreError> {
        let ids = self
            .items_by_owner
            .get(&owner_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        Ok(self.resolve_items(&ids))
    }

    async fn search_items(&self, text: &str) -> Result<Vec<Item>, StoreError> {
        let needle = text.to_lowercase();
        let mut hits: Vec<Item> = self
            .items
            .iter()
            .filter(|e| {
                let item = e.value();
                item.available
                    && (item.name.to_lowercase().contains(&needle)
                        || item.description.to_lowercase().contains(&needle))
            })
            .map(|e| e.value().clone())
            .collect();
        hits.sort_by_key(|item| item.id);
        Ok(hits)
    }

    async fn items_for_request(&self, request_id: Ulid) -> Result<Vec<Item>, StoreError> {
        let ids = self
            .items_by_request
            .get(&request_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        Ok(self.resolve_items(&ids))
    }
}

#[async_trait]
impl BookingStore for Ledger {
    async fn insert_booking(&self, booking: NewBooking) -> Result<Booking, StoreError> {
        let _guard = self.write_lock.lock().await;
        let id = Ulid::new();
        self.commit(Event::BookingRequested {
            id,
            item_id: booking.item_id,
            booker_id: booking.booker_id,
            span: booking.span,
        })
        .await?;
        Ok(Booking {
            id,
            span: booking.span,
            status: BookingStatus::Waiting,
            item_id: booking.item_id,
            booker_id: booking.booker_id,
        })
    }

    async fn update_booking(&self, booking: &Booking) -> Result<Booking, StoreError> {
        let _guard = self.write_lock.lock().await;
        let current = self
            .bookings
            .get(&booking.id)
            .map(|b| b.status)
            .ok_or(StoreError::Missing(booking.id))?;
        if current.is_decided() {
            return Err(StoreError::StaleWrite(booking.id));
        }
        self.commit(Event::BookingDecided {
            id: booking.id,
            status: booking.status,
        })
        .await?;
        self.bookings
            .get(&booking.id)
            .map(|b| b.value().clone())
            .ok_or(StoreError::Missing(booking.id))
    }

    async fn find_booking(&self, id: Ulid) -> Result<Option<Booking>, StoreError> {
        Ok(self.bookings.get(&id).map(|b| b.value().clone()))
    }

    async fn find_bookings(
        &self,
        scope: BookingScope,
        predicate: BookingPredicate,
        page: Option<Page>,
    ) -> Result<Vec<Booking>, StoreError> {
        let mut rows: Vec<Booking> = self
            .scoped_bookings(scope)
            .into_iter()
            .filter(|b| predicate.matches(b))
            .collect();
        rows.sort_by(|a, b| b.span.start.cmp(&a.span.start).then(b.id.cmp(&a.id)));

        Ok(match page {
            Some(page) => rows.into_iter().skip(page.skip()).take(page.size).collect(),
            None => rows,
        })
    }

    async fn last_booking(&self, item_id: Ulid, now: Ms) -> Result<Option<Booking>, StoreError> {
        Ok(self
            .bookings_of_item(&item_id)
            .into_iter()
            .filter(|b| b.span.ended_before(now))
            .max_by_key(|b| b.span.start))
    }

    async fn next_booking(&self, item_id: Ulid, now: Ms) -> Result<Option<Booking>, StoreError> {
        Ok(self
            .bookings_of_item(&item_id)
            .into_iter()
            .filter(|b| b.span.starts_after(now))
            .min_by_key(|b| b.span.start))
    }

    async fn count_where(
        &self,
        booker_id: Ulid,
        item_id: Ulid,
        status: BookingStatus,
        end_before: Ms,
    ) -> Result<u64, StoreError> {
        Ok(self
            .bookings_of_item(&item_id)
            .iter()
            .filter(|b| b.booker_id == booker_id && b.status == status && b.span.ended_before(end_before))
            .count() as u64)
    }
}

#[async_trait]
impl CommentStore for Ledger {
    async fn insert_comment(
        &self,
        item_id: Ulid,
        author_id: Ulid,
        text: String,
        created: Ms,
    ) -> Result<Comment, StoreError> {
        let _guard = self.write_lock.lock().await;
        let id = Ulid::new();
        let comment = Comment {
            id,
            item_id,
            author_id,
            text: text.clone(),
            created,
        };
        self.commit(Event::CommentPosted {
            id,
            item_id,
            author_id,
            text,
            created,
        })
        .await?;
        Ok(comment)
    }

    async fn comments_for_item(&self, item_id: Ulid) -> Result<Vec<Comment>, StoreError> {
        Ok(self
            .comments_by_item
            .get(&item_id)
            .map(|e| e.value().clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl RequestStore for Ledger {
    async fn insert_request(
        &self,
        requester_id: Ulid,
        description: String,
        created: Ms,
    ) -> Result<ItemRequest, StoreError> {
        let _guard = self.write_lock.lock().await;
        let id = Ulid::new();
        let request = ItemRequest {
            id,
            requester_id,
            description: description.clone(),
            created,
        };
        self.commit(Event::RequestPosted {
            id,
            requester_id,
            description,
            created,
        })
        .await?;
        Ok(request)
    }

    async fn find_request(&self, id: Ulid) -> Result<Option<ItemRequest>, StoreError> {
        Ok(self.requests.get(&id).map(|r| r.value().clone()))
    }

    async fn requests_of(&self, requester_id: Ulid) -> Result<Vec<ItemRequest>, StoreError> {
        let ids = self
            .requests_by_user
            .get(&requester_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut rows: Vec<ItemRequest> = ids
            .iter()
            .filter_map(|id| self.requests.get(id).map(|r| r.value().clone()))
            .collect();
        rows.sort_by(|a, b| b.created.cmp(&a.created).then(b.id.cmp(&a.id)));
        Ok(rows)
    }

    async fn requests_excluding(
        &self,
        user_id: Ulid,
        page: Page,
    ) -> Result<Vec<ItemRequest>, StoreError> {
        let mut rows: Vec<ItemRequest> = self
            .requests
            .iter()
            .filter(|e| e.value().requester_id != user_id)
            .map(|e| e.value().clone())
            .collect();
        rows.sort_by(|a, b| b.created.cmp(&a.created).then(b.id.cmp(&a.id)));
        Ok(rows.into_iter().skip(page.skip()).take(page.size).collect())
    }
}
