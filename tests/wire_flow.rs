use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use lendit::catalog::Catalog;
use lendit::engine::Engine;
use lendit::store::Ledger;
use lendit::wire;

const HOUR: i64 = 3_600_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("lendit_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let ledger = Arc::new(Ledger::open(&dir.join("lendit.wal")).unwrap());
    let engine = Arc::new(Engine::over_ledger(ledger.clone()));
    let catalog = Arc::new(Catalog::over_ledger(ledger));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine.clone();
            let catalog = catalog.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, catalog, "lendit".to_string(), None)
                    .await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("lendit")
        .user("lendit")
        .password("lendit");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

async fn query(client: &tokio_postgres::Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

/// SQLSTATE of a failing statement.
async fn sqlstate(client: &tokio_postgres::Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.code().map(|c| c.code().to_string()).unwrap_or_default()
}

async fn register(client: &tokio_postgres::Client, name: &str) -> String {
    let rows = query(
        client,
        &format!("INSERT INTO users (name, email) VALUES ('{name}', '{name}@example.com')"),
    )
    .await;
    rows[0].get("id").unwrap().to_string()
}

async fn list_item(client: &tokio_postgres::Client, owner: &str, available: bool) -> String {
    let rows = query(
        client,
        &format!(
            "INSERT INTO items (owner_id, name, description, available) VALUES ('{owner}', 'drill', 'cordless', {available})"
        ),
    )
    .await;
    rows[0].get("id").unwrap().to_string()
}

async fn request(client: &tokio_postgres::Client, booker: &str, item: &str, start: i64, end: i64) -> SimpleQueryRow {
    let mut rows = query(
        client,
        &format!(
            r#"INSERT INTO bookings (booker_id, item_id, start, "end") VALUES ('{booker}', '{item}', {start}, {end})"#
        ),
    )
    .await;
    rows.remove(0)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn booking_lifecycle_over_the_wire() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let owner = register(&client, "owner").await;
    let booker = register(&client, "booker").await;
    let item = list_item(&client, &owner, true).await;

    let start = now_ms() + HOUR;
    let booking = request(&client, &booker, &item, start, start + HOUR).await;
    assert_eq!(booking.get("status"), Some("WAITING"));
    assert_eq!(booking.get("start"), Some(start.to_string().as_str()));
    let item_json: serde_json::Value = serde_json::from_str(booking.get("item").unwrap()).unwrap();
    assert_eq!(item_json["id"], item.as_str());
    let booker_json: serde_json::Value = serde_json::from_str(booking.get("booker").unwrap()).unwrap();
    assert_eq!(booker_json["name"], "booker");

    let id = booking.get("id").unwrap().to_string();
    let decided = query(
        &client,
        &format!("INSERT INTO booking_decisions (booking_id, user_id, approved) VALUES ('{id}', '{owner}', true)"),
    )
    .await;
    assert_eq!(decided[0].get("status"), Some("APPROVED"));

    // Second decision is a bad request
    let code = sqlstate(
        &client,
        &format!("INSERT INTO booking_decisions (booking_id, user_id, approved) VALUES ('{id}', '{owner}', false)"),
    )
    .await;
    assert_eq!(code, "22023");

    // Visible to booker and owner
    for user in [&booker, &owner] {
        let rows = query(&client, &format!("SELECT * FROM bookings WHERE id = '{id}' AND user_id = '{user}'")).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("status"), Some("APPROVED"));
    }
}

#[tokio::test]
async fn listings_by_side_and_state() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let owner = register(&client, "lister").await;
    let booker = register(&client, "renter").await;
    let item = list_item(&client, &owner, true).await;

    let base = now_ms() + HOUR;
    for i in 0..3 {
        request(&client, &booker, &item, base + i * HOUR, base + i * HOUR + HOUR / 2).await;
    }

    let all = query(&client, &format!("SELECT * FROM bookings WHERE booker_id = '{booker}'")).await;
    assert_eq!(all.len(), 3);
    let starts: Vec<i64> = all.iter().map(|r| r.get("start").unwrap().parse().unwrap()).collect();
    assert!(starts.windows(2).all(|w| w[0] > w[1]), "not start-descending: {starts:?}");

    let owner_future = query(
        &client,
        &format!("SELECT * FROM bookings WHERE owner_id = '{owner}' AND state = 'FUTURE'"),
    )
    .await;
    assert_eq!(owner_future.len(), 3);

    let past = query(&client, &format!("SELECT * FROM bookings WHERE booker_id = '{booker}' AND state = 'PAST'")).await;
    assert!(past.is_empty());

    let page = query(
        &client,
        &format!("SELECT * FROM bookings WHERE booker_id = '{booker}' AND page = 1 AND size = 2"),
    )
    .await;
    assert_eq!(page.len(), 1);

    let code = sqlstate(&client, &format!("SELECT * FROM bookings WHERE booker_id = '{booker}' AND size = 0")).await;
    assert_eq!(code, "22023");
    let code = sqlstate(&client, &format!("SELECT * FROM bookings WHERE booker_id = '{booker}' AND state = 'SOMETIME'")).await;
    assert_eq!(code, "42601");
}

#[tokio::test]
async fn error_kinds_map_to_sqlstates() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let owner = register(&client, "alice").await;
    let booker = register(&client, "bob").await;
    let stranger = register(&client, "carol").await;
    let item = list_item(&client, &owner, true).await;
    let closed = list_item(&client, &owner, false).await;
    let start = now_ms() + HOUR;

    // Owner booking own item
    let code = sqlstate(
        &client,
        &format!(r#"INSERT INTO bookings (booker_id, item_id, start, "end") VALUES ('{owner}', '{item}', {start}, {})"#, start + HOUR),
    )
    .await;
    assert_eq!(code, "P0002");

    // Unavailable item
    let code = sqlstate(
        &client,
        &format!(r#"INSERT INTO bookings (booker_id, item_id, start, "end") VALUES ('{booker}', '{closed}', {start}, {})"#, start + HOUR),
    )
    .await;
    assert_eq!(code, "22023");

    // Inverted window
    let code = sqlstate(
        &client,
        &format!(r#"INSERT INTO bookings (booker_id, item_id, start, "end") VALUES ('{booker}', '{item}', {}, {start})"#, start + HOUR),
    )
    .await;
    assert_eq!(code, "22023");

    // Non-participant view
    let booking = request(&client, &booker, &item, start, start + HOUR).await;
    let id = booking.get("id").unwrap();
    let code = sqlstate(&client, &format!("SELECT * FROM bookings WHERE id = '{id}' AND user_id = '{stranger}'")).await;
    assert_eq!(code, "P0002");

    // Duplicate email
    let code = sqlstate(&client, "INSERT INTO users (name, email) VALUES ('again', 'ALICE@example.com')").await;
    assert_eq!(code, "23505");

    // Unparseable SQL
    let code = sqlstate(&client, "SELEC nothing").await;
    assert_eq!(code, "42601");
}

#[tokio::test]
async fn item_view_shows_neighbours_to_owner_only() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let owner = register(&client, "dana").await;
    let booker = register(&client, "eli").await;
    let item = list_item(&client, &owner, true).await;
    let start = now_ms() + HOUR;
    request(&client, &booker, &item, start, start + HOUR).await;

    let owner_view = query(&client, &format!("SELECT * FROM items WHERE id = '{item}' AND user_id = '{owner}'")).await;
    let next: serde_json::Value = serde_json::from_str(owner_view[0].get("next_booking").unwrap()).unwrap();
    assert_eq!(next["booker_id"], booker.as_str());
    assert_eq!(owner_view[0].get("last_booking"), None);
    assert_eq!(owner_view[0].get("comments"), Some("[]"));

    let booker_view = query(&client, &format!("SELECT * FROM items WHERE id = '{item}' AND user_id = '{booker}'")).await;
    assert_eq!(booker_view[0].get("next_booking"), None);

    let owned = query(&client, &format!("SELECT * FROM items WHERE owner_id = '{owner}'")).await;
    assert_eq!(owned.len(), 1);

    // No finished approved rental yet
    let code = sqlstate(
        &client,
        &format!("INSERT INTO comments (author_id, item_id, text) VALUES ('{booker}', '{item}', 'nice')"),
    )
    .await;
    assert_eq!(code, "22023");
}

#[tokio::test]
async fn extended_query_binds_values_verbatim() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let name = "paid $2 a day, it's ok";
    let rows = client
        .query(
            "INSERT INTO users (name, email) VALUES ($1, $2)",
            &[&name, &"frank@example.com"],
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    let stored: String = rows[0].get("name");
    assert_eq!(stored, name);
    let email: String = rows[0].get("email");
    assert_eq!(email, "frank@example.com");

    let id: String = rows[0].get("id");
    let found = client
        .query("SELECT * FROM users WHERE id = $1", &[&id])
        .await
        .unwrap();
    let found_name: String = found[0].get("name");
    assert_eq!(found_name, name);
}

#[tokio::test]
async fn owner_update_closes_item_to_new_bookings() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let owner = register(&client, "gina").await;
    let booker = register(&client, "hal").await;
    let item = list_item(&client, &owner, true).await;

    // Only the owner may edit
    let code = sqlstate(
        &client,
        &format!("UPDATE items SET available = false WHERE id = '{item}' AND user_id = '{booker}'"),
    )
    .await;
    assert_eq!(code, "P0002");

    let updated = query(
        &client,
        &format!("UPDATE items SET available = false, name = 'hammer drill' WHERE id = '{item}' AND user_id = '{owner}'"),
    )
    .await;
    assert_eq!(updated[0].get("available"), Some("f"));
    assert_eq!(updated[0].get("name"), Some("hammer drill"));
    assert_eq!(updated[0].get("description"), Some("cordless"));

    let start = now_ms() + HOUR;
    let code = sqlstate(
        &client,
        &format!(r#"INSERT INTO bookings (booker_id, item_id, start, "end") VALUES ('{booker}', '{item}', {start}, {})"#, start + HOUR),
    )
    .await;
    assert_eq!(code, "22023");

    let renamed = query(&client, &format!("UPDATE users SET name = 'hal jr' WHERE id = '{booker}'")).await;
    assert_eq!(renamed[0].get("name"), Some("hal jr"));
    assert_eq!(renamed[0].get("email"), Some("hal@example.com"));
}

#[tokio::test]
async fn search_and_item_requests_over_the_wire() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let asker = register(&client, "ivy").await;
    let owner = register(&client, "jon").await;

    let posted = query(
        &client,
        &format!("INSERT INTO item_requests (requester_id, description) VALUES ('{asker}', 'need a tent')"),
    )
    .await;
    let request = posted[0].get("id").unwrap().to_string();
    assert_eq!(posted[0].get("items"), Some("[]"));

    let listed = query(
        &client,
        &format!(
            "INSERT INTO items (owner_id, name, description, available, request_id) VALUES ('{owner}', 'Tent', 'two person', true, '{request}')"
        ),
    )
    .await;
    assert_eq!(listed[0].get("request_id"), Some(request.as_str()));
    let item = listed[0].get("id").unwrap().to_string();

    let found = query(&client, &format!("SELECT * FROM items WHERE text = 'TENT' AND user_id = '{asker}'")).await;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get("id"), Some(item.as_str()));
    let blank = query(&client, &format!("SELECT * FROM items WHERE text = '' AND user_id = '{asker}'")).await;
    assert!(blank.is_empty());

    let own = query(&client, &format!("SELECT * FROM item_requests WHERE requester_id = '{asker}'")).await;
    assert_eq!(own.len(), 1);
    let answers: serde_json::Value = serde_json::from_str(own[0].get("items").unwrap()).unwrap();
    assert_eq!(answers[0]["id"], item.as_str());

    let others = query(&client, &format!("SELECT * FROM item_requests WHERE user_id = '{owner}'")).await;
    assert_eq!(others.len(), 1);
    assert!(query(&client, &format!("SELECT * FROM item_requests WHERE user_id = '{asker}'")).await.is_empty());

    let one = query(
        &client,
        &format!("SELECT * FROM item_requests WHERE id = '{request}' AND user_id = '{owner}'"),
    )
    .await;
    assert_eq!(one[0].get("description"), Some("need a tent"));

    let code = sqlstate(
        &client,
        &format!("SELECT * FROM item_requests WHERE id = '{}' AND user_id = '{owner}'", Ulid::new()),
    )
    .await;
    assert_eq!(code, "P0002");
}
