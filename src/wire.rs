use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use serde::Serialize;
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::LenditAuthSource;
use crate::catalog::Catalog;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, ListingSide};

pub struct LenditHandler {
    engine: Arc<Engine>,
    catalog: Arc<Catalog>,
    query_parser: Arc<LenditQueryParser>,
}

impl LenditHandler {
    pub fn new(engine: Arc<Engine>, catalog: Arc<Catalog>) -> Self {
        Self {
            engine,
            catalog,
            query_parser: Arc::new(LenditQueryParser),
        }
    }

    /// Run one statement, encoding result columns in `format`.
    async fn execute_sql(&self, sql: &str, format: &Format) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();

        let result = self.execute_command(cmd, format).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command, format: &Format) -> PgWireResult<Response> {
        match cmd {
            Command::RegisterUser { name, email } => {
                let user = self.catalog.register_user(name, email).await.map_err(engine_err)?;
                user_rows(&[user], format)
            }
            Command::UpdateUser { id, name, email } => {
                let user = self.catalog.update_user(id, name, email).await.map_err(engine_err)?;
                user_rows(&[user], format)
            }
            Command::SelectUser { id } => {
                let user = self.catalog.find_user(id).await.map_err(engine_err)?;
                user_rows(&[user], format)
            }
            Command::ListItem {
                owner_id,
                name,
                description,
                available,
                request_id,
            } => {
                let item = self
                    .catalog
                    .list_item(NewItem {
                        owner_id,
                        name,
                        description,
                        available,
                        request_id,
                    })
                    .await
                    .map_err(engine_err)?;
                item_rows(&[ItemView::bare(item)], format)
            }
            Command::UpdateItem { id, user_id, patch } => {
                let item = self
                    .catalog
                    .update_item(user_id, id, patch)
                    .await
                    .map_err(engine_err)?;
                item_rows(&[ItemView::bare(item)], format)
            }
            Command::RequestBooking {
                booker_id,
                item_id,
                start,
                end,
            } => {
                let view = self
                    .engine
                    .create_booking(booker_id, item_id, start, end)
                    .await
                    .map_err(engine_err)?;
                booking_rows(&[view], format)
            }
            Command::DecideBooking {
                booking_id,
                user_id,
                approved,
            } => {
                let view = self
                    .engine
                    .set_approved(user_id, booking_id, approved)
                    .await
                    .map_err(engine_err)?;
                booking_rows(&[view], format)
            }
            Command::PostComment {
                author_id,
                item_id,
                text,
            } => {
                let comment = self
                    .catalog
                    .post_comment(author_id, item_id, text)
                    .await
                    .map_err(engine_err)?;
                comment_rows(&[comment], format)
            }
            Command::PostRequest {
                requester_id,
                description,
            } => {
                let request = self
                    .catalog
                    .post_request(requester_id, description)
                    .await
                    .map_err(engine_err)?;
                request_rows(&[request], format)
            }
            Command::SelectBooking { id, user_id } => {
                let view = self.engine.find_booking(user_id, id).await.map_err(engine_err)?;
                booking_rows(&[view], format)
            }
            Command::SelectBookings {
                side,
                user_id,
                filter,
                page,
            } => {
                let views = match side {
                    ListingSide::Booker => self.engine.bookings_of_booker(user_id, filter, page).await,
                    ListingSide::Owner => self.engine.bookings_of_owner(user_id, filter, page).await,
                }
                .map_err(engine_err)?;
                booking_rows(&views, format)
            }
            Command::SelectItem { id, user_id } => {
                let view = self.catalog.view_item(user_id, id).await.map_err(engine_err)?;
                item_rows(&[view], format)
            }
            Command::SelectOwnerItems { owner_id } => {
                let views = self.catalog.items_of_owner(owner_id).await.map_err(engine_err)?;
                item_rows(&views, format)
            }
            Command::SearchItems { user_id, text } => {
                let items = self.catalog.search_items(user_id, &text).await.map_err(engine_err)?;
                let views: Vec<ItemView> = items.into_iter().map(ItemView::bare).collect();
                item_rows(&views, format)
            }
            Command::SelectRequest { id, user_id } => {
                let view = self.catalog.find_request(user_id, id).await.map_err(engine_err)?;
                request_rows(&[view], format)
            }
            Command::SelectOwnRequests { requester_id } => {
                let views = self.catalog.own_requests(requester_id).await.map_err(engine_err)?;
                request_rows(&views, format)
            }
            Command::SelectOtherRequests { user_id, page } => {
                let views = self
                    .catalog
                    .other_requests(user_id, page)
                    .await
                    .map_err(engine_err)?;
                request_rows(&views, format)
            }
        }
    }
}

// ── Row encoding ─────────────────────────────────────────────────

const BOOKING_COLUMNS: &[(&str, Type)] = &[
    ("id", Type::VARCHAR),
    ("start", Type::INT8),
    ("end", Type::INT8),
    ("status", Type::VARCHAR),
    ("item", Type::VARCHAR),
    ("booker", Type::VARCHAR),
];

const ITEM_COLUMNS: &[(&str, Type)] = &[
    ("id", Type::VARCHAR),
    ("name", Type::VARCHAR),
    ("description", Type::VARCHAR),
    ("available", Type::BOOL),
    ("request_id", Type::VARCHAR),
    ("last_booking", Type::VARCHAR),
    ("next_booking", Type::VARCHAR),
    ("comments", Type::VARCHAR),
];

const USER_COLUMNS: &[(&str, Type)] = &[
    ("id", Type::VARCHAR),
    ("name", Type::VARCHAR),
    ("email", Type::VARCHAR),
];

const COMMENT_COLUMNS: &[(&str, Type)] = &[
    ("id", Type::VARCHAR),
    ("text", Type::VARCHAR),
    ("author_name", Type::VARCHAR),
    ("created", Type::INT8),
];

const REQUEST_COLUMNS: &[(&str, Type)] = &[
    ("id", Type::VARCHAR),
    ("description", Type::VARCHAR),
    ("created", Type::INT8),
    ("items", Type::VARCHAR),
];

/// Result schema in the per-column formats the client asked for. Columns
/// past the end of a short format list are sent as text.
fn schema(columns: &[(&str, Type)], format: &Format) -> Arc<Vec<FieldInfo>> {
    let format_for = |i: usize| match format {
        Format::Individual(codes) if i >= codes.len() => FieldFormat::Text,
        _ => format.format_for(i),
    };
    Arc::new(
        columns
            .iter()
            .enumerate()
            .map(|(i, (name, ty))| FieldInfo::new((*name).into(), None, None, ty.clone(), format_for(i)))
            .collect(),
    )
}

fn to_json<T: Serialize>(value: &T) -> PgWireResult<String> {
    serde_json::to_string(value).map_err(|e| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "XX000".into(),
            format!("encoding failed: {e}"),
        )))
    })
}

fn optional_json<T: Serialize>(value: Option<&T>) -> PgWireResult<Option<String>> {
    value.map(to_json).transpose()
}

fn booking_rows(views: &[BookingView], format: &Format) -> PgWireResult<Response> {
    let schema = schema(BOOKING_COLUMNS, format);
    let rows: Vec<PgWireResult<_>> = views
        .iter()
        .map(|view| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&view.id.to_string())?;
            encoder.encode_field(&view.start)?;
            encoder.encode_field(&view.end)?;
            encoder.encode_field(&view.status.as_str())?;
            encoder.encode_field(&optional_json(view.item.as_ref())?)?;
            encoder.encode_field(&optional_json(view.booker.as_ref())?)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn item_rows(views: &[ItemView], format: &Format) -> PgWireResult<Response> {
    let schema = schema(ITEM_COLUMNS, format);
    let rows: Vec<PgWireResult<_>> = views
        .iter()
        .map(|view| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&view.id.to_string())?;
            encoder.encode_field(&view.name)?;
            encoder.encode_field(&view.description)?;
            encoder.encode_field(&view.available)?;
            encoder.encode_field(&view.request_id.map(|id| id.to_string()))?;
            encoder.encode_field(&optional_json(view.last_booking.as_ref())?)?;
            encoder.encode_field(&optional_json(view.next_booking.as_ref())?)?;
            encoder.encode_field(&to_json(&view.comments)?)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn user_rows(users: &[User], format: &Format) -> PgWireResult<Response> {
    let schema = schema(USER_COLUMNS, format);
    let rows: Vec<PgWireResult<_>> = users
        .iter()
        .map(|user| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&user.id.to_string())?;
            encoder.encode_field(&user.name)?;
            encoder.encode_field(&user.email)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn comment_rows(comments: &[CommentView], format: &Format) -> PgWireResult<Response> {
    let schema = schema(COMMENT_COLUMNS, format);
    let rows: Vec<PgWireResult<_>> = comments
        .iter()
        .map(|comment| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&comment.id.to_string())?;
            encoder.encode_field(&comment.text)?;
            encoder.encode_field(&comment.author_name)?;
            encoder.encode_field(&comment.created)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn request_rows(requests: &[ItemRequestView], format: &Format) -> PgWireResult<Response> {
    let schema = schema(REQUEST_COLUMNS, format);
    let rows: Vec<PgWireResult<_>> = requests
        .iter()
        .map(|request| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&request.id.to_string())?;
            encoder.encode_field(&request.description)?;
            encoder.encode_field(&request.created)?;
            encoder.encode_field(&to_json(&request.items)?)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// Result columns for a statement, keyed on the table it targets. Works on
/// unbound statements, where `$n` placeholders would not parse as values.
fn schema_for(sql: &str, format: &Format) -> Vec<FieldInfo> {
    let mut words = sql.split_whitespace();
    let table = loop {
        match words.next() {
            Some(w)
                if w.eq_ignore_ascii_case("into")
                    || w.eq_ignore_ascii_case("from")
                    || w.eq_ignore_ascii_case("update") =>
            {
                break words.next();
            }
            Some(_) => continue,
            None => break None,
        }
    };
    let table = table
        .and_then(|t| {
            t.trim_start_matches('"')
                .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .next()
        })
        .map(str::to_lowercase)
        .unwrap_or_default();
    let columns = match table.as_str() {
        "bookings" | "booking_decisions" => BOOKING_COLUMNS,
        "items" => ITEM_COLUMNS,
        "users" => USER_COLUMNS,
        "comments" => COMMENT_COLUMNS,
        "item_requests" => REQUEST_COLUMNS,
        _ => return vec![],
    };
    Arc::unwrap_or_clone(schema(columns, format))
}

#[async_trait]
impl SimpleQueryHandler for LenditHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.execute_sql(query, &Format::UnifiedText).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct LenditQueryParser;

#[async_trait]
impl QueryParser for LenditQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for(stmt, column_format.unwrap_or(&Format::UnifiedText)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for LenditHandler {
    type Statement = String;
    type QueryParser = LenditQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        self.execute_sql(&sql, &portal.result_column_format).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            schema_for(&target.statement, &Format::UnifiedText),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(schema_for(
            &target.statement.statement,
            &target.result_column_format,
        )))
    }
}

/// SQL text split around `$N` placeholders.
#[derive(Debug, PartialEq)]
enum Piece<'a> {
    Text(&'a str),
    Param(usize),
}

/// One left-to-right pass. Quoted literals and identifiers are copied whole,
/// so a `$1` between quotes stays text. A doubled quote closes and reopens
/// the literal, which leaves it intact.
fn split_placeholders(sql: &str) -> Vec<Piece<'_>> {
    let bytes = sql.as_bytes();
    let mut pieces = Vec::new();
    let mut text_start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"') => {
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
                i += 1;
            }
            b'$' => {
                let digits_end = bytes[i + 1..]
                    .iter()
                    .position(|b| !b.is_ascii_digit())
                    .map_or(bytes.len(), |n| i + 1 + n);
                if let Ok(n @ 1..) = sql[i + 1..digits_end].parse::<usize>() {
                    if text_start < i {
                        pieces.push(Piece::Text(&sql[text_start..i]));
                    }
                    pieces.push(Piece::Param(n));
                    text_start = digits_end;
                }
                i = digits_end.max(i + 1);
            }
            _ => i += 1,
        }
    }
    if text_start < sql.len() {
        pieces.push(Piece::Text(&sql[text_start..]));
    }
    pieces
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    split_placeholders(sql)
        .iter()
        .filter_map(|piece| match piece {
            Piece::Param(n) => Some(*n),
            Piece::Text(_) => None,
        })
        .max()
        .unwrap_or(0)
}

/// Substitute `$1, $2, ...` with bound parameter values as quoted text.
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<&[u8]>> = portal.parameters.iter().map(|p| p.as_deref()).collect();
    bind_text_params(&portal.statement.statement, &params)
}

/// Each placeholder is replaced exactly once; bound values are never rescanned.
/// A placeholder with no bound value is left for the parser to reject.
fn bind_text_params(sql: &str, params: &[Option<&[u8]>]) -> String {
    let mut out = String::with_capacity(sql.len());
    for piece in split_placeholders(sql) {
        match piece {
            Piece::Text(text) => out.push_str(text),
            Piece::Param(n) => match params.get(n - 1) {
                Some(Some(bytes)) => {
                    out.push('\'');
                    out.push_str(&String::from_utf8_lossy(bytes).replace('\'', "''"));
                    out.push('\'');
                }
                Some(None) => out.push_str("NULL"),
                None => {
                    out.push('$');
                    out.push_str(&n.to_string());
                }
            },
        }
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct LenditFactory {
    handler: Arc<LenditHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<LenditAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl LenditFactory {
    pub fn new(engine: Arc<Engine>, catalog: Arc<Catalog>, password: String) -> Self {
        let auth_source = LenditAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(LenditHandler::new(engine, catalog)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for LenditFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    catalog: Arc<Catalog>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let factory = LenditFactory::new(engine, catalog, password);
    pgwire::tokio::process_socket(socket, tls, factory).await?;
    Ok(())
}

// ── Errors ───────────────────────────────────────────────────────

fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) => "P0002",
        EngineError::BadRequest(_) => "22023",
        EngineError::Conflict(_) => "23505",
        EngineError::Storage(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    debug!("request failed: {e}");
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        engine_sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
