use sqlparser::ast::{
    self, AssignmentTarget, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject,
    Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Which side of a booking a listing is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingSide {
    Booker,
    Owner,
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    RegisterUser {
        name: String,
        email: String,
    },
    UpdateUser {
        id: Ulid,
        name: Option<String>,
        email: Option<String>,
    },
    SelectUser {
        id: Ulid,
    },
    ListItem {
        owner_id: Ulid,
        name: String,
        description: String,
        available: bool,
        request_id: Option<Ulid>,
    },
    UpdateItem {
        id: Ulid,
        user_id: Ulid,
        patch: ItemPatch,
    },
    RequestBooking {
        booker_id: Ulid,
        item_id: Ulid,
        start: Ms,
        end: Ms,
    },
    DecideBooking {
        booking_id: Ulid,
        user_id: Ulid,
        approved: bool,
    },
    PostComment {
        author_id: Ulid,
        item_id: Ulid,
        text: String,
    },
    PostRequest {
        requester_id: Ulid,
        description: String,
    },
    SelectBooking {
        id: Ulid,
        user_id: Ulid,
    },
    SelectBookings {
        side: ListingSide,
        user_id: Ulid,
        filter: BookingFilter,
        page: PageRequest,
    },
    SelectItem {
        id: Ulid,
        user_id: Ulid,
    },
    SelectOwnerItems {
        owner_id: Ulid,
    },
    SearchItems {
        user_id: Ulid,
        text: String,
    },
    SelectRequest {
        id: Ulid,
        user_id: Ulid,
    },
    SelectOwnRequests {
        requester_id: Ulid,
    },
    SelectOtherRequests {
        user_id: Ulid,
        page: PageRequest,
    },
}

// Insertable columns per table. Without a column list, VALUES follow this
// order and the leading `required` columns must be present.
const USER_COLUMNS: &[&str] = &["name", "email"];
const ITEM_COLUMNS: &[&str] = &["owner_id", "name", "description", "available", "request_id"];
const BOOKING_COLUMNS: &[&str] = &["booker_id", "item_id", "start", "end"];
const DECISION_COLUMNS: &[&str] = &["booking_id", "user_id", "approved"];
const COMMENT_COLUMNS: &[&str] = &["author_id", "item_id", "text"];
const REQUEST_COLUMNS: &[&str] = &["requester_id", "description"];

// Columns an UPDATE may set.
const USER_UPDATE_COLUMNS: &[&str] = &["name", "email"];
const ITEM_UPDATE_COLUMNS: &[&str] = &["name", "description", "available", "request_id"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(first) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match first {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection.as_ref()),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "users" => {
            let row = insert_row("users", insert, USER_COLUMNS, 2)?;
            Ok(Command::RegisterUser {
                name: parse_string(row.require("name")?)?,
                email: parse_string(row.require("email")?)?,
            })
        }
        "items" => {
            let row = insert_row("items", insert, ITEM_COLUMNS, 3)?;
            Ok(Command::ListItem {
                owner_id: parse_ulid(row.require("owner_id")?)?,
                name: parse_string(row.require("name")?)?,
                description: parse_string(row.require("description")?)?,
                available: parse_nullable(row.get("available"), parse_bool)?.unwrap_or(true),
                request_id: parse_nullable(row.get("request_id"), parse_ulid)?,
            })
        }
        "bookings" => {
            let row = insert_row("bookings", insert, BOOKING_COLUMNS, 4)?;
            Ok(Command::RequestBooking {
                booker_id: parse_ulid(row.require("booker_id")?)?,
                item_id: parse_ulid(row.require("item_id")?)?,
                start: parse_i64(row.require("start")?)?,
                end: parse_i64(row.require("end")?)?,
            })
        }
        "booking_decisions" => {
            let row = insert_row("booking_decisions", insert, DECISION_COLUMNS, 3)?;
            Ok(Command::DecideBooking {
                booking_id: parse_ulid(row.require("booking_id")?)?,
                user_id: parse_ulid(row.require("user_id")?)?,
                approved: parse_bool(row.require("approved")?)?,
            })
        }
        "comments" => {
            let row = insert_row("comments", insert, COMMENT_COLUMNS, 3)?;
            Ok(Command::PostComment {
                author_id: parse_ulid(row.require("author_id")?)?,
                item_id: parse_ulid(row.require("item_id")?)?,
                text: parse_string(row.require("text")?)?,
            })
        }
        "item_requests" => {
            let row = insert_row("item_requests", insert, REQUEST_COLUMNS, 2)?;
            Ok(Command::PostRequest {
                requester_id: parse_ulid(row.require("requester_id")?)?,
                description: parse_string(row.require("description")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `UPDATE users SET .. WHERE id = ..` and
/// `UPDATE items SET .. WHERE id = .. AND user_id = ..`. NULL leaves a field as is.
fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let mut filters = Vec::new();
    if let Some(selection) = selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let find = |col: &str| filters.iter().find(|(c, _)| c == col).map(|(_, e)| e);

    match table.as_str() {
        "users" => {
            let set = assignment_row("users", assignments, USER_UPDATE_COLUMNS)?;
            let id = find("id").ok_or(SqlError::MissingFilter("id"))?;
            Ok(Command::UpdateUser {
                id: parse_ulid(id)?,
                name: parse_nullable(set.get("name"), parse_string)?,
                email: parse_nullable(set.get("email"), parse_string)?,
            })
        }
        "items" => {
            let set = assignment_row("items", assignments, ITEM_UPDATE_COLUMNS)?;
            let id = find("id").ok_or(SqlError::MissingFilter("id"))?;
            let user_id = find("user_id").ok_or(SqlError::MissingFilter("user_id"))?;
            Ok(Command::UpdateItem {
                id: parse_ulid(id)?,
                user_id: parse_ulid(user_id)?,
                patch: ItemPatch {
                    name: parse_nullable(set.get("name"), parse_string)?,
                    description: parse_nullable(set.get("description"), parse_string)?,
                    available: parse_nullable(set.get("available"), parse_bool)?,
                    request_id: parse_nullable(set.get("request_id"), parse_ulid)?,
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let find = |col: &str| filters.iter().find(|(c, _)| c == col).map(|(_, e)| e);
    let page = || -> Result<PageRequest, SqlError> {
        let mut page = PageRequest::default();
        if let Some(expr) = find("page") {
            page.offset = parse_i64(expr)?;
        }
        if let Some(expr) = find("size") {
            page.size = parse_i64(expr)?;
        }
        Ok(page)
    };

    match table.as_str() {
        "bookings" => {
            if let Some(id) = find("id") {
                let user_id = find("user_id").ok_or(SqlError::MissingFilter("user_id"))?;
                return Ok(Command::SelectBooking {
                    id: parse_ulid(id)?,
                    user_id: parse_ulid(user_id)?,
                });
            }
            let (side, user_id) = match (find("booker_id"), find("owner_id")) {
                (Some(u), None) => (ListingSide::Booker, u),
                (None, Some(u)) => (ListingSide::Owner, u),
                (Some(_), Some(_)) => {
                    return Err(SqlError::Parse("booker_id and owner_id are exclusive".into()));
                }
                (None, None) => return Err(SqlError::MissingFilter("booker_id or owner_id")),
            };
            let filter = match find("state") {
                Some(expr) => {
                    let s = parse_string(expr)?;
                    BookingFilter::parse(&s).ok_or(SqlError::UnknownState(s))?
                }
                None => BookingFilter::All,
            };
            Ok(Command::SelectBookings {
                side,
                user_id: parse_ulid(user_id)?,
                filter,
                page: page()?,
            })
        }
        "items" => {
            if let Some(id) = find("id") {
                let user_id = find("user_id").ok_or(SqlError::MissingFilter("user_id"))?;
                return Ok(Command::SelectItem {
                    id: parse_ulid(id)?,
                    user_id: parse_ulid(user_id)?,
                });
            }
            if let Some(text) = find("text") {
                let user_id = find("user_id").ok_or(SqlError::MissingFilter("user_id"))?;
                return Ok(Command::SearchItems {
                    user_id: parse_ulid(user_id)?,
                    text: parse_string(text)?,
                });
            }
            let owner_id = find("owner_id").ok_or(SqlError::MissingFilter("owner_id"))?;
            Ok(Command::SelectOwnerItems {
                owner_id: parse_ulid(owner_id)?,
            })
        }
        "users" => {
            let id = find("id").ok_or(SqlError::MissingFilter("id"))?;
            Ok(Command::SelectUser { id: parse_ulid(id)? })
        }
        "item_requests" => {
            if let Some(id) = find("id") {
                let user_id = find("user_id").ok_or(SqlError::MissingFilter("user_id"))?;
                return Ok(Command::SelectRequest {
                    id: parse_ulid(id)?,
                    user_id: parse_ulid(user_id)?,
                });
            }
            if let Some(requester_id) = find("requester_id") {
                return Ok(Command::SelectOwnRequests {
                    requester_id: parse_ulid(requester_id)?,
                });
            }
            let user_id = find("user_id").ok_or(SqlError::MissingFilter("requester_id or user_id"))?;
            Ok(Command::SelectOtherRequests {
                user_id: parse_ulid(user_id)?,
                page: page()?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = x AND b = y AND ...` into `(column, value)` pairs.
fn collect_eq_filters(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_eq_filters(left, out)?;
                collect_eq_filters(right, out)
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
                out.push((col, right.as_ref().clone()));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("operator {other}"))),
        },
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

/// Column → value cells of one INSERT row or one UPDATE's SET list.
struct Row {
    table: &'static str,
    cells: Vec<(&'static str, Expr)>,
}

impl Row {
    fn new(table: &'static str) -> Self {
        Self {
            table,
            cells: Vec::new(),
        }
    }

    /// `name` must be one of `columns` and not already set.
    fn push(&mut self, columns: &[&'static str], name: &str, value: Expr) -> Result<(), SqlError> {
        let column = columns
            .iter()
            .copied()
            .find(|c| c.eq_ignore_ascii_case(name))
            .ok_or_else(|| SqlError::UnknownColumn(self.table, name.to_string()))?;
        if self.get(column).is_some() {
            return Err(SqlError::DuplicateColumn(self.table, column));
        }
        self.cells.push((column, value));
        Ok(())
    }

    fn get(&self, column: &str) -> Option<&Expr> {
        self.cells.iter().find(|(c, _)| *c == column).map(|(_, e)| e)
    }

    fn require(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(self.table, column))
    }
}

/// Pair a single VALUES row with its columns. An explicit column list may name
/// `columns` in any order; without one, values are taken positionally.
fn insert_row(
    table: &'static str,
    insert: &ast::Insert,
    columns: &[&'static str],
    required: usize,
) -> Result<Row, SqlError> {
    let values = extract_insert_values(insert)?;
    let mut row = Row::new(table);

    if insert.columns.is_empty() {
        if values.len() < required {
            return Err(SqlError::WrongArity(table, required, values.len()));
        }
        if values.len() > columns.len() {
            return Err(SqlError::WrongArity(table, columns.len(), values.len()));
        }
        for (column, value) in columns.iter().zip(values) {
            row.push(columns, column, value)?;
        }
    } else {
        if insert.columns.len() != values.len() {
            return Err(SqlError::WrongArity(table, insert.columns.len(), values.len()));
        }
        for (ident, value) in insert.columns.iter().zip(values) {
            row.push(columns, &ident.value, value)?;
        }
    }

    for column in &columns[..required] {
        row.require(*column)?;
    }
    Ok(row)
}

fn assignment_row(
    table: &'static str,
    assignments: &[ast::Assignment],
    columns: &[&'static str],
) -> Result<Row, SqlError> {
    let mut row = Row::new(table);
    for assignment in assignments {
        let name = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported(format!("assignment to {}", assignment.target)))?;
        row.push(columns, &name, assignment.value.clone())?;
    }
    Ok(row)
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row VALUES".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

/// `None` for an absent column or an explicit NULL.
fn parse_nullable<T>(
    expr: Option<&Expr>,
    parse: fn(&Expr) -> Result<T, SqlError>,
) -> Result<Option<T>, SqlError> {
    match expr {
        None => Ok(None),
        Some(expr) if matches!(extract_value(expr), Some(Value::Null)) => Ok(None),
        Some(expr) => parse(expr).map(Some),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownState(String),
    WrongArity(&'static str, usize, usize),
    UnknownColumn(&'static str, String),
    DuplicateColumn(&'static str, &'static str),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownState(s) => write!(f, "Unknown state: {s}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::UnknownColumn(t, col) => write!(f, "{t}: unknown column {col}"),
            SqlError::DuplicateColumn(t, col) => write!(f, "{t}: column {col} given twice"),
            SqlError::MissingColumn(t, col) => write!(f, "{t}: missing column {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
