use sqlparser::ast::{
    self, AssignmentTarget, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject,
    Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::ReservationStatus;

/// Parsed command from SQL input. Times stay as the caller wrote them
/// (RFC 3339 text or Unix milliseconds); the engine parses them.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertReservation {
        id: Ulid,
        amenity_id: Ulid,
        start: String,
        end: String,
    },
    SetStatus {
        id: Ulid,
        status: ReservationStatus,
        reason: Option<String>,
    },
    HideReservation {
        id: Ulid,
    },
    SelectOwnReservations,
    SelectReservation {
        id: Ulid,
    },
    SelectPending,
    SelectAmenityReservations {
        amenity_id: Ulid,
        start: String,
        end: String,
    },
    SelectOccupancy {
        amenity_id: Ulid,
        start: String,
        end: String,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    if table != "reservations" {
        return Err(SqlError::UnknownTable(table));
    }
    let values = extract_insert_values(insert)?;
    if values.len() != 4 {
        return Err(SqlError::WrongArity("reservations", 4, values.len()));
    }
    Ok(Command::InsertReservation {
        id: parse_ulid_expr(&values[0])?,
        amenity_id: parse_ulid_expr(&values[1])?,
        start: parse_instant_expr(&values[2])?,
        end: parse_instant_expr(&values[3])?,
    })
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let name = table_factor_name(&table.relation)?;
    if name != "reservations" {
        return Err(SqlError::UnknownTable(name));
    }
    let id = extract_where_id(selection)?;

    let (mut status, mut reason, mut hidden) = (None, None, None);
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        match column.as_str() {
            "status" => status = Some(parse_string_expr(&assignment.value)?),
            "reason" => reason = parse_string_or_null(&assignment.value)?,
            "hidden" => hidden = Some(parse_bool(&assignment.value)?),
            other => return Err(SqlError::ReadOnlyColumn(other.to_string())),
        }
    }

    match (status, hidden) {
        (Some(raw), None) => {
            let status = ReservationStatus::parse(&raw)
                .ok_or_else(|| SqlError::Parse(format!("unknown status: {raw}")))?;
            match status {
                ReservationStatus::Confirmed | ReservationStatus::Cancelled => {}
                other => {
                    return Err(SqlError::Unsupported(format!(
                        "status cannot be set to {other}"
                    )));
                }
            }
            if reason.is_some() && status != ReservationStatus::Cancelled {
                return Err(SqlError::Unsupported("reason only applies to cancellation".into()));
            }
            Ok(Command::SetStatus { id, status, reason })
        }
        (None, Some(true)) if reason.is_none() => Ok(Command::HideReservation { id }),
        (None, Some(false)) => Err(SqlError::Unsupported("reservations cannot be unhidden".into())),
        (None, None) => Err(SqlError::MissingAssignment),
        _ => Err(SqlError::Unsupported("set either status or hidden, not both".into())),
    }
}

#[derive(Debug, Default)]
struct Filters {
    id: Option<Ulid>,
    amenity_id: Option<Ulid>,
    status: Option<String>,
    start: Option<String>,
    end: Option<String>,
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "reservations" => {
            if let Some(id) = filters.id {
                return Ok(Command::SelectReservation { id });
            }
            if let Some(status) = filters.status {
                return match ReservationStatus::parse(&status) {
                    Some(ReservationStatus::Pending) => Ok(Command::SelectPending),
                    _ => Err(SqlError::Unsupported(format!(
                        "listing by status {status}; only pending is supported"
                    ))),
                };
            }
            if let Some(amenity_id) = filters.amenity_id {
                return Ok(Command::SelectAmenityReservations {
                    amenity_id,
                    start: filters.start.ok_or(SqlError::MissingFilter("start"))?,
                    end: filters.end.ok_or(SqlError::MissingFilter("end"))?,
                });
            }
            Ok(Command::SelectOwnReservations)
        }
        "occupancy" => Ok(Command::SelectOccupancy {
            amenity_id: filters.amenity_id.ok_or(SqlError::MissingFilter("amenity_id"))?,
            start: filters.start.ok_or(SqlError::MissingFilter("start"))?,
            end: filters.end.ok_or(SqlError::MissingFilter("end"))?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    let Expr::BinaryOp { left, op, right } = expr else {
        return Err(SqlError::Unsupported(format!("filter {expr}")));
    };
    let column = expr_column_name(left);
    match (op, column.as_deref()) {
        (ast::BinaryOperator::And, _) => {
            extract_filters(left, filters)?;
            extract_filters(right, filters)?;
        }
        (ast::BinaryOperator::Eq, Some("id")) => filters.id = Some(parse_ulid_expr(right)?),
        (ast::BinaryOperator::Eq, Some("amenity_id")) => {
            filters.amenity_id = Some(parse_ulid_expr(right)?)
        }
        (ast::BinaryOperator::Eq, Some("status")) => {
            filters.status = Some(parse_string_expr(right)?)
        }
        (ast::BinaryOperator::GtEq, Some("start")) => {
            filters.start = Some(parse_instant_expr(right)?)
        }
        (ast::BinaryOperator::LtEq, Some("end")) => filters.end = Some(parse_instant_expr(right)?),
        _ => return Err(SqlError::Unsupported(format!("filter {expr}"))),
    }
    Ok(())
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
            [row] => Ok(row.clone()),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("one reservation per INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    match selection {
        Some(Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
        _ => Err(SqlError::MissingFilter("id")),
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string_expr(expr).map(Some),
    }
}

/// Instants travel as quoted RFC 3339 text or bare Unix milliseconds.
fn parse_instant_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected timestamp, got {value}"))),
        None => match expr {
            Expr::UnaryOp {
                op: ast::UnaryOperator::Minus,
                expr,
            } => parse_instant_expr(expr).map(|s| format!("-{s}")),
            _ => Err(SqlError::Parse(format!("expected value, got {expr}"))),
        },
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
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    MissingAssignment,
    ReadOnlyColumn(String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingAssignment => write!(f, "UPDATE must set status or hidden"),
            SqlError::ReadOnlyColumn(col) => write!(f, "column {col} cannot be updated"),
        }
    }
}

impl std::error::Error for SqlError {}
