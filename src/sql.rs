use std::str::FromStr;

use rust_decimal::Decimal;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::keywords::Keyword;
use sqlparser::parser::{Parser, ParserError};
use sqlparser::tokenizer::Token;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertFacility {
        id: Ulid,
        name: String,
    },
    InsertFloor {
        id: Ulid,
        facility_id: Ulid,
        name: String,
    },
    InsertSpot {
        id: Ulid,
        floor_id: Ulid,
        label: String,
        vehicle_type: VehicleType,
        hourly_price: Decimal,
        reservable: bool,
    },
    InsertVehicle {
        id: Ulid,
        owner_id: Ulid,
        plate: String,
        vehicle_type: VehicleType,
    },
    InsertReservation {
        id: Ulid,
        user_id: Ulid,
        vehicle_id: Ulid,
        spot_id: Ulid,
        start: Ms,
        end: Ms,
    },
    /// Unset fields keep the reservation's current value.
    ModifyReservation {
        id: Ulid,
        vehicle_id: Option<Ulid>,
        spot_id: Option<Ulid>,
        start: Option<Ms>,
        end: Option<Ms>,
    },
    CancelReservation {
        id: Ulid,
    },
    CompleteReservation {
        id: Ulid,
    },
    DeleteReservation {
        id: Ulid,
    },
    InsertQuickReservation {
        id: Ulid,
        spot_id: Ulid,
        plate: String,
        vehicle_type: VehicleType,
    },
    CompleteQuickReservation {
        spot_id: Ulid,
    },
    CancelQuickReservation {
        id: Ulid,
    },
    InsertSensorEvent {
        spot_id: Ulid,
        plate: String,
        kind: SensorKind,
    },
    SelectReservations {
        filter: ReservationFilter,
        scope: Scope,
    },
    SelectQuickReservations {
        facility_id: Ulid,
        scope: Scope,
    },
    SelectSpots {
        facility_id: Ulid,
    },
    SelectOccupancy {
        facility_id: Ulid,
    },
    SelectSensorEvents {
        facility_id: Ulid,
        anomalies_only: bool,
    },
    /// Dry-run of the booking rules for a prospective window.
    SelectConflict {
        spot_id: Ulid,
        vehicle_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        return Ok(Command::Listen {
            channel: channel_name(&trimmed[7..]),
        });
    }
    if upper.starts_with("UNLISTEN ") {
        let channel = channel_name(&trimmed[9..]);
        return Ok(if channel == "*" {
            Command::UnlistenAll
        } else {
            Command::Unlisten { channel }
        });
    }
    if upper.starts_with("UPDATE ") {
        return parse_update(trimmed);
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql)?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Split a simple-protocol query string on semicolons outside quotes.
pub fn split_statements(sql: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, ch) in sql.char_indices() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => {}
            None if ch == '\'' || ch == '"' => quote = Some(ch),
            None if ch == ';' => {
                let stmt = sql[start..i].trim();
                if !stmt.is_empty() {
                    out.push(stmt);
                }
                start = i + 1;
            }
            None => {}
        }
    }
    let rest = sql[start..].trim();
    if !rest.is_empty() {
        out.push(rest);
    }
    out
}

fn channel_name(raw: &str) -> String {
    raw.trim().trim_matches('"').to_string()
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let row = InsertRow::from_insert(insert)?;

    match table.as_str() {
        "facilities" => Ok(Command::InsertFacility {
            id: parse_ulid_expr(row.require("id", 0)?)?,
            name: parse_text_expr(row.require("name", 1)?)?,
        }),
        "floors" => Ok(Command::InsertFloor {
            id: parse_ulid_expr(row.require("id", 0)?)?,
            facility_id: parse_ulid_expr(row.require("facility_id", 1)?)?,
            name: parse_text_expr(row.require("name", 2)?)?,
        }),
        "spots" => Ok(Command::InsertSpot {
            id: parse_ulid_expr(row.require("id", 0)?)?,
            floor_id: parse_ulid_expr(row.require("floor_id", 1)?)?,
            label: parse_text_expr(row.require("label", 2)?)?,
            vehicle_type: parse_enum_expr(row.require("vehicle_type", 3)?)?,
            hourly_price: parse_decimal_expr(row.require("hourly_price", 4)?)?,
            reservable: match row.get("reservable", 5) {
                Some(expr) => parse_bool(expr)?,
                None => true,
            },
        }),
        "vehicles" => Ok(Command::InsertVehicle {
            id: parse_ulid_expr(row.require("id", 0)?)?,
            owner_id: parse_ulid_expr(row.require("owner_id", 1)?)?,
            plate: parse_text_expr(row.require("plate", 2)?)?,
            vehicle_type: parse_enum_expr(row.require("vehicle_type", 3)?)?,
        }),
        "reservations" => Ok(Command::InsertReservation {
            id: parse_ulid_expr(row.require("id", 0)?)?,
            user_id: parse_ulid_expr(row.require("user_id", 1)?)?,
            vehicle_id: parse_ulid_expr(row.require("vehicle_id", 2)?)?,
            spot_id: parse_ulid_expr(row.require("spot_id", 3)?)?,
            start: parse_i64_expr(row.require("start", 4)?)?,
            end: parse_i64_expr(row.require("end", 5)?)?,
        }),
        "quick_reservations" => Ok(Command::InsertQuickReservation {
            id: parse_ulid_expr(row.require("id", 0)?)?,
            spot_id: parse_ulid_expr(row.require("spot_id", 1)?)?,
            plate: parse_text_expr(row.require("plate", 2)?)?,
            vehicle_type: parse_enum_expr(row.require("vehicle_type", 3)?)?,
        }),
        "sensor_events" => Ok(Command::InsertSensorEvent {
            spot_id: parse_ulid_expr(row.require("spot_id", 0)?)?,
            plate: parse_text_expr(row.require("plate", 1)?)?,
            kind: parse_enum_expr(row.require("kind", 2)?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(delete.selection.as_ref())?;

    match table.as_str() {
        "reservations" => Ok(Command::DeleteReservation {
            id: parse_ulid_expr(filters.require("id")?)?,
        }),
        _ => Err(SqlError::Unsupported(format!("DELETE FROM {table}"))),
    }
}

/// `UPDATE <table> SET col = value[, ...] WHERE col = value [AND ...]`.
fn parse_update(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let mut parser = Parser::new(&dialect).try_with_sql(sql)?;
    parser.expect_keyword(Keyword::UPDATE)?;
    let table = object_name_last(&parser.parse_object_name(false)?)
        .ok_or_else(|| SqlError::Parse("empty table name".into()))?;
    parser.expect_keyword(Keyword::SET)?;
    let assignments = parser.parse_comma_separated(|p| p.parse_assignment())?;
    let selection = if parser.parse_keyword(Keyword::WHERE) {
        Some(parser.parse_expr()?)
    } else {
        None
    };
    while parser.consume_token(&Token::SemiColon) {}
    if parser.peek_token().token != Token::EOF {
        return Err(SqlError::Unsupported("trailing input after UPDATE".into()));
    }

    let mut set = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            _ => return Err(SqlError::Unsupported("tuple assignment".into())),
        };
        set.push((column, assignment.value));
    }
    let filters = Filters::from_selection(selection.as_ref())?;

    match table.as_str() {
        "reservations" => parse_update_reservation(&set, &filters),
        "quick_reservations" => parse_update_quick(&set, &filters),
        _ => Err(SqlError::Unsupported(format!("UPDATE {table}"))),
    }
}

fn status_assignment(set: &[(String, Expr)]) -> Result<Option<Status>, SqlError> {
    let Some((_, expr)) = set.iter().find(|(col, _)| col == "status") else {
        return Ok(None);
    };
    if set.len() > 1 {
        return Err(SqlError::Unsupported(
            "status cannot be changed together with other columns".into(),
        ));
    }
    parse_enum_expr(expr).map(Some)
}

fn parse_update_reservation(set: &[(String, Expr)], filters: &Filters) -> Result<Command, SqlError> {
    let id = parse_ulid_expr(filters.require("id")?)?;
    match status_assignment(set)? {
        Some(Status::Cancelled) => return Ok(Command::CancelReservation { id }),
        Some(Status::Completed) => return Ok(Command::CompleteReservation { id }),
        Some(Status::Active) => {
            return Err(SqlError::Unsupported("a reservation cannot be reopened".into()));
        }
        None => {}
    }

    let (mut vehicle_id, mut spot_id, mut start, mut end) = (None, None, None, None);
    for (column, expr) in set {
        match column.as_str() {
            "vehicle_id" => vehicle_id = Some(parse_ulid_expr(expr)?),
            "spot_id" => spot_id = Some(parse_ulid_expr(expr)?),
            "start" => start = Some(parse_i64_expr(expr)?),
            "end" => end = Some(parse_i64_expr(expr)?),
            other => return Err(SqlError::UnknownColumn(other.to_string())),
        }
    }
    Ok(Command::ModifyReservation {
        id,
        vehicle_id,
        spot_id,
        start,
        end,
    })
}

fn parse_update_quick(set: &[(String, Expr)], filters: &Filters) -> Result<Command, SqlError> {
    match status_assignment(set)? {
        Some(Status::Completed) => Ok(Command::CompleteQuickReservation {
            spot_id: parse_ulid_expr(filters.require("spot_id")?)?,
        }),
        Some(Status::Cancelled) => Ok(Command::CancelQuickReservation {
            id: parse_ulid_expr(filters.require("id")?)?,
        }),
        _ => Err(SqlError::Unsupported(
            "walk-ins only accept status = 'completed' or 'cancelled'".into(),
        )),
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
    let filters = Filters::from_selection(select.selection.as_ref())?;

    match table.as_str() {
        "reservations" => {
            let filter = if let Some(user) = filters.get("user_id") {
                ReservationFilter::User(parse_ulid_expr(user)?)
            } else if let Some(facility) = filters.get("facility_id") {
                ReservationFilter::Facility(parse_ulid_expr(facility)?)
            } else {
                return Err(SqlError::MissingFilter("user_id or facility_id"));
            };
            Ok(Command::SelectReservations {
                filter,
                scope: filters.scope()?,
            })
        }
        "quick_reservations" => Ok(Command::SelectQuickReservations {
            facility_id: parse_ulid_expr(filters.require("facility_id")?)?,
            scope: filters.scope()?,
        }),
        "spots" => Ok(Command::SelectSpots {
            facility_id: parse_ulid_expr(filters.require("facility_id")?)?,
        }),
        "occupancy" => Ok(Command::SelectOccupancy {
            facility_id: parse_ulid_expr(filters.require("facility_id")?)?,
        }),
        "sensor_events" => Ok(Command::SelectSensorEvents {
            facility_id: parse_ulid_expr(filters.require("facility_id")?)?,
            anomalies_only: match filters.get("anomaly") {
                Some(expr) => parse_bool(expr)?,
                None => false,
            },
        }),
        "conflicts" => Ok(Command::SelectConflict {
            spot_id: parse_ulid_expr(filters.require("spot_id")?)?,
            vehicle_id: parse_ulid_expr(filters.require("vehicle_id")?)?,
            start: parse_i64_expr(filters.require("start")?)?,
            end: parse_i64_expr(filters.require("end")?)?,
            exclude: match filters.get("exclude") {
                Some(expr) => parse_ulid_or_null(expr)?,
                None => None,
            },
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Row and filter access ─────────────────────────────────────

/// One VALUES row, addressed by column name when the statement lists
/// columns and by position otherwise.
struct InsertRow {
    columns: Vec<String>,
    values: Vec<Expr>,
}

impl InsertRow {
    fn from_insert(insert: &ast::Insert) -> Result<Self, SqlError> {
        let body = insert
            .source
            .as_ref()
            .ok_or(SqlError::Parse("no VALUES".into()))?;
        let mut rows = match body.body.as_ref() {
            SetExpr::Values(values) => values.rows.clone(),
            _ => return Err(SqlError::Parse("expected VALUES".into())),
        };
        if rows.len() != 1 {
            return Err(SqlError::Unsupported(format!(
                "INSERT must carry exactly one row, got {}",
                rows.len()
            )));
        }
        let values = rows.remove(0);
        let columns: Vec<String> = insert
            .columns
            .iter()
            .map(|c| unquote(&c.to_string()))
            .collect();
        if !columns.is_empty() && columns.len() != values.len() {
            return Err(SqlError::WrongArity(columns.len(), values.len()));
        }
        Ok(Self { columns, values })
    }

    fn get(&self, column: &str, position: usize) -> Option<&Expr> {
        if self.columns.is_empty() {
            self.values.get(position)
        } else {
            let idx = self.columns.iter().position(|c| c == column)?;
            self.values.get(idx)
        }
    }

    fn require(&self, column: &'static str, position: usize) -> Result<&Expr, SqlError> {
        self.get(column, position)
            .ok_or(SqlError::MissingColumn(column))
    }
}

/// Equality filters from a WHERE clause of `col = value` terms joined by AND.
struct Filters(Vec<(String, Expr)>);

impl Filters {
    fn from_selection(selection: Option<&Expr>) -> Result<Self, SqlError> {
        let mut out = Vec::new();
        if let Some(expr) = selection {
            collect_eq_filters(expr, &mut out)?;
        }
        Ok(Self(out))
    }

    fn get(&self, column: &str) -> Option<&Expr> {
        self.0.iter().find(|(c, _)| c == column).map(|(_, e)| e)
    }

    fn require(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingFilter(column))
    }

    /// `scope` (or `status`) as active | history | all. Defaults to all.
    fn scope(&self) -> Result<Scope, SqlError> {
        let Some(expr) = self.get("scope").or_else(|| self.get("status")) else {
            return Ok(Scope::All);
        };
        match parse_text_expr(expr)?.to_lowercase().as_str() {
            "active" => Ok(Scope::Active),
            "history" => Ok(Scope::History),
            "all" => Ok(Scope::All),
            other => Err(SqlError::Parse(format!("unknown scope: {other}"))),
        }
    }
}

fn collect_eq_filters(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((column, right.as_ref().clone()));
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn unquote(name: &str) -> String {
    name.trim_matches('"').to_lowercase()
}

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

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_ulid_expr(expr).map(Some),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_decimal_expr(expr: &Expr) -> Result<Decimal, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => Decimal::from_str(s)
                .map_err(|e| SqlError::Parse(format!("bad decimal {s}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_decimal_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_text_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_enum_expr<T: FromStr<Err = String>>(expr: &Expr) -> Result<T, SqlError> {
    parse_text_expr(expr)?.parse().map_err(SqlError::Parse)
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

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("syntax error: {0}")]
    Syntax(#[from] ParserError),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("expected {0} values, got {1}")]
    WrongArity(usize, usize),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
