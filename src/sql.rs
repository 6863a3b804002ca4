use chrono::{DateTime, NaiveDate, NaiveTime, Timelike, Weekday};
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertFacility {
        id: Ulid,
        name: Option<String>,
        policy: BookingPolicy,
    },
    InsertProgram {
        id: Ulid,
        name: Option<String>,
        capacity: u32,
    },
    InsertOccurrence {
        id: Ulid,
        program_id: Ulid,
        starts_at: Option<Ms>,
        capacity: Option<u32>,
    },
    InsertWindow {
        resource_id: Ulid,
        window: AvailabilityWindow,
    },
    InsertClosure {
        id: Ulid,
        resource_id: Ulid,
        span: Span,
        reason: Option<String>,
    },
    DeleteResource {
        id: Ulid,
    },
    DeleteWindow {
        id: Ulid,
    },
    DeleteClosure {
        id: Ulid,
    },
    /// `requester`, when given, must match the session user.
    InsertReservation {
        id: Ulid,
        resource_id: Ulid,
        occurrence_id: Option<Ulid>,
        requester: Option<String>,
        participant: Option<String>,
        span: Option<Span>,
        idempotency_key: Option<String>,
        notify: bool,
    },
    DeleteReservation {
        id: Ulid,
        requester: Option<String>,
    },
    SelectResources,
    SelectAvailability {
        resource_id: Ulid,
        span: Span,
    },
    SelectSlots {
        resource_id: Ulid,
        range: Span,
        duration: Ms,
    },
    SelectReservations {
        id: Option<Ulid>,
        resource_id: Option<Ulid>,
        occurrence_id: Option<Ulid>,
    },
    SelectWaitlist {
        resource_id: Ulid,
        occurrence_id: Option<Ulid>,
    },
    SelectOutbox {
        limit: usize,
    },
    DeleteOutbox {
        id: Ulid,
    },
    InsertOutboxFailure {
        id: Ulid,
        error: String,
    },
}

const DEFAULT_OUTBOX_LIMIT: usize = 100;

const FACILITY_COLUMNS: &[&str] = &[
    "id",
    "name",
    "min_duration",
    "max_duration",
    "buffer",
    "granularity",
    "horizon",
    "cancel_cutoff",
    "utc_offset",
];
const PROGRAM_COLUMNS: &[&str] = &["id", "name", "capacity"];
const OCCURRENCE_COLUMNS: &[&str] = &["id", "program_id", "starts_at", "capacity"];
const WINDOW_COLUMNS: &[&str] = &[
    "id",
    "resource_id",
    "weekday",
    "start_time",
    "end_time",
    "effective_from",
    "effective_until",
];
const CLOSURE_COLUMNS: &[&str] = &["id", "resource_id", "start", "end", "reason"];
const RESERVATION_COLUMNS: &[&str] = &[
    "id",
    "resource_id",
    "occurrence_id",
    "requester",
    "participant",
    "start",
    "end",
    "idempotency_key",
    "notify",
];
const OUTBOX_FAILURE_COLUMNS: &[&str] = &["id", "error"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(first) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match first {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let columns = match table.as_str() {
        "facilities" => FACILITY_COLUMNS,
        "programs" => PROGRAM_COLUMNS,
        "occurrences" => OCCURRENCE_COLUMNS,
        "windows" => WINDOW_COLUMNS,
        "closures" => CLOSURE_COLUMNS,
        "reservations" => RESERVATION_COLUMNS,
        "outbox_failures" => OUTBOX_FAILURE_COLUMNS,
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let row = Row::from_insert(insert, columns)?;

    match table.as_str() {
        "facilities" => {
            let defaults = BookingPolicy::default();
            let policy = BookingPolicy {
                min_duration: row.opt_i64("min_duration")?.unwrap_or(defaults.min_duration),
                max_duration: row.opt_i64("max_duration")?,
                buffer: row.opt_i64("buffer")?.unwrap_or(defaults.buffer),
                granularity: row.opt_i64("granularity")?.unwrap_or(defaults.granularity),
                advance_horizon: row.opt_i64("horizon")?,
                cancellation_cutoff: row.opt_i64("cancel_cutoff")?,
                utc_offset_minutes: row
                    .opt_i64("utc_offset")?
                    .map(|m| i32::try_from(m).map_err(|_| SqlError::Invalid(format!("{m} out of range"))))
                    .transpose()?
                    .unwrap_or(defaults.utc_offset_minutes),
            };
            Ok(Command::InsertFacility {
                id: row.ulid("id")?,
                name: row.opt_text("name")?,
                policy,
            })
        }
        "programs" => Ok(Command::InsertProgram {
            id: row.ulid("id")?,
            name: row.opt_text("name")?,
            capacity: row.opt_u32("capacity")?.ok_or(SqlError::MissingValue("capacity"))?,
        }),
        "occurrences" => Ok(Command::InsertOccurrence {
            id: row.ulid("id")?,
            program_id: row.ulid("program_id")?,
            starts_at: row.opt_instant("starts_at")?,
            capacity: row.opt_u32("capacity")?,
        }),
        "windows" => {
            let resource_id = row.ulid("resource_id")?;
            let window = AvailabilityWindow {
                id: row.opt_ulid("id")?.unwrap_or_else(Ulid::new),
                weekday: parse_weekday(row.expect("weekday")?)?,
                start_minute: parse_minute_of_day(row.expect("start_time")?)?,
                end_minute: parse_minute_of_day(row.expect("end_time")?)?,
                effective_from: row.get("effective_from").map(parse_date).transpose()?,
                effective_until: row.get("effective_until").map(parse_date).transpose()?,
            };
            Ok(Command::InsertWindow {
                resource_id,
                window,
            })
        }
        "closures" => Ok(Command::InsertClosure {
            id: row.ulid("id")?,
            resource_id: row.ulid("resource_id")?,
            span: span(row.instant("start")?, row.instant("end")?)?,
            reason: row.opt_text("reason")?,
        }),
        "reservations" => {
            let span = match (row.opt_instant("start")?, row.opt_instant("end")?) {
                (Some(s), Some(e)) => Some(span(s, e)?),
                (None, None) => None,
                _ => return Err(SqlError::Invalid("start and end go together".into())),
            };
            Ok(Command::InsertReservation {
                id: row.opt_ulid("id")?.unwrap_or_else(Ulid::new),
                resource_id: row.ulid("resource_id")?,
                occurrence_id: row.opt_ulid("occurrence_id")?,
                requester: row.opt_text("requester")?,
                participant: row.opt_text("participant")?,
                span,
                idempotency_key: row.opt_text("idempotency_key")?,
                notify: row.get("notify").map(parse_bool).transpose()?.unwrap_or(true),
            })
        }
        "outbox_failures" => Ok(Command::InsertOutboxFailure {
            id: row.ulid("id")?,
            error: row.opt_text("error")?.unwrap_or_default(),
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::collect(delete.selection.as_ref())?;
    let id = filters.ulid("id")?;

    match table.as_str() {
        "resources" | "facilities" | "programs" => Ok(Command::DeleteResource { id }),
        "windows" => Ok(Command::DeleteWindow { id }),
        "closures" => Ok(Command::DeleteClosure { id }),
        "reservations" => Ok(Command::DeleteReservation {
            id,
            requester: filters.opt_text("requester")?,
        }),
        "outbox" => Ok(Command::DeleteOutbox { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
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
    let filters = Filters::collect(select.selection.as_ref())?;

    match table.as_str() {
        "resources" => Ok(Command::SelectResources),
        "availability" => Ok(Command::SelectAvailability {
            resource_id: filters.ulid("resource_id")?,
            span: span(filters.instant("start")?, filters.instant("end")?)?,
        }),
        "slots" => Ok(Command::SelectSlots {
            resource_id: filters.ulid("resource_id")?,
            range: span(filters.instant("start")?, filters.instant("end")?)?,
            duration: filters.i64("duration")?,
        }),
        "reservations" => {
            let id = filters.opt_ulid("id")?;
            let resource_id = filters.opt_ulid("resource_id")?;
            if id.is_none() && resource_id.is_none() {
                return Err(SqlError::MissingFilter("id or resource_id"));
            }
            Ok(Command::SelectReservations {
                id,
                resource_id,
                occurrence_id: filters.opt_ulid("occurrence_id")?,
            })
        }
        "waitlist" => Ok(Command::SelectWaitlist {
            resource_id: filters.ulid("resource_id")?,
            occurrence_id: filters.opt_ulid("occurrence_id")?,
        }),
        "outbox" => Ok(Command::SelectOutbox {
            limit: query_limit(query)?.unwrap_or(DEFAULT_OUTBOX_LIMIT),
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn query_limit(query: &ast::Query) -> Result<Option<usize>, SqlError> {
    let expr = match &query.limit_clause {
        Some(ast::LimitClause::LimitOffset { limit: Some(e), .. }) => e,
        Some(ast::LimitClause::OffsetCommaLimit { limit, .. }) => limit,
        _ => return Ok(None),
    };
    let n = parse_i64_expr(expr)?;
    usize::try_from(n)
        .map(Some)
        .map_err(|_| SqlError::Invalid(format!("bad LIMIT {n}")))
}

fn span(start: Ms, end: Ms) -> Result<Span, SqlError> {
    Span::try_new(start, end).ok_or_else(|| SqlError::Invalid("start must be before end".into()))
}

// ── Rows and filters ──────────────────────────────────────────

/// One VALUES row addressed by column name. Without an explicit column
/// list, values are matched to the table's columns in order.
struct Row<'a> {
    cells: Vec<(String, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn from_insert(insert: &'a ast::Insert, defaults: &[&str]) -> Result<Self, SqlError> {
        let values = extract_insert_values(insert)?;
        let names: Vec<String> = if insert.columns.is_empty() {
            defaults.iter().map(|c| (*c).to_owned()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if values.len() > names.len() {
            return Err(SqlError::WrongArity(names.len(), values.len()));
        }
        if let Some(unknown) = names.iter().find(|n| !defaults.contains(&n.as_str())) {
            return Err(SqlError::UnknownColumn(unknown.clone()));
        }
        Ok(Self {
            cells: names.into_iter().zip(values.iter()).collect(),
        })
    }

    /// The cell for `col`, treating NULL as absent.
    fn get(&self, col: &str) -> Option<&'a Expr> {
        self.cells
            .iter()
            .find(|(name, _)| name == col)
            .map(|(_, e)| *e)
            .filter(|e| !is_null(e))
    }

    fn expect(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingValue(col))
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.expect(col)?)
    }

    fn opt_ulid(&self, col: &str) -> Result<Option<Ulid>, SqlError> {
        self.get(col).map(parse_ulid_expr).transpose()
    }

    fn opt_text(&self, col: &str) -> Result<Option<String>, SqlError> {
        self.get(col).map(parse_text).transpose()
    }

    fn opt_i64(&self, col: &str) -> Result<Option<i64>, SqlError> {
        self.get(col).map(parse_i64_expr).transpose()
    }

    fn opt_u32(&self, col: &str) -> Result<Option<u32>, SqlError> {
        self.get(col).map(parse_u32).transpose()
    }

    fn instant(&self, col: &'static str) -> Result<Ms, SqlError> {
        parse_instant(self.expect(col)?)
    }

    fn opt_instant(&self, col: &str) -> Result<Option<Ms>, SqlError> {
        self.get(col).map(parse_instant).transpose()
    }
}

/// `col <op> value` comparisons from an AND-chain. `=`, `>=` and `<=` are
/// all read as "this column is bounded by this value".
struct Filters<'a> {
    terms: Vec<(String, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn collect(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut terms = Vec::new();
        if let Some(expr) = selection {
            collect_terms(expr, &mut terms)?;
        }
        Ok(Self { terms })
    }

    fn get(&self, col: &str) -> Option<&'a Expr> {
        self.terms.iter().find(|(name, _)| name == col).map(|(_, e)| *e)
    }

    fn expect(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingFilter(col))
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.expect(col)?)
    }

    fn opt_ulid(&self, col: &str) -> Result<Option<Ulid>, SqlError> {
        self.get(col).map(parse_ulid_expr).transpose()
    }

    fn opt_text(&self, col: &str) -> Result<Option<String>, SqlError> {
        self.get(col).map(parse_text).transpose()
    }

    fn i64(&self, col: &'static str) -> Result<i64, SqlError> {
        parse_i64_expr(self.expect(col)?)
    }

    fn instant(&self, col: &'static str) -> Result<Ms, SqlError> {
        parse_instant(self.expect(col)?)
    }
}

fn collect_terms<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_terms(inner, out),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_terms(left, out)?;
                collect_terms(right, out)
            }
            ast::BinaryOperator::Eq | ast::BinaryOperator::GtEq | ast::BinaryOperator::LtEq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                out.push((col, right.as_ref()));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("operator {other}"))),
        },
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
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

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

fn extract_insert_values(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.as_slice()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(s, _)) => Ok(s.clone()),
        _ => Err(SqlError::Parse(format!("expected string, got {expr}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_text(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
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

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Invalid(format!("{v} out of range")))
}

/// Epoch milliseconds, or an RFC 3339 timestamp string.
fn parse_instant(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && s.parse::<i64>().is_err()
    {
        return DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .map_err(|e| SqlError::Parse(format!("bad timestamp {s}: {e}")));
    }
    parse_i64_expr(expr)
}

fn parse_weekday(expr: &Expr) -> Result<Weekday, SqlError> {
    let s = parse_text(expr)?;
    s.parse()
        .map_err(|_| SqlError::Invalid(format!("bad weekday: {s}")))
}

/// `'HH:MM'` (with `'24:00'` meaning end of day) or a bare minute count.
fn parse_minute_of_day(expr: &Expr) -> Result<u32, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && s.contains(':')
    {
        if s == "24:00" {
            return Ok(MINUTES_PER_DAY);
        }
        let t = NaiveTime::parse_from_str(s, "%H:%M")
            .map_err(|e| SqlError::Parse(format!("bad time {s}: {e}")))?;
        return Ok(t.hour() * 60 + t.minute());
    }
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Invalid(format!("{v} out of range")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_text(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s}: {e}")))
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
        _ => Err(SqlError::Parse(format!("expected bool, got {expr}"))),
    }
}

// ── Result shapes ─────────────────────────────────────────────

/// Which row set a statement produces, for describe messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    Resources,
    Availability,
    Slots,
    Reservations,
    Waitlist,
    Outbox,
    /// `INSERT INTO reservations` answers with the decision.
    Decision,
}

/// The result shape of a statement that may still hold `$n` placeholders.
/// `None` for statements that only return a command tag.
pub fn result_shape(sql: &str) -> Option<ResultShape> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    match stmts.first()? {
        Statement::Insert(insert) => {
            (insert_table_name(insert).ok()? == "reservations").then_some(ResultShape::Decision)
        }
        Statement::Query(query) => {
            let SetExpr::Select(select) = query.body.as_ref() else {
                return None;
            };
            match table_factor_name(&select.from.first()?.relation).ok()?.as_str() {
                "resources" => Some(ResultShape::Resources),
                "availability" => Some(ResultShape::Availability),
                "slots" => Some(ResultShape::Slots),
                "reservations" => Some(ResultShape::Reservations),
                "waitlist" => Some(ResultShape::Waitlist),
                "outbox" => Some(ResultShape::Outbox),
                _ => None,
            }
        }
        _ => None,
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
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
    #[error("expected at most {0} values, got {1}")]
    WrongArity(usize, usize),
    #[error("missing value: {0}")]
    MissingValue(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("invalid value: {0}")]
    Invalid(String),
}

impl SqlError {
    /// Syntax problems versus well-formed statements with bad values.
    pub fn is_syntax(&self) -> bool {
        matches!(self, SqlError::Parse(_) | SqlError::Empty | SqlError::Unsupported(_))
    }
}
