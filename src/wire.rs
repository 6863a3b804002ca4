use std::collections::HashMap;
use std::fmt::Debug;
use std::io;
use std::ops::Range;
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
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;
use ulid::Ulid;

use crate::auth::BerthAuthSource;
use crate::engine::{Engine, EngineError, ErrorClass};
use crate::model::*;
use crate::observability;
use crate::ratelimit::RateLimiter;
use crate::sql::{self, Command, ResultShape, SqlError};

pub struct BerthHandler {
    engine: Arc<Engine>,
    limiter: Arc<RateLimiter>,
    query_parser: Arc<BerthQueryParser>,
}

impl BerthHandler {
    pub fn new(engine: Arc<Engine>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            engine,
            limiter,
            query_parser: Arc::new(BerthQueryParser),
        }
    }

    /// Run one statement and record its outcome.
    async fn run(&self, user: &str, cmd: Command, format: Option<&Format>) -> PgWireResult<Response> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(user, cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        user: &str,
        cmd: Command,
        format: Option<&Format>,
    ) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertFacility { id, name, policy } => {
                engine
                    .create_facility(id, name, policy)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::InsertProgram { id, name, capacity } => {
                engine
                    .create_program(id, name, capacity)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::InsertOccurrence {
                id,
                program_id,
                starts_at,
                capacity,
            } => {
                engine
                    .add_occurrence(id, program_id, starts_at, capacity)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::InsertWindow {
                resource_id,
                window,
            } => {
                engine
                    .add_window(resource_id, window)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::InsertClosure {
                id,
                resource_id,
                span,
                reason,
            } => {
                engine
                    .add_closure(resource_id, id, span, reason)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::DeleteResource { id } => {
                engine.deactivate_resource(id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::DeleteWindow { id } => {
                engine.remove_window(id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::DeleteClosure { id } => {
                engine.remove_closure(id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::InsertReservation {
                id,
                resource_id,
                occurrence_id,
                requester,
                participant,
                span,
                idempotency_key,
                notify,
            } => {
                let requester = session_requester(user, requester)?;
                if !self.limiter.try_acquire(&requester) {
                    metrics::counter!(observability::RATE_LIMITED_TOTAL).increment(1);
                    return Err(user_error(
                        "53400",
                        format!("too many reservation requests from {requester}, slow down"),
                    ));
                }
                let request = ReservationRequest {
                    id,
                    resource_id,
                    occurrence_id,
                    requester,
                    participant,
                    span,
                    idempotency_key,
                    notify,
                };
                let outcome = engine.create_reservation(request).await.map_err(engine_err)?;
                let schema = Arc::new(fields(DECISION_COLUMNS, format));
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&outcome.reservation_id.to_string())?;
                encoder.encode_field(&outcome.status.as_str())?;
                encoder.encode_field(&outcome.position.map(i64::from))?;
                encoder.encode_field(&outcome.replayed)?;
                Ok(rows(schema, vec![Ok(encoder.take_row())]))
            }
            Command::DeleteReservation { id, requester } => {
                let requester = session_requester(user, requester)?;
                let cancelled = engine
                    .cancel_reservation(id, &requester)
                    .await
                    .map_err(engine_err)?;
                if let Some(promoted) = cancelled.promoted {
                    debug!(%id, %promoted, "cancellation promoted a waitlisted reservation");
                }
                Ok(deleted())
            }
            Command::SelectResources => {
                let resources = engine.list_resources().await;
                let schema = Arc::new(fields(RESOURCE_COLUMNS, format));
                let data: Vec<PgWireResult<_>> = resources
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.name)?;
                        encoder.encode_field(&if r.is_facility { "facility" } else { "program" })?;
                        encoder.encode_field(&r.active)?;
                        encoder.encode_field(&r.capacity.map(i64::from))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(rows(schema, data))
            }
            Command::SelectAvailability { resource_id, span } => {
                let (available, reason, detail) =
                    match engine.check_availability(resource_id, span).await {
                        Ok(()) => (true, None, None),
                        Err(e) if is_refusal(&e) => (false, Some(e.reason()), Some(e.to_string())),
                        Err(e) => return Err(engine_err(e)),
                    };
                let schema = Arc::new(fields(AVAILABILITY_COLUMNS, format));
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&available)?;
                encoder.encode_field(&reason)?;
                encoder.encode_field(&detail)?;
                Ok(rows(schema, vec![Ok(encoder.take_row())]))
            }
            Command::SelectSlots {
                resource_id,
                range,
                duration,
            } => {
                let slots = engine
                    .list_available_slots(resource_id, range, duration)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(fields(SLOT_COLUMNS, format));
                let rid = resource_id.to_string();
                let data: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&rid)?;
                        encoder.encode_field(&slot.start)?;
                        encoder.encode_field(&slot.end)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(rows(schema, data))
            }
            Command::SelectReservations {
                id,
                resource_id,
                occurrence_id,
            } => {
                let found: Vec<(Reservation, Option<u32>)> = match (id, resource_id) {
                    (Some(id), _) => match engine.get_reservation(id).await {
                        Ok(found) => vec![found],
                        Err(EngineError::NotFound(_)) => Vec::new(),
                        Err(e) => return Err(engine_err(e)),
                    },
                    (None, Some(resource_id)) => {
                        let positions: HashMap<Ulid, u32> = engine
                            .list_waitlist(resource_id, occurrence_id)
                            .await
                            .map_err(engine_err)?
                            .into_iter()
                            .map(|w| (w.reservation_id, w.position))
                            .collect();
                        engine
                            .list_reservations(resource_id, occurrence_id)
                            .await
                            .map_err(engine_err)?
                            .into_iter()
                            .map(|r| {
                                let position = positions.get(&r.id).copied();
                                (r, position)
                            })
                            .collect()
                    }
                    (None, None) => Vec::new(),
                };
                let schema = Arc::new(fields(RESERVATION_COLUMNS, format));
                let data: Vec<PgWireResult<_>> = found
                    .into_iter()
                    .map(|(r, position)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.resource_id.to_string())?;
                        encoder.encode_field(&r.occurrence_id.map(|o| o.to_string()))?;
                        encoder.encode_field(&r.requester)?;
                        encoder.encode_field(&r.participant)?;
                        encoder.encode_field(&r.span.map(|s| s.start))?;
                        encoder.encode_field(&r.span.map(|s| s.end))?;
                        encoder.encode_field(&r.status.as_str())?;
                        encoder.encode_field(&position.map(i64::from))?;
                        encoder.encode_field(&r.created_at)?;
                        encoder.encode_field(&r.cancellation.as_ref().map(|c| c.at))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(rows(schema, data))
            }
            Command::SelectWaitlist {
                resource_id,
                occurrence_id,
            } => {
                let waiting = engine
                    .list_waitlist(resource_id, occurrence_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(fields(WAITLIST_COLUMNS, format));
                let data: Vec<PgWireResult<_>> = waiting
                    .into_iter()
                    .map(|w| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&w.reservation_id.to_string())?;
                        encoder.encode_field(&w.participant)?;
                        encoder.encode_field(&i64::from(w.position))?;
                        encoder.encode_field(&w.notify)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(rows(schema, data))
            }
            Command::SelectOutbox { limit } => {
                let batch = engine.outbox_next_batch(limit);
                let schema = Arc::new(fields(OUTBOX_COLUMNS, format));
                let data: Vec<PgWireResult<_>> = batch
                    .into_iter()
                    .map(|e| {
                        let lead = match e.kind {
                            NotificationKind::Reminder { lead } => Some(lead),
                            _ => None,
                        };
                        let p = &e.payload;
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&e.id.to_string())?;
                        encoder.encode_field(&e.kind.as_str())?;
                        encoder.encode_field(&p.reservation_id.to_string())?;
                        encoder.encode_field(&p.resource_id.to_string())?;
                        encoder.encode_field(&p.occurrence_id.map(|o| o.to_string()))?;
                        encoder.encode_field(&p.participant)?;
                        encoder.encode_field(&p.position.map(i64::from))?;
                        encoder.encode_field(&p.starts_at)?;
                        encoder.encode_field(&lead)?;
                        encoder.encode_field(&p.silent)?;
                        encoder.encode_field(&i64::from(e.attempts))?;
                        encoder.encode_field(&e.last_error)?;
                        encoder.encode_field(&e.created_at)?;
                        let payload = serde_json::to_string(p)
                            .map_err(|err| PgWireError::ApiError(Box::new(err)))?;
                        encoder.encode_field(&payload)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(rows(schema, data))
            }
            Command::DeleteOutbox { id } => {
                engine.outbox_mark_delivered(id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::InsertOutboxFailure { id, error } => {
                engine
                    .outbox_mark_failed(id, &error)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
        }
    }
}

/// Errors that answer an availability question rather than fail it.
fn is_refusal(e: &EngineError) -> bool {
    matches!(e.class(), ErrorClass::Validation | ErrorClass::Unavailable)
}

fn session_user<C: ClientInfo>(client: &C) -> String {
    client.metadata().get("user").cloned().unwrap_or_default()
}

fn inserted() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

fn deleted() -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(1))
}

fn rows(schema: Arc<Vec<FieldInfo>>, data: Vec<PgWireResult<pgwire::messages::data::DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(data)))
}

// ── Result schemas ───────────────────────────────────────────────

type Columns = &'static [(&'static str, Type)];

const DECISION_COLUMNS: Columns = &[
    ("id", Type::VARCHAR),
    ("status", Type::VARCHAR),
    ("position", Type::INT8),
    ("replayed", Type::BOOL),
];
const RESOURCE_COLUMNS: Columns = &[
    ("id", Type::VARCHAR),
    ("name", Type::VARCHAR),
    ("kind", Type::VARCHAR),
    ("active", Type::BOOL),
    ("capacity", Type::INT8),
];
const AVAILABILITY_COLUMNS: Columns = &[
    ("available", Type::BOOL),
    ("reason", Type::VARCHAR),
    ("detail", Type::VARCHAR),
];
const SLOT_COLUMNS: Columns = &[
    ("resource_id", Type::VARCHAR),
    ("start", Type::INT8),
    ("end", Type::INT8),
];
const RESERVATION_COLUMNS: Columns = &[
    ("id", Type::VARCHAR),
    ("resource_id", Type::VARCHAR),
    ("occurrence_id", Type::VARCHAR),
    ("requester", Type::VARCHAR),
    ("participant", Type::VARCHAR),
    ("start", Type::INT8),
    ("end", Type::INT8),
    ("status", Type::VARCHAR),
    ("position", Type::INT8),
    ("created_at", Type::INT8),
    ("cancelled_at", Type::INT8),
];
const WAITLIST_COLUMNS: Columns = &[
    ("reservation_id", Type::VARCHAR),
    ("participant", Type::VARCHAR),
    ("position", Type::INT8),
    ("notify", Type::BOOL),
];
const OUTBOX_COLUMNS: Columns = &[
    ("id", Type::VARCHAR),
    ("kind", Type::VARCHAR),
    ("reservation_id", Type::VARCHAR),
    ("resource_id", Type::VARCHAR),
    ("occurrence_id", Type::VARCHAR),
    ("recipient", Type::VARCHAR),
    ("position", Type::INT8),
    ("starts_at", Type::INT8),
    ("lead", Type::INT8),
    ("silent", Type::BOOL),
    ("attempts", Type::INT8),
    ("last_error", Type::VARCHAR),
    ("created_at", Type::INT8),
    ("payload", Type::VARCHAR),
];

fn shape_columns(shape: ResultShape) -> Columns {
    match shape {
        ResultShape::Resources => RESOURCE_COLUMNS,
        ResultShape::Availability => AVAILABILITY_COLUMNS,
        ResultShape::Slots => SLOT_COLUMNS,
        ResultShape::Reservations => RESERVATION_COLUMNS,
        ResultShape::Waitlist => WAITLIST_COLUMNS,
        ResultShape::Outbox => OUTBOX_COLUMNS,
        ResultShape::Decision => DECISION_COLUMNS,
    }
}

/// Field descriptions in the client's requested format (text by default).
fn fields(columns: Columns, format: Option<&Format>) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(i, (name, ty))| {
            let field_format = format.map_or(FieldFormat::Text, |f| f.format_for(i));
            FieldInfo::new((*name).into(), None, None, ty.clone(), field_format)
        })
        .collect()
}

fn statement_fields(sql: &str, format: Option<&Format>) -> Vec<FieldInfo> {
    sql::result_shape(sql)
        .map(|shape| fields(shape_columns(shape), format))
        .unwrap_or_default()
}

#[async_trait]
impl SimpleQueryHandler for BerthHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let user = session_user(client);
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        Ok(vec![self.run(&user, cmd, None).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct BerthQueryParser;

#[async_trait]
impl QueryParser for BerthQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(statement_fields(stmt, column_format))
    }
}

#[async_trait]
impl ExtendedQueryHandler for BerthHandler {
    type Statement = String;
    type QueryParser = BerthQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let user = session_user(client);
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.run(&user, cmd, Some(&portal.result_column_format)).await
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
            statement_fields(&target.statement, None),
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
        Ok(DescribePortalResponse::new(statement_fields(
            &target.statement.statement,
            Some(&target.result_column_format),
        )))
    }
}

/// `$n` placeholders outside quoted literals and identifiers, as
/// (byte range, index) pairs in statement order.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"') => {
                // A doubled quote is an escape and keeps the literal open.
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == quote {
                        if bytes.get(i + 1) == Some(&quote) {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                i += 1;
            }
            b'$' => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    found.push((start..i, n));
                }
            }
            _ => i += 1,
        }
    }
    found
}

/// Highest `$n` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Inline bound parameters as quoted literals in one pass, so text inside a
/// bound value is never read as a placeholder.
fn substitute_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        result.push_str(&sql[copied..range.start]);
        match param {
            Some(bytes) => {
                result.push('\'');
                result.push_str(&String::from_utf8_lossy(bytes.as_ref()).replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        copied = range.end;
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct BerthFactory {
    handler: Arc<BerthHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<BerthAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl BerthFactory {
    pub fn new(engine: Arc<Engine>, limiter: Arc<RateLimiter>, password: String) -> Self {
        Self {
            handler: Arc::new(BerthHandler::new(engine, limiter)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                BerthAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for BerthFactory {
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
    limiter: Arc<RateLimiter>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = BerthFactory::new(engine, limiter, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// The session user is the requester. A statement may name it explicitly
/// but never someone else; acting for others goes through `participant`.
fn session_requester(user: &str, stated: Option<String>) -> PgWireResult<String> {
    match stated {
        Some(stated) if stated != user => Err(user_error(
            "42501",
            format!("session user {user} cannot act as requester {stated}"),
        )),
        _ => Ok(user.to_owned()),
    }
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for an engine error.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e.class() {
        ErrorClass::Validation => "22023",
        ErrorClass::Unavailable => "23P01",
        ErrorClass::Forbidden => "42501",
        ErrorClass::NotFound => "02000",
        ErrorClass::Busy => "40001",
        ErrorClass::Limit => "54000",
        ErrorClass::Storage => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = if e.is_syntax() { "42601" } else { "22023" };
    user_error(code, e.to_string())
}
