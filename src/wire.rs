use std::collections::HashMap;
use std::fmt::Debug;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use futures::{stream, Sink, SinkExt};
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
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::auth::ParklineAuthSource;
use crate::engine::{window, Completion, Engine, EngineError, Entity, ErrorKind};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command};

const CHANNEL_PREFIX: &str = "facility_";

/// Per-connection handler. Holds the connection's LISTEN subscriptions.
pub struct ParklineHandler {
    engine: Arc<Engine>,
    hub: Arc<NotifyHub>,
    listeners: Mutex<HashMap<String, broadcast::Receiver<SpotChange>>>,
    query_parser: Arc<ParklineQueryParser>,
}

impl ParklineHandler {
    pub fn new(engine: Arc<Engine>, hub: Arc<NotifyHub>) -> Self {
        Self {
            engine,
            hub,
            listeners: Mutex::new(HashMap::new()),
            query_parser: Arc::new(ParklineQueryParser),
        }
    }

    async fn run(&self, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        debug!(command = label, status, "query");
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertFacility { id, name } => {
                engine.register_facility(id, &name).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertFloor {
                id,
                facility_id,
                name,
            } => {
                engine
                    .register_floor(id, facility_id, &name)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertSpot {
                id,
                floor_id,
                label,
                vehicle_type,
                hourly_price,
                reservable,
            } => {
                engine
                    .register_spot(id, floor_id, &label, vehicle_type, hourly_price, reservable)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertVehicle {
                id,
                owner_id,
                plate,
                vehicle_type,
            } => {
                engine
                    .register_vehicle(id, owner_id, &plate, vehicle_type)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertReservation {
                id,
                user_id,
                vehicle_id,
                spot_id,
                start,
                end,
            } => {
                let span = window(start, end).map_err(engine_err)?;
                let r = engine
                    .create_reservation(id, user_id, vehicle_id, spot_id, span)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(reservation_schema(), vec![r], encode_reservation))
            }
            Command::ModifyReservation {
                id,
                vehicle_id,
                spot_id,
                start,
                end,
            } => {
                let current = engine
                    .get_reservation(id)
                    .ok_or_else(|| engine_err(EngineError::NotFound(Entity::Reservation, id)))?;
                let span = window(
                    start.unwrap_or(current.span.start),
                    end.unwrap_or(current.span.end),
                )
                .map_err(engine_err)?;
                let r = engine
                    .modify_reservation(
                        id,
                        vehicle_id.unwrap_or(current.vehicle_id),
                        spot_id.unwrap_or(current.spot_id),
                        span,
                    )
                    .await
                    .map_err(engine_err)?;
                Ok(rows(reservation_schema(), vec![r], encode_reservation))
            }
            Command::CancelReservation { id } => {
                let r = engine.cancel_reservation(id).await.map_err(engine_err)?;
                Ok(rows(reservation_schema(), vec![r], encode_reservation))
            }
            Command::CompleteReservation { id } => {
                let r = match engine.complete_reservation(id).await.map_err(engine_err)? {
                    Completion::Completed(r) => r,
                    Completion::AlreadyClosed(_) => engine.get_reservation(id).ok_or_else(|| {
                        engine_err(EngineError::NotFound(Entity::Reservation, id))
                    })?,
                };
                Ok(rows(reservation_schema(), vec![r], encode_reservation))
            }
            Command::DeleteReservation { id } => {
                engine.delete_reservation(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertQuickReservation {
                id,
                spot_id,
                plate,
                vehicle_type,
            } => {
                let q = engine
                    .create_quick_reservation(id, spot_id, &plate, vehicle_type)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(quick_schema(), vec![q], encode_quick))
            }
            Command::CompleteQuickReservation { spot_id } => {
                let q = engine
                    .complete_quick_reservation(spot_id)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(quick_schema(), vec![q], encode_quick))
            }
            Command::CancelQuickReservation { id } => {
                let q = engine
                    .cancel_quick_reservation(id)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(quick_schema(), vec![q], encode_quick))
            }
            Command::InsertSensorEvent {
                spot_id,
                plate,
                kind,
            } => {
                let record = engine
                    .sensor_event(spot_id, &plate, kind)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(sensor_outcome_schema(), vec![record], encode_sensor_outcome))
            }
            Command::SelectReservations { filter, scope } => Ok(rows(
                reservation_schema(),
                engine.list_reservations(filter, scope),
                encode_reservation,
            )),
            Command::SelectQuickReservations { facility_id, scope } => Ok(rows(
                quick_schema(),
                engine.list_quick_reservations(facility_id, scope),
                encode_quick,
            )),
            Command::SelectSpots { facility_id } => Ok(rows(
                spot_schema(),
                engine.list_spots(facility_id).await,
                encode_spot,
            )),
            Command::SelectOccupancy { facility_id } => {
                let summary = engine.occupancy_summary(facility_id).await;
                Ok(rows(
                    occupancy_schema(),
                    vec![(facility_id, summary)],
                    encode_occupancy,
                ))
            }
            Command::SelectSensorEvents {
                facility_id,
                anomalies_only,
            } => Ok(rows(
                sensor_log_schema(),
                engine.sensor_log(facility_id, anomalies_only),
                encode_sensor_log,
            )),
            Command::SelectConflict {
                spot_id,
                vehicle_id,
                start,
                end,
                exclude,
            } => {
                let verdict = match window(start, end) {
                    Ok(span) => {
                        engine
                            .check_conflict(spot_id, vehicle_id, span, exclude)
                            .await
                    }
                    Err(e) => Err(e),
                };
                let row = match verdict {
                    Ok(()) => (true, None),
                    Err(e) if matches!(e.kind(), ErrorKind::Conflict | ErrorKind::Validation) => {
                        (false, Some(e.to_string()))
                    }
                    Err(e) => return Err(engine_err(e)),
                };
                Ok(rows(conflict_schema(), vec![row], encode_conflict))
            }
            Command::Listen { channel } => {
                let facility_id = parse_channel(&channel)?;
                let mut listeners = self.listeners();
                if !listeners.contains_key(&channel) {
                    listeners.insert(channel, self.hub.subscribe(facility_id));
                }
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
            Command::Unlisten { channel } => {
                self.listeners().remove(&channel);
                self.hub.prune();
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
            Command::UnlistenAll => {
                self.listeners().clear();
                self.hub.prune();
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
        }
    }

    fn listeners(&self) -> std::sync::MutexGuard<'_, HashMap<String, broadcast::Receiver<SpotChange>>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Everything published on this connection's channels since the last statement.
    fn pending_notifications(&self) -> Vec<NotificationResponse> {
        let mut out = Vec::new();
        for (channel, rx) in self.listeners().iter_mut() {
            loop {
                match rx.try_recv() {
                    Ok(change) => out.push(NotificationResponse::new(
                        0,
                        channel.clone(),
                        notification_payload(&change),
                    )),
                    Err(TryRecvError::Lagged(skipped)) => {
                        warn!(channel = %channel, skipped, "listener lagged, notifications dropped");
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                }
            }
        }
        out
    }

    async fn deliver_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        for notification in self.pending_notifications() {
            client
                .feed(PgWireBackendMessage::NotificationResponse(notification))
                .await?;
        }
        Ok(())
    }
}

impl Drop for ParklineHandler {
    fn drop(&mut self) {
        self.listeners().clear();
        self.hub.prune();
    }
}

fn parse_channel(channel: &str) -> PgWireResult<Ulid> {
    let id = channel.strip_prefix(CHANNEL_PREFIX).ok_or_else(|| {
        user_error(
            "42000",
            format!("invalid channel: {channel} (expected {CHANNEL_PREFIX}{{id}})"),
        )
    })?;
    Ulid::from_string(id).map_err(|e| user_error("42000", format!("bad ULID in channel: {e}")))
}

fn notification_payload(change: &SpotChange) -> String {
    serde_json::json!({
        "facility_id": change.facility_id.to_string(),
        "spot_id": change.spot_id.to_string(),
        "state": change.state,
        "reason": change.reason,
    })
    .to_string()
}

// ── Result sets ──────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("user_id", Type::VARCHAR),
        field("vehicle_id", Type::VARCHAR),
        field("spot_id", Type::VARCHAR),
        field("facility_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("status", Type::VARCHAR),
        field("total_price", Type::VARCHAR),
        field("created_at", Type::INT8),
        field("closed_at", Type::INT8),
    ]
}

fn quick_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("spot_id", Type::VARCHAR),
        field("facility_id", Type::VARCHAR),
        field("plate", Type::VARCHAR),
        field("vehicle_type", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("status", Type::VARCHAR),
        field("total_price", Type::VARCHAR),
    ]
}

fn spot_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("floor_id", Type::VARCHAR),
        field("facility_id", Type::VARCHAR),
        field("label", Type::VARCHAR),
        field("vehicle_type", Type::VARCHAR),
        field("hourly_price", Type::VARCHAR),
        field("reservable", Type::BOOL),
        field("occupancy", Type::VARCHAR),
        field("active_reservations", Type::INT8),
    ]
}

fn occupancy_schema() -> Vec<FieldInfo> {
    vec![
        field("facility_id", Type::VARCHAR),
        field("free", Type::INT8),
        field("reserved", Type::INT8),
        field("occupied", Type::INT8),
        field("total", Type::INT8),
    ]
}

fn sensor_log_schema() -> Vec<FieldInfo> {
    vec![
        field("at", Type::INT8),
        field("spot_id", Type::VARCHAR),
        field("plate", Type::VARCHAR),
        field("kind", Type::VARCHAR),
        field("outcome", Type::VARCHAR),
        field("detail", Type::VARCHAR),
    ]
}

fn sensor_outcome_schema() -> Vec<FieldInfo> {
    vec![field("outcome", Type::VARCHAR), field("detail", Type::VARCHAR)]
}

fn conflict_schema() -> Vec<FieldInfo> {
    vec![field("ok", Type::BOOL), field("reason", Type::VARCHAR)]
}

fn rows<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    encode: fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_reservation(enc: &mut DataRowEncoder, r: &Reservation) -> PgWireResult<()> {
    enc.encode_field(&r.id.to_string())?;
    enc.encode_field(&r.user_id.to_string())?;
    enc.encode_field(&r.vehicle_id.to_string())?;
    enc.encode_field(&r.spot_id.to_string())?;
    enc.encode_field(&r.facility_id.to_string())?;
    enc.encode_field(&r.span.start)?;
    enc.encode_field(&r.span.end)?;
    enc.encode_field(&r.status.as_str().to_string())?;
    enc.encode_field(&r.total_price.to_string())?;
    enc.encode_field(&r.created_at)?;
    enc.encode_field(&r.closed_at)
}

fn encode_quick(enc: &mut DataRowEncoder, q: &QuickReservation) -> PgWireResult<()> {
    enc.encode_field(&q.id.to_string())?;
    enc.encode_field(&q.spot_id.to_string())?;
    enc.encode_field(&q.facility_id.to_string())?;
    enc.encode_field(&q.plate)?;
    enc.encode_field(&q.vehicle_type.as_str().to_string())?;
    enc.encode_field(&q.start)?;
    enc.encode_field(&q.end)?;
    enc.encode_field(&q.status.as_str().to_string())?;
    enc.encode_field(&q.total_price.map(|p| p.to_string()))
}

fn encode_spot(enc: &mut DataRowEncoder, s: &SpotInfo) -> PgWireResult<()> {
    enc.encode_field(&s.spot.id.to_string())?;
    enc.encode_field(&s.spot.floor_id.to_string())?;
    enc.encode_field(&s.spot.facility_id.to_string())?;
    enc.encode_field(&s.spot.label)?;
    enc.encode_field(&s.spot.vehicle_type.as_str().to_string())?;
    enc.encode_field(&s.spot.hourly_price.to_string())?;
    enc.encode_field(&s.spot.reservable)?;
    enc.encode_field(&s.occupancy.as_str().to_string())?;
    enc.encode_field(&(s.active_reservations as i64))
}

fn encode_occupancy(
    enc: &mut DataRowEncoder,
    (facility_id, summary): &(Ulid, OccupancySummary),
) -> PgWireResult<()> {
    enc.encode_field(&facility_id.to_string())?;
    enc.encode_field(&(summary.free as i64))?;
    enc.encode_field(&(summary.reserved as i64))?;
    enc.encode_field(&(summary.occupied as i64))?;
    enc.encode_field(&(summary.total() as i64))
}

fn encode_sensor_log(enc: &mut DataRowEncoder, r: &SensorRecord) -> PgWireResult<()> {
    enc.encode_field(&r.at)?;
    enc.encode_field(&r.spot_id.to_string())?;
    enc.encode_field(&r.plate)?;
    enc.encode_field(&r.kind.as_str().to_string())?;
    enc.encode_field(&r.outcome.as_str().to_string())?;
    enc.encode_field(&r.detail)
}

fn encode_sensor_outcome(enc: &mut DataRowEncoder, r: &SensorRecord) -> PgWireResult<()> {
    enc.encode_field(&r.outcome.as_str().to_string())?;
    enc.encode_field(&r.detail)
}

fn encode_conflict(enc: &mut DataRowEncoder, (ok, reason): &(bool, Option<String>)) -> PgWireResult<()> {
    enc.encode_field(ok)?;
    enc.encode_field(reason)
}

/// Result columns a statement will produce, derived from its text so that
/// describe works on statements with unbound `$n` parameters.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.trim_start().to_lowercase();
    let verb = lower.split_whitespace().next().unwrap_or_default();
    let table = [
        "quick_reservations",
        "reservations",
        "sensor_events",
        "spots",
        "occupancy",
        "conflicts",
    ]
    .into_iter()
    .find(|t| lower.contains(t));

    match (verb, table) {
        ("select", Some("reservations")) => reservation_schema(),
        ("select", Some("quick_reservations")) => quick_schema(),
        ("select", Some("spots")) => spot_schema(),
        ("select", Some("occupancy")) => occupancy_schema(),
        ("select", Some("sensor_events")) => sensor_log_schema(),
        ("select", Some("conflicts")) => conflict_schema(),
        ("insert" | "update", Some("reservations")) => reservation_schema(),
        ("insert" | "update", Some("quick_reservations")) => quick_schema(),
        ("insert", Some("sensor_events")) => sensor_outcome_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for ParklineHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let mut responses = Vec::new();
        let mut failure = None;
        for statement in sql::split_statements(query) {
            match self.run(statement).await {
                Ok(response) => responses.push(response),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        self.deliver_notifications(client).await?;
        if let Some(e) = failure {
            return Err(e);
        }
        if responses.is_empty() {
            responses.push(Response::EmptyQuery);
        }
        Ok(responses)
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ParklineQueryParser;

#[async_trait]
impl QueryParser for ParklineQueryParser {
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
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ParklineHandler {
    type Statement = String;
    type QueryParser = ParklineQueryParser;

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
        let sql = substitute_params(portal);
        let result = self.run(&sql).await;
        self.deliver_notifications(client).await?;
        result
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
            result_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline bound parameters (text format) as quoted literals.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.to_string();
    // Highest index first so $1 never clobbers the prefix of $10.
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ParklineFactory {
    handler: Arc<ParklineHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<ParklineAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl ParklineFactory {
    pub fn new(engine: Arc<Engine>, hub: Arc<NotifyHub>, password: String) -> Self {
        Self {
            handler: Arc::new(ParklineHandler::new(engine, hub)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                ParklineAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ParklineFactory {
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

/// Serve one client connection until it closes. Each connection gets its own
/// handler, so LISTEN subscriptions end with the connection.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    hub: Arc<NotifyHub>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(ParklineFactory::new(engine, hub, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for each engine error class.
fn sqlstate(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Validation => "22023",
        ErrorKind::Conflict => "23P01",
        ErrorKind::NotFound => "02000",
        ErrorKind::InvalidState => "55000",
        ErrorKind::Internal => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(e.kind()), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT 1"), 0);
        assert_eq!(count_params("INSERT INTO facilities VALUES ($1, $2)"), 2);
        assert_eq!(count_params("SELECT * FROM spots WHERE facility_id = $12"), 12);
        assert_eq!(count_params("SELECT '$' FROM x"), 0);
    }

    #[test]
    fn schema_follows_statement() {
        let names = |sql: &str| -> Vec<String> {
            result_schema(sql).iter().map(|f| f.name().to_string()).collect()
        };
        assert_eq!(names("SELECT * FROM occupancy WHERE facility_id = $1")[1], "free");
        assert_eq!(names("select * from quick_reservations where facility_id = $1")[3], "plate");
        assert_eq!(
            names("INSERT INTO sensor_events (spot_id, plate, kind) VALUES ($1, $2, $3)"),
            vec!["outcome", "detail"]
        );
        assert_eq!(names("UPDATE reservations SET status = 'cancelled' WHERE id = $1")[0], "id");
        assert!(names("INSERT INTO spots VALUES ($1, $2, $3, $4, $5)").is_empty());
        assert!(names("DELETE FROM reservations WHERE id = $1").is_empty());
        assert!(names("LISTEN facility_x").is_empty());
    }

    #[test]
    fn sqlstate_per_class() {
        assert_eq!(sqlstate(ErrorKind::Conflict), "23P01");
        assert_eq!(sqlstate(ErrorKind::NotFound), "02000");
        assert_eq!(sqlstate(ErrorKind::Validation), "22023");
    }

    #[test]
    fn channel_names() {
        let id = Ulid::new();
        assert_eq!(parse_channel(&format!("facility_{id}")).unwrap(), id);
        assert!(parse_channel(&format!("resource_{id}")).is_err());
        assert!(parse_channel("facility_nope").is_err());
    }

    #[test]
    fn payload_shape() {
        let change = SpotChange {
            facility_id: Ulid::new(),
            spot_id: Ulid::new(),
            state: Occupancy::Occupied,
            reason: ChangeReason::QuickStarted,
            reference: None,
        };
        let json: serde_json::Value = serde_json::from_str(&notification_payload(&change)).unwrap();
        assert_eq!(json["spot_id"], change.spot_id.to_string());
        assert_eq!(json["state"], "occupied");
        assert_eq!(json["reason"], "quick_started");
    }
}
