use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
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
use tokio::net::TcpStream;
use tracing::debug;
use ulid::Ulid;

use crate::auth::ConciergeAuthSource;
use crate::civil::BuildingZone;
use crate::directory::Directory;
use crate::engine::{Engine, EngineError, ErrorKind};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command};

pub struct ConciergeHandler {
    engine: Arc<Engine>,
    directory: Arc<dyn Directory>,
    query_parser: Arc<ConciergeQueryParser>,
}

impl ConciergeHandler {
    pub fn new(engine: Arc<Engine>, directory: Arc<dyn Directory>) -> Self {
        Self {
            engine,
            directory,
            query_parser: Arc::new(ConciergeQueryParser),
        }
    }

    /// The startup `user` parameter, looked up in the directory on every statement
    /// so role changes apply without reconnecting.
    async fn resolve_principal<C: ClientInfo>(&self, client: &C) -> PgWireResult<Principal> {
        let user = client.metadata().get("user").cloned().unwrap_or_default();
        let profile = match Ulid::from_string(&user) {
            Ok(id) => self.directory.profile(id).await,
            Err(_) => None,
        };
        profile.map(|p| p.principal()).ok_or_else(|| {
            user_error("28000", format!("unknown user: {user}"))
        })
    }

    async fn run(&self, principal: &Principal, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(principal, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, principal: &Principal, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        let zone = *engine.zone();
        match cmd {
            Command::InsertReservation {
                id,
                amenity_id,
                start,
                end,
            } => {
                let r = engine
                    .create_reservation(principal, id, amenity_id, &start, &end)
                    .await
                    .map_err(engine_err)?;
                Ok(reservation_rows(&zone, vec![(r, false)]))
            }
            Command::SetStatus {
                id,
                status: ReservationStatus::Confirmed,
                ..
            } => {
                let outcome = engine.approve(principal, id).await.map_err(engine_err)?;
                let auto_rejected = outcome.auto_rejected();
                Ok(reservation_rows(&zone, vec![(outcome.into_reservation(), auto_rejected)]))
            }
            Command::SetStatus { id, reason, .. } => {
                let r = engine
                    .cancel_as(principal, id, reason.as_deref())
                    .await
                    .map_err(engine_err)?;
                Ok(reservation_rows(&zone, vec![(r, false)]))
            }
            Command::HideReservation { id } => {
                let r = engine
                    .hide_reservation(principal, id)
                    .await
                    .map_err(engine_err)?;
                Ok(reservation_rows(&zone, vec![(r, false)]))
            }
            Command::SelectOwnReservations => {
                let rows = engine.list_own(principal).await;
                Ok(reservation_rows(&zone, plain(rows)))
            }
            Command::SelectReservation { id } => {
                let r = engine
                    .get_reservation(principal, id)
                    .await
                    .map_err(engine_err)?;
                Ok(reservation_rows(&zone, vec![(r, false)]))
            }
            Command::SelectPending => {
                let rows = engine.list_pending(principal).await.map_err(engine_err)?;
                Ok(reservation_rows(&zone, plain(rows)))
            }
            Command::SelectAmenityReservations {
                amenity_id,
                start,
                end,
            } => {
                let rows = engine
                    .list_amenity(amenity_id, &start, &end)
                    .await
                    .map_err(engine_err)?;
                Ok(reservation_rows(&zone, plain(rows)))
            }
            Command::SelectOccupancy {
                amenity_id,
                start,
                end,
            } => {
                let occupancy = engine
                    .occupancy(amenity_id, &start, &end)
                    .await
                    .map_err(engine_err)?;
                Ok(occupancy_rows(&zone, &occupancy))
            }
        }
    }
}

fn plain(rows: Vec<Reservation>) -> Vec<(Reservation, bool)> {
    rows.into_iter().map(|r| (r, false)).collect()
}

// ── Row rendering ────────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("user_id", Type::VARCHAR),
        text_field("amenity_id", Type::VARCHAR),
        text_field("start", Type::VARCHAR),
        text_field("end", Type::VARCHAR),
        text_field("status", Type::VARCHAR),
        text_field("created_at", Type::VARCHAR),
        text_field("updated_at", Type::VARCHAR),
        text_field("hidden", Type::BOOL),
        text_field("reason", Type::VARCHAR),
        text_field("auto_rejected", Type::BOOL),
    ]
}

fn occupancy_schema() -> Vec<FieldInfo> {
    vec![
        text_field("amenity_id", Type::VARCHAR),
        text_field("start", Type::VARCHAR),
        text_field("end", Type::VARCHAR),
        text_field("confirmed", Type::INT8),
        text_field("capacity", Type::INT8),
        text_field("remaining", Type::INT8),
    ]
}

/// Times render as RFC 3339 in the building's offset.
fn reservation_rows(zone: &BuildingZone, rows: Vec<(Reservation, bool)>) -> Response {
    let schema = Arc::new(reservation_schema());
    let encoded: Vec<PgWireResult<_>> = rows
        .into_iter()
        .map(|(r, auto_rejected)| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.user_id.to_string())?;
            encoder.encode_field(&r.amenity_id.to_string())?;
            encoder.encode_field(&zone.format(r.span.start))?;
            encoder.encode_field(&zone.format(r.span.end))?;
            encoder.encode_field(&r.status.as_str().to_string())?;
            encoder.encode_field(&zone.format(r.created_at))?;
            encoder.encode_field(&zone.format(r.updated_at))?;
            encoder.encode_field(&r.hidden)?;
            encoder.encode_field(&r.reason)?;
            encoder.encode_field(&auto_rejected)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(encoded)))
}

fn occupancy_rows(zone: &BuildingZone, occupancy: &Occupancy) -> Response {
    let schema = Arc::new(occupancy_schema());
    let encoded: Vec<PgWireResult<_>> = std::iter::once(occupancy)
        .map(|o| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&o.amenity_id.to_string())?;
            encoder.encode_field(&zone.format(o.span.start))?;
            encoder.encode_field(&zone.format(o.span.end))?;
            encoder.encode_field(&i64::from(o.confirmed))?;
            encoder.encode_field(&i64::from(o.capacity))?;
            encoder.encode_field(&i64::from(o.remaining()))?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(encoded)))
}

/// Every statement answers with rows; only occupancy has its own shape.
fn schema_for(sql: &str) -> Vec<FieldInfo> {
    if sql.to_uppercase().contains("OCCUPANCY") {
        occupancy_schema()
    } else {
        reservation_schema()
    }
}

#[async_trait]
impl SimpleQueryHandler for ConciergeHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let principal = self.resolve_principal(client).await?;
        debug!(user = %principal.user_id, "simple query: {query}");
        Ok(vec![self.run(&principal, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ConciergeQueryParser;

#[async_trait]
impl QueryParser for ConciergeQueryParser {
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

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ConciergeHandler {
    type Statement = String;
    type QueryParser = ConciergeQueryParser;

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
        let principal = self.resolve_principal(client).await?;
        let sql = substitute_params(portal);
        self.run(&principal, &sql).await
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
            schema_for(&target.statement),
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
        Ok(DescribePortalResponse::new(schema_for(&target.statement.statement)))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
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

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first, so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ConciergeFactory {
    handler: Arc<ConciergeHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<ConciergeAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl ConciergeFactory {
    pub fn new(engine: Arc<Engine>, directory: Arc<dyn Directory>, password: String) -> Self {
        let auth_source = ConciergeAuthSource::new(password, directory.clone());
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ConciergeHandler::new(engine, directory)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ConciergeFactory {
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
    directory: Arc<dyn Directory>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(ConciergeFactory::new(engine, directory, password));
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

/// SQLSTATE for an engine error. Invalid transitions get their own code so
/// clients can tell "already decided" from a capacity clash.
pub fn sqlstate(e: &EngineError) -> &'static str {
    if let EngineError::InvalidStateTransition { .. } = e {
        return "55000";
    }
    match e.kind() {
        ErrorKind::BadRequest => "22023",
        ErrorKind::Conflict => "23P01",
        ErrorKind::NotFound => "P0002",
        ErrorKind::Forbidden => "42501",
        ErrorKind::Internal => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
