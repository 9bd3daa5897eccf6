use std::fmt::Debug;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
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
use pgwire::api::{
    ClientInfo, ClientPortalStore, METADATA_USER, NoopHandler, PgWireServerHandlers, Type,
};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::TokenAuthSource;
use crate::observability;
use crate::projection::ScheduleProjection;
use crate::scheduler::{BookingRequest, BookingScheduler, SchedulerError};
use crate::sql::{self, Command};

pub struct CleanupHandler {
    scheduler: Arc<BookingScheduler>,
    projection: Arc<ScheduleProjection>,
    query_parser: Arc<CleanupQueryParser>,
}

impl CleanupHandler {
    pub fn new(scheduler: Arc<BookingScheduler>, projection: Arc<ScheduleProjection>) -> Self {
        Self {
            scheduler,
            projection,
            query_parser: Arc::new(CleanupQueryParser),
        }
    }

    async fn execute(&self, identity: Option<&str>, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let start = Instant::now();
        let result = self.execute_command(identity, cmd).await;
        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        metrics::counter!(observability::RPC_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::RPC_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result.map_err(scheduler_err)
    }

    async fn execute_command(
        &self,
        identity: Option<&str>,
        cmd: Command,
    ) -> Result<Response, SchedulerError> {
        match cmd {
            Command::CreateBooking { fields } => {
                let receipt = self
                    .scheduler
                    .create_booking(identity, BookingRequest::from_columns(fields))
                    .await?;
                let schema = Arc::new(receipt_schema());
                let row = encode_row(&schema, |encoder| {
                    encoder.encode_field(&receipt.id.to_string())?;
                    encoder.encode_field(&receipt.success)?;
                    encoder.encode_field(&receipt.message)
                });
                Ok(Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(vec![row]),
                )))
            }
            Command::CancelBooking { id } => {
                self.scheduler.cancel_booking(identity, id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::RateBooking { booking_id, stars } => {
                self.scheduler
                    .rate_booking(identity, booking_id, stars)
                    .await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SelectMySchedule => {
                let party = identity
                    .filter(|id| !id.trim().is_empty())
                    .ok_or(SchedulerError::Unauthenticated)?;
                let schema = Arc::new(schedule_schema());
                let rows: Vec<PgWireResult<_>> = self
                    .projection
                    .schedule_for(party)
                    .into_iter()
                    .map(|entry| {
                        let details = serde_json::to_string(&entry.details)
                            .map_err(|e| PgWireError::ApiError(Box::new(e)))?;
                        encode_row(&schema, |encoder| {
                            encoder.encode_field(&entry.booking_id.to_string())?;
                            encoder.encode_field(&entry.role.as_str())?;
                            encoder.encode_field(&entry.counterpart_id)?;
                            encoder.encode_field(&entry.slot.date_string())?;
                            encoder.encode_field(&entry.slot.time_string())?;
                            encoder.encode_field(&entry.status.as_str())?;
                            encoder.encode_field(&details)
                        })
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectProviderRating { provider_id } => {
                let rating = self.scheduler.provider_rating(&provider_id)?;
                let schema = Arc::new(rating_schema());
                let row = encode_row(&schema, |encoder| {
                    encoder.encode_field(&rating.provider_id)?;
                    encoder.encode_field(&(rating.count as i64))?;
                    encoder.encode_field(&(rating.sum as i64))?;
                    encoder.encode_field(&rating.average)
                });
                Ok(Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(vec![row]),
                )))
            }
        }
    }
}

/// The authenticated login user, if any.
fn identity<C: ClientInfo>(client: &C) -> Option<String> {
    client.metadata().get(METADATA_USER).cloned()
}

fn encode_row(
    schema: &Arc<Vec<FieldInfo>>,
    fill: impl FnOnce(&mut DataRowEncoder) -> PgWireResult<()>,
) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    fill(&mut encoder)?;
    Ok(encoder.take_row())
}

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn receipt_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("success", Type::BOOL),
        text_field("message", Type::VARCHAR),
    ]
}

/// A party's schedule lines; `details` is the booking's descriptive fields
/// as a JSON object, for rendering names and avatars.
fn schedule_schema() -> Vec<FieldInfo> {
    let mut fields: Vec<FieldInfo> = ["id", "role", "counterpart_id", "date", "time", "status"]
        .into_iter()
        .map(|name| text_field(name, Type::VARCHAR))
        .collect();
    fields.push(text_field("details", Type::JSON));
    fields
}

fn rating_schema() -> Vec<FieldInfo> {
    vec![
        text_field("provider_id", Type::VARCHAR),
        text_field("count", Type::INT8),
        text_field("sum", Type::INT8),
        text_field("average", Type::FLOAT8),
    ]
}

/// Row shape of a statement, decided from its text so it also works on
/// statements that still carry `$n` placeholders.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    let trimmed = upper.trim_start();
    if trimmed.starts_with("INSERT") && upper.contains("BOOKINGS") {
        receipt_schema()
    } else if trimmed.starts_with("SELECT") && upper.contains("PROVIDER_RATINGS") {
        rating_schema()
    } else if trimmed.starts_with("SELECT") && upper.contains("BOOKINGS") {
        schedule_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for CleanupHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let identity = identity(client);
        let response = self.execute(identity.as_deref(), query).await?;
        Ok(vec![response])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CleanupQueryParser;

#[async_trait]
impl QueryParser for CleanupQueryParser {
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
impl ExtendedQueryHandler for CleanupHandler {
    type Statement = String;
    type QueryParser = CleanupQueryParser;

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
        let identity = identity(client);
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        self.execute(identity.as_deref(), &sql).await
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

/// `$N` placeholders outside quoted literals and identifiers, as
/// `(byte range, N)` in order of appearance.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled quote closes and reopens, which leaves us inside.
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let start = i;
                while i + 1 < bytes.len() && bytes[i + 1].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..=i].parse::<usize>() {
                    found.push((start..i + 1, n));
                }
            }
            None => {}
        }
        i += 1;
    }
    found
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Substitute `$1, $2, ...` with bound parameter values as quoted text, in
/// one pass over the statement, so bound values are never rescanned.
fn substitute_params(sql: &str, params: &[Option<Bytes>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    for (span, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        result.push_str(&sql[copied..span.start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        copied = span.end;
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct CleanupFactory {
    handler: Arc<CleanupHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<TokenAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl CleanupFactory {
    pub fn new(
        scheduler: Arc<BookingScheduler>,
        projection: Arc<ScheduleProjection>,
        auth: TokenAuthSource,
    ) -> Self {
        Self {
            handler: Arc::new(CleanupHandler::new(scheduler, projection)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth,
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CleanupFactory {
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
    scheduler: Arc<BookingScheduler>,
    projection: Arc<ScheduleProjection>,
    auth: TokenAuthSource,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = CleanupFactory::new(scheduler, projection, auth);
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

/// SQLSTATE for each scheduler outcome. `40001` is the code clients
/// already treat as "retry the transaction".
pub fn sqlstate(e: &SchedulerError) -> &'static str {
    match e {
        SchedulerError::Unauthenticated => "28000",
        SchedulerError::InvalidArgument(_) => "22023",
        SchedulerError::SlotConflict(_) => "23P01",
        SchedulerError::Conflict { .. } => "40001",
        SchedulerError::NotFound(_) => "P0002",
        SchedulerError::PermissionDenied(_) => "42501",
        SchedulerError::Internal(_) => "XX000",
    }
}

fn scheduler_err(e: SchedulerError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
