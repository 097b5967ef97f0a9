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
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::auth::SeatlineAuthSource;
use crate::engine::{Engine, EngineError, SectionSpec};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

pub struct SeatlineHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SeatlineQueryParser>,
}

impl SeatlineHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SeatlineQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// Parse, execute and record request metrics for one statement.
    async fn run(&self, engine: &Engine, sql: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::REQUESTS_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertSection {
                id,
                course_id,
                term_id,
                capacity,
                meetings,
                prerequisites,
            } => {
                engine
                    .publish_section(SectionSpec {
                        id,
                        course_id,
                        term_id,
                        capacity,
                        meetings,
                        prerequisites,
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateSection {
                id,
                capacity,
                status,
            } => {
                if let Some(capacity) = capacity {
                    engine.revise_capacity(id, capacity).await.map_err(engine_err)?;
                }
                match status {
                    Some(SectionStatus::Cancelled) => {
                        let outcome = engine.cancel_section(id).await.map_err(engine_err)?;
                        debug!(section_id = %id, rejected = outcome.rejected, "section cancelled over the wire");
                    }
                    Some(status) => {
                        engine.set_status(id, status).await.map_err(engine_err)?;
                    }
                    None => {}
                }
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::ArchiveTerm { term_id } => {
                let archived = engine.archive_term(&term_id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(archived))])
            }
            Command::Register { requests } => {
                // An unknown section fails the statement before any row runs.
                for (_, section_id) in &requests {
                    engine.section_status(*section_id).await.map_err(engine_err)?;
                }
                let schema = Arc::new(registration_schema());
                let single = requests.len() == 1;
                let mut rows = Vec::with_capacity(requests.len());
                for (student_id, section_id) in requests {
                    match engine.register(student_id, section_id).await {
                        Ok(outcome) => {
                            rows.push(encode_registration(&schema, student_id, section_id, &outcome))
                        }
                        Err(e) if single => return Err(engine_err(e)),
                        // Earlier rows are committed, so later failures are
                        // reported in their own row.
                        Err(e) => {
                            warn!(%student_id, %section_id, error = %e, "registration row failed");
                            rows.push(encode_registration_error(&schema, student_id, section_id, &e));
                        }
                    }
                }
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::Drop {
                student_id,
                section_id,
            } => {
                let outcome = engine
                    .drop_registration(student_id, section_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(drop_schema());
                let row = encode_drop(&schema, &outcome);
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(vec![row]),
                ))])
            }
            Command::InsertCompletedCourses { rows } => {
                let count = rows.len();
                for (student_id, course_id, grade) in rows {
                    engine
                        .record_completion(student_id, &course_id, grade)
                        .await
                        .map_err(engine_err)?;
                }
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(count))])
            }
            Command::InsertHold {
                id,
                student_id,
                reason,
            } => {
                engine
                    .place_hold(id, student_id, &reason)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteHold { id } => {
                engine.clear_hold(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectSectionStatus { section_id } => {
                let info = engine.section_status(section_id).await.map_err(engine_err)?;
                let schema = Arc::new(section_status_schema());
                let row = encode_section_status(&schema, &info);
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(vec![row]),
                ))])
            }
            Command::SelectSections { term_id } => {
                let sections = engine.list_sections(term_id.as_deref()).await;
                let schema = Arc::new(sections_schema());
                let rows: Vec<PgWireResult<_>> = sections
                    .iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.id.to_string())?;
                        encoder.encode_field(&s.course_id)?;
                        encoder.encode_field(&s.term_id)?;
                        encoder.encode_field(&(s.capacity as i64))?;
                        encoder.encode_field(&(s.occupied as i64))?;
                        encoder.encode_field(&(s.waitlist_length as i64))?;
                        encoder.encode_field(&s.status.as_str().to_string())?;
                        encoder.encode_field(&format_meetings(&s.meetings))?;
                        encoder.encode_field(&s.prerequisites.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectWaitlist { section_id } => {
                let entries = engine.waitlist(section_id).await.map_err(engine_err)?;
                let schema = Arc::new(waitlist_schema());
                let rows: Vec<PgWireResult<_>> = entries
                    .iter()
                    .map(|w| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&(w.position as i64))?;
                        encoder.encode_field(&w.student_id.to_string())?;
                        encoder.encode_field(&w.record_id.to_string())?;
                        encoder.encode_field(&(w.seq as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectEnrollments {
                section_id,
                student_id,
            } => {
                let records = match (section_id, student_id) {
                    (Some(section_id), student_id) => engine
                        .section_records(section_id)
                        .await
                        .map_err(engine_err)?
                        .into_iter()
                        .filter(|r| student_id.is_none_or(|s| r.student_id == s))
                        .collect(),
                    (None, Some(student_id)) => engine.student_records(student_id).await,
                    (None, None) => Vec::new(),
                };
                let schema = Arc::new(enrollments_schema());
                let rows: Vec<PgWireResult<_>> = records
                    .iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.record_id.to_string())?;
                        encoder.encode_field(&r.student_id.to_string())?;
                        encoder.encode_field(&r.section_id.to_string())?;
                        encoder.encode_field(&r.course_id)?;
                        encoder.encode_field(&r.state.as_str().to_string())?;
                        encoder.encode_field(&r.state.reason().map(|reason| reason.as_str().to_string()))?;
                        encoder.encode_field(&r.position.map(|p| p as i64))?;
                        encoder.encode_field(&r.requested_at)?;
                        encoder.encode_field(&r.updated_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectHolds { student_id } => {
                let holds = engine.holds(student_id);
                let schema = Arc::new(holds_schema());
                let rows: Vec<PgWireResult<_>> = holds
                    .iter()
                    .map(|h| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&h.id.to_string())?;
                        encoder.encode_field(&h.student_id.to_string())?;
                        encoder.encode_field(&h.reason)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::Listen { channel } => {
                let section_id = parse_channel(&channel)?;
                engine.section_status(section_id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                parse_channel(&channel)?;
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
            Command::UnlistenAll => Ok(vec![Response::Execution(Tag::new("UNLISTEN"))]),
        }
    }
}

/// `section_{id}` → section id.
fn parse_channel(channel: &str) -> PgWireResult<Ulid> {
    let id = channel.strip_prefix("section_").ok_or_else(|| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "42000".into(),
            format!("invalid channel: {channel} (expected section_{{id}})"),
        )))
    })?;
    Ulid::from_string(id).map_err(|e| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "42000".into(),
            format!("bad ULID in channel: {e}"),
        )))
    })
}

fn encode_drop(schema: &Arc<Vec<FieldInfo>>, outcome: &DropOutcome) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&"dropped".to_string())?;
    encoder.encode_field(&outcome.record_id.to_string())?;
    encoder.encode_field(&(outcome.promoted.len() as i64))?;
    Ok(encoder.take_row())
}

fn encode_section_status(
    schema: &Arc<Vec<FieldInfo>>,
    info: &SectionStatusInfo,
) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&info.section_id.to_string())?;
    encoder.encode_field(&(info.occupied as i64))?;
    encoder.encode_field(&(info.capacity as i64))?;
    encoder.encode_field(&(info.waitlist_length as i64))?;
    encoder.encode_field(&info.status.as_str().to_string())?;
    encoder.encode_field(&info.halted)?;
    Ok(encoder.take_row())
}

fn encode_registration(
    schema: &Arc<Vec<FieldInfo>>,
    student_id: Ulid,
    section_id: Ulid,
    outcome: &RegistrationOutcome,
) -> PgWireResult<DataRow> {
    let (position, reason) = match outcome {
        RegistrationOutcome::Enrolled { .. } => (None, None),
        RegistrationOutcome::Waitlisted { position, .. } => (Some(*position as i64), None),
        RegistrationOutcome::Rejected { reason } => (None, Some(reason.as_str().to_string())),
    };
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&student_id.to_string())?;
    encoder.encode_field(&section_id.to_string())?;
    encoder.encode_field(&outcome.label().to_string())?;
    encoder.encode_field(&position)?;
    encoder.encode_field(&reason)?;
    encoder.encode_field(&outcome.record_id().map(|id| id.to_string()))?;
    Ok(encoder.take_row())
}

/// A batch row whose request failed: status `error`, the message as reason.
fn encode_registration_error(
    schema: &Arc<Vec<FieldInfo>>,
    student_id: Ulid,
    section_id: Ulid,
    error: &EngineError,
) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&student_id.to_string())?;
    encoder.encode_field(&section_id.to_string())?;
    encoder.encode_field(&"error".to_string())?;
    encoder.encode_field(&None::<i64>)?;
    encoder.encode_field(&Some(error.to_string()))?;
    encoder.encode_field(&None::<String>)?;
    Ok(encoder.take_row())
}

// ── Result schemas ───────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn registration_schema() -> Vec<FieldInfo> {
    vec![
        text("student_id"),
        text("section_id"),
        text("status"),
        int8("position"),
        text("reason"),
        text("record_id"),
    ]
}

fn drop_schema() -> Vec<FieldInfo> {
    vec![text("status"), text("record_id"), int8("promoted")]
}

fn section_status_schema() -> Vec<FieldInfo> {
    vec![
        text("section_id"),
        int8("occupied"),
        int8("capacity"),
        int8("waitlist_length"),
        text("status"),
        FieldInfo::new("halted".into(), None, None, Type::BOOL, FieldFormat::Text),
    ]
}

fn sections_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("course_id"),
        text("term_id"),
        int8("capacity"),
        int8("occupied"),
        int8("waitlist_length"),
        text("status"),
        text("meetings"),
        text("prerequisites"),
    ]
}

fn waitlist_schema() -> Vec<FieldInfo> {
    vec![
        int8("position"),
        text("student_id"),
        text("record_id"),
        int8("seq"),
    ]
}

fn enrollments_schema() -> Vec<FieldInfo> {
    vec![
        text("record_id"),
        text("student_id"),
        text("section_id"),
        text("course_id"),
        text("state"),
        text("reason"),
        int8("position"),
        int8("requested_at"),
        int8("updated_at"),
    ]
}

fn holds_schema() -> Vec<FieldInfo> {
    vec![text("id"), text("student_id"), text("reason")]
}

/// Row description for a statement, without executing it. Statements that do
/// not parse describe as no rows; the error surfaces at execution.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    match sql::parse_sql(&blank_params(sql)) {
        Ok(Command::Register { .. }) => registration_schema(),
        Ok(Command::Drop { .. }) => drop_schema(),
        Ok(Command::SelectSectionStatus { .. }) => section_status_schema(),
        Ok(Command::SelectSections { .. }) => sections_schema(),
        Ok(Command::SelectWaitlist { .. }) => waitlist_schema(),
        Ok(Command::SelectEnrollments { .. }) => enrollments_schema(),
        Ok(Command::SelectHolds { .. }) => holds_schema(),
        _ => vec![],
    }
}

/// Replace every `$n` with a placeholder ULID literal so the statement's
/// shape can be parsed before parameters are bound.
fn blank_params(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' && chars.peek().is_some_and(char::is_ascii_digit) {
            while chars.peek().is_some_and(char::is_ascii_digit) {
                chars.next();
            }
            out.push_str(&format!("'{}'", Ulid::nil()));
        } else {
            out.push(c);
        }
    }
    out
}

#[async_trait]
impl SimpleQueryHandler for SeatlineHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        self.run(&engine, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SeatlineQueryParser;

#[async_trait]
impl QueryParser for SeatlineQueryParser {
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
impl ExtendedQueryHandler for SeatlineHandler {
    type Statement = String;
    type QueryParser = SeatlineQueryParser;

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
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let mut responses = self.run(&engine, &sql).await?;
        if responses.is_empty() {
            return Ok(Response::EmptyQuery);
        }
        Ok(responses.remove(0))
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

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if let Ok(n) = sql[start..i].parse::<usize>() {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Higher-numbered placeholders go first so `$1` never clobbers `$10`.
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

pub struct SeatlineFactory {
    handler: Arc<SeatlineHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SeatlineAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SeatlineFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, user: String, password: String) -> Self {
        let auth_source = SeatlineAuthSource::new(user, password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SeatlineHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SeatlineFactory {
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
    tenant_manager: Arc<TenantManager>,
    user: String,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(SeatlineFactory::new(tenant_manager, user, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "P0001".into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
