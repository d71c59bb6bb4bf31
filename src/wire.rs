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
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;
use ulid::Ulid;

use crate::auth::ShopbookAuthSource;
use crate::error::BookingError;
use crate::model::*;
use crate::observability;
use crate::service::{Caller, DateCounts};
use crate::sql::{self, Command};
use crate::tenant::{TenantManager, TenantService};

pub struct ShopbookHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<ShopbookQueryParser>,
}

impl ShopbookHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(ShopbookQueryParser),
        }
    }

    fn resolve_service<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<TenantService>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    fn resolve_caller<C: ClientInfo>(client: &C) -> PgWireResult<Caller> {
        Caller::resolve(client.metadata().get("user").map(String::as_str)).map_err(|e| {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            booking_err(e)
        })
    }

    async fn run<C: ClientInfo>(&self, client: &C, sql_text: &str) -> PgWireResult<Response> {
        let service = self.resolve_service(client)?;
        let caller = Self::resolve_caller(client)?;
        let cmd = sql::parse_sql(sql_text).map_err(sql_err)?;

        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = execute_command(&service, &caller, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }
}

async fn execute_command(
    service: &TenantService,
    caller: &Caller,
    cmd: Command,
) -> PgWireResult<Response> {
    match cmd {
        Command::InsertShop { id, name, hours } => {
            service
                .register_shop(caller, id, name, hours)
                .await
                .map_err(booking_err)?;
            Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
        }
        Command::UpdateShopHours { id, hours } => {
            service
                .set_working_hours(caller, id, hours)
                .await
                .map_err(booking_err)?;
            Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
        }
        Command::InsertClient { shop_id, client } => {
            service
                .register_client(caller, shop_id, client)
                .await
                .map_err(booking_err)?;
            Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
        }
        Command::InsertAppointment { draft } => {
            let created = service
                .create_appointment(caller, draft)
                .await
                .map_err(booking_err)?;
            appointment_rows(vec![created])
        }
        Command::UpdateAppointment { id, patch } => {
            let updated = service
                .update_appointment(caller, id, patch)
                .await
                .map_err(booking_err)?;
            appointment_rows(vec![updated])
        }
        Command::CancelAppointment { id } => {
            service
                .cancel_appointment(caller, id)
                .await
                .map_err(booking_err)?;
            Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
        }
        Command::SelectAppointment { id } => {
            let apt = service
                .get_appointment(caller, id)
                .await
                .map_err(booking_err)?;
            appointment_rows(vec![apt])
        }
        Command::SelectAppointments {
            shop_id,
            range,
            include_cancelled,
        } => {
            let apts = service
                .get_appointments_by_time_range(caller, shop_id, range, include_cancelled)
                .await
                .map_err(booking_err)?;
            appointment_rows(apts)
        }
        Command::SelectCounts { shop_id, range } => {
            let counts = service
                .get_appointment_counts(caller, shop_id, range)
                .await
                .map_err(booking_err)?;
            count_rows(&counts)
        }
        Command::SelectAvailability {
            shop_id,
            date,
            min_duration,
        } => {
            let slots = service
                .free_slots(caller, shop_id, date, min_duration)
                .await
                .map_err(booking_err)?;

            let schema = Arc::new(availability_schema());
            let shop_str = shop_id.to_string();
            let date_str = date.to_string();
            let rows: Vec<PgWireResult<_>> = slots
                .into_iter()
                .map(|slot| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&shop_str)?;
                    encoder.encode_field(&date_str)?;
                    encoder.encode_field(&fmt_time(slot.start))?;
                    encoder.encode_field(&fmt_time(slot.end))?;
                    Ok(encoder.take_row())
                })
                .collect();

            Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
        }
        Command::SelectShops => {
            let shops = service.list_shops(caller).await;
            let schema = Arc::new(shops_schema());
            let rows: Vec<PgWireResult<_>> = shops
                .into_iter()
                .map(|shop| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&shop.id.to_string())?;
                    encoder.encode_field(&shop.owner)?;
                    encoder.encode_field(&shop.name)?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
        }
        Command::Listen { channel } => {
            let shop_id = parse_channel(&channel)?;
            debug!("LISTEN on shop {shop_id}");
            Ok(Response::Execution(Tag::new("LISTEN")))
        }
        Command::Unlisten { channel } => {
            parse_channel(&channel)?;
            Ok(Response::Execution(Tag::new("UNLISTEN")))
        }
        Command::UnlistenAll => Ok(Response::Execution(Tag::new("UNLISTEN"))),
    }
}

/// Channels are named `shop_{ulid}`.
fn parse_channel(channel: &str) -> PgWireResult<Ulid> {
    let id = channel.strip_prefix("shop_").ok_or_else(|| {
        user_error(
            "42000",
            format!("invalid channel: {channel} (expected shop_{{id}})"),
        )
    })?;
    Ulid::from_string(id).map_err(|e| user_error("42000", format!("bad ULID in channel: {e}")))
}

fn fmt_time(t: chrono::NaiveTime) -> String {
    t.format("%H:%M:%S").to_string()
}

fn appointment_rows(apts: Vec<Appointment>) -> PgWireResult<Response> {
    let schema = Arc::new(appointment_schema());
    let rows: Vec<PgWireResult<_>> = apts
        .into_iter()
        .map(|apt| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&apt.id.to_string())?;
            encoder.encode_field(&apt.shop_id.to_string())?;
            encoder.encode_field(&apt.client_id.map(|id| id.to_string()))?;
            encoder.encode_field(&apt.client.as_ref().map(|c| c.name.clone()))?;
            encoder.encode_field(&apt.order_id.map(|id| id.to_string()))?;
            encoder.encode_field(&apt.title)?;
            encoder.encode_field(&apt.date.to_string())?;
            encoder.encode_field(&fmt_time(apt.start_time))?;
            encoder.encode_field(&fmt_time(apt.end_time))?;
            encoder.encode_field(&apt.kind.as_str().to_string())?;
            encoder.encode_field(&apt.status.as_str().to_string())?;
            encoder.encode_field(&apt.notes)?;
            encoder.encode_field(&apt.reminder_sent)?;
            encoder.encode_field(&apt.created_at)?;
            encoder.encode_field(&apt.updated_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn count_rows(counts: &DateCounts) -> PgWireResult<Response> {
    let schema = Arc::new(counts_schema());
    let rows: Vec<PgWireResult<_>> = counts
        .iter()
        .map(|(date, count)| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&date.to_string())?;
            encoder.encode_field(&i64::from(*count))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn appointment_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("shop_id", Type::VARCHAR),
        field("client_id", Type::VARCHAR),
        field("client_name", Type::VARCHAR),
        field("order_id", Type::VARCHAR),
        field("title", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("start_time", Type::VARCHAR),
        field("end_time", Type::VARCHAR),
        field("type", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("notes", Type::VARCHAR),
        field("reminder_sent", Type::BOOL),
        field("created_at", Type::INT8),
        field("updated_at", Type::INT8),
    ]
}

fn counts_schema() -> Vec<FieldInfo> {
    vec![field("date", Type::VARCHAR), field("count", Type::INT8)]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("shop_id", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("start_time", Type::VARCHAR),
        field("end_time", Type::VARCHAR),
    ]
}

fn shops_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("owner", Type::VARCHAR),
        field("name", Type::VARCHAR),
    ]
}

/// Row description for a statement, guessed from its keywords since bound
/// parameters are not known at describe time.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    if upper.starts_with("SELECT") {
        if upper.contains("APPOINTMENT_COUNTS") {
            counts_schema()
        } else if upper.contains("AVAILABILITY") {
            availability_schema()
        } else if upper.contains("APPOINTMENTS") {
            appointment_schema()
        } else if upper.contains("SHOPS") {
            shops_schema()
        } else {
            vec![]
        }
    } else if (upper.starts_with("INSERT") || upper.starts_with("UPDATE"))
        && upper.contains("APPOINTMENTS")
    {
        appointment_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for ShopbookHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ShopbookQueryParser;

#[async_trait]
impl QueryParser for ShopbookQueryParser {
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
impl ExtendedQueryHandler for ShopbookHandler {
    type Statement = String;
    type QueryParser = ShopbookQueryParser;

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
        self.run(client, &sql).await
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

/// Inline bound text-format parameters as quoted literals. Walks the
/// placeholders from the highest index down so `$1` never eats `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        result = result.replace(&format!("${}", i + 1), &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ShopbookFactory {
    handler: Arc<ShopbookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<ShopbookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl ShopbookFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(ShopbookHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                ShopbookAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ShopbookFactory {
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

/// Serve one client socket until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(ShopbookFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn booking_err(e: BookingError) -> PgWireError {
    user_error(e.sqlstate(), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
