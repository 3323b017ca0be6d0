use std::collections::HashMap;
use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{Sink, SinkExt, stream};
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
use pgwire::messages::response::NotificationResponse;
use pgwire::tokio::{TlsAcceptor, process_socket};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::auth::DeviceAuthSource;
use crate::engine::{Engine, EngineError, now_ms};
use crate::model::*;
use crate::notify::{self, Notification};
use crate::observability;
use crate::site::SiteManager;
use crate::sql::{self, Command};

/// State private to one client connection.
#[derive(Default)]
struct ConnState {
    /// Staff session bound by a successful `INSERT INTO staff_sessions`.
    session: Option<Ulid>,
    listeners: HashMap<String, broadcast::Receiver<Notification>>,
}

pub struct ClubHandler {
    sites: Arc<SiteManager>,
    query_parser: Arc<ClubQueryParser>,
    conn: Mutex<ConnState>,
}

impl ClubHandler {
    pub fn new(sites: Arc<SiteManager>) -> Self {
        Self {
            sites,
            query_parser: Arc::new(ClubQueryParser),
            conn: Mutex::new(ConnState::default()),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.sites.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("site error: {e}"),
            )))
        })
    }

    /// Member behind this connection's bound session, holding at least `role`.
    async fn require(&self, engine: &Engine, role: Role) -> PgWireResult<StaffMember> {
        let session = self.conn.lock().await.session;
        let result = match session {
            Some(id) => engine.authorize(&id, now_ms(), role),
            None => Err(EngineError::Unauthorized("no staff session")),
        };
        result.map_err(|e| {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL, "kind" => "staff").increment(1);
            engine_err(e)
        })
    }

    async fn run<C>(&self, client: &mut C, query: &str) -> PgWireResult<Response>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        debug!("{label}");

        let started = Instant::now();
        let result = self.execute_command(&engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());

        self.flush_notifications(client).await?;
        result
    }

    /// Deliver everything published on this connection's channels since the
    /// last response.
    async fn flush_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let pending = {
            let mut conn = self.conn.lock().await;
            drain_listeners(&mut conn.listeners)
        };
        if pending.is_empty() {
            return Ok(());
        }
        let pid = client.pid_and_secret_key().0;
        for n in pending {
            client
                .send(PgWireBackendMessage::NotificationResponse(
                    NotificationResponse::new(pid, n.channel.to_string(), n.payload.to_string()),
                ))
                .await?;
        }
        Ok(())
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        let now = now_ms();
        match cmd {
            Command::InsertResource { id, number, tier } => {
                self.require(engine, Role::Staff).await?;
                engine
                    .add_resource(id, number, tier, now)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::RetireResource { id } => {
                self.require(engine, Role::Staff).await?;
                engine.retire_resource(id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::ChangeStatus {
                resource_id,
                status,
            } => {
                let member = self.require(engine, Role::Staff).await?;
                engine
                    .change_status(resource_id, status, Some(member.id), now)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::OpenLane {
                lane,
                customer_id,
                tier,
            } => {
                engine
                    .open_lane(lane, customer_id, tier, now)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::CloseLane { lane } => {
                engine.close_lane(&lane, now).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::CheckIn { visit_id, lane } => {
                engine
                    .check_in(visit_id, &lane, now)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::Renew { visit_id } => {
                engine.renew(visit_id, now).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::CheckOut { visit_id } => {
                engine.check_out(visit_id, now).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::JoinWaitlist { id, visit_id, tier } => {
                engine
                    .join_waitlist(id, visit_id, tier, now)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::LeaveWaitlist { id } => {
                engine.leave_waitlist(id, now).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::AcceptUpgrade { waitlist_id } => {
                engine
                    .accept_upgrade(waitlist_id, now)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertLineItem {
                id,
                visit_id,
                description,
                amount,
            } => {
                self.require(engine, Role::Staff).await?;
                engine
                    .add_line_item(id, visit_id, description, amount, now)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertStaff { id, name, role, pin } => {
                // An empty site bootstraps its first member without a session.
                let added = if engine.has_staff() {
                    self.require(engine, Role::Admin).await?;
                    engine.add_staff(id, name, role, pin).await
                } else {
                    engine.bootstrap_staff(id, name, role, pin).await
                };
                added.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::DeactivateStaff { id } => {
                self.require(engine, Role::Admin).await?;
                engine.deactivate_staff(id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::OpenSession { id, staff_id, pin } => {
                let session = engine
                    .open_session(id, staff_id, pin, now)
                    .await
                    .map_err(|e| {
                        metrics::counter!(observability::AUTH_FAILURES_TOTAL, "kind" => "pin")
                            .increment(1);
                        engine_err(e)
                    })?;
                self.conn.lock().await.session = Some(session.id);
                Ok(inserted(1))
            }
            Command::CloseSession { id } => {
                // Logging out someone else takes an admin.
                let bound = self.conn.lock().await.session;
                if bound != Some(id) {
                    self.require(engine, Role::Admin).await?;
                }
                engine.close_session(id).await.map_err(engine_err)?;
                let mut conn = self.conn.lock().await;
                if conn.session == Some(id) {
                    conn.session = None;
                }
                Ok(deleted(1))
            }
            Command::ClockIn { id } => {
                let member = self.require(engine, Role::Staff).await?;
                engine
                    .clock_in(id, member.id, now)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::ClockOut { id } => {
                let member = self.require(engine, Role::Staff).await?;
                engine
                    .clock_out(id, member.id, now)
                    .await
                    .map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::ScheduleShift {
                id,
                staff_id,
                start,
                end,
            } => {
                self.require(engine, Role::Admin).await?;
                engine
                    .schedule_shift(id, staff_id, start, end)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::RemoveShift { id } => {
                self.require(engine, Role::Admin).await?;
                engine.remove_shift(id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::SelectInventory { tier } => {
                let mut resources = engine.inventory().await;
                if let Some(tier) = tier {
                    resources.retain(|r| r.tier == tier);
                }
                rows(inventory_schema(), resources, |enc, r| {
                    enc.encode_field(&r.id.to_string())?;
                    enc.encode_field(&r.number)?;
                    enc.encode_field(&r.tier.as_str())?;
                    enc.encode_field(&r.status.as_str())?;
                    enc.encode_field(&r.status_changed_at)?;
                    enc.encode_field(&r.visit_id.map(|id| id.to_string()))?;
                    enc.encode_field(&r.customer_id.map(|id| id.to_string()))?;
                    enc.encode_field(&r.ends_at)?;
                    enc.encode_field(&r.hold_id.map(|id| id.to_string()))?;
                    enc.encode_field(&r.hold_expires_at)
                })
            }
            Command::SelectAvailability => {
                rows(availability_schema(), engine.availability().await, |enc, a| {
                    enc.encode_field(&a.tier.as_str())?;
                    enc.encode_field(&(a.total as i64))?;
                    enc.encode_field(&(a.assignable as i64))?;
                    enc.encode_field(&(a.occupied as i64))?;
                    enc.encode_field(&(a.held as i64))?;
                    enc.encode_field(&(a.dirty as i64))?;
                    enc.encode_field(&(a.cleaning as i64))?;
                    enc.encode_field(&(a.waiting as i64))
                })
            }
            Command::SelectVisits { overdue_only } => {
                let visits = engine.visits(now, overdue_only).await;
                rows(visits_schema(), visits, |enc, v| {
                    enc.encode_field(&v.id.to_string())?;
                    enc.encode_field(&v.customer_id.to_string())?;
                    enc.encode_field(&v.resource_id.to_string())?;
                    enc.encode_field(&v.number)?;
                    enc.encode_field(&v.tier.as_str())?;
                    enc.encode_field(&v.started_at)?;
                    enc.encode_field(&v.ends_at)?;
                    enc.encode_field(&(v.renewals as i64))?;
                    enc.encode_field(&v.overdue)
                })
            }
            Command::SelectWaitlist => {
                rows(waitlist_schema(), engine.waitlist().await, |enc, w| {
                    let offer = match &w.status {
                        WaitlistStatus::Offered {
                            resource_id,
                            expires_at,
                            ..
                        } => Some((resource_id.to_string(), *expires_at)),
                        _ => None,
                    };
                    enc.encode_field(&w.id.to_string())?;
                    enc.encode_field(&w.visit_id.to_string())?;
                    enc.encode_field(&w.customer_id.to_string())?;
                    enc.encode_field(&w.tier.as_str())?;
                    enc.encode_field(&w.created_at)?;
                    enc.encode_field(&w.status.as_str())?;
                    enc.encode_field(&offer.as_ref().map(|(rid, _)| rid.clone()))?;
                    enc.encode_field(&offer.map(|(_, exp)| exp))
                })
            }
            Command::SelectLineItems { visit_id } => {
                self.require(engine, Role::Staff).await?;
                rows(line_items_schema(), engine.line_items(&visit_id), |enc, li| {
                    enc.encode_field(&li.id.to_string())?;
                    enc.encode_field(&li.visit_id.to_string())?;
                    enc.encode_field(&li.kind.as_str())?;
                    enc.encode_field(&li.description)?;
                    enc.encode_field(&li.amount)?;
                    enc.encode_field(&li.created_at)
                })
            }
            Command::SelectCheckoutQuote { visit_id } => {
                let quote = engine
                    .checkout_quote(visit_id, now)
                    .await
                    .map_err(engine_err)?;
                rows(checkout_quote_schema(), vec![quote], |enc, q| {
                    enc.encode_field(&q.visit_id.to_string())?;
                    enc.encode_field(&q.ends_at)?;
                    enc.encode_field(&q.late_ms)?;
                    enc.encode_field(&q.late_fee)?;
                    enc.encode_field(&q.balance)
                })
            }
            Command::SelectLaneSessions => {
                rows(lane_sessions_schema(), engine.lane_sessions(), |enc, s| {
                    enc.encode_field(&s.lane)?;
                    enc.encode_field(&s.customer_id.to_string())?;
                    enc.encode_field(&s.tier.as_str())?;
                    enc.encode_field(&s.resource_id.to_string())?;
                    enc.encode_field(&s.hold_id.to_string())?;
                    enc.encode_field(&s.started_at)?;
                    enc.encode_field(&s.expires_at)
                })
            }
            Command::SelectStaff => {
                self.require(engine, Role::Staff).await?;
                rows(staff_schema(), engine.staff_members(), |enc, m| {
                    enc.encode_field(&m.id.to_string())?;
                    enc.encode_field(&m.name)?;
                    enc.encode_field(&m.role.as_str())?;
                    enc.encode_field(&m.active)?;
                    enc.encode_field(&m.clocked_in)
                })
            }
            Command::SelectTimeclock {
                staff_id,
                start,
                end,
            } => {
                // Anyone may read their own timesheet; others need an admin.
                let member = self.require(engine, Role::Staff).await?;
                if member.id != staff_id && member.role < Role::Admin {
                    return Err(engine_err(EngineError::Unauthorized("admin role required")));
                }
                let sheet = engine
                    .timesheet(staff_id, start, end, now)
                    .map_err(engine_err)?;
                let window = Span::new(start, end);
                rows(timeclock_schema(), sheet.entries, |enc, e| {
                    enc.encode_field(&e.id.to_string())?;
                    enc.encode_field(&e.staff_id.to_string())?;
                    enc.encode_field(&e.clock_in)?;
                    enc.encode_field(&e.clock_out)?;
                    enc.encode_field(&e.worked_within(&window, now))
                })
            }
            Command::SelectSchedule {
                start,
                end,
                staff_id,
            } => {
                self.require(engine, Role::Staff).await?;
                let shifts = engine.schedule(start, end, staff_id).map_err(engine_err)?;
                rows(schedule_schema(), shifts, |enc, s| {
                    enc.encode_field(&s.id.to_string())?;
                    enc.encode_field(&s.staff_id.to_string())?;
                    enc.encode_field(&s.span.start)?;
                    enc.encode_field(&s.span.end)
                })
            }
            Command::Listen { channel } => {
                if !notify::is_valid_channel(&channel) {
                    return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                        "ERROR".into(),
                        "42000".into(),
                        format!("invalid channel: {channel}"),
                    ))));
                }
                if channel == notify::STAFF_CHANNEL {
                    self.require(engine, Role::Staff).await?;
                }
                let mut conn = self.conn.lock().await;
                if !conn.listeners.contains_key(&channel) {
                    let rx = engine.notify.subscribe(&channel);
                    conn.listeners.insert(channel, rx);
                }
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
            Command::Unlisten { channel } => {
                self.conn.lock().await.listeners.remove(&channel);
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
            Command::UnlistenAll => {
                self.conn.lock().await.listeners.clear();
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
        }
    }
}

fn drain_listeners(
    listeners: &mut HashMap<String, broadcast::Receiver<Notification>>,
) -> Vec<Notification> {
    use broadcast::error::TryRecvError;
    let mut out = Vec::new();
    for (channel, rx) in listeners.iter_mut() {
        loop {
            match rx.try_recv() {
                Ok(n) => out.push(n),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("listener on {channel} lagged, dropped {skipped} notifications");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
    }
    out
}

fn inserted(n: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(n))
}

fn deleted(n: usize) -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(n))
}

/// Encode `items` as a result set over `schema`.
fn rows<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(
        schema,
        stream::iter(rows),
    )))
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn inventory_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("number", Type::VARCHAR),
        field("tier", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("status_changed_at", Type::INT8),
        field("visit_id", Type::VARCHAR),
        field("customer_id", Type::VARCHAR),
        field("ends_at", Type::INT8),
        field("hold_id", Type::VARCHAR),
        field("hold_expires_at", Type::INT8),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("tier", Type::VARCHAR),
        field("total", Type::INT8),
        field("assignable", Type::INT8),
        field("occupied", Type::INT8),
        field("held", Type::INT8),
        field("dirty", Type::INT8),
        field("cleaning", Type::INT8),
        field("waiting", Type::INT8),
    ]
}

fn visits_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("customer_id", Type::VARCHAR),
        field("resource_id", Type::VARCHAR),
        field("number", Type::VARCHAR),
        field("tier", Type::VARCHAR),
        field("started_at", Type::INT8),
        field("ends_at", Type::INT8),
        field("renewals", Type::INT8),
        field("overdue", Type::BOOL),
    ]
}

fn waitlist_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("visit_id", Type::VARCHAR),
        field("customer_id", Type::VARCHAR),
        field("tier", Type::VARCHAR),
        field("created_at", Type::INT8),
        field("status", Type::VARCHAR),
        field("offered_resource_id", Type::VARCHAR),
        field("offer_expires_at", Type::INT8),
    ]
}

fn line_items_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("visit_id", Type::VARCHAR),
        field("kind", Type::VARCHAR),
        field("description", Type::VARCHAR),
        field("amount", Type::INT8),
        field("created_at", Type::INT8),
    ]
}

fn checkout_quote_schema() -> Vec<FieldInfo> {
    vec![
        field("visit_id", Type::VARCHAR),
        field("ends_at", Type::INT8),
        field("late_ms", Type::INT8),
        field("late_fee", Type::INT8),
        field("balance", Type::INT8),
    ]
}

fn lane_sessions_schema() -> Vec<FieldInfo> {
    vec![
        field("lane", Type::VARCHAR),
        field("customer_id", Type::VARCHAR),
        field("tier", Type::VARCHAR),
        field("resource_id", Type::VARCHAR),
        field("hold_id", Type::VARCHAR),
        field("started_at", Type::INT8),
        field("expires_at", Type::INT8),
    ]
}

fn staff_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("role", Type::VARCHAR),
        field("active", Type::BOOL),
        field("clocked_in", Type::BOOL),
    ]
}

fn timeclock_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("staff_id", Type::VARCHAR),
        field("clock_in", Type::INT8),
        field("clock_out", Type::INT8),
        field("worked_ms", Type::INT8),
    ]
}

fn schedule_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("staff_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
    ]
}

/// Result columns of a SELECT, looked up by the table after FROM.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_ascii_lowercase();
    let mut tokens = lower.split_whitespace();
    if tokens.next() != Some("select") {
        return vec![];
    }
    let table = tokens
        .skip_while(|t| *t != "from")
        .nth(1)
        .map(|t| t.trim_matches(|c| c == '"' || c == ';'));
    match table {
        Some("inventory") => inventory_schema(),
        Some("availability") => availability_schema(),
        Some("visits") => visits_schema(),
        Some("waitlist") => waitlist_schema(),
        Some("line_items") => line_items_schema(),
        Some("checkout_quote") => checkout_quote_schema(),
        Some("lane_sessions") => lane_sessions_schema(),
        Some("staff") => staff_schema(),
        Some("timeclock") => timeclock_schema(),
        Some("schedule") => schedule_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for ClubHandler {
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
pub struct ClubQueryParser;

#[async_trait]
impl QueryParser for ClubQueryParser {
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
impl ExtendedQueryHandler for ClubHandler {
    type Statement = String;
    type QueryParser = ClubQueryParser;

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
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    // Highest index first so $1 never eats the prefix of $10.
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

/// Handlers for one connection; built fresh per socket so that
/// subscriptions and the staff session stay private to it.
pub struct ClubFactory {
    handler: Arc<ClubHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<DeviceAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl ClubFactory {
    pub fn new(sites: Arc<SiteManager>, password: String) -> Self {
        let auth_source = DeviceAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ClubHandler::new(sites)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ClubFactory {
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
    sites: Arc<SiteManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = ClubFactory::new(sites, password);
    process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_params_finds_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM inventory"), 0);
        assert_eq!(
            count_params("INSERT INTO visits (id, lane) VALUES ($1, $2)"),
            2
        );
        assert_eq!(count_params("SELECT $3, $1, $12"), 12);
    }

    #[test]
    fn result_schema_follows_table() {
        assert_eq!(result_schema("SELECT * FROM inventory").len(), 10);
        assert_eq!(
            result_schema("select * from visits where overdue = true").len(),
            9
        );
        assert_eq!(
            result_schema(r#"SELECT * FROM "schedule" WHERE start >= $1"#).len(),
            4
        );
        assert!(result_schema("INSERT INTO renewals (visit_id) VALUES ($1)").is_empty());
        assert!(result_schema("SELECT * FROM nowhere").is_empty());
    }

    #[tokio::test]
    async fn drain_collects_across_channels() {
        let hub = notify::NotifyHub::new();
        let mut listeners = HashMap::new();
        listeners.insert("inventory".to_string(), hub.subscribe("inventory"));
        listeners.insert("staff".to_string(), hub.subscribe("staff"));

        hub.publish("inventory", Arc::from("{\"a\":1}"));
        hub.publish("staff", Arc::from("{\"b\":2}"));
        hub.publish("waitlist", Arc::from("{}"));

        let mut got: Vec<String> = drain_listeners(&mut listeners)
            .into_iter()
            .map(|n| n.channel.to_string())
            .collect();
        got.sort();
        assert_eq!(got, vec!["inventory", "staff"]);
        assert!(drain_listeners(&mut listeners).is_empty());
    }
}
