use std::collections::HashMap;

use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResource {
        id: Ulid,
        number: String,
        tier: Tier,
    },
    RetireResource {
        id: Ulid,
    },
    ChangeStatus {
        resource_id: Ulid,
        status: CleanStatus,
    },
    OpenLane {
        lane: String,
        customer_id: Ulid,
        tier: Tier,
    },
    CloseLane {
        lane: String,
    },
    CheckIn {
        visit_id: Ulid,
        lane: String,
    },
    Renew {
        visit_id: Ulid,
    },
    CheckOut {
        visit_id: Ulid,
    },
    JoinWaitlist {
        id: Ulid,
        visit_id: Ulid,
        tier: Tier,
    },
    LeaveWaitlist {
        id: Ulid,
    },
    AcceptUpgrade {
        waitlist_id: Ulid,
    },
    InsertLineItem {
        id: Ulid,
        visit_id: Ulid,
        description: String,
        amount: Cents,
    },
    InsertStaff {
        id: Ulid,
        name: String,
        role: Role,
        pin: String,
    },
    DeactivateStaff {
        id: Ulid,
    },
    OpenSession {
        id: Ulid,
        staff_id: Ulid,
        pin: String,
    },
    CloseSession {
        id: Ulid,
    },
    ClockIn {
        id: Ulid,
    },
    ClockOut {
        id: Ulid,
    },
    ScheduleShift {
        id: Ulid,
        staff_id: Ulid,
        start: Ms,
        end: Ms,
    },
    RemoveShift {
        id: Ulid,
    },
    SelectInventory {
        tier: Option<Tier>,
    },
    SelectAvailability,
    SelectVisits {
        overdue_only: bool,
    },
    SelectWaitlist,
    SelectLineItems {
        visit_id: Ulid,
    },
    SelectCheckoutQuote {
        visit_id: Ulid,
    },
    SelectLaneSessions,
    SelectStaff,
    SelectTimeclock {
        staff_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectSchedule {
        start: Ms,
        end: Ms,
        staff_id: Option<Ulid>,
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
    if let Some(cmd) = parse_listen(trimmed) {
        return Ok(cmd);
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// LISTEN / UNLISTEN take a bare channel name; handled before sqlparser.
fn parse_listen(trimmed: &str) -> Option<Command> {
    let (keyword, rest) = trimmed.split_once(char::is_whitespace)?;
    let channel = rest.trim().trim_matches('"').to_string();
    if keyword.eq_ignore_ascii_case("LISTEN") {
        Some(Command::Listen { channel })
    } else if keyword.eq_ignore_ascii_case("UNLISTEN") {
        if channel == "*" {
            Some(Command::UnlistenAll)
        } else {
            Some(Command::Unlisten { channel })
        }
    } else {
        None
    }
}

/// Known INSERT targets with their default column order, used when an
/// INSERT names no columns.
fn insert_table(table: &str) -> Option<(&'static str, &'static [&'static str])> {
    const TABLES: [(&str, &[&str]); 12] = [
        ("resources", &["id", "number", "tier"]),
        ("status_changes", &["resource_id", "status"]),
        ("lane_sessions", &["lane", "customer_id", "tier"]),
        ("visits", &["id", "lane"]),
        ("renewals", &["visit_id"]),
        ("waitlist", &["id", "visit_id", "tier"]),
        ("upgrades", &["waitlist_id"]),
        ("line_items", &["id", "visit_id", "description", "amount"]),
        ("staff", &["id", "name", "role", "pin"]),
        ("staff_sessions", &["id", "staff_id", "pin"]),
        ("timeclock", &["id"]),
        ("schedule", &["id", "staff_id", "start", "end"]),
    ];
    TABLES.into_iter().find(|(name, _)| *name == table)
}

/// One VALUES row keyed by column name.
struct Row<'a> {
    table: &'static str,
    values: HashMap<String, &'a Expr>,
}

impl<'a> Row<'a> {
    fn get(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.values
            .get(col)
            .copied()
            .ok_or(SqlError::MissingColumn(self.table, col))
    }

    fn opt(&self, col: &str) -> Option<&'a Expr> {
        self.values.get(col).copied()
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.get(col)?)
    }

    fn string(&self, col: &'static str) -> Result<String, SqlError> {
        parse_string_expr(self.get(col)?)
    }

    fn i64(&self, col: &'static str) -> Result<i64, SqlError> {
        parse_i64_expr(self.get(col)?)
    }

    fn tier(&self, col: &'static str) -> Result<Tier, SqlError> {
        self.string(col)?.parse().map_err(SqlError::Parse)
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let name = insert_table_name(insert)?;
    let (table, columns) = insert_table(&name).ok_or(SqlError::UnknownTable(name))?;
    let values = extract_insert_values(insert)?;

    let names: Vec<String> = if insert.columns.is_empty() {
        columns.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if names.len() != values.len() {
        return Err(SqlError::WrongArity(table, names.len(), values.len()));
    }
    let row = Row {
        table,
        values: names.into_iter().zip(values.iter()).collect(),
    };

    match table {
        "resources" => Ok(Command::InsertResource {
            id: row.ulid("id")?,
            number: row.string("number")?,
            tier: row.tier("tier")?,
        }),
        "status_changes" => Ok(Command::ChangeStatus {
            resource_id: row.ulid("resource_id")?,
            status: row.string("status")?.parse().map_err(SqlError::Parse)?,
        }),
        "lane_sessions" => Ok(Command::OpenLane {
            lane: row.string("lane")?,
            customer_id: row.ulid("customer_id")?,
            tier: row.tier("tier")?,
        }),
        "visits" => Ok(Command::CheckIn {
            visit_id: row.ulid("id")?,
            lane: row.string("lane")?,
        }),
        "renewals" => Ok(Command::Renew {
            visit_id: row.ulid("visit_id")?,
        }),
        "waitlist" => Ok(Command::JoinWaitlist {
            id: row.ulid("id")?,
            visit_id: row.ulid("visit_id")?,
            tier: row.tier("tier")?,
        }),
        "upgrades" => Ok(Command::AcceptUpgrade {
            waitlist_id: row.ulid("waitlist_id")?,
        }),
        "line_items" => Ok(Command::InsertLineItem {
            id: row.ulid("id")?,
            visit_id: row.ulid("visit_id")?,
            description: row.string("description")?,
            amount: row.i64("amount")?,
        }),
        "staff" => Ok(Command::InsertStaff {
            id: row.ulid("id")?,
            name: row.string("name")?,
            role: match row.opt("role") {
                Some(expr) => parse_string_expr(expr)?.parse().map_err(SqlError::Parse)?,
                None => Role::Staff,
            },
            pin: row.string("pin")?,
        }),
        "staff_sessions" => Ok(Command::OpenSession {
            id: row.ulid("id")?,
            staff_id: row.ulid("staff_id")?,
            pin: row.string("pin")?,
        }),
        "timeclock" => Ok(Command::ClockIn { id: row.ulid("id")? }),
        "schedule" => Ok(Command::ScheduleShift {
            id: row.ulid("id")?,
            staff_id: row.ulid("staff_id")?,
            start: row.i64("start")?,
            end: row.i64("end")?,
        }),
        other => Err(SqlError::UnknownTable(other.to_string())),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(delete.selection.as_ref())?;

    match table.as_str() {
        "resources" => Ok(Command::RetireResource { id: filters.eq_ulid("id")? }),
        "lane_sessions" => Ok(Command::CloseLane {
            lane: filters.eq_string("lane")?,
        }),
        "visits" => Ok(Command::CheckOut {
            visit_id: filters.eq_ulid("id")?,
        }),
        "waitlist" => Ok(Command::LeaveWaitlist { id: filters.eq_ulid("id")? }),
        "staff" => Ok(Command::DeactivateStaff { id: filters.eq_ulid("id")? }),
        "staff_sessions" => Ok(Command::CloseSession { id: filters.eq_ulid("id")? }),
        "timeclock" => Ok(Command::ClockOut { id: filters.eq_ulid("id")? }),
        "schedule" => Ok(Command::RemoveShift { id: filters.eq_ulid("id")? }),
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
    let filters = Filters::from_selection(select.selection.as_ref())?;

    match table.as_str() {
        "inventory" => Ok(Command::SelectInventory {
            tier: match filters.eq.get("tier") {
                Some(expr) => Some(parse_string_expr(expr)?.parse().map_err(SqlError::Parse)?),
                None => None,
            },
        }),
        "availability" => Ok(Command::SelectAvailability),
        "visits" => Ok(Command::SelectVisits {
            overdue_only: match filters.eq.get("overdue") {
                Some(expr) => parse_bool(expr)?,
                None => false,
            },
        }),
        "waitlist" => Ok(Command::SelectWaitlist),
        "line_items" => Ok(Command::SelectLineItems {
            visit_id: filters.eq_ulid("visit_id")?,
        }),
        "checkout_quote" => Ok(Command::SelectCheckoutQuote {
            visit_id: filters.eq_ulid("visit_id")?,
        }),
        "lane_sessions" => Ok(Command::SelectLaneSessions),
        "staff" => Ok(Command::SelectStaff),
        "timeclock" => Ok(Command::SelectTimeclock {
            staff_id: filters.eq_ulid("staff_id")?,
            start: filters.ge_i64("start")?,
            end: filters.le_i64("end")?,
        }),
        "schedule" => Ok(Command::SelectSchedule {
            start: filters.ge_i64("start")?,
            end: filters.le_i64("end")?,
            staff_id: match filters.eq.get("staff_id") {
                Some(expr) => Some(parse_ulid_expr(expr)?),
                None => None,
            },
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Conjunction of `col = v`, `col >= v` and `col <= v` terms.
#[derive(Default)]
struct Filters<'a> {
    eq: HashMap<String, &'a Expr>,
    ge: HashMap<String, &'a Expr>,
    le: HashMap<String, &'a Expr>,
}

impl<'a> Filters<'a> {
    fn from_selection(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut filters = Filters::default();
        if let Some(expr) = selection {
            filters.collect(expr)?;
        }
        Ok(filters)
    }

    fn collect(&mut self, expr: &'a Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.collect(inner),
            Expr::BinaryOp { left, op, right } => {
                if *op == ast::BinaryOperator::And {
                    self.collect(left)?;
                    return self.collect(right);
                }
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
                let target = match op {
                    ast::BinaryOperator::Eq => &mut self.eq,
                    ast::BinaryOperator::GtEq => &mut self.ge,
                    ast::BinaryOperator::LtEq => &mut self.le,
                    _ => return Err(SqlError::Unsupported(format!("operator {op}"))),
                };
                target.insert(col, right.as_ref());
                Ok(())
            }
            _ => Err(SqlError::Unsupported(format!("filter {expr}"))),
        }
    }

    fn eq_ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.eq.get(col).ok_or(SqlError::MissingFilter(col))?)
    }

    fn eq_string(&self, col: &'static str) -> Result<String, SqlError> {
        parse_string_expr(self.eq.get(col).ok_or(SqlError::MissingFilter(col))?)
    }

    fn ge_i64(&self, col: &'static str) -> Result<i64, SqlError> {
        parse_i64_expr(self.ge.get(col).ok_or(SqlError::MissingFilter(col))?)
    }

    fn le_i64(&self, col: &'static str) -> Result<i64, SqlError> {
        parse_i64_expr(self.le.get(col).ok_or(SqlError::MissingFilter(col))?)
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

fn extract_insert_values(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row),
            [] => Err(SqlError::Parse("empty VALUES".into())),
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string_expr(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
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
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
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
            SqlError::MissingColumn(t, col) => write!(f, "{t}: missing column {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
