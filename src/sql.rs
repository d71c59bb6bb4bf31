use chrono::{NaiveDate, NaiveTime, TimeDelta, Weekday};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertShop {
        id: Ulid,
        name: Option<String>,
        hours: WorkingHours,
    },
    UpdateShopHours {
        id: Ulid,
        hours: WorkingHours,
    },
    InsertClient {
        shop_id: Ulid,
        client: ClientSummary,
    },
    InsertAppointment {
        draft: NewAppointment,
    },
    UpdateAppointment {
        id: Ulid,
        patch: AppointmentPatch,
    },
    /// `DELETE` on appointments is a soft cancel.
    CancelAppointment {
        id: Ulid,
    },
    SelectAppointment {
        id: Ulid,
    },
    SelectAppointments {
        shop_id: Ulid,
        range: DateRange,
        include_cancelled: bool,
    },
    SelectCounts {
        shop_id: Ulid,
        range: DateRange,
    },
    SelectAvailability {
        shop_id: Ulid,
        date: NaiveDate,
        min_duration: Option<TimeDelta>,
    },
    SelectShops,
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

const APPOINTMENT_COLUMNS: &[&str] = &[
    "shop_id",
    "client_id",
    "order_id",
    "title",
    "date",
    "start_time",
    "end_time",
    "type",
    "notes",
];
const SHOP_COLUMNS: &[&str] = &["id", "name", "opens_at", "closes_at", "closed_days"];
const CLIENT_COLUMNS: &[&str] = &["id", "shop_id", "name", "phone", "email"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let upper = trimmed.to_uppercase();
    if upper == "UNLISTEN *" {
        return Ok(Command::UnlistenAll);
    }
    if upper.starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().to_string();
        return Ok(Command::Listen { channel });
    }
    if upper.starts_with("UNLISTEN ") {
        let channel = trimmed[9..].trim().to_string();
        return Ok(Command::Unlisten { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "shops" => {
            let row = insert_row(insert, SHOP_COLUMNS)?;
            Ok(Command::InsertShop {
                id: parse_ulid_expr(row.require("id")?)?,
                name: row.get("name").map(parse_opt_string).transpose()?.flatten(),
                hours: parse_hours(&row)?,
            })
        }
        "clients" => {
            let row = insert_row(insert, CLIENT_COLUMNS)?;
            Ok(Command::InsertClient {
                shop_id: parse_ulid_expr(row.require("shop_id")?)?,
                client: ClientSummary {
                    id: parse_ulid_expr(row.require("id")?)?,
                    name: parse_string_expr(row.require("name")?)?,
                    phone: row.get("phone").map(parse_opt_string).transpose()?.flatten(),
                    email: row.get("email").map(parse_opt_string).transpose()?.flatten(),
                },
            })
        }
        "appointments" => {
            let row = insert_row(insert, APPOINTMENT_COLUMNS)?;
            let kind = match row.get("type") {
                Some(expr) => parse_enum(expr)?,
                None => AppointmentType::Other,
            };
            Ok(Command::InsertAppointment {
                draft: NewAppointment {
                    shop_id: parse_ulid_expr(row.require("shop_id")?)?,
                    client_id: row.get("client_id").map(parse_opt_ulid).transpose()?.flatten(),
                    order_id: row.get("order_id").map(parse_opt_ulid).transpose()?.flatten(),
                    title: parse_string_expr(row.require("title")?)?,
                    date: parse_date_expr(row.require("date")?)?,
                    start_time: parse_time_expr(row.require("start_time")?)?,
                    end_time: parse_time_expr(row.require("end_time")?)?,
                    kind,
                    notes: row.get("notes").map(parse_opt_string).transpose()?.flatten(),
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;
    let mut set = Row::default();
    for assignment in assignments {
        let AssignmentTarget::ColumnName(name) = &assignment.target else {
            return Err(SqlError::Unsupported("tuple assignment".into()));
        };
        let column = object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?;
        set.0.push((column, assignment.value.clone()));
    }

    match table.as_str() {
        "shops" => Ok(Command::UpdateShopHours {
            id,
            hours: parse_hours(&set)?,
        }),
        "appointments" => {
            let mut patch = AppointmentPatch::default();
            for (column, expr) in &set.0 {
                match column.as_str() {
                    "title" => patch.title = Some(parse_string_expr(expr)?),
                    "date" => patch.date = Some(parse_date_expr(expr)?),
                    "start_time" => patch.start_time = Some(parse_time_expr(expr)?),
                    "end_time" => patch.end_time = Some(parse_time_expr(expr)?),
                    "type" => patch.kind = Some(parse_enum(expr)?),
                    "status" => patch.status = Some(parse_enum(expr)?),
                    "notes" => patch.notes = Some(parse_opt_string(expr)?),
                    "client_id" => patch.client_id = Some(parse_opt_ulid(expr)?),
                    "order_id" => patch.order_id = Some(parse_opt_ulid(expr)?),
                    "reminder_sent" => patch.reminder_sent = Some(parse_bool(expr)?),
                    other => {
                        return Err(SqlError::UnknownColumn {
                            table: "appointments",
                            column: other.to_string(),
                        });
                    }
                }
            }
            Ok(Command::UpdateAppointment { id, patch })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "appointments" => Ok(Command::CancelAppointment { id }),
        _ => Err(SqlError::UnknownTable(table)),
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

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "shops" => Ok(Command::SelectShops),
        "appointments" => {
            if let Some(id) = filters.eq("id") {
                return Ok(Command::SelectAppointment { id: parse_ulid_expr(id)? });
            }
            Ok(Command::SelectAppointments {
                shop_id: filters.shop_id()?,
                range: filters.date_range()?,
                include_cancelled: filters.eq("include_cancelled").map(parse_bool).transpose()?.unwrap_or(false),
            })
        }
        "appointment_counts" => Ok(Command::SelectCounts {
            shop_id: filters.shop_id()?,
            range: filters.date_range()?,
        }),
        "availability" => {
            let date = filters.eq("date").ok_or(SqlError::MissingFilter("date"))?;
            let min_duration = filters.eq("min_duration").map(parse_minutes_expr).transpose()?;
            Ok(Command::SelectAvailability {
                shop_id: filters.shop_id()?,
                date: parse_date_expr(date)?,
                min_duration,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Rows and filters ──────────────────────────────────────────

/// Column/value pairs of one INSERT row or one SET list.
#[derive(Debug, Default)]
struct Row(Vec<(String, Expr)>);

impl Row {
    fn get(&self, column: &str) -> Option<&Expr> {
        self.0.iter().find(|(c, _)| c == column).map(|(_, e)| e)
    }

    fn require(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }
}

/// Pair the first VALUES row with its column list, or with `defaults` when
/// the statement names no columns.
fn insert_row(insert: &ast::Insert, defaults: &[&str]) -> Result<Row, SqlError> {
    let values = extract_insert_values(insert)?;
    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if values.len() > columns.len() {
        return Err(SqlError::Parse(format!(
            "{} values for {} columns",
            values.len(),
            columns.len()
        )));
    }
    Ok(Row(columns.into_iter().zip(values).collect()))
}

#[derive(Debug, Default)]
struct Filters<'a> {
    eq: Vec<(String, &'a Expr)>,
    from: Option<&'a Expr>,
    to: Option<&'a Expr>,
}

impl<'a> Filters<'a> {
    fn eq(&self, column: &str) -> Option<&'a Expr> {
        self.eq.iter().find(|(c, _)| c == column).map(|(_, e)| *e)
    }

    fn shop_id(&self) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.eq("shop_id").ok_or(SqlError::MissingFilter("shop_id"))?)
    }

    /// `date = d`, `date BETWEEN a AND b`, or `date >= a AND date <= b`.
    fn date_range(&self) -> Result<DateRange, SqlError> {
        if let Some(date) = self.eq("date") {
            return Ok(DateRange::single(parse_date_expr(date)?));
        }
        let start = parse_date_expr(self.from.ok_or(SqlError::MissingFilter("date >="))?)?;
        let end = parse_date_expr(self.to.ok_or(SqlError::MissingFilter("date <="))?)?;
        DateRange::try_new(start, end).ok_or_else(|| SqlError::Parse(format!("date range {start}..{end} is inverted")))
    }
}

fn collect_filters<'a>(expr: &'a Expr, filters: &mut Filters<'a>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, filters)?,
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_filters(left, filters)?;
                collect_filters(right, filters)?;
            }
            ast::BinaryOperator::Eq => {
                if let Some(col) = expr_column_name(left) {
                    filters.eq.push((col, right.as_ref()));
                }
            }
            ast::BinaryOperator::GtEq if expr_column_name(left).as_deref() == Some("date") => {
                filters.from = Some(right.as_ref());
            }
            ast::BinaryOperator::LtEq if expr_column_name(left).as_deref() == Some("date") => {
                filters.to = Some(right.as_ref());
            }
            other => return Err(SqlError::Unsupported(format!("operator {other} in WHERE"))),
        },
        Expr::Between {
            expr,
            negated: false,
            low,
            high,
        } if expr_column_name(expr).as_deref() == Some("date") => {
            filters.from = Some(low.as_ref());
            filters.to = Some(high.as_ref());
        }
        other => return Err(SqlError::Unsupported(format!("filter {other}"))),
    }
    Ok(())
}

fn parse_hours(row: &Row) -> Result<WorkingHours, SqlError> {
    let opens = parse_time_expr(row.require("opens_at")?)?;
    let closes = parse_time_expr(row.require("closes_at")?)?;
    if opens >= closes {
        return Err(SqlError::Parse(format!("opens_at {opens} is not before closes_at {closes}")));
    }
    let mut hours = WorkingHours::uniform(opens, closes);
    if let Some(days) = row.get("closed_days").map(parse_opt_string).transpose()?.flatten() {
        for day in days.split(',').map(str::trim).filter(|d| !d.is_empty()) {
            let weekday: Weekday = day
                .parse()
                .map_err(|_| SqlError::Parse(format!("bad weekday: {day}")))?;
            hours = hours.with_day(weekday, None);
        }
    }
    Ok(hours)
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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
        _ => Err(SqlError::MissingFilter("id")),
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

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_opt_string(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_string_expr(expr).map(Some)
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string_expr(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_opt_ulid(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_ulid_expr(expr).map(Some)
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string_expr(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

/// `HH:MM` or `HH:MM:SS`.
fn parse_time_expr(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_string_expr(expr)?;
    NaiveTime::parse_from_str(&s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M"))
        .map_err(|e| SqlError::Parse(format!("bad time {s:?}: {e}")))
}

fn parse_enum<T>(expr: &Expr) -> Result<T, SqlError>
where
    T: std::str::FromStr<Err = String>,
{
    parse_string_expr(expr)?.parse().map_err(SqlError::Parse)
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
        parse_i64_expr(expr)?
            .checked_neg()
            .ok_or_else(|| SqlError::Parse(format!("integer out of range: {expr}")))
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

/// A non-negative whole number of minutes.
fn parse_minutes_expr(expr: &Expr) -> Result<TimeDelta, SqlError> {
    let minutes = parse_i64_expr(expr)?;
    if minutes < 0 {
        return Err(SqlError::Parse(format!("duration must not be negative, got {minutes}")));
    }
    TimeDelta::try_minutes(minutes).ok_or_else(|| SqlError::Parse(format!("duration of {minutes} minutes is out of range")))
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

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column for {table}: {column}")]
    UnknownColumn { table: &'static str, column: String },
    #[error("missing value for column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
