// Tunnel Bridge - Database Client
// MySQL commands issued through the rendezvous port, one connection per command

use std::fmt;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use mysql_async::consts::ColumnType;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, OptsBuilder, Value};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use tunnel_bridge_common::{DatabaseTarget, QueryError, Row};

/// Maximum number of rows returned by any query
pub const ROW_LIMIT: usize = 100;

/// Credentials plus the local address the forwarded database is reachable on
#[derive(Clone)]
pub struct DatabaseLink {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Zeroizing<String>,
    pub database: Option<String>,
}

impl DatabaseLink {
    /// Point `target`'s credentials at the local rendezvous port
    pub fn through_rendezvous(target: &DatabaseTarget, rendezvous_port: u16) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: rendezvous_port,
            user: target.user.clone(),
            password: target.password.clone(),
            database: target.database.clone(),
        }
    }
}

impl fmt::Debug for DatabaseLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseLink")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("database", &self.database)
            .finish()
    }
}

#[async_trait]
pub trait Database: Send + Sync {
    async fn list_tables(&self, link: &DatabaseLink) -> Result<Vec<String>, QueryError>;

    /// Run `sql`, returning at most `ROW_LIMIT` rows
    async fn query(&self, link: &DatabaseLink, sql: &str) -> Result<Vec<Row>, QueryError>;

    async fn table_contents(&self, link: &DatabaseLink, table: &str) -> Result<Vec<Row>, QueryError> {
        let sql = table_contents_sql(table)?;
        self.query(link, &sql).await
    }
}

/// `SELECT * FROM \`table\` LIMIT 100` with the identifier escaped
pub fn table_contents_sql(table: &str) -> Result<String, QueryError> {
    if table.trim().is_empty() || table.contains('\0') {
        return Err(QueryError::InvalidIdentifier(table.to_string()));
    }
    Ok(format!(
        "SELECT * FROM `{}` LIMIT {}",
        table.replace('`', "``"),
        ROW_LIMIT
    ))
}

/// mysql_async-backed client
#[derive(Debug, Default)]
pub struct MySqlDatabase;

impl MySqlDatabase {
    pub fn new() -> Self {
        Self
    }

    async fn open(link: &DatabaseLink) -> Result<Conn, QueryError> {
        let opts = OptsBuilder::default()
            .ip_or_hostname(link.host.clone())
            .tcp_port(link.port)
            .user(Some(link.user.clone()))
            .pass(Some(link.password.as_str().to_string()))
            .db_name(link.database.clone())
            .prefer_socket(false);

        debug!("Opening database connection via {}:{}", link.host, link.port);
        Conn::new(opts).await.map_err(|e| {
            QueryError::ExecutionFailed(format!("Failed to connect to database: {}", e))
        })
    }

    /// Run `sql` on a fresh connection; the connection is closed on every path
    async fn run(link: &DatabaseLink, sql: &str, limit: Option<usize>) -> Result<Vec<Row>, QueryError> {
        let mut conn = Self::open(link).await?;
        let result = fetch(&mut conn, sql, limit).await;

        if let Err(e) = conn.disconnect().await {
            warn!("Failed to close database connection: {}", e);
        }
        result
    }
}

/// Rows kept from a result set, with an optional cap
#[derive(Debug)]
struct RowCollector {
    rows: Vec<Row>,
    limit: Option<usize>,
    dropped: usize,
}

impl RowCollector {
    fn new(limit: Option<usize>) -> Self {
        Self {
            rows: Vec::new(),
            limit,
            dropped: 0,
        }
    }

    fn push(&mut self, row: Row) {
        match self.limit {
            Some(limit) if self.rows.len() >= limit => self.dropped += 1,
            _ => self.rows.push(row),
        }
    }

    fn finish(self) -> Vec<Row> {
        if let (Some(limit), true) = (self.limit, self.dropped > 0) {
            debug!("Discarded {} rows beyond the {} row limit", self.dropped, limit);
        }
        self.rows
    }
}

async fn fetch(conn: &mut Conn, sql: &str, limit: Option<usize>) -> Result<Vec<Row>, QueryError> {
    let failed = |e: mysql_async::Error| QueryError::ExecutionFailed(e.to_string());

    let mut result = conn.query_iter(sql).await.map_err(failed)?;
    let mut collector = RowCollector::new(limit);

    // Rows past the cap are still read so the connection stays usable
    while let Some(row) = result.next().await.map_err(failed)? {
        collector.push(convert_row(&row));
    }
    result.drop_result().await.map_err(failed)?;

    Ok(collector.finish())
}

/// Table listings are never truncated
const TABLE_LIST_LIMIT: Option<usize> = None;
const QUERY_LIMIT: Option<usize> = Some(ROW_LIMIT);

#[async_trait]
impl Database for MySqlDatabase {
    async fn list_tables(&self, link: &DatabaseLink) -> Result<Vec<String>, QueryError> {
        let rows = Self::run(link, "SHOW TABLES", TABLE_LIST_LIMIT).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| match row.into_iter().next() {
                Some((_, JsonValue::String(name))) => Some(name),
                Some((_, other)) => Some(other.to_string()),
                None => None,
            })
            .collect())
    }

    async fn query(&self, link: &DatabaseLink, sql: &str) -> Result<Vec<Row>, QueryError> {
        Self::run(link, sql, QUERY_LIMIT).await
    }
}

fn convert_row(row: &mysql_async::Row) -> Row {
    let mut out = Row::new();
    for (idx, column) in row.columns_ref().iter().enumerate() {
        let value = row
            .as_ref(idx)
            .map(|v| convert_value(v, column.column_type()))
            .unwrap_or(JsonValue::Null);
        out.insert(column.name_str().into_owned(), value);
    }
    out
}

/// Map a MySQL value to JSON; text-protocol numbers arrive as bytes and are parsed by column type
pub fn convert_value(value: &Value, column_type: ColumnType) -> JsonValue {
    match value {
        Value::NULL => JsonValue::Null,
        Value::Int(i) => JsonValue::from(*i),
        Value::UInt(u) => JsonValue::from(*u),
        Value::Float(f) => JsonValue::from(f64::from(*f)),
        Value::Double(d) => JsonValue::from(*d),
        Value::Bytes(bytes) => convert_bytes(bytes, column_type),
        Value::Date(year, month, day, hour, minute, second, micros) => {
            let mut text = format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                year, month, day, hour, minute, second
            );
            if *micros > 0 {
                text.push_str(&format!(".{:06}", micros));
            }
            JsonValue::String(text)
        }
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let total_hours = u64::from(*days) * 24 + u64::from(*hours);
            let mut text = format!(
                "{}{:02}:{:02}:{:02}",
                if *negative { "-" } else { "" },
                total_hours,
                minutes,
                seconds
            );
            if *micros > 0 {
                text.push_str(&format!(".{:06}", micros));
            }
            JsonValue::String(text)
        }
    }
}

fn convert_bytes(bytes: &[u8], column_type: ColumnType) -> JsonValue {
    let text = match std::str::from_utf8(bytes) {
        Ok(text) => text,
        Err(_) => return JsonValue::String(STANDARD.encode(bytes)),
    };

    let number = match column_type {
        ColumnType::MYSQL_TYPE_TINY
        | ColumnType::MYSQL_TYPE_SHORT
        | ColumnType::MYSQL_TYPE_LONG
        | ColumnType::MYSQL_TYPE_INT24
        | ColumnType::MYSQL_TYPE_LONGLONG
        | ColumnType::MYSQL_TYPE_YEAR => text
            .parse::<i64>()
            .map(JsonValue::from)
            .or_else(|_| text.parse::<u64>().map(JsonValue::from))
            .ok(),
        ColumnType::MYSQL_TYPE_FLOAT | ColumnType::MYSQL_TYPE_DOUBLE => text
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(JsonValue::Number),
        _ => None,
    };

    number.unwrap_or_else(|| JsonValue::String(text.to_string()))
}
