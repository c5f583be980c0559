//! Database operations shared by every connector.
//!
//! [`DataOps`] only asks implementors for their engine handle. All
//! operations are provided methods, so the direct and the tunneled connector
//! expose exactly the same surface and anything added here reaches both.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::postgres::PgConnection;
use sqlx::query_builder::Separated;
use sqlx::{Executor, PgPool, Postgres, QueryBuilder, Statement};
use tracing::{debug, info};

use crate::db::error::{Error, Result};
use crate::db::frame::{DataFrame, SqlType, Value};

/// PostgreSQL accepts at most this many bind parameters per statement.
pub(crate) const BIND_LIMIT: usize = 65535;

/// What `push_data` does when the target table already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IfExists {
    #[default]
    Fail,
    Replace,
    Append,
}

impl FromStr for IfExists {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fail" => Ok(IfExists::Fail),
            "replace" => Ok(IfExists::Replace),
            "append" => Ok(IfExists::Append),
            other => Err(format!(
                "unknown if-exists mode {:?}, expected fail, replace or append",
                other
            )),
        }
    }
}

impl fmt::Display for IfExists {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IfExists::Fail => "fail",
            IfExists::Replace => "replace",
            IfExists::Append => "append",
        };
        f.write_str(s)
    }
}

#[async_trait]
pub trait DataOps: Send + Sync {
    /// Engine handle every operation runs against.
    fn pool(&self) -> &PgPool;

    /// Run a read query and collect every row.
    ///
    /// Rows are fetched in text format, so types without a dedicated
    /// [`Value`] still come back as their PostgreSQL text rendering. An empty
    /// result keeps the column names and types of the statement.
    async fn get_data(&self, query: &str) -> Result<DataFrame> {
        let rows = sqlx::raw_sql(query).fetch_all(self.pool()).await?;
        debug!("Query returned {} row(s)", rows.len());
        if !rows.is_empty() {
            return Ok(DataFrame::from_pg_rows(&rows));
        }

        match self.pool().prepare(query).await {
            Ok(statement) => Ok(DataFrame::from_pg_columns(statement.columns())),
            Err(e) => {
                // Scripts of several statements cannot be prepared
                debug!("Cannot describe empty result: {}", e);
                Ok(DataFrame::default())
            }
        }
    }

    /// Write `frame` into `table`, creating it from the frame's column types
    /// when needed. Runs in one transaction; returns the rows inserted.
    async fn push_data(&self, table: &str, frame: &DataFrame, if_exists: IfExists) -> Result<u64> {
        let table_sql = quote_table(table)?;
        if frame.width() == 0 {
            return Err(Error::Write(format!("cannot push a frame without columns into {}", table)));
        }
        if let Some(bad) = frame.rows().iter().position(|row| row.len() != frame.width()) {
            return Err(Error::Write(format!(
                "row {} has {} values but the frame has {} columns",
                bad,
                frame.rows()[bad].len(),
                frame.width()
            )));
        }

        let types = frame.column_types();
        let mut tx = self.pool().begin().await?;

        let exists = table_exists(&mut tx, &table_sql).await?;
        let bindings: Vec<Binding> = match (exists, if_exists) {
            (true, IfExists::Append) => existing_column_types(&mut tx, &table_sql, frame)
                .await?
                .into_iter()
                .map(Binding::Cast)
                .collect(),
            _ => types.iter().copied().map(Binding::Typed).collect(),
        };
        match (exists, if_exists) {
            (true, IfExists::Fail) => {
                return Err(Error::Write(format!("table {} already exists", table)));
            }
            (true, IfExists::Replace) => {
                sqlx::query(&format!("DROP TABLE {}", table_sql))
                    .execute(&mut *tx)
                    .await?;
                create_table(&mut tx, &table_sql, frame, &types).await?;
            }
            (true, IfExists::Append) => {}
            (false, _) => create_table(&mut tx, &table_sql, frame, &types).await?,
        }

        let columns_sql = frame
            .column_names()
            .iter()
            .map(|name| quote_ident(name))
            .collect::<Vec<_>>()
            .join(", ");
        let chunk_rows = (BIND_LIMIT / frame.width()).max(1);

        let mut inserted = 0;
        for chunk in frame.rows().chunks(chunk_rows) {
            let mut builder =
                QueryBuilder::<Postgres>::new(format!("INSERT INTO {} ({}) ", table_sql, columns_sql));
            builder.push_values(chunk, |mut b, row| {
                for (value, binding) in row.iter().zip(&bindings) {
                    bind_value(&mut b, value, binding);
                }
            });
            inserted += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        info!("Pushed {} row(s) into {} ({})", inserted, table, if_exists);
        Ok(inserted)
    }

    /// Drop `table` if it exists. Accepts `schema.table`.
    async fn drop_table(&self, table: &str) -> Result<()> {
        let table_sql = quote_table(table)?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", table_sql))
            .execute(self.pool())
            .await?;
        info!("Dropped table {}", table);
        Ok(())
    }

    /// Run a script of one or more statements. Returns the rows affected.
    async fn execute_script(&self, script: &str) -> Result<u64> {
        let result = sqlx::raw_sql(script).execute(self.pool()).await?;
        debug!("Script affected {} row(s)", result.rows_affected());
        Ok(result.rows_affected())
    }
}

async fn table_exists(conn: &mut PgConnection, table_sql: &str) -> Result<bool> {
    let exists = sqlx::query_scalar::<_, bool>("SELECT to_regclass($1) IS NOT NULL")
        .bind(table_sql)
        .fetch_one(conn)
        .await?;
    Ok(exists)
}

/// Declared type of every frame column in an existing table, as
/// `format_type` renders it.
async fn existing_column_types(
    conn: &mut PgConnection,
    table_sql: &str,
    frame: &DataFrame,
) -> Result<Vec<String>> {
    let declared: Vec<(String, String)> = sqlx::query_as(
        "SELECT a.attname::text, format_type(a.atttypid, a.atttypmod) \
         FROM pg_attribute a \
         WHERE a.attrelid = to_regclass($1) AND a.attnum > 0 AND NOT a.attisdropped",
    )
    .bind(table_sql)
    .fetch_all(conn)
    .await?;

    frame
        .column_names()
        .into_iter()
        .map(|name| {
            declared
                .iter()
                .find(|(column, _)| column == name)
                .map(|(_, ty)| ty.clone())
                .ok_or_else(|| {
                    Error::Write(format!("table {} has no column {:?}", table_sql, name))
                })
        })
        .collect()
}

async fn create_table(
    conn: &mut PgConnection,
    table_sql: &str,
    frame: &DataFrame,
    types: &[SqlType],
) -> Result<()> {
    let sql = create_table_sql(table_sql, frame, types);
    debug!("{}", sql);
    sqlx::query(&sql).execute(conn).await?;
    Ok(())
}

fn create_table_sql(table_sql: &str, frame: &DataFrame, types: &[SqlType]) -> String {
    let columns = frame
        .column_names()
        .iter()
        .zip(types)
        .map(|(name, ty)| format!("{} {}", quote_ident(name), ty.as_sql()))
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE {} ({})", table_sql, columns)
}

/// How one column's values are sent.
#[derive(Debug, Clone, PartialEq)]
enum Binding {
    /// Native parameter type for a table created from the frame.
    Typed(SqlType),
    /// Text parameter cast to the declared type of an existing column.
    Cast(String),
}

fn bind_value(b: &mut Separated<'_, '_, Postgres, &'static str>, value: &Value, binding: &Binding) {
    match binding {
        Binding::Typed(SqlType::Boolean) => b.push_bind(value.as_bool()),
        Binding::Typed(SqlType::BigInt) => b.push_bind(value.as_i64()),
        Binding::Typed(SqlType::Double) => b.push_bind(value.as_f64()),
        Binding::Typed(SqlType::Timestamp) => b.push_bind(value.as_timestamp()),
        Binding::Typed(SqlType::Text) => b.push_bind(value.as_text()),
        Binding::Cast(ty) => {
            b.push_bind(value.as_text());
            b.push_unseparated(format!("::{}", ty))
        }
    };
}

/// Double-quote an identifier, escaping embedded quotes.
pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote `table` or `schema.table`.
pub(crate) fn quote_table(table: &str) -> Result<String> {
    let parts: Vec<&str> = table.split('.').map(str::trim).collect();
    if parts.len() > 2 || parts.iter().any(|p| p.is_empty()) {
        return Err(Error::Write(format!("invalid table name {:?}", table)));
    }
    Ok(parts
        .iter()
        .map(|p| quote_ident(p))
        .collect::<Vec<_>>()
        .join("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_quote_table_with_schema() {
        assert_eq!(quote_table("public.users").unwrap(), "\"public\".\"users\"");
        assert_eq!(quote_table("users").unwrap(), "\"users\"");
    }

    #[test]
    fn test_quote_table_rejects_bad_names() {
        assert!(quote_table("").is_err());
        assert!(quote_table("a..b").is_err());
        assert!(quote_table("a.b.c").is_err());
    }

    #[test]
    fn test_create_table_sql() {
        let mut frame = DataFrame::with_columns(["id", "name"]);
        frame
            .push_row(vec![Value::Int(1), Value::Text("ada".to_string())])
            .unwrap();
        let sql = create_table_sql("\"people\"", &frame, &frame.column_types());
        assert_eq!(
            sql,
            "CREATE TABLE \"people\" (\"id\" BIGINT, \"name\" TEXT)"
        );
    }

    fn offline_connector() -> crate::db::DatabaseConnector {
        crate::db::DatabaseConnector::from_settings(crate::db::DbSettings {
            host: "127.0.0.1".to_string(),
            port: 1,
            database: "none".to_string(),
            user: "none".to_string(),
            password: "none".to_string(),
        })
    }

    #[tokio::test]
    async fn test_push_rejects_bad_table_name_before_connecting() {
        let mut frame = DataFrame::with_columns(["id"]);
        frame.push_row(vec![Value::Int(1)]).unwrap();
        let err = offline_connector()
            .push_data("a.b.c", &frame, IfExists::Append)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Write(_)));
    }

    #[tokio::test]
    async fn test_push_rejects_frame_without_columns() {
        let err = offline_connector()
            .push_data("people", &DataFrame::default(), IfExists::Fail)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Write(_)));
    }

    #[tokio::test]
    async fn test_drop_rejects_bad_table_name() {
        let err = offline_connector().drop_table("").await.unwrap_err();
        assert!(matches!(err, Error::Write(_)));
    }

    #[test]
    fn test_cast_binding_appends_declared_type() {
        let mut builder = QueryBuilder::<Postgres>::new("INSERT INTO t (id, n) ");
        let bindings = vec![
            Binding::Typed(SqlType::BigInt),
            Binding::Cast("bigint".to_string()),
        ];
        let rows = vec![vec![Value::Int(1), Value::Null]];
        builder.push_values(&rows, |mut b, row| {
            for (value, binding) in row.iter().zip(&bindings) {
                bind_value(&mut b, value, binding);
            }
        });
        assert_eq!(builder.sql(), "INSERT INTO t (id, n) VALUES ($1, $2::bigint)");
    }

    #[test]
    fn test_if_exists_parsing() {
        assert_eq!("fail".parse::<IfExists>().unwrap(), IfExists::Fail);
        assert_eq!("REPLACE".parse::<IfExists>().unwrap(), IfExists::Replace);
        assert_eq!("append".parse::<IfExists>().unwrap(), IfExists::Append);
        assert!("upsert".parse::<IfExists>().is_err());
        assert_eq!(IfExists::default(), IfExists::Fail);
    }
}
