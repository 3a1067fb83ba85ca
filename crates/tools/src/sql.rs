//! SQL toolkit: list tables, describe tables, run queries.
//!
//! The three tools share one [`SqlDatabase`]. Only tables on the configured
//! allowlist are visible to the model; SQL text is forwarded unchanged.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use routeqa_core::error::{StoreError, ToolError};
use routeqa_core::tool::{Tool, query_schema};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use tracing::{debug, info};

#[cfg(feature = "postgres")]
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};

/// Longest cell rendered in schema sample rows.
const SAMPLE_CELL_CHARS: usize = 100;

/// A relational database the SQL tools can talk to.
#[async_trait]
pub trait SqlDatabase: Send + Sync {
    /// SQL dialect name shown to the model (e.g., "sqlite", "postgresql").
    fn dialect(&self) -> &str;

    /// Visible table names, sorted.
    async fn list_tables(&self) -> Result<Vec<String>, StoreError>;

    /// Column listing plus sample rows for each named table.
    async fn table_info(&self, tables: &[String]) -> Result<String, StoreError>;

    /// Execute `sql` and render the outcome as text.
    async fn run(&self, sql: &str) -> Result<String, StoreError>;
}

/// Visibility and rendering limits.
#[derive(Debug, Clone)]
pub struct SqlOptions {
    /// Allowlist matched case-insensitively; empty exposes every table.
    pub include_tables: Vec<String>,
    pub sample_rows: usize,
    pub max_result_rows: usize,
}

impl Default for SqlOptions {
    fn default() -> Self {
        Self {
            include_tables: Vec::new(),
            sample_rows: 3,
            max_result_rows: 50,
        }
    }
}

enum Backend {
    Sqlite(SqlitePool),
    #[cfg(feature = "postgres")]
    Postgres(PgPool),
}

/// A column/row snapshot rendered to strings.
#[derive(Debug, Default)]
struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

struct ColumnInfo {
    name: String,
    data_type: String,
    not_null: bool,
    primary_key: bool,
}

/// [`SqlDatabase`] over an `sqlx` pool.
pub struct SqlxDatabase {
    backend: Backend,
    options: SqlOptions,
}

impl SqlxDatabase {
    /// Connect by URL: `sqlite:` URLs (or `*.db` paths) and, with the
    /// `postgres` feature, `postgres://` URLs.
    pub async fn connect(url: &str, options: SqlOptions) -> Result<Self, StoreError> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            return Self::connect_postgres(url, options).await;
        }

        let in_memory = url.contains(":memory:");
        let connect = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite URL: {e}")))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 4 })
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(connect)
            .await
            .map_err(|e| StoreError::Storage(format!("SQLite connection failed: {e}")))?;
        info!("Connected to SQLite database");
        Ok(Self::from_sqlite_pool(pool, options))
    }

    #[cfg(feature = "postgres")]
    async fn connect_postgres(url: &str, options: SqlOptions) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .map_err(|e| StoreError::Storage(format!("PostgreSQL connection failed: {e}")))?;
        info!("Connected to PostgreSQL database");
        Ok(Self {
            backend: Backend::Postgres(pool),
            options,
        })
    }

    #[cfg(not(feature = "postgres"))]
    async fn connect_postgres(_url: &str, _options: SqlOptions) -> Result<Self, StoreError> {
        Err(StoreError::Storage(
            "PostgreSQL support is not compiled in (enable the `postgres` feature)".into(),
        ))
    }

    pub fn from_sqlite_pool(pool: SqlitePool, options: SqlOptions) -> Self {
        Self {
            backend: Backend::Sqlite(pool),
            options,
        }
    }

    fn is_visible(&self, table: &str) -> bool {
        self.options.include_tables.is_empty()
            || self
                .options
                .include_tables
                .iter()
                .any(|t| t.eq_ignore_ascii_case(table))
    }

    async fn all_tables(&self) -> Result<Vec<String>, StoreError> {
        let names = match &self.backend {
            Backend::Sqlite(pool) => {
                let rows = sqlx::query(
                    "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                )
                .fetch_all(pool)
                .await
                .map_err(query_failed)?;
                rows.iter()
                    .map(|r| r.try_get::<String, _>(0).map_err(query_failed))
                    .collect::<Result<Vec<_>, _>>()?
            }
            #[cfg(feature = "postgres")]
            Backend::Postgres(pool) => {
                let rows = sqlx::query(
                    "SELECT table_name::text FROM information_schema.tables \
                     WHERE table_schema = current_schema() AND table_type = 'BASE TABLE'",
                )
                .fetch_all(pool)
                .await
                .map_err(query_failed)?;
                rows.iter()
                    .map(|r| r.try_get::<String, _>(0).map_err(query_failed))
                    .collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(names)
    }

    async fn columns(&self, table: &str) -> Result<Vec<ColumnInfo>, StoreError> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                let rows = sqlx::query(&format!("PRAGMA table_info({})", quote_ident(table)))
                    .fetch_all(pool)
                    .await
                    .map_err(query_failed)?;
                rows.iter()
                    .map(|r| {
                        Ok(ColumnInfo {
                            name: r.try_get("name").map_err(query_failed)?,
                            data_type: r.try_get("type").map_err(query_failed)?,
                            not_null: r.try_get::<i64, _>("notnull").map_err(query_failed)? != 0,
                            primary_key: r.try_get::<i64, _>("pk").map_err(query_failed)? != 0,
                        })
                    })
                    .collect()
            }
            #[cfg(feature = "postgres")]
            Backend::Postgres(pool) => {
                let rows = sqlx::query(
                    "SELECT c.column_name::text, c.data_type::text, c.is_nullable::text, \
                            (tc.constraint_type IS NOT NULL) AS pk \
                     FROM information_schema.columns c \
                     LEFT JOIN information_schema.key_column_usage k \
                       ON k.table_schema = c.table_schema AND k.table_name = c.table_name \
                      AND k.column_name = c.column_name \
                     LEFT JOIN information_schema.table_constraints tc \
                       ON tc.constraint_name = k.constraint_name AND tc.table_schema = k.table_schema \
                      AND tc.constraint_type = 'PRIMARY KEY' \
                     WHERE c.table_schema = current_schema() AND c.table_name = $1 \
                     ORDER BY c.ordinal_position",
                )
                .bind(table)
                .fetch_all(pool)
                .await
                .map_err(query_failed)?;
                let mut cols: Vec<ColumnInfo> = Vec::new();
                for r in &rows {
                    let name: String = r.try_get(0).map_err(query_failed)?;
                    let primary_key: bool = r.try_get(3).map_err(query_failed)?;
                    // A column in several constraints shows up once per join row.
                    if let Some(existing) = cols.iter_mut().find(|c| c.name == name) {
                        existing.primary_key |= primary_key;
                        continue;
                    }
                    cols.push(ColumnInfo {
                        name,
                        data_type: r.try_get::<String, _>(1).map_err(query_failed)?.to_uppercase(),
                        not_null: r.try_get::<String, _>(2).map_err(query_failed)? == "NO",
                        primary_key,
                    });
                }
                Ok(cols)
            }
        }
    }

    /// Run a row-returning statement.
    async fn fetch(&self, sql: &str) -> Result<Table, StoreError> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                let rows = sqlx::query(sql).fetch_all(pool).await.map_err(query_failed)?;
                Ok(sqlite_table(&rows))
            }
            #[cfg(feature = "postgres")]
            Backend::Postgres(pool) => {
                // The simple query protocol returns every value as text.
                let rows = sqlx::raw_sql(sql).fetch_all(pool).await.map_err(query_failed)?;
                Ok(pg_table(&rows))
            }
        }
    }

    /// Run a statement that returns no rows.
    async fn execute(&self, sql: &str) -> Result<u64, StoreError> {
        let affected = match &self.backend {
            Backend::Sqlite(pool) => sqlx::query(sql)
                .execute(pool)
                .await
                .map_err(query_failed)?
                .rows_affected(),
            #[cfg(feature = "postgres")]
            Backend::Postgres(pool) => sqlx::raw_sql(sql)
                .execute(pool)
                .await
                .map_err(query_failed)?
                .rows_affected(),
        };
        Ok(affected)
    }

    /// Resolve requested names against visible tables, case-insensitively.
    async fn resolve_tables(&self, requested: &[String]) -> Result<Vec<String>, StoreError> {
        let visible = self.list_tables().await?;
        let mut resolved = Vec::new();
        let mut missing = Vec::new();
        for name in requested.iter().map(|n| n.trim()).filter(|n| !n.is_empty()) {
            match visible.iter().find(|t| t.eq_ignore_ascii_case(name)) {
                Some(t) => resolved.push(t.clone()),
                None => missing.push(name.to_string()),
            }
        }
        if !missing.is_empty() {
            return Err(StoreError::QueryFailed(format!(
                "table_names {{{}}} not found in database; available tables: {}",
                missing.join(", "),
                visible.join(", ")
            )));
        }
        if resolved.is_empty() {
            return Err(StoreError::QueryFailed(
                "no table names given; pass a comma-separated list of tables".into(),
            ));
        }
        Ok(resolved)
    }
}

#[async_trait]
impl SqlDatabase for SqlxDatabase {
    fn dialect(&self) -> &str {
        match &self.backend {
            Backend::Sqlite(_) => "sqlite",
            #[cfg(feature = "postgres")]
            Backend::Postgres(_) => "postgresql",
        }
    }

    async fn list_tables(&self) -> Result<Vec<String>, StoreError> {
        let mut tables: Vec<String> = self
            .all_tables()
            .await?
            .into_iter()
            .filter(|t| self.is_visible(t))
            .collect();
        tables.sort();
        Ok(tables)
    }

    async fn table_info(&self, tables: &[String]) -> Result<String, StoreError> {
        let resolved = self.resolve_tables(tables).await?;
        let mut sections = Vec::with_capacity(resolved.len());

        for table in &resolved {
            let columns = self.columns(table).await?;
            let mut ddl = format!("CREATE TABLE {} (\n", quote_ident(table));
            let mut lines: Vec<String> = columns
                .iter()
                .map(|c| {
                    let null = if c.not_null { " NOT NULL" } else { "" };
                    format!("\t{} {}{}", quote_ident(&c.name), c.data_type, null)
                })
                .collect();
            let pk: Vec<String> = columns
                .iter()
                .filter(|c| c.primary_key)
                .map(|c| quote_ident(&c.name))
                .collect();
            if !pk.is_empty() {
                lines.push(format!("\tPRIMARY KEY ({})", pk.join(", ")));
            }
            ddl.push_str(&lines.join(",\n"));
            ddl.push_str("\n)");

            if self.options.sample_rows > 0 {
                let sample = self
                    .fetch(&format!(
                        "SELECT * FROM {} LIMIT {}",
                        quote_ident(table),
                        self.options.sample_rows
                    ))
                    .await?;
                let header = if sample.columns.is_empty() {
                    columns.iter().map(|c| c.name.clone()).collect::<Vec<_>>()
                } else {
                    sample.columns.clone()
                };
                let mut block = format!(
                    "\n\n/*\n{} rows from {} table:\n{}",
                    self.options.sample_rows,
                    table,
                    header.join("\t")
                );
                for row in &sample.rows {
                    let cells: Vec<String> = row.iter().map(|v| clip(v, SAMPLE_CELL_CHARS)).collect();
                    block.push('\n');
                    block.push_str(&cells.join("\t"));
                }
                block.push_str("\n*/");
                ddl.push_str(&block);
            }
            sections.push(ddl);
        }

        Ok(sections.join("\n\n"))
    }

    async fn run(&self, sql: &str) -> Result<String, StoreError> {
        debug!(dialect = self.dialect(), sql, "Running SQL");
        if !returns_rows(sql) {
            let affected = self.execute(sql).await?;
            return Ok(format!("Statement executed. Rows affected: {affected}"));
        }

        let table = self.fetch(sql).await?;
        if table.rows.is_empty() {
            return Ok("Query returned no rows.".into());
        }
        Ok(render_table(&table, self.options.max_result_rows))
    }
}

fn query_failed(e: sqlx::Error) -> StoreError {
    StoreError::QueryFailed(e.to_string())
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn clip(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &value[..idx]),
        None => value.to_string(),
    }
}

/// Whether a statement's leading keyword yields a result set.
fn returns_rows(sql: &str) -> bool {
    let first = sql
        .trim_start()
        .trim_start_matches('(')
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    matches!(
        first.as_str(),
        "SELECT" | "WITH" | "VALUES" | "PRAGMA" | "EXPLAIN" | "SHOW" | "TABLE"
    ) || sql.to_ascii_uppercase().contains(" RETURNING ")
}

/// Pipe-separated header and rows, capped at `max_rows`.
fn render_table(table: &Table, max_rows: usize) -> String {
    let mut out = table.columns.join(" | ");
    for row in table.rows.iter().take(max_rows) {
        out.push('\n');
        out.push_str(&row.join(" | "));
    }
    if table.rows.len() > max_rows {
        out.push_str(&format!(
            "\n... {} more row(s) omitted",
            table.rows.len() - max_rows
        ));
    }
    out
}

fn sqlite_table(rows: &[SqliteRow]) -> Table {
    let Some(first) = rows.first() else {
        return Table::default();
    };
    let columns = first.columns().iter().map(|c| c.name().to_string()).collect();
    let rows = rows
        .iter()
        .map(|row| (0..row.len()).map(|i| sqlite_cell(row, i)).collect())
        .collect();
    Table { columns, rows }
}

fn sqlite_cell(row: &SqliteRow, idx: usize) -> String {
    let kind = match row.try_get_raw(idx) {
        Ok(raw) if raw.is_null() => return "NULL".into(),
        Ok(raw) => raw.type_info().name().to_ascii_uppercase(),
        Err(_) => return String::new(),
    };
    let rendered = match kind.as_str() {
        "INTEGER" | "INT" | "BIGINT" | "BOOLEAN" => row.try_get_unchecked::<i64, _>(idx).map(|v| v.to_string()),
        "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => row.try_get_unchecked::<f64, _>(idx).map(|v| v.to_string()),
        "BLOB" => row
            .try_get_unchecked::<Vec<u8>, _>(idx)
            .map(|v| format!("<{} bytes>", v.len())),
        _ => row.try_get_unchecked::<String, _>(idx),
    };
    rendered.unwrap_or_default()
}

#[cfg(feature = "postgres")]
fn pg_table(rows: &[PgRow]) -> Table {
    let Some(first) = rows.first() else {
        return Table::default();
    };
    let columns = first.columns().iter().map(|c| c.name().to_string()).collect();
    let rows = rows
        .iter()
        .map(|row| {
            (0..row.len())
                .map(|i| {
                    row.try_get_unchecked::<Option<String>, _>(i)
                        .ok()
                        .flatten()
                        .unwrap_or_else(|| "NULL".into())
                })
                .collect()
        })
        .collect();
    Table { columns, rows }
}

fn exec_error(tool_name: &str, e: StoreError) -> ToolError {
    ToolError::ExecutionFailed {
        tool_name: tool_name.into(),
        reason: e.to_string(),
    }
}

/// `sql_db_list_tables`: input ignored.
pub struct ListTablesTool {
    db: Arc<dyn SqlDatabase>,
}

#[async_trait]
impl Tool for ListTablesTool {
    fn name(&self) -> &str {
        "sql_db_list_tables"
    }

    fn description(&self) -> &str {
        "Input is an empty string, output is a comma-separated list of tables in the database."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        query_schema("An empty string")
    }

    async fn invoke(&self, _input: &str) -> Result<String, ToolError> {
        let tables = self
            .db
            .list_tables()
            .await
            .map_err(|e| exec_error(self.name(), e))?;
        Ok(tables.join(", "))
    }
}

/// `sql_db_schema`: comma-separated table names in, DDL and samples out.
pub struct SchemaTool {
    db: Arc<dyn SqlDatabase>,
}

#[async_trait]
impl Tool for SchemaTool {
    fn name(&self) -> &str {
        "sql_db_schema"
    }

    fn description(&self) -> &str {
        "Input to this tool is a comma-separated list of tables, output is the schema and sample \
         rows for those tables. Be sure that the tables actually exist by calling \
         sql_db_list_tables first! Example Input: table1, table2, table3"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        query_schema("A comma-separated list of table names")
    }

    async fn invoke(&self, input: &str) -> Result<String, ToolError> {
        let tables: Vec<String> = input.split(',').map(|t| t.trim().to_string()).collect();
        self.db
            .table_info(&tables)
            .await
            .map_err(|e| exec_error(self.name(), e))
    }
}

/// `sql_db_query`: SQL text in, result table out.
pub struct QueryTool {
    db: Arc<dyn SqlDatabase>,
    description: String,
}

#[async_trait]
impl Tool for QueryTool {
    fn name(&self) -> &str {
        "sql_db_query"
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        query_schema("A detailed and correct SQL query")
    }

    async fn invoke(&self, input: &str) -> Result<String, ToolError> {
        if input.trim().is_empty() {
            return Err(ToolError::InvalidArguments("sql_db_query needs a SQL statement".into()));
        }
        self.db.run(input).await.map_err(|e| exec_error(self.name(), e))
    }
}

/// The three SQL tools over one database.
pub fn sql_tools(db: Arc<dyn SqlDatabase>) -> Vec<Arc<dyn Tool>> {
    let description = format!(
        "Input to this tool is a detailed and correct {} SQL query, output is a result from the \
         database. If the query is not correct, an error message will be returned. If an error \
         is returned, rewrite the query, check the query, and try again. If you encounter an \
         issue with an unknown column, use sql_db_schema to query the correct table fields.",
        db.dialect()
    );
    vec![
        Arc::new(ListTablesTool { db: db.clone() }),
        Arc::new(SchemaTool { db: db.clone() }),
        Arc::new(QueryTool { db, description }),
    ]
}
