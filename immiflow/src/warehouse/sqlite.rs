//! SQLite-backed warehouse.
//!
//! The warehouse lives in one directory: `main.db` plus one `{schema}.db`
//! file per schema. Every call opens a fresh connection on a blocking
//! worker, attaches each schema file under its name and closes the
//! connection when the call returns.

use super::{split_qualified, validate_identifier, BulkLoad, SqlValue, Warehouse};
use crate::errors::WarehouseError;
use crate::storage::ObjectStore;
use async_trait::async_trait;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{Connection, ToSql};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const MAIN_FILE: &str = "main.db";
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Null => ToSqlOutput::Owned(Value::Null),
            Self::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            Self::Real(r) => ToSqlOutput::Owned(Value::Real(*r)),
            Self::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

impl From<ValueRef<'_>> for SqlValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Self::Null,
            ValueRef::Integer(i) => Self::Integer(i),
            ValueRef::Real(r) => Self::Real(r),
            ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
                Self::Text(String::from_utf8_lossy(bytes).into_owned())
            }
        }
    }
}

/// Warehouse backed by SQLite files in a directory.
#[derive(Debug, Clone)]
pub struct SqliteWarehouse {
    root: PathBuf,
    store: Arc<dyn ObjectStore>,
}

impl SqliteWarehouse {
    /// Creates a warehouse rooted at `root`, reading bulk-load sources from `store`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            root: root.into(),
            store,
        }
    }

    /// Returns the warehouse directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Runs `f` on a fresh connection on the blocking pool.
    async fn with_connection<T, F>(&self, f: F) -> Result<T, WarehouseError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, WarehouseError> + Send + 'static,
    {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = open_connection(&root)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| WarehouseError::Worker(e.to_string()))?
    }
}

/// Opens `main.db` and attaches every schema file in the directory.
fn open_connection(root: &Path) -> Result<Connection, WarehouseError> {
    std::fs::create_dir_all(root)?;
    let conn = Connection::open(root.join(MAIN_FILE))?;
    // concurrent nodes share the schema files
    conn.busy_timeout(BUSY_TIMEOUT)?;

    conn.create_scalar_function(
        "sqrt",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let value: Option<f64> = ctx.get(0)?;
            Ok(value.map(|x| x.max(0.0).sqrt()))
        },
    )?;

    let mut schemas: Vec<(String, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("db") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if stem == "main" || stem.contains('.') || validate_identifier(stem).is_err() {
            continue;
        }
        schemas.push((stem.to_string(), path.clone()));
    }
    schemas.sort();

    for (schema, path) in schemas {
        attach(&conn, &schema, &path)?;
    }
    Ok(conn)
}

fn attach(conn: &Connection, schema: &str, path: &Path) -> Result<(), WarehouseError> {
    let file = path.to_string_lossy().into_owned();
    conn.execute(&format!("ATTACH DATABASE ?1 AS {schema}"), [file])?;
    Ok(())
}

fn validate_schema(schema: &str) -> Result<(), WarehouseError> {
    validate_identifier(schema)?;
    let reserved = ["main", "temp"]
        .iter()
        .any(|r| schema.eq_ignore_ascii_case(r));
    if schema.contains('.') || reserved {
        return Err(WarehouseError::InvalidIdentifier(schema.to_string()));
    }
    Ok(())
}

/// Returns the declared columns of `schema.table`, in order.
fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>, WarehouseError> {
    let (schema, name) = split_qualified(table);
    let pragma = match schema {
        Some(schema) => format!("PRAGMA {schema}.table_info({name})"),
        None => format!("PRAGMA table_info({name})"),
    };
    let mut stmt = conn.prepare(&pragma)?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

fn attached_schemas(conn: &Connection) -> Result<Vec<String>, WarehouseError> {
    let mut stmt = conn.prepare("PRAGMA database_list")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

#[async_trait]
impl Warehouse for SqliteWarehouse {
    async fn create_schema(&self, schema: &str) -> Result<(), WarehouseError> {
        validate_schema(schema)?;
        let path = self.root.join(format!("{schema}.db"));
        let root = self.root.clone();
        let schema = schema.to_string();

        tokio::task::spawn_blocking(move || -> Result<(), WarehouseError> {
            std::fs::create_dir_all(&root)?;
            // writing the header materializes the file so later connections attach it
            let conn = Connection::open(&path)?;
            conn.pragma_update(None, "user_version", 1)?;
            debug!(schema = %schema, path = %path.display(), "Schema ensured");
            Ok(())
        })
        .await
        .map_err(|e| WarehouseError::Worker(e.to_string()))?
    }

    async fn execute(&self, sql: &str) -> Result<(), WarehouseError> {
        let sql = sql.to_string();
        self.with_connection(move |conn| {
            conn.execute_batch(&sql)?;
            Ok(())
        })
        .await
    }

    async fn execute_with(
        &self,
        sql: &str,
        params: &[(&str, SqlValue)],
    ) -> Result<usize, WarehouseError> {
        let sql = sql.to_string();
        let params: Vec<(String, SqlValue)> = params
            .iter()
            .map(|(name, value)| {
                let name = if name.starts_with(':') {
                    (*name).to_string()
                } else {
                    format!(":{name}")
                };
                (name, value.clone())
            })
            .collect();

        self.with_connection(move |conn| {
            let named: Vec<(&str, &dyn ToSql)> = params
                .iter()
                .map(|(name, value)| (name.as_str(), value as &dyn ToSql))
                .collect();
            Ok(conn.execute(&sql, named.as_slice())?)
        })
        .await
    }

    async fn query(&self, sql: &str) -> Result<Vec<Vec<SqlValue>>, WarehouseError> {
        let sql = sql.to_string();
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let width = stmt.column_count();
            let rows = stmt
                .query_map([], |row| {
                    (0..width)
                        .map(|i| row.get_ref(i).map(SqlValue::from))
                        .collect::<Result<Vec<_>, _>>()
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn truncate(&self, table: &str) -> Result<(), WarehouseError> {
        let table = validate_identifier(table)?.to_string();
        self.with_connection(move |conn| {
            let removed = conn.execute(&format!("DELETE FROM {table}"), [])?;
            debug!(table = %table, removed, "Table truncated");
            Ok(())
        })
        .await
    }

    async fn bulk_load(&self, request: &BulkLoad) -> Result<u64, WarehouseError> {
        let table = validate_identifier(&request.table)?.to_string();
        if let Some(columns) = &request.columns {
            for column in columns {
                validate_identifier(column)?;
            }
        }

        debug!(
            table = %table,
            source = %request.source,
            authorized = !request.token.expose().is_empty(),
            "Bulk load requested"
        );
        let bytes = self.store.get(&request.source).await?;
        let format = request.format;
        let columns = request.columns.clone();

        self.with_connection(move |conn| {
            let columns = match columns {
                Some(columns) => columns,
                None => table_columns(conn, &table)?,
            };
            if columns.is_empty() {
                return Err(WarehouseError::MissingTable(table));
            }

            let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
            let insert = format!(
                "INSERT INTO {table} ({}) VALUES ({})",
                columns.join(", "),
                placeholders.join(", ")
            );

            let mut reader = csv::ReaderBuilder::new()
                .delimiter(format.delimiter)
                .has_headers(format.has_header)
                .flexible(true)
                .from_reader(bytes.as_slice());

            let tx = conn.transaction()?;
            let mut loaded = 0u64;
            {
                let mut stmt = tx.prepare(&insert)?;
                for record in reader.records() {
                    let record = record?;
                    if record.len() != columns.len() {
                        return Err(WarehouseError::ColumnMismatch {
                            table,
                            line: record.position().map_or(0, csv::Position::line),
                            expected: columns.len(),
                            found: record.len(),
                        });
                    }
                    let values = record
                        .iter()
                        .map(|field| (!field.is_empty()).then_some(field));
                    stmt.execute(rusqlite::params_from_iter(values))?;
                    loaded += 1;
                }
            }
            tx.commit()?;
            debug!(table = %table, rows = loaded, "Bulk load committed");
            Ok(loaded)
        })
        .await
    }

    async fn table_exists(&self, table: &str) -> Result<bool, WarehouseError> {
        let table = validate_identifier(table)?.to_string();
        self.with_connection(move |conn| {
            let (schema, name) = split_qualified(&table);
            let schema = schema.unwrap_or("main");
            if !attached_schemas(conn)?.iter().any(|s| s == schema) {
                return Ok(false);
            }
            let count: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {schema}.sqlite_master WHERE type = 'table' AND name = ?1"),
                [name],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::AccessToken;
    use crate::storage::{InMemoryObjectStore, ObjectLocation};
    use crate::warehouse::CsvFormat;
    use pretty_assertions::assert_eq;

    fn warehouse() -> (tempfile::TempDir, SqliteWarehouse, Arc<InMemoryObjectStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryObjectStore::new());
        let wh = SqliteWarehouse::new(dir.path().join("wh"), store.clone());
        (dir, wh, store)
    }

    fn token() -> AccessToken {
        AccessToken::new("t")
    }

    #[tokio::test]
    async fn test_schemas_are_attached_per_connection() {
        let (_dir, wh, _) = warehouse();
        wh.create_schema("immigration").await.unwrap();
        wh.create_schema("immigration").await.unwrap();
        wh.execute("CREATE TABLE IF NOT EXISTS immigration.codes (code TEXT, name TEXT);")
            .await
            .unwrap();

        assert!(wh.table_exists("immigration.codes").await.unwrap());
        assert!(!wh.table_exists("immigration.other").await.unwrap());
        assert!(!wh.table_exists("nowhere.codes").await.unwrap());
    }

    #[tokio::test]
    async fn test_create_schema_rejects_bad_names() {
        let (_dir, wh, _) = warehouse();
        assert!(matches!(
            wh.create_schema("a.b").await.unwrap_err(),
            WarehouseError::InvalidIdentifier(_)
        ));
        assert!(wh.create_schema("main").await.is_err());
    }

    #[tokio::test]
    async fn test_execute_with_named_params_and_query() {
        let (_dir, wh, _) = warehouse();
        wh.execute("CREATE TABLE t (y INTEGER, m INTEGER, v REAL);")
            .await
            .unwrap();
        let inserted = wh
            .execute_with(
                "INSERT INTO t VALUES (:year, :month, :v)",
                &[("year", 2016.into()), (":month", 4.into()), ("v", 1.5.into())],
            )
            .await
            .unwrap();
        assert_eq!(inserted, 1);

        let rows = wh.query("SELECT y, m, v FROM t").await.unwrap();
        assert_eq!(
            rows,
            vec![vec![SqlValue::Integer(2016), SqlValue::Integer(4), SqlValue::Real(1.5)]]
        );
        assert_eq!(
            wh.query_scalar("SELECT COUNT(*) FROM t").await.unwrap(),
            SqlValue::Integer(1)
        );
    }

    #[tokio::test]
    async fn test_sqrt_is_available() {
        let (_dir, wh, _) = warehouse();
        let value = wh.query_scalar("SELECT sqrt(16.0)").await.unwrap();
        assert_eq!(value.as_f64(), Some(4.0));
    }

    #[tokio::test]
    async fn test_bulk_load_and_truncate() {
        let (_dir, wh, store) = warehouse();
        wh.create_schema("dims").await.unwrap();
        wh.execute("CREATE TABLE dims.codes (code TEXT, name TEXT);")
            .await
            .unwrap();
        let source = ObjectLocation::new("bucket", "staging/codes.csv");
        store
            .put(&source, b"code;name\n1;Air\n2;Sea\n9;\n".to_vec())
            .await
            .unwrap();

        let request = BulkLoad::new("dims.codes", source, token())
            .with_format(CsvFormat::semicolon_with_header());
        assert_eq!(wh.bulk_load(&request).await.unwrap(), 3);

        let nulls = wh
            .query_scalar("SELECT COUNT(*) FROM dims.codes WHERE name IS NULL")
            .await
            .unwrap();
        assert_eq!(nulls, SqlValue::Integer(1));

        wh.truncate("dims.codes").await.unwrap();
        assert_eq!(wh.bulk_load(&request).await.unwrap(), 3);
        let total = wh
            .query_scalar("SELECT COUNT(*) FROM dims.codes")
            .await
            .unwrap();
        assert_eq!(total, SqlValue::Integer(3));
    }

    #[tokio::test]
    async fn test_bulk_load_into_selected_columns() {
        let (_dir, wh, store) = warehouse();
        wh.execute("CREATE TABLE wide (id INTEGER, label TEXT, loaded_at TEXT DEFAULT 'now');")
            .await
            .unwrap();
        let source = ObjectLocation::new("bucket", "narrow.csv");
        store.put(&source, b"id,label\n1,a\n2,b\n".to_vec()).await.unwrap();

        let request = BulkLoad::new("wide", source, token())
            .with_columns(vec!["id".to_string(), "label".to_string()]);
        assert_eq!(wh.bulk_load(&request).await.unwrap(), 2);

        let rows = wh
            .query("SELECT id, label, loaded_at FROM wide ORDER BY id")
            .await
            .unwrap();
        assert_eq!(
            rows[1],
            vec![SqlValue::Integer(2), SqlValue::Text("b".into()), SqlValue::Text("now".into())]
        );

        let bad = BulkLoad::new("wide", ObjectLocation::new("bucket", "narrow.csv"), token())
            .with_columns(vec!["id; --".to_string()]);
        assert!(matches!(
            wh.bulk_load(&bad).await.unwrap_err(),
            WarehouseError::InvalidIdentifier(_)
        ));
    }

    #[tokio::test]
    async fn test_bulk_load_errors() {
        let (_dir, wh, store) = warehouse();
        wh.execute("CREATE TABLE two (a TEXT, b TEXT);").await.unwrap();
        let source = ObjectLocation::new("bucket", "bad.csv");
        store.put(&source, b"a,b\n1,2,3\n".to_vec()).await.unwrap();

        let err = wh
            .bulk_load(&BulkLoad::new("two", source.clone(), token()))
            .await
            .unwrap_err();
        assert!(matches!(err, WarehouseError::ColumnMismatch { expected: 2, found: 3, .. }));

        let err = wh
            .bulk_load(&BulkLoad::new("missing", source, token()))
            .await
            .unwrap_err();
        assert!(matches!(err, WarehouseError::MissingTable(_)));

        let err = wh
            .bulk_load(&BulkLoad::new("two", ObjectLocation::new("bucket", "nope.csv"), token()))
            .await
            .unwrap_err();
        assert!(matches!(err, WarehouseError::Source(_)));

        assert!(matches!(
            wh.truncate("two; DROP TABLE two").await.unwrap_err(),
            WarehouseError::InvalidIdentifier(_)
        ));
    }
}
