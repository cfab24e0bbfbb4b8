use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{Connection, ToSql, params_from_iter};
use tracing::debug;

use crate::database::{Database, FromRow, Row, SqlValue, Statement, ToSqlValue, bind};
use crate::StorageError;

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlValue::Real(f) => ToSqlOutput::Owned(Value::Real(*f)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b.as_slice())),
        })
    }
}

fn from_value_ref(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Integer(i),
        ValueRef::Real(f) => SqlValue::Real(f),
        ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
    }
}

fn query_error(e: rusqlite::Error) -> StorageError {
    StorageError::QueryFailed(e.to_string())
}

/// A SQLite connection shared by all callers. Statements run on the
/// blocking pool, one at a time.
#[derive(Clone, Debug)]
pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
}

/// Open (or create) the database file at `path`.
pub async fn open_database(path: impl AsRef<Path>) -> Result<SqliteDatabase, StorageError> {
    let path = path.as_ref().to_path_buf();
    tokio::task::spawn_blocking(move || {
        let conn = Connection::open(&path).map_err(|e| StorageError::OpenFailed(format!("{}: {e}", path.display())))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| StorageError::OpenFailed(e.to_string()))?;
        debug!(path = %path.display(), "Opened database");
        Ok(SqliteDatabase::from_connection(conn))
    })
    .await
    .map_err(|e| StorageError::Task(e.to_string()))?
}

impl SqliteDatabase {
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(|e| StorageError::OpenFailed(e.to_string()))?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    async fn with_connection<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut conn)
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
    }
}

impl Database for SqliteDatabase {
    fn execute(
        &self,
        sql: &str,
        params: &[&dyn ToSqlValue],
    ) -> impl Future<Output = Result<u64, StorageError>> + Send {
        let sql = sql.to_string();
        let params = bind(params);
        self.with_connection(move |conn| {
            let changed = conn
                .execute(&sql, params_from_iter(params.iter()))
                .map_err(query_error)?;
            Ok(changed as u64)
        })
    }

    fn query<T: FromRow + Send + 'static>(
        &self,
        sql: &str,
        params: &[&dyn ToSqlValue],
    ) -> impl Future<Output = Result<Vec<T>, StorageError>> + Send {
        let sql = sql.to_string();
        let params = bind(params);
        self.with_connection(move |conn| {
            let mut statement = conn.prepare(&sql).map_err(query_error)?;
            let columns = statement.column_count();
            let mut rows = statement
                .query(params_from_iter(params.iter()))
                .map_err(query_error)?;

            let mut results = Vec::new();
            while let Some(row) = rows.next().map_err(query_error)? {
                let mut values = Vec::with_capacity(columns);
                for index in 0..columns {
                    values.push(from_value_ref(row.get_ref(index).map_err(query_error)?));
                }
                results.push(T::from_row(&Row::new(values))?);
            }
            Ok(results)
        })
    }

    fn execute_batch(
        &self,
        statements: Vec<Statement>,
    ) -> impl Future<Output = Result<(), StorageError>> + Send {
        self.with_connection(move |conn| {
            let tx = conn.transaction().map_err(query_error)?;
            for statement in &statements {
                tx.execute(&statement.sql, params_from_iter(statement.params.iter()))
                    .map_err(query_error)?;
            }
            tx.commit().map_err(query_error)
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::sql::SqlStorage;
    use crate::Storage;

    #[tokio::test]
    async fn round_trips_values() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.execute("CREATE TABLE t (a TEXT, b INTEGER, c BLOB, d REAL)", &[]).await.unwrap();
        let blob = SqlValue::Blob(vec![1, 2]);
        let real = SqlValue::Real(1.5);
        let inserted = db
            .execute("INSERT INTO t VALUES (?1, ?2, ?3, ?4)", &[&"x", &42_i64, &blob, &real])
            .await
            .unwrap();
        assert_eq!(inserted, 1);

        let rows: Vec<Row> = db.query("SELECT a, b, c, d FROM t", &[]).await.unwrap();
        assert_eq!(
            rows,
            vec![Row::new(vec![
                SqlValue::Text("x".into()),
                SqlValue::Integer(42),
                SqlValue::Blob(vec![1, 2]),
                SqlValue::Real(1.5)
            ])]
        );
    }

    #[tokio::test]
    async fn failed_batch_rolls_back() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.execute("CREATE TABLE t (a TEXT PRIMARY KEY)", &[]).await.unwrap();

        let result = db
            .execute_batch(vec![
                Statement::new("INSERT INTO t VALUES (?1)", &[&"one"]),
                Statement::new("INSERT INTO t VALUES (?1)", &[&"one"]),
            ])
            .await;
        assert_matches!(result, Err(StorageError::QueryFailed(_)));

        let rows: Vec<Row> = db.query("SELECT COUNT(*) FROM t", &[]).await.unwrap();
        assert_eq!(rows[0].get(0), Some(&SqlValue::Integer(0)));
    }

    #[tokio::test]
    async fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perch.db");
        {
            let storage = SqlStorage::open(open_database(&path).await.unwrap()).await.unwrap();
            crate::fixtures::exercise_storage(&storage).await;
        }

        let reopened = SqlStorage::open(open_database(&path).await.unwrap()).await.unwrap();
        let messages = reopened
            .messages_for("alice@example.com", "bob@example.com", 10)
            .await
            .unwrap();
        assert_eq!(messages.len(), 4);
    }

    #[tokio::test]
    async fn open_reports_bad_path() {
        let dir = tempfile::tempdir().unwrap();
        let result = open_database(dir.path().join("missing").join("x.db")).await;
        assert_matches!(result, Err(StorageError::OpenFailed(_)));
    }
}
