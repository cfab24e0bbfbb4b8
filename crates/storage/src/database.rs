use std::future::Future;

use crate::StorageError;

/// A single SQL value, independent of the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// Conversion of a Rust value into a bound parameter.
pub trait ToSqlValue: Sync {
    fn to_sql_value(&self) -> SqlValue;
}

impl ToSqlValue for SqlValue {
    fn to_sql_value(&self) -> SqlValue {
        self.clone()
    }
}

impl ToSqlValue for String {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Text(self.clone())
    }
}

impl ToSqlValue for &str {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Text((*self).to_string())
    }
}

impl ToSqlValue for i64 {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Integer(*self)
    }
}

impl ToSqlValue for bool {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Integer(i64::from(*self))
    }
}

impl<T: ToSqlValue> ToSqlValue for Option<T> {
    fn to_sql_value(&self) -> SqlValue {
        match self {
            Some(value) => value.to_sql_value(),
            None => SqlValue::Null,
        }
    }
}

/// One result row, columns in select order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    values: Vec<SqlValue>,
}

impl Row {
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self { values }
    }

    pub fn get(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn text(&self, index: usize) -> Result<String, StorageError> {
        match self.get(index) {
            Some(SqlValue::Text(s)) => Ok(s.clone()),
            other => Err(column_error(index, "text", other)),
        }
    }

    pub fn opt_text(&self, index: usize) -> Result<Option<String>, StorageError> {
        match self.get(index) {
            Some(SqlValue::Null) => Ok(None),
            _ => self.text(index).map(Some),
        }
    }

    pub fn integer(&self, index: usize) -> Result<i64, StorageError> {
        match self.get(index) {
            Some(SqlValue::Integer(i)) => Ok(*i),
            other => Err(column_error(index, "integer", other)),
        }
    }
}

fn column_error(index: usize, expected: &str, found: Option<&SqlValue>) -> StorageError {
    StorageError::QueryFailed(format!("column {index}: expected {expected}, found {found:?}"))
}

impl FromRow for Row {
    fn from_row(row: &Row) -> Result<Self, StorageError> {
        Ok(row.clone())
    }
}

pub trait FromRow: Sized {
    fn from_row(row: &Row) -> Result<Self, StorageError>;
}

/// A statement with its parameters already bound, for use in
/// [`Database::execute_batch`].
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: &[&dyn ToSqlValue]) -> Self {
        Self {
            sql: sql.into(),
            params: bind(params),
        }
    }
}

pub(crate) fn bind(params: &[&dyn ToSqlValue]) -> Vec<SqlValue> {
    params.iter().map(|p| p.to_sql_value()).collect()
}

pub trait Database: Send + Sync + 'static {
    /// Run one statement; returns the number of affected rows.
    fn execute(
        &self,
        sql: &str,
        params: &[&dyn ToSqlValue],
    ) -> impl Future<Output = Result<u64, StorageError>> + Send;

    fn query<T: FromRow + Send + 'static>(
        &self,
        sql: &str,
        params: &[&dyn ToSqlValue],
    ) -> impl Future<Output = Result<Vec<T>, StorageError>> + Send;

    /// Run several statements in one transaction.
    fn execute_batch(
        &self,
        statements: Vec<Statement>,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn binds_mixed_parameters() {
        let name = "bob".to_string();
        let missing: Option<String> = None;
        let count = 3_i64;
        let statement = Statement::new("INSERT", &[&name, &missing, &count, &true]);
        assert_eq!(
            statement.params,
            vec![
                SqlValue::Text("bob".into()),
                SqlValue::Null,
                SqlValue::Integer(3),
                SqlValue::Integer(1)
            ]
        );
    }

    #[test]
    fn typed_column_access() {
        let row = Row::new(vec![SqlValue::Text("a".into()), SqlValue::Null, SqlValue::Integer(7)]);
        assert_eq!(row.text(0).unwrap(), "a");
        assert_eq!(row.opt_text(1).unwrap(), None);
        assert_eq!(row.integer(2).unwrap(), 7);
        assert_matches!(row.integer(0), Err(StorageError::QueryFailed(_)));
        assert_matches!(row.text(5), Err(StorageError::QueryFailed(_)));
    }
}
