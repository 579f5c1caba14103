use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::backend::{Backend, check_status};
use crate::error::BackendError;
use crate::filter::RowFilter;
use crate::table::Table;

/// Table access over the REST API.
/// Real implementation: `Backend`. Test double: `MemoryBackend`.
#[async_trait]
pub trait Database: Send + Sync {
    /// All rows of `table` matching every filter.
    async fn select(&self, table: Table, filters: &[RowFilter]) -> Result<Vec<Value>, BackendError>;

    /// Insert-or-update `rows` (an object or an array of objects) keyed by
    /// primary key, or by the comma-separated `on_conflict` columns.
    /// Returns the stored rows.
    async fn upsert(
        &self,
        table: Table,
        rows: Value,
        on_conflict: Option<&str>,
    ) -> Result<Vec<Value>, BackendError>;

    /// Delete rows matching every filter. At least one filter is required.
    async fn delete(&self, table: Table, filters: &[RowFilter]) -> Result<(), BackendError>;
}

/// Decode JSON rows into typed records.
pub fn decode_rows<T: DeserializeOwned>(table: Table, rows: Vec<Value>) -> Result<Vec<T>, BackendError> {
    rows.into_iter()
        .map(|row| {
            serde_json::from_value(row).map_err(|e| BackendError::decode(format!("{} row", table), e))
        })
        .collect()
}

impl Backend {
    fn table_url(&self, table: Table) -> Result<reqwest::Url, BackendError> {
        self.config().endpoint(&format!("rest/v1/{}", table.as_str()))
    }
}

#[async_trait]
impl Database for Backend {
    async fn select(&self, table: Table, filters: &[RowFilter]) -> Result<Vec<Value>, BackendError> {
        let mut query = vec![("select".to_string(), "*".to_string())];
        query.extend(filters.iter().map(RowFilter::query_pair));

        let resp = self
            .request(Method::GET, self.table_url(table)?)
            .header("Accept-Profile", &self.config().schema)
            .query(&query)
            .send()
            .await?;
        let rows = check_status(resp).await?.json::<Vec<Value>>().await?;
        tracing::debug!(table = %table, rows = rows.len(), "select");
        Ok(rows)
    }

    async fn upsert(
        &self,
        table: Table,
        rows: Value,
        on_conflict: Option<&str>,
    ) -> Result<Vec<Value>, BackendError> {
        let mut req = self
            .request(Method::POST, self.table_url(table)?)
            .header("Content-Profile", &self.config().schema)
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(&rows);
        if let Some(columns) = on_conflict {
            let columns: String = columns.split(',').map(str::trim).collect::<Vec<_>>().join(",");
            req = req.query(&[("on_conflict", columns)]);
        }

        let resp = req.send().await?;
        let stored = check_status(resp).await?.json::<Vec<Value>>().await?;
        tracing::debug!(table = %table, rows = stored.len(), "upsert");
        Ok(stored)
    }

    async fn delete(&self, table: Table, filters: &[RowFilter]) -> Result<(), BackendError> {
        if filters.is_empty() {
            return Err(BackendError::InvalidFilter(format!(
                "refusing to delete from {} without a filter",
                table
            )));
        }
        let query: Vec<(String, String)> = filters.iter().map(RowFilter::query_pair).collect();
        let resp = self
            .request(Method::DELETE, self.table_url(table)?)
            .header("Content-Profile", &self.config().schema)
            .query(&query)
            .send()
            .await?;
        check_status(resp).await?;
        tracing::debug!(table = %table, "delete");
        Ok(())
    }
}
