//! ClickHouse sink over the HTTP interface.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use crate::error::{PipelineError, Result};
use crate::models::SinkConnection;

/// A columnar store accepting atomic batch inserts.
///
/// One call is one atomic write: either every row of the batch is visible
/// afterwards or none is. Tests substitute an in-memory implementation.
#[async_trait]
pub trait ColumnarSink: Send + Sync {
    async fn insert(&self, rows: &[Map<String, Value>]) -> Result<()>;
}

/// ClickHouse client writing batches as single `INSERT ... FORMAT
/// JSONEachRow` statements over HTTP.
pub struct ClickHouseSink {
    http: reqwest::Client,
    url: String,
    query: String,
    username: Option<String>,
    password: Option<String>,
}

impl ClickHouseSink {
    /// Build from the sink connection config. `columns` fixes the insert
    /// column list so rows and table schema cannot drift apart silently.
    pub fn new(connection: &SinkConnection, columns: &[&str], insert_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(insert_timeout)
            .build()
            .map_err(|e| PipelineError::ConfigInvalid(format!("sink http client: {e}")))?;

        let query = format!(
            "INSERT INTO {}.{} ({}) FORMAT JSONEachRow",
            connection.database,
            connection.table,
            columns.join(", ")
        );

        Ok(Self {
            http,
            url: connection.url.clone(),
            query,
            username: connection.username.clone(),
            password: connection.password.clone(),
        })
    }
}

#[async_trait]
impl ColumnarSink for ClickHouseSink {
    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn insert(&self, rows: &[Map<String, Value>]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let body = rows
            .iter()
            .map(|row| serde_json::to_string(row))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| PipelineError::SinkWrite(format!("encode rows: {e}")))?
            .join("\n");

        let mut request = self
            .http
            .post(&self.url)
            .query(&[("query", self.query.as_str())])
            .body(body);

        if let Some(username) = &self.username {
            request = request.header("X-ClickHouse-User", username);
        }
        if let Some(password) = &self.password {
            request = request.header("X-ClickHouse-Key", password);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PipelineError::SinkWrite(format!("insert request: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(PipelineError::SinkWrite(format!(
                "insert rejected ({status}): {detail}"
            )));
        }

        debug!(rows = rows.len(), "batch inserted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_statement_shape() {
        let sink = ClickHouseSink::new(
            &SinkConnection {
                url: "http://localhost:8123".to_string(),
                database: "analytics".to_string(),
                table: "events".to_string(),
                username: None,
                password: None,
            },
            &["id", "amount", "geo"],
            Duration::from_secs(60),
        )
        .unwrap();

        assert_eq!(
            sink.query,
            "INSERT INTO analytics.events (id, amount, geo) FORMAT JSONEachRow"
        );
    }
}
