use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::SourceConfig;
use crate::error::SourceError;
use crate::models::domain::FlowRecord;

pub const ACCESS_TOKEN_VAR: &str = "BIGQUERY_ACCESS_TOKEN";

/// Column names every flow query must produce.
pub const BYTES_SENT: &str = "bytes_sent";
pub const ONPREM_IP: &str = "onprem_ip";
pub const GCP_PROJECT: &str = "gcp_project";
pub const GCP_REGION: &str = "gcp_region";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowQuery {
    pub sql: String,
    /// Where the query job runs, e.g. "US".
    pub location: String,
}

/// Produces flow records for a query. Execution errors end the run.
#[async_trait]
pub trait FlowSource: Send + Sync {
    async fn fetch(&self, query: &FlowQuery) -> Result<Vec<FlowRecord>, SourceError>;
}

/// Runs queries through the BigQuery REST API (`jobs.query`, then
/// `jobs.getQueryResults` until the job is done and every page is read).
pub struct BigQuerySource {
    client: reqwest::Client,
    endpoint: String,
    project: String,
    token: String,
    page_size: u32,
    timeout_ms: u64,
}

impl BigQuerySource {
    pub fn new(config: &SourceConfig, token: String) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            project: config.project.clone(),
            token,
            page_size: config.page_size,
            timeout_ms: config.timeout_secs * 1000,
        })
    }

    /// Reads the OAuth token from `BIGQUERY_ACCESS_TOKEN`.
    pub fn from_env(config: &SourceConfig) -> Result<Self, SourceError> {
        let token = std::env::var(ACCESS_TOKEN_VAR).map_err(|_| SourceError::MissingToken)?;
        Self::new(config, token)
    }
}

/// The two calls a query needs: start the job, then read further pages (or
/// poll an unfinished job) by job reference.
#[async_trait]
trait QueryPages: Send + Sync {
    async fn start(&self, query: &FlowQuery) -> Result<QueryResponse, SourceError>;

    async fn next_page(
        &self,
        job: &JobReference,
        page_token: Option<&str>,
    ) -> Result<QueryResponse, SourceError>;
}

#[async_trait]
impl QueryPages for BigQuerySource {
    async fn start(&self, query: &FlowQuery) -> Result<QueryResponse, SourceError> {
        let url = format!("{}/projects/{}/queries", self.endpoint, self.project);
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(&json!({
                "query": query.sql,
                "useLegacySql": false,
                "location": query.location,
                "maxResults": self.page_size,
                "timeoutMs": self.timeout_ms,
            }))
            .send()
            .await?;
        read_response(response).await
    }

    async fn next_page(
        &self,
        job: &JobReference,
        page_token: Option<&str>,
    ) -> Result<QueryResponse, SourceError> {
        let url = format!(
            "{}/projects/{}/queries/{}",
            self.endpoint, job.project_id, job.job_id
        );
        let mut params = vec![
            ("maxResults", self.page_size.to_string()),
            ("timeoutMs", self.timeout_ms.to_string()),
        ];
        if let Some(location) = &job.location {
            params.push(("location", location.clone()));
        }
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .query(&params)
            .send()
            .await?;
        read_response(response).await
    }
}

#[async_trait]
impl FlowSource for BigQuerySource {
    async fn fetch(&self, query: &FlowQuery) -> Result<Vec<FlowRecord>, SourceError> {
        collect_records(self, query).await
    }
}

/// Polls until the job completes, then follows page tokens. Later pages may
/// omit the schema and the job reference; both carry over from earlier ones.
async fn collect_records<P: QueryPages + ?Sized>(
    pages: &P,
    query: &FlowQuery,
) -> Result<Vec<FlowRecord>, SourceError> {
    let mut response = pages.start(query).await?;
    let mut columns: Option<Columns> = None;
    let mut records = Vec::new();

    loop {
        if response.job_complete {
            if columns.is_none() {
                columns = Some(Columns::from_schema(response.schema.as_ref())?);
            }
            if let Some(columns) = &columns {
                for row in &response.rows {
                    records.push(columns.decode(row)?);
                }
            }
            debug!(rows = response.rows.len(), total = records.len(), "read result page");
            if response.page_token.is_none() {
                break;
            }
        }

        let job = response
            .job_reference
            .take()
            .ok_or_else(|| SourceError::Protocol("response has no jobReference".into()))?;
        let page_token = if response.job_complete {
            response.page_token.take()
        } else {
            None
        };
        response = pages.next_page(&job, page_token.as_deref()).await?;
        if response.job_reference.is_none() {
            response.job_reference = Some(job);
        }
    }

    Ok(records)
}

async fn read_response(response: reqwest::Response) -> Result<QueryResponse, SourceError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(SourceError::Api {
            status: status.as_u16(),
            message: api_error_message(&body),
        });
    }
    Ok(response.json().await?)
}

/// Pulls `error.message` out of a Google API error body, falling back to the
/// raw text.
fn api_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    job_reference: Option<JobReference>,
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<TableRow>,
    page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    project_id: String,
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TableSchema {
    fields: Vec<FieldSchema>,
}

#[derive(Debug, Deserialize)]
struct FieldSchema {
    name: String,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    f: Vec<TableCell>,
}

#[derive(Debug, Deserialize)]
struct TableCell {
    #[serde(default)]
    v: Value,
}

/// Positions of the flow columns within a result row.
#[derive(Debug)]
struct Columns {
    bytes_sent: usize,
    onprem_ip: usize,
    gcp_project: usize,
    gcp_region: usize,
}

impl Columns {
    fn from_schema(schema: Option<&TableSchema>) -> Result<Self, SourceError> {
        let fields = schema.map(|s| s.fields.as_slice()).unwrap_or_default();
        let find = |name: &'static str| {
            fields
                .iter()
                .position(|f| f.name == name)
                .ok_or(SourceError::MissingField(name))
        };
        Ok(Columns {
            bytes_sent: find(BYTES_SENT)?,
            onprem_ip: find(ONPREM_IP)?,
            gcp_project: find(GCP_PROJECT)?,
            gcp_region: find(GCP_REGION)?,
        })
    }

    fn decode(&self, row: &TableRow) -> Result<FlowRecord, SourceError> {
        let bytes = cell_text(row, self.bytes_sent).ok_or(SourceError::InvalidValue {
            field: BYTES_SENT,
            value: "null".into(),
        })?;
        let bytes_sent = bytes.parse::<i64>().map_err(|_| SourceError::InvalidValue {
            field: BYTES_SENT,
            value: bytes.clone(),
        })?;

        // Null strings (e.g. traffic with no VM on the cloud side) become "".
        Ok(FlowRecord {
            source_ip: cell_text(row, self.onprem_ip).unwrap_or_default(),
            bytes_sent,
            project_id: cell_text(row, self.gcp_project).unwrap_or_default(),
            region: cell_text(row, self.gcp_region).unwrap_or_default(),
        })
    }
}

fn cell_text(row: &TableRow, index: usize) -> Option<String> {
    match row.f.get(index).map(|cell| &cell.v) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// Hands out canned responses in order and records every follow-up call.
    struct ScriptedPages {
        responses: Mutex<VecDeque<QueryResponse>>,
        requests: Mutex<Vec<(String, Option<String>)>>,
    }

    impl ScriptedPages {
        fn new(responses: Vec<Value>) -> Self {
            ScriptedPages {
                responses: Mutex::new(responses.into_iter().map(response).collect()),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn pop(&self) -> Result<QueryResponse, SourceError> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| SourceError::Protocol("script exhausted".into()))
        }
    }

    #[async_trait]
    impl QueryPages for ScriptedPages {
        async fn start(&self, _query: &FlowQuery) -> Result<QueryResponse, SourceError> {
            self.pop()
        }

        async fn next_page(
            &self,
            job: &JobReference,
            page_token: Option<&str>,
        ) -> Result<QueryResponse, SourceError> {
            self.requests
                .lock()
                .unwrap()
                .push((job.job_id.clone(), page_token.map(str::to_string)));
            self.pop()
        }
    }

    fn query() -> FlowQuery {
        FlowQuery {
            sql: "SELECT 1".into(),
            location: "US".into(),
        }
    }

    fn job() -> Value {
        json!({"projectId": "proj", "jobId": "job_1", "location": "US"})
    }

    fn row(bytes: &str, ip: &str) -> Value {
        json!({"f": [{"v": bytes}, {"v": ip}, {"v": "p1"}, {"v": "us-east1"}]})
    }

    fn response(body: Value) -> QueryResponse {
        serde_json::from_value(body).unwrap()
    }

    fn schema() -> Value {
        json!({"fields": [
            {"name": "bytes_sent", "type": "INTEGER"},
            {"name": "onprem_ip", "type": "STRING"},
            {"name": "gcp_project", "type": "STRING"},
            {"name": "gcp_region", "type": "STRING"},
        ]})
    }

    #[test]
    fn decodes_rows_by_column_name() {
        let page = response(json!({
            "jobComplete": true,
            "schema": schema(),
            "rows": [
                {"f": [{"v": "1024"}, {"v": "10.1.0.2"}, {"v": "p1"}, {"v": "us-east1"}]},
                {"f": [{"v": "7"}, {"v": "10.2.0.3"}, {"v": null}, {"v": "europe-west1"}]},
            ],
        }));
        let columns = Columns::from_schema(page.schema.as_ref()).unwrap();

        let records: Vec<_> = page
            .rows
            .iter()
            .map(|row| columns.decode(row).unwrap())
            .collect();

        assert_eq!(records[0], FlowRecord::new("10.1.0.2", 1024, "p1", "us-east1"));
        assert_eq!(records[1], FlowRecord::new("10.2.0.3", 7, "", "europe-west1"));
        assert!(page.page_token.is_none());
    }

    #[test]
    fn column_order_follows_schema() {
        let page = response(json!({
            "jobComplete": true,
            "schema": {"fields": [
                {"name": "gcp_region"}, {"name": "gcp_project"},
                {"name": "onprem_ip"}, {"name": "bytes_sent"},
            ]},
            "rows": [{"f": [{"v": "us"}, {"v": "p9"}, {"v": "10.0.0.1"}, {"v": "3"}]}],
        }));
        let columns = Columns::from_schema(page.schema.as_ref()).unwrap();
        assert_eq!(
            columns.decode(&page.rows[0]).unwrap(),
            FlowRecord::new("10.0.0.1", 3, "p9", "us")
        );
    }

    #[test]
    fn missing_column_is_an_error() {
        let page = response(json!({
            "jobComplete": true,
            "schema": {"fields": [{"name": "bytes_sent"}, {"name": "onprem_ip"}]},
        }));
        let err = Columns::from_schema(page.schema.as_ref()).unwrap_err();
        assert!(matches!(err, SourceError::MissingField(GCP_PROJECT)));
    }

    #[test]
    fn null_or_text_bytes_are_rejected() {
        let page = response(json!({
            "jobComplete": true,
            "schema": schema(),
            "rows": [
                {"f": [{"v": null}, {"v": "10.1.0.2"}, {"v": "p1"}, {"v": "us"}]},
                {"f": [{"v": "lots"}, {"v": "10.1.0.2"}, {"v": "p1"}, {"v": "us"}]},
            ],
        }));
        let columns = Columns::from_schema(page.schema.as_ref()).unwrap();
        for row in &page.rows {
            assert!(matches!(
                columns.decode(row),
                Err(SourceError::InvalidValue { field: BYTES_SENT, .. })
            ));
        }
    }

    #[test]
    fn incomplete_job_response_parses() {
        let page = response(json!({
            "jobComplete": false,
            "jobReference": {"projectId": "proj", "jobId": "job_1", "location": "US"},
        }));
        assert!(!page.job_complete);
        assert!(page.rows.is_empty());
        assert_eq!(page.job_reference.unwrap().job_id, "job_1");
    }

    #[test]
    fn api_error_message_prefers_google_error_body() {
        let body = r#"{"error": {"code": 404, "message": "Not found: Table x", "status": "NOT_FOUND"}}"#;
        assert_eq!(api_error_message(body), "Not found: Table x");
        assert_eq!(api_error_message("bad gateway"), "bad gateway");
    }

    #[tokio::test]
    async fn polls_until_the_job_completes() {
        let pages = ScriptedPages::new(vec![
            json!({"jobComplete": false, "jobReference": job()}),
            json!({"jobComplete": true, "schema": schema(), "rows": [row("9", "10.1.0.2")]}),
        ]);

        let records = collect_records(&pages, &query()).await.unwrap();

        assert_eq!(records, vec![FlowRecord::new("10.1.0.2", 9, "p1", "us-east1")]);
        assert_eq!(*pages.requests.lock().unwrap(), vec![("job_1".to_string(), None)]);
    }

    #[tokio::test]
    async fn follows_page_tokens_with_the_first_schema() {
        let pages = ScriptedPages::new(vec![
            json!({
                "jobComplete": true,
                "jobReference": job(),
                "schema": schema(),
                "rows": [row("1", "10.1.0.1")],
                "pageToken": "t2",
            }),
            json!({"jobComplete": true, "rows": [row("2", "10.1.0.2")], "pageToken": "t3"}),
            json!({"jobComplete": true, "rows": [row("3", "10.1.0.3")]}),
        ]);

        let records = collect_records(&pages, &query()).await.unwrap();

        let bytes: Vec<i64> = records.iter().map(|r| r.bytes_sent).collect();
        assert_eq!(bytes, [1, 2, 3]);
        assert_eq!(
            *pages.requests.lock().unwrap(),
            vec![
                ("job_1".to_string(), Some("t2".to_string())),
                ("job_1".to_string(), Some("t3".to_string())),
            ]
        );
    }

    #[tokio::test]
    async fn more_pages_without_job_reference_is_a_protocol_error() {
        let pages = ScriptedPages::new(vec![json!({
            "jobComplete": true,
            "schema": schema(),
            "rows": [row("1", "10.1.0.1")],
            "pageToken": "t2",
        })]);

        let err = collect_records(&pages, &query()).await.unwrap_err();

        assert!(matches!(err, SourceError::Protocol(_)));
        assert!(pages.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn page_errors_end_the_fetch() {
        let pages = ScriptedPages::new(vec![json!({"jobComplete": false, "jobReference": job()})]);

        let err = collect_records(&pages, &query()).await.unwrap_err();

        assert!(matches!(err, SourceError::Protocol(message) if message == "script exhausted"));
    }
}
