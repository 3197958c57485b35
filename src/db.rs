use std::time::Duration;

use async_trait::async_trait;
use mongodb::{
    bson::{self, Document},
    options::ClientOptions,
    Client, Database,
};
use tracing::info;

use crate::config::SinkConfig;
use crate::error::SinkError;
use crate::models::dto::MetricDocument;

/// Write-only destination for metric documents. `index` names the
/// collection (Elasticsearch index, MongoDB collection) to append to.
#[async_trait]
pub trait MetricSink: Send + Sync {
    fn name(&self) -> &str;

    async fn write(&self, index: &str, doc: &MetricDocument) -> Result<(), SinkError>;
}

/// Connects the sink selected in the config.
pub async fn connect(config: &SinkConfig) -> Result<Box<dyn MetricSink>, SinkError> {
    match config {
        SinkConfig::Elasticsearch { url, timeout_secs } => Ok(Box::new(ElasticsearchSink::new(
            url,
            Duration::from_secs(*timeout_secs),
        )?)),
        SinkConfig::Mongodb { uri, database } => {
            Ok(Box::new(MetricsDB::connect(uri, database).await?))
        }
    }
}

/// One MongoDB collection per index name.
#[derive(Clone)]
pub struct MetricsDB {
    database: Database,
}

impl MetricsDB {
    pub async fn connect(uri: &str, database: &str) -> Result<Self, SinkError> {
        let client_options = ClientOptions::parse(uri).await?;
        let client = Client::with_options(client_options)?;
        info!(database, "connected to MongoDB");
        Ok(Self {
            database: client.database(database),
        })
    }
}

#[async_trait]
impl MetricSink for MetricsDB {
    fn name(&self) -> &str {
        "mongodb"
    }

    async fn write(&self, index: &str, doc: &MetricDocument) -> Result<(), SinkError> {
        let doc: Document = bson::to_document(doc)?;
        self.database
            .collection::<Document>(index)
            .insert_one(doc)
            .await?;
        Ok(())
    }
}

/// Indexes each document with `POST {url}/{index}/_doc`.
pub struct ElasticsearchSink {
    client: reqwest::Client,
    url: String,
}

impl ElasticsearchSink {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
        })
    }

    fn doc_url(&self, index: &str) -> String {
        format!("{}/{}/_doc", self.url, index)
    }
}

#[async_trait]
impl MetricSink for ElasticsearchSink {
    fn name(&self) -> &str {
        "elasticsearch"
    }

    async fn write(&self, index: &str, doc: &MetricDocument) -> Result<(), SinkError> {
        let response = self.client.post(self.doc_url(index)).json(doc).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Rejected {
                index: index.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Accepts and drops every document. Used by `--dry-run`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunSink;

#[async_trait]
impl MetricSink for DryRunSink {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn write(&self, _index: &str, _doc: &MetricDocument) -> Result<(), SinkError> {
        Ok(())
    }
}
