use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{info, warn};

use crate::aggregate::FlowAggregator;
use crate::classify::{AddressClassifier, CacheStats, ReverseResolver};
use crate::db::MetricSink;
use crate::error::PipelineError;
use crate::models::domain::Direction;
use crate::publish::MetricPublisher;
use crate::source::{FlowQuery, FlowSource};

/// Sums bytes per (on-prem ip, project, region) for one direction.
pub fn flow_query(direction: Direction, table: &str, location: &str) -> FlowQuery {
    let sql = format!(
        "SELECT
            SUM(CAST(jsonPayload.bytes_sent as INT64)) as bytes_sent,
            {onprem} as onprem_ip,
            {instance}.project_id as gcp_project,
            {instance}.region as gcp_region
        FROM
            `{table}`
        GROUP BY
            onprem_ip,
            gcp_project,
            gcp_region",
        onprem = direction.onprem_ip_field(),
        instance = direction.instance_field(),
        table = table,
    );
    FlowQuery {
        sql,
        location: location.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassSummary {
    pub direction: Direction,
    pub records: usize,
    pub documents: usize,
    pub cache: CacheStats,
}

/// Runs both directional passes against one flow-log table. The classifier
/// (and its cache) is shared by the passes.
pub struct PipelineRunner<'a, R> {
    source: &'a dyn FlowSource,
    sink: &'a dyn MetricSink,
    classifier: AddressClassifier<R>,
    table: String,
    location: String,
    timestamp: String,
}

impl<'a, R: ReverseResolver> PipelineRunner<'a, R> {
    pub fn new(
        source: &'a dyn FlowSource,
        sink: &'a dyn MetricSink,
        classifier: AddressClassifier<R>,
        table: impl Into<String>,
        location: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        PipelineRunner {
            source,
            sink,
            classifier,
            table: table.into(),
            location: location.into(),
            timestamp: timestamp.into(),
        }
    }

    /// Data center to cloud first, then cloud to data center. Stops at the
    /// first failing pass.
    pub async fn run(&mut self) -> Result<Vec<PassSummary>, PipelineError> {
        let mut summaries = Vec::with_capacity(Direction::ALL.len());
        for direction in Direction::ALL {
            summaries.push(self.run_pass(direction).await?);
        }
        Ok(summaries)
    }

    pub async fn run_pass(&mut self, direction: Direction) -> Result<PassSummary, PipelineError> {
        info!(table = %self.table, "Analyzing interconnect data {}", direction.describe());

        let query = flow_query(direction, &self.table, &self.location);
        let records = self
            .source
            .fetch(&query)
            .await
            .map_err(|source| PipelineError::Source { direction, source })?;

        // Reverse DNS blocks. On a multi-threaded runtime hand the worker's
        // other tasks off first; a current-thread runtime just blocks.
        let classifier = &mut self.classifier;
        let aggregate = move || FlowAggregator::new(classifier).aggregate(records);
        let aggregates = match Handle::try_current().map(|handle| handle.runtime_flavor()) {
            Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(aggregate),
            _ => aggregate(),
        };
        if aggregates.by_service.is_empty() {
            warn!(table = %self.table, "no flow records {}", direction.describe());
        }

        let publisher = MetricPublisher::new(self.sink, self.timestamp.as_str());
        let documents = publisher
            .publish_all(direction.namespace(), &aggregates)
            .await
            .map_err(|source| PipelineError::Sink { direction, source })?;

        let summary = PassSummary {
            direction,
            records: aggregates.records,
            documents,
            cache: self.classifier.cache_stats(),
        };
        info!(
            namespace = direction.namespace(),
            sink = self.sink.name(),
            records = summary.records,
            documents = summary.documents,
            cache_hits = summary.cache.hits,
            cache_misses = summary.cache.misses,
            "pass complete",
        );
        Ok(summary)
    }

    pub fn classifier(&self) -> &AddressClassifier<R> {
        &self.classifier
    }
}
