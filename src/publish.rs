use tracing::debug;

use crate::aggregate::{AggregateTable, Aggregates};
use crate::db::MetricSink;
use crate::error::SinkError;
use crate::models::dto::MetricDocument;

/// Naming scheme for one of the three aggregate tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    ByService,
    ByDatacenter,
    RegionDatacenter,
}

impl MetricKind {
    pub const ALL: [MetricKind; 3] = [
        MetricKind::ByService,
        MetricKind::ByDatacenter,
        MetricKind::RegionDatacenter,
    ];

    /// Index suffix. The spelling matches the indices existing dashboards
    /// read from, including `send`.
    pub fn suffix(self) -> &'static str {
        match self {
            MetricKind::ByService => "bytes_send_by_service",
            MetricKind::ByDatacenter => "bytes_sent_by_dc",
            MetricKind::RegionDatacenter => "bytes_sent_region_dc",
        }
    }

    pub fn outer_label(self) -> &'static str {
        match self {
            MetricKind::ByService | MetricKind::ByDatacenter => "project_id",
            MetricKind::RegionDatacenter => "region",
        }
    }

    pub fn inner_label(self) -> &'static str {
        match self {
            MetricKind::ByService => "service",
            MetricKind::ByDatacenter => "datacenter",
            MetricKind::RegionDatacenter => "dc",
        }
    }

    pub fn index(self, namespace: &str) -> String {
        format!("{}_{}", namespace, self.suffix())
    }

    fn table(self, aggregates: &Aggregates) -> &AggregateTable {
        match self {
            MetricKind::ByService => &aggregates.by_service,
            MetricKind::ByDatacenter => &aggregates.by_datacenter,
            MetricKind::RegionDatacenter => &aggregates.by_region_datacenter,
        }
    }
}

/// Writes aggregate tables to a sink, one document per cell, all stamped
/// with the same run timestamp.
pub struct MetricPublisher<'s, S: ?Sized> {
    sink: &'s S,
    timestamp: String,
}

impl<'s, S: MetricSink + ?Sized> MetricPublisher<'s, S> {
    pub fn new(sink: &'s S, timestamp: impl Into<String>) -> Self {
        MetricPublisher {
            sink,
            timestamp: timestamp.into(),
        }
    }

    pub fn documents(&self, kind: MetricKind, table: &AggregateTable) -> Vec<MetricDocument> {
        let mut docs = Vec::with_capacity(table.cell_count());
        docs.extend(table.iter().flat_map(|(outer, row)| {
            row.iter().map(move |(inner, bytes)| MetricDocument {
                outer_label: kind.outer_label(),
                outer: outer.clone(),
                timestamp: self.timestamp.clone(),
                inner_label: kind.inner_label(),
                inner: inner.clone(),
                bytes_sent: *bytes,
            })
        }));
        docs
    }

    /// Publishes one table. Stops at the first failed write; documents
    /// written before it stay written.
    pub async fn publish(
        &self,
        namespace: &str,
        kind: MetricKind,
        table: &AggregateTable,
    ) -> Result<usize, SinkError> {
        let index = kind.index(namespace);
        let docs = self.documents(kind, table);
        for doc in &docs {
            // Diagnostic copy of every document, whatever the log level.
            match serde_json::to_string(doc) {
                Ok(line) => println!("{line}"),
                Err(e) => debug!(error = %e, "could not render document"),
            }
            self.sink.write(&index, doc).await?;
        }
        debug!(index = %index, documents = docs.len(), "published table");
        Ok(docs.len())
    }

    /// Publishes all three tables of a pass in a fixed order.
    pub async fn publish_all(
        &self,
        namespace: &str,
        aggregates: &Aggregates,
    ) -> Result<usize, SinkError> {
        let mut written = 0;
        for kind in MetricKind::ALL {
            written += self.publish(namespace, kind, kind.table(aggregates)).await?;
        }
        Ok(written)
    }
}
