use std::collections::btree_map;
use std::collections::BTreeMap;

use crate::classify::{AddressClassifier, ReverseResolver};
use crate::models::domain::FlowRecord;

/// Inner key holding the sum of every other bucket in the row.
pub const TOTAL: &str = "total";

/// Byte counts keyed by an outer dimension (project or region), then by an
/// inner dimension (service or datacenter).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateTable {
    rows: BTreeMap<String, BTreeMap<String, i64>>,
    with_total: bool,
}

impl AggregateTable {
    /// A table that also keeps a [`TOTAL`] bucket per outer key.
    pub fn with_total() -> Self {
        AggregateTable {
            rows: BTreeMap::new(),
            with_total: true,
        }
    }

    pub fn without_total() -> Self {
        AggregateTable::default()
    }

    pub fn add(&mut self, outer: &str, inner: &str, bytes: i64) {
        let row = self.rows.entry(outer.to_string()).or_default();
        *row.entry(inner.to_string()).or_insert(0) += bytes;
        if self.with_total {
            *row.entry(TOTAL.to_string()).or_insert(0) += bytes;
        }
    }

    pub fn get(&self, outer: &str, inner: &str) -> Option<i64> {
        self.rows.get(outer)?.get(inner).copied()
    }

    pub fn row(&self, outer: &str) -> Option<&BTreeMap<String, i64>> {
        self.rows.get(outer)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, BTreeMap<String, i64>> {
        self.rows.iter()
    }

    pub fn has_total(&self) -> bool {
        self.with_total
    }

    /// Number of (outer, inner) cells, i.e. documents a publish will write.
    pub fn cell_count(&self) -> usize {
        self.rows.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl<'a> IntoIterator for &'a AggregateTable {
    type Item = (&'a String, &'a BTreeMap<String, i64>);
    type IntoIter = btree_map::Iter<'a, String, BTreeMap<String, i64>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// The three groupings produced by one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregates {
    /// project -> service (+ total)
    pub by_service: AggregateTable,
    /// project -> datacenter (+ total)
    pub by_datacenter: AggregateTable,
    /// region -> datacenter
    pub by_region_datacenter: AggregateTable,
    pub records: usize,
}

impl Default for Aggregates {
    fn default() -> Self {
        Aggregates {
            by_service: AggregateTable::with_total(),
            by_datacenter: AggregateTable::with_total(),
            by_region_datacenter: AggregateTable::without_total(),
            records: 0,
        }
    }
}

pub struct FlowAggregator<'c, R> {
    classifier: &'c mut AddressClassifier<R>,
}

impl<'c, R: ReverseResolver> FlowAggregator<'c, R> {
    pub fn new(classifier: &'c mut AddressClassifier<R>) -> Self {
        FlowAggregator { classifier }
    }

    /// Byte counts are summed as given; negative values are not rejected.
    pub fn aggregate<I>(&mut self, records: I) -> Aggregates
    where
        I: IntoIterator<Item = FlowRecord>,
    {
        let mut out = Aggregates::default();
        for record in records {
            self.add(&mut out, &record);
        }
        out
    }

    fn add(&mut self, out: &mut Aggregates, record: &FlowRecord) {
        let service = self.classifier.classify_service(&record.source_ip);
        let datacenter = self.classifier.classify_datacenter(&record.source_ip);

        out.by_service
            .add(&record.project_id, &service, record.bytes_sent);
        out.by_datacenter
            .add(&record.project_id, datacenter, record.bytes_sent);
        out.by_region_datacenter
            .add(&record.region, datacenter, record.bytes_sent);
        out.records += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::classify::Resolution;
    use crate::config::{ClassifierConfig, DatacenterPrefix, ServicePrefix};

    struct MapResolver(HashMap<&'static str, &'static str>);

    impl ReverseResolver for MapResolver {
        fn reverse(&self, ip: &str) -> Resolution {
            match self.0.get(ip) {
                Some(host) => Resolution::Resolved(host.to_string()),
                None => Resolution::NotFound,
            }
        }
    }

    fn classifier() -> AddressClassifier<MapResolver> {
        let rules = ClassifierConfig {
            exception_ips: ["10.9.0.1".to_string()].into_iter().collect(),
            service_prefixes: vec![ServicePrefix {
                prefix: "kafka".into(),
                service: "kafka".into(),
            }],
            datacenter_prefixes: vec![
                DatacenterPrefix {
                    prefix: "10.1.".into(),
                    datacenter: "dc1".into(),
                },
                DatacenterPrefix {
                    prefix: "10.2.".into(),
                    datacenter: "dc2".into(),
                },
            ],
            ..ClassifierConfig::default()
        };
        let resolver = MapResolver(HashMap::from([
            ("10.1.0.2", "mail.corp"),
            ("10.2.0.3", "kafka-07.corp"),
        ]));
        AddressClassifier::from_config(rules, resolver)
    }

    fn records() -> Vec<FlowRecord> {
        vec![
            FlowRecord::new("10.9.0.1", 100, "p1", "us"),
            FlowRecord::new("10.1.0.2", 50, "p1", "us"),
            FlowRecord::new("10.2.0.3", 70, "p1", "eu"),
            FlowRecord::new("10.2.0.3", 30, "p2", "us"),
            FlowRecord::new("172.16.0.1", 5, "p2", "eu"),
        ]
    }

    #[test]
    fn two_record_scenario() {
        let mut classifier = classifier();
        let out = FlowAggregator::new(&mut classifier).aggregate(vec![
            FlowRecord::new("10.9.0.1", 100, "p1", "us"),
            FlowRecord::new("10.1.0.2", 50, "p1", "us"),
        ]);

        let p1 = out.by_service.row("p1").unwrap();
        assert_eq!(
            p1,
            &BTreeMap::from([
                ("mssql".to_string(), 100),
                ("other".to_string(), 50),
                ("total".to_string(), 150),
            ])
        );
        assert_eq!(out.by_datacenter.get("p1", TOTAL), Some(150));
        assert_eq!(out.by_region_datacenter.get("us", "dc1"), Some(50));
        assert_eq!(out.by_region_datacenter.get("us", "other"), Some(100));
        assert_eq!(out.records, 2);
    }

    #[test]
    fn region_table_has_no_total() {
        let mut classifier = classifier();
        let out = FlowAggregator::new(&mut classifier).aggregate(records());

        assert!(!out.by_region_datacenter.has_total());
        for (_, row) in &out.by_region_datacenter {
            assert!(!row.contains_key(TOTAL));
        }
        assert_eq!(out.by_region_datacenter.get("eu", "dc2"), Some(70));
        assert_eq!(out.by_region_datacenter.get("eu", "other"), Some(5));
        assert_eq!(out.by_region_datacenter.get("us", "dc2"), Some(30));
    }

    #[test]
    fn totals_equal_sum_of_buckets() {
        let mut classifier = classifier();
        let out = FlowAggregator::new(&mut classifier).aggregate(records());

        for table in [&out.by_service, &out.by_datacenter] {
            for (outer, row) in table {
                let sum: i64 = row
                    .iter()
                    .filter(|(inner, _)| inner.as_str() != TOTAL)
                    .map(|(_, bytes)| *bytes)
                    .sum();
                assert_eq!(row.get(TOTAL), Some(&sum), "outer key {outer}");
            }
        }
        assert_eq!(out.by_service.get("p2", "kafka"), Some(30));
        assert_eq!(out.by_service.get("p2", "unknown"), Some(5));
    }

    #[test]
    fn record_order_does_not_matter() {
        let forward = FlowAggregator::new(&mut classifier()).aggregate(records());

        let mut reversed_records = records();
        reversed_records.reverse();
        let reversed = FlowAggregator::new(&mut classifier()).aggregate(reversed_records);

        let mut rotated_records = records();
        rotated_records.rotate_left(2);
        let rotated = FlowAggregator::new(&mut classifier()).aggregate(rotated_records);

        assert_eq!(forward, reversed);
        assert_eq!(forward, rotated);
    }

    #[test]
    fn negative_bytes_are_summed_as_given() {
        let mut classifier = classifier();
        let out = FlowAggregator::new(&mut classifier).aggregate(vec![
            FlowRecord::new("10.1.0.2", 10, "p1", "us"),
            FlowRecord::new("10.1.0.2", -4, "p1", "us"),
        ]);
        assert_eq!(out.by_service.get("p1", TOTAL), Some(6));
    }

    #[test]
    fn empty_input_yields_empty_tables() {
        let mut classifier = classifier();
        let out = FlowAggregator::new(&mut classifier).aggregate(Vec::new());
        assert!(out.by_service.is_empty());
        assert!(out.by_datacenter.is_empty());
        assert!(out.by_region_datacenter.is_empty());
        assert_eq!(out.records, 0);
    }

    #[test]
    fn cell_count_counts_total_buckets() {
        let mut table = AggregateTable::with_total();
        table.add("p1", "a", 1);
        table.add("p1", "b", 2);
        table.add("p2", "a", 3);
        assert_eq!(table.cell_count(), 5);
    }
}
