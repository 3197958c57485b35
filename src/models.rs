pub mod domain {
    use chrono::{Local, NaiveDate, NaiveDateTime};

    /// One row of the flow-log query, already summed per
    /// (on-prem ip, project, region) by the warehouse.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct FlowRecord {
        pub source_ip: String,
        pub bytes_sent: i64,
        pub project_id: String,
        pub region: String,
    }

    impl FlowRecord {
        pub fn new(
            source_ip: impl Into<String>,
            bytes_sent: i64,
            project_id: impl Into<String>,
            region: impl Into<String>,
        ) -> Self {
            FlowRecord {
                source_ip: source_ip.into(),
                bytes_sent,
                project_id: project_id.into(),
                region: region.into(),
            }
        }
    }

    /// Which side of the interconnect is the sender for a pass.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Direction {
        /// Data center to cloud: the on-prem address is the connection source.
        OnPremToCloud,
        /// Cloud to data center: the on-prem address is the connection destination.
        CloudToOnPrem,
    }

    impl Direction {
        pub const ALL: [Direction; 2] = [Direction::OnPremToCloud, Direction::CloudToOnPrem];

        /// Prefix of every sink index written during this pass.
        pub fn namespace(self) -> &'static str {
            match self {
                Direction::OnPremToCloud => "interconnect_ts_to_gcp",
                Direction::CloudToOnPrem => "interconnect_gcp_to_ts",
            }
        }

        /// Flow-log field holding the on-prem address.
        pub fn onprem_ip_field(self) -> &'static str {
            match self {
                Direction::OnPremToCloud => "jsonPayload.connection.src_ip",
                Direction::CloudToOnPrem => "jsonPayload.connection.dest_ip",
            }
        }

        /// Flow-log record describing the cloud VM.
        pub fn instance_field(self) -> &'static str {
            match self {
                Direction::OnPremToCloud => "jsonPayload.dest_instance",
                Direction::CloudToOnPrem => "jsonPayload.src_instance",
            }
        }

        pub fn describe(self) -> &'static str {
            match self {
                Direction::OnPremToCloud => "from TS to GCP",
                Direction::CloudToOnPrem => "from GCP to TS",
            }
        }
    }

    /// The day a run covers: the flow-log table suffix plus the timestamp
    /// stamped on every published document.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct RunDate {
        suffix: String,
        timestamp: NaiveDateTime,
    }

    impl RunDate {
        pub const SUFFIX_FORMAT: &'static str = "%Y%m%d";
        const TIMESTAMP_FORMAT: &'static str = "%Y-%m-%dT%H:%M:%S";

        pub fn from_suffix(suffix: &str) -> Result<Self, chrono::ParseError> {
            let date = NaiveDate::parse_from_str(suffix, Self::SUFFIX_FORMAT)?;
            Ok(Self::from_date(date))
        }

        pub fn today() -> Self {
            Self::from_date(Local::now().date_naive())
        }

        pub fn from_date(date: NaiveDate) -> Self {
            RunDate {
                suffix: date.format(Self::SUFFIX_FORMAT).to_string(),
                timestamp: date.and_time(chrono::NaiveTime::MIN),
            }
        }

        pub fn suffix(&self) -> &str {
            &self.suffix
        }

        pub fn timestamp(&self) -> NaiveDateTime {
            self.timestamp
        }

        /// ISO-8601 without zone, e.g. `2024-03-01T00:00:00`.
        pub fn timestamp_string(&self) -> String {
            self.timestamp.format(Self::TIMESTAMP_FORMAT).to_string()
        }
    }
}

pub mod dto {
    use serde::ser::{Serialize, SerializeMap, Serializer};

    /// A single published metric. Serializes to a flat map with exactly four
    /// fields, in order: outer label, `timestamp`, inner label, `bytes_sent`.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct MetricDocument {
        pub outer_label: &'static str,
        pub outer: String,
        pub timestamp: String,
        pub inner_label: &'static str,
        pub inner: String,
        pub bytes_sent: i64,
    }

    impl Serialize for MetricDocument {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            let mut map = serializer.serialize_map(Some(4))?;
            map.serialize_entry(self.outer_label, &self.outer)?;
            map.serialize_entry("timestamp", &self.timestamp)?;
            map.serialize_entry(self.inner_label, &self.inner)?;
            map.serialize_entry("bytes_sent", &self.bytes_sent)?;
            map.end()
        }
    }
}
