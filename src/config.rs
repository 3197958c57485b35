use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Top-level configuration for a run.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub classifier: ClassifierConfig,

    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub sink: SinkConfig,
}

/// Static lookup tables for IP classification.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassifierConfig {
    /// Label returned for every address in `exception_ips`. Default: "mssql".
    #[serde(default = "default_exception_label")]
    pub exception_label: String,

    /// Addresses of the database tier, labelled without a DNS lookup.
    #[serde(default)]
    pub exception_ips: HashSet<String>,

    /// Hostname prefix to service, in match order. The last match wins.
    #[serde(default)]
    pub service_prefixes: Vec<ServicePrefix>,

    /// IP prefix to datacenter, in match order. The first match wins.
    #[serde(default)]
    pub datacenter_prefixes: Vec<DatacenterPrefix>,

    /// Seconds a resolved service stays cached. Unset: for the whole run.
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            exception_label: default_exception_label(),
            exception_ips: HashSet::new(),
            service_prefixes: Vec::new(),
            datacenter_prefixes: Vec::new(),
            cache_ttl_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServicePrefix {
    pub prefix: String,
    pub service: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatacenterPrefix {
    pub prefix: String,
    pub datacenter: String,
}

/// Flow-log warehouse (BigQuery) settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// Project that runs (and is billed for) the query jobs.
    #[serde(default = "default_project")]
    pub project: String,

    /// Fully qualified flow-log table name without the date suffix.
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,

    /// Locality hint passed with every query. Default: "US".
    #[serde(default = "default_location")]
    pub location: String,

    #[serde(default = "default_bigquery_endpoint")]
    pub endpoint: String,

    /// Per-request timeout. Default: 60s.
    #[serde(default = "default_source_timeout")]
    pub timeout_secs: u64,

    /// Rows requested per result page. Default: 10000.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            project: default_project(),
            table_prefix: default_table_prefix(),
            location: default_location(),
            endpoint: default_bigquery_endpoint(),
            timeout_secs: default_source_timeout(),
            page_size: default_page_size(),
        }
    }
}

impl SourceConfig {
    /// Flow-log table holding one day of records.
    pub fn table_for(&self, date_suffix: &str) -> String {
        format!("{}{}", self.table_prefix, date_suffix)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Where metric documents are written.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SinkConfig {
    Elasticsearch {
        #[serde(default = "default_elasticsearch_url")]
        url: String,
        #[serde(default = "default_sink_timeout")]
        timeout_secs: u64,
    },
    Mongodb {
        #[serde(default = "default_mongodb_uri")]
        uri: String,
        #[serde(default = "default_mongodb_database")]
        database: String,
    },
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig::Elasticsearch {
            url: default_elasticsearch_url(),
            timeout_secs: default_sink_timeout(),
        }
    }
}

impl Config {
    /// Loads and validates a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let classifier = &self.classifier;
        if classifier.exception_label.is_empty() {
            return Err(ConfigError::Invalid("classifier.exception_label is empty".into()));
        }
        for entry in &classifier.service_prefixes {
            if entry.prefix.is_empty() || entry.service.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "service prefix entry {entry:?} has an empty field"
                )));
            }
        }
        for entry in &classifier.datacenter_prefixes {
            if entry.prefix.is_empty() || entry.datacenter.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "datacenter prefix entry {entry:?} has an empty field"
                )));
            }
        }

        if self.source.timeout_secs == 0 {
            return Err(ConfigError::Invalid("source.timeout_secs must be > 0".into()));
        }
        if self.source.page_size == 0 {
            return Err(ConfigError::Invalid("source.page_size must be > 0".into()));
        }
        if self.source.project.is_empty() || self.source.table_prefix.is_empty() {
            return Err(ConfigError::Invalid(
                "source.project and source.table_prefix are required".into(),
            ));
        }

        if let SinkConfig::Elasticsearch { timeout_secs: 0, .. } = self.sink {
            return Err(ConfigError::Invalid("sink.timeout_secs must be > 0".into()));
        }

        Ok(())
    }
}

fn default_exception_label() -> String {
    "mssql".to_string()
}

fn default_project() -> String {
    "artsyviet-prod".to_string()
}

fn default_table_prefix() -> String {
    "artsyviet-prod.vpc_flow_logs.compute_googleapis_com_vpc_flows_".to_string()
}

fn default_location() -> String {
    "US".to_string()
}

fn default_bigquery_endpoint() -> String {
    "https://bigquery.googleapis.com/bigquery/v2".to_string()
}

fn default_source_timeout() -> u64 {
    60
}

fn default_page_size() -> u32 {
    10_000
}

fn default_elasticsearch_url() -> String {
    "http://127.0.0.1:9200".to_string()
}

fn default_sink_timeout() -> u64 {
    30
}

fn default_mongodb_uri() -> String {
    "mongodb://localhost:27017".to_string()
}

fn default_mongodb_database() -> String {
    "interconnect".to_string()
}
