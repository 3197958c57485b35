//! Aggregates interconnect VPC flow logs by service, datacenter and region,
//! and publishes the totals as time-stamped documents.

pub mod aggregate;
pub mod classify;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod publish;
pub mod source;
