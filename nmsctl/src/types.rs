//! Common type definitions shared across the crate.
//!
//! This module defines:
//! - Type aliases for entity IDs (CredentialId, DiscoveryId, etc.)
//! - The closed enumerations stored in the database and exchanged with the plugin
//!
//! # ID Types
//!
//! All entity IDs are Postgres `SERIAL` integers wrapped in type aliases:
//!
//! - [`CredentialId`]: Device credential identifier
//! - [`DiscoveryId`]: Discovery identifier
//! - [`MonitorId`]: Provisioned device identifier
//! - [`MetricGroupId`]: Metric group identifier (also the Monitor Cache key)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// Type aliases for IDs
pub type CredentialId = i32;
pub type DiscoveryId = i32;
pub type MonitorId = i32;
pub type MetricGroupId = i32;

/// The fixed set of metric categories polled for every monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "VARCHAR", rename_all = "UPPERCASE")]
pub enum MetricType {
    CpuInfo,
    CpuUsage,
    Uptime,
    Memory,
    Disk,
    Process,
    Network,
    SystemInfo,
}

impl MetricType {
    /// Every metric type, in the order groups are created for a new monitor.
    pub const ALL: [MetricType; 8] = [
        MetricType::CpuInfo,
        MetricType::CpuUsage,
        MetricType::Uptime,
        MetricType::Memory,
        MetricType::Disk,
        MetricType::Process,
        MetricType::Network,
        MetricType::SystemInfo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::CpuInfo => "CPUINFO",
            MetricType::CpuUsage => "CPUUSAGE",
            MetricType::Uptime => "UPTIME",
            MetricType::Memory => "MEMORY",
            MetricType::Disk => "DISK",
            MetricType::Process => "PROCESS",
            MetricType::Network => "NETWORK",
            MetricType::SystemInfo => "SYSTEMINFO",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown metric type '{s}'"))
    }
}

/// How the `ip` field of a discovery is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "VARCHAR", rename_all = "UPPERCASE")]
pub enum IpType {
    /// A single address
    Single,
    /// `"start-end"`, inclusive
    Range,
    /// `"addr/prefix"`, IPv4 only
    Cidr,
}

/// Pipeline-level status of a discovery. Only the pipeline moves it out of `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "VARCHAR", rename_all = "UPPERCASE")]
pub enum DiscoveryStatus {
    Pending,
    Completed,
    Failed,
}

impl fmt::Display for DiscoveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryStatus::Pending => f.write_str("PENDING"),
            DiscoveryStatus::Completed => f.write_str("COMPLETED"),
            DiscoveryStatus::Failed => f.write_str("FAILED"),
        }
    }
}

/// Per-IP outcome of a discovery run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "VARCHAR", rename_all = "UPPERCASE")]
pub enum ResultStatus {
    Completed,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_type_wire_names() {
        assert_eq!(serde_json::to_string(&MetricType::CpuInfo).unwrap(), "\"CPUINFO\"");
        assert_eq!(serde_json::to_string(&MetricType::SystemInfo).unwrap(), "\"SYSTEMINFO\"");
        let parsed: MetricType = serde_json::from_str("\"UPTIME\"").unwrap();
        assert_eq!(parsed, MetricType::Uptime);
    }

    #[test]
    fn metric_type_from_str_is_case_insensitive() {
        assert_eq!("disk".parse::<MetricType>().unwrap(), MetricType::Disk);
        assert_eq!("CpuUsage".parse::<MetricType>().unwrap(), MetricType::CpuUsage);
        assert!("GPU".parse::<MetricType>().is_err());
    }

    #[test]
    fn display_matches_serde() {
        for t in MetricType::ALL {
            assert_eq!(serde_json::to_string(&t).unwrap(), format!("\"{t}\""));
        }
    }
}
