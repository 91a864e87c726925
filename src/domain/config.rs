use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::{Host, Url};

use crate::config::{DurationValue, parse_duration_value};
use crate::error::ValidationError;

use super::PositiveU64;

/// Parameters agreed by the leader for one cycle. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    pub workload: String,
    pub database: DatabaseTarget,
    pub threads: PositiveU64,
    pub tables: PositiveU64,
    pub scale: PositiveU64,
    pub duration: DurationBound,
    #[serde(default)]
    pub custom_script: Option<PathBuf>,
}

impl BenchmarkConfig {
    /// Name of the first field that differs from `other`, if any.
    #[must_use]
    pub fn first_difference(&self, other: &BenchmarkConfig) -> Option<&'static str> {
        if self.workload != other.workload {
            return Some("workload");
        }
        if self.database.kind != other.database.kind {
            return Some("database.kind");
        }
        if self.database.endpoint != other.database.endpoint {
            return Some("database.endpoint");
        }
        if self.database.name != other.database.name {
            return Some("database.name");
        }
        if self.database.user != other.database.user
            || self.database.password != other.database.password
        {
            return Some("database.credentials");
        }
        if self.threads != other.threads {
            return Some("threads");
        }
        if self.tables != other.tables {
            return Some("tables");
        }
        if self.scale != other.scale {
            return Some("scale");
        }
        if self.duration != other.duration {
            return Some("duration");
        }
        if self.custom_script != other.custom_script {
            return Some("custom_script");
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseTarget {
    pub kind: DatabaseKind,
    pub endpoint: DatabaseEndpoint,
    #[serde(deserialize_with = "non_empty")]
    pub name: String,
    #[serde(deserialize_with = "non_empty")]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

fn non_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    if value.trim().is_empty() {
        return Err(serde::de::Error::custom("must not be empty"));
    }
    Ok(value)
}

/// Database variant. Resolved once by the workload resolver.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DatabaseKind {
    MySql,
    PostgreSql,
    Other(String),
}

impl DatabaseKind {
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            DatabaseKind::MySql => "mysql",
            DatabaseKind::PostgreSql => "postgresql",
            DatabaseKind::Other(name) => name.as_str(),
        }
    }
}

impl std::fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl std::str::FromStr for DatabaseKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim().to_ascii_lowercase();
        match value.as_str() {
            "mysql" | "mariadb" => Ok(DatabaseKind::MySql),
            "postgresql" | "postgres" | "pgsql" => Ok(DatabaseKind::PostgreSql),
            _ => {
                let valid = !value.is_empty()
                    && value
                        .chars()
                        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
                if valid {
                    Ok(DatabaseKind::Other(value))
                } else {
                    Err(ValidationError::InvalidDatabaseKind {
                        value: s.to_owned(),
                    })
                }
            }
        }
    }
}

impl TryFrom<String> for DatabaseKind {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DatabaseKind> for String {
    fn from(value: DatabaseKind) -> Self {
        value.label().to_owned()
    }
}

/// Where the database listens: `host:port` or a unix socket (`unix:///path`,
/// `file:///path`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DatabaseEndpoint {
    Tcp { host: String, port: u16 },
    UnixSocket { path: PathBuf },
}

impl std::str::FromStr for DatabaseEndpoint {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim();
        let invalid = |reason: &str| ValidationError::InvalidEndpoint {
            value: value.to_owned(),
            reason: reason.to_owned(),
        };
        if let Some(path) = value
            .strip_prefix("unix://")
            .or_else(|| value.strip_prefix("file://"))
        {
            if path.is_empty() {
                return Err(invalid("socket path is empty"));
            }
            return Ok(DatabaseEndpoint::UnixSocket {
                path: PathBuf::from(path),
            });
        }

        let candidate = if value.contains("://") {
            value.to_owned()
        } else {
            format!("tcp://{}", value)
        };
        let parsed = Url::parse(&candidate).map_err(|err| invalid(&err.to_string()))?;
        let host = match parsed.host() {
            Some(Host::Domain(domain)) => domain.to_owned(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            None => return Err(invalid("missing host")),
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = parsed.port().ok_or_else(|| invalid("missing port"))?;
        Ok(DatabaseEndpoint::Tcp { host, port })
    }
}

impl std::fmt::Display for DatabaseEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseEndpoint::Tcp { host, port } if host.contains(':') => {
                write!(f, "[{}]:{}", host, port)
            }
            DatabaseEndpoint::Tcp { host, port } => write!(f, "{}:{}", host, port),
            DatabaseEndpoint::UnixSocket { path } => write!(f, "unix://{}", path.display()),
        }
    }
}

impl TryFrom<String> for DatabaseEndpoint {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DatabaseEndpoint> for String {
    fn from(value: DatabaseEndpoint) -> Self {
        value.to_string()
    }
}

/// How long the engine runs: a fixed bound or until an explicit `stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "DurationValue", into = "String")]
pub enum DurationBound {
    For(Duration),
    UntilStopped,
}

impl DurationBound {
    #[must_use]
    pub const fn as_duration(self) -> Option<Duration> {
        match self {
            DurationBound::For(duration) => Some(duration),
            DurationBound::UntilStopped => None,
        }
    }

    /// Engine `--time` argument; sysbench treats `0` as unbounded.
    #[must_use]
    pub const fn engine_seconds(self) -> u64 {
        match self {
            DurationBound::For(duration) => duration.as_secs(),
            DurationBound::UntilStopped => 0,
        }
    }
}

impl std::str::FromStr for DurationBound {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "until-stopped" | "until_stopped" | "0" => Ok(DurationBound::UntilStopped),
            other => parse_duration_value(other).map(DurationBound::For),
        }
    }
}

impl TryFrom<DurationValue> for DurationBound {
    type Error = ValidationError;

    fn try_from(value: DurationValue) -> Result<Self, Self::Error> {
        match value {
            DurationValue::Seconds(0) => Ok(DurationBound::UntilStopped),
            DurationValue::Seconds(secs) => Ok(DurationBound::For(Duration::from_secs(secs))),
            DurationValue::Text(text) => text.parse(),
        }
    }
}

impl std::fmt::Display for DurationBound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DurationBound::For(duration) if duration.subsec_millis() == 0 => {
                write!(f, "{}s", duration.as_secs())
            }
            DurationBound::For(duration) => write!(f, "{}ms", duration.as_millis()),
            DurationBound::UntilStopped => f.write_str("until-stopped"),
        }
    }
}

impl From<DurationBound> for String {
    fn from(value: DurationBound) -> Self {
        value.to_string()
    }
}
