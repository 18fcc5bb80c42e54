use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Severity of a log call, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[serde(alias = "debug", alias = "Debug")]
    Debug,
    #[serde(alias = "info", alias = "Info")]
    Info,
    #[serde(alias = "warning", alias = "Warning", alias = "WARN", alias = "warn")]
    Warning,
    #[serde(alias = "error", alias = "Error")]
    Error,
    #[serde(alias = "fatal", alias = "Fatal")]
    Fatal,
}

impl Severity {
    /// Upper-case name as written into log lines
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
        }
    }

    /// Whether a sink with `minimum` as its threshold accepts this severity
    pub fn admitted_by(&self, minimum: Severity) -> bool {
        *self >= minimum
    }

    /// Error and Fatal escalate on the alert channel
    pub fn is_escalation(&self) -> bool {
        *self >= Severity::Error
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a severity name is not recognised
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseSeverityError(pub String);

impl fmt::Display for ParseSeverityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown severity '{}'", self.0)
    }
}

impl std::error::Error for ParseSeverityError {}

impl FromStr for Severity {
    type Err = ParseSeverityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "debug" => Ok(Severity::Debug),
            "info" => Ok(Severity::Info),
            "warn" | "warning" => Ok(Severity::Warning),
            "error" | "err" => Ok(Severity::Error),
            "fatal" => Ok(Severity::Fatal),
            _ => Err(ParseSeverityError(s.to_string())),
        }
    }
}

/// Groups the log lines of one logical request
///
/// Syntactically a UUID. Only ever produced by [`CorrelationKey::extract`]
/// or by wrapping an existing [`Uuid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationKey(Uuid);

impl CorrelationKey {
    /// A fresh random key, handy for request middleware
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Split a leading correlation key off a message
    ///
    /// The first whitespace-delimited token is taken as the key when it parses
    /// as a UUID; the returned body is the remainder with that token and the
    /// separator that follows it removed. Anything else is uncorrelated and the
    /// message is returned whole.
    pub fn extract(message: &str) -> (Option<CorrelationKey>, &str) {
        let (token, rest) = match message.find(char::is_whitespace) {
            Some(idx) => {
                let sep_len = message[idx..]
                    .chars()
                    .next()
                    .map(char::len_utf8)
                    .unwrap_or(1);
                (&message[..idx], &message[idx + sep_len..])
            }
            None => (message, ""),
        };

        if token.is_empty() {
            return (None, message);
        }

        match Uuid::parse_str(token) {
            Ok(id) => (Some(CorrelationKey(id)), rest),
            Err(_) => (None, message),
        }
    }
}

impl From<Uuid> for CorrelationKey {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One log call, built once and handed to every admitting sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Severity of the call
    pub severity: Severity,

    /// When the call was made
    pub timestamp: DateTime<Utc>,

    /// The message exactly as the caller passed it
    pub raw: String,

    /// Key recognised at the start of the message, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_key: Option<CorrelationKey>,
}

impl LogEntry {
    /// Create an entry stamped with the current time
    pub fn new(severity: Severity, raw: impl Into<String>) -> Self {
        Self::at(severity, raw, Utc::now())
    }

    /// Create an entry with an explicit timestamp
    pub fn at(severity: Severity, raw: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        let raw = raw.into();
        let (correlation_key, _) = CorrelationKey::extract(&raw);
        Self {
            severity,
            timestamp,
            raw,
            correlation_key,
        }
    }

    /// The message without its correlation key prefix
    pub fn body(&self) -> &str {
        match self.correlation_key {
            Some(_) => CorrelationKey::extract(&self.raw).1,
            None => &self.raw,
        }
    }

    /// Timestamp rendered as RFC 3339 with nanoseconds
    pub fn timestamp_rfc3339(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
    }

    /// `<timestamp> <SEVERITY> [<body>]`, the line kept as alert context
    pub fn context_line(&self) -> String {
        format!(
            "{} {} [{}]",
            self.timestamp_rfc3339(),
            self.severity,
            self.body()
        )
    }
}

/// Join displayable values into one line, separated by single spaces
pub fn concat(values: &[&dyn fmt::Display]) -> String {
    let mut line = String::new();
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            line.push(' ');
        }
        line.push_str(&value.to_string());
    }
    line
}
