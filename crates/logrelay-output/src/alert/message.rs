use chrono::{DateTime, SecondsFormat, Utc};
use logrelay_core::config::AppConfig;
use logrelay_core::{CorrelationKey, Severity};
use serde::Serialize;
use std::fmt;
use std::fmt::Write as _;

/// What an alert announces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertHeader {
    Started,
    Stopped,
    Error,
    Fatal,
}

impl AlertHeader {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertHeader::Started => "STARTED",
            AlertHeader::Stopped => "STOPPED",
            AlertHeader::Error => "ERROR",
            AlertHeader::Fatal => "FATAL",
        }
    }

    /// Header for an escalated entry; `None` below Error
    pub fn for_severity(severity: Severity) -> Option<Self> {
        match severity {
            Severity::Error => Some(AlertHeader::Error),
            Severity::Fatal => Some(AlertHeader::Fatal),
            _ => None,
        }
    }

    fn carries_context(&self) -> bool {
        matches!(self, AlertHeader::Error | AlertHeader::Fatal)
    }
}

impl fmt::Display for AlertHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An escalated message on its way to the alert transport
#[derive(Debug, Clone, Serialize)]
pub struct AlertMessage {
    pub header: AlertHeader,
    pub app_name: String,
    pub version: String,
    pub environment: String,
    pub instance_id: String,
    pub correlation_key: Option<CorrelationKey>,
    pub timestamp: DateTime<Utc>,
    /// Context lines, oldest first
    pub lines: Vec<String>,
}

impl AlertMessage {
    pub fn new(
        header: AlertHeader,
        app: &AppConfig,
        correlation_key: Option<CorrelationKey>,
        lines: Vec<String>,
    ) -> Self {
        Self {
            header,
            app_name: app.name.clone(),
            version: app.version.clone(),
            environment: app.environment.clone(),
            instance_id: app.instance_id.to_string(),
            correlation_key,
            timestamp: Utc::now(),
            lines,
        }
    }

    /// Lifecycle notice without context
    pub fn lifecycle(header: AlertHeader, app: &AppConfig) -> Self {
        Self::new(header, app, None, Vec::new())
    }

    /// Render as Telegram HTML
    pub fn render(&self) -> String {
        let mut buf = String::new();
        let _ = writeln!(buf, "<b>{}</b>", self.header);
        let _ = writeln!(buf, "<b>AppName:</b> {}", escape_html(&self.app_name));
        let _ = writeln!(buf, "<b>Version:</b> {}", escape_html(&self.version));
        let _ = writeln!(buf, "<b>Environment:</b> {}", escape_html(&self.environment));
        let _ = writeln!(buf, "<b>InstanceID:</b> {}", self.instance_id);
        let _ = writeln!(
            buf,
            "<b>Timestamp:</b> {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
        );

        if self.header.carries_context() {
            let request_id = self
                .correlation_key
                .map(|k| k.to_string())
                .unwrap_or_else(|| "-".to_string());
            let _ = writeln!(buf, "<b>RequestID:</b> {}", request_id);
            buf.push_str("<b>Log stack:</b>\n");

            let budget = MAX_MESSAGE_CHARS.saturating_sub(buf.chars().count());
            buf.push_str(&render_stack(&self.lines, budget));
        }

        buf
    }
}

/// Longest text Telegram accepts in one `sendMessage`
pub const MAX_MESSAGE_CHARS: usize = 4096;

/// Room kept for the omission marker when the stack does not fit
const MARKER_RESERVE: usize = 48;

/// Context lines as `<code>` rows within `budget` characters
///
/// When everything does not fit the newest lines win and a marker counts
/// the dropped ones. A newest line that alone exceeds the budget is cut.
fn render_stack(lines: &[String], budget: usize) -> String {
    let rows: Vec<String> = lines
        .iter()
        .map(|line| format!("<code>{}</code>\n", escape_html(line)))
        .collect();
    let total: usize = rows.iter().map(|row| row.chars().count()).sum();
    if total <= budget {
        return rows.concat();
    }

    let mut room = budget.saturating_sub(MARKER_RESERVE);
    let mut kept = 0;
    for row in rows.iter().rev() {
        let len = row.chars().count();
        if len > room {
            break;
        }
        room -= len;
        kept += 1;
    }

    let mut out = String::new();
    let omitted = rows.len() - kept;
    if kept == 0 {
        if let Some(newest) = lines.last() {
            let _ = writeln!(out, "<i>… {} earlier lines omitted</i>", omitted - 1);
            let wrapper = "<code></code>\n".len() + 1;
            let limit = room.saturating_sub(wrapper);
            let _ = writeln!(out, "<code>{}…</code>", truncate_escaped(newest, limit));
        }
        return out;
    }

    let _ = writeln!(out, "<i>… {} earlier lines omitted</i>", omitted);
    for row in &rows[rows.len() - kept..] {
        out.push_str(row);
    }
    out
}

/// Escape `line`, stopping before the escaped text exceeds `limit` chars
fn truncate_escaped(line: &str, limit: usize) -> String {
    let mut out = String::new();
    let mut used = 0;
    let mut utf8 = [0u8; 4];
    for c in line.chars() {
        let piece = escape_html(c.encode_utf8(&mut utf8));
        let len = piece.chars().count();
        if used + len > limit {
            break;
        }
        used += len;
        out.push_str(&piece);
    }
    out
}

/// Escape the characters Telegram's HTML parse mode treats as markup
fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}
