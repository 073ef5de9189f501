use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;

use crate::{
    delivery::DeliveryRecord, errors::Error, ports::DeliveryLogSink, store::ensure_parent, Result,
};

// ============== Timestamp Helpers ==============

/// RFC3339 timestamp in UTC (for logs/telemetry).
pub fn iso_timestamp_utc() -> String {
    Utc::now().to_rfc3339()
}

// ============== Text Helpers ==============

/// Cut `s` to `max_len` chars, marking the cut with `...`.
pub fn truncate_text(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let mut out = s.chars().take(max_len).collect::<String>();
    out.push_str("...");
    out
}

// ============== Delivery Log File ==============

const DETAIL_MAX_TEXT: usize = 500;

/// Append-only delivery log: JSON lines, or a readable key/value block per record.
#[derive(Clone, Debug)]
pub struct JsonlDeliverySink {
    path: PathBuf,
    json: bool,
}

impl JsonlDeliverySink {
    pub fn new(path: impl Into<PathBuf>, json: bool) -> Self {
        Self {
            path: path.into(),
            json,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn render(&self, record: &DeliveryRecord) -> Result<String> {
        if self.json {
            let mut line = serde_json::to_string(record)?;
            line.push('\n');
            return Ok(line);
        }

        // Plain text format for readability.
        let mut out = String::new();
        out.push('\n');
        out.push_str(&"=".repeat(60));

        let value = serde_json::to_value(record)?;
        let Some(obj) = value.as_object() else {
            return Err(Error::External(
                "delivery record is not a JSON object".to_string(),
            ));
        };
        for (k, v) in obj {
            out.push('\n');
            out.push_str(k);
            out.push_str(": ");
            out.push_str(&json_value_to_display(v));
        }
        out.push('\n');
        Ok(out)
    }
}

#[async_trait]
impl DeliveryLogSink for JsonlDeliverySink {
    async fn write(&self, mut record: DeliveryRecord) -> Result<()> {
        if let Some(s) = &record.detail {
            record.detail = Some(truncate_text(s, DETAIL_MAX_TEXT));
        }
        let out = self.render(&record)?;

        ensure_parent(&self.path).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(out.as_bytes()).await?;
        Ok(())
    }
}

fn json_value_to_display(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::Null => "null".to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s.to_string(),
        other => serde_json::to_string(other).unwrap_or_else(|_| "<unprintable>".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{delivery::DeliveryResult, domain::RecipientId};

    fn tmp_file(prefix: &str) -> PathBuf {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or(Duration::from_secs(0))
            .as_nanos();
        let pid = std::process::id();
        PathBuf::from(format!("/tmp/{prefix}-{pid}-{ts}.log"))
    }

    fn failed(detail: &str) -> DeliveryRecord {
        DeliveryRecord {
            timestamp: iso_timestamp_utc(),
            recipient: RecipientId(77),
            result: DeliveryResult::TransientFailure,
            elapsed_ms: 12,
            detail: Some(detail.to_string()),
            retry_after: Some(90.0),
        }
    }

    #[test]
    fn truncate_text_counts_chars_and_adds_ellipsis() {
        let s = "ж".repeat(DETAIL_MAX_TEXT + 10);
        let t = truncate_text(&s, DETAIL_MAX_TEXT);
        assert!(t.ends_with("..."));
        assert_eq!(t.chars().count(), DETAIL_MAX_TEXT + 3);
        assert_eq!(truncate_text("short", 10), "short");
    }

    #[tokio::test]
    async fn json_sink_appends_one_line_per_record_with_truncated_detail() {
        let sink = JsonlDeliverySink::new(tmp_file("warmcast-delivery"), true);
        sink.write(failed(&"x".repeat(DETAIL_MAX_TEXT + 1))).await.unwrap();
        sink.write(failed("bad gateway")).await.unwrap();

        let written = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: DeliveryRecord = serde_json::from_str(lines[0]).unwrap();
        assert!(first.detail.unwrap().ends_with("..."));
        assert_eq!(first.retry_after, Some(90.0));
        let _ = std::fs::remove_file(sink.path());
    }

    #[tokio::test]
    async fn plain_sink_writes_key_value_blocks() {
        let sink = JsonlDeliverySink::new(tmp_file("warmcast-delivery-plain"), false);
        sink.write(failed("bad gateway")).await.unwrap();
        let written = std::fs::read_to_string(sink.path()).unwrap();
        assert!(written.contains("result: transient_failure"));
        assert!(written.contains("recipient: 77"));
        let _ = std::fs::remove_file(sink.path());
    }
}
