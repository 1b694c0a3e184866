use crate::config::CaptureMode;
use serde::Serialize;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Loading,
    Ready,
    Error,
}

/// One captured state of the mesh page.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub png: Vec<u8>,
    /// Only filled in live mode.
    pub html: Option<String>,
    pub url: String,
    pub captured_at_unix: u64,
}

/// Everything the web server needs, published by the capture worker.
#[derive(Debug, Clone, Default)]
pub struct BridgeFrame {
    pub status: SessionStatus,
    pub message: Option<String>,
    pub logged_in: bool,
    pub mode: CaptureMode,
    pub consecutive_failures: u32,
    pub session_started_unix: Option<u64>,
    pub snapshot: Option<Arc<Snapshot>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub logged_in: bool,
    pub mode: CaptureMode,
    pub consecutive_failures: u32,
    pub session_started_unix: Option<u64>,
    pub last_capture_unix: Option<u64>,
}

impl BridgeFrame {
    pub fn status_view(&self) -> StatusView {
        StatusView {
            status: self.status,
            message: self.message.clone(),
            logged_in: self.logged_in,
            mode: self.mode,
            consecutive_failures: self.consecutive_failures,
            session_started_unix: self.session_started_unix,
            last_capture_unix: self.snapshot.as_ref().map(|s| s.captured_at_unix),
        }
    }
}

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_view_serializes_lowercase_and_skips_empty_message() {
        let frame = BridgeFrame {
            status: SessionStatus::Ready,
            logged_in: true,
            mode: CaptureMode::Live,
            snapshot: Some(Arc::new(Snapshot {
                png: vec![1, 2, 3],
                html: None,
                url: "http://fritz.box/#/mesh".to_string(),
                captured_at_unix: 1_700_000_000,
            })),
            ..BridgeFrame::default()
        };
        let json = serde_json::to_value(frame.status_view()).unwrap();
        assert_eq!(json["status"], "ready");
        assert_eq!(json["mode"], "live");
        assert_eq!(json["last_capture_unix"], 1_700_000_000u64);
        assert!(json.get("message").is_none());
    }
}
