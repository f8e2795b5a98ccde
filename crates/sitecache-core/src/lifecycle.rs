//! Lifecycle notifications relayed to the hosting application.
//!
//! One [`LifecycleEvent`] is emitted per transition. The host decides how to surface
//! it; [`LifecycleEvent::notification`] gives the standard user-facing rendering
//! (a non-blocking toast, with a reload action once an update is installed).

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LifecycleEvent {
    /// The worker is active and controlling requests
    Ready,
    Registered,
    /// First install finished; the app now works offline
    Cached,
    /// A new build was found and is being downloaded
    UpdateAvailable,
    /// A new build is installed; a reload picks it up
    Updated,
    Offline,
    Online,
    Error { detail: String },
    RequestQueued { url: String },
    RequestReplayed { url: String },
    /// A queued request outlived the retention window and was discarded
    RequestExpired { url: String },
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::Ready => "ready",
            LifecycleEvent::Registered => "registered",
            LifecycleEvent::Cached => "cached",
            LifecycleEvent::UpdateAvailable => "updateAvailable",
            LifecycleEvent::Updated => "updated",
            LifecycleEvent::Offline => "offline",
            LifecycleEvent::Online => "online",
            LifecycleEvent::Error { .. } => "error",
            LifecycleEvent::RequestQueued { .. } => "requestQueued",
            LifecycleEvent::RequestReplayed { .. } => "requestReplayed",
            LifecycleEvent::RequestExpired { .. } => "requestExpired",
        }
    }

    /// User-visible notification for this event, `None` for log-only events
    pub fn notification(&self) -> Option<Notification> {
        match self {
            LifecycleEvent::UpdateAvailable => Some(Notification {
                level: NotificationLevel::Info,
                message: "Update found. Downloading...".to_string(),
                icon: Some("update".to_string()),
                action: None,
            }),
            LifecycleEvent::Updated => Some(Notification {
                level: NotificationLevel::Positive,
                message: "Update installed. Please refresh.".to_string(),
                icon: Some("refresh".to_string()),
                action: Some(NotificationAction::Reload),
            }),
            LifecycleEvent::Offline => Some(Notification {
                level: NotificationLevel::Warning,
                message: "No internet connection found. App is running in offline mode.".to_string(),
                icon: Some("wifi_off".to_string()),
                action: None,
            }),
            LifecycleEvent::Error { .. } => Some(Notification {
                level: NotificationLevel::Warning,
                message: "Error during app initialisation.".to_string(),
                icon: Some("report_problem".to_string()),
                action: None,
            }),
            LifecycleEvent::Ready
            | LifecycleEvent::Registered
            | LifecycleEvent::Cached
            | LifecycleEvent::Online
            | LifecycleEvent::RequestQueued { .. }
            | LifecycleEvent::RequestReplayed { .. }
            | LifecycleEvent::RequestExpired { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub enum NotificationLevel {
    Info,
    Positive,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub enum NotificationAction {
    Reload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
    pub icon: Option<String>,
    pub action: Option<NotificationAction>,
}

/// Receiver of lifecycle events. Must not block: it is called from request handling.
pub trait LifecycleSink: Send + Sync {
    fn notify(&self, event: &LifecycleEvent);
}

/// Writes every event to the log
#[derive(Debug, Default)]
pub struct TracingSink;

impl LifecycleSink for TracingSink {
    fn notify(&self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::Ready => info!("Offline layer is active"),
            LifecycleEvent::Registered => info!("Offline layer has been registered"),
            LifecycleEvent::Cached => info!("Content has been cached for offline use"),
            LifecycleEvent::UpdateAvailable => info!("App update found"),
            LifecycleEvent::Updated => info!("App update complete"),
            LifecycleEvent::Offline => warn!("App is running in offline mode"),
            LifecycleEvent::Online => info!("Connectivity restored"),
            LifecycleEvent::Error { detail } => error!(detail = %detail, "Error during offline layer registration"),
            LifecycleEvent::RequestQueued { url } => info!(url = %url, "Request queued for replay"),
            LifecycleEvent::RequestReplayed { url } => info!(url = %url, "Queued request replayed"),
            LifecycleEvent::RequestExpired { url } => warn!(url = %url, "Queued request expired unreplayed"),
        }
    }
}

/// Forwards events to the hosting application over a bounded channel
pub struct ChannelSink {
    tx: mpsc::Sender<LifecycleEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<LifecycleEvent>) -> Self {
        Self { tx }
    }
}

impl LifecycleSink for ChannelSink {
    fn notify(&self, event: &LifecycleEvent) {
        if let Err(e) = self.tx.try_send(event.clone()) {
            warn!(event = event.name(), error = %e, "Dropped lifecycle event");
        }
    }
}

/// Keeps every event in memory, in emission order
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(LifecycleEvent::name).collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl LifecycleSink for MemorySink {
    fn notify(&self, event: &LifecycleEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_string(&LifecycleEvent::UpdateAvailable).unwrap();
        assert_eq!(json, r#"{"type":"updateAvailable"}"#);

        let json = serde_json::to_string(&LifecycleEvent::Error {
            detail: "quota exceeded".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"error","detail":"quota exceeded"}"#);
    }

    #[test]
    fn test_updated_offers_reload() {
        let notification = LifecycleEvent::Updated.notification().unwrap();
        assert_eq!(notification.level, NotificationLevel::Positive);
        assert_eq!(notification.action, Some(NotificationAction::Reload));
    }

    #[test]
    fn test_log_only_events() {
        assert!(LifecycleEvent::Ready.notification().is_none());
        assert!(LifecycleEvent::Cached.notification().is_none());
        assert!(LifecycleEvent::RequestExpired { url: "x".into() }.notification().is_none());
        assert_eq!(
            LifecycleEvent::Offline.notification().unwrap().level,
            NotificationLevel::Warning
        );
        assert_eq!(
            LifecycleEvent::Error { detail: "x".into() }.notification().unwrap().icon.as_deref(),
            Some("report_problem")
        );
    }

    #[tokio::test]
    async fn test_channel_sink_forwards_and_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = ChannelSink::new(tx);
        sink.notify(&LifecycleEvent::Offline);
        sink.notify(&LifecycleEvent::Online);

        assert_eq!(rx.recv().await, Some(LifecycleEvent::Offline));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_memory_sink_order() {
        let sink = MemorySink::new();
        sink.notify(&LifecycleEvent::Registered);
        sink.notify(&LifecycleEvent::Cached);
        assert_eq!(sink.names(), vec!["registered", "cached"]);
        sink.clear();
        assert!(sink.events().is_empty());
    }
}
