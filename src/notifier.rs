//! Outbound chat notifications for booking changes.
//!
//! The announcer is just another subscriber of the broadcast feed. A lagging
//! or failing notifier never holds up a write.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::FixedOffset;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};

use crate::engine::Engine;
use crate::labels::Labels;
use crate::message::{compose, placeholders, Announcement};
use crate::model::{NotifySettings, RealtimeEvent};
use crate::observability::{BROADCAST_LAGGED_TOTAL, NOTIFICATIONS_TOTAL};

const TELEGRAM_API: &str = "https://api.telegram.org";
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum NotifyError {
    Http(reqwest::Error),
    Status { status: u16, body: String },
}

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifyError::Http(e) => write!(f, "request failed: {e}"),
            NotifyError::Status { status, body } => write!(f, "HTTP {status}: {body}"),
        }
    }
}

impl std::error::Error for NotifyError {}

impl From<reqwest::Error> for NotifyError {
    fn from(e: reqwest::Error) -> Self {
        NotifyError::Http(e)
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;
    async fn send(&self, text: &str) -> Result<(), NotifyError>;
}

pub struct TelegramNotifier {
    client: reqwest::Client,
    url: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(token: &str, chat_id: String) -> Result<Self, NotifyError> {
        Self::with_base_url(TELEGRAM_API, token, chat_id)
    }

    pub fn with_base_url(base: &str, token: &str, chat_id: String) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(SEND_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: format!("{}/bot{token}/sendMessage", base.trim_end_matches('/')),
            chat_id,
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "HTML",
        });
        let response = self.client.post(&self.url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Writes notifications to the log. Used when no chat is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        tracing::info!(target: "baybook::notify", "{text}");
        Ok(())
    }
}

/// Builds the notifier for a set of runtime settings.
pub type Connect = dyn Fn(&NotifySettings) -> Result<Arc<dyn Notifier>, NotifyError> + Send + Sync;

/// Telegram when both token and chat id are set, the log otherwise.
pub fn telegram_or_log(settings: &NotifySettings) -> Result<Arc<dyn Notifier>, NotifyError> {
    if settings.token.is_empty() || settings.chat_id.is_empty() {
        return Ok(Arc::new(LogNotifier));
    }
    Ok(Arc::new(TelegramNotifier::new(&settings.token, settings.chat_id.clone())?))
}

/// What the announcer currently sends with.
struct Delivery {
    notifier: Arc<dyn Notifier>,
    template: Option<String>,
    /// Revision of the runtime settings applied, 0 for startup configuration.
    revision: u64,
}

pub struct Announcer {
    engine: Arc<Engine>,
    labels: Arc<Labels>,
    delivery: RwLock<Delivery>,
    connect: Box<Connect>,
    offset: FixedOffset,
}

impl Announcer {
    pub fn new(
        engine: Arc<Engine>,
        labels: Arc<Labels>,
        notifier: Arc<dyn Notifier>,
        template: Option<String>,
        offset: FixedOffset,
    ) -> Self {
        Self {
            engine,
            labels,
            delivery: RwLock::new(Delivery {
                notifier,
                template,
                revision: 0,
            }),
            connect: Box::new(telegram_or_log),
            offset,
        }
    }

    /// Replace how notifiers are built from runtime settings.
    pub fn with_connector<F>(mut self, connect: F) -> Self
    where
        F: Fn(&NotifySettings) -> Result<Arc<dyn Notifier>, NotifyError> + Send + Sync + 'static,
    {
        self.connect = Box::new(connect);
        self
    }

    /// Pick up settings saved since the last call. Saved settings take
    /// precedence over startup configuration.
    pub async fn refresh(&self) {
        let Some(settings) = self.engine.notify_settings().await else {
            return;
        };
        if settings.revision <= self.delivery.read().await.revision {
            return;
        }
        let notifier = match (self.connect)(&settings) {
            Ok(notifier) => notifier,
            Err(e) => {
                tracing::warn!(error = %e, "notifier rebuild failed, logging instead");
                Arc::new(LogNotifier)
            }
        };
        let mut delivery = self.delivery.write().await;
        if settings.revision > delivery.revision {
            tracing::info!(
                revision = settings.revision,
                notifier = notifier.name(),
                "notify settings applied"
            );
            *delivery = Delivery {
                notifier,
                template: settings.template,
                revision: settings.revision,
            };
        }
    }

    /// Message text for an event, or `None` if it is not announced.
    pub async fn message_for(&self, event: &RealtimeEvent) -> Option<String> {
        let announcement = Announcement::for_event(event)?;
        let booking = event.as_booking()?;
        let bay_name = match self.engine.get_bay(booking.bay_id).await {
            Ok(bay) if !bay.is_waiting_list() => bay.name,
            Ok(_) => "Waiting list".to_string(),
            Err(_) => String::new(),
        };
        let data = placeholders(booking, announcement, &bay_name, &self.labels, &self.offset);
        let delivery = self.delivery.read().await;
        Some(compose(delivery.template.as_deref(), announcement, &data))
    }

    /// Consume the feed until the hub is dropped. Each send runs on its own task.
    pub async fn run(self: Arc<Self>, mut rx: broadcast::Receiver<RealtimeEvent>) {
        self.refresh().await;
        let notifier_name = self.delivery.read().await.notifier.name();
        tracing::info!(notifier = notifier_name, "announcer started");
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(missed)) => {
                    metrics::counter!(BROADCAST_LAGGED_TOTAL).increment(missed);
                    tracing::warn!(missed, "announcer lagged, notifications dropped");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            self.refresh().await;
            let Some(text) = self.message_for(&event).await else {
                continue;
            };
            let notifier = self.delivery.read().await.notifier.clone();
            let kind = event.kind.as_str();
            tokio::spawn(async move {
                match notifier.send(&text).await {
                    Ok(()) => {
                        metrics::counter!(NOTIFICATIONS_TOTAL, "outcome" => "sent").increment(1);
                    }
                    Err(e) => {
                        metrics::counter!(NOTIFICATIONS_TOTAL, "outcome" => "failed").increment(1);
                        tracing::warn!(error = %e, kind, "notification failed");
                    }
                }
            });
        }
        tracing::info!("announcer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NewBooking;
    use crate::model::{EventKind, Ms};
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use std::sync::Mutex;

    const T: Ms = 1_741_959_000_000;
    const H: Ms = 3_600_000;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Notifier for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn send(&self, text: &str) -> Result<(), NotifyError> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    fn wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("baybook_test_notifier");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn setup(name: &str, template: Option<&str>) -> (Arc<Engine>, Arc<Recorder>, Announcer) {
        let hub = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(wal_path(name), hub).unwrap());
        let recorder = Arc::new(Recorder::default());
        let labels = Labels::from_json(r#"{"vehicles": {"v1": {"plate": "ABC-123"}}}"#).unwrap();
        let announcer = Announcer::new(
            engine.clone(),
            Arc::new(labels),
            recorder.clone(),
            template.map(String::from),
            FixedOffset::east_opt(0).unwrap(),
        );
        (engine, recorder, announcer)
    }

    fn draft(bay_id: ulid::Ulid) -> NewBooking {
        NewBooking {
            bay_id,
            vehicle_id: "v1".into(),
            start: T,
            end: Some(T + H),
            title: "Oil change".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn renders_template_with_bay_name() {
        let (engine, _, announcer) = setup("template.wal", Some("{status_icon} {unit} @ {bay_name}")).await;
        let bay = engine.create_bay("b1".into(), "Bay 1".into()).await.unwrap();
        let booking = engine.create_booking(draft(bay.id)).await.unwrap();

        let event = RealtimeEvent::booking(EventKind::BookingCreated, booking.clone());
        assert_eq!(announcer.message_for(&event).await.unwrap(), "🆕 ABC-123 @ Bay 1");

        let deleted = RealtimeEvent::booking_deleted(booking.id, bay.id);
        assert!(announcer.message_for(&deleted).await.is_none());
    }

    #[tokio::test]
    async fn announcer_follows_the_feed() {
        let (engine, recorder, announcer) = setup("feed.wal", None).await;
        let rx = engine.notify.subscribe_all();
        let task = tokio::spawn(Arc::new(announcer).run(rx));

        let bay = engine.create_bay("b1".into(), "Bay 1".into()).await.unwrap();
        let booking = engine.create_booking(draft(bay.id)).await.unwrap();
        engine.close_booking(booking.id, None).await.unwrap();

        for _ in 0..50 {
            if recorder.sent.lock().unwrap().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let sent = recorder.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2, "bay events are not announced: {sent:?}");
        assert!(sent.iter().any(|m| m.starts_with("🆕 <b>New booking</b>")));
        assert!(sent.iter().any(|m| m.starts_with("✅ <b>Booking ready</b>")));
        task.abort();
    }

    #[tokio::test]
    async fn saved_settings_swap_template_and_notifier() {
        let (engine, startup, announcer) = setup("settings.wal", Some("old {number}")).await;
        let swapped = Arc::new(Recorder::default());
        let connect_to = swapped.clone();
        let announcer = announcer.with_connector(move |s: &NotifySettings| {
            assert_eq!(s.chat_id, "-100");
            Ok(connect_to.clone() as Arc<dyn Notifier>)
        });
        let rx = engine.notify.subscribe_all();
        let task = tokio::spawn(Arc::new(announcer).run(rx));

        let bay = engine.create_bay("b1".into(), "Bay 1".into()).await.unwrap();
        let first = engine.create_booking(draft(bay.id)).await.unwrap();
        wait_for(&startup, 1).await;

        engine
            .set_notify_settings("123:abc".into(), "-100".into(), Some("new {number}".into()))
            .await
            .unwrap();
        engine.close_booking(first.id, None).await.unwrap();
        wait_for(&swapped, 1).await;

        assert_eq!(*startup.sent.lock().unwrap(), vec!["old 000001".to_string()]);
        assert_eq!(*swapped.sent.lock().unwrap(), vec!["new 000001".to_string()]);
        task.abort();
    }

    #[tokio::test]
    async fn blank_credentials_fall_back_to_the_log() {
        let settings = NotifySettings::default();
        assert_eq!(telegram_or_log(&settings).unwrap().name(), "log");
        let settings = NotifySettings {
            token: "123:abc".into(),
            chat_id: "-100".into(),
            ..Default::default()
        };
        assert_eq!(telegram_or_log(&settings).unwrap().name(), "telegram");
    }

    async fn wait_for(recorder: &Recorder, n: usize) {
        for _ in 0..50 {
            if recorder.sent.lock().unwrap().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
