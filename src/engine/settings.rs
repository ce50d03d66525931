use crate::limits::{MAX_NAME_LEN, MAX_TEXT_LEN};
use crate::model::*;

use super::conflict::now_ms;
use super::{Engine, EngineError};

impl Engine {
    /// Chat delivery settings last saved at runtime. `None` until the first save.
    pub async fn notify_settings(&self) -> Option<NotifySettings> {
        self.notify_settings.read().await.clone()
    }

    /// Replace the chat delivery settings. A blank template selects the built-in layout.
    pub async fn set_notify_settings(
        &self,
        token: String,
        chat_id: String,
        template: Option<String>,
    ) -> Result<NotifySettings, EngineError> {
        if token.len() > MAX_NAME_LEN || chat_id.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("notify credentials too long"));
        }
        let template = template.filter(|t| !t.trim().is_empty());
        if template.as_ref().is_some_and(|t| t.len() > MAX_TEXT_LEN) {
            return Err(EngineError::LimitExceeded("template too long"));
        }

        let mut current = self.notify_settings.write().await;
        let settings = NotifySettings {
            token: token.trim().to_string(),
            chat_id: chat_id.trim().to_string(),
            template,
            revision: current.as_ref().map_or(1, |s| s.revision + 1),
            updated_at: now_ms(),
        };
        self.wal_append(&Event::NotifySettingsSet {
            settings: settings.clone(),
        })
        .await?;
        *current = Some(settings.clone());
        tracing::info!(
            revision = settings.revision,
            chat = !settings.chat_id.is_empty(),
            custom_template = settings.template.is_some(),
            "notify settings updated"
        );
        Ok(settings)
    }
}
