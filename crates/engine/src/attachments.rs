use engram_store::{AttachmentFilter, AttachmentListItem, AttachmentRecord, PageOf};
use uuid::Uuid;

use crate::error::EngineError;
use crate::MemoryEngine;

/// Attachment CRUD with the configured size ceiling applied.  These work
/// even when the vector store and LLM are down.
impl MemoryEngine {
    pub async fn create_attachment(
        &self,
        id: Option<Uuid>,
        content: &str,
    ) -> Result<AttachmentRecord, EngineError> {
        let settings = self.config().current().await;
        Ok(self
            .store()
            .create_attachment(id, content, settings.attachments.max_size_bytes())
            .await?)
    }

    pub async fn get_attachment(&self, id: Uuid) -> Result<AttachmentRecord, EngineError> {
        Ok(self.store().require_attachment(id).await?)
    }

    pub async fn update_attachment(
        &self,
        id: Uuid,
        content: &str,
    ) -> Result<AttachmentRecord, EngineError> {
        let settings = self.config().current().await;
        Ok(self
            .store()
            .update_attachment(id, content, settings.attachments.max_size_bytes())
            .await?)
    }

    pub async fn delete_attachment(&self, id: Uuid) -> Result<bool, EngineError> {
        Ok(self.store().delete_attachment(id).await?)
    }

    pub async fn filter_attachments(
        &self,
        filter: &AttachmentFilter,
    ) -> Result<PageOf<AttachmentListItem>, EngineError> {
        Ok(self.store().filter_attachments(filter).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{engine_with, scripted, EngineHarness};
    use anyhow::Result;
    use engram_config::Settings;
    use engram_store::StoreError;

    #[tokio::test]
    async fn ceiling_comes_from_the_live_settings() -> Result<()> {
        let EngineHarness { engine, .. } = engine_with(scripted()).await?;
        let mut settings = Settings::default();
        settings.attachments.max_size_mb = 0;
        engine.config().update(settings).await?;

        let err = engine.create_attachment(None, "anything").await.unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::PayloadTooLarge { .. })));
        Ok(())
    }
}
