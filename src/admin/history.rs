use crate::persistence::{clamp_history_limit, AuditLog, CommandLogEntry, MessageLogEntry, StoreError};
use std::sync::Arc;
use tracing::debug;

/// Read side of the audit trail
pub struct AuditReader {
    audit: Arc<dyn AuditLog>,
}

impl AuditReader {
    pub fn new(audit: Arc<dyn AuditLog>) -> Self {
        Self { audit }
    }

    /// Newest first; `limit` is clamped to `1..=500`
    pub async fn recent_messages(&self, limit: usize) -> Result<Vec<MessageLogEntry>, StoreError> {
        let limit = clamp_history_limit(limit);
        debug!("Reading last {} bus messages", limit);
        self.audit.recent_messages(limit).await
    }

    /// Newest first; `limit` is clamped to `1..=500`
    pub async fn recent_commands(&self, limit: usize) -> Result<Vec<CommandLogEntry>, StoreError> {
        let limit = clamp_history_limit(limit);
        debug!("Reading last {} commands", limit);
        self.audit.recent_commands(limit).await
    }
}
