use crate::{error::Result, store::Store, types::UserCredential};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// The operator new workouts are attributed to
///
/// Shared by the admin surface, which selects an operator, and the workout
/// subscriber, which reads it. Clones share the same selection.
#[derive(Debug, Clone)]
pub struct OperatorContext {
    current: Arc<RwLock<Option<UserCredential>>>,
    default_uuid: String,
}

impl OperatorContext {
    /// Create a context with nobody selected
    #[must_use]
    pub fn new(default_uuid: impl Into<String>) -> Self {
        Self {
            current: Arc::new(RwLock::new(None)),
            default_uuid: default_uuid.into(),
        }
    }

    /// Select a registered operator
    ///
    /// # Errors
    ///
    /// Returns [`crate::ErgbookError::NotFound`] if `uuid` is not a registered
    /// user; the previous selection is kept.
    pub async fn select(&self, store: &Store, uuid: &str) -> Result<UserCredential> {
        let user = store.get_user(uuid)?;
        self.set(user.clone()).await;
        Ok(user)
    }

    /// Replace the selection without checking the store
    pub async fn set(&self, user: UserCredential) {
        info!(uuid = %user.uuid, "set current operator");
        *self.current.write().await = Some(user);
    }

    /// Clear the selection
    pub async fn reset(&self) {
        *self.current.write().await = None;
    }

    /// The selected operator, if any
    pub async fn current(&self) -> Option<UserCredential> {
        self.current.read().await.clone()
    }

    /// UUID of the selected operator, or the default one
    pub async fn current_uuid(&self) -> String {
        if let Some(user) = self.current.read().await.as_ref() {
            return user.uuid.clone();
        }
        warn!(default = %self.default_uuid, "no current operator");
        self.default_uuid.clone()
    }

    /// UUID used when nobody is selected
    #[must_use]
    pub fn default_uuid(&self) -> &str {
        &self.default_uuid
    }
}
