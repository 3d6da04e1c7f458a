use crate::db::models::{ConversationId, ConversationSummary, Message};
use crate::db::{ConversationStore, StoreError};
use crate::session::{DispatchOutcome, SessionController, SessionError};
use tokio_util::sync::CancellationToken;

/// Explicit id, or the most recent conversation (created if there is none).
pub fn resolve_conversation(
    store: &ConversationStore,
    requested: Option<ConversationId>,
) -> Result<ConversationId, StoreError> {
    match requested {
        Some(id) if store.messages(id).is_some() => Ok(id),
        Some(id) => Err(StoreError::NotFound(id)),
        None => store.active_or_create(),
    }
}

pub fn create_conversation(store: &ConversationStore) -> Result<ConversationId, StoreError> {
    store.create_conversation()
}

pub fn list_conversations(store: &ConversationStore) -> Vec<ConversationSummary> {
    store.summaries()
}

pub fn get_messages(
    store: &ConversationStore,
    conversation_id: ConversationId,
) -> Result<Vec<Message>, StoreError> {
    store
        .messages(conversation_id)
        .ok_or(StoreError::NotFound(conversation_id))
}

pub fn delete_all_conversations(store: &ConversationStore) -> Result<(), StoreError> {
    store.clear_all()
}

pub async fn send_message(
    controller: &SessionController,
    conversation_id: ConversationId,
    content: &str,
    cancel: &CancellationToken,
) -> Result<DispatchOutcome, SessionError> {
    tracing::debug!(conversation = %conversation_id, model = %controller.client().config().model, "sending message");
    controller.submit(conversation_id, content, cancel).await
}

/// Re-sends a pending user turn, e.g. after a failed request.
pub async fn retry(
    controller: &SessionController,
    conversation_id: ConversationId,
    cancel: &CancellationToken,
) -> Result<DispatchOutcome, SessionError> {
    controller.dispatch(conversation_id, cancel).await
}
