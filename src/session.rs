//! Drives conversations that are waiting on the model.
//!
//! A conversation needs a reply when its last message came from the user. The
//! controller checks that on the store's current contents, sends the request,
//! and folds the answer back into the store one delta at a time. At most one
//! dispatch runs per conversation; others may run alongside it.

use crate::db::models::{ConversationId, Message};
use crate::db::{ConversationStore, StoreError};
use crate::llm::openai::ModelReply;
use crate::llm::{ChatDelta, LlmError, OpenAiClient};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Dispatching,
    StreamingAssistant,
    ErrorSurfaced(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Completed,
    /// The last message is not a user turn; nothing was sent.
    NothingPending,
    AlreadyInFlight,
    /// Stopped through the cancellation token. Deltas applied so far are kept.
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("conversation {0} is already waiting on a reply")]
    Busy(ConversationId),
    #[error("message is empty")]
    EmptyMessage,
}

pub type DeltaObserver = Box<dyn Fn(ConversationId, &ChatDelta) + Send + Sync>;
pub type Transition = Option<(ConversationId, SessionState)>;

pub struct SessionController {
    store: Arc<ConversationStore>,
    client: OpenAiClient,
    in_flight: Mutex<HashSet<ConversationId>>,
    states: Mutex<HashMap<ConversationId, SessionState>>,
    transitions: watch::Sender<Transition>,
    observer: Option<DeltaObserver>,
}

/// Marks a conversation as in flight until dropped.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<ConversationId>>,
    id: ConversationId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        lock(self.set).remove(&self.id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionController {
    pub fn new(store: Arc<ConversationStore>, client: OpenAiClient) -> Self {
        let (transitions, _) = watch::channel(None);
        Self {
            store,
            client,
            in_flight: Mutex::new(HashSet::new()),
            states: Mutex::new(HashMap::new()),
            transitions,
            observer: None,
        }
    }

    /// Called with every delta right after it has been committed to the store.
    pub fn with_observer(mut self, observer: DeltaObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn client(&self) -> &OpenAiClient {
        &self.client
    }

    pub fn state(&self, id: ConversationId) -> SessionState {
        lock(&self.states)
            .get(&id)
            .cloned()
            .unwrap_or(SessionState::Idle)
    }

    /// Latest transition of any conversation.
    pub fn subscribe_states(&self) -> watch::Receiver<Transition> {
        self.transitions.subscribe()
    }

    fn transition(&self, id: ConversationId, state: SessionState) {
        tracing::debug!(conversation = %id, state = ?state, "session transition");
        lock(&self.states).insert(id, state.clone());
        self.transitions.send_replace(Some((id, state)));
    }

    fn claim(&self, id: ConversationId) -> Option<InFlight<'_>> {
        let claimed = lock(&self.in_flight).insert(id);
        claimed.then(|| InFlight {
            set: &self.in_flight,
            id,
        })
    }

    /// Appends a user turn and dispatches it.
    pub async fn submit(
        &self,
        id: ConversationId,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome, SessionError> {
        if text.trim().is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        let guard = self.claim(id).ok_or(SessionError::Busy(id))?;
        self.store.append(id, Message::user(text))?;
        self.dispatch_claimed(id, cancel, guard).await
    }

    /// Answers the conversation if its last message is a user turn.
    pub async fn dispatch(
        &self,
        id: ConversationId,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome, SessionError> {
        let Some(guard) = self.claim(id) else {
            tracing::debug!(conversation = %id, "dispatch already in flight");
            return Ok(DispatchOutcome::AlreadyInFlight);
        };
        self.dispatch_claimed(id, cancel, guard).await
    }

    /// Like [`dispatch`](Self::dispatch), giving up once `deadline` has passed.
    pub async fn dispatch_with_deadline(
        &self,
        id: ConversationId,
        deadline: Duration,
    ) -> Result<DispatchOutcome, SessionError> {
        let cancel = CancellationToken::new();
        self.within(id, deadline, self.dispatch(id, &cancel)).await
    }

    /// Like [`submit`](Self::submit), giving up once `deadline` has passed.
    pub async fn submit_with_deadline(
        &self,
        id: ConversationId,
        text: &str,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome, SessionError> {
        self.within(id, deadline, self.submit(id, text, cancel)).await
    }

    async fn within<F>(
        &self,
        id: ConversationId,
        deadline: Duration,
        dispatch: F,
    ) -> Result<DispatchOutcome, SessionError>
    where
        F: Future<Output = Result<DispatchOutcome, SessionError>>,
    {
        match tokio::time::timeout(deadline, dispatch).await {
            Ok(result) => result,
            Err(_) => {
                let err = SessionError::from(LlmError::Timeout);
                tracing::warn!(conversation = %id, ?deadline, "dispatch timed out");
                self.transition(id, SessionState::ErrorSurfaced(err.to_string()));
                Err(err)
            }
        }
    }

    async fn dispatch_claimed(
        &self,
        id: ConversationId,
        cancel: &CancellationToken,
        _guard: InFlight<'_>,
    ) -> Result<DispatchOutcome, SessionError> {
        if !self.store.awaiting_response(id) {
            return Ok(DispatchOutcome::NothingPending);
        }

        self.transition(id, SessionState::Dispatching);
        match self.run(id, cancel).await {
            Ok(outcome) => {
                self.transition(id, SessionState::Idle);
                Ok(outcome)
            }
            Err(e) => {
                tracing::warn!(conversation = %id, error = %e, "dispatch failed");
                self.transition(id, SessionState::ErrorSurfaced(e.to_string()));
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        id: ConversationId,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome, SessionError> {
        let history = self.store.messages(id).ok_or(StoreError::NotFound(id))?;

        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(DispatchOutcome::Cancelled),
            reply = self.client.send(&history) => reply?,
        };

        match reply {
            ModelReply::Image(image) => {
                self.store.append(id, Message::assistant(image.to_markdown()))?;
                tracing::info!(conversation = %id, "image reply stored");
            }
            ModelReply::Chat(mut deltas) => {
                self.transition(id, SessionState::StreamingAssistant);

                // The placeholder goes in with the first delta, so a stream that
                // fails before producing anything leaves the turn pending.
                let mut anchored = false;
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            tracing::info!(conversation = %id, "stream cancelled");
                            return Ok(DispatchOutcome::Cancelled);
                        }
                        next = deltas.next_delta() => next,
                    };
                    match next {
                        Some(Ok(delta)) => {
                            if !anchored {
                                self.store.append(id, Message::placeholder())?;
                                anchored = true;
                            }
                            self.apply(id, &delta)?;
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => break,
                    }
                }
                if !anchored {
                    self.store.append(id, Message::placeholder())?;
                }
                tracing::info!(conversation = %id, skipped = deltas.warnings(), "stream finished");
            }
        }
        Ok(DispatchOutcome::Completed)
    }

    fn apply(&self, id: ConversationId, delta: &ChatDelta) -> Result<(), StoreError> {
        self.store.mutate_last(id, |message| {
            if let Some(content) = &delta.content {
                message.content.push_str(content);
            }
            if let Some(reasoning) = &delta.reasoning {
                message
                    .reasoning
                    .get_or_insert_with(String::new)
                    .push_str(reasoning);
            }
        })?;
        if let Some(observer) = &self.observer {
            observer(id, delta);
        }
        Ok(())
    }
}
