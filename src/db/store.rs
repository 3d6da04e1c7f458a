//! In-memory conversation map with write-through persistence.
//!
//! Every mutation rewrites the whole map into a single slot of the database
//! before the store lock is released, so the durable copy is always a value the
//! in-memory map held at some point.

use super::models::{ConversationId, ConversationSummary, Message, Role};
use super::{Database, StoreError};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

/// Slot key holding the serialized conversation map.
pub const MESSAGES_SLOT: &str = "messages";

pub type Snapshot = BTreeMap<ConversationId, Vec<Message>>;

pub struct ConversationStore {
    db: Arc<Database>,
    conversations: Mutex<Snapshot>,
    revision: watch::Sender<u64>,
}

impl ConversationStore {
    /// Loads the persisted map, or starts empty when nothing has been saved yet.
    pub fn load(db: Arc<Database>) -> Result<Self, StoreError> {
        let conversations = match db.read_slot(MESSAGES_SLOT)? {
            Some(raw) => decode_snapshot(&raw)?,
            None => Snapshot::new(),
        };
        tracing::debug!(conversations = conversations.len(), "conversation store loaded");

        let (revision, _) = watch::channel(0);
        Ok(Self {
            db,
            conversations: Mutex::new(conversations),
            revision,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Snapshot> {
        self.conversations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Writes `snapshot` to the durable slot. Callers hold the store lock and
    /// undo their in-memory change when this fails.
    fn write_through(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let raw = encode_snapshot(snapshot)?;
        self.db.write_slot(MESSAGES_SLOT, &raw)?;
        Ok(())
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }

    /// Starts an empty conversation identified by the current time.
    pub fn create_conversation(&self) -> Result<ConversationId, StoreError> {
        let mut conversations = self.lock();
        let now = chrono::Utc::now().timestamp_millis();
        let id = match conversations.keys().next_back() {
            Some(last) if last.0 >= now => ConversationId(last.0 + 1),
            _ => ConversationId(now),
        };
        conversations.insert(id, Vec::new());
        if let Err(e) = self.write_through(&conversations) {
            conversations.remove(&id);
            return Err(e);
        }
        self.bump();
        tracing::info!(conversation = %id, "conversation created");
        Ok(id)
    }

    /// Most recently created conversation, creating one if the store is empty.
    pub fn active_or_create(&self) -> Result<ConversationId, StoreError> {
        match self.latest() {
            Some(id) => Ok(id),
            None => self.create_conversation(),
        }
    }

    pub fn latest(&self) -> Option<ConversationId> {
        self.lock().keys().next_back().copied()
    }

    /// Appends `message`, creating the conversation if absent. Returns the new length.
    pub fn append(&self, id: ConversationId, message: Message) -> Result<usize, StoreError> {
        let mut conversations = self.lock();
        let existed = conversations.contains_key(&id);
        let messages = conversations.entry(id).or_default();
        messages.push(message);
        let len = messages.len();
        if let Err(e) = self.write_through(&conversations) {
            if existed {
                if let Some(messages) = conversations.get_mut(&id) {
                    messages.pop();
                }
            } else {
                conversations.remove(&id);
            }
            return Err(e);
        }
        self.bump();
        Ok(len)
    }

    /// Applies `f` to the last message of a conversation.
    pub fn mutate_last<F>(&self, id: ConversationId, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Message),
    {
        let mut conversations = self.lock();
        let last = conversations
            .get_mut(&id)
            .ok_or(StoreError::NotFound(id))?
            .last_mut()
            .ok_or(StoreError::EmptyConversation(id))?;
        let before = last.clone();
        f(last);
        if let Err(e) = self.write_through(&conversations) {
            if let Some(last) = conversations.get_mut(&id).and_then(|m| m.last_mut()) {
                *last = before;
            }
            return Err(e);
        }
        self.bump();
        Ok(())
    }

    pub fn snapshot(&self) -> Snapshot {
        self.lock().clone()
    }

    pub fn messages(&self, id: ConversationId) -> Option<Vec<Message>> {
        self.lock().get(&id).cloned()
    }

    /// True when the last message was written by the user, i.e. a reply is owed.
    pub fn awaiting_response(&self, id: ConversationId) -> bool {
        self.lock()
            .get(&id)
            .and_then(|messages| messages.last())
            .is_some_and(|m| m.role == Role::User)
    }

    pub fn summaries(&self) -> Vec<ConversationSummary> {
        self.lock()
            .iter()
            .map(|(id, messages)| ConversationSummary::new(*id, messages))
            .collect()
    }

    /// Flushes the current map to durable storage.
    pub fn persist(&self) -> Result<(), StoreError> {
        let conversations = self.lock();
        self.write_through(&conversations)
    }

    /// Drops every conversation, in memory and on disk.
    pub fn clear_all(&self) -> Result<(), StoreError> {
        let mut conversations = self.lock();
        self.db.delete_slot(MESSAGES_SLOT)?;
        conversations.clear();
        self.bump();
        tracing::info!("all conversations deleted");
        Ok(())
    }

    /// Revision counter bumped on every mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}

fn encode_snapshot(snapshot: &Snapshot) -> Result<String, StoreError> {
    let keyed: BTreeMap<String, &Vec<Message>> = snapshot
        .iter()
        .map(|(id, messages)| (id.to_string(), messages))
        .collect();
    Ok(serde_json::to_string(&keyed)?)
}

fn decode_snapshot(raw: &str) -> Result<Snapshot, StoreError> {
    let keyed: BTreeMap<String, Vec<Message>> = serde_json::from_str(raw)?;
    let mut snapshot = Snapshot::new();
    for (key, messages) in keyed {
        match key.parse::<ConversationId>() {
            Ok(id) => {
                snapshot.insert(id, messages);
            }
            Err(e) => tracing::warn!(key = %key, error = %e, "skipping conversation with invalid id"),
        }
    }
    Ok(snapshot)
}
