//! Session store: in-memory per-user form sessions with per-user locking.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

use super::field::FormField;
use crate::channels::{ChatId, UserId};

/// One user's in-progress conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormSession {
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub current_field: FormField,
    /// Accepted answers only.
    pub answers: HashMap<FormField, String>,
    /// Set while a rejected answer is out for a correction hint.
    pub awaiting_correction_retry: bool,
    /// Next free text goes to operations instead of the form.
    pub admin_relay_mode: bool,
    /// Whether the user has started the form.
    pub form_open: bool,
    /// Identity of this session instance; changes on every begin.
    pub epoch: u64,
}

impl FormSession {
    /// Fresh session positioned at the first field.
    pub fn begin(user_id: UserId, chat_id: ChatId, epoch: u64) -> Self {
        Self {
            user_id,
            chat_id,
            current_field: FormField::default(),
            answers: HashMap::new(),
            awaiting_correction_retry: false,
            admin_relay_mode: false,
            form_open: true,
            epoch,
        }
    }

    /// Session that only waits for one message to relay to operations.
    pub fn relay_only(user_id: UserId, chat_id: ChatId, epoch: u64) -> Self {
        Self {
            admin_relay_mode: true,
            form_open: false,
            ..Self::begin(user_id, chat_id, epoch)
        }
    }

    /// Store an accepted answer for the current field and move on.
    pub fn accept(&mut self, answer: String) -> Result<FormField, String> {
        let next = self
            .current_field
            .next()
            .ok_or_else(|| "Form already complete".to_string())?;
        if !self.current_field.can_transition_to(next) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.current_field, next
            ));
        }
        self.answers.insert(self.current_field, answer);
        self.current_field = next;
        self.awaiting_correction_retry = false;
        Ok(next)
    }

    /// Step back to `field`, dropping its answer (used to retry a failed save).
    pub fn reopen(&mut self, field: FormField) {
        self.answers.remove(&field);
        self.current_field = field;
    }

    pub fn answer(&self, field: FormField) -> Option<&str> {
        self.answers.get(&field).map(String::as_str)
    }

    /// Whether text from this user should be treated as a form answer.
    pub fn accepts_answers(&self) -> bool {
        self.form_open && !self.admin_relay_mode && !self.current_field.is_terminal()
    }
}

/// Holds at most one `FormSession` per user.
pub struct SessionStore {
    sessions: RwLock<HashMap<UserId, FormSession>>,
    locks: std::sync::Mutex<HashMap<UserId, Arc<Mutex<()>>>>,
    /// Epochs handed out by this store are never reused.
    epochs: AtomicU64,
}

impl SessionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            locks: std::sync::Mutex::new(HashMap::new()),
            epochs: AtomicU64::new(1),
        })
    }

    /// Identity for a new session instance.
    pub fn next_epoch(&self) -> u64 {
        self.epochs.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn get(&self, user_id: UserId) -> Option<FormSession> {
        self.sessions.read().await.get(&user_id).cloned()
    }

    /// Insert or replace the user's session.
    pub async fn put(&self, session: FormSession) {
        debug!(
            user_id = session.user_id,
            field = %session.current_field,
            epoch = session.epoch,
            "Session stored"
        );
        self.sessions.write().await.insert(session.user_id, session);
    }

    /// Remove and return the user's session.
    pub async fn delete(&self, user_id: UserId) -> Option<FormSession> {
        self.sessions.write().await.remove(&user_id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Acquire the user's session lock. All read-modify-write sequences on a
    /// session happen while holding this guard.
    pub async fn lock(&self, user_id: UserId) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(user_id).or_default().clone()
        };
        mutex.lock_owned().await
    }

    /// Drop lock entries nobody holds or waits on.
    pub fn prune_locks(&self) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, m| Arc::strong_count(m) > 1);
    }
}
