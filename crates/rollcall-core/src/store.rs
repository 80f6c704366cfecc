//! Roster persistence seam.

use crate::types::Roster;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RosterError {
    #[error("roster backend: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("corrupt roster entry for {name}: {reason}")]
    Corrupt { name: String, reason: String },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable home of the roster.
///
/// `load` after `save(r)` must return a roster equal to `r`.
pub trait RosterStore: Send {
    fn load(&self) -> Result<Roster, RosterError>;
    fn save(&self, roster: &Roster) -> Result<(), RosterError>;
}

/// Volatile store, shared between clones.
#[derive(Clone, Default)]
pub struct MemoryRosterStore {
    inner: Arc<Mutex<Roster>>,
    saves: Arc<Mutex<usize>>,
}

impl MemoryRosterStore {
    pub fn new(initial: Roster) -> Self {
        Self {
            inner: Arc::new(Mutex::new(initial)),
            saves: Arc::default(),
        }
    }

    /// Number of successful `save` calls so far.
    pub fn save_count(&self) -> usize {
        self.saves.lock().map(|n| *n).unwrap_or(0)
    }
}

impl RosterStore for MemoryRosterStore {
    fn load(&self) -> Result<Roster, RosterError> {
        let roster = self
            .inner
            .lock()
            .map_err(|e| RosterError::Backend(e.to_string().into()))?;
        Ok(roster.clone())
    }

    fn save(&self, roster: &Roster) -> Result<(), RosterError> {
        let mut stored = self
            .inner
            .lock()
            .map_err(|e| RosterError::Backend(e.to_string().into()))?;
        *stored = roster.clone();
        if let Ok(mut n) = self.saves.lock() {
            *n += 1;
        }
        Ok(())
    }
}
