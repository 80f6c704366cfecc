//! Live enrollment: gathering sample embeddings for one identity.
//!
//! The enroller owns the roster. Every mutation ends in a [`RosterUpdated`]
//! event, which is the only way the recognizer learns about roster changes.

use crate::store::{RosterError, RosterStore};
use crate::types::{Embedding, Roster};
use std::time::Duration;

pub const DEFAULT_MAX_SAMPLES: usize = 20;
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(150);

#[derive(Debug, Clone)]
pub struct EnrollmentConfig {
    /// Samples captured before a session completes.
    pub max_samples: usize,
    /// Pause after each accepted sample so consecutive samples come from
    /// visibly different frames.
    pub sample_interval: Duration,
}

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            max_samples: DEFAULT_MAX_SAMPLES,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
        }
    }
}

/// State of an in-progress enrollment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentSession {
    pub name: String,
    pub count: usize,
    pub target: usize,
    /// Samples the identity already had before this session.
    baseline: usize,
    /// Whether this session created the roster entry.
    created: bool,
}

/// What changed in the roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterChange {
    Enrolled { name: String, samples: usize },
    Removed { name: String },
}

/// Roster snapshot handed to the recognizer after a mutation.
#[derive(Debug, Clone)]
pub struct RosterUpdated {
    pub change: RosterChange,
    pub roster: Roster,
}

/// Result of feeding one embedding to the enroller.
#[derive(Debug, Clone)]
pub enum EnrollProgress {
    /// No session is active.
    Ignored,
    Captured { name: String, count: usize, target: usize },
    Completed(RosterUpdated),
}

pub struct Enroller {
    roster: Roster,
    store: Box<dyn RosterStore>,
    config: EnrollmentConfig,
    session: Option<EnrollmentSession>,
}

impl Enroller {
    /// Load the roster from `store` and start idle.
    pub fn open(store: Box<dyn RosterStore>, config: EnrollmentConfig) -> Result<Self, RosterError> {
        let roster = store.load()?;
        tracing::info!(
            identities = roster.len(),
            samples = roster.values().map(Vec::len).sum::<usize>(),
            "roster loaded"
        );
        Ok(Self {
            roster,
            store,
            config,
            session: None,
        })
    }

    /// Begin capturing samples for `name`.
    ///
    /// An active session is abandoned first, dropping its partial samples.
    /// Returns false for a blank name.
    pub fn start(&mut self, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() {
            tracing::warn!("refusing to enroll a blank name");
            return false;
        }

        self.cancel();

        let created = !self.roster.contains_key(name);
        let samples = self.roster.entry(name.to_string()).or_default();
        let target = self.config.max_samples.max(1);

        tracing::info!(name, existing = samples.len(), target, "enrollment started");
        self.session = Some(EnrollmentSession {
            name: name.to_string(),
            count: 0,
            target,
            baseline: samples.len(),
            created,
        });
        true
    }

    /// Abandon the active session, if any, without persisting.
    pub fn cancel(&mut self) -> Option<String> {
        let session = self.session.take()?;

        if session.created {
            self.roster.remove(&session.name);
        } else if let Some(samples) = self.roster.get_mut(&session.name) {
            samples.truncate(session.baseline);
        }

        tracing::info!(name = %session.name, dropped = session.count, "enrollment abandoned");
        Some(session.name)
    }

    /// Append one sample to the active session.
    ///
    /// The session completes once `max_samples` have been captured: the
    /// roster is persisted and the returned event carries the new snapshot.
    /// Persist failures are logged and the session still completes.
    pub fn process(&mut self, embedding: Embedding) -> EnrollProgress {
        let Some(session) = self.session.as_mut() else {
            return EnrollProgress::Ignored;
        };

        self.roster
            .entry(session.name.clone())
            .or_default()
            .push(embedding);
        session.count += 1;

        tracing::debug!(name = %session.name, count = session.count, of = session.target, "sample captured");

        if session.count < session.target {
            let progress = EnrollProgress::Captured {
                name: session.name.clone(),
                count: session.count,
                target: session.target,
            };
            if !self.config.sample_interval.is_zero() {
                std::thread::sleep(self.config.sample_interval);
            }
            return progress;
        }

        let Some(session) = self.session.take() else {
            return EnrollProgress::Ignored;
        };

        if let Err(e) = self.store.save(&self.roster) {
            tracing::error!(name = %session.name, error = %e, "failed to persist roster after enrollment");
        }

        let samples = self.roster.get(&session.name).map_or(0, Vec::len);
        tracing::info!(name = %session.name, samples, "enrollment complete");

        EnrollProgress::Completed(RosterUpdated {
            change: RosterChange::Enrolled {
                name: session.name,
                samples,
            },
            roster: self.roster.clone(),
        })
    }

    /// Delete an identity and persist.
    ///
    /// Returns `Ok(None)` when the name is not enrolled. On a persist failure
    /// the identity is restored so memory and storage stay in agreement.
    pub fn remove(&mut self, name: &str) -> Result<Option<RosterUpdated>, RosterError> {
        let name = name.trim();
        if self.session.as_ref().is_some_and(|s| s.name == name) {
            self.cancel();
        }

        let Some(samples) = self.roster.remove(name) else {
            return Ok(None);
        };

        if let Err(e) = self.store.save(&self.roster) {
            self.roster.insert(name.to_string(), samples);
            return Err(e);
        }

        tracing::info!(name, "identity removed");
        Ok(Some(RosterUpdated {
            change: RosterChange::Removed {
                name: name.to_string(),
            },
            roster: self.roster.clone(),
        }))
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&EnrollmentSession> {
        self.session.as_ref()
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn config(&self) -> &EnrollmentConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRosterStore;

    struct FailingStore;

    impl RosterStore for FailingStore {
        fn load(&self) -> Result<Roster, RosterError> {
            Ok(Roster::new())
        }

        fn save(&self, _roster: &Roster) -> Result<(), RosterError> {
            Err(RosterError::Io(std::io::Error::other("disk full")))
        }
    }

    fn config(max_samples: usize) -> EnrollmentConfig {
        EnrollmentConfig {
            max_samples,
            sample_interval: Duration::ZERO,
        }
    }

    fn sample(i: usize) -> Embedding {
        Embedding::new(vec![i as f32, 1.0, 0.5])
    }

    fn enroller(store: &MemoryRosterStore, max_samples: usize) -> Enroller {
        Enroller::open(Box::new(store.clone()), config(max_samples)).unwrap()
    }

    #[test]
    fn test_process_while_idle_is_ignored() {
        let store = MemoryRosterStore::default();
        let mut enroller = enroller(&store, 3);
        assert!(matches!(enroller.process(sample(0)), EnrollProgress::Ignored));
        assert!(enroller.roster().is_empty());
        assert_eq!(store.save_count(), 0);
    }

    #[test]
    fn test_full_session_completes_once() {
        let store = MemoryRosterStore::default();
        let mut enroller = enroller(&store, 5);
        assert!(enroller.start("X"));
        assert!(enroller.is_active());

        let mut completions = 0;
        for i in 0..5 {
            match enroller.process(sample(i)) {
                EnrollProgress::Captured { count, target, .. } => {
                    assert_eq!(count, i + 1);
                    assert_eq!(target, 5);
                }
                EnrollProgress::Completed(update) => {
                    completions += 1;
                    assert_eq!(
                        update.change,
                        RosterChange::Enrolled { name: "X".into(), samples: 5 }
                    );
                    assert_eq!(update.roster["X"].len(), 5);
                }
                EnrollProgress::Ignored => panic!("session should be active"),
            }
        }

        assert_eq!(completions, 1);
        assert!(!enroller.is_active());
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.load().unwrap()["X"].len(), 5);

        // Back to idle: further samples are dropped.
        assert!(matches!(enroller.process(sample(9)), EnrollProgress::Ignored));
        assert_eq!(enroller.roster()["X"].len(), 5);
    }

    #[test]
    fn test_session_appends_to_existing_identity() {
        let mut initial = Roster::new();
        initial.insert("X".into(), vec![sample(100)]);
        let store = MemoryRosterStore::new(initial);
        let mut enroller = enroller(&store, 2);

        enroller.start("X");
        enroller.process(sample(0));
        let progress = enroller.process(sample(1));
        assert!(matches!(progress, EnrollProgress::Completed(_)));
        assert_eq!(store.load().unwrap()["X"].len(), 3);
    }

    #[test]
    fn test_restart_abandons_partial_samples() {
        let store = MemoryRosterStore::default();
        let mut enroller = enroller(&store, 3);

        enroller.start("first");
        enroller.process(sample(0));
        enroller.process(sample(1));

        enroller.start("second");
        assert!(!enroller.roster().contains_key("first"));
        assert_eq!(enroller.session().unwrap().name, "second");
        assert_eq!(enroller.session().unwrap().count, 0);
        assert_eq!(store.save_count(), 0);
    }

    #[test]
    fn test_restart_same_name_resets_count() {
        let mut initial = Roster::new();
        initial.insert("X".into(), vec![sample(100)]);
        let store = MemoryRosterStore::new(initial);
        let mut enroller = enroller(&store, 3);

        enroller.start("X");
        enroller.process(sample(0));
        enroller.start("X");
        assert_eq!(enroller.roster()["X"].len(), 1);
        assert_eq!(enroller.session().unwrap().count, 0);
    }

    #[test]
    fn test_blank_name_rejected() {
        let store = MemoryRosterStore::default();
        let mut enroller = enroller(&store, 3);
        assert!(!enroller.start("   "));
        assert!(!enroller.is_active());
    }

    #[test]
    fn test_remove_persists_and_reports() {
        let mut initial = Roster::new();
        initial.insert("X".into(), vec![sample(0)]);
        initial.insert("Y".into(), vec![sample(1)]);
        let store = MemoryRosterStore::new(initial);
        let mut enroller = enroller(&store, 3);

        let update = enroller.remove("X").unwrap().unwrap();
        assert_eq!(update.change, RosterChange::Removed { name: "X".into() });
        assert!(!update.roster.contains_key("X"));
        assert!(!store.load().unwrap().contains_key("X"));

        assert!(enroller.remove("nobody").unwrap().is_none());
    }

    #[test]
    fn test_remove_active_target_cancels_session() {
        let store = MemoryRosterStore::default();
        let mut enroller = enroller(&store, 3);
        enroller.start("X");
        enroller.process(sample(0));
        // The session created the entry, so cancelling drops it entirely.
        assert!(enroller.remove("X").unwrap().is_none());
        assert!(!enroller.is_active());
    }

    #[test]
    fn test_remove_trims_name() {
        let mut initial = Roster::new();
        initial.insert("X".into(), vec![sample(0)]);
        let store = MemoryRosterStore::new(initial);
        let mut enroller = enroller(&store, 3);

        let update = enroller.remove("  X ").unwrap().unwrap();
        assert_eq!(update.change, RosterChange::Removed { name: "X".into() });
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_remove_padded_name_cancels_session() {
        let store = MemoryRosterStore::default();
        let mut enroller = enroller(&store, 3);
        enroller.start("X");
        enroller.process(sample(0));
        assert!(enroller.remove(" X").unwrap().is_none());
        assert!(!enroller.is_active());
        assert!(!enroller.roster().contains_key("X"));
    }

    #[test]
    fn test_remove_restores_on_save_failure() {
        let mut enroller = Enroller::open(Box::new(FailingStore), config(1)).unwrap();
        enroller.start("X");
        assert!(matches!(enroller.process(sample(0)), EnrollProgress::Completed(_)));

        assert!(enroller.remove("X").is_err());
        assert_eq!(enroller.roster()["X"].len(), 1);
    }

    #[test]
    fn test_completion_survives_save_failure() {
        let mut enroller = Enroller::open(Box::new(FailingStore), config(2)).unwrap();
        enroller.start("X");
        enroller.process(sample(0));
        let progress = enroller.process(sample(1));
        assert!(matches!(progress, EnrollProgress::Completed(_)));
        assert!(!enroller.is_active());
    }

    #[test]
    fn test_sample_interval_paces_captures() {
        let store = MemoryRosterStore::default();
        let cfg = EnrollmentConfig {
            max_samples: 3,
            sample_interval: Duration::from_millis(20),
        };
        let mut enroller = Enroller::open(Box::new(store), cfg).unwrap();
        enroller.start("X");

        let started = std::time::Instant::now();
        enroller.process(sample(0));
        enroller.process(sample(1));
        assert!(started.elapsed() >= Duration::from_millis(40));
    }
}
