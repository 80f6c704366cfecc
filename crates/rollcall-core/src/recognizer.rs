//! Prototype matching against the enrolled roster.
//!
//! Each identity is reduced to one prototype: the mean of its individually
//! L2-normalized samples. Normalizing before averaging keeps high-magnitude
//! samples from dominating the prototype.

use crate::types::{Embedding, Identity, Recognition, Roster};

pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.65;

/// Score reported when there is nothing to compare against.
const NO_CANDIDATE_SCORE: f32 = -1.0;

/// One identity's reference vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Prototype {
    pub name: String,
    pub vector: Embedding,
}

/// Nearest-prototype recognizer.
///
/// The prototype table is only ever rebuilt wholesale from a roster
/// snapshot, never patched.
pub struct Recognizer {
    prototypes: Vec<Prototype>,
    threshold: f32,
}

impl Recognizer {
    pub fn new(roster: &Roster, threshold: f32) -> Self {
        let prototypes = build_prototypes(roster);
        tracing::info!(identities = prototypes.len(), threshold, "recognizer ready");
        Self {
            prototypes,
            threshold,
        }
    }

    /// Rebuild the prototype table from `roster` and swap it in.
    pub fn update(&mut self, roster: &Roster) {
        let rebuilt = build_prototypes(roster);
        tracing::info!(
            before = self.prototypes.len(),
            after = rebuilt.len(),
            "prototype table rebuilt"
        );
        self.prototypes = rebuilt;
    }

    /// Match `query` against every prototype.
    ///
    /// Below the threshold the result is [`Identity::Unknown`] carrying the
    /// best losing score, so near-misses stay visible. On exact ties the
    /// first identity in roster order wins.
    pub fn recognize(&self, query: &Embedding) -> Recognition {
        let query = query.l2_normalized();

        let mut best_score = NO_CANDIDATE_SCORE;
        let mut best: Option<&Prototype> = None;

        for prototype in &self.prototypes {
            let score = query.similarity(&prototype.vector);
            if score > best_score {
                best_score = score;
                best = Some(prototype);
            }
        }

        match best {
            Some(prototype) if best_score >= self.threshold => Recognition {
                identity: Identity::Known(prototype.name.clone()),
                score: best_score,
            },
            _ => Recognition {
                identity: Identity::Unknown,
                score: best_score,
            },
        }
    }

    pub fn prototype(&self, name: &str) -> Option<&Embedding> {
        self.prototypes
            .iter()
            .find(|p| p.name == name)
            .map(|p| &p.vector)
    }

    /// Names with a prototype, in match order.
    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.prototypes.iter().map(|p| p.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.prototypes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prototypes.is_empty()
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

/// Build one prototype per identity with at least one sample.
///
/// Samples whose dimension differs from the identity's first sample are
/// skipped.
pub fn build_prototypes(roster: &Roster) -> Vec<Prototype> {
    let mut prototypes = Vec::with_capacity(roster.len());

    for (name, samples) in roster {
        let Some(first) = samples.first() else {
            continue;
        };
        let dim = first.values.len();

        let mut sum = vec![0.0f32; dim];
        let mut count = 0usize;
        for sample in samples {
            if sample.values.len() != dim {
                tracing::warn!(
                    name = %name,
                    expected = dim,
                    actual = sample.values.len(),
                    "skipping sample with mismatched dimension"
                );
                continue;
            }
            for (acc, v) in sum.iter_mut().zip(sample.l2_normalized().values) {
                *acc += v;
            }
            count += 1;
        }

        let mean = sum.into_iter().map(|v| v / count as f32).collect();
        prototypes.push(Prototype {
            name: name.clone(),
            vector: Embedding {
                values: mean,
                model_version: first.model_version.clone(),
            },
        });
    }

    prototypes
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn random_embedding(rng: &mut StdRng, dim: usize) -> Embedding {
        Embedding::new((0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect())
    }

    fn roster(entries: &[(&str, Vec<Embedding>)]) -> Roster {
        entries
            .iter()
            .map(|(name, samples)| (name.to_string(), samples.clone()))
            .collect()
    }

    #[test]
    fn test_prototype_normalizes_before_averaging() {
        // A long and a short sample pointing in different directions: the
        // prototype must weight them equally.
        let r = roster(&[("a", vec![emb(&[100.0, 0.0]), emb(&[0.0, 1.0])])]);
        let protos = build_prototypes(&r);
        assert_eq!(protos.len(), 1);
        let v = &protos[0].vector.values;
        assert!((v[0] - 0.5).abs() < 1e-6, "got {v:?}");
        assert!((v[1] - 0.5).abs() < 1e-6, "got {v:?}");
    }

    #[test]
    fn test_empty_identity_skipped() {
        let r = roster(&[("empty", vec![]), ("bob", vec![emb(&[0.0, 1.0])])]);
        let recognizer = Recognizer::new(&r, DEFAULT_SIMILARITY_THRESHOLD);
        assert_eq!(recognizer.identities().collect::<Vec<_>>(), vec!["bob"]);
        assert!(recognizer.prototype("empty").is_none());
    }

    #[test]
    fn test_mismatched_dimension_sample_skipped() {
        let r = roster(&[("a", vec![emb(&[1.0, 0.0]), emb(&[0.0, 1.0, 0.0])])]);
        let protos = build_prototypes(&r);
        assert_eq!(protos[0].vector.values, vec![1.0, 0.0]);
    }

    #[test]
    fn test_rebuild_is_deterministic() {
        let mut rng = StdRng::seed_from_u64(7);
        let r = roster(&[
            ("alice", (0..5).map(|_| random_embedding(&mut rng, 64)).collect()),
            ("bob", (0..3).map(|_| random_embedding(&mut rng, 64)).collect()),
        ]);
        assert_eq!(build_prototypes(&r), build_prototypes(&r));
    }

    #[test]
    fn test_recognize_stored_prototype_matches() {
        let mut rng = StdRng::seed_from_u64(11);
        let r = roster(&[
            ("alice", (0..4).map(|_| random_embedding(&mut rng, 128)).collect()),
            ("bob", (0..4).map(|_| random_embedding(&mut rng, 128)).collect()),
        ]);
        let recognizer = Recognizer::new(&r, DEFAULT_SIMILARITY_THRESHOLD);

        for name in ["alice", "bob"] {
            let query = recognizer.prototype(name).unwrap().l2_normalized();
            let result = recognizer.recognize(&query);
            assert_eq!(result.identity, Identity::Known(name.to_string()));
            assert!(result.score >= DEFAULT_SIMILARITY_THRESHOLD);
        }
    }

    #[test]
    fn test_alice_scenario() {
        let mut rng = StdRng::seed_from_u64(42);
        let v1 = random_embedding(&mut rng, 512);
        let v2 = Embedding::new(
            v1.values
                .iter()
                .map(|v| v + rng.gen_range(-0.05..0.05))
                .collect(),
        );
        let r = roster(&[("alice", vec![v1.clone(), v2])]);
        let recognizer = Recognizer::new(&r, 0.65);

        let hit = recognizer.recognize(&v1.l2_normalized());
        assert_eq!(hit.identity, Identity::Known("alice".into()));
        assert!((hit.score - 1.0).abs() < 0.01, "score {}", hit.score);

        let miss = recognizer.recognize(&random_embedding(&mut rng, 512));
        assert_eq!(miss.identity, Identity::Unknown);
        assert!(miss.score < 0.65);
    }

    #[test]
    fn test_unknown_reports_best_losing_score() {
        let r = roster(&[("a", vec![emb(&[1.0, 0.0])]), ("b", vec![emb(&[0.0, 1.0])])]);
        let recognizer = Recognizer::new(&r, 0.9);
        // 30 degrees off "a": cos = 0.866
        let query = emb(&[0.866_025, 0.5]);
        let result = recognizer.recognize(&query);
        assert_eq!(result.identity, Identity::Unknown);
        assert!((result.score - 0.866).abs() < 1e-3, "score {}", result.score);
    }

    #[test]
    fn test_empty_table_is_unknown() {
        let recognizer = Recognizer::new(&Roster::new(), DEFAULT_SIMILARITY_THRESHOLD);
        assert!(recognizer.is_empty());
        let result = recognizer.recognize(&emb(&[1.0, 2.0]));
        assert_eq!(result.identity, Identity::Unknown);
        assert_eq!(result.score, -1.0);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let r = roster(&[("a", vec![emb(&[1.0, 0.0])])]);
        let recognizer = Recognizer::new(&r, 0.5);
        // cos = 0.6 exactly representable enough to clear 0.5
        let result = recognizer.recognize(&emb(&[0.6, 0.8]));
        assert!(result.identity.is_known());

        let strict = Recognizer::new(&r, 1.0);
        let exact = strict.recognize(&emb(&[2.0, 0.0]));
        assert!((exact.score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_score_equal_to_threshold_is_accepted() {
        let r = roster(&[("a", vec![emb(&[1.0, 0.0])])]);
        let query = emb(&[0.6, 0.8]);
        let score = Recognizer::new(&r, -1.0).recognize(&query).score;

        let at_threshold = Recognizer::new(&r, score).recognize(&query);
        assert_eq!(at_threshold.identity, Identity::Known("a".into()));

        let above = Recognizer::new(&r, score + 1e-4).recognize(&query);
        assert_eq!(above.identity, Identity::Unknown);
    }

    #[test]
    fn test_tie_keeps_first_identity() {
        let r = roster(&[("a", vec![emb(&[1.0, 0.0])]), ("b", vec![emb(&[1.0, 0.0])])]);
        let recognizer = Recognizer::new(&r, 0.5);
        let result = recognizer.recognize(&emb(&[1.0, 0.0]));
        assert_eq!(result.identity, Identity::Known("a".into()));
    }

    #[test]
    fn test_update_removes_deleted_identity() {
        let mut r = roster(&[("x", vec![emb(&[1.0, 0.0, 0.0])]), ("y", vec![emb(&[0.0, 1.0, 0.0])])]);
        let mut recognizer = Recognizer::new(&r, 0.65);
        let query = emb(&[1.0, 0.05, 0.0]);
        assert_eq!(recognizer.recognize(&query).identity, Identity::Known("x".into()));

        r.remove("x");
        recognizer.update(&r);

        assert_ne!(recognizer.recognize(&query).identity, Identity::Known("x".into()));
        assert_eq!(recognizer.len(), 1);
    }

    #[test]
    fn test_update_adds_new_identity() {
        let mut r = Roster::new();
        let mut recognizer = Recognizer::new(&r, 0.65);
        r.insert("z".into(), vec![emb(&[0.0, 0.0, 1.0])]);
        recognizer.update(&r);
        let result = recognizer.recognize(&emb(&[0.0, 0.0, 5.0]));
        assert_eq!(result.identity, Identity::Known("z".into()));
    }
}
