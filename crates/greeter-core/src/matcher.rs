//! Identity matcher: face crop → embedding → nearest known visitor.

use crate::collaborators::FaceEmbedder;
use crate::types::{Embedding, IdentityMatch, VisitorId};
use image::RgbImage;

/// A known visitor in the identity gallery.
#[derive(Debug, Clone)]
pub struct KnownVisitor {
    pub id: VisitorId,
    pub name: String,
    pub embedding: Embedding,
}

/// Closest gallery entry to a probe embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub visitor_id: VisitorId,
    pub name: String,
    pub distance: f32,
}

/// Nearest-neighbour lookup over the population of known identities.
pub trait IdentityIndex {
    fn nearest(&self, probe: &Embedding) -> Option<Neighbor>;
}

/// In-memory gallery using cosine distance.
///
/// Always iterates every entry; there is no early exit on a good match.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<KnownVisitor>,
}

impl Gallery {
    pub fn new(entries: Vec<KnownVisitor>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IdentityIndex for Gallery {
    fn nearest(&self, probe: &Embedding) -> Option<Neighbor> {
        let mut best_dist = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, visitor) in self.entries.iter().enumerate() {
            let dist = probe.cosine_distance(&visitor.embedding);
            if dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        best_idx.map(|idx| Neighbor {
            visitor_id: self.entries[idx].id.clone(),
            name: self.entries[idx].name.clone(),
            distance: best_dist,
        })
    }
}

/// Embeds a face crop and accepts the nearest identity within `threshold`.
///
/// Read-only: never writes to persistence.
pub struct IdentityMatcher {
    embedder: Box<dyn FaceEmbedder + Send>,
    index: Box<dyn IdentityIndex + Send>,
    threshold: f32,
}

impl IdentityMatcher {
    pub fn new(
        embedder: Box<dyn FaceEmbedder + Send>,
        index: Box<dyn IdentityIndex + Send>,
        threshold: f32,
    ) -> Self {
        Self {
            embedder,
            index,
            threshold,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Returns `None` for an unknown face or when the embedder fails.
    pub fn identify(&mut self, face: &RgbImage) -> Option<IdentityMatch> {
        let embedding = match self.embedder.embed(face) {
            Ok(e) => e,
            Err(err) => {
                tracing::warn!(error = %err, "embedding failed; treating face as unknown");
                return None;
            }
        };

        let neighbor = self.index.nearest(&embedding)?;
        if neighbor.distance <= self.threshold {
            tracing::debug!(visitor = %neighbor.visitor_id, distance = neighbor.distance, "identity matched");
            Some(IdentityMatch {
                visitor_id: neighbor.visitor_id,
                name: neighbor.name,
                distance: neighbor.distance,
            })
        } else {
            tracing::debug!(
                nearest = %neighbor.visitor_id,
                distance = neighbor.distance,
                threshold = self.threshold,
                "nearest identity outside threshold"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognizer::RecognizerError;

    fn visitor(id: &str, name: &str, values: Vec<f32>) -> KnownVisitor {
        KnownVisitor {
            id: VisitorId(id.into()),
            name: name.into(),
            embedding: Embedding { values },
        }
    }

    struct FixedEmbedder(Option<Vec<f32>>);

    impl FaceEmbedder for FixedEmbedder {
        fn embed(&mut self, _face: &RgbImage) -> Result<Embedding, RecognizerError> {
            match &self.0 {
                Some(values) => Ok(Embedding { values: values.clone() }),
                None => Err(RecognizerError::EmptyCrop),
            }
        }
    }

    fn gallery() -> Gallery {
        Gallery::new(vec![
            visitor("1", "decoy1", vec![0.0, 1.0, 0.0]),
            visitor("2", "decoy2", vec![0.0, 0.0, 1.0]),
            visitor("3", "Ada Lovelace", vec![1.0, 0.0, 0.0]),
        ])
    }

    #[test]
    fn test_gallery_nearest_scans_all_entries() {
        // Best match is the last entry.
        let probe = Embedding { values: vec![1.0, 0.0, 0.0] };
        let n = gallery().nearest(&probe).unwrap();
        assert_eq!(n.visitor_id, VisitorId("3".into()));
        assert!(n.distance.abs() < 1e-6);
    }

    #[test]
    fn test_gallery_empty() {
        let probe = Embedding { values: vec![1.0, 0.0] };
        assert!(Gallery::default().nearest(&probe).is_none());
    }

    #[test]
    fn test_identify_within_threshold() {
        let mut m = IdentityMatcher::new(
            Box::new(FixedEmbedder(Some(vec![0.9, 0.1, 0.0]))),
            Box::new(gallery()),
            0.4,
        );
        let found = m.identify(&RgbImage::new(4, 4)).unwrap();
        assert_eq!(found.name, "Ada Lovelace");
        assert!(found.distance <= 0.4);
    }

    #[test]
    fn test_identify_outside_threshold() {
        let mut m = IdentityMatcher::new(
            Box::new(FixedEmbedder(Some(vec![1.0, 1.0, 1.0]))),
            Box::new(gallery()),
            0.3,
        );
        // Every entry is at distance 1 - 1/sqrt(3) ≈ 0.42.
        assert!(m.identify(&RgbImage::new(4, 4)).is_none());
    }

    #[test]
    fn test_identify_threshold_is_inclusive() {
        let g = Gallery::new(vec![visitor("1", "a", vec![1.0, 0.0])]);
        // Orthogonal probe: distance exactly 1.0.
        let mut m = IdentityMatcher::new(
            Box::new(FixedEmbedder(Some(vec![0.0, 1.0]))),
            Box::new(g),
            1.0,
        );
        assert!(m.identify(&RgbImage::new(4, 4)).is_some());
    }

    #[test]
    fn test_identify_embedder_failure_is_unknown() {
        let mut m = IdentityMatcher::new(Box::new(FixedEmbedder(None)), Box::new(gallery()), 0.9);
        assert!(m.identify(&RgbImage::new(4, 4)).is_none());
    }
}
