//! Immutable matchable snapshot of enrolled identities.

use crate::types::{Embedding, EnrolledIdentity, IdentityId};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum GalleryError {
    #[error("no enrolled identity has consent and a valid embedding ({total} considered)")]
    EmptyGallery { total: usize },
}

/// One eligible identity with its reference embeddings.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub identity_id: IdentityId,
    pub display_name: String,
    pub references: Vec<Embedding>,
}

/// Read-only gallery snapshot. Rebuilding creates a new one.
#[derive(Debug, Default)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    /// A gallery with no identities, for detect-only operation.
    pub fn empty() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn display_name(&self, id: &IdentityId) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| &e.identity_id == id)
            .map(|e| e.display_name.as_str())
    }
}

pub struct GalleryBuilder;

impl GalleryBuilder {
    /// Build a snapshot from all eligible identities.
    ///
    /// Rows sharing an identity id become multiple references of one entry.
    /// Entry order follows first appearance in `identities`.
    pub fn build(identities: &[EnrolledIdentity]) -> Result<Arc<Gallery>, GalleryError> {
        let mut entries: Vec<GalleryEntry> = Vec::new();
        let mut index: HashMap<IdentityId, usize> = HashMap::new();
        let mut skipped = 0usize;

        for identity in identities {
            let embedding = match &identity.embedding {
                Some(e) if identity.is_eligible() => e.clone(),
                _ => {
                    skipped += 1;
                    continue;
                }
            };

            match index.get(&identity.identity_id) {
                Some(&i) => entries[i].references.push(embedding),
                None => {
                    index.insert(identity.identity_id.clone(), entries.len());
                    entries.push(GalleryEntry {
                        identity_id: identity.identity_id.clone(),
                        display_name: identity.display_name.clone(),
                        references: vec![embedding],
                    });
                }
            }
        }

        if entries.is_empty() {
            return Err(GalleryError::EmptyGallery {
                total: identities.len(),
            });
        }

        tracing::debug!(
            identities = entries.len(),
            references = entries.iter().map(|e| e.references.len()).sum::<usize>(),
            skipped,
            "gallery built"
        );

        Ok(Arc::new(Gallery { entries }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EMBEDDING_DIM;

    fn row(id: &str, consent: bool, embedding: Option<Vec<f32>>) -> EnrolledIdentity {
        EnrolledIdentity {
            identity_id: id.into(),
            display_name: format!("Student {id}"),
            consent,
            embedding: embedding.map(Embedding::new),
        }
    }

    #[test]
    fn test_filters_ineligible() {
        let gallery = GalleryBuilder::build(&[
            row("ok", true, Some(vec![0.1; EMBEDDING_DIM])),
            row("no-consent", false, Some(vec![0.1; EMBEDDING_DIM])),
            row("no-embedding", true, None),
            row("short", true, Some(vec![0.1; 64])),
        ])
        .unwrap();

        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery.entries()[0].identity_id.as_str(), "ok");
    }

    #[test]
    fn test_empty_when_nothing_eligible() {
        let err = GalleryBuilder::build(&[row("x", false, Some(vec![0.1; EMBEDDING_DIM]))]).unwrap_err();
        assert_eq!(err, GalleryError::EmptyGallery { total: 1 });
        assert!(GalleryBuilder::build(&[]).is_err());
    }

    #[test]
    fn test_groups_references_by_id() {
        let gallery = GalleryBuilder::build(&[
            row("a", true, Some(vec![0.1; EMBEDDING_DIM])),
            row("b", true, Some(vec![0.2; EMBEDDING_DIM])),
            row("a", true, Some(vec![0.3; EMBEDDING_DIM])),
        ])
        .unwrap();

        assert_eq!(gallery.len(), 2);
        assert_eq!(gallery.entries()[0].references.len(), 2);
        assert_eq!(gallery.display_name(&"b".into()), Some("Student b"));
    }

    #[test]
    fn test_same_name_different_ids_stay_distinct() {
        let mut a = row("id-1", true, Some(vec![0.1; EMBEDDING_DIM]));
        let mut b = row("id-2", true, Some(vec![0.2; EMBEDDING_DIM]));
        a.display_name = "Alex Kim".into();
        b.display_name = "Alex Kim".into();

        let gallery = GalleryBuilder::build(&[a, b]).unwrap();
        assert_eq!(gallery.len(), 2);
    }

    #[test]
    fn test_rebuild_leaves_old_snapshot_intact() {
        let first = GalleryBuilder::build(&[row("a", true, Some(vec![0.1; EMBEDDING_DIM]))]).unwrap();
        let held = Arc::clone(&first);
        let second = GalleryBuilder::build(&[row("b", true, Some(vec![0.1; EMBEDDING_DIM]))]).unwrap();

        assert_eq!(held.entries()[0].identity_id.as_str(), "a");
        assert_eq!(second.entries()[0].identity_id.as_str(), "b");
    }
}
