//! Face enrollment registry: one committed template per user.

use crate::store::{self, Store};
use chrono::{DateTime, Utc};
use rollcall_core::{Embedding, FaceTemplate};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("encoding is empty or contains non-finite values")]
    InvalidEncoding,
    #[error("encoding has {actual} dimensions, enrolled templates have {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub count: usize,
    pub last_registered_at: Option<DateTime<Utc>>,
}

pub struct FaceRegistry {
    templates: Vec<FaceTemplate>,
    store: Box<dyn Store<FaceTemplate>>,
}

impl FaceRegistry {
    /// Load persisted templates. If a user appears more than once only the
    /// last entry survives.
    pub fn open(store: Box<dyn Store<FaceTemplate>>) -> Self {
        let loaded = store::load_or_empty(store.as_ref());
        let total = loaded.len();

        let mut templates: Vec<FaceTemplate> = Vec::with_capacity(total);
        for template in loaded {
            templates.retain(|t| t.user_id != template.user_id);
            templates.push(template);
        }
        if templates.len() != total {
            tracing::warn!(
                dropped = total - templates.len(),
                "collapsed duplicate face registrations"
            );
        }

        tracing::debug!(count = templates.len(), "loaded face registrations");
        Self { templates, store }
    }

    fn persist(&self) {
        store::save_logged(self.store.as_ref(), &self.templates);
    }

    /// Commit `encoding` as the template for `user_id`, replacing any
    /// previous one. The new template moves to the end of the list.
    pub fn register(
        &mut self,
        user_id: &str,
        user_name: &str,
        encoding: Embedding,
    ) -> Result<FaceTemplate, RegistryError> {
        if !encoding.is_usable() {
            return Err(RegistryError::InvalidEncoding);
        }
        if let Some(other) = self.templates.iter().find(|t| t.user_id != user_id) {
            let expected = other.encoding.dimension();
            if expected != encoding.dimension() {
                return Err(RegistryError::DimensionMismatch {
                    expected,
                    actual: encoding.dimension(),
                });
            }
        }

        let replaced = self.remove_entry(user_id);
        let template = FaceTemplate {
            user_id: user_id.to_string(),
            user_name: user_name.to_string(),
            encoding,
            registered_at: Utc::now(),
        };
        self.templates.push(template.clone());
        self.persist();

        tracing::info!(user_id, replaced, dim = template.encoding.dimension(), "face registered");
        Ok(template)
    }

    fn remove_entry(&mut self, user_id: &str) -> bool {
        let before = self.templates.len();
        self.templates.retain(|t| t.user_id != user_id);
        self.templates.len() != before
    }

    /// Returns true when a template existed and was removed.
    pub fn unregister(&mut self, user_id: &str) -> bool {
        let removed = self.remove_entry(user_id);
        if removed {
            self.persist();
            tracing::info!(user_id, "face unregistered");
        }
        removed
    }

    pub fn is_registered(&self, user_id: &str) -> bool {
        self.templates.iter().any(|t| t.user_id == user_id)
    }

    /// Templates in registration order, most recent last.
    pub fn list_all(&self) -> &[FaceTemplate] {
        &self.templates
    }

    /// Owned copy of every template, for handing to the matching engine.
    pub fn gallery(&self) -> Vec<FaceTemplate> {
        self.templates.clone()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            count: self.templates.len(),
            last_registered_at: self.templates.iter().map(|t| t.registered_at).max(),
        }
    }

    /// Keep the denormalized display name in step with the user record.
    pub fn rename_user(&mut self, user_id: &str, user_name: &str) -> bool {
        let Some(template) = self.templates.iter_mut().find(|t| t.user_id == user_id) else {
            return false;
        };
        if template.user_name == user_name {
            return false;
        }
        template.user_name = user_name.to_string();
        self.persist();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn registry() -> (FaceRegistry, MemoryStore<FaceTemplate>) {
        let backing = MemoryStore::default();
        (FaceRegistry::open(Box::new(backing.clone())), backing)
    }

    #[test]
    fn test_reregistration_replaces_and_moves_last() {
        let (mut reg, backing) = registry();
        reg.register("1", "Alice", emb(&[1.0, 0.0])).unwrap();
        reg.register("2", "Bob", emb(&[0.0, 1.0])).unwrap();
        reg.register("1", "Alice", emb(&[0.6, 0.8])).unwrap();

        let ids: Vec<&str> = reg.list_all().iter().map(|t| t.user_id.as_str()).collect();
        assert_eq!(ids, vec!["2", "1"]);
        assert_eq!(reg.list_all()[1].encoding.values, vec![0.6, 0.8]);
        assert_eq!(backing.snapshot().len(), 2);
    }

    #[test]
    fn test_unregister() {
        let (mut reg, _) = registry();
        assert!(!reg.unregister("9"));

        reg.register("3", "Alice", emb(&[1.0, 0.0])).unwrap();
        assert!(reg.is_registered("3"));
        assert!(reg.unregister("3"));
        assert!(!reg.is_registered("3"));
    }

    #[test]
    fn test_rejects_unusable_and_mismatched_encodings() {
        let (mut reg, backing) = registry();
        assert_eq!(reg.register("1", "A", emb(&[])), Err(RegistryError::InvalidEncoding));
        assert_eq!(reg.register("1", "A", emb(&[f32::NAN, 1.0])), Err(RegistryError::InvalidEncoding));

        reg.register("1", "A", emb(&[1.0, 0.0])).unwrap();
        assert_eq!(
            reg.register("2", "B", emb(&[1.0, 0.0, 0.0])),
            Err(RegistryError::DimensionMismatch { expected: 2, actual: 3 })
        );
        assert_eq!(backing.snapshot().len(), 1);
    }

    #[test]
    fn test_sole_user_may_change_dimension() {
        let (mut reg, _) = registry();
        reg.register("1", "A", emb(&[1.0, 0.0])).unwrap();
        reg.register("1", "A", emb(&[1.0, 0.0, 0.0])).unwrap();
        assert_eq!(reg.list_all()[0].encoding.dimension(), 3);
    }

    #[test]
    fn test_stats() {
        let (mut reg, _) = registry();
        assert_eq!(reg.stats(), RegistryStats { count: 0, last_registered_at: None });

        reg.register("1", "A", emb(&[1.0])).unwrap();
        let second = reg.register("2", "B", emb(&[1.0])).unwrap();
        let stats = reg.stats();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.last_registered_at, Some(second.registered_at));
    }

    #[test]
    fn test_open_collapses_duplicates_keeping_last() {
        let now = Utc::now();
        let t = |id: &str, v: f32| FaceTemplate {
            user_id: id.into(),
            user_name: id.into(),
            encoding: emb(&[v]),
            registered_at: now,
        };
        let backing = MemoryStore::with_items(vec![t("1", 1.0), t("2", 2.0), t("1", 3.0)]);
        let reg = FaceRegistry::open(Box::new(backing));

        assert_eq!(reg.list_all().len(), 2);
        assert_eq!(reg.list_all()[1].user_id, "1");
        assert_eq!(reg.list_all()[1].encoding.values, vec![3.0]);
    }

    #[test]
    fn test_survives_failed_writes_in_memory() {
        let (mut reg, backing) = registry();
        backing.set_fail_writes(true);
        reg.register("1", "A", emb(&[1.0])).unwrap();
        assert!(reg.is_registered("1"));
        assert!(backing.snapshot().is_empty());
    }

    #[test]
    fn test_rename_user() {
        let (mut reg, backing) = registry();
        reg.register("1", "Alice", emb(&[1.0])).unwrap();
        assert!(reg.rename_user("1", "Alice Johnson"));
        assert!(!reg.rename_user("1", "Alice Johnson"));
        assert!(!reg.rename_user("2", "Nobody"));
        assert_eq!(backing.snapshot()[0].user_name, "Alice Johnson");
    }
}
