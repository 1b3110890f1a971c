use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::storage::{KeyValueStore, COLLECTIONS_KEY};

#[derive(Debug, Clone, Default)]
pub struct Selection {
    ids: HashSet<String>,
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether `id` is selected after the toggle.
    pub fn toggle(&mut self, id: &str) -> bool {
        if self.ids.remove(id) {
            false
        } else {
            self.ids.insert(id.to_string());
            true
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Selected ids in a stable order.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.ids.iter().cloned().collect();
        ids.sort();
        ids
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub post_ids: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

/// Named groupings of record ids, written through to local storage on every
/// change.
pub struct Collections {
    store: Arc<dyn KeyValueStore>,
    items: BTreeMap<String, Collection>,
}

impl Collections {
    /// Loads the stored mapping. Unreadable or corrupt data starts empty.
    pub fn load(store: Arc<dyn KeyValueStore>) -> Self {
        let items = match store.get(COLLECTIONS_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<BTreeMap<String, Collection>>(&raw) {
                Ok(items) => items,
                Err(err) => {
                    warn!("ignoring unreadable collections: {err}");
                    BTreeMap::new()
                }
            },
            Ok(None) => BTreeMap::new(),
            Err(err) => {
                warn!("could not read collections: {err:#}");
                BTreeMap::new()
            }
        };
        Self { store, items }
    }

    pub fn get(&self, id: &str) -> Option<&Collection> {
        self.items.get(id)
    }

    /// Collections oldest first.
    pub fn list(&self) -> Vec<&Collection> {
        let mut all: Vec<&Collection> = self.items.values().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        all
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn create(&mut self, name: &str) -> Result<String> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidRequest("collection name is required".into()));
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.items.insert(
            id.clone(),
            Collection {
                id: id.clone(),
                name: name.to_string(),
                post_ids: BTreeSet::new(),
                created_at: Utc::now(),
            },
        );
        self.persist();
        Ok(id)
    }

    pub fn add<I, S>(&mut self, collection_id: &str, ids: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let collection = self.find_mut(collection_id)?;
        collection.post_ids.extend(ids.into_iter().map(Into::into));
        self.persist();
        Ok(())
    }

    pub fn remove<I, S>(&mut self, collection_id: &str, ids: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let collection = self.find_mut(collection_id)?;
        for id in ids {
            collection.post_ids.remove(id.as_ref());
        }
        self.persist();
        Ok(())
    }

    pub fn rename(&mut self, collection_id: &str, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidRequest("collection name is required".into()));
        }
        self.find_mut(collection_id)?.name = name.to_string();
        self.persist();
        Ok(())
    }

    /// Deleting an absent collection is not an error.
    pub fn delete(&mut self, collection_id: &str) {
        if self.items.remove(collection_id).is_some() {
            self.persist();
        }
    }

    fn find_mut(&mut self, collection_id: &str) -> Result<&mut Collection> {
        self.items
            .get_mut(collection_id)
            .ok_or_else(|| Error::NotFound(format!("collection {collection_id}")))
    }

    fn persist(&self) {
        let payload = match serde_json::to_string(&self.items) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("could not encode collections: {err}");
                return;
            }
        };
        if let Err(err) = self.store.set(COLLECTIONS_KEY, &payload) {
            warn!("collections kept in memory only: {err:#}");
        }
    }
}
