use std::collections::HashSet;
use std::sync::Arc;

use crate::blob::BlobRegistry;
use crate::images::{ImageView, StoredImage, hydrate};
use crate::storage::{RecordStore, StorageError};

/// Favorites are full image snapshots in their own collection, duplicated
/// at the moment of favoriting so they outlive eviction of the original
/// record from the main history.
pub struct FavoriteStore {
    records: RecordStore<StoredImage>,
    registry: Arc<BlobRegistry>,
    ids: HashSet<String>,
    view_handles: Vec<String>,
}

impl FavoriteStore {
    pub async fn open(
        records: RecordStore<StoredImage>,
        registry: Arc<BlobRegistry>,
    ) -> Result<Self, StorageError> {
        let ids = records
            .get_all()
            .await?
            .into_iter()
            .map(|record| record.id)
            .collect();
        Ok(Self {
            records,
            registry,
            ids,
            view_handles: Vec::new(),
        })
    }

    /// Favorites `image` if it is not already marked, unmarks it
    /// otherwise. Returns the new state.
    pub async fn toggle(&mut self, image: &StoredImage) -> Result<bool, StorageError> {
        if self.ids.contains(&image.id) {
            self.records.delete(&image.id).await?;
            self.ids.remove(&image.id);
            Ok(false)
        } else {
            self.records.put(image).await?;
            self.ids.insert(image.id.clone());
            Ok(true)
        }
    }

    /// Unmarks by id alone, for entries whose original record is gone.
    pub async fn remove(&mut self, id: &str) -> Result<(), StorageError> {
        self.records.delete(id).await?;
        self.ids.remove(id);
        Ok(())
    }

    pub fn is_favorite(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(|id| id.as_str())
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Hydrated favorite views, newest first. Like the main collection,
    /// handles from the previous call are revoked before new ones are
    /// allocated.
    pub async fn list(&mut self) -> Result<Vec<ImageView>, StorageError> {
        for handle in self.view_handles.drain(..) {
            self.registry.revoke(&handle);
        }
        let mut records = self.records.get_all().await?;
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let mut views = Vec::with_capacity(records.len());
        for record in &records {
            let Some(view) = hydrate(record, &self.registry) else {
                continue;
            };
            if BlobRegistry::is_handle(&view.renderable) {
                self.view_handles.push(view.renderable.clone());
            }
            views.push(view);
        }
        Ok(views)
    }
}
