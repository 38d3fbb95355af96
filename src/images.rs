use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::blob::BlobRegistry;
use crate::storage::{KvStore, Record, RecordStore, StorageError};

/// Storage key the pre-record-store flat list lived under.
pub(crate) const LEGACY_IMAGES_KEY: &str = "drift-images";

/// At most this many images are written through on each mutation; older
/// entries survive only in memory until the session ends.
const PERSIST_CAP: usize = 20;

/// Durable form of one generated or edited image. Exactly one of `url`
/// (hosted, valid across sessions) and `b64` (inline payload, rebuilt into
/// a local handle on every load) should be present; a record with neither
/// is unrenderable and is rejected at `add` time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredImage {
    pub id: String,
    pub url: Option<String>,
    pub b64: Option<String>,
    pub prompt: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

impl StoredImage {
    pub fn is_renderable(&self) -> bool {
        self.url.is_some() || self.b64.is_some()
    }
}

impl Record for StoredImage {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Render-ready projection of a [`StoredImage`]: `renderable` is either the
/// hosted URL or a registry handle freshly allocated from the inline
/// payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageView {
    pub id: String,
    pub renderable: String,
    pub prompt: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

/// Retry schedule for persisting under quota pressure: attempt sizes run
/// from `start` down to `floor` in `step` decrements. The defaults are a
/// tuning knob, not a contract.
#[derive(Debug, Clone, Copy)]
pub struct QuotaFallback {
    pub start: usize,
    pub step: usize,
    pub floor: usize,
}

impl Default for QuotaFallback {
    fn default() -> Self {
        Self {
            start: 15,
            step: 5,
            floor: 5,
        }
    }
}

/// Durable CRUD over the image collection. The in-memory collection is
/// authoritative for the session; every mutation writes through
/// best-effort, degrading to a smaller trailing subset (and finally to not
/// persisting at all) rather than failing the caller.
pub struct ImageStore {
    records: RecordStore<StoredImage>,
    registry: Arc<BlobRegistry>,
    items: Vec<StoredImage>,
    view_handles: Vec<String>,
    fallback: QuotaFallback,
}

impl ImageStore {
    /// Loads the persisted collection, importing the legacy flat list
    /// first if one is still around.
    pub async fn open(
        kv: &KvStore,
        records: RecordStore<StoredImage>,
        registry: Arc<BlobRegistry>,
        fallback: QuotaFallback,
    ) -> Result<Self, StorageError> {
        migrate_legacy(kv, &records).await?;
        let mut items = records.get_all().await?;
        sort_newest_first(&mut items);
        Ok(Self {
            records,
            registry,
            items,
            view_handles: Vec::new(),
            fallback,
        })
    }

    /// The full collection, newest first, hydrated for rendering. Handles
    /// allocated for the previous view are revoked before the new view is
    /// built, so repeated loads do not accumulate registry entries.
    pub fn load_all(&mut self) -> Vec<ImageView> {
        for handle in self.view_handles.drain(..) {
            self.registry.revoke(&handle);
        }
        let mut views = Vec::with_capacity(self.items.len());
        for record in &self.items {
            let Some(view) = hydrate(record, &self.registry) else {
                continue;
            };
            if BlobRegistry::is_handle(&view.renderable) {
                self.view_handles.push(view.renderable.clone());
            }
            views.push(view);
        }
        views
    }

    /// Upserts by id (an incoming record replaces an existing one in
    /// full), persists best-effort, and returns the refreshed view.
    /// Unrenderable records are dropped, never persisted.
    pub async fn add(&mut self, images: Vec<StoredImage>) -> Vec<ImageView> {
        for image in images {
            if !image.is_renderable() {
                warn!(id = %image.id, "dropping image with neither hosted url nor inline payload");
                continue;
            }
            self.items.retain(|existing| existing.id != image.id);
            self.items.push(image);
        }
        sort_newest_first(&mut self.items);
        self.persist().await;
        self.load_all()
    }

    /// Deletes by id; removing an unknown id is a no-op.
    pub async fn remove(&mut self, id: &str) -> Vec<ImageView> {
        self.items.retain(|image| image.id != id);
        self.persist().await;
        self.load_all()
    }

    /// Releases the local handles held by `views`. Hosted URLs pass
    /// through untouched.
    pub fn dispose(&self, views: &[ImageView]) {
        for view in views {
            if BlobRegistry::is_handle(&view.renderable) {
                self.registry.revoke(&view.renderable);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&StoredImage> {
        self.items.iter().find(|image| image.id == id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Write-through. Quota pressure degrades to smaller trailing subsets
    /// of the most recent images; any other storage failure, or running
    /// out of attempts, leaves the durable copy stale and the in-memory
    /// collection untouched.
    async fn persist(&self) {
        let cap = self.items.len().min(PERSIST_CAP);
        let mut last_err = match self.records.replace_all(&self.items[..cap]).await {
            Ok(()) => return,
            Err(err) => err,
        };
        if matches!(last_err, StorageError::QuotaExceeded { .. }) {
            let mut attempt = self.fallback.start;
            loop {
                let subset = &self.items[..attempt.min(self.items.len())];
                match self.records.replace_all(subset).await {
                    Ok(()) => {
                        warn!(
                            kept = subset.len(),
                            total = self.items.len(),
                            "image history trimmed to fit storage quota"
                        );
                        return;
                    }
                    Err(err) => last_err = err,
                }
                let retryable = matches!(last_err, StorageError::QuotaExceeded { .. });
                if !retryable || attempt <= self.fallback.floor || self.fallback.step == 0 {
                    break;
                }
                attempt = attempt
                    .saturating_sub(self.fallback.step)
                    .max(self.fallback.floor);
            }
        }
        warn!("image history not persisted: {last_err}");
    }
}

/// Turns one record into its render-ready view, decoding and registering
/// the inline payload when the image has no hosted URL. Returns `None` for
/// records that cannot be rendered; the caller skips them instead of
/// failing the load.
pub(crate) fn hydrate(record: &StoredImage, registry: &BlobRegistry) -> Option<ImageView> {
    let renderable = if let Some(b64) = record.b64.as_deref() {
        let bytes = match BASE64.decode(b64) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(id = %record.id, "skipping image with undecodable payload: {err}");
                return None;
            }
        };
        if let Err(err) = image::load_from_memory(&bytes) {
            warn!(id = %record.id, "skipping image with unrenderable payload: {err}");
            return None;
        }
        registry.create(bytes)
    } else if let Some(url) = record.url.clone() {
        url
    } else {
        warn!(id = %record.id, "skipping image with no renderable reference");
        return None;
    };
    Some(ImageView {
        id: record.id.clone(),
        renderable,
        prompt: record.prompt.clone(),
        model: record.model.clone(),
        created_at: record.created_at,
    })
}

fn sort_newest_first(items: &mut [StoredImage]) {
    items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

/// Flat-list entry from the pre-record-store format.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyImage {
    id: String,
    url: String,
    prompt: String,
    model: String,
    created_at: String,
    #[serde(default)]
    b64: Option<String>,
}

impl LegacyImage {
    fn into_record(self) -> Option<StoredImage> {
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .ok()?
            .with_timezone(&Utc);
        // A stale local handle is worthless without its payload.
        let url = match self.b64 {
            Some(_) => None,
            None if self.url.is_empty() || BlobRegistry::is_handle(&self.url) => return None,
            None => Some(self.url),
        };
        Some(StoredImage {
            id: self.id,
            url,
            b64: self.b64,
            prompt: self.prompt,
            model: self.model,
            created_at,
        })
    }
}

/// One-shot import of the legacy flat list into the record store. Parse
/// failure is swallowed and treated as no legacy data; either way the
/// legacy key is deleted so the import never runs twice.
async fn migrate_legacy(
    kv: &KvStore,
    records: &RecordStore<StoredImage>,
) -> Result<(), StorageError> {
    let Some(bytes) = kv.get(LEGACY_IMAGES_KEY).await? else {
        return Ok(());
    };
    match serde_json::from_slice::<Vec<LegacyImage>>(&bytes) {
        Ok(entries) => {
            for entry in entries {
                if let Some(record) = entry.into_record() {
                    records.put(&record).await?;
                }
            }
        }
        Err(err) => warn!("discarding unreadable legacy image history: {err}"),
    }
    kv.delete(LEGACY_IMAGES_KEY).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    // base64 of a valid 1x1 RGBA PNG
    pub(crate) const TINY_PNG_B64: &str =
        "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR4nGP4z8DwHwAFAAH/iZk9HQAAAABJRU5ErkJggg==";

    fn stores(dir: &Path, quota: Option<usize>) -> (KvStore, RecordStore<StoredImage>) {
        (
            KvStore::new(dir.to_path_buf()),
            RecordStore::new(dir, "images", quota),
        )
    }

    fn hosted(id: &str, offset_secs: i64) -> StoredImage {
        StoredImage {
            id: id.to_string(),
            url: Some(format!("https://img.example/{id}.png")),
            b64: None,
            prompt: "p".to_string(),
            model: "flux".to_string(),
            created_at: DateTime::from_timestamp(1_700_000_000 + offset_secs, 0).unwrap(),
        }
    }

    fn inline(id: &str, offset_secs: i64) -> StoredImage {
        StoredImage {
            id: id.to_string(),
            url: None,
            b64: Some(TINY_PNG_B64.to_string()),
            prompt: "p".to_string(),
            model: "gpt-image-1".to_string(),
            created_at: DateTime::from_timestamp(1_700_000_000 + offset_secs, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn inline_payload_round_trips_to_identical_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let (kv, records) = stores(dir.path(), None);
        let registry = Arc::new(BlobRegistry::new());
        let mut store =
            ImageStore::open(&kv, records, registry.clone(), QuotaFallback::default())
                .await
                .unwrap();

        let views = store.add(vec![inline("x", 0)]).await;
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].id, "x");
        assert!(BlobRegistry::is_handle(&views[0].renderable));
        let bytes = registry.resolve(&views[0].renderable).unwrap();
        assert_eq!(bytes, BASE64.decode(TINY_PNG_B64).unwrap());
    }

    #[tokio::test]
    async fn load_all_returns_newest_first_regardless_of_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let (kv, records) = stores(dir.path(), None);
        let mut store = ImageStore::open(
            &kv,
            records,
            Arc::new(BlobRegistry::new()),
            QuotaFallback::default(),
        )
        .await
        .unwrap();

        store
            .add(vec![hosted("old", 0), hosted("new", 100), hosted("mid", 50)])
            .await;
        let views = store.load_all();
        let ids: Vec<&str> = views.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
    }

    #[tokio::test]
    async fn add_replaces_records_with_matching_ids() {
        let dir = tempfile::tempdir().unwrap();
        let (kv, records) = stores(dir.path(), None);
        let mut store = ImageStore::open(
            &kv,
            records,
            Arc::new(BlobRegistry::new()),
            QuotaFallback::default(),
        )
        .await
        .unwrap();

        store.add(vec![hosted("x", 0)]).await;
        let mut replacement = hosted("x", 10);
        replacement.prompt = "updated".to_string();
        let views = store.add(vec![replacement]).await;
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].prompt, "updated");
    }

    #[tokio::test]
    async fn removing_twice_matches_removing_once() {
        let dir = tempfile::tempdir().unwrap();
        let (kv, records) = stores(dir.path(), None);
        let mut store = ImageStore::open(
            &kv,
            records,
            Arc::new(BlobRegistry::new()),
            QuotaFallback::default(),
        )
        .await
        .unwrap();

        store.add(vec![hosted("a", 0), hosted("b", 1)]).await;
        let once = store.remove("a").await;
        let twice = store.remove("a").await;
        assert_eq!(once, twice);
        assert_eq!(twice.len(), 1);
        assert_eq!(twice[0].id, "b");
    }

    #[tokio::test]
    async fn unrenderable_images_are_never_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let (kv, records) = stores(dir.path(), None);
        let mut store = ImageStore::open(
            &kv,
            records.clone(),
            Arc::new(BlobRegistry::new()),
            QuotaFallback::default(),
        )
        .await
        .unwrap();

        let mut bad = hosted("bad", 0);
        bad.url = None;
        let views = store.add(vec![bad, hosted("good", 1)]).await;
        assert_eq!(views.len(), 1);
        assert_eq!(records.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn undecodable_payloads_are_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (kv, records) = stores(dir.path(), None);
        let mut store = ImageStore::open(
            &kv,
            records,
            Arc::new(BlobRegistry::new()),
            QuotaFallback::default(),
        )
        .await
        .unwrap();

        let mut broken = inline("broken", 0);
        broken.b64 = Some("@@not-base64@@".to_string());
        let views = store.add(vec![broken, hosted("ok", 1)]).await;
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].id, "ok");
        // still in the collection, only the view skips it
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn repeated_loads_do_not_accumulate_handles() {
        let dir = tempfile::tempdir().unwrap();
        let (kv, records) = stores(dir.path(), None);
        let registry = Arc::new(BlobRegistry::new());
        let mut store =
            ImageStore::open(&kv, records, registry.clone(), QuotaFallback::default())
                .await
                .unwrap();

        store.add(vec![inline("a", 0), inline("b", 1)]).await;
        for _ in 0..5 {
            store.load_all();
        }
        assert_eq!(registry.len(), 2);
        let views = store.load_all();
        store.dispose(&views);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn quota_pressure_trims_the_persisted_subset_only() {
        let dir = tempfile::tempdir().unwrap();
        let images: Vec<StoredImage> = (0..25).map(|i| hosted(&format!("img-{i:02}"), i)).collect();

        // quota that exactly fits the 15 most recent records
        let mut sorted = images.clone();
        sort_newest_first(&mut sorted);
        let quota: usize = sorted
            .iter()
            .take(15)
            .map(|img| serde_json::to_vec_pretty(img).unwrap().len())
            .sum();

        let (kv, records) = stores(dir.path(), Some(quota));
        let mut store = ImageStore::open(
            &kv,
            records.clone(),
            Arc::new(BlobRegistry::new()),
            QuotaFallback::default(),
        )
        .await
        .unwrap();

        let views = store.add(images).await;
        // the in-memory view keeps everything for the rest of the session
        assert_eq!(views.len(), 25);
        assert_eq!(records.get_all().await.unwrap().len(), 15);

        // a reload only sees the persisted subset, newest first
        let mut reopened = ImageStore::open(
            &kv,
            records,
            Arc::new(BlobRegistry::new()),
            QuotaFallback::default(),
        )
        .await
        .unwrap();
        let views = reopened.load_all();
        let ids: Vec<&str> = views.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids.len(), 15);
        assert_eq!(ids[0], "img-24");
        assert_eq!(ids[14], "img-10");
    }

    #[tokio::test]
    async fn exceeding_every_attempt_keeps_the_memory_view() {
        let dir = tempfile::tempdir().unwrap();
        let (kv, records) = stores(dir.path(), Some(4));
        let mut store = ImageStore::open(
            &kv,
            records.clone(),
            Arc::new(BlobRegistry::new()),
            QuotaFallback::default(),
        )
        .await
        .unwrap();

        let views = store.add((0..8).map(|i| hosted(&format!("i{i}"), i)).collect()).await;
        assert_eq!(views.len(), 8);
        assert!(records.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn legacy_flat_list_is_imported_once_and_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let (kv, records) = stores(dir.path(), None);
        let legacy = serde_json::json!([
            {
                "id": "legacy-hosted",
                "url": "https://img.example/old.png",
                "prompt": "p",
                "model": "flux",
                "createdAt": "2024-01-01T00:00:00Z"
            },
            {
                "id": "legacy-inline",
                "url": "blob:drift/deadbeef",
                "prompt": "p",
                "model": "gpt-image-1",
                "createdAt": "2024-01-02T00:00:00Z",
                "b64": TINY_PNG_B64
            }
        ]);
        kv.put(LEGACY_IMAGES_KEY, &serde_json::to_vec(&legacy).unwrap())
            .await
            .unwrap();

        let mut store = ImageStore::open(
            &kv,
            records,
            Arc::new(BlobRegistry::new()),
            QuotaFallback::default(),
        )
        .await
        .unwrap();
        let views = store.load_all();
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].id, "legacy-inline");
        assert!(BlobRegistry::is_handle(&views[0].renderable));
        assert_eq!(views[1].renderable, "https://img.example/old.png");
        assert!(!kv.exists(LEGACY_IMAGES_KEY).await.unwrap());
    }

    #[tokio::test]
    async fn corrupt_legacy_blob_counts_as_no_legacy_data() {
        let dir = tempfile::tempdir().unwrap();
        let (kv, records) = stores(dir.path(), None);
        kv.put(LEGACY_IMAGES_KEY, b"{{{").await.unwrap();

        let mut store = ImageStore::open(
            &kv,
            records,
            Arc::new(BlobRegistry::new()),
            QuotaFallback::default(),
        )
        .await
        .unwrap();
        assert!(store.load_all().is_empty());
        assert!(!kv.exists(LEGACY_IMAGES_KEY).await.unwrap());
    }
}
