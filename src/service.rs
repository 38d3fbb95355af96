use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::api::{EditOptions, GenerationClient, GenerationOptions, GenerationResponse, SourceImage};
use crate::blob::BlobRegistry;
use crate::error::DriftError;
use crate::favorites::FavoriteStore;
use crate::images::{ImageStore, ImageView, QuotaFallback, StoredImage};
use crate::keys::KeyRing;
use crate::models;
use crate::storage::{KvStore, RecordStore, content_hash};

const SETTINGS_KEY: &str = "settings.json";
const API_KEYS_KEY: &str = "api-keys.json";

/// Byte budget for the persisted image history.
const IMAGE_QUOTA_BYTES: usize = 5 * 1024 * 1024;

/// Small user preferences, persisted as one JSON blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub model: String,
    pub size: String,
    pub quantity: u32,
    pub quality: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model: "flux".to_string(),
            size: "1024x1024".to_string(),
            quantity: 1,
            quality: "standard".to_string(),
        }
    }
}

/// The one service object owning all client state: the key ring, the image
/// and favorites collections, the blob registry, the staged edit sources,
/// and the user's settings. Constructed once per process and passed by
/// reference; nothing here lives in ambient globals.
///
/// Overlap policy: operations take `&mut self`, so within one service
/// instance calls are serialized by ownership. Two instances over the same
/// data directory race last-write-wins, which matches the single-user
/// client this backs.
pub struct DriftService {
    kv: KvStore,
    keys: KeyRing,
    images: ImageStore,
    favorites: FavoriteStore,
    client: GenerationClient,
    settings: Settings,
    staged: Vec<SourceImage>,
}

impl DriftService {
    /// Opens the service in the platform data directory.
    pub async fn open_default() -> Result<Self, DriftError> {
        let mut base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        base.push("drift");
        Self::open(base).await
    }

    pub async fn open(data_dir: impl Into<PathBuf>) -> Result<Self, DriftError> {
        Self::open_with_client(data_dir, GenerationClient::new()).await
    }

    pub async fn open_with_client(
        data_dir: impl Into<PathBuf>,
        client: GenerationClient,
    ) -> Result<Self, DriftError> {
        let data_dir = data_dir.into();
        let kv = KvStore::new(data_dir.clone());
        let registry = Arc::new(BlobRegistry::new());

        let keys = load_json(&kv, API_KEYS_KEY).await?.unwrap_or_default();
        let settings = load_json(&kv, SETTINGS_KEY).await?.unwrap_or_default();

        let images = ImageStore::open(
            &kv,
            RecordStore::new(&data_dir, "images", Some(IMAGE_QUOTA_BYTES)),
            registry.clone(),
            QuotaFallback::default(),
        )
        .await?;
        let favorites =
            FavoriteStore::open(RecordStore::new(&data_dir, "favorites", None), registry).await?;

        Ok(Self {
            kv,
            keys,
            images,
            favorites,
            client,
            settings,
            staged: Vec::new(),
        })
    }

    // --- generation -----------------------------------------------------

    /// Runs one generation call end to end: pick a credential, call the
    /// endpoint, record usage, persist the new images, return the
    /// refreshed collection view.
    pub async fn generate(
        &mut self,
        options: GenerationOptions,
    ) -> Result<Vec<ImageView>, DriftError> {
        let secret = self.checkout_key()?;
        let response = self.client.generate(&options, &secret).await?;
        self.keys.record_usage(&secret);
        self.persist_keys().await;
        let records = records_from_response(&options.prompt, &options.model, response);
        Ok(self.images.add(records).await)
    }

    /// Submits the staged source images for editing. The staging set is
    /// discarded on success and kept for retry on failure. Edits always
    /// produce new records; nothing is mutated in place.
    pub async fn edit(&mut self, options: EditOptions) -> Result<Vec<ImageView>, DriftError> {
        let secret = self.checkout_key()?;
        let response = self.client.edit(&options, &self.staged, &secret).await?;
        self.keys.record_usage(&secret);
        self.persist_keys().await;
        self.staged.clear();
        let records = records_from_response(&options.prompt, &options.model, response);
        Ok(self.images.add(records).await)
    }

    /// Build generation options for `prompt` from the stored settings.
    pub fn generation_options(&self, prompt: impl Into<String>) -> GenerationOptions {
        let mut options = GenerationOptions::new(self.settings.model.clone(), prompt);
        options.size = self.settings.size.clone();
        options.quantity = self.settings.quantity;
        options.quality = self.settings.quality.clone();
        options
    }

    fn checkout_key(&self) -> Result<String, DriftError> {
        if self.keys.is_empty() {
            return Err(DriftError::NoCredentials);
        }
        // non-empty ring with no candidate means every key is at quota
        self.keys
            .select_available()
            .ok_or(DriftError::KeysExhausted)
    }

    // --- image collection -----------------------------------------------

    pub fn images(&mut self) -> Vec<ImageView> {
        self.images.load_all()
    }

    pub async fn remove_image(&mut self, id: &str) -> Vec<ImageView> {
        self.images.remove(id).await
    }

    pub fn dispose(&self, views: &[ImageView]) {
        self.images.dispose(views);
    }

    // --- favorites ------------------------------------------------------

    /// Flips favorite state for `id`. Unknown ids are a no-op reported as
    /// "not favorite"; entries whose original was evicted from the main
    /// collection can still be unfavorited.
    pub async fn toggle_favorite(&mut self, id: &str) -> Result<bool, DriftError> {
        if let Some(record) = self.images.get(id).cloned() {
            Ok(self.favorites.toggle(&record).await?)
        } else if self.favorites.is_favorite(id) {
            self.favorites.remove(id).await?;
            Ok(false)
        } else {
            Ok(false)
        }
    }

    pub fn is_favorite(&self, id: &str) -> bool {
        self.favorites.is_favorite(id)
    }

    pub async fn favorites(&mut self) -> Result<Vec<ImageView>, DriftError> {
        Ok(self.favorites.list().await?)
    }

    // --- source image staging -------------------------------------------

    pub fn stage_source(&mut self, source: SourceImage) {
        self.staged.push(source);
    }

    /// Stages a previously generated image for editing, decoding the
    /// stored payload or downloading the hosted file.
    pub async fn stage_generated(&mut self, id: &str) -> Result<(), DriftError> {
        let Some(record) = self.images.get(id).cloned() else {
            return Ok(());
        };
        let source = source_from_record(&record).await?;
        if let Some(source) = source {
            self.staged.push(source);
        }
        Ok(())
    }

    pub fn remove_source(&mut self, index: usize) -> Option<SourceImage> {
        if index < self.staged.len() {
            Some(self.staged.remove(index))
        } else {
            None
        }
    }

    pub fn clear_sources(&mut self) {
        self.staged.clear();
    }

    pub fn sources(&self) -> &[SourceImage] {
        &self.staged
    }

    // --- credentials ----------------------------------------------------

    pub fn keys(&self) -> &KeyRing {
        &self.keys
    }

    pub async fn register_key(&mut self, secret: &str, rate_limit: Option<u32>) {
        self.keys.register(secret, rate_limit);
        self.persist_keys().await;
    }

    pub async fn remove_key(&mut self, secret: &str) {
        self.keys.unregister(secret);
        self.persist_keys().await;
    }

    pub async fn clear_keys(&mut self) {
        self.keys.clear();
        self.persist_keys().await;
    }

    pub async fn set_key_rate_limit(&mut self, secret: &str, rate_limit: u32) {
        self.keys.set_rate_limit(secret, rate_limit);
        self.persist_keys().await;
    }

    async fn persist_keys(&self) {
        match serde_json::to_vec(&self.keys) {
            Ok(blob) => {
                if let Err(err) = self.kv.put(API_KEYS_KEY, &blob).await {
                    warn!("api key snapshot not persisted: {err}");
                }
            }
            Err(err) => warn!("api key snapshot not serialized: {err}"),
        }
    }

    // --- settings -------------------------------------------------------

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Stores new settings, snapping size and quality back into the
    /// selected model's supported sets when a model switch left them
    /// invalid.
    pub async fn update_settings(&mut self, mut settings: Settings) {
        let sizes = models::available_sizes(&settings.model);
        if !sizes.contains(&settings.size.as_str()) {
            settings.size = sizes[0].to_string();
        }
        let qualities = models::available_qualities(&settings.model);
        if !qualities.contains(&settings.quality.as_str()) {
            settings.quality = qualities[0].to_string();
        }
        self.settings = settings;
        match serde_json::to_vec(&self.settings) {
            Ok(blob) => {
                if let Err(err) = self.kv.put(SETTINGS_KEY, &blob).await {
                    warn!("settings not persisted: {err}");
                }
            }
            Err(err) => warn!("settings not serialized: {err}"),
        }
    }
}

async fn load_json<T: serde::de::DeserializeOwned>(
    kv: &KvStore,
    key: &str,
) -> Result<Option<T>, DriftError> {
    let Some(bytes) = kv.get(key).await? else {
        return Ok(None);
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Ok(Some(value)),
        Err(err) => {
            warn!(key, "discarding unreadable stored value: {err}");
            Ok(None)
        }
    }
}

/// Maps response items onto durable records. Inline payloads are kept for
/// rehydration with no hosted URL; hosted items the other way round; items
/// with neither are dropped before they can reach the store.
fn records_from_response(
    prompt: &str,
    model: &str,
    response: GenerationResponse,
) -> Vec<StoredImage> {
    let now = Utc::now();
    let created = response.created;
    let mut records = Vec::with_capacity(response.data.len());
    for (index, item) in response.data.into_iter().enumerate() {
        let record = if let Some(b64) = item.b64_json {
            StoredImage {
                id: content_hash(format!("{model}:{prompt}:{created}:{index}:{b64}").as_bytes()),
                url: None,
                b64: Some(b64),
                prompt: prompt.to_string(),
                model: model.to_string(),
                created_at: now,
            }
        } else if let Some(url) = item.url.filter(|url| is_hosted_url(url)) {
            StoredImage {
                id: content_hash(format!("{model}:{prompt}:{created}:{index}:{url}").as_bytes()),
                url: Some(url),
                b64: None,
                prompt: prompt.to_string(),
                model: model.to_string(),
                created_at: now,
            }
        } else {
            warn!(index, "dropping result item with no renderable data");
            continue;
        };
        records.push(record);
    }
    debug!(count = records.len(), "mapped generation response");
    records
}

fn is_hosted_url(raw: &str) -> bool {
    Url::parse(raw)
        .map(|url| matches!(url.scheme(), "http" | "https"))
        .unwrap_or(false)
}

/// Rebuilds edit-ready bytes from a record: inline payloads decode
/// locally, hosted images are downloaded.
async fn source_from_record(record: &StoredImage) -> Result<Option<SourceImage>, DriftError> {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as BASE64;

    if let Some(b64) = record.b64.as_deref() {
        match BASE64.decode(b64) {
            Ok(bytes) => {
                return Ok(Some(SourceImage {
                    name: format!("{}.png", &record.id[..record.id.len().min(12)]),
                    mime_type: "image/png".to_string(),
                    bytes,
                }));
            }
            Err(err) => {
                warn!(id = %record.id, "cannot stage image with undecodable payload: {err}");
                return Ok(None);
            }
        }
    }
    let Some(url) = record.url.as_deref() else {
        return Ok(None);
    };
    let response = reqwest::get(url).await?;
    if !response.status().is_success() {
        return Err(DriftError::RemoteRejected {
            status: response.status().as_u16(),
            body: String::new(),
        });
    }
    let mime_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("image/png")
        .to_string();
    let bytes = response.bytes().await?.to_vec();
    Ok(Some(SourceImage {
        name: format!("{}.png", &record.id[..record.id.len().min(12)]),
        mime_type,
        bytes,
    }))
}
