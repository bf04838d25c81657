//! Scene registry: discovers scenes in the public L1C bucket and records
//! one catalog row per scene.

use futures::stream::{self, StreamExt};
use metrics::counter;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use sentinel_common::NUMBER_OF_UTM_ZONES;
use storage::{Catalog, LogTable, ObjectStorage, ParseStatus};

use crate::error::{IngestionError, Result};
use crate::tileinfo::{TileInfo, TILE_INFO_FILE};

/// Descriptors fetched concurrently during a sync.
const DEFAULT_FETCH_CONCURRENCY: usize = 16;

/// Result of syncing one UTM zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Another sync of the zone is pending or processing.
    AlreadyRunning,
    Finished { created: usize, failed: usize },
}

/// Totals of a [`SceneRegistry::drive`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriveSummary {
    pub zones_synced: usize,
    pub zones_skipped: usize,
    pub zones_failed: usize,
    pub scenes_created: usize,
}

/// Body of a new-product notification from the public bucket.
#[derive(Debug, Deserialize)]
struct ProductMessage {
    tiles: Vec<ProductTile>,
}

#[derive(Debug, Deserialize)]
struct ProductTile {
    path: String,
}

pub struct SceneRegistry {
    catalog: Catalog,
    l1c: Arc<ObjectStorage>,
    concurrency: usize,
}

impl SceneRegistry {
    pub fn new(catalog: Catalog, l1c: Arc<ObjectStorage>) -> Self {
        Self {
            catalog,
            l1c,
            concurrency: DEFAULT_FETCH_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Register every scene of a UTM zone that is not in the catalog yet.
    ///
    /// A scene whose descriptor cannot be read is logged to the parse log and
    /// skipped; it does not fail the sync. Any other error fails the parse
    /// log, so the next sync of the zone is not blocked by it.
    #[instrument(skip(self))]
    pub async fn sync(&self, zone: &str) -> Result<SyncOutcome> {
        let Some(log_id) = self.catalog.begin_parse_log(zone).await? else {
            info!(zone = %zone, "Zone is currently parsing, no new sync started");
            return Ok(SyncOutcome::AlreadyRunning);
        };

        match self.sync_zone(zone, log_id).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(zone = %zone, error = %e, "Zone sync failed");
                if let Err(log_err) = self.fail_parse_log(log_id, &e).await {
                    warn!(zone = %zone, error = %log_err, "Failed to record failed sync");
                }
                Err(e)
            }
        }
    }

    async fn sync_zone(&self, zone: &str, log_id: i64) -> Result<SyncOutcome> {
        self.catalog
            .set_parse_status(log_id, ParseStatus::Processing)
            .await?;
        self.parse_log(log_id, &format!("Started parsing utm zone \"{}\".", zone))
            .await?;

        let keys = self.l1c.list(&format!("tiles/{}/", zone)).await?;
        let prefixes: Vec<String> = keys
            .iter()
            .filter_map(|key| scene_prefix(key))
            .map(str::to_string)
            .collect();
        info!(zone = %zone, descriptors = prefixes.len(), "Listed scene descriptors");

        // Registrations share the catalog pool with the parse log, so every
        // one of them completes before the log is written.
        let results: Vec<(String, Result<Option<i64>>)> = stream::iter(prefixes)
            .map(|prefix| async move {
                let result = self.register_prefix(&prefix).await;
                (prefix, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut created = 0;
        let mut failed = 0;
        for (prefix, result) in results {
            match result {
                Ok(Some(_)) => {
                    created += 1;
                    self.parse_log(log_id, &format!("Registered {}", prefix)).await?;
                }
                Ok(None) => {}
                Err(e) => {
                    failed += 1;
                    warn!(prefix = %prefix, error = %e, "Failed registering scene");
                    self.parse_log(log_id, &format!("Failed registering {}: {}", prefix, e))
                        .await?;
                }
            }
        }

        counter!("sentinel_scenes_registered_total").increment(created as u64);
        self.catalog.set_parse_count(log_id, created as i64).await?;
        self.parse_log(
            log_id,
            &format!("Finished parsing, {} tiles created.", created),
        )
        .await?;
        self.catalog
            .set_parse_status(log_id, ParseStatus::Finished)
            .await?;

        info!(zone = %zone, created, failed, "Finished zone sync");
        Ok(SyncOutcome::Finished { created, failed })
    }

    async fn fail_parse_log(&self, log_id: i64, error: &IngestionError) -> Result<()> {
        self.parse_log(log_id, &format!("Failed parsing: {}", error))
            .await?;
        self.catalog
            .set_parse_status(log_id, ParseStatus::Failed)
            .await?;
        Ok(())
    }

    /// Sync all UTM zones one after the other.
    pub async fn drive(&self) -> DriveSummary {
        let mut summary = DriveSummary::default();
        for zone in 1..=NUMBER_OF_UTM_ZONES {
            match self.sync(&zone.to_string()).await {
                Ok(SyncOutcome::Finished { created, .. }) => {
                    summary.zones_synced += 1;
                    summary.scenes_created += created;
                }
                Ok(SyncOutcome::AlreadyRunning) => summary.zones_skipped += 1,
                Err(_) => summary.zones_failed += 1,
            }
        }
        summary
    }

    /// Register the scene under `prefix`. Returns `None` when it already exists.
    #[instrument(skip(self))]
    pub async fn register_prefix(&self, prefix: &str) -> Result<Option<i64>> {
        if self.catalog.scene_exists(prefix).await? {
            return Ok(None);
        }

        let body = self
            .l1c
            .get(&format!("{}{}", prefix, TILE_INFO_FILE))
            .await?;
        let scene = TileInfo::parse(prefix, &body)?.into_new_scene(prefix)?;
        Ok(self.catalog.insert_scene(&scene).await?)
    }

    /// Register the scenes announced by a new-product notification, e.g.
    /// `{"tiles": [{"path": "tiles/32/T/MR/2019/7/14/0"}]}`.
    ///
    /// Returns the ids of newly created scenes.
    pub async fn process_new_product_message(&self, message: &str) -> Result<Vec<i64>> {
        let message: ProductMessage = serde_json::from_str(message)
            .map_err(|e| IngestionError::descriptor("notification", e))?;

        let mut created = Vec::new();
        for tile in message.tiles {
            let mut prefix = tile.path;
            if !prefix.ends_with('/') {
                prefix.push('/');
            }
            if let Some(id) = self.register_prefix(&prefix).await? {
                info!(prefix = %prefix, scene = id, "Registered scene from notification");
                created.push(id);
            }
        }
        counter!("sentinel_scenes_registered_total").increment(created.len() as u64);
        Ok(created)
    }

    async fn parse_log(&self, log_id: i64, message: &str) -> Result<()> {
        Ok(self
            .catalog
            .append_log(LogTable::ParseLogs, log_id, message)
            .await?)
    }
}

/// Scene prefix (with trailing slash) of a descriptor key.
fn scene_prefix(key: &str) -> Option<&str> {
    let prefix = key.strip_suffix(TILE_INFO_FILE)?;
    if prefix.ends_with('/') {
        Some(prefix)
    } else {
        None
    }
}
