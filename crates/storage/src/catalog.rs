//! Relational catalog of scenes, composites, layers and builds (SQLite via sqlx).
//!
//! Status transitions that gate scheduling are single conditional `UPDATE`s so
//! that concurrent callers observe a consistent winner. Every transition also
//! appends a line to the entity's text log.

use std::path::Path;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, QueryBuilder, Sqlite};
use tracing::{debug, info};

use sentinel_common::{
    BoundingBox, Geometry, LayerKind, SentinelError, SentinelResult, TileCoord, SENTINEL_NODATA,
};

use crate::models::*;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS scenes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    prefix TEXT NOT NULL UNIQUE,
    utm_zone INTEGER NOT NULL,
    latitude_band TEXT NOT NULL,
    grid_square TEXT NOT NULL,
    collected_at TEXT NOT NULL,
    cloudiness_percentage REAL NOT NULL,
    data_coverage_percentage REAL NOT NULL,
    footprint TEXT NOT NULL,
    data_geometry TEXT,
    min_lon REAL NOT NULL,
    min_lat REAL NOT NULL,
    max_lon REAL NOT NULL,
    max_lat REAL NOT NULL,
    sun_azimuth REAL NOT NULL,
    sun_altitude REAL NOT NULL,
    datastrip_id TEXT NOT NULL,
    product_name TEXT NOT NULL,
    level TEXT NOT NULL DEFAULT 'L1C',
    status TEXT NOT NULL DEFAULT 'unprocessed',
    retry_count INTEGER NOT NULL DEFAULT 0,
    log TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_scenes_collected ON scenes(collected_at);
CREATE INDEX IF NOT EXISTS idx_scenes_status ON scenes(status);

CREATE TABLE IF NOT EXISTS composites (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    min_date TEXT NOT NULL,
    max_date TEXT NOT NULL,
    max_cloudiness REAL NOT NULL,
    scene_ids TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS layers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    scene_id INTEGER REFERENCES scenes(id) ON DELETE CASCADE,
    composite_id INTEGER REFERENCES composites(id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    datatype INTEGER NOT NULL,
    nodata INTEGER NOT NULL,
    max_zoom INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_layers_scene ON layers(scene_id);
CREATE INDEX IF NOT EXISTS idx_layers_composite ON layers(composite_id);

CREATE TABLE IF NOT EXISTS tiles (
    layer_id INTEGER NOT NULL REFERENCES layers(id) ON DELETE CASCADE,
    z INTEGER NOT NULL,
    x INTEGER NOT NULL,
    y INTEGER NOT NULL,
    PRIMARY KEY (layer_id, z, x, y)
);

CREATE TABLE IF NOT EXISTS composite_tiles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    composite_id INTEGER NOT NULL REFERENCES composites(id) ON DELETE CASCADE,
    z INTEGER NOT NULL,
    x INTEGER NOT NULL,
    y INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'unprocessed',
    scorer TEXT,
    scheduled_at TEXT,
    started_at TEXT,
    finished_at TEXT,
    log TEXT NOT NULL DEFAULT '',
    UNIQUE (composite_id, z, x, y)
);

CREATE TABLE IF NOT EXISTS composite_builds (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    composite_id INTEGER NOT NULL REFERENCES composites(id) ON DELETE CASCADE,
    aoi TEXT NOT NULL,
    scorer TEXT,
    status TEXT NOT NULL DEFAULT 'unprocessed',
    scheduled_at TEXT,
    started_at TEXT,
    finished_at TEXT,
    log TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS composite_build_scenes (
    build_id INTEGER NOT NULL REFERENCES composite_builds(id) ON DELETE CASCADE,
    scene_id INTEGER NOT NULL REFERENCES scenes(id) ON DELETE CASCADE,
    PRIMARY KEY (build_id, scene_id)
);

CREATE TABLE IF NOT EXISTS composite_build_tiles (
    build_id INTEGER NOT NULL REFERENCES composite_builds(id) ON DELETE CASCADE,
    composite_tile_id INTEGER NOT NULL REFERENCES composite_tiles(id) ON DELETE CASCADE,
    PRIMARY KEY (build_id, composite_tile_id)
);

CREATE TABLE IF NOT EXISTS parse_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    utm_zone TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    scenes_created INTEGER NOT NULL DEFAULT 0,
    started_at TEXT,
    finished_at TEXT,
    log TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_parse_logs_zone ON parse_logs(utm_zone, status)
"#;

const SCENE_COLUMNS: &str = "id, prefix, utm_zone, latitude_band, grid_square, collected_at, \
    cloudiness_percentage, data_coverage_percentage, footprint, data_geometry, sun_azimuth, \
    sun_altitude, datastrip_id, product_name, level, status, retry_count, log";

const COMPOSITE_TILE_COLUMNS: &str =
    "id, composite_id, z, x, y, status, scorer, scheduled_at, started_at, finished_at, log";

/// Tables carrying an append-only `log` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTable {
    Scenes,
    CompositeTiles,
    CompositeBuilds,
    ParseLogs,
}

impl LogTable {
    fn name(&self) -> &'static str {
        match self {
            Self::Scenes => "scenes",
            Self::CompositeTiles => "composite_tiles",
            Self::CompositeBuilds => "composite_builds",
            Self::ParseLogs => "parse_logs",
        }
    }
}

fn db(e: sqlx::Error) -> SentinelError {
    SentinelError::DatabaseError(e.to_string())
}

fn now() -> String {
    timestamp(&Utc::now())
}

fn timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_timestamp(s: &str) -> SentinelResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SentinelError::DatabaseError(format!("bad timestamp '{}': {}", s, e)))
}

fn parse_opt_timestamp(s: Option<String>) -> SentinelResult<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_timestamp).transpose()
}

fn parse_date(s: &str) -> SentinelResult<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| SentinelError::DatabaseError(format!("bad date '{}': {}", s, e)))
}

/// Database connection pool and catalog operations.
#[derive(Clone)]
pub struct Catalog {
    pool: SqlitePool,
}

impl Catalog {
    /// Open or create a catalog database file.
    pub async fn open(path: &Path) -> SentinelResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| SentinelError::DatabaseError(format!("Connection failed: {}", e)))?;

        let catalog = Self { pool };
        catalog.migrate().await?;
        info!(path = %path.display(), "Opened catalog database");
        Ok(catalog)
    }

    /// Connect using a `DATABASE_URL` style string: a file path,
    /// `sqlite://path` or `sqlite::memory:`.
    pub async fn connect(database_url: &str) -> SentinelResult<Self> {
        if database_url == "sqlite::memory:" || database_url == ":memory:" {
            return Self::open_memory().await;
        }
        let path = database_url
            .strip_prefix("sqlite://")
            .or_else(|| database_url.strip_prefix("sqlite:"))
            .unwrap_or(database_url);
        Self::open(Path::new(path)).await
    }

    /// Open an in-memory database (for testing).
    pub async fn open_memory() -> SentinelResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(db)?;

        let catalog = Self { pool };
        catalog.migrate().await?;
        Ok(catalog)
    }

    /// Create tables and indices.
    pub async fn migrate(&self) -> SentinelResult<()> {
        for statement in SCHEMA_SQL.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| SentinelError::DatabaseError(format!("Migration failed: {}", e)))?;
            }
        }
        Ok(())
    }

    /// Append a line to an entity's log.
    pub async fn append_log(&self, table: LogTable, id: i64, message: &str) -> SentinelResult<()> {
        let sql = format!("UPDATE {} SET log = log || ? WHERE id = ?", table.name());
        sqlx::query(&sql)
            .bind(log_entry(message))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(())
    }

    // ---- layers and tile index ----

    async fn create_layers(
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        owner_column: &str,
        owner_id: i64,
    ) -> SentinelResult<LayerSet> {
        let sql = format!(
            "INSERT INTO layers ({}, kind, datatype, nodata, max_zoom) VALUES (?, ?, ?, ?, ?)",
            owner_column
        );
        let mut ids = [0i64; 14];
        for kind in LayerKind::ALL {
            let result = sqlx::query(&sql)
                .bind(owner_id)
                .bind(kind.name())
                .bind(kind.datatype().code())
                .bind(SENTINEL_NODATA as i64)
                .bind(kind.max_zoom() as i64)
                .execute(&mut **tx)
                .await
                .map_err(db)?;
            ids[kind.index()] = result.last_insert_rowid();
        }
        Ok(LayerSet { ids })
    }

    async fn layer_set(&self, owner_column: &str, owner_id: i64) -> SentinelResult<LayerSet> {
        let sql = format!("SELECT id, kind FROM layers WHERE {} = ?", owner_column);
        let rows: Vec<(i64, String)> = sqlx::query_as(&sql)
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;

        let mut ids = [0i64; 14];
        let mut found = 0;
        for (id, kind) in rows {
            if let Some(kind) = LayerKind::from_name(&kind) {
                ids[kind.index()] = id;
                found += 1;
            }
        }
        if found != LayerKind::ALL.len() {
            return Err(SentinelError::NotFound(format!(
                "layers of {} {}",
                owner_column, owner_id
            )));
        }
        Ok(LayerSet { ids })
    }

    pub async fn scene_layers(&self, scene_id: i64) -> SentinelResult<LayerSet> {
        self.layer_set("scene_id", scene_id).await
    }

    pub async fn composite_layers(&self, composite_id: i64) -> SentinelResult<LayerSet> {
        self.layer_set("composite_id", composite_id).await
    }

    /// Record written tiles in the index.
    pub async fn record_tiles(&self, layer_id: i64, coords: &[TileCoord]) -> SentinelResult<()> {
        if coords.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(db)?;
        for coord in coords {
            sqlx::query("INSERT OR IGNORE INTO tiles (layer_id, z, x, y) VALUES (?, ?, ?, ?)")
                .bind(layer_id)
                .bind(coord.z as i64)
                .bind(coord.x as i64)
                .bind(coord.y as i64)
                .execute(&mut *tx)
                .await
                .map_err(db)?;
        }
        tx.commit().await.map_err(db)?;
        Ok(())
    }

    /// Indexed tiles of a layer, optionally restricted to one zoom level.
    pub async fn tile_coords(&self, layer_id: i64, zoom: Option<u32>) -> SentinelResult<Vec<TileCoord>> {
        let rows: Vec<(i64, i64, i64)> = match zoom {
            Some(z) => sqlx::query_as(
                "SELECT z, x, y FROM tiles WHERE layer_id = ? AND z = ? ORDER BY z, x, y",
            )
            .bind(layer_id)
            .bind(z as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db)?,
            None => sqlx::query_as("SELECT z, x, y FROM tiles WHERE layer_id = ? ORDER BY z, x, y")
                .bind(layer_id)
                .fetch_all(&self.pool)
                .await
                .map_err(db)?,
        };
        Ok(rows
            .into_iter()
            .map(|(z, x, y)| TileCoord::new(z as u32, x as u32, y as u32))
            .collect())
    }

    // ---- scenes ----

    pub async fn scene_exists(&self, prefix: &str) -> SentinelResult<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM scenes WHERE prefix = ?")
            .bind(prefix)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        Ok(row.is_some())
    }

    /// Insert a scene and its 14 layers. Returns `None` when a scene with
    /// the same prefix already exists.
    pub async fn insert_scene(&self, scene: &NewScene) -> SentinelResult<Option<i64>> {
        let bbox = scene
            .data_geometry
            .as_ref()
            .unwrap_or(&scene.footprint)
            .bbox()
            .ok_or_else(|| SentinelError::malformed(format!("empty footprint for {}", scene.prefix)))?;

        let mut tx = self.pool.begin().await.map_err(db)?;
        let result = sqlx::query(
            r#"
            INSERT INTO scenes (
                prefix, utm_zone, latitude_band, grid_square, collected_at,
                cloudiness_percentage, data_coverage_percentage, footprint, data_geometry,
                min_lon, min_lat, max_lon, max_lat, sun_azimuth, sun_altitude,
                datastrip_id, product_name, log, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (prefix) DO NOTHING
            "#,
        )
        .bind(&scene.prefix)
        .bind(scene.utm_zone as i64)
        .bind(&scene.latitude_band)
        .bind(&scene.grid_square)
        .bind(timestamp(&scene.collected_at))
        .bind(scene.cloudiness_percentage)
        .bind(scene.data_coverage_percentage)
        .bind(scene.footprint.to_geojson().to_string())
        .bind(scene.data_geometry.as_ref().map(|g| g.to_geojson().to_string()))
        .bind(bbox.min_x)
        .bind(bbox.min_y)
        .bind(bbox.max_x)
        .bind(bbox.max_y)
        .bind(scene.sun_azimuth)
        .bind(scene.sun_altitude)
        .bind(&scene.datastrip_id)
        .bind(&scene.product_name)
        .bind(log_entry("Registered"))
        .bind(now())
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        let id = result.last_insert_rowid();
        Self::create_layers(&mut tx, "scene_id", id).await?;
        tx.commit().await.map_err(db)?;

        debug!(scene = id, prefix = %scene.prefix, "Inserted scene");
        Ok(Some(id))
    }

    pub async fn get_scene(&self, id: i64) -> SentinelResult<Scene> {
        let sql = format!("SELECT {} FROM scenes WHERE id = ?", SCENE_COLUMNS);
        let row: Option<SceneRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        row.ok_or_else(|| SentinelError::NotFound(format!("scene {}", id)))?
            .into_scene()
    }

    /// Move a scene to *pending* if it is *unprocessed* or *failed*.
    pub async fn mark_scene_pending(&self, id: i64) -> SentinelResult<bool> {
        self.transition_scene(id, SceneStatus::Pending, "status IN ('unprocessed', 'failed')")
            .await
    }

    /// Move a scene to *processing* unless it is already processing, finished
    /// or broken.
    pub async fn begin_scene_processing(&self, id: i64) -> SentinelResult<bool> {
        self.transition_scene(
            id,
            SceneStatus::Processing,
            "status NOT IN ('processing', 'finished', 'broken')",
        )
        .await
    }

    async fn transition_scene(
        &self,
        id: i64,
        status: SceneStatus,
        condition: &str,
    ) -> SentinelResult<bool> {
        let sql = format!(
            "UPDATE scenes SET status = ?, log = log || ? WHERE id = ? AND {}",
            condition
        );
        let result = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(log_entry(&format!("Status changed to {}", status.as_str())))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn finish_scene(&self, id: i64, level: ProcessingLevel) -> SentinelResult<()> {
        sqlx::query("UPDATE scenes SET status = 'finished', level = ?, log = log || ? WHERE id = ?")
            .bind(level.as_str())
            .bind(log_entry(&format!("Finished at level {}", level.as_str())))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(())
    }

    /// Mark a scene *failed* and count the attempt. Returns the new retry count.
    pub async fn fail_scene(&self, id: i64, message: &str) -> SentinelResult<u32> {
        let row: Option<(i64,)> = sqlx::query_as(
            "UPDATE scenes SET status = 'failed', retry_count = retry_count + 1, log = log || ? \
             WHERE id = ? RETURNING retry_count",
        )
        .bind(log_entry(&format!("Failed: {}", message)))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        row.map(|(count,)| count as u32)
            .ok_or_else(|| SentinelError::NotFound(format!("scene {}", id)))
    }

    pub async fn set_scene_status(&self, id: i64, status: SceneStatus) -> SentinelResult<()> {
        self.transition_scene(id, status, "1 = 1").await?;
        Ok(())
    }

    /// Finished scenes usable for a composite tile, ordered by capture time.
    ///
    /// With an allow-list only the listed scenes qualify; otherwise scenes in
    /// the date window at or below the cloud threshold.
    pub async fn candidate_scenes(
        &self,
        composite: &Composite,
        coord: &TileCoord,
    ) -> SentinelResult<Vec<Scene>> {
        let bounds = coord.latlon_bounds();
        let scenes = self
            .scenes_in_bbox(composite, &bounds, Some(SceneStatus::Finished))
            .await?;
        Ok(scenes
            .into_iter()
            .filter(|s| s.coverage().intersects_bbox(&bounds))
            .collect())
    }

    /// Scenes of a composite whose coverage intersects a region, in any state.
    pub async fn scenes_intersecting(
        &self,
        composite: &Composite,
        region: &Geometry,
    ) -> SentinelResult<Vec<Scene>> {
        let Some(bounds) = region.bbox() else {
            return Ok(Vec::new());
        };
        let scenes = self.scenes_in_bbox(composite, &bounds, None).await?;
        Ok(scenes
            .into_iter()
            .filter(|s| s.coverage().intersects(region))
            .collect())
    }

    async fn scenes_in_bbox(
        &self,
        composite: &Composite,
        bounds: &BoundingBox,
        status: Option<SceneStatus>,
    ) -> SentinelResult<Vec<Scene>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM scenes WHERE min_lon <= ",
            SCENE_COLUMNS
        ));
        qb.push_bind(bounds.max_x)
            .push(" AND max_lon >= ")
            .push_bind(bounds.min_x)
            .push(" AND min_lat <= ")
            .push_bind(bounds.max_y)
            .push(" AND max_lat >= ")
            .push_bind(bounds.min_y);

        if let Some(status) = status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }

        match &composite.scene_ids {
            Some(ids) if ids.is_empty() => return Ok(Vec::new()),
            Some(ids) => {
                qb.push(" AND id IN (");
                let mut separated = qb.separated(", ");
                for id in ids {
                    separated.push_bind(*id);
                }
                separated.push_unseparated(")");
            }
            None => {
                qb.push(" AND substr(collected_at, 1, 10) >= ")
                    .push_bind(composite.min_date.format("%Y-%m-%d").to_string())
                    .push(" AND substr(collected_at, 1, 10) <= ")
                    .push_bind(composite.max_date.format("%Y-%m-%d").to_string())
                    .push(" AND cloudiness_percentage <= ")
                    .push_bind(composite.max_cloudiness);
            }
        }
        qb.push(" ORDER BY collected_at, id");

        let rows: Vec<SceneRow> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        rows.into_iter().map(SceneRow::into_scene).collect()
    }

    /// Delete a scene with its layers and tile index. Refused while a build in
    /// progress references the scene. Returns the deleted layer ids so the
    /// caller can remove the tile blobs.
    pub async fn delete_scene(&self, id: i64) -> SentinelResult<Vec<i64>> {
        let blocking: Option<(i64,)> = sqlx::query_as(
            "SELECT b.id FROM composite_builds b \
             JOIN composite_build_scenes s ON s.build_id = b.id \
             WHERE s.scene_id = ? AND b.status IN ('ingesting_scenes', 'building_tiles') LIMIT 1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;

        if let Some((build,)) = blocking {
            return Err(SentinelError::InvalidState(format!(
                "scene {} is used by build {} in progress",
                id, build
            )));
        }

        let layers = self.scene_layers(id).await?;
        sqlx::query("DELETE FROM scenes WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(layers.ids.to_vec())
    }

    // ---- composites ----

    /// Create a composite and its 14 output layers.
    pub async fn create_composite(&self, composite: &NewComposite) -> SentinelResult<Composite> {
        if composite.max_date < composite.min_date {
            return Err(SentinelError::malformed(format!(
                "composite window ends ({}) before it starts ({})",
                composite.max_date, composite.min_date
            )));
        }
        let scene_ids = composite
            .scene_ids
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let created_at = now();

        let mut tx = self.pool.begin().await.map_err(db)?;
        let result = sqlx::query(
            "INSERT INTO composites (name, min_date, max_date, max_cloudiness, scene_ids, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&composite.name)
        .bind(composite.min_date.format("%Y-%m-%d").to_string())
        .bind(composite.max_date.format("%Y-%m-%d").to_string())
        .bind(composite.max_cloudiness)
        .bind(scene_ids)
        .bind(&created_at)
        .execute(&mut *tx)
        .await
        .map_err(db)?;
        let id = result.last_insert_rowid();
        Self::create_layers(&mut tx, "composite_id", id).await?;
        tx.commit().await.map_err(db)?;

        info!(composite = id, name = %composite.name, "Created composite");
        self.get_composite(id).await
    }

    pub async fn get_composite(&self, id: i64) -> SentinelResult<Composite> {
        let row: Option<CompositeRow> = sqlx::query_as(
            "SELECT id, name, min_date, max_date, max_cloudiness, scene_ids, created_at \
             FROM composites WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        row.ok_or_else(|| SentinelError::NotFound(format!("composite {}", id)))?
            .into_composite()
    }

    /// Delete a composite with its layers, tile index, composite tiles and
    /// builds. Returns the deleted layer ids so the caller can remove the
    /// tile blobs.
    pub async fn delete_composite(&self, id: i64) -> SentinelResult<Vec<i64>> {
        let layers = self.composite_layers(id).await?;
        sqlx::query("DELETE FROM composites WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        info!(composite = id, "Deleted composite");
        Ok(layers.ids.to_vec())
    }

    // ---- composite tiles ----

    /// Create (or reuse) composite tiles at the given coarse coordinates and
    /// return their ids in input order.
    pub async fn ensure_composite_tiles(
        &self,
        composite_id: i64,
        coords: &[TileCoord],
    ) -> SentinelResult<Vec<i64>> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        let mut ids = Vec::with_capacity(coords.len());
        for coord in coords {
            sqlx::query(
                "INSERT OR IGNORE INTO composite_tiles (composite_id, z, x, y) VALUES (?, ?, ?, ?)",
            )
            .bind(composite_id)
            .bind(coord.z as i64)
            .bind(coord.x as i64)
            .bind(coord.y as i64)
            .execute(&mut *tx)
            .await
            .map_err(db)?;

            let (id,): (i64,) = sqlx::query_as(
                "SELECT id FROM composite_tiles WHERE composite_id = ? AND z = ? AND x = ? AND y = ?",
            )
            .bind(composite_id)
            .bind(coord.z as i64)
            .bind(coord.x as i64)
            .bind(coord.y as i64)
            .fetch_one(&mut *tx)
            .await
            .map_err(db)?;
            ids.push(id);
        }
        tx.commit().await.map_err(db)?;
        Ok(ids)
    }

    pub async fn get_composite_tile(&self, id: i64) -> SentinelResult<CompositeTile> {
        let sql = format!(
            "SELECT {} FROM composite_tiles WHERE id = ?",
            COMPOSITE_TILE_COLUMNS
        );
        let row: Option<CompositeTileRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        row.ok_or_else(|| SentinelError::NotFound(format!("composite tile {}", id)))?
            .into_composite_tile()
    }

    /// Move a composite tile to *pending* if it is *unprocessed* or *failed*,
    /// recording the scorer it should run with.
    pub async fn mark_composite_tile_pending(
        &self,
        id: i64,
        scorer: Option<&str>,
    ) -> SentinelResult<bool> {
        let result = sqlx::query(
            "UPDATE composite_tiles SET status = 'pending', scorer = ?, scheduled_at = ?, \
             log = log || ? WHERE id = ? AND status IN ('unprocessed', 'failed')",
        )
        .bind(scorer)
        .bind(now())
        .bind(log_entry("Scheduled"))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(result.rows_affected() == 1)
    }

    /// Move a composite tile to *processing* unless it is processing or finished.
    pub async fn begin_composite_tile(&self, id: i64) -> SentinelResult<bool> {
        let result = sqlx::query(
            "UPDATE composite_tiles SET status = 'processing', started_at = ?, finished_at = NULL, \
             log = log || ? WHERE id = ? AND status NOT IN ('processing', 'finished')",
        )
        .bind(now())
        .bind(log_entry("Started"))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn finish_composite_tile(&self, id: i64) -> SentinelResult<()> {
        sqlx::query(
            "UPDATE composite_tiles SET status = 'finished', finished_at = ?, log = log || ? WHERE id = ?",
        )
        .bind(now())
        .bind(log_entry("Finished"))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    pub async fn fail_composite_tile(&self, id: i64, message: &str) -> SentinelResult<()> {
        sqlx::query(
            "UPDATE composite_tiles SET status = 'failed', finished_at = ?, log = log || ? WHERE id = ?",
        )
        .bind(now())
        .bind(log_entry(&format!("Failed: {}", message)))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    // ---- builds ----

    pub async fn create_build(
        &self,
        composite_id: i64,
        aoi: &Geometry,
        scorer: Option<&str>,
    ) -> SentinelResult<CompositeBuild> {
        let result = sqlx::query(
            "INSERT INTO composite_builds (composite_id, aoi, scorer, log) VALUES (?, ?, ?, ?)",
        )
        .bind(composite_id)
        .bind(aoi.to_geojson().to_string())
        .bind(scorer)
        .bind(log_entry("Created"))
        .execute(&self.pool)
        .await
        .map_err(db)?;
        self.get_build(result.last_insert_rowid()).await
    }

    pub async fn get_build(&self, id: i64) -> SentinelResult<CompositeBuild> {
        let row: Option<BuildRow> = sqlx::query_as(
            "SELECT id, composite_id, aoi, scorer, status, scheduled_at, started_at, finished_at, log \
             FROM composite_builds WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        row.ok_or_else(|| SentinelError::NotFound(format!("composite build {}", id)))?
            .into_build()
    }

    /// Set a build's status, stamping the bookkeeping times. Unchanged
    /// statuses are not logged again.
    pub async fn set_build_status(&self, id: i64, status: BuildStatus) -> SentinelResult<()> {
        let stamp = now();
        let result = sqlx::query(
            r#"
            UPDATE composite_builds SET
                status = ?,
                scheduled_at = CASE WHEN ? = 'pending' THEN ? ELSE scheduled_at END,
                started_at = COALESCE(started_at, CASE WHEN ? IN ('ingesting_scenes', 'building_tiles') THEN ? END),
                finished_at = CASE WHEN ? IN ('finished', 'failed') THEN ? ELSE NULL END,
                log = log || ?
            WHERE id = ? AND status != ?
            "#,
        )
        .bind(status.as_str())
        .bind(status.as_str())
        .bind(&stamp)
        .bind(status.as_str())
        .bind(&stamp)
        .bind(status.as_str())
        .bind(&stamp)
        .bind(log_entry(&format!("Status changed to {}", status.as_str())))
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(db)?;

        if result.rows_affected() == 1 {
            debug!(build = id, status = status.as_str(), "Build status changed");
        }
        Ok(())
    }

    /// Replace the set of scenes a build ingests.
    pub async fn set_build_scenes(&self, build_id: i64, scene_ids: &[i64]) -> SentinelResult<()> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        sqlx::query("DELETE FROM composite_build_scenes WHERE build_id = ?")
            .bind(build_id)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        for scene_id in scene_ids {
            sqlx::query("INSERT INTO composite_build_scenes (build_id, scene_id) VALUES (?, ?)")
                .bind(build_id)
                .bind(*scene_id)
                .execute(&mut *tx)
                .await
                .map_err(db)?;
        }
        tx.commit().await.map_err(db)?;
        Ok(())
    }

    /// Replace the set of composite tiles a build constructs.
    pub async fn set_build_tiles(&self, build_id: i64, tile_ids: &[i64]) -> SentinelResult<()> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        sqlx::query("DELETE FROM composite_build_tiles WHERE build_id = ?")
            .bind(build_id)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        for tile_id in tile_ids {
            sqlx::query(
                "INSERT INTO composite_build_tiles (build_id, composite_tile_id) VALUES (?, ?)",
            )
            .bind(build_id)
            .bind(*tile_id)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        }
        tx.commit().await.map_err(db)?;
        Ok(())
    }

    pub async fn build_scenes(&self, build_id: i64) -> SentinelResult<Vec<Scene>> {
        let sql = format!(
            "SELECT {} FROM scenes WHERE id IN \
             (SELECT scene_id FROM composite_build_scenes WHERE build_id = ?) ORDER BY id",
            SCENE_COLUMNS
        );
        let rows: Vec<SceneRow> = sqlx::query_as(&sql)
            .bind(build_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        rows.into_iter().map(SceneRow::into_scene).collect()
    }

    pub async fn build_tiles(&self, build_id: i64) -> SentinelResult<Vec<CompositeTile>> {
        let sql = format!(
            "SELECT {} FROM composite_tiles WHERE id IN \
             (SELECT composite_tile_id FROM composite_build_tiles WHERE build_id = ?) ORDER BY id",
            COMPOSITE_TILE_COLUMNS
        );
        let rows: Vec<CompositeTileRow> = sqlx::query_as(&sql)
            .bind(build_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        rows.into_iter()
            .map(CompositeTileRow::into_composite_tile)
            .collect()
    }

    /// Reset a build's *finished* and *failed* composite tiles to *unprocessed*.
    pub async fn reset_build_tiles(&self, build_id: i64) -> SentinelResult<u64> {
        let result = sqlx::query(
            "UPDATE composite_tiles SET status = 'unprocessed', log = log || ? \
             WHERE status IN ('finished', 'failed') AND id IN \
             (SELECT composite_tile_id FROM composite_build_tiles WHERE build_id = ?)",
        )
        .bind(log_entry("Reset for rebuild"))
        .bind(build_id)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(result.rows_affected())
    }

    // ---- parse logs ----

    /// Open a parse log for a zone. Returns `None` when a sync of the same
    /// zone is already pending or processing.
    pub async fn begin_parse_log(&self, utm_zone: &str) -> SentinelResult<Option<i64>> {
        let result = sqlx::query(
            "INSERT INTO parse_logs (utm_zone, status, log) \
             SELECT ?, 'pending', ? WHERE NOT EXISTS \
             (SELECT 1 FROM parse_logs WHERE utm_zone = ? AND status IN ('pending', 'processing'))",
        )
        .bind(utm_zone)
        .bind(log_entry("Created"))
        .bind(utm_zone)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(result.last_insert_rowid()))
    }

    pub async fn set_parse_status(&self, id: i64, status: ParseStatus) -> SentinelResult<()> {
        let stamp = now();
        sqlx::query(
            r#"
            UPDATE parse_logs SET
                status = ?,
                started_at = CASE WHEN ? = 'processing' THEN ? ELSE started_at END,
                finished_at = CASE WHEN ? IN ('finished', 'failed') THEN ? ELSE finished_at END,
                log = log || ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(status.as_str())
        .bind(&stamp)
        .bind(status.as_str())
        .bind(&stamp)
        .bind(log_entry(&format!("Status changed to {}", status.as_str())))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    pub async fn set_parse_count(&self, id: i64, scenes_created: i64) -> SentinelResult<()> {
        sqlx::query("UPDATE parse_logs SET scenes_created = ? WHERE id = ?")
            .bind(scenes_created)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(())
    }

    /// Fail the open parse logs of a zone, e.g. after its sync was aborted.
    pub async fn fail_open_parse_logs(&self, utm_zone: &str, message: &str) -> SentinelResult<u64> {
        let result = sqlx::query(
            "UPDATE parse_logs SET status = 'failed', finished_at = ?, log = log || ? \
             WHERE utm_zone = ? AND status IN ('pending', 'processing')",
        )
        .bind(now())
        .bind(log_entry(&format!("Failed: {}", message)))
        .bind(utm_zone)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(result.rows_affected())
    }

    pub async fn get_parse_log(&self, id: i64) -> SentinelResult<ParseLog> {
        let row: Option<ParseLogRow> = sqlx::query_as(
            "SELECT id, utm_zone, status, scenes_created, started_at, finished_at, log \
             FROM parse_logs WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        let row = row.ok_or_else(|| SentinelError::NotFound(format!("parse log {}", id)))?;
        Ok(ParseLog {
            id: row.id,
            utm_zone: row.utm_zone,
            status: ParseStatus::from_str(&row.status),
            scenes_created: row.scenes_created,
            started_at: parse_opt_timestamp(row.started_at)?,
            finished_at: parse_opt_timestamp(row.finished_at)?,
            log: row.log,
        })
    }
}

#[derive(FromRow)]
struct SceneRow {
    id: i64,
    prefix: String,
    utm_zone: i64,
    latitude_band: String,
    grid_square: String,
    collected_at: String,
    cloudiness_percentage: f64,
    data_coverage_percentage: f64,
    footprint: String,
    data_geometry: Option<String>,
    sun_azimuth: f64,
    sun_altitude: f64,
    datastrip_id: String,
    product_name: String,
    level: String,
    status: String,
    retry_count: i64,
    log: String,
}

impl SceneRow {
    fn into_scene(self) -> SentinelResult<Scene> {
        Ok(Scene {
            id: self.id,
            prefix: self.prefix,
            utm_zone: self.utm_zone as u8,
            latitude_band: self.latitude_band,
            grid_square: self.grid_square,
            collected_at: parse_timestamp(&self.collected_at)?,
            cloudiness_percentage: self.cloudiness_percentage,
            data_coverage_percentage: self.data_coverage_percentage,
            footprint: Geometry::from_geojson_str(&self.footprint)?,
            data_geometry: self
                .data_geometry
                .as_deref()
                .map(Geometry::from_geojson_str)
                .transpose()?,
            sun_azimuth: self.sun_azimuth,
            sun_altitude: self.sun_altitude,
            datastrip_id: self.datastrip_id,
            product_name: self.product_name,
            level: ProcessingLevel::from_str(&self.level),
            status: SceneStatus::from_str(&self.status),
            retry_count: self.retry_count as u32,
            log: self.log,
        })
    }
}

#[derive(FromRow)]
struct CompositeRow {
    id: i64,
    name: String,
    min_date: String,
    max_date: String,
    max_cloudiness: f64,
    scene_ids: Option<String>,
    created_at: String,
}

impl CompositeRow {
    fn into_composite(self) -> SentinelResult<Composite> {
        Ok(Composite {
            id: self.id,
            name: self.name,
            min_date: parse_date(&self.min_date)?,
            max_date: parse_date(&self.max_date)?,
            max_cloudiness: self.max_cloudiness,
            scene_ids: self
                .scene_ids
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

#[derive(FromRow)]
struct CompositeTileRow {
    id: i64,
    composite_id: i64,
    z: i64,
    x: i64,
    y: i64,
    status: String,
    scorer: Option<String>,
    scheduled_at: Option<String>,
    started_at: Option<String>,
    finished_at: Option<String>,
    log: String,
}

impl CompositeTileRow {
    fn into_composite_tile(self) -> SentinelResult<CompositeTile> {
        Ok(CompositeTile {
            id: self.id,
            composite_id: self.composite_id,
            coord: TileCoord::new(self.z as u32, self.x as u32, self.y as u32),
            status: CompositeTileStatus::from_str(&self.status),
            scorer: self.scorer,
            scheduled_at: parse_opt_timestamp(self.scheduled_at)?,
            started_at: parse_opt_timestamp(self.started_at)?,
            finished_at: parse_opt_timestamp(self.finished_at)?,
            log: self.log,
        })
    }
}

#[derive(FromRow)]
struct BuildRow {
    id: i64,
    composite_id: i64,
    aoi: String,
    scorer: Option<String>,
    status: String,
    scheduled_at: Option<String>,
    started_at: Option<String>,
    finished_at: Option<String>,
    log: String,
}

impl BuildRow {
    fn into_build(self) -> SentinelResult<CompositeBuild> {
        Ok(CompositeBuild {
            id: self.id,
            composite_id: self.composite_id,
            aoi: Geometry::from_geojson_str(&self.aoi)?,
            scorer: self.scorer,
            status: BuildStatus::from_str(&self.status),
            scheduled_at: parse_opt_timestamp(self.scheduled_at)?,
            started_at: parse_opt_timestamp(self.started_at)?,
            finished_at: parse_opt_timestamp(self.finished_at)?,
            log: self.log,
        })
    }
}

#[derive(FromRow)]
struct ParseLogRow {
    id: i64,
    utm_zone: String,
    status: String,
    scenes_created: i64,
    started_at: Option<String>,
    finished_at: Option<String>,
    log: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sentinel_common::Band;

    fn square(min_lon: f64, min_lat: f64, size: f64) -> Geometry {
        Geometry::Polygon(sentinel_common::Polygon::from_bbox(&BoundingBox::new(
            min_lon,
            min_lat,
            min_lon + size,
            min_lat + size,
        )))
    }

    fn new_scene(prefix: &str, day: u32, cloud: f64) -> NewScene {
        NewScene {
            prefix: prefix.to_string(),
            utm_zone: 32,
            latitude_band: "T".to_string(),
            grid_square: "MR".to_string(),
            collected_at: Utc.with_ymd_and_hms(2019, 7, day, 10, 20, 31).unwrap(),
            cloudiness_percentage: cloud,
            data_coverage_percentage: 100.0,
            footprint: square(9.0, 45.0, 1.0),
            data_geometry: None,
            sun_azimuth: 150.0,
            sun_altitude: 60.0,
            datastrip_id: "S2A_OPER_MSI_L1C_DS".to_string(),
            product_name: "S2A_MSIL1C_20190714".to_string(),
        }
    }

    fn july(max_cloudiness: f64) -> NewComposite {
        NewComposite {
            name: "July".to_string(),
            min_date: NaiveDate::from_ymd_opt(2019, 7, 1).unwrap(),
            max_date: NaiveDate::from_ymd_opt(2019, 7, 31).unwrap(),
            max_cloudiness,
            scene_ids: None,
        }
    }

    #[tokio::test]
    async fn test_insert_scene_is_idempotent() {
        let catalog = Catalog::open_memory().await.unwrap();
        let scene = new_scene("tiles/32/T/MR/2019/7/14/0", 14, 5.0);

        let id = catalog.insert_scene(&scene).await.unwrap().unwrap();
        assert!(catalog.insert_scene(&scene).await.unwrap().is_none());
        assert!(catalog.scene_exists(&scene.prefix).await.unwrap());

        let stored = catalog.get_scene(id).await.unwrap();
        assert_eq!(stored.mgrs(), "32TMR");
        assert_eq!(stored.status, SceneStatus::Unprocessed);
        assert_eq!(stored.collected_at, scene.collected_at);

        let layers = catalog.scene_layers(id).await.unwrap();
        let unique: std::collections::HashSet<i64> = layers.ids.iter().copied().collect();
        assert_eq!(unique.len(), 14);
        assert_ne!(layers.get(LayerKind::SceneClass), layers.get(LayerKind::Band(Band::B02)));
    }

    #[tokio::test]
    async fn test_scene_status_guards() {
        let catalog = Catalog::open_memory().await.unwrap();
        let id = catalog
            .insert_scene(&new_scene("tiles/32/T/MR/2019/7/14/0", 14, 5.0))
            .await
            .unwrap()
            .unwrap();

        assert!(catalog.mark_scene_pending(id).await.unwrap());
        assert!(!catalog.mark_scene_pending(id).await.unwrap());
        assert!(catalog.begin_scene_processing(id).await.unwrap());
        assert!(!catalog.begin_scene_processing(id).await.unwrap());

        assert_eq!(catalog.fail_scene(id, "boom").await.unwrap(), 1);
        assert!(catalog.begin_scene_processing(id).await.unwrap());
        catalog.finish_scene(id, ProcessingLevel::L2A).await.unwrap();
        assert!(!catalog.begin_scene_processing(id).await.unwrap());

        let scene = catalog.get_scene(id).await.unwrap();
        assert_eq!(scene.status, SceneStatus::Finished);
        assert_eq!(scene.level, ProcessingLevel::L2A);
        assert_eq!(scene.retry_count, 1);
        assert!(scene.log.contains("Failed: boom"));
        assert!(scene.log.lines().count() >= 5);
    }

    #[tokio::test]
    async fn test_candidate_scenes_filters() {
        let catalog = Catalog::open_memory().await.unwrap();
        let clear = catalog
            .insert_scene(&new_scene("tiles/32/T/MR/2019/7/14/0", 14, 5.0))
            .await
            .unwrap()
            .unwrap();
        let cloudy = catalog
            .insert_scene(&new_scene("tiles/32/T/MR/2019/7/19/0", 19, 80.0))
            .await
            .unwrap()
            .unwrap();
        let mut far = new_scene("tiles/33/T/VM/2019/7/20/0", 20, 1.0);
        far.footprint = square(20.0, 45.0, 1.0);
        let far = catalog.insert_scene(&far).await.unwrap().unwrap();
        for id in [clear, cloudy, far] {
            catalog.finish_scene(id, ProcessingLevel::L2A).await.unwrap();
        }

        let composite = catalog.create_composite(&july(20.0)).await.unwrap();
        let coord = sentinel_common::tile::latlon_to_tile(45.5, 9.5, 10);
        let candidates = catalog.candidate_scenes(&composite, &coord).await.unwrap();
        let ids: Vec<i64> = candidates.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![clear]);

        let mut listed = july(20.0);
        listed.scene_ids = Some(vec![cloudy]);
        let listed = catalog.create_composite(&listed).await.unwrap();
        let candidates = catalog.candidate_scenes(&listed, &coord).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, cloudy);
    }

    #[tokio::test]
    async fn test_parse_log_single_flight() {
        let catalog = Catalog::open_memory().await.unwrap();
        let first = catalog.begin_parse_log("32").await.unwrap().unwrap();
        assert!(catalog.begin_parse_log("32").await.unwrap().is_none());
        assert!(catalog.begin_parse_log("33").await.unwrap().is_some());

        catalog.set_parse_status(first, ParseStatus::Processing).await.unwrap();
        assert!(catalog.begin_parse_log("32").await.unwrap().is_none());
        catalog.set_parse_status(first, ParseStatus::Finished).await.unwrap();
        assert!(catalog.begin_parse_log("32").await.unwrap().is_some());

        let log = catalog.get_parse_log(first).await.unwrap();
        assert_eq!(log.status, ParseStatus::Finished);
        assert!(log.started_at.is_some() && log.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_fail_open_parse_logs() {
        let catalog = Catalog::open_memory().await.unwrap();
        let id = catalog.begin_parse_log("32").await.unwrap().unwrap();
        catalog.set_parse_status(id, ParseStatus::Processing).await.unwrap();

        assert_eq!(catalog.fail_open_parse_logs("32", "deadline").await.unwrap(), 1);
        assert_eq!(catalog.fail_open_parse_logs("32", "deadline").await.unwrap(), 0);
        let log = catalog.get_parse_log(id).await.unwrap();
        assert_eq!(log.status, ParseStatus::Failed);
        assert!(log.log.contains("deadline"));
        assert!(catalog.begin_parse_log("32").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_scene_refused_during_build() {
        let catalog = Catalog::open_memory().await.unwrap();
        let scene = catalog
            .insert_scene(&new_scene("tiles/32/T/MR/2019/7/14/0", 14, 5.0))
            .await
            .unwrap()
            .unwrap();
        let composite = catalog.create_composite(&july(20.0)).await.unwrap();
        let build = catalog
            .create_build(composite.id, &square(9.0, 45.0, 0.5), None)
            .await
            .unwrap();
        catalog.set_build_scenes(build.id, &[scene]).await.unwrap();
        catalog
            .set_build_status(build.id, BuildStatus::IngestingScenes)
            .await
            .unwrap();

        let err = catalog.delete_scene(scene).await.unwrap_err();
        assert!(matches!(err, SentinelError::InvalidState(_)));

        catalog
            .set_build_status(build.id, BuildStatus::Finished)
            .await
            .unwrap();
        let layers = catalog.delete_scene(scene).await.unwrap();
        assert_eq!(layers.len(), 14);
        assert!(catalog.build_scenes(build.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_composite_cascades() {
        let catalog = Catalog::open_memory().await.unwrap();
        let composite = catalog.create_composite(&july(20.0)).await.unwrap();
        let layers = catalog.composite_layers(composite.id).await.unwrap();
        let b04 = layers.get(LayerKind::Band(Band::B04));
        catalog
            .record_tiles(b04, &[TileCoord::new(14, 1, 1), TileCoord::new(14, 1, 2)])
            .await
            .unwrap();
        let tiles = catalog
            .ensure_composite_tiles(composite.id, &[TileCoord::new(10, 0, 0)])
            .await
            .unwrap();

        let deleted = catalog.delete_composite(composite.id).await.unwrap();
        assert!(deleted.contains(&b04));
        assert!(catalog.tile_coords(b04, None).await.unwrap().is_empty());
        assert!(catalog.get_composite_tile(tiles[0]).await.is_err());
        assert!(catalog.composite_layers(composite.id).await.is_err());
    }

    #[tokio::test]
    async fn test_build_status_bookkeeping() {
        let catalog = Catalog::open_memory().await.unwrap();
        let composite = catalog.create_composite(&july(20.0)).await.unwrap();
        let build = catalog
            .create_build(composite.id, &square(9.0, 45.0, 0.5), Some("latest"))
            .await
            .unwrap();
        assert_eq!(build.status, BuildStatus::Unprocessed);
        assert_eq!(build.scorer.as_deref(), Some("latest"));

        catalog
            .set_build_status(build.id, BuildStatus::IngestingScenes)
            .await
            .unwrap();
        catalog
            .set_build_status(build.id, BuildStatus::IngestingScenes)
            .await
            .unwrap();
        catalog
            .set_build_status(build.id, BuildStatus::Finished)
            .await
            .unwrap();

        let build = catalog.get_build(build.id).await.unwrap();
        assert!(build.started_at.is_some());
        assert!(build.finished_at.is_some());
        assert_eq!(build.log.matches("ingesting_scenes").count(), 1);
    }

    #[tokio::test]
    async fn test_composite_tile_lifecycle() {
        let catalog = Catalog::open_memory().await.unwrap();
        let composite = catalog.create_composite(&july(20.0)).await.unwrap();
        let coord = TileCoord::new(10, 530, 360);
        let ids = catalog
            .ensure_composite_tiles(composite.id, &[coord])
            .await
            .unwrap();
        let again = catalog
            .ensure_composite_tiles(composite.id, &[coord])
            .await
            .unwrap();
        assert_eq!(ids, again);

        let id = ids[0];
        assert!(catalog.mark_composite_tile_pending(id, Some("latest")).await.unwrap());
        assert!(!catalog.mark_composite_tile_pending(id, None).await.unwrap());
        assert!(catalog.begin_composite_tile(id).await.unwrap());
        catalog.finish_composite_tile(id).await.unwrap();

        let tile = catalog.get_composite_tile(id).await.unwrap();
        assert_eq!(tile.status, CompositeTileStatus::Finished);
        assert_eq!(tile.coord, coord);
        assert_eq!(tile.scorer.as_deref(), Some("latest"));
        assert!(tile.scheduled_at.is_some() && tile.finished_at.is_some());
    }
}
