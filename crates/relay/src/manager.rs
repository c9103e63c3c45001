use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Mutex as SlotMutex;
use tracing::{debug, warn};

use place_canvas::{
    chunk_span, is_valid_color, to_chunk_coordinates, CanvasConfig, CanvasError, Chunk,
    ChunkCoord, LocalCoord,
};
use place_common::clock::now_ms;
use place_store::ChunkStore;

/// `None` until the record has been read from (or created in) the store.
type ChunkSlot = Arc<SlotMutex<Option<Chunk>>>;
type UserSlot = Arc<SlotMutex<Option<i64>>>;

/// A committed tile placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub x: i64,
    pub y: i64,
    pub color: String,
    pub chunk: ChunkCoord,
    pub local: LocalCoord,
}

/// Read-through, write-through cache of chunks and placement timestamps over a
/// [`ChunkStore`].
///
/// Each chunk and each user has its own async slot lock, so load-modify-store
/// on one chunk (or one user's cooldown check-and-set) is serialized while
/// disjoint chunks and users proceed in parallel. The maps holding the slots
/// are only locked long enough to clone a slot handle.
pub struct CanvasManager {
    config: CanvasConfig,
    store: Arc<dyn ChunkStore>,
    chunks: Mutex<HashMap<ChunkCoord, ChunkSlot>>,
    last_placed: Mutex<HashMap<String, UserSlot>>,
}

impl CanvasManager {
    pub fn new(config: CanvasConfig, store: Arc<dyn ChunkStore>) -> Self {
        Self {
            config,
            store,
            chunks: Mutex::new(HashMap::new()),
            last_placed: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CanvasConfig {
        &self.config
    }

    /// Number of chunks currently mirrored in memory.
    pub fn cached_chunks(&self) -> usize {
        self.chunks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Bulk-load every persisted chunk of the canvas into the cache.
    /// Chunks missing from the store are left for lazy creation.
    pub async fn warm(&self) -> Result<usize, CanvasError> {
        let (width, height) = (self.config.width, self.config.height);
        let region = self
            .blocking(move |store| store.get_region(0, 0, width, height))
            .await?;
        let mut loaded = 0;
        for (coord, chunk) in region.into_present() {
            let slot = self.chunk_slot(coord);
            let mut guard = slot.lock().await;
            if guard.is_none() {
                *guard = Some(chunk);
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    /// The chunk at `coord`, loading it or creating and persisting an empty
    /// one on first access.
    pub async fn get_chunk(&self, coord: ChunkCoord) -> Result<Chunk, CanvasError> {
        let slot = self.chunk_slot(coord);
        let mut guard = slot.lock().await;
        let chunk = match guard.take() {
            Some(chunk) => chunk,
            None => match self.load_chunk(coord).await? {
                Some(chunk) => chunk,
                None => {
                    let chunk = self.config.create_empty_chunk();
                    let record = chunk.clone();
                    self.blocking(move |store| store.save_chunk(coord, &record))
                        .await?;
                    debug!(chunk_x = coord.x, chunk_y = coord.y, "chunk created");
                    chunk
                }
            },
        };
        Ok(guard.insert(chunk).clone())
    }

    pub async fn place_tile(
        &self,
        user_id: &str,
        x: i64,
        y: i64,
        color: &str,
    ) -> Result<Placement, CanvasError> {
        self.place_tile_at(user_id, x, y, color, now_ms()).await
    }

    /// [`place_tile`](Self::place_tile) with an explicit clock reading.
    ///
    /// The chunk write and the timestamp write both reach the store before the
    /// cache is touched. Any error leaves the cache and the store as they were.
    /// Once validation passes, the placement runs on its own task, so dropping
    /// the returned future cannot stop it between the store writes and the cache
    /// update.
    pub async fn place_tile_at(
        &self,
        user_id: &str,
        x: i64,
        y: i64,
        color: &str,
        now: i64,
    ) -> Result<Placement, CanvasError> {
        if !self.config.is_within_bounds(x, y) {
            return Err(CanvasError::OutOfBounds { x, y });
        }
        if !is_valid_color(color) {
            return Err(CanvasError::InvalidColor(color.to_string()));
        }

        let (coord, local) = to_chunk_coordinates(x, y);
        let commit = PlacementCommit {
            store: Arc::clone(&self.store),
            user_slot: self.user_slot(user_id),
            chunk_slot: self.chunk_slot(coord),
            user_id: user_id.to_string(),
            coord,
            local,
            color: color.to_string(),
            now,
            cooldown_ms: self.config.cooldown_ms,
            default_color: self.config.default_color.clone(),
        };
        tokio::spawn(commit.run())
            .await
            .map_err(|err| CanvasError::StoreUnavailable(err.into()))??;
        debug!(user = %user_id, x, y, color, "tile placed");

        Ok(Placement {
            x,
            y,
            color: color.to_string(),
            chunk: coord,
            local,
        })
    }

    /// Colors of `[start_x, start_x + width) x [start_y, start_y + height)`,
    /// row-major, `None` for cells outside the canvas. Each chunk the
    /// rectangle touches is resolved once.
    pub async fn get_region(
        &self,
        start_x: i64,
        start_y: i64,
        width: i64,
        height: i64,
    ) -> Result<Vec<Vec<Option<String>>>, CanvasError> {
        if width <= 0 || height <= 0 {
            return Ok(Vec::new());
        }
        let tiles = (width as u64).saturating_mul(height as u64);
        if tiles > self.config.max_region_tiles {
            return Err(CanvasError::RegionTooLarge {
                tiles,
                max: self.config.max_region_tiles,
            });
        }
        let (Some(end_x), Some(end_y)) = (start_x.checked_add(width), start_y.checked_add(height))
        else {
            return Err(CanvasError::InvalidRegion {
                x: start_x,
                y: start_y,
            });
        };

        // Only the in-bounds part of the rectangle touches chunks.
        let x0 = start_x.max(0);
        let y0 = start_y.max(0);
        let x1 = end_x.min(self.config.width);
        let y1 = end_y.min(self.config.height);
        let mut chunks = HashMap::new();
        for cy in chunk_span(y0, y1 - y0) {
            for cx in chunk_span(x0, x1 - x0) {
                let coord = ChunkCoord::new(cx, cy);
                chunks.insert(coord, self.get_chunk(coord).await?);
            }
        }

        let region = (start_y..end_y)
            .map(|y| {
                (start_x..end_x)
                    .map(|x| {
                        if !self.config.is_within_bounds(x, y) {
                            return None;
                        }
                        let (coord, local) = to_chunk_coordinates(x, y);
                        chunks.get(&coord).map(|chunk| chunk.get(local).to_string())
                    })
                    .collect()
            })
            .collect();
        Ok(region)
    }

    async fn load_chunk(&self, coord: ChunkCoord) -> Result<Option<Chunk>, CanvasError> {
        self.blocking(move |store| store.load_chunk(coord)).await
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, CanvasError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ChunkStore) -> anyhow::Result<T> + Send + 'static,
    {
        run_blocking(&self.store, op).await
    }

    fn chunk_slot(&self, coord: ChunkCoord) -> ChunkSlot {
        let mut chunks = self.chunks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(chunks.entry(coord).or_default())
    }

    fn user_slot(&self, user_id: &str) -> UserSlot {
        let mut users = self
            .last_placed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = users.get(user_id) {
            return Arc::clone(slot);
        }
        let slot = UserSlot::default();
        users.insert(user_id.to_string(), Arc::clone(&slot));
        slot
    }
}

/// The locked read-modify-write of one placement, owning everything it touches.
struct PlacementCommit {
    store: Arc<dyn ChunkStore>,
    user_slot: UserSlot,
    chunk_slot: ChunkSlot,
    user_id: String,
    coord: ChunkCoord,
    local: LocalCoord,
    color: String,
    now: i64,
    cooldown_ms: i64,
    default_color: String,
}

impl PlacementCommit {
    // Lock order is user slot, then chunk slot. Nothing else holds a user slot.
    async fn run(self) -> Result<(), CanvasError> {
        let coord = self.coord;
        let mut last_guard = self.user_slot.lock().await;
        let cached_last = *last_guard;
        let last = match cached_last {
            Some(last) => last,
            None => {
                let user = self.user_id.clone();
                let last = run_blocking(&self.store, move |store| store.get_last_placed(&user))
                    .await?
                    .unwrap_or(0);
                *last_guard = Some(last);
                last
            }
        };
        let elapsed = self.now - last;
        if elapsed < self.cooldown_ms {
            return Err(CanvasError::CooldownActive {
                retry_after_ms: self.cooldown_ms - elapsed,
            });
        }

        let mut chunk_guard = self.chunk_slot.lock().await;
        let cached_chunk = chunk_guard.as_ref().cloned();
        // `None` here means no record exists yet; the placement's own write
        // materializes the chunk.
        let previous = match cached_chunk {
            Some(chunk) => Some(chunk),
            None => {
                let loaded = run_blocking(&self.store, move |store| store.load_chunk(coord)).await?;
                if let Some(chunk) = &loaded {
                    *chunk_guard = Some(chunk.clone());
                }
                loaded
            }
        };

        let mut updated = previous
            .clone()
            .unwrap_or_else(|| Chunk::filled(&self.default_color));
        updated.set(self.local, &self.color);
        let record = updated.clone();
        run_blocking(&self.store, move |store| store.save_chunk(coord, &record)).await?;

        let user = self.user_id.clone();
        let now = self.now;
        if let Err(err) =
            run_blocking(&self.store, move |store| store.save_last_placed(&user, now)).await
        {
            let restore = match previous {
                Some(chunk) => {
                    run_blocking(&self.store, move |store| store.save_chunk(coord, &chunk)).await
                }
                None => run_blocking(&self.store, move |store| store.delete_chunk(coord)).await,
            };
            if let Err(restore_err) = restore {
                warn!(
                    chunk_x = coord.x,
                    chunk_y = coord.y,
                    error = %restore_err,
                    "failed to roll back chunk after timestamp write failed"
                );
            }
            return Err(err);
        }

        *chunk_guard = Some(updated);
        *last_guard = Some(now);
        Ok(())
    }
}

/// Run a store call on the blocking pool. Once issued, the call completes
/// even if the awaiting request is dropped.
async fn run_blocking<T, F>(store: &Arc<dyn ChunkStore>, op: F) -> Result<T, CanvasError>
where
    T: Send + 'static,
    F: FnOnce(&dyn ChunkStore) -> anyhow::Result<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || op(store.as_ref()))
        .await
        .map_err(|err| CanvasError::StoreUnavailable(err.into()))?
        .map_err(CanvasError::StoreUnavailable)
}
