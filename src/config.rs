//! Environment-tunable knobs for the sync engine.
//!
//! DESIGN
//! ======
//! Every constant a deployment might want to tune is loaded from the
//! environment with a compiled-in default, so tests and embedders get sane
//! behavior with zero setup.

use std::time::Duration;

const DEFAULT_CURSOR_THROTTLE_MS: u64 = 50;
const DEFAULT_DRAG_THROTTLE_MS: u64 = 40;
const DEFAULT_VIEWPORT_MARGIN: f64 = 200.0;
const DEFAULT_GRID_CELL: f64 = 512.0;
const DEFAULT_MAX_BATCH_OPS: usize = 500;
const DEFAULT_WRITE_RETRIES: usize = 3;
const DEFAULT_WRITE_RETRY_BASE_MS: u64 = 50;
const DEFAULT_DRAG_CLEAR_GRACE_MS: u64 = 300;

/// Tuning knobs, loaded once per client.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Minimum interval between cursor broadcasts, per user.
    pub cursor_throttle: Duration,
    /// Minimum interval between drag-preview broadcasts, per entity.
    pub drag_throttle: Duration,
    /// Extra margin around the visible rectangle to avoid pop-in.
    pub viewport_margin: f64,
    /// Spatial index cell size in world units.
    pub grid_cell: f64,
    /// Maximum operations per atomic batch chunk.
    pub max_batch_ops: usize,
    /// Retry attempts for durable writes on transient failure.
    pub write_retries: usize,
    /// Base delay for exponential write retry back-off.
    pub write_retry_base: Duration,
    /// Grace delay before clearing drag previews after commit, so remote
    /// observers never see a flash of the stale authoritative position.
    pub drag_clear_grace: Duration,
}

impl Config {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            cursor_throttle: Duration::from_millis(env_parse("SYNC_CURSOR_THROTTLE_MS", DEFAULT_CURSOR_THROTTLE_MS)),
            drag_throttle: Duration::from_millis(env_parse("SYNC_DRAG_THROTTLE_MS", DEFAULT_DRAG_THROTTLE_MS)),
            viewport_margin: env_parse("SYNC_VIEWPORT_MARGIN", DEFAULT_VIEWPORT_MARGIN),
            grid_cell: env_parse("SYNC_GRID_CELL", DEFAULT_GRID_CELL),
            max_batch_ops: env_parse("SYNC_MAX_BATCH_OPS", DEFAULT_MAX_BATCH_OPS),
            write_retries: env_parse("SYNC_WRITE_RETRIES", DEFAULT_WRITE_RETRIES),
            write_retry_base: Duration::from_millis(env_parse("SYNC_WRITE_RETRY_BASE_MS", DEFAULT_WRITE_RETRY_BASE_MS)),
            drag_clear_grace: Duration::from_millis(env_parse("SYNC_DRAG_CLEAR_GRACE_MS", DEFAULT_DRAG_CLEAR_GRACE_MS)),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cursor_throttle: Duration::from_millis(DEFAULT_CURSOR_THROTTLE_MS),
            drag_throttle: Duration::from_millis(DEFAULT_DRAG_THROTTLE_MS),
            viewport_margin: DEFAULT_VIEWPORT_MARGIN,
            grid_cell: DEFAULT_GRID_CELL,
            max_batch_ops: DEFAULT_MAX_BATCH_OPS,
            write_retries: DEFAULT_WRITE_RETRIES,
            write_retry_base: Duration::from_millis(DEFAULT_WRITE_RETRY_BASE_MS),
            drag_clear_grace: Duration::from_millis(DEFAULT_DRAG_CLEAR_GRACE_MS),
        }
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}
