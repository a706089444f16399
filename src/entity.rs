//! Entity model: canvas entities, sparse patches, and write-boundary checks.
//!
//! DESIGN
//! ======
//! `Entity` is the durable unit of the canvas and doubles as the on-wire
//! shape (camelCase). The kind is a closed tagged variant so variant-specific
//! fields (text content, font size) are compile-time checked rather than an
//! open props bag. `EntityPatch` is a sparse update: only present fields are
//! applied, which is what makes field-level merge of concurrent writes work.
//!
//! Every numeric geometric field must be finite before it crosses the write
//! boundary; `validate` enforces that and returns a typed error so NaN never
//! reaches the wire.

#[cfg(test)]
#[path = "entity_test.rs"]
mod entity_test;

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorCode;

/// Unique identifier for a canvas entity. Client-generated, immutable.
pub type EntityId = Uuid;

/// Identifier of a writing user.
pub type UserId = Uuid;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("non-finite value for {field}: {value}")]
    NonFinite { field: &'static str, value: f64 },
}

impl ErrorCode for ValidationError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NonFinite { .. } => "E_NON_FINITE",
        }
    }
}

// =============================================================================
// ENTITY KIND
// =============================================================================

/// The kind of a canvas entity, with variant-specific fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EntityKind {
    /// Axis-aligned rectangle.
    #[serde(rename = "rectangle")]
    Rect,
    /// Ellipse inscribed within the bounding box.
    Ellipse,
    /// Text block.
    Text {
        /// Text content.
        text: String,
        /// Font size in world units.
        #[serde(rename = "fontSize")]
        font_size: f64,
    },
}

// =============================================================================
// ENTITY
// =============================================================================

/// A canvas entity as stored in the authoritative store and on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Globally unique identifier, immutable for the entity's lifetime.
    pub id: EntityId,
    /// Tagged kind plus variant-specific fields.
    #[serde(flatten)]
    pub kind: EntityKind,
    /// Left edge of the bounding box in world coordinates.
    pub x: f64,
    /// Top edge of the bounding box in world coordinates.
    pub y: f64,
    /// Width of the bounding box.
    pub width: f64,
    /// Height of the bounding box.
    pub height: f64,
    /// Fill color as a CSS color string.
    pub fill: String,
    /// Clockwise rotation in degrees around the bounding-box center.
    pub rotation: f64,
    /// Stacking order. Unset entities sort as zero.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z_index: Option<i64>,
    /// Locked entities refuse edits at the client write path.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub locked: bool,
    /// Hidden entities are excluded from rendering but remain in the store.
    #[serde(default = "default_true", skip_serializing_if = "Clone::clone")]
    pub visible: bool,
    /// User that produced the latest write.
    pub updated_by: UserId,
    /// Writer-assigned timestamp, milliseconds since Unix epoch, monotonically
    /// increasing per writer. Decides last-write-wins conflicts.
    pub updated_at: i64,
}

fn default_true() -> bool {
    true
}

impl Entity {
    /// Create an entity with defaults for the optional attributes.
    #[must_use]
    pub fn new(kind: EntityKind, x: f64, y: f64, width: f64, height: f64, fill: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            x,
            y,
            width,
            height,
            fill: fill.into(),
            rotation: 0.0,
            z_index: None,
            locked: false,
            visible: true,
            updated_by: Uuid::nil(),
            updated_at: 0,
        }
    }

    /// Check that every numeric field is finite.
    ///
    /// # Errors
    ///
    /// Returns `NonFinite` naming the first offending field.
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_finite("x", self.x)?;
        check_finite("y", self.y)?;
        check_finite("width", self.width)?;
        check_finite("height", self.height)?;
        check_finite("rotation", self.rotation)?;
        if let EntityKind::Text { font_size, .. } = self.kind {
            check_finite("fontSize", font_size)?;
        }
        Ok(())
    }

    /// Apply a sparse patch. Fields not present in the patch are untouched.
    ///
    /// Text fields only land on `Text` entities; patches against other kinds
    /// silently ignore them, matching the open-ended wire format.
    pub fn apply_patch(&mut self, patch: &EntityPatch) {
        if let Some(x) = patch.x {
            self.x = x;
        }
        if let Some(y) = patch.y {
            self.y = y;
        }
        if let Some(w) = patch.width {
            self.width = w;
        }
        if let Some(h) = patch.height {
            self.height = h;
        }
        if let Some(r) = patch.rotation {
            self.rotation = r;
        }
        if let Some(ref fill) = patch.fill {
            self.fill = fill.clone();
        }
        if let Some(z) = patch.z_index {
            self.z_index = Some(z);
        }
        if let Some(locked) = patch.locked {
            self.locked = locked;
        }
        if let Some(visible) = patch.visible {
            self.visible = visible;
        }
        if let EntityKind::Text { text, font_size } = &mut self.kind {
            if let Some(ref t) = patch.text {
                *text = t.clone();
            }
            if let Some(fs) = patch.font_size {
                *font_size = fs;
            }
        }
        self.updated_by = patch.updated_by;
        self.updated_at = patch.updated_at;
    }
}

fn check_finite(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ValidationError::NonFinite { field, value })
    }
}

// =============================================================================
// ENTITY PATCH
// =============================================================================

/// Sparse update for an entity. Only present fields are applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z_index: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visible: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(rename = "fontSize", skip_serializing_if = "Option::is_none")]
    pub font_size: Option<f64>,
    /// Writer of this patch.
    pub updated_by: UserId,
    /// Writer-assigned timestamp of this patch. Decides LWW conflicts.
    pub updated_at: i64,
}

impl EntityPatch {
    /// Create an empty patch stamped with writer and timestamp.
    #[must_use]
    pub fn new(updated_by: UserId, updated_at: i64) -> Self {
        Self {
            x: None,
            y: None,
            width: None,
            height: None,
            rotation: None,
            fill: None,
            z_index: None,
            locked: None,
            visible: None,
            text: None,
            font_size: None,
            updated_by,
            updated_at,
        }
    }

    /// Convenience for the most common patch: a position move.
    #[must_use]
    pub fn move_to(updated_by: UserId, updated_at: i64, x: f64, y: f64) -> Self {
        Self { x: Some(x), y: Some(y), ..Self::new(updated_by, updated_at) }
    }

    /// Check that every numeric field present in the patch is finite.
    ///
    /// # Errors
    ///
    /// Returns `NonFinite` naming the first offending field.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let numeric = [
            ("x", self.x),
            ("y", self.y),
            ("width", self.width),
            ("height", self.height),
            ("rotation", self.rotation),
            ("fontSize", self.font_size),
        ];
        for (field, value) in numeric {
            if let Some(v) = value {
                check_finite(field, v)?;
            }
        }
        Ok(())
    }
}

// =============================================================================
// TIMESTAMPS
// =============================================================================

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

/// Per-writer timestamp source guaranteeing strict monotonicity.
///
/// Wall-clock time can stall or step backwards; two same-millisecond writes by
/// one writer would otherwise tie on `updated_at` and make LWW ambiguous.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicI64,
}

impl MonotonicClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Next writer timestamp: `max(now_ms, last + 1)`.
    pub fn next(&self) -> i64 {
        let now = now_ms();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let stamp = now.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, stamp, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return stamp,
                Err(actual) => prev = actual,
            }
        }
    }
}
