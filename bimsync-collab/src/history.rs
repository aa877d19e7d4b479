//! Edit history view: one entry per persisted record, oldest first.

use uuid::Uuid;

use bimsync_core::{AuthorId, ElementId, OpKind, PersistedRecord, Timestamp};

/// Author ids longer than this are shortened for display.
const DISPLAY_AUTHOR_MAX: usize = 12;
/// Trailing characters kept when shortening.
const DISPLAY_AUTHOR_TAIL: usize = 9;

/// One line of the history list.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    /// Position in the canonical order, usable with `jump_to`
    pub index: usize,
    pub op_id: Uuid,
    pub kind: OpKind,
    pub target_id: ElementId,
    pub created_at: Timestamp,
    /// `HH:MM:SS` UTC
    pub time: String,
    pub author_id: AuthorId,
    pub display_author: String,
    pub color: AuthorColor,
}

impl HistoryEntry {
    pub fn from_record(index: usize, record: &PersistedRecord) -> Self {
        let author_id = record.record.author_id.clone();
        Self {
            index,
            op_id: record.op_id(),
            kind: record.record.kind,
            target_id: record.record.target_id.clone(),
            created_at: record.created_at,
            time: record.created_at.format_hms(),
            display_author: display_author(author_id.as_str()),
            color: AuthorColor::for_author(&author_id),
            author_id,
        }
    }

    /// Human-readable operation name.
    pub fn kind_name(&self) -> &'static str {
        self.kind.display_name()
    }
}

/// Build entries for records already in canonical order.
pub fn history_entries(records: &[PersistedRecord]) -> Vec<HistoryEntry> {
    records
        .iter()
        .enumerate()
        .map(|(i, record)| HistoryEntry::from_record(i, record))
        .collect()
}

/// Shorten long ids to `...` plus their last nine characters.
pub fn display_author(author: &str) -> String {
    let len = author.chars().count();
    if len > DISPLAY_AUTHOR_MAX {
        let tail: String = author.chars().skip(len - DISPLAY_AUTHOR_TAIL).collect();
        format!("...{tail}")
    } else {
        author.to_string()
    }
}

/// Stable badge color derived from an author id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorColor {
    /// Gray, for missing or unknown authors
    Unknown,
    Hsl {
        hue: u16,
        saturation: u8,
        lightness: u8,
    },
}

impl AuthorColor {
    pub fn for_author(author: &AuthorId) -> Self {
        let id = author.as_str();
        if id.is_empty() || id.eq_ignore_ascii_case("unknown") {
            return AuthorColor::Unknown;
        }

        let hash = id
            .encode_utf16()
            .fold(0i32, |hash, c| (c as i32).wrapping_add((hash << 5).wrapping_sub(hash)));

        AuthorColor::Hsl {
            hue: (hash % 360).unsigned_abs() as u16,
            saturation: 65 + (hash.unsigned_abs() % 20) as u8,
            lightness: 45 + ((hash >> 8).unsigned_abs() % 15) as u8,
        }
    }

    /// CSS color string.
    pub fn css(&self) -> String {
        match self {
            AuthorColor::Unknown => "#888888".to_string(),
            AuthorColor::Hsl {
                hue,
                saturation,
                lightness,
            } => format!("hsl({hue}, {saturation}%, {lightness}%)"),
        }
    }

    /// Linear RGBA in `0.0..=1.0`, for renderers that take float colors.
    pub fn to_rgba(&self) -> [f32; 4] {
        match *self {
            AuthorColor::Unknown => {
                let gray = 0x88 as f32 / 255.0;
                [gray, gray, gray, 1.0]
            }
            AuthorColor::Hsl {
                hue,
                saturation,
                lightness,
            } => {
                let (r, g, b) = hsl_to_rgb(
                    hue as f32 / 360.0,
                    saturation as f32 / 100.0,
                    lightness as f32 / 100.0,
                );
                [r, g, b, 1.0]
            }
        }
    }
}

/// HSL → RGB, all components in `0.0..=1.0`.
fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}
