use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::blobs::BlobHandle;

/// Hard cap on concurrently tracked images; intake rejects the overflow.
pub const MAX_IMAGES: usize = 5;
pub const MAX_FILE_BYTES: usize = 20 * 1024 * 1024;
pub const MAX_PIXEL_EDGE: u32 = 4096;
pub const MAX_PIXEL_AREA: u64 = (MAX_PIXEL_EDGE as u64) * (MAX_PIXEL_EDGE as u64);
/// Per-image history depth; the oldest entry is evicted past this.
pub const HISTORY_CAP: usize = 20;
pub const DEFAULT_CREATIVITY: f64 = 0.35;
pub const DEFAULT_ADHERENCE: f64 = 0.35;

pub type ImageId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    Idle,
    Scanning,
    Processing,
    Complete,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScaleOption {
    #[serde(rename = "1x")]
    X1,
    #[serde(rename = "2x")]
    X2,
    #[serde(rename = "4x")]
    X4,
}

impl ScaleOption {
    pub fn multiplier(self) -> u32 {
        match self {
            ScaleOption::X1 => 1,
            ScaleOption::X2 => 2,
            ScaleOption::X4 => 4,
        }
    }

    pub fn from_multiplier(value: u32) -> Option<Self> {
        match value {
            1 => Some(ScaleOption::X1),
            2 => Some(ScaleOption::X2),
            4 => Some(ScaleOption::X4),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Enhanced,
    Upscaled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhanceSettings {
    pub scale: ScaleOption,
    pub enhance: bool,
    pub creativity: f64,
    pub adherence: f64,
    pub prompt: Option<String>,
}

impl Default for EnhanceSettings {
    fn default() -> Self {
        Self {
            scale: ScaleOption::X2,
            enhance: true,
            creativity: DEFAULT_CREATIVITY,
            adherence: DEFAULT_ADHERENCE,
            prompt: None,
        }
    }
}

impl EnhanceSettings {
    pub fn has_prompt(&self) -> bool {
        self.prompt
            .as_deref()
            .map(|text| !text.trim().is_empty())
            .unwrap_or(false)
    }

    /// True when the settings describe the pure-1x no-op that enhancement
    /// must refuse to run.
    pub fn is_noop(&self) -> bool {
        !self.enhance && self.scale == ScaleOption::X1
    }
}

/// Field-by-field patch over [`EnhanceSettings`]. The enhance/creativity
/// coupling is applied once, after the merge, so every call site gets the
/// same invariant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsPatch {
    pub scale: Option<ScaleOption>,
    pub enhance: Option<bool>,
    pub creativity: Option<f64>,
    pub adherence: Option<f64>,
    pub prompt: Option<Option<String>>,
}

impl SettingsPatch {
    pub fn scale(mut self, scale: ScaleOption) -> Self {
        self.scale = Some(scale);
        self
    }

    pub fn enhance(mut self, enhance: bool) -> Self {
        self.enhance = Some(enhance);
        self
    }

    pub fn creativity(mut self, creativity: f64) -> Self {
        self.creativity = Some(creativity);
        self
    }

    pub fn adherence(mut self, adherence: f64) -> Self {
        self.adherence = Some(adherence);
        self
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(Some(prompt.into()));
        self
    }

    pub fn clear_prompt(mut self) -> Self {
        self.prompt = Some(None);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Merges the patch into `settings` and then applies the coupling step:
    /// disabling enhance forces creativity to 0 (and bumps a 1x scale to 2x,
    /// since 1x-without-enhance may never persist); re-enabling enhance from
    /// a forced-0 state restores the default creativity. A 1x scale in the
    /// patch is ignored unless enhance ends up true.
    pub fn apply(&self, settings: &mut EnhanceSettings) {
        let was_enhance = settings.enhance;
        if let Some(enhance) = self.enhance {
            settings.enhance = enhance;
        }
        if let Some(scale) = self.scale {
            if scale != ScaleOption::X1 || settings.enhance {
                settings.scale = scale;
            }
        }
        if let Some(creativity) = self.creativity {
            settings.creativity = creativity.clamp(0.0, 1.0);
        }
        if let Some(adherence) = self.adherence {
            settings.adherence = adherence.clamp(0.0, 1.0);
        }
        if let Some(prompt) = &self.prompt {
            settings.prompt = prompt.clone().filter(|text| !text.is_empty());
        }

        if !settings.enhance {
            settings.creativity = 0.0;
            if settings.scale == ScaleOption::X1 {
                settings.scale = ScaleOption::X2;
            }
        } else if !was_enhance && settings.creativity == 0.0 && self.creativity.is_none() {
            settings.creativity = DEFAULT_CREATIVITY;
        }
    }
}

/// Immutable record of one completed enhancement. The settings snapshot is a
/// deep copy taken at call time and is never touched afterwards.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub settings: EnhanceSettings,
    pub enhanced: BlobHandle,
    pub operation: OperationKind,
}

/// One uploaded image and everything derived from it. The source bytes are
/// exclusively owned by this record; the preview/enhanced/history handles
/// are owned here too and must be released through the session's blob store
/// when the record is dropped from the registry.
#[derive(Debug)]
pub struct TrackedImage {
    pub id: ImageId,
    pub display_name: String,
    pub source: Vec<u8>,
    pub preview: BlobHandle,
    pub status: ImageStatus,
    pub error_detail: Option<String>,
    pub enhanced: Option<BlobHandle>,
    pub last_operation: Option<OperationKind>,
    pub settings: EnhanceSettings,
    pub history: Vec<HistoryEntry>,
}

impl TrackedImage {
    pub fn new(display_name: impl Into<String>, source: Vec<u8>, preview: BlobHandle) -> Self {
        Self {
            id: Uuid::new_v4(),
            display_name: display_name.into(),
            source,
            preview,
            status: ImageStatus::Idle,
            error_detail: None,
            enhanced: None,
            last_operation: None,
            settings: EnhanceSettings::default(),
            history: Vec::new(),
        }
    }

    pub fn has_prompt(&self) -> bool {
        self.settings.has_prompt()
    }

    /// Prepends an entry (most-recent-first order) and returns the evicted
    /// oldest entry once the cap is exceeded, so the caller can release its
    /// handle.
    pub fn push_history(&mut self, entry: HistoryEntry) -> Option<HistoryEntry> {
        self.history.insert(0, entry);
        if self.history.len() > HISTORY_CAP {
            self.history.pop()
        } else {
            None
        }
    }
}
