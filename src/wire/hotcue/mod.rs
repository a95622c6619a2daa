use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::wire::decoder::Payload;

/// Kind of cue point as reported by the DJ software plugin.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HotcueType {
    #[serde(rename = "Hot_Cue")]
    HotCue,
    Action,
    #[serde(rename = "BeatGrid_Anchor")]
    BeatGridAnchor,
    #[serde(rename = "Load_Point")]
    LoadPoint,
    #[serde(rename = "Saved_Loop")]
    SavedLoop,
    #[serde(rename = "Remix_Point")]
    RemixPoint,
    #[serde(rename = "Automix_Point")]
    AutomixPoint,
}

/// Cue colors are single-bit flags.
const CUE_COLOR_NAMES: [(u16, &str); 16] = [
    (1, "Invisible"),
    (2, "DarkGrey"),
    (4, "LightGrey"),
    (8, "White"),
    (16, "Burgundy"),
    (32, "Apricot"),
    (64, "Red"),
    (128, "Orange"),
    (256, "Yellow"),
    (512, "Eggshell"),
    (1024, "Green"),
    (2048, "Cyan"),
    (4096, "Cobalt"),
    (8192, "Blue"),
    (16384, "Purple"),
    (32768, "Magenta"),
];

pub fn cue_color_name(color: u16) -> Option<&'static str> {
    CUE_COLOR_NAMES
        .iter()
        .find(|(value, _)| *value == color)
        .map(|(_, name)| *name)
}

/// Typed view over a hotcue event payload.
///
/// Keys follow the orchestration service's event model (PascalCase);
/// camelCase spellings are accepted too. Unknown keys are ignored, and
/// payloads without these fields are not hotcue events.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct HotcueEvent {
    #[serde(rename = "CueName", alias = "cueName", default)]
    pub cue_name: String,
    #[serde(rename = "CueColor", alias = "cueColor")]
    pub cue_color: u16,
    #[serde(rename = "Deck", alias = "deck")]
    pub deck: i64,
    #[serde(rename = "HotCueType", alias = "hotCueType")]
    pub hotcue_type: HotcueType,
}

impl HotcueEvent {
    pub fn from_payload(payload: &Payload) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(payload.clone()))
    }
}

impl fmt::Display for HotcueEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} '{}' on deck {} ({})",
            self.hotcue_type,
            self.cue_name,
            self.deck,
            cue_color_name(self.cue_color).unwrap_or("unknown color")
        )
    }
}
