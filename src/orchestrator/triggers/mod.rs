use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::wire::hotcue::{HotcueEvent, HotcueType};

/// Destinations reached over the network rather than through a local bridge.
pub const NETWORK_APP_IDS: [&str; 4] = ["HttpEndpoint", "TcpEndpoint", "UdpEndpoint", "OscEndpoint"];

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum CueMatchType {
    #[default]
    None,
    Exact,
    Contains,
    StartsWith,
    EndsWith,
    Embedded,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerAction {
    pub app_id: String,
    pub action_type: String,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}

impl TriggerAction {
    pub fn is_network(&self) -> bool {
        is_network_app(&self.app_id)
    }
}

/// Selects hotcue events and names the actions they should cause.
///
/// The type, color and deck sets are allow-lists: an empty set matches
/// nothing.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Trigger {
    #[serde(default)]
    pub name: String,
    pub hotcue_types: BTreeSet<HotcueType>,
    pub cue_colors: BTreeSet<u16>,
    pub decks: BTreeSet<i64>,
    #[serde(default)]
    pub cue_match_type: CueMatchType,
    #[serde(default)]
    pub cue_name: String,
    #[serde(default)]
    pub actions: Vec<TriggerAction>,
}

impl Trigger {
    pub fn matches(&self, event: &HotcueEvent) -> bool {
        self.hotcue_types.contains(&event.hotcue_type)
            && self.cue_colors.contains(&event.cue_color)
            && self.decks.contains(&event.deck)
            && self.cue_name_matches(&event.cue_name)
    }

    fn cue_name_matches(&self, cue_name: &str) -> bool {
        let wanted = self.cue_name.as_str();
        match self.cue_match_type {
            CueMatchType::None => true,
            CueMatchType::Exact => cue_name == wanted,
            CueMatchType::Contains | CueMatchType::Embedded => cue_name.contains(wanted),
            CueMatchType::StartsWith => cue_name.starts_with(wanted),
            CueMatchType::EndsWith => cue_name.ends_with(wanted),
        }
    }
}

/// Actions of one matched trigger, split by how they would be delivered.
#[derive(Debug, PartialEq, Eq)]
pub struct RoutedActions<'a> {
    pub trigger: &'a Trigger,
    pub local: Vec<&'a TriggerAction>,
    pub network: BTreeMap<&'a str, Vec<&'a TriggerAction>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TriggerSet {
    triggers: Vec<Trigger>,
}

impl TriggerSet {
    pub fn new(triggers: Vec<Trigger>) -> Self {
        Self { triggers }
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    pub fn matching<'a>(&'a self, event: &'a HotcueEvent) -> impl Iterator<Item = &'a Trigger> + 'a {
        self.triggers.iter().filter(move |trigger| trigger.matches(event))
    }

    pub fn route<'a>(&'a self, event: &'a HotcueEvent) -> Vec<RoutedActions<'a>> {
        self.matching(event)
            .map(|trigger| {
                let mut local = Vec::new();
                let mut network: BTreeMap<&str, Vec<&TriggerAction>> = BTreeMap::new();
                for action in &trigger.actions {
                    if action.is_network() {
                        network.entry(action.app_id.as_str()).or_default().push(action);
                    } else {
                        local.push(action);
                    }
                }
                RoutedActions {
                    trigger,
                    local,
                    network,
                }
            })
            .collect()
    }
}

pub fn is_network_app(app_id: &str) -> bool {
    NETWORK_APP_IDS.contains(&app_id)
}
