use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const MAX_EVENTS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Realm {
    Albion,
    Midgard,
    Hibernia,
}

impl Realm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Realm::Albion => "Albion",
            Realm::Midgard => "Midgard",
            Realm::Hibernia => "Hibernia",
        }
    }

    /// Liberal class-name allow-list, e.g. `keepinfo_alb`, `keepinfo-mid`, `hib-owner`.
    pub fn from_marker(marker: &str) -> Option<Self> {
        let lower = marker.to_ascii_lowercase();
        if lower.contains("alb") {
            Some(Realm::Albion)
        } else if lower.contains("mid") {
            Some(Realm::Midgard)
        } else if lower.contains("hib") {
            Some(Realm::Hibernia)
        } else {
            None
        }
    }

    /// Discord embed color per realm, used by the webhook payload builders.
    pub fn color(&self) -> u32 {
        match self {
            Realm::Albion => 0xD4222A,
            Realm::Midgard => 0x1F6FEB,
            Realm::Hibernia => 0x2EA043,
        }
    }
}

impl std::fmt::Display for Realm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeepKind {
    Keep,
    Relic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Keep {
    pub id: String,
    pub name: String,
    pub kind: KeepKind,
    pub owner: Realm,
    pub level: Option<u32>,
    pub claimed_by: Option<String>,
    pub emblem_url: Option<String>,
    pub header_under_attack: bool,
    pub under_attack: bool,
    pub last_event: Option<DateTime<Utc>>,
}

impl Keep {
    /// Deterministic slug from a keep name: lowercase, spaces to hyphens,
    /// anything outside `[a-z0-9-]` dropped.
    pub fn slug(name: &str) -> String {
        let mut out = String::with_capacity(name.len());
        let mut last_was_sep = false;
        for ch in name.to_ascii_lowercase().chars() {
            if ch.is_ascii_alphanumeric() {
                out.push(ch);
                last_was_sep = false;
            } else if !last_was_sep && !out.is_empty() {
                out.push('-');
                last_was_sep = true;
            }
        }
        while out.ends_with('-') {
            out.pop();
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Captured,
    UnderAttack,
    Claimed,
    Upgraded,
    RelicMoved,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub at: DateTime<Utc>,
    pub kind: EventKind,
    pub keep_id: String,
    pub keep_name: String,
    pub new_owner: Option<Realm>,
    pub leader: Option<String>,
    pub raw: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub updated_at: DateTime<Utc>,
    pub keeps: Vec<Keep>,
    pub events: Vec<Event>,
    pub df_owner: Realm,
}

impl Snapshot {
    pub fn keep(&self, id: &str) -> Option<&Keep> {
        self.keeps.iter().find(|k| k.id == id)
    }

    /// Sorts events newest-first and truncates to `MAX_EVENTS`. Called once
    /// by the parser after all rows are collected.
    pub fn finalize_events(&mut self) {
        self.events.sort_by(|a, b| b.at.cmp(&a.at));
        self.events.truncate(MAX_EVENTS);
    }

    /// Stable hash over keeps + events + df_owner, used to decide whether
    /// `warmap` needs rewriting. Two parses of identical HTML must agree
    /// even though `updated_at` (wall-clock) differs, so that field is
    /// excluded.
    pub fn canonical_hash(&self) -> String {
        #[derive(Serialize)]
        struct Canonical<'a> {
            keeps: &'a [Keep],
            events: &'a [Event],
            df_owner: Realm,
        }
        let canonical = Canonical {
            keeps: &self.keeps,
            events: &self.events,
            df_owner: self.df_owner,
        };
        let bytes = serde_json::to_vec(&canonical).expect("snapshot is always serializable");
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_is_deterministic_and_lowercase() {
        assert_eq!(Keep::slug("Caer Benowyc"), "caer-benowyc");
        assert_eq!(Keep::slug("Caer Benowyc"), Keep::slug("caer benowyc"));
    }

    #[test]
    fn realm_marker_is_liberal() {
        assert_eq!(Realm::from_marker("keepinfo_alb"), Some(Realm::Albion));
        assert_eq!(Realm::from_marker("keepinfo-mid-header"), Some(Realm::Midgard));
        assert_eq!(Realm::from_marker("hib_owner"), Some(Realm::Hibernia));
        assert_eq!(Realm::from_marker("keepinfo_neutral"), None);
    }

    #[test]
    fn hash_ignores_updated_at() {
        let mut a = Snapshot {
            updated_at: Utc::now(),
            keeps: vec![],
            events: vec![],
            df_owner: Realm::Midgard,
        };
        let mut b = a.clone();
        b.updated_at = a.updated_at + chrono::Duration::hours(3);
        assert_eq!(a.canonical_hash(), b.canonical_hash());
        a.df_owner = Realm::Albion;
        assert_ne!(a.canonical_hash(), b.canonical_hash());
    }
}
