use chrono::{DateTime, Utc};
use std::time::Duration;

pub const UA_SUPPRESS_TTL: Duration = Duration::from_secs(120);
pub const UA_CLAIM_TTL: Duration = Duration::from_secs(120);
pub const CAP_ONCE_TTL: Duration = Duration::from_secs(20 * 60);
pub const CAP_ANY_TTL: Duration = Duration::from_secs(6 * 60 * 60);
pub const CAP_CLAIM_TTL: Duration = Duration::from_secs(120);
pub const RP_LAST_TTL: Duration = Duration::from_secs(60 * 60);
pub const DISCORD_LAST_TTL: Duration = Duration::from_secs(60 * 60);
pub const DISCORD_PENALTY_TTL: Duration = Duration::from_secs(30 * 60);
pub const DISCORD_GATE_TTL: Duration = Duration::from_secs(5);

/// Floors an instant to the start of its minute, stable across re-parses of
/// the same relative-time token.
pub fn minute_stamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d%H%M").to_string()
}

pub fn warmap() -> String {
    "warmap".to_string()
}

pub fn own(keep_id: &str) -> String {
    format!("own:{keep_id}")
}

pub fn ua_state(keep_id: &str) -> String {
    format!("ua:state:{keep_id}")
}

pub fn alert_ua_start(keep_id: &str) -> String {
    format!("alert:ua:start:{keep_id}")
}

pub fn ua_suppress(keep_id: &str) -> String {
    format!("ua:suppress:{keep_id}")
}

pub fn ua_claim(keep_id: &str, minute: &str) -> String {
    format!("ua:claim:{keep_id}:{minute}")
}

pub fn alert_under(keep_id: &str, minute: &str) -> String {
    format!("alert:under:{keep_id}:{minute}")
}

pub fn alert_ua_nobanner(keep_id: &str) -> String {
    format!("alert:ua:nobanner:{keep_id}")
}

pub fn cap_once_owner(keep_id: &str, new_owner: &str) -> String {
    format!("cap:once:{keep_id}:{new_owner}")
}

pub fn cap_once_transition(keep_id: &str, prev: &str, new_owner: &str) -> String {
    format!("cap:once:{keep_id}:{prev}->{new_owner}")
}

pub fn cap_seen(keep_id: &str, new_owner: &str) -> String {
    format!("cap:seen:{keep_id}:{new_owner}")
}

pub fn cap_any(keep_id: &str, new_owner: &str, minute: &str) -> String {
    format!("cap:any:{keep_id}:{new_owner}:{minute}")
}

pub fn cap_claim(keep_id: &str, new_owner: &str, minute: &str) -> String {
    format!("cap:claim:{keep_id}:{new_owner}:{minute}")
}

pub fn rp(player_id: &str) -> String {
    format!("rp:{player_id}")
}

pub fn rp_active(player_id: &str) -> String {
    format!("rp:active:{player_id}")
}

pub fn rp_last(player_id: &str) -> String {
    format!("rp:last:{player_id}")
}

pub fn discord_cooldown(path_hash: &str) -> String {
    format!("discord:cooldown:{path_hash}")
}

pub fn discord_last(path_hash: &str) -> String {
    format!("discord:last:{path_hash}")
}

pub fn discord_penalty(path_hash: &str) -> String {
    format!("discord:penalty:{path_hash}")
}

pub fn discord_global_last() -> String {
    "discord:global:last".to_string()
}

pub fn discord_global_cooldown_until() -> String {
    "discord:global:cooldown_until".to_string()
}

pub fn discord_gate(channel: &str) -> String {
    format!("discord:gate:{channel}")
}

pub fn flags_strict_delivery() -> String {
    "flags:strict_delivery".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn minute_stamp_drops_seconds() {
        let a = Utc.with_ymd_and_hms(2026, 7, 26, 12, 34, 1).unwrap();
        let b = Utc.with_ymd_and_hms(2026, 7, 26, 12, 34, 59).unwrap();
        assert_eq!(minute_stamp(a), minute_stamp(b));
        let c = Utc.with_ymd_and_hms(2026, 7, 26, 12, 35, 0).unwrap();
        assert_ne!(minute_stamp(a), minute_stamp(c));
    }

    #[test]
    fn cap_once_variants_differ() {
        assert_ne!(
            cap_once_owner("caer-benowyc", "Midgard"),
            cap_once_transition("caer-benowyc", "Albion", "Midgard")
        );
    }
}
