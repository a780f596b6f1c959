use crate::model::{Event, EventKind, Keep, KeepKind, Realm, Snapshot};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashMap;
use std::time::Duration;

static CAPTURE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(.+?) (?:has been|was) captured by (?:the forces of )?(Albion|Midgard|Hibernia)(?: led by (.+))?$",
    )
    .unwrap()
});

static UNDER_ATTACK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(.+?) (?:is|was) under attack").unwrap());

static HEADER_UA_TEXT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)under\s*attack").unwrap());

static RELATIVE_TIME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*(\d+)\s*([mhd])").unwrap());

static LEVEL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)level\s+(\d+)").unwrap());

/// Siege-banner image filenames. Deliberately tight (no plain substring
/// match on "under") so an unrelated image never trips a false
/// under-attack reading.
const UA_BANNER_FILENAMES: &[&str] = &["underattack_banner", "siege_banner", "ua_banner"];

pub struct ParseOptions {
    pub base_url: String,
    pub attack_window: Duration,
    pub now: DateTime<Utc>,
}

pub fn parse_snapshot(html: &str, opts: &ParseOptions) -> Snapshot {
    let doc = Html::parse_document(html);

    let keep_sel = Selector::parse("div.keep").unwrap();
    let mut keeps: Vec<Keep> = doc
        .select(&keep_sel)
        .filter_map(|panel| parse_keep_panel(panel, &opts.base_url))
        .collect();

    let mut events = parse_events(&doc, opts.now);
    apply_ua_events_to_keeps(&mut events, &mut keeps, opts.attack_window, opts.now);

    let mut snapshot = Snapshot {
        updated_at: opts.now,
        keeps,
        events,
        df_owner: parse_df_owner(&doc),
    };
    snapshot.finalize_events();
    snapshot
}

fn parse_keep_panel(panel: ElementRef, base_url: &str) -> Option<Keep> {
    let header_sel = Selector::parse(".keepheader").unwrap();
    let header = panel.select(&header_sel).next().unwrap_or(panel);

    let owner = owner_from_classes(panel, header)?;

    let name_sel = Selector::parse(".keepname").unwrap();
    let name = panel
        .select(&name_sel)
        .next()
        .map(|e| normalize_text(&e.text().collect::<String>()))
        .filter(|s| !s.is_empty())
        .or_else(|| header_lines(header).into_iter().next())?;

    if name.is_empty() {
        return None;
    }

    let id = Keep::slug(&name);
    let kind = if has_class(panel, "relic") {
        KeepKind::Relic
    } else {
        KeepKind::Keep
    };

    let header_text = normalize_text(&header.text().collect::<String>());
    let level = LEVEL_RE
        .captures(&header_text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u32>().ok());

    let emblem_url = find_emblem_url(panel, base_url);
    let header_under_attack = header_is_under_attack(header, &header_text);
    let claimed_by = find_claimed_by(header, &name);

    Some(Keep {
        id,
        name,
        kind,
        owner,
        level,
        claimed_by,
        emblem_url,
        header_under_attack,
        under_attack: header_under_attack,
        last_event: None,
    })
}

/// Scans the panel's own classes, then the header's, for the liberal
/// `keepinfo_{alb|mid|hib}`-style marker.
fn owner_from_classes(panel: ElementRef, header: ElementRef) -> Option<Realm> {
    for el in [header, panel] {
        if let Some(class_attr) = el.value().attr("class") {
            for token in class_attr.split_whitespace() {
                if let Some(realm) = Realm::from_marker(token) {
                    return Some(realm);
                }
            }
        }
    }
    None
}

fn has_class(el: ElementRef, needle: &str) -> bool {
    el.value()
        .attr("class")
        .map(|c| c.split_whitespace().any(|t| t.eq_ignore_ascii_case(needle)))
        .unwrap_or(false)
}

/// Non-empty, normalized text lines from each direct-or-descendant child
/// element of `header`, in document order.
fn header_lines(header: ElementRef) -> Vec<String> {
    header
        .children()
        .filter_map(scraper::ElementRef::wrap)
        .map(|child| normalize_text(&child.text().collect::<String>()))
        .filter(|s| !s.is_empty())
        .collect()
}

/// Bottom-up scan rejecting the name, level line, emblem mention, or
/// under-attack phrase.
fn find_claimed_by(header: ElementRef, name: &str) -> Option<String> {
    header_lines(header)
        .into_iter()
        .rev()
        .find(|line| {
            line != name
                && !LEVEL_RE.is_match(line)
                && !line.to_ascii_lowercase().contains("emblem")
                && !HEADER_UA_TEXT_RE.is_match(line)
        })
}

fn find_emblem_url(panel: ElementRef, base_url: &str) -> Option<String> {
    let img_sel = Selector::parse("img").unwrap();
    for img in panel.select(&img_sel) {
        let alt = img.value().attr("alt").unwrap_or("").to_ascii_lowercase();
        let src = img.value().attr("src").unwrap_or("");
        if alt.contains("emblem") || src.to_ascii_lowercase().contains("emblem") {
            return Some(resolve_url(base_url, src));
        }
    }
    None
}

fn header_is_under_attack(header: ElementRef, header_text: &str) -> bool {
    if HEADER_UA_TEXT_RE.is_match(header_text) {
        return true;
    }
    let img_sel = Selector::parse("img").unwrap();
    for img in header.select(&img_sel) {
        let alt = img.value().attr("alt").unwrap_or("").to_ascii_lowercase();
        if alt.contains("under attack") {
            return true;
        }
        let src = img.value().attr("src").unwrap_or("").to_ascii_lowercase();
        if UA_BANNER_FILENAMES.iter().any(|f| src.contains(f)) {
            return true;
        }
    }
    false
}

fn resolve_url(base_url: &str, src: &str) -> String {
    if src.starts_with("http://") || src.starts_with("https://") {
        return src.to_string();
    }
    format!("{}/{}", base_url.trim_end_matches('/'), src.trim_start_matches('/'))
}

fn normalize_text(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ").trim().to_string()
}

fn parse_events(doc: &Html, now: DateTime<Utc>) -> Vec<Event> {
    let row_sel = Selector::parse("table.events tr").unwrap();
    let cell_sel = Selector::parse("td").unwrap();

    // Bucket events by their exact relative-time token so re-parses of the
    // same row land on the same synthetic instant.
    let mut bucket_index: HashMap<String, i64> = HashMap::new();
    let mut events = Vec::new();

    for row in doc.select(&row_sel) {
        let cells: Vec<_> = row.select(&cell_sel).collect();
        if cells.len() < 2 {
            continue;
        }
        let text = normalize_text(&cells[0].text().collect::<String>());
        let time_text = normalize_text(&cells[cells.len() - 1].text().collect::<String>());

        let Some((token, at)) = relative_time_to_instant(&time_text, now, &mut bucket_index) else {
            continue;
        };

        if let Some(caps) = CAPTURE_RE.captures(&text) {
            let keep_name = caps.get(1).unwrap().as_str().trim().to_string();
            let new_owner = caps.get(2).and_then(|m| realm_from_name(m.as_str()));
            let leader = caps.get(3).map(|m| m.as_str().trim().to_string());
            events.push(Event {
                at,
                kind: EventKind::Captured,
                keep_id: Keep::slug(&keep_name),
                keep_name,
                new_owner,
                leader,
                raw: text,
            });
        } else if let Some(caps) = UNDER_ATTACK_RE.captures(&text) {
            let keep_name = caps.get(1).unwrap().as_str().trim().to_string();
            events.push(Event {
                at,
                kind: EventKind::UnderAttack,
                keep_id: Keep::slug(&keep_name),
                keep_name,
                new_owner: None,
                leader: None,
                raw: text,
            });
        }
        let _ = token;
    }

    events
}

fn realm_from_name(name: &str) -> Option<Realm> {
    match name.to_ascii_lowercase().as_str() {
        "albion" => Some(Realm::Albion),
        "midgard" => Some(Realm::Midgard),
        "hibernia" => Some(Realm::Hibernia),
        _ => None,
    }
}

/// Parses "3h ago"-style text into `(bucket_token, instant)`. Within one
/// bucket, instants are spread a minute apart in parse order so ordering
/// survives even though the source resolution is coarse.
fn relative_time_to_instant(
    text: &str,
    now: DateTime<Utc>,
    bucket_index: &mut HashMap<String, i64>,
) -> Option<(String, DateTime<Utc>)> {
    let caps = RELATIVE_TIME_RE.captures(text)?;
    let magnitude: i64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2)?.as_str().to_ascii_lowercase();
    let token = format!("{magnitude}{unit}");

    let unit_seconds: i64 = match unit.as_str() {
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        _ => return None,
    };

    let idx = bucket_index.entry(token.clone()).or_insert(0);
    let this_idx = *idx;
    *idx += 1;

    let at = now
        - ChronoDuration::seconds(magnitude * unit_seconds)
        - ChronoDuration::seconds(this_idx * 60);
    Some((token, at))
}

fn apply_ua_events_to_keeps(
    events: &mut [Event],
    keeps: &mut [Keep],
    attack_window: Duration,
    now: DateTime<Utc>,
) {
    let window = ChronoDuration::from_std(attack_window).unwrap_or(ChronoDuration::minutes(7));
    for event in events.iter() {
        if event.kind != EventKind::UnderAttack {
            continue;
        }
        if now - event.at > window {
            continue;
        }
        if let Some(keep) = keeps.iter_mut().find(|k| k.id == event.keep_id) {
            keep.under_attack = true;
            keep.last_event = Some(keep.last_event.map_or(event.at, |e| e.max(event.at)));
        }
    }
}

/// Infers the DF (Darkness Falls) owner from the DF panel's imagery.
/// Falls back to Midgard when no realm marker is found.
fn parse_df_owner(doc: &Html) -> Realm {
    let img_sel = Selector::parse("#dfzone img, .df-panel img").unwrap();
    for img in doc.select(&img_sel) {
        let alt = img.value().attr("alt").unwrap_or("");
        let src = img.value().attr("src").unwrap_or("");
        for candidate in [alt, src] {
            for token in candidate.split(|c: char| !c.is_ascii_alphanumeric()) {
                if let Some(realm) = Realm::from_marker(token) {
                    return realm;
                }
            }
        }
    }
    Realm::Midgard
}
