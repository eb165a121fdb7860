//! Filename classification tables
//!
//! Every heuristic is an ordered `(label, pattern)` table evaluated
//! first-match-wins. Patterns use explicit non-alphanumeric boundaries
//! instead of `\b` because release names separate tokens with `_` as often
//! as with `.` or spaces.

use once_cell::sync::Lazy;
use regex::Regex;

/// Label returned when no quality marker matches
pub const UNKNOWN_QUALITY: &str = "Unknown";

/// One classification rule
#[derive(Debug)]
struct Rule {
    label: &'static str,
    pattern: Regex,
}

impl Rule {
    fn new(label: &'static str, alternatives: &str) -> Self {
        let pattern = Regex::new(&format!(
            r"(?i)(?:^|[^a-z0-9])(?:{})(?:[^a-z0-9]|$)",
            alternatives
        ))
        .expect("classification rule should compile");
        Self { label, pattern }
    }

    fn matches(&self, name: &str) -> bool {
        self.pattern.is_match(name)
    }
}

/// Quality markers, best first
static QUALITY_RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    vec![
        Rule::new("2160p", r"2160p|4k|uhd"),
        Rule::new("1080p", r"1080[pi]"),
        Rule::new("720p", r"720p"),
        Rule::new("BluRay", r"blu-?ray|bdrip|brrip|bdremux"),
        Rule::new("WEB-DL", r"web[-. ]?dl|webrip|web-rip"),
        Rule::new("HDRip", r"hdrip"),
        Rule::new("HDTV", r"hdtv"),
        Rule::new("DVDRip", r"dvd-?rip|dvd"),
        Rule::new("CAM", r"cam|camrip|hdcam|ts|hdts|telesync"),
    ]
});

/// Markers that suggest a multi-episode bundle
static PACK_RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    vec![
        Rule::new("batch", r"batch"),
        Rule::new("complete", r"complete"),
        Rule::new("all seasons", r"all[\s._-]?seasons"),
        Rule::new("season", r"seasons?"),
        Rule::new("collection", r"collection"),
        Rule::new(
            "season range",
            r"s\d{1,2}[\s._]*-[\s._]*s?\d{1,2}|seasons?[\s._-]*\d{1,2}[\s._]*-[\s._]*\d{1,2}",
        ),
    ]
});

static SEASON_CODE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:^|[^a-z0-9])s(\d{1,2})(?:e\d{1,3}|[^a-z0-9]|$)")
        .expect("season code regex should compile")
});

static SEASON_WORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)season[\s._-]*(\d{1,2})(?:[^0-9]|$)").expect("season word regex should compile")
});

static SEASON_RANGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:(?:^|[^a-z0-9])s(\d{1,2})[\s._]*-[\s._]*s?(\d{1,2})|seasons?[\s._-]*(\d{1,2})[\s._]*-[\s._]*(\d{1,2}))(?:[^0-9]|$)",
    )
    .expect("season range regex should compile")
});

static EPISODE_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:^|[^a-z0-9]|s\d{1,2})e\d{2,3}(?:[^0-9]|$)")
        .expect("episode marker regex should compile")
});

/// First quality marker found in `name`, or [`UNKNOWN_QUALITY`]
pub fn infer_quality(name: &str) -> &'static str {
    QUALITY_RULES
        .iter()
        .find(|rule| rule.matches(name))
        .map(|rule| rule.label)
        .unwrap_or(UNKNOWN_QUALITY)
}

/// Season number from an `Sxx` code or a `Season N` phrase
pub fn infer_season(name: &str) -> Option<u32> {
    [&*SEASON_CODE, &*SEASON_WORD]
        .iter()
        .find_map(|re| re.captures(name))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Inclusive season range such as `S01-S03` or `Seasons 1-4`
pub fn infer_season_range(name: &str) -> Option<(u32, u32)> {
    let caps = SEASON_RANGE.captures(name)?;
    let (start, end) = match (caps.get(1), caps.get(2)) {
        (Some(a), Some(b)) => (a, b),
        _ => (caps.get(3)?, caps.get(4)?),
    };
    let start: u32 = start.as_str().parse().ok()?;
    let end: u32 = end.as_str().parse().ok()?;
    (start <= end).then_some((start, end))
}

/// Whether `name` carries a single-episode marker such as `E05` or `S01E05`
pub fn has_episode_marker(name: &str) -> bool {
    EPISODE_MARKER.is_match(name)
}

/// Pack keyword present and no single-episode marker
pub fn is_likely_pack(name: &str) -> bool {
    !has_episode_marker(name) && PACK_RULES.iter().any(|rule| rule.matches(name))
}

/// Whether a candidate named `name` is acceptable for `requested` season
///
/// Names without an extractable season are kept. A multi-season range
/// matches every season it covers.
pub fn season_matches(name: &str, requested: u32) -> bool {
    if let Some((start, end)) = infer_season_range(name) {
        return (start..=end).contains(&requested);
    }
    match infer_season(name) {
        Some(season) => season == requested,
        None => true,
    }
}
