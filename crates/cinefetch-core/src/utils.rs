//! Utility helpers for Cinefetch

use crate::error::{Error, Result};
use crate::types::TaskKind;
use std::path::{Path, PathBuf};

/// Characters kept verbatim in sanitized titles besides alphanumerics
const SAFE_PUNCTUATION: &[char] = &['-', '_', '.', '(', ')', '\'', '&'];

/// Parsed pieces of a magnet URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    /// Lowercased btih value (hex or base32 as given)
    pub info_hash: String,
    pub display_name: Option<String>,
}

/// Parse a `magnet:?xt=urn:btih:...` URI
pub fn parse_magnet(uri: &str) -> Option<MagnetLink> {
    let uri = uri.trim();
    if !uri.get(..7)?.eq_ignore_ascii_case("magnet:") {
        return None;
    }
    let url = reqwest::Url::parse(uri).ok()?;

    let mut info_hash = None;
    let mut display_name = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "xt" => {
                if let Some(hash) = value
                    .strip_prefix("urn:btih:")
                    .or_else(|| value.strip_prefix("urn:BTIH:"))
                {
                    if !hash.is_empty() {
                        info_hash = Some(hash.to_lowercase());
                    }
                }
            }
            "dn" => display_name = Some(value.into_owned()),
            _ => {}
        }
    }

    info_hash.map(|info_hash| MagnetLink {
        info_hash,
        display_name,
    })
}

/// Canonical dedup key for a source: info-hash for magnets, trimmed URI otherwise
pub fn canonical_source(uri: &str) -> String {
    match parse_magnet(uri) {
        Some(magnet) => magnet.info_hash,
        None => uri.trim().to_string(),
    }
}

/// Sanitize a title for use as a directory name
///
/// Keeps alphanumerics and a small punctuation set, collapses whitespace runs
/// into a single underscore.
pub fn sanitize_title(title: &str) -> String {
    let kept: String = title
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || SAFE_PUNCTUATION.contains(c))
        .collect();

    kept.split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .trim_matches('.')
        .to_string()
}

/// Build the destination directory for a task
pub fn destination_for(root: &Path, kind: TaskKind, title: &str, season: Option<u32>) -> Result<PathBuf> {
    let name = sanitize_title(title);
    if name.is_empty() {
        return Err(Error::Validation(format!(
            "title {:?} has no usable characters for a directory name",
            title
        )));
    }

    let path = match kind {
        TaskKind::Movie => root.join("Movies").join(name),
        TaskKind::TvEpisode | TaskKind::TvSeasonPack => {
            let show = root.join("TV").join(name);
            match season {
                Some(season) => show.join(format!("Season_{:02}", season)),
                None => show,
            }
        }
        TaskKind::GenericFile => root.join("Other").join(name),
    };
    Ok(path)
}

/// Resolve and create the destination directory for a task
pub fn ensure_destination(root: &Path, kind: TaskKind, title: &str, season: Option<u32>) -> Result<PathBuf> {
    let path = destination_for(root, kind, title, season)?;
    std::fs::create_dir_all(&path).map_err(|e| {
        Error::Validation(format!("cannot create destination {:?}: {}", path, e))
    })?;
    Ok(path)
}

/// Format bytes to human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format speed to human-readable string
pub fn format_speed(bytes_per_sec: u64) -> String {
    if bytes_per_sec == 0 {
        return "0 B/s".to_string();
    }
    format!("{}/s", format_bytes(bytes_per_sec))
}

/// Format an ETA in seconds
pub fn format_eta(seconds: Option<u64>) -> String {
    let seconds = match seconds {
        Some(s) if s > 0 => s,
        _ => return "--".to_string(),
    };

    let minutes = seconds / 60;
    let hours = minutes / 60;
    let days = hours / 24;

    if days > 0 {
        format!("{}d {}h", days, hours % 24)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes % 60)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds % 60)
    } else {
        format!("{}s", seconds)
    }
}

/// Seconds remaining at the current speed
pub fn eta_seconds(completed: u64, total: Option<u64>, speed: Option<u64>) -> Option<u64> {
    let total = total?;
    let speed = speed.filter(|s| *s > 0)?;
    Some(total.saturating_sub(completed) / speed)
}

/// Narrow a counter to `u32`, saturating instead of wrapping
pub fn clamp_u32<T: TryInto<u32>>(value: T) -> u32 {
    value.try_into().unwrap_or(u32::MAX)
}

/// Calculate progress fraction in [0, 1]
pub fn calculate_progress(completed: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (completed as f64 / total as f64).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_magnet() {
        let magnet = parse_magnet(
            "magnet:?xt=urn:btih:ABCDEF0123456789ABCDEF0123456789ABCDEF01&dn=Some+Show+S01&tr=udp%3A%2F%2Ftracker",
        )
        .unwrap();
        assert_eq!(magnet.info_hash, "abcdef0123456789abcdef0123456789abcdef01");
        assert_eq!(magnet.display_name.as_deref(), Some("Some Show S01"));

        assert!(parse_magnet("https://example.org/file.mkv").is_none());
        assert!(parse_magnet("magnet:?dn=no-hash").is_none());
    }

    #[test]
    fn test_canonical_source_ignores_trackers() {
        let a = "magnet:?xt=urn:btih:ABCDEF0123456789ABCDEF0123456789ABCDEF01&tr=udp://a";
        let b = "magnet:?xt=urn:btih:abcdef0123456789abcdef0123456789abcdef01&tr=udp://b";
        assert_eq!(canonical_source(a), canonical_source(b));
        assert_eq!(canonical_source("  https://x.org/a.iso "), "https://x.org/a.iso");
    }

    #[test]
    fn test_sanitize_title() {
        assert_eq!(sanitize_title("The Office (US)"), "The_Office_(US)");
        assert_eq!(sanitize_title("  Mr.   Robot: Season?  "), "Mr._Robot_Season");
        assert_eq!(sanitize_title("Tom & Jerry's"), "Tom_&_Jerry's");
        assert_eq!(sanitize_title("../../etc"), "etc");
        assert_eq!(sanitize_title("???"), "");
    }

    #[test]
    fn test_destination_template() {
        let root = Path::new("/media");
        assert_eq!(
            destination_for(root, TaskKind::Movie, "Heat", None).unwrap(),
            PathBuf::from("/media/Movies/Heat")
        );
        assert_eq!(
            destination_for(root, TaskKind::TvSeasonPack, "The Wire", Some(2)).unwrap(),
            PathBuf::from("/media/TV/The_Wire/Season_02")
        );
        assert_eq!(
            destination_for(root, TaskKind::TvEpisode, "The Wire", None).unwrap(),
            PathBuf::from("/media/TV/The_Wire")
        );
        assert_eq!(
            destination_for(root, TaskKind::GenericFile, "debian iso", None).unwrap(),
            PathBuf::from("/media/Other/debian_iso")
        );
        assert!(matches!(
            destination_for(root, TaskKind::Movie, "!!!", None),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_ensure_destination_fails_under_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let result = ensure_destination(&blocker, TaskKind::Movie, "Heat", None);
        assert!(matches!(result, Err(Error::Validation(_))));

        let created = ensure_destination(dir.path(), TaskKind::Movie, "Heat", None).unwrap();
        assert!(created.is_dir());
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_speed(0), "0 B/s");
        assert_eq!(format_speed(2 * 1024 * 1024), "2.00 MB/s");
        assert_eq!(format_eta(None), "--");
        assert_eq!(format_eta(Some(59)), "59s");
        assert_eq!(format_eta(Some(3700)), "1h 1m");
    }

    #[test]
    fn test_progress_and_eta() {
        assert_eq!(calculate_progress(500, 1000), 0.5);
        assert_eq!(calculate_progress(5, 0), 0.0);
        assert_eq!(calculate_progress(2000, 1000), 1.0);
        assert_eq!(eta_seconds(500, Some(1000), Some(100)), Some(5));
        assert_eq!(eta_seconds(500, None, Some(100)), None);
        assert_eq!(eta_seconds(500, Some(1000), Some(0)), None);
    }

    #[test]
    fn test_clamp_u32_saturates() {
        assert_eq!(clamp_u32(7u64), 7);
        assert_eq!(clamp_u32(u64::from(u32::MAX) + 1), u32::MAX);
        assert_eq!(clamp_u32(usize::MAX), u32::MAX);
    }
}
