//! Search provider result-table parsing

use crate::error::{Error, Result};
use crate::utils::parse_magnet;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

static ROW: Lazy<Selector> = Lazy::new(|| Selector::parse("tr").expect("valid row selector"));
static HEADER_CELL: Lazy<Selector> = Lazy::new(|| Selector::parse("th").expect("valid th selector"));
static CELL: Lazy<Selector> = Lazy::new(|| Selector::parse("td").expect("valid td selector"));
static ANCHOR: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").expect("valid anchor selector"));

static SIZE_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\d[\d,]*(?:\.\d+)?\s*(?:[KMGT]i?B|B)$").expect("size label regex should compile")
});

/// One usable row of the provider's result table
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub file_name: String,
    pub source_uri: String,
    pub size_label: String,
    pub seeders: u32,
    pub leechers: u32,
    pub details_url: Option<String>,
}

/// Rows extracted from one result page
#[derive(Debug, Default)]
pub struct ParsedPage {
    pub rows: Vec<ResultRow>,
    /// Rows dropped because they lacked a magnet link or a name
    pub skipped: usize,
}

/// Column positions learned from the table header
#[derive(Debug, Default, Clone, Copy)]
struct Columns {
    size: Option<usize>,
    seeders: Option<usize>,
    leechers: Option<usize>,
}

impl Columns {
    fn from_header(row: ElementRef<'_>) -> Option<Self> {
        let headers: Vec<String> = row
            .select(&HEADER_CELL)
            .map(|th| cell_text(th).to_lowercase())
            .collect();
        if headers.is_empty() {
            return None;
        }

        let position = |pred: &dyn Fn(&str) -> bool| headers.iter().position(|h| pred(h));
        Some(Self {
            size: position(&|h| h.contains("size")),
            seeders: position(&|h| h.contains("seed") || h == "se" || h == "s"),
            leechers: position(&|h| h.contains("leech") || h == "le" || h == "l" || h.contains("peer")),
        })
    }
}

/// Parse a result page
///
/// `base_url` resolves relative details links. Rows without a magnet link or
/// a usable name are skipped and counted, never fatal.
pub fn parse_results(html: &str, base_url: &reqwest::Url) -> ParsedPage {
    let document = Html::parse_document(html);
    let mut columns = Columns::default();
    let mut page = ParsedPage::default();

    for row in document.select(&ROW) {
        if let Some(header) = Columns::from_header(row) {
            columns = header;
            continue;
        }

        match parse_row(row, columns, base_url) {
            Ok(Some(parsed)) => page.rows.push(parsed),
            Ok(None) => {}
            Err(e) => {
                log::debug!("Skipping search result row: {}", e);
                page.skipped += 1;
            }
        }
    }

    page
}

/// `Ok(None)` for rows that carry no cells at all (spacers, captions)
fn parse_row(row: ElementRef<'_>, columns: Columns, base_url: &reqwest::Url) -> Result<Option<ResultRow>> {
    let cells: Vec<ElementRef<'_>> = row.select(&CELL).collect();
    if cells.is_empty() {
        return Ok(None);
    }

    let mut source_uri = None;
    let mut title_anchor = None;
    for anchor in row.select(&ANCHOR) {
        let href = anchor.value().attr("href").unwrap_or_default().trim();
        if href.to_ascii_lowercase().starts_with("magnet:") {
            if source_uri.is_none() {
                source_uri = Some(href.to_string());
            }
        } else if title_anchor.is_none() && !cell_text(anchor).is_empty() {
            title_anchor = Some((cell_text(anchor), href.to_string()));
        }
    }

    let source_uri = source_uri.ok_or_else(|| Error::Parse("row has no magnet link".into()))?;

    let file_name = title_anchor
        .as_ref()
        .map(|(text, _)| text.clone())
        .or_else(|| parse_magnet(&source_uri).and_then(|m| m.display_name))
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| Error::Parse("row has no file name".into()))?;

    let details_url = title_anchor
        .map(|(_, href)| href)
        .filter(|href| !href.is_empty() && !href.starts_with('#'))
        .and_then(|href| base_url.join(&href).ok())
        .map(|url| url.to_string());

    let texts: Vec<String> = cells.iter().map(|c| cell_text(*c)).collect();

    let size_label = columns
        .size
        .and_then(|i| texts.get(i))
        .filter(|t| SIZE_LABEL.is_match(t))
        .or_else(|| texts.iter().find(|t| SIZE_LABEL.is_match(t)))
        .cloned()
        .unwrap_or_default();

    let numeric: Vec<u32> = texts.iter().filter_map(|t| parse_count(t)).collect();
    let seeders = columns
        .seeders
        .and_then(|i| texts.get(i))
        .and_then(|t| parse_count(t))
        .or_else(|| numeric.len().checked_sub(2).and_then(|i| numeric.get(i).copied()))
        .unwrap_or(0);
    let leechers = columns
        .leechers
        .and_then(|i| texts.get(i))
        .and_then(|t| parse_count(t))
        .or_else(|| numeric.last().copied().filter(|_| numeric.len() >= 2))
        .unwrap_or(0);

    Ok(Some(ResultRow {
        file_name: file_name.trim().to_string(),
        source_uri,
        size_label,
        seeders,
        leechers,
        details_url,
    }))
}

fn cell_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse a seeder/leecher count such as "1,204"
fn parse_count(text: &str) -> Option<u32> {
    let cleaned = text.replace(',', "");
    if cleaned.is_empty() || !cleaned.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    cleaned.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> reqwest::Url {
        reqwest::Url::parse("https://search.example.org/search?q=x").unwrap()
    }

    const PAGE: &str = r#"
        <html><body>
        <table class="results">
          <thead><tr><th>Name</th><th>Uploaded</th><th>Size</th><th>SE</th><th>LE</th></tr></thead>
          <tbody>
            <tr>
              <td><a href="/torrent/1/show-s02">Show S02 Complete 1080p</a>
                  <a href="magnet:?xt=urn:btih:1111111111111111111111111111111111111111">M</a></td>
              <td>2023-01-04</td><td>24.1 GB</td><td>1,204</td><td>33</td>
            </tr>
            <tr>
              <td><a href="/torrent/2/show-s02e01">Show S02E01 720p</a></td>
              <td>2023-01-04</td><td>1.1 GB</td><td>80</td><td>3</td>
            </tr>
            <tr>
              <td><a href="magnet:?xt=urn:btih:3333333333333333333333333333333333333333&amp;dn=Show+S02E02+720p">M</a></td>
              <td>2023-01-05</td><td>1.2 GB</td><td>40</td><td>2</td>
            </tr>
            <tr>
              <td><a href="magnet:?xt=urn:btih:4444444444444444444444444444444444444444"></a></td>
              <td>2023-01-05</td><td>1.2 GB</td><td>4</td><td>2</td>
            </tr>
          </tbody>
        </table>
        </body></html>
    "#;

    #[test]
    fn test_parse_rows_and_skip_broken_ones() {
        let page = parse_results(PAGE, &base());

        assert_eq!(page.rows.len(), 2);
        assert_eq!(page.skipped, 2);

        let first = &page.rows[0];
        assert_eq!(first.file_name, "Show S02 Complete 1080p");
        assert_eq!(first.size_label, "24.1 GB");
        assert_eq!(first.seeders, 1204);
        assert_eq!(first.leechers, 33);
        assert_eq!(
            first.details_url.as_deref(),
            Some("https://search.example.org/torrent/1/show-s02")
        );

        // name falls back to the magnet display name
        let second = &page.rows[1];
        assert_eq!(second.file_name, "Show S02E02 720p");
        assert_eq!(second.seeders, 40);
        assert!(second.details_url.is_none());
    }

    #[test]
    fn test_headerless_table_uses_trailing_numbers() {
        let html = r#"<table>
            <tr><td><a href="/t/9">Movie 2019 1080p</a> <a href="magnet:?xt=urn:btih:9999999999999999999999999999999999999999">dl</a></td>
                <td>700 MB</td><td>12</td><td>5</td></tr>
        </table>"#;
        let page = parse_results(html, &base());
        assert_eq!(page.rows.len(), 1);
        assert_eq!(page.rows[0].size_label, "700 MB");
        assert_eq!(page.rows[0].seeders, 12);
        assert_eq!(page.rows[0].leechers, 5);
    }

    #[test]
    fn test_page_without_magnets_is_empty() {
        let html = r#"<table><tr><th>Name</th></tr><tr><td><a href="/t/1">Nothing here</a></td></tr></table>"#;
        let page = parse_results(html, &base());
        assert!(page.rows.is_empty());
        assert_eq!(page.skipped, 1);

        let page = parse_results("<html><body><p>No results</p></body></html>", &base());
        assert!(page.rows.is_empty());
        assert_eq!(page.skipped, 0);
    }

    #[test]
    fn test_parse_count() {
        assert_eq!(parse_count("1,204"), Some(1204));
        assert_eq!(parse_count("0"), Some(0));
        assert_eq!(parse_count("1.2 GB"), None);
        assert_eq!(parse_count(""), None);
    }
}
