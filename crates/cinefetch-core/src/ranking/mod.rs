//! Source ranking
//!
//! Queries the configured search provider, classifies every result row by
//! filename and orders the candidates: season packs first, then by seeders.

pub mod parser;
pub mod rules;

use crate::error::{Error, Result};
use crate::types::{RankingRequest, Settings, SourceCandidate, TaskKind};
use crate::utils::canonical_source;
use futures::future::join_all;
use parser::{parse_results, ResultRow};
use std::collections::HashSet;
use std::time::Duration;

const USER_AGENT: &str = concat!("cinefetch/", env!("CARGO_PKG_VERSION"));
const SEARCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Queries sent for one request
///
/// An episode gets `SxxEyy`; a season-only request gets `Sxx` plus the
/// `Season N` synonym so that packs named either way are found.
pub fn build_queries(request: &RankingRequest) -> Vec<String> {
    let title = request.title.trim();
    match (request.season, request.episode) {
        (Some(season), Some(episode)) => vec![format!("{} S{:02}E{:02}", title, season, episode)],
        (Some(season), None) => vec![
            format!("{} S{:02}", title, season),
            format!("{} Season {}", title, season),
        ],
        _ => {
            let mut queries = vec![title.to_string()];
            if request.kind == TaskKind::Movie {
                if let Some(imdb) = request.external_ids.as_ref().and_then(|ids| ids.imdb.as_ref()) {
                    queries.push(imdb.clone());
                }
            }
            queries
        }
    }
}

/// Provider category parameter for a kind
pub fn category_for(kind: TaskKind) -> &'static str {
    match kind {
        TaskKind::Movie => "movies",
        TaskKind::TvEpisode | TaskKind::TvSeasonPack => "tv",
        TaskKind::GenericFile => "all",
    }
}

/// Classify a parsed row
pub fn classify(row: ResultRow, origin_site: &str) -> SourceCandidate {
    SourceCandidate {
        inferred_quality: rules::infer_quality(&row.file_name).to_string(),
        inferred_season: rules::infer_season(&row.file_name),
        is_likely_pack: rules::is_likely_pack(&row.file_name),
        file_name: row.file_name,
        source_uri: row.source_uri,
        size_label: row.size_label,
        seeders: row.seeders,
        leechers: row.leechers,
        origin_site: origin_site.to_string(),
        details_url: row.details_url,
    }
}

/// Filter and order candidates
///
/// With a season requested, candidates whose extractable season differs are
/// dropped. Packs always sort before non-packs, then seeders descending; a
/// quality-hint match breaks remaining ties.
pub fn rank(
    mut candidates: Vec<SourceCandidate>,
    season: Option<u32>,
    quality_hint: Option<&str>,
    limit: usize,
) -> Vec<SourceCandidate> {
    if let Some(season) = season {
        candidates.retain(|c| rules::season_matches(&c.file_name, season));
    }

    let hint_match = |c: &SourceCandidate| {
        quality_hint.is_some_and(|hint| c.inferred_quality.eq_ignore_ascii_case(hint))
    };

    candidates.sort_by(|a, b| {
        b.is_likely_pack
            .cmp(&a.is_likely_pack)
            .then(b.seeders.cmp(&a.seeders))
            .then(hint_match(b).cmp(&hint_match(a)))
    });
    candidates.truncate(limit);
    candidates
}

/// Drop later duplicates of the same source
fn dedupe(candidates: Vec<SourceCandidate>) -> Vec<SourceCandidate> {
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|c| seen.insert(canonical_source(&c.source_uri)))
        .collect()
}

/// Search client for one provider
#[derive(Clone)]
pub struct SourceRanker {
    http: reqwest::Client,
    provider_url: reqwest::Url,
    origin_site: String,
    broad_limit: usize,
    season_limit: usize,
}

impl SourceRanker {
    pub fn new(provider_url: &str, broad_limit: usize, season_limit: usize) -> Result<Self> {
        let provider_url = reqwest::Url::parse(provider_url)
            .map_err(|e| Error::Validation(format!("invalid search provider URL {:?}: {}", provider_url, e)))?;
        let origin_site = provider_url.host_str().unwrap_or_default().to_string();

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(SEARCH_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            provider_url,
            origin_site,
            broad_limit,
            season_limit,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(
            &settings.search_provider_url,
            settings.broad_result_limit,
            settings.season_result_limit,
        )
    }

    /// Ranked candidates for a request
    ///
    /// Fails only when every query variant fails to reach the provider.
    pub async fn search(&self, request: &RankingRequest) -> Result<Vec<SourceCandidate>> {
        let queries = build_queries(request);
        let candidates = self.collect(&queries, category_for(request.kind)).await?;

        let limit = if request.season.is_some() {
            self.season_limit
        } else {
            self.broad_limit
        };
        let ranked = rank(candidates, request.season, request.quality_hint.as_deref(), limit);
        log::info!("Ranked {} candidates for {:?}", ranked.len(), request.title);
        Ok(ranked)
    }

    /// Packs across every season of a show
    ///
    /// Flattens the per-season searches plus a "complete series" query,
    /// dedupes by source and keeps packs only.
    pub async fn search_all_seasons(
        &self,
        request: &RankingRequest,
        season_count: u32,
    ) -> Result<Vec<SourceCandidate>> {
        let mut queries = Vec::new();
        for season in 1..=season_count.max(1) {
            let per_season = RankingRequest {
                season: Some(season),
                episode: None,
                ..request.clone()
            };
            queries.extend(build_queries(&per_season));
        }
        queries.push(format!("{} complete series", request.title.trim()));

        let packs: Vec<SourceCandidate> = self
            .collect(&queries, category_for(TaskKind::TvSeasonPack))
            .await?
            .into_iter()
            .filter(|c| c.is_likely_pack)
            .collect();

        Ok(rank(packs, None, request.quality_hint.as_deref(), self.broad_limit))
    }

    /// Run all queries concurrently and merge their rows
    async fn collect(&self, queries: &[String], category: &str) -> Result<Vec<SourceCandidate>> {
        let results = join_all(queries.iter().map(|q| self.fetch_page(q, category))).await;

        let mut candidates = Vec::new();
        let mut last_error = None;
        let mut succeeded = 0usize;
        for (query, result) in queries.iter().zip(results) {
            match result {
                Ok(rows) => {
                    succeeded += 1;
                    candidates.extend(rows.into_iter().map(|row| classify(row, &self.origin_site)));
                }
                Err(e) => {
                    log::warn!("Search query {:?} failed: {}", query, e);
                    last_error = Some(e);
                }
            }
        }

        if succeeded == 0 {
            if let Some(e) = last_error {
                return Err(e);
            }
        }
        Ok(dedupe(candidates))
    }

    async fn fetch_page(&self, query: &str, category: &str) -> Result<Vec<ResultRow>> {
        let response = self
            .http
            .get(self.provider_url.clone())
            .query(&[
                ("q", query),
                ("category", category),
                ("sort", "seeders"),
                ("order", "desc"),
            ])
            .send()
            .await
            .map_err(|e| Error::Transport(format!("search provider unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "search provider returned HTTP {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| Error::Transport(format!("failed to read search response: {}", e)))?;

        let page = parse_results(&body, &self.provider_url);
        if page.skipped > 0 {
            log::debug!("Query {:?}: kept {} rows, skipped {}", query, page.rows.len(), page.skipped);
        }
        Ok(page.rows)
    }
}
