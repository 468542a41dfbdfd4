#![forbid(unsafe_code)]

//! Paginated search of one window with cache short-circuit.

use std::collections::HashSet;

use chrono::Local;

use crate::cache::WindowCache;
use crate::config::DelayRange;
use crate::error::HarvestError;
use crate::filter::FilterThresholds;
use crate::model::CandidateItem;
use crate::provider::{SearchProvider, SearchQuery};
use crate::retry::{Pacer, RetryPolicy};
use crate::timetext;
use crate::window::TimeWindow;

#[derive(Debug, Clone, Default)]
pub struct WindowSearch {
    /// Accepted candidates, in provider order.
    pub items: Vec<CandidateItem>,
    pub from_cache: bool,
    /// False when pagination was cut short by an exhausted retry budget.
    pub complete: bool,
    /// The platform stopped accepting the session mid-search.
    pub session_lost: bool,
}

pub struct SearchEngine<P> {
    provider: P,
    cache: WindowCache,
    thresholds: FilterThresholds,
    keyword: String,
    max_pages: u32,
    policy: RetryPolicy,
    pacer: Pacer,
    request_delay: DelayRange,
}

pub struct SearchOptions {
    pub keyword: String,
    pub thresholds: FilterThresholds,
    pub max_pages: u32,
    pub policy: RetryPolicy,
    pub request_delay: DelayRange,
}

impl<P: SearchProvider> SearchEngine<P> {
    pub fn new(provider: P, cache: WindowCache, options: SearchOptions, pacer: Pacer) -> Self {
        Self {
            provider,
            cache,
            thresholds: options.thresholds,
            keyword: options.keyword,
            max_pages: options.max_pages.max(1),
            policy: options.policy,
            pacer,
            request_delay: options.request_delay,
        }
    }

    /// Returns the accepted candidates for `window`, from the cache when one
    /// exists. Never fails: errors end pagination and yield a partial result.
    pub fn search_window(&self, window: &TimeWindow) -> WindowSearch {
        match self.cache.load(window) {
            Ok(Some(items)) if items.iter().all(|item| self.thresholds.accepts(item)) => {
                log::info!(
                    "Using cached results for {} ({} items)",
                    window.label(),
                    items.len()
                );
                return WindowSearch {
                    items,
                    from_cache: true,
                    complete: true,
                    session_lost: false,
                };
            }
            Ok(Some(_)) => log::info!(
                "Cache for {} no longer matches the filter; searching again",
                window.label()
            ),
            Ok(None) => {}
            Err(err) => log::warn!(
                "Ignoring unreadable cache for {}: {err:#}",
                window.label()
            ),
        }

        let (raw, stopped_by) = self.paginate(window);
        let complete = stopped_by.is_none();
        let session_lost = matches!(stopped_by, Some(HarvestError::Credential(_)));
        let found = raw.len();
        let items = self.thresholds.apply(resolve_in_window(raw, window));
        log::info!(
            "Window {}: {} found, {} accepted{}",
            window.label(),
            found,
            items.len(),
            if complete { "" } else { " (incomplete)" }
        );

        if complete {
            if let Err(err) = self.cache.store(window, &items) {
                log::warn!("Could not cache results for {}: {err:#}", window.label());
            }
        } else {
            log::warn!(
                "Search of {} stopped early; results are not cached so the next run retries it",
                window.label()
            );
        }

        WindowSearch {
            items,
            from_cache: false,
            complete,
            session_lost,
        }
    }

    /// Collects raw results page by page. The error that cut pagination short
    /// is returned alongside whatever was gathered before it.
    fn paginate(&self, window: &TimeWindow) -> (Vec<CandidateItem>, Option<HarvestError>) {
        let page_size = self.provider.page_size();
        let mut collected = Vec::new();

        for page in 1..=self.max_pages {
            let query = SearchQuery {
                keyword: self.keyword.clone(),
                page,
                window: *window,
            };
            let label = format!("search {} page {page}", window.label());
            let outcome = self.policy.run(&self.pacer, &label, |_| {
                let result = self.provider.fetch_page(&query);
                self.pacer.pause(self.request_delay);
                result
            });
            let fetched = match outcome {
                Ok(fetched) => fetched,
                Err(err) => {
                    log::warn!("Pagination of {} aborted on page {page}: {err}", window.label());
                    return (collected, Some(err));
                }
            };

            let count = fetched.items.len();
            collected.extend(fetched.items);

            if count == 0 || count < page_size || !fetched.has_next_page {
                return (collected, None);
            }
            let seen = (page as usize - 1) * page_size + count;
            if let Some(total) = fetched.total_results
                && (seen as u64) >= total
            {
                return (collected, None);
            }
        }

        log::info!(
            "Reached the {}-page limit for {}",
            self.max_pages,
            window.label()
        );
        (collected, None)
    }
}

/// Resolves publish times and keeps unique items that land inside `window`.
fn resolve_in_window(raw: Vec<CandidateItem>, window: &TimeWindow) -> Vec<CandidateItem> {
    let now = Local::now();
    let mut seen = HashSet::new();
    let mut kept = Vec::with_capacity(raw.len());
    for mut item in raw {
        if !seen.insert(item.id.clone()) {
            continue;
        }
        match timetext::normalize(&item.published_text, window, now) {
            Some(ts) if window.contains(ts) => {
                item.resolve_published(ts);
                kept.push(item);
            }
            Some(_) => log::debug!("Dropping {}: published outside {}", item.id, window.label()),
            None => log::debug!(
                "Dropping {}: unrecognized publish time '{}'",
                item.id,
                item.published_text
            ),
        }
    }
    kept
}
