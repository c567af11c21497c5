use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::app::ports::PageRenderer;
use crate::common::error::{Result, ScraperError};
use crate::common::types::ResourceDescriptor;
use crate::config::LocatorConfig;
use crate::pipeline::ingestion::backoff::Backoff;
use crate::pipeline::ingestion::matcher::PatternMatcher;

/// Per category, the selected descriptor (or `None` when nothing matched)
pub type LocatedResources = BTreeMap<String, Option<ResourceDescriptor>>;

/// A resource item as read off the page, before classification
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateItem {
    pub url: String,
    pub filename: String,
    /// `None` when no date could be recovered from the item
    pub date: Option<NaiveDate>,
}

struct Selectors {
    item: Selector,
    link: Selector,
    title: Selector,
    dates: Vec<Selector>,
}

fn parse_selector(raw: &str) -> Result<Selector> {
    Selector::parse(raw).map_err(|e| ScraperError::Config(format!("invalid selector '{raw}': {e:?}")))
}

impl Selectors {
    fn from_config(config: &LocatorConfig) -> Result<Self> {
        Ok(Self {
            item: parse_selector(&config.item_selector)?,
            link: parse_selector(&config.link_selector)?,
            title: parse_selector(&config.title_selector)?,
            dates: config
                .date_selectors
                .iter()
                .map(|s| parse_selector(s))
                .collect::<Result<Vec<_>>>()?,
        })
    }
}

/// Finds the current download for each category on the rendered listing page.
pub struct ResourceLocator {
    matcher: PatternMatcher,
    selectors: Selectors,
}

impl ResourceLocator {
    pub fn new(matcher: PatternMatcher, config: &LocatorConfig) -> Result<Self> {
        Ok(Self {
            matcher,
            selectors: Selectors::from_config(config)?,
        })
    }

    /// Render `base_url` (with retries) and select one descriptor per category.
    #[instrument(skip(self, renderer, backoff))]
    pub async fn locate(
        &self,
        renderer: &dyn PageRenderer,
        backoff: &Backoff,
        base_url: &str,
    ) -> Result<LocatedResources> {
        let html = backoff
            .retry("render dataset page", |_| renderer.render(base_url))
            .await?;
        self.locate_in_document(&html, base_url)
    }

    /// Pure selection over already-rendered markup.
    pub fn locate_in_document(&self, html: &str, base_url: &str) -> Result<LocatedResources> {
        let base = Url::parse(base_url)
            .map_err(|e| ScraperError::Config(format!("invalid base url '{base_url}': {e}")))?;
        let items = self.extract_items(html, &base);
        info!("Found {} potential resource items", items.len());
        if items.is_empty() {
            warn!("No resource items found; the page structure might have changed");
        }

        let mut selected: LocatedResources = self
            .matcher
            .categories()
            .map(|c| (c.id.clone(), None))
            .collect();

        for item in items {
            let Some(category) = self.matcher.classify(&item.filename) else {
                debug!("Ignoring unmatched resource {}", item.filename);
                continue;
            };
            let candidate = ResourceDescriptor {
                category: category.id.clone(),
                source_url: item.url,
                observed_date: item.date.unwrap_or(NaiveDate::MIN),
                historical: category.is_historical_name(&item.filename),
                filename: item.filename,
            };
            let slot = selected.entry(category.id.clone()).or_insert(None);
            if prefer(slot.as_ref(), &candidate) {
                info!(
                    category = %candidate.category,
                    historical = candidate.historical,
                    "Selected {} ({})",
                    candidate.filename,
                    candidate.observed_date
                );
                *slot = Some(candidate);
            }
        }

        for (category, descriptor) in &selected {
            if descriptor.is_none() {
                warn!("Could not find a suitable file matching pattern for '{}'", category);
            }
        }
        Ok(selected)
    }

    pub fn extract_items(&self, html: &str, base: &Url) -> Vec<CandidateItem> {
        let document = Html::parse_document(html);
        document
            .select(&self.selectors.item)
            .filter_map(|item| self.extract_item(item, base))
            .collect()
    }

    fn extract_item(&self, item: ElementRef<'_>, base: &Url) -> Option<CandidateItem> {
        let href = item
            .select(&self.selectors.link)
            .next()
            .and_then(|a| a.value().attr("href"))
            .map(str::trim)
            .filter(|h| !h.is_empty())?;
        let url = match base.join(href) {
            Ok(u) => u,
            Err(e) => {
                debug!("Skipping item with unparsable href {}: {}", href, e);
                return None;
            }
        };

        let title = item
            .select(&self.selectors.title)
            .next()
            .map(|t| collapse_text(t.text()))
            .filter(|t| !t.is_empty());

        let filename = filename_from_url(&url).or(title)?;
        let date = self.extract_date(item);
        Some(CandidateItem {
            url: url.to_string(),
            filename,
            date,
        })
    }

    fn extract_date(&self, item: ElementRef<'_>) -> Option<NaiveDate> {
        for selector in &self.selectors.dates {
            for element in item.select(selector) {
                let text = collapse_text(element.text());
                if let Some(date) = parse_date_element(&text) {
                    return Some(date);
                }
                debug!("Could not parse date element '{}'", text);
            }
        }
        scan_for_date(&collapse_text(item.text()))
    }
}

/// Decide whether `candidate` replaces the current selection.
///
/// Historical releases beat anything non-historical regardless of date.
/// Otherwise the later date wins and ties keep the first-seen item.
pub fn prefer(current: Option<&ResourceDescriptor>, candidate: &ResourceDescriptor) -> bool {
    match current {
        None => true,
        Some(current) => match (current.historical, candidate.historical) {
            (false, true) => true,
            (true, false) => false,
            _ => candidate.observed_date > current.observed_date,
        },
    }
}

fn collapse_text<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    parts
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Last path segment, percent-decoded, if it looks like a file name.
pub fn filename_from_url(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.filter(|s| !s.is_empty()).last()?;
    let decoded = urlencoding::decode(segment)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| segment.to_string());
    if decoded.contains('.') {
        Some(decoded)
    } else {
        None
    }
}

/// Dedicated date elements: "From 01/04/2010 To 31/03/2024" or "Last updated: 2 May 2024".
pub fn parse_date_element(text: &str) -> Option<NaiveDate> {
    if let Some(idx) = text.find(" To ").or_else(|| text.find("To ")) {
        let tail = text[idx..].trim_start().trim_start_matches("To").trim();
        if let Some(date) = tail.split_whitespace().next().and_then(parse_dmy) {
            return Some(date);
        }
    }
    let lowered = text.to_lowercase();
    let cleaned = lowered
        .trim_start_matches("last updated")
        .trim_start_matches(':')
        .trim();
    parse_dmy(cleaned).or_else(|| scan_for_date(text))
}

fn parse_dmy(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%d/%m/%Y").ok()
}

static NUMERIC_DMY: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{1,2})/(\d{1,2})/(\d{4})\b").unwrap());
static ISO_DATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})\b").unwrap());
/// English month names and their usual abbreviations, nothing looser.
const MONTH_NAME: &str = "jan(?:uary)?|feb(?:ruary)?|mar(?:ch)?|apr(?:il)?|may|june?|july?|aug(?:ust)?|sep(?:t(?:ember)?)?|oct(?:ober)?|nov(?:ember)?|dec(?:ember)?";

static DAY_MONTH_YEAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)\b(\d{{1,2}})(?:st|nd|rd|th)?\s+({MONTH_NAME})\.?,?\s+(\d{{4}})\b"
    ))
    .unwrap()
});
static MONTH_DAY_YEAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)\b({MONTH_NAME})\.?\s+(\d{{1,2}})(?:st|nd|rd|th)?,?\s+(\d{{4}})\b"
    ))
    .unwrap()
});
static MONTH_YEAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!(r"(?i)\b({MONTH_NAME})\.?\s+(\d{{4}})\b")).unwrap());

fn month_number(name: &str) -> Option<u32> {
    let month = match name.to_lowercase().as_str() {
        "jan" | "january" => 1,
        "feb" | "february" => 2,
        "mar" | "march" => 3,
        "apr" | "april" => 4,
        "may" => 5,
        "jun" | "june" => 6,
        "jul" | "july" => 7,
        "aug" | "august" => 8,
        "sep" | "sept" | "september" => 9,
        "oct" | "october" => 10,
        "nov" | "november" => 11,
        "dec" | "december" => 12,
        _ => return None,
    };
    Some(month)
}

fn num<T: std::str::FromStr>(s: &str) -> Option<T> {
    s.parse().ok()
}

/// Lenient scan of free text for date-like substrings; the latest one wins.
///
/// Numeric dates are read day-first, matching the portal's UK formatting.
pub fn scan_for_date(text: &str) -> Option<NaiveDate> {
    let mut found: Vec<NaiveDate> = Vec::new();

    for c in NUMERIC_DMY.captures_iter(text) {
        if let (Some(d), Some(m), Some(y)) = (num(&c[1]), num(&c[2]), num(&c[3])) {
            found.extend(NaiveDate::from_ymd_opt(y, m, d));
        }
    }
    for c in ISO_DATE.captures_iter(text) {
        if let (Some(y), Some(m), Some(d)) = (num(&c[1]), num(&c[2]), num(&c[3])) {
            found.extend(NaiveDate::from_ymd_opt(y, m, d));
        }
    }
    for c in DAY_MONTH_YEAR.captures_iter(text) {
        if let (Some(d), Some(m), Some(y)) = (num(&c[1]), month_number(&c[2]), num(&c[3])) {
            found.extend(NaiveDate::from_ymd_opt(y, m, d));
        }
    }
    for c in MONTH_DAY_YEAR.captures_iter(text) {
        if let (Some(m), Some(d), Some(y)) = (month_number(&c[1]), num(&c[2]), num(&c[3])) {
            found.extend(NaiveDate::from_ymd_opt(y, m, d));
        }
    }
    if found.is_empty() {
        for c in MONTH_YEAR.captures_iter(text) {
            if let (Some(m), Some(y)) = (month_number(&c[1]), num(&c[2])) {
                found.extend(NaiveDate::from_ymd_opt(y, m, 1));
            }
        }
    }
    found.into_iter().max()
}
