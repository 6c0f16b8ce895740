//! Sitemap discovery and treatment-page filtering.

use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::{HashSet, VecDeque};
use tracing::{debug, info, warn};
use url::Url;

use crate::utils::error::{AppError, Result};

/// Nested sitemap indexes are followed at most this deep.
const MAX_INDEX_DEPTH: usize = 3;

const EXCLUDED_PATTERNS: &[&str] = &[
    "/blog/", "/news/", "/notice/", "/event/", "/category/", "/tag/", "/author/", "/feed/", "/rss/",
    "/atom/", ".pdf", ".jpg", ".png", ".gif", ".css", ".js", "/admin/", "/login/", "/api/",
];

const RELEVANT_KEYWORDS: &[&str] = &[
    "treatment", "service", "procedure", "menu", "price", "cost", "reservation", "booking",
    "consultation", "products", "시술", "치료", "서비스", "메뉴", "가격", "요금", "예약", "상담",
    "프로그램", "진료",
];

const TREATMENT_KEYWORDS: &[&str] = &["treatment", "procedure", "service", "시술", "치료"];
const PRODUCT_KEYWORDS: &[&str] = &["products", "menu", "price", "제품", "메뉴", "가격"];
const BOOKING_KEYWORDS: &[&str] = &["reservation", "booking", "consultation", "예약", "상담"];

/// Contents of one sitemap file: page URLs from a `<urlset>` and child sitemaps from
/// a `<sitemapindex>`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SitemapDocument {
    pub urls: Vec<String>,
    pub sitemaps: Vec<String>,
}

pub fn parse_sitemap(xml: &str) -> Result<SitemapDocument> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut document = SitemapDocument::default();

    let mut in_url = false;
    let mut in_sitemap = false;
    let mut in_loc = false;
    let mut loc = String::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"url" => {
                    in_url = true;
                    loc.clear();
                }
                b"sitemap" => {
                    in_sitemap = true;
                    loc.clear();
                }
                b"loc" => in_loc = true,
                _ => {}
            },
            Event::End(e) => match e.local_name().as_ref() {
                b"url" if in_url => {
                    if !loc.is_empty() {
                        document.urls.push(loc.clone());
                    }
                    in_url = false;
                }
                b"sitemap" if in_sitemap => {
                    if !loc.is_empty() {
                        document.sitemaps.push(loc.clone());
                    }
                    in_sitemap = false;
                }
                b"loc" => in_loc = false,
                _ => {}
            },
            Event::Text(e) if in_loc && (in_url || in_sitemap) => {
                loc = e.unescape()?.trim().to_string();
            }
            Event::CData(e) if in_loc && (in_url || in_sitemap) => {
                loc = String::from_utf8_lossy(&e.into_inner()).trim().to_string();
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(document)
}

/// Decides which sitemap URLs look like treatment or pricing pages, and in what order
/// to visit them.
#[derive(Debug, Clone, Default)]
pub struct UrlFilter {
    priority_keywords: Vec<String>,
    exclude_patterns: Vec<String>,
}

impl UrlFilter {
    pub fn new(priority_keywords: &[String], exclude_patterns: &[String]) -> Self {
        Self {
            priority_keywords: priority_keywords.iter().map(|k| k.to_lowercase()).collect(),
            exclude_patterns: exclude_patterns.iter().map(|p| p.to_lowercase()).collect(),
        }
    }

    pub fn is_relevant(&self, url: &str) -> bool {
        let url = url.to_lowercase();

        if self.exclude_patterns.iter().any(|p| url.contains(p.as_str())) {
            return false;
        }
        if EXCLUDED_PATTERNS.iter().any(|p| url.contains(p)) {
            return false;
        }
        if self.priority_keywords.iter().any(|k| url.contains(k.as_str())) {
            return true;
        }
        RELEVANT_KEYWORDS.iter().any(|k| url.contains(k))
    }

    pub fn priority(&self, url: &str) -> i32 {
        let url = url.to_lowercase();
        let hits = |keywords: &[&str]| keywords.iter().filter(|k| url.contains(*k)).count() as i32;

        let mut score = self.priority_keywords.iter().filter(|k| url.contains(k.as_str())).count() as i32 * 20;
        score += hits(TREATMENT_KEYWORDS) * 15;
        score += hits(PRODUCT_KEYWORDS) * 10;
        score += hits(BOOKING_KEYWORDS) * 8;

        // landing pages rarely carry prices
        if url.ends_with('/') || url.ends_with("/index.html") {
            score -= 5;
        }
        score
    }

    /// Keep relevant URLs, highest priority first. Ties keep sitemap order.
    pub fn rank(&self, urls: impl IntoIterator<Item = String>) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut ranked: Vec<(i32, String)> = urls
            .into_iter()
            .filter(|url| self.is_relevant(url) && seen.insert(url.clone()))
            .map(|url| (self.priority(&url), url))
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0));
        ranked.into_iter().map(|(_, url)| url).collect()
    }
}

pub struct SitemapDiscovery {
    client: reqwest::Client,
    candidate_paths: Vec<String>,
    max_urls: usize,
}

impl SitemapDiscovery {
    pub fn new(client: reqwest::Client, candidate_paths: Vec<String>, max_urls: usize) -> Self {
        Self {
            client,
            candidate_paths,
            max_urls,
        }
    }

    /// Find the first sitemap under `base_url` and return its relevant page URLs,
    /// ranked and capped.
    pub async fn discover(&self, base_url: &str, filter: &UrlFilter) -> Result<Vec<String>> {
        let base = Url::parse(base_url)
            .map_err(|e| AppError::Validation(format!("Invalid base URL '{}': {}", base_url, e)))?;

        for path in &self.candidate_paths {
            let Ok(sitemap_url) = base.join(path) else {
                continue;
            };
            match self.fetch(sitemap_url.as_str()).await {
                Ok(Some(xml)) => {
                    let urls = self.collect(sitemap_url.as_str(), &xml).await?;
                    let mut ranked = filter.rank(urls);
                    ranked.truncate(self.max_urls);
                    info!(sitemap = %sitemap_url, urls = ranked.len(), "Sitemap found");
                    return Ok(ranked);
                }
                Ok(None) => debug!(sitemap = %sitemap_url, "No sitemap at path"),
                Err(e) => warn!(sitemap = %sitemap_url, error = %e, "Sitemap request failed"),
            }
        }

        Err(AppError::NotFound {
            resource: format!("sitemap for {}", base_url),
        })
    }

    /// Walk a sitemap and any nested indexes breadth first.
    async fn collect(&self, root_url: &str, root_xml: &str) -> Result<Vec<String>> {
        let mut urls = Vec::new();
        let mut visited = HashSet::from([root_url.to_string()]);
        let mut queue = VecDeque::from([(parse_sitemap(root_xml)?, 0usize)]);

        while let Some((document, depth)) = queue.pop_front() {
            urls.extend(document.urls);

            if depth >= MAX_INDEX_DEPTH {
                continue;
            }
            for child in document.sitemaps {
                if !visited.insert(child.clone()) {
                    continue;
                }
                match self.fetch(&child).await {
                    Ok(Some(xml)) => match parse_sitemap(&xml) {
                        Ok(parsed) => queue.push_back((parsed, depth + 1)),
                        Err(e) => warn!(sitemap = %child, error = %e, "Skipping unparseable child sitemap"),
                    },
                    Ok(None) => debug!(sitemap = %child, "Child sitemap missing"),
                    Err(e) => warn!(sitemap = %child, error = %e, "Child sitemap request failed"),
                }
            }
        }

        Ok(urls)
    }

    async fn fetch(&self, url: &str) -> Result<Option<String>> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Ok(None);
        }
        Ok(Some(response.text().await?))
    }
}
