use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result, anyhow};
use futures::future::join_all;
use log::{debug, info, warn};
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use tokio::time::Duration;
use url::Url;

use crate::models::{AppDetails, StoreListing, TrendItem};
use crate::utils::{clean_html_tags, normalize_key};

pub const PLAY_ROOT: &str = "https://play.google.com";
pub const TRENDS_ROOT: &str = "https://trends.google.com";
const SEARCH_URL: &str = "https://www.google.com/search";
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const PLAY_SUFFIX: &str = " - Apps on Google Play";

/// Scrapes the store and reads the trend/news feeds.
#[derive(Clone)]
pub struct SourceClient {
    http: Client,
    play_root: String,
    trends_root: String,
}

impl SourceClient {
    pub fn new(http: Client) -> Self {
        SourceClient::with_roots(http, PLAY_ROOT, TRENDS_ROOT)
    }

    pub fn with_roots(http: Client, play_root: &str, trends_root: &str) -> Self {
        SourceClient {
            http,
            play_root: play_root.trim_end_matches('/').to_string(),
            trends_root: trends_root.trim_end_matches('/').to_string(),
        }
    }

    async fn fetch(&self, url: &str, query: &[(&str, &str)]) -> Result<reqwest::Response> {
        debug!("GET {} {:?}", url, query);
        self.http
            .get(url)
            .query(query)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("Request to {url} failed"))?
            .error_for_status()
            .with_context(|| format!("{url} answered with an error"))
    }

    pub async fn search_store(&self, query: &str) -> Result<Vec<StoreListing>> {
        let url = format!("{}/store/search", self.play_root);
        let body = self
            .fetch(&url, &[("q", query), ("c", "apps"), ("hl", "en"), ("gl", "us")])
            .await?
            .text()
            .await?;
        let base = Url::parse(&self.play_root)?;
        let listings = parse_store_search(&body, &base)?;
        debug!("Store search {:?} returned {} listings", query, listings.len());
        Ok(listings)
    }

    pub async fn app_details(&self, app_id: &str) -> Result<AppDetails> {
        let url = format!("{}/store/apps/details", self.play_root);
        let body = self
            .fetch(&url, &[("id", app_id), ("hl", "en"), ("gl", "us")])
            .await?
            .text()
            .await?;
        parse_app_details(&body, app_id)
    }

    /// Daily trending searches for one region.
    pub async fn trends(&self, geo: &str, max_items: usize) -> Result<Vec<TrendItem>> {
        let url = format!("{}/trends/trendingsearches/daily/rss", self.trends_root);
        let bytes = self.fetch(&url, &[("geo", geo)]).await?.bytes().await?;
        parse_trend_feed(&bytes, max_items)
    }

    /// Trends of several regions at once, ranked by how many regions share them.
    pub async fn trends_region(&self, geos: &[String], per_geo: usize) -> Vec<TrendItem> {
        let fetches = geos.iter().map(|geo| self.trends(geo, per_geo));
        let results = join_all(fetches).await;

        let lists = geos
            .iter()
            .zip(results)
            .filter_map(|(geo, result)| match result {
                Ok(items) => Some(items),
                Err(e) => {
                    warn!("Trends for {} unavailable: {:#}", geo, e);
                    None
                }
            })
            .collect::<Vec<_>>();

        rank_region(lists)
    }

    /// The `n`-th headline of a news feed, clamped to the last one.
    pub async fn news_headline(&self, feed_url: &str, n: usize) -> Result<Option<TrendItem>> {
        let bytes = self.fetch(feed_url, &[]).await?.bytes().await?;
        let mut items = parse_news_feed(&bytes)?;
        if items.is_empty() {
            return Ok(None);
        }
        let idx = n.min(items.len() - 1);
        Ok(Some(items.swap_remove(idx)))
    }
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("Invalid selector {css:?}: {e}"))
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

/// "Rated 4.3 stars out of five stars" -> 4.3
fn parse_rating(label: &str) -> Option<f32> {
    label
        .strip_prefix("Rated ")?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

fn img_src(el: ElementRef<'_>, base: &Url) -> Option<Url> {
    let value = el.value();
    let raw = value
        .attr("src")
        .or_else(|| value.attr("data-src"))
        .or_else(|| value.attr("srcset").and_then(|s| s.split_whitespace().next()))?;
    base.join(raw).ok()
}

pub fn parse_store_search(html: &str, base: &Url) -> Result<Vec<StoreListing>> {
    let document = Html::parse_document(html);
    let card_selector = selector(r#"a[href^="/store/apps/details?id="]"#)?;
    let img_selector = selector("img")?;
    let title_selector = selector("span")?;
    let rating_selector = selector(r#"[aria-label^="Rated "]"#)?;

    let mut seen = HashSet::new();
    let mut listings = Vec::new();

    for card in document.select(&card_selector) {
        let Some(href) = card.value().attr("href") else {
            continue;
        };
        let Ok(link) = base.join(href) else {
            continue;
        };
        let Some(app_id) = link
            .query_pairs()
            .find(|(k, _)| k == "id")
            .map(|(_, v)| v.into_owned())
        else {
            continue;
        };
        if app_id.is_empty() || !seen.insert(app_id.clone()) {
            continue;
        }

        let title = card
            .select(&title_selector)
            .map(element_text)
            .find(|t| !t.is_empty())
            .or_else(|| card.value().attr("aria-label").map(str::to_string))
            .unwrap_or_else(|| app_id.clone());

        let rating = card
            .select(&rating_selector)
            .find_map(|el| el.value().attr("aria-label").and_then(parse_rating));

        let icon = card.select(&img_selector).find_map(|img| img_src(img, base));

        listings.push(StoreListing {
            app_id,
            title,
            rating,
            icon,
        });
    }

    Ok(listings)
}

pub fn parse_app_details(html: &str, app_id: &str) -> Result<AppDetails> {
    let document = Html::parse_document(html);
    let base = Url::parse(PLAY_ROOT)?;

    let mut metadata = HashMap::new();
    let meta_selector = selector("head meta")?;
    for tag in document.select(&meta_selector) {
        let property = tag.value().attr("property");
        let name = tag.value().attr("name");
        let content = tag.value().attr("content").unwrap_or("").trim();
        if content.is_empty() {
            continue;
        }

        match property {
            Some("og:title") => {
                metadata.insert("og:title", content.to_string());
            }
            Some("og:description") => {
                metadata.insert("og:description", content.to_string());
            }
            Some("og:image") => {
                metadata.insert("og:image", content.to_string());
            }
            _ => {}
        }

        if name == Some("description") {
            metadata.entry("og:description").or_insert_with(|| content.to_string());
        }
    }

    let title = metadata
        .remove("og:title")
        .map(|t| t.trim_end_matches(PLAY_SUFFIX).trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| anyhow!("No title on the details page of {app_id}"))?;

    // The full text is richer than the meta summary when the page has it.
    let description_selector = selector(r#"[data-g-id="description"]"#)?;
    let description = document
        .select(&description_selector)
        .next()
        .map(|el| clean_html_tags(&el.inner_html()))
        .filter(|d| !d.is_empty())
        .or_else(|| metadata.remove("og:description"))
        .unwrap_or_default();

    let header_selector = selector(r#"img[alt="Feature graphic"]"#)?;
    let header_image = document
        .select(&header_selector)
        .find_map(|img| img_src(img, &base));

    let icon_selector = selector(r#"img[itemprop="image"], img[alt="Icon image"]"#)?;
    let icon = document
        .select(&icon_selector)
        .find_map(|img| img_src(img, &base))
        .or_else(|| metadata.remove("og:image").and_then(|u| Url::parse(&u).ok()));

    let rating_selector = selector(r#"[aria-label^="Rated "]"#)?;
    let rating = document
        .select(&rating_selector)
        .find_map(|el| el.value().attr("aria-label").and_then(parse_rating));

    info!("Scraped details for {} ({})", title, app_id);

    Ok(AppDetails {
        app_id: app_id.to_string(),
        title,
        description,
        icon,
        header_image,
        rating,
    })
}

/// Trend entries link to a web search for their title.
pub fn parse_trend_feed(bytes: &[u8], max_items: usize) -> Result<Vec<TrendItem>> {
    let feed = feed_rs::parser::parse(bytes).context("Failed to parse trends feed")?;
    let items = feed
        .entries
        .into_iter()
        .filter_map(|entry| entry.title.map(|t| t.content.trim().to_string()))
        .filter(|title| !title.is_empty())
        .take(max_items)
        .filter_map(|title| {
            let link = Url::parse_with_params(SEARCH_URL, &[("q", title.as_str())]).ok()?;
            Some(TrendItem {
                title,
                link: link.to_string(),
            })
        })
        .collect();
    Ok(items)
}

pub fn parse_news_feed(bytes: &[u8]) -> Result<Vec<TrendItem>> {
    let feed = feed_rs::parser::parse(bytes).context("Failed to parse news feed")?;
    Ok(feed
        .entries
        .into_iter()
        .filter_map(|entry| {
            let title = entry.title?.content.trim().to_string();
            let link = entry.links.into_iter().next()?.href;
            (!title.is_empty()).then_some(TrendItem { title, link })
        })
        .collect())
}

/// Merge per-region lists: most regions first, then alphabetical.
/// The first spelling and link seen for a normalized title wins.
pub fn rank_region(lists: Vec<Vec<TrendItem>>) -> Vec<TrendItem> {
    let mut bucket: HashMap<String, (usize, TrendItem)> = HashMap::new();
    for item in lists.into_iter().flatten() {
        let key = normalize_key(&item.title);
        if key.is_empty() {
            continue;
        }
        bucket.entry(key).or_insert((0, item)).0 += 1;
    }

    let mut ranked: Vec<(usize, TrendItem)> = bucket.into_values().collect();
    ranked.sort_by(|(ca, a), (cb, b)| cb.cmp(ca).then_with(|| a.title.cmp(&b.title)));
    ranked.into_iter().map(|(_, item)| item).collect()
}
