//! Cover image lookup over a chain of providers, skipping images used recently.
use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use html_escape::{encode_double_quoted_attribute, encode_text};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::Rng;
use regex::Regex;
use reqwest::Client;
use serde_json::Value;
use tokio::time::Duration;
use url::form_urlencoded::byte_serialize;

use crate::config::Settings;
use crate::fallback::first_success;
use crate::models::ImageChoice;
use crate::utils::{ensure_https, image_hash};

pub const PLACEHOLDER_URL: &str = "https://via.placeholder.com/1200x630.png?text=autopost";
const WIKI_TIMEOUT: Duration = Duration::from_secs(20);
const STOCK_TIMEOUT: Duration = Duration::from_secs(30);

static FIRST_IMG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)<img[^>]+src=["']([^"']+)["']"#).unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
enum Source {
    Wikipedia(&'static str),
    Pexels,
    Pixabay,
    Unsplash,
    Free(String),
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Wikipedia(lang) => write!(f, "wikipedia-{lang}"),
            Source::Pexels => write!(f, "pexels"),
            Source::Pixabay => write!(f, "pixabay"),
            Source::Unsplash => write!(f, "unsplash"),
            Source::Free(url) => write!(f, "free ({url})"),
        }
    }
}

/// Provider endpoints, overridable so tests can point them at a mock server.
#[derive(Debug, Clone)]
pub struct ImageRoots {
    /// `{lang}` is replaced with the wiki language.
    pub wikipedia: String,
    pub pexels: String,
    pub pixabay: String,
    pub unsplash: String,
}

impl Default for ImageRoots {
    fn default() -> Self {
        ImageRoots {
            wikipedia: "https://{lang}.wikipedia.org".to_string(),
            pexels: "https://api.pexels.com".to_string(),
            pixabay: "https://pixabay.com".to_string(),
            unsplash: "https://api.unsplash.com".to_string(),
        }
    }
}

#[derive(Clone, Default)]
pub struct ImageFinder {
    http: Client,
    roots: ImageRoots,
    pexels_key: Option<String>,
    pixabay_key: Option<String>,
    unsplash_key: Option<String>,
    forced: Option<String>,
}

impl ImageFinder {
    pub fn from_settings(settings: &Settings, http: Client) -> Self {
        ImageFinder {
            http,
            roots: ImageRoots::default(),
            pexels_key: settings.pexels_api_key.clone(),
            pixabay_key: settings.pixabay_api_key.clone(),
            unsplash_key: settings.unsplash_access_key.clone(),
            forced: settings.forced_image.clone(),
        }
    }

    #[cfg(test)]
    pub fn with_roots(mut self, roots: ImageRoots) -> Self {
        self.roots = roots;
        self
    }

    /// Pick a cover for `query` that is not among `used_hashes`.
    ///
    /// Never fails: when every provider is down or already used the placeholder comes back.
    pub async fn find(&self, query: &str, used_hashes: &HashSet<String>, rng: &mut StdRng) -> ImageChoice {
        if let Some(forced) = &self.forced {
            return ImageChoice {
                url: ensure_https(forced),
                credit: "Featured image".to_string(),
            };
        }

        let topic = image_topic(query);
        let seed: u64 = rng.r#gen();

        let mut sources = vec![Source::Wikipedia("ar"), Source::Wikipedia("en")];
        if self.pexels_key.is_some() {
            sources.push(Source::Pexels);
        }
        if self.pixabay_key.is_some() {
            sources.push(Source::Pixabay);
        }
        if self.unsplash_key.is_some() {
            sources.push(Source::Unsplash);
        }
        sources.extend(free_sources(&topic, seed).into_iter().map(Source::Free));

        let topic = topic.as_str();
        let found = first_success(sources, |source| async move {
            let Some(mut choice) = self.fetch(&source, topic, seed).await? else {
                return Ok::<_, anyhow::Error>(None);
            };
            choice.url = ensure_https(&choice.url);
            if used_hashes.contains(&image_hash(&choice.url)) {
                debug!("Skipping recently used image from {}", source);
                return Ok(None);
            }
            Ok(Some(choice))
        })
        .await;

        match found {
            Ok((source, choice)) => {
                info!("Cover image from {}: {}", source, choice.url);
                choice
            }
            Err(e) => {
                warn!("No fresh cover image for {:?}, using placeholder: {}", topic, e);
                placeholder()
            }
        }
    }

    async fn fetch(&self, source: &Source, topic: &str, seed: u64) -> Result<Option<ImageChoice>> {
        match source {
            Source::Wikipedia(lang) => self.wikipedia(lang, topic).await,
            Source::Pexels => self.pexels(topic, seed).await,
            Source::Pixabay => self.pixabay(topic, seed).await,
            Source::Unsplash => self.unsplash(topic, seed).await,
            Source::Free(url) => Ok(Some(ImageChoice {
                url: url.clone(),
                credit: "Free image source".to_string(),
            })),
        }
    }

    async fn get_json(&self, request: reqwest::RequestBuilder, what: &str) -> Result<Value> {
        request
            .send()
            .await
            .with_context(|| format!("{what} request failed"))?
            .error_for_status()
            .with_context(|| format!("{what} refused the request"))?
            .json()
            .await
            .with_context(|| format!("{what} sent invalid JSON"))
    }

    async fn wikipedia(&self, lang: &str, topic: &str) -> Result<Option<ImageChoice>> {
        let root = self.roots.wikipedia.replace("{lang}", lang);
        let request = self
            .http
            .get(format!("{root}/w/api.php"))
            .query(&[
                ("action", "query"),
                ("format", "json"),
                ("prop", "pageimages"),
                ("piprop", "original|thumbnail"),
                ("pithumbsize", "1200"),
                ("titles", topic),
            ])
            .timeout(WIKI_TIMEOUT);
        let data = self.get_json(request, "Wikipedia").await?;

        let url = data["query"]["pages"].as_object().and_then(|pages| {
            pages.values().find_map(|page| {
                page["original"]["source"]
                    .as_str()
                    .or_else(|| page["thumbnail"]["source"].as_str())
            })
        });

        Ok(url.map(|url| ImageChoice {
            url: url.to_string(),
            credit: format!("Image via Wikipedia ({lang})"),
        }))
    }

    async fn pexels(&self, topic: &str, seed: u64) -> Result<Option<ImageChoice>> {
        let Some(key) = &self.pexels_key else {
            return Ok(None);
        };
        let request = self
            .http
            .get(format!("{}/v1/search", self.roots.pexels))
            .header("Authorization", key)
            .query(&[("query", topic), ("per_page", "10"), ("orientation", "landscape")])
            .timeout(STOCK_TIMEOUT);
        let data = self.get_json(request, "Pexels").await?;

        let Some(photo) = pick(&data["photos"], seed) else {
            return Ok(None);
        };
        let Some(url) = photo["src"]["large2x"].as_str() else {
            return Ok(None);
        };
        let page = photo["url"].as_str().unwrap_or("https://www.pexels.com");
        Ok(Some(ImageChoice {
            url: url.to_string(),
            credit: credit_line("Pexels", page, "source"),
        }))
    }

    async fn pixabay(&self, topic: &str, seed: u64) -> Result<Option<ImageChoice>> {
        let Some(key) = &self.pixabay_key else {
            return Ok(None);
        };
        let request = self
            .http
            .get(format!("{}/api/", self.roots.pixabay))
            .query(&[
                ("key", key.as_str()),
                ("q", topic),
                ("image_type", "photo"),
                ("per_page", "10"),
                ("safesearch", "true"),
                ("orientation", "horizontal"),
            ])
            .timeout(STOCK_TIMEOUT);
        let data = self.get_json(request, "Pixabay").await?;

        let Some(hit) = pick(&data["hits"], seed) else {
            return Ok(None);
        };
        let Some(url) = hit["largeImageURL"].as_str() else {
            return Ok(None);
        };
        let page = hit["pageURL"].as_str().unwrap_or("https://pixabay.com");
        Ok(Some(ImageChoice {
            url: url.to_string(),
            credit: credit_line("Pixabay", page, "source"),
        }))
    }

    async fn unsplash(&self, topic: &str, seed: u64) -> Result<Option<ImageChoice>> {
        let Some(key) = &self.unsplash_key else {
            return Ok(None);
        };
        let request = self
            .http
            .get(format!("{}/search/photos", self.roots.unsplash))
            .header("Authorization", format!("Client-ID {key}"))
            .query(&[("query", topic), ("per_page", "10"), ("orientation", "landscape")])
            .timeout(STOCK_TIMEOUT);
        let data = self.get_json(request, "Unsplash").await?;

        let Some(photo) = pick(&data["results"], seed) else {
            return Ok(None);
        };
        let Some(url) = photo["urls"]["regular"]
            .as_str()
            .or_else(|| photo["urls"]["full"].as_str())
        else {
            return Ok(None);
        };
        let page = photo["user"]["links"]["html"].as_str().unwrap_or("https://unsplash.com");
        let name = photo["user"]["name"].as_str().unwrap_or("Unsplash");
        Ok(Some(ImageChoice {
            url: url.to_string(),
            credit: credit_line("Unsplash", page, name),
        }))
    }
}

fn pick(list: &Value, seed: u64) -> Option<&Value> {
    let items = list.as_array().filter(|a| !a.is_empty())?;
    items.get((seed % items.len() as u64) as usize)
}

fn credit_line(provider: &str, page: &str, text: &str) -> String {
    format!(
        r#"Photo from {}: <a href="{}" target="_blank" rel="noopener">{}</a>"#,
        provider,
        encode_double_quoted_attribute(page),
        encode_text(text)
    )
}

pub fn placeholder() -> ImageChoice {
    ImageChoice {
        url: PLACEHOLDER_URL.to_string(),
        credit: "Placeholder".to_string(),
    }
}

/// The short subject stock searches do best with: text before the first colon or Arabic comma.
pub fn image_topic(query: &str) -> String {
    let topic = query
        .split(['،', ':'])
        .next()
        .unwrap_or_default()
        .trim();
    if topic.is_empty() {
        "Research".to_string()
    } else {
        topic.to_string()
    }
}

/// Keyless sources; the seed keeps them from serving the same picture every time.
pub fn free_sources(topic: &str, seed: u64) -> Vec<String> {
    let q: String = byte_serialize(topic.as_bytes()).collect();
    let sig = format!("{:08x}", seed & 0xffff_ffff);
    vec![
        format!("https://source.unsplash.com/1200x630/?{q}&sig={sig}"),
        format!("https://loremflickr.com/1200/630/{q}?lock={sig}"),
        format!("https://picsum.photos/seed/{sig}/1200/630"),
    ]
}

/// Hashes of the first image of each post body.
pub fn recent_image_hashes<'a>(bodies: impl IntoIterator<Item = &'a str>) -> HashSet<String> {
    bodies
        .into_iter()
        .filter_map(|body| FIRST_IMG.captures(body).map(|c| image_hash(&c[1])))
        .collect()
}
