use serde::Deserialize;
use url::Url;

/// Editorial category of an orchestrated article.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Tech,
    Science,
    Social,
    News,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Tech => "tech",
            Category::Science => "science",
            Category::Social => "social",
            Category::News => "news",
        }
    }
}

/// What an article is about. News topics carry the link they were found at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    Evergreen(String),
    News { title: String, link: String },
}

impl Topic {
    pub fn text(&self) -> &str {
        match self {
            Topic::Evergreen(t) => t,
            Topic::News { title, .. } => title,
        }
    }

    pub fn link(&self) -> Option<&str> {
        match self {
            Topic::Evergreen(_) => None,
            Topic::News { link, .. } => Some(link),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrendItem {
    pub title: String,
    pub link: String,
}

/// One card of a store search results page.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreListing {
    pub app_id: String,
    pub title: String,
    pub rating: Option<f32>,
    pub icon: Option<Url>,
}

#[derive(Debug, Clone)]
pub struct AppDetails {
    pub app_id: String,
    pub title: String,
    pub description: String,
    pub icon: Option<Url>,
    pub header_image: Option<Url>,
    pub rating: Option<f32>,
}

/// Affiliate product from the local catalog file.
///
/// Both catalog spellings in use are accepted; every field may be absent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Product {
    #[serde(default, alias = "name_ar")]
    pub name: Option<String>,
    #[serde(default, alias = "image_url")]
    pub image: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "affiliate_link")]
    pub link: Option<String>,
}

impl Product {
    /// The fields a card cannot be drawn without.
    pub fn displayable(&self) -> Option<(&str, &str, &str)> {
        let name = self.name.as_deref().filter(|s| !s.trim().is_empty())?;
        let image = self.image.as_deref().filter(|s| !s.trim().is_empty())?;
        let link = self.link.as_deref().filter(|s| !s.trim().is_empty())?;
        Some((name, image, link))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageChoice {
    pub url: String,
    /// Already-safe HTML shown under the cover.
    pub credit: String,
}

/// A finished article ready to be rendered.
#[derive(Debug, Clone)]
pub struct Article {
    pub title: String,
    pub markdown: String,
    pub search_query: String,
    pub topic_key: String,
}
