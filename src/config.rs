use std::{
    env,
    fmt::Display,
    fs::{self, File},
    io::Write,
    ops::RangeInclusive,
    path::PathBuf,
    str::FromStr,
};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, FixedOffset, Utc};
use regex::Regex;
use serde::Deserialize;
use serde_yaml::Deserializer;

use crate::models::Category;

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const DEFAULT_PROFILE: &str = include_str!("../profile.yaml");

/// Day windows are capped well inside the range chrono can subtract.
const WINDOW_DAYS: RangeInclusive<i64> = 0..=36_500;
const OFFSET_HOURS: RangeInclusive<i32> = -23..=23;

pub const DEFAULT_GEMINI_ROOT: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_BLOGGER_ROOT: &str = "https://www.googleapis.com/blogger/v3";
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    Draft,
    Live,
}

impl PublishMode {
    pub fn is_draft(&self) -> bool {
        matches!(self, PublishMode::Draft)
    }
}

/// Optional steering from `TOPIC_POLICY`, e.g. `avoid_repeat:true,after_days:30`.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicPolicy {
    pub avoid_repeat: bool,
    pub diversification: bool,
    pub allow_old_topics_after_days: i64,
    pub prefer_new_domains: bool,
}

impl Default for TopicPolicy {
    fn default() -> Self {
        TopicPolicy {
            avoid_repeat: false,
            diversification: false,
            allow_old_topics_after_days: 90,
            prefer_new_domains: false,
        }
    }
}

impl TopicPolicy {
    pub fn parse(raw: &str) -> Result<Self> {
        let after_days = match Regex::new(r"after_days:(\d+)")?.captures(raw) {
            Some(c) => check_range(
                "TOPIC_POLICY after_days",
                &c[1],
                c[1].parse::<i64>().ok(),
                &WINDOW_DAYS,
            )?,
            None => 90,
        };
        Ok(TopicPolicy {
            avoid_repeat: raw.contains("avoid_repeat:true"),
            diversification: raw.contains("diversification:high"),
            allow_old_topics_after_days: after_days,
            prefer_new_domains: raw.contains("prefer_new_domains:true"),
        })
    }
}

#[derive(Debug, Clone)]
pub struct BlogCredentials {
    pub blog_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

/// Runtime settings, read from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub gemini_api_key: Option<String>,
    pub gemini_api_root: String,
    pub openai_api_key: Option<String>,
    pub openai_model: String,

    pub blog_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub refresh_token: Option<String>,
    pub blogger_api_root: String,
    pub token_uri: String,

    pub pexels_api_key: Option<String>,
    pub pixabay_api_key: Option<String>,
    pub unsplash_access_key: Option<String>,
    pub forced_image: Option<String>,

    pub trend_geo: String,
    pub trend_geo_list: Vec<String>,

    pub topic_window_days: i64,
    pub title_window: usize,
    pub topic_policy: TopicPolicy,

    pub publish_mode: PublishMode,
    pub update_if_title_exists: bool,

    pub ai_max_retries: usize,
    pub ai_backoff_base: u32,

    pub trigger_token: Option<String>,
    pub port: u16,

    pub utc_offset: FixedOffset,
    pub state_dir: Option<PathBuf>,
    pub products_file: PathBuf,
    pub profile_path: Option<PathBuf>,
}

impl Settings {
    pub fn from_env() -> Result<Settings> {
        Settings::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Settings>
    where
        F: Fn(&str) -> Option<String>,
    {
        let opt = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let or = |key: &str, default: &str| opt(key).unwrap_or_else(|| default.to_string());
        let flag = |key: &str| matches!(opt(key).as_deref(), Some("1") | Some("true"));

        let offset_hours = parse_ranged(&opt, "UTC_OFFSET_HOURS", 3, &OFFSET_HOURS)?;
        let utc_offset = offset_hours
            .checked_mul(3600)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| anyhow!("UTC_OFFSET_HOURS out of range: {offset_hours}"))?;

        let publish_mode = if or("PUBLISH_MODE", "live").to_lowercase() == "live" {
            PublishMode::Live
        } else {
            PublishMode::Draft
        };

        Ok(Settings {
            gemini_api_key: opt("GEMINI_API_KEY"),
            gemini_api_root: or("GEMINI_API_ROOT", DEFAULT_GEMINI_ROOT),
            openai_api_key: opt("OPENAI_API_KEY"),
            openai_model: or("OPENAI_MODEL", "gpt-4o-mini"),

            blog_url: opt("BLOG_URL"),
            client_id: opt("CLIENT_ID"),
            client_secret: opt("CLIENT_SECRET"),
            refresh_token: opt("REFRESH_TOKEN"),
            blogger_api_root: or("BLOGGER_API_ROOT", DEFAULT_BLOGGER_ROOT),
            token_uri: or("OAUTH_TOKEN_URI", DEFAULT_TOKEN_URI),

            pexels_api_key: opt("PEXELS_API_KEY"),
            pixabay_api_key: opt("PIXABAY_API_KEY"),
            unsplash_access_key: opt("UNSPLASH_ACCESS_KEY"),
            forced_image: opt("FEATURED_IMAGE_URL"),

            trend_geo: or("TREND_GEO", "IQ"),
            trend_geo_list: opt("TREND_GEO_LIST")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|g| !g.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),

            topic_window_days: parse_ranged(&opt, "TOPIC_WINDOW_DAYS", 14, &WINDOW_DAYS)?,
            title_window: parse_var(&opt, "TITLE_WINDOW", 40)?,
            topic_policy: TopicPolicy::parse(&opt("TOPIC_POLICY").unwrap_or_default())?,

            publish_mode,
            update_if_title_exists: flag("UPDATE_IF_TITLE_EXISTS"),

            ai_max_retries: parse_var(&opt, "AI_MAX_RETRIES", 3)?,
            ai_backoff_base: parse_var(&opt, "AI_BACKOFF_BASE", 4)?,

            trigger_token: opt("TRIGGER_TOKEN"),
            port: parse_var(&opt, "PORT", 8000)?,

            utc_offset,
            state_dir: opt("STATE_DIR").map(PathBuf::from),
            products_file: PathBuf::from(or("PRODUCTS_FILE", "products.json")),
            profile_path: opt("CONTENT_PROFILE").map(PathBuf::from),
        })
    }

    pub fn gemini_key(&self) -> Result<&str> {
        self.gemini_api_key
            .as_deref()
            .ok_or_else(|| anyhow!("GEMINI_API_KEY is not set"))
    }

    pub fn blog_credentials(&self) -> Result<BlogCredentials> {
        let need = |value: &Option<String>, name: &str| {
            value
                .clone()
                .ok_or_else(|| anyhow!("{name} is not set but publishing needs it"))
        };
        Ok(BlogCredentials {
            blog_url: need(&self.blog_url, "BLOG_URL")?,
            client_id: need(&self.client_id, "CLIENT_ID")?,
            client_secret: need(&self.client_secret, "CLIENT_SECRET")?,
            refresh_token: need(&self.refresh_token, "REFRESH_TOKEN")?,
        })
    }

    pub fn now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.utc_offset)
    }

    /// Where a history file lives: `STATE_DIR` if set, else the XDG data dir.
    pub fn state_file(&self, name: &str) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(dir.join(name)),
            None => xdg::BaseDirectories::with_prefix(PKG_NAME)
                .place_data_file(name)
                .with_context(|| format!("Could not create data directory for {name}")),
        }
    }
}

fn parse_var<T, O>(opt: &O, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
    O: Fn(&str) -> Option<String>,
{
    match opt(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|e| anyhow!("Invalid value for {key} ({raw:?}): {e}")),
    }
}

/// Like [`parse_var`], but the value must also fall inside `range`.
fn parse_ranged<T, O>(opt: &O, key: &str, default: T, range: &RangeInclusive<T>) -> Result<T>
where
    T: FromStr + PartialOrd + Display,
    O: Fn(&str) -> Option<String>,
{
    match opt(key) {
        None => Ok(default),
        Some(raw) => check_range(key, &raw, raw.parse().ok(), range),
    }
}

fn check_range<T>(key: &str, raw: &str, value: Option<T>, range: &RangeInclusive<T>) -> Result<T>
where
    T: PartialOrd + Display,
{
    match value {
        Some(v) if range.contains(&v) => Ok(v),
        _ => bail!(
            "Invalid value for {key} ({raw:?}): expected a whole number from {} to {}",
            range.start(),
            range.end()
        ),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Reference {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopicPools {
    pub tech: Vec<String>,
    pub science: Vec<String>,
    pub social: Vec<String>,
    #[serde(default)]
    pub ai: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PerCategory<T> {
    pub tech: T,
    pub science: T,
    pub social: T,
    pub news: T,
}

impl<T> PerCategory<T> {
    pub fn get(&self, category: Category) -> &T {
        match category {
            Category::Tech => &self.tech,
            Category::Science => &self.science,
            Category::Social => &self.social,
            Category::News => &self.news,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewsProfile {
    pub feed_url: String,
    pub fallback_title: String,
    pub fallback_link: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppsProfile {
    pub search_queries: Vec<String>,
    pub labels: Vec<String>,
    pub download_link: String,
    pub download_text: String,
    pub min_rating: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GamingProfile {
    pub problems: Vec<String>,
    pub labels: Vec<String>,
    pub ad_link: String,
    pub store_page: String,
    pub download_text: String,
    pub gift_text: String,
    pub history_cap: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TechProfile {
    pub niches: Vec<String>,
    pub labels: Vec<String>,
    pub direct_link: String,
    pub first_button: String,
    pub second_button: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreProfile {
    pub page_keyword: String,
    pub heading: String,
    pub tagline: String,
    pub buy_text: String,
    pub ad_link_right: String,
    pub ad_link_left: String,
    pub ad_text_right: String,
    pub ad_text_left: String,
}

/// Editorial data: topic pools, labels, links and copy.
#[derive(Debug, Clone, Deserialize)]
pub struct Profile {
    pub language: String,
    pub site_name: String,
    pub post_times: Vec<String>,
    pub topics: TopicPools,
    pub labels: PerCategory<Vec<String>>,
    pub references: PerCategory<Vec<Reference>>,
    pub news: NewsProfile,
    pub apps: AppsProfile,
    pub gaming: GamingProfile,
    pub tech: TechProfile,
    pub store: StoreProfile,
}

pub struct EnsureOutcome {
    pub path: PathBuf,
    pub created: bool,
}

impl Profile {
    pub fn builtin() -> Result<Profile> {
        Profile::parse(DEFAULT_PROFILE, "<built-in profile>")
    }

    pub fn parse(raw: &str, origin: &str) -> Result<Profile> {
        let deserialized = Deserializer::from_str(raw);
        serde_path_to_error::deserialize(deserialized).map_err(|e| {
            anyhow!(
                "Invalid YAML in {} at `{}`: {}",
                origin,
                e.path(),
                e.inner()
            )
        })
    }

    /// `CONTENT_PROFILE` if set, else the user's XDG profile, else the built-in one.
    pub fn load(settings: &Settings) -> Result<Profile> {
        let path = match &settings.profile_path {
            Some(p) => Some(p.clone()),
            None => xdg::BaseDirectories::with_prefix(PKG_NAME).find_config_file("profile.yaml"),
        };

        match path {
            Some(path) => {
                let raw = fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                Profile::parse(&raw, &path.display().to_string())
            }
            None => Profile::builtin(),
        }
    }

    /// Write the built-in profile to the XDG config dir unless one is already there.
    pub fn ensure_user_profile() -> Result<EnsureOutcome> {
        let xdg_dirs = xdg::BaseDirectories::with_prefix(PKG_NAME);

        if let Some(path) = xdg_dirs.find_config_file("profile.yaml") {
            return Ok(EnsureOutcome {
                path,
                created: false,
            });
        }

        let path = xdg_dirs
            .place_config_file("profile.yaml")
            .context("Cannot create configuration directory")?;
        let mut file = File::create(&path)?;
        file.write_all(DEFAULT_PROFILE.as_bytes())?;

        Ok(EnsureOutcome {
            path,
            created: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings_from(pairs: &[(&str, &str)]) -> Result<Settings> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let s = settings_from(&[]).unwrap();
        assert_eq!(s.publish_mode, PublishMode::Live);
        assert_eq!(s.topic_window_days, 14);
        assert_eq!(s.title_window, 40);
        assert_eq!(s.ai_max_retries, 3);
        assert_eq!(s.ai_backoff_base, 4);
        assert_eq!(s.port, 8000);
        assert_eq!(s.trend_geo, "IQ");
        assert!(s.trend_geo_list.is_empty());
        assert!(!s.update_if_title_exists);
        assert_eq!(s.utc_offset.local_minus_utc(), 3 * 3600);
        assert!(s.gemini_key().is_err());
        assert!(s.blog_credentials().is_err());
    }

    #[test]
    fn test_overrides() {
        let s = settings_from(&[
            ("PUBLISH_MODE", "draft"),
            ("UPDATE_IF_TITLE_EXISTS", "1"),
            ("TREND_GEO_LIST", "IQ, SA,,EG "),
            ("TOPIC_WINDOW_DAYS", "7"),
            ("GEMINI_API_KEY", " key "),
            ("BLOG_URL", "https://blog.example"),
            ("CLIENT_ID", "id"),
            ("CLIENT_SECRET", "secret"),
            ("REFRESH_TOKEN", "refresh"),
            ("FEATURED_IMAGE_URL", ""),
        ])
        .unwrap();
        assert!(s.publish_mode.is_draft());
        assert!(s.update_if_title_exists);
        assert_eq!(s.trend_geo_list, vec!["IQ", "SA", "EG"]);
        assert_eq!(s.topic_window_days, 7);
        assert_eq!(s.gemini_key().unwrap(), "key");
        assert_eq!(s.blog_credentials().unwrap().blog_url, "https://blog.example");
        assert!(s.forced_image.is_none());
    }

    #[test]
    fn test_bad_number_names_variable() {
        let err = settings_from(&[("TITLE_WINDOW", "lots")]).unwrap_err();
        assert!(err.to_string().contains("TITLE_WINDOW"));
    }

    #[test]
    fn test_out_of_range_numbers_name_variable() {
        for (key, value) in [
            ("TOPIC_WINDOW_DAYS", "100000000"),
            ("TOPIC_WINDOW_DAYS", "999999999999"),
            ("TOPIC_WINDOW_DAYS", "-1"),
            ("UTC_OFFSET_HOURS", "1000000"),
            ("UTC_OFFSET_HOURS", "24"),
        ] {
            let err = settings_from(&[(key, value)]).unwrap_err().to_string();
            assert!(err.contains(key), "{key}={value}: {err}");
        }

        let err = settings_from(&[("TOPIC_POLICY", "after_days:100000000")]).unwrap_err();
        assert!(err.to_string().contains("TOPIC_POLICY"));

        let s = settings_from(&[("TOPIC_WINDOW_DAYS", "36500"), ("UTC_OFFSET_HOURS", "-5")]).unwrap();
        assert_eq!(s.topic_window_days, 36_500);
        assert_eq!(s.utc_offset.local_minus_utc(), -5 * 3600);
    }

    #[test]
    fn test_topic_policy_parse() {
        let p = TopicPolicy::parse("avoid_repeat:true, diversification:high, after_days:30").unwrap();
        assert!(p.avoid_repeat);
        assert!(p.diversification);
        assert!(!p.prefer_new_domains);
        assert_eq!(p.allow_old_topics_after_days, 30);
        assert_eq!(TopicPolicy::parse("").unwrap(), TopicPolicy::default());
        assert!(TopicPolicy::parse("after_days:99999999999999999999").is_err());
    }

    #[test]
    fn test_builtin_profile_parses() {
        let profile = Profile::builtin().unwrap();
        assert_eq!(profile.post_times.len(), 2);
        assert!(!profile.topics.tech.is_empty());
        assert_eq!(profile.references.get(Category::News).len(), 4);
        assert_eq!(profile.gaming.history_cap, 60);
    }

    #[test]
    fn test_profile_error_names_path() {
        let raw = DEFAULT_PROFILE.replace("min_rating: 3.0", "min_rating: high");
        let err = Profile::parse(&raw, "test.yaml").unwrap_err().to_string();
        assert!(err.contains("apps.min_rating"), "{err}");
    }
}
