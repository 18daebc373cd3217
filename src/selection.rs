//! Which category runs today, which topic it gets, and how repeats are avoided.
use std::collections::HashSet;
use std::future::Future;

use anyhow::{Result, bail};
use chrono::{DateTime, FixedOffset, NaiveDate};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

use crate::blogger::dedup_title;
use crate::config::{Profile, Settings, TopicPolicy};
use crate::models::{Article, Category, Topic, TrendItem};
use crate::sources::SourceClient;
use crate::utils::{normalize_key, normalize_title};

pub const MAX_TRIES: usize = 3;
const TRENDS_PER_GEO: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    First,
    Second,
}

impl Slot {
    pub const ALL: [Slot; 2] = [Slot::First, Slot::Second];

    pub fn from_index(i: i64) -> Option<Slot> {
        match i {
            0 => Some(Slot::First),
            1 => Some(Slot::Second),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Slot::First => 0,
            Slot::Second => 1,
        }
    }
}

/// Position in the three-day rotation, counted from 2025-01-01.
pub fn cycle_index(day: NaiveDate) -> i64 {
    let Some(anchor) = NaiveDate::from_ymd_opt(2025, 1, 1) else {
        return 0;
    };
    (day - anchor).num_days().rem_euclid(3)
}

pub fn slot_category(slot: Slot, day: NaiveDate) -> Category {
    match (cycle_index(day), slot) {
        (0, Slot::First) => Category::Tech,
        (0, Slot::Second) => Category::Science,
        (1, Slot::First) => Category::Social,
        (1, Slot::Second) => Category::Tech,
        (_, Slot::First) => Category::News,
        (_, Slot::Second) => Category::Social,
    }
}

/// Same day, category and slot always give the same sequence.
pub fn daily_rng(day: NaiveDate, category: Category, slot: Slot) -> StdRng {
    let seed_text = format!("{}-{}-{}", day.format("%Y-%m-%d"), category.as_str(), slot.index());
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&Sha256::digest(seed_text.as_bytes()));
    StdRng::from_seed(seed)
}

/// What [`select_candidate`] does when every item was used recently.
/// Callers that need a used item to look distinct suffix it with [`dedup_title`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnExhausted {
    /// Take a used item anyway.
    BestEffort,
    /// Take nothing.
    Fail,
}

/// Shuffle `pool` and return the first item whose normalized key is not in `used`.
pub fn select_candidate<T, K>(
    pool: &[T],
    key: K,
    used: &HashSet<String>,
    rng: &mut StdRng,
    on_exhausted: OnExhausted,
) -> Option<T>
where
    T: Clone,
    K: Fn(&T) -> String,
{
    if pool.is_empty() {
        return None;
    }

    let mut order: Vec<usize> = (0..pool.len()).collect();
    order.shuffle(rng);

    if let Some(&i) = order.iter().find(|&&i| !used.contains(&normalize_key(&key(&pool[i])))) {
        return Some(pool[i].clone());
    }

    debug!("All {} candidates used recently ({:?})", pool.len(), on_exhausted);
    match on_exhausted {
        OnExhausted::Fail => None,
        OnExhausted::BestEffort => Some(pool[rng.gen_range(0..pool.len())].clone()),
    }
}

/// Extra lines for the topic prompt when the policy asks for variety.
pub fn diversification_hints(policy: &TopicPolicy) -> String {
    let mut hints = String::new();
    if policy.diversification {
        hints.push_str("- Pick an angle that has not been covered recently; explore an unusual perspective.\n");
    }
    if policy.prefer_new_domains {
        hints.push_str("- Prefer emerging or fast-moving fields over traditional subjects.\n");
    }
    hints
}

/// Trends starting at this slot's position, wrapping around.
fn rotate_for_slot(trends: Vec<TrendItem>, slot: Slot) -> Vec<TrendItem> {
    let mut trends = trends;
    if trends.len() > slot.index() {
        trends.rotate_left(slot.index());
    }
    trends
}

/// Topics to try for a category, best first.
pub async fn topic_candidates(
    category: Category,
    slot: Slot,
    day: NaiveDate,
    profile: &Profile,
    settings: &Settings,
    sources: &SourceClient,
) -> Vec<Topic> {
    let pool: Vec<String> = match category {
        Category::Tech => profile
            .topics
            .tech
            .iter()
            .chain(&profile.topics.ai)
            .cloned()
            .collect(),
        Category::Science => profile.topics.science.clone(),
        Category::Social => profile.topics.social.clone(),
        Category::News => return news_candidates(slot, profile, settings, sources).await,
    };

    let mut rng = daily_rng(day, category, slot);
    let mut pool = pool;
    pool.shuffle(&mut rng);
    pool.into_iter().map(Topic::Evergreen).collect()
}

async fn news_candidates(slot: Slot, profile: &Profile, settings: &Settings, sources: &SourceClient) -> Vec<Topic> {
    let trends = if settings.trend_geo_list.is_empty() {
        sources
            .trends(&settings.trend_geo, TRENDS_PER_GEO)
            .await
            .unwrap_or_else(|e| {
                warn!("Trends for {} unavailable: {:#}", settings.trend_geo, e);
                Vec::new()
            })
    } else {
        sources.trends_region(&settings.trend_geo_list, TRENDS_PER_GEO).await
    };

    let mut candidates: Vec<Topic> = rotate_for_slot(trends, slot)
        .into_iter()
        .map(|t| Topic::News {
            title: t.title,
            link: t.link,
        })
        .collect();

    match sources.news_headline(&profile.news.feed_url, slot.index()).await {
        Ok(Some(headline)) => candidates.push(Topic::News {
            title: headline.title,
            link: headline.link,
        }),
        Ok(None) => debug!("News feed is empty"),
        Err(e) => warn!("News feed unavailable: {:#}", e),
    }

    candidates.push(Topic::News {
        title: profile.news.fallback_title.clone(),
        link: profile.news.fallback_link.clone(),
    });
    candidates
}

/// Recent history an article must not repeat.
#[derive(Debug, Default)]
pub struct RecentHistory {
    /// Normalized topic keys within the topic window.
    pub topics: HashSet<String>,
    /// Normalized topic keys the policy still considers too fresh to reuse.
    pub policy_topics: HashSet<String>,
    /// Titles (case and spacing normalized) from the blog and the local log.
    pub titles: HashSet<String>,
}

impl RecentHistory {
    pub fn topic_is_fresh(&self, key: &str) -> bool {
        !self.topics.contains(key) && !self.policy_topics.contains(key)
    }

    pub fn title_is_fresh(&self, title: &str) -> bool {
        !self.titles.contains(&normalize_title(title))
    }
}

/// Write articles for fresh topics until one also has a fresh title.
///
/// At most `max_tries` articles are written. When every try clashes, the last
/// article comes back with a timestamp suffix on its title. When every topic is
/// recent, the first one is written anyway and suffixed.
pub async fn regenerate_until_unique<F, Fut>(
    candidates: &[Topic],
    recent: &RecentHistory,
    max_tries: usize,
    now: DateTime<FixedOffset>,
    mut write: F,
) -> Result<Article>
where
    F: FnMut(Topic) -> Fut,
    Fut: Future<Output = Result<Article>>,
{
    let Some(first) = candidates.first() else {
        bail!("No topics to write about");
    };

    let mut tried = HashSet::new();
    let mut last: Option<Article> = None;
    let mut tries = 0;

    for topic in candidates {
        if tries >= max_tries {
            break;
        }
        let key = normalize_key(topic.text());
        if key.is_empty() || !tried.insert(key.clone()) {
            continue;
        }
        if !recent.topic_is_fresh(&key) {
            debug!("Skipping recent topic {:?}", topic.text());
            continue;
        }

        tries += 1;
        let article = write(topic.clone()).await?;
        if recent.title_is_fresh(&article.title) {
            info!("Accepted {:?} after {} try(s)", article.title, tries);
            return Ok(article);
        }
        debug!("Title {:?} was used recently", article.title);
        last = Some(article);
    }

    let mut article = match last {
        Some(article) => article,
        None => {
            warn!("Every topic was used recently, reusing {:?}", first.text());
            write(first.clone()).await?
        }
    };
    article.title = dedup_title(&article.title, now);
    info!("No unique title found, publishing as {:?}", article.title);
    Ok(article)
}
