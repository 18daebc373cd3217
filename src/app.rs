use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate};
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use reqwest::Client;

use crate::blogger::{BloggerClient, Published, dedup_title, find_store_page};
use crate::config::{Profile, Settings, TopicPolicy};
use crate::generator::{GenerateRequest, GenerationConfig, TextGenerator, trim_to_tokens};
use crate::history::{HistoryFormat, HistoryLog, Window};
use crate::images::{ImageFinder, recent_image_hashes};
use crate::models::{AppDetails, Article, Category, Product, StoreListing, Topic};
use crate::render::{
    ensure_references, pick_product, render_app_post, render_catalog, render_gaming_post, render_post,
    render_tech_post,
};
use crate::selection::{
    MAX_TRIES, OnExhausted, RecentHistory, Slot, diversification_hints, regenerate_until_unique,
    select_candidate, slot_category, topic_candidates,
};
use crate::sources::SourceClient;
use crate::utils::{
    clamp_words, clean_generated_line, extract_title, normalize_key, normalize_title, strip_code_fences,
};

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 13.5; rv:116.0) Gecko/20100101 Firefox/116.0";

const TOPICS_FILE: &str = "used_topics.jsonl";
const TITLES_FILE: &str = "posted_titles.jsonl";
const APPS_FILE: &str = "history_apps.txt";
const GAMING_FILE: &str = "history_gaming.json";
const TECH_FILE: &str = "history_tech.json";

const IMAGE_LOOKBACK: usize = 60;
const TECH_EXCLUSIONS: usize = 15;
const DESCRIPTION_TOKENS: usize = 600;
const MIN_WORDS: usize = 1000;
const MAX_WORDS: usize = 1400;

/// Everything a pipeline needs, built once per process.
pub struct AppContext {
    pub settings: Settings,
    pub profile: Profile,
    pub http: Client,
    pub generator: TextGenerator,
    pub sources: SourceClient,
    pub images: ImageFinder,
    pub dry_run: bool,
}

impl AppContext {
    pub fn new(settings: Settings, profile: Profile, dry_run: bool) -> Result<Self> {
        let http = Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .user_agent(USER_AGENT)
            .build()?;
        debug!("HTTP client created");

        let generator = TextGenerator::from_settings(&settings, http.clone())?;
        let sources = SourceClient::new(http.clone());
        let images = ImageFinder::from_settings(&settings, http.clone());

        Ok(AppContext {
            settings,
            profile,
            http,
            generator,
            sources,
            images,
            dry_run,
        })
    }

    fn history(&self, name: &str, format: HistoryFormat) -> Result<HistoryLog> {
        HistoryLog::load(self.settings.state_file(name)?, format)
    }

    /// Blog session. A dry run goes ahead without one when credentials are missing.
    async fn blog(&self) -> Result<Option<BloggerClient>> {
        match BloggerClient::from_settings(&self.settings, self.http.clone()).await {
            Ok(blog) => Ok(Some(blog)),
            Err(e) if self.dry_run => {
                warn!("Dry run without blog access: {:#}", e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Publish, or print the HTML when this is a dry run. `None` means nothing was published.
    async fn publish(
        &self,
        blog: Option<&BloggerClient>,
        title: &str,
        html: &str,
        labels: &[String],
    ) -> Result<Option<Published>> {
        if self.dry_run {
            info!("Dry run: not publishing {:?}", title);
            println!("<!-- {title} -->\n{html}");
            return Ok(None);
        }
        let blog = blog.ok_or_else(|| anyhow!("No blog session"))?;
        let published = blog
            .publish_post(
                title,
                html,
                labels,
                self.settings.publish_mode,
                self.settings.update_if_title_exists,
                self.settings.now(),
            )
            .await?;
        Ok(Some(published))
    }
}

/// Load the product catalog. A missing file is an empty catalog.
pub fn load_products(path: &Path) -> Result<Vec<Product>> {
    if !path.exists() {
        debug!("No product catalog at {}", path.display());
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid product catalog {}", path.display()))
}

pub fn article_prompt(profile: &Profile, policy: &TopicPolicy, topic: &Topic) -> String {
    let mut prompt = format!(
        "Topic: \"{}\"\n\
         - Write a clear article in {} for a general audience.\n\
         - The first line is a Markdown H1 (starting with #) that states the topic precisely.\n\
         - Length between {} and {} words.\n\
         - Structure: short introduction, organised subheadings, examples or evidence, focused conclusion.\n\
         - No code, scripts or triple backticks.\n\
         - End with a \"References\" section holding at least 4 sources as clickable Markdown links.\n\
         - Do not insert images; the cover is added separately.\n\
         - Avoid filler and repetition.\n",
        topic.text(),
        profile.language,
        MIN_WORDS,
        MAX_WORDS
    );

    if let Some(link) = topic.link() {
        prompt.push_str(&format!(
            "- The topic is a current trend or news item.\n\
             - Relate the analysis to the reader's region where it fits.\n\
             - Include the source link in the references: {link}\n"
        ));
    }
    prompt.push_str(&diversification_hints(policy));
    prompt.push_str("Return the final text only.");
    prompt
}

async fn write_article(ctx: &AppContext, category: Category, topic: Topic) -> Result<Article> {
    info!("Writing {} article on {:?}", category.as_str(), topic.text());
    let req = GenerateRequest::new(article_prompt(&ctx.profile, &ctx.settings.topic_policy, &topic)).with_config(
        GenerationConfig {
            temperature: Some(0.7),
            top_p: Some(0.9),
            max_output_tokens: Some(4096),
            ..Default::default()
        },
    );
    let text = ctx.generator.generate(&req).await?;

    let markdown = clamp_words(&strip_code_fences(&text), MIN_WORDS, MAX_WORDS);
    let markdown = ensure_references(&markdown, ctx.profile.references.get(category), topic.link());
    let title = extract_title(&markdown, topic.text());

    Ok(Article {
        title,
        markdown,
        search_query: topic.text().to_string(),
        topic_key: normalize_key(topic.text()),
    })
}

async fn recent_history(
    ctx: &AppContext,
    blog: Option<&BloggerClient>,
    topics: &HistoryLog,
    titles: &HistoryLog,
    now: DateTime<FixedOffset>,
) -> RecentHistory {
    let policy = &ctx.settings.topic_policy;
    let window = ctx.settings.title_window;

    let mut recent = RecentHistory {
        topics: topics.recent_keys(Window::Days(ctx.settings.topic_window_days), now),
        policy_topics: if policy.avoid_repeat {
            topics.recent_keys(Window::Days(policy.allow_old_topics_after_days), now)
        } else {
            HashSet::new()
        },
        titles: titles.last_keys(window).iter().map(|t| normalize_title(t)).collect(),
    };

    if let Some(blog) = blog {
        match blog.recent_titles(window).await {
            Ok(live) => recent.titles.extend(live.iter().map(|t| normalize_title(t))),
            Err(e) => warn!("Could not read recent blog titles: {:#}", e),
        }
    }
    debug!(
        "Recent history: {} topics, {} policy topics, {} titles",
        recent.topics.len(),
        recent.policy_topics.len(),
        recent.titles.len()
    );
    recent
}

async fn used_image_hashes(blog: Option<&BloggerClient>) -> HashSet<String> {
    let Some(blog) = blog else {
        return HashSet::new();
    };
    match blog.recent_bodies(IMAGE_LOOKBACK).await {
        Ok(bodies) => recent_image_hashes(bodies.iter().map(String::as_str)),
        Err(e) => {
            warn!("Could not read recent posts for image reuse: {:#}", e);
            HashSet::new()
        }
    }
}

/// Publish today's article for one slot.
pub async fn run_slot(ctx: &AppContext, slot: Slot) -> Result<()> {
    let day = ctx.settings.now().date_naive();
    let category = slot_category(slot, day);
    run_category(ctx, category, slot, day).await
}

pub async fn run_category(ctx: &AppContext, category: Category, slot: Slot, day: NaiveDate) -> Result<()> {
    let now = ctx.settings.now();
    info!("1) Slot {} on {} is {}", slot.index(), day, category.as_str());

    // 2) Blog session and history
    let blog = ctx.blog().await?;
    let mut topic_log = ctx.history(TOPICS_FILE, HistoryFormat::JsonLines { field: "topic_key" })?;
    let mut title_log = ctx.history(TITLES_FILE, HistoryFormat::JsonLines { field: "title" })?;
    let recent = recent_history(ctx, blog.as_ref(), &topic_log, &title_log, now).await;

    // 3) Candidates
    let candidates = topic_candidates(category, slot, day, &ctx.profile, &ctx.settings, &ctx.sources).await;
    info!("3) {} candidate topics", candidates.len());

    // 4) Article with a fresh topic and title
    let article = regenerate_until_unique(&candidates, &recent, MAX_TRIES, now, move |topic| {
        write_article(ctx, category, topic)
    })
    .await?;

    // 5) Cover image
    let used_hashes = used_image_hashes(blog.as_ref()).await;
    let mut rng = StdRng::from_entropy();
    let image = ctx.images.find(&article.search_query, &used_hashes, &mut rng).await;
    info!("5) Cover {}", image.url);

    // 6) Publish and remember
    let html = render_post(&article.title, &image, &article.markdown);
    let labels = ctx.profile.labels.get(category);
    if let Some(published) = ctx.publish(blog.as_ref(), &article.title, &html, labels).await? {
        topic_log.record(&article.topic_key, now)?;
        title_log.record(&published.title, now)?;
        info!(
            "6) {}: {} | {} | {}",
            if ctx.settings.publish_mode.is_draft() { "Draft" } else { "Live" },
            published.url.as_deref().unwrap_or("(no url)"),
            category.as_str(),
            published.title
        );
    }
    Ok(())
}

/// Both slots back to back. A failing slot does not stop the other one.
pub async fn run_all(ctx: &AppContext) -> Result<()> {
    let mut failed = Vec::new();
    for slot in Slot::ALL {
        if let Err(e) = run_slot(ctx, slot).await {
            error!("Slot {} failed: {:#}", slot.index(), e);
            failed.push(slot.index());
        }
    }
    if !failed.is_empty() {
        bail!("Slots {:?} failed", failed);
    }
    Ok(())
}

pub fn app_review_prompt(profile: &Profile, details: &AppDetails, description: &str) -> String {
    format!(
        "You are a tech editor. Write a review of an Android app in {}.\n\
         App name: {}\n\
         About it: {}\n\n\
         Required structure (Markdown):\n\
         1. Title: a short, catchy H1.\n\
         2. Introduction: one paragraph on what the app does.\n\
         3. Features: 5 clear bullet points.\n\
         4. How it works: a brief walkthrough.\n\
         5. Info: a table (version, size, rating).\n\
         6. Conclusion: a download recommendation.\n\n\
         Do not include external links.",
        profile.language, details.title, description
    )
}

async fn find_fresh_app(ctx: &AppContext, used: &HashSet<String>, rng: &mut StdRng) -> Option<AppDetails> {
    let apps = &ctx.profile.apps;
    let mut queries = apps.search_queries.clone();
    queries.shuffle(rng);
    info!("Checking {} search queries", queries.len());

    for query in queries {
        let listings = match ctx.sources.search_store(&query).await {
            Ok(listings) => listings,
            Err(e) => {
                warn!("Search error for {:?}: {:#}", query, e);
                continue;
            }
        };
        let eligible: Vec<StoreListing> = listings
            .into_iter()
            .filter(|l| l.rating.is_none_or(|r| r >= apps.min_rating))
            .collect();
        debug!("{:?}: {} listings above the rating floor", query, eligible.len());

        let mut skip = used.clone();
        while let Some(pick) = select_candidate(&eligible, |l| l.app_id.clone(), &skip, rng, OnExhausted::Fail) {
            skip.insert(normalize_key(&pick.app_id));
            match ctx.sources.app_details(&pick.app_id).await {
                Ok(details) if details.icon.is_some() => {
                    info!("Found suitable app: {}", details.title);
                    return Some(details);
                }
                Ok(_) => debug!("{} has no icon, skipping", pick.app_id),
                Err(e) => debug!("Details for {} unavailable: {:#}", pick.app_id, e),
            }
        }
    }
    None
}

pub async fn run_apps(ctx: &AppContext) -> Result<()> {
    let now = ctx.settings.now();
    let mut rng = StdRng::from_entropy();

    // 1) History
    let mut history = ctx.history(APPS_FILE, HistoryFormat::Lines)?;
    let used = history.recent_keys(Window::Last(usize::MAX), now);
    info!("1) {} apps already reviewed", history.entries().len());

    // 2) Pick an app
    let Some(details) = find_fresh_app(ctx, &used, &mut rng).await else {
        warn!("No fresh app found, nothing to publish");
        return Ok(());
    };

    // 3) Review
    let description = trim_to_tokens(&details.description, DESCRIPTION_TOKENS)?;
    let review = ctx
        .generator
        .generate(&GenerateRequest::new(app_review_prompt(&ctx.profile, &details, &description)))
        .await?;
    let review = strip_code_fences(&review);
    let title = extract_title(&review, &format!("Download {}", details.title));
    info!("3) Review written: {:?}", title);

    // 4) Publish
    let blog = ctx.blog().await?;
    let html = render_app_post(&details, &review, &ctx.profile.apps);
    if let Some(published) = ctx.publish(blog.as_ref(), &title, &html, &ctx.profile.apps.labels).await? {
        history.record(&details.app_id, now)?;
        info!("4) Published {}", published.url.as_deref().unwrap_or(&published.id));
    }
    Ok(())
}

pub fn gaming_title_prompt(problem: &str, history: &[String], year: i32) -> String {
    format!(
        "You are a gamer who follows the mobile games trending in the Arab world in {year} and {next}.\n\
         Propose one viral article title that combines:\n\
         1. The name of a very popular mobile game (PUBG Mobile, Free Fire, COD Warzone, Genshin Impact or a rising new one).\n\
         2. This technical problem: \"{problem}\".\n\
         Rules:\n\
         - Arabic, and very intriguing.\n\
         - Hint at a \"magic fix\" or a \"new file\".\n\
         - Do not repeat any of these earlier titles: {history:?}\n\
         Reply with the title only.",
        next = year + 1
    )
}

pub fn gaming_guide_prompt(title: &str) -> String {
    format!(
        "You are a professional gaming tech writer. Write a detailed, energetic guide titled:\n\
         \"{title}\"\n\
         Use Markdown and focus on practical steps.\n\n\
         # {title}\n\
         (A punchy introduction on how big the problem is and how this fix makes the player unbeatable)\n\n\
         ## ⚙️ Secret graphics settings\n\
         (The best in-game numbers and settings for top performance)\n\n\
         ## 🚀 System booster steps\n\
         (Using Android Developer Options to cut lag)\n\n\
         [AD_BUTTON_1]\n\n\
         ## 🔧 The technical fix and the files you need\n\
         (Activating files, DNS tweaks or sensitivity codes)\n\n\
         ## 💎 Golden tip: the tool pros use\n\
         [PRODUCT_BOX]\n\n\
         ## Conclusion\n\
         (Short and encouraging)\n\
         [AD_BUTTON_2]\n\n\
         Use gamer slang and plenty of emoji: 🎮 🔥 ⚡ 😱 💣."
    )
}

pub async fn run_gaming(ctx: &AppContext) -> Result<()> {
    let now = ctx.settings.now();
    let mut rng = StdRng::from_entropy();
    let gaming = &ctx.profile.gaming;

    // 1) Trend title
    let mut history = ctx.history(
        GAMING_FILE,
        HistoryFormat::JsonArray {
            cap: Some(gaming.history_cap),
        },
    )?;
    let problem = gaming
        .problems
        .choose(&mut rng)
        .ok_or_else(|| anyhow!("The gaming profile has no problems to write about"))?;
    let past = history.last_keys(gaming.history_cap);
    let raw = ctx
        .generator
        .generate_discovered(&GenerateRequest::new(gaming_title_prompt(problem, &past, now.year())))
        .await?;
    let title = clean_generated_line(&raw);
    if title.is_empty() {
        warn!("No trend title came back, nothing to publish");
        return Ok(());
    }
    let repeated = history.is_recent(&title, Window::Last(gaming.history_cap), now);
    info!("1) New trend: {}", title);

    // 2) Guide
    let guide = ctx
        .generator
        .generate_discovered(
            &GenerateRequest::new(gaming_guide_prompt(&title))
                .with_config(GenerationConfig {
                    temperature: Some(0.9),
                    top_k: Some(40),
                    top_p: Some(0.95),
                    ..Default::default()
                })
                .relaxed(),
        )
        .await?;
    info!("2) Guide generated ({} chars)", guide.len());

    // 3) Render
    let products = load_products(&ctx.settings.products_file)?;
    let product = pick_product(&products, &mut rng);
    let cover = format!(
        "https://picsum.photos/seed/{}/800/450?grayscale&blur=2",
        rng.gen_range(1..=1000)
    );
    let html = render_gaming_post(&ctx.profile, &title, &guide, &cover, product, now.year());

    // 4) Publish
    let blog = ctx.blog().await?;
    let mut post_title = format!("🔥 {title}");
    if repeated {
        warn!("Trend {:?} was covered recently, suffixing the title", title);
        post_title = dedup_title(&post_title, now);
    }
    if let Some(published) = ctx.publish(blog.as_ref(), &post_title, &html, &gaming.labels).await? {
        history.record(&title, now)?;
        info!("4) Published {}", published.url.as_deref().unwrap_or(&published.id));
    }
    Ok(())
}

pub fn tech_topic_prompt(niche: &str, recent: &[String]) -> String {
    format!(
        "Act as the managing editor of a global tech site.\n\
         Invent exactly one tech article title in the field: \"{niche}\".\n\
         Strict rules:\n\
         1. It must be about a very specific problem, a particular tool or a clever trick.\n\
         2. Avoid generic titles. Be specific and clickable.\n\
         3. Arabic.\n\
         4. Do not repeat these topics: {recent:?}\n\
         5. Reply with the title only."
    )
}

pub fn tech_article_prompt(topic: &str) -> String {
    format!(
        "Write a professional, comprehensive tech guide titled: \"{topic}\"\n\
         Formatting (Markdown):\n\
         1. Use headings (#, ##) to split the article.\n\
         2. Decorate paragraphs with emoji 📱💻🔧.\n\
         3. Keep the style simple and direct.\n\n\
         # {topic}\n\
         (Three lines on the problem or why it matters)\n\n\
         ## 🛠️ Tools or requirements\n\
         ## 🚀 Step by step\n\
         (Numbered, precise steps)\n\
         ## 💡 Pro tips\n\
         ## ❓ FAQ\n\
         (Three questions with answers)\n\
         ## Conclusion"
    )
}

/// Accept an invented topic only when it looks like a real title.
pub fn acceptable_topic(raw: &str) -> Option<String> {
    let topic = clean_generated_line(raw);
    let chars = topic.chars().count();
    (chars > 10 && chars < 100).then_some(topic)
}

async fn invent_tech_topic(
    ctx: &AppContext,
    history: &HistoryLog,
    now: DateTime<FixedOffset>,
    rng: &mut StdRng,
) -> Option<String> {
    let recent = history.last_keys(TECH_EXCLUSIONS);
    let mut tried = HashSet::new();
    for attempt in 1..=MAX_TRIES {
        let Some(niche) = select_candidate(&ctx.profile.tech.niches, String::clone, &tried, rng, OnExhausted::BestEffort)
        else {
            warn!("The tech profile has no niches");
            return None;
        };
        tried.insert(normalize_key(&niche));
        info!("Brainstorming attempt {} in {:?}", attempt, niche);
        match ctx
            .generator
            .generate_discovered(&GenerateRequest::new(tech_topic_prompt(&niche, &recent)))
            .await
        {
            Ok(raw) => match acceptable_topic(&raw) {
                Some(topic) if history.is_recent(&topic, Window::Last(TECH_EXCLUSIONS), now) => {
                    debug!("Rejected repeated topic {:?}", topic)
                }
                Some(topic) => return Some(topic),
                None => debug!("Rejected topic {:?}", raw.trim()),
            },
            Err(e) => warn!("Brainstorm failed: {:#}", e),
        }
    }
    None
}

pub async fn run_tech(ctx: &AppContext) -> Result<()> {
    let now = ctx.settings.now();
    let mut rng = StdRng::from_entropy();

    // 1) Topic
    let mut history = ctx.history(TECH_FILE, HistoryFormat::JsonArray { cap: None })?;
    let Some(topic) = invent_tech_topic(ctx, &history, now, &mut rng).await else {
        warn!("Failed to invent a valid topic, nothing to publish");
        return Ok(());
    };
    info!("1) Topic selected: {}", topic);

    // 2) Article
    let article = ctx
        .generator
        .generate_discovered(&GenerateRequest::new(tech_article_prompt(&topic)).relaxed())
        .await?;
    info!("2) Article generated ({} chars)", article.len());

    // 3) Publish
    let cover = format!("https://picsum.photos/seed/{}/800/400", rng.gen_range(1..=1000));
    let html = render_tech_post(&ctx.profile, &topic, &article, &cover);
    let blog = ctx.blog().await?;
    if let Some(published) = ctx.publish(blog.as_ref(), &topic, &html, &ctx.profile.tech.labels).await? {
        history.record(&topic, now)?;
        info!("3) Published {}", published.url.as_deref().unwrap_or(&published.id));
    }
    Ok(())
}

pub async fn run_store(ctx: &AppContext) -> Result<()> {
    // 1) Catalog
    let products = load_products(&ctx.settings.products_file)?;
    if products.is_empty() {
        bail!("No products in {}", ctx.settings.products_file.display());
    }
    info!("1) Loaded {} products", products.len());

    let html = render_catalog(&ctx.profile.store, &products, ctx.settings.now());
    if ctx.dry_run {
        info!("Dry run: not updating the store page");
        println!("{html}");
        return Ok(());
    }

    // 2) Page
    let blog = ctx.blog().await?.ok_or_else(|| anyhow!("No blog session"))?;
    let pages = blog.list_pages().await?;
    let page = find_store_page(&pages, &ctx.profile.store.page_keyword)
        .ok_or_else(|| anyhow!("No store page among {} pages", pages.len()))?;
    info!("2) Store page: {} ({})", page.title, page.url);

    // 3) Update
    blog.update_page(page, &html).await?;
    info!("3) Store page updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use tempfile::{TempDir, tempdir};
    use wiremock::matchers::{body_partial_json, body_string_contains, method, path, path_regex, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ARTICLE: &str = "# Fix slow Wi-Fi at home\n\nRestart the router and move it higher.\n";

    fn context(server: &MockServer, dir: &TempDir, dry_run: bool) -> AppContext {
        let mut vars: HashMap<&str, String> = HashMap::new();
        vars.insert("GEMINI_API_KEY", "k".into());
        vars.insert("GEMINI_API_ROOT", server.uri());
        vars.insert("AI_MAX_RETRIES", "1".into());
        vars.insert("STATE_DIR", dir.path().display().to_string());
        vars.insert("PRODUCTS_FILE", dir.path().join("products.json").display().to_string());
        vars.insert("FEATURED_IMAGE_URL", "https://img.example/cover.jpg".into());
        if !dry_run {
            vars.insert("BLOG_URL", "https://blog.example/".into());
            vars.insert("CLIENT_ID", "id".into());
            vars.insert("CLIENT_SECRET", "secret".into());
            vars.insert("REFRESH_TOKEN", "refresh".into());
            vars.insert("BLOGGER_API_ROOT", server.uri());
            vars.insert("OAUTH_TOKEN_URI", format!("{}/token", server.uri()));
        }
        let settings = Settings::from_lookup(|k| vars.get(k).cloned()).unwrap();
        AppContext::new(settings, Profile::builtin().unwrap(), dry_run).unwrap()
    }

    async fn mount_gemini(server: &MockServer, text: &str) {
        Mock::given(method("POST"))
            .and(path_regex(r":generateContent$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{ "content": { "parts": [{ "text": text }] } }]
            })))
            .mount(server)
            .await;
    }

    async fn mount_blog(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "access_token": "tok" })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/blogs/byurl"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "b1" })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/blogs/b1/posts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "items": [] })))
            .mount(server)
            .await;
    }

    /// Answers only the generation requests whose prompt contains `fragment`.
    fn prompt_reply(fragment: &str, text: &str) -> Mock {
        Mock::given(method("POST"))
            .and(path_regex(r":generateContent$"))
            .and(body_string_contains(fragment))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{ "content": { "parts": [{ "text": text }] } }]
            })))
    }

    async fn mount_insert(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/blogs/b1/posts/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "n1", "url": "https://blog.example/n1" })))
            .mount(server)
            .await;
    }

    async fn inserted_titles(server: &MockServer) -> Vec<String> {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|r| r.method.as_str() == "POST" && r.url.path() == "/blogs/b1/posts/")
            .filter_map(|r| r.body_json::<serde_json::Value>().ok())
            .filter_map(|v| v["title"].as_str().map(str::to_string))
            .collect()
    }

    fn read_array(path: &Path) -> Vec<String> {
        serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 10).unwrap()
    }

    const STORE_SEARCH: &str = r#"<html><body>
        <a href="/store/apps/details?id=com.used.app">
            <img src="https://play-lh.example/used.png"><span>Used App</span>
            <div aria-label="Rated 4.8 stars out of five stars"></div>
        </a>
        <a href="/store/apps/details?id=com.low.rated">
            <span>Low Rated</span>
            <div aria-label="Rated 2.1 stars out of five stars"></div>
        </a>
        <a href="/store/apps/details?id=com.no.icon">
            <span>No Icon</span>
            <div aria-label="Rated 4.5 stars out of five stars"></div>
        </a>
        <a href="/store/apps/details?id=com.good.app">
            <span>Good Scanner</span>
            <div aria-label="Rated 4.2 stars out of five stars"></div>
        </a>
    </body></html>"#;

    const GOOD_DETAILS: &str = r#"<html><head>
        <meta property="og:title" content="Good Scanner - Apps on Google Play">
        <meta property="og:description" content="Scans documents to PDF.">
        <meta property="og:image" content="https://play-lh.example/good.png">
        </head><body></body></html>"#;

    const ICONLESS_DETAILS: &str = r#"<html><head>
        <meta property="og:title" content="No Icon - Apps on Google Play">
        </head><body></body></html>"#;

    #[test]
    fn test_load_products() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("products.json");
        assert!(load_products(&file).unwrap().is_empty());

        fs::write(&file, r#"[{"name": "Cooler", "image": "https://i/1.jpg", "link": "https://l/1"}]"#).unwrap();
        assert_eq!(load_products(&file).unwrap().len(), 1);

        fs::write(&file, "{not a list").unwrap();
        assert!(load_products(&file).is_err());
    }

    #[test]
    fn test_acceptable_topic() {
        assert_eq!(
            acceptable_topic("\"**Speed up Android Studio builds**\"\nextra"),
            Some("Speed up Android Studio builds".to_string())
        );
        assert_eq!(acceptable_topic("Short"), None);
        assert_eq!(acceptable_topic(&"x".repeat(120)), None);
    }

    #[test]
    fn test_article_prompt() {
        let profile = Profile::builtin().unwrap();
        let policy = TopicPolicy::default();

        let evergreen = article_prompt(&profile, &policy, &Topic::Evergreen("Battery tips".into()));
        assert!(evergreen.contains("\"Battery tips\""));
        assert!(evergreen.contains(&profile.language));
        assert!(!evergreen.contains("source link"));

        let news = Topic::News {
            title: "Elections".into(),
            link: "https://news.example/e".into(),
        };
        assert!(article_prompt(&profile, &policy, &news).contains("https://news.example/e"));
    }

    #[tokio::test]
    async fn test_dry_run_records_nothing() {
        let server = MockServer::start().await;
        mount_gemini(&server, ARTICLE).await;
        let dir = tempdir().unwrap();
        let ctx = context(&server, &dir, true);

        run_category(&ctx, Category::Tech, Slot::First, day()).await.unwrap();

        assert!(!dir.path().join(TOPICS_FILE).exists());
        assert!(!dir.path().join(TITLES_FILE).exists());
    }

    #[tokio::test]
    async fn test_published_article_is_recorded() {
        let server = MockServer::start().await;
        mount_gemini(&server, ARTICLE).await;
        mount_blog(&server).await;
        Mock::given(method("POST"))
            .and(path("/blogs/b1/posts/"))
            .and(query_param("isDraft", "false"))
            .and(body_partial_json(json!({ "title": "Fix slow Wi-Fi at home" })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "id": "n1", "url": "https://blog.example/fix" })),
            )
            .expect(1)
            .mount(&server)
            .await;
        let dir = tempdir().unwrap();
        let ctx = context(&server, &dir, false);

        run_category(&ctx, Category::Tech, Slot::First, day()).await.unwrap();

        let titles = fs::read_to_string(dir.path().join(TITLES_FILE)).unwrap();
        assert!(titles.contains("\"title\":\"Fix slow Wi-Fi at home\""));
        let topics = fs::read_to_string(dir.path().join(TOPICS_FILE)).unwrap();
        assert_eq!(topics.lines().count(), 1);
        assert!(topics.contains("topic_key"));
    }

    #[tokio::test]
    async fn test_failed_publish_records_nothing() {
        let server = MockServer::start().await;
        mount_gemini(&server, ARTICLE).await;
        mount_blog(&server).await;
        Mock::given(method("POST"))
            .and(path("/blogs/b1/posts/"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        let dir = tempdir().unwrap();
        let ctx = context(&server, &dir, false);

        assert!(run_category(&ctx, Category::Science, Slot::Second, day()).await.is_err());
        assert!(!dir.path().join(TITLES_FILE).exists());
    }

    #[tokio::test]
    async fn test_apps_skips_used_low_rated_and_iconless() {
        let server = MockServer::start().await;
        mount_blog(&server).await;
        mount_insert(&server).await;
        prompt_reply("Write a review of an Android app", "# Good Scanner review\n\nIt scans well.")
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/store/search"))
            .respond_with(ResponseTemplate::new(200).set_body_string(STORE_SEARCH))
            .mount(&server)
            .await;
        let details = |id: &str, page: &str| {
            Mock::given(method("GET"))
                .and(path("/store/apps/details"))
                .and(query_param("id", id))
                .respond_with(ResponseTemplate::new(200).set_body_string(page.to_string()))
        };
        details("com.used.app", GOOD_DETAILS).expect(0).mount(&server).await;
        details("com.low.rated", GOOD_DETAILS).expect(0).mount(&server).await;
        // reached only when it is shuffled ahead of the good one
        details("com.no.icon", ICONLESS_DETAILS).expect(..=1).mount(&server).await;
        details("com.good.app", GOOD_DETAILS).expect(1).mount(&server).await;

        let dir = tempdir().unwrap();
        fs::write(dir.path().join(APPS_FILE), "com.used.app\n").unwrap();
        let mut ctx = context(&server, &dir, false);
        ctx.sources = SourceClient::with_roots(ctx.http.clone(), &server.uri(), &server.uri());
        ctx.profile.apps.search_queries = vec!["Scanner".into()];

        run_apps(&ctx).await.unwrap();

        assert_eq!(inserted_titles(&server).await, vec!["Good Scanner review"]);
        assert_eq!(
            fs::read_to_string(dir.path().join(APPS_FILE)).unwrap(),
            "com.used.app\ncom.good.app\n"
        );
    }

    #[tokio::test]
    async fn test_apps_without_fresh_app_publishes_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/store/search"))
            .respond_with(ResponseTemplate::new(200).set_body_string(STORE_SEARCH))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/store/apps/details"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ICONLESS_DETAILS))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/blogs/b1/posts/"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let mut ctx = context(&server, &dir, false);
        ctx.sources = SourceClient::with_roots(ctx.http.clone(), &server.uri(), &server.uri());
        ctx.profile.apps.search_queries = vec!["Scanner".into()];

        run_apps(&ctx).await.unwrap();
        assert!(!dir.path().join(APPS_FILE).exists());
    }

    #[tokio::test]
    async fn test_gaming_title_is_prefixed_and_history_capped() {
        let server = MockServer::start().await;
        mount_blog(&server).await;
        mount_insert(&server).await;
        prompt_reply("Propose one viral article title", "\"PUBG Mobile lag fix with a new file\"")
            .mount(&server)
            .await;
        prompt_reply("professional gaming tech writer", "# Guide\n\n[AD_BUTTON_1]\n\nSteps.")
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let old: Vec<String> = (0..60).map(|i| format!("old trend {i}")).collect();
        fs::write(dir.path().join(GAMING_FILE), serde_json::to_string(&old).unwrap()).unwrap();
        let ctx = context(&server, &dir, false);

        run_gaming(&ctx).await.unwrap();

        assert_eq!(inserted_titles(&server).await, vec!["🔥 PUBG Mobile lag fix with a new file"]);
        let history = read_array(&dir.path().join(GAMING_FILE));
        assert_eq!(history.len(), 60);
        assert_eq!(history[0], "old trend 1");
        assert_eq!(history[59], "PUBG Mobile lag fix with a new file");
    }

    #[tokio::test]
    async fn test_gaming_repeated_trend_gets_timestamp() {
        let server = MockServer::start().await;
        mount_blog(&server).await;
        mount_insert(&server).await;
        prompt_reply("Propose one viral article title", "PUBG Mobile lag fix with a new file")
            .mount(&server)
            .await;
        prompt_reply("professional gaming tech writer", "# Guide\n\nSteps.")
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        fs::write(dir.path().join(GAMING_FILE), r#"["pubg mobile: lag fix with a new file!"]"#).unwrap();
        let ctx = context(&server, &dir, false);

        run_gaming(&ctx).await.unwrap();

        let titles = inserted_titles(&server).await;
        assert_eq!(titles.len(), 1);
        let suffix = titles[0]
            .strip_prefix("🔥 PUBG Mobile lag fix with a new file — ")
            .unwrap_or_else(|| panic!("{}", titles[0]));
        assert_eq!(suffix.len(), "2026/03/10 12:00".len());
        assert_eq!(read_array(&dir.path().join(GAMING_FILE)).len(), 2);
    }

    #[tokio::test]
    async fn test_tech_rejects_recent_topic() {
        let server = MockServer::start().await;
        mount_blog(&server).await;
        mount_insert(&server).await;
        // first brainstorm repeats a recent topic, the second is new
        prompt_reply("Invent exactly one tech article title", "Speed up Android Studio builds")
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        prompt_reply("Invent exactly one tech article title", "Fix Bluetooth audio lag on Windows")
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        prompt_reply("comprehensive tech guide", "# Guide\n\n## Step one\n\nDo it.")
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        fs::write(dir.path().join(TECH_FILE), r#"["Speed up Android Studio builds"]"#).unwrap();
        let ctx = context(&server, &dir, false);

        run_tech(&ctx).await.unwrap();

        assert_eq!(inserted_titles(&server).await, vec!["Fix Bluetooth audio lag on Windows"]);
        assert_eq!(
            read_array(&dir.path().join(TECH_FILE)),
            vec!["Speed up Android Studio builds", "Fix Bluetooth audio lag on Windows"]
        );
    }

    #[tokio::test]
    async fn test_tech_gives_up_on_repeats() {
        let server = MockServer::start().await;
        prompt_reply("Invent exactly one tech article title", "Speed up Android Studio builds")
            .up_to_n_times(MAX_TRIES as u64)
            .expect(MAX_TRIES as u64)
            .mount(&server)
            .await;
        prompt_reply("comprehensive tech guide", "# Guide")
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/blogs/b1/posts/"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        fs::write(dir.path().join(TECH_FILE), r#"["Speed up Android Studio builds"]"#).unwrap();
        let ctx = context(&server, &dir, false);

        run_tech(&ctx).await.unwrap();
        assert_eq!(read_array(&dir.path().join(TECH_FILE)).len(), 1);
    }

    #[tokio::test]
    async fn test_store_page_is_rebuilt() {
        let server = MockServer::start().await;
        mount_blog(&server).await;
        Mock::given(method("GET"))
            .and(path("/blogs/b1/pages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "items": [
                { "id": "pg1", "title": "About", "url": "https://blog.example/p/about.html" },
                { "id": "pg2", "title": "Shop", "url": "https://blog.example/p/store.html" }
            ]})))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/blogs/b1/pages/pg2"))
            .and(body_partial_json(json!({ "title": "Shop" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "pg2" })))
            .expect(1)
            .mount(&server)
            .await;
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("products.json"),
            r#"[{"name": "Cooler", "image": "https://i/1.jpg", "link": "https://l/1"}]"#,
        )
        .unwrap();
        let ctx = context(&server, &dir, false);

        run_store(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_store_needs_products() {
        let server = MockServer::start().await;
        let dir = tempdir().unwrap();
        let ctx = context(&server, &dir, false);
        let err = run_store(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("No products"));
    }
}
