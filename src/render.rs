//! HTML for posts and the store page. Everything here is a pure function of its inputs.
use std::sync::LazyLock;

use chrono::{DateTime, FixedOffset};
use html_escape::{encode_double_quoted_attribute, encode_text};
use pulldown_cmark::{CowStr, Event, Options, Parser, Tag, TagEnd, html};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use regex::Regex;
use url::Url;

use crate::config::{AppsProfile, Profile, Reference, StoreProfile};
use crate::images::PLACEHOLDER_URL;
use crate::models::{AppDetails, ImageChoice, Product};
use crate::utils::{ensure_https, linkify_urls};

const GAMING_CSS: &str = include_str!("../templates/gaming.css");
const TECH_CSS: &str = include_str!("../templates/tech.css");
const STORE_CSS: &str = include_str!("../templates/store.css");

pub const AD_BUTTON_1: &str = "[AD_BUTTON_1]";
pub const AD_BUTTON_2: &str = "[AD_BUTTON_2]";
pub const PRODUCT_BOX: &str = "[PRODUCT_BOX]";

const SOURCE_LABEL: &str = "source";
const MIN_REFERENCES: usize = 4;
const REFERENCE_HEADINGS: &[&str] = &["References", "المراجع", "Sources", "المصادر"];
const SAFE_SCHEMES: &[&str] = &["http", "https", "mailto"];

static BAD_SOURCE_CREDIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:المصدر|source)\s*[:\-–]?\s*(?:pexels|pixabay|unsplash)").unwrap()
});
static MARKDOWN_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\]]+\]\((https?://[^)]+)\)").unwrap());

fn attr(s: &str) -> String {
    encode_double_quoted_attribute(s).to_string()
}

fn text(s: &str) -> String {
    encode_text(s).to_string()
}

/// Whether a link or image target may reach the page: http, https, mailto or relative.
fn safe_url(dest: &str) -> bool {
    // browsers ignore embedded whitespace, so `java\tscript:` is still a script URL
    let cleaned: String = dest
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_control())
        .collect();
    match Url::parse(&cleaned) {
        Ok(url) => SAFE_SCHEMES.contains(&url.scheme()),
        Err(_) => !cleaned
            .split(['/', '?', '#'])
            .next()
            .unwrap_or_default()
            .contains(':'),
    }
}

/// Markdown to HTML with raw HTML dropped and every link opening in a new tab.
///
/// Links to other schemes keep their text but lose the anchor; such images are dropped whole.
pub fn markdown_to_html(md: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);

    // one flag per open link: was its anchor emitted
    let mut open_links: Vec<bool> = Vec::new();
    let mut skipped_images = 0usize;

    let events = Parser::new_ext(md, options).filter_map(move |event| {
        if skipped_images > 0 {
            match event {
                Event::Start(Tag::Image { .. }) => skipped_images += 1,
                Event::End(TagEnd::Image) => skipped_images -= 1,
                _ => {}
            }
            return None;
        }
        match event {
            Event::Html(_) | Event::InlineHtml(_) => None,
            Event::Start(Tag::Link { dest_url, title, .. }) => {
                let safe = safe_url(&dest_url);
                open_links.push(safe);
                if !safe {
                    return None;
                }
                let title_attr = if title.is_empty() {
                    String::new()
                } else {
                    format!(r#" title="{}""#, attr(&title))
                };
                Some(Event::Html(CowStr::from(format!(
                    r#"<a href="{}"{} target="_blank" rel="noopener">"#,
                    attr(&dest_url),
                    title_attr
                ))))
            }
            Event::End(TagEnd::Link) => open_links
                .pop()
                .unwrap_or(false)
                .then_some(Event::Html(CowStr::Borrowed("</a>"))),
            Event::Start(Tag::Image { ref dest_url, .. }) if !safe_url(dest_url) => {
                skipped_images = 1;
                None
            }
            other => Some(other),
        }
    });

    let mut out = String::with_capacity(md.len() * 3 / 2);
    html::push_html(&mut out, events);
    out
}

/// Make sure the article ends with at least four clickable references.
///
/// Missing ones are filled from `defaults`, after the news link when there is one.
pub fn ensure_references(article_md: &str, defaults: &[Reference], news_link: Option<&str>) -> String {
    let mut text = article_md.trim().to_string();
    if !REFERENCE_HEADINGS.iter().any(|h| text.contains(h)) {
        text.push_str("\n\n## References\n");
    }

    let have = MARKDOWN_LINK.find_iter(&text).count();
    let needed = MIN_REFERENCES.saturating_sub(have);
    if needed == 0 {
        return text;
    }

    let extra = news_link
        .map(|link| ("News source", link))
        .into_iter()
        .chain(defaults.iter().map(|r| (r.name.as_str(), r.url.as_str())));

    text.push('\n');
    for (name, url) in extra.take(needed) {
        text.push_str(&format!("- [{name}]({url})\n"));
    }
    text
}

/// The orchestrator's post: cover figure, credit line, then the article.
pub fn render_post(title: &str, image: &ImageChoice, article_md: &str) -> String {
    let cover = ensure_https(&image.url);
    let cover = if cover.starts_with("https://") {
        cover
    } else {
        PLACEHOLDER_URL.to_string()
    };

    let figure = format!(
        r#"<figure class="post-cover" style="margin:0 0 12px 0;">
  <img src="{}" alt="{}"
       width="1200" height="675" loading="lazy" decoding="async"
       style="max-width:100%;height:auto;border-radius:8px;display:block;margin:auto;" />
</figure>
<p style="font-size:0.9em;color:#555;margin:4px 0 16px 0;">{}</p>
<hr/>
"#,
        attr(&cover),
        attr(title),
        image.credit
    );

    let body = markdown_to_html(&linkify_urls(article_md, SOURCE_LABEL));
    let body = BAD_SOURCE_CREDIT.replace_all(&body, "");
    figure + &body
}

/// App review: header image (or the icon), the review, then the download box.
pub fn render_app_post(details: &AppDetails, article_md: &str, apps: &AppsProfile) -> String {
    let image = details
        .header_image
        .as_ref()
        .or(details.icon.as_ref())
        .map(|u| u.to_string())
        .unwrap_or_else(|| PLACEHOLDER_URL.to_string());

    let header = format!(
        r#"<div style="text-align:center;margin-bottom:20px;"><img src="{}" alt="{}" style="max-width:100%;border-radius:15px;box-shadow:0 4px 15px rgba(0,0,0,0.1);"></div>"#,
        attr(&image),
        attr(&details.title)
    );

    let button = format!(
        r#"
<div style="text-align:center;margin:50px 0;padding:20px;background:#f9f9f9;border-radius:10px;">
  <h3 style="margin-bottom:15px;">📥</h3>
  <a href="{}" class="app-download-btn" target="_blank" rel="nofollow noopener" style="display:inline-block;padding:15px 30px;background:#27ae60;color:white;text-decoration:none;border-radius:50px;font-weight:bold;font-size:18px;">{}</a>
</div>
"#,
        attr(&apps.download_link),
        text(&apps.download_text)
    );

    header + &markdown_to_html(article_md) + &button
}

/// Random catalog product that has everything a card needs.
pub fn pick_product<'a>(products: &'a [Product], rng: &mut StdRng) -> Option<&'a Product> {
    let displayable: Vec<&Product> = products.iter().filter(|p| p.displayable().is_some()).collect();
    displayable.choose(rng).copied()
}

fn product_box(product: &Product, store_page: &str) -> String {
    let Some((name, image, link)) = product.displayable() else {
        return String::new();
    };
    format!(
        r#"<div class="product-box">
  <h3>🛠️ <strong>{name}</strong></h3>
  <div style="margin:15px 0;"><img src="{image}" alt="{name_attr}"></div>
  <a class="product-link" href="{link}" target="_blank" rel="nofollow noopener">🛒</a>
  <br>
  <a href="{store}" style="color:#7f8fa6;font-size:14px;">👈</a>
</div>"#,
        name = text(name),
        name_attr = attr(name),
        image = attr(image),
        link = attr(link),
        store = attr(store_page),
    )
}

/// Swap a placeholder for `block`, or append the block when the model left the placeholder out.
fn place_block(html: &str, marker: &str, block: &str) -> String {
    let wrapped = format!("<p>{marker}</p>");
    if html.contains(&wrapped) {
        html.replacen(&wrapped, block, 1).replace(marker, "")
    } else if html.contains(marker) {
        html.replacen(marker, block, 1).replace(marker, "")
    } else {
        format!("{html}{block}")
    }
}

pub fn render_gaming_post(
    profile: &Profile,
    title: &str,
    article_md: &str,
    cover: &str,
    product: Option<&Product>,
    year: i32,
) -> String {
    let gaming = &profile.gaming;
    let download = format!(
        r#"
<div style="text-align:center;margin:35px 0;">
  <a href="{}" target="_blank" rel="nofollow noopener" class="gaming-btn download-btn">📥 {}</a>
</div>
"#,
        attr(&gaming.ad_link),
        text(&gaming.download_text)
    );
    let gift = format!(
        r#"
<div class="gift-box">
  <a href="{}" target="_blank" rel="nofollow noopener" class="gaming-btn gift-btn">💎 {}</a>
</div>
"#,
        attr(&gaming.ad_link),
        text(&gaming.gift_text)
    );

    let mut content = markdown_to_html(article_md);
    content = place_block(&content, AD_BUTTON_1, &download);
    content = place_block(&content, AD_BUTTON_2, &gift);

    let product_html = product
        .map(|p| product_box(p, &gaming.store_page))
        .unwrap_or_default();
    content = content
        .replace(&format!("<p>{PRODUCT_BOX}</p>"), &product_html)
        .replace(PRODUCT_BOX, &product_html);

    format!(
        r#"<style>
{css}
</style>
<div class="game-article">
  <img src="{cover}" alt="{title}" class="game-header-img">
  {content}
  <div class="game-footer">🎮 {site} © {year} | <a href="{store}">🛒</a></div>
</div>
"#,
        css = GAMING_CSS,
        cover = attr(cover),
        title = attr(title),
        content = content,
        site = text(&profile.site_name),
        year = year,
        store = attr(&gaming.store_page),
    )
}

pub fn render_tech_post(profile: &Profile, title: &str, article_md: &str, cover: &str) -> String {
    let tech = &profile.tech;
    let cta = |class: &str, label: &str| {
        format!(
            r#"
<div class="tech-cta"><a href="{}" target="_blank" rel="nofollow noopener" class="tech-btn {}">{}</a></div>
"#,
            attr(&tech.direct_link),
            class,
            text(label)
        )
    };
    let first = cta("tech-btn-first", &tech.first_button);
    let second = cta("tech-btn-second", &tech.second_button);

    let mut content = markdown_to_html(article_md);
    match content.find("<h2>") {
        Some(at) => content.insert_str(at, &first),
        None => content.insert_str(0, &first),
    }
    content.push_str(&second);

    format!(
        r#"<style>
{css}
</style>
<div class="tech-article">
  <img src="{cover}" alt="{title}" class="tech-header-img">
  {content}
  <div class="tech-footer"><p>🛡️ {site}</p></div>
</div>
"#,
        css = TECH_CSS,
        cover = attr(cover),
        title = attr(title),
        content = content,
        site = text(&profile.site_name),
    )
}

/// The whole store page. Products missing a name, image or link are left out.
pub fn render_catalog(store: &StoreProfile, products: &[Product], updated: DateTime<FixedOffset>) -> String {
    let mut html = format!(
        r#"<style>
{}
</style>
<div class="store-container">
  <div class="store-header">
    <h1>🔥 {} 🔥</h1>
    <p>{}</p>
  </div>
"#,
        STORE_CSS,
        text(&store.heading),
        text(&store.tagline)
    );

    for product in products {
        let Some((name, image, link)) = product.displayable() else {
            continue;
        };
        let description = product.description.as_deref().unwrap_or_default();
        html.push_str(&format!(
            r#"  <div class="product-card">
    <h3 class="product-title">{name}</h3>
    <img src="{image}" class="product-img" alt="{name_attr}">
    <p class="product-desc">{description}</p>
    <a href="{link}" target="_blank" rel="nofollow noopener" class="buy-btn">🛒 {buy}</a>
    <div class="ads-container">
      <a href="{right}" target="_blank" class="ad-btn ad-right">🎁 {right_text}</a>
      <a href="{left}" target="_blank" class="ad-btn ad-left">💎 {left_text}</a>
    </div>
  </div>
"#,
            name = text(name),
            image = attr(image),
            name_attr = attr(name),
            description = text(description),
            link = attr(link),
            buy = text(&store.buy_text),
            right = attr(&store.ad_link_right),
            right_text = text(&store.ad_text_right),
            left = attr(&store.ad_link_left),
            left_text = text(&store.ad_text_left),
        ));
    }

    html.push_str(&format!(
        "  <div class=\"store-updated\">{}</div>\n</div>\n",
        updated.format("%Y-%m-%d %H:%M")
    ));
    html
}
