use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

static NON_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w\x{0600}-\x{06FF}]+").unwrap());
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)```.*?```").unwrap());
static SCRIPT_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script.*?>.*?</script>").unwrap());
static STYLE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<style.*?>.*?</style>").unwrap());
static SENTENCE_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)(.+[.!؟…])").unwrap());
static HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*#{1,6}\s*(.+?)\s*$").unwrap());
static BARE_URL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"https?://[^\s)]+").unwrap());

/// Section headings that never make a good article title.
const BOILERPLATE_HEADINGS: &[&str] = &[
    "references",
    "sources",
    "conclusion",
    "introduction",
    "المراجع",
    "المصادر",
    "الخاتمة",
    "خاتمة",
    "المقدمة",
    "مقدمة",
];

pub const MAX_TITLE_CHARS: usize = 90;

/// Canonical form used to compare topics, package ids and titles against history.
///
/// Lowercases, turns every run of non-word characters into a single space and
/// trims. Running it twice gives the same result as running it once.
pub fn normalize_key(s: &str) -> String {
    let lowered = s.to_lowercase();
    let spaced = NON_WORD.replace_all(&lowered, " ");
    WHITESPACE.replace_all(&spaced, " ").trim().to_string()
}

/// Looser title comparison used against the blog itself: only case and whitespace.
pub fn normalize_title(s: &str) -> String {
    WHITESPACE
        .replace_all(&s.trim().to_lowercase(), " ")
        .to_string()
}

fn compact_key(s: &str) -> String {
    NON_WORD.replace_all(s.trim(), "").to_lowercase()
}

pub fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Remove fenced code blocks and any `<script>`/`<style>` the model slipped in.
pub fn strip_code_fences(text: &str) -> String {
    let text = CODE_FENCE.replace_all(text, "");
    let text = SCRIPT_BLOCK.replace_all(&text, "");
    STYLE_BLOCK.replace_all(&text, "").to_string()
}

/// Cut an over-long article back to `max_words`, ending on the last full sentence.
///
/// Texts shorter than `min_words` or within `max_words` are returned untouched.
pub fn clamp_words(text: &str, min_words: usize, max_words: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() < min_words || words.len() <= max_words {
        return text.to_string();
    }
    let clipped = words[..max_words].join(" ");
    match SENTENCE_END.captures(&clipped) {
        Some(caps) => caps[1].to_string(),
        None => clipped,
    }
}

/// Turn bare URLs into `[label](url)` links, leaving existing markdown links alone.
pub fn linkify_urls(text: &str, label: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for m in BARE_URL.find_iter(text) {
        let preceded_by_paren = text[..m.start()].ends_with('(');
        out.push_str(&text[last..m.start()]);
        if preceded_by_paren {
            out.push_str(m.as_str());
        } else {
            out.push_str(&format!("[{}]({})", label, m.as_str()));
        }
        last = m.end();
    }
    out.push_str(&text[last..]);
    out
}

/// Pick a title out of generated markdown.
///
/// First real heading, else the first plain text line, else the fallback topic.
pub fn extract_title(article_md: &str, fallback_topic: &str) -> String {
    let is_boilerplate = |t: &str| {
        let key = compact_key(t);
        key.is_empty() || BOILERPLATE_HEADINGS.contains(&key.as_str())
    };

    for caps in HEADING.captures_iter(article_md) {
        let t = caps[1].trim();
        if is_boilerplate(t) || t.chars().count() < 5 {
            continue;
        }
        return truncate_chars(t, MAX_TITLE_CHARS);
    }

    for line in article_md.lines() {
        let t = line.trim();
        if t.is_empty() || t.starts_with('#') || t.starts_with("- ") || t.starts_with("* ") {
            continue;
        }
        if is_boilerplate(t) || t.chars().count() < 5 {
            continue;
        }
        return truncate_chars(t, MAX_TITLE_CHARS);
    }

    truncate_chars(fallback_topic, MAX_TITLE_CHARS)
}

/// Strip the decoration models like to put around a one-line answer.
pub fn clean_generated_line(text: &str) -> String {
    let first = text.trim().lines().next().unwrap_or_default();
    first
        .replace(['"', '*', '#', '«', '»'], "")
        .trim()
        .to_string()
}

pub fn ensure_https(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("//") {
        return format!("https://{rest}");
    }
    if let Some(rest) = url.strip_prefix("http://") {
        return format!("https://{rest}");
    }
    url.to_string()
}

fn url_for_hash(url: &str) -> String {
    let url = url.split('#').next().unwrap_or_default();
    let url = url.split('?').next().unwrap_or_default();
    ensure_https(url)
}

/// Short stable fingerprint of an image URL, ignoring query, fragment and scheme.
pub fn image_hash(url: &str) -> String {
    let digest = Sha256::digest(url_for_hash(url).as_bytes());
    hex::encode(digest)[..12].to_string()
}

/// Remove HTML tags from text content to clean up stray tags that make it through scraping
///
/// Store descriptions come back with `<br>` runs, inline formatting and the
/// occasional half-closed tag. This handles:
///
/// - Complete HTML tags (e.g., `<br>`, `<b>`, `<p>`)
/// - Malformed/incomplete HTML tags at the end of the text
/// - Shortcode-style brackets (e.g., `[caption]`)
/// - HTML entities (both named like `&nbsp;` and numeric like `&#8217;`)
/// - Excessive whitespace left behind by tag removal
pub fn clean_html_tags(text: &str) -> String {
    let incomplete_tag_regex = Regex::new(r"<[^>]*$").unwrap();
    let cleaned = incomplete_tag_regex.replace_all(text, "");

    let break_regex = Regex::new(r"(?i)<br\s*/?>").unwrap();
    let cleaned = break_regex.replace_all(&cleaned, " ");

    let html_tag_regex = Regex::new(r"</?[^>]*>").unwrap();
    let cleaned = html_tag_regex.replace_all(&cleaned, "");

    let shortcode_regex = Regex::new(r"\[/?[^\]]*\]").unwrap();
    let cleaned = shortcode_regex.replace_all(&cleaned, "");

    let cleaned = html_escape::decode_html_entities(&cleaned).to_string();
    let cleaned = cleaned.replace('\u{a0}', " ");

    WHITESPACE.replace_all(&cleaned, " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_key_equivalence() {
        assert_eq!(normalize_key("Wi-Fi  Speed!!"), "wi fi speed");
        assert_eq!(normalize_key("wi fi, SPEED"), normalize_key("Wi-Fi  Speed!!"));
        assert_eq!(normalize_key("  حل مشكلة: البطء! "), "حل مشكلة البطء");
        assert_eq!(normalize_key("com.example.app"), "com example app");
        assert_eq!(normalize_key("!!!"), "");
    }

    #[test]
    fn test_normalize_key_idempotent() {
        for s in ["Déjà Vu Explained", "OLED vs LCD vs AMOLED", "تسريع الهاتف — Android", "x"] {
            let once = normalize_key(s);
            assert_eq!(normalize_key(&once), once);
        }
    }

    #[test]
    fn test_normalize_title() {
        assert_eq!(normalize_title("  Foo   Bar "), "foo bar");
        assert_eq!(normalize_title("FOO"), normalize_title("foo"));
    }

    #[test]
    fn test_clamp_words() {
        let short = "one two three.";
        assert_eq!(clamp_words(short, 1, 10), short);

        // below the minimum nothing is touched, even if max is smaller
        assert_eq!(clamp_words(short, 5, 2), short);

        let long = "a b c. d e f g h";
        assert_eq!(clamp_words(long, 1, 5), "a b c.");

        let no_stop = "a b c d e f";
        assert_eq!(clamp_words(no_stop, 1, 3), "a b c");
    }

    #[test]
    fn test_strip_code_fences() {
        let text = "intro\n```rust\nfn main() {}\n```\n<script>alert(1)</script>end<STYLE>p{}</STYLE>";
        assert_eq!(strip_code_fences(text), "intro\n\nend");
    }

    #[test]
    fn test_linkify_urls() {
        let text = "see https://a.example/x and [doc](https://b.example/y)";
        assert_eq!(
            linkify_urls(text, "source"),
            "see [source](https://a.example/x) and [doc](https://b.example/y)"
        );
    }

    #[test]
    fn test_extract_title() {
        let md = "## References\n# Fix slow Wi-Fi today\ntext";
        assert_eq!(extract_title(md, "fallback"), "Fix slow Wi-Fi today");

        let md = "# المراجع\n\nA plain first line\n- bullet";
        assert_eq!(extract_title(md, "fallback"), "A plain first line");

        assert_eq!(extract_title("# abc\n- x", "fallback topic"), "fallback topic");

        let long = format!("# {}", "x".repeat(200));
        assert_eq!(extract_title(&long, "f").chars().count(), MAX_TITLE_CHARS);
    }

    #[test]
    fn test_clean_generated_line() {
        assert_eq!(clean_generated_line("\"**New Title**\"\nmore"), "New Title");
        assert_eq!(clean_generated_line("# «عنوان»"), "عنوان");
    }

    #[test]
    fn test_image_hash_ignores_query_and_scheme() {
        let a = image_hash("http://img.example/p.jpg?w=100#top");
        let b = image_hash("https://img.example/p.jpg");
        let c = image_hash("//img.example/p.jpg");
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(a.len(), 12);
        assert_ne!(a, image_hash("https://img.example/q.jpg"));
    }

    #[test]
    fn test_clean_html_tags() {
        let input = r#"<p>This is a paragraph</p> with <b>bold text</b>."#;
        assert_eq!(clean_html_tags(input), "This is a paragraph with bold text.");

        let breaks = "Line one<br>Line two<br/><br />Line three";
        assert_eq!(clean_html_tags(breaks), "Line one Line two Line three");

        let malformed_input = "Normal text <img src='test' and then incomplete tag <div";
        assert_eq!(clean_html_tags(malformed_input), "Normal text");

        let entity_input = "Scan&nbsp;&amp;&nbsp;Share &lt;fast&gt; &quot;PDF&quot; &#8217;ok&#8217;";
        assert_eq!(clean_html_tags(entity_input), "Scan & Share <fast> \"PDF\" \u{2019}ok\u{2019}");

        let shortcode = "[caption id='1']x[/caption] Regular text here.";
        assert_eq!(clean_html_tags(shortcode), "x Regular text here.");
    }
}
