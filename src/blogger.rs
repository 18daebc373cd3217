use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, FixedOffset};
use log::{debug, info};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::time::Duration;

use crate::config::{BlogCredentials, PublishMode, Settings};
use crate::utils::normalize_title;

const TIMEOUT: Duration = Duration::from_secs(30);
const TITLE_LOOKUP_PAGE: usize = 50;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct Blog {
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Post {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub url: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Page {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Deserialize)]
struct ItemList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub id: String,
    pub url: Option<String>,
    pub title: String,
    pub updated: bool,
}

/// Title used when a post with the same title already exists and updating is off.
pub fn dedup_title(title: &str, now: DateTime<FixedOffset>) -> String {
    format!("{} — {}", title, now.format("%Y/%m/%d %H:%M"))
}

/// The page the catalog lives on: URL mentions "store", or the title has the keyword.
pub fn find_store_page<'a>(pages: &'a [Page], keyword: &str) -> Option<&'a Page> {
    pages
        .iter()
        .find(|p| p.url.to_lowercase().contains("store") || (!keyword.is_empty() && p.title.contains(keyword)))
}

/// Authenticated Blogger v3 session for one blog.
pub struct BloggerClient {
    http: Client,
    api_root: String,
    access_token: String,
    blog_id: String,
}

impl BloggerClient {
    pub async fn from_settings(settings: &Settings, http: Client) -> Result<Self> {
        let creds = settings.blog_credentials()?;
        BloggerClient::connect(http, &creds, &settings.blogger_api_root, &settings.token_uri).await
    }

    /// Trade the refresh token for an access token and resolve the blog id.
    pub async fn connect(http: Client, creds: &BlogCredentials, api_root: &str, token_uri: &str) -> Result<Self> {
        let token: TokenResponse = http
            .post(token_uri)
            .form(&[
                ("client_id", creds.client_id.as_str()),
                ("client_secret", creds.client_secret.as_str()),
                ("refresh_token", creds.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .timeout(TIMEOUT)
            .send()
            .await
            .context("Token refresh request failed")?
            .error_for_status()
            .context("Token refresh was rejected")?
            .json()
            .await
            .context("Failed to parse token response")?;
        debug!("Obtained Blogger access token");

        let api_root = api_root.trim_end_matches('/').to_string();
        let blog: Blog = http
            .get(format!("{api_root}/blogs/byurl"))
            .query(&[("url", creds.blog_url.as_str())])
            .bearer_auth(&token.access_token)
            .timeout(TIMEOUT)
            .send()
            .await
            .context("Blog lookup failed")?
            .error_for_status()
            .with_context(|| format!("No blog found at {}", creds.blog_url))?
            .json()
            .await
            .context("Failed to parse blog lookup")?;
        info!("Connected to blog {}", blog.id);

        Ok(BloggerClient {
            http,
            api_root,
            access_token: token.access_token,
            blog_id: blog.id,
        })
    }

    fn blog_url(&self, rest: &str) -> String {
        format!("{}/blogs/{}/{}", self.api_root, self.blog_id, rest)
    }

    async fn list_posts(&self, status: &str, max: usize, bodies: bool, order_by: &str) -> Result<Vec<Post>> {
        let max = max.to_string();
        let mut query = vec![
            ("status", status),
            ("maxResults", max.as_str()),
            ("fetchBodies", if bodies { "true" } else { "false" }),
            ("orderBy", order_by),
        ];
        if status != "live" {
            query.push(("view", "ADMIN"));
        }

        let list: ItemList<Post> = self
            .http
            .get(self.blog_url("posts"))
            .query(&query)
            .bearer_auth(&self.access_token)
            .timeout(TIMEOUT)
            .send()
            .await
            .with_context(|| format!("Listing {status} posts failed"))?
            .error_for_status()
            .with_context(|| format!("Listing {status} posts was refused"))?
            .json()
            .await
            .context("Failed to parse post list")?;
        Ok(list.items)
    }

    /// Titles of the latest live posts, newest first.
    pub async fn recent_titles(&self, limit: usize) -> Result<Vec<String>> {
        let posts = self.list_posts("live", limit, false, "PUBLISHED").await?;
        Ok(posts.into_iter().map(|p| p.title).collect())
    }

    /// Bodies of the latest live posts, for spotting reused images.
    pub async fn recent_bodies(&self, limit: usize) -> Result<Vec<String>> {
        let posts = self.list_posts("live", limit, true, "PUBLISHED").await?;
        Ok(posts.into_iter().filter_map(|p| p.content).collect())
    }

    /// Id of a live or draft post whose title matches, ignoring case and spacing.
    pub async fn find_post_by_title(&self, title: &str) -> Option<String> {
        let wanted = normalize_title(title);
        for status in ["live", "draft"] {
            match self.list_posts(status, TITLE_LOOKUP_PAGE, false, "UPDATED").await {
                Ok(posts) => {
                    if let Some(post) = posts.into_iter().find(|p| normalize_title(&p.title) == wanted) {
                        return Some(post.id);
                    }
                }
                Err(e) => debug!("Title lookup in {} posts failed: {:#}", status, e),
            }
        }
        None
    }

    /// Publish, or update the post that already carries this title when `update_existing` is set.
    /// Without it, a clash gets a timestamp suffix so titles stay distinct.
    pub async fn publish_post(
        &self,
        title: &str,
        html: &str,
        labels: &[String],
        mode: PublishMode,
        update_existing: bool,
        now: DateTime<FixedOffset>,
    ) -> Result<Published> {
        let mut body = json!({
            "kind": "blogger#post",
            "title": title,
            "content": html,
        });
        if !labels.is_empty() {
            body["labels"] = json!(labels);
        }

        let existing = self.find_post_by_title(title).await;

        if let (Some(post_id), true) = (&existing, update_existing) {
            let post: Post = self
                .http
                .put(self.blog_url(&format!("posts/{post_id}")))
                .bearer_auth(&self.access_token)
                .json(&body)
                .timeout(TIMEOUT)
                .send()
                .await
                .context("Post update failed")?
                .error_for_status()
                .context("Post update was refused")?
                .json()
                .await
                .context("Failed to parse updated post")?;
            info!("UPDATED: {}", post.url.as_deref().unwrap_or(&post.id));
            return Ok(Published {
                id: post.id,
                url: post.url,
                title: title.to_string(),
                updated: true,
            });
        }

        let final_title = match existing {
            Some(_) => dedup_title(title, now),
            None => title.to_string(),
        };
        body["title"] = json!(final_title);

        let post: Post = self
            .http
            .post(self.blog_url("posts/"))
            .query(&[("isDraft", if mode.is_draft() { "true" } else { "false" })])
            .bearer_auth(&self.access_token)
            .json(&body)
            .timeout(TIMEOUT)
            .send()
            .await
            .context("Post insert failed")?
            .error_for_status()
            .context("Post insert was refused")?
            .json()
            .await
            .context("Failed to parse created post")?;
        info!("CREATED: {}", post.url.as_deref().unwrap_or(&post.id));

        Ok(Published {
            id: post.id,
            url: post.url,
            title: final_title,
            updated: false,
        })
    }

    pub async fn list_pages(&self) -> Result<Vec<Page>> {
        let list: ItemList<Page> = self
            .http
            .get(self.blog_url("pages"))
            .query(&[("fetchBodies", "false")])
            .bearer_auth(&self.access_token)
            .timeout(TIMEOUT)
            .send()
            .await
            .context("Listing pages failed")?
            .error_for_status()
            .context("Listing pages was refused")?
            .json()
            .await
            .context("Failed to parse page list")?;
        Ok(list.items)
    }

    /// Replace a page's content, keeping its title.
    pub async fn update_page(&self, page: &Page, html: &str) -> Result<()> {
        let status = self
            .http
            .put(self.blog_url(&format!("pages/{}", page.id)))
            .bearer_auth(&self.access_token)
            .json(&json!({ "title": page.title, "content": html }))
            .timeout(TIMEOUT)
            .send()
            .await
            .context("Page update failed")?
            .status();
        if !status.is_success() {
            return Err(anyhow!("Page update for {} returned {}", page.id, status));
        }
        info!("Updated page {} ({})", page.title, page.id);
        Ok(())
    }
}
