use std::thread;
use std::time::Duration;

use anyhow::{bail, Result};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use rand::Rng;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::USER_AGENT;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

pub const DEFAULT_API_BASE: &str = "https://a.4cdn.org/";
pub const DEFAULT_MEDIA_BASE: &str = "https://i.4cdn.org/";

pub type PostId = u64;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("api error: status {status}")]
    Http { status: u16 },
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("unexpected response shape: {0}")]
    Decode(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Network(_) | FetchError::Timeout => true,
            FetchError::Http { status } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            FetchError::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else if err.is_decode() {
            FetchError::Decode(err.to_string())
        } else {
            FetchError::Network(err.to_string())
        }
    }
}

/// A CORS-style front-end the browser variants routed requests through.
/// Native clients usually go direct (empty proxy list); when configured,
/// attempts rotate through the list so a dead proxy does not strand us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyEndpoint {
    /// Target URL appended verbatim (`cors-anywhere` style).
    Prefix(String),
    /// Target URL percent-encoded into a query parameter (`allorigins` style).
    Query(String),
}

impl ProxyEndpoint {
    pub fn wrap(&self, target: &str) -> String {
        match self {
            ProxyEndpoint::Prefix(base) => format!("{base}{target}"),
            ProxyEndpoint::Query(base) => format!(
                "{base}{}",
                utf8_percent_encode(target, NON_ALPHANUMERIC)
            ),
        }
    }
}

/// Retry/backoff/timeout policy shared by every API call site.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub jitter: Duration,
    pub timeout: Duration,
    pub proxies: Vec<ProxyEndpoint>,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(8),
            jitter: Duration::from_millis(250),
            timeout: Duration::from_secs(10),
            proxies: Vec::new(),
        }
    }
}

impl FetchPolicy {
    /// Delay before the next attempt once `failed` attempts have failed.
    pub fn backoff_delay(&self, failed: u32) -> Duration {
        let shift = failed.min(16);
        let exp = self
            .backoff_base
            .saturating_mul(1u32 << shift)
            .min(self.backoff_cap);
        if self.jitter.is_zero() {
            return exp;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        exp + Duration::from_millis(jitter_ms)
    }

    /// URL to use for a given attempt index, rotating through the proxy list.
    pub fn route(&self, attempt: u32, target: &str) -> String {
        if self.proxies.is_empty() {
            return target.to_string();
        }
        let index = attempt as usize % self.proxies.len();
        self.proxies[index].wrap(target)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub user_agent: String,
    pub api_base: Option<String>,
    pub media_base: Option<String>,
    pub policy: FetchPolicy,
    pub http_client: Option<HttpClient>,
}

pub struct Client {
    http: HttpClient,
    user_agent: String,
    api_base: Url,
    media_base: Url,
    policy: FetchPolicy,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.user_agent.trim().is_empty() {
            bail!("chan client user agent required");
        }
        let api_base = parse_base(config.api_base.as_deref().unwrap_or(DEFAULT_API_BASE))?;
        let media_base = parse_base(config.media_base.as_deref().unwrap_or(DEFAULT_MEDIA_BASE))?;
        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(config.policy.timeout)
                .build()?,
        };

        Ok(Client {
            http,
            user_agent: config.user_agent,
            api_base,
            media_base,
            policy: config.policy,
        })
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    pub fn boards(&self) -> Result<Vec<Board>, FetchError> {
        let list: BoardList = self.get_json("boards.json")?;
        Ok(list.boards)
    }

    pub fn catalog(&self, board: &str) -> Result<Vec<CatalogPage>, FetchError> {
        self.get_json(&format!("{board}/catalog.json"))
    }

    pub fn thread(&self, board: &str, no: PostId) -> Result<Thread, FetchError> {
        self.get_json(&format!("{board}/thread/{no}.json"))
    }

    /// Full-size image URL: `{media_base}/{board}/{tim}{ext}`.
    pub fn image_url(&self, board: &str, image: &ImageRef) -> String {
        format!("{}{}/{}{}", self.media_base, board, image.tim, image.ext)
    }

    /// Thumbnail URL: the CDN serves `{tim}s.jpg` for every format.
    pub fn thumb_url(&self, board: &str, image: &ImageRef) -> String {
        format!("{}{}/{}s.jpg", self.media_base, board, image.tim)
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, FetchError> {
        let target = self
            .api_base
            .join(path)
            .map_err(|err| FetchError::Decode(format!("bad resource path {path:?}: {err}")))?;

        let mut attempt: u32 = 0;
        loop {
            let url = self.policy.route(attempt, target.as_str());
            match self.attempt(&url) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= self.policy.max_retries || !err.is_retryable() {
                        return Err(err);
                    }
                    // Backoff runs on the calling worker thread; the UI thread
                    // never issues fetches directly.
                    thread::sleep(self.policy.backoff_delay(attempt));
                    attempt += 1;
                }
            }
        }
    }

    fn attempt<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let resp = self
            .http
            .get(url)
            .header(USER_AGENT, &self.user_agent)
            .send()?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Http {
                status: status.as_u16(),
            });
        }
        resp.json::<T>().map_err(|err| {
            if err.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Decode(err.to_string())
            }
        })
    }
}

fn parse_base(raw: &str) -> Result<Url> {
    let mut base = raw.to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    Ok(Url::parse(&base)?)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BoardList {
    #[serde(default)]
    boards: Vec<Board>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Board {
    pub board: String,
    pub title: String,
    #[serde(default)]
    pub meta_description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogPage {
    pub page: i64,
    #[serde(default)]
    pub threads: Vec<Post>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    #[serde(default)]
    pub posts: Vec<Post>,
}

/// One post record; the API uses the same shape for catalog entries (the
/// opening post, annotated with thread counters) and thread replies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Post {
    pub no: PostId,
    #[serde(default)]
    pub resto: PostId,
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub com: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub time: i64,
    #[serde(default)]
    pub replies: i64,
    #[serde(default)]
    pub images: i64,
    #[serde(default)]
    pub sticky: i64,
    #[serde(default)]
    pub closed: i64,
    #[serde(default)]
    pub last_modified: i64,
    #[serde(default)]
    pub tim: Option<i64>,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub w: i64,
    #[serde(default)]
    pub h: i64,
    #[serde(default)]
    pub fsize: i64,
}

impl Post {
    pub fn author(&self) -> &str {
        match self.name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => "Anonymous",
        }
    }

    pub fn subject(&self) -> Option<&str> {
        self.sub.as_deref().filter(|sub| !sub.trim().is_empty())
    }

    pub fn body(&self) -> &str {
        self.com.as_deref().unwrap_or_default()
    }

    pub fn image(&self) -> Option<ImageRef> {
        let tim = self.tim?;
        let ext = self.ext.clone()?;
        Some(ImageRef {
            tim,
            ext,
            filename: self.filename.clone().unwrap_or_default(),
            width: self.w,
            height: self.h,
            size_bytes: self.fsize,
        })
    }

    pub fn created_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        if self.time == 0 {
            return None;
        }
        chrono::TimeZone::timestamp_opt(&chrono::Utc, self.time, 0).single()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub tim: i64,
    pub ext: String,
    pub filename: String,
    pub width: i64,
    pub height: i64,
    pub size_bytes: i64,
}

impl ImageRef {
    pub fn display_name(&self) -> String {
        if self.filename.is_empty() {
            format!("{}{}", self.tim, self.ext)
        } else {
            format!("{}{}", self.filename, self.ext)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_without_jitter() -> FetchPolicy {
        FetchPolicy {
            jitter: Duration::ZERO,
            ..FetchPolicy::default()
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = policy_without_jitter();
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(500));
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(10), Duration::from_secs(8));
        assert_eq!(policy.backoff_delay(u32::MAX), Duration::from_secs(8));
    }

    #[test]
    fn route_rotates_through_proxies() {
        let mut policy = policy_without_jitter();
        assert_eq!(policy.route(0, "https://a.example/x"), "https://a.example/x");

        policy.proxies = vec![
            ProxyEndpoint::Prefix("https://p1.example/".into()),
            ProxyEndpoint::Query("https://p2.example/raw?url=".into()),
        ];
        assert_eq!(
            policy.route(0, "https://a.example/x"),
            "https://p1.example/https://a.example/x"
        );
        assert_eq!(
            policy.route(1, "https://a.example/x"),
            "https://p2.example/raw?url=https%3A%2F%2Fa%2Eexample%2Fx"
        );
        assert_eq!(
            policy.route(2, "https://a.example/x"),
            "https://p1.example/https://a.example/x"
        );
    }

    #[test]
    fn retryable_matrix() {
        assert!(FetchError::Network("reset".into()).is_retryable());
        assert!(FetchError::Timeout.is_retryable());
        assert!(FetchError::Http { status: 500 }.is_retryable());
        assert!(FetchError::Http { status: 429 }.is_retryable());
        assert!(!FetchError::Http { status: 404 }.is_retryable());
        assert!(!FetchError::Decode("eof".into()).is_retryable());
    }

    #[test]
    fn image_urls_follow_cdn_patterns() {
        let client = Client::new(ClientConfig {
            user_agent: "chan-tui-test/0.1".into(),
            ..ClientConfig::default()
        })
        .unwrap();
        let image = ImageRef {
            tim: 1714000000123456,
            ext: ".png".into(),
            filename: "lain".into(),
            width: 640,
            height: 480,
            size_bytes: 12345,
        };
        assert_eq!(
            client.image_url("g", &image),
            "https://i.4cdn.org/g/1714000000123456.png"
        );
        assert_eq!(
            client.thumb_url("g", &image),
            "https://i.4cdn.org/g/1714000000123456s.jpg"
        );
    }

    #[test]
    fn post_image_requires_tim_and_ext() {
        let mut post = Post {
            no: 1,
            ..Post::default()
        };
        assert!(post.image().is_none());
        post.tim = Some(99);
        assert!(post.image().is_none());
        post.ext = Some(".jpg".into());
        let image = post.image().unwrap();
        assert_eq!(image.tim, 99);
        assert_eq!(image.display_name(), "99.jpg");
    }

    #[test]
    fn decodes_catalog_payload() {
        let raw = r#"[
            {"page":1,"threads":[
                {"no":100,"sub":"Hello","com":"first","time":1714000000,
                 "replies":5,"images":1,"tim":1714000000123,"ext":".jpg",
                 "last_modified":1714000500},
                {"no":200,"com":"second","time":1714000100,"replies":50,
                 "last_modified":1714000400}
            ]}
        ]"#;
        let pages: Vec<CatalogPage> = serde_json::from_str(raw).unwrap();
        assert_eq!(pages.len(), 1);
        let threads = &pages[0].threads;
        assert_eq!(threads[0].subject(), Some("Hello"));
        assert_eq!(threads[0].author(), "Anonymous");
        assert!(threads[0].image().is_some());
        assert!(threads[1].image().is_none());
        assert_eq!(threads[1].replies, 50);
    }
}
