use crate::error::ToolError;
use crate::tools::http_retry::{is_reqwest_error_retryable, retry_after_secs, HttpRetryManager};
use crate::tools::registry::Tool;
use crate::tools::types::{
    PropertySchema, ToolContext, ToolDefinition, ToolInputSchema, ToolResult,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

pub const WEB_FETCH_TOOL: &str = "web_fetch";

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36";

/// Subtrees dropped before paragraph extraction
const NOISE_TAGS: [&str; 3] = ["nav", "footer", "header"];

/// Deserialize a usize from either a number or a string
fn deserialize_usize_lenient<'de, D>(deserializer: D) -> Result<Option<usize>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<Value> = Option::deserialize(deserializer)?;
    match value {
        None => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_u64().map(|v| v as usize)),
        Some(Value::String(s)) => Ok(s.parse().ok()),
        _ => Ok(None),
    }
}

#[derive(Debug, Clone)]
pub struct WebFetchConfig {
    pub timeout: Duration,
    pub max_chars: usize,
    pub user_agent: String,
    pub cache_ttl: Duration,
    /// Permit loopback and private-network hosts
    pub allow_private_hosts: bool,
}

impl Default for WebFetchConfig {
    fn default() -> Self {
        WebFetchConfig {
            timeout: Duration::from_secs(15),
            max_chars: 8000,
            user_agent: BROWSER_USER_AGENT.to_string(),
            cache_ttl: Duration::from_secs(900),
            allow_private_hosts: false,
        }
    }
}

struct CacheEntry {
    result: ToolResult,
    expires_at: Instant,
}

/// In-memory fetch cache with TTL
struct FetchCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl FetchCache {
    fn new(ttl: Duration) -> Self {
        FetchCache {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    fn get(&self, key: &str) -> Option<ToolResult> {
        let entries = self.entries.read();
        entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.result.clone())
    }

    fn set(&self, key: String, result: ToolResult) {
        let mut entries = self.entries.write();
        if entries.len() > 50 {
            let now = Instant::now();
            entries.retain(|_, v| v.expires_at > now);
        }
        entries.insert(
            key,
            CacheEntry {
                result,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }
}

/// Fetches a public web page and extracts its paragraph text
pub struct WebFetchTool {
    definition: ToolDefinition,
    config: WebFetchConfig,
    client: reqwest::Client,
    cache: FetchCache,
}

impl WebFetchTool {
    pub fn new() -> Self {
        Self::with_config(WebFetchConfig::default())
    }

    pub fn with_config(config: WebFetchConfig) -> Self {
        let mut properties = HashMap::new();
        properties.insert(
            "url".to_string(),
            PropertySchema::new("string", "The http(s) URL of the page to read"),
        );
        properties.insert(
            "max_chars".to_string(),
            PropertySchema::new(
                "integer",
                format!(
                    "Maximum number of characters to return (default: {})",
                    config.max_chars
                ),
            )
            .with_default(json!(config.max_chars)),
        );

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .unwrap_or_else(|e| {
                log::warn!("[WEB_FETCH] Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });

        WebFetchTool {
            definition: ToolDefinition {
                name: WEB_FETCH_TOOL.to_string(),
                description: "Fetch a public web page and return the readable text of its paragraphs. \
                    Navigation, headers, footers, scripts and styles are removed and long pages are truncated."
                    .to_string(),
                input_schema: ToolInputSchema {
                    schema_type: "object".to_string(),
                    properties,
                    required: vec!["url".to_string()],
                },
            },
            cache: FetchCache::new(config.cache_ttl),
            config,
            client,
        }
    }
}

impl Default for WebFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct WebFetchParams {
    url: String,
    #[serde(alias = "max_length", default, deserialize_with = "deserialize_usize_lenient")]
    max_chars: Option<usize>,
}

#[async_trait]
impl Tool for WebFetchTool {
    fn definition(&self) -> ToolDefinition {
        self.definition.clone()
    }

    async fn execute(&self, params: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let params: WebFetchParams = serde_json::from_value(params)
            .map_err(|e| ToolError::InvalidParams(e.to_string()))?;
        let max_chars = params.max_chars.unwrap_or(self.config.max_chars);

        if !params.url.starts_with("http://") && !params.url.starts_with("https://") {
            return Err(ToolError::InvalidParams(
                "URL must start with http:// or https://".to_string(),
            ));
        }
        let url = url::Url::parse(&params.url)
            .map_err(|e| ToolError::InvalidParams(format!("invalid URL: {}", e)))?;

        if !self.config.allow_private_hosts {
            validate_public_url(&url).await?;
        }

        let cache_key = format!("{}:{}", params.url, max_chars);
        if let Some(cached) = self.cache.get(&cache_key) {
            log::debug!("[WEB_FETCH] Cache hit for '{}'", params.url);
            return Ok(cached);
        }

        log::info!(
            "[WEB_FETCH] Fetching '{}' (run={}, task={}, agent={})",
            params.url,
            context.run_id,
            context.task_id,
            context.agent_id
        );

        let host = url.host_str().unwrap_or("unknown").to_string();
        let retry_manager = HttpRetryManager::global();

        let response = match self.client.get(url.clone()).send().await {
            Ok(r) => r,
            Err(e) => {
                let retry_after = is_reqwest_error_retryable(&e).then(|| retry_manager.record_error(&host));
                return Err(ToolError::Unreachable {
                    url: params.url,
                    reason: e.to_string(),
                    retry_after_secs: retry_after,
                });
            }
        };

        let status = response.status();
        if !status.is_success() {
            let retry_after = if HttpRetryManager::is_retryable_status(status.as_u16()) {
                let backoff = retry_manager.record_error(&host);
                Some(retry_after_secs(response.headers()).unwrap_or(backoff))
            } else {
                None
            };
            return Err(ToolError::Status {
                url: params.url,
                status: status.as_u16(),
                retry_after_secs: retry_after,
            });
        }
        retry_manager.record_success(&host);

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let body = response
            .text()
            .await
            .map_err(|e| ToolError::Parse(format!("failed to read response body: {}", e)))?;

        let text = if content_type.is_empty() || content_type.contains("html") {
            extract_paragraphs(&body)
        } else if content_type.starts_with("text/") {
            normalize_whitespace(&body)
        } else {
            return Err(ToolError::Parse(format!(
                "unsupported content type '{}'",
                content_type
            )));
        };

        if text.is_empty() {
            return Err(ToolError::Parse(format!(
                "no readable paragraph text found at {}",
                final_url
            )));
        }

        let original_chars = text.chars().count();
        let truncated = original_chars > max_chars;
        let content = truncate_chars(&text, max_chars).to_string();

        let result = ToolResult::success(content).with_metadata(json!({
            "url": params.url,
            "final_url": final_url,
            "content_type": content_type,
            "truncated": truncated,
            "original_chars": original_chars,
        }));

        self.cache.set(cache_key, result.clone());
        Ok(result)
    }
}

/// Reject loopback, link-local, private and internal hosts
async fn validate_public_url(url: &url::Url) -> Result<(), ToolError> {
    let host = url
        .host_str()
        .ok_or_else(|| ToolError::InvalidParams("URL has no host".to_string()))?;
    let host_lower = host.to_lowercase();

    let blocked_hosts = [
        "localhost",
        "metadata.google.internal",
        "metadata.google",
    ];
    if blocked_hosts.contains(&host_lower.as_str())
        || host_lower.ends_with(".local")
        || host_lower.ends_with(".internal")
        || host_lower.ends_with(".localhost")
        || host_lower.ends_with(".lan")
    {
        return Err(ToolError::Blocked(format!(
            "access to internal host '{}' is blocked",
            host
        )));
    }

    let port = url.port_or_known_default().unwrap_or(80);
    let lookup_host = host_lower.trim_start_matches('[').trim_end_matches(']').to_string();
    if let Ok(addrs) = tokio::net::lookup_host((lookup_host.as_str(), port)).await {
        for addr in addrs {
            if is_private_ip(addr.ip()) {
                return Err(ToolError::Blocked(format!(
                    "'{}' resolves to private address {}, access blocked",
                    host,
                    addr.ip()
                )));
            }
        }
    }

    Ok(())
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private()
                || ipv4.is_loopback()
                || ipv4.is_link_local()
                || ipv4.is_broadcast()
                || ipv4.is_documentation()
                || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => ipv6.is_loopback() || ipv6.is_unspecified(),
    }
}

/// Extract the text of every `<p>` element outside navigation chrome.
///
/// Script and style bodies are skipped entirely, as are `nav`, `header` and
/// `footer` subtrees. Tag boundaries inside a paragraph become a single
/// space, entities are decoded, whitespace is collapsed and paragraphs are
/// joined with one space.
pub fn extract_paragraphs(html: &str) -> String {
    // ASCII lowercasing keeps byte offsets aligned with `html`
    let lower = html.to_ascii_lowercase();
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_paragraph = false;
    let mut noise_depth = 0usize;
    let mut pos = 0usize;

    let flush = |current: &mut String, paragraphs: &mut Vec<String>| {
        let text = normalize_whitespace(&decode_entities(current));
        if !text.is_empty() {
            paragraphs.push(text);
        }
        current.clear();
    };

    while pos < html.len() {
        let Some(rel) = html[pos..].find('<') else {
            if in_paragraph && noise_depth == 0 {
                current.push_str(&html[pos..]);
            }
            break;
        };
        let lt = pos + rel;
        if in_paragraph && noise_depth == 0 {
            current.push_str(&html[pos..lt]);
        }

        if lower[lt..].starts_with("<!--") {
            pos = match lower[lt + 4..].find("-->") {
                Some(end) => lt + 4 + end + 3,
                None => html.len(),
            };
            continue;
        }

        let Some(gt_rel) = html[lt..].find('>') else {
            break;
        };
        let gt = lt + gt_rel;
        let tag = &lower[lt + 1..gt];
        let closing = tag.starts_with('/');
        let self_closing = tag.ends_with('/');
        let name: String = tag
            .trim_start_matches('/')
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect();
        pos = gt + 1;

        match name.as_str() {
            "script" | "style" if !closing && !self_closing => {
                let close = format!("</{}", name);
                pos = match lower[pos..].find(&close) {
                    Some(start_rel) => {
                        let start = pos + start_rel;
                        lower[start..].find('>').map(|e| start + e + 1).unwrap_or(html.len())
                    }
                    None => html.len(),
                };
            }
            n if NOISE_TAGS.contains(&n) => {
                if closing {
                    noise_depth = noise_depth.saturating_sub(1);
                } else if !self_closing {
                    noise_depth += 1;
                }
            }
            "p" => {
                if in_paragraph {
                    flush(&mut current, &mut paragraphs);
                }
                in_paragraph = !closing && !self_closing;
            }
            _ => {
                if in_paragraph {
                    current.push(' ');
                }
            }
        }
    }

    if in_paragraph {
        flush(&mut current, &mut paragraphs);
    }

    paragraphs.join(" ")
}

/// Decode the common named and numeric HTML entities
fn decode_entities(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];

        let decoded = rest.find(';').filter(|&end| end <= 10).and_then(|end| {
            let entity = &rest[1..end];
            let ch = match entity {
                "nbsp" => Some(' '),
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                _ if entity.starts_with("#x") || entity.starts_with("#X") => {
                    u32::from_str_radix(&entity[2..], 16).ok().and_then(char::from_u32)
                }
                _ if entity.starts_with('#') => {
                    entity[1..].parse::<u32>().ok().and_then(char::from_u32)
                }
                _ => None,
            };
            ch.map(|c| (c, end + 1))
        });

        match decoded {
            Some((ch, consumed)) => {
                out.push(ch);
                rest = &rest[consumed..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Char-boundary-safe prefix of at most `max_chars` characters
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
