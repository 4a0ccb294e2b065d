use std::collections::BTreeMap;
use std::env;
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;

pub const NS_MAIN: i32 = 0;
pub const NS_USER: i32 = 2;
pub const NS_DRAFT: i32 = 118;

const PAGE_BATCH_SIZE: usize = 50;

/// Metadata of one revision. Times are UTC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionMeta {
    pub revision_id: i64,
    pub user: String,
    pub timestamp: DateTime<Utc>,
}

/// Live snapshot of a page: identity plus its latest revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageInfo {
    pub page_id: i64,
    pub title: String,
    pub namespace: i32,
    pub latest: RevisionMeta,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryMember {
    pub page_id: i64,
    pub title: String,
    pub namespace: i32,
}

pub trait WikiReadApi {
    /// Highest replication lag across database replicas, in seconds.
    fn get_replication_lag(&mut self) -> Result<i64>;
    /// Pages that no longer exist are omitted from the result.
    fn get_page_info(&mut self, page_ids: &[i64]) -> Result<Vec<PageInfo>>;
    fn get_category_members(&mut self, category: &str) -> Result<Vec<CategoryMember>>;
    /// `None` when the revision exists but its content is hidden or missing.
    fn get_revision_content(&mut self, revision_id: i64) -> Result<Option<String>>;
    /// Newest first, at most `limit` entries.
    fn get_revision_history(&mut self, page_id: i64, limit: usize) -> Result<Vec<RevisionMeta>>;
    fn get_first_revision(&mut self, page_id: i64) -> Result<Option<RevisionMeta>>;
    /// Unknown users (usually IP editors) are reported as not blocked.
    fn is_user_blocked(&mut self, username: &str) -> Result<bool>;
    fn get_page_text(&mut self, title: &str) -> Result<Option<String>>;
    fn request_count(&self) -> usize;
}

pub trait WikiWriteApi: WikiReadApi {
    fn login(&mut self, username: &str, password: &str) -> Result<()>;
    fn edit_page(&mut self, title: &str, content: &str, summary: &str, minor: bool)
    -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct MediaWikiClientConfig {
    pub api_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_read_ms: u64,
    pub rate_limit_write_ms: u64,
    pub max_retries: usize,
    pub max_write_retries: usize,
    pub retry_delay_ms: u64,
}

impl MediaWikiClientConfig {
    pub fn from_config(config: &crate::config::StatisticsConfig) -> Self {
        let api_default = config.wiki.api_url.as_deref().unwrap_or("");
        Self::from_env_with_defaults(api_default, &config.user_agent())
    }

    fn from_env_with_defaults(api_url_default: &str, user_agent_default: &str) -> Self {
        Self {
            api_url: env_value("WIKI_API_URL", api_url_default),
            user_agent: env_value("WIKI_USER_AGENT", user_agent_default),
            timeout_ms: env_value_u64("WIKI_HTTP_TIMEOUT_MS", 30_000),
            rate_limit_read_ms: env_value_u64("WIKI_RATE_LIMIT_READ", 300),
            rate_limit_write_ms: env_value_u64("WIKI_RATE_LIMIT_WRITE", 1_000),
            max_retries: env_value_usize("WIKI_HTTP_RETRIES", 2),
            max_write_retries: env_value_usize("WIKI_HTTP_WRITE_RETRIES", 1),
            retry_delay_ms: env_value_u64("WIKI_HTTP_RETRY_DELAY_MS", 500),
        }
    }
}

pub struct MediaWikiClient {
    client: Client,
    config: MediaWikiClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
    csrf_token: Option<String>,
}

impl MediaWikiClient {
    pub fn new(config: MediaWikiClientConfig) -> Result<Self> {
        if config.api_url.trim().is_empty() {
            bail!("wiki API URL is not configured (set WIKI_API_URL or [wiki].api_url)");
        }
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .cookie_store(true)
            .build()
            .context("failed to build MediaWiki HTTP client")?;

        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
            csrf_token: None,
        })
    }

    fn request_json_get(&mut self, params: &[(&str, String)]) -> Result<Value> {
        let base_url = Url::parse(&self.config.api_url)
            .with_context(|| format!("invalid WIKI_API_URL: {}", self.config.api_url))?;
        let pairs = request_pairs(params);

        for attempt in 0..=self.config.max_retries {
            self.apply_rate_limit(false);
            let response = self
                .client
                .get(base_url.clone())
                .header("User-Agent", self.config.user_agent.clone())
                .query(&pairs)
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < self.config.max_retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt, false);
                            continue;
                        }
                        bail!("MediaWiki API request failed with HTTP {status}");
                    }
                    let payload: Value = response
                        .json()
                        .context("failed to decode MediaWiki API JSON response")?;
                    check_api_error(&payload)?;
                    return Ok(payload);
                }
                Err(error) => {
                    if attempt < self.config.max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt, false);
                        continue;
                    }
                    return Err(error).context("failed to call MediaWiki API");
                }
            }
        }

        bail!("MediaWiki API request exhausted retry budget")
    }

    fn request_json_post(&mut self, params: &[(&str, String)], is_write: bool) -> Result<Value> {
        let max_retries = if is_write {
            self.config.max_write_retries
        } else {
            self.config.max_retries
        };
        let pairs = request_pairs(params);

        for attempt in 0..=max_retries {
            self.apply_rate_limit(is_write);
            let response = self
                .client
                .post(&self.config.api_url)
                .header("User-Agent", self.config.user_agent.clone())
                .form(&pairs)
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < max_retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt, is_write);
                            continue;
                        }
                        bail!("MediaWiki API request failed with HTTP {status}");
                    }
                    let payload: Value = response
                        .json()
                        .context("failed to decode MediaWiki API JSON response")?;
                    check_api_error(&payload)?;
                    return Ok(payload);
                }
                Err(error) => {
                    if attempt < max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt, is_write);
                        continue;
                    }
                    return Err(error).context("failed to call MediaWiki API");
                }
            }
        }

        bail!("MediaWiki API request exhausted retry budget")
    }

    fn apply_rate_limit(&mut self, is_write: bool) {
        let delay = if is_write {
            Duration::from_millis(self.config.rate_limit_write_ms)
        } else {
            Duration::from_millis(self.config.rate_limit_read_ms)
        };
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn wait_before_retry(&self, attempt: usize, is_write: bool) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        let multiplier = if is_write { 2u64 } else { 1u64 };
        sleep(Duration::from_millis(
            base.saturating_mul(multiplier).saturating_add(jitter),
        ));
    }

    fn ensure_csrf_token(&mut self) -> Result<String> {
        if let Some(token) = &self.csrf_token {
            return Ok(token.clone());
        }
        let response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("meta", "tokens".to_string()),
        ])?;
        let parsed: TokenQueryResponse =
            serde_json::from_value(response).context("failed to decode csrf token response")?;
        let token = parsed
            .query
            .tokens
            .and_then(|tokens| tokens.csrftoken)
            .ok_or_else(|| anyhow::anyhow!("failed to get MediaWiki csrf token"))?;
        self.csrf_token = Some(token.clone());
        Ok(token)
    }

    fn query_revisions(&mut self, params: Vec<(&str, String)>) -> Result<Vec<RevisionMeta>> {
        let response = self.request_json_get(&params)?;
        let parsed: QueryResponse = serde_json::from_value(response)
            .context("failed to decode revisions API response")?;
        let mut output = Vec::new();
        for page in parsed.query.pages {
            if page.missing.unwrap_or(false) {
                continue;
            }
            for revision in &page.revisions {
                output.push(revision_meta(revision)?);
            }
        }
        Ok(output)
    }
}

impl WikiReadApi for MediaWikiClient {
    fn get_replication_lag(&mut self) -> Result<i64> {
        let response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("meta", "siteinfo".to_string()),
            ("siprop", "dbrepllag".to_string()),
            ("sishowalldb", "1".to_string()),
        ])?;
        let parsed: QueryResponse =
            serde_json::from_value(response).context("failed to decode siteinfo response")?;
        let lag = parsed
            .query
            .dbrepllag
            .iter()
            .map(|entry| entry.lag.ceil() as i64)
            .max()
            .unwrap_or(0);
        Ok(lag)
    }

    fn get_page_info(&mut self, page_ids: &[i64]) -> Result<Vec<PageInfo>> {
        let mut output = Vec::new();
        for batch in page_ids.chunks(PAGE_BATCH_SIZE) {
            let ids = batch
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("|");
            let response = self.request_json_get(&[
                ("action", "query".to_string()),
                ("pageids", ids),
                ("prop", "info|revisions".to_string()),
                ("rvprop", "ids|user|timestamp".to_string()),
            ])?;
            let parsed: QueryResponse = serde_json::from_value(response)
                .context("failed to decode page info response")?;
            for page in parsed.query.pages {
                if page.missing.unwrap_or(false) || page.invalid.unwrap_or(false) {
                    continue;
                }
                let (Some(page_id), Some(revision)) = (page.pageid, page.revisions.first()) else {
                    continue;
                };
                output.push(PageInfo {
                    page_id,
                    title: page.title.clone(),
                    namespace: page.ns,
                    latest: revision_meta(revision)?,
                });
            }
        }
        Ok(output)
    }

    fn get_category_members(&mut self, category: &str) -> Result<Vec<CategoryMember>> {
        let mut members = Vec::new();
        let mut continue_token: Option<String> = None;
        let category_title = if category.starts_with("Category:") {
            category.to_string()
        } else {
            format!("Category:{category}")
        };

        loop {
            let mut params = vec![
                ("action", "query".to_string()),
                ("list", "categorymembers".to_string()),
                ("cmtitle", category_title.clone()),
                ("cmprop", "ids|title".to_string()),
                ("cmlimit", "500".to_string()),
            ];
            if let Some(token) = &continue_token {
                params.push(("cmcontinue", token.clone()));
            }

            let response = self.request_json_get(&params)?;
            let parsed: QueryResponse = serde_json::from_value(response)
                .context("failed to decode categorymembers API response")?;
            for item in parsed.query.categorymembers {
                members.push(CategoryMember {
                    page_id: item.pageid,
                    title: item.title,
                    namespace: item.ns,
                });
            }

            continue_token = parsed.continuation.and_then(|cont| cont.cmcontinue);
            if continue_token.is_none() {
                break;
            }
        }

        Ok(members)
    }

    fn get_revision_content(&mut self, revision_id: i64) -> Result<Option<String>> {
        let response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("revids", revision_id.to_string()),
            ("prop", "revisions".to_string()),
            ("rvprop", "content".to_string()),
            ("rvslots", "main".to_string()),
        ])?;
        let parsed: QueryResponse = serde_json::from_value(response)
            .context("failed to decode revision content response")?;
        let content = parsed
            .query
            .pages
            .into_iter()
            .flat_map(|page| page.revisions)
            .find_map(|revision| revision.slots.and_then(|slots| slots.main))
            .and_then(|slot| slot.content);
        Ok(content)
    }

    fn get_revision_history(&mut self, page_id: i64, limit: usize) -> Result<Vec<RevisionMeta>> {
        self.query_revisions(vec![
            ("action", "query".to_string()),
            ("pageids", page_id.to_string()),
            ("prop", "revisions".to_string()),
            ("rvprop", "ids|user|timestamp".to_string()),
            ("rvdir", "older".to_string()),
            ("rvlimit", limit.max(1).to_string()),
        ])
    }

    fn get_first_revision(&mut self, page_id: i64) -> Result<Option<RevisionMeta>> {
        let revisions = self.query_revisions(vec![
            ("action", "query".to_string()),
            ("pageids", page_id.to_string()),
            ("prop", "revisions".to_string()),
            ("rvprop", "ids|user|timestamp".to_string()),
            ("rvdir", "newer".to_string()),
            ("rvlimit", "1".to_string()),
        ])?;
        Ok(revisions.into_iter().next())
    }

    fn is_user_blocked(&mut self, username: &str) -> Result<bool> {
        let response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("list", "users".to_string()),
            ("ususers", username.to_string()),
            ("usprop", "blockinfo".to_string()),
        ])?;
        let parsed: QueryResponse =
            serde_json::from_value(response).context("failed to decode users response")?;
        Ok(parsed
            .query
            .users
            .iter()
            .any(|user| !user.missing.unwrap_or(false) && user.blockid.is_some()))
    }

    fn get_page_text(&mut self, title: &str) -> Result<Option<String>> {
        let response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("titles", title.to_string()),
            ("prop", "revisions".to_string()),
            ("rvprop", "content".to_string()),
            ("rvslots", "main".to_string()),
        ])?;
        let parsed: QueryResponse = serde_json::from_value(response)
            .context("failed to decode page content response")?;
        let content = parsed
            .query
            .pages
            .into_iter()
            .filter(|page| !page.missing.unwrap_or(false))
            .flat_map(|page| page.revisions)
            .find_map(|revision| revision.slots.and_then(|slots| slots.main))
            .and_then(|slot| slot.content);
        Ok(content)
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

impl WikiWriteApi for MediaWikiClient {
    fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let token_response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("meta", "tokens".to_string()),
            ("type", "login".to_string()),
        ])?;
        let token_payload: TokenQueryResponse = serde_json::from_value(token_response)
            .context("failed to decode login token response")?;
        let login_token = token_payload
            .query
            .tokens
            .and_then(|tokens| tokens.logintoken)
            .ok_or_else(|| anyhow::anyhow!("failed to get MediaWiki login token"))?;

        let login_response = self.request_json_post(
            &[
                ("action", "login".to_string()),
                ("lgname", username.to_string()),
                ("lgpassword", password.to_string()),
                ("lgtoken", login_token),
            ],
            true,
        )?;
        let login_payload: LoginResponse =
            serde_json::from_value(login_response).context("failed to decode login response")?;
        match login_payload.login.result.as_deref() {
            Some("Success") => {
                self.csrf_token = None;
                Ok(())
            }
            other => bail!(
                "MediaWiki login failed: {}",
                login_payload
                    .login
                    .reason
                    .or_else(|| other.map(ToString::to_string))
                    .unwrap_or_else(|| "unknown error".to_string())
            ),
        }
    }

    fn edit_page(
        &mut self,
        title: &str,
        content: &str,
        summary: &str,
        minor: bool,
    ) -> Result<()> {
        let token = self.ensure_csrf_token()?;
        let mut params = vec![
            ("action", "edit".to_string()),
            ("title", title.to_string()),
            ("text", content.to_string()),
            ("summary", summary.to_string()),
            ("bot", "1".to_string()),
            ("nocreate", "1".to_string()),
            ("token", token),
        ];
        if minor {
            params.push(("minor", "1".to_string()));
        }
        let response = self.request_json_post(&params, true)?;
        let edit_payload: EditResponse =
            serde_json::from_value(response).context("failed to decode edit response")?;
        let edit = edit_payload
            .edit
            .ok_or_else(|| anyhow::anyhow!("missing edit payload in API response"))?;
        if edit.result.as_deref() != Some("Success") {
            bail!(
                "MediaWiki edit failed for {}: {}",
                title,
                edit.result.unwrap_or_else(|| "unknown".to_string())
            );
        }
        Ok(())
    }
}

/// Parse a MediaWiki API timestamp (`2024-01-31T12:00:00Z`).
pub fn parse_api_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .with_context(|| format!("invalid MediaWiki timestamp: {value}"))
}

fn revision_meta(revision: &RevisionQueryItem) -> Result<RevisionMeta> {
    let timestamp = revision
        .timestamp
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("revision {} has no timestamp", revision.revid))?;
    Ok(RevisionMeta {
        revision_id: revision.revid,
        user: revision.user.clone().unwrap_or_default(),
        timestamp: parse_api_timestamp(timestamp)?,
    })
}

fn request_pairs(params: &[(&str, String)]) -> Vec<(String, String)> {
    let mut pairs = Vec::with_capacity(params.len() + 2);
    pairs.push(("format".to_string(), "json".to_string()));
    pairs.push(("formatversion".to_string(), "2".to_string()));
    for (key, value) in params {
        if !value.is_empty() {
            pairs.push(((*key).to_string(), value.clone()));
        }
    }
    pairs
}

fn check_api_error(payload: &Value) -> Result<()> {
    if let Some(error) = payload.get("error") {
        let code = error
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error");
        let info = error
            .get("info")
            .and_then(Value::as_str)
            .unwrap_or("unknown info");
        bail!("MediaWiki API error [{code}]: {info}");
    }
    Ok(())
}

fn env_value(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_value_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_value_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

#[derive(Debug, Deserialize, Default)]
struct QueryResponse {
    #[serde(default)]
    query: QueryPayload,
    #[serde(default, rename = "continue")]
    continuation: Option<ContinuationPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct QueryPayload {
    #[serde(default)]
    categorymembers: Vec<CategoryMemberItem>,
    #[serde(default)]
    pages: Vec<PageQueryItem>,
    #[serde(default)]
    users: Vec<UserQueryItem>,
    #[serde(default)]
    dbrepllag: Vec<ReplicationLagItem>,
}

#[derive(Debug, Deserialize)]
struct ContinuationPayload {
    cmcontinue: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CategoryMemberItem {
    pageid: i64,
    ns: i32,
    title: String,
}

#[derive(Debug, Deserialize)]
struct PageQueryItem {
    pageid: Option<i64>,
    #[serde(default)]
    ns: i32,
    #[serde(default)]
    title: String,
    missing: Option<bool>,
    invalid: Option<bool>,
    #[serde(default)]
    revisions: Vec<RevisionQueryItem>,
}

#[derive(Debug, Deserialize)]
struct RevisionQueryItem {
    #[serde(default)]
    revid: i64,
    user: Option<String>,
    timestamp: Option<String>,
    slots: Option<RevisionSlotContainer>,
}

#[derive(Debug, Deserialize)]
struct RevisionSlotContainer {
    main: Option<RevisionMainSlot>,
}

#[derive(Debug, Deserialize)]
struct RevisionMainSlot {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserQueryItem {
    missing: Option<bool>,
    blockid: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ReplicationLagItem {
    lag: f64,
}

#[derive(Debug, Deserialize)]
struct TokenQueryResponse {
    #[serde(default)]
    query: TokenQueryPayload,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryPayload {
    tokens: Option<TokenPayload>,
}

#[derive(Debug, Deserialize)]
struct TokenPayload {
    csrftoken: Option<String>,
    logintoken: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    login: LoginPayload,
}

#[derive(Debug, Deserialize)]
struct LoginPayload {
    result: Option<String>,
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EditResponse {
    edit: Option<EditPayload>,
}

#[derive(Debug, Deserialize)]
struct EditPayload {
    result: Option<String>,
}

/// Index pages by id for joins against the mirror.
pub fn index_by_page_id(pages: Vec<PageInfo>) -> BTreeMap<i64, PageInfo> {
    pages
        .into_iter()
        .map(|page| (page.page_id, page))
        .collect()
}
