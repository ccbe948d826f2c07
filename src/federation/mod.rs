/// Relay integration.
///
/// The only upstream call the core makes is `com.atproto.sync.requestCrawl`,
/// fired when a firehose subscriber drops so relays reconnect promptly. The
/// call is throttled to once a minute across all triggers.
use std::sync::Mutex;
use std::time::{Duration, Instant};

const CRAWL_THROTTLE: Duration = Duration::from_secs(60);

pub struct RelayClient {
    http: reqwest::Client,
    hostname: String,
    relays: Vec<String>,
    last_crawl: Mutex<Option<Instant>>,
}

impl RelayClient {
    pub fn new(http: reqwest::Client, hostname: String, relays: Vec<String>) -> Self {
        Self {
            http,
            hostname,
            relays,
            last_crawl: Mutex::new(None),
        }
    }

    pub fn has_relays(&self) -> bool {
        !self.relays.is_empty()
    }

    /// Ask every configured relay to crawl us. Returns false when the call
    /// was throttled away.
    pub async fn request_crawl(&self) -> bool {
        {
            let mut last = self.last_crawl.lock().expect("crawl throttle poisoned");
            if let Some(at) = *last {
                if at.elapsed() < CRAWL_THROTTLE {
                    return false;
                }
            }
            *last = Some(Instant::now());
        }

        for relay in &self.relays {
            let url = format!("{}/xrpc/com.atproto.sync.requestCrawl", relay);
            let result = self
                .http
                .post(&url)
                .json(&serde_json::json!({ "hostname": self.hostname }))
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!(relay = %relay, "requested crawl");
                }
                Ok(resp) => {
                    tracing::warn!(relay = %relay, status = %resp.status(), "requestCrawl rejected");
                }
                Err(e) => {
                    tracing::warn!(relay = %relay, "requestCrawl failed: {}", e);
                }
            }
        }

        true
    }
}
