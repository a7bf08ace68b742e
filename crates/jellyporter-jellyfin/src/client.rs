use async_trait::async_trait;
use metrics::{counter, histogram};
use reqwest::Method;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

use jellyporter_models::{Item, ItemsPage, User, UserDataUpdate};

use crate::error::ApiError;
use crate::query::ItemQueryOpts;
use crate::retry::RetryPolicy;
use crate::traits::MediaServer;

const METRIC_REQUESTS_TOTAL: &str = "jellyporter_requests_total";
const METRIC_REQUEST_ERRORS: &str = "jellyporter_requests_errors_total";
const METRIC_REQUEST_TIME: &str = "jellyporter_requests_time_total";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(15);

/// HTTP driver for a single Jellyfin server. The API key travels as a query
/// parameter on every request; the configured user's id is resolved lazily
/// and cached for the lifetime of the client.
pub struct JellyfinClient {
    base_url: String,
    api_key: String,
    user_name: String,
    http: reqwest::Client,
    retry: RetryPolicy,
    user_id: Mutex<Option<String>>,
}

impl JellyfinClient {
    pub fn new(base_url: &str, api_key: String, user_name: String) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .build()
            .map_err(|source| ApiError::Transport {
                path: String::new(),
                source,
            })?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            user_name,
            http,
            retry: RetryPolicy::default(),
            user_id: Mutex::new(None),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn get_users(&self) -> Result<Vec<User>, ApiError> {
        let data = self.request(Method::GET, "/Users", &[], None).await?;
        serde_json::from_slice(&data).map_err(|source| ApiError::Decode {
            path: "/Users".to_string(),
            source,
        })
    }

    /// One request with retries; returns the response body of the first
    /// 2xx answer.
    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
    ) -> Result<Vec<u8>, ApiError> {
        counter!(METRIC_REQUESTS_TOTAL).increment(1);
        let start = Instant::now();

        let mut url = Url::parse(&format!("{}{}", self.base_url, path)).map_err(|_| {
            record_request_error("invalid_url", "unknown");
            ApiError::InvalidUrl(format!("{}{}", self.base_url, path))
        })?;
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
            pairs.append_pair("api_key", &self.api_key);
        }

        let mut attempt: u32 = 0;
        loop {
            if attempt > 0 {
                tokio::time::sleep(self.retry.backoff(attempt)).await;
            }

            let mut request = self.http.request(method.clone(), url.clone());
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(source) => {
                    if attempt < self.retry.max_retries {
                        attempt += 1;
                        continue;
                    }
                    record_request_error("send_request_failed", path);
                    return Err(ApiError::Transport {
                        path: path.to_string(),
                        source,
                    });
                }
            };

            let status = response.status();
            histogram!(METRIC_REQUEST_TIME,
                "path" => path.to_string(),
                "code" => status.as_u16().to_string())
            .record(start.elapsed().as_secs_f64());

            if status.is_success() {
                return response
                    .bytes()
                    .await
                    .map(|bytes| bytes.to_vec())
                    .map_err(|source| {
                        record_request_error("read_data", path);
                        ApiError::Read {
                            path: path.to_string(),
                            source,
                        }
                    });
            }

            if self.retry.should_retry_status(status.as_u16()) && attempt < self.retry.max_retries {
                attempt += 1;
                continue;
            }

            record_request_error("invalid_status", path);
            return Err(ApiError::Status {
                path: path.to_string(),
                status: status.as_u16(),
            });
        }
    }
}

#[async_trait]
impl MediaServer for JellyfinClient {
    async fn user_id(&self) -> Result<String, ApiError> {
        let mut cached = self.user_id.lock().await;
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }

        let users = self.get_users().await?;
        let user = users
            .into_iter()
            .find(|user| user.name == self.user_name)
            .ok_or_else(|| ApiError::UserNotFound(self.user_name.clone()))?;

        *cached = Some(user.id.clone());
        Ok(user.id)
    }

    async fn items(&self, user_id: &str, opts: &ItemQueryOpts) -> Result<ItemsPage, ApiError> {
        opts.validate()?;

        let path = format!("/Users/{}/Items", user_id);
        let mut collected: Vec<Item> = Vec::new();
        let mut start_index = opts.start_index;

        loop {
            let mut query: Vec<(&str, String)> = vec![
                ("IncludeItemTypes", opts.item_type.as_str().to_string()),
                ("Recursive", "true".to_string()),
                ("Fields", "ProviderIds".to_string()),
                ("Limit", opts.limit.to_string()),
                ("StartIndex", start_index.to_string()),
                ("EnableTotalRecordCount", "true".to_string()),
            ];
            if let Some(sort_by) = opts.sort_by {
                query.push(("SortBy", sort_by.as_str().to_string()));
            }
            if let Some(sort_order) = opts.sort_order {
                query.push(("SortOrder", sort_order.as_str().to_string()));
            }

            let data = self.request(Method::GET, &path, &query, None).await?;
            let page: ItemsPage = serde_json::from_slice(&data).map_err(|source| {
                ApiError::Decode {
                    path: path.clone(),
                    source,
                }
            })?;

            // On a delta walk the pages arrive newest-first; once the page's
            // last item falls behind the watermark, everything further is
            // known and the walk stops.
            let mut crossed_watermark = false;
            match opts.since {
                Some(since) => {
                    let last_played = page
                        .items
                        .last()
                        .and_then(|item| item.user_data.last_played_date);
                    if matches!(last_played, Some(ts) if ts < since)
                        || (!page.items.is_empty() && last_played.is_none())
                    {
                        crossed_watermark = true;
                        collected.extend(page.items.iter().cloned().filter(|item| {
                            item.user_data
                                .last_played_date
                                .map(|ts| ts > since)
                                .unwrap_or(false)
                        }));
                    } else {
                        collected.extend(page.items.iter().cloned());
                    }
                }
                None => collected.extend(page.items.iter().cloned()),
            }

            let returned = page.items.len();
            debug!(
                path = %path,
                start_index,
                returned,
                total = page.total_record_count,
                "Fetched items page"
            );

            if returned < opts.limit as usize
                || start_index as usize + returned >= page.total_record_count
                || crossed_watermark
            {
                break;
            }

            start_index += opts.limit;
        }

        Ok(ItemsPage {
            total_record_count: collected.len(),
            start_index: 0,
            items: collected,
        })
    }

    async fn update_user_data(
        &self,
        user_id: &str,
        item_id: &str,
        update: &UserDataUpdate,
    ) -> Result<(), ApiError> {
        let path = format!("/Users/{}/Items/{}/UserData", user_id, item_id);
        let body = serde_json::to_value(update).map_err(|source| ApiError::Decode {
            path: path.clone(),
            source,
        })?;

        self.request(Method::POST, &path, &[], Some(&body)).await?;
        Ok(())
    }
}

fn record_request_error(class: &'static str, path: &str) {
    counter!(METRIC_REQUEST_ERRORS, "error" => class, "path" => path.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use jellyporter_models::ItemType;

    #[test]
    fn base_url_trailing_slash_is_normalized() {
        let client =
            JellyfinClient::new("http://localhost:8096/", "key".into(), "alice".into()).unwrap();
        assert_eq!(client.base_url, "http://localhost:8096");
    }

    #[tokio::test]
    async fn invalid_opts_are_rejected_before_any_request() {
        let client =
            JellyfinClient::new("http://localhost:8096", "key".into(), "alice".into()).unwrap();
        let opts = ItemQueryOpts::full(ItemType::Movie, 10);

        let err = client.items("user", &opts).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidQueryOpts(_)));
    }
}
