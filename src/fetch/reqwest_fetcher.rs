//! Reqwest-backed HTTP tier.
//!
//! Keeps one `reqwest::Client` per proxy endpoint so cookies stick to the
//! identity that earned them, and converts between the shared `http` types
//! and reqwest's own.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use http::{HeaderMap as HttpHeaderMap, HeaderName as HttpHeaderName, HeaderValue as HttpHeaderValue};
use reqwest::{Client, header::HeaderMap};
use tokio::sync::Mutex;

use super::{FetchError, FetchRequest, FetchResponse, FetchTier, Fetcher};

/// Plain HTTP fetcher.
pub struct ReqwestFetcher {
    clients: Mutex<HashMap<Option<String>, Client>>,
}

impl ReqwestFetcher {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client(&self, proxy: Option<&str>) -> Result<Client, FetchError> {
        let mut guard = self.clients.lock().await;
        let key = proxy.map(|p| p.to_string());
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder().cookie_store(true);
        if let Some(endpoint) = proxy {
            let proxy = reqwest::Proxy::all(endpoint)
                .map_err(|err| FetchError::Connection(format!("invalid proxy {endpoint}: {err}")))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|err| FetchError::Transport(err.to_string()))?;
        guard.insert(key, client.clone());
        Ok(client)
    }
}

impl Default for ReqwestFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetcher for ReqwestFetcher {
    fn tier(&self) -> FetchTier {
        FetchTier::Http
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        if request.proxies.len() > 1 {
            log::debug!(
                "reqwest cannot chain {} proxies, routing through the first",
                request.proxies.len()
            );
        }
        let client = self.client(request.proxies.first().map(String::as_str)).await?;
        let headers = convert_headers(&request.headers)?;

        let started = Instant::now();
        let response = client
            .get(request.url.as_str())
            .headers(headers)
            .timeout(request.timeout)
            .send()
            .await
            .map_err(|err| map_error(err, request))?;

        let status = response.status().as_u16();
        let url = response.url().clone();
        let headers = convert_back_headers(response.headers())?;
        let body = response
            .bytes()
            .await
            .map_err(|err| map_error(err, request))?;

        Ok(FetchResponse {
            status,
            headers,
            body,
            elapsed: started.elapsed(),
            url,
        })
    }

    async fn reset(&self) {
        self.clients.lock().await.clear();
    }
}

fn map_error(err: reqwest::Error, request: &FetchRequest) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout(request.timeout)
    } else if err.is_connect() {
        FetchError::Connection(err.to_string())
    } else {
        FetchError::Transport(err.to_string())
    }
}

fn convert_headers(headers: &HttpHeaderMap) -> Result<HeaderMap, FetchError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers.iter() {
        let name = reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes())
            .map_err(|_| FetchError::InvalidHeader(name.to_string()))?;
        let value = reqwest::header::HeaderValue::from_bytes(value.as_bytes())
            .map_err(|_| FetchError::InvalidHeader(name.to_string()))?;
        map.insert(name, value);
    }
    Ok(map)
}

fn convert_back_headers(map: &HeaderMap) -> Result<HttpHeaderMap, FetchError> {
    let mut headers = HttpHeaderMap::new();
    for (name, value) in map.iter() {
        let http_name = HttpHeaderName::from_bytes(name.as_str().as_bytes())
            .map_err(|_| FetchError::InvalidHeader(name.to_string()))?;
        let http_value = HttpHeaderValue::from_bytes(value.as_bytes())
            .map_err(|_| FetchError::InvalidHeader(name.to_string()))?;
        headers.append(http_name, http_value);
    }
    Ok(headers)
}
