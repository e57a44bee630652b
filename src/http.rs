//! The thin HTTP client (spec §4.5): GET/HEAD/POST with a case-insensitive
//! header lookup on the response. No retry policy lives here — callers
//! (the ACME transport, the drive state machine) decide when to retry.

use reqwest::Method;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    headers: reqwest::header::HeaderMap,
    pub body: Vec<u8>,
}

impl Response {
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub struct HttpClient {
    client: reqwest::Client,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub async fn get(&self, url: &str) -> Result<Response> {
        self.call(Method::GET, url, None, None).await
    }

    pub async fn head(&self, url: &str) -> Result<Response> {
        self.call(Method::HEAD, url, None, None).await
    }

    pub async fn post(&self, url: &str, content_type: &str, body: Vec<u8>) -> Result<Response> {
        self.call(Method::POST, url, Some(content_type), Some(body)).await
    }

    async fn call(
        &self,
        method: Method,
        url: &str,
        content_type: Option<&str>,
        body: Option<Vec<u8>>,
    ) -> Result<Response> {
        let mut req = self.client.request(method, url);
        if let Some(ct) = content_type {
            req = req.header(reqwest::header::CONTENT_TYPE, ct);
        }
        if let Some(body) = body {
            req = req.body(body);
        }
        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let body = resp.bytes().await?.to_vec();
        Ok(Response { status, headers, body })
    }
}
