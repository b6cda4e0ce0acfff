//! Minimal HTTP/1 client shared by the broker and webhook collaborators.
//!
//! One connection per request over a plain `TcpStream`, driven by
//! `hyper`'s low-level client. Every request is bounded by a timeout.

use std::time::Duration;

use bytes::Bytes;
use http::{Method, Request, Uri};
use http_body_util::{BodyExt, Full};
use tracing::debug;

use crate::error::HttpError;

const USER_AGENT: &str = concat!("tidewatch/", env!("CARGO_PKG_VERSION"));

/// A fully buffered response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// An outgoing request.
#[derive(Debug, Clone)]
pub struct HttpRequest<'a> {
    pub method: Method,
    pub url: &'a str,
    pub headers: Vec<(&'static str, String)>,
    pub body: Option<Vec<u8>>,
}

impl<'a> HttpRequest<'a> {
    pub fn get(url: &'a str) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post_json(url: &'a str, body: Vec<u8>) -> Self {
        Self {
            method: Method::POST,
            url,
            headers: vec![("content-type", "application/json".to_string())],
            body: Some(body),
        }
    }

    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }
}

/// Send a request and buffer the whole response body.
pub async fn send(req: HttpRequest<'_>, timeout: Duration) -> Result<HttpResponse, HttpError> {
    let uri: Uri = req
        .url
        .parse()
        .map_err(|_| HttpError::InvalidUrl(req.url.to_string()))?;
    if uri.scheme_str() != Some("http") {
        return Err(HttpError::InvalidUrl(req.url.to_string()));
    }
    let authority = uri
        .authority()
        .ok_or_else(|| HttpError::InvalidUrl(req.url.to_string()))?
        .clone();
    let address = format!("{}:{}", authority.host(), authority.port_u16().unwrap_or(80));
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let result = tokio::time::timeout(timeout, async {
        let stream = tokio::net::TcpStream::connect(&address)
            .await
            .map_err(|e| HttpError::Connect {
                address: address.clone(),
                reason: e.to_string(),
            })?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| HttpError::Connect {
                address: address.clone(),
                reason: e.to_string(),
            })?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = Request::builder()
            .method(req.method.clone())
            .uri(&path)
            .header("host", authority.as_str())
            .header("user-agent", USER_AGENT);
        for (name, value) in &req.headers {
            builder = builder.header(*name, value);
        }
        let request = builder
            .body(Full::new(Bytes::from(req.body.clone().unwrap_or_default())))
            .map_err(|e| HttpError::Request(e.to_string()))?;

        let resp = sender
            .send_request(request)
            .await
            .map_err(|e| HttpError::Request(e.to_string()))?;
        let status = resp.status().as_u16();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| HttpError::Request(e.to_string()))?
            .to_bytes();

        debug!(method = %req.method, %path, status, "http request complete");
        Ok::<_, HttpError>(HttpResponse { status, body })
    })
    .await;

    match result {
        Ok(resp) => resp,
        Err(_) => Err(HttpError::Timeout(timeout)),
    }
}

/// Percent-encode a single path segment (RFC 3986 unreserved set kept).
pub fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
