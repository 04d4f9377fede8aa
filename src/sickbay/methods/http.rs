//! HTTP(S) probe
//!
//! Requests run on the blocking pool through a `ureq` agent whose global
//! timeout matches the check timeout, so an abandoned request cannot outlive
//! its probe by more than one timeout.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use ureq::tls::TlsConfig;
use ureq::{Agent, Body, RequestBuilder};

use crate::sickbay::probe::{Probe, ProbeError};

const ALLOWED_METHODS: &[&str] = &["GET", "HEAD", "POST", "PUT", "DELETE", "OPTIONS"];

/// Arguments for `method = "http"`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HttpArgs {
    /// Full URL to request
    pub url: String,
    /// HTTP request method
    #[serde(default = "default_request_method")]
    pub request_method: String,
    /// Acceptable status codes (empty = any 2xx)
    #[serde(default)]
    pub expected_status: Vec<u16>,
    /// Regular expression the response body must match
    #[serde(default)]
    pub response: Option<String>,
    /// Extra request headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// User-Agent header value
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Verify TLS certificates
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,
}

fn default_request_method() -> String {
    "GET".to_string()
}

fn default_user_agent() -> String {
    format!("routewarden/{}", env!("CARGO_PKG_VERSION"))
}

fn default_verify_tls() -> bool {
    true
}

impl HttpArgs {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            errors.push(format!("http probe url '{}' must start with http:// or https://", self.url));
        }
        if !ALLOWED_METHODS.contains(&self.request_method.to_ascii_uppercase().as_str()) {
            errors.push(format!(
                "http probe request_method '{}' must be one of {}",
                self.request_method,
                ALLOWED_METHODS.join(", ")
            ));
        }
        for status in &self.expected_status {
            if !(100..=599).contains(status) {
                errors.push(format!("http probe expected_status {} is not a valid status", status));
            }
        }
        if let Some(pattern) = &self.response {
            if let Err(e) = Regex::new(pattern) {
                errors.push(format!("http probe response pattern is invalid: {}", e));
            }
        }
        errors
    }

    fn status_ok(&self, status: u16) -> bool {
        if self.expected_status.is_empty() {
            (200..300).contains(&status)
        } else {
            self.expected_status.contains(&status)
        }
    }
}

pub struct HttpProbe {
    args: HttpArgs,
    pattern: Option<Regex>,
    agent: Agent,
}

impl HttpProbe {
    pub fn new(args: HttpArgs, timeout: Duration) -> Result<Self, ProbeError> {
        let pattern = args.response.as_deref().map(Regex::new).transpose()?;
        let config = Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .tls_config(
                TlsConfig::builder()
                    .disable_verification(!args.verify_tls)
                    .build(),
            )
            .build();

        Ok(Self {
            args,
            pattern,
            agent: Agent::new_with_config(config),
        })
    }
}

fn with_headers<B>(mut request: RequestBuilder<B>, args: &HttpArgs) -> RequestBuilder<B> {
    request = request.header("User-Agent", args.user_agent.as_str());
    for (name, value) in &args.headers {
        request = request.header(name.as_str(), value.as_str());
    }
    request
}

fn send(agent: &Agent, args: &HttpArgs) -> Result<ureq::http::Response<Body>, ureq::Error> {
    let url = args.url.as_str();
    match args.request_method.to_ascii_uppercase().as_str() {
        "POST" => with_headers(agent.post(url), args).send_empty(),
        "PUT" => with_headers(agent.put(url), args).send_empty(),
        "HEAD" => with_headers(agent.head(url), args).call(),
        "DELETE" => with_headers(agent.delete(url), args).call(),
        "OPTIONS" => with_headers(agent.options(url), args).call(),
        _ => with_headers(agent.get(url), args).call(),
    }
}

/// Blocking request and response evaluation
fn execute(agent: &Agent, args: &HttpArgs, pattern: Option<&Regex>) -> Result<String, ProbeError> {
    let mut response = send(agent, args).map_err(|e| ProbeError::Http(e.to_string()))?;
    let status = response.status().as_u16();
    if !args.status_ok(status) {
        return Err(ProbeError::Status(status));
    }

    if let Some(pattern) = pattern {
        let body = response
            .body_mut()
            .read_to_string()
            .map_err(|e| ProbeError::Http(e.to_string()))?;
        if !pattern.is_match(&body) {
            return Err(ProbeError::Mismatch(format!(
                "response body from {} does not match '{}'",
                args.url,
                pattern.as_str()
            )));
        }
    }

    Ok(format!("{} {} returned {}", args.request_method, args.url, status))
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self) -> Result<String, ProbeError> {
        let agent = self.agent.clone();
        let args = self.args.clone();
        let pattern = self.pattern.clone();

        tokio::task::spawn_blocking(move || execute(&agent, &args, pattern.as_ref()))
            .await
            .map_err(|e| ProbeError::Aborted(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    /// Serve one canned HTTP response and return the port
    fn serve_once(status_line: &'static str, body: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 2048];
                let _ = stream.read(&mut buf);
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status_line,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        port
    }

    fn http_args(port: u16, response: Option<&str>) -> HttpArgs {
        HttpArgs {
            url: format!("http://127.0.0.1:{}/health", port),
            request_method: default_request_method(),
            expected_status: Vec::new(),
            response: response.map(|s| s.to_string()),
            headers: BTreeMap::new(),
            user_agent: default_user_agent(),
            verify_tls: true,
        }
    }

    #[tokio::test]
    async fn test_http_probe_success_with_body_match() {
        let port = serve_once("200 OK", "status: healthy");
        let probe = HttpProbe::new(http_args(port, Some("healthy")), Duration::from_secs(5)).unwrap();
        let detail = probe.probe().await.unwrap();
        assert!(detail.contains("returned 200"));
    }

    #[tokio::test]
    async fn test_http_probe_bad_status() {
        let port = serve_once("503 Service Unavailable", "down");
        let probe = HttpProbe::new(http_args(port, None), Duration::from_secs(5)).unwrap();
        assert!(matches!(probe.probe().await, Err(ProbeError::Status(503))));
    }

    #[tokio::test]
    async fn test_http_probe_body_mismatch() {
        let port = serve_once("200 OK", "status: draining");
        let probe = HttpProbe::new(http_args(port, Some("healthy")), Duration::from_secs(5)).unwrap();
        assert!(matches!(probe.probe().await, Err(ProbeError::Mismatch(_))));
    }

    #[test]
    fn test_http_args_defaults_and_validation() {
        let args: HttpArgs = toml::from_str(r#"url = "http://192.0.2.1/""#).unwrap();
        assert_eq!(args.request_method, "GET");
        assert!(args.verify_tls);
        assert!(args.validate().is_empty());
        assert!(args.status_ok(204));
        assert!(!args.status_ok(301));

        let bad = HttpArgs {
            url: "ftp://192.0.2.1/".into(),
            request_method: "BREW".into(),
            expected_status: vec![42],
            response: Some("(".into()),
            ..args
        };
        assert_eq!(bad.validate().len(), 4);
    }
}
