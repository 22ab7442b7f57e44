use crate::models::is_success_code;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::redirect::Policy;
use reqwest::Client;
use std::time::Duration;
use url::Url;

const MAX_REDIRECTS: usize = 10;

/// What one GET of a target URL produced. Probes never error out; every
/// outcome is encoded as a verdict.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    /// HTTP status, or -1 for connection, timeout, and read failures.
    pub return_code: i32,
    /// MIME type on success, exception text on failure.
    pub detail: String,
    /// Body prefix, at most `max_read` bytes.
    pub body: Vec<u8>,
    pub success: bool,
    pub timed_out: bool,
}

impl ProbeOutcome {
    fn failure(detail: String, timed_out: bool) -> Self {
        Self {
            return_code: -1,
            detail,
            body: Vec::new(),
            success: false,
            timed_out,
        }
    }
}

/// Issues single GET probes against target URLs.
///
/// Each probe gets a client of its own so its cookie jar dies with it: some
/// servers need a cookie echoed back to break out of a redirect loop, and a
/// jar shared across probes would leak one target's session into another's.
pub struct Probe {
    user_agent: String,
    timeout: Duration,
    max_read: usize,
}

impl Probe {
    pub fn new(user_agent: String, timeout: Duration, max_read: usize) -> Self {
        Self {
            user_agent,
            timeout,
            max_read,
        }
    }

    pub fn from_config(config: &crate::config::Config) -> Self {
        Self::new(
            config.user_agent.clone(),
            config.check_timeout(),
            config.max_read,
        )
    }

    /// GET the target and classify the outcome. 200, 401, and 403 count as
    /// success; anything else is a failure carrying the status, and
    /// connection-level problems carry -1 with the error text.
    pub async fn check(&self, target: &str) -> ProbeOutcome {
        if let Err(e) = Url::parse(target) {
            return ProbeOutcome::failure(format!("invalid target URL: {e}"), false);
        }

        let client = match Client::builder()
            .user_agent(&self.user_agent)
            .timeout(self.timeout)
            .redirect(Policy::limited(MAX_REDIRECTS))
            .cookie_store(true)
            .build()
        {
            Ok(c) => c,
            Err(e) => return ProbeOutcome::failure(format!("client setup failed: {e}"), false),
        };

        let mut response = match client.get(target).header(ACCEPT, "*/*").send().await {
            Ok(r) => r,
            Err(e) => return classify_request_error(&e),
        };

        let status = i32::from(response.status().as_u16());
        let status_ok = is_success_code(status);
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let mut body: Vec<u8> = Vec::new();
        loop {
            if body.len() >= self.max_read {
                break;
            }
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    let room = self.max_read - body.len();
                    body.extend_from_slice(&chunk[..chunk.len().min(room)]);
                }
                Ok(None) => break,
                Err(e) => {
                    // Many servers deliver a complete HTML document and then
                    // hold the connection open or drop it uncleanly. A partial
                    // body that still reads as finished HTML is taken at face
                    // value.
                    if status_ok && is_html(&content_type) && ends_with_closing_html(&body) {
                        break;
                    }
                    if status_ok {
                        return classify_request_error(&e);
                    }
                    // The status already failed the probe; the read error
                    // adds nothing.
                    break;
                }
            }
        }

        ProbeOutcome {
            return_code: status,
            detail: content_type,
            body,
            success: status_ok,
            timed_out: false,
        }
    }
}

/// Reduce a reqwest error to the exception text recorded in the verdict.
/// Timeouts are flagged so the metrics can count them apart.
fn classify_request_error(error: &reqwest::Error) -> ProbeOutcome {
    if error.is_timeout() {
        return ProbeOutcome::failure("request timed out".to_string(), true);
    }

    let message = error.to_string();
    let lower = message.to_lowercase();

    let detail = if error.is_connect() {
        if lower.contains("dns") || lower.contains("name resolution") || lower.contains("no such host")
        {
            format!("DNS resolution failed: {message}")
        } else {
            format!("connection failed: {message}")
        }
    } else if lower.contains("certificate") || lower.contains("ssl") || lower.contains("tls") {
        format!("TLS error: {message}")
    } else {
        message
    };

    ProbeOutcome::failure(detail, false)
}

fn is_html(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|t| t.eq_ignore_ascii_case("text/html"))
}

/// True when the body, ignoring trailing whitespace inside and after the
/// final tag, ends with `</html>` in any case.
fn ends_with_closing_html(body: &[u8]) -> bool {
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim_end();
    let Some(before_bracket) = trimmed.strip_suffix('>') else {
        return false;
    };
    before_bracket
        .trim_end()
        .to_ascii_lowercase()
        .ends_with("</html")
}
