//! Netscape (`cookies.txt`) cookie files.

use std::path::Path;

use chrono::DateTime;
use kasumi::HttpClient;

use crate::error::Fc2Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetscapeCookie {
    pub domain: String,
    pub include_subdomains: bool,
    pub path: String,
    pub secure: bool,
    pub http_only: bool,
    /// Unix timestamp, 0 for session cookies.
    pub expires: i64,
    pub name: String,
    pub value: String,
}

impl NetscapeCookie {
    fn parse_line(line: &str) -> Option<Self> {
        let (line, http_only) = match line.strip_prefix("#HttpOnly_") {
            Some(line) => (line, true),
            None => (line, false),
        };
        if line.trim().is_empty() || line.starts_with('#') {
            return None;
        }

        let fields: Vec<&str> = line.trim_end_matches(['\r', '\n']).split('\t').collect();
        let [domain, include_subdomains, path, secure, expires, name, value] = fields[..] else {
            log::warn!("Skipping malformed cookie line: {line}");
            return None;
        };

        Some(Self {
            domain: domain.to_string(),
            include_subdomains: include_subdomains.eq_ignore_ascii_case("TRUE"),
            path: path.to_string(),
            secure: secure.eq_ignore_ascii_case("TRUE"),
            http_only,
            expires: expires.parse().unwrap_or_default(),
            name: name.to_string(),
            value: value.to_string(),
        })
    }

    /// Url the cookie would have been received from.
    pub fn origin(&self) -> String {
        format!("https://{}{}", self.domain.trim_start_matches('.'), self.path)
    }

    /// The cookie as a `Set-Cookie` header value.
    pub fn to_set_cookie(&self) -> String {
        let mut cookie = format!("{}={}; Path={}", self.name, self.value, self.path);
        if self.include_subdomains {
            cookie.push_str(&format!("; Domain={}", self.domain.trim_start_matches('.')));
        }
        if self.secure {
            cookie.push_str("; Secure");
        }
        if self.http_only {
            cookie.push_str("; HttpOnly");
        }
        if self.expires > 0 {
            if let Some(expires) = DateTime::from_timestamp(self.expires, 0) {
                cookie.push_str(&format!(
                    "; Expires={}",
                    expires.format("%a, %d %b %Y %H:%M:%S GMT")
                ));
            }
        }
        cookie
    }
}

pub fn parse_cookies(content: &str) -> Vec<NetscapeCookie> {
    content.lines().filter_map(NetscapeCookie::parse_line).collect()
}

/// Loads a cookies file into the client's cookie store.
pub async fn load_cookies_file(client: &HttpClient, path: &Path) -> Fc2Result<usize> {
    let content = tokio::fs::read_to_string(path).await?;
    let cookies = parse_cookies(&content);
    for cookie in cookies.iter() {
        client.add_cookies(vec![cookie.to_set_cookie()], cookie.origin())?;
    }
    log::info!("Loaded {} cookies from {}", cookies.len(), path.display());
    Ok(cookies.len())
}
