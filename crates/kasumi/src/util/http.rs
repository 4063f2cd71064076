use std::{ops::Deref, sync::Arc};

use reqwest::{Client, ClientBuilder, IntoUrl};
use reqwest_cookie_store::{CookieStore, CookieStoreMutex};

use crate::error::KasumiResult;

/// A [`Client`] sharing one cookie jar between playlist, segment and websocket requests.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    cookies_store: Arc<CookieStoreMutex>,
}

impl HttpClient {
    pub fn new(builder: ClientBuilder) -> KasumiResult<Self> {
        let cookies_store = Arc::new(CookieStoreMutex::new(CookieStore::default()));
        let client = builder.cookie_provider(cookies_store.clone()).build()?;

        Ok(Self {
            client,
            cookies_store,
        })
    }

    /// Adds `Set-Cookie` formatted cookies as if they were received from `url`.
    pub fn add_cookies(&self, cookies: Vec<String>, url: impl IntoUrl) -> KasumiResult<()> {
        let url = url.into_url()?;
        let mut lock = self
            .cookies_store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for cookie in cookies {
            if let Err(e) = lock.parse(&cookie, &url) {
                log::warn!("Ignoring invalid cookie for {url}: {e}");
            }
        }
        Ok(())
    }

    /// Value of the cookie `name` that would be sent to `url`.
    pub fn cookie(&self, name: &str, url: impl IntoUrl) -> Option<String> {
        let url = url.into_url().ok()?;
        let lock = self
            .cookies_store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        lock.matches(&url)
            .into_iter()
            .find(|cookie| cookie.name() == name)
            .map(|cookie| cookie.value().to_string())
    }
}

impl Deref for HttpClient {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}
