// reqwest-backed portal session.
//
// The portal tracks authentication in cookies. Renewing throws the cookie jar
// away and visits the auth page again to pick up a fresh session cookie.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::redirect::Policy;
use tracing::debug;

use casesearch_common::Config;

use crate::outcome::RequestError;
use crate::traits::{PortalResponse, PortalSession, SessionFactory};

const USER_AGENT: &str = concat!("casesearch-scraper/", env!("CARGO_PKG_VERSION"));

pub struct HttpSession {
    client: reqwest::Client,
    auth_target: String,
    timeout: Duration,
}

impl HttpSession {
    pub fn new(auth_target: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            auth_target: auth_target.to_string(),
            timeout,
        })
    }
}

fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .cookie_store(true)
        .redirect(Policy::none())
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .context("Failed to build HTTP client")
}

#[async_trait]
impl PortalSession for HttpSession {
    async fn post(
        &mut self,
        url: &str,
        form: &[(&str, &str)],
    ) -> std::result::Result<PortalResponse, RequestError> {
        let response = self
            .client
            .post(url)
            .form(form)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let text = response.text().await.map_err(request_error)?;

        Ok(PortalResponse {
            status,
            headers,
            text,
        })
    }

    async fn renew(&mut self) -> Result<()> {
        debug!(auth_target = %self.auth_target, "Renewing portal session");
        self.client = build_client(self.timeout)?;
        self.client
            .get(&self.auth_target)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.auth_target))?;
        Ok(())
    }
}

fn request_error(e: reqwest::Error) -> RequestError {
    if e.is_timeout() {
        RequestError::Timeout
    } else {
        RequestError::Transport(e.to_string())
    }
}

/// Creates `HttpSession`s from config.
#[derive(Debug, Clone)]
pub struct HttpSessionFactory {
    auth_target: String,
    timeout: Duration,
}

impl HttpSessionFactory {
    pub fn new(auth_target: &str, timeout: Duration) -> Self {
        Self {
            auth_target: auth_target.to_string(),
            timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.auth_target,
            Duration::from_secs(config.request_timeout_secs),
        )
    }
}

impl SessionFactory for HttpSessionFactory {
    type Session = HttpSession;

    fn create(&self) -> Result<HttpSession> {
        HttpSession::new(&self.auth_target, self.timeout)
    }
}
