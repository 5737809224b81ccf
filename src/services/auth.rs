// src/services/auth.rs

//! Credential exchange.
//!
//! The portal only issues tokens through its browser login form, so the
//! default strategy drives a real browser through the W3C WebDriver
//! protocol and reads the token the single-page app leaves in
//! `localStorage`. Everything environment-specific lives behind
//! [`Authenticator`] so a direct API login can replace it.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method};
use serde_json::{Value, json};
use tokio::time::Instant;

use crate::error::{AuthError, Result};
use crate::models::{AuthConfig, BearerToken, Config, Credentials};

/// W3C web element reference key.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

/// Per-command timeout when talking to the driver.
const DRIVER_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

const READ_TOKEN_SCRIPT: &str = "return window.localStorage.getItem(arguments[0]);";

/// Turns operator credentials into a bearer token.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        credentials: Credentials,
    ) -> std::result::Result<BearerToken, AuthError>;
}

/// Returns a token the operator already holds.
pub struct PresetTokenAuthenticator {
    token: BearerToken,
}

impl PresetTokenAuthenticator {
    pub fn new(token: BearerToken) -> Self {
        Self { token }
    }
}

#[async_trait]
impl Authenticator for PresetTokenAuthenticator {
    async fn authenticate(
        &self,
        _credentials: Credentials,
    ) -> std::result::Result<BearerToken, AuthError> {
        Ok(self.token.clone())
    }
}

/// Logs in through a headless browser controlled over WebDriver.
pub struct WebDriverAuthenticator {
    client: Client,
    driver_url: String,
    login_url: String,
    config: AuthConfig,
}

impl WebDriverAuthenticator {
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder().timeout(DRIVER_COMMAND_TIMEOUT).build()?;
        Ok(Self {
            client,
            driver_url: config.auth.webdriver_url.trim_end_matches('/').to_string(),
            login_url: config.portal.login_url.clone(),
            config: config.auth.clone(),
        })
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms.max(50))
    }

    /// Send one WebDriver command and unwrap its `value`.
    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> std::result::Result<Value, AuthError> {
        let url = format!("{}/{}", self.driver_url, path);
        let mut request = self.client.request(method, &url);
        if let Some(body) = body {
            request = request
                .header(CONTENT_TYPE, "application/json")
                .body(body.to_string());
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        let reply: Value = serde_json::from_str(&text)
            .map_err(|e| AuthError::Protocol(format!("invalid driver reply: {e}")))?;
        let value = reply.get("value").cloned().unwrap_or(Value::Null);

        if status.is_success() {
            Ok(value)
        } else {
            Err(AuthError::Protocol(describe_driver_error(&value)))
        }
    }

    async fn open_session(&self) -> std::result::Result<String, AuthError> {
        let capabilities = json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": { "args": self.config.browser_args },
                }
            }
        });

        let value = self
            .call(Method::POST, "session", Some(capabilities))
            .await
            .map_err(|e| match e {
                AuthError::Protocol(message) => AuthError::DriverUnavailable(message),
                other => other,
            })?;

        value
            .get("sessionId")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| AuthError::Protocol("session reply without sessionId".into()))
    }

    async fn close_session(&self, session: &str) -> std::result::Result<(), AuthError> {
        self.call(Method::DELETE, &format!("session/{session}"), None)
            .await
            .map(|_| ())
    }

    async fn find_elements(
        &self,
        session: &str,
        selector: &str,
    ) -> std::result::Result<Vec<String>, AuthError> {
        let value = self
            .call(
                Method::POST,
                &format!("session/{session}/elements"),
                Some(json!({ "using": "css selector", "value": selector })),
            )
            .await?;
        Ok(element_ids(&value))
    }

    /// Poll until `selector` matches or `wait` elapses.
    async fn wait_for_element(
        &self,
        session: &str,
        selector: &str,
        wait: Duration,
    ) -> std::result::Result<Option<String>, AuthError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(id) = self.find_elements(session, selector).await?.into_iter().next() {
                return Ok(Some(id));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval()).await;
        }
    }

    async fn type_into(
        &self,
        session: &str,
        element: &str,
        text: &str,
    ) -> std::result::Result<(), AuthError> {
        self.call(
            Method::POST,
            &format!("session/{session}/element/{element}/value"),
            Some(json!({ "text": text })),
        )
        .await
        .map(|_| ())
    }

    async fn click(&self, session: &str, element: &str) -> std::result::Result<(), AuthError> {
        self.call(
            Method::POST,
            &format!("session/{session}/element/{element}/click"),
            Some(json!({})),
        )
        .await
        .map(|_| ())
    }

    async fn read_token(
        &self,
        session: &str,
    ) -> std::result::Result<Option<BearerToken>, AuthError> {
        let value = self
            .call(
                Method::POST,
                &format!("session/{session}/execute/sync"),
                Some(json!({
                    "script": READ_TOKEN_SCRIPT,
                    "args": [self.config.token_storage_key],
                })),
            )
            .await?;
        Ok(value.as_str().and_then(BearerToken::sanitize))
    }

    async fn login(
        &self,
        session: &str,
        credentials: &Credentials,
    ) -> std::result::Result<BearerToken, AuthError> {
        self.call(
            Method::POST,
            &format!("session/{session}/url"),
            Some(json!({ "url": self.login_url })),
        )
        .await?;

        let form_wait = Duration::from_secs(self.config.form_wait_secs);
        let identifier = self
            .wait_for_element(session, &self.config.identifier_selector, form_wait)
            .await?
            .ok_or(AuthError::LoginFormNotFound(self.config.form_wait_secs))?;
        self.type_into(session, &identifier, credentials.identifier())
            .await?;

        let secret = self
            .find_elements(session, &self.config.secret_selector)
            .await?
            .into_iter()
            .next()
            .ok_or(AuthError::LoginFormNotFound(self.config.form_wait_secs))?;
        self.type_into(session, &secret, credentials.secret()).await?;

        let submit = self
            .find_elements(session, &self.config.submit_selector)
            .await?
            .into_iter()
            .next()
            .ok_or(AuthError::LoginFormNotFound(self.config.form_wait_secs))?;
        self.click(session, &submit).await?;

        let deadline = Instant::now() + Duration::from_secs(self.config.token_wait_secs);
        loop {
            if let Some(token) = self.read_token(session).await? {
                return Ok(token);
            }
            if Instant::now() >= deadline {
                return Err(AuthError::Rejected);
            }
            tokio::time::sleep(self.poll_interval()).await;
        }
    }
}

#[async_trait]
impl Authenticator for WebDriverAuthenticator {
    async fn authenticate(
        &self,
        credentials: Credentials,
    ) -> std::result::Result<BearerToken, AuthError> {
        let session = self.open_session().await?;
        log::debug!("WebDriver session {} opened", session);

        let outcome = self.login(&session, &credentials).await;
        drop(credentials);

        // The browser is torn down on every path.
        if let Err(e) = self.close_session(&session).await {
            log::warn!("Failed to close WebDriver session {}: {}", session, e);
        }

        outcome
    }
}

/// Element ids from a `Find Elements` reply.
fn element_ids(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get(ELEMENT_KEY).and_then(Value::as_str))
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn describe_driver_error(value: &Value) -> String {
    let error = value
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown error");
    match value.get("message").and_then(Value::as_str) {
        Some(message) if !message.is_empty() => format!("{error}: {message}"),
        _ => error.to_string(),
    }
}
