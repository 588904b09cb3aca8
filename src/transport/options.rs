//! Transport options.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use socket_pool::transport::{PingOptions, WebSocketOptions};
//!
//! let options = WebSocketOptions::new("wss://stream.example.com/ws")?
//!     .with_connect_timeout(Duration::from_secs(5))
//!     .with_ping(
//!         PingOptions::new()
//!             .with_ping_message("ping")
//!             .with_pong_message("pong")
//!             .with_ping_after_idle(Duration::from_secs(15))
//!             .with_pong_received_timeout(Duration::from_secs(5)),
//!     );
//!
//! let poll = HttpOptions::new("https://api.example.com/updates")?
//!     .with_method(HttpMethod::Post)
//!     .with_long_poll("{\"since\":0}", Duration::ZERO);
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default timeout for the opening handshake.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for one HTTP exchange; long enough for a held poll.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// PingOptions
// ============================================================================

/// Keepalive policy. A zero duration disables the corresponding feature.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PingOptions {
    /// Text sent as an application-level ping.
    pub ping_message: Option<String>,

    /// Text recognized as the peer's pong.
    pub pong_message: Option<String>,

    /// Fixed-rate ping period.
    pub ping_interval: Duration,

    /// Ping only after nothing was received for this long.
    ///
    /// Ignored when `ping_interval` is set.
    pub ping_after_idle: Duration,

    /// Close the link when nothing was received for this long.
    pub message_received_timeout: Duration,

    /// Close the link when no pong follows a ping within this time.
    pub pong_received_timeout: Duration,
}

impl PingOptions {
    /// Creates options with every feature disabled.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the ping text.
    #[inline]
    #[must_use]
    pub fn with_ping_message(mut self, message: impl Into<String>) -> Self {
        self.ping_message = Some(message.into());
        self
    }

    /// Sets the pong text.
    #[inline]
    #[must_use]
    pub fn with_pong_message(mut self, message: impl Into<String>) -> Self {
        self.pong_message = Some(message.into());
        self
    }

    /// Sets the fixed-rate ping period.
    #[inline]
    #[must_use]
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Sets the idle time after which a ping is sent.
    #[inline]
    #[must_use]
    pub fn with_ping_after_idle(mut self, idle: Duration) -> Self {
        self.ping_after_idle = idle;
        self
    }

    /// Sets the receive timeout.
    #[inline]
    #[must_use]
    pub fn with_message_received_timeout(mut self, timeout: Duration) -> Self {
        self.message_received_timeout = timeout;
        self
    }

    /// Sets the pong timeout.
    #[inline]
    #[must_use]
    pub fn with_pong_received_timeout(mut self, timeout: Duration) -> Self {
        self.pong_received_timeout = timeout;
        self
    }

    /// Returns `true` if `text` is the configured pong.
    #[inline]
    #[must_use]
    pub fn is_pong(&self, text: &str) -> bool {
        self.pong_message.as_deref() == Some(text)
    }

    /// Returns `true` if any keepalive feature is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        let pings = self.ping_message.is_some()
            && (!self.ping_interval.is_zero() || !self.ping_after_idle.is_zero());
        pings || !self.message_received_timeout.is_zero()
    }
}

// ============================================================================
// WebSocketOptions
// ============================================================================

/// WebSocket endpoint configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketOptions {
    /// Endpoint URL (`ws` or `wss`).
    pub url: Url,

    /// Timeout for TCP connect plus the opening handshake.
    pub connect_timeout: Duration,

    /// Keepalive policy.
    pub ping: PingOptions,
}

impl WebSocketOptions {
    /// Creates options for `url`.
    ///
    /// # Errors
    ///
    /// - [`Error::Url`] if `url` does not parse
    /// - [`Error::Config`] if the scheme is not `ws` or `wss`
    pub fn new(url: &str) -> Result<Self> {
        Self::from_url(Url::parse(url)?)
    }

    /// Creates options for an already parsed URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the scheme is not `ws` or `wss`.
    pub fn from_url(url: Url) -> Result<Self> {
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::config(format!(
                "Unsupported WebSocket scheme: {}",
                url.scheme()
            )));
        }

        Ok(Self {
            url,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            ping: PingOptions::default(),
        })
    }

    /// Sets the connect timeout.
    #[inline]
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the keepalive policy.
    #[inline]
    #[must_use]
    pub fn with_ping(mut self, ping: PingOptions) -> Self {
        self.ping = ping;
        self
    }
}

// ============================================================================
// HttpOptions
// ============================================================================

/// Request method of an HTTP connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HttpMethod {
    /// Fetch the URL; the outgoing message only triggers the request.
    #[default]
    Get,
    /// Post the outgoing message as the request body.
    Post,
}

/// HTTP endpoint configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpOptions {
    /// Endpoint URL (`http` or `https`).
    pub url: Url,

    /// Request method.
    pub method: HttpMethod,

    /// Timeout for one request/response exchange.
    pub request_timeout: Duration,

    /// Message repeated by the poll loop; `None` disables polling.
    pub poll_message: Option<String>,

    /// Pause between polls. Zero re-polls as soon as a response arrives.
    pub poll_interval: Duration,
}

impl HttpOptions {
    /// Creates options for `url`.
    ///
    /// # Errors
    ///
    /// - [`Error::Url`] if `url` does not parse
    /// - [`Error::Config`] if the scheme is not `http` or `https`
    pub fn new(url: &str) -> Result<Self> {
        Self::from_url(Url::parse(url)?)
    }

    /// Creates options for an already parsed URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the scheme is not `http` or `https`.
    pub fn from_url(url: Url) -> Result<Self> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::config(format!(
                "Unsupported HTTP scheme: {}",
                url.scheme()
            )));
        }

        Ok(Self {
            url,
            method: HttpMethod::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            poll_message: None,
            poll_interval: Duration::ZERO,
        })
    }

    /// Sets the request method.
    #[inline]
    #[must_use]
    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    /// Sets the request timeout.
    #[inline]
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Polls with `message` while the connection is active.
    #[inline]
    #[must_use]
    pub fn with_long_poll(mut self, message: impl Into<String>, interval: Duration) -> Self {
        self.poll_message = Some(message.into());
        self.poll_interval = interval;
        self
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_defaults_disabled() {
        let options = PingOptions::new();
        assert!(!options.is_enabled());
        assert!(!options.is_pong("pong"));
    }

    #[test]
    fn test_ping_builder() {
        let options = PingOptions::new()
            .with_ping_message("ping")
            .with_pong_message("pong")
            .with_ping_interval(Duration::from_secs(10))
            .with_pong_received_timeout(Duration::from_secs(3));

        assert!(options.is_enabled());
        assert!(options.is_pong("pong"));
        assert!(!options.is_pong("ping"));
        assert_eq!(options.ping_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_receive_timeout_alone_enables() {
        let options = PingOptions::new().with_message_received_timeout(Duration::from_secs(30));
        assert!(options.is_enabled());
    }

    #[test]
    fn test_websocket_options() {
        let options = WebSocketOptions::new("wss://example.com/ws")
            .expect("valid url")
            .with_connect_timeout(Duration::from_secs(3));

        assert_eq!(options.url.as_str(), "wss://example.com/ws");
        assert_eq!(options.connect_timeout, Duration::from_secs(3));
        assert_eq!(options.ping, PingOptions::default());
    }

    #[test]
    fn test_rejects_http_scheme() {
        let err = WebSocketOptions::new("http://example.com").unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_http_options() {
        let options = HttpOptions::new("https://api.example.com/poll")
            .expect("valid url")
            .with_method(HttpMethod::Post)
            .with_long_poll("next", Duration::from_millis(250));

        assert_eq!(options.method, HttpMethod::Post);
        assert_eq!(options.poll_message.as_deref(), Some("next"));
        assert_eq!(options.poll_interval, Duration::from_millis(250));
        assert_eq!(options.request_timeout, DEFAULT_REQUEST_TIMEOUT);
    }

    #[test]
    fn test_http_rejects_ws_scheme() {
        let err = HttpOptions::new("ws://example.com").unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_rejects_invalid_url() {
        let err = WebSocketOptions::new("not a url").unwrap_err();
        assert!(matches!(err, Error::Url(_)));
    }
}
