//! HTTP(S) fetcher over a pooled reqwest client
//!
//! One client serves every fetch; reqwest pools connections per origin.
//! Bodies stream to the handler chunk by chunk, with the cancellation
//! flag checked at each chunk boundary. A fetch that outlives its
//! deadline terminates with `TimedOut`.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, trace, warn};

use pagecore_base::timer::SharedTimer;
use pagecore_cache::ResponseHeaders;

use crate::fetch::{FetchHandler, FetchOutcome, RequestContext, UrlFetcher};
use crate::{Error, Result};

/// Default whole-fetch timeout.
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 250_000;

/// TLS policy bits, set from the `https_options` directive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HttpsOptions {
    pub enable: bool,
    pub allow_self_signed: bool,
    pub allow_unknown_certificate_authority: bool,
    pub allow_certificate_not_yet_valid: bool,
}

impl HttpsOptions {
    /// Parse a comma-separated directive such as
    /// `"enable,allow_self_signed"`. Unknown tokens are config-time
    /// errors.
    pub fn parse_directive(directive: &str) -> Result<Self> {
        let mut options = Self::default();
        for token in directive.split(',') {
            match token.trim() {
                "" => {}
                "enable" => options.enable = true,
                "allow_self_signed" => options.allow_self_signed = true,
                "allow_unknown_certificate_authority" => {
                    options.allow_unknown_certificate_authority = true;
                }
                "allow_certificate_not_yet_valid" => {
                    options.allow_certificate_not_yet_valid = true;
                }
                other => return Err(Error::InvalidHttpsOption(other.to_string())),
            }
        }
        Ok(options)
    }

    /// True when any certificate-validation relaxation is requested.
    fn accepts_invalid_certs(self) -> bool {
        self.allow_self_signed
            || self.allow_unknown_certificate_authority
            || self.allow_certificate_not_yet_valid
    }
}

/// Streaming URL fetcher backed by one pooled reqwest client.
pub struct ReqwestUrlFetcher {
    client: reqwest::Client,
    timer: SharedTimer,
    timeout_ms: u64,
    https: HttpsOptions,
}

/// Configuration for [`ReqwestUrlFetcher`].
pub struct FetcherBuilder {
    timeout_ms: u64,
    https: HttpsOptions,
    proxy: Option<String>,
    user_agent: Option<String>,
}

impl FetcherBuilder {
    pub fn new() -> Self {
        Self {
            timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            https: HttpsOptions {
                enable: true,
                ..Default::default()
            },
            proxy: None,
            user_agent: None,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_https_options(mut self, https: HttpsOptions) -> Self {
        self.https = https;
        self
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn build(self, timer: SharedTimer) -> Result<ReqwestUrlFetcher> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .danger_accept_invalid_certs(self.https.accepts_invalid_certs())
            .timeout(Duration::from_millis(self.timeout_ms));
        if let Some(proxy) = self.proxy {
            let parsed = reqwest::Proxy::all(&proxy).map_err(|e| Error::InvalidProxy {
                proxy: proxy.clone(),
                reason: e.to_string(),
            })?;
            builder = builder.proxy(parsed);
        }
        if let Some(ua) = self.user_agent {
            builder = builder.user_agent(ua);
        }
        Ok(ReqwestUrlFetcher {
            client: builder.build()?,
            timer,
            timeout_ms: self.timeout_ms,
            https: self.https,
        })
    }
}

impl Default for FetcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ReqwestUrlFetcher {
    pub fn builder() -> FetcherBuilder {
        FetcherBuilder::new()
    }

    /// Remaining time before the request's deadline, falling back to
    /// the fetcher-wide timeout.
    fn remaining(&self, request: &RequestContext) -> Duration {
        match request.deadline_us {
            Some(deadline) => {
                let left = deadline - self.timer.now_us();
                Duration::from_micros(left.max(0) as u64)
            }
            None => Duration::from_millis(self.timeout_ms),
        }
    }

    fn classify(error: &reqwest::Error) -> FetchOutcome {
        if error.is_timeout() {
            return FetchOutcome::TimedOut;
        }
        // rustls failures surface as connect errors; sniff the chain.
        let chain = format!("{error:?}").to_ascii_lowercase();
        if chain.contains("certificate") || chain.contains("tls") || chain.contains("handshake") {
            return FetchOutcome::SslError;
        }
        FetchOutcome::ConnectError
    }

    async fn run(&self, request: &RequestContext, handler: &mut dyn FetchHandler) -> FetchOutcome {
        if request.url.starts_with("https:") && !self.https.enable {
            debug!("HTTPS disabled, refusing {}", request.url);
            return FetchOutcome::SslError;
        }
        if request.cancel.is_requested() {
            return FetchOutcome::Canceled;
        }

        let budget = self.remaining(request);
        let mut builder = self.client.get(&request.url).timeout(budget);
        for (name, value) in &request.request_headers {
            builder = builder.header(name, value);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                debug!("Fetch of {} failed: {e}", request.url);
                return Self::classify(&e);
            }
        };

        let status = response.status();
        handler
            .headers_complete(&convert_headers(&response))
            .await;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            if request.cancel.is_requested() {
                trace!("Fetch of {} canceled mid-body", request.url);
                return FetchOutcome::Canceled;
            }
            match chunk {
                Ok(bytes) => handler.write(bytes).await,
                Err(e) => {
                    warn!("Body stream for {} failed: {e}", request.url);
                    return Self::classify(&e);
                }
            }
        }

        if status.is_success() {
            FetchOutcome::Success
        } else {
            FetchOutcome::HttpError(status.as_u16())
        }
    }
}

/// Translate a reqwest response head into wire-codec headers.
fn convert_headers(response: &reqwest::Response) -> ResponseHeaders {
    let status = response.status();
    let mut headers =
        ResponseHeaders::new(status.as_u16(), status.canonical_reason().unwrap_or(""));
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            headers.add(name.as_str(), value);
        }
    }
    headers
}

#[async_trait]
impl UrlFetcher for ReqwestUrlFetcher {
    async fn fetch(
        &self,
        request: RequestContext,
        handler: &mut dyn FetchHandler,
    ) -> FetchOutcome {
        let outcome = self.run(&request, handler).await;
        handler.done(outcome).await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_directive() {
        let options =
            HttpsOptions::parse_directive("enable,allow_self_signed").unwrap();
        assert!(options.enable);
        assert!(options.allow_self_signed);
        assert!(!options.allow_unknown_certificate_authority);
        assert!(options.accepts_invalid_certs());
    }

    #[test]
    fn test_parse_directive_empty_and_spaces() {
        let options = HttpsOptions::parse_directive(" enable , ").unwrap();
        assert!(options.enable);
        assert!(!options.accepts_invalid_certs());
    }

    #[test]
    fn test_parse_directive_rejects_unknown_token() {
        assert!(matches!(
            HttpsOptions::parse_directive("enable,bogus"),
            Err(Error::InvalidHttpsOption(t)) if t == "bogus"
        ));
    }

    #[test]
    fn test_invalid_proxy_is_a_config_error() {
        let timer: SharedTimer = std::sync::Arc::new(pagecore_base::timer::SystemTimer::new());
        let result = ReqwestUrlFetcher::builder()
            .with_proxy("::not a proxy::")
            .build(timer);
        assert!(matches!(result, Err(Error::InvalidProxy { .. })));
    }
}
