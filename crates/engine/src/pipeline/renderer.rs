//! Stage B rendering: open a profile page through a proxy in a headless
//! browser and capture its header.
//!
//! [`WebDriverRenderer`] speaks the W3C WebDriver protocol to a chromedriver
//! (or Selenium) endpoint. Chrome-specific commands go through the
//! `goog/cdp/execute` extension.

use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use handle_watch_domain::ProxyScheme;
use reqwest::{Client, Method};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::fingerprint::Fingerprint;
use crate::proxy_pool::ProxyEndpoint;

/// Localized "page not found" texts shown instead of a profile.
pub const NOT_FOUND_MARKERS: [&str; 4] = [
    "Sorry, this page isn't available",
    "Page Not Found",
    "Страница не найдена",
    "К сожалению, эта страница недоступна",
];

/// Selector present on a rendered profile.
pub const PROFILE_MARKER_SELECTOR: &str = "header section";

const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

const NAVIGATION_STATUS_SCRIPT: &str = "const nav = performance.getEntriesByType('navigation')[0]; \
     return nav && nav.responseStatus ? nav.responseStatus : 0;";

const BODY_TEXT_SCRIPT: &str = "return document.body ? document.body.innerText : '';";

const DISMISS_SCRIPT: &str = r#"
for (const dialog of document.querySelectorAll('[role="dialog"], [role="presentation"]')) { dialog.remove(); }
for (const el of document.querySelectorAll('div')) {
  const style = getComputedStyle(el);
  if (style.position === 'fixed' && parseInt(style.zIndex || '0', 10) > 1) { el.remove(); }
}
document.documentElement.style.overflow = 'auto';
document.body.style.overflow = 'auto';
return true;
"#;

#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub url: String,
    pub handle: String,
    pub proxy: ProxyEndpoint,
    pub fingerprint: Fingerprint,
    /// Reserved artifact file; the renderer overwrites it on success.
    pub output: PathBuf,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderVerdict {
    /// Profile rendered and the header was written to the output path.
    Profile,
    NotFound,
    HttpError(u16),
    MarkerTimeout,
    /// Redirected to a login or challenge wall.
    Challenge,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("browser transport error: {0}")]
    Transport(String),
    #[error("browser command timed out")]
    Timeout,
    #[error("artifact io error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ProfileRenderer: Send + Sync {
    async fn render(&self, request: RenderRequest) -> Result<RenderVerdict, RenderError>;
}

pub struct WebDriverRenderer {
    client: Client,
    base_url: String,
    poll_interval: Duration,
}

impl WebDriverRenderer {
    pub fn new(base_url: impl Into<String>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            // Per-command deadlines come from the request; this only bounds
            // a wedged driver.
            client: crate::client::build_client(Duration::from_secs(120))?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            poll_interval: Duration::from_millis(500),
        })
    }

    async fn command(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, RenderError> {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.client.request(method, url);
        if let Some(body) = body {
            builder = builder.json(&body);
        }
        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                RenderError::Timeout
            } else {
                RenderError::Transport(err.to_string())
            }
        })?;
        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|err| RenderError::Transport(err.to_string()))?;
        let value = payload.get("value").cloned().unwrap_or(Value::Null);
        if status.is_success() {
            return Ok(value);
        }
        let error = value.get("error").and_then(Value::as_str).unwrap_or("unknown error");
        if error == "timeout" || error == "script timeout" {
            return Err(RenderError::Timeout);
        }
        let message = value.get("message").and_then(Value::as_str).unwrap_or_default();
        Err(RenderError::Transport(format!("{error}: {message}")))
    }

    async fn open_session(&self, request: &RenderRequest) -> Result<String, RenderError> {
        if request.proxy.username.is_some() {
            warn!(
                proxy = %request.proxy.url(),
                "webdriver proxy capabilities cannot carry credentials; relying on ip allow-listing"
            );
        }
        let value = self
            .command(Method::POST, "/session", Some(session_capabilities(request)))
            .await?;
        value
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RenderError::Transport("driver returned no session id".into()))
    }

    async fn close_session(&self, session: &str) {
        if let Err(err) = self
            .command(Method::DELETE, &format!("/session/{session}"), None)
            .await
        {
            debug!(session, error = %err, "failed to close webdriver session");
        }
    }

    async fn cdp(&self, session: &str, cmd: &str, params: Value) {
        let body = json!({ "cmd": cmd, "params": params });
        if let Err(err) = self
            .command(Method::POST, &format!("/session/{session}/goog/cdp/execute"), Some(body))
            .await
        {
            debug!(session, cmd, error = %err, "cdp command failed");
        }
    }

    async fn execute(&self, session: &str, script: &str) -> Result<Value, RenderError> {
        self.command(
            Method::POST,
            &format!("/session/{session}/execute/sync"),
            Some(json!({ "script": script, "args": [] })),
        )
        .await
    }

    async fn find_marker(&self, session: &str) -> Result<Option<String>, RenderError> {
        let body = json!({ "using": "css selector", "value": PROFILE_MARKER_SELECTOR });
        match self
            .command(Method::POST, &format!("/session/{session}/element"), Some(body))
            .await
        {
            Ok(value) => Ok(value.get(ELEMENT_KEY).and_then(Value::as_str).map(str::to_string)),
            Err(RenderError::Transport(message)) if message.starts_with("no such element") => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn drive(&self, session: &str, request: &RenderRequest) -> Result<RenderVerdict, RenderError> {
        let started = Instant::now();
        let timeout_ms = request.timeout.as_millis() as u64;

        self.cdp(
            session,
            "Page.addScriptToEvaluateOnNewDocument",
            json!({ "source": request.fingerprint.init_script() }),
        )
        .await;
        self.cdp(
            session,
            "Emulation.setTimezoneOverride",
            json!({ "timezoneId": request.fingerprint.timezone }),
        )
        .await;
        self.command(
            Method::POST,
            &format!("/session/{session}/timeouts"),
            Some(json!({ "pageLoad": timeout_ms, "script": timeout_ms, "implicit": 0 })),
        )
        .await?;

        self.command(
            Method::POST,
            &format!("/session/{session}/url"),
            Some(json!({ "url": request.url })),
        )
        .await?;

        let current = self
            .command(Method::GET, &format!("/session/{session}/url"), None)
            .await?;
        if current.as_str().is_some_and(is_challenge_url) {
            return Ok(RenderVerdict::Challenge);
        }

        let status = self
            .execute(session, NAVIGATION_STATUS_SCRIPT)
            .await?
            .as_u64()
            .unwrap_or(0);
        if status == 404 {
            return Ok(RenderVerdict::NotFound);
        }
        if status >= 400 {
            return Ok(RenderVerdict::HttpError(status as u16));
        }

        let element = loop {
            if let Some(element) = self.find_marker(session).await? {
                break element;
            }
            let text = self.execute(session, BODY_TEXT_SCRIPT).await?;
            if text.as_str().is_some_and(has_not_found_marker) {
                return Ok(RenderVerdict::NotFound);
            }
            if started.elapsed() + self.poll_interval >= request.timeout {
                return Ok(RenderVerdict::MarkerTimeout);
            }
            tokio::time::sleep(self.poll_interval).await;
        };

        if let Err(err) = self.execute(session, DISMISS_SCRIPT).await {
            debug!(session, error = %err, "overlay dismissal failed");
        }

        let encoded = self
            .command(
                Method::GET,
                &format!("/session/{session}/element/{element}/screenshot"),
                None,
            )
            .await?;
        let bytes = STANDARD
            .decode(encoded.as_str().unwrap_or_default())
            .map_err(|err| RenderError::Transport(format!("invalid screenshot encoding: {err}")))?;
        tokio::fs::write(&request.output, bytes).await?;
        Ok(RenderVerdict::Profile)
    }
}

#[async_trait]
impl ProfileRenderer for WebDriverRenderer {
    /// Bounded by `request.timeout`. The session is deleted on every path,
    /// including when the caller drops this future.
    async fn render(&self, request: RenderRequest) -> Result<RenderVerdict, RenderError> {
        let session = match tokio::time::timeout(request.timeout, self.open_session(&request)).await {
            Ok(session) => session?,
            Err(_) => return Err(RenderError::Timeout),
        };
        let mut guard = SessionGuard {
            client: self.client.clone(),
            url: format!("{}/session/{session}", self.base_url),
            armed: true,
        };

        let verdict = match tokio::time::timeout(request.timeout, self.drive(&session, &request)).await {
            Ok(verdict) => verdict,
            Err(_) => {
                debug!(session, handle = request.handle, "render deadline reached");
                Err(RenderError::Timeout)
            }
        };
        guard.armed = false;
        self.close_session(&session).await;
        verdict
    }
}

/// Deletes a session whose render was cancelled before it could close it.
struct SessionGuard {
    client: Client,
    url: String,
    armed: bool,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let request = self.client.delete(std::mem::take(&mut self.url));
        runtime.spawn(async move {
            if let Err(err) = request.send().await {
                debug!(error = %err, "failed to close abandoned webdriver session");
            }
        });
    }
}

pub fn is_challenge_url(url: &str) -> bool {
    url.contains("/challenge") || url.contains("/accounts/login")
}

pub fn has_not_found_marker(text: &str) -> bool {
    NOT_FOUND_MARKERS.iter().any(|marker| text.contains(marker))
}

/// New-session payload: headless chrome shaped after the fingerprint and
/// routed through the proxy.
pub fn session_capabilities(request: &RenderRequest) -> Value {
    let device = &request.fingerprint.device;
    let address = format!("{}:{}", request.proxy.host, request.proxy.port);
    let proxy = match request.proxy.scheme {
        ProxyScheme::Socks5 => json!({
            "proxyType": "manual",
            "socksProxy": address,
            "socksVersion": 5,
        }),
        ProxyScheme::Http | ProxyScheme::Https => json!({
            "proxyType": "manual",
            "httpProxy": address,
            "sslProxy": address,
        }),
    };
    let args = vec![
        "--headless=new".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-blink-features=AutomationControlled".to_string(),
        format!("--window-size={},{}", device.viewport.0, device.viewport.1),
        format!("--lang={}", request.fingerprint.language),
        format!("--user-agent={}", device.user_agent),
    ];
    json!({
        "capabilities": {
            "alwaysMatch": {
                "browserName": "chrome",
                "pageLoadStrategy": "eager",
                "proxy": proxy,
                "goog:chromeOptions": {
                    "args": args,
                    "excludeSwitches": ["enable-automation"],
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::fingerprint::DEVICE_PRESETS;
    use std::{
        net::SocketAddr,
        sync::{Arc, Mutex},
    };
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };

    type RequestLog = Arc<Mutex<Vec<String>>>;

    /// Minimal chromedriver stand-in: hands out session `s1` and never
    /// answers navigation.
    async fn stalling_driver() -> (SocketAddr, RequestLog) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let log: RequestLog = Arc::default();
        let accept_log = log.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, accept_log.clone()));
            }
        });
        (addr, log)
    }

    async fn serve(mut stream: TcpStream, log: RequestLog) {
        while let Some((method, path)) = read_request(&mut stream).await {
            log.lock().unwrap().push(format!("{method} {path}"));
            if method == "POST" && path.ends_with("/url") {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                return;
            }
            let body = if method == "POST" && path == "/session" {
                r#"{"value":{"sessionId":"s1","capabilities":{}}}"#
            } else {
                r#"{"value":null}"#
            };
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
                body.len()
            );
            if stream.write_all(response.as_bytes()).await.is_err() {
                return;
            }
        }
    }

    async fn read_request(stream: &mut TcpStream) -> Option<(String, String)> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        let header_end = loop {
            if let Some(pos) = buf.windows(4).position(|window| window == b"\r\n\r\n") {
                break pos + 4;
            }
            let read = stream.read(&mut chunk).await.ok()?;
            if read == 0 {
                return None;
            }
            buf.extend_from_slice(&chunk[..read]);
        };
        let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let length = head
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        while buf.len() < header_end + length {
            let read = stream.read(&mut chunk).await.ok()?;
            if read == 0 {
                return None;
            }
            buf.extend_from_slice(&chunk[..read]);
        }
        let mut parts = head.split_whitespace();
        Some((parts.next()?.to_string(), parts.next()?.to_string()))
    }

    fn count(log: &RequestLog, entry: &str) -> usize {
        log.lock().unwrap().iter().filter(|line| *line == entry).count()
    }

    fn request(scheme: ProxyScheme) -> RenderRequest {
        RenderRequest {
            url: "https://www.instagram.com/alice/".into(),
            handle: "alice".into(),
            proxy: ProxyEndpoint {
                scheme,
                host: "10.0.0.1".into(),
                port: 1080,
                username: None,
                password: None,
            },
            fingerprint: Fingerprint {
                device: DEVICE_PRESETS[2],
                timezone: "Europe/London",
                language: "en-GB",
                noise_seed: 1,
                audio_offset: 0.0002,
            },
            output: PathBuf::from("/tmp/alice.png"),
            timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn socks_proxies_use_socks_capability() {
        let caps = session_capabilities(&request(ProxyScheme::Socks5));
        let proxy = &caps["capabilities"]["alwaysMatch"]["proxy"];
        assert_eq!(proxy["socksProxy"], "10.0.0.1:1080");
        assert_eq!(proxy["socksVersion"], 5);
        assert!(proxy.get("httpProxy").is_none());
    }

    #[test]
    fn http_proxies_cover_tls_too() {
        let caps = session_capabilities(&request(ProxyScheme::Http));
        let always = &caps["capabilities"]["alwaysMatch"];
        assert_eq!(always["proxy"]["sslProxy"], "10.0.0.1:1080");
        let args = always["goog:chromeOptions"]["args"].as_array().unwrap();
        assert!(args.iter().any(|arg| arg == "--window-size=1920,1080"));
        assert!(args.iter().any(|arg| arg == "--lang=en-GB"));
    }

    #[tokio::test]
    async fn timed_out_render_deletes_its_session() {
        let (addr, log) = stalling_driver().await;
        let renderer = WebDriverRenderer::new(format!("http://{addr}")).unwrap();
        let mut req = request(ProxyScheme::Http);
        req.timeout = Duration::from_secs(1);

        let verdict = renderer.render(req).await;
        assert!(matches!(verdict, Err(RenderError::Timeout)), "{verdict:?}");
        assert_eq!(count(&log, "POST /session"), 1);
        assert_eq!(count(&log, "POST /session/s1/url"), 1);
        assert_eq!(count(&log, "DELETE /session/s1"), 1);
    }

    #[tokio::test]
    async fn cancelled_render_deletes_its_session() {
        let (addr, log) = stalling_driver().await;
        let renderer = WebDriverRenderer::new(format!("http://{addr}")).unwrap();
        let req = request(ProxyScheme::Http);

        let cancelled = tokio::time::timeout(Duration::from_millis(500), renderer.render(req)).await;
        assert!(cancelled.is_err());

        for _ in 0..40 {
            if count(&log, "DELETE /session/s1") > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(count(&log, "POST /session"), 1);
        assert_eq!(count(&log, "DELETE /session/s1"), 1);
    }

    #[test]
    fn page_markers() {
        assert!(is_challenge_url("https://www.instagram.com/challenge/?next=/alice/"));
        assert!(is_challenge_url("https://www.instagram.com/accounts/login/?next=%2Falice%2F"));
        assert!(!is_challenge_url("https://www.instagram.com/alice/"));
        assert!(has_not_found_marker("Sorry, this page isn't available.\nThe link you followed may be broken"));
        assert!(has_not_found_marker("Страница не найдена"));
        assert!(!has_not_found_marker("alice • Instagram photos and videos"));
    }
}
