use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use headless_chrome::browser::tab::Tab;
use headless_chrome::{Browser, LaunchOptions};
use once_cell::sync::Lazy;
use serde::Serialize;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::config::Config;
use crate::error::SolverError;
use crate::pool::{BrowserPool, PoolStatus};

pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Substring of the final URL that signals the challenge cleared and
/// the real catalog page loaded. Site-specific and brittle; there is
/// no fallback detection.
pub const SUCCESS_MARKER: &str = "ssd=";

/// Title fragments served by the anti-bot interstitial.
const CHALLENGE_MARKERS: &[&str] = &["Just a moment", "Checking your browser"];

const CHROME_ARGS: &[&str] = &[
    "--no-sandbox",
    "--disable-setuid-sandbox",
    "--disable-dev-shm-usage",
    "--disable-blink-features=AutomationControlled",
    "--disable-features=IsolateOrigins,site-per-process",
    "--disable-web-security",
    "--disable-gpu",
    "--no-first-run",
    "--disable-accelerated-2d-canvas",
    "--disable-dev-profile",
    "--memory-pressure-off",
    "--disable-background-timer-throttling",
    "--disable-backgrounding-occluded-windows",
    "--disable-renderer-backgrounding",
];

// Runs before any page script: hides the automation signals the
// challenge page probes for.
const STEALTH_SCRIPT: &str = r#"
    Object.defineProperty(navigator, 'webdriver', {
        get: () => undefined
    });

    window.chrome = {
        runtime: {},
        loadTimes: function() {},
        csi: function() {},
        app: {}
    };

    Object.defineProperty(navigator, 'plugins', {
        get: () => [1, 2, 3, 4, 5]
    });

    Object.defineProperty(navigator, 'languages', {
        get: () => ['en-US', 'en']
    });
"#;

static EXTRA_HEADERS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        (
            "Accept",
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
        ),
        ("Accept-Language", "en-US,en;q=0.9"),
        ("Accept-Encoding", "gzip, deflate, br"),
        ("DNT", "1"),
        ("Connection", "keep-alive"),
        ("Upgrade-Insecure-Requests", "1"),
    ])
});

#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub nav_timeout: Duration,
    pub poll_interval: Duration,
    pub poll_max_attempts: u32,
    pub settle_delay: Duration,
}

impl From<&Config> for ScrapeConfig {
    fn from(cfg: &Config) -> Self {
        ScrapeConfig {
            nav_timeout: cfg.nav_timeout,
            poll_interval: cfg.poll_interval,
            poll_max_attempts: cfg.poll_max_attempts,
            settle_delay: cfg.settle_delay,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CookieData {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub expires: f64,
    pub http_only: bool,
    pub secure: bool,
}

impl From<headless_chrome::protocol::cdp::Network::Cookie> for CookieData {
    fn from(c: headless_chrome::protocol::cdp::Network::Cookie) -> Self {
        CookieData {
            name: c.name,
            value: c.value,
            domain: c.domain,
            path: c.path,
            expires: c.expires,
            http_only: c.http_only,
            secure: c.secure,
        }
    }
}

/// Everything captured from one successful navigation.
#[derive(Debug, Clone)]
pub struct ScrapePayload {
    pub url: String,
    pub html: String,
    pub cookies: Vec<CookieData>,
    pub has_ssd: bool,
    pub elapsed_ms: u64,
}

/// Seam between the clearance loop and a live page, so the loop can
/// be driven by a fake in tests.
pub trait PageProbe {
    fn current_url(&self) -> String;
    fn current_title(&self) -> String;
}

impl PageProbe for Tab {
    fn current_url(&self) -> String {
        self.get_url()
    }

    fn current_title(&self) -> String {
        self.get_title().unwrap_or_default()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Clearance {
    /// Loop exited early. `with_marker` is true when the success
    /// marker showed up in the URL, false when the challenge title
    /// simply went away.
    Cleared { with_marker: bool },
    /// Attempt budget ran out with the challenge still up.
    Exhausted,
}

pub fn is_challenge_title(title: &str) -> bool {
    CHALLENGE_MARKERS.iter().any(|m| title.contains(m))
}

/// Bounded fixed-interval poll: exit as soon as the URL carries the
/// success marker or the title stops looking like a challenge page.
/// The first check happens before any sleep.
pub fn wait_for_clearance<P: PageProbe + ?Sized>(
    probe: &P,
    interval: Duration,
    max_attempts: u32,
) -> Clearance {
    for attempt in 1..=max_attempts {
        if probe.current_url().contains(SUCCESS_MARKER) {
            debug!("✅ Found success marker after {} attempt(s)", attempt);
            return Clearance::Cleared { with_marker: true };
        }
        if !is_challenge_title(&probe.current_title()) {
            return Clearance::Cleared { with_marker: false };
        }
        if attempt % 5 == 0 {
            debug!("⏳ Still waiting... attempt {}/{}", attempt, max_attempts);
        }
        if attempt < max_attempts {
            std::thread::sleep(interval);
        }
    }
    Clearance::Exhausted
}

/// One scrape attempt on a leased browser. No internal retries; the
/// tab is closed on every path.
pub fn scrape(browser: &Browser, url: &str, cfg: &ScrapeConfig) -> Result<ScrapePayload, SolverError> {
    let started = Instant::now();
    let tab = browser
        .new_tab()
        .map_err(|e| SolverError::Browser(e.to_string()))?;

    let result = navigate_and_capture(&tab, url, cfg, started);

    // Cleanup failures are swallowed; the pool recycles leaky
    // browsers by usage count anyway.
    let _ = tab.close(true);

    result
}

fn navigate_and_capture(
    tab: &Arc<Tab>,
    url: &str,
    cfg: &ScrapeConfig,
    started: Instant,
) -> Result<ScrapePayload, SolverError> {
    tab.set_default_timeout(cfg.nav_timeout);
    tab.set_user_agent(USER_AGENT, Some("en-US,en;q=0.9"), Some("Win32"))
        .map_err(|e| SolverError::Browser(e.to_string()))?;
    apply_stealth(tab).map_err(|e| SolverError::Browser(e.to_string()))?;
    tab.set_extra_http_headers(EXTRA_HEADERS.clone())
        .map_err(|e| SolverError::Browser(e.to_string()))?;

    tab.navigate_to(url)
        .map_err(|e| SolverError::Navigation(e.to_string()))?;
    tab.wait_until_navigated()
        .map_err(|e| SolverError::Navigation(e.to_string()))?;

    let title = tab.current_title();
    if is_challenge_title(&title) {
        info!("☁️ Challenge page detected, waiting...");
        match wait_for_clearance(tab.as_ref(), cfg.poll_interval, cfg.poll_max_attempts) {
            Clearance::Cleared { with_marker } => {
                debug!("Challenge cleared (marker: {})", with_marker)
            }
            Clearance::Exhausted => {
                warn!("⚠️ Challenge wait exhausted, returning page as-is")
            }
        }
    }

    // Best-effort settle so late redirect content lands.
    std::thread::sleep(cfg.settle_delay);

    let final_url = tab.get_url();
    let html = tab
        .get_content()
        .map_err(|e| SolverError::Navigation(e.to_string()))?;
    let cookies = tab
        .get_cookies()
        .map_err(|e| SolverError::Browser(e.to_string()))?
        .into_iter()
        .map(CookieData::from)
        .collect();

    let elapsed_ms = started.elapsed().as_millis() as u64;
    debug!("⏱️ Completed in {}ms", elapsed_ms);

    Ok(ScrapePayload {
        has_ssd: final_url.contains(SUCCESS_MARKER),
        url: final_url,
        html,
        cookies,
        elapsed_ms,
    })
}

fn apply_stealth(tab: &Arc<Tab>) -> anyhow::Result<()> {
    tab.enable_debugger()?;
    tab.call_method(
        headless_chrome::protocol::cdp::Page::AddScriptToEvaluateOnNewDocument {
            source: STEALTH_SCRIPT.to_string(),
            world_name: None,
            include_command_line_api: None,
            run_immediately: None,
        },
    )?;
    Ok(())
}

/// Launch one pooled Chrome process with the service's fixed argument
/// set, plus proxy and binary-path passthrough from the environment.
pub fn launch_browser(cfg: &Config) -> anyhow::Result<Browser> {
    let args: Vec<&OsStr> = CHROME_ARGS.iter().map(OsStr::new).collect();

    let mut builder = LaunchOptions::default_builder();
    builder
        .headless(true)
        .window_size(Some((1366, 768)))
        // Keep the CDP websocket alive through long challenge waits.
        .idle_browser_timeout(Duration::from_secs(3600))
        .args(args);

    if let Some(proxy) = cfg.proxy_server.as_deref() {
        info!("Using proxy: {}", proxy);
        builder.proxy_server(Some(proxy));
    }
    if let Some(path) = cfg.chrome_path.as_deref() {
        info!("Using custom browser binary: {}", path);
        builder.path(Some(PathBuf::from(path)));
    }

    let options = builder
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build launch options: {}", e))?;
    let browser = Browser::new(options)?;
    Ok(browser)
}

/// What the HTTP layer needs from the scraping side: one attempt per
/// call, plus pool introspection for /health.
pub trait Solver: Send + Sync {
    fn solve(&self, url: &str) -> Result<ScrapePayload, SolverError>;
    fn occupancy(&self) -> PoolStatus;
    fn recycle_count(&self) -> u64;
}

/// Production solver: lease a pooled Chrome, run one scrape attempt,
/// release on drop.
pub struct ChromeSolver {
    pool: Arc<BrowserPool<Browser>>,
    cfg: ScrapeConfig,
}

impl ChromeSolver {
    pub fn new(pool: Arc<BrowserPool<Browser>>, cfg: ScrapeConfig) -> Self {
        ChromeSolver { pool, cfg }
    }
}

impl Solver for ChromeSolver {
    fn solve(&self, url: &str) -> Result<ScrapePayload, SolverError> {
        let lease = self.pool.lease()?;
        debug!("🔒 Leased browser slot {}", lease.slot_id());
        scrape(lease.browser(), url, &self.cfg)
    }

    fn occupancy(&self) -> PoolStatus {
        self.pool.occupancy()
    }

    fn recycle_count(&self) -> u64 {
        self.pool.recycle_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;

    struct FakeProbe {
        url: &'static str,
        titles: RefCell<VecDeque<&'static str>>,
        url_checks: Cell<u32>,
    }

    impl FakeProbe {
        fn new(url: &'static str, titles: &[&'static str]) -> Self {
            FakeProbe {
                url,
                titles: RefCell::new(titles.iter().copied().collect()),
                url_checks: Cell::new(0),
            }
        }
    }

    impl PageProbe for FakeProbe {
        fn current_url(&self) -> String {
            self.url_checks.set(self.url_checks.get() + 1);
            self.url.to_string()
        }

        fn current_title(&self) -> String {
            let mut titles = self.titles.borrow_mut();
            if titles.len() > 1 {
                titles.pop_front().unwrap().to_string()
            } else {
                titles.front().copied().unwrap_or("").to_string()
            }
        }
    }

    #[test]
    fn marker_url_exits_on_first_check() {
        let probe = FakeProbe::new(
            "https://example.test/catalog/genuine/vehicle?ssd=abc123",
            &["Just a moment..."],
        );
        let outcome = wait_for_clearance(&probe, Duration::ZERO, 10);
        assert_eq!(outcome, Clearance::Cleared { with_marker: true });
        assert_eq!(probe.url_checks.get(), 1);
    }

    #[test]
    fn stuck_challenge_exhausts_the_attempt_budget() {
        let probe = FakeProbe::new("https://example.test/", &["Just a moment..."]);
        let outcome = wait_for_clearance(&probe, Duration::ZERO, 7);
        assert_eq!(outcome, Clearance::Exhausted);
        assert_eq!(probe.url_checks.get(), 7);
    }

    #[test]
    fn title_clearing_ends_the_wait_without_marker() {
        let probe = FakeProbe::new(
            "https://example.test/",
            &["Just a moment...", "Checking your browser", "Parts Catalog"],
        );
        let outcome = wait_for_clearance(&probe, Duration::ZERO, 10);
        assert_eq!(outcome, Clearance::Cleared { with_marker: false });
        assert_eq!(probe.url_checks.get(), 3);
    }

    #[test]
    fn zero_attempts_is_exhausted() {
        let probe = FakeProbe::new("https://example.test/?ssd=1", &[""]);
        assert_eq!(
            wait_for_clearance(&probe, Duration::ZERO, 0),
            Clearance::Exhausted
        );
    }

    #[test]
    fn challenge_titles_are_recognized() {
        assert!(is_challenge_title("Just a moment..."));
        assert!(is_challenge_title("Checking your browser before accessing"));
        assert!(!is_challenge_title("Parts Catalog - Vehicle Search"));
        assert!(!is_challenge_title(""));
    }
}
