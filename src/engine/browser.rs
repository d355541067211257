//! Headless browser slots.
//!
//! The engine owns a fixed number of slots; the workers assigned to a slot
//! share its browser. Browsers launch lazily (a fully static site never
//! starts one) and a slot can be recovered in place when the CDP connection
//! dies mid-crawl. Recovery is single-flight per slot: the first worker to
//! hit a closed browser relaunches it while the others wait on the same
//! lock and then observe the fresh generation.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chromiumoxide::browser::{Browser, BrowserConfigBuilder, HeadlessMode};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::utils::constants::CHROME_USER_AGENT;

/// A launched browser plus the task driving its CDP connection.
struct BrowserHandle {
    browser: Arc<Browser>,
    handler_task: JoinHandle<()>,
    user_data_dir: PathBuf,
}

impl BrowserHandle {
    async fn close(mut self) {
        self.handler_task.abort();
        if let Some(browser) = Arc::get_mut(&mut self.browser) {
            if let Err(e) = browser.close().await {
                debug!("Browser close failed: {e}");
            }
            let _ = browser.wait().await;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.user_data_dir) {
            trace!("Profile dir cleanup failed: {e}");
        }
    }
}

/// One shared browser slot.
pub struct BrowserSlot {
    index: usize,
    headless: bool,
    inner: tokio::sync::Mutex<Option<BrowserHandle>>,
    /// Serializes recovery; bumped generation lets waiters skip a second
    /// relaunch.
    recovery: tokio::sync::Mutex<()>,
    generation: AtomicU64,
}

impl BrowserSlot {
    pub fn new(index: usize, headless: bool) -> Self {
        Self {
            index,
            headless,
            inner: tokio::sync::Mutex::new(None),
            recovery: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Generation counter, bumped on every (re)launch.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Get the slot's browser, launching it on first use.
    pub async fn browser(&self) -> Result<Arc<Browser>> {
        let mut inner = self.inner.lock().await;
        if let Some(handle) = inner.as_ref() {
            return Ok(Arc::clone(&handle.browser));
        }
        let handle = launch_slot_browser(self.index, self.headless).await?;
        let browser = Arc::clone(&handle.browser);
        *inner = Some(handle);
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(browser)
    }

    /// Replace a dead browser. `seen_generation` is the generation the
    /// caller was using when it failed; if another worker already recovered
    /// past it, this returns immediately.
    pub async fn recover(&self, seen_generation: u64) -> Result<()> {
        let _flight = self.recovery.lock().await;
        if self.generation() != seen_generation {
            debug!("Slot {} already recovered by a peer", self.index);
            return Ok(());
        }

        warn!("Recovering browser slot {}", self.index);
        let old = self.inner.lock().await.take();
        if let Some(handle) = old {
            handle.close().await;
        }

        let handle = launch_slot_browser(self.index, self.headless).await?;
        *self.inner.lock().await = Some(handle);
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Close the slot's browser if it was ever launched.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.inner.lock().await.take() {
            handle.close().await;
        }
    }
}

async fn launch_slot_browser(index: usize, headless: bool) -> Result<BrowserHandle> {
    let user_data_dir = std::env::temp_dir().join(format!(
        "sitevault_chrome_{}_{}_{}",
        std::process::id(),
        index,
        uuid::Uuid::new_v4().simple()
    ));
    let (browser, handler_task) = launch_browser(headless, user_data_dir.clone()).await?;
    Ok(BrowserHandle {
        browser: Arc::new(browser),
        handler_task,
        user_data_dir,
    })
}

/// Binary names a Chromium build ships under, preferred order. Each is
/// tried in every search directory and every `$PATH` entry.
const BROWSER_BINARIES: &[&str] = &[
    "google-chrome-stable",
    "google-chrome",
    "chromium",
    "chromium-browser",
    "chrome",
];

/// Build the ordered candidate list: any paths supplied through
/// `SITEVAULT_BROWSER` (colon-separated) win, then macOS app bundles, then
/// the binary names crossed with a few vendor directories and the `$PATH`.
fn browser_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    if let Ok(configured) = std::env::var("SITEVAULT_BROWSER") {
        candidates.extend(
            configured
                .split(':')
                .filter(|entry| !entry.is_empty())
                .map(PathBuf::from),
        );
    }

    if cfg!(target_os = "macos") {
        for app in ["Google Chrome", "Chromium"] {
            candidates.push(PathBuf::from(format!(
                "/Applications/{app}.app/Contents/MacOS/{app}"
            )));
        }
    }

    let mut search_dirs: Vec<PathBuf> = ["/opt/google/chrome", "/snap/bin"]
        .iter()
        .map(PathBuf::from)
        .collect();
    if let Some(path_var) = std::env::var_os("PATH") {
        search_dirs.extend(std::env::split_paths(&path_var));
    }

    for dir in search_dirs {
        for name in BROWSER_BINARIES {
            candidates.push(dir.join(name));
        }
    }

    candidates
}

/// Locate a Chromium executable: the first candidate that is a real file.
pub fn find_browser_executable() -> Result<PathBuf> {
    for candidate in browser_candidates() {
        if candidate.is_file() {
            info!("Using browser executable {}", candidate.display());
            return Ok(candidate);
        }
    }
    Err(anyhow::anyhow!(
        "no usable Chromium install; point SITEVAULT_BROWSER at one"
    ))
}

/// Launch one browser with the stealth argument set and spawn the handler
/// task that drives its CDP connection.
pub async fn launch_browser(
    headless: bool,
    user_data_dir: PathBuf,
) -> Result<(Browser, JoinHandle<()>)> {
    let chrome_path = find_browser_executable()?;

    std::fs::create_dir_all(&user_data_dir).context("failed to create browser profile dir")?;

    let mut config_builder = BrowserConfigBuilder::default()
        .request_timeout(Duration::from_secs(30))
        .window_size(1920, 1080)
        .user_data_dir(user_data_dir)
        .chrome_executable(chrome_path);

    if headless {
        config_builder = config_builder.headless_mode(HeadlessMode::default());
    } else {
        config_builder = config_builder.with_head();
    }

    config_builder = config_builder
        .arg(format!("--user-agent={CHROME_USER_AGENT}"))
        .arg("--disable-blink-features=AutomationControlled")
        .arg("--disable-infobars")
        .arg("--disable-notifications")
        .arg("--disable-extensions")
        .arg("--disable-background-networking")
        .arg("--disable-background-timer-throttling")
        .arg("--disable-breakpad")
        .arg("--disable-hang-monitor")
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--no-sandbox")
        .arg("--ignore-certificate-errors")
        .arg("--metrics-recording-only")
        .arg("--password-store=basic")
        .arg("--use-mock-keychain")
        .arg("--hide-scrollbars")
        .arg("--mute-audio");

    let browser_config = config_builder
        .build()
        .map_err(|e| anyhow::anyhow!("failed to build browser config: {e}"))?;

    let (browser, mut handler) = Browser::launch(browser_config)
        .await
        .context("failed to launch browser")?;

    let handler_task = tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            let Err(e) = event else { continue };
            let message = e.to_string();
            if is_cdp_protocol_noise(&message) {
                trace!("ignoring CDP protocol mismatch: {message}");
            } else {
                warn!("browser handler error: {message}");
            }
        }
        debug!("browser handler drained");
    });

    Ok((browser, handler_task))
}

/// Chrome streams CDP events newer than the protocol model chromiumoxide
/// was generated against; the resulting decode failures are noise, not
/// faults.
fn is_cdp_protocol_noise(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    lowered.contains("deserialize") || lowered.contains("untagged enum")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_paths_come_first() {
        std::env::set_var("SITEVAULT_BROWSER", "/srv/bin/one:/srv/bin/two");
        let candidates = browser_candidates();
        std::env::remove_var("SITEVAULT_BROWSER");

        assert_eq!(candidates[0], PathBuf::from("/srv/bin/one"));
        assert_eq!(candidates[1], PathBuf::from("/srv/bin/two"));
    }

    #[test]
    fn path_entries_are_crossed_with_binary_names() {
        let candidates = browser_candidates();
        // Every binary name must appear somewhere in the product.
        for name in BROWSER_BINARIES {
            assert!(
                candidates.iter().any(|c| c.file_name().is_some_and(|f| f == *name)),
                "missing candidates for {name}"
            );
        }
    }

    #[test]
    fn protocol_noise_filter_matches_decode_failures_only() {
        assert!(is_cdp_protocol_noise(
            "data did not match any variant of untagged enum Message"
        ));
        assert!(is_cdp_protocol_noise("failed to deserialize WS response"));
        assert!(!is_cdp_protocol_noise("websocket connection error"));
        assert!(!is_cdp_protocol_noise("browser has been closed"));
    }
}
