//! The DOM-coupled surface of recwatch: session login, frame location,
//! recording extraction, and the live room sensor.
//!
//! Everything that touches the LMS page structure lives here, behind narrow
//! seams (`FrameScan`, `RoomSensor`), so the orchestration and ledger logic
//! never see a WebDriver type and the fragile parts can be stubbed in tests.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use recwatch_core::{parse_recording_date, HarvestTask, RecordingEntry, Settings, LINK_UNAVAILABLE};
use thirtyfour::error::WebDriverError;
use thirtyfour::prelude::*;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum BrowserError {
    #[error(transparent)]
    WebDriver(#[from] WebDriverError),
    #[error("{0}")]
    Message(String),
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("authenticated route not reached within {waited_secs}s")]
    Timeout { waited_secs: u64 },
    #[error("login flow failed: {0}")]
    Failed(String),
    #[error(transparent)]
    Browser(#[from] BrowserError),
}

impl From<WebDriverError> for AuthError {
    fn from(err: WebDriverError) -> Self {
        Self::Browser(BrowserError::WebDriver(err))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("no frame showed {marker:?} after {attempts} attempts")]
    NotFound { marker: String, attempts: u32 },
    #[error(transparent)]
    Scan(#[from] BrowserError),
}

#[derive(Debug, thiserror::Error)]
pub enum CourseError {
    #[error("room link not found on the course outline")]
    RoomNotFound,
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Browser(#[from] BrowserError),
}

impl From<WebDriverError> for CourseError {
    fn from(err: WebDriverError) -> Self {
        Self::Browser(BrowserError::WebDriver(err))
    }
}

/// Index of a located iframe within the page's current frame list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHandle(pub usize);

/// One scan pass over the currently attached frames. Implemented against the
/// live page below; tests substitute their own.
#[async_trait]
pub trait FrameScan {
    async fn scan(&self, marker: &str) -> Result<Option<FrameHandle>, BrowserError>;
}

/// Poll for the frame hosting `marker`. Widgets mount their real content in a
/// sub-document that loads well after the parent page settles, so a single
/// lookup is unreliable; bounded polling is what keeps one slow course from
/// hanging the whole batch.
pub async fn locate_frame<S: FrameScan + ?Sized>(
    scan: &S,
    marker: &str,
    max_attempts: u32,
    poll_interval: Duration,
) -> Result<FrameHandle, FrameError> {
    for attempt in 0..max_attempts {
        if let Some(handle) = scan.scan(marker).await? {
            return Ok(handle);
        }
        if attempt + 1 < max_attempts {
            tokio::time::sleep(poll_interval).await;
        }
    }
    Err(FrameError::NotFound {
        marker: marker.to_string(),
        attempts: max_attempts,
    })
}

/// Outcome of one live-room check, before it becomes a monitor state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomProbe {
    Recording,
    NotDetected,
    RoomMissing,
    FrameUnresolved,
    Failed(String),
}

#[async_trait]
pub trait RoomSensor {
    async fn probe(&self, internal_id: &str) -> RoomProbe;
}

async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

fn xpath_literal(text: &str) -> String {
    if !text.contains('\'') {
        format!("'{text}'")
    } else if !text.contains('"') {
        format!("\"{text}\"")
    } else {
        let parts: Vec<String> = text.split('\'').map(|part| format!("'{part}'")).collect();
        format!("concat({})", parts.join(", \"'\", "))
    }
}

/// First element whose own text contains `marker` and which is actually
/// rendered. Searches the driver's current frame context.
async fn first_visible_with_text(
    driver: &WebDriver,
    marker: &str,
) -> Result<Option<WebElement>, BrowserError> {
    let xpath = format!(
        "//*[text()[contains(normalize-space(.), {})]]",
        xpath_literal(marker)
    );
    let candidates = driver.find_all(By::XPath(xpath.as_str())).await?;
    for candidate in candidates {
        // a candidate can go stale mid-check; treat that as not visible
        if candidate.is_displayed().await.unwrap_or(false) {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

/// Frame scanner over the live page: enumerates the attached iframes and
/// tests each one for a visible `marker`.
pub struct PageFrameScan<'a> {
    driver: &'a WebDriver,
}

impl<'a> PageFrameScan<'a> {
    pub fn new(driver: &'a WebDriver) -> Self {
        Self { driver }
    }
}

#[async_trait]
impl FrameScan for PageFrameScan<'_> {
    async fn scan(&self, marker: &str) -> Result<Option<FrameHandle>, BrowserError> {
        self.driver.enter_default_frame().await?;
        let frames = self.driver.find_all(By::Tag("iframe")).await?;
        for (index, frame) in frames.into_iter().enumerate() {
            if frame.enter_frame().await.is_err() {
                // detached between enumeration and switch
                self.driver.enter_default_frame().await?;
                continue;
            }
            let hit = first_visible_with_text(self.driver, marker)
                .await
                .map(|found| found.is_some())
                .unwrap_or(false);
            self.driver.enter_default_frame().await?;
            if hit {
                return Ok(Some(FrameHandle(index)));
            }
        }
        Ok(None)
    }
}

/// An authenticated browser session against the LMS, driven through a
/// WebDriver endpoint. One instance per run; never shared.
pub struct LmsBrowser<'a> {
    driver: WebDriver,
    settings: &'a Settings,
}

impl<'a> LmsBrowser<'a> {
    /// Launch a browser window. `profile` points at the persisted profile
    /// directory that keeps the session alive across runs; pass `None` for a
    /// throwaway context (the cookie-minting path).
    pub async fn launch(settings: &'a Settings, profile: Option<&Path>) -> Result<Self, BrowserError> {
        let mut caps = DesiredCapabilities::chrome();
        caps.add_arg("--start-maximized")?;
        // lets page script read back what the copy action wrote
        caps.add_arg("--disable-web-security")?;
        if settings.webdriver.headless {
            caps.add_arg("--headless=new")?;
        }
        if let Some(dir) = profile {
            caps.add_arg(&format!("--user-data-dir={}", dir.display()))?;
        }
        let driver = WebDriver::new(&settings.webdriver.url, caps).await?;
        Ok(Self { driver, settings })
    }

    pub fn driver(&self) -> &WebDriver {
        &self.driver
    }

    pub async fn quit(self) -> Result<(), BrowserError> {
        self.driver.quit().await?;
        Ok(())
    }

    async fn at_authenticated_route(&self) -> Result<bool, BrowserError> {
        let url = self.driver.current_url().await?;
        Ok(url
            .as_str()
            .contains(&self.settings.lms.urls.authenticated_fragment))
    }

    async fn visible_by_text(&self, marker: &str) -> Result<Option<WebElement>, BrowserError> {
        first_visible_with_text(&self.driver, marker).await
    }

    /// Drive the credential login. Short-circuits when the persisted profile
    /// still carries a valid session; otherwise fills the form and waits out
    /// the (optional, manually approved) multi-factor confirmation.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<(), AuthError> {
        let urls = &self.settings.lms.urls;
        let timing = &self.settings.timing;

        info!("opening the login entry point");
        self.driver.goto(&urls.login).await?;
        sleep_ms(timing.login_settle_ms).await;
        if self.at_authenticated_route().await? {
            info!("session from the persisted profile is still valid");
            return Ok(());
        }

        let markers = &self.settings.lms.markers;
        if let Some(role) = self.visible_by_text(&markers.role_button).await? {
            role.click().await?;
        }

        let selectors = &self.settings.lms.selectors;
        let user_field = self
            .driver
            .query(By::Css(selectors.user_input.as_str()))
            .wait(Duration::from_secs(10), Duration::from_millis(500))
            .first()
            .await
            .map_err(|_| AuthError::Failed("login form never appeared".to_string()))?;
        user_field.send_keys(username).await?;
        self.driver
            .find(By::Css(selectors.pass_input.as_str()))
            .await?
            .send_keys(password)
            .await?;
        self.driver
            .find(By::Css(selectors.login_button.as_str()))
            .await?
            .click()
            .await?;

        // some sessions skip the multi-factor step entirely
        match self
            .driver
            .query(By::Css(selectors.mfa_confirm.as_str()))
            .wait(
                Duration::from_millis(timing.mfa_wait_ms),
                Duration::from_millis(500),
            )
            .first()
            .await
        {
            Ok(button) => {
                button.click().await?;
                warn!("confirm the sign-in on your device");
            }
            Err(_) => debug!("no multi-factor prompt this session"),
        }

        let started = Instant::now();
        let bound = Duration::from_millis(timing.auth_wait_ms);
        loop {
            if self.at_authenticated_route().await? {
                info!("authenticated");
                return Ok(());
            }
            if started.elapsed() >= bound {
                return Err(AuthError::Timeout {
                    waited_secs: bound.as_secs(),
                });
            }
            sleep_ms(1_000).await;
        }
    }

    /// All session cookies as one `name=value; ...` header, for replaying the
    /// browser session against the membership API after the window closes.
    pub async fn cookie_header(&self) -> Result<String, BrowserError> {
        let cookies = self.driver.get_all_cookies().await?;
        Ok(cookies
            .into_iter()
            .map(|cookie| format!("{}={}", cookie.name, cookie.value))
            .collect::<Vec<_>>()
            .join("; "))
    }

    async fn open_course_outline(&self, internal_id: &str) -> Result<(), BrowserError> {
        let url = self.settings.lms.urls.course_outline_url(internal_id);
        self.driver.goto(&url).await?;
        sleep_ms(self.settings.timing.nav_settle_ms).await;
        Ok(())
    }

    /// The room link sits inside a collapsible folder on some outlines;
    /// expand it when the link is not directly visible.
    async fn reveal_room_link(&self) -> Result<Option<WebElement>, BrowserError> {
        let markers = &self.settings.lms.markers;
        if let Some(link) = self.visible_by_text(&markers.room_link).await? {
            return Ok(Some(link));
        }
        if let Some(folder) = self.visible_by_text(&markers.room_folder).await? {
            debug!("expanding the conference-room folder");
            folder.click().await?;
            sleep_ms(self.settings.timing.folder_settle_ms).await;
        }
        self.visible_by_text(&markers.room_link).await
    }

    async fn enter_frame(&self, handle: FrameHandle) -> Result<(), BrowserError> {
        self.driver.enter_default_frame().await?;
        let frames = self.driver.find_all(By::Tag("iframe")).await?;
        let frame = frames.into_iter().nth(handle.0).ok_or_else(|| {
            BrowserError::Message(format!("frame {} detached before entry", handle.0))
        })?;
        frame.enter_frame().await?;
        Ok(())
    }

    async fn leave_frames(&self) -> Result<(), BrowserError> {
        self.driver.enter_default_frame().await?;
        Ok(())
    }

    async fn write_clipboard(&self, text: &str) -> Result<(), BrowserError> {
        self.driver
            .execute_async(
                "const done = arguments[arguments.length - 1]; \
                 navigator.clipboard.writeText(arguments[0])\
                 .then(() => done(true)).catch(() => done(false));",
                vec![serde_json::Value::String(text.to_string())],
            )
            .await?;
        Ok(())
    }

    async fn read_clipboard(&self) -> Result<String, BrowserError> {
        let ret = self
            .driver
            .execute_async(
                "const done = arguments[arguments.length - 1]; \
                 navigator.clipboard.readText().then(done).catch(() => done(''));",
                Vec::new(),
            )
            .await?;
        Ok(ret.convert()?)
    }

    /// Clipboard round trip for one table row: open the row menu, clear the
    /// clipboard, trigger the copy action, wait the settle delay, read back.
    /// Any unreachable control degrades to the sentinel instead of failing
    /// the row.
    async fn copy_link_via_clipboard(&self, menu_cell: &WebElement) -> String {
        let markers = &self.settings.lms.markers;
        let timing = &self.settings.timing;

        let menu = match menu_cell.find_all(By::Tag("button")).await {
            Ok(buttons) => match buttons.into_iter().next() {
                Some(button) => button,
                None => return LINK_UNAVAILABLE.to_string(),
            },
            Err(_) => return LINK_UNAVAILABLE.to_string(),
        };
        if !menu.is_displayed().await.unwrap_or(false) || menu.click().await.is_err() {
            return LINK_UNAVAILABLE.to_string();
        }
        sleep_ms(timing.menu_settle_ms).await;

        let _ = self.write_clipboard("").await;
        let copy = match first_visible_with_text(&self.driver, &markers.copy_link).await {
            Ok(Some(item)) => item,
            _ => return LINK_UNAVAILABLE.to_string(),
        };
        if copy.click().await.is_err() {
            return LINK_UNAVAILABLE.to_string();
        }
        // the copy is an async write with no completion signal; the settle
        // delay is the only ordering guarantee before the read
        sleep_ms(timing.clipboard_settle_ms).await;
        match self.read_clipboard().await {
            Ok(link) if !link.trim().is_empty() => link.trim().to_string(),
            _ => LINK_UNAVAILABLE.to_string(),
        }
    }

    /// Walk one course: outline -> room link -> recordings frame -> table
    /// rows, with the clipboard round trip per row. Row-level failures keep
    /// the row with a sentinel link; course-level failures surface as
    /// `CourseError` for the batch to absorb.
    pub async fn extract_recordings(
        &self,
        task: &HarvestTask,
    ) -> Result<Vec<RecordingEntry>, CourseError> {
        let markers = &self.settings.lms.markers;
        let timing = &self.settings.timing;

        self.open_course_outline(&task.internal_id).await?;
        let room = self
            .reveal_room_link()
            .await?
            .ok_or(CourseError::RoomNotFound)?;
        room.click().await?;

        debug!(course = %task.external_id, "waiting for the conferencing widget");
        let scan = PageFrameScan::new(&self.driver);
        let handle = locate_frame(
            &scan,
            &markers.recordings_tab,
            timing.frame_attempts,
            Duration::from_millis(timing.frame_poll_ms),
        )
        .await?;
        self.enter_frame(handle).await?;

        if let Some(tab) = self.visible_by_text(&markers.recordings_tab).await? {
            tab.click().await?;
        }
        sleep_ms(timing.tab_settle_ms).await;

        let rows = self.driver.find_all(By::Tag("tr")).await?;
        let mut captured = Vec::new();
        for row in rows.iter().skip(1) {
            let cells = row.find_all(By::Tag("td")).await?;
            if cells.len() < 3 {
                continue;
            }
            let date_cell = cells[0].text().await?;
            let raw_date = date_cell.lines().next().unwrap_or("").trim().to_string();
            let duration = cells[2].text().await?.trim().to_string();
            let Some(menu_cell) = cells.last() else {
                continue;
            };
            let link = self.copy_link_via_clipboard(menu_cell).await;
            captured.push(RecordingEntry {
                external_id: task.external_id.clone(),
                date: parse_recording_date(&raw_date),
                duration,
                link,
            });
        }
        self.leave_frames().await?;
        Ok(captured)
    }

    /// Live presence check for the monitor: same navigation as the extractor,
    /// but it only asks whether the frame's table shows an in-progress
    /// marker.
    pub async fn probe_room(&self, internal_id: &str) -> Result<RoomProbe, BrowserError> {
        let markers = &self.settings.lms.markers;
        let timing = &self.settings.timing;

        self.open_course_outline(internal_id).await?;
        let Some(room) = self.reveal_room_link().await? else {
            return Ok(RoomProbe::RoomMissing);
        };
        room.click().await?;

        let scan = PageFrameScan::new(&self.driver);
        let handle = match locate_frame(
            &scan,
            &markers.recordings_tab,
            timing.monitor_frame_attempts,
            Duration::from_millis(timing.frame_poll_ms),
        )
        .await
        {
            Ok(handle) => handle,
            Err(FrameError::NotFound { .. }) => return Ok(RoomProbe::FrameUnresolved),
            Err(FrameError::Scan(err)) => return Err(err),
        };
        self.enter_frame(handle).await?;

        if let Some(tab) = self.visible_by_text(&markers.recordings_tab).await? {
            let _ = tab.click().await;
        }
        sleep_ms(timing.live_settle_ms).await;

        let table_text = match self.driver.find(By::Tag("table")).await {
            Ok(table) => table.text().await.unwrap_or_default(),
            Err(_) => String::new(),
        };
        self.leave_frames().await?;

        let live = markers
            .recording_live
            .iter()
            .any(|marker| table_text.contains(marker));
        Ok(if live {
            RoomProbe::Recording
        } else {
            RoomProbe::NotDetected
        })
    }
}

/// `RoomSensor` over the live browser; any browser-level error collapses to
/// `Failed` so the monitor loop never has to unwind.
pub struct LiveRoomSensor<'a> {
    browser: &'a LmsBrowser<'a>,
}

impl<'a> LiveRoomSensor<'a> {
    pub fn new(browser: &'a LmsBrowser<'a>) -> Self {
        Self { browser }
    }
}

#[async_trait]
impl RoomSensor for LiveRoomSensor<'_> {
    async fn probe(&self, internal_id: &str) -> RoomProbe {
        match self.browser.probe_room(internal_id).await {
            Ok(probe) => probe,
            Err(err) => RoomProbe::Failed(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct NeverFound {
        polls: AtomicU32,
    }

    #[async_trait]
    impl FrameScan for NeverFound {
        async fn scan(&self, _marker: &str) -> Result<Option<FrameHandle>, BrowserError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    struct FoundOnThird {
        polls: AtomicU32,
    }

    #[async_trait]
    impl FrameScan for FoundOnThird {
        async fn scan(&self, _marker: &str) -> Result<Option<FrameHandle>, BrowserError> {
            let seen = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            if seen >= 3 {
                Ok(Some(FrameHandle(2)))
            } else {
                Ok(None)
            }
        }
    }

    struct Exploding {
        polls: AtomicU32,
    }

    #[async_trait]
    impl FrameScan for Exploding {
        async fn scan(&self, _marker: &str) -> Result<Option<FrameHandle>, BrowserError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Err(BrowserError::Message("window closed".to_string()))
        }
    }

    #[tokio::test]
    async fn absent_marker_fails_after_exactly_max_attempts() {
        let scan = NeverFound {
            polls: AtomicU32::new(0),
        };
        let result = locate_frame(&scan, "Recordings", 17, Duration::from_millis(1)).await;
        match result {
            Err(FrameError::NotFound { marker, attempts }) => {
                assert_eq!(marker, "Recordings");
                assert_eq!(attempts, 17);
            }
            other => panic!("expected NotFound, got {other:?}"),
        }
        assert_eq!(scan.polls.load(Ordering::SeqCst), 17);
    }

    #[tokio::test]
    async fn late_frame_is_returned_without_further_polls() {
        let scan = FoundOnThird {
            polls: AtomicU32::new(0),
        };
        let handle = locate_frame(&scan, "Recordings", 20, Duration::from_millis(1))
            .await
            .expect("frame should resolve");
        assert_eq!(handle, FrameHandle(2));
        assert_eq!(scan.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn scan_errors_abort_the_poll_immediately() {
        let scan = Exploding {
            polls: AtomicU32::new(0),
        };
        let result = locate_frame(&scan, "Recordings", 20, Duration::from_millis(1)).await;
        assert!(matches!(result, Err(FrameError::Scan(_))));
        assert_eq!(scan.polls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn xpath_literals_handle_embedded_quotes() {
        assert_eq!(xpath_literal("Recordings"), "'Recordings'");
        assert_eq!(xpath_literal("it's live"), "\"it's live\"");
        assert_eq!(
            xpath_literal("a 'mixed' \"case\""),
            "concat('a ', \"'\", 'mixed', \"'\", ' \"case\"')"
        );
    }
}
