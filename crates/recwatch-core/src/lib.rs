//! Core domain model, date/identifier parsing, and run settings for recwatch.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sentinel external id for mapping rows whose display name carries no
/// period.section token. Rows with this value are kept so coverage gaps
/// stay visible.
pub const EXTERNAL_ID_NOT_FOUND: &str = "not-found";

/// Sentinel link value for rows whose copy-link control could not be driven.
pub const LINK_UNAVAILABLE: &str = "unavailable";

/// One row of the persisted course mapping: the operator's period.section
/// code joined to the LMS-internal course identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseMapping {
    pub external_id: String,
    pub internal_id: String,
    pub display_name: String,
    pub visible_id: String,
}

/// A course the harvester will visit this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestTask {
    pub external_id: String,
    pub internal_id: String,
    pub display_name: String,
    pub course_title: String,
}

/// One eligible course supplied by the upstream scheduling tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibleCourse {
    pub external_id: String,
    pub course_title: String,
}

/// A captured class recording. `date` is the normalized `dd/mm/yyyy` string
/// (or the raw cell text when normalization failed), `duration` is verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingEntry {
    pub external_id: String,
    pub date: String,
    pub duration: String,
    pub link: String,
}

/// Composite key deciding whether a captured recording is already known.
pub type DedupKey = (String, String);

impl RecordingEntry {
    pub fn dedup_key(&self) -> DedupKey {
        (self.external_id.clone(), self.date.clone())
    }
}

/// One row of today's supervision agenda.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgendaEntry {
    pub external_id: String,
    pub start_time: String,
    pub course_title: String,
    pub instructor: String,
}

/// Per-course state in the live monitor. Transitions move strictly forward:
/// `Pending -> Checking -> <terminal>`, and a terminal course is never
/// revisited within a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomState {
    Pending,
    Checking,
    Recording,
    AlertNotDetected,
    FrameError,
    RoomNotFound,
    Error(String),
}

impl RoomState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RoomState::Pending | RoomState::Checking)
    }

    pub fn label(&self) -> String {
        match self {
            RoomState::Pending => "pending".to_string(),
            RoomState::Checking => "checking...".to_string(),
            RoomState::Recording => "RECORDING".to_string(),
            RoomState::AlertNotDetected => "ALERT: not detected".to_string(),
            RoomState::FrameError => "frame error".to_string(),
            RoomState::RoomNotFound => "room not found".to_string(),
            RoomState::Error(msg) => format!("error: {msg}"),
        }
    }
}

/// Monitor row, mutated in place as the batch advances. In-memory only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveStatus {
    pub external_id: String,
    pub start_time: String,
    pub course_title: String,
    pub instructor: String,
    pub state: RoomState,
}

/// Truncate to at most `max` characters, appending an ellipsis when cut.
/// Operates on characters, not bytes, so accented course titles stay intact.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

fn external_id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{6}\.\d{4})").expect("external id pattern is valid"))
}

/// Recover the operator's period.section code (six digits, a dot, four
/// digits) from an LMS display name.
pub fn extract_external_id(display_name: &str) -> Option<String> {
    external_id_pattern()
        .captures(display_name)
        .map(|caps| caps[1].to_string())
}

const MONTHS: [(&str, &str); 12] = [
    ("January", "01"),
    ("February", "02"),
    ("March", "03"),
    ("April", "04"),
    ("May", "05"),
    ("June", "06"),
    ("July", "07"),
    ("August", "08"),
    ("September", "09"),
    ("October", "10"),
    ("November", "11"),
    ("December", "12"),
];

fn recording_date_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Tolerates extra whitespace and weekday noise between the day and the
    // year, e.g. "September  15, 2024" or "March 2 Thu, 2023".
    RE.get_or_init(|| {
        Regex::new(r"([A-Za-z]+)\s+(\d{1,2})[^,\d]*,\s*(\d{4})")
            .expect("recording date pattern is valid")
    })
}

/// Normalize a recordings-table date cell to `dd/mm/yyyy`. The table renders
/// English month names regardless of account locale; anything that does not
/// match the known shape passes through verbatim.
pub fn parse_recording_date(raw: &str) -> String {
    let flat = raw.replace('\n', " ");
    let Some(caps) = recording_date_pattern().captures(&flat) else {
        return raw.trim().to_string();
    };
    let month = MONTHS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(&caps[1]))
        .map(|(_, number)| *number);
    let (Some(month), Ok(day)) = (month, caps[2].parse::<u32>()) else {
        return raw.trim().to_string();
    };
    format!("{day:02}/{month}/{}", &caps[3])
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("reading settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Process-wide configuration, deserialized once at startup and passed by
/// reference into every component. Credentials never live here; they come
/// from the environment.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub webdriver: WebDriverSettings,
    pub lms: LmsSettings,
    pub paths: PathSettings,
    #[serde(default)]
    pub files: FileSettings,
    #[serde(default)]
    pub timing: TimingSettings,
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebDriverSettings {
    pub url: String,
    #[serde(default)]
    pub headless: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LmsSettings {
    pub urls: LmsUrls,
    pub selectors: LmsSelectors,
    pub markers: LmsMarkers,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LmsUrls {
    pub login: String,
    /// URL fragment that only the post-login route contains.
    pub authenticated_fragment: String,
    /// Template with an `{internal_id}` placeholder.
    pub course_outline: String,
    /// Template with a `{user_id}` placeholder.
    pub memberships_api: String,
}

impl LmsUrls {
    pub fn course_outline_url(&self, internal_id: &str) -> String {
        self.course_outline.replace("{internal_id}", internal_id)
    }

    pub fn memberships_url(&self, user_id: &str) -> String {
        self.memberships_api.replace("{user_id}", user_id)
    }
}

/// CSS selectors for the login form. Supplied by configuration because they
/// drift with LMS updates.
#[derive(Debug, Clone, Deserialize)]
pub struct LmsSelectors {
    pub user_input: String,
    pub pass_input: String,
    pub login_button: String,
    pub mfa_confirm: String,
}

/// Visible UI text the automation keys on, kept out of the code for the same
/// reason as the selectors.
#[derive(Debug, Clone, Deserialize)]
pub struct LmsMarkers {
    pub role_button: String,
    pub room_link: String,
    pub room_folder: String,
    pub recordings_tab: String,
    pub copy_link: String,
    pub recording_live: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathSettings {
    pub roster: PathBuf,
    pub eligible: PathBuf,
    pub tasks: PathBuf,
    pub ledger: PathBuf,
    pub agenda: PathBuf,
    pub browser_profile: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileSettings {
    #[serde(default = "default_separator")]
    pub separator: char,
}

impl Default for FileSettings {
    fn default() -> Self {
        Self {
            separator: default_separator(),
        }
    }
}

fn default_separator() -> char {
    ';'
}

/// Waits and retry counts for the browser-driven flows. Every UI action whose
/// completion cannot be observed directly gets an explicit settle delay here.
#[derive(Debug, Clone, Deserialize)]
pub struct TimingSettings {
    #[serde(default = "default_login_settle_ms")]
    pub login_settle_ms: u64,
    #[serde(default = "default_mfa_wait_ms")]
    pub mfa_wait_ms: u64,
    #[serde(default = "default_auth_wait_ms")]
    pub auth_wait_ms: u64,
    #[serde(default = "default_nav_settle_ms")]
    pub nav_settle_ms: u64,
    #[serde(default = "default_folder_settle_ms")]
    pub folder_settle_ms: u64,
    #[serde(default = "default_tab_settle_ms")]
    pub tab_settle_ms: u64,
    #[serde(default = "default_menu_settle_ms")]
    pub menu_settle_ms: u64,
    #[serde(default = "default_clipboard_settle_ms")]
    pub clipboard_settle_ms: u64,
    #[serde(default = "default_live_settle_ms")]
    pub live_settle_ms: u64,
    #[serde(default = "default_frame_attempts")]
    pub frame_attempts: u32,
    #[serde(default = "default_monitor_frame_attempts")]
    pub monitor_frame_attempts: u32,
    #[serde(default = "default_frame_poll_ms")]
    pub frame_poll_ms: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            login_settle_ms: default_login_settle_ms(),
            mfa_wait_ms: default_mfa_wait_ms(),
            auth_wait_ms: default_auth_wait_ms(),
            nav_settle_ms: default_nav_settle_ms(),
            folder_settle_ms: default_folder_settle_ms(),
            tab_settle_ms: default_tab_settle_ms(),
            menu_settle_ms: default_menu_settle_ms(),
            clipboard_settle_ms: default_clipboard_settle_ms(),
            live_settle_ms: default_live_settle_ms(),
            frame_attempts: default_frame_attempts(),
            monitor_frame_attempts: default_monitor_frame_attempts(),
            frame_poll_ms: default_frame_poll_ms(),
        }
    }
}

fn default_login_settle_ms() -> u64 {
    3_000
}

fn default_mfa_wait_ms() -> u64 {
    12_000
}

fn default_auth_wait_ms() -> u64 {
    90_000
}

fn default_nav_settle_ms() -> u64 {
    1_000
}

fn default_folder_settle_ms() -> u64 {
    2_000
}

fn default_tab_settle_ms() -> u64 {
    5_000
}

fn default_menu_settle_ms() -> u64 {
    1_000
}

fn default_clipboard_settle_ms() -> u64 {
    1_000
}

fn default_live_settle_ms() -> u64 {
    4_000
}

fn default_frame_attempts() -> u32 {
    20
}

fn default_monitor_frame_attempts() -> u32 {
    15
}

fn default_frame_poll_ms() -> u64 {
    1_000
}
