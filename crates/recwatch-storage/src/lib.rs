//! Delimited-table persistence, the dedup store, and the LMS membership API
//! client for recwatch.
//!
//! All tables are plain delimited text with a header row. The identifier
//! column is always written quoted: period.section codes like `202401.1005`
//! must survive save/reload verbatim and never be readable as numbers.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use recwatch_core::{
    AgendaEntry, CourseMapping, DedupKey, EligibleCourse, HarvestTask, RecordingEntry,
};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/* ---------------- Delimited codec ---------------- */

/// Quote- and CRLF-tolerant parser for `sep`-delimited text. Blank lines are
/// skipped; an unterminated quote at EOF still flushes the trailing field.
pub fn parse_delimited(text: &str, sep: char) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' => {
                if in_quotes {
                    if matches!(chars.peek(), Some('"')) {
                        chars.next();
                        field.push('"');
                    } else {
                        in_quotes = false;
                    }
                } else {
                    in_quotes = true;
                }
            }
            c if c == sep && !in_quotes => row.push(std::mem::take(&mut field)),
            '\n' | '\r' if !in_quotes => {
                if ch == '\r' && matches!(chars.peek(), Some('\n')) {
                    chars.next();
                }
                row.push(std::mem::take(&mut field));
                if !(row.len() == 1 && row[0].is_empty()) {
                    rows.push(std::mem::take(&mut row));
                } else {
                    row.clear();
                }
            }
            _ => field.push(ch),
        }
    }

    row.push(field);
    if !(row.len() == 1 && row[0].is_empty()) {
        rows.push(row);
    }
    rows
}

fn needs_quotes(field: &str, sep: char) -> bool {
    field.contains(sep) || field.contains('"') || field.contains('\n') || field.contains('\r')
}

/// Render one row. Columns listed in `forced_quotes` are quoted even when
/// they contain nothing special, which is how the identifier column is
/// pinned to text.
pub fn format_row(row: &[String], sep: char, forced_quotes: &[usize]) -> String {
    let mut out = String::new();
    for (idx, cell) in row.iter().enumerate() {
        if idx > 0 {
            out.push(sep);
        }
        if needs_quotes(cell, sep) || forced_quotes.contains(&idx) {
            out.push('"');
            out.push_str(&cell.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(cell);
        }
    }
    out.push('\n');
    out
}

fn render_table(header: &[&str], rows: &[Vec<String>], sep: char, forced_quotes: &[usize]) -> String {
    let header_row: Vec<String> = header.iter().map(|h| h.to_string()).collect();
    let mut out = format_row(&header_row, sep, &[]);
    for row in rows {
        out.push_str(&format_row(row, sep, forced_quotes));
    }
    out
}

/// Replace `path` atomically: write a sibling temp file, then rename over the
/// destination, so a killed run leaves the previous file intact.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "table".to_string());
    let temp_path = parent.join(format!(".{}.{}.tmp", file_name, std::process::id()));

    fs::write(&temp_path, contents)
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    match fs::rename(&temp_path, path) {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path);
            Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            })
        }
    }
}

/* ---------------- Typed table files ---------------- */

fn header_index(header: &[String]) -> HashMap<String, usize> {
    header
        .iter()
        .enumerate()
        .map(|(idx, name)| (name.trim().to_ascii_lowercase(), idx))
        .collect()
}

fn require_column(index: &HashMap<String, usize>, name: &str, path: &Path) -> Result<usize> {
    index
        .get(name)
        .copied()
        .with_context(|| format!("{} is missing required column `{name}`", path.display()))
}

fn cell(row: &[String], idx: usize) -> String {
    row.get(idx).map(|c| c.trim().to_string()).unwrap_or_default()
}

fn read_table(path: &Path, sep: char) -> Result<Vec<Vec<String>>> {
    let text =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let rows = parse_delimited(&text, sep);
    if rows.is_empty() {
        bail!("{} has no header row", path.display());
    }
    Ok(rows)
}

pub fn load_roster(path: &Path, sep: char) -> Result<Vec<CourseMapping>> {
    let mut rows = read_table(path, sep)?;
    let index = header_index(&rows.remove(0));
    let ext = require_column(&index, "external_id", path)?;
    let int = require_column(&index, "internal_id", path)?;
    let name = require_column(&index, "display_name", path)?;
    let visible = require_column(&index, "visible_id", path)?;
    Ok(rows
        .iter()
        .map(|row| CourseMapping {
            external_id: cell(row, ext),
            internal_id: cell(row, int),
            display_name: cell(row, name),
            visible_id: cell(row, visible),
        })
        .collect())
}

pub fn save_roster(path: &Path, sep: char, mappings: &[CourseMapping]) -> Result<()> {
    let rows: Vec<Vec<String>> = mappings
        .iter()
        .map(|m| {
            vec![
                m.external_id.clone(),
                m.internal_id.clone(),
                m.display_name.clone(),
                m.visible_id.clone(),
            ]
        })
        .collect();
    let text = render_table(
        &["external_id", "internal_id", "display_name", "visible_id"],
        &rows,
        sep,
        &[0],
    );
    write_atomic(path, &text)
}

pub fn load_eligible(path: &Path, sep: char) -> Result<Vec<EligibleCourse>> {
    let mut rows = read_table(path, sep)?;
    let index = header_index(&rows.remove(0));
    let ext = require_column(&index, "external_id", path)?;
    let title = require_column(&index, "course_title", path)?;
    Ok(rows
        .iter()
        .map(|row| EligibleCourse {
            external_id: cell(row, ext),
            course_title: cell(row, title),
        })
        .collect())
}

pub fn load_agenda(path: &Path, sep: char) -> Result<Vec<AgendaEntry>> {
    let mut rows = read_table(path, sep)?;
    let index = header_index(&rows.remove(0));
    let ext = require_column(&index, "external_id", path)?;
    let time = require_column(&index, "start_time", path)?;
    let title = require_column(&index, "course_title", path)?;
    let instructor = require_column(&index, "instructor", path)?;
    Ok(rows
        .iter()
        .map(|row| AgendaEntry {
            external_id: cell(row, ext),
            start_time: cell(row, time),
            course_title: cell(row, title),
            instructor: cell(row, instructor),
        })
        .collect())
}

pub fn load_tasks(path: &Path, sep: char) -> Result<Vec<HarvestTask>> {
    let mut rows = read_table(path, sep)?;
    let index = header_index(&rows.remove(0));
    let ext = require_column(&index, "external_id", path)?;
    let int = require_column(&index, "internal_id", path)?;
    let name = require_column(&index, "display_name", path)?;
    let title = require_column(&index, "course_title", path)?;
    Ok(rows
        .iter()
        .map(|row| HarvestTask {
            external_id: cell(row, ext),
            internal_id: cell(row, int),
            display_name: cell(row, name),
            course_title: cell(row, title),
        })
        .collect())
}

pub fn save_tasks(path: &Path, sep: char, tasks: &[HarvestTask]) -> Result<()> {
    let rows: Vec<Vec<String>> = tasks
        .iter()
        .map(|t| {
            vec![
                t.external_id.clone(),
                t.internal_id.clone(),
                t.display_name.clone(),
                t.course_title.clone(),
            ]
        })
        .collect();
    let text = render_table(
        &["external_id", "internal_id", "display_name", "course_title"],
        &rows,
        sep,
        &[0],
    );
    write_atomic(path, &text)
}

/// The historical ledger is optional on first run: no file means no history.
pub fn load_ledger(path: &Path, sep: char) -> Result<Vec<RecordingEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut rows = read_table(path, sep)?;
    let index = header_index(&rows.remove(0));
    let ext = require_column(&index, "external_id", path)?;
    let date = require_column(&index, "date", path)?;
    let duration = require_column(&index, "duration", path)?;
    let link = require_column(&index, "link", path)?;
    Ok(rows
        .iter()
        .map(|row| RecordingEntry {
            external_id: cell(row, ext),
            date: cell(row, date),
            duration: cell(row, duration),
            link: cell(row, link),
        })
        .collect())
}

pub fn save_ledger(path: &Path, sep: char, entries: &[RecordingEntry]) -> Result<()> {
    let rows: Vec<Vec<String>> = entries
        .iter()
        .map(|e| {
            vec![
                e.external_id.clone(),
                e.date.clone(),
                e.duration.clone(),
                e.link.clone(),
            ]
        })
        .collect();
    let text = render_table(&["external_id", "date", "duration", "link"], &rows, sep, &[0]);
    write_atomic(path, &text)
}

/* ---------------- Dedup store ---------------- */

/// Set of (external_id, date) pairs already present in the ledger. Presence
/// of a key is authoritative: that (course, day) needs no new extraction.
#[derive(Debug, Default)]
pub struct DedupStore {
    keys: HashSet<DedupKey>,
}

impl DedupStore {
    pub fn from_entries(entries: &[RecordingEntry]) -> Self {
        Self {
            keys: entries.iter().map(RecordingEntry::dedup_key).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, key: &DedupKey) -> bool {
        self.keys.contains(key)
    }

    /// Keep only candidates whose key is not yet known. Accepted keys are
    /// inserted immediately, so a key repeated within the same batch is
    /// absorbed too and the ledger can never gain duplicate keys in one run.
    pub fn filter_novel(&mut self, candidates: Vec<RecordingEntry>) -> Vec<RecordingEntry> {
        candidates
            .into_iter()
            .filter(|entry| self.keys.insert(entry.dedup_key()))
            .collect()
    }
}

/* ---------------- Membership API client ---------------- */

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("membership request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("membership endpoint returned http {status}")]
    Status { status: u16 },
    #[error("decoding membership response: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("membership endpoint returned an empty course list")]
    Empty,
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// One course membership as returned by the LMS, before external-id recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipRow {
    pub internal_id: String,
    pub display_name: String,
    pub visible_id: String,
}

#[derive(Debug, Deserialize)]
struct MembershipPage {
    #[serde(default)]
    results: Vec<MembershipItem>,
}

#[derive(Debug, Deserialize)]
struct MembershipItem {
    course: Option<CourseBody>,
}

#[derive(Debug, Deserialize)]
struct CourseBody {
    id: Option<String>,
    name: Option<String>,
    #[serde(rename = "courseId")]
    course_id: Option<String>,
}

/// Decode a membership-listing body. Items without an embedded course id are
/// dropped; an empty remainder is an error so a refresh never clobbers the
/// previous mapping with nothing.
pub fn parse_membership_rows(body: &str) -> Result<Vec<MembershipRow>, ApiError> {
    let page: MembershipPage = serde_json::from_str(body).map_err(ApiError::Decode)?;
    let rows: Vec<MembershipRow> = page
        .results
        .into_iter()
        .filter_map(|item| {
            let course = item.course?;
            let internal_id = course.id?;
            Some(MembershipRow {
                internal_id,
                display_name: course.name.unwrap_or_default(),
                visible_id: course.course_id.unwrap_or_default(),
            })
        })
        .collect();
    if rows.is_empty() {
        return Err(ApiError::Empty);
    }
    Ok(rows)
}

/// Thin authenticated client for the membership-listing endpoint. The session
/// cookies minted by the browser login are replayed as a single header, which
/// is much cheaper than driving the UI to read the same data.
#[derive(Debug)]
pub struct MembershipClient {
    client: reqwest::Client,
    cookie_header: String,
    backoff: BackoffPolicy,
}

impl MembershipClient {
    pub fn new(cookie_header: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(timeout)
            .user_agent("Mozilla/5.0")
            .build()
            .context("building membership http client")?;
        Ok(Self {
            client,
            cookie_header,
            backoff: BackoffPolicy::default(),
        })
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub async fn list_course_memberships(&self, url: &str) -> Result<Vec<MembershipRow>, ApiError> {
        let mut attempt = 0usize;
        loop {
            let response = self
                .client
                .get(url)
                .header(reqwest::header::COOKIE, &self.cookie_header)
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let body = resp.text().await?;
                        return parse_membership_rows(&body);
                    }
                    let retryable =
                        status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;
                    if retryable && attempt < self.backoff.max_retries {
                        debug!(status = status.as_u16(), attempt, "retrying membership fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(ApiError::Status {
                        status: status.as_u16(),
                    });
                }
                Err(err) => {
                    let retryable = err.is_timeout() || err.is_connect() || err.is_request();
                    if retryable && attempt < self.backoff.max_retries {
                        debug!(error = %err, attempt, "retrying membership fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(ApiError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(external_id: &str, date: &str) -> RecordingEntry {
        RecordingEntry {
            external_id: external_id.to_string(),
            date: date.to_string(),
            duration: "1h 10m".to_string(),
            link: "https://example.test/rec".to_string(),
        }
    }

    #[test]
    fn delimited_codec_round_trips_quotes_and_separators() {
        let row = vec![
            "202401.1005".to_string(),
            "COURSE; WITH \"QUOTES\"".to_string(),
            "plain".to_string(),
        ];
        let text = format_row(&row, ';', &[0]);
        let parsed = parse_delimited(&text, ';');
        assert_eq!(parsed, vec![row]);
    }

    #[test]
    fn identifier_column_survives_save_and_reload_verbatim() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("ledger.csv");
        let entries = vec![entry("202401.1005", "15/09/2024")];

        save_ledger(&path, ';', &entries).expect("save");
        let reloaded = load_ledger(&path, ';').expect("load");

        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded[0].external_id, "202401.1005");
        // the raw file keeps the id quoted, never as a bare numeric token
        let raw = std::fs::read_to_string(&path).expect("raw");
        assert!(raw.contains("\"202401.1005\""));
    }

    #[test]
    fn missing_ledger_is_empty_history() {
        let dir = tempdir().expect("tempdir");
        let entries = load_ledger(&dir.path().join("absent.csv"), ';').expect("load");
        assert!(entries.is_empty());
    }

    #[test]
    fn roster_load_rejects_missing_columns() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("roster.csv");
        std::fs::write(&path, "external_id;display_name\n\"x\";y\n").expect("write");
        let err = load_roster(&path, ';').expect_err("missing internal_id");
        assert!(err.to_string().contains("internal_id"));
    }

    #[test]
    fn atomic_save_replaces_prior_contents() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("tasks.csv");
        let first = vec![HarvestTask {
            external_id: "202401.1005".to_string(),
            internal_id: "_11_1".to_string(),
            display_name: "ALGEBRA 202401.1005".to_string(),
            course_title: "ALGEBRA".to_string(),
        }];
        save_tasks(&path, ';', &first).expect("first save");
        save_tasks(&path, ';', &[]).expect("second save");
        assert!(load_tasks(&path, ';').expect("load").is_empty());
        // no temp litter left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn dedup_store_filters_known_and_batch_repeated_keys() {
        let history = vec![entry("202401.1005", "15/09/2024")];
        let mut store = DedupStore::from_entries(&history);
        assert_eq!(store.len(), 1);
        assert!(store.contains(&("202401.1005".to_string(), "15/09/2024".to_string())));

        let candidates = vec![
            entry("202401.1005", "15/09/2024"),
            entry("202401.1005", "16/09/2024"),
            entry("202401.1005", "16/09/2024"),
            entry("202402.0003", "16/09/2024"),
        ];
        let novel = store.filter_novel(candidates);

        let keys: Vec<DedupKey> = novel.iter().map(RecordingEntry::dedup_key).collect();
        assert_eq!(
            keys,
            vec![
                ("202401.1005".to_string(), "16/09/2024".to_string()),
                ("202402.0003".to_string(), "16/09/2024".to_string()),
            ]
        );
    }

    #[test]
    fn second_pass_over_same_candidates_yields_nothing() {
        let mut store = DedupStore::from_entries(&[]);
        let candidates = vec![entry("202401.1005", "15/09/2024")];
        assert_eq!(store.filter_novel(candidates.clone()).len(), 1);
        assert!(store.filter_novel(candidates).is_empty());
    }

    #[test]
    fn membership_body_decodes_and_drops_courseless_items() {
        let body = r#"{
            "results": [
                {"course": {"id": "_901_1", "name": "ALGEBRA 202401.1005", "courseId": "ALG-1"}},
                {"course": {"name": "orphan without id"}},
                {}
            ]
        }"#;
        let rows = parse_membership_rows(body).expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].internal_id, "_901_1");
        assert_eq!(rows[0].visible_id, "ALG-1");
    }

    #[test]
    fn empty_membership_list_is_an_error() {
        assert!(matches!(
            parse_membership_rows(r#"{"results": []}"#),
            Err(ApiError::Empty)
        ));
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
    }
}
