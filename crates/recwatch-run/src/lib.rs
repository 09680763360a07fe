//! Run orchestration: mapping refresh, harvest-task preparation, the
//! sequential harvest batch, and the live status monitor.
//!
//! Courses are processed one at a time, on purpose: one browser window, one
//! clipboard, one page in flight. Per-course failures become data (an empty
//! result or a terminal error state); only authentication and missing input
//! files abort a run.

use std::collections::{HashMap, HashSet};
use std::io::{self, Write};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crossterm::cursor::{MoveToColumn, MoveUp};
use crossterm::queue;
use crossterm::style::{Color, Stylize};
use crossterm::terminal::{Clear, ClearType};
use recwatch_browser::{CourseError, LmsBrowser, RoomProbe, RoomSensor};
use recwatch_core::{
    truncate_chars, AgendaEntry, CourseMapping, EligibleCourse, HarvestTask, LiveStatus,
    RecordingEntry, RoomState, Settings, EXTERNAL_ID_NOT_FOUND,
};
use recwatch_storage::{DedupStore, MembershipClient, MembershipRow};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

/// Operator credentials, environment-only. Nothing here is ever persisted.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub lms_user_id: String,
}

impl Credentials {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            username: std::env::var("RECWATCH_USERNAME")
                .context("RECWATCH_USERNAME is not set")?,
            password: std::env::var("RECWATCH_PASSWORD")
                .context("RECWATCH_PASSWORD is not set")?,
            lms_user_id: std::env::var("RECWATCH_LMS_USER_ID")
                .context("RECWATCH_LMS_USER_ID is not set")?,
        })
    }
}

/* ---------------- Mapping refresh ---------------- */

#[derive(Debug, Clone, Serialize)]
pub struct MappingSummary {
    pub total: usize,
    pub matched: usize,
}

/// Turn membership rows into the mapping table. Keyed by external id with
/// last-seen wins; rows whose display name carries no period.section token
/// keep the sentinel id and are all retained, so coverage gaps stay visible
/// instead of silently dropping.
pub fn mappings_from_memberships(rows: Vec<MembershipRow>) -> Vec<CourseMapping> {
    let mut out: Vec<CourseMapping> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    for row in rows {
        let external_id = recwatch_core::extract_external_id(&row.display_name)
            .unwrap_or_else(|| EXTERNAL_ID_NOT_FOUND.to_string());
        let mapping = CourseMapping {
            external_id: external_id.clone(),
            internal_id: row.internal_id,
            display_name: row.display_name,
            visible_id: row.visible_id,
        };
        if external_id != EXTERNAL_ID_NOT_FOUND {
            if let Some(&pos) = positions.get(&external_id) {
                out[pos] = mapping;
                continue;
            }
            positions.insert(external_id, out.len());
        }
        out.push(mapping);
    }
    out
}

/// Fetch and persist a fresh mapping table. On any API failure the previous
/// table is left untouched: the save only happens after a successful,
/// non-empty fetch.
pub async fn refresh_mapping(
    settings: &Settings,
    client: &MembershipClient,
    lms_user_id: &str,
) -> Result<MappingSummary> {
    let url = settings.lms.urls.memberships_url(lms_user_id);
    let rows = client
        .list_course_memberships(&url)
        .await
        .context("membership refresh failed; the previous mapping is kept")?;
    let mappings = mappings_from_memberships(rows);
    let matched = mappings
        .iter()
        .filter(|m| m.external_id != EXTERNAL_ID_NOT_FOUND)
        .count();
    recwatch_storage::save_roster(&settings.paths.roster, settings.files.separator, &mappings)?;
    info!(total = mappings.len(), matched, "course mapping refreshed");
    Ok(MappingSummary {
        total: mappings.len(),
        matched,
    })
}

/* ---------------- Task preparation ---------------- */

/// Join the eligible-courses list against the mapping table. Duplicated
/// eligible rows collapse to the first occurrence; courses without a mapping
/// row do not join (the pre-flight listing shows them as missing).
pub fn prepare_tasks(roster: &[CourseMapping], eligible: &[EligibleCourse]) -> Vec<HarvestTask> {
    let by_external: HashMap<&str, &CourseMapping> = roster
        .iter()
        .filter(|m| m.external_id != EXTERNAL_ID_NOT_FOUND)
        .map(|m| (m.external_id.as_str(), m))
        .collect();

    let mut seen: HashSet<&str> = HashSet::new();
    let mut tasks = Vec::new();
    for course in eligible {
        if !seen.insert(course.external_id.as_str()) {
            continue;
        }
        let Some(mapping) = by_external.get(course.external_id.as_str()) else {
            continue;
        };
        let display_name = if mapping.display_name.is_empty() {
            course.course_title.clone()
        } else {
            mapping.display_name.clone()
        };
        tasks.push(HarvestTask {
            external_id: course.external_id.clone(),
            internal_id: mapping.internal_id.clone(),
            display_name,
            course_title: course.course_title.clone(),
        });
    }
    tasks
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightRow {
    pub index: usize,
    pub external_id: String,
    pub course_title: String,
    pub ready: bool,
}

pub fn preflight(eligible: &[EligibleCourse], roster: &[CourseMapping]) -> Vec<PreflightRow> {
    let mapped: HashSet<&str> = roster
        .iter()
        .filter(|m| m.external_id != EXTERNAL_ID_NOT_FOUND)
        .map(|m| m.external_id.as_str())
        .collect();
    eligible
        .iter()
        .enumerate()
        .map(|(idx, course)| PreflightRow {
            index: idx + 1,
            external_id: course.external_id.clone(),
            course_title: course.course_title.clone(),
            ready: mapped.contains(course.external_id.as_str()),
        })
        .collect()
}

/// Load table shown before the browser starts navigating.
pub fn render_preflight(rows: &[PreflightRow]) -> String {
    let mut out = format!("load: {} courses\n", rows.len());
    for row in rows {
        let status = if row.ready {
            "ready".with(Color::Green)
        } else {
            "no mapping".with(Color::Red)
        };
        out.push_str(&format!(
            "{:>4}  {:<14}  {:<45}  {}\n",
            row.index,
            row.external_id,
            truncate_chars(&row.course_title, 45),
            status
        ));
    }
    out
}

/* ---------------- Harvest batch ---------------- */

/// Seam between the batch loop and the browser, so the loop's isolation and
/// dedup behavior are testable with a stub.
#[async_trait]
pub trait CourseHarvester {
    async fn harvest(&self, task: &HarvestTask) -> Result<Vec<RecordingEntry>, CourseError>;
}

pub struct BrowserHarvester<'a> {
    browser: &'a LmsBrowser<'a>,
}

impl<'a> BrowserHarvester<'a> {
    pub fn new(browser: &'a LmsBrowser<'a>) -> Self {
        Self { browser }
    }
}

#[async_trait]
impl CourseHarvester for BrowserHarvester<'_> {
    async fn harvest(&self, task: &HarvestTask) -> Result<Vec<RecordingEntry>, CourseError> {
        self.browser.extract_recordings(task).await
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CourseOutcome {
    pub external_id: String,
    pub captured: usize,
    pub novel: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub courses: usize,
    pub new_entries: usize,
    pub ledger_rows: usize,
    pub outcomes: Vec<CourseOutcome>,
}

impl HarvestSummary {
    pub fn elapsed_secs(&self) -> i64 {
        (self.finished_at - self.started_at).num_seconds()
    }
}

/// Drive every task to completion, absorbing per-course failures. Novel
/// entries are filtered against (and admitted into) the dedup store as each
/// course finishes.
pub async fn run_harvest_batch<H: CourseHarvester + ?Sized>(
    harvester: &H,
    tasks: &[HarvestTask],
    store: &mut DedupStore,
) -> (Vec<CourseOutcome>, Vec<RecordingEntry>) {
    let mut outcomes = Vec::new();
    let mut novel_entries = Vec::new();

    for (position, task) in tasks.iter().enumerate() {
        info!(
            course = %task.external_id,
            "course {}/{}: {}",
            position + 1,
            tasks.len(),
            truncate_chars(&task.course_title, 45)
        );
        match harvester.harvest(task).await {
            Ok(entries) => {
                let captured = entries.len();
                let novel = store.filter_novel(entries);
                for entry in &novel {
                    info!(course = %task.external_id, date = %entry.date, "new recording captured");
                }
                outcomes.push(CourseOutcome {
                    external_id: task.external_id.clone(),
                    captured,
                    novel: novel.len(),
                    error: None,
                });
                novel_entries.extend(novel);
            }
            Err(err) => {
                warn!(course = %task.external_id, error = %err, "course yielded no data");
                outcomes.push(CourseOutcome {
                    external_id: task.external_id.clone(),
                    captured: 0,
                    novel: 0,
                    error: Some(truncate_chars(&err.to_string(), 80)),
                });
            }
        }
    }
    (outcomes, novel_entries)
}

/// Full harvest run: load history and tasks, run the batch, union the novel
/// entries into the ledger, and replace the persisted file atomically.
/// Persistence happens exactly once, at the end, so a killed run leaves the
/// ledger in its pre-run state.
pub async fn run_harvest<H: CourseHarvester + ?Sized>(
    settings: &Settings,
    harvester: &H,
) -> Result<HarvestSummary> {
    let started_at = Utc::now();
    let sep = settings.files.separator;

    let history = recwatch_storage::load_ledger(&settings.paths.ledger, sep)?;
    let tasks = recwatch_storage::load_tasks(&settings.paths.tasks, sep)
        .context("loading the harvest task file (run `prepare` first)")?;
    let mut store = DedupStore::from_entries(&history);
    info!(
        courses = tasks.len(),
        known_recordings = store.len(),
        "starting harvest batch"
    );

    let (outcomes, novel) = run_harvest_batch(harvester, &tasks, &mut store).await;

    let mut ledger = history;
    let new_entries = novel.len();
    if new_entries > 0 {
        ledger.extend(novel);
        recwatch_storage::save_ledger(&settings.paths.ledger, sep, &ledger)?;
    }

    Ok(HarvestSummary {
        run_id: Uuid::new_v4(),
        started_at,
        finished_at: Utc::now(),
        courses: tasks.len(),
        new_entries,
        ledger_rows: ledger.len(),
        outcomes,
    })
}

/* ---------------- Live status monitor ---------------- */

pub fn state_for_probe(probe: &RoomProbe) -> RoomState {
    match probe {
        RoomProbe::Recording => RoomState::Recording,
        RoomProbe::NotDetected => RoomState::AlertNotDetected,
        RoomProbe::RoomMissing => RoomState::RoomNotFound,
        RoomProbe::FrameUnresolved => RoomState::FrameError,
        RoomProbe::Failed(message) => RoomState::Error(truncate_chars(message, 24)),
    }
}

/// Build the monitor board from today's agenda: every course starts Pending,
/// paired with its internal id when the mapping has one.
pub fn build_live_board(
    agenda: &[AgendaEntry],
    roster: &[CourseMapping],
) -> (Vec<LiveStatus>, Vec<Option<String>>) {
    let by_external: HashMap<&str, &CourseMapping> = roster
        .iter()
        .filter(|m| m.external_id != EXTERNAL_ID_NOT_FOUND)
        .map(|m| (m.external_id.as_str(), m))
        .collect();
    agenda
        .iter()
        .map(|row| {
            let status = LiveStatus {
                external_id: row.external_id.clone(),
                start_time: row.start_time.clone(),
                course_title: row.course_title.clone(),
                instructor: row.instructor.clone(),
                state: RoomState::Pending,
            };
            let internal_id = by_external
                .get(row.external_id.as_str())
                .map(|m| m.internal_id.clone());
            (status, internal_id)
        })
        .unzip()
}

/// Sequential monitor loop. Each course moves Pending -> Checking ->
/// terminal, the board is re-rendered after every transition, and no course
/// is revisited once terminal.
pub async fn run_monitor<S: RoomSensor + ?Sized>(
    sensor: &S,
    agenda: &[AgendaEntry],
    roster: &[CourseMapping],
    mut render: impl FnMut(&[LiveStatus]),
) {
    let (mut board, internals) = build_live_board(agenda, roster);
    render(&board);

    for idx in 0..board.len() {
        board[idx].state = RoomState::Checking;
        render(&board);

        let state = match &internals[idx] {
            // no mapping row: the room cannot even be addressed
            None => RoomState::RoomNotFound,
            Some(internal_id) => state_for_probe(&sensor.probe(internal_id).await),
        };
        board[idx].state = state;
        render(&board);
    }
}

fn state_color(state: &RoomState) -> Color {
    match state {
        RoomState::Recording => Color::Green,
        RoomState::AlertNotDetected => Color::Red,
        RoomState::Checking => Color::Yellow,
        RoomState::Pending => Color::Grey,
        RoomState::FrameError | RoomState::RoomNotFound | RoomState::Error(_) => Color::DarkRed,
    }
}

pub fn render_live_rows(board: &[LiveStatus]) -> Vec<String> {
    let mut lines = vec![format!(
        "{:<8} {:<14} {:<42} {:<30} {}",
        "time", "course", "title", "instructor", "room status"
    )];
    for row in board {
        let label = row.state.label().with(state_color(&row.state));
        lines.push(format!(
            "{:<8} {:<14} {:<42} {:<30} {}",
            row.start_time,
            row.external_id,
            truncate_chars(&row.course_title, 40),
            truncate_chars(&row.instructor, 30),
            label
        ));
    }
    lines
}

/// Redraws the monitor table in place: move the cursor back up over the
/// previous frame, clear it, print the new one.
#[derive(Debug, Default)]
pub struct LiveTableRenderer {
    drawn: u16,
}

impl LiveTableRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn draw(&mut self, board: &[LiveStatus]) -> io::Result<()> {
        let mut stdout = io::stdout();
        if self.drawn > 0 {
            queue!(
                stdout,
                MoveToColumn(0),
                MoveUp(self.drawn),
                Clear(ClearType::FromCursorDown)
            )?;
        }
        let lines = render_live_rows(board);
        for line in &lines {
            writeln!(stdout, "{line}")?;
        }
        stdout.flush()?;
        self.drawn = lines.len() as u16;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(external_id: &str, internal_id: &str) -> CourseMapping {
        CourseMapping {
            external_id: external_id.to_string(),
            internal_id: internal_id.to_string(),
            display_name: format!("COURSE {external_id}"),
            visible_id: format!("VIS-{internal_id}"),
        }
    }

    fn eligible(external_id: &str, title: &str) -> EligibleCourse {
        EligibleCourse {
            external_id: external_id.to_string(),
            course_title: title.to_string(),
        }
    }

    fn membership(internal_id: &str, display_name: &str) -> MembershipRow {
        MembershipRow {
            internal_id: internal_id.to_string(),
            display_name: display_name.to_string(),
            visible_id: format!("VIS-{internal_id}"),
        }
    }

    #[test]
    fn membership_rows_key_by_external_id_with_last_seen_wins() {
        let rows = vec![
            membership("_1_1", "ALGEBRA 202401.1005"),
            membership("_2_1", "ALGEBRA (COPY) 202401.1005"),
            membership("_3_1", "SEMINAR WITHOUT CODE"),
            membership("_4_1", "ANOTHER UNCODED COURSE"),
        ];
        let mappings = mappings_from_memberships(rows);

        assert_eq!(mappings.len(), 3);
        assert_eq!(mappings[0].internal_id, "_2_1");
        assert_eq!(mappings[0].external_id, "202401.1005");
        // coverage gaps are kept, one row each
        assert_eq!(mappings[1].external_id, EXTERNAL_ID_NOT_FOUND);
        assert_eq!(mappings[2].external_id, EXTERNAL_ID_NOT_FOUND);
    }

    #[test]
    fn task_preparation_joins_and_skips_unmapped_courses() {
        let roster = vec![mapping("202401.1005", "_1_1"), mapping("202401.2001", "_2_1")];
        let eligible_rows = vec![
            eligible("202401.1005", "ALGEBRA"),
            eligible("202401.1005", "ALGEBRA AGAIN"),
            eligible("202499.9999", "UNMAPPED"),
            eligible("202401.2001", "PHYSICS"),
        ];
        let tasks = prepare_tasks(&roster, &eligible_rows);

        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].external_id, "202401.1005");
        assert_eq!(tasks[0].course_title, "ALGEBRA");
        assert_eq!(tasks[1].internal_id, "_2_1");
    }

    #[test]
    fn preflight_marks_unmapped_courses() {
        let roster = vec![mapping("202401.1005", "_1_1")];
        let rows = preflight(
            &[eligible("202401.1005", "ALGEBRA"), eligible("202499.9999", "LOST")],
            &roster,
        );
        assert!(rows[0].ready);
        assert!(!rows[1].ready);
        let rendered = render_preflight(&rows);
        assert!(rendered.contains("202499.9999"));
    }

    #[test]
    fn probe_outcomes_map_onto_terminal_states() {
        assert_eq!(state_for_probe(&RoomProbe::Recording), RoomState::Recording);
        assert_eq!(
            state_for_probe(&RoomProbe::NotDetected),
            RoomState::AlertNotDetected
        );
        assert_eq!(
            state_for_probe(&RoomProbe::RoomMissing),
            RoomState::RoomNotFound
        );
        assert_eq!(
            state_for_probe(&RoomProbe::FrameUnresolved),
            RoomState::FrameError
        );
        let long = "x".repeat(200);
        match state_for_probe(&RoomProbe::Failed(long)) {
            RoomState::Error(message) => assert!(message.chars().count() <= 24),
            other => panic!("expected Error, got {other:?}"),
        }
    }

    struct ScriptedSensor;

    #[async_trait]
    impl RoomSensor for ScriptedSensor {
        async fn probe(&self, internal_id: &str) -> RoomProbe {
            match internal_id {
                "_live_" => RoomProbe::Recording,
                "_quiet_" => RoomProbe::NotDetected,
                "_stuck_" => RoomProbe::FrameUnresolved,
                _ => RoomProbe::Failed("sensor detonated for this room".to_string()),
            }
        }
    }

    fn agenda_row(external_id: &str) -> AgendaEntry {
        AgendaEntry {
            external_id: external_id.to_string(),
            start_time: "07:00".to_string(),
            course_title: format!("TITLE {external_id}"),
            instructor: "P. Alvarez".to_string(),
        }
    }

    #[tokio::test]
    async fn every_monitored_course_ends_in_exactly_one_terminal_state() {
        let roster = vec![
            mapping("1", "_live_"),
            mapping("2", "_quiet_"),
            mapping("3", "_stuck_"),
            mapping("4", "_odd_"),
        ];
        // course 5 has no mapping row at all
        let agenda: Vec<AgendaEntry> = ["1", "2", "3", "4", "5"]
            .iter()
            .map(|id| agenda_row(id))
            .collect();

        let mut snapshots: Vec<Vec<RoomState>> = Vec::new();
        run_monitor(&ScriptedSensor, &agenda, &roster, |board| {
            snapshots.push(board.iter().map(|row| row.state.clone()).collect());
        })
        .await;

        let last = snapshots.last().expect("at least one render");
        assert_eq!(last[0], RoomState::Recording);
        assert_eq!(last[1], RoomState::AlertNotDetected);
        assert_eq!(last[2], RoomState::FrameError);
        assert!(matches!(last[3], RoomState::Error(_)));
        assert_eq!(last[4], RoomState::RoomNotFound);
        assert!(last.iter().all(RoomState::is_terminal));

        // each course visibly passed through Checking, in order
        for (idx, _) in agenda.iter().enumerate() {
            assert!(snapshots
                .iter()
                .any(|snap| snap[idx] == RoomState::Checking));
        }
        // a terminal course never changes again
        let terminal_at = snapshots
            .iter()
            .position(|snap| snap[0].is_terminal())
            .expect("course 0 terminates");
        assert!(snapshots[terminal_at..]
            .iter()
            .all(|snap| snap[0] == snapshots[terminal_at][0]));
    }

    #[test]
    fn live_rows_truncate_and_keep_one_line_per_course() {
        let board = vec![LiveStatus {
            external_id: "202401.1005".to_string(),
            start_time: "07:00".to_string(),
            course_title: "A COURSE TITLE THAT GOES ON WELL PAST THE COLUMN WIDTH".to_string(),
            instructor: "SOME VERY LONG INSTRUCTOR NAME INDEED".to_string(),
            state: RoomState::Recording,
        }];
        let lines = render_live_rows(&board);
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("202401.1005"));
        assert!(!lines[1].contains("PAST THE COLUMN WIDTH"));
    }
}
