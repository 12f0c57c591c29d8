use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::capture::{CommandCapture, ScreenCapture};
use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::{Screenshot, Session};
use crate::report;
use crate::scheduler::{capture_tick, CaptureScheduler, StopToken, TickStats};
use crate::summary::{effective_prompt, sample_evenly, OfflineSummarizer, Summarizer, MAX_SUMMARY_FRAMES};
use crate::timelapse::{output_file_name, timelapse_info, TimelapseAssembler};

const SESSION_DESCRIPTION: &str = "Screenshot capture session";
const MIN_TIMELAPSE_SCREENSHOTS: usize = 3;
const EMPTY_SESSION_SUMMARY: &str = "No screenshots were captured during this session.";

pub struct CaptureOutcome {
    pub session: Session,
    pub stats: TickStats,
}

/// What post-processing produced for one session. Failures are collected
/// here rather than aborting the remaining steps.
#[derive(Debug, Default)]
pub struct ProcessingReport {
    pub session_id: i64,
    pub screenshot_count: usize,
    pub missing_files: usize,
    pub summary: Option<String>,
    pub summary_path: Option<PathBuf>,
    pub session_info_path: Option<PathBuf>,
    pub timelapse_path: Option<PathBuf>,
    pub failures: Vec<String>,
}

impl ProcessingReport {
    fn new(session_id: i64) -> Self {
        Self {
            session_id,
            ..Self::default()
        }
    }

    fn failed(&mut self, step: &str, error: &Error) {
        warn!(session_id = self.session_id, step, error = %error, "post-processing step failed");
        self.failures.push(format!("{}: {}", step, error));
    }
}

pub struct App {
    store: Database,
    config: Config,
    capture: Box<dyn ScreenCapture>,
    summarizer: Box<dyn Summarizer>,
    assembler: TimelapseAssembler,
}

impl App {
    pub fn new(config: Config) -> Result<Self> {
        let store = Database::open(&config.data_dir)?;
        let capture = CommandCapture::from_command_line(&config.capture_command)?;
        let assembler = match &config.encoder_path {
            Some(path) => TimelapseAssembler::with_encoder(path),
            None => TimelapseAssembler::new(),
        };
        match assembler.encoder() {
            Some(path) => debug!(encoder = %path.display(), "timelapse encoder resolved"),
            None => warn!("ffmpeg not found, timelapse videos will be skipped"),
        }
        Ok(Self::with_parts(
            store,
            config,
            Box::new(capture),
            Box::new(OfflineSummarizer),
            assembler,
        ))
    }

    pub fn with_parts(
        store: Database,
        config: Config,
        capture: Box<dyn ScreenCapture>,
        summarizer: Box<dyn Summarizer>,
        assembler: TimelapseAssembler,
    ) -> Self {
        Self {
            store,
            config,
            capture,
            summarizer,
            assembler,
        }
    }

    pub fn store(&self) -> &Database {
        &self.store
    }

    /// Starts a session and captures into it until `token` is cancelled or
    /// the session is stopped from elsewhere.
    pub fn start_capture(
        &self,
        interval: Duration,
        student_name: &str,
        token: StopToken,
    ) -> Result<CaptureOutcome> {
        let session = self.store.start_session(SESSION_DESCRIPTION, student_name)?;
        let session_dir = self.store.session_dir(session.id);
        info!(
            session_id = session.id,
            dir = %session_dir.display(),
            "capturing session"
        );

        let scheduler = CaptureScheduler::new(interval, token);
        let stats = scheduler.run(|| {
            if !self.store.get_session(session.id)?.is_active() {
                info!(session_id = session.id, "session was stopped elsewhere, ending capture");
                scheduler.stop();
                return Ok(());
            }
            match capture_tick(
                &self.store,
                self.capture.as_ref(),
                session.id,
                &session_dir,
                self.config.jpeg_quality,
            ) {
                Ok(_) => Ok(()),
                Err(Error::NoActiveSession) => {
                    scheduler.stop();
                    Err(Error::NoActiveSession)
                }
                Err(e) => Err(e),
            }
        });

        let session = self.store.get_session(session.id)?;
        Ok(CaptureOutcome { session, stats })
    }

    /// Finalizes the session if it is still active, then post-processes it.
    pub fn stop_and_summarize(&self, session_id: i64) -> Result<ProcessingReport> {
        let session = match self.store.stop_session(session_id) {
            Ok(session) => session,
            Err(Error::NoActiveSession) => self.store.get_session(session_id)?,
            Err(e) => return Err(e),
        };
        Ok(self.process_session(&session))
    }

    /// Post-processes every completed session that has no summary yet.
    pub fn analyze_pending(&self) -> Result<Vec<ProcessingReport>> {
        let pending = self.store.list_unanalyzed_sessions()?;
        info!(count = pending.len(), "analyzing pending sessions");
        Ok(pending.iter().map(|s| self.process_session(s)).collect())
    }

    fn process_session(&self, session: &Session) -> ProcessingReport {
        let mut outcome = ProcessingReport::new(session.id);
        let dir = self.store.session_dir(session.id);
        if let Err(e) = fs::create_dir_all(&dir) {
            outcome.failed("session directory", &Error::Io(e));
            return outcome;
        }

        let screenshots = match self.store.get_session_screenshots(session.id) {
            Ok(screenshots) => screenshots,
            Err(e) => {
                outcome.failed("screenshots", &e);
                return outcome;
            }
        };
        outcome.screenshot_count = screenshots.len();

        let present: Vec<Screenshot> = screenshots
            .into_iter()
            .filter(|s| s.file_path.is_file())
            .collect();
        outcome.missing_files = outcome.screenshot_count - present.len();
        if outcome.missing_files > 0 {
            warn!(
                session_id = session.id,
                missing = outcome.missing_files,
                "some screenshot files are missing"
            );
        }
        info!(session_id = session.id, screenshots = present.len(), "processing session");

        let summary = if present.is_empty() {
            Ok(EMPTY_SESSION_SUMMARY.to_string())
        } else {
            let images: Vec<PathBuf> = sample_evenly(&present, MAX_SUMMARY_FRAMES)
                .into_iter()
                .map(|s| s.file_path)
                .collect();
            self.summarizer
                .summarize(
                    &images,
                    outcome.screenshot_count,
                    effective_prompt(&self.config.analysis_prompt),
                    &session.student_name,
                )
                .and_then(|text| {
                    if text.trim().is_empty() {
                        Err(Error::summarizer("returned an empty summary"))
                    } else {
                        Ok(text)
                    }
                })
        };
        match summary.and_then(|text| {
            let path = report::write_summary(&dir, session, &text)?;
            Ok((text, path))
        }) {
            Ok((text, path)) => {
                outcome.summary = Some(text);
                outcome.summary_path = Some(path);
            }
            Err(e) => outcome.failed("summary", &e),
        }

        match report::write_session_info(&dir, session) {
            Ok(path) => outcome.session_info_path = Some(path),
            Err(e) => outcome.failed("session info", &e),
        }

        if present.len() >= MIN_TIMELAPSE_SCREENSHOTS {
            let settings = &self.config.timelapse;
            let output = dir.join(output_file_name(
                &session.student_name,
                session.id,
                settings.format,
            ));
            match self.assembler.assemble(&present, &output, settings) {
                Ok(video) => {
                    let info = timelapse_info(&present, settings);
                    if let Err(e) =
                        report::write_timelapse_info(&dir, session, &video, settings, &info)
                    {
                        outcome.failed("timelapse info", &e);
                    }
                    outcome.timelapse_path = Some(video);
                }
                Err(e) => outcome.failed("timelapse", &e),
            }
        } else {
            info!(
                session_id = session.id,
                screenshots = present.len(),
                "skipping timelapse, need at least {} screenshots",
                MIN_TIMELAPSE_SCREENSHOTS
            );
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionStatus;
    use image::{DynamicImage, RgbImage};
    use std::cell::RefCell;
    use tempfile::TempDir;

    struct SolidCapture;

    impl ScreenCapture for SolidCapture {
        fn capture_frame(&self) -> Result<DynamicImage> {
            Ok(DynamicImage::ImageRgb8(RgbImage::new(4, 4)))
        }
    }

    #[derive(Default)]
    struct RecordingSummarizer {
        calls: RefCell<Vec<(usize, String)>>,
    }

    impl Summarizer for std::rc::Rc<RecordingSummarizer> {
        fn summarize(
            &self,
            images: &[PathBuf],
            _captured: usize,
            _prompt: &str,
            student_name: &str,
        ) -> Result<String> {
            self.calls
                .borrow_mut()
                .push((images.len(), student_name.to_string()));
            Ok(format!("{} worked on {} frames", student_name, images.len()))
        }
    }

    struct FailingSummarizer;

    impl Summarizer for FailingSummarizer {
        fn summarize(&self, _: &[PathBuf], _: usize, _: &str, _: &str) -> Result<String> {
            Err(Error::summarizer("service unreachable"))
        }
    }

    fn app_in(dir: &TempDir, summarizer: Box<dyn Summarizer>, assembler: TimelapseAssembler) -> App {
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let store = Database::open(&config.data_dir).unwrap();
        App::with_parts(store, config, Box::new(SolidCapture), summarizer, assembler)
    }

    fn no_encoder() -> TimelapseAssembler {
        TimelapseAssembler::with_encoder("/nonexistent/ffmpeg")
    }

    fn write_shots(app: &App, session_id: i64, count: usize) {
        let dir = app.store().session_dir(session_id);
        for i in 0..count {
            let path = dir.join(format!("shot_{}.jpg", i));
            fs::write(&path, b"jpeg").unwrap();
            app.store().record_screenshot(session_id, &path).unwrap();
        }
    }

    #[test]
    fn capture_runs_until_token_is_cancelled() {
        let dir = TempDir::new().unwrap();
        let app = app_in(&dir, Box::new(OfflineSummarizer), no_encoder());
        let token = StopToken::new();
        token.cancel();

        let outcome = app
            .start_capture(Duration::from_secs(60), "Riley", token)
            .unwrap();

        assert_eq!(outcome.stats.attempted, 0);
        assert!(outcome.session.is_active());
        assert_eq!(outcome.session.student_name, "Riley");
    }

    #[test]
    fn capture_ends_when_session_is_stopped_elsewhere() {
        let dir = TempDir::new().unwrap();
        let app = app_in(&dir, Box::new(OfflineSummarizer), no_encoder());

        let observer = Database::open(dir.path()).unwrap();
        let token = StopToken::new();
        let stopper = {
            let token = token.clone();
            std::thread::spawn(move || {
                for _ in 0..500 {
                    if let Some(active) = observer.get_active_session().unwrap() {
                        if !observer.get_session_screenshots(active.id).unwrap().is_empty() {
                            observer.stop_session(active.id).unwrap();
                            return;
                        }
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                token.cancel();
            })
        };

        let outcome = app
            .start_capture(Duration::from_millis(20), "", token.clone())
            .unwrap();
        stopper.join().unwrap();

        assert_eq!(outcome.session.status, SessionStatus::Completed);
        assert!(token.is_cancelled());
        assert!(outcome.stats.succeeded >= 1);
    }

    #[test]
    fn stop_and_summarize_writes_reports() {
        let dir = TempDir::new().unwrap();
        let summarizer = std::rc::Rc::new(RecordingSummarizer::default());
        let app = app_in(&dir, Box::new(summarizer.clone()), no_encoder());
        let session = app.store().start_session("lesson", "Riley").unwrap();
        write_shots(&app, session.id, 12);

        let processed = app.stop_and_summarize(session.id).unwrap();

        assert_eq!(processed.screenshot_count, 12);
        assert_eq!(
            processed.summary.as_deref(),
            Some("Riley worked on 8 frames")
        );
        assert!(processed.summary_path.unwrap().exists());
        assert!(processed.session_info_path.unwrap().exists());
        assert_eq!(summarizer.calls.borrow().as_slice(), &[(8, "Riley".to_string())]);

        // No encoder: the timelapse step fails without affecting the rest.
        assert!(processed.timelapse_path.is_none());
        assert_eq!(processed.failures.len(), 1);
        assert!(processed.failures[0].starts_with("timelapse"));

        let stored = app.store().get_session(session.id).unwrap();
        assert_eq!(stored.status, SessionStatus::Completed);
    }

    #[test]
    fn offline_summary_reports_every_screenshot_taken() {
        let dir = TempDir::new().unwrap();
        let app = app_in(&dir, Box::new(OfflineSummarizer), no_encoder());
        let session = app.store().start_session("lesson", "Riley").unwrap();
        write_shots(&app, session.id, 12);

        let processed = app.stop_and_summarize(session.id).unwrap();

        assert_eq!(
            processed.summary.as_deref(),
            Some("Session analysis for Riley: 12 screenshots captured")
        );
        let written = fs::read_to_string(processed.summary_path.unwrap()).unwrap();
        assert!(written.ends_with("12 screenshots captured"));
    }

    #[test]
    fn configured_encoder_path_is_used() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            data_dir: dir.path().join("data"),
            capture_command: "true".to_string(),
            encoder_path: Some(dir.path().join("custom-ffmpeg")),
            ..Config::default()
        };
        let app = App::new(config).unwrap();
        assert_eq!(
            app.assembler.encoder(),
            Some(dir.path().join("custom-ffmpeg").as_path())
        );
    }

    #[test]
    fn already_stopped_session_is_still_processed() {
        let dir = TempDir::new().unwrap();
        let app = app_in(&dir, Box::new(OfflineSummarizer), no_encoder());
        let session = app.store().start_session("lesson", "").unwrap();
        write_shots(&app, session.id, 2);
        app.store().stop_session(session.id).unwrap();

        let processed = app.stop_and_summarize(session.id).unwrap();

        assert_eq!(
            processed.summary.as_deref(),
            Some("Session analysis for Student: 2 screenshots captured")
        );
        assert!(processed.failures.is_empty());
    }

    #[test]
    fn unknown_session_is_not_found() {
        let dir = TempDir::new().unwrap();
        let app = app_in(&dir, Box::new(OfflineSummarizer), no_encoder());
        assert!(matches!(app.stop_and_summarize(99), Err(Error::NotFound(99))));
    }

    #[test]
    fn summarizer_failure_is_reported_not_fatal() {
        let dir = TempDir::new().unwrap();
        let app = app_in(&dir, Box::new(FailingSummarizer), no_encoder());
        let session = app.store().start_session("lesson", "").unwrap();
        write_shots(&app, session.id, 1);

        let processed = app.stop_and_summarize(session.id).unwrap();

        assert!(processed.summary.is_none());
        assert!(processed.session_info_path.is_some());
        assert!(processed.failures[0].contains("service unreachable"));
    }

    #[test]
    fn dangling_files_are_excluded_before_summarizing() {
        let dir = TempDir::new().unwrap();
        let summarizer = std::rc::Rc::new(RecordingSummarizer::default());
        let app = app_in(&dir, Box::new(summarizer.clone()), no_encoder());
        let session = app.store().start_session("lesson", "Sam").unwrap();
        write_shots(&app, session.id, 2);
        for shot in app.store().get_session_screenshots(session.id).unwrap().iter().take(1) {
            fs::remove_file(&shot.file_path).unwrap();
        }

        let processed = app.stop_and_summarize(session.id).unwrap();

        assert_eq!(processed.missing_files, 1);
        assert_eq!(summarizer.calls.borrow().as_slice(), &[(1, "Sam".to_string())]);
    }

    #[test]
    fn analyze_pending_covers_sessions_without_summary() {
        let dir = TempDir::new().unwrap();
        let app = app_in(&dir, Box::new(OfflineSummarizer), no_encoder());

        let first = app.store().start_session("a", "").unwrap();
        app.store().stop_session(first.id).unwrap();
        let second = app.store().start_session("b", "").unwrap();
        app.store().stop_session(second.id).unwrap();
        app.stop_and_summarize(second.id).unwrap();

        let reports = app.analyze_pending().unwrap();
        let ids: Vec<i64> = reports.iter().map(|r| r.session_id).collect();
        assert_eq!(ids, vec![first.id]);
        assert_eq!(reports[0].summary.as_deref(), Some(EMPTY_SESSION_SUMMARY));
        assert!(app.analyze_pending().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn enough_screenshots_produce_a_timelapse() {
        use std::os::unix::fs::PermissionsExt;

        let tools = TempDir::new().unwrap();
        let encoder = tools.path().join("fake-ffmpeg");
        fs::write(&encoder, "#!/bin/sh\nfor last; do :; done\nprintf video > \"$last\"\n").unwrap();
        fs::set_permissions(&encoder, fs::Permissions::from_mode(0o755)).unwrap();

        let dir = TempDir::new().unwrap();
        let app = app_in(
            &dir,
            Box::new(OfflineSummarizer),
            TimelapseAssembler::with_encoder(&encoder),
        );
        let session = app.store().start_session("lesson", "Ada L").unwrap();
        write_shots(&app, session.id, 3);

        let processed = app.stop_and_summarize(session.id).unwrap();

        let video = processed.timelapse_path.unwrap();
        assert_eq!(
            video.file_name().unwrap().to_string_lossy(),
            format!("Ada_L_session_{}_timelapse.mp4", session.id)
        );
        assert!(video.exists());
        assert!(app
            .store()
            .session_dir(session.id)
            .join(report::TIMELAPSE_INFO_FILE_NAME)
            .exists());
        assert!(processed.failures.is_empty());
    }
}
