use chrono::{DateTime, Duration, Utc};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::models::Session;
use crate::timelapse::{TimelapseInfo, TimelapseSettings};

pub const SUMMARY_FILE_NAME: &str = "summary.txt";
pub const SESSION_INFO_FILE_NAME: &str = "session_info.txt";
pub const TIMELAPSE_INFO_FILE_NAME: &str = "timelapse_info.txt";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn format_duration(duration: Duration) -> String {
    let total = duration.num_seconds().max(0);
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{}h{}m{}s", h, m, s)
    } else if m > 0 {
        format!("{}m{}s", m, s)
    } else {
        format!("{}s", s)
    }
}

fn format_end(end: Option<DateTime<Utc>>) -> String {
    end.map(|t| t.format(TIME_FORMAT).to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn session_duration(session: &Session) -> String {
    format_duration(session.duration(session.end_time.unwrap_or(session.start_time)))
}

pub fn write_summary(dir: &Path, session: &Session, summary: &str) -> Result<PathBuf> {
    let mut content = String::from("Session Summary\n===============\n\n");
    let _ = writeln!(content, "Session ID: {}", session.id);
    let _ = writeln!(content, "Student: {}", session.student_name);
    let _ = writeln!(content, "Start Time: {}", session.start_time.format(TIME_FORMAT));
    let _ = writeln!(content, "End Time: {}", format_end(session.end_time));
    let _ = writeln!(content, "Duration: {}", session_duration(session));
    content.push_str("\nAnalysis:\n---------\n");
    content.push_str(summary);

    let path = dir.join(SUMMARY_FILE_NAME);
    fs::write(&path, content)?;
    Ok(path)
}

pub fn write_session_info(dir: &Path, session: &Session) -> Result<PathBuf> {
    let mut content = String::from("Session Information\n==================\n\n");
    let _ = writeln!(content, "Session ID: {}", session.id);
    let _ = writeln!(content, "Student: {}", session.student_name);
    let _ = writeln!(content, "Started: {}", session.start_time.format(TIME_FORMAT));
    let _ = writeln!(content, "Ended: {}", format_end(session.end_time));
    let _ = writeln!(content, "Duration: {}", session_duration(session));
    let _ = writeln!(content, "Status: {}", session.status);

    let path = dir.join(SESSION_INFO_FILE_NAME);
    fs::write(&path, content)?;
    Ok(path)
}

pub fn write_timelapse_info(
    dir: &Path,
    session: &Session,
    video: &Path,
    settings: &TimelapseSettings,
    info: &TimelapseInfo,
) -> Result<PathBuf> {
    let mut content = String::from("Timelapse Information\n====================\n\n");
    let _ = writeln!(content, "Student: {}", session.student_name);
    let _ = writeln!(content, "Session ID: {}", session.id);
    let _ = writeln!(
        content,
        "Video File: {}",
        video.file_name().unwrap_or_default().to_string_lossy()
    );
    let _ = writeln!(
        content,
        "Settings: {} fps, {} quality, {} format",
        settings.fps,
        settings.quality.as_str(),
        settings.format.profile().extension
    );
    let _ = writeln!(content, "\n{}", info);

    let path = dir.join(TIMELAPSE_INFO_FILE_NAME);
    fs::write(&path, content)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionStatus;
    use tempfile::TempDir;

    fn completed_session() -> Session {
        let start = Utc::now() - Duration::minutes(75);
        Session {
            id: 4,
            start_time: start,
            end_time: Some(start + Duration::seconds(3725)),
            description: "capture".to_string(),
            student_name: "Riley".to_string(),
            status: SessionStatus::Completed,
        }
    }

    #[test]
    fn durations_read_like_clock_spans() {
        assert_eq!(format_duration(Duration::seconds(42)), "42s");
        assert_eq!(format_duration(Duration::seconds(125)), "2m5s");
        assert_eq!(format_duration(Duration::seconds(3725)), "1h2m5s");
        assert_eq!(format_duration(Duration::seconds(-3)), "0s");
    }

    #[test]
    fn summary_file_has_header_and_analysis() {
        let dir = TempDir::new().unwrap();
        let path = write_summary(dir.path(), &completed_session(), "They built a maze.").unwrap();

        let text = fs::read_to_string(path).unwrap();
        assert!(text.starts_with("Session Summary"));
        assert!(text.contains("Session ID: 4"));
        assert!(text.contains("Duration: 1h2m5s"));
        assert!(text.ends_with("They built a maze."));
    }

    #[test]
    fn session_info_reports_status() {
        let dir = TempDir::new().unwrap();
        let path = write_session_info(dir.path(), &completed_session()).unwrap();
        assert!(fs::read_to_string(path).unwrap().contains("Status: completed"));
    }
}
