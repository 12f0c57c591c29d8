use std::path::PathBuf;

use crate::error::Result;
use crate::models::Screenshot;

pub const MAX_SUMMARY_FRAMES: usize = 8;

pub const DEFAULT_ANALYSIS_PROMPT: &str = "You are helping create a brief, positive report for parents about their child's learning session in a technology/computing class. Based on these screenshots, write a short, casual summary suitable for parents that includes what technology or software the student was working with, what project or activity they focused on, the skills they demonstrated, and their level of engagement. Use gender-neutral pronouns (they/them), keep technical terms simple, and write 3-4 sentences as a single natural paragraph without headers or bullet points.";

/// Turns a chronological image sequence into a narrative. `images` may be a
/// sample; `captured` is the number of screenshots the session really holds.
pub trait Summarizer {
    fn summarize(
        &self,
        images: &[PathBuf],
        captured: usize,
        prompt: &str,
        student_name: &str,
    ) -> Result<String>;
}

/// Local fallback that needs no network access.
#[derive(Debug, Clone, Default)]
pub struct OfflineSummarizer;

impl Summarizer for OfflineSummarizer {
    fn summarize(
        &self,
        _images: &[PathBuf],
        captured: usize,
        _prompt: &str,
        student_name: &str,
    ) -> Result<String> {
        let student = if student_name.is_empty() {
            "Student"
        } else {
            student_name
        };
        Ok(format!(
            "Session analysis for {}: {} screenshots captured",
            student, captured
        ))
    }
}

/// Picks up to `max` evenly spaced screenshots, preserving order.
pub fn sample_evenly(screenshots: &[Screenshot], max: usize) -> Vec<Screenshot> {
    if screenshots.len() <= max {
        return screenshots.to_vec();
    }
    if max == 0 {
        return Vec::new();
    }

    let step = screenshots.len() as f64 / max as f64;
    (0..max)
        .map(|i| {
            let index = ((i as f64 * step) as usize).min(screenshots.len() - 1);
            screenshots[index].clone()
        })
        .collect()
}

pub fn effective_prompt(configured: &str) -> &str {
    if configured.trim().is_empty() {
        DEFAULT_ANALYSIS_PROMPT
    } else {
        configured
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn shots(count: usize) -> Vec<Screenshot> {
        let base = Utc::now();
        (0..count)
            .map(|i| Screenshot {
                id: i as i64,
                session_id: 1,
                timestamp: base + Duration::seconds(i as i64),
                file_path: PathBuf::from(format!("f{}.jpg", i)),
                file_size: 1,
            })
            .collect()
    }

    #[test]
    fn short_sequences_are_kept_whole() {
        assert_eq!(sample_evenly(&shots(5), 8).len(), 5);
    }

    #[test]
    fn long_sequences_are_sampled_evenly() {
        let sampled = sample_evenly(&shots(16), 8);
        let ids: Vec<i64> = sampled.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![0, 2, 4, 6, 8, 10, 12, 14]);
    }

    #[test]
    fn empty_prompt_falls_back_to_default() {
        assert_eq!(effective_prompt("  "), DEFAULT_ANALYSIS_PROMPT);
        assert_eq!(effective_prompt("custom"), "custom");
    }

    #[test]
    fn offline_summary_names_student_and_count() {
        let images = vec![PathBuf::from("a.jpg"), PathBuf::from("b.jpg")];
        let text = OfflineSummarizer.summarize(&images, 2, "", "Riley").unwrap();
        assert_eq!(text, "Session analysis for Riley: 2 screenshots captured");
    }

    #[test]
    fn offline_summary_counts_every_capture_not_the_sample() {
        let sampled: Vec<PathBuf> = sample_evenly(&shots(20), MAX_SUMMARY_FRAMES)
            .into_iter()
            .map(|s| s.file_path)
            .collect();
        let text = OfflineSummarizer.summarize(&sampled, 20, "", "").unwrap();
        assert_eq!(text, "Session analysis for Student: 20 screenshots captured");
    }
}
