use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::config::OpenAIConfig;
use crate::extract;
use crate::llm;

/// 繰り返し設定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recurrence {
    #[default]
    None,
    Daily,
    Weekly,
    Monthly,
}

impl Recurrence {
    /// Google Calendar の RRULE 形式へ変換
    pub fn to_rrule(self) -> Option<Vec<String>> {
        match self {
            Recurrence::None => None,
            Recurrence::Daily => Some(vec!["RRULE:FREQ=DAILY;COUNT=30".to_string()]),
            Recurrence::Weekly => Some(vec!["RRULE:FREQ=WEEKLY;COUNT=15".to_string()]),
            Recurrence::Monthly => Some(vec!["RRULE:FREQ=MONTHLY;COUNT=6".to_string()]),
        }
    }
}

/// モデルが抽出したスケジュールイベント
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedEvent {
    /// イベント名
    pub title: String,

    /// 日付（YYYY-MM-DD）
    pub date: String,

    /// 開始時刻（HH:MM）
    pub start_time: String,

    /// 終了時刻（HH:MM）
    pub end_time: String,

    /// 場所
    #[serde(default)]
    pub location: String,

    /// 補足説明
    #[serde(default)]
    pub description: String,

    /// 繰り返し設定
    #[serde(default)]
    pub recurrence: Recurrence,
}

impl ParsedEvent {
    /// 必須項目と日付・時刻の形式を検証する
    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            anyhow::bail!("event has an empty title");
        }

        NaiveDate::parse_from_str(&self.date, "%Y-%m-%d")
            .with_context(|| format!("invalid date format: {}", self.date))?;

        let start = NaiveTime::parse_from_str(&self.start_time, "%H:%M")
            .with_context(|| format!("invalid start time: {}", self.start_time))?;
        let end = NaiveTime::parse_from_str(&self.end_time, "%H:%M")
            .with_context(|| format!("invalid end time: {}", self.end_time))?;

        if start >= end {
            anyhow::bail!(
                "start time {} is not before end time {}",
                self.start_time,
                self.end_time
            );
        }

        Ok(())
    }

    /// 開始日時を返す（検証済みであることが前提）
    pub fn start_datetime(&self) -> Result<NaiveDateTime> {
        parse_naive_datetime(&self.date, &self.start_time)
    }

    /// 終了日時を返す
    pub fn end_datetime(&self) -> Result<NaiveDateTime> {
        parse_naive_datetime(&self.date, &self.end_time)
    }
}

fn parse_naive_datetime(date: &str, time: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(&format!("{} {}", date, time), "%Y-%m-%d %H:%M")
        .with_context(|| format!("invalid datetime: {} {}", date, time))
}

/// スケジュールファイル（PDF・画像）をパースして検証済みイベントを返す
pub async fn parse_schedule_file(path: &Path, config: &OpenAIConfig) -> Result<Vec<ParsedEvent>> {
    let raw_text = extract::extract_from_file(path, config)
        .await
        .with_context(|| format!("failed to extract text from {}", path.display()))?;

    parse_schedule_input(&raw_text, config).await
}

/// 生テキストのスケジュールをパースして検証済みイベントを返す
pub async fn parse_schedule_input(
    schedule_text: &str,
    config: &OpenAIConfig,
) -> Result<Vec<ParsedEvent>> {
    if schedule_text.trim().is_empty() {
        anyhow::bail!("no text to parse");
    }

    info!(
        "Parsing schedule text ({} characters)",
        schedule_text.len()
    );

    let events = llm::parse_schedule_text(config, schedule_text).await?;

    if events.is_empty() {
        warn!("No events extracted from text");
        return Ok(Vec::new());
    }

    info!("Extracted {} event(s) from model output", events.len());

    // 検証に通らないイベントはスキップする（致命的エラーにしない）
    let mut validated = Vec::new();
    for event in events {
        match event.validate() {
            Ok(()) => validated.push(event),
            Err(e) => warn!("Skipping invalid event '{}': {}", event.title, e),
        }
    }

    info!("{} valid event(s) after validation", validated.len());
    Ok(validated)
}

/// パース結果を日付ごとにまとめた読みやすいサマリを生成する
pub fn format_summary(events: &[ParsedEvent]) -> String {
    if events.is_empty() {
        return "イベントはありません。".to_string();
    }

    let mut by_date: BTreeMap<&str, Vec<&ParsedEvent>> = BTreeMap::new();
    for event in events {
        by_date.entry(event.date.as_str()).or_default().push(event);
    }

    let mut summary = format!("{} 件のイベント:\n\n", events.len());

    for (date, mut day_events) in by_date {
        day_events.sort_by(|a, b| a.start_time.cmp(&b.start_time));

        let heading = NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .map(|d| d.format("%A, %B %d, %Y").to_string())
            .unwrap_or_else(|_| date.to_string());

        summary.push_str(&heading);
        summary.push_str(":\n");

        for event in day_events {
            summary.push_str(&format!(
                "  ・{}-{}: {}",
                event.start_time, event.end_time, event.title
            ));
            if !event.location.is_empty() {
                summary.push_str(&format!(" ({})", event.location));
            }
            summary.push('\n');
        }

        summary.push('\n');
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> ParsedEvent {
        ParsedEvent {
            title: "Machine Learning".to_string(),
            date: "2025-11-26".to_string(),
            start_time: "10:00".to_string(),
            end_time: "11:30".to_string(),
            location: "Room 101".to_string(),
            description: String::new(),
            recurrence: Recurrence::None,
        }
    }

    #[test]
    fn valid_event_passes_validation() {
        assert!(sample_event().validate().is_ok());
    }

    #[test]
    fn empty_title_is_rejected() {
        let mut event = sample_event();
        event.title = "  ".to_string();
        assert!(event.validate().is_err());
    }

    #[test]
    fn bad_date_is_rejected() {
        let mut event = sample_event();
        event.date = "26/11/2025".to_string();
        assert!(event.validate().is_err());
    }

    #[test]
    fn bad_time_is_rejected() {
        let mut event = sample_event();
        event.start_time = "10am".to_string();
        assert!(event.validate().is_err());
    }

    #[test]
    fn start_after_end_is_rejected() {
        let mut event = sample_event();
        event.start_time = "12:00".to_string();
        event.end_time = "11:00".to_string();
        assert!(event.validate().is_err());
    }

    #[test]
    fn recurrence_maps_to_rrule() {
        assert_eq!(Recurrence::None.to_rrule(), None);
        assert_eq!(
            Recurrence::Weekly.to_rrule(),
            Some(vec!["RRULE:FREQ=WEEKLY;COUNT=15".to_string()])
        );
    }

    #[test]
    fn recurrence_deserializes_lowercase() {
        let event: ParsedEvent = serde_json::from_value(serde_json::json!({
            "title": "Lab",
            "date": "2025-11-27",
            "start_time": "14:00",
            "end_time": "16:00",
            "recurrence": "weekly"
        }))
        .unwrap();
        assert_eq!(event.recurrence, Recurrence::Weekly);
    }

    #[test]
    fn summary_groups_by_date_and_sorts_by_time() {
        let mut later = sample_event();
        later.title = "Lab Session".to_string();
        later.start_time = "14:00".to_string();
        later.end_time = "16:00".to_string();

        let mut other_day = sample_event();
        other_day.title = "Data Structures".to_string();
        other_day.date = "2025-11-27".to_string();

        let summary = format_summary(&[later.clone(), other_day, sample_event()]);

        let ml_pos = summary.find("Machine Learning").unwrap();
        let lab_pos = summary.find("Lab Session").unwrap();
        let ds_pos = summary.find("Data Structures").unwrap();

        // 同日内は開始時刻順、日付は昇順
        assert!(ml_pos < lab_pos);
        assert!(lab_pos < ds_pos);
        assert!(summary.contains("(Room 101)"));
    }
}
