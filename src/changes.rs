use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use log::{info, warn};
use serde::Deserialize;

use crate::calendar::{CalendarEvent, EventPatch, GoogleCalendarClient};
use crate::config::AppConfig;
use crate::llm;

/// モデルが解釈した操作の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Move,
    Delete,
    Modify,
    Create,
    #[serde(other)]
    #[default]
    Unknown,
}

/// 変更内容
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Modifications {
    #[serde(default)]
    pub new_date: Option<String>,
    #[serde(default)]
    pub new_start_time: Option<String>,
    #[serde(default)]
    pub new_end_time: Option<String>,
    #[serde(default)]
    pub new_title: Option<String>,
    #[serde(default)]
    pub new_location: Option<String>,
    #[serde(default)]
    pub new_description: Option<String>,
}

/// モデルがパースした変更コマンド
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModificationCommand {
    #[serde(default)]
    pub action: Action,

    /// 対象イベントを特定するためのテキスト（名前や日付を含む）
    #[serde(default)]
    pub event_identifier: String,

    /// イベント特定の確信度（0.0-1.0）
    #[serde(default)]
    pub confidence: f64,

    #[serde(default)]
    pub modifications: Modifications,

    #[serde(default)]
    pub reasoning: String,
}

/// コマンド処理の結果
#[derive(Debug)]
pub enum ChangeOutcome {
    /// 変更を適用した
    Applied {
        message: String,
        changes: Vec<(String, String)>,
        event: CalendarEvent,
    },
    /// イベントを削除した
    Deleted { title: String },
    /// 該当するイベントが複数見つかった
    Ambiguous { candidates: Vec<CalendarEvent> },
    /// 該当するイベントが見つからなかった
    NotFound { searched_for: String },
    /// コマンドを実行できなかった
    Rejected { reason: String },
}

/// 自然言語コマンドによるカレンダー変更を担当する
pub struct ChangeManager<'a> {
    config: &'a AppConfig,
    calendar: &'a GoogleCalendarClient,
}

impl<'a> ChangeManager<'a> {
    pub fn new(config: &'a AppConfig, calendar: &'a GoogleCalendarClient) -> Self {
        Self { config, calendar }
    }

    /// 自然言語の変更コマンドを処理する
    pub async fn process_command(&self, command: &str) -> Result<ChangeOutcome> {
        info!("Processing modification command: \"{}\"", command);

        // [1/4] コンテキストとして直近のイベントを取得
        let now = chrono::Local::now().naive_local();
        let horizon = now + chrono::Duration::days(self.config.general.days_ahead);
        let events = self
            .calendar
            .list_events(now, horizon, self.config.general.max_events)
            .await
            .context("failed to fetch context events")?;

        info!("Found {} upcoming events for context", events.len());

        // [2/4] コマンドをモデルでパース
        let parsed =
            llm::parse_modification_command(&self.config.openai, command, &events).await?;

        info!(
            "Parsed action: {:?}, target: '{}', confidence: {:.2}",
            parsed.action, parsed.event_identifier, parsed.confidence
        );

        if parsed.confidence < 0.5 {
            let reason = if parsed.reasoning.is_empty() {
                "コマンドが曖昧で対象を特定できませんでした".to_string()
            } else {
                parsed.reasoning.clone()
            };
            return Ok(ChangeOutcome::Rejected { reason });
        }

        // [3/4] 対象イベントを検索
        let mut matches = find_matching_events(&parsed.event_identifier, &events);

        if matches.is_empty() {
            // コンテキスト期間の外にある可能性があるのでカレンダー検索でも探す
            match self
                .calendar
                .search_events(&parsed.event_identifier, 10)
                .await
            {
                Ok(found) => {
                    matches = find_matching_events(&parsed.event_identifier, &found);
                }
                Err(e) => warn!("Calendar search fallback failed: {}", e),
            }
        }

        if matches.is_empty() {
            return Ok(ChangeOutcome::NotFound {
                searched_for: parsed.event_identifier,
            });
        }

        if matches.len() > 1 {
            return Ok(ChangeOutcome::Ambiguous { candidates: matches });
        }

        let target = matches.remove(0);
        info!(
            "Matched event: {}",
            target.summary.as_deref().unwrap_or("Untitled")
        );

        // [4/4] 操作を実行
        match parsed.action {
            Action::Move => self.move_event(&target, &parsed.modifications).await,
            Action::Delete => self.delete_event(&target).await,
            Action::Modify => self.modify_event(&target, &parsed.modifications).await,
            other => Ok(ChangeOutcome::Rejected {
                reason: format!("この種類の操作には対応していません: {:?}", other),
            }),
        }
    }

    /// イベントを別の日時に移動する
    async fn move_event(
        &self,
        event: &CalendarEvent,
        modifications: &Modifications,
    ) -> Result<ChangeOutcome> {
        let Some(event_id) = event.id.as_deref() else {
            return Ok(ChangeOutcome::Rejected {
                reason: "イベントIDが取得できませんでした".to_string(),
            });
        };

        if !event.has_date_time() {
            return Ok(ChangeOutcome::Rejected {
                reason: "終日イベントは移動できません".to_string(),
            });
        }

        let (Some(start), Some(end)) = (event.start_naive(), event.end_naive()) else {
            return Ok(ChangeOutcome::Rejected {
                reason: "イベントの日時を解釈できませんでした".to_string(),
            });
        };

        let (new_start, new_end) = compute_move(start, end, modifications)?;

        let patch = EventPatch {
            start_datetime: Some(new_start),
            end_datetime: Some(new_end),
            ..Default::default()
        };

        let updated = self.calendar.update_event(event_id, &patch).await?;

        Ok(ChangeOutcome::Applied {
            message: "予定を移動しました".to_string(),
            changes: vec![
                (
                    "旧開始".to_string(),
                    start.format("%Y-%m-%d %H:%M").to_string(),
                ),
                (
                    "新開始".to_string(),
                    new_start.format("%Y-%m-%d %H:%M").to_string(),
                ),
            ],
            event: updated,
        })
    }

    /// イベントを削除する
    async fn delete_event(&self, event: &CalendarEvent) -> Result<ChangeOutcome> {
        let Some(event_id) = event.id.as_deref() else {
            return Ok(ChangeOutcome::Rejected {
                reason: "イベントIDが取得できませんでした".to_string(),
            });
        };

        self.calendar.delete_event(event_id).await?;

        Ok(ChangeOutcome::Deleted {
            title: event.summary.clone().unwrap_or_else(|| "Untitled".to_string()),
        })
    }

    /// タイトル・場所・説明を変更する
    async fn modify_event(
        &self,
        event: &CalendarEvent,
        modifications: &Modifications,
    ) -> Result<ChangeOutcome> {
        let Some(event_id) = event.id.as_deref() else {
            return Ok(ChangeOutcome::Rejected {
                reason: "イベントIDが取得できませんでした".to_string(),
            });
        };

        let patch = EventPatch {
            summary: modifications.new_title.clone(),
            location: modifications.new_location.clone(),
            description: modifications.new_description.clone(),
            ..Default::default()
        };

        if patch.is_empty() {
            return Ok(ChangeOutcome::Rejected {
                reason: "変更内容が指定されていません".to_string(),
            });
        }

        let mut changes = Vec::new();
        if let Some(title) = &patch.summary {
            changes.push(("新タイトル".to_string(), title.clone()));
        }
        if let Some(location) = &patch.location {
            changes.push(("新しい場所".to_string(), location.clone()));
        }
        if let Some(description) = &patch.description {
            changes.push(("新しい説明".to_string(), description.clone()));
        }

        let updated = self.calendar.update_event(event_id, &patch).await?;

        Ok(ChangeOutcome::Applied {
            message: "予定を変更しました".to_string(),
            changes,
            event: updated,
        })
    }
}

/// 識別子に含まれるISO形式の日付を取り出す
/// 見つかった場合は（日付, 日付より前の部分を整えた名前）を返す
pub(crate) fn extract_iso_date(identifier: &str) -> Option<(NaiveDate, String)> {
    if identifier.len() < 10 {
        return None;
    }

    for i in 0..=identifier.len() - 10 {
        if !identifier.is_char_boundary(i) || !identifier.is_char_boundary(i + 10) {
            continue;
        }

        let candidate = &identifier[i..i + 10];
        if let Ok(date) = NaiveDate::parse_from_str(candidate, "%Y-%m-%d") {
            let name = identifier[..i]
                .trim()
                .trim_end_matches([':', 'T', ' '])
                .trim()
                .to_lowercase();
            return Some((date, name));
        }
    }

    None
}

/// 識別子に一致するイベントを検索する
/// 名前はタイトル・場所・説明に対する部分一致、日付が含まれていれば日付でも絞り込む
pub(crate) fn find_matching_events(
    identifier: &str,
    events: &[CalendarEvent],
) -> Vec<CalendarEvent> {
    let (target_date, event_name) = match extract_iso_date(identifier) {
        Some((date, name)) => (Some(date), name),
        None => (None, identifier.trim().to_lowercase()),
    };

    let mut matching = Vec::new();

    for event in events {
        let title = event.summary.as_deref().unwrap_or("").to_lowercase();
        let location = event.location.as_deref().unwrap_or("").to_lowercase();
        let description = event.description.as_deref().unwrap_or("").to_lowercase();

        let name_matches = title.contains(&event_name)
            || (!title.is_empty() && event_name.contains(&title))
            || (!location.is_empty() && location.contains(&event_name))
            || (!description.is_empty() && description.contains(&event_name));

        if !name_matches {
            continue;
        }

        if let Some(date) = target_date {
            match event.start_naive() {
                Some(start) if start.date() == date => matching.push(event.clone()),
                Some(_) => {}
                // 日時のないイベントは日付で除外できないので候補に残す
                None => matching.push(event.clone()),
            }
        } else {
            matching.push(event.clone());
        }
    }

    matching
}

/// 移動後の開始・終了日時を計算する
/// 日付だけの変更では元の時刻と長さを保ち、開始時刻の変更でも長さを保つ
pub(crate) fn compute_move(
    start: NaiveDateTime,
    end: NaiveDateTime,
    modifications: &Modifications,
) -> Result<(NaiveDateTime, NaiveDateTime)> {
    let duration = end.signed_duration_since(start);

    let mut new_start = start;
    let mut new_end = end;

    if let Some(new_date) = &modifications.new_date {
        let date = NaiveDate::parse_from_str(new_date, "%Y-%m-%d")
            .with_context(|| format!("invalid date in command: {}", new_date))?;
        new_start = date.and_time(new_start.time());
        new_end = new_start + duration;
    }

    if let Some(new_time) = &modifications.new_start_time {
        let time = NaiveTime::parse_from_str(new_time, "%H:%M")
            .with_context(|| format!("invalid start time in command: {}", new_time))?;
        new_start = new_start.date().and_time(time);
        new_end = new_start + duration;
    }

    if let Some(new_time) = &modifications.new_end_time {
        let time = NaiveTime::parse_from_str(new_time, "%H:%M")
            .with_context(|| format!("invalid end time in command: {}", new_time))?;
        new_end = new_end.date().and_time(time);
    }

    if new_end <= new_start {
        anyhow::bail!(
            "resulting end {} is not after start {}",
            new_end,
            new_start
        );
    }

    Ok((new_start, new_end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::EventDateTime;

    fn event(title: &str, start: &str) -> CalendarEvent {
        CalendarEvent {
            id: Some("ev1".to_string()),
            summary: Some(title.to_string()),
            start: Some(EventDateTime {
                date_time: Some(format!("{}+01:00", start)),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn extracts_embedded_iso_date() {
        let (date, name) =
            extract_iso_date("Machine Learning: 2025-12-04T11:00:00").unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2025, 12, 4).unwrap());
        assert_eq!(name, "machine learning");
    }

    #[test]
    fn identifier_without_date_returns_none() {
        assert!(extract_iso_date("Machine Learning").is_none());
        assert!(extract_iso_date("short").is_none());
    }

    #[test]
    fn matches_by_name_substring() {
        let events = vec![
            event("Machine Learning", "2025-12-04T11:00:00"),
            event("Soccer Practice", "2025-12-04T13:00:00"),
        ];

        let matches = find_matching_events("machine learning", &events);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].summary.as_deref(), Some("Machine Learning"));
    }

    #[test]
    fn matches_when_identifier_contains_title() {
        let events = vec![event("Machine Learning", "2025-12-04T11:00:00")];
        let matches = find_matching_events("advanced machine learning course", &events);
        assert_eq!(matches.len(), 1);
    }

    #[test]
    fn date_in_identifier_filters_matches() {
        let events = vec![
            event("Machine Learning", "2025-12-04T11:00:00"),
            event("Machine Learning", "2025-12-11T11:00:00"),
        ];

        let matches = find_matching_events("Machine Learning: 2025-12-04", &events);
        assert_eq!(matches.len(), 1);
        assert_eq!(
            matches[0].start_naive().unwrap().format("%d").to_string(),
            "04"
        );
    }

    #[test]
    fn unrelated_events_do_not_match() {
        let events = vec![event("Soccer Practice", "2025-12-04T13:00:00")];
        assert!(find_matching_events("neural networks", &events).is_empty());
    }

    fn dt(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
    }

    #[test]
    fn date_change_preserves_time_and_duration() {
        let modifications = Modifications {
            new_date: Some("2025-12-12".to_string()),
            ..Default::default()
        };

        let (start, end) =
            compute_move(dt("2025-12-04 11:00"), dt("2025-12-04 12:30"), &modifications)
                .unwrap();
        assert_eq!(start, dt("2025-12-12 11:00"));
        assert_eq!(end, dt("2025-12-12 12:30"));
    }

    #[test]
    fn start_time_change_preserves_duration() {
        let modifications = Modifications {
            new_start_time: Some("14:00".to_string()),
            ..Default::default()
        };

        let (start, end) =
            compute_move(dt("2025-12-04 11:00"), dt("2025-12-04 12:30"), &modifications)
                .unwrap();
        assert_eq!(start, dt("2025-12-04 14:00"));
        assert_eq!(end, dt("2025-12-04 15:30"));
    }

    #[test]
    fn explicit_end_time_overrides_duration() {
        let modifications = Modifications {
            new_start_time: Some("14:00".to_string()),
            new_end_time: Some("16:00".to_string()),
            ..Default::default()
        };

        let (start, end) =
            compute_move(dt("2025-12-04 11:00"), dt("2025-12-04 12:30"), &modifications)
                .unwrap();
        assert_eq!(start, dt("2025-12-04 14:00"));
        assert_eq!(end, dt("2025-12-04 16:00"));
    }

    #[test]
    fn end_before_start_is_rejected() {
        let modifications = Modifications {
            new_end_time: Some("09:00".to_string()),
            ..Default::default()
        };

        assert!(
            compute_move(dt("2025-12-04 11:00"), dt("2025-12-04 12:30"), &modifications)
                .is_err()
        );
    }

    #[test]
    fn unknown_action_deserializes_without_error() {
        let command: ModificationCommand = serde_json::from_value(serde_json::json!({
            "action": "reschedule",
            "event_identifier": "AI",
            "confidence": 0.9
        }))
        .unwrap();
        assert_eq!(command.action, Action::Unknown);
    }

    #[test]
    fn full_command_deserializes() {
        let command: ModificationCommand = serde_json::from_value(serde_json::json!({
            "action": "move",
            "event_identifier": "Machine Learning",
            "confidence": 0.95,
            "modifications": {
                "new_date": "2025-12-12",
                "new_start_time": "14:00"
            },
            "reasoning": "user asked to move the lecture"
        }))
        .unwrap();

        assert_eq!(command.action, Action::Move);
        assert_eq!(command.modifications.new_date.as_deref(), Some("2025-12-12"));
        assert!(command.confidence > 0.9);
    }
}
