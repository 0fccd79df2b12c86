use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use yup_oauth2::InstalledFlowAuthenticator;

use crate::config::GoogleCalendarConfig;
use crate::parser::ParsedEvent;

const CALENDAR_API_BASE: &str = "https://www.googleapis.com/calendar/v3";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const OAUTH_SCOPES: &[&str] = &["https://www.googleapis.com/auth/calendar"];

/// Google Calendar APIのイベント時刻
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventDateTime {
    #[serde(rename = "dateTime", default, skip_serializing_if = "Option::is_none")]
    pub date_time: Option<String>,

    /// 終日イベントの場合に設定される
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,

    #[serde(rename = "timeZone", default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

/// Google Calendar APIのイベント
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalendarEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<EventDateTime>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<EventDateTime>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<Vec<String>>,

    #[serde(rename = "htmlLink", default, skip_serializing_if = "Option::is_none")]
    pub html_link: Option<String>,
}

impl CalendarEvent {
    /// 開始日時をローカル時刻のNaiveDateTimeとして返す
    pub fn start_naive(&self) -> Option<NaiveDateTime> {
        self.start.as_ref().and_then(parse_event_datetime)
    }

    /// 終了日時をローカル時刻のNaiveDateTimeとして返す
    pub fn end_naive(&self) -> Option<NaiveDateTime> {
        self.end.as_ref().and_then(parse_event_datetime)
    }

    /// 重複検出用に開始の日付と時刻を文字列で返す
    pub fn local_date_and_time(&self) -> Option<(String, String)> {
        let dt = self.start_naive()?;
        Some((
            dt.format("%Y-%m-%d").to_string(),
            dt.format("%H:%M").to_string(),
        ))
    }

    /// タイムド（終日でない）イベントかどうか
    pub fn has_date_time(&self) -> bool {
        self.start
            .as_ref()
            .map(|s| s.date_time.is_some())
            .unwrap_or(false)
    }
}

/// イベント時刻をパースする
/// dateTimeはRFC3339（オフセット付き）、dateは終日イベントで00:00として扱う
fn parse_event_datetime(time: &EventDateTime) -> Option<NaiveDateTime> {
    if let Some(date_time) = &time.date_time {
        DateTime::parse_from_rfc3339(date_time)
            .map(|dt| dt.naive_local())
            .ok()
    } else if let Some(date) = &time.date {
        chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
    } else {
        None
    }
}

/// イベント一覧レスポンス
#[derive(Debug, Deserialize)]
struct EventListResponse {
    #[serde(default)]
    items: Vec<CalendarEvent>,
}

/// 既存イベントへの部分的な変更
#[derive(Debug, Clone, Default)]
pub struct EventPatch {
    pub summary: Option<String>,
    pub location: Option<String>,
    pub description: Option<String>,
    pub start_datetime: Option<NaiveDateTime>,
    pub end_datetime: Option<NaiveDateTime>,
}

impl EventPatch {
    pub fn is_empty(&self) -> bool {
        self.summary.is_none()
            && self.location.is_none()
            && self.description.is_none()
            && self.start_datetime.is_none()
            && self.end_datetime.is_none()
    }
}

/// Google CalendarのAPIクライアント
pub struct GoogleCalendarClient {
    client: reqwest::Client,
    access_token: String,
    calendar_id: String,
    timezone: String,
}

impl GoogleCalendarClient {
    /// 認証してクライアントを作成する
    pub async fn connect(config: &GoogleCalendarConfig, timezone: &str) -> Result<Self> {
        let access_token = obtain_access_token(config).await?;
        debug!("Access token obtained: {}", mask_token(&access_token));

        info!(
            "Google Calendar client ready (calendar: {})",
            config.calendar_id
        );

        Ok(Self {
            client: reqwest::Client::new(),
            access_token,
            calendar_id: config.calendar_id.clone(),
            timezone: timezone.to_string(),
        })
    }

    fn events_endpoint(&self) -> String {
        format!(
            "{}/calendars/{}/events",
            CALENDAR_API_BASE,
            urlencoding::encode(&self.calendar_id)
        )
    }

    fn event_endpoint(&self, event_id: &str) -> String {
        format!(
            "{}/calendars/{}/events/{}",
            CALENDAR_API_BASE,
            urlencoding::encode(&self.calendar_id),
            urlencoding::encode(event_id)
        )
    }

    /// 指定範囲のイベント一覧を取得する
    pub async fn list_events(
        &self,
        time_min: NaiveDateTime,
        time_max: NaiveDateTime,
        max_results: u32,
    ) -> Result<Vec<CalendarEvent>> {
        let mut url = url::Url::parse(&self.events_endpoint())?;
        url.query_pairs_mut()
            .append_pair("timeMin", &format_api_datetime(time_min))
            .append_pair("timeMax", &format_api_datetime(time_max))
            .append_pair("singleEvents", "true")
            .append_pair("orderBy", "startTime")
            .append_pair("maxResults", &max_results.to_string());

        debug!("Calendar API URL: {}", url);

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .context("Failed to send request to Google Calendar API")?;

        let response = check_response(response, "Event list request").await?;
        let list: EventListResponse = response
            .json()
            .await
            .context("Failed to parse event list response")?;

        debug!("Retrieved {} events", list.items.len());
        Ok(list.items)
    }

    /// テキストクエリでイベントを検索する
    pub async fn search_events(
        &self,
        query: &str,
        max_results: u32,
    ) -> Result<Vec<CalendarEvent>> {
        let mut url = url::Url::parse(&self.events_endpoint())?;
        url.query_pairs_mut()
            .append_pair("q", query)
            .append_pair("singleEvents", "true")
            .append_pair("orderBy", "startTime")
            .append_pair("maxResults", &max_results.to_string());

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .context("Failed to send search request")?;

        let response = check_response(response, "Event search request").await?;
        let list: EventListResponse = response
            .json()
            .await
            .context("Failed to parse search response")?;

        Ok(list.items)
    }

    /// イベントを作成する
    pub async fn create_event(&self, event: &CalendarEvent) -> Result<CalendarEvent> {
        let response = self
            .client
            .post(self.events_endpoint())
            .bearer_auth(&self.access_token)
            .json(event)
            .send()
            .await
            .context("Failed to send event creation request")?;

        let response = check_response(response, "Event creation").await?;
        let created: CalendarEvent = response
            .json()
            .await
            .context("Failed to parse created event")?;

        info!(
            "Event created: {}",
            created.summary.as_deref().unwrap_or("Untitled")
        );
        if let Some(link) = &created.html_link {
            debug!("Event link: {}", link);
        }

        Ok(created)
    }

    /// イベントを1件取得する
    pub async fn get_event(&self, event_id: &str) -> Result<CalendarEvent> {
        let response = self
            .client
            .get(self.event_endpoint(event_id))
            .bearer_auth(&self.access_token)
            .send()
            .await
            .context("Failed to send event fetch request")?;

        let response = check_response(response, "Event fetch").await?;
        response.json().await.context("Failed to parse event")
    }

    /// 既存イベントを部分的に更新する
    /// 現在の内容を取得し、指定された項目だけを差し替えてPUTする
    pub async fn update_event(
        &self,
        event_id: &str,
        patch: &EventPatch,
    ) -> Result<CalendarEvent> {
        let mut event = self.get_event(event_id).await?;

        if let Some(summary) = &patch.summary {
            event.summary = Some(summary.clone());
        }
        if let Some(location) = &patch.location {
            event.location = Some(location.clone());
        }
        if let Some(description) = &patch.description {
            event.description = Some(description.clone());
        }
        if let Some(start) = patch.start_datetime {
            event.start = Some(self.local_event_time(start));
        }
        if let Some(end) = patch.end_datetime {
            event.end = Some(self.local_event_time(end));
        }

        let response = self
            .client
            .put(self.event_endpoint(event_id))
            .bearer_auth(&self.access_token)
            .json(&event)
            .send()
            .await
            .context("Failed to send event update request")?;

        let response = check_response(response, "Event update").await?;
        let updated: CalendarEvent = response
            .json()
            .await
            .context("Failed to parse updated event")?;

        info!(
            "Event updated: {}",
            updated.summary.as_deref().unwrap_or("Untitled")
        );

        Ok(updated)
    }

    /// イベントを削除する
    pub async fn delete_event(&self, event_id: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.event_endpoint(event_id))
            .bearer_auth(&self.access_token)
            .send()
            .await
            .context("Failed to send event deletion request")?;

        check_response(response, "Event deletion").await?;
        info!("Event deleted: {}", event_id);
        Ok(())
    }

    /// パース済みイベントからAPI用のイベントボディを組み立てる
    pub fn event_from_parsed(&self, parsed: &ParsedEvent) -> Result<CalendarEvent> {
        let start = parsed.start_datetime()?;
        let end = parsed.end_datetime()?;

        Ok(CalendarEvent {
            summary: Some(parsed.title.clone()),
            location: (!parsed.location.is_empty()).then(|| parsed.location.clone()),
            description: (!parsed.description.is_empty()).then(|| parsed.description.clone()),
            start: Some(self.local_event_time(start)),
            end: Some(self.local_event_time(end)),
            recurrence: parsed.recurrence.to_rrule(),
            ..Default::default()
        })
    }

    /// ローカル時刻＋設定タイムゾーンのイベント時刻を作る
    fn local_event_time(&self, dt: NaiveDateTime) -> EventDateTime {
        EventDateTime {
            date_time: Some(dt.format("%Y-%m-%dT%H:%M:%S").to_string()),
            date: None,
            time_zone: Some(self.timezone.clone()),
        }
    }
}

/// APIのtimeMin/timeMax用の日時文字列を生成
fn format_api_datetime(dt: NaiveDateTime) -> String {
    format!("{}Z", dt.format("%Y-%m-%dT%H:%M:%S"))
}

/// アクセストークンを取得する
/// リフレッシュトークンがあれば交換、なければブラウザ認証フローにフォールバック
async fn obtain_access_token(config: &GoogleCalendarConfig) -> Result<String> {
    let secret = yup_oauth2::ApplicationSecret {
        client_id: config.client_id.clone(),
        client_secret: config.client_secret.clone(),
        auth_uri: "https://accounts.google.com/o/oauth2/auth".to_string(),
        token_uri: TOKEN_URL.to_string(),
        redirect_uris: vec!["http://localhost".to_string()],
        project_id: None,
        client_email: None,
        auth_provider_x509_cert_url: None,
        client_x509_cert_url: None,
    };

    if config.refresh_token.is_empty() {
        // リフレッシュトークンがない場合は、通常のブラウザフロー認証
        warn!("No refresh token configured, using browser authentication flow");

        let auth = InstalledFlowAuthenticator::builder(
            secret,
            yup_oauth2::InstalledFlowReturnMethod::HTTPRedirect,
        )
        .build()
        .await
        .context("Failed to create authenticator")?;

        let token_result = auth
            .token(OAUTH_SCOPES)
            .await
            .context("Failed to obtain access token")?;

        return Ok(token_result.token().unwrap_or_default().to_string());
    }

    debug!("Attempting to get access token using refresh token");

    let form_data = [
        ("client_id", secret.client_id.as_str()),
        ("client_secret", secret.client_secret.as_str()),
        ("refresh_token", config.refresh_token.as_str()),
        ("grant_type", "refresh_token"),
    ];

    let response = reqwest::Client::new()
        .post(TOKEN_URL)
        .form(&form_data)
        .send()
        .await
        .context("Failed to send token refresh request")?;

    let response = check_response(response, "Token refresh request").await?;

    let token_response: serde_json::Value = response
        .json()
        .await
        .context("Failed to parse token response")?;

    token_response
        .get("access_token")
        .and_then(|t| t.as_str())
        .map(|t| t.to_string())
        .ok_or_else(|| anyhow::anyhow!("No access_token in token response"))
}

/// エラーレスポンスをステータスとボディ付きのエラーに変換する
async fn check_response(
    response: reqwest::Response,
    what: &str,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Failed to read error response".to_string());

    Err(anyhow::anyhow!("{} failed: {} - {}", what, status, body))
}

/// パース済みイベントが既存イベントと重複しているかチェックする
/// タイトル（大文字小文字無視）・日付・開始時刻がすべて一致した場合に重複とみなす
pub fn is_duplicate(parsed: &ParsedEvent, existing: &[CalendarEvent]) -> bool {
    let new_title = parsed.title.to_lowercase();

    for event in existing {
        let existing_title = event
            .summary
            .as_deref()
            .unwrap_or("")
            .to_lowercase();

        if existing_title != new_title {
            continue;
        }

        if let Some((date, time)) = event.local_date_and_time() {
            if date == parsed.date && time == parsed.start_time {
                return true;
            }
        }
    }

    false
}

// ログ出力用にトークンをマスクする
fn mask_token(token: &str) -> String {
    if token.len() <= 8 {
        return "[TOKEN_TOO_SHORT_TO_MASK]".to_string();
    }

    let visible_prefix = &token[0..4];
    let visible_suffix = &token[token.len() - 4..];
    format!("{}...{}", visible_prefix, visible_suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Recurrence;

    fn timed(date_time: &str) -> EventDateTime {
        EventDateTime {
            date_time: Some(date_time.to_string()),
            date: None,
            time_zone: None,
        }
    }

    fn sample_parsed() -> ParsedEvent {
        ParsedEvent {
            title: "Machine Learning".to_string(),
            date: "2025-12-04".to_string(),
            start_time: "11:00".to_string(),
            end_time: "12:30".to_string(),
            location: String::new(),
            description: String::new(),
            recurrence: Recurrence::None,
        }
    }

    #[test]
    fn parses_offset_datetime_as_wall_clock() {
        let event = CalendarEvent {
            start: Some(timed("2025-12-04T11:00:00+01:00")),
            ..Default::default()
        };

        let start = event.start_naive().unwrap();
        assert_eq!(start.format("%Y-%m-%d %H:%M").to_string(), "2025-12-04 11:00");
    }

    #[test]
    fn parses_all_day_event_as_midnight() {
        let event = CalendarEvent {
            start: Some(EventDateTime {
                date: Some("2025-12-04".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let start = event.start_naive().unwrap();
        assert_eq!(start.format("%H:%M").to_string(), "00:00");
        assert!(!event.has_date_time());
    }

    #[test]
    fn detects_duplicate_with_same_title_date_and_time() {
        let existing = vec![CalendarEvent {
            summary: Some("machine learning".to_string()),
            start: Some(timed("2025-12-04T11:00:00+01:00")),
            ..Default::default()
        }];

        assert!(is_duplicate(&sample_parsed(), &existing));
    }

    #[test]
    fn different_start_time_is_not_a_duplicate() {
        let existing = vec![CalendarEvent {
            summary: Some("Machine Learning".to_string()),
            start: Some(timed("2025-12-04T14:00:00+01:00")),
            ..Default::default()
        }];

        assert!(!is_duplicate(&sample_parsed(), &existing));
    }

    #[test]
    fn masked_token_hides_middle() {
        let masked = mask_token("ya29.abcdefghijklmnop");
        assert!(masked.starts_with("ya29"));
        assert!(masked.contains("..."));
        assert!(!masked.contains("abcdefghijkl"));
    }

    #[test]
    fn empty_patch_is_detected() {
        assert!(EventPatch::default().is_empty());
        let patch = EventPatch {
            summary: Some("New title".to_string()),
            ..Default::default()
        };
        assert!(!patch.is_empty());
    }
}
