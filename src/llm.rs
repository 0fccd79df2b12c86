use anyhow::{Context, Result};
use async_openai::{
    config::OpenAIConfig as ApiConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPart,
        ChatCompletionRequestMessageContentPartImageArgs,
        ChatCompletionRequestMessageContentPartTextArgs,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        ChatCompletionRequestUserMessageContent, ChatCompletionResponseFormat,
        ChatCompletionResponseFormatType, CreateChatCompletionRequest, ImageUrlArgs,
        ImageUrlDetail,
    },
    Client,
};
use log::{debug, warn};
use serde::Deserialize;
use thiserror::Error;

use crate::calendar::CalendarEvent;
use crate::changes::ModificationCommand;
use crate::config::OpenAIConfig;
use crate::conflict::ConflictParty;
use crate::parser::ParsedEvent;

/// モデルレスポンスの解析エラー
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("empty response from model")]
    EmptyResponse,

    #[error("model returned invalid JSON: {0}")]
    MalformedJson(#[from] serde_json::Error),

    #[error("response is missing field `{0}`")]
    MissingField(&'static str),
}

/// 移動時間の実現性評価（tight gap の追加評価に使用）
#[derive(Debug, Clone, Deserialize)]
pub struct TravelAssessment {
    #[serde(default = "default_feasible")]
    pub feasible: bool,

    #[serde(default)]
    pub confidence: f64,

    #[serde(default)]
    pub estimated_travel_minutes: i64,

    #[serde(default)]
    pub reasoning: String,

    #[serde(default)]
    pub recommendation: String,
}

fn default_feasible() -> bool {
    true
}

fn client_for(config: &OpenAIConfig) -> Client<ApiConfig> {
    let api_config = ApiConfig::new().with_api_key(config.api_key.clone());
    Client::with_config(api_config)
}

/// チャット補完を実行してテキストを返す
async fn chat(
    config: &OpenAIConfig,
    system_prompt: Option<&str>,
    content: ChatCompletionRequestUserMessageContent,
    json_mode: bool,
    temperature: Option<f32>,
) -> Result<String> {
    let client = client_for(config);

    let mut messages: Vec<ChatCompletionRequestMessage> = Vec::new();

    if let Some(system) = system_prompt {
        messages.push(ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(system)
                .build()?,
        ));
    }

    messages.push(ChatCompletionRequestMessage::User(
        ChatCompletionRequestUserMessageArgs::default()
            .content(content)
            .build()?,
    ));

    let response_format = json_mode.then_some(ChatCompletionResponseFormat {
        r#type: ChatCompletionResponseFormatType::JsonObject,
    });

    let request = CreateChatCompletionRequest {
        model: config.model.clone(),
        messages,
        temperature: Some(temperature.unwrap_or(config.temperature)),
        max_tokens: Some(config.max_tokens),
        response_format,
        ..Default::default()
    };

    let response = client
        .chat()
        .create(request)
        .await
        .context("OpenAI chat completion request failed")?;

    let choice = response.choices.first().ok_or(LlmError::EmptyResponse)?;
    let content = choice.message.content.as_deref().unwrap_or("");

    if content.is_empty() {
        return Err(LlmError::EmptyResponse.into());
    }

    debug!("Model response length: {} chars", content.len());
    Ok(content.to_string())
}

/// テキスト補完を生成する
pub async fn generate_completion(
    config: &OpenAIConfig,
    prompt: &str,
    system_prompt: Option<&str>,
) -> Result<String> {
    chat(
        config,
        system_prompt,
        ChatCompletionRequestUserMessageContent::Text(prompt.to_string()),
        false,
        None,
    )
    .await
}

/// JSON形式の補完を生成してパースする
pub async fn generate_json_completion(
    config: &OpenAIConfig,
    prompt: &str,
    system_prompt: Option<&str>,
) -> Result<serde_json::Value> {
    // JSONだけを返すようにシステムプロンプトを合成
    let json_system = "You are a helpful assistant that ALWAYS responds with valid JSON. \
         Never include markdown formatting, explanations, or any text outside the JSON object. \
         Respond ONLY with a valid JSON object.";

    let system = match system_prompt {
        Some(s) => format!("{}\n\n{}", s, json_system),
        None => json_system.to_string(),
    };

    let response = chat(
        config,
        Some(&system),
        ChatCompletionRequestUserMessageContent::Text(prompt.to_string()),
        true,
        None,
    )
    .await?;

    // JSONモードでもコードフェンス付きで返るケースがあるため除去してからパース
    let cleaned = strip_code_fences(&response);
    let value: serde_json::Value =
        serde_json::from_str(cleaned).map_err(LlmError::MalformedJson)?;

    Ok(value)
}

/// レスポンスからMarkdownのコードフェンスを取り除く
pub(crate) fn strip_code_fences(response: &str) -> &str {
    let mut text = response.trim();

    if let Some(rest) = text.strip_prefix("```json") {
        text = rest;
    } else if let Some(rest) = text.strip_prefix("```") {
        text = rest;
    }

    if let Some(rest) = text.strip_suffix("```") {
        text = rest;
    }

    text.trim()
}

/// JSONレスポンスからイベント配列を取り出す
/// `{"events": [...]}` 形式と素の配列の両方を受け付ける
pub(crate) fn events_from_value(value: serde_json::Value) -> Result<Vec<serde_json::Value>> {
    match value {
        serde_json::Value::Array(items) => Ok(items),
        serde_json::Value::Object(mut map) => match map.remove("events") {
            Some(serde_json::Value::Array(items)) => Ok(items),
            _ => Err(LlmError::MissingField("events").into()),
        },
        _ => Err(LlmError::MissingField("events").into()),
    }
}

/// スケジュールのテキストを構造化イベントにパースする
pub async fn parse_schedule_text(
    config: &OpenAIConfig,
    schedule_text: &str,
) -> Result<Vec<ParsedEvent>> {
    let prompt = format!(
        r#"Extract all calendar events from the following schedule text.

Return a JSON object of the form {{"events": [...]}}. Each event must have:
- title: Event name/title
- date: Date in YYYY-MM-DD format
- start_time: Start time in HH:MM format (24-hour)
- end_time: End time in HH:MM format (24-hour)
- location: Location/room (if mentioned, otherwise empty string)
- description: Any additional details (optional)
- recurrence: "none", "daily", "weekly", or "monthly" (if mentioned)

If any information is unclear or missing, use your best judgment based on context.
If times are not specified, estimate reasonable times based on the event type.

Schedule text:
{}
"#,
        schedule_text
    );

    let system = "You are an expert at parsing academic and personal schedules. \
         You understand various schedule formats and can extract structured information. \
         Always return valid JSON with all required fields.";

    let value = generate_json_completion(config, &prompt, Some(system)).await?;
    let raw_events = events_from_value(value)?;

    let mut events = Vec::new();
    for raw in raw_events {
        match serde_json::from_value::<ParsedEvent>(raw.clone()) {
            Ok(event) => events.push(event),
            Err(e) => {
                warn!("Skipping malformed event in model output: {} ({})", e, raw);
            }
        }
    }

    Ok(events)
}

/// 既存イベントをプロンプト用のコンテキスト行に整形する
pub(crate) fn format_events_context(events: &[CalendarEvent], limit: usize) -> String {
    events
        .iter()
        .take(limit)
        .map(|e| {
            format!(
                "- {}: {}",
                e.summary.as_deref().unwrap_or("Untitled"),
                e.start
                    .as_ref()
                    .and_then(|s| s.date_time.as_deref().or(s.date.as_deref()))
                    .unwrap_or("No date")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// 自然言語の変更コマンドをパースする
pub async fn parse_modification_command(
    config: &OpenAIConfig,
    command: &str,
    existing_events: &[CalendarEvent],
) -> Result<ModificationCommand> {
    let events_context = format_events_context(existing_events, 20);

    let prompt = format!(
        r#"Parse this calendar modification command and return the action details.

Current events in calendar:
{}

User command: "{}"

Return a JSON object with:
{{
  "action": "move" | "delete" | "modify" | "create",
  "event_identifier": "text to identify which event (name or description)",
  "confidence": 0.0-1.0 (how confident you are about identifying the event),
  "modifications": {{
    "new_date": "YYYY-MM-DD" (if date changes),
    "new_start_time": "HH:MM" (if start time changes),
    "new_end_time": "HH:MM" (if end time changes),
    "new_title": "text" (if title changes),
    "new_location": "text" (if location changes),
    "new_description": "text" (if description changes)
  }},
  "reasoning": "brief explanation of your interpretation"
}}

If the command is ambiguous or unclear, set confidence < 0.7 and explain in reasoning.
"#,
        events_context, command
    );

    let system = "You are an expert at understanding natural language commands for calendar management. \
         You can interpret informal language and context to determine user intent. \
         Always return valid JSON with all required fields.";

    let value = generate_json_completion(config, &prompt, Some(system)).await?;
    let parsed: ModificationCommand =
        serde_json::from_value(value).map_err(LlmError::MalformedJson)?;

    Ok(parsed)
}

/// 2つの予定の間の移動が現実的かをモデルに評価させる
pub async fn assess_travel_feasibility(
    config: &OpenAIConfig,
    event1: &ConflictParty,
    event2: &ConflictParty,
    gap_minutes: i64,
) -> Result<TravelAssessment> {
    let prompt = format!(
        r#"Assess if this schedule is feasible:

Event 1: {} at {}
Event 2: {} at {}
Time gap: {} minutes

Return JSON:
{{
  "feasible": true/false,
  "confidence": 0.0-1.0,
  "estimated_travel_minutes": number,
  "reasoning": "explanation",
  "recommendation": "what to do if not feasible"
}}

Consider:
- Typical travel time between these locations
- Time needed to pack up and prepare
- Buffer for unexpected delays
"#,
        event1.title,
        if event1.location.is_empty() { "Unknown location" } else { event1.location.as_str() },
        event2.title,
        if event2.location.is_empty() { "Unknown location" } else { event2.location.as_str() },
        gap_minutes
    );

    let value = generate_json_completion(config, &prompt, None).await?;
    let assessment: TravelAssessment =
        serde_json::from_value(value).map_err(LlmError::MalformedJson)?;

    Ok(assessment)
}

/// 画像からテキストを抽出する（vision OCR）
pub async fn extract_text_from_image(config: &OpenAIConfig, data_url: &str) -> Result<String> {
    let instruction = r#"Extract all text from this image. This is likely a schedule or calendar.

Return the text exactly as it appears, preserving:
- All dates and times
- All event names
- All locations
- All other visible text

Format the output in a clear, readable way. If it's a schedule, maintain the chronological order."#;

    let parts = vec![
        ChatCompletionRequestMessageContentPart::Text(
            ChatCompletionRequestMessageContentPartTextArgs::default()
                .text(instruction)
                .build()?,
        ),
        ChatCompletionRequestMessageContentPart::Image(
            ChatCompletionRequestMessageContentPartImageArgs::default()
                .image_url(
                    ImageUrlArgs::default()
                        .url(data_url)
                        .detail(ImageUrlDetail::High)
                        .build()?,
                )
                .build()?,
        ),
    ];

    // OCRは決定的な出力が望ましいので温度0で実行
    chat(
        config,
        None,
        ChatCompletionRequestUserMessageContent::Array(parts),
        false,
        Some(0.0),
    )
    .await
}

/// 現在の予定を踏まえたスケジュール相談への回答を生成する
pub async fn schedule_advice(
    config: &OpenAIConfig,
    query: &str,
    events: &[CalendarEvent],
) -> Result<String> {
    let events_context = format_events_context(events, 20);

    let prompt = format!(
        r#"You are an intelligent scheduling assistant. The user has asked:

"{}"

Their current schedule includes:
{}

Provide helpful, actionable advice about:
- Best times to schedule new events
- Potential conflicts or issues
- Suggestions for reorganizing their schedule
- Any other relevant insights

Be concise and practical.
"#,
        query, events_context
    );

    let system = "You are a helpful scheduling assistant with expertise in time management \
         and calendar optimization.";

    generate_completion(config, &prompt, Some(system)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_json_code_fences() {
        let fenced = "```json\n{\"a\": 1}\n```";
        assert_eq!(strip_code_fences(fenced), "{\"a\": 1}");
    }

    #[test]
    fn strips_plain_code_fences() {
        let fenced = "```\n[1, 2]\n```";
        assert_eq!(strip_code_fences(fenced), "[1, 2]");
    }

    #[test]
    fn leaves_unfenced_text_alone() {
        assert_eq!(strip_code_fences("  {\"a\": 1}  "), "{\"a\": 1}");
    }

    #[test]
    fn accepts_wrapped_events_object() {
        let value = json!({"events": [{"title": "AI"}]});
        let events = events_from_value(value).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn accepts_bare_event_array() {
        let value = json!([{"title": "AI"}, {"title": "Math"}]);
        let events = events_from_value(value).unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn rejects_object_without_events() {
        let value = json!({"items": []});
        assert!(events_from_value(value).is_err());
    }

    #[test]
    fn assessment_defaults_are_permissive() {
        let value = json!({"reasoning": "looks fine"});
        let assessment: TravelAssessment = serde_json::from_value(value).unwrap();
        assert!(assessment.feasible);
        assert_eq!(assessment.estimated_travel_minutes, 0);
    }
}
