use anyhow::{Context, Result};
use serde::Deserialize;
use serde::Serialize;
use std::fs::read_to_string;
use std::path::Path;

/// アプリケーション全体の設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// アプリケーション全般の設定
    pub general: GeneralConfig,

    /// OpenAI API の設定
    pub openai: OpenAIConfig,

    /// Google Calendar API の設定
    pub google_calendar: GoogleCalendarConfig,
}

/// 一般設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// イベント作成時に使用するタイムゾーン（IANA形式）
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// 予定間に必要な最小空き時間（分）
    #[serde(default = "default_minimum_gap")]
    pub minimum_gap_minutes: i64,

    /// 衝突チェックのデフォルト対象期間（日）
    #[serde(default = "default_days_ahead")]
    pub days_ahead: i64,

    /// カレンダーから一度に取得する最大イベント数
    #[serde(default = "default_max_events")]
    pub max_events: u32,
}

/// OpenAI API 設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAIConfig {
    /// OpenAI API キー
    pub api_key: String,

    /// 使用するモデル（画像取り込みにはvision対応モデルが必要）
    #[serde(default = "default_model")]
    pub model: String,

    /// レスポンスの最大トークン数
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u16,

    /// 温度パラメータ（0.0-1.0）
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

/// Google Calendar API 設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleCalendarConfig {
    /// クライアントID
    pub client_id: String,

    /// クライアントシークレット
    pub client_secret: String,

    /// リフレッシュトークン（空の場合はブラウザ認証にフォールバック）
    pub refresh_token: String,

    /// 操作対象のカレンダーID
    #[serde(default = "default_calendar_id")]
    pub calendar_id: String,
}

// デフォルト値
fn default_timezone() -> String {
    "Europe/Brussels".to_string()
}

fn default_minimum_gap() -> i64 {
    15
}

fn default_days_ahead() -> i64 {
    30
}

fn default_max_events() -> u32 {
    100
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_max_tokens() -> u16 {
    4000
}

fn default_temperature() -> f32 {
    0.2
}

fn default_calendar_id() -> String {
    "primary".to_string()
}

/// 設定ファイルを読み込む
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AppConfig> {
    let config_str = read_to_string(path)
        .context("Failed to read config file")?;

    let config: AppConfig = toml::from_str(&config_str)
        .context("Failed to parse config file")?;

    Ok(config)
}

/// デフォルトの設定を作成する
pub fn create_default_config() -> AppConfig {
    AppConfig {
        general: GeneralConfig {
            timezone: default_timezone(),
            minimum_gap_minutes: default_minimum_gap(),
            days_ahead: default_days_ahead(),
            max_events: default_max_events(),
        },
        openai: OpenAIConfig {
            api_key: "your_openai_api_key".to_string(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        },
        google_calendar: GoogleCalendarConfig {
            client_id: "your_client_id".to_string(),
            client_secret: "your_client_secret".to_string(),
            refresh_token: String::new(),
            calendar_id: default_calendar_id(),
        },
    }
}

/// 設定をファイルに保存する
pub fn save_config<P: AsRef<Path>>(path: P, config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)
        .context("Failed to serialize config")?;

    std::fs::write(path, toml_str)
        .context("Failed to write config file")?;

    Ok(())
}

/// サンプル設定ファイルを作成する
pub fn generate_sample_config<P: AsRef<Path>>(path: P) -> Result<()> {
    save_config(path, &create_default_config())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        generate_sample_config(&path).unwrap();
        let loaded = load_config(&path).unwrap();

        assert_eq!(loaded.general.minimum_gap_minutes, 15);
        assert_eq!(loaded.general.days_ahead, 30);
        assert_eq!(loaded.openai.model, "gpt-4o");
        assert_eq!(loaded.google_calendar.calendar_id, "primary");
    }

    #[test]
    fn missing_optional_keys_take_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        std::fs::write(
            &path,
            r#"
[general]

[openai]
api_key = "sk-test"

[google_calendar]
client_id = "id"
client_secret = "secret"
refresh_token = "token"
"#,
        )
        .unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.general.timezone, "Europe/Brussels");
        assert_eq!(loaded.general.minimum_gap_minutes, 15);
        assert_eq!(loaded.general.max_events, 100);
        assert_eq!(loaded.openai.max_tokens, 4000);
        assert_eq!(loaded.google_calendar.calendar_id, "primary");
    }

    #[test]
    fn missing_required_key_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[general]\n").unwrap();

        assert!(load_config(&path).is_err());
    }
}
