use anyhow::{Context, Result};
use console::{style, Term};
use dialoguer::{theme::ColorfulTheme, Confirm, Input, Select};
use std::io::{Read, Write};
use std::net::TcpListener;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::config::{
    AppConfig, GeneralConfig, GoogleCalendarConfig, OpenAIConfig,
};

const REDIRECT_URI: &str = "http://localhost:8080";
const OAUTH_SCOPES: &str = "https://www.googleapis.com/auth/calendar";

#[derive(Debug, Serialize, Deserialize)]
struct GoogleOAuthToken {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
    token_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct GoogleCalendarListResponse {
    items: Vec<GoogleCalendar>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GoogleCalendar {
    id: String,
    summary: String,
    description: Option<String>,
    primary: Option<bool>,
}

/// 対話型設定ウィザード
pub struct ConfigWizard {
    term: Term,
    theme: ColorfulTheme,
}

impl ConfigWizard {
    /// 新しいウィザードインスタンスを作成
    pub fn new() -> Self {
        Self {
            term: Term::stdout(),
            theme: ColorfulTheme::default(),
        }
    }

    /// ウィザードを実行
    pub async fn run(&self) -> Result<()> {
        self.term.clear_screen()?;

        println!("{}", style("schedule_agent_rs 設定ウィザード").bold().underlined());
        println!("このウィザードでは、アプリケーションの設定を対話的に行います。\n");

        // 基本設定
        let general_config = self.configure_general()?;

        // OpenAI設定
        let openai_config = self.configure_openai()?;

        // Googleカレンダー設定
        let google_config = self.configure_google_calendar().await?;

        // 設定をマージ
        let config = AppConfig {
            general: general_config,
            openai: openai_config,
            google_calendar: google_config,
        };

        // 設定ファイルを保存
        self.save_config(&config)?;

        println!("\n{}", style("設定が完了しました！").green().bold());
        println!("アプリケーションを実行するには: {} を実行してください", style("cargo run").cyan());

        Ok(())
    }

    /// 基本設定
    fn configure_general(&self) -> Result<GeneralConfig> {
        println!("\n{}", style("基本設定").bold());

        let timezone: String = Input::with_theme(&self.theme)
            .with_prompt("タイムゾーン（IANA形式）")
            .default("Europe/Brussels".into())
            .interact_text()?;

        let minimum_gap_minutes = self.configure_minimum_gap()?;

        Ok(GeneralConfig {
            timezone,
            minimum_gap_minutes,
            days_ahead: 30,
            max_events: 100,
        })
    }

    /// 予定間の最小空き時間を設定
    fn configure_minimum_gap(&self) -> Result<i64> {
        println!("予定間にどれくらいの空き時間が必要ですか？（「間隔不足」の検出に使われます）");

        let options = vec![
            "0分  - バッファ不要（連続でもOK）",
            "10分 - 同じ建物内の移動",
            "15分 - 標準バッファ（デフォルト）",
            "30分 - 別の建物への移動時間",
            "60分 - 昼食・休憩時間",
            "カスタム入力",
        ];
        let values = [0i64, 10, 15, 30, 60];

        let selection = Select::with_theme(&self.theme)
            .with_prompt("最小空き時間を選択してください")
            .default(2)
            .items(&options)
            .interact_on(&self.term)?;

        if selection < values.len() {
            return Ok(values[selection]);
        }

        // カスタム入力
        loop {
            let gap: i64 = Input::with_theme(&self.theme)
                .with_prompt("最小空き時間（分）")
                .interact_on(&self.term)?;

            if gap < 0 {
                println!("正の数を入力してください");
                continue;
            }

            if gap > 120 {
                let confirm = Confirm::with_theme(&self.theme)
                    .with_prompt(format!("{}分はかなり長めです。よろしいですか？", gap))
                    .default(false)
                    .interact_on(&self.term)?;
                if !confirm {
                    continue;
                }
            }

            return Ok(gap);
        }
    }

    /// OpenAI設定
    fn configure_openai(&self) -> Result<OpenAIConfig> {
        println!("\n{}", style("OpenAI設定").bold());
        println!("OpenAIのAPIキーは、https://platform.openai.com/api-keys で取得できます。");
        println!("画像・スキャンPDFの取り込みにはvision対応モデルが必要です。");

        // APIキー入力
        let api_key: String = Input::with_theme(&self.theme)
            .with_prompt("OpenAI APIキー")
            .interact_on(&self.term)?;

        // モデル選択
        let models = vec![
            "gpt-4o",
            "gpt-4o-mini",
            "gpt-4-turbo",
        ];

        let selection = Select::with_theme(&self.theme)
            .with_prompt("使用するモデルを選択してください")
            .default(0)
            .items(&models)
            .interact_on(&self.term)?;

        let model = models[selection].to_string();

        Ok(OpenAIConfig {
            api_key,
            model,
            max_tokens: 4000,
            temperature: 0.2,
        })
    }

    /// Googleカレンダー設定
    async fn configure_google_calendar(&self) -> Result<GoogleCalendarConfig> {
        println!("\n{}", style("Google Calendar設定").bold());

        println!("Google Cloud Consoleでの準備が必要です：");
        println!("1. https://console.cloud.google.com/apis/dashboard で新しいプロジェクトを作成");
        println!("2. Google Calendar APIを有効化");
        println!("3. OAuth同意画面を設定（テスト用は外部を選択）");
        println!("4. OAuth 2.0クライアントIDを作成（リダイレクトURIに {} を追加）", REDIRECT_URI);
        println!("");

        // クライアントID
        let client_id: String = Input::with_theme(&self.theme)
            .with_prompt("Google Cloud OAuth クライアントID")
            .interact_on(&self.term)?;

        // クライアントシークレット
        let client_secret: String = Input::with_theme(&self.theme)
            .with_prompt("Google Cloud OAuth クライアントシークレット")
            .interact_on(&self.term)?;

        // OAuth認証フローを実行
        println!("\n{}", style("OAuth認証を開始します...").green());

        // 認証コードを取得
        let auth_code = self.get_oauth_authorization_code(&client_id)?;

        // 認証コードをトークンに交換
        let token = self.exchange_auth_code_for_token(
            &client_id,
            &client_secret,
            &auth_code
        ).await?;

        println!("{}", style("認証が完了しました！").green());

        // カレンダー一覧を取得
        println!("カレンダー一覧を取得しています...");
        let calendars = self.get_calendar_list(&token.access_token).await?;

        if calendars.items.is_empty() {
            println!("カレンダーが見つかりませんでした。主カレンダーを使用します。");
            return Ok(GoogleCalendarConfig {
                client_id,
                client_secret,
                refresh_token: token.refresh_token,
                calendar_id: "primary".to_string(),
            });
        }

        let calendar_items: Vec<String> = calendars.items
            .iter()
            .map(|cal| {
                let primary_label = if cal.primary.unwrap_or(false) { " (主カレンダー)" } else { "" };
                format!("{}{} (ID: {})", cal.summary, primary_label, cal.id)
            })
            .collect();

        // 主カレンダーをデフォルト選択にする
        let default_index = calendars.items
            .iter()
            .position(|cal| cal.primary.unwrap_or(false))
            .unwrap_or(0);

        let selection = Select::with_theme(&self.theme)
            .with_prompt("イベントを登録するカレンダーを選択してください")
            .default(default_index)
            .items(&calendar_items)
            .interact_on(&self.term)?;

        let selected = &calendars.items[selection];
        println!("選択されたカレンダー: {}", style(&selected.summary).green());

        Ok(GoogleCalendarConfig {
            client_id,
            client_secret,
            refresh_token: token.refresh_token,
            calendar_id: selected.id.clone(),
        })
    }

    /// OAuth認証コードを取得
    fn get_oauth_authorization_code(&self, client_id: &str) -> Result<String> {
        // 認証URLを構築
        let auth_url = format!(
            "https://accounts.google.com/o/oauth2/auth?client_id={}&redirect_uri={}&scope={}&response_type=code&access_type=offline&prompt=consent",
            client_id,
            urlencoding::encode(REDIRECT_URI),
            urlencoding::encode(OAUTH_SCOPES)
        );

        println!("ブラウザでGoogle認証ページを開きます...");

        // ブラウザで認証URLを開く
        if let Err(e) = open::that(&auth_url) {
            println!("ブラウザを自動で開けませんでした: {}", e);
            println!("以下のURLをブラウザで開いて認証を行ってください:");
            println!("{}", auth_url);
        }

        // ローカルサーバーを起動してリダイレクトを待機
        println!("Google認証ページでログインして、アクセスを許可してください...");

        let listener = TcpListener::bind("127.0.0.1:8080").context("ローカルサーバーの起動に失敗しました")?;

        // 最初の接続を受け入れる
        let (mut stream, _) = listener.accept().context("リダイレクト待機中にエラーが発生しました")?;

        // リクエストを読み取る
        let mut buffer = [0; 1024];
        stream.read(&mut buffer).context("リクエストの読み取りに失敗しました")?;

        // リクエストからcodeパラメータを抽出
        let request = String::from_utf8_lossy(&buffer[..]);
        let uri = request.lines().next()
            .ok_or_else(|| anyhow::anyhow!("リクエストの解析に失敗しました"))?
            .split_whitespace()
            .nth(1)
            .ok_or_else(|| anyhow::anyhow!("URLの解析に失敗しました"))?;

        let url = Url::parse(&format!("http://localhost{}", uri))
            .context("URLの解析に失敗しました")?;

        let code = url.query_pairs()
            .find(|(key, _)| key == "code")
            .map(|(_, value)| value.to_string())
            .ok_or_else(|| anyhow::anyhow!("認証コードが見つかりませんでした"))?;

        // 成功ページを返す
        let response = "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\n\r\n<html><body><h1>認証成功</h1><p>このウィンドウを閉じて、アプリケーションに戻ってください。</p></body></html>";
        stream.write_all(response.as_bytes()).context("レスポンスの送信に失敗しました")?;

        Ok(code)
    }

    /// 認証コードをトークンに交換
    async fn exchange_auth_code_for_token(
        &self,
        client_id: &str,
        client_secret: &str,
        auth_code: &str
    ) -> Result<GoogleOAuthToken> {
        let client = reqwest::Client::new();

        let params = [
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("code", auth_code),
            ("redirect_uri", REDIRECT_URI),
            ("grant_type", "authorization_code"),
        ];

        let response = client.post("https://oauth2.googleapis.com/token")
            .form(&params)
            .send()
            .await
            .context("トークン交換リクエストの送信に失敗しました")?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "エラー詳細を取得できませんでした".to_string());
            return Err(anyhow::anyhow!("トークン交換に失敗しました: {}", error_text));
        }

        let token: GoogleOAuthToken = response.json().await
            .context("トークンレスポンスの解析に失敗しました")?;

        Ok(token)
    }

    /// カレンダー一覧を取得
    async fn get_calendar_list(&self, access_token: &str) -> Result<GoogleCalendarListResponse> {
        let client = reqwest::Client::new();

        let response = client.get("https://www.googleapis.com/calendar/v3/users/me/calendarList")
            .header("Authorization", format!("Bearer {}", access_token))
            .send()
            .await
            .context("カレンダー一覧の取得に失敗しました")?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "エラー詳細を取得できませんでした".to_string());
            return Err(anyhow::anyhow!("カレンダー一覧の取得に失敗しました: {}", error_text));
        }

        let calendar_list: GoogleCalendarListResponse = response.json().await
            .context("カレンダー一覧の解析に失敗しました")?;

        Ok(calendar_list)
    }

    /// 設定ファイルを保存
    fn save_config(&self, config: &AppConfig) -> Result<()> {
        println!("\n設定内容を確認します：");

        // 設定内容のプレビュー
        let config_str = toml::to_string_pretty(config)?;
        println!("{}", style("```").dim());
        println!("{}", config_str);
        println!("{}", style("```").dim());

        let confirm = Confirm::with_theme(&self.theme)
            .with_prompt("この設定をconfig.tomlに保存しますか？")
            .default(true)
            .interact_on(&self.term)?;

        if confirm {
            crate::config::save_config("config.toml", config)?;
            println!("設定ファイルを {} に保存しました", style("config.toml").yellow());
            Ok(())
        } else {
            println!("設定の保存をキャンセルしました");
            Ok(())
        }
    }
}
