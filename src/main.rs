use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use dialoguer::{theme::ColorfulTheme, Input, Select};
use log::{info, warn};
use std::io::Write;
use std::path::{Path, PathBuf};

mod calendar;
mod changes;
mod config;
mod conflict;
mod extract;
mod llm;
mod orchestrator;
mod parser;
mod utils;
mod wizard;

use changes::ChangeOutcome;
use orchestrator::Orchestrator;
use wizard::ConfigWizard;

/// AI-powered schedule import and calendar management
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    /// Path to config file
    #[clap(short, long, value_parser, default_value = "config.toml")]
    config: PathBuf,

    /// Run configuration wizard
    #[clap(long)]
    wizard: bool,

    /// Write a sample config file and exit
    #[clap(long)]
    sample_config: bool,

    /// Import a schedule file (PDF or image) and exit
    #[clap(long, value_parser)]
    import: Option<PathBuf>,

    /// Skip the conflict pre-check during import
    #[clap(long)]
    no_conflict_check: bool,

    /// Apply a natural language modification command and exit
    #[clap(long)]
    modify: Option<String>,

    /// Check for conflicts over the given number of days and exit
    #[clap(long)]
    check_conflicts: Option<i64>,

    /// Show system status and exit
    #[clap(long)]
    status: bool,
}

/// アプリケーションのロギングを初期化
fn init_logging() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;

    let args = Args::parse();

    info!("Starting schedule_agent_rs v{}", env!("CARGO_PKG_VERSION"));

    // サンプル設定ファイルを生成
    if args.sample_config {
        config::generate_sample_config(&args.config)
            .context("Failed to write sample config")?;
        println!("サンプル設定を {} に書き出しました", args.config.display());
        return Ok(());
    }

    // 設定ウィザードを実行
    if args.wizard {
        info!("Starting configuration wizard");
        let wizard = ConfigWizard::new();
        return wizard.run().await;
    }

    // 設定ファイルを読み込む
    let config_path = resolve_config_path(&args.config);
    let app_config = config::load_config(&config_path)
        .context("Failed to load configuration")?;

    // インターネット接続を確認（警告のみ）
    if !utils::check_internet_connection() {
        warn!("No internet connection detected. API calls will likely fail");
        println!("⚠️  インターネット接続が確認できません。API呼び出しは失敗する可能性があります。");
    }

    let mut orchestrator = Orchestrator::connect(app_config).await?;

    // 一回だけ実行するモード
    if let Some(file) = &args.import {
        let outcome = orchestrator
            .import_schedule(file, !args.no_conflict_check)
            .await?;
        print_import_outcome(&outcome);
        return Ok(());
    }

    if let Some(command) = &args.modify {
        let outcome = orchestrator.modify_event(command).await?;
        print_change_outcome(&outcome);
        return Ok(());
    }

    if let Some(days) = args.check_conflicts {
        let conflicts = orchestrator.check_conflicts(days, true).await?;
        println!("{}", orchestrator.detector().format_report(&conflicts));
        return Ok(());
    }

    if args.status {
        print_status(&orchestrator).await?;
        return Ok(());
    }

    // 対話メニューモード
    run_menu(&mut orchestrator, &config_path).await
}

/// 設定ファイルのパスを解決する
/// 指定パスに存在しない場合はXDG設定ディレクトリも探す
fn resolve_config_path(path: &Path) -> PathBuf {
    if path.exists() {
        return path.to_path_buf();
    }

    if let Ok(dir) = utils::get_config_dir() {
        let candidate = dir.join("config.toml");
        if candidate.exists() {
            info!("Using config file at {}", candidate.display());
            return candidate;
        }
    }

    path.to_path_buf()
}

fn print_header() {
    println!("\n{}", "=".repeat(60));
    println!("        📅 スケジュールエージェント");
    println!("    AIによるカレンダー管理ツール");
    println!("{}", "=".repeat(60));
}

/// メインメニューのループ
async fn run_menu(orchestrator: &mut Orchestrator, config_path: &Path) -> Result<()> {
    print_header();

    let items = [
        "📥 スケジュールをPDF・画像から取り込む",
        "✏️  予定を自然言語で変更する",
        "🔍 予定の衝突をチェックする",
        "📊 システム状態を表示する",
        "💡 AIにスケジュールを相談する",
        "⚙️  設定を変更する",
        "❌ 終了",
    ];

    loop {
        println!();
        let selection = Select::with_theme(&ColorfulTheme::default())
            .with_prompt("メニューを選択してください")
            .default(0)
            .items(&items)
            .interact()?;

        let result = match selection {
            0 => menu_import(orchestrator).await,
            1 => menu_modify(orchestrator).await,
            2 => menu_check_conflicts(orchestrator).await,
            3 => print_status(orchestrator).await,
            4 => menu_advice(orchestrator).await,
            5 => menu_settings(orchestrator, config_path).await,
            _ => {
                println!("\n👋 ご利用ありがとうございました！");
                break;
            }
        };

        // メニュー内のエラーではループを終了させない
        if let Err(e) = result {
            log::error!("Menu action failed: {:#}", e);
            println!("\n❌ エラーが発生しました: {:#}", e);
        }
    }

    Ok(())
}

/// スケジュール取り込み
async fn menu_import(orchestrator: &Orchestrator) -> Result<()> {
    println!("\nスケジュールファイル（PDFまたはPNG/JPEGなどの画像）のパスを入力してください。");

    let path: String = Input::with_theme(&ColorfulTheme::default())
        .with_prompt("ファイルパス")
        .interact_text()?;

    // 引用符付きで貼り付けられた場合に備えて取り除く
    let path = path.trim().trim_matches(|c| c == '"' || c == '\'');

    let outcome = orchestrator
        .import_schedule(Path::new(path), true)
        .await?;
    print_import_outcome(&outcome);
    Ok(())
}

/// 自然言語での予定変更
async fn menu_modify(orchestrator: &Orchestrator) -> Result<()> {
    println!("\nコマンドの例:");
    println!("  ・「Machine Learningを金曜の14時に移動して」");
    println!("  ・「木曜のNeural Networksをキャンセル」");
    println!("  ・「Applied AIの場所をRoom 505に変更」");

    let command: String = Input::with_theme(&ColorfulTheme::default())
        .with_prompt("変更コマンド")
        .interact_text()?;

    if command.trim().is_empty() {
        println!("❌ コマンドが入力されていません");
        return Ok(());
    }

    let outcome = orchestrator.modify_event(&command).await?;
    print_change_outcome(&outcome);
    Ok(())
}

/// 衝突チェック
async fn menu_check_conflicts(orchestrator: &Orchestrator) -> Result<()> {
    let ranges = ["7日間（1週間）", "14日間（2週間）", "30日間（1ヶ月）", "カスタム"];
    let values = [7i64, 14, 30];

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("何日先までチェックしますか？")
        .default(0)
        .items(&ranges)
        .interact()?;

    let days = if selection < values.len() {
        values[selection]
    } else {
        Input::with_theme(&ColorfulTheme::default())
            .with_prompt("日数")
            .interact_text()?
    };

    let conflicts = orchestrator.check_conflicts(days, true).await?;
    println!("\n{}", orchestrator.detector().format_report(&conflicts));
    Ok(())
}

/// AI相談
async fn menu_advice(orchestrator: &Orchestrator) -> Result<()> {
    println!("\nスケジュールについて何でも聞いてください。例:");
    println!("  ・「2時間の勉強時間を入れるならいつがいい？」");
    println!("  ・「木曜に空き時間はある？」");
    println!("  ・「今週の予定は詰め込みすぎ？」");

    let query: String = Input::with_theme(&ColorfulTheme::default())
        .with_prompt("質問")
        .interact_text()?;

    if query.trim().is_empty() {
        println!("❌ 質問が入力されていません");
        return Ok(());
    }

    let advice = orchestrator.advice(&query).await?;
    println!("\n💡 AIからの提案:\n{}", advice);
    Ok(())
}

/// 設定変更
async fn menu_settings(orchestrator: &mut Orchestrator, config_path: &Path) -> Result<()> {
    println!(
        "\n現在の設定: 予定間の最小空き時間 = {} 分",
        orchestrator.minimum_gap()
    );

    let new_gap: i64 = Input::with_theme(&ColorfulTheme::default())
        .with_prompt("新しい最小空き時間（分）")
        .interact_text()?;

    if new_gap < 0 {
        println!("❌ 正の数を入力してください");
        return Ok(());
    }

    orchestrator.set_minimum_gap(new_gap);
    println!("✓ 最小空き時間を {} 分に更新しました", new_gap);

    let persist = dialoguer::Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("この設定を設定ファイルにも保存しますか？")
        .default(true)
        .interact()?;

    if persist {
        config::save_config(config_path, orchestrator.config())?;
        println!("✓ {} に保存しました", config_path.display());
    }

    Ok(())
}

/// 取り込み結果を表示
fn print_import_outcome(outcome: &orchestrator::ImportOutcome) {
    println!("\n{}", "=".repeat(60));
    println!("取り込み結果");
    println!("{}", "=".repeat(60));

    if outcome.cancelled {
        println!("❌ 取り込みはキャンセルされました（解析済み: {} 件）", outcome.parsed);
        return;
    }

    println!("✅ {} 件のイベントを登録しました", outcome.created);
    if outcome.skipped > 0 {
        println!("⚠️  {} 件をスキップしました（重複など）", outcome.skipped);
    }
    if outcome.failed > 0 {
        println!("❌ {} 件の登録に失敗しました", outcome.failed);
    }
}

/// 変更コマンドの結果を表示
fn print_change_outcome(outcome: &ChangeOutcome) {
    println!("\n{}", "=".repeat(60));
    println!("変更結果");
    println!("{}", "=".repeat(60));

    match outcome {
        ChangeOutcome::Applied { message, changes, .. } => {
            println!("✅ {}", message);
            if !changes.is_empty() {
                println!("\n📝 変更内容:");
                for (key, value) in changes {
                    println!("  ・{}: {}", key, value);
                }
            }
        }
        ChangeOutcome::Deleted { title } => {
            println!("✅ 予定「{}」を削除しました", title);
        }
        ChangeOutcome::Ambiguous { candidates } => {
            println!("⚠️  {} 件の候補が見つかりました:", candidates.len());
            for (i, event) in candidates.iter().enumerate() {
                let start = event
                    .start_naive()
                    .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "日時不明".to_string());
                println!(
                    "  {}. {}（{}）",
                    i + 1,
                    event.summary.as_deref().unwrap_or("Untitled"),
                    start
                );
            }
            println!("\n💡 ヒント: 日付なども含めてもう少し具体的に指定してください");
        }
        ChangeOutcome::NotFound { searched_for } => {
            println!("❌ 「{}」に該当する予定が見つかりませんでした", searched_for);
        }
        ChangeOutcome::Rejected { reason } => {
            println!("❌ {}", reason);
        }
    }
}

/// システム状態を表示
async fn print_status(orchestrator: &Orchestrator) -> Result<()> {
    let status = orchestrator.status().await?;

    println!("\n{}", "=".repeat(60));
    println!("📊 システム状態");
    println!("{}", "=".repeat(60));

    println!("\n📅 カレンダー統計:");
    println!("  ・今後30日間のイベント数: {}", status.events_30_days);
    println!(
        "  ・検出された衝突: {}",
        status.hard_conflicts + status.soft_conflicts + status.warnings
    );
    println!("    - 重複（ハード）: {}", status.hard_conflicts);
    println!("    - 間隔不足（ソフト）: {}", status.soft_conflicts);
    println!("    - 連続予定（警告）: {}", status.warnings);

    println!("\n⚙️  現在の設定:");
    println!("  ・予定間の最小空き時間: {} 分", status.minimum_gap_minutes);

    Ok(())
}
