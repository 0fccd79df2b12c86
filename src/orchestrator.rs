use anyhow::{Context, Result};
use chrono::Duration;
use dialoguer::{theme::ColorfulTheme, Confirm};
use log::{error, info, warn};
use std::path::Path;

use crate::calendar::{self, CalendarEvent, GoogleCalendarClient};
use crate::changes::{ChangeManager, ChangeOutcome};
use crate::config::AppConfig;
use crate::conflict::{count_by_severity, Conflict, ConflictDetector};
use crate::llm;
use crate::parser::{self, ParsedEvent};

/// 取り込みワークフローの結果
#[derive(Debug, Default)]
pub struct ImportOutcome {
    pub parsed: usize,
    pub created: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: bool,
}

/// システム状態のサマリ
#[derive(Debug)]
pub struct StatusReport {
    pub events_30_days: usize,
    pub hard_conflicts: usize,
    pub soft_conflicts: usize,
    pub warnings: usize,
    pub minimum_gap_minutes: i64,
}

/// 各ワークフローをまとめるオーケストレータ
pub struct Orchestrator {
    config: AppConfig,
    calendar: GoogleCalendarClient,
    detector: ConflictDetector,
}

impl Orchestrator {
    /// 設定からすべてのコンポーネントを初期化する
    pub async fn connect(config: AppConfig) -> Result<Self> {
        info!("Initializing schedule agent components");

        let calendar = GoogleCalendarClient::connect(
            &config.google_calendar,
            &config.general.timezone,
        )
        .await
        .context("failed to connect to Google Calendar")?;

        let detector = ConflictDetector::new(config.general.minimum_gap_minutes);

        info!("All components initialized");

        Ok(Self {
            config,
            calendar,
            detector,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn detector(&self) -> &ConflictDetector {
        &self.detector
    }

    pub fn minimum_gap(&self) -> i64 {
        self.detector.minimum_gap()
    }

    pub fn set_minimum_gap(&mut self, minutes: i64) {
        self.detector.set_minimum_gap(minutes);
        self.config.general.minimum_gap_minutes = minutes;
        info!("Minimum gap updated to {} minutes", minutes);
    }

    /// スケジュールファイルを解析してカレンダーへ取り込む
    pub async fn import_schedule(
        &self,
        path: &Path,
        check_conflicts: bool,
    ) -> Result<ImportOutcome> {
        println!("\n[1/3] スケジュールファイルを解析しています...");

        let events = parser::parse_schedule_file(path, &self.config.openai).await?;

        if events.is_empty() {
            anyhow::bail!("ファイルからイベントを抽出できませんでした");
        }

        println!("\n[2/3] 解析結果:");
        println!("{}", parser::format_summary(&events));

        let proceed = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(format!(
                "{} 件のイベントをカレンダーに登録しますか？",
                events.len()
            ))
            .default(true)
            .interact()?;

        if !proceed {
            info!("Import cancelled by user");
            return Ok(ImportOutcome {
                parsed: events.len(),
                cancelled: true,
                ..Default::default()
            });
        }

        println!("\n[3/3] カレンダーにイベントを作成しています...");
        self.create_events_batch(&events, check_conflicts).await
    }

    /// イベントをまとめて作成する
    /// 重複はスキップし、衝突が見つかった場合はユーザーに確認する
    async fn create_events_batch(
        &self,
        events: &[ParsedEvent],
        check_conflicts: bool,
    ) -> Result<ImportOutcome> {
        let mut outcome = ImportOutcome {
            parsed: events.len(),
            ..Default::default()
        };

        // 対象期間の既存イベントを取得（重複・衝突チェック兼用）
        let existing = self.fetch_existing_for(events).await?;
        info!("Fetched {} existing events for the date range", existing.len());

        if check_conflicts {
            let mut conflicted = Vec::new();
            for event in events {
                let conflicts = self.detector.check_new_event(event, &existing);
                if !conflicts.is_empty() {
                    conflicted.push((event, conflicts));
                }
            }

            if !conflicted.is_empty() {
                println!("\n⚠️  {} 件のイベントで衝突が見つかりました:", conflicted.len());
                for (event, conflicts) in &conflicted {
                    println!(
                        "\n📅 {}（{} {}-{}）",
                        event.title, event.date, event.start_time, event.end_time
                    );
                    for conflict in conflicts {
                        println!(
                            "     {} と衝突: {}",
                            conflict.event2.title, conflict.message
                        );
                    }
                }

                let proceed = Confirm::with_theme(&ColorfulTheme::default())
                    .with_prompt("このまま登録を続けますか？")
                    .default(false)
                    .interact()?;

                if !proceed {
                    info!("Batch creation cancelled because of conflicts");
                    outcome.cancelled = true;
                    outcome.skipped = events.len();
                    return Ok(outcome);
                }
            }
        }

        for (i, event) in events.iter().enumerate() {
            println!("\n[{}/{}] {}", i + 1, events.len(), event.title);

            if calendar::is_duplicate(event, &existing) {
                println!("  ⚠️  既にカレンダーに存在するためスキップします");
                outcome.skipped += 1;
                continue;
            }

            let body = match self.calendar.event_from_parsed(event) {
                Ok(body) => body,
                Err(e) => {
                    error!("Could not build event body for '{}': {}", event.title, e);
                    outcome.failed += 1;
                    continue;
                }
            };

            match self.calendar.create_event(&body).await {
                Ok(created) => {
                    if let Some(link) = &created.html_link {
                        println!("  ✓ 作成しました: {}", link);
                    } else {
                        println!("  ✓ 作成しました");
                    }
                    outcome.created += 1;
                }
                Err(e) => {
                    error!("Failed to create event '{}': {}", event.title, e);
                    println!("  ✗ 作成に失敗しました: {}", e);
                    outcome.failed += 1;
                }
            }
        }

        println!(
            "\n登録結果: 作成 {} / スキップ {} / 失敗 {}",
            outcome.created, outcome.skipped, outcome.failed
        );

        Ok(outcome)
    }

    /// 取り込み対象の日付範囲にある既存イベントを取得する
    async fn fetch_existing_for(&self, events: &[ParsedEvent]) -> Result<Vec<CalendarEvent>> {
        let mut starts = Vec::new();
        for event in events {
            starts.push(event.start_datetime()?);
        }

        let Some(&min_start) = starts.iter().min() else {
            return Ok(Vec::new());
        };
        let Some(&max_start) = starts.iter().max() else {
            return Ok(Vec::new());
        };

        // 前後に1日のバッファを持たせて取得する
        self.calendar
            .list_events(
                min_start - Duration::days(1),
                max_start + Duration::days(1),
                self.config.general.max_events,
            )
            .await
    }

    /// 自然言語コマンドで予定を変更する
    /// 成功した場合は直後1週間分の衝突を再チェックして警告する
    pub async fn modify_event(&self, command: &str) -> Result<ChangeOutcome> {
        let manager = ChangeManager::new(&self.config, &self.calendar);
        let outcome = manager.process_command(command).await?;

        if matches!(outcome, ChangeOutcome::Applied { .. }) {
            println!("\n[変更後チェック] 新しい衝突がないか確認しています...");
            let conflicts = self.check_conflicts(7, true).await?;

            if !conflicts.is_empty() {
                warn!("Modification introduced {} conflict(s)", conflicts.len());
                println!("\n⚠️  この変更により新しい衝突が発生しています:");
                println!("{}", self.detector.format_report(&conflicts));
            }
        }

        Ok(outcome)
    }

    /// 指定期間の衝突をチェックする
    pub async fn check_conflicts(
        &self,
        days_ahead: i64,
        with_assessments: bool,
    ) -> Result<Vec<Conflict>> {
        let now = chrono::Local::now().naive_local();
        let horizon = now + Duration::days(days_ahead);

        info!(
            "Checking conflicts from {} to {}",
            now.format("%Y-%m-%d"),
            horizon.format("%Y-%m-%d")
        );

        let events = self
            .calendar
            .list_events(now, horizon, self.config.general.max_events)
            .await?;

        if events.is_empty() {
            info!("No events found in range");
            return Ok(Vec::new());
        }

        info!("Found {} events", events.len());

        let mut conflicts = self.detector.detect(&events);

        if with_assessments && !conflicts.is_empty() {
            self.detector
                .enhance_with_assessments(&mut conflicts, &self.config.openai)
                .await;
        }

        Ok(conflicts)
    }

    /// システム状態を取得する
    pub async fn status(&self) -> Result<StatusReport> {
        let now = chrono::Local::now().naive_local();
        let horizon = now + Duration::days(30);

        let events = self
            .calendar
            .list_events(now, horizon, self.config.general.max_events)
            .await?;

        let conflicts = self.detector.detect(&events);
        let (hard, soft, warnings) = count_by_severity(&conflicts);

        Ok(StatusReport {
            events_30_days: events.len(),
            hard_conflicts: hard,
            soft_conflicts: soft,
            warnings,
            minimum_gap_minutes: self.detector.minimum_gap(),
        })
    }

    /// 現在の予定を踏まえたスケジュール相談への回答を返す
    pub async fn advice(&self, query: &str) -> Result<String> {
        let now = chrono::Local::now().naive_local();
        let horizon = now + Duration::days(30);

        let events = self
            .calendar
            .list_events(now, horizon, self.config.general.max_events)
            .await?;

        llm::schedule_advice(&self.config.openai, query, &events).await
    }
}
