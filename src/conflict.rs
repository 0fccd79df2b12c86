use chrono::NaiveDateTime;
use log::warn;

use crate::calendar::CalendarEvent;
use crate::config::OpenAIConfig;
use crate::llm::{self, TravelAssessment};
use crate::parser::ParsedEvent;

/// 衝突の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// 時間帯が重複している
    Overlap,
    /// 間隔が設定された最小空き時間より短い
    TightGap,
    /// 間隔ゼロで場所が異なる
    BackToBack,
}

impl ConflictKind {
    fn label(self) -> &'static str {
        match self {
            ConflictKind::Overlap => "重複",
            ConflictKind::TightGap => "間隔不足",
            ConflictKind::BackToBack => "連続予定",
        }
    }
}

/// 深刻度
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    fn icon(self) -> &'static str {
        match self {
            Severity::High => "❌",
            Severity::Medium => "⚠️",
            Severity::Low => "💡",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Severity::High => "HIGH",
            Severity::Medium => "MEDIUM",
            Severity::Low => "LOW",
        }
    }
}

/// 衝突に関与するイベント
#[derive(Debug, Clone)]
pub struct ConflictParty {
    pub title: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub location: String,
}

impl ConflictParty {
    fn from_event(event: &CalendarEvent) -> Option<Self> {
        Some(Self {
            title: event.summary.clone().unwrap_or_else(|| "Untitled".to_string()),
            start: event.start_naive()?,
            end: event.end_naive()?,
            location: event.location.clone().unwrap_or_default(),
        })
    }

    fn from_parsed(parsed: &ParsedEvent) -> Option<Self> {
        Some(Self {
            title: parsed.title.clone(),
            start: parsed.start_datetime().ok()?,
            end: parsed.end_datetime().ok()?,
            location: parsed.location.clone(),
        })
    }
}

/// 検出された衝突
#[derive(Debug, Clone)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub severity: Severity,
    pub event1: ConflictParty,
    pub event2: ConflictParty,
    pub gap_minutes: i64,
    pub message: String,
    pub suggestion: String,
    pub assessment: Option<TravelAssessment>,
}

/// スケジュール衝突の検出器
pub struct ConflictDetector {
    minimum_gap_minutes: i64,
}

impl ConflictDetector {
    pub fn new(minimum_gap_minutes: i64) -> Self {
        Self { minimum_gap_minutes }
    }

    pub fn minimum_gap(&self) -> i64 {
        self.minimum_gap_minutes
    }

    pub fn set_minimum_gap(&mut self, minutes: i64) {
        self.minimum_gap_minutes = minutes;
    }

    /// イベント一覧から衝突を検出する
    /// 開始・終了のどちらかが解釈できないイベントは対象外
    pub fn detect(&self, events: &[CalendarEvent]) -> Vec<Conflict> {
        let mut parties: Vec<ConflictParty> = events
            .iter()
            .filter_map(ConflictParty::from_event)
            .collect();

        parties.sort_by_key(|p| p.start);

        let mut conflicts = Vec::new();
        for i in 0..parties.len() {
            for j in (i + 1)..parties.len() {
                if let Some(conflict) = self.check_pair(&parties[i], &parties[j]) {
                    conflicts.push(conflict);
                }
            }
        }

        conflicts
    }

    /// 新しいイベントが既存の予定と衝突するかチェックする
    pub fn check_new_event(
        &self,
        parsed: &ParsedEvent,
        existing: &[CalendarEvent],
    ) -> Vec<Conflict> {
        let Some(new_party) = ConflictParty::from_parsed(parsed) else {
            warn!("Cannot build interval for event '{}'", parsed.title);
            return Vec::new();
        };

        existing
            .iter()
            .filter_map(ConflictParty::from_event)
            .filter_map(|existing_party| {
                // 並び順に依存しないように開始の早い方を先にする
                if new_party.start <= existing_party.start {
                    self.check_pair(&new_party, &existing_party)
                } else {
                    self.check_pair(&existing_party, &new_party)
                }
            })
            .collect()
    }

    /// 2つのイベントの関係を分類する（firstは後続より開始が早い前提）
    fn check_pair(&self, first: &ConflictParty, second: &ConflictParty) -> Option<Conflict> {
        // 時間帯の重複
        if first.start < second.end && second.start < first.end {
            return Some(Conflict {
                kind: ConflictKind::Overlap,
                severity: Severity::High,
                event1: first.clone(),
                event2: second.clone(),
                gap_minutes: 0,
                message: "予定が重複しています。両方に出席することはできません".to_string(),
                suggestion: "どちらかの予定を移動してください".to_string(),
                assessment: None,
            });
        }

        let gap_minutes = second
            .start
            .signed_duration_since(first.end)
            .num_minutes();

        // 間隔不足
        if gap_minutes > 0 && gap_minutes < self.minimum_gap_minutes {
            return Some(Conflict {
                kind: ConflictKind::TightGap,
                severity: Severity::Medium,
                event1: first.clone(),
                event2: second.clone(),
                gap_minutes,
                message: format!(
                    "予定の間隔が{}分しかありません（最小設定: {}分）",
                    gap_minutes, self.minimum_gap_minutes
                ),
                suggestion: "バッファ時間の追加や移動距離の確認を検討してください".to_string(),
                assessment: None,
            });
        }

        // 間隔ゼロで場所が違う場合のみ警告
        if gap_minutes == 0 {
            let loc1 = first.location.trim();
            let loc2 = second.location.trim();

            if !loc1.is_empty() && !loc2.is_empty() && !loc1.eq_ignore_ascii_case(loc2) {
                return Some(Conflict {
                    kind: ConflictKind::BackToBack,
                    severity: Severity::Low,
                    event1: first.clone(),
                    event2: second.clone(),
                    gap_minutes: 0,
                    message: "場所の異なる予定が連続しています".to_string(),
                    suggestion: "会場間をすぐに移動できるか確認してください".to_string(),
                    assessment: None,
                });
            }
        }

        None
    }

    /// 間隔不足の衝突について移動の実現性をモデルに評価させる
    /// 評価に失敗しても衝突自体はそのまま残す
    pub async fn enhance_with_assessments(
        &self,
        conflicts: &mut [Conflict],
        config: &OpenAIConfig,
    ) {
        for conflict in conflicts.iter_mut() {
            if conflict.kind != ConflictKind::TightGap {
                continue;
            }

            match llm::assess_travel_feasibility(
                config,
                &conflict.event1,
                &conflict.event2,
                conflict.gap_minutes,
            )
            .await
            {
                Ok(assessment) => {
                    if !assessment.feasible {
                        conflict.severity = Severity::High;
                        conflict.message =
                            format!("{} - AI: {}", conflict.message, assessment.reasoning);
                    }
                    conflict.assessment = Some(assessment);
                }
                Err(e) => {
                    warn!("Could not get travel assessment: {}", e);
                }
            }
        }
    }

    /// 衝突を読みやすいレポートに整形する
    pub fn format_report(&self, conflicts: &[Conflict]) -> String {
        if conflicts.is_empty() {
            return "✓ 衝突は検出されませんでした。".to_string();
        }

        let mut report = format!("{}\n衝突レポート\n{}\n", "=".repeat(60), "=".repeat(60));
        report.push_str(&format!("検出された問題: {} 件\n", conflicts.len()));

        let (high, medium, low) = count_by_severity(conflicts);
        report.push_str(&format!("  ❌ 重複（ハード）: {} 件\n", high));
        report.push_str(&format!("  ⚠️ 間隔不足（ソフト）: {} 件\n", medium));
        report.push_str(&format!("  💡 連続予定（警告）: {} 件\n", low));

        report.push_str(&format!(
            "（最小空き時間の設定: {} 分）\n\n",
            self.minimum_gap_minutes
        ));

        for (i, conflict) in conflicts.iter().enumerate() {
            report.push_str(&format!(
                "{} 衝突 {}: {}\n",
                conflict.severity.icon(),
                i + 1,
                conflict.kind.label()
            ));
            report.push_str(&format!("   深刻度: {}\n", conflict.severity.label()));

            for (label, party) in [("予定1", &conflict.event1), ("予定2", &conflict.event2)] {
                report.push_str(&format!("   {}: {}\n", label, party.title));
                report.push_str(&format!(
                    "          {} - {}\n",
                    party.start.format("%Y-%m-%d %H:%M"),
                    party.end.format("%H:%M")
                ));
                if !party.location.is_empty() {
                    report.push_str(&format!("          場所: {}\n", party.location));
                }
            }

            report.push_str(&format!("   問題: {}\n", conflict.message));
            report.push_str(&format!("   提案: {}\n", conflict.suggestion));

            if let Some(assessment) = &conflict.assessment {
                report.push_str(&format!("   AI評価: {}\n", assessment.reasoning));
                if !assessment.recommendation.is_empty() {
                    report.push_str(&format!("   推奨: {}\n", assessment.recommendation));
                }
            }

            report.push('\n');
        }

        report
    }
}

/// 深刻度ごとの件数（high, medium, low）
pub fn count_by_severity(conflicts: &[Conflict]) -> (usize, usize, usize) {
    let high = conflicts.iter().filter(|c| c.severity == Severity::High).count();
    let medium = conflicts.iter().filter(|c| c.severity == Severity::Medium).count();
    let low = conflicts.iter().filter(|c| c.severity == Severity::Low).count();
    (high, medium, low)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::EventDateTime;
    use crate::parser::Recurrence;

    fn event(title: &str, start: &str, end: &str, location: &str) -> CalendarEvent {
        CalendarEvent {
            summary: Some(title.to_string()),
            location: (!location.is_empty()).then(|| location.to_string()),
            start: Some(EventDateTime {
                date_time: Some(format!("{}+01:00", start)),
                ..Default::default()
            }),
            end: Some(EventDateTime {
                date_time: Some(format!("{}+01:00", end)),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn overlapping_events_are_a_hard_conflict() {
        let detector = ConflictDetector::new(15);
        let events = vec![
            event("AI", "2025-12-01T09:00:00", "2025-12-01T10:30:00", "Room 101"),
            event("Math", "2025-12-01T10:00:00", "2025-12-01T11:00:00", "Room 205"),
        ];

        let conflicts = detector.detect(&events);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::Overlap);
        assert_eq!(conflicts[0].severity, Severity::High);
    }

    #[test]
    fn short_gap_is_a_tight_gap_conflict() {
        let detector = ConflictDetector::new(15);
        let events = vec![
            event("AI", "2025-12-01T09:00:00", "2025-12-01T10:00:00", "Room 101"),
            event("Math", "2025-12-01T10:10:00", "2025-12-01T11:00:00", "Room 205"),
        ];

        let conflicts = detector.detect(&events);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::TightGap);
        assert_eq!(conflicts[0].severity, Severity::Medium);
        assert_eq!(conflicts[0].gap_minutes, 10);
    }

    #[test]
    fn sufficient_gap_is_not_a_conflict() {
        let detector = ConflictDetector::new(15);
        let events = vec![
            event("AI", "2025-12-01T09:00:00", "2025-12-01T10:00:00", "Room 101"),
            event("Math", "2025-12-01T10:30:00", "2025-12-01T11:30:00", "Room 205"),
        ];

        assert!(detector.detect(&events).is_empty());
    }

    #[test]
    fn back_to_back_at_different_locations_is_a_warning() {
        let detector = ConflictDetector::new(15);
        let events = vec![
            event("AI", "2025-12-01T09:00:00", "2025-12-01T10:00:00", "Room 101"),
            event("Math", "2025-12-01T10:00:00", "2025-12-01T11:00:00", "Math Building"),
        ];

        let conflicts = detector.detect(&events);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::BackToBack);
        assert_eq!(conflicts[0].severity, Severity::Low);
    }

    #[test]
    fn back_to_back_at_same_location_is_fine() {
        let detector = ConflictDetector::new(15);
        let events = vec![
            event("AI", "2025-12-01T09:00:00", "2025-12-01T10:00:00", "Room 101"),
            event("Lab", "2025-12-01T10:00:00", "2025-12-01T11:00:00", "room 101"),
        ];

        assert!(detector.detect(&events).is_empty());
    }

    #[test]
    fn detection_does_not_depend_on_input_order() {
        let detector = ConflictDetector::new(15);
        let events = vec![
            event("Math", "2025-12-01T10:00:00", "2025-12-01T11:00:00", ""),
            event("AI", "2025-12-01T09:00:00", "2025-12-01T10:30:00", ""),
        ];

        let conflicts = detector.detect(&events);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].event1.title, "AI");
    }

    #[test]
    fn new_event_conflicts_against_existing() {
        let detector = ConflictDetector::new(15);
        let parsed = ParsedEvent {
            title: "Study Group".to_string(),
            date: "2025-12-01".to_string(),
            start_time: "09:30".to_string(),
            end_time: "10:30".to_string(),
            location: String::new(),
            description: String::new(),
            recurrence: Recurrence::None,
        };
        let existing = vec![event(
            "AI",
            "2025-12-01T09:00:00",
            "2025-12-01T10:00:00",
            "Room 101",
        )];

        let conflicts = detector.check_new_event(&parsed, &existing);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::Overlap);
    }

    #[test]
    fn report_lists_counts_and_parties() {
        let detector = ConflictDetector::new(15);
        let events = vec![
            event("AI", "2025-12-01T09:00:00", "2025-12-01T10:30:00", "Room 101"),
            event("Math", "2025-12-01T10:00:00", "2025-12-01T11:00:00", "Room 205"),
        ];

        let conflicts = detector.detect(&events);
        let report = detector.format_report(&conflicts);

        assert!(report.contains("検出された問題: 1 件"));
        assert!(report.contains("AI"));
        assert!(report.contains("Math"));
        assert!(report.contains("場所: Room 101"));
    }

    #[test]
    fn severity_counts() {
        let detector = ConflictDetector::new(15);
        let events = vec![
            event("A", "2025-12-01T09:00:00", "2025-12-01T10:30:00", "X"),
            event("B", "2025-12-01T10:00:00", "2025-12-01T11:00:00", "Y"),
            event("C", "2025-12-01T11:05:00", "2025-12-01T12:00:00", "Z"),
        ];

        let conflicts = detector.detect(&events);
        let (high, medium, _low) = count_by_severity(&conflicts);
        assert_eq!(high, 1);
        assert_eq!(medium, 1);
    }
}
