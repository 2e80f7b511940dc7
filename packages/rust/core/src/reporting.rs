//! Dashboard aggregates and transaction listing.

use std::cmp::Ordering;

use chrono::{DateTime, FixedOffset};
use serde::Serialize;

use amlflow_shared::{AmlFlowError, Result, RiskAssessment, TransactionState};

pub const HIGH_RISK_THRESHOLD: f64 = 0.7;
pub const MEDIUM_RISK_THRESHOLD: f64 = 0.4;
pub const RECENT_LIMIT: usize = 5;
pub const DEFAULT_PAGE_LIMIT: usize = 100;
pub const MAX_PAGE_LIMIT: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= HIGH_RISK_THRESHOLD {
            Self::High
        } else if score >= MEDIUM_RISK_THRESHOLD {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentTransaction {
    pub id: String,
    pub timestamp: String,
    pub risk: f64,
    pub status: TransactionState,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Dashboard {
    pub total_transactions: usize,
    pub high_risk: usize,
    pub medium_risk: usize,
    pub low_risk: usize,
    pub recent_transactions: Vec<RecentTransaction>,
}

/// Bucket every assessment exactly once and keep the newest few.
pub fn build_dashboard<'a>(assessments: impl IntoIterator<Item = &'a RiskAssessment>) -> Dashboard {
    let mut dashboard = Dashboard::default();
    let mut recent: Vec<&RiskAssessment> = Vec::new();
    for ra in assessments {
        dashboard.total_transactions += 1;
        match RiskLevel::from_score(ra.risk_score) {
            RiskLevel::High => dashboard.high_risk += 1,
            RiskLevel::Medium => dashboard.medium_risk += 1,
            RiskLevel::Low => dashboard.low_risk += 1,
        }
        recent.push(ra);
    }
    recent.sort_by(|a, b| newest_first(&a.timestamp, &b.timestamp));
    dashboard.recent_transactions = recent
        .into_iter()
        .take(RECENT_LIMIT)
        .map(|ra| RecentTransaction {
            id: ra.transaction_id.clone(),
            timestamp: ra.timestamp.clone(),
            risk: ra.risk_score,
            status: TransactionState::Completed,
        })
        .collect();
    dashboard
}

/// Descending by RFC 3339 timestamp; unparseable timestamps sort last.
pub fn newest_first(a: &str, b: &str) -> Ordering {
    match (parse_timestamp(a), parse_timestamp(b)) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => b.cmp(a),
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(s).ok()
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionSummary {
    pub transaction_id: String,
    pub status: TransactionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListQuery {
    pub status: Option<TransactionState>,
    /// Case-insensitive substring of the transaction id.
    pub search: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            status: None,
            search: None,
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionPage {
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
    pub items: Vec<TransactionSummary>,
}

/// Filter, order newest first, then slice.
pub fn paginate(mut items: Vec<TransactionSummary>, query: &ListQuery) -> Result<TransactionPage> {
    if !(1..=MAX_PAGE_LIMIT).contains(&query.limit) {
        return Err(AmlFlowError::validation(format!(
            "limit must be between 1 and {MAX_PAGE_LIMIT}"
        )));
    }
    let needle = query.search.as_deref().map(str::to_lowercase);
    items.retain(|item| {
        query.status.is_none_or(|s| item.status == s)
            && needle
                .as_deref()
                .is_none_or(|n| item.transaction_id.to_lowercase().contains(n))
    });
    items.sort_by(|a, b| {
        newest_first(
            a.timestamp.as_deref().unwrap_or_default(),
            b.timestamp.as_deref().unwrap_or_default(),
        )
        .then_with(|| b.transaction_id.cmp(&a.transaction_id))
    });

    let total = items.len();
    let items = items.into_iter().skip(query.offset).take(query.limit).collect();
    Ok(TransactionPage {
        total,
        offset: query.offset,
        limit: query.limit,
        items,
    })
}
