//! Bulk submission parsing and the per-item summary.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use amlflow_shared::{AmlFlowError, Result, TransactionId};

use crate::service::RunDescriptor;

/// Separator line between transactions in a text batch.
pub const TEXT_SEPARATOR: &str = "---";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkFormat {
    /// One transaction per row; each row becomes `header: value` lines.
    Csv,
    /// Transactions separated by `---`.
    Txt,
}

impl BulkFormat {
    /// Guess the format from a file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        ext.parse().ok()
    }
}

impl FromStr for BulkFormat {
    type Err = AmlFlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "txt" | "text" => Ok(Self::Txt),
            other => Err(AmlFlowError::validation(format!(
                "unsupported bulk format {other:?} (expected csv or txt)"
            ))),
        }
    }
}

impl fmt::Display for BulkFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Csv => "csv",
            Self::Txt => "txt",
        })
    }
}

/// Split a batch into transaction texts. Blank items are dropped silently.
pub fn parse_batch(content: &str, format: BulkFormat) -> Result<Vec<String>> {
    let items = match format {
        BulkFormat::Csv => parse_csv(content)?,
        BulkFormat::Txt => parse_text(content),
    };
    if items.is_empty() {
        return Err(AmlFlowError::validation("no transactions found in batch"));
    }
    Ok(items)
}

fn parse_text(content: &str) -> Vec<String> {
    content
        .split(TEXT_SEPARATOR)
        .map(str::trim)
        .filter(|block| !block.is_empty())
        .map(String::from)
        .collect()
}

fn parse_csv(content: &str) -> Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(content.as_bytes());
    let headers = reader
        .headers()
        .map_err(|e| AmlFlowError::parse(format!("invalid CSV header: {e}")))?
        .clone();

    let mut items = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.map_err(|e| AmlFlowError::parse(format!("invalid CSV row {}: {e}", row + 1)))?;
        let text = headers
            .iter()
            .zip(record.iter())
            .filter(|(_, value)| !value.is_empty())
            .map(|(header, value)| format!("{header}: {value}"))
            .collect::<Vec<_>>()
            .join("\n");
        if !text.is_empty() {
            items.push(text);
        }
    }
    Ok(items)
}

/// Why a batch item has no result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkFailureKind {
    /// The item was never triggered.
    Rejected,
    /// The run ended in a failed state.
    Failed,
    /// The run did not finish within the poll timeout.
    Timeout,
}

impl BulkFailureKind {
    fn of(error: &AmlFlowError) -> Self {
        match error {
            AmlFlowError::Timeout(_) => Self::Timeout,
            AmlFlowError::Engine(_) => Self::Failed,
            _ => Self::Rejected,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkFailure {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    pub kind: BulkFailureKind,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkSummary {
    pub total: usize,
    pub processed: usize,
    pub failed: usize,
    pub results: Vec<RunDescriptor>,
    pub failures: Vec<BulkFailure>,
}

impl BulkSummary {
    pub(crate) fn push_ok(&mut self, descriptor: RunDescriptor) {
        self.processed += 1;
        self.results.push(descriptor);
    }

    pub(crate) fn push_err(&mut self, index: usize, txn: Option<&TransactionId>, error: &AmlFlowError) {
        self.failed += 1;
        self.failures.push(BulkFailure {
            index,
            transaction_id: txn.map(ToString::to_string),
            kind: BulkFailureKind::of(error),
            error: error.to_string(),
        });
    }
}
