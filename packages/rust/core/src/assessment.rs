//! Risk assessment over an assembled document.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use amlflow_shared::{AmlFlowError, Result, RiskAssessment, TransactionId};

use crate::assembler::AssessmentDocument;
use crate::reasoning::{ReasoningRequest, ReasoningService};

pub const ASSESSMENT_SCHEMA_NAME: &str = "risk_assessment";

const SYSTEM_PROMPT: &str = "You are a financial crime expert specialized in Anti-Money Laundering (AML) risk assessment. \
     Reply with a single JSON document matching the requested schema.";

pub fn assessment_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "transaction_id": {"type": "string"},
            "extracted_entities": {"type": "array", "items": {"type": "string"}},
            "entity_types": {"type": "array", "items": {"type": "string"}},
            "risk_score": {
                "type": "number",
                "description": "Risk score between 0 and 1 (0 = low risk, 1 = high risk)"
            },
            "supporting_evidence": {"type": "array", "items": {"type": "string"}},
            "confidence_score": {
                "type": "number",
                "description": "Confidence score between 0 and 1"
            },
            "reason": {
                "type": "string",
                "description": "Detailed explanation of the risk assessment"
            },
            "timestamp": {"type": "string", "format": "date-time"}
        },
        "required": [
            "extracted_entities",
            "entity_types",
            "risk_score",
            "supporting_evidence",
            "confidence_score",
            "reason"
        ]
    })
}

fn assessment_prompt(doc: &AssessmentDocument) -> Result<String> {
    let data = serde_json::to_string_pretty(doc)?;
    Ok(format!(
        "Based on the following transaction data and associated information, generate a comprehensive risk assessment.\n\n\
         TRANSACTION:\n{}\n\n\
         EXTRACTED ENTITIES AND VERIFICATION RESULTS:\n{data}\n\n\
         Your task is to:\n\
         1. Analyze the data and identify risk factors\n\
         2. Determine if any parties are on sanctions lists\n\
         3. Check if any individuals are Politically Exposed Persons (PEPs)\n\
         4. Evaluate adverse news and negative publicity\n\
         5. Assess jurisdictional risks\n\
         6. Calculate an overall risk score between 0 and 1 (0 = low risk, 1 = high risk)\n\n\
         For any data that couldn't be fetched successfully, acknowledge that but still make your best assessment with the available information.",
        doc.transaction_text
    ))
}

#[derive(Clone)]
pub struct RiskAssessor {
    service: Arc<dyn ReasoningService>,
}

impl RiskAssessor {
    pub fn new(service: Arc<dyn ReasoningService>) -> Self {
        Self { service }
    }

    /// Ask the reasoning service for a verdict on `doc`.
    ///
    /// The reply's transaction id is replaced by `txn`, a missing timestamp
    /// is filled in, and both scores are clamped into `[0, 1]`.
    #[instrument(skip_all, fields(transaction_id = %txn))]
    pub async fn assess(&self, txn: &TransactionId, doc: &AssessmentDocument) -> Result<RiskAssessment> {
        let request = ReasoningRequest {
            system: SYSTEM_PROMPT.into(),
            prompt: assessment_prompt(doc)?,
            schema_name: ASSESSMENT_SCHEMA_NAME,
            schema: assessment_schema(),
        };
        let mut reply = self.service.generate(&request).await?;

        let Some(object) = reply.as_object_mut() else {
            return Err(AmlFlowError::parse("assessment reply is not an object"));
        };
        object.insert("transaction_id".into(), Value::String(txn.to_string()));
        let has_timestamp = object
            .get("timestamp")
            .and_then(Value::as_str)
            .is_some_and(|t| !t.trim().is_empty());
        if !has_timestamp {
            object.insert("timestamp".into(), Value::String(Utc::now().to_rfc3339()));
        }

        let mut assessment: RiskAssessment = serde_json::from_value(reply)
            .map_err(|e| AmlFlowError::parse(format!("malformed assessment reply: {e}")))?;
        assessment.clamp_scores();
        assessment.error = None;

        info!(
            risk_score = assessment.risk_score,
            confidence_score = assessment.confidence_score,
            "risk assessed"
        );
        Ok(assessment)
    }

    /// Like [`assess`](Self::assess), but never fails: any error yields the
    /// degraded verdict and the cause.
    pub async fn assess_or_degrade(
        &self,
        txn: &TransactionId,
        doc: &AssessmentDocument,
    ) -> (RiskAssessment, Option<String>) {
        match self.assess(txn, doc).await {
            Ok(assessment) => (assessment, None),
            Err(e) => {
                let cause = e.to_string();
                warn!(transaction_id = %txn, error = %cause, "risk assessment failed, using degraded verdict");
                (RiskAssessment::degraded(txn, &doc.extracted_entities, &cause), Some(cause))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reasoning::tests::StubReasoning;
    use amlflow_shared::{DEGRADED_RISK_SCORE, ExtractedEntities, Organization};

    fn txn() -> TransactionId {
        "txn_assess".parse().expect("id")
    }

    fn doc() -> AssessmentDocument {
        AssessmentDocument {
            transaction_id: "txn_assess".into(),
            transaction_text: "Acme pays Jane".into(),
            extracted_entities: ExtractedEntities {
                organizations: vec![Organization {
                    name: "Acme Shell Ltd".into(),
                    ..Default::default()
                }],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn fills_identity_and_clamps() {
        let stub = StubReasoning::new(
            json!({}),
            json!({
                "transaction_id": "hallucinated",
                "extracted_entities": ["Acme Shell Ltd"],
                "entity_types": ["shell_company"],
                "risk_score": 1.3,
                "supporting_evidence": ["sanctions match"],
                "confidence_score": 0.8,
                "reason": "Sanctioned shell company"
            }),
        );
        let assessor = RiskAssessor::new(Arc::new(stub));
        let ra = assessor.assess(&txn(), &doc()).await.expect("assess");

        assert_eq!(ra.transaction_id, "txn_assess");
        assert_eq!(ra.risk_score, 1.0);
        assert!(!ra.timestamp.is_empty());
        assert!(!ra.is_degraded());
    }

    #[tokio::test]
    async fn missing_score_degrades() {
        let stub = StubReasoning::new(json!({}), json!({"reason": "no score given"}));
        let assessor = RiskAssessor::new(Arc::new(stub));

        assert!(assessor.assess(&txn(), &doc()).await.is_err());
        let (ra, cause) = assessor.assess_or_degrade(&txn(), &doc()).await;
        assert!(cause.is_some());
        assert!(ra.is_degraded());
        assert_eq!(ra.risk_score, DEGRADED_RISK_SCORE);
        assert_eq!(ra.extracted_entities, vec!["Acme Shell Ltd"]);
    }

    #[test]
    fn prompt_embeds_document() {
        let prompt = assessment_prompt(&doc()).expect("prompt");
        assert!(prompt.contains("TRANSACTION:\nAcme pays Jane"));
        assert!(prompt.contains("\"transaction_id\": \"txn_assess\""));
    }
}
