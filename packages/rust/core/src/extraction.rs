//! Entity extraction from raw transaction text.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, instrument};

use amlflow_shared::{
    AmlFlowError, EntityKey, ExtractedEntities, Organization, Person, Result, TransactionId,
};

use crate::reasoning::{ReasoningRequest, ReasoningService};

pub const EXTRACTION_SCHEMA_NAME: &str = "entity_extraction";

const SYSTEM_PROMPT: &str =
    "You are a financial crime expert. Reply with a single JSON document matching the requested schema.";

/// JSON schema the reasoning service must satisfy.
pub fn extraction_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "transaction_id": {"type": "string"},
            "organizations": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "role": {"type": "string", "enum": ["sender", "recipient", "intermediary"]},
                        "jurisdiction": {"type": "string"},
                        "entity_type": {
                            "type": "string",
                            "enum": ["corporation", "shell_company", "non_profit", "government_agency", "financial_institution"]
                        }
                    },
                    "required": ["name"]
                }
            },
            "people": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "role": {"type": "string", "enum": ["director", "approver", "beneficiary", "other"]},
                        "country": {"type": "string"}
                    },
                    "required": ["name"]
                }
            },
            "transaction": {
                "type": "object",
                "properties": {
                    "amount": {"type": "string"},
                    "currency": {"type": "string"},
                    "purpose": {"type": "string"},
                    "date": {"type": "string"}
                }
            },
            "jurisdictions": {"type": "array", "items": {"type": "string"}}
        },
        "required": ["transaction_id", "organizations", "people"]
    })
}

fn extraction_prompt(text: &str) -> String {
    format!(
        "Extract entities from the following transaction data:\n\n\
         {text}\n\n\
         Please identify:\n\
         1. Organizations involved (sender and recipient companies/entities)\n\
         2. People mentioned (directors, approvers, beneficiaries)\n\
         3. Transaction details (amount, currency, purpose)\n\
         4. Jurisdictions mentioned (countries, territories)\n\n\
         Provide a structured response with all the entities you identified from the transaction data."
    )
}

/// Raw extraction reply; the required arrays are still enforced.
#[derive(Deserialize)]
struct ExtractionReply {
    organizations: Vec<Organization>,
    people: Vec<Person>,
    #[serde(default)]
    transaction: Option<Value>,
    #[serde(default)]
    jurisdictions: Vec<String>,
}

#[derive(Clone)]
pub struct EntityExtractor {
    service: Arc<dyn ReasoningService>,
}

impl EntityExtractor {
    pub fn new(service: Arc<dyn ReasoningService>) -> Self {
        Self { service }
    }

    /// Extract organizations, people, transaction details and jurisdictions.
    ///
    /// Empty text is a validation error; a reply without the required
    /// arrays is a parse error.
    #[instrument(skip_all, fields(transaction_id = %txn))]
    pub async fn extract(&self, txn: &TransactionId, text: &str) -> Result<ExtractedEntities> {
        if text.trim().is_empty() {
            return Err(AmlFlowError::validation("transaction text is empty"));
        }

        let request = ReasoningRequest {
            system: SYSTEM_PROMPT.into(),
            prompt: extraction_prompt(text),
            schema_name: EXTRACTION_SCHEMA_NAME,
            schema: extraction_schema(),
        };
        let reply = self.service.generate(&request).await?;
        let reply: ExtractionReply = serde_json::from_value(reply)
            .map_err(|e| AmlFlowError::parse(format!("malformed extraction reply: {e}")))?;

        let entities = ExtractedEntities {
            organizations: dedup_by_key(reply.organizations, |o| &o.name),
            people: dedup_by_key(reply.people, |p| &p.name),
            transaction: reply.transaction,
            jurisdictions: reply.jurisdictions,
        };
        info!(
            organizations = entities.organizations.len(),
            people = entities.people.len(),
            "entities extracted"
        );
        Ok(entities)
    }
}

/// Drop entries with blank names and repeats of the same entity key.
fn dedup_by_key<T>(items: Vec<T>, name: impl Fn(&T) -> &String) -> Vec<T> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| {
            let key = EntityKey::from_name(name(item));
            !key.is_empty() && seen.insert(key)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reasoning::tests::StubReasoning;

    fn txn() -> TransactionId {
        "txn_extract".parse().expect("id")
    }

    #[tokio::test]
    async fn normalizes_reply() {
        let stub = StubReasoning::new(
            json!({
                "transaction_id": "made-up",
                "organizations": [
                    {"name": "Acme Shell Ltd", "role": "sender", "jurisdiction": "Cayman Islands", "entity_type": "shell_company"},
                    {"name": "ACME  shell ltd", "role": "sender"},
                    {"name": "  "}
                ],
                "people": [{"name": "Jane PEP", "role": "beneficiary", "country": "GB"}],
                "transaction": {"amount": "1000000", "currency": "USD"},
                "jurisdictions": ["Cayman Islands"]
            }),
            json!({}),
        );
        let extractor = EntityExtractor::new(Arc::new(stub));

        let entities = extractor.extract(&txn(), "Acme pays Jane").await.expect("extract");
        assert_eq!(entities.organizations.len(), 1);
        assert_eq!(entities.organizations[0].jurisdiction.as_deref(), Some("Cayman Islands"));
        assert_eq!(entities.people[0].country.as_deref(), Some("GB"));
        assert_eq!(entities.jurisdictions, vec!["Cayman Islands"]);
        assert_eq!(entities.transaction.as_ref().map(|t| t["currency"].clone()), Some(json!("USD")));
    }

    #[tokio::test]
    async fn empty_text_is_rejected_before_calling() {
        let stub = Arc::new(StubReasoning::new(json!({}), json!({})));
        let extractor = EntityExtractor::new(stub.clone());
        let err = extractor.extract(&txn(), "   \n").await.expect_err("empty");
        assert!(matches!(err, AmlFlowError::Validation { .. }));
        assert_eq!(stub.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_required_arrays_is_parse_error() {
        let stub = StubReasoning::new(json!({"organizations": []}), json!({}));
        let extractor = EntityExtractor::new(Arc::new(stub));
        let err = extractor.extract(&txn(), "text").await.expect_err("no people");
        assert!(matches!(err, AmlFlowError::Parse { .. }));
    }
}
