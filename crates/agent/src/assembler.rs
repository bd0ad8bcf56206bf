//! Builds the fully-materialized request from an inbound envelope: loads
//! template and composite metadata, runs data providers where the caller
//! did not supply data, extracts parent record ids, and computes the
//! idempotency hash. Both the interactive endpoint and the batch worker
//! run the same preparation so their hashes agree.

use crate::providers::{DataProvider, ProviderRegistry, SoqlProvider};
use crate::GenError;
use models::{
    CompositeDocument, CompositeSlot, CompositeStrategy, DataSourceKind, Envelope, ErrorKind,
    RecordId, TemplateRecord, KNOWN_PARENT_KEYS,
};
use sf_api::Session;
use std::collections::BTreeMap;
use std::sync::Arc;
use validator::Validate;

pub const TEMPLATE_OBJECT: &str = "DocumentTemplate__c";
pub const COMPOSITE_OBJECT: &str = "CompositeDocument__c";
pub const SLOT_OBJECT: &str = "CompositeSlot__c";

const TEMPLATE_FIELDS: &str =
    "Id, DataSource__c, Query__c, ProviderClass__c, PrimaryParentType__c, TemplateBinary__c";

/// One planned merge input of a concatenated composite.
#[derive(Debug, Clone)]
pub struct PlanSection {
    pub binary_id: RecordId,
    pub namespace: String,
    pub sequence: i64,
}

/// What the pipeline will merge, decided by the template strategy.
#[derive(Debug, Clone)]
pub enum MergePlan {
    /// Plain single-template generation.
    Single { binary_id: RecordId },
    /// A composite whose master template is merged with the full
    /// namespaced data map.
    CompositeOwn { binary_id: RecordId },
    /// Per-slot merges concatenated in sequence order.
    Concatenate { sections: Vec<PlanSection> },
}

/// A prepared request: the final envelope (data materialized), its
/// idempotency hash, the merge plan, and the resolved parent pool.
///
/// `envelope.parents` stays exactly as the caller supplied it; the hash is
/// computed over that seed, and a replay of the persisted envelope grows
/// the same pool again from (seed, data).
#[derive(Debug, Clone)]
pub struct Prepared {
    pub envelope: Envelope,
    pub request_hash: String,
    pub plan: MergePlan,
    /// The caller's seed grown by foreign-key harvesting; drives link
    /// creation and the dynamic lookup write.
    pub parents: BTreeMap<String, Option<RecordId>>,
    pub primary_parent_type: Option<String>,
    pub store_merged_docx: bool,
    pub return_docx_to_client: bool,
}

pub struct Assembler<'a> {
    pub session: &'a Session<'a>,
    pub providers: &'a ProviderRegistry,
}

impl Assembler<'_> {
    #[tracing::instrument(skip_all, fields(correlation_id = %envelope.correlation_id))]
    pub async fn prepare(&self, envelope: Envelope) -> Result<Prepared, GenError> {
        envelope
            .validate()
            .map_err(|err| GenError::validation(err.to_string()))?;

        if envelope.template_id.is_some() {
            self.prepare_single(envelope).await
        } else {
            self.prepare_composite(envelope).await
        }
    }

    async fn prepare_single(&self, mut envelope: Envelope) -> Result<Prepared, GenError> {
        let template_id = envelope.template_id.clone().expect("validated");
        let template = self.load_template(&template_id).await?;

        if data_is_absent(&envelope.data) {
            let driving = driving_record_id(&envelope.parents, template.primary_parent_type.as_deref());
            let provider = self.resolve_provider(&template)?;
            envelope.data = provider.gather(self.session, driving.as_ref()).await?;
        }

        let mut parents = envelope.parents.clone();
        harvest_parent_ids(&envelope.data, &mut parents);

        let request_hash =
            models::single_request_hash(&template_id, envelope.output_format, &envelope.data);
        Ok(Prepared {
            store_merged_docx: envelope.options.store_merged_docx,
            return_docx_to_client: envelope.options.return_docx_to_client,
            primary_parent_type: template.primary_parent_type.clone(),
            plan: MergePlan::Single {
                binary_id: template.template_binary_id,
            },
            request_hash,
            parents,
            envelope,
        })
    }

    async fn prepare_composite(&self, mut envelope: Envelope) -> Result<Prepared, GenError> {
        let composite_id = envelope.composite_document_id.clone().expect("validated");
        let composite = self.load_composite(&composite_id).await?;
        if !composite.is_active {
            return Err(GenError::new(
                ErrorKind::CompositeInactive,
                format!("composite document {composite_id} is inactive"),
            ));
        }
        let slots = self.load_slots(&composite_id).await?;
        if slots.is_empty() {
            return Err(GenError::new(
                ErrorKind::CompositeInactive,
                format!("composite document {composite_id} has no active slots"),
            ));
        }

        // The shared variable pool: seeded from the caller's record ids,
        // grown by harvesting well-known foreign keys from each slot's data.
        // The idempotency hash covers only the seed, so `envelope.parents`
        // is never overwritten with the grown pool.
        let mut pool: BTreeMap<String, Option<RecordId>> = envelope.parents.clone();

        let mut data = match envelope.data {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            _ => {
                return Err(GenError::validation(
                    "composite data must be a namespace-keyed object",
                ));
            }
        };

        let mut sections = Vec::with_capacity(slots.len());
        let mut slot_template_ids = Vec::with_capacity(slots.len());
        for slot in &slots {
            let template = self.load_template(&slot.template_id).await?;

            if !data.contains_key(&slot.namespace) {
                let driving = driving_record_id(&pool, template.primary_parent_type.as_deref());
                let provider = self.resolve_provider(&template)?;
                let tree = provider.gather(self.session, driving.as_ref()).await?;
                data.insert(slot.namespace.clone(), tree);
            }

            harvest_parent_ids(&data[slot.namespace.as_str()], &mut pool);
            sections.push(PlanSection {
                binary_id: template.template_binary_id,
                namespace: slot.namespace.clone(),
                sequence: slot.sequence,
            });
            slot_template_ids.push(slot.template_id.clone());
        }

        envelope.data = serde_json::Value::Object(data);

        let plan = match composite.strategy {
            CompositeStrategy::OwnTemplate => {
                let binary_id = composite.template_binary_id.clone().ok_or_else(|| {
                    GenError::new(
                        ErrorKind::TemplateInvalid,
                        format!("composite document {composite_id} has no master template"),
                    )
                })?;
                MergePlan::CompositeOwn { binary_id }
            }
            CompositeStrategy::ConcatenateTemplates => MergePlan::Concatenate { sections },
        };

        // Mirror the plan into the envelope's wire fields so the persisted
        // request replays identically.
        envelope.template_strategy = Some(match composite.strategy {
            CompositeStrategy::OwnTemplate => models::TemplateStrategy::OwnTemplate,
            CompositeStrategy::ConcatenateTemplates => models::TemplateStrategy::ConcatenateTemplates,
        });
        if let MergePlan::Concatenate { sections } = &plan {
            envelope.templates = sections
                .iter()
                .zip(slot_template_ids)
                .map(|(section, template_id)| models::TemplateSection {
                    template_id,
                    namespace: section.namespace.clone(),
                    sequence: section.sequence,
                })
                .collect();
        }

        let request_hash = models::composite_request_hash(
            &composite_id,
            envelope.output_format,
            &envelope.parents,
            &envelope.data,
        );
        Ok(Prepared {
            store_merged_docx: envelope.options.store_merged_docx || composite.store_merged_docx,
            return_docx_to_client: envelope.options.return_docx_to_client
                || composite.return_docx_to_client,
            primary_parent_type: composite.primary_parent_type.clone(),
            plan,
            request_hash,
            parents: pool,
            envelope,
        })
    }

    async fn load_template(&self, id: &RecordId) -> Result<TemplateRecord, GenError> {
        let soql = format!(
            "SELECT {TEMPLATE_FIELDS} FROM {TEMPLATE_OBJECT} WHERE Id = {}",
            sf_api::quote_literal(id.as_str()),
        );
        self.session
            .query_one(&soql)
            .await
            .map_err(GenError::from)?
            .ok_or_else(|| {
                GenError::new(ErrorKind::TemplateNotFound, format!("template {id} not found"))
            })
    }

    async fn load_composite(&self, id: &RecordId) -> Result<CompositeDocument, GenError> {
        let soql = format!(
            "SELECT Id, Strategy__c, TemplateBinary__c, IsActive__c, PrimaryParentType__c, \
             StoreMergedDocx__c, ReturnDocxToClient__c FROM {COMPOSITE_OBJECT} WHERE Id = {}",
            sf_api::quote_literal(id.as_str()),
        );
        self.session
            .query_one(&soql)
            .await
            .map_err(GenError::from)?
            .ok_or_else(|| {
                GenError::new(
                    ErrorKind::TemplateNotFound,
                    format!("composite document {id} not found"),
                )
            })
    }

    /// Loads active slots in ascending sequence and rejects duplicate
    /// namespaces.
    async fn load_slots(&self, composite_id: &RecordId) -> Result<Vec<CompositeSlot>, GenError> {
        let soql = format!(
            "SELECT Id, Namespace__c, Sequence__c, Template__c, IsActive__c FROM {SLOT_OBJECT} \
             WHERE CompositeDocument__c = {} AND IsActive__c = true ORDER BY Sequence__c ASC",
            sf_api::quote_literal(composite_id.as_str()),
        );
        let slots: Vec<CompositeSlot> = self.session.query_as(&soql).await.map_err(GenError::from)?;

        let mut seen = std::collections::BTreeSet::new();
        for slot in &slots {
            if !seen.insert(slot.namespace.as_str()) {
                return Err(GenError::new(
                    ErrorKind::CompositeDuplicateNamespace,
                    format!("namespace {:?} appears in more than one slot", slot.namespace),
                ));
            }
        }
        Ok(slots)
    }

    fn resolve_provider(&self, template: &TemplateRecord) -> Result<Arc<dyn DataProvider>, GenError> {
        match template.data_source {
            DataSourceKind::Soql => {
                let query = template.query.clone().ok_or_else(|| {
                    GenError::new(
                        ErrorKind::TemplateInvalid,
                        format!("template {} has no query", template.id),
                    )
                })?;
                Ok(Arc::new(SoqlProvider::new(query)))
            }
            DataSourceKind::Custom => {
                let name = template.provider_class.as_deref().ok_or_else(|| {
                    GenError::new(
                        ErrorKind::TemplateInvalid,
                        format!("template {} names no provider class", template.id),
                    )
                })?;
                self.providers.custom(name)
            }
        }
    }
}

fn data_is_absent(data: &serde_json::Value) -> bool {
    match data {
        serde_json::Value::Null => true,
        serde_json::Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// The driving record id for a provider: the pool entry keyed by the
/// template's primary parent type (`Account` maps to `AccountId`).
fn driving_record_id(
    pool: &BTreeMap<String, Option<RecordId>>,
    primary_parent_type: Option<&str>,
) -> Option<RecordId> {
    let key = format!("{}Id", primary_parent_type?);
    pool.get(&key).cloned().flatten()
}

/// Harvests well-known foreign keys from a data tree into the parent map:
/// the tree root plus each direct child object (one namespace level).
/// Existing entries are never overwritten, and only the fixed key set
/// participates. Ids are never inferred from value shapes.
fn harvest_parent_ids(
    data: &serde_json::Value,
    into: &mut BTreeMap<String, Option<RecordId>>,
) {
    fn harvest_object(object: &serde_json::Value, into: &mut BTreeMap<String, Option<RecordId>>) {
        for key in KNOWN_PARENT_KEYS {
            if into.get(*key).map(|v| v.is_some()).unwrap_or(false) {
                continue;
            }
            if let Some(serde_json::Value::String(raw)) = object.get(*key) {
                if let Ok(id) = raw.parse::<RecordId>() {
                    into.insert((*key).to_string(), Some(id));
                }
            }
        }
    }

    harvest_object(data, into);
    if let Some(map) = data.as_object() {
        for child in map.values() {
            if child.is_object() {
                harvest_object(child, into);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_harvest_known_keys_only() {
        let data = json!({
            "AccountId": "001A1234567890AQAA",
            "MyObject__c": "a0ZA1234567890AQAA",
            "Contact": {"ContactId": "003A1234567890AQAA"},
            "Junk": {"OpportunityId": "not an id"},
        });
        let mut pool = BTreeMap::new();
        harvest_parent_ids(&data, &mut pool);

        assert_eq!(
            pool.keys().collect::<Vec<_>>(),
            vec!["AccountId", "ContactId"],
            "custom keys and malformed ids never participate",
        );
    }

    #[test]
    fn test_harvest_never_overwrites() {
        let seeded: RecordId = "001B1234567890AQAA".parse().unwrap();
        let mut pool = BTreeMap::new();
        pool.insert("AccountId".to_string(), Some(seeded.clone()));

        harvest_parent_ids(&json!({"AccountId": "001A1234567890AQAA"}), &mut pool);
        assert_eq!(pool["AccountId"], Some(seeded));
    }

    #[test]
    fn test_driving_record_id_by_primary_type() {
        let mut pool = BTreeMap::new();
        pool.insert(
            "AccountId".to_string(),
            Some("001A1234567890AQAA".parse().unwrap()),
        );
        assert!(driving_record_id(&pool, Some("Account")).is_some());
        assert!(driving_record_id(&pool, Some("Case")).is_none());
        assert!(driving_record_id(&pool, None).is_none());
    }

    #[test]
    fn test_data_absence() {
        assert!(data_is_absent(&serde_json::Value::Null));
        assert!(data_is_absent(&json!({})));
        assert!(!data_is_absent(&json!({"Account": {}})));
        assert!(!data_is_absent(&json!([1])));
    }
}
