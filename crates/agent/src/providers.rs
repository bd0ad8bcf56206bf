//! Data providers resolve a template's data tree. The SOQL driver binds the
//! driving record id into a templated query; custom providers are looked up
//! by name from a registry so admin metadata can reference them without the
//! core switching over provider names.

use crate::GenError;
use models::{ErrorKind, RecordId};
use sf_api::Session;
use std::collections::HashMap;
use std::sync::Arc;

#[async_trait::async_trait]
pub trait DataProvider: Send + Sync {
    async fn gather(
        &self,
        session: &Session<'_>,
        record_id: Option<&RecordId>,
    ) -> Result<serde_json::Value, GenError>;
}

/// Executes a templated SOQL query with `:recordId` bound to the driving
/// record. A single returned row becomes the tree root; multiple rows land
/// under a `records` key.
pub struct SoqlProvider {
    query: String,
}

impl SoqlProvider {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
        }
    }
}

/// The record store decorates each row with an `attributes` envelope which
/// is transport metadata, not template data.
fn strip_attributes(record: &mut serde_json::Value) {
    if let Some(object) = record.as_object_mut() {
        object.remove("attributes");
        for value in object.values_mut() {
            strip_attributes(value);
        }
    } else if let Some(items) = record.as_array_mut() {
        for value in items {
            strip_attributes(value);
        }
    }
}

#[async_trait::async_trait]
impl DataProvider for SoqlProvider {
    async fn gather(
        &self,
        session: &Session<'_>,
        record_id: Option<&RecordId>,
    ) -> Result<serde_json::Value, GenError> {
        let soql = match record_id {
            Some(id) => sf_api::bind(&self.query, "recordId", id.as_str()),
            None => self.query.clone(),
        };
        let mut records = session.query(&soql).await.map_err(GenError::from)?;
        for record in &mut records {
            strip_attributes(record);
        }
        Ok(match records.len() {
            1 => records.pop().expect("len checked"),
            _ => serde_json::json!({ "records": records }),
        })
    }
}

/// Named custom providers. Registration happens at startup; admin metadata
/// references providers purely by name.
#[derive(Default)]
pub struct ProviderRegistry {
    custom: HashMap<String, Arc<dyn DataProvider>>,
}

impl ProviderRegistry {
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn DataProvider>) {
        self.custom.insert(name.into(), provider);
    }

    pub fn custom(&self, name: &str) -> Result<Arc<dyn DataProvider>, GenError> {
        self.custom.get(name).cloned().ok_or_else(|| {
            GenError::new(
                ErrorKind::TemplateInvalid,
                format!("unknown data provider {name:?}"),
            )
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_attribute_envelopes_are_stripped() {
        let mut record = serde_json::json!({
            "attributes": {"type": "Account"},
            "Name": "Acme",
            "Contacts": [
                {"attributes": {"type": "Contact"}, "Email": "a@acme.example"},
            ],
        });
        strip_attributes(&mut record);
        assert_eq!(
            record,
            serde_json::json!({
                "Name": "Acme",
                "Contacts": [{"Email": "a@acme.example"}],
            }),
        );
    }

    #[test]
    fn test_unknown_custom_provider_is_template_invalid() {
        let registry = ProviderRegistry::default();
        let err = match registry.custom("AccountSummaryProvider") {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert_eq!(err.kind, ErrorKind::TemplateInvalid);
    }
}
