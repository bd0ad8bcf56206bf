//! The admin-configured map of parent object types to the tracking
//! object's lookup columns. Fetched per logical request (the configuration
//! is transaction-scoped, not process-cached) and consulted for both link
//! creation and the dynamic lookup-column write.

use models::SupportedObject;
use sf_api::Session;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct SupportedObjectMap {
    by_type: BTreeMap<String, SupportedObject>,
}

impl SupportedObjectMap {
    pub async fn fetch(session: &Session<'_>) -> Result<Self, sf_api::Error> {
        let rows: Vec<SupportedObject> = session
            .query_as(
                "SELECT ObjectType__c, LookupField__c, IsActive__c, DisplayOrder__c \
                 FROM SupportedObject__mdt ORDER BY DisplayOrder__c ASC",
            )
            .await?;
        Ok(Self::from_rows(rows))
    }

    pub fn from_rows(rows: Vec<SupportedObject>) -> Self {
        let by_type = rows
            .into_iter()
            .filter(|row| row.is_active)
            .map(|row| (row.object_type.clone(), row))
            .collect();
        Self { by_type }
    }

    /// The lookup column configured for an object type, if the type is
    /// present and active.
    pub fn lookup_field(&self, object_type: &str) -> Option<&str> {
        self.by_type
            .get(object_type)
            .map(|row| row.lookup_field.as_str())
    }

    pub fn is_supported(&self, object_type: &str) -> bool {
        self.by_type.contains_key(object_type)
    }

    /// Maps a parent key like `AccountId` to its object type (`Account`).
    pub fn object_type_of_parent_key(parent_key: &str) -> Option<&str> {
        parent_key.strip_suffix("Id").filter(|t| !t.is_empty())
    }
}
