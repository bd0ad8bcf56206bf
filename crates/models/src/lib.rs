mod canonical;
mod envelope;
mod errors;
mod id;
mod template;
mod tracking;

pub mod datetime;

pub use canonical::{canonical_json, composite_request_hash, single_request_hash};
pub use envelope::{Envelope, EnvelopeOptions, OutputFormat, TemplateSection, TemplateStrategy};
pub use errors::ErrorKind;
pub use id::RecordId;
pub use template::{
    CompositeDocument, CompositeSlot, CompositeStrategy, DataSourceKind, SupportedObject,
    TemplateRecord,
};
pub use tracking::{fields, truncate_request_json, TrackingRecord, TrackingStatus};

/// Well-known foreign-key field names which are harvested from returned data
/// trees when extracting parent record ids and when growing the composite
/// variable pool. Custom-object keys do not participate.
pub const KNOWN_PARENT_KEYS: &[&str] = &["AccountId", "ContactId", "OpportunityId", "CaseId"];
