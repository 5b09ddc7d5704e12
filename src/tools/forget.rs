use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ForgetParams {
    #[schemars(description = "Record id to delete permanently")]
    pub id: String,

    #[schemars(description = "Why the record is being removed; kept in the audit log")]
    pub reason: Option<String>,

    #[schemars(
        description = "Set when the record was a fact later found to be wrong; lowers the source peer's trust"
    )]
    pub contradicted: Option<bool>,

    #[schemars(description = "Must be true. Deletion cannot be undone.")]
    pub confirm: bool,
}
