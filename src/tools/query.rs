use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct QueryParams {
    #[schemars(description = "Natural language query")]
    pub query: String,

    #[schemars(description = "Maximum number of results (default 5)")]
    pub limit: Option<usize>,

    #[schemars(
        description = "Restrict to tiers: 'ephemeral', 'short_term', 'long_term'. Defaults to all live tiers."
    )]
    pub tiers: Option<Vec<String>>,

    #[schemars(description = "Decrypt and include payloads in the results (default true)")]
    pub include_payload: Option<bool>,

    #[schemars(description = "Time budget in milliseconds")]
    pub timeout_ms: Option<u64>,
}
