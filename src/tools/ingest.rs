use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct IngestParams {
    #[schemars(description = "The natural language payload to remember")]
    pub content: String,

    #[schemars(description = "Interaction or conversation this payload belongs to")]
    pub link_id: String,

    #[schemars(description = "Producing component. Defaults to the node's configured origin.")]
    pub origin: Option<String>,

    #[schemars(description = "Broadcast the stored record to peers as a fact")]
    pub share: Option<bool>,
}
