use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct DiscoverParams {
    #[schemars(description = "Capability name, e.g. 'text.complete'")]
    pub capability: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct RequestCapabilityParams {
    #[schemars(description = "Capability name to invoke")]
    pub capability: String,

    #[schemars(description = "JSON input passed to the provider")]
    pub input: serde_json::Value,

    #[schemars(description = "Specific provider peer. Defaults to the most trusted remote provider.")]
    pub provider: Option<String>,

    #[schemars(description = "How long to wait for the final response, in milliseconds (default 30000)")]
    pub timeout_ms: Option<u64>,
}
