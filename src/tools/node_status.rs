use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct NodeStatusParams {
    #[schemars(description = "Run a maintenance pass before reporting")]
    pub run_maintenance: Option<bool>,
}
