pub mod capabilities;
pub mod forget;
pub mod ingest;
pub mod node_status;
pub mod query;
pub mod recall;

use std::time::Duration;

use capabilities::{DiscoverParams, RequestCapabilityParams};
use forget::ForgetParams;
use ingest::IngestParams;
use node_status::NodeStatusParams;
use query::QueryParams;
use recall::RecallParams;
use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::{tool, tool_handler, tool_router, ServerHandler};

use crate::memory::types::Tier;
use crate::memory::Deadline;
use crate::node::Node;

const DEFAULT_LIMIT: usize = 5;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// The MCP tool handler. Every tool is a thin adapter over a [`Node`].
#[derive(Clone)]
pub struct MnemoTools {
    tool_router: ToolRouter<Self>,
    node: Node,
}

#[tool_router]
impl MnemoTools {
    pub fn new(node: Node) -> Self {
        Self {
            tool_router: Self::tool_router(),
            node,
        }
    }

    /// Ingest a payload into the tiered store.
    #[tool(description = "Store a payload in semantic memory. Near-duplicates within the same link_id are merged into the existing record.")]
    async fn ingest(
        &self,
        Parameters(params): Parameters<IngestParams>,
    ) -> Result<String, String> {
        if params.content.trim().is_empty() {
            return Err("content must not be empty".into());
        }
        let origin = params
            .origin
            .unwrap_or_else(|| self.node.config().node.default_origin.clone());

        tracing::info!(
            content_len = params.content.len(),
            link_id = %params.link_id,
            origin = %origin,
            "ingest called"
        );

        let outcome = self
            .node
            .ingest(&params.content, &origin, &params.link_id, None)
            .await
            .map_err(|e| format!("store failed: {e}"))?;

        let shared = if params.share.unwrap_or(false) {
            let delivery = self
                .node
                .share(&outcome.id)
                .await
                .map_err(|e| format!("stored as {} but sharing failed: {e}", outcome.id))?;
            Some(delivery)
        } else {
            None
        };

        serde_json::to_string(&serde_json::json!({ "record": outcome, "shared": shared }))
            .map_err(|e| format!("serialization failed: {e}"))
    }

    /// Nearest-neighbour search over live records.
    #[tool(description = "Search memory by natural language. Returns the closest verified records, optionally restricted to tiers.")]
    async fn query(
        &self,
        Parameters(params): Parameters<QueryParams>,
    ) -> Result<String, String> {
        let tiers = params
            .tiers
            .map(|names| {
                names
                    .iter()
                    .map(|t| t.parse::<Tier>())
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?;
        let limit = params.limit.unwrap_or(DEFAULT_LIMIT);
        let deadline = params.timeout_ms.map(|ms| Deadline::after(Duration::from_millis(ms)));

        tracing::info!(query_len = params.query.len(), limit, "query called");

        let hits = self
            .node
            .query(&params.query, limit, tiers, deadline)
            .await
            .map_err(|e| format!("query failed: {e}"))?;

        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            let payload = if params.include_payload.unwrap_or(true) {
                let recalled = self
                    .node
                    .store()
                    .recall(&hit.record.id)
                    .await
                    .map_err(|e| format!("recall of {} failed: {e}", hit.record.id))?;
                Some(recalled.payload)
            } else {
                None
            };
            results.push(serde_json::json!({
                "id": hit.record.id,
                "tier": hit.record.tier,
                "importance": hit.record.importance,
                "similarity": hit.similarity,
                "link_id": hit.record.link_id,
                "payload": payload,
            }));
        }

        Ok(serde_json::json!({ "total": results.len(), "records": results }).to_string())
    }

    /// Full metadata and payload of one record.
    #[tool(description = "Inspect a single record by id: tier, importance, provenance and decrypted payload.")]
    async fn recall(
        &self,
        Parameters(params): Parameters<RecallParams>,
    ) -> Result<String, String> {
        let recalled = self
            .node
            .store()
            .recall(&params.id)
            .await
            .map_err(|e| format!("inspect failed: {e}"))?;
        serde_json::to_string(&recalled).map_err(|e| format!("serialization failed: {e}"))
    }

    #[tool(description = "Permanently delete a record. Requires confirm=true. Set contradicted=true when a peer-supplied fact proved wrong.")]
    async fn forget(
        &self,
        Parameters(params): Parameters<ForgetParams>,
    ) -> Result<String, String> {
        if !params.confirm {
            return Err("confirm must be true to delete a record".into());
        }
        let trust = if params.contradicted.unwrap_or(false) {
            self.node
                .report_fact_outcome(&params.id, true)
                .await
                .map_err(|e| format!("trust update failed: {e}"))?
        } else {
            None
        };
        let result = self
            .node
            .store()
            .forget(&params.id, params.reason.as_deref())
            .await
            .map_err(|e| format!("forget failed: {e}"))?;

        tracing::info!(id = %result.id, "record forgotten");
        Ok(serde_json::json!({
            "deleted": result.id,
            "link_id": result.link_id,
            "source_trust": trust,
        })
        .to_string())
    }

    #[tool(description = "List live providers of a capability, local first, then by peer trust.")]
    async fn discover_capability(
        &self,
        Parameters(params): Parameters<DiscoverParams>,
    ) -> Result<String, String> {
        let providers = self.node.discover(&params.capability);
        serde_json::to_string(&providers).map_err(|e| format!("serialization failed: {e}"))
    }

    #[tool(description = "Invoke a capability on a peer and wait for its final response.")]
    async fn request_capability(
        &self,
        Parameters(params): Parameters<RequestCapabilityParams>,
    ) -> Result<String, String> {
        let handle = match &params.provider {
            Some(provider) => {
                self.node
                    .request_from(provider, &params.capability, params.input)
                    .await
            }
            None => self.node.request(&params.capability, params.input).await,
        }
        .map_err(|e| format!("request failed: {e}"))?;

        let correlation_id = handle.correlation_id.clone();
        let timeout = Duration::from_millis(params.timeout_ms.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS));
        let update = handle
            .final_response(timeout)
            .await
            .map_err(|e| format!("request {correlation_id} failed: {e}"))?;

        Ok(serde_json::json!({
            "correlation_id": correlation_id,
            "provider": update.responder,
            "status": update.response.status,
            "output": update.response.output,
        })
        .to_string())
    }

    #[tool(description = "Connection state, outbox depth, store statistics and peer trust for this node.")]
    async fn node_status(
        &self,
        Parameters(params): Parameters<NodeStatusParams>,
    ) -> Result<String, String> {
        let maintenance = if params.run_maintenance.unwrap_or(false) {
            Some(
                self.node
                    .run_maintenance()
                    .await
                    .map_err(|e| format!("maintenance failed: {e}"))?,
            )
        } else {
            None
        };
        let status = self
            .node
            .status()
            .await
            .map_err(|e| format!("status failed: {e}"))?;
        serde_json::to_string(&serde_json::json!({ "status": status, "maintenance": maintenance }))
            .map_err(|e| format!("serialization failed: {e}"))
    }
}

#[tool_handler]
impl ServerHandler for MnemoTools {
    fn get_info(&self) -> rmcp::model::ServerInfo {
        rmcp::model::ServerInfo {
            instructions: Some(
                "Mnemosync is a tiered semantic memory shared with peers. Use ingest to save, \
                 query to search and discover_capability / request_capability to reach \
                 other nodes."
                    .into(),
            ),
            capabilities: rmcp::model::ServerCapabilities::builder()
                .enable_tools()
                .build(),
            ..Default::default()
        }
    }
}
