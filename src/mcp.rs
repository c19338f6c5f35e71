use std::sync::Arc;

use rmcp::{
    ServerHandler,
    ServiceExt,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{
        CallToolResult,
        Content,
        Implementation,
        ServerCapabilities,
        ServerInfo,
    },
    tool,
    tool_handler,
    tool_router,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use crate::{
    error::{self, Error},
    factor::ExtractedFactors,
    rank::{RankResponse, RankService},
};

#[derive(Clone)]
pub struct BriefmatchMcpServer {
    service: Arc<RankService>,
    tool_router: ToolRouter<Self>,
}

impl BriefmatchMcpServer {
    pub fn new(service: RankService) -> Self {
        Self {
            service: Arc::new(service),
            tool_router: Self::tool_router(),
        }
    }
}

#[tool_router(router = tool_router)]
impl BriefmatchMcpServer {
    /// Rank portfolios against a brief or pre-extracted factors.
    #[tool(
        name = "briefmatch_rank",
        description = "Rank ad-production portfolios for a creative brief. Pass `brief` to extract factors first, or pass desc/what/how/style directly. Returns per-factor scores and the most frequent studios among the candidates."
    )]
    pub async fn briefmatch_rank(
        &self,
        params: Parameters<RankParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let params = params.0;
        let service = Arc::clone(&self.service);
        let diversity = params.diversity.unwrap_or(false);

        let outcome = tokio::task::spawn_blocking(move || {
            let limit = params.limit.as_ref();
            match params.brief.as_deref().map(str::trim) {
                Some(brief) if !brief.is_empty() => {
                    service.rank_brief(brief, limit, diversity)
                }
                _ => service.rank_factors(params.factors(), limit, diversity),
            }
        })
        .await
        .map_err(|e| mcp_error("rank task failed", e))?;

        let response = match outcome {
            Ok(response) => response,
            Err(e @ Error::QuotaExceeded { .. }) => return Ok(quota_result(&e)),
            Err(e) => return Err(mcp_error("rank failed", e)),
        };

        info!(
            results = response.results.len(),
            candidates = response.candidate_size,
            "rank tool call"
        );
        let summary = format_rank_summary(&response);
        let structured = serde_json::to_value(&response)
            .map_err(|e| mcp_error("failed to serialize rank results", e))?;

        let mut result = CallToolResult::success(vec![Content::text(summary)]);
        result.structured_content = Some(structured);
        Ok(result)
    }
}

#[tool_handler(router = self.tool_router)]
impl ServerHandler for BriefmatchMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo::new(ServerCapabilities::builder().enable_tools().build())
            .with_server_info(
                Implementation::new("briefmatch", env!("CARGO_PKG_VERSION"))
                    .with_title("briefmatch MCP"),
            )
            .with_instructions(
                "Use briefmatch_rank to find portfolios matching a creative brief. Set diversity to avoid near-duplicate results.",
            )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RankParams {
    /// Free-text brief. When present, factors are extracted from it.
    pub brief: Option<String>,
    /// One-sentence summary of the ad.
    pub desc: Option<String>,
    /// What is advertised.
    pub what: Option<String>,
    /// Medium or format.
    pub how: Option<String>,
    /// Tone or style.
    pub style: Option<String>,
    /// Number of results. Invalid values fall back to the default.
    pub limit: Option<Value>,
    /// Diversify results with MMR (default: false).
    pub diversity: Option<bool>,
}

impl RankParams {
    fn factors(&self) -> ExtractedFactors {
        ExtractedFactors {
            desc: self.desc.clone().unwrap_or_default(),
            what: self.what.clone().unwrap_or_default(),
            how: self.how.clone().unwrap_or_default(),
            style: self.style.clone().unwrap_or_default(),
        }
    }
}

fn format_rank_summary(response: &RankResponse) -> String {
    if response.results.is_empty() {
        return "No matching portfolios".to_string();
    }

    let mut lines = Vec::with_capacity(response.results.len() + 2);
    let suffix = if response.results.len() == 1 { "" } else { "s" };
    lines.push(format!(
        "Found {} portfolio{} from {} candidates:",
        response.results.len(),
        suffix,
        response.candidate_size
    ));
    for r in &response.results {
        lines.push(format!("#{} {:.3} {}", r.id, r.final_score, r.name));
    }
    if !response.top_studios.is_empty() {
        let studios: Vec<String> = response
            .top_studios
            .iter()
            .map(|s| format!("{} ({})", s.name, s.count))
            .collect();
        lines.push(format!("Top studios: {}", studios.join(", ")));
    }

    lines.join("\n")
}

fn quota_result(error: &Error) -> CallToolResult {
    let mut result = CallToolResult::success(vec![Content::text(error.to_string())]);
    result.structured_content = Some(json!({
        "error": "quota_exceeded",
        "message": error.to_string(),
    }));
    result.is_error = Some(true);
    result
}

fn mcp_error(message: &str, error: impl std::fmt::Display) -> rmcp::ErrorData {
    rmcp::ErrorData::internal_error(
        message.to_string(),
        Some(json!({ "error": error.to_string() })),
    )
}

pub fn run_mcp(service: RankService) -> error::Result<()> {
    let server = BriefmatchMcpServer::new(service);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| {
            Error::Config(format!("failed to start tokio runtime: {e}"))
        })?;

    runtime.block_on(async move {
        let transport = rmcp::transport::stdio();
        let running = server.serve(transport).await.map_err(|e| {
            Error::Config(format!("MCP server initialization failed: {e}"))
        })?;
        running
            .waiting()
            .await
            .map_err(|e| Error::Config(format!("MCP server error: {e}")))?;
        Ok(())
    })
}
