use std::path::PathBuf;
use std::sync::Arc;

use rmcp::{
    handler::server::tool::ToolRouter, handler::server::wrapper::Parameters,
    model::*, tool, tool_handler, tool_router,
    transport::stdio, ErrorData as McpError, ServerHandler, ServiceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

mod apis;
mod cache;
mod config;
mod extract;
mod failure;
mod fulltext;
mod resolver;
mod search;
mod transport;

use apis::YearFilter;
use cache::{JsonFileStore, Scope};
use config::Config;
use fulltext::{FullTextService, PaperReference, RetrievalError};
use search::SourceSet;

// ── Parameter structs ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct SearchPapersParams {
    #[schemars(description = "Search query string")]
    query: String,
    #[schemars(description = "Year range: \"2019-2023\", \"2019-\", \"-2023\" or \"all\" (default)")]
    year_filter: Option<String>,
    #[schemars(description = "Maximum results to return (default: all merged results)")]
    max_results: Option<u32>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct GetFullTextParams {
    #[schemars(description = "Paper ID as returned by search_papers (ss_..., arxiv_..., gs_..., ieee_...) or a DOI")]
    paper_id: String,
    #[schemars(description = "Landing page or DOI link of the paper")]
    link: Option<String>,
    #[schemars(description = "Direct document link, if known")]
    pdf_url: Option<String>,
    #[schemars(description = "Requesting user; omit for the shared public cache")]
    user_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ExtractUploadParams {
    #[schemars(description = "Paper ID the uploaded document belongs to")]
    paper_id: String,
    #[schemars(description = "Absolute path of the uploaded PDF (max 50 MiB)")]
    path: String,
    #[schemars(description = "Requesting user; omit for the shared public cache")]
    user_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ResetExtractionParams {
    #[schemars(description = "Paper ID whose extraction record should be cleared")]
    paper_id: String,
    #[schemars(description = "Requesting user; omit for the public record")]
    user_id: Option<String>,
}

#[derive(Serialize)]
struct FullTextReply<'a> {
    paper_id: &'a str,
    text_length: usize,
    used_direct_document: bool,
    text: &'a str,
}

#[derive(Serialize)]
struct FailureReply<'a> {
    paper_id: &'a str,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    class: Option<failure::ErrorClass>,
}

// ── Server ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct PaperHarvestServer {
    tool_router: ToolRouter<Self>,
    config: Arc<Config>,
    sources: SourceSet,
    fulltext: Arc<FullTextService>,
}

fn to_json<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| McpError::internal_error(format!("Serialization error: {}", e), None))?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

fn failure_reply(paper_id: &str, error: &RetrievalError) -> Result<CallToolResult, McpError> {
    let reply = FailureReply {
        paper_id,
        error: format!("Could not retrieve this paper: {}", error),
        class: error.class(),
    };
    let json = serde_json::to_string_pretty(&reply)
        .map_err(|e| McpError::internal_error(format!("Serialization error: {}", e), None))?;
    Ok(CallToolResult::error(vec![Content::text(json)]))
}

#[tool_router]
impl PaperHarvestServer {
    pub fn create() -> anyhow::Result<Self> {
        let config = Config::from_env();
        std::fs::create_dir_all(&config.data_dir)?;

        let transport = config.build_transport()?;
        let (sources, semantic_scholar) = config.build_sources(&transport);
        let resolver = config.build_resolver(&transport, semantic_scholar);
        let store = Arc::new(JsonFileStore::open(config.store_path()));
        let fulltext = FullTextService::new(resolver, store, config.fulltext_config());

        tracing::info!(
            "Initialized {} paper sources, data_dir={}",
            sources.len(),
            config.data_dir.display()
        );

        Ok(Self {
            tool_router: Self::tool_router(),
            config: Arc::new(config),
            sources,
            fulltext,
        })
    }

    #[tool(description = "List paper sources, whether they are enabled, and their rate-limit and circuit-breaker state")]
    async fn list_sources(&self) -> Result<CallToolResult, McpError> {
        let statuses = self.config.source_status(&self.sources);
        to_json(&serde_json::json!({
            "sources": statuses,
            "extraction": self.fulltext.stats(),
        }))
    }

    #[tool(description = "Search papers across all enabled sources. Returns deduplicated results.")]
    async fn search_papers(
        &self,
        Parameters(params): Parameters<SearchPapersParams>,
    ) -> Result<CallToolResult, McpError> {
        let years = YearFilter::parse(params.year_filter.as_deref().unwrap_or("all"));
        let mut results = search::search_all_sources(&self.sources, &params.query, &years).await;
        if let Some(max) = params.max_results {
            results.truncate(max as usize);
        }
        to_json(&results)
    }

    #[tool(description = "Resolve a paper to its full-text document and return the extracted text. Results are cached per user (or publicly).")]
    async fn get_full_text(
        &self,
        Parameters(params): Parameters<GetFullTextParams>,
    ) -> Result<CallToolResult, McpError> {
        let scope = Scope::from_user(params.user_id.as_deref());
        let reference = PaperReference {
            paper_id: params.paper_id.clone(),
            link: params.link,
            pdf_url: params.pdf_url,
        };
        match self.fulltext.resolve_and_extract(&reference, &scope).await {
            Ok(full) => to_json(&FullTextReply {
                paper_id: &params.paper_id,
                text_length: full.text.len(),
                used_direct_document: full.used_direct_document,
                text: &full.text,
            }),
            Err(e) => failure_reply(&params.paper_id, &e),
        }
    }

    #[tool(description = "Extract text from a PDF already on disk and store it as the paper's full text")]
    async fn extract_uploaded_pdf(
        &self,
        Parameters(params): Parameters<ExtractUploadParams>,
    ) -> Result<CallToolResult, McpError> {
        let scope = Scope::from_user(params.user_id.as_deref());
        let path = PathBuf::from(&params.path);
        match self.fulltext.extract_uploaded_pdf(&params.paper_id, &path, &scope).await {
            Ok(full) => to_json(&FullTextReply {
                paper_id: &params.paper_id,
                text_length: full.text.len(),
                used_direct_document: full.used_direct_document,
                text: &full.text,
            }),
            Err(e) => failure_reply(&params.paper_id, &e),
        }
    }

    #[tool(description = "Clear a paper's extraction record so that it is retried, e.g. after repeated failures")]
    async fn reset_extraction(
        &self,
        Parameters(params): Parameters<ResetExtractionParams>,
    ) -> Result<CallToolResult, McpError> {
        let scope = Scope::from_user(params.user_id.as_deref());
        let cleared = self
            .fulltext
            .reset_extraction(&params.paper_id, &scope)
            .await
            .map_err(|e| McpError::internal_error(format!("Reset failed: {}", e), None))?;
        let message = if cleared {
            format!("Cleared extraction record for {} ({})", params.paper_id, scope)
        } else {
            format!("No extraction record for {} ({})", params.paper_id, scope)
        };
        Ok(CallToolResult::success(vec![Content::text(message)]))
    }

    #[tool(description = "Close every source circuit breaker and clear request counters")]
    async fn reset_limiters(&self) -> Result<CallToolResult, McpError> {
        self.sources.reset_all();
        tracing::info!("Reset limiters for {} sources", self.sources.len());
        Ok(CallToolResult::success(vec![Content::text(format!(
            "Reset {} source limiters",
            self.sources.len()
        ))]))
    }

    #[tool(description = "Remove expired public extraction records and the uploaded files they reference")]
    async fn purge_expired(&self) -> Result<CallToolResult, McpError> {
        let purged = self
            .fulltext
            .purge_expired()
            .await
            .map_err(|e| McpError::internal_error(format!("Purge failed: {}", e), None))?;
        Ok(CallToolResult::success(vec![Content::text(format!(
            "Purged {} expired records",
            purged
        ))]))
    }
}

#[tool_handler]
impl ServerHandler for PaperHarvestServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Search academic papers across Semantic Scholar, arXiv, Google Scholar \
                 and IEEE Xplore, then retrieve full text by resolving links, DOIs and \
                 publisher landing pages down to the PDF."
                    .into(),
            ),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    tracing::info!("Starting paper-harvest MCP server");

    let server = PaperHarvestServer::create()?;
    let service = server.serve(stdio()).await?;
    service.waiting().await?;

    Ok(())
}
