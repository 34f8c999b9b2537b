//! MCP server implementation using rmcp.
//!
//! Exposes the tiered sandbox as two MCP tools: `execute` runs code on the
//! strongest usable tier and `capabilities` reports which tiers this host
//! offers. Results are returned as JSON text.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::transport::stdio;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt};
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::{error, info};

use crate::limits::ResourceLimitSet;
use crate::selector::FallbackSelector;
use crate::types::{BackendKind, CodeExecutionRequest, CodeExecutionResult, ExecutionStatus, InterpreterKind};

const MB: u64 = 1024 * 1024;

/// MCP server for tiered sandboxed execution.
#[derive(Clone)]
pub struct SandboxServer {
    selector: Arc<FallbackSelector>,
    tool_router: ToolRouter<Self>,
}

/// Parameters for the execute tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteParams {
    /// Language of the code: "python" or "shell".
    #[schemars(description = "Language of the code: 'python' or 'shell'")]
    pub language: String,

    /// The code to execute.
    #[schemars(description = "The code to execute")]
    pub code: String,

    /// Files to place in the working directory, keyed by relative path.
    #[schemars(description = "Files to place in the working directory, keyed by relative path")]
    #[serde(default)]
    pub files: BTreeMap<String, String>,

    /// Text written to the program's standard input.
    #[schemars(description = "Text written to the program's standard input")]
    #[serde(default)]
    pub stdin: Option<String>,

    /// Wall-clock timeout in seconds.
    #[schemars(description = "Wall-clock timeout in seconds")]
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    /// CPU time ceiling in seconds.
    #[schemars(description = "CPU time ceiling in seconds")]
    #[serde(default)]
    pub cpu_seconds: Option<u64>,

    /// Memory ceiling in megabytes.
    #[schemars(description = "Memory ceiling in megabytes")]
    #[serde(default)]
    pub memory_mb: Option<u64>,

    /// Ceiling on bytes written to any one file, in megabytes.
    #[schemars(description = "Ceiling on the size of any written file, in megabytes")]
    #[serde(default)]
    pub disk_mb: Option<u64>,
}

impl ExecuteParams {
    fn into_request(self) -> Result<CodeExecutionRequest, McpError> {
        let interpreter = parse_language(&self.language).ok_or_else(|| {
            McpError::invalid_params(
                format!(
                    "Unknown language: '{}'. Available: [\"python\", \"shell\"]",
                    self.language
                ),
                None,
            )
        })?;

        let mut request = CodeExecutionRequest::new(interpreter, self.code).with_limits(ResourceLimitSet {
            cpu_seconds: self.cpu_seconds,
            memory_bytes: self.memory_mb.map(|mb| mb * MB),
            disk_bytes: self.disk_mb.map(|mb| mb * MB),
            wall_timeout: self.timeout_seconds.map(Duration::from_secs),
        });
        for (path, contents) in self.files {
            request = request.with_file(path, contents);
        }
        if let Some(stdin) = self.stdin {
            request = request.with_stdin(stdin);
        }
        Ok(request)
    }
}

fn parse_language(language: &str) -> Option<InterpreterKind> {
    match language.to_ascii_lowercase().as_str() {
        "python" | "python3" | "py" => Some(InterpreterKind::Python),
        "shell" | "sh" | "bash" => Some(InterpreterKind::Shell),
        _ => None,
    }
}

/// JSON body for a result, and whether it counts as a tool error.
pub fn format_result(result: &CodeExecutionResult) -> (String, bool) {
    let is_error = result.status != ExecutionStatus::Exited { code: 0 };
    let body = serde_json::to_string_pretty(result)
        .unwrap_or_else(|e| format!("{{\"error\": \"failed to serialize result: {e}\"}}"));
    (body, is_error)
}

#[tool_router]
impl SandboxServer {
    /// Create a new sandbox server.
    pub fn new(selector: Arc<FallbackSelector>) -> Self {
        Self {
            selector,
            tool_router: Self::tool_router(),
        }
    }

    /// Execute code on the strongest available isolation tier.
    #[tool(description = "Execute Python or shell code in the strongest available sandbox")]
    async fn execute(
        &self,
        Parameters(params): Parameters<ExecuteParams>,
    ) -> Result<CallToolResult, McpError> {
        let request = params.into_request()?;
        info!(
            interpreter = %request.interpreter,
            code_len = request.code.len(),
            files = request.files.len(),
            "Executing code"
        );

        let result = self.selector.execute(request).await;
        if result.backend == Some(BackendKind::Unrestricted) {
            error!(execution_id = %result.execution_id, "Code ran without isolation");
        }

        let (body, is_error) = format_result(&result);
        if is_error {
            Ok(CallToolResult::error(vec![Content::text(body)]))
        } else {
            Ok(CallToolResult::success(vec![Content::text(body)]))
        }
    }

    /// Report which isolation tiers are usable on this host.
    #[tool(description = "List isolation tiers, strongest first, with availability")]
    async fn capabilities(&self) -> Result<CallToolResult, McpError> {
        let capabilities = self.selector.capabilities().await;
        let body = serde_json::to_string_pretty(&*capabilities)
            .map_err(|e| McpError::internal_error(format!("failed to serialize: {e}"), None))?;
        Ok(CallToolResult::success(vec![Content::text(body)]))
    }
}

#[tool_handler]
impl ServerHandler for SandboxServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "tiered-sandbox".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Execute untrusted code with the strongest isolation this host offers.\n\
                 Tiers, strongest first: container, namespace_sandbox, \
                 restricted_interpreter (Python only), unrestricted.\n\
                 \n\
                 Use the 'execute' tool with:\n\
                 - language: 'python' or 'shell'\n\
                 - code: the code to run\n\
                 - optional files, stdin, timeout_seconds, cpu_seconds, memory_mb, disk_mb\n\
                 \n\
                 The result reports which tier ran the code. Treat 'unrestricted' \
                 as no isolation at all."
                    .into(),
            ),
        }
    }
}

/// Serve the sandbox server over stdio.
pub async fn serve_stdio(selector: Arc<FallbackSelector>) -> anyhow::Result<()> {
    let server = SandboxServer::new(selector);

    info!("Starting MCP server on stdio");

    let service = server
        .serve(stdio())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start MCP server: {e}"))?;

    service
        .waiting()
        .await
        .map_err(|e| anyhow::anyhow!("MCP server error: {e}"))?;

    Ok(())
}
