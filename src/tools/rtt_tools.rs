//! RMCP 0.3.2 tool handler exposing the RTT session manager
//!
//! Every tool goes through the single shared [`RttSession`], so calls from a client are
//! serialized in arrival order. Failures carry an [`crate::error::ErrorReport`] as error data.

use rmcp::{
    handler::server::{router::tool::ToolRouter, tool::Parameters},
    model::*,
    service::RequestContext,
    tool, tool_handler, tool_router, ErrorData as McpError, RoleServer, ServerHandler,
};
use serde::Serialize;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::types::*;
use crate::config::Config;
use crate::error::{Operation, TracedError};
use crate::rtt::{control_block_address_from_elf, RttSession, SessionOptions, StartOptions, Status};
use crate::transport::Backend;
use crate::utils::parse_address;

/// MCP tool handler for RTT communication
#[derive(Clone)]
pub struct RttToolHandler {
    #[allow(dead_code)]
    tool_router: ToolRouter<RttToolHandler>,
    session: Arc<RttSession<Backend>>,
    max_read_size: usize,
}

impl RttToolHandler {
    pub fn new(config: &Config) -> Self {
        let session = RttSession::new(Backend::from_config(config), SessionOptions::from(&config.rtt));
        Self::with_session(Arc::new(session), config.rtt.max_read_size)
    }

    pub fn with_session(session: Arc<RttSession<Backend>>, max_read_size: usize) -> Self {
        Self {
            tool_router: Self::tool_router(),
            session,
            max_read_size,
        }
    }

    pub fn session(&self) -> &Arc<RttSession<Backend>> {
        &self.session
    }

    /// Stop the session if one is still open
    pub async fn shutdown(&self) {
        if self.session.status().await == Status::Stopped {
            return;
        }
        match self.session.stop().await {
            Ok(()) => info!("RTT session closed on shutdown"),
            Err(e) => warn!("Failed to close RTT session on shutdown: {}", e),
        }
    }

    /// Wrap a session error with the trace of the failed operation
    fn failure(operation: Operation, failure: TracedError) -> McpError {
        let report = failure.report(operation);
        error!("RTT {} failed: {}", operation, failure.error);
        McpError::internal_error(failure.error.to_string(), serde_json::to_value(&report).ok())
    }
}

fn json_result<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| McpError::internal_error(format!("Failed to serialize response: {}", e), None))?;
    Ok(CallToolResult::success(vec![Content::text(text)]))
}

#[tool_router]
impl RttToolHandler {
    #[tool(description = "List connected debug probes and their serial numbers")]
    async fn list_probes(&self, Parameters(_args): Parameters<ListProbesArgs>) -> Result<CallToolResult, McpError> {
        debug!("Listing available debug probes");
        let probes = self.session.transport().list_probes();
        info!("Listed {} debug probes", probes.len());
        json_result(&probes)
    }

    #[tool(description = "Connect to the probe with the given serial number, reset the target, locate the RTT control block and list its channels")]
    async fn rtt_start(&self, Parameters(args): Parameters<RttStartArgs>) -> Result<CallToolResult, McpError> {
        debug!("Starting RTT on probe {}", args.serial_number);

        let control_block_location = match (&args.control_block_location, &args.elf_path) {
            (Some(_), Some(_)) => {
                return Err(McpError::invalid_params(
                    "Give either control_block_location or elf_path, not both".to_string(),
                    None,
                ));
            }
            (Some(location), None) => Some(
                parse_address(location).map_err(|e| McpError::invalid_params(e, None))?,
            ),
            (None, Some(elf_path)) => Some(
                control_block_address_from_elf(Path::new(elf_path))
                    .map_err(|e| McpError::invalid_params(e.to_string(), None))?,
            ),
            (None, None) => None,
        };

        let options = StartOptions { control_block_location };
        match self.session.start_traced(args.serial_number, options).await {
            Ok(channels) => json_result(&channels),
            Err(e) => Err(Self::failure(Operation::Start, e)),
        }
    }

    #[tool(description = "Close the active RTT session and release the probe")]
    async fn rtt_stop(&self, Parameters(_args): Parameters<RttStopArgs>) -> Result<CallToolResult, McpError> {
        match self.session.stop_traced().await {
            Ok(()) => Ok(CallToolResult::success(vec![Content::text("RTT session stopped")])),
            Err(e) => Err(Self::failure(Operation::Stop, e)),
        }
    }

    #[tool(description = "Read buffered data from an RTT up channel (target to host). Returns immediately; empty when nothing is buffered")]
    async fn rtt_read(&self, Parameters(args): Parameters<RttReadArgs>) -> Result<CallToolResult, McpError> {
        if args.length > self.max_read_size {
            return Err(McpError::invalid_params(
                format!("length {} exceeds the limit of {} bytes", args.length, self.max_read_size),
                None,
            ));
        }

        match self.session.read_traced(args.channel_index, args.length).await {
            Ok(result) => json_result(&ReadResponse::new(args.channel_index, &result)),
            Err(e) => Err(Self::failure(Operation::Read, e)),
        }
    }

    #[tool(description = "Write data to an RTT down channel (host to target). Reports how many bytes the target buffer accepted")]
    async fn rtt_write(&self, Parameters(args): Parameters<RttWriteArgs>) -> Result<CallToolResult, McpError> {
        let data = decode_write_data(&args.data, &args.encoding)
            .map_err(|e| McpError::invalid_params(e, None))?;
        let bytes_requested = data.len();

        match self.session.write_traced(args.channel_index, data).await {
            Ok(result) => {
                if result.bytes_written < bytes_requested {
                    warn!(
                        "Down channel {} accepted {} of {} bytes",
                        args.channel_index, result.bytes_written, bytes_requested
                    );
                }
                json_result(&WriteResponse {
                    channel_index: args.channel_index,
                    bytes_requested,
                    bytes_written: result.bytes_written,
                    elapsed_us: result.elapsed_us,
                })
            }
            Err(e) => Err(Self::failure(Operation::Write, e)),
        }
    }

    #[tool(description = "List the RTT channels of the active session")]
    async fn rtt_channels(&self, Parameters(_args): Parameters<RttChannelsArgs>) -> Result<CallToolResult, McpError> {
        match self.session.channels().await {
            Ok(channels) => json_result(&channels),
            Err(e) => Err(Self::failure(Operation::EnumerateChannels, e.into())),
        }
    }

    #[tool(description = "Show whether an RTT session is open, on which probe, and since when")]
    async fn rtt_status(&self, Parameters(_args): Parameters<RttStatusArgs>) -> Result<CallToolResult, McpError> {
        json_result(&self.session.info().await)
    }
}

#[tool_handler]
impl ServerHandler for RttToolHandler {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some("RTT (Real-Time Transfer) MCP server. Talks to firmware through SEGGER RTT buffers via a debug probe. Start with list_probes, open a session with rtt_start, exchange data with rtt_read and rtt_write, and close it with rtt_stop. Only one session can be open at a time; calls are executed in the order they arrive. Tools: list_probes, rtt_start, rtt_stop, rtt_read, rtt_write, rtt_channels, rtt_status.".to_string()),
        }
    }

    async fn initialize(
        &self,
        _request: InitializeRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<InitializeResult, McpError> {
        info!("RTT MCP server initialized");
        Ok(self.get_info())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtt::SessionSlot;
    use crate::transport::simulated::{SimulatedProbe, SimulatedTarget, DEMO_SERIAL};

    fn handler() -> RttToolHandler {
        let session = RttSession::with_slot(
            Backend::Simulated(SimulatedProbe::demo()),
            SessionOptions::default(),
            SessionSlot::new(),
        );
        RttToolHandler::with_session(Arc::new(session), 64)
    }

    fn text(result: &CallToolResult) -> String {
        result
            .content
            .iter()
            .filter_map(|c| c.as_text().map(|t| t.text.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_list_probes_shows_simulated_serial() {
        let result = handler().list_probes(Parameters(ListProbesArgs {})).await.unwrap();
        assert!(text(&result).contains(&DEMO_SERIAL.to_string()));
    }

    #[tokio::test]
    async fn test_read_before_start_reports_not_initialized() {
        let handler = handler();
        let err = handler
            .rtt_read(Parameters(RttReadArgs { channel_index: 0, length: 16 }))
            .await
            .unwrap_err();
        let data = err.data.unwrap();
        assert_eq!(data["errno"], 11);
        assert_eq!(data["errcode"], "RTTNotInitialized");
        assert_eq!(data["erroroperation"], "read");
    }

    #[tokio::test]
    async fn test_start_write_read_stop() {
        let handler = handler();
        let started = handler
            .rtt_start(Parameters(RttStartArgs {
                serial_number: DEMO_SERIAL,
                control_block_location: None,
                elf_path: None,
            }))
            .await
            .unwrap();
        assert!(text(&started).contains("Terminal"));

        handler
            .rtt_write(Parameters(RttWriteArgs {
                channel_index: 0,
                data: "6869".to_string(),
                encoding: "hex".to_string(),
            }))
            .await
            .unwrap();

        let read = handler
            .rtt_read(Parameters(RttReadArgs { channel_index: 0, length: 64 }))
            .await
            .unwrap();
        // The greeting comes first, then the echo
        assert!(text(&read).contains("RTT loopback ready\\nhi"));
        let payload: serde_json::Value = serde_json::from_str(&text(&read)).unwrap();
        assert_eq!(payload["raw"], serde_json::json!(b"RTT loopback ready\nhi".to_vec()));
        assert_eq!(payload["length"], 21);

        handler.rtt_stop(Parameters(RttStopArgs {})).await.unwrap();
        assert_eq!(handler.session().status().await, Status::Stopped);
    }

    #[tokio::test]
    async fn test_failed_start_reports_its_discovery_trace() {
        let options = SessionOptions {
            control_block_timeout: std::time::Duration::from_millis(100),
            poll_interval: std::time::Duration::from_millis(10),
            queue_timeout: None,
        };
        let probe = SimulatedProbe::new().with_target(DEMO_SERIAL, SimulatedTarget::without_rtt());
        let session = RttSession::with_slot(Backend::Simulated(probe), options, SessionSlot::new());
        let handler = RttToolHandler::with_session(Arc::new(session), 64);

        let starting = {
            let handler = handler.clone();
            tokio::spawn(async move {
                handler
                    .rtt_start(Parameters(RttStartArgs {
                        serial_number: DEMO_SERIAL,
                        control_block_location: None,
                        elf_path: None,
                    }))
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let queued = handler
            .rtt_read(Parameters(RttReadArgs { channel_index: 0, length: 8 }))
            .await
            .unwrap_err();

        let data = starting.await.unwrap().unwrap_err().data.unwrap();
        assert_eq!(data["errcode"], "RTTCouldNotFindControlBlock");
        let log = data["log"].as_str().unwrap();
        assert!(log.contains("Scanning RAM for control block"));
        assert!(log.contains("No control block after"));

        let queued_log = queued.data.unwrap()["log"].as_str().unwrap().to_string();
        assert!(!queued_log.contains("Scanning RAM"));
    }

    #[tokio::test]
    async fn test_oversized_read_is_rejected_before_the_session() {
        let err = handler()
            .rtt_read(Parameters(RttReadArgs { channel_index: 0, length: 65 }))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_start_rejects_both_location_sources() {
        let err = handler()
            .rtt_start(Parameters(RttStartArgs {
                serial_number: DEMO_SERIAL,
                control_block_location: Some("0x20001000".to_string()),
                elf_path: Some("firmware.elf".to_string()),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::INVALID_PARAMS);
    }
}
