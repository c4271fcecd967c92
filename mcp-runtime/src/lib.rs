//! MCP runtime for the IoT cloud OpenAPI.
//!
//! Speaks JSON-RPC 2.0 over stdio with `Content-Length` framing and exposes
//! the vendor's product/device/telemetry surface as `iot_*` tools. Listing
//! tools page through large collections with opaque cursors (see [`cursor`]
//! and [`pager`]); everything else is a thin authenticated proxy around one
//! vendor endpoint.

use clap::{Args, Subcommand};
use reqwest::Method;
use serde_json::{Map, Value, json};
use tokio::io::{self, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

pub mod cursor;
pub mod format;
pub mod pager;
mod util;

use pager::{DEFAULT_PAGE_SIZE, FetchedPage, PageError, PageFetch};
use util::TokenProvider;

const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
const MCP_SERVER_NAME: &str = "iotcloud-mcp";

/// Hard ceiling on caller-requested page sizes; vendor list endpoints slow
/// down sharply past this.
const MAX_PAGE_SIZE: u64 = 200;

const PRODUCTS_PATH: &str = "/v2/quecproductmgr/r3/openapi/products";
const DEVICES_PATH: &str = "/v2/devicemgr/r3/openapi/product/device/overview";
const DEVICE_DETAIL_PATH: &str = "/v2/devicemgr/r3/openapi/device/detail";
const THING_MODEL_PATH: &str = "/v2/quectsl/openapi/product/export/tslFile";
const DEVICE_LOCATION_PATH: &str = "/v2/deviceshadow/r1/openapi/device/getlocation";
const DEVICE_RESOURCE_PATH: &str = "/v2/deviceshadow/r2/openapi/device/resource";
const POWER_SWITCH_PATH: &str = "/v2/deviceshadow/r3/openapi/dm/writeData";
const DATA_HISTORY_PATH: &str = "/v2/quecdatastorage/r1/openapi/device/data/history";
const EVENT_HISTORY_PATH: &str = "/v2/quecdatastorage/r1/openapi/device/eventdata/history";

/// Shadow data moved between API revisions; these are probed in order and
/// the first endpoint that answers with data wins.
const SHADOW_PROBE_PATHS: [&str; 4] = [
    "/v2/deviceshadow/r3/openapi/device/property",
    "/v2/deviceshadow/r3/openapi/device/shadow",
    "/v2/devicedata/r3/openapi/property/get",
    "/v2/deviceshadow/r1/openapi/device/property",
];

#[derive(Subcommand)]
pub enum McpCommands {
    /// Run the MCP server over stdio
    Serve(McpServeArgs),
    /// Probe credentials and vendor API reachability, print a readiness report
    Diagnose(McpDiagnoseArgs),
}

#[derive(Args, Clone, Debug)]
pub struct McpServeArgs {
    /// Explicit access token override (skips the accessKey login exchange)
    #[arg(long, env = "IOTCLOUD_TOKEN")]
    pub token: Option<String>,
    /// Page size used when a paginated tool is called without a cursor
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    pub default_page_size: u64,
}

#[derive(Args, Clone, Debug)]
pub struct McpDiagnoseArgs {
    /// Explicit access token override (skips the accessKey login exchange)
    #[arg(long, env = "IOTCLOUD_TOKEN")]
    pub token: Option<String>,
}

pub async fn run(
    base_url: &str,
    access_key: &str,
    access_secret: &str,
    command: McpCommands,
) -> i32 {
    match command {
        McpCommands::Serve(args) => {
            let mut server = McpServer::new(McpRuntimeConfig {
                base_url: base_url.to_string(),
                access_key: access_key.to_string(),
                access_secret: access_secret.to_string(),
                explicit_token: args.token,
                default_page_size: args.default_page_size.clamp(1, MAX_PAGE_SIZE),
            });
            match server.serve_stdio().await {
                Ok(()) => 0,
                Err(err) => {
                    let payload = json!({
                        "error": "mcp_server_error",
                        "message": err,
                    });
                    eprintln!("{payload}");
                    1
                }
            }
        }
        McpCommands::Diagnose(args) => {
            let server = McpServer::new(McpRuntimeConfig {
                base_url: base_url.to_string(),
                access_key: access_key.to_string(),
                access_secret: access_secret.to_string(),
                explicit_token: args.token,
                default_page_size: DEFAULT_PAGE_SIZE,
            });
            let report = server.run_diagnostics().await;
            println!("{}", to_pretty_json(&report));
            if report
                .get("status")
                .and_then(Value::as_str)
                .is_some_and(|status| status == "ready")
            {
                0
            } else {
                2
            }
        }
    }
}

#[derive(Clone, Debug)]
struct McpRuntimeConfig {
    base_url: String,
    access_key: String,
    access_secret: String,
    explicit_token: Option<String>,
    default_page_size: u64,
}

struct McpServer {
    config: McpRuntimeConfig,
    http: reqwest::Client,
    token_provider: TokenProvider,
}

impl McpServer {
    fn new(config: McpRuntimeConfig) -> Self {
        let token_provider = TokenProvider::new(
            config.base_url.clone(),
            config.access_key.clone(),
            config.access_secret.clone(),
        );
        Self {
            config,
            http: util::client(),
            token_provider,
        }
    }

    async fn serve_stdio(&mut self) -> Result<(), String> {
        self.emit_startup_event();

        let stdin = io::stdin();
        let mut reader = BufReader::new(stdin);
        let mut stdout = io::stdout();

        loop {
            let incoming = read_framed_json(&mut reader)
                .await
                .map_err(|e| format!("Failed to read MCP message: {e}"))?;
            let Some(incoming) = incoming else {
                break;
            };

            let responses = self.handle_incoming_message(incoming).await;
            for response in responses {
                write_framed_json(&mut stdout, &response)
                    .await
                    .map_err(|e| format!("Failed to write MCP response: {e}"))?;
            }
        }

        Ok(())
    }

    // stdout is the protocol channel; runtime events go to stderr as
    // single-line JSON documents.
    fn emit_startup_event(&self) {
        let payload = json!({
            "event": "mcp_server_start",
            "server": MCP_SERVER_NAME,
            "version": env!("CARGO_PKG_VERSION"),
            "base_url": self.config.base_url,
            "auth": if self.config.explicit_token.is_some() { "explicit_token" } else { "access_key" },
            "default_page_size": self.config.default_page_size,
        });
        eprintln!("{payload}");
    }

    async fn handle_incoming_message(&self, incoming: Value) -> Vec<Value> {
        let mut responses = Vec::new();

        if let Some(batch) = incoming.as_array() {
            if batch.is_empty() {
                responses.push(error_response(
                    Value::Null,
                    RpcError::invalid_request("Batch request must not be empty"),
                ));
                return responses;
            }
            for item in batch {
                if let Some(response) = self.handle_single_message(item.clone()).await {
                    responses.push(response);
                }
            }
            return responses;
        }

        if let Some(response) = self.handle_single_message(incoming).await {
            responses.push(response);
        }
        responses
    }

    async fn handle_single_message(&self, incoming: Value) -> Option<Value> {
        let Some(obj) = incoming.as_object() else {
            return Some(error_response(
                Value::Null,
                RpcError::invalid_request("Request must be a JSON object"),
            ));
        };

        if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            let id = obj.get("id").cloned().unwrap_or(Value::Null);
            return Some(error_response(
                id,
                RpcError::invalid_request("jsonrpc must be '2.0'"),
            ));
        }

        let Some(method) = obj.get("method").and_then(Value::as_str) else {
            // Most likely a client response; this server issues no outbound requests.
            return None;
        };

        let params = obj.get("params").cloned().unwrap_or(Value::Null);
        if let Some(id) = obj.get("id").cloned() {
            let result = self.handle_request(method, params).await;
            Some(match result {
                Ok(payload) => success_response(id, payload),
                Err(err) => error_response(id, err),
            })
        } else {
            self.handle_notification(method, params).await;
            None
        }
    }

    async fn handle_notification(&self, method: &str, _params: Value) {
        if matches!(
            method,
            "notifications/initialized" | "notifications/cancelled"
        ) {
            return;
        }
        // Unknown notifications are intentionally ignored.
    }

    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "initialize" => Ok(self.initialize_payload()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.tools_list_payload()),
            "tools/call" => self.handle_tools_call(params).await,
            "resources/list" => Ok(json!({ "resources": [] })),
            "prompts/list" => Ok(json!({ "prompts": [] })),
            _ => Err(RpcError::method_not_found(method)),
        }
    }

    fn initialize_payload(&self) -> Value {
        let instructions = format!(
            "Tools proxy the IoT cloud OpenAPI (products, devices, shadow data, location, telemetry history, power control). \
             Listing tools (iot_products_list, iot_devices_list) are cursor-paginated: when a response carries data.next_cursor, \
             pass it back unchanged as 'cursor' to fetch the next page; absence of next_cursor means end of data. \
             A cursor is bound to the collection it was minted for — a device-list cursor only replays against the same product_key, \
             and page size is fixed for the lifetime of a cursor sequence (default {}). \
             On invalid_cursor, restart the listing without a cursor.",
            self.config.default_page_size
        );
        json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {
                "tools": {
                    "listChanged": false
                },
                "resources": {
                    "listChanged": false
                },
                "prompts": {
                    "listChanged": false
                }
            },
            "serverInfo": {
                "name": MCP_SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION")
            },
            "instructions": instructions
        })
    }

    fn tools_list_payload(&self) -> Value {
        let tools: Vec<Value> = tool_definitions()
            .into_iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "inputSchema": tool.input_schema,
                })
            })
            .collect();
        json!({ "tools": tools })
    }

    async fn handle_tools_call(&self, params: Value) -> Result<Value, RpcError> {
        let params = params
            .as_object()
            .ok_or_else(|| RpcError::invalid_params("tools/call params must be an object"))?;

        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("tools/call requires string field 'name'"))?;

        let args = match params.get("arguments") {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::Null) | None => Map::new(),
            Some(_) => {
                return Err(RpcError::invalid_params(
                    "tools/call 'arguments' must be an object",
                ));
            }
        };

        let result = self.execute_tool(name, &args).await;
        Ok(match result {
            Ok(payload) => {
                let envelope = json!({
                    "status": "ok",
                    "phase": "final",
                    "tool": name,
                    "data": payload
                });
                build_tool_call_response(envelope, false)
            }
            Err(err) => {
                let envelope = json!({
                    "status": "error",
                    "phase": "final",
                    "tool": name,
                    "error": err.to_value()
                });
                build_tool_call_response(envelope, true)
            }
        })
    }

    async fn execute_tool(
        &self,
        tool_name: &str,
        args: &Map<String, Value>,
    ) -> Result<Value, ToolError> {
        match tool_name {
            "iot_products_list" => self.tool_products_list(args).await,
            "iot_devices_list" => self.tool_devices_list(args).await,
            "iot_product_thing_model" => self.tool_product_thing_model(args).await,
            "iot_device_detail" => self.tool_device_detail(args).await,
            "iot_device_shadow" => self.tool_device_shadow(args).await,
            "iot_device_location" => self.tool_device_location(args).await,
            "iot_device_resources" => self.tool_device_resources(args).await,
            "iot_device_power_switch" => self.tool_device_power_switch(args).await,
            "iot_device_data_history" => self.tool_device_data_history(args).await,
            "iot_device_event_history" => self.tool_device_event_history(args).await,
            "iot_device_latest_online_time" => self.tool_device_latest_online_time(args).await,
            "iot_health_check" => self.tool_health_check(args).await,
            _ => Err(ToolError::new(
                "unknown_tool",
                format!("Unknown tool '{tool_name}'"),
            )),
        }
    }

    async fn tool_products_list(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let cursor_token = arg_optional_string(args, "cursor")?;
        let default_page_size = self.page_size_arg(args)?;
        let source = VendorPageSource {
            server: self,
            path: PRODUCTS_PATH,
            scope_param: None,
        };
        let page = pager::fetch_page_with_lookahead(
            &source,
            None,
            cursor_token.as_deref(),
            default_page_size,
        )
        .await
        .map_err(tool_error_from_page)?;

        let mut items = page.items;
        for item in &mut items {
            format::decorate_product(item);
        }
        Ok(paged_data(PRODUCTS_PATH, None, items, page.page_no, page.page_size, page.next_cursor))
    }

    async fn tool_devices_list(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let product_key = required_string(args, "product_key")?;
        let cursor_token = arg_optional_string(args, "cursor")?;
        let default_page_size = self.page_size_arg(args)?;
        let source = VendorPageSource {
            server: self,
            path: DEVICES_PATH,
            scope_param: Some("productKey"),
        };
        let page = pager::fetch_page_with_lookahead(
            &source,
            Some(&product_key),
            cursor_token.as_deref(),
            default_page_size,
        )
        .await
        .map_err(tool_error_from_page)?;

        let mut items = page.items;
        for item in &mut items {
            format::decorate_device(item);
        }
        Ok(paged_data(
            DEVICES_PATH,
            Some(&product_key),
            items,
            page.page_no,
            page.page_size,
            page.next_cursor,
        ))
    }

    async fn tool_product_thing_model(
        &self,
        args: &Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let product_id = arg_optional_u64(args, "product_id")?;
        let product_key = arg_optional_string(args, "product_key")?;
        let language = arg_string(args, "language", "CN")?;

        let mut query = vec![("language".to_string(), language)];
        // productId takes precedence, matching the vendor's documented behavior.
        match (product_id, product_key) {
            (Some(id), _) => query.push(("productId".to_string(), id.to_string())),
            (None, Some(key)) => query.push(("productKey".to_string(), key)),
            (None, None) => {
                return Err(ToolError::new(
                    "validation_failed",
                    "Either 'product_id' or 'product_key' must be provided",
                )
                .with_field("product_key"));
            }
        }

        let result = self
            .send_api_request(Method::GET, THING_MODEL_PATH, &query, None, true)
            .await?;
        let data = vendor_envelope_data(&result, THING_MODEL_PATH)?;
        Ok(json!({
            "request": { "path": THING_MODEL_PATH, "query": pairs_to_json_object(&query) },
            "thing_model": data
        }))
    }

    async fn tool_device_detail(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let product_key = required_string(args, "product_key")?;
        let device_key = required_string(args, "device_key")?;
        let query = vec![
            ("productKey".to_string(), product_key),
            ("deviceKey".to_string(), device_key),
        ];

        let result = self
            .send_api_request(Method::GET, DEVICE_DETAIL_PATH, &query, None, true)
            .await?;
        let mut detail = vendor_envelope_data(&result, DEVICE_DETAIL_PATH)?;
        format::decorate_device(&mut detail);
        Ok(json!({
            "request": { "path": DEVICE_DETAIL_PATH, "query": pairs_to_json_object(&query) },
            "device": detail
        }))
    }

    async fn tool_device_shadow(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let product_key = required_string(args, "product_key")?;
        let device_key = required_string(args, "device_key")?;
        let query = vec![
            ("productKey".to_string(), product_key),
            ("deviceKey".to_string(), device_key),
        ];

        for path in SHADOW_PROBE_PATHS {
            let Ok(result) = self
                .send_api_request(Method::GET, path, &query, None, true)
                .await
            else {
                continue;
            };
            if let Ok(data) = vendor_envelope_data(&result, path) {
                let empty = data.is_null()
                    || data.as_array().is_some_and(Vec::is_empty)
                    || data.as_object().is_some_and(Map::is_empty);
                if !empty {
                    return Ok(json!({
                        "request": { "path": path, "query": pairs_to_json_object(&query) },
                        "shadow": data
                    }));
                }
            }
        }

        Ok(json!({
            "request": { "query": pairs_to_json_object(&query) },
            "shadow": Value::Null,
            "message": "No shadow data available from any known endpoint revision",
            "probed_endpoints": SHADOW_PROBE_PATHS
        }))
    }

    async fn tool_device_location(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let device_id = arg_optional_u64(args, "device_id")?;
        let product_key = arg_optional_string(args, "product_key")?;
        let device_key = arg_optional_string(args, "device_key")?;
        let language = arg_string(args, "language", "CN")?;

        let mut query = vec![("language".to_string(), language)];
        match (device_id, product_key, device_key) {
            (Some(id), _, _) => query.push(("deviceId".to_string(), id.to_string())),
            (None, Some(pk), Some(dk)) => {
                query.push(("productKey".to_string(), pk));
                query.push(("deviceKey".to_string(), dk));
            }
            _ => {
                return Err(ToolError::new(
                    "validation_failed",
                    "Either 'device_id' or both 'product_key' and 'device_key' must be provided",
                )
                .with_field("device_key"));
            }
        }

        let result = self
            .send_api_request(Method::GET, DEVICE_LOCATION_PATH, &query, None, true)
            .await?;
        let mut location = vendor_envelope_data(&result, DEVICE_LOCATION_PATH)?;
        format::decorate_location(&mut location);
        Ok(json!({
            "request": { "path": DEVICE_LOCATION_PATH, "query": pairs_to_json_object(&query) },
            "location": location
        }))
    }

    async fn tool_device_resources(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let product_key = required_string(args, "product_key")?;
        let device_key = required_string(args, "device_key")?;
        let language = arg_string(args, "language", "CN")?;
        let query = vec![
            ("productKey".to_string(), product_key),
            ("deviceKey".to_string(), device_key),
            ("language".to_string(), language),
        ];

        let result = self
            .send_api_request(Method::GET, DEVICE_RESOURCE_PATH, &query, None, true)
            .await?;
        let data = vendor_envelope_data(&result, DEVICE_RESOURCE_PATH)?;
        Ok(json!({
            "request": { "path": DEVICE_RESOURCE_PATH, "query": pairs_to_json_object(&query) },
            "resources": data
        }))
    }

    async fn tool_device_power_switch(
        &self,
        args: &Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let product_key = required_string(args, "product_key")?;
        let device_key = required_string(args, "device_key")?;
        let state = required_string(args, "state")?;
        let switch_state = match state.to_ascii_lowercase().as_str() {
            "on" => "true",
            "off" => "false",
            _ => {
                return Err(ToolError::new(
                    "validation_failed",
                    "'state' must be 'on' or 'off'",
                )
                .with_field("state"));
            }
        };

        // The vendor expects the write payload as a JSON string, not nested JSON.
        let body = json!({
            "data": json!([{ "switch": switch_state }]).to_string(),
            "devices": [device_key],
            "productKey": product_key
        });

        let result = self
            .send_api_request(Method::POST, POWER_SWITCH_PATH, &[], Some(body), true)
            .await?;
        let data = vendor_envelope_data(&result, POWER_SWITCH_PATH)?;

        let device_code = data
            .get(0)
            .and_then(|entry| entry.get("code"))
            .and_then(Value::as_i64);
        if device_code != Some(200) {
            return Err(ToolError::new(
                "upstream_fetch_failed",
                "Device rejected the power switch command",
            )
            .with_details(json!({ "device_results": data })));
        }

        Ok(json!({
            "request": { "path": POWER_SWITCH_PATH },
            "result": "success",
            "state": state.to_ascii_lowercase(),
            "device_results": data
        }))
    }

    async fn tool_device_data_history(
        &self,
        args: &Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let mut query = self.history_base_query(args)?;
        if let Some(direction) = arg_optional_u64(args, "direction")? {
            query.push(("direction".to_string(), direction.to_string()));
        }
        if let Some(send_status) = arg_optional_i64(args, "send_status")? {
            query.push(("sendStatus".to_string(), send_status.to_string()));
        }

        let result = self
            .send_api_request(Method::GET, DATA_HISTORY_PATH, &query, None, true)
            .await?;
        let data = vendor_envelope_data(&result, DATA_HISTORY_PATH)?;
        let mut entries = data.as_array().cloned().unwrap_or_default();
        for entry in &mut entries {
            format::decorate_timestamps(entry, &["createTime", "sendTime", "updateTime"]);
            if let Some(object) = entry.as_object_mut() {
                let direction = object.get("direction").and_then(Value::as_i64);
                object.insert(
                    "directionLabel".to_string(),
                    Value::String(format::direction_label(direction)),
                );
                let send_status = object.get("sendStatus").and_then(Value::as_i64);
                object.insert(
                    "sendStatusLabel".to_string(),
                    Value::String(format::send_status_label(send_status)),
                );
            }
        }

        Ok(json!({
            "request": { "path": DATA_HISTORY_PATH, "query": pairs_to_json_object(&query) },
            "entries": entries,
            "pagination": vendor_page_meta(&result.body)
        }))
    }

    async fn tool_device_event_history(
        &self,
        args: &Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let mut query = self.history_base_query(args)?;
        if let Some(event_type) = arg_optional_string(args, "event_type")? {
            query.push(("eventType".to_string(), event_type));
        }

        let result = self
            .send_api_request(Method::GET, EVENT_HISTORY_PATH, &query, None, true)
            .await?;
        let data = vendor_envelope_data(&result, EVENT_HISTORY_PATH)?;
        let mut entries = data.as_array().cloned().unwrap_or_default();
        for entry in &mut entries {
            format::decorate_timestamps(entry, &["createTime"]);
            if let Some(object) = entry.as_object_mut() {
                let event_type = object
                    .get("eventType")
                    .and_then(Value::as_str)
                    .and_then(|raw| raw.parse::<i64>().ok())
                    .or_else(|| object.get("eventType").and_then(Value::as_i64));
                object.insert(
                    "eventTypeLabel".to_string(),
                    Value::String(format::event_type_label(event_type)),
                );
            }
        }

        Ok(json!({
            "request": { "path": EVENT_HISTORY_PATH, "query": pairs_to_json_object(&query) },
            "entries": entries,
            "pagination": vendor_page_meta(&result.body)
        }))
    }

    /// Query parameters shared by both history endpoints, which use the
    /// vendor's own `pageNum`/`pageSize` paging rather than cursors — their
    /// paging metadata is reliable, unlike the list endpoints'.
    fn history_base_query(
        &self,
        args: &Map<String, Value>,
    ) -> Result<Vec<(String, String)>, ToolError> {
        let product_key = required_string(args, "product_key")?;
        let device_key = required_string(args, "device_key")?;
        let language = arg_string(args, "language", "CN")?;
        let page_num = arg_optional_u64(args, "page_num")?.unwrap_or(1).max(1);
        let page_size = arg_optional_u64(args, "page_size")?
            .unwrap_or(10)
            .clamp(1, MAX_PAGE_SIZE);

        let mut query = vec![
            ("productKey".to_string(), product_key),
            ("deviceKey".to_string(), device_key),
            ("language".to_string(), language),
            ("pageNum".to_string(), page_num.to_string()),
            ("pageSize".to_string(), page_size.to_string()),
        ];
        if let Some(device_id) = arg_optional_u64(args, "device_id")? {
            query.push(("deviceId".to_string(), device_id.to_string()));
        }
        if let Some(begin) = arg_optional_i64(args, "begin_time_ms")? {
            query.push(("beginDateTimp".to_string(), begin.to_string()));
        }
        if let Some(end) = arg_optional_i64(args, "end_time_ms")? {
            query.push(("endDateTimp".to_string(), end.to_string()));
        }
        Ok(query)
    }

    async fn tool_device_latest_online_time(
        &self,
        args: &Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let product_key = required_string(args, "product_key")?;
        let device_key = required_string(args, "device_key")?;
        let query = vec![
            ("productKey".to_string(), product_key.clone()),
            ("deviceKey".to_string(), device_key.clone()),
        ];

        // Best-effort across two sources; either may be missing for a device.
        let detail = match self
            .send_api_request(Method::GET, DEVICE_DETAIL_PATH, &query, None, true)
            .await
        {
            Ok(result) => vendor_envelope_data(&result, DEVICE_DETAIL_PATH).ok(),
            Err(_) => None,
        };
        let location_query = {
            let mut q = query.clone();
            q.push(("language".to_string(), "CN".to_string()));
            q
        };
        let location = match self
            .send_api_request(Method::GET, DEVICE_LOCATION_PATH, &location_query, None, true)
            .await
        {
            Ok(result) => vendor_envelope_data(&result, DEVICE_LOCATION_PATH).ok(),
            Err(_) => None,
        };

        let mut candidates: Vec<(&str, i64)> = Vec::new();
        if let Some(detail) = &detail {
            if let Some(ms) = format::timestamp_ms(detail.get("updateTime")) {
                candidates.push(("device_update", ms));
            }
            if let Some(ms) = format::timestamp_ms(detail.get("lastConnTime")) {
                candidates.push(("last_connection", ms));
            }
        }
        if let Some(location) = &location {
            if let Some(ms) = format::timestamp_ms(location.get("locateTime")) {
                candidates.push(("location", ms));
            }
        }

        let latest = candidates.iter().max_by_key(|(_, ms)| *ms).copied();
        Ok(json!({
            "device_key": device_key,
            "product_key": product_key,
            "latest_time_ms": latest.map(|(_, ms)| ms),
            "latest_time_formatted": format::format_timestamp_ms(latest.map(|(_, ms)| ms)),
            "source": latest.map(|(source, _)| source).unwrap_or("unknown"),
            "candidates": candidates
                .iter()
                .map(|(source, ms)| json!({
                    "source": source,
                    "time_ms": ms,
                    "formatted": format::format_timestamp_ms(Some(*ms))
                }))
                .collect::<Vec<_>>()
        }))
    }

    async fn tool_health_check(&self, _args: &Map<String, Value>) -> Result<Value, ToolError> {
        match self.resolve_access_token().await {
            Ok(_) => Ok(json!({
                "status": "healthy",
                "server": MCP_SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION"),
                "base_url": self.config.base_url
            })),
            Err(err) => Ok(json!({
                "status": "unhealthy",
                "server": MCP_SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION"),
                "base_url": self.config.base_url,
                "detail": err.to_value()
            })),
        }
    }

    async fn run_diagnostics(&self) -> Value {
        let mut checks = Vec::new();

        let credentials_ok = match self.resolve_access_token().await {
            Ok(_) => {
                checks.push(json!({ "check": "credentials", "ok": true }));
                true
            }
            Err(err) => {
                checks.push(json!({
                    "check": "credentials",
                    "ok": false,
                    "error": err.to_value()
                }));
                false
            }
        };

        let probe_query = vec![
            ("pageNo".to_string(), "1".to_string()),
            ("pageSize".to_string(), "1".to_string()),
        ];
        let api_ok = match self
            .send_api_request(Method::GET, PRODUCTS_PATH, &probe_query, None, true)
            .await
        {
            Ok(result) => match vendor_envelope_data(&result, PRODUCTS_PATH) {
                Ok(_) => {
                    checks.push(json!({ "check": "vendor_api", "ok": true }));
                    true
                }
                Err(err) => {
                    checks.push(json!({
                        "check": "vendor_api",
                        "ok": false,
                        "error": err.to_value()
                    }));
                    false
                }
            },
            Err(err) => {
                checks.push(json!({
                    "check": "vendor_api",
                    "ok": false,
                    "error": err.to_value()
                }));
                false
            }
        };

        json!({
            "status": if credentials_ok && api_ok { "ready" } else { "degraded" },
            "server": MCP_SERVER_NAME,
            "version": env!("CARGO_PKG_VERSION"),
            "base_url": self.config.base_url,
            "checks": checks
        })
    }

    fn page_size_arg(&self, args: &Map<String, Value>) -> Result<u64, ToolError> {
        Ok(arg_optional_u64(args, "page_size")?
            .unwrap_or(self.config.default_page_size)
            .clamp(1, MAX_PAGE_SIZE))
    }

    async fn send_api_request(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<Value>,
        requires_auth: bool,
    ) -> Result<ApiCallResult, ToolError> {
        let path = normalize_api_path(path)?;
        let mut url = reqwest::Url::parse(&format!(
            "{}{}",
            self.config.base_url.trim_end_matches('/'),
            path
        ))
        .map_err(|e| ToolError::new("invalid_url", format!("Invalid API URL/path: {e}")))?;
        if !query.is_empty() {
            let mut qp = url.query_pairs_mut();
            for (k, v) in query {
                qp.append_pair(k, v);
            }
        }

        let mut request = self.http.request(method, url);
        if requires_auth {
            let token = self.resolve_access_token().await?;
            // The vendor expects the raw JWT, no Bearer prefix.
            request = request.header("Authorization", token);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| {
            ToolError::new(
                "upstream_fetch_failed",
                format!(
                    "Failed to reach the vendor API at {}: {e}",
                    self.config.base_url
                ),
            )
            .with_docs_hint("Ensure IOTCLOUD_BASE_URL points at the vendor OpenAPI gateway.")
        })?;

        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(|e| {
            ToolError::new(
                "upstream_fetch_failed",
                format!("Failed to read API response body: {e}"),
            )
        })?;
        let body = parse_response_body(&bytes);

        Ok(ApiCallResult { status, body })
    }

    async fn resolve_access_token(&self) -> Result<String, ToolError> {
        if let Some(token) = &self.config.explicit_token {
            return Ok(token.clone());
        }
        self.token_provider.get_valid().await.map_err(|e| {
            ToolError::new("auth_failed", e.to_string()).with_docs_hint(
                "Set IOTCLOUD_ACCESS_KEY and IOTCLOUD_ACCESS_SECRET, or pass --token.",
            )
        })
    }
}

/// Adapter that serves one vendor list endpoint as a [`PageFetch`] source.
/// Scoped endpoints name the query parameter carrying the scope value.
struct VendorPageSource<'a> {
    server: &'a McpServer,
    path: &'static str,
    scope_param: Option<&'static str>,
}

impl PageFetch for VendorPageSource<'_> {
    async fn fetch_page(
        &self,
        scope: Option<&str>,
        page_no: u64,
        page_size: u64,
    ) -> Result<FetchedPage, PageError> {
        let mut query: Vec<(String, String)> = Vec::new();
        if let (Some(param), Some(value)) = (self.scope_param, scope) {
            query.push((param.to_string(), value.to_string()));
        }
        query.push(("pageNo".to_string(), page_no.to_string()));
        query.push(("pageSize".to_string(), page_size.to_string()));

        let result = self
            .server
            .send_api_request(Method::GET, self.path, &query, None, true)
            .await
            .map_err(|err| PageError::Upstream(err.message))?;

        if !result.is_success() {
            return Err(PageError::Upstream(format!(
                "Vendor API returned HTTP {} for {}",
                result.status, self.path
            )));
        }
        match result.body.get("code").and_then(Value::as_i64) {
            Some(200) | None => {}
            Some(code) => {
                let msg = result
                    .body
                    .get("msg")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown error");
                return Err(PageError::Upstream(format!(
                    "Vendor API error {code} for {}: {msg}",
                    self.path
                )));
            }
        }

        let items = result
            .body
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut raw_meta = result.body;
        if let Some(object) = raw_meta.as_object_mut() {
            object.remove("data");
        }
        Ok(FetchedPage { items, raw_meta })
    }
}

fn tool_error_from_page(err: PageError) -> ToolError {
    match err {
        PageError::InvalidCursor(inner) => ToolError::new("invalid_cursor", inner.to_string())
            .with_field("cursor")
            .with_docs_hint(
                "Cursors are opaque and must be replayed byte-for-byte. Restart the listing without a cursor.",
            ),
        PageError::ScopeMismatch {
            cursor_scope,
            requested_scope,
        } => ToolError::new(
            "cursor_scope_mismatch",
            format!(
                "Cursor was minted while listing '{cursor_scope}' and cannot be redeemed against '{requested_scope}'"
            ),
        )
        .with_field("cursor")
        .with_details(json!({
            "cursor_scope": cursor_scope,
            "requested_scope": requested_scope
        }))
        .with_docs_hint(
            "Replay the cursor with the product_key it was minted for, or start a fresh listing.",
        ),
        PageError::Upstream(message) => ToolError::new("upstream_fetch_failed", message)
            .with_docs_hint("The vendor API failed the page fetch. Check credentials and retry."),
    }
}

/// Assembles the response body of a paginated tool. `next_cursor` is only
/// present when a successor page exists — its absence is the end-of-data
/// signal agents key on.
fn paged_data(
    path: &str,
    scope: Option<&str>,
    items: Vec<Value>,
    page_no: u64,
    page_size: u64,
    next_cursor: Option<String>,
) -> Value {
    let count = items.len();
    let mut request = json!({
        "path": path,
        "page_no": page_no,
        "page_size": page_size
    });
    if let Some(scope) = scope {
        request["product_key"] = json!(scope);
    }
    let mut data = json!({
        "request": request,
        "items": items,
        "count": count
    });
    if let Some(token) = next_cursor {
        data["next_cursor"] = json!(token);
    }
    data
}

#[derive(Debug)]
struct RpcError {
    code: i64,
    message: String,
    data: Option<Value>,
}

impl RpcError {
    fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: -32600,
            message: message.into(),
            data: None,
        }
    }

    fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("Method not found: {method}"),
            data: None,
        }
    }

    fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Debug, Clone)]
struct ToolError {
    code: String,
    message: String,
    field: Option<String>,
    docs_hint: Option<String>,
    details: Option<Value>,
}

impl ToolError {
    fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            field: None,
            docs_hint: None,
            details: None,
        }
    }

    fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    fn with_docs_hint(mut self, docs_hint: impl Into<String>) -> Self {
        self.docs_hint = Some(docs_hint.into());
        self
    }

    fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    fn to_value(&self) -> Value {
        let mut payload = json!({
            "error": self.code,
            "message": self.message
        });
        if let Some(field) = &self.field {
            payload["field"] = Value::String(field.clone());
        }
        if let Some(docs_hint) = &self.docs_hint {
            payload["docs_hint"] = Value::String(docs_hint.clone());
        }
        if let Some(details) = &self.details {
            payload["details"] = details.clone();
        }
        payload
    }
}

#[derive(Debug)]
struct ApiCallResult {
    status: u16,
    body: Value,
}

impl ApiCallResult {
    fn is_success(&self) -> bool {
        (200..=299).contains(&self.status)
    }
}

/// Unwraps the vendor's `{ code, msg, data }` success envelope. A missing or
/// non-numeric `code` is tolerated — the history endpoints are known to emit
/// malformed code fields on success.
fn vendor_envelope_data(result: &ApiCallResult, path: &str) -> Result<Value, ToolError> {
    if !result.is_success() {
        return Err(ToolError::new(
            "upstream_fetch_failed",
            format!("Vendor API returned HTTP {} for {path}", result.status),
        )
        .with_details(json!({ "status": result.status, "body": result.body })));
    }
    match result.body.get("code").and_then(Value::as_i64) {
        Some(200) | None => Ok(result.body.get("data").cloned().unwrap_or(Value::Null)),
        Some(code) => {
            let msg = result
                .body
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error");
            Err(ToolError::new(
                "upstream_fetch_failed",
                format!("Vendor API error {code} for {path}: {msg}"),
            )
            .with_details(json!({ "vendor_code": code })))
        }
    }
}

/// Copies whatever paging metadata the vendor included, skipping the odd
/// empty-object placeholders some endpoints emit.
fn vendor_page_meta(body: &Value) -> Value {
    let mut meta = Map::new();
    for key in ["pageNum", "pageSize", "pages", "total"] {
        if let Some(value) = body.get(key) {
            if value.is_number() || value.is_string() {
                meta.insert(key.to_string(), value.clone());
            }
        }
    }
    Value::Object(meta)
}

#[derive(Debug)]
struct ToolDefinition {
    name: &'static str,
    description: &'static str,
    input_schema: Value,
}

fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "iot_products_list",
            description: "List products, one page per call. Pass back next_cursor to continue; no next_cursor means end of data.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "cursor": {
                        "type": "string",
                        "description": "Opaque cursor from a previous response. Omit to start from the first page."
                    },
                    "page_size": {
                        "type": "integer",
                        "minimum": 1,
                        "maximum": MAX_PAGE_SIZE,
                        "default": DEFAULT_PAGE_SIZE,
                        "description": "Only honored on a cursor-less call; page size is fixed for the rest of the sequence."
                    }
                },
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "iot_devices_list",
            description: "List the devices of one product, one page per call. Cursors are bound to the product they were minted for.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "product_key": { "type": "string" },
                    "cursor": {
                        "type": "string",
                        "description": "Opaque cursor from a previous response for the same product_key."
                    },
                    "page_size": {
                        "type": "integer",
                        "minimum": 1,
                        "maximum": MAX_PAGE_SIZE,
                        "default": DEFAULT_PAGE_SIZE
                    }
                },
                "required": ["product_key"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "iot_product_thing_model",
            description: "Fetch a product's thing model (TSL) definition as JSON.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "product_id": { "type": "integer", "description": "Takes precedence over product_key." },
                    "product_key": { "type": "string" },
                    "language": { "type": "string", "enum": ["CN", "EN"], "default": "CN" }
                },
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "iot_device_detail",
            description: "Fetch detailed device information: auth mode, connection times, activation state.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "product_key": { "type": "string" },
                    "device_key": { "type": "string" }
                },
                "required": ["product_key", "device_key"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "iot_device_shadow",
            description: "Read the device's latest reported shadow/property data, probing known endpoint revisions.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "product_key": { "type": "string" },
                    "device_key": { "type": "string" }
                },
                "required": ["product_key", "device_key"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "iot_device_location",
            description: "Fetch the latest device location fix (WGS84/GCJ02/BD09 coordinates, accuracy, speed).",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "device_id": { "type": "integer", "description": "Takes precedence over product_key/device_key." },
                    "product_key": { "type": "string" },
                    "device_key": { "type": "string" },
                    "language": { "type": "string", "enum": ["CN", "EN"], "default": "CN" }
                },
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "iot_device_resources",
            description: "Query device resource data (battery, signal, firmware) from the shadow resource endpoint.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "product_key": { "type": "string" },
                    "device_key": { "type": "string" },
                    "language": { "type": "string", "enum": ["CN", "EN"], "default": "CN" }
                },
                "required": ["product_key", "device_key"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "iot_device_power_switch",
            description: "Turn a device's power switch on or off via a thing-model write.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "product_key": { "type": "string" },
                    "device_key": { "type": "string" },
                    "state": { "type": "string", "enum": ["on", "off"] }
                },
                "required": ["product_key", "device_key", "state"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "iot_device_data_history",
            description: "Query historical uplink/downlink data logs for a device, with vendor-side paging.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "product_key": { "type": "string" },
                    "device_key": { "type": "string" },
                    "device_id": { "type": "integer" },
                    "begin_time_ms": { "type": "integer", "description": "Start of the window, epoch milliseconds." },
                    "end_time_ms": { "type": "integer", "description": "End of the window, epoch milliseconds." },
                    "direction": { "type": "integer", "enum": [1, 2], "description": "1 = uplink, 2 = downlink." },
                    "send_status": { "type": "integer", "enum": [0, 1, -1] },
                    "language": { "type": "string", "enum": ["CN", "EN"], "default": "CN" },
                    "page_num": { "type": "integer", "minimum": 1, "default": 1 },
                    "page_size": { "type": "integer", "minimum": 1, "maximum": MAX_PAGE_SIZE, "default": 10 }
                },
                "required": ["product_key", "device_key"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "iot_device_event_history",
            description: "Query historical event logs (online/offline, alerts, faults) for a device, with vendor-side paging.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "product_key": { "type": "string" },
                    "device_key": { "type": "string" },
                    "device_id": { "type": "integer" },
                    "begin_time_ms": { "type": "integer" },
                    "end_time_ms": { "type": "integer" },
                    "event_type": { "type": "string", "description": "Offline:0 Online:1 Reconnect:2 Information:3 Alert:4 Fault:5 Reset:6" },
                    "language": { "type": "string", "enum": ["CN", "EN"], "default": "CN" },
                    "page_num": { "type": "integer", "minimum": 1, "default": 1 },
                    "page_size": { "type": "integer", "minimum": 1, "maximum": MAX_PAGE_SIZE, "default": 10 }
                },
                "required": ["product_key", "device_key"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "iot_device_latest_online_time",
            description: "Best-effort latest-activity timestamp for a device, combining detail and location sources.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "product_key": { "type": "string" },
                    "device_key": { "type": "string" }
                },
                "required": ["product_key", "device_key"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "iot_health_check",
            description: "Check that the server can authenticate against the vendor API.",
            input_schema: json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
        },
    ]
}

fn normalize_api_path(raw: &str) -> Result<String, ToolError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(
            ToolError::new("validation_failed", "API path must not be empty").with_field("path"),
        );
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return Err(ToolError::new(
            "validation_failed",
            "Pass API path only (e.g. /v2/quecproductmgr/r3/openapi/products), not full URL",
        )
        .with_field("path"));
    }
    if trimmed.starts_with('/') {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("/{trimmed}"))
    }
}

fn required_string(args: &Map<String, Value>, key: &str) -> Result<String, ToolError> {
    let value = args.get(key).ok_or_else(|| {
        ToolError::new(
            "validation_failed",
            format!("Missing required field '{key}'"),
        )
        .with_field(key)
    })?;
    match value {
        Value::String(v) if !v.trim().is_empty() => Ok(v.clone()),
        Value::String(_) => Err(ToolError::new(
            "validation_failed",
            format!("'{key}' must not be empty"),
        )
        .with_field(key)),
        _ => Err(
            ToolError::new("validation_failed", format!("'{key}' must be a string"))
                .with_field(key),
        ),
    }
}

fn arg_string(args: &Map<String, Value>, key: &str, default: &str) -> Result<String, ToolError> {
    match args.get(key) {
        None => Ok(default.to_string()),
        Some(Value::String(v)) => Ok(v.clone()),
        Some(_) => Err(
            ToolError::new("validation_failed", format!("'{key}' must be a string"))
                .with_field(key),
        ),
    }
}

fn arg_optional_string(args: &Map<String, Value>, key: &str) -> Result<Option<String>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(v)) if v.trim().is_empty() => Ok(None),
        Some(Value::String(v)) => Ok(Some(v.clone())),
        Some(_) => Err(
            ToolError::new("validation_failed", format!("'{key}' must be a string"))
                .with_field(key),
        ),
    }
}

fn arg_optional_u64(args: &Map<String, Value>, key: &str) -> Result<Option<u64>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| {
                ToolError::new(
                    "validation_failed",
                    format!("'{key}' must be an unsigned integer"),
                )
                .with_field(key)
            })
            .map(Some),
        Some(_) => Err(ToolError::new(
            "validation_failed",
            format!("'{key}' must be an unsigned integer"),
        )
        .with_field(key)),
    }
}

fn arg_optional_i64(args: &Map<String, Value>, key: &str) -> Result<Option<i64>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| {
                ToolError::new("validation_failed", format!("'{key}' must be an integer"))
                    .with_field(key)
            })
            .map(Some),
        Some(_) => Err(
            ToolError::new("validation_failed", format!("'{key}' must be an integer"))
                .with_field(key),
        ),
    }
}

fn pairs_to_json_object(pairs: &[(String, String)]) -> Value {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert(k.clone(), Value::String(v.clone()));
    }
    Value::Object(map)
}

fn parse_response_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).to_string()))
}

fn build_tool_call_response(envelope: Value, is_error: bool) -> Value {
    json!({
        "content": [
            {
                "type": "text",
                "text": to_pretty_json(&envelope)
            }
        ],
        "isError": is_error
    })
}

fn success_response(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result
    })
}

fn error_response(id: Value, error: RpcError) -> Value {
    let mut payload = json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": error.code,
            "message": error.message
        }
    });
    if let Some(data) = error.data {
        payload["error"]["data"] = data;
    }
    payload
}

async fn read_framed_json(
    reader: &mut BufReader<tokio::io::Stdin>,
) -> Result<Option<Value>, std::io::Error> {
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            if content_length.is_none() {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Unexpected EOF while reading MCP headers",
            ));
        }

        if line == "\r\n" {
            break;
        }

        let line = line.trim_end_matches(['\r', '\n']);
        if line.to_ascii_lowercase().starts_with("content-length:") {
            let raw_len = line
                .split_once(':')
                .map(|(_, right)| right.trim())
                .unwrap_or_default();
            let parsed = raw_len.parse::<usize>().map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "Invalid Content-Length header",
                )
            })?;
            content_length = Some(parsed);
        }
    }

    let content_length = content_length.ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Missing Content-Length header",
        )
    })?;
    let mut payload = vec![0_u8; content_length];
    reader.read_exact(&mut payload).await?;

    let json: Value = serde_json::from_slice(&payload).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Invalid JSON payload: {e}"),
        )
    })?;
    Ok(Some(json))
}

async fn write_framed_json(
    writer: &mut tokio::io::Stdout,
    value: &Value,
) -> Result<(), std::io::Error> {
    let body = serde_json::to_vec(value).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Failed to serialize JSON: {e}"),
        )
    })?;
    let header = format!(
        "Content-Length: {}\r\nContent-Type: application/json\r\n\r\n",
        body.len()
    );
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

fn to_pretty_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
}
