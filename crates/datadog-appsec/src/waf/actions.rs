// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Dispatch of the actions requested by the evaluator.
//!
//! Each action is turned into one or more data events emitted from the
//! operation that triggered the run, so the instrumentation paths that care
//! about them (an HTTP handler, a gRPC handler, a SQL call...) can react.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use crate::dyngo::{emit_data, Operation};
use crate::stacktrace::{self, StackTrace};

pub const BLOCK_REQUEST: &str = "block_request";
pub const REDIRECT_REQUEST: &str = "redirect_request";
pub const GENERATE_STACK: &str = "generate_stack";

const SECURITY_RESPONSE_PLACEHOLDER: &str = "[security_response_id]";
const DEFAULT_BLOCK_STATUS: u16 = 403;
const DEFAULT_GRPC_BLOCK_STATUS: u32 = 10;
const DEFAULT_REDIRECT_STATUS: u16 = 303;

/// Error returned to instrumented call sites whose operation was blocked.
/// It must be propagated to abort the handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("appsec: request blocked by a security rule (http status {http_status}, grpc status {grpc_status})")]
pub struct BlockingSecurityEvent {
    pub http_status: u16,
    pub grpc_status: u32,
    /// Redirect location, for redirect actions.
    pub location: Option<String>,
    pub security_response_id: Option<String>,
}

/// Bodies of the blocking responses. `[security_response_id]` is replaced
/// when rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTemplates {
    pub json: String,
    pub html: String,
}

impl Default for BlockTemplates {
    fn default() -> Self {
        Self {
            json: include_str!("blocked-template.json").to_string(),
            html: include_str!("blocked-template.html").to_string(),
        }
    }
}

/// Content type of a blocking response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockTemplate {
    /// Negotiated from the request `Accept` header.
    #[default]
    Auto,
    Json,
    Html,
}

impl BlockTemplate {
    fn from_param(value: &str) -> Self {
        match value {
            "json" => Self::Json,
            "html" => Self::Html,
            _ => Self::Auto,
        }
    }
}

/// A response an HTTP handler must write instead of its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// HTTP flavor of a blocking decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockHttp {
    Block {
        status: u16,
        template: BlockTemplate,
        security_response_id: String,
        templates: Arc<BlockTemplates>,
    },
    Redirect {
        status: u16,
        location: String,
    },
}

impl BlockHttp {
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::Block { status, .. } | Self::Redirect { status, .. } => *status,
        }
    }

    /// Renders the response for a request carrying the `accept` header.
    #[must_use]
    pub fn render(&self, accept: Option<&str>) -> HttpResponse {
        match self {
            Self::Redirect { status, location } => HttpResponse {
                status: *status,
                headers: vec![("Location".to_string(), location.clone())],
                body: Vec::new(),
            },
            Self::Block {
                status,
                template,
                security_response_id,
                templates,
            } => {
                let html = match template {
                    BlockTemplate::Html => true,
                    BlockTemplate::Json => false,
                    BlockTemplate::Auto => prefers_html(accept.unwrap_or_default()),
                };
                let (content_type, payload) = if html {
                    ("text/html", &templates.html)
                } else {
                    ("application/json", &templates.json)
                };
                HttpResponse {
                    status: *status,
                    headers: vec![("Content-Type".to_string(), content_type.to_string())],
                    body: payload
                        .replace(SECURITY_RESPONSE_PLACEHOLDER, security_response_id)
                        .into_bytes(),
                }
            }
        }
    }
}

/// HTML wins when `text/html` appears before `application/json`, or alone.
fn prefers_html(accept: &str) -> bool {
    match (accept.find("text/html"), accept.find("application/json")) {
        (Some(html), Some(json)) => html < json,
        (Some(_), None) => true,
        _ => false,
    }
}

/// gRPC flavor of a blocking decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGrpc {
    pub status: u32,
}

/// A stack trace requested by a rule, to be reported with the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackTraceAction {
    pub event: StackTrace,
}

/// What action dispatch needs from the configuration.
#[derive(Debug, Clone)]
pub struct ActionSettings {
    pub templates: Arc<BlockTemplates>,
    pub stack_trace_enabled: bool,
    pub max_stack_trace_depth: usize,
}

impl Default for ActionSettings {
    fn default() -> Self {
        Self {
            templates: Arc::default(),
            stack_trace_enabled: true,
            max_stack_trace_depth: stacktrace::DEFAULT_MAX_DEPTH,
        }
    }
}

/// Emits the data events of `actions` from `op`. Returns whether the request
/// is blocked.
pub fn send_action_events(op: &Operation, actions: &Map<String, Value>, settings: &ActionSettings) -> bool {
    let mut blocked = false;
    for (action, params) in actions {
        debug!("appsec: processing {action:?} action with params {params}");
        let Some(params) = params.as_object() else {
            debug!("appsec: ignoring {action:?} action with non-object params");
            continue;
        };
        match action.as_str() {
            BLOCK_REQUEST => {
                block_request(op, params, settings);
                blocked = true;
            }
            REDIRECT_REQUEST => {
                redirect_request(op, params, settings);
                blocked = true;
            }
            GENERATE_STACK => generate_stack(op, params, settings),
            other => debug!("appsec: ignoring unknown action type {other:?}"),
        }
    }
    blocked
}

fn block_request(op: &Operation, params: &Map<String, Value>, settings: &ActionSettings) {
    let status = int_param(params, "status_code")
        .and_then(|s| u16::try_from(s).ok())
        .unwrap_or(DEFAULT_BLOCK_STATUS);
    let grpc_status = int_param(params, "grpc_status_code")
        .and_then(|s| u32::try_from(s).ok())
        .unwrap_or(DEFAULT_GRPC_BLOCK_STATUS);
    let security_response_id = str_param(params, "security_response_id").unwrap_or_default();
    let template = str_param(params, "type").map_or(BlockTemplate::Auto, |t| BlockTemplate::from_param(&t));

    emit_block(
        op,
        BlockHttp::Block {
            status,
            template,
            security_response_id: security_response_id.clone(),
            templates: Arc::clone(&settings.templates),
        },
        grpc_status,
        security_response_id,
    );
}

fn redirect_request(op: &Operation, params: &Map<String, Value>, settings: &ActionSettings) {
    let security_response_id = str_param(params, "security_response_id").unwrap_or_default();
    let location = str_param(params, "location").unwrap_or_default();
    if location.is_empty() {
        debug!("appsec: redirect action without a location, blocking instead");
        emit_block(
            op,
            BlockHttp::Block {
                status: DEFAULT_BLOCK_STATUS,
                template: BlockTemplate::Auto,
                security_response_id: security_response_id.clone(),
                templates: Arc::clone(&settings.templates),
            },
            DEFAULT_GRPC_BLOCK_STATUS,
            security_response_id,
        );
        return;
    }

    let status = int_param(params, "status_code")
        .and_then(|s| u16::try_from(s).ok())
        .filter(|s| (300..400).contains(s))
        .unwrap_or(DEFAULT_REDIRECT_STATUS);
    let location = location.replace(SECURITY_RESPONSE_PLACEHOLDER, &security_response_id);
    emit_data(op, BlockHttp::Redirect {
        status,
        location: location.clone(),
    });
    emit_data(op, BlockingSecurityEvent {
        http_status: status,
        grpc_status: DEFAULT_GRPC_BLOCK_STATUS,
        location: Some(location),
        security_response_id: non_empty(security_response_id),
    });
}

fn emit_block(op: &Operation, http: BlockHttp, grpc_status: u32, security_response_id: String) {
    let http_status = http.status();
    emit_data(op, http);
    emit_data(op, BlockGrpc { status: grpc_status });
    emit_data(op, BlockingSecurityEvent {
        http_status,
        grpc_status,
        location: None,
        security_response_id: non_empty(security_response_id),
    });
}

fn generate_stack(op: &Operation, params: &Map<String, Value>, settings: &ActionSettings) {
    if !settings.stack_trace_enabled {
        debug!("appsec: stack trace generation is disabled, ignoring the generate_stack action");
        return;
    }
    let Some(id) = str_param(params, "stack_id") else {
        debug!("appsec: generate_stack action without a stack_id, ignoring it");
        return;
    };
    let event = stacktrace::capture(&id, settings.max_stack_trace_depth);
    emit_data(op, StackTraceAction { event });
}

fn non_empty(value: String) -> Option<String> {
    Some(value).filter(|v| !v.is_empty())
}

/// Integer parameter, given either as a number or as a numeric string.
fn int_param(params: &Map<String, Value>, key: &str) -> Option<i64> {
    match params.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn str_param(params: &Map<String, Value>, key: &str) -> Option<String> {
    params.get(key)?.as_str().map(str::to_string)
}
