// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::sync::Arc;

use crate::addresses::{
    AddressesBuilder, CLIENT_IP, GRPC_SERVER_METHOD, GRPC_SERVER_REQUEST_MESSAGE,
    GRPC_SERVER_REQUEST_METADATA, GRPC_SERVER_RESPONSE_MESSAGE,
    GRPC_SERVER_RESPONSE_METADATA_HEADERS, GRPC_SERVER_RESPONSE_METADATA_TRAILERS,
    GRPC_SERVER_RESPONSE_STATUS,
};
use crate::dyngo::{on, on_finish};
use crate::error::Result;
use crate::features::clientip::resolve_client_ip;
use crate::features::{Feature, FeatureContext};
use crate::instrumentation::grpcsec::{HandlerOperation, HandlerOperationArgs, HandlerOperationRes};
use crate::instrumentation::normalize_headers;

pub const ADDRESSES: &[&str] = &[
    GRPC_SERVER_METHOD,
    GRPC_SERVER_REQUEST_METADATA,
    GRPC_SERVER_REQUEST_MESSAGE,
    GRPC_SERVER_RESPONSE_MESSAGE,
    GRPC_SERVER_RESPONSE_METADATA_HEADERS,
    GRPC_SERVER_RESPONSE_METADATA_TRAILERS,
    GRPC_SERVER_RESPONSE_STATUS,
    CLIENT_IP,
];

#[derive(Debug, Clone, Copy)]
pub struct GrpcSecFeature;

pub fn new_feature(ctx: &FeatureContext<'_>) -> Result<Option<Box<dyn Feature>>> {
    if !ctx.supported.any_of(ADDRESSES) {
        return Ok(None);
    }

    let client_ip_header: Arc<Option<String>> = Arc::new(ctx.config.client_ip_header.clone());
    on::<HandlerOperationArgs, _>(ctx.root, move |op, args| {
        on_request(op, args, client_ip_header.as_deref());
    });
    on_finish::<HandlerOperationRes, _>(ctx.root, on_response);

    Ok(Some(Box::new(GrpcSecFeature)))
}

impl fmt::Display for GrpcSecFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("gRPC Security")
    }
}

impl Feature for GrpcSecFeature {
    fn stop(&self) {}
}

fn on_request(op: &HandlerOperation, args: &HandlerOperationArgs, client_ip_header: Option<&str>) {
    let ips = resolve_client_ip(client_ip_header, &args.metadata, args.remote_addr.as_deref());
    ips.set_tags(op.context().tags());

    op.run(
        AddressesBuilder::new()
            .with_grpc_method(&args.method)
            .with_grpc_request_metadata(&normalize_headers(&args.metadata))
            .with_client_ip(ips.client_ip)
            .build(),
    );
}

fn on_response(op: &HandlerOperation, res: &HandlerOperationRes) {
    op.run(
        AddressesBuilder::new()
            .with_grpc_response_status_code(res.status_code)
            .with_grpc_response_metadata_headers(&normalize_headers(&res.headers))
            .with_grpc_response_metadata_trailers(&normalize_headers(&res.trailers))
            .build(),
    );
}

#[cfg_attr(coverage_nightly, coverage(off))] // Test modules skew coverage metrics
#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::addresses::AddressSet;
    use crate::config::Config;
    use crate::dyngo::Operation;
    use crate::instrumentation::grpcsec::start_handler_operation;
    use crate::instrumentation::Multimap;
    use crate::telemetry::Telemetry;
    use crate::trace::{SpanTags, TagSetter, TagValue};
    use crate::waf::evaluator::RunResult;
    use crate::waf::testing::{handle, trigger, Recorder};

    #[test]
    fn test_grpc_handler() {
        let recorder = Recorder::new(|data| {
            if data.ephemeral.contains_key(GRPC_SERVER_REQUEST_MESSAGE) {
                trigger("sqr-000-001", json!({"block_request": {"grpc_status_code": 7}}))
            } else {
                RunResult::default()
            }
        });
        let handle = handle(&recorder, &[GRPC_SERVER_METHOD, GRPC_SERVER_REQUEST_MESSAGE, CLIENT_IP]);
        let supported = AddressSet::from_declared(handle.addresses());
        let telemetry = Arc::new(Telemetry::new());
        let root = Operation::root();
        let config = Config::default();
        let ctx = FeatureContext {
            config: &config,
            supported: &supported,
            handle: &handle,
            telemetry: &telemetry,
            root: &root,
        };
        let _waf = crate::features::waf::new_feature(&ctx).unwrap().unwrap();
        let _grpc = new_feature(&ctx).unwrap().unwrap();

        let mut metadata = Multimap::new();
        metadata.insert("X-Real-IP".to_string(), vec!["8.8.8.8".to_string()]);
        let span = Arc::new(SpanTags::new());
        let handler = start_handler_operation(
            &root,
            HandlerOperationArgs {
                method: "/shop.Orders/Create".to_string(),
                metadata,
                remote_addr: Some("10.1.1.1:50051".to_string()),
            },
            Arc::clone(&span) as Arc<dyn TagSetter>,
        );
        assert!(handler.check_blocked().is_ok());
        {
            let runs = recorder.runs.lock().unwrap();
            assert_eq!(runs[0].persistent[GRPC_SERVER_METHOD], json!("/shop.Orders/Create"));
            assert_eq!(runs[0].persistent[CLIENT_IP], json!("8.8.8.8"));
        }

        let blocked = handler.monitor_request_message(json!({"id": "1 OR 1=1"}));
        assert_eq!(blocked.unwrap_err().grpc_status, 7);
        assert!(handler.finish(HandlerOperationRes::default()).is_err());
        assert_eq!(span.get("appsec.blocked"), Some(TagValue::Bool(true)));
        assert_eq!(span.get("http.client_ip"), Some(TagValue::from("8.8.8.8")));
    }
}
