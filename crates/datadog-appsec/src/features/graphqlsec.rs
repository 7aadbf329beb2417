// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use crate::addresses::{AddressesBuilder, GRAPHQL_SERVER_RESOLVER};
use crate::dyngo::on;
use crate::error::Result;
use crate::features::{Feature, FeatureContext};
use crate::instrumentation::graphqlsec::{ResolveOperation, ResolveOperationArgs};

pub const ADDRESSES: &[&str] = &[GRAPHQL_SERVER_RESOLVER];

#[derive(Debug, Clone, Copy)]
pub struct GraphQlSecFeature;

pub fn new_feature(ctx: &FeatureContext<'_>) -> Result<Option<Box<dyn Feature>>> {
    if !ctx.supported.any_of(ADDRESSES) {
        return Ok(None);
    }
    on::<ResolveOperationArgs, _>(ctx.root, on_resolve);
    Ok(Some(Box::new(GraphQlSecFeature)))
}

impl fmt::Display for GraphQlSecFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("GraphQL Security")
    }
}

impl Feature for GraphQlSecFeature {
    fn stop(&self) {}
}

fn on_resolve(op: &ResolveOperation, args: &ResolveOperationArgs) {
    // Property reads without arguments carry no user input
    if args.trivial && args.arguments.is_empty() {
        return;
    }
    op.run(
        AddressesBuilder::new()
            .with_graphql_resolver(&args.field_name, args.arguments.clone())
            .build(),
    );
}

#[cfg_attr(coverage_nightly, coverage(off))] // Test modules skew coverage metrics
#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{json, Map};

    use super::*;
    use crate::addresses::AddressSet;
    use crate::config::Config;
    use crate::dyngo::{AsOperation, Operation};
    use crate::instrumentation::graphqlsec::{
        start_request_operation, start_resolve_operation, RequestOperationArgs, RequestOperationRes,
        ResolveOperationRes,
    };
    use crate::telemetry::Telemetry;
    use crate::trace::{SpanTags, TagSetter, TagValue};
    use crate::waf::evaluator::RunResult;
    use crate::waf::testing::{handle, trigger, Recorder};

    #[test]
    fn test_resolvers_are_monitored() {
        let recorder = Recorder::new(|data| {
            let id = data.ephemeral.get(GRAPHQL_SERVER_RESOLVER).map(|r| &r["user"]["id"]);
            if id == Some(&json!("1' OR '1'='1")) {
                trigger("sqr-000-002", json!({"block_request": {}}))
            } else {
                RunResult::default()
            }
        });
        let handle = handle(&recorder, ADDRESSES);
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
        let _graphql = new_feature(&ctx).unwrap().unwrap();

        let span = Arc::new(SpanTags::new());
        let request = start_request_operation(
            &root,
            RequestOperationArgs::default(),
            Arc::clone(&span) as Arc<dyn TagSetter>,
        );
        let field = |name: &str, args: Map<String, serde_json::Value>, trivial| ResolveOperationArgs {
            type_name: "Query".to_string(),
            field_name: name.to_string(),
            arguments: args,
            trivial,
        };

        let name = start_resolve_operation(request.as_operation(), field("name", Map::new(), true)).unwrap();
        name.finish(ResolveOperationRes::default());
        assert_eq!(recorder.run_count(), 0);

        let args = |id: &str| json!({ "id": id }).as_object().cloned().unwrap();
        let user = start_resolve_operation(request.as_operation(), field("user", args("1"), false)).unwrap();
        user.finish(ResolveOperationRes::default());
        assert_eq!(recorder.run_count(), 1);

        let blocked = start_resolve_operation(request.as_operation(), field("user", args("1' OR '1'='1"), false));
        assert_eq!(blocked.err().map(|b| b.http_status), Some(403));
        assert!(request.finish(RequestOperationRes::default()).is_err());
        assert_eq!(span.get("appsec.blocked"), Some(TagValue::Bool(true)));
    }
}
