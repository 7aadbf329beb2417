// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP handler monitoring: client IP, header tags, and the request and
//! response addresses.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::addresses::{
    AddressesBuilder, CLIENT_IP, SERVER_REQUEST_BODY, SERVER_REQUEST_COOKIES,
    SERVER_REQUEST_HEADERS_NO_COOKIES, SERVER_REQUEST_METHOD, SERVER_REQUEST_PATH_PARAMS,
    SERVER_REQUEST_QUERY, SERVER_REQUEST_RAW_URI, SERVER_RESPONSE_BODY,
    SERVER_RESPONSE_HEADERS_NO_COOKIES, SERVER_RESPONSE_STATUS,
};
use crate::apisec::Sampler;
use crate::dyngo::{on, on_finish};
use crate::error::Result;
use crate::features::clientip::{
    resolve_client_ip, set_request_header_tags, set_response_header_tags,
};
use crate::features::{Feature, FeatureContext};
use crate::instrumentation::headers_no_cookies;
use crate::instrumentation::httpsec::{HandlerOperation, HandlerOperationArgs, HandlerOperationRes};

pub const ADDRESSES: &[&str] = &[
    SERVER_REQUEST_METHOD,
    SERVER_REQUEST_RAW_URI,
    SERVER_REQUEST_HEADERS_NO_COOKIES,
    SERVER_REQUEST_COOKIES,
    SERVER_REQUEST_QUERY,
    SERVER_REQUEST_PATH_PARAMS,
    SERVER_REQUEST_BODY,
    SERVER_RESPONSE_STATUS,
    SERVER_RESPONSE_HEADERS_NO_COOKIES,
    SERVER_RESPONSE_BODY,
    CLIENT_IP,
];

#[derive(Debug, Clone, Copy)]
pub struct HttpSecFeature;

struct State {
    client_ip_header: Option<String>,
    /// Only set when API security is enabled.
    sampler: Option<Mutex<Sampler>>,
}

pub fn new_feature(ctx: &FeatureContext<'_>) -> Result<Option<Box<dyn Feature>>> {
    if !ctx.supported.any_of(ADDRESSES) {
        return Ok(None);
    }

    let state = Arc::new(State {
        client_ip_header: ctx.config.client_ip_header.clone(),
        sampler: ctx
            .config
            .api_security_enabled
            .then(|| Mutex::new(Sampler::with_interval(ctx.config.api_security_sample_delay))),
    });

    let on_start = Arc::clone(&state);
    on::<HandlerOperationArgs, _>(ctx.root, move |op, args| on_start.on_request(op, args));
    let on_end = Arc::clone(&state);
    on_finish::<HandlerOperationRes, _>(ctx.root, move |op, res| on_end.on_response(op, res));

    Ok(Some(Box::new(HttpSecFeature)))
}

impl fmt::Display for HttpSecFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HTTP Security")
    }
}

impl Feature for HttpSecFeature {
    fn stop(&self) {}
}

impl State {
    fn on_request(&self, op: &HandlerOperation, args: &HandlerOperationArgs) {
        let tags = op.context().tags();
        let configured = self.client_ip_header.as_deref();
        let ips = resolve_client_ip(configured, &args.headers, args.remote_addr.as_deref());
        ips.set_tags(tags);
        set_request_header_tags(tags, &args.headers, configured);

        let data = AddressesBuilder::new()
            .with_method(&args.method)
            .with_raw_uri(&args.raw_uri)
            .with_headers_no_cookies(&headers_no_cookies(&args.headers))
            .with_cookies(&args.cookies)
            .with_query(&args.query)
            .with_path_params(&args.path_params)
            .with_request_body(args.body.clone())
            .with_client_ip(ips.client_ip)
            .build();
        op.run(data);
    }

    fn on_response(&self, op: &HandlerOperation, res: &HandlerOperationRes) {
        set_response_header_tags(op.context().tags(), &res.headers);

        let mut builder = AddressesBuilder::new()
            .with_response_status(res.status)
            .with_response_headers_no_cookies(&headers_no_cookies(&res.headers))
            .with_response_body(res.body.clone());
        if self.should_extract_schema(op, res.status) {
            builder = builder.extract_schema();
        }
        op.run(builder.build());
    }

    fn should_extract_schema(&self, op: &HandlerOperation, status: u16) -> bool {
        let (Some(sampler), Some(route)) = (&self.sampler, op.route()) else {
            return false;
        };
        sampler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .decision_for(op.method(), route, status)
    }
}
