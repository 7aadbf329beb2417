// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::net::IpAddr;

use serde_json::{Map, Value};

use super::*;

type Multimap = HashMap<String, Vec<String>>;

/// Typed builder of the address data handed to a single evaluator run.
///
/// Empty values are never supplied. Setters targeting RASP addresses store
/// them as ephemeral and switch the run to the [`Scope::Rasp`] scope.
#[derive(Debug, Default)]
#[must_use]
pub struct AddressesBuilder {
    data: RunAddressData,
}

impl AddressesBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_method(self, method: &str) -> Self {
        self.persistent_str(SERVER_REQUEST_METHOD, method)
    }

    pub fn with_raw_uri(self, uri: &str) -> Self {
        self.persistent_str(SERVER_REQUEST_RAW_URI, uri)
    }

    pub fn with_headers_no_cookies(self, headers: &Multimap) -> Self {
        self.persistent_multimap(SERVER_REQUEST_HEADERS_NO_COOKIES, headers)
    }

    pub fn with_cookies(self, cookies: &Multimap) -> Self {
        self.persistent_multimap(SERVER_REQUEST_COOKIES, cookies)
    }

    pub fn with_query(self, query: &Multimap) -> Self {
        self.persistent_multimap(SERVER_REQUEST_QUERY, query)
    }

    pub fn with_path_params(mut self, params: &HashMap<String, String>) -> Self {
        if !params.is_empty() {
            let params = params
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            self.data
                .persistent
                .insert(SERVER_REQUEST_PATH_PARAMS.to_string(), Value::Object(params));
        }
        self
    }

    pub fn with_request_body(self, body: Option<Value>) -> Self {
        self.persistent_value(SERVER_REQUEST_BODY, body)
    }

    pub fn with_response_body(self, body: Option<Value>) -> Self {
        self.persistent_value(SERVER_RESPONSE_BODY, body)
    }

    /// Status codes are supplied as strings.
    pub fn with_response_status(self, status: u16) -> Self {
        if status == 0 {
            return self;
        }
        self.persistent_str(SERVER_RESPONSE_STATUS, &status.to_string())
    }

    pub fn with_response_headers_no_cookies(self, headers: &Multimap) -> Self {
        self.persistent_multimap(SERVER_RESPONSE_HEADERS_NO_COOKIES, headers)
    }

    pub fn with_client_ip(self, ip: Option<IpAddr>) -> Self {
        match ip {
            Some(ip) => self.persistent_str(CLIENT_IP, &ip.to_string()),
            None => self,
        }
    }

    pub fn with_user_id(self, id: &str) -> Self {
        self.persistent_str(USER_ID, id)
    }

    pub fn with_user_login(self, login: &str) -> Self {
        self.persistent_str(USER_LOGIN, login)
    }

    pub fn with_user_org(self, org: &str) -> Self {
        self.persistent_str(USER_ORG, org)
    }

    pub fn with_user_session_id(self, session_id: &str) -> Self {
        self.persistent_str(USER_SESSION_ID, session_id)
    }

    pub fn with_user_login_success(mut self) -> Self {
        self.data
            .persistent
            .insert(USER_LOGIN_SUCCESS.to_string(), Value::Null);
        self
    }

    pub fn with_user_login_failure(mut self) -> Self {
        self.data
            .persistent
            .insert(USER_LOGIN_FAILURE.to_string(), Value::Null);
        self
    }

    pub fn with_file_path(self, path: &str) -> Self {
        self.rasp_str(SERVER_IO_FS_FILE, path)
    }

    /// Target of an outbound HTTP request.
    pub fn with_url(self, url: &str) -> Self {
        self.rasp_str(SERVER_IO_NET_URL, url)
    }

    pub fn with_db_statement(self, statement: &str) -> Self {
        self.rasp_str(SERVER_DB_STATEMENT, statement)
    }

    pub fn with_db_type(self, driver: &str) -> Self {
        self.rasp_str(SERVER_DB_SYSTEM, driver)
    }

    pub fn with_sys_exec_cmd(mut self, cmd: &[String]) -> Self {
        if cmd.is_empty() {
            return self;
        }
        let cmd = cmd.iter().cloned().map(Value::String).collect();
        self.data
            .ephemeral
            .insert(SERVER_SYS_EXEC_CMD.to_string(), Value::Array(cmd));
        self.data.scope = Scope::Rasp;
        self
    }

    pub fn with_grpc_method(self, method: &str) -> Self {
        self.persistent_str(GRPC_SERVER_METHOD, method)
    }

    pub fn with_grpc_request_metadata(self, metadata: &Multimap) -> Self {
        self.persistent_multimap(GRPC_SERVER_REQUEST_METADATA, metadata)
    }

    pub fn with_grpc_request_message(self, message: Option<Value>) -> Self {
        self.ephemeral_value(GRPC_SERVER_REQUEST_MESSAGE, message)
    }

    pub fn with_grpc_response_message(self, message: Option<Value>) -> Self {
        self.ephemeral_value(GRPC_SERVER_RESPONSE_MESSAGE, message)
    }

    pub fn with_grpc_response_metadata_headers(self, headers: &Multimap) -> Self {
        self.persistent_multimap(GRPC_SERVER_RESPONSE_METADATA_HEADERS, headers)
    }

    pub fn with_grpc_response_metadata_trailers(self, trailers: &Multimap) -> Self {
        self.persistent_multimap(GRPC_SERVER_RESPONSE_METADATA_TRAILERS, trailers)
    }

    pub fn with_grpc_response_status_code(self, status: u32) -> Self {
        if status == 0 {
            return self;
        }
        self.persistent_str(GRPC_SERVER_RESPONSE_STATUS, &status.to_string())
    }

    /// Adds the arguments of a resolved GraphQL field, keyed by field name.
    /// Several fields may be supplied in the same run.
    pub fn with_graphql_resolver(mut self, field: &str, args: Map<String, Value>) -> Self {
        let resolvers = self
            .data
            .ephemeral
            .entry(GRAPHQL_SERVER_RESOLVER.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(resolvers) = resolvers {
            resolvers.insert(field.to_string(), Value::Object(args));
        }
        self
    }

    /// Asks the evaluator processors to extract the API schema of the request.
    pub fn extract_schema(self) -> Self {
        self.context_processor("extract-schema", true)
    }

    pub fn no_extract_schema(self) -> Self {
        self.context_processor("extract-schema", false)
    }

    pub fn build(self) -> RunAddressData {
        self.data
    }

    fn context_processor(mut self, processor: &str, enabled: bool) -> Self {
        let processors = self
            .data
            .persistent
            .entry(WAF_CONTEXT_PROCESSOR.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(processors) = processors {
            processors.insert(processor.to_string(), Value::Bool(enabled));
        }
        self
    }

    fn persistent_str(mut self, address: &str, value: &str) -> Self {
        if !value.is_empty() {
            self.data
                .persistent
                .insert(address.to_string(), Value::String(value.to_string()));
        }
        self
    }

    fn persistent_multimap(mut self, address: &str, values: &Multimap) -> Self {
        if !values.is_empty() {
            self.data
                .persistent
                .insert(address.to_string(), multimap_value(values));
        }
        self
    }

    fn persistent_value(mut self, address: &str, value: Option<Value>) -> Self {
        if let Some(value) = value.filter(|v| !v.is_null()) {
            self.data.persistent.insert(address.to_string(), value);
        }
        self
    }

    fn ephemeral_value(mut self, address: &str, value: Option<Value>) -> Self {
        if let Some(value) = value.filter(|v| !v.is_null()) {
            self.data.ephemeral.insert(address.to_string(), value);
        }
        self
    }

    fn rasp_str(mut self, address: &str, value: &str) -> Self {
        if !value.is_empty() {
            self.data
                .ephemeral
                .insert(address.to_string(), Value::String(value.to_string()));
            self.data.scope = Scope::Rasp;
        }
        self
    }
}

fn multimap_value(values: &Multimap) -> Value {
    Value::Object(
        values
            .iter()
            .map(|(k, v)| {
                let v = v.iter().cloned().map(Value::String).collect();
                (k.clone(), Value::Array(v))
            })
            .collect(),
    )
}

#[cfg_attr(coverage_nightly, coverage(off))] // Test modules skew coverage metrics
#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn headers() -> Multimap {
        HashMap::from([("user-agent".to_string(), vec!["evil".to_string()])])
    }

    #[test]
    fn test_request_addresses() {
        let data = AddressesBuilder::new()
            .with_method("POST")
            .with_raw_uri("/login?x=1")
            .with_headers_no_cookies(&headers())
            .with_cookies(&Multimap::new())
            .with_client_ip("1.2.3.4".parse().ok())
            .with_response_status(403)
            .build();

        assert_eq!(data.scope, Scope::Waf);
        assert!(data.ephemeral.is_empty());
        assert_eq!(data.persistent[SERVER_REQUEST_METHOD], "POST");
        assert_eq!(
            data.persistent[SERVER_REQUEST_HEADERS_NO_COOKIES],
            json!({"user-agent": ["evil"]})
        );
        assert_eq!(data.persistent[CLIENT_IP], "1.2.3.4");
        assert_eq!(data.persistent[SERVER_RESPONSE_STATUS], "403");
        assert!(!data.persistent.contains_key(SERVER_REQUEST_COOKIES));
    }

    #[test]
    fn test_empty_values_are_skipped() {
        let data = AddressesBuilder::new()
            .with_user_id("")
            .with_client_ip(None)
            .with_response_status(0)
            .with_request_body(None)
            .with_request_body(Some(Value::Null))
            .with_db_statement("")
            .with_sys_exec_cmd(&[])
            .build();
        assert!(data.is_empty());
        assert_eq!(data.scope, Scope::Waf);
    }

    #[test]
    fn test_rasp_addresses_are_ephemeral() {
        let data = AddressesBuilder::new()
            .with_db_type("postgres")
            .with_db_statement("SELECT 1; DROP TABLE users")
            .build();
        assert_eq!(data.scope, Scope::Rasp);
        assert!(data.persistent.is_empty());
        assert_eq!(data.ephemeral[SERVER_DB_SYSTEM], "postgres");
        assert_eq!(data.ephemeral[SERVER_DB_STATEMENT], "SELECT 1; DROP TABLE users");
    }

    #[test]
    fn test_last_writer_wins() {
        let data = AddressesBuilder::new()
            .with_user_id("first")
            .with_user_id("second")
            .build();
        assert_eq!(data.persistent[USER_ID], "second");
    }

    #[test]
    fn test_builds_are_deterministic() {
        let build = || {
            AddressesBuilder::new()
                .with_method("GET")
                .with_headers_no_cookies(&headers())
                .with_url("http://example.com")
                .build()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn test_graphql_resolvers_accumulate() {
        let mut args = Map::new();
        args.insert("id".to_string(), json!(1));
        let data = AddressesBuilder::new()
            .with_graphql_resolver("user", args)
            .with_graphql_resolver("posts", Map::new())
            .build();
        assert_eq!(
            data.ephemeral[GRAPHQL_SERVER_RESOLVER],
            json!({"user": {"id": 1}, "posts": {}})
        );
        assert_eq!(data.scope, Scope::Waf);
    }

    #[test]
    fn test_extract_schema() {
        let data = AddressesBuilder::new().no_extract_schema().extract_schema().build();
        assert_eq!(
            data.persistent[WAF_CONTEXT_PROCESSOR],
            json!({"extract-schema": true})
        );
    }

    #[test]
    fn test_user_login_events() {
        let data = AddressesBuilder::new()
            .with_user_login("admin")
            .with_user_login_failure()
            .build();
        assert_eq!(data.persistent[USER_LOGIN], "admin");
        assert_eq!(data.persistent[USER_LOGIN_FAILURE], Value::Null);
    }
}
