// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Canonical evaluator address names and the set of addresses the loaded
//! rules actually consume.

mod builder;

use std::collections::HashSet;
use std::fmt;

pub use builder::AddressesBuilder;

use crate::waf::evaluator::{RunAddressData, Scope};

pub const SERVER_REQUEST_METHOD: &str = "server.request.method";
pub const SERVER_REQUEST_RAW_URI: &str = "server.request.uri.raw";
pub const SERVER_REQUEST_HEADERS_NO_COOKIES: &str = "server.request.headers.no_cookies";
pub const SERVER_REQUEST_COOKIES: &str = "server.request.cookies";
pub const SERVER_REQUEST_QUERY: &str = "server.request.query";
pub const SERVER_REQUEST_PATH_PARAMS: &str = "server.request.path_params";
pub const SERVER_REQUEST_BODY: &str = "server.request.body";
pub const SERVER_RESPONSE_STATUS: &str = "server.response.status";
pub const SERVER_RESPONSE_HEADERS_NO_COOKIES: &str = "server.response.headers.no_cookies";
pub const SERVER_RESPONSE_BODY: &str = "server.response.body";

pub const CLIENT_IP: &str = "http.client_ip";

pub const USER_ID: &str = "usr.id";
pub const USER_LOGIN: &str = "usr.login";
pub const USER_ORG: &str = "usr.org";
pub const USER_SESSION_ID: &str = "usr.session_id";
pub const USER_LOGIN_SUCCESS: &str = "server.business_logic.users.login.success";
pub const USER_LOGIN_FAILURE: &str = "server.business_logic.users.login.failure";

pub const SERVER_IO_NET_URL: &str = "server.io.net.url";
pub const SERVER_IO_FS_FILE: &str = "server.io.fs.file";
pub const SERVER_DB_STATEMENT: &str = "server.db.statement";
pub const SERVER_DB_SYSTEM: &str = "server.db.system";
pub const SERVER_SYS_EXEC_CMD: &str = "server.sys.exec.cmd";

pub const GRPC_SERVER_METHOD: &str = "grpc.server.method";
pub const GRPC_SERVER_REQUEST_METADATA: &str = "grpc.server.request.metadata";
pub const GRPC_SERVER_REQUEST_MESSAGE: &str = "grpc.server.request.message";
pub const GRPC_SERVER_RESPONSE_MESSAGE: &str = "grpc.server.response.message";
pub const GRPC_SERVER_RESPONSE_METADATA_HEADERS: &str = "grpc.server.response.metadata.headers";
pub const GRPC_SERVER_RESPONSE_METADATA_TRAILERS: &str = "grpc.server.response.metadata.trailers";
pub const GRPC_SERVER_RESPONSE_STATUS: &str = "grpc.server.response.status";

pub const GRAPHQL_SERVER_RESOLVER: &str = "graphql.server.resolver";

/// Persistent pseudo-address steering the evaluator's processors.
pub const WAF_CONTEXT_PROCESSOR: &str = "waf.context.processor";

/// Every address some feature of this crate knows how to supply.
pub const KNOWN_ADDRESSES: &[&str] = &[
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
    USER_ID,
    USER_LOGIN,
    USER_ORG,
    USER_SESSION_ID,
    USER_LOGIN_SUCCESS,
    USER_LOGIN_FAILURE,
    SERVER_IO_NET_URL,
    SERVER_IO_FS_FILE,
    SERVER_DB_STATEMENT,
    SERVER_DB_SYSTEM,
    SERVER_SYS_EXEC_CMD,
    GRPC_SERVER_METHOD,
    GRPC_SERVER_REQUEST_METADATA,
    GRPC_SERVER_REQUEST_MESSAGE,
    GRPC_SERVER_RESPONSE_MESSAGE,
    GRPC_SERVER_RESPONSE_METADATA_HEADERS,
    GRPC_SERVER_RESPONSE_METADATA_TRAILERS,
    GRPC_SERVER_RESPONSE_STATUS,
    GRAPHQL_SERVER_RESOLVER,
];

/// The addresses consumed by the loaded rules that this crate can supply.
/// Computed once when the evaluator handle is built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressSet {
    addresses: HashSet<String>,
}

impl AddressSet {
    /// Intersects the addresses declared by the evaluator with
    /// [`KNOWN_ADDRESSES`].
    #[must_use]
    pub fn from_declared<S: AsRef<str>>(declared: impl IntoIterator<Item = S>) -> Self {
        let addresses = declared
            .into_iter()
            .filter(|addr| KNOWN_ADDRESSES.contains(&addr.as_ref()))
            .map(|addr| addr.as_ref().to_string())
            .collect();
        Self { addresses }
    }

    /// Whether any of `addresses` is consumed by the loaded rules.
    #[must_use]
    pub fn any_of(&self, addresses: &[&str]) -> bool {
        addresses.iter().any(|addr| self.addresses.contains(*addr))
    }

    #[must_use]
    pub fn contains(&self, address: &str) -> bool {
        self.addresses.contains(address)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.addresses.iter().map(String::as_str)
    }
}

/// Kind of exploit a RASP rule protects against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RaspRuleType {
    Lfi,
    Ssrf,
    SqlInjection,
    CommandInjection,
}

impl RaspRuleType {
    pub const ALL: [Self; 4] = [
        Self::Lfi,
        Self::Ssrf,
        Self::SqlInjection,
        Self::CommandInjection,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lfi => "lfi",
            Self::Ssrf => "ssrf",
            Self::SqlInjection => "sql_injection",
            Self::CommandInjection => "command_injection",
        }
    }

    /// Infers the rule type of a RASP run from the ephemeral addresses it
    /// carries. `None` for non-RASP runs.
    #[must_use]
    pub fn from_run(data: &RunAddressData) -> Option<Self> {
        if data.scope != Scope::Rasp {
            return None;
        }
        data.ephemeral.keys().find_map(|addr| match addr.as_str() {
            SERVER_IO_FS_FILE => Some(Self::Lfi),
            SERVER_IO_NET_URL => Some(Self::Ssrf),
            SERVER_DB_STATEMENT | SERVER_DB_SYSTEM => Some(Self::SqlInjection),
            SERVER_SYS_EXEC_CMD => Some(Self::CommandInjection),
            _ => None,
        })
    }
}

impl fmt::Display for RaspRuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
