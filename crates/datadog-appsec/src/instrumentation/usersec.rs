// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! User login and authenticated user tracking.

use std::sync::Arc;

use crate::dyngo::{self, ArgOf, AsOperation, Operation, ResultOf};
use crate::instrumentation::BlockingSlot;
use crate::waf::actions::BlockingSecurityEvent;
use crate::waf::context::run_from;
use crate::waf::evaluator::RunAddressData;

/// What happened to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UserEvent {
    LoginSuccess,
    LoginFailure,
    /// The request is authenticated as the user.
    #[default]
    Set,
}

impl UserEvent {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LoginSuccess => "users.login.success",
            Self::LoginFailure => "users.login.failure",
            Self::Set => "users.set",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UserLoginOperationArgs;

impl ArgOf for UserLoginOperationArgs {
    type Operation = UserLoginOperation;
}

/// The identity established by the operation. Empty fields are unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserLoginOperationRes {
    pub event: UserEvent,
    pub user_id: String,
    pub login: String,
    pub org: String,
    pub session_id: String,
}

impl ResultOf for UserLoginOperationRes {
    type Operation = UserLoginOperation;
}

pub struct UserLoginOperation {
    op: Operation,
    blocking: Arc<BlockingSlot>,
}

impl AsOperation for UserLoginOperation {
    fn as_operation(&self) -> &Operation {
        &self.op
    }
}

/// Starts a user operation below `parent`, usually an HTTP handler.
#[must_use]
pub fn start_user_login_operation(parent: &Operation) -> UserLoginOperation {
    let op = Operation::new(Some(parent));
    let blocking = BlockingSlot::listen(&op);
    let login = UserLoginOperation { op, blocking };
    dyngo::start_operation(&login, UserLoginOperationArgs);
    login
}

impl UserLoginOperation {
    pub fn run(&self, data: RunAddressData) {
        run_from(&self.op, data);
    }

    /// Reports the established identity. `Err` when a rule blocks the user.
    pub fn finish(&self, res: UserLoginOperationRes) -> Result<(), BlockingSecurityEvent> {
        dyngo::finish_operation(self, res);
        self.blocking.check()
    }
}

fn track(parent: &Operation, res: UserLoginOperationRes) -> Result<(), BlockingSecurityEvent> {
    start_user_login_operation(parent).finish(res)
}

pub fn track_user_login_success(
    parent: &Operation,
    login: &str,
    user_id: &str,
    org: &str,
    session_id: &str,
) -> Result<(), BlockingSecurityEvent> {
    track(parent, UserLoginOperationRes {
        event: UserEvent::LoginSuccess,
        user_id: user_id.to_string(),
        login: login.to_string(),
        org: org.to_string(),
        session_id: session_id.to_string(),
    })
}

/// `user_id` is empty when the login does not match any user.
pub fn track_user_login_failure(
    parent: &Operation,
    login: &str,
    user_id: &str,
) -> Result<(), BlockingSecurityEvent> {
    track(parent, UserLoginOperationRes {
        event: UserEvent::LoginFailure,
        user_id: user_id.to_string(),
        login: login.to_string(),
        ..UserLoginOperationRes::default()
    })
}

pub fn set_user(
    parent: &Operation,
    user_id: &str,
    org: &str,
    session_id: &str,
) -> Result<(), BlockingSecurityEvent> {
    track(parent, UserLoginOperationRes {
        event: UserEvent::Set,
        user_id: user_id.to_string(),
        org: org.to_string(),
        session_id: session_id.to_string(),
        ..UserLoginOperationRes::default()
    })
}

#[cfg_attr(coverage_nightly, coverage(off))] // Test modules skew coverage metrics
#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::dyngo::{emit_data, on_finish};

    #[test]
    fn test_user_events() {
        let root = Operation::root();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        on_finish::<UserLoginOperationRes, _>(&root, move |op, res| {
            sink.lock().unwrap().push(res.clone());
            if res.user_id == "blocked-user" {
                emit_data(op.as_operation(), BlockingSecurityEvent {
                    http_status: 403,
                    grpc_status: 10,
                    location: None,
                    security_response_id: None,
                });
            }
        });

        assert!(track_user_login_success(&root, "alice", "42", "acme", "s-1").is_ok());
        assert!(track_user_login_failure(&root, "mallory", "").is_ok());
        assert!(set_user(&root, "blocked-user", "", "").is_err());

        let seen = seen.lock().unwrap();
        let events: Vec<UserEvent> = seen.iter().map(|r| r.event).collect();
        assert_eq!(
            events,
            vec![UserEvent::LoginSuccess, UserEvent::LoginFailure, UserEvent::Set]
        );
        assert_eq!(seen[0].login, "alice");
        assert_eq!(seen[1].user_id, "");
    }
}
