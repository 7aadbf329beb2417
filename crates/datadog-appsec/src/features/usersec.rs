// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! User login and identity monitoring.

use std::fmt;

use crate::addresses::{
    AddressesBuilder, USER_ID, USER_LOGIN, USER_LOGIN_FAILURE, USER_LOGIN_SUCCESS, USER_ORG,
    USER_SESSION_ID,
};
use crate::dyngo::{find_operation, on_finish, AsOperation};
use crate::error::Result;
use crate::features::{Feature, FeatureContext};
use crate::instrumentation::usersec::{UserEvent, UserLoginOperation, UserLoginOperationRes};
use crate::trace::{TagSetter, TagValue};
use crate::waf::context::ContextOperation;
use crate::waf::tags::TagName;

pub const ADDRESSES: &[&str] = &[
    USER_ID,
    USER_LOGIN,
    USER_ORG,
    USER_SESSION_ID,
    USER_LOGIN_SUCCESS,
    USER_LOGIN_FAILURE,
];

#[derive(Debug, Clone, Copy)]
pub struct UserSecFeature;

pub fn new_feature(ctx: &FeatureContext<'_>) -> Result<Option<Box<dyn Feature>>> {
    if !ctx.supported.any_of(ADDRESSES) {
        return Ok(None);
    }
    on_finish::<UserLoginOperationRes, _>(ctx.root, on_user);
    Ok(Some(Box::new(UserSecFeature)))
}

impl fmt::Display for UserSecFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("User Security")
    }
}

impl Feature for UserSecFeature {
    fn stop(&self) {}
}

fn on_user(op: &UserLoginOperation, res: &UserLoginOperationRes) {
    if let Some(ctx) = find_operation::<ContextOperation>(op.as_operation()) {
        set_user_tags(ctx.tags(), res);
    }

    let mut builder = AddressesBuilder::new()
        .with_user_id(&res.user_id)
        .with_user_login(&res.login)
        .with_user_org(&res.org)
        .with_user_session_id(&res.session_id);
    builder = match res.event {
        UserEvent::LoginSuccess => builder.with_user_login_success(),
        UserEvent::LoginFailure => builder.with_user_login_failure(),
        UserEvent::Set => builder,
    };
    op.run(builder.build());
}

fn set_tag(span: &dyn TagSetter, key: &str, value: &str) {
    if !value.is_empty() {
        span.set_tag(key, TagValue::from(value));
    }
}

/// `usr.*` tags of the identity, and the tracking tags of login events.
fn set_user_tags(span: &dyn TagSetter, res: &UserLoginOperationRes) {
    match res.event {
        UserEvent::Set => {
            set_tag(span, "usr.id", &res.user_id);
            set_tag(span, "usr.org", &res.org);
            set_tag(span, "usr.session_id", &res.session_id);
        }
        UserEvent::LoginSuccess => {
            let prefix = "appsec.events.users.login.success";
            span.set_tag(&format!("{prefix}.track"), TagValue::Bool(true));
            set_tag(span, &format!("{prefix}.usr.login"), &res.login);
            set_tag(span, "usr.id", &res.user_id);
            set_tag(span, "usr.org", &res.org);
            set_tag(span, "usr.session_id", &res.session_id);
            span.set_tag(TagName::ManualKeep.as_str(), TagValue::Bool(true));
        }
        UserEvent::LoginFailure => {
            let prefix = "appsec.events.users.login.failure";
            span.set_tag(&format!("{prefix}.track"), TagValue::Bool(true));
            set_tag(span, &format!("{prefix}.usr.login"), &res.login);
            set_tag(span, &format!("{prefix}.usr.id"), &res.user_id);
            span.set_tag(
                &format!("{prefix}.usr.exists"),
                TagValue::Bool(!res.user_id.is_empty()),
            );
            span.set_tag(TagName::ManualKeep.as_str(), TagValue::Bool(true));
        }
    }
}
