// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-level App & API Protection.
//!
//! [`AppSec::start`] loads the evaluator and the rules, then registers the
//! security features on a fresh root operation. Instrumented call sites start
//! their operations below [`AppSec::root_operation`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, info, warn};

use crate::addresses::AddressSet;
use crate::config::Config;
use crate::dyngo::Operation;
use crate::error::{Error, Result};
use crate::features::{register_features, stop_features, Feature, FeatureContext};
use crate::ruleset::load_rules;
use crate::telemetry::{Telemetry, WAF_INIT};
use crate::waf::evaluator::Evaluator;
use crate::waf::handle::WafHandle;

pub struct AppSec {
    config: Config,
    telemetry: Arc<Telemetry>,
    state: Mutex<State>,
}

struct State {
    root: Operation,
    features: Vec<Box<dyn Feature>>,
    /// Released by [`AppSec::stop`].
    handle: Option<WafHandle>,
    supported: AddressSet,
}

impl AppSec {
    /// Starts App & API Protection with `evaluator`.
    ///
    /// # Errors
    /// - [`Error::FeatureDisabled`] when the configuration does not enable it;
    /// - any startup failure: invalid configuration, unavailable evaluator,
    ///   unreadable rules, or rules the evaluator rejects. Those are reported
    ///   once through `telemetry`.
    pub fn start(config: Config, evaluator: &dyn Evaluator, telemetry: Arc<Telemetry>) -> Result<Self> {
        if !config.enabled {
            debug!("appsec: App & API Protection is disabled by configuration");
            return Err(Error::FeatureDisabled);
        }

        match Self::try_start(&config, evaluator, &telemetry) {
            Ok(state) => {
                info!(
                    "appsec: started App & API Protection with {} features",
                    state.features.len()
                );
                Ok(Self {
                    config,
                    telemetry,
                    state: Mutex::new(state),
                })
            }
            Err(e) => {
                error!("appsec: failed to start App & API Protection: {e}");
                telemetry.error(e.to_string());
                Err(e)
            }
        }
    }

    fn try_start(config: &Config, evaluator: &dyn Evaluator, telemetry: &Arc<Telemetry>) -> Result<State> {
        config.validate()?;

        if let Some(warning) = evaluator.load()? {
            warn!("appsec: the WAF evaluator loaded with a warning: {warning}");
            telemetry.warn(warning);
        }

        let rules = load_rules(config.rules_path.as_deref())?;
        let (native, diagnostics) = evaluator.new_handle(&rules, &config.obfuscator())?;
        if diagnostics.error_count() > 0 {
            warn!(
                "appsec: {} security rules failed to load: {:?}",
                diagnostics.error_count(),
                diagnostics.errors
            );
            telemetry.warn(format!(
                "appsec: {} security rules failed to load",
                diagnostics.error_count()
            ));
        }
        let handle = WafHandle::new(native, diagnostics, evaluator.version());
        let supported = AddressSet::from_declared(handle.addresses());
        debug!(
            "appsec: the loaded rules consume {} supported addresses",
            supported.len()
        );

        let root = Operation::root();
        let features = register_features(&FeatureContext {
            config,
            supported: &supported,
            handle: &handle,
            telemetry,
            root: &root,
        })?;

        telemetry.count(
            WAF_INIT,
            1,
            vec![
                format!("waf_version:{}", handle.waf_version()),
                format!("event_rules_version:{}", handle.rules_version()),
                "success:true".to_string(),
            ],
        );

        Ok(State {
            root,
            features,
            handle: Some(handle),
            supported,
        })
    }

    /// The operation instrumented call sites start their operations below.
    #[must_use]
    pub fn root_operation(&self) -> Operation {
        self.lock().root.clone()
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.lock().handle.is_some()
    }

    /// Names of the registered features.
    #[must_use]
    pub fn features(&self) -> Vec<String> {
        self.lock().features.iter().map(ToString::to_string).collect()
    }

    /// Registers a new feature set on a new root operation, then stops the
    /// previous one. Operations started below the previous root keep their
    /// listeners until they finish.
    ///
    /// # Errors
    /// Fails when a feature cannot be registered. The previous features stay
    /// in place then.
    pub fn swap_root_operation(&self) -> Result<()> {
        let mut state = self.lock();
        let Some(handle) = state.handle.clone() else {
            debug!("appsec: ignoring a root operation swap after stop");
            return Ok(());
        };

        let root = Operation::root();
        let features = register_features(&FeatureContext {
            config: &self.config,
            supported: &state.supported,
            handle: &handle,
            telemetry: &self.telemetry,
            root: &root,
        })?;

        let previous = std::mem::replace(&mut state.features, features);
        state.root = root;
        stop_features(&previous);
        Ok(())
    }

    /// Stops every feature and releases the evaluator handle. Calling it
    /// again has no effect.
    pub fn stop(&self) {
        let mut state = self.lock();
        if state.handle.take().is_none() {
            return;
        }
        stop_features(&state.features);
        state.features.clear();
        state.root.disable();
        info!("appsec: stopped App & API Protection");
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for AppSec {
    fn drop(&mut self) {
        self.stop();
    }
}
