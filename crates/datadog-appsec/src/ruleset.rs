// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The default recommended ruleset, zstd-compressed at build time and embedded
//! in the library.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::OnceLock;

use serde_json::Value;
use tracing::debug;
use zstd::Decoder;

use crate::error::{Error, Result};

const DEFAULT_RECOMMENDED_RULES: &[u8] =
    include_bytes!(concat!(env!("OUT_DIR"), "/default-recommended-ruleset.json.zst"));

static DEFAULT_RULESET: OnceLock<Value> = OnceLock::new();

/// Returns a reader over the embedded ruleset JSON document.
fn default_recommended_ruleset() -> io::Result<impl io::Read> {
    Decoder::new(DEFAULT_RECOMMENDED_RULES)
}

fn decode() -> Result<Value> {
    let reader = default_recommended_ruleset().map_err(|e| Error::RulesFile("<embedded>".into(), e))?;
    Ok(serde_json::from_reader(reader)?)
}

/// The embedded ruleset, decoded on first use.
///
/// # Errors
/// Fails when the embedded document cannot be decompressed or parsed, which
/// only happens with a corrupted build.
pub fn default_ruleset() -> Result<&'static Value> {
    if let Some(rules) = DEFAULT_RULESET.get() {
        return Ok(rules);
    }
    let rules = decode()?;
    debug!("appsec: decoded the embedded default ruleset");
    Ok(DEFAULT_RULESET.get_or_init(|| rules))
}

/// Reads the ruleset at `path`, falling back to the embedded ruleset when no
/// path is configured.
pub fn load_rules(path: Option<&Path>) -> Result<Value> {
    let Some(path) = path else {
        return default_ruleset().cloned();
    };
    let file = File::open(path).map_err(|e| Error::RulesFile(path.to_path_buf(), e))?;
    let rules = serde_json::from_reader(BufReader::new(file))?;
    debug!("appsec: loaded the ruleset from {}", path.display());
    Ok(rules)
}

#[cfg_attr(coverage_nightly, coverage(off))] // Test modules skew coverage metrics
#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_ruleset() {
        let rules = default_ruleset().expect("failed to decode the embedded ruleset");
        assert!(rules.get("rules").is_some_and(Value::is_array));
        // Cached
        assert!(std::ptr::eq(rules, default_ruleset().unwrap()));
    }

    #[test]
    fn test_load_rules_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"version": "2.2", "rules": []}}"#).unwrap();
        let rules = load_rules(Some(file.path())).unwrap();
        assert_eq!(rules["version"], "2.2");
    }

    #[test]
    fn test_load_rules_errors() {
        let missing = load_rules(Some(Path::new("/nonexistent/rules.json")));
        assert!(matches!(missing, Err(Error::RulesFile(..))));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(load_rules(Some(file.path())), Err(Error::RulesParse(_))));
    }
}
