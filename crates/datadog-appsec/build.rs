// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Compresses the default recommended ruleset so it can be embedded in the
//! library with `include_bytes!`.

use std::env;
use std::error::Error;
use std::fs;
use std::path::Path;

const RULESET_SOURCE: &str = "src/default-recommended-ruleset.json";

fn main() -> Result<(), Box<dyn Error>> {
    println!("cargo:rerun-if-changed={RULESET_SOURCE}");

    let json = fs::read(RULESET_SOURCE)?;
    let compressed = zstd::encode_all(json.as_slice(), 19)?;

    let out_dir = env::var("OUT_DIR")?;
    fs::write(
        Path::new(&out_dir).join("default-recommended-ruleset.json.zst"),
        compressed,
    )?;
    Ok(())
}
