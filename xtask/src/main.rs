// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::{env, path::PathBuf};

use anyhow::anyhow;
use clap::CommandFactory;

const TASKS: [&str; 2] = ["manual", "generate-credentials"];

fn main() -> anyhow::Result<()> {
    match env::args()
        .nth(1)
        .ok_or(anyhow!("Must provide a task"))?
        .as_str()
    {
        "manual" => generate_manual(),
        "generate-credentials" => generate_credentials(),
        _ => Err(anyhow!("Unknown task, use one of {:?}", TASKS)),
    }
}

fn generate_manual() -> anyhow::Result<()> {
    let mut root = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    root.push("../");

    let outdir = root.join("sigbridge/docs/");
    std::fs::create_dir_all(&outdir)?;
    let command = sigbridge::cli::Cli::command();
    let manual = clap_mangen::Man::new(command);
    manual.generate_to(outdir)?;

    Ok(())
}

/// Write a throwaway CA and credentials for every role to `devel/creds`.
///
/// The bridge can then be run locally with `--credentials-directory devel/creds/creds`.
fn generate_credentials() -> anyhow::Result<()> {
    let root = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let outdir = root.join("../devel/creds");

    // Drop the existing credentials so stale certificates don't linger.
    let _ = std::fs::remove_dir_all(&outdir);
    std::fs::create_dir_all(&outdir)?;
    let creds = sigbridge_test::create_credentials(&outdir)?;
    println!(
        "Credentials written to {}",
        creds
            .bridge
            .ca_certificate
            .parent()
            .unwrap_or(outdir.as_path())
            .display()
    );

    Ok(())
}
