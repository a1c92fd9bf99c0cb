// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

#![cfg(feature = "cli")]

use assert_cmd::Command;

#[test]
fn config_prints_defaults() -> anyhow::Result<()> {
    let credentials = tempfile::TempDir::new()?;
    let output = Command::cargo_bin("sigbridge")?
        .env_remove("SIGBRIDGE_CONFIG")
        .env_remove("CONFIGURATION_DIRECTORY")
        .arg("config")
        .arg("--credentials-directory")
        .arg(credentials.path())
        .output()?;
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout)?;
    assert!(stdout.contains("server_listening_address = \"[::]:44333\""));
    assert!(stdout.contains("client_listening_address = \"[::]:44334\""));
    assert!(stdout.contains("server_leg_tls_role = \"accept\""));

    // The default credentials don't exist in an empty directory.
    let stderr = String::from_utf8(output.stderr)?;
    assert!(stderr.contains("referenced credentials aren't valid"));
    Ok(())
}

#[test]
fn config_reads_file() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let config_file = dir.path().join("bridge.toml");
    std::fs::write(
        &config_file,
        "server_listening_address = \"127.0.0.1:9000\"\nclient_listening_address = \"127.0.0.1:9001\"\n",
    )?;

    let output = Command::cargo_bin("sigbridge")?
        .arg("--config")
        .arg(&config_file)
        .arg("config")
        .arg("--credentials-directory")
        .arg(dir.path())
        .output()?;
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout)?;
    assert!(stdout.contains("server_listening_address = \"127.0.0.1:9000\""));
    assert!(stdout.contains("client_listening_address = \"127.0.0.1:9001\""));
    Ok(())
}

#[test]
fn invalid_log_filter_is_rejected() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let output = Command::cargo_bin("sigbridge")?
        .arg("--log-filter")
        .arg("sigbridge=notalevel")
        .arg("config")
        .arg("--credentials-directory")
        .arg(dir.path())
        .output()?;
    assert!(!output.status.success());
    Ok(())
}
