// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The command-line interface of the `sigbridge` binary.
//!
//! It lives in the library so the manual page can be generated from it.

use std::path::PathBuf;

use clap::Parser;

/// The signing bridge.
///
/// The bridge relays traffic between signing servers and signing clients. Both connect to the
/// bridge and authenticate with TLS certificates issued by the same certificate authority.
/// Each server connection is completely authenticated before the bridge waits for a client
/// to pair it with, and traffic is then forwarded between the two unmodified.
#[derive(Debug, Parser)]
#[command(name = "sigbridge", version)]
pub struct Cli {
    /// The path to the bridge's configuration file.
    ///
    /// If no path is provided, the defaults are used. To view the service configuration,
    /// run the `config` subcommand.
    #[arg(long, short, env = "SIGBRIDGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// A set of one or more comma-separated directives to filter logs.
    ///
    /// The general format is "target_name[span_name{field=value}]=level" where level is
    /// one of TRACE, DEBUG, INFO, WARN, ERROR.
    ///
    /// Details: https://docs.rs/tracing-subscriber/0.3.19/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[arg(long, env = "SIGBRIDGE_LOG", default_value = "WARN,sigbridge=INFO")]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand, Debug)]
pub enum Command {
    /// Run the service.
    Listen {
        /// The directory containing the service's secrets.
        ///
        /// Any file referenced in the configuration that are not absolute paths are
        /// expected to be in this directory.
        ///
        /// When run under systemd, providing a `ImportCredential=`,
        /// `LoadCredentialEncrypted=`, or `LoadCredential=` directive will
        /// set the environment variable automatically for you.
        #[arg(long, env = "CREDENTIALS_DIRECTORY")]
        credentials_directory: PathBuf,
    },

    /// See the current bridge configuration.
    Config {
        /// The directory containing the service's secrets.
        ///
        /// Any file referenced in the configuration that are not absolute paths are
        /// expected to be in this directory.
        #[arg(
            long,
            env = "CREDENTIALS_DIRECTORY",
            default_value = "/etc/credstore.encrypted/"
        )]
        credentials_directory: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn listen_requires_credentials_directory() {
        // The environment may provide it, so only check the explicit form parses.
        let cli = Cli::try_parse_from([
            "sigbridge",
            "listen",
            "--credentials-directory",
            "/run/credentials/sigbridge.service",
        ])
        .expect("arguments are valid");
        match cli.command {
            Command::Listen {
                credentials_directory,
            } => assert_eq!(
                PathBuf::from("/run/credentials/sigbridge.service"),
                credentials_directory
            ),
            other => panic!("unexpected command {other:?}"),
        }
    }
}
