// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use af_cli::Cli;
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut cli = Cli::parse();
    std::mem::take(&mut cli.logging).init("af")?;

    let mut stdout = std::io::stdout();
    cli.run(&mut stdout).await
}
