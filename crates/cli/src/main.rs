// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `ember` — CLI front-end for the Ember edge runtime daemon.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod client;
mod exit_error;
mod output;

use clap::{Parser, Subcommand};
use client::Client;
use ember_daemon::EmberPaths;
use ember_wire::{CliRequest, CliResponse};
use exit_error::{ExitError, EXIT_USAGE};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ember", version, about = "Manage the Ember edge runtime")]
struct Cli {
    /// Runtime root directory (defaults to $EMBER_ROOT or ~/.ember)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show one component's state
    GetComponent { name: String },
    /// List all components
    ListComponents,
    /// Stop then start a component
    RestartComponent { name: String },
    /// Stop a component
    StopComponent { name: String },
    /// Queue a deployment from a JSON document
    CreateLocalDeployment { doc: PathBuf },
    /// Show a deployment record
    GetDeploymentStatus { id: String },
    /// List persisted deployments
    ListLocalDeployments,
    /// Import recipes (and optionally artifacts) into the package store
    UpdateRecipesAndArtifacts {
        #[arg(long)]
        recipes: PathBuf,
        #[arg(long)]
        artifacts: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help/version print and exit 0; real parse errors are
            // usage errors.
            if e.use_stderr() {
                eprintln!("{e}");
                std::process::exit(EXIT_USAGE);
            }
            print!("{e}");
            std::process::exit(0);
        }
    };

    match run(cli).await {
        Ok(()) => {}
        Err(e) => {
            eprintln!("ember: {e}");
            std::process::exit(e.code);
        }
    }
}

async fn run(cli: Cli) -> Result<(), ExitError> {
    let paths = EmberPaths::resolve(cli.root)
        .ok_or_else(|| ExitError::usage("cannot determine the runtime root"))?;
    let request = build_request(cli.command)?;

    let mut client = Client::connect(&paths).await?;
    let response = client.call(&request).await?;
    render(response)
}

fn build_request(command: Command) -> Result<CliRequest, ExitError> {
    Ok(match command {
        Command::GetComponent { name } => CliRequest::GetComponent { name },
        Command::ListComponents => CliRequest::ListComponents,
        Command::RestartComponent { name } => CliRequest::RestartComponent { name },
        Command::StopComponent { name } => CliRequest::StopComponent { name },
        Command::CreateLocalDeployment { doc } => {
            let text = std::fs::read_to_string(&doc).map_err(|e| {
                ExitError::usage(format!("cannot read {}: {e}", doc.display()))
            })?;
            let doc = serde_json::from_str(&text).map_err(|e| {
                ExitError::usage(format!("invalid deployment document: {e}"))
            })?;
            CliRequest::CreateLocalDeployment { doc }
        }
        Command::GetDeploymentStatus { id } => CliRequest::GetDeploymentStatus { id },
        Command::ListLocalDeployments => CliRequest::ListLocalDeployments,
        Command::UpdateRecipesAndArtifacts { recipes, artifacts } => {
            CliRequest::UpdateRecipesAndArtifacts {
                recipes_dir: recipes,
                artifacts_dir: artifacts,
            }
        }
    })
}

fn render(response: CliResponse) -> Result<(), ExitError> {
    match response {
        CliResponse::Ok => Ok(()),
        CliResponse::Component(info) => {
            println!("{}", output::component_line(&info));
            Ok(())
        }
        CliResponse::Components(infos) => {
            for info in &infos {
                println!("{}", output::component_line(info));
            }
            Ok(())
        }
        CliResponse::DeploymentQueued { id } => {
            println!("{id}");
            Ok(())
        }
        CliResponse::Deployment(record) => {
            println!("{}", output::deployment_json(&record)?);
            Ok(())
        }
        CliResponse::Deployments(records) => {
            for record in &records {
                println!("{}", output::deployment_line(record));
            }
            Ok(())
        }
        CliResponse::Imported { recipes } => {
            for recipe in &recipes {
                println!("imported {recipe}");
            }
            Ok(())
        }
        CliResponse::Error(body) => Err(body.into()),
    }
}
