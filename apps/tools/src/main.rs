use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use client_core::{
    config::prepare_database_url,
    normalize::normalize_import,
    persistence::{load_project_meta, load_snapshot, reset_documents, store_snapshot},
};
use shared::graph::{ExportDocument, ProjectMeta};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/canvas_client.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Lists stored documents and summarizes the saved canvas.
    Show,
    /// Writes the saved canvas as a project file.
    Export { file: PathBuf },
    /// Replaces the saved canvas with a project file. The backend is not contacted.
    Import { file: PathBuf },
    /// Deletes every local document.
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let database_url = prepare_database_url(&cli.database_url)?;
    let storage = Storage::new(&database_url).await?;

    match cli.command {
        Command::Show => {
            for summary in storage.list_documents().await? {
                println!(
                    "{} v{} saved_at={} bytes={}",
                    summary.key, summary.version, summary.saved_at, summary.size_bytes
                );
            }
            match load_snapshot(&storage).await? {
                Some(snapshot) => println!(
                    "canvas: nodes={} connections={} zoom={}",
                    snapshot.nodes.len(),
                    snapshot.connections.len(),
                    snapshot.viewport.zoom
                ),
                None => println!("canvas: none saved"),
            }
            if let Some(project) = load_project_meta(&storage).await? {
                println!("project: {}", project.name);
            }
        }
        Command::Export { file } => {
            let state = load_snapshot(&storage).await?.unwrap_or_default();
            let project = load_project_meta(&storage)
                .await?
                .unwrap_or_else(|| ProjectMeta {
                    name: "Untitled Project".into(),
                    saved_at: Utc::now(),
                });
            let document = ExportDocument {
                project,
                state,
                engine_tabs: Vec::new(),
            };
            fs::write(&file, serde_json::to_string_pretty(&document)?)
                .with_context(|| format!("failed to write '{}'", file.display()))?;
            println!("exported {}", file.display());
        }
        Command::Import { file } => {
            let raw = fs::read_to_string(&file)
                .with_context(|| format!("failed to read '{}'", file.display()))?;
            let imported = normalize_import(serde_json::from_str(&raw)?)?;
            let project = ProjectMeta {
                name: imported
                    .project_name
                    .unwrap_or_else(|| "Untitled Project".into()),
                saved_at: Utc::now(),
            };
            store_snapshot(&storage, &imported.snapshot, &project).await?;
            println!(
                "imported nodes={} connections={} as '{}'",
                imported.snapshot.nodes.len(),
                imported.snapshot.connections.len(),
                project.name
            );
        }
        Command::Reset => {
            let removed = reset_documents(&storage).await?;
            if removed.is_empty() {
                println!("nothing to reset");
            } else {
                println!("removed {}", removed.join(", "));
            }
        }
    }

    Ok(())
}
