//! Subcommand execution. Every command prints one JSON document.

use crate::Command;
use anyhow::{anyhow, bail, Result};
use modelshelf_core::{
    CancellationToken, DownloadSource, RecordFilter, Resolution, ScanMode, ShelfContext, SortOrder,
    StartOptions,
};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Token cancelled on the first Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let handle = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; stopping at the next checkpoint");
            handle.cancel();
        }
    });
    cancel
}

/// Wait for a download to settle. Ctrl-C pauses it for a later `resume`.
async fn follow_download(context: &ShelfContext, id: &str) -> Result<()> {
    let downloads = context.downloads();
    let settled = tokio::select! {
        settled = downloads.wait_settled(id) => settled,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; pausing download {} for later", id);
            downloads.pause(id).await?;
            downloads.wait_settled(id).await
        }
    };
    let snapshot = settled.ok_or_else(|| anyhow!("Download {} disappeared", id))?;
    print_json(&snapshot)?;
    if let Some(error) = &snapshot.error {
        bail!("Download failed: {}", error);
    }
    Ok(())
}

pub async fn run(context: &ShelfContext, command: Command, civitai_key: Option<&str>) -> Result<()> {
    match command {
        Command::Scan { full } => {
            let mode = if full { ScanMode::Full } else { ScanMode::Quick };
            let library = context.active_library().await?;
            let report = library.scan(mode, &interrupt_token()).await?;
            print_json(&report)
        }
        Command::Reconcile { force } => {
            let library = context.active_library().await?;
            let report = library.reconcile(force, &interrupt_token()).await?;
            print_json(&report)
        }
        Command::List {
            offset,
            limit,
            search,
            tags,
            base_models,
            favorites,
            sort,
        } => {
            let library = context.active_library().await?;
            if let Some(sort) = sort {
                let order = SortOrder::parse(&sort)
                    .ok_or_else(|| anyhow!("Unknown sort order '{}'", sort))?;
                library.set_sort(order).await?;
            }
            let filter = RecordFilter {
                search,
                tags,
                base_models,
                favorites_only: favorites,
                ..Default::default()
            };
            print_json(&library.page(offset, limit, &filter))
        }
        Command::Duplicates => {
            let library = context.active_library().await?;
            print_json(&library.duplicate_groups())
        }
        Command::Conflicts => {
            let library = context.active_library().await?;
            print_json(&library.filename_conflicts())
        }
        Command::Tags { limit } => {
            let library = context.active_library().await?;
            print_json(&library.top_tags(limit)?)
        }
        Command::BaseModels => {
            let library = context.active_library().await?;
            print_json(&library.base_models())
        }
        Command::Resolve { hash } => match context.resolver().resolve(&hash).await {
            Resolution::Resolved { metadata, provider } => {
                print_json(&json!({ "provider": provider, "metadata": metadata }))
            }
            Resolution::Unavailable => print_json(&json!({ "provider": null, "metadata": null })),
        },
        Command::Refresh => {
            let library = context.active_library().await?;
            let report = library
                .bulk_refresh(context.resolver(), &interrupt_token())
                .await?;
            print_json(&report)
        }
        Command::Organize => {
            let library = context.active_library().await?;
            let report = library.auto_organize(&interrupt_token()).await?;
            print_json(&report)
        }
        Command::Download {
            url,
            destination,
            sha256,
            overwrite,
            authenticated,
        } => {
            let mut source = DownloadSource::new(url);
            if authenticated {
                let key = civitai_key.ok_or_else(|| anyhow!("--authenticated needs --civitai-key"))?;
                source = source.with_bearer(key);
            }
            let options = StartOptions {
                expected_sha256: sha256,
                overwrite,
            };
            let id = context.downloads().start(source, destination, options).await?;
            info!("Started download {}", id);
            follow_download(context, &id).await
        }
        Command::Resume { id } => {
            context.downloads().resume(&id).await?;
            follow_download(context, &id).await
        }
        Command::Cancel { id } => print_json(&context.downloads().cancel(&id).await?),
        Command::Downloads => print_json(&context.downloads().list().await),
        Command::Delete { paths } => {
            let library = context.active_library().await?;
            let outcome = library.bulk_delete(&paths).await?;
            print_json(&outcome)?;
            if !outcome.errors.is_empty() {
                bail!("{} of {} deletions failed", outcome.errors.len(), paths.len());
            }
            Ok(())
        }
    }
}
