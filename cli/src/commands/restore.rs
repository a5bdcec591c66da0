use super::{format_size, open_shared, parse_id};
use anyhow::{Context, Result};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use sealsnap_core::{GetContext, GetSettings};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::info;

#[derive(Args)]
pub struct RestoreCommand {
    #[arg(help = "Snapshot, directory or file object to restore")]
    id: String,

    #[arg(help = "Destination path")]
    target: PathBuf,

    #[arg(short, long, help = "Restore into non-empty directories and overwrite files")]
    force: bool,

    #[arg(long, help = "Drop directory components of snapshot entries")]
    flat: bool,

    #[arg(long, help = "Restore file owners")]
    chown: bool,
}

impl RestoreCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let id = parse_id(&self.id)?;
        let disk = open_shared(cli).await?;

        let settings = GetSettings {
            force: self.force,
            flat: self.flat,
            chown: self.chown,
        };
        let ctx = GetContext::new(disk, settings);

        info!("Restoring {} to {}", id.short_string(), self.target.display());

        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {elapsed_precise} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.enable_steady_tick(Duration::from_millis(120));

        let progress = ctx.progress();
        let ticker = {
            let pb = pb.clone();
            tokio::spawn(async move {
                loop {
                    pb.set_message(format!("{} restored", format_size(progress.load(Ordering::Relaxed))));
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
            })
        };

        let result = ctx.get(&id, &self.target).await;
        ticker.abort();

        let total = match result {
            Ok(total) => total,
            Err(e) => {
                pb.abandon_with_message("Restore failed");
                return Err(e).with_context(|| format!("Failed to restore '{}'", id));
            }
        };
        pb.finish_with_message(format!("{} restored", format_size(total)));

        println!("Restored {} to {}", format_size(total), self.target.display());
        Ok(())
    }
}
