use super::{format_size, open_shared};
use anyhow::Result;
use clap::Args;

#[derive(Args)]
pub struct SnapshotsCommand {
    #[arg(long, help = "Output format (table, json)", default_value = "table")]
    format: String,

    #[arg(long, help = "Show latest N snapshots")]
    latest: Option<usize>,
}

impl SnapshotsCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let disk = open_shared(cli).await?;

        let mut snapshots = sealsnap_core::list(&disk).await?;
        if let Some(latest) = self.latest {
            let skip = snapshots.len().saturating_sub(latest);
            snapshots.drain(..skip);
        }

        match self.format.as_str() {
            "json" => {
                println!("{}", serde_json::to_string_pretty(&snapshots)?);
            }
            _ => {
                if snapshots.is_empty() {
                    println!("No snapshots found");
                    return Ok(());
                }

                println!("{:<64}  {:<19}  {:>10}  {:>10}  Name", "ID", "Date", "Size", "Stored");
                println!("{:-<120}", "");

                for snapshot in &snapshots {
                    let date = snapshot
                        .datetime()
                        .map(|time| time.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_default();

                    println!(
                        "{:<64}  {:<19}  {:>10}  {:>10}  {}",
                        snapshot.id,
                        date,
                        format_size(snapshot.len),
                        format_size(snapshot.stored),
                        snapshot.name.as_deref().unwrap_or("")
                    );
                }

                println!();
                println!("{} snapshots", snapshots.len());
            }
        }

        Ok(())
    }
}
