use super::{format_size, open_shared, parse_id};
use anyhow::Result;
use chrono::{TimeZone, Utc};
use clap::Args;
use sealsnap_core::{FileInfo, FileKind, TreeSettings};

#[derive(Args)]
pub struct LsCommand {
    #[arg(help = "Snapshot or directory object")]
    id: String,

    #[arg(short, long, help = "Maximum depth to list (0 for the top level only)")]
    depth: Option<usize>,

    #[arg(long, help = "Print object ids")]
    ids: bool,
}

impl LsCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let id = parse_id(&self.id)?;
        let disk = open_shared(cli).await?;

        let settings = TreeSettings { max_depth: self.depth };
        let files = sealsnap_core::tree(&disk, &id, &settings).await?;

        for file in &files {
            println!("{}", self.format_line(file));
        }

        Ok(())
    }

    fn format_line(&self, file: &FileInfo) -> String {
        let indent = "  ".repeat(file.depth);
        let mtime = Utc
            .timestamp_millis_opt(file.mtime)
            .single()
            .map(|time| time.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();

        let (marker, name) = match &file.kind {
            FileKind::Directory { .. } => ('d', format!("{}/", file.name)),
            FileKind::File { readable: true } => ('f', file.name.clone()),
            FileKind::File { readable: false } => ('?', file.name.clone()),
            FileKind::Link { target } => ('l', format!("{} -> {}", file.name, target)),
        };

        let mut line = format!(
            "{} {:04o} {:>10} {}  {}{}",
            marker,
            file.mode & 0o7777,
            format_size(file.size),
            mtime,
            indent,
            name
        );
        if let FileKind::Directory { children } = file.kind {
            if children > 0 {
                line.push_str(&format!(" ({} entries)", children));
            }
        }
        if self.ids {
            line.push_str(&format!("  [{}]", file.id));
        }

        line
    }
}
