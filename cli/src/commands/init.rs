use super::{open_disk, read_new_password};
use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

#[derive(Args)]
pub struct InitCommand {
    #[arg(long, env = "SEALSNAP_WRITE_PASSWORD", hide_env_values = true, help = "Write-only password of the default user")]
    write_password: Option<String>,
}

impl InitCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let mut disk = open_disk(cli).await?;
        info!("Initializing repository at: {}", disk.url());

        let full_pwd = match &cli.password {
            Some(password) => password.clone(),
            None => read_new_password("Full password (read and write): ")?,
        };
        let write_pwd = match &self.write_password {
            Some(password) => password.clone(),
            None => read_new_password("Write-only password: ")?,
        };

        disk.init(&full_pwd, &write_pwd)
            .await
            .with_context(|| format!("Failed to initialize repository '{}'", disk.url()))?;

        println!("Initialized repository at {}", disk.url());
        println!("Keep both passwords safe, lost passwords cannot be recovered.");
        Ok(())
    }
}
