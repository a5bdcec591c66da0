use super::{open_repository, read_new_password};
use anyhow::{anyhow, Result};
use clap::Subcommand;
use sealsnap_core::DiskMode;
use tracing::warn;

#[derive(Subcommand)]
pub enum UsersCommand {
    #[command(about = "Add a user")]
    Add {
        #[arg(help = "User name")]
        username: String,

        #[arg(long, help = "Only give write access (no read access)")]
        write_only: bool,

        #[arg(long, help = "Replace an existing user")]
        force: bool,
    },

    #[command(about = "Delete a user")]
    Delete {
        #[arg(help = "User name")]
        username: String,
    },

    #[command(about = "List users")]
    List,
}

impl UsersCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let disk = open_repository(cli).await?;

        match self {
            UsersCommand::Add {
                username,
                write_only,
                force,
            } => {
                let full_pwd = if *write_only {
                    None
                } else {
                    if disk.mode() != DiskMode::ReadWrite {
                        return Err(anyhow!("Creating a user with full access requires the full password"));
                    }
                    Some(read_new_password("Full password for the new user: ")?)
                };
                let write_pwd = read_new_password("Write-only password for the new user: ")?;

                disk.init_user(username, full_pwd.as_deref(), Some(&write_pwd), *force)
                    .await?;
                println!("Added user '{}'", username);
            }

            UsersCommand::Delete { username } => {
                if *username == cli.user {
                    warn!("Deleting the user you are logged in as");
                }

                disk.delete_user(username).await?;
                println!("Deleted user '{}'", username);
            }

            UsersCommand::List => {
                let users = disk.list_users().await?;

                for user in users {
                    let mode = match user.mode {
                        DiskMode::ReadWrite => "full",
                        _ => "write-only",
                    };
                    println!("{:<32}  {}", user.username, mode);
                }
            }
        }

        Ok(())
    }
}
