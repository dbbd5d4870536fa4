//! CLI subcommand handlers.

use adaptrag_core::EngineConfig;
use adaptrag_core::session::{JsonFileSessionStore, SessionStore};
use std::path::{Path, PathBuf};

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Manage saved chat sessions
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
}

#[derive(clap::Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the resolved configuration as TOML
    Show,
    /// Write a default configuration file to the workspace
    Init,
}

#[derive(clap::Subcommand, Debug)]
pub enum SessionAction {
    /// List saved sessions
    List,
    /// Show a session's messages
    Show {
        /// Session id
        id: String,
    },
    /// Delete a saved session
    Delete {
        /// Session id
        id: String,
    },
}

pub async fn handle_command(
    command: Commands,
    config: EngineConfig,
    workspace: &Path,
) -> anyhow::Result<()> {
    match command {
        Commands::Config { action } => handle_config(action, &config, workspace),
        Commands::Session { action } => handle_session(action, &config, workspace).await,
    }
}

fn handle_config(action: ConfigAction, config: &EngineConfig, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let toml_str = toml::to_string_pretty(config)?;
            println!("{}", toml_str);
            for warning in config.validate() {
                eprintln!("warning: {}", warning);
            }
            Ok(())
        }
        ConfigAction::Init => {
            let config_dir = workspace.join(".adaptrag");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&EngineConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
    }
}

/// Session directory, relative paths resolved against the workspace.
pub fn session_dir(config: &EngineConfig, workspace: &Path) -> PathBuf {
    if config.session.directory.is_absolute() {
        config.session.directory.clone()
    } else {
        workspace.join(&config.session.directory)
    }
}

async fn handle_session(
    action: SessionAction,
    config: &EngineConfig,
    workspace: &Path,
) -> anyhow::Result<()> {
    let store = JsonFileSessionStore::new(session_dir(config, workspace));
    match action {
        SessionAction::List => {
            let ids = store.list().await?;
            if ids.is_empty() {
                println!("No saved sessions in {}", store.dir().display());
            } else {
                println!("Saved sessions ({}):", ids.len());
                for id in ids {
                    println!("  {}", id);
                }
            }
            Ok(())
        }
        SessionAction::Show { id } => {
            let Some(session) = store.load(&id).await? else {
                anyhow::bail!("Session '{}' not found", id);
            };
            println!(
                "Session {} | {} messages | ~{} tokens | {} trimmed | {} summarized",
                session.id,
                session.metadata.message_count,
                session.metadata.total_tokens,
                session.metadata.truncated_count,
                session.metadata.summarized_rounds
            );
            for message in &session.messages {
                println!("\n[{}] {}", message.role, message.content);
            }
            Ok(())
        }
        SessionAction::Delete { id } => {
            if store.delete(&id).await? {
                println!("Deleted session '{}'", id);
            } else {
                println!("Session '{}' not found", id);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_dir_resolves_relative_paths() {
        let config = EngineConfig::default();
        let dir = session_dir(&config, Path::new("/work"));
        assert_eq!(dir, Path::new("/work/.adaptrag/sessions"));
    }

    #[test]
    fn test_session_dir_keeps_absolute_paths() {
        let mut config = EngineConfig::default();
        config.session.directory = PathBuf::from("/var/lib/adaptrag");
        assert_eq!(
            session_dir(&config, Path::new("/work")),
            Path::new("/var/lib/adaptrag")
        );
    }

    #[test]
    fn test_config_init_writes_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::default();
        handle_config(ConfigAction::Init, &config, dir.path()).unwrap();
        let path = dir.path().join(".adaptrag/config.toml");
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("[retrieval]"));

        std::fs::write(&path, "# edited").unwrap();
        handle_config(ConfigAction::Init, &config, dir.path()).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "# edited");
    }
}
