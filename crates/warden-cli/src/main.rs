mod completions_cmd;
mod config;
mod run_cmd;
#[cfg(test)]
mod test_util;
mod wait_cmd;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "warden", about = "Lifecycle supervisor for long-running node processes")]
struct Cli {
    /// Config file path (overrides the WARDEN_CONFIG env var)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter config file (no node required)
    Init {
        /// Worker program to record in the config
        #[arg(long)]
        program: Option<PathBuf>,
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Start a node and supervise it until interrupted
    Run(run_cmd::RunArgs),
    /// Wait for an already-running node to report ready
    Wait(wait_cmd::WaitArgs),
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

/// Execute the `warden init` command: write a config file skeleton.
fn cmd_init(
    config_flag: Option<&std::path::Path>,
    program: Option<PathBuf>,
    force: bool,
) -> anyhow::Result<()> {
    let path = match config_flag {
        Some(path) => path.to_path_buf(),
        None => config::default_config_path(),
    };

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        worker: config::WorkerSection {
            program: program.clone(),
            ..Default::default()
        },
        ..Default::default()
    };
    config::save_config(&path, &cfg)?;

    println!("Config written to {}", path.display());
    match &program {
        Some(program) => println!("  worker.program = {}", program.display()),
        None => println!("  worker.program is unset (edit the file or pass --program to `warden run`)"),
    }
    println!();
    println!("Next: run `warden run` to start the node under supervision.");

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { program, force } => {
            cmd_init(cli.config.as_deref(), program, force)?;
        }
        Commands::Run(args) => {
            let code = run_cmd::run_node(cli.config.as_deref(), args).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Wait(args) => {
            wait_cmd::wait_for_node(args).await?;
        }
        Commands::Completions { shell } => {
            completions_cmd::print_completions(shell);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_parses_without_a_program_flag() {
        let cli = Cli::try_parse_from(["warden", "init"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Init {
                program: None,
                force: false
            }
        ));
    }

    #[test]
    fn init_writes_a_skeleton_with_the_program_unset() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");

        cmd_init(Some(&path), None, false).unwrap();

        let loaded = config::load_file(&path).unwrap();
        assert_eq!(loaded.worker.program, None);
        assert_eq!(loaded.worker.mode, config::WorkerMode::Ipc);
    }

    #[test]
    fn init_records_the_program_when_given() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");

        cmd_init(Some(&path), Some(PathBuf::from("/opt/node/worker")), false).unwrap();

        let loaded = config::load_file(&path).unwrap();
        assert_eq!(
            loaded.worker.program,
            Some(PathBuf::from("/opt/node/worker"))
        );
    }

    #[test]
    fn init_refuses_to_clobber_without_force() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[worker]\nprogram = \"keep-me\"\n").unwrap();

        let err = cmd_init(Some(&path), None, false).unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(
            config::load_file(&path).unwrap().worker.program,
            Some(PathBuf::from("keep-me"))
        );

        cmd_init(Some(&path), None, true).unwrap();
        assert_eq!(config::load_file(&path).unwrap().worker.program, None);
    }
}
