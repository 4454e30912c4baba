use clap::{Parser, Subcommand};
use clap_complete::Shell;

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "subprobe",
    version,
    about = "Subscription proxy node tester built on sing-box",
    long_about = "subprobe - Fetch proxy subscriptions, test every node through an isolated sing-box instance, and rank the survivors by throughput and latency."
)]
pub struct Args {
    /// Subscription list file (one URL per line, '#' for comments)
    #[arg(
        short = 's',
        long,
        value_name = "FILE",
        default_value = "subscription.txt"
    )]
    pub subscription: String,

    /// Configuration file
    #[arg(short = 'c', long, value_name = "FILE", default_value = "config.yaml")]
    pub config: String,

    /// Maximum number of nodes to test (overrides the config file)
    #[arg(short = 'n', long = "max-nodes", value_name = "N")]
    pub max_nodes: Option<usize>,

    /// Run on the daily schedule from the config file
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub scheduler: bool,

    /// Run a single pass immediately and exit
    #[arg(long = "run-once", action = clap::ArgAction::SetTrue)]
    pub run_once: bool,

    /// Enable verbose logging
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,

    /// Enable debug mode
    #[arg(long = "debug", action = clap::ArgAction::SetTrue)]
    pub debug: bool,

    #[command(subcommand)]
    pub cmd: Option<Commands>,
}

impl Args {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.scheduler && self.run_once {
            return Err(anyhow::anyhow!(
                "Cannot combine --scheduler with --run-once, choose one"
            ));
        }

        if let Some(max_nodes) = self.max_nodes {
            if max_nodes == 0 {
                return Err(anyhow::anyhow!("--max-nodes must be greater than 0"));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["subprobe"]);
        assert_eq!(args.subscription, "subscription.txt");
        assert_eq!(args.config, "config.yaml");
        assert!(args.max_nodes.is_none());
        assert!(!args.scheduler);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_scheduler_and_run_once_conflict() {
        let args = Args::parse_from(["subprobe", "--scheduler", "--run-once"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_max_nodes_zero_rejected() {
        let args = Args::parse_from(["subprobe", "-n", "0"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_max_nodes_parsed() {
        let args = Args::parse_from(["subprobe", "--max-nodes", "25"]);
        assert_eq!(args.max_nodes, Some(25));
    }
}
