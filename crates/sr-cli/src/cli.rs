use clap::Parser;
use std::path::PathBuf;

use sr_engine::EngineConfig;
use sr_types::SrResult;

#[derive(Parser, Debug)]
#[command(
    name = "simrun",
    version,
    about = "Run a module over a set of samples and stream the results as JSON lines."
)]
pub struct Cli {
    /// Path to the JSON run description.
    #[arg(value_name = "RUN")]
    pub run: PathBuf,

    /// Number of worker threads. Defaults to physical cores minus one.
    #[arg(short = 'j', long, value_name = "NUM")]
    pub max_parallel: Option<usize>,

    /// Directory for module output and the exported tree.
    #[arg(short, long, value_name = "PATH")]
    pub output_dir: Option<PathBuf>,

    /// Save the execution tree as text and DOT before running.
    #[arg(long)]
    pub export_tree: bool,

    /// Print only the final run summary.
    #[arg(long)]
    pub summary_only: bool,

    /// Increase verbosity level (-v for DEBUG, -vv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }

    /// Environment first, then the run description's `engine` block, then
    /// command-line flags.
    pub fn engine_config(&self, description: Option<EngineConfig>) -> SrResult<EngineConfig> {
        let mut config = match description {
            Some(config) => config,
            None => EngineConfig::from_env()?,
        };
        if let Some(workers) = self.max_parallel {
            config = config.with_max_parallel(workers);
        }
        if let Some(dir) = &self.output_dir {
            config = config.with_output_dir(dir.clone());
        }
        if self.export_tree {
            config = config.with_tree_export(true);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_the_description() {
        let cli = Cli::try_parse_from(["simrun", "run.json", "-j", "3", "--export-tree", "-vv"]).unwrap();
        let config = cli
            .engine_config(Some(EngineConfig::default().with_max_parallel(8).with_poll_interval(5)))
            .unwrap();

        assert_eq!(config.max_parallel, Some(3));
        assert_eq!(config.poll_interval_ms, 5);
        assert!(config.export_tree);
        assert_eq!(cli.log_level(), "trace");
    }

    #[test]
    fn run_path_is_required() {
        assert!(Cli::try_parse_from(["simrun"]).is_err());
        let cli = Cli::try_parse_from(["simrun", "demo.json"]).unwrap();
        assert_eq!(cli.run, PathBuf::from("demo.json"));
        assert_eq!(cli.log_level(), "info");
    }
}
