use crate::commands::run::Workload;
use crate::mode::Mode;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "profsession")]
#[command(about = "Record a single profiling session of a built-in workload")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Profile a workload and write the result to the mode's file
    Run(RunArgs),

    /// List the profiling modes and the files they write
    Modes,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Profiling mode (cpu, heap, allocs, mutex, block, goroutine, threadcreate, trace, clock)
    #[arg(long, short = 'm', value_parser = parse_mode)]
    pub mode: Option<Mode>,

    /// Output folder
    #[arg(long, short = 'd')]
    pub dir: Option<PathBuf>,

    /// How long to run the workload (default: until Ctrl-C)
    #[arg(long, short = 't', value_parser = parse_duration)]
    pub duration: Option<Duration>,

    /// Work to run while profiling
    #[arg(long, short = 'w', value_enum, default_value = "mixed")]
    pub workload: Workload,

    /// Worker threads
    #[arg(long, default_value = "4")]
    pub threads: usize,

    /// Memory profile rate in bytes (memory modes)
    #[arg(long)]
    pub memory_rate: Option<usize>,

    /// Mutex profile fraction (mutex mode)
    #[arg(long)]
    pub mutex_fraction: Option<i32>,

    /// CPU sampling frequency in Hz
    #[arg(long)]
    pub cpu_freq: Option<i32>,

    /// Do not print the report
    #[arg(long, short = 'q')]
    pub quiet: bool,

    /// Do not handle SIGINT/SIGTERM
    #[arg(long)]
    pub no_signals: bool,
}

fn parse_mode(s: &str) -> Result<Mode, String> {
    s.parse().map_err(|e: crate::Error| e.to_string())
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    // Try humantime first
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }

    // Try bare number as seconds
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    Err(format!(
        "Invalid duration '{}'. Examples: 500ms, 30s, 5m, 90",
        s
    ))
}

impl RunArgs {
    pub fn validate(&self) -> Result<(), String> {
        if self.threads == 0 || self.threads > 256 {
            return Err(format!(
                "Thread count must be between 1 and 256, got {}",
                self.threads
            ));
        }

        if let Some(freq) = self.cpu_freq
            && (freq <= 0 || freq > 10000)
        {
            return Err(format!(
                "CPU frequency must be between 1 and 10000 Hz, got {}",
                freq
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_forms() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_run_args_parse() {
        let cli = Cli::parse_from([
            "profsession",
            "run",
            "--mode",
            "mem",
            "--duration",
            "1s",
            "--workload",
            "alloc",
            "--memory-rate",
            "1",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.mode, Some(Mode::MemoryHeap));
        assert_eq!(args.duration, Some(Duration::from_secs(1)));
        assert_eq!(args.workload, Workload::Alloc);
        assert_eq!(args.memory_rate, Some(1));
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        assert!(Cli::try_parse_from(["profsession", "run", "--mode", "gpu"]).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_frequency() {
        let cli = Cli::parse_from(["profsession", "run", "--cpu-freq", "0"]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(args.validate().is_err());
    }
}
