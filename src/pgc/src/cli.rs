//! Command-line surface: option parsing, unit parsing, and cross-flag
//! validation. Pure glue — the library crates never see a [`Cli`].

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "pgc",
    version,
    about = "Page cache residency diagnostic tool",
    disable_version_flag = true
)]
pub struct Cli {
    /// Target size for the total of resident set candidates (accepts K/M/G/T suffixes)
    #[arg(short = 'r', long = "resident-set-size", value_name = "SIZE")]
    pub resident_set_size: Option<String>,

    /// Directory to scan for resident set candidates (repeatable)
    #[arg(short = 'd', long = "resident-set-directory", value_name = "DIR")]
    pub resident_set_directories: Vec<PathBuf>,

    /// File to pad the resident set candidates from
    #[arg(short = 'f', long = "resident-set-fillup-file", value_name = "FILE")]
    pub resident_set_fillup_file: Option<PathBuf>,

    /// Map resident set candidates executable
    #[arg(short = 'R', long = "map-resident-executable")]
    pub map_resident_exec: bool,

    /// Don't refresh non-resident pages
    #[arg(short = 'q', long = "refresh-only-resident")]
    pub refresh_only_resident: bool,

    /// Schedule background IO to read non-resident pages back in
    #[arg(short = 'w', long = "launch-resident-rewarmer")]
    pub launch_resident_rewarmer: bool,

    /// Schedule the residency refresher thread with real-time priority
    #[arg(short = 'c', long = "rt-sched-refresher")]
    pub rt_sched_refresher: bool,

    /// Time interval to read one transient page in, i.e. inverse of read frequency
    #[arg(short = 't', long = "transient-refill-period", value_name = "TIME")]
    pub transient_refill_period: Option<String>,

    /// File to read transient pages from
    #[arg(short = 'p', long = "transient-pool-file", value_name = "FILE")]
    pub transient_pool_file: Option<PathBuf>,

    /// Map transient pages executable
    #[arg(short = 'T', long = "map-transient-executable")]
    pub map_transient_exec: bool,

    /// Amount of anonymous, non-reclaimable memory to allocate
    #[arg(short = 'a', long = "non-evictable-set-size", value_name = "SIZE")]
    pub non_evictable_set_size: Option<String>,

    /// File whose first page to monitor for evictions
    #[arg(short = 'v', long = "victim-file", value_name = "FILE")]
    pub victim_file: Option<PathBuf>,

    /// Map the victim page executable
    #[arg(short = 'V', long = "map-victim-executable")]
    pub map_victim_exec: bool,

    #[arg(long = "version", action = clap::ArgAction::Version)]
    version: (),

    /// Increase logging verbosity (repeatable); RUST_LOG overrides this
    #[arg(long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Parses a byte count with an optional binary (1024-based) `K`/`M`/`G`/`T`
/// suffix, mirroring the original tool's `parse_set_size`. A bare suffix or
/// one followed by `B`/`iB` are both accepted (`1M`, `1MB`, `1MiB`).
pub fn parse_size(s: &str) -> Result<u64> {
    let (digits, rest) = split_leading_digits(s);
    let value: u64 = digits.parse().with_context(|| format!("invalid size \"{s}\""))?;

    let (shift, unit_len) = match rest.chars().next() {
        None => (0, 0),
        Some('k' | 'K') => (10, 1),
        Some('m' | 'M') => (20, 1),
        Some('g' | 'G') => (30, 1),
        Some('t' | 'T') => (40, 1),
        Some(_) => bail!("invalid size \"{s}\""),
    };

    let suffix_tail = &rest[unit_len..];
    if shift != 0 && !suffix_tail.is_empty() && suffix_tail != "B" && suffix_tail != "iB" {
        bail!("invalid size \"{s}\"");
    }

    value
        .checked_shl(shift)
        .filter(|v| (v >> shift) == value)
        .ok_or_else(|| anyhow::anyhow!("size \"{s}\" is too large"))
}

/// Parses a time period with an optional `s`/`ms`/`us` suffix (default
/// seconds), mirroring the original tool's `parse_time_period`.
pub fn parse_period(s: &str) -> Result<Duration> {
    let (digits, rest) = split_leading_digits(s);
    let value: u64 = digits
        .parse()
        .with_context(|| format!("invalid time specification \"{s}\""))?;

    let micros = match rest {
        "" | "s" => value.checked_mul(1_000_000),
        "ms" => value.checked_mul(1_000),
        "us" => Some(value),
        _ => bail!("invalid time specification \"{s}\""),
    }
    .ok_or_else(|| anyhow::anyhow!("time specification \"{s}\" is too large"))?;

    Ok(Duration::from_micros(micros))
}

fn split_leading_digits(s: &str) -> (&str, &str) {
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    s.split_at(split)
}

/// Cross-flag validation matching the original tool's option dependency
/// rules. Returns the first violation found.
pub fn validate(cli: &Cli) -> Result<()> {
    let resident = cli.resident_set_size.is_some();
    let transient = cli.transient_refill_period.is_some();
    let non_evictable = cli.non_evictable_set_size.is_some();
    let victim = cli.victim_file.is_some();

    if !resident && !transient && !non_evictable && !victim {
        bail!("at least one of \"-r\", \"-t\", \"-a\" or \"-v\" is required");
    }
    if resident && cli.resident_set_directories.is_empty() && cli.resident_set_fillup_file.is_none() {
        bail!("\"-r\" requires \"-d\" or \"-f\"");
    }
    if !cli.resident_set_directories.is_empty() && !resident {
        bail!("\"-d\" requires \"-r\"");
    }
    if cli.resident_set_fillup_file.is_some() && !resident {
        bail!("\"-f\" requires \"-r\"");
    }
    if cli.map_resident_exec && !resident {
        bail!("\"-R\" requires \"-r\"");
    }
    if cli.refresh_only_resident && !resident {
        bail!("\"-q\" requires \"-r\"");
    }
    if cli.launch_resident_rewarmer && !resident {
        bail!("\"-w\" requires \"-r\"");
    }
    if cli.rt_sched_refresher && !resident {
        bail!("\"-c\" requires \"-r\"");
    }
    if cli.launch_resident_rewarmer && !cli.refresh_only_resident {
        bail!("\"-w\" requires \"-q\"");
    }
    if transient != cli.transient_pool_file.is_some() {
        bail!("either both or none of \"-t\" and \"-p\" must be given");
    }
    if cli.map_transient_exec && !transient {
        bail!("\"-T\" requires \"-t\"");
    }
    if cli.map_victim_exec && !victim {
        bail!("\"-V\" requires \"-v\"");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_suffixed_sizes() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("1K").unwrap(), 1024);
        assert_eq!(parse_size("1KB").unwrap(), 1024);
        assert_eq!(parse_size("1KiB").unwrap(), 1024);
        assert_eq!(parse_size("2M").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_size("1G").unwrap(), 1024 * 1024 * 1024);
    }

    #[test]
    fn rejects_garbage_size_suffix() {
        assert!(parse_size("4096x").is_err());
        assert!(parse_size("1KX").is_err());
    }

    #[test]
    fn parses_periods_with_default_and_explicit_units() {
        assert_eq!(parse_period("1").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_period("1s").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_period("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_period("250us").unwrap(), Duration::from_micros(250));
    }

    #[test]
    fn requires_at_least_one_mode() {
        let cli = Cli::parse_from(["pgc"]);
        assert!(validate(&cli).is_err());
    }

    #[test]
    fn resident_set_size_requires_directory_or_fillup_file() {
        let cli = Cli::parse_from(["pgc", "-r", "1M"]);
        assert!(validate(&cli).is_err());

        let cli = Cli::parse_from(["pgc", "-r", "1M", "-d", "/tmp"]);
        assert!(validate(&cli).is_ok());
    }

    #[test]
    fn rewarmer_requires_refresh_only_resident() {
        let cli = Cli::parse_from(["pgc", "-r", "1M", "-d", "/tmp", "-w"]);
        assert!(validate(&cli).is_err());

        let cli = Cli::parse_from(["pgc", "-r", "1M", "-d", "/tmp", "-w", "-q"]);
        assert!(validate(&cli).is_ok());
    }

    #[test]
    fn transient_flags_must_be_given_together() {
        let cli = Cli::parse_from(["pgc", "-t", "1s"]);
        assert!(validate(&cli).is_err());

        let cli = Cli::parse_from(["pgc", "-p", "/tmp/pool"]);
        assert!(validate(&cli).is_err());

        let cli = Cli::parse_from(["pgc", "-t", "1s", "-p", "/tmp/pool"]);
        assert!(validate(&cli).is_ok());
    }
}
