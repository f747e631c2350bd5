use crate::jobs::{TrackingMode, TrackingOptions};

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Scheduler,
    Discovery,
    Scoring,
    SmartWallets,
    Consensus,
    TrackingLive(TrackingOptions),
    Backtest,
}

pub const USAGE: &str = "usage: tracker <command>

commands:
  discovery       seed-wallet discovery + initial history extraction
  scoring         analytics rebuild + wallet scoring + qualification
  smartwallets    tier analysis + threshold selection + election
  consensus       consensus detection + notification
  tracking-live   live position tracking over the smart-wallet set
                  [--balance-only|--transactions-only] [--min-usd N] [--hours-lookback H]
  backtest        offline FIFO replay of the stored transfer log
  scheduler       run all stages on their configured intervals";

pub fn parse_args<I>(mut args: I) -> std::result::Result<Command, String>
where
    I: Iterator<Item = String>,
{
    // Drop argv[0].
    let _ = args.next();

    let Some(cmd) = args.next() else {
        return Ok(Command::Scheduler);
    };

    match cmd.as_str() {
        "scheduler" => Ok(Command::Scheduler),
        "discovery" => Ok(Command::Discovery),
        "scoring" => Ok(Command::Scoring),
        "smartwallets" => Ok(Command::SmartWallets),
        "consensus" => Ok(Command::Consensus),
        "backtest" => Ok(Command::Backtest),
        "tracking-live" => parse_tracking_args(args).map(Command::TrackingLive),
        other => Err(format!("unknown command: {other}\n\n{USAGE}")),
    }
}

fn parse_tracking_args<I>(mut args: I) -> std::result::Result<TrackingOptions, String>
where
    I: Iterator<Item = String>,
{
    let mut opts = TrackingOptions {
        mode: TrackingMode::Full,
        min_usd: None,
        hours_lookback: None,
    };

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--balance-only" => {
                if opts.mode == TrackingMode::TransactionsOnly {
                    return Err(
                        "--balance-only and --transactions-only are mutually exclusive".to_string()
                    );
                }
                opts.mode = TrackingMode::BalanceOnly;
            }
            "--transactions-only" => {
                if opts.mode == TrackingMode::BalanceOnly {
                    return Err(
                        "--balance-only and --transactions-only are mutually exclusive".to_string()
                    );
                }
                opts.mode = TrackingMode::TransactionsOnly;
            }
            "--min-usd" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--min-usd requires a value".to_string())?;
                opts.min_usd = Some(
                    value
                        .parse::<f64>()
                        .map_err(|_| format!("--min-usd: not a number: {value}"))?,
                );
            }
            "--hours-lookback" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--hours-lookback requires a value".to_string())?;
                opts.hours_lookback = Some(
                    value
                        .parse::<i64>()
                        .map_err(|_| format!("--hours-lookback: not a number: {value}"))?,
                );
            }
            other => return Err(format!("tracking-live: unknown flag: {other}")),
        }
    }

    Ok(opts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> std::result::Result<Command, String> {
        parse_args(
            std::iter::once("tracker".to_string()).chain(args.iter().map(|s| (*s).to_string())),
        )
    }

    #[test]
    fn test_no_args_defaults_to_scheduler() {
        assert_eq!(parse(&[]).unwrap(), Command::Scheduler);
    }

    #[test]
    fn test_simple_commands() {
        assert_eq!(parse(&["discovery"]).unwrap(), Command::Discovery);
        assert_eq!(parse(&["scoring"]).unwrap(), Command::Scoring);
        assert_eq!(parse(&["smartwallets"]).unwrap(), Command::SmartWallets);
        assert_eq!(parse(&["consensus"]).unwrap(), Command::Consensus);
        assert_eq!(parse(&["backtest"]).unwrap(), Command::Backtest);
    }

    #[test]
    fn test_unknown_command_is_usage_error() {
        let err = parse(&["frobnicate"]).unwrap_err();
        assert!(err.contains("unknown command"));
        assert!(err.contains("usage:"));
    }

    #[test]
    fn test_tracking_live_defaults() {
        let Command::TrackingLive(opts) = parse(&["tracking-live"]).unwrap() else {
            panic!("expected tracking-live");
        };
        assert_eq!(opts.mode, TrackingMode::Full);
        assert_eq!(opts.min_usd, None);
        assert_eq!(opts.hours_lookback, None);
    }

    #[test]
    fn test_tracking_live_flags() {
        let Command::TrackingLive(opts) = parse(&[
            "tracking-live",
            "--balance-only",
            "--min-usd",
            "750",
            "--hours-lookback",
            "12",
        ])
        .unwrap() else {
            panic!("expected tracking-live");
        };
        assert_eq!(opts.mode, TrackingMode::BalanceOnly);
        assert_eq!(opts.min_usd, Some(750.0));
        assert_eq!(opts.hours_lookback, Some(12));
    }

    #[test]
    fn test_tracking_live_transactions_only() {
        let Command::TrackingLive(opts) = parse(&["tracking-live", "--transactions-only"]).unwrap()
        else {
            panic!("expected tracking-live");
        };
        assert_eq!(opts.mode, TrackingMode::TransactionsOnly);
    }

    #[test]
    fn test_tracking_live_rejects_conflicting_modes() {
        let err = parse(&["tracking-live", "--balance-only", "--transactions-only"]).unwrap_err();
        assert!(err.contains("mutually exclusive"));
    }

    #[test]
    fn test_tracking_live_rejects_bad_number() {
        let err = parse(&["tracking-live", "--min-usd", "lots"]).unwrap_err();
        assert!(err.contains("not a number"));
    }
}
