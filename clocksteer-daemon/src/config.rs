//! Command line and configuration.
//!
//! Subcommands select the operating mode; the default (no subcommand)
//! is the steering client. Tunable parameters arrive either as `-p
//! name=value` tweaks or from a TOML config file; both go through the
//! bounds-checked registry, and `-p ?` / `-p name` turn the invocation
//! into a query that stops before any clock is touched.

use std::collections::BTreeMap;
use std::fs;

use clap::{Args, Parser, Subcommand};
use clocksteer_proto::{ParamSpec, Params, PARAM_SPECS};
use serde::Deserialize;
use tracing::info;

use crate::tracer::{trace_rec, Tracer};
use crate::Error;

#[derive(Debug, Parser)]
#[command(
    name = "clocksteer",
    about = "NTP client that steers the system clock",
    version,
    args_conflicts_with_subcommands = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub client: ClientArgs,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Poll servers passively and record their replies as a trace
    PollServer(PollServerArgs),
    /// Replay a recorded poll trace against a simulated clock
    SimClient(SimClientArgs),
    /// Run the timestamp arithmetic self-test
    RunTests,
}

#[derive(Debug, Args)]
pub struct ClientArgs {
    /// Set or query a tunable parameter; `-p ?` lists them all
    #[arg(short = 'p', value_name = "NAME[=VALUE]")]
    pub param: Vec<String>,

    /// Write trace records to FILE ("-" = stdout)
    #[arg(short = 't', value_name = "FILE")]
    pub tracefile: Option<String>,

    /// TOML file with parameter overrides and extra servers
    #[arg(long, value_name = "FILE")]
    pub config: Option<String>,

    /// NTP servers to steer against
    #[arg(value_name = "SERVER")]
    pub servers: Vec<String>,
}

#[derive(Debug, Args)]
pub struct PollServerArgs {
    /// Stop after this many seconds
    #[arg(short = 'd', value_name = "SECONDS", default_value_t = 1800.0)]
    pub duration: f64,

    /// Extra server probed every 32 seconds on a short timeout
    #[arg(short = 'm', value_name = "HOST")]
    pub monitor: Option<String>,

    /// Write trace records to FILE instead of stdout
    #[arg(short = 't', value_name = "FILE")]
    pub tracefile: Option<String>,

    /// NTP servers to poll
    #[arg(value_name = "SERVER")]
    pub servers: Vec<String>,
}

#[derive(Debug, Args)]
pub struct SimClientArgs {
    /// Recorded poll-server trace to replay
    #[arg(short = 's', value_name = "FILE")]
    pub simfile: String,

    /// Set or query a tunable parameter; `-p ?` lists them all
    #[arg(short = 'p', value_name = "NAME[=VALUE]")]
    pub param: Vec<String>,

    /// Write trace records to FILE ("-" = stdout)
    #[arg(short = 't', value_name = "FILE")]
    pub tracefile: Option<String>,

    /// Disturb the simulated oscillator: at WHEN, add FREQ and PHASE
    #[arg(short = 'B', value_name = "WHEN,FREQ,PHASE")]
    pub bump: Vec<String>,
}

/// Result of processing `-p` arguments.
#[derive(Debug, PartialEq, Eq)]
pub enum TweakOutcome {
    /// All tweaks applied, carry on.
    Applied,
    /// A query form was seen and answered; stop without running.
    QueryHandled,
}

pub fn apply_tweaks(params: &mut Params, tweaks: &[String]) -> Result<TweakOutcome, Error> {
    for arg in tweaks {
        if arg == "?" {
            println!("List of available parameters:");
            for spec in PARAM_SPECS {
                println!("\t{}", spec.name);
            }
            return Ok(TweakOutcome::QueryHandled);
        }

        match arg.split_once('=') {
            None => {
                let spec = ParamSpec::find(arg)
                    .ok_or_else(|| Error::Param(clocksteer_proto::ParamError::Unknown(arg.clone())))?;
                println!("Parameter:\n\t{}", spec.name);
                println!("Minimum:\n\t{:.3e}", spec.min);
                println!("Maximum:\n\t{:.3e}", spec.max);
                println!("Default:\n\t{:.3e}", spec.default);
                println!("Description:\n\t{}\n", spec.doc);
                return Ok(TweakOutcome::QueryHandled);
            }
            Some((name, value)) => {
                let parsed: f64 = value.parse().map_err(|_| Error::BadValue {
                    param: name.to_owned(),
                    value: value.to_owned(),
                })?;
                params.set(name, parsed)?;
                info!(param = name, value = parsed, "parameter tweaked");
            }
        }
    }
    Ok(TweakOutcome::Applied)
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    params: BTreeMap<String, f64>,
    #[serde(default)]
    servers: Vec<String>,
}

/// Load a TOML config file; parameter values go through the same bounds
/// checks as `-p`. Returns the servers the file contributes.
pub fn load_config(path: &str, params: &mut Params) -> Result<Vec<String>, Error> {
    let text = fs::read_to_string(path).map_err(|source| Error::Config {
        path: path.to_owned(),
        source,
    })?;
    apply_config_str(&text, params).map_err(|err| match err {
        Error::ConfigParse { source, .. } => Error::ConfigParse {
            path: path.to_owned(),
            source,
        },
        other => other,
    })
}

fn apply_config_str(text: &str, params: &mut Params) -> Result<Vec<String>, Error> {
    let cfg: ConfigFile = toml::from_str(text).map_err(|source| Error::ConfigParse {
        path: String::new(),
        source,
    })?;
    for (name, value) in &cfg.params {
        params.set(name, *value)?;
    }
    Ok(cfg.servers)
}

/// Parse a `-B when,freq,phase` triple.
pub fn parse_bump(arg: &str) -> Result<(f64, f64, f64), Error> {
    let bad = || Error::BadBump(arg.to_owned());
    let mut fields = arg.split(',');
    let mut next = || -> Result<f64, Error> {
        fields
            .next()
            .and_then(|f| f.trim().parse().ok())
            .ok_or_else(|| bad())
    };
    let triple = (next()?, next()?, next()?);
    if fields.next().is_some() {
        return Err(bad());
    }
    Ok(triple)
}

/// Report the full parameter set to the trace, like the original records
/// ahead of the data so a replay knows what produced it.
pub fn report_params(tracer: &mut Tracer, params: &Params) {
    for spec in PARAM_SPECS {
        let value = params.get(spec.name).unwrap_or(spec.default);
        trace_rec!(
            tracer,
            "# param {} {} # min {}, max {}, default {}",
            spec.name,
            value,
            spec.min,
            spec.max,
            spec.default
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tweaks_apply_in_order() {
        let mut params = Params::default();
        let tweaks = vec![
            "ntp_filter_threshold=2.5".to_owned(),
            "poll_period=128".to_owned(),
        ];
        assert_eq!(
            apply_tweaks(&mut params, &tweaks).unwrap(),
            TweakOutcome::Applied
        );
        assert_eq!(params.ntp_filter_threshold, 2.5);
        assert_eq!(params.poll_period, 128.0);
    }

    #[test]
    fn bad_tweaks_are_usage_errors() {
        let mut params = Params::default();
        assert!(apply_tweaks(&mut params, &["nope=1".to_owned()]).is_err());
        assert!(apply_tweaks(&mut params, &["poll_period=fast".to_owned()]).is_err());
        assert!(apply_tweaks(&mut params, &["poll_period=1".to_owned()]).is_err());
    }

    #[test]
    fn query_forms_stop_the_run() {
        let mut params = Params::default();
        assert_eq!(
            apply_tweaks(&mut params, &["?".to_owned()]).unwrap(),
            TweakOutcome::QueryHandled
        );
        assert_eq!(
            apply_tweaks(&mut params, &["poll_period".to_owned()]).unwrap(),
            TweakOutcome::QueryHandled
        );
    }

    #[test]
    fn config_file_overrides_and_lists_servers() {
        let mut params = Params::default();
        let servers = apply_config_str(
            "servers = [\"a.example\", \"b.example\"]\n\
             [params]\n\
             poll_period = 256\n\
             combine_quorum = 2\n",
            &mut params,
        )
        .unwrap();
        assert_eq!(servers, vec!["a.example", "b.example"]);
        assert_eq!(params.poll_period, 256.0);
        assert_eq!(params.combine_quorum, 2.0);
    }

    #[test]
    fn config_file_values_are_bounds_checked() {
        let mut params = Params::default();
        assert!(apply_config_str("[params]\npoll_period = 1\n", &mut params).is_err());
        assert!(apply_config_str("[params]\nunknown_knob = 1\n", &mut params).is_err());
    }

    #[test]
    fn bump_triples() {
        assert_eq!(parse_bump("500,1e-4,0.2").unwrap(), (500.0, 1e-4, 0.2));
        assert_eq!(parse_bump("0, -1e-6, -0.1").unwrap(), (0.0, -1e-6, -0.1));
        assert!(parse_bump("500,1e-4").is_err());
        assert!(parse_bump("a,b,c").is_err());
        assert!(parse_bump("1,2,3,4").is_err());
    }

    #[test]
    fn cli_parses_subcommands() {
        use clap::Parser;

        let cli = Cli::parse_from(["clocksteer", "-p", "poll_period=128", "ntp.example"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.client.servers, vec!["ntp.example"]);

        let cli = Cli::parse_from([
            "clocksteer",
            "poll-server",
            "-d",
            "600",
            "-m",
            "mon.example",
            "a.example",
        ]);
        match cli.command {
            Some(Command::PollServer(args)) => {
                assert_eq!(args.duration, 600.0);
                assert_eq!(args.monitor.as_deref(), Some("mon.example"));
                assert_eq!(args.servers, vec!["a.example"]);
            }
            other => panic!("parsed {other:?}"),
        }

        let cli = Cli::parse_from([
            "clocksteer",
            "sim-client",
            "-s",
            "trace.txt",
            "-B",
            "500,1e-4,0.2",
        ]);
        match cli.command {
            Some(Command::SimClient(args)) => {
                assert_eq!(args.simfile, "trace.txt");
                assert_eq!(args.bump, vec!["500,1e-4,0.2"]);
            }
            other => panic!("parsed {other:?}"),
        }
    }
}
