//! velad application.
//!
//! This module contains the top-level structure [`App`] that represents the
//! whole daemon: it loads the configuration, builds the [`Backend`], and
//! serves the line-oriented control interface that remote-control clients
//! speak to.
//!
//! The control protocol is one command per line, answered with one line
//! starting with `ok` or `error`. Connections are served one at a time, so
//! control commands are naturally serialized; `prepare`, `start`, and
//! `stop` never race each other.

use crate::args::Args;
use crate::backend::{Backend, CyclePhase};
use crate::device::{Digitizer, SimDigitizer};
use crate::error::Error;
use crate::status::StatusStore;
use crate::switching::{Phase, SourceSelect, SwitchSource};
use anyhow::{Context, Result};
use chrono::DateTime;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use vela_config::Config;

/// velad application.
pub struct App {
    listener: TcpListener,
    backend: Backend,
}

impl App {
    /// Creates a new application.
    #[tracing::instrument(name = "App::new", level = "debug", skip_all)]
    pub async fn new(args: &Args) -> Result<App> {
        let config = tokio::fs::read_to_string(&args.config)
            .await
            .with_context(|| format!("failed to read {}", args.config.display()))?;
        let config: Config =
            serde_json::from_str(&config).context("failed to parse configuration")?;
        let device: Arc<dyn Digitizer> = if args.simulate {
            Arc::new(SimDigitizer::new())
        } else {
            anyhow::bail!("no hardware transport configured on this host; use --simulate");
        };
        let status = StatusStore::new();
        let backend = Backend::new(&config, device, status)
            .await
            .context("failed to initialize backend")?;
        let listener = TcpListener::bind(args.listen)
            .await
            .with_context(|| format!("failed to bind {}", args.listen))?;
        tracing::info!(listen = %args.listen, bank = %config.bank.name, "control interface up");
        Ok(App { listener, backend })
    }

    /// Runs the application.
    ///
    /// This only returns if accepting a connection fails.
    #[tracing::instrument(name = "App::run", level = "debug", skip_all)]
    pub async fn run(mut self) -> Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            tracing::info!(%peer, "control connection");
            if let Err(err) = self.serve(stream).await {
                tracing::warn!(%peer, %err, "control connection ended with error");
            }
        }
    }

    async fn serve(&mut self, stream: TcpStream) -> Result<()> {
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line == "quit" {
                break;
            }
            let reply = match self.dispatch(line).await {
                Ok(reply) => format!("ok {reply}\n"),
                Err(err) => format!("error {err}\n"),
            };
            write.write_all(reply.as_bytes()).await?;
        }
        Ok(())
    }

    async fn dispatch(&mut self, line: &str) -> std::result::Result<String, Error> {
        let mut words = line.split_whitespace();
        let command = words.next().unwrap_or_default();
        let args: Vec<&str> = words.collect();
        match (command, args.as_slice()) {
            ("set", [name, value]) => {
                self.backend.set_param(name, value)?;
                Ok(format!("{name} = {value}"))
            }
            ("mode", [name]) => {
                self.backend.set_mode(name).await?;
                Ok(format!("mode = {name}"))
            }
            ("prepare", []) => {
                self.backend.prepare()?;
                Ok("prepared".to_string())
            }
            ("start", rest) => {
                let requested = match rest {
                    [] => None,
                    [secs] => {
                        let secs: i64 = secs.parse().map_err(|_| {
                            Error::invalid_parameter("start", format!("{secs} is not a timestamp"))
                        })?;
                        Some(DateTime::from_timestamp(secs, 0).ok_or_else(|| {
                            Error::invalid_parameter("start", "timestamp out of range")
                        })?)
                    }
                    _ => {
                        return Err(Error::invalid_parameter("start", "usage: start [unix-secs]"))
                    }
                };
                let (ok, message) = self.backend.start(requested).await?;
                Ok(format!("{ok} {message}"))
            }
            ("stop", []) => {
                let (ok, message) = self.backend.stop().await?;
                Ok(format!("{ok} {message}"))
            }
            ("monitor", []) => {
                let (ok, message) = self.backend.monitor().await?;
                Ok(format!("{ok} {message}"))
            }
            ("earliest", []) => Ok(self.backend.earliest_start().to_rfc3339()),
            ("status", []) => {
                let status = self.backend.scan_status();
                Ok(serde_json::to_string(&status).expect("status serializes"))
            }
            ("source_select", [cal, sig_ref_1, blanking]) => {
                self.backend.set_source_select(SourceSelect {
                    cal: parse_source(cal)?,
                    sig_ref_1: parse_source(sig_ref_1)?,
                    blanking: parse_source(blanking)?,
                });
                Ok("source select set".to_string())
            }
            ("clear_phases", []) => {
                self.backend.clear_phases();
                Ok("phases cleared".to_string())
            }
            ("add_phase", [spec]) => {
                self.backend.add_phase(parse_phase(spec)?)?;
                Ok("phase added".to_string())
            }
            ("full_cycle", [period, specs @ ..]) if !specs.is_empty() => {
                let period: f64 = period.parse().map_err(|_| {
                    Error::invalid_parameter("full_cycle", format!("{period} is not a period"))
                })?;
                let phases = specs
                    .iter()
                    .map(|s| parse_cycle_phase(s))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                self.backend.set_full_cycle(period, &phases)?;
                Ok("cycle installed".to_string())
            }
            _ => Err(Error::invalid_parameter(
                "command",
                format!(
                    "unknown command {line:?}; commands: set mode prepare start stop monitor \
                     earliest status source_select clear_phases add_phase full_cycle quit"
                ),
            )),
        }
    }
}

// phase spec: <granules>,<blanking>,<cal>,<sr1>,<sr2>,<asr> with 0/1 flags
fn parse_phase(spec: &str) -> std::result::Result<Phase, Error> {
    let fields: Vec<&str> = spec.split(',').collect();
    let [duration, flags @ ..] = fields.as_slice() else {
        return Err(bad_phase(spec));
    };
    if flags.len() != 5 {
        return Err(bad_phase(spec));
    }
    let duration: u32 = duration.parse().map_err(|_| bad_phase(spec))?;
    let flag = |i: usize| -> std::result::Result<bool, Error> {
        match flags[i] {
            "0" => Ok(false),
            "1" => Ok(true),
            _ => Err(bad_phase(spec)),
        }
    };
    Ok(Phase {
        duration,
        blanking: flag(0)?,
        cal: flag(1)?,
        sig_ref_1: flag(2)?,
        sig_ref_2: flag(3)?,
        adv_sig_ref: flag(4)?,
    })
}

// cycle phase spec: <fraction>,<blanking>,<cal>,<sr1>,<sr2>,<asr>
fn parse_cycle_phase(spec: &str) -> std::result::Result<CyclePhase, Error> {
    let fields: Vec<&str> = spec.split(',').collect();
    if fields.len() != 6 {
        return Err(bad_phase(spec));
    }
    let fraction: f64 = fields[0].parse().map_err(|_| bad_phase(spec))?;
    let flag = |i: usize| -> std::result::Result<bool, Error> {
        match fields[i] {
            "0" => Ok(false),
            "1" => Ok(true),
            _ => Err(bad_phase(spec)),
        }
    };
    Ok(CyclePhase {
        fraction,
        blanking: flag(1)?,
        cal: flag(2)?,
        sig_ref_1: flag(3)?,
        sig_ref_2: flag(4)?,
        adv_sig_ref: flag(5)?,
    })
}

fn parse_source(word: &str) -> std::result::Result<SwitchSource, Error> {
    match word {
        "internal" => Ok(SwitchSource::Internal),
        "external" => Ok(SwitchSource::External),
        "manual" => Ok(SwitchSource::Manual),
        _ => Err(Error::invalid_parameter(
            "source_select",
            format!("unknown source {word:?}; legal sources are internal, external, manual"),
        )),
    }
}

fn bad_phase(spec: &str) -> Error {
    Error::invalid_parameter(
        "phase",
        format!("bad phase spec {spec:?}; expected duration,blank,cal,sr1,sr2,asr with 0/1 flags"),
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn phase_spec_parsing() {
        let phase = parse_phase("100,1,0,1,0,0").unwrap();
        assert_eq!(phase.duration, 100);
        assert!(phase.blanking);
        assert!(!phase.cal);
        assert!(phase.sig_ref_1);
        assert!(parse_phase("100,1,0,1").is_err());
        assert!(parse_phase("x,1,0,1,0,0").is_err());
        assert!(parse_phase("100,2,0,1,0,0").is_err());
    }

    #[test]
    fn source_spec_parsing() {
        assert_eq!(parse_source("external").unwrap(), SwitchSource::External);
        assert!(parse_source("EXTERNAL").is_err());
    }

    #[test]
    fn cycle_phase_spec_parsing() {
        let phase = parse_cycle_phase("0.5,0,1,0,0,0").unwrap();
        assert_eq!(phase.fraction, 0.5);
        assert!(phase.cal);
        assert!(parse_cycle_phase("0.5,0,1").is_err());
    }
}
