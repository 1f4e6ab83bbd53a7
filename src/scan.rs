//! Scan timing state machine.
//!
//! Arming a scan has to line up three parties on the same hardware clock
//! edge: the board arms on the PPS tick following its arm register write,
//! the HPC pipeline must already be receiving packets when that edge
//! arrives, and the FITS writer must be ready to consume. The state machine
//! here computes the earliest feasible start second, starts and commands the
//! external processes, polls the status store for readiness within a bounded
//! window, and finally sleeps to a precise pre-PPS instant before triggering
//! the device arm sequence.
//!
//! The two-phase wait is deliberate: the pipeline's startup latency is
//! variable, so it is waited out with a bounded poll, while the final arm
//! must happen at a jitter-free instant, so it is a single computed sleep
//! rather than a poll loop.

use crate::device::Digitizer;
use crate::error::{Error, Result};
use crate::process::Coordinator;
use crate::status::StatusStore;
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;
use vela_config::RegisterCommand;

/// Status key on which the HPC pipeline reports its network receive state.
pub const NET_STATUS_KEY: &str = "NETSTAT";
/// Value of [`NET_STATUS_KEY`] that indicates packets are being received.
pub const NET_STATUS_READY: &str = "receiving";
/// Status key on which the FITS writer reports its disk state.
pub const DISK_STATUS_KEY: &str = "DISKSTAT";

// The device arm must be triggered this margin before the start second, so
// its internal PPS edge detector fires exactly on the start tick. Just
// under one second.
const PRE_ARM_MARGIN: Duration = Duration::from_millis(900);
// Slack added on top of the configured arm delay when computing the
// earliest feasible start.
const SAFETY_MARGIN: Duration = Duration::from_millis(500);
// Status poll tick.
const POLL_TICK: Duration = Duration::from_millis(100);

/// Scan state.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ScanState {
    /// No scan in progress.
    Idle,
    /// A start sequence is in flight.
    Arming,
    /// A scan is taking data.
    Running,
}

/// Scan timing state machine.
///
/// Owns the two process coordinators and drives the device arm sequence.
/// Errors during arming abort back to [`ScanState::Idle`].
pub struct ScanMachine {
    device: Arc<dyn Digitizer>,
    status: StatusStore,
    hpc: Coordinator,
    fits: Option<Coordinator>,
    arm_delay: Duration,
    state: ScanState,
    start_time: Option<DateTime<Utc>>,
    monitoring: bool,
}

impl ScanMachine {
    /// Creates an idle state machine.
    pub fn new(
        device: Arc<dyn Digitizer>,
        status: StatusStore,
        hpc: Coordinator,
        fits: Option<Coordinator>,
        arm_delay: Duration,
    ) -> ScanMachine {
        ScanMachine {
            device,
            status,
            hpc,
            fits,
            arm_delay,
            state: ScanState::Idle,
            start_time: None,
            monitoring: false,
        }
    }

    /// Returns the current scan state.
    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Returns the start time of the running scan, if any.
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    /// Updates the arm delay (changes with the observing mode).
    pub fn set_arm_delay(&mut self, arm_delay: Duration) {
        self.arm_delay = arm_delay;
    }

    /// Returns the earliest feasible scan start time.
    ///
    /// The hardware arms on whole-second PPS ticks, so the result is the
    /// next whole second after now plus the arm delay and a fixed safety
    /// margin.
    pub fn earliest_start(&self) -> DateTime<Utc> {
        earliest_start_after(Utc::now(), self.arm_delay)
    }

    /// Runs the start sequence.
    ///
    /// With no requested time the scan starts at the earliest feasible
    /// second; a requested time is rounded up to the next whole second and
    /// rejected (never clamped) if it leaves too little time to arm.
    /// Expected operational outcomes are returned as `(success, message)`;
    /// timing failures abort with [`Error::Timing`].
    pub async fn start(
        &mut self,
        requested: Option<DateTime<Utc>>,
        arm_phase: &[RegisterCommand],
    ) -> Result<(bool, String)> {
        if self.state == ScanState::Running {
            let since = self
                .start_time
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "unknown".to_string());
            return Ok((false, format!("Scan already started at {since}")));
        }

        let earliest = self.earliest_start();
        let start_time = match requested {
            Some(t) => {
                let t = ceil_to_second(t);
                if t < earliest {
                    return Err(Error::Timing(format!(
                        "not enough time to arm: requested {t}, earliest possible {earliest}"
                    )));
                }
                t
            }
            None => earliest,
        };
        tracing::info!(%start_time, "arming scan");
        self.state = ScanState::Arming;

        if let Err(err) = self.arm(start_time, arm_phase).await {
            self.state = ScanState::Idle;
            let _ = self.hpc.send_command("stop").await;
            return Err(err);
        }

        self.state = ScanState::Running;
        self.start_time = Some(start_time);
        self.status.put("SCANSTAT", "running");
        self.status.put("STRTTIM", start_time.to_rfc3339());
        Ok((true, format!("Scan started at {start_time}")))
    }

    async fn arm(
        &mut self,
        start_time: DateTime<Utc>,
        arm_phase: &[RegisterCommand],
    ) -> Result<()> {
        if !self.hpc.running() {
            self.hpc.start().await?;
        }
        if let Some(fits) = &mut self.fits {
            if !fits.running() {
                fits.start().await?;
            }
        }

        self.hpc
            .send_command(&format!("start {}", start_time.timestamp()))
            .await?;
        if let Some(fits) = &mut self.fits {
            fits.send_command(&format!("start {}", start_time.timestamp()))
                .await?;
        }

        // The readiness window is what remains of the arm delay once the
        // pre-arm margin is reserved for the final sleep.
        let max_wait = self.arm_delay.saturating_sub(PRE_ARM_MARGIN);
        self.wait_for_status(NET_STATUS_KEY, NET_STATUS_READY, max_wait)
            .await?;

        let arm_instant = start_time
            - TimeDelta::from_std(PRE_ARM_MARGIN).expect("margin fits in a TimeDelta");
        let now = Utc::now();
        if now > arm_instant {
            return Err(Error::Timing(format!(
                "deadline missed: arm instant {arm_instant} already passed at {now}"
            )));
        }
        // single continuous sleep; a poll loop here would add jitter
        let remaining = (arm_instant - now).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(remaining).await;

        run_command_phase(self.device.as_ref(), arm_phase).await?;
        Ok(())
    }

    // Polls the status store until `key` reads `ready`, up to `max_wait`
    // measured cumulatively in poll ticks.
    async fn wait_for_status(&self, key: &str, ready: &str, max_wait: Duration) -> Result<()> {
        let mut waited = Duration::ZERO;
        loop {
            if self.status.get(key).as_deref() == Some(ready) {
                return Ok(());
            }
            if waited >= max_wait {
                return Err(Error::Timing(format!(
                    "timed out waiting for {key} = {ready} after {}s",
                    max_wait.as_secs_f64()
                )));
            }
            tokio::time::sleep(POLL_TICK).await;
            waited += POLL_TICK;
        }
    }

    /// Stops the running scan.
    ///
    /// In monitor mode this exits monitoring instead. Idempotent: with no
    /// scan running it reports the fact and has no side effects. A pipeline
    /// process that has already exited is tolerated; the scan still ends.
    pub async fn stop(&mut self) -> Result<(bool, String)> {
        if self.monitoring {
            let _ = self.hpc.send_command("stop").await;
            self.monitoring = false;
            return Ok((true, "Exited monitor mode".to_string()));
        }
        if self.state != ScanState::Running {
            return Ok((false, "No scan running!".to_string()));
        }
        // a crashed pipeline must not leave the machine stuck in Running
        if let Err(err) = self.hpc.send_command("stop").await {
            tracing::warn!(%err, "stop command not delivered");
        }
        if let Some(fits) = &mut self.fits {
            let _ = fits.send_command("stop").await;
        }
        self.state = ScanState::Idle;
        self.start_time = None;
        self.status.put("SCANSTAT", "idle");
        tracing::info!("scan stopped");
        Ok((true, "Scan ended".to_string()))
    }

    /// Puts the pipeline in monitor mode (watching packets without a scan).
    pub async fn monitor(&mut self) -> Result<(bool, String)> {
        if self.state == ScanState::Running {
            return Ok((false, "Cannot monitor while a scan is running".to_string()));
        }
        if !self.hpc.running() {
            self.hpc.start().await?;
        }
        self.hpc.send_command("monitor").await?;
        self.monitoring = true;
        Ok((true, "Monitoring".to_string()))
    }

    /// Stops both managed processes (backend teardown).
    pub async fn shutdown(&mut self) -> Result<()> {
        self.hpc.stop().await?;
        if let Some(fits) = &mut self.fits {
            fits.stop().await?;
        }
        Ok(())
    }
}

/// Runs one device command phase.
///
/// A phase is an ordered list of commands: `wait <seconds>` sleeps, any
/// other name writes the parsed value to that register.
pub async fn run_command_phase(device: &dyn Digitizer, phase: &[RegisterCommand]) -> Result<()> {
    for command in phase {
        if command.register == "wait" {
            let secs: f64 = command.value.parse().map_err(|_| {
                Error::Configuration(format!("bad wait duration {:?}", command.value))
            })?;
            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
        } else {
            let value: u32 = command.value.parse().map_err(|_| {
                Error::Configuration(format!(
                    "bad value {:?} for register {}",
                    command.value, command.register
                ))
            })?;
            device.write_register(&command.register, value)?;
        }
    }
    Ok(())
}

fn ceil_to_second(t: DateTime<Utc>) -> DateTime<Utc> {
    if t.timestamp_subsec_nanos() == 0 {
        t
    } else {
        DateTime::from_timestamp(t.timestamp() + 1, 0).expect("timestamp in range")
    }
}

fn earliest_start_after(now: DateTime<Utc>, arm_delay: Duration) -> DateTime<Utc> {
    let lead = TimeDelta::from_std(arm_delay + SAFETY_MARGIN).expect("delay fits in a TimeDelta");
    ceil_to_second(now + lead)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::SimDigitizer;
    use crate::process::CommandChannel;

    fn machine(status: StatusStore, device: Arc<SimDigitizer>) -> ScanMachine {
        let hpc = Coordinator::new(
            "hpc",
            "/bin/sh",
            vec!["-c".to_string(), "sleep 30".to_string()],
            CommandChannel::Stdin,
        );
        ScanMachine::new(device, status, hpc, None, Duration::from_secs(2))
    }

    fn arm_phase() -> Vec<RegisterCommand> {
        vec![
            RegisterCommand {
                register: "arm".to_string(),
                value: "0".to_string(),
            },
            RegisterCommand {
                register: "arm".to_string(),
                value: "1".to_string(),
            },
        ]
    }

    #[test]
    fn earliest_start_is_pps_aligned() {
        let now = DateTime::from_timestamp(1_000_000, 250_000_000).unwrap();
        let earliest = earliest_start_after(now, Duration::from_secs(2));
        // 1000000.25 + 2.5 = 1000002.75, rounds up to 1000003
        assert_eq!(earliest, DateTime::from_timestamp(1_000_003, 0).unwrap());
        assert_eq!(earliest.timestamp_subsec_nanos(), 0);
        // an exact second is left alone
        let exact = DateTime::from_timestamp(500, 0).unwrap();
        assert_eq!(ceil_to_second(exact), exact);
    }

    #[tokio::test]
    async fn start_rejects_insufficient_lead_time() {
        let status = StatusStore::new();
        let device = Arc::new(SimDigitizer::new());
        let mut scan = machine(status, device);
        let requested = Utc::now() + TimeDelta::seconds(1);
        let err = scan.start(Some(requested), &arm_phase()).await.unwrap_err();
        assert!(matches!(err, Error::Timing(_)));
        assert_eq!(scan.state(), ScanState::Idle);
    }

    #[tokio::test]
    async fn readiness_timeout_aborts_to_idle() {
        let status = StatusStore::new();
        let device = Arc::new(SimDigitizer::new());
        let mut scan = machine(status, device.clone());
        // NETSTAT never becomes ready
        let err = scan.start(None, &arm_phase()).await.unwrap_err();
        assert!(matches!(err, Error::Timing(_)));
        assert_eq!(scan.state(), ScanState::Idle);
        // the device arm sequence never ran
        assert!(device.register("arm").is_none());
        scan.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn full_start_stop_sequence() {
        let status = StatusStore::new();
        status.put(NET_STATUS_KEY, NET_STATUS_READY);
        let device = Arc::new(SimDigitizer::new());
        let mut scan = machine(status.clone(), device.clone());

        let (ok, _msg) = scan.start(None, &arm_phase()).await.unwrap();
        assert!(ok);
        assert_eq!(scan.state(), ScanState::Running);
        assert_eq!(device.register("arm"), Some(1));
        assert_eq!(status.get("SCANSTAT").as_deref(), Some("running"));
        // the committed start time is a whole second in the future-or-now
        assert_eq!(scan.start_time().unwrap().timestamp_subsec_nanos(), 0);

        // a second start reports the running scan instead of re-arming
        let (ok, msg) = scan.start(None, &arm_phase()).await.unwrap();
        assert!(!ok);
        assert!(msg.contains("already started"));

        let (ok, _) = scan.stop().await.unwrap();
        assert!(ok);
        assert_eq!(scan.state(), ScanState::Idle);
        // idempotent stop
        let (ok, msg) = scan.stop().await.unwrap();
        assert!(!ok);
        assert_eq!(msg, "No scan running!");
        scan.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn stop_after_pipeline_crash_returns_to_idle() {
        let status = StatusStore::new();
        status.put(NET_STATUS_KEY, NET_STATUS_READY);
        let device = Arc::new(SimDigitizer::new());
        // the pipeline outlives the arm sequence but dies mid-scan
        let hpc = Coordinator::new(
            "hpc",
            "/bin/sh",
            vec!["-c".to_string(), "sleep 4".to_string()],
            CommandChannel::Stdin,
        );
        let mut scan = ScanMachine::new(device, status, hpc, None, Duration::from_secs(2));

        let (ok, _) = scan.start(None, &arm_phase()).await.unwrap();
        assert!(ok);
        tokio::time::sleep(Duration::from_secs(4)).await;

        let (ok, msg) = scan.stop().await.unwrap();
        assert!(ok);
        assert_eq!(msg, "Scan ended");
        assert_eq!(scan.state(), ScanState::Idle);
        scan.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn command_phase_interpreter() {
        let device = SimDigitizer::new();
        let phase = vec![
            RegisterCommand {
                register: "reset".to_string(),
                value: "1".to_string(),
            },
            RegisterCommand {
                register: "wait".to_string(),
                value: "0.01".to_string(),
            },
            RegisterCommand {
                register: "reset".to_string(),
                value: "0".to_string(),
            },
        ];
        run_command_phase(&device, &phase).await.unwrap();
        assert_eq!(device.register("reset"), Some(0));
        let bad = vec![RegisterCommand {
            register: "reset".to_string(),
            value: "one".to_string(),
        }];
        assert!(run_command_phase(&device, &bad).await.is_err());
    }
}
