use crate::config;
use crate::error::{Error, Result};

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How a launched group ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// Every PE exited successfully
    Success,
    /// `pe` was the first to exit unsuccessfully, every other PE was killed
    Failed { pe: usize, status: ExitStatus },
    /// The wall clock timeout expired, every PE was killed
    TimedOut,
}

impl LaunchOutcome {
    pub fn success(&self) -> bool {
        matches!(self, LaunchOutcome::Success)
    }

    /// Exit code to report for the whole group
    pub fn exit_code(&self) -> i32 {
        match self {
            LaunchOutcome::Success => 0,
            LaunchOutcome::Failed { status, .. } => match status.code() {
                Some(0) | None => 1,
                Some(code) => code,
            },
            LaunchOutcome::TimedOut => 124,
        }
    }
}

/// Starts `num_pes` identical copies of a program on the local host, each told its place
/// in the group through the `DISTMM_*` environment variables, and supervises them.
///
/// There is no partial group: the first PE to fail brings down the others.
#[derive(Debug, Clone)]
pub struct Launcher {
    program: PathBuf,
    args: Vec<OsString>,
    num_pes: usize,
    port: u16,
    job_id: u64,
    timeout: Option<Duration>,
    envs: Vec<(OsString, OsString)>,
}

impl Launcher {
    pub fn new(program: impl Into<PathBuf>, num_pes: usize) -> Launcher {
        Launcher {
            program: program.into(),
            args: Vec::new(),
            num_pes,
            port: config().port,
            job_id: rand::random(),
            timeout: None,
            envs: Vec::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Launcher
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Base port of the group, PE `i` listens on `port + i`
    pub fn port(mut self, port: u16) -> Launcher {
        self.port = port;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Launcher {
        self.timeout = timeout;
        self
    }

    /// Extra environment variable passed to every PE
    pub fn env(mut self, key: impl Into<OsString>, val: impl Into<OsString>) -> Launcher {
        self.envs.push((key.into(), val.into()));
        self
    }

    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    fn command(&self, pe: usize) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .env("DISTMM_BACKEND", "sockets")
            .env("DISTMM_NUM_PES", self.num_pes.to_string())
            .env("DISTMM_PE_ID", pe.to_string())
            .env("DISTMM_JOB_ID", self.job_id.to_string())
            .env("DISTMM_PORT", self.port.to_string());
        cmd
    }

    /// Spawn every PE and block until the group has exited
    #[tracing::instrument(skip_all, fields(num_pes = self.num_pes, job_id = self.job_id))]
    pub fn run(&self) -> Result<LaunchOutcome> {
        if self.num_pes == 0 {
            return Err(Error::GroupJoin(
                "at least one pe must be launched".to_owned(),
            ));
        }
        let mut children: Vec<Option<Child>> = Vec::with_capacity(self.num_pes);
        for pe in 0..self.num_pes {
            match self.command(pe).spawn() {
                Ok(child) => children.push(Some(child)),
                Err(e) => {
                    kill_all(&mut children);
                    return Err(Error::GroupJoin(format!(
                        "unable to start pe {} ({}): {}",
                        pe,
                        self.program.display(),
                        e
                    )));
                }
            }
        }
        debug!("launched {:?} pes of {:?}", self.num_pes, self.program);

        let start = Instant::now();
        loop {
            let mut running = 0;
            let mut failure = None;
            for (pe, slot) in children.iter_mut().enumerate() {
                let Some(child) = slot.as_mut() else { continue };
                match child.try_wait() {
                    Ok(Some(status)) => {
                        *slot = None;
                        if status.success() {
                            debug!("pe {:?} exited", pe);
                        } else {
                            failure = Some(Ok(LaunchOutcome::Failed { pe, status }));
                            break;
                        }
                    }
                    Ok(None) => running += 1,
                    Err(e) => {
                        failure = Some(Err(Error::from(e)));
                        break;
                    }
                }
            }
            if let Some(outcome) = failure {
                if let Ok(LaunchOutcome::Failed { pe, status }) = &outcome {
                    error!("pe {:?} failed ({}), terminating the group", pe, status);
                }
                kill_all(&mut children);
                return outcome;
            }
            if running == 0 {
                return Ok(LaunchOutcome::Success);
            }
            if let Some(timeout) = self.timeout {
                if start.elapsed() >= timeout {
                    error!("group still running after {:?}, terminating", timeout);
                    kill_all(&mut children);
                    return Ok(LaunchOutcome::TimedOut);
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

fn kill_all(children: &mut [Option<Child>]) {
    for (pe, slot) in children.iter_mut().enumerate() {
        if let Some(mut child) = slot.take() {
            if let Err(e) = child.kill() {
                warn!("unable to kill pe {:?}: {}", pe, e);
            }
            let _ = child.wait();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn all_pes_succeed() {
        let outcome = Launcher::new("true", 3).run().unwrap();
        assert_eq!(outcome, LaunchOutcome::Success);
        assert_eq!(outcome.exit_code(), 0);
    }

    #[test]
    fn first_failure_ends_the_group() {
        let start = Instant::now();
        let outcome = Launcher::new("sh", 3)
            .args(["-c", "if [ \"$DISTMM_PE_ID\" = 1 ]; then exit 3; fi; sleep 30"])
            .run()
            .unwrap();
        match outcome {
            LaunchOutcome::Failed { pe, status } => {
                assert_eq!(pe, 1);
                assert_eq!(status.code(), Some(3));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(outcome.exit_code(), 3);
        assert!(start.elapsed() < Duration::from_secs(20));
    }

    #[test]
    fn timeout_kills_everything() {
        let outcome = Launcher::new("sleep", 2)
            .args(["30"])
            .timeout(Some(Duration::from_millis(200)))
            .run()
            .unwrap();
        assert_eq!(outcome, LaunchOutcome::TimedOut);
        assert_eq!(outcome.exit_code(), 124);
    }

    #[test]
    fn group_env_contract() {
        let launcher = Launcher::new("env", 2).port(20100);
        let cmd = launcher.command(1);
        let envs = cmd
            .get_envs()
            .filter_map(|(k, v)| Some((k.to_str()?.to_owned(), v?.to_str()?.to_owned())))
            .collect::<Vec<_>>();
        assert!(envs.contains(&("DISTMM_PE_ID".to_owned(), "1".to_owned())));
        assert!(envs.contains(&("DISTMM_NUM_PES".to_owned(), "2".to_owned())));
        assert!(envs.contains(&("DISTMM_PORT".to_owned(), "20100".to_owned())));
        assert!(envs.contains(&("DISTMM_BACKEND".to_owned(), "sockets".to_owned())));
        assert!(envs.contains(&("DISTMM_JOB_ID".to_owned(), launcher.job_id().to_string())));
    }

    #[test]
    fn missing_program_is_a_join_failure() {
        let res = Launcher::new("/nonexistent/distmm", 2).run();
        assert!(matches!(res, Err(Error::GroupJoin(_))));
    }
}
