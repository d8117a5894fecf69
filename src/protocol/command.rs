//! Command table for the binary protocol.
//!
//! Each command carries a fixed wire code, a count of NUL-separated
//! textual arguments, and a flag marking whether a trailing opaque data
//! block follows the arguments. The table covers the client side of the
//! protocol; worker-only codes decode as `InvalidCommand`.

use crate::error::{Error, Result};

/// Protocol commands understood by the client runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Submit a foreground job at normal priority.
    SubmitJob,
    /// Server reply binding a job handle to a submit.
    JobCreated,
    /// Progress push: handle, numerator, denominator.
    WorkStatus,
    /// Terminal push carrying the job result.
    WorkComplete,
    /// Terminal push marking the job failed.
    WorkFail,
    /// Request the status of a background job by handle.
    GetStatus,
    /// Echo request; the payload is returned verbatim.
    EchoReq,
    /// Echo response.
    EchoRes,
    /// Submit a background job at normal priority.
    SubmitJobBg,
    /// Server-side error report: code string plus text.
    Error,
    /// Reply to `GetStatus`: handle, known, running, numerator,
    /// denominator.
    StatusRes,
    /// Submit a foreground job at high priority.
    SubmitJobHigh,
    /// Terminal push marking a job exception (opt-in server side).
    WorkException,
    /// Intermediate data push for a foreground job.
    WorkData,
    /// Warning push for a foreground job.
    WorkWarning,
    /// Submit a background job at high priority.
    SubmitJobHighBg,
    /// Submit a foreground job at low priority.
    SubmitJobLow,
    /// Submit a background job at low priority.
    SubmitJobLowBg,
    /// Submit a background job on a calendar schedule.
    SubmitJobSched,
    /// Submit a background job eligible at a future Unix timestamp.
    SubmitJobEpoch,
}

impl Command {
    /// The wire code for this command.
    #[inline]
    pub fn code(self) -> u32 {
        match self {
            Command::SubmitJob => 7,
            Command::JobCreated => 8,
            Command::WorkStatus => 12,
            Command::WorkComplete => 13,
            Command::WorkFail => 14,
            Command::GetStatus => 15,
            Command::EchoReq => 16,
            Command::EchoRes => 17,
            Command::SubmitJobBg => 18,
            Command::Error => 19,
            Command::StatusRes => 20,
            Command::SubmitJobHigh => 21,
            Command::WorkException => 25,
            Command::WorkData => 28,
            Command::WorkWarning => 29,
            Command::SubmitJobHighBg => 32,
            Command::SubmitJobLow => 33,
            Command::SubmitJobLowBg => 34,
            Command::SubmitJobSched => 35,
            Command::SubmitJobEpoch => 36,
        }
    }

    /// Look a command up by wire code.
    pub fn from_code(code: u32) -> Result<Self> {
        Ok(match code {
            7 => Command::SubmitJob,
            8 => Command::JobCreated,
            12 => Command::WorkStatus,
            13 => Command::WorkComplete,
            14 => Command::WorkFail,
            15 => Command::GetStatus,
            16 => Command::EchoReq,
            17 => Command::EchoRes,
            18 => Command::SubmitJobBg,
            19 => Command::Error,
            20 => Command::StatusRes,
            21 => Command::SubmitJobHigh,
            25 => Command::WorkException,
            28 => Command::WorkData,
            29 => Command::WorkWarning,
            32 => Command::SubmitJobHighBg,
            33 => Command::SubmitJobLow,
            34 => Command::SubmitJobLowBg,
            35 => Command::SubmitJobSched,
            36 => Command::SubmitJobEpoch,
            _ => return Err(Error::InvalidCommand),
        })
    }

    /// Protocol name, as it appears in server logs.
    pub fn name(self) -> &'static str {
        match self {
            Command::SubmitJob => "SUBMIT_JOB",
            Command::JobCreated => "JOB_CREATED",
            Command::WorkStatus => "WORK_STATUS",
            Command::WorkComplete => "WORK_COMPLETE",
            Command::WorkFail => "WORK_FAIL",
            Command::GetStatus => "GET_STATUS",
            Command::EchoReq => "ECHO_REQ",
            Command::EchoRes => "ECHO_RES",
            Command::SubmitJobBg => "SUBMIT_JOB_BG",
            Command::Error => "ERROR",
            Command::StatusRes => "STATUS_RES",
            Command::SubmitJobHigh => "SUBMIT_JOB_HIGH",
            Command::WorkException => "WORK_EXCEPTION",
            Command::WorkData => "WORK_DATA",
            Command::WorkWarning => "WORK_WARNING",
            Command::SubmitJobHighBg => "SUBMIT_JOB_HIGH_BG",
            Command::SubmitJobLow => "SUBMIT_JOB_LOW",
            Command::SubmitJobLowBg => "SUBMIT_JOB_LOW_BG",
            Command::SubmitJobSched => "SUBMIT_JOB_SCHED",
            Command::SubmitJobEpoch => "SUBMIT_JOB_EPOCH",
        }
    }

    /// Number of NUL-separated textual arguments (the opaque data block
    /// is not counted).
    #[inline]
    pub fn arg_count(self) -> usize {
        match self {
            Command::EchoReq | Command::EchoRes => 0,
            Command::JobCreated
            | Command::GetStatus
            | Command::WorkComplete
            | Command::WorkFail
            | Command::WorkException
            | Command::WorkData
            | Command::WorkWarning => 1,
            Command::SubmitJob
            | Command::SubmitJobBg
            | Command::SubmitJobHigh
            | Command::SubmitJobHighBg
            | Command::SubmitJobLow
            | Command::SubmitJobLowBg
            | Command::Error => 2,
            Command::WorkStatus | Command::SubmitJobEpoch => 3,
            Command::StatusRes => 5,
            Command::SubmitJobSched => 7,
        }
    }

    /// Whether a trailing opaque data block follows the arguments.
    #[inline]
    pub fn has_data(self) -> bool {
        match self {
            Command::SubmitJob
            | Command::SubmitJobBg
            | Command::SubmitJobHigh
            | Command::SubmitJobHighBg
            | Command::SubmitJobLow
            | Command::SubmitJobLowBg
            | Command::SubmitJobSched
            | Command::SubmitJobEpoch
            | Command::EchoReq
            | Command::EchoRes
            | Command::WorkComplete
            | Command::WorkException
            | Command::WorkData
            | Command::WorkWarning => true,
            Command::JobCreated
            | Command::WorkStatus
            | Command::WorkFail
            | Command::GetStatus
            | Command::Error
            | Command::StatusRes => false,
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Command; 20] = [
        Command::SubmitJob,
        Command::JobCreated,
        Command::WorkStatus,
        Command::WorkComplete,
        Command::WorkFail,
        Command::GetStatus,
        Command::EchoReq,
        Command::EchoRes,
        Command::SubmitJobBg,
        Command::Error,
        Command::StatusRes,
        Command::SubmitJobHigh,
        Command::WorkException,
        Command::WorkData,
        Command::WorkWarning,
        Command::SubmitJobHighBg,
        Command::SubmitJobLow,
        Command::SubmitJobLowBg,
        Command::SubmitJobSched,
        Command::SubmitJobEpoch,
    ];

    #[test]
    fn test_code_roundtrip() {
        for cmd in ALL {
            assert_eq!(Command::from_code(cmd.code()).unwrap(), cmd);
        }
    }

    #[test]
    fn test_worker_codes_rejected() {
        // CAN_DO, GRAB_JOB, JOB_ASSIGN are worker-side only.
        for code in [1, 9, 11, 0, 9999] {
            assert!(matches!(
                Command::from_code(code),
                Err(Error::InvalidCommand)
            ));
        }
    }

    #[test]
    fn test_submit_arity() {
        assert_eq!(Command::SubmitJob.arg_count(), 2);
        assert!(Command::SubmitJob.has_data());
        assert_eq!(Command::SubmitJobEpoch.arg_count(), 3);
        assert_eq!(Command::SubmitJobSched.arg_count(), 7);
    }

    #[test]
    fn test_status_res_arity() {
        assert_eq!(Command::StatusRes.arg_count(), 5);
        assert!(!Command::StatusRes.has_data());
    }

    #[test]
    fn test_echo_is_pure_data() {
        assert_eq!(Command::EchoReq.arg_count(), 0);
        assert!(Command::EchoReq.has_data());
        assert_eq!(Command::EchoRes.arg_count(), 0);
        assert!(Command::EchoRes.has_data());
    }

    #[test]
    fn test_names_match_protocol() {
        assert_eq!(Command::SubmitJobEpoch.name(), "SUBMIT_JOB_EPOCH");
        assert_eq!(Command::WorkComplete.to_string(), "WORK_COMPLETE");
    }
}
