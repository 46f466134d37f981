//! Worker launch arguments and exit codes.
//!
//! The host passes everything the worker needs as `-K=V` tokens:
//!
//! | key | meaning                          |
//! |-----|----------------------------------|
//! | `S` | host → worker mailbox name       |
//! | `C` | worker → host mailbox name       |
//! | `P` | shutdown event name              |
//! | `X` | host process id                  |
//! | `A` | hosted type module (optional)    |
//! | `R` | hosted type name (optional)      |

use serde::{Deserialize, Serialize};

use crate::bridge::protocol::TypeRef;
use crate::channel::ChannelNames;

pub const KEY_SERVER: &str = "S";
pub const KEY_CLIENT: &str = "C";
pub const KEY_SHUTDOWN: &str = "P";
pub const KEY_PARENT_PID: &str = "X";
pub const KEY_HOSTED_MODULE: &str = "A";
pub const KEY_HOSTED_NAME: &str = "R";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ArgumentsError {
    #[error("missing required argument -{0}")]
    Missing(&'static str),

    #[error("invalid parent process id '{0}'")]
    InvalidPid(String),
}

/// Everything a worker needs to attach to its host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessArguments {
    pub server_name: String,
    pub client_name: String,
    pub shutdown_event: String,
    pub parent_pid: u32,
    pub hosted: Option<TypeRef>,
}

impl ProcessArguments {
    /// Arguments for a worker of the current process.
    pub fn for_session(session: &str, hosted: Option<TypeRef>) -> Self {
        let names = ChannelNames::for_session(session);
        Self {
            server_name: names.server,
            client_name: names.client,
            shutdown_event: format!("{session}_Process"),
            parent_pid: std::process::id(),
            hosted,
        }
    }

    pub fn channel_names(&self) -> ChannelNames {
        ChannelNames::new(&self.server_name, &self.client_name)
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("-{KEY_SERVER}={}", self.server_name),
            format!("-{KEY_CLIENT}={}", self.client_name),
            format!("-{KEY_SHUTDOWN}={}", self.shutdown_event),
            format!("-{KEY_PARENT_PID}={}", self.parent_pid),
        ];
        if let Some(hosted) = &self.hosted {
            args.push(format!("-{KEY_HOSTED_MODULE}={}", hosted.module));
            args.push(format!("-{KEY_HOSTED_NAME}={}", hosted.name));
        }
        args
    }

    /// Parse `-K=V` tokens. Unknown keys and stray tokens are ignored.
    pub fn parse<I, S>(args: I) -> Result<Self, ArgumentsError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut server = None;
        let mut client = None;
        let mut shutdown = None;
        let mut parent = None;
        let mut module = None;
        let mut name = None;

        for arg in args {
            let Some((key, value)) = arg.as_ref().split_once('=') else {
                continue;
            };
            let value = value.trim().to_string();
            match key.trim().trim_start_matches('-') {
                KEY_SERVER => server = Some(value),
                KEY_CLIENT => client = Some(value),
                KEY_SHUTDOWN => shutdown = Some(value),
                KEY_PARENT_PID => parent = Some(value),
                KEY_HOSTED_MODULE => module = Some(value),
                KEY_HOSTED_NAME => name = Some(value),
                _ => {}
            }
        }

        let required = |value: Option<String>, key: &'static str| {
            value
                .filter(|v| !v.is_empty())
                .ok_or(ArgumentsError::Missing(key))
        };

        let server_name = required(server, KEY_SERVER)?;
        let client_name = required(client, KEY_CLIENT)?;
        let shutdown_event = required(shutdown, KEY_SHUTDOWN)?;
        let parent = required(parent, KEY_PARENT_PID)?;
        let parent_pid = parent
            .parse()
            .map_err(|_| ArgumentsError::InvalidPid(parent.clone()))?;

        let hosted = name
            .filter(|n| !n.is_empty())
            .map(|name| TypeRef::new(module.unwrap_or_default(), name));

        Ok(Self {
            server_name,
            client_name,
            shutdown_event,
            parent_pid,
            hosted,
        })
    }
}

impl std::fmt::Display for ProcessArguments {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_args().join(" "))
    }
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitCode {
    Undefined,
    ErrorCrash,
    ErrorParentCrash,
    Ok,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        match self {
            Self::Undefined => 0,
            Self::ErrorCrash => -1,
            Self::ErrorParentCrash => -2,
            Self::Ok => 1,
        }
    }

    /// Map a raw status. Unix truncates to 8 bits, so -1 arrives as 255.
    pub fn from_raw(code: i32) -> Self {
        match code {
            1 => Self::Ok,
            0 => Self::Undefined,
            -2 | 254 => Self::ErrorParentCrash,
            _ => Self::ErrorCrash,
        }
    }

    /// Killed by a signal counts as a crash.
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        status.code().map_or(Self::ErrorCrash, Self::from_raw)
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Undefined => "undefined",
            Self::ErrorCrash => "crash",
            Self::ErrorParentCrash => "parent crash",
            Self::Ok => "ok",
        };
        write!(f, "{name} ({})", self.code())
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        std::process::ExitCode::from(code.code() as u8)
    }
}
