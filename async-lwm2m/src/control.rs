// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Typed control commands, as read line by line from the driver's stdin.
//!
//! ```
//! # use async_lwm2m::control::*;
//! assert_eq!(
//!     Ok(ControlCommand::EnterOffline(TransportFamily::Udp)),
//!     "enter-offline udp".parse()
//! );
//! ```

use super::*;
use std::path::PathBuf;
use std::str::FromStr;

/// Transports a command applies to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TransportFamily {
    /// UDP and DTLS.
    Udp,
    /// TCP and TLS.
    Tcp,
    /// Every transport.
    All,
}

impl TransportFamily {
    /// True if `kind` belongs to this family.
    pub fn matches(self, kind: TransportKind) -> bool {
        match self {
            TransportFamily::Udp => !kind.is_stream(),
            TransportFamily::Tcp => kind.is_stream(),
            TransportFamily::All => true,
        }
    }
}

impl FromStr for TransportFamily {
    type Err = ControlParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "udp" | "dtls" => Ok(TransportFamily::Udp),
            "tcp" | "tls" => Ok(TransportFamily::Tcp),
            "all" => Ok(TransportFamily::All),
            _ => Err(ControlParseError::InvalidArgument(s.to_string())),
        }
    }
}

/// A command for the running client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Stop using the network on some transports.
    EnterOffline(TransportFamily),
    /// Resume using the network on some transports.
    ExitOffline(TransportFamily),
    /// Pause the download into an update object instance.
    SuspendDownload(Lwm2mPath),
    /// Resume a paused download.
    ResumeDownload(Lwm2mPath),
    /// Store later firmware packages at this path.
    SetFwPackagePath(PathBuf),
    /// Print the number of firmware package bytes stored.
    GetFwOffset,
    /// Print the seconds until a delayed or deferred firmware result falls due.
    GetFwDeadline,
    /// Send a Registration Update now.
    SendUpdate,
    /// Deregister from every server beyond the first `n`.
    TrimServers(usize),
    /// Register with another server.
    AddServer(String),
    /// Reset the transports and refresh every registration.
    Reconnect,
    /// Send the firmware state and result with a LwM2M Send.
    Send,
    /// Deregister and exit.
    Quit,
}

/// Why a control line could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlParseError {
    /// The line holds no command.
    #[error("empty command")]
    Empty,

    /// The command is not known.
    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    /// A required argument is absent.
    #[error("missing argument: {0}")]
    MissingArgument(&'static str),

    /// An argument has the wrong form.
    #[error("invalid argument {0:?}")]
    InvalidArgument(String),

    /// More arguments than the command takes.
    #[error("unexpected argument {0:?}")]
    TrailingArgument(String),
}

/// Parses a download target: an instance path such as `/33629/1`, or a
/// bare instance id of the Advanced Firmware Update object. The Firmware
/// Update instance when absent.
fn download_target(arg: Option<&str>) -> Result<Lwm2mPath, ControlParseError> {
    let arg = match arg {
        None => return Ok(Lwm2mPath::instance(OID_FIRMWARE_UPDATE, 0)),
        Some(arg) => arg,
    };
    let invalid = || ControlParseError::InvalidArgument(arg.to_string());

    if let Ok(iid) = arg.parse::<u16>() {
        return Ok(Lwm2mPath::instance(OID_ADVANCED_FIRMWARE_UPDATE, iid));
    }
    let path: Lwm2mPath = arg.parse().map_err(|_| invalid())?;
    match (path.oid(), path.iid(), path.rid()) {
        (Some(_), Some(_), None) => Ok(path),
        _ => Err(invalid()),
    }
}

fn family(arg: Option<&str>) -> Result<TransportFamily, ControlParseError> {
    arg.map(str::parse).unwrap_or(Ok(TransportFamily::All))
}

impl FromStr for ControlCommand {
    type Err = ControlParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let name = words.next().ok_or(ControlParseError::Empty)?;
        let arg = words.next();

        let command = match name {
            "enter-offline" => ControlCommand::EnterOffline(family(arg)?),
            "exit-offline" => ControlCommand::ExitOffline(family(arg)?),
            "suspend-download" => ControlCommand::SuspendDownload(download_target(arg)?),
            "resume-download" => ControlCommand::ResumeDownload(download_target(arg)?),
            "set-fw-package-path" => ControlCommand::SetFwPackagePath(PathBuf::from(
                arg.ok_or(ControlParseError::MissingArgument("path"))?,
            )),
            "get-fw-offset" => ControlCommand::GetFwOffset,
            "get-fw-deadline" => ControlCommand::GetFwDeadline,
            "send-update" => ControlCommand::SendUpdate,
            "trim-servers" => {
                let n = arg.ok_or(ControlParseError::MissingArgument("count"))?;
                ControlCommand::TrimServers(
                    n.parse()
                        .map_err(|_| ControlParseError::InvalidArgument(n.to_string()))?,
                )
            }
            "add-server" => ControlCommand::AddServer(
                arg.ok_or(ControlParseError::MissingArgument("uri"))?
                    .to_string(),
            ),
            "reconnect" => ControlCommand::Reconnect,
            "send" => ControlCommand::Send,
            "quit" | "exit" => ControlCommand::Quit,
            _ => return Err(ControlParseError::UnknownCommand(name.to_string())),
        };

        let takes_arg = matches!(
            command,
            ControlCommand::EnterOffline(_)
                | ControlCommand::ExitOffline(_)
                | ControlCommand::SuspendDownload(_)
                | ControlCommand::ResumeDownload(_)
                | ControlCommand::SetFwPackagePath(_)
                | ControlCommand::TrimServers(_)
                | ControlCommand::AddServer(_)
        );
        let extra = if takes_arg { words.next() } else { arg };
        if let Some(extra) = extra {
            return Err(ControlParseError::TrailingArgument(extra.to_string()));
        }

        Ok(command)
    }
}
