//! Command bus for runtime control of the router
//!
//! Commands are plain data so they can be scripted (serde) or typed at a
//! prompt ([`Action`]'s `FromStr`). [`AudioRouter::execute`] applies them.

use crate::domain::channels::ChannelId;
use crate::domain::graph::PlaybackMode;
use crate::domain::registry::{AudioRouter, GroupId, InstanceStatus, TrackId};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

/// Errors parsing a command line
#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("unknown command: {0}")]
    Unknown(String),

    #[error("missing argument: {0}")]
    MissingArgument(&'static str),

    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument { arg: String, reason: String },
}

/// Control operation on one routing graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Play {
        #[serde(default)]
        channel: Option<ChannelId>,
    },
    Stop {
        #[serde(default)]
        channel: Option<ChannelId>,
    },
    Mute {
        #[serde(default)]
        channel: Option<ChannelId>,
    },
    Unmute {
        #[serde(default)]
        channel: Option<ChannelId>,
    },
    SetGain {
        value: f32,
        #[serde(default)]
        channel: Option<ChannelId>,
    },
    Disconnect,
}

fn parse_channel(arg: Option<&str>) -> Result<Option<ChannelId>, CommandError> {
    arg.map(|arg| {
        arg.parse::<u32>()
            .map(ChannelId::new)
            .map_err(|e| CommandError::InvalidArgument {
                arg: arg.to_string(),
                reason: e.to_string(),
            })
    })
    .transpose()
}

impl FromStr for Action {
    type Err = CommandError;

    /// `play [ch]`, `stop [ch]`, `mute [ch]`, `unmute [ch]`,
    /// `gain <value> [ch]`, `disconnect`
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let name = words.next().ok_or(CommandError::Empty)?;
        let action = match name.to_ascii_lowercase().as_str() {
            "play" => Self::Play {
                channel: parse_channel(words.next())?,
            },
            "stop" => Self::Stop {
                channel: parse_channel(words.next())?,
            },
            "mute" => Self::Mute {
                channel: parse_channel(words.next())?,
            },
            "unmute" => Self::Unmute {
                channel: parse_channel(words.next())?,
            },
            "gain" => {
                let raw = words.next().ok_or(CommandError::MissingArgument("value"))?;
                let value = raw.parse::<f32>().map_err(|e| CommandError::InvalidArgument {
                    arg: raw.to_string(),
                    reason: e.to_string(),
                })?;
                if !value.is_finite() || value < 0.0 {
                    return Err(CommandError::InvalidArgument {
                        arg: raw.to_string(),
                        reason: "gain must be a finite, non-negative number".to_string(),
                    });
                }
                Self::SetGain {
                    value,
                    channel: parse_channel(words.next())?,
                }
            }
            "disconnect" => Self::Disconnect,
            other => return Err(CommandError::Unknown(other.to_string())),
        };

        if let Some(extra) = words.next() {
            return Err(CommandError::InvalidArgument {
                arg: extra.to_string(),
                reason: "unexpected trailing argument".to_string(),
            });
        }
        Ok(action)
    }
}

/// Command types for runtime state management
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    AddInstance {
        group: GroupId,
        track: TrackId,
        #[serde(default)]
        mode: PlaybackMode,
    },
    Control {
        group: GroupId,
        track: TrackId,
        #[serde(flatten)]
        action: Action,
    },
    RemoveInstance {
        group: GroupId,
        track: TrackId,
    },
}

impl Command {
    pub fn control(group: GroupId, track: TrackId, action: Action) -> Self {
        Self::Control {
            group,
            track,
            action,
        }
    }
}

/// Result of command execution
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CommandResult {
    InstanceAdded(InstanceStatus),
    StateChanged(InstanceStatus),
    InstanceRemoved { group: GroupId, track: TrackId },
    Error { message: String },
}

impl CommandResult {
    fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

impl AudioRouter {
    pub fn execute(&mut self, command: Command) -> CommandResult {
        let result = match command {
            Command::AddInstance { group, track, mode } => {
                self.add_instance(group.clone(), track.clone(), mode);
                self.instance_status(&group, &track)
                    .map(CommandResult::InstanceAdded)
                    .unwrap_or_else(|| CommandResult::error("instance vanished after add"))
            }
            Command::Control {
                group,
                track,
                action,
            } => self.apply(&group, &track, action),
            Command::RemoveInstance { group, track } => match self.remove_instance(&group, &track)
            {
                Ok(true) => CommandResult::InstanceRemoved { group, track },
                Ok(false) => CommandResult::error(format!("no instance {group}/{track}")),
                Err(e) => CommandResult::error(e.to_string()),
            },
        };

        if let CommandResult::Error { message } = &result {
            warn!(%message, "Command failed");
        }
        result
    }

    fn apply(&mut self, group: &GroupId, track: &TrackId, action: Action) -> CommandResult {
        let Some(graph) = self.instance_mut(group, track) else {
            return CommandResult::error(format!("no instance {group}/{track}"));
        };

        let outcome = match action {
            Action::Play { channel } => graph.play(channel),
            Action::Stop { channel } => graph.stop(channel),
            Action::Mute { channel } => graph.mute(channel),
            Action::Unmute { channel } => graph.unmute(channel),
            Action::SetGain { value, channel } => graph.set_gain(value, channel),
            Action::Disconnect => graph.disconnect(),
        };

        match outcome {
            Ok(()) => self
                .instance_status(group, track)
                .map(CommandResult::StateChanged)
                .unwrap_or_else(|| CommandResult::error(format!("no instance {group}/{track}"))),
            Err(e) => CommandResult::error(e.to_string()),
        }
    }
}
