//! Connection Messages
//!
//! Envelopes exchanged with the imports UI over its message channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ImportError;
use crate::types::{AllowTypes, EstimateCounts, ImportOptions, ItemResult};

/// Command names understood on the imports connection.
pub mod cmds {
    pub const INIT: &str = "INIT";
    pub const START: &str = "START";
    pub const RESUME: &str = "RESUME";
    pub const PAUSE: &str = "PAUSE";
    pub const CANCEL: &str = "CANCEL";
    pub const FINISH: &str = "FINISH";
    pub const RECALC: &str = "RECALC";
    pub const SET_CONCURRENCY: &str = "SET_CONCURRENCY";
    pub const SET_PROCESS_ERRS: &str = "SET_PROCESS_ERRS";
    pub const NEXT: &str = "NEXT";
    pub const COMPLETE: &str = "COMPLETE";
}

/// Raw inbound envelope `{cmd, payload}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InboundMessage {
    pub cmd: String,
    #[serde(default)]
    pub payload: Value,
}

impl InboundMessage {
    pub fn new(cmd: impl Into<String>, payload: Value) -> Self {
        Self {
            cmd: cmd.into(),
            payload,
        }
    }
}

/// Payload of START.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPayload {
    #[serde(default)]
    pub allow_types: AllowTypes,
    #[serde(default)]
    pub blob_url: Option<String>,
    #[serde(default)]
    pub options: ImportOptions,
}

/// Payload of RECALC.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecalcPayload {
    #[serde(default)]
    pub allow_types: Option<AllowTypes>,
    #[serde(default)]
    pub blob_url: Option<String>,
}

/// Decoded UI command.
#[derive(Clone, Debug, PartialEq)]
pub enum ImportCommand {
    Start(StartPayload),
    Resume,
    Pause,
    Cancel,
    Finish,
    Recalc(RecalcPayload),
    SetConcurrency(usize),
    SetProcessErrs(bool),
}

impl ImportCommand {
    /// Decode an inbound envelope.
    pub fn from_message(message: InboundMessage) -> Result<Self, ImportError> {
        let InboundMessage { cmd, payload } = message;

        let command = match cmd.as_str() {
            cmds::START => Self::Start(decode_payload(&cmd, payload)?),
            cmds::RESUME => Self::Resume,
            cmds::PAUSE => Self::Pause,
            cmds::CANCEL => Self::Cancel,
            cmds::FINISH => Self::Finish,
            cmds::RECALC => Self::Recalc(decode_payload(&cmd, payload)?),
            cmds::SET_CONCURRENCY => Self::SetConcurrency(decode_payload(&cmd, payload)?),
            cmds::SET_PROCESS_ERRS => Self::SetProcessErrs(decode_payload(&cmd, payload)?),
            _ => return Err(ImportError::UnknownCommand { cmd }),
        };

        Ok(command)
    }

    /// Wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start(_) => cmds::START,
            Self::Resume => cmds::RESUME,
            Self::Pause => cmds::PAUSE,
            Self::Cancel => cmds::CANCEL,
            Self::Finish => cmds::FINISH,
            Self::Recalc(_) => cmds::RECALC,
            Self::SetConcurrency(_) => cmds::SET_CONCURRENCY,
            Self::SetProcessErrs(_) => cmds::SET_PROCESS_ERRS,
        }
    }
}

fn decode_payload<T: serde::de::DeserializeOwned + Default>(
    cmd: &str,
    payload: Value,
) -> Result<T, ImportError> {
    if payload.is_null() {
        return Ok(T::default());
    }

    serde_json::from_value(payload).map_err(|e| ImportError::InvalidPayload {
        cmd: cmd.to_string(),
        message: e.to_string(),
    })
}

/// Outbound envelope sent to the UI.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboundMessage {
    Init(EstimateCounts),
    Pause,
    Start,
    Next(ItemResult),
    Complete,
}
