//! Cloud lifecycle message parsing.
//!
//! The queue delivers JSON bodies of the form
//! `{"kind": "Launch", "asgName": "...", "instanceId": "...", "time": "..."}`.
//! Unknown fields are ignored; missing required fields are a parse error.
//! Kinds other than Launch/Terminate parse fine and interpret to no-ops.

use serde::Deserialize;

use crate::error::{LifecycleError, LifecycleResult};

/// A parsed lifecycle message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudMessage {
    pub kind: String,
    pub asg: String,
    pub instance_id: String,
    pub time: String,
}

#[derive(Deserialize)]
struct RawMessage {
    kind: Option<String>,
    #[serde(rename = "asgName")]
    asg_name: Option<String>,
    #[serde(rename = "instanceId")]
    instance_id: Option<String>,
    time: Option<String>,
}

pub fn parse_message(body: &str) -> LifecycleResult<CloudMessage> {
    let raw: RawMessage =
        serde_json::from_str(body).map_err(|e| LifecycleError::MessageParse(e.to_string()))?;

    let kind = required(raw.kind, "kind")?;
    let asg = required(raw.asg_name, "asgName")?;
    let instance_id = required(raw.instance_id, "instanceId")?;
    let time = required(raw.time, "time")?;

    Ok(CloudMessage {
        kind,
        asg,
        instance_id,
        time,
    })
}

fn required(field: Option<String>, name: &str) -> LifecycleResult<String> {
    field.ok_or_else(|| LifecycleError::MessageParse(format!("missing field: {name}")))
}
