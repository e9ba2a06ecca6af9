//! Typed access to a sample-changer device.
//!
//! [`DeviceIo`] wraps a [`ChangerDevice`] with the configured channel and
//! command names and converts raw JSON channel values into typed readings.
//! Every transport failure becomes [`ScError::Communication`] naming the
//! channel or command involved.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;

use sc_core::capabilities::{ChangerDevice, ChannelUpdate, TaskId};
use sc_core::error::{ScError, ScResult};
use sc_core::state::{SampleChangerState, StateMap};

use crate::config::{available, ChangerConfig, ChannelNames, CommandNames};

/// Channel/command access for one changer.
pub struct DeviceIo {
    device: Arc<dyn ChangerDevice>,
    channels: ChannelNames,
    commands: CommandNames,
    state_map: StateMap,
}

impl std::fmt::Debug for DeviceIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIo")
            .field("device", &"<dyn ChangerDevice>")
            .field("channels", &self.channels)
            .field("commands", &self.commands)
            .finish()
    }
}

impl DeviceIo {
    /// Wrap `device` with the names and state table of `config`.
    pub fn new(device: Arc<dyn ChangerDevice>, config: &ChangerConfig) -> Self {
        Self {
            device,
            channels: config.channels.clone(),
            commands: config.commands.clone(),
            state_map: config.state_map(),
        }
    }

    /// Configured channel names.
    pub fn channels(&self) -> &ChannelNames {
        &self.channels
    }

    /// Configured command names.
    pub fn commands(&self) -> &CommandNames {
        &self.commands
    }

    /// Raw state table in use.
    pub fn state_map(&self) -> &StateMap {
        &self.state_map
    }

    /// Channel update stream, if the device pushes updates.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<ChannelUpdate>> {
        self.device.subscribe()
    }

    // =========================================================================
    // Raw reads
    // =========================================================================

    /// Read `channel` as JSON.
    pub async fn read(&self, channel: &str) -> ScResult<Value> {
        self.device
            .read_channel(channel)
            .await
            .map_err(|e| ScError::communication(channel, e))
    }

    /// Read an optional channel; `Ok(None)` when it is not configured.
    pub async fn read_optional(&self, channel: &Option<String>) -> ScResult<Option<Value>> {
        match available(channel) {
            Some(name) => self.read(name).await.map(Some),
            None => Ok(None),
        }
    }

    async fn read_optional_bool(&self, channel: &Option<String>) -> ScResult<Option<bool>> {
        match available(channel) {
            Some(name) => {
                let value = self.read(name).await?;
                value_as_bool(&value)
                    .map(Some)
                    .ok_or_else(|| unexpected(name, &value, "a boolean"))
            }
            None => Ok(None),
        }
    }

    // =========================================================================
    // Typed readings
    // =========================================================================

    /// Raw status string mapped through the driver table.
    pub async fn raw_state(&self) -> ScResult<SampleChangerState> {
        let value = self.read(&self.channels.state).await?;
        let raw = value_as_string(&value);
        Ok(self.state_map.map(raw.as_deref()))
    }

    /// Arm power as reported, `None` without a power channel.
    pub async fn powered(&self) -> ScResult<Option<bool>> {
        self.read_optional_bool(&self.channels.powered).await
    }

    /// Arm power. Devices without a power channel count as powered.
    pub async fn arm_powered(&self) -> ScResult<bool> {
        Ok(self.powered().await?.unwrap_or(true))
    }

    /// Robot path running. Devices without the channel never report it.
    pub async fn path_running(&self) -> ScResult<bool> {
        Ok(self
            .read_optional_bool(&self.channels.path_running)
            .await?
            .unwrap_or(false))
    }

    /// Goniometer sample sensor, when present.
    pub async fn sample_detected(&self) -> ScResult<Option<bool>> {
        self.read_optional_bool(&self.channels.sample_detected)
            .await
    }

    /// LN2 regulation on.
    pub async fn regulation(&self) -> ScResult<Option<bool>> {
        self.read_optional_bool(&self.channels.regulation).await
    }

    /// Lid `n` (1 or 2) open.
    pub async fn lid_open(&self, lid: u8) -> ScResult<Option<bool>> {
        match lid {
            1 => self.read_optional_bool(&self.channels.lid1).await,
            2 => self.read_optional_bool(&self.channels.lid2).await,
            _ => Ok(None),
        }
    }

    /// Last device error/message text; empty strings count as none.
    pub async fn last_error(&self) -> ScResult<Option<String>> {
        Ok(self
            .read_optional(&self.channels.last_error)
            .await?
            .and_then(|v| value_as_string(&v)))
    }

    /// Barcode read by the last scan; empty strings count as none.
    pub async fn barcode(&self) -> ScResult<Option<String>> {
        Ok(self
            .read_optional(&self.channels.barcode)
            .await?
            .and_then(|v| value_as_string(&v)))
    }

    /// Per-sample barcodes reported by a basket scan.
    pub async fn basket_barcodes(&self) -> ScResult<Option<Vec<Option<String>>>> {
        let Some(name) = available(&self.channels.basket_barcodes) else {
            return Ok(None);
        };
        let value = self.read(name).await?;
        match value {
            Value::Array(items) => Ok(Some(items.iter().map(value_as_string).collect())),
            Value::Null => Ok(Some(Vec::new())),
            other => Err(unexpected(name, &other, "a list of barcodes")),
        }
    }

    /// Presence flags as a list of booleans.
    pub async fn presence_list(&self) -> ScResult<Option<Vec<bool>>> {
        let Some(name) = available(&self.channels.presence) else {
            return Ok(None);
        };
        let value = self.read(name).await?;
        match &value {
            Value::Array(items) => items
                .iter()
                .map(value_as_bool)
                .collect::<Option<Vec<_>>>()
                .map(Some)
                .ok_or_else(|| unexpected(name, &value, "a list of booleans")),
            _ => Err(unexpected(name, &value, "a list of booleans")),
        }
    }

    /// Presence flags as an integer bitmask.
    pub async fn presence_bitmask(&self) -> ScResult<Option<u64>> {
        let Some(name) = available(&self.channels.presence) else {
            return Ok(None);
        };
        let value = self.read(name).await?;
        value_as_i64(&value)
            .filter(|v| *v >= 0)
            .map(|v| Some(v as u64))
            .ok_or_else(|| unexpected(name, &value, "a non-negative bitmask"))
    }

    /// Mounted `(basket, sample)` numbers as reported; negative means none.
    pub async fn mounted_indices(&self) -> ScResult<Option<(i64, i64)>> {
        let (Some(puck), Some(sample)) = (
            available(&self.channels.mounted_puck),
            available(&self.channels.mounted_sample),
        ) else {
            return Ok(None);
        };
        let puck_value = self.read(puck).await?;
        let sample_value = self.read(sample).await?;
        let puck_no = value_as_i64(&puck_value)
            .ok_or_else(|| unexpected(puck, &puck_value, "an integer"))?;
        let sample_no = value_as_i64(&sample_value)
            .ok_or_else(|| unexpected(sample, &sample_value, "an integer"))?;
        Ok(Some((puck_no, sample_no)))
    }

    /// Plate `[row, col, x, y]`, `None` when nothing is under the beam.
    pub async fn plate_location(&self) -> ScResult<Option<[f64; 4]>> {
        let Some(name) = available(&self.channels.plate_location) else {
            return Ok(None);
        };
        let value = self.read(name).await?;
        match &value {
            Value::Null => Ok(None),
            Value::Array(items) if items.len() == 4 => {
                let mut out = [0.0; 4];
                for (slot, item) in out.iter_mut().zip(items) {
                    *slot = item
                        .as_f64()
                        .ok_or_else(|| unexpected(name, &value, "four numbers"))?;
                }
                Ok(Some(out))
            }
            _ => Err(unexpected(name, &value, "[row, col, x, y]")),
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Dispatch `command` directly, bypassing the task executor.
    pub async fn dispatch(&self, command: &str, args: &[Value]) -> ScResult<Option<TaskId>> {
        tracing::debug!(command, ?args, "dispatch");
        self.device
            .execute_command(command, args)
            .await
            .map_err(|e| ScError::communication(command, e))
    }

    /// Write `value` to `channel`.
    pub async fn write(&self, channel: &str, value: Value) -> ScResult<()> {
        self.device
            .write_channel(channel, value)
            .await
            .map_err(|e| ScError::communication(channel, e))
    }
}

fn unexpected(channel: &str, value: &Value, expected: &str) -> ScError {
    ScError::communication(channel, format!("expected {}, got {}", expected, value))
}

// =============================================================================
// Value conversion
// =============================================================================

/// Interpret a channel value as a boolean (`true`, non-zero, `"ON"`, `"1"`...).
pub fn value_as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|v| v != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "on" | "1" | "yes" => Some(true),
            "false" | "off" | "0" | "no" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Interpret a channel value as an integer.
pub fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|v| v as i64)),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

/// Interpret a channel value as a non-empty string.
pub fn value_as_string(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Null => return None,
        other => other.to_string(),
    };
    (!text.is_empty()).then_some(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_as_bool() {
        assert_eq!(value_as_bool(&json!(true)), Some(true));
        assert_eq!(value_as_bool(&json!(0)), Some(false));
        assert_eq!(value_as_bool(&json!("ON")), Some(true));
        assert_eq!(value_as_bool(&json!("maybe")), None);
        assert_eq!(value_as_bool(&json!(null)), None);
    }

    #[test]
    fn test_value_as_i64() {
        assert_eq!(value_as_i64(&json!(-1)), Some(-1));
        assert_eq!(value_as_i64(&json!(3.0)), Some(3));
        assert_eq!(value_as_i64(&json!(" 12 ")), Some(12));
        assert_eq!(value_as_i64(&json!([1])), None);
    }

    #[test]
    fn test_value_as_string() {
        assert_eq!(value_as_string(&json!(" ON ")), Some("ON".to_string()));
        assert_eq!(value_as_string(&json!("")), None);
        assert_eq!(value_as_string(&json!(null)), None);
        assert_eq!(value_as_string(&json!(42)), Some("42".to_string()));
    }
}
