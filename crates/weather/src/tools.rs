//! The weather tools exposed over MCP.

use std::sync::Arc;

use mcp::{ToolFault, ToolRegistry};
use serde_json::{Map, Value, json};

use crate::nws::NwsClient;

/// Register `get_alerts` and `get_forecast` backed by `nws`.
pub fn registry(nws: Arc<NwsClient>) -> mcp::Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();

    let client = nws.clone();
    registry.register(
        "get_alerts",
        "Get weather alerts for a US state.",
        json!({
            "type": "object",
            "properties": {
                "state": {
                    "type": "string",
                    "description": "Two-letter US state code (e.g. CA, NY)",
                    "pattern": "^[A-Za-z]{2}$"
                }
            },
            "required": ["state"]
        }),
        move |args| {
            let client = client.clone();
            async move {
                let state = string_arg(&args, "state")?;
                Ok::<_, ToolFault>(client.alerts(&state).await)
            }
        },
    )?;

    let client = nws;
    registry.register(
        "get_forecast",
        "Get weather forecast for a location.",
        json!({
            "type": "object",
            "properties": {
                "latitude": {
                    "type": "number",
                    "description": "Latitude of the location",
                    "minimum": -90,
                    "maximum": 90
                },
                "longitude": {
                    "type": "number",
                    "description": "Longitude of the location",
                    "minimum": -180,
                    "maximum": 180
                }
            },
            "required": ["latitude", "longitude"]
        }),
        move |args| {
            let client = client.clone();
            async move {
                let latitude = number_arg(&args, "latitude")?;
                let longitude = number_arg(&args, "longitude")?;
                Ok::<_, ToolFault>(client.forecast(latitude, longitude).await)
            }
        },
    )?;

    Ok(registry)
}

fn string_arg(args: &Map<String, Value>, key: &str) -> Result<String, ToolFault> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ToolFault::new(format!("missing string argument '{key}'")))
}

fn number_arg(args: &Map<String, Value>, key: &str) -> Result<f64, ToolFault> {
    args.get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| ToolFault::new(format!("missing numeric argument '{key}'")))
}
