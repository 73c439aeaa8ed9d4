//! US National Weather Service API client.

use std::time::Duration;

use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};

pub const NWS_API_BASE: &str = "https://api.weather.gov";
const USER_AGENT: &str = "skiff-weather/1.0";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Forecast periods included in a forecast answer.
const FORECAST_PERIODS: usize = 5;

const ALERTS_UNAVAILABLE: &str = "Unable to fetch alerts or no alerts found.";
const NO_ALERTS: &str = "No active alerts for this state.";
const POINTS_UNAVAILABLE: &str = "Unable to fetch forecast data for this location.";
const FORECAST_UNAVAILABLE: &str = "Unable to fetch detailed forecast.";

#[derive(Debug, Error)]
pub enum NwsError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

// ─────────────────────────────────────────────────────────────────────────────
// API Wire Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AlertCollection {
    features: Vec<AlertFeature>,
}

#[derive(Debug, Deserialize)]
struct AlertFeature {
    properties: AlertProperties,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertProperties {
    pub event: Option<String>,
    pub area_desc: Option<String>,
    pub severity: Option<String>,
    pub description: Option<String>,
    pub instruction: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Points {
    properties: PointProperties,
}

#[derive(Debug, Deserialize)]
struct PointProperties {
    forecast: String,
}

#[derive(Debug, Deserialize)]
struct Forecast {
    properties: ForecastProperties,
}

#[derive(Debug, Deserialize)]
struct ForecastProperties {
    periods: Vec<Period>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Period {
    pub name: String,
    pub temperature: serde_json::Value,
    pub temperature_unit: String,
    pub wind_speed: String,
    pub wind_direction: String,
    pub detailed_forecast: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Formatting
// ─────────────────────────────────────────────────────────────────────────────

pub fn format_alert(alert: &AlertProperties) -> String {
    let or = |field: &Option<String>, fallback: &str| {
        field.clone().unwrap_or_else(|| fallback.to_string())
    };
    format!(
        "\nEvent: {}\nArea: {}\nSeverity: {}\nDescription: {}\nInstructions: {}\n",
        or(&alert.event, "Unknown"),
        or(&alert.area_desc, "Unknown"),
        or(&alert.severity, "Unknown"),
        or(&alert.description, "No description available"),
        or(&alert.instruction, "No specific instructions provided"),
    )
}

pub fn format_period(period: &Period) -> String {
    format!(
        "\n{}:\nTemperature: {}°{}\nWind: {} {}\nForecast: {}\n",
        period.name,
        period.temperature,
        period.temperature_unit,
        period.wind_speed,
        period.wind_direction,
        period.detailed_forecast,
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────────────────

pub struct NwsClient {
    http: reqwest::Client,
    base_url: String,
}

impl NwsClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, NwsError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/geo+json"));

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(NwsError::Client)?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T, NwsError> {
        debug!(%url, "nws request");
        let response = self.http.get(url).send().await?.error_for_status()?;
        Ok(response.json().await?)
    }

    /// Active alerts for a two-letter state code, formatted for reading.
    pub async fn alerts(&self, state: &str) -> String {
        let url = format!("{}/alerts/active/area/{}", self.base_url, state.to_ascii_uppercase());
        let alerts: AlertCollection = match self.get(&url).await {
            Ok(alerts) => alerts,
            Err(e) => {
                warn!(%state, error = %e, "alerts request failed");
                return ALERTS_UNAVAILABLE.to_string();
            }
        };

        if alerts.features.is_empty() {
            return NO_ALERTS.to_string();
        }

        alerts
            .features
            .iter()
            .map(|feature| format_alert(&feature.properties))
            .collect::<Vec<_>>()
            .join("\n---\n")
    }

    /// The next few forecast periods for a location, formatted for reading.
    pub async fn forecast(&self, latitude: f64, longitude: f64) -> String {
        let points_url = format!("{}/points/{latitude},{longitude}", self.base_url);
        let points: Points = match self.get(&points_url).await {
            Ok(points) => points,
            Err(e) => {
                warn!(latitude, longitude, error = %e, "points request failed");
                return POINTS_UNAVAILABLE.to_string();
            }
        };

        let forecast: Forecast = match self.get(&points.properties.forecast).await {
            Ok(forecast) => forecast,
            Err(e) => {
                warn!(latitude, longitude, error = %e, "forecast request failed");
                return FORECAST_UNAVAILABLE.to_string();
            }
        };

        forecast
            .properties
            .periods
            .iter()
            .take(FORECAST_PERIODS)
            .map(format_period)
            .collect::<Vec<_>>()
            .join("\n---\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP responder serving canned JSON bodies by path.
    async fn canned(routes: impl FnOnce(&str) -> HashMap<String, String>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let routes = Arc::new(routes(&base));

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let routes = routes.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    let mut read = 0;
                    while !buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                        match stream.read(&mut buf[read..]).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => read += n,
                        }
                    }
                    let head = String::from_utf8_lossy(&buf[..read]);
                    let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                    let (status, body) = match routes.get(&path) {
                        Some(body) => ("200 OK", body.clone()),
                        None => ("404 Not Found", "{}".to_string()),
                    };
                    let response = format!(
                        "HTTP/1.1 {status}\r\ncontent-type: application/geo+json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });

        base
    }

    fn period(name: &str, temperature: i64) -> serde_json::Value {
        json!({
            "name": name,
            "temperature": temperature,
            "temperatureUnit": "F",
            "windSpeed": "5 mph",
            "windDirection": "NW",
            "detailedForecast": format!("{name} is clear.")
        })
    }

    #[test]
    fn alert_formatting_uses_fallbacks() {
        let alert = AlertProperties {
            event: Some("Heat Advisory".into()),
            area_desc: Some("Sacramento Valley".into()),
            ..Default::default()
        };
        assert_eq!(
            format_alert(&alert),
            "\nEvent: Heat Advisory\nArea: Sacramento Valley\nSeverity: Unknown\n\
             Description: No description available\n\
             Instructions: No specific instructions provided\n"
        );
    }

    #[test]
    fn period_formatting() {
        let period: Period = serde_json::from_value(period("Tonight", 54)).unwrap();
        assert_eq!(
            format_period(&period),
            "\nTonight:\nTemperature: 54°F\nWind: 5 mph NW\nForecast: Tonight is clear.\n"
        );
    }

    #[tokio::test]
    async fn alerts_are_joined() {
        let base = canned(|_| {
            let body = json!({"features": [
                {"properties": {"event": "Flood Watch", "severity": "Moderate"}},
                {"properties": {"event": "Wind Advisory"}}
            ]});
            HashMap::from([("/alerts/active/area/CA".to_string(), body.to_string())])
        })
        .await;

        let text = NwsClient::new(base).unwrap().alerts("ca").await;
        let blocks: Vec<_> = text.split("\n---\n").collect();
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].contains("Event: Flood Watch"));
        assert!(blocks[1].contains("Event: Wind Advisory"));
    }

    #[tokio::test]
    async fn no_alerts_message() {
        let base = canned(|_| {
            HashMap::from([(
                "/alerts/active/area/WY".to_string(),
                json!({"features": []}).to_string(),
            )])
        })
        .await;
        assert_eq!(NwsClient::new(base).unwrap().alerts("WY").await, NO_ALERTS);
    }

    #[tokio::test]
    async fn forecast_follows_points_and_keeps_five_periods() {
        let base = canned(|base| {
            let points = json!({"properties": {"forecast": format!("{base}/gridpoints/STO/41,68/forecast")}});
            let periods: Vec<_> = (0..7).map(|i| period(&format!("P{i}"), 50 + i)).collect();
            let forecast = json!({"properties": {"periods": periods}});
            HashMap::from([
                ("/points/38.58,-121.49".to_string(), points.to_string()),
                ("/gridpoints/STO/41,68/forecast".to_string(), forecast.to_string()),
            ])
        })
        .await;

        let text = NwsClient::new(base).unwrap().forecast(38.58, -121.49).await;
        let blocks: Vec<_> = text.split("\n---\n").collect();
        assert_eq!(blocks.len(), 5);
        assert!(blocks[0].starts_with("\nP0:\nTemperature: 50°F"));
        assert!(blocks[4].contains("P4"));
    }

    #[tokio::test]
    async fn forecast_failures_have_distinct_messages() {
        let base = canned(|base| {
            let points = json!({"properties": {"forecast": format!("{base}/missing")}});
            HashMap::from([("/points/1,2".to_string(), points.to_string())])
        })
        .await;
        let client = NwsClient::new(base).unwrap();
        assert_eq!(client.forecast(1.0, 2.0).await, FORECAST_UNAVAILABLE);
        assert_eq!(client.forecast(3.0, 4.0).await, POINTS_UNAVAILABLE);
    }

    #[tokio::test]
    async fn unreachable_api_reports_unavailable() {
        let client = NwsClient::new("http://127.0.0.1:9").unwrap();
        assert_eq!(client.alerts("CA").await, ALERTS_UNAVAILABLE);
    }
}
