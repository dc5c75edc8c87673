use serde::Serialize;

use crate::config::SENSOR_DISCONNECTED_C;

/// Rendered in place of a temperature when the sensor did not answer.
pub const MISSING_VALUE: &str = "--";

#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub timestamp: String,
    pub celsius: f32,
}

impl Reading {
    pub fn new(timestamp: impl Into<String>, celsius: f32) -> Self {
        Self {
            timestamp: timestamp.into(),
            celsius,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.celsius.is_finite() && self.celsius != SENSOR_DISCONNECTED_C
    }

    pub fn value_field(&self) -> String {
        if self.is_valid() {
            format!("{:.2}", self.celsius)
        } else {
            MISSING_VALUE.to_string()
        }
    }

    /// One data row without the trailing newline, as logged and pushed to subscribers.
    pub fn csv_row(&self) -> String {
        LogEntry::from(self).to_row()
    }
}

/// A persisted row of the data log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: String,
    pub temperature: String,
}

impl LogEntry {
    pub fn to_row(&self) -> String {
        format!("{},{}", self.timestamp, self.temperature)
    }
}

impl From<&Reading> for LogEntry {
    fn from(reading: &Reading) -> Self {
        Self {
            timestamp: reading.timestamp.clone(),
            temperature: reading.value_field(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LatestReadingView {
    pub timestamp: String,
    #[serde(rename = "temperatureC")]
    pub temperature_c: Option<f32>,
    pub display: String,
}

impl From<&Reading> for LatestReadingView {
    fn from(reading: &Reading) -> Self {
        Self {
            timestamp: reading.timestamp.clone(),
            temperature_c: reading.is_valid().then_some(reading.celsius),
            display: reading.value_field(),
        }
    }
}

/// Placeholder in the station index page replaced with the latest value.
pub const TEMPERATURE_PLACEHOLDER: &str = "%TEMPERATUREC%";

/// Fills the index template from the cached reading; never touches the sensor.
pub fn render_index(template: &str, latest: Option<&Reading>) -> String {
    let value = latest
        .map(Reading::value_field)
        .unwrap_or_else(|| MISSING_VALUE.to_string());
    template.replace(TEMPERATURE_PLACEHOLDER, &value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sentinel_renders_as_missing_marker() {
        let reading = Reading::new("2024-05-01 10:00:00", SENSOR_DISCONNECTED_C);

        assert!(!reading.is_valid());
        assert_eq!(reading.csv_row(), "2024-05-01 10:00:00,--");
    }

    #[test]
    fn valid_reading_uses_two_decimals() {
        let reading = Reading::new("2024-05-01 10:00:30", 21.5);

        assert!(reading.is_valid());
        assert_eq!(reading.csv_row(), "2024-05-01 10:00:30,21.50");
    }

    #[test]
    fn latest_view_hides_sentinel_value() {
        let view = LatestReadingView::from(&Reading::new("t", SENSOR_DISCONNECTED_C));

        assert_eq!(view.temperature_c, None);
        assert_eq!(view.display, "--");
    }

    #[test]
    fn index_placeholder_uses_cached_reading() {
        let template = "<p>%TEMPERATUREC% &deg;C</p>";

        assert_eq!(render_index(template, None), "<p>-- &deg;C</p>");
        assert_eq!(
            render_index(template, Some(&Reading::new("t", 19.25))),
            "<p>19.25 &deg;C</p>"
        );
    }
}
