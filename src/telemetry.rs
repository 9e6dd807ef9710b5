use chrono::{DateTime, Utc};
use simd_json::prelude::ValueAsScalar;
use simd_json::BorrowedValue;
use std::collections::HashMap;
use thiserror::Error;

const DEVICE_ID_KEY: &str = "deviceuid";
const LOCAL_IP_KEY: &str = "localip";
const STATUS_KEYS: [&str; 2] = ["status", "error"];
const DEFAULT_STATUS: &str = "online";

/// Canonical measurement channels. The discriminant doubles as the column
/// index inside [`Channels`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    Temperature,
    TemperatureR,
    TemperatureY,
    TemperatureB,
    Humidity,
    FlowRate,
    Pressure,
    TotalVolume,
}

// Alias priority is the order inside each slice: when a payload carries more
// than one alias of the same channel the earliest one wins.
const CHANNEL_ALIASES: [(Channel, &[&str]); 8] = [
    (Channel::Temperature, &["temperature", "temp"]),
    (Channel::TemperatureR, &["temperaturer", "tempr", "temp1"]),
    (Channel::TemperatureY, &["temperaturey", "tempy", "temp2"]),
    (Channel::TemperatureB, &["temperatureb", "tempb", "temp3"]),
    (Channel::Humidity, &["humidity", "hum"]),
    (Channel::FlowRate, &["flowrate", "flow", "level"]),
    (Channel::Pressure, &["pressure"]),
    (Channel::TotalVolume, &["totalizer", "totalvolume"]),
];

impl Channel {
    pub const ALL: [Channel; 8] = [
        Channel::Temperature,
        Channel::TemperatureR,
        Channel::TemperatureY,
        Channel::TemperatureB,
        Channel::Humidity,
        Channel::FlowRate,
        Channel::Pressure,
        Channel::TotalVolume,
    ];

    /// Column name in the raw readings and rollup tables.
    pub fn column(self) -> &'static str {
        match self {
            Channel::Temperature => "temperature",
            Channel::TemperatureR => "temperature_r",
            Channel::TemperatureY => "temperature_y",
            Channel::TemperatureB => "temperature_b",
            Channel::Humidity => "humidity",
            Channel::FlowRate => "flow_rate",
            Channel::Pressure => "pressure",
            Channel::TotalVolume => "total_volume",
        }
    }

    pub fn aliases(self) -> &'static [&'static str] {
        CHANNEL_ALIASES[self as usize].1
    }

    /// Resolves any spelling of a channel name (`Temp`, `flow_rate`, `TotalVolume`)
    /// to its canonical channel.
    pub fn resolve(name: &str) -> Option<Channel> {
        let key = normalize_key(name);
        CHANNEL_ALIASES
            .iter()
            .find(|(_, aliases)| aliases.contains(&key.as_str()))
            .map(|(channel, _)| *channel)
    }
}

/// Sparse set of channel values. Absent channels stay `None`; they are never
/// defaulted to zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Channels {
    values: [Option<f64>; 8],
}

impl Channels {
    pub fn get(&self, channel: Channel) -> Option<f64> {
        self.values[channel as usize]
    }

    pub fn set(&mut self, channel: Channel, value: f64) {
        self.values[channel as usize] = Some(value);
    }

    pub fn is_empty(&self) -> bool {
        self.values.iter().all(Option::is_none)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Channel, f64)> + '_ {
        Channel::ALL
            .iter()
            .filter_map(|channel| self.get(*channel).map(|value| (*channel, value)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub device_id: String,
    pub captured_at: DateTime<Utc>,
    pub channels: Channels,
    pub ip_address: String,
    pub status: String,
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("empty payload")]
    Empty,
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("invalid JSON payload: {0}")]
    Json(#[from] simd_json::Error),
}

/// Lower-cases and strips everything but ASCII letters and digits, so that
/// `Flow_Rate`, `flowRate` and `FLOWRATE` all compare equal.
pub fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Turns one transport payload into zero or more readings.
///
/// A payload with a top-level device identifier is a single reading, even
/// when it carries no recognised channel (it still counts as a heartbeat).
/// Otherwise each object-valued member that has a device identifier and at
/// least one recognised channel becomes a reading, ordered by member key.
pub fn parse_payload(
    payload: &mut [u8],
    received_at: DateTime<Utc>,
    fallback_ip: &str,
) -> Result<Vec<Reading>, NormalizeError> {
    let trimmed = payload.trim_ascii();
    if trimmed.is_empty() {
        return Err(NormalizeError::Empty);
    }
    if trimmed.first() != Some(&b'{') || trimmed.last() != Some(&b'}') {
        return Err(NormalizeError::NotAnObject);
    }

    let value = simd_json::to_borrowed_value(payload)?;
    let BorrowedValue::Object(root) = &value else {
        return Err(NormalizeError::NotAnObject);
    };

    let fields = normalized_fields(root.iter().map(|(key, value)| (&**key, value)));
    if let Some(device_id) = device_identifier(&fields) {
        return Ok(vec![build_reading(device_id, &fields, received_at, fallback_ip)]);
    }

    let mut members: Vec<(&str, &BorrowedValue)> = root
        .iter()
        .map(|(key, value)| (&**key, value))
        .collect();
    members.sort_by(|a, b| a.0.cmp(b.0));

    let mut readings = Vec::new();
    for (key, member) in members {
        let BorrowedValue::Object(sub) = member else {
            continue;
        };
        let fields = normalized_fields(sub.iter().map(|(key, value)| (&**key, value)));
        let Some(device_id) = device_identifier(&fields) else {
            continue;
        };
        let reading = build_reading(device_id, &fields, received_at, fallback_ip);
        if reading.channels.is_empty() {
            tracing::debug!(member = %key, device = %reading.device_id, "skipping sub-reading without measurements");
            continue;
        }
        readings.push(reading);
    }
    Ok(readings)
}

fn normalized_fields<'v, 'a: 'v>(
    entries: impl Iterator<Item = (&'v str, &'v BorrowedValue<'a>)>,
) -> HashMap<String, &'v BorrowedValue<'a>> {
    let mut fields = HashMap::new();
    for (key, value) in entries {
        fields.entry(normalize_key(key)).or_insert(value);
    }
    fields
}

fn device_identifier<'v>(fields: &HashMap<String, &'v BorrowedValue<'_>>) -> Option<&'v str> {
    fields
        .get(DEVICE_ID_KEY)
        .copied()
        .and_then(|value| value.as_str())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn build_reading(
    device_id: &str,
    fields: &HashMap<String, &BorrowedValue<'_>>,
    received_at: DateTime<Utc>,
    fallback_ip: &str,
) -> Reading {
    let mut channels = Channels::default();
    for channel in Channel::ALL {
        let value = channel
            .aliases()
            .iter()
            .find_map(|alias| fields.get(*alias).and_then(|value| numeric(value)));
        if let Some(value) = value {
            channels.set(channel, value);
        }
    }

    let ip_address = fields
        .get(LOCAL_IP_KEY)
        .and_then(|value| value.as_str())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(fallback_ip)
        .to_string();
    let status = STATUS_KEYS
        .iter()
        .find_map(|key| {
            fields
                .get(*key)
                .and_then(|value| value.as_str())
                .map(str::trim)
                .filter(|value| !value.is_empty())
        })
        .unwrap_or(DEFAULT_STATUS)
        .to_string();

    Reading {
        device_id: device_id.to_string(),
        captured_at: received_at,
        channels,
        ip_address,
        status,
    }
}

fn numeric(value: &BorrowedValue<'_>) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_i64().map(|v| v as f64))
        .or_else(|| value.as_u64().map(|v| v as f64))
        .filter(|v| v.is_finite())
}
