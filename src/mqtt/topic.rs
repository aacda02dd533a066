use thiserror::Error;

/// Filters subscribed on every successful connect
pub const SUBSCRIPTION_FILTERS: [&str; 6] = [
    "tele/+/LWT",
    "tele/+/STATE",
    "stat/+/RESULT",
    "stat/+/POWER",
    "stat/+/POWER1",
    "stat/+/POWER2",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("Malformed topic '{topic}': expected 3 segments, found {segments}")]
    Malformed { topic: String, segments: usize },
}

/// `<prefix>/<bus id>/<kind>` split into its parts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTopic<'a> {
    /// `tele`, `stat` or `cmnd`
    pub prefix: &'a str,
    pub bus_id: &'a str,
    /// `LWT`, `STATE`, `RESULT`, `POWER`...
    pub kind: &'a str,
}

/// Splits a device topic into exactly three `/`-separated segments
///
/// # Examples
/// ```
/// use relaywatch::mqtt::topic::parse_topic;
///
/// let topic = parse_topic("tele/tasmota_sala_luz/LWT").unwrap();
/// assert_eq!(topic.bus_id, "tasmota_sala_luz");
/// assert_eq!(topic.kind, "LWT");
/// assert!(parse_topic("tele/tasmota_sala_luz").is_err());
/// ```
pub fn parse_topic(topic: &str) -> Result<DeviceTopic<'_>, TopicError> {
    let segments: Vec<&str> = topic.split('/').collect();
    match segments.as_slice() {
        [prefix, bus_id, kind] => Ok(DeviceTopic {
            prefix: *prefix,
            bus_id: *bus_id,
            kind: *kind,
        }),
        _ => Err(TopicError::Malformed {
            topic: topic.to_string(),
            segments: segments.len(),
        }),
    }
}

/// Outbound power topic for a device
pub fn command_topic(bus_id: &str) -> String {
    format!("cmnd/{}/POWER", bus_id)
}
