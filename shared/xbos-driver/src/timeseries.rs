//! Timeseries: one named, typed channel of buffered readings
//!
//! A series owns its pending readings until the report protocol confirms they
//! reached an archiver. All mutable state sits behind a single lock so that
//! appending, snapshotting and acknowledging never interleave.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::{self, UnitOfTime};
use crate::error::{DriverError, Result};
use crate::metadata::{self, Metadata};

/// Suffix appended to a sensor path to name its actuator
pub const ACTUATOR_SUFFIX: &str = "_act";

/// Deterministic series id: UUIDv5 of `path` in the `namespace` UUID
pub fn series_id(namespace: &Uuid, path: &str) -> Uuid {
    Uuid::new_v5(namespace, path.as_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Numeric,
    Object,
}

impl StreamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Numeric => "numeric",
            Self::Object => "object",
        }
    }
}

impl FromStr for StreamType {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "numeric" => Ok(Self::Numeric),
            "object" => Ok(Self::Object),
            _ => Err(DriverError::Validation(format!(
                "stream type must be one of numeric, object; got '{}'",
                s
            ))),
        }
    }
}

/// One `[timestamp, value]` pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading(pub i64, pub Value);

impl Reading {
    pub fn timestamp(&self) -> i64 {
        self.0
    }

    pub fn value(&self) -> &Value {
        &self.1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Properties {
    #[serde(rename = "UnitofTime")]
    pub unit_of_time: String,
    #[serde(rename = "UnitofMeasure")]
    pub unit_of_measure: String,
    #[serde(rename = "StreamType")]
    pub stream_type: StreamType,
    #[serde(rename = "ReadingType", default, skip_serializing_if = "Option::is_none")]
    pub reading_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActuatorKind {
    Binary,
    Continuous,
}

/// How an actuator accepts commands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorSpec {
    pub kind: ActuatorKind,
    #[serde(default)]
    pub states: Option<Vec<Value>>,
    #[serde(default)]
    pub range: Option<[f64; 2]>,
}

impl ActuatorSpec {
    pub fn binary() -> Self {
        Self {
            kind: ActuatorKind::Binary,
            states: Some(vec![Value::from(0), Value::from(1)]),
            range: None,
        }
    }

    pub fn continuous(min: f64, max: f64) -> Self {
        Self {
            kind: ActuatorKind::Continuous,
            states: None,
            range: Some([min, max]),
        }
    }

    pub fn with_states(mut self, states: Vec<Value>) -> Self {
        self.states = Some(states);
        self
    }

    fn validate(&self) -> Result<()> {
        if let Some([min, max]) = self.range {
            if !(min < max) {
                return Err(DriverError::Validation(format!(
                    "actuator range [{}, {}] is empty",
                    min, max
                )));
            }
        }
        if matches!(&self.states, Some(states) if states.is_empty()) {
            return Err(DriverError::Validation(
                "actuator states must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// `Actuator` section of a report: a sensor names its actuator by id, an
/// actuator describes its model.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ActuatorInfo {
    #[serde(rename = "id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(rename = "Model", default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ActuatorKind>,
    #[serde(rename = "States", default, skip_serializing_if = "Option::is_none")]
    pub states: Option<Vec<Value>>,
    #[serde(rename = "Range", default, skip_serializing_if = "Option::is_none")]
    pub range: Option<[f64; 2]>,
}

/// What a series sends to an archiver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: Uuid,
    #[serde(rename = "Readings")]
    pub readings: Vec<Reading>,
    #[serde(rename = "Properties", default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Properties>,
    #[serde(rename = "Metadata", default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(rename = "Actuator", default, skip_serializing_if = "Option::is_none")]
    pub actuator: Option<ActuatorInfo>,
}

/// A report together with the state it was taken from, so that an
/// acknowledgment removes exactly what was sent.
#[derive(Debug, Clone)]
pub struct PendingReport {
    pub path: String,
    pub report: Report,
    // position of the first captured reading in the series' lifetime
    start: u64,
    readings: usize,
    generation: u64,
}

impl PendingReport {
    pub fn reading_count(&self) -> usize {
        self.readings
    }
}

#[derive(Default)]
struct SeriesState {
    buffer: Vec<Reading>,
    metadata: Metadata,
    dirty: bool,
    // bumped on every metadata change and on clear
    generation: u64,
    // readings ever removed from the front of the buffer
    removed: u64,
    actuator: Option<Arc<TimeSeries>>,
}

pub struct TimeSeries {
    path: String,
    id: Uuid,
    unit_of_measure: String,
    unit_of_time: UnitOfTime,
    stream_type: StreamType,
    properties: Properties,
    actuation: Option<ActuatorSpec>,
    state: Mutex<SeriesState>,
}

impl TimeSeries {
    pub fn create(
        namespace: &Uuid,
        path: &str,
        unit_of_measure: &str,
        unit_of_time: UnitOfTime,
        stream_type: StreamType,
    ) -> Result<Self> {
        Self::build(
            path,
            series_id(namespace, path),
            unit_of_measure,
            unit_of_time,
            stream_type,
            None,
        )
    }

    fn build(
        path: &str,
        id: Uuid,
        unit_of_measure: &str,
        unit_of_time: UnitOfTime,
        stream_type: StreamType,
        actuation: Option<ActuatorSpec>,
    ) -> Result<Self> {
        if path.trim().is_empty() {
            return Err(DriverError::Validation("path must not be empty".to_string()));
        }
        if unit_of_measure.trim().is_empty() {
            return Err(DriverError::Validation(format!(
                "unit of measure for {} must not be empty",
                path
            )));
        }

        let properties = Properties {
            unit_of_time: unit_of_time.property_value().to_string(),
            unit_of_measure: unit_of_measure.to_string(),
            stream_type,
            reading_type: (stream_type == StreamType::Numeric).then(|| "double".to_string()),
        };

        Ok(Self {
            path: path.to_string(),
            id,
            unit_of_measure: unit_of_measure.to_string(),
            unit_of_time,
            stream_type,
            properties,
            actuation,
            state: Mutex::new(SeriesState {
                dirty: true,
                ..Default::default()
            }),
        })
    }

    /// Build the writable counterpart of this series. It is not attached
    /// until [`TimeSeries::attach_actuator`] is called.
    pub fn new_actuator(&self, spec: ActuatorSpec) -> Result<TimeSeries> {
        if self.is_actuator() {
            return Err(DriverError::Validation(format!(
                "{} is already an actuator",
                self.path
            )));
        }
        spec.validate()?;

        let path = format!("{}{}", self.path, ACTUATOR_SUFFIX);
        let id = series_id(&self.id, &path);
        Self::build(
            &path,
            id,
            &self.unit_of_measure,
            self.unit_of_time,
            self.stream_type,
            Some(spec),
        )
    }

    /// Link `actuator` to this sensor and copy the sensor's current metadata
    /// onto it.
    pub fn attach_actuator(&self, actuator: Arc<TimeSeries>) -> Result<()> {
        let metadata = {
            let mut state = self.state.lock();
            if state.actuator.is_some() {
                return Err(DriverError::Validation(format!(
                    "{} already has an actuator",
                    self.path
                )));
            }
            state.actuator = Some(Arc::clone(&actuator));
            state.dirty = true;
            state.generation += 1;
            state.metadata.clone()
        };

        actuator.attach_metadata(&metadata);
        Ok(())
    }

    /// Queue a reading. Without a timestamp the current time in the series'
    /// unit of time is used.
    pub fn add(&self, value: Value, timestamp: Option<i64>) -> Result<()> {
        if self.stream_type == StreamType::Numeric && !value.is_number() {
            return Err(DriverError::Validation(format!(
                "value {} for {} is not numeric",
                value, self.path
            )));
        }
        let timestamp = timestamp.unwrap_or_else(|| clock::now_as(self.unit_of_time));
        self.state.lock().buffer.push(Reading(timestamp, value));
        Ok(())
    }

    pub fn attach_metadata(&self, partial: &Metadata) {
        let actuator = {
            let mut state = self.state.lock();
            metadata::merge(&mut state.metadata, partial);
            state.dirty = true;
            state.generation += 1;
            state.actuator.clone()
        };

        if let Some(actuator) = actuator {
            actuator.attach_metadata(partial);
        }
    }

    pub fn snapshot_report(&self) -> Report {
        let state = self.state.lock();
        self.report_from(&state)
    }

    pub fn snapshot(&self) -> PendingReport {
        let state = self.state.lock();
        PendingReport {
            path: self.path.clone(),
            report: self.report_from(&state),
            start: state.removed,
            readings: state.buffer.len(),
            generation: state.generation,
        }
    }

    fn report_from(&self, state: &SeriesState) -> Report {
        let mut report = Report {
            id: self.id,
            readings: state.buffer.clone(),
            properties: None,
            metadata: None,
            actuator: None,
        };

        if state.dirty {
            report.properties = Some(self.properties.clone());
            report.metadata = Some(state.metadata.clone());
            report.actuator = match (&state.actuator, &self.actuation) {
                (Some(actuator), _) => Some(ActuatorInfo {
                    id: Some(actuator.id()),
                    ..Default::default()
                }),
                (None, Some(spec)) => Some(ActuatorInfo {
                    id: None,
                    model: Some(spec.kind),
                    states: spec.states.clone(),
                    range: spec.range,
                }),
                (None, None) => None,
            };
        }
        report
    }

    /// Drop what `pending` carried. Readings queued after the snapshot stay
    /// buffered, and metadata changed after it stays dirty.
    pub fn acknowledge(&self, pending: &PendingReport) {
        let mut state = self.state.lock();
        let end = pending.start + pending.readings as u64;
        let sent = usize::try_from(end.saturating_sub(state.removed))
            .unwrap_or(usize::MAX)
            .min(state.buffer.len());
        state.buffer.drain(..sent);
        state.removed += sent as u64;
        if state.generation == pending.generation {
            state.dirty = false;
        }
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.removed += state.buffer.len() as u64;
        state.buffer.clear();
        state.dirty = false;
        state.generation += 1;
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn unit_of_measure(&self) -> &str {
        &self.unit_of_measure
    }

    pub fn unit_of_time(&self) -> UnitOfTime {
        self.unit_of_time
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn is_actuator(&self) -> bool {
        self.actuation.is_some()
    }

    pub fn actuation(&self) -> Option<&ActuatorSpec> {
        self.actuation.as_ref()
    }

    pub fn actuator(&self) -> Option<Arc<TimeSeries>> {
        self.state.lock().actuator.clone()
    }

    pub fn metadata(&self) -> Metadata {
        self.state.lock().metadata.clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    pub fn pending_readings(&self) -> usize {
        self.state.lock().buffer.len()
    }
}

impl fmt::Debug for TimeSeries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeSeries")
            .field("path", &self.path)
            .field("id", &self.id)
            .field("unit_of_measure", &self.unit_of_measure)
            .field("unit_of_time", &self.unit_of_time)
            .field("stream_type", &self.stream_type)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NAMESPACE: &str = "f92f89ac-40ec-11e5-b998-5cc5d4ded1ae";

    fn namespace() -> Uuid {
        Uuid::parse_str(NAMESPACE).unwrap()
    }

    fn temp() -> TimeSeries {
        TimeSeries::create(
            &namespace(),
            "/temp",
            "F",
            UnitOfTime::Milliseconds,
            StreamType::Numeric,
        )
        .unwrap()
    }

    fn meta(value: Value) -> Metadata {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_create_sets_defaults() {
        let ts = temp();
        assert!(ts.is_dirty());
        assert_eq!(ts.pending_readings(), 0);
        assert_eq!(ts.properties().reading_type.as_deref(), Some("double"));
        assert_eq!(ts.properties().unit_of_time, "ms");

        let obj = TimeSeries::create(
            &namespace(),
            "/status",
            "text",
            UnitOfTime::Seconds,
            StreamType::Object,
        )
        .unwrap();
        assert_eq!(obj.properties().reading_type, None);
    }

    #[test]
    fn test_create_rejects_empty_unit() {
        let result = TimeSeries::create(
            &namespace(),
            "/temp",
            "  ",
            UnitOfTime::Seconds,
            StreamType::Numeric,
        );
        assert!(matches!(result, Err(DriverError::Validation(_))));
    }

    #[test]
    fn test_id_is_deterministic() {
        let first = TimeSeries::create(
            &namespace(),
            "/sensor0",
            "V",
            UnitOfTime::Seconds,
            StreamType::Numeric,
        )
        .unwrap();
        let second = TimeSeries::create(
            &namespace(),
            "/sensor0",
            "kW",
            UnitOfTime::Nanoseconds,
            StreamType::Object,
        )
        .unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(first.id(), series_id(&namespace(), "/sensor0"));
        assert_eq!(first.id().get_version_num(), 5);
        assert_ne!(first.id(), series_id(&Uuid::nil(), "/sensor0"));
    }

    #[test]
    fn test_numeric_rejects_non_numeric() {
        let ts = temp();
        ts.add(json!(72.5), Some(1)).unwrap();

        assert!(matches!(
            ts.add(json!("hot"), Some(2)),
            Err(DriverError::Validation(_))
        ));
        assert!(ts.add(json!(true), Some(3)).is_err());
        assert_eq!(ts.snapshot_report().readings, vec![Reading(1, json!(72.5))]);
    }

    #[test]
    fn test_object_series_accepts_anything() {
        let ts = TimeSeries::create(
            &namespace(),
            "/status",
            "text",
            UnitOfTime::Seconds,
            StreamType::Object,
        )
        .unwrap();
        ts.add(json!({"mode": "heat"}), Some(10)).unwrap();
        ts.add(json!("idle"), Some(11)).unwrap();
        assert_eq!(ts.pending_readings(), 2);
    }

    #[test]
    fn test_add_without_timestamp_uses_unit_of_time() {
        let ts = temp();
        let before = clock::now_as(UnitOfTime::Milliseconds);
        ts.add(json!(1), None).unwrap();
        let after = clock::now_as(UnitOfTime::Milliseconds);

        let stamp = ts.snapshot_report().readings[0].timestamp();
        assert!(before <= stamp && stamp <= after);
    }

    #[test]
    fn test_readings_preserve_order() {
        let ts = temp();
        let supplied = [(30, 1.5), (10, 2.25), (20, 0.1), (20, -7.0)];
        for (t, v) in supplied {
            ts.add(json!(v), Some(t)).unwrap();
        }

        let expected: Vec<Reading> = supplied
            .iter()
            .map(|(t, v)| Reading(*t, json!(v)))
            .collect();
        assert_eq!(ts.snapshot_report().readings, expected);
    }

    #[test]
    fn test_report_wire_shape() {
        let ts = temp();
        ts.attach_metadata(&meta(json!({"Location": {"Room": "410"}})));
        ts.add(json!(72.5), Some(1454673600000)).unwrap();

        let wire = serde_json::to_value(ts.snapshot_report()).unwrap();
        assert_eq!(
            wire,
            json!({
                "id": ts.id().to_string(),
                "Readings": [[1454673600000i64, 72.5]],
                "Properties": {
                    "UnitofTime": "ms",
                    "UnitofMeasure": "F",
                    "StreamType": "numeric",
                    "ReadingType": "double"
                },
                "Metadata": {"Location": {"Room": "410"}}
            })
        );
    }

    #[test]
    fn test_clear_drops_readings_and_dirty() {
        let ts = temp();
        ts.add(json!(72.5), Some(1)).unwrap();
        ts.add(json!(73.0), Some(2)).unwrap();
        assert!(ts.snapshot_report().properties.is_some());

        ts.clear();

        let report = ts.snapshot_report();
        assert!(report.readings.is_empty());
        assert!(report.properties.is_none());
        assert!(report.metadata.is_none());
        assert!(!ts.is_dirty());

        ts.attach_metadata(&meta(json!({"Sourcename": "Demo Source"})));
        assert!(ts.snapshot_report().metadata.is_some());
    }

    #[test]
    fn test_acknowledge_keeps_later_mutations() {
        let ts = temp();
        ts.add(json!(1), Some(1)).unwrap();
        let pending = ts.snapshot();

        ts.add(json!(2), Some(2)).unwrap();
        ts.attach_metadata(&meta(json!({"Room": "410"})));
        ts.acknowledge(&pending);

        assert_eq!(ts.snapshot_report().readings, vec![Reading(2, json!(2))]);
        assert!(ts.is_dirty());

        let pending = ts.snapshot();
        ts.acknowledge(&pending);
        assert_eq!(ts.pending_readings(), 0);
        assert!(!ts.is_dirty());
    }

    #[test]
    fn test_clear_during_send_keeps_newer_readings() {
        let ts = temp();
        ts.add(json!(1), Some(1)).unwrap();
        ts.add(json!(2), Some(2)).unwrap();
        let pending = ts.snapshot();

        ts.clear();
        ts.add(json!(3), Some(3)).unwrap();
        ts.acknowledge(&pending);

        assert_eq!(ts.snapshot_report().readings, vec![Reading(3, json!(3))]);

        // partially cleared: only the unsent tail survives
        let ts = temp();
        ts.add(json!(1), Some(1)).unwrap();
        let pending = ts.snapshot();
        ts.add(json!(2), Some(2)).unwrap();
        let later = ts.snapshot();
        ts.acknowledge(&pending);
        ts.add(json!(3), Some(3)).unwrap();
        ts.acknowledge(&later);
        assert_eq!(ts.snapshot_report().readings, vec![Reading(3, json!(3))]);
    }

    #[test]
    fn test_clear_during_send_keeps_new_metadata_dirty() {
        let ts = temp();
        ts.add(json!(1), Some(1)).unwrap();
        let pending = ts.snapshot();

        ts.clear();
        ts.attach_metadata(&meta(json!({"Room": "410"})));
        ts.acknowledge(&pending);
        assert!(ts.is_dirty());
    }

    #[test]
    fn test_actuator_follows_sensor_metadata() {
        let sensor = temp();
        sensor.attach_metadata(&meta(json!({"Location": {"Building": "Soda Hall"}})));

        let actuator = Arc::new(sensor.new_actuator(ActuatorSpec::continuous(50.0, 90.0)).unwrap());
        assert_eq!(actuator.path(), "/temp_act");
        assert_eq!(actuator.id(), series_id(&sensor.id(), "/temp_act"));
        sensor.attach_actuator(Arc::clone(&actuator)).unwrap();

        sensor.attach_metadata(&meta(json!({"Location": {"Room": "410"}})));
        assert_eq!(
            Value::Object(actuator.metadata()),
            json!({"Location": {"Building": "Soda Hall", "Room": "410"}})
        );

        let sensor_report = sensor.snapshot_report();
        assert_eq!(sensor_report.actuator.unwrap().id, Some(actuator.id()));

        let actuator_report = actuator.snapshot_report();
        let info = actuator_report.actuator.unwrap();
        assert_eq!(info.model, Some(ActuatorKind::Continuous));
        assert_eq!(info.range, Some([50.0, 90.0]));
    }

    #[test]
    fn test_actuator_rules() {
        let sensor = temp();
        let actuator = Arc::new(sensor.new_actuator(ActuatorSpec::binary()).unwrap());
        assert!(actuator.new_actuator(ActuatorSpec::binary()).is_err());
        assert!(sensor.new_actuator(ActuatorSpec::continuous(1.0, 1.0)).is_err());

        sensor.attach_actuator(Arc::clone(&actuator)).unwrap();
        assert!(sensor.attach_actuator(actuator).is_err());
    }
}
