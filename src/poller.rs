// Field-protocol poller: bridges OPC-UA nodes and Modbus registers to
// submodel-element values.
//
// The concrete protocol clients are external; they plug in behind
// `FieldClient`. One task per mapping reads at its interval and commits a
// changed value only after `debounce_count` consecutive confirming reads,
// through the same element-write pipeline every other surface uses. Read
// errors are logged and never stop the task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{Result, TitanError};
use crate::events::{EventEntity, EventHandler, EventKind, RepositoryEvent};
use crate::ids::encode_id_to_b64url;
use crate::services::ElementWriteService;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldDirection {
    Read,
    Write,
    Both,
}

impl FieldDirection {
    pub fn reads(&self) -> bool {
        matches!(self, FieldDirection::Read | FieldDirection::Both)
    }

    pub fn writes(&self) -> bool {
        matches!(self, FieldDirection::Write | FieldDirection::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldDataType {
    Float,
    Int,
    Bool,
    String,
}

/// One configured field point bound to one element path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMapping {
    pub submodel_id: String,
    pub id_short_path: String,
    /// OPC-UA node id or Modbus register address.
    pub address: String,
    pub data_type: FieldDataType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale_factor: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<f64>,
    pub direction: FieldDirection,
    pub interval_ms: u64,
    pub debounce_count: u32,
}

/// The polling/bridging contract the protocol drivers implement.
#[async_trait]
pub trait FieldClient: Send + Sync {
    async fn read(&self, address: &str, data_type: FieldDataType) -> anyhow::Result<Value>;
    async fn write(
        &self,
        address: &str,
        data_type: FieldDataType,
        value: &Value,
    ) -> anyhow::Result<()>;
}

/// Field reading -> element value: apply scale then offset.
pub fn to_element_value(mapping: &FieldMapping, raw: &Value) -> Result<Value> {
    match mapping.data_type {
        FieldDataType::Float | FieldDataType::Int => {
            let numeric = raw
                .as_f64()
                .or_else(|| raw.as_str().and_then(|s| s.parse().ok()))
                .ok_or_else(|| {
                    TitanError::BadRequest(format!("field value {raw} is not numeric"))
                })?;
            let scaled = numeric * mapping.scale_factor.unwrap_or(1.0) + mapping.offset.unwrap_or(0.0);
            Ok(match mapping.data_type {
                FieldDataType::Int => Value::from(scaled.round() as i64),
                _ => Value::from(scaled),
            })
        }
        FieldDataType::Bool => raw
            .as_bool()
            .map(Value::from)
            .ok_or_else(|| TitanError::BadRequest(format!("field value {raw} is not boolean"))),
        FieldDataType::String => Ok(Value::from(
            raw.as_str().map(str::to_string).unwrap_or_else(|| raw.to_string()),
        )),
    }
}

/// Element value -> field writing: the inverse conversion.
pub fn from_element_value(mapping: &FieldMapping, value: &Value) -> Result<Value> {
    match mapping.data_type {
        FieldDataType::Float | FieldDataType::Int => {
            let numeric = value
                .as_f64()
                .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
                .ok_or_else(|| {
                    TitanError::BadRequest(format!("element value {value} is not numeric"))
                })?;
            let unscaled =
                (numeric - mapping.offset.unwrap_or(0.0)) / mapping.scale_factor.unwrap_or(1.0);
            Ok(match mapping.data_type {
                FieldDataType::Int => Value::from(unscaled.round() as i64),
                _ => Value::from(unscaled),
            })
        }
        FieldDataType::Bool => {
            let flag = value
                .as_bool()
                .or_else(|| value.as_str().map(|s| s == "true" || s == "1"))
                .ok_or_else(|| {
                    TitanError::BadRequest(format!("element value {value} is not boolean"))
                })?;
            Ok(Value::from(flag))
        }
        FieldDataType::String => Ok(Value::from(
            value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string()),
        )),
    }
}

/// Debounce state for one mapping: a changed value must be confirmed by
/// `debounce_count` consecutive reads before it commits.
#[derive(Debug, Default)]
pub struct Debouncer {
    committed: Option<Value>,
    candidate: Option<Value>,
    confirmations: u32,
}

impl Debouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one read; returns the value to commit, if any.
    pub fn observe(&mut self, value: Value, debounce_count: u32) -> Option<Value> {
        if self.committed.as_ref() == Some(&value) {
            self.candidate = None;
            self.confirmations = 0;
            return None;
        }
        if self.candidate.as_ref() == Some(&value) {
            self.confirmations += 1;
        } else {
            self.candidate = Some(value);
            self.confirmations = 1;
        }
        if self.confirmations >= debounce_count.max(1) {
            let confirmed = self.candidate.take().expect("candidate set above");
            self.committed = Some(confirmed.clone());
            self.confirmations = 0;
            return Some(confirmed);
        }
        None
    }
}

pub struct FieldPoller {
    elements: ElementWriteService,
    client: Arc<dyn FieldClient>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FieldPoller {
    pub fn new(elements: ElementWriteService, client: Arc<dyn FieldClient>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            elements,
            client,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn one polling task per readable mapping.
    pub async fn start(&self, mappings: Vec<FieldMapping>) {
        let mut tasks = self.tasks.lock().await;
        for mapping in mappings.into_iter().filter(|m| m.direction.reads()) {
            let elements = self.elements.clone();
            let client = Arc::clone(&self.client);
            let shutdown = self.shutdown.subscribe();
            info!(
                submodel = %mapping.submodel_id,
                path = %mapping.id_short_path,
                address = %mapping.address,
                interval_ms = mapping.interval_ms,
                "field polling task started"
            );
            tasks.push(tokio::spawn(poll_loop(mapping, elements, client, shutdown)));
        }
    }

    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks.lock().await.drain(..) {
            let _ = task.await;
        }
    }
}

async fn poll_loop(
    mapping: FieldMapping,
    elements: ElementWriteService,
    client: Arc<dyn FieldClient>,
    mut shutdown: watch::Receiver<bool>,
) {
    let submodel_id_b64 = encode_id_to_b64url(&mapping.submodel_id);
    let mut ticker = interval(Duration::from_millis(mapping.interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut debouncer = Debouncer::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let raw = match client.read(&mapping.address, mapping.data_type).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(address = %mapping.address, "field read failed: {e}");
                continue;
            }
        };
        let value = match to_element_value(&mapping, &raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(address = %mapping.address, "field value rejected: {e}");
                continue;
            }
        };

        if let Some(confirmed) = debouncer.observe(value, mapping.debounce_count) {
            match elements
                .update_value(&submodel_id_b64, &mapping.id_short_path, &confirmed)
                .await
            {
                Ok(_) => debug!(
                    path = %mapping.id_short_path,
                    value = %confirmed,
                    "field change committed"
                ),
                Err(e) => error!(
                    path = %mapping.id_short_path,
                    "field change commit failed: {e}"
                ),
            }
        }
    }
    debug!(path = %mapping.id_short_path, "field polling task stopped");
}

/// Event-side bridge for writable mappings: element updates for a mapped
/// path are converted back and written to the field.
pub struct FieldWriteHandler {
    client: Arc<dyn FieldClient>,
    elements: ElementWriteService,
    /// (submodel identifier, idShortPath) -> mapping.
    mappings: HashMap<(String, String), FieldMapping>,
}

impl FieldWriteHandler {
    pub fn new(
        client: Arc<dyn FieldClient>,
        elements: ElementWriteService,
        mappings: Vec<FieldMapping>,
    ) -> Self {
        let mappings = mappings
            .into_iter()
            .filter(|m| m.direction.writes())
            .map(|m| ((m.submodel_id.clone(), m.id_short_path.clone()), m))
            .collect();
        Self {
            client,
            elements,
            mappings,
        }
    }

    pub fn mapping_count(&self) -> usize {
        self.mappings.len()
    }
}

#[async_trait]
impl EventHandler for FieldWriteHandler {
    async fn handle(&self, event: &RepositoryEvent) -> anyhow::Result<()> {
        if event.entity != EventEntity::Element || event.event_type != EventKind::Updated {
            return Ok(());
        }
        let Some(path) = &event.id_short_path else {
            return Ok(());
        };
        let Some(mapping) = self
            .mappings
            .get(&(event.identifier.clone(), path.clone()))
        else {
            return Ok(());
        };

        let value_bytes = self
            .elements
            .get_value(&event.identifier_b64, path)
            .await?;
        let value: Value = serde_json::from_slice(&value_bytes)?;
        let field_value = from_element_value(mapping, &value)?;
        self.client
            .write(&mapping.address, mapping.data_type, &field_value)
            .await?;
        debug!(address = %mapping.address, value = %field_value, "element change written to field");
        Ok(())
    }

    fn name(&self) -> &str {
        "field-write-bridge"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mapping(data_type: FieldDataType, scale: Option<f64>, offset: Option<f64>) -> FieldMapping {
        FieldMapping {
            submodel_id: "urn:x:sm:1".into(),
            id_short_path: "T".into(),
            address: "ns=2;s=Temp".into(),
            data_type,
            scale_factor: scale,
            offset,
            direction: FieldDirection::Both,
            interval_ms: 100,
            debounce_count: 2,
        }
    }

    #[test]
    fn test_scaling_roundtrip() {
        let m = mapping(FieldDataType::Float, Some(0.1), Some(-40.0));
        let element = to_element_value(&m, &json!(650)).unwrap();
        assert_eq!(element, json!(25.0));
        let field = from_element_value(&m, &element).unwrap();
        assert_eq!(field, json!(650.0));
    }

    #[test]
    fn test_int_conversion_rounds() {
        let m = mapping(FieldDataType::Int, Some(2.0), None);
        assert_eq!(to_element_value(&m, &json!(3)).unwrap(), json!(6));
        assert_eq!(from_element_value(&m, &json!("7")).unwrap(), json!(4));
    }

    #[test]
    fn test_string_values_from_element_strings() {
        let m = mapping(FieldDataType::Float, None, None);
        // Property values are stored as strings; conversion parses them.
        assert_eq!(from_element_value(&m, &json!("23.5")).unwrap(), json!(23.5));
    }

    #[test]
    fn test_non_numeric_rejected() {
        let m = mapping(FieldDataType::Float, None, None);
        assert!(to_element_value(&m, &json!("hot")).is_err());
    }

    #[test]
    fn test_debounce_requires_consecutive_confirmations() {
        let mut debouncer = Debouncer::new();
        // First commit also debounces.
        assert_eq!(debouncer.observe(json!(1.0), 2), None);
        assert_eq!(debouncer.observe(json!(1.0), 2), Some(json!(1.0)));

        // Stable value never re-commits.
        assert_eq!(debouncer.observe(json!(1.0), 2), None);
        assert_eq!(debouncer.observe(json!(1.0), 2), None);

        // A flap resets the confirmation count.
        assert_eq!(debouncer.observe(json!(2.0), 3), None);
        assert_eq!(debouncer.observe(json!(1.0), 3), None);
        assert_eq!(debouncer.observe(json!(2.0), 3), None);
        assert_eq!(debouncer.observe(json!(2.0), 3), None);
        assert_eq!(debouncer.observe(json!(2.0), 3), Some(json!(2.0)));
    }

    #[test]
    fn test_debounce_count_one_commits_immediately() {
        let mut debouncer = Debouncer::new();
        assert_eq!(debouncer.observe(json!(5), 1), Some(json!(5)));
        assert_eq!(debouncer.observe(json!(5), 1), None);
        assert_eq!(debouncer.observe(json!(6), 1), Some(json!(6)));
    }

    #[test]
    fn test_direction_predicates() {
        assert!(FieldDirection::Read.reads());
        assert!(!FieldDirection::Read.writes());
        assert!(FieldDirection::Both.reads() && FieldDirection::Both.writes());
    }
}
