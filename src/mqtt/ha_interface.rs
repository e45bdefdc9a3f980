use serde::Serialize;

use crate::config::{MeterConfig, MqttConfig};


#[derive(Serialize, Clone)]
pub struct HaDevice {
    identifiers: Vec<String>,
    name: String,
    manufacturer: String,
    model: String,
}

#[derive(Serialize, Clone)]
pub struct HaOrigin {
    pub name: String,
    pub sw_version: String,
}

fn is_none_str(value: &Option<String>) -> bool {
    return match value {
        None => true,
        Some(v) => v.is_empty() || v == "NONE",
    };
}

/// Home Assistant MQTT discovery descriptor for one meter sensor
#[derive(Serialize, Clone)]
pub struct HaSensorDiscover {
    pub name: String,
    pub unique_id: String,
    pub object_id: String,
    pub state_topic: String,
    pub availability_topic: String,
    #[serde(skip_serializing_if = "is_none_str")]
    pub unit_of_measurement: Option<String>,
    #[serde(skip_serializing_if = "is_none_str")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "is_none_str")]
    pub device_class: Option<String>,
    #[serde(skip_serializing_if = "is_none_str")]
    pub state_class: Option<String>,
    pub device: HaDevice,
    pub origin: HaOrigin,
    #[serde(skip_serializing)]
    pub discover_topic: String,
}

impl HaSensorDiscover {
    pub fn new(meter: &MeterConfig, mqtt: &MqttConfig) -> Self {
        let safe_name = meter.name.replace(" ", "_").to_lowercase();
        let device_id = format!("{}_{}", mqtt.base_topic, meter.id);

        return HaSensorDiscover {
            name: meter.name.clone(),
            unique_id: format!("{device_id}_reading").to_lowercase(),
            object_id: safe_name,
            state_topic: mqtt.state_topic(&meter.id),
            availability_topic: mqtt.availability_topic(),
            unit_of_measurement: meter.unit_of_measurement.clone(),
            icon: meter.icon.clone(),
            device_class: meter.device_class.clone(),
            state_class: meter.state_class.clone(),
            device: HaDevice {
                identifiers: vec![device_id.to_lowercase()],
                name: meter.name.clone(),
                manufacturer: "rtlamr".to_string(),
                model: meter.protocol.to_string().to_uppercase(),
            },
            origin: HaOrigin {
                name: "rtlamr2mqtt".to_string(),
                sw_version: env!("CARGO_PKG_VERSION").to_string(),
            },
            discover_topic: mqtt.discovery_topic(&meter.id),
        }
    }
}
