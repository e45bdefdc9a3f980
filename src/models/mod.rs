use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::fmt;

use crate::config::MeterConfig;


/// The meter broadcast protocols rtlamr knows how to decode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MeterProtocol {
    Scm,
    ScmPlus,
    Idm,
    NetIdm,
    R900,
    R900Bcd,
}

impl MeterProtocol {
    /// Accepts both the config spelling (`scm+`) and the decoder's `Type` tag (`SCM+`)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "scm" => Some(MeterProtocol::Scm),
            "scm+" => Some(MeterProtocol::ScmPlus),
            "idm" => Some(MeterProtocol::Idm),
            "netidm" => Some(MeterProtocol::NetIdm),
            "r900" => Some(MeterProtocol::R900),
            "r900bcd" => Some(MeterProtocol::R900Bcd),
            _ => None,
        }
    }

    /// Name as understood by `rtlamr -msgtype=`
    pub fn to_string(&self) -> String {
        match self {
            MeterProtocol::Scm => "scm".to_string(),
            MeterProtocol::ScmPlus => "scm+".to_string(),
            MeterProtocol::Idm => "idm".to_string(),
            MeterProtocol::NetIdm => "netidm".to_string(),
            MeterProtocol::R900 => "r900".to_string(),
            MeterProtocol::R900Bcd => "r900bcd".to_string(),
        }
    }

    /// Field of the decoder message carrying the meter id
    pub fn id_field(&self) -> &'static str {
        match self {
            MeterProtocol::Scm => "ID",
            MeterProtocol::ScmPlus => "EndpointID",
            MeterProtocol::Idm => "ERTSerialNumber",
            MeterProtocol::NetIdm => "ERTSerialNumber",
            MeterProtocol::R900 => "ID",
            MeterProtocol::R900Bcd => "ID",
        }
    }

    /// Field of the decoder message carrying the consumption counter
    pub fn consumption_field(&self) -> &'static str {
        match self {
            MeterProtocol::Scm => "Consumption",
            MeterProtocol::ScmPlus => "Consumption",
            MeterProtocol::Idm => "LastConsumptionCount",
            MeterProtocol::NetIdm => "LastConsumptionNet",
            MeterProtocol::R900 => "Consumption",
            MeterProtocol::R900Bcd => "Consumption",
        }
    }
}

/// One decoded transmission as reported by the decoder
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RawReading {
    /// Meter identifier, kept as text so config ids compare without conversions
    pub meter_id: String,
    pub protocol: MeterProtocol,
    /// Consumption counter exactly as transmitted
    pub raw_value: u64,
    /// Decoder timestamp, or the local time when the decoder gave none
    pub received_at: DateTime<Utc>,
}

impl fmt::Display for RawReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} meter {} consumption {} at {}",
               self.protocol.to_string(), self.meter_id, self.raw_value, self.received_at.to_rfc3339())
    }
}

/// A formatted reading ready to be handed to the publisher
#[derive(Debug, Clone)]
pub struct PublishedReading {
    pub meter_id: String,
    pub formatted_value: String,
    pub config: MeterConfig,
}
