use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::config::ConfigError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct VehicleLabel {
    pub plate: String,
    pub vin: String,
    pub make: String,
    pub model: String,
}

/// Display names for the vehicles, companies and technicians bookings refer to.
///
/// Loaded from a JSON document:
/// `{"vehicles": {"<id>": {"plate", "vin", "make", "model"}},
///   "companies": {"<id>": "<name>"}, "technicians": {"<id>": "<name>"}}`.
/// Unknown ids display as themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Labels {
    pub vehicles: HashMap<String, VehicleLabel>,
    pub companies: HashMap<String, String>,
    pub technicians: HashMap<String, String>,
}

impl Labels {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Labels(format!("{}: {e}", path.display())))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|e| ConfigError::Labels(e.to_string()))
    }

    pub fn vehicle(&self, id: &str) -> Option<&VehicleLabel> {
        self.vehicles.get(id)
    }

    /// Plate, else VIN, else the raw id.
    pub fn unit(&self, vehicle_id: &str) -> String {
        match self.vehicle(vehicle_id) {
            Some(v) if !v.plate.is_empty() => v.plate.clone(),
            Some(v) if !v.vin.is_empty() => v.vin.clone(),
            _ => vehicle_id.to_string(),
        }
    }

    pub fn company(&self, id: &str) -> String {
        self.companies.get(id).cloned().unwrap_or_else(|| id.to_string())
    }

    pub fn technician_names(&self, ids: &[String]) -> Vec<String> {
        ids.iter()
            .map(|id| self.technicians.get(id).cloned().unwrap_or_else(|| id.clone()))
            .collect()
    }
}
