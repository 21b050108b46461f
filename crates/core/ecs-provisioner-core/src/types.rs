//! Core types shared across the provisioner

use crate::labels;
use crate::requirements::Requirements;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Pricing model of an offering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PricingModel {
    /// Preemptible, variable price
    Spot,
    /// Stable price, no preemption
    OnDemand,
}

impl PricingModel {
    /// Label value used in requirements
    pub fn as_str(&self) -> &'static str {
        match self {
            PricingModel::Spot => "spot",
            PricingModel::OnDemand => "on-demand",
        }
    }
}

impl fmt::Display for PricingModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PricingModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spot" => Ok(PricingModel::Spot),
            "on-demand" => Ok(PricingModel::OnDemand),
            other => Err(format!("unknown pricing model: {other}")),
        }
    }
}

/// One priced, zoned way to run a shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offering {
    /// Spot or on-demand
    pub pricing_model: PricingModel,

    /// Zone id
    pub zone: String,

    /// Hourly price
    pub price: f64,

    /// False once capacity is known to be exhausted
    pub available: bool,
}

impl Offering {
    /// Create an available offering
    pub fn new(pricing_model: PricingModel, zone: impl Into<String>, price: f64) -> Self {
        Self {
            pricing_model,
            zone: zone.into(),
            price,
            available: true,
        }
    }

    /// Spot offering
    pub fn spot(zone: impl Into<String>, price: f64) -> Self {
        Self::new(PricingModel::Spot, zone, price)
    }

    /// On-demand offering
    pub fn on_demand(zone: impl Into<String>, price: f64) -> Self {
        Self::new(PricingModel::OnDemand, zone, price)
    }

    /// Mark as unavailable
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Whether the request's capacity-type and zone requirements admit this offering
    pub fn is_compatible(&self, requirements: &Requirements) -> bool {
        requirements.allows(labels::CAPACITY_TYPE, self.pricing_model.as_str())
            && requirements.allows(labels::TOPOLOGY_ZONE, &self.zone)
    }
}

/// Resource capacity of a shape
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    /// vCPU count
    pub cpu: u32,

    /// Memory in MiB
    pub memory_mib: u64,

    /// NVIDIA accelerator count
    #[serde(default)]
    pub nvidia_gpu: u32,

    /// AMD accelerator count
    #[serde(default)]
    pub amd_gpu: u32,
}

impl Capacity {
    /// CPU and memory only
    pub fn new(cpu: u32, memory_mib: u64) -> Self {
        Self {
            cpu,
            memory_mib,
            ..Default::default()
        }
    }

    /// Whether any accelerator is attached
    pub fn has_accelerators(&self) -> bool {
        self.nvidia_gpu > 0 || self.amd_gpu > 0
    }
}

/// A compute SKU together with its offerings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceShape {
    /// Shape name (e.g. `ecs.g7.large`)
    pub name: String,

    /// Shape labels (arch, size, family, ...)
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Capacity vector
    pub capacity: Capacity,

    /// Priced availability per zone and pricing model
    #[serde(default)]
    pub offerings: Vec<Offering>,
}

impl InstanceShape {
    /// Create a shape with no offerings
    pub fn new(name: impl Into<String>, capacity: Capacity) -> Self {
        Self {
            name: name.into(),
            labels: BTreeMap::new(),
            capacity,
            offerings: Vec::new(),
        }
    }

    /// Set a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Add an offering
    pub fn with_offering(mut self, offering: Offering) -> Self {
        self.offerings.push(offering);
        self
    }

    /// Label value, with the shape name standing in for the instance-type key
    pub fn label(&self, key: &str) -> Option<&str> {
        if key == labels::INSTANCE_TYPE {
            return Some(&self.name);
        }
        self.labels.get(key).map(String::as_str)
    }

    /// Offerings not marked unavailable
    pub fn available_offerings(&self) -> impl Iterator<Item = &Offering> {
        self.offerings.iter().filter(|o| o.available)
    }

    /// Available offerings the requirements admit
    pub fn compatible_offerings<'a>(
        &'a self,
        requirements: &'a Requirements,
    ) -> impl Iterator<Item = &'a Offering> {
        self.available_offerings()
            .filter(move |o| o.is_compatible(requirements))
    }

    /// Cheapest available offering regardless of requirements
    pub fn cheapest_available(&self) -> Option<&Offering> {
        self.available_offerings()
            .min_by(|a, b| a.price.total_cmp(&b.price))
    }

    /// Bare-metal sizes and accelerator shapes are deprioritised
    pub fn is_exotic(&self) -> bool {
        let metal = self
            .labels
            .get(labels::INSTANCE_SIZE)
            .is_some_and(|size| size.contains("metal"));
        metal || self.capacity.has_accelerators()
    }
}

/// Lifecycle status of a launched instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    /// Accepted, not yet booting
    Pending,
    /// Booting
    Starting,
    /// Running
    Running,
    /// Shutting down
    Stopping,
    /// Stopped or released
    Terminated,
}

impl InstanceStatus {
    /// The cloud API rejects deletes while an instance is in these phases
    pub fn is_transitional(&self) -> bool {
        matches!(self, Self::Pending | Self::Starting)
    }

    /// Map a cloud status string. Unknown values are treated as `Pending`.
    pub fn from_cloud(status: &str) -> Self {
        match status {
            "Pending" => Self::Pending,
            "Starting" => Self::Starting,
            "Running" => Self::Running,
            "Stopping" => Self::Stopping,
            "Stopped" | "Terminated" | "Deleted" => Self::Terminated,
            _ => Self::Pending,
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Terminated => "Terminated",
        };
        f.write_str(s)
    }
}

/// Provider-side record of a launched compute instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchedInstance {
    /// Instance id
    pub id: String,

    /// Resolved shape name
    pub shape: String,

    /// Zone id
    pub zone: String,

    /// Pricing model the instance runs under
    pub pricing_model: PricingModel,

    /// Lifecycle status
    pub status: InstanceStatus,

    /// Image the instance booted from
    pub image_id: Option<String>,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Tags
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Abstract request for a new worker node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeRequest {
    /// Request name (for logging)
    pub name: String,

    /// Labels the node will carry
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Constraints on shape, zone and pricing model
    #[serde(default)]
    pub requirements: Requirements,
}

impl NodeRequest {
    /// Create a request with no constraints
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Set the requirements
    pub fn with_requirements(mut self, requirements: Requirements) -> Self {
        self.requirements = requirements;
        self
    }

    /// Owning node group, empty if unlabelled
    pub fn node_pool(&self) -> &str {
        self.labels
            .get(labels::NODE_POOL)
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// Whether the requirements admit `pricing_model`
    pub fn allows(&self, pricing_model: PricingModel) -> bool {
        self.requirements
            .allows(labels::CAPACITY_TYPE, pricing_model.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requirements::Requirement;

    #[test]
    fn test_pricing_model_round_trip() {
        assert_eq!("spot".parse::<PricingModel>(), Ok(PricingModel::Spot));
        assert_eq!(PricingModel::OnDemand.to_string(), "on-demand");
        assert!("reserved".parse::<PricingModel>().is_err());
    }

    #[test]
    fn test_exotic_shapes() {
        let metal = InstanceShape::new("ecs.ebmg7.32xlarge", Capacity::new(128, 524288))
            .with_label(labels::INSTANCE_SIZE, "metal");
        let gpu = InstanceShape::new(
            "ecs.gn7i-c8g1.2xlarge",
            Capacity {
                nvidia_gpu: 1,
                ..Capacity::new(8, 30720)
            },
        );
        let general = InstanceShape::new("ecs.g7.large", Capacity::new(2, 8192))
            .with_label(labels::INSTANCE_SIZE, "large");

        assert!(metal.is_exotic());
        assert!(gpu.is_exotic());
        assert!(!general.is_exotic());
    }

    #[test]
    fn test_cheapest_available_skips_unavailable() {
        let shape = InstanceShape::new("ecs.g7.large", Capacity::new(2, 8192))
            .with_offering(Offering::spot("cn-hangzhou-a", 0.01).unavailable())
            .with_offering(Offering::spot("cn-hangzhou-b", 0.05))
            .with_offering(Offering::on_demand("cn-hangzhou-a", 0.10));

        let cheapest = shape.cheapest_available().unwrap();
        assert_eq!(cheapest.zone, "cn-hangzhou-b");
        assert_eq!(cheapest.price, 0.05);
    }

    #[test]
    fn test_compatible_offerings_respect_requirements() {
        let shape = InstanceShape::new("ecs.g7.large", Capacity::new(2, 8192))
            .with_offering(Offering::spot("cn-hangzhou-a", 0.03))
            .with_offering(Offering::on_demand("cn-hangzhou-a", 0.10))
            .with_offering(Offering::on_demand("cn-hangzhou-b", 0.10));

        let reqs = Requirements::new()
            .with(Requirement::new_in(labels::CAPACITY_TYPE, ["on-demand"]))
            .with(Requirement::new_in(labels::TOPOLOGY_ZONE, ["cn-hangzhou-b"]));

        let compatible: Vec<_> = shape.compatible_offerings(&reqs).collect();
        assert_eq!(compatible.len(), 1);
        assert_eq!(compatible[0].zone, "cn-hangzhou-b");
    }

    #[test]
    fn test_instance_status_from_cloud() {
        assert_eq!(InstanceStatus::from_cloud("Running"), InstanceStatus::Running);
        assert_eq!(InstanceStatus::from_cloud("Stopped"), InstanceStatus::Terminated);
        assert_eq!(InstanceStatus::from_cloud("Weird"), InstanceStatus::Pending);
        assert!(InstanceStatus::Starting.is_transitional());
        assert!(!InstanceStatus::Running.is_transitional());
    }

    #[test]
    fn test_shape_label_uses_name_for_instance_type() {
        let shape = InstanceShape::new("ecs.g7.large", Capacity::new(2, 8192));
        assert_eq!(shape.label(labels::INSTANCE_TYPE), Some("ecs.g7.large"));
        assert_eq!(shape.label(labels::ARCH), None);
    }
}
