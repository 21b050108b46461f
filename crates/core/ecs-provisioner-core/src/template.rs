//! Node template
//!
//! The template is owned and reconciled elsewhere. The engine reads its spec
//! (tags, disk, zone-selection policy, kubelet settings) and its resolved
//! status (images, security groups) at launch time.

use crate::requirements::Requirements;
use crate::types::InstanceShape;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a zone is chosen per shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ZoneSelectionPolicy {
    /// Cheapest zone for spot, random for on-demand
    #[default]
    CostOptimized,
    /// Random zone regardless of price
    Balanced,
}

/// System disk settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemDisk {
    /// Acceptable disk categories, in preference order
    #[serde(default)]
    pub categories: Vec<String>,

    /// Size in GiB
    pub size_gib: Option<i32>,

    /// Performance level (e.g. `PL0`)
    pub performance_level: Option<String>,
}

impl Default for SystemDisk {
    fn default() -> Self {
        Self {
            categories: vec![
                "cloud_essd".to_string(),
                "cloud_ssd".to_string(),
                "cloud_efficiency".to_string(),
            ],
            size_gib: Some(20),
            performance_level: Some("PL0".to_string()),
        }
    }
}

/// Kubelet settings passed through to the bootstrap renderer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeletConfiguration {
    #[serde(default)]
    pub cluster_dns: Vec<String>,
    pub max_pods: Option<i32>,
    pub pods_per_core: Option<i32>,
    #[serde(default)]
    pub system_reserved: BTreeMap<String, String>,
    #[serde(default)]
    pub kube_reserved: BTreeMap<String, String>,
    #[serde(default)]
    pub eviction_hard: BTreeMap<String, String>,
    #[serde(default)]
    pub eviction_soft: BTreeMap<String, String>,
}

/// A resolved machine image and the shapes it can boot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Image id
    pub id: String,

    /// Shape labels the image needs (arch, family, ...)
    #[serde(default)]
    pub requirements: Requirements,
}

/// Desired settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeTemplateSpec {
    #[serde(default)]
    pub zone_selection_policy: ZoneSelectionPolicy,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub resource_group_id: Option<String>,
    pub system_disk: Option<SystemDisk>,
    pub kubelet: Option<KubeletConfiguration>,
}

/// Resolved state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeTemplateStatus {
    /// Candidate images, newest first
    #[serde(default)]
    pub images: Vec<ImageRecord>,

    /// Security group ids
    #[serde(default)]
    pub security_group_ids: Vec<String>,
}

/// Image, network, tag and disk selection criteria for new nodes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeTemplate {
    pub name: String,
    #[serde(default)]
    pub spec: NodeTemplateSpec,
    #[serde(default)]
    pub status: NodeTemplateStatus,
}

impl NodeTemplate {
    /// Template with default spec and empty status
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Configured system disk, or the default one
    pub fn system_disk(&self) -> SystemDisk {
        self.spec.system_disk.clone().unwrap_or_default()
    }

    /// Configured kubelet settings, or defaults
    pub fn kubelet(&self) -> KubeletConfiguration {
        self.spec.kubelet.clone().unwrap_or_default()
    }
}

/// Map each shape to the first image whose requirements its labels satisfy.
///
/// Shapes with no compatible image are absent from the result.
pub fn map_images_to_shapes(
    shapes: &[InstanceShape],
    images: &[ImageRecord],
) -> BTreeMap<String, String> {
    let mut mapped = BTreeMap::new();
    for shape in shapes {
        if let Some(image) = images
            .iter()
            .find(|img| img.requirements.compatible_with(&shape.labels))
        {
            mapped.insert(shape.name.clone(), image.id.clone());
        }
    }
    mapped
}
