//! Cloud compute API wire model
//!
//! Request and response shapes for the four calls the engine makes:
//! list-by-tag, create-provisioning-group, delete-instance and add-tags.

use crate::types::PricingModel;
use serde::{Deserialize, Serialize};

/// Stock-out error code
pub const ERR_CODE_NO_INSTANCE_STOCK: &str = "NoInstanceStock";

/// Stock-out error code, returned by some regions instead of `NoInstanceStock`
pub const ERR_CODE_OPERATION_DENIED_NO_STOCK: &str = "OperationDenied.NoStock";

/// Whether an upstream error code signals exhausted capacity
pub fn is_stock_out(code: &str) -> bool {
    code == ERR_CODE_NO_INSTANCE_STOCK || code == ERR_CODE_OPERATION_DENIED_NO_STOCK
}

/// Allocation strategy for both pricing models
pub const ALLOCATION_LOWEST_PRICE: &str = "lowest-price";

/// Provisioning group fulfilled once, synchronously
pub const GROUP_TYPE_INSTANT: &str = "instant";

/// Spot strategy value the API uses for on-demand instances
pub const SPOT_STRATEGY_NO_SPOT: &str = "NoSpot";

/// Key/value tag
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// One page of a tag-filtered instance listing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DescribeInstancesRequest {
    pub region_id: String,
    pub tags: Vec<Tag>,
    /// Continuation token from the previous page
    pub next_token: Option<String>,
}

/// Instance as reported by the cloud API
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudInstance {
    pub instance_id: String,
    pub instance_type: String,
    pub zone_id: String,
    pub status: String,
    pub spot_strategy: Option<String>,
    pub image_id: Option<String>,
    pub creation_time: Option<String>,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

impl CloudInstance {
    /// Pricing model derived from the spot strategy
    pub fn pricing_model(&self) -> PricingModel {
        match self.spot_strategy.as_deref() {
            None | Some("") | Some(SPOT_STRATEGY_NO_SPOT) => PricingModel::OnDemand,
            Some(_) => PricingModel::Spot,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DescribeInstancesResponse {
    pub request_id: Option<String>,
    #[serde(default)]
    pub instances: Vec<CloudInstance>,
    /// Empty or absent on the last page
    pub next_token: Option<String>,
}

/// One shape/network candidate in a provisioning group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchTemplateConfig {
    pub instance_type: String,
    /// Network (vswitch) the instance would attach to; implies the zone
    pub network_id: String,
    pub weighted_capacity: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemDiskConfig {
    pub disk_category: String,
}

/// Settings shared by every candidate in the group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchConfiguration {
    pub image_id: String,
    /// Base64-encoded bootstrap script
    pub user_data: String,
    pub resource_group_id: Option<String>,
    pub security_group_ids: Vec<String>,
    pub system_disk_size: Option<i32>,
    pub system_disk_performance_level: Option<String>,
    pub tags: Vec<Tag>,
}

/// Multi-shape launch request, fulfilled by the API with its allocation strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningGroupRequest {
    pub region_id: String,
    /// Idempotency token
    pub client_token: String,
    pub group_type: String,
    pub total_target_capacity: String,
    pub spot_target_capacity: String,
    pub pay_as_you_go_target_capacity: String,
    pub spot_allocation_strategy: String,
    pub pay_as_you_go_allocation_strategy: String,
    pub excess_capacity_termination_policy: String,
    pub launch_template_configs: Vec<LaunchTemplateConfig>,
    pub launch_configuration: LaunchConfiguration,
    pub system_disk_configs: Vec<SystemDiskConfig>,
    /// Tags on the group itself
    pub tags: Vec<Tag>,
}

impl ProvisioningGroupRequest {
    /// Pricing model the target capacity was split towards
    pub fn pricing_model(&self) -> PricingModel {
        if self.spot_target_capacity == "1" {
            PricingModel::Spot
        } else {
            PricingModel::OnDemand
        }
    }
}

/// Outcome for one candidate of a provisioning group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchResult {
    pub instance_type: Option<String>,
    pub zone_id: Option<String>,
    pub error_code: Option<String>,
    pub error_msg: Option<String>,
    #[serde(default)]
    pub instance_ids: Vec<String>,
}

impl LaunchResult {
    /// Shape and zone of a stock-out result, if this is one with both populated
    pub fn stock_out(&self) -> Option<(&str, &str)> {
        let code = self.error_code.as_deref()?;
        if !is_stock_out(code) {
            return None;
        }
        let shape = self.instance_type.as_deref().filter(|s| !s.is_empty())?;
        let zone = self.zone_id.as_deref().filter(|z| !z.is_empty())?;
        Some((shape, zone))
    }

    /// Whether the error code is a recognised stock-out, regardless of shape/zone
    pub fn is_stock_out(&self) -> bool {
        self.error_code.as_deref().is_some_and(is_stock_out)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvisioningGroupResponse {
    pub status_code: u16,
    pub request_id: Option<String>,
    pub group_id: Option<String>,
    /// Absent on malformed responses
    pub launch_results: Option<Vec<LaunchResult>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteInstanceRequest {
    pub instance_id: String,
    pub force: bool,
    pub terminate_subscription: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddTagsRequest {
    pub region_id: String,
    pub resource_type: String,
    pub resource_id: String,
    pub tags: Vec<Tag>,
}
