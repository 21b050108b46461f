//! Collaborator traits
//!
//! The engine works through these interfaces only. Cloud credentials, network
//! discovery, image discovery and bootstrap rendering live behind them.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};

use crate::api::*;
use crate::error::{ApiError, Result};
use crate::template::{KubeletConfiguration, NodeTemplate, map_images_to_shapes};
use crate::types::InstanceShape;

/// Cloud compute API
#[async_trait]
pub trait ComputeApi: Send + Sync {
    /// One page of instances matching all request tags
    async fn describe_instances(
        &self,
        request: &DescribeInstancesRequest,
    ) -> std::result::Result<DescribeInstancesResponse, ApiError>;

    /// Submit a multi-shape provisioning group
    async fn create_provisioning_group(
        &self,
        request: &ProvisioningGroupRequest,
    ) -> std::result::Result<ProvisioningGroupResponse, ApiError>;

    /// Delete (release) an instance
    async fn delete_instance(
        &self,
        request: &DeleteInstanceRequest,
    ) -> std::result::Result<(), ApiError>;

    /// Add tags to a resource
    async fn add_tags(&self, request: &AddTagsRequest) -> std::result::Result<(), ApiError>;
}

/// A network (vswitch) usable for launches in one zone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkCandidate {
    pub id: String,
    pub zone: String,
}

/// Zone to network resolution
#[async_trait]
pub trait NetworkResolver: Send + Sync {
    /// Network candidates keyed by zone, restricted to `zones`
    async fn zonal_networks(
        &self,
        template: &NodeTemplate,
        zones: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, NetworkCandidate>>;
}

/// Image compatibility
#[async_trait]
pub trait ImageResolver: Send + Sync {
    /// Drop shapes that cannot use the template's system disk configuration
    async fn filter_by_system_disk(
        &self,
        template: &NodeTemplate,
        shapes: &[InstanceShape],
    ) -> Vec<InstanceShape>;

    /// Shape name to compatible image id
    fn resolve_images(
        &self,
        template: &NodeTemplate,
        shapes: &[InstanceShape],
    ) -> BTreeMap<String, String> {
        map_images_to_shapes(shapes, &template.status.images)
    }
}

/// Node bootstrap script rendering
#[async_trait]
pub trait BootstrapRenderer: Send + Sync {
    /// Render the (unencoded) user data for a node with `labels`
    async fn render_user_data(
        &self,
        labels: &BTreeMap<String, String>,
        kubelet: &KubeletConfiguration,
    ) -> Result<String>;
}
