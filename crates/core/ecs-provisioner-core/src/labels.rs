//! Well-known label and tag keys

/// Pricing model of a node (`spot` or `on-demand`)
pub const CAPACITY_TYPE: &str = "karpenter.sh/capacity-type";

/// Zone a node runs in
pub const TOPOLOGY_ZONE: &str = "topology.kubernetes.io/zone";

/// Instance shape name
pub const INSTANCE_TYPE: &str = "node.kubernetes.io/instance-type";

/// Instance size within a family (e.g. `large`, `metal`)
pub const INSTANCE_SIZE: &str = "karpenter.k8s.alibabacloud/instance-size";

/// CPU architecture
pub const ARCH: &str = "kubernetes.io/arch";

/// Owning node group
pub const NODE_POOL: &str = "karpenter.sh/nodepool";

/// Node template that produced a node
pub const NODE_CLASS: &str = "karpenter.k8s.alibabacloud/ecsnodeclass";

/// Tag carrying the managed cluster id
pub const CLUSTER_ID_TAG: &str = "ack.aliyun.com";

/// API group used to tag provisioning groups
pub const API_GROUP: &str = "karpenter.k8s.alibabacloud";

/// Ownership tag key for a cluster (`kubernetes.io/cluster/<id>`)
pub fn cluster_ownership_tag(cluster_id: &str) -> String {
    format!("kubernetes.io/cluster/{cluster_id}")
}

/// Value of the cluster ownership tag
pub const OWNED: &str = "owned";
