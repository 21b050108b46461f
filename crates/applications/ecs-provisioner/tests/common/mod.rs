//! In-memory cloud used by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use ecs_provisioner::{Collaborators, InstanceProvider, Options, UnavailableOfferings};
use ecs_provisioner_core::labels;
use ecs_provisioner_core::{
    AddTagsRequest, ApiError, BootstrapRenderer, Capacity, CloudInstance, ComputeApi,
    DeleteInstanceRequest, DescribeInstancesRequest, DescribeInstancesResponse, ImageRecord,
    ImageResolver, InstanceShape, KubeletConfiguration, LaunchResult, NetworkCandidate,
    NetworkResolver, NodeTemplate, Offering, ProvisionError, ProvisioningGroupRequest,
    ProvisioningGroupResponse, Requirements, Tag,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const CLUSTER_ID: &str = "c-test";
pub const REGION: &str = "cn-hangzhou";

/// Fake compute API backed by a list of instances
#[derive(Default)]
pub struct FakeCompute {
    pub instances: Mutex<Vec<CloudInstance>>,
    pub page_size: Mutex<Option<usize>>,
    pub launch_response: Mutex<Option<ProvisioningGroupResponse>>,
    pub launch_delay: Mutex<Option<Duration>>,
    pub delete_error: Mutex<Option<ApiError>>,
    /// Instance disappears from listings even though delete fails
    pub delete_error_removes: Mutex<bool>,
    pub tag_error: Mutex<Option<ApiError>>,
    pub launch_requests: Mutex<Vec<ProvisioningGroupRequest>>,
    pub tag_requests: Mutex<Vec<AddTagsRequest>>,
    pub describe_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
    launched: AtomicUsize,
}

impl FakeCompute {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_instance(&self, id: &str, status: &str) {
        self.instances.lock().unwrap().push(cloud_instance(id, status));
    }

    pub fn describe_calls(&self) -> usize {
        self.describe_calls.load(Ordering::SeqCst)
    }

    pub fn last_launch(&self) -> ProvisioningGroupRequest {
        self.launch_requests
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no provisioning group submitted")
    }
}

pub fn cloud_instance(id: &str, status: &str) -> CloudInstance {
    CloudInstance {
        instance_id: id.to_string(),
        instance_type: "ecs.g7.large".to_string(),
        zone_id: "cn-hangzhou-k".to_string(),
        status: status.to_string(),
        spot_strategy: Some("NoSpot".to_string()),
        image_id: Some("aliyun_3_x64".to_string()),
        creation_time: Some("2024-05-01T10:30Z".to_string()),
        tags: vec![Tag::new(
            labels::cluster_ownership_tag(CLUSTER_ID),
            labels::OWNED,
        )],
    }
}

pub fn not_found(id: &str) -> ApiError {
    ApiError::new("InvalidInstanceId.NotFound", format!("instance {id} does not exist"))
        .with_request_id("req-nf")
        .with_status(404)
}

#[async_trait]
impl ComputeApi for FakeCompute {
    async fn describe_instances(
        &self,
        request: &DescribeInstancesRequest,
    ) -> Result<DescribeInstancesResponse, ApiError> {
        self.describe_calls.fetch_add(1, Ordering::SeqCst);

        let matching: Vec<_> = self
            .instances
            .lock()
            .unwrap()
            .iter()
            .filter(|i| request.tags.iter().all(|t| i.tags.contains(t)))
            .cloned()
            .collect();

        let offset: usize = request
            .next_token
            .as_deref()
            .map(|t| t.parse().unwrap())
            .unwrap_or(0);
        let page_size = self.page_size.lock().unwrap().unwrap_or(usize::MAX);
        let page: Vec<_> = matching.iter().skip(offset).take(page_size).cloned().collect();
        let next = offset + page.len();

        Ok(DescribeInstancesResponse {
            request_id: Some(format!("req-describe-{offset}")),
            next_token: (next < matching.len()).then(|| next.to_string()),
            instances: page,
        })
    }

    async fn create_provisioning_group(
        &self,
        request: &ProvisioningGroupRequest,
    ) -> Result<ProvisioningGroupResponse, ApiError> {
        self.launch_requests.lock().unwrap().push(request.clone());

        let delay = *self.launch_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(response) = self.launch_response.lock().unwrap().clone() {
            return Ok(response);
        }

        let config = &request.launch_template_configs[0];
        let zone = config.network_id.trim_start_matches("vsw-").to_string();
        let id = format!("i-launched-{}", self.launched.fetch_add(1, Ordering::SeqCst));

        let mut instance = cloud_instance(&id, "Pending");
        instance.instance_type = config.instance_type.clone();
        instance.zone_id = zone.clone();
        instance.tags = request.launch_configuration.tags.clone();
        self.instances.lock().unwrap().push(instance);

        Ok(ProvisioningGroupResponse {
            status_code: 200,
            request_id: Some("req-launch".to_string()),
            group_id: Some("apg-1".to_string()),
            launch_results: Some(vec![LaunchResult {
                instance_type: Some(config.instance_type.clone()),
                zone_id: Some(zone),
                instance_ids: vec![id],
                ..Default::default()
            }]),
        })
    }

    async fn delete_instance(&self, request: &DeleteInstanceRequest) -> Result<(), ApiError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        assert!(request.force && request.terminate_subscription);

        let mut instances = self.instances.lock().unwrap();
        if let Some(err) = self.delete_error.lock().unwrap().clone() {
            if *self.delete_error_removes.lock().unwrap() {
                instances.retain(|i| i.instance_id != request.instance_id);
            }
            return Err(err);
        }

        let before = instances.len();
        instances.retain(|i| i.instance_id != request.instance_id);
        if instances.len() == before {
            return Err(not_found(&request.instance_id));
        }
        Ok(())
    }

    async fn add_tags(&self, request: &AddTagsRequest) -> Result<(), ApiError> {
        self.tag_requests.lock().unwrap().push(request.clone());
        if let Some(err) = self.tag_error.lock().unwrap().clone() {
            return Err(err);
        }

        let mut instances = self.instances.lock().unwrap();
        let Some(instance) = instances
            .iter_mut()
            .find(|i| i.instance_id == request.resource_id)
        else {
            return Err(not_found(&request.resource_id));
        };
        for tag in &request.tags {
            instance.tags.retain(|t| t.key != tag.key);
            instance.tags.push(tag.clone());
        }
        Ok(())
    }
}

/// One vswitch per requested zone, named `vsw-<zone>`
#[derive(Default)]
pub struct FakeNetworks {
    pub requested: Mutex<Vec<BTreeSet<String>>>,
}

#[async_trait]
impl NetworkResolver for FakeNetworks {
    async fn zonal_networks(
        &self,
        _template: &NodeTemplate,
        zones: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, NetworkCandidate>, ProvisionError> {
        self.requested.lock().unwrap().push(zones.clone());
        Ok(zones
            .iter()
            .map(|z| {
                (
                    z.clone(),
                    NetworkCandidate {
                        id: format!("vsw-{z}"),
                        zone: z.clone(),
                    },
                )
            })
            .collect())
    }
}

/// Keeps every shape except those named in `incompatible`
#[derive(Default)]
pub struct FakeImages {
    pub incompatible: Mutex<BTreeSet<String>>,
}

#[async_trait]
impl ImageResolver for FakeImages {
    async fn filter_by_system_disk(
        &self,
        _template: &NodeTemplate,
        shapes: &[InstanceShape],
    ) -> Vec<InstanceShape> {
        let incompatible = self.incompatible.lock().unwrap();
        shapes
            .iter()
            .filter(|s| !incompatible.contains(&s.name))
            .cloned()
            .collect()
    }
}

/// Renders labels as `key=value` lines
#[derive(Default)]
pub struct FakeBootstrap;

#[async_trait]
impl BootstrapRenderer for FakeBootstrap {
    async fn render_user_data(
        &self,
        labels: &BTreeMap<String, String>,
        _kubelet: &KubeletConfiguration,
    ) -> Result<String, ProvisionError> {
        let lines: Vec<_> = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
        Ok(format!("#!/bin/bash\n{}\n", lines.join("\n")))
    }
}

pub struct Harness {
    pub compute: Arc<FakeCompute>,
    pub networks: Arc<FakeNetworks>,
    pub images: Arc<FakeImages>,
    pub unavailable: Arc<UnavailableOfferings>,
    pub provider: InstanceProvider,
}

pub fn harness() -> Harness {
    harness_with(Options::new(CLUSTER_ID, REGION))
}

pub fn harness_with(options: Options) -> Harness {
    ecs_provisioner::telemetry::init_tracing();

    let compute = FakeCompute::new();
    let networks = Arc::new(FakeNetworks::default());
    let images = Arc::new(FakeImages::default());
    let unavailable = Arc::new(UnavailableOfferings::new());

    let provider = InstanceProvider::new(
        &options,
        Collaborators {
            compute: compute.clone(),
            networks: networks.clone(),
            images: images.clone(),
            bootstrap: Arc::new(FakeBootstrap),
        },
        Arc::clone(&unavailable),
    )
    .with_rng_seed(7);

    Harness {
        compute,
        networks,
        images,
        unavailable,
        provider,
    }
}

/// Template with one image compatible with every shape
pub fn template() -> NodeTemplate {
    let mut template = NodeTemplate::new("default");
    template.status.images.push(ImageRecord {
        id: "aliyun_3_x64".to_string(),
        requirements: Requirements::new(),
    });
    template.status.security_group_ids.push("sg-1".to_string());
    template
}

pub fn shape(name: &str, offerings: impl IntoIterator<Item = Offering>) -> InstanceShape {
    offerings.into_iter().fold(
        InstanceShape::new(name, Capacity::new(4, 16384))
            .with_label(labels::INSTANCE_SIZE, "xlarge"),
        InstanceShape::with_offering,
    )
}
