//! Compute instance provider
//!
//! Launches, looks up, lists, deletes and tags the cluster's compute
//! instances. A launch submits one provisioning group carrying every viable
//! shape and zone so the cloud picks the cheapest fulfilment.
//!
//! The provider owns the instance read cache and the launch rate limiter. The
//! unavailable-offerings cache is shared with instance-type providers and is
//! handed in at construction.

use crate::cache::{INSTANCE_CACHE_TTL, TtlCache};
use crate::limiter::LaunchRateLimiter;
use crate::options::Options;
use crate::selection::{self, MAX_INSTANCE_SHAPES};
use crate::unavailable::UnavailableOfferings;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, NaiveDateTime, Utc};
use ecs_provisioner_core::labels;
use ecs_provisioner_core::{
    ALLOCATION_LOWEST_PRICE, AddTagsRequest, BootstrapRenderer, CloudInstance, ComputeApi,
    DeleteInstanceRequest, DescribeInstancesRequest, GROUP_TYPE_INSTANT, ImageResolver,
    InstanceShape, InstanceStatus, LaunchConfiguration, LaunchResult, LaunchTemplateConfig,
    LaunchedInstance, NetworkCandidate, NetworkResolver, NodeRequest, NodeTemplate, PricingModel,
    ProvisionError, ProvisioningGroupRequest, ProvisioningGroupResponse, Requirements, Result,
    SystemDiskConfig, Tag,
};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const RESOURCE_TYPE_INSTANCE: &str = "instance";
const EXCESS_CAPACITY_TERMINATION: &str = "termination";
const CREATION_TIME_MINUTES: &str = "%Y-%m-%dT%H:%MZ";

/// External services the provider drives
#[derive(Clone)]
pub struct Collaborators {
    /// Cloud compute API
    pub compute: Arc<dyn ComputeApi>,
    /// Zone to network resolution
    pub networks: Arc<dyn NetworkResolver>,
    /// Disk filtering and image mapping
    pub images: Arc<dyn ImageResolver>,
    /// User data rendering
    pub bootstrap: Arc<dyn BootstrapRenderer>,
}

/// Outcome of a submitted provisioning group
struct Launch {
    group: ProvisioningGroupRequest,
    result: LaunchResult,
    zones: BTreeMap<String, String>,
}

/// Provisioning engine for one cluster
pub struct InstanceProvider {
    region: String,
    cluster_id: String,
    api_timeout: Duration,
    compute: Arc<dyn ComputeApi>,
    networks: Arc<dyn NetworkResolver>,
    images: Arc<dyn ImageResolver>,
    bootstrap: Arc<dyn BootstrapRenderer>,
    instance_cache: TtlCache<String, LaunchedInstance>,
    unavailable_offerings: Arc<UnavailableOfferings>,
    limiter: LaunchRateLimiter,
    rng: Mutex<StdRng>,
    shutdown_tx: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl InstanceProvider {
    /// Create a provider. Call [`InstanceProvider::start`] to run background work.
    pub fn new(
        options: &Options,
        collaborators: Collaborators,
        unavailable_offerings: Arc<UnavailableOfferings>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        info!(
            cluster_id = %options.cluster_id,
            region = %options.region,
            provisioning_qps = options.provisioning_qps,
            "instance provider created"
        );

        Self {
            region: options.region.clone(),
            cluster_id: options.cluster_id.clone(),
            api_timeout: options.api_timeout(),
            compute: collaborators.compute,
            networks: collaborators.networks,
            images: collaborators.images,
            bootstrap: collaborators.bootstrap,
            instance_cache: TtlCache::new(INSTANCE_CACHE_TTL),
            unavailable_offerings,
            limiter: LaunchRateLimiter::new(options.provisioning_qps),
            rng: Mutex::new(StdRng::from_entropy()),
            shutdown_tx,
            sweeper: Mutex::new(None),
        }
    }

    /// Seed the zone-selection random source
    pub fn with_rng_seed(self, seed: u64) -> Self {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    /// Start the unavailable-offerings sweeper. No-op if running or shut down.
    pub fn start(&self) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() || *self.shutdown_tx.borrow() {
            return;
        }
        *sweeper = Some(
            self.unavailable_offerings
                .start_sweeper(self.shutdown_tx.subscribe()),
        );
    }

    /// Stop background work and wait for it to finish
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);

        let handle = self.sweeper.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "unavailable offerings sweeper did not stop cleanly");
            }
        }
        debug!("instance provider shut down");
    }

    /// Records held by the instance read cache, expired ones included
    pub fn cached_instances(&self) -> usize {
        self.instance_cache.len()
    }

    /// Negative cache shared with instance-type providers
    pub fn unavailable_offerings(&self) -> &Arc<UnavailableOfferings> {
        &self.unavailable_offerings
    }

    /// Launch one instance for `request`.
    ///
    /// `deadline` bounds both the rate-limiter wait and every outbound call.
    pub async fn create(
        &self,
        template: &NodeTemplate,
        request: &NodeRequest,
        shapes: Vec<InstanceShape>,
        deadline: Instant,
    ) -> Result<LaunchedInstance> {
        self.limiter.wait(deadline).await?;

        // Min-values rules need the full candidate spread
        let shapes = if request.requirements.has_min_values() {
            shapes
        } else {
            selection::filter_shapes(request, shapes)
        };
        let shapes = selection::truncate(&request.requirements, shapes, MAX_INSTANCE_SHAPES)?;
        let tags = self.tags(template, request);

        let launch = self
            .launch_instance(template, request, shapes, &tags, deadline)
            .await
            .inspect_err(|e| {
                error!(node_request = %request.name, request_id = ?e.request_id(), error = %e, "failed to launch instance")
            })?;

        let instance = instance_from_launch(&launch)?;
        self.instance_cache
            .insert(instance.id.clone(), instance.clone());

        info!(
            instance_id = %instance.id,
            instance_type = %instance.shape,
            zone = %instance.zone,
            capacity_type = %instance.pricing_model,
            "launched instance"
        );
        Ok(instance)
    }

    /// Cached record, falling back to one full listing
    pub async fn get(&self, id: &str) -> Result<LaunchedInstance> {
        if let Some(instance) = self.instance_cache.get(id) {
            return Ok(instance);
        }

        self.list().await?;

        self.instance_cache
            .get(id)
            .ok_or_else(|| ProvisionError::NotFound(id.to_string()))
    }

    /// Every instance owned by the cluster. Always queries the API and refreshes the cache.
    pub async fn list(&self) -> Result<Vec<LaunchedInstance>> {
        let mut request = DescribeInstancesRequest {
            region_id: self.region.clone(),
            tags: vec![Tag::new(
                labels::cluster_ownership_tag(&self.cluster_id),
                labels::OWNED,
            )],
            next_token: None,
        };

        let mut instances = Vec::new();
        loop {
            let page = self
                .bounded(self.compute.describe_instances(&request))
                .await?
                .map_err(|e| ProvisionError::api("listing instances", e))?;

            if page.instances.is_empty() {
                break;
            }
            instances.extend(page.instances.iter().map(instance_from_cloud));

            match page.next_token.filter(|token| !token.is_empty()) {
                Some(token) => request.next_token = Some(token),
                None => break,
            }
        }

        // Ids that left the cluster are never rewritten, so drop them here
        let purged = self.instance_cache.purge_expired();
        self.instance_cache
            .extend(instances.iter().map(|i| (i.id.clone(), i.clone())));
        debug!(count = instances.len(), purged, "synced instance cache");

        Ok(instances)
    }

    /// Release an instance.
    ///
    /// Returns [`ProvisionError::NotFound`] when it is already gone, on every call.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let instance = self.get(id).await?;

        if instance.status.is_transitional() {
            return Err(ProvisionError::OperationNotSupported {
                instance_id: id.to_string(),
                status: instance.status,
            });
        }

        let request = DeleteInstanceRequest {
            instance_id: id.to_string(),
            force: true,
            terminate_subscription: true,
        };

        match self.bounded(self.compute.delete_instance(&request)).await? {
            Ok(()) => {
                self.instance_cache.remove(id);
                info!(instance_id = %id, "deleted instance");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                self.instance_cache.remove(id);
                Err(ProvisionError::NotFound(id.to_string()))
            }
            Err(e) => {
                // A concurrent delete surfaces as an error here; look again past the cache
                self.instance_cache.remove(id);
                let lookup = match self.get(id).await {
                    Err(lookup) if lookup.is_not_found() => return Err(lookup),
                    Err(lookup) => Some(Box::new(lookup)),
                    Ok(_) => None,
                };
                warn!(instance_id = %id, error = %e, "failed to delete instance");
                Err(ProvisionError::DeleteFailed {
                    instance_id: id.to_string(),
                    source: e,
                    lookup,
                })
            }
        }
    }

    /// Add tags to an instance, then resync the cache from a full listing
    pub async fn create_tags(&self, id: &str, tags: &BTreeMap<String, String>) -> Result<()> {
        let request = AddTagsRequest {
            region_id: self.region.clone(),
            resource_type: RESOURCE_TYPE_INSTANCE.to_string(),
            resource_id: id.to_string(),
            tags: tags.iter().map(|(k, v)| Tag::new(k, v)).collect(),
        };

        let tagged = match self.bounded(self.compute.add_tags(&request)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.is_not_found() => Err(ProvisionError::NotFound(id.to_string())),
            Ok(Err(e)) => Err(ProvisionError::api(format!("tagging instance {id}"), e)),
            Err(timeout) => Err(timeout),
        };

        // Tags feed the cached record, so resync whatever the outcome
        let resynced = self.list().await;

        tagged?;
        resynced.map(|_| ())
    }

    /// Template tags overlaid with the ownership tags the provider relies on
    pub fn tags(&self, template: &NodeTemplate, request: &NodeRequest) -> BTreeMap<String, String> {
        let mut tags = template.spec.tags.clone();
        tags.extend([
            (labels::cluster_ownership_tag(&self.cluster_id), labels::OWNED.to_string()),
            (labels::NODE_POOL.to_string(), request.node_pool().to_string()),
            (labels::CLUSTER_ID_TAG.to_string(), self.cluster_id.clone()),
            (labels::NODE_CLASS.to_string(), template.name.clone()),
        ]);
        tags
    }

    async fn launch_instance(
        &self,
        template: &NodeTemplate,
        request: &NodeRequest,
        shapes: Vec<InstanceShape>,
        tags: &BTreeMap<String, String>,
        deadline: Instant,
    ) -> Result<Launch> {
        let pricing_model = selection::capacity_type(request, &shapes);
        if let Some(warning) = selection::flexibility_warning(request, &shapes, pricing_model) {
            warn!(node_request = %request.name, "{warning}");
        }
        let requirements = selection::with_pricing_model(&request.requirements, pricing_model);

        let shapes = until(deadline, self.images.filter_by_system_disk(template, &shapes)).await?;
        let Some(first) = shapes.first() else {
            return Err(ProvisionError::NoCompatibleShapes(
                "no instance types satisfy the system disk requirements".to_string(),
            ));
        };

        let images = self.images.resolve_images(template, &shapes);
        let image_id = images
            .get(&first.name)
            .cloned()
            .ok_or_else(|| ProvisionError::ImageNotFound(first.name.clone()))?;

        let zones = selection::zones_for_launch(&requirements, &shapes);
        let networks = until(deadline, self.networks.zonal_networks(template, &zones)).await??;

        let (configs, zones) =
            self.launch_template_configs(template, &shapes, &networks, &requirements, pricing_model);
        if configs.is_empty() {
            return Err(ProvisionError::NoCompatibleShapes(
                "no capacity offerings are currently available given the constraints".to_string(),
            ));
        }

        let user_data = self
            .user_data(template, request, pricing_model, deadline)
            .await?;
        let group = self.provisioning_group(template, image_id, user_data, pricing_model, configs, tags);

        debug!(
            node_request = %request.name,
            capacity_type = %pricing_model,
            launch_configs = group.launch_template_configs.len(),
            "creating provisioning group"
        );

        let response = until(deadline, self.compute.create_provisioning_group(&group))
            .await?
            .map_err(|e| ProvisionError::api("creating provisioning group", e))?;

        self.update_unavailable_offerings(&response, pricing_model);
        let result = interpret_response(&response)?;

        Ok(Launch {
            group,
            result,
            zones,
        })
    }

    /// One launch config per shape with a resolvable network, plus the zone each landed in
    fn launch_template_configs(
        &self,
        template: &NodeTemplate,
        shapes: &[InstanceShape],
        networks: &BTreeMap<String, NetworkCandidate>,
        requirements: &Requirements,
        pricing_model: PricingModel,
    ) -> (Vec<LaunchTemplateConfig>, BTreeMap<String, String>) {
        let policy = template.spec.zone_selection_policy;
        let mut rng = self.rng.lock();
        let mut configs = Vec::new();
        let mut zones = BTreeMap::new();

        for shape in shapes {
            let Some(network) = selection::select_network(
                shape,
                networks,
                requirements,
                pricing_model,
                policy,
                &mut *rng,
            ) else {
                debug!(instance_type = %shape.name, "no network resolved, skipping instance type");
                continue;
            };

            configs.push(LaunchTemplateConfig {
                instance_type: shape.name.clone(),
                network_id: network.id.clone(),
                weighted_capacity: 1.0,
            });
            zones.insert(shape.name.clone(), network.zone.clone());

            if configs.len() >= MAX_INSTANCE_SHAPES - 1 {
                break;
            }
        }

        (configs, zones)
    }

    async fn user_data(
        &self,
        template: &NodeTemplate,
        request: &NodeRequest,
        pricing_model: PricingModel,
        deadline: Instant,
    ) -> Result<String> {
        let mut node_labels = request.labels.clone();
        node_labels.insert(
            labels::CAPACITY_TYPE.to_string(),
            pricing_model.as_str().to_string(),
        );

        let script = until(
            deadline,
            self.bootstrap
                .render_user_data(&node_labels, &template.kubelet()),
        )
        .await??;
        Ok(STANDARD.encode(script))
    }

    fn provisioning_group(
        &self,
        template: &NodeTemplate,
        image_id: String,
        user_data: String,
        pricing_model: PricingModel,
        configs: Vec<LaunchTemplateConfig>,
        tags: &BTreeMap<String, String>,
    ) -> ProvisioningGroupRequest {
        let disk = template.system_disk();
        let (spot, pay_as_you_go) = match pricing_model {
            PricingModel::Spot => ("1", "0"),
            PricingModel::OnDemand => ("0", "1"),
        };

        ProvisioningGroupRequest {
            region_id: self.region.clone(),
            client_token: Uuid::new_v4().to_string(),
            group_type: GROUP_TYPE_INSTANT.to_string(),
            total_target_capacity: "1".to_string(),
            spot_target_capacity: spot.to_string(),
            pay_as_you_go_target_capacity: pay_as_you_go.to_string(),
            spot_allocation_strategy: ALLOCATION_LOWEST_PRICE.to_string(),
            pay_as_you_go_allocation_strategy: ALLOCATION_LOWEST_PRICE.to_string(),
            excess_capacity_termination_policy: EXCESS_CAPACITY_TERMINATION.to_string(),
            launch_template_configs: configs,
            launch_configuration: LaunchConfiguration {
                image_id,
                user_data,
                resource_group_id: template.spec.resource_group_id.clone(),
                security_group_ids: template.status.security_group_ids.clone(),
                system_disk_size: disk.size_gib,
                system_disk_performance_level: disk.performance_level,
                tags: tags.iter().map(|(k, v)| Tag::new(k, v)).collect(),
            },
            system_disk_configs: disk
                .categories
                .into_iter()
                .map(|disk_category| SystemDiskConfig { disk_category })
                .collect(),
            tags: vec![Tag::new(
                format!("{}/autoprovisiongroup", labels::API_GROUP),
                "true",
            )],
        }
    }

    /// Negative-cache every stock-out in the response, whatever the overall outcome
    fn update_unavailable_offerings(
        &self,
        response: &ProvisioningGroupResponse,
        pricing_model: PricingModel,
    ) {
        for result in response.launch_results.iter().flatten() {
            if let Some((shape, zone)) = result.stock_out() {
                let reason = result
                    .error_msg
                    .as_deref()
                    .or(result.error_code.as_deref())
                    .unwrap_or_default();
                self.unavailable_offerings
                    .mark_unavailable(reason, shape, zone, pricing_model);
            }
        }
    }

    async fn bounded<F: Future>(&self, call: F) -> Result<F::Output> {
        tokio::time::timeout(self.api_timeout, call)
            .await
            .map_err(|_| ProvisionError::Timeout(self.api_timeout))
    }
}

impl std::fmt::Debug for InstanceProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceProvider")
            .field("region", &self.region)
            .field("cluster_id", &self.cluster_id)
            .field("api_timeout", &self.api_timeout)
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

async fn until<F: Future>(deadline: Instant, call: F) -> Result<F::Output> {
    let budget = deadline.saturating_duration_since(Instant::now());
    tokio::time::timeout_at(deadline, call)
        .await
        .map_err(|_| ProvisionError::Timeout(budget))
}

/// Pick the launched result out of a provisioning-group response.
///
/// Any result carrying an instance id wins. Otherwise a stock-out anywhere is
/// insufficient capacity, and anything else is a failed launch.
fn interpret_response(response: &ProvisioningGroupResponse) -> Result<LaunchResult> {
    let request_id = response.request_id.clone();

    let Some(results) = response.launch_results.as_ref() else {
        return Err(ProvisionError::MalformedResponse {
            request_id,
            detail: "missing launch results".to_string(),
        });
    };
    if response.status_code != 200 {
        return Err(ProvisionError::MalformedResponse {
            request_id,
            detail: format!("unexpected status code {}", response.status_code),
        });
    }
    let Some(first) = results.first() else {
        return Err(ProvisionError::MalformedResponse {
            request_id,
            detail: "no launch results found".to_string(),
        });
    };

    if let Some(launched) = results.iter().find(|r| !r.instance_ids.is_empty()) {
        return Ok(launched.clone());
    }

    if let Some(stock_out) = results.iter().find(|r| r.is_stock_out()) {
        return Err(ProvisionError::InsufficientCapacity {
            request_id,
            message: format!(
                "failed to launch instance: errorCode={}, errorMessage={}",
                stock_out.error_code.as_deref().unwrap_or_default(),
                stock_out.error_msg.as_deref().unwrap_or_default()
            ),
        });
    }

    Err(ProvisionError::LaunchFailed {
        request_id,
        code: first.error_code.clone().unwrap_or_default(),
        message: first.error_msg.clone().unwrap_or_default(),
    })
}

fn instance_from_launch(launch: &Launch) -> Result<LaunchedInstance> {
    let id = launch
        .result
        .instance_ids
        .first()
        .cloned()
        .ok_or_else(|| ProvisionError::MalformedResponse {
            request_id: None,
            detail: "launch result has no instance id".to_string(),
        })?;

    let shape = launch
        .result
        .instance_type
        .clone()
        .filter(|s| !s.is_empty())
        .or_else(|| {
            launch
                .group
                .launch_template_configs
                .first()
                .map(|c| c.instance_type.clone())
        })
        .unwrap_or_default();
    let zone = launch
        .result
        .zone_id
        .clone()
        .filter(|z| !z.is_empty())
        .or_else(|| launch.zones.get(&shape).cloned())
        .unwrap_or_default();

    Ok(LaunchedInstance {
        id,
        shape,
        zone,
        pricing_model: launch.group.pricing_model(),
        status: InstanceStatus::Pending,
        image_id: Some(launch.group.launch_configuration.image_id.clone()),
        created_at: Utc::now(),
        tags: launch
            .group
            .launch_configuration
            .tags
            .iter()
            .map(|t| (t.key.clone(), t.value.clone()))
            .collect(),
    })
}

fn instance_from_cloud(instance: &CloudInstance) -> LaunchedInstance {
    LaunchedInstance {
        id: instance.instance_id.clone(),
        shape: instance.instance_type.clone(),
        zone: instance.zone_id.clone(),
        pricing_model: instance.pricing_model(),
        status: InstanceStatus::from_cloud(&instance.status),
        image_id: instance.image_id.clone(),
        created_at: parse_creation_time(instance.creation_time.as_deref()),
        tags: instance
            .tags
            .iter()
            .map(|t| (t.key.clone(), t.value.clone()))
            .collect(),
    }
}

/// RFC 3339 or minute precision; anything else reads as now
fn parse_creation_time(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|s| {
        DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(s, CREATION_TIME_MINUTES)
                    .ok()
                    .map(|t| t.and_utc())
            })
    })
    .unwrap_or_else(Utc::now)
}
