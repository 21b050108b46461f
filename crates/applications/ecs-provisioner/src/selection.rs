//! Shape, pricing-model and zone selection
//!
//! Pure functions over candidate shapes. The provider calls them in this order:
//!
//! ```text
//! candidates
//!     │
//!     ├── filter_shapes        (skipped when any requirement has min values)
//!     │     ├── drop exotic shapes (metal, accelerators) if anything else remains
//!     │     └── mixed launch: drop shapes priced above the cheapest on-demand
//!     │
//!     ├── truncate             (cheapest first, at most MAX_INSTANCE_SHAPES)
//!     │
//!     ├── capacity_type        (spot only if allowed and obtainable)
//!     │
//!     └── select_network       (per shape: random zone, or cheapest spot zone)
//! ```

use ecs_provisioner_core::labels;
use ecs_provisioner_core::{
    InstanceShape, NetworkCandidate, NodeRequest, PricingModel, ProvisionError, Requirement,
    Requirements, Result, ZoneSelectionPolicy,
};
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};

/// Most shapes submitted in one provisioning group
pub const MAX_INSTANCE_SHAPES: usize = 20;

/// Below this many shapes an on-demand launch that could have been spot is flagged
pub const INSTANCE_TYPE_FLEXIBILITY_THRESHOLD: usize = 5;

/// Opinionated pre-filtering for requests without min-values rules
pub fn filter_shapes(request: &NodeRequest, shapes: Vec<InstanceShape>) -> Vec<InstanceShape> {
    let shapes = filter_exotic(shapes);
    if is_mixed_capacity_launch(request, &shapes) {
        filter_unwanted_spot(&request.requirements, shapes)
    } else {
        shapes
    }
}

/// Drop bare-metal and accelerator shapes, unless nothing else would remain
pub fn filter_exotic(shapes: Vec<InstanceShape>) -> Vec<InstanceShape> {
    if shapes.iter().all(InstanceShape::is_exotic) {
        return shapes;
    }
    shapes.into_iter().filter(|s| !s.is_exotic()).collect()
}

/// Both pricing models are allowed and both have a compatible available offering
pub fn is_mixed_capacity_launch(request: &NodeRequest, shapes: &[InstanceShape]) -> bool {
    if !request.allows(PricingModel::Spot) || !request.allows(PricingModel::OnDemand) {
        return false;
    }

    let mut has_spot = false;
    let mut has_on_demand = false;
    for offering in shapes
        .iter()
        .flat_map(|s| s.compatible_offerings(&request.requirements))
    {
        match offering.pricing_model {
            PricingModel::Spot => has_spot = true,
            PricingModel::OnDemand => has_on_demand = true,
        }
        if has_spot && has_on_demand {
            return true;
        }
    }
    false
}

/// Drop shapes whose cheapest available offering costs more than the cheapest
/// compatible on-demand offering.
///
/// Keeps a larger spot shape from being picked over a sufficient, cheaper
/// on-demand one. Falls back to the input if everything would be dropped.
pub fn filter_unwanted_spot(
    requirements: &Requirements,
    shapes: Vec<InstanceShape>,
) -> Vec<InstanceShape> {
    let cheapest_on_demand = shapes
        .iter()
        .flat_map(|s| s.compatible_offerings(requirements))
        .filter(|o| o.pricing_model == PricingModel::OnDemand)
        .map(|o| o.price)
        .fold(f64::MAX, f64::min);

    let (kept, dropped): (Vec<_>, Vec<_>) = shapes.into_iter().partition(|s| {
        s.cheapest_available()
            .is_some_and(|o| o.price <= cheapest_on_demand)
    });

    if kept.is_empty() {
        return dropped;
    }
    kept
}

/// Spot if the request allows it and some shape has a compatible available
/// spot offering; on-demand otherwise.
pub fn capacity_type(request: &NodeRequest, shapes: &[InstanceShape]) -> PricingModel {
    if request.allows(PricingModel::Spot) {
        let spot_only = with_pricing_model(&request.requirements, PricingModel::Spot);
        if shapes
            .iter()
            .any(|s| s.compatible_offerings(&spot_only).next().is_some())
        {
            return PricingModel::Spot;
        }
    }
    PricingModel::OnDemand
}

/// Operator-facing warning when falling back to on-demand with too few shapes
pub fn flexibility_warning(
    request: &NodeRequest,
    shapes: &[InstanceShape],
    resolved: PricingModel,
) -> Option<String> {
    if resolved != PricingModel::OnDemand || !request.allows(PricingModel::Spot) {
        return None;
    }
    if shapes.len() >= INSTANCE_TYPE_FLEXIBILITY_THRESHOLD {
        return None;
    }
    Some(format!(
        "at least {INSTANCE_TYPE_FLEXIBILITY_THRESHOLD} instance types are recommended when flexible to spot but requesting on-demand, \
         the current provisioning request only has {} instance type options",
        shapes.len()
    ))
}

/// Copy of `requirements` pinned to one pricing model
pub fn with_pricing_model(requirements: &Requirements, pricing_model: PricingModel) -> Requirements {
    requirements
        .clone()
        .with(Requirement::new_in(labels::CAPACITY_TYPE, [pricing_model.as_str()]))
}

/// Sort by cheapest compatible available offering; shapes with none go last
pub fn order_by_price(requirements: &Requirements, mut shapes: Vec<InstanceShape>) -> Vec<InstanceShape> {
    let cheapest = |s: &InstanceShape| {
        s.compatible_offerings(requirements)
            .map(|o| o.price)
            .fold(f64::MAX, f64::min)
    };
    shapes.sort_by(|a, b| cheapest(a).total_cmp(&cheapest(b)));
    shapes
}

/// Cheapest-first, cut to `max`, and checked against min-values rules
pub fn truncate(
    requirements: &Requirements,
    shapes: Vec<InstanceShape>,
    max: usize,
) -> Result<Vec<InstanceShape>> {
    let mut ordered = order_by_price(requirements, shapes);
    ordered.truncate(max);
    satisfies_min_values(requirements, &ordered)?;
    Ok(ordered)
}

/// Each min-values requirement must see enough distinct allowed values
pub fn satisfies_min_values(requirements: &Requirements, shapes: &[InstanceShape]) -> Result<()> {
    for requirement in requirements.iter() {
        let Some(min) = requirement.min_values else {
            continue;
        };
        let distinct: BTreeSet<&str> = shapes
            .iter()
            .filter_map(|s| s.label(&requirement.key))
            .filter(|v| requirement.allows(v))
            .collect();
        if distinct.len() < min {
            return Err(ProvisionError::MinValuesNotSatisfied(format!(
                "{} requires at least {min} distinct values, found {}",
                requirement.key,
                distinct.len()
            )));
        }
    }
    Ok(())
}

/// Zones with a compatible available offering under `requirements`
pub fn zones_for_launch(requirements: &Requirements, shapes: &[InstanceShape]) -> BTreeSet<String> {
    shapes
        .iter()
        .flat_map(|s| s.compatible_offerings(requirements))
        .map(|o| o.zone.clone())
        .collect()
}

/// Pick the network a shape should launch into.
///
/// On-demand launches and the balanced policy spread across zones at random.
/// Cost-optimised spot takes the zone of the strictly cheapest compatible
/// offering; on ties the first offering wins.
pub fn select_network<'a, R: Rng>(
    shape: &InstanceShape,
    networks: &'a BTreeMap<String, NetworkCandidate>,
    requirements: &Requirements,
    pricing_model: PricingModel,
    policy: ZoneSelectionPolicy,
    rng: &mut R,
) -> Option<&'a NetworkCandidate> {
    if pricing_model == PricingModel::OnDemand || policy == ZoneSelectionPolicy::Balanced {
        if networks.is_empty() {
            return None;
        }
        let index = rng.gen_range(0..networks.len());
        return networks.values().nth(index);
    }

    let mut cheapest: Option<(&NetworkCandidate, f64)> = None;
    for offering in shape.compatible_offerings(requirements) {
        let Some(network) = networks.get(&offering.zone) else {
            continue;
        };
        if cheapest.is_none_or(|(_, price)| offering.price < price) {
            cheapest = Some((network, offering.price));
        }
    }
    cheapest.map(|(network, _)| network)
}
