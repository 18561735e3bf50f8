//! # Catalog Mapping
//!
//! Converts a broker catalog into the offerings stored on broker status.

use crate::crd::service_broker::{ServiceOffering, ServicePlan};
use crate::osb::types::{CatalogPlan, CatalogResponse, CatalogService};

/// Map a catalog response into offerings sorted by display name
pub fn map_catalog(response: &CatalogResponse) -> Vec<ServiceOffering> {
    let mut offerings: Vec<ServiceOffering> = response.services.iter().map(map_service).collect();
    offerings.sort_by(|a, b| a.display_name.cmp(&b.display_name));
    offerings
}

fn map_service(service: &CatalogService) -> ServiceOffering {
    let mut plans: Vec<ServicePlan> = service.plans.iter().map(map_plan).collect();
    plans.sort_by(|a, b| a.display_name.cmp(&b.display_name));
    ServiceOffering {
        display_name: service.name.clone(),
        uid: service.id.clone(),
        description: service.description.clone(),
        tags: service.tags.clone(),
        plans,
    }
}

fn map_plan(plan: &CatalogPlan) -> ServicePlan {
    ServicePlan {
        display_name: plan.name.clone(),
        uid: plan.id.clone(),
        // OSB treats a plan without `free` as free
        free: plan.free.unwrap_or(true),
        description: plan.description.clone(),
    }
}
