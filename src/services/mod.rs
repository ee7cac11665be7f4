pub mod backend;
pub mod inventory;
pub mod load_balancer;
pub mod metadata;
pub mod notify;
pub mod orchestrator;
pub mod placement;
pub mod policy_store;
pub mod reconciler;
pub mod routing;
pub mod topology;

#[cfg(test)]
pub mod testing;
