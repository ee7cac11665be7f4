pub mod bucket_handlers;
pub mod health_handlers;
pub mod load_balancer_handlers;
pub mod notify_handlers;
pub mod topology_handlers;
