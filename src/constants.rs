//! # Constants
//!
//! Names, keys and defaults shared across the controller.

/// Finalizer placed on ServiceInstances; cleared once deprovisioning finished
/// and no binding references the instance any more.
pub const SERVICE_INSTANCE_FINALIZER: &str = "serviceinstancebinding.kf.dev";

/// Finalizer placed on ServiceInstanceBindings; cleared once unbinding finished.
pub const SERVICE_INSTANCE_BINDING_FINALIZER: &str = "serviceinstancebinding.kf.dev";

/// Key holding JSON parameters in instance and binding params secrets
pub const PARAMS_SECRET_KEY: &str = "params";

/// Secret type required for broker credentials
pub const BROKER_CREDS_SECRET_TYPE: &str = "kf.dev/servicebrokercreds";
pub const BROKER_CREDS_USERNAME_KEY: &str = "username";
pub const BROKER_CREDS_PASSWORD_KEY: &str = "password";
pub const BROKER_CREDS_URL_KEY: &str = "url";

/// Default time an async OSB operation may stay pending (30 minutes)
pub const DEFAULT_PROGRESS_DEADLINE_SECONDS: i64 = 30 * 60;

pub const USER_PROVIDED_SERVICE_CLASS_NAME: &str = "user-provided";
pub const USER_PROVIDED_SERVICE_DESCRIPTION: &str = "user-provided";
pub const BROKERED_SERVICE_DESCRIPTION: &str = "brokered";
pub const VOLUME_SERVICE_DESCRIPTION: &str = "volume";

/// Labels written on objects the controller creates
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const NAME_LABEL: &str = "app.kubernetes.io/name";
pub const COMPONENT_LABEL: &str = "app.kubernetes.io/component";
pub const BINDING_LABEL: &str = "kf.dev/serviceinstancebinding";
pub const INSTANCE_LABEL: &str = "kf.dev/serviceinstance";
pub const MANAGED_BY: &str = "kf";

/// Route service proxy container settings
pub const ROUTE_SERVICE_PROXY_PORT: i32 = 8080;
pub const ROUTE_SERVICE_PROXY_PORT_NAME: &str = "http";
pub const ROUTE_SERVICE_PROXY_CONTAINER_NAME: &str = "user-container";

/// Volume objects are created with a no-op capacity, the share decides the real size
pub const DEFAULT_VOLUME_CAPACITY: &str = "1Gi";

/// Field manager used for server-side writes
pub const FIELD_MANAGER: &str = "service-catalog-controller";

/// Default port for the metrics and probe server
pub const DEFAULT_METRICS_PORT: u16 = 8080;

/// Default server startup timeout (seconds)
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Default server readiness poll interval (milliseconds)
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 50;

/// OSB API version sent on every broker request
pub const DEFAULT_OSB_API_VERSION: &str = "2.14";

/// Upper bound for a single broker HTTP call (seconds)
pub const DEFAULT_OSB_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Requeue delay while an async broker operation is pending (seconds)
pub const DEFAULT_OSB_POLL_INTERVAL_SECS: u64 = 15;

/// Periodic resync for settled resources (seconds)
pub const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 600;

/// Error backoff bounds (seconds)
pub const DEFAULT_BACKOFF_MIN_SECS: u64 = 5;
pub const DEFAULT_BACKOFF_MAX_SECS: u64 = 300;

/// Maximum number of keys reconciled in parallel per controller
pub const DEFAULT_RECONCILE_CONCURRENCY: u16 = 4;

/// Delay before restarting a failed watch stream (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_SECS: u64 = 5;
