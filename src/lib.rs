//! # Service Catalog Controller
//!
//! A Kubernetes controller that drives `ServiceInstance` and
//! `ServiceInstanceBinding` resources through the Open Service Broker (OSB)
//! lifecycle and keeps broker catalogs cached on `ServiceBroker` and
//! `ClusterServiceBroker` resources.
//!
//! ## Overview
//!
//! 1. **Provisioning** - OSB backed instances are provisioned, polled while the
//!    broker works asynchronously, and deprovisioned before their finalizer is
//!    released
//! 2. **Binding** - bindings are bound against their instance and the broker's
//!    credentials land in a Secret in the binding's namespace
//! 3. **Other backings** - user-provided services (including route services)
//!    and NFS volume services are reconciled into the Kubernetes objects they
//!    need
//! 4. **Catalogs** - broker catalogs are fetched once and again on request
//!
//! Progress is reported through status conditions and the OSB status of each
//! resource. Prometheus metrics and probes are served over HTTP.

pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod observability;
pub mod osb;
pub mod runtime;
pub mod server;
