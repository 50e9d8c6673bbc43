// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

#![allow(unexpected_cfgs)]

//! # svcat - Open Service Broker catalog operator for Kubernetes
//!
//! svcat reconciles declarative service catalog resources against remote
//! brokers that speak the Open Service Broker (OSB) API v2.
//!
//! ## Overview
//!
//! - Brokers are registered as `ClusterServiceBroker` / `ServiceBroker`; their
//!   catalogs are mirrored into class and plan resources
//! - `ServiceInstance` resources are provisioned, updated and deprovisioned
//!   through the broker, with long-running operations polled to completion
//! - `ServiceBinding` resources fetch credentials and materialize them into a
//!   Secret
//!
//! ## Modules
//!
//! - [`crd`] - Custom Resource Definition types
//! - [`store`] - Entity store gateway (Kubernetes API or in-memory)
//! - [`osb`] - OSB HTTP client and wire types
//! - [`reconcilers`] - Broker, instance and binding control loops
//! - [`poller`] - Background polling of asynchronous operations
//! - [`filter`] - Catalog restriction predicates
//! - [`injector`] - Credential transforms and Secret writes
//! - [`queue`] / [`dispatcher`] / [`engine`] - Work queues and worker pools
//! - [`admission`] - Validating webhook for binding creation
//!
//! ## Example
//!
//! ```rust,no_run
//! use svcat::context::{Context, Settings};
//! use svcat::engine::{Engine, EngineConfig};
//! use svcat::metrics::Metrics;
//! use svcat::osb::BrokerClientManager;
//! use svcat::store::Stores;
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let client = kube::Client::try_default().await?;
//! let ctx = Arc::new(Context::new(
//!     Stores::kubernetes(&client),
//!     BrokerClientManager::new(),
//!     Arc::new(Metrics::new()?),
//!     Settings::default(),
//! ));
//! Engine::new(ctx, EngineConfig::default())
//!     .run(async { tokio::signal::ctrl_c().await.ok(); })
//!     .await;
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod config;
pub mod constants;
pub mod context;
pub mod crd;
pub mod dispatcher;
pub mod duration;
pub mod engine;
pub mod filter;
pub mod injector;
pub mod jsonpath;
pub mod labels;
pub mod metrics;
pub mod osb;
pub mod parameters;
pub mod poller;
pub mod queue;
pub mod reconcilers;
pub mod status_reasons;
pub mod store;
