// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Common utilities for PGAS integration tests

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dynamo_pgas::am::LocalFabric;
use dynamo_pgas::config::CollectiveConfig;
use dynamo_pgas::{CollectiveReducer, NodeId};
use tokio::time::timeout;

/// Upper bound for any single collective scenario.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    dynamo_pgas::logging::init();
}

/// An in-process cluster with one reducer per node.
pub struct Cluster {
    pub fabric: LocalFabric,
    pub reducers: Vec<Arc<CollectiveReducer>>,
}

impl Cluster {
    pub fn new(cluster_size: usize) -> Self {
        Self::with_config(cluster_size, CollectiveConfig::default())
    }

    pub fn with_config(cluster_size: usize, config: CollectiveConfig) -> Self {
        init_tracing();
        let fabric = LocalFabric::new(cluster_size).expect("fabric");
        let reducers = fabric
            .messengers()
            .into_iter()
            .map(|messenger| CollectiveReducer::new(messenger, config.clone()).expect("reducer"))
            .collect();
        Self { fabric, reducers }
    }

    /// Run `f` on every node concurrently, each on its own task, and collect
    /// the results in rank order.
    pub async fn run<F, Fut, T>(&self, f: F) -> Vec<T>
    where
        F: Fn(NodeId, Arc<CollectiveReducer>) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let handles: Vec<_> = self
            .reducers
            .iter()
            .map(|reducer| tokio::spawn(f(reducer.node_id(), reducer.clone())))
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            let result = timeout(TEST_TIMEOUT, handle)
                .await
                .expect("collective scenario timed out")
                .expect("node task panicked");
            results.push(result);
        }
        results
    }
}
