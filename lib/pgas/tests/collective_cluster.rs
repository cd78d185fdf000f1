// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Integration tests for all-reduce and barrier over the in-process fabric

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::Cluster;
use dynamo_pgas::CollectiveError;
use dynamo_pgas::collective::ops::{Max, Min, Product, Sum};
use dynamo_pgas::config::CollectiveConfig;
use rstest::rstest;

#[rstest]
#[case(1)]
#[case(2)]
#[case(4)]
#[case(8)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sum_of_ranks(#[case] cluster_size: usize) {
    let cluster = Cluster::new(cluster_size);
    let results = cluster
        .run(|node, reducer| async move {
            reducer
                .all_reduce::<Sum<u64>>(node.as_u16() as u64)
                .await
                .unwrap()
        })
        .await;

    let n = cluster_size as u64;
    assert!(results.iter().all(|&total| total == n * (n - 1) / 2));
    assert!(cluster.reducers.iter().all(|r| r.open_rounds() == 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_standard_ops() {
    let cluster = Cluster::new(4);
    let results = cluster
        .run(|node, reducer| async move {
            let rank = node.as_u16() as i64;
            let max = reducer.all_reduce::<Max<i64>>(rank * 10).await.unwrap();
            let min = reducer.all_reduce::<Min<i64>>(-rank).await.unwrap();
            let product = reducer.all_reduce::<Product<i64>>(rank + 1).await.unwrap();
            (max, min, product)
        })
        .await;

    for result in results {
        assert_eq!(result, (30, -3, 24));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_repeated_rounds_on_one_tag() {
    let cluster = Cluster::new(3);
    let results = cluster
        .run(|node, reducer| async move {
            let mut totals = Vec::new();
            for round in 0..20u64 {
                let value = round * 100 + node.as_u16() as u64;
                totals.push(reducer.all_reduce::<Sum<u64>>(value).await.unwrap());
            }
            totals
        })
        .await;

    let expected: Vec<u64> = (0..20u64).map(|round| round * 300 + 3).collect();
    for totals in results {
        assert_eq!(totals, expected);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slice_reduction_spans_many_rounds() {
    // 64-byte messages carry 8 u64 elements, so 50 elements need 7 rounds
    let config = CollectiveConfig {
        max_message_bytes: 64,
        ..Default::default()
    };
    let cluster = Cluster::with_config(4, config);

    let results = cluster
        .run(|node, reducer| async move {
            let rank = node.as_u16() as u64;
            let mut values: Vec<u64> = (0..50u64).map(|i| i + rank).collect();
            reducer.all_reduce_slice::<Sum<u64>>(&mut values).await.unwrap();
            values
        })
        .await;

    let expected: Vec<u64> = (0..50u64).map(|i| 4 * i + 6).collect();
    for values in results {
        assert_eq!(values, expected);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slice_reduction_into_output() {
    let cluster = Cluster::new(3);
    let results = cluster
        .run(|node, reducer| async move {
            let rank = node.as_u16() as i32;
            let input = vec![rank, -rank, 7];
            let mut output = vec![0; 3];
            reducer
                .all_reduce_slice_into::<Max<i32>>(&input, &mut output)
                .await
                .unwrap();
            (input, output)
        })
        .await;

    for (rank, (input, output)) in results.into_iter().enumerate() {
        let rank = rank as i32;
        assert_eq!(input, vec![rank, -rank, 7]);
        assert_eq!(output, vec![2, 0, 7]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mismatched_slice_lengths_fail_every_node() {
    let cluster = Cluster::new(2);
    let results = cluster
        .run(|node, reducer| async move {
            let mut values = vec![1u32; 2 + node.index()];
            reducer.all_reduce_slice::<Sum<u32>>(&mut values).await
        })
        .await;

    for result in results {
        assert!(matches!(result, Err(CollectiveError::Codec(_))));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slice_lengths_differing_after_the_first_chunk_fail_every_node() {
    // 8 u64 per chunk: both nodes agree on the first chunk
    let config = CollectiveConfig {
        max_message_bytes: 64,
        ..Default::default()
    };
    let cluster = Cluster::with_config(2, config);
    let results = cluster
        .run(|node, reducer| async move {
            let mut values = vec![1u64; 8 * (1 + node.index())];
            reducer.all_reduce_slice::<Sum<u64>>(&mut values).await
        })
        .await;

    for result in results {
        assert!(matches!(result, Err(CollectiveError::Codec(_))));
    }
    assert!(cluster.reducers.iter().all(|r| r.open_rounds() == 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_empty_slice() {
    let cluster = Cluster::new(3);
    let results = cluster
        .run(|node, reducer| async move {
            let mut values = vec![1u32; if node.index() == 2 { 4 } else { 0 }];
            let mismatched = reducer.all_reduce_slice::<Sum<u32>>(&mut values).await;
            let mut empty: Vec<u32> = Vec::new();
            let agreed = reducer.all_reduce_slice::<Sum<u32>>(&mut empty).await;
            (mismatched, agreed)
        })
        .await;

    for (mismatched, agreed) in results {
        assert!(matches!(mismatched, Err(CollectiveError::Codec(_))));
        assert!(agreed.is_ok());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_barrier_holds_until_everyone_arrives() {
    let cluster = Cluster::new(4);
    let arrived = Arc::new(AtomicUsize::new(0));

    let results = cluster
        .run(|_, reducer| {
            let arrived = arrived.clone();
            async move {
                let mut seen = Vec::new();
                for _ in 0..5 {
                    arrived.fetch_add(1, Ordering::SeqCst);
                    reducer.barrier().await.unwrap();
                    seen.push(arrived.load(Ordering::SeqCst));
                    reducer.barrier().await.unwrap();
                }
                seen
            }
        })
        .await;

    // between the two barriers of a phase every node has incremented
    for seen in results {
        for (phase, count) in seen.into_iter().enumerate() {
            assert_eq!(count, 4 * (phase + 1));
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_home_node_other_than_zero() {
    let config = CollectiveConfig {
        home_node: 2,
        ..Default::default()
    };
    let cluster = Cluster::with_config(3, config);

    let results = cluster
        .run(|node, reducer| async move {
            assert_eq!(reducer.home_node().as_u16(), 2);
            reducer.all_reduce::<Sum<u32>>(node.as_u16() as u32 + 1).await.unwrap()
        })
        .await;

    assert_eq!(results, vec![6, 6, 6]);
    assert_eq!(cluster.reducers[2].open_rounds(), 0);
}
