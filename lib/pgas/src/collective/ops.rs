// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Reduce operations.

use std::marker::PhantomData;
use std::ops::{Add, Mul};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A commutative, associative reduction with an optional identity.
///
/// Every node of a round must use the same op. The op's [`tag`](ReduceOp::tag)
/// names the round, so two different ops never share reduction state.
pub trait ReduceOp: Send + Sync + 'static {
    type Value: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    fn combine(a: &Self::Value, b: &Self::Value) -> Self::Value;

    /// Seed for the accumulator. Without one, the first contribution to
    /// arrive seeds it.
    fn identity() -> Option<Self::Value> {
        None
    }

    fn tag() -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Sum of all contributions; identity `T::default()`.
pub struct Sum<T>(PhantomData<fn() -> T>);

impl<T> ReduceOp for Sum<T>
where
    T: Add<Output = T> + Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Value = T;

    fn combine(a: &T, b: &T) -> T {
        a.clone() + b.clone()
    }

    fn identity() -> Option<T> {
        Some(T::default())
    }
}

/// Product of all contributions; identity `T::from(1u8)`.
pub struct Product<T>(PhantomData<fn() -> T>);

impl<T> ReduceOp for Product<T>
where
    T: Mul<Output = T> + From<u8> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Value = T;

    fn combine(a: &T, b: &T) -> T {
        a.clone() * b.clone()
    }

    fn identity() -> Option<T> {
        Some(T::from(1u8))
    }
}

/// Largest contribution.
pub struct Max<T>(PhantomData<fn() -> T>);

impl<T> ReduceOp for Max<T>
where
    T: PartialOrd + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Value = T;

    fn combine(a: &T, b: &T) -> T {
        if b > a { b.clone() } else { a.clone() }
    }
}

/// Smallest contribution.
pub struct Min<T>(PhantomData<fn() -> T>);

impl<T> ReduceOp for Min<T>
where
    T: PartialOrd + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Value = T;

    fn combine(a: &T, b: &T) -> T {
        if b < a { b.clone() } else { a.clone() }
    }
}

/// Carries no data; a round of it completes once every node has arrived.
pub struct BarrierOp;

impl ReduceOp for BarrierOp {
    type Value = ();

    fn combine(_: &(), _: &()) {}

    fn identity() -> Option<()> {
        Some(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fold<Op: ReduceOp>(values: &[Op::Value]) -> Op::Value {
        let mut iter = values.iter();
        let seed = match Op::identity() {
            Some(identity) => identity,
            None => iter.next().cloned().unwrap(),
        };
        iter.fold(seed, |acc, v| Op::combine(&acc, v))
    }

    #[test]
    fn test_standard_ops() {
        assert_eq!(fold::<Sum<u64>>(&[1, 2, 3, 4]), 10);
        assert_eq!(fold::<Product<i32>>(&[2, -3, 4]), -24);
        assert_eq!(fold::<Max<f64>>(&[1.5, -2.0, 7.25]), 7.25);
        assert_eq!(fold::<Min<i64>>(&[5, -9, 3]), -9);
        fold::<BarrierOp>(&[(), ()]);
    }

    #[test]
    fn test_identities() {
        assert_eq!(Sum::<u32>::identity(), Some(0));
        assert_eq!(Product::<u32>::identity(), Some(1));
        assert_eq!(Max::<u32>::identity(), None);
        assert_eq!(Min::<u32>::identity(), None);
    }

    #[test]
    fn test_tags_distinguish_op_and_type() {
        assert_ne!(Sum::<u32>::tag(), Sum::<u64>::tag());
        assert_ne!(Sum::<u64>::tag(), Max::<u64>::tag());
        assert!(Sum::<u64>::tag().contains("Sum<u64>"));
    }
}
