//! Physical orderings of per-condition arrays
//!
//! An array holding `width` values for each of `num` conditions is stored
//! either condition-major (`C`, `a[i*width + j]`) or species-major
//! (`F`, `a[j*num + i]`). Scalar fields (`width == 1`) are identical in
//! both orders.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Memory ordering of a per-condition array.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataOrder {
    /// `a[i*width + j]`
    #[default]
    #[serde(rename = "C", alias = "c", alias = "condition_major")]
    ConditionMajor,
    /// `a[j*num + i]`
    #[serde(rename = "F", alias = "f", alias = "species_major")]
    SpeciesMajor,
}

impl DataOrder {
    /// Flat index of value `j` of condition `i`.
    #[inline]
    pub fn index(self, i: usize, j: usize, num: usize, width: usize) -> usize {
        match self {
            Self::ConditionMajor => i * width + j,
            Self::SpeciesMajor => j * num + i,
        }
    }
}

impl fmt::Display for DataOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ConditionMajor => "C",
            Self::SpeciesMajor => "F",
        })
    }
}

/// Copy `src` (in `from` order) into a new array in `to` order.
///
/// # Panics
///
/// Panics if `src.len() != num * width`.
pub fn reorder(src: &[f64], from: DataOrder, to: DataOrder, num: usize, width: usize) -> Vec<f64> {
    assert_eq!(src.len(), num * width, "array length does not match num * width");
    if from == to {
        return src.to_vec();
    }
    let mut dst = vec![0.0; src.len()];
    for i in 0..num {
        for j in 0..width {
            dst[to.index(i, j, num, width)] = src[from.index(i, j, num, width)];
        }
    }
    dst
}

/// One contiguous transfer between a host array and a device buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    /// Offset into the host array, in elements
    pub host_offset: usize,
    /// Offset into the capacity-sized device buffer, in elements
    pub device_offset: usize,
    /// Elements to move
    pub len: usize,
}

/// Transfers needed to move conditions `[offset, offset + len)` of a
/// `total`-condition host array into a buffer sized for `capacity`
/// conditions, both in `order`.
///
/// Condition-major data moves as one block. Species-major data moves one
/// plane per value, with host stride `total` and device stride `capacity`.
pub fn chunk_segments(
    order: DataOrder,
    offset: usize,
    len: usize,
    total: usize,
    capacity: usize,
    width: usize,
) -> Vec<Segment> {
    debug_assert!(len <= capacity);
    debug_assert!(offset + len <= total);
    match order {
        DataOrder::ConditionMajor => vec![Segment {
            host_offset: offset * width,
            device_offset: 0,
            len: len * width,
        }],
        DataOrder::SpeciesMajor => (0..width)
            .map(|j| Segment {
                host_offset: j * total + offset,
                device_offset: j * capacity,
                len,
            })
            .collect(),
    }
}
