//! Measure aggregation functions.
//!
//! The set of functions is closed: a measure is described by its function name, which is
//! resolved once to a `MeasureFunction` when the `MeasureDesc` is created. All functions
//! must be commutative and associative, because partial states of different splits are
//! merged in arbitrary order.
use anyhow::{anyhow, Result};
use fnv::FnvHashSet;
use likely_stable::unlikely;
use log::info;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use strum::{Display, EnumCount, EnumString};

use crate::error_bail;

/// Supported aggregation functions.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    EnumCount,
    EnumString,
    Display,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MeasureFunction {
    #[default]
    Sum,
    Count,
    Min,
    Max,
    CountDistinct,
}

/// Partial aggregation state of one measure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeasureValue {
    /// State of `SUM`, `COUNT`, `MIN` and `MAX`.
    Long(i64),

    /// State of `COUNT_DISTINCT`, the set of distinct values seen so far.
    Distinct(FnvHashSet<u64>),
}

const TAG_LONG: u8 = 0;
const TAG_DISTINCT: u8 = 1;

impl MeasureValue {
    /// Final value of the state.
    pub fn value(&self) -> i64 {
        match self {
            MeasureValue::Long(v) => *v,
            MeasureValue::Distinct(set) => set.len() as i64,
        }
    }

    /// Rough heap footprint of the state, used by the aggregation cache estimation.
    pub fn estimated_bytes(&self) -> usize {
        match self {
            MeasureValue::Long(_) => 16,
            MeasureValue::Distinct(set) => 48 + set.len() * 16,
        }
    }

    /// Append the binary form of the state to `buf`.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        match self {
            MeasureValue::Long(v) => {
                buf.push(TAG_LONG);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            MeasureValue::Distinct(set) => {
                let mut values = set.iter().copied().collect::<Vec<_>>();
                values.sort_unstable();

                buf.push(TAG_DISTINCT);
                buf.extend_from_slice(&(values.len() as u32).to_le_bytes());
                for v in values {
                    buf.extend_from_slice(&v.to_le_bytes());
                }
            }
        }
    }

    /// Read a state written by `write_to` starting at `pos`, advance `pos` past it.
    pub fn read_from(bytes: &[u8], pos: &mut usize) -> Result<Self> {
        let tag = read_u8(bytes, pos)?;

        match tag {
            TAG_LONG => Ok(MeasureValue::Long(read_u64(bytes, pos)? as i64)),
            TAG_DISTINCT => {
                let len = read_u32(bytes, pos)? as usize;
                let mut set = FnvHashSet::default();
                for _ in 0..len {
                    set.insert(read_u64(bytes, pos)?);
                }

                Ok(MeasureValue::Distinct(set))
            }
            _ => {
                error_bail!("unknown measure value tag: {}, pos: {}", tag, *pos);
            }
        }
    }
}

fn take<'a>(bytes: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8]> {
    if unlikely(*pos + n > bytes.len()) {
        return Err(anyhow!(
            "unexpected end of bytes, pos: {}, need: {}, len: {}",
            *pos,
            n,
            bytes.len()
        ));
    }

    let s = &bytes[*pos..*pos + n];
    *pos += n;

    Ok(s)
}

pub(crate) fn read_u8(bytes: &[u8], pos: &mut usize) -> Result<u8> {
    Ok(take(bytes, pos, 1)?[0])
}

pub(crate) fn read_u32(bytes: &[u8], pos: &mut usize) -> Result<u32> {
    let s = take(bytes, pos, 4)?;
    Ok(u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
}

pub(crate) fn read_u64(bytes: &[u8], pos: &mut usize) -> Result<u64> {
    let s = take(bytes, pos, 8)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(s);

    Ok(u64::from_le_bytes(buf))
}

impl MeasureFunction {
    /// Resolve a function by name, such as `SUM` or `count_distinct`.
    pub fn from_name(name: &str) -> Result<Self> {
        MeasureFunction::from_str(name.trim())
            .map_err(|e| anyhow!("unsupported measure function: {}, error: {}", name, e))
    }

    /// State of a single raw input value.
    pub fn init(&self, raw: i64) -> MeasureValue {
        match self {
            MeasureFunction::Sum | MeasureFunction::Min | MeasureFunction::Max => {
                MeasureValue::Long(raw)
            }
            MeasureFunction::Count => MeasureValue::Long(1),
            MeasureFunction::CountDistinct => {
                let mut set = FnvHashSet::default();
                set.insert(raw as u64);
                MeasureValue::Distinct(set)
            }
        }
    }

    /// Fold one raw input value into `state`.
    pub fn aggregate(&self, state: &mut MeasureValue, raw: i64) -> Result<()> {
        let incoming = self.init(raw);
        self.merge(state, &incoming)
    }

    /// Merge partial state `other` into `state`.
    pub fn merge(&self, state: &mut MeasureValue, other: &MeasureValue) -> Result<()> {
        match (self, state, other) {
            (MeasureFunction::Sum | MeasureFunction::Count, MeasureValue::Long(a), MeasureValue::Long(b)) => {
                *a = a.wrapping_add(*b);
            }
            (MeasureFunction::Min, MeasureValue::Long(a), MeasureValue::Long(b)) => {
                *a = (*a).min(*b);
            }
            (MeasureFunction::Max, MeasureValue::Long(a), MeasureValue::Long(b)) => {
                *a = (*a).max(*b);
            }
            (MeasureFunction::CountDistinct, MeasureValue::Distinct(a), MeasureValue::Distinct(b)) => {
                a.extend(b.iter().copied());
            }
            (f, a, b) => {
                error_bail!(
                    "measure state does not match function {}, state: {:?}, other: {:?}",
                    f,
                    a,
                    b
                );
            }
        }

        Ok(())
    }
}

/// Description of one measure column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasureDesc {
    /// Measure name.
    pub name: String,

    /// Aggregation function.
    pub function: MeasureFunction,

    /// If true, the measure is only aggregated when building the base cuboid. Descendants
    /// keep the first encountered value unmodified.
    #[serde(default)]
    pub only_aggr_in_base: bool,
}

impl MeasureDesc {
    pub fn new(name: &str, function: MeasureFunction) -> Self {
        Self {
            name: name.to_string(),
            function,
            only_aggr_in_base: false,
        }
    }

    /// Parse from a function name.
    pub fn from_function_name(name: &str, function_name: &str) -> Result<Self> {
        Ok(Self::new(name, MeasureFunction::from_name(function_name)?))
    }

    pub fn with_only_aggr_in_base(mut self, only_aggr_in_base: bool) -> Self {
        self.only_aggr_in_base = only_aggr_in_base;
        self
    }
}

/// Aggregators of all measures of a cuboid, merging measure states row by row.
pub struct MeasureAggregators {
    functions: Vec<MeasureFunction>,

    /// `false` means the measure is not aggregated, the first value is kept.
    aggr_mask: Vec<bool>,
}

impl MeasureAggregators {
    /// Aggregators of all measures.
    pub fn new(descs: &[MeasureDesc]) -> Self {
        Self {
            functions: descs.iter().map(|d| d.function).collect(),
            aggr_mask: vec![true; descs.len()],
        }
    }

    /// Aggregators used when building a descendant of the base cuboid.
    ///
    /// Measures flagged `only_aggr_in_base` are masked out.
    pub fn for_descendant(descs: &[MeasureDesc]) -> Self {
        let mut aggregators = Self::new(descs);

        for (i, desc) in descs.iter().enumerate() {
            if desc.only_aggr_in_base {
                info!("measure {} doesn't need aggregation.", desc.name);
                aggregators.aggr_mask[i] = false;
            }
        }

        aggregators
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn aggr_mask(&self) -> &[bool] {
        &self.aggr_mask
    }

    /// Merge `incoming` states into `acc`, honoring the aggregation mask.
    pub fn merge_into(&self, acc: &mut [MeasureValue], incoming: &[MeasureValue]) -> Result<()> {
        if unlikely(acc.len() != self.functions.len() || incoming.len() != self.functions.len()) {
            error_bail!(
                "measure count mismatch, functions: {}, acc: {}, incoming: {}",
                self.functions.len(),
                acc.len(),
                incoming.len()
            );
        }

        for (i, function) in self.functions.iter().enumerate() {
            if self.aggr_mask[i] {
                function.merge(&mut acc[i], &incoming[i])?;
            }
        }

        Ok(())
    }
}
