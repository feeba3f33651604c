// Copyright 2023 Greptime Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Part identity and the part name grammar.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, InvalidPartNameSnafu};

/// Type to store merge generation of a part.
pub type Level = u32;

/// Partition prefix of patch parts produced by lightweight updates.
pub const PATCH_PART_PREFIX: &str = "patch-";

/// Identity of a part: `<partition_id>_<min_block>_<max_block>_<level>[_<mutation>]`.
///
/// Within a partition the tuple `(min_block, max_block, level, mutation)`
/// induces a total order. Two parts with the same blocks and level but
/// different `mutation` are two versions of the same physical range.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartInfo {
    pub partition_id: String,
    pub min_block: i64,
    pub max_block: i64,
    pub level: Level,
    pub mutation: i64,
}

impl PartInfo {
    /// Info of a freshly inserted part occupying a single block.
    pub fn new_inserted(partition_id: impl Into<String>, block: i64) -> PartInfo {
        PartInfo {
            partition_id: partition_id.into(),
            min_block: block,
            max_block: block,
            level: 0,
            mutation: 0,
        }
    }

    /// The mutation applied to the part, or its min block if none.
    pub fn data_version(&self) -> i64 {
        if self.mutation != 0 {
            self.mutation
        } else {
            self.min_block
        }
    }

    /// Whether this part's block range strictly covers `rhs`.
    pub fn contains(&self, rhs: &PartInfo) -> bool {
        self.partition_id == rhs.partition_id
            && self.min_block <= rhs.min_block
            && self.max_block >= rhs.max_block
            && self.level >= rhs.level
            && self.mutation >= rhs.mutation
    }

    /// Whether the block ranges of the two parts do not intersect.
    pub fn is_disjoint(&self, rhs: &PartInfo) -> bool {
        self.partition_id != rhs.partition_id
            || self.min_block > rhs.max_block
            || self.max_block < rhs.min_block
    }

    /// Two versions of the same physical range.
    pub fn same_range(&self, rhs: &PartInfo) -> bool {
        self.partition_id == rhs.partition_id
            && self.min_block == rhs.min_block
            && self.max_block == rhs.max_block
    }

    pub fn is_patch(&self) -> bool {
        self.partition_id.starts_with(PATCH_PART_PREFIX)
    }

    /// Base partition id, stripping the patch prefix if present.
    pub fn base_partition_id(&self) -> &str {
        self.partition_id
            .strip_prefix(PATCH_PART_PREFIX)
            .unwrap_or(&self.partition_id)
    }

    pub fn part_name(&self) -> String {
        self.to_string()
    }

    /// A drop range covering every block of `partition_id` up to `max_block`,
    /// any level and any mutation.
    pub fn drop_range(partition_id: impl Into<String>, max_block: i64) -> PartInfo {
        PartInfo {
            partition_id: partition_id.into(),
            min_block: 0,
            max_block,
            level: Level::MAX,
            mutation: i64::MAX,
        }
    }

    /// Validates a user-supplied partition id. Underscores are reserved by
    /// the part name grammar and the patch prefix by lightweight updates.
    pub fn validate_partition_id(partition_id: &str) -> Result<(), Error> {
        if partition_id.is_empty()
            || partition_id.contains('_')
            || partition_id.starts_with(PATCH_PART_PREFIX)
        {
            return InvalidPartNameSnafu { name: partition_id }.fail();
        }
        Ok(())
    }
}

impl fmt::Display for PartInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}",
            self.partition_id, self.min_block, self.max_block, self.level
        )?;
        if self.mutation != 0 {
            write!(f, "_{}", self.mutation)?;
        }
        Ok(())
    }
}

impl FromStr for PartInfo {
    type Err = Error;

    fn from_str(s: &str) -> Result<PartInfo, Error> {
        let fields: Vec<&str> = s.split('_').collect();
        if fields.len() != 4 && fields.len() != 5 {
            return InvalidPartNameSnafu { name: s }.fail();
        }

        let parse = |field: &str| -> Result<i64, Error> {
            field
                .parse()
                .map_err(|_| InvalidPartNameSnafu { name: s }.build())
        };

        let partition_id = fields[0].to_string();
        if partition_id.is_empty() {
            return InvalidPartNameSnafu { name: s }.fail();
        }
        let min_block = parse(fields[1])?;
        let max_block = parse(fields[2])?;
        let level = parse(fields[3])? as Level;
        let mutation = if fields.len() == 5 { parse(fields[4])? } else { 0 };

        if min_block > max_block {
            return InvalidPartNameSnafu { name: s }.fail();
        }

        Ok(PartInfo {
            partition_id,
            min_block,
            max_block,
            level,
            mutation,
        })
    }
}
