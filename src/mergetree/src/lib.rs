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

//! A single-node, log-structured merge engine over immutable, versioned
//! data parts organized under a sort key.
//!
//! Inserts land as new immutable parts. Background jobs merge adjacent
//! parts into bigger ones and apply declarative mutations producing new
//! part versions, while partition operations (drop, replace, move, attach,
//! truncate) coordinate with them through a stop-and-drain protocol. The
//! whole visible part set is snapshot-consistent for readers at all times.

pub mod block;
pub mod config;
pub mod error;
pub mod merge;
pub mod mutation;
pub mod part;
pub mod registry;
pub mod schedule;
pub mod store;
pub mod table;
pub mod update;
