// SPDX-FileCopyrightText: 2023 Marshall Wace <opensource@mwam.com>
// SPDX-License-Identifier: Apache-2.0
// SPDX-FileContributor: Tim Kendrick <t.kendrick@mwam.com> https://github.com/timkendrickmw
pub mod actor;
pub mod cluster;
pub mod distgc;
pub mod message;
pub mod task;
pub mod wire;

pub use cluster::{Cluster, ClusterOptions};
