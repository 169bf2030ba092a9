// SPDX-FileCopyrightText: 2023 Marshall Wace <opensource@mwam.com>
// SPDX-License-Identifier: Apache-2.0
// SPDX-FileContributor: Tim Kendrick <t.kendrick@mwam.com> https://github.com/timkendrickmw
pub mod cell;
pub mod core;
pub mod frame;
pub mod global;
pub mod hash;
pub mod heap;
pub mod stdlib;
