// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Compile-time constants of the kernel synchronization and memory core.
//!
//! The values come from `configs/defconfig.toml` at the workspace root unless
//! the `KCORE_CONFIG_PATH` environment variable names another file at build
//! time.
#![cfg_attr(not(test), no_std)]

axconfig_macros::include_configs!(
    path_env = "KCORE_CONFIG_PATH",
    fallback = "../../configs/defconfig.toml"
);
