// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Environment variable overriding the configuration file location.
pub const CONFIG_ENV: &str = "VTS_CHANNEL_CONFIG";

/// Resolves a configuration path: the `VTS_CHANNEL_CONFIG` environment
/// variable wins, otherwise `rel` is resolved against the working
/// directory.
pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let requested = std::env::var(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(rel));

    let abs = if requested.is_absolute() {
        requested
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(requested)
    };

    let canon = abs
        .canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))?;

    Ok(canon)
}

/// Like [`resolve_config_path`] but falls back to a sibling default
/// when the preferred file does not exist.
pub fn resolve_config_path_or(rel: &str, fallback: &str) -> Result<PathBuf> {
    if Path::new(rel).exists() || std::env::var(CONFIG_ENV).is_ok() {
        resolve_config_path(rel)
    } else {
        resolve_config_path(fallback)
    }
}
