// Copyright 2025 fnlb Authors
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

//! # fnlb CLI
//!
//! Command-line interface for the fnlb capacity-aware router.
//!
//! ## Key Commands
//!
//! - `fnlb serve`: Start the router
//! - `fnlb route add|remove|list`: Manage routes on a running router
//! - `fnlb capacity push|query`: Report or inspect runner capacity
//! - `fnlb nodes`: List the runner nodes the router knows about
//!
//! Client commands print raw JSON to stdout so they can be piped into `jq`.

use anyhow::{anyhow, Result};
use fnlb_common::protocol::GroupCapacity;

/// Validates that a URL string starts with http:// or https://
///
/// `description` names what the URL is for in the error message.
pub fn validate_http_url(url: &str, description: &str) -> Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(anyhow!(
            "Invalid {}: '{}' must start with http:// or https://",
            description,
            url
        ))
    }
}

/// Parses a preloaded route given as `host=destination`.
pub fn parse_route_arg(arg: &str) -> Result<(String, String)> {
    match arg.split_once('=') {
        Some((host, destination)) if !host.trim().is_empty() && !destination.trim().is_empty() => {
            Ok((host.trim().to_string(), destination.trim().to_string()))
        }
        _ => Err(anyhow!(
            "Invalid route '{}': expected host=destination",
            arg
        )),
    }
}

/// Parses a group capacity given as `key:total:used`.
///
/// The key may itself contain colons; the last two fields are the counts.
pub fn parse_group_arg(arg: &str) -> Result<GroupCapacity> {
    let mut parts = arg.rsplitn(3, ':');
    let (used, total, key) = match (parts.next(), parts.next(), parts.next()) {
        (Some(used), Some(total), Some(key)) if !key.is_empty() => (used, total, key),
        _ => {
            return Err(anyhow!(
                "Invalid group '{}': expected key:total:used",
                arg
            ))
        }
    };

    let total: u32 = total
        .parse()
        .map_err(|e| anyhow!("Invalid total in group '{}': {}", arg, e))?;
    let used: u32 = used
        .parse()
        .map_err(|e| anyhow!("Invalid used in group '{}': {}", arg, e))?;
    if used > total {
        return Err(anyhow!(
            "Invalid group '{}': used {} exceeds total {}",
            arg,
            used,
            total
        ));
    }

    Ok(GroupCapacity::new(key, total, used))
}
