//! Names for newly deployed VMs: `{project}-tc-{suffix}`.

use std::collections::HashMap;

use uuid::Uuid;

/// Metadata key naming the project a VM is built for. Matched case-insensitively.
pub const PROJECT_METADATA_KEY: &str = "target_project";

/// Longest name the cluster accepts.
pub const MAX_VM_NAME_LEN: usize = 63;

const SUFFIX_LEN: usize = 5;
const SEPARATOR: &str = "-tc-";
const FALLBACK_PREFIX: &str = "vm";

/// Picks a fresh name for a VM deployed with `metadata`.
pub fn generate(metadata: &HashMap<String, String>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    with_suffix(metadata, &suffix[..SUFFIX_LEN])
}

fn with_suffix(metadata: &HashMap<String, String>, suffix: &str) -> String {
    let project = metadata
        .iter()
        .find(|(key, _)| key.trim().eq_ignore_ascii_case(PROJECT_METADATA_KEY))
        .map(|(_, value)| sanitize(value))
        .filter(|project| !project.is_empty());

    let prefix = match project {
        Some(mut project) => {
            project.truncate(MAX_VM_NAME_LEN - SEPARATOR.len() - SUFFIX_LEN);
            project
        }
        None => FALLBACK_PREFIX.to_string(),
    };
    format!("{prefix}{SEPARATOR}{suffix}")
}

/// Lowercases and maps anything outside `[a-z0-9-]` to a single hyphen,
/// trimming hyphens at both ends.
fn sanitize(project: &str) -> String {
    let mut out = String::with_capacity(project.len());
    for c in project.trim().to_lowercase().chars() {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            c
        } else {
            '-'
        };
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }
    out.trim_matches('-').to_string()
}
