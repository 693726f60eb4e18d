//! Node capacity aggregation
//!
//! The join controller reports total and allocatable cpu/memory for the
//! managed cluster. Only the units that appear in node status are handled:
//! bare numbers, milli-cpu, and binary/decimal byte suffixes.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

/// Resources aggregated into cluster status
const AGGREGATED_RESOURCES: &[&str] = &["cpu", "memory"];

/// Parse a quantity into a scaled integer: milli-units for cpu-style values,
/// bytes for memory-style values. Unsupported strings parse as None.
fn parse_milli(quantity: &str) -> Option<i64> {
    let quantity = quantity.trim();
    if quantity.is_empty() {
        return None;
    }
    if let Some(milli) = quantity.strip_suffix('m') {
        return milli.parse::<i64>().ok();
    }

    let suffixes: &[(&str, i64)] = &[
        ("Ki", 1024),
        ("Mi", 1024 * 1024),
        ("Gi", 1024 * 1024 * 1024),
        ("Ti", 1024_i64.pow(4)),
        ("k", 1000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
    ];
    for (suffix, factor) in suffixes {
        if let Some(value) = quantity.strip_suffix(suffix) {
            return value.parse::<i64>().ok().map(|v| v * factor * 1000);
        }
    }

    if let Ok(whole) = quantity.parse::<i64>() {
        return Some(whole * 1000);
    }
    // fractional core counts like "1.5"
    quantity.parse::<f64>().ok().map(|v| (v * 1000.0).round() as i64)
}

fn format_milli(resource: &str, milli: i64) -> String {
    if resource == "cpu" {
        if milli % 1000 == 0 {
            (milli / 1000).to_string()
        } else {
            format!("{milli}m")
        }
    } else {
        // bytes reported in Ki, matching kubelet convention
        let bytes = milli / 1000;
        format!("{}Ki", bytes / 1024)
    }
}

fn sum_resource(nodes: &[Node], resource: &str, allocatable: bool) -> i64 {
    nodes
        .iter()
        .filter_map(|node| {
            let status = node.status.as_ref()?;
            let map = if allocatable {
                status.allocatable.as_ref()?
            } else {
                status.capacity.as_ref()?
            };
            parse_milli(&map.get(resource)?.0)
        })
        .sum()
}

/// Aggregate (capacity, allocatable) for cpu and memory across nodes
pub fn aggregate(nodes: &[Node]) -> (BTreeMap<String, Quantity>, BTreeMap<String, Quantity>) {
    let mut capacity = BTreeMap::new();
    let mut allocatable = BTreeMap::new();
    for resource in AGGREGATED_RESOURCES {
        capacity.insert(
            resource.to_string(),
            Quantity(format_milli(resource, sum_resource(nodes, resource, false))),
        );
        allocatable.insert(
            resource.to_string(),
            Quantity(format_milli(resource, sum_resource(nodes, resource, true))),
        );
    }
    (capacity, allocatable)
}
