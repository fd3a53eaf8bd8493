//! Row field projection
//!
//! Extracts resource id, name and address from a raw payload using the
//! JSON paths of a [`RowField`]. Supported syntax is the dotted subset used
//! by collectors: `$.Instance.Id`, `$.Tags[0].Key`, `$.Tags.0.Key`,
//! `$['Name']`.

use super::definition::{Dimension, RowField};
use super::instance::{ResourceBuilder, ResourceInstance};
use crate::error::CollectError;
use serde_json::Value;

/// Read the value at `path`, `None` when any segment is missing
pub fn read_path<'a>(item: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    if path.is_empty() {
        return None;
    }
    let path = path.strip_prefix('$').unwrap_or(path);

    let mut current = item;
    for segment in segments(path) {
        // Handle array index
        current = match segment.parse::<usize>() {
            Ok(idx) if current.is_array() => current.get(idx)?,
            _ => current.get(segment.as_str())?,
        };
    }

    Some(current)
}

fn segments(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut buf = String::new();
    let mut chars = path.chars();

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if !buf.is_empty() {
                    out.push(std::mem::take(&mut buf));
                }
            }
            '[' => {
                if !buf.is_empty() {
                    out.push(std::mem::take(&mut buf));
                }
                let mut inner = String::new();
                for c in chars.by_ref() {
                    if c == ']' {
                        break;
                    }
                    inner.push(c);
                }
                out.push(inner.trim_matches(|c| c == '\'' || c == '"').to_string());
            }
            _ => buf.push(c),
        }
    }
    if !buf.is_empty() {
        out.push(buf);
    }
    out
}

/// Render a projected value as a row string
fn to_row_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

fn read_string(item: &Value, path: &str) -> Option<String> {
    read_path(item, path).and_then(to_row_string)
}

/// Project a raw item into a normalized record
///
/// Global resources without an id or name fall back to the account id.
pub fn project(
    item: Value,
    row_field: &RowField,
    dimension: Dimension,
    cloud_account_id: &str,
    region: &str,
) -> Result<ResourceInstance, CollectError> {
    let mut resource_id = read_string(&item, &row_field.resource_id);
    let mut resource_name = read_string(&item, &row_field.resource_name);
    if dimension == Dimension::Global {
        resource_id.get_or_insert_with(|| cloud_account_id.to_string());
        resource_name.get_or_insert_with(|| cloud_account_id.to_string());
    }
    let address = read_string(&item, &row_field.address);

    ResourceBuilder::new()
        .resource_id(resource_id)
        .resource_name(resource_name)
        .address(address)
        .region_id(region)
        .instance(item)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "Instance": {"InstanceId": "i-1", "Name": "web", "Cpu": 4},
            "Tags": [{"Key": "env", "Value": "prod"}],
            "PublicIp": "1.2.3.4"
        })
    }

    #[test]
    fn test_read_dotted_path() {
        let item = sample();
        assert_eq!(read_path(&item, "$.Instance.InstanceId"), Some(&json!("i-1")));
        assert_eq!(read_path(&item, "Instance.Cpu"), Some(&json!(4)));
        assert_eq!(read_path(&item, "$.Instance.Missing"), None);
        assert_eq!(read_path(&item, ""), None);
    }

    #[test]
    fn test_read_indexed_path() {
        let item = sample();
        assert_eq!(read_path(&item, "$.Tags[0].Key"), Some(&json!("env")));
        assert_eq!(read_path(&item, "$.Tags.0.Value"), Some(&json!("prod")));
        assert_eq!(read_path(&item, "$['PublicIp']"), Some(&json!("1.2.3.4")));
        assert_eq!(read_path(&item, "$.Tags[3].Key"), None);
    }

    #[test]
    fn test_project_regional() {
        let row = RowField::new("$.Instance.InstanceId", "$.Instance.Name", "$.PublicIp");
        let record = project(sample(), &row, Dimension::Regional, "acc", "us-east-1").unwrap();

        assert_eq!(record.resource_id, "i-1");
        assert_eq!(record.resource_name.as_deref(), Some("web"));
        assert_eq!(record.address.as_deref(), Some("1.2.3.4"));
        assert_eq!(record.region_id, "us-east-1");
        assert_eq!(record.instance, sample());
    }

    #[test]
    fn test_project_numeric_id() {
        let row = RowField::new("$.Instance.Cpu", "", "");
        let record = project(sample(), &row, Dimension::Regional, "acc", "r").unwrap();
        assert_eq!(record.resource_id, "4");
        assert!(record.resource_name.is_none());
    }

    #[test]
    fn test_project_global_falls_back_to_account() {
        let row = RowField::new("$.Missing", "$.AlsoMissing", "");
        let record = project(json!({"Policy": "x"}), &row, Dimension::Global, "acc-9", "").unwrap();
        assert_eq!(record.resource_id, "acc-9");
        assert_eq!(record.resource_name.as_deref(), Some("acc-9"));
    }

    #[test]
    fn test_project_regional_without_id_fails() {
        let row = RowField::new("$.Missing", "", "");
        let err = project(json!({"a": 1}), &row, Dimension::Regional, "acc", "r").unwrap_err();
        assert!(matches!(err, CollectError::Transform(_)));
    }

    #[test]
    fn test_project_scalar_item_without_paths_fails() {
        // Items must be objects carrying the row field paths
        let row = RowField::new("$.ResourceId", "", "");
        assert!(project(json!(3), &row, Dimension::Regional, "acc", "r").is_err());
    }
}
