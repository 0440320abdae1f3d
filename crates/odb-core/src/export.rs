//! Structured export of subtrees, JSON import and snapshot files.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value as Json};
use tracing::{info, warn};

use crate::error::{OdbError, Result};
use crate::schema::{self, FieldDesc};
use crate::tree::{join_path, KeyTree};
use crate::types::{KeyRef, TypeId, MAX_LINK_DEPTH};
use crate::value::Value;

/// Nested form of a subtree: directories become ordered name/node lists,
/// value keys their typed value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Dir(Vec<(String, Node)>),
    Value(Value),
}

impl Node {
    /// Child of a directory node by case-insensitive name
    pub fn get(&self, name: &str) -> Option<&Node> {
        match self {
            Node::Dir(entries) => entries
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, node)| node),
            Node::Value(_) => None,
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Node::Value(v) => Some(v),
            Node::Dir(_) => None,
        }
    }

    /// JSON form: objects for directories, scalars for single-element keys,
    /// arrays otherwise
    pub fn to_json(&self) -> Json {
        match self {
            Node::Dir(entries) => {
                let mut map = Map::new();
                for (name, node) in entries {
                    map.insert(name.clone(), node.to_json());
                }
                Json::Object(map)
            }
            Node::Value(v) => value_to_json(v),
        }
    }

    /// Build a node from JSON, inferring types
    pub fn from_json(json: &Json) -> Result<Node> {
        match json {
            Json::Object(map) => {
                let mut entries = Vec::with_capacity(map.len());
                for (name, child) in map {
                    if child.is_null() {
                        continue;
                    }
                    entries.push((name.clone(), Node::from_json(child)?));
                }
                Ok(Node::Dir(entries))
            }
            other => Ok(Node::Value(infer_value(other)?)),
        }
    }
}

fn item_json(v: &Value, i: usize) -> Json {
    match v {
        Value::Bool(b) => Json::Bool(b[i]),
        Value::Str(s) => Json::String(s[i].clone()),
        Value::Float(f) => Number::from_f64(f[i] as f64).map(Json::Number).unwrap_or(Json::Null),
        Value::Double(f) => Number::from_f64(f[i]).map(Json::Number).unwrap_or(Json::Null),
        Value::UInt64(u) => Json::Number(u[i].into()),
        other => other
            .as_i64(i)
            .map(|n| Json::Number(n.into()))
            .unwrap_or(Json::Null),
    }
}

/// JSON form of a value
pub fn value_to_json(v: &Value) -> Json {
    if v.len() == 1 && !matches!(v, Value::Blob(_)) {
        return item_json(v, 0);
    }
    Json::Array((0..v.len()).map(|i| item_json(v, i)).collect())
}

/// Infer a typed value from JSON: integers become INT32 (INT64 / UINT64 when
/// they do not fit), any float makes a DOUBLE, strings STRING, booleans BOOL.
/// Arrays must be homogeneous.
pub fn infer_value(json: &Json) -> Result<Value> {
    let items: Vec<&Json> = match json {
        Json::Array(items) => items.iter().collect(),
        Json::Object(_) => {
            return Err(OdbError::TypeMismatch {
                expected: TypeId::Double,
                actual: TypeId::Key,
            })
        }
        scalar => vec![scalar],
    };
    let mismatch = |actual: TypeId| OdbError::TypeMismatch {
        expected: TypeId::Double,
        actual,
    };

    if items.iter().all(|j| j.is_string()) && !items.is_empty() {
        return Ok(Value::Str(
            items.iter().filter_map(|j| j.as_str().map(String::from)).collect(),
        ));
    }
    if items.iter().all(|j| j.is_boolean()) && !items.is_empty() {
        return Ok(Value::Bool(items.iter().filter_map(|j| j.as_bool()).collect()));
    }
    if !items.iter().all(|j| j.is_number()) {
        let odd = items.iter().find(|j| !j.is_number()).map(|j| match j {
            Json::String(_) => TypeId::String,
            Json::Bool(_) => TypeId::Bool,
            _ => TypeId::Key,
        });
        return Err(mismatch(odd.unwrap_or(TypeId::Key)));
    }

    if items.iter().all(|j| j.is_i64()) {
        let ints: Vec<i64> = items.iter().filter_map(|j| j.as_i64()).collect();
        if ints.iter().all(|n| i32::try_from(*n).is_ok()) {
            return Ok(Value::Int32(ints.into_iter().map(|n| n as i32).collect()));
        }
        return Ok(Value::Int64(ints));
    }
    if items.iter().all(|j| j.is_u64()) {
        return Ok(Value::UInt64(items.iter().filter_map(|j| j.as_u64()).collect()));
    }
    Ok(Value::Double(items.iter().filter_map(|j| j.as_f64()).collect()))
}

/// Export the subtree at `key`. Links are followed up to the hop limit;
/// hidden keys are skipped.
pub fn export(tree: &KeyTree, key: KeyRef) -> Result<Node> {
    export_at(tree, key, 0)
}

fn export_at(tree: &KeyTree, key: KeyRef, link_depth: usize) -> Result<Node> {
    let info = tree.key_info(key)?;
    match info.type_id {
        TypeId::Key => {
            let mut entries = Vec::new();
            for child in tree.enumerate(key)? {
                let child_info = tree.key_info(child)?;
                if child_info.type_id == TypeId::Link {
                    let target = tree.read_link(child)?;
                    if link_depth >= MAX_LINK_DEPTH {
                        warn!(link = %child_info.name, target = %target, "Link nesting too deep, skipped in export");
                        continue;
                    }
                    match tree.find(&target) {
                        Ok(resolved) => entries.push((
                            child_info.name,
                            export_at(tree, resolved, link_depth + 1)?,
                        )),
                        Err(_) => {
                            warn!(link = %child_info.name, target = %target, "Dangling link skipped in export")
                        }
                    }
                    continue;
                }
                entries.push((child_info.name, export_at(tree, child, link_depth)?));
            }
            Ok(Node::Dir(entries))
        }
        TypeId::Link => {
            let target = tree.find(&tree.read_link(key)?)?;
            export_at(tree, target, link_depth + 1)
        }
        _ => Ok(Node::Value(tree.get(key)?)),
    }
}

/// Import JSON at `path`.
///
/// Existing value keys keep their type and take the converted value; missing
/// keys (and missing parents) are created with inferred types.
pub fn import_json(tree: &mut KeyTree, path: &str, json: &Json) -> Result<()> {
    match tree.find(path) {
        Ok(key) => import_into(tree, key, path, json),
        Err(OdbError::NotFound { .. }) => {
            let (parent, name) = crate::tree::split_parent(path)?;
            let parent = tree.ensure_dir(parent)?;
            create_from_json(tree, parent, name, json)
        }
        Err(e) => Err(e),
    }
}

fn import_into(tree: &mut KeyTree, key: KeyRef, path: &str, json: &Json) -> Result<()> {
    let info = tree.key_info(key)?;
    match (info.type_id, json) {
        (TypeId::Key, Json::Object(map)) => {
            for (name, child_json) in map {
                if child_json.is_null() {
                    continue;
                }
                let child_path = join_path(path, name);
                match tree.find_child(key, name)? {
                    Some(_) => {
                        let child = tree.find(&child_path)?;
                        import_into(tree, child, &child_path, child_json)?;
                    }
                    None => create_from_json(tree, key, name, child_json)?,
                }
            }
            Ok(())
        }
        (TypeId::Key, _) => Err(OdbError::TypeMismatch {
            expected: TypeId::Key,
            actual: infer_value(json)?.type_id(),
        }),
        (ty, Json::Object(_)) => Err(OdbError::TypeMismatch {
            expected: ty,
            actual: TypeId::Key,
        }),
        (ty, _) => {
            let value = infer_value(json)?.convert(ty)?;
            tree.set(key, &value)
        }
    }
}

fn create_from_json(tree: &mut KeyTree, parent: KeyRef, name: &str, json: &Json) -> Result<()> {
    match json {
        Json::Object(map) => {
            let dir = tree.create(parent, name, TypeId::Key, 0, 0)?;
            for (child_name, child_json) in map {
                if !child_json.is_null() {
                    create_from_json(tree, dir, child_name, child_json)?;
                }
            }
            Ok(())
        }
        Json::Null => Ok(()),
        other => {
            let value = infer_value(other)?;
            tree.create_with_value(parent, name, &value, None)?;
            Ok(())
        }
    }
}

/// Overwrite (or create) every field of `fields` under `dir`; keys not
/// named are left alone
pub fn merge_fields(tree: &mut KeyTree, dir: KeyRef, fields: &[FieldDesc]) -> Result<()> {
    let base = tree.path_of(dir)?;
    for f in fields {
        let path = join_path(&base, &f.name);
        if f.ty == TypeId::Key {
            tree.ensure_dir(&path)?;
            continue;
        }
        let (parent_path, name) = crate::tree::split_parent(&path)?;
        let parent = tree.ensure_dir(parent_path)?;
        match tree.find_child(parent, name)? {
            None if f.ty == TypeId::Link => {
                let target = f.default.as_str(0).unwrap_or_default().to_string();
                tree.create_link(parent, name, &target)?;
            }
            None => {
                tree.create_with_value(parent, name, &f.default, Some(f.item_size))?;
            }
            Some(key) => {
                let info = tree.key_info(key)?;
                if f.ty == TypeId::Link || info.type_id == TypeId::Link {
                    continue;
                }
                if info.type_id == f.ty {
                    tree.set(key, &f.default)?;
                    if f.ty == TypeId::String && info.item_size < f.item_size {
                        tree.set_item_size(key, f.item_size)?;
                    }
                } else {
                    tree.replace_with_value(key, &f.default, Some(f.item_size))?;
                }
            }
        }
    }
    Ok(())
}

/// Snapshot file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotFormat {
    Json,
    /// Schema text with values
    Odb,
}

impl SnapshotFormat {
    /// Pick a format from a file name (`.json` or anything else)
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => SnapshotFormat::Json,
            _ => SnapshotFormat::Odb,
        }
    }
}

/// Render the subtree at `key` in `format`
pub fn dump(tree: &KeyTree, key: KeyRef, format: SnapshotFormat) -> Result<String> {
    match format {
        SnapshotFormat::Json => {
            let node = export(tree, key)?;
            serde_json::to_string_pretty(&node.to_json())
                .map_err(|e| OdbError::Protocol(format!("JSON encode failed: {e}")))
        }
        SnapshotFormat::Odb => Ok(schema::render(&schema::schema_of(tree, key)?)),
    }
}

/// Write a snapshot of the subtree at `key` to `file`
pub fn save(tree: &KeyTree, key: KeyRef, file: &Path, format: SnapshotFormat) -> Result<()> {
    let text = dump(tree, key, format)?;
    std::fs::write(file, text)?;
    info!(file = %file.display(), ?format, "Saved snapshot");
    Ok(())
}

/// Restore a snapshot file under `path`
pub fn load(tree: &mut KeyTree, file: &Path, path: &str) -> Result<()> {
    let text = std::fs::read_to_string(file)?;
    let format = if text.trim_start().starts_with('{') {
        SnapshotFormat::Json
    } else {
        SnapshotFormat::from_path(file)
    };
    match format {
        SnapshotFormat::Json => {
            let json: Json = serde_json::from_str(&text).map_err(|e| OdbError::Syntax {
                line: e.line(),
                message: e.to_string(),
            })?;
            import_json(tree, path, &json)?;
        }
        SnapshotFormat::Odb => {
            let fields = schema::parse(&text)?;
            let dir = tree.ensure_dir(path)?;
            merge_fields(tree, dir, &fields)?;
        }
    }
    info!(file = %file.display(), path, ?format, "Loaded snapshot");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use serde_json::json;

    fn tree() -> KeyTree {
        KeyTree::new(Arena::anonymous(64 * 1024).unwrap()).unwrap()
    }

    #[test]
    fn test_export_to_json_shapes() {
        let mut t = tree();
        let dir = t.ensure_dir("/rec").unwrap();
        t.create_with_value(dir, "ivalue", &Value::from(1), None).unwrap();
        t.create_with_value(dir, "iarray", &Value::Int32(vec![1, 9]), None).unwrap();
        t.create_with_value(dir, "svalue", &Value::from("hello"), Some(20)).unwrap();

        let node = export(&t, dir).unwrap();
        assert_eq!(
            node.to_json(),
            json!({"ivalue": 1, "iarray": [1, 9], "svalue": "hello"})
        );
        assert_eq!(node.get("IVALUE").and_then(Node::as_value), Some(&Value::from(1)));
    }

    #[test]
    fn test_import_keeps_existing_types_and_infers_new() {
        let mut t = tree();
        let dir = t.ensure_dir("/cfg").unwrap();
        let rate = t.create(dir, "rate", TypeId::Float, 1, 0).unwrap();

        import_json(
            &mut t,
            "/cfg",
            &json!({"rate": 2, "name": "x", "list": [1.5, 2], "sub": {"on": true}}),
        )
        .unwrap();

        assert_eq!(t.get(rate).unwrap(), Value::Float(vec![2.0]));
        let name = t.find("/cfg/name").unwrap();
        assert_eq!(t.key_info(name).unwrap().type_id, TypeId::String);
        let list = t.find("/cfg/list").unwrap();
        assert_eq!(t.get(list).unwrap(), Value::Double(vec![1.5, 2.0]));
        let on = t.find("/cfg/sub/on").unwrap();
        assert_eq!(t.get(on).unwrap(), Value::from(true));
    }

    #[test]
    fn test_import_rejects_mixed_arrays() {
        assert!(infer_value(&json!([1, "a"])).is_err());
        assert_eq!(infer_value(&json!(3_000_000_000i64)).unwrap(), Value::Int64(vec![3_000_000_000]));
    }

    #[test]
    fn test_links_are_followed_in_export() {
        let mut t = tree();
        let real = t.ensure_dir("/real").unwrap();
        t.create_with_value(real, "v", &Value::from(7), None).unwrap();
        let root = t.root();
        t.create_link(root, "alias", "/real").unwrap();
        let node = export(&t, root).unwrap();
        assert_eq!(node.to_json(), json!({"real": {"v": 7}, "alias": {"v": 7}}));
    }

    #[test]
    fn test_save_and_load_both_formats() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = tree();
        let rec = t.ensure_dir("/rec").unwrap();
        t.create_with_value(rec, "d", &Value::Double(vec![0.1, 0.2]), None).unwrap();
        t.create_with_value(rec, "s", &Value::from("text"), Some(16)).unwrap();

        for file in ["snap.json", "snap.odb"] {
            let file = dir.path().join(file);
            save(&t, rec, &file, SnapshotFormat::from_path(&file)).unwrap();

            let mut other = tree();
            load(&mut other, &file, "/restored").unwrap();
            let d = other.find("/restored/d").unwrap();
            assert_eq!(other.get(d).unwrap(), Value::Double(vec![0.1, 0.2]));
            let s = other.find("/restored/s").unwrap();
            assert_eq!(other.get(s).unwrap(), Value::from("text"));
        }
    }
}
