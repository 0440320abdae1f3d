//! Record schema text format.
//!
//! ```text
//! ; comment
//! ivalue = INT : 1
//! iarray = INT[2] :
//! [0] 1
//! [1] 2
//! svalue = STRING : [20] hello
//! [Sub]
//! flag = BOOL : y
//! [.]
//! ```
//!
//! The parser turns this into an ordered list of [`FieldDesc`]; create,
//! check and bind all consume that list. Field names inside a `[Sub]` section
//! carry the section as a `Sub/` prefix; the section itself is a `KEY` field.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{OdbError, Result};
use crate::tree::{join_path, KeyTree};
use crate::types::{KeyRef, TypeId, DEFAULT_STRING_LENGTH};
use crate::value::Value;

/// One field of a record layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDesc {
    /// Relative path, `sub/name` for fields inside a section
    pub name: String,
    pub ty: TypeId,
    pub count: usize,
    pub item_size: usize,
    pub default: Value,
}

impl FieldDesc {
    /// Directory entry for a `[section]`
    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: TypeId::Key,
            count: 0,
            item_size: 0,
            default: Value::UInt8(Vec::new()),
        }
    }

    /// Value field whose shape follows `default`
    pub fn value(name: impl Into<String>, default: Value) -> Self {
        let ty = default.type_id();
        let item_size = default.natural_item_size();
        let count = default.len();
        Self {
            name: name.into(),
            ty,
            count,
            item_size,
            default,
        }
    }

    /// Bytes this field occupies in the arena encoding
    pub fn byte_len(&self) -> usize {
        self.count * self.item_size
    }

    fn key(&self) -> String {
        self.name.to_ascii_lowercase()
    }
}

/// What differs between a layout and a tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MismatchKind {
    Missing,
    Extra,
    TypeDiffers { expected: TypeId, actual: TypeId },
    CountDiffers { expected: usize, actual: usize },
    ItemSizeDiffers { expected: usize, actual: usize },
}

/// One itemized schema conflict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMismatch {
    pub name: String,
    pub kind: MismatchKind,
}

fn syntax(line: usize, message: impl Into<String>) -> OdbError {
    OdbError::Syntax {
        line,
        message: message.into(),
    }
}

/// Parse one element of type `ty` from its text form
pub fn parse_item(ty: TypeId, text: &str, line: usize) -> Result<Value> {
    let text = text.trim();
    let bad = || syntax(line, format!("invalid {ty} value {text:?}"));
    let int = || -> Result<i128> {
        let (neg, digits) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        let magnitude = match digits
            .strip_prefix("0x")
            .or_else(|| digits.strip_prefix("0X"))
        {
            Some(hex) => i128::from_str_radix(hex, 16),
            None => digits.parse::<i128>(),
        }
        .map_err(|_| bad())?;
        Ok(if neg { -magnitude } else { magnitude })
    };
    let value = match ty {
        TypeId::Bool => match text.to_ascii_lowercase().as_str() {
            "y" | "yes" | "true" | "1" => Value::from(true),
            "n" | "no" | "false" | "0" => Value::from(false),
            _ => return Err(bad()),
        },
        TypeId::Float => Value::from(text.parse::<f32>().map_err(|_| bad())?),
        TypeId::Double => Value::from(text.parse::<f64>().map_err(|_| bad())?),
        TypeId::Char if text.chars().count() == 1 && text.parse::<i128>().is_err() => {
            Value::Char(vec![text.as_bytes()[0]])
        }
        TypeId::String => Value::from(text),
        TypeId::Blob => Value::Blob(decode_hex(text).ok_or_else(bad)?),
        TypeId::Key | TypeId::Link => return Err(bad()),
        _ => {
            let v = int()?;
            let wide = if v < 0 {
                Value::from(v.max(i64::MIN as i128) as i64)
            } else {
                Value::from(v.min(u64::MAX as i128) as u64)
            };
            let converted = wide.convert(ty)?;
            if converted.as_i64(0).map(i128::from) != Some(v) && converted.as_f64(0) != Some(v as f64)
            {
                return Err(syntax(line, format!("{text} out of range for {ty}")));
            }
            converted
        }
    };
    Ok(value)
}

fn decode_hex(text: &str) -> Option<Vec<u8>> {
    let text: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Split `[n] rest` into (n, rest)
fn bracketed(text: &str) -> Option<(usize, &str)> {
    let text = text.trim_start();
    let rest = text.strip_prefix('[')?;
    let close = rest.find(']')?;
    let n = rest[..close].trim().parse().ok()?;
    let after = &rest[close + 1..];
    Some((n, after.strip_prefix(' ').unwrap_or(after)))
}

/// Split `TYPE` / `TYPE[n]`
fn type_spec(text: &str, line: usize) -> Result<(TypeId, Option<usize>)> {
    let text = text.trim();
    let (name, count) = match text.find('[') {
        Some(open) => {
            let close = text
                .rfind(']')
                .ok_or_else(|| syntax(line, format!("unclosed array size in {text:?}")))?;
            let n = text[open + 1..close]
                .trim()
                .parse::<usize>()
                .map_err(|_| syntax(line, format!("bad array size in {text:?}")))?;
            (&text[..open], Some(n))
        }
        None => (text, None),
    };
    let ty = TypeId::from_name(name).ok_or_else(|| syntax(line, format!("unknown type {name:?}")))?;
    Ok((ty, count))
}

/// A field whose array elements are still being read
struct Pending {
    desc: FieldDesc,
    filled: usize,
}

/// Parse schema text into an ordered field list
pub fn parse(text: &str) -> Result<Vec<FieldDesc>> {
    let mut fields: Vec<FieldDesc> = Vec::new();
    let mut seen = HashSet::new();
    let mut section = String::new();
    let mut pending: Option<Pending> = None;

    fn finish(pending: &mut Option<Pending>, fields: &mut Vec<FieldDesc>) {
        if let Some(p) = pending.take() {
            fields.push(p.desc);
        }
    }

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }

        // Array element of the pending field
        if let Some(p) = pending.as_mut() {
            if let Some((n, rest)) = bracketed(line) {
                if p.filled < p.desc.count {
                    let desc = &mut p.desc;
                    if desc.ty == TypeId::String {
                        let item = Value::from(rest.trim_end());
                        desc.item_size = desc.item_size.max(n).max(item.natural_item_size());
                        desc.default.set_item(p.filled, &item)?;
                    } else {
                        if n >= desc.count {
                            return Err(syntax(
                                line_no,
                                format!("index {n} out of range for {}[{}]", desc.name, desc.count),
                            ));
                        }
                        let item = parse_item(desc.ty, rest, line_no)?;
                        desc.default.set_item(n, &item)?;
                    }
                    p.filled += 1;
                    continue;
                }
            }
        }
        finish(&mut pending, &mut fields);

        // Section header
        if line.starts_with('[') && line.ends_with(']') && !line.contains('=') {
            let name = line[1..line.len() - 1].trim().trim_matches('/');
            section = if name == "." || name.is_empty() {
                String::new()
            } else {
                name.to_string()
            };
            let mut prefix = String::new();
            for comp in section.split('/').filter(|c| !c.is_empty()) {
                prefix = if prefix.is_empty() {
                    comp.to_string()
                } else {
                    format!("{prefix}/{comp}")
                };
                if seen.insert(prefix.to_ascii_lowercase()) {
                    fields.push(FieldDesc::directory(prefix.clone()));
                }
            }
            continue;
        }

        // name = TYPE[n] : value
        let (name, rest) = line
            .split_once('=')
            .ok_or_else(|| syntax(line_no, format!("expected `name = TYPE : value`, got {line:?}")))?;
        let (type_part, value_part) = rest
            .split_once(':')
            .ok_or_else(|| syntax(line_no, "missing `:` after type"))?;
        let name = name.trim();
        crate::types::validate_name(name).map_err(|_| syntax(line_no, format!("bad name {name:?}")))?;
        let full = if section.is_empty() {
            name.to_string()
        } else {
            format!("{section}/{name}")
        };
        if !seen.insert(full.to_ascii_lowercase()) {
            return Err(syntax(line_no, format!("duplicate field {full:?}")));
        }

        let (ty, count) = type_spec(type_part, line_no)?;
        let value_part = value_part.trim();
        match (ty, count) {
            (TypeId::Key, _) => return Err(syntax(line_no, "use a [section] for directories")),
            (TypeId::Link, _) => {
                let (size, target) = bracketed(value_part).unwrap_or((0, value_part));
                let target = target.trim();
                fields.push(FieldDesc {
                    name: full,
                    ty,
                    count: 1,
                    item_size: size.max(target.len() + 1),
                    default: Value::from(target),
                });
            }
            (_, Some(n)) => {
                let desc = FieldDesc {
                    name: full,
                    ty,
                    count: n,
                    item_size: match ty {
                        TypeId::String => 0,
                        other => other.fixed_size().unwrap_or(1),
                    },
                    default: Value::zeroed(ty, n)?,
                };
                if !value_part.is_empty() {
                    return Err(syntax(line_no, "array elements go on the following lines"));
                }
                pending = Some(Pending { desc, filled: 0 });
            }
            (TypeId::String, None) => {
                let (size, text) = match bracketed(value_part) {
                    Some((size, text)) => (size, text.trim_end()),
                    None => (DEFAULT_STRING_LENGTH, value_part),
                };
                let default = Value::from(text);
                fields.push(FieldDesc {
                    name: full,
                    ty,
                    count: 1,
                    item_size: size.max(default.natural_item_size()),
                    default,
                });
            }
            (TypeId::Blob, None) => {
                let default = parse_item(ty, value_part, line_no)?;
                fields.push(FieldDesc {
                    name: full,
                    ty,
                    count: default.len(),
                    item_size: 1,
                    default,
                });
            }
            (_, None) => {
                let default = parse_item(ty, value_part, line_no)?;
                fields.push(FieldDesc {
                    name: full,
                    ty,
                    count: 1,
                    item_size: ty.fixed_size().unwrap_or(1),
                    default,
                });
            }
        }
    }
    finish(&mut pending, &mut fields);

    for f in fields.iter_mut() {
        if f.ty == TypeId::String && f.item_size == 0 {
            f.item_size = DEFAULT_STRING_LENGTH.max(f.default.natural_item_size());
        }
    }
    Ok(fields)
}

/// Render a field list back into schema text
pub fn render(fields: &[FieldDesc]) -> String {
    let mut out = String::new();
    let mut section = String::new();
    for f in fields {
        if f.ty == TypeId::Key {
            out.push_str(&format!("[{}]\n", f.name));
            section = f.name.clone();
            continue;
        }
        let (prefix, name) = match f.name.rfind('/') {
            Some(pos) => (&f.name[..pos], &f.name[pos + 1..]),
            None => ("", f.name.as_str()),
        };
        if !prefix.eq_ignore_ascii_case(&section) {
            out.push_str(&format!("[{}]\n", if prefix.is_empty() { "." } else { prefix }));
            section = prefix.to_string();
        }
        match f.ty {
            TypeId::Link => {
                let target = f.default.as_str(0).unwrap_or_default();
                out.push_str(&format!("{name} = LINK : [{}] {target}\n", f.item_size));
            }
            TypeId::Blob => {
                let bytes = f.default.as_bytes().unwrap_or_default();
                out.push_str(&format!("{name} = ARRAY : {}\n", encode_hex(bytes)));
            }
            TypeId::String if f.count == 1 => {
                out.push_str(&format!(
                    "{name} = STRING : [{}] {}\n",
                    f.item_size,
                    f.default.format_item(0)
                ));
            }
            ty if f.count == 1 => {
                out.push_str(&format!("{name} = {ty} : {}\n", f.default.format_item(0)));
            }
            ty => {
                out.push_str(&format!("{name} = {ty}[{}] :\n", f.count));
                for i in 0..f.default.len() {
                    let label = if ty == TypeId::String { f.item_size } else { i };
                    out.push_str(&format!("[{label}] {}\n", f.default.format_item(i)));
                }
            }
        }
    }
    out
}

/// Describe the subtree under `dir` as a field list, current values as defaults
pub fn schema_of(tree: &KeyTree, dir: KeyRef) -> Result<Vec<FieldDesc>> {
    let mut out = Vec::new();
    collect(tree, dir, "", &mut out)?;
    Ok(out)
}

fn collect(tree: &KeyTree, dir: KeyRef, prefix: &str, out: &mut Vec<FieldDesc>) -> Result<()> {
    for child in tree.enumerate(dir)? {
        let info = tree.key_info(child)?;
        let name = if prefix.is_empty() {
            info.name.clone()
        } else {
            format!("{prefix}/{}", info.name)
        };
        match info.type_id {
            TypeId::Key => {
                out.push(FieldDesc::directory(name.clone()));
                collect(tree, child, &name, out)?;
            }
            TypeId::Link => out.push(FieldDesc {
                name,
                ty: TypeId::Link,
                count: 1,
                item_size: info.item_size,
                default: Value::from(tree.read_link(child)?),
            }),
            ty => out.push(FieldDesc {
                name,
                ty,
                count: info.num_values,
                item_size: info.item_size,
                default: tree.get(child)?,
            }),
        }
    }
    Ok(())
}

/// Itemized difference between an expected layout and an actual one
pub fn diff(expected: &[FieldDesc], actual: &[FieldDesc]) -> Vec<FieldMismatch> {
    let actual_by_name: HashMap<String, &FieldDesc> =
        actual.iter().map(|f| (f.key(), f)).collect();
    let expected_names: HashSet<String> = expected.iter().map(FieldDesc::key).collect();

    let mut out = Vec::new();
    for e in expected {
        let Some(a) = actual_by_name.get(&e.key()) else {
            out.push(FieldMismatch {
                name: e.name.clone(),
                kind: MismatchKind::Missing,
            });
            continue;
        };
        let kind = if e.ty != a.ty {
            Some(MismatchKind::TypeDiffers {
                expected: e.ty,
                actual: a.ty,
            })
        } else if e.ty != TypeId::Key && e.ty != TypeId::Link && e.count != a.count {
            Some(MismatchKind::CountDiffers {
                expected: e.count,
                actual: a.count,
            })
        } else if e.ty == TypeId::String && e.item_size != a.item_size {
            Some(MismatchKind::ItemSizeDiffers {
                expected: e.item_size,
                actual: a.item_size,
            })
        } else {
            None
        };
        if let Some(kind) = kind {
            out.push(FieldMismatch {
                name: e.name.clone(),
                kind,
            });
        }
    }
    for a in actual {
        if !expected_names.contains(&a.key()) {
            out.push(FieldMismatch {
                name: a.name.clone(),
                kind: MismatchKind::Extra,
            });
        }
    }
    out
}

/// Make the subtree under `dir` match `fields`.
///
/// Missing keys are created with their defaults, keys of the wrong type are
/// replaced, count and string size changes keep the stored values, keys not
/// in the layout are removed and the order follows the layout. Either all
/// of it happens or, on error, none of it.
pub(crate) fn apply(tree: &mut KeyTree, dir: KeyRef, fields: &[FieldDesc]) -> Result<()> {
    tree.transaction(|t| apply_fields(t, dir, fields))
}

fn apply_fields(tree: &mut KeyTree, dir: KeyRef, fields: &[FieldDesc]) -> Result<()> {
    let base = tree.path_of(dir)?;
    let mut wanted: HashMap<String, Vec<String>> = HashMap::new();
    wanted.entry(String::new()).or_default();

    for f in fields {
        let (prefix, name) = match f.name.rfind('/') {
            Some(pos) => (&f.name[..pos], &f.name[pos + 1..]),
            None => ("", f.name.as_str()),
        };
        let parent_path = if prefix.is_empty() {
            base.clone()
        } else {
            join_path(&base, prefix)
        };
        let parent = tree.ensure_dir(&parent_path)?;
        let existing = tree.find_child(parent, name)?;
        let key = match (existing, f.ty) {
            (None, TypeId::Key) => tree.create(parent, name, TypeId::Key, 0, 0)?,
            (None, TypeId::Link) => {
                let target = f.default.as_str(0).unwrap_or_default().to_string();
                tree.create_link(parent, name, &target)?
            }
            (None, _) => tree.create_with_value(parent, name, &f.default, Some(f.item_size))?,
            (Some(key), ty) => {
                let info = tree.key_info(key)?;
                if info.type_id != ty {
                    debug!(field = %f.name, from = %info.type_id, to = %ty, "Replacing key of wrong type");
                    match ty {
                        TypeId::Key => {
                            tree.delete(key, true)?;
                            tree.create(parent, name, TypeId::Key, 0, 0)?
                        }
                        TypeId::Link => {
                            tree.delete(key, true)?;
                            let target = f.default.as_str(0).unwrap_or_default().to_string();
                            tree.create_link(parent, name, &target)?
                        }
                        _ => tree.replace_with_value(key, &f.default, Some(f.item_size))?,
                    }
                } else {
                    if ty != TypeId::Key && ty != TypeId::Link {
                        if info.num_values != f.count {
                            tree.set_num_values(key, f.count)?;
                        }
                        if ty == TypeId::String && info.item_size != f.item_size {
                            tree.set_item_size(key, f.item_size)?;
                        }
                    }
                    key
                }
            }
        };
        let siblings = wanted.entry(prefix.to_ascii_lowercase()).or_default();
        let position = tree.children(parent)?.iter().position(|k| *k == key);
        if position != Some(siblings.len()) {
            tree.reorder(key, siblings.len())?;
        }
        siblings.push(name.to_ascii_lowercase());
        if f.ty == TypeId::Key {
            wanted.entry(f.name.to_ascii_lowercase()).or_default();
        }
    }

    // Remove keys the layout does not name
    for (prefix, names) in &wanted {
        let path = if prefix.is_empty() {
            base.clone()
        } else {
            join_path(&base, prefix)
        };
        let parent = tree.find(&path)?;
        for child in tree.children(parent)? {
            let name = tree.key_info(child)?.name.to_ascii_lowercase();
            if !names.contains(&name) {
                debug!(path = %path, key = %name, "Removing key not in record layout");
                tree.delete(child, true)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;

    const EXAMPLE: &str = "ivalue=INT:1\niarray=INT[2]:\n[0] 1\n[1] 2\nsvalue=STRING:[20] hello\n";

    #[test]
    fn test_parse_example_record() {
        let fields = parse(EXAMPLE).unwrap();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[0], FieldDesc::value("ivalue", Value::from(1)));
        assert_eq!(fields[1].count, 2);
        assert_eq!(fields[1].default, Value::Int32(vec![1, 2]));
        assert_eq!(fields[2].item_size, 20);
        assert_eq!(fields[2].default, Value::from("hello"));
    }

    #[test]
    fn test_parse_sections_comments_and_literals() {
        let text = "\
; run settings
Run number = DWORD : 0x10
[Trigger]
enabled = BOOL : y
names = STRING[2] :
[16] alpha
[16] beta
[.]
ratio = FLOAT : 0.5
";
        let fields = parse(text).unwrap();
        let names: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            ["Run number", "Trigger", "Trigger/enabled", "Trigger/names", "ratio"]
        );
        assert_eq!(fields[0].default, Value::UInt32(vec![16]));
        assert_eq!(fields[2].default, Value::Bool(vec![true]));
        assert_eq!(fields[3].item_size, 16);
        assert_eq!(
            fields[3].default,
            Value::Str(vec!["alpha".into(), "beta".into()])
        );
    }

    #[test]
    fn test_parse_errors_carry_line_numbers() {
        match parse("a = INT : 1\nb = QUAD : 2\n") {
            Err(OdbError::Syntax { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            parse("x = BYTE : 300"),
            Err(OdbError::Syntax { line: 1, .. })
        ));
        assert!(matches!(
            parse("a = INT[2] :\n[5] 1\n"),
            Err(OdbError::Syntax { line: 2, .. })
        ));
    }

    #[test]
    fn test_render_reparses_to_same_fields() {
        let text = "a = DOUBLE[3] :\n[0] 0.1\n[1] -2.5\n[2] 1e300\n[Sub]\ns = STRING : [8] xy\nb = ARRAY : 00ff10\n";
        let fields = parse(text).unwrap();
        let again = parse(&render(&fields)).unwrap();
        assert_eq!(fields, again);
    }

    #[test]
    fn test_diff_reports_count_change_only() {
        let mut tree = KeyTree::new(Arena::anonymous(16 * 1024).unwrap()).unwrap();
        let root = tree.root();
        let dir = tree.create(root, "rec", TypeId::Key, 0, 0).unwrap();
        tree.create(dir, "ivalue", TypeId::Int32, 3, 0).unwrap();

        let expected = parse("ivalue=INT:1").unwrap();
        let actual = schema_of(&tree, dir).unwrap();
        assert_eq!(
            diff(&expected, &actual),
            vec![FieldMismatch {
                name: "ivalue".into(),
                kind: MismatchKind::CountDiffers {
                    expected: 1,
                    actual: 3
                },
            }]
        );
    }

    #[test]
    fn test_apply_keeps_values_and_removes_extras() {
        let mut tree = KeyTree::new(Arena::anonymous(32 * 1024).unwrap()).unwrap();
        let root = tree.root();
        let dir = tree.create(root, "rec", TypeId::Key, 0, 0).unwrap();
        let keep = tree.create(dir, "ivalue", TypeId::Int32, 1, 0).unwrap();
        tree.set(keep, &Value::from(42)).unwrap();
        let extra = tree.create(dir, "old", TypeId::Double, 1, 0).unwrap();
        tree.create(dir, "svalue", TypeId::Int32, 1, 0).unwrap();

        apply(&mut tree, dir, &parse(EXAMPLE).unwrap()).unwrap();

        let ivalue = tree.find("/rec/ivalue").unwrap();
        assert_eq!(tree.get(ivalue).unwrap(), Value::from(42));
        assert!(matches!(tree.get(extra), Err(OdbError::NotFound { .. })));
        let svalue = tree.find("/rec/svalue").unwrap();
        assert_eq!(tree.get(svalue).unwrap(), Value::from("hello"));
        let names: Vec<String> = tree
            .enumerate(dir)
            .unwrap()
            .into_iter()
            .map(|k| tree.key_info(k).unwrap().name)
            .collect();
        assert_eq!(names, ["ivalue", "iarray", "svalue"]);
        assert!(diff(&parse(EXAMPLE).unwrap(), &schema_of(&tree, dir).unwrap()).is_empty());
        tree.check().unwrap();
    }
}
