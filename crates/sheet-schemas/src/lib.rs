use anyhow::{anyhow, Result};
use include_dir::{include_dir, Dir};
use jsonschema::{Draft, JSONSchema};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

static SCHEMAS_DIR: Dir = include_dir!("$CARGO_MANIFEST_DIR/../../schemas");

pub const GRADE_VERDICT_SCHEMA: &str = "grade_verdict_v1.json";

pub fn tool_schema_name(tool: &str) -> String {
    format!("tool_{}_v1.json", tool)
}

pub fn schema_names() -> Vec<String> {
    SCHEMAS_DIR
        .files()
        .filter_map(|f| {
            f.path()
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
        })
        .collect()
}

pub fn load_schema(name: &str) -> Result<Value> {
    if let Some(file) = SCHEMAS_DIR.get_file(name) {
        let data = std::str::from_utf8(file.contents())?;
        return Ok(serde_json::from_str(data)?);
    }

    // Dev fallback: allow newly added schema files before this crate is rebuilt.
    let fs_path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../schemas")
        .join(name);
    if fs_path.exists() {
        let data = fs::read_to_string(fs_path)?;
        return Ok(serde_json::from_str(&data)?);
    }

    Err(anyhow!("schema not found: {}", name))
}

pub fn compile_schema(name: &str) -> Result<JSONSchema> {
    let schema = load_schema(name)?;
    let schema = Box::leak(Box::new(schema));
    let compiled = JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(schema)?;
    Ok(compiled)
}

/// Compiles `name` once per process and hands out the shared compiled schema.
pub fn cached_schema(name: &str) -> Result<&'static JSONSchema> {
    static COMPILED: OnceLock<Mutex<HashMap<String, &'static JSONSchema>>> = OnceLock::new();
    let cache = COMPILED.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = cache.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(schema) = guard.get(name) {
        return Ok(*schema);
    }
    let compiled: &'static JSONSchema = Box::leak(Box::new(compile_schema(name)?));
    guard.insert(name.to_string(), compiled);
    Ok(compiled)
}

pub fn validate_against(name: &str, value: &Value) -> Result<()> {
    validate_value(cached_schema(name)?, value)
}

/// Validates `value`, folding every schema violation into one error message.
pub fn validate_value(schema: &JSONSchema, value: &Value) -> Result<()> {
    if let Err(errors) = schema.validate(value) {
        let msgs = errors.map(|e| e.to_string()).collect::<Vec<_>>();
        return Err(anyhow!("{}", msgs.join("; ")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn every_embedded_schema_compiles() {
        let names = schema_names();
        assert!(names.contains(&GRADE_VERDICT_SCHEMA.to_string()));
        for name in names {
            compile_schema(&name).unwrap_or_else(|e| panic!("{}: {}", name, e));
        }
    }

    #[test]
    fn tool_schema_rejects_missing_required_argument() {
        let schema = compile_schema(&tool_schema_name("write_file")).expect("compile");
        assert!(validate_value(&schema, &json!({"path": "a.txt", "content": "x"})).is_ok());
        let err = validate_value(&schema, &json!({"path": "a.txt"})).expect_err("missing content");
        assert!(err.to_string().contains("content"), "{}", err);
    }

    #[test]
    fn cached_schema_is_shared() {
        let a = cached_schema(GRADE_VERDICT_SCHEMA).expect("first");
        let b = cached_schema(GRADE_VERDICT_SCHEMA).expect("second");
        assert!(std::ptr::eq(a, b));
        assert!(validate_against("missing_v1.json", &json!({})).is_err());
    }

    #[test]
    fn verdict_schema_accepts_three_statuses_only() {
        let schema = compile_schema(GRADE_VERDICT_SCHEMA).expect("compile");
        for status in ["pass", "fail", "error"] {
            assert!(validate_value(&schema, &json!({"status": status})).is_ok());
        }
        assert!(validate_value(&schema, &json!({"status": "partial"})).is_err());
        assert!(validate_value(&schema, &json!({"message": "no status"})).is_err());
    }
}
