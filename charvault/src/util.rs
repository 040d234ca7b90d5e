use serde_json::Value;

/// Recursively merge `overlay` into `base`. Objects merge key by key; any
/// other overlay value replaces the base value outright.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Filename-safe key for a character's display name
pub fn character_key(name: &str) -> String {
    slug::slugify(name)
}

/// True when any string inside `value` contains `needle`, ignoring case.
pub fn mentions(value: &Value, needle: &str) -> bool {
    let needle = needle.to_lowercase();
    contains_text(value, &needle)
}

fn contains_text(value: &Value, needle: &str) -> bool {
    match value {
        Value::String(s) => s.to_lowercase().contains(needle),
        Value::Array(items) => items.iter().any(|v| contains_text(v, needle)),
        Value::Object(map) => map.values().any(|v| contains_text(v, needle)),
        _ => false,
    }
}
