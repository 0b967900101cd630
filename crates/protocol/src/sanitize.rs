use serde_json::Value;

/// Keys that must never reach an HTTP caller, per §7's propagation policy.
const SENSITIVE_KEYS: &[&str] = &["privateKey", "apiKey", "password"];

/// Recursively strip [`SENSITIVE_KEYS`] from a JSON value before it is
/// written to an HTTP response body.
pub fn strip_sensitive(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for key in SENSITIVE_KEYS {
                map.remove(*key);
            }
            for v in map.values_mut() {
                strip_sensitive(v);
            }
        }
        Value::Array(items) => {
            for v in items {
                strip_sensitive(v);
            }
        }
        _ => {}
    }
}
