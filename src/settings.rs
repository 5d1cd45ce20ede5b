//! Session settings and the SQL this layer emits for them.
//!
//! Settings are applied in a single round trip by unpacking a JSON array of
//! `[key, value]` pairs server-side; callers (and the test suite) match
//! against the exact SQL text, so the strings here are part of the contract.

use crate::value::PgValue;

/// Ordered session settings, applied in insertion order.
///
/// Keys are `set_config` names (`role`, `search_path`, `jwt.claims.user_id`,
/// ...). Order matters: later entries win when a key repeats, matching
/// server-side `set_config` semantics.
pub type PgSettings = Vec<(String, String)>;

/// Settings application, transaction-local (`set_config(..., true)`).
///
/// Used by backends that scope settings with a surrounding transaction.
pub const APPLY_SETTINGS_LOCAL_SQL: &str =
    "SELECT set_config(el->>0, el->>1, true) FROM json_array_elements($1::json) el";

/// Settings application, session-level (`set_config(..., false)`).
///
/// Used by the single-connection backend, which restores previous values on
/// exit instead of relying on transaction scope.
pub const APPLY_SETTINGS_SESSION_SQL: &str =
    "SELECT set_config(el->>0, el->>1, false) FROM json_array_elements($1::json) el";

/// Probe for a setting's current value; returns NULL for unset keys.
pub const CURRENT_SETTING_SQL: &str = "SELECT current_setting($1, true) as value";

/// The settings-application SQL for the given scope.
#[inline]
pub fn apply_settings_sql(local: bool) -> &'static str {
    if local {
        APPLY_SETTINGS_LOCAL_SQL
    } else {
        APPLY_SETTINGS_SESSION_SQL
    }
}

/// Encode settings as the JSON parameter for the application SQL: a JSON
/// array of two-element `[key, value]` arrays.
pub fn settings_parameter(settings: &PgSettings) -> PgValue {
    let pairs: Vec<serde_json::Value> = settings
        .iter()
        .map(|(k, v)| serde_json::json!([k, v]))
        .collect();
    PgValue::Json(serde_json::Value::Array(pairs))
}

/// Quote an identifier for direct inclusion in SQL, doubling embedded
/// double quotes. Used for `LISTEN`/`UNLISTEN` channels and `RESET` keys.
pub fn escape_identifier(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('"');
    for ch in name.chars() {
        if ch == '"' {
            out.push('"');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

/// The `RESET` statement for a settings key.
pub fn reset_sql(key: &str) -> String {
    format!("RESET {}", escape_identifier(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_settings_sql_is_bit_exact() {
        assert_eq!(
            apply_settings_sql(true),
            "SELECT set_config(el->>0, el->>1, true) FROM json_array_elements($1::json) el"
        );
        assert_eq!(
            apply_settings_sql(false),
            "SELECT set_config(el->>0, el->>1, false) FROM json_array_elements($1::json) el"
        );
        assert_eq!(
            CURRENT_SETTING_SQL,
            "SELECT current_setting($1, true) as value"
        );
    }

    #[test]
    fn test_settings_parameter_shape() {
        let settings: PgSettings = vec![
            ("timezone".to_string(), "UTC".to_string()),
            ("role".to_string(), "viewer".to_string()),
        ];
        let param = settings_parameter(&settings);
        let PgValue::Json(json) = param else {
            panic!("expected JSON parameter");
        };
        assert_eq!(json, serde_json::json!([["timezone", "UTC"], ["role", "viewer"]]));
    }

    #[test]
    fn test_escape_identifier_doubles_quotes() {
        assert_eq!(escape_identifier("chat"), "\"chat\"");
        assert_eq!(escape_identifier("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(reset_sql("jwt.claims.id"), "RESET \"jwt.claims.id\"");
    }
}
