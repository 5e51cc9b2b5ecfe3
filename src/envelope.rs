use serde_json::json;

/// Success line printed on stdout.
pub fn ok(result: serde_json::Value) -> serde_json::Value {
    json!({
        "ok": true,
        "result": result
    })
}

pub fn err(
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "ok": false,
        "error": error,
    })
}

pub fn is_ok(envelope: &serde_json::Value) -> bool {
    envelope.get("ok").and_then(|v| v.as_bool()) == Some(true)
}
