//! Wire format of service requests and replies.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Published on `thing/product/{D}/services`.
///
/// `bid` must be present; the gateway accepts it equal to `tid`.
#[derive(Debug, Serialize)]
pub struct RequestEnvelope<'a> {
    pub tid: &'a str,
    pub bid: &'a str,
    pub timestamp: u64,
    pub method: &'a str,
    pub data: &'a Value,
}

/// Received on `thing/product/{D}/services_reply`.
#[derive(Debug, Deserialize)]
pub struct ReplyEnvelope {
    pub tid: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub data: Option<ReplyData>,
    #[serde(default)]
    pub info: Option<ReplyInfo>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReplyData {
    #[serde(default)]
    pub result: Option<i64>,
    #[serde(default)]
    pub output: Value,
}

/// Error block some gateways send instead of a nonzero `data.result`.
#[derive(Debug, Deserialize)]
pub struct ReplyInfo {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
}

/// What a reply means for the caller.
#[derive(Debug, PartialEq)]
pub enum Verdict {
    Accepted(Value),
    Rejected { code: i64, message: Option<String> },
    /// The reply matched a call but its body could not be interpreted.
    Malformed(String),
}

/// The `tid` of a reply, if it has a usable one.
pub fn reply_tid(reply: &Value) -> Option<&str> {
    reply.get("tid").and_then(Value::as_str)
}

impl Verdict {
    /// Interpret a reply body whose `tid` already matched a pending call.
    pub fn of(reply: Value) -> Self {
        match serde_json::from_value::<ReplyEnvelope>(reply) {
            Ok(envelope) => envelope.verdict(),
            Err(e) => Verdict::Malformed(e.to_string()),
        }
    }
}

impl ReplyEnvelope {
    pub fn verdict(self) -> Verdict {
        if let Some(info) = self.info {
            match info.code {
                Some(0) => {}
                Some(code) => {
                    return Verdict::Rejected {
                        code,
                        message: info.message,
                    };
                }
                None => {
                    return Verdict::Malformed(format!(
                        "info block without code{}",
                        info.message.map(|m| format!(": {m}")).unwrap_or_default()
                    ));
                }
            }
        }

        let data = self.data.unwrap_or_default();
        match data.result {
            Some(code) if code != 0 => Verdict::Rejected {
                code,
                message: data
                    .output
                    .get("msg")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            _ => Verdict::Accepted(data.output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> ReplyEnvelope {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_request_shape() {
        let data = json!({ "user_id": "pilot" });
        let envelope = RequestEnvelope {
            tid: "abc",
            bid: "abc",
            timestamp: 1_700_000_000_000,
            method: "cloud_control_auth_request",
            data: &data,
        };

        assert_eq!(
            serde_json::to_value(&envelope).unwrap(),
            json!({
                "tid": "abc",
                "bid": "abc",
                "timestamp": 1_700_000_000_000u64,
                "method": "cloud_control_auth_request",
                "data": { "user_id": "pilot" }
            })
        );
    }

    #[test]
    fn test_zero_result_accepts_output() {
        let reply = parse(json!({
            "tid": "t", "method": "drc_mode_enter",
            "data": { "result": 0, "output": { "ok": true } }
        }));
        assert_eq!(reply.verdict(), Verdict::Accepted(json!({ "ok": true })));
    }

    #[test]
    fn test_missing_result_and_output() {
        let reply = parse(json!({ "tid": "t", "data": {} }));
        assert_eq!(reply.verdict(), Verdict::Accepted(Value::Null));

        let reply = parse(json!({ "tid": "t" }));
        assert_eq!(reply.verdict(), Verdict::Accepted(Value::Null));
    }

    #[test]
    fn test_nonzero_result_rejects_with_message() {
        let reply = parse(json!({
            "tid": "t",
            "data": { "result": 514_301, "output": { "msg": "no authority" } }
        }));
        assert_eq!(
            reply.verdict(),
            Verdict::Rejected {
                code: 514_301,
                message: Some("no authority".to_string())
            }
        );
    }

    #[test]
    fn test_info_code_takes_precedence() {
        let reply = parse(json!({
            "tid": "t",
            "info": { "code": 7, "message": "busy" },
            "data": { "result": 0 }
        }));
        assert_eq!(
            reply.verdict(),
            Verdict::Rejected {
                code: 7,
                message: Some("busy".to_string())
            }
        );

        let reply = parse(json!({ "tid": "t", "info": { "code": 0 }, "data": { "result": 0 } }));
        assert_eq!(reply.verdict(), Verdict::Accepted(Value::Null));
    }

    #[test]
    fn test_info_without_code_is_malformed() {
        let reply = parse(json!({ "tid": "t", "info": { "message": "busy" }, "data": {} }));
        assert_eq!(
            reply.verdict(),
            Verdict::Malformed("info block without code: busy".to_string())
        );
    }

    #[test]
    fn test_null_data_reads_as_empty() {
        let reply = parse(json!({ "tid": "t", "data": null }));
        assert_eq!(reply.verdict(), Verdict::Accepted(Value::Null));
    }

    #[test]
    fn test_mistyped_fields_are_malformed() {
        let verdict = Verdict::of(json!({ "tid": "t", "data": { "result": "0" } }));
        assert!(matches!(verdict, Verdict::Malformed(_)));

        let verdict = Verdict::of(json!({ "tid": "t", "info": { "code": "7" } }));
        assert!(matches!(verdict, Verdict::Malformed(_)));
    }

    #[test]
    fn test_reply_tid() {
        assert_eq!(reply_tid(&json!({ "tid": "abc", "data": null })), Some("abc"));
        assert_eq!(reply_tid(&json!({ "tid": 5 })), None);
        assert_eq!(reply_tid(&json!({ "no_tid": true })), None);
    }
}
