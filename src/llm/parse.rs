//! Structured-output parsing: pull the first balanced JSON value out of
//! arbitrary model prose and validate it against the decision schema.

use crate::models::{TradeAction, TradeDecision};
use serde_json::Value;

/// Extract the first balanced `{…}` or `[…]` that parses as JSON. Handles
/// plain values, Markdown code fences and values embedded in prose. The
/// bracket scan respects double- and single-quoted strings with backslash
/// escapes.
pub fn extract_json(raw: &str) -> Option<Value> {
    let bytes = raw.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if c == b'{' || c == b'[' {
            if let Some(end) = balanced_end(bytes, i) {
                if let Ok(v) = serde_json::from_str::<Value>(&raw[i..=end]) {
                    return Some(v);
                }
                // Not valid JSON despite balancing (e.g. single quotes);
                // keep scanning past this span.
                i = end + 1;
                continue;
            }
            return None;
        }
        i += 1;
    }
    None
}

/// Index of the byte closing the bracket opened at `start`.
fn balanced_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_quote: Option<u8> = None;
    let mut escaped = false;

    for (offset, &c) in bytes[start..].iter().enumerate() {
        if let Some(quote) = in_quote {
            if escaped {
                escaped = false;
            } else if c == b'\\' {
                escaped = true;
            } else if c == quote {
                in_quote = None;
            }
            continue;
        }
        match c {
            b'"' | b'\'' => in_quote = Some(c),
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

/// Validate one decision object against the strict schema.
pub fn decision_from_value(v: &Value) -> Option<TradeDecision> {
    let obj = v.as_object()?;
    let action = TradeAction::parse(obj.get("action")?.as_str()?)?;
    let size_pct = obj.get("sizePct")?.as_f64()?;
    let confidence = obj.get("confidence")?.as_f64()?;
    let reason = obj.get("reason")?.as_str()?.to_string();

    if !(0.0..=1.0).contains(&size_pct) || !(0.0..=1.0).contains(&confidence) {
        return None;
    }

    Some(TradeDecision {
        action,
        size_pct,
        confidence,
        reason,
    })
}

/// Validate a multi-arena response: exactly `n` decisions in input order.
pub fn decisions_from_value(v: &Value, n: usize) -> Option<Vec<TradeDecision>> {
    let arr = v.as_array()?;
    if arr.len() != n {
        return None;
    }
    arr.iter().map(decision_from_value).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAIN: &str = r#"{"action":"BUY","sizePct":0.15,"confidence":0.8,"reason":"momentum"}"#;

    #[test]
    fn parses_plain_object() {
        let v = extract_json(PLAIN).unwrap();
        let d = decision_from_value(&v).unwrap();
        assert_eq!(d.action, TradeAction::Buy);
        assert_eq!(d.size_pct, 0.15);
    }

    #[test]
    fn parses_fenced_and_prose_wrapped() {
        let fenced = format!("Here you go:\n```json\n{PLAIN}\n```\nGood luck!");
        let v = extract_json(&fenced).unwrap();
        assert!(decision_from_value(&v).is_some());

        let prose = format!("I think (given {{volatility}}) ... {PLAIN} as discussed");
        // The braces inside prose form an unparseable span that is skipped.
        let v = extract_json(&prose).unwrap();
        assert!(decision_from_value(&v).is_some());
    }

    #[test]
    fn respects_quoted_brackets() {
        let tricky = r#"{"action":"HOLD","sizePct":0.0,"confidence":0.5,"reason":"waiting for } breakout"}"#;
        let v = extract_json(tricky).unwrap();
        let d = decision_from_value(&v).unwrap();
        assert!(d.reason.contains('}'));

        let escaped = r#"{"action":"HOLD","sizePct":0,"confidence":0,"reason":"quote \" and ] inside"}"#;
        assert!(extract_json(escaped).is_some());
    }

    #[test]
    fn schema_rejects_out_of_range() {
        let too_big = r#"{"action":"BUY","sizePct":1.5,"confidence":0.8,"reason":"x"}"#;
        let v = extract_json(too_big).unwrap();
        assert!(decision_from_value(&v).is_none());

        let bad_action = r#"{"action":"YOLO","sizePct":0.1,"confidence":0.8,"reason":"x"}"#;
        let v = extract_json(bad_action).unwrap();
        assert!(decision_from_value(&v).is_none());

        let missing = r#"{"action":"BUY","sizePct":0.1,"confidence":0.8}"#;
        let v = extract_json(missing).unwrap();
        assert!(decision_from_value(&v).is_none());
    }

    #[test]
    fn multi_arena_requires_exact_length() {
        let two = format!("[{PLAIN},{PLAIN}]");
        let v = extract_json(&two).unwrap();
        assert_eq!(decisions_from_value(&v, 2).unwrap().len(), 2);
        assert!(decisions_from_value(&v, 3).is_none());
        assert!(decisions_from_value(&v, 1).is_none());
    }

    #[test]
    fn garbage_yields_none() {
        assert!(extract_json("no json here at all").is_none());
        assert!(extract_json("{unclosed").is_none());
    }
}
