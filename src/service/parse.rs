//! 从模型输出中提取 JSON
//!
//! 支持 ```json 代码块、无语言标记的代码块，以及夹在说明文字中的裸 JSON 对象。

use crate::core::{CoreError, Result};

/// 提取并解析第一个 JSON 对象；找不到或解析失败返回 MalformedResponse
pub fn extract_json(output: &str) -> Result<serde_json::Value> {
    let trimmed = output.trim();

    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else if let Some(start) = trimmed.find("```") {
        let rest = &trimmed[start + 3..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end < start {
            return Err(malformed(trimmed));
        }
        &trimmed[start..=end]
    } else {
        return Err(malformed(trimmed));
    };

    let value: serde_json::Value = serde_json::from_str(json_str)
        .map_err(|e| CoreError::MalformedResponse(format!("{}: {}", e, preview(json_str))))?;
    if !value.is_object() {
        return Err(CoreError::MalformedResponse(format!(
            "expected a JSON object, got {}",
            preview(json_str)
        )));
    }
    Ok(value)
}

fn malformed(text: &str) -> CoreError {
    CoreError::MalformedResponse(format!("no JSON object in reply: {}", preview(text)))
}

fn preview(text: &str) -> String {
    let mut s: String = text.chars().take(120).collect();
    if text.chars().count() > 120 {
        s.push_str("...");
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_fenced_json() {
        let out = "Here you go:\n```json\n{\"kind\": \"question\", \"confidence\": 0.8}\n```";
        let v = extract_json(out).unwrap();
        assert_eq!(v["kind"], "question");
    }

    #[test]
    fn test_extract_bare_json_with_prose() {
        let v = extract_json("Sure! {\"answer\": \"42\"} Hope that helps.").unwrap();
        assert_eq!(v["answer"], "42");
    }

    #[test]
    fn test_prose_only_is_malformed() {
        let err = extract_json("I think this is a simple task").unwrap_err();
        assert!(matches!(err, CoreError::MalformedResponse(_)));
    }

    #[test]
    fn test_array_is_malformed() {
        assert!(extract_json("```\n[1, 2]\n```").is_err());
    }
}
